//! # Records
//! A [`Record`] is a projection of one identity. There is at most one record per (identity,
//! [`Mode`]); both modes read the local layer over the remote one, only editable records write.
//!
//! Every field is backed by a memo in the store's reactive graph, created the first time the field
//! is read. Reading a field twice without an intervening change returns the same value object.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use serde_json::Value;

use crate::embedded::{ArraySlot, EmbeddedArray, EmbeddedObject, FieldOwner, ObjectSlot, Site};
use crate::error::{Error, Result};
use crate::graph::Layer;
use crate::identity::{ResourceIdentifier, ResourceKey};
use crate::many_array::ManyArray;
use crate::reactive::{Compute, MemoValue, NodeKey, Recomputed};
use crate::schema::{FieldKind, FieldSchema, ResourceSchema};
use crate::store::{CellKey, StoreInner};
use crate::transforms::hydrate_wire;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Mode {
    Immutable,
    Editable,
}

/// The value of one field, by field kind.
#[derive(Clone, Debug)]
pub enum FieldValue {
    Value(Rc<Value>),
    Object(Option<Rc<EmbeddedObject>>),
    Array(Option<Rc<EmbeddedArray>>),
    BelongsTo(Option<Rc<Record>>),
    HasMany(Rc<ManyArray>),
}

fn same_rc<T>(a: &Option<Rc<T>>, b: &Option<Rc<T>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Rc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

impl MemoValue for FieldValue {
    fn same(&self, other: &Self) -> bool {
        match (self, other) {
            (FieldValue::Value(a), FieldValue::Value(b)) => Rc::ptr_eq(a, b) || a == b,
            (FieldValue::Object(a), FieldValue::Object(b)) => same_rc(a, b),
            (FieldValue::Array(a), FieldValue::Array(b)) => same_rc(a, b),
            (FieldValue::BelongsTo(a), FieldValue::BelongsTo(b)) => same_rc(a, b),
            (FieldValue::HasMany(a), FieldValue::HasMany(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl FieldValue {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            FieldValue::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Rc<EmbeddedObject>> {
        match self {
            FieldValue::Object(object) => object.as_ref(),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Rc<EmbeddedArray>> {
        match self {
            FieldValue::Array(array) => array.as_ref(),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Rc<Record>> {
        match self {
            FieldValue::BelongsTo(record) => record.as_ref(),
            _ => None,
        }
    }

    pub fn as_many(&self) -> Option<&Rc<ManyArray>> {
        match self {
            FieldValue::HasMany(many) => Some(many),
            _ => None,
        }
    }

    /// Plain JSON rendering: embedded values as their wire form, relationships as identifiers.
    pub fn to_json(&self) -> Result<Value> {
        Ok(match self {
            FieldValue::Value(value) => value.as_ref().clone(),
            FieldValue::Object(Some(object)) => object.to_json()?,
            FieldValue::Array(Some(array)) => array.to_json()?,
            FieldValue::Object(None) | FieldValue::Array(None) | FieldValue::BelongsTo(None) => {
                Value::Null
            }
            FieldValue::BelongsTo(Some(record)) => serde_json::to_value(record.identifier()?)?,
            FieldValue::HasMany(many) => {
                let identifiers = many
                    .records()?
                    .iter()
                    .map(|record| record.identifier())
                    .collect::<Result<Vec<_>>>()?;
                serde_json::to_value(identifiers)?
            }
        })
    }
}

/// What a derivation sees of its record. Every read goes through the record, so the derivation's
/// dependencies are captured automatically.
pub struct FieldReader<'a> {
    record: &'a Record,
    field: &'a str,
}

impl FieldReader<'_> {
    pub fn get(&self, name: &str) -> Result<FieldValue> {
        if name == self.field {
            return Err(Error::DerivationCycle {
                field: name.to_string(),
                type_name: self.record.type_name.clone(),
            });
        }
        self.record.get(name)
    }

    pub fn value(&self, name: &str) -> Result<Value> {
        self.get(name)?.to_json()
    }

    pub fn record(&self) -> &Record {
        self.record
    }
}

pub(crate) fn upgrade<T>(weak: &Weak<T>) -> Result<Rc<T>> {
    weak.upgrade().ok_or(Error::UnknownIdentity)
}

pub struct Record {
    store: Weak<StoreInner>,
    this: Weak<Record>,
    key: ResourceKey,
    mode: Mode,
    type_name: String,
    fields: RefCell<HashMap<String, NodeKey>>,
    /// Set once the record is destroyed, to the identifier it had at that moment.
    destroyed: RefCell<Option<ResourceIdentifier>>,
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("key", &self.key)
            .field("type", &self.type_name)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Record {
    pub(crate) fn new(
        store: Weak<StoreInner>,
        key: ResourceKey,
        mode: Mode,
        type_name: String,
    ) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            store,
            this: this.clone(),
            key,
            mode,
            type_name,
            fields: RefCell::new(HashMap::new()),
            destroyed: RefCell::new(None),
        })
    }

    pub fn key(&self) -> ResourceKey {
        self.key
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_editable(&self) -> bool {
        self.mode == Mode::Editable
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.borrow().is_some()
    }

    pub(crate) fn store(&self) -> Result<Rc<StoreInner>> {
        if let Some(identifier) = self.destroyed.borrow().as_ref() {
            return Err(Error::RecordDestroyed(identifier.clone()));
        }
        upgrade(&self.store)
    }

    fn schema(&self, store: &StoreInner) -> Result<Rc<ResourceSchema>> {
        store.resource_schema(&self.type_name)
    }

    pub fn identifier(&self) -> Result<ResourceIdentifier> {
        let store = self.store()?;
        store.track(CellKey::Lifecycle(self.key));
        store.identifier(self.key)
    }

    pub fn id(&self) -> Result<Option<String>> {
        Ok(self.identifier()?.id)
    }

    pub fn get(&self, name: &str) -> Result<FieldValue> {
        let store = self.store()?;
        let memo = self.field_memo(&store, name)?;
        store.reactor.read(memo)
    }

    /// The field rendered as JSON; see [`FieldValue::to_json`].
    pub fn value(&self, name: &str) -> Result<Value> {
        self.get(name)?.to_json()
    }

    pub fn belongs_to(&self, name: &str) -> Result<Option<Rc<Record>>> {
        match self.get(name)? {
            FieldValue::BelongsTo(related) => Ok(related),
            _ => Err(Error::invalid_value(
                name,
                &self.type_name,
                "not a belongsTo relationship",
            )),
        }
    }

    pub fn has_many(&self, name: &str) -> Result<Rc<ManyArray>> {
        match self.get(name)? {
            FieldValue::HasMany(many) => Ok(many),
            _ => Err(Error::invalid_value(
                name,
                &self.type_name,
                "not a hasMany relationship",
            )),
        }
    }

    pub fn object(&self, name: &str) -> Result<Option<Rc<EmbeddedObject>>> {
        match self.get(name)? {
            FieldValue::Object(object) => Ok(object),
            _ => Err(Error::invalid_value(
                name,
                &self.type_name,
                "not an embedded object",
            )),
        }
    }

    pub fn array(&self, name: &str) -> Result<Option<Rc<EmbeddedArray>>> {
        match self.get(name)? {
            FieldValue::Array(array) => Ok(array),
            _ => Err(Error::invalid_value(name, &self.type_name, "not an array")),
        }
    }

    pub fn is_deleted(&self) -> Result<bool> {
        Ok(self.store()?.is_deleted(self.key))
    }

    fn ensure_editable(&self, field: &str) -> Result<()> {
        if self.mode == Mode::Editable {
            Ok(())
        } else {
            Err(Error::NotEditable {
                field: field.to_string(),
                type_name: self.type_name.clone(),
            })
        }
    }

    /// Stages `value` (an application value) in the local layer.
    pub fn set(&self, name: &str, value: Value) -> Result<()> {
        let store = self.store()?;
        let schema = self.schema(&store)?;
        let field = schema.require(name)?;
        self.ensure_editable(name)?;
        let wire = crate::embedded::serialize_field(&store, &self.type_name, field, &value)?;
        store.write_attr(self.key, field.key(), wire);
        Ok(())
    }

    pub fn set_belongs_to(&self, name: &str, related: Option<&Rc<Record>>) -> Result<()> {
        let store = self.store()?;
        let schema = self.schema(&store)?;
        let field = schema.require(name)?;
        self.ensure_editable(name)?;
        if field.kind != FieldKind::BelongsTo {
            return Err(Error::invalid_value(
                name,
                &self.type_name,
                "not a belongsTo relationship",
            ));
        }
        store.replace_membership(
            self.key,
            name,
            related.map(|record| record.key()),
            Layer::Local,
        )
    }

    /// Stages a delete. Visible through both projections until rolled back or saved.
    pub fn delete(&self) -> Result<()> {
        let store = self.store()?;
        self.ensure_editable("delete")?;
        store.stage_delete(self.key);
        Ok(())
    }

    /// Writes an already-serialized embedded value into the field it lives in.
    pub(crate) fn write_embedded(&self, name: &str, wire: Value) -> Result<()> {
        let store = self.store()?;
        let schema = self.schema(&store)?;
        let field = schema.require(name)?;
        self.ensure_editable(name)?;
        store.write_attr(self.key, field.key(), wire);
        Ok(())
    }

    pub(crate) fn field_memo(&self, store: &Rc<StoreInner>, name: &str) -> Result<NodeKey> {
        if let Some(memo) = self.fields.borrow().get(name) {
            return Ok(*memo);
        }
        let schema = self.schema(store)?;
        let field = schema.require(name)?.clone();
        let memo = store.reactor.memo(
            (field.name.clone(), self.type_name.clone()),
            self.compute(store, field),
        );
        self.fields.borrow_mut().insert(name.to_string(), memo);
        Ok(memo)
    }

    fn compute(&self, store: &Rc<StoreInner>, field: FieldSchema) -> Compute<FieldValue> {
        let this = self.this.clone();
        match field.kind {
            FieldKind::Plain => Rc::new(move || {
                let record = upgrade(&this)?;
                let store = record.store()?;
                let transform = store.transform_for(&record.type_name, &field)?;
                let value = hydrate_wire(
                    transform.as_deref(),
                    store.read_attr(record.key, field.key()),
                    field.options.as_ref(),
                )?;
                Ok(Recomputed::new(FieldValue::Value(Rc::new(value))))
            }),
            FieldKind::Derived => Rc::new(move || {
                let record = upgrade(&this)?;
                let store = record.store()?;
                let name = field.value_type.as_deref().unwrap_or_default();
                let derivation =
                    store
                        .derivation(name)
                        .ok_or_else(|| Error::MissingDerivation {
                            field: field.name.clone(),
                            type_name: record.type_name.clone(),
                            derivation: name.to_string(),
                        })?;
                let reader = FieldReader {
                    record: &record,
                    field: &field.name,
                };
                let value = derivation(&reader, field.options.as_ref())?;
                Ok(Recomputed::new(FieldValue::Value(Rc::new(value))))
            }),
            FieldKind::Object => {
                let slot = ObjectSlot::default();
                let site = Site {
                    owner: FieldOwner::Record(this.clone()),
                    field,
                    owner_type: self.type_name.clone(),
                    mode: self.mode,
                };
                Rc::new(move || {
                    let record = upgrade(&this)?;
                    let store = record.store()?;
                    let wire = store.read_attr(record.key, site.field.key());
                    slot.reconcile(&store, &site, wire.as_ref())
                })
            }
            FieldKind::Array => {
                let slot = ArraySlot::default();
                let site = Site {
                    owner: FieldOwner::Record(this.clone()),
                    field,
                    owner_type: self.type_name.clone(),
                    mode: self.mode,
                };
                Rc::new(move || {
                    let record = upgrade(&this)?;
                    let store = record.store()?;
                    let wire = store.read_attr(record.key, site.field.key());
                    slot.reconcile(&store, &site, wire.as_ref())
                })
            }
            FieldKind::BelongsTo => Rc::new(move || {
                let record = upgrade(&this)?;
                let store = record.store()?;
                let related = match store.read_members(record.key, &field.name).front() {
                    Some(member) => Some(store.projection(*member, Mode::Immutable)?),
                    None => None,
                };
                Ok(Recomputed::new(FieldValue::BelongsTo(related)))
            }),
            FieldKind::HasMany => {
                let many = ManyArray::new(
                    Rc::downgrade(store),
                    this.clone(),
                    self.key,
                    self.type_name.clone(),
                    field.name.clone(),
                    self.mode,
                );
                Rc::new(move || {
                    let record = upgrade(&this)?;
                    let store = record.store()?;
                    let members = store.read_members(record.key, &field.name);
                    if members.is_empty()
                        && field.inverse.is_none()
                        && !field.links_mode
                        && !store.has_received_data(record.key, &field.name)
                        && !store.has_related_link(record.key, &field.name)
                    {
                        store.report_missing_linkage(record.key, &field.name);
                    }
                    let mutated = many.replace(members);
                    Ok(Recomputed {
                        value: FieldValue::HasMany(many.clone()),
                        mutated,
                    })
                })
            }
        }
    }

    /// Releases every memo. Later reads fail with [`Error::RecordDestroyed`].
    pub(crate) fn destroy(&self, identifier: ResourceIdentifier) {
        *self.destroyed.borrow_mut() = Some(identifier);
        let memos: Vec<NodeKey> = self.fields.borrow_mut().drain().map(|(_, memo)| memo).collect();
        if let Some(store) = self.store.upgrade() {
            for memo in memos {
                store.reactor.dispose(memo);
            }
        }
    }
}
