//! # Embedded objects and arrays
//! Schema-described values nested inside a record's attribute. Each embedded value gets a logical
//! identity: its position, or the output of the schema's hash function. Whenever the wire value
//! under a slot changes, the slot reconciles: an instance whose (type, identity) is unchanged is
//! kept and updated in place, anything else gets a fresh instance. Retired instances are remembered
//! weakly, so a value that returns to an earlier identity (a rollback, say) gets its earlier
//! instance back as long as somebody still holds it.
//!
//! The cache is the only source of truth. Embedded values keep a snapshot of their wire value that
//! the owning slot refreshes, and writes are turned into a new wire value for the whole attribute
//! and staged on the record.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::{Rc, Weak};

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::reactive::{Compute, NodeKey, Recomputed};
use crate::record::{FieldValue, Mode, Record, upgrade};
use crate::schema::{FieldKind, FieldSchema, IdentityStrategy, identity_string};
use crate::store::StoreInner;
use crate::transforms::hydrate_wire;

type Retired = RefCell<HashMap<(String, String), Weak<EmbeddedObject>>>;

/// Whatever holds an object or array field: a record or another embedded object.
#[derive(Clone)]
pub(crate) enum FieldOwner {
    Record(Weak<Record>),
    Object(Weak<EmbeddedObject>),
}

impl FieldOwner {
    /// Brings the owner's field up to date, reconciling the slot underneath it.
    fn sync(&self, field: &str) -> Result<()> {
        match self {
            FieldOwner::Record(record) => upgrade(record)?.get(field).map(drop),
            FieldOwner::Object(object) => upgrade(object)?.get(field).map(drop),
        }
    }

    fn write(&self, field: &str, wire: Value) -> Result<()> {
        match self {
            FieldOwner::Record(record) => upgrade(record)?.write_embedded(field, wire),
            FieldOwner::Object(object) => upgrade(object)?.write_field_wire(field, wire),
        }
    }
}

/// Where an object or array slot lives.
#[derive(Clone)]
pub(crate) struct Site {
    pub(crate) owner: FieldOwner,
    pub(crate) field: FieldSchema,
    pub(crate) owner_type: String,
    pub(crate) mode: Mode,
}

#[derive(Clone)]
enum Parent {
    Field { owner: FieldOwner, field: String },
    Item(Weak<EmbeddedArray>),
}

impl Parent {
    fn sync(&self) -> Result<()> {
        match self {
            Parent::Field { owner, field } => owner.sync(field),
            Parent::Item(array) => upgrade(array)?.sync(),
        }
    }
}

/// The schema type and identity of one embedded wire value.
fn resolve_identity(
    store: &StoreInner,
    field: &FieldSchema,
    owner_type: &str,
    wire: &Value,
    position: &str,
) -> Result<(String, String)> {
    let schema_type = resolve_type(store, field, owner_type, wire)?;
    let schema = store.resource_schema(&schema_type)?;
    let identity = match &schema.identity {
        IdentityStrategy::Positional => position.to_string(),
        IdentityStrategy::Hash(name) => {
            let hash = store.hash_function(name)?;
            identity_string(name, hash(wire, None))?
        }
    };
    Ok((schema_type, identity))
}

fn resolve_type(
    store: &StoreInner,
    field: &FieldSchema,
    owner_type: &str,
    value: &Value,
) -> Result<String> {
    match (&field.type_resolver, &field.value_type) {
        (Some(resolver), _) => {
            let resolve = store.hash_function(resolver)?;
            identity_string(resolver, resolve(value, field.options.as_ref()))
        }
        (None, Some(schema_type)) => Ok(schema_type.clone()),
        (None, None) => Err(Error::invalid_value(
            &field.name,
            owner_type,
            "embedded field names no schema type",
        )),
    }
}

/// Arrays hold embedded objects when their item type is a registered schema.
fn holds_objects(store: &StoreInner, field: &FieldSchema) -> bool {
    field.type_resolver.is_some()
        || field
            .value_type
            .as_deref()
            .is_some_and(|item_type| store.has_resource(item_type))
}

fn retire(retired: &Retired, object: &Rc<EmbeddedObject>) {
    object.attached.set(false);
    let mut retired = retired.borrow_mut();
    retired.retain(|_, instance| instance.strong_count() > 0);
    retired.insert(
        (object.schema_type.clone(), object.identity.clone()),
        Rc::downgrade(object),
    );
}

fn revive(retired: &Retired, schema_type: &str, identity: &str) -> Option<Rc<EmbeddedObject>> {
    let instance = retired
        .borrow_mut()
        .remove(&(schema_type.to_string(), identity.to_string()))?
        .upgrade()?;
    instance.attached.set(true);
    log::debug!("Revived embedded {schema_type} `{identity}`");
    Some(instance)
}

/// Converts an application value for `field` into its wire form, validating its shape.
pub(crate) fn serialize_field(
    store: &StoreInner,
    owner_type: &str,
    field: &FieldSchema,
    value: &Value,
) -> Result<Value> {
    match field.kind {
        FieldKind::Plain => match store.transform_for(owner_type, field)? {
            Some(transform) => transform.serialize(value, field.options.as_ref()),
            None => Ok(value.clone()),
        },
        FieldKind::Object => serialize_object(store, owner_type, field, value),
        FieldKind::Array => match value {
            Value::Null => Ok(Value::Null),
            Value::Array(items) => items
                .iter()
                .map(|item| serialize_item(store, owner_type, field, item))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            _ => Err(Error::invalid_value(
                &field.name,
                owner_type,
                "expected an array",
            )),
        },
        FieldKind::Derived => Err(Error::ReadOnlyField {
            field: field.name.clone(),
            type_name: owner_type.to_string(),
        }),
        FieldKind::BelongsTo | FieldKind::HasMany => Err(Error::invalid_value(
            &field.name,
            owner_type,
            "relationships are changed through set_belongs_to or their ManyArray",
        )),
    }
}

fn serialize_item(
    store: &StoreInner,
    owner_type: &str,
    field: &FieldSchema,
    item: &Value,
) -> Result<Value> {
    if holds_objects(store, field) {
        return serialize_object(store, owner_type, field, item);
    }
    match store.transform_for(owner_type, field)? {
        Some(transform) => transform.serialize(item, field.options.as_ref()),
        None => Ok(item.clone()),
    }
}

fn serialize_object(
    store: &StoreInner,
    owner_type: &str,
    field: &FieldSchema,
    value: &Value,
) -> Result<Value> {
    let members = match value {
        Value::Null => return Ok(Value::Null),
        Value::Object(members) => members,
        _ => {
            return Err(Error::invalid_value(
                &field.name,
                owner_type,
                "expected an object",
            ));
        }
    };
    let schema_type = resolve_type(store, field, owner_type, value)?;
    let schema = store.resource_schema(&schema_type)?;
    let mut wire = Map::new();
    for (name, member) in members {
        let nested = schema.require(name)?;
        wire.insert(
            nested.key().to_string(),
            serialize_field(store, &schema_type, nested, member)?,
        );
    }
    Ok(Value::Object(wire))
}

/// Reconciliation state of one object field.
#[derive(Default)]
pub(crate) struct ObjectSlot {
    current: RefCell<Option<Rc<EmbeddedObject>>>,
    retired: Retired,
}

impl ObjectSlot {
    pub(crate) fn reconcile(
        &self,
        store: &Rc<StoreInner>,
        site: &Site,
        wire: Option<&Value>,
    ) -> Result<Recomputed<FieldValue>> {
        let wire = match wire {
            None | Some(Value::Null) => {
                let previous = self.current.borrow_mut().take();
                if let Some(previous) = previous {
                    retire(&self.retired, &previous);
                }
                return Ok(Recomputed::new(FieldValue::Object(None)));
            }
            Some(wire) if !wire.is_object() => {
                return Err(Error::invalid_value(
                    &site.field.name,
                    &site.owner_type,
                    "expected an object",
                ));
            }
            Some(wire) => wire,
        };

        let (schema_type, identity) =
            resolve_identity(store, &site.field, &site.owner_type, wire, "@")?;
        let current = self.current.borrow().clone();
        if let Some(current) = current {
            if current.schema_type == schema_type && current.identity == identity {
                current.update(store, wire);
                return Ok(Recomputed::new(FieldValue::Object(Some(current))));
            }
            log::debug!(
                "Embedded `{}` on {} changed identity from `{}` to `{identity}`",
                site.field.name,
                site.owner_type,
                current.identity
            );
            retire(&self.retired, &current);
        }

        let instance = match revive(&self.retired, &schema_type, &identity) {
            Some(instance) => instance,
            None => EmbeddedObject::new(
                store,
                Parent::Field {
                    owner: site.owner.clone(),
                    field: site.field.name.clone(),
                },
                schema_type,
                identity,
                site.mode,
            ),
        };
        instance.update(store, wire);
        *self.current.borrow_mut() = Some(instance.clone());
        Ok(Recomputed::new(FieldValue::Object(Some(instance))))
    }
}

/// Holds the one array instance of an array field.
#[derive(Default)]
pub(crate) struct ArraySlot {
    array: RefCell<Option<Rc<EmbeddedArray>>>,
}

impl ArraySlot {
    pub(crate) fn reconcile(
        &self,
        store: &Rc<StoreInner>,
        site: &Site,
        wire: Option<&Value>,
    ) -> Result<Recomputed<FieldValue>> {
        let items = match wire {
            None | Some(Value::Null) => return Ok(Recomputed::new(FieldValue::Array(None))),
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(Error::invalid_value(
                    &site.field.name,
                    &site.owner_type,
                    "expected an array",
                ));
            }
        };
        let existing = self.array.borrow().clone();
        let array = match existing {
            Some(array) => array,
            None => {
                let array = EmbeddedArray::new(store, site.clone());
                *self.array.borrow_mut() = Some(array.clone());
                array
            }
        };
        let mutated = array.reconcile(store, items)?;
        Ok(Recomputed {
            value: FieldValue::Array(Some(array)),
            mutated,
        })
    }
}

pub struct EmbeddedObject {
    store: Weak<StoreInner>,
    this: Weak<EmbeddedObject>,
    parent: Parent,
    schema_type: String,
    identity: String,
    mode: Mode,
    value: RefCell<Value>,
    value_signal: NodeKey,
    fields: RefCell<HashMap<String, NodeKey>>,
    attached: Cell<bool>,
}

impl fmt::Debug for EmbeddedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddedObject")
            .field("type", &self.schema_type)
            .field("identity", &self.identity)
            .field("value", &self.value.borrow())
            .finish()
    }
}

impl Drop for EmbeddedObject {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store.reactor.dispose(self.value_signal);
            for memo in self.fields.get_mut().values() {
                store.reactor.dispose(*memo);
            }
        }
    }
}

impl EmbeddedObject {
    fn new(
        store: &Rc<StoreInner>,
        parent: Parent,
        schema_type: String,
        identity: String,
        mode: Mode,
    ) -> Rc<Self> {
        let value_signal = store.reactor.signal();
        Rc::new_cyclic(|this| Self {
            store: Rc::downgrade(store),
            this: this.clone(),
            parent,
            schema_type,
            identity,
            mode,
            value: RefCell::new(Value::Null),
            value_signal,
            fields: RefCell::new(HashMap::new()),
            attached: Cell::new(true),
        })
    }

    pub fn schema_type(&self) -> &str {
        &self.schema_type
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// False once a change of identity replaced this instance in its slot.
    pub fn is_attached(&self) -> bool {
        self.attached.get()
    }

    fn store(&self) -> Result<Rc<StoreInner>> {
        upgrade(&self.store)
    }

    fn update(&self, store: &StoreInner, wire: &Value) {
        if *self.value.borrow() != *wire {
            *self.value.borrow_mut() = wire.clone();
            store.reactor.bump(self.value_signal);
        }
    }

    /// The current wire value of one member, tracked.
    fn member(&self, store: &StoreInner, key: &str) -> Result<Option<Value>> {
        self.parent.sync()?;
        store.reactor.track(self.value_signal);
        Ok(self.value.borrow().get(key).cloned())
    }

    pub fn to_json(&self) -> Result<Value> {
        let store = self.store()?;
        self.parent.sync()?;
        store.reactor.track(self.value_signal);
        Ok(self.value.borrow().clone())
    }

    pub fn get(&self, name: &str) -> Result<FieldValue> {
        let store = self.store()?;
        let memo = self.field_memo(&store, name)?;
        store.reactor.read(memo)
    }

    pub fn value(&self, name: &str) -> Result<Value> {
        self.get(name)?.to_json()
    }

    pub fn object(&self, name: &str) -> Result<Option<Rc<EmbeddedObject>>> {
        match self.get(name)? {
            FieldValue::Object(object) => Ok(object),
            _ => Err(Error::invalid_value(
                name,
                &self.schema_type,
                "not an embedded object",
            )),
        }
    }

    pub fn array(&self, name: &str) -> Result<Option<Rc<EmbeddedArray>>> {
        match self.get(name)? {
            FieldValue::Array(array) => Ok(array),
            _ => Err(Error::invalid_value(name, &self.schema_type, "not an array")),
        }
    }

    fn field_memo(&self, store: &Rc<StoreInner>, name: &str) -> Result<NodeKey> {
        if let Some(memo) = self.fields.borrow().get(name) {
            return Ok(*memo);
        }
        let schema = store.resource_schema(&self.schema_type)?;
        let field = schema.require(name)?.clone();
        let compute = self.compute(field)?;
        let memo = store
            .reactor
            .memo((name.to_string(), self.schema_type.clone()), compute);
        self.fields.borrow_mut().insert(name.to_string(), memo);
        Ok(memo)
    }

    fn compute(&self, field: FieldSchema) -> Result<Compute<FieldValue>> {
        let this = self.this.clone();
        let site = Site {
            owner: FieldOwner::Object(this.clone()),
            field,
            owner_type: self.schema_type.clone(),
            mode: self.mode,
        };
        Ok(match site.field.kind {
            FieldKind::Plain => Rc::new(move || {
                let object = upgrade(&this)?;
                let store = object.store()?;
                let field = &site.field;
                let transform = store.transform_for(&object.schema_type, field)?;
                let value = hydrate_wire(
                    transform.as_deref(),
                    object.member(&store, field.key())?,
                    field.options.as_ref(),
                )?;
                Ok(Recomputed::new(FieldValue::Value(Rc::new(value))))
            }),
            FieldKind::Object => {
                let slot = ObjectSlot::default();
                Rc::new(move || {
                    let object = upgrade(&this)?;
                    let store = object.store()?;
                    let wire = object.member(&store, site.field.key())?;
                    slot.reconcile(&store, &site, wire.as_ref())
                })
            }
            FieldKind::Array => {
                let slot = ArraySlot::default();
                Rc::new(move || {
                    let object = upgrade(&this)?;
                    let store = object.store()?;
                    let wire = object.member(&store, site.field.key())?;
                    slot.reconcile(&store, &site, wire.as_ref())
                })
            }
            FieldKind::Derived | FieldKind::BelongsTo | FieldKind::HasMany => {
                return Err(Error::invalid_value(
                    &site.field.name,
                    &self.schema_type,
                    format!("{:?} fields are not supported on embedded objects", site.field.kind),
                ));
            }
        })
    }

    fn ensure_writable(&self, field: &str) -> Result<()> {
        if self.mode != Mode::Editable {
            return Err(Error::NotEditable {
                field: field.to_string(),
                type_name: self.schema_type.clone(),
            });
        }
        self.parent.sync()?;
        if !self.attached.get() {
            return Err(Error::DetachedEmbedded(self.schema_type.clone()));
        }
        Ok(())
    }

    /// Stages a new application value for one member.
    pub fn set(&self, name: &str, value: Value) -> Result<()> {
        let store = self.store()?;
        let schema = store.resource_schema(&self.schema_type)?;
        let field = schema.require(name)?;
        self.ensure_writable(name)?;
        let wire = serialize_field(&store, &self.schema_type, field, &value)?;
        self.write_member(field.key(), wire)
    }

    pub(crate) fn write_field_wire(&self, name: &str, wire: Value) -> Result<()> {
        let store = self.store()?;
        let schema = store.resource_schema(&self.schema_type)?;
        let field = schema.require(name)?;
        self.ensure_writable(name)?;
        self.write_member(field.key(), wire)
    }

    fn write_member(&self, key: &str, wire: Value) -> Result<()> {
        let mut value = self.value.borrow().clone();
        match &mut value {
            Value::Object(members) => {
                members.insert(key.to_string(), wire);
            }
            other => {
                let mut members = Map::new();
                members.insert(key.to_string(), wire);
                *other = Value::Object(members);
            }
        }
        match &self.parent {
            Parent::Field { owner, field } => owner.write(field, value),
            Parent::Item(array) => upgrade(array)?.write_item(self, value),
        }
    }
}

pub struct EmbeddedArray {
    store: Weak<StoreInner>,
    this: Weak<EmbeddedArray>,
    site: Site,
    items: RefCell<Vec<FieldValue>>,
    value: RefCell<Value>,
    retired: Retired,
}

impl fmt::Debug for EmbeddedArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddedArray")
            .field("field", &self.site.field.name)
            .field("value", &self.value.borrow())
            .finish()
    }
}

impl EmbeddedArray {
    fn new(store: &Rc<StoreInner>, site: Site) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            store: Rc::downgrade(store),
            this: this.clone(),
            site,
            items: RefCell::new(Vec::new()),
            value: RefCell::new(Value::Null),
            retired: RefCell::new(HashMap::new()),
        })
    }

    fn store(&self) -> Result<Rc<StoreInner>> {
        upgrade(&self.store)
    }

    pub fn mode(&self) -> Mode {
        self.site.mode
    }

    /// Returns whether anything changed.
    fn reconcile(&self, store: &Rc<StoreInner>, items: &[Value]) -> Result<bool> {
        if let Value::Array(current) = &*self.value.borrow() {
            if current.as_slice() == items {
                return Ok(false);
            }
        }
        let next = if holds_objects(store, &self.site.field) {
            self.reconcile_objects(store, items)?
        } else {
            let transform = store.transform_for(&self.site.owner_type, &self.site.field)?;
            let options = self.site.field.options.as_ref();
            items
                .iter()
                .map(|item| match &transform {
                    Some(transform) => transform.hydrate(item, options),
                    None => Ok(item.clone()),
                })
                .map(|item| item.map(|item| FieldValue::Value(Rc::new(item))))
                .collect::<Result<Vec<_>>>()?
        };
        let previous = std::mem::replace(&mut *self.items.borrow_mut(), next);
        drop(previous);
        *self.value.borrow_mut() = Value::Array(items.to_vec());
        Ok(true)
    }

    fn reconcile_objects(
        &self,
        store: &Rc<StoreInner>,
        items: &[Value],
    ) -> Result<Vec<FieldValue>> {
        let field = &self.site.field;
        let mut resolved = Vec::with_capacity(items.len());
        let mut seen = HashSet::new();
        for (index, wire) in items.iter().enumerate() {
            if !wire.is_object() {
                return Err(Error::invalid_value(
                    &field.name,
                    &self.site.owner_type,
                    format!("item {index} is not an object"),
                ));
            }
            let identity =
                resolve_identity(store, field, &self.site.owner_type, wire, &index.to_string())?;
            if !seen.insert(identity.clone()) {
                return Err(Error::DuplicateEmbeddedIdentity {
                    field: field.name.clone(),
                    identity: identity.1,
                });
            }
            resolved.push(identity);
        }

        let mut current: HashMap<(String, String), Rc<EmbeddedObject>> = self
            .items
            .borrow()
            .iter()
            .filter_map(FieldValue::as_object)
            .map(|object| {
                (
                    (object.schema_type.clone(), object.identity.clone()),
                    object.clone(),
                )
            })
            .collect();

        let mut next = Vec::with_capacity(items.len());
        for ((schema_type, identity), wire) in resolved.into_iter().zip(items) {
            let instance = match current.remove(&(schema_type.clone(), identity.clone())) {
                Some(instance) => instance,
                None => match revive(&self.retired, &schema_type, &identity) {
                    Some(instance) => instance,
                    None => EmbeddedObject::new(
                        store,
                        Parent::Item(self.this.clone()),
                        schema_type,
                        identity,
                        self.site.mode,
                    ),
                },
            };
            instance.update(store, wire);
            next.push(FieldValue::Object(Some(instance)));
        }
        for leftover in current.values() {
            retire(&self.retired, leftover);
        }
        Ok(next)
    }

    pub(crate) fn sync(&self) -> Result<()> {
        self.site.owner.sync(&self.site.field.name)
    }

    pub fn len(&self) -> Result<usize> {
        self.sync()?;
        Ok(self.items.borrow().len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn get(&self, index: usize) -> Result<Option<FieldValue>> {
        self.sync()?;
        Ok(self.items.borrow().get(index).cloned())
    }

    pub fn items(&self) -> Result<Vec<FieldValue>> {
        self.sync()?;
        Ok(self.items.borrow().clone())
    }

    pub fn to_json(&self) -> Result<Value> {
        self.sync()?;
        Ok(self.value.borrow().clone())
    }

    pub fn push(&self, item: Value) -> Result<()> {
        let wire = self.serialize(&item)?;
        self.edit(|items| {
            items.push(wire);
            None
        })
        .map(drop)
    }

    pub fn unshift(&self, item: Value) -> Result<()> {
        let wire = self.serialize(&item)?;
        self.edit(|items| {
            items.insert(0, wire);
            None
        })
        .map(drop)
    }

    /// Removes the last item, returning its wire value.
    pub fn pop(&self) -> Result<Option<Value>> {
        self.edit(Vec::pop)
    }

    pub fn shift(&self) -> Result<Option<Value>> {
        self.edit(|items| (!items.is_empty()).then(|| items.remove(0)))
    }

    pub fn remove(&self, index: usize) -> Result<Option<Value>> {
        self.edit(|items| (index < items.len()).then(|| items.remove(index)))
    }

    fn serialize(&self, item: &Value) -> Result<Value> {
        let store = self.store()?;
        serialize_item(&store, &self.site.owner_type, &self.site.field, item)
    }

    fn edit(&self, change: impl FnOnce(&mut Vec<Value>) -> Option<Value>) -> Result<Option<Value>> {
        if self.site.mode != Mode::Editable {
            return Err(Error::NotEditable {
                field: self.site.field.name.clone(),
                type_name: self.site.owner_type.clone(),
            });
        }
        self.sync()?;
        let mut items = match &*self.value.borrow() {
            Value::Array(items) => items.clone(),
            _ => Vec::new(),
        };
        let removed = change(&mut items);
        self.site
            .owner
            .write(&self.site.field.name, Value::Array(items))?;
        Ok(removed)
    }

    fn write_item(&self, child: &EmbeddedObject, wire: Value) -> Result<()> {
        let index = self
            .items
            .borrow()
            .iter()
            .position(|item| {
                item.as_object()
                    .is_some_and(|object| std::ptr::eq(object.as_ref(), child))
            })
            .ok_or_else(|| Error::DetachedEmbedded(child.schema_type.clone()))?;
        self.edit(|items| {
            if let Some(slot) = items.get_mut(index) {
                *slot = wire;
            }
            None
        })
        .map(drop)
    }
}
