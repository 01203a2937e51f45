//! # Store
//! The single entry point. A [`Store`] owns the identity registry, the attribute cache, the
//! relationship graph and the reactive graph, and every write to any of them goes through here so
//! the cells observing the write are always invalidated.
//!
//! Reactive state is kept per *cell*: one attribute, one relationship, or the lifecycle (identifier
//! and deleted flag) of one identity. A cell's signal is created the first time something reads it
//! and bumped whenever a write changes what the cell holds.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::rc::{Rc, Weak};

use futures::FutureExt;
use futures::future::{LocalBoxFuture, Shared};
use serde_json::Value;

use crate::cache::{AttributeChange, Cache};
use crate::checkout::{build_patch, relationship_payload};
use crate::config::StoreConfig;
use crate::diagnostics::{DataQualityReport, DocumentValidator, LinkageValidator, ReportKind};
use crate::document::{Document, Linkage, Patch, ResourceObject, SaveOp};
use crate::embedded::serialize_field;
use crate::error::{Error, Result};
use crate::graph::{
    Edge, Layer, Members, PresenceIndex, RelationshipDefinition, RelationshipGraph,
    RelationshipKind,
};
use crate::identity::{IdentityRegistry, Resolution, ResourceIdentifier, ResourceKey};
use crate::network::Network;
use crate::reactive::{ListenerKey, NodeKey, Reactor};
use crate::record::{FieldReader, FieldValue, Mode, Record};
use crate::schema::{DerivationFn, FieldKind, FieldSchema, HashFn, ResourceSchema, SchemaService};
use crate::transforms::{Transformation, hydrate_wire};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum CellKey {
    /// One attribute, by wire key.
    Attr(ResourceKey, String),
    /// One relationship, by field name.
    Relationship(ResourceKey, String),
    Lifecycle(ResourceKey),
}

/// The local layers of one identity as a save sent them, promoted once the server accepts them.
struct Staged {
    attributes: im::HashMap<String, Value>,
    relationships: Vec<(String, Members)>,
    deleted: bool,
}

impl CellKey {
    fn resource(&self) -> ResourceKey {
        match self {
            CellKey::Attr(key, _) | CellKey::Relationship(key, _) | CellKey::Lifecycle(key) => {
                *key
            }
        }
    }
}

type Hydration = Shared<LocalBoxFuture<'static, Result<Vec<ResourceKey>, String>>>;
type ReportListener = Rc<dyn Fn(&DataQualityReport)>;

pub(crate) struct StoreInner {
    this: Weak<StoreInner>,
    config: StoreConfig,
    schema: RefCell<SchemaService>,
    identities: RefCell<IdentityRegistry>,
    cache: RefCell<Cache>,
    graph: RefCell<RelationshipGraph>,
    pub(crate) reactor: Reactor<FieldValue>,
    cells: RefCell<HashMap<CellKey, NodeKey>>,
    records: RefCell<HashMap<(ResourceKey, Mode), Rc<Record>>>,
    hydrations: RefCell<HashMap<ResourceKey, Hydration>>,
    validators: RefCell<Vec<Rc<dyn DocumentValidator>>>,
    reports: RefCell<Vec<DataQualityReport>>,
    report_listeners: RefCell<Vec<ReportListener>>,
    missing_linkage: RefCell<HashSet<(ResourceKey, String)>>,
}

impl StoreInner {
    fn new(config: StoreConfig) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            this: this.clone(),
            schema: RefCell::new(SchemaService::new(config.builtin_transforms)),
            identities: RefCell::new(IdentityRegistry::new(config.lid_prefix.clone())),
            config,
            cache: RefCell::new(Cache::default()),
            graph: RefCell::new(RelationshipGraph::default()),
            reactor: Reactor::default(),
            cells: RefCell::new(HashMap::new()),
            records: RefCell::new(HashMap::new()),
            hydrations: RefCell::new(HashMap::new()),
            validators: RefCell::new(Vec::new()),
            reports: RefCell::new(Vec::new()),
            report_listeners: RefCell::new(Vec::new()),
            missing_linkage: RefCell::new(HashSet::new()),
        })
    }

    // Cells

    fn signal_for(&self, cell: CellKey) -> NodeKey {
        if let Some(signal) = self.cells.borrow().get(&cell) {
            return *signal;
        }
        let signal = self.reactor.signal();
        self.cells.borrow_mut().insert(cell, signal);
        signal
    }

    /// Records a read of `cell` in the evaluation currently running.
    pub(crate) fn track(&self, cell: CellKey) {
        let signal = self.signal_for(cell);
        self.reactor.track(signal);
    }

    fn bump(&self, cell: &CellKey) {
        let signal = self.cells.borrow().get(cell).copied();
        if let Some(signal) = signal {
            self.reactor.bump(signal);
        }
    }

    fn bump_edges(&self, edges: Vec<Edge>) {
        for (owner, rel) in edges {
            self.bump(&CellKey::Relationship(owner, rel));
        }
    }

    // Schema lookups

    pub(crate) fn resource_schema(&self, type_name: &str) -> Result<Rc<ResourceSchema>> {
        self.schema.borrow().require_resource(type_name)
    }

    pub(crate) fn has_resource(&self, type_name: &str) -> bool {
        self.schema.borrow().has_resource(type_name)
    }

    pub(crate) fn transform_for(
        &self,
        type_name: &str,
        field: &FieldSchema,
    ) -> Result<Option<Rc<dyn Transformation>>> {
        self.schema.borrow().field_transform(type_name, field)
    }

    pub(crate) fn derivation(&self, name: &str) -> Option<DerivationFn> {
        self.schema.borrow().derivation(name)
    }

    pub(crate) fn hash_function(&self, name: &str) -> Result<HashFn> {
        self.schema.borrow().hash_function(name)
    }

    // Identities

    pub(crate) fn identifier(&self, key: ResourceKey) -> Result<ResourceIdentifier> {
        self.identities
            .borrow()
            .identifier(key)
            .cloned()
            .ok_or(Error::UnknownIdentity)
    }

    fn type_of(&self, key: ResourceKey) -> Result<String> {
        Ok(self.identifier(key)?.resource_type)
    }

    fn resolve_identity(
        &self,
        resource_type: &str,
        id: Option<&str>,
        lid: Option<&str>,
    ) -> Result<ResourceKey> {
        let (key, resolution) = self
            .identities
            .borrow_mut()
            .identity_for(resource_type, id, lid)?;
        if resolution == Resolution::Upgraded {
            self.bump(&CellKey::Lifecycle(key));
        }
        Ok(key)
    }

    // Attributes

    pub(crate) fn read_attr(&self, key: ResourceKey, wire_key: &str) -> Option<Value> {
        self.track(CellKey::Attr(key, wire_key.to_string()));
        self.cache.borrow().attr(key, wire_key).cloned()
    }

    pub(crate) fn write_attr(&self, key: ResourceKey, wire_key: &str, wire: Value) {
        let _batch = self.reactor.batch();
        let changed = self.cache.borrow_mut().set_local(key, wire_key, wire);
        if changed {
            log::debug!("Staged `{wire_key}` locally");
            self.bump(&CellKey::Attr(key, wire_key.to_string()));
        }
    }

    pub(crate) fn stage_delete(&self, key: ResourceKey) {
        let _batch = self.reactor.batch();
        if self.cache.borrow_mut().mark_deleted_locally(key) {
            self.bump(&CellKey::Lifecycle(key));
        }
    }

    pub(crate) fn is_deleted(&self, key: ResourceKey) -> bool {
        self.track(CellKey::Lifecycle(key));
        self.cache.borrow().is_deleted(key)
    }

    // Relationships

    pub(crate) fn read_members(&self, key: ResourceKey, rel: &str) -> Members {
        self.track(CellKey::Relationship(key, rel.to_string()));
        self.graph.borrow().members(key, rel)
    }

    pub(crate) fn has_received_data(&self, key: ResourceKey, rel: &str) -> bool {
        self.graph
            .borrow()
            .state(key, rel)
            .is_some_and(|state| state.has_received_data())
    }

    /// Whether the relationship can be loaded on its own through a `related` link.
    pub(crate) fn has_related_link(&self, key: ResourceKey, rel: &str) -> bool {
        self.related_link(key, rel).is_some()
    }

    fn related_link(&self, key: ResourceKey, rel: &str) -> Option<String> {
        self.graph
            .borrow()
            .state(key, rel)
            .and_then(|state| state.links())
            .and_then(|links| links.related.as_ref())
            .map(|link| link.href().to_string())
    }

    /// The definition of `rel` on `key`. Schema fields win; `fallback` covers relationships the
    /// schema does not declare (or types without a schema), which never have an inverse.
    fn definition(
        &self,
        key: ResourceKey,
        rel: &str,
        fallback: Option<RelationshipKind>,
    ) -> Result<RelationshipDefinition> {
        let type_name = self.type_of(key)?;
        let schema = self.schema.borrow().resource(&type_name);
        let field = schema.as_ref().and_then(|schema| schema.get(rel));
        let kind = match field.map(|field| field.kind) {
            Some(FieldKind::BelongsTo) => RelationshipKind::BelongsTo,
            Some(FieldKind::HasMany) => RelationshipKind::HasMany,
            Some(_) => {
                return Err(Error::invalid_value(
                    rel,
                    &type_name,
                    "not a relationship",
                ));
            }
            None => match (fallback, schema.is_some()) {
                (Some(kind), _) => kind,
                (None, true) => {
                    return Err(Error::UnknownField {
                        field: rel.to_string(),
                        type_name,
                    });
                }
                (None, false) => return Err(Error::UnknownSchema(type_name)),
            },
        };
        Ok(RelationshipDefinition {
            inverse: field.and_then(|field| field.inverse.clone()),
            type_name,
            name: rel.to_string(),
            kind,
        })
    }

    pub(crate) fn replace_membership(
        &self,
        key: ResourceKey,
        rel: &str,
        members: impl IntoIterator<Item = ResourceKey>,
        layer: Layer,
    ) -> Result<()> {
        self.replace_membership_with(key, rel, members, layer, None)
    }

    /// Local edits naming a member of the wrong type fail. Remote linkage drops such members and
    /// reports them.
    fn replace_membership_with(
        &self,
        key: ResourceKey,
        rel: &str,
        members: impl IntoIterator<Item = ResourceKey>,
        layer: Layer,
        fallback: Option<RelationshipKind>,
    ) -> Result<()> {
        let mut members: Vec<ResourceKey> = members.into_iter().collect();
        let unexpected = self.unexpected_members(key, rel, &members)?;
        if let Some((member, expected)) = unexpected.first() {
            match layer {
                Layer::Local => {
                    return Err(Error::invalid_value(
                        rel,
                        self.type_of(key)?,
                        format!(
                            "expects `{expected}` resources, not `{}`",
                            self.type_of(*member)?
                        ),
                    ));
                }
                Layer::Remote => {
                    let owner = self.identifier(key)?;
                    for (member, expected) in &unexpected {
                        self.report(ReportKind::UnexpectedMemberType {
                            owner: owner.clone(),
                            relationship: rel.to_string(),
                            member: self.identifier(*member)?,
                            expected: expected.clone(),
                        });
                    }
                    members.retain(|member| unexpected.iter().all(|(m, _)| m != member));
                }
            }
        }

        let _batch = self.reactor.batch();
        let definition = |owner: ResourceKey, name: &str| {
            let fallback = if owner == key && name == rel {
                fallback
            } else {
                None
            };
            self.definition(owner, name, fallback)
        };
        let touched = self
            .graph
            .borrow_mut()
            .replace_membership(key, rel, members, layer, definition)?;
        self.bump_edges(touched);
        Ok(())
    }

    /// Members whose type `rel` does not accept, each with the type it expects. Polymorphic
    /// relationships and relationships the schema does not declare accept any type.
    fn unexpected_members(
        &self,
        key: ResourceKey,
        rel: &str,
        members: &[ResourceKey],
    ) -> Result<Vec<(ResourceKey, String)>> {
        let schema = self.schema.borrow().resource(&self.type_of(key)?);
        let expected = schema
            .as_ref()
            .and_then(|schema| schema.get(rel))
            .filter(|field| field.kind.is_relationship() && !field.polymorphic)
            .and_then(|field| field.value_type.clone());
        let Some(expected) = expected else {
            return Ok(Vec::new());
        };
        let mut unexpected = Vec::new();
        for member in members {
            if self.type_of(*member)? != expected {
                unexpected.push((*member, expected.clone()));
            }
        }
        Ok(unexpected)
    }

    /// Kinds of the relationships `key` already has state for, used as fallbacks when replaying
    /// them during rollback and commit.
    fn known_kinds(&self, key: ResourceKey) -> HashMap<String, RelationshipKind> {
        let graph = self.graph.borrow();
        graph
            .relationships(key)
            .into_iter()
            .filter_map(|rel| {
                let kind = graph.state(key, &rel)?.kind;
                Some((rel, kind))
            })
            .collect()
    }

    pub(crate) fn report_missing_linkage(&self, key: ResourceKey, rel: &str) {
        if !self.missing_linkage.borrow_mut().insert((key, rel.to_string())) {
            return;
        }
        if let Ok(owner) = self.identifier(key) {
            self.report(ReportKind::MissingLinkage {
                owner,
                relationship: rel.to_string(),
            });
        }
    }

    // Projections

    pub(crate) fn projection(&self, key: ResourceKey, mode: Mode) -> Result<Rc<Record>> {
        if let Some(record) = self.records.borrow().get(&(key, mode)) {
            return Ok(record.clone());
        }
        let type_name = self.type_of(key)?;
        self.resource_schema(&type_name)?;
        let record = Record::new(self.this.clone(), key, mode, type_name);
        self.records.borrow_mut().insert((key, mode), record.clone());
        Ok(record)
    }

    // Documents

    fn push(&self, document: &Document) -> Result<Vec<ResourceKey>> {
        let _batch = self.reactor.batch();
        let keys = document
            .resources()
            .map(|resource| {
                self.resolve_identity(
                    &resource.resource_type,
                    resource.id.as_deref(),
                    resource.lid.as_deref(),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        for (key, resource) in keys.iter().zip(document.resources()) {
            self.merge_resource(*key, resource)?;
        }
        log::debug!("Merged {} resources", keys.len());
        self.validate(document);
        Ok(keys.into_iter().take(document.primary().len()).collect())
    }

    fn merge_resource(&self, key: ResourceKey, resource: &ResourceObject) -> Result<()> {
        let changed = self.cache.borrow_mut().merge_attributes(
            key,
            &resource.attributes,
            resource.meta.as_ref(),
        );
        for name in changed {
            self.bump(&CellKey::Attr(key, name));
        }

        let schema = self.schema.borrow().resource(&resource.resource_type);
        for (payload_key, payload) in &resource.relationships {
            let name = match schema.as_ref().and_then(|s| s.field_for_key(payload_key)) {
                Some(field) if field.kind.is_relationship() => field.name.clone(),
                _ => payload_key.clone(),
            };
            let fallback = match &payload.data {
                Some(Some(Linkage::Many(_))) | None => RelationshipKind::HasMany,
                Some(Some(Linkage::One(_))) | Some(None) => RelationshipKind::BelongsTo,
            };
            let kind = self.definition(key, &name, Some(fallback))?.kind;
            let links_changed = self.graph.borrow_mut().set_links(
                key,
                &name,
                kind,
                payload.links.clone(),
                payload.meta.clone(),
            );
            if links_changed {
                self.bump(&CellKey::Relationship(key, name.clone()));
            }
            let Some(data) = &payload.data else {
                continue;
            };
            let members = data
                .iter()
                .flat_map(Linkage::identifiers)
                .map(|identifier| {
                    self.resolve_identity(
                        &identifier.resource_type,
                        identifier.id.as_deref(),
                        identifier.lid.as_deref(),
                    )
                })
                .collect::<Result<Vec<_>>>()?;
            self.replace_membership_with(key, &name, members, Layer::Remote, Some(fallback))?;
        }
        Ok(())
    }

    fn validate(&self, document: &Document) {
        let mut validators = self.validators.borrow().clone();
        if self.config.validate_documents {
            validators.push(Rc::new(LinkageValidator));
        }
        if validators.is_empty() {
            return;
        }
        let kinds: Vec<ReportKind> = {
            let presence = self.graph.borrow().presence();
            let identities = self.identities.borrow();
            validators
                .iter()
                .flat_map(|validator| validator.validate(document, &presence, &identities))
                .collect()
        };
        for kind in kinds {
            self.report(kind);
        }
    }

    fn report(&self, kind: ReportKind) {
        let report = DataQualityReport::new(kind, self.config.data_quality);
        report.log();
        let listeners = self.report_listeners.borrow().clone();
        for listener in listeners {
            listener(&report);
        }
        self.reports.borrow_mut().push(report);
    }

    // Commit cycle

    fn rollback(&self, key: ResourceKey) -> Result<()> {
        let _batch = self.reactor.batch();
        let kinds = self.known_kinds(key);
        let touched = self.graph.borrow_mut().rollback(key, |owner, name| {
            let fallback = (owner == key).then(|| kinds.get(name).copied()).flatten();
            self.definition(owner, name, fallback)
        })?;
        self.bump_edges(touched);

        let (keys, was_deleted) = self.cache.borrow_mut().rollback(key);
        for name in keys {
            self.bump(&CellKey::Attr(key, name));
        }
        if was_deleted {
            self.bump(&CellKey::Lifecycle(key));
        }
        Ok(())
    }

    fn staged(&self, key: ResourceKey) -> Staged {
        let cache = self.cache.borrow();
        Staged {
            attributes: cache.staged(key),
            relationships: self.graph.borrow().staged(key),
            deleted: cache.is_deleted_locally(key),
        }
    }

    fn acknowledge(
        &self,
        key: ResourceKey,
        staged: Staged,
        ack: Option<&ResourceObject>,
    ) -> Result<()> {
        let _batch = self.reactor.batch();
        if let Some(ack) = ack {
            let lid = match &ack.lid {
                Some(lid) => lid.clone(),
                None => self.identifier(key)?.lid,
            };
            let acknowledged =
                self.resolve_identity(&ack.resource_type, ack.id.as_deref(), Some(&lid))?;
            if acknowledged != key {
                return Err(Error::IdentityConflict {
                    identifier: self.identifier(acknowledged)?,
                    reason: "the acknowledgement describes a different resource".to_string(),
                });
            }
        }

        let Staged {
            attributes,
            relationships,
            deleted,
        } = staged;
        let kinds = self.known_kinds(key);
        let touched = self
            .graph
            .borrow_mut()
            .commit(key, relationships, |owner, name| {
                let fallback = (owner == key).then(|| kinds.get(name).copied()).flatten();
                self.definition(owner, name, fallback)
            })?;
        self.bump_edges(touched);

        let promoted = self.cache.borrow_mut().commit(key, &attributes, deleted);
        for name in promoted {
            self.bump(&CellKey::Attr(key, name));
        }
        if deleted {
            self.bump(&CellKey::Lifecycle(key));
        }

        if let Some(ack) = ack {
            self.merge_resource(key, ack)?;
        }
        Ok(())
    }

    fn diff(&self, key: ResourceKey) -> Result<Patch> {
        let schema = self.schema.borrow().resource(&self.type_of(key)?);
        build_patch(
            &self.identities.borrow(),
            &self.cache.borrow(),
            &self.graph.borrow(),
            schema.as_deref(),
            key,
        )
    }

    fn unload(&self, key: ResourceKey) -> Result<()> {
        let identifier = self.identifier(key)?;
        let _batch = self.reactor.batch();

        let touched = self.graph.borrow_mut().detach(key);
        self.bump_edges(touched);
        self.cache.borrow_mut().remove(key);
        self.bump(&CellKey::Lifecycle(key));

        let records: Vec<Rc<Record>> = {
            let mut records = self.records.borrow_mut();
            [Mode::Immutable, Mode::Editable]
                .into_iter()
                .filter_map(|mode| records.remove(&(key, mode)))
                .collect()
        };
        for record in records {
            record.destroy(identifier.clone());
        }

        let signals: Vec<NodeKey> = {
            let mut cells = self.cells.borrow_mut();
            let owned: Vec<CellKey> = cells
                .keys()
                .filter(|cell| cell.resource() == key)
                .cloned()
                .collect();
            owned
                .into_iter()
                .filter_map(|cell| cells.remove(&cell))
                .collect()
        };
        for signal in signals {
            self.reactor.dispose(signal);
        }

        self.hydrations.borrow_mut().remove(&key);
        self.missing_linkage
            .borrow_mut()
            .retain(|(owner, _)| *owner != key);
        self.identities.borrow_mut().forget_identity(key);
        log::info!(
            "Unloaded {} {}",
            identifier.resource_type,
            identifier.id.as_deref().unwrap_or(&identifier.lid)
        );
        Ok(())
    }
}

/// The resource cache. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Store {
    inner: Rc<StoreInner>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl Store {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            inner: StoreInner::new(config),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    // Schemas

    pub fn register_resource(&self, schema: ResourceSchema) -> Result<()> {
        self.inner.schema.borrow_mut().register_resource(schema)
    }

    pub fn register_transform(
        &self,
        name: impl Into<String>,
        transform: impl Transformation + 'static,
    ) {
        self.inner
            .schema
            .borrow_mut()
            .register_transform(name, transform);
    }

    pub fn register_derivation(
        &self,
        name: impl Into<String>,
        derivation: impl Fn(&FieldReader<'_>, Option<&Value>) -> Result<Value> + 'static,
    ) {
        self.inner
            .schema
            .borrow_mut()
            .register_derivation(name, derivation);
    }

    pub fn register_hash_function(
        &self,
        name: impl Into<String>,
        hash_fn: impl Fn(&Value, Option<&Value>) -> Value + 'static,
    ) {
        self.inner
            .schema
            .borrow_mut()
            .register_hash_function(name, hash_fn);
    }

    /// Runs `validator` after every push, alongside the built-in linkage validator when enabled.
    pub fn add_validator(&self, validator: impl DocumentValidator + 'static) {
        self.inner.validators.borrow_mut().push(Rc::new(validator));
    }

    // Identities

    pub fn identity_for(
        &self,
        resource_type: &str,
        id: Option<&str>,
        lid: Option<&str>,
    ) -> Result<ResourceKey> {
        let _batch = self.inner.reactor.batch();
        self.inner.resolve_identity(resource_type, id, lid)
    }

    pub fn identifier(&self, key: ResourceKey) -> Option<ResourceIdentifier> {
        self.inner.identifier(key).ok()
    }

    /// The identity already known for (type, id), without allocating one.
    pub fn lookup(&self, resource_type: &str, id: &str) -> Option<ResourceKey> {
        self.inner
            .identities
            .borrow()
            .peek(resource_type, Some(id), None)
    }

    pub fn identities(&self) -> Vec<(ResourceKey, ResourceIdentifier)> {
        self.inner
            .identities
            .borrow()
            .iter()
            .map(|(key, identifier)| (key, identifier.clone()))
            .collect()
    }

    pub fn presence(&self) -> PresenceIndex {
        self.inner.graph.borrow().presence()
    }

    // Documents and attributes

    /// Merges a document into the remote layer. Returns the identities of its primary data.
    pub fn push(&self, document: &Document) -> Result<Vec<ResourceKey>> {
        self.inner.push(document)
    }

    pub fn push_json(&self, json: &Value) -> Result<Vec<ResourceKey>> {
        self.push(&Document::from_json(json)?)
    }

    /// The merged wire view of an identity: local attributes and memberships over remote ones.
    pub fn peek(&self, key: ResourceKey) -> Option<ResourceObject> {
        let identifier = self.identifier(key)?;
        let identities = self.inner.identities.borrow();
        let cache = self.inner.cache.borrow();
        let graph = self.inner.graph.borrow();
        let entry = cache.entry(key);
        let relationships = graph.relationships(key);
        if entry.is_none() && relationships.is_empty() {
            return None;
        }

        let schema = self.inner.schema.borrow().resource(&identifier.resource_type);
        let mut resource = ResourceObject::new(identifier.resource_type, identifier.id.as_deref());
        resource.lid = Some(identifier.lid);
        if let Some(entry) = entry {
            resource.attributes.extend(entry.merged());
            resource.meta = entry.meta().cloned();
        }
        for rel in relationships {
            let Some(state) = graph.state(key, &rel) else {
                continue;
            };
            let mut payload = relationship_payload(&identities, state.kind, state.members()).ok()?;
            if !state.has_received_data() && state.local().is_none() {
                payload.data = None;
            }
            payload.links = state.links().cloned();
            payload.meta = state.meta().cloned();
            let wire_key = schema
                .as_ref()
                .and_then(|schema| schema.get(&rel))
                .map(|field| field.key().to_string())
                .unwrap_or(rel);
            resource.relationships.insert(wire_key, payload);
        }
        Some(resource)
    }

    /// Local value if staged, else remote, hydrated.
    pub fn get_attr(&self, key: ResourceKey, field: &str) -> Result<Value> {
        self.inner.projection(key, Mode::Immutable)?.value(field)
    }

    /// The remote value of a field, ignoring any local overlay.
    pub fn get_remote_attr(&self, key: ResourceKey, field: &str) -> Result<Value> {
        let type_name = self.inner.type_of(key)?;
        let schema = self.inner.resource_schema(&type_name)?;
        let field = schema.require(field)?;
        match field.kind {
            FieldKind::Plain => {
                let transform = self.inner.transform_for(&type_name, field)?;
                let wire = self.inner.cache.borrow().remote_attr(key, field.key()).cloned();
                hydrate_wire(transform.as_deref(), wire, field.options.as_ref())
            }
            FieldKind::Object | FieldKind::Array => Ok(self
                .inner
                .cache
                .borrow()
                .remote_attr(key, field.key())
                .cloned()
                .unwrap_or(Value::Null)),
            FieldKind::BelongsTo | FieldKind::HasMany => {
                let (kind, remote) = match self.inner.graph.borrow().state(key, &field.name) {
                    Some(state) => (state.kind, state.remote().clone()),
                    None => return Ok(Value::Null),
                };
                let payload = relationship_payload(&self.inner.identities.borrow(), kind, &remote)?;
                Ok(serde_json::to_value(payload.data.flatten())?)
            }
            FieldKind::Derived => Err(Error::invalid_value(
                &field.name,
                &type_name,
                "derived fields have no remote value",
            )),
        }
    }

    /// Serializes `value` and stages it in the local layer. Does not check editability.
    pub fn set_attr_locally(&self, key: ResourceKey, field: &str, value: Value) -> Result<()> {
        let type_name = self.inner.type_of(key)?;
        let schema = self.inner.resource_schema(&type_name)?;
        let field = schema.require(field)?;
        let wire = serialize_field(&self.inner, &type_name, field, &value)?;
        self.inner.write_attr(key, field.key(), wire);
        Ok(())
    }

    pub fn changed_attributes(&self, key: ResourceKey) -> Vec<AttributeChange> {
        self.inner.cache.borrow().local_changes(key)
    }

    /// Whether the identity has any staged attribute, membership or delete.
    pub fn has_changes(&self, key: ResourceKey) -> bool {
        self.inner.cache.borrow().has_local_changes(key)
            || self.inner.graph.borrow().has_local_changes(key)
    }

    pub fn is_deleted(&self, key: ResourceKey) -> bool {
        self.inner.cache.borrow().is_deleted(key)
    }

    // Projections

    pub fn projection_for(&self, key: ResourceKey, mode: Mode) -> Result<Rc<Record>> {
        self.inner.projection(key, mode)
    }

    /// The immutable record for (type, id), allocating the identity if needed.
    pub fn record(&self, resource_type: &str, id: &str) -> Result<Rc<Record>> {
        let key = self.identity_for(resource_type, Some(id), None)?;
        self.projection_for(key, Mode::Immutable)
    }

    /// Allocates a lid-only identity and returns its editable record with `attributes` staged.
    pub fn create_record(&self, resource_type: &str, attributes: Value) -> Result<Rc<Record>> {
        self.inner.resource_schema(resource_type)?;
        let Value::Object(attributes) = attributes else {
            return Err(Error::invalid_value(
                "attributes",
                resource_type,
                "expected an object",
            ));
        };
        let _batch = self.inner.reactor.batch();
        let key = self.inner.resolve_identity(resource_type, None, None)?;
        let record = self.projection_for(key, Mode::Editable)?;
        for (name, value) in attributes {
            record.set(&name, value)?;
        }
        log::debug!("Created {resource_type} {:?}", record.identifier()?.lid);
        Ok(record)
    }

    /// Registers a pending hydration for `key`. While it is pending, [`Store::checkout`] waits for
    /// it; concurrent loads of the same identity share the first fetch.
    pub fn load<F, E>(
        &self,
        key: ResourceKey,
        fetch: F,
    ) -> impl Future<Output = Result<Vec<ResourceKey>>> + 'static
    where
        F: Future<Output = Result<Document, E>> + 'static,
        E: std::error::Error + 'static,
    {
        let pending = self.inner.hydrations.borrow().get(&key).cloned();
        let hydration = match pending {
            Some(pending) => pending,
            None => {
                let store = Rc::downgrade(&self.inner);
                let hydration = async move {
                    let document = fetch.await.map_err(|e| e.to_string())?;
                    let store = store
                        .upgrade()
                        .ok_or_else(|| "the store was dropped".to_string())?;
                    store.push(&document).map_err(|e| e.to_string())
                }
                .boxed_local()
                .shared();
                self.inner
                    .hydrations
                    .borrow_mut()
                    .insert(key, hydration.clone());
                hydration
            }
        };

        let store = Rc::downgrade(&self.inner);
        async move {
            let result = hydration.clone().await;
            if let Some(store) = store.upgrade() {
                let mut hydrations = store.hydrations.borrow_mut();
                if hydrations
                    .get(&key)
                    .is_some_and(|pending| pending.ptr_eq(&hydration))
                {
                    hydrations.remove(&key);
                }
            }
            result
                .inspect_err(|e| log::error!("Loading failed: {e}"))
                .map_err(Error::LoadFailed)
        }
    }

    pub fn is_loading(&self, key: ResourceKey) -> bool {
        self.inner.hydrations.borrow().contains_key(&key)
    }

    // Checkout

    /// The editable projection of `record`'s identity, once any pending hydration has finished.
    pub async fn checkout(&self, record: &Record) -> Result<Rc<Record>> {
        record.store()?;
        let key = record.key();
        let pending = self.inner.hydrations.borrow().get(&key).cloned();
        if let Some(pending) = pending {
            pending.await.map_err(Error::LoadFailed)?;
        }
        self.inner.projection(key, Mode::Editable)
    }

    /// Destroys the editable projection. Staged changes stay in the local layer until rolled back
    /// or saved.
    pub fn discard_checkout(&self, record: &Record) -> Result<()> {
        let key = record.key();
        let identifier = self.inner.identifier(key)?;
        let removed = self.inner.records.borrow_mut().remove(&(key, Mode::Editable));
        if let Some(editable) = removed {
            editable.destroy(identifier);
        }
        Ok(())
    }

    /// Discards every staged attribute, membership and delete of `key`.
    pub fn rollback(&self, key: ResourceKey) -> Result<()> {
        self.inner.rollback(key)
    }

    pub fn diff(&self, key: ResourceKey) -> Result<Patch> {
        self.inner.diff(key)
    }

    /// Promotes the local layer into the remote one, then merges the server's representation.
    pub fn acknowledge(&self, key: ResourceKey, ack: Option<&ResourceObject>) -> Result<()> {
        let staged = self.inner.staged(key);
        self.inner.acknowledge(key, staged, ack)
    }

    /// Sends the record's patch and acknowledges it. On failure nothing changes. Updates with
    /// nothing to send never reach the network. Edits staged while the request is in flight are
    /// not part of the acknowledgement and stay local.
    pub async fn save<N: Network>(&self, record: &Record, network: &N) -> Result<Patch> {
        record.store()?;
        let key = record.key();
        let patch = self.inner.diff(key)?;
        if patch.is_empty() {
            return Ok(patch);
        }
        let staged = self.inner.staged(key);

        let document = network
            .save(&patch)
            .await
            .inspect_err(|e| {
                log::error!(
                    "Saving {} {:?} failed: {e}",
                    patch.data.resource_type,
                    patch.data.id
                )
            })
            .map_err(|e| Error::Network(Box::new(e)))?;

        let _batch = self.inner.reactor.batch();
        self.inner
            .acknowledge(key, staged, document.primary().first())?;
        if !document.included.is_empty() {
            self.inner.push(&Document {
                included: document.included,
                ..Default::default()
            })?;
        }
        if patch.op == SaveOp::Delete {
            log::debug!("Deleted {} {:?}", patch.data.resource_type, patch.data.id);
        }
        Ok(patch)
    }

    // Relationships

    /// Re-fetches a relationship from its `related` link and replaces its remote membership with
    /// the primary data of the response.
    pub async fn reload_relationship<N: Network>(
        &self,
        record: &Record,
        field: &str,
        network: &N,
    ) -> Result<()> {
        record.store()?;
        let key = record.key();
        let schema = self.inner.resource_schema(record.type_name())?;
        let field = schema.require(field)?;
        if !field.kind.is_relationship() {
            return Err(Error::invalid_value(
                &field.name,
                record.type_name(),
                "not a relationship",
            ));
        }
        let not_links_mode = || Error::NotLinksMode {
            field: field.name.clone(),
            type_name: record.type_name().to_string(),
        };
        if !field.links_mode {
            return Err(not_links_mode());
        }
        let url = self
            .inner
            .related_link(key, &field.name)
            .ok_or_else(not_links_mode)?;

        let document = network
            .fetch(&url)
            .await
            .inspect_err(|e| log::error!("Reloading `{}` from {url} failed: {e}", field.name))
            .map_err(|e| Error::Network(Box::new(e)))?;

        let _batch = self.inner.reactor.batch();
        let members = self.inner.push(&document)?;
        self.inner
            .replace_membership(key, &field.name, members, Layer::Remote)
    }

    // Lifecycle

    /// Removes an identity from the store entirely: its cache entry, its relationship state and
    /// its place in every other identity's relationships. Its records are destroyed.
    pub fn unload(&self, key: ResourceKey) -> Result<()> {
        self.inner.unload(key)
    }

    // Subscriptions and reports

    /// Calls `callback` whenever `field` of `record` changes, at most once per store operation.
    pub fn subscribe(
        &self,
        record: &Record,
        field: &str,
        callback: impl Fn() + 'static,
    ) -> Result<ListenerKey> {
        let store = record.store()?;
        let memo = record.field_memo(&store, field)?;
        store.reactor.read(memo)?;
        Ok(store.reactor.listen(memo, callback))
    }

    pub fn unsubscribe(&self, listener: ListenerKey) {
        self.inner.reactor.unlisten(listener);
    }

    /// Drains the queued data-quality reports.
    pub fn take_reports(&self) -> Vec<DataQualityReport> {
        std::mem::take(&mut *self.inner.reports.borrow_mut())
    }

    pub fn on_report(&self, listener: impl Fn(&DataQualityReport) + 'static) {
        self.inner
            .report_listeners
            .borrow_mut()
            .push(Rc::new(listener));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::IdentifierObject;
    use serde_json::json;

    fn store() -> Store {
        let store = Store::default();
        store
            .register_resource(
                ResourceSchema::new("user")
                    .field(FieldSchema::plain("name").transform("string"))
                    .field(FieldSchema::has_many("friends", "user").inverse("friends")),
            )
            .unwrap();
        store
    }

    #[test]
    fn untracked_merges_do_not_allocate_cells() {
        let store = store();
        store
            .push_json(&json!({
                "data": { "type": "user", "id": "1", "attributes": { "name": "Leo" } }
            }))
            .unwrap();
        assert!(store.inner.cells.borrow().is_empty());

        let key = store.lookup("user", "1").unwrap();
        let user = store.projection_for(key, Mode::Immutable).unwrap();
        user.get("name").unwrap();
        assert!(
            store
                .inner
                .cells
                .borrow()
                .contains_key(&CellKey::Attr(key, "name".into()))
        );
    }

    #[test]
    fn relationships_without_schema_fields_keep_their_payload_shape() {
        let store = store();
        store
            .push_json(&json!({
                "data": {
                    "type": "user",
                    "id": "1",
                    "relationships": {
                        "mentor": { "data": { "type": "user", "id": "2" } },
                        "posts": { "links": { "related": "/users/1/posts" } }
                    }
                }
            }))
            .unwrap();
        let key = store.lookup("user", "1").unwrap();
        let graph = store.inner.graph.borrow();
        assert_eq!(
            graph.state(key, "mentor").map(|s| s.kind),
            Some(RelationshipKind::BelongsTo)
        );
        assert_eq!(
            graph.state(key, "posts").map(|s| s.kind),
            Some(RelationshipKind::HasMany)
        );
    }

    #[test]
    fn peek_renders_the_merged_view() {
        let store = store();
        let keys = store
            .push_json(&json!({
                "data": {
                    "type": "user",
                    "id": "1",
                    "attributes": { "name": "Leo" },
                    "relationships": { "friends": { "data": [{ "type": "user", "id": "2" }] } }
                }
            }))
            .unwrap();
        store.set_attr_locally(keys[0], "name", json!("Ada")).unwrap();

        let resource = store.peek(keys[0]).unwrap();
        assert_eq!(resource.attributes["name"], json!("Ada"));
        assert_eq!(
            resource.relationships["friends"].data,
            Some(Some(Linkage::Many(vec![IdentifierObject::new("user", "2")])))
        );
        assert_eq!(store.get_remote_attr(keys[0], "name").unwrap(), json!("Leo"));
    }
}
