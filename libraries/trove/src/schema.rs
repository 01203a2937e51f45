//! # Schema service
//! Schemas describe the fields of a resource type (or of an embedded object type) and how each one
//! is read. Functions referenced by schemas (transforms, derivations, identity hashes) are
//! registered separately by name and only looked up when a field is actually resolved, so
//! documents can be cached before the schemas that describe them exist.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use indexmap::IndexMap;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::record::FieldReader;
use crate::transforms::{self, Transformation};

/// Computes the logical identity (or, for type resolvers, the type tag) of an embedded value.
/// Must return a string or a number.
pub type HashFn = Rc<dyn Fn(&Value, Option<&Value>) -> Value>;

/// Computes a derived field from the other fields of the same record.
pub type DerivationFn = Rc<dyn Fn(&FieldReader<'_>, Option<&Value>) -> Result<Value>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Plain,
    Derived,
    Object,
    Array,
    BelongsTo,
    HasMany,
}

impl FieldKind {
    pub fn is_relationship(self) -> bool {
        matches!(self, FieldKind::BelongsTo | FieldKind::HasMany)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldSchema {
    pub kind: FieldKind,
    pub name: String,
    /// Name of the member in the wire payload, when it differs from `name`.
    pub source_key: Option<String>,
    /// Transform (plain, array), nested schema (object, array), derivation (derived) or related
    /// type (relationships).
    pub value_type: Option<String>,
    pub options: Option<Value>,
    pub inverse: Option<String>,
    /// Relationship members may be of any type.
    pub polymorphic: bool,
    /// Relationship membership is loaded through its `related` link.
    pub links_mode: bool,
    /// Hash function producing the schema type of a polymorphic embedded value.
    pub type_resolver: Option<String>,
}

impl FieldSchema {
    fn new(kind: FieldKind, name: impl Into<String>, value_type: Option<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            source_key: None,
            value_type,
            options: None,
            inverse: None,
            polymorphic: false,
            links_mode: false,
            type_resolver: None,
        }
    }

    pub fn plain(name: impl Into<String>) -> Self {
        Self::new(FieldKind::Plain, name, None)
    }

    pub fn derived(name: impl Into<String>, derivation: impl Into<String>) -> Self {
        Self::new(FieldKind::Derived, name, Some(derivation.into()))
    }

    pub fn object(name: impl Into<String>, schema_type: impl Into<String>) -> Self {
        Self::new(FieldKind::Object, name, Some(schema_type.into()))
    }

    /// An array of primitives (optionally transformed) or, when `item_type` names a registered
    /// schema, of embedded objects.
    pub fn array(name: impl Into<String>, item_type: Option<&str>) -> Self {
        Self::new(FieldKind::Array, name, item_type.map(str::to_string))
    }

    pub fn belongs_to(name: impl Into<String>, related_type: impl Into<String>) -> Self {
        Self::new(FieldKind::BelongsTo, name, Some(related_type.into()))
    }

    pub fn has_many(name: impl Into<String>, related_type: impl Into<String>) -> Self {
        Self::new(FieldKind::HasMany, name, Some(related_type.into()))
    }

    pub fn source_key(mut self, key: impl Into<String>) -> Self {
        self.source_key = Some(key.into());
        self
    }

    pub fn transform(mut self, transform: impl Into<String>) -> Self {
        self.value_type = Some(transform.into());
        self
    }

    pub fn options(mut self, options: Value) -> Self {
        self.options = Some(options);
        self
    }

    pub fn inverse(mut self, inverse: impl Into<String>) -> Self {
        self.inverse = Some(inverse.into());
        self
    }

    pub fn polymorphic(mut self) -> Self {
        self.polymorphic = true;
        self
    }

    pub fn links_mode(mut self) -> Self {
        self.links_mode = true;
        self
    }

    pub fn resolve_type_with(mut self, resolver: impl Into<String>) -> Self {
        self.type_resolver = Some(resolver.into());
        self
    }

    /// The member name used in wire payloads.
    pub fn key(&self) -> &str {
        self.source_key.as_deref().unwrap_or(&self.name)
    }
}

/// How embedded values of a schema are told apart across updates.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum IdentityStrategy {
    /// Identity is the position of the value (its array index, or the field it sits in).
    #[default]
    Positional,
    /// Identity is the output of the named hash function.
    Hash(String),
}

#[derive(Clone, Debug)]
pub struct ResourceSchema {
    pub type_name: String,
    pub identity: IdentityStrategy,
    fields: IndexMap<String, FieldSchema>,
    by_key: HashMap<String, String>,
    duplicate_fields: Vec<String>,
}

impl ResourceSchema {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            identity: IdentityStrategy::Positional,
            fields: IndexMap::new(),
            by_key: HashMap::new(),
            duplicate_fields: Vec::new(),
        }
    }

    pub fn identity_hash(mut self, hash_fn: impl Into<String>) -> Self {
        self.identity = IdentityStrategy::Hash(hash_fn.into());
        self
    }

    pub fn field(mut self, field: FieldSchema) -> Self {
        if self.fields.contains_key(&field.name) {
            self.duplicate_fields.push(field.name.clone());
        }
        self.by_key.insert(field.key().to_string(), field.name.clone());
        self.fields.insert(field.name.clone(), field);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.get(name)
    }

    /// Resolves a wire member name (respecting `source_key`) to its field.
    pub fn field_for_key(&self, key: &str) -> Option<&FieldSchema> {
        self.by_key.get(key).and_then(|name| self.fields.get(name))
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldSchema> {
        self.fields.values()
    }

    /// Looks up a field, failing with the read-time "no field named X" error.
    pub fn require(&self, name: &str) -> Result<&FieldSchema> {
        self.get(name).ok_or_else(|| Error::UnknownField {
            field: name.to_string(),
            type_name: self.type_name.clone(),
        })
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Error::InvalidSchema {
            type_name: self.type_name.clone(),
            reason,
        };

        if let Some(name) = self.duplicate_fields.first() {
            return Err(invalid(format!("field `{name}` is declared twice")));
        }

        let mut keys = HashSet::new();
        for field in self.fields.values() {
            if !keys.insert(field.key()) {
                return Err(invalid(format!(
                    "wire key `{}` is used by more than one field",
                    field.key()
                )));
            }
            let needs_value_type = match field.kind {
                FieldKind::Derived | FieldKind::BelongsTo | FieldKind::HasMany => true,
                FieldKind::Object => field.type_resolver.is_none(),
                FieldKind::Plain | FieldKind::Array => false,
            };
            if needs_value_type && field.value_type.is_none() {
                return Err(invalid(format!(
                    "{:?} field `{}` must name a type",
                    field.kind, field.name
                )));
            }
            if field.inverse.is_some() && !field.kind.is_relationship() {
                return Err(invalid(format!(
                    "only relationships can declare an inverse, `{}` is {:?}",
                    field.name, field.kind
                )));
            }
        }
        Ok(())
    }
}

pub struct SchemaService {
    resources: HashMap<String, Rc<ResourceSchema>>,
    transforms: HashMap<String, Rc<dyn Transformation>>,
    derivations: HashMap<String, DerivationFn>,
    hash_functions: HashMap<String, HashFn>,
}

impl Default for SchemaService {
    fn default() -> Self {
        Self::new(true)
    }
}

impl SchemaService {
    pub fn new(builtin_transforms: bool) -> Self {
        let mut service = Self {
            resources: HashMap::new(),
            transforms: HashMap::new(),
            derivations: HashMap::new(),
            hash_functions: HashMap::new(),
        };
        if builtin_transforms {
            for (name, transform) in transforms::builtin() {
                service.transforms.insert(name.to_string(), transform);
            }
        }
        service
    }

    pub fn register_resource(&mut self, schema: ResourceSchema) -> Result<()> {
        if self.resources.contains_key(&schema.type_name) {
            return Err(Error::SchemaAlreadyRegistered(schema.type_name));
        }
        schema.validate()?;
        log::debug!("Registered schema for {}", schema.type_name);
        self.resources
            .insert(schema.type_name.clone(), Rc::new(schema));
        Ok(())
    }

    pub fn register_transform(
        &mut self,
        name: impl Into<String>,
        transform: impl Transformation + 'static,
    ) {
        self.transforms.insert(name.into(), Rc::new(transform));
    }

    pub fn register_derivation(
        &mut self,
        name: impl Into<String>,
        derivation: impl Fn(&FieldReader<'_>, Option<&Value>) -> Result<Value> + 'static,
    ) {
        self.derivations.insert(name.into(), Rc::new(derivation));
    }

    pub fn register_hash_function(
        &mut self,
        name: impl Into<String>,
        hash_fn: impl Fn(&Value, Option<&Value>) -> Value + 'static,
    ) {
        self.hash_functions.insert(name.into(), Rc::new(hash_fn));
    }

    pub fn has_resource(&self, type_name: &str) -> bool {
        self.resources.contains_key(type_name)
    }

    pub fn resource(&self, type_name: &str) -> Option<Rc<ResourceSchema>> {
        self.resources.get(type_name).cloned()
    }

    pub fn require_resource(&self, type_name: &str) -> Result<Rc<ResourceSchema>> {
        self.resource(type_name)
            .ok_or_else(|| Error::UnknownSchema(type_name.to_string()))
    }

    pub fn transform(&self, name: &str) -> Option<Rc<dyn Transformation>> {
        self.transforms.get(name).cloned()
    }

    pub fn derivation(&self, name: &str) -> Option<DerivationFn> {
        self.derivations.get(name).cloned()
    }

    pub fn hash_function(&self, name: &str) -> Result<HashFn> {
        self.hash_functions
            .get(name)
            .cloned()
            .ok_or_else(|| Error::MissingHashFunction(name.to_string()))
    }

    /// The transform declared by a plain field, or `None` when it has no value type.
    pub fn field_transform(
        &self,
        type_name: &str,
        field: &FieldSchema,
    ) -> Result<Option<Rc<dyn Transformation>>> {
        let Some(name) = &field.value_type else {
            return Ok(None);
        };
        self.transform(name)
            .map(Some)
            .ok_or_else(|| Error::MissingTransform {
                field: field.name.clone(),
                type_name: type_name.to_string(),
                transform: name.clone(),
            })
    }
}

/// Turns the output of a hash function into an identity string.
pub(crate) fn identity_string(function: &str, output: Value) -> Result<String> {
    match output {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(Error::MalformedIdentity {
            function: function.to_string(),
            output: other,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user() -> ResourceSchema {
        ResourceSchema::new("user")
            .field(FieldSchema::plain("name"))
            .field(FieldSchema::plain("createdAt").source_key("created_at").transform("date"))
            .field(FieldSchema::has_many("friends", "user").inverse("friends"))
    }

    #[test]
    fn registering_a_type_twice_fails() {
        let mut service = SchemaService::default();
        service.register_resource(user()).unwrap();
        assert!(matches!(
            service.register_resource(user()),
            Err(Error::SchemaAlreadyRegistered(t)) if t == "user"
        ));
    }

    #[test]
    fn source_keys_resolve_to_fields() {
        let schema = user();
        assert_eq!(schema.field_for_key("created_at").unwrap().name, "createdAt");
        assert!(schema.field_for_key("createdAt").is_none());
        assert_eq!(schema.get("name").unwrap().key(), "name");
    }

    #[test]
    fn invalid_schemas_are_rejected() {
        let mut service = SchemaService::default();
        let duplicated = ResourceSchema::new("a")
            .field(FieldSchema::plain("x"))
            .field(FieldSchema::plain("x"));
        assert!(matches!(
            service.register_resource(duplicated),
            Err(Error::InvalidSchema { .. })
        ));

        let clashing_keys = ResourceSchema::new("b")
            .field(FieldSchema::plain("x"))
            .field(FieldSchema::plain("y").source_key("x"));
        assert!(service.register_resource(clashing_keys).is_err());

        let bad_inverse = ResourceSchema::new("c").field(FieldSchema::plain("x").inverse("y"));
        assert!(service.register_resource(bad_inverse).is_err());
    }

    #[test]
    fn missing_transforms_name_the_field() {
        let service = SchemaService::default();
        let field = FieldSchema::plain("born").transform("unix-time");
        let err = service.field_transform("user", &field).err().unwrap();
        assert_eq!(
            err.to_string(),
            "field `born` on type `user` uses transform `unix-time`, which is not registered"
        );
    }

    #[test]
    fn identity_strings_accept_strings_and_numbers() {
        assert_eq!(identity_string("h", json!("a|b")).unwrap(), "a|b");
        assert_eq!(identity_string("h", json!(7)).unwrap(), "7");
        assert!(matches!(
            identity_string("h", json!({"x": 1})),
            Err(Error::MalformedIdentity { .. })
        ));
    }
}
