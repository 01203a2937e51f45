//! Wire shapes the store consumes (documents pushed into the cache) and produces (save patches).

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<PrimaryData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included: Vec<ResourceObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryData {
    Many(Vec<ResourceObject>),
    One(Box<ResourceObject>),
}

impl Document {
    pub fn from_json(json: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(json.clone())
    }

    pub fn single(resource: ResourceObject) -> Self {
        Self {
            data: Some(PrimaryData::One(Box::new(resource))),
            ..Default::default()
        }
    }

    /// Primary resources, in document order.
    pub fn primary(&self) -> &[ResourceObject] {
        match &self.data {
            None => &[],
            Some(PrimaryData::Many(resources)) => resources,
            Some(PrimaryData::One(resource)) => std::slice::from_ref(resource.as_ref()),
        }
    }

    /// Primary resources followed by included ones.
    pub fn resources(&self) -> impl Iterator<Item = &ResourceObject> {
        self.primary().iter().chain(self.included.iter())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceObject {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lid: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub relationships: BTreeMap<String, RelationshipPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl ResourceObject {
    pub fn new(resource_type: impl Into<String>, id: Option<&str>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.map(str::to_string),
            lid: None,
            attributes: Map::new(),
            relationships: BTreeMap::new(),
            meta: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationshipPayload {
    /// `None` when the member is absent, `Some(None)` when it is `null`.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<Option<Linkage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Links>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

fn deserialize_present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Linkage {
    Many(Vec<IdentifierObject>),
    One(IdentifierObject),
}

impl Linkage {
    pub fn identifiers(&self) -> &[IdentifierObject] {
        match self {
            Linkage::Many(identifiers) => identifiers,
            Linkage::One(identifier) => std::slice::from_ref(identifier),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentifierObject {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lid: Option<String>,
}

impl IdentifierObject {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: Some(id.into()),
            lid: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Links {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related: Option<Link>,
    #[serde(rename = "self", default, skip_serializing_if = "Option::is_none")]
    pub self_link: Option<Link>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first: Option<Link>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<Link>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev: Option<Link>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Link>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Link {
    Href(String),
    Object {
        href: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<Value>,
    },
}

impl Link {
    pub fn href(&self) -> &str {
        match self {
            Link::Href(href) | Link::Object { href, .. } => href,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveOp {
    Create,
    Update,
    Delete,
}

/// The changes an editable record holds relative to its remote state. Serializes as
/// `{ "data": { type, id, lid, attributes, relationships } }`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Patch {
    #[serde(skip)]
    pub op: SaveOp,
    pub data: PatchData,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PatchData {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lid: Option<String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub relationships: BTreeMap<String, RelationshipPayload>,
}

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.op == SaveOp::Update
            && self.data.attributes.is_empty()
            && self.data.relationships.is_empty()
    }
}
