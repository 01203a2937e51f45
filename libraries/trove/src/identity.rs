//! # Identity registry
//! Every resource the store has ever seen gets exactly one [`ResourceKey`]. A resource can be
//! known by its server id, by a client-side local id (lid), or both. Records created on the client
//! only have a lid until the server acknowledges them, at which point the same key is upgraded with
//! the server id.

use std::collections::HashMap;

use slotmap::SlotMap;

use crate::error::{Error, Result};

slotmap::new_key_type! {
    /// Stable token for one resource. Keys are never reused while the store is alive, even
    /// after the resource gets a server id.
    pub struct ResourceKey;
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ResourceIdentifier {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub id: Option<String>,
    pub lid: String,
}

/// What [`IdentityRegistry::identity_for`] had to do to produce a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    Existing,
    Created,
    /// A lid-only identity received its server id.
    Upgraded,
}

#[derive(Debug)]
pub struct IdentityRegistry {
    identities: SlotMap<ResourceKey, ResourceIdentifier>,
    by_id: HashMap<(String, String), ResourceKey>,
    by_lid: HashMap<String, ResourceKey>,
    lid_prefix: String,
}

impl Default for IdentityRegistry {
    fn default() -> Self {
        Self::new("@lid:")
    }
}

impl IdentityRegistry {
    pub fn new(lid_prefix: impl Into<String>) -> Self {
        Self {
            identities: SlotMap::with_key(),
            by_id: HashMap::new(),
            by_lid: HashMap::new(),
            lid_prefix: lid_prefix.into(),
        }
    }

    pub fn identifier(&self, key: ResourceKey) -> Option<&ResourceIdentifier> {
        self.identities.get(key)
    }

    pub fn contains(&self, key: ResourceKey) -> bool {
        self.identities.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceKey, &ResourceIdentifier)> {
        self.identities.iter()
    }

    /// Looks up an identity without allocating one.
    pub fn peek(
        &self,
        resource_type: &str,
        id: Option<&str>,
        lid: Option<&str>,
    ) -> Option<ResourceKey> {
        if let Some(key) = lid.and_then(|lid| self.by_lid.get(lid)) {
            return Some(*key);
        }
        id.and_then(|id| {
            self.by_id
                .get(&(resource_type.to_string(), id.to_string()))
                .copied()
        })
    }

    /// Returns the identity matching any of the supplied keys, allocating one if none match.
    pub fn identity_for(
        &mut self,
        resource_type: &str,
        id: Option<&str>,
        lid: Option<&str>,
    ) -> Result<(ResourceKey, Resolution)> {
        let conflict = |reason: String| Error::IdentityConflict {
            identifier: ResourceIdentifier {
                resource_type: resource_type.to_string(),
                id: id.map(str::to_string),
                lid: lid.unwrap_or_default().to_string(),
            },
            reason,
        };

        let by_id = id.and_then(|id| {
            self.by_id
                .get(&(resource_type.to_string(), id.to_string()))
                .copied()
        });
        let by_lid = lid.and_then(|lid| self.by_lid.get(lid).copied());

        match (by_id, by_lid) {
            (Some(a), Some(b)) if a != b => Err(conflict(
                "the id and the lid belong to different resources".to_string(),
            )),
            (Some(key), by_lid) => {
                if let (Some(lid), None) = (lid, by_lid) {
                    let existing = &self.identities[key].lid;
                    return Err(conflict(format!(
                        "resource is already known by lid `{existing}`, not `{lid}`"
                    )));
                }
                Ok((key, Resolution::Existing))
            }
            (None, Some(key)) => {
                let identifier = &mut self.identities[key];
                if identifier.resource_type != resource_type {
                    return Err(conflict(format!(
                        "lid is already used by a resource of type `{}`",
                        identifier.resource_type
                    )));
                }
                let current = identifier.id.clone();
                match (id, current.as_deref()) {
                    (Some(new_id), Some(old_id)) if new_id != old_id => Err(conflict(format!(
                        "lid is already mapped to id `{old_id}`"
                    ))),
                    (Some(new_id), None) => {
                        identifier.id = Some(new_id.to_string());
                        self.by_id
                            .insert((resource_type.to_string(), new_id.to_string()), key);
                        log::debug!("Upgraded {resource_type} lid to id {new_id}");
                        Ok((key, Resolution::Upgraded))
                    }
                    _ => Ok((key, Resolution::Existing)),
                }
            }
            (None, None) => {
                let lid = match lid {
                    Some(lid) => lid.to_string(),
                    None => format!("{}{}", self.lid_prefix, uuid::Uuid::new_v4()),
                };
                let key = self.identities.insert(ResourceIdentifier {
                    resource_type: resource_type.to_string(),
                    id: id.map(str::to_string),
                    lid: lid.clone(),
                });
                self.by_lid.insert(lid, key);
                if let Some(id) = id {
                    self.by_id
                        .insert((resource_type.to_string(), id.to_string()), key);
                }
                Ok((key, Resolution::Created))
            }
        }
    }

    /// Removes every index entry for `key`. The caller must already have detached the resource
    /// from the relationship graph.
    pub fn forget_identity(&mut self, key: ResourceKey) -> Option<ResourceIdentifier> {
        let identifier = self.identities.remove(key)?;
        self.by_lid.remove(&identifier.lid);
        if let Some(id) = &identifier.id {
            self.by_id
                .remove(&(identifier.resource_type.clone(), id.clone()));
        }
        Some(identifier)
    }
}
