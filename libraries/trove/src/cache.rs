//! # Canonical cache
//! Attribute storage for every identity, split into a `remote` layer (what the server last told us)
//! and an optional `local` overlay holding only the keys a checkout changed. Values are stored in
//! their wire form, keyed by wire member name; hydration happens when a field is read.
//!
//! The cache knows nothing about schemas or projections. Every mutating call reports which keys
//! actually changed so the store can invalidate exactly those cells.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::identity::ResourceKey;

type Attributes = im::HashMap<String, Value>;

#[derive(Clone, Debug, Default)]
pub struct CacheEntry {
    remote: Attributes,
    local: Option<Attributes>,
    remote_deleted: bool,
    local_deleted: bool,
    meta: Option<Value>,
}

impl CacheEntry {
    pub fn remote(&self) -> &Attributes {
        &self.remote
    }

    pub fn local(&self) -> Option<&Attributes> {
        self.local.as_ref()
    }

    pub fn meta(&self) -> Option<&Value> {
        self.meta.as_ref()
    }

    /// Local values layered over remote ones. Shares structure with both layers.
    pub fn merged(&self) -> Attributes {
        match &self.local {
            Some(local) => local.clone().union(self.remote.clone()),
            None => self.remote.clone(),
        }
    }

    fn get(&self, key: &str) -> Option<&Value> {
        self.local
            .as_ref()
            .and_then(|local| local.get(key))
            .or_else(|| self.remote.get(key))
    }

    fn normalize(&mut self) {
        if self.local.as_ref().is_some_and(|local| local.is_empty()) {
            self.local = None;
        }
    }
}

/// One attribute the checkout changed.
#[derive(Clone, Debug, PartialEq)]
pub struct AttributeChange {
    pub key: String,
    pub remote: Option<Value>,
    pub local: Value,
}

#[derive(Debug, Default)]
pub struct Cache {
    entries: HashMap<ResourceKey, CacheEntry>,
}

impl Cache {
    pub fn entry(&self, key: ResourceKey) -> Option<&CacheEntry> {
        self.entries.get(&key)
    }

    pub fn contains(&self, key: ResourceKey) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes server attributes into the remote layer, returning the keys whose value changed.
    /// Keys whose new remote value matches the local overlay drop out of the overlay.
    pub fn merge_attributes(
        &mut self,
        key: ResourceKey,
        attributes: &Map<String, Value>,
        meta: Option<&Value>,
    ) -> Vec<String> {
        let entry = self.entries.entry(key).or_default();
        if let Some(meta) = meta {
            entry.meta = Some(meta.clone());
        }

        let mut changed = Vec::new();
        for (name, value) in attributes {
            if entry.remote.get(name) == Some(value) {
                continue;
            }
            entry.remote.insert(name.clone(), value.clone());
            if let Some(local) = &mut entry.local {
                if local.get(name) == Some(value) {
                    local.remove(name);
                }
            }
            changed.push(name.clone());
        }
        entry.normalize();
        changed
    }

    /// Local value if staged, else remote value.
    pub fn attr(&self, key: ResourceKey, name: &str) -> Option<&Value> {
        self.entries.get(&key).and_then(|entry| entry.get(name))
    }

    pub fn remote_attr(&self, key: ResourceKey, name: &str) -> Option<&Value> {
        self.entries
            .get(&key)
            .and_then(|entry| entry.remote.get(name))
    }

    /// Stages a wire value in the local layer. Returns whether the visible value changed.
    pub fn set_local(&mut self, key: ResourceKey, name: &str, value: Value) -> bool {
        let entry = self.entries.entry(key).or_default();
        if entry.get(name) == Some(&value) {
            return false;
        }
        if entry.remote.get(name) == Some(&value) {
            if let Some(local) = &mut entry.local {
                local.remove(name);
            }
        } else {
            entry
                .local
                .get_or_insert_with(Attributes::new)
                .insert(name.to_string(), value);
        }
        entry.normalize();
        true
    }

    /// Discards the local overlay and any staged delete. Returns the keys that had a local value
    /// and whether a staged delete was cleared.
    pub fn rollback(&mut self, key: ResourceKey) -> (Vec<String>, bool) {
        let Some(entry) = self.entries.get_mut(&key) else {
            return (Vec::new(), false);
        };
        let keys = entry
            .local
            .take()
            .map(|local| local.keys().cloned().collect())
            .unwrap_or_default();
        let was_deleted = std::mem::replace(&mut entry.local_deleted, false);
        (keys, was_deleted)
    }

    /// The local overlay of `key` as it stands now, for handing to [`Cache::commit`] once the
    /// server has accepted it.
    pub fn staged(&self, key: ResourceKey) -> Attributes {
        self.entries
            .get(&key)
            .and_then(|entry| entry.local.clone())
            .unwrap_or_default()
    }

    /// Promotes `sent` into the remote layer. A local value is cleared only while it still equals
    /// what was sent; later edits stay staged on top of the promoted value. `deleted` promotes a
    /// sent delete. Returns the promoted keys.
    pub fn commit(&mut self, key: ResourceKey, sent: &Attributes, deleted: bool) -> Vec<String> {
        let entry = self.entries.entry(key).or_default();
        let mut promoted = Vec::new();
        for (name, value) in sent {
            if entry.remote.get(name) != Some(value) {
                entry.remote.insert(name.clone(), value.clone());
                promoted.push(name.clone());
            }
            if let Some(local) = entry.local.as_mut() {
                if local.get(name) == Some(value) {
                    local.remove(name);
                }
            }
        }
        entry.normalize();
        if deleted {
            entry.local_deleted = false;
            entry.remote_deleted = true;
        }
        promoted.sort();
        promoted
    }

    pub fn local_changes(&self, key: ResourceKey) -> Vec<AttributeChange> {
        let Some(entry) = self.entries.get(&key) else {
            return Vec::new();
        };
        let mut changes: Vec<_> = entry
            .local
            .iter()
            .flat_map(|local| local.iter())
            .map(|(name, value)| AttributeChange {
                key: name.clone(),
                remote: entry.remote.get(name).cloned(),
                local: value.clone(),
            })
            .collect();
        changes.sort_by(|a, b| a.key.cmp(&b.key));
        changes
    }

    pub fn has_local_changes(&self, key: ResourceKey) -> bool {
        self.entries
            .get(&key)
            .is_some_and(|entry| entry.local.is_some() || entry.local_deleted)
    }

    /// Returns whether the flag changed.
    pub fn mark_deleted_locally(&mut self, key: ResourceKey) -> bool {
        let entry = self.entries.entry(key).or_default();
        !std::mem::replace(&mut entry.local_deleted, true)
    }

    pub fn is_deleted(&self, key: ResourceKey) -> bool {
        self.entries
            .get(&key)
            .is_some_and(|entry| entry.remote_deleted || entry.local_deleted)
    }

    pub fn is_deleted_locally(&self, key: ResourceKey) -> bool {
        self.entries.get(&key).is_some_and(|entry| entry.local_deleted)
    }

    pub fn remove(&mut self, key: ResourceKey) -> Option<CacheEntry> {
        self.entries.remove(&key)
    }
}
