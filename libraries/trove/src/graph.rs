//! # Relationship graph
//! Membership of every belongsTo/hasMany relationship, per identity, in a remote layer and an
//! optional local overlay (mirroring the attribute cache).
//!
//! Edits that touch inverses are planned against a scratch view first and only applied once every
//! side of the edit has been resolved, so a failure half-way through leaves the graph untouched.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::document::Links;
use crate::error::{Error, Result};
use crate::identity::ResourceKey;

pub type Members = im::Vector<ResourceKey>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelationshipKind {
    BelongsTo,
    HasMany,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Layer {
    Remote,
    Local,
}

/// What the graph needs to know about one side of a relationship.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelationshipDefinition {
    pub type_name: String,
    pub name: String,
    pub kind: RelationshipKind,
    pub inverse: Option<String>,
}

#[derive(Clone, Debug)]
pub struct RelationshipState {
    pub kind: RelationshipKind,
    remote: Members,
    local: Option<Members>,
    received_data: bool,
    links: Option<Links>,
    meta: Option<Value>,
}

impl RelationshipState {
    fn new(kind: RelationshipKind) -> Self {
        Self {
            kind,
            remote: Members::new(),
            local: None,
            received_data: false,
            links: None,
            meta: None,
        }
    }

    /// Local overlay if any, else remote.
    pub fn members(&self) -> &Members {
        self.local.as_ref().unwrap_or(&self.remote)
    }

    pub fn remote(&self) -> &Members {
        &self.remote
    }

    pub fn local(&self) -> Option<&Members> {
        self.local.as_ref()
    }

    pub fn has_received_data(&self) -> bool {
        self.received_data
    }

    pub fn links(&self) -> Option<&Links> {
        self.links.as_ref()
    }

    pub fn meta(&self) -> Option<&Value> {
        self.meta.as_ref()
    }

    fn layer(&self, layer: Layer) -> &Members {
        match layer {
            Layer::Remote => &self.remote,
            Layer::Local => self.members(),
        }
    }

    fn set_layer(&mut self, layer: Layer, members: Members) {
        match layer {
            Layer::Remote => self.remote = members,
            Layer::Local => self.local = Some(members),
        }
        if self.local.as_ref() == Some(&self.remote) {
            self.local = None;
        }
    }
}

/// Which relationships reference each identity.
#[derive(Debug, Default)]
pub struct PresenceIndex {
    referenced_by: HashMap<ResourceKey, Vec<(ResourceKey, String)>>,
}

impl PresenceIndex {
    pub fn is_referenced(&self, key: ResourceKey) -> bool {
        self.referenced_by.contains_key(&key)
    }

    pub fn referrers(&self, key: ResourceKey) -> &[(ResourceKey, String)] {
        self.referenced_by
            .get(&key)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.referenced_by.len()
    }

    pub fn is_empty(&self) -> bool {
        self.referenced_by.is_empty()
    }
}

/// One (owner, relationship) pair.
pub type Edge = (ResourceKey, String);

#[derive(Debug, Default)]
pub struct RelationshipGraph {
    states: HashMap<ResourceKey, HashMap<String, RelationshipState>>,
}

struct Plan<'g> {
    graph: &'g RelationshipGraph,
    layer: Layer,
    pending: HashMap<Edge, (RelationshipKind, Members)>,
    order: Vec<Edge>,
}

impl Plan<'_> {
    fn current(&self, owner: ResourceKey, rel: &str) -> Members {
        if let Some((_, members)) = self.pending.get(&(owner, rel.to_string())) {
            return members.clone();
        }
        self.graph
            .state(owner, rel)
            .map(|state| state.layer(self.layer).clone())
            .unwrap_or_default()
    }

    fn set(&mut self, owner: ResourceKey, rel: &str, kind: RelationshipKind, members: Members) {
        let cell = (owner, rel.to_string());
        if !self.pending.contains_key(&cell) {
            self.order.push(cell.clone());
        }
        self.pending.insert(cell, (kind, members));
    }

    fn remove_member(
        &mut self,
        owner: ResourceKey,
        rel: &str,
        kind: RelationshipKind,
        member: ResourceKey,
    ) {
        let current = self.current(owner, rel);
        if current.contains(&member) {
            let kept = current.into_iter().filter(|m| *m != member).collect();
            self.set(owner, rel, kind, kept);
        }
    }

    fn add_member(
        &mut self,
        owner: ResourceKey,
        rel: &str,
        kind: RelationshipKind,
        member: ResourceKey,
    ) {
        let mut current = self.current(owner, rel);
        if !current.contains(&member) {
            current.push_back(member);
            self.set(owner, rel, kind, current);
        }
    }
}

fn dedupe(members: impl IntoIterator<Item = ResourceKey>) -> Members {
    let mut seen = HashSet::new();
    members.into_iter().filter(|m| seen.insert(*m)).collect()
}

impl RelationshipGraph {
    pub fn state(&self, owner: ResourceKey, rel: &str) -> Option<&RelationshipState> {
        self.states.get(&owner).and_then(|rels| rels.get(rel))
    }

    /// Relationship names with state for `owner`.
    pub fn relationships(&self, owner: ResourceKey) -> Vec<String> {
        let mut names: Vec<_> = self
            .states
            .get(&owner)
            .map(|rels| rels.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn members(&self, owner: ResourceKey, rel: &str) -> Members {
        self.state(owner, rel)
            .map(|state| state.members().clone())
            .unwrap_or_default()
    }

    pub fn has_local_changes(&self, owner: ResourceKey) -> bool {
        self.states
            .get(&owner)
            .is_some_and(|rels| rels.values().any(|state| state.local.is_some()))
    }

    /// Relationship names of `owner` that carry a local overlay.
    pub fn locally_changed(&self, owner: ResourceKey) -> Vec<String> {
        let mut names: Vec<_> = self
            .states
            .get(&owner)
            .map(|rels| {
                rels.iter()
                    .filter(|(_, state)| state.local.is_some())
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Records links/meta from a relationship payload.
    pub fn set_links(
        &mut self,
        owner: ResourceKey,
        rel: &str,
        kind: RelationshipKind,
        links: Option<Links>,
        meta: Option<Value>,
    ) -> bool {
        let state = self
            .states
            .entry(owner)
            .or_default()
            .entry(rel.to_string())
            .or_insert_with(|| RelationshipState::new(kind));
        let mut changed = false;
        if links.is_some() && state.links != links {
            state.links = links;
            changed = true;
        }
        if meta.is_some() && state.meta != meta {
            state.meta = meta;
            changed = true;
        }
        changed
    }

    /// Replaces the membership of `owner.rel` in `layer`, applying the symmetric edit to every
    /// inverse. `definition` resolves the relationship definition of any (identity, relationship)
    /// pair the edit reaches. Returns every cell whose visible membership changed.
    pub fn replace_membership<F>(
        &mut self,
        owner: ResourceKey,
        rel: &str,
        members: impl IntoIterator<Item = ResourceKey>,
        layer: Layer,
        definition: F,
    ) -> Result<Vec<Edge>>
    where
        F: Fn(ResourceKey, &str) -> Result<RelationshipDefinition>,
    {
        let def = definition(owner, rel)?;
        let new = dedupe(members);
        if def.kind == RelationshipKind::BelongsTo && new.len() > 1 {
            return Err(Error::invalid_value(
                &def.name,
                &def.type_name,
                "a belongsTo relationship holds at most one member",
            ));
        }

        let mut plan = Plan {
            graph: self,
            layer,
            pending: HashMap::new(),
            order: Vec::new(),
        };

        let old = plan.current(owner, rel);
        plan.set(owner, rel, def.kind, new.clone());

        if let Some(inverse) = &def.inverse {
            let old_set: HashSet<_> = old.iter().copied().collect();
            let new_set: HashSet<_> = new.iter().copied().collect();

            for removed in old.iter().filter(|m| !new_set.contains(*m)) {
                let inverse_def = Self::inverse_definition(&definition, *removed, inverse, &def)?;
                plan.remove_member(*removed, inverse, inverse_def.kind, owner);
            }

            for added in new.iter().filter(|m| !old_set.contains(*m)) {
                let inverse_def = Self::inverse_definition(&definition, *added, inverse, &def)?;
                match inverse_def.kind {
                    RelationshipKind::HasMany => {
                        plan.add_member(*added, inverse, RelationshipKind::HasMany, owner);
                    }
                    RelationshipKind::BelongsTo => {
                        // The member leaves whatever it pointed at before.
                        for previous in plan.current(*added, inverse) {
                            if previous != owner {
                                plan.remove_member(previous, rel, def.kind, *added);
                            }
                        }
                        plan.set(
                            *added,
                            inverse,
                            RelationshipKind::BelongsTo,
                            im::vector![owner],
                        );
                    }
                }
            }
        }

        let Plan { pending, order, .. } = plan;
        Ok(self.apply(pending, order, layer, (owner, rel)))
    }

    fn inverse_definition<F>(
        definition: &F,
        member: ResourceKey,
        inverse: &str,
        def: &RelationshipDefinition,
    ) -> Result<RelationshipDefinition>
    where
        F: Fn(ResourceKey, &str) -> Result<RelationshipDefinition>,
    {
        let inverse_def = definition(member, inverse)?;
        if inverse_def.inverse.as_deref() != Some(def.name.as_str()) {
            return Err(Error::InvalidSchema {
                type_name: inverse_def.type_name.clone(),
                reason: format!(
                    "`{}` is declared as the inverse of `{}.{}` but names `{}` as its own inverse",
                    inverse,
                    def.type_name,
                    def.name,
                    inverse_def.inverse.as_deref().unwrap_or("nothing")
                ),
            });
        }
        Ok(inverse_def)
    }

    fn apply(
        &mut self,
        mut pending: HashMap<Edge, (RelationshipKind, Members)>,
        order: Vec<Edge>,
        layer: Layer,
        direct: (ResourceKey, &str),
    ) -> Vec<Edge> {
        let mut touched = Vec::new();
        for cell in order {
            let Some((kind, members)) = pending.remove(&cell) else {
                continue;
            };
            let state = self
                .states
                .entry(cell.0)
                .or_default()
                .entry(cell.1.clone())
                .or_insert_with(|| RelationshipState::new(kind));
            let before = state.members().clone();
            state.set_layer(layer, members);
            if layer == Layer::Remote && cell.0 == direct.0 && cell.1 == direct.1 {
                state.received_data = true;
            }
            if *state.members() != before {
                touched.push(cell);
            }
        }
        touched
    }

    /// Reverts every local overlay of `owner`, undoing the inverse edits they caused.
    pub fn rollback<F>(&mut self, owner: ResourceKey, definition: F) -> Result<Vec<Edge>>
    where
        F: Fn(ResourceKey, &str) -> Result<RelationshipDefinition>,
    {
        let mut touched = Vec::new();
        for rel in self.locally_changed(owner) {
            let remote = self
                .state(owner, &rel)
                .map(|state| state.remote.clone())
                .unwrap_or_default();
            let edges = self.replace_membership(owner, &rel, remote, Layer::Local, &definition)?;
            touched.extend(edges);
        }
        Ok(touched)
    }

    /// The local overlays of `owner` as they stand now, for handing to
    /// [`RelationshipGraph::commit`] once the server has accepted them.
    pub fn staged(&self, owner: ResourceKey) -> Vec<(String, Members)> {
        self.locally_changed(owner)
            .into_iter()
            .filter_map(|rel| {
                let local = self.state(owner, &rel)?.local.clone()?;
                Some((rel, local))
            })
            .collect()
    }

    /// Promotes `sent` memberships of `owner` into the remote layer, inverses included. An
    /// overlay changed after sending stays staged on top of the promoted membership.
    pub fn commit<F>(
        &mut self,
        owner: ResourceKey,
        sent: Vec<(String, Members)>,
        definition: F,
    ) -> Result<Vec<Edge>>
    where
        F: Fn(ResourceKey, &str) -> Result<RelationshipDefinition>,
    {
        let mut touched = Vec::new();
        for (rel, members) in sent {
            let edges = self.replace_membership(owner, &rel, members, Layer::Remote, &definition)?;
            touched.extend(edges);
        }
        Ok(touched)
    }

    /// Removes `key` from every relationship that references it and drops its own relationship
    /// state. Returns every cell whose visible membership changed.
    pub fn detach(&mut self, key: ResourceKey) -> Vec<Edge> {
        let mut touched = Vec::new();
        for (owner, rels) in self.states.iter_mut() {
            if *owner == key {
                continue;
            }
            for (name, state) in rels.iter_mut() {
                let before = state.members().clone();
                if !before.contains(&key) && !state.remote.contains(&key) {
                    continue;
                }
                state.remote.retain(|m| *m != key);
                if let Some(local) = &mut state.local {
                    local.retain(|m| *m != key);
                }
                if state.local.as_ref() == Some(&state.remote) {
                    state.local = None;
                }
                if *state.members() != before {
                    touched.push((*owner, name.clone()));
                }
            }
        }
        if let Some(own) = self.states.remove(&key) {
            touched.extend(own.into_keys().map(|rel| (key, rel)));
        }
        touched
    }

    pub fn presence(&self) -> PresenceIndex {
        let mut index = PresenceIndex::default();
        for (owner, rels) in &self.states {
            for (name, state) in rels {
                let mut members: HashSet<ResourceKey> = state.remote.iter().copied().collect();
                if let Some(local) = &state.local {
                    members.extend(local.iter().copied());
                }
                for member in members {
                    index
                        .referenced_by
                        .entry(member)
                        .or_default()
                        .push((*owner, name.clone()));
                }
            }
        }
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    struct Fixture {
        keys: Vec<ResourceKey>,
    }

    impl Fixture {
        fn new(n: usize) -> Self {
            let mut map: SlotMap<ResourceKey, ()> = SlotMap::with_key();
            Self {
                keys: (0..n).map(|_| map.insert(())).collect(),
            }
        }
    }

    /// `friends <-> friends` on users, `posts <-> author` between users and posts. Keys at
    /// index 3 and above are posts.
    fn definitions(
        keys: Vec<ResourceKey>,
    ) -> impl Fn(ResourceKey, &str) -> Result<RelationshipDefinition> {
        move |key, rel| {
            let is_post = keys.iter().position(|k| *k == key).is_some_and(|i| i >= 3);
            let def = |type_name: &str, kind, inverse: &str| RelationshipDefinition {
                type_name: type_name.to_string(),
                name: rel.to_string(),
                kind,
                inverse: Some(inverse.to_string()),
            };
            match (is_post, rel) {
                (false, "friends") => Ok(def("user", RelationshipKind::HasMany, "friends")),
                (false, "posts") => Ok(def("user", RelationshipKind::HasMany, "author")),
                (true, "author") => Ok(def("post", RelationshipKind::BelongsTo, "posts")),
                _ => Err(Error::UnknownField {
                    field: rel.to_string(),
                    type_name: if is_post { "post" } else { "user" }.to_string(),
                }),
            }
        }
    }

    #[test]
    fn inverse_membership_follows_replacement() {
        let f = Fixture::new(3);
        let [a, b, c] = [f.keys[0], f.keys[1], f.keys[2]];
        let defs = definitions(f.keys.clone());
        let mut graph = RelationshipGraph::default();

        graph
            .replace_membership(a, "friends", [b], Layer::Remote, &defs)
            .unwrap();
        assert_eq!(graph.members(b, "friends"), im::vector![a]);

        let touched = graph
            .replace_membership(a, "friends", [c], Layer::Remote, &defs)
            .unwrap();
        assert_eq!(graph.members(a, "friends"), im::vector![c]);
        assert!(graph.members(b, "friends").is_empty());
        assert_eq!(graph.members(c, "friends"), im::vector![a]);
        assert_eq!(touched.len(), 3);
    }

    #[test]
    fn reordering_resequences_without_inverse_edits() {
        let f = Fixture::new(3);
        let [a, b, c] = [f.keys[0], f.keys[1], f.keys[2]];
        let defs = definitions(f.keys.clone());
        let mut graph = RelationshipGraph::default();

        graph
            .replace_membership(a, "friends", [b, c], Layer::Remote, &defs)
            .unwrap();
        let touched = graph
            .replace_membership(a, "friends", [c, b], Layer::Remote, &defs)
            .unwrap();
        assert_eq!(graph.members(a, "friends"), im::vector![c, b]);
        assert_eq!(touched, vec![(a, "friends".to_string())]);
    }

    #[test]
    fn belongs_to_inverse_moves_the_member() {
        let f = Fixture::new(5);
        let [a, b, post] = [f.keys[0], f.keys[1], f.keys[3]];
        let defs = definitions(f.keys.clone());
        let mut graph = RelationshipGraph::default();

        graph
            .replace_membership(a, "posts", [post], Layer::Remote, &defs)
            .unwrap();
        assert_eq!(graph.members(post, "author"), im::vector![a]);

        // b claiming the post takes it away from a.
        graph
            .replace_membership(b, "posts", [post], Layer::Remote, &defs)
            .unwrap();
        assert_eq!(graph.members(post, "author"), im::vector![b]);
        assert!(graph.members(a, "posts").is_empty());
    }

    #[test]
    fn failed_inverse_resolution_leaves_no_partial_state() {
        let f = Fixture::new(5);
        let [a, b, post] = [f.keys[0], f.keys[1], f.keys[3]];
        let defs = definitions(f.keys.clone());
        let mut graph = RelationshipGraph::default();
        graph
            .replace_membership(a, "friends", [b], Layer::Remote, &defs)
            .unwrap();

        // A post has no `friends` relationship to hold the inverse.
        let result = graph.replace_membership(a, "friends", [b, post], Layer::Remote, &defs);
        assert!(result.is_err());
        assert_eq!(graph.members(a, "friends"), im::vector![b]);
        assert!(graph.state(post, "friends").is_none());
    }

    #[test]
    fn local_edits_roll_back_on_both_sides() {
        let f = Fixture::new(3);
        let [a, b, c] = [f.keys[0], f.keys[1], f.keys[2]];
        let defs = definitions(f.keys.clone());
        let mut graph = RelationshipGraph::default();
        graph
            .replace_membership(a, "friends", [b], Layer::Remote, &defs)
            .unwrap();

        graph
            .replace_membership(a, "friends", [b, c], Layer::Local, &defs)
            .unwrap();
        assert_eq!(graph.members(c, "friends"), im::vector![a]);
        assert!(graph.state(c, "friends").unwrap().remote().is_empty());
        assert!(graph.has_local_changes(a));

        graph.rollback(a, &defs).unwrap();
        assert_eq!(graph.members(a, "friends"), im::vector![b]);
        assert!(graph.members(c, "friends").is_empty());
        assert!(!graph.has_local_changes(a));
        assert!(!graph.has_local_changes(c));
    }

    #[test]
    fn commit_promotes_both_sides() {
        let f = Fixture::new(3);
        let [a, b] = [f.keys[0], f.keys[1]];
        let defs = definitions(f.keys.clone());
        let mut graph = RelationshipGraph::default();

        graph
            .replace_membership(a, "friends", [b], Layer::Local, &defs)
            .unwrap();
        let staged = graph.staged(a);
        graph.commit(a, staged, &defs).unwrap();
        assert_eq!(graph.state(a, "friends").unwrap().remote(), &im::vector![b]);
        assert_eq!(graph.state(b, "friends").unwrap().remote(), &im::vector![a]);
        assert!(!graph.has_local_changes(a));
        assert!(!graph.has_local_changes(b));
    }

    #[test]
    fn commit_keeps_overlays_changed_after_sending() {
        let f = Fixture::new(3);
        let [a, b, c] = [f.keys[0], f.keys[1], f.keys[2]];
        let defs = definitions(f.keys.clone());
        let mut graph = RelationshipGraph::default();

        graph
            .replace_membership(a, "friends", [b], Layer::Local, &defs)
            .unwrap();
        let sent = graph.staged(a);
        graph
            .replace_membership(a, "friends", [b, c], Layer::Local, &defs)
            .unwrap();

        graph.commit(a, sent, &defs).unwrap();
        assert_eq!(graph.state(a, "friends").unwrap().remote(), &im::vector![b]);
        assert_eq!(graph.members(a, "friends"), im::vector![b, c]);
        assert!(graph.has_local_changes(a));
        assert!(!graph.has_local_changes(b));
        assert!(graph.has_local_changes(c));
    }

    #[test]
    fn detach_removes_every_reference() {
        let f = Fixture::new(3);
        let [a, b, c] = [f.keys[0], f.keys[1], f.keys[2]];
        let defs = definitions(f.keys.clone());
        let mut graph = RelationshipGraph::default();
        graph
            .replace_membership(a, "friends", [b, c], Layer::Remote, &defs)
            .unwrap();

        graph.detach(b);
        assert_eq!(graph.members(a, "friends"), im::vector![c]);
        assert!(graph.state(b, "friends").is_none());
        assert!(!graph.presence().is_referenced(b));
        assert!(graph.presence().is_referenced(c));
    }
}
