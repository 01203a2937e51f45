//! Commit side of a checkout: turning what an identity holds locally into a save patch.

use std::collections::BTreeMap;

use serde_json::Map;

use crate::cache::Cache;
use crate::document::{IdentifierObject, Linkage, Patch, PatchData, RelationshipPayload, SaveOp};
use crate::error::{Error, Result};
use crate::graph::{Members, RelationshipGraph, RelationshipKind};
use crate::identity::{IdentityRegistry, ResourceKey};
use crate::schema::ResourceSchema;

/// Linkage for a membership list. Members without a server id are referenced by lid.
pub(crate) fn relationship_payload(
    identities: &IdentityRegistry,
    kind: RelationshipKind,
    members: &Members,
) -> Result<RelationshipPayload> {
    let identifiers = members
        .iter()
        .map(|member| {
            let identifier = identities.identifier(*member)?;
            Some(IdentifierObject {
                resource_type: identifier.resource_type.clone(),
                id: identifier.id.clone(),
                lid: identifier
                    .id
                    .is_none()
                    .then(|| identifier.lid.clone()),
            })
        })
        .collect::<Option<Vec<_>>>()
        .ok_or(Error::UnknownIdentity)?;
    let data = match kind {
        RelationshipKind::BelongsTo => identifiers.into_iter().next().map(Linkage::One),
        RelationshipKind::HasMany => Some(Linkage::Many(identifiers)),
    };
    Ok(RelationshipPayload {
        data: Some(data),
        links: None,
        meta: None,
    })
}

/// Builds the patch for `key`: a delete when one is staged, a create (with every known field)
/// when the identity has no server id yet, otherwise an update carrying only local changes.
pub(crate) fn build_patch(
    identities: &IdentityRegistry,
    cache: &Cache,
    graph: &RelationshipGraph,
    schema: Option<&ResourceSchema>,
    key: ResourceKey,
) -> Result<Patch> {
    let identifier = identities.identifier(key).ok_or(Error::UnknownIdentity)?;
    let op = if cache.is_deleted_locally(key) {
        SaveOp::Delete
    } else if identifier.id.is_none() {
        SaveOp::Create
    } else {
        SaveOp::Update
    };

    let wire_key = |rel: &str| {
        schema
            .and_then(|schema| schema.get(rel))
            .map(|field| field.key().to_string())
            .unwrap_or_else(|| rel.to_string())
    };

    let mut attributes = Map::new();
    let mut relationships = BTreeMap::new();
    match op {
        SaveOp::Delete => {}
        SaveOp::Create => {
            if let Some(entry) = cache.entry(key) {
                attributes.extend(entry.merged());
            }
            for rel in graph.relationships(key) {
                if let Some(state) = graph.state(key, &rel) {
                    let payload = relationship_payload(identities, state.kind, state.members())?;
                    relationships.insert(wire_key(&rel), payload);
                }
            }
        }
        SaveOp::Update => {
            for change in cache.local_changes(key) {
                attributes.insert(change.key, change.local);
            }
            for rel in graph.locally_changed(key) {
                if let Some(state) = graph.state(key, &rel) {
                    let payload = relationship_payload(identities, state.kind, state.members())?;
                    relationships.insert(wire_key(&rel), payload);
                }
            }
        }
    }

    Ok(Patch {
        op,
        data: PatchData {
            resource_type: identifier.resource_type.clone(),
            id: identifier.id.clone(),
            lid: (op == SaveOp::Create).then(|| identifier.lid.clone()),
            attributes,
            relationships,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Layer, RelationshipDefinition};
    use serde_json::json;

    fn friends(_: ResourceKey, rel: &str) -> Result<RelationshipDefinition> {
        Ok(RelationshipDefinition {
            type_name: "user".into(),
            name: rel.into(),
            kind: RelationshipKind::HasMany,
            inverse: Some("friends".into()),
        })
    }

    #[test]
    fn updates_carry_only_local_changes() {
        let mut identities = IdentityRegistry::default();
        let (one, _) = identities.identity_for("user", Some("1"), None).unwrap();
        let (two, _) = identities.identity_for("user", Some("2"), None).unwrap();
        let mut cache = Cache::default();
        let mut graph = RelationshipGraph::default();

        let attrs = json!({ "name": "Leo", "age": 3 });
        cache.merge_attributes(one, attrs.as_object().unwrap(), None);
        cache.set_local(one, "age", json!(4));
        graph
            .replace_membership(one, "friends", [two], Layer::Local, friends)
            .unwrap();

        let patch = build_patch(&identities, &cache, &graph, None, one).unwrap();
        assert_eq!(patch.op, SaveOp::Update);
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!({
                "data": {
                    "type": "user",
                    "id": "1",
                    "attributes": { "age": 4 },
                    "relationships": {
                        "friends": { "data": [{ "type": "user", "id": "2" }] }
                    }
                }
            })
        );
    }

    #[test]
    fn lid_only_identities_create_and_staged_deletes_delete() {
        let mut identities = IdentityRegistry::default();
        let (fresh, _) = identities.identity_for("user", None, Some("@lid:new")).unwrap();
        let mut cache = Cache::default();
        let graph = RelationshipGraph::default();
        cache.set_local(fresh, "name", json!("Ada"));

        let patch = build_patch(&identities, &cache, &graph, None, fresh).unwrap();
        assert_eq!(patch.op, SaveOp::Create);
        assert_eq!(patch.data.lid.as_deref(), Some("@lid:new"));
        assert_eq!(patch.data.attributes.get("name"), Some(&json!("Ada")));

        cache.mark_deleted_locally(fresh);
        let patch = build_patch(&identities, &cache, &graph, None, fresh).unwrap();
        assert_eq!(patch.op, SaveOp::Delete);
        assert!(patch.data.attributes.is_empty());
    }
}
