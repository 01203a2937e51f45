//! Data-quality reports. These describe problems with the data the server sent rather than with the
//! calling code, so they never abort a merge: they are logged, queued on the store and handed to
//! any report listeners.

use std::collections::{HashSet, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::graph::PresenceIndex;
use crate::identity::{IdentityRegistry, ResourceIdentifier, ResourceKey};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Warn,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReportKind {
    /// A hasMany without an inverse was read before the server ever sent its linkage.
    MissingLinkage {
        owner: ResourceIdentifier,
        relationship: String,
    },
    /// An included resource no relationship points at.
    UnreachableIncluded { resource: ResourceIdentifier },
    /// The same resource object appeared more than once in one document.
    DuplicateResource { resource: ResourceIdentifier },
    /// Linkage named a member of a type the relationship does not accept. The member was dropped.
    UnexpectedMemberType {
        owner: ResourceIdentifier,
        relationship: String,
        member: ResourceIdentifier,
        expected: String,
    },
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportKind::MissingLinkage {
                owner,
                relationship,
            } => write!(
                f,
                "`{relationship}` on {} was read but the server never sent its linkage",
                describe(owner)
            ),
            ReportKind::UnreachableIncluded { resource } => write!(
                f,
                "included resource {} is not referenced by any relationship",
                describe(resource)
            ),
            ReportKind::DuplicateResource { resource } => write!(
                f,
                "resource {} appears more than once in the document",
                describe(resource)
            ),
            ReportKind::UnexpectedMemberType {
                owner,
                relationship,
                member,
                expected,
            } => write!(
                f,
                "`{relationship}` on {} holds `{expected}` resources but was sent {}",
                describe(owner),
                describe(member)
            ),
        }
    }
}

fn describe(identifier: &ResourceIdentifier) -> String {
    match &identifier.id {
        Some(id) => format!("{}:{id}", identifier.resource_type),
        None => format!("{}:{}", identifier.resource_type, identifier.lid),
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DataQualityReport {
    pub kind: ReportKind,
    pub severity: Severity,
    pub reported_at: DateTime<Utc>,
}

impl DataQualityReport {
    pub fn new(kind: ReportKind, severity: Severity) -> Self {
        Self {
            kind,
            severity,
            reported_at: Utc::now(),
        }
    }

    pub(crate) fn log(&self) {
        match self.severity {
            Severity::Warn => log::warn!("Data quality: {}", self.kind),
            Severity::Error => log::error!("Data quality: {}", self.kind),
        }
    }
}

/// Inspects every pushed document after it has been merged. Validators only report; they never
/// change the store.
pub trait DocumentValidator {
    fn validate(
        &self,
        document: &Document,
        presence: &PresenceIndex,
        identities: &IdentityRegistry,
    ) -> Vec<ReportKind>;
}

/// Reports resource objects that appear twice in one document and included resources that
/// neither the document nor anything else in the store links to.
pub struct LinkageValidator;

impl DocumentValidator for LinkageValidator {
    fn validate(
        &self,
        document: &Document,
        presence: &PresenceIndex,
        identities: &IdentityRegistry,
    ) -> Vec<ReportKind> {
        let lookup = |resource_type: &str, id: Option<&str>, lid: Option<&str>| {
            identities.peek(resource_type, id, lid)
        };
        let identifier = |key: ResourceKey| identities.identifier(key).cloned();

        let mut reports = Vec::new();
        let mut in_document = HashSet::new();
        for resource in document.resources() {
            let Some(key) = lookup(
                &resource.resource_type,
                resource.id.as_deref(),
                resource.lid.as_deref(),
            ) else {
                continue;
            };
            if !in_document.insert(key) {
                if let Some(resource) = identifier(key) {
                    reports.push(ReportKind::DuplicateResource { resource });
                }
            }
        }

        let mut reachable = HashSet::new();
        let mut queue: VecDeque<_> = document.primary().iter().collect();
        for resource in document.primary() {
            if let Some(key) = lookup(
                &resource.resource_type,
                resource.id.as_deref(),
                resource.lid.as_deref(),
            ) {
                reachable.insert(key);
            }
        }
        while let Some(resource) = queue.pop_front() {
            let linked = resource
                .relationships
                .values()
                .filter_map(|payload| payload.data.as_ref().and_then(Option::as_ref))
                .flat_map(|linkage| linkage.identifiers());
            for target in linked {
                let Some(key) = lookup(
                    &target.resource_type,
                    target.id.as_deref(),
                    target.lid.as_deref(),
                ) else {
                    continue;
                };
                if reachable.insert(key) {
                    queue.extend(document.included.iter().filter(|included| {
                        lookup(
                            &included.resource_type,
                            included.id.as_deref(),
                            included.lid.as_deref(),
                        ) == Some(key)
                    }));
                }
            }
        }

        let mut reported = HashSet::new();
        for included in &document.included {
            let Some(key) = lookup(
                &included.resource_type,
                included.id.as_deref(),
                included.lid.as_deref(),
            ) else {
                continue;
            };
            let referenced_elsewhere = presence
                .referrers(key)
                .iter()
                .any(|(owner, _)| !in_document.contains(owner));
            if !reachable.contains(&key) && !referenced_elsewhere && reported.insert(key) {
                if let Some(resource) = identifier(key) {
                    reports.push(ReportKind::UnreachableIncluded { resource });
                }
            }
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn register(identities: &mut IdentityRegistry, document: &Document) {
        for resource in document.resources() {
            identities
                .identity_for(&resource.resource_type, resource.id.as_deref(), None)
                .unwrap();
        }
    }

    #[test]
    fn reports_duplicates_and_orphans() {
        let document = Document::from_json(&json!({
            "data": {
                "type": "user", "id": "1",
                "relationships": { "pet": { "data": { "type": "dog", "id": "1" } } }
            },
            "included": [
                { "type": "dog", "id": "1" },
                { "type": "dog", "id": "1" },
                { "type": "cat", "id": "7" }
            ]
        }))
        .unwrap();
        let mut identities = IdentityRegistry::default();
        register(&mut identities, &document);

        let reports = LinkageValidator.validate(&document, &PresenceIndex::default(), &identities);
        assert_eq!(reports.len(), 2);
        assert!(matches!(
            &reports[0],
            ReportKind::DuplicateResource { resource } if resource.resource_type == "dog"
        ));
        assert!(matches!(
            &reports[1],
            ReportKind::UnreachableIncluded { resource } if resource.resource_type == "cat"
        ));
    }

    #[test]
    fn reports_render_readably() {
        let report = ReportKind::MissingLinkage {
            owner: ResourceIdentifier {
                resource_type: "user".into(),
                id: Some("1".into()),
                lid: "@lid:x".into(),
            },
            relationship: "pets".into(),
        };
        assert_eq!(
            report.to_string(),
            "`pets` on user:1 was read but the server never sent its linkage"
        );

        let report = ReportKind::UnexpectedMemberType {
            owner: ResourceIdentifier {
                resource_type: "user".into(),
                id: Some("1".into()),
                lid: "@lid:x".into(),
            },
            relationship: "pets".into(),
            member: ResourceIdentifier {
                resource_type: "car".into(),
                id: Some("7".into()),
                lid: "@lid:y".into(),
            },
            expected: "pet".into(),
        };
        assert_eq!(
            report.to_string(),
            "`pets` on user:1 holds `pet` resources but was sent car:7"
        );
    }
}
