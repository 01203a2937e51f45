//! This is a client-side cache for graph-shaped resource data (JSON:API style documents).
//!
//! How it fits together:
//! 1. Documents are pushed into a [`Store`]. Every resource gets exactly one identity for the
//!    lifetime of the store, even if it first shows up with only a local id.
//! 2. Attributes land in a *remote* layer. Relationships land in a graph that keeps declared
//!    inverses in sync on both sides.
//! 3. Callers read through [`Record`]s. Every field is memoized in a small reactive graph, so
//!    reading a field twice without a change in between returns the very same value, and a field
//!    only recomputes when something it read changed.
//! 4. To edit, a caller checks out an editable record. Writes go to a *local* layer that can be
//!    diffed into a save patch, acknowledged by the server, or rolled back.
//!
//! Embedded objects and arrays keep their identity (and so their `Rc`) across updates unless the
//! fields their identity is computed from change.

pub mod cache;
mod checkout;
pub mod config;
pub mod diagnostics;
pub mod document;
mod embedded;
pub mod error;
pub mod graph;
pub mod identity;
mod many_array;
pub mod network;
pub mod reactive;
mod record;
pub mod schema;
mod store;
pub mod transforms;

pub use cache::AttributeChange;
pub use config::StoreConfig;
pub use diagnostics::{DataQualityReport, DocumentValidator, LinkageValidator, ReportKind, Severity};
pub use document::{
    Document, IdentifierObject, Link, Linkage, Links, Patch, PatchData, PrimaryData,
    RelationshipPayload, ResourceObject, SaveOp,
};
pub use embedded::{EmbeddedArray, EmbeddedObject};
pub use error::{Error, Result};
pub use graph::{Layer, PresenceIndex, RelationshipKind};
pub use identity::{ResourceIdentifier, ResourceKey};
pub use many_array::ManyArray;
pub use network::{MemoryNetwork, MemoryNetworkError, Network};
pub use reactive::ListenerKey;
pub use record::{FieldReader, FieldValue, Mode, Record};
pub use schema::{FieldKind, FieldSchema, IdentityStrategy, ResourceSchema};
pub use store::Store;
pub use transforms::Transformation;
