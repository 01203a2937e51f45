//! The network collaborator. The store never builds requests itself: it hands a URL or a patch to
//! a [`Network`] and merges whatever document comes back.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;

use crate::document::{Document, Patch, ResourceObject};

pub trait Network {
    type Error: std::error::Error + 'static;

    fn fetch(&self, url: &str) -> impl Future<Output = Result<Document, Self::Error>>;

    /// Sends a patch and resolves to the server's acknowledgement. The primary resource of the
    /// acknowledgement (if any) is merged as the new remote state of the saved record.
    fn save(&self, patch: &Patch) -> impl Future<Output = Result<Document, Self::Error>>;
}

#[derive(Debug, thiserror::Error)]
pub enum MemoryNetworkError {
    #[error("no document registered for `{0}`")]
    NotFound(String),
    #[error("the save was rejected")]
    Rejected,
}

/// Serves canned documents and acknowledges saves by echoing the patch back, assigning server ids
/// to created resources. Used by tests.
#[derive(Default)]
pub struct MemoryNetwork {
    documents: RefCell<HashMap<String, Document>>,
    saved: RefCell<Vec<Patch>>,
    reject_saves: Cell<bool>,
    next_id: Cell<u64>,
}

impl MemoryNetwork {
    pub fn serve(&self, url: impl Into<String>, document: Document) {
        self.documents.borrow_mut().insert(url.into(), document);
    }

    pub fn reject_saves(&self, reject: bool) {
        self.reject_saves.set(reject);
    }

    /// Every patch that reached [`Network::save`], accepted or not.
    pub fn saved(&self) -> Vec<Patch> {
        self.saved.borrow().clone()
    }

    fn acknowledge(&self, patch: &Patch) -> Document {
        let id = patch.data.id.clone().unwrap_or_else(|| {
            let next = self.next_id.get() + 1;
            self.next_id.set(next);
            format!("server-{next}")
        });
        let mut resource = ResourceObject::new(patch.data.resource_type.clone(), Some(&id));
        resource.lid = patch.data.lid.clone();
        resource.attributes = patch.data.attributes.clone();
        Document::single(resource)
    }
}

impl Network for MemoryNetwork {
    type Error = MemoryNetworkError;

    async fn fetch(&self, url: &str) -> Result<Document, Self::Error> {
        self.documents
            .borrow()
            .get(url)
            .cloned()
            .ok_or_else(|| MemoryNetworkError::NotFound(url.to_string()))
    }

    async fn save(&self, patch: &Patch) -> Result<Document, Self::Error> {
        self.saved.borrow_mut().push(patch.clone());
        if self.reject_saves.get() {
            return Err(MemoryNetworkError::Rejected);
        }
        Ok(self.acknowledge(patch))
    }
}
