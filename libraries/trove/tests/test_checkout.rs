mod common;

use std::cell::RefCell;
use std::rc::Rc;

use futures::FutureExt;
use futures::channel::oneshot;
use futures::executor::block_on;
use serde_json::json;
use trove::{Document, Error, MemoryNetwork, MemoryNetworkError, Mode, Network, Patch, SaveOp};

use common::{single, store, user};

#[test]
fn test_writes_on_immutable_records_fail_and_change_nothing() {
    let store = store();
    store
        .push_json(&single(json!({
            "type": "user",
            "id": "1",
            "attributes": {
                "first_name": "Leo",
                "address": { "street": "1 Main St", "zip": "10001", "state": "NY" },
                "tags": ["a"]
            }
        })))
        .unwrap();
    let leo = store.record("user", "1").unwrap();
    let ada = store.record("user", "2").unwrap();

    assert!(matches!(
        leo.set("firstName", json!("Max")),
        Err(Error::NotEditable { field, .. }) if field == "firstName"
    ));
    assert!(matches!(
        leo.object("address").unwrap().unwrap().set("state", json!("CA")),
        Err(Error::NotEditable { .. })
    ));
    assert!(matches!(
        leo.array("tags").unwrap().unwrap().push(json!("b")),
        Err(Error::NotEditable { .. })
    ));
    assert!(matches!(
        leo.has_many("friends").unwrap().push(&ada),
        Err(Error::NotEditable { .. })
    ));
    assert!(matches!(leo.delete(), Err(Error::NotEditable { .. })));

    assert_eq!(leo.value("firstName").unwrap(), json!("Leo"));
    assert!(!store.has_changes(leo.key()));
    assert!(ada.has_many("friends").unwrap().is_empty().unwrap());
}

#[test]
fn test_editable_writes_show_through_both_projections() {
    let store = store();
    store.push_json(&single(user("1", "Leo"))).unwrap();
    let leo = store.record("user", "1").unwrap();
    let editable = block_on(store.checkout(&leo)).unwrap();
    assert_eq!(editable.mode(), Mode::Editable);

    editable.set("firstName", json!("Max")).unwrap();
    assert_eq!(leo.value("firstName").unwrap(), json!("Max"));
    assert_eq!(leo.value("fullName").unwrap(), json!("Max Smith"));
    assert_eq!(
        store.get_remote_attr(leo.key(), "firstName").unwrap(),
        json!("Leo")
    );

    let changes = store.changed_attributes(leo.key());
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].key, "first_name");
    assert_eq!(changes[0].remote, Some(json!("Leo")));

    // Writing the remote value back clears the overlay.
    editable.set("firstName", json!("Leo")).unwrap();
    assert!(!store.has_changes(leo.key()));
}

#[test]
fn test_writes_are_shape_checked() {
    let store = store();
    store.push_json(&single(user("1", "Leo"))).unwrap();
    let leo = store.projection_for(store.lookup("user", "1").unwrap(), Mode::Editable).unwrap();

    assert!(matches!(
        leo.set("address", json!({ "street": "x", "country": "FR" })),
        Err(Error::UnknownField { field, .. }) if field == "country"
    ));
    assert!(matches!(
        leo.set("tags", json!("a")),
        Err(Error::InvalidValue { .. })
    ));
    assert!(matches!(
        leo.set("friends", json!([])),
        Err(Error::InvalidValue { .. })
    ));
    assert!(matches!(
        leo.set("age", json!("old")),
        Err(Error::Transform { .. })
    ));
    assert!(!store.has_changes(leo.key()));
}

#[test]
fn test_rollback_is_idempotent() {
    let store = store();
    store
        .push_json(&single(json!({
            "type": "user",
            "id": "1",
            "attributes": { "first_name": "Leo", "tags": ["a"] },
            "relationships": { "friends": { "data": [{ "type": "user", "id": "2" }] } }
        })))
        .unwrap();
    let leo = store.record("user", "1").unwrap();
    let before = store.peek(leo.key()).unwrap();
    let editable = block_on(store.checkout(&leo)).unwrap();
    let carl = store.record("user", "3").unwrap();

    editable.set("firstName", json!("Max")).unwrap();
    editable.array("tags").unwrap().unwrap().push(json!("b")).unwrap();
    editable.has_many("friends").unwrap().push(&carl).unwrap();
    editable.delete().unwrap();
    assert!(leo.is_deleted().unwrap());
    assert_eq!(carl.has_many("friends").unwrap().len().unwrap(), 1);

    store.rollback(leo.key()).unwrap();
    let once = store.peek(leo.key()).unwrap();
    store.rollback(leo.key()).unwrap();

    assert_eq!(once, before);
    assert_eq!(store.peek(leo.key()).unwrap(), before);
    assert!(!store.has_changes(leo.key()));
    assert!(!leo.is_deleted().unwrap());
    assert_eq!(leo.array("tags").unwrap().unwrap().to_json().unwrap(), json!(["a"]));
    assert!(carl.has_many("friends").unwrap().is_empty().unwrap());
}

#[test]
fn test_diff_carries_only_what_changed() {
    let store = store();
    store
        .push_json(&single(json!({
            "type": "user",
            "id": "1",
            "attributes": { "first_name": "Leo", "last_name": "Smith", "age": 40 }
        })))
        .unwrap();
    let key = store.lookup("user", "1").unwrap();
    let editable = store.projection_for(key, Mode::Editable).unwrap();
    editable.set("age", json!(41)).unwrap();

    let patch = store.diff(key).unwrap();
    assert_eq!(patch.op, SaveOp::Update);
    assert_eq!(
        serde_json::to_value(&patch).unwrap(),
        json!({ "data": { "type": "user", "id": "1", "attributes": { "age": 41 } } })
    );
}

#[test]
fn test_save_acknowledges_and_promotes_local_changes() {
    let store = store();
    store.push_json(&single(user("1", "Leo"))).unwrap();
    let leo = store.record("user", "1").unwrap();
    let editable = block_on(store.checkout(&leo)).unwrap();
    editable.set("firstName", json!("Max")).unwrap();

    let network = MemoryNetwork::default();
    let patch = block_on(store.save(&editable, &network)).unwrap();

    assert_eq!(patch.op, SaveOp::Update);
    assert_eq!(network.saved().len(), 1);
    assert!(!store.has_changes(leo.key()));
    assert_eq!(
        store.get_remote_attr(leo.key(), "firstName").unwrap(),
        json!("Max")
    );

    // Nothing left to send.
    block_on(store.save(&editable, &network)).unwrap();
    assert_eq!(network.saved().len(), 1);
}

/// Holds every save until its gate opens, then answers like [`MemoryNetwork`].
struct GatedNetwork {
    gate: RefCell<Option<oneshot::Receiver<()>>>,
    inner: MemoryNetwork,
}

impl GatedNetwork {
    fn new(gate: oneshot::Receiver<()>) -> Self {
        Self {
            gate: RefCell::new(Some(gate)),
            inner: MemoryNetwork::default(),
        }
    }
}

impl Network for GatedNetwork {
    type Error = MemoryNetworkError;

    async fn fetch(&self, url: &str) -> Result<Document, Self::Error> {
        self.inner.fetch(url).await
    }

    async fn save(&self, patch: &Patch) -> Result<Document, Self::Error> {
        let gate = self.gate.borrow_mut().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        self.inner.save(patch).await
    }
}

#[test]
fn test_edits_made_while_saving_stay_local() {
    let store = store();
    store.push_json(&single(user("1", "Leo"))).unwrap();
    let leo = store.record("user", "1").unwrap();
    let ada = store.record("user", "2").unwrap();
    let editable = block_on(store.checkout(&leo)).unwrap();
    editable.set("age", json!(41)).unwrap();

    let (open, gate) = oneshot::channel();
    let network = GatedNetwork::new(gate);
    let mut save = Box::pin(store.save(&editable, &network));
    assert!(save.as_mut().now_or_never().is_none());

    editable.set("firstName", json!("Leonard")).unwrap();
    editable.has_many("friends").unwrap().push(&ada).unwrap();
    open.send(()).unwrap();
    let patch = block_on(save).unwrap();

    assert_eq!(
        serde_json::to_value(&patch).unwrap(),
        json!({ "data": { "type": "user", "id": "1", "attributes": { "age": 41 } } })
    );
    assert_eq!(store.get_remote_attr(leo.key(), "age").unwrap(), json!(41));
    assert_eq!(
        store.get_remote_attr(leo.key(), "firstName").unwrap(),
        json!("Leo")
    );
    assert_eq!(leo.value("firstName").unwrap(), json!("Leonard"));
    assert!(leo.has_many("friends").unwrap().contains(&ada).unwrap());
    assert!(store.has_changes(leo.key()));

    let changes = store.changed_attributes(leo.key());
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].key, "first_name");

    // The next save sends what the first one left behind.
    let patch = block_on(store.save(&editable, &network)).unwrap();
    assert_eq!(patch.data.attributes.len(), 1);
    assert_eq!(patch.data.attributes["first_name"], json!("Leonard"));
    assert!(patch.data.relationships.contains_key("friends"));
    assert!(!store.has_changes(leo.key()));
}

#[test]
fn test_failed_saves_leave_everything_as_it_was() {
    let store = store();
    store.push_json(&single(user("1", "Leo"))).unwrap();
    let leo = store.record("user", "1").unwrap();
    let editable = block_on(store.checkout(&leo)).unwrap();
    editable.set("firstName", json!("Max")).unwrap();
    let before = store.peek(leo.key()).unwrap();

    let network = MemoryNetwork::default();
    network.reject_saves(true);
    assert!(matches!(
        block_on(store.save(&editable, &network)),
        Err(Error::Network(_))
    ));

    assert_eq!(store.peek(leo.key()).unwrap(), before);
    assert!(store.has_changes(leo.key()));
    assert_eq!(
        store.get_remote_attr(leo.key(), "firstName").unwrap(),
        json!("Leo")
    );
    assert_eq!(leo.value("firstName").unwrap(), json!("Max"));
}

#[test]
fn test_creating_and_saving_upgrades_the_lid_in_place() {
    let store = store();
    let created = store
        .create_record("user", json!({ "firstName": "Ada" }))
        .unwrap();
    let key = created.key();
    let lid = created.identifier().unwrap().lid;
    assert!(lid.starts_with("@lid:"));
    assert_eq!(created.id().unwrap(), None);

    let network = MemoryNetwork::default();
    let patch = block_on(store.save(&created, &network)).unwrap();
    assert_eq!(patch.op, SaveOp::Create);
    assert_eq!(patch.data.lid.as_deref(), Some(lid.as_str()));
    assert_eq!(patch.data.attributes["first_name"], json!("Ada"));

    assert_eq!(created.key(), key);
    assert_eq!(created.id().unwrap().as_deref(), Some("server-1"));
    assert_eq!(store.lookup("user", "server-1"), Some(key));
    assert_eq!(store.identifier(key).unwrap().lid, lid);
    assert!(!store.has_changes(key));
}

#[test]
fn test_checkout_waits_for_a_pending_load() {
    let store = store();
    let key = store.identity_for("user", Some("1"), None).unwrap();
    let leo = store.projection_for(key, Mode::Immutable).unwrap();

    let (send, receive) = oneshot::channel::<Document>();
    let load = store.load(key, receive);
    assert!(store.is_loading(key));
    let checkout = store.checkout(&leo);

    send.send(Document::from_json(&single(user("1", "Leo"))).unwrap())
        .unwrap();
    let (editable, loaded) = block_on(futures::future::join(checkout, load));

    assert_eq!(loaded.unwrap(), vec![key]);
    let editable = editable.unwrap();
    assert_eq!(editable.value("firstName").unwrap(), json!("Leo"));
    assert!(!store.is_loading(key));
}

#[test]
fn test_failed_loads_fail_the_checkout() {
    let store = store();
    let key = store.identity_for("user", Some("1"), None).unwrap();
    let leo = store.projection_for(key, Mode::Immutable).unwrap();

    let (send, receive) = oneshot::channel::<Document>();
    let load = store.load(key, receive);
    drop(send);

    let (checkout, loaded) = block_on(futures::future::join(store.checkout(&leo), load));
    assert!(matches!(loaded, Err(Error::LoadFailed(_))));
    assert!(matches!(checkout, Err(Error::LoadFailed(_))));
    assert!(store.peek(key).is_none());
}

#[test]
fn test_discarding_a_checkout_destroys_only_the_editable_record() {
    let store = store();
    store.push_json(&single(user("1", "Leo"))).unwrap();
    let leo = store.record("user", "1").unwrap();
    let editable = block_on(store.checkout(&leo)).unwrap();
    editable.set("firstName", json!("Max")).unwrap();

    store.discard_checkout(&editable).unwrap();
    assert!(editable.is_destroyed());
    assert!(matches!(
        editable.set("firstName", json!("Ada")),
        Err(Error::RecordDestroyed(_))
    ));
    assert_eq!(leo.value("firstName").unwrap(), json!("Max"));

    let again = block_on(store.checkout(&leo)).unwrap();
    assert!(!Rc::ptr_eq(&again, &editable));
}
