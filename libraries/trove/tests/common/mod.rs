#![allow(dead_code)]

use serde_json::{Value, json};
use trove::{FieldSchema, ResourceSchema, Store};

/// A store with `user`, `post` and `address` schemas registered.
///
/// - `user.friends` is its own inverse.
/// - `user.posts` and `post.author` are inverses of each other.
/// - `user.feed` is a links-mode hasMany without an inverse.
/// - `address` is identified by street and zip.
pub fn store() -> Store {
    let store = Store::default();
    store.register_hash_function("street-zip", |value: &Value, _| {
        json!(format!("{}|{}", value["street"], value["zip"]))
    });
    store.register_derivation("full-name", |reader, _| {
        let first = reader.value("firstName")?;
        let last = reader.value("lastName")?;
        Ok(json!(format!(
            "{} {}",
            first.as_str().unwrap_or_default(),
            last.as_str().unwrap_or_default()
        )))
    });
    store
        .register_resource(
            ResourceSchema::new("address")
                .identity_hash("street-zip")
                .field(FieldSchema::plain("street").transform("string"))
                .field(FieldSchema::plain("zip").transform("string"))
                .field(FieldSchema::plain("state").transform("string")),
        )
        .unwrap();
    store
        .register_resource(
            ResourceSchema::new("user")
                .field(FieldSchema::plain("firstName").source_key("first_name"))
                .field(FieldSchema::plain("lastName").source_key("last_name"))
                .field(FieldSchema::plain("age").transform("number"))
                .field(FieldSchema::derived("fullName", "full-name"))
                .field(FieldSchema::object("address", "address"))
                .field(FieldSchema::array("tags", Some("string")))
                .field(FieldSchema::has_many("friends", "user").inverse("friends"))
                .field(FieldSchema::has_many("posts", "post").inverse("author"))
                .field(FieldSchema::has_many("feed", "post").links_mode()),
        )
        .unwrap();
    store
        .register_resource(
            ResourceSchema::new("post")
                .field(FieldSchema::plain("title").transform("string"))
                .field(FieldSchema::belongs_to("author", "user").inverse("posts")),
        )
        .unwrap();
    store
}

pub fn user(id: &str, first_name: &str) -> Value {
    json!({
        "type": "user",
        "id": id,
        "attributes": { "first_name": first_name, "last_name": "Smith" }
    })
}

pub fn single(resource: Value) -> Value {
    json!({ "data": resource })
}
