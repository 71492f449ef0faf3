//! Fingerprint stability and materialization-cache scenarios (spec §8
//! "Fingerprint stability", "Materialization cache").
use cachebay::documents::{MaterializeOptions, Source};
use cachebay::{Cache, CacheConfig};
use serde_json_bytes::{json, Map as JsonMap};

const QUERY: &str = "query Q { user { id name } }";

fn cache() -> Cache {
    Cache::new(CacheConfig::builder().build(), |_| {})
}

fn version_of(data: &serde_json_bytes::Value, path: &[&str]) -> serde_json_bytes::Value {
    let mut cur = data;
    for key in path {
        cur = cur.get(*key).unwrap();
    }
    cur.get("__version").unwrap().clone()
}

#[test]
fn unchanged_reads_give_equal_version_at_every_level() {
    let cache = cache();
    let variables = JsonMap::new();
    let data = json!({ "user": { "__typename": "User", "id": "1", "name": "Ada" } });
    cache.normalize(QUERY, None, &variables, &data, None).unwrap();

    let first = cache.materialize(QUERY, None, &variables, &MaterializeOptions::default()).unwrap();
    let second = cache.materialize(QUERY, None, &variables, &MaterializeOptions::default()).unwrap();

    let first_data = first.data.unwrap();
    let second_data = second.data.unwrap();
    assert_eq!(version_of(&first_data, &[]), version_of(&second_data, &[]));
    assert_eq!(version_of(&first_data, &["user"]), version_of(&second_data, &["user"]));
}

#[test]
fn a_changed_leaf_bumps_the_version_at_every_ancestor_up_to_root() {
    let cache = cache();
    let variables = JsonMap::new();
    let data = json!({ "user": { "__typename": "User", "id": "1", "name": "Ada" } });
    cache.normalize(QUERY, None, &variables, &data, None).unwrap();
    let before = cache.materialize(QUERY, None, &variables, &MaterializeOptions::default()).unwrap();
    let before_data = before.data.unwrap();

    let updated = json!({ "user": { "__typename": "User", "id": "1", "name": "Ada Lovelace" } });
    cache.normalize(QUERY, None, &variables, &updated, None).unwrap();
    let after = cache.materialize(QUERY, None, &variables, &MaterializeOptions::default()).unwrap();
    let after_data = after.data.unwrap();

    assert_ne!(version_of(&before_data, &["user"]), version_of(&after_data, &["user"]));
    assert_ne!(version_of(&before_data, &[]), version_of(&after_data, &[]));
}

#[test]
fn prefer_cache_returns_the_same_arc_until_a_dependency_changes() {
    let cache = cache();
    let variables = JsonMap::new();
    let data = json!({ "user": { "__typename": "User", "id": "1", "name": "Ada" } });
    cache.normalize(QUERY, None, &variables, &data, None).unwrap();

    let mut options = MaterializeOptions { prefer_cache: true, ..MaterializeOptions::default() };
    let first = cache.materialize(QUERY, None, &variables, &options).unwrap();
    assert!(!first.hot);

    let second = cache.materialize(QUERY, None, &variables, &options).unwrap();
    assert!(second.hot);
    assert!(std::sync::Arc::ptr_eq(first.data.as_ref().unwrap(), second.data.as_ref().unwrap()));

    let updated = json!({ "user": { "__typename": "User", "id": "1", "name": "Ada Lovelace" } });
    cache.normalize(QUERY, None, &variables, &updated, None).unwrap();
    options.prefer_cache = true;
    let third = cache.materialize(QUERY, None, &variables, &options).unwrap();
    assert!(!third.hot);
    assert_ne!(third.data.unwrap().get("user").unwrap().get("name").unwrap(), &json!("Ada"));
}

#[test]
fn invalidate_forces_the_next_materialize_to_recompute() {
    let cache = cache();
    let variables = JsonMap::new();
    let data = json!({ "user": { "__typename": "User", "id": "1", "name": "Ada" } });
    cache.normalize(QUERY, None, &variables, &data, None).unwrap();

    let options = MaterializeOptions { prefer_cache: true, ..MaterializeOptions::default() };
    let first = cache.materialize(QUERY, None, &variables, &options).unwrap();
    assert!(!first.hot);

    cache.invalidate(QUERY, None, &variables, options.canonical, options.fingerprint, None).unwrap();

    let second = cache.materialize(QUERY, None, &variables, &options).unwrap();
    assert!(!second.hot);
    assert_eq!(second.source, Source::Strict);
}
