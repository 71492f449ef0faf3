//! Graph version-bump and change-notification scenarios (spec §4.3): same-
//! value writes are no-ops, differing writes bump the clock exactly once per
//! `put_record` call, and `flush` delivers pending changes synchronously.
use cachebay::config::CacheConfig;
use cachebay::graph::Graph;
use cachebay::record::FieldValue;
use indexmap::IndexMap;
use serde_json_bytes::json;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

fn config() -> Arc<CacheConfig> {
    Arc::new(CacheConfig::builder().build())
}

#[test]
fn identical_value_write_does_not_bump_version() {
    let mut graph = Graph::new(config(), |_| {});
    let user = cachebay::RecordId::entity("User", "1");

    let mut fields = IndexMap::new();
    fields.insert("name".to_string(), FieldValue::Scalar(json!("Ada")));
    graph.put_record(&user, fields.clone());
    let version_after_first_write = graph.get_version(&user);

    graph.put_record(&user, fields);
    assert_eq!(graph.get_version(&user), version_after_first_write);
}

#[test]
fn differing_value_write_bumps_version() {
    let mut graph = Graph::new(config(), |_| {});
    let user = cachebay::RecordId::entity("User", "1");

    let mut fields = IndexMap::new();
    fields.insert("name".to_string(), FieldValue::Scalar(json!("Ada")));
    graph.put_record(&user, fields);
    let version_after_first_write = graph.get_version(&user);

    let mut updated = IndexMap::new();
    updated.insert("name".to_string(), FieldValue::Scalar(json!("Ada Lovelace")));
    graph.put_record(&user, updated);
    assert!(graph.get_version(&user) > version_after_first_write);
}

#[test]
fn flush_delivers_pending_changes_synchronously_and_clears_them() {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen_for_callback = seen.clone();
    let mut graph = Graph::new(config(), move |changes| {
        seen_for_callback.borrow_mut().extend(changes.iter().cloned());
    });

    let user = cachebay::RecordId::entity("User", "1");
    let mut fields = IndexMap::new();
    fields.insert("name".to_string(), FieldValue::Scalar(json!("Ada")));
    graph.put_record(&user, fields);

    assert!(graph.has_pending_changes());
    graph.flush();
    assert!(!graph.has_pending_changes());
    assert!(seen.borrow().contains(&user));
}

#[test]
fn removing_a_record_zeroes_its_version_and_marks_it_pending() {
    let mut graph = Graph::new(config(), |_| {});
    let user = cachebay::RecordId::entity("User", "1");
    let mut fields = IndexMap::new();
    fields.insert("name".to_string(), FieldValue::Scalar(json!("Ada")));
    graph.put_record(&user, fields);
    graph.flush();

    graph.remove_record(&user);
    assert_eq!(graph.get_version(&user), 0);
    assert!(graph.get_record(&user).is_none());
    assert!(graph.has_pending_changes());
}
