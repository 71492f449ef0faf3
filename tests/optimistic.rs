//! End-to-end optimistic overlay through the public [`Cache`] facade (spec
//! §8 scenario 6): prepend a node optimistically, see it in materialize
//! immediately (no intervening normalize), then revert back to the
//! pre-patch state exactly.
use cachebay::documents::Source;
use cachebay::optimistic::Position;
use cachebay::record::FieldValue;
use cachebay::{Cache, CacheConfig, RecordId};
use indexmap::IndexMap;
use serde_json_bytes::{json, Map as JsonMap};

const QUERY: &str = r#"
query Feed {
  users(first: 2) @connection(key: "users") {
    edges { cursor node { id name } }
    pageInfo { endCursor hasNextPage }
  }
}
"#;

fn cache() -> Cache {
    Cache::new(CacheConfig::builder().build(), |_| {})
}

fn names(result: &cachebay::documents::MaterializeResult) -> Vec<String> {
    result
        .data
        .as_ref()
        .unwrap()
        .get("users")
        .unwrap()
        .get("edges")
        .unwrap()
        .as_array()
        .unwrap()
        .iter()
        .map(|edge| edge.get("node").unwrap().get("name").unwrap().as_str().unwrap().to_string())
        .collect()
}

#[test]
fn prepend_is_visible_immediately_and_revert_restores_the_prior_state() {
    let cache = cache();
    let variables = JsonMap::new();
    let data = json!({
        "users": {
            "__typename": "UserConnection",
            "edges": [
                { "__typename": "UserEdge", "cursor": "1", "node": { "__typename": "User", "id": "1", "name": "Ada" } },
                { "__typename": "UserEdge", "cursor": "2", "node": { "__typename": "User", "id": "2", "name": "Grace" } },
            ],
            "pageInfo": { "__typename": "PageInfo", "endCursor": "2", "hasNextPage": false },
        },
    });
    cache.normalize(QUERY, None, &variables, &data, None).unwrap();

    let before = cache.materialize(QUERY, None, &variables, &Default::default()).unwrap();
    assert_eq!(names(&before), vec!["Ada", "Grace"]);

    let canonical_key = RecordId::new("@connection.users");
    let handle = cache.modify_optimistic(|staging| {
        let mut edge_fields = IndexMap::new();
        edge_fields.insert("cursor".to_string(), FieldValue::Scalar(json!("0")));
        staging.add_node(
            canonical_key.clone(),
            Position::Prepend,
            json!({ "__typename": "User", "id": "0", "name": "Margaret" }),
            edge_fields,
        );
    });
    handle.commit();

    let patched = cache.materialize(QUERY, None, &variables, &Default::default()).unwrap();
    assert_eq!(patched.source, Source::Canonical);
    assert_eq!(names(&patched), vec!["Margaret", "Ada", "Grace"]);

    handle.revert();

    let reverted = cache.materialize(QUERY, None, &variables, &Default::default()).unwrap();
    assert_eq!(names(&reverted), vec!["Ada", "Grace"]);
}
