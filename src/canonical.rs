//! The canonical connection engine (spec §4.4): maintains one
//! `@connection.<parent>.<field>(<canonicalArgs>)` record per logical
//! connection, merging concrete pages into a deduplicated edge list with
//! anchored `pageInfo`.
//!
//! Meta sidecars (`'<canKey>::meta'`) are stored as ordinary graph records
//! rather than side state private to this module, so `Cache::dehydrate`
//! picks them up for free along with everything else in `records`.
use std::collections::HashMap;

use indexmap::IndexMap;
use serde_json_bytes::{Map as JsonMap, Value as JsonValue};

use crate::compiler::plan::{ConnectionMode, PlanField};
use crate::error::{CacheError, Result};
use crate::graph::Graph;
use crate::record::{FieldValue, Record, RecordId};

const PAGE_INFO_EDGE_FIELDS: &[&str] = &["startCursor", "hasPreviousPage", "endCursor", "hasNextPage"];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PageHint {
    Leader,
    After,
    Before,
}

impl PageHint {
    fn as_str(self) -> &'static str {
        match self {
            PageHint::Leader => "leader",
            PageHint::After => "after",
            PageHint::Before => "before",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "leader" => Some(PageHint::Leader),
            "after" => Some(PageHint::After),
            "before" => Some(PageHint::Before),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Origin {
    Network,
    Cache,
}

impl Origin {
    fn as_str(self) -> &'static str {
        match self {
            Origin::Network => "network",
            Origin::Cache => "cache",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "network" => Some(Origin::Network),
            "cache" => Some(Origin::Cache),
            _ => None,
        }
    }
}

/// In-memory view of a `::meta` record, parsed out for convenient mutation
/// and re-serialized by [`write_meta`].
#[derive(Clone, Debug, Default)]
struct CanonicalMeta {
    pages: Vec<RecordId>,
    leader: Option<RecordId>,
    hints: HashMap<RecordId, PageHint>,
    origin: HashMap<RecordId, Origin>,
}

/// Input shared by `update_connection` and `merge_from_cache`.
pub struct PageUpdate<'a> {
    pub field: &'a PlanField,
    pub parent_id: &'a RecordId,
    pub variables: &'a JsonMap,
    pub page_key: RecordId,
    pub page_snapshot: &'a Record,
    pub page_edge_refs: &'a [RecordId],
}

/// Stateless: all persisted state lives in the [`Graph`] passed to each
/// call, so a `Canonical` value can be cheaply constructed and shared.
#[derive(Default)]
pub struct Canonical;

impl Canonical {
    pub fn new() -> Self {
        Canonical
    }

    /// `canonicalArgs` = stable JSON of only the arguments listed in
    /// `field.connection_filters`; `canonicalKey` follows spec §6. Root
    /// connections omit the parent segment (there is nothing informative to
    /// put there), matching the concrete-page-key convention in §4.5.
    pub fn canonical_key(field: &PlanField, parent_id: &RecordId, variables: &JsonMap) -> RecordId {
        let canonical_args = field.canonical_args(variables);
        RecordId::canonical(parent_id, field.storage_field_name(), &canonical_args)
    }

    /// Network-origin update: resets the canonical meta on a leader page
    /// (spec §4.4, §8 "leader reset").
    pub fn update_connection(&self, graph: &mut Graph, update: PageUpdate<'_>) -> Result<RecordId> {
        self.apply(graph, update, Origin::Network)
    }

    /// Cache-origin update: never resets; out-of-order pages are slotted in
    /// by hint instead.
    pub fn merge_from_cache(&self, graph: &mut Graph, update: PageUpdate<'_>) -> Result<RecordId> {
        self.apply(graph, update, Origin::Cache)
    }

    fn apply(&self, graph: &mut Graph, update: PageUpdate<'_>, origin: Origin) -> Result<RecordId> {
        if update.page_snapshot.typename().is_none() {
            tracing::error!(page = %update.page_key, "page record is missing __typename");
            return Err(CacheError::InvalidPage {
                connection_key: update.page_key.to_string(),
                message: "page record is missing __typename".to_string(),
            });
        }

        let canonical_key = Self::canonical_key(update.field, update.parent_id, update.variables);
        tracing::debug!(canonical = %canonical_key, page = %update.page_key, origin = origin.as_str(), "merging connection page");

        match update.field.connection_mode {
            ConnectionMode::Page => {
                replace_page_mode(graph, &canonical_key, &update);
            }
            ConnectionMode::Infinite => {
                let hint = classify(update.variables);
                let mut meta = read_meta(graph, &canonical_key);
                update_meta(&mut meta, &update.page_key, hint, origin);
                write_meta(graph, &canonical_key, &meta);
                rebuild_infinite(graph, &canonical_key, &meta, &update);
            }
        }

        Ok(canonical_key)
    }
}

fn update_meta(meta: &mut CanonicalMeta, page_key: &RecordId, hint: PageHint, origin: Origin) {
    match (origin, hint) {
        (Origin::Network, PageHint::Leader) => {
            meta.pages = vec![page_key.clone()];
            meta.leader = Some(page_key.clone());
            meta.hints = HashMap::from([(page_key.clone(), PageHint::Leader)]);
            meta.origin = HashMap::from([(page_key.clone(), Origin::Network)]);
        }
        (Origin::Network, PageHint::After) => {
            if !meta.pages.contains(page_key) {
                meta.pages.push(page_key.clone());
                meta.hints.insert(page_key.clone(), PageHint::After);
            }
            meta.origin.insert(page_key.clone(), Origin::Network);
        }
        (Origin::Network, PageHint::Before) => {
            if !meta.pages.contains(page_key) {
                let insert_at = leader_index(meta);
                meta.pages.insert(insert_at, page_key.clone());
                meta.hints.insert(page_key.clone(), PageHint::Before);
            }
            meta.origin.insert(page_key.clone(), Origin::Network);
        }
        (Origin::Cache, PageHint::Leader) => {
            let network_leader = meta
                .leader
                .as_ref()
                .is_some_and(|leader| meta.origin.get(leader) == Some(&Origin::Network));
            if network_leader {
                // A network-origin leader is never displaced by a later
                // cache merge (spec §9 open question, resolved this way).
                return;
            }
            meta.pages.retain(|p| p != page_key);
            meta.pages.insert(0, page_key.clone());
            meta.leader = Some(page_key.clone());
            meta.hints.insert(page_key.clone(), PageHint::Leader);
            set_origin_cache_safe(meta, page_key);
        }
        (Origin::Cache, PageHint::After) => {
            if !meta.pages.contains(page_key) {
                meta.pages.push(page_key.clone());
                meta.hints.insert(page_key.clone(), PageHint::After);
            }
            set_origin_cache_safe(meta, page_key);
        }
        (Origin::Cache, PageHint::Before) => {
            if !meta.pages.contains(page_key) {
                let insert_at = leader_index(meta);
                meta.pages.insert(insert_at, page_key.clone());
                meta.hints.insert(page_key.clone(), PageHint::Before);
            }
            set_origin_cache_safe(meta, page_key);
        }
    }
}

fn leader_index(meta: &CanonicalMeta) -> usize {
    match &meta.leader {
        Some(leader) => meta.pages.iter().position(|p| p == leader).unwrap_or(0),
        None => 0,
    }
}

fn set_origin_cache_safe(meta: &mut CanonicalMeta, page_key: &RecordId) {
    if meta.origin.get(page_key) != Some(&Origin::Network) {
        meta.origin.insert(page_key.clone(), Origin::Cache);
    }
}

fn classify(variables: &JsonMap) -> PageHint {
    let present = |key: &str| variables.get(key).map(|v| !v.is_null()).unwrap_or(false);
    if present("after") {
        PageHint::After
    } else if present("before") {
        PageHint::Before
    } else {
        PageHint::Leader
    }
}

fn read_meta(graph: &Graph, canonical_key: &RecordId) -> CanonicalMeta {
    let Some(record) = graph.get_record(&RecordId::meta_of(canonical_key)) else {
        return CanonicalMeta::default();
    };

    let pages = record
        .get("pages")
        .and_then(FieldValue::as_ref_list)
        .map(|refs| refs.to_vec())
        .unwrap_or_default();
    let leader = record.get("leader").and_then(FieldValue::as_ref_id).cloned();
    let hints = record
        .get("hints")
        .and_then(FieldValue::as_scalar)
        .and_then(JsonValue::as_object)
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| Some((RecordId::new(k.as_str()), PageHint::parse(v.as_str()?)?)))
                .collect()
        })
        .unwrap_or_default();
    let origin = record
        .get("origin")
        .and_then(FieldValue::as_scalar)
        .and_then(JsonValue::as_object)
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| Some((RecordId::new(k.as_str()), Origin::parse(v.as_str()?)?)))
                .collect()
        })
        .unwrap_or_default();

    CanonicalMeta { pages, leader, hints, origin }
}

fn write_meta(graph: &mut Graph, canonical_key: &RecordId, meta: &CanonicalMeta) {
    let mut hints = JsonMap::new();
    for (page_id, hint) in &meta.hints {
        hints.insert(page_id.as_str(), JsonValue::String(hint.as_str().into()));
    }
    let mut origin = JsonMap::new();
    for (page_id, value) in &meta.origin {
        origin.insert(page_id.as_str(), JsonValue::String(value.as_str().into()));
    }

    let mut fields = IndexMap::new();
    fields.insert(
        "__typename".to_string(),
        FieldValue::Scalar(JsonValue::String("CanonicalMeta".into())),
    );
    fields.insert("pages".to_string(), FieldValue::RefList(meta.pages.clone()));
    if let Some(leader) = &meta.leader {
        fields.insert("leader".to_string(), FieldValue::Ref(leader.clone()));
    }
    fields.insert("hints".to_string(), FieldValue::Scalar(JsonValue::Object(hints)));
    fields.insert("origin".to_string(), FieldValue::Scalar(JsonValue::Object(origin)));

    graph.put_record(&RecordId::meta_of(canonical_key), fields);
}

fn rebuild_infinite(graph: &mut Graph, canonical_key: &RecordId, meta: &CanonicalMeta, update: &PageUpdate<'_>) {
    // First pass: collect (node_id, edge_record_id) for every edge across
    // all pages, in page order.
    let mut order: Vec<RecordId> = Vec::new();
    let mut first_edge_for_node: IndexMap<RecordId, RecordId> = IndexMap::new();
    let mut latest_edge_for_node: HashMap<RecordId, RecordId> = HashMap::new();

    for page_id in &meta.pages {
        let Some(page_record) = graph.get_record(page_id) else { continue };
        let Some(edge_refs) = page_record.get("edges").and_then(FieldValue::as_ref_list) else { continue };
        for edge_ref in edge_refs {
            let Some(edge_record) = graph.get_record(edge_ref) else { continue };
            let Some(node_id) = edge_record.get("node").and_then(FieldValue::as_ref_id) else { continue };
            if !first_edge_for_node.contains_key(node_id) {
                first_edge_for_node.insert(node_id.clone(), edge_ref.clone());
                order.push(node_id.clone());
            }
            latest_edge_for_node.insert(node_id.clone(), edge_ref.clone());
        }
    }

    // Second pass: materialize canonical-owned edge records, content
    // refreshed from the latest occurrence, identity stable at its
    // first-seen position (spec §4.4, §8 dedup-metadata refresh).
    let mut canonical_edge_refs = Vec::with_capacity(order.len());
    for (index, node_id) in order.iter().enumerate() {
        let latest_ref = &latest_edge_for_node[node_id];
        let latest_fields = graph
            .get_record(latest_ref)
            .map(|r| r.fields.clone())
            .unwrap_or_default();
        let canonical_edge_id = RecordId::edge_of(canonical_key, index);
        graph.put_record(&canonical_edge_id, latest_fields);
        canonical_edge_refs.push(canonical_edge_id);
    }

    // pageInfo: start/hasPrevious from head, end/hasNext from tail,
    // everything else head-preferred-else-tail.
    let head = meta.pages.first();
    let tail = meta.pages.last();
    let head_info = head.and_then(|p| graph.get_record(&RecordId::page_info_of(p)).cloned());
    let tail_info = tail.and_then(|p| graph.get_record(&RecordId::page_info_of(p)).cloned());

    let mut page_info_fields = IndexMap::new();
    page_info_fields.insert(
        "__typename".to_string(),
        FieldValue::Scalar(JsonValue::String("PageInfo".into())),
    );
    for key in ["startCursor", "hasPreviousPage"] {
        if let Some(value) = head_info.as_ref().and_then(|r| r.get(key)) {
            page_info_fields.insert(key.to_string(), value.clone());
        }
    }
    for key in ["endCursor", "hasNextPage"] {
        if let Some(value) = tail_info.as_ref().and_then(|r| r.get(key)) {
            page_info_fields.insert(key.to_string(), value.clone());
        }
    }
    let extra_keys: Vec<String> = head_info
        .iter()
        .chain(tail_info.iter())
        .flat_map(|r| r.fields.keys().cloned())
        .filter(|k| !PAGE_INFO_EDGE_FIELDS.contains(&k.as_str()) && k != "__typename")
        .collect();
    for key in extra_keys {
        if page_info_fields.contains_key(&key) {
            continue;
        }
        let value = head_info
            .as_ref()
            .and_then(|r| r.get(&key))
            .or_else(|| tail_info.as_ref().and_then(|r| r.get(&key)))
            .cloned();
        if let Some(value) = value {
            page_info_fields.insert(key, value);
        }
    }

    let canonical_page_info_id = RecordId::page_info_of(canonical_key);
    graph.put_record(&canonical_page_info_id, page_info_fields);

    let mut canonical_fields = IndexMap::new();
    if let Some(typename) = update.page_snapshot.typename() {
        canonical_fields.insert(
            "__typename".to_string(),
            FieldValue::Scalar(JsonValue::String(typename.into())),
        );
    }
    canonical_fields.insert("edges".to_string(), FieldValue::RefList(canonical_edge_refs));
    canonical_fields.insert("pageInfo".to_string(), FieldValue::Ref(canonical_page_info_id));
    for (key, value) in non_edge_scalars(update.page_snapshot) {
        canonical_fields.insert(key, value);
    }

    graph.put_record(&RecordId::base_of(canonical_key), canonical_fields);
}

fn replace_page_mode(graph: &mut Graph, canonical_key: &RecordId, update: &PageUpdate<'_>) {
    let mut fields = update.page_snapshot.fields.clone();
    fields.insert("edges".to_string(), FieldValue::RefList(update.page_edge_refs.to_vec()));
    graph.put_record(&RecordId::base_of(canonical_key), fields);
}

fn non_edge_scalars(page: &Record) -> Vec<(String, FieldValue)> {
    page.fields
        .iter()
        .filter(|(key, _)| !matches!(key.as_str(), "__typename" | "edges" | "pageInfo"))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use std::sync::Arc;

    fn graph() -> Graph {
        Graph::new(Arc::new(CacheConfig::builder().build()), |_| {})
    }

    fn page_record(typename: &str, edges: Vec<RecordId>, page_info: RecordId) -> Record {
        let mut record = Record::new(typename);
        record.fields.insert("edges".to_string(), FieldValue::RefList(edges));
        record.fields.insert("pageInfo".to_string(), FieldValue::Ref(page_info));
        record
    }

    #[test]
    fn rejects_page_without_typename() {
        let mut graph = graph();
        let canonical = Canonical::new();
        let field = crate::compiler::plan::PlanField {
            field_name: "users".to_string(),
            response_key: "users".to_string(),
            args: vec![],
            selection_set: vec![],
            selection_map: IndexMap::new(),
            is_connection: true,
            connection_key: None,
            connection_filters: vec![],
            connection_mode: ConnectionMode::Infinite,
        };
        let page_key = RecordId::new("@.users({})");
        let blank = Record::default();
        let variables = JsonMap::new();

        let result = canonical.update_connection(
            &mut graph,
            PageUpdate {
                field: &field,
                parent_id: &RecordId::root(),
                variables: &variables,
                page_key: page_key.clone(),
                page_snapshot: &blank,
                page_edge_refs: &[],
            },
        );

        assert!(matches!(result, Err(CacheError::InvalidPage { .. })));
    }

    #[test]
    fn leader_then_after_produces_union_edges() {
        let mut graph = graph();
        let canonical = Canonical::new();
        let field = crate::compiler::plan::PlanField {
            field_name: "users".to_string(),
            response_key: "users".to_string(),
            args: vec![],
            selection_set: vec![],
            selection_map: IndexMap::new(),
            is_connection: true,
            connection_key: None,
            connection_filters: vec![],
            connection_mode: ConnectionMode::Infinite,
        };

        let page_a = RecordId::new("@.users({\"after\":null})");
        let edge_a1 = RecordId::new("pageA.edges:0");
        let edge_a2 = RecordId::new("pageA.edges:1");
        let u1 = RecordId::entity("User", "u1");
        let u2 = RecordId::entity("User", "u2");

        let mut edge_a1_record = Record::new("UserEdge");
        edge_a1_record.fields.insert("node".to_string(), FieldValue::Ref(u1.clone()));
        graph.put_record(&edge_a1, edge_a1_record.fields);
        let mut edge_a2_record = Record::new("UserEdge");
        edge_a2_record.fields.insert("node".to_string(), FieldValue::Ref(u2.clone()));
        graph.put_record(&edge_a2, edge_a2_record.fields);

        let page_info_a = RecordId::new("pageA.pageInfo");
        let mut info_a = Record::new("PageInfo");
        info_a.fields.insert(
            "endCursor".to_string(),
            FieldValue::Scalar(JsonValue::String("u2".into())),
        );
        info_a.fields.insert("hasNextPage".to_string(), FieldValue::Scalar(JsonValue::Bool(true)));
        graph.put_record(&page_info_a, info_a.fields);

        let page_a_record = page_record("UserConnection", vec![edge_a1.clone(), edge_a2.clone()], page_info_a);
        graph.put_record(&page_a, page_a_record.fields.clone());

        let mut leader_vars = JsonMap::new();
        leader_vars.insert("after", JsonValue::Null);

        let canonical_key = canonical
            .update_connection(
                &mut graph,
                PageUpdate {
                    field: &field,
                    parent_id: &RecordId::root(),
                    variables: &leader_vars,
                    page_key: page_a.clone(),
                    page_snapshot: &page_a_record,
                    page_edge_refs: &[edge_a1.clone(), edge_a2.clone()],
                },
            )
            .unwrap();

        let stored = graph.get_record(&RecordId::base_of(&canonical_key)).unwrap();
        let edges = stored.get("edges").and_then(FieldValue::as_ref_list).unwrap();
        assert_eq!(edges.len(), 2);

        // page B: after=u2
        let page_b = RecordId::new("@.users({\"after\":\"u2\"})");
        let edge_b1 = RecordId::new("pageB.edges:0");
        let u3 = RecordId::entity("User", "u3");
        let mut edge_b1_record = Record::new("UserEdge");
        edge_b1_record.fields.insert("node".to_string(), FieldValue::Ref(u3));
        graph.put_record(&edge_b1, edge_b1_record.fields);

        let page_info_b = RecordId::new("pageB.pageInfo");
        let mut info_b = Record::new("PageInfo");
        info_b.fields.insert(
            "endCursor".to_string(),
            FieldValue::Scalar(JsonValue::String("u3".into())),
        );
        info_b.fields.insert("hasNextPage".to_string(), FieldValue::Scalar(JsonValue::Bool(false)));
        graph.put_record(&page_info_b, info_b.fields);

        let page_b_record = page_record("UserConnection", vec![edge_b1.clone()], page_info_b);
        graph.put_record(&page_b, page_b_record.fields.clone());

        let mut after_vars = JsonMap::new();
        after_vars.insert("after", JsonValue::String("u2".into()));

        canonical
            .update_connection(
                &mut graph,
                PageUpdate {
                    field: &field,
                    parent_id: &RecordId::root(),
                    variables: &after_vars,
                    page_key: page_b.clone(),
                    page_snapshot: &page_b_record,
                    page_edge_refs: &[edge_b1],
                },
            )
            .unwrap();

        let stored = graph.get_record(&RecordId::base_of(&canonical_key)).unwrap();
        let edges = stored.get("edges").and_then(FieldValue::as_ref_list).unwrap();
        assert_eq!(edges.len(), 3);
        let page_info = stored.get("pageInfo").and_then(FieldValue::as_ref_id).unwrap();
        let page_info_record = graph.get_record(page_info).unwrap();
        assert_eq!(
            page_info_record.get("endCursor").and_then(FieldValue::as_scalar),
            Some(&JsonValue::String("u3".into()))
        );
    }
}
