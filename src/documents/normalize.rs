//! Writes a response into the [`Graph`] through a [`Plan`] (spec §4.5).
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use serde_json_bytes::{Map as JsonMap, Value as JsonValue};

use crate::canonical::{Canonical, PageUpdate};
use crate::compiler::plan::{OperationKind, Plan, PlanField};
use crate::graph::Graph;
use crate::optimistic::Optimistic;
use crate::record::{FieldValue, Record, RecordId};

/// Normalizes `data` into `graph` through `plan`'s selections, anchored at
/// `entity_id` (the root `"@"` for an operation, or a specific entity for a
/// fragment write). Connection *merging* (`Canonical.updateConnection`) is
/// skipped for mutations/subscriptions (spec §4.5 step 5); entity writes
/// happen regardless. `Optimistic.replay` always runs afterward — even for
/// a mutation, or a write that touched no connection at all — since a
/// committed entity patch must be re-applied on top of whatever
/// `write_selection` just wrote to `graph` directly, or it would be
/// silently clobbered (spec §4.7: replayed after *every* base update).
pub fn normalize(
    graph: &mut Graph,
    canonical: &Canonical,
    optimistic: &Optimistic,
    plan: &Plan,
    variables: &JsonMap,
    data: &JsonValue,
    entity_id: Option<&RecordId>,
) {
    let parent_id = entity_id.cloned().unwrap_or_else(RecordId::root);
    let skip_connections = matches!(plan.operation, OperationKind::Mutation | OperationKind::Subscription);

    let mut touched = IndexSet::new();
    write_selection(graph, canonical, &plan.root, variables, &parent_id, data, skip_connections, &mut touched);

    let keys: Vec<RecordId> = touched.into_iter().collect();
    tracing::trace!(parent = %parent_id, connections = keys.len(), "replaying optimistic overlay after normalize");
    optimistic.replay(graph, &keys);
}

/// Writes every field in `selection` found in `data` onto `parent_id`, one
/// `putRecord` call per selection set (so a single normalize of nested data
/// still batches into the caller's eventual single `flush`).
fn write_selection(
    graph: &mut Graph,
    canonical: &Canonical,
    selection: &[Arc<PlanField>],
    variables: &JsonMap,
    parent_id: &RecordId,
    data: &JsonValue,
    skip_connections: bool,
    touched: &mut IndexSet<RecordId>,
) {
    let Some(obj) = data.as_object() else { return };

    let mut fields = IndexMap::new();
    for field in selection {
        let Some(value) = obj.get(field.response_key.as_str()) else { continue };
        let storage_key = field.storage_key(variables);

        if field.is_connection {
            if let Some(fv) = write_connection(graph, canonical, field, variables, parent_id, &storage_key, value, skip_connections, touched) {
                fields.insert(storage_key, fv);
            }
            continue;
        }

        let fv = normalize_value(graph, canonical, field, variables, value, skip_connections, touched);
        fields.insert(storage_key, fv);
    }

    if !fields.is_empty() {
        graph.put_record(parent_id, fields);
    }
}

/// Normalizes a non-connection field value: null/scalar as-is, entities
/// recurse into their own record and leave a `Ref`, arrays of entities
/// become a `RefList`, and everything else (embedded objects, arrays that
/// don't uniformly identify) is stored inline with nested entities still
/// extracted and referenced via an inline `{"__ref"}` marker (spec §6's
/// wire format, reused here for the embedded case).
fn normalize_value(
    graph: &mut Graph,
    canonical: &Canonical,
    field: &PlanField,
    variables: &JsonMap,
    value: &JsonValue,
    skip_connections: bool,
    touched: &mut IndexSet<RecordId>,
) -> FieldValue {
    if field.selection_set.is_empty() {
        return FieldValue::Scalar(value.clone());
    }

    match value {
        JsonValue::Null => FieldValue::Scalar(JsonValue::Null),
        JsonValue::Array(items) => {
            let ids: Option<Vec<RecordId>> = items.iter().map(|item| graph.identify(item)).collect();
            match ids {
                Some(ids) => {
                    for (item, id) in items.iter().zip(ids.iter()) {
                        write_selection(graph, canonical, &field.selection_set, variables, id, item, skip_connections, touched);
                    }
                    FieldValue::RefList(ids)
                }
                None => FieldValue::Scalar(JsonValue::Array(
                    items
                        .iter()
                        .map(|item| embed_value(graph, canonical, field, variables, item, skip_connections, touched))
                        .collect(),
                )),
            }
        }
        JsonValue::Object(_) => match graph.identify(value) {
            Some(id) => {
                write_selection(graph, canonical, &field.selection_set, variables, &id, value, skip_connections, touched);
                FieldValue::Ref(id)
            }
            None => FieldValue::Scalar(embed_object(graph, canonical, &field.selection_set, variables, value, skip_connections, touched)),
        },
        _ => FieldValue::Scalar(value.clone()),
    }
}

/// Like [`normalize_value`] but produces a plain `JsonValue` suitable for
/// embedding inline in a parent's scalar field, rather than a `FieldValue`.
fn embed_value(
    graph: &mut Graph,
    canonical: &Canonical,
    field: &PlanField,
    variables: &JsonMap,
    value: &JsonValue,
    skip_connections: bool,
    touched: &mut IndexSet<RecordId>,
) -> JsonValue {
    if field.selection_set.is_empty() {
        return value.clone();
    }

    match value {
        JsonValue::Null => JsonValue::Null,
        JsonValue::Array(items) => JsonValue::Array(
            items
                .iter()
                .map(|item| embed_value(graph, canonical, field, variables, item, skip_connections, touched))
                .collect(),
        ),
        JsonValue::Object(_) => match graph.identify(value) {
            Some(id) => {
                write_selection(graph, canonical, &field.selection_set, variables, &id, value, skip_connections, touched);
                let mut marker = JsonMap::new();
                marker.insert("__ref", JsonValue::String(id.as_str().into()));
                JsonValue::Object(marker)
            }
            None => embed_object(graph, canonical, &field.selection_set, variables, value, skip_connections, touched),
        },
        _ => value.clone(),
    }
}

fn embed_object(
    graph: &mut Graph,
    canonical: &Canonical,
    selection_set: &[Arc<PlanField>],
    variables: &JsonMap,
    value: &JsonValue,
    skip_connections: bool,
    touched: &mut IndexSet<RecordId>,
) -> JsonValue {
    let Some(obj) = value.as_object() else { return value.clone() };

    let mut out = JsonMap::new();
    for field in selection_set {
        let Some(v) = obj.get(field.response_key.as_str()) else { continue };
        let storage_key = field.storage_key(variables);
        let embedded = embed_value(graph, canonical, field, variables, v, skip_connections, touched);
        out.insert(storage_key, embedded);
    }
    JsonValue::Object(out)
}

/// Normalizes a connection field (spec §4.5 step 5): writes the concrete
/// page record (`pageInfo`, `edges`, and any extra scalars like
/// `totalCount`), then — unless this is a mutation/subscription — feeds it
/// to `Canonical.updateConnection` and records the touched canonical key so
/// the caller can replay it exactly once.
fn write_connection(
    graph: &mut Graph,
    canonical: &Canonical,
    field: &PlanField,
    variables: &JsonMap,
    parent_id: &RecordId,
    storage_key: &str,
    value: &JsonValue,
    skip_connections: bool,
    touched: &mut IndexSet<RecordId>,
) -> Option<FieldValue> {
    if value.is_null() {
        return Some(FieldValue::Scalar(JsonValue::Null));
    }
    let obj = value.as_object()?;
    let page_key = RecordId::field_path(parent_id, storage_key);

    let mut page_fields = IndexMap::new();
    if let Some(JsonValue::String(typename)) = obj.get("__typename") {
        page_fields.insert(
            "__typename".to_string(),
            FieldValue::Scalar(JsonValue::String(typename.as_str().into())),
        );
    }

    let mut edge_refs = Vec::new();
    if let (Some(edges_field), Some(JsonValue::Array(edge_values))) = (field.selection_map.get("edges"), obj.get("edges")) {
        for (i, edge_value) in edge_values.iter().enumerate() {
            let edge_id = RecordId::edge_of(&page_key, i);
            write_selection(graph, canonical, &edges_field.selection_set, variables, &edge_id, edge_value, skip_connections, touched);
            edge_refs.push(edge_id);
        }
    }
    page_fields.insert("edges".to_string(), FieldValue::RefList(edge_refs.clone()));

    if let Some(page_info_field) = field.selection_map.get("pageInfo") {
        if let Some(page_info_value) = obj.get("pageInfo") {
            let page_info_id = RecordId::page_info_of(&page_key);
            write_selection(
                graph,
                canonical,
                &page_info_field.selection_set,
                variables,
                &page_info_id,
                page_info_value,
                skip_connections,
                touched,
            );
            page_fields.insert("pageInfo".to_string(), FieldValue::Ref(page_info_id));
        }
    }

    for (key, val) in obj.iter() {
        if matches!(key.as_str(), "edges" | "pageInfo" | "__typename") {
            continue;
        }
        if let Some(extra_field) = field.selection_map.get(key.as_str()) {
            let extra_key = extra_field.storage_key(variables);
            let fv = normalize_value(graph, canonical, extra_field, variables, val, skip_connections, touched);
            page_fields.insert(extra_key, fv);
        }
    }

    graph.put_record(&page_key, page_fields.clone());

    if !skip_connections {
        let page_snapshot = Record { fields: page_fields };
        let update = PageUpdate {
            field,
            parent_id,
            variables,
            page_key: page_key.clone(),
            page_snapshot: &page_snapshot,
            page_edge_refs: &edge_refs,
        };
        if let Ok(canonical_key) = canonical.update_connection(graph, update) {
            touched.insert(canonical_key);
        }
    }

    Some(FieldValue::Ref(page_key))
}
