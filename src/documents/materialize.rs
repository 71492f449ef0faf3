//! Walks a [`Plan`] + variables against the [`Graph`] to produce a result
//! tree with fingerprinting, dependency tracking, and a materialization
//! result cache (spec §4.6).
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use indexmap::IndexSet;
use serde_json_bytes::{Map as JsonMap, Value as JsonValue};

use crate::canonical::Canonical;
use crate::compiler::plan::{Plan, PlanField};
use crate::graph::Graph;
use crate::record::{FieldValue, RecordId};
use crate::stable_json::stable_json;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Source {
    Strict,
    Canonical,
    None,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Availability {
    pub strict: bool,
    pub canonical: bool,
}

#[derive(Clone, Debug)]
pub struct MaterializeOptions {
    pub canonical: bool,
    pub fingerprint: bool,
    pub force: bool,
    pub prefer_cache: bool,
    pub update_cache: bool,
    pub entity_id: Option<RecordId>,
}

impl Default for MaterializeOptions {
    fn default() -> Self {
        MaterializeOptions {
            canonical: true,
            fingerprint: true,
            force: false,
            prefer_cache: false,
            update_cache: true,
            entity_id: None,
        }
    }
}

#[derive(Clone)]
pub struct MaterializeResult {
    pub data: Option<Arc<JsonValue>>,
    pub source: Source,
    pub ok: Availability,
    pub dependencies: IndexSet<RecordId>,
    pub hot: bool,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    plan_identity: usize,
    stable_variables: String,
    canonical: bool,
    fingerprint: bool,
    entity_id: Option<RecordId>,
}

fn cache_key(plan: &Arc<Plan>, variables: &JsonMap, options: &MaterializeOptions) -> CacheKey {
    CacheKey {
        plan_identity: Arc::as_ptr(plan) as usize,
        stable_variables: stable_variables_key(variables),
        canonical: options.canonical,
        fingerprint: options.fingerprint,
        entity_id: options.entity_id.clone(),
    }
}

fn stable_variables_key(variables: &JsonMap) -> String {
    let as_serde: serde_json::Value = serde_json::to_value(variables).unwrap_or(serde_json::Value::Null);
    stable_json(&as_serde)
}

struct CachedEntry {
    data: Option<Arc<JsonValue>>,
    source: Source,
    ok: Availability,
    dependencies: IndexSet<RecordId>,
    dep_versions: HashMap<RecordId, u64>,
    invalidated: bool,
}

/// Owns the materialization result cache (spec §2: "Documents ... owns the
/// materialization cache and dependency tracking").
#[derive(Default)]
pub struct Materializer {
    cache: std::cell::RefCell<HashMap<CacheKey, CachedEntry>>,
}

impl Materializer {
    pub fn new() -> Self {
        Materializer::default()
    }

    pub fn materialize(
        &self,
        graph: &Graph,
        plan: &Arc<Plan>,
        variables: &JsonMap,
        options: &MaterializeOptions,
    ) -> MaterializeResult {
        let key = cache_key(plan, variables, options);

        if options.prefer_cache && !options.force {
            let cache = self.cache.borrow();
            if let Some(entry) = cache.get(&key) {
                let fresh = !entry.invalidated
                    && entry.dep_versions.iter().all(|(id, version)| graph.get_version(id) == *version);
                if fresh {
                    tracing::trace!("materialize cache hit");
                    return MaterializeResult {
                        data: entry.data.clone(),
                        source: entry.source,
                        ok: entry.ok,
                        dependencies: entry.dependencies.clone(),
                        hot: true,
                    };
                }
            }
        }

        let fresh = run(graph, plan, variables, options);

        if options.update_cache {
            let dep_versions = fresh.dependencies.iter().map(|id| (id.clone(), graph.get_version(id))).collect();
            self.cache.borrow_mut().insert(
                key,
                CachedEntry {
                    data: fresh.data.clone(),
                    source: fresh.source,
                    ok: fresh.ok,
                    dependencies: fresh.dependencies.clone(),
                    dep_versions,
                    invalidated: false,
                },
            );
        }

        fresh
    }

    /// Drops a single cache entry matching the discriminators; absent
    /// entries are ignored silently (spec §4.6).
    pub fn invalidate(
        &self,
        plan: &Arc<Plan>,
        variables: &JsonMap,
        canonical: bool,
        fingerprint: bool,
        entity_id: Option<RecordId>,
    ) {
        let key = CacheKey {
            plan_identity: Arc::as_ptr(plan) as usize,
            stable_variables: stable_variables_key(variables),
            canonical,
            fingerprint,
            entity_id,
        };
        self.cache.borrow_mut().remove(&key);
    }

    pub fn len(&self) -> usize {
        self.cache.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn run(graph: &Graph, plan: &Arc<Plan>, variables: &JsonMap, options: &MaterializeOptions) -> MaterializeResult {
    let parent_id = options.entity_id.clone().unwrap_or_else(RecordId::root);
    let mut deps = IndexSet::new();

    let mut strict_missing = false;
    let mut strict_substituted = false;
    let (strict_value, _) = walk_object(
        graph, false, options.fingerprint, &plan.root, variables, &parent_id, &mut deps, &mut strict_missing, &mut strict_substituted,
    );
    let ok_strict = !strict_missing;

    let (ok_canonical, canonical_value, canonical_substituted) = if options.canonical {
        let mut canonical_missing = false;
        let mut substituted = false;
        let (value, _) = walk_object(
            graph, true, options.fingerprint, &plan.root, variables, &parent_id, &mut deps, &mut canonical_missing, &mut substituted,
        );
        (!canonical_missing, Some(value), substituted)
    } else {
        (false, None, false)
    };

    // A connection field's own page ref is the same in both passes, so
    // `ok.strict`/`ok.canonical` only diverge via a connection. When the
    // canonical-allowed walk never actually substituted anything (no
    // connections in this selection), its result is identical to strict's —
    // prefer the strict label (spec §4.6: "strict iff ... resolves without
    // going through canonical substitution"). When it did substitute, the
    // canonical (merged) view is what "canonical=true" callers asked for,
    // even if the exact literal page would also have sufficed.
    let (source, data) = if ok_strict && !canonical_substituted {
        (Source::Strict, Some(strict_value))
    } else if ok_canonical {
        (Source::Canonical, canonical_value)
    } else if ok_strict {
        (Source::Strict, Some(strict_value))
    } else {
        tracing::debug!(dependencies = deps.len(), "materialize found no satisfiable source");
        (Source::None, None)
    };

    MaterializeResult {
        data: data.map(Arc::new),
        source,
        ok: Availability { strict: ok_strict, canonical: ok_canonical },
        dependencies: deps,
        hot: false,
    }
}

/// Walks one object level (root, entity, connection, edge, or pageInfo) and
/// returns its materialized value plus — if fingerprinting is on — its own
/// `__version`, so the caller can fold it into an ancestor's fingerprint.
fn walk_object(
    graph: &Graph,
    allow_canonical: bool,
    fingerprint: bool,
    selection: &[Arc<PlanField>],
    variables: &JsonMap,
    parent_id: &RecordId,
    deps: &mut IndexSet<RecordId>,
    missing: &mut bool,
    substituted: &mut bool,
) -> (JsonValue, Option<u64>) {
    deps.insert(parent_id.clone());
    let record = graph.get_record(parent_id);
    if record.is_none() {
        *missing = true;
    }

    let mut out = JsonMap::new();
    let mut child_fingerprints = Vec::new();

    for field in selection {
        let storage_key = field.storage_key(variables);
        if parent_id.is_root() {
            deps.insert(RecordId::pseudo_field(parent_id, &storage_key));
        }

        let value = record.and_then(|r| r.get(&storage_key));
        let (resolved, child_fp) = match value {
            None => {
                *missing = true;
                (JsonValue::Null, None)
            }
            Some(fv) => walk_field_value(
                graph, allow_canonical, fingerprint, field, variables, fv, parent_id, &storage_key, deps, missing, substituted,
            ),
        };
        if let Some(fp) = child_fp {
            child_fingerprints.push(fp);
        }
        out.insert(field.response_key.as_str(), resolved);
    }

    let own_fp = if fingerprint {
        let own_version = graph.get_version(parent_id);
        let fp = combine_fingerprint(own_version, child_fingerprints.into_iter());
        out.insert("__version", JsonValue::Number(fp.into()));
        Some(fp)
    } else {
        None
    };

    (JsonValue::Object(out), own_fp)
}

fn walk_field_value(
    graph: &Graph,
    allow_canonical: bool,
    fingerprint: bool,
    field: &PlanField,
    variables: &JsonMap,
    value: &FieldValue,
    parent_id: &RecordId,
    storage_key: &str,
    deps: &mut IndexSet<RecordId>,
    missing: &mut bool,
    substituted: &mut bool,
) -> (JsonValue, Option<u64>) {
    if field.is_connection {
        return walk_connection(
            graph, allow_canonical, fingerprint, field, variables, parent_id, storage_key, value, deps, missing, substituted,
        );
    }

    match value {
        FieldValue::Scalar(v) => {
            if field.selection_set.is_empty() {
                (v.clone(), None)
            } else {
                (
                    expand_embedded(graph, allow_canonical, fingerprint, &field.selection_set, variables, v, deps, missing, substituted),
                    None,
                )
            }
        }
        FieldValue::Ref(id) => {
            deps.insert(id.clone());
            if graph.get_record(id).is_none() {
                *missing = true;
                (JsonValue::Null, None)
            } else {
                let (value, fp) =
                    walk_object(graph, allow_canonical, fingerprint, &field.selection_set, variables, id, deps, missing, substituted);
                (value, fp)
            }
        }
        FieldValue::RefList(ids) => {
            let mut items = Vec::with_capacity(ids.len());
            let mut fps = Vec::new();
            for id in ids {
                deps.insert(id.clone());
                if graph.get_record(id).is_none() {
                    *missing = true;
                    items.push(JsonValue::Null);
                    continue;
                }
                let (value, fp) =
                    walk_object(graph, allow_canonical, fingerprint, &field.selection_set, variables, id, deps, missing, substituted);
                items.push(value);
                if let Some(fp) = fp {
                    fps.push(fp);
                }
            }
            let list_fp = fingerprint.then(|| combine_fingerprint(0, fps.into_iter()));
            (JsonValue::Array(items), list_fp)
        }
    }
}

/// Connections substitute the literal concrete page for the canonical union
/// record when `allow_canonical` is set (spec §4.6); either way the result
/// is just another object walk, since concrete pages and canonical records
/// share the same shape (`edges`, `pageInfo`, extra scalars).
fn walk_connection(
    graph: &Graph,
    allow_canonical: bool,
    fingerprint: bool,
    field: &PlanField,
    variables: &JsonMap,
    parent_id: &RecordId,
    _storage_key: &str,
    value: &FieldValue,
    deps: &mut IndexSet<RecordId>,
    missing: &mut bool,
    substituted: &mut bool,
) -> (JsonValue, Option<u64>) {
    let page_id = match value {
        FieldValue::Ref(id) => id.clone(),
        FieldValue::Scalar(JsonValue::Null) => return (JsonValue::Null, None),
        _ => {
            *missing = true;
            return (JsonValue::Null, None);
        }
    };

    let target_id = if allow_canonical {
        *substituted = true;
        let canonical_key = Canonical::canonical_key(field, parent_id, variables);
        deps.insert(RecordId::new(format!("{canonical_key}.pageInfo")));
        canonical_key
    } else {
        page_id
    };

    deps.insert(target_id.clone());
    if graph.get_record(&target_id).is_none() {
        *missing = true;
        return (JsonValue::Null, None);
    }

    walk_object(graph, allow_canonical, fingerprint, &field.selection_set, variables, &target_id, deps, missing, substituted)
}

/// Mirrors `Documents::normalize`'s embedding convention: embedded JSON may
/// contain `{"__ref": id}` markers for entities that got extracted into the
/// graph even though the containing object itself wasn't identifiable.
fn expand_embedded(
    graph: &Graph,
    allow_canonical: bool,
    fingerprint: bool,
    selection_set: &[Arc<PlanField>],
    variables: &JsonMap,
    value: &JsonValue,
    deps: &mut IndexSet<RecordId>,
    missing: &mut bool,
    substituted: &mut bool,
) -> JsonValue {
    match value {
        JsonValue::Object(obj) => {
            if let Some(JsonValue::String(id)) = obj.get("__ref") {
                let id = RecordId::new(id.as_str());
                deps.insert(id.clone());
                if graph.get_record(&id).is_none() {
                    *missing = true;
                    return JsonValue::Null;
                }
                let (resolved, _) =
                    walk_object(graph, allow_canonical, fingerprint, selection_set, variables, &id, deps, missing, substituted);
                return resolved;
            }
            let mut out = JsonMap::new();
            for (key, v) in obj.iter() {
                out.insert(key.as_str(), v.clone());
            }
            JsonValue::Object(out)
        }
        JsonValue::Array(items) => JsonValue::Array(
            items
                .iter()
                .map(|item| {
                    expand_embedded(graph, allow_canonical, fingerprint, selection_set, variables, item, deps, missing, substituted)
                })
                .collect(),
        ),
        _ => value.clone(),
    }
}

/// Deterministic (same process, same std version) fold of a record version
/// and its children's fingerprints. Not a cryptographic hash — collisions
/// would only cause a missed re-render, not a correctness bug, and are
/// vanishingly unlikely for the small inputs here.
fn combine_fingerprint(own_version: u64, children: impl Iterator<Item = u64>) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    own_version.hash(&mut hasher);
    for child in children {
        child.hash(&mut hasher);
    }
    hasher.finish()
}
