//! The top-level façade (spec §6): wires [`Graph`], [`Canonical`],
//! [`Optimistic`], [`Planner`], and [`Materializer`] together behind the
//! boundary operations callers actually use.
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json_bytes::{Map as JsonMap, Value as JsonValue};

use crate::canonical::Canonical;
use crate::config::CacheConfig;
use crate::documents::{normalize, MaterializeOptions, MaterializeResult, Materializer};
use crate::error::Result;
use crate::graph::{bind_scheduler, Graph, Scheduler};
use crate::optimistic::{Optimistic, OptimisticHandle, Staging};
use crate::planner::{PlanInput, Planner};
use crate::record::{Record, RecordId};

/// Serializable form of the whole store (spec §6 `dehydrate`/`hydrate`):
/// the full records map, versions map, and global clock. Canonical's
/// `::meta`/`::base` records and Optimistic's replayed `::optimistic`
/// overlays are ordinary entries in `records`, so they round-trip for free
/// without any special-cased fields here.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub records: IndexMap<RecordId, Record>,
    pub versions: IndexMap<RecordId, u64>,
    pub global_clock: u64,
}

pub struct Cache {
    graph: Rc<RefCell<Graph>>,
    canonical: Canonical,
    optimistic: Rc<Optimistic>,
    planner: Planner,
    materializer: Materializer,
}

impl Cache {
    pub fn new(config: CacheConfig, on_change: impl FnMut(&indexmap::IndexSet<RecordId>) + 'static) -> Self {
        let graph = Rc::new(RefCell::new(Graph::new(Arc::new(config), on_change)));
        Cache {
            graph,
            canonical: Canonical::new(),
            optimistic: Rc::new(Optimistic::new()),
            planner: Planner::new(),
            materializer: Materializer::new(),
        }
    }

    /// Wires the graph's cooperative-deferral hook to a host-supplied
    /// [`Scheduler`] (spec §5); without this, writes still land immediately,
    /// delivery just waits for an explicit [`Cache::flush`].
    pub fn bind_scheduler(&self, scheduler: Arc<dyn Scheduler>) {
        let owner = self.graph.clone();
        bind_scheduler(&mut self.graph.borrow_mut(), owner, scheduler);
    }

    pub fn normalize<'a>(
        &self,
        input: impl Into<PlanInput<'a>>,
        fragment_name: Option<&str>,
        variables: &JsonMap,
        data: &JsonValue,
        entity_id: Option<&RecordId>,
    ) -> Result<()> {
        let plan = self.planner.get_plan(input, fragment_name)?;
        let mut graph = self.graph.borrow_mut();
        normalize(&mut graph, &self.canonical, &self.optimistic, &plan, variables, data, entity_id);
        Ok(())
    }

    pub fn materialize<'a>(
        &self,
        input: impl Into<PlanInput<'a>>,
        fragment_name: Option<&str>,
        variables: &JsonMap,
        options: &MaterializeOptions,
    ) -> Result<MaterializeResult> {
        let plan = self.planner.get_plan(input, fragment_name)?;
        let graph = self.graph.borrow();
        Ok(self.materializer.materialize(&graph, &plan, variables, options))
    }

    pub fn invalidate<'a>(
        &self,
        input: impl Into<PlanInput<'a>>,
        fragment_name: Option<&str>,
        variables: &JsonMap,
        canonical: bool,
        fingerprint: bool,
        entity_id: Option<RecordId>,
    ) -> Result<()> {
        let plan = self.planner.get_plan(input, fragment_name)?;
        self.materializer.invalidate(&plan, variables, canonical, fingerprint, entity_id);
        Ok(())
    }

    pub fn identify(&self, value: &JsonValue) -> Option<RecordId> {
        self.graph.borrow().identify(value)
    }

    /// Sugar over [`Cache::materialize`] anchored at `entity_id` (spec §6).
    pub fn read_fragment(
        &self,
        source: &str,
        fragment_name: Option<&str>,
        variables: &JsonMap,
        entity_id: RecordId,
        options: &MaterializeOptions,
    ) -> Result<MaterializeResult> {
        let mut options = options.clone();
        options.entity_id = Some(entity_id);
        self.materialize(source, fragment_name, variables, &options)
    }

    /// Sugar over [`Cache::normalize`] anchored at `entity_id` (spec §6).
    pub fn write_fragment(
        &self,
        source: &str,
        fragment_name: Option<&str>,
        variables: &JsonMap,
        entity_id: RecordId,
        data: &JsonValue,
    ) -> Result<()> {
        self.normalize(source, fragment_name, variables, data, Some(&entity_id))
    }

    pub fn modify_optimistic(&self, build: impl FnOnce(&mut Staging)) -> OptimisticHandle {
        self.optimistic.modify(self.graph.clone(), build)
    }

    /// Synchronously delivers any batched `onChange`, bypassing the
    /// scheduler (spec §4.3/§5).
    pub fn flush(&self) {
        self.graph.borrow_mut().flush();
    }

    pub fn has_pending_changes(&self) -> bool {
        self.graph.borrow().has_pending_changes()
    }

    pub fn dehydrate(&self) -> Snapshot {
        let graph = self.graph.borrow();
        Snapshot {
            records: graph.inspect().clone(),
            versions: graph.versions().clone(),
            global_clock: graph.global_clock(),
        }
    }

    /// Replaces the store atomically; records are trusted as-is, with no
    /// re-validation (spec §6).
    pub fn hydrate(&self, snapshot: Snapshot) {
        self.graph.borrow_mut().hydrate(snapshot.records, snapshot.versions, snapshot.global_clock);
    }

    /// Read-only diagnostic enumeration (peripheral Inspect/SSR surface).
    pub fn keys(&self) -> Vec<RecordId> {
        self.graph.borrow().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json_bytes::json;

    fn cache() -> Cache {
        Cache::new(CacheConfig::builder().build(), |_| {})
    }

    #[test]
    fn normalize_then_materialize_round_trips() {
        let cache = cache();
        let variables = JsonMap::new();
        let data = json!({
            "user": { "__typename": "User", "id": "u1", "name": "Ada" },
        });
        cache.normalize("query Q { user { id name } }", None, &variables, &data, None).unwrap();

        let result = cache
            .materialize("query Q { user { id name } }", None, &variables, &MaterializeOptions::default())
            .unwrap();

        assert_eq!(result.source, crate::documents::Source::Strict);
        let data = result.data.unwrap();
        assert_eq!(data.get("user").unwrap().get("name").unwrap(), &json!("Ada"));
    }

    #[test]
    fn dehydrate_then_hydrate_preserves_entities() {
        let cache = cache();
        let variables = JsonMap::new();
        let data = json!({ "user": { "__typename": "User", "id": "u1", "name": "Ada" } });
        cache.normalize("query Q { user { id name } }", None, &variables, &data, None).unwrap();

        let snapshot = cache.dehydrate();
        let restored = cache();
        restored.hydrate(snapshot);

        let result = restored
            .materialize("query Q { user { id name } }", None, &variables, &MaterializeOptions::default())
            .unwrap();
        let data = result.data.unwrap();
        assert_eq!(data.get("user").unwrap().get("name").unwrap(), &json!("Ada"));
    }

    /// Spec §6 calls `dehydrate`'s result a "serializable form" — this
    /// exercises an actual `serde_json::to_string`/`from_str` round-trip,
    /// not just a struct clone, so a future tagged-enum regression in
    /// `FieldValue` would fail here instead of only at a real caller.
    #[test]
    fn snapshot_round_trips_through_an_actual_json_string() {
        let cache = cache();
        let variables = JsonMap::new();
        let data = json!({
            "user": { "__typename": "User", "id": "u1", "name": "Ada", "friends": [
                { "__typename": "User", "id": "u2", "name": "Grace" },
            ] },
        });
        cache
            .normalize("query Q { user { id name friends { id name } } }", None, &variables, &data, None)
            .unwrap();

        let snapshot = cache.dehydrate();
        let encoded = serde_json::to_string(&snapshot).expect("snapshot must serialize to JSON");
        let decoded: Snapshot = serde_json::from_str(&encoded).expect("snapshot must deserialize from JSON");

        let restored = cache();
        restored.hydrate(decoded);

        let result = restored
            .materialize(
                "query Q { user { id name friends { id name } } }",
                None,
                &variables,
                &MaterializeOptions::default(),
            )
            .unwrap();
        let data = result.data.unwrap();
        assert_eq!(data.get("user").unwrap().get("name").unwrap(), &json!("Ada"));
        let friends = data.get("user").unwrap().get("friends").unwrap().as_array().unwrap();
        assert_eq!(friends[0].get("name").unwrap(), &json!("Grace"));
    }
}
