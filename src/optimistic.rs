//! The optimistic overlay (spec §4.7): an ordered sequence of committed
//! transactions, replayed on top of Canonical's committed (`::base`) state
//! after every update. Depends only on [`Graph`] — it has no knowledge of
//! Canonical beyond the `::base` naming convention, matching the leaves-first
//! dependency order in spec §2 ("Graph, Optimistic, Canonical, Documents").
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};
use serde_json_bytes::Value as JsonValue;

use crate::graph::Graph;
use crate::record::{FieldValue, RecordId};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Position {
    Prepend,
    Append,
}

#[derive(Clone, Debug)]
pub struct EdgePatch {
    pub node: JsonValue,
    pub edge_fields: IndexMap<String, FieldValue>,
}

#[derive(Clone, Debug)]
pub enum ConnectionOp {
    AddNode { position: Position, edge: EdgePatch },
    RemoveNode { node_id: RecordId },
    PatchPageInfo { fields: IndexMap<String, FieldValue> },
    Reorder { order: Vec<RecordId> },
}

#[derive(Clone, Debug)]
pub enum Patch {
    Entity {
        entity_id: RecordId,
        fields: IndexMap<String, FieldValue>,
    },
    Connection {
        canonical_key: RecordId,
        op: ConnectionOp,
    },
}

/// Mutated by the caller's closure inside [`Optimistic::modify`]; nothing is
/// visible in the graph until [`OptimisticHandle::commit`].
#[derive(Default)]
pub struct Staging {
    patches: Vec<Patch>,
}

impl Staging {
    pub fn patch_entity(&mut self, entity_id: impl Into<RecordId>, fields: IndexMap<String, FieldValue>) {
        self.patches.push(Patch::Entity { entity_id: entity_id.into(), fields });
    }

    pub fn add_node(
        &mut self,
        canonical_key: impl Into<RecordId>,
        position: Position,
        node: JsonValue,
        edge_fields: IndexMap<String, FieldValue>,
    ) {
        self.patches.push(Patch::Connection {
            canonical_key: canonical_key.into(),
            op: ConnectionOp::AddNode { position, edge: EdgePatch { node, edge_fields } },
        });
    }

    pub fn remove_node(&mut self, canonical_key: impl Into<RecordId>, node_id: impl Into<RecordId>) {
        self.patches.push(Patch::Connection {
            canonical_key: canonical_key.into(),
            op: ConnectionOp::RemoveNode { node_id: node_id.into() },
        });
    }

    pub fn patch_page_info(&mut self, canonical_key: impl Into<RecordId>, fields: IndexMap<String, FieldValue>) {
        self.patches.push(Patch::Connection {
            canonical_key: canonical_key.into(),
            op: ConnectionOp::PatchPageInfo { fields },
        });
    }

    pub fn reorder(&mut self, canonical_key: impl Into<RecordId>, order: Vec<RecordId>) {
        self.patches.push(Patch::Connection { canonical_key: canonical_key.into(), op: ConnectionOp::Reorder { order } });
    }
}

/// The ordered sequence of committed transactions (spec §4.7). Cheap to
/// clone-and-share: callers hold it behind an `Rc`.
#[derive(Default)]
pub struct Optimistic {
    transactions: RefCell<IndexMap<u64, Vec<Patch>>>,
    next_id: Cell<u64>,
}

impl Optimistic {
    pub fn new() -> Self {
        Optimistic::default()
    }

    /// Stages a transaction without making it visible. The caller mutates
    /// `Staging` inside `build`; nothing reaches the graph until
    /// [`OptimisticHandle::commit`].
    pub fn modify(self: &Rc<Self>, graph: Rc<RefCell<Graph>>, build: impl FnOnce(&mut Staging)) -> OptimisticHandle {
        let mut staging = Staging::default();
        build(&mut staging);
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        OptimisticHandle {
            optimistic: self.clone(),
            graph,
            id,
            patches: RefCell::new(Some(staging.patches)),
        }
    }

    /// Re-derives the user-visible state of exactly `connections` from their
    /// committed `::base` (spec §4.4's "invoke Optimistic.replay" step,
    /// called once per canonical key touched by a normalize pass).
    pub fn replay(&self, graph: &mut Graph, connections: &[RecordId]) {
        self.apply_entity_patches(graph);
        for canonical_key in connections {
            self.replay_connection(graph, canonical_key);
        }
    }

    /// Re-derives every canonical connection with at least one active
    /// patch. Used by `commit`/`revert` so an optimistic transaction is
    /// visible immediately even with no intervening normalize (spec §8
    /// scenario 6).
    pub fn replay_all(&self, graph: &mut Graph) {
        self.apply_entity_patches(graph);
        for canonical_key in self.patched_connection_keys() {
            self.replay_connection(graph, &canonical_key);
        }
    }

    fn patched_connection_keys(&self) -> IndexSet<RecordId> {
        let mut keys = IndexSet::new();
        for patches in self.transactions.borrow().values() {
            for patch in patches {
                if let Patch::Connection { canonical_key, .. } = patch {
                    keys.insert(canonical_key.clone());
                }
            }
        }
        keys
    }

    /// Entity patches apply unconditionally on every replay: they're plain
    /// field writes, independent of which connections changed, and
    /// `Graph::put_record`'s same-value check makes redundant replays free.
    fn apply_entity_patches(&self, graph: &mut Graph) {
        for patches in self.transactions.borrow().values() {
            for patch in patches {
                if let Patch::Entity { entity_id, fields } = patch {
                    graph.put_record(entity_id, fields.clone());
                }
            }
        }
    }

    fn replay_connection(&self, graph: &mut Graph, canonical_key: &RecordId) {
        let base_key = RecordId::base_of(canonical_key);
        let Some(base) = graph.get_record(&base_key).cloned() else {
            // Unknown connection (not yet normalized): silently no-op, per
            // spec §4.7's "unknown entities/connections" rule.
            return;
        };

        let mut edges: Vec<RecordId> = base
            .get("edges")
            .and_then(FieldValue::as_ref_list)
            .map(<[RecordId]>::to_vec)
            .unwrap_or_default();

        let mut removed_nodes = Vec::new();
        let mut prepends = Vec::new();
        let mut appends = Vec::new();
        let mut page_info_overrides = IndexMap::new();
        let mut reorder = None;

        for patches in self.transactions.borrow().values() {
            for patch in patches {
                let Patch::Connection { canonical_key: key, op } = patch else { continue };
                if key != canonical_key {
                    continue;
                }
                match op {
                    ConnectionOp::RemoveNode { node_id } => removed_nodes.push(node_id.clone()),
                    ConnectionOp::AddNode { position: Position::Prepend, edge } => prepends.push(edge.clone()),
                    ConnectionOp::AddNode { position: Position::Append, edge } => appends.push(edge.clone()),
                    ConnectionOp::PatchPageInfo { fields } => {
                        for (k, v) in fields {
                            page_info_overrides.insert(k.clone(), v.clone());
                        }
                    }
                    ConnectionOp::Reorder { order } => reorder = Some(order.clone()),
                }
            }
        }

        // Replay order (spec §4.7): removes, then prepends, then appends,
        // then reorders.
        if !removed_nodes.is_empty() {
            edges.retain(|edge_id| {
                let node_id = graph.get_record(edge_id).and_then(|r| r.get("node")).and_then(FieldValue::as_ref_id);
                !node_id.map(|n| removed_nodes.contains(n)).unwrap_or(false)
            });
        }

        // Transaction order for prepends means the earliest-committed
        // prepend ends up adjacent to the pre-existing edges and the
        // latest-committed prepend ends up first.
        for (i, edge) in prepends.iter().enumerate().rev() {
            let edge_id = self.materialize_edge(graph, canonical_key, &format!("prepend:{i}"), edge);
            edges.insert(0, edge_id);
        }
        for (i, edge) in appends.iter().enumerate() {
            let edge_id = self.materialize_edge(graph, canonical_key, &format!("append:{i}"), edge);
            edges.push(edge_id);
        }

        if let Some(order) = reorder {
            let mut by_node: HashMap<RecordId, RecordId> = HashMap::new();
            for edge_id in &edges {
                if let Some(node_id) = graph.get_record(edge_id).and_then(|r| r.get("node")).and_then(FieldValue::as_ref_id) {
                    by_node.insert(node_id.clone(), edge_id.clone());
                }
            }
            let mut reordered: Vec<RecordId> = order.iter().filter_map(|node_id| by_node.get(node_id).cloned()).collect();
            for edge_id in &edges {
                if !reordered.contains(edge_id) {
                    reordered.push(edge_id.clone());
                }
            }
            edges = reordered;
        }

        let mut fields = base.fields.clone();
        fields.insert("edges".to_string(), FieldValue::RefList(edges));

        if !page_info_overrides.is_empty() {
            if let Some(page_info_id) = base.get("pageInfo").and_then(FieldValue::as_ref_id).cloned() {
                let overlay_id = RecordId::new(format!("{page_info_id}::optimistic"));
                let mut overlay_fields = graph.get_record(&page_info_id).map(|r| r.fields.clone()).unwrap_or_default();
                for (key, value) in page_info_overrides {
                    overlay_fields.insert(key, value);
                }
                graph.put_record(&overlay_id, overlay_fields);
                fields.insert("pageInfo".to_string(), FieldValue::Ref(overlay_id));
            }
        }

        graph.put_record(canonical_key, fields);
    }

    fn materialize_edge(&self, graph: &mut Graph, canonical_key: &RecordId, slot: &str, edge: &EdgePatch) -> RecordId {
        let node_id = graph.identify(&edge.node);
        let edge_id = RecordId::new(format!("{canonical_key}::optimistic:{slot}"));
        let mut fields = edge.edge_fields.clone();
        match node_id {
            Some(node_id) => {
                fields.insert("node".to_string(), FieldValue::Ref(node_id));
            }
            None => {
                fields.insert("node".to_string(), FieldValue::Scalar(edge.node.clone()));
            }
        }
        graph.put_record(&edge_id, fields);
        edge_id
    }
}

/// A staged (or committed) transaction. `commit`/`revert` may each be called
/// once; calling either again is a silent no-op (there's nothing left to
/// commit or remove).
pub struct OptimisticHandle {
    optimistic: Rc<Optimistic>,
    graph: Rc<RefCell<Graph>>,
    id: u64,
    patches: RefCell<Option<Vec<Patch>>>,
}

impl OptimisticHandle {
    pub fn commit(&self) {
        if let Some(patches) = self.patches.borrow_mut().take() {
            tracing::debug!(transaction = self.id, patches = patches.len(), "committing optimistic transaction");
            self.optimistic.transactions.borrow_mut().insert(self.id, patches);
            self.optimistic.replay_all(&mut self.graph.borrow_mut());
        }
    }

    pub fn revert(&self) {
        self.patches.borrow_mut().take();
        if self.optimistic.transactions.borrow_mut().shift_remove(&self.id).is_some() {
            tracing::debug!(transaction = self.id, "reverting optimistic transaction");
            self.optimistic.replay_all(&mut self.graph.borrow_mut());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::record::Record;
    use std::sync::Arc;

    fn graph() -> Rc<RefCell<Graph>> {
        Rc::new(RefCell::new(Graph::new(Arc::new(CacheConfig::builder().build()), |_| {})))
    }

    fn seed_base(graph: &Rc<RefCell<Graph>>, canonical_key: &RecordId, node_ids: &[&str]) {
        let mut g = graph.borrow_mut();
        let mut edges = Vec::new();
        for (i, id) in node_ids.iter().enumerate() {
            let edge_id = RecordId::new(format!("{canonical_key}.edges:{i}"));
            let mut edge_fields = IndexMap::new();
            edge_fields.insert("__typename".to_string(), FieldValue::Scalar(JsonValue::String("UserEdge".into())));
            edge_fields.insert("node".to_string(), FieldValue::Ref(RecordId::entity("User", id)));
            g.put_record(&edge_id, edge_fields);
            edges.push(edge_id);
        }
        let mut base_fields = IndexMap::new();
        base_fields.insert("__typename".to_string(), FieldValue::Scalar(JsonValue::String("UserConnection".into())));
        base_fields.insert("edges".to_string(), FieldValue::RefList(edges));
        g.put_record(&RecordId::base_of(canonical_key), base_fields);
    }

    fn edge_node_ids(graph: &Rc<RefCell<Graph>>, canonical_key: &RecordId) -> Vec<String> {
        let g = graph.borrow();
        let record = g.get_record(canonical_key).unwrap();
        record
            .get("edges")
            .and_then(FieldValue::as_ref_list)
            .unwrap()
            .iter()
            .map(|edge_id| {
                g.get_record(edge_id)
                    .and_then(|r| r.get("node"))
                    .and_then(FieldValue::as_ref_id)
                    .unwrap()
                    .as_str()
                    .to_string()
            })
            .collect()
    }

    #[test]
    fn prepend_and_remove_then_revert() {
        let graph = graph();
        let canonical_key = RecordId::new("@connection.users({})");
        seed_base(&graph, &canonical_key, &["User:1", "User:2", "User:3"]);

        let optimistic = Rc::new(Optimistic::new());
        let handle = optimistic.modify(graph.clone(), |staging| {
            staging.add_node(
                canonical_key.clone(),
                Position::Prepend,
                serde_json_bytes::json!({"__typename": "User", "id": "9"}),
                IndexMap::new(),
            );
            staging.remove_node(canonical_key.clone(), RecordId::entity("User", "2"));
        });
        handle.commit();

        assert_eq!(edge_node_ids(&graph, &canonical_key), vec!["User:9", "User:1", "User:3"]);

        handle.revert();
        assert_eq!(edge_node_ids(&graph, &canonical_key), vec!["User:1", "User:2", "User:3"]);
    }

    #[test]
    fn entity_patches_apply_on_commit() {
        let graph = graph();
        let optimistic = Rc::new(Optimistic::new());
        let user = RecordId::entity("User", "1");
        graph.borrow_mut().put_record(&user, Record::new("User").fields);

        let handle = optimistic.modify(graph.clone(), |staging| {
            let mut fields = IndexMap::new();
            fields.insert("email".to_string(), FieldValue::Scalar(JsonValue::String("new@x.com".into())));
            staging.patch_entity(user.clone(), fields);
        });
        handle.commit();

        let g = graph.borrow();
        let record = g.get_record(&user).unwrap();
        assert_eq!(
            record.get("email").and_then(FieldValue::as_scalar),
            Some(&JsonValue::String("new@x.com".into()))
        );
    }

    #[test]
    fn unknown_connection_is_silent_no_op() {
        let graph = graph();
        let optimistic = Rc::new(Optimistic::new());
        let handle = optimistic.modify(graph.clone(), |staging| {
            staging.remove_node(RecordId::new("@connection.ghost({})"), RecordId::entity("User", "1"));
        });
        handle.commit();
    }
}
