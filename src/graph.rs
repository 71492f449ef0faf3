//! The versioned record store (spec §4.3).
//!
//! Single-threaded cooperative: nothing here is `Send`/`Sync`, and callers
//! must not call [`Graph::put_record`] from inside the `on_change`
//! callback — that reentrancy is explicitly forbidden by spec §4.3/§5 and
//! is asserted against at runtime rather than silently tolerated.
use std::rc::Rc;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};

use crate::config::{identify, CacheConfig};
use crate::record::{Record, RecordId};
use serde_json_bytes::Value as JsonValue;

/// A scheduler the host plugs a runtime into for the cooperative
/// micro-deferral described in spec §4.3/§5 and the Design Notes. The core
/// never binds to a specific runtime's microtask queue itself.
pub trait Scheduler {
    fn schedule(&self, task: Box<dyn FnOnce()>);
}

/// Runs the task immediately; used by tests and any caller that always
/// calls [`Graph::flush`] explicitly instead of relying on deferral.
pub struct ImmediateScheduler;

impl Scheduler for ImmediateScheduler {
    fn schedule(&self, task: Box<dyn FnOnce()>) {
        task();
    }
}

pub struct Graph {
    config: Arc<CacheConfig>,
    records: IndexMap<RecordId, Record>,
    versions: IndexMap<RecordId, u64>,
    global_clock: u64,
    pending_changes: IndexSet<RecordId>,
    on_change: Box<dyn FnMut(&IndexSet<RecordId>)>,
    /// Set by the owner so a first pending write per batch can be told
    /// about exactly once; see [`Graph::set_pending_hook`].
    pending_hook: Option<Box<dyn Fn()>>,
    armed: bool,
    in_on_change: bool,
}

impl Graph {
    pub fn new(config: Arc<CacheConfig>, on_change: impl FnMut(&IndexSet<RecordId>) + 'static) -> Self {
        let mut graph = Graph {
            config,
            records: IndexMap::new(),
            versions: IndexMap::new(),
            global_clock: 0,
            pending_changes: IndexSet::new(),
            on_change: Box::new(on_change),
            pending_hook: None,
            armed: false,
            in_on_change: false,
        };
        graph.seed_root();
        graph
    }

    fn seed_root(&mut self) {
        let root = RecordId::root();
        self.records.insert(root.clone(), Record::new("Query"));
        self.versions.insert(root, 1);
        self.global_clock = 1;
    }

    /// Installs the cooperative-deferral hook. Called once per batch, the
    /// moment `pending_changes` transitions from empty to non-empty; the
    /// host typically wires this to `scheduler.schedule(|| graph.flush())`
    /// via its own shared handle to this graph.
    pub fn set_pending_hook(&mut self, hook: impl Fn() + 'static) {
        self.pending_hook = Some(Box::new(hook));
    }

    pub fn identify(&self, value: &JsonValue) -> Option<RecordId> {
        identify(&self.config, value)
    }

    pub fn config(&self) -> &Arc<CacheConfig> {
        &self.config
    }

    /// Shallow-merges `partial` into the existing record at `id` (creating
    /// it, with `__typename` required, if absent). Per spec §4.3: fields
    /// whose new value is structurally identical to the current one do not
    /// count as a change; any change (or record creation) bumps the global
    /// clock once and marks `id` pending. Root-record link writes also
    /// enqueue the `"<root>.<field>(<args>)"` pseudo-key so field-level
    /// watchers observe the link without depending on the linked entity.
    pub fn put_record(&mut self, id: &RecordId, partial: IndexMap<String, crate::record::FieldValue>) {
        assert!(
            !self.in_on_change,
            "Graph::put_record called reentrantly from within on_change"
        );

        let is_new = !self.records.contains_key(id);
        let record = self
            .records
            .entry(id.clone())
            .or_insert_with(Record::default);

        let mut changed = false;
        let mut changed_link_keys = Vec::new();
        for (key, value) in partial {
            let differs = match record.fields.get(&key) {
                Some(existing) => !existing.same_value(&value),
                None => true,
            };
            if differs {
                let is_link = matches!(
                    value,
                    crate::record::FieldValue::Ref(_) | crate::record::FieldValue::RefList(_)
                );
                record.fields.insert(key.clone(), value);
                changed = true;
                if is_link {
                    changed_link_keys.push(key);
                }
            }
        }

        if is_new || changed {
            self.bump_version(id.clone());
            if id.is_root() {
                for key in changed_link_keys {
                    self.mark_pending(RecordId::pseudo_field(id, &key));
                }
            }
        }
    }

    fn bump_version(&mut self, id: RecordId) {
        self.global_clock += 1;
        let clock = self.global_clock;
        self.versions.insert(id.clone(), clock);
        self.mark_pending(id);
    }

    fn mark_pending(&mut self, id: RecordId) {
        let was_empty = self.pending_changes.is_empty();
        self.pending_changes.insert(id);
        if was_empty && !self.armed {
            self.armed = true;
            if let Some(hook) = &self.pending_hook {
                hook();
            }
        }
    }

    pub fn get_record(&self, id: &RecordId) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn get_version(&self, id: &RecordId) -> u64 {
        self.versions.get(id).copied().unwrap_or(0)
    }

    /// Deletes the record, zeroes its version, and marks it pending.
    pub fn remove_record(&mut self, id: &RecordId) {
        tracing::debug!(record = %id, "removing record");
        self.records.shift_remove(id);
        self.versions.insert(id.clone(), 0);
        self.mark_pending(id.clone());
    }

    pub fn keys(&self) -> impl Iterator<Item = &RecordId> {
        self.records.keys()
    }

    /// Read-only diagnostic snapshot (peripheral Inspect/SSR surface).
    pub fn inspect(&self) -> &IndexMap<RecordId, Record> {
        &self.records
    }

    pub fn versions(&self) -> &IndexMap<RecordId, u64> {
        &self.versions
    }

    pub fn global_clock(&self) -> u64 {
        self.global_clock
    }

    /// Replaces the store atomically for `dehydrate`/`hydrate` round-trips
    /// (spec §6): records are trusted as-is, no re-validation, and any
    /// pending notifications from before the swap are dropped rather than
    /// delivered.
    pub fn hydrate(&mut self, records: IndexMap<RecordId, Record>, versions: IndexMap<RecordId, u64>, global_clock: u64) {
        self.records = records;
        self.versions = versions;
        self.global_clock = global_clock;
        self.pending_changes.clear();
        self.armed = false;
        if !self.records.contains_key(&RecordId::root()) {
            self.seed_root();
        }
    }

    /// Clears everything and resets the clock; pending notifications are
    /// dropped, not delivered (spec §4.3). The root record is re-seeded so
    /// the "root always exists" invariant holds immediately afterward.
    pub fn evict_all(&mut self) {
        tracing::debug!(records = self.records.len(), "evicting all records");
        self.records.clear();
        self.versions.clear();
        self.pending_changes.clear();
        self.global_clock = 0;
        self.armed = false;
        self.seed_root();
    }

    /// Synchronously delivers `on_change(pending_changes)` and clears the
    /// set, suppressing any scheduled async delivery for this batch.
    pub fn flush(&mut self) {
        if self.pending_changes.is_empty() {
            self.armed = false;
            return;
        }
        let changes = std::mem::take(&mut self.pending_changes);
        tracing::trace!(changes = changes.len(), "flushing pending changes");
        self.in_on_change = true;
        (self.on_change)(&changes);
        self.in_on_change = false;
        self.armed = false;
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.pending_changes.is_empty()
    }
}

/// Wires a [`Graph`]'s cooperative deferral hook to a [`Scheduler`] without
/// the graph needing a self-reference: `owner` is typically an
/// `Rc<RefCell<Graph>>` held by the same `Cache` that owns `graph`.
pub fn bind_scheduler(graph: &mut Graph, owner: Rc<std::cell::RefCell<Graph>>, scheduler: Arc<dyn Scheduler>) {
    graph.set_pending_hook(move || {
        let owner = owner.clone();
        scheduler.schedule(Box::new(move || {
            owner.borrow_mut().flush();
        }));
    });
}
