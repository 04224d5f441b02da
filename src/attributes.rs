//! Memoised attribute grammar over the graph.
//!
//! An attribute is a pure function of a node (plus the graph it lives in),
//! computed at most once per `(attribute-name, node-id)` pair and cached in a
//! table that lives for one planner run. The table is shared mutable state
//! guarded by a single lock: attribute results must be visible across executor
//! threads loading environments, so thread-local memoisation is deliberately
//! not used. Contention is acceptable: attribute reads are short and most of
//! the wall-clock time is inside job execution.
//!
//! Attributes may reference one another. A cycle in attribute definitions is
//! a programmer error: a per-`(attribute, id)` recursion guard detects
//! re-entry by the same thread and fails fast.
//!
//! Computed scalar *environments* live in the same table (see
//! [`Attributes::push_env`]), which serialises environment pushes from
//! concurrently configured jobs through the one lock.

use crate::bridge::Bridge;
use crate::graph::Graph;
use crate::ids::NodeId;
use crate::node::Node;
use crate::wire::Env;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

type Key = (&'static str, NodeId);

#[derive(Default)]
struct AttrTable {
    memo: HashMap<Key, Arc<dyn Any + Send + Sync>>,
    graph_memo: HashMap<&'static str, Arc<dyn Any + Send + Sync>>,
    in_progress: HashSet<(Key, ThreadId)>,
    envs: HashMap<NodeId, Env>,
    bridges: HashMap<NodeId, Bridge>,
}

/// The attribute table for one planner run.
#[derive(Default)]
pub struct Attributes {
    table: Mutex<AttrTable>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Memoise `f` under `(attr, id)`.
    ///
    /// The lock is released while `f` runs so attribute definitions can
    /// recurse into other attributes; the guard catches self-reference.
    ///
    /// # Panics
    /// If computing `(attr, id)` re-enters itself on the same thread, i.e. a cycle
    /// in the attribute definitions.
    pub fn memo<T, F>(&self, attr: &'static str, id: NodeId, f: F) -> T
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        let key = (attr, id);
        let me = thread::current().id();
        {
            let mut t = self.table.lock().expect("attribute table lock");
            if let Some(v) = t.memo.get(&key) {
                return v
                    .downcast_ref::<T>()
                    .expect("attribute value type")
                    .clone();
            }
            if !t.in_progress.insert((key, me)) {
                panic!("attribute cycle: {attr} re-entered on {id:?}");
            }
        }
        let value = f();
        let mut t = self.table.lock().expect("attribute table lock");
        t.in_progress.remove(&(key, me));
        t.memo.insert(key, Arc::new(value.clone()));
        value
    }

    /// Memoise a whole-graph attribute (no node key).
    fn memo_graph<T, F>(&self, attr: &'static str, f: F) -> Arc<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        {
            let t = self.table.lock().expect("attribute table lock");
            if let Some(v) = t.graph_memo.get(attr) {
                return v.clone().downcast::<T>().expect("attribute value type");
            }
        }
        let value: Arc<T> = Arc::new(f());
        let mut t = self.table.lock().expect("attribute table lock");
        let stored = t
            .graph_memo
            .entry(attr)
            .or_insert_with(|| value as Arc<dyn Any + Send + Sync>);
        stored.clone().downcast::<T>().expect("attribute value type")
    }

    // |---------------------|
    // | Standard attributes |
    // |---------------------|

    /// Direct parents of `n` (nodes with an edge into `n`), ascending.
    pub fn parents(&self, g: &Graph, n: NodeId) -> Vec<NodeId> {
        let map = self.memo_graph("parents-map", || g.parents_map());
        self.memo("parents", n, || map.get(&n).cloned().unwrap_or_default())
    }

    /// Number of uses of `n` (its fan-out).
    pub fn uses(&self, g: &Graph, n: NodeId) -> usize {
        self.memo("uses", n, || self.parents(g, n).len())
    }

    /// The `ParallelDo`s consuming `n` as their environment.
    pub fn uses_as_environment(&self, g: &Graph, n: NodeId) -> Vec<NodeId> {
        self.memo("uses-as-environment", n, || {
            self.parents(g, n)
                .into_iter()
                .filter(|p| matches!(g.node(*p), Node::ParallelDo { env, .. } if env == n))
                .collect()
        })
    }

    /// All ancestors of `n` (transitive inputs), ascending.
    pub fn ancestors(&self, g: &Graph, n: NodeId) -> Vec<NodeId> {
        self.memo("ancestors", n, || {
            let mut seen = HashSet::new();
            let mut stack = g.node(n).inputs();
            while let Some(id) = stack.pop() {
                if seen.insert(id) {
                    stack.extend(g.node(id).inputs());
                }
            }
            let mut out: Vec<NodeId> = seen.into_iter().collect();
            out.sort();
            out
        })
    }

    /// `Load` nodes reachable below `n`, ascending.
    pub fn reachable_inputs(&self, g: &Graph, n: NodeId) -> Vec<NodeId> {
        self.memo("reachable-inputs", n, || {
            self.ancestors(g, n)
                .into_iter()
                .filter(|id| matches!(g.node(*id), Node::Load { .. }))
                .collect()
        })
    }

    /// Sink-bearing nodes at or above `n` (transitive parents), ascending.
    pub fn reachable_outputs(&self, g: &Graph, n: NodeId) -> Vec<NodeId> {
        self.memo("reachable-outputs", n, || {
            let mut seen = HashSet::new();
            let mut stack = vec![n];
            while let Some(id) = stack.pop() {
                if seen.insert(id) {
                    stack.extend(self.parents(g, id));
                }
            }
            let mut out: Vec<NodeId> = seen
                .into_iter()
                .filter(|id| !g.sinks_of(*id).is_empty())
                .collect();
            out.sort();
            out
        })
    }

    /// Whether `n` can own a bridge.
    pub fn is_process_node(&self, g: &Graph, n: NodeId) -> bool {
        self.memo("is-process-node", n, || g.node(n).is_process_node())
    }

    // |--------------------------|
    // | Bridges and environments |
    // |--------------------------|

    /// Record the bridge assigned to process node `n` by the planner.
    pub fn set_bridge(&self, n: NodeId, bridge: Bridge) {
        let mut t = self.table.lock().expect("attribute table lock");
        t.bridges.insert(n, bridge);
    }

    /// The bridge owned by `n`, if the planner assigned one.
    pub fn bridge_store_of(&self, n: NodeId) -> Option<Bridge> {
        let t = self.table.lock().expect("attribute table lock");
        t.bridges.get(&n).cloned()
    }

    /// Push a computed scalar value for `Exp` node `n`.
    ///
    /// Serialised through the table lock: parallel MSCRs in one layer may each
    /// try to pre-load the same environment.
    pub fn push_env(&self, n: NodeId, env: Env) {
        let mut t = self.table.lock().expect("attribute table lock");
        t.envs.insert(n, env);
    }

    /// The pushed value of `Exp` node `n`, if computed.
    pub fn env_of(&self, n: NodeId) -> Option<Env> {
        let t = self.table.lock().expect("attribute table lock");
        t.envs.get(&n).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemorySource;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn memo_computes_once() {
        let g = Graph::default();
        let n = g.load(Arc::new(MemorySource::new("in", vec![1u8, 2, 3])));
        let attrs = Attributes::new();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let v: usize = attrs.memo("test-attr", n, || {
                calls.fetch_add(1, Ordering::SeqCst);
                41 + 1
            });
            assert_eq!(v, 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "attribute cycle")]
    fn recursion_guard_fails_fast() {
        let g = Graph::default();
        let n = g.load(Arc::new(MemorySource::new("in", vec![1u8])));
        let attrs = Attributes::new();
        fn looping(attrs: &Attributes, n: NodeId) -> usize {
            attrs.memo("loop-attr", n, || looping(attrs, n))
        }
        looping(&attrs, n);
    }
}
