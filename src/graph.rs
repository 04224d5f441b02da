//! In-memory representation of a computation graph.
//!
//! The [`Graph`] is the arena for all [`Node`]s: values stored once, keyed by
//! [`NodeId`], with edges as ids. It is lightweight, cloneable, and
//! thread-safe via internal `Arc<Mutex<_>>` wrapping, so builder contexts and
//! the planner can share one graph.
//!
//! # Overview
//! - Typed constructors (`load`, `parallel_do`, `group_by_key`, `combine`,
//!   `flatten`, `ret`, `op`, `materialise`) insert nodes and capture the
//!   type-erased closures each variant needs at runtime.
//! - Sinks are registered per node via [`Graph::add_sink`].
//! - The optimiser works on a [`Graph::deep_copy`]; fresh ids minted there
//!   never collide with the original because the id counter is shared.
//! - [`Graph::validate`] runs the pre-execution validation pass: shape
//!   soundness on every edge, acyclicity, dangling edges, duplicate sinks.
//!
//! No node is mutated after construction; rewrites replace whole entries.

use crate::dofn::{DoFn, Emitter};
use crate::ids::{IdGen, NodeId};
use crate::io::{DataSink, DataSource};
use crate::node::{BinOpFn, MergeFn, Node, PartFn, Shape, ShardFn};
use crate::wire::{wire_format_for, Env, Item, Partition, TypeTag, WireFormat};
use anyhow::{bail, Result};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

/// Thread-safe arena holding all nodes of one computation graph.
///
/// The `Graph` itself is cheaply cloneable; all clones share the same
/// underlying `GraphInner`. Use [`Graph::deep_copy`] for an independent copy
/// (the optimiser's working graph).
pub struct Graph {
    pub(crate) inner: Arc<Mutex<GraphInner>>,
    pub(crate) ids: IdGen,
}

pub(crate) struct GraphInner {
    pub nodes: HashMap<NodeId, Node>,
    pub wires: HashMap<NodeId, WireFormat>,
    pub sinks: HashMap<NodeId, Vec<Arc<dyn DataSink>>>,
}

impl Default for Graph {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(GraphInner {
                nodes: HashMap::new(),
                wires: HashMap::new(),
                sinks: HashMap::new(),
            })),
            ids: IdGen::default(),
        }
    }
}

impl Clone for Graph {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            ids: self.ids.clone(),
        }
    }
}

/// Hash a key into one of `n` reducer buckets.
pub(crate) fn key_bucket<K: Hash>(key: &K, n: usize) -> usize {
    let mut h = DefaultHasher::new();
    key.hash(&mut h);
    (h.finish() % n.max(1) as u64) as usize
}

impl Graph {
    fn insert(&self, node: Node, wire: WireFormat) -> NodeId {
        let id = self.ids.next_node();
        let mut g = self.inner.lock().expect("graph lock");
        g.nodes.insert(id, node);
        g.wires.insert(id, wire);
        id
    }

    fn tag_of(&self, id: NodeId) -> TypeTag {
        self.inner
            .lock()
            .expect("graph lock")
            .wires
            .get(&id)
            .unwrap_or_else(|| panic!("unknown node {id:?}"))
            .tag
    }

    // |--------------|
    // | Constructors |
    // |--------------|

    /// Read a distributed collection from an external source.
    pub fn load(&self, source: Arc<dyn DataSource>) -> NodeId {
        let wire = source.wire();
        self.insert(Node::Load { source }, wire)
    }

    /// A `ParallelDo` with the unit environment and no barriers.
    pub fn parallel_do<O: Clone + Send + Sync + 'static>(
        &self,
        input: NodeId,
        fun: Arc<dyn DoFn>,
    ) -> NodeId {
        let env = self.ret(());
        self.parallel_do_full::<O>(input, env, fun, false, false)
    }

    /// A `ParallelDo` with an explicit environment and no barriers.
    pub fn parallel_do_env<O: Clone + Send + Sync + 'static>(
        &self,
        input: NodeId,
        env: NodeId,
        fun: Arc<dyn DoFn>,
    ) -> NodeId {
        self.parallel_do_full::<O>(input, env, fun, false, false)
    }

    /// A `ParallelDo` with explicit environment and barrier flags.
    ///
    /// # Panics
    /// If `input` is not `Arr`-shaped or `env` is not `Exp`-shaped.
    pub fn parallel_do_full<O: Clone + Send + Sync + 'static>(
        &self,
        input: NodeId,
        env: NodeId,
        fun: Arc<dyn DoFn>,
        group_barrier: bool,
        fuse_barrier: bool,
    ) -> NodeId {
        assert_eq!(self.shape(input), Shape::Arr, "ParallelDo input must be Arr");
        assert_eq!(self.shape(env), Shape::Exp, "ParallelDo environment must be Exp");
        self.insert(
            Node::ParallelDo {
                input,
                env,
                fun,
                group_barrier,
                fuse_barrier,
            },
            wire_format_for::<O>(),
        )
    }

    /// Shuffle an `Arr` of `(K, V)` into an `Arr` of `(K, Vec<V>)`.
    ///
    /// # Panics
    /// If the input's element type is not `(K, V)`.
    pub fn group_by_key<K, V>(&self, input: NodeId) -> NodeId
    where
        K: Clone + Send + Sync + Eq + Hash + 'static,
        V: Clone + Send + Sync + 'static,
    {
        assert_eq!(
            self.tag_of(input),
            TypeTag::of::<(K, V)>(),
            "GroupByKey input element type mismatch"
        );

        let shard: ShardFn = Arc::new(|p: Partition, n: usize| -> Vec<Partition> {
            let kv = *p.downcast::<Vec<(K, V)>>().expect("GBK shard: bad input");
            let mut buckets: Vec<Vec<(K, V)>> = (0..n.max(1)).map(|_| Vec::new()).collect();
            for (k, v) in kv {
                let b = key_bucket(&k, n);
                buckets[b].push((k, v));
            }
            buckets
                .into_iter()
                .map(|b| Box::new(b) as Partition)
                .collect()
        });

        let local: PartFn = Arc::new(|p: Partition| -> Partition {
            let kv = *p.downcast::<Vec<(K, V)>>().expect("GBK local: bad input");
            let mut m: HashMap<K, Vec<V>> = HashMap::new();
            for (k, v) in kv {
                m.entry(k).or_default().push(v);
            }
            Box::new(m) as Partition
        });

        let merge: MergeFn = Arc::new(|parts: Vec<Partition>| -> Partition {
            let mut acc: HashMap<K, Vec<V>> = HashMap::new();
            for p in parts {
                let m = *p
                    .downcast::<HashMap<K, Vec<V>>>()
                    .expect("GBK merge: bad part");
                for (k, vs) in m {
                    acc.entry(k).or_default().extend(vs);
                }
            }
            Box::new(acc.into_iter().collect::<Vec<(K, Vec<V>)>>()) as Partition
        });

        self.insert(
            Node::GroupByKey {
                input,
                shard,
                local,
                merge,
            },
            wire_format_for::<(K, Vec<V>)>(),
        )
    }

    /// Reduce each value-group of a grouped `Arr` with an associative op.
    ///
    /// Empty value-groups are skipped: they produce no output pair. A group
    /// coming out of a shuffle always has at least one value.
    ///
    /// # Panics
    /// If the input's element type is not `(K, Vec<V>)`.
    pub fn combine<K, V>(
        &self,
        input: NodeId,
        op: Arc<dyn Fn(V, V) -> V + Send + Sync>,
    ) -> NodeId
    where
        K: Clone + Send + Sync + Eq + Hash + 'static,
        V: Clone + Send + Sync + 'static,
    {
        assert_eq!(
            self.tag_of(input),
            TypeTag::of::<(K, Vec<V>)>(),
            "Combine input element type mismatch"
        );

        let reduce_op = Arc::clone(&op);
        let reduce: PartFn = Arc::new(move |p: Partition| -> Partition {
            let groups = *p
                .downcast::<Vec<(K, Vec<V>)>>()
                .expect("Combine reduce: bad input");
            let mut out: Vec<(K, V)> = Vec::with_capacity(groups.len());
            for (k, vs) in groups {
                if let Some(v) = vs.into_iter().reduce(|a, b| reduce_op(a, b)) {
                    out.push((k, v));
                }
            }
            Box::new(out) as Partition
        });

        let fun: Arc<dyn DoFn> = Arc::new(CombineDoFn::<K, V> {
            op,
            _t: std::marker::PhantomData,
        });

        self.insert(Node::Combine { input, reduce, fun }, wire_format_for::<(K, V)>())
    }

    /// Concatenate same-typed `Arr` inputs.
    ///
    /// # Panics
    /// If `inputs` is empty or the element types differ.
    pub fn flatten(&self, inputs: Vec<NodeId>) -> NodeId {
        assert!(!inputs.is_empty(), "Flatten needs at least one input");
        let wire = self.wire(inputs[0]);
        for i in &inputs {
            assert_eq!(self.shape(*i), Shape::Arr, "Flatten inputs must be Arr");
            assert_eq!(
                self.tag_of(*i),
                wire.tag,
                "Flatten inputs must share one element type"
            );
        }
        self.insert(Node::Flatten { inputs }, wire)
    }

    /// A constant scalar.
    pub fn ret<T: Clone + Send + Sync + 'static>(&self, value: T) -> NodeId {
        self.insert(
            Node::Return {
                value: Arc::new(value) as Env,
            },
            wire_format_for::<T>(),
        )
    }

    /// Combine two scalars with `f`.
    ///
    /// # Panics
    /// If either input is not `Exp`-shaped.
    pub fn op<A, B, C, F>(&self, left: NodeId, right: NodeId, f: F) -> NodeId
    where
        A: Send + Sync + 'static,
        B: Send + Sync + 'static,
        C: Clone + Send + Sync + 'static,
        F: Fn(&A, &B) -> C + Send + Sync + 'static,
    {
        assert_eq!(self.shape(left), Shape::Exp, "Op inputs must be Exp");
        assert_eq!(self.shape(right), Shape::Exp, "Op inputs must be Exp");
        let apply: BinOpFn = Arc::new(move |a: &Env, b: &Env| -> Env {
            let x = a.downcast_ref::<A>().expect("Op: left operand type");
            let y = b.downcast_ref::<B>().expect("Op: right operand type");
            Arc::new(f(x, y)) as Env
        });
        self.insert(Node::Op { left, right, apply }, wire_format_for::<C>())
    }

    /// Collect an entire `Arr` of `T` into one scalar `Vec<T>`.
    ///
    /// # Panics
    /// If the input's element type is not `T`.
    pub fn materialise<T: Clone + Send + Sync + 'static>(&self, input: NodeId) -> NodeId {
        assert_eq!(
            self.tag_of(input),
            TypeTag::of::<T>(),
            "Materialise input element type mismatch"
        );
        let collect = Arc::new(|parts: Vec<Partition>| -> Env {
            let mut all = Vec::<T>::new();
            for p in parts {
                let v = *p.downcast::<Vec<T>>().expect("Materialise: bad partition");
                all.extend(v);
            }
            Arc::new(all) as Env
        });
        self.insert(Node::Materialise { input, collect }, wire_format_for::<T>())
    }

    /// Register a user-facing output for `node`.
    ///
    /// # Panics
    /// If `node` is not a process node (sinks hang off persisted outputs).
    pub fn add_sink(&self, node: NodeId, sink: Arc<dyn DataSink>) {
        assert!(
            self.node(node).is_process_node(),
            "sinks attach to process nodes"
        );
        let mut g = self.inner.lock().expect("graph lock");
        g.sinks.entry(node).or_default().push(sink);
    }

    // |-----------|
    // | Accessors |
    // |-----------|

    /// Clone of the node stored under `id`.
    ///
    /// # Panics
    /// If `id` is not in this graph.
    pub fn node(&self, id: NodeId) -> Node {
        self.inner
            .lock()
            .expect("graph lock")
            .nodes
            .get(&id)
            .unwrap_or_else(|| panic!("unknown node {id:?}"))
            .clone()
    }

    /// The wire format of `id`'s output.
    pub fn wire(&self, id: NodeId) -> WireFormat {
        self.inner
            .lock()
            .expect("graph lock")
            .wires
            .get(&id)
            .unwrap_or_else(|| panic!("unknown node {id:?}"))
            .clone()
    }

    /// The shape of `id`'s output.
    pub fn shape(&self, id: NodeId) -> Shape {
        self.node(id).shape()
    }

    /// Sinks registered on `id`.
    pub fn sinks_of(&self, id: NodeId) -> Vec<Arc<dyn DataSink>> {
        self.inner
            .lock()
            .expect("graph lock")
            .sinks
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// All node ids currently in the arena, in ascending order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .inner
            .lock()
            .expect("graph lock")
            .nodes
            .keys()
            .copied()
            .collect();
        ids.sort();
        ids
    }

    /// Number of nodes in the arena.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("graph lock").nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Independent copy of the arena. Node ids are preserved; the id counter
    /// stays shared, so ids minted in the copy never collide with the
    /// original's.
    #[must_use]
    pub fn deep_copy(&self) -> Graph {
        let g = self.inner.lock().expect("graph lock");
        Graph {
            inner: Arc::new(Mutex::new(GraphInner {
                nodes: g.nodes.clone(),
                wires: g.wires.clone(),
                sinks: g.sinks.clone(),
            })),
            ids: self.ids.clone(),
        }
    }

    // |------------------------|
    // | Plan-side mutation     |
    // |------------------------|
    //
    // Used only by the optimiser and the skip-already-computed prune, on a
    // deep copy. The user-built graph is never touched.

    pub(crate) fn replace(&self, id: NodeId, node: Node) {
        let mut g = self.inner.lock().expect("graph lock");
        g.nodes.insert(id, node);
    }

    pub(crate) fn insert_fresh(&self, node: Node, wire: WireFormat) -> NodeId {
        self.insert(node, wire)
    }

    pub(crate) fn contains(&self, id: NodeId) -> bool {
        self.inner.lock().expect("graph lock").nodes.contains_key(&id)
    }

    pub(crate) fn remove(&self, id: NodeId) {
        let mut g = self.inner.lock().expect("graph lock");
        g.nodes.remove(&id);
        g.wires.remove(&id);
        g.sinks.remove(&id);
    }

    pub(crate) fn move_sinks(&self, from: NodeId, to: NodeId) {
        let mut g = self.inner.lock().expect("graph lock");
        if let Some(s) = g.sinks.remove(&from) {
            g.sinks.entry(to).or_default().extend(s);
        }
    }

    /// Drop every node not reachable from `roots`.
    pub(crate) fn gc(&self, roots: &[NodeId]) {
        let mut live = HashSet::new();
        let mut stack: Vec<NodeId> = roots.to_vec();
        while let Some(id) = stack.pop() {
            if live.insert(id) {
                stack.extend(self.node(id).inputs());
            }
        }
        let mut g = self.inner.lock().expect("graph lock");
        g.nodes.retain(|id, _| live.contains(id));
        g.wires.retain(|id, _| live.contains(id));
        g.sinks.retain(|id, _| live.contains(id));
    }

    /// Map of child -> parents over the whole arena.
    pub(crate) fn parents_map(&self) -> HashMap<NodeId, Vec<NodeId>> {
        let g = self.inner.lock().expect("graph lock");
        let mut m: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        let mut ids: Vec<&NodeId> = g.nodes.keys().collect();
        ids.sort();
        for id in ids {
            for input in g.nodes[id].inputs() {
                m.entry(input).or_default().push(*id);
            }
        }
        m
    }

    // |------------|
    // | Validation |
    // |------------|

    /// Pre-execution validation pass.
    ///
    /// Checks, over every node in the arena:
    /// - all referenced input ids exist (no dangling edges)
    /// - the shape of every input matches the shape the parent expects at
    ///   that position
    /// - the graph is a DAG (no node transitively reaches itself)
    /// - no two sinks share an output id
    ///
    /// # Errors
    /// A validation error describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let snapshot: Vec<(NodeId, Node)> = {
            let g = self.inner.lock().expect("graph lock");
            let mut v: Vec<(NodeId, Node)> = g
                .nodes
                .iter()
                .map(|(id, n)| (*id, n.clone()))
                .collect();
            v.sort_by_key(|(id, _)| *id);
            v
        };
        let known: HashSet<NodeId> = snapshot.iter().map(|(id, _)| *id).collect();

        for (id, node) in &snapshot {
            let inputs = node.inputs();
            let expected = node.input_shapes();
            for (pos, (input, want)) in inputs.iter().zip(expected.iter()).enumerate() {
                if !known.contains(input) {
                    bail!("validation: {:?} input #{pos} references unknown node {input:?}", id);
                }
                let got = self.shape(*input);
                if got != *want {
                    bail!(
                        "validation: {:?} ({}) input #{pos} is {:?}-shaped, expected {:?}",
                        id,
                        node.kind(),
                        got,
                        want
                    );
                }
            }
        }

        // Cycle check: iterative DFS with colouring.
        #[derive(Clone, Copy, PartialEq)]
        enum Colour {
            White,
            Grey,
            Black,
        }
        let mut colour: HashMap<NodeId, Colour> =
            known.iter().map(|id| (*id, Colour::White)).collect();
        for (start, _) in &snapshot {
            if colour[start] != Colour::White {
                continue;
            }
            let mut stack = vec![(*start, false)];
            while let Some((id, expanded)) = stack.pop() {
                if expanded {
                    colour.insert(id, Colour::Black);
                    continue;
                }
                match colour[&id] {
                    Colour::Black => continue,
                    Colour::Grey => bail!("validation: cycle through {id:?}"),
                    Colour::White => {}
                }
                colour.insert(id, Colour::Grey);
                stack.push((id, true));
                for input in self.node(id).inputs() {
                    match colour[&input] {
                        Colour::Grey => bail!("validation: cycle through {input:?}"),
                        Colour::White => stack.push((input, false)),
                        Colour::Black => {}
                    }
                }
            }
        }

        // Duplicate sink outputs.
        let mut seen = HashSet::new();
        {
            let g = self.inner.lock().expect("graph lock");
            let mut sink_nodes: Vec<&NodeId> = g.sinks.keys().collect();
            sink_nodes.sort();
            for id in sink_nodes {
                for sink in &g.sinks[id] {
                    if !seen.insert(sink.output_id()) {
                        bail!(
                            "validation: output {:?} is written twice",
                            sink.output_id()
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Render nodes and edges for diagnostics.
    #[must_use]
    pub fn pretty(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        for id in self.node_ids() {
            let node = self.node(id);
            let _ = writeln!(
                out,
                "  {:?}: {} <- {:?} [{}]",
                id,
                node.kind(),
                node.inputs(),
                self.wire(id).tag.name
            );
        }
        out
    }
}

/// Reduces each `(K, Vec<V>)` group with an associative op; the `ParallelDo`
/// form of a `Combine`. Empty groups are skipped.
struct CombineDoFn<K, V> {
    op: Arc<dyn Fn(V, V) -> V + Send + Sync>,
    _t: std::marker::PhantomData<fn() -> K>,
}

impl<K, V> DoFn for CombineDoFn<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn process(&self, _env: &Env, item: Item, out: &mut dyn Emitter) {
        let (k, vs) = *item
            .downcast::<(K, Vec<V>)>()
            .expect("Combine DoFn: bad input");
        if let Some(v) = vs.into_iter().reduce(|a, b| (self.op)(a, b)) {
            out.emit(Box::new((k, v)));
        }
    }
}
