//! The node variants of a computation graph.
//!
//! A node is an immutable value tagged with a globally unique [`NodeId`]
//! (assigned by the owning [`Graph`](crate::graph::Graph)) and a
//! [`WireFormat`](crate::wire::WireFormat) for its output element type. Node
//! identity and equality are by id alone; the variants here are the structural
//! content.
//!
//! Nodes come in two *shapes*: [`Shape::Arr`] (a distributed sequence) and
//! [`Shape::Exp`] (a single scalar). The eight variants form a closed tagged
//! union and are matched exhaustively everywhere; there is no virtual-dispatch
//! hierarchy to extend.
//!
//! Keyed logic is captured as typed closures at node-construction time and
//! erased in the graph: a `GroupByKey` carries its shard/local/merge closures,
//! a `Combine` its per-group reducer, a `Materialise` its collector. The
//! planner and executor never see the element types.

use crate::dofn::DoFn;
use crate::ids::NodeId;
use crate::io::DataSource;
use crate::wire::{Env, Partition};
use std::fmt;
use std::sync::Arc;

/// Partition-to-partition closure captured at construction.
pub type PartFn = Arc<dyn Fn(Partition) -> Partition + Send + Sync>;

/// Splits mapper output into `n` reducer buckets by key hash.
pub type ShardFn = Arc<dyn Fn(Partition, usize) -> Vec<Partition> + Send + Sync>;

/// Merges per-mapper intermediates into one grouped partition.
pub type MergeFn = Arc<dyn Fn(Vec<Partition>) -> Partition + Send + Sync>;

/// Collects bridge partitions into a single scalar iterable.
pub type CollectFn = Arc<dyn Fn(Vec<Partition>) -> Env + Send + Sync>;

/// Combines two scalar values into a third.
pub type BinOpFn = Arc<dyn Fn(&Env, &Env) -> Env + Send + Sync>;

/// The two shapes a node can have.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shape {
    /// A distributed sequence of elements.
    Arr,
    /// A single scalar value.
    Exp,
}

/// One variant of the computation graph.
///
/// Edges are stored as [`NodeId`]s inside the variants, so a node is shared by
/// every parent that references its id (sharing is first-class).
#[derive(Clone)]
pub enum Node {
    /// Read a distributed collection from an external [`DataSource`].
    Load {
        /// The external input endpoint.
        source: Arc<dyn DataSource>,
    },
    /// Apply a [`DoFn`] to each element of the input, emitting zero-or-more
    /// outputs. The environment edge is always `Exp`-shaped.
    ParallelDo {
        /// The `Arr` main input.
        input: NodeId,
        /// The `Exp` broadcast environment.
        env: NodeId,
        /// Per-element logic.
        fun: Arc<dyn DoFn>,
        /// Forbids fusing with a downstream `ParallelDo`.
        group_barrier: bool,
        /// Forbids duplicating this node into multiple branches.
        fuse_barrier: bool,
    },
    /// Shuffle: turn an `Arr` of `(K, V)` into an `Arr` of `(K, Vec<V>)`.
    GroupByKey {
        input: NodeId,
        /// Split a `(K, V)` partition into `n` buckets by key hash.
        shard: ShardFn,
        /// Group one bucket partition by key locally.
        local: PartFn,
        /// Merge per-mapper groupings into one grouped partition.
        merge: MergeFn,
    },
    /// Reduce each value-group of a grouped `Arr` with an associative op.
    Combine {
        input: NodeId,
        /// `(K, Vec<V>)` partition -> `(K, V)` partition.
        reduce: PartFn,
        /// The equivalent `ParallelDo` form of the same reduction, used when
        /// the combine cannot be pushed into a reduce phase.
        fun: Arc<dyn DoFn>,
    },
    /// Concatenation of same-typed `Arr` inputs.
    Flatten { inputs: Vec<NodeId> },
    /// A constant scalar.
    Return { value: Env },
    /// Combine two scalars with a function.
    Op {
        left: NodeId,
        right: NodeId,
        apply: BinOpFn,
    },
    /// Collect an entire `Arr` into one scalar iterable.
    Materialise {
        input: NodeId,
        /// Bridge partitions -> the scalar iterable value.
        collect: CollectFn,
    },
}

impl Node {
    /// The shape of this node's output.
    pub fn shape(&self) -> Shape {
        match self {
            Node::Load { .. }
            | Node::ParallelDo { .. }
            | Node::GroupByKey { .. }
            | Node::Combine { .. }
            | Node::Flatten { .. } => Shape::Arr,
            Node::Return { .. } | Node::Op { .. } | Node::Materialise { .. } => Shape::Exp,
        }
    }

    /// All input edges, in positional order. The `ParallelDo` environment is
    /// listed after its main input.
    pub fn inputs(&self) -> Vec<NodeId> {
        match self {
            Node::Load { .. } | Node::Return { .. } => vec![],
            Node::ParallelDo { input, env, .. } => vec![*input, *env],
            Node::GroupByKey { input, .. }
            | Node::Combine { input, .. }
            | Node::Materialise { input, .. } => vec![*input],
            Node::Flatten { inputs } => inputs.clone(),
            Node::Op { left, right, .. } => vec![*left, *right],
        }
    }

    /// The shapes this node expects of its inputs, positionally matching
    /// [`Node::inputs`].
    pub fn input_shapes(&self) -> Vec<Shape> {
        match self {
            Node::Load { .. } | Node::Return { .. } => vec![],
            Node::ParallelDo { .. } => vec![Shape::Arr, Shape::Exp],
            Node::GroupByKey { .. } | Node::Combine { .. } | Node::Materialise { .. } => {
                vec![Shape::Arr]
            }
            Node::Flatten { inputs } => vec![Shape::Arr; inputs.len()],
            Node::Op { .. } => vec![Shape::Exp, Shape::Exp],
        }
    }

    /// Whether this variant can root a persisted bridge.
    pub fn is_process_node(&self) -> bool {
        matches!(
            self,
            Node::ParallelDo { .. }
                | Node::GroupByKey { .. }
                | Node::Combine { .. }
                | Node::Flatten { .. }
        )
    }

    /// Variant name, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Node::Load { .. } => "Load",
            Node::ParallelDo { .. } => "ParallelDo",
            Node::GroupByKey { .. } => "GroupByKey",
            Node::Combine { .. } => "Combine",
            Node::Flatten { .. } => "Flatten",
            Node::Return { .. } => "Return",
            Node::Op { .. } => "Op",
            Node::Materialise { .. } => "Materialise",
        }
    }

    /// Rebuild this node with its input ids remapped through `f`, keeping all
    /// captured closures. Used by the optimiser when only children changed;
    /// the node keeps its id in that case.
    pub(crate) fn remap_inputs(&self, f: impl Fn(NodeId) -> NodeId) -> Node {
        match self {
            Node::Load { source } => Node::Load {
                source: source.clone(),
            },
            Node::ParallelDo {
                input,
                env,
                fun,
                group_barrier,
                fuse_barrier,
            } => Node::ParallelDo {
                input: f(*input),
                env: f(*env),
                fun: fun.clone(),
                group_barrier: *group_barrier,
                fuse_barrier: *fuse_barrier,
            },
            Node::GroupByKey {
                input,
                shard,
                local,
                merge,
            } => Node::GroupByKey {
                input: f(*input),
                shard: shard.clone(),
                local: local.clone(),
                merge: merge.clone(),
            },
            Node::Combine { input, reduce, fun } => Node::Combine {
                input: f(*input),
                reduce: reduce.clone(),
                fun: fun.clone(),
            },
            Node::Flatten { inputs } => Node::Flatten {
                inputs: inputs.iter().map(|i| f(*i)).collect(),
            },
            Node::Return { value } => Node::Return {
                value: value.clone(),
            },
            Node::Op { left, right, apply } => Node::Op {
                left: f(*left),
                right: f(*right),
                apply: apply.clone(),
            },
            Node::Materialise { input, collect } => Node::Materialise {
                input: f(*input),
                collect: collect.clone(),
            },
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", self.kind(), self.inputs())
    }
}
