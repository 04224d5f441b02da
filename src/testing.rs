//! Testing utilities: a reference interpreter and collection assertions.
//!
//! The interpreter evaluates a computation graph directly over host memory by
//! structural recursion, without optimisation, MSCRs or layers. It is the
//! oracle for the semantics-preservation property: whatever the planner and
//! executor do to a graph, the observable values must match what
//! [`interpret_vec`] produces.
//!
//! Outputs at shuffle boundaries are unordered multisets; compare them with
//! [`assert_unordered_eq`] or sort before comparing.

use crate::dofn::VecEmitter;
use crate::graph::Graph;
use crate::ids::NodeId;
use crate::node::Node;
use crate::wire::{Env, Partition};
use anyhow::{anyhow, Result};
use std::fmt::Debug;
use std::sync::Arc;

/// Evaluate an `Arr` node to a single partition holding all its elements.
///
/// # Errors
/// On element-type mismatches or when `id` is `Exp`-shaped.
pub fn interpret_arr(g: &Graph, id: NodeId) -> Result<Partition> {
    match g.node(id) {
        Node::Load { source } => {
            let parts = source
                .input_splits()?
                .into_iter()
                .map(|s| source.read_split(s))
                .collect::<Result<Vec<_>>>()?;
            source
                .wire()
                .ops
                .concat(parts)
                .ok_or_else(|| anyhow!("interpret: source element type mismatch"))
        }
        Node::ParallelDo {
            input, env, fun, ..
        } => {
            let part = interpret_arr(g, input)?;
            let env = interpret_exp(g, env)?;
            let items = g
                .wire(input)
                .ops
                .explode(part)
                .ok_or_else(|| anyhow!("interpret: mapper input type mismatch"))?;
            let mut out = VecEmitter::default();
            fun.setup(&env);
            for item in items {
                fun.process(&env, item, &mut out);
            }
            fun.cleanup(&env, &mut out);
            g.wire(id)
                .ops
                .implode(out.0)
                .ok_or_else(|| anyhow!("interpret: mapper output type mismatch"))
        }
        Node::GroupByKey { input, local, merge, .. } => {
            let part = interpret_arr(g, input)?;
            Ok(merge(vec![local(part)]))
        }
        Node::Combine { input, reduce, .. } => {
            let part = interpret_arr(g, input)?;
            Ok(reduce(part))
        }
        Node::Flatten { inputs } => {
            let parts = inputs
                .iter()
                .map(|i| interpret_arr(g, *i))
                .collect::<Result<Vec<_>>>()?;
            g.wire(id)
                .ops
                .concat(parts)
                .ok_or_else(|| anyhow!("interpret: flatten element type mismatch"))
        }
        other => Err(anyhow!("interpret_arr on {id:?} ({})", other.kind())),
    }
}

/// Evaluate an `Exp` node to its scalar value.
///
/// # Errors
/// On element-type mismatches or when `id` is `Arr`-shaped.
pub fn interpret_exp(g: &Graph, id: NodeId) -> Result<Env> {
    match g.node(id) {
        Node::Return { value } => Ok(value),
        Node::Op { left, right, apply } => {
            let a = interpret_exp(g, left)?;
            let b = interpret_exp(g, right)?;
            Ok(apply(&a, &b))
        }
        Node::Materialise { input, collect } => {
            let part = interpret_arr(g, input)?;
            Ok(collect(vec![part]))
        }
        other => Err(anyhow!("interpret_exp on {id:?} ({})", other.kind())),
    }
}

/// Evaluate an `Arr` node of element type `T` to a plain vector.
///
/// # Errors
/// When `T` does not match the node's element type.
pub fn interpret_vec<T: Clone + Send + Sync + 'static>(g: &Graph, id: NodeId) -> Result<Vec<T>> {
    let part = interpret_arr(g, id)?;
    part.downcast::<Vec<T>>()
        .map(|v| *v)
        .map_err(|_| anyhow!("interpret: requested element type does not match"))
}

/// Evaluate an `Exp` node to an `Arc` of the expected value type.
///
/// # Errors
/// When `T` does not match the node's value type.
pub fn interpret_value<T: Send + Sync + 'static>(g: &Graph, id: NodeId) -> Result<Arc<T>> {
    interpret_exp(g, id)?
        .downcast::<T>()
        .map_err(|_| anyhow!("interpret: requested value type does not match"))
}

/// Assert two collections hold the same multiset of elements.
///
/// # Panics
/// When the multisets differ.
pub fn assert_unordered_eq<T: Ord + Debug>(mut got: Vec<T>, mut want: Vec<T>) {
    got.sort();
    want.sort();
    assert_eq!(got, want);
}
