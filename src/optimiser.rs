//! Deterministic fix-point rewriting of a computation graph.
//!
//! The optimiser runs on a deep copy of the user's graph and applies five
//! semantics-preserving rules, in order, until none fires:
//!
//! 1. **Flatten normalisation**: nested flattens are spliced into their
//!    parent; a sink-free single-input flatten collapses to its input.
//! 2. **Sink-of-flatten**: a `ParallelDo` over a `Flatten` is pushed into
//!    the branches (one copy per branch) unless its fuse barrier forbids
//!    duplication.
//! 3. **ParallelDo fusion**: an adjacent pair whose upstream half is
//!    single-use, sink-free and group-barrier-free fuses into one
//!    `ParallelDo` with the composed function and the paired environment.
//!    A fuse barrier does not block this: nothing is duplicated.
//! 4. **Combine lowering**: a `Combine` not sitting on a `GroupByKey` cannot
//!    run in a reduce phase and becomes its `ParallelDo` form.
//! 5. **Identity insertion**: every shuffle input that carries no mapper
//!    logic gets a pass-through `ParallelDo`, so mapper-side logic always
//!    exists.
//!
//! Nodes rewritten in place keep their ids; genuinely new nodes (fused or
//! duplicated `ParallelDo`s, inserted identities, paired environments) get
//! fresh ids. After the fix-point, the post-conditions are checked: every
//! `GroupByKey` input is a `ParallelDo` (or a `Flatten` of them), every
//! `Combine` input is a `GroupByKey`, and no `Flatten` nests another. A
//! violation aborts with a dump of the offending node's neighbourhood.

use crate::dofn::{pair_envs, ComposedFn, IdentityFn};
use crate::error::ScoobiError;
use crate::graph::Graph;
use crate::ids::NodeId;
use crate::node::Node;
use crate::wire::{wire_format_for, Env};
use anyhow::Result;
use std::sync::Arc;
use tracing::debug;

// Far above what any real graph needs; a fix-point that runs this long is a
// rewriter bug, not a big graph.
const MAX_ROUNDS: usize = 1000;

/// Optimise a copy of `g`, returning the rewritten graph and the roots
/// remapped into it. The input graph is untouched.
///
/// # Errors
/// An optimiser-invariant error when the fix-point fails to converge or a
/// post-condition does not hold.
pub fn optimised(g: &Graph, roots: &[NodeId]) -> Result<(Graph, Vec<NodeId>)> {
    let work = g.deep_copy();
    let mut roots = roots.to_vec();
    optimise(&work, &mut roots)?;
    Ok((work, roots))
}

/// Optimise the graph in place, remapping `roots` where rewrites replaced
/// them. The graph must be a plan-side copy.
///
/// # Errors
/// An optimiser-invariant error when the fix-point fails to converge or a
/// post-condition does not hold.
pub(crate) fn optimise(g: &Graph, roots: &mut Vec<NodeId>) -> Result<()> {
    let mut rounds = 0;
    loop {
        let changed = normalise_flattens(g, roots)
            | sink_flattens(g)
            | fuse_parallel_dos(g, roots)
            | lower_combines(g)
            | insert_identity_mappers(g);
        if !changed {
            break;
        }
        rounds += 1;
        if rounds > MAX_ROUNDS {
            return Err(ScoobiError::OptimiserInvariant(format!(
                "rewriting did not reach a fix-point after {MAX_ROUNDS} rounds"
            ))
            .into());
        }
    }

    // Keep everything a sink hangs off, plus the requested roots.
    let mut keep = roots.clone();
    for id in g.node_ids() {
        if !g.sinks_of(id).is_empty() {
            keep.push(id);
        }
    }
    g.gc(&keep);

    check_invariants(g)
}

/// Point every edge (and root) at `to` instead of `from`.
fn substitute(g: &Graph, roots: &mut Vec<NodeId>, from: NodeId, to: NodeId) {
    for id in g.node_ids() {
        let node = g.node(id);
        if node.inputs().contains(&from) {
            g.replace(id, node.remap_inputs(|i| if i == from { to } else { i }));
        }
    }
    for r in roots.iter_mut() {
        if *r == from {
            *r = to;
        }
    }
}

/// Rule 1: `Flatten(…, Flatten(xs), …)` -> `Flatten(…, xs…, …)`;
/// `Flatten([x])` -> `x` when the flatten carries no sinks.
fn normalise_flattens(g: &Graph, roots: &mut Vec<NodeId>) -> bool {
    let mut changed = false;
    for id in g.node_ids() {
        if !g.contains(id) {
            continue;
        }
        let Node::Flatten { inputs } = g.node(id) else {
            continue;
        };

        let mut spliced = Vec::with_capacity(inputs.len());
        let mut any_nested = false;
        for input in &inputs {
            match g.node(*input) {
                Node::Flatten { inputs: nested } if g.sinks_of(*input).is_empty() => {
                    spliced.extend(nested);
                    any_nested = true;
                }
                _ => spliced.push(*input),
            }
        }
        if any_nested {
            debug!(node = ?id, "optimiser: splicing nested flatten");
            g.replace(id, Node::Flatten { inputs: spliced.clone() });
            changed = true;
        }
        if spliced.len() == 1 && g.sinks_of(id).is_empty() {
            debug!(node = ?id, into = ?spliced[0], "optimiser: collapsing singleton flatten");
            substitute(g, roots, id, spliced[0]);
            g.remove(id);
            changed = true;
        }
    }
    changed
}

/// Rule 2: `ParallelDo(Flatten([a, b, …]))` ->
/// `Flatten([ParallelDo(a), ParallelDo(b), …])` when duplication is allowed.
fn sink_flattens(g: &Graph) -> bool {
    let mut changed = false;
    for id in g.node_ids() {
        let Node::ParallelDo {
            input,
            env,
            fun,
            group_barrier,
            fuse_barrier,
        } = g.node(id)
        else {
            continue;
        };
        if fuse_barrier {
            continue;
        }
        let Node::Flatten { inputs } = g.node(input) else {
            continue;
        };
        if inputs.len() < 2 {
            continue;
        }

        debug!(node = ?id, branches = inputs.len(), "optimiser: sinking ParallelDo into flatten");
        let wire = g.wire(id);
        let branches: Vec<NodeId> = inputs
            .iter()
            .map(|b| {
                g.insert_fresh(
                    Node::ParallelDo {
                        input: *b,
                        env,
                        fun: fun.clone(),
                        group_barrier,
                        fuse_barrier,
                    },
                    wire.clone(),
                )
            })
            .collect();
        // The ParallelDo's id now names the flatten of the duplicated copies,
        // so parent edges and sinks stay put.
        g.replace(id, Node::Flatten { inputs: branches });
        changed = true;
    }
    changed
}

/// Rule 3: fuse `p1 -> p2` when `p1` is used only by `p2`, carries no sinks,
/// and has no group barrier. The fuse barrier does not apply here: it forbids
/// duplication, and fusing a single-use node duplicates nothing.
fn fuse_parallel_dos(g: &Graph, roots: &mut Vec<NodeId>) -> bool {
    let mut changed = false;
    for id in g.node_ids() {
        // The arena may already have dropped this node via an earlier
        // substitution in the same scan.
        if !g.contains(id) {
            continue;
        }
        let Node::ParallelDo {
            input: p1_id,
            env: env2,
            fun: fun2,
            group_barrier: gb2,
            fuse_barrier: fb2,
        } = g.node(id)
        else {
            continue;
        };
        let Node::ParallelDo {
            input: p1_input,
            env: env1,
            fun: fun1,
            group_barrier: gb1,
            ..
        } = g.node(p1_id)
        else {
            continue;
        };
        if gb1 {
            continue;
        }
        if !g.sinks_of(p1_id).is_empty() {
            continue;
        }
        let parents = g.parents_map();
        if parents.get(&p1_id).map_or(0, Vec::len) != 1 || roots.contains(&p1_id) {
            continue;
        }

        debug!(upstream = ?p1_id, downstream = ?id, "optimiser: fusing ParallelDo pair");
        let paired_env = g.insert_fresh(
            Node::Op {
                left: env1,
                right: env2,
                apply: Arc::new(|a, b| pair_envs(a, b)),
            },
            wire_format_for::<(Env, Env)>(),
        );
        let fused = g.insert_fresh(
            Node::ParallelDo {
                input: p1_input,
                env: paired_env,
                fun: Arc::new(ComposedFn { f: fun1, g: fun2 }),
                group_barrier: gb1 || gb2,
                fuse_barrier: fb2,
            },
            g.wire(id),
        );
        g.move_sinks(id, fused);
        substitute(g, roots, id, fused);
        g.remove(id);
        g.remove(p1_id);
        changed = true;
    }
    changed
}

/// Rule 4: a `Combine` that does not sit on a `GroupByKey` cannot run as a
/// reduce phase; lower it to its `ParallelDo` form.
fn lower_combines(g: &Graph) -> bool {
    let mut changed = false;
    for id in g.node_ids() {
        let Node::Combine { input, fun, .. } = g.node(id) else {
            continue;
        };
        if matches!(g.node(input), Node::GroupByKey { .. }) {
            continue;
        }
        debug!(node = ?id, "optimiser: lowering Combine to ParallelDo");
        let env = g.insert_fresh(
            Node::Return {
                value: Arc::new(()),
            },
            wire_format_for::<()>(),
        );
        g.replace(
            id,
            Node::ParallelDo {
                input,
                env,
                fun,
                group_barrier: false,
                fuse_barrier: false,
            },
        );
        changed = true;
    }
    changed
}

/// Rule 5: give every shuffle input mapper-side logic.
fn insert_identity_mappers(g: &Graph) -> bool {
    let mut changed = false;
    for id in g.node_ids() {
        let Node::GroupByKey { input, .. } = g.node(id) else {
            continue;
        };
        match g.node(input) {
            Node::ParallelDo { .. } => {}
            Node::Flatten { inputs } => {
                let mut branches = Vec::with_capacity(inputs.len());
                let mut any = false;
                for b in &inputs {
                    if matches!(g.node(*b), Node::ParallelDo { .. }) {
                        branches.push(*b);
                    } else {
                        branches.push(identity_over(g, *b));
                        any = true;
                    }
                }
                if any {
                    debug!(gbk = ?id, "optimiser: identity mappers under flatten");
                    g.replace(input, Node::Flatten { inputs: branches });
                    changed = true;
                }
            }
            _ => {
                debug!(gbk = ?id, over = ?input, "optimiser: inserting identity mapper");
                let identity = identity_over(g, input);
                let node = g.node(id).remap_inputs(|i| if i == input { identity } else { i });
                g.replace(id, node);
                changed = true;
            }
        }
    }
    changed
}

fn identity_over(g: &Graph, input: NodeId) -> NodeId {
    let env = g.insert_fresh(
        Node::Return {
            value: Arc::new(()),
        },
        wire_format_for::<()>(),
    );
    g.insert_fresh(
        Node::ParallelDo {
            input,
            env,
            fun: Arc::new(IdentityFn),
            group_barrier: false,
            fuse_barrier: false,
        },
        g.wire(input),
    )
}

/// Post-conditions of the rewrite set.
fn check_invariants(g: &Graph) -> Result<()> {
    for id in g.node_ids() {
        match g.node(id) {
            Node::GroupByKey { input, .. } => {
                let ok = match g.node(input) {
                    Node::ParallelDo { .. } => true,
                    Node::Flatten { inputs } => inputs
                        .iter()
                        .all(|b| matches!(g.node(*b), Node::ParallelDo { .. })),
                    _ => false,
                };
                if !ok {
                    return Err(invariant_error(g, id, "GroupByKey input is not mapper-backed"));
                }
            }
            Node::Combine { input, .. } => {
                if !matches!(g.node(input), Node::GroupByKey { .. }) {
                    return Err(invariant_error(g, id, "Combine input is not a GroupByKey"));
                }
            }
            Node::Flatten { inputs } => {
                if inputs
                    .iter()
                    .any(|b| matches!(g.node(*b), Node::Flatten { .. }))
                {
                    return Err(invariant_error(g, id, "nested Flatten survived"));
                }
            }
            _ => {}
        }
    }
    g.validate()
}

fn invariant_error(g: &Graph, id: NodeId, what: &str) -> anyhow::Error {
    let node = g.node(id);
    let mut dump = format!("{what}\n  offending: {id:?} = {node:?}\n");
    for input in node.inputs() {
        dump.push_str(&format!("  input: {input:?} = {:?}\n", g.node(input)));
    }
    let parents = g.parents_map();
    for p in parents.get(&id).cloned().unwrap_or_default() {
        dump.push_str(&format!("  parent: {p:?} = {:?}\n", g.node(p)));
    }
    ScoobiError::OptimiserInvariant(dump).into()
}
