//! Grouping process nodes into MSCRs and MSCRs into layers.
//!
//! An MSCR (Map-Shuffle-Combine-Reduce unit) is the set of process nodes that
//! share a shuffle boundary and run as one batch job. The decomposition rules:
//!
//! - every `GroupByKey` contributes to exactly one MSCR; shuffles sharing
//!   mapper ancestry are co-grouped into the same MSCR,
//! - the mappers of a shuffle are the `ParallelDo`s whose output flows into
//!   it, directly or through a `Flatten` (flattens dissolve into the shuffle),
//! - a `Combine` immediately downstream of a `GroupByKey` attaches to the
//!   shuffle's MSCR and becomes its reducer,
//! - orphan mapper chains with no downstream shuffle form singleton map-only
//!   MSCRs,
//! - a `Flatten` that itself owns persisted outputs becomes a concatenation
//!   channel fed by one mapper per branch.
//!
//! Layers are then the coarsest sequence of mutually independent MSCR sets
//! compatible with the dependency DAG (Kahn-style peeling), ties broken by
//! ascending MSCR id. An MSCR depends on another when it reads one of its
//! output bridges, either as mapper input or through a materialised
//! environment.

use crate::bridge::Bridge;
use crate::dofn::{DoFn, IdentityFn};
use crate::error::ScoobiError;
use crate::graph::Graph;
use crate::ids::{MscrId, NodeId};
use crate::io::{DataSink, DataSource};
use crate::node::{MergeFn, Node, PartFn, ShardFn};
use crate::wire::WireFormat;
use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Where a mapper reads its data from.
#[derive(Clone)]
pub enum MscrInput {
    /// An external `Load` source.
    Source(Arc<dyn DataSource>),
    /// The bridge of a process node produced by an earlier MSCR.
    Bridge(Bridge),
    /// The in-job output of another mapper of the same MSCR.
    Mapper(NodeId),
}

impl std::fmt::Debug for MscrInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MscrInput::Source(s) => write!(f, "Source({})", s.name()),
            MscrInput::Bridge(b) => write!(f, "{b:?}"),
            MscrInput::Mapper(n) => write!(f, "Mapper({n:?})"),
        }
    }
}

/// The persisted outputs of one node inside an MSCR.
#[derive(Clone)]
pub struct OutputSet {
    /// The producing node.
    pub node: NodeId,
    /// User-facing sinks registered on the node.
    pub sinks: Vec<Arc<dyn DataSink>>,
    /// Intermediate bridge, when downstream MSCRs or a materialisation need
    /// the node's output.
    pub bridge: Option<Bridge>,
    /// Element type written.
    pub wire: WireFormat,
}

impl OutputSet {
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty() && self.bridge.is_none()
    }
}

/// One mapper of an MSCR: a `ParallelDo` (or a synthesised pass-through over
/// a non-mapper branch) applied to one input.
#[derive(Clone)]
pub struct MapperSpec {
    /// The graph node this mapper stands for.
    pub node: NodeId,
    /// Where the input data comes from.
    pub input: MscrInput,
    /// Per-element logic.
    pub fun: Arc<dyn DoFn>,
    /// The `Exp` environment node; `None` means the unit environment.
    pub env: Option<NodeId>,
    /// Element type read.
    pub in_wire: WireFormat,
    /// Element type emitted.
    pub out_wire: WireFormat,
    /// The mapper's own persisted outputs, if any.
    pub outputs: Option<OutputSet>,
}

/// The reducer of a shuffle channel.
#[derive(Clone)]
pub struct CombineSpec {
    pub node: NodeId,
    /// `(K, Vec<V>)` partition -> `(K, V)` partition.
    pub reduce: PartFn,
    pub outputs: OutputSet,
}

/// One output channel of an MSCR.
#[derive(Clone)]
pub enum OutputChannel {
    /// A shuffle: mapper outputs are sharded by key, grouped per reducer, and
    /// optionally reduced by an attached `Combine`.
    Shuffle {
        gbk: NodeId,
        shard: ShardFn,
        local: PartFn,
        merge: MergeFn,
        /// Mapper nodes whose output flows into this shuffle.
        feeders: Vec<NodeId>,
        /// Persisted outputs of the grouped (pre-combine) data.
        gbk_outputs: OutputSet,
        combine: Option<CombineSpec>,
    },
    /// A concatenation of mapper outputs, persisted as the flatten's own
    /// output.
    Flatten {
        node: NodeId,
        feeders: Vec<NodeId>,
        outputs: OutputSet,
    },
}

/// A set of process nodes sharing a shuffle boundary: one batch job.
#[derive(Clone)]
pub struct Mscr {
    pub id: MscrId,
    /// Distinct mappers, topologically ordered on in-job inputs.
    pub mappers: Vec<MapperSpec>,
    pub channels: Vec<OutputChannel>,
}

impl Mscr {
    /// Bridges this MSCR reads as mapper input.
    pub fn input_bridges(&self) -> Vec<&Bridge> {
        self.mappers
            .iter()
            .filter_map(|m| match &m.input {
                MscrInput::Bridge(b) => Some(b),
                _ => None,
            })
            .collect()
    }

    /// All output sets this MSCR writes.
    pub fn output_sets(&self) -> Vec<&OutputSet> {
        let mut out: Vec<&OutputSet> = self
            .mappers
            .iter()
            .filter_map(|m| m.outputs.as_ref())
            .collect();
        for c in &self.channels {
            match c {
                OutputChannel::Shuffle {
                    gbk_outputs,
                    combine,
                    ..
                } => {
                    if !gbk_outputs.is_empty() {
                        out.push(gbk_outputs);
                    }
                    if let Some(cs) = combine {
                        out.push(&cs.outputs);
                    }
                }
                OutputChannel::Flatten { outputs, .. } => out.push(outputs),
            }
        }
        out
    }

    /// Total byte-size estimate of the mapper inputs read from external
    /// sources; bridge sizes are added by the job adapter at configure time.
    pub fn source_bytes(&self) -> u64 {
        self.mappers
            .iter()
            .filter_map(|m| match &m.input {
                MscrInput::Source(s) => s.size_hint(),
                _ => None,
            })
            .sum()
    }
}

impl std::fmt::Debug for Mscr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mappers: Vec<NodeId> = self.mappers.iter().map(|m| m.node).collect();
        write!(f, "Mscr({:?}, mappers {mappers:?})", self.id)
    }
}

/// An ordered set of mutually independent MSCRs.
#[derive(Clone)]
pub struct Layer {
    /// Position in the layer sequence, starting at 0.
    pub id: usize,
    pub mscrs: Vec<Mscr>,
}

/// The layered plan for one run.
pub struct Plan {
    /// The optimised plan-side graph the MSCRs refer into.
    pub graph: Graph,
    /// The execution roots, remapped into the plan graph.
    pub roots: Vec<NodeId>,
    pub layers: Vec<Layer>,
    /// Bridge of every node that owns one in this plan.
    pub bridges: HashMap<NodeId, Bridge>,
}

/// Plan a graph without executing it: validate, optimise, decompose into
/// layered MSCRs.
///
/// # Errors
/// Validation or optimiser-invariant errors.
pub fn plan(g: &Graph, roots: &[NodeId]) -> Result<Plan> {
    g.validate()
        .map_err(|e| ScoobiError::Validation(format!("{e:#}")))?;
    let (work, roots) = crate::optimiser::optimised(g, roots)?;
    decompose(work, roots)
}

/// Decompose an optimised graph into layered MSCRs.
///
/// # Errors
/// An optimiser-invariant error when the graph violates the decomposition
/// preconditions (they are established by the optimiser).
pub(crate) fn decompose(graph: Graph, roots: Vec<NodeId>) -> Result<Plan> {
    let builder = Builder::new(&graph, &roots);
    let (mscrs, bridges) = builder.build()?;
    let layers = layer(&mscrs, &graph)?;
    debug!(
        mscrs = mscrs.len(),
        layers = layers.len(),
        "plan decomposition complete"
    );
    Ok(Plan {
        graph,
        roots,
        layers,
        bridges,
    })
}

struct Builder<'g> {
    g: &'g Graph,
    roots: &'g [NodeId],
    live: Vec<NodeId>,
    parents: HashMap<NodeId, Vec<NodeId>>,
}

impl<'g> Builder<'g> {
    fn new(g: &'g Graph, roots: &'g [NodeId]) -> Self {
        let live = g.node_ids();
        let parents = g.parents_map();
        Self {
            g,
            roots,
            live,
            parents,
        }
    }

    fn parents_of(&self, n: NodeId) -> &[NodeId] {
        self.parents.get(&n).map_or(&[], Vec::as_slice)
    }

    /// The `ParallelDo`s feeding a shuffle, through at most one flatten.
    fn feeders_of(&self, gbk: NodeId) -> Result<Vec<NodeId>> {
        let Node::GroupByKey { input, .. } = self.g.node(gbk) else {
            unreachable!("feeders_of on a non-GroupByKey");
        };
        match self.g.node(input) {
            Node::ParallelDo { .. } => Ok(vec![input]),
            Node::Flatten { inputs } => {
                for b in &inputs {
                    if !matches!(self.g.node(*b), Node::ParallelDo { .. }) {
                        return Err(ScoobiError::OptimiserInvariant(format!(
                            "shuffle {gbk:?}: flatten branch {b:?} is not a mapper"
                        ))
                        .into());
                    }
                }
                Ok(inputs)
            }
            other => Err(ScoobiError::OptimiserInvariant(format!(
                "shuffle {gbk:?}: input {input:?} is a {}",
                other.kind()
            ))
            .into()),
        }
    }

    /// The `Combine` attached to a shuffle as reducer: its lowest-id `Combine`
    /// parent. Further combine parents read the shuffle's bridge instead.
    fn attached_combine(&self, gbk: NodeId) -> Option<NodeId> {
        self.parents_of(gbk)
            .iter()
            .copied()
            .filter(|p| matches!(self.g.node(*p), Node::Combine { .. }))
            .min()
    }

    fn build(self) -> Result<(Vec<Mscr>, HashMap<NodeId, Bridge>)> {
        // Shuffle groups: start one per GroupByKey, merge on shared mapper
        // ancestry.
        let gbks: Vec<NodeId> = self
            .live
            .iter()
            .copied()
            .filter(|id| matches!(self.g.node(*id), Node::GroupByKey { .. }))
            .collect();
        let mut feeders: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
        for gbk in &gbks {
            feeders.insert(*gbk, self.feeders_of(*gbk)?);
        }
        let mut groups = self.group_shuffles(&gbks, &feeders);
        self.split_internal_dependencies(&mut groups, &feeders);

        // Attach reducers and collect the mapper-capable nodes claimed by
        // shuffle MSCRs.
        let mut attached: BTreeMap<NodeId, NodeId> = BTreeMap::new(); // combine -> gbk
        for gbk in &gbks {
            if let Some(c) = self.attached_combine(*gbk) {
                attached.insert(c, *gbk);
            }
        }

        // Assignment of mapper nodes to groups; a mapper may feed shuffles in
        // several groups and is then duplicated into each.
        let mut assigned: BTreeMap<NodeId, BTreeSet<usize>> = BTreeMap::new();
        for (gi, group) in groups.iter().enumerate() {
            for gbk in group {
                for m in &feeders[gbk] {
                    assigned.entry(*m).or_default().insert(gi);
                }
            }
        }

        // Which process nodes need a bridge.
        let consumed = self.bridge_consumers(&groups, &feeders, &attached, &assigned);
        let mut bridges: HashMap<NodeId, Bridge> = HashMap::new();
        for n in &consumed {
            bridges.insert(*n, Bridge::for_node(*n, self.g.wire(*n)));
        }

        let mut next = 0u64;
        let mut mscrs: Vec<Mscr> = Vec::new();

        // 1. Shuffle MSCRs.
        for (gi, group) in groups.iter().enumerate() {
            let mut mappers: Vec<MapperSpec> = Vec::new();
            let mut seen = BTreeSet::new();
            for gbk in group {
                for m in &feeders[gbk] {
                    if seen.insert(*m) {
                        mappers.push(self.mapper_spec(*m, gi, &assigned, &bridges)?);
                    }
                }
            }
            sort_mappers(&mut mappers);

            let mut channels = Vec::new();
            for gbk in group {
                let Node::GroupByKey {
                    shard,
                    local,
                    merge,
                    ..
                } = self.g.node(*gbk)
                else {
                    unreachable!();
                };
                let combine = attached
                    .iter()
                    .find(|(_, g)| *g == gbk)
                    .map(|(c, _)| *c)
                    .map(|c| {
                        let Node::Combine { reduce, .. } = self.g.node(c) else {
                            unreachable!();
                        };
                        CombineSpec {
                            node: c,
                            reduce,
                            outputs: self.output_set(c, &bridges),
                        }
                    });
                channels.push(OutputChannel::Shuffle {
                    gbk: *gbk,
                    shard,
                    local,
                    merge,
                    feeders: feeders[gbk].clone(),
                    gbk_outputs: self.output_set(*gbk, &bridges),
                    combine,
                });
            }
            mscrs.push(Mscr {
                id: MscrId::new(next),
                mappers,
                channels,
            });
            next += 1;
        }

        // 2. Flatten channels: flattens that own persisted outputs.
        for id in &self.live {
            let Node::Flatten { inputs } = self.g.node(*id) else {
                continue;
            };
            let outputs = self.output_set(*id, &bridges);
            if outputs.is_empty() {
                continue;
            }
            let mut mappers = Vec::new();
            let mut feeder_ids = Vec::new();
            let mut seen = BTreeSet::new();
            for b in &inputs {
                let is_free_mapper = matches!(self.g.node(*b), Node::ParallelDo { .. })
                    && !assigned.contains_key(b)
                    && self.g.sinks_of(*b).is_empty()
                    && !bridges.contains_key(b);
                let spec = if is_free_mapper {
                    self.plain_mapper_spec(*b, &bridges)?
                } else {
                    self.identity_mapper_spec(*b, &bridges)?
                };
                // A branch repeated in the flatten feeds the channel twice
                // but runs as one mapper.
                feeder_ids.push(spec.node);
                if seen.insert(spec.node) {
                    mappers.push(spec);
                }
            }
            sort_mappers(&mut mappers);
            mscrs.push(Mscr {
                id: MscrId::new(next),
                mappers,
                channels: vec![OutputChannel::Flatten {
                    node: *id,
                    feeders: feeder_ids,
                    outputs,
                }],
            });
            next += 1;
        }

        // 3. Orphan map-only chains: mapper-capable nodes with persisted
        // outputs that no shuffle or flatten claimed.
        for id in &self.live {
            let node = self.g.node(*id);
            let mapper_capable = matches!(node, Node::ParallelDo { .. })
                || (matches!(node, Node::Combine { .. }) && !attached.contains_key(id));
            if !mapper_capable || assigned.contains_key(id) {
                continue;
            }
            let outputs = self.output_set(*id, &bridges);
            if outputs.is_empty() {
                continue;
            }
            let spec = self.plain_mapper_spec(*id, &bridges)?;
            mscrs.push(Mscr {
                id: MscrId::new(next),
                mappers: vec![spec],
                channels: Vec::new(),
            });
            next += 1;
        }

        Ok((mscrs, bridges))
    }

    /// Merge shuffle groups that share a mapper.
    fn group_shuffles(
        &self,
        gbks: &[NodeId],
        feeders: &BTreeMap<NodeId, Vec<NodeId>>,
    ) -> Vec<BTreeSet<NodeId>> {
        let mut groups: Vec<BTreeSet<NodeId>> =
            gbks.iter().map(|g| BTreeSet::from([*g])).collect();
        loop {
            let mut merged = false;
            'outer: for i in 0..groups.len() {
                for j in (i + 1)..groups.len() {
                    let share = groups[i].iter().any(|a| {
                        groups[j].iter().any(|b| {
                            feeders[a].iter().any(|m| feeders[b].contains(m))
                        })
                    });
                    if share {
                        let other = groups.remove(j);
                        groups[i].extend(other);
                        merged = true;
                        break 'outer;
                    }
                }
            }
            if !merged {
                return groups;
            }
        }
    }

    /// A mapper of a group must not read the output of a shuffle of the same
    /// group: peel such shuffles into their own group until stable.
    fn split_internal_dependencies(
        &self,
        groups: &mut Vec<BTreeSet<NodeId>>,
        feeders: &BTreeMap<NodeId, Vec<NodeId>>,
    ) {
        loop {
            let mut split: Option<(usize, NodeId)> = None;
            'outer: for (gi, group) in groups.iter().enumerate() {
                if group.len() < 2 {
                    continue;
                }
                for gbk in group {
                    for m in &feeders[gbk] {
                        let Node::ParallelDo { input, .. } = self.g.node(*m) else {
                            continue;
                        };
                        let upstream_shuffle = group.contains(&input)
                            || matches!(self.g.node(input), Node::Combine { input: ci, .. } if group.contains(&ci));
                        if upstream_shuffle {
                            split = Some((gi, *gbk));
                            break 'outer;
                        }
                    }
                }
            }
            match split {
                Some((gi, gbk)) => {
                    debug!(?gbk, "splitting shuffle out of its group: internal dependency");
                    groups[gi].remove(&gbk);
                    groups.push(BTreeSet::from([gbk]));
                }
                None => return,
            }
        }
    }

    /// Process nodes whose output is consumed across an MSCR boundary, plus
    /// materialised nodes and process-node roots.
    fn bridge_consumers(
        &self,
        groups: &[BTreeSet<NodeId>],
        feeders: &BTreeMap<NodeId, Vec<NodeId>>,
        attached: &BTreeMap<NodeId, NodeId>,
        assigned: &BTreeMap<NodeId, BTreeSet<usize>>,
    ) -> BTreeSet<NodeId> {
        let group_of_gbk: HashMap<NodeId, usize> = groups
            .iter()
            .enumerate()
            .flat_map(|(gi, g)| g.iter().map(move |n| (*n, gi)))
            .collect();

        let mut needs = BTreeSet::new();
        for id in &self.live {
            let node = self.g.node(*id);
            if !node.is_process_node() {
                continue;
            }
            if self.roots.contains(id) {
                needs.insert(*id);
                continue;
            }
            for p in self.parents_of(*id) {
                match self.g.node(*p) {
                    Node::Materialise { .. } => {
                        needs.insert(*id);
                    }
                    Node::ParallelDo { input, .. } if input == *id => {
                        // An in-job chain needs the producer in every group
                        // the consumer runs in; anything else crosses a
                        // boundary.
                        let same_job = match (assigned.get(id), assigned.get(p)) {
                            (Some(a), Some(b)) => b.is_subset(a),
                            _ => false,
                        };
                        if !same_job {
                            needs.insert(*id);
                        }
                    }
                    Node::Combine { input, .. } if input == *id => {
                        // An unattached combine reads the shuffle's bridge.
                        if attached.get(p) != Some(id) {
                            needs.insert(*id);
                        }
                    }
                    Node::GroupByKey { .. } => {
                        // Reached only via an inserted identity mapper; the
                        // mapper (a ParallelDo parent) is handled above.
                    }
                    Node::Flatten { .. } => {
                        // Dissolves when it feeds a shuffle of the branch
                        // mapper's group; an output-owning flatten reads this
                        // branch through an identity mapper over its bridge,
                        // unless the branch is a free mapper claimed by the
                        // flatten channel itself.
                        let free_mapper = matches!(self.g.node(*id), Node::ParallelDo { .. })
                            && !assigned.contains_key(id)
                            && self.g.sinks_of(*id).is_empty();
                        let feeds_shuffle = self
                            .parents_of(*p)
                            .iter()
                            .any(|pp| group_of_gbk.contains_key(pp) && feeders[pp].contains(id));
                        let flatten_has_outputs = !self.g.sinks_of(*p).is_empty()
                            || self.roots.contains(p)
                            || self
                                .parents_of(*p)
                                .iter()
                                .any(|pp| !matches!(self.g.node(*pp), Node::GroupByKey { .. }));
                        if flatten_has_outputs && !free_mapper && !feeds_shuffle {
                            needs.insert(*id);
                        }
                    }
                    _ => {}
                }
            }
        }
        needs
    }

    fn output_set(&self, node: NodeId, bridges: &HashMap<NodeId, Bridge>) -> OutputSet {
        OutputSet {
            node,
            sinks: self.g.sinks_of(node),
            bridge: bridges.get(&node).cloned(),
            wire: self.g.wire(node),
        }
    }

    /// Spec for a feeder of shuffle group `gi`.
    fn mapper_spec(
        &self,
        m: NodeId,
        gi: usize,
        assigned: &BTreeMap<NodeId, BTreeSet<usize>>,
        bridges: &HashMap<NodeId, Bridge>,
    ) -> Result<MapperSpec> {
        let Node::ParallelDo {
            input, env, fun, ..
        } = self.g.node(m)
        else {
            unreachable!("shuffle feeders are ParallelDos");
        };
        let source = self.resolve_input(input, Some((m, gi)), assigned, bridges)?;
        Ok(MapperSpec {
            node: m,
            input: source,
            fun,
            env: Some(env),
            in_wire: self.g.wire(input),
            out_wire: self.g.wire(m),
            outputs: self.optional_output_set(m, bridges),
        })
    }

    /// Spec for a mapper outside any shuffle group (map-only or flatten
    /// branch).
    fn plain_mapper_spec(
        &self,
        m: NodeId,
        bridges: &HashMap<NodeId, Bridge>,
    ) -> Result<MapperSpec> {
        let (input, env, fun) = match self.g.node(m) {
            Node::ParallelDo {
                input, env, fun, ..
            } => (input, Some(env), fun),
            Node::Combine { input, fun, .. } => (input, None, fun),
            other => {
                return Err(ScoobiError::OptimiserInvariant(format!(
                    "{m:?} ({}) cannot act as a mapper",
                    other.kind()
                ))
                .into())
            }
        };
        let source = self.resolve_input(input, None, &BTreeMap::new(), bridges)?;
        Ok(MapperSpec {
            node: m,
            input: source,
            fun,
            env,
            in_wire: self.g.wire(input),
            out_wire: self.g.wire(m),
            outputs: self.optional_output_set(m, bridges),
        })
    }

    /// A synthesised pass-through mapper over a non-mapper flatten branch.
    fn identity_mapper_spec(
        &self,
        branch: NodeId,
        bridges: &HashMap<NodeId, Bridge>,
    ) -> Result<MapperSpec> {
        let source = self.resolve_input(branch, None, &BTreeMap::new(), bridges)?;
        let wire = self.g.wire(branch);
        Ok(MapperSpec {
            node: branch,
            input: source,
            fun: Arc::new(IdentityFn),
            env: None,
            in_wire: wire.clone(),
            out_wire: wire,
            outputs: None,
        })
    }

    fn optional_output_set(
        &self,
        node: NodeId,
        bridges: &HashMap<NodeId, Bridge>,
    ) -> Option<OutputSet> {
        let set = self.output_set(node, bridges);
        (!set.is_empty()).then_some(set)
    }

    fn resolve_input(
        &self,
        input: NodeId,
        mapper_group: Option<(NodeId, usize)>,
        assigned: &BTreeMap<NodeId, BTreeSet<usize>>,
        bridges: &HashMap<NodeId, Bridge>,
    ) -> Result<MscrInput> {
        match self.g.node(input) {
            Node::Load { source } => Ok(MscrInput::Source(source)),
            n if n.is_process_node() => {
                // In-job chain when the producing mapper sits in the same
                // shuffle group.
                if let Some((_, gi)) = mapper_group {
                    if assigned.get(&input).is_some_and(|gs| gs.contains(&gi)) {
                        return Ok(MscrInput::Mapper(input));
                    }
                }
                let bridge = bridges.get(&input).cloned().ok_or_else(|| {
                    ScoobiError::OptimiserInvariant(format!(
                        "mapper input {input:?} crosses an MSCR boundary without a bridge"
                    ))
                })?;
                Ok(MscrInput::Bridge(bridge))
            }
            other => Err(ScoobiError::OptimiserInvariant(format!(
                "mapper input {input:?} is {}-shaped",
                other.kind()
            ))
            .into()),
        }
    }
}

/// Topologically order mappers on their in-job inputs, ascending node id
/// among free mappers for determinism.
fn sort_mappers(mappers: &mut Vec<MapperSpec>) {
    let index: HashMap<NodeId, usize> = mappers
        .iter()
        .enumerate()
        .map(|(i, m)| (m.node, i))
        .collect();
    let mut order: Vec<usize> = (0..mappers.len()).collect();
    order.sort_by_key(|i| mappers[*i].node);
    let mut placed: Vec<MapperSpec> = Vec::with_capacity(mappers.len());
    let mut done: HashSet<NodeId> = HashSet::new();
    while placed.len() < mappers.len() {
        let mut progressed = false;
        for &i in &order {
            let m = &mappers[i];
            if done.contains(&m.node) {
                continue;
            }
            let ready = match &m.input {
                MscrInput::Mapper(dep) => done.contains(dep) || !index.contains_key(dep),
                _ => true,
            };
            if ready {
                done.insert(m.node);
                placed.push(m.clone());
                progressed = true;
            }
        }
        assert!(progressed, "cycle among in-job mappers");
    }
    *mappers = placed;
}

/// Compute MSCR dependencies and peel layers Kahn-style.
fn layer(mscrs: &[Mscr], g: &Graph) -> Result<Vec<Layer>> {
    // Owner MSCR of every bridge-producing node.
    let mut owner: HashMap<NodeId, MscrId> = HashMap::new();
    for m in mscrs {
        for set in m.output_sets() {
            if set.bridge.is_some() {
                owner.insert(set.node, m.id);
            }
        }
    }

    let mut deps: BTreeMap<MscrId, BTreeSet<MscrId>> = BTreeMap::new();
    for m in mscrs {
        let entry = deps.entry(m.id).or_default();
        for b in m.input_bridges() {
            if let Some(o) = owner.get(&b.owner) {
                if *o != m.id {
                    entry.insert(*o);
                }
            }
        }
        // Environments: a materialised value must be produced in an earlier
        // layer than any job consuming it.
        for mapper in &m.mappers {
            let Some(env) = mapper.env else { continue };
            for mat_input in materialised_inputs(g, env) {
                if let Some(o) = owner.get(&mat_input) {
                    if *o != m.id {
                        entry.insert(*o);
                    }
                }
            }
        }
    }

    let mut remaining: BTreeMap<MscrId, Mscr> =
        mscrs.iter().map(|m| (m.id, m.clone())).collect();
    let mut layers = Vec::new();
    while !remaining.is_empty() {
        let ready: Vec<MscrId> = remaining
            .keys()
            .copied()
            .filter(|id| deps[id].iter().all(|d| !remaining.contains_key(d)))
            .collect();
        if ready.is_empty() {
            return Err(ScoobiError::OptimiserInvariant(
                "cycle in MSCR dependencies".to_string(),
            )
            .into());
        }
        let mut mscrs_here: Vec<Mscr> = ready
            .iter()
            .map(|id| remaining.remove(id).expect("ready MSCR"))
            .collect();
        mscrs_here.sort_by_key(|m| m.id);
        layers.push(Layer {
            id: layers.len(),
            mscrs: mscrs_here,
        });
    }
    Ok(layers)
}

/// Process nodes materialised anywhere inside the `Exp` expression rooted at
/// `env`.
fn materialised_inputs(g: &Graph, env: NodeId) -> Vec<NodeId> {
    let mut out = Vec::new();
    let mut stack = vec![env];
    let mut seen = HashSet::new();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        match g.node(id) {
            Node::Materialise { input, .. } => {
                if g.node(input).is_process_node() {
                    out.push(input);
                }
            }
            Node::Op { left, right, .. } => {
                stack.push(left);
                stack.push(right);
            }
            _ => {}
        }
    }
    out
}
