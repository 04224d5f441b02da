//! Bridges: persisted intermediate outputs between MSCRs.
//!
//! A [`Bridge`] is owned by exactly one process node (the upstream producer)
//! and spans from planner emission to the end of the executor run. Data
//! behind a bridge lives in the run's [`BridgeStore`]; bridge ids are derived
//! from the owning node's id, so a rerun over the same graph finds the
//! intermediates an earlier run filled.
//!
//! The [`SinkRegistry`] tracks which bridges and which user-facing sinks have
//! already been written. Before execution, [`prune_filled`] replaces every
//! subgraph rooted at a process node with a filled bridge by a virtual `Load`
//! over that bridge: the *skip-already-computed* optimisation. Downstream
//! results are identical to a fresh run.

use crate::graph::Graph;
use crate::ids::{BridgeId, NodeId};
use crate::io::{DataSource, Split};
use crate::node::Node;
use crate::wire::{Partition, WireFormat};
use anyhow::{anyhow, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// An intermediate materialisation point between two MSCRs.
#[derive(Clone)]
pub struct Bridge {
    /// Stable store id, derived from the owning node.
    pub id: BridgeId,
    /// The process node that produces this bridge.
    pub owner: NodeId,
    /// Serialiser descriptor of the bridged elements.
    pub wire: WireFormat,
}

impl Bridge {
    /// The bridge owned by process node `owner`.
    pub fn for_node(owner: NodeId, wire: WireFormat) -> Self {
        Self {
            id: BridgeId::new(owner.raw()),
            owner,
            wire,
        }
    }

    /// Whether this bridge's contents were written, this run or earlier.
    pub fn has_been_filled(&self, store: &BridgeStore) -> bool {
        store.is_filled(self.id)
    }

    /// Clone out the bridged partitions.
    ///
    /// # Errors
    /// If the bridge was never filled.
    pub fn read_as_iterable(&self, store: &BridgeStore) -> Result<Vec<Partition>> {
        store.read(self.id, &self.wire)
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Bridge({:?} of {:?})", self.id, self.owner)
    }
}

struct StoredBridge {
    parts: Vec<Partition>,
    approx_bytes: u64,
}

/// In-memory storage for bridge contents, shared for the lifetime of an
/// executor. Planner state is in-memory and not checkpointed.
#[derive(Clone, Default)]
pub struct BridgeStore {
    inner: Arc<Mutex<HashMap<BridgeId, StoredBridge>>>,
}

impl BridgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the full contents of a bridge. Overwrites any previous fill.
    pub fn fill(&self, id: BridgeId, parts: Vec<Partition>, approx_bytes: u64) {
        let mut m = self.inner.lock().expect("bridge store lock");
        m.insert(id, StoredBridge { parts, approx_bytes });
    }

    /// Whether `id` holds data.
    pub fn is_filled(&self, id: BridgeId) -> bool {
        self.inner.lock().expect("bridge store lock").contains_key(&id)
    }

    /// Clone out the partitions behind `id`.
    ///
    /// # Errors
    /// If `id` was never filled, or its contents do not match `wire`.
    pub fn read(&self, id: BridgeId, wire: &WireFormat) -> Result<Vec<Partition>> {
        let m = self.inner.lock().expect("bridge store lock");
        let stored = m
            .get(&id)
            .ok_or_else(|| anyhow!("bridge {id:?} read before being filled"))?;
        stored
            .parts
            .iter()
            .map(|p| {
                wire.ops
                    .clone_any(p.as_ref())
                    .ok_or_else(|| anyhow!("bridge {id:?}: element type mismatch on read"))
            })
            .collect()
    }

    /// Rough byte size of the stored contents (0 when unfilled).
    pub fn approx_bytes(&self, id: BridgeId) -> u64 {
        self.inner
            .lock()
            .expect("bridge store lock")
            .get(&id)
            .map_or(0, |s| s.approx_bytes)
    }

    /// Number of stored partitions (0 when unfilled).
    pub fn partition_count(&self, id: BridgeId) -> usize {
        self.inner
            .lock()
            .expect("bridge store lock")
            .get(&id)
            .map_or(0, |s| s.parts.len())
    }
}

/// The two filled-sets of one executor: intermediate bridges and user-facing
/// sinks already written. Mutated only by the executor's main thread, between
/// layers.
#[derive(Default)]
pub struct SinkRegistry {
    filled_bridges: HashSet<BridgeId>,
    filled_sinks: HashSet<String>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_bridge_filled(&mut self, id: BridgeId) {
        self.filled_bridges.insert(id);
    }

    pub fn is_bridge_filled(&self, id: BridgeId) -> bool {
        self.filled_bridges.contains(&id)
    }

    pub fn mark_sink_filled(&mut self, output_id: &str) {
        self.filled_sinks.insert(output_id.to_string());
    }

    pub fn is_sink_filled(&self, output_id: &str) -> bool {
        self.filled_sinks.contains(output_id)
    }
}

/// A virtual `Load` over an already-filled bridge.
pub struct BridgeSource {
    store: BridgeStore,
    bridge: Bridge,
}

impl BridgeSource {
    pub fn new(store: BridgeStore, bridge: Bridge) -> Self {
        Self { store, bridge }
    }
}

impl DataSource for BridgeSource {
    fn input_splits(&self) -> Result<Vec<Split>> {
        let n = self.store.partition_count(self.bridge.id).max(1);
        let total = self.store.approx_bytes(self.bridge.id);
        Ok((0..n)
            .map(|index| Split {
                index,
                approx_bytes: Some(total / n as u64),
            })
            .collect())
    }

    fn read_split(&self, split: Split) -> Result<Partition> {
        let mut parts = self.bridge.read_as_iterable(&self.store)?;
        if split.index >= parts.len() {
            return Err(anyhow!(
                "bridge {:?}: split {} out of range",
                self.bridge.id,
                split.index
            ));
        }
        Ok(parts.swap_remove(split.index))
    }

    fn wire(&self) -> WireFormat {
        self.bridge.wire.clone()
    }

    fn size_hint(&self) -> Option<u64> {
        Some(self.store.approx_bytes(self.bridge.id))
    }

    fn name(&self) -> String {
        format!("bridge:{:?}", self.bridge.id)
    }
}

/// Replace every subgraph rooted at a process node whose bridge is already
/// filled (and whose sinks, if any, are all filled) by a virtual `Load` over
/// the existing bridge. Unreachable leftovers are collected afterwards by the
/// caller's gc.
pub(crate) fn prune_filled(g: &Graph, store: &BridgeStore, registry: &SinkRegistry) {
    for id in g.node_ids() {
        let node = g.node(id);
        if !node.is_process_node() {
            continue;
        }
        let wire = g.wire(id);
        let bridge = Bridge::for_node(id, wire.clone());
        if !registry.is_bridge_filled(bridge.id) || !store.is_filled(bridge.id) {
            continue;
        }
        let sinks_done = g
            .sinks_of(id)
            .iter()
            .all(|s| registry.is_sink_filled(&s.output_id()));
        if !sinks_done {
            continue;
        }
        debug!(node = ?id, bridge = ?bridge.id, "skip-already-computed: substituting filled bridge");
        g.replace(
            id,
            Node::Load {
                source: Arc::new(BridgeSource::new(store.clone(), bridge)),
            },
        );
    }
}
