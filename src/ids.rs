//! Lightweight unique identifiers handed out by the planner.
//!
//! Each [`Node`](crate::node::Node) inserted into a [`Graph`](crate::graph::Graph)
//! is assigned a sequential [`NodeId`]. MSCRs, bridges and jobs get their own
//! id families. All of these are opaque handles; only the planner and executor
//! inspect them directly.
//!
//! They’re small, `Copy`, and hashable, so they can be used efficiently as keys
//! in maps or sets when snapshotting or traversing a plan.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Unique numeric identifier for a node in a computation graph.
///
/// Identity and equality of nodes are defined by this id alone; structural
/// content never participates in equality or hashing.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    pub(crate) fn new(v: u64) -> Self {
        Self(v)
    }

    /// Return the underlying numeric value.
    ///
    /// Useful mainly for debugging or log output.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Unique identifier of one MSCR (one batch job) within a plan.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MscrId(u64);

impl MscrId {
    pub(crate) fn new(v: u64) -> Self {
        Self(v)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for MscrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mscr{}", self.0)
    }
}

/// Identifier of a bridge store: a persisted intermediate output owned by one
/// process node. Stable for the lifetime of the owning executor, so reruns can
/// find intermediates that were filled by an earlier run.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BridgeId(u64);

impl BridgeId {
    pub(crate) fn new(v: u64) -> Self {
        Self(v)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for BridgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// Identifier of one submitted batch job.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl JobId {
    pub(crate) fn new(v: u64) -> Self {
        Self(v)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "j{}", self.0)
    }
}

/// Shared monotonic counter used to mint fresh [`NodeId`]s.
///
/// A graph and every snapshot taken from it share one `IdGen`, so ids minted
/// for rewritten nodes during optimisation never collide with ids in the
/// original graph.
#[derive(Clone, Default)]
pub struct IdGen(Arc<AtomicU64>);

impl IdGen {
    pub(crate) fn next_node(&self) -> NodeId {
        NodeId::new(self.0.fetch_add(1, Ordering::Relaxed))
    }
}
