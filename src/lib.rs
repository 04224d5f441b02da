//! Planner/executor core for a distributed-collections dataflow library.
//!
//! A computation is a DAG of dataflow operators (map, group-by-key, combine,
//! flatten, materialise, constants, binary ops on scalars) built in a
//! [`Graph`]. This crate optimises that graph through a sequence of
//! semantics-preserving rewrites, partitions it into *MSCRs*
//! (Map-Shuffle-Combine-Reduce units) grouped into topologically ordered
//! *layers*, and drives layer-by-layer execution: independent MSCRs of a
//! layer run concurrently, computed scalar values are pushed into mapper
//! environments, and intermediates whose outputs already exist are skipped.
//!
//! Reading and writing user data stays outside: `Load` nodes consume a
//! pluggable [`DataSource`], persisted outputs go to pluggable [`DataSink`]s,
//! and a [`job::JobRuntime`] submits the configured batch jobs. The
//! in-process [`job::LocalRuntime`] backs the `InMemory` and `Local` modes.

pub mod attributes;
pub mod bridge;
pub mod cancel;
pub mod config;
pub mod dofn;
pub mod error;
pub mod executor;
pub mod graph;
pub mod ids;
pub mod io;
pub mod job;
pub mod mscr;
pub mod node;
pub mod optimiser;
pub mod testing;
pub mod wire;

pub use cancel::CancellationToken;
pub use config::{Mode, ScoobiConf};
pub use error::ScoobiError;
pub use executor::Executor;
pub use graph::Graph;
pub use ids::{BridgeId, JobId, MscrId, NodeId};
pub use io::{DataSink, DataSource, MemorySink, MemorySource};
pub use node::{Node, Shape};
pub use wire::{Env, Item, Partition, WireFormat};
