//! The job adapter: one configured MSCR, submitted as one batch job.
//!
//! [`MapReduceJob`] is the only component aware of the underlying batch
//! framework, reached through the [`JobRuntime`] submit-and-wait trait. The
//! adapter assigns the job name (encoding job, layer and MSCR ids), computes
//! the reducer count from
//! `max(min_reducers, min(max_reducers, ceil(input_bytes / bytes_per_reducer)))`,
//! sets the temporary output directory `<workingdir>/tmp-out-<jobId>`, and
//! wires the mapper/combiner/reducer callables derived from the MSCR's
//! process nodes.
//!
//! [`LocalRuntime`] is the in-process backend behind the `InMemory` and
//! `Local` modes: it executes the configured MSCR over host-memory partitions
//! with a rayon-parallel map phase, a hash-partitioned shuffle, and an
//! optional combine phase. A `Cluster` deployment supplies its own
//! `JobRuntime`.

use crate::bridge::BridgeStore;
use crate::cancel::CancellationToken;
use crate::config::{Mode, ScoobiConf};
use crate::dofn::{unit_env, VecEmitter};
use crate::error::ScoobiError;
use crate::ids::{JobId, NodeId};
use crate::mscr::{MapperSpec, Mscr, MscrInput, OutputChannel, OutputSet};
use crate::wire::{Env, Partition, WireFormat};
use anyhow::{anyhow, Context, Result};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// Everything the runtime needs to run one MSCR as a job.
pub struct JobSpec {
    pub job_id: JobId,
    pub layer_id: usize,
    pub mscr: Arc<Mscr>,
    /// `scoobi-job-<jobId>-layer<layerId>-mscr<mscrId>`.
    pub name: String,
    /// Reduce-side parallelism, from the byte-count heuristic.
    pub reducers: usize,
    /// Scratch directory for this job's outputs.
    pub tmp_dir: PathBuf,
    /// Pre-loaded environments, keyed by `Exp` node id.
    pub envs: HashMap<NodeId, Env>,
}

/// Per-job record counters, reported at job end.
#[derive(Clone, Debug, Default, Serialize)]
pub struct JobCounters {
    pub records_read: u64,
    pub records_mapped: u64,
    pub groups_reduced: u64,
    pub records_written: u64,
}

/// Terminal state of one job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum JobOutcome {
    Succeeded,
    Failed(String),
    Cancelled,
}

/// The outcome record of one executed job.
#[derive(Clone, Debug, Serialize)]
pub struct JobReport {
    pub name: String,
    pub job_id: u64,
    pub layer_id: usize,
    pub mscr_id: u64,
    pub reducers: usize,
    pub duration_ms: u64,
    pub counters: JobCounters,
    pub outcome: JobOutcome,
}

impl JobReport {
    /// Emit this report to the log.
    pub fn log(&self) {
        match &self.outcome {
            JobOutcome::Succeeded => info!(
                job = %self.name,
                duration_ms = self.duration_ms,
                read = self.counters.records_read,
                mapped = self.counters.records_mapped,
                reduced = self.counters.groups_reduced,
                written = self.counters.records_written,
                "job succeeded"
            ),
            JobOutcome::Failed(reason) => {
                error!(job = %self.name, duration_ms = self.duration_ms, %reason, "job failed");
            }
            JobOutcome::Cancelled => {
                info!(job = %self.name, "job cancelled");
            }
        }
    }

    /// The report as a JSON document.
    ///
    /// # Errors
    /// If serialisation fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// The submit-and-wait collaborator to the batch framework.
pub trait JobRuntime: Send + Sync {
    /// Run the job to completion, returning its counters.
    ///
    /// # Errors
    /// A job-level failure; the caller records it without aborting sibling
    /// jobs in the same layer.
    fn submit(&self, job: &MapReduceJob) -> Result<JobCounters>;

    /// Best-effort kill of a submitted job. Default: no-op.
    fn kill(&self, _name: &str) {}
}

/// One MSCR configured against one configuration clone.
pub struct MapReduceJob {
    pub spec: JobSpec,
    /// This job's private configuration clone.
    pub conf: ScoobiConf,
    pub(crate) store: BridgeStore,
    pub(crate) cancel: CancellationToken,
}

impl MapReduceJob {
    /// Configure an MSCR for execution: name, reducer count, scratch dir.
    ///
    /// Must run sequentially with respect to other jobs of the same layer;
    /// only `execute` may run concurrently.
    pub(crate) fn configure(
        mscr: Arc<Mscr>,
        layer_id: usize,
        job_id: JobId,
        conf: ScoobiConf,
        envs: HashMap<NodeId, Env>,
        store: BridgeStore,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let mut input_bytes = mscr.source_bytes();
        for b in mscr.input_bridges() {
            input_bytes += store.approx_bytes(b.id);
        }
        let per_reducer = conf.bytes_per_reducer().max(1);
        let from_bytes = (input_bytes.div_ceil(per_reducer)) as usize;
        let reducers = conf
            .min_reducers()
            .max(conf.max_reducers().min(from_bytes))
            .max(1);

        let name = format!(
            "scoobi-job-{}-layer{}-mscr{}",
            job_id.raw(),
            layer_id,
            mscr.id.raw()
        );
        let tmp_dir = conf.tmp_out_dir(job_id);
        debug!(job = %name, reducers, input_bytes, "configured job");

        Ok(Self {
            spec: JobSpec {
                job_id,
                layer_id,
                mscr,
                name,
                reducers,
                tmp_dir,
                envs,
            },
            conf,
            store,
            cancel,
        })
    }

    /// Run the job on `runtime`, blocking until it finishes. Failures and
    /// panics are captured in the report, never propagated; sibling jobs of
    /// the layer run to completion regardless.
    pub fn execute(&self, runtime: &dyn JobRuntime) -> JobReport {
        let start = Instant::now();
        if self.cancel.is_cancelled() {
            runtime.kill(&self.spec.name);
            return self.finish(start, JobCounters::default(), JobOutcome::Cancelled);
        }
        info!(job = %self.spec.name, layer = self.spec.layer_id, "submitting job");
        let result = catch_unwind(AssertUnwindSafe(|| runtime.submit(self)));
        let (counters, outcome) = match result {
            Ok(Ok(counters)) => (counters, JobOutcome::Succeeded),
            Ok(Err(err)) => {
                if err
                    .downcast_ref::<ScoobiError>()
                    .is_some_and(ScoobiError::is_cancelled)
                {
                    (JobCounters::default(), JobOutcome::Cancelled)
                } else {
                    (JobCounters::default(), JobOutcome::Failed(format!("{err:#}")))
                }
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "job panicked".to_string());
                (JobCounters::default(), JobOutcome::Failed(reason))
            }
        };
        self.finish(start, counters, outcome)
    }

    fn finish(&self, start: Instant, counters: JobCounters, outcome: JobOutcome) -> JobReport {
        JobReport {
            name: self.spec.name.clone(),
            job_id: self.spec.job_id.raw(),
            layer_id: self.spec.layer_id,
            mscr_id: self.spec.mscr.id.raw(),
            reducers: self.spec.reducers,
            duration_ms: start.elapsed().as_millis() as u64,
            counters,
            outcome,
        }
    }
}

/// In-process batch backend over host-memory partitions.
pub struct LocalRuntime;

impl JobRuntime for LocalRuntime {
    fn submit(&self, job: &MapReduceJob) -> Result<JobCounters> {
        // The InMemory backend is the same engine minus job scratch dirs.
        if job.conf.mode()? == Mode::Local {
            std::fs::create_dir_all(&job.spec.tmp_dir)
                .map_err(|e| ScoobiError::Io(format!("creating {:?}: {e}", job.spec.tmp_dir)))?;
        }

        let mscr = &job.spec.mscr;
        let mut counters = JobCounters::default();
        let mut mapper_out: HashMap<NodeId, Vec<Partition>> = HashMap::new();
        let out_wire_of: HashMap<NodeId, _> = mscr
            .mappers
            .iter()
            .map(|m| (m.node, m.out_wire.clone()))
            .collect();

        // Map phase: mappers are topologically ordered on in-job inputs.
        for mapper in &mscr.mappers {
            if job.cancel.is_cancelled() {
                return Err(ScoobiError::Cancelled.into());
            }
            let mut inputs = read_mapper_input(job, mapper, &mapper_out)?;
            // A single-split input still gets partition-parallel mapping.
            if inputs.len() == 1 {
                if let Some(split) = mapper
                    .in_wire
                    .ops
                    .split(inputs[0].as_ref(), num_cpus::get().max(2))
                {
                    inputs = split;
                }
            }
            for p in &inputs {
                counters.records_read += mapper.in_wire.ops.len(p.as_ref()).unwrap_or(0) as u64;
            }

            let env = match mapper.env {
                Some(e) => job
                    .spec
                    .envs
                    .get(&e)
                    .cloned()
                    .ok_or_else(|| anyhow!("environment {e:?} was not pre-loaded"))?,
                None => unit_env(),
            };

            let outputs: Vec<Partition> = inputs
                .into_par_iter()
                .map(|p| apply_dofn(mapper, &env, p))
                .collect::<Result<_>>()?;
            for p in &outputs {
                counters.records_mapped +=
                    mapper.out_wire.ops.len(p.as_ref()).unwrap_or(0) as u64;
            }

            if let Some(set) = &mapper.outputs {
                write_output_set(job, set, &outputs, &mut counters)?;
            }
            mapper_out.insert(mapper.node, outputs);
        }

        // Shuffle/combine and concatenation channels.
        for channel in &mscr.channels {
            if job.cancel.is_cancelled() {
                return Err(ScoobiError::Cancelled.into());
            }
            match channel {
                OutputChannel::Shuffle {
                    gbk,
                    shard,
                    local,
                    merge,
                    feeders,
                    gbk_outputs,
                    combine,
                } => {
                    let fed = collect_feeder_outputs(feeders, &mapper_out, &out_wire_of)?;
                    let n = job.spec.reducers;

                    // Hash-partition every mapper partition into reducer
                    // buckets, then group each bucket.
                    let bucketed: Vec<Vec<Partition>> =
                        fed.into_par_iter().map(|p| shard(p, n)).collect();
                    let mut columns: Vec<Vec<Partition>> = (0..n).map(|_| Vec::new()).collect();
                    for row in bucketed {
                        for (r, p) in row.into_iter().enumerate() {
                            columns[r].push(p);
                        }
                    }
                    let grouped: Vec<Partition> = columns
                        .into_par_iter()
                        .map(|parts| {
                            let locals: Vec<Partition> =
                                parts.into_iter().map(|p| local(p)).collect();
                            merge(locals)
                        })
                        .collect();

                    if !gbk_outputs.is_empty() {
                        write_output_set(job, gbk_outputs, &grouped, &mut counters)?;
                    }
                    match combine {
                        Some(cs) => {
                            for p in &grouped {
                                counters.groups_reduced +=
                                    gbk_outputs.wire.ops.len(p.as_ref()).unwrap_or(0) as u64;
                            }
                            let reduce = &cs.reduce;
                            let reduced: Vec<Partition> =
                                grouped.into_par_iter().map(|p| reduce(p)).collect();
                            write_output_set(job, &cs.outputs, &reduced, &mut counters)?;
                        }
                        None => debug!(gbk = ?gbk, "shuffle channel has no reducer"),
                    }
                }
                OutputChannel::Flatten {
                    feeders, outputs, ..
                } => {
                    let fed = collect_feeder_outputs(feeders, &mapper_out, &out_wire_of)?;
                    write_output_set(job, outputs, &fed, &mut counters)?;
                }
            }
        }
        Ok(counters)
    }
}

fn read_mapper_input(
    job: &MapReduceJob,
    mapper: &MapperSpec,
    mapper_out: &HashMap<NodeId, Vec<Partition>>,
) -> Result<Vec<Partition>> {
    match &mapper.input {
        MscrInput::Source(source) => source
            .input_splits()
            .with_context(|| format!("enumerating {}", source.name()))?
            .into_iter()
            .map(|s| source.read_split(s))
            .collect(),
        MscrInput::Bridge(bridge) => bridge.read_as_iterable(&job.store),
        MscrInput::Mapper(node) => {
            let parts = mapper_out
                .get(node)
                .ok_or_else(|| anyhow!("in-job input {node:?} not yet computed"))?;
            parts
                .iter()
                .map(|p| {
                    mapper.in_wire.ops.clone_any(p.as_ref()).ok_or_else(|| {
                        anyhow!("in-job input {node:?}: element type mismatch")
                    })
                })
                .collect()
        }
    }
}

/// Run one mapper over one input split, honouring the full lifecycle.
fn apply_dofn(mapper: &MapperSpec, env: &Env, part: Partition) -> Result<Partition> {
    let items = mapper
        .in_wire
        .ops
        .explode(part)
        .ok_or_else(|| anyhow!("mapper {:?}: input element type mismatch", mapper.node))?;
    let mut emitter = VecEmitter::default();
    mapper.fun.setup(env);
    for item in items {
        mapper.fun.process(env, item, &mut emitter);
    }
    mapper.fun.cleanup(env, &mut emitter);
    mapper
        .out_wire
        .ops
        .implode(emitter.0)
        .ok_or_else(|| anyhow!("mapper {:?}: output element type mismatch", mapper.node))
}

fn collect_feeder_outputs(
    feeders: &[NodeId],
    mapper_out: &HashMap<NodeId, Vec<Partition>>,
    out_wire_of: &HashMap<NodeId, WireFormat>,
) -> Result<Vec<Partition>> {
    let mut fed = Vec::new();
    for f in feeders {
        let parts = mapper_out
            .get(f)
            .ok_or_else(|| anyhow!("feeder {f:?} produced no output"))?;
        let wire = &out_wire_of[f];
        for p in parts {
            fed.push(
                wire.ops
                    .clone_any(p.as_ref())
                    .ok_or_else(|| anyhow!("feeder {f:?}: element type mismatch"))?,
            );
        }
    }
    Ok(fed)
}

fn write_output_set(
    job: &MapReduceJob,
    set: &OutputSet,
    parts: &[Partition],
    counters: &mut JobCounters,
) -> Result<()> {
    let mut written = 0u64;
    for p in parts {
        written += set.wire.ops.len(p.as_ref()).unwrap_or(0) as u64;
    }

    for sink in &set.sinks {
        let mut writer = sink
            .open()
            .map_err(|e| ScoobiError::Io(format!("opening sink {}: {e:#}", sink.output_id())))?;
        for p in parts {
            let clone = set
                .wire
                .ops
                .clone_any(p.as_ref())
                .ok_or_else(|| anyhow!("sink {}: element type mismatch", sink.output_id()))?;
            writer
                .write(clone)
                .map_err(|e| ScoobiError::Io(format!("writing {}: {e:#}", sink.output_id())))?;
        }
        sink.commit()
            .map_err(|e| ScoobiError::Io(format!("committing {}: {e:#}", sink.output_id())))?;
    }

    if let Some(bridge) = &set.bridge {
        let mut clones = Vec::with_capacity(parts.len());
        let mut bytes = 0u64;
        for p in parts {
            bytes += set.wire.ops.approx_bytes(p.as_ref()).unwrap_or(0);
            clones.push(
                set.wire
                    .ops
                    .clone_any(p.as_ref())
                    .ok_or_else(|| anyhow!("bridge {:?}: element type mismatch", bridge.id))?,
            );
        }
        job.store.fill(bridge.id, clones, bytes);
    }

    counters.records_written += written;
    Ok(())
}
