//! Layer-by-layer plan execution.
//!
//! The top-level operation is structural recursion on the root: scalar roots
//! (`Return`, `Op`, `Materialise`) are evaluated after the layers producing
//! their inputs ran; any other root just has its layers executed.
//!
//! For each layer, in order:
//!
//! 1. **Configure sequentially.** Every MSCR gets a fresh configuration clone
//!    and its input environments pre-loaded (recursively evaluating the `Exp`
//!    inputs). Configuration is sequential to avoid races in the shared
//!    attribute table.
//! 2. **Dispatch concurrently.** With `scoobi.concurrentjobs` enabled and
//!    more than one MSCR in the layer, all configured jobs run on a bounded
//!    worker pool and are joined; otherwise they run one by one. A failing
//!    job is captured in its report, never aborting siblings.
//! 3. **Report.** Every completed job logs its counters.
//! 4. **Mark filled.** Sinks and bridges written by the layer enter the
//!    filled sets, on the executor's main thread, between layers.
//! 5. **Fail fast.** A failed or cancelled job aborts before the next layer.
//!
//! Computed scalar values are pushed through the attribute-table lock so that
//! every `ParallelDo` consuming them sees the value before any later-layer
//! job starts. Temporary job directories are torn down on every exit path.
//!
//! The executor keeps its bridge store and filled-sets across runs, which is
//! what lets a rerun skip subgraphs whose intermediates already exist.

use crate::attributes::Attributes;
use crate::bridge::{prune_filled, Bridge, BridgeStore, SinkRegistry};
use crate::cancel::CancellationToken;
use crate::config::{Mode, ScoobiConf};
use crate::error::ScoobiError;
use crate::graph::Graph;
use crate::ids::{JobId, NodeId};
use crate::job::{JobOutcome, JobReport, JobRuntime, LocalRuntime, MapReduceJob};
use crate::mscr::{decompose, Mscr, Plan};
use crate::node::{Node, Shape};
use crate::optimiser::optimise;
use crate::wire::{Env, Partition};
use anyhow::{anyhow, Result};
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Drives optimisation, MSCR decomposition and layered execution of a graph.
pub struct Executor {
    conf: ScoobiConf,
    runtime: Arc<dyn JobRuntime>,
    store: BridgeStore,
    registry: Mutex<SinkRegistry>,
    cancel: CancellationToken,
    job_seq: AtomicU64,
}

impl Executor {
    /// An executor for the configured mode.
    ///
    /// # Errors
    /// `Cluster` mode needs a caller-supplied runtime; use
    /// [`Executor::with_runtime`] for it.
    pub fn new(conf: ScoobiConf) -> Result<Self> {
        match conf.mode()? {
            Mode::InMemory | Mode::Local => Ok(Self::with_runtime(conf, Arc::new(LocalRuntime))),
            Mode::Cluster => Err(ScoobiError::Validation(
                "cluster mode requires an external job runtime".to_string(),
            )
            .into()),
        }
    }

    /// An executor submitting jobs to the given batch runtime.
    pub fn with_runtime(conf: ScoobiConf, runtime: Arc<dyn JobRuntime>) -> Self {
        Self {
            conf,
            runtime,
            store: BridgeStore::new(),
            registry: Mutex::new(SinkRegistry::new()),
            cancel: CancellationToken::new(),
            job_seq: AtomicU64::new(0),
        }
    }

    /// The token that cancels this executor's runs.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Handle to the run's intermediate storage.
    pub fn bridge_store(&self) -> BridgeStore {
        self.store.clone()
    }

    /// Execute the layers reaching `root`, filling its sinks and bridges.
    ///
    /// # Errors
    /// Validation, optimiser, job-failure, cancellation or I/O errors, per
    /// the error-kind taxonomy.
    pub fn run(&self, g: &Graph, root: NodeId) -> Result<()> {
        self.run_all(g, &[root])
    }

    /// Execute the layers reaching all of `roots` in one plan.
    ///
    /// # Errors
    /// See [`Executor::run`].
    pub fn run_all(&self, g: &Graph, roots: &[NodeId]) -> Result<()> {
        self.execute_plan(g, roots)?;
        Ok(())
    }

    /// Execute the layers reaching an `Exp` root and return its value.
    ///
    /// # Errors
    /// As [`Executor::run`], plus a validation error when `root` is not
    /// `Exp`-shaped.
    pub fn evaluate(&self, g: &Graph, root: NodeId) -> Result<Env> {
        if g.shape(root) != Shape::Exp {
            return Err(ScoobiError::Validation(format!(
                "evaluate needs an Exp root, {root:?} is Arr"
            ))
            .into());
        }
        let plan = self.execute_plan(g, &[root])?;
        let attrs = Attributes::new();
        self.eval_exp(&plan.graph, plan.roots[0], &attrs)
    }

    /// [`Executor::evaluate`], downcast to the expected value type.
    ///
    /// # Errors
    /// As `evaluate`, plus a validation error on a value-type mismatch.
    pub fn evaluate_as<T: Send + Sync + 'static>(
        &self,
        g: &Graph,
        root: NodeId,
    ) -> Result<Arc<T>> {
        self.evaluate(g, root)?
            .downcast::<T>()
            .map_err(|_| ScoobiError::Validation("evaluated value type mismatch".to_string()).into())
    }

    fn execute_plan(&self, g: &Graph, roots: &[NodeId]) -> Result<Plan> {
        g.validate()
            .map_err(|e| ScoobiError::Validation(format!("{e:#}")))?;

        let work = g.deep_copy();
        let mut roots = roots.to_vec();
        optimise(&work, &mut roots)?;
        {
            let registry = self.registry.lock().expect("sink registry lock");
            prune_filled(&work, &self.store, &registry);
        }
        // A substituted bridge may now sit directly under a shuffle; a second
        // optimiser pass restores the mapper-backed invariant and collects
        // the subtrees the substitution cut off.
        optimise(&work, &mut roots)?;
        debug!("optimised graph:\n{}", work.pretty());

        let plan = decompose(work, roots)?;
        info!(
            layers = plan.layers.len(),
            mscrs = plan.layers.iter().map(|l| l.mscrs.len()).sum::<usize>(),
            "executing plan"
        );
        self.run_layers(&plan)?;
        Ok(plan)
    }

    fn run_layers(&self, plan: &Plan) -> Result<()> {
        let attrs = Attributes::new();
        for (node, bridge) in &plan.bridges {
            attrs.set_bridge(*node, bridge.clone());
        }
        let mut tmp_dirs = Vec::new();
        let result = self.run_layers_inner(plan, &attrs, &mut tmp_dirs);
        self.cleanup(&tmp_dirs);
        result
    }

    fn run_layers_inner(
        &self,
        plan: &Plan,
        attrs: &Attributes,
        tmp_dirs: &mut Vec<PathBuf>,
    ) -> Result<()> {
        for layer in &plan.layers {
            if self.cancel.is_cancelled() {
                return Err(ScoobiError::Cancelled.into());
            }
            info!(layer = layer.id, mscrs = layer.mscrs.len(), "starting layer");

            // Configure sequentially: shared attribute state is not
            // thread-safe to populate.
            let mut jobs = Vec::with_capacity(layer.mscrs.len());
            for mscr in &layer.mscrs {
                let envs = self.preload_envs(plan, mscr, attrs)?;
                let job_id = JobId::new(self.job_seq.fetch_add(1, Ordering::Relaxed));
                let job = MapReduceJob::configure(
                    Arc::new(mscr.clone()),
                    layer.id,
                    job_id,
                    self.conf.clone(),
                    envs,
                    self.store.clone(),
                    self.cancel.clone(),
                )?;
                tmp_dirs.push(job.spec.tmp_dir.clone());
                jobs.push(job);
            }

            // Dispatch: all at once on a bounded pool, or one by one.
            let reports: Vec<JobReport> =
                if self.conf.concurrent_jobs() && jobs.len() > 1 {
                    let width = jobs.len().min(num_cpus::get().max(2));
                    let pool = rayon::ThreadPoolBuilder::new()
                        .num_threads(width)
                        .build()
                        .map_err(|e| anyhow!("building worker pool: {e}"))?;
                    pool.install(|| {
                        jobs.par_iter()
                            .map(|j| j.execute(self.runtime.as_ref()))
                            .collect()
                    })
                } else {
                    jobs.iter()
                        .map(|j| j.execute(self.runtime.as_ref()))
                        .collect()
                };

            for report in &reports {
                report.log();
            }

            // Mark sinks and bridges of successful jobs as filled; main
            // thread only, between layers.
            {
                let mut registry = self.registry.lock().expect("sink registry lock");
                for (job, report) in jobs.iter().zip(reports.iter()) {
                    if report.outcome != JobOutcome::Succeeded {
                        continue;
                    }
                    for set in job.spec.mscr.output_sets() {
                        for sink in &set.sinks {
                            registry.mark_sink_filled(&sink.output_id());
                        }
                        if let Some(bridge) = &set.bridge {
                            registry.mark_bridge_filled(bridge.id);
                        }
                    }
                }
            }

            // Fail fast before the next layer.
            if reports.iter().any(|r| r.outcome == JobOutcome::Cancelled) {
                return Err(ScoobiError::Cancelled.into());
            }
            if let Some(failed) = reports
                .iter()
                .find(|r| matches!(r.outcome, JobOutcome::Failed(_)))
            {
                let JobOutcome::Failed(reason) = &failed.outcome else {
                    unreachable!();
                };
                return Err(ScoobiError::JobFailure {
                    name: failed.name.clone(),
                    reason: reason.clone(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Evaluate every environment the MSCR's mappers consume.
    fn preload_envs(
        &self,
        plan: &Plan,
        mscr: &Mscr,
        attrs: &Attributes,
    ) -> Result<HashMap<NodeId, Env>> {
        let mut envs = HashMap::new();
        for mapper in &mscr.mappers {
            if let Some(e) = mapper.env {
                let value = self.eval_exp(&plan.graph, e, attrs)?;
                envs.insert(e, value);
            }
        }
        Ok(envs)
    }

    /// Structural evaluation of an `Exp` node. Materialised inputs must have
    /// been produced by an earlier layer (the layering guarantees it for
    /// environments). Values are pushed into the attribute table as they are
    /// computed.
    fn eval_exp(&self, g: &Graph, id: NodeId, attrs: &Attributes) -> Result<Env> {
        if let Some(v) = attrs.env_of(id) {
            return Ok(v);
        }
        let value = match g.node(id) {
            Node::Return { value } => value,
            Node::Op { left, right, apply } => {
                let a = self.eval_exp(g, left, attrs)?;
                let b = self.eval_exp(g, right, attrs)?;
                apply(&a, &b)
            }
            Node::Materialise { input, collect } => {
                let parts = self.read_arr(g, input)?;
                collect(parts)
            }
            other => {
                return Err(anyhow!(
                    "{id:?} ({}) is not an Exp node",
                    other.kind()
                ))
            }
        };
        attrs.push_env(id, value.clone());
        Ok(value)
    }

    /// Read the full contents of an `Arr` node: straight from the source for
    /// a `Load`, from the bridge for a process node.
    fn read_arr(&self, g: &Graph, id: NodeId) -> Result<Vec<Partition>> {
        match g.node(id) {
            Node::Load { source } => source
                .input_splits()?
                .into_iter()
                .map(|s| source.read_split(s))
                .collect(),
            n if n.is_process_node() => {
                let bridge = Bridge::for_node(id, g.wire(id));
                if !bridge.has_been_filled(&self.store) {
                    return Err(anyhow!(
                        "materialised node {id:?} was not produced by an earlier layer"
                    ));
                }
                bridge.read_as_iterable(&self.store)
            }
            other => Err(anyhow!("cannot read {id:?} ({}) as data", other.kind())),
        }
    }

    fn cleanup(&self, tmp_dirs: &[PathBuf]) {
        if self.conf.mode().unwrap_or(Mode::Local) == Mode::InMemory {
            return;
        }
        for dir in tmp_dirs {
            if dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(dir) {
                    warn!(dir = %dir.display(), error = %e, "leaving temporary output behind");
                }
            }
        }
    }
}
