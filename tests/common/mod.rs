//! Shared builders for the integration tests.
#![allow(dead_code)]

use scoobi::dofn::{FlatMapFn, MapFn};
use scoobi::graph::Graph;
use scoobi::ids::NodeId;
use scoobi::io::{MemorySink, MemorySource};
use scoobi::job::{JobCounters, JobRuntime, LocalRuntime, MapReduceJob};
use std::sync::{Arc, Mutex};

/// Records every submitted job (name and reducer count) before delegating to
/// the in-process runtime.
pub struct CountingRuntime {
    inner: LocalRuntime,
    submitted: Mutex<Vec<(String, usize)>>,
}

impl CountingRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: LocalRuntime,
            submitted: Mutex::new(Vec::new()),
        })
    }

    /// Submission order of job names.
    pub fn names(&self) -> Vec<String> {
        self.submitted
            .lock()
            .unwrap()
            .iter()
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Reducer counts, in submission order.
    pub fn reducers(&self) -> Vec<usize> {
        self.submitted.lock().unwrap().iter().map(|(_, r)| *r).collect()
    }

    pub fn submissions(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }
}

impl JobRuntime for CountingRuntime {
    fn submit(&self, job: &MapReduceJob) -> anyhow::Result<JobCounters> {
        self.submitted
            .lock()
            .unwrap()
            .push((job.spec.name.clone(), job.spec.reducers));
        self.inner.submit(job)
    }
}

/// The nodes of a word-count pipeline over the given lines, ending in a
/// `Combine` with a sink attached.
pub struct WordCount {
    pub graph: Graph,
    pub load: NodeId,
    pub counts: NodeId,
    pub sink: Arc<MemorySink<(String, u64)>>,
}

pub fn word_count(lines: Vec<&str>, sink_label: &str) -> WordCount {
    let graph = Graph::default();
    let lines: Vec<String> = lines.into_iter().map(String::from).collect();
    let load = graph.load(Arc::new(MemorySource::new("lines", lines)));
    let words = graph.parallel_do::<String>(
        load,
        Arc::new(FlatMapFn::new(|s: &String| {
            s.split_whitespace().map(String::from).collect::<Vec<String>>()
        })),
    );
    let pairs = graph.parallel_do::<(String, u64)>(
        words,
        Arc::new(MapFn::new(|w: &String| (w.clone(), 1u64))),
    );
    let grouped = graph.group_by_key::<String, u64>(pairs);
    let counts = graph.combine::<String, u64>(grouped, Arc::new(|a, b| a + b));
    let sink = MemorySink::new(sink_label);
    graph.add_sink(counts, sink.clone());
    WordCount {
        graph,
        load,
        counts,
        sink,
    }
}

pub fn sorted<T: Ord>(mut v: Vec<T>) -> Vec<T> {
    v.sort();
    v
}
