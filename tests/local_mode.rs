mod common;

use anyhow::Result;
use common::{sorted, word_count};
use scoobi::{Executor, ScoobiConf};

#[test]
fn local_mode_cleans_its_scratch_directories() -> Result<()> {
    let work = tempfile::tempdir()?;
    let wc = word_count(vec!["a b a", "b c"], "local-wc-out");
    let conf = ScoobiConf::new()
        .with("scoobi.mode", "Local")
        .with("scoobi.workingdir", work.path().to_string_lossy());
    let exec = Executor::new(conf)?;

    exec.run(&wc.graph, wc.counts)?;

    assert_eq!(
        sorted(wc.sink.contents()),
        vec![
            ("a".to_string(), 2),
            ("b".to_string(), 2),
            ("c".to_string(), 1)
        ]
    );

    // tmp-out-<jobId> directories are torn down after the run.
    let leftovers: Vec<_> = std::fs::read_dir(work.path())?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("tmp-out-"))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
    Ok(())
}

#[test]
fn scratch_is_cleaned_even_when_a_job_fails() -> Result<()> {
    use scoobi::dofn::MapFn;
    use scoobi::graph::Graph;
    use scoobi::io::{MemorySink, MemorySource};
    use std::sync::Arc;

    let work = tempfile::tempdir()?;
    let g = Graph::default();
    let load = g.load(Arc::new(MemorySource::new("in", vec![1u64])));
    let bad = g.parallel_do::<u64>(
        load,
        Arc::new(MapFn::new(|_: &u64| -> u64 { panic!("boom") })),
    );
    g.add_sink(bad, MemorySink::<u64>::new("local-fail-out"));

    let conf = ScoobiConf::new()
        .with("scoobi.mode", "Local")
        .with("scoobi.workingdir", work.path().to_string_lossy());
    let exec = Executor::new(conf)?;
    assert!(exec.run(&g, bad).is_err());

    let leftovers: Vec<_> = std::fs::read_dir(work.path())?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("tmp-out-"))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
    Ok(())
}
