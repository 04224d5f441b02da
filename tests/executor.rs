mod common;

use anyhow::Result;
use common::{sorted, word_count, CountingRuntime};
use scoobi::dofn::{MapFn, MapWithEnvFn};
use scoobi::error::ScoobiError;
use scoobi::graph::Graph;
use scoobi::io::{MemorySink, MemorySource};
use scoobi::testing::interpret_vec;
use scoobi::{Executor, ScoobiConf};
use std::sync::Arc;

fn in_memory_conf() -> ScoobiConf {
    ScoobiConf::new().with("scoobi.mode", "InMemory")
}

#[test]
fn word_count_end_to_end() -> Result<()> {
    let wc = word_count(vec!["a b a", "b c"], "exec-wc-out");
    let runtime = CountingRuntime::new();
    let exec = Executor::with_runtime(in_memory_conf(), runtime.clone());

    exec.run(&wc.graph, wc.counts)?;

    assert_eq!(
        sorted(wc.sink.contents()),
        vec![
            ("a".to_string(), 2),
            ("b".to_string(), 2),
            ("c".to_string(), 1)
        ]
    );
    assert!(wc.sink.is_committed());
    assert_eq!(runtime.submissions(), 1, "one MSCR, one job");

    // The executor agrees with the reference interpreter.
    let reference = sorted(interpret_vec::<(String, u64)>(&wc.graph, wc.counts)?);
    assert_eq!(sorted(wc.sink.contents()), reference);
    Ok(())
}

#[test]
fn word_count_runs_the_same_sequentially() -> Result<()> {
    let wc = word_count(vec!["d e d", "e f"], "exec-seq-out");
    let conf = in_memory_conf().with("scoobi.concurrentjobs", "false");
    let exec = Executor::new(conf)?;
    exec.run(&wc.graph, wc.counts)?;
    assert_eq!(
        sorted(wc.sink.contents()),
        vec![
            ("d".to_string(), 2),
            ("e".to_string(), 2),
            ("f".to_string(), 1)
        ]
    );
    Ok(())
}

#[test]
fn two_layer_plan_runs_in_order() -> Result<()> {
    let wc = word_count(vec!["a b a", "b c"], "exec-two-out");
    let g = &wc.graph;
    let swapped = g.parallel_do::<(u64, String)>(
        wc.counts,
        Arc::new(MapFn::new(|(w, n): &(String, u64)| (*n, w.clone()))),
    );
    let regrouped = g.group_by_key::<u64, String>(swapped);
    let sink = MemorySink::<(u64, Vec<String>)>::new("exec-two-grouped");
    g.add_sink(regrouped, sink.clone());

    let runtime = CountingRuntime::new();
    let exec = Executor::with_runtime(in_memory_conf(), runtime.clone());
    exec.run(g, regrouped)?;

    // Strict happens-before across layers: every layer-0 job is submitted
    // before any layer-1 job.
    let names = runtime.names();
    assert_eq!(names.len(), 2);
    assert!(names[0].contains("-layer0-"), "{names:?}");
    assert!(names[1].contains("-layer1-"), "{names:?}");

    let mut out = sink.contents();
    for (_, words) in &mut out {
        words.sort();
    }
    assert_eq!(
        sorted(out),
        vec![
            (1, vec!["c".to_string()]),
            (2, vec!["a".to_string(), "b".to_string()])
        ]
    );
    Ok(())
}

#[test]
fn materialise_inside_op() -> Result<()> {
    let g = Graph::default();
    let load = g.load(Arc::new(MemorySource::new("in", vec![1i64, 2, 3])));
    let arr = g.parallel_do::<i64>(load, Arc::new(MapFn::new(|x: &i64| *x)));
    let m = g.materialise::<i64>(arr);
    let k = g.ret(10i64);
    let op = g.op(m, k, |xs: &Vec<i64>, k: &i64| {
        xs.iter().map(|x| x + k).collect::<Vec<i64>>()
    });

    let exec = Executor::new(in_memory_conf())?;
    let out = exec.evaluate_as::<Vec<i64>>(&g, op)?;
    assert_eq!(sorted(out.as_ref().clone()), vec![11, 12, 13]);
    Ok(())
}

#[test]
fn environment_is_pushed_before_dependent_jobs() -> Result<()> {
    let g = Graph::default();
    let firsts = g.load(Arc::new(MemorySource::new("firsts", vec![1u64, 2, 3])));
    let squared = g.parallel_do::<u64>(firsts, Arc::new(MapFn::new(|x: &u64| x * x)));
    let broadcast = g.materialise::<u64>(squared);

    let seconds = g.load(Arc::new(MemorySource::new("seconds", vec![100u64, 200])));
    let shifted = g.parallel_do_env::<u64>(
        seconds,
        broadcast,
        Arc::new(MapWithEnvFn::new(|x: &u64, env: &Vec<u64>| {
            x + env.iter().sum::<u64>()
        })),
    );
    let sink = MemorySink::<u64>::new("exec-env-out");
    g.add_sink(shifted, sink.clone());

    let runtime = CountingRuntime::new();
    let exec = Executor::with_runtime(in_memory_conf(), runtime.clone());
    exec.run(&g, shifted)?;

    // 1 + 4 + 9 = 14 shifts every element of the second input.
    assert_eq!(sorted(sink.contents()), vec![114, 214]);
    assert_eq!(runtime.submissions(), 2);
    Ok(())
}

#[test]
fn filled_bridges_are_skipped_on_rerun() -> Result<()> {
    let wc = word_count(vec!["a b a", "b c"], "exec-skip-out");
    let g = &wc.graph;
    let runtime = CountingRuntime::new();
    let exec = Executor::with_runtime(in_memory_conf(), runtime.clone());

    // First run materialises the counts, filling the Combine's bridge.
    let m = g.materialise::<(String, u64)>(wc.counts);
    let first = exec.evaluate_as::<Vec<(String, u64)>>(g, m)?;
    let jobs_after_first = runtime.submissions();
    assert_eq!(jobs_after_first, 1);

    // Extend the same graph below the already-computed counts and rerun: the
    // first layer is pruned, its job never resubmitted, and the new shuffle
    // reads the pre-existing bridge.
    let swapped = g.parallel_do::<(u64, String)>(
        wc.counts,
        Arc::new(MapFn::new(|(w, n): &(String, u64)| (*n, w.clone()))),
    );
    let regrouped = g.group_by_key::<u64, String>(swapped);
    let sink = MemorySink::<(u64, Vec<String>)>::new("exec-skip-grouped");
    g.add_sink(regrouped, sink.clone());

    exec.run(g, regrouped)?;
    assert_eq!(
        runtime.submissions() - jobs_after_first,
        1,
        "the rerun submits only the new shuffle's job"
    );

    let mut out = sink.contents();
    for (_, words) in &mut out {
        words.sort();
    }
    let mut expected_counts = first.as_ref().clone();
    expected_counts.sort();
    assert_eq!(
        expected_counts,
        vec![
            ("a".to_string(), 2),
            ("b".to_string(), 2),
            ("c".to_string(), 1)
        ]
    );
    assert_eq!(
        sorted(out),
        vec![
            (1, vec!["c".to_string()]),
            (2, vec!["a".to_string(), "b".to_string()])
        ]
    );
    Ok(())
}

#[test]
fn failing_job_is_captured_and_siblings_complete() -> Result<()> {
    let g = Graph::default();

    let good_load = g.load(Arc::new(MemorySource::new("good", vec![1u64, 2])));
    let good = g.parallel_do::<u64>(good_load, Arc::new(MapFn::new(|x: &u64| x + 1)));
    let good_sink = MemorySink::<u64>::new("exec-fail-good");
    g.add_sink(good, good_sink.clone());

    let bad_load = g.load(Arc::new(MemorySource::new("bad", vec![1u64])));
    let bad = g.parallel_do::<u64>(
        bad_load,
        Arc::new(MapFn::new(|_: &u64| -> u64 { panic!("exploding mapper") })),
    );
    let bad_sink = MemorySink::<u64>::new("exec-fail-bad");
    g.add_sink(bad, bad_sink.clone());

    let exec = Executor::new(in_memory_conf())?;
    let err = exec.run_all(&g, &[good, bad]).unwrap_err();
    let scoobi = err.downcast_ref::<ScoobiError>().expect("typed error");
    assert!(
        matches!(scoobi, ScoobiError::JobFailure { .. }),
        "{scoobi:?}"
    );

    // The sibling MSCR of the same layer ran to completion.
    assert_eq!(sorted(good_sink.contents()), vec![2, 3]);
    assert!(bad_sink.contents().is_empty());
    Ok(())
}

#[test]
fn cancellation_is_its_own_error_kind() -> Result<()> {
    let wc = word_count(vec!["a b"], "exec-cancel-out");
    let exec = Executor::new(in_memory_conf())?;
    exec.cancellation_token().cancel();

    let err = exec.run(&wc.graph, wc.counts).unwrap_err();
    let scoobi = err.downcast_ref::<ScoobiError>().expect("typed error");
    assert!(scoobi.is_cancelled(), "{scoobi:?}");
    assert!(wc.sink.contents().is_empty());
    Ok(())
}

#[test]
fn reducer_count_follows_the_byte_heuristic() -> Result<()> {
    let g = Graph::default();
    let data: Vec<u64> = (0..100).collect();
    let load = g.load(Arc::new(MemorySource::new("nums", data)));
    let keyed = g.parallel_do::<(u64, u64)>(
        load,
        Arc::new(MapFn::new(|x: &u64| (x % 7, *x))),
    );
    let grouped = g.group_by_key::<u64, u64>(keyed);
    let counts = g.combine::<u64, u64>(grouped, Arc::new(|a, b| a + b));
    let sink = MemorySink::<(u64, u64)>::new("exec-reducers-out");
    g.add_sink(counts, sink.clone());

    // 100 elements x 8 bytes = 800 input bytes; 100 bytes per reducer gives
    // ceil(800 / 100) = 8, clamped into [2, 16].
    let conf = in_memory_conf()
        .with("scoobi.reducers.min", "2")
        .with("scoobi.reducers.max", "16")
        .with("scoobi.reducers.bytesperreducer", "100");
    let runtime = CountingRuntime::new();
    let exec = Executor::with_runtime(conf, runtime.clone());
    exec.run(&g, counts)?;

    assert_eq!(runtime.reducers(), vec![8]);
    // Sharding across reducers must not change the result.
    let reference = sorted(interpret_vec::<(u64, u64)>(&g, counts)?);
    assert_eq!(sorted(sink.contents()), reference);
    Ok(())
}

#[test]
fn group_without_combine_keeps_whole_groups() -> Result<()> {
    use scoobi::dofn::FilterFn;

    let g = Graph::default();
    let load = g.load(Arc::new(MemorySource::new(
        "pairs",
        vec![
            ("x".to_string(), 1u64),
            ("y".to_string(), 2),
            ("x".to_string(), 3),
            ("dropped".to_string(), 0),
        ],
    )));
    let kept = g.parallel_do::<(String, u64)>(
        load,
        Arc::new(FilterFn::new(|(_, v): &(String, u64)| *v > 0)),
    );
    let grouped = g.group_by_key::<String, u64>(kept);
    let sink = MemorySink::<(String, Vec<u64>)>::new("exec-groups-out");
    g.add_sink(grouped, sink.clone());

    let exec = Executor::new(in_memory_conf())?;
    exec.run(&g, grouped)?;

    let mut out = sink.contents();
    for (_, vs) in &mut out {
        vs.sort();
    }
    assert_eq!(
        sorted(out),
        vec![("x".to_string(), vec![1, 3]), ("y".to_string(), vec![2])]
    );
    Ok(())
}
