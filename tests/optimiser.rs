mod common;

use anyhow::Result;
use common::{sorted, word_count};
use scoobi::dofn::{FlatMapFn, MapFn};
use scoobi::graph::Graph;
use scoobi::io::MemorySource;
use scoobi::node::Node;
use scoobi::optimiser::optimised;
use scoobi::testing::interpret_vec;
use scoobi::{Executor, ScoobiConf};
use std::collections::HashMap;
use std::sync::Arc;

fn kinds(g: &Graph) -> HashMap<&'static str, usize> {
    let mut m = HashMap::new();
    for id in g.node_ids() {
        *m.entry(g.node(id).kind()).or_insert(0) += 1;
    }
    m
}

fn in_memory() -> Result<Executor> {
    Executor::new(ScoobiConf::new().with("scoobi.mode", "InMemory"))
}

#[test]
fn nested_flattens_are_spliced() -> Result<()> {
    let g = Graph::default();
    let a = g.load(Arc::new(MemorySource::new("a", vec![1u64])));
    let b = g.load(Arc::new(MemorySource::new("b", vec![2u64])));
    let c = g.load(Arc::new(MemorySource::new("c", vec![3u64])));
    let inner = g.flatten(vec![b, c]);
    let outer = g.flatten(vec![a, inner]);
    let m = g.materialise::<u64>(outer);

    let (opt, roots) = optimised(&g, &[m])?;
    let flattens: Vec<_> = opt
        .node_ids()
        .into_iter()
        .filter(|id| matches!(opt.node(*id), Node::Flatten { .. }))
        .collect();
    assert_eq!(flattens.len(), 1);
    let Node::Flatten { inputs } = opt.node(flattens[0]) else {
        unreachable!();
    };
    assert_eq!(inputs.len(), 3);
    assert_eq!(roots.len(), 1);
    Ok(())
}

#[test]
fn singleton_flatten_collapses() -> Result<()> {
    let g = Graph::default();
    let a = g.load(Arc::new(MemorySource::new("a", vec![1u64, 2])));
    let f = g.flatten(vec![a]);
    let m = g.materialise::<u64>(f);

    let (opt, _) = optimised(&g, &[m])?;
    assert_eq!(kinds(&opt).get("Flatten"), None);
    Ok(())
}

#[test]
fn adjacent_parallel_dos_fuse() -> Result<()> {
    let g = Graph::default();
    let load = g.load(Arc::new(MemorySource::new("in", vec![1u64, 2, 3])));
    let p1 = g.parallel_do::<u64>(load, Arc::new(MapFn::new(|x: &u64| x + 1)));
    let p2 = g.parallel_do::<u64>(p1, Arc::new(MapFn::new(|x: &u64| x * 2)));
    let m = g.materialise::<u64>(p2);

    let (opt, _) = optimised(&g, &[m])?;
    assert_eq!(kinds(&opt)["ParallelDo"], 1);

    // The fused function still runs g(f(x)) for each input.
    let exec = in_memory()?;
    let out = exec.evaluate_as::<Vec<u64>>(&g, m)?;
    assert_eq!(sorted(out.as_ref().clone()), vec![4, 6, 8]);
    Ok(())
}

#[test]
fn fusion_respects_barriers_and_sharing() -> Result<()> {
    let g = Graph::default();
    let load = g.load(Arc::new(MemorySource::new("in", vec![1u64])));
    let env = g.ret(());
    let barred = g.parallel_do_full::<u64>(
        load,
        env,
        Arc::new(MapFn::new(|x: &u64| x + 1)),
        true,
        false,
    );
    let after = g.parallel_do::<u64>(barred, Arc::new(MapFn::new(|x: &u64| x * 2)));
    let m1 = g.materialise::<u64>(after);

    let shared = g.parallel_do::<u64>(load, Arc::new(MapFn::new(|x: &u64| x + 10)));
    let c1 = g.parallel_do::<u64>(shared, Arc::new(MapFn::new(|x: &u64| x + 100)));
    let c2 = g.parallel_do::<u64>(shared, Arc::new(MapFn::new(|x: &u64| x + 200)));
    let m2 = g.materialise::<u64>(c1);
    let m3 = g.materialise::<u64>(c2);

    let (opt, _) = optimised(&g, &[m1, m2, m3])?;
    // The group barrier blocks one fusion; the shared mapper blocks the
    // other two (it has two uses).
    assert_eq!(kinds(&opt)["ParallelDo"], 5);
    Ok(())
}

#[test]
fn fuse_barrier_does_not_block_single_use_fusion() -> Result<()> {
    let g = Graph::default();
    let load = g.load(Arc::new(MemorySource::new("in", vec![1u64, 2, 3])));
    let env = g.ret(());
    // A fuse barrier forbids duplication into branches; fusing a single-use
    // mapper duplicates nothing, so the pair still collapses.
    let no_replay = g.parallel_do_full::<u64>(
        load,
        env,
        Arc::new(MapFn::new(|x: &u64| x + 1)),
        false,
        true,
    );
    let after = g.parallel_do::<u64>(no_replay, Arc::new(MapFn::new(|x: &u64| x * 2)));
    let m = g.materialise::<u64>(after);

    let (opt, _) = optimised(&g, &[m])?;
    assert_eq!(kinds(&opt)["ParallelDo"], 1);

    let exec = in_memory()?;
    let out = exec.evaluate_as::<Vec<u64>>(&g, m)?;
    assert_eq!(sorted(out.as_ref().clone()), vec![4, 6, 8]);
    Ok(())
}

#[test]
fn parallel_do_sinks_into_flatten_branches() -> Result<()> {
    let g = Graph::default();
    let a = g.load(Arc::new(MemorySource::new("a", vec![1u64, 2])));
    let b = g.load(Arc::new(MemorySource::new("b", vec![3u64])));
    let f = g.flatten(vec![a, b]);
    let p = g.parallel_do::<u64>(f, Arc::new(MapFn::new(|x: &u64| x * 2)));
    let m = g.materialise::<u64>(p);

    let (opt, _) = optimised(&g, &[m])?;
    // The ParallelDo's id now names a flatten over one copy per branch.
    let Node::Flatten { inputs } = opt.node(p) else {
        panic!("expected the sunk ParallelDo to become a Flatten");
    };
    assert_eq!(inputs.len(), 2);
    for branch in inputs {
        assert!(matches!(opt.node(branch), Node::ParallelDo { .. }));
    }

    let exec = in_memory()?;
    let out = exec.evaluate_as::<Vec<u64>>(&g, m)?;
    assert_eq!(sorted(out.as_ref().clone()), vec![2, 4, 6]);
    Ok(())
}

#[test]
fn combine_off_a_shuffle_is_lowered() -> Result<()> {
    let g = Graph::default();
    let load = g.load(Arc::new(MemorySource::new(
        "in",
        vec![("a".to_string(), vec![1u64, 2, 3]), ("b".to_string(), vec![4u64])],
    )));
    let c = g.combine::<String, u64>(load, Arc::new(|a, b| a + b));
    let m = g.materialise::<(String, u64)>(c);

    let (opt, _) = optimised(&g, &[m])?;
    assert_eq!(kinds(&opt).get("Combine"), None);
    assert_eq!(kinds(&opt)["ParallelDo"], 1);

    let exec = in_memory()?;
    let out = exec.evaluate_as::<Vec<(String, u64)>>(&g, m)?;
    assert_eq!(
        sorted(out.as_ref().clone()),
        vec![("a".to_string(), 6), ("b".to_string(), 4)]
    );
    Ok(())
}

#[test]
fn shuffles_get_identity_mappers() -> Result<()> {
    let g = Graph::default();
    let load = g.load(Arc::new(MemorySource::new(
        "in",
        vec![("a".to_string(), 1u64), ("a".to_string(), 2)],
    )));
    let gbk = g.group_by_key::<String, u64>(load);
    let m = g.materialise::<(String, Vec<u64>)>(gbk);

    let (opt, _) = optimised(&g, &[m])?;
    let Node::GroupByKey { input, .. } = opt.node(gbk) else {
        panic!("shuffle disappeared");
    };
    assert!(matches!(opt.node(input), Node::ParallelDo { .. }));
    Ok(())
}

#[test]
fn optimisation_is_idempotent() -> Result<()> {
    let wc = word_count(vec!["a b a", "b c"], "idem-out");
    let m = wc.graph.materialise::<(String, u64)>(wc.counts);

    let (once, roots1) = optimised(&wc.graph, &[m])?;
    let (twice, _) = optimised(&once, &roots1)?;
    assert_eq!(kinds(&once), kinds(&twice));
    Ok(())
}

#[test]
fn optimisation_preserves_interpreter_semantics() -> Result<()> {
    let g = Graph::default();
    let a = g.load(Arc::new(MemorySource::new("a", vec!["x y".to_string()])));
    let b = g.load(Arc::new(MemorySource::new("b", vec!["y z".to_string()])));
    let f = g.flatten(vec![a, b]);
    let words = g.parallel_do::<String>(
        f,
        Arc::new(FlatMapFn::new(|s: &String| {
            s.split_whitespace().map(String::from).collect::<Vec<String>>()
        })),
    );
    let pairs = g.parallel_do::<(String, u64)>(
        words,
        Arc::new(MapFn::new(|w: &String| (w.clone(), 1u64))),
    );
    let gbk = g.group_by_key::<String, u64>(pairs);
    let counts = g.combine::<String, u64>(gbk, Arc::new(|x, y| x + y));

    let reference = sorted(interpret_vec::<(String, u64)>(&g, counts)?);

    let (opt, roots) = optimised(&g, &[counts])?;
    let optimised_out = sorted(interpret_vec::<(String, u64)>(&opt, roots[0])?);
    assert_eq!(reference, optimised_out);
    Ok(())
}
