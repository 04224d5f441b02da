mod common;

use anyhow::Result;
use common::word_count;
use scoobi::dofn::MapFn;
use scoobi::graph::Graph;
use scoobi::io::{MemorySink, MemorySource};
use scoobi::mscr::{plan, MscrInput, OutputChannel};
use scoobi::ids::MscrId;
use std::collections::HashSet;
use std::sync::Arc;

#[test]
fn word_count_is_one_mscr_in_one_layer() -> Result<()> {
    let wc = word_count(vec!["a b a", "b c"], "plan-wc-out");
    let p = plan(&wc.graph, &[wc.counts])?;

    assert_eq!(p.layers.len(), 1);
    assert_eq!(p.layers[0].mscrs.len(), 1);

    let mscr = &p.layers[0].mscrs[0];
    assert_eq!(mscr.channels.len(), 1);
    let OutputChannel::Shuffle { combine, .. } = &mscr.channels[0] else {
        panic!("expected a shuffle channel");
    };
    assert!(combine.is_some(), "the Combine becomes the reducer");
    Ok(())
}

#[test]
fn chained_shuffles_make_two_layers() -> Result<()> {
    let wc = word_count(vec!["a b a", "b c"], "plan-two-out");
    let g = &wc.graph;
    let swapped = g.parallel_do::<(u64, String)>(
        wc.counts,
        Arc::new(MapFn::new(|(w, n): &(String, u64)| (*n, w.clone()))),
    );
    let regrouped = g.group_by_key::<u64, String>(swapped);
    let sink = MemorySink::<(u64, Vec<String>)>::new("plan-two-grouped");
    g.add_sink(regrouped, sink);

    let p = plan(g, &[regrouped])?;
    assert_eq!(p.layers.len(), 2);
    assert_eq!(p.layers[0].mscrs.len(), 1);
    assert_eq!(p.layers[1].mscrs.len(), 1);

    // The second layer's mapper reads the first layer's output bridge.
    let second = &p.layers[1].mscrs[0];
    assert!(second
        .mappers
        .iter()
        .any(|m| matches!(m.input, MscrInput::Bridge(_))));
    Ok(())
}

#[test]
fn layers_partition_the_mscrs() -> Result<()> {
    let wc = word_count(vec!["a b", "c"], "plan-part-out");
    let g = &wc.graph;
    // An independent second pipeline in the same graph.
    let other = g.load(Arc::new(MemorySource::new(
        "pairs",
        vec![(1u64, 2u64), (1, 3)],
    )));
    let grouped = g.group_by_key::<u64, u64>(other);
    let sink = MemorySink::<(u64, Vec<u64>)>::new("plan-part-grouped");
    g.add_sink(grouped, sink);

    let p = plan(g, &[wc.counts, grouped])?;

    let mut seen: HashSet<MscrId> = HashSet::new();
    let mut total = 0;
    for layer in &p.layers {
        for mscr in &layer.mscrs {
            assert!(seen.insert(mscr.id), "MSCR appears in two layers");
            total += 1;
        }
    }
    assert_eq!(total, 2);
    // Independent shuffles share a layer.
    assert_eq!(p.layers.len(), 1);
    Ok(())
}

#[test]
fn shared_mapper_ancestry_co_groups_shuffles() -> Result<()> {
    let g = Graph::default();
    let load = g.load(Arc::new(MemorySource::new(
        "in",
        vec![("a".to_string(), 1u64), ("b".to_string(), 2)],
    )));
    let mapper = g.parallel_do::<(String, u64)>(
        load,
        Arc::new(MapFn::new(|(k, v): &(String, u64)| (k.clone(), v * 10))),
    );
    let gbk1 = g.group_by_key::<String, u64>(mapper);
    let gbk2 = g.group_by_key::<String, u64>(mapper);
    g.add_sink(gbk1, MemorySink::<(String, Vec<u64>)>::new("co-group-1"));
    g.add_sink(gbk2, MemorySink::<(String, Vec<u64>)>::new("co-group-2"));

    let p = plan(&g, &[gbk1, gbk2])?;
    assert_eq!(p.layers.len(), 1);
    assert_eq!(p.layers[0].mscrs.len(), 1, "both shuffles share the mapper");
    assert_eq!(p.layers[0].mscrs[0].channels.len(), 2);
    Ok(())
}

#[test]
fn orphan_mapper_chain_is_a_singleton_mscr() -> Result<()> {
    let g = Graph::default();
    let load = g.load(Arc::new(MemorySource::new("in", vec![1u64, 2, 3])));
    let p1 = g.parallel_do::<u64>(load, Arc::new(MapFn::new(|x: &u64| x + 1)));
    let p2 = g.parallel_do::<u64>(p1, Arc::new(MapFn::new(|x: &u64| x * 2)));
    g.add_sink(p2, MemorySink::<u64>::new("orphan-out"));

    let p = plan(&g, &[p2])?;
    assert_eq!(p.layers.len(), 1);
    assert_eq!(p.layers[0].mscrs.len(), 1);
    let mscr = &p.layers[0].mscrs[0];
    assert!(mscr.channels.is_empty(), "map-only job has no shuffle");
    assert_eq!(mscr.mappers.len(), 1, "the chain fuses into one mapper");
    Ok(())
}

#[test]
fn environment_dependencies_order_layers() -> Result<()> {
    let g = Graph::default();
    let first = g.load(Arc::new(MemorySource::new("first", vec![1u64, 2, 3])));
    let summed = g.parallel_do::<u64>(first, Arc::new(MapFn::new(|x: &u64| x * x)));
    let broadcast = g.materialise::<u64>(summed);

    let second = g.load(Arc::new(MemorySource::new("second", vec![10u64, 20])));
    let shifted = g.parallel_do_env::<u64>(
        second,
        broadcast,
        Arc::new(scoobi::dofn::MapWithEnvFn::new(|x: &u64, env: &Vec<u64>| {
            x + env.iter().sum::<u64>()
        })),
    );
    g.add_sink(shifted, MemorySink::<u64>::new("env-dep-out"));

    let p = plan(&g, &[shifted])?;
    assert_eq!(p.layers.len(), 2, "the broadcast is produced a layer early");
    Ok(())
}
