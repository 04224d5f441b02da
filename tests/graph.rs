mod common;

use anyhow::Result;
use common::word_count;
use scoobi::attributes::Attributes;
use scoobi::dofn::MapFn;
use scoobi::graph::Graph;
use scoobi::io::{MemorySink, MemorySource};
use scoobi::node::Shape;
use std::collections::HashSet;
use std::sync::Arc;

#[test]
fn ids_are_unique_within_a_graph() {
    let wc = word_count(vec!["a b", "c"], "ids-out");
    let ids = wc.graph.node_ids();
    let distinct: HashSet<u64> = ids.iter().map(|id| id.raw()).collect();
    assert_eq!(distinct.len(), ids.len());
}

#[test]
fn deep_copy_shares_the_id_counter() {
    let g = Graph::default();
    let load = g.load(Arc::new(MemorySource::new("in", vec![1u64, 2])));
    let copy = g.deep_copy();
    let in_copy = copy.parallel_do::<u64>(load, Arc::new(MapFn::new(|x: &u64| x + 1)));
    let in_original = g.parallel_do::<u64>(load, Arc::new(MapFn::new(|x: &u64| x + 2)));
    assert_ne!(in_copy, in_original);
}

#[test]
fn shapes_follow_the_variant_table() {
    let wc = word_count(vec!["a"], "shapes-out");
    assert_eq!(wc.graph.shape(wc.load), Shape::Arr);
    assert_eq!(wc.graph.shape(wc.counts), Shape::Arr);
    let m = wc.graph.materialise::<(String, u64)>(wc.counts);
    assert_eq!(wc.graph.shape(m), Shape::Exp);
    let k = wc.graph.ret(3u64);
    assert_eq!(wc.graph.shape(k), Shape::Exp);
}

#[test]
fn validation_accepts_a_well_formed_graph() -> Result<()> {
    let wc = word_count(vec!["a b a"], "valid-out");
    wc.graph.validate()
}

#[test]
fn validation_rejects_a_doubly_written_output() {
    let g = Graph::default();
    let load = g.load(Arc::new(MemorySource::new("in", vec![1u64, 2])));
    let a = g.parallel_do::<u64>(load, Arc::new(MapFn::new(|x: &u64| x + 1)));
    let b = g.parallel_do::<u64>(load, Arc::new(MapFn::new(|x: &u64| x * 2)));
    g.add_sink(a, MemorySink::<u64>::new("same-output"));
    g.add_sink(b, MemorySink::<u64>::new("same-output"));
    let err = g.validate().unwrap_err();
    assert!(err.to_string().contains("written twice"), "{err}");
}

#[test]
#[should_panic(expected = "GroupByKey input element type mismatch")]
fn group_by_key_rejects_non_pair_input() {
    let g = Graph::default();
    let load = g.load(Arc::new(MemorySource::new("in", vec![1u64, 2])));
    g.group_by_key::<String, u64>(load);
}

#[test]
#[should_panic(expected = "sinks attach to process nodes")]
fn sinks_do_not_attach_to_loads() {
    let g = Graph::default();
    let load = g.load(Arc::new(MemorySource::new("in", vec![1u64])));
    g.add_sink(load, MemorySink::<u64>::new("load-out"));
}

#[test]
fn parents_and_uses_attributes() {
    let g = Graph::default();
    let load = g.load(Arc::new(MemorySource::new("in", vec![1u64, 2])));
    let a = g.parallel_do::<u64>(load, Arc::new(MapFn::new(|x: &u64| x + 1)));
    let b = g.parallel_do::<u64>(load, Arc::new(MapFn::new(|x: &u64| x * 2)));

    let attrs = Attributes::new();
    assert_eq!(attrs.uses(&g, load), 2);
    assert_eq!(attrs.parents(&g, load), common::sorted(vec![a, b]));
    assert!(attrs.is_process_node(&g, a));
    assert!(!attrs.is_process_node(&g, load));

    g.add_sink(a, MemorySink::<u64>::new("attr-sink"));
    assert_eq!(attrs.reachable_outputs(&g, load), vec![a]);
}

#[test]
fn environment_uses_attribute() {
    let g = Graph::default();
    let load = g.load(Arc::new(MemorySource::new("in", vec![1u64])));
    let env = g.ret(10u64);
    let p = g.parallel_do_env::<u64>(
        load,
        env,
        Arc::new(scoobi::dofn::MapWithEnvFn::new(|x: &u64, k: &u64| x + k)),
    );
    let attrs = Attributes::new();
    assert_eq!(attrs.uses_as_environment(&g, env), vec![p]);
    assert_eq!(attrs.reachable_inputs(&g, p), vec![load]);
}
