use std::collections::HashSet;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use rill_subtask_types::graph::ChunkGraph;
use rill_subtask_types::operand::{ChunkKernel, ChunkKey, OpKey, Operand, OperandKind};
use rill_subtask_types::store::{DataStore, OperandContext};
use rill_subtask_types::subtask::Subtask;

use crate::size_estimator::{estimate_sizes, InputSizes};
use crate::test_utils::{compute_chunk, fetch_chunk, test_subtask, FixedSizeKernel};

/// Estimates each output as the sum of its input sizes, the way real kernels
/// derive output extents from their operands.
#[derive(Debug)]
struct PropagatingKernel;

impl ChunkKernel for PropagatingKernel {
    fn estimate_size(&self, ctx: &mut rill_subtask_types::operand::SizeContext, op: &Operand) {
        let (store_size, memory_size) = op.inputs.iter().fold((0, 0), |acc, input| {
            let (store, memory) = ctx.get(input).copied().unwrap_or((0, 0));
            (acc.0 + store, acc.1 + memory)
        });
        for out in &op.outputs {
            ctx.insert(out.clone(), (store_size, memory_size));
        }
    }

    fn execute(
        &self,
        _store: &mut DataStore,
        _ctx: &OperandContext,
        _op: &Operand,
    ) -> Result<(), rill_subtask_types::errors::ComputeError> {
        Ok(())
    }
}

fn input_sizes(entries: &[(&str, u64, u64)]) -> InputSizes {
    entries
        .iter()
        .map(|(key, store, memory)| (ChunkKey::from(*key), (*store, *memory)))
        .collect()
}

fn fetch_then_compute(store_size: u64, memory_size: u64) -> Subtask {
    let mut graph = ChunkGraph::new();
    let a = graph.add_chunk(fetch_chunk("a"));
    let b = graph.add_chunk(compute_chunk(
        "b",
        "op-b",
        &["a"],
        true,
        Arc::new(FixedSizeKernel::new(store_size, memory_size)),
    ));
    graph.add_dependency(a, b);
    graph.mark_result(b);
    test_subtask("subtask-1", graph)
}

#[test]
fn fetch_then_compute_accounting() {
    let subtask = fetch_then_compute(150, 250);
    let sizes = input_sizes(&[("a", 100, 200)]);

    let (final_store_size, peak) = estimate_sizes(&subtask, &sizes).unwrap();

    // Input (200) and calculation (250) are both live at the peak; the final
    // footprint is the stored result.
    assert_eq!(peak, 450);
    assert_eq!(final_store_size, 150);
}

#[test]
fn diamond_releases_inputs_after_last_consumer() {
    let mut graph = ChunkGraph::new();
    let a = graph.add_chunk(fetch_chunk("a"));
    let b = graph.add_chunk(compute_chunk(
        "b",
        "op-b",
        &["a"],
        true,
        Arc::new(FixedSizeKernel::new(10, 40)),
    ));
    let c = graph.add_chunk(compute_chunk(
        "c",
        "op-c",
        &["a"],
        true,
        Arc::new(FixedSizeKernel::new(20, 60)),
    ));
    let d = graph.add_chunk(compute_chunk(
        "d",
        "op-d",
        &["b", "c"],
        true,
        Arc::new(FixedSizeKernel::new(30, 50)),
    ));
    graph.add_dependency(a, b);
    graph.add_dependency(a, c);
    graph.add_dependency(b, d);
    graph.add_dependency(c, d);
    graph.mark_result(d);
    let subtask = test_subtask("subtask-1", graph);

    let (final_store_size, peak) =
        estimate_sizes(&subtask, &input_sizes(&[("a", 100, 100)])).unwrap();

    // The fetched input stays accounted until both of its consumers ran.
    assert_eq!(peak, 160);
    assert_eq!(final_store_size, 30);
}

#[test]
fn pure_depend_keys_are_excluded() {
    let mut graph = ChunkGraph::new();
    let a = graph.add_chunk(fetch_chunk("a"));
    let pure = graph.add_chunk(fetch_chunk("pure"));
    let b = graph.add_chunk(compute_chunk(
        "b",
        "op-b",
        &["a"],
        true,
        Arc::new(FixedSizeKernel::new(5, 5)),
    ));
    graph.add_dependency(a, b);
    graph.add_dependency(pure, b);
    graph.mark_result(b);
    let mut subtask = test_subtask("subtask-1", graph);
    subtask.pure_depend_keys = HashSet::from([ChunkKey::from("pure")]);

    let (final_store_size, peak) =
        estimate_sizes(&subtask, &input_sizes(&[("a", 10, 10)])).unwrap();

    assert_eq!(peak, 15);
    assert_eq!(final_store_size, 5);
}

#[test]
fn doubling_input_memory_at_least_doubles_peak() {
    let build = || {
        let mut graph = ChunkGraph::new();
        let a = graph.add_chunk(fetch_chunk("a"));
        let b =
            graph.add_chunk(compute_chunk("b", "op-b", &["a"], true, Arc::new(PropagatingKernel)));
        graph.add_dependency(a, b);
        graph.mark_result(b);
        test_subtask("subtask-1", graph)
    };

    let (_, peak) = estimate_sizes(&build(), &input_sizes(&[("a", 100, 200)])).unwrap();
    let (_, doubled_peak) =
        estimate_sizes(&build(), &input_sizes(&[("a", 100, 400)])).unwrap();

    assert!(doubled_peak >= 2 * peak, "peak {doubled_peak} must be at least twice {peak}");
}

#[test]
fn shared_chunk_key_is_released_once() {
    // A fetch op and a compute op produce the same logical chunk key; the
    // footprint entry must only be popped when the last producer drains.
    let mut graph = ChunkGraph::new();
    let fetched = graph.add_chunk(fetch_chunk("x"));
    let produced = graph.add_chunk(compute_chunk(
        "x",
        "op-g",
        &[],
        true,
        Arc::new(FixedSizeKernel::new(50, 80)),
    ));
    let consumer = graph.add_chunk(compute_chunk(
        "c",
        "op-c",
        &["x"],
        true,
        Arc::new(FixedSizeKernel::new(10, 10)),
    ));
    graph.add_dependency(fetched, consumer);
    graph.add_dependency(produced, consumer);
    graph.mark_result(consumer);
    let subtask = test_subtask("subtask-1", graph);

    let (final_store_size, peak) =
        estimate_sizes(&subtask, &input_sizes(&[("x", 50, 80)])).unwrap();

    assert_eq!(peak, 140);
    assert_eq!(final_store_size, 10);
}

#[test]
fn empty_graph_estimates_zero() {
    let subtask = test_subtask("subtask-1", ChunkGraph::new());
    let (final_store_size, peak) = estimate_sizes(&subtask, &InputSizes::new()).unwrap();
    assert_eq!((final_store_size, peak), (0, 0));
}

#[test]
fn gpu_flag_does_not_change_accounting() {
    // Same shape as the basic case, but with a gpu fetch: accounting is
    // placement-agnostic.
    let mut graph = ChunkGraph::new();
    let op = Arc::new(Operand {
        key: OpKey::from("fetch-a"),
        gpu: true,
        inputs: vec![],
        outputs: vec![ChunkKey::from("a")],
        kind: OperandKind::Fetch,
    });
    let a = graph.add_chunk(rill_subtask_types::graph::Chunk::new("a", op));
    let b = graph.add_chunk(compute_chunk(
        "b",
        "op-b",
        &["a"],
        true,
        Arc::new(FixedSizeKernel::new(150, 250)),
    ));
    graph.add_dependency(a, b);
    graph.mark_result(b);
    let subtask = test_subtask("subtask-1", graph);

    let (final_store_size, peak) =
        estimate_sizes(&subtask, &input_sizes(&[("a", 100, 200)])).unwrap();
    assert_eq!((final_store_size, peak), (150, 450));
}
