use std::collections::HashMap;
use std::sync::Arc;

use rill_subtask_types::graph::{DirectedGraph, GraphCycleError};
use rill_subtask_types::operand::{ChunkKey, OpKey, Operand, OperandKind, SizeContext};
use rill_subtask_types::subtask::Subtask;

/// Input sizes per independent fetch chunk: `(store_size, memory_cost)`.
pub type InputSizes = HashMap<ChunkKey, (u64, u64)>;

fn to_signed(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn output_cost(size_context: &SizeContext, key: &ChunkKey, use_store_size: bool) -> i64 {
    let (store_size, memory_size) = size_context.get(key).copied().unwrap_or((0, 0));
    to_signed(if use_store_size { store_size } else { memory_size })
}

/// Predicts `(final_store_size, peak_memory_cost)` of running the subtask's
/// chunk graph, given the sizes of its fetched inputs.
///
/// The chunk DAG is condensed into an operand-key DAG (several chunks may
/// share one operand) and walked in topological order with a LIFO ready
/// stack. A running total tracks live memory: an operand's outputs are
/// accounted at their calculated memory size while executing, then re-based
/// to their store size once materialized; a predecessor's footprint is
/// released when its last successor completes. The peak of the running total
/// is a consistent upper bound used for quota provisioning, not an exact
/// oracle.
///
/// Pure function over its inputs; safe to run on a worker thread.
pub fn estimate_sizes(
    subtask: &Subtask,
    input_sizes: &InputSizes,
) -> Result<(u64, u64), GraphCycleError> {
    let graph = &subtask.chunk_graph;
    let mut size_context: SizeContext = input_sizes.clone();

    // One representative operand per op key, and the number of chunks sharing
    // each chunk key. Two distinct operands may produce the same chunk key;
    // its footprint is popped only when the last of them releases.
    let mut key_to_op: HashMap<OpKey, Arc<Operand>> = HashMap::new();
    let mut chunk_key_refs: HashMap<ChunkKey, usize> = HashMap::new();
    for chunk in graph.chunks() {
        key_to_op.entry(chunk.op.key.clone()).or_insert_with(|| chunk.op.clone());
        *chunk_key_refs.entry(chunk.key.clone()).or_insert(0) += 1;
    }

    // Condense the chunk DAG into the op-key DAG.
    let mut op_graph: DirectedGraph<OpKey> = DirectedGraph::new();
    for index in graph.topological_order()? {
        let chunk = graph.chunk(index);
        if subtask.pure_depend_keys.contains(&chunk.key) {
            continue;
        }
        op_graph.add_node(chunk.op.key.clone());
        for succ_index in graph.successors(index) {
            let succ = graph.chunk(*succ_index);
            if succ.op.key != chunk.op.key {
                op_graph.add_edge(chunk.op.key.clone(), succ.op.key.clone());
            }
        }
    }

    let mut key_stack: Vec<OpKey> = op_graph.iter_indep().cloned().collect();
    let mut pred_ref_count: HashMap<OpKey, usize> =
        op_graph.iter().map(|key| (key.clone(), op_graph.count_predecessors(key))).collect();
    let mut succ_ref_count: HashMap<OpKey, usize> =
        op_graph.iter().map(|key| (key.clone(), op_graph.count_successors(key))).collect();

    let mut total_memory_cost: i64 = 0;
    let mut max_memory_cost: i64 =
        size_context.values().map(|(_, memory_size)| to_signed(*memory_size)).sum();

    while let Some(key) = key_stack.pop() {
        let op = key_to_op
            .get(&key)
            .expect("every op-graph key originates from a graph chunk")
            .clone();

        if !op.is_fetch() {
            if let OperandKind::Compute(compute) = &op.kind {
                compute.kernel.estimate_size(&mut size_context, &op);
            }
        }

        let calc_cost: i64 =
            op.outputs.iter().map(|out| output_cost(&size_context, out, false)).sum();
        total_memory_cost += calc_cost;
        max_memory_cost = max_memory_cost.max(total_memory_cost);

        if !op.is_fetch() {
            // Once the calculation is materialized into storage, its memory
            // footprint is replaced by the result footprint.
            let result_cost: i64 =
                op.outputs.iter().map(|out| output_cost(&size_context, out, true)).sum();
            total_memory_cost += result_cost - calc_cost;
        }

        for succ_key in op_graph.successors(&key) {
            let remaining = pred_ref_count
                .get_mut(succ_key)
                .expect("successor of a known op must be a known op");
            *remaining -= 1;
            if *remaining == 0 {
                key_stack.push(succ_key.clone());
            }
        }

        for pred_key in op_graph.predecessors(&key) {
            let remaining = succ_ref_count
                .get_mut(pred_key)
                .expect("predecessor of a known op must be a known op");
            *remaining -= 1;
            if *remaining > 0 {
                continue;
            }
            // The predecessor's outputs are dead: release their footprint.
            // Fetch outputs are accounted at memory size, compute outputs at
            // store size.
            let pred_op =
                key_to_op.get(pred_key).expect("every op-graph key originates from a graph chunk");
            let release_store_size = !pred_op.is_fetch();
            let mut released: i64 = 0;
            for out in pred_op.outputs.clone() {
                let refs = chunk_key_refs.entry(out.clone()).or_insert(0);
                *refs = refs.saturating_sub(1);
                released += output_cost(&size_context, &out, release_store_size);
                if *refs == 0 {
                    size_context.remove(&out);
                }
            }
            total_memory_cost -= released;
        }
    }

    let final_store_size: u64 = size_context.values().map(|(store_size, _)| *store_size).sum();
    Ok((final_store_size, u64::try_from(max_memory_cost).unwrap_or(0)))
}
