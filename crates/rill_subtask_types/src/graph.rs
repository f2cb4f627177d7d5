use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Arc;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::operand::{ChunkKey, Operand};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("graph contains a cycle; {remaining} nodes could not be ordered")]
pub struct GraphCycleError {
    pub remaining: usize,
}

/// A directed graph over unique node keys, preserving insertion order.
///
/// Used both for the chunk graph (over node indices, so that duplicate chunk
/// keys produced by distinct operands stay distinct nodes) and for the memory
/// estimator's condensed operand-key graph.
#[derive(Clone, Debug)]
pub struct DirectedGraph<K: Eq + Hash + Clone> {
    nodes: IndexSet<K>,
    successors: HashMap<K, Vec<K>>,
    predecessors: HashMap<K, Vec<K>>,
}

impl<K: Eq + Hash + Clone> Default for DirectedGraph<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> DirectedGraph<K> {
    pub fn new() -> Self {
        Self { nodes: IndexSet::new(), successors: HashMap::new(), predecessors: HashMap::new() }
    }

    pub fn add_node(&mut self, key: K) {
        self.nodes.insert(key);
    }

    pub fn contains(&self, key: &K) -> bool {
        self.nodes.contains(key)
    }

    /// Adds an edge, inserting missing endpoints. Parallel edges are collapsed.
    pub fn add_edge(&mut self, from: K, to: K) {
        self.add_node(from.clone());
        self.add_node(to.clone());
        let succs = self.successors.entry(from.clone()).or_default();
        if succs.contains(&to) {
            return;
        }
        succs.push(to.clone());
        self.predecessors.entry(to).or_default().push(from);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &K> {
        self.nodes.iter()
    }

    /// Nodes without predecessors, in insertion order.
    pub fn iter_indep(&self) -> impl Iterator<Item = &K> {
        self.nodes.iter().filter(|key| self.count_predecessors(key) == 0)
    }

    pub fn successors(&self, key: &K) -> &[K] {
        self.successors.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn predecessors(&self, key: &K) -> &[K] {
        self.predecessors.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn count_successors(&self, key: &K) -> usize {
        self.successors(key).len()
    }

    pub fn count_predecessors(&self, key: &K) -> usize {
        self.predecessors(key).len()
    }

    /// Kahn's algorithm over the insertion order; fails on cyclic input.
    pub fn topological_order(&self) -> Result<Vec<K>, GraphCycleError> {
        let mut in_degree: HashMap<&K, usize> =
            self.nodes.iter().map(|key| (key, self.count_predecessors(key))).collect();
        let mut ready: VecDeque<&K> =
            self.nodes.iter().filter(|key| in_degree[key] == 0).collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(key) = ready.pop_front() {
            order.push(key.clone());
            for succ in self.successors(key) {
                let degree = in_degree
                    .get_mut(succ)
                    .expect("successor of a known node must be a known node");
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(succ);
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(GraphCycleError { remaining: self.nodes.len() - order.len() });
        }
        Ok(order)
    }
}

/// Type-shape payload of a chunk, published as part of the full (worker-side)
/// chunk meta.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkTypeInfo {
    pub data_type: String,
    /// Dimension sizes; `None` marks an unknown extent.
    pub shape: Vec<Option<u64>>,
}

/// A node of the computation DAG: one output of an operand. Several chunks may
/// share the same operand.
#[derive(Clone, Debug)]
pub struct Chunk {
    pub key: ChunkKey,
    pub op: Arc<Operand>,
    pub type_info: Option<ChunkTypeInfo>,
}

impl Chunk {
    pub fn new(key: impl Into<ChunkKey>, op: Arc<Operand>) -> Self {
        Self { key: key.into(), op, type_info: None }
    }
}

/// Index of a chunk node within its [`ChunkGraph`]. Node identity is the
/// index, not the chunk key: two operands may legitimately produce the same
/// logical key.
pub type ChunkIndex = usize;

/// The chunk DAG of a subtask, with its declared result chunks.
#[derive(Clone, Debug, Default)]
pub struct ChunkGraph {
    chunks: Vec<Chunk>,
    graph: DirectedGraph<ChunkIndex>,
    result_chunks: Vec<ChunkIndex>,
}

impl ChunkGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_chunk(&mut self, chunk: Chunk) -> ChunkIndex {
        let index = self.chunks.len();
        self.chunks.push(chunk);
        self.graph.add_node(index);
        index
    }

    pub fn add_dependency(&mut self, from: ChunkIndex, to: ChunkIndex) {
        self.graph.add_edge(from, to);
    }

    /// Declares a chunk as a subtask result. Order of declaration is kept.
    pub fn mark_result(&mut self, index: ChunkIndex) {
        if !self.result_chunks.contains(&index) {
            self.result_chunks.push(index);
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunk(&self, index: ChunkIndex) -> &Chunk {
        &self.chunks[index]
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }

    pub fn indices(&self) -> impl Iterator<Item = ChunkIndex> {
        0..self.chunks.len()
    }

    pub fn result_indices(&self) -> &[ChunkIndex] {
        &self.result_chunks
    }

    pub fn result_chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.result_chunks.iter().map(|index| &self.chunks[*index])
    }

    pub fn iter_indep(&self) -> impl Iterator<Item = &Chunk> {
        self.graph.iter_indep().map(|index| &self.chunks[*index])
    }

    pub fn predecessors(&self, index: ChunkIndex) -> &[ChunkIndex] {
        self.graph.predecessors(&index)
    }

    pub fn successors(&self, index: ChunkIndex) -> &[ChunkIndex] {
        self.graph.successors(&index)
    }

    pub fn count_successors(&self, index: ChunkIndex) -> usize {
        self.graph.count_successors(&index)
    }

    pub fn topological_order(&self) -> Result<Vec<ChunkIndex>, GraphCycleError> {
        self.graph.topological_order()
    }
}
