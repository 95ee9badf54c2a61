use ndarray::Array2;
use rayon::prelude::*;

use super::{EmbeddingBag, SparseFeature};
use crate::error::{DistributedError, InvariantViolation};
use crate::partition::TablePartition;
use crate::sharding::ShardingSpec;

/// Lookups of the owned tables over the full global batch.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalEmbeddings {
    tables: Vec<usize>,
    outputs: Vec<Array2<f32>>,
    pad_slots: usize,
    shape: [usize; 2],
    spec: ShardingSpec,
}

impl LocalEmbeddings {
    /// Global indices of the tables, sorted.
    pub fn tables(&self) -> &[usize] {
        &self.tables
    }

    /// Full-batch output of every owned table, `(B, D)` each, in table order.
    pub fn outputs(&self) -> &[Array2<f32>] {
        &self.outputs
    }

    /// Number of zero tensors appended to reach the local table count.
    pub fn pad_slots(&self) -> usize {
        self.pad_slots
    }

    /// Global batch size `B`.
    pub fn global_batch(&self) -> usize {
        self.shape[0]
    }

    /// Embedding dimension `D`.
    pub fn embedding_dim(&self) -> usize {
        self.shape[1]
    }

    /// Sharding of the outputs: every device of the group holds whole tensors.
    pub fn spec(&self) -> &ShardingSpec {
        &self.spec
    }

    /// The tensors this device contributes to the gather: its outputs followed by zero pads,
    /// `ceil(T / G)` in total.
    pub fn contributions(&self) -> Vec<Array2<f32>> {
        let mut contributions = self.outputs.clone();
        contributions.extend((0..self.pad_slots).map(|_| Array2::zeros(self.shape)));
        contributions
    }
}

/// Runs the owned tables' lookups on one device.
///
/// Every device of a model-parallel group sees the same full global batch, so each table's
/// lookup produces the whole `(B, D)` output exactly once within the group.
#[derive(Clone, Copy, Debug)]
pub struct LocalEmbeddingExecutor<'a> {
    partition: &'a TablePartition,
    embedding_dim: usize,
}

impl<'a> LocalEmbeddingExecutor<'a> {
    /// Executor for the tables owned according to `partition`, all `embedding_dim` wide.
    pub fn new(partition: &'a TablePartition, embedding_dim: usize) -> Self {
        Self {
            partition,
            embedding_dim,
        }
    }

    /// Looks up every owned table.
    ///
    /// `tables` holds the owned tables in the order of [`TablePartition::owned_tables`], and
    /// `features` the sparse input of all `T` tables, each with one bag per batch row.
    pub fn run<E: EmbeddingBag>(
        &self,
        tables: &[E],
        features: &[SparseFeature],
    ) -> Result<LocalEmbeddings, DistributedError> {
        let owned = self.partition.owned_tables();
        if features.len() != self.partition.num_tables() {
            return Err(InvariantViolation::TableCount {
                expected: self.partition.num_tables(),
                got: features.len(),
            }
            .into());
        }
        if tables.len() != owned.len() {
            return Err(InvariantViolation::TableCount {
                expected: owned.len(),
                got: tables.len(),
            }
            .into());
        }

        let global_batch = features[0].num_bags();
        if let Some(feature) = features.iter().find(|f| f.num_bags() != global_batch) {
            return Err(InvariantViolation::UnexpectedShape {
                context: "sparse feature bags",
                expected: vec![global_batch],
                got: vec![feature.num_bags()],
            }
            .into());
        }

        let shape = [global_batch, self.embedding_dim];
        let outputs = owned
            .par_iter()
            .zip(tables.par_iter())
            .map(|(&table, bag)| -> Result<Array2<f32>, DistributedError> {
                let output = bag.forward(&features[table])?;
                if output.shape() != shape {
                    return Err(InvariantViolation::UnexpectedShape {
                        context: "embedding lookup",
                        expected: shape.to_vec(),
                        got: output.shape().to_vec(),
                    }
                    .into());
                }
                Ok(output)
            })
            .collect::<Result<Vec<_>, _>>()?;

        log::trace!(
            "Looked up {} tables over {global_batch} rows, {} pad slots",
            outputs.len(),
            self.partition.pad_slots()
        );

        Ok(LocalEmbeddings {
            tables: owned.to_vec(),
            outputs,
            pad_slots: self.partition.pad_slots(),
            shape,
            spec: ShardingSpec::replicated(2),
        })
    }
}
