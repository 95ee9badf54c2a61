//! Sparse embedding lookups.

mod executor;

pub use executor::*;

use ndarray::{Array2, ArrayView1};
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

use crate::error::EmbeddingError;

/// Sparse indices of one table for a batch.
///
/// Bag `b` covers `indices[offsets[b]..offsets[b + 1]]`; the last bag runs to the end of
/// `indices`. The number of bags is the number of batch rows.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparseFeature {
    /// Flat row indices into the table.
    pub indices: Vec<usize>,
    /// Start of every bag in `indices`.
    pub offsets: Vec<usize>,
}

impl SparseFeature {
    /// Creates a feature from flat indices and bag offsets.
    pub fn new(indices: Vec<usize>, offsets: Vec<usize>) -> Self {
        Self { indices, offsets }
    }

    /// Builds a feature from one bag of indices per batch row.
    pub fn from_bags<I, B>(bags: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[usize]>,
    {
        let mut feature = Self::default();
        for bag in bags {
            feature.offsets.push(feature.indices.len());
            feature.indices.extend_from_slice(bag.as_ref());
        }
        feature
    }

    /// Number of bags, i.e. batch rows.
    pub fn num_bags(&self) -> usize {
        self.offsets.len()
    }

    /// Indices of bag `b`.
    pub fn bag(&self, b: usize) -> &[usize] {
        let start = self.offsets[b];
        let end = self
            .offsets
            .get(b + 1)
            .copied()
            .unwrap_or(self.indices.len());
        &self.indices[start..end]
    }

    /// Checks the offsets and that every index is below `num_embeddings`.
    pub fn validate(&self, num_embeddings: usize) -> Result<(), EmbeddingError> {
        if let Some(&first) = self.offsets.first()
            && first != 0
        {
            return Err(EmbeddingError::InvalidOffsets(format!(
                "first offset is {first}, expected 0"
            )));
        }
        if self.offsets.windows(2).any(|w| w[0] > w[1]) {
            return Err(EmbeddingError::InvalidOffsets(
                "offsets must be non-decreasing".to_string(),
            ));
        }
        if let Some(&last) = self.offsets.last()
            && last > self.indices.len()
        {
            return Err(EmbeddingError::InvalidOffsets(format!(
                "offset {last} exceeds {} indices",
                self.indices.len()
            )));
        }
        if let Some(&index) = self.indices.iter().find(|&&i| i >= num_embeddings) {
            return Err(EmbeddingError::IndexOutOfRange {
                index,
                num_embeddings,
            });
        }
        Ok(())
    }
}

/// Sparse lookup followed by a sum over each bag.
pub trait EmbeddingBag: Send + Sync {
    /// Number of rows in the table.
    fn num_embeddings(&self) -> usize;

    /// Width of every row.
    fn embedding_dim(&self) -> usize;

    /// One summed row per bag, shaped `(bags, embedding_dim)`.
    fn forward(&self, feature: &SparseFeature) -> Result<Array2<f32>, EmbeddingError>;

    /// Accumulates the gradient of the bag sums into the table's gradient.
    fn backward(&mut self, feature: &SparseFeature, grad: &Array2<f32>)
    -> Result<(), EmbeddingError>;
}

/// Dense embedding table in "sum" mode with a dense gradient buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct EmbeddingTable {
    weight: Array2<f32>,
    grad: Array2<f32>,
}

impl EmbeddingTable {
    /// A `num_embeddings x embedding_dim` table initialized uniformly in
    /// `[-sqrt(1/n), sqrt(1/n)]`.
    ///
    /// The weights depend only on `seed`, so a table gets the same initial values on whichever
    /// device ends up owning it.
    pub fn init(num_embeddings: usize, embedding_dim: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let bound = (1.0 / num_embeddings.max(1) as f32).sqrt();
        let weight = Array2::from_shape_simple_fn((num_embeddings, embedding_dim), || {
            rng.random_range(-bound..=bound)
        });
        Self::from_weight(weight)
    }

    /// Wraps existing weights.
    pub fn from_weight(weight: Array2<f32>) -> Self {
        let grad = Array2::zeros(weight.raw_dim());
        Self { weight, grad }
    }

    /// Table weights.
    pub fn weight(&self) -> &Array2<f32> {
        &self.weight
    }

    /// Accumulated gradient.
    pub fn grad(&self) -> &Array2<f32> {
        &self.grad
    }

    /// Mutable access to the accumulated gradient, for reductions.
    pub fn grad_mut(&mut self) -> &mut Array2<f32> {
        &mut self.grad
    }

    /// Clears the accumulated gradient.
    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    /// Plain SGD update with the accumulated gradient.
    pub fn sgd_step(&mut self, lr: f32) {
        self.weight.scaled_add(-lr, &self.grad);
    }
}

impl EmbeddingBag for EmbeddingTable {
    fn num_embeddings(&self) -> usize {
        self.weight.nrows()
    }

    fn embedding_dim(&self) -> usize {
        self.weight.ncols()
    }

    fn forward(&self, feature: &SparseFeature) -> Result<Array2<f32>, EmbeddingError> {
        feature.validate(self.num_embeddings())?;

        let mut out = Array2::zeros((feature.num_bags(), self.embedding_dim()));
        for (b, mut row) in out.rows_mut().into_iter().enumerate() {
            for &index in feature.bag(b) {
                row += &self.weight.row(index);
            }
        }
        Ok(out)
    }

    fn backward(
        &mut self,
        feature: &SparseFeature,
        grad: &Array2<f32>,
    ) -> Result<(), EmbeddingError> {
        feature.validate(self.num_embeddings())?;
        let expected = [feature.num_bags(), self.embedding_dim()];
        if grad.shape() != expected {
            return Err(EmbeddingError::GradientShape {
                expected,
                got: grad.shape().to_vec(),
            });
        }

        for (b, upstream) in grad.rows().into_iter().enumerate() {
            for &index in feature.bag(b) {
                accumulate(&mut self.grad, index, upstream);
            }
        }
        Ok(())
    }
}

fn accumulate(grad: &mut Array2<f32>, index: usize, upstream: ArrayView1<'_, f32>) {
    let mut row = grad.row_mut(index);
    row += &upstream;
}
