//! Deterministic synthetic click data.
//!
//! Batches are a pure function of `(seed, replica, index)`. Every device of one model-parallel
//! group regenerates the same global batch and keeps its own rows of the dense part, while the
//! sparse part stays full-batch for the embedding lookups.

use dlrm_distributed::BatchSlice;
use dlrm_distributed::embedding::SparseFeature;
use ndarray::{Array2, s};
use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};

use crate::config::DlrmConfig;

/// One global mini-batch.
#[derive(Clone, Debug, PartialEq, derive_new::new)]
pub struct Batch {
    /// `(B, dense_dim)` dense features.
    pub dense: Array2<f32>,
    /// Full-batch sparse input of every table.
    pub sparse: Vec<SparseFeature>,
    /// `(B, 1)` targets.
    pub target: Array2<f32>,
}

impl Batch {
    /// Number of samples.
    pub fn len(&self) -> usize {
        self.dense.nrows()
    }

    /// Whether the batch has no samples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dense rows of `slice`.
    pub fn local_dense(&self, slice: &BatchSlice) -> Array2<f32> {
        self.dense.slice(s![slice.range(), ..]).to_owned()
    }

    /// Target rows of `slice`.
    pub fn local_target(&self, slice: &BatchSlice) -> Array2<f32> {
        self.target.slice(s![slice.range(), ..]).to_owned()
    }
}

/// Generator of random batches.
#[derive(Clone, Debug)]
pub struct SyntheticDataset {
    seed: u64,
    dense_dim: usize,
    table_sizes: Vec<usize>,
    batch_size: usize,
    num_batches: usize,
    max_indices: usize,
    fixed_indices: bool,
    round_targets: bool,
}

impl SyntheticDataset {
    /// Dataset of a (validated) configuration.
    pub fn new(config: &DlrmConfig) -> Self {
        Self {
            seed: config.data.seed,
            dense_dim: config.arch.mlp_bot.first().copied().unwrap_or_default(),
            table_sizes: config.arch.embedding_sizes.clone(),
            batch_size: config.data.mini_batch_size,
            num_batches: config.num_batches(),
            max_indices: config.data.num_indices_per_lookup,
            fixed_indices: config.data.num_indices_per_lookup_fixed,
            round_targets: config.data.round_targets,
        }
    }

    /// Batches per epoch.
    pub fn num_batches(&self) -> usize {
        self.num_batches
    }

    /// Global batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Batch `index` of data replica `replica`.
    pub fn batch(&self, replica: usize, index: usize) -> Batch {
        let stream = (replica as u64) << 32 | index as u64;
        let mut rng = StdRng::seed_from_u64(self.seed ^ stream.wrapping_mul(0x9E37_79B9_7F4A_7C15));

        let dense =
            Array2::from_shape_simple_fn((self.batch_size, self.dense_dim), || rng.random::<f32>());
        let sparse = self
            .table_sizes
            .iter()
            .map(|&size| {
                SparseFeature::from_bags((0..self.batch_size).map(|_| self.bag(&mut rng, size)))
            })
            .collect();
        let target = Array2::from_shape_simple_fn((self.batch_size, 1), || {
            let t = rng.random::<f32>();
            if self.round_targets { t.round() } else { t }
        });

        Batch::new(dense, sparse, target)
    }

    /// Sorted, unique indices of one lookup.
    fn bag(&self, rng: &mut StdRng, table_size: usize) -> Vec<usize> {
        let len = if self.fixed_indices {
            self.max_indices
        } else {
            rng.random_range(1..=self.max_indices)
        };
        let mut bag = index::sample(rng, table_size, len.min(table_size)).into_vec();
        bag.sort_unstable();
        bag
    }
}
