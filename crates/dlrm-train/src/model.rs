//! The DLRM network as seen by one device.
//!
//! Dense layers are replicated on every device and see this device's rows of the batch. The
//! embedding tables are sharded across the model-parallel group by [`HybridEmbedding`].

use dlrm_distributed::collective::Collective;
use dlrm_distributed::{
    DataParallelReplicator, EmbeddingForward, GradientBuffers, HybridEmbedding, TopologyConfig,
};
use ndarray::{Array2, ArrayViewMutD};
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::config::DlrmConfig;
use crate::data::Batch;
use crate::error::TrainError;
use crate::interaction::{Interaction, interaction_for};
use crate::loss::{Loss, OutputClamp, correct_predictions};
use crate::mlp::Mlp;

/// Outcome of one step on this device's rows.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepOutput {
    /// Mean loss over the local rows.
    pub loss: f32,
    /// Local rows whose rounded prediction equals the target.
    pub correct: usize,
    /// Number of local rows.
    pub samples: usize,
}

struct ForwardCache {
    dense: Array2<f32>,
    embeddings: EmbeddingForward,
    sparse: Vec<Array2<f32>>,
    raw_pred: Array2<f32>,
}

/// Both MLPs, averaged with a single all-reduce.
struct DenseParams<'a> {
    bottom: &'a mut Mlp,
    top: &'a mut Mlp,
}

impl GradientBuffers for DenseParams<'_> {
    fn visit_grads(&mut self, f: &mut dyn FnMut(ArrayViewMutD<'_, f32>)) {
        self.bottom.visit_grads(f);
        self.top.visit_grads(f);
    }
}

/// Parameters and per-step state of one device.
pub struct DlrmModel {
    bottom: Mlp,
    top: Mlp,
    embedding: HybridEmbedding,
    interaction: Box<dyn Interaction>,
    loss: Loss,
    clamp: OutputClamp,
    dense_sync: DataParallelReplicator,
    sparse_sync: DataParallelReplicator,
    cache: Option<ForwardCache>,
}

impl DlrmModel {
    /// Builds the device's share of the model.
    ///
    /// Dense layers are drawn from the training seed, so every device starts with identical
    /// replicas.
    pub fn new(config: &DlrmConfig, topology: TopologyConfig) -> Result<Self, TrainError> {
        let arch = &config.arch;
        let mut rng = StdRng::seed_from_u64(config.training.seed);
        let bottom = Mlp::init(&arch.mlp_bot, None, &mut rng)?;
        let top_layers = config.top_layers();
        let top = Mlp::init(&top_layers, top_layers.len().checked_sub(2), &mut rng)?;

        let dense_sync = DataParallelReplicator::world(topology.world_size());
        let sparse_sync = DataParallelReplicator::data_group(&topology);
        let embedding = HybridEmbedding::new(
            topology,
            &arch.embedding_sizes,
            arch.sparse_feature_size,
            config.training.seed,
        )?;

        Ok(Self {
            bottom,
            top,
            embedding,
            interaction: interaction_for(arch.interaction_op, arch.interaction_itself),
            loss: Loss::from_config(&config.training),
            clamp: OutputClamp::new(config.training.loss_threshold),
            dense_sync,
            sparse_sync,
            cache: None,
        })
    }

    /// Bottom MLP.
    pub fn bottom(&self) -> &Mlp {
        &self.bottom
    }

    /// Top MLP.
    pub fn top(&self) -> &Mlp {
        &self.top
    }

    /// Embedding layer.
    pub fn embedding(&self) -> &HybridEmbedding {
        &self.embedding
    }

    pub(crate) fn parts_mut(&mut self) -> (&mut Mlp, &mut Mlp, &mut HybridEmbedding) {
        self.cache = None;
        (&mut self.bottom, &mut self.top, &mut self.embedding)
    }

    /// Topology of this device.
    pub fn topology(&self) -> &TopologyConfig {
        self.embedding.topology()
    }

    /// Predictions for this device's rows of `batch`.
    ///
    /// Every device of the model-parallel group must call this with the same global batch.
    pub fn forward(
        &mut self,
        collective: &dyn Collective,
        batch: &Batch,
    ) -> Result<Array2<f32>, TrainError> {
        let slice = self.topology().batch_slice(batch.len())?;

        let dense = self.bottom.forward(&batch.local_dense(&slice));
        let embeddings = self.embedding.forward(collective, &batch.sparse)?;
        let sparse = embeddings.local_tensors();
        let interaction = self.interaction.forward(&dense, &sparse)?;
        let raw_pred = self.top.forward(&interaction);
        let pred = self.clamp.apply(&raw_pred);

        self.cache = Some(ForwardCache {
            dense,
            embeddings,
            sparse,
            raw_pred,
        });
        Ok(pred)
    }

    /// Backpropagates the loss of the last forward pass into every parameter's gradient.
    fn backward(
        &mut self,
        collective: &dyn Collective,
        pred: &Array2<f32>,
        target: &Array2<f32>,
    ) -> Result<(), TrainError> {
        let cache = self.cache.take().ok_or(TrainError::MissingForward("dlrm model"))?;

        let grad = self.loss.backward(pred, target);
        let grad = self.clamp.backward(&cache.raw_pred, &grad);
        let grad = self.top.backward(&grad)?;
        let (dense_grad, sparse_grads) = self
            .interaction
            .backward(&cache.dense, &cache.sparse, &grad)?;
        self.bottom.backward(&dense_grad)?;
        self.embedding
            .backward(collective, &cache.embeddings, &sparse_grads)?;
        Ok(())
    }

    /// Averages the dense gradients over the world and the embedding gradients over the
    /// data-parallel group.
    fn synchronize_grads(&mut self, collective: &dyn Collective) -> Result<(), TrainError> {
        let mut dense = DenseParams {
            bottom: &mut self.bottom,
            top: &mut self.top,
        };
        self.dense_sync.average(collective, &mut dense)?;
        self.sparse_sync.average(collective, &mut self.embedding)?;
        Ok(())
    }

    fn zero_grad(&mut self) {
        self.bottom.zero_grad();
        self.top.zero_grad();
        self.embedding.zero_grad();
    }

    /// Runs one training step with learning rate `lr`.
    ///
    /// A routed embedding gradient is the sum of `G` local-batch means, so the tables are
    /// updated with `lr / G`.
    pub fn train_step(
        &mut self,
        collective: &dyn Collective,
        batch: &Batch,
        lr: f32,
    ) -> Result<StepOutput, TrainError> {
        self.zero_grad();
        let (pred, output) = self.evaluate(collective, batch)?;
        let target = self.local_target(batch)?;

        self.backward(collective, &pred, &target)?;
        self.synchronize_grads(collective)?;

        let group_len = self.topology().group_len() as f32;
        self.bottom.sgd_step(lr);
        self.top.sgd_step(lr);
        self.embedding.sgd_step(lr / group_len);
        Ok(output)
    }

    /// Runs the forward pass only.
    pub fn eval_step(
        &mut self,
        collective: &dyn Collective,
        batch: &Batch,
    ) -> Result<StepOutput, TrainError> {
        let (_, output) = self.evaluate(collective, batch)?;
        self.cache = None;
        Ok(output)
    }

    fn evaluate(
        &mut self,
        collective: &dyn Collective,
        batch: &Batch,
    ) -> Result<(Array2<f32>, StepOutput), TrainError> {
        let pred = self.forward(collective, batch)?;
        let target = self.local_target(batch)?;
        let output = StepOutput {
            loss: self.loss.forward(&pred, &target),
            correct: correct_predictions(&pred, &target),
            samples: target.nrows(),
        };
        Ok((pred, output))
    }

    fn local_target(&self, batch: &Batch) -> Result<Array2<f32>, TrainError> {
        let slice = self.topology().batch_slice(batch.len())?;
        Ok(batch.local_target(&slice))
    }
}
