//! Training configuration.
//!
//! A [`DlrmConfig`] is loaded from JSON, patched with command line overrides and validated
//! once, before any worker starts.

use std::path::{Path, PathBuf};

use clap::{Args, ValueEnum};
use dlrm_distributed::{BatchSlice, ParallelMode, Topology};
use serde::{Deserialize, Serialize};

use crate::error::TrainError;

/// Operator combining the dense and sparse features.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum InteractionOp {
    /// Pairwise dot products between all features.
    #[default]
    Dot,
    /// Concatenation of all features.
    Cat,
}

/// Training objective.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LossFunction {
    /// Mean squared error.
    #[default]
    Mse,
    /// Binary cross-entropy.
    Bce,
    /// Binary cross-entropy with per-class weights.
    Wbce,
}

/// Model architecture.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchConfig {
    /// Embedding dimension of every table.
    pub sparse_feature_size: usize,
    /// Row count of every embedding table.
    pub embedding_sizes: Vec<usize>,
    /// Layer widths of the bottom MLP, input first.
    pub mlp_bot: Vec<usize>,
    /// Layer widths of the top MLP after the interaction layer.
    pub mlp_top: Vec<usize>,
    /// Interaction operator.
    pub interaction_op: InteractionOp,
    /// Whether dot interactions include each feature with itself.
    pub interaction_itself: bool,
}

impl Default for ArchConfig {
    fn default() -> Self {
        Self {
            sparse_feature_size: 2,
            embedding_sizes: vec![4, 3, 2],
            mlp_bot: vec![4, 3, 2],
            mlp_top: vec![4, 2, 1],
            interaction_op: InteractionOp::Dot,
            interaction_itself: false,
        }
    }
}

/// Synthetic data generation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Number of samples per replica and epoch.
    pub data_size: usize,
    /// Overrides the number of batches derived from `data_size` when positive.
    pub num_batches: usize,
    /// Global batch size of one model-parallel group.
    pub mini_batch_size: usize,
    /// Maximum bag size of every lookup.
    pub num_indices_per_lookup: usize,
    /// Whether every bag has exactly `num_indices_per_lookup` indices.
    pub num_indices_per_lookup_fixed: bool,
    /// Whether targets are rounded to 0 or 1.
    pub round_targets: bool,
    /// Seed of the data generator.
    pub seed: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_size: 1,
            num_batches: 0,
            mini_batch_size: 1,
            num_indices_per_lookup: 10,
            num_indices_per_lookup_fixed: false,
            round_targets: false,
            seed: 123,
        }
    }
}

/// Optimization and reporting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Loss function.
    pub loss_function: LossFunction,
    /// Class weights `[w0, w1]` of the weighted cross-entropy.
    pub loss_weights: [f32; 2],
    /// Predictions are clamped to `[t, 1 - t]` when `0 < t < 1`.
    pub loss_threshold: f32,
    /// Base learning rate.
    pub learning_rate: f32,
    /// Number of epochs.
    pub nepochs: usize,
    /// Metrics are reported every `print_freq` batches.
    pub print_freq: usize,
    /// Runs the forward pass only.
    pub inference_only: bool,
    /// Steps of linear warmup.
    pub lr_num_warmup_steps: usize,
    /// Step at which the quadratic decay starts.
    pub lr_decay_start_step: usize,
    /// Length of the decay.
    pub lr_num_decay_steps: usize,
    /// Seed of the parameter initialization.
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            loss_function: LossFunction::Mse,
            loss_weights: [1.0, 1.0],
            loss_threshold: 0.0,
            learning_rate: 0.01,
            nepochs: 1,
            print_freq: 1,
            inference_only: false,
            lr_num_warmup_steps: 0,
            lr_decay_start_step: 0,
            lr_num_decay_steps: 0,
            seed: 123,
        }
    }
}

/// Device world layout.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Number of devices.
    pub world_size: usize,
    /// Devices per model-parallel group.
    pub model_parallel_group_len: usize,
    /// Hybrid or pure data parallelism.
    pub mode: ParallelMode,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            world_size: 1,
            model_parallel_group_len: 1,
            mode: ParallelMode::Hybrid,
        }
    }
}

/// Checkpoint locations.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Directory the per-device checkpoints are written to after training.
    pub save_dir: Option<PathBuf>,
    /// Directory the per-device checkpoints are restored from before training.
    pub load_dir: Option<PathBuf>,
}

/// Complete configuration of a training run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DlrmConfig {
    /// Model architecture.
    pub arch: ArchConfig,
    /// Synthetic data.
    pub data: DataConfig,
    /// Optimization and reporting.
    pub training: TrainingConfig,
    /// Device world.
    pub parallel: ParallelConfig,
    /// Checkpoints.
    pub checkpoint: CheckpointConfig,
}

impl DlrmConfig {
    /// Reads a JSON configuration. Missing fields take their default value.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, TrainError> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    /// Writes the configuration as pretty-printed JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), TrainError> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    /// Effective model-parallel group length.
    pub fn group_len(&self) -> usize {
        match self.parallel.mode {
            ParallelMode::DataParallel => 1,
            ParallelMode::Hybrid => self.parallel.model_parallel_group_len,
        }
    }

    /// Width of the interaction output, the input of the top MLP.
    pub fn num_interactions(&self) -> usize {
        let arch = &self.arch;
        let num_features = arch.embedding_sizes.len() + 1;
        let dense_out = arch.mlp_bot.last().copied().unwrap_or_default();
        match arch.interaction_op {
            InteractionOp::Dot if arch.interaction_itself => {
                num_features * (num_features + 1) / 2 + dense_out
            }
            InteractionOp::Dot => num_features * (num_features - 1) / 2 + dense_out,
            InteractionOp::Cat => num_features * dense_out,
        }
    }

    /// Layer widths of the top MLP, including its input.
    pub fn top_layers(&self) -> Vec<usize> {
        let mut layers = vec![self.num_interactions()];
        layers.extend_from_slice(&self.arch.mlp_top);
        layers
    }

    /// Number of batches per epoch. An incomplete trailing batch is dropped.
    pub fn num_batches(&self) -> usize {
        if self.data.num_batches > 0 {
            self.data.num_batches
        } else {
            self.data.data_size / self.data.mini_batch_size.max(1)
        }
    }

    /// Checks every static constraint of the run.
    pub fn validate(&self) -> Result<(), TrainError> {
        let arch = &self.arch;
        if arch.embedding_sizes.is_empty() {
            return Err(invalid("at least one embedding table is required"));
        }
        if arch.embedding_sizes.contains(&0) {
            return Err(invalid("embedding tables must have at least one row"));
        }
        if arch.sparse_feature_size == 0 {
            return Err(invalid("sparse feature size must be positive"));
        }
        if arch.mlp_bot.len() < 2 || arch.mlp_top.is_empty() {
            return Err(invalid("the bottom MLP needs two widths and the top MLP one"));
        }
        if arch.mlp_bot.contains(&0) || arch.mlp_top.contains(&0) {
            return Err(invalid("MLP widths must be positive"));
        }
        let dense_out = arch.mlp_bot[arch.mlp_bot.len() - 1];
        if dense_out != arch.sparse_feature_size {
            return Err(invalid(format!(
                "sparse feature size {} does not match last dim of bottom MLP {}",
                arch.sparse_feature_size, dense_out
            )));
        }
        if arch.mlp_top.last() != Some(&1) {
            return Err(invalid("the top MLP must end with a single output"));
        }

        let data = &self.data;
        if data.mini_batch_size == 0 {
            return Err(invalid("mini batch size must be positive"));
        }
        if data.num_indices_per_lookup == 0 {
            return Err(invalid("lookups need at least one index"));
        }
        if self.num_batches() == 0 {
            return Err(invalid(format!(
                "data size {} is smaller than one batch of {}",
                data.data_size, data.mini_batch_size
            )));
        }

        let training = &self.training;
        if training.print_freq == 0 {
            return Err(invalid("print frequency must be positive"));
        }
        if !(training.learning_rate.is_finite() && training.learning_rate > 0.0) {
            return Err(invalid("learning rate must be positive"));
        }
        if training.loss_weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(invalid("loss weights must be non-negative"));
        }
        if training.lr_decay_start_step < training.lr_num_warmup_steps {
            return Err(invalid(
                "learning rate warmup must finish before the decay starts",
            ));
        }

        let group_len = self.group_len();
        Topology::resolve(
            self.parallel.world_size,
            self.parallel.model_parallel_group_len,
            self.parallel.mode,
        )?;
        BatchSlice::for_position(data.mini_batch_size, group_len, 0)?;

        Ok(())
    }
}

fn invalid<S: Into<String>>(message: S) -> TrainError {
    TrainError::InvalidConfig(message.into())
}

/// Parses a dash-separated list of sizes such as `4-3-2`.
pub fn parse_dash_list(value: &str) -> Result<Vec<usize>, String> {
    value
        .split('-')
        .map(|part| {
            part.trim()
                .parse::<usize>()
                .map_err(|err| format!("invalid entry {part:?} in {value:?}: {err}"))
        })
        .collect()
}

/// Parses class weights written as `w0-w1`.
pub fn parse_loss_weights(value: &str) -> Result<[f32; 2], String> {
    let weights = value
        .split('-')
        .map(|part| {
            part.trim()
                .parse::<f32>()
                .map_err(|err| format!("invalid weight {part:?} in {value:?}: {err}"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    match weights.as_slice() {
        [w0, w1] => Ok([*w0, *w1]),
        _ => Err(format!("expected two weights, got {value:?}")),
    }
}

/// A dash-separated list of sizes parsed as one command line value.
pub type SizeList = Vec<usize>;

/// Command line overrides of individual configuration fields.
#[derive(Args, Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Embedding dimension of every table.
    #[arg(long)]
    pub arch_sparse_feature_size: Option<usize>,
    /// Table row counts, e.g. `4-3-2`.
    #[arg(long, value_parser = parse_dash_list)]
    pub arch_embedding_size: Option<SizeList>,
    /// Bottom MLP widths, e.g. `4-3-2`.
    #[arg(long, value_parser = parse_dash_list)]
    pub arch_mlp_bot: Option<SizeList>,
    /// Top MLP widths after the interaction layer, e.g. `4-2-1`.
    #[arg(long, value_parser = parse_dash_list)]
    pub arch_mlp_top: Option<SizeList>,
    /// Interaction operator.
    #[arg(long, value_enum)]
    pub arch_interaction_op: Option<InteractionOp>,
    /// Include self-interactions in the dot operator.
    #[arg(long)]
    pub arch_interaction_itself: bool,
    /// Loss function.
    #[arg(long, value_enum)]
    pub loss_function: Option<LossFunction>,
    /// Class weights of the weighted cross-entropy, e.g. `1.0-1.0`.
    #[arg(long, value_parser = parse_loss_weights)]
    pub loss_weights: Option<[f32; 2]>,
    /// Clamp threshold of the predictions.
    #[arg(long)]
    pub loss_threshold: Option<f32>,
    /// Round the synthetic targets to 0 or 1.
    #[arg(long)]
    pub round_targets: bool,
    /// Samples per replica and epoch.
    #[arg(long)]
    pub data_size: Option<usize>,
    /// Batches per epoch.
    #[arg(long)]
    pub num_batches: Option<usize>,
    /// Maximum bag size.
    #[arg(long)]
    pub num_indices_per_lookup: Option<usize>,
    /// Use exactly `num_indices_per_lookup` indices per bag.
    #[arg(long)]
    pub num_indices_per_lookup_fixed: bool,
    /// Global batch size of one model-parallel group.
    #[arg(long)]
    pub mini_batch_size: Option<usize>,
    /// Number of epochs.
    #[arg(long)]
    pub nepochs: Option<usize>,
    /// Base learning rate.
    #[arg(long)]
    pub learning_rate: Option<f32>,
    /// Seed of the data generator and the parameter initialization.
    #[arg(long)]
    pub seed: Option<u64>,
    /// Report metrics every this many batches.
    #[arg(long)]
    pub print_freq: Option<usize>,
    /// Forward pass only.
    #[arg(long)]
    pub inference_only: bool,
    /// Steps of learning rate warmup.
    #[arg(long)]
    pub lr_num_warmup_steps: Option<usize>,
    /// Step at which the learning rate decay starts.
    #[arg(long)]
    pub lr_decay_start_step: Option<usize>,
    /// Length of the learning rate decay.
    #[arg(long)]
    pub lr_num_decay_steps: Option<usize>,
    /// Number of devices.
    #[arg(long)]
    pub world_size: Option<usize>,
    /// Devices per model-parallel group.
    #[arg(long)]
    pub model_parallel_group_len: Option<usize>,
    /// Replicate every table on every device.
    #[arg(long)]
    pub data_parallel: bool,
    /// Directory to write checkpoints to.
    #[arg(long)]
    pub save_model: Option<PathBuf>,
    /// Directory to restore checkpoints from.
    #[arg(long)]
    pub load_model: Option<PathBuf>,
}

impl ConfigOverrides {
    /// Writes every given override into `config`.
    pub fn apply(self, config: &mut DlrmConfig) {
        let DlrmConfig {
            arch,
            data,
            training,
            parallel,
            checkpoint,
        } = config;

        set(&mut arch.sparse_feature_size, self.arch_sparse_feature_size);
        set(&mut arch.embedding_sizes, self.arch_embedding_size);
        set(&mut arch.mlp_bot, self.arch_mlp_bot);
        set(&mut arch.mlp_top, self.arch_mlp_top);
        set(&mut arch.interaction_op, self.arch_interaction_op);
        arch.interaction_itself |= self.arch_interaction_itself;

        set(&mut training.loss_function, self.loss_function);
        set(&mut training.loss_weights, self.loss_weights);
        set(&mut training.loss_threshold, self.loss_threshold);
        set(&mut training.nepochs, self.nepochs);
        set(&mut training.learning_rate, self.learning_rate);
        set(&mut training.print_freq, self.print_freq);
        set(&mut training.lr_num_warmup_steps, self.lr_num_warmup_steps);
        set(&mut training.lr_decay_start_step, self.lr_decay_start_step);
        set(&mut training.lr_num_decay_steps, self.lr_num_decay_steps);
        training.inference_only |= self.inference_only;

        data.round_targets |= self.round_targets;
        set(&mut data.data_size, self.data_size);
        set(&mut data.num_batches, self.num_batches);
        set(&mut data.num_indices_per_lookup, self.num_indices_per_lookup);
        data.num_indices_per_lookup_fixed |= self.num_indices_per_lookup_fixed;
        set(&mut data.mini_batch_size, self.mini_batch_size);

        if let Some(seed) = self.seed {
            data.seed = seed;
            training.seed = seed;
        }

        set(&mut parallel.world_size, self.world_size);
        set(
            &mut parallel.model_parallel_group_len,
            self.model_parallel_group_len,
        );
        if self.data_parallel {
            parallel.mode = ParallelMode::DataParallel;
        }

        if self.save_model.is_some() {
            checkpoint.save_dir = self.save_model;
        }
        if self.load_model.is_some() {
            checkpoint.load_dir = self.load_model;
        }
    }
}

fn set<T>(field: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *field = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlrm_distributed::{ConfigError, DistributedError};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn test_defaults_are_valid() {
        let config = DlrmConfig::default();
        config.validate().unwrap();
        assert_eq!(config.num_interactions(), 8);
        assert_eq!(config.top_layers(), vec![8, 4, 2, 1]);
    }

    #[rstest]
    #[case(InteractionOp::Dot, false, 8)]
    #[case(InteractionOp::Dot, true, 12)]
    #[case(InteractionOp::Cat, false, 8)]
    fn test_interaction_width(
        #[case] op: InteractionOp,
        #[case] itself: bool,
        #[case] expected: usize,
    ) {
        let mut config = DlrmConfig::default();
        config.arch.interaction_op = op;
        config.arch.interaction_itself = itself;
        assert_eq!(config.num_interactions(), expected);
    }

    #[test]
    fn test_parse_dash_list() {
        assert_eq!(parse_dash_list("4-3-2"), Ok(vec![4, 3, 2]));
        assert_eq!(parse_dash_list("13"), Ok(vec![13]));
        assert!(parse_dash_list("4--2").is_err());
        assert_eq!(parse_loss_weights("0.5-2.0"), Ok([0.5, 2.0]));
        assert!(parse_loss_weights("1.0").is_err());
    }

    #[test]
    fn test_mismatched_bottom_mlp_is_rejected() {
        let mut config = DlrmConfig::default();
        config.arch.mlp_bot = vec![4, 3];
        assert!(matches!(config.validate(), Err(TrainError::InvalidConfig(_))));
    }

    #[test]
    fn test_indivisible_world_is_rejected() {
        let mut config = DlrmConfig::default();
        config.parallel.world_size = 4;
        config.parallel.model_parallel_group_len = 3;
        assert!(matches!(
            config.validate(),
            Err(TrainError::Distributed(DistributedError::Config(
                ConfigError::IndivisibleWorld { .. }
            )))
        ));
    }

    #[test]
    fn test_indivisible_batch_is_rejected() {
        let mut config = DlrmConfig::default();
        config.parallel.world_size = 2;
        config.parallel.model_parallel_group_len = 2;
        config.data.mini_batch_size = 3;
        config.data.data_size = 6;
        assert!(matches!(
            config.validate(),
            Err(TrainError::Distributed(DistributedError::Config(
                ConfigError::IndivisibleBatch { .. }
            )))
        ));
    }

    #[test]
    fn test_data_smaller_than_a_batch_is_rejected() {
        let mut config = DlrmConfig::default();
        config.data.mini_batch_size = 4;
        config.data.data_size = 3;
        assert!(matches!(config.validate(), Err(TrainError::InvalidConfig(_))));

        config.data.num_batches = 2;
        config.validate().unwrap();
    }

    #[test]
    fn test_decay_before_warmup_is_rejected() {
        let mut config = DlrmConfig::default();
        config.training.lr_num_warmup_steps = 10;
        config.training.lr_decay_start_step = 5;
        assert!(matches!(config.validate(), Err(TrainError::InvalidConfig(_))));
    }

    #[test]
    fn test_data_parallel_mode_ignores_group_len() {
        let mut config = DlrmConfig::default();
        config.parallel.world_size = 3;
        config.parallel.model_parallel_group_len = 2;
        config.parallel.mode = ParallelMode::DataParallel;
        config.validate().unwrap();
        assert_eq!(config.group_len(), 1);
    }

    #[test]
    fn test_overrides_patch_fields() {
        let mut config = DlrmConfig::default();
        ConfigOverrides {
            arch_embedding_size: Some(vec![10, 20]),
            world_size: Some(4),
            model_parallel_group_len: Some(2),
            seed: Some(9),
            inference_only: true,
            ..Default::default()
        }
        .apply(&mut config);

        assert_eq!(config.arch.embedding_sizes, vec![10, 20]);
        assert_eq!(config.parallel.world_size, 4);
        assert_eq!(config.group_len(), 2);
        assert_eq!(config.data.seed, 9);
        assert_eq!(config.training.seed, 9);
        assert!(config.training.inference_only);
        assert_eq!(config.arch.mlp_bot, vec![4, 3, 2]);
    }

    #[test]
    fn test_json_round_trip_with_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"arch": {"embedding_sizes": [7, 8]}, "parallel": {"mode": "data_parallel"}}"#,
        )
        .unwrap();

        let config = DlrmConfig::load(&path).unwrap();
        assert_eq!(config.arch.embedding_sizes, vec![7, 8]);
        assert_eq!(config.arch.sparse_feature_size, 2);
        assert_eq!(config.parallel.mode, ParallelMode::DataParallel);

        let saved = dir.path().join("saved.json");
        config.save(&saved).unwrap();
        assert_eq!(DlrmConfig::load(&saved).unwrap(), config);
    }
}
