use std::path::Path;

use dlrm_distributed::{ConfigError, DistributedError, ParallelMode};
use dlrm_train::TrainError;
use dlrm_train::checkpoint::Checkpoint;
use dlrm_train::config::{DlrmConfig, LossFunction};
use dlrm_train::trainer::{TrainingSummary, launch};
use float_cmp::approx_eq;
use ndarray::Array2;
use pretty_assertions::assert_eq;
use rstest::rstest;

fn config(world_size: usize, group_len: usize, num_tables: usize, batch: usize) -> DlrmConfig {
    let mut config = DlrmConfig::default();
    config.arch.embedding_sizes = (0..num_tables).map(|t| 5 + 2 * t).collect();
    config.data.mini_batch_size = batch;
    config.data.data_size = 3 * batch;
    config.data.num_indices_per_lookup = 3;
    config.training.nepochs = 2;
    config.training.learning_rate = 0.1;
    config.training.print_freq = 2;
    config.parallel.world_size = world_size;
    config.parallel.model_parallel_group_len = group_len;
    config
}

fn assert_close(a: &Array2<f32>, b: &Array2<f32>) {
    assert_eq!(a.shape(), b.shape());
    for (x, y) in a.iter().zip(b) {
        assert!(approx_eq!(f32, *x, *y, epsilon = 1e-5), "{x} != {y}");
    }
}

fn assert_same_run(a: &[TrainingSummary], b: &[TrainingSummary]) {
    for summary in a.iter().chain(b) {
        assert_eq!(summary.steps, a[0].steps);
        assert_eq!(summary.samples, a[0].samples);
        assert!(approx_eq!(f32, summary.loss, a[0].loss, epsilon = 1e-5));
        assert!(approx_eq!(f32, summary.accuracy, a[0].accuracy, epsilon = 1e-6));
    }
}

/// Weights of every table across all records in `dir`, indexed by table.
fn saved_tables(dir: &Path, world_size: usize, num_tables: usize) -> Vec<Array2<f32>> {
    let mut tables = vec![None; num_tables];
    for ordinal in 0..world_size {
        for record in Checkpoint::load(dir, ordinal).unwrap().tables {
            tables[record.table] = Some(record.weight);
        }
    }
    tables.into_iter().map(Option::unwrap).collect()
}

#[rstest]
#[case::two_positions(2, 2, 3, 4)]
#[case::interior_padding(3, 3, 4, 6)]
#[case::idle_position(2, 2, 1, 4)]
#[case::even_split(4, 4, 8, 4)]
fn test_model_parallel_matches_single_device(
    #[case] world_size: usize,
    #[case] group_len: usize,
    #[case] num_tables: usize,
    #[case] batch: usize,
) {
    let reference_dir = tempfile::tempdir().unwrap();
    let mut reference = config(1, 1, num_tables, batch);
    reference.checkpoint.save_dir = Some(reference_dir.path().to_path_buf());

    let hybrid_dir = tempfile::tempdir().unwrap();
    let mut hybrid = config(world_size, group_len, num_tables, batch);
    hybrid.checkpoint.save_dir = Some(hybrid_dir.path().to_path_buf());

    let expected = launch(&reference).unwrap();
    let got = launch(&hybrid).unwrap();
    assert_eq!(got.len(), world_size);
    assert_eq!(expected[0].steps, 6);
    assert_eq!(expected[0].samples, 6 * batch);
    assert_same_run(&expected, &got);

    let reference_state = Checkpoint::load(reference_dir.path(), 0).unwrap();
    for ordinal in 0..world_size {
        let state = Checkpoint::load(hybrid_dir.path(), ordinal).unwrap();
        for (a, b) in state.bottom.layers.iter().zip(&reference_state.bottom.layers) {
            assert_close(&a.weight, &b.weight);
        }
        for (a, b) in state.top.layers.iter().zip(&reference_state.top.layers) {
            assert_close(&a.weight, &b.weight);
        }
    }

    let expected_tables = saved_tables(reference_dir.path(), 1, num_tables);
    let got_tables = saved_tables(hybrid_dir.path(), world_size, num_tables);
    for (a, b) in got_tables.iter().zip(&expected_tables) {
        assert_close(a, b);
    }
}

#[rstest]
#[case::mse(LossFunction::Mse)]
#[case::bce(LossFunction::Bce)]
#[case::wbce(LossFunction::Wbce)]
fn test_replicated_groups_match_pure_data_parallel(#[case] loss: LossFunction) {
    let mut data_parallel = config(2, 2, 3, 4);
    data_parallel.parallel.mode = ParallelMode::DataParallel;
    data_parallel.training.loss_function = loss;
    data_parallel.training.loss_weights = [0.7, 1.3];
    data_parallel.data.round_targets = true;

    let mut hybrid = data_parallel.clone();
    hybrid.parallel.world_size = 4;
    hybrid.parallel.mode = ParallelMode::Hybrid;

    let expected = launch(&data_parallel).unwrap();
    let got = launch(&hybrid).unwrap();
    assert_eq!(got.len(), 4);
    assert_same_run(&expected, &got);
}

#[test]
fn test_resume_continues_where_training_stopped() {
    let full_dir = tempfile::tempdir().unwrap();
    let mut full = config(2, 2, 3, 4);
    full.checkpoint.save_dir = Some(full_dir.path().to_path_buf());
    launch(&full).unwrap();

    let first_dir = tempfile::tempdir().unwrap();
    let mut first = config(2, 2, 3, 4);
    first.training.nepochs = 1;
    first.checkpoint.save_dir = Some(first_dir.path().to_path_buf());
    launch(&first).unwrap();

    let resumed_dir = tempfile::tempdir().unwrap();
    let mut resumed = config(2, 2, 3, 4);
    resumed.checkpoint.load_dir = Some(first_dir.path().to_path_buf());
    resumed.checkpoint.save_dir = Some(resumed_dir.path().to_path_buf());
    let summaries = launch(&resumed).unwrap();
    assert!(summaries.iter().all(|s| s.steps == 3));

    for ordinal in 0..2 {
        let expected = Checkpoint::load(full_dir.path(), ordinal).unwrap();
        let got = Checkpoint::load(resumed_dir.path(), ordinal).unwrap();
        assert_eq!(got.epoch, 2);
        assert_eq!(got.table_indices(), expected.table_indices());
        for (a, b) in got.tables.iter().zip(&expected.tables) {
            assert_close(&a.weight, &b.weight);
        }
        for (a, b) in got.top.layers.iter().zip(&expected.top.layers) {
            assert_close(&a.weight, &b.weight);
        }
    }
}

#[test]
fn test_resume_with_other_group_length_is_stale() {
    let dir = tempfile::tempdir().unwrap();
    let mut save = config(2, 2, 3, 4);
    save.checkpoint.save_dir = Some(dir.path().to_path_buf());
    launch(&save).unwrap();

    let mut load = config(2, 1, 3, 4);
    load.checkpoint.load_dir = Some(dir.path().to_path_buf());
    let err = launch(&load).unwrap_err();
    assert!(matches!(
        err,
        TrainError::Distributed(DistributedError::Config(
            ConfigError::StaleTableAssignment { .. }
        ))
    ));
}

#[test]
fn test_failing_worker_is_reported_over_disconnects() {
    let dir = tempfile::tempdir().unwrap();
    let mut save = config(1, 1, 3, 4);
    save.checkpoint.save_dir = Some(dir.path().to_path_buf());
    launch(&save).unwrap();

    // Ordinal 1 finds no record and stops; ordinal 0 loses its peer.
    let mut load = config(2, 1, 3, 4);
    load.checkpoint.load_dir = Some(dir.path().to_path_buf());
    let err = launch(&load).unwrap_err();
    assert!(matches!(err, TrainError::Io(_)), "{err:?}");
}

#[test]
fn test_inference_only_leaves_parameters_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let mut initial = config(2, 2, 3, 4);
    initial.training.nepochs = 0;
    initial.checkpoint.save_dir = Some(dir.path().to_path_buf());
    launch(&initial).unwrap();

    let after_dir = tempfile::tempdir().unwrap();
    let mut inference = config(2, 2, 3, 4);
    inference.training.inference_only = true;
    inference.checkpoint.save_dir = Some(after_dir.path().to_path_buf());
    let summaries = launch(&inference).unwrap();
    assert!(summaries.iter().all(|s| s.steps == 6 && s.loss.is_finite()));

    for ordinal in 0..2 {
        let before = Checkpoint::load(dir.path(), ordinal).unwrap();
        let mut after = Checkpoint::load(after_dir.path(), ordinal).unwrap();
        after.epoch = before.epoch;
        assert_eq!(after, before);
    }
}

#[test]
fn test_config_file_drives_a_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    config(4, 2, 5, 8).save(&path).unwrap();

    let config = DlrmConfig::load(&path).unwrap();
    assert_eq!(config.arch.embedding_sizes, vec![5, 7, 9, 11, 13]);
    let summaries = launch(&config).unwrap();
    assert_eq!(
        summaries.iter().map(|s| s.ordinal).collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );
    // Two replicas of three batches of eight, for two epochs.
    assert!(summaries.iter().all(|s| s.samples == 96));
}
