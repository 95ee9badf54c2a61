//! SPMD training loop.
//!
//! [`launch`] runs one worker thread per ordinal. Workers share nothing but their
//! [`LocalCollective`] endpoints and execute the same sequence of collectives.

use std::thread;
use std::time::Instant;

use dlrm_distributed::collective::{Collective, LocalCollective};
use dlrm_distributed::{CollectiveError, DistributedError, TopologyConfig};

use crate::checkpoint::Checkpoint;
use crate::config::DlrmConfig;
use crate::data::SyntheticDataset;
use crate::error::TrainError;
use crate::model::{DlrmModel, StepOutput};
use crate::scheduler::LrPolicy;

/// What one worker reports after the run.
#[derive(Clone, Debug, PartialEq)]
pub struct TrainingSummary {
    /// Ordinal of the worker.
    pub ordinal: usize,
    /// Steps executed in this run.
    pub steps: usize,
    /// Samples processed by the whole world in this run.
    pub samples: usize,
    /// Mean loss over the world in the last reporting window.
    pub loss: f32,
    /// Accuracy over the world in the last reporting window.
    pub accuracy: f32,
}

/// Loss, hits and sample counts accumulated between two reports.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct Metrics {
    loss_sum: f32,
    correct: usize,
    samples: usize,
}

impl Metrics {
    fn record(&mut self, step: &StepOutput) {
        self.loss_sum += step.loss * step.samples as f32;
        self.correct += step.correct;
        self.samples += step.samples;
    }

    /// Sums the window over every device.
    fn reduce(self, collective: &dyn Collective) -> Result<Self, CollectiveError> {
        let world: Vec<usize> = (0..collective.world_size()).collect();
        let mut buf = [self.loss_sum, self.correct as f32, self.samples as f32];
        collective.all_reduce_sum(&mut buf, &world)?;
        Ok(Self {
            loss_sum: buf[0],
            correct: buf[1].round() as usize,
            samples: buf[2].round() as usize,
        })
    }

    fn loss(&self) -> f32 {
        self.loss_sum / self.samples.max(1) as f32
    }

    fn accuracy(&self) -> f32 {
        self.correct as f32 / self.samples.max(1) as f32
    }
}

/// Trains on `world_size` in-process devices and returns every worker's summary, ordered by
/// ordinal.
///
/// A failing worker drops its endpoint, so its peers fail at their next collective with a peer
/// disconnect. Any other error is reported in preference to those.
pub fn launch(config: &DlrmConfig) -> Result<Vec<TrainingSummary>, TrainError> {
    config.validate()?;
    let endpoints = LocalCollective::world(config.parallel.world_size);

    let results: Vec<Result<TrainingSummary, TrainError>> = thread::scope(|scope| {
        let handles = endpoints
            .into_iter()
            .enumerate()
            .map(|(ordinal, collective)| {
                let handle = thread::Builder::new()
                    .name(format!("rank-{ordinal}"))
                    .spawn_scoped(scope, move || run_worker(config, collective))?;
                Ok((ordinal, handle))
            })
            .collect::<Result<Vec<_>, std::io::Error>>();

        match handles {
            Ok(handles) => handles
                .into_iter()
                .map(|(ordinal, handle)| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(TrainError::WorkerPanic { ordinal }))
                })
                .collect(),
            Err(err) => vec![Err(err.into())],
        }
    });

    let mut summaries = Vec::with_capacity(results.len());
    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(summary) => summaries.push(summary),
            Err(err) => {
                log::error!("{err}");
                errors.push(err);
            }
        }
    }

    if errors.is_empty() {
        return Ok(summaries);
    }
    let root = errors
        .iter()
        .position(|err| !is_peer_disconnect(err))
        .unwrap_or(0);
    Err(errors.swap_remove(root))
}

fn is_peer_disconnect(err: &TrainError) -> bool {
    matches!(
        err,
        TrainError::Distributed(DistributedError::Collective(
            CollectiveError::PeerDisconnected { .. }
        ))
    )
}

/// Training loop of one device.
pub fn run_worker(
    config: &DlrmConfig,
    collective: LocalCollective,
) -> Result<TrainingSummary, TrainError> {
    let ordinal = collective.rank();
    let topology = TopologyConfig::new(
        ordinal,
        config.parallel.world_size,
        config.parallel.model_parallel_group_len,
        config.parallel.mode,
    )?;
    let replica = topology.replica();
    let mut model = DlrmModel::new(config, topology)?;
    let policy = LrPolicy::from_config(&config.training)?;
    let data = SyntheticDataset::new(config);
    let num_batches = data.num_batches();
    let print_freq = config.training.print_freq;
    let inference_only = config.training.inference_only;

    let (mut start_epoch, mut start_iteration) = (0, 0);
    if let Some(dir) = &config.checkpoint.load_dir {
        let checkpoint = Checkpoint::load(dir, ordinal)?;
        (start_epoch, start_iteration) = (checkpoint.epoch, checkpoint.iteration);
        checkpoint.restore(&mut model)?;
    }
    if start_iteration >= num_batches {
        start_epoch += start_iteration / num_batches.max(1);
        start_iteration = 0;
    }

    log::info!(
        "Ordinal {ordinal} owns tables {:?}; starting at epoch {start_epoch}, iteration {start_iteration}",
        model.embedding().partition().owned_tables()
    );

    let mut summary = TrainingSummary {
        ordinal,
        steps: 0,
        samples: 0,
        loss: 0.0,
        accuracy: 0.0,
    };
    let mut window = Metrics::default();
    let mut window_steps = 0;
    let mut window_start = Instant::now();

    for epoch in start_epoch..config.training.nepochs {
        let first = if epoch == start_epoch { start_iteration } else { 0 };
        for iteration in first..num_batches {
            let batch = data.batch(replica, iteration);
            let step = epoch * num_batches + iteration + 1;
            let lr = policy.lr_at(step);

            let output = if inference_only {
                model.eval_step(&collective, &batch)?
            } else {
                model.train_step(&collective, &batch, lr)?
            };
            window.record(&output);
            window_steps += 1;
            summary.steps += 1;

            let last = iteration + 1 == num_batches;
            if (iteration + 1) % print_freq == 0 || last {
                let reduced = window.reduce(&collective)?;
                if ordinal == 0 {
                    let ms_per_it =
                        window_start.elapsed().as_secs_f64() * 1000.0 / window_steps as f64;
                    log::info!(
                        "Finished {} it {}/{} of epoch {}, {:.2} ms/it, lr {:.6}, loss {:.6}, accuracy {:3.3} %, {} samples",
                        if inference_only { "inference" } else { "training" },
                        iteration + 1,
                        num_batches,
                        epoch,
                        ms_per_it,
                        lr,
                        reduced.loss(),
                        reduced.accuracy() * 100.0,
                        reduced.samples
                    );
                }
                summary.samples += reduced.samples;
                summary.loss = reduced.loss();
                summary.accuracy = reduced.accuracy();

                window = Metrics::default();
                window_steps = 0;
                window_start = Instant::now();
            }
        }
    }

    if let Some(dir) = &config.checkpoint.save_dir {
        Checkpoint::capture(&model, config.training.nepochs.max(start_epoch), 0).save(dir)?;
    }

    Ok(summary)
}
