//! Per-device checkpoints.
//!
//! Every device writes its own MessagePack record `rank-<ordinal>.mpk` into a shared
//! directory. A record only holds the tables the device owned when it was written, so it can
//! only be restored under the same table assignment.

use std::path::{Path, PathBuf};

use dlrm_distributed::ConfigError;
use dlrm_distributed::embedding::EmbeddingTable;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::TrainError;
use crate::mlp::{Activation, Mlp, MlpState};
use crate::model::DlrmModel;

/// Weights of one owned embedding table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableRecord {
    /// Global table index.
    pub table: usize,
    /// `(rows, embedding_dim)` weights.
    pub weight: Array2<f32>,
}

/// Training position and parameters of one device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Ordinal that wrote the record.
    pub ordinal: usize,
    /// Epoch of the next batch to run.
    pub epoch: usize,
    /// Index of the next batch to run within `epoch`.
    pub iteration: usize,
    /// Bottom MLP parameters.
    pub bottom: MlpState,
    /// Top MLP parameters.
    pub top: MlpState,
    /// Owned tables, in ascending table order.
    pub tables: Vec<TableRecord>,
}

/// Location of the record of `ordinal` in `dir`.
pub fn checkpoint_path(dir: &Path, ordinal: usize) -> PathBuf {
    dir.join(format!("rank-{ordinal}.mpk"))
}

impl Checkpoint {
    /// Snapshot of `model`, to be resumed at `(epoch, iteration)`.
    pub fn capture(model: &DlrmModel, epoch: usize, iteration: usize) -> Self {
        let embedding = model.embedding();
        let tables = embedding
            .partition()
            .owned_tables()
            .iter()
            .zip(embedding.tables())
            .map(|(&table, weights)| TableRecord {
                table,
                weight: weights.weight().clone(),
            })
            .collect();

        Self {
            ordinal: model.topology().ordinal(),
            epoch,
            iteration,
            bottom: model.bottom().state(),
            top: model.top().state(),
            tables,
        }
    }

    /// Writes the record into `dir`, creating the directory if needed.
    pub fn save(&self, dir: &Path) -> Result<PathBuf, TrainError> {
        std::fs::create_dir_all(dir)?;
        let path = checkpoint_path(dir, self.ordinal);
        std::fs::write(&path, rmp_serde::to_vec_named(self)?)?;
        log::info!("Saved checkpoint of ordinal {} to {}", self.ordinal, path.display());
        Ok(path)
    }

    /// Reads the record of `ordinal` from `dir`.
    pub fn load(dir: &Path, ordinal: usize) -> Result<Self, TrainError> {
        let path = checkpoint_path(dir, ordinal);
        let bytes = std::fs::read(&path)?;
        let checkpoint: Self = rmp_serde::from_slice(&bytes)?;
        log::info!(
            "Loaded checkpoint of ordinal {} from {} (epoch {}, iteration {})",
            ordinal,
            path.display(),
            checkpoint.epoch,
            checkpoint.iteration
        );
        Ok(checkpoint)
    }

    /// Global indices of the saved tables.
    pub fn table_indices(&self) -> Vec<usize> {
        self.tables.iter().map(|t| t.table).collect()
    }

    /// Loads the parameters into `model`.
    ///
    /// Fails with [`ConfigError::StaleTableAssignment`] when the model's device owns a
    /// different set of tables than the one that wrote the record.
    pub fn restore(self, model: &mut DlrmModel) -> Result<(), TrainError> {
        let expected = model.embedding().partition().owned_tables().to_vec();
        let found = self.table_indices();
        if expected != found {
            return Err(ConfigError::StaleTableAssignment { expected, found }.into());
        }

        let (bottom, top, embedding) = model.parts_mut();
        let restored_bottom = restore_mlp(bottom, self.bottom, "bottom")?;
        let restored_top = restore_mlp(top, self.top, "top")?;
        embedding.replace_tables(
            self.tables
                .into_iter()
                .map(|record| EmbeddingTable::from_weight(record.weight))
                .collect(),
        )?;
        *bottom = restored_bottom;
        *top = restored_top;
        Ok(())
    }
}

fn restore_mlp(current: &Mlp, state: MlpState, name: &str) -> Result<Mlp, TrainError> {
    let sigmoid_layer = current
        .layers()
        .iter()
        .position(|l| l.activation() == Activation::Sigmoid);
    let restored = Mlp::from_state(state, sigmoid_layer)?;
    if restored.widths() != current.widths() {
        return Err(TrainError::InvalidConfig(format!(
            "saved {name} MLP has widths {:?}, configured {:?}",
            restored.widths(),
            current.widths()
        )));
    }
    Ok(restored)
}
