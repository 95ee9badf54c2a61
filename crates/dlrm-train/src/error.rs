use dlrm_distributed::{
    CollectiveError, ConfigError, DistributedError, EmbeddingError, InvariantViolation,
};
use thiserror::Error;

/// Errors of the training system.
#[derive(Error, Debug)]
pub enum TrainError {
    /// Failure of the embedding protocol or its static configuration.
    #[error(transparent)]
    Distributed(#[from] DistributedError),
    /// A configuration value is out of range or inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Backward was called without a preceding forward pass.
    #[error("{0}: backward called without a cached forward pass")]
    MissingForward(&'static str),
    /// Reading or writing a file failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// A configuration file could not be parsed or written.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// A checkpoint could not be encoded.
    #[error("failed to encode checkpoint: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    /// A checkpoint could not be decoded.
    #[error("failed to decode checkpoint: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    /// The logging subscriber could not be installed.
    #[error("failed to initialize logging: {0}")]
    Logging(String),
    /// A worker thread panicked.
    #[error("worker {ordinal} panicked")]
    WorkerPanic {
        /// Ordinal of the worker.
        ordinal: usize,
    },
}

macro_rules! via_distributed {
    ($($err:ty),*) => {
        $(
            impl From<$err> for TrainError {
                fn from(err: $err) -> Self {
                    TrainError::Distributed(err.into())
                }
            }
        )*
    };
}

via_distributed!(ConfigError, InvariantViolation, CollectiveError, EmbeddingError);
