#![warn(missing_docs)]

//! SPMD training of a deep learning recommendation model on a hybrid data/model-parallel
//! world of in-process devices.
//!
//! Dense layers are replicated everywhere; embedding tables are sharded across each
//! model-parallel group through [`dlrm_distributed::HybridEmbedding`].

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod interaction;
pub mod loss;
pub mod mlp;
pub mod model;
pub mod scheduler;
pub mod trainer;

mod error;
mod logger;

pub use error::*;
pub use logger::*;
