#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Hybrid data-parallel / model-parallel embedding synchronization.
//!
//! Devices are arranged in model-parallel groups that jointly host one replica of every
//! embedding table, and data-parallel groups that hold the same tables for different batches.
//! A training step runs the owned tables' lookups on the full batch, all-gathers the results
//! over the model-parallel group and keeps this device's batch rows of every table. The
//! backward pass mirrors it: gradients are gathered back to full batch size and routed to the
//! tables' owners.

mod error;
mod hybrid;
mod partition;
mod replicator;
mod router;
mod sync;
mod tensor;
mod topology;

pub mod collective;
pub mod embedding;
pub mod sharding;

pub use error::*;
pub use hybrid::*;
pub use partition::*;
pub use replicator::*;
pub use router::*;
pub use sync::*;
pub use tensor::*;
pub use topology::*;
