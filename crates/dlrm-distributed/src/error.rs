use thiserror::Error;

use crate::sharding::DeviceMeshError;

/// Result type used throughout the crate.
pub type Result<T> = core::result::Result<T, DistributedError>;

/// Static configuration errors.
///
/// These are detected while resolving the topology and partitioning the tables, before any
/// device has exchanged data, so no device ever observes a torn group.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The world has no devices.
    #[error("world size must be positive")]
    EmptyWorld,
    /// The model-parallel group length is zero.
    #[error("model-parallel group length must be positive")]
    EmptyGroup,
    /// The group length does not evenly divide the world.
    #[error("world size {world_size} is not divisible by model-parallel group length {group_len}")]
    IndivisibleWorld {
        /// Total number of devices.
        world_size: usize,
        /// Configured model-parallel group length.
        group_len: usize,
    },
    /// The global batch cannot be split evenly across the group.
    #[error("global batch size {batch_size} is not divisible by {devices} devices")]
    IndivisibleBatch {
        /// Global batch size.
        batch_size: usize,
        /// Number of devices sharing the batch.
        devices: usize,
    },
    /// The ordinal does not belong to any resolved group.
    #[error("ordinal {ordinal} not found in any model-parallel group")]
    OrdinalNotFound {
        /// The offending ordinal.
        ordinal: usize,
    },
    /// There are no embedding tables to partition.
    #[error("at least one embedding table is required")]
    NoTables,
    /// The intra-group position is not smaller than the group length.
    #[error("position {position} is out of range for group length {group_len}")]
    PositionOutOfRange {
        /// The offending position.
        position: usize,
        /// Group length.
        group_len: usize,
    },
    /// Saved table state was produced under a different table assignment.
    #[error("stale table assignment: this device owns tables {expected:?}, saved state holds {found:?}")]
    StaleTableAssignment {
        /// Tables owned under the current partition.
        expected: Vec<usize>,
        /// Tables found in the saved state.
        found: Vec<usize>,
    },
    /// The device mesh could not be built.
    #[error("invalid device mesh: {0:?}")]
    Mesh(DeviceMeshError),
}

impl From<DeviceMeshError> for ConfigError {
    fn from(err: DeviceMeshError) -> Self {
        ConfigError::Mesh(err)
    }
}

/// Invariants checked at step time.
///
/// Any of these means the group's partition state is corrupt; the step must be aborted, never
/// retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// The routed gradient count differs from the retained forward outputs.
    #[error("routed {got} table gradients but {expected} full-batch outputs were retained")]
    RoutedTableCount {
        /// Number of retained full-batch outputs.
        expected: usize,
        /// Number of gradients handed to the router.
        got: usize,
    },
    /// A tensor did not have the shape the protocol expects.
    #[error("{context}: expected shape {expected:?}, got {got:?}")]
    UnexpectedShape {
        /// Where the mismatch was detected.
        context: &'static str,
        /// Shape required by the protocol.
        expected: Vec<usize>,
        /// Shape actually observed.
        got: Vec<usize>,
    },
    /// A reorder permutation entry points past the gathered tensors.
    #[error("reorder index {index} out of range for {len} gathered tensors")]
    ReorderIndexOutOfRange {
        /// The offending index.
        index: usize,
        /// Number of gathered tensors.
        len: usize,
    },
    /// The number of per-table inputs does not match the table count.
    #[error("expected {expected} per-table inputs, got {got}")]
    TableCount {
        /// Number of tables.
        expected: usize,
        /// Number of inputs received.
        got: usize,
    },
}

/// Failures of the collective primitives.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollectiveError {
    /// A peer dropped its endpoint; the group cannot make progress.
    #[error("peer {peer} disconnected")]
    PeerDisconnected {
        /// The ordinal that went away.
        peer: usize,
    },
    /// This rank is not a member of the group it tried to communicate in.
    #[error("rank {rank} is not a member of group {group:?}")]
    NotInGroup {
        /// The calling rank.
        rank: usize,
        /// The requested group.
        group: Vec<usize>,
    },
    /// A peer executed a different collective than this rank.
    #[error("collective sequence mismatch with peer {peer}: expected {expected}, received {received}")]
    SequenceMismatch {
        /// The peer whose message was unexpected.
        peer: usize,
        /// Operation this rank is executing.
        expected: String,
        /// Operation the peer sent.
        received: String,
    },
    /// The gather axis is not a valid axis of the tensor.
    #[error("axis {axis} is out of range for a tensor of rank {ndim}")]
    InvalidAxis {
        /// Requested axis.
        axis: usize,
        /// Rank of the tensor.
        ndim: usize,
    },
    /// Contributions could not be assembled into a tensor.
    #[error("malformed contribution: {0}")]
    Malformed(String),
}

/// Violations of the embedding-bag lookup contract.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmbeddingError {
    /// A sparse index is outside the table.
    #[error("index {index} out of range for table with {num_embeddings} rows")]
    IndexOutOfRange {
        /// The offending index.
        index: usize,
        /// Number of rows in the table.
        num_embeddings: usize,
    },
    /// Offsets must start at zero, be non-decreasing and stay within the indices.
    #[error("invalid offsets: {0}")]
    InvalidOffsets(String),
    /// The upstream gradient does not match the bag count or embedding dimension.
    #[error("gradient shape {got:?} does not match expected {expected:?}")]
    GradientShape {
        /// Expected `[bags, embedding_dim]`.
        expected: [usize; 2],
        /// Observed shape.
        got: Vec<usize>,
    },
}

/// Umbrella error for the hybrid embedding protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DistributedError {
    /// Static configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Fatal step-time invariant violation.
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
    /// Collective communication failure.
    #[error(transparent)]
    Collective(#[from] CollectiveError),
    /// Embedding lookup failure.
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
}
