//! Resolution of the device world into model-parallel and data-parallel groups.
//!
//! The world is arranged as a 2D [`DeviceMesh`] of shape `[world_size / G, G]` whose first
//! dimension is [`MeshDim::data`] and second is [`MeshDim::model`]. Each mesh row is a
//! model-parallel group (one full replica of every embedding table, one shard per device) and
//! each column is a data-parallel group (the same shard across replicas).
//!
//! Resolution is a pure function of static configuration: every device computes the same
//! groups without communicating.

use core::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::sharding::{DeviceMesh, DeviceMeshBuilder, DimDistribution, MeshDim, ShardingSpec};

/// How the embedding tables are distributed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelMode {
    /// Every device holds every table; the group length is forced to 1.
    DataParallel,
    /// Tables are sharded across model-parallel groups of the configured length.
    #[default]
    Hybrid,
}

/// Devices that jointly host one replica of all embedding tables, sorted by ordinal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelParallelGroup(Vec<usize>);

/// Devices sharing the same position across all model-parallel groups.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataParallelGroup(Vec<usize>);

macro_rules! group_accessors {
    ($group:ident) => {
        impl $group {
            /// Member ordinals, ordered by rank within the group.
            pub fn ranks(&self) -> &[usize] {
                &self.0
            }

            /// Number of members.
            pub fn len(&self) -> usize {
                self.0.len()
            }

            /// Whether the group has no members.
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }

            /// Index of the ordinal within the group.
            pub fn position_of(&self, ordinal: usize) -> Option<usize> {
                self.0.iter().position(|&rank| rank == ordinal)
            }
        }
    };
}

group_accessors!(ModelParallelGroup);
group_accessors!(DataParallelGroup);

/// The groups of the whole world.
#[derive(Clone, Debug)]
pub struct Topology {
    mesh: DeviceMesh<usize>,
    model_groups: Vec<ModelParallelGroup>,
    data_groups: Vec<DataParallelGroup>,
}

impl Topology {
    /// Partitions `0..world_size` into model-parallel groups of length `group_len` and the
    /// complementary data-parallel groups.
    ///
    /// In [`ParallelMode::DataParallel`] the group length is ignored and taken to be 1.
    pub fn resolve(
        world_size: usize,
        group_len: usize,
        mode: ParallelMode,
    ) -> Result<Self, ConfigError> {
        let group_len = match mode {
            ParallelMode::DataParallel => 1,
            ParallelMode::Hybrid => group_len,
        };
        if world_size == 0 {
            return Err(ConfigError::EmptyWorld);
        }
        if group_len == 0 {
            return Err(ConfigError::EmptyGroup);
        }
        if world_size % group_len != 0 {
            return Err(ConfigError::IndivisibleWorld {
                world_size,
                group_len,
            });
        }

        let mesh = DeviceMeshBuilder::new(
            (0..world_size).collect(),
            [world_size / group_len, group_len],
        )
        .with_dim(0, MeshDim::data())
        .with_dim(1, MeshDim::model())
        .build()?;

        let model_groups = mesh
            .groups_along(&MeshDim::model())?
            .into_iter()
            .map(ModelParallelGroup)
            .collect();
        let data_groups = mesh
            .groups_along(&MeshDim::data())?
            .into_iter()
            .map(DataParallelGroup)
            .collect();

        Ok(Self {
            mesh,
            model_groups,
            data_groups,
        })
    }

    /// All model-parallel groups, ordered by replica index.
    pub fn model_groups(&self) -> &[ModelParallelGroup] {
        &self.model_groups
    }

    /// All data-parallel groups, ordered by intra-group position.
    pub fn data_groups(&self) -> &[DataParallelGroup] {
        &self.data_groups
    }

    /// The underlying device mesh.
    pub fn mesh(&self) -> &DeviceMesh<usize> {
        &self.mesh
    }

    /// Model-parallel group length.
    pub fn group_len(&self) -> usize {
        self.mesh.shape()[1]
    }

    /// Total number of devices.
    pub fn world_size(&self) -> usize {
        self.mesh.devices().len()
    }
}

/// The contiguous range of the global batch owned by one device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchSlice {
    start: usize,
    len: usize,
    global: usize,
}

impl BatchSlice {
    /// The slice of a `global_batch` split evenly across `group_len` devices, for the device at
    /// `position`.
    pub fn for_position(
        global_batch: usize,
        group_len: usize,
        position: usize,
    ) -> Result<Self, ConfigError> {
        if group_len == 0 {
            return Err(ConfigError::EmptyGroup);
        }
        if position >= group_len {
            return Err(ConfigError::PositionOutOfRange {
                position,
                group_len,
            });
        }
        if global_batch % group_len != 0 {
            return Err(ConfigError::IndivisibleBatch {
                batch_size: global_batch,
                devices: group_len,
            });
        }
        let len = global_batch / group_len;
        Ok(Self {
            start: position * len,
            len,
            global: global_batch,
        })
    }

    /// First global row of the slice.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Number of rows in the slice, the local batch size.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the slice is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the global batch the slice was cut from.
    pub fn global(&self) -> usize {
        self.global
    }

    /// Half-open global row range.
    pub fn range(&self) -> Range<usize> {
        self.start..self.start + self.len
    }

    /// Whether the slice is the whole batch.
    pub fn is_full(&self) -> bool {
        self.len == self.global
    }
}

/// Immutable per-device view of the resolved topology.
///
/// Built once at setup and passed by reference to every component of the protocol.
#[derive(Clone, Debug)]
pub struct TopologyConfig {
    ordinal: usize,
    mode: ParallelMode,
    position: usize,
    replica: usize,
    model_group: ModelParallelGroup,
    data_group: DataParallelGroup,
    batch_spec: ShardingSpec,
    topology: Topology,
}

impl TopologyConfig {
    /// Resolves the topology and locates `ordinal` in it.
    pub fn new(
        ordinal: usize,
        world_size: usize,
        group_len: usize,
        mode: ParallelMode,
    ) -> Result<Self, ConfigError> {
        let topology = Topology::resolve(world_size, group_len, mode)?;

        let (replica, position) = topology
            .model_groups()
            .iter()
            .enumerate()
            .find_map(|(replica, group)| {
                group.position_of(ordinal).map(|position| (replica, position))
            })
            .ok_or(ConfigError::OrdinalNotFound { ordinal })?;
        let model_group = topology.model_groups()[replica].clone();
        let data_group = topology.data_groups()[position].clone();
        let batch_spec = ShardingSpec::new(
            vec![
                DimDistribution::Sharded(MeshDim::model()),
                DimDistribution::Replicated,
            ],
            topology.mesh(),
        )?;

        log::info!(
            "Ordinal {ordinal}: replica {replica}, position {position}, model-parallel group {:?}, data-parallel group {:?}",
            model_group.ranks(),
            data_group.ranks(),
        );

        Ok(Self {
            ordinal,
            mode,
            position,
            replica,
            model_group,
            data_group,
            batch_spec,
            topology,
        })
    }

    /// Global rank of this device.
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Total number of devices.
    pub fn world_size(&self) -> usize {
        self.topology.world_size()
    }

    /// Parallel mode the topology was resolved with.
    pub fn mode(&self) -> ParallelMode {
        self.mode
    }

    /// Model-parallel group length `G`.
    pub fn group_len(&self) -> usize {
        self.model_group.len()
    }

    /// Position of this device within its model-parallel group.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Index of this device's model-parallel group, which selects its data shard.
    pub fn replica(&self) -> usize {
        self.replica
    }

    /// Number of model-parallel groups, i.e. data replicas.
    pub fn num_replicas(&self) -> usize {
        self.topology.model_groups().len()
    }

    /// This device's model-parallel group.
    pub fn model_group(&self) -> &ModelParallelGroup {
        &self.model_group
    }

    /// This device's data-parallel group.
    pub fn data_group(&self) -> &DataParallelGroup {
        &self.data_group
    }

    /// The whole-world topology.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Whether the embedding protocol degenerates to the single-device path (`G == 1`).
    pub fn is_degenerate(&self) -> bool {
        self.group_len() == 1
    }

    /// The rows of a global batch this device is responsible for.
    pub fn batch_slice(&self, global_batch: usize) -> Result<BatchSlice, ConfigError> {
        BatchSlice::for_position(global_batch, self.group_len(), self.position)
    }

    /// Sharding of a per-table embedding tensor after the batch has been narrowed.
    pub fn local_batch_spec(&self) -> &ShardingSpec {
        &self.batch_spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn ranks<G, F: Fn(&G) -> &[usize]>(groups: &[G], f: F) -> Vec<Vec<usize>> {
        groups.iter().map(|g| f(g).to_vec()).collect()
    }

    #[test]
    fn test_resolve_four_devices_groups_of_two() {
        let topology = Topology::resolve(4, 2, ParallelMode::Hybrid).unwrap();

        assert_eq!(
            ranks(topology.model_groups(), ModelParallelGroup::ranks),
            vec![vec![0, 1], vec![2, 3]]
        );
        assert_eq!(
            ranks(topology.data_groups(), DataParallelGroup::ranks),
            vec![vec![0, 2], vec![1, 3]]
        );
    }

    #[test]
    fn test_resolve_rejects_indivisible_world() {
        let err = Topology::resolve(4, 3, ParallelMode::Hybrid).unwrap_err();
        assert_eq!(
            err,
            ConfigError::IndivisibleWorld {
                world_size: 4,
                group_len: 3
            }
        );
    }

    #[test]
    fn test_resolve_rejects_empty_inputs() {
        assert_eq!(
            Topology::resolve(0, 1, ParallelMode::Hybrid).unwrap_err(),
            ConfigError::EmptyWorld
        );
        assert_eq!(
            Topology::resolve(4, 0, ParallelMode::Hybrid).unwrap_err(),
            ConfigError::EmptyGroup
        );
    }

    #[test]
    fn test_data_parallel_mode_forces_singleton_groups() {
        let topology = Topology::resolve(3, 3, ParallelMode::DataParallel).unwrap();

        assert_eq!(topology.group_len(), 1);
        assert_eq!(
            ranks(topology.model_groups(), ModelParallelGroup::ranks),
            vec![vec![0], vec![1], vec![2]]
        );
        assert_eq!(
            ranks(topology.data_groups(), DataParallelGroup::ranks),
            vec![vec![0, 1, 2]]
        );
    }

    #[rstest]
    #[case(1, 1)]
    #[case(4, 1)]
    #[case(4, 2)]
    #[case(4, 4)]
    #[case(6, 3)]
    #[case(8, 2)]
    fn test_groups_partition_the_world(#[case] world_size: usize, #[case] group_len: usize) {
        let topology = Topology::resolve(world_size, group_len, ParallelMode::Hybrid).unwrap();

        let mut seen: Vec<usize> = topology
            .model_groups()
            .iter()
            .flat_map(|g| g.ranks().to_vec())
            .collect();
        seen.sort();
        assert_eq!(seen, (0..world_size).collect::<Vec<_>>());

        for group in topology.data_groups() {
            assert_eq!(group.len(), world_size / group_len);
        }
        for group in topology.model_groups() {
            assert_eq!(group.len(), group_len);
            assert!(group.ranks().windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_topology_config_locates_ordinal() {
        let config = TopologyConfig::new(3, 4, 2, ParallelMode::Hybrid).unwrap();

        assert_eq!(config.position(), 1);
        assert_eq!(config.replica(), 1);
        assert_eq!(config.model_group().ranks(), &[2, 3]);
        assert_eq!(config.data_group().ranks(), &[1, 3]);
        assert_eq!(config.num_replicas(), 2);
        assert!(!config.is_degenerate());
    }

    #[test]
    fn test_topology_config_unknown_ordinal() {
        let err = TopologyConfig::new(4, 4, 2, ParallelMode::Hybrid).unwrap_err();
        assert_eq!(err, ConfigError::OrdinalNotFound { ordinal: 4 });
    }

    #[test]
    fn test_batch_slice_for_second_position() {
        let slice = BatchSlice::for_position(8, 2, 1).unwrap();
        assert_eq!(slice.len(), 4);
        assert_eq!(slice.range(), 4..8);
        assert!(!slice.is_full());
    }

    #[test]
    fn test_batch_slice_rejects_uneven_batch() {
        assert_eq!(
            BatchSlice::for_position(9, 2, 0).unwrap_err(),
            ConfigError::IndivisibleBatch {
                batch_size: 9,
                devices: 2
            }
        );
    }

    #[test]
    fn test_local_batch_spec_shards_rows() {
        let config = TopologyConfig::new(0, 4, 2, ParallelMode::Hybrid).unwrap();
        assert_eq!(config.local_batch_spec().local_shape(&[8, 3]).unwrap(), vec![4, 3]);

        let single = TopologyConfig::new(0, 1, 1, ParallelMode::Hybrid).unwrap();
        assert!(single.is_degenerate());
        assert_eq!(single.local_batch_spec().local_shape(&[8, 3]).unwrap(), vec![8, 3]);
    }
}
