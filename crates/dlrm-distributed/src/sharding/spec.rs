use hashbrown::HashMap;

use super::{DeviceMesh, DeviceMeshError, MeshDim};
use crate::error::ConfigError;

/// Specifies how a single dimension is distributed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DimDistribution {
    /// Dimension is sharded across a specific mesh dimension.
    Sharded(MeshDim),
    /// Dimension is replicated (not sharded).
    Replicated,
}

/// Describes how a tensor is distributed across devices.
///
/// Only the sizes of the mesh dimensions referenced by a [`DimDistribution::Sharded`] entry
/// are kept, which is all that is needed to derive a shard's shape from the global shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardingSpec {
    /// Distribution pattern for each tensor dimension
    dim_distributions: Vec<DimDistribution>,
    /// Sizes of the mesh dimensions this spec shards over
    mesh_sizes: HashMap<MeshDim, usize>,
}

impl ShardingSpec {
    /// Creates a spec over the given mesh.
    ///
    /// Fails if a sharded dimension is not part of the mesh.
    pub fn new<T>(
        dim_distributions: Vec<DimDistribution>,
        mesh: &DeviceMesh<T>,
    ) -> Result<Self, DeviceMeshError> {
        let mut mesh_sizes = HashMap::new();
        for distribution in dim_distributions.iter() {
            if let DimDistribution::Sharded(dim) = distribution {
                mesh_sizes.insert(dim.clone(), mesh.dim_size(dim)?);
            }
        }

        Ok(Self {
            dim_distributions,
            mesh_sizes,
        })
    }

    /// A spec where every one of the `ndim` dimensions is replicated.
    pub fn replicated(ndim: usize) -> Self {
        Self {
            dim_distributions: vec![DimDistribution::Replicated; ndim],
            mesh_sizes: HashMap::new(),
        }
    }

    /// Shape of one shard of a tensor with the given global shape.
    pub fn local_shape(&self, global_shape: &[usize]) -> Result<Vec<usize>, ConfigError> {
        global_shape
            .iter()
            .zip(self.dim_distributions.iter())
            .map(|(&size, distribution)| match distribution {
                DimDistribution::Replicated => Ok(size),
                DimDistribution::Sharded(dim) => {
                    let devices = self.mesh_sizes[dim];
                    if size % devices != 0 {
                        return Err(ConfigError::IndivisibleBatch {
                            batch_size: size,
                            devices,
                        });
                    }
                    Ok(size / devices)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharding::DeviceMeshBuilder;

    fn mesh_2x2() -> DeviceMesh<usize> {
        DeviceMeshBuilder::new(vec![0, 1, 2, 3], [2, 2])
            .with_dim(0, MeshDim::data())
            .with_dim(1, MeshDim::model())
            .build()
            .unwrap()
    }

    #[test]
    fn test_local_shape_divides_sharded_dim() {
        let spec = ShardingSpec::new(
            vec![
                DimDistribution::Sharded(MeshDim::model()),
                DimDistribution::Replicated,
            ],
            &mesh_2x2(),
        )
        .unwrap();

        assert_eq!(spec.local_shape(&[8, 16]).unwrap(), vec![4, 16]);
    }

    #[test]
    fn test_local_shape_rejects_uneven_split() {
        let spec = ShardingSpec::new(
            vec![
                DimDistribution::Sharded(MeshDim::model()),
                DimDistribution::Replicated,
            ],
            &mesh_2x2(),
        )
        .unwrap();

        assert_eq!(
            spec.local_shape(&[7, 16]),
            Err(ConfigError::IndivisibleBatch {
                batch_size: 7,
                devices: 2
            })
        );
    }

    #[test]
    fn test_replicated_spec_keeps_shape() {
        let spec = ShardingSpec::replicated(2);
        assert_eq!(spec.local_shape(&[5, 3]).unwrap(), vec![5, 3]);
    }

    #[test]
    fn test_spec_rejects_unknown_dim() {
        let spec = ShardingSpec::new(
            vec![DimDistribution::Sharded(MeshDim::new("pipeline"))],
            &mesh_2x2(),
        );
        assert!(matches!(spec, Err(DeviceMeshError::InvalidDimension(_))));
    }
}
