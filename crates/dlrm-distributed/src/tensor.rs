use ndarray::{Array, Array2, ArrayD, Axis, Dimension, Ix2, IxDyn, Slice};

use crate::error::{CollectiveError, InvariantViolation};
use crate::sharding::ShardingSpec;

/// Represents a per-table embedding tensor distributed across the devices of a group.
///
/// A `ShardedTensor` contains a local shard of a global `(batch, embedding_dim)` tensor. Its
/// shape is checked on construction against the [`ShardingSpec`] describing how the global
/// tensor is partitioned. The collective synchronizer produces tensors sharded along the batch
/// axis; the gradient router checks the upstream gradients against the same description.
#[derive(Clone, Debug)]
pub struct ShardedTensor {
    /// Local shard of the tensor
    local_shard: Array2<f32>,
    /// Global shape of the tensor (across all devices)
    global_shape: [usize; 2],
}

impl ShardedTensor {
    /// Wraps a local shard, checking its shape against `sharding_spec`.
    pub fn new(
        local_shard: Array2<f32>,
        sharding_spec: &ShardingSpec,
        global_shape: [usize; 2],
    ) -> Result<Self, InvariantViolation> {
        let expected = sharding_spec.local_shape(&global_shape).map_err(|_| {
            InvariantViolation::UnexpectedShape {
                context: "sharded tensor",
                expected: global_shape.to_vec(),
                got: local_shard.shape().to_vec(),
            }
        })?;
        if local_shard.shape() != expected.as_slice() {
            return Err(InvariantViolation::UnexpectedShape {
                context: "sharded tensor",
                expected,
                got: local_shard.shape().to_vec(),
            });
        }

        Ok(Self {
            local_shard,
            global_shape,
        })
    }

    /// The local shard.
    pub fn local(&self) -> &Array2<f32> {
        &self.local_shard
    }

    /// Consumes the wrapper, returning the local shard.
    pub fn into_local(self) -> Array2<f32> {
        self.local_shard
    }

    /// Shape of the tensor across all devices.
    pub fn global_shape(&self) -> [usize; 2] {
        self.global_shape
    }
}

/// Contiguous sub-range `start..start + len` of `tensor` along `axis`.
pub fn narrow<D: Dimension>(
    tensor: &Array<f32, D>,
    axis: usize,
    start: usize,
    len: usize,
) -> Result<Array<f32, D>, InvariantViolation> {
    let axis_len = tensor.shape().get(axis).copied().unwrap_or(0);
    if axis >= tensor.ndim() || start + len > axis_len {
        return Err(InvariantViolation::UnexpectedShape {
            context: "narrowed axis",
            expected: vec![start + len],
            got: vec![axis_len],
        });
    }
    Ok(tensor
        .slice_axis(Axis(axis), Slice::from(start..start + len))
        .to_owned())
}

/// Stacks equally shaped 2D tensors along a new leading axis.
pub fn stack_tables(tensors: &[Array2<f32>]) -> Result<ArrayD<f32>, CollectiveError> {
    let views: Vec<_> = tensors.iter().map(|t| t.view()).collect();
    ndarray::stack(Axis(0), &views)
        .map(|stacked| stacked.into_dyn())
        .map_err(|err| CollectiveError::Malformed(err.to_string()))
}

/// Splits a tensor into 2D tensors along its leading axis, checking the trailing shape.
pub fn unstack_tables(
    tensor: &ArrayD<f32>,
    context: &'static str,
    expected: &[usize],
) -> Result<Vec<Array2<f32>>, InvariantViolation> {
    if expected.len() < 2 || tensor.shape() != expected {
        return Err(InvariantViolation::UnexpectedShape {
            context,
            expected: expected.to_vec(),
            got: tensor.shape().to_vec(),
        });
    }
    let rows = expected[expected.len() - 2];
    let cols = expected[expected.len() - 1];
    let leading: usize = expected[..expected.len() - 2].iter().product();
    // Gathers along inner axes leave the tensor in a non-standard layout.
    let standard = tensor.as_standard_layout();
    let flat = standard
        .view()
        .into_shape_with_order(IxDyn(&[leading, rows, cols]))
        .map_err(|_| InvariantViolation::UnexpectedShape {
            context,
            expected: expected.to_vec(),
            got: tensor.shape().to_vec(),
        })?;

    flat.axis_iter(Axis(0))
        .map(|table| table.to_owned().into_dimensionality::<Ix2>())
        .collect::<Result<_, _>>()
        .map_err(|_| InvariantViolation::UnexpectedShape {
            context,
            expected: expected.to_vec(),
            got: tensor.shape().to_vec(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharding::{DeviceMeshBuilder, DimDistribution, MeshDim};
    use ndarray::array;

    fn batch_spec() -> ShardingSpec {
        let mesh = DeviceMeshBuilder::new(vec![0, 1], [1, 2])
            .with_dim(0, MeshDim::data())
            .with_dim(1, MeshDim::model())
            .build()
            .unwrap();
        ShardingSpec::new(
            vec![
                DimDistribution::Sharded(MeshDim::model()),
                DimDistribution::Replicated,
            ],
            &mesh,
        )
        .unwrap()
    }

    #[test]
    fn test_sharded_tensor_accepts_matching_shard() {
        let tensor = ShardedTensor::new(Array2::zeros((2, 3)), &batch_spec(), [4, 3]).unwrap();
        assert_eq!(tensor.global_shape(), [4, 3]);
        assert_eq!(tensor.local().shape(), &[2, 3]);
    }

    #[test]
    fn test_sharded_tensor_rejects_wrong_shard() {
        let err = ShardedTensor::new(Array2::zeros((4, 3)), &batch_spec(), [4, 3]).unwrap_err();
        assert_eq!(
            err,
            InvariantViolation::UnexpectedShape {
                context: "sharded tensor",
                expected: vec![2, 3],
                got: vec![4, 3],
            }
        );
    }

    #[test]
    fn test_narrow_rows() {
        let tensor = array![[0.0, 1.0], [2.0, 3.0], [4.0, 5.0], [6.0, 7.0]];
        assert_eq!(narrow(&tensor, 0, 2, 2).unwrap(), array![[4.0, 5.0], [6.0, 7.0]]);
        assert_eq!(narrow(&tensor, 0, 0, 4).unwrap(), tensor);
    }

    #[test]
    fn test_narrow_past_the_end_is_rejected() {
        let tensor = Array2::<f32>::zeros((4, 2));
        assert_eq!(
            narrow(&tensor, 0, 3, 2),
            Err(InvariantViolation::UnexpectedShape {
                context: "narrowed axis",
                expected: vec![5],
                got: vec![4],
            })
        );
        assert!(narrow(&tensor, 2, 0, 0).is_err());
    }

    #[test]
    fn test_stack_then_unstack() {
        let tables = vec![array![[1.0, 2.0]], array![[3.0, 4.0]], array![[5.0, 6.0]]];
        let stacked = stack_tables(&tables).unwrap();
        assert_eq!(stacked.shape(), &[3, 1, 2]);

        let back = unstack_tables(&stacked, "test", &[3, 1, 2]).unwrap();
        assert_eq!(back, tables);
    }

    #[test]
    fn test_unstack_flattens_leading_axes() {
        let stacked = ArrayD::from_shape_vec(IxDyn(&[2, 2, 1, 1]), vec![1.0, 2.0, 3.0, 4.0])
            .unwrap();
        let back = unstack_tables(&stacked, "test", &[2, 2, 1, 1]).unwrap();
        assert_eq!(back.len(), 4);
        assert_eq!(back[2], array![[3.0]]);

        assert!(unstack_tables(&stacked, "test", &[4, 1, 1]).is_err());
    }

    #[test]
    fn test_unstack_after_gather_on_batch_axis() {
        // Two ranks' (T, B/2, D) gradients concatenated on the batch axis.
        let first =
            ArrayD::from_shape_fn(IxDyn(&[3, 2, 2]), |i| (i[0] * 100 + i[1] * 10 + i[2]) as f32);
        let second = first.mapv(|v| v + 1000.0);
        let gathered = ndarray::concatenate(Axis(1), &[first.view(), second.view()]).unwrap();
        assert!(!gathered.is_standard_layout());

        let tables = unstack_tables(&gathered, "test", &[3, 4, 2]).unwrap();
        assert_eq!(tables.len(), 3);
        assert_eq!(
            tables[1],
            array![[100.0, 101.0], [110.0, 111.0], [1100.0, 1101.0], [1110.0, 1111.0]]
        );
    }

    #[test]
    fn test_unstack_empty_batch_keeps_table_count() {
        let stacked = ArrayD::<f32>::zeros(IxDyn(&[3, 0, 2]));
        let tables = unstack_tables(&stacked, "test", &[3, 0, 2]).unwrap();
        assert_eq!(tables.len(), 3);
        assert!(tables.iter().all(|t| t.shape() == [0, 2]));
    }
}
