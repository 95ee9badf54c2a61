//! Backward half of the hybrid protocol.
//!
//! The forward pass split every table's output by batch rows; parameter updates need the whole
//! batch. The router therefore gathers the gradients back along the batch axis, the mirror of
//! the forward narrow, then keeps the owned tables, the mirror of the forward partition.

use ndarray::Array2;

use crate::collective::Collective;
use crate::embedding::LocalEmbeddings;
use crate::error::{DistributedError, InvariantViolation};
use crate::partition::TablePartition;
use crate::tensor::{stack_tables, unstack_tables};
use crate::topology::TopologyConfig;

/// Full-batch gradient of one owned table.
#[derive(Clone, Debug, PartialEq)]
pub struct RoutedGradient {
    /// Global table index.
    pub table: usize,
    /// Gradient of the table's `(B, D)` output.
    pub grad: Array2<f32>,
}

/// Sends upstream gradients to the devices owning each table.
#[derive(Clone, Copy, Debug)]
pub struct GradientRouter<'a> {
    topology: &'a TopologyConfig,
    partition: &'a TablePartition,
}

impl<'a> GradientRouter<'a> {
    /// Router for the device described by `topology`.
    pub fn new(topology: &'a TopologyConfig, partition: &'a TablePartition) -> Self {
        Self {
            topology,
            partition,
        }
    }

    /// Routes the `T` local-batch gradients `(B / G, D)` to full-batch gradients of the owned
    /// tables, matched with the forward outputs retained in `retained`.
    ///
    /// Blocks until every member of the model-parallel group has contributed.
    pub fn route(
        &self,
        collective: &dyn Collective,
        grads: &[Array2<f32>],
        retained: &LocalEmbeddings,
    ) -> Result<Vec<RoutedGradient>, DistributedError> {
        let num_tables = self.partition.num_tables();
        if grads.len() != num_tables {
            return Err(InvariantViolation::TableCount {
                expected: num_tables,
                got: grads.len(),
            }
            .into());
        }

        let global_batch = retained.global_batch();
        let embedding_dim = retained.embedding_dim();
        let local_shape = self
            .topology
            .local_batch_spec()
            .local_shape(&[global_batch, embedding_dim])?;
        if let Some(grad) = grads.iter().find(|g| g.shape() != local_shape.as_slice()) {
            return Err(InvariantViolation::UnexpectedShape {
                context: "upstream embedding gradient",
                expected: local_shape,
                got: grad.shape().to_vec(),
            }
            .into());
        }

        let full = if self.topology.is_degenerate() {
            grads.to_vec()
        } else {
            let full_shape = retained.spec().local_shape(&[global_batch, embedding_dim])?;
            let stacked = stack_tables(grads)?;
            let gathered =
                collective.all_gather(stacked, 1, self.topology.model_group().ranks())?;
            unstack_tables(
                &gathered,
                "gathered gradients",
                &[num_tables, full_shape[0], full_shape[1]],
            )?
        };

        let selected = self.select_own(full);
        Ok(self.dispatch(selected, retained)?)
    }

    /// Keeps the gradients of the tables this position owns, in table order.
    pub fn select_own(&self, full: Vec<Array2<f32>>) -> Vec<Array2<f32>> {
        full.into_iter()
            .enumerate()
            .filter(|(table, _)| self.partition.owns(*table))
            .map(|(_, grad)| grad)
            .collect()
    }

    /// Pairs selected gradients with the retained forward outputs, one to one.
    ///
    /// A count mismatch means the partition state is corrupt and fails the step.
    pub fn dispatch(
        &self,
        selected: Vec<Array2<f32>>,
        retained: &LocalEmbeddings,
    ) -> Result<Vec<RoutedGradient>, InvariantViolation> {
        if selected.len() != retained.outputs().len() {
            return Err(InvariantViolation::RoutedTableCount {
                expected: retained.outputs().len(),
                got: selected.len(),
            });
        }

        let routed = retained
            .tables()
            .iter()
            .zip(selected)
            .map(|(&table, grad)| RoutedGradient { table, grad })
            .collect::<Vec<_>>();
        log::debug!(
            "Ordinal {} routed gradients of tables {:?}",
            self.topology.ordinal(),
            retained.tables()
        );
        Ok(routed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::LocalCollective;
    use crate::embedding::{EmbeddingTable, LocalEmbeddingExecutor, SparseFeature};
    use crate::topology::ParallelMode;
    use std::thread;

    /// Gradient of `table` at global batch row `row`, column `col`.
    fn grad_value(table: usize, row: usize, col: usize) -> f32 {
        (table * 100 + row * 10 + col) as f32
    }

    fn retained(partition: &TablePartition, global_batch: usize) -> LocalEmbeddings {
        let tables: Vec<_> = partition
            .owned_tables()
            .iter()
            .map(|_| EmbeddingTable::from_weight(Array2::ones((1, 2))))
            .collect();
        let features: Vec<_> = (0..partition.num_tables())
            .map(|_| SparseFeature::from_bags(vec![vec![0]; global_batch]))
            .collect();
        LocalEmbeddingExecutor::new(partition, 2)
            .run(&tables, &features)
            .unwrap()
    }

    #[test]
    fn test_dispatch_rejects_short_gradient_set() {
        let topology = TopologyConfig::new(0, 2, 2, ParallelMode::Hybrid).unwrap();
        let partition = TablePartition::for_topology(3, &topology).unwrap();
        let retained = retained(&partition, 2);
        let router = GradientRouter::new(&topology, &partition);

        let short = vec![Array2::zeros((2, 2)); partition.local_table_count() - 1];
        assert_eq!(
            router.dispatch(short, &retained),
            Err(InvariantViolation::RoutedTableCount {
                expected: 2,
                got: 1
            })
        );
    }

    #[test]
    fn test_select_own_keeps_owned_tables() {
        let topology = TopologyConfig::new(1, 2, 2, ParallelMode::Hybrid).unwrap();
        let partition = TablePartition::for_topology(3, &topology).unwrap();
        let router = GradientRouter::new(&topology, &partition);

        let full: Vec<_> = (0..3).map(|t| Array2::from_elem((1, 1), t as f32)).collect();
        assert_eq!(router.select_own(full), vec![Array2::from_elem((1, 1), 1.0)]);
    }

    #[test]
    fn test_single_device_routes_every_table_unchanged() {
        let topology = TopologyConfig::new(0, 1, 1, ParallelMode::Hybrid).unwrap();
        let partition = TablePartition::for_topology(2, &topology).unwrap();
        let retained = retained(&partition, 3);
        let grads = vec![Array2::from_elem((3, 2), 0.5), Array2::from_elem((3, 2), 2.0)];

        let world = LocalCollective::world(1);
        let routed = GradientRouter::new(&topology, &partition)
            .route(&world[0], &grads, &retained)
            .unwrap();

        assert_eq!(routed.len(), 2);
        assert_eq!(routed[1].table, 1);
        assert_eq!(routed[1].grad, grads[1]);
    }

    #[test]
    fn test_wrong_gradient_shape_is_rejected() {
        let topology = TopologyConfig::new(0, 1, 1, ParallelMode::Hybrid).unwrap();
        let partition = TablePartition::for_topology(1, &topology).unwrap();
        let retained = retained(&partition, 3);

        let world = LocalCollective::world(1);
        let err = GradientRouter::new(&topology, &partition)
            .route(&world[0], &[Array2::zeros((2, 2))], &retained)
            .unwrap_err();
        assert_eq!(
            err,
            DistributedError::Invariant(InvariantViolation::UnexpectedShape {
                context: "upstream embedding gradient",
                expected: vec![3, 2],
                got: vec![2, 2],
            })
        );
    }

    #[test]
    fn test_two_positions_gather_full_batch_gradients() {
        let (num_tables, global_batch, dim) = (3, 4, 2);
        let world = LocalCollective::world(2);

        let routed: Vec<Vec<RoutedGradient>> = thread::scope(|scope| {
            let handles: Vec<_> = world
                .into_iter()
                .map(|c| {
                    scope.spawn(move || {
                        let ordinal = c.rank();
                        let topology =
                            TopologyConfig::new(ordinal, 2, 2, ParallelMode::Hybrid).unwrap();
                        let partition =
                            TablePartition::for_topology(num_tables, &topology).unwrap();
                        let retained = retained(&partition, global_batch);

                        // Rows `2 * ordinal..2 * ordinal + 2` of the batch live on this device.
                        let grads: Vec<_> = (0..num_tables)
                            .map(|t| {
                                Array2::from_shape_fn((2, dim), |(i, d)| {
                                    grad_value(t, 2 * ordinal + i, d)
                                })
                            })
                            .collect();
                        GradientRouter::new(&topology, &partition)
                            .route(&c, &grads, &retained)
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let full =
            |t: usize| Array2::from_shape_fn((global_batch, dim), |(g, d)| grad_value(t, g, d));
        assert_eq!(routed[0].iter().map(|r| r.table).collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(routed[0][0].grad, full(0));
        assert_eq!(routed[0][1].grad, full(2));
        assert_eq!(routed[1].iter().map(|r| r.table).collect::<Vec<_>>(), vec![1]);
        assert_eq!(routed[1][0].grad, full(1));
    }

    #[test]
    fn test_empty_batch_routes_empty_gradients() {
        let world = LocalCollective::world(2);
        let routed: Vec<Vec<RoutedGradient>> = thread::scope(|scope| {
            let handles: Vec<_> = world
                .into_iter()
                .map(|c| {
                    scope.spawn(move || {
                        let topology =
                            TopologyConfig::new(c.rank(), 2, 2, ParallelMode::Hybrid).unwrap();
                        let partition = TablePartition::for_topology(3, &topology).unwrap();
                        let retained = retained(&partition, 0);
                        let grads = vec![Array2::zeros((0, 2)); 3];
                        GradientRouter::new(&topology, &partition)
                            .route(&c, &grads, &retained)
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(routed[0].len(), 2);
        assert_eq!(routed[1].len(), 1);
        assert!(routed.iter().flatten().all(|r| r.grad.shape() == [0, 2]));
    }
}
