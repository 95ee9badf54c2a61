use async_channel::{Receiver, Sender};
use derive_new::new;
use ndarray::{ArrayD, Axis, IxDyn};

use super::{Collective, CollectiveOp, group_position};
use crate::error::CollectiveError;

/// One device's contribution to a collective, as sent over the wire.
#[derive(new, Debug)]
struct Envelope {
    op: CollectiveOp,
    shape: Vec<usize>,
    data: Vec<f32>,
}

/// In-process collective endpoint.
///
/// [`LocalCollective::world`] connects `n` endpoints with one FIFO channel per ordered pair of
/// ranks. Each endpoint is meant to be moved to its own thread. Since every device executes
/// the same sequence of collectives, the `k`-th message on a channel always belongs to the
/// `k`-th collective the two devices share; a tag check turns any divergence into
/// [`CollectiveError::SequenceMismatch`] instead of silently mixing data.
///
/// Dropping an endpoint closes its channels, so peers blocked on it fail with
/// [`CollectiveError::PeerDisconnected`].
#[derive(Debug)]
pub struct LocalCollective {
    rank: usize,
    world_size: usize,
    /// Indexed by destination rank.
    outboxes: Vec<Sender<Envelope>>,
    /// Indexed by source rank.
    inboxes: Vec<Receiver<Envelope>>,
}

impl LocalCollective {
    /// Creates the connected endpoints of a world of `world_size` devices, ordered by rank.
    pub fn world(world_size: usize) -> Vec<Self> {
        let mut outboxes: Vec<Vec<Sender<Envelope>>> =
            (0..world_size).map(|_| Vec::with_capacity(world_size)).collect();
        let mut inboxes: Vec<Vec<Receiver<Envelope>>> =
            (0..world_size).map(|_| Vec::with_capacity(world_size)).collect();

        for src in 0..world_size {
            for dst in 0..world_size {
                let (tx, rx) = async_channel::unbounded();
                outboxes[src].push(tx);
                inboxes[dst].push(rx);
            }
        }

        outboxes
            .into_iter()
            .zip(inboxes)
            .enumerate()
            .map(|(rank, (outboxes, inboxes))| Self {
                rank,
                world_size,
                outboxes,
                inboxes,
            })
            .collect()
    }

    /// Sends this device's contribution to every other member and collects all contributions
    /// in group order.
    fn exchange(
        &self,
        op: CollectiveOp,
        shape: &[usize],
        data: Vec<f32>,
        group: &[usize],
    ) -> Result<Vec<Envelope>, CollectiveError> {
        for &peer in group.iter().filter(|&&peer| peer != self.rank) {
            self.outbox(peer)?
                .send_blocking(Envelope::new(op, shape.to_vec(), data.clone()))
                .map_err(|_| CollectiveError::PeerDisconnected { peer })?;
        }

        let mut own = Some(Envelope::new(op, shape.to_vec(), data));
        let mut contributions = Vec::with_capacity(group.len());
        for &peer in group {
            if peer == self.rank {
                if let Some(envelope) = own.take() {
                    contributions.push(envelope);
                }
                continue;
            }

            let envelope = self
                .inbox(peer)?
                .recv_blocking()
                .map_err(|_| CollectiveError::PeerDisconnected { peer })?;
            if envelope.op != op {
                return Err(CollectiveError::SequenceMismatch {
                    peer,
                    expected: op.to_string(),
                    received: envelope.op.to_string(),
                });
            }
            if envelope.shape != shape {
                return Err(CollectiveError::Malformed(format!(
                    "{op} from peer {peer} has shape {:?}, expected {:?}",
                    envelope.shape, shape
                )));
            }
            contributions.push(envelope);
        }

        log::trace!(
            "Rank {} completed {op} over {:?} ({} elements each)",
            self.rank,
            group,
            shape.iter().product::<usize>()
        );

        Ok(contributions)
    }

    fn outbox(&self, peer: usize) -> Result<&Sender<Envelope>, CollectiveError> {
        self.outboxes
            .get(peer)
            .ok_or(CollectiveError::PeerDisconnected { peer })
    }

    fn inbox(&self, peer: usize) -> Result<&Receiver<Envelope>, CollectiveError> {
        self.inboxes
            .get(peer)
            .ok_or(CollectiveError::PeerDisconnected { peer })
    }
}

impl Collective for LocalCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_gather(
        &self,
        tensor: ArrayD<f32>,
        axis: usize,
        group: &[usize],
    ) -> Result<ArrayD<f32>, CollectiveError> {
        group_position(self.rank, group)?;
        if axis >= tensor.ndim() {
            return Err(CollectiveError::InvalidAxis {
                axis,
                ndim: tensor.ndim(),
            });
        }
        if group.len() == 1 {
            return Ok(tensor);
        }

        let shape = tensor.shape().to_vec();
        let data = tensor.iter().copied().collect();
        let contributions =
            self.exchange(CollectiveOp::AllGather { axis }, &shape, data, group)?;

        let parts = contributions
            .into_iter()
            .map(|envelope| ArrayD::from_shape_vec(IxDyn(&envelope.shape), envelope.data))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| CollectiveError::Malformed(err.to_string()))?;
        let views: Vec<_> = parts.iter().map(|part| part.view()).collect();

        ndarray::concatenate(Axis(axis), &views)
            .map_err(|err| CollectiveError::Malformed(err.to_string()))
    }

    fn all_reduce_sum(&self, buf: &mut [f32], group: &[usize]) -> Result<(), CollectiveError> {
        group_position(self.rank, group)?;
        if group.len() == 1 {
            return Ok(());
        }

        let contributions =
            self.exchange(CollectiveOp::AllReduceSum, &[buf.len()], buf.to_vec(), group)?;

        buf.fill(0.0);
        for envelope in contributions {
            for (acc, value) in buf.iter_mut().zip(envelope.data) {
                *acc += value;
            }
        }

        Ok(())
    }
}
