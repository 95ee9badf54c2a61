//! Round-robin assignment of embedding tables to positions of a model-parallel group.

use crate::error::{ConfigError, InvariantViolation};
use crate::topology::TopologyConfig;

/// Which tables a position owns, and how gathered tables map back to table order.
///
/// Table `i` is owned by position `i mod G`. Each position therefore owns either
/// `ceil(T / G)` or `ceil(T / G) - 1` tables; the latter pad their contribution to the
/// collective with one zero tensor so every position contributes the same count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TablePartition {
    num_tables: usize,
    group_len: usize,
    position: usize,
    local_table_count: usize,
    owned: Vec<usize>,
    reorder: ReorderPermutation,
}

impl TablePartition {
    /// Partitions `num_tables` tables across a group of `group_len` positions, from the point of
    /// view of `position`.
    pub fn new(num_tables: usize, position: usize, group_len: usize) -> Result<Self, ConfigError> {
        if num_tables == 0 {
            return Err(ConfigError::NoTables);
        }
        if group_len == 0 {
            return Err(ConfigError::EmptyGroup);
        }
        if position >= group_len {
            return Err(ConfigError::PositionOutOfRange {
                position,
                group_len,
            });
        }

        let local_table_count = num_tables.div_ceil(group_len);
        let owned = (position..num_tables).step_by(group_len).collect();
        let reorder = ReorderPermutation::new(num_tables, group_len, local_table_count);

        Ok(Self {
            num_tables,
            group_len,
            position,
            local_table_count,
            owned,
            reorder,
        })
    }

    /// Partition for the device described by `topology`.
    pub fn for_topology(num_tables: usize, topology: &TopologyConfig) -> Result<Self, ConfigError> {
        let partition = Self::new(num_tables, topology.position(), topology.group_len())?;
        if partition.padding_needed() {
            log::warn!(
                "{num_tables} tables do not split evenly over {} positions, padding {} slots",
                partition.group_len(),
                partition.pad_count()
            );
        }
        log::info!(
            "Ordinal {} owns tables {:?} ({} slots, {} padded)",
            topology.ordinal(),
            partition.owned_tables(),
            partition.local_table_count(),
            partition.pad_slots(),
        );
        Ok(partition)
    }

    /// Total number of tables `T`.
    pub fn num_tables(&self) -> usize {
        self.num_tables
    }

    /// Model-parallel group length `G`.
    pub fn group_len(&self) -> usize {
        self.group_len
    }

    /// Position this partition was computed for.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Tensors every position contributes to the gather, `ceil(T / G)`.
    pub fn local_table_count(&self) -> usize {
        self.local_table_count
    }

    /// Whether `G * ceil(T / G) != T`, i.e. some position contributes a pad tensor.
    pub fn padding_needed(&self) -> bool {
        self.group_len * self.local_table_count != self.num_tables
    }

    /// Number of pad slots across the whole group.
    pub fn pad_count(&self) -> usize {
        self.group_len * self.local_table_count - self.num_tables
    }

    /// Number of pad tensors this position appends.
    pub fn pad_slots(&self) -> usize {
        self.local_table_count - self.owned.len()
    }

    /// Sorted indices of the tables owned by this position.
    pub fn owned_tables(&self) -> &[usize] {
        &self.owned
    }

    /// Whether this position owns `table`.
    pub fn owns(&self, table: usize) -> bool {
        table < self.num_tables && table % self.group_len == self.position
    }

    /// Position that owns `table`.
    pub fn owner_of(&self, table: usize) -> usize {
        table % self.group_len
    }

    /// Permutation restoring table order after the gather.
    pub fn reorder(&self) -> &ReorderPermutation {
        &self.reorder
    }
}

/// Maps the device-major layout produced by the gather back to table order.
///
/// The gather yields `G * L` tensors where slot `q * L + r` holds the `r`-th tensor contributed
/// by position `q`. That tensor is table `r * G + q` when it exists, and padding otherwise.
/// Entry `k` of the permutation is the slot holding table `k`. It is built by enumerating
/// rounds `r` in `0..L`, then positions `q` in `0..G`, and truncating to the first `T`
/// entries; the truncation is the only place padding is dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReorderPermutation {
    slots: Vec<usize>,
    gathered: usize,
}

impl ReorderPermutation {
    /// Builds the permutation for `num_tables` tables over `group_len` positions that each
    /// contribute `local_table_count` tensors.
    pub fn new(num_tables: usize, group_len: usize, local_table_count: usize) -> Self {
        let slots = (0..local_table_count)
            .flat_map(|round| (0..group_len).map(move |pos| pos * local_table_count + round))
            .take(num_tables)
            .collect();

        Self {
            slots,
            gathered: group_len * local_table_count,
        }
    }

    /// Gathered slot of every table, in table order.
    pub fn as_slice(&self) -> &[usize] {
        &self.slots
    }

    /// Number of tables.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether there are no tables.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Whether the permutation leaves the gathered order unchanged.
    pub fn is_identity(&self) -> bool {
        self.slots.iter().enumerate().all(|(k, &slot)| k == slot)
    }

    /// For every gathered slot, the table it holds, or `None` for a pad slot.
    pub fn inverse(&self) -> Vec<Option<usize>> {
        let mut inverse = vec![None; self.gathered];
        for (table, &slot) in self.slots.iter().enumerate() {
            inverse[slot] = Some(table);
        }
        inverse
    }

    /// Selects the gathered items in table order.
    pub fn apply<T: Clone>(&self, gathered: &[T]) -> Result<Vec<T>, InvariantViolation> {
        self.slots
            .iter()
            .map(|&slot| {
                gathered
                    .get(slot)
                    .cloned()
                    .ok_or(InvariantViolation::ReorderIndexOutOfRange {
                        index: slot,
                        len: gathered.len(),
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn test_three_tables_over_two_positions() {
        let first = TablePartition::new(3, 0, 2).unwrap();
        let second = TablePartition::new(3, 1, 2).unwrap();

        assert_eq!(first.local_table_count(), 2);
        assert!(first.padding_needed());
        assert_eq!(first.pad_count(), 1);
        assert_eq!(first.owned_tables(), &[0, 2]);
        assert_eq!(first.pad_slots(), 0);
        assert_eq!(second.owned_tables(), &[1]);
        assert_eq!(second.pad_slots(), 1);
        assert_eq!(first.reorder().as_slice(), &[0, 2, 1]);
    }

    #[test]
    fn test_even_split_needs_no_padding() {
        let partition = TablePartition::new(6, 2, 3).unwrap();
        assert!(!partition.padding_needed());
        assert_eq!(partition.owned_tables(), &[2, 5]);
        assert_eq!(partition.reorder().as_slice(), &[0, 2, 4, 1, 3, 5]);
    }

    #[test]
    fn test_single_position_owns_everything() {
        let partition = TablePartition::new(5, 0, 1).unwrap();
        assert_eq!(partition.owned_tables(), &[0, 1, 2, 3, 4]);
        assert_eq!(partition.local_table_count(), 5);
        assert!(!partition.padding_needed());
        assert!(partition.reorder().is_identity());
    }

    #[test]
    fn test_partition_rejects_bad_config() {
        assert_eq!(TablePartition::new(0, 0, 2), Err(ConfigError::NoTables));
        assert_eq!(TablePartition::new(3, 0, 0), Err(ConfigError::EmptyGroup));
        assert_eq!(
            TablePartition::new(3, 2, 2),
            Err(ConfigError::PositionOutOfRange {
                position: 2,
                group_len: 2
            })
        );
    }

    #[rstest]
    fn test_ownership_covers_every_table_once(
        #[values(1, 2, 3, 4, 5, 7, 8, 13, 26)] num_tables: usize,
        #[values(1, 2, 3, 4, 8)] group_len: usize,
    ) {
        let mut counts = vec![0; num_tables];
        for position in 0..group_len {
            let partition = TablePartition::new(num_tables, position, group_len).unwrap();
            for &table in partition.owned_tables() {
                assert!(partition.owns(table));
                assert_eq!(partition.owner_of(table), position);
                counts[table] += 1;
            }
            assert!(partition.owned_tables().len() <= partition.local_table_count());
            assert!(partition.local_table_count() - partition.owned_tables().len() <= 1);
        }
        assert!(counts.iter().all(|&c| c == 1));
    }

    #[rstest]
    fn test_reorder_points_each_table_at_its_slot(
        #[values(1, 2, 3, 4, 5, 7, 8, 13, 26)] num_tables: usize,
        #[values(1, 2, 3, 4, 8)] group_len: usize,
    ) {
        let partition = TablePartition::new(num_tables, 0, group_len).unwrap();
        let local = partition.local_table_count();
        let reorder = partition.reorder();

        // Slot q * L + r holds the r-th table owned by position q.
        let mut layout = vec![None; group_len * local];
        for position in 0..group_len {
            let owner = TablePartition::new(num_tables, position, group_len).unwrap();
            for (round, &table) in owner.owned_tables().iter().enumerate() {
                layout[position * local + round] = Some(table);
            }
        }

        assert_eq!(reorder.len(), num_tables);
        assert_eq!(reorder.inverse(), layout);
        let restored = reorder.apply(&layout).unwrap();
        assert_eq!(restored, (0..num_tables).map(Some).collect::<Vec<_>>());
    }

    #[rstest]
    #[case(3, 2)]
    #[case(6, 3)]
    #[case(7, 2)]
    #[case(8, 8)]
    fn test_reorder_is_bijection_when_padding_trails(
        #[case] num_tables: usize,
        #[case] group_len: usize,
    ) {
        let reorder = TablePartition::new(num_tables, 0, group_len)
            .unwrap()
            .reorder()
            .clone();

        let mut sorted = reorder.as_slice().to_vec();
        sorted.sort();
        assert_eq!(sorted, (0..num_tables).collect::<Vec<_>>());

        let inverse = reorder.inverse();
        for (table, &slot) in reorder.as_slice().iter().enumerate() {
            assert_eq!(inverse[slot], Some(table));
        }
    }

    #[test]
    fn test_reorder_reaches_past_table_count_with_interior_padding() {
        // Positions 1 and 2 each pad their second slot, so table 2 lands in slot 4.
        let reorder = ReorderPermutation::new(4, 3, 2);
        assert_eq!(reorder.as_slice(), &[0, 2, 4, 1]);
        assert_eq!(
            reorder.inverse(),
            vec![Some(0), Some(3), Some(1), None, Some(2), None]
        );
    }

    #[test]
    fn test_reorder_apply_rejects_short_input() {
        let reorder = ReorderPermutation::new(3, 2, 2);
        assert_eq!(
            reorder.apply(&["a", "b"]),
            Err(InvariantViolation::ReorderIndexOutOfRange { index: 2, len: 2 })
        );
    }
}
