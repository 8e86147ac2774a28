//! Block identifiers and the bit layout that packs them.
//!
//! A block id is a positive 63-bit integer made of three fields, from most
//! to least significant: sequence number, partition id, task attempt id.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypesError;

/// Identifier of a shuffle block, unique within a shuffle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct BlockId(u64);

impl BlockId {
    /// Wrap a raw id.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Return the raw 64-bit value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for BlockId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<BlockId> for u64 {
    fn from(id: BlockId) -> Self {
        id.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.0)
    }
}

/// Bit widths of the three block id fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockIdLayout {
    sequence_bits: u8,
    partition_bits: u8,
    task_attempt_bits: u8,
}

impl Default for BlockIdLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl BlockIdLayout {
    /// 18 sequence bits, 24 partition bits, 21 task attempt bits.
    pub const DEFAULT: Self = Self {
        sequence_bits: 18,
        partition_bits: 24,
        task_attempt_bits: 21,
    };

    /// Build a layout; the three widths must sum to 63 so every id stays positive.
    pub fn new(
        sequence_bits: u8,
        partition_bits: u8,
        task_attempt_bits: u8,
    ) -> Result<Self, TypesError> {
        let total = sequence_bits as u32 + partition_bits as u32 + task_attempt_bits as u32;
        if total != 63 || sequence_bits == 0 || partition_bits == 0 || task_attempt_bits == 0 {
            return Err(TypesError::InvalidLayout(total));
        }
        Ok(Self {
            sequence_bits,
            partition_bits,
            task_attempt_bits,
        })
    }

    pub fn max_sequence(&self) -> u64 {
        (1u64 << self.sequence_bits) - 1
    }

    pub fn max_partition(&self) -> u64 {
        (1u64 << self.partition_bits) - 1
    }

    pub fn max_task_attempt(&self) -> u64 {
        (1u64 << self.task_attempt_bits) - 1
    }

    /// Pack the three fields into a block id.
    pub fn block_id(
        &self,
        sequence: u64,
        partition_id: u32,
        task_attempt_id: u64,
    ) -> Result<BlockId, TypesError> {
        check_field("sequence", sequence, self.max_sequence())?;
        check_field("partition", partition_id as u64, self.max_partition())?;
        check_field("task attempt", task_attempt_id, self.max_task_attempt())?;

        let raw = (sequence << (self.partition_bits + self.task_attempt_bits))
            | ((partition_id as u64) << self.task_attempt_bits)
            | task_attempt_id;
        Ok(BlockId(raw))
    }

    pub fn sequence(&self, id: BlockId) -> u64 {
        (id.0 >> (self.partition_bits + self.task_attempt_bits)) & self.max_sequence()
    }

    pub fn partition_id(&self, id: BlockId) -> u32 {
        ((id.0 >> self.task_attempt_bits) & self.max_partition()) as u32
    }

    pub fn task_attempt_id(&self, id: BlockId) -> u64 {
        id.0 & self.max_task_attempt()
    }
}

fn check_field(field: &'static str, value: u64, max: u64) -> Result<(), TypesError> {
    if value > max {
        return Err(TypesError::LayoutOverflow { field, value, max });
    }
    Ok(())
}
