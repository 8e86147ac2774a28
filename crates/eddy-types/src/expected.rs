//! Compact sets of block ids.

use std::fmt;

use croaring::Treemap;

use crate::block_id::BlockId;

/// The set of block ids a reader must see for one partition.
///
/// Backed by a 64-bit roaring bitmap so that millions of ids per partition
/// stay small in memory.
#[derive(Clone)]
pub struct ExpectedBlockSet {
    bitmap: Treemap,
}

impl ExpectedBlockSet {
    pub fn new() -> Self {
        Self {
            bitmap: Treemap::new(),
        }
    }

    pub fn insert(&mut self, id: BlockId) {
        self.bitmap.add(id.as_u64());
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.bitmap.contains(id.as_u64())
    }

    pub fn len(&self) -> u64 {
        self.bitmap.cardinality()
    }

    pub fn is_empty(&self) -> bool {
        self.bitmap.is_empty()
    }

    /// Add every id of `other` to this set.
    pub fn union_with(&mut self, other: &ExpectedBlockSet) {
        self.bitmap.or_inplace(&other.bitmap);
    }

    /// Iterate ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.bitmap.iter().map(BlockId::new)
    }
}

impl Default for ExpectedBlockSet {
    fn default() -> Self {
        Self::new()
    }
}

impl FromIterator<BlockId> for ExpectedBlockSet {
    fn from_iter<T: IntoIterator<Item = BlockId>>(iter: T) -> Self {
        let mut set = Self::new();
        for id in iter {
            set.insert(id);
        }
        set
    }
}

impl Extend<BlockId> for ExpectedBlockSet {
    fn extend<T: IntoIterator<Item = BlockId>>(&mut self, iter: T) {
        for id in iter {
            self.insert(id);
        }
    }
}

impl PartialEq for ExpectedBlockSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|id| other.contains(id))
    }
}

impl Eq for ExpectedBlockSet {}

impl fmt::Debug for ExpectedBlockSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpectedBlockSet")
            .field("len", &self.len())
            .finish()
    }
}
