//! Split progress accounting.
//!
//! A [`SplitInfo`] identifies one mapper-produced split by the address the
//! mapper serves it from and its input split id. On the reducer side it also
//! records which blocks of the reducer's output split have arrived.

use barks_common::{Result, ShuffleError};
use bincode::{Decode, Encode};
use std::fmt;

const WORD_BITS: usize = u64::BITS as usize;

/// Fixed-length bitset, one bit per block of a split.
#[derive(Clone, PartialEq, Eq, Encode, Decode)]
pub struct BlockBitSet {
    words: Vec<u64>,
    len: usize,
}

impl BlockBitSet {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(WORD_BITS)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: usize) -> bool {
        index < self.len && self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    /// Set bit `index`, returning whether it was previously clear.
    ///
    /// Panics if `index` is out of range.
    pub fn set(&mut self, index: usize) -> bool {
        assert!(index < self.len, "bit {} out of range {}", index, self.len);
        let word = &mut self.words[index / WORD_BITS];
        let mask = 1 << (index % WORD_BITS);
        let was_clear = *word & mask == 0;
        *word |= mask;
        was_clear
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_full(&self) -> bool {
        self.count_ones() == self.len
    }

    /// Indices of the clear bits, ascending.
    pub fn iter_zeros(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |&i| !self.get(i))
    }
}

impl fmt::Debug for BlockBitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits: String = (0..self.len)
            .map(|i| if self.get(i) { '1' } else { '0' })
            .collect();
        write!(f, "BlockBitSet({})", bits)
    }
}

/// Result of recording one received block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReceipt {
    /// New block, split still incomplete.
    Accepted,
    /// Block was already recorded; nothing changed.
    Duplicate,
    /// New block that completed the split. Reported exactly once per split.
    Completed,
}

/// Where a split lives and how much of it has been transferred.
#[derive(Debug, Clone)]
pub struct SplitInfo {
    pub host_address: String,
    pub listen_port: u16,
    pub split_id: u32,
    has_splits: usize,
    has_splits_bit_vector: BlockBitSet,
    /// Blocks per output split, indexed by output split id. Mapper side only.
    pub total_blocks_per_output_split: Vec<u32>,
}

impl SplitInfo {
    /// Publication record for a partitioned source split.
    pub fn for_mapper(
        host_address: impl Into<String>,
        listen_port: u16,
        split_id: u32,
        total_blocks_per_output_split: Vec<u32>,
    ) -> Self {
        Self {
            host_address: host_address.into(),
            listen_port,
            split_id,
            has_splits: 0,
            has_splits_bit_vector: BlockBitSet::new(0),
            total_blocks_per_output_split,
        }
    }

    /// Progress record for a reducer pulling `total_blocks` blocks of input split `split_id`.
    pub fn for_reducer(
        host_address: impl Into<String>,
        listen_port: u16,
        split_id: u32,
        total_blocks: usize,
    ) -> Self {
        Self {
            host_address: host_address.into(),
            listen_port,
            split_id,
            has_splits: 0,
            has_splits_bit_vector: BlockBitSet::new(total_blocks),
            total_blocks_per_output_split: Vec::new(),
        }
    }

    pub fn peer(&self) -> String {
        format!("{}:{}", self.host_address, self.listen_port)
    }

    pub fn has_splits(&self) -> usize {
        self.has_splits
    }

    pub fn bit_vector(&self) -> &BlockBitSet {
        &self.has_splits_bit_vector
    }

    pub fn total_blocks(&self) -> usize {
        self.has_splits_bit_vector.len()
    }

    pub fn is_complete(&self) -> bool {
        self.has_splits == self.total_blocks()
    }

    /// Blocks the reducer still needs, ascending.
    pub fn missing_blocks(&self) -> Vec<u32> {
        self.has_splits_bit_vector
            .iter_zeros()
            .map(|i| i as u32)
            .collect()
    }

    /// Record the arrival of block `index`.
    ///
    /// Re-receiving a block is a no-op. An index beyond the split is a
    /// protocol violation by the sender.
    pub fn mark_received(&mut self, index: u32) -> Result<BlockReceipt> {
        let index = index as usize;
        if index >= self.total_blocks() {
            return Err(ShuffleError::protocol_error(format!(
                "block {} out of range for split {} with {} blocks",
                index,
                self.split_id,
                self.total_blocks()
            )));
        }
        if !self.has_splits_bit_vector.set(index) {
            return Ok(BlockReceipt::Duplicate);
        }
        self.has_splits += 1;
        debug_assert_eq!(self.has_splits, self.has_splits_bit_vector.count_ones());
        if self.is_complete() {
            Ok(BlockReceipt::Completed)
        } else {
            Ok(BlockReceipt::Accepted)
        }
    }
}

/// Reducer-wide view over the input splits it consumes.
#[derive(Debug, Clone)]
pub struct ReducerProgress {
    /// Blocks received from each source mapper, indexed by input split id.
    pub has_blocks_per_input_split: Vec<u32>,
    completed: Vec<bool>,
}

impl ReducerProgress {
    pub fn new(num_input_splits: usize) -> Self {
        Self {
            has_blocks_per_input_split: vec![0; num_input_splits],
            completed: vec![false; num_input_splits],
        }
    }

    pub fn record(&mut self, split: &SplitInfo) {
        let id = split.split_id as usize;
        if id < self.has_blocks_per_input_split.len() {
            self.has_blocks_per_input_split[id] = split.has_splits() as u32;
            self.completed[id] = split.is_complete();
        }
    }

    pub fn all_complete(&self) -> bool {
        self.completed.iter().all(|done| *done)
    }

    pub fn total_blocks(&self) -> u64 {
        self.has_blocks_per_input_split
            .iter()
            .map(|b| *b as u64)
            .sum()
    }
}
