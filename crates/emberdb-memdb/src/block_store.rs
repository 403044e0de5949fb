//! Reusable slot buffers.
//!
//! Every segment store needs a fixed-width `f64` buffer of one time window.
//! Families roll over constantly, so instead of allocating and dropping
//! those buffers, a database-wide pool hands them out and takes them back
//! at flush. The pool is a plain mutex-guarded freelist; acquire/release
//! happen once per (series, field, family), not per point.

use parking_lot::Mutex;

use emberdb_core::FieldType;

/// How many spare blocks the pool keeps before letting returns drop.
const MAX_POOLED_BLOCKS: usize = 1024;

/// A fixed-width slot buffer: one `f64` per slot plus an occupancy bitset.
#[derive(Debug)]
pub struct Block {
    values: Vec<f64>,
    occupied: Vec<u64>,
}

impl Block {
    fn new(time_window: u16) -> Block {
        Block {
            values: vec![0.0; time_window as usize],
            occupied: vec![0; (time_window as usize + 63) / 64],
        }
    }

    pub fn has_value(&self, slot: u16) -> bool {
        self.occupied[slot as usize / 64] & (1 << (slot as usize % 64)) != 0
    }

    pub fn get(&self, slot: u16) -> Option<f64> {
        if self.has_value(slot) {
            Some(self.values[slot as usize])
        } else {
            None
        }
    }

    /// Write a value into a slot, merging with the field's aggregation when
    /// the slot is already occupied.
    pub fn merge(&mut self, slot: u16, value: f64, field_type: FieldType) {
        let idx = slot as usize;
        if self.has_value(slot) {
            self.values[idx] = field_type.agg(self.values[idx], value);
        } else {
            self.values[idx] = value;
            self.occupied[idx / 64] |= 1 << (idx % 64);
        }
    }

    /// Earliest and latest occupied slots, `None` when the block is empty.
    pub fn slot_range(&self) -> Option<(u16, u16)> {
        let mut start = None;
        let mut end = None;
        for (word_idx, word) in self.occupied.iter().enumerate() {
            if *word == 0 {
                continue;
            }
            let first = word_idx as u32 * 64 + word.trailing_zeros();
            let last = word_idx as u32 * 64 + 63 - word.leading_zeros();
            if start.is_none() {
                start = Some(first as u16);
            }
            end = Some(last as u16);
        }
        Some((start?, end?))
    }

    fn reset(&mut self) {
        self.occupied.fill(0);
    }

    pub fn mem_size(&self) -> usize {
        self.values.len() * 8 + self.occupied.len() * 8 + std::mem::size_of::<Block>()
    }
}

/// Pool of [`Block`]s for one time window, shared by every metric store of a
/// memory database.
#[derive(Debug)]
pub struct BlockStore {
    time_window: u16,
    freelist: Mutex<Vec<Block>>,
}

impl BlockStore {
    pub fn new(time_window: u16) -> BlockStore {
        BlockStore {
            time_window,
            freelist: Mutex::new(Vec::new()),
        }
    }

    pub fn time_window(&self) -> u16 {
        self.time_window
    }

    pub fn acquire(&self) -> Block {
        if let Some(block) = self.freelist.lock().pop() {
            return block;
        }
        Block::new(self.time_window)
    }

    pub fn release(&self, mut block: Block) {
        block.reset();
        let mut freelist = self.freelist.lock();
        if freelist.len() < MAX_POOLED_BLOCKS {
            freelist.push(block);
        }
    }
}
