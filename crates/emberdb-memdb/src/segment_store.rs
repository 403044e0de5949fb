//! Per-(field, family) slot storage.
//!
//! A segment store holds the numeric points of one field inside one rollup
//! family. The slot buffer is borrowed from the database's [`BlockStore`]
//! on the first write and handed back when the segment is serialized with
//! `reset`, so a flushed family costs nothing until it sees data again.
//!
//! Serialized block layout, big-endian:
//!
//! ```text
//! [start_slot: u16][end_slot: u16][presence bitmap][f64 per present slot]
//! ```
//!
//! The presence bitmap covers `end_slot - start_slot + 1` slots, one bit
//! each, LSB-first within a byte.

use bytes::{BufMut, Bytes, BytesMut};

use emberdb_core::FieldType;

use crate::block_store::{Block, BlockStore};

#[derive(Debug)]
pub struct SegmentStore {
    family_time: i64,
    field_type: FieldType,
    block: Option<Block>,
}

impl SegmentStore {
    pub fn new(family_time: i64, field_type: FieldType) -> SegmentStore {
        SegmentStore {
            family_time,
            field_type,
            block: None,
        }
    }

    pub fn family_time(&self) -> i64 {
        self.family_time
    }

    /// Merge one value into a slot. Returns the bytes this write grew the
    /// store by (the block size on first write, zero afterwards).
    ///
    /// A slot outside the time window is a bug in the interval calculator
    /// upstream and panics.
    pub fn write_scalar(&mut self, value: f64, slot: u16, block_store: &BlockStore) -> usize {
        assert!(
            slot < block_store.time_window(),
            "slot {} outside time window {}",
            slot,
            block_store.time_window()
        );
        let mut grown = 0;
        let block = self.block.get_or_insert_with(|| {
            let block = block_store.acquire();
            grown = block.mem_size();
            block
        });
        block.merge(slot, value, self.field_type);
        grown
    }

    /// Earliest and latest occupied slots.
    pub fn slot_range(&self) -> Option<(u16, u16)> {
        self.block.as_ref()?.slot_range()
    }

    pub fn get(&self, slot: u16) -> Option<f64> {
        self.block.as_ref()?.get(slot)
    }

    /// Serialize the occupied slot range. With `reset` the slot buffer goes
    /// back to the pool and the store is empty afterwards. Returns `None`
    /// when no slot has been written.
    pub fn bytes(&mut self, reset: bool, block_store: &BlockStore) -> Option<(Bytes, u16, u16)> {
        let block = self.block.as_ref()?;
        let (start, end) = block.slot_range()?;
        let slots = (end - start + 1) as usize;

        let mut buf = BytesMut::with_capacity(4 + (slots + 7) / 8 + slots * 8);
        buf.put_u16(start);
        buf.put_u16(end);
        let mut bitmap = vec![0u8; (slots + 7) / 8];
        for slot in start..=end {
            if block.has_value(slot) {
                let rel = (slot - start) as usize;
                bitmap[rel / 8] |= 1 << (rel % 8);
            }
        }
        buf.put_slice(&bitmap);
        for slot in start..=end {
            if let Some(value) = block.get(slot) {
                buf.put_f64(value);
            }
        }

        if reset {
            if let Some(block) = self.block.take() {
                block_store.release(block);
            }
        }
        Some((buf.freeze(), start, end))
    }

    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<SegmentStore>()
            + self.block.as_ref().map(|b| b.mem_size()).unwrap_or(0)
    }
}
