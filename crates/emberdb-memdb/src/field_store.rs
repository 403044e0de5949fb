//! Per-field segment list.
//!
//! A field store owns the segment stores of one field, sorted ascending by
//! family time. Only a few families are ever live at once (one per rollup
//! window), so a sorted vector with binary search beats a map here; the
//! insert/remove churn is once per family rollover.

use tracing::warn;

use emberdb_core::FieldValue;

use crate::block_store::BlockStore;
use crate::database::WriteContext;
use crate::flush::MetricsDataFlusher;
use crate::segment_store::SegmentStore;

#[derive(Debug)]
pub struct FieldStore {
    field_id: u16,
    /// Sorted ascending by family time; each family appears at most once.
    segments: Vec<SegmentStore>,
}

impl FieldStore {
    pub fn new(field_id: u16) -> FieldStore {
        FieldStore {
            field_id,
            segments: Vec::new(),
        }
    }

    pub fn field_id(&self) -> u16 {
        self.field_id
    }

    pub fn segments_count(&self) -> usize {
        self.segments.len()
    }

    fn position(&self, family_time: i64) -> std::result::Result<usize, usize> {
        self.segments
            .binary_search_by_key(&family_time, |s| s.family_time())
    }

    pub fn segment(&self, family_time: i64) -> Option<&SegmentStore> {
        self.position(family_time).ok().map(|idx| &self.segments[idx])
    }

    /// Write one field value into the segment of the context's family.
    /// Returns the bytes grown. Non-scalar kinds are logged and dropped.
    pub fn write(&mut self, value: &FieldValue, ctx: &WriteContext<'_>) -> usize {
        let Some(scalar) = value.scalar() else {
            warn!(field_id = self.field_id, "dropping field with non-scalar kind");
            return 0;
        };
        match self.position(ctx.family_time) {
            Ok(idx) => self.segments[idx].write_scalar(scalar, ctx.slot_index, ctx.block_store),
            Err(idx) => {
                let mut segment = SegmentStore::new(ctx.family_time, value.field_type());
                let mut grown = segment.mem_size();
                grown += segment.write_scalar(scalar, ctx.slot_index, ctx.block_store);
                self.segments.insert(idx, segment);
                grown
            }
        }
    }

    /// Pop and serialize the segment of one family. Returns the bytes
    /// reclaimed, zero when the family holds no data.
    pub fn flush_field_to(
        &mut self,
        flusher: &mut dyn MetricsDataFlusher,
        family_time: i64,
        block_store: &BlockStore,
    ) -> usize {
        let Ok(idx) = self.position(family_time) else {
            return 0;
        };
        let mut segment = self.segments.remove(idx);
        let reclaimed = segment.mem_size();
        match segment.bytes(true, block_store) {
            Some((data, _, _)) => {
                flusher.flush_field(self.field_id, data);
                reclaimed
            }
            // segment existed but never saw a write
            None => reclaimed,
        }
    }

    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<FieldStore>()
            + self.segments.iter().map(|s| s.mem_size()).sum::<usize>()
    }
}
