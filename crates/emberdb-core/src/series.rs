//! Series-level primitives shared by the index and the query side.

use std::collections::BTreeMap;
use std::fmt;

use roaring::RoaringBitmap;

/// The logical creation time of a tag index, epoch milliseconds.
///
/// Version 0 is reserved for the placeholder index that stands in an empty
/// immutable slot; a real index never carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version(pub i64);

impl Version {
    pub const NOP: Version = Version(0);

    pub fn is_nop(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An inclusive timestamp range, epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    pub fn new(start: i64, end: i64) -> TimeRange {
        TimeRange { start, end }
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Series ids grouped by tag-index version.
///
/// A metric can hold two live index versions (mutable plus a flushing
/// immutable one), so every series lookup answers with one bitmap per
/// version it matched in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultiVersionSeriesIdSet {
    versions: BTreeMap<Version, RoaringBitmap>,
}

impl MultiVersionSeriesIdSet {
    pub fn new() -> MultiVersionSeriesIdSet {
        MultiVersionSeriesIdSet::default()
    }

    /// Merge a bitmap for a version; unions with any bitmap already present.
    pub fn add(&mut self, version: Version, bitmap: RoaringBitmap) {
        match self.versions.entry(version) {
            std::collections::btree_map::Entry::Occupied(mut existing) => {
                *existing.get_mut() |= bitmap;
            }
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(bitmap);
            }
        }
    }

    pub fn get(&self, version: Version) -> Option<&RoaringBitmap> {
        self.versions.get(&version)
    }

    pub fn versions(&self) -> impl Iterator<Item = (&Version, &RoaringBitmap)> {
        self.versions.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.values().all(|bitmap| bitmap.is_empty())
    }

    /// Total series count across all versions.
    pub fn len(&self) -> u64 {
        self.versions.values().map(|bitmap| bitmap.len()).sum()
    }
}
