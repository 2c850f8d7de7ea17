//! Segment address table (C4): a per-segment lookup from a 64-bit store address to a live
//! pointer plus the region that owns it.

use parking_lot::RwLock;

use crate::address::{Address, SEGMENT_SIZE};
use crate::error::{self, Result};
use crate::region::Region;

struct Entry {
    region: Region,
    base: *const u8,
}

// SAFETY: `base` is a pointer derived from `region`'s own mapping, which `region` (an `Arc`)
// keeps alive for as long as this entry exists. Mutation of the table only ever appends new
// entries under the table's write lock; existing entries are never mutated in place.
unsafe impl Send for Entry {}
unsafe impl Sync for Entry {}

/// The table itself: one [`Entry`] per segment number, built up as regions are mapped.
///
/// Entries are appended only (never removed or replaced), mirroring "regions are never removed
/// during the lifetime of a database instance" (§3). Readers take a shared lock just long
/// enough to clone the `Arc<Region>` they need; growth under `Storage::map_bytes` takes the
/// lock briefly to push new entries.
pub struct SegmentTable {
    entries: RwLock<Vec<Entry>>,
}

impl SegmentTable {
    pub fn new() -> Self {
        SegmentTable {
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn segments_mapped(&self) -> u64 {
        self.entries.read().len() as u64
    }

    /// Slices `new_regions` into `SEGMENT_SIZE`-sized pieces and appends one entry per piece.
    /// Every region's size must already be a multiple of `SEGMENT_SIZE` (guaranteed by
    /// `RegionFactory`'s `min_size % SEGMENT_SIZE == 0` precondition), so no segment ever
    /// straddles two regions.
    pub fn extend(&self, new_regions: &[Region]) {
        let mut entries = self.entries.write();
        for region in new_regions {
            debug_assert_eq!(region.size() % SEGMENT_SIZE, 0);
            let mut offset = 0u64;
            while offset < region.size() {
                // SAFETY: `offset` stays within `[0, region.size())` by the loop condition.
                let base = unsafe { region.as_ptr().add(offset as usize) };
                entries.push(Entry {
                    region: region.clone(),
                    base,
                });
                offset += SEGMENT_SIZE;
            }
        }
    }

    /// Translates `addr` to a live pointer and the region that owns it. The returned `Region`
    /// shares ownership with the table's own entry, keeping the mapping alive for as long as
    /// the caller holds it — even across later calls to `extend` (§3 "growth safety").
    pub fn address_to_pointer(&self, addr: Address) -> Result<(*const u8, Region)> {
        let seg = addr.segment() as usize;
        let entries = self.entries.read();
        let entry = entries.get(seg).ok_or_else(|| {
            error::HeaderCorruptSnafu {
                reason: format!("address {addr} references unmapped segment {seg}"),
            }
            .build()
        })?;
        // SAFETY: `addr.offset()` is `< SEGMENT_SIZE` by construction (`Address::offset`), and
        // `entry.base` has at least `SEGMENT_SIZE` bytes of valid mapping behind it.
        let ptr = unsafe { entry.base.add(addr.offset() as usize) };
        Ok((ptr, entry.region.clone()))
    }
}

impl Default for SegmentTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::InMemoryFile;
    use crate::region::RegionFactory;

    #[test]
    fn address_to_pointer_matches_region_offset() {
        let f = InMemoryFile::with_capacity(true, 32 * 1024 * 1024);
        let factory = RegionFactory::for_memory(&f, 8 * 1024 * 1024, SEGMENT_SIZE);
        let mut regions = Vec::new();
        factory.append(&mut regions, SEGMENT_SIZE * 3, true).unwrap();

        let table = SegmentTable::new();
        table.extend(&regions);
        assert_eq!(table.segments_mapped(), 3);

        let addr = Address::from_segment_offset(1, 42);
        let (ptr, _region) = table.address_to_pointer(addr).unwrap();
        let expected = unsafe { regions[0].as_ptr().add((SEGMENT_SIZE + 42) as usize) };
        assert_eq!(ptr, expected);
    }

    #[test]
    fn unmapped_segment_is_an_error() {
        let table = SegmentTable::new();
        assert!(table
            .address_to_pointer(Address::from_segment_offset(0, 0))
            .is_err());
    }
}
