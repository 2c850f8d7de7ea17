//! The trailer (footer) record published at the end of every committed transaction (§3).
//!
//! A trailer is self-identifying (its own magic, independent of the leader) and fixed-size, so
//! a tool can walk the revision chain backwards from any trailer address without reference to
//! the leader. The handful of named indices the HAMT layer would populate are out of scope here
//! (§1); this crate carries their extents as opaque slots so a future index layer has somewhere
//! to plug in without changing the trailer's on-disk shape.

use byteorder::{ByteOrder, LittleEndian};

use crate::address::{Address, Extent};
use crate::error::{self, Result};

/// Number of named-index slots carried by every trailer. The HAMT-backed indices themselves
/// (name index, content index, ...) are out of scope (§1); this is just their extent table.
pub const NUM_INDEXES: usize = 4;

pub const TRAILER_MAGIC: u64 = 0x5452_4149_4c45_5230; // ASCII-ish "TRAILER0"

const GENERATION_OFFSET: usize = 8;
const PREVIOUS_OFFSET: usize = 16;
const TIMESTAMP_OFFSET: usize = 24;
const SIZE_OFFSET: usize = 32;
const CRC_OFFSET: usize = 36;
const INDEXES_OFFSET: usize = 40;

/// Total on-disk size of a trailer record, fixed because [`NUM_INDEXES`] is fixed.
pub const TRAILER_SIZE: u64 = (INDEXES_OFFSET + NUM_INDEXES * 16) as u64;

/// Sentinel generation/address meaning "no previous trailer" — used only by revision 0, the
/// empty store.
pub const NO_PREVIOUS: Address = Address::null();

/// One committed revision's published state.
#[derive(Debug, Clone, Copy)]
pub struct Trailer {
    pub generation: u64,
    pub previous: Address,
    /// Seconds since the Unix epoch; zero means "not recorded".
    pub timestamp: u64,
    pub indexes: [Extent; NUM_INDEXES],
}

impl Trailer {
    /// The trailer for the empty store: generation 0, no previous, no indices populated.
    pub fn empty(timestamp: u64) -> Self {
        Trailer {
            generation: 0,
            previous: NO_PREVIOUS,
            timestamp,
            indexes: [Extent::default(); NUM_INDEXES],
        }
    }

    /// Builds the trailer that follows `self` in the revision chain, pointing back at
    /// `self_addr` (`self`'s own, now-committed, address) and carrying `indexes` as the new
    /// revision's index extents.
    pub fn next(&self, self_addr: Address, indexes: [Extent; NUM_INDEXES], timestamp: u64) -> Self {
        Trailer {
            generation: self.generation + 1,
            previous: self_addr,
            timestamp,
            indexes,
        }
    }
}

/// Serializes `trailer` into `buf` (which must be at least [`TRAILER_SIZE`] bytes), computing
/// and writing its CRC.
pub fn write_to(buf: &mut [u8], trailer: &Trailer) {
    assert!(buf.len() as u64 >= TRAILER_SIZE);
    LittleEndian::write_u64(&mut buf[0..8], TRAILER_MAGIC);
    LittleEndian::write_u64(
        &mut buf[GENERATION_OFFSET..GENERATION_OFFSET + 8],
        trailer.generation,
    );
    LittleEndian::write_u64(
        &mut buf[PREVIOUS_OFFSET..PREVIOUS_OFFSET + 8],
        trailer.previous.absolute(),
    );
    LittleEndian::write_u64(
        &mut buf[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 8],
        trailer.timestamp,
    );
    LittleEndian::write_u32(&mut buf[SIZE_OFFSET..SIZE_OFFSET + 4], TRAILER_SIZE as u32);

    for (i, extent) in trailer.indexes.iter().enumerate() {
        let off = INDEXES_OFFSET + i * 16;
        LittleEndian::write_u64(&mut buf[off..off + 8], extent.addr.absolute());
        LittleEndian::write_u64(&mut buf[off + 8..off + 16], extent.size);
    }

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[0..CRC_OFFSET]);
    hasher.update(&buf[INDEXES_OFFSET..TRAILER_SIZE as usize]);
    let crc = hasher.finalize();
    LittleEndian::write_u32(&mut buf[CRC_OFFSET..CRC_OFFSET + 4], crc);
}

/// Parses and validates a trailer from `buf` (at least [`TRAILER_SIZE`] bytes).
pub fn read_from(buf: &[u8]) -> Result<Trailer> {
    if (buf.len() as u64) < TRAILER_SIZE {
        return error::HeaderCorruptSnafu {
            reason: "buffer too small to hold a trailer".to_string(),
        }
        .fail();
    }

    let magic = LittleEndian::read_u64(&buf[0..8]);
    if magic != TRAILER_MAGIC {
        return error::HeaderCorruptSnafu {
            reason: "trailer signature mismatch".to_string(),
        }
        .fail();
    }

    let size = LittleEndian::read_u32(&buf[SIZE_OFFSET..SIZE_OFFSET + 4]);
    if u64::from(size) != TRAILER_SIZE {
        return error::HeaderCorruptSnafu {
            reason: format!("trailer declares size {size}, expected {TRAILER_SIZE}"),
        }
        .fail();
    }

    let crc = LittleEndian::read_u32(&buf[CRC_OFFSET..CRC_OFFSET + 4]);
    if !cfg!(feature = "no-crc-checks") {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf[0..CRC_OFFSET]);
        hasher.update(&buf[INDEXES_OFFSET..TRAILER_SIZE as usize]);
        let expected = hasher.finalize();
        if crc != expected {
            return error::HeaderCorruptSnafu {
                reason: format!("trailer CRC mismatch: found {crc:#x}, expected {expected:#x}"),
            }
            .fail();
        }
    }

    let generation = LittleEndian::read_u64(&buf[GENERATION_OFFSET..GENERATION_OFFSET + 8]);
    let previous = Address::new(LittleEndian::read_u64(
        &buf[PREVIOUS_OFFSET..PREVIOUS_OFFSET + 8],
    ));
    let timestamp = LittleEndian::read_u64(&buf[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 8]);

    let mut indexes = [Extent::default(); NUM_INDEXES];
    for (i, slot) in indexes.iter_mut().enumerate() {
        let off = INDEXES_OFFSET + i * 16;
        let addr = Address::new(LittleEndian::read_u64(&buf[off..off + 8]));
        let size = LittleEndian::read_u64(&buf[off + 8..off + 16]);
        *slot = Extent::new(addr, size);
    }

    Ok(Trailer {
        generation,
        previous,
        timestamp,
        indexes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_generation_zero() {
        let mut buf = vec![0u8; TRAILER_SIZE as usize];
        let trailer = Trailer::empty(12345);
        write_to(&mut buf, &trailer);
        let parsed = read_from(&buf).unwrap();
        assert_eq!(parsed.generation, 0);
        assert!(parsed.previous.is_null());
        assert_eq!(parsed.timestamp, 12345);
    }

    #[test]
    fn chains_generation_and_previous_address() {
        let mut buf0 = vec![0u8; TRAILER_SIZE as usize];
        let t0 = Trailer::empty(1);
        write_to(&mut buf0, &t0);

        let t0_addr = Address::new(64);
        let t1 = t0.next(t0_addr, [Extent::default(); NUM_INDEXES], 2);
        let mut buf1 = vec![0u8; TRAILER_SIZE as usize];
        write_to(&mut buf1, &t1);
        let parsed = read_from(&buf1).unwrap();
        assert_eq!(parsed.generation, 1);
        assert_eq!(parsed.previous, t0_addr);
    }

    #[test]
    fn rejects_corrupted_trailer_bytes() {
        let mut buf = vec![0u8; TRAILER_SIZE as usize];
        write_to(&mut buf, &Trailer::empty(0));
        buf[GENERATION_OFFSET] ^= 0xFF;
        assert!(matches!(
            read_from(&buf),
            Err(crate::error::Error::HeaderCorrupt { .. })
        ));
    }
}
