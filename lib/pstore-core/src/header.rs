//! The leader (C3 §3 "File layout"): the fixed-size record at file offset 0 that carries the
//! store's identity and the atomic pointer to the current trailer.
//!
//! The leader is always written and read through plain byte offsets with explicit
//! little-endian encoding (never a `repr(C)` struct cast) so that the on-disk format is fixed
//! regardless of host endianness, per §6.

use std::sync::atomic::{AtomicU64, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use uuid::Uuid;

use crate::error::{self, Result};

/// First half of the leader's two-part signature. Chosen arbitrarily; what matters is that it
/// is vanishingly unlikely to appear at the start of an unrelated file.
pub const MAGIC1: u64 = 0x5053_544f_5245_4442; // ASCII-ish "PSTOREDB"
/// Second half of the leader's signature.
pub const MAGIC2: u64 = 0x4c45_4144_4552_3031; // ASCII-ish "LEADER01"

pub const CURRENT_MAJOR: u16 = 1;
pub const CURRENT_MINOR: u16 = 0;

/// Total size in bytes of the leader record, including reserved padding. Rounded up from its
/// packed field width (56 bytes) to a tidy power-of-two-friendly 64 so there is headroom for a
/// future field without shifting `FOOTER_POS_OFFSET`.
pub const HEADER_SIZE: u64 = 64;

const UUID_OFFSET: usize = 24;
const CRC_OFFSET: usize = 40;
/// Offset of the atomic footer pointer. Must stay 8-byte aligned — §6 requires the footer
/// publication to be a single atomic 8-byte write.
pub const FOOTER_POS_OFFSET: usize = 48;

const _: () = assert!(FOOTER_POS_OFFSET % 8 == 0);
const _: () = assert!(HEADER_SIZE >= (FOOTER_POS_OFFSET as u64) + 8);

/// The portion of the leader covered by `crc`: everything up to (but excluding) the CRC field
/// itself. `footer_pos` is deliberately outside this range — it changes on every commit, and
/// recomputing a CRC over it would defeat the single-atomic-write publication contract.
const CRC_COVERED_LEN: usize = CRC_OFFSET;

/// The parsed, validated contents of a store's leader.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub uuid: Uuid,
}

/// Serializes a brand-new leader for `uuid` into `buf` (which must be at least [`HEADER_SIZE`]
/// bytes). `footer_pos` is left at zero; the caller (`Database::build_new_store`) fills it in
/// once the initial revision-0 trailer has been written and its address is known.
pub fn write_new(buf: &mut [u8], uuid: Uuid) {
    assert!(buf.len() as u64 >= HEADER_SIZE);
    LittleEndian::write_u64(&mut buf[0..8], MAGIC1);
    LittleEndian::write_u64(&mut buf[8..16], MAGIC2);
    LittleEndian::write_u32(&mut buf[16..20], HEADER_SIZE as u32);
    LittleEndian::write_u16(&mut buf[20..22], CURRENT_MAJOR);
    LittleEndian::write_u16(&mut buf[22..24], CURRENT_MINOR);
    buf[UUID_OFFSET..UUID_OFFSET + 16].copy_from_slice(uuid.as_bytes());

    let crc = crc32fast::hash(&buf[0..CRC_COVERED_LEN]);
    LittleEndian::write_u32(&mut buf[CRC_OFFSET..CRC_OFFSET + 4], crc);
    LittleEndian::write_u64(&mut buf[FOOTER_POS_OFFSET..FOOTER_POS_OFFSET + 8], 0);
}

/// Validates a leader read from `buf`, checking signatures, declared size, version, and CRC.
///
/// `buf` must be at least [`HEADER_SIZE`] bytes. Returns [`crate::error::Error::HeaderCorrupt`]
/// on a signature/CRC mismatch and [`crate::error::Error::HeaderVersionMismatch`] on a
/// size/version mismatch.
pub fn validate(buf: &[u8]) -> Result<Header> {
    if (buf.len() as u64) < HEADER_SIZE {
        return error::HeaderCorruptSnafu {
            reason: "file too small to hold a leader".to_string(),
        }
        .fail();
    }

    let magic1 = LittleEndian::read_u64(&buf[0..8]);
    let magic2 = LittleEndian::read_u64(&buf[8..16]);
    if magic1 != MAGIC1 || magic2 != MAGIC2 {
        return error::HeaderCorruptSnafu {
            reason: "leader signature mismatch".to_string(),
        }
        .fail();
    }

    let found_size = LittleEndian::read_u32(&buf[16..20]);
    let found_major = LittleEndian::read_u16(&buf[20..22]);
    let found_minor = LittleEndian::read_u16(&buf[22..24]);
    if u64::from(found_size) != HEADER_SIZE || found_major != CURRENT_MAJOR {
        return error::HeaderVersionMismatchSnafu {
            found_major,
            found_minor,
            found_size,
            expected_major: CURRENT_MAJOR,
            expected_minor: CURRENT_MINOR,
            expected_size: HEADER_SIZE as u32,
        }
        .fail();
    }

    let crc = LittleEndian::read_u32(&buf[CRC_OFFSET..CRC_OFFSET + 4]);
    let expected_crc = crc32fast::hash(&buf[0..CRC_COVERED_LEN]);
    if !cfg!(feature = "no-crc-checks") && crc != expected_crc {
        return error::HeaderCorruptSnafu {
            reason: format!("leader CRC mismatch: found {crc:#x}, expected {expected_crc:#x}"),
        }
        .fail();
    }

    let uuid = Uuid::from_bytes(
        buf[UUID_OFFSET..UUID_OFFSET + 16]
            .try_into()
            .expect("slice is exactly 16 bytes"),
    );

    Ok(Header { uuid })
}

/// Patches the footer-pointer field of an as-yet-unmapped leader buffer (used only by
/// `Database::build_new_store`, before the file has ever been mapped — at that point there is
/// no atomic to write through, just plain bytes about to be flushed to disk).
pub fn write_footer_pos_into_bytes(buf: &mut [u8], value: u64) {
    LittleEndian::write_u64(&mut buf[FOOTER_POS_OFFSET..FOOTER_POS_OFFSET + 8], value);
}

/// Borrows the atomic footer pointer out of a mapped leader. `leader_ptr` must point at the
/// start of a mapped leader at least [`HEADER_SIZE`] bytes long, and must outlive the returned
/// reference (callers keep the owning region alive for as long as the database is open).
///
/// # Safety
/// `leader_ptr` must be valid, `FOOTER_POS_OFFSET`-aligned (guaranteed since the leader is
/// always mapped at file offset 0, itself page-aligned), and non-aliased by any non-atomic
/// access to the same bytes.
pub unsafe fn footer_pos_atomic<'a>(leader_ptr: *const u8) -> &'a AtomicU64 {
    &*(leader_ptr.add(FOOTER_POS_OFFSET) as *const AtomicU64)
}

/// Loads the current footer pointer with acquire ordering, so that every byte it references is
/// already visible to this thread (§5 "Ordering guarantees").
///
/// # Safety
/// Same contract as [`footer_pos_atomic`].
pub unsafe fn load_footer_pos(leader_ptr: *const u8) -> u64 {
    footer_pos_atomic(leader_ptr).load(Ordering::Acquire)
}

/// Publishes a new footer pointer with release ordering. This must be the *last* mutation of
/// any commit (§4.6).
///
/// # Safety
/// Same contract as [`footer_pos_atomic`].
pub unsafe fn store_footer_pos(leader_ptr: *const u8, value: u64) {
    footer_pos_atomic(leader_ptr).store(value, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_freshly_written_leader() {
        let mut buf = vec![0u8; HEADER_SIZE as usize];
        let uuid = Uuid::from_u128(0x1234_5678_9abc_def0_1234_5678_9abc_def0);
        write_new(&mut buf, uuid);
        let header = validate(&buf).unwrap();
        assert_eq!(header.uuid, uuid);
    }

    #[test]
    fn rejects_a_flipped_signature_byte() {
        let mut buf = vec![0u8; HEADER_SIZE as usize];
        write_new(&mut buf, Uuid::nil());
        buf[0] ^= 0xFF;
        assert!(matches!(
            validate(&buf),
            Err(crate::error::Error::HeaderCorrupt { .. })
        ));
    }

    #[test]
    fn rejects_a_corrupted_crc() {
        let mut buf = vec![0u8; HEADER_SIZE as usize];
        write_new(&mut buf, Uuid::nil());
        buf[UUID_OFFSET] ^= 0x01; // corrupt a CRC-covered byte without touching the CRC itself
        assert!(matches!(
            validate(&buf),
            Err(crate::error::Error::HeaderCorrupt { .. })
        ));
    }

    #[test]
    fn footer_pos_round_trips_through_atomics() {
        let mut buf = vec![0u8; HEADER_SIZE as usize];
        write_new(&mut buf, Uuid::nil());
        unsafe {
            store_footer_pos(buf.as_ptr(), 0xdead_beef);
            assert_eq!(load_footer_pos(buf.as_ptr()), 0xdead_beef);
        }
    }
}
