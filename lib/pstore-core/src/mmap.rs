//! Memory mapper (C2): owns one contiguous mapped view of a file range, offering read-only
//! demotion of a sub-range via `mprotect`. `memmap2` provides the initial mapping; it has no
//! sub-range protection primitive of its own, so the demotion itself is a direct `libc` call.

use std::fs::File;
use std::sync::Arc;

use memmap2::{Mmap, MmapMut};
use snafu::ResultExt;

use crate::error::{self, Result};

/// Returns the OS page size (bytes). Offsets passed to the mapper must be a multiple of this.
pub fn page_size() -> u64 {
    static PAGE_SIZE: std::sync::OnceLock<u64> = std::sync::OnceLock::new();
    *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 })
}

/// Rounds `value` up to the next multiple of `page_size()` (a no-op if already aligned).
pub fn round_up_to_page(value: u64) -> u64 {
    let ps = page_size();
    (value + ps - 1) / ps * ps
}

/// Rounds `value` down to the previous multiple of `page_size()`.
pub fn round_down_to_page(value: u64) -> u64 {
    let ps = page_size();
    (value / ps) * ps
}

enum Backing {
    ReadWrite(MmapMut),
    ReadOnly(Mmap),
}

/// One contiguous mapped view of a file range, covering `[offset, offset + size)` of the
/// backing file. Held inside an [`Arc`] so that every live pointer handed out of it keeps the
/// mapping (and therefore the OS mapping) alive, matching the "region keeps pointer alive"
/// ownership story of §3.
pub struct MemoryMapper {
    backing: Backing,
    offset: u64,
    size: u64,
}

impl MemoryMapper {
    /// Maps `length` bytes of `file` starting at `offset` (must be page-aligned).
    pub fn map(file: &File, writable: bool, offset: u64, length: u64) -> Result<Arc<Self>> {
        assert_eq!(offset % page_size(), 0, "mmap offset must be page-aligned");
        let backing = if writable {
            let mmap = unsafe {
                memmap2::MmapOptions::new()
                    .offset(offset)
                    .len(length as usize)
                    .map_mut(file)
            }
            .context(error::IoSnafu {
                path: std::path::PathBuf::from("<mmap>"),
            })?;
            Backing::ReadWrite(mmap)
        } else {
            let mmap = unsafe {
                memmap2::MmapOptions::new()
                    .offset(offset)
                    .len(length as usize)
                    .map(file)
            }
            .context(error::IoSnafu {
                path: std::path::PathBuf::from("<mmap>"),
            })?;
            Backing::ReadOnly(mmap)
        };
        Ok(Arc::new(MemoryMapper {
            backing,
            offset,
            size: length,
        }))
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.backing, Backing::ReadWrite(_))
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    pub fn as_ptr(&self) -> *const u8 {
        match &self.backing {
            Backing::ReadWrite(m) => m.as_ptr(),
            Backing::ReadOnly(m) => m.as_ptr(),
        }
    }

    /// # Safety
    /// The caller must only write through this pointer while holding the write lock, and must
    /// never write past a range that has been demoted via [`MemoryMapper::protect_read_only`].
    pub unsafe fn as_mut_ptr(&self) -> *mut u8 {
        self.as_ptr() as *mut u8
    }

    /// Marks `[addr, addr + len)` read-only at the hardware level. Requires `addr`/`len` to
    /// describe a whole-page-aligned sub-range entirely within this mapping.
    pub fn protect_read_only(&self, addr: *mut u8, len: usize) -> Result<()> {
        let base = self.as_ptr();
        debug_assert!(addr as usize >= base as usize);
        debug_assert!((addr as usize + len) <= (base as usize + self.size as usize));
        if len == 0 {
            return Ok(());
        }
        let rc = unsafe {
            libc::mprotect(
                addr as *mut libc::c_void,
                len,
                libc::PROT_READ,
            )
        };
        if rc != 0 {
            return Err(error::IoSnafu {
                path: std::path::PathBuf::from("<mprotect>"),
            }
            .into_error(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

/// Common surface shared by the real-file mapper and its in-memory counterpart, so that
/// [`crate::region::Region`] can hold either behind one set of accessors.
pub trait Mapping {
    fn offset(&self) -> u64;
    fn size(&self) -> u64;
    fn end(&self) -> u64 {
        self.offset() + self.size()
    }
    fn as_ptr(&self) -> *const u8;
    /// # Safety
    /// Same contract as [`MemoryMapper::as_mut_ptr`].
    unsafe fn as_mut_ptr(&self) -> *mut u8;
    fn protect_read_only(&self, addr: *mut u8, len: usize) -> Result<()>;
}

impl Mapping for MemoryMapper {
    fn offset(&self) -> u64 {
        MemoryMapper::offset(self)
    }
    fn size(&self) -> u64 {
        MemoryMapper::size(self)
    }
    fn as_ptr(&self) -> *const u8 {
        MemoryMapper::as_ptr(self)
    }
    unsafe fn as_mut_ptr(&self) -> *mut u8 {
        MemoryMapper::as_mut_ptr(self)
    }
    fn protect_read_only(&self, addr: *mut u8, len: usize) -> Result<()> {
        MemoryMapper::protect_read_only(self, addr, len)
    }
}

/// A view into a slice of the in-memory store's fixed buffer — the counterpart of the
/// source's `in_memory_mapper`, which is likewise just an aliasing pointer into the one
/// fixed-length buffer owned by the `in_memory` file itself. Sharing the same
/// [`crate::file::InMemoryFile`] buffer (rather than allocating a second, independent one)
/// keeps header bytes written before the first region is ever mapped visible to that region.
pub struct InMemoryMapper {
    buffer: Arc<crate::file::FixedBuffer>,
    offset: u64,
    size: u64,
}

impl InMemoryMapper {
    pub fn new(buffer: Arc<crate::file::FixedBuffer>, offset: u64, size: u64) -> Arc<Self> {
        assert!(offset + size <= buffer.capacity());
        Arc::new(InMemoryMapper {
            buffer,
            offset,
            size,
        })
    }
}

impl Mapping for InMemoryMapper {
    fn offset(&self) -> u64 {
        self.offset
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn as_ptr(&self) -> *const u8 {
        unsafe { self.buffer.as_ptr().add(self.offset as usize) }
    }

    unsafe fn as_mut_ptr(&self) -> *mut u8 {
        self.buffer.as_mut_ptr().add(self.offset as usize)
    }

    fn protect_read_only(&self, _addr: *mut u8, _len: usize) -> Result<()> {
        // There is no second process and no hardware MMU entry to demote; the in-memory
        // variant exists for fast, single-process tests where page protection is not observed.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn map_writable_then_read_back_through_pointer() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[0u8; 8192]).unwrap();
        let file = tmp.reopen().unwrap();
        let mapper = MemoryMapper::map(&file, true, 0, 8192).unwrap();
        unsafe {
            *mapper.as_mut_ptr() = 0xAB;
        }
        assert_eq!(unsafe { *mapper.as_ptr() }, 0xAB);
    }

    #[test]
    fn round_up_and_down_agree_on_aligned_values() {
        let ps = page_size();
        assert_eq!(round_up_to_page(ps), ps);
        assert_eq!(round_down_to_page(ps), ps);
        assert_eq!(round_up_to_page(ps + 1), ps * 2);
        assert_eq!(round_down_to_page(ps + 1), ps);
    }
}
