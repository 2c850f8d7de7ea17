//! The in-memory variant of C1: a file-like API over a fixed-capacity buffer, used by unit
//! tests and by any embedder that wants a store without a filesystem path.
//!
//! Locking is a no-op here, matching the source project's `in_memory` file: within one process
//! there is no second writer to serialise against. The buffer never reallocates once created —
//! mirroring the source's `in_memory` file, which wraps a single fixed-length heap block for
//! its whole lifetime — so raw pointers handed out of a mapped region over it stay valid for
//! as long as the region itself lives, the same guarantee a real `mmap` gives for free.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::{self, Result};
use crate::file::{BlockingMode, FileBase, LockKind};

/// Default capacity for a freshly created in-memory file when none is given explicitly.
/// Comfortably larger than the 4 MiB + 16 byte spanning-read scenario in the testable
/// properties (`S5`).
pub const DEFAULT_CAPACITY: u64 = 16 * 1024 * 1024;

/// A fixed-capacity heap buffer shared between an [`InMemoryFile`] and any
/// [`crate::mmap::InMemoryMapper`] regions mapped over it. Never reallocates after
/// construction.
pub struct FixedBuffer {
    data: std::cell::UnsafeCell<Box<[u8]>>,
    /// The logical end of file — the in-memory analogue of a real file's `size()`. Shared by
    /// every connection reopened over the same buffer, the way `fstat` is shared by every file
    /// descriptor pointing at the same inode.
    eof: AtomicU64,
}

// SAFETY: mutation through `as_mut_ptr` is serialised by the store's own single-writer lock
// discipline, exactly as a real `mmap`'s mutability is serialised by the caller rather than by
// the mapping itself.
unsafe impl Sync for FixedBuffer {}
unsafe impl Send for FixedBuffer {}

impl FixedBuffer {
    fn with_capacity(capacity: u64) -> Arc<Self> {
        Arc::new(FixedBuffer {
            data: std::cell::UnsafeCell::new(vec![0u8; capacity as usize].into_boxed_slice()),
            eof: AtomicU64::new(0),
        })
    }

    pub fn capacity(&self) -> u64 {
        unsafe { (*self.data.get()).len() as u64 }
    }

    pub fn as_ptr(&self) -> *const u8 {
        unsafe { (*self.data.get()).as_ptr() }
    }

    /// # Safety
    /// See [`crate::mmap::MemoryMapper::as_mut_ptr`].
    pub unsafe fn as_mut_ptr(&self) -> *mut u8 {
        (*self.data.get()).as_mut_ptr()
    }
}

/// An in-memory backing "file". Cheap to clone via [`InMemoryFile::reopen`]: the buffer is
/// reference-counted, so two handles opened against the same buffer behave like two
/// connections to the same store, the way the `S6`/`S9` two-connection scenarios require.
pub struct InMemoryFile {
    buffer: Arc<FixedBuffer>,
    pos: u64,
    writable: bool,
    created_at: SystemTime,
}

impl InMemoryFile {
    pub fn new(writable: bool) -> Self {
        Self::with_capacity(writable, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(writable: bool, capacity: u64) -> Self {
        InMemoryFile {
            buffer: FixedBuffer::with_capacity(capacity),
            pos: 0,
            writable,
            created_at: SystemTime::now(),
        }
    }

    /// Opens a second connection onto the same underlying buffer.
    pub fn reopen(&self, writable: bool) -> Self {
        InMemoryFile {
            buffer: Arc::clone(&self.buffer),
            pos: 0,
            writable,
            created_at: self.created_at,
        }
    }

    pub fn buffer(&self) -> Arc<FixedBuffer> {
        Arc::clone(&self.buffer)
    }
}

impl FileBase for InMemoryFile {
    fn is_writable(&self) -> bool {
        self.writable
    }

    fn path(&self) -> &str {
        "<in-memory>"
    }

    fn seek(&mut self, position: u64) -> Result<()> {
        self.pos = position;
        Ok(())
    }

    fn tell(&mut self) -> Result<u64> {
        Ok(self.pos)
    }

    fn size(&mut self) -> Result<u64> {
        Ok(self.buffer.eof.load(Ordering::Acquire))
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        if size > self.buffer.capacity() {
            return Err(error::IoSnafu {
                path: std::path::PathBuf::from(self.path()),
            }
            .into_error(std::io::Error::new(
                std::io::ErrorKind::Other,
                "in-memory file capacity exceeded",
            )));
        }
        self.buffer.eof.store(size, Ordering::Release);
        Ok(())
    }

    fn latest_time(&self) -> Result<SystemTime> {
        Ok(self.created_at)
    }

    fn read(&mut self, out: &mut [u8]) -> Result<()> {
        let eof = self.buffer.eof.load(Ordering::Acquire);
        let start = self.pos;
        let wanted = out.len() as u64;
        let available = eof.saturating_sub(start);
        let got = wanted.min(available);
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.buffer.as_ptr().add(start as usize),
                out.as_mut_ptr(),
                got as usize,
            );
        }
        self.pos += got;
        if got < wanted {
            return error::DidNotReadNumberOfBytesRequestedSnafu {
                wanted: wanted as usize,
                got: got as usize,
            }
            .fail();
        }
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let end = self.pos + data.len() as u64;
        if end > self.buffer.capacity() {
            return Err(error::IoSnafu {
                path: std::path::PathBuf::from(self.path()),
            }
            .into_error(std::io::Error::new(
                std::io::ErrorKind::Other,
                "in-memory file capacity exceeded",
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.buffer.as_mut_ptr().add(self.pos as usize),
                data.len(),
            );
        }
        self.pos = end;
        let mut eof = self.buffer.eof.load(Ordering::Acquire);
        while end > eof {
            match self.buffer.eof.compare_exchange_weak(
                eof,
                end,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => eof = actual,
            }
        }
        Ok(())
    }

    fn lock(&mut self, _offset: u64, _size: u64, _kind: LockKind, _mode: BlockingMode) -> Result<bool> {
        Ok(true)
    }

    fn unlock(&mut self, _offset: u64, _size: u64) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_back() {
        let mut f = InMemoryFile::new(true);
        f.write(b"abcdef").unwrap();
        f.seek(2).unwrap();
        let mut out = [0u8; 3];
        f.read(&mut out).unwrap();
        assert_eq!(&out, b"cde");
    }

    #[test]
    fn reopen_shares_the_same_bytes() {
        let mut a = InMemoryFile::new(true);
        a.write(b"shared").unwrap();
        let mut b = a.reopen(false);
        let mut out = [0u8; 6];
        b.read(&mut out).unwrap();
        assert_eq!(&out, b"shared");
    }

    #[test]
    fn write_past_capacity_fails() {
        let mut f = InMemoryFile::with_capacity(true, 4);
        assert!(f.write(b"12345").is_err());
    }
}
