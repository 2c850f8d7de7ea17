//! Backing file abstraction (C1): a readable/writable byte container, either a real file or an
//! in-memory buffer, with range locking, seek/read/write, truncate, and an extent query.

mod memory;
mod posix;

pub use memory::{FixedBuffer, InMemoryFile};
pub use posix::FileHandle;

use crate::error::{self, Result};

/// Whether a lock acquisition call should wait for the lock to become available.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockingMode {
    NonBlocking,
    Blocking,
}

/// The kind of range lock to take: shared-read locks may coexist; an exclusive-write lock
/// excludes all other locks (of either kind) over an overlapping range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockKind {
    SharedRead,
    ExclusiveWrite,
}

/// Controls file creation when opening a path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateMode {
    /// Create a new file; fail if one already exists.
    CreateNew,
    /// Open an existing file; fail if absent.
    OpenExisting,
    /// Open the file if present, otherwise create it.
    OpenAlways,
}

/// Whether the opened handle should allow writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WritableMode {
    ReadOnly,
    ReadWrite,
}

/// Controls the behaviour of `open` when the target path does not exist.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentMode {
    /// Absence is reported through the return value (`not_found`), not raised immediately.
    AllowNotFound,
    /// Absence of the file is itself an error.
    MustExist,
}

/// The abstract interface common to both backing-file variants (C1).
///
/// Every method that touches the OS fails with [`crate::error::Error::Io`] on an
/// underlying OS failure; `read`/`write` additionally fail with
/// [`crate::error::Error::DidNotReadNumberOfBytesRequested`] on a short transfer that isn't
/// explained by end-of-file.
pub trait FileBase {
    fn is_writable(&self) -> bool;
    fn path(&self) -> &str;

    fn seek(&mut self, position: u64) -> Result<()>;
    fn tell(&mut self) -> Result<u64>;

    fn size(&mut self) -> Result<u64>;
    fn truncate(&mut self, size: u64) -> Result<()>;

    /// The modification time of the underlying content, used by the vacuum watch task to
    /// detect external writes.
    fn latest_time(&self) -> Result<std::time::SystemTime>;

    /// Reads up to `buf.len()` bytes starting at the current position, failing with
    /// `did_not_read_number_of_bytes_requested` if fewer bytes were available before EOF.
    fn read(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Writes all of `buf` starting at the current position.
    fn write(&mut self, buf: &[u8]) -> Result<()>;

    fn lock(&mut self, offset: u64, size: u64, kind: LockKind, mode: BlockingMode) -> Result<bool>;
    fn unlock(&mut self, offset: u64, size: u64) -> Result<()>;
}

/// RAII guard pairing a locked range with the file it was taken on; unlocking on drop follows
/// the destructor discipline of §7 (secondary failures are logged, never propagated).
pub struct RangeLock<'a, F: FileBase + ?Sized> {
    file: &'a mut F,
    offset: u64,
    size: u64,
    locked: bool,
}

impl<'a, F: FileBase + ?Sized> RangeLock<'a, F> {
    pub fn new(file: &'a mut F, offset: u64, size: u64, kind: LockKind, mode: BlockingMode) -> Result<Self> {
        let locked = file.lock(offset, size, kind, mode)?;
        if !locked {
            return error::WouldBlockSnafu.fail();
        }
        Ok(RangeLock {
            file,
            offset,
            size,
            locked,
        })
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl<'a, F: FileBase + ?Sized> Drop for RangeLock<'a, F> {
    fn drop(&mut self) {
        if self.locked {
            if let Err(err) = self.file.unlock(self.offset, self.size) {
                tracing::warn!(error = %err, "failed to release range lock during drop");
            }
        }
    }
}
