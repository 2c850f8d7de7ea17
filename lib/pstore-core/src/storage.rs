//! Storage (C5): composes the backing file (C1), the memory mapper (C2), the region factory
//! (C3), and the segment address table (C4) into the address-space primitives the database
//! builds on — `address_to_pointer`, growth, the spanning-request copy engine, and page
//! protection.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::address::{Address, SEGMENT_SIZE};
use crate::error::{self, Result};
use crate::file::{
    BlockingMode, CreateMode, FileBase, FileHandle, InMemoryFile, LockKind, PresentMode,
    WritableMode,
};
use crate::header::HEADER_SIZE;
use crate::region::{Region, RegionFactory};
use crate::sat::SegmentTable;

/// Default target size of one memory-mapped region (C3's `full_size`): 256 MiB.
pub const DEFAULT_FULL_REGION_SIZE: u64 = 256 * 1024 * 1024;
/// Default mapping quantum (C3's `min_size`): one segment.
pub const DEFAULT_MIN_REGION_SIZE: u64 = SEGMENT_SIZE;

/// Either backing-file variant (C1), behind one type so [`Storage`] doesn't need to be generic.
pub enum BackingFile {
    Posix(FileHandle),
    Memory(InMemoryFile),
}

impl FileBase for BackingFile {
    fn is_writable(&self) -> bool {
        match self {
            BackingFile::Posix(f) => f.is_writable(),
            BackingFile::Memory(f) => f.is_writable(),
        }
    }
    fn path(&self) -> &str {
        match self {
            BackingFile::Posix(f) => f.path(),
            BackingFile::Memory(f) => f.path(),
        }
    }
    fn seek(&mut self, position: u64) -> Result<()> {
        match self {
            BackingFile::Posix(f) => f.seek(position),
            BackingFile::Memory(f) => f.seek(position),
        }
    }
    fn tell(&mut self) -> Result<u64> {
        match self {
            BackingFile::Posix(f) => f.tell(),
            BackingFile::Memory(f) => f.tell(),
        }
    }
    fn size(&mut self) -> Result<u64> {
        match self {
            BackingFile::Posix(f) => f.size(),
            BackingFile::Memory(f) => f.size(),
        }
    }
    fn truncate(&mut self, size: u64) -> Result<()> {
        match self {
            BackingFile::Posix(f) => f.truncate(size),
            BackingFile::Memory(f) => f.truncate(size),
        }
    }
    fn latest_time(&self) -> Result<std::time::SystemTime> {
        match self {
            BackingFile::Posix(f) => f.latest_time(),
            BackingFile::Memory(f) => f.latest_time(),
        }
    }
    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        match self {
            BackingFile::Posix(f) => f.read(buf),
            BackingFile::Memory(f) => f.read(buf),
        }
    }
    fn write(&mut self, buf: &[u8]) -> Result<()> {
        match self {
            BackingFile::Posix(f) => f.write(buf),
            BackingFile::Memory(f) => f.write(buf),
        }
    }
    fn lock(&mut self, offset: u64, size: u64, kind: LockKind, mode: BlockingMode) -> Result<bool> {
        match self {
            BackingFile::Posix(f) => f.lock(offset, size, kind, mode),
            BackingFile::Memory(f) => f.lock(offset, size, kind, mode),
        }
    }
    fn unlock(&mut self, offset: u64, size: u64) -> Result<()> {
        match self {
            BackingFile::Posix(f) => f.unlock(offset, size),
            BackingFile::Memory(f) => f.unlock(offset, size),
        }
    }
}

/// Which side of a spanning copy a given byte range plays: the in-store bytes, or the shadow
/// buffer standing in for them. A single routine parameterised on this enum replaces the
/// source's traits-of-traits template parameter (§9 "Template-of-templates copy engine").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CopyDirection {
    FromStore,
    ToStore,
}

/// A byte range obtained from the store for reading. Either a direct view into a mapped region
/// (the common case) or, for a request spanning a region boundary, an owned copy stitched
/// together from several regions (§4.4 "Spanning access").
pub enum ByteView {
    Mapped {
        ptr: *const u8,
        len: usize,
        _region: Region,
    },
    Owned(Box<[u8]>),
}

// SAFETY: `Mapped`'s pointer is derived from a `Region` this variant keeps alive; it is never
// mutated through this read-only view.
unsafe impl Send for ByteView {}
unsafe impl Sync for ByteView {}

impl std::ops::Deref for ByteView {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        match self {
            ByteView::Mapped { ptr, len, .. } => unsafe { std::slice::from_raw_parts(*ptr, *len) },
            ByteView::Owned(b) => b,
        }
    }
}

/// A byte range obtained from the store for writing. `Mapped` writes land directly in the
/// backing mapping; `Shadow` accumulates into a heap buffer and copies itself back into the
/// store on drop — the Rust counterpart of the source's custom deleter (§9).
pub enum ByteViewMut {
    Mapped {
        ptr: *mut u8,
        len: usize,
        _region: Region,
    },
    Shadow {
        storage: Arc<Storage>,
        addr: Address,
        buf: Vec<u8>,
    },
}

unsafe impl Send for ByteViewMut {}

impl std::ops::Deref for ByteViewMut {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        match self {
            ByteViewMut::Mapped { ptr, len, .. } => unsafe {
                std::slice::from_raw_parts(*ptr, *len)
            },
            ByteViewMut::Shadow { buf, .. } => buf,
        }
    }
}

impl std::ops::DerefMut for ByteViewMut {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self {
            ByteViewMut::Mapped { ptr, len, .. } => unsafe {
                std::slice::from_raw_parts_mut(*ptr, *len)
            },
            ByteViewMut::Shadow { buf, .. } => buf,
        }
    }
}

impl Drop for ByteViewMut {
    fn drop(&mut self) {
        if let ByteViewMut::Shadow { storage, addr, buf } = self {
            if let Err(err) = storage.copy_to_store(*addr, buf) {
                tracing::error!(error = %err, "failed to write back shadow buffer on drop");
            }
        }
    }
}

/// Storage (C5): owns the backing file, the region factory, and the segment address table.
pub struct Storage {
    file: Mutex<BackingFile>,
    factory: RegionFactory,
    writable: bool,
    regions: RwLock<Vec<Region>>,
    sat: SegmentTable,
    /// When set, every request is treated as spanning even if it would otherwise fit in one
    /// mapped region — used by tests to exercise the copy engine deterministically (§4.4).
    force_spanning: AtomicBool,
}

impl Storage {
    /// Opens (and, for a fresh file, creates) the backing file at `path`, then maps its current
    /// contents into regions and builds the initial segment table.
    ///
    /// `init_contents`, if given, is run against the opened file *before* regions are mapped —
    /// this is the hook `Database::build_new_store` uses to write a brand-new leader and
    /// revision-0 trailer into an empty file.
    pub fn open(
        path: impl AsRef<Path>,
        create: CreateMode,
        writable_mode: WritableMode,
        present: PresentMode,
        full_size: u64,
        min_size: u64,
        init_contents: impl FnOnce(&mut dyn FileBase) -> Result<()>,
    ) -> Result<Arc<Self>> {
        let mut file = FileHandle::open(path, create, writable_mode, present)?;
        let writable = writable_mode == WritableMode::ReadWrite;
        if writable && file.size()? == 0 {
            init_contents(&mut file)?;
        }
        let factory = RegionFactory::for_file(&file, full_size, min_size)?;
        let regions = factory.init(writable)?;
        let sat = SegmentTable::new();
        sat.extend(&regions);
        Ok(Arc::new(Storage {
            file: Mutex::new(BackingFile::Posix(file)),
            factory,
            writable,
            regions: RwLock::new(regions),
            sat,
            force_spanning: AtomicBool::new(false),
        }))
    }

    /// The in-memory counterpart of [`Storage::open`], used by fast unit tests and by any
    /// embedder that wants a store with no filesystem path at all.
    pub fn open_in_memory(
        writable: bool,
        full_size: u64,
        min_size: u64,
        init_contents: impl FnOnce(&mut dyn FileBase) -> Result<()>,
    ) -> Result<Arc<Self>> {
        let mut file = InMemoryFile::new(writable);
        if writable {
            init_contents(&mut file)?;
        }
        let factory = RegionFactory::for_memory(&file, full_size, min_size);
        let regions = factory.init(writable)?;
        let sat = SegmentTable::new();
        sat.extend(&regions);
        Ok(Arc::new(Storage {
            file: Mutex::new(BackingFile::Memory(file)),
            factory,
            writable,
            regions: RwLock::new(regions),
            sat,
            force_spanning: AtomicBool::new(false),
        }))
    }

    /// Opens a second, independent connection onto the same in-memory buffer this storage is
    /// backed by — the in-memory counterpart of two processes opening the same file path, used
    /// to exercise two-connection visibility (§8 scenarios S6/S9) without touching a filesystem.
    ///
    /// Fails by panicking if this storage is not itself in-memory; there is no sensible
    /// "second connection" for a real file here (callers just call [`Storage::open`] again).
    pub fn reopen_in_memory(&self, writable: bool) -> Result<Arc<Self>> {
        let second = {
            let guard = self.file.lock();
            match &*guard {
                BackingFile::Memory(f) => f.reopen(writable),
                BackingFile::Posix(_) => {
                    panic!("reopen_in_memory called on a filesystem-backed Storage")
                }
            }
        };
        let factory = RegionFactory::for_memory(&second, self.factory_full_size(), self.factory_min_size());
        let regions = factory.init(writable)?;
        let sat = SegmentTable::new();
        sat.extend(&regions);
        Ok(Arc::new(Storage {
            file: Mutex::new(BackingFile::Memory(second)),
            factory,
            writable,
            regions: RwLock::new(regions),
            sat,
            force_spanning: AtomicBool::new(false),
        }))
    }

    fn factory_full_size(&self) -> u64 {
        self.factory.full_size()
    }

    fn factory_min_size(&self) -> u64 {
        self.factory.min_size()
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn path(&self) -> PathBuf {
        PathBuf::from(self.file.lock().path())
    }

    #[cfg(test)]
    pub fn set_force_spanning(&self, value: bool) {
        self.force_spanning.store(value, Ordering::Relaxed);
    }

    /// Acquires (or releases) the range lock over `[0, HEADER_SIZE)` that serialises
    /// transactions across processes (§4.6).
    pub fn lock_header(&self, kind: LockKind, mode: BlockingMode) -> Result<bool> {
        self.file.lock().lock(0, HEADER_SIZE, kind, mode)
    }

    pub fn unlock_header(&self) -> Result<()> {
        self.file.lock().unlock(0, HEADER_SIZE)
    }

    /// The modification time of the backing file, used by the vacuum watch task (C9) to detect
    /// external writes.
    pub fn latest_time(&self) -> Result<std::time::SystemTime> {
        self.file.lock().latest_time()
    }

    /// Shrinks the backing file's declared length to `size`, used by `Transaction::rollback`.
    /// On filesystems that refuse to shrink a currently-mapped file this may be a no-op; the
    /// logical size that actually governs what's reachable is tracked independently in
    /// `Database`'s own bookkeeping (§9 "open questions").
    pub fn truncate(&self, size: u64) -> Result<()> {
        self.file.lock().truncate(size)
    }

    /// Grows the mapped address space, if necessary, to cover at least `new_size` bytes, then
    /// extends the segment table over any newly appended regions.
    pub fn map_bytes(&self, new_size: u64) -> Result<()> {
        let mut regions = self.regions.write();
        let before = regions.len();
        self.factory.append(&mut regions, new_size, self.writable)?;
        self.sat.extend(&regions[before..]);
        Ok(())
    }

    pub fn address_to_pointer(&self, addr: Address) -> Result<(*const u8, Region)> {
        self.sat.address_to_pointer(addr)
    }

    /// Whether `[addr, addr + size)` spans more than one segment and therefore needs the
    /// shadow-buffer copy path (§4.4). A multi-segment request always spans, even when the
    /// segments happen to live in the same region — the per-segment pointer lookup doesn't
    /// special-case in-region contiguity, matching the source's own per-segment access pattern.
    fn spans(&self, addr: Address, size: u64) -> bool {
        if self.force_spanning.load(Ordering::Relaxed) {
            return true;
        }
        if size == 0 {
            return false;
        }
        let last = addr.absolute() + (size - 1);
        addr.segment() != Address::new(last).segment()
    }

    fn copy_spanning(&self, addr: Address, buf: &mut [u8], direction: CopyDirection) -> Result<()> {
        let mut cursor = addr;
        let mut done = 0usize;
        let total = buf.len();
        while done < total {
            let space_left_in_segment = SEGMENT_SIZE - cursor.offset();
            let remaining = (total - done) as u64;
            let chunk = space_left_in_segment.min(remaining) as usize;
            let (ptr, _region) = self.sat.address_to_pointer(cursor)?;
            match direction {
                CopyDirection::FromStore => unsafe {
                    std::ptr::copy_nonoverlapping(ptr, buf[done..].as_mut_ptr(), chunk);
                },
                CopyDirection::ToStore => unsafe {
                    std::ptr::copy_nonoverlapping(buf[done..].as_ptr(), ptr as *mut u8, chunk);
                },
            }
            done += chunk;
            cursor = cursor.checked_add(chunk as u64).ok_or_else(|| {
                error::HeaderCorruptSnafu {
                    reason: "address overflow during spanning copy".to_string(),
                }
                .build()
            })?;
        }
        Ok(())
    }

    fn copy_to_store(&self, addr: Address, buf: &[u8]) -> Result<()> {
        let mut scratch = buf.to_vec();
        self.copy_spanning(addr, &mut scratch, CopyDirection::ToStore)
    }

    /// Reads `size` bytes starting at `addr`, returning either a zero-copy view into a mapped
    /// region or, for a spanning request, a freshly assembled owned copy.
    pub fn read_span(&self, addr: Address, size: u64) -> Result<ByteView> {
        if !self.spans(addr, size) {
            let (ptr, region) = self.sat.address_to_pointer(addr)?;
            return Ok(ByteView::Mapped {
                ptr,
                len: size as usize,
                _region: region,
            });
        }
        let mut buf = vec![0u8; size as usize];
        self.copy_spanning(addr, &mut buf, CopyDirection::FromStore)?;
        Ok(ByteView::Owned(buf.into_boxed_slice()))
    }

    /// Returns a writable view over `size` bytes starting at `addr`. For a non-spanning
    /// request, writes land directly in the mapped region; for a spanning request, writes
    /// accumulate in a shadow buffer that is copied back into the store when the view is
    /// dropped.
    pub fn write_span(self: &Arc<Self>, addr: Address, size: u64) -> Result<ByteViewMut> {
        if !self.spans(addr, size) {
            let (ptr, region) = self.sat.address_to_pointer(addr)?;
            return Ok(ByteViewMut::Mapped {
                ptr: ptr as *mut u8,
                len: size as usize,
                _region: region,
            });
        }
        Ok(ByteViewMut::Shadow {
            storage: Arc::clone(self),
            addr,
            buf: vec![0u8; size as usize],
        })
    }

    /// Demotes every whole page in `[first, last)` to read-only, rounding `first` up and `last`
    /// down to page boundaries (§4.4). Regions are walked back-to-front, matching the source's
    /// own iteration order.
    pub fn protect(&self, first: Address, last: Address) -> Result<()> {
        let first_page = crate::mmap::round_up_to_page(first.absolute());
        let last_page = crate::mmap::round_down_to_page(last.absolute());
        if first_page >= last_page {
            return Ok(());
        }
        let regions = self.regions.read();
        for region in regions.iter().rev() {
            let region_start = region.offset().max(first_page);
            let region_end = region.end().min(last_page);
            if region_start < region_end {
                let ptr = unsafe {
                    region
                        .as_ptr()
                        .add((region_start - region.offset()) as usize)
                } as *mut u8;
                region.protect_read_only(ptr, (region_end - region_start) as usize)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::SEGMENT_SIZE;

    fn open_memory(size: u64) -> Arc<Storage> {
        Storage::open_in_memory(true, 8 * 1024 * 1024, SEGMENT_SIZE, |file| {
            file.truncate(size)
        })
        .unwrap()
    }

    #[test]
    fn non_spanning_write_then_read_round_trips() {
        let storage = open_memory(SEGMENT_SIZE);
        {
            let mut view = storage.write_span(Address::new(16), 4).unwrap();
            view.copy_from_slice(&[1, 2, 3, 4]);
        }
        let view = storage.read_span(Address::new(16), 4).unwrap();
        assert_eq!(&*view, &[1, 2, 3, 4]);
    }

    #[test]
    fn forced_spanning_write_still_round_trips() {
        let storage = open_memory(SEGMENT_SIZE * 2);
        storage.map_bytes(SEGMENT_SIZE * 2).unwrap();
        storage.set_force_spanning(true);
        {
            let mut view = storage.write_span(Address::new(100), 8).unwrap();
            assert!(matches!(view, ByteViewMut::Shadow { .. }));
            view.copy_from_slice(&[9, 8, 7, 6, 5, 4, 3, 2]);
        }
        storage.set_force_spanning(false);
        let view = storage.read_span(Address::new(100), 8).unwrap();
        assert_eq!(&*view, &[9, 8, 7, 6, 5, 4, 3, 2]);
    }

    #[test]
    fn genuinely_spanning_request_copies_across_segments() {
        let storage = open_memory(SEGMENT_SIZE * 2);
        storage.map_bytes(SEGMENT_SIZE * 2).unwrap();
        let addr = Address::new(SEGMENT_SIZE - 4);
        let data: Vec<u8> = (0..16u8).collect();
        {
            let mut view = storage.write_span(addr, 16).unwrap();
            assert!(matches!(view, ByteViewMut::Shadow { .. }));
            view.copy_from_slice(&data);
        }
        let view = storage.read_span(addr, 16).unwrap();
        assert_eq!(&*view[..], &data[..]);
    }
}
