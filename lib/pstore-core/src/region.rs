//! Region factory (C3): produces a sequence of memory-mapped regions covering the file,
//! preferring large contiguous regions (up to `full_size`) backed by smaller quanta
//! (`min_size`), and extends that sequence as the file grows.

use std::fs::File;
use std::sync::Arc;

use snafu::ResultExt;

use crate::address::SEGMENT_SIZE;
use crate::error::{self, Result};
use crate::file::{FileHandle, FixedBuffer, InMemoryFile};
use crate::mmap::{InMemoryMapper, Mapping, MemoryMapper};

/// One contiguous mapped view, behind a trait object so [`RegionFactory`] can hand out either
/// a real `mmap` or the in-memory counterpart through one type.
pub type Region = Arc<dyn Mapping + Send + Sync>;

pub fn round_up(value: u64, quantum: u64) -> u64 {
    (value + quantum - 1) / quantum * quantum
}

enum Source {
    File(File),
    Memory(Arc<FixedBuffer>),
}

/// Builds and extends the vector of [`Region`]s that back one store's address space.
pub struct RegionFactory {
    full_size: u64,
    min_size: u64,
    source: Source,
}

impl RegionFactory {
    /// `full_size` must be a positive multiple of `min_size`; `min_size` must be a multiple of
    /// the segment size.
    fn new(full_size: u64, min_size: u64, source: Source) -> Self {
        assert!(full_size > 0 && full_size % min_size == 0);
        assert!(min_size % SEGMENT_SIZE == 0);
        RegionFactory {
            full_size,
            min_size,
            source,
        }
    }

    pub fn for_file(file: &FileHandle, full_size: u64, min_size: u64) -> Result<Self> {
        let cloned = file.file().try_clone().context(error::IoSnafu {
            path: std::path::PathBuf::from(file.path()),
        })?;
        Ok(Self::new(full_size, min_size, Source::File(cloned)))
    }

    pub fn for_memory(file: &InMemoryFile, full_size: u64, min_size: u64) -> Self {
        Self::new(full_size, min_size, Source::Memory(file.buffer()))
    }

    pub fn full_size(&self) -> u64 {
        self.full_size
    }

    pub fn min_size(&self) -> u64 {
        self.min_size
    }

    fn current_capacity(&self) -> Result<u64> {
        match &self.source {
            Source::File(f) => f
                .metadata()
                .map(|m| m.len())
                .context(error::IoSnafu {
                    path: std::path::PathBuf::from("<region-factory>"),
                }),
            Source::Memory(buf) => Ok(buf.capacity()),
        }
    }

    /// Grows the underlying container to at least `target` bytes. A no-op for the in-memory
    /// variant, whose capacity is fixed at file-creation time; growing past it is an error.
    fn grow_container_to(&self, target: u64) -> Result<()> {
        match &self.source {
            Source::File(f) => f.set_len(target).context(error::IoSnafu {
                path: std::path::PathBuf::from("<region-factory>"),
            }),
            Source::Memory(buf) => {
                if target > buf.capacity() {
                    return Err(error::IoSnafu {
                        path: std::path::PathBuf::from("<in-memory>"),
                    }
                    .into_error(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "in-memory file capacity exceeded by region growth",
                    )));
                }
                Ok(())
            }
        }
    }

    fn map_region(&self, writable: bool, offset: u64, length: u64) -> Result<Region> {
        match &self.source {
            Source::File(f) => Ok(MemoryMapper::map(f, writable, offset, length)? as Region),
            Source::Memory(buf) => {
                Ok(InMemoryMapper::new(Arc::clone(buf), offset, length) as Region)
            }
        }
    }

    /// Maps the current contents of the container, producing regions that together cover
    /// `round_up(current_size, min_size)` bytes, emitted in offset order.
    pub fn init(&self, writable: bool) -> Result<Vec<Region>> {
        let current = self.current_capacity()?;
        let target = round_up(current, self.min_size);
        let mut regions = Vec::new();
        self.append(&mut regions, target, writable)?;
        Ok(regions)
    }

    /// Extends `regions` so that together they cover at least `new_size` bytes, continuing
    /// contiguously from the end of the last region (or offset 0 if `regions` is empty).
    /// Growing the file/buffer is a no-op if it already covers `new_size`.
    pub fn append(&self, regions: &mut Vec<Region>, new_size: u64, writable: bool) -> Result<()> {
        let start = regions.last().map(|r| r.end()).unwrap_or(0);
        let target = round_up(new_size, self.min_size);
        if target <= start {
            return Ok(());
        }
        self.grow_container_to(target)?;

        let mut offset = start;
        while offset < target {
            let remaining = target - offset;
            let this_size = remaining.min(self.full_size);
            regions.push(self.map_region(writable, offset, this_size)?);
            offset += this_size;
        }
        debug_assert_eq!(offset, target);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::InMemoryFile;

    #[test]
    fn init_covers_rounded_up_size() {
        let mut f = InMemoryFile::with_capacity(true, 64 * 1024 * 1024);
        crate::file::FileBase::truncate(&mut f, SEGMENT_SIZE + 10).unwrap();
        let factory = RegionFactory::for_memory(&f, 16 * 1024 * 1024, SEGMENT_SIZE);
        let regions = factory.init(true).unwrap();
        let covered: u64 = regions.iter().map(|r| r.size()).sum();
        assert!(covered >= SEGMENT_SIZE + 10);
        assert_eq!(covered % SEGMENT_SIZE, 0);
    }

    #[test]
    fn append_is_contiguous_and_idempotent_below_target() {
        let f = InMemoryFile::with_capacity(true, 64 * 1024 * 1024);
        let factory = RegionFactory::for_memory(&f, 8 * 1024 * 1024, SEGMENT_SIZE);
        let mut regions = Vec::new();
        factory.append(&mut regions, SEGMENT_SIZE, true).unwrap();
        let first_len = regions.len();
        factory.append(&mut regions, SEGMENT_SIZE, true).unwrap();
        assert_eq!(regions.len(), first_len, "no new regions when target already covered");

        let mut offset = 0;
        for r in &regions {
            assert_eq!(r.offset(), offset);
            offset = r.end();
        }
    }

    #[test]
    fn each_region_is_no_larger_than_full_size() {
        let f = InMemoryFile::with_capacity(true, 32 * 1024 * 1024);
        let factory = RegionFactory::for_memory(&f, 4 * 1024 * 1024, SEGMENT_SIZE);
        let mut regions = Vec::new();
        factory.append(&mut regions, 20 * 1024 * 1024, true).unwrap();
        for r in &regions {
            assert!(r.size() <= 4 * 1024 * 1024);
        }
    }
}
