//! Shared control block (C8): a small POSIX shared-memory segment, one per store (keyed by the
//! store's UUID-derived name, §6 "Shared-memory naming"), that every attached process — readers,
//! writers, and a vacuum daemon — maps into its own address space to publish liveness
//! information without going through the store file itself.
//!
//! Fields are plain little-endian integers accessed through atomics, the same discipline as the
//! leader's footer pointer (`crate::header`) — never a `repr(C)` struct cast over the mapping.

use std::ffi::CString;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{self, Result};

const STATE_OFFSET: usize = 0;
const VACUUM_PID_OFFSET: usize = 8;
const VACUUM_START_TIME_OFFSET: usize = 16;
const LAST_TOUCH_OFFSET: usize = 24;
const OPEN_TICK_OFFSET: usize = 32;

/// Total size of the control block, rounded up generously; `shm_open` segments are typically
/// backed by at least one page regardless, so there's no cost to leaving headroom for future
/// fields.
const CONTROL_BLOCK_SIZE: usize = 64;

const STATE_UNINITIALIZED: u32 = 0;
const STATE_INITIALIZING: u32 = 1;
const STATE_READY: u32 = 2;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn io_error(context: &str) -> error::Error {
    error::IoSnafu {
        source: std::io::Error::last_os_error(),
        path: std::path::PathBuf::from(context),
    }
    .build()
}

/// A handle onto the attached shared control block. Dropping it unmaps the segment from this
/// process but deliberately does not `shm_unlink` it — any other attached process (most
/// importantly a running vacuum daemon) would be left with a dangling name. The segment is
/// reclaimed by the OS at reboot, matching the lifetime of the store's own lock state.
pub struct SharedControlBlock {
    ptr: *mut u8,
    name: String,
}

// SAFETY: every access goes through the atomic views below; the underlying shared-memory
// segment is explicitly designed for concurrent cross-process access.
unsafe impl Send for SharedControlBlock {}
unsafe impl Sync for SharedControlBlock {}

impl SharedControlBlock {
    unsafe fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        &*(self.ptr.add(offset) as *const AtomicU32)
    }
    unsafe fn atomic_i32(&self, offset: usize) -> &AtomicI32 {
        &*(self.ptr.add(offset) as *const AtomicI32)
    }
    unsafe fn atomic_u64(&self, offset: usize) -> &AtomicU64 {
        &*(self.ptr.add(offset) as *const AtomicU64)
    }

    /// Attaches to (creating if necessary) the shared control block named after `sync_name`
    /// (itself derived from the store's UUID by `crate::database::derive_sync_name`).
    pub fn attach(sync_name: &str) -> Result<Arc<Self>> {
        let name = format!("/{sync_name}.pst");
        let cname = CString::new(name.clone()).expect("sync name has no interior NUL");

        // SAFETY: `cname` is a valid, NUL-terminated C string; flags/mode are plain integers.
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_RDWR,
                0o600,
            )
        };
        if fd < 0 {
            return Err(io_error(&name));
        }

        // SAFETY: `fd` is a valid, just-opened descriptor.
        let truncate_result = unsafe { libc::ftruncate(fd, CONTROL_BLOCK_SIZE as libc::off_t) };
        if truncate_result != 0 {
            let err = io_error(&name);
            unsafe { libc::close(fd) };
            return Err(err);
        }

        // SAFETY: `fd` refers to a shared-memory object at least `CONTROL_BLOCK_SIZE` bytes
        // long; the mapping is dropped (munmap'd) in this type's `Drop` impl.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                CONTROL_BLOCK_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        // The fd is no longer needed once mapped; the mapping keeps the object alive.
        unsafe { libc::close(fd) };
        if addr == libc::MAP_FAILED {
            return Err(io_error(&name));
        }

        let block = SharedControlBlock {
            ptr: addr as *mut u8,
            name,
        };
        block.ensure_initialized();
        Ok(Arc::new(block))
    }

    /// First-attach race: whichever process observes `STATE_UNINITIALIZED` first zeroes the
    /// rest of the block and flips the gate to `STATE_READY`; every later attacher just spins
    /// briefly until that happens (§4.5 "spinlock/once-gate").
    fn ensure_initialized(&self) {
        // SAFETY: `ptr` is a valid mapping of at least `CONTROL_BLOCK_SIZE` bytes.
        let state = unsafe { self.atomic_u32(STATE_OFFSET) };
        match state.compare_exchange(
            STATE_UNINITIALIZED,
            STATE_INITIALIZING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                unsafe {
                    self.atomic_i32(VACUUM_PID_OFFSET).store(0, Ordering::Relaxed);
                    self.atomic_u64(VACUUM_START_TIME_OFFSET).store(0, Ordering::Relaxed);
                    self.atomic_u64(LAST_TOUCH_OFFSET).store(now_secs(), Ordering::Relaxed);
                    self.atomic_u64(OPEN_TICK_OFFSET).store(0, Ordering::Relaxed);
                }
                state.store(STATE_READY, Ordering::Release);
            }
            Err(_) => {
                for _ in 0..1000 {
                    if state.load(Ordering::Acquire) == STATE_READY {
                        return;
                    }
                    std::thread::yield_now();
                }
                tracing::warn!(
                    name = %self.name,
                    "gave up waiting for shared control block initialization; proceeding anyway"
                );
            }
        }
    }

    /// Bumps the last-touch timestamp and the open-tick counter — called by a database's
    /// heartbeat thread (§4.5 step 7) so a vacuum daemon can tell the store is still in active
    /// use.
    pub fn touch(&self) {
        // SAFETY: `ptr` is a valid mapping for the lifetime of `self`.
        unsafe {
            self.atomic_u64(LAST_TOUCH_OFFSET).store(now_secs(), Ordering::Release);
            self.atomic_u64(OPEN_TICK_OFFSET).fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn last_touch(&self) -> u64 {
        unsafe { self.atomic_u64(LAST_TOUCH_OFFSET).load(Ordering::Acquire) }
    }

    pub fn open_tick(&self) -> u64 {
        unsafe { self.atomic_u64(OPEN_TICK_OFFSET).load(Ordering::Acquire) }
    }

    /// Records that a vacuum daemon with pid `pid` has started working on this store.
    pub fn mark_vacuum_started(&self, pid: i32) {
        unsafe {
            self.atomic_u64(VACUUM_START_TIME_OFFSET).store(now_secs(), Ordering::Relaxed);
            self.atomic_i32(VACUUM_PID_OFFSET).store(pid, Ordering::Release);
        }
    }

    /// Clears the vacuum-in-progress marker; called when a vacuum cycle finishes or aborts.
    pub fn mark_vacuum_finished(&self) {
        unsafe {
            self.atomic_i32(VACUUM_PID_OFFSET).store(0, Ordering::Release);
        }
    }

    /// The pid of an in-progress vacuum daemon, or `None` if none is recorded.
    pub fn vacuum_pid(&self) -> Option<i32> {
        let pid = unsafe { self.atomic_i32(VACUUM_PID_OFFSET).load(Ordering::Acquire) };
        if pid == 0 {
            None
        } else {
            Some(pid)
        }
    }

    pub fn vacuum_start_time(&self) -> u64 {
        unsafe { self.atomic_u64(VACUUM_START_TIME_OFFSET).load(Ordering::Acquire) }
    }
}

impl Drop for SharedControlBlock {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`CONTROL_BLOCK_SIZE` describe exactly the mapping created in `attach`.
        let result = unsafe { libc::munmap(self.ptr as *mut libc::c_void, CONTROL_BLOCK_SIZE) };
        if result != 0 {
            tracing::warn!(name = %self.name, "failed to unmap shared control block");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name() -> String {
        format!(
            "pstoretest{}{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .subsec_nanos()
        )
    }

    #[test]
    fn attach_initializes_a_fresh_block_to_zero() {
        let name = unique_name();
        let block = SharedControlBlock::attach(&name).unwrap();
        assert_eq!(block.vacuum_pid(), None);
        assert_eq!(block.open_tick(), 0);
        unsafe { libc::shm_unlink(CString::new(format!("/{name}.pst")).unwrap().as_ptr()) };
    }

    #[test]
    fn two_attaches_to_the_same_name_share_state() {
        let name = unique_name();
        let first = SharedControlBlock::attach(&name).unwrap();
        first.touch();
        first.mark_vacuum_started(4242);

        let second = SharedControlBlock::attach(&name).unwrap();
        assert_eq!(second.vacuum_pid(), Some(4242));
        assert!(second.open_tick() >= 1);
        unsafe { libc::shm_unlink(CString::new(format!("/{name}.pst")).unwrap().as_ptr()) };
    }
}
