//! Vacuum engine (C9): three cooperating threads — copy, watch, quit — that rebuild a store's
//! live set into a fresh file and, once that copy is uncontested by concurrent writers, replace
//! the original with it.
//!
//! There is no coroutine runtime here by design: the watch task's poll loop and the copy task's
//! blocking `sync`/`commit` calls are plain `std::thread`s coordinating through a
//! `parking_lot::Condvar` plus a pair of atomic flags, the same condition-variable-and-atomics
//! shape the store's own commit protocol uses for the footer pointer.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::database::{AccessMode, Database, VacuumMode};
use crate::error::Result;
use crate::file::{BlockingMode, LockKind, RangeLock};

/// Tunables for one vacuum run, mirroring the CLI binary's own flags (§6) so the struct used by
/// the library and the flags accepted by the binary stay in one place.
#[derive(Clone, Debug)]
pub struct VacuumOptions {
    /// How long the copy task sleeps before its first pass when running in daemon mode.
    pub initial_delay: Duration,
    /// How often the watch task polls for external modification.
    pub poll_interval: Duration,
    /// Whether to loop forever (daemon mode) or perform exactly one cycle.
    pub daemon: bool,
}

impl Default for VacuumOptions {
    fn default() -> Self {
        VacuumOptions {
            initial_delay: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
            daemon: false,
        }
    }
}

/// The status block shared by the three tasks: `modified` (an external write was observed
/// during copy), `done` (shut down after the current cycle), `watch_running` (the watch task is
/// still active this cycle).
#[derive(Default)]
struct Status {
    modified: AtomicBool,
    done: AtomicBool,
    watch_running: AtomicBool,
}

/// Coordinates a vacuum run against one store path. Construct once per invocation of the vacuum
/// binary; `run` drives it to completion (one cycle, or forever in daemon mode).
pub struct VacuumEngine {
    path: PathBuf,
    options: VacuumOptions,
    status: Arc<Status>,
    start_watch_mutex: Arc<Mutex<()>>,
    start_watch_cv: Arc<Condvar>,
}

impl VacuumEngine {
    pub fn new(path: impl AsRef<Path>, options: VacuumOptions) -> Self {
        VacuumEngine {
            path: path.as_ref().to_path_buf(),
            options,
            status: Arc::new(Status::default()),
            start_watch_mutex: Arc::new(Mutex::new(())),
            start_watch_cv: Arc::new(Condvar::new()),
        }
    }

    /// Signals a running engine to stop after its current cycle — the programmatic counterpart
    /// of the quit task's signal handling, for embedders that want to drive shutdown themselves.
    pub fn request_stop(&self) {
        self.status.done.store(true, Ordering::Release);
        self.start_watch_cv.notify_all();
    }

    /// Runs the vacuum engine to completion: spawns the watch and (on unix) quit tasks, then
    /// drives the copy task on the calling thread until `done` is set.
    pub fn run(&self) -> Result<()> {
        let watch_handle = self.spawn_watch_task();
        #[cfg(unix)]
        let quit_handle = self.spawn_quit_task();

        let result = self.copy_task_loop();

        self.status.done.store(true, Ordering::Release);
        self.start_watch_cv.notify_all();
        if let Err(err) = watch_handle.join() {
            tracing::warn!(?err, "watch task panicked");
        }
        #[cfg(unix)]
        if let Err(err) = quit_handle.join() {
            tracing::warn!(?err, "quit task panicked");
        }
        result
    }

    fn copy_task_loop(&self) -> Result<()> {
        loop {
            if self.status.done.load(Ordering::Acquire) {
                return Ok(());
            }
            if self.options.daemon {
                let deadline = Instant::now() + self.options.initial_delay;
                while Instant::now() < deadline {
                    if self.status.done.load(Ordering::Acquire) {
                        return Ok(());
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
            }

            match self.run_one_cycle() {
                Ok(true) => {
                    tracing::info!(path = %self.path.display(), "vacuum cycle completed");
                    if !self.options.daemon {
                        return Ok(());
                    }
                }
                Ok(false) => {
                    tracing::warn!("vacuum cycle restarted due to external modification");
                    continue;
                }
                Err(err) => {
                    tracing::error!(error = %err, "vacuum cycle aborted");
                    if !self.options.daemon {
                        return Err(err);
                    }
                }
            }

            if !self.options.daemon {
                return Ok(());
            }
        }
    }

    /// Runs one copy attempt. Returns `Ok(true)` on a successful commit-and-rename, `Ok(false)`
    /// if it detected external modification and should be retried, or `Err` on a genuine I/O
    /// failure (the `.gc` destination is discarded either way).
    fn run_one_cycle(&self) -> Result<bool> {
        self.status.modified.store(false, Ordering::Release);

        let source = Database::open(&self.path, AccessMode::Writable, false)?;
        source.sync(crate::revision::Revision::Head)?;
        self.status.modified.store(false, Ordering::Release);

        self.status.watch_running.store(true, Ordering::Release);
        {
            let _guard = self.start_watch_mutex.lock();
            self.start_watch_cv.notify_all();
        }

        let gc_path = gc_path_for(&self.path);
        let outcome = self.copy_live_entries(&source, &gc_path);

        self.status.watch_running.store(false, Ordering::Release);

        match outcome {
            Ok(true) => {
                std::fs::rename(&gc_path, &self.path).map_err(|source| {
                    crate::error::IoSnafu {
                        path: self.path.clone(),
                    }
                    .into_error(source)
                })?;
                Ok(true)
            }
            Ok(false) => {
                let _ = std::fs::remove_file(&gc_path);
                Ok(false)
            }
            Err(err) => {
                let _ = std::fs::remove_file(&gc_path);
                Err(err)
            }
        }
    }

    /// Copies every live index extent from `source`'s current revision into a freshly created
    /// database at `gc_path`. Returns `Ok(false)` (not an error) if `modified` flips mid-copy.
    fn copy_live_entries(&self, source: &Database, gc_path: &Path) -> Result<bool> {
        if gc_path.exists() {
            std::fs::remove_file(gc_path).map_err(|err| {
                crate::error::IoSnafu {
                    path: gc_path.to_path_buf(),
                }
                .into_error(err)
            })?;
        }
        let dest = Database::open(gc_path, AccessMode::Writable, false)?;
        dest.set_vacuum_mode(VacuumMode::Disabled);

        let tx = crate::transaction::Transaction::begin(&dest)?;
        for which in 0..crate::trailer::NUM_INDEXES {
            if self.status.modified.load(Ordering::Acquire) {
                tx.rollback()?;
                return Ok(false);
            }
            let extent = source.index_extent(which)?;
            if extent.size == 0 {
                continue;
            }
            let view = source.getro(extent.addr, extent.size)?;
            let (_new_addr, mut dest_view) = tx.alloc_rw(extent.size, 8)?;
            dest_view.copy_from_slice(&view);
        }

        if self.status.modified.load(Ordering::Acquire) {
            tx.rollback()?;
            return Ok(false);
        }
        tx.commit()?;
        Ok(true)
    }

    fn spawn_watch_task(&self) -> std::thread::JoinHandle<()> {
        let status = Arc::clone(&self.status);
        let mutex = Arc::clone(&self.start_watch_mutex);
        let cv = Arc::clone(&self.start_watch_cv);
        let path = self.path.clone();
        let poll_interval = self.options.poll_interval;

        std::thread::spawn(move || {
            loop {
                {
                    let mut guard = mutex.lock();
                    while !status.watch_running.load(Ordering::Acquire)
                        && !status.done.load(Ordering::Acquire)
                    {
                        cv.wait_for(&mut guard, Duration::from_secs(1));
                    }
                }
                if status.done.load(Ordering::Acquire) {
                    return;
                }

                let snapshot_time = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
                while status.watch_running.load(Ordering::Acquire) {
                    if status.done.load(Ordering::Acquire) {
                        return;
                    }
                    std::thread::sleep(poll_interval);

                    let advanced = std::fs::metadata(&path)
                        .and_then(|m| m.modified())
                        .ok()
                        .zip(snapshot_time)
                        .map(|(now, then)| now > then)
                        .unwrap_or(false);

                    let lock_taken = probe_write_lock(&path);

                    if advanced || lock_taken {
                        status.modified.store(true, Ordering::Release);
                    }
                }
            }
        })
    }

    #[cfg(unix)]
    fn spawn_quit_task(&self) -> std::thread::JoinHandle<()> {
        let status = Arc::clone(&self.status);
        let cv = Arc::clone(&self.start_watch_cv);

        std::thread::spawn(move || {
            use nix::sys::signal::{SigSet, Signal};
            use nix::sys::signalfd::{SfdFlags, SignalFd};

            let mut mask = SigSet::empty();
            mask.add(Signal::SIGINT);
            mask.add(Signal::SIGTERM);
            if mask.thread_block().is_err() {
                tracing::warn!("failed to block SIGINT/SIGTERM for the quit task");
                return;
            }

            let signalfd = match SignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC) {
                Ok(fd) => fd,
                Err(err) => {
                    tracing::warn!(%err, "failed to create signalfd; quit task disabled");
                    return;
                }
            };

            loop {
                if status.done.load(Ordering::Acquire) {
                    return;
                }
                match signalfd.read_signal() {
                    Ok(Some(_)) => {
                        tracing::info!("received shutdown signal");
                        status.done.store(true, Ordering::Release);
                        cv.notify_all();
                        return;
                    }
                    Ok(None) => continue,
                    Err(err) => {
                        tracing::warn!(%err, "signalfd read failed; quit task exiting");
                        return;
                    }
                }
            }
        })
    }
}

fn gc_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".gc");
    PathBuf::from(os)
}

/// Momentarily attempts the exclusive-write lock to see whether some other process holds it
/// (§4.8 "watch task", check (b)). Never blocks. The probe's own lock is released by
/// `RangeLock`'s `Drop` the instant this function returns, per the §7 destructor discipline.
fn probe_write_lock(path: &Path) -> bool {
    let mut file = match crate::file::FileHandle::open(
        path,
        crate::file::CreateMode::OpenExisting,
        crate::file::WritableMode::ReadWrite,
        crate::file::PresentMode::AllowNotFound,
    ) {
        Ok(f) => f,
        Err(_) => return false,
    };
    RangeLock::new(
        &mut file,
        0,
        crate::header::HEADER_SIZE,
        LockKind::ExclusiveWrite,
        BlockingMode::NonBlocking,
    )
    .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vacuum_options_default_matches_documented_defaults() {
        let opts = VacuumOptions::default();
        assert_eq!(opts.initial_delay, Duration::from_secs(10));
        assert_eq!(opts.poll_interval, Duration::from_millis(500));
        assert!(!opts.daemon);
    }

    #[test]
    fn gc_path_appends_suffix() {
        assert_eq!(gc_path_for(Path::new("/tmp/store.db")), PathBuf::from("/tmp/store.db.gc"));
    }

    #[test]
    fn a_single_cycle_compacts_an_in_place_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        {
            let db = Database::open(&path, AccessMode::Writable, false).unwrap();
            let tx = crate::transaction::Transaction::begin(&db).unwrap();
            tx.commit().unwrap();
        }

        let engine = VacuumEngine::new(&path, VacuumOptions {
            daemon: false,
            initial_delay: Duration::from_millis(0),
            poll_interval: Duration::from_millis(20),
        });
        engine.run().unwrap();
        assert!(path.exists());
        assert!(!gc_path_for(&path).exists());
    }

    #[test]
    fn copy_aborts_and_rolls_back_when_modified_flag_is_set() {
        // §8 scenario S7: any observation of external activity during the copy forces a
        // restart, never a partial commit to the destination, and never touches the source.
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("store.db");
        {
            let db = Database::open(&source_path, AccessMode::Writable, false).unwrap();
            let mut tx = crate::transaction::Transaction::begin(&db).unwrap();
            let (addr, mut view) = tx.alloc_rw(4, 4).unwrap();
            view.copy_from_slice(&42u32.to_le_bytes());
            drop(view);
            tx.set_index(0, crate::address::Extent::new(addr, 4));
            tx.commit().unwrap();
        }
        let source_bytes_before = std::fs::read(&source_path).unwrap();

        let source = Database::open(&source_path, AccessMode::Writable, false).unwrap();
        source.sync(crate::revision::Revision::Head).unwrap();

        let engine = VacuumEngine::new(&source_path, VacuumOptions::default());
        let gc_path = gc_path_for(&source_path);

        // Simulate the watch task already having observed external activity before the copy
        // task reaches its first live index.
        engine.status.modified.store(true, Ordering::Release);
        let outcome = engine.copy_live_entries(&source, &gc_path).unwrap();

        assert!(!outcome, "a modified copy must report restart, not success");
        assert!(!gc_path.exists(), "the half-built destination must be discarded");
        assert_eq!(
            std::fs::read(&source_path).unwrap(),
            source_bytes_before,
            "the source store must be untouched by an aborted vacuum cycle"
        );
    }
}
