//! Transaction (C7): the single-writer unit of work. A transaction holds the store's exclusive
//! write lock for its whole lifetime, offers allocation and writable views, and either commits
//! (publishing a new trailer) or rolls back (restoring the database to its pre-transaction
//! state) — including implicitly, via `Drop`, if the caller never calls either explicitly.

use std::sync::atomic::{AtomicBool, Ordering};

use scopeguard::ScopeGuard;

use crate::address::{Address, Extent};
use crate::database::Database;
use crate::error::Result;
use crate::file::BlockingMode;
use crate::storage::ByteViewMut;
use crate::trailer::{Trailer, NUM_INDEXES, TRAILER_SIZE};

/// Releases the write lock and the transaction claim this guard was constructed for. Named
/// (rather than a closure) so it can be carried as a plain `fn` pointer inside the scope guard,
/// with no capture to box.
fn release_write_lock(db: &Database) {
    db.release_write_lock();
    db.release_transaction_claim();
}

/// A single-writer transaction against a [`Database`]. Only one may be open per `Database` at a
/// time (enforced by `Database::try_claim_transaction`) and, because the write lock is a
/// cross-process file lock, only one may be open per store file across every process attached
/// to it (§4.6).
pub struct Transaction<'db> {
    db: &'db Database,
    start_logical: u64,
    start_footer: Address,
    indexes: [Extent; NUM_INDEXES],
    finished: AtomicBool,
    /// Releases the write lock and transaction claim exactly once, however this transaction
    /// ends: explicit `commit`/`rollback`, an early error return from `begin`, or simply being
    /// dropped. This is the §7 destructor-discipline guard for the write lock's release.
    _lock_guard: ScopeGuard<&'db Database, fn(&Database)>,
}

impl<'db> Transaction<'db> {
    /// Begins a transaction, blocking until the cross-process write lock is available.
    pub fn begin(db: &'db Database) -> Result<Self> {
        Self::begin_mode(db, BlockingMode::Blocking).map(|tx| tx.expect("blocking begin always succeeds"))
    }

    /// Attempts to begin a transaction without blocking; returns `Ok(None)` rather than an error
    /// if the write lock is currently held elsewhere.
    pub fn try_begin(db: &'db Database) -> Result<Option<Self>> {
        Self::begin_mode(db, BlockingMode::NonBlocking)
    }

    fn begin_mode(db: &'db Database, mode: BlockingMode) -> Result<Option<Self>> {
        assert!(db.is_writable(), "cannot begin a transaction on a read-only database");

        if !db.try_claim_transaction() {
            if mode == BlockingMode::NonBlocking {
                return Ok(None);
            }
            // A blocking begin from a second transaction on the same `Database` handle within
            // one process would deadlock against itself; this is a caller-contract violation,
            // not a runtime condition worth a typed error (§9 "contract violations").
            panic!("a transaction is already in progress on this database handle");
        }

        let acquired = match db.begin_write_lock(mode) {
            Ok(acquired) => acquired,
            Err(err) => {
                db.release_transaction_claim();
                return Err(err);
            }
        };
        if !acquired {
            db.release_transaction_claim();
            return Ok(None);
        }

        // From here on the write lock and the transaction claim are both held. `lock_guard`
        // releases both exactly once no matter how this transaction ends: an early return below,
        // explicit `commit`/`rollback`, or an implicit `Drop`.
        let lock_guard = scopeguard::guard(db, release_write_lock as fn(&Database));

        let (start_logical, start_footer) = db.current_sizes();
        let indexes = match db.read_trailer(start_footer) {
            Ok(trailer) => trailer.indexes,
            Err(err) => return Err(err),
        };

        tracing::debug!(footer = %start_footer, "transaction begun");
        Ok(Some(Transaction {
            db,
            start_logical,
            start_footer,
            indexes,
            finished: AtomicBool::new(false),
            _lock_guard: lock_guard,
        }))
    }

    /// Allocates `bytes` bytes aligned to `align` within the transaction's address space.
    pub fn allocate(&self, bytes: u64, align: u64) -> Result<Address> {
        self.db.allocate(bytes, align)
    }

    /// Allocates space for and returns a writable view over `bytes` bytes aligned to `align`.
    pub fn alloc_rw(&self, bytes: u64, align: u64) -> Result<(Address, ByteViewMut)> {
        let addr = self.allocate(bytes, align)?;
        let view = self.db.getrw(self, addr, bytes)?;
        Ok((addr, view))
    }

    /// Returns a writable view over an already-allocated extent.
    pub fn get_rw(&self, addr: Address, size: u64) -> Result<ByteViewMut> {
        self.db.getrw(self, addr, size)
    }

    /// Sets the extent recorded for named index `which` in the trailer this transaction will
    /// publish on commit. Takes effect only if the transaction commits.
    pub fn set_index(&mut self, which: usize, extent: Extent) {
        assert!(which < NUM_INDEXES);
        self.indexes[which] = extent;
    }

    /// Publishes a new trailer chained onto the previously-visible one, making every write this
    /// transaction performed visible to new readers. Consumes the transaction.
    pub fn commit(mut self) -> Result<()> {
        self.commit_impl()
    }

    fn commit_impl(&mut self) -> Result<()> {
        let previous = self.db.read_trailer(self.start_footer)?;
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let new_trailer = previous.next(self.start_footer, self.indexes, timestamp);

        let trailer_addr = self.db.allocate(TRAILER_SIZE, 8)?;
        {
            let mut view = self.db.getrw(self, trailer_addr, TRAILER_SIZE)?;
            crate::trailer::write_to(&mut view, &new_trailer);
        }
        let new_trailer_end = Address::new(trailer_addr.absolute() + TRAILER_SIZE);

        // Demote every newly written whole page to read-only before publishing it, so a
        // published revision's bytes are hardware-enforced immutable (§4.4 `protect`, §4.6
        // step 3, testable property 7).
        self.db.protect(Address::new(self.start_logical), new_trailer_end)?;

        // The atomic footer-pointer write inside `set_new_footer` is the single operation that
        // makes this commit visible; everything above it must already be durable (§4.6).
        self.db.set_new_footer(trailer_addr, new_trailer.generation)?;
        self.finish();
        tracing::info!(generation = new_trailer.generation, "transaction committed");
        Ok(())
    }

    /// Discards every write this transaction performed, restoring the database to the state it
    /// was in when the transaction began. Consumes the transaction.
    pub fn rollback(mut self) -> Result<()> {
        self.rollback_impl()
    }

    fn rollback_impl(&mut self) -> Result<()> {
        let result = self.db.rollback_to(self.start_logical, self.start_footer);
        self.finish();
        if let Err(ref err) = result {
            tracing::warn!(error = %err, "rollback encountered an error");
        }
        result
    }

    /// Marks the transaction's state-changing work (commit or rollback) as done, so `Drop`
    /// doesn't run it a second time. Releasing the write lock itself is `_lock_guard`'s job,
    /// not this method's — it happens once, unconditionally, when the transaction's fields are
    /// dropped.
    fn finish(&self) {
        self.finished.store(true, Ordering::Release);
    }
}

impl<'db> Drop for Transaction<'db> {
    fn drop(&mut self) {
        if !self.finished.load(Ordering::Acquire) {
            tracing::warn!("transaction dropped without an explicit commit/rollback; rolling back");
            if let Err(err) = self.db.rollback_to(self.start_logical, self.start_footer) {
                tracing::error!(error = %err, "implicit rollback on drop failed");
            }
            self.finish();
        }
    }
}
