//! Database (C6): the user-facing object. Owns storage, the current footer position, the
//! index cache, the process-local write-in-progress flag, and a handle onto the shared control
//! block (C8). Exposes `getro`, `getrw`, `sync`, `allocate`, and `set_new_footer`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::address::{Address, Extent, TypedAddress};
use crate::error::{self, Result};
use crate::file::{BlockingMode, CreateMode, FileBase, LockKind, PresentMode, WritableMode};
use crate::header::{self, HEADER_SIZE};
use crate::shared_memory::SharedControlBlock;
use crate::storage::{self, ByteView, ByteViewMut, Storage};
use crate::trailer::{self, Trailer, NUM_INDEXES, TRAILER_SIZE};

/// How a [`Database`] is opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    /// Open an existing store; only `getro`/`sync` are permitted.
    ReadOnly,
    /// Open an existing store, or create a new one if absent; transactions are permitted.
    Writable,
    /// Like `Writable`, but fails with [`crate::error::Error::NotFound`] if the file is absent.
    WritableNoCreate,
}

/// Advisory vacuum scheduling state, read by a vacuum daemon when it attaches to the store
/// (§4.5). Does not affect read/write semantics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum VacuumMode {
    #[default]
    Disabled,
    Immediate,
    Background,
}

struct Sizes {
    footer_pos: Address,
    logical: u64,
    generation: u64,
}

/// The user-facing store handle (C6).
pub struct Database {
    storage: Arc<Storage>,
    sizes: Mutex<Sizes>,
    index_cache: Mutex<[Option<Extent>; NUM_INDEXES]>,
    uuid: Uuid,
    sync_name: String,
    access_mode: AccessMode,
    control: Arc<SharedControlBlock>,
    vacuum_mode: Mutex<VacuumMode>,
    tx_in_progress: AtomicBool,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Database {
    /// Writes a brand-new leader and an empty revision-0 trailer into `file`. Used as the
    /// `init_contents` hook passed to [`Storage::open`]/[`Storage::open_in_memory`] whenever
    /// the target is empty and the caller asked for a writable database.
    fn build_new_store(file: &mut dyn FileBase) -> Result<()> {
        let uuid = Uuid::new_v4();
        let mut leader = vec![0u8; HEADER_SIZE as usize];
        header::write_new(&mut leader, uuid);
        header::write_footer_pos_into_bytes(&mut leader, HEADER_SIZE);

        let mut trailer_buf = vec![0u8; TRAILER_SIZE as usize];
        trailer::write_to(&mut trailer_buf, &Trailer::empty(now_secs()));

        file.seek(0)?;
        file.write(&leader)?;
        file.write(&trailer_buf)?;
        tracing::info!(uuid = %uuid, "built new store");
        Ok(())
    }

    fn from_storage(storage: Arc<Storage>, mode: AccessMode) -> Result<Self> {
        // The lock taken here is held only long enough to validate the header against a
        // concurrent writer's in-flight commit (§4.6); it is not the per-transaction write lock,
        // which a later `Transaction::begin` acquires and releases on its own. Holding a
        // shared-read lock for a read-only handle's whole lifetime would starve every writer,
        // defeating the multi-reader/single-writer model (§5), so every mode releases it below.
        let writable = storage.is_writable();
        let kind = if writable {
            LockKind::ExclusiveWrite
        } else {
            LockKind::SharedRead
        };
        storage.lock_header(kind, BlockingMode::Blocking)?;

        let result = (|| -> Result<Self> {
            let (leader_ptr, _region) = storage.address_to_pointer(Address::null())?;
            // SAFETY: the leader always occupies the first HEADER_SIZE bytes of segment 0,
            // which `Storage::open` guarantees is mapped before this call.
            let header_bytes =
                unsafe { std::slice::from_raw_parts(leader_ptr, HEADER_SIZE as usize) };
            let header = header::validate(header_bytes)?;
            // SAFETY: same mapping, read with acquire ordering per §5.
            let footer_pos = Address::new(unsafe { header::load_footer_pos(leader_ptr) });

            let trailer = Self::read_trailer_via(&storage, footer_pos)?;
            let logical = footer_pos
                .absolute()
                .checked_add(TRAILER_SIZE)
                .ok_or_else(|| {
                    error::HeaderCorruptSnafu {
                        reason: "footer position overflows logical size".to_string(),
                    }
                    .build()
                })?;
            storage.map_bytes(logical)?;

            let sync_name = derive_sync_name(&header.uuid);
            let control = SharedControlBlock::attach(&sync_name)?;

            Ok(Database {
                storage: Arc::clone(&storage),
                sizes: Mutex::new(Sizes {
                    footer_pos,
                    logical,
                    generation: trailer.generation,
                }),
                index_cache: Mutex::new([None; NUM_INDEXES]),
                uuid: header.uuid,
                sync_name,
                access_mode: mode,
                control,
                vacuum_mode: Mutex::new(VacuumMode::Disabled),
                tx_in_progress: AtomicBool::new(false),
            })
        })();

        if let Err(err) = storage.unlock_header() {
            tracing::warn!(error = %err, "failed to release init-time header lock");
        }

        result
    }

    /// Opens (or, in `Writable` mode over an absent path, creates) a store at `path`.
    ///
    /// `access_tick_enabled` starts a background heartbeat thread that periodically bumps the
    /// shared control block's open-tick counter and touches its last-access time (§4.5 step 7);
    /// pass `false` for short-lived tooling that doesn't need to announce liveness.
    pub fn open(path: impl AsRef<Path>, mode: AccessMode, access_tick_enabled: bool) -> Result<Self> {
        let (create, writable_mode, present) = match mode {
            AccessMode::ReadOnly => (
                CreateMode::OpenExisting,
                WritableMode::ReadOnly,
                PresentMode::MustExist,
            ),
            AccessMode::Writable => (
                CreateMode::OpenAlways,
                WritableMode::ReadWrite,
                PresentMode::AllowNotFound,
            ),
            AccessMode::WritableNoCreate => (
                CreateMode::OpenExisting,
                WritableMode::ReadWrite,
                PresentMode::MustExist,
            ),
        };
        let storage = Storage::open(
            &path,
            create,
            writable_mode,
            present,
            storage::DEFAULT_FULL_REGION_SIZE,
            storage::DEFAULT_MIN_REGION_SIZE,
            Self::build_new_store,
        )?;
        let db = Self::from_storage(storage, mode)?;
        if access_tick_enabled {
            db.start_heartbeat();
        }
        tracing::info!(uuid = %db.uuid, path = %path.as_ref().display(), "store opened");
        Ok(db)
    }

    /// The in-memory counterpart of [`Database::open`] — no filesystem path, ideal for tests.
    pub fn open_in_memory(writable: bool, access_tick_enabled: bool) -> Result<Self> {
        let mode = if writable {
            AccessMode::Writable
        } else {
            AccessMode::ReadOnly
        };
        let storage = Storage::open_in_memory(
            writable,
            storage::DEFAULT_FULL_REGION_SIZE,
            storage::DEFAULT_MIN_REGION_SIZE,
            Self::build_new_store,
        )?;
        let db = Self::from_storage(storage, mode)?;
        if access_tick_enabled {
            db.start_heartbeat();
        }
        Ok(db)
    }

    /// Opens a second, independent [`Database`] handle onto the same in-memory store this one
    /// is backed by — the in-memory counterpart of two processes opening the same file path
    /// (§8 scenarios S6/S9). Panics if this database is not itself in-memory.
    pub fn open_second_in_memory_connection(
        &self,
        writable: bool,
        access_tick_enabled: bool,
    ) -> Result<Self> {
        let mode = if writable {
            AccessMode::Writable
        } else {
            AccessMode::ReadOnly
        };
        let storage = self.storage.reopen_in_memory(writable)?;
        let db = Self::from_storage(storage, mode)?;
        if access_tick_enabled {
            db.start_heartbeat();
        }
        Ok(db)
    }

    fn start_heartbeat(&self) {
        let weak = Arc::downgrade(&self.control);
        std::thread::spawn(move || {
            while let Some(control) = weak.upgrade() {
                control.touch();
                std::thread::sleep(std::time::Duration::from_secs(1));
            }
        });
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn sync_name(&self) -> &str {
        &self.sync_name
    }

    pub fn path(&self) -> PathBuf {
        self.storage.path()
    }

    pub fn is_writable(&self) -> bool {
        self.storage.is_writable()
    }

    pub fn access_mode(&self) -> AccessMode {
        self.access_mode
    }

    pub fn get_current_revision(&self) -> u64 {
        self.sizes.lock().generation
    }

    pub fn vacuum_mode(&self) -> VacuumMode {
        *self.vacuum_mode.lock()
    }

    pub fn set_vacuum_mode(&self, mode: VacuumMode) {
        *self.vacuum_mode.lock() = mode;
    }

    pub(crate) fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    fn leader_ptr(&self) -> Result<*const u8> {
        self.storage
            .address_to_pointer(Address::null())
            .map(|(ptr, _region)| ptr)
    }

    fn read_trailer_via(storage: &Arc<Storage>, pos: Address) -> Result<Trailer> {
        let view = storage.read_span(pos, TRAILER_SIZE)?;
        trailer::read_from(&view)
    }

    pub(crate) fn read_trailer(&self, pos: Address) -> Result<Trailer> {
        Self::read_trailer_via(&self.storage, pos)
    }

    /// Current logical size — the byte length of the store's meaningful content.
    pub fn size(&self) -> u64 {
        self.sizes.lock().logical
    }

    fn bounds_check(&self, addr: Address, size: u64) {
        let logical = self.sizes.lock().logical;
        assert!(
            addr.absolute().saturating_add(size) <= logical,
            "extent [{:#x}, {:#x}) lies outside the current logical size ({:#x})",
            addr.absolute(),
            addr.absolute() + size,
            logical
        );
    }

    /// Returns an immutable view over `size` bytes starting at `addr`.
    pub fn getro(&self, addr: Address, size: u64) -> Result<ByteView> {
        self.bounds_check(addr, size);
        self.storage.read_span(addr, size)
    }

    /// Typed counterpart of [`Database::getro`]: reads `count` elements of `T` starting at a
    /// [`TypedAddress`], failing with [`crate::error::Error::BadAlignment`] if the address does
    /// not satisfy `T`'s alignment.
    pub fn getro_typed<T>(&self, addr: TypedAddress<T>, count: u64) -> Result<ByteView> {
        if !addr.is_aligned() {
            return error::BadAlignmentSnafu {
                address: addr.untyped().absolute(),
                align: std::mem::align_of::<T>(),
            }
            .fail();
        }
        let size = count * std::mem::size_of::<T>() as u64;
        self.getro(addr.untyped(), size)
    }

    /// Allocates `bytes` bytes aligned to `align` (a power of two), growing the mapped address
    /// space if necessary. Only meaningful while a transaction (or `build_new_store`) holds the
    /// write lock — callers reach this through [`crate::transaction::Transaction`].
    pub(crate) fn allocate(&self, bytes: u64, align: u64) -> Result<Address> {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        let mut sizes = self.sizes.lock();
        let padded = align_up(sizes.logical, align);
        let new_logical = padded + bytes;
        self.storage.map_bytes(new_logical)?;
        sizes.logical = new_logical;
        tracing::trace!(addr = padded, bytes, align, "allocated");
        Ok(Address::new(padded))
    }

    /// Publishes `new_footer` as the store's current revision. This is the single atomic write
    /// that makes a commit visible (§4.5, §6); it must be the last thing a commit does.
    pub(crate) fn set_new_footer(&self, new_footer: Address, generation: u64) -> Result<()> {
        {
            let mut sizes = self.sizes.lock();
            sizes.footer_pos = new_footer;
            sizes.logical = sizes.logical.max(new_footer.absolute() + TRAILER_SIZE);
            sizes.generation = generation;
        }
        *self.index_cache.lock() = [None; NUM_INDEXES];
        let leader_ptr = self.leader_ptr()?;
        // SAFETY: leader is always mapped; this is the sole atomic write publishing a commit.
        unsafe { header::store_footer_pos(leader_ptr, new_footer.absolute()) };
        Ok(())
    }

    pub(crate) fn rollback_to(&self, start_logical: u64, start_footer: Address) -> Result<()> {
        if let Err(err) = self.storage.truncate(start_logical) {
            tracing::warn!(
                error = %err,
                "truncate during rollback failed; logical size is still tracked in memory"
            );
        }
        let trailer = self.read_trailer(start_footer)?;
        {
            let mut sizes = self.sizes.lock();
            sizes.footer_pos = start_footer;
            sizes.logical = start_logical;
            sizes.generation = trailer.generation;
        }
        *self.index_cache.lock() = [None; NUM_INDEXES];
        Ok(())
    }

    /// Demotes every whole page in `[first, last)` to read-only (§4.4, §4.6 step 3).
    pub(crate) fn protect(&self, first: Address, last: Address) -> Result<()> {
        self.storage.protect(first, last)
    }

    pub(crate) fn begin_write_lock(&self, mode: BlockingMode) -> Result<bool> {
        self.storage.lock_header(LockKind::ExclusiveWrite, mode)
    }

    pub(crate) fn release_write_lock(&self) {
        if let Err(err) = self.storage.unlock_header() {
            tracing::warn!(error = %err, "failed to release write lock");
        }
    }

    pub(crate) fn try_claim_transaction(&self) -> bool {
        !self.tx_in_progress.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn release_transaction_claim(&self) {
        self.tx_in_progress.store(false, Ordering::Release);
    }

    pub(crate) fn current_sizes(&self) -> (u64, Address) {
        let sizes = self.sizes.lock();
        (sizes.logical, sizes.footer_pos)
    }

    /// Writable counterpart of [`Database::getro`], requiring proof of an in-progress
    /// transaction via `_tx` (so the borrow checker, not just a runtime assertion, rejects a
    /// `getrw` call with no transaction in scope).
    pub fn getrw(
        &self,
        _tx: &crate::transaction::Transaction<'_>,
        addr: Address,
        size: u64,
    ) -> Result<ByteViewMut> {
        assert!(self.storage.is_writable(), "database is not writable");
        self.bounds_check(addr, size);
        self.storage.write_span(addr, size)
    }

    /// Changes the database's visible revision. `Revision::Head` walks the leader's current
    /// footer; a numbered revision walks the chain backwards from the currently visible
    /// trailer (§4.5 "Sync").
    pub fn sync(&self, revision: crate::revision::Revision) -> Result<()> {
        use crate::revision::Revision;
        match revision {
            Revision::Head => {
                let leader_ptr = self.leader_ptr()?;
                // SAFETY: leader is always mapped.
                let pos = Address::new(unsafe { header::load_footer_pos(leader_ptr) });
                self.adopt_footer(pos)
            }
            Revision::Numbered(target) => {
                let mut cursor = self.sizes.lock().footer_pos;
                loop {
                    let trailer = self.read_trailer(cursor)?;
                    if trailer.generation == target {
                        return self.adopt_footer(cursor);
                    }
                    if trailer.generation < target || trailer.previous.is_null() {
                        return error::UnknownRevisionSnafu { revision: target }.fail();
                    }
                    cursor = trailer.previous;
                }
            }
        }
    }

    fn adopt_footer(&self, pos: Address) -> Result<()> {
        let trailer = self.read_trailer(pos)?;
        let trailer_end = pos.absolute() + TRAILER_SIZE;
        self.storage.map_bytes(trailer_end)?;
        {
            let mut sizes = self.sizes.lock();
            sizes.footer_pos = pos;
            sizes.logical = trailer_end;
            sizes.generation = trailer.generation;
        }
        *self.index_cache.lock() = [None; NUM_INDEXES];
        tracing::debug!(generation = trailer.generation, "synced to revision");
        Ok(())
    }

    /// Returns the extent of named index `which`, loading it from the current trailer on first
    /// access and caching it until the next `sync`/commit (§4.5 "Index cache"). The HAMT
    /// indices themselves are out of scope; this only hands back where their bytes live.
    pub fn index_extent(&self, which: usize) -> Result<Extent> {
        assert!(which < NUM_INDEXES);
        if let Some(extent) = self.index_cache.lock()[which] {
            return Ok(extent);
        }
        let pos = self.sizes.lock().footer_pos;
        let trailer = self.read_trailer(pos)?;
        *self.index_cache.lock() = trailer.indexes.map(Some);
        Ok(trailer.indexes[which])
    }
}

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) / align * align
}

const SYNC_NAME_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";
const SYNC_NAME_LEN: usize = 20;

/// Derives a 20-character, 32-symbol-alphabet name from a store UUID (§6 "Shared-memory
/// naming"), carrying comfortably more than 96 bits of the UUID's 128 bits of entropy.
pub(crate) fn derive_sync_name(uuid: &Uuid) -> String {
    let bytes = uuid.as_bytes();
    let mut bits: u128 = 0;
    for &b in bytes {
        bits = (bits << 8) | u128::from(b);
    }
    let mut out = String::with_capacity(SYNC_NAME_LEN);
    for i in 0..SYNC_NAME_LEN {
        let shift = 128 - 5 * (i + 1);
        let idx = if shift >= 0 {
            ((bits >> shift) & 0x1f) as usize
        } else {
            // Final symbols draw on bits beyond the UUID's 128; pad with zero bits, matching
            // any base32-style encoder's tail behaviour.
            ((bits << (-shift)) & 0x1f) as usize
        };
        out.push(SYNC_NAME_ALPHABET[idx] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_name_is_twenty_chars_from_the_expected_alphabet() {
        let uuid = Uuid::new_v4();
        let name = derive_sync_name(&uuid);
        assert_eq!(name.len(), SYNC_NAME_LEN);
        assert!(name
            .bytes()
            .all(|b| SYNC_NAME_ALPHABET.contains(&b)));
    }

    #[test]
    fn sync_name_is_deterministic() {
        let uuid = Uuid::new_v4();
        assert_eq!(derive_sync_name(&uuid), derive_sync_name(&uuid));
    }

    #[test]
    fn opening_a_fresh_in_memory_store_starts_at_generation_zero() {
        let db = Database::open_in_memory(true, false).unwrap();
        assert_eq!(db.get_current_revision(), 0);
        assert_eq!(db.size(), HEADER_SIZE + TRAILER_SIZE);
    }
}
