//! End-to-end scenarios against the public API, one per concrete example in the design's
//! testable-properties section: empty-store round trip, a single committed write surviving a
//! read-back, rollback neutrality, a multi-revision chain, a spanning read across a segment
//! boundary, and cross-connection visibility.

use pstore_core::{Address, AccessMode, Database, Extent, Revision, SEGMENT_SIZE};

fn write_u32(tx: &pstore_core::Transaction<'_>, value: u32) -> Address {
    let (addr, mut view) = tx.alloc_rw(4, 4).unwrap();
    view.copy_from_slice(&value.to_le_bytes());
    addr
}

fn read_u32(db: &Database, addr: Address) -> u32 {
    let view = db.getro(addr, 4).unwrap();
    u32::from_le_bytes(view[..4].try_into().unwrap())
}

#[test]
fn s1_empty_store_round_trip() {
    let db = Database::open_in_memory(true, false).unwrap();
    assert_eq!(db.get_current_revision(), 0);
    assert!(db.size() > 0);
}

#[test]
fn s2_single_integer_commit_survives_readback() {
    let db = Database::open_in_memory(true, false).unwrap();
    let tx = pstore_core::Transaction::begin(&db).unwrap();
    let addr = write_u32(&tx, 0x0102_0304);
    tx.commit().unwrap();

    assert_eq!(db.get_current_revision(), 1);
    assert_eq!(read_u32(&db, addr), 0x0102_0304);
}

#[test]
fn s3_rollback_leaves_no_trace() {
    let db = Database::open_in_memory(true, false).unwrap();
    let size_before = db.size();

    let tx = pstore_core::Transaction::begin(&db).unwrap();
    let _addr = write_u32(&tx, 0xdead_beef);
    tx.rollback().unwrap();

    assert_eq!(db.get_current_revision(), 0);
    assert_eq!(db.size(), size_before);
}

#[test]
fn s4_two_commits_form_a_revision_chain() {
    let db = Database::open_in_memory(true, false).unwrap();

    let mut tx1 = pstore_core::Transaction::begin(&db).unwrap();
    let addr_a = write_u32(&tx1, 0xAAAA_AAAA);
    tx1.set_index(0, Extent::new(addr_a, 4));
    tx1.commit().unwrap();
    assert_eq!(db.get_current_revision(), 1);

    let mut tx2 = pstore_core::Transaction::begin(&db).unwrap();
    let addr_b = write_u32(&tx2, 0xBBBB_BBBB);
    tx2.set_index(1, Extent::new(addr_b, 4));
    tx2.commit().unwrap();
    assert_eq!(db.get_current_revision(), 2);

    // Already sitting at head (generation 2) right after the second commit.
    assert_eq!(db.index_extent(0).unwrap().size, 4);
    assert_eq!(db.index_extent(1).unwrap().size, 4);

    // Walking backwards from the currently visible trailer is always permitted.
    db.sync(Revision::Numbered(1)).unwrap();
    assert_eq!(db.get_current_revision(), 1);
    assert_eq!(db.index_extent(0).unwrap().size, 4);
    assert_eq!(db.index_extent(1).unwrap().size, 0);

    db.sync(Revision::Numbered(0)).unwrap();
    assert_eq!(db.get_current_revision(), 0);
    assert_eq!(db.index_extent(0).unwrap().size, 0);

    // `Head` always re-reads the leader's live footer pointer, so it can jump back up even
    // after `sync` walked down below it.
    db.sync(Revision::Head).unwrap();
    assert_eq!(db.get_current_revision(), 2);

    // From here, a revision beyond what's currently visible cannot be reached by walking
    // backwards from the trailer this connection can see.
    assert!(matches!(
        db.sync(Revision::Numbered(3)),
        Err(pstore_core::Error::UnknownRevision { revision: 3 })
    ));
}

#[test]
fn s5_spanning_write_and_read_round_trip_across_a_segment_boundary() {
    let db = Database::open_in_memory(true, false).unwrap();
    let len = SEGMENT_SIZE + 16;
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();

    let tx = pstore_core::Transaction::begin(&db).unwrap();
    let (addr, mut view) = tx.alloc_rw(len, 1).unwrap();
    view.copy_from_slice(&data);
    drop(view);
    tx.commit().unwrap();

    let view = db.getro(addr, len).unwrap();
    assert_eq!(&view[..], &data[..]);
}

#[test]
fn s6_commit_is_not_visible_to_another_connection_until_sync() {
    let a = Database::open_in_memory(true, false).unwrap();
    let b = a.open_second_in_memory_connection(false, false).unwrap();
    assert_eq!(b.access_mode(), AccessMode::ReadOnly);
    assert_eq!(a.get_current_revision(), b.get_current_revision());

    let tx = pstore_core::Transaction::begin(&a).unwrap();
    let addr = write_u32(&tx, 0x1234_5678);
    tx.commit().unwrap();

    assert_eq!(a.get_current_revision(), 1);
    assert_eq!(b.get_current_revision(), 0, "B must not see A's commit before sync");

    b.sync(Revision::Head).unwrap();
    assert_eq!(b.get_current_revision(), 1);
    assert_eq!(read_u32(&b, addr), 0x1234_5678);
}
