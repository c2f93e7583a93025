//! Buffer manager cross-module scenarios: basic commit (spec.md §8,
//! scenario 2) and the capacity/lock-leak invariants around `BufferFull`.

mod common;

use storage_kernel::{Error, PageId};

#[test]
fn basic_commit_persists_the_after_image() {
    let (bm, mut log) = common::fresh_kernel(64, 4);
    let page = PageId::new(0, 1);

    log.log_txn_begin(1).unwrap();
    let frame_id = bm.fix_page(1, page, true).unwrap();
    let mut data = bm.read_page_data(frame_id);
    let before = data[0];
    assert_eq!(before, 0x00);
    data[0] = 0xAA;
    bm.write_page_data(frame_id, &data);
    log.log_update(1, page.raw(), 1, 0, &[before], &[0xAA]).unwrap();
    bm.unfix_page(frame_id, true);

    log.log_commit(1).unwrap();
    bm.transaction_complete(1).unwrap();
    bm.flush_all_pages().unwrap();

    assert!(!bm.lock_manager().has_lock(1, page));

    bm.discard_all_pages();
    let reload = bm.fix_page(2, page, false).unwrap();
    assert_eq!(bm.read_page_data(reload)[0], 0xAA);
}

#[test]
fn buffer_full_on_a_miss_does_not_evict_anything() {
    let (bm, _log) = common::fresh_kernel(64, 1);
    bm.fix_page(1, PageId::new(0, 0), true).unwrap();
    let err = bm.fix_page(2, PageId::new(0, 1), true).unwrap_err();
    assert_eq!(err, Error::BufferFull);
    // The resident page is still there and still locked by txn 1.
    assert!(bm.lock_manager().has_lock(1, PageId::new(0, 0)));
    assert!(!bm.lock_manager().has_lock(2, PageId::new(0, 1)));
}

#[test]
fn transaction_complete_flushes_only_that_transactions_pages() {
    let (bm, mut log) = common::fresh_kernel(64, 4);
    let p0 = PageId::new(0, 0);
    let p1 = PageId::new(0, 1);

    log.log_txn_begin(1).unwrap();
    let f0 = bm.fix_page(1, p0, true).unwrap();
    bm.write_page_data(f0, b"txn-one");
    bm.unfix_page(f0, true);

    log.log_txn_begin(2).unwrap();
    let f1 = bm.fix_page(2, p1, true).unwrap();
    bm.write_page_data(f1, b"txn-two");
    bm.unfix_page(f1, true);

    bm.transaction_complete(1).unwrap();
    // txn 2 never committed/flushed; abort it so its lock on p1 is released
    // without its in-memory write ever reaching storage.
    bm.transaction_abort(2);

    bm.discard_all_pages();
    let reload0 = bm.fix_page(3, p0, false).unwrap();
    assert_eq!(&bm.read_page_data(reload0)[..7], b"txn-one");

    let reload1 = bm.fix_page(4, p1, false).unwrap();
    assert_ne!(&bm.read_page_data(reload1)[..7], b"txn-two");
}
