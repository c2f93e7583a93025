//! Two-phase locking cross-module scenarios: S/X deadlock detection
//! (spec.md §8, scenario 4) and lock upgrade (scenario 5), exercised
//! through the buffer manager's `fix_page` rather than the lock manager
//! directly, since that's the path real callers take.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use storage_kernel::{Error, PageId};

/// Concrete scenario 4: T1 holds X on page 1 and wants X on page 2; T2
/// holds X on page 2 and wants X on page 1. At least one of the two must
/// observe `TxnAbort` (the one whose cycle check loses the race aborts
/// immediately; the other, if it was already waiting before the cycle
/// existed, surfaces the same outcome once its wait times out) and
/// whichever side does not abort proceeds to commit successfully.
#[test]
fn sx_deadlock_aborts_at_least_one_side() {
    let (bm, _log) = common::fresh_kernel(64, 4);
    let bm = Arc::new(bm);
    let p1 = PageId::new(0, 1);
    let p2 = PageId::new(0, 2);

    bm.fix_page(1, p1, true).unwrap();
    bm.fix_page(2, p2, true).unwrap();

    let bm1 = bm.clone();
    let t1 = thread::spawn(move || bm1.fix_page(1, p2, true));

    thread::sleep(Duration::from_millis(100));
    let result2 = bm.fix_page(2, p1, true);
    let result1 = t1.join().unwrap();

    let aborted = [&result1, &result2].iter().filter(|r| r.is_err()).count();
    assert!(aborted >= 1, "at least one side of the cycle must abort");

    for (txn_id, result) in vec![(1u64, &result1), (2u64, &result2)] {
        match result {
            Ok(_) => {
                bm.transaction_complete(txn_id).unwrap();
            }
            Err(Error::TxnAbort) => {
                bm.transaction_abort(txn_id);
            }
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }
}

/// Concrete scenario 5: T1 takes S on a page with no other locker, then
/// requests X on the same page. The upgrade must succeed without waiting.
#[test]
fn shared_to_exclusive_upgrade_with_sole_holder_does_not_wait() {
    let (bm, _log) = common::fresh_kernel(64, 4);
    let page = PageId::new(0, 0);

    let frame_id = bm.fix_page(1, page, false).unwrap();
    let start = std::time::Instant::now();
    let frame_id2 = bm.fix_page(1, page, true).unwrap();
    assert!(start.elapsed() < Duration::from_millis(200), "upgrade must not block");
    assert_eq!(frame_id, frame_id2);

    bm.write_page_data(frame_id, b"upgraded");
    bm.unfix_page(frame_id, true);
    bm.transaction_complete(1).unwrap();
}

/// Invariant: at no point do two transactions both hold X on the same
/// page, nor does one hold X while another holds S on it.
#[test]
fn exclusive_lock_is_never_shared_with_another_transaction() {
    let (bm, _log) = common::fresh_kernel(64, 4);
    let bm = Arc::new(bm);
    let page = PageId::new(0, 0);

    bm.fix_page(1, page, true).unwrap();
    let acquired = Arc::new(AtomicBool::new(false));
    let bm2 = bm.clone();
    let acquired2 = acquired.clone();
    let blocked = thread::spawn(move || {
        let result = bm2.fix_page(2, page, false);
        acquired2.store(true, Ordering::SeqCst);
        result
    });

    thread::sleep(Duration::from_millis(150));
    assert!(
        !acquired.load(Ordering::SeqCst),
        "txn 2 must still be waiting on txn 1's X lock"
    );

    bm.transaction_complete(1).unwrap();
    let result = blocked.join().unwrap();
    assert!(result.is_ok(), "txn 2 should acquire S once txn 1 releases");
}
