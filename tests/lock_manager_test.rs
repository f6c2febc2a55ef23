use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use silodb::common::types::Rid;
use silodb::transaction::{
    AbortReason, IsolationLevel, LockManager, LockMode, Transaction, TransactionManager,
    TransactionState,
};

mod common;
use common::init_test_logging;

const TABLE_A: u32 = 1;
const TABLE_B: u32 = 2;

fn setup() -> (Arc<LockManager>, TransactionManager) {
    init_test_logging();
    let lock_manager = Arc::new(LockManager::new());
    let txn_manager = TransactionManager::new(lock_manager.clone());
    (lock_manager, txn_manager)
}

fn settle() {
    thread::sleep(Duration::from_millis(50));
}

#[test]
fn test_compatible_modes_grant_concurrently() {
    let (lock_manager, txn_manager) = setup();
    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let t2 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let t3 = txn_manager.begin(IsolationLevel::RepeatableRead);

    assert!(lock_manager.lock_table(&t1, LockMode::IntentionShared, TABLE_A).unwrap());
    assert!(lock_manager.lock_table(&t2, LockMode::IntentionExclusive, TABLE_A).unwrap());
    assert!(lock_manager.lock_table(&t3, LockMode::IntentionShared, TABLE_A).unwrap());

    assert!(t1.is_table_intention_shared_locked(TABLE_A));
    assert!(t2.is_table_intention_exclusive_locked(TABLE_A));
    assert!(t3.is_table_intention_shared_locked(TABLE_A));
}

#[test]
fn test_relocking_same_mode_is_idempotent() {
    let (lock_manager, txn_manager) = setup();
    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);

    assert!(lock_manager.lock_table(&t1, LockMode::Shared, TABLE_A).unwrap());
    assert!(lock_manager.lock_table(&t1, LockMode::Shared, TABLE_A).unwrap());
    lock_manager.unlock_table(&t1, TABLE_A).unwrap();
    assert!(!t1.is_table_shared_locked(TABLE_A));
}

#[test]
fn test_exclusive_waiter_blocks_until_release() {
    // REPEATABLE READ: T1 holds X; T2's S waits; T1's unlock moves T1 to
    // Shrinking and lets T2 in
    let (lock_manager, txn_manager) = setup();
    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let t2 = txn_manager.begin(IsolationLevel::RepeatableRead);

    assert!(lock_manager.lock_table(&t1, LockMode::Exclusive, TABLE_A).unwrap());

    let granted = Arc::new(AtomicBool::new(false));
    let waiter = {
        let lock_manager = lock_manager.clone();
        let t2 = t2.clone();
        let granted = granted.clone();
        thread::spawn(move || {
            let ok = lock_manager.lock_table(&t2, LockMode::Shared, TABLE_A).unwrap();
            granted.store(ok, Ordering::SeqCst);
            ok
        })
    };

    settle();
    assert!(!granted.load(Ordering::SeqCst), "S must wait behind a granted X");

    lock_manager.unlock_table(&t1, TABLE_A).unwrap();
    assert_eq!(t1.state(), TransactionState::Shrinking);

    assert!(waiter.join().unwrap());
    assert!(t2.is_table_shared_locked(TABLE_A));
    assert_eq!(t2.state(), TransactionState::Growing);
}

#[test]
fn test_fifo_no_starvation_bypass() {
    // T2 waits for X behind T1's S; a later S (T3) must not slip past T2
    let (lock_manager, txn_manager) = setup();
    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let t2 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let t3 = txn_manager.begin(IsolationLevel::RepeatableRead);

    assert!(lock_manager.lock_table(&t1, LockMode::Shared, TABLE_A).unwrap());

    let x_waiter = {
        let (lock_manager, t2) = (lock_manager.clone(), t2.clone());
        thread::spawn(move || lock_manager.lock_table(&t2, LockMode::Exclusive, TABLE_A).unwrap())
    };
    settle();

    let s_granted = Arc::new(AtomicBool::new(false));
    let s_waiter = {
        let (lock_manager, t3) = (lock_manager.clone(), t3.clone());
        let s_granted = s_granted.clone();
        thread::spawn(move || {
            let ok = lock_manager.lock_table(&t3, LockMode::Shared, TABLE_A).unwrap();
            s_granted.store(ok, Ordering::SeqCst);
            ok
        })
    };

    settle();
    assert!(!s_granted.load(Ordering::SeqCst), "S behind a waiting X must also wait");

    lock_manager.unlock_table(&t1, TABLE_A).unwrap();
    assert!(x_waiter.join().unwrap());
    settle();
    assert!(!s_granted.load(Ordering::SeqCst), "X is still held");

    lock_manager.unlock_table(&t2, TABLE_A).unwrap();
    assert!(s_waiter.join().unwrap());
}

#[test]
fn test_upgrade_jumps_waiting_queue() {
    // T1 upgrades S -> X while T2 waits for X: the upgrade goes first
    let (lock_manager, txn_manager) = setup();
    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let t2 = txn_manager.begin(IsolationLevel::RepeatableRead);

    assert!(lock_manager.lock_table(&t1, LockMode::Shared, TABLE_A).unwrap());

    let t2_granted = Arc::new(AtomicBool::new(false));
    let t2_waiter = {
        let (lock_manager, t2) = (lock_manager.clone(), t2.clone());
        let t2_granted = t2_granted.clone();
        thread::spawn(move || {
            let ok = lock_manager.lock_table(&t2, LockMode::Exclusive, TABLE_A).unwrap();
            t2_granted.store(ok, Ordering::SeqCst);
            ok
        })
    };
    settle();

    // T1 still holds S, so its own upgrade to X is immediately grantable
    assert!(lock_manager.lock_table(&t1, LockMode::Exclusive, TABLE_A).unwrap());
    assert!(t1.is_table_exclusive_locked(TABLE_A));
    assert!(!t1.is_table_shared_locked(TABLE_A));
    assert!(!t2_granted.load(Ordering::SeqCst));

    lock_manager.unlock_table(&t1, TABLE_A).unwrap();
    assert!(t2_waiter.join().unwrap());
}

#[test]
fn test_upgrade_conflict_aborts_second_upgrader() {
    // T1 and T2 both hold S; T1 starts an upgrade and waits on T2's S;
    // T2's own upgrade attempt must abort with UPGRADE_CONFLICT
    let (lock_manager, txn_manager) = setup();
    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let t2 = txn_manager.begin(IsolationLevel::RepeatableRead);

    assert!(lock_manager.lock_table(&t1, LockMode::Shared, TABLE_A).unwrap());
    assert!(lock_manager.lock_table(&t2, LockMode::Shared, TABLE_A).unwrap());

    let upgrader = {
        let (lock_manager, t1) = (lock_manager.clone(), t1.clone());
        thread::spawn(move || lock_manager.lock_table(&t1, LockMode::Exclusive, TABLE_A).unwrap())
    };
    settle();

    let err = lock_manager
        .lock_table(&t2, LockMode::Exclusive, TABLE_A)
        .unwrap_err();
    assert_eq!(err.reason, AbortReason::UpgradeConflict);
    assert_eq!(t2.state(), TransactionState::Aborted);

    // Cleaning up the aborted holder unblocks the upgrade
    txn_manager.abort(&t2).unwrap();
    assert!(upgrader.join().unwrap());
    assert!(t1.is_table_exclusive_locked(TABLE_A));
}

#[test]
fn test_incompatible_upgrade_aborts() {
    let (lock_manager, txn_manager) = setup();
    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);

    assert!(lock_manager.lock_table(&t1, LockMode::Exclusive, TABLE_A).unwrap());
    let err = lock_manager
        .lock_table(&t1, LockMode::Shared, TABLE_A)
        .unwrap_err();
    assert_eq!(err.reason, AbortReason::IncompatibleUpgrade);
    assert_eq!(t1.state(), TransactionState::Aborted);
}

#[test]
fn test_read_uncommitted_rejects_shared_locks() {
    let (lock_manager, txn_manager) = setup();
    for mode in [LockMode::Shared, LockMode::IntentionShared, LockMode::SharedIntentionExclusive] {
        let txn = txn_manager.begin(IsolationLevel::ReadUncommitted);
        let err = lock_manager.lock_table(&txn, mode, TABLE_A).unwrap_err();
        assert_eq!(err.reason, AbortReason::LockSharedOnReadUncommitted);
        assert_eq!(txn.state(), TransactionState::Aborted);
    }
}

#[test]
fn test_shrinking_rules_per_isolation_level() {
    let (lock_manager, txn_manager) = setup();

    // REPEATABLE READ: no locks at all while shrinking
    let txn = txn_manager.begin(IsolationLevel::RepeatableRead);
    lock_manager.lock_table(&txn, LockMode::Shared, TABLE_A).unwrap();
    lock_manager.unlock_table(&txn, TABLE_A).unwrap();
    assert_eq!(txn.state(), TransactionState::Shrinking);
    let err = lock_manager.lock_table(&txn, LockMode::IntentionShared, TABLE_B).unwrap_err();
    assert_eq!(err.reason, AbortReason::LockOnShrinking);

    // READ COMMITTED: only IS and S while shrinking
    let txn = txn_manager.begin(IsolationLevel::ReadCommitted);
    lock_manager.lock_table(&txn, LockMode::Exclusive, TABLE_A).unwrap();
    lock_manager.unlock_table(&txn, TABLE_A).unwrap();
    assert_eq!(txn.state(), TransactionState::Shrinking);
    assert!(lock_manager.lock_table(&txn, LockMode::IntentionShared, TABLE_B).unwrap());
    assert!(lock_manager.lock_table(&txn, LockMode::Shared, TABLE_B).unwrap());
    let err = lock_manager.lock_table(&txn, LockMode::IntentionExclusive, TABLE_A).unwrap_err();
    assert_eq!(err.reason, AbortReason::LockOnShrinking);

    // READ UNCOMMITTED: X/IX forbidden while shrinking
    let txn = txn_manager.begin(IsolationLevel::ReadUncommitted);
    lock_manager.lock_table(&txn, LockMode::Exclusive, TABLE_A).unwrap();
    lock_manager.unlock_table(&txn, TABLE_A).unwrap();
    assert_eq!(txn.state(), TransactionState::Shrinking);
    let err = lock_manager.lock_table(&txn, LockMode::IntentionExclusive, TABLE_A).unwrap_err();
    assert_eq!(err.reason, AbortReason::LockOnShrinking);
}

#[test]
fn test_shared_release_keeps_read_committed_growing() {
    let (lock_manager, txn_manager) = setup();
    let txn = txn_manager.begin(IsolationLevel::ReadCommitted);
    lock_manager.lock_table(&txn, LockMode::Shared, TABLE_A).unwrap();
    lock_manager.unlock_table(&txn, TABLE_A).unwrap();
    // Only X releases start shrinking under READ COMMITTED
    assert_eq!(txn.state(), TransactionState::Growing);
}

#[test]
fn test_row_lock_preconditions() {
    let (lock_manager, txn_manager) = setup();
    let rid = Rid::new(4, 2);

    for mode in [LockMode::IntentionShared, LockMode::IntentionExclusive, LockMode::SharedIntentionExclusive] {
        let txn = txn_manager.begin(IsolationLevel::RepeatableRead);
        let err = lock_manager.lock_row(&txn, mode, TABLE_A, rid).unwrap_err();
        assert_eq!(err.reason, AbortReason::AttemptedIntentionLockOnRow);
    }

    // X on a row needs X, IX or SIX on the table first
    let txn = txn_manager.begin(IsolationLevel::RepeatableRead);
    let err = lock_manager.lock_row(&txn, LockMode::Exclusive, TABLE_A, rid).unwrap_err();
    assert_eq!(err.reason, AbortReason::TableLockNotPresent);

    let txn = txn_manager.begin(IsolationLevel::RepeatableRead);
    assert!(lock_manager.lock_table(&txn, LockMode::IntentionExclusive, TABLE_A).unwrap());
    assert!(lock_manager.lock_row(&txn, LockMode::Exclusive, TABLE_A, rid).unwrap());
    assert!(txn.is_row_exclusive_locked(TABLE_A, rid));
}

#[test]
fn test_table_unlock_requires_rows_released_first() {
    let (lock_manager, txn_manager) = setup();
    let txn = txn_manager.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(9, 1);

    lock_manager.lock_table(&txn, LockMode::IntentionExclusive, TABLE_A).unwrap();
    lock_manager.lock_row(&txn, LockMode::Exclusive, TABLE_A, rid).unwrap();

    let err = lock_manager.unlock_table(&txn, TABLE_A).unwrap_err();
    assert_eq!(err.reason, AbortReason::TableUnlockedBeforeUnlockingRows);
}

#[test]
fn test_unlock_without_lock_aborts() {
    let (lock_manager, txn_manager) = setup();
    let txn = txn_manager.begin(IsolationLevel::RepeatableRead);

    let err = lock_manager.unlock_table(&txn, TABLE_A).unwrap_err();
    assert_eq!(err.reason, AbortReason::AttemptedUnlockButNoLockHeld);

    let txn = txn_manager.begin(IsolationLevel::RepeatableRead);
    let err = lock_manager.unlock_row(&txn, TABLE_A, Rid::new(1, 1)).unwrap_err();
    assert_eq!(err.reason, AbortReason::AttemptedUnlockButNoLockHeld);
}

#[test]
fn test_deadlock_detection_aborts_youngest() {
    let (lock_manager, txn_manager) = setup();
    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let t2 = txn_manager.begin(IsolationLevel::RepeatableRead);

    assert!(lock_manager.lock_table(&t1, LockMode::Exclusive, TABLE_A).unwrap());
    assert!(lock_manager.lock_table(&t2, LockMode::Exclusive, TABLE_B).unwrap());

    let t1_thread = {
        let (lock_manager, t1) = (lock_manager.clone(), t1.clone());
        thread::spawn(move || lock_manager.lock_table(&t1, LockMode::Exclusive, TABLE_B).unwrap())
    };
    let t2_thread = {
        let (lock_manager, t2) = (lock_manager.clone(), t2.clone());
        thread::spawn(move || lock_manager.lock_table(&t2, LockMode::Exclusive, TABLE_A).unwrap())
    };
    settle();

    let mut edges = lock_manager.waits_for_edges();
    edges.sort_unstable();
    assert_eq!(edges, vec![(t1.id(), t2.id()), (t2.id(), t1.id())]);

    let victims = lock_manager.detect_deadlocks();
    assert_eq!(victims, vec![t2.id()], "the youngest cycle member dies");
    assert_eq!(t2.state(), TransactionState::Aborted);

    // The victim's wait returns false and its unwind frees the cycle
    assert!(!t2_thread.join().unwrap());
    txn_manager.abort(&t2).unwrap();
    assert!(t1_thread.join().unwrap());
    assert!(t1.is_table_exclusive_locked(TABLE_B));

    assert!(lock_manager.detect_deadlocks().is_empty());
}

#[test]
fn test_background_detector_breaks_deadlock() {
    let (lock_manager, txn_manager) = setup();
    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let t2 = txn_manager.begin(IsolationLevel::RepeatableRead);

    assert!(lock_manager.lock_table(&t1, LockMode::Exclusive, TABLE_A).unwrap());
    assert!(lock_manager.lock_table(&t2, LockMode::Exclusive, TABLE_B).unwrap());

    lock_manager.start_cycle_detection();

    let t1_thread = {
        let (lock_manager, t1) = (lock_manager.clone(), t1.clone());
        thread::spawn(move || lock_manager.lock_table(&t1, LockMode::Exclusive, TABLE_B).unwrap())
    };
    let t2_thread = {
        let (lock_manager, t2) = (lock_manager.clone(), t2.clone());
        thread::spawn(move || lock_manager.lock_table(&t2, LockMode::Exclusive, TABLE_A).unwrap())
    };

    // The detector aborts t2; its wait returns false
    assert!(!t2_thread.join().unwrap());
    assert_eq!(t2.state(), TransactionState::Aborted);
    txn_manager.abort(&t2).unwrap();
    assert!(t1_thread.join().unwrap());

    lock_manager.stop_cycle_detection();
}

#[test]
fn test_granted_set_stays_pairwise_compatible() {
    // Hammer one table from many threads and check the per-transaction
    // bookkeeping at every grant
    let (lock_manager, txn_manager) = setup();
    let mut handles = Vec::new();
    for i in 0..8 {
        let lock_manager = lock_manager.clone();
        let txn: Arc<Transaction> = txn_manager.begin(IsolationLevel::RepeatableRead);
        handles.push(thread::spawn(move || {
            let mode = if i % 4 == 0 { LockMode::Exclusive } else { LockMode::Shared };
            if lock_manager.lock_table(&txn, mode, TABLE_A).unwrap() {
                if mode == LockMode::Exclusive {
                    assert!(txn.is_table_exclusive_locked(TABLE_A));
                } else {
                    assert!(txn.is_table_shared_locked(TABLE_A));
                }
                thread::sleep(Duration::from_millis(5));
                lock_manager.unlock_table(&txn, TABLE_A).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}
