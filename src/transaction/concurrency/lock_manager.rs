use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};
use thiserror::Error;

use crate::common::config::{CYCLE_DETECTION_INTERVAL, INVALID_TXN_ID};
use crate::common::types::{Rid, TableOid, TxnId};
use crate::transaction::concurrency::deadlock::WaitsForGraph;
use crate::transaction::concurrency::transaction::{
    IsolationLevel, Transaction, TransactionState,
};

/// Lock modes of the multi-granularity hierarchy. Intention modes are only
/// legal on tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

/// Why a lock request aborted its transaction
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    #[error("lock requested while shrinking")]
    LockOnShrinking,
    #[error("shared lock requested under READ UNCOMMITTED")]
    LockSharedOnReadUncommitted,
    #[error("upgrade to an incompatible mode")]
    IncompatibleUpgrade,
    #[error("another transaction is already upgrading on this resource")]
    UpgradeConflict,
    #[error("row lock requested without the covering table lock")]
    TableLockNotPresent,
    #[error("table unlocked before its row locks")]
    TableUnlockedBeforeUnlockingRows,
    #[error("intention lock requested on a row")]
    AttemptedIntentionLockOnRow,
    #[error("unlock requested but no lock is held")]
    AttemptedUnlockButNoLockHeld,
}

/// Raised after the offending transaction has been moved to `Aborted`
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("transaction {txn_id} aborted: {reason}")]
pub struct TransactionAbort {
    pub txn_id: TxnId,
    pub reason: AbortReason,
}

struct LockRequest {
    txn: Arc<Transaction>,
    mode: LockMode,
    granted: bool,
}

struct QueueState {
    requests: VecDeque<LockRequest>,
    /// Transaction currently upgrading on this resource, if any; at most
    /// one upgrade may be in flight per resource
    upgrading: TxnId,
}

/// FIFO queue of granted and waiting requests for one resource
struct LockRequestQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

impl LockRequestQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                requests: VecDeque::new(),
                upgrading: INVALID_TXN_ID,
            }),
            cv: Condvar::new(),
        }
    }
}

/// Arbitrates hierarchical table/row locks between transactions.
///
/// Requests join a per-resource FIFO queue and wait on its condition
/// variable until every granted request is compatible and no older request
/// is still waiting. Upgrades re-queue ahead of ordinary waiters. A
/// background detector breaks deadlocks by aborting the youngest
/// transaction on a wait-for cycle.
pub struct LockManager {
    table_lock_map: Mutex<HashMap<TableOid, Arc<LockRequestQueue>>>,
    row_lock_map: Mutex<HashMap<Rid, Arc<LockRequestQueue>>>,
    detection_enabled: Arc<AtomicBool>,
    detector: Mutex<Option<JoinHandle<()>>>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            table_lock_map: Mutex::new(HashMap::new()),
            row_lock_map: Mutex::new(HashMap::new()),
            detection_enabled: Arc::new(AtomicBool::new(false)),
            detector: Mutex::new(None),
        }
    }

    /// Acquire a table lock, blocking until it is granted. `Ok(false)`
    /// means the transaction was aborted (by the deadlock detector) while
    /// waiting and its request has been withdrawn.
    pub fn lock_table(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
    ) -> Result<bool, TransactionAbort> {
        self.check_isolation_level(txn, mode)?;

        let queue = {
            let mut map = self.table_lock_map.lock();
            map.entry(oid)
                .or_insert_with(|| Arc::new(LockRequestQueue::new()))
                .clone()
        };
        self.acquire(
            &queue,
            txn,
            mode,
            |txn, mode| txn.add_table_lock(mode, oid),
            |txn, mode| txn.remove_table_lock(mode, oid),
        )
    }

    /// Acquire a row lock. Intention modes are rejected, and an exclusive
    /// row lock requires X, IX or SIX on the covering table.
    pub fn lock_row(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        rid: Rid,
    ) -> Result<bool, TransactionAbort> {
        if matches!(
            mode,
            LockMode::IntentionShared | LockMode::IntentionExclusive | LockMode::SharedIntentionExclusive
        ) {
            return Err(self.abort(txn, AbortReason::AttemptedIntentionLockOnRow));
        }
        self.check_isolation_level(txn, mode)?;
        if mode == LockMode::Exclusive
            && !txn.is_table_exclusive_locked(oid)
            && !txn.is_table_intention_exclusive_locked(oid)
            && !txn.is_table_shared_intention_exclusive_locked(oid)
        {
            return Err(self.abort(txn, AbortReason::TableLockNotPresent));
        }

        let queue = {
            let mut map = self.row_lock_map.lock();
            map.entry(rid)
                .or_insert_with(|| Arc::new(LockRequestQueue::new()))
                .clone()
        };
        self.acquire(
            &queue,
            txn,
            mode,
            |txn, mode| txn.add_row_lock(mode, oid, rid),
            |txn, mode| txn.remove_row_lock(mode, oid, rid),
        )
    }

    /// Release a table lock. Row locks on the table must go first; the
    /// first isolation-relevant release moves the transaction to Shrinking.
    pub fn unlock_table(&self, txn: &Arc<Transaction>, oid: TableOid) -> Result<(), TransactionAbort> {
        let queue = {
            let map = self.table_lock_map.lock();
            match map.get(&oid) {
                Some(queue) => queue.clone(),
                None => return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld)),
            }
        };
        if txn.holds_row_locks_on(oid) {
            return Err(self.abort(txn, AbortReason::TableUnlockedBeforeUnlockingRows));
        }

        let mode = self.release(&queue, txn)?;
        self.transition_on_unlock(txn, mode);
        txn.remove_table_lock(mode, oid);
        Ok(())
    }

    /// Release a row lock
    pub fn unlock_row(
        &self,
        txn: &Arc<Transaction>,
        oid: TableOid,
        rid: Rid,
    ) -> Result<(), TransactionAbort> {
        let queue = {
            let map = self.row_lock_map.lock();
            match map.get(&rid) {
                Some(queue) => queue.clone(),
                None => return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld)),
            }
        };

        let mode = self.release(&queue, txn)?;
        self.transition_on_unlock(txn, mode);
        txn.remove_row_lock(mode, oid, rid);
        Ok(())
    }

    /// Drop every request the transaction still has queued or granted,
    /// without state transitions. Used at commit/abort, after the terminal
    /// state is already set.
    pub fn release_all_locks(&self, txn: &Arc<Transaction>) {
        for (mode, oid, rid) in txn.row_locks() {
            if let Some(queue) = self.row_lock_map.lock().get(&rid).cloned() {
                Self::withdraw(&queue, txn.id());
            }
            txn.remove_row_lock(mode, oid, rid);
        }
        for (mode, oid) in txn.table_locks() {
            if let Some(queue) = self.table_lock_map.lock().get(&oid).cloned() {
                Self::withdraw(&queue, txn.id());
            }
            txn.remove_table_lock(mode, oid);
        }
    }

    /// Spawn the background deadlock detector. It rebuilds the wait-for
    /// graph from the queues every `CYCLE_DETECTION_INTERVAL` and aborts
    /// the youngest transaction on each cycle it finds.
    pub fn start_cycle_detection(self: &Arc<Self>) {
        let mut detector = self.detector.lock();
        if detector.is_some() {
            return;
        }
        self.detection_enabled.store(true, Ordering::SeqCst);
        let enabled = self.detection_enabled.clone();
        let manager = Arc::downgrade(self);
        *detector = Some(std::thread::spawn(move || {
            while enabled.load(Ordering::SeqCst) {
                std::thread::sleep(CYCLE_DETECTION_INTERVAL);
                match manager.upgrade() {
                    Some(manager) => {
                        manager.detect_deadlocks();
                    }
                    None => break,
                }
            }
        }));
    }

    pub fn stop_cycle_detection(&self) {
        self.detection_enabled.store(false, Ordering::SeqCst);
        if let Some(handle) = self.detector.lock().take() {
            let _ = handle.join();
        }
    }

    /// Edge list of the wait-for graph as it stands right now
    pub fn waits_for_edges(&self) -> Vec<(TxnId, TxnId)> {
        let (graph, _, _) = self.build_waits_for_graph();
        graph.edges()
    }

    /// One detection pass: build the wait-for graph, abort the youngest
    /// transaction of every cycle, and wake all queues so victims unwind.
    /// Returns the victims, oldest pass first.
    pub fn detect_deadlocks(&self) -> Vec<TxnId> {
        let (mut graph, transactions, queues) = self.build_waits_for_graph();

        let mut victims = Vec::new();
        while let Some(victim) = graph.has_cycle() {
            warn!("deadlock detected, aborting youngest transaction {}", victim);
            if let Some(txn) = transactions.get(&victim) {
                txn.set_state(TransactionState::Aborted);
            }
            graph.remove_txn(victim);
            victims.push(victim);
        }
        if !victims.is_empty() {
            for queue in &queues {
                queue.cv.notify_all();
            }
        }
        victims
    }

    /// Collect an edge per (waiter, incompatible holder) pair across every
    /// queue, plus the handles needed to abort and wake
    #[allow(clippy::type_complexity)]
    fn build_waits_for_graph(
        &self,
    ) -> (
        WaitsForGraph,
        HashMap<TxnId, Arc<Transaction>>,
        Vec<Arc<LockRequestQueue>>,
    ) {
        let queues: Vec<Arc<LockRequestQueue>> = {
            let tables = self.table_lock_map.lock();
            let rows = self.row_lock_map.lock();
            tables.values().chain(rows.values()).cloned().collect()
        };

        let mut graph = WaitsForGraph::new();
        let mut transactions: HashMap<TxnId, Arc<Transaction>> = HashMap::new();
        for queue in &queues {
            let state = queue.state.lock();
            for request in &state.requests {
                transactions
                    .entry(request.txn.id())
                    .or_insert_with(|| request.txn.clone());
            }
            for waiter in state.requests.iter().filter(|r| !r.granted) {
                for holder in state.requests.iter().filter(|r| r.granted) {
                    if !Self::compatible(holder.mode, waiter.mode) {
                        graph.add_edge(waiter.txn.id(), holder.txn.id());
                    }
                }
            }
        }
        (graph, transactions, queues)
    }

    /// Held/requested compatibility matrix
    fn compatible(held: LockMode, requested: LockMode) -> bool {
        use LockMode::*;
        match (held, requested) {
            (IntentionShared, Exclusive) => false,
            (IntentionShared, _) => true,
            (IntentionExclusive, IntentionShared | IntentionExclusive) => true,
            (IntentionExclusive, _) => false,
            (Shared, IntentionShared | Shared) => true,
            (Shared, _) => false,
            (SharedIntentionExclusive, IntentionShared) => true,
            (SharedIntentionExclusive, _) => false,
            (Exclusive, _) => false,
        }
    }

    /// Permitted upgrade transitions: IS -> {S, X, IX, SIX},
    /// S -> {X, SIX}, IX -> {X, SIX}, SIX -> {X}
    fn upgrade_allowed(held: LockMode, requested: LockMode) -> bool {
        use LockMode::*;
        matches!(
            (held, requested),
            (IntentionShared, Shared | Exclusive | IntentionExclusive | SharedIntentionExclusive)
                | (Shared, Exclusive | SharedIntentionExclusive)
                | (IntentionExclusive, Exclusive | SharedIntentionExclusive)
                | (SharedIntentionExclusive, Exclusive)
        )
    }

    /// Enforce the isolation level's lock-acquisition rules
    fn check_isolation_level(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
    ) -> Result<(), TransactionAbort> {
        use LockMode::*;
        match txn.isolation_level() {
            IsolationLevel::ReadUncommitted => {
                if matches!(mode, Shared | IntentionShared | SharedIntentionExclusive) {
                    return Err(self.abort(txn, AbortReason::LockSharedOnReadUncommitted));
                }
                if txn.state() == TransactionState::Shrinking
                    && matches!(mode, Exclusive | IntentionExclusive)
                {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadCommitted => {
                if txn.state() == TransactionState::Shrinking
                    && !matches!(mode, IntentionShared | Shared)
                {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::RepeatableRead => {
                if txn.state() == TransactionState::Shrinking {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
        }
        Ok(())
    }

    /// Queue a request (or an upgrade) and wait until it can be granted
    fn acquire(
        &self,
        queue: &Arc<LockRequestQueue>,
        txn: &Arc<Transaction>,
        mode: LockMode,
        record: impl Fn(&Transaction, LockMode),
        erase: impl Fn(&Transaction, LockMode),
    ) -> Result<bool, TransactionAbort> {
        let mut state = queue.state.lock();

        let mut upgrading = false;
        if let Some(pos) = state.requests.iter().position(|r| r.txn.id() == txn.id()) {
            let held = state.requests[pos].mode;
            if held == mode {
                return Ok(true);
            }
            if state.upgrading != INVALID_TXN_ID {
                drop(state);
                return Err(self.abort(txn, AbortReason::UpgradeConflict));
            }
            if !Self::upgrade_allowed(held, mode) {
                drop(state);
                return Err(self.abort(txn, AbortReason::IncompatibleUpgrade));
            }

            // Re-queue: the upgraded request goes ahead of every waiter
            // that has not been granted yet
            state.requests.remove(pos);
            erase(txn, held);
            let insert_at = state
                .requests
                .iter()
                .position(|r| !r.granted)
                .unwrap_or(state.requests.len());
            state.requests.insert(
                insert_at,
                LockRequest {
                    txn: txn.clone(),
                    mode,
                    granted: false,
                },
            );
            state.upgrading = txn.id();
            upgrading = true;
        } else {
            state.requests.push_back(LockRequest {
                txn: txn.clone(),
                mode,
                granted: false,
            });
        }

        while !Self::grantable(&state, txn.id(), mode) {
            queue.cv.wait(&mut state);
            if txn.state() == TransactionState::Aborted {
                if upgrading {
                    state.upgrading = INVALID_TXN_ID;
                }
                Self::remove_request(&mut state, txn.id());
                queue.cv.notify_all();
                debug!("transaction {} gave up waiting after abort", txn.id());
                return Ok(false);
            }
        }

        if upgrading {
            state.upgrading = INVALID_TXN_ID;
        }
        if let Some(request) = state
            .requests
            .iter_mut()
            .find(|r| r.txn.id() == txn.id())
        {
            request.granted = true;
        }
        record(txn, mode);
        if mode != LockMode::Exclusive {
            queue.cv.notify_all();
        }
        Ok(true)
    }

    /// Head-first grant check: every granted request must be compatible,
    /// and no older ungranted request may be bypassed
    fn grantable(state: &QueueState, txn_id: TxnId, mode: LockMode) -> bool {
        for request in &state.requests {
            if request.granted {
                if !Self::compatible(request.mode, mode) {
                    return false;
                }
            } else {
                return request.txn.id() == txn_id;
            }
        }
        false
    }

    /// Remove the transaction's granted request from a queue and wake
    /// waiters; reports the released mode
    fn release(
        &self,
        queue: &Arc<LockRequestQueue>,
        txn: &Arc<Transaction>,
    ) -> Result<LockMode, TransactionAbort> {
        let mut state = queue.state.lock();
        let pos = state
            .requests
            .iter()
            .position(|r| r.txn.id() == txn.id() && r.granted);
        match pos {
            Some(pos) => {
                let request = state.requests.remove(pos).expect("position just found");
                queue.cv.notify_all();
                Ok(request.mode)
            }
            None => {
                drop(state);
                Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld))
            }
        }
    }

    /// The first "real" release begins the shrinking phase:
    /// REPEATABLE READ on S or X, READ COMMITTED and READ UNCOMMITTED on X
    fn transition_on_unlock(&self, txn: &Arc<Transaction>, mode: LockMode) {
        let shrink = match txn.isolation_level() {
            IsolationLevel::RepeatableRead => {
                matches!(mode, LockMode::Shared | LockMode::Exclusive)
            }
            IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => {
                mode == LockMode::Exclusive
            }
        };
        if shrink
            && txn.state() != TransactionState::Committed
            && txn.state() != TransactionState::Aborted
        {
            txn.set_state(TransactionState::Shrinking);
        }
    }

    fn withdraw(queue: &Arc<LockRequestQueue>, txn_id: TxnId) {
        let mut state = queue.state.lock();
        if state.upgrading == txn_id {
            state.upgrading = INVALID_TXN_ID;
        }
        if Self::remove_request(&mut state, txn_id) {
            queue.cv.notify_all();
        }
    }

    fn remove_request(state: &mut MutexGuard<'_, QueueState>, txn_id: TxnId) -> bool {
        let before = state.requests.len();
        state.requests.retain(|r| r.txn.id() != txn_id);
        state.requests.len() != before
    }

    fn abort(&self, txn: &Arc<Transaction>, reason: AbortReason) -> TransactionAbort {
        txn.set_state(TransactionState::Aborted);
        debug!("transaction {} aborted: {}", txn.id(), reason);
        TransactionAbort {
            txn_id: txn.id(),
            reason,
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.detection_enabled.store(false, Ordering::SeqCst);
        if let Some(handle) = self.detector.get_mut().take() {
            let _ = handle.join();
        }
    }
}
