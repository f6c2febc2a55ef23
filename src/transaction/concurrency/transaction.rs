use std::collections::{HashMap, HashSet};

use parking_lot::{Mutex, RwLock};

use crate::common::types::{Rid, TableOid, TxnId};
use crate::transaction::concurrency::lock_manager::LockMode;

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Two-phase locking lifecycle. A transaction grows until its first
/// isolation-relevant release, shrinks afterwards, and ends committed or
/// aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// Every lock a transaction currently holds, grouped by mode. Row locks are
/// tracked per table so releasing a table can verify its rows went first.
#[derive(Default)]
struct LockSets {
    shared_tables: HashSet<TableOid>,
    exclusive_tables: HashSet<TableOid>,
    intention_shared_tables: HashSet<TableOid>,
    intention_exclusive_tables: HashSet<TableOid>,
    shared_intention_exclusive_tables: HashSet<TableOid>,
    shared_rows: HashMap<TableOid, HashSet<Rid>>,
    exclusive_rows: HashMap<TableOid, HashSet<Rid>>,
}

/// A transaction handle as the lock manager sees it: identity, isolation
/// level, lifecycle state and the sets of locks currently held. The handle
/// is shared across threads; the lock manager and the deadlock detector
/// both mutate it.
pub struct Transaction {
    id: TxnId,
    isolation_level: IsolationLevel,
    state: RwLock<TransactionState>,
    lock_sets: Mutex<LockSets>,
}

impl Transaction {
    pub fn new(id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: RwLock::new(TransactionState::Growing),
            lock_sets: Mutex::new(LockSets::default()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.read()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.write() = state;
    }

    pub fn is_table_shared_locked(&self, oid: TableOid) -> bool {
        self.lock_sets.lock().shared_tables.contains(&oid)
    }

    pub fn is_table_exclusive_locked(&self, oid: TableOid) -> bool {
        self.lock_sets.lock().exclusive_tables.contains(&oid)
    }

    pub fn is_table_intention_shared_locked(&self, oid: TableOid) -> bool {
        self.lock_sets.lock().intention_shared_tables.contains(&oid)
    }

    pub fn is_table_intention_exclusive_locked(&self, oid: TableOid) -> bool {
        self.lock_sets.lock().intention_exclusive_tables.contains(&oid)
    }

    pub fn is_table_shared_intention_exclusive_locked(&self, oid: TableOid) -> bool {
        self.lock_sets
            .lock()
            .shared_intention_exclusive_tables
            .contains(&oid)
    }

    pub fn is_row_shared_locked(&self, oid: TableOid, rid: Rid) -> bool {
        self.lock_sets
            .lock()
            .shared_rows
            .get(&oid)
            .is_some_and(|rows| rows.contains(&rid))
    }

    pub fn is_row_exclusive_locked(&self, oid: TableOid, rid: Rid) -> bool {
        self.lock_sets
            .lock()
            .exclusive_rows
            .get(&oid)
            .is_some_and(|rows| rows.contains(&rid))
    }

    /// True while any row of `oid` is still locked; a table lock may not be
    /// released before its rows
    pub fn holds_row_locks_on(&self, oid: TableOid) -> bool {
        let sets = self.lock_sets.lock();
        sets.shared_rows.get(&oid).is_some_and(|rows| !rows.is_empty())
            || sets.exclusive_rows.get(&oid).is_some_and(|rows| !rows.is_empty())
    }

    /// Snapshot of held table locks as (mode, oid)
    pub fn table_locks(&self) -> Vec<(LockMode, TableOid)> {
        let sets = self.lock_sets.lock();
        let mut locks = Vec::new();
        locks.extend(sets.shared_tables.iter().map(|&o| (LockMode::Shared, o)));
        locks.extend(sets.exclusive_tables.iter().map(|&o| (LockMode::Exclusive, o)));
        locks.extend(
            sets.intention_shared_tables
                .iter()
                .map(|&o| (LockMode::IntentionShared, o)),
        );
        locks.extend(
            sets.intention_exclusive_tables
                .iter()
                .map(|&o| (LockMode::IntentionExclusive, o)),
        );
        locks.extend(
            sets.shared_intention_exclusive_tables
                .iter()
                .map(|&o| (LockMode::SharedIntentionExclusive, o)),
        );
        locks
    }

    /// Snapshot of held row locks as (mode, oid, rid)
    pub fn row_locks(&self) -> Vec<(LockMode, TableOid, Rid)> {
        let sets = self.lock_sets.lock();
        let mut locks = Vec::new();
        for (&oid, rows) in &sets.shared_rows {
            locks.extend(rows.iter().map(|&rid| (LockMode::Shared, oid, rid)));
        }
        for (&oid, rows) in &sets.exclusive_rows {
            locks.extend(rows.iter().map(|&rid| (LockMode::Exclusive, oid, rid)));
        }
        locks
    }

    pub(crate) fn add_table_lock(&self, mode: LockMode, oid: TableOid) {
        let mut sets = self.lock_sets.lock();
        Self::table_set(&mut sets, mode).insert(oid);
    }

    pub(crate) fn remove_table_lock(&self, mode: LockMode, oid: TableOid) {
        let mut sets = self.lock_sets.lock();
        Self::table_set(&mut sets, mode).remove(&oid);
    }

    pub(crate) fn add_row_lock(&self, mode: LockMode, oid: TableOid, rid: Rid) {
        let mut sets = self.lock_sets.lock();
        if let Some(rows) = Self::row_map(&mut sets, mode) {
            rows.entry(oid).or_default().insert(rid);
        }
    }

    pub(crate) fn remove_row_lock(&self, mode: LockMode, oid: TableOid, rid: Rid) {
        let mut sets = self.lock_sets.lock();
        if let Some(rows) = Self::row_map(&mut sets, mode) {
            if let Some(set) = rows.get_mut(&oid) {
                set.remove(&rid);
            }
        }
    }

    fn table_set(sets: &mut LockSets, mode: LockMode) -> &mut HashSet<TableOid> {
        match mode {
            LockMode::Shared => &mut sets.shared_tables,
            LockMode::Exclusive => &mut sets.exclusive_tables,
            LockMode::IntentionShared => &mut sets.intention_shared_tables,
            LockMode::IntentionExclusive => &mut sets.intention_exclusive_tables,
            LockMode::SharedIntentionExclusive => &mut sets.shared_intention_exclusive_tables,
        }
    }

    fn row_map(
        sets: &mut LockSets,
        mode: LockMode,
    ) -> Option<&mut HashMap<TableOid, HashSet<Rid>>> {
        match mode {
            LockMode::Shared => Some(&mut sets.shared_rows),
            LockMode::Exclusive => Some(&mut sets.exclusive_rows),
            // Intention modes never reach rows
            _ => None,
        }
    }
}
