use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::TxnId;
use crate::transaction::concurrency::lock_manager::LockManager;
use crate::transaction::concurrency::transaction::{
    IsolationLevel, Transaction, TransactionState,
};

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Transaction {0} is not active")]
    NotActive(TxnId),
}

/// Creates and tracks transactions, and tears their locks down at the end
/// of their lifetime. Commit and abort set the terminal state first so the
/// lock releases cannot re-trigger shrinking transitions.
pub struct TransactionManager {
    next_txn_id: AtomicI32,
    lock_manager: Arc<LockManager>,
    active: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicI32::new(0),
            lock_manager,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Start a transaction at the given isolation level
    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id, isolation_level));
        self.active.lock().insert(txn_id, txn.clone());
        txn
    }

    pub fn get_transaction(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.active.lock().get(&txn_id).cloned()
    }

    /// Commit: mark committed, then release every lock
    pub fn commit(&self, txn: &Arc<Transaction>) -> Result<(), TransactionError> {
        self.terminate(txn, TransactionState::Committed)
    }

    /// Abort: mark aborted, then release every lock. Also the cleanup path
    /// for deadlock victims once their waiting call has returned.
    pub fn abort(&self, txn: &Arc<Transaction>) -> Result<(), TransactionError> {
        self.terminate(txn, TransactionState::Aborted)
    }

    fn terminate(
        &self,
        txn: &Arc<Transaction>,
        state: TransactionState,
    ) -> Result<(), TransactionError> {
        match txn.state() {
            TransactionState::Growing | TransactionState::Shrinking => {}
            // A deadlock victim is already aborted but still holds locks
            TransactionState::Aborted if state == TransactionState::Aborted => {}
            _ => return Err(TransactionError::NotActive(txn.id())),
        }
        txn.set_state(state);
        self.lock_manager.release_all_locks(txn);
        self.active.lock().remove(&txn.id());
        Ok(())
    }
}
