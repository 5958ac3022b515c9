//! Transaction registry
//!
//! Tracks named transactions (names are unique while the transaction is
//! live) and transactions with an expiration, whose locks other parties may
//! steal once the deadline passes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use crate::error::{KestrelError, Result};

use super::lock_manager::{LockStealer, TransactionId};
use super::state::{AtomicTransactionState, TransactionState};

/// The part of a transaction visible to other threads
#[derive(Debug)]
pub(crate) struct TxnShared {
    pub(crate) id: TransactionId,
    pub(crate) state: AtomicTransactionState,
    expiration: Mutex<Option<Instant>>,
}

impl TxnShared {
    pub(crate) fn new(id: TransactionId, expiration: Option<Instant>) -> Self {
        Self {
            id,
            state: AtomicTransactionState::new(TransactionState::Started),
            expiration: Mutex::new(expiration),
        }
    }

    pub(crate) fn expiration(&self) -> Option<Instant> {
        *self.expiration.lock()
    }

    /// Prepared transactions never expire
    pub(crate) fn clear_expiration(&self) {
        *self.expiration.lock() = None;
    }

    pub(crate) fn is_expired(&self) -> bool {
        self.expiration().is_some_and(|d| Instant::now() >= d)
    }
}

#[derive(Debug, Default)]
pub struct TransactionRegistry {
    names: Mutex<HashMap<String, TransactionId>>,
    expirable: RwLock<HashMap<TransactionId, Arc<TxnShared>>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register_name(&self, name: &str, id: TransactionId) -> Result<()> {
        let mut names = self.names.lock();
        if names.contains_key(name) {
            return Err(KestrelError::invalid("Transaction name must be unique."));
        }
        names.insert(name.to_string(), id);
        Ok(())
    }

    pub(crate) fn unregister_name(&self, name: &str) {
        self.names.lock().remove(name);
    }

    pub fn is_name_registered(&self, name: &str) -> bool {
        self.names.lock().contains_key(name)
    }

    pub fn transaction_by_name(&self, name: &str) -> Option<TransactionId> {
        self.names.lock().get(name).copied()
    }

    pub(crate) fn register_expirable(&self, shared: Arc<TxnShared>) {
        self.expirable.write().insert(shared.id, shared);
    }

    pub(crate) fn unregister_expirable(&self, id: TransactionId) {
        self.expirable.write().remove(&id);
    }

    /// Move expired transaction `id` to `LOCKS_STOLEN`.
    ///
    /// True when `id` no longer owns its locks: it is unknown here (already
    /// finished), its locks were stolen before, or this call stole them.
    /// Only a transaction still in `STARTED` can be stolen from.
    pub fn try_steal_expired_locks(&self, id: TransactionId) -> bool {
        let expirable = self.expirable.read();
        let Some(shared) = expirable.get(&id) else {
            return true;
        };
        if !shared.is_expired() {
            return false;
        }
        match shared
            .state
            .transition(TransactionState::Started, TransactionState::LocksStolen)
        {
            Ok(()) => {
                tracing::info!(txn = id, "stole locks of expired transaction");
                true
            }
            Err(TransactionState::LocksStolen) => true,
            Err(_) => false,
        }
    }

    /// Ids of registered transactions whose deadline has passed
    pub fn expired_transactions(&self) -> Vec<TransactionId> {
        self.expirable
            .read()
            .values()
            .filter(|s| s.is_expired())
            .map(|s| s.id)
            .collect()
    }

    pub fn num_expirable(&self) -> usize {
        self.expirable.read().len()
    }
}

impl LockStealer for TransactionRegistry {
    fn try_steal(&self, holder: TransactionId) -> bool {
        self.try_steal_expired_locks(holder)
    }
}
