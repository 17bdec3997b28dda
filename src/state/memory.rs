//! In-memory store with the same semantics as the PostgreSQL manager

use super::model::{
    ChainType, LockAttempt, MonitoringLockRecord, NewTransaction, TransactionInput,
    TransactionRecord, TransactionStatus,
};
use super::{check_update, LockStore, TransactionStore};
use crate::error::{EngineError, EngineResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    transactions: BTreeMap<i64, TransactionRecord>,
    inputs: HashMap<i64, Vec<TransactionInput>>,
    locks: HashMap<ChainType, MonitoringLockRecord>,
}

/// Single-mutex store; every method is one atomic "database transaction"
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records of a chain ordered by id, for inspection in tests
    pub async fn all_transactions(&self, chain: ChainType) -> Vec<TransactionRecord> {
        let state = self.state.lock().await;
        state
            .transactions
            .values()
            .filter(|t| t.chain == chain)
            .cloned()
            .collect()
    }
}

impl MemoryState {
    fn insert(&mut self, tx: NewTransaction, now: DateTime<Utc>) -> TransactionRecord {
        self.next_id += 1;
        let record = tx.into_record(self.next_id, now);
        self.transactions.insert(record.id, record.clone());
        record
    }

    fn update(&mut self, record: &TransactionRecord) -> EngineResult<()> {
        let current = self
            .transactions
            .get_mut(&record.id)
            .ok_or(EngineError::TransactionNotFound { id: record.id })?;
        check_update(current.status, record.status)?;
        *current = record.clone();
        Ok(())
    }
}

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn create_transaction(&self, tx: NewTransaction) -> EngineResult<TransactionRecord> {
        let mut state = self.state.lock().await;
        Ok(state.insert(tx, Utc::now()))
    }

    async fn get_transaction(&self, id: i64) -> EngineResult<Option<TransactionRecord>> {
        Ok(self.state.lock().await.transactions.get(&id).cloned())
    }

    async fn transactions_in_status(
        &self,
        chain: ChainType,
        status: TransactionStatus,
    ) -> EngineResult<Vec<TransactionRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .values()
            .filter(|t| t.chain == chain && t.status == status)
            .cloned()
            .collect())
    }

    async fn update_transaction(&self, record: &TransactionRecord) -> EngineResult<()> {
        self.state.lock().await.update(record)
    }

    async fn save_prepared(
        &self,
        record: &TransactionRecord,
        inputs: &[TransactionInput],
    ) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        state.update(record)?;
        state.inputs.insert(record.id, inputs.to_vec());
        Ok(())
    }

    async fn replace_transaction(
        &self,
        old: &TransactionRecord,
        old_status: TransactionStatus,
        replacement: NewTransaction,
        now: DateTime<Utc>,
    ) -> EngineResult<TransactionRecord> {
        let mut state = self.state.lock().await;

        let mut superseded = state
            .transactions
            .get(&old.id)
            .cloned()
            .ok_or(EngineError::TransactionNotFound { id: old.id })?;
        if superseded.status != old.status {
            return Err(EngineError::WriteConflict(format!(
                "transaction {} moved to {} concurrently",
                old.id, superseded.status
            )));
        }
        superseded.transition(old_status, now)?;

        let created = state.insert(replacement, now);
        superseded.replaced_by = Some(created.id);
        state.transactions.insert(superseded.id, superseded);
        Ok(created)
    }

    async fn replaced_predecessor(&self, id: i64) -> EngineResult<Option<TransactionRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .values()
            .find(|t| t.replaced_by == Some(id))
            .cloned())
    }

    async fn open_transactions_for_source(
        &self,
        chain: ChainType,
        source: &str,
    ) -> EngineResult<Vec<TransactionRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .values()
            .filter(|t| t.chain == chain && t.source == source && !t.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn find_by_hash(
        &self,
        chain: ChainType,
        hash: &str,
    ) -> EngineResult<Option<TransactionRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .values()
            .find(|t| {
                t.chain == chain
                    && t.transaction_hash
                        .as_deref()
                        .is_some_and(|h| h.eq_ignore_ascii_case(hash))
            })
            .cloned())
    }

    async fn descendants(&self, id: i64) -> EngineResult<Vec<TransactionRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .values()
            .filter(|t| t.ancestor == Some(id) && !t.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn inputs(&self, transaction_id: i64) -> EngineResult<Vec<TransactionInput>> {
        let state = self.state.lock().await;
        Ok(state.inputs.get(&transaction_id).cloned().unwrap_or_default())
    }

    async fn locked_inputs(&self, chain: ChainType) -> EngineResult<Vec<TransactionInput>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .values()
            .filter(|t| t.chain == chain && t.status.is_in_flight())
            .filter_map(|t| state.inputs.get(&t.id))
            .flatten()
            .cloned()
            .collect())
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn try_acquire_lock(
        &self,
        chain: ChainType,
        owner: &str,
        now_ms: i64,
        expiration_ms: i64,
    ) -> EngineResult<LockAttempt> {
        let mut state = self.state.lock().await;
        if let Some(lock) = state.locks.get_mut(&chain) {
            if now_ms > lock.last_ping + expiration_ms {
                lock.process_owner = owner.to_string();
                lock.last_ping = now_ms;
                return Ok(LockAttempt {
                    acquired: true,
                    last_ping: Some(now_ms),
                });
            }
            return Ok(LockAttempt {
                acquired: false,
                last_ping: Some(lock.last_ping),
            });
        }

        state.locks.insert(
            chain,
            MonitoringLockRecord {
                chain,
                process_owner: owner.to_string(),
                last_ping: now_ms,
            },
        );
        Ok(LockAttempt {
            acquired: true,
            last_ping: Some(now_ms),
        })
    }

    async fn ping_lock(&self, chain: ChainType, owner: &str, now_ms: i64) -> EngineResult<bool> {
        let mut state = self.state.lock().await;
        match state.locks.get_mut(&chain) {
            Some(lock) if lock.process_owner == owner => {
                lock.last_ping = now_ms;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, chain: ChainType, owner: &str) -> EngineResult<bool> {
        let mut state = self.state.lock().await;
        match state.locks.get_mut(&chain) {
            Some(lock) if lock.process_owner == owner => {
                lock.process_owner.clear();
                lock.last_ping = 0;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_lock(&self, chain: ChainType) -> EngineResult<Option<MonitoringLockRecord>> {
        Ok(self.state.lock().await.locks.get(&chain).cloned())
    }
}
