//! State management
//!
//! Handles:
//! - Transaction record persistence (the durable state of the lifecycle)
//! - UTXO inputs spent by in-flight records
//! - Monitoring lock leases
//!
//! PostgreSQL is the production backend; the in-memory store mirrors its
//! semantics for tests and dry runs.

mod manager;
mod memory;
mod model;

pub use manager::StateManager;
pub use memory::MemoryStore;
pub use model::{
    ChainFamily, ChainType, LockAttempt, MonitoringLockRecord, NewTransaction, TransactionInfo,
    TransactionInput, TransactionRecord, TransactionStatus,
};

use crate::error::{EngineError, EngineResult};

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Durable transaction table
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Persist a CREATED record and return it with its assigned id
    async fn create_transaction(&self, tx: NewTransaction) -> EngineResult<TransactionRecord>;

    async fn get_transaction(&self, id: i64) -> EngineResult<Option<TransactionRecord>>;

    /// Records of one chain in `status`, ordered by increasing id
    async fn transactions_in_status(
        &self,
        chain: ChainType,
        status: TransactionStatus,
    ) -> EngineResult<Vec<TransactionRecord>>;

    /// Read-modify-write of a single record. Rejects status changes that are
    /// not edges of the lifecycle graph and any change to a terminal record.
    async fn update_transaction(&self, record: &TransactionRecord) -> EngineResult<()>;

    /// Store a PREPARED record together with the inputs it spends
    async fn save_prepared(
        &self,
        record: &TransactionRecord,
        inputs: &[TransactionInput],
    ) -> EngineResult<()>;

    /// Atomically create `replacement`, link `old.replaced_by` to it and move
    /// `old` to `old_status` (REPLACED or REPLACED_PENDING).
    async fn replace_transaction(
        &self,
        old: &TransactionRecord,
        old_status: TransactionStatus,
        replacement: NewTransaction,
        now: DateTime<Utc>,
    ) -> EngineResult<TransactionRecord>;

    /// The record whose `replaced_by` points at `id`
    async fn replaced_predecessor(&self, id: i64) -> EngineResult<Option<TransactionRecord>>;

    /// Non-terminal records funded by `source`
    async fn open_transactions_for_source(
        &self,
        chain: ChainType,
        source: &str,
    ) -> EngineResult<Vec<TransactionRecord>>;

    async fn find_by_hash(
        &self,
        chain: ChainType,
        hash: &str,
    ) -> EngineResult<Option<TransactionRecord>>;

    /// Non-terminal records spending change of `id`
    async fn descendants(&self, id: i64) -> EngineResult<Vec<TransactionRecord>>;

    async fn inputs(&self, transaction_id: i64) -> EngineResult<Vec<TransactionInput>>;

    /// Inputs of all in-flight records of `chain`
    async fn locked_inputs(&self, chain: ChainType) -> EngineResult<Vec<TransactionInput>>;
}

/// Lease table backing the monitoring lock
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Create, take over (lease expired) or refuse, inside one transaction
    async fn try_acquire_lock(
        &self,
        chain: ChainType,
        owner: &str,
        now_ms: i64,
        expiration_ms: i64,
    ) -> EngineResult<LockAttempt>;

    /// Refresh `last_ping` only while `owner` still holds the row
    async fn ping_lock(&self, chain: ChainType, owner: &str, now_ms: i64) -> EngineResult<bool>;

    /// Compare-and-clear
    async fn release_lock(&self, chain: ChainType, owner: &str) -> EngineResult<bool>;

    async fn get_lock(&self, chain: ChainType) -> EngineResult<Option<MonitoringLockRecord>>;
}

/// Everything a monitor needs from persistence
pub trait Store: TransactionStore + LockStore {}

impl<T: TransactionStore + LockStore> Store for T {}

/// Shared checks for `update_transaction` implementations
pub(crate) fn check_update(
    current: TransactionStatus,
    next: TransactionStatus,
) -> EngineResult<()> {
    if current.is_terminal() || (current != next && !current.can_transition_to(next)) {
        return Err(EngineError::InvalidStateTransition {
            from: current,
            to: next,
        });
    }
    Ok(())
}

/// Retry a write that failed on a database conflict, bounded by `max_elapsed`
pub async fn retry_on_conflict<T, F, Fut>(max_elapsed: Duration, mut op: F) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    let policy = ExponentialBackoff {
        initial_interval: Duration::from_millis(50),
        max_interval: Duration::from_secs(1),
        multiplier: 2.0,
        max_elapsed_time: Some(max_elapsed),
        ..Default::default()
    };

    backoff::future::retry(policy, || {
        let attempt = op();
        async move {
            attempt.await.map_err(|e| {
                if e.is_write_conflict() {
                    warn!("Retrying write after conflict: {}", e);
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        }
    })
    .await
}
