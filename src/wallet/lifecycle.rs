//! Chain-agnostic drivers moving records through their lifecycle
//!
//! ```text
//! CREATED -> PREPARED -> SUBMITTED -> SUCCESS
//!               |            \-> PENDING -> SUCCESS
//!               |                   \-> REPLACED / REPLACED_PENDING -> [new record]
//!               \-> SUBMISSION_FAILED -> REPLACED -> [new record]
//! any non-terminal -> FAILED
//! ```
//!
//! Every driver reads the chain first and writes the record last, in one
//! short store transaction. Transient errors leave the record untouched so
//! the next monitor iteration retries it.

use super::policy;
use super::{ChainWallet, SigningKeys, SubmitOutcome};
use crate::chain::{evaluate_finality, Finality};
use crate::error::{EngineError, EngineResult};
use crate::state::{
    retry_on_conflict, NewTransaction, TransactionInfo, TransactionRecord, TransactionStatus,
    TransactionStore,
};

use chrono::Utc;
use tracing::{debug, info, warn};

/// Prepare, sign, persist as PREPARED and broadcast a CREATED record
pub async fn process_created(
    wallet: &dyn ChainWallet,
    mut record: TransactionRecord,
) -> EngineResult<()> {
    let block = wallet.current_block().await?;
    if let Some(reason) = policy::deadline_exceeded(&record, wallet.settings(), &block) {
        return fail_record(wallet, record, reason).await;
    }

    let signers: Vec<&str> = std::iter::once(record.source.as_str())
        .chain(record.fee_source.as_deref())
        .collect();
    let keys = SigningKeys::load(wallet.context().keys.as_ref(), signers);
    let keys = match keys {
        Ok(keys) => keys,
        Err(e) if e.is_record_fatal() => return fail_record(wallet, record, e.to_string()).await,
        Err(e) => return Err(e),
    };

    let prepared = wallet.prepare(&record).await;
    let prepared = match prepared {
        Ok(prepared) => prepared,
        Err(e) if e.is_record_fatal() => return fail_record(wallet, record, e.to_string()).await,
        Err(e) => return Err(e),
    };

    if let Err(e) = policy::check_max_fee(prepared.fee, record.max_fee) {
        return fail_record(wallet, record, e.to_string()).await;
    }

    let signed = match wallet.sign(&prepared, &keys) {
        Ok(signed) => signed,
        Err(e) => return fail_record(wallet, record, e.to_string()).await,
    };

    record.fee = Some(prepared.fee);
    record.raw = Some(signed.blob);
    record.transaction_hash = Some(signed.hash);
    record.ancestor = prepared.ancestor;
    record.transition(TransactionStatus::Prepared, Utc::now())?;

    let store = wallet.store();
    retry_on_conflict(wallet.context().retry_budget, || {
        store.save_prepared(&record, &prepared.inputs)
    })
    .await?;

    info!(
        "Transaction {} on chain {} prepared with fee {} (hash {:?})",
        record.id, record.chain, prepared.fee, record.transaction_hash
    );

    submit_prepared(wallet, record).await
}

/// Broadcast the stored signed payload and classify the answer
pub async fn submit_prepared(
    wallet: &dyn ChainWallet,
    mut record: TransactionRecord,
) -> EngineResult<()> {
    let block = wallet.current_block().await?;
    if let Some(reason) = policy::deadline_exceeded(&record, wallet.settings(), &block) {
        return fail_record(wallet, record, reason).await;
    }

    let blob = record.raw.clone().ok_or_else(|| {
        EngineError::Internal(format!("Transaction {} has no signed payload", record.id))
    })?;

    let response = wallet.submit(&blob, &record).await?;
    let now = Utc::now();
    record.server_submit_response = Some(response.message.clone());

    match response.outcome {
        SubmitOutcome::Submitted | SubmitOutcome::Pending => {
            record.submitted_in_block = Some(block.number);
            record.submitted_in_timestamp = Some(now);
            let next = if response.outcome == SubmitOutcome::Submitted {
                TransactionStatus::Submitted
            } else {
                TransactionStatus::Pending
            };
            record.transition(next, now)?;
            crate::metrics::record_tx_submitted(record.chain);
            info!(
                "Transaction {} on chain {} broadcast in block {}: {} ({})",
                record.id, record.chain, block.number, next, response.message
            );
        }
        SubmitOutcome::FeeTooLow => {
            record.transition(TransactionStatus::SubmissionFailed, now)?;
            warn!(
                "Transaction {} on chain {} rejected for low fee {:?}: {}",
                record.id, record.chain, record.fee, response.message
            );
        }
        SubmitOutcome::Rejected => {
            let reason = format!("submission rejected: {}", response.message);
            return fail_record(wallet, record, reason).await;
        }
    }

    persist(wallet, &record).await
}

/// Supersede `record` (SUBMISSION_FAILED or stuck PENDING) by a new record
/// with an escalated fee, then prepare and broadcast the replacement.
pub async fn resubmit(
    wallet: &dyn ChainWallet,
    record: TransactionRecord,
    old_status: TransactionStatus,
) -> EngineResult<()> {
    let block = wallet.current_block().await?;
    if let Some(reason) = policy::deadline_exceeded(&record, wallet.settings(), &block) {
        return fail_record(wallet, record, reason).await;
    }

    let escalated = record
        .fee
        .map(|fee| policy::escalate_fee(fee, wallet.settings().fee_escalation_percent));
    let floor = wallet.replacement_fee_floor(&record).await?;
    let new_fee = match escalated {
        Some(fee) => Some(fee.max(floor)),
        None if floor > 0 => Some(floor),
        None => None,
    };

    if let Some(fee) = new_fee {
        if let Err(e) = policy::check_max_fee(fee, record.max_fee) {
            let reason = format!("cannot replace transaction: {}", e);
            return fail_record(wallet, record, reason).await;
        }
        if let (true, Some(amount)) = (record.pay_fee_from_amount, record.amount) {
            if fee >= amount {
                let reason = format!(
                    "cannot replace transaction: fee {} would consume amount {}",
                    fee, amount
                );
                return fail_record(wallet, record, reason).await;
            }
        }
    }

    let replacement = NewTransaction {
        chain: record.chain,
        source: record.source.clone(),
        destination: record.destination.clone(),
        fee_source: record.fee_source.clone(),
        amount: record.amount,
        fee: new_fee,
        max_fee: record.max_fee,
        reference: record.reference.clone(),
        pay_fee_from_amount: record.pay_fee_from_amount,
        execute_until_block: record.execute_until_block,
        execute_until_timestamp: record.execute_until_timestamp,
        ancestor: None,
    };

    let store = wallet.store();
    let now = Utc::now();
    let created = retry_on_conflict(wallet.context().retry_budget, || {
        store.replace_transaction(&record, old_status, replacement.clone(), now)
    })
    .await?;

    crate::metrics::record_tx_replaced(record.chain);
    info!(
        "Transaction {} on chain {} marked {} and replaced by {} with fee {:?} (was {:?})",
        record.id, record.chain, old_status, created.id, new_fee, record.fee
    );

    process_created(wallet, created).await
}

/// SUBMITTED: final confirmation, or PENDING when the node does not see it.
/// A record left unconfirmed past the pending timeout or its deadline also
/// moves to PENDING, where the strategy replaces or fails it.
pub async fn check_submitted(
    wallet: &dyn ChainWallet,
    mut record: TransactionRecord,
) -> EngineResult<()> {
    let hash = require_hash(&record)?;

    match wallet.fetch_transaction(&hash).await? {
        None => {
            record.transition(TransactionStatus::Pending, Utc::now())?;
            debug!(
                "Transaction {} on chain {} not visible yet, now PENDING",
                record.id, record.chain
            );
            persist(wallet, &record).await
        }
        Some(tx) if tx.block_number.is_some() => {
            let block = wallet.current_block().await?;
            match evaluate_finality(&tx, block.number, wallet.settings().confirmations()) {
                Finality::Final { success } => finalize(wallet, record, success, tx.result).await,
                _ => Ok(()),
            }
        }
        Some(_) => {
            let block = wallet.current_block().await?;
            let now = Utc::now();
            let timed_out =
                policy::pending_timed_out(&record, wallet.settings().pending_timeout(), now);
            let expired = policy::deadline_exceeded(&record, wallet.settings(), &block).is_some();
            if !timed_out && !expired {
                return Ok(());
            }

            record.transition(TransactionStatus::Pending, now)?;
            info!(
                "Transaction {} on chain {} still unconfirmed at block {}, now PENDING",
                record.id, record.chain, block.number
            );
            persist(wallet, &record).await
        }
    }
}

/// REPLACED_PENDING: whichever of the original and its replacements lands
/// decides the outcome.
pub async fn check_replaced_pending(
    wallet: &dyn ChainWallet,
    mut record: TransactionRecord,
) -> EngineResult<()> {
    let hash = require_hash(&record)?;
    let on_chain = wallet.fetch_transaction(&hash).await?;

    if let Some(tx) = &on_chain {
        if tx.block_number.is_some() {
            let block = wallet.current_block().await?;
            return match evaluate_finality(tx, block.number, wallet.settings().confirmations()) {
                Finality::Final { success } => {
                    let id = record.id;
                    finalize(wallet, record.clone(), success, tx.result.clone()).await?;
                    let reason = format!("superseded: original transaction {} landed on chain", id);
                    fail_successors(wallet, &record, &reason).await
                }
                _ => Ok(()),
            };
        }
    }

    let Some(mut next_id) = record.replaced_by else {
        return Ok(());
    };

    // Walk to the newest replacement
    let store = wallet.store();
    let mut waiting_between = false;
    let latest = loop {
        let current = store
            .get_transaction(next_id)
            .await?
            .ok_or(EngineError::TransactionNotFound { id: next_id })?;
        match (current.status, current.replaced_by) {
            (TransactionStatus::ReplacedPending, Some(next)) => {
                waiting_between = true;
                next_id = next;
            }
            (TransactionStatus::Replaced, Some(next)) => next_id = next,
            _ => break current,
        }
    };

    match latest.status {
        TransactionStatus::Success => {
            record.transition(TransactionStatus::Replaced, Utc::now())?;
            info!(
                "Transaction {} on chain {} replaced by successful transaction {}",
                record.id, record.chain, latest.id
            );
            persist(wallet, &record).await
        }
        TransactionStatus::Failed if on_chain.is_none() && !waiting_between => {
            let reason = format!(
                "replacement {} failed and original is not on chain",
                latest.id
            );
            fail_record(wallet, record, reason).await
        }
        _ => Ok(()),
    }
}

/// Settle a record confirmed on chain
pub async fn finalize(
    wallet: &dyn ChainWallet,
    mut record: TransactionRecord,
    success: bool,
    result: Option<String>,
) -> EngineResult<()> {
    if !success {
        let reason = format!(
            "transaction failed on chain: {}",
            result.as_deref().unwrap_or("unknown result")
        );
        return fail_record(wallet, record, reason).await;
    }

    record.transition(TransactionStatus::Success, Utc::now())?;
    persist(wallet, &record).await?;

    crate::metrics::record_tx_succeeded(record.chain);
    observe_time_to_final(&record);
    info!(
        "Transaction {} on chain {} confirmed (hash {:?})",
        record.id, record.chain, record.transaction_hash
    );
    Ok(())
}

/// Status view for bots polling a record
pub async fn get_transaction_info<S>(store: &S, id: i64) -> EngineResult<TransactionInfo>
where
    S: TransactionStore + ?Sized,
{
    store
        .get_transaction(id)
        .await?
        .map(|record| record.info())
        .ok_or(EngineError::TransactionNotFound { id })
}

/// Nearest REPLACED_PENDING record up the replacement chain of `id`. Its
/// payload may still land, so every successor must conflict with it.
pub async fn pending_predecessor(
    wallet: &dyn ChainWallet,
    id: i64,
) -> EngineResult<Option<TransactionRecord>> {
    let store = wallet.store();
    let mut current = id;
    while let Some(predecessor) = store.replaced_predecessor(current).await? {
        match predecessor.status {
            TransactionStatus::ReplacedPending => return Ok(Some(predecessor)),
            TransactionStatus::Replaced => current = predecessor.id,
            _ => break,
        }
    }
    Ok(None)
}

/// Mark FAILED with `reason` and persist
pub async fn fail_record(
    wallet: &dyn ChainWallet,
    mut record: TransactionRecord,
    reason: String,
) -> EngineResult<()> {
    warn!(
        "Transaction {} on chain {} failed: {}",
        record.id, record.chain, reason
    );
    record.fail(reason, Utc::now())?;
    persist(wallet, &record).await?;

    crate::metrics::record_tx_failed(record.chain);
    observe_time_to_final(&record);
    Ok(())
}

/// Fail every non-terminal record of the replacement chain after `record`
async fn fail_successors(
    wallet: &dyn ChainWallet,
    record: &TransactionRecord,
    reason: &str,
) -> EngineResult<()> {
    let mut next = record.replaced_by;
    while let Some(id) = next {
        let successor = wallet
            .store()
            .get_transaction(id)
            .await?
            .ok_or(EngineError::TransactionNotFound { id })?;
        next = successor.replaced_by;
        if !successor.status.is_terminal() {
            fail_record(wallet, successor, reason.to_string()).await?;
        }
    }
    Ok(())
}

async fn persist(wallet: &dyn ChainWallet, record: &TransactionRecord) -> EngineResult<()> {
    let store = wallet.store();
    retry_on_conflict(wallet.context().retry_budget, || {
        store.update_transaction(record)
    })
    .await
}

fn require_hash(record: &TransactionRecord) -> EngineResult<String> {
    record.transaction_hash.clone().ok_or_else(|| {
        EngineError::Internal(format!("Transaction {} has no hash", record.id))
    })
}

fn observe_time_to_final(record: &TransactionRecord) {
    if let Some(done) = record.reached_final_status_in_timestamp {
        let secs = (done - record.created_at).num_milliseconds() as f64 / 1000.0;
        crate::metrics::record_time_to_final(record.chain, secs.max(0.0));
    }
}
