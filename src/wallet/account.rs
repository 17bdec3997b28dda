//! Account-based strategy (XRP Ledger style)
//!
//! Handles:
//! - Sequence allocation across in-flight records and replacements
//! - Fee estimation with buffer, and the account deletion fee
//! - Last-valid-block expiry embedded in the signed payload
//! - Engine result classification and stuck-record replacement

use super::keys::decode_blob;
use super::lifecycle;
use super::policy;
use super::{
    ChainWallet, PaymentRequest, PreparedTransaction, SubmitOutcome, SubmitResponse, WalletContext,
};
use crate::chain::{evaluate_finality, AccountChainApi, BlockInfo, ChainTransaction, Finality};
use crate::error::{EngineError, EngineResult};
use crate::state::{TransactionRecord, TransactionStatus};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountTransactionType {
    Payment,
    AccountDelete,
}

/// Unsigned account-chain transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AccountPayload {
    pub transaction_type: AccountTransactionType,
    pub account: String,
    pub destination: String,
    /// Delivered amount; absent for account deletion
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub amount: Option<u64>,
    pub fee: u64,
    pub sequence: u64,
    /// The ledger drops the transaction after this block
    pub last_ledger_sequence: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub memo: Option<String>,
}

pub struct AccountWallet {
    context: WalletContext,
    api: Arc<dyn AccountChainApi>,
}

impl AccountWallet {
    pub fn new(context: WalletContext, api: Arc<dyn AccountChainApi>) -> Self {
        Self { context, api }
    }

    fn payload_of(record: &TransactionRecord) -> EngineResult<AccountPayload> {
        let raw = record.raw.as_deref().ok_or_else(|| {
            EngineError::Internal(format!("Transaction {} has no signed payload", record.id))
        })?;
        Ok(decode_blob::<AccountPayload>(raw)?.payload)
    }

    /// Sequence for `record`:
    /// - below a REPLACED_PENDING record in the replacement chain: that
    ///   record's, since only one of the two may be applied
    /// - other replacements: the lowest sequence from the account's next one
    ///   that no in-flight record holds, as the expired or rejected
    ///   predecessor never consumed its own
    /// - new record: the next one after every in-flight record of the source
    async fn next_sequence(&self, record: &TransactionRecord, account_sequence: u64) -> EngineResult<u64> {
        if let Some(pinned) = lifecycle::pending_predecessor(self, record.id).await? {
            if pinned.raw.is_some() {
                let sequence = Self::payload_of(&pinned)?.sequence;
                debug!(
                    "Transaction {} on chain {} reuses sequence {} of {}",
                    record.id, record.chain, sequence, pinned.id
                );
                return Ok(sequence);
            }
        }

        let taken = self.in_flight_sequences(record).await?;
        if self.store().replaced_predecessor(record.id).await?.is_some() {
            let mut sequence = account_sequence;
            while taken.contains(&sequence) {
                sequence += 1;
            }
            return Ok(sequence);
        }

        Ok(taken
            .iter()
            .map(|s| s + 1)
            .fold(account_sequence, u64::max))
    }

    /// Sequences held by the other in-flight records of the same source
    async fn in_flight_sequences(&self, record: &TransactionRecord) -> EngineResult<HashSet<u64>> {
        let open = self
            .store()
            .open_transactions_for_source(self.chain(), &record.source)
            .await?;
        let mut taken = HashSet::new();
        for other in open.iter().filter(|t| t.id != record.id && t.status.is_in_flight()) {
            if other.raw.is_none() {
                continue;
            }
            match Self::payload_of(other) {
                Ok(payload) => {
                    taken.insert(payload.sequence);
                }
                Err(e) => warn!(
                    "Ignoring unreadable payload of transaction {} on chain {}: {}",
                    other.id, other.chain, e
                ),
            }
        }
        Ok(taken)
    }

    async fn estimate_fee(&self, record: &TransactionRecord) -> EngineResult<u64> {
        let settings = self.settings();
        let fee = match (record.fee, settings.fixed_fee) {
            (Some(fee), _) => fee,
            (None, Some(fixed)) => fixed,
            (None, None) => policy::with_buffer(self.api.fee().await?, settings.fee_buffer_percent),
        };

        if record.is_delete_account() {
            return Ok(fee.max(settings.delete_account_fee));
        }
        Ok(fee)
    }

    fn classify(result: &str) -> SubmitOutcome {
        match result {
            "tesSUCCESS" | "terQUEUED" | "tefALREADY" => SubmitOutcome::Submitted,
            "telINSUF_FEE_P" | "telCAN_NOT_QUEUE_FEE" => SubmitOutcome::FeeTooLow,
            "tefPAST_SEQ" => SubmitOutcome::Pending,
            r if r.starts_with("ter") || r.starts_with("tel") => SubmitOutcome::Pending,
            _ => SubmitOutcome::Rejected,
        }
    }
}

#[async_trait]
impl ChainWallet for AccountWallet {
    fn context(&self) -> &WalletContext {
        &self.context
    }

    async fn create_payment_transaction(&self, request: PaymentRequest) -> EngineResult<i64> {
        if request.fee_source.is_some() {
            return Err(EngineError::Unsupported {
                chain: self.chain(),
                operation: "separate fee source".to_string(),
            });
        }

        if request.amount.is_none() {
            let open = self
                .store()
                .open_transactions_for_source(self.chain(), &request.source)
                .await?;
            if !open.is_empty() {
                return Err(EngineError::Transaction(format!(
                    "cannot delete {} with {} open transactions",
                    request.source,
                    open.len()
                )));
            }
        }

        self.context.create_checked(request).await
    }

    async fn prepare(&self, record: &TransactionRecord) -> EngineResult<PreparedTransaction> {
        let block = self.api.current_block().await?;
        let account = self
            .api
            .account_info(&record.source)
            .await?
            .ok_or_else(|| {
                EngineError::Transaction(format!("source account {} not found", record.source))
            })?;

        let fee = self.estimate_fee(record).await?;
        let amount = match record.amount {
            Some(amount) => {
                let delivered = policy::amount_after_fee(amount, fee, record.pay_fee_from_amount)?;
                let needed = delivered + fee;
                if account.balance < needed {
                    return Err(EngineError::InsufficientBalance {
                        chain: self.chain(),
                        have: account.balance,
                        need: needed,
                    });
                }
                Some(delivered)
            }
            None => None,
        };

        let sequence = self.next_sequence(record, account.sequence).await?;
        let last_ledger_sequence = record
            .execute_until_block
            .unwrap_or(block.number + self.settings().default_validity_blocks);

        let payload = AccountPayload {
            transaction_type: if record.is_delete_account() {
                AccountTransactionType::AccountDelete
            } else {
                AccountTransactionType::Payment
            },
            account: record.source.clone(),
            destination: record.destination.clone(),
            amount,
            fee,
            sequence,
            last_ledger_sequence,
            memo: record.reference.as_ref().map(hex::encode),
        };

        debug!(
            "Prepared transaction {} on chain {}: sequence {}, fee {}, valid until {}",
            record.id, record.chain, sequence, fee, last_ledger_sequence
        );

        Ok(PreparedTransaction {
            payload: serde_json::to_value(&payload)
                .map_err(|e| EngineError::Internal(e.to_string()))?,
            fee,
            inputs: Vec::new(),
            ancestor: None,
        })
    }

    async fn submit(&self, blob: &str, record: &TransactionRecord) -> EngineResult<SubmitResponse> {
        let response = self.api.submit(blob).await?;
        let outcome = Self::classify(&response.engine_result);
        debug!(
            "Submit of transaction {} on chain {} returned {} ({:?})",
            record.id, record.chain, response.engine_result, outcome
        );

        Ok(SubmitResponse {
            outcome,
            message: format!(
                "{}: {}",
                response.engine_result, response.engine_result_message
            ),
        })
    }

    async fn check_pending(&self, record: TransactionRecord) -> EngineResult<()> {
        let hash = record.transaction_hash.clone().ok_or_else(|| {
            EngineError::Internal(format!("Transaction {} has no hash", record.id))
        })?;

        let block = self.api.current_block().await?;
        if let Some(tx) = self.api.transaction(&hash).await? {
            if tx.block_number.is_some() {
                return match evaluate_finality(&tx, block.number, self.settings().confirmations()) {
                    Finality::Final { success } => {
                        lifecycle::finalize(self, record, success, tx.result).await
                    }
                    _ => Ok(()),
                };
            }
        }

        let payload = Self::payload_of(&record)?;
        if block.number > payload.last_ledger_sequence {
            // The ledger can no longer include it; the sequence is free again
            info!(
                "Transaction {} on chain {} expired at block {} (now {})",
                record.id, record.chain, payload.last_ledger_sequence, block.number
            );
            return lifecycle::resubmit(self, record, TransactionStatus::Replaced).await;
        }

        let timed_out = policy::pending_timed_out(&record, self.settings().pending_timeout(), Utc::now());
        if timed_out && policy::deadline_exceeded(&record, self.settings(), &block).is_none() {
            info!(
                "Transaction {} on chain {} pending for too long, replacing with same sequence {}",
                record.id, record.chain, payload.sequence
            );
            return lifecycle::resubmit(self, record, TransactionStatus::ReplacedPending).await;
        }

        Ok(())
    }

    async fn check_network_status(&self) -> bool {
        match self.api.current_block().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Network check failed for chain {}: {}", self.chain(), e);
                false
            }
        }
    }

    async fn current_block(&self) -> EngineResult<BlockInfo> {
        self.api.current_block().await
    }

    async fn fetch_transaction(&self, hash: &str) -> EngineResult<Option<ChainTransaction>> {
        self.api.transaction(hash).await
    }
}
