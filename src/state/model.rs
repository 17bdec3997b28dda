//! Persisted records: transactions, their inputs and monitoring locks

use crate::error::{EngineError, EngineResult};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Chains the engine can hold funds on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChainType {
    #[serde(rename = "XRP")]
    Xrp,
    #[serde(rename = "testXRP")]
    TestXrp,
    #[serde(rename = "BTC")]
    Btc,
    #[serde(rename = "testBTC")]
    TestBtc,
    #[serde(rename = "DOGE")]
    Doge,
    #[serde(rename = "testDOGE")]
    TestDoge,
}

/// How a chain funds transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainFamily {
    /// One key, strictly increasing sequence number
    Account,
    /// Inputs selected from the unspent output set
    Utxo,
}

impl ChainType {
    pub const ALL: [ChainType; 6] = [
        ChainType::Xrp,
        ChainType::TestXrp,
        ChainType::Btc,
        ChainType::TestBtc,
        ChainType::Doge,
        ChainType::TestDoge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChainType::Xrp => "XRP",
            ChainType::TestXrp => "testXRP",
            ChainType::Btc => "BTC",
            ChainType::TestBtc => "testBTC",
            ChainType::Doge => "DOGE",
            ChainType::TestDoge => "testDOGE",
        }
    }

    pub fn family(&self) -> ChainFamily {
        match self {
            ChainType::Xrp | ChainType::TestXrp => ChainFamily::Account,
            _ => ChainFamily::Utxo,
        }
    }
}

impl fmt::Display for ChainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChainType::ALL
            .iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| EngineError::ChainNotFound {
                chain: s.to_string(),
            })
    }
}

/// Lifecycle status of a transaction record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Created,
    Prepared,
    Submitted,
    Pending,
    SubmissionFailed,
    Replaced,
    ReplacedPending,
    Success,
    Failed,
}

impl TransactionStatus {
    pub const ALL: [TransactionStatus; 9] = [
        TransactionStatus::Created,
        TransactionStatus::Prepared,
        TransactionStatus::Submitted,
        TransactionStatus::Pending,
        TransactionStatus::SubmissionFailed,
        TransactionStatus::Replaced,
        TransactionStatus::ReplacedPending,
        TransactionStatus::Success,
        TransactionStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Created => "CREATED",
            TransactionStatus::Prepared => "PREPARED",
            TransactionStatus::Submitted => "SUBMITTED",
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::SubmissionFailed => "SUBMISSION_FAILED",
            TransactionStatus::Replaced => "REPLACED",
            TransactionStatus::ReplacedPending => "REPLACED_PENDING",
            TransactionStatus::Success => "SUCCESS",
            TransactionStatus::Failed => "FAILED",
        }
    }

    /// SUCCESS and FAILED end the lifecycle of a payment
    pub fn is_final(&self) -> bool {
        matches!(self, TransactionStatus::Success | TransactionStatus::Failed)
    }

    /// No further transitions are possible from this status
    pub fn is_terminal(&self) -> bool {
        self.is_final() || *self == TransactionStatus::Replaced
    }

    /// Signed payload may still be in the network; its sequence number or
    /// inputs must not be reused by unrelated records.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Prepared
                | TransactionStatus::Submitted
                | TransactionStatus::Pending
                | TransactionStatus::SubmissionFailed
                | TransactionStatus::ReplacedPending
        )
    }

    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        match self {
            Created => matches!(
                next,
                Prepared | Submitted | Pending | SubmissionFailed | Failed
            ),
            Prepared => matches!(next, Submitted | Pending | SubmissionFailed | Failed),
            SubmissionFailed => matches!(next, Replaced | Failed),
            Submitted => matches!(next, Pending | Success | Failed),
            Pending => matches!(next, Success | Failed | Replaced | ReplacedPending),
            ReplacedPending => matches!(next, Success | Replaced | Failed),
            Success | Failed | Replaced => false,
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransactionStatus::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| EngineError::Internal(format!("Unknown transaction status {}", s)))
    }
}

/// One outbound payment or account-deletion intent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: i64,
    pub chain: ChainType,
    pub source: String,
    pub destination: String,
    /// Secondary address paying the fee (UTXO chains only)
    pub fee_source: Option<String>,
    /// `None` marks an account-deletion transaction
    pub amount: Option<u64>,
    pub fee: Option<u64>,
    pub max_fee: Option<u64>,
    pub reference: Option<String>,
    /// Fee is subtracted from `amount` instead of being added on top
    pub pay_fee_from_amount: bool,
    pub execute_until_block: Option<u64>,
    pub execute_until_timestamp: Option<DateTime<Utc>>,
    pub status: TransactionStatus,
    /// Signed payload, opaque to the monitor
    pub raw: Option<String>,
    pub transaction_hash: Option<String>,
    pub submitted_in_block: Option<u64>,
    pub submitted_in_timestamp: Option<DateTime<Utc>>,
    pub replaced_by: Option<i64>,
    /// Unconfirmed record whose change output this record spends
    pub ancestor: Option<i64>,
    pub reached_status_prepared_in_timestamp: Option<DateTime<Utc>>,
    pub reached_status_pending_in_timestamp: Option<DateTime<Utc>>,
    pub reached_final_status_in_timestamp: Option<DateTime<Utc>>,
    pub server_submit_response: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TransactionRecord {
    pub fn is_delete_account(&self) -> bool {
        self.amount.is_none()
    }

    /// Move to `next`, stamping the bookkeeping timestamps
    pub fn transition(&mut self, next: TransactionStatus, now: DateTime<Utc>) -> EngineResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidStateTransition {
                from: self.status,
                to: next,
            });
        }

        match next {
            TransactionStatus::Prepared => self.reached_status_prepared_in_timestamp = Some(now),
            TransactionStatus::Pending => self.reached_status_pending_in_timestamp = Some(now),
            s if s.is_terminal() => self.reached_final_status_in_timestamp = Some(now),
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    /// Settle as FAILED keeping the reason for callers polling the record
    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> EngineResult<()> {
        self.transition(TransactionStatus::Failed, now)?;
        self.server_submit_response = Some(reason.into());
        Ok(())
    }

    pub fn info(&self) -> TransactionInfo {
        TransactionInfo {
            id: self.id,
            chain: self.chain,
            status: self.status,
            transaction_hash: self.transaction_hash.clone(),
            fee: self.fee,
            amount: self.amount,
            replaced_by: self.replaced_by,
            submitted_in_block: self.submitted_in_block,
            reason: match self.status {
                TransactionStatus::Failed => self.server_submit_response.clone(),
                _ => None,
            },
        }
    }
}

/// Fields supplied when a record is created
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    pub chain: ChainType,
    pub source: String,
    pub destination: String,
    pub fee_source: Option<String>,
    pub amount: Option<u64>,
    pub fee: Option<u64>,
    pub max_fee: Option<u64>,
    pub reference: Option<String>,
    pub pay_fee_from_amount: bool,
    pub execute_until_block: Option<u64>,
    pub execute_until_timestamp: Option<DateTime<Utc>>,
    pub ancestor: Option<i64>,
}

impl NewTransaction {
    pub fn new(
        chain: ChainType,
        source: impl Into<String>,
        destination: impl Into<String>,
        amount: Option<u64>,
    ) -> Self {
        Self {
            chain,
            source: source.into(),
            destination: destination.into(),
            fee_source: None,
            amount,
            fee: None,
            max_fee: None,
            reference: None,
            pay_fee_from_amount: false,
            execute_until_block: None,
            execute_until_timestamp: None,
            ancestor: None,
        }
    }

    pub(crate) fn into_record(self, id: i64, created_at: DateTime<Utc>) -> TransactionRecord {
        TransactionRecord {
            id,
            chain: self.chain,
            source: self.source,
            destination: self.destination,
            fee_source: self.fee_source,
            amount: self.amount,
            fee: self.fee,
            max_fee: self.max_fee,
            reference: self.reference,
            pay_fee_from_amount: self.pay_fee_from_amount,
            execute_until_block: self.execute_until_block,
            execute_until_timestamp: self.execute_until_timestamp,
            status: TransactionStatus::Created,
            raw: None,
            transaction_hash: None,
            submitted_in_block: None,
            submitted_in_timestamp: None,
            replaced_by: None,
            ancestor: self.ancestor,
            reached_status_prepared_in_timestamp: None,
            reached_status_pending_in_timestamp: None,
            reached_final_status_in_timestamp: None,
            server_submit_response: None,
            created_at,
        }
    }
}

/// Status view handed to the bots polling a payment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionInfo {
    pub id: i64,
    pub chain: ChainType,
    pub status: TransactionStatus,
    pub transaction_hash: Option<String>,
    pub fee: Option<u64>,
    pub amount: Option<u64>,
    pub replaced_by: Option<i64>,
    pub submitted_in_block: Option<u64>,
    pub reason: Option<String>,
}

/// An output spent by a UTXO-chain record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionInput {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    pub address: String,
}

impl TransactionInput {
    pub fn outpoint(&self) -> (String, u32) {
        (self.txid.clone(), self.vout)
    }
}

/// Lease row, one per chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoringLockRecord {
    pub chain: ChainType,
    /// Empty when released
    pub process_owner: String,
    /// Milliseconds since epoch, zero when released
    pub last_ping: i64,
}

/// Result of a single acquisition attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockAttempt {
    pub acquired: bool,
    pub last_ping: Option<i64>,
}
