//! Fee, amount and deadline policy shared by the wallet strategies

use crate::chain::BlockInfo;
use crate::config::ChainSettings;
use crate::error::{EngineError, EngineResult};
use crate::state::TransactionRecord;

use chrono::{DateTime, Duration, Utc};

/// Estimated size of a UTXO transaction in bytes
pub fn utxo_size(inputs: usize, outputs: usize) -> u64 {
    10 + 148 * inputs as u64 + 34 * outputs as u64
}

/// Fee for `size` bytes at `rate_per_kb`, rounded up
pub fn fee_for_size(size: u64, rate_per_kb: u64) -> u64 {
    (size * rate_per_kb).div_ceil(1000)
}

/// Add the configured safety buffer to a node estimate
pub fn with_buffer(fee: u64, buffer_percent: u64) -> u64 {
    fee + fee * buffer_percent / 100
}

/// Bumped fee for a resubmission, always strictly higher
pub fn escalate_fee(fee: u64, escalation_percent: u64) -> u64 {
    (fee * escalation_percent / 100).max(fee + 1)
}

pub fn check_max_fee(fee: u64, max_fee: Option<u64>) -> EngineResult<()> {
    match max_fee {
        Some(max_fee) if fee > max_fee => Err(EngineError::FeeTooHigh { fee, max_fee }),
        _ => Ok(()),
    }
}

/// Amount delivered to the destination
pub fn amount_after_fee(amount: u64, fee: u64, pay_fee_from_amount: bool) -> EngineResult<u64> {
    if !pay_fee_from_amount {
        return Ok(amount);
    }
    if fee >= amount {
        return Err(EngineError::InvalidAmount(format!(
            "fee {} does not leave anything of amount {}",
            fee, amount
        )));
    }
    Ok(amount - fee)
}

/// Reason the record may no longer be broadcast, if its deadline (minus the
/// safety offsets) has passed at `block`.
pub fn deadline_exceeded(
    record: &TransactionRecord,
    settings: &ChainSettings,
    block: &BlockInfo,
) -> Option<String> {
    if let Some(until_block) = record.execute_until_block {
        let last_block = until_block.saturating_sub(settings.deadline_block_offset);
        if block.number > last_block {
            return Some(format!(
                "deadline exceeded: current block {} is past execute-until block {} (offset {})",
                block.number, until_block, settings.deadline_block_offset
            ));
        }
    }

    if let Some(until) = record.execute_until_timestamp {
        let last_time = until - Duration::seconds(settings.deadline_time_offset_secs);
        if block.timestamp > last_time {
            return Some(format!(
                "deadline exceeded: chain time {} is past execute-until timestamp {} (offset {}s)",
                block.timestamp, until, settings.deadline_time_offset_secs
            ));
        }
    }

    None
}

/// Whether a record has waited longer than `timeout` since it was broadcast
pub fn pending_timed_out(record: &TransactionRecord, timeout: Duration, now: DateTime<Utc>) -> bool {
    let since = record
        .submitted_in_timestamp
        .or(record.reached_status_pending_in_timestamp)
        .or(record.reached_status_prepared_in_timestamp)
        .unwrap_or(record.created_at);
    now - since >= timeout
}
