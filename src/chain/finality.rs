//! Chain finality rules
//!
//! Different chains have different finality models:
//! - XRP Ledger: a validated ledger is final (1 confirmation)
//! - Bitcoin: probabilistic, 6 blocks in practice
//! - Dogecoin: probabilistic with fast blocks, 60 blocks

use super::ChainTransaction;
use crate::state::ChainType;

use tracing::debug;

/// How far a transaction is from being irreversible
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finality {
    /// Known to the node but not included in a block yet
    Unconfirmed,
    Confirming { confirmations: u64, required: u64 },
    /// Final; `success` is false when the chain executed it as a failure
    Final { success: bool },
}

/// Evaluate finality of `tx` at `current_height`
pub fn evaluate(tx: &ChainTransaction, current_height: u64, required: u64) -> Finality {
    let Some(block) = tx.block_number else {
        return Finality::Unconfirmed;
    };

    // The including block counts as the first confirmation
    let confirmations = current_height.saturating_sub(block) + 1;
    if confirmations >= required {
        Finality::Final {
            success: tx.success,
        }
    } else {
        debug!(
            "Transaction {} has {} / {} confirmations",
            tx.hash, confirmations, required
        );
        Finality::Confirming {
            confirmations,
            required,
        }
    }
}

/// Get recommended confirmation blocks for a chain
pub fn recommended_confirmations(chain: ChainType) -> u64 {
    match chain {
        ChainType::Xrp | ChainType::TestXrp => 1,
        ChainType::Btc => 6,
        ChainType::TestBtc => 1,
        ChainType::Doge => 60,
        ChainType::TestDoge => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(block: Option<u64>, success: bool) -> ChainTransaction {
        ChainTransaction {
            hash: "ab".repeat(32),
            block_number: block,
            success,
            result: None,
        }
    }

    #[test]
    fn test_confirmation_counting() {
        assert_eq!(evaluate(&tx(None, true), 100, 6), Finality::Unconfirmed);
        assert_eq!(
            evaluate(&tx(Some(98), true), 100, 6),
            Finality::Confirming {
                confirmations: 3,
                required: 6
            }
        );
        assert_eq!(
            evaluate(&tx(Some(95), false), 100, 6),
            Finality::Final { success: false }
        );
        assert_eq!(
            evaluate(&tx(Some(100), true), 100, recommended_confirmations(ChainType::Xrp)),
            Finality::Final { success: true }
        );
    }
}
