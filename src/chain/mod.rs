//! Chain module - blockchain node clients used by the wallets
//!
//! This module provides:
//! - JSON-RPC client for account-based chains with multi-endpoint failover
//! - REST client for UTXO chains (Esplora-style indexers)
//! - Chain-specific finality rules

pub mod account_api;
pub mod finality;
pub mod utxo_api;

pub use account_api::{AccountChainApi, AccountInfo, AccountSubmitResponse, JsonRpcAccountClient};
pub use finality::{evaluate as evaluate_finality, recommended_confirmations, Finality};
pub use utxo_api::{EsploraClient, Utxo, UtxoChainApi, UtxoSubmitResponse};

use crate::error::{EngineError, EngineResult};
use crate::state::ChainType;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

/// Latest block (ledger) of a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub number: u64,
    pub timestamp: DateTime<Utc>,
}

/// A transaction as seen by the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTransaction {
    pub hash: String,
    /// `None` while unconfirmed
    pub block_number: Option<u64>,
    pub success: bool,
    /// Chain-specific result code, kept for diagnostics
    pub result: Option<String>,
}

/// Round-robin endpoint list shared by the HTTP clients
pub(crate) struct Endpoints {
    chain: ChainType,
    urls: Vec<String>,
    current: AtomicUsize,
}

impl Endpoints {
    pub(crate) fn new(chain: ChainType, urls: Vec<String>) -> EngineResult<Self> {
        if urls.is_empty() {
            return Err(EngineError::ChainConnection {
                chain,
                message: "No valid RPC endpoints".to_string(),
            });
        }

        Ok(Self {
            chain,
            urls: urls
                .into_iter()
                .map(|u| u.trim_end_matches('/').to_string())
                .collect(),
            current: AtomicUsize::new(0),
        })
    }

    /// Active endpoint
    pub(crate) fn url(&self) -> &str {
        let idx = self.current.load(Ordering::Relaxed);
        &self.urls[idx % self.urls.len()]
    }

    pub(crate) fn len(&self) -> usize {
        self.urls.len()
    }

    /// Switch to next available endpoint
    pub(crate) fn failover(&self) {
        let current = self.current.load(Ordering::Relaxed);
        let next = (current + 1) % self.urls.len();
        self.current.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to endpoint {}", self.chain, next);
    }

    pub(crate) fn chain(&self) -> ChainType {
        self.chain
    }
}

/// Map a transport failure into the engine's transient error
pub(crate) fn connection_error(chain: ChainType, error: reqwest::Error) -> EngineError {
    if error.is_timeout() {
        return EngineError::Timeout {
            operation: format!("{} node request", chain),
        };
    }
    if error.status() == Some(reqwest::StatusCode::TOO_MANY_REQUESTS) {
        return EngineError::RateLimited { chain };
    }
    EngineError::ChainConnection {
        chain,
        message: error.to_string(),
    }
}
