//! REST client for UTXO chains backed by an Esplora-compatible indexer

use super::{connection_error, BlockInfo, ChainTransaction, Endpoints};
use crate::config::ChainSettings;
use crate::error::{EngineError, EngineResult};
use crate::fee::FeeHistorySource;
use crate::state::ChainType;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, warn};

/// An unspent output owned by a wallet address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    pub confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoSubmitResponse {
    pub accepted: bool,
    /// Node message on rejection, txid on acceptance
    pub message: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UtxoChainApi: Send + Sync {
    async fn utxos(&self, address: &str) -> EngineResult<Vec<Utxo>>;

    /// Node estimate for confirmation within `target_blocks`, per kB
    async fn fee_per_kb(&self, target_blocks: u32) -> EngineResult<Option<u64>>;

    async fn current_block(&self) -> EngineResult<BlockInfo>;

    async fn submit(&self, raw: &str) -> EngineResult<UtxoSubmitResponse>;

    /// `None` when neither the mempool nor the chain knows `hash`
    async fn transaction(&self, hash: &str) -> EngineResult<Option<ChainTransaction>>;
}

#[derive(Debug, Deserialize)]
struct TxStatus {
    confirmed: bool,
    block_height: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct UtxoEntry {
    txid: String,
    vout: u32,
    value: u64,
    status: TxStatus,
}

#[derive(Debug, Deserialize)]
struct BlockHeader {
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct BlockExtras {
    #[serde(rename = "medianFee")]
    median_fee: f64,
}

#[derive(Debug, Deserialize)]
struct BlockSummary {
    height: u64,
    extras: Option<BlockExtras>,
}

/// Esplora REST client with endpoint failover
pub struct EsploraClient {
    http: Client,
    endpoints: Endpoints,
}

impl EsploraClient {
    pub fn new(settings: &ChainSettings) -> EngineResult<Self> {
        let http = Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .map_err(|e| connection_error(settings.chain_type, e))?;

        Ok(Self {
            http,
            endpoints: Endpoints::new(settings.chain_type, settings.rpc_urls.clone())?,
        })
    }

    fn chain(&self) -> ChainType {
        self.endpoints.chain()
    }

    /// GET `path`; `None` on 404
    async fn get(&self, path: &str) -> EngineResult<Option<String>> {
        let mut last_error = None;

        for _ in 0..self.endpoints.len() {
            let url = format!("{}/{}", self.endpoints.url(), path);
            let result = match self.http.get(&url).send().await {
                Ok(response) if response.status() == StatusCode::NOT_FOUND => return Ok(None),
                Ok(response) => response.error_for_status(),
                Err(e) => Err(e),
            };

            match result {
                Ok(response) => {
                    let text = response
                        .text()
                        .await
                        .map_err(|e| connection_error(self.chain(), e))?;
                    return Ok(Some(text));
                }
                Err(e) => {
                    warn!("GET {} failed on chain {}: {}", path, self.chain(), e);
                    last_error = Some(connection_error(self.chain(), e));
                    self.endpoints.failover();
                }
            }
        }

        Err(last_error.unwrap_or(EngineError::ChainConnection {
            chain: self.chain(),
            message: "All endpoints failed".to_string(),
        }))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> EngineResult<Option<T>> {
        match self.get(path).await? {
            Some(body) => serde_json::from_str(&body)
                .map(Some)
                .map_err(|e| EngineError::ChainConnection {
                    chain: self.chain(),
                    message: format!("decoding {}: {}", path, e),
                }),
            None => Ok(None),
        }
    }

    fn require<T>(&self, path: &str, value: Option<T>) -> EngineResult<T> {
        value.ok_or_else(|| EngineError::ChainConnection {
            chain: self.chain(),
            message: format!("{} not found", path),
        })
    }

    async fn tip_height(&self) -> EngineResult<u64> {
        let body = self.get("blocks/tip/height").await?;
        let body = self.require("blocks/tip/height", body)?;
        body.trim()
            .parse()
            .map_err(|e| EngineError::ChainConnection {
                chain: self.chain(),
                message: format!("tip height {:?}: {}", body, e),
            })
    }
}

#[async_trait]
impl UtxoChainApi for EsploraClient {
    async fn utxos(&self, address: &str) -> EngineResult<Vec<Utxo>> {
        let entries: Vec<UtxoEntry> = self
            .get_json(&format!("address/{}/utxo", address))
            .await?
            .unwrap_or_default();

        Ok(entries
            .into_iter()
            .map(|e| Utxo {
                txid: e.txid,
                vout: e.vout,
                value: e.value,
                confirmed: e.status.confirmed,
            })
            .collect())
    }

    async fn fee_per_kb(&self, target_blocks: u32) -> EngineResult<Option<u64>> {
        let estimates: Option<HashMap<String, f64>> = self.get_json("fee-estimates").await?;
        Ok(estimates.and_then(|e| pick_estimate(&e, target_blocks)))
    }

    async fn current_block(&self) -> EngineResult<BlockInfo> {
        let height = self.tip_height().await?;
        let hash = self.get(&format!("block-height/{}", height)).await?;
        let hash = self.require("block-height", hash)?;
        let header: Option<BlockHeader> = self.get_json(&format!("block/{}", hash.trim())).await?;
        let header = self.require("block", header)?;

        Ok(BlockInfo {
            number: height,
            timestamp: block_time(header.timestamp),
        })
    }

    async fn submit(&self, raw: &str) -> EngineResult<UtxoSubmitResponse> {
        let url = format!("{}/tx", self.endpoints.url());
        let response = self
            .http
            .post(&url)
            .body(raw.to_string())
            .send()
            .await
            .map_err(|e| connection_error(self.chain(), e))?;

        let status = response.status();
        let message = response
            .text()
            .await
            .map_err(|e| connection_error(self.chain(), e))?;

        if status.is_server_error() {
            return Err(EngineError::ChainConnection {
                chain: self.chain(),
                message: format!("broadcast failed with {}: {}", status, message),
            });
        }

        debug!("Broadcast on chain {} returned {}: {}", self.chain(), status, message);
        Ok(UtxoSubmitResponse {
            accepted: status.is_success(),
            message,
        })
    }

    async fn transaction(&self, hash: &str) -> EngineResult<Option<ChainTransaction>> {
        let status: Option<TxStatus> = self.get_json(&format!("tx/{}/status", hash)).await?;

        Ok(status.map(|s| ChainTransaction {
            hash: hash.to_string(),
            block_number: if s.confirmed { s.block_height } else { None },
            success: true,
            result: None,
        }))
    }
}

#[async_trait]
impl FeeHistorySource for EsploraClient {
    async fn latest_block_number(&self) -> EngineResult<u64> {
        self.tip_height().await
    }

    async fn block_fee_rate(&self, height: u64) -> EngineResult<Option<u64>> {
        let blocks: Option<Vec<BlockSummary>> =
            self.get_json(&format!("v1/blocks/{}", height)).await?;

        Ok(blocks
            .unwrap_or_default()
            .into_iter()
            .find(|b| b.height == height)
            .and_then(|b| b.extras)
            .map(|extras| per_kb(extras.median_fee)))
    }
}

fn block_time(timestamp: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(timestamp, 0).single().unwrap_or_else(Utc::now)
}

/// sat/vB to sat/kB
fn per_kb(sat_per_vbyte: f64) -> u64 {
    (sat_per_vbyte * 1000.0).ceil() as u64
}

/// Estimate for the smallest target at least `target_blocks`
fn pick_estimate(estimates: &HashMap<String, f64>, target_blocks: u32) -> Option<u64> {
    let mut targets: Vec<(u32, f64)> = estimates
        .iter()
        .filter_map(|(k, v)| k.parse().ok().map(|t| (t, *v)))
        .collect();
    targets.sort_by_key(|(t, _)| *t);

    targets
        .iter()
        .find(|(t, _)| *t >= target_blocks)
        .or_else(|| targets.last())
        .map(|(_, rate)| per_kb(*rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_estimate() {
        let estimates: HashMap<String, f64> = serde_json::from_str(
            r#"{"1": 20.5, "3": 12.0, "6": 8.25, "144": 1.0}"#,
        )
        .unwrap();
        assert_eq!(pick_estimate(&estimates, 1), Some(20_500));
        assert_eq!(pick_estimate(&estimates, 2), Some(12_000));
        assert_eq!(pick_estimate(&estimates, 500), Some(1_000));
        assert_eq!(pick_estimate(&HashMap::new(), 2), None);
    }

    #[test]
    fn test_decode_utxo_entries() {
        let entries: Vec<UtxoEntry> = serde_json::from_str(
            r#"[{"txid":"aa","vout":1,"value":5000,"status":{"confirmed":false}},
                {"txid":"bb","vout":0,"value":7000,"status":{"confirmed":true,"block_height":12}}]"#,
        )
        .unwrap();
        assert_eq!(entries.len(), 2);
        assert!(!entries[0].status.confirmed);
        assert_eq!(entries[1].status.block_height, Some(12));
    }
}
