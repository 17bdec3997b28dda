//! JSON-RPC client for account-based chains (XRP Ledger style nodes)

use super::{connection_error, BlockInfo, ChainTransaction, Endpoints};
use crate::config::ChainSettings;
use crate::error::{EngineError, EngineResult};
use crate::state::ChainType;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

/// Seconds between the Unix epoch and the ledger epoch (2000-01-01)
const LEDGER_EPOCH_OFFSET: i64 = 946_684_800;

/// State of a funding account
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountInfo {
    pub balance: u64,
    /// Next sequence number the ledger will accept
    pub sequence: u64,
}

/// Immediate answer of the node to a submission
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AccountSubmitResponse {
    pub engine_result: String,
    #[serde(default)]
    pub engine_result_message: String,
}

/// Node operations the account wallet needs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccountChainApi: Send + Sync {
    /// `None` when the account does not exist (never funded or deleted)
    async fn account_info(&self, address: &str) -> EngineResult<Option<AccountInfo>>;

    /// Current open-ledger base fee
    async fn fee(&self) -> EngineResult<u64>;

    /// Latest validated ledger
    async fn current_block(&self) -> EngineResult<BlockInfo>;

    async fn submit(&self, blob: &str) -> EngineResult<AccountSubmitResponse>;

    /// `None` when the node does not know the transaction
    async fn transaction(&self, hash: &str) -> EngineResult<Option<ChainTransaction>>;
}

/// Multi-endpoint JSON-RPC client with automatic failover
pub struct JsonRpcAccountClient {
    http: Client,
    endpoints: Endpoints,
    api_key: Option<String>,
}

impl JsonRpcAccountClient {
    pub fn new(settings: &ChainSettings) -> EngineResult<Self> {
        let http = Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .map_err(|e| connection_error(settings.chain_type, e))?;

        Ok(Self {
            http,
            endpoints: Endpoints::new(settings.chain_type, settings.rpc_urls.clone())?,
            api_key: settings.api_key.clone(),
        })
    }

    fn chain(&self) -> ChainType {
        self.endpoints.chain()
    }

    /// Call `method`, failing over across endpoints on transport errors.
    /// Returns the `result` object, which may carry an `error` field.
    async fn call(&self, method: &str, params: Value) -> EngineResult<Value> {
        let body = json!({ "method": method, "params": [params] });
        let mut last_error = None;

        for _ in 0..self.endpoints.len() {
            let mut request = self.http.post(self.endpoints.url()).json(&body);
            if let Some(key) = &self.api_key {
                request = request.header("x-apikey", key);
            }

            let response = match request.send().await.and_then(|r| r.error_for_status()) {
                Ok(response) => response,
                Err(e) => {
                    warn!("{} call failed on chain {}: {}", method, self.chain(), e);
                    last_error = Some(connection_error(self.chain(), e));
                    self.endpoints.failover();
                    continue;
                }
            };

            let mut value: Value = response
                .json()
                .await
                .map_err(|e| connection_error(self.chain(), e))?;
            debug!("{} response on chain {}: {}", method, self.chain(), value);
            return Ok(value["result"].take());
        }

        Err(last_error.unwrap_or(EngineError::ChainConnection {
            chain: self.chain(),
            message: "All endpoints failed".to_string(),
        }))
    }

    fn rpc_error(&self, method: &str, result: &Value) -> EngineError {
        EngineError::ChainConnection {
            chain: self.chain(),
            message: format!(
                "{} returned {}",
                method,
                result["error_message"]
                    .as_str()
                    .or_else(|| result["error"].as_str())
                    .unwrap_or("malformed response")
            ),
        }
    }
}

#[async_trait]
impl AccountChainApi for JsonRpcAccountClient {
    async fn account_info(&self, address: &str) -> EngineResult<Option<AccountInfo>> {
        let result = self
            .call(
                "account_info",
                json!({ "account": address, "ledger_index": "current", "strict": true }),
            )
            .await?;

        if result["error"].as_str() == Some("actNotFound") {
            return Ok(None);
        }

        let data = &result["account_data"];
        match (parse_u64(&data["Balance"]), data["Sequence"].as_u64()) {
            (Some(balance), Some(sequence)) => Ok(Some(AccountInfo { balance, sequence })),
            _ => Err(self.rpc_error("account_info", &result)),
        }
    }

    async fn fee(&self) -> EngineResult<u64> {
        let result = self.call("fee", json!({})).await?;
        parse_u64(&result["drops"]["open_ledger_fee"])
            .or_else(|| parse_u64(&result["drops"]["base_fee"]))
            .ok_or_else(|| self.rpc_error("fee", &result))
    }

    async fn current_block(&self) -> EngineResult<BlockInfo> {
        let result = self
            .call("ledger", json!({ "ledger_index": "validated" }))
            .await?;

        let number = parse_u64(&result["ledger_index"])
            .or_else(|| parse_u64(&result["ledger"]["ledger_index"]))
            .ok_or_else(|| self.rpc_error("ledger", &result))?;
        let close_time = result["ledger"]["close_time"]
            .as_i64()
            .ok_or_else(|| self.rpc_error("ledger", &result))?;

        Ok(BlockInfo {
            number,
            timestamp: ledger_time(close_time),
        })
    }

    async fn submit(&self, blob: &str) -> EngineResult<AccountSubmitResponse> {
        let result = self.call("submit", json!({ "tx_blob": blob })).await?;
        if result.get("engine_result").is_none() {
            return Err(self.rpc_error("submit", &result));
        }
        serde_json::from_value(result).map_err(|e| EngineError::ChainConnection {
            chain: self.chain(),
            message: format!("submit response: {}", e),
        })
    }

    async fn transaction(&self, hash: &str) -> EngineResult<Option<ChainTransaction>> {
        let result = self
            .call("tx", json!({ "transaction": hash, "binary": false }))
            .await?;

        if result["error"].as_str() == Some("txnNotFound") {
            return Ok(None);
        }
        if result.get("error").is_some() {
            return Err(self.rpc_error("tx", &result));
        }

        Ok(Some(parse_transaction(hash, &result)))
    }
}

fn parse_u64(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn ledger_time(close_time: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(close_time + LEDGER_EPOCH_OFFSET, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

fn parse_transaction(hash: &str, result: &Value) -> ChainTransaction {
    let validated = result["validated"].as_bool().unwrap_or(false);
    let code = result["meta"]["TransactionResult"].as_str().map(String::from);

    ChainTransaction {
        hash: hash.to_string(),
        block_number: if validated {
            parse_u64(&result["ledger_index"])
        } else {
            None
        },
        // tec* codes are included in a ledger but did not deliver
        success: code.as_deref() == Some("tesSUCCESS"),
        result: code,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_validated_transaction() {
        let result = json!({
            "validated": true,
            "ledger_index": 4_200_000,
            "meta": { "TransactionResult": "tesSUCCESS" }
        });
        let tx = parse_transaction("ABCD", &result);
        assert_eq!(tx.block_number, Some(4_200_000));
        assert!(tx.success);
    }

    #[test]
    fn test_parse_failed_and_unvalidated() {
        let failed = parse_transaction(
            "ABCD",
            &json!({ "validated": true, "ledger_index": "7", "meta": { "TransactionResult": "tecNO_DST" } }),
        );
        assert_eq!(failed.block_number, Some(7));
        assert!(!failed.success);
        assert_eq!(failed.result.as_deref(), Some("tecNO_DST"));

        let open = parse_transaction("ABCD", &json!({ "validated": false, "ledger_index": 9 }));
        assert_eq!(open.block_number, None);
    }

    #[test]
    fn test_ledger_epoch() {
        assert_eq!(ledger_time(0).timestamp(), LEDGER_EPOCH_OFFSET);
    }
}
