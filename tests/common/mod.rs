//! Scripted chain nodes and wiring shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use wallet_engine::chain::{
    AccountChainApi, AccountInfo, AccountSubmitResponse, BlockInfo, ChainTransaction, Utxo,
    UtxoChainApi, UtxoSubmitResponse,
};
use wallet_engine::config::{ChainSettings, MonitorConfig};
use wallet_engine::error::{EngineError, EngineResult};
use wallet_engine::fee::FeeHistorySource;
use wallet_engine::lock::{Clock, LockTimings, MonitoringLock};
use wallet_engine::monitor::{MonitorLoop, RunningFlag};
use wallet_engine::state::{ChainType, MemoryStore};
use wallet_engine::wallet::{ChainWallet, InMemoryKeyStore, WalletContext};

pub const KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

pub fn keys(addresses: &[&str]) -> Arc<InMemoryKeyStore> {
    let keys = InMemoryKeyStore::new();
    for address in addresses {
        keys.insert(*address, KEY);
    }
    Arc::new(keys)
}

pub fn context(settings: ChainSettings, store: Arc<MemoryStore>, addresses: &[&str]) -> WalletContext {
    WalletContext::new(settings, store, keys(addresses), Duration::from_secs(1))
}

fn block(number: u64) -> BlockInfo {
    BlockInfo {
        number,
        timestamp: Utc::now(),
    }
}

fn network_down(chain: ChainType) -> EngineError {
    EngineError::ChainConnection {
        chain,
        message: "connection refused".to_string(),
    }
}

/// State of the scripted ledger, editable between iterations
pub struct LedgerState {
    pub block: u64,
    pub balance: u64,
    pub sequence: u64,
    pub fee: u64,
    /// Engine results handed out in order, `tesSUCCESS` once exhausted
    pub submit_results: VecDeque<String>,
    pub submitted: Vec<String>,
    pub transactions: HashMap<String, ChainTransaction>,
    pub network_up: bool,
}

pub struct FakeLedger {
    state: Mutex<LedgerState>,
}

impl FakeLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState {
                block: 100,
                balance: 100_000_000,
                sequence: 7,
                fee: 10,
                submit_results: VecDeque::new(),
                submitted: Vec::new(),
                transactions: HashMap::new(),
                network_up: true,
            }),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap()
    }

    /// Include `hash` in `block` as a successful transaction
    pub fn confirm(&self, hash: &str, block: u64) {
        self.state().transactions.insert(
            hash.to_string(),
            ChainTransaction {
                hash: hash.to_string(),
                block_number: Some(block),
                success: true,
                result: Some("tesSUCCESS".to_string()),
            },
        );
    }
}

#[async_trait]
impl AccountChainApi for FakeLedger {
    async fn account_info(&self, _address: &str) -> EngineResult<Option<AccountInfo>> {
        let state = self.state();
        Ok(Some(AccountInfo {
            balance: state.balance,
            sequence: state.sequence,
        }))
    }

    async fn fee(&self) -> EngineResult<u64> {
        Ok(self.state().fee)
    }

    async fn current_block(&self) -> EngineResult<BlockInfo> {
        let state = self.state();
        if !state.network_up {
            return Err(network_down(ChainType::TestXrp));
        }
        Ok(block(state.block))
    }

    async fn submit(&self, blob: &str) -> EngineResult<AccountSubmitResponse> {
        let mut state = self.state();
        state.submitted.push(blob.to_string());
        let engine_result = state
            .submit_results
            .pop_front()
            .unwrap_or_else(|| "tesSUCCESS".to_string());
        Ok(AccountSubmitResponse {
            engine_result,
            engine_result_message: "scripted".to_string(),
        })
    }

    async fn transaction(&self, hash: &str) -> EngineResult<Option<ChainTransaction>> {
        Ok(self.state().transactions.get(hash).cloned())
    }
}

pub struct UtxoNodeState {
    pub block: u64,
    pub utxos: HashMap<String, Vec<Utxo>>,
    pub node_fee_per_kb: Option<u64>,
    pub block_fee_rate: u64,
    pub submit_results: VecDeque<(bool, String)>,
    pub submitted: Vec<String>,
    pub transactions: HashMap<String, ChainTransaction>,
}

pub struct FakeUtxoNode {
    state: Mutex<UtxoNodeState>,
}

impl FakeUtxoNode {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(UtxoNodeState {
                block: 800_000,
                utxos: HashMap::new(),
                node_fee_per_kb: None,
                block_fee_rate: 1_000,
                submit_results: VecDeque::new(),
                submitted: Vec::new(),
                transactions: HashMap::new(),
            }),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, UtxoNodeState> {
        self.state.lock().unwrap()
    }

    pub fn fund(&self, address: &str, txid: &str, value: u64) {
        self.state()
            .utxos
            .entry(address.to_string())
            .or_default()
            .push(Utxo {
                txid: txid.to_string(),
                vout: 0,
                value,
                confirmed: true,
            });
    }

    /// Report `hash` as relayed but not yet in a block
    pub fn hold_in_mempool(&self, hash: &str) {
        self.state().transactions.insert(
            hash.to_string(),
            ChainTransaction {
                hash: hash.to_string(),
                block_number: None,
                success: true,
                result: None,
            },
        );
    }

    pub fn mine(&self, hash: &str, block: u64) {
        if let Some(tx) = self.state().transactions.get_mut(hash) {
            tx.block_number = Some(block);
        }
    }

    /// Forget `hash`, as when the mempool evicts it
    pub fn drop_from_mempool(&self, hash: &str) {
        self.state().transactions.remove(hash);
    }
}

#[async_trait]
impl UtxoChainApi for FakeUtxoNode {
    async fn utxos(&self, address: &str) -> EngineResult<Vec<Utxo>> {
        Ok(self.state().utxos.get(address).cloned().unwrap_or_default())
    }

    async fn fee_per_kb(&self, _target_blocks: u32) -> EngineResult<Option<u64>> {
        Ok(self.state().node_fee_per_kb)
    }

    async fn current_block(&self) -> EngineResult<BlockInfo> {
        Ok(block(self.state().block))
    }

    async fn submit(&self, raw: &str) -> EngineResult<UtxoSubmitResponse> {
        let mut state = self.state();
        state.submitted.push(raw.to_string());
        let (accepted, message) = state
            .submit_results
            .pop_front()
            .unwrap_or((true, "accepted".to_string()));
        Ok(UtxoSubmitResponse { accepted, message })
    }

    async fn transaction(&self, hash: &str) -> EngineResult<Option<ChainTransaction>> {
        Ok(self.state().transactions.get(hash).cloned())
    }
}

#[async_trait]
impl FeeHistorySource for FakeUtxoNode {
    async fn latest_block_number(&self) -> EngineResult<u64> {
        Ok(self.state().block)
    }

    async fn block_fee_rate(&self, _height: u64) -> EngineResult<Option<u64>> {
        Ok(Some(self.state().block_fee_rate))
    }
}

/// Monitor timings short enough for tests
pub fn fast_monitor_config() -> MonitorConfig {
    MonitorConfig {
        ping_interval_ms: 100,
        expiration_interval_ms: 300,
        lock_poll_delay_ms: 50,
        max_start_jitter_ms: 0,
        loop_delay_ms: 10,
        network_down_delay_ms: 50,
        confirmation_check_every: 5,
        fee_warmup_timeout_ms: 500,
        fee_refresh_interval_ms: 1_000,
        db_retry_max_elapsed_ms: 1_000,
        standby_retry_secs: 1,
    }
}

/// A monitor loop owning the chain lock of `wallet`
pub async fn owned_loop(
    wallet: Arc<dyn ChainWallet>,
    store: Arc<MemoryStore>,
    clock: Arc<dyn Clock>,
    owner: &str,
) -> (MonitorLoop, Arc<MonitoringLock>, RunningFlag) {
    let config = fast_monitor_config();
    let lock = Arc::new(MonitoringLock::new(store, clock, LockTimings::from(&config)));
    let attempt = lock.acquire(wallet.chain(), owner).await.unwrap();
    assert!(attempt.acquired, "{} could not take the lock", owner);

    let running = RunningFlag::new();
    running.set(true);
    let main_loop = MonitorLoop::new(wallet, lock.clone(), config, running.clone(), owner);
    (main_loop, lock, running)
}
