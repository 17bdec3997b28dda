//! Chain wallets: the capability contract every chain family implements
//!
//! This module provides:
//! - The `ChainWallet` trait driven by the monitor
//! - Account-based (sequence numbered) and UTXO-based strategies
//! - Chain-agnostic lifecycle drivers and fee/deadline policy helpers
//! - A registry selecting the strategy by chain type

mod account;
mod keys;
pub mod lifecycle;
pub mod policy;
mod utxo;

pub use account::{AccountPayload, AccountTransactionType, AccountWallet};
pub use keys::{decode_blob, EnvKeyStore, InMemoryKeyStore, KeyStore, SignedEnvelope, SigningKeys};
pub use utxo::{TxOutput, UtxoPayload, UtxoWallet};

use crate::chain::{BlockInfo, ChainTransaction, EsploraClient, JsonRpcAccountClient};
use crate::config::ChainSettings;
use crate::error::{EngineError, EngineResult};
use crate::fee::FeeService;
use crate::state::{
    ChainFamily, ChainType, NewTransaction, Store, TransactionInfo, TransactionInput,
    TransactionRecord,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Outbound payment requested by a bot
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentRequest {
    pub source: String,
    pub destination: String,
    /// `None` closes the source account
    pub amount: Option<u64>,
    pub fee: Option<u64>,
    pub reference: Option<String>,
    pub max_fee: Option<u64>,
    pub execute_until_block: Option<u64>,
    pub execute_until_timestamp: Option<DateTime<Utc>>,
    pub pay_fee_from_amount: bool,
    pub fee_source: Option<String>,
}

impl PaymentRequest {
    pub fn new(source: impl Into<String>, destination: impl Into<String>, amount: u64) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            amount: Some(amount),
            fee: None,
            reference: None,
            max_fee: None,
            execute_until_block: None,
            execute_until_timestamp: None,
            pay_fee_from_amount: false,
            fee_source: None,
        }
    }

    fn into_new_transaction(self, chain: ChainType) -> NewTransaction {
        NewTransaction {
            chain,
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
            ancestor: None,
        }
    }
}

/// Account deletion sending the whole remaining balance to `destination`
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteAccountRequest {
    pub source: String,
    pub destination: String,
    pub fee: Option<u64>,
    pub reference: Option<String>,
    pub max_fee: Option<u64>,
    pub execute_until_block: Option<u64>,
    pub execute_until_timestamp: Option<DateTime<Utc>>,
}

impl DeleteAccountRequest {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            fee: None,
            reference: None,
            max_fee: None,
            execute_until_block: None,
            execute_until_timestamp: None,
        }
    }
}

impl From<DeleteAccountRequest> for PaymentRequest {
    fn from(request: DeleteAccountRequest) -> Self {
        Self {
            source: request.source,
            destination: request.destination,
            amount: None,
            fee: request.fee,
            reference: request.reference,
            max_fee: request.max_fee,
            execute_until_block: request.execute_until_block,
            execute_until_timestamp: request.execute_until_timestamp,
            pay_fee_from_amount: false,
            fee_source: None,
        }
    }
}

/// Unsigned payload produced by `prepare`
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedTransaction {
    pub payload: Value,
    pub fee: u64,
    /// Outputs spent, UTXO chains only
    pub inputs: Vec<TransactionInput>,
    pub ancestor: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    /// Hex-encoded signed envelope, stored as the record's raw payload
    pub blob: String,
    pub hash: String,
}

/// Classification of the node's immediate answer to a broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted,
    /// Ambiguous; the record has to be polled
    Pending,
    FeeTooLow,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitResponse {
    pub outcome: SubmitOutcome,
    pub message: String,
}

/// State shared by every wallet implementation
pub struct WalletContext {
    pub settings: ChainSettings,
    pub store: Arc<dyn Store>,
    pub keys: Arc<dyn KeyStore>,
    /// Bound on retrying conflicting database writes
    pub retry_budget: Duration,
}

impl WalletContext {
    pub fn new(
        settings: ChainSettings,
        store: Arc<dyn Store>,
        keys: Arc<dyn KeyStore>,
        retry_budget: Duration,
    ) -> Self {
        Self {
            settings,
            store,
            keys,
            retry_budget,
        }
    }

    pub fn chain(&self) -> ChainType {
        self.settings.chain_type
    }

    /// Checks shared by both strategies, then persists the CREATED record
    async fn create_checked(&self, request: PaymentRequest) -> EngineResult<i64> {
        if let Some(amount) = request.amount {
            if amount == 0 || amount < self.settings.dust_amount {
                return Err(EngineError::InvalidAmount(format!(
                    "amount {} below dust amount {}",
                    amount, self.settings.dust_amount
                )));
            }
        }

        for address in std::iter::once(&request.source).chain(request.fee_source.iter()) {
            if self.keys.private_key(address).is_none() {
                return Err(EngineError::MissingPrivateKey {
                    address: address.clone(),
                });
            }
        }

        let open = self
            .store
            .open_transactions_for_source(self.chain(), &request.source)
            .await?;
        if open.iter().any(|t| t.is_delete_account()) {
            return Err(EngineError::AccountDeleting {
                address: request.source,
            });
        }

        let record = self
            .store
            .create_transaction(request.into_new_transaction(self.chain()))
            .await?;
        crate::metrics::record_tx_created(self.chain());
        info!(
            "Created transaction {} on chain {}: {} -> {} amount {:?}",
            record.id, record.chain, record.source, record.destination, record.amount
        );
        Ok(record.id)
    }
}

/// Capability contract of a chain family
#[async_trait]
pub trait ChainWallet: Send + Sync {
    fn context(&self) -> &WalletContext;

    fn chain(&self) -> ChainType {
        self.context().chain()
    }

    fn settings(&self) -> &ChainSettings {
        &self.context().settings
    }

    fn store(&self) -> &Arc<dyn Store> {
        &self.context().store
    }

    /// Moving-average fee service refreshed by the monitor, if any
    fn fee_service(&self) -> Option<Arc<FeeService>> {
        None
    }

    /// Whether SUBMISSION_FAILED records are resubmitted with a bumped fee
    fn supports_submission_failed_resubmit(&self) -> bool {
        true
    }

    /// Validate and persist a CREATED record; `amount: None` closes the account
    async fn create_payment_transaction(&self, request: PaymentRequest) -> EngineResult<i64>;

    async fn create_delete_account_transaction(
        &self,
        request: DeleteAccountRequest,
    ) -> EngineResult<i64> {
        self.create_payment_transaction(request.into()).await
    }

    /// Build the unsigned payload from current network state
    async fn prepare(&self, record: &TransactionRecord) -> EngineResult<PreparedTransaction>;

    /// Offline and deterministic
    fn sign(
        &self,
        prepared: &PreparedTransaction,
        keys: &SigningKeys,
    ) -> EngineResult<SignedTransaction> {
        keys.sign(&prepared.payload)
    }

    /// Broadcast and classify the immediate response
    async fn submit(&self, blob: &str, record: &TransactionRecord) -> EngineResult<SubmitResponse>;

    /// Poll a PENDING record; may finalize it or force a resubmission
    async fn check_pending(&self, record: TransactionRecord) -> EngineResult<()>;

    /// Cheap liveness probe run before every monitor iteration
    async fn check_network_status(&self) -> bool;

    async fn current_block(&self) -> EngineResult<BlockInfo>;

    async fn fetch_transaction(&self, hash: &str) -> EngineResult<Option<ChainTransaction>>;

    /// Lowest fee a replacement of `old` must pay to be relayed
    async fn replacement_fee_floor(&self, _old: &TransactionRecord) -> EngineResult<u64> {
        Ok(0)
    }
}

/// Build the strategy for `settings.chain_type` with its node client
pub fn build_wallet(
    settings: ChainSettings,
    store: Arc<dyn Store>,
    keys: Arc<dyn KeyStore>,
    retry_budget: Duration,
) -> EngineResult<Arc<dyn ChainWallet>> {
    let wallet: Arc<dyn ChainWallet> = match settings.chain_type.family() {
        ChainFamily::Account => {
            let api = Arc::new(JsonRpcAccountClient::new(&settings)?);
            let context = WalletContext::new(settings, store, keys, retry_budget);
            Arc::new(AccountWallet::new(context, api))
        }
        ChainFamily::Utxo => {
            let client = Arc::new(EsploraClient::new(&settings)?);
            let fee_service = (settings.fee_history_blocks > 0).then(|| {
                Arc::new(FeeService::new(
                    settings.chain_type,
                    client.clone(),
                    settings.fee_history_blocks,
                ))
            });
            let context = WalletContext::new(settings, store, keys, retry_budget);
            Arc::new(UtxoWallet::new(context, client, fee_service))
        }
    };

    Ok(wallet)
}

/// Wallets keyed by chain type
#[derive(Default)]
pub struct WalletRegistry {
    wallets: DashMap<ChainType, Arc<dyn ChainWallet>>,
}

impl WalletRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, wallet: Arc<dyn ChainWallet>) {
        info!("Registered wallet for chain {}", wallet.chain());
        self.wallets.insert(wallet.chain(), wallet);
    }

    pub fn get(&self, chain: ChainType) -> EngineResult<Arc<dyn ChainWallet>> {
        self.wallets
            .get(&chain)
            .map(|w| w.clone())
            .ok_or(EngineError::ChainNotFound {
                chain: chain.to_string(),
            })
    }

    pub fn chains(&self) -> Vec<ChainType> {
        let mut chains: Vec<ChainType> = self.wallets.iter().map(|e| *e.key()).collect();
        chains.sort_by_key(|c| c.as_str());
        chains
    }

    pub async fn create_payment_transaction(
        &self,
        chain: ChainType,
        request: PaymentRequest,
    ) -> EngineResult<i64> {
        self.get(chain)?.create_payment_transaction(request).await
    }

    pub async fn create_delete_account_transaction(
        &self,
        chain: ChainType,
        request: DeleteAccountRequest,
    ) -> EngineResult<i64> {
        self.get(chain)?
            .create_delete_account_transaction(request)
            .await
    }

    pub async fn get_transaction_info(
        &self,
        chain: ChainType,
        id: i64,
    ) -> EngineResult<TransactionInfo> {
        lifecycle::get_transaction_info(self.get(chain)?.store().as_ref(), id).await
    }
}
