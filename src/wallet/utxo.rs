//! UTXO-based strategy (BTC / DOGE style)
//!
//! Inputs are selected largest first from outputs not spent by another
//! in-flight record. A stuck record is replaced by spending the same inputs
//! with a higher fee, so at most one of the two can confirm.

use super::keys::decode_blob;
use super::lifecycle;
use super::policy;
use super::{
    ChainWallet, PaymentRequest, PreparedTransaction, SubmitOutcome, SubmitResponse, WalletContext,
};
use crate::chain::{
    evaluate_finality, BlockInfo, ChainTransaction, Finality, Utxo, UtxoChainApi,
};
use crate::error::{EngineError, EngineResult};
use crate::fee::FeeService;
use crate::state::{TransactionInput, TransactionRecord, TransactionStatus};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Blocks the node estimate targets when the fee service has no history
const ESTIMATE_TARGET_BLOCKS: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: String,
    pub value: u64,
}

/// Unsigned UTXO transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoPayload {
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TxOutput>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub op_return: Option<String>,
    /// Signals replace-by-fee
    pub replaceable: bool,
}

impl UtxoPayload {
    fn size(&self) -> u64 {
        policy::utxo_size(self.inputs.len(), self.outputs.len())
    }
}

/// Inputs picked for one address
struct Selection {
    inputs: Vec<TransactionInput>,
    unconfirmed: Vec<String>,
    total: u64,
}

impl Selection {
    fn new(reused: Vec<TransactionInput>) -> Self {
        let total = reused.iter().map(|i| i.value).sum();
        // reused inputs may themselves be unconfirmed change
        let unconfirmed = reused.iter().map(|i| i.txid.clone()).collect();
        Self {
            inputs: reused,
            unconfirmed,
            total,
        }
    }

    fn push(&mut self, address: &str, utxo: Utxo) {
        self.total += utxo.value;
        if !utxo.confirmed {
            self.unconfirmed.push(utxo.txid.clone());
        }
        self.inputs.push(TransactionInput {
            txid: utxo.txid,
            vout: utxo.vout,
            value: utxo.value,
            address: address.to_string(),
        });
    }
}

pub struct UtxoWallet {
    context: WalletContext,
    api: Arc<dyn UtxoChainApi>,
    fee_service: Option<Arc<FeeService>>,
}

impl UtxoWallet {
    pub fn new(
        context: WalletContext,
        api: Arc<dyn UtxoChainApi>,
        fee_service: Option<Arc<FeeService>>,
    ) -> Self {
        Self {
            context,
            api,
            fee_service,
        }
    }

    /// Fee rate per kB: smoothed history first, then the node estimate,
    /// never below the relay minimum
    async fn fee_rate(&self) -> EngineResult<u64> {
        let smoothed = match &self.fee_service {
            Some(service) => service.fee_per_kb().await,
            None => None,
        };
        let estimate = match smoothed {
            Some(rate) => Some(rate),
            None => self.api.fee_per_kb(ESTIMATE_TARGET_BLOCKS).await?,
        };

        let settings = self.settings();
        let rate = estimate
            .map(|rate| policy::with_buffer(rate, settings.fee_buffer_percent))
            .unwrap_or(0)
            .max(settings.min_relay_fee_per_kb);
        if rate == 0 {
            return Err(EngineError::ChainConnection {
                chain: self.chain(),
                message: "no fee estimate available".to_string(),
            });
        }
        Ok(rate)
    }

    /// Spendable outputs of `address`, largest first
    async fn spendable(
        &self,
        address: &str,
        locked: &HashSet<(String, u32)>,
    ) -> EngineResult<Vec<Utxo>> {
        let mut utxos: Vec<Utxo> = self
            .api
            .utxos(address)
            .await?
            .into_iter()
            .filter(|u| !locked.contains(&(u.txid.clone(), u.vout)))
            .collect();
        utxos.sort_by(|a, b| b.value.cmp(&a.value).then(b.confirmed.cmp(&a.confirmed)));
        Ok(utxos)
    }

    /// Inputs of a REPLACED_PENDING record up the replacement chain, which
    /// the replacement must spend again
    async fn reused_inputs(&self, record: &TransactionRecord) -> EngineResult<Vec<TransactionInput>> {
        match lifecycle::pending_predecessor(self, record.id).await? {
            Some(pinned) => self.store().inputs(pinned.id).await,
            None => Ok(Vec::new()),
        }
    }

    /// Own in-flight record whose change one of the inputs spends
    async fn find_ancestor(
        &self,
        record: &TransactionRecord,
        unconfirmed: &[String],
    ) -> EngineResult<Option<i64>> {
        for txid in unconfirmed {
            if let Some(parent) = self.store().find_by_hash(self.chain(), txid).await? {
                if parent.id != record.id && !parent.status.is_final() {
                    return Ok(Some(parent.id));
                }
            }
        }
        Ok(None)
    }

    fn insufficient(&self, have: u64, need: u64) -> EngineError {
        EngineError::InsufficientBalance {
            chain: self.chain(),
            have,
            need,
        }
    }

    /// Add outputs until `needed(input_count)` is covered
    fn select(
        &self,
        address: &str,
        mut selection: Selection,
        available: Vec<Utxo>,
        needed: impl Fn(usize) -> u64,
    ) -> EngineResult<Selection> {
        let mut available = available.into_iter();
        while selection.total < needed(selection.inputs.len()) {
            match available.next() {
                Some(utxo) => selection.push(address, utxo),
                None => {
                    return Err(self.insufficient(selection.total, needed(selection.inputs.len())))
                }
            }
        }
        Ok(selection)
    }

    fn fee_for(&self, record: &TransactionRecord, inputs: usize, outputs: usize, rate: u64) -> u64 {
        record
            .fee
            .unwrap_or_else(|| policy::fee_for_size(policy::utxo_size(inputs, outputs), rate))
    }

    fn classify(response: &crate::chain::UtxoSubmitResponse) -> SubmitOutcome {
        if response.accepted {
            return SubmitOutcome::Submitted;
        }
        let message = response.message.to_lowercase();
        if ["min relay fee not met", "insufficient fee", "mempool min fee"]
            .iter()
            .any(|m| message.contains(m))
        {
            return SubmitOutcome::FeeTooLow;
        }
        if ["already in mempool", "already known", "txn-already-known"]
            .iter()
            .any(|m| message.contains(m))
        {
            return SubmitOutcome::Submitted;
        }
        SubmitOutcome::Rejected
    }
}

#[async_trait]
impl ChainWallet for UtxoWallet {
    fn context(&self) -> &WalletContext {
        &self.context
    }

    fn fee_service(&self) -> Option<Arc<FeeService>> {
        self.fee_service.clone()
    }

    async fn create_payment_transaction(&self, request: PaymentRequest) -> EngineResult<i64> {
        if request.amount.is_none() {
            return Err(EngineError::Unsupported {
                chain: self.chain(),
                operation: "account deletion".to_string(),
            });
        }
        if request.fee_source.is_some() && request.pay_fee_from_amount {
            return Err(EngineError::InvalidAmount(
                "fee cannot be paid from the amount when a fee source is given".to_string(),
            ));
        }
        self.context.create_checked(request).await
    }

    async fn prepare(&self, record: &TransactionRecord) -> EngineResult<PreparedTransaction> {
        let amount = record.amount.ok_or_else(|| EngineError::Unsupported {
            chain: self.chain(),
            operation: "account deletion".to_string(),
        })?;
        let dust = self.settings().dust_amount;
        let rate = self.fee_rate().await?;

        let locked: HashSet<(String, u32)> = self
            .store()
            .locked_inputs(self.chain())
            .await?
            .iter()
            .map(TransactionInput::outpoint)
            .collect();
        let reused = self.reused_inputs(record).await?;

        let mut outputs = vec![TxOutput {
            address: record.destination.clone(),
            value: amount,
        }];

        let (inputs, fee, unconfirmed) = match &record.fee_source {
            None => {
                let available = self.spendable(&record.source, &locked).await?;
                let needed = |n: usize| {
                    let fee = self.fee_for(record, n.max(1), 2, rate);
                    if record.pay_fee_from_amount {
                        amount.max(fee + 1)
                    } else {
                        amount + fee
                    }
                };
                let selection =
                    self.select(&record.source, Selection::new(reused), available, needed)?;

                let mut fee = self.fee_for(record, selection.inputs.len(), 2, rate);
                let delivered = policy::amount_after_fee(amount, fee, record.pay_fee_from_amount)?;
                outputs[0].value = delivered;

                let change = selection.total - delivered - fee;
                if change >= dust.max(1) {
                    outputs.push(TxOutput {
                        address: record.source.clone(),
                        value: change,
                    });
                } else {
                    fee += change;
                }
                (selection.inputs, fee, selection.unconfirmed)
            }
            Some(fee_source) => {
                let (reused_fee, reused_source): (Vec<_>, Vec<_>) =
                    reused.into_iter().partition(|i| &i.address == fee_source);

                let available = self.spendable(&record.source, &locked).await?;
                let source = self.select(
                    &record.source,
                    Selection::new(reused_source),
                    available,
                    |_| amount,
                )?;

                let available = self.spendable(fee_source, &locked).await?;
                let source_inputs = source.inputs.len();
                let paying = self.select(fee_source, Selection::new(reused_fee), available, |n| {
                    self.fee_for(record, source_inputs + n.max(1), 3, rate)
                })?;

                let mut fee =
                    self.fee_for(record, source_inputs + paying.inputs.len(), 3, rate);
                for (address, change) in [
                    (&record.source, source.total - amount),
                    (fee_source, paying.total - fee),
                ] {
                    if change >= dust.max(1) {
                        outputs.push(TxOutput {
                            address: address.clone(),
                            value: change,
                        });
                    } else {
                        fee += change;
                    }
                }

                let mut inputs = source.inputs;
                inputs.extend(paying.inputs);
                let mut unconfirmed = source.unconfirmed;
                unconfirmed.extend(paying.unconfirmed);
                (inputs, fee, unconfirmed)
            }
        };

        let ancestor = self.find_ancestor(record, &unconfirmed).await?;
        let payload = UtxoPayload {
            inputs: inputs.clone(),
            outputs,
            op_return: record.reference.clone(),
            replaceable: true,
        };

        debug!(
            "Prepared transaction {} on chain {}: {} inputs, {} outputs, fee {} at {}/kB, ancestor {:?}",
            record.id,
            record.chain,
            payload.inputs.len(),
            payload.outputs.len(),
            fee,
            rate,
            ancestor
        );

        Ok(PreparedTransaction {
            payload: serde_json::to_value(&payload)
                .map_err(|e| EngineError::Internal(e.to_string()))?,
            fee,
            inputs,
            ancestor,
        })
    }

    async fn submit(&self, blob: &str, record: &TransactionRecord) -> EngineResult<SubmitResponse> {
        let response = self.api.submit(blob).await?;
        let outcome = Self::classify(&response);
        debug!(
            "Submit of transaction {} on chain {} returned {:?}: {}",
            record.id, record.chain, outcome, response.message
        );
        Ok(SubmitResponse {
            outcome,
            message: response.message,
        })
    }

    async fn check_pending(&self, record: TransactionRecord) -> EngineResult<()> {
        let hash = record.transaction_hash.clone().ok_or_else(|| {
            EngineError::Internal(format!("Transaction {} has no hash", record.id))
        })?;

        let block = self.api.current_block().await?;
        let on_chain = self.api.transaction(&hash).await?;
        if let Some(tx) = &on_chain {
            if tx.block_number.is_some() {
                return match evaluate_finality(tx, block.number, self.settings().confirmations()) {
                    Finality::Final { success } => {
                        lifecycle::finalize(self, record, success, tx.result.clone()).await
                    }
                    _ => Ok(()),
                };
            }
        }

        let expired = policy::deadline_exceeded(&record, self.settings(), &block);
        if let (None, Some(reason)) = (&on_chain, &expired) {
            let reason = format!("not on chain and {}", reason);
            return lifecycle::fail_record(self, record, reason).await;
        }

        if !policy::pending_timed_out(&record, self.settings().pending_timeout(), Utc::now()) {
            return Ok(());
        }

        match on_chain {
            // Still in the mempool: bump with the same inputs
            Some(_) if expired.is_none() => {
                info!(
                    "Transaction {} on chain {} stuck in mempool, replacing by fee",
                    record.id, record.chain
                );
                lifecycle::resubmit(self, record, TransactionStatus::ReplacedPending).await
            }
            // Past the deadline but still relayable: it may yet be mined, so
            // it is neither replaced nor failed
            Some(_) => {
                debug!(
                    "Transaction {} on chain {} past its deadline, waiting for mempool outcome",
                    record.id, record.chain
                );
                Ok(())
            }
            None => {
                info!(
                    "Transaction {} on chain {} dropped by the network, replacing",
                    record.id, record.chain
                );
                lifecycle::resubmit(self, record, TransactionStatus::Replaced).await
            }
        }
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

    /// A relayed replacement must pay for itself and for everything it
    /// evicts: the old fee, fees of descendants spending its change, and the
    /// relay fee of its own size.
    async fn replacement_fee_floor(&self, old: &TransactionRecord) -> EngineResult<u64> {
        if old.status != TransactionStatus::Pending {
            return Ok(0);
        }
        let Some(raw) = old.raw.as_deref() else {
            return Ok(0);
        };

        let size = decode_blob::<UtxoPayload>(raw)?.payload.size();
        let descendants: u64 = self
            .store()
            .descendants(old.id)
            .await?
            .iter()
            .filter_map(|d| d.fee)
            .sum();

        Ok(old.fee.unwrap_or(0)
            + descendants
            + policy::fee_for_size(size, self.settings().min_relay_fee_per_kb))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::utxo_api::MockUtxoChainApi;
    use crate::chain::UtxoSubmitResponse;
    use crate::config::ChainSettings;
    use crate::state::{ChainType, MemoryStore, NewTransaction, TransactionStore};
    use crate::wallet::InMemoryKeyStore;
    use std::time::Duration;

    const KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    fn utxo(txid: &str, value: u64, confirmed: bool) -> Utxo {
        Utxo {
            txid: txid.to_string(),
            vout: 0,
            value,
            confirmed,
        }
    }

    fn wallet(api: MockUtxoChainApi, store: Arc<MemoryStore>) -> UtxoWallet {
        let keys = InMemoryKeyStore::new();
        keys.insert("mSource", KEY);
        keys.insert("mFees", KEY);
        let mut settings = ChainSettings::for_chain(ChainType::TestBtc);
        settings.dust_amount = 50;
        settings.min_relay_fee_per_kb = 1000;
        UtxoWallet::new(
            WalletContext::new(settings, store, Arc::new(keys), Duration::from_secs(1)),
            Arc::new(api),
            None,
        )
    }

    async fn created(store: &MemoryStore, wallet: &UtxoWallet, request: PaymentRequest) -> TransactionRecord {
        let id = wallet.create_payment_transaction(request).await.unwrap();
        store.get_transaction(id).await.unwrap().unwrap()
    }

    fn payload(prepared: &PreparedTransaction) -> UtxoPayload {
        serde_json::from_value(prepared.payload.clone()).unwrap()
    }

    #[test]
    fn test_submit_classification() {
        let response = |accepted: bool, message: &str| UtxoSubmitResponse {
            accepted,
            message: message.to_string(),
        };
        assert_eq!(UtxoWallet::classify(&response(true, "abcd")), SubmitOutcome::Submitted);
        assert_eq!(
            UtxoWallet::classify(&response(false, "min relay fee not met, 100 < 226")),
            SubmitOutcome::FeeTooLow
        );
        assert_eq!(
            UtxoWallet::classify(&response(false, "txn-already-known")),
            SubmitOutcome::Submitted
        );
        assert_eq!(
            UtxoWallet::classify(&response(false, "bad-txns-inputs-missingorspent")),
            SubmitOutcome::Rejected
        );
    }

    #[tokio::test]
    async fn test_account_deletion_unsupported() {
        let store = Arc::new(MemoryStore::new());
        let wallet = wallet(MockUtxoChainApi::new(), store);
        let result = wallet
            .create_delete_account_transaction(crate::wallet::DeleteAccountRequest::new(
                "mSource", "mDest",
            ))
            .await;
        assert!(matches!(result, Err(EngineError::Unsupported { .. })));
    }

    #[tokio::test]
    async fn test_prepare_selects_largest_and_returns_change() {
        let store = Arc::new(MemoryStore::new());
        let mut api = MockUtxoChainApi::new();
        api.expect_fee_per_kb().returning(|_| Ok(Some(1000)));
        api.expect_utxos().returning(|_| {
            Ok(vec![
                utxo("aa", 600, true),
                utxo("bb", 5_000, true),
                utxo("cc", 2_000, true),
            ])
        });
        let wallet = wallet(api, store.clone());

        let mut request = PaymentRequest::new("mSource", "mDest", 1_000);
        request.reference = Some("invoice-7".to_string());
        let record = created(&store, &wallet, request).await;

        let prepared = wallet.prepare(&record).await.unwrap();
        let payload = payload(&prepared);
        // one input, two outputs: 226 bytes at 1000/kB
        assert_eq!(prepared.fee, 226);
        assert_eq!(payload.inputs.len(), 1);
        assert_eq!(payload.inputs[0].txid, "bb");
        assert_eq!(payload.outputs[0].value, 1_000);
        assert_eq!(payload.outputs[1].value, 5_000 - 1_000 - 226);
        assert_eq!(payload.op_return.as_deref(), Some("invoice-7"));
        assert!(payload.replaceable);
        assert_eq!(prepared.ancestor, None);
    }

    #[tokio::test]
    async fn test_dust_change_goes_to_fee() {
        let store = Arc::new(MemoryStore::new());
        let mut api = MockUtxoChainApi::new();
        api.expect_fee_per_kb().returning(|_| Ok(Some(1000)));
        api.expect_utxos().returning(|_| Ok(vec![utxo("aa", 1_250, true)]));
        let wallet = wallet(api, store.clone());

        let record = created(&store, &wallet, PaymentRequest::new("mSource", "mDest", 1_000)).await;
        let prepared = wallet.prepare(&record).await.unwrap();
        assert_eq!(payload(&prepared).outputs.len(), 1);
        assert_eq!(prepared.fee, 250);
    }

    #[tokio::test]
    async fn test_insufficient_funds() {
        let store = Arc::new(MemoryStore::new());
        let mut api = MockUtxoChainApi::new();
        api.expect_fee_per_kb().returning(|_| Ok(Some(1000)));
        api.expect_utxos().returning(|_| Ok(vec![utxo("aa", 900, true)]));
        let wallet = wallet(api, store.clone());

        let record = created(&store, &wallet, PaymentRequest::new("mSource", "mDest", 1_000)).await;
        let err = wallet.prepare(&record).await.unwrap_err();
        assert!(matches!(err, EngineError::InsufficientBalance { have: 900, .. }));
    }

    #[tokio::test]
    async fn test_fee_source_pays_fee() {
        let store = Arc::new(MemoryStore::new());
        let mut api = MockUtxoChainApi::new();
        api.expect_fee_per_kb().returning(|_| Ok(Some(1000)));
        api.expect_utxos().returning(|address| {
            Ok(match address {
                "mSource" => vec![utxo("aa", 1_000, true)],
                _ => vec![utxo("ff", 10_000, true)],
            })
        });
        let wallet = wallet(api, store.clone());

        let mut request = PaymentRequest::new("mSource", "mDest", 1_000);
        request.fee_source = Some("mFees".to_string());
        let record = created(&store, &wallet, request).await;

        let prepared = wallet.prepare(&record).await.unwrap();
        let payload = payload(&prepared);
        // two inputs, three outputs
        assert_eq!(prepared.fee, 408);
        assert_eq!(payload.inputs.len(), 2);
        assert_eq!(payload.outputs.len(), 2);
        assert_eq!(payload.outputs[1].address, "mFees");
        assert_eq!(payload.outputs[1].value, 10_000 - 408);
    }

    #[tokio::test]
    async fn test_fee_source_with_fee_from_amount_rejected() {
        let store = Arc::new(MemoryStore::new());
        let wallet = wallet(MockUtxoChainApi::new(), store);
        let mut request = PaymentRequest::new("mSource", "mDest", 1_000);
        request.fee_source = Some("mFees".to_string());
        request.pay_fee_from_amount = true;
        let result = wallet.create_payment_transaction(request).await;
        assert!(matches!(result, Err(EngineError::InvalidAmount(_))));
    }

    #[tokio::test]
    async fn test_locked_inputs_are_skipped_and_ancestor_linked() {
        let store = Arc::new(MemoryStore::new());
        let mut api = MockUtxoChainApi::new();
        api.expect_fee_per_kb().returning(|_| Ok(Some(1000)));
        api.expect_utxos().returning(|_| {
            Ok(vec![utxo("locked", 9_000, true), utxo("parenthash", 4_000, false)])
        });
        let wallet = wallet(api, store.clone());

        let mut parent = created(&store, &wallet, PaymentRequest::new("mSource", "mDest", 500)).await;
        parent.transaction_hash = Some("PARENTHASH".to_string());
        parent.transition(TransactionStatus::Prepared, Utc::now()).unwrap();
        let locked = TransactionInput {
            txid: "locked".to_string(),
            vout: 0,
            value: 9_000,
            address: "mSource".to_string(),
        };
        store.save_prepared(&parent, &[locked]).await.unwrap();

        let record = created(&store, &wallet, PaymentRequest::new("mSource", "mDest", 1_000)).await;
        let prepared = wallet.prepare(&record).await.unwrap();
        assert_eq!(prepared.inputs.len(), 1);
        assert_eq!(prepared.inputs[0].txid, "parenthash");
        assert_eq!(prepared.ancestor, Some(parent.id));
    }

    #[tokio::test]
    async fn test_replacement_floor_covers_descendants() {
        let store = Arc::new(MemoryStore::new());
        let wallet = wallet(MockUtxoChainApi::new(), store.clone());

        let payload = UtxoPayload {
            inputs: vec![TransactionInput {
                txid: "aa".to_string(),
                vout: 0,
                value: 5_000,
                address: "mSource".to_string(),
            }],
            outputs: vec![
                TxOutput {
                    address: "mDest".to_string(),
                    value: 1_000,
                },
                TxOutput {
                    address: "mSource".to_string(),
                    value: 3_774,
                },
            ],
            op_return: None,
            replaceable: true,
        };
        let keys = crate::wallet::SigningKeys::load(&InMemoryKeyStore::new(), []).unwrap();
        let signed = keys.sign(&serde_json::to_value(&payload).unwrap()).unwrap();

        let mut old = created(&store, &wallet, PaymentRequest::new("mSource", "mDest", 1_000)).await;
        old.fee = Some(226);
        old.raw = Some(signed.blob);
        old.status = TransactionStatus::Pending;

        let mut child = NewTransaction::new(ChainType::TestBtc, "mSource", "mOther", Some(700));
        child.ancestor = Some(old.id);
        child.fee = Some(300);
        store.create_transaction(child).await.unwrap();

        // 226 + 300 + relay fee of 226 bytes
        assert_eq!(wallet.replacement_fee_floor(&old).await.unwrap(), 752);

        old.status = TransactionStatus::SubmissionFailed;
        assert_eq!(wallet.replacement_fee_floor(&old).await.unwrap(), 0);
    }
}
