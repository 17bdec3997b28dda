//! End-to-end lifecycle scenarios driven through the monitor loop
//!
//! Run with: cargo test --test lifecycle_scenarios

mod common;

use std::sync::Arc;

use common::{context, owned_loop, FakeLedger, FakeUtxoNode};
use tokio_test::assert_ok;
use wallet_engine::config::ChainSettings;
use wallet_engine::error::EngineError;
use wallet_engine::fee::FeeService;
use wallet_engine::lock::{ManualClock, SystemClock};
use wallet_engine::state::{
    ChainType, MemoryStore, NewTransaction, TransactionStatus, TransactionStore,
};
use wallet_engine::wallet::{
    decode_blob, AccountPayload, AccountWallet, ChainWallet, PaymentRequest, UtxoPayload,
    UtxoWallet, WalletRegistry,
};

fn ledger_settings() -> ChainSettings {
    let mut settings = ChainSettings::for_chain(ChainType::TestXrp);
    settings.dust_amount = 1;
    settings
}

fn account_wallet(ledger: Arc<FakeLedger>, store: Arc<MemoryStore>) -> Arc<AccountWallet> {
    Arc::new(AccountWallet::new(
        context(ledger_settings(), store, &["rSource"]),
        ledger,
    ))
}

#[tokio::test]
async fn test_fee_per_kb_payment_reaches_submitted() {
    let store = Arc::new(MemoryStore::new());
    let node = Arc::new(FakeUtxoNode::new());
    node.fund("mSource", "f00d", 10_000);
    // the node's instantaneous estimate is ignored while history exists
    node.state().node_fee_per_kb = Some(5_000);

    let fee_service = Arc::new(FeeService::new(ChainType::TestBtc, node.clone(), 3));
    assert_ok!(fee_service.refresh().await);
    assert_eq!(fee_service.fee_per_kb().await, Some(1_000));

    let mut settings = ChainSettings::for_chain(ChainType::TestBtc);
    settings.dust_amount = 50;
    let wallet: Arc<dyn ChainWallet> = Arc::new(UtxoWallet::new(
        context(settings, store.clone(), &["mSource"]),
        node.clone(),
        Some(fee_service),
    ));

    let id = wallet
        .create_payment_transaction(PaymentRequest::new("mSource", "mDest", 100))
        .await
        .unwrap();
    assert_eq!(
        store.get_transaction(id).await.unwrap().unwrap().status,
        TransactionStatus::Created
    );

    let (main_loop, _, _) = owned_loop(wallet, store.clone(), Arc::new(SystemClock), "m1").await;
    assert!(main_loop.run_iteration(1).await.unwrap());

    let record = store.get_transaction(id).await.unwrap().unwrap();
    assert_eq!(record.status, TransactionStatus::Submitted);
    assert!(record.reached_status_prepared_in_timestamp.is_some());
    assert_eq!(record.submitted_in_block, Some(800_000));

    // one input and two outputs: 226 bytes at 1000 per kB
    let payload = decode_blob::<UtxoPayload>(record.raw.as_deref().unwrap())
        .unwrap()
        .payload;
    assert_eq!(payload.inputs.len(), 1);
    assert_eq!(payload.outputs.len(), 2);
    assert_eq!(record.fee, Some(226));
    assert_eq!(payload.outputs[0].value, 100);
    assert_eq!(payload.outputs[1].value, 10_000 - 100 - 226);
    assert_eq!(node.state().submitted.len(), 1);
}

#[tokio::test]
async fn test_fee_too_low_is_escalated_by_replacement() {
    let store = Arc::new(MemoryStore::new());
    let ledger = Arc::new(FakeLedger::new());
    ledger
        .state()
        .submit_results
        .push_back("telINSUF_FEE_P".to_string());
    let wallet = account_wallet(ledger.clone(), store.clone());

    let id = wallet
        .create_payment_transaction(PaymentRequest::new("rSource", "rDest", 1_000))
        .await
        .unwrap();

    let (main_loop, _, _) =
        owned_loop(wallet, store.clone(), Arc::new(SystemClock), "m1").await;
    main_loop.run_iteration(1).await.unwrap();

    let old = store.get_transaction(id).await.unwrap().unwrap();
    assert_eq!(old.status, TransactionStatus::SubmissionFailed);
    assert_eq!(old.fee, Some(10));

    main_loop.run_iteration(2).await.unwrap();

    let old = store.get_transaction(id).await.unwrap().unwrap();
    assert_eq!(old.status, TransactionStatus::Replaced);
    let new_id = old.replaced_by.expect("replacement linked");
    let new = store.get_transaction(new_id).await.unwrap().unwrap();
    assert_eq!(new.fee, Some(12));
    assert_eq!(new.status, TransactionStatus::Submitted);

    // the replacement reuses the sequence of the record it supersedes
    let sequence = |raw: &str| decode_blob::<AccountPayload>(raw).unwrap().payload.sequence;
    assert_eq!(
        sequence(old.raw.as_deref().unwrap()),
        sequence(new.raw.as_deref().unwrap())
    );
    assert_eq!(ledger.state().submitted.len(), 2);
}

#[tokio::test]
async fn test_expired_deadline_fails_without_submission() {
    let store = Arc::new(MemoryStore::new());
    let ledger = Arc::new(FakeLedger::new());
    let wallet = account_wallet(ledger.clone(), store.clone());

    let mut request = PaymentRequest::new("rSource", "rDest", 1_000);
    request.execute_until_block = Some(50);
    let id = wallet.create_payment_transaction(request).await.unwrap();

    let (main_loop, _, _) =
        owned_loop(wallet, store.clone(), Arc::new(SystemClock), "m1").await;
    main_loop.run_iteration(1).await.unwrap();

    let record = store.get_transaction(id).await.unwrap().unwrap();
    assert_eq!(record.status, TransactionStatus::Failed);
    assert!(record.raw.is_none());
    assert!(record
        .info()
        .reason
        .unwrap_or_default()
        .contains("deadline exceeded"));
    assert!(ledger.state().submitted.is_empty());
}

#[tokio::test]
async fn test_replacement_above_max_fee_fails_record() {
    let store = Arc::new(MemoryStore::new());
    let ledger = Arc::new(FakeLedger::new());
    ledger
        .state()
        .submit_results
        .push_back("telINSUF_FEE_P".to_string());
    let wallet = account_wallet(ledger.clone(), store.clone());

    let mut request = PaymentRequest::new("rSource", "rDest", 1_000);
    request.max_fee = Some(11);
    let id = wallet.create_payment_transaction(request).await.unwrap();

    let (main_loop, _, _) =
        owned_loop(wallet, store.clone(), Arc::new(SystemClock), "m1").await;
    main_loop.run_iteration(1).await.unwrap();
    main_loop.run_iteration(2).await.unwrap();

    let records = store.all_transactions(ChainType::TestXrp).await;
    assert_eq!(records.len(), 1, "no replacement may be created");
    let record = &records[0];
    assert_eq!(record.id, id);
    assert_eq!(record.status, TransactionStatus::Failed);
    assert!(record
        .info()
        .reason
        .unwrap_or_default()
        .contains("exceeds max fee 11"));
    assert_eq!(ledger.state().submitted.len(), 1);
}

#[tokio::test]
async fn test_network_down_leaves_records_untouched() {
    let store = Arc::new(MemoryStore::new());
    let ledger = Arc::new(FakeLedger::new());
    let wallet = account_wallet(ledger.clone(), store.clone());
    let id = wallet
        .create_payment_transaction(PaymentRequest::new("rSource", "rDest", 1_000))
        .await
        .unwrap();

    let (main_loop, _, _) =
        owned_loop(wallet, store.clone(), Arc::new(SystemClock), "m1").await;
    ledger.state().network_up = false;
    assert!(!main_loop.run_iteration(1).await.unwrap());
    assert_eq!(
        store.get_transaction(id).await.unwrap().unwrap().status,
        TransactionStatus::Created
    );

    ledger.state().network_up = true;
    assert!(main_loop.run_iteration(2).await.unwrap());
    assert_eq!(
        store.get_transaction(id).await.unwrap().unwrap().status,
        TransactionStatus::Submitted
    );
}

#[tokio::test]
async fn test_restarted_monitor_finishes_submitted_record() {
    let store = Arc::new(MemoryStore::new());
    let ledger = Arc::new(FakeLedger::new());
    let clock = Arc::new(ManualClock::new(1_000_000));
    let wallet = account_wallet(ledger.clone(), store.clone());

    let id = wallet
        .create_payment_transaction(PaymentRequest::new("rSource", "rDest", 1_000))
        .await
        .unwrap();

    // first monitor broadcasts, then dies without releasing its lease
    let (first, _, _) = owned_loop(wallet.clone(), store.clone(), clock.clone(), "first").await;
    first.run_iteration(1).await.unwrap();
    let record = store.get_transaction(id).await.unwrap().unwrap();
    assert_eq!(record.status, TransactionStatus::Submitted);

    clock.advance(301);
    ledger.confirm(record.transaction_hash.as_deref().unwrap(), 100);
    ledger.state().block = 101;

    let (second, _, _) = owned_loop(wallet, store.clone(), clock.clone(), "second").await;
    assert!(matches!(
        first.run_iteration(2).await,
        Err(EngineError::MonitorStopped { .. })
    ));
    second.run_iteration(0).await.unwrap();

    let records = store.all_transactions(ChainType::TestXrp).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, TransactionStatus::Success);
    assert!(records[0].reached_final_status_in_timestamp.is_some());
    assert_eq!(ledger.state().submitted.len(), 1);
}

#[tokio::test]
async fn test_transitions_never_move_backwards() {
    let store = MemoryStore::new();
    let mut record = store
        .create_transaction(NewTransaction::new(
            ChainType::TestXrp,
            "rSource",
            "rDest",
            Some(1_000),
        ))
        .await
        .unwrap();

    for status in [
        TransactionStatus::Prepared,
        TransactionStatus::Submitted,
        TransactionStatus::Pending,
        TransactionStatus::Success,
    ] {
        record.status = status;
        store.update_transaction(&record).await.unwrap();
    }

    for status in TransactionStatus::ALL {
        let mut stale = record.clone();
        stale.status = status;
        assert!(
            store.update_transaction(&stale).await.is_err(),
            "SUCCESS record accepted {}",
            status
        );
    }

    let mut other = store
        .create_transaction(NewTransaction::new(
            ChainType::TestXrp,
            "rSource",
            "rDest",
            Some(1_000),
        ))
        .await
        .unwrap();
    other.status = TransactionStatus::Submitted;
    store.update_transaction(&other).await.unwrap();
    other.status = TransactionStatus::Prepared;
    assert!(matches!(
        store.update_transaction(&other).await,
        Err(EngineError::InvalidStateTransition { .. })
    ));
}

#[tokio::test]
async fn test_registry_routes_by_chain() {
    let store = Arc::new(MemoryStore::new());
    let ledger = Arc::new(FakeLedger::new());
    let registry = WalletRegistry::new();
    registry.register(account_wallet(ledger, store.clone()));

    let id = registry
        .create_payment_transaction(
            ChainType::TestXrp,
            PaymentRequest::new("rSource", "rDest", 1_000),
        )
        .await
        .unwrap();
    let info = registry
        .get_transaction_info(ChainType::TestXrp, id)
        .await
        .unwrap();
    assert_eq!(info.status, TransactionStatus::Created);
    assert_eq!(info.amount, Some(1_000));

    assert!(matches!(
        registry.get(ChainType::Btc),
        Err(EngineError::ChainNotFound { .. })
    ));
    assert!(matches!(
        registry.get_transaction_info(ChainType::TestXrp, 999).await,
        Err(EngineError::TransactionNotFound { id: 999 })
    ));
}

fn utxo_wallet(node: Arc<FakeUtxoNode>, store: Arc<MemoryStore>, pending_timeout_secs: u64) -> Arc<UtxoWallet> {
    let mut settings = ChainSettings::for_chain(ChainType::TestBtc);
    settings.dust_amount = 50;
    settings.min_relay_fee_per_kb = 1_000;
    settings.pending_timeout_secs = pending_timeout_secs;
    Arc::new(UtxoWallet::new(
        context(settings, store, &["mSource"]),
        node,
        None,
    ))
}

fn hash_of(record: &wallet_engine::state::TransactionRecord) -> String {
    record.transaction_hash.clone().expect("signed record has a hash")
}

#[tokio::test]
async fn test_unconfirmed_utxo_payment_is_bumped_and_original_lands() {
    let store = Arc::new(MemoryStore::new());
    let node = Arc::new(FakeUtxoNode::new());
    node.fund("mSource", "f00d", 10_000);
    node.state().node_fee_per_kb = Some(1_000);
    let wallet = utxo_wallet(node.clone(), store.clone(), 0);

    let id = wallet
        .create_payment_transaction(PaymentRequest::new("mSource", "mDest", 100))
        .await
        .unwrap();
    let (main_loop, _, _) = owned_loop(wallet, store.clone(), Arc::new(SystemClock), "m1").await;
    main_loop.run_iteration(1).await.unwrap();

    let original = store.get_transaction(id).await.unwrap().unwrap();
    assert_eq!(original.status, TransactionStatus::Submitted);
    assert_eq!(original.fee, Some(226));
    node.hold_in_mempool(&hash_of(&original));

    // relayed but unconfirmed past the pending timeout
    main_loop.run_iteration(5).await.unwrap();
    assert_eq!(
        store.get_transaction(id).await.unwrap().unwrap().status,
        TransactionStatus::Pending
    );

    main_loop.run_iteration(6).await.unwrap();
    let original = store.get_transaction(id).await.unwrap().unwrap();
    assert_eq!(original.status, TransactionStatus::ReplacedPending);
    let bump = store
        .get_transaction(original.replaced_by.expect("replacement linked"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bump.status, TransactionStatus::Submitted);
    // old fee 226 plus relay fee for its own 226 bytes
    assert_eq!(bump.fee, Some(452));

    let inputs = |raw: &str| decode_blob::<UtxoPayload>(raw).unwrap().payload.inputs;
    let bumped_inputs = inputs(bump.raw.as_deref().unwrap());
    assert_eq!(bumped_inputs, inputs(original.raw.as_deref().unwrap()));
    assert_eq!(bumped_inputs[0].txid, "f00d");

    // the original is mined after all; the bump can no longer land
    node.mine(&hash_of(&original), 800_000);
    main_loop.run_iteration(10).await.unwrap();

    let original = store.get_transaction(id).await.unwrap().unwrap();
    assert_eq!(original.status, TransactionStatus::Success);
    let bump = store.get_transaction(bump.id).await.unwrap().unwrap();
    assert_eq!(bump.status, TransactionStatus::Failed);
    assert!(bump.info().reason.unwrap_or_default().contains("superseded"));
    assert_eq!(node.state().submitted.len(), 2);
}

#[tokio::test]
async fn test_unconfirmed_utxo_payment_fails_once_dropped_past_deadline() {
    let store = Arc::new(MemoryStore::new());
    let node = Arc::new(FakeUtxoNode::new());
    node.fund("mSource", "f00d", 10_000);
    node.state().node_fee_per_kb = Some(1_000);
    let wallet = utxo_wallet(node.clone(), store.clone(), 600);

    let mut request = PaymentRequest::new("mSource", "mDest", 100);
    request.execute_until_block = Some(800_010);
    let id = wallet.create_payment_transaction(request).await.unwrap();
    let (main_loop, _, _) = owned_loop(wallet, store.clone(), Arc::new(SystemClock), "m1").await;
    main_loop.run_iteration(1).await.unwrap();

    let record = store.get_transaction(id).await.unwrap().unwrap();
    node.hold_in_mempool(&hash_of(&record));
    node.state().block = 800_011;

    // deadline passed while relayed: waits for the mempool outcome
    main_loop.run_iteration(5).await.unwrap();
    main_loop.run_iteration(6).await.unwrap();
    assert_eq!(
        store.get_transaction(id).await.unwrap().unwrap().status,
        TransactionStatus::Pending
    );

    node.drop_from_mempool(&hash_of(&record));
    main_loop.run_iteration(7).await.unwrap();

    let records = store.all_transactions(ChainType::TestBtc).await;
    assert_eq!(records.len(), 1, "no replacement past the deadline");
    assert_eq!(records[0].status, TransactionStatus::Failed);
    assert!(records[0]
        .info()
        .reason
        .unwrap_or_default()
        .contains("deadline exceeded"));
}

#[tokio::test]
async fn test_stuck_ledger_payment_replaced_with_same_sequence() {
    let store = Arc::new(MemoryStore::new());
    let ledger = Arc::new(FakeLedger::new());
    let mut settings = ledger_settings();
    settings.pending_timeout_secs = 0;
    let wallet = Arc::new(AccountWallet::new(
        context(settings, store.clone(), &["rSource"]),
        ledger.clone(),
    ));

    let id = wallet
        .create_payment_transaction(PaymentRequest::new("rSource", "rDest", 1_000))
        .await
        .unwrap();
    let (main_loop, _, _) = owned_loop(wallet, store.clone(), Arc::new(SystemClock), "m1").await;
    main_loop.run_iteration(1).await.unwrap();

    // never shows up on the ledger
    main_loop.run_iteration(5).await.unwrap();
    assert_eq!(
        store.get_transaction(id).await.unwrap().unwrap().status,
        TransactionStatus::Pending
    );

    main_loop.run_iteration(6).await.unwrap();
    let original = store.get_transaction(id).await.unwrap().unwrap();
    assert_eq!(original.status, TransactionStatus::ReplacedPending);
    let replacement = store
        .get_transaction(original.replaced_by.expect("replacement linked"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(replacement.fee, Some(12));

    let payload = |raw: &str| decode_blob::<AccountPayload>(raw).unwrap().payload;
    assert_eq!(
        payload(replacement.raw.as_deref().unwrap()).sequence,
        payload(original.raw.as_deref().unwrap()).sequence
    );

    // the replacement is validated; the original becomes REPLACED
    ledger.confirm(&hash_of(&replacement), 100);
    main_loop.run_iteration(10).await.unwrap();

    let replacement = store.get_transaction(replacement.id).await.unwrap().unwrap();
    assert_eq!(replacement.status, TransactionStatus::Success);
    let original = store.get_transaction(id).await.unwrap().unwrap();
    assert_eq!(original.status, TransactionStatus::Replaced);
    assert_eq!(original.replaced_by, Some(replacement.id));
}

#[tokio::test]
async fn test_expired_ledger_payment_takes_lowest_free_sequence() {
    let store = Arc::new(MemoryStore::new());
    let ledger = Arc::new(FakeLedger::new());
    {
        let mut state = ledger.state();
        state.submit_results.push_back("telINSUF_FEE_P".to_string());
        state.submit_results.push_back("terPRE_SEQ".to_string());
    }
    let wallet = account_wallet(ledger.clone(), store.clone());

    let mut capped = PaymentRequest::new("rSource", "rDest", 1_000);
    capped.max_fee = Some(11);
    let first = wallet.create_payment_transaction(capped).await.unwrap();
    let second = wallet
        .create_payment_transaction(PaymentRequest::new("rSource", "rDest", 2_000))
        .await
        .unwrap();

    let (main_loop, _, _) = owned_loop(wallet, store.clone(), Arc::new(SystemClock), "m1").await;
    let sequence = |record: &wallet_engine::state::TransactionRecord| {
        decode_blob::<AccountPayload>(record.raw.as_deref().unwrap())
            .unwrap()
            .payload
            .sequence
    };

    main_loop.run_iteration(1).await.unwrap();
    let waiting = store.get_transaction(second).await.unwrap().unwrap();
    assert_eq!(waiting.status, TransactionStatus::Pending);
    assert_eq!(sequence(&waiting), 8);

    // the first payment cannot be bumped under its cap, leaving sequence 7 unused
    main_loop.run_iteration(2).await.unwrap();
    assert_eq!(
        store.get_transaction(first).await.unwrap().unwrap().status,
        TransactionStatus::Failed
    );

    // the second expires on the ledger
    ledger.state().block = 151;
    main_loop.run_iteration(3).await.unwrap();

    let expired = store.get_transaction(second).await.unwrap().unwrap();
    assert_eq!(expired.status, TransactionStatus::Replaced);
    let replacement = store
        .get_transaction(expired.replaced_by.expect("replacement linked"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(replacement.status, TransactionStatus::Submitted);
    assert_eq!(sequence(&replacement), 7);
    assert_eq!(
        decode_blob::<AccountPayload>(replacement.raw.as_deref().unwrap())
            .unwrap()
            .payload
            .last_ledger_sequence,
        201
    );
}
