//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use escrow_engine::dispute::{DisputeType, OpenDisputeRequest};
use escrow_engine::fees::TransactionType;
use escrow_engine::gateway::sandbox::{RecordingNotifier, RoundRobinMediators, SandboxGateway};
use escrow_engine::storage::{EscrowStore, MemoryStore};
use escrow_engine::transaction::{
    CreateTransactionRequest, DeliveryInfo, ItemDetails, Transaction,
};
use escrow_engine::{EngineConfig, EscrowEngine};

pub const BUYER: &str = "buyer-1";
pub const SELLER: &str = "seller-1";
pub const MEDIATOR: &str = "mediator-1";

pub struct Harness {
    pub engine: EscrowEngine,
    pub gateway: Arc<SandboxGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub store: Arc<dyn EscrowStore>,
}

pub fn harness() -> Harness {
    harness_with(EngineConfig::default())
}

pub fn harness_with(config: EngineConfig) -> Harness {
    harness_on(Arc::new(MemoryStore::new()), config)
}

pub fn harness_on(store: Arc<dyn EscrowStore>, config: EngineConfig) -> Harness {
    build(store, config, vec![MEDIATOR.to_string()])
}

/// An engine whose mediator directory is empty, so disputes stay `open`.
pub fn harness_without_mediators() -> Harness {
    build(Arc::new(MemoryStore::new()), EngineConfig::default(), vec![])
}

fn build(store: Arc<dyn EscrowStore>, config: EngineConfig, pool: Vec<String>) -> Harness {
    let gateway = Arc::new(SandboxGateway::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let mediators = Arc::new(RoundRobinMediators::new(pool));
    let engine = EscrowEngine::new(
        Arc::clone(&store),
        gateway.clone(),
        mediators,
        notifier.clone(),
        config,
    );
    Harness {
        engine,
        gateway,
        notifier,
        store,
    }
}

/// A two-party request between [`BUYER`] and [`SELLER`].
pub fn request(amount: u64, transaction_type: TransactionType) -> CreateTransactionRequest {
    CreateTransactionRequest {
        buyer_id: BUYER.into(),
        seller_id: SELLER.into(),
        item: ItemDetails {
            title: "Vintage synthesizer".into(),
            description: "Working condition, original case".into(),
            category: "music".into(),
            delivery_method: "courier".into(),
            delivery_timeframe: "3 days".into(),
        },
        transaction_type,
        amount,
        currency: "USD".into(),
        party_count: 2,
        milestones: None,
        metadata: BTreeMap::new(),
    }
}

pub async fn funded(h: &Harness, amount: u64) -> Transaction {
    let tx = h
        .engine
        .create_transaction(request(amount, TransactionType::DigitalProduct))
        .await
        .unwrap();
    h.engine.fund_transaction(&tx.id, "card").await.unwrap()
}

pub async fn delivered(h: &Harness, amount: u64) -> Transaction {
    let tx = funded(h, amount).await;
    h.engine
        .mark_delivered(&tx.id, SELLER, DeliveryInfo::default())
        .await
        .unwrap()
}

pub fn dispute_request(initiator: &str, dispute_type: DisputeType) -> OpenDisputeRequest {
    OpenDisputeRequest {
        initiator_id: initiator.into(),
        dispute_type,
        reason: "item does not match the listing".into(),
        description: "case is missing, two keys broken".into(),
        evidence: vec![],
    }
}
