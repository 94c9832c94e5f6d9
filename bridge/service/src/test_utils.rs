// Copyright (c) 2024 The Botho Foundation

//! In-memory chains and a wired coordinator for tests.

use async_trait::async_trait;
use hub_bridge_core::{
    AssetConfig, BridgeConfig, Chain, ChainQueryError, Leg, SubmitError, TransferDirection,
    TransferRecord, TransferRequest,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::{
    adapter::{AdapterSet, ChainAdapter, ConfirmationStatus, LegTransaction},
    coordinator::{Observation, TransferCoordinator},
    db::Database,
    observer::{TransferEvent, TransferObserver},
    poller::LegWatch,
};

/// Scripted result for the next `submit` call.
pub enum ScriptedSubmit {
    /// Fail without broadcasting
    Fail(SubmitError),
    /// Broadcast, then lose the reply
    BroadcastThenFail,
}

#[derive(Default)]
struct MockState {
    next_nonce: HashMap<String, u64>,
    submitted: Vec<LegTransaction>,
    by_nonce: HashMap<(String, u64), String>,
    confirmations: HashMap<String, ConfirmationStatus>,
    auto_confirm: Option<u64>,
    script: VecDeque<ScriptedSubmit>,
    query_failures: u32,
    broadcasts: u64,
}

/// A chain that keeps transactions in memory.
pub struct MockChainAdapter {
    chain: Chain,
    required_confirmations: u64,
    state: Mutex<MockState>,
}

impl MockChainAdapter {
    pub fn new(chain: Chain, required_confirmations: u64) -> Self {
        Self {
            chain,
            required_confirmations,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Transactions broadcast so far.
    pub fn submitted(&self) -> Vec<LegTransaction> {
        self.state.lock().unwrap().submitted.clone()
    }

    /// Report `confirmations` for every transaction broadcast from now on.
    pub fn auto_confirm(&self, confirmations: u64) {
        self.state.lock().unwrap().auto_confirm = Some(confirmations);
    }

    pub fn script_submit(&self, result: ScriptedSubmit) {
        self.state.lock().unwrap().script.push_back(result);
    }

    pub fn fail_next_queries(&self, count: u32) {
        self.state.lock().unwrap().query_failures = count;
    }

    fn broadcast(&self, state: &mut MockState, tx: &LegTransaction) -> String {
        state.broadcasts += 1;
        let tx_hash = format!("{}-tx-{}", self.chain, state.broadcasts);

        state.submitted.push(tx.clone());
        state
            .by_nonce
            .insert((tx.from.clone(), tx.nonce), tx_hash.clone());
        let next = state.next_nonce.entry(tx.from.clone()).or_default();
        *next = (*next).max(tx.nonce + 1);
        if let Some(confirmations) = state.auto_confirm {
            state.confirmations.insert(
                tx_hash.clone(),
                ConfirmationStatus {
                    confirmations,
                    block_height: Some(1),
                },
            );
        }
        tx_hash
    }
}

#[async_trait]
impl ChainAdapter for MockChainAdapter {
    fn chain(&self) -> Chain {
        self.chain
    }

    fn required_confirmations(&self) -> u64 {
        self.required_confirmations
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(10)
    }

    async fn next_nonce(&self, sender: &str) -> Result<u64, ChainQueryError> {
        let state = self.state.lock().unwrap();
        Ok(state.next_nonce.get(sender).copied().unwrap_or_default())
    }

    async fn submit(&self, tx: &LegTransaction) -> Result<String, SubmitError> {
        let mut state = self.state.lock().unwrap();
        match state.script.pop_front() {
            Some(ScriptedSubmit::Fail(e)) => Err(e),
            Some(ScriptedSubmit::BroadcastThenFail) => {
                self.broadcast(&mut state, tx);
                Err(SubmitError::Indeterminate("connection reset".to_string()))
            }
            None => Ok(self.broadcast(&mut state, tx)),
        }
    }

    async fn get_confirmations(
        &self,
        tx_hash: &str,
    ) -> Result<ConfirmationStatus, ChainQueryError> {
        let mut state = self.state.lock().unwrap();
        if state.query_failures > 0 {
            state.query_failures -= 1;
            return Err(ChainQueryError::new(self.chain, "gateway unavailable"));
        }
        Ok(state
            .confirmations
            .get(tx_hash)
            .copied()
            .unwrap_or_default())
    }

    async fn find_transaction(
        &self,
        sender: &str,
        nonce: u64,
    ) -> Result<Option<String>, ChainQueryError> {
        let state = self.state.lock().unwrap();
        Ok(state.by_nonce.get(&(sender.to_string(), nonce)).cloned())
    }
}

/// Config with a fee-free test asset "X" and three confirmations everywhere.
pub fn test_config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.bridge.fee_bps = 0;
    config.bridge.min_fee = 0;
    config.bridge.rpc_timeout_secs = 1;
    for chain in [
        &mut config.zilliqa,
        &mut config.ethereum,
        &mut config.tradehub,
    ] {
        chain.confirmations_required = 3;
    }
    config.assets.push(AssetConfig {
        symbol: "X".to_string(),
        directions: vec![TransferDirection::ZilToEth, TransferDirection::EthToZil],
        min_amount: 1,
    });
    config
}

/// 100 X from Zilliqa to Ethereum.
pub fn request() -> TransferRequest {
    TransferRequest {
        direction: TransferDirection::ZilToEth,
        asset: "X".to_string(),
        amount: 100,
        sender: "zil1kpqxp52fnydyf5gws0z8fuxgnmunthtnajmwwr".to_string(),
        recipient: "0x1234567890abcdef1234567890abcdef12345678".to_string(),
    }
}

/// A coordinator over an in-memory store and mock chains.
pub struct Harness {
    pub coordinator: Arc<TransferCoordinator>,
    pub db: Database,
    pub adapters: AdapterSet,
    pub zilliqa: Arc<MockChainAdapter>,
    pub ethereum: Arc<MockChainAdapter>,
    pub tradehub: Arc<MockChainAdapter>,
    pub events: broadcast::Receiver<TransferEvent>,
    watch_rx: Option<mpsc::UnboundedReceiver<LegWatch>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: BridgeConfig) -> Self {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();

        let mock = |chain| {
            Arc::new(MockChainAdapter::new(
                chain,
                config.chain(chain).confirmations_required,
            ))
        };
        let zilliqa = mock(Chain::Zilliqa);
        let ethereum = mock(Chain::Ethereum);
        let tradehub = mock(Chain::TradeHub);

        let mut adapters = AdapterSet::new();
        adapters.insert(zilliqa.clone());
        adapters.insert(ethereum.clone());
        adapters.insert(tradehub.clone());

        let observer = TransferObserver::new(1024);
        let events = observer.subscribe();
        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        let coordinator = Arc::new(TransferCoordinator::new(
            config,
            db.clone(),
            adapters.clone(),
            observer,
            watch_tx,
        ));

        Self {
            coordinator,
            db,
            adapters,
            zilliqa,
            ethereum,
            tradehub,
            events,
            watch_rx: Some(watch_rx),
        }
    }

    /// Create the standard test transfer.
    pub async fn create(&self) -> TransferRecord {
        self.coordinator.create_transfer(request()).await.unwrap()
    }

    /// Report `confirmations` for the leg's stored transaction.
    pub async fn observe(&self, id: Uuid, leg: Leg, confirmations: u64) -> TransferRecord {
        let record = self.coordinator.get_status(id).unwrap();
        self.coordinator
            .on_confirmation_observed(
                id,
                Observation {
                    leg,
                    confirmations,
                    tx_hash: record.leg(leg).tx_hash.clone(),
                    block_height: Some(1),
                },
            )
            .await
            .unwrap()
    }

    /// Hand the watch channel to a poller.
    pub fn take_watch_rx(&mut self) -> mpsc::UnboundedReceiver<LegWatch> {
        self.watch_rx.take().expect("watch channel already taken")
    }

    pub fn drain_watches(&mut self) -> Vec<LegWatch> {
        let mut watches = Vec::new();
        if let Some(rx) = self.watch_rx.as_mut() {
            while let Ok(watch) = rx.try_recv() {
                watches.push(watch);
            }
        }
        watches
    }

    pub fn drain_events(&mut self) -> Vec<TransferEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}
