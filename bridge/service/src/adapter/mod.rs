// Copyright (c) 2024 The Botho Foundation

//! Chain adapters: the bridge's only view of each ledger.

mod rpc;

pub use rpc::JsonRpcChainAdapter;

use async_trait::async_trait;
use hub_bridge_core::{BridgeConfig, BridgeError, Chain, ChainQueryError, Leg, SubmitError};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc, time::Duration};
use uuid::Uuid;

/// Amounts travel as decimal strings; JSON numbers cannot hold a u128.
mod amount_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(amount: &u128, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&amount.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u128, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A transaction the bridge asks a chain to broadcast for one leg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegTransaction {
    pub transfer_id: Uuid,
    pub leg: Leg,
    pub chain: Chain,
    pub asset: String,
    #[serde(with = "amount_string")]
    pub amount: u128,
    pub from: String,
    pub to: String,
    pub nonce: u64,
    /// Bridge fee carried by the relay leg
    #[serde(with = "amount_string")]
    pub fee: u128,
    pub fee_recipient: Option<String>,
    pub gas_price: u64,
    pub gas_limit: u64,
    /// Transfer id, so a deposit can be matched to its record on chain
    pub memo: String,
}

/// Confirmation state of a broadcast transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationStatus {
    pub confirmations: u64,
    /// Block the transaction is included in, if any
    pub block_height: Option<u64>,
}

/// Operations the coordinator needs from a chain.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn chain(&self) -> Chain;

    /// Confirmations after which a transaction on this chain is final.
    fn required_confirmations(&self) -> u64;

    /// How often to poll this chain.
    fn poll_interval(&self) -> Duration;

    /// Next unused nonce for `sender`.
    async fn next_nonce(&self, sender: &str) -> Result<u64, ChainQueryError>;

    /// Broadcast a transaction and return its hash.
    async fn submit(&self, tx: &LegTransaction) -> Result<String, SubmitError>;

    async fn get_confirmations(&self, tx_hash: &str) -> Result<ConfirmationStatus, ChainQueryError>;

    /// Hash of a transaction already broadcast by `sender` with `nonce`.
    async fn find_transaction(
        &self,
        sender: &str,
        nonce: u64,
    ) -> Result<Option<String>, ChainQueryError>;
}

/// One adapter per chain.
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: HashMap<Chain, Arc<dyn ChainAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build JSON-RPC adapters for every configured chain.
    pub fn from_config(config: &BridgeConfig) -> Result<Self, BridgeError> {
        let mut set = Self::new();
        for chain in Chain::ALL {
            let adapter = JsonRpcChainAdapter::new(
                chain,
                config.chain(chain),
                config.bridge.rpc_timeout(),
            )?;
            set.insert(Arc::new(adapter));
        }
        Ok(set)
    }

    pub fn insert(&mut self, adapter: Arc<dyn ChainAdapter>) {
        self.adapters.insert(adapter.chain(), adapter);
    }

    pub fn get(&self, chain: Chain) -> Result<&Arc<dyn ChainAdapter>, BridgeError> {
        self.adapters
            .get(&chain)
            .ok_or_else(|| BridgeError::Config(format!("No adapter configured for {}", chain)))
    }
}
