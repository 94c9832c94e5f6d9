// Copyright (c) 2024 The Botho Foundation

//! JSON-RPC adapter for a chain's bridge gateway.
//!
//! Each chain runs a gateway that signs and broadcasts on behalf of the
//! bridge and answers confirmation queries. The gateway speaks JSON-RPC 2.0:
//!
//! - `bridge_nextNonce [sender]` -> u64
//! - `bridge_submitTransaction [tx]` -> hash
//! - `bridge_getConfirmations [hash]` -> `{ confirmations, blockHeight }`
//! - `bridge_findTransaction [sender, nonce]` -> hash or null

use async_trait::async_trait;
use hub_bridge_core::{BridgeError, Chain, ChainConfig, ChainQueryError, SubmitError};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use thiserror::Error;
use tracing::debug;

use super::{ChainAdapter, ConfirmationStatus, LegTransaction};

/// Gateway error code for transactions refused by chain policy.
const POLICY_REJECTION_CODE: i32 = -32003;

/// JSON-RPC request ID counter
static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// JSON-RPC 2.0 request
#[derive(Debug, Serialize)]
struct JsonRpcRequest {
    jsonrpc: &'static str,
    method: &'static str,
    params: Value,
    id: u64,
}

/// JSON-RPC 2.0 response
#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

/// Why a call failed.
#[derive(Debug, Error)]
enum CallError {
    /// The request may not have reached the gateway, or the reply was lost
    #[error("transport error: {0}")]
    Transport(String),
    /// The gateway answered with an error
    #[error("RPC error {code}: {message}")]
    Rpc { code: i32, message: String },
}

/// Adapter backed by a chain gateway's JSON-RPC endpoint.
pub struct JsonRpcChainAdapter {
    chain: Chain,
    url: String,
    client: reqwest::Client,
    required_confirmations: u64,
    poll_interval: Duration,
}

impl JsonRpcChainAdapter {
    pub fn new(chain: Chain, config: &ChainConfig, timeout: Duration) -> Result<Self, BridgeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BridgeError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            chain,
            url: config.rpc_url.clone(),
            client,
            required_confirmations: config.confirmations_required,
            poll_interval: config.poll_interval(),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Value,
    ) -> Result<T, CallError> {
        self.call_optional(method, params)
            .await?
            .ok_or_else(|| CallError::Transport("Missing result in RPC response".to_string()))
    }

    /// Like `call`, but a null result is returned as `None`.
    async fn call_optional<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Value,
    ) -> Result<Option<T>, CallError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: REQUEST_ID.fetch_add(1, Ordering::SeqCst),
        };
        debug!(chain = %self.chain, method, "gateway call");

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| CallError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CallError::Transport(format!(
                "HTTP error: {}",
                response.status()
            )));
        }

        let body: JsonRpcResponse<T> = response
            .json()
            .await
            .map_err(|e| CallError::Transport(e.to_string()))?;

        if let Some(error) = body.error {
            return Err(CallError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        Ok(body.result)
    }

    fn query_error(&self, e: CallError) -> ChainQueryError {
        ChainQueryError::new(self.chain, e.to_string())
    }
}

#[async_trait]
impl ChainAdapter for JsonRpcChainAdapter {
    fn chain(&self) -> Chain {
        self.chain
    }

    fn required_confirmations(&self) -> u64 {
        self.required_confirmations
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn next_nonce(&self, sender: &str) -> Result<u64, ChainQueryError> {
        self.call("bridge_nextNonce", json!([sender]))
            .await
            .map_err(|e| self.query_error(e))
    }

    async fn submit(&self, tx: &LegTransaction) -> Result<String, SubmitError> {
        let params = serde_json::to_value(tx)
            .map_err(|e| SubmitError::Rejected(format!("Failed to encode transaction: {}", e)))?;

        match self.call("bridge_submitTransaction", json!([params])).await {
            Ok(hash) => Ok(hash),
            Err(CallError::Rpc { code, message }) if code == POLICY_REJECTION_CODE => {
                Err(SubmitError::Irrecoverable(message))
            }
            Err(e @ CallError::Rpc { .. }) => Err(SubmitError::Rejected(e.to_string())),
            Err(e @ CallError::Transport(_)) => Err(SubmitError::Indeterminate(e.to_string())),
        }
    }

    async fn get_confirmations(&self, tx_hash: &str) -> Result<ConfirmationStatus, ChainQueryError> {
        self.call("bridge_getConfirmations", json!([tx_hash]))
            .await
            .map_err(|e| self.query_error(e))
    }

    async fn find_transaction(
        &self,
        sender: &str,
        nonce: u64,
    ) -> Result<Option<String>, ChainQueryError> {
        self.call_optional("bridge_findTransaction", json!([sender, nonce]))
            .await
            .map_err(|e| self.query_error(e))
    }
}
