// Copyright (c) 2024 The Botho Foundation

//! Bridge error taxonomy.

use thiserror::Error;
use uuid::Uuid;

use crate::{chains::Leg, transfer::TransferStatus};

/// Errors surfaced by the transfer coordinator and its store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// Bad user input, rejected before any chain interaction
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Operation attempted against a record in the wrong status
    #[error("transfer {id} is {status}: cannot {operation}")]
    InvalidState {
        id: Uuid,
        status: TransferStatus,
        operation: String,
    },

    /// The chain rejected a broadcast; the caller may retry
    #[error("{leg} submission rejected: {message}")]
    ChainSubmit { leg: Leg, message: String },

    /// Transient RPC or network failure
    #[error("chain query failed: {0}")]
    ChainQuery(String),

    /// The chain rejected the leg permanently; the transfer is failed
    #[error("{leg} rejected irrecoverably: {message}")]
    IrrecoverableChain { leg: Leg, message: String },

    /// Unknown transfer id
    #[error("transfer {0} not found")]
    NotFound(Uuid),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(String),
}

impl BridgeError {
    pub fn invalid_state(id: Uuid, status: TransferStatus, operation: impl Into<String>) -> Self {
        BridgeError::InvalidState {
            id,
            status,
            operation: operation.into(),
        }
    }
}

/// Error returned by a chain adapter when broadcasting a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// Broadcast rejected (bad nonce, insufficient gas, ...). Retryable.
    #[error("rejected: {0}")]
    Rejected(String),

    /// Rejected by chain policy. Retrying cannot succeed.
    #[error("irrecoverable: {0}")]
    Irrecoverable(String),

    /// No answer from the chain; the transaction may or may not be out.
    #[error("outcome unknown: {0}")]
    Indeterminate(String),
}

/// Transient failure while querying a chain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{chain} query failed: {message}")]
pub struct ChainQueryError {
    pub chain: crate::chains::Chain,
    pub message: String,
}

impl ChainQueryError {
    pub fn new(chain: crate::chains::Chain, message: impl Into<String>) -> Self {
        Self {
            chain,
            message: message.into(),
        }
    }
}

impl From<ChainQueryError> for BridgeError {
    fn from(e: ChainQueryError) -> Self {
        BridgeError::ChainQuery(e.to_string())
    }
}
