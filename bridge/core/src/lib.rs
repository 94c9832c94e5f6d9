// Copyright (c) 2024 The Botho Foundation

//! Core types and logic for the hub bridge.
//!
//! This crate provides the domain types for moving value between Zilliqa and
//! Ethereum through the TradeHub custody chain, including:
//!
//! - Transfer records and their state machine
//! - Chain, direction and leg types
//! - Configuration structures
//! - The bridge error taxonomy

pub mod chains;
pub mod config;
pub mod error;
pub mod transfer;

pub use chains::{Chain, ChainAddress, Leg, TransferDirection};
pub use config::{AssetConfig, BridgeConfig, BridgeSettings, ChainConfig, RelaySettings};
pub use error::{BridgeError, ChainQueryError, SubmitError};
pub use transfer::{
    FailureReason, LegConfirmations, LegState, ObserveOutcome, TransferRecord, TransferRequest,
    TransferStatus,
};
