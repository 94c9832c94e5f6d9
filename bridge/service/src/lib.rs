// Copyright (c) 2024 The Botho Foundation

//! Hub bridge service.
//!
//! Coordinates transfers between Zilliqa and Ethereum through the TradeHub
//! custody chain: persists each transfer, submits its three legs, polls their
//! confirmations and resumes unfinished transfers after a restart.

pub mod adapter;
pub mod coordinator;
pub mod db;
pub mod engine;
pub mod observer;
pub mod poller;
pub mod resume;

#[cfg(test)]
mod test_utils;

pub use coordinator::{Observation, SubmissionOutcome, TransferCoordinator};
pub use observer::{TransferEvent, TransferObserver};
