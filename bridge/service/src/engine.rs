// Copyright (c) 2024 The Botho Foundation

//! Bridge engine - wires the coordinator, poller and resume sweep.

use hub_bridge_core::{BridgeConfig, BridgeError};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::{
    adapter::AdapterSet,
    coordinator::TransferCoordinator,
    db::Database,
    observer::TransferObserver,
    poller::{ConfirmationPoller, PollerSettings},
    resume::ResumeManager,
};

/// Shutdown signal type.
pub type ShutdownSignal = broadcast::Receiver<()>;

/// Capacity of the transfer event stream.
const EVENT_CAPACITY: usize = 1024;

/// The main bridge engine that coordinates all components.
pub struct BridgeEngine {
    config: BridgeConfig,
    db: Database,
    adapters: AdapterSet,
    shutdown_tx: broadcast::Sender<()>,
}

impl BridgeEngine {
    /// Create a new bridge engine.
    pub fn new(config: BridgeConfig, db: Database, adapters: AdapterSet) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            db,
            adapters,
            shutdown_tx,
        }
    }

    /// Run the bridge engine until ctrl-c.
    pub async fn run(self) -> Result<(), BridgeError> {
        info!("Starting bridge engine");
        self.config.validate()?;

        let observer = TransferObserver::new(EVENT_CAPACITY);
        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        let coordinator = Arc::new(TransferCoordinator::new(
            self.config.clone(),
            self.db.clone(),
            self.adapters.clone(),
            observer.clone(),
            watch_tx,
        ));

        // Spawn the confirmation poller
        let poller = ConfirmationPoller::new(
            coordinator.clone(),
            self.adapters.clone(),
            PollerSettings::from_config(&self.config.bridge),
            watch_rx,
        );
        let poller_handle = tokio::spawn(poller.run(self.shutdown_tx.subscribe()));

        // Log every transfer event
        let mut events = observer.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let events_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    event = events.recv() => match event {
                        Ok(event) => info!(
                            "Transfer {} is {} (confirmations {}/{}/{}{})",
                            event.transfer_id,
                            event.status,
                            event.confirmations.source,
                            event.confirmations.relay,
                            event.confirmations.dest,
                            if event.degraded { ", degraded" } else { "" }
                        ),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Event log lagged, skipped {} events", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        // Resume incomplete transfers, then sweep periodically
        let resume = ResumeManager::new(coordinator.clone());
        let sweep_interval = self.config.bridge.sweep_interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let sweep_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Resume sweep shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = resume.resume().await {
                            error!("Resume sweep error: {}", e);
                        }
                    }
                }
            }
        });

        // Handle shutdown signals
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Received shutdown signal");

        // Send shutdown signal to all components
        let _ = self.shutdown_tx.send(());

        // Wait for all components to finish
        let (poller, events, sweep) = tokio::join!(poller_handle, events_handle, sweep_handle);
        for (name, result) in [("poller", poller), ("event log", events), ("sweep", sweep)] {
            if let Err(e) = result {
                error!("Bridge {} task failed: {}", name, e);
            }
        }

        info!("Bridge engine stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_config, Harness};

    #[tokio::test]
    async fn test_run_rejects_zero_sweep_interval() {
        let harness = Harness::new();
        let mut config = test_config();
        config.bridge.sweep_interval_secs = 0;

        let engine = BridgeEngine::new(config, harness.db.clone(), harness.adapters.clone());
        let result = tokio::time::timeout(std::time::Duration::from_secs(1), engine.run())
            .await
            .unwrap();
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }
}
