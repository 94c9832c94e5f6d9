// Copyright (c) 2024 The Botho Foundation

//! Confirmation poller.
//!
//! Receives watch requests for broadcast legs and runs one polling task per
//! (transfer, leg). Each task reports counts to the coordinator until the leg
//! is no longer the transfer's active leg.

use backoff::{backoff::Backoff, ExponentialBackoff};
use hub_bridge_core::{BridgeError, BridgeSettings, Chain, Leg};
use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinSet, time::timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    adapter::{AdapterSet, ChainAdapter},
    coordinator::{Observation, TransferCoordinator},
    engine::ShutdownSignal,
};

/// Request to poll one broadcast leg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegWatch {
    pub transfer_id: Uuid,
    pub leg: Leg,
    pub chain: Chain,
    pub tx_hash: String,
}

/// Retry policy for confirmation queries.
#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub rpc_timeout: Duration,
    /// Consecutive failures before the leg is reported degraded
    pub max_retries: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl PollerSettings {
    pub fn from_config(settings: &BridgeSettings) -> Self {
        Self {
            rpc_timeout: settings.rpc_timeout(),
            max_retries: settings.max_retries,
            backoff_initial: settings.backoff_initial(),
            backoff_max: settings.backoff_max(),
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.backoff_initial,
            randomization_factor: 0.5,
            multiplier: 2.0,
            max_interval: self.backoff_max,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();
        backoff
    }
}

type InFlight = Arc<Mutex<HashSet<(Uuid, Leg)>>>;

/// Removes a leg from the in-flight set when its task ends.
struct InFlightGuard {
    in_flight: InFlight,
    key: (Uuid, Leg),
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.remove(&self.key);
    }
}

/// Dispatches polling tasks for watched legs.
pub struct ConfirmationPoller {
    coordinator: Arc<TransferCoordinator>,
    adapters: AdapterSet,
    settings: PollerSettings,
    watch_rx: mpsc::UnboundedReceiver<LegWatch>,
    in_flight: InFlight,
}

impl ConfirmationPoller {
    pub fn new(
        coordinator: Arc<TransferCoordinator>,
        adapters: AdapterSet,
        settings: PollerSettings,
        watch_rx: mpsc::UnboundedReceiver<LegWatch>,
    ) -> Self {
        Self {
            coordinator,
            adapters,
            settings,
            watch_rx,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Run until shutdown. In-flight polling tasks are aborted on exit.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        info!("Starting confirmation poller");
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Confirmation poller shutting down");
                    break;
                }
                watch = self.watch_rx.recv() => match watch {
                    Some(watch) => {
                        self.spawn(&mut tasks, watch);
                    }
                    None => {
                        info!("Watch channel closed, stopping poller");
                        break;
                    }
                },
                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = result {
                        if e.is_panic() {
                            error!("Polling task panicked: {}", e);
                        }
                    }
                }
            }
        }

        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    /// Start polling a leg unless it is already being polled.
    fn spawn(&self, tasks: &mut JoinSet<()>, watch: LegWatch) -> bool {
        let key = (watch.transfer_id, watch.leg);
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if !in_flight.insert(key) {
                debug!(
                    "Transfer {} {} leg already polled",
                    watch.transfer_id, watch.leg
                );
                return false;
            }
        }
        let guard = InFlightGuard {
            in_flight: self.in_flight.clone(),
            key,
        };

        let adapter = match self.adapters.get(watch.chain) {
            Ok(adapter) => adapter.clone(),
            Err(e) => {
                error!("Cannot poll transfer {}: {}", watch.transfer_id, e);
                return false;
            }
        };

        let coordinator = self.coordinator.clone();
        let settings = self.settings.clone();
        tasks.spawn(async move {
            let _guard = guard;
            poll_leg(coordinator, adapter, settings, watch).await;
        });
        true
    }
}

async fn poll_leg(
    coordinator: Arc<TransferCoordinator>,
    adapter: Arc<dyn ChainAdapter>,
    settings: PollerSettings,
    watch: LegWatch,
) {
    let LegWatch {
        transfer_id,
        leg,
        chain,
        ref tx_hash,
    } = watch;
    debug!("Polling transfer {} {} leg {} on {}", transfer_id, leg, tx_hash, chain);

    let mut backoff = settings.backoff();
    let mut failures: u32 = 0;

    loop {
        let status = match timeout(settings.rpc_timeout, adapter.get_confirmations(tx_hash)).await
        {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err(format!("{} query timed out", chain)),
        };

        let delay = match status {
            Ok(status) => {
                failures = 0;
                backoff.reset();

                let observation = Observation {
                    leg,
                    confirmations: status.confirmations,
                    tx_hash: Some(tx_hash.clone()),
                    block_height: status.block_height,
                };
                match coordinator
                    .on_confirmation_observed(transfer_id, observation)
                    .await
                {
                    Ok(record) if record.status.active_leg() != Some(leg) => {
                        debug!(
                            "Transfer {} {} leg no longer active ({}), stopping",
                            transfer_id, leg, record.status
                        );
                        return;
                    }
                    Ok(_) => {}
                    Err(BridgeError::NotFound(_)) => {
                        warn!("Transfer {} disappeared, stopping poll", transfer_id);
                        return;
                    }
                    Err(e) => warn!(
                        "Failed to apply confirmations for transfer {}: {}",
                        transfer_id, e
                    ),
                }
                adapter.poll_interval()
            }
            Err(message) => {
                failures += 1;
                debug!(
                    "Confirmation query for transfer {} failed ({} in a row): {}",
                    transfer_id, failures, message
                );

                if failures >= settings.max_retries {
                    match coordinator
                        .report_degraded(transfer_id, leg, &message)
                        .await
                    {
                        Ok(record) if record.status.active_leg() != Some(leg) => return,
                        Ok(_) => {}
                        Err(BridgeError::NotFound(_)) => return,
                        Err(e) => warn!(
                            "Failed to report transfer {} degraded: {}",
                            transfer_id, e
                        ),
                    }
                }
                backoff.next_backoff().unwrap_or(settings.backoff_max)
            }
        };

        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::Harness;
    use hub_bridge_core::TransferStatus;
    use tokio::sync::broadcast;

    fn settings() -> PollerSettings {
        PollerSettings {
            rpc_timeout: Duration::from_secs(1),
            max_retries: 2,
            backoff_initial: Duration::from_millis(1),
            backoff_max: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_backoff_is_bounded() {
        let mut backoff = settings().backoff();
        for _ in 0..20 {
            let delay = backoff.next_backoff().unwrap();
            // Jitter may add up to half the capped interval
            assert!(delay <= Duration::from_millis(8));
        }
    }

    #[tokio::test]
    async fn test_poller_drives_transfer_to_completion() {
        let mut harness = Harness::new();
        for mock in [&harness.zilliqa, &harness.ethereum, &harness.tradehub] {
            mock.auto_confirm(3);
        }

        let id = harness.create().await.id;
        harness.coordinator.submit_deposit(id).await.unwrap();

        let poller = ConfirmationPoller::new(
            harness.coordinator.clone(),
            harness.adapters.clone(),
            settings(),
            harness.take_watch_rx(),
        );
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(poller.run(shutdown_rx));

        let completed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = harness.events.recv().await.unwrap();
                if event.transfer_id == id && event.status == TransferStatus::Completed {
                    return event;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(completed.confirmations.dest, 3);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_single_flight_per_leg() {
        let mut harness = Harness::new();
        let id = harness.create().await.id;
        let record = harness.coordinator.submit_deposit(id).await.unwrap();

        let poller = ConfirmationPoller::new(
            harness.coordinator.clone(),
            harness.adapters.clone(),
            settings(),
            harness.take_watch_rx(),
        );
        let watch = LegWatch {
            transfer_id: id,
            leg: Leg::Deposit,
            chain: Chain::Zilliqa,
            tx_hash: record.source.tx_hash.unwrap(),
        };

        let mut tasks = JoinSet::new();
        assert!(poller.spawn(&mut tasks, watch.clone()));
        assert!(!poller.spawn(&mut tasks, watch.clone()));

        tasks.abort_all();
        while tasks.join_next().await.is_some() {}

        // The guard released the leg when its task ended
        assert!(poller.spawn(&mut tasks, watch));
        tasks.abort_all();
    }

    #[tokio::test]
    async fn test_poller_reports_degraded_after_retries() {
        let mut harness = Harness::new();
        let id = harness.create().await.id;
        harness.coordinator.submit_deposit(id).await.unwrap();
        harness.zilliqa.fail_next_queries(1_000);

        let poller = ConfirmationPoller::new(
            harness.coordinator.clone(),
            harness.adapters.clone(),
            settings(),
            harness.take_watch_rx(),
        );
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(poller.run(shutdown_rx));

        let degraded = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = harness.events.recv().await.unwrap();
                if event.transfer_id == id && event.degraded {
                    return event;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(degraded.status, TransferStatus::DepositPending);

        let record = harness.coordinator.get_status(id).unwrap();
        assert!(record.degraded);
        assert_eq!(record.status, TransferStatus::DepositPending);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
