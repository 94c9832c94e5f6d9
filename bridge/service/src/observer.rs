// Copyright (c) 2024 The Botho Foundation

//! Transfer progress notifications.

use chrono::{DateTime, Utc};
use hub_bridge_core::{FailureReason, LegConfirmations, TransferRecord, TransferStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Snapshot of a transfer after a persisted change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEvent {
    pub transfer_id: Uuid,
    pub status: TransferStatus,
    pub confirmations: LegConfirmations,
    pub degraded: bool,
    pub failure_reason: Option<FailureReason>,
    pub at: DateTime<Utc>,
}

impl From<&TransferRecord> for TransferEvent {
    fn from(record: &TransferRecord) -> Self {
        Self {
            transfer_id: record.id,
            status: record.status,
            confirmations: record.confirmations(),
            degraded: record.degraded,
            failure_reason: record.failure_reason.clone(),
            at: record.updated_at,
        }
    }
}

/// Fan-out of transfer events to any number of subscribers.
///
/// Slow subscribers lag rather than block the coordinator; a lagged
/// subscriber should re-read the record with `get_status`.
#[derive(Clone)]
pub struct TransferObserver {
    tx: broadcast::Sender<TransferEvent>,
}

impl TransferObserver {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.tx.subscribe()
    }

    /// Publish the current state of `record`.
    pub fn publish(&self, record: &TransferRecord) {
        // No subscribers is not an error
        let _ = self.tx.send(TransferEvent::from(record));
    }
}

impl Default for TransferObserver {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_bridge_core::{TransferDirection, TransferRequest};

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let observer = TransferObserver::new(8);
        let mut rx = observer.subscribe();

        let record = TransferRecord::new(
            TransferRequest {
                direction: TransferDirection::ZilToEth,
                asset: "ZIL".to_string(),
                amount: 10,
                sender: "zil1kpqxp52fnydyf5gws0z8fuxgnmunthtnajmwwr".to_string(),
                recipient: "0x1234567890abcdef1234567890abcdef12345678".to_string(),
            },
            0,
        );
        observer.publish(&record);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.transfer_id, record.id);
        assert_eq!(event.status, TransferStatus::Created);
        assert!(!event.degraded);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let observer = TransferObserver::default();
        let record = TransferRecord::new(
            TransferRequest {
                direction: TransferDirection::EthToZil,
                asset: "ETH".to_string(),
                amount: 10,
                sender: "0x1234567890abcdef1234567890abcdef12345678".to_string(),
                recipient: "zil1kpqxp52fnydyf5gws0z8fuxgnmunthtnajmwwr".to_string(),
            },
            0,
        );
        observer.publish(&record);
    }
}
