// Copyright (c) 2024 The Botho Foundation

//! Transfer records and their state machine.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    chains::{Leg, TransferDirection},
    error::BridgeError,
};

/// The status of a bridge transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Record persisted, nothing broadcast yet
    Created,

    /// Source deposit broadcast, waiting for confirmations
    DepositPending,

    /// Source deposit reached its confirmation threshold
    DepositConfirmed,

    /// Relay-chain custody action broadcast
    RelayPending,

    /// Relay action reached its confirmation threshold
    RelayConfirmed,

    /// Destination withdrawal broadcast
    WithdrawPending,

    /// Withdrawal confirmed, transfer complete
    Completed,

    /// Transfer failed, see the record's failure reason
    Failed,

    /// No forward progress within the expiry window
    Expired,
}

impl TransferStatus {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Expired
        )
    }

    /// Position along the happy path. Escape states have no rank.
    fn rank(&self) -> Option<u8> {
        match self {
            TransferStatus::Created => Some(0),
            TransferStatus::DepositPending => Some(1),
            TransferStatus::DepositConfirmed => Some(2),
            TransferStatus::RelayPending => Some(3),
            TransferStatus::RelayConfirmed => Some(4),
            TransferStatus::WithdrawPending => Some(5),
            TransferStatus::Completed => Some(6),
            TransferStatus::Failed | TransferStatus::Expired => None,
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: TransferStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.rank(), next.rank()) {
            (_, None) => true,
            (Some(from), Some(to)) => to == from + 1,
            (None, Some(_)) => false,
        }
    }

    /// The leg whose confirmations are being awaited, if any.
    pub fn active_leg(&self) -> Option<Leg> {
        match self {
            TransferStatus::DepositPending => Some(Leg::Deposit),
            TransferStatus::RelayPending => Some(Leg::Relay),
            TransferStatus::WithdrawPending => Some(Leg::Withdraw),
            _ => None,
        }
    }

    /// The leg that must be broadcast next, if the transfer is between legs.
    pub fn next_submission(&self) -> Option<Leg> {
        match self {
            TransferStatus::Created => Some(Leg::Deposit),
            TransferStatus::DepositConfirmed => Some(Leg::Relay),
            TransferStatus::RelayConfirmed => Some(Leg::Withdraw),
            _ => None,
        }
    }

    pub fn pending_for(leg: Leg) -> TransferStatus {
        match leg {
            Leg::Deposit => TransferStatus::DepositPending,
            Leg::Relay => TransferStatus::RelayPending,
            Leg::Withdraw => TransferStatus::WithdrawPending,
        }
    }

    pub fn confirmed_for(leg: Leg) -> TransferStatus {
        match leg {
            Leg::Deposit => TransferStatus::DepositConfirmed,
            Leg::Relay => TransferStatus::RelayConfirmed,
            Leg::Withdraw => TransferStatus::Completed,
        }
    }

    pub const NON_TERMINAL: [TransferStatus; 6] = [
        TransferStatus::Created,
        TransferStatus::DepositPending,
        TransferStatus::DepositConfirmed,
        TransferStatus::RelayPending,
        TransferStatus::RelayConfirmed,
        TransferStatus::WithdrawPending,
    ];
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransferStatus::Created => "created",
            TransferStatus::DepositPending => "deposit_pending",
            TransferStatus::DepositConfirmed => "deposit_confirmed",
            TransferStatus::RelayPending => "relay_pending",
            TransferStatus::RelayConfirmed => "relay_confirmed",
            TransferStatus::WithdrawPending => "withdraw_pending",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
            TransferStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(TransferStatus::Created),
            "deposit_pending" => Ok(TransferStatus::DepositPending),
            "deposit_confirmed" => Ok(TransferStatus::DepositConfirmed),
            "relay_pending" => Ok(TransferStatus::RelayPending),
            "relay_confirmed" => Ok(TransferStatus::RelayConfirmed),
            "withdraw_pending" => Ok(TransferStatus::WithdrawPending),
            "completed" => Ok(TransferStatus::Completed),
            "failed" => Ok(TransferStatus::Failed),
            "expired" => Ok(TransferStatus::Expired),
            _ => Err(format!("Unknown transfer status: {}", s)),
        }
    }
}

/// Structured cause recorded when a transfer fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// Cancelled by the user before anything was broadcast
    Cancelled,
    /// A leg's broadcast was rejected and will not be retried
    SubmitRejected { leg: Leg, message: String },
    /// The chain rejected the leg by policy
    Irrecoverable { leg: Leg, message: String },
    /// A leg timed out
    Timeout { leg: Leg },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Cancelled => write!(f, "cancelled"),
            FailureReason::SubmitRejected { leg, message } => {
                write!(f, "{} rejected: {}", leg, message)
            }
            FailureReason::Irrecoverable { leg, message } => {
                write!(f, "{} irrecoverable: {}", leg, message)
            }
            FailureReason::Timeout { leg } => write!(f, "{} timed out", leg),
        }
    }
}

/// What a confirmation report did to a leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveOutcome {
    /// Same or lower count, or a report for another transaction
    Ignored,
    /// Confirmation count increased
    Progressed,
    /// Transaction observed in a different block; count restarted
    Reorged,
}

/// Per-leg progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegState {
    /// Transaction hash, once broadcast
    pub tx_hash: Option<String>,

    /// Confirmations observed so far
    pub confirmations: u64,

    /// Block the transaction was last observed in
    pub block_height: Option<u64>,

    /// Sender nonce reserved for this leg's transaction
    pub nonce: Option<u64>,

    /// Latest submission attempt
    pub submitted_at: Option<DateTime<Utc>>,
}

impl LegState {
    /// A submission was attempted but its hash never got persisted.
    pub fn is_ambiguous(&self) -> bool {
        self.nonce.is_some() && self.tx_hash.is_none()
    }

    /// Apply a confirmation report.
    ///
    /// A report from a different block than the stored one is a reorg: the
    /// count restarts from that report's value and the leg rewaits from there.
    pub fn observe(
        &mut self,
        confirmations: u64,
        tx_hash: Option<&str>,
        block_height: Option<u64>,
    ) -> ObserveOutcome {
        let Some(known) = self.tx_hash.as_deref() else {
            return ObserveOutcome::Ignored;
        };
        if tx_hash.is_some_and(|seen| seen != known) {
            return ObserveOutcome::Ignored;
        }

        if let (Some(old), Some(new)) = (self.block_height, block_height) {
            if old != new {
                self.block_height = Some(new);
                self.confirmations = confirmations;
                return ObserveOutcome::Reorged;
            }
        }

        if confirmations > self.confirmations {
            self.confirmations = confirmations;
            if block_height.is_some() {
                self.block_height = block_height;
            }
            ObserveOutcome::Progressed
        } else {
            ObserveOutcome::Ignored
        }
    }

    /// Monotonic merge of a proposed leg state onto the stored one.
    ///
    /// Hashes are write-once and the latest attempt time wins. Confirmations
    /// take the max unless the proposal saw the transaction in a different
    /// block, in which case the proposal's count replaces the stored one.
    fn merge(current: &LegState, proposed: &LegState) -> LegState {
        match (&current.tx_hash, &proposed.tx_hash) {
            (Some(known), Some(other)) if known != other => return current.clone(),
            (None, None) => {
                // Nothing broadcast: the nonce reservation is the only state
                return LegState {
                    nonce: proposed.nonce,
                    submitted_at: proposed.submitted_at,
                    ..LegState::default()
                };
            }
            _ => {}
        }

        let (confirmations, block_height) = match (current.block_height, proposed.block_height) {
            (Some(old), Some(new)) if old != new => (proposed.confirmations, Some(new)),
            (old, new) => (
                current.confirmations.max(proposed.confirmations),
                new.or(old),
            ),
        };

        LegState {
            tx_hash: current.tx_hash.clone().or_else(|| proposed.tx_hash.clone()),
            confirmations,
            block_height,
            nonce: current.nonce.or(proposed.nonce),
            submitted_at: current.submitted_at.max(proposed.submitted_at),
        }
    }
}

/// Confirmation counters of all three legs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegConfirmations {
    pub source: u64,
    pub relay: u64,
    pub dest: u64,
}

/// A user's request to move value across the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub direction: TransferDirection,
    pub asset: String,
    pub amount: u128,
    /// Address on the source chain
    pub sender: String,
    /// Address on the destination chain
    pub recipient: String,
}

/// One user-initiated cross-chain transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    /// Unique transfer identifier
    pub id: Uuid,

    pub direction: TransferDirection,

    /// Asset symbol
    pub asset: String,

    /// Amount in the asset's base units
    pub amount: u128,

    /// Bridge fee deducted on the relay leg
    pub fee: u128,

    /// Sender's address on the source chain
    pub sender: String,

    /// Recipient's address on the destination chain
    pub recipient: String,

    /// Deposit on the source chain
    pub source: LegState,

    /// Custody action on the relay chain
    pub relay: LegState,

    /// Withdrawal on the destination chain
    pub dest: LegState,

    pub status: TransferStatus,

    /// Set only when status is Failed
    pub failure_reason: Option<FailureReason>,

    /// The active leg's adapter has exhausted its retry budget
    pub degraded: bool,

    pub created_at: DateTime<Utc>,

    /// Changes on every persisted change
    pub updated_at: DateTime<Utc>,

    /// Changes only on forward progress; drives expiry
    pub last_progress_at: DateTime<Utc>,
}

impl TransferRecord {
    /// Create a new record in status Created.
    pub fn new(request: TransferRequest, fee: u128) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            direction: request.direction,
            asset: request.asset,
            amount: request.amount,
            fee,
            sender: request.sender,
            recipient: request.recipient,
            source: LegState::default(),
            relay: LegState::default(),
            dest: LegState::default(),
            status: TransferStatus::Created,
            failure_reason: None,
            degraded: false,
            created_at: now,
            updated_at: now,
            last_progress_at: now,
        }
    }

    pub fn leg(&self, leg: Leg) -> &LegState {
        match leg {
            Leg::Deposit => &self.source,
            Leg::Relay => &self.relay,
            Leg::Withdraw => &self.dest,
        }
    }

    pub fn leg_mut(&mut self, leg: Leg) -> &mut LegState {
        match leg {
            Leg::Deposit => &mut self.source,
            Leg::Relay => &mut self.relay,
            Leg::Withdraw => &mut self.dest,
        }
    }

    /// Amount moved on the relay and withdraw legs.
    pub fn net_amount(&self) -> u128 {
        self.amount.saturating_sub(self.fee)
    }

    pub fn confirmations(&self) -> LegConfirmations {
        LegConfirmations {
            source: self.source.confirmations,
            relay: self.relay.confirmations,
            dest: self.dest.confirmations,
        }
    }

    /// No forward progress for longer than `window`.
    pub fn is_stale(&self, now: DateTime<Utc>, window: Duration) -> bool {
        !self.status.is_terminal() && now - self.last_progress_at > window
    }

    /// Equal apart from `updated_at`.
    pub fn same_state(&self, other: &TransferRecord) -> bool {
        let mut other = other.clone();
        other.updated_at = self.updated_at;
        *self == other
    }

    /// Merge a proposed version of this record onto the stored one.
    ///
    /// Immutable fields always come from the stored record. Status may only
    /// follow the state machine, and a terminal record accepts no change
    /// beyond audit metadata.
    pub fn reconcile(&self, proposed: &TransferRecord) -> Result<TransferRecord, BridgeError> {
        if self.status.is_terminal() {
            if proposed.status != self.status {
                return Err(BridgeError::invalid_state(
                    self.id,
                    self.status,
                    format!("move to {}", proposed.status),
                ));
            }
            let mut kept = self.clone();
            kept.degraded = proposed.degraded;
            return Ok(kept);
        }

        if proposed.status != self.status && !self.status.can_transition_to(proposed.status) {
            return Err(BridgeError::invalid_state(
                self.id,
                self.status,
                format!("move to {}", proposed.status),
            ));
        }

        let failure_reason = if proposed.status == TransferStatus::Failed {
            proposed
                .failure_reason
                .clone()
                .or_else(|| self.failure_reason.clone())
        } else {
            None
        };

        Ok(TransferRecord {
            id: self.id,
            direction: self.direction,
            asset: self.asset.clone(),
            amount: self.amount,
            fee: self.fee,
            sender: self.sender.clone(),
            recipient: self.recipient.clone(),
            source: LegState::merge(&self.source, &proposed.source),
            relay: LegState::merge(&self.relay, &proposed.relay),
            dest: LegState::merge(&self.dest, &proposed.dest),
            status: proposed.status,
            failure_reason,
            degraded: proposed.degraded,
            created_at: self.created_at,
            updated_at: proposed.updated_at.max(self.updated_at),
            last_progress_at: proposed.last_progress_at.max(self.last_progress_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> TransferRequest {
        TransferRequest {
            direction: TransferDirection::ZilToEth,
            asset: "ZIL".to_string(),
            amount: 1_000_000,
            sender: "zil1kpqxp52fnydyf5gws0z8fuxgnmunthtnajmwwr".to_string(),
            recipient: "0x1234567890abcdef1234567890abcdef12345678".to_string(),
        }
    }

    fn pending_record() -> TransferRecord {
        let mut record = TransferRecord::new(request(), 1_000);
        record.source.tx_hash = Some("0xdeposit".to_string());
        record.source.nonce = Some(7);
        record.status = TransferStatus::DepositPending;
        record
    }

    #[test]
    fn test_new_transfer() {
        let record = TransferRecord::new(request(), 1_000);
        assert_eq!(record.status, TransferStatus::Created);
        assert_eq!(record.net_amount(), 999_000);
        assert_eq!(record.confirmations(), LegConfirmations::default());
        assert!(record.failure_reason.is_none());
    }

    #[test]
    fn test_status_transitions() {
        assert!(TransferStatus::Created.can_transition_to(TransferStatus::DepositPending));
        assert!(!TransferStatus::Created.can_transition_to(TransferStatus::DepositConfirmed));
        assert!(!TransferStatus::RelayPending.can_transition_to(TransferStatus::DepositPending));
        assert!(TransferStatus::WithdrawPending.can_transition_to(TransferStatus::Completed));
        assert!(TransferStatus::RelayPending.can_transition_to(TransferStatus::Failed));
        assert!(TransferStatus::Created.can_transition_to(TransferStatus::Expired));

        for terminal in [
            TransferStatus::Completed,
            TransferStatus::Failed,
            TransferStatus::Expired,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(TransferStatus::Failed));
            assert!(!terminal.can_transition_to(TransferStatus::Created));
        }
    }

    #[test]
    fn test_status_round_trips_through_display() {
        for status in TransferStatus::NON_TERMINAL {
            assert_eq!(status.to_string().parse::<TransferStatus>().unwrap(), status);
        }
        assert_eq!(
            TransferStatus::confirmed_for(Leg::Withdraw),
            TransferStatus::Completed
        );
    }

    #[test]
    fn test_observe_ignores_stale_counts() {
        let mut leg = pending_record().source;
        assert_eq!(leg.observe(5, None, Some(100)), ObserveOutcome::Progressed);
        assert_eq!(leg.observe(2, None, Some(100)), ObserveOutcome::Ignored);
        assert_eq!(leg.observe(5, None, None), ObserveOutcome::Ignored);
        assert_eq!(leg.confirmations, 5);
    }

    #[test]
    fn test_observe_requires_matching_hash() {
        let mut leg = LegState::default();
        assert_eq!(leg.observe(3, Some("0xabc"), None), ObserveOutcome::Ignored);
        assert_eq!(leg.confirmations, 0);

        let mut leg = pending_record().source;
        assert_eq!(leg.observe(3, Some("0xother"), None), ObserveOutcome::Ignored);
        assert_eq!(leg.confirmations, 0);
    }

    #[test]
    fn test_observe_resets_on_reorg() {
        let mut leg = pending_record().source;
        leg.observe(4, None, Some(100));
        assert_eq!(leg.observe(1, None, Some(103)), ObserveOutcome::Reorged);
        assert_eq!(leg.confirmations, 1);
        assert_eq!(leg.block_height, Some(103));
    }

    #[test]
    fn test_reconcile_takes_max_confirmations() {
        let mut stored = pending_record();
        stored.source.confirmations = 5;
        stored.source.block_height = Some(100);

        let mut proposed = stored.clone();
        proposed.source.confirmations = 2;

        let merged = stored.reconcile(&proposed).unwrap();
        assert_eq!(merged.source.confirmations, 5);
    }

    #[test]
    fn test_reconcile_keeps_immutable_fields() {
        let stored = pending_record();
        let mut proposed = stored.clone();
        proposed.amount = 1;
        proposed.asset = "ETH".to_string();
        proposed.source.tx_hash = Some("0xreplaced".to_string());

        let merged = stored.reconcile(&proposed).unwrap();
        assert_eq!(merged.amount, stored.amount);
        assert_eq!(merged.asset, "ZIL");
        assert_eq!(merged.source.tx_hash.as_deref(), Some("0xdeposit"));
    }

    #[test]
    fn test_reconcile_rejects_regression() {
        let stored = pending_record();
        let mut proposed = stored.clone();
        proposed.status = TransferStatus::Created;

        assert!(matches!(
            stored.reconcile(&proposed),
            Err(BridgeError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_reconcile_freezes_terminal_records() {
        let mut stored = pending_record();
        stored.status = TransferStatus::Expired;

        let mut proposed = stored.clone();
        proposed.status = TransferStatus::DepositConfirmed;
        assert!(stored.reconcile(&proposed).is_err());

        let mut proposed = stored.clone();
        proposed.source.confirmations = 40;
        let merged = stored.reconcile(&proposed).unwrap();
        assert_eq!(merged.source.confirmations, 0);
    }

    #[test]
    fn test_reconcile_releases_unbroadcast_nonce() {
        let mut stored = TransferRecord::new(request(), 0);
        stored.source.nonce = Some(3);
        stored.source.submitted_at = Some(Utc::now());

        let mut proposed = stored.clone();
        proposed.source.nonce = None;
        proposed.source.submitted_at = None;

        let merged = stored.reconcile(&proposed).unwrap();
        assert!(merged.source.nonce.is_none());
        assert!(!merged.source.is_ambiguous());
    }

    #[test]
    fn test_reconcile_keeps_latest_attempt() {
        let first = Utc::now();
        let mut stored = TransferRecord::new(request(), 0);
        stored.source.nonce = Some(3);
        stored.source.submitted_at = Some(first);

        let mut proposed = stored.clone();
        proposed.source.submitted_at = Some(first + chrono::Duration::seconds(300));
        let merged = stored.reconcile(&proposed).unwrap();
        assert_eq!(merged.source.submitted_at, proposed.source.submitted_at);

        // Once broadcast, an older attempt time does not win either
        let mut stored = pending_record();
        stored.source.submitted_at = Some(first);
        let mut proposed = stored.clone();
        proposed.source.submitted_at = Some(first - chrono::Duration::seconds(60));
        let merged = stored.reconcile(&proposed).unwrap();
        assert_eq!(merged.source.submitted_at, Some(first));
    }

    #[test]
    fn test_failure_reason_only_when_failed() {
        let stored = pending_record();
        let mut proposed = stored.clone();
        proposed.failure_reason = Some(FailureReason::Cancelled);

        let merged = stored.reconcile(&proposed).unwrap();
        assert!(merged.failure_reason.is_none());

        proposed.status = TransferStatus::Failed;
        let merged = stored.reconcile(&proposed).unwrap();
        assert_eq!(merged.failure_reason, Some(FailureReason::Cancelled));
    }

    #[test]
    fn test_failure_reason_encoding() {
        let reason = FailureReason::Irrecoverable {
            leg: Leg::Relay,
            message: "asset frozen".to_string(),
        };
        let json = serde_json::to_string(&reason).unwrap();
        assert_eq!(
            json,
            r#"{"kind":"irrecoverable","leg":"relay","message":"asset frozen"}"#
        );
        assert_eq!(serde_json::from_str::<FailureReason>(&json).unwrap(), reason);
        assert_eq!(
            serde_json::to_string(&FailureReason::Cancelled).unwrap(),
            r#"{"kind":"cancelled"}"#
        );
    }

    #[test]
    fn test_is_stale() {
        let record = pending_record();
        let window = Duration::minutes(60);
        assert!(!record.is_stale(record.last_progress_at + Duration::minutes(30), window));
        assert!(record.is_stale(record.last_progress_at + Duration::minutes(61), window));
    }
}
