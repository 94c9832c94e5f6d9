// Copyright (c) 2024 The Botho Foundation

//! Transfer coordinator: the only writer of a transfer's status.
//!
//! Every mutation takes a per-transfer async lock, so operations on the same
//! transfer are serialized while different transfers proceed in parallel.
//! The store applies each change as a monotonic merge, which makes every
//! operation here safe to repeat.

use chrono::{DateTime, Utc};
use hub_bridge_core::{
    BridgeConfig, BridgeError, Chain, ChainAddress, ChainQueryError, FailureReason, Leg,
    ObserveOutcome, SubmitError, TransferRecord, TransferRequest, TransferStatus,
};
use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
};
use tokio::{
    sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard},
    time::timeout,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    adapter::{AdapterSet, LegTransaction},
    db::Database,
    observer::TransferObserver,
    poller::LegWatch,
};

/// A confirmation report for one leg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub leg: Leg,
    pub confirmations: u64,
    /// Hash the count was observed for; reports for other hashes are ignored
    pub tx_hash: Option<String>,
    pub block_height: Option<u64>,
}

/// What an attempt to move a between-legs transfer forward did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionOutcome {
    /// Nothing to submit in the current status
    NotNeeded,
    /// Created with no deposit attempt; the user must submit
    AwaitingUser,
    /// An earlier ambiguous submission was found on chain
    Adopted,
    /// A leg was broadcast
    Submitted,
    /// Ambiguous submission still inside its grace period
    Deferred,
}

/// Drives transfers through the bridge state machine.
pub struct TransferCoordinator {
    config: BridgeConfig,
    db: Database,
    adapters: AdapterSet,
    observer: TransferObserver,
    watch_tx: mpsc::UnboundedSender<LegWatch>,
    locks: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl TransferCoordinator {
    pub fn new(
        config: BridgeConfig,
        db: Database,
        adapters: AdapterSet,
        observer: TransferObserver,
        watch_tx: mpsc::UnboundedSender<LegWatch>,
    ) -> Self {
        Self {
            config,
            db,
            adapters,
            observer,
            watch_tx,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn observer(&self) -> &TransferObserver {
        &self.observer
    }

    /// Validate a request and persist it as a new Created transfer.
    pub async fn create_transfer(
        &self,
        mut request: TransferRequest,
    ) -> Result<TransferRecord, BridgeError> {
        if request.amount == 0 {
            return Err(BridgeError::InvalidRequest(
                "amount must be positive".to_string(),
            ));
        }

        let asset = self
            .config
            .asset(&request.asset, request.direction)
            .ok_or_else(|| {
                BridgeError::InvalidRequest(format!(
                    "asset {} is not supported for {}",
                    request.asset, request.direction
                ))
            })?;
        if request.amount < asset.min_amount as u128 {
            return Err(BridgeError::InvalidRequest(format!(
                "amount {} is below the minimum of {} {}",
                request.amount, asset.min_amount, asset.symbol
            )));
        }

        ChainAddress::new(request.direction.source_chain(), request.sender.as_str())
            .validate()
            .map_err(|e| BridgeError::InvalidRequest(format!("sender: {}", e)))?;
        ChainAddress::new(request.direction.dest_chain(), request.recipient.as_str())
            .validate()
            .map_err(|e| BridgeError::InvalidRequest(format!("recipient: {}", e)))?;

        let fee = self.config.calculate_fee(request.amount);
        if fee >= request.amount {
            return Err(BridgeError::InvalidRequest(format!(
                "amount {} does not cover the bridge fee of {}",
                request.amount, fee
            )));
        }

        request.asset = asset.symbol.clone();
        let record = TransferRecord::new(request, fee);
        self.db.insert_transfer(&record)?;
        self.db.log_audit(
            Some(&record.id),
            "created",
            &format!(
                "{} {} {} from {} to {}",
                record.direction, record.amount, record.asset, record.sender, record.recipient
            ),
        )?;

        info!(
            "Created transfer {}: {} {} {} (fee {})",
            record.id, record.direction, record.amount, record.asset, record.fee
        );
        self.observer.publish(&record);
        Ok(record)
    }

    /// Broadcast the deposit of a Created transfer.
    pub async fn submit_deposit(&self, id: Uuid) -> Result<TransferRecord, BridgeError> {
        let (_guard, record) = self.lock_loaded(id).await?;

        if record.status != TransferStatus::Created {
            return Err(BridgeError::invalid_state(id, record.status, "submit deposit"));
        }

        if record.source.is_ambiguous() {
            return match self.recover_locked(&record, Leg::Deposit, Utc::now()).await? {
                SubmissionOutcome::Deferred => Err(BridgeError::ChainSubmit {
                    leg: Leg::Deposit,
                    message: "an earlier deposit attempt is still unresolved".to_string(),
                }),
                _ => self.load(&id),
            };
        }

        self.submit_leg_locked(&record, Leg::Deposit, None, Utc::now()).await
    }

    /// Apply a confirmation report and advance the transfer if its leg is final.
    pub async fn on_confirmation_observed(
        &self,
        id: Uuid,
        observation: Observation,
    ) -> Result<TransferRecord, BridgeError> {
        let (_guard, record) = self.lock_loaded(id).await?;
        let leg = observation.leg;

        if record.status.active_leg() != Some(leg) {
            debug!(
                "Ignoring {} report for transfer {} in status {}",
                leg, id, record.status
            );
            return Ok(record);
        }

        let threshold = self
            .adapters
            .get(record.direction.chain_for(leg))?
            .required_confirmations();
        let now = Utc::now();

        let mut outcome = ObserveOutcome::Ignored;
        let updated = self.db.update_monotonic(&id, |r| {
            outcome = r.leg_mut(leg).observe(
                observation.confirmations,
                observation.tx_hash.as_deref(),
                observation.block_height,
            );
            r.degraded = false;
            if outcome == ObserveOutcome::Progressed {
                r.last_progress_at = now;
            }
            if r.leg(leg).confirmations >= threshold {
                r.status = TransferStatus::confirmed_for(leg);
                r.last_progress_at = now;
            }
            Ok(())
        })?;

        if outcome == ObserveOutcome::Reorged {
            warn!(
                "Transfer {} {} leg moved to block {:?}, confirmations reset to {}",
                id, leg, updated.leg(leg).block_height, updated.leg(leg).confirmations
            );
            self.db.log_audit(
                Some(&id),
                "reorg",
                &format!(
                    "{} now at block {:?} with {} confirmations",
                    leg,
                    updated.leg(leg).block_height,
                    updated.leg(leg).confirmations
                ),
            )?;
        }

        if updated.same_state(&record) {
            return Ok(updated);
        }
        self.observer.publish(&updated);

        if updated.status != TransferStatus::confirmed_for(leg) {
            return Ok(updated);
        }
        info!(
            "Transfer {} {} leg confirmed ({} confirmations), now {}",
            id,
            leg,
            updated.leg(leg).confirmations,
            updated.status
        );

        let Some(next) = leg.next() else {
            self.forget(&id);
            return Ok(updated);
        };
        match self.submit_leg_locked(&updated, next, None, now).await {
            Ok(record) => Ok(record),
            Err(e @ BridgeError::IrrecoverableChain { .. }) => {
                error!("Transfer {} failed submitting {}: {}", id, next, e);
                self.load(&id)
            }
            Err(e) => {
                warn!(
                    "Transfer {} could not submit {} yet, will retry on sweep: {}",
                    id, next, e
                );
                self.load(&id)
            }
        }
    }

    /// Force a transfer to Failed. No-op on a terminal transfer.
    pub async fn mark_failed(
        &self,
        id: Uuid,
        reason: FailureReason,
    ) -> Result<TransferRecord, BridgeError> {
        let (_guard, record) = self.lock_loaded(id).await?;
        if record.status.is_terminal() {
            return Ok(record);
        }
        self.fail_locked(&id, reason)
    }

    /// Cancel a transfer that has not attempted its deposit.
    pub async fn cancel(&self, id: Uuid) -> Result<TransferRecord, BridgeError> {
        let (_guard, record) = self.lock_loaded(id).await?;

        if record.status != TransferStatus::Created {
            return Err(BridgeError::invalid_state(id, record.status, "cancel"));
        }
        if record.source.nonce.is_some() {
            return Err(BridgeError::invalid_state(
                id,
                record.status,
                "cancel after a deposit attempt",
            ));
        }

        self.fail_locked(&id, FailureReason::Cancelled)
    }

    /// Read-only snapshot of a transfer.
    pub fn get_status(&self, id: Uuid) -> Result<TransferRecord, BridgeError> {
        self.load(&id)
    }

    /// Flag the active leg as degraded. Does not fail the transfer.
    pub async fn report_degraded(
        &self,
        id: Uuid,
        leg: Leg,
        error: &str,
    ) -> Result<TransferRecord, BridgeError> {
        let (_guard, record) = self.lock_loaded(id).await?;

        if record.degraded || record.status.active_leg() != Some(leg) {
            return Ok(record);
        }

        let updated = self.db.update_monotonic(&id, |r| {
            r.degraded = true;
            Ok(())
        })?;
        warn!("Transfer {} {} leg degraded: {}", id, leg, error);
        self.db
            .log_audit(Some(&id), "degraded", &format!("{}: {}", leg, error))?;
        self.observer.publish(&updated);
        Ok(updated)
    }

    /// Expire the transfer if it has made no progress within the expiry window.
    pub async fn expire_if_stale(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<TransferRecord>, BridgeError> {
        let (_guard, record) = self.lock_loaded(id).await?;

        if !record.is_stale(now, self.config.bridge.expiry_window()) {
            return Ok(None);
        }

        let updated = self.db.update_monotonic(&id, |r| {
            r.status = TransferStatus::Expired;
            Ok(())
        })?;
        info!(
            "Expired transfer {} in status {}, last progress at {}",
            id, record.status, record.last_progress_at
        );
        self.db.log_audit(
            Some(&id),
            "expired",
            &format!("no progress since {}", record.last_progress_at),
        )?;
        self.observer.publish(&updated);
        self.forget(&id);
        Ok(Some(updated))
    }

    /// Resolve an ambiguous submission of `leg`.
    ///
    /// The chain is asked for a transaction from the leg's sender with the
    /// reserved nonce. A match is adopted. Without one, the leg is resubmitted
    /// with the same nonce once the grace period has passed.
    pub async fn recover_submission(
        &self,
        id: Uuid,
        leg: Leg,
        now: DateTime<Utc>,
    ) -> Result<SubmissionOutcome, BridgeError> {
        let (_guard, record) = self.lock_loaded(id).await?;

        if record.status.next_submission() != Some(leg) || !record.leg(leg).is_ambiguous() {
            return Ok(SubmissionOutcome::NotNeeded);
        }
        self.recover_locked(&record, leg, now).await
    }

    /// Move a transfer that sits between legs forward.
    ///
    /// Ambiguous submissions are recovered, a confirmed leg with no attempt
    /// on the next one gets it submitted, and a Created transfer with no
    /// deposit attempt is left for the user.
    pub async fn resume_submission(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<SubmissionOutcome, BridgeError> {
        let (_guard, record) = self.lock_loaded(id).await?;

        let Some(leg) = record.status.next_submission() else {
            return Ok(SubmissionOutcome::NotNeeded);
        };
        if record.leg(leg).is_ambiguous() {
            return self.recover_locked(&record, leg, now).await;
        }
        if leg == Leg::Deposit {
            return Ok(SubmissionOutcome::AwaitingUser);
        }

        self.submit_leg_locked(&record, leg, None, now).await?;
        Ok(SubmissionOutcome::Submitted)
    }

    /// Ask the poller to watch the transfer's active leg.
    ///
    /// Returns false if there is nothing to watch.
    pub fn watch(&self, record: &TransferRecord) -> bool {
        let Some(leg) = record.status.active_leg() else {
            return false;
        };
        let Some(tx_hash) = record.leg(leg).tx_hash.clone() else {
            return false;
        };

        let watch = LegWatch {
            transfer_id: record.id,
            leg,
            chain: record.direction.chain_for(leg),
            tx_hash,
        };
        if self.watch_tx.send(watch).is_err() {
            debug!("No poller running, transfer {} not watched", record.id);
        }
        true
    }

    async fn lock(&self, id: Uuid) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(id).or_default().clone()
        };
        mutex.lock_owned().await
    }

    /// Lock a transfer and read it. Unknown ids leave no lock behind.
    async fn lock_loaded(
        &self,
        id: Uuid,
    ) -> Result<(OwnedMutexGuard<()>, TransferRecord), BridgeError> {
        let guard = self.lock(id).await;
        match self.load(&id) {
            Ok(record) => Ok((guard, record)),
            Err(e) => {
                if matches!(e, BridgeError::NotFound(_)) {
                    self.forget(&id);
                }
                Err(e)
            }
        }
    }

    /// Drop the lock of a transfer that reached a terminal status.
    fn forget(&self, id: &Uuid) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(id);
    }

    fn load(&self, id: &Uuid) -> Result<TransferRecord, BridgeError> {
        self.db.get_transfer(id)?.ok_or(BridgeError::NotFound(*id))
    }

    async fn query<T>(
        &self,
        chain: Chain,
        call: impl Future<Output = Result<T, ChainQueryError>>,
    ) -> Result<T, BridgeError> {
        match timeout(self.config.bridge.rpc_timeout(), call).await {
            Ok(result) => result.map_err(BridgeError::from),
            Err(_) => Err(ChainQueryError::new(chain, "request timed out").into()),
        }
    }

    /// Reserve a nonce, persist the intent, then broadcast.
    ///
    /// With `reuse_nonce` the leg is rebroadcast with an already reserved
    /// nonce, and a rejection keeps that nonce so the next sweep can look it
    /// up again. `attempted_at` restarts the leg's grace period.
    async fn submit_leg_locked(
        &self,
        record: &TransferRecord,
        leg: Leg,
        reuse_nonce: Option<u64>,
        attempted_at: DateTime<Utc>,
    ) -> Result<TransferRecord, BridgeError> {
        let id = record.id;
        let chain = record.direction.chain_for(leg);
        let adapter = self.adapters.get(chain)?.clone();
        let sender = self.sender_for(record, leg);

        let nonce = match reuse_nonce {
            Some(nonce) => nonce,
            None => self.query(chain, adapter.next_nonce(&sender)).await?,
        };

        let record = self.db.update_monotonic(&id, |r| {
            let state = r.leg_mut(leg);
            state.nonce = Some(nonce);
            state.submitted_at = Some(attempted_at);
            Ok(())
        })?;

        let tx = self.build_transaction(&record, leg, &sender, nonce);
        debug!(
            "Submitting {} for transfer {} on {} with nonce {}",
            leg, id, chain, nonce
        );
        let result = match timeout(self.config.bridge.rpc_timeout(), adapter.submit(&tx)).await {
            Ok(result) => result,
            Err(_) => Err(SubmitError::Indeterminate(
                "submission timed out".to_string(),
            )),
        };

        match result {
            Ok(tx_hash) => self.record_broadcast(&id, leg, tx_hash),
            Err(SubmitError::Rejected(message)) => {
                warn!("Transfer {} {} submission rejected: {}", id, leg, message);
                if reuse_nonce.is_none() {
                    self.db.update_monotonic(&id, |r| {
                        let state = r.leg_mut(leg);
                        state.nonce = None;
                        state.submitted_at = None;
                        Ok(())
                    })?;
                }
                self.db
                    .log_audit(Some(&id), "submit_rejected", &format!("{}: {}", leg, message))?;
                Err(BridgeError::ChainSubmit { leg, message })
            }
            Err(SubmitError::Irrecoverable(message)) => {
                error!("Transfer {} {} rejected irrecoverably: {}", id, leg, message);
                self.fail_locked(
                    &id,
                    FailureReason::Irrecoverable {
                        leg,
                        message: message.clone(),
                    },
                )?;
                Err(BridgeError::IrrecoverableChain { leg, message })
            }
            Err(SubmitError::Indeterminate(message)) => {
                warn!(
                    "Transfer {} {} submission outcome unknown, nonce {} kept for recovery: {}",
                    id, leg, nonce, message
                );
                self.db.log_audit(
                    Some(&id),
                    "submit_ambiguous",
                    &format!("{} nonce {}: {}", leg, nonce, message),
                )?;
                Err(BridgeError::ChainSubmit {
                    leg,
                    message: format!("outcome unknown: {}", message),
                })
            }
        }
    }

    /// Store a leg's hash and move to its pending status.
    fn record_broadcast(
        &self,
        id: &Uuid,
        leg: Leg,
        tx_hash: String,
    ) -> Result<TransferRecord, BridgeError> {
        let now = Utc::now();
        let record = self.db.update_monotonic(id, |r| {
            r.leg_mut(leg).tx_hash = Some(tx_hash.clone());
            r.status = TransferStatus::pending_for(leg);
            r.last_progress_at = now;
            r.degraded = false;
            Ok(())
        })?;

        info!("Transfer {} {} broadcast: {}", id, leg, tx_hash);
        self.db.log_audit(
            Some(id),
            "broadcast",
            &format!(
                "{} {} nonce {}",
                leg,
                tx_hash,
                record.leg(leg).nonce.unwrap_or_default()
            ),
        )?;
        self.observer.publish(&record);
        self.watch(&record);
        Ok(record)
    }

    async fn recover_locked(
        &self,
        record: &TransferRecord,
        leg: Leg,
        now: DateTime<Utc>,
    ) -> Result<SubmissionOutcome, BridgeError> {
        let state = record.leg(leg);
        let Some(nonce) = state.nonce else {
            return Ok(SubmissionOutcome::NotNeeded);
        };
        let chain = record.direction.chain_for(leg);
        let adapter = self.adapters.get(chain)?.clone();
        let sender = self.sender_for(record, leg);

        if let Some(tx_hash) = self
            .query(chain, adapter.find_transaction(&sender, nonce))
            .await?
        {
            info!(
                "Transfer {} adopting {} {} found for nonce {}",
                record.id, leg, tx_hash, nonce
            );
            self.db.log_audit(
                Some(&record.id),
                "adopted",
                &format!("{} {} nonce {}", leg, tx_hash, nonce),
            )?;
            self.record_broadcast(&record.id, leg, tx_hash)?;
            return Ok(SubmissionOutcome::Adopted);
        }

        let attempted_at = state.submitted_at.unwrap_or(record.created_at);
        if now - attempted_at < self.config.bridge.submission_grace() {
            debug!(
                "Transfer {} {} nonce {} not found yet, deferring",
                record.id, leg, nonce
            );
            return Ok(SubmissionOutcome::Deferred);
        }

        info!(
            "Transfer {} {} nonce {} not found after grace period, resubmitting",
            record.id, leg, nonce
        );
        self.submit_leg_locked(record, leg, Some(nonce), now).await?;
        Ok(SubmissionOutcome::Submitted)
    }

    fn fail_locked(&self, id: &Uuid, reason: FailureReason) -> Result<TransferRecord, BridgeError> {
        let record = self.db.update_monotonic(id, |r| {
            r.status = TransferStatus::Failed;
            r.failure_reason = Some(reason.clone());
            Ok(())
        })?;
        warn!("Transfer {} failed: {}", id, reason);
        self.db
            .log_audit(Some(id), "failed", &reason.to_string())?;
        self.observer.publish(&record);
        self.forget(id);
        Ok(record)
    }

    /// Account that signs the leg's transaction.
    fn sender_for(&self, record: &TransferRecord, leg: Leg) -> String {
        match leg {
            Leg::Deposit => record.sender.clone(),
            Leg::Relay => self.config.relay.custody_address.clone(),
            Leg::Withdraw => self
                .config
                .chain(record.direction.dest_chain())
                .operator_address
                .clone(),
        }
    }

    fn build_transaction(
        &self,
        record: &TransferRecord,
        leg: Leg,
        sender: &str,
        nonce: u64,
    ) -> LegTransaction {
        let chain = record.direction.chain_for(leg);
        let chain_config = self.config.chain(chain);
        let (to, amount, fee, fee_recipient) = match leg {
            Leg::Deposit => (
                self.config.relay.custody_address.clone(),
                record.amount,
                0,
                None,
            ),
            Leg::Relay => (
                record.recipient.clone(),
                record.net_amount(),
                record.fee,
                Some(self.config.relay.fee_address.clone()),
            ),
            Leg::Withdraw => (record.recipient.clone(), record.net_amount(), 0, None),
        };

        LegTransaction {
            transfer_id: record.id,
            leg,
            chain,
            asset: record.asset.clone(),
            amount,
            from: sender.to_string(),
            to,
            nonce,
            fee,
            fee_recipient,
            gas_price: chain_config.gas_price,
            gas_limit: chain_config.gas_limit,
            memo: record.id.to_string(),
        }
    }
}
