// Copyright (c) 2024 The Botho Foundation

//! Resume manager: picks up incomplete transfers after a restart.
//!
//! The same sweep runs periodically to expire stalled transfers and to retry
//! legs whose submission was rejected or left ambiguous.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use hub_bridge_core::{BridgeError, TransferRecord};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::coordinator::{SubmissionOutcome, TransferCoordinator};

/// Transfers handled concurrently by one sweep.
const SWEEP_CONCURRENCY: usize = 16;

/// What a sweep did, per outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeReport {
    pub scanned: usize,
    pub expired: usize,
    /// Pending legs handed back to the poller
    pub watched: usize,
    pub adopted: usize,
    pub submitted: usize,
    pub deferred: usize,
    pub awaiting_user: usize,
    pub skipped: usize,
    pub errors: usize,
}

enum Resumed {
    Expired,
    Watched,
    Submission(SubmissionOutcome),
}

impl ResumeReport {
    fn record(&mut self, result: Result<Resumed, BridgeError>) {
        match result {
            Ok(Resumed::Expired) => self.expired += 1,
            Ok(Resumed::Watched) => self.watched += 1,
            Ok(Resumed::Submission(outcome)) => match outcome {
                SubmissionOutcome::Adopted => self.adopted += 1,
                SubmissionOutcome::Submitted => self.submitted += 1,
                SubmissionOutcome::Deferred => self.deferred += 1,
                SubmissionOutcome::AwaitingUser => self.awaiting_user += 1,
                SubmissionOutcome::NotNeeded => self.skipped += 1,
            },
            Err(_) => self.errors += 1,
        }
    }
}

pub struct ResumeManager {
    coordinator: Arc<TransferCoordinator>,
}

impl ResumeManager {
    pub fn new(coordinator: Arc<TransferCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Sweep all incomplete transfers now.
    pub async fn resume(&self) -> Result<ResumeReport, BridgeError> {
        let report = self.sweep(Utc::now()).await?;
        if report.scanned > 0 {
            info!(
                "Resume sweep: {} scanned, {} expired, {} watched, {} adopted, {} submitted, {} deferred, {} awaiting user, {} errors",
                report.scanned,
                report.expired,
                report.watched,
                report.adopted,
                report.submitted,
                report.deferred,
                report.awaiting_user,
                report.errors
            );
        } else {
            debug!("Resume sweep: nothing to do");
        }
        Ok(report)
    }

    /// Sweep as of `now`.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<ResumeReport, BridgeError> {
        let records = self.coordinator.db().list_non_terminal()?;
        let mut report = ResumeReport {
            scanned: records.len(),
            ..Default::default()
        };

        let results: Vec<_> = stream::iter(records)
            .map(|record| self.resume_one(record, now))
            .buffer_unordered(SWEEP_CONCURRENCY)
            .collect()
            .await;

        for result in results {
            report.record(result);
        }
        Ok(report)
    }

    async fn resume_one(
        &self,
        record: TransferRecord,
        now: DateTime<Utc>,
    ) -> Result<Resumed, BridgeError> {
        let id = record.id;
        let result = self.resume_record(record, now).await;
        if let Err(e) = &result {
            warn!("Failed to resume transfer {}: {}", id, e);
        }
        result
    }

    async fn resume_record(
        &self,
        record: TransferRecord,
        now: DateTime<Utc>,
    ) -> Result<Resumed, BridgeError> {
        if self.coordinator.expire_if_stale(record.id, now).await?.is_some() {
            return Ok(Resumed::Expired);
        }

        if self.coordinator.watch(&record) {
            return Ok(Resumed::Watched);
        }

        let outcome = self.coordinator.resume_submission(record.id, now).await?;
        Ok(Resumed::Submission(outcome))
    }
}
