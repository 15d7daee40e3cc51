//! Pending-intent reconciler
//!
//! An intent can be left `pending` when the process dies (or the record store
//! fails) between posting its transfer and committing the status flip. The
//! reconciler periodically closes such rows by asking the ledger what happened:
//!
//! ```text
//! transfer found, same movement  -> completed (plus refund follow-ups)
//! transfer found, different one  -> inconsistency, reported to the operator
//! no transfer, older than
//!   threshold + grace            -> failed (not_posted)
//! no transfer, younger           -> left alone, the request may still be running
//! ```

use crate::core::coordinator::stage_completion;
use crate::core::ledger::LedgerAdapter;
use crate::core::traits::{Clock, RecordStore};
use crate::types::{EngineError, FailureReason, Intent, RecordId, Transfer};
use chrono::Duration;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Reconciler timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Time between passes
    pub interval: std::time::Duration,
    /// Minimum age of a pending row before it is examined
    pub threshold: Duration,
    /// Extra age, beyond `threshold`, before a row with no transfer is failed
    pub grace: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: std::time::Duration::from_secs(10),
            threshold: Duration::seconds(30),
            grace: Duration::seconds(30),
        }
    }
}

/// A pending row whose tag matches a ledger transfer with a different movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Inconsistency {
    pub record_id: RecordId,
    pub entity: &'static str,
    pub expected: String,
    pub found: Transfer,
}

/// Log target for inconsistencies an operator has to resolve by hand.
pub const OPERATOR_TARGET: &str = "coin_rewards::operator";

/// Drain `alerts` into the operator log until every sender is gone.
///
/// The task resolves to the number of alerts it forwarded.
pub fn spawn_alert_sink(mut alerts: mpsc::Receiver<Inconsistency>) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut forwarded = 0;
        while let Some(alert) = alerts.recv().await {
            error!(
                target: OPERATOR_TARGET,
                record_id = %alert.record_id,
                entity = alert.entity,
                expected = %alert.expected,
                found_transfer = %alert.found.id,
                found_amount = %alert.found.amount,
                found_op = %alert.found.op,
                "manual reconciliation required"
            );
            forwarded += 1;
        }
        forwarded
    })
}

/// Counts of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub scanned: usize,
    pub completed: usize,
    pub failed: usize,
    pub waiting: usize,
    pub inconsistent: usize,
    pub errors: usize,
}

enum Resolution {
    Completed,
    Failed,
    Waiting,
    Inconsistent,
}

pub struct Reconciler {
    ledger: LedgerAdapter,
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
    alerts: Option<mpsc::Sender<Inconsistency>>,
}

impl Reconciler {
    pub fn new(
        ledger: LedgerAdapter,
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            ledger,
            store,
            clock,
            config,
            alerts: None,
        }
    }

    /// Send every detected inconsistency to `alerts` as well as to the log.
    pub fn with_alerts(mut self, alerts: mpsc::Sender<Inconsistency>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn config(&self) -> ReconcilerConfig {
        self.config
    }

    /// Examine every pending row older than the threshold once.
    ///
    /// A failure on one row is logged and counted; the pass continues with the
    /// next row. Only a failure to list the rows aborts the pass.
    pub async fn run_once(&self) -> Result<ReconcileReport, EngineError> {
        let now = self.clock.now();
        let pending = self
            .store
            .list_pending_before(now - self.config.threshold)
            .await?;

        let mut report = ReconcileReport {
            scanned: pending.len(),
            ..Default::default()
        };
        for intent in pending {
            match self.resolve(&intent).await {
                Ok(Resolution::Completed) => report.completed += 1,
                Ok(Resolution::Failed) => report.failed += 1,
                Ok(Resolution::Waiting) => report.waiting += 1,
                Ok(Resolution::Inconsistent) => report.inconsistent += 1,
                Err(e) => {
                    warn!(record_id = %intent.id(), error = %e, "could not reconcile intent");
                    report.errors += 1;
                }
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                completed = report.completed,
                failed = report.failed,
                waiting = report.waiting,
                inconsistent = report.inconsistent,
                errors = report.errors,
                "reconciliation pass"
            );
        }
        Ok(report)
    }

    async fn resolve(&self, intent: &Intent) -> Result<Resolution, EngineError> {
        let spec = intent.transfer_spec();
        let posted = self.ledger.find_transfer_for(intent.id()).await?;

        match posted {
            Some(transfer) if transfer.id == intent.transfer_id() && transfer.matches(&spec) => {
                let mut scope = self.store.begin().await?;
                stage_completion(scope.as_mut(), intent).await?;
                scope.commit().await?;
                info!(record_id = %intent.id(), transfer_id = %transfer.id, "pending intent completed from ledger");
                Ok(Resolution::Completed)
            }
            Some(transfer) => {
                error!(
                    record_id = %intent.id(),
                    entity = intent.entity(),
                    transfer_id = %transfer.id,
                    expected_amount = %spec.amount,
                    found_amount = %transfer.amount,
                    "ledger transfer does not match its intent"
                );
                if let Some(alerts) = &self.alerts {
                    let alert = Inconsistency {
                        record_id: intent.id(),
                        entity: intent.entity(),
                        expected: format!("{} -> {} {} ({})", spec.debit, spec.credit, spec.amount, spec.op),
                        found: transfer,
                    };
                    if alerts.try_send(alert).is_err() {
                        warn!(record_id = %intent.id(), "operator alert channel unavailable");
                    }
                }
                Ok(Resolution::Inconsistent)
            }
            None if self.clock.now() - intent.created_at() >= self.config.threshold + self.config.grace => {
                let mut scope = self.store.begin().await?;
                scope.mark_failed(intent.id(), FailureReason::NotPosted).await?;
                scope.commit().await?;
                info!(record_id = %intent.id(), "pending intent never reached the ledger, marked failed");
                Ok(Resolution::Failed)
            }
            None => {
                debug!(record_id = %intent.id(), "pending intent not yet on the ledger");
                Ok(Resolution::Waiting)
            }
        }
    }

    /// Run a pass every `interval` until `shutdown` is cancelled.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(self.config.interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("reconciler received shutdown signal");
                        break;
                    }
                    _ = timer.tick() => {
                        if let Err(e) = self.run_once().await {
                            error!(error = %e, "reconciliation pass failed");
                        }
                    }
                }
            }
        })
    }
}
