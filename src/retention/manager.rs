//! Retention sweeps
//!
//! A sweep walks expired events one page of `batch_size` at a time, exports
//! each page as a batch, records the outcome, then prunes the exported
//! prefix of the chain. Exports happen outside any store lock; marking and
//! pruning are separate, short critical sections inside the store.

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEvent, ExportState, TenantId};
use crate::error::{AuditError, Result};
use crate::export::ExportAdapter;
use crate::retention::{RetentionClass, RetentionPolicy, RetentionTier};
use crate::store::{AuditEventStore, EventFilter};

/// Outcome of one sweep over one tenant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Events exported and acknowledged during this sweep
    pub migrated: usize,
    /// Events physically deleted during this sweep
    pub expired: usize,
    /// Events left waiting for the sink to come back
    pub pending: usize,
    /// Events the sink rejected, now awaiting manual review
    pub flagged: usize,
}

impl SweepReport {
    fn absorb(&mut self, other: SweepReport) {
        self.migrated += other.migrated;
        self.expired += other.expired;
        self.pending += other.pending;
        self.flagged += other.flagged;
    }
}

/// Event counts per derived tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierSummary {
    pub hot: usize,
    pub warm: usize,
    pub cold: usize,
    pub expired: usize,
}

pub struct RetentionManager {
    store: Arc<dyn AuditEventStore>,
    adapter: Option<Arc<dyn ExportAdapter>>,
    policy: RetentionPolicy,
    batch_size: usize,
    offline: bool,
}

impl RetentionManager {
    pub fn new(
        store: Arc<dyn AuditEventStore>,
        adapter: Option<Arc<dyn ExportAdapter>>,
        policy: RetentionPolicy,
    ) -> Self {
        Self {
            store,
            adapter,
            policy,
            batch_size: 500,
            offline: false,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    pub fn classify(&self, event: &AuditEvent, now: DateTime<Utc>) -> RetentionTier {
        self.policy.classify(event, now)
    }

    pub async fn sweep(&self, tenant: &TenantId, now: DateTime<Utc>) -> Result<SweepReport> {
        self.sweep_until_cancelled(tenant, now, &CancellationToken::new())
            .await
    }

    /// Sweep one tenant, stopping between batches once `cancel` fires.
    ///
    /// A cancelled sweep never prunes; events it already marked stay marked.
    pub async fn sweep_until_cancelled(
        &self,
        tenant: &TenantId,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<SweepReport> {
        let cutoff = self.policy.expiry_cutoff(now);
        let adapter = match (&self.adapter, self.offline) {
            (Some(adapter), false) => Some(adapter),
            _ => None,
        };

        let mut report = SweepReport::default();
        // Once the sink is unavailable the rest of the sweep only parks events.
        let mut parked = adapter.is_none();
        let mut after_id = 0;

        loop {
            if cancel.is_cancelled() {
                info!(%tenant, after_id, "Retention sweep cancelled between batches");
                return Ok(report);
            }

            let page = self
                .store
                .retention_candidates(tenant, cutoff, after_id, self.batch_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after_id = last.event.id;
            let exhausted = page.len() < self.batch_size;

            let batch: Vec<AuditEvent> = page
                .into_iter()
                .filter(|record| {
                    matches!(
                        record.export_state,
                        ExportState::Retained | ExportState::ExportPending
                    )
                })
                .map(|record| record.event)
                .collect();
            if batch.is_empty() {
                if exhausted {
                    break;
                }
                continue;
            }
            let ids: Vec<i64> = batch.iter().map(|e| e.id).collect();

            match adapter {
                Some(adapter) if !parked => match adapter.export_batch(&batch).await {
                    Ok(receipt) => {
                        let state = ExportState::Exported {
                            receipt_id: receipt.receipt_id.clone(),
                        };
                        self.store.mark_export_state(tenant, &ids, state).await?;
                        report.migrated += ids.len();
                        debug!(%tenant, receipt_id = %receipt.receipt_id, count = ids.len(), "Batch exported");
                    }
                    Err(AuditError::ExportRejected(reason)) => {
                        warn!(%tenant, first_id = ids[0], %reason, "Export sink rejected batch");
                        let state = ExportState::ManualReview { reason };
                        self.store.mark_export_state(tenant, &ids, state).await?;
                        report.flagged += ids.len();
                    }
                    Err(e) => {
                        warn!(%tenant, first_id = ids[0], error = %e, "Export sink unavailable");
                        self.store
                            .mark_export_state(tenant, &ids, ExportState::ExportPending)
                            .await?;
                        report.pending += ids.len();
                        parked = true;
                    }
                },
                _ => {
                    self.store
                        .mark_export_state(tenant, &ids, ExportState::ExportPending)
                        .await?;
                    report.pending += ids.len();
                }
            }

            if exhausted {
                break;
            }
        }

        if adapter.is_none() {
            if report.pending > 0 {
                warn!(
                    %tenant,
                    pending = report.pending,
                    "No export sink available; expired events kept"
                );
            }
            return Ok(report);
        }

        if cancel.is_cancelled() {
            return Ok(report);
        }

        report.expired = self.store.prune_exported(tenant, cutoff).await?;
        info!(
            %tenant,
            migrated = report.migrated,
            expired = report.expired,
            pending = report.pending,
            flagged = report.flagged,
            "Retention sweep complete"
        );
        Ok(report)
    }

    /// Sweep every tenant the store knows about
    pub async fn sweep_all(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> Result<SweepReport> {
        let mut total = SweepReport::default();
        for tenant in self.store.tenants().await? {
            if cancel.is_cancelled() {
                break;
            }
            match self.sweep_until_cancelled(&tenant, now, cancel).await {
                Ok(report) => total.absorb(report),
                Err(e) => error!(%tenant, error = %e, "Retention sweep failed"),
            }
        }
        Ok(total)
    }

    pub async fn tier_summary(&self, tenant: &TenantId, now: DateTime<Utc>) -> Result<TierSummary> {
        let mut summary = TierSummary::default();
        let mut events = self.store.query(EventFilter::for_tenant(tenant.clone()));
        while let Some(event) = events.try_next().await? {
            match self.policy.classify_event(&event, now) {
                RetentionClass::Tier(RetentionTier::Hot) => summary.hot += 1,
                RetentionClass::Tier(RetentionTier::Warm) => summary.warm += 1,
                RetentionClass::Tier(RetentionTier::Cold) => summary.cold += 1,
                RetentionClass::Expired => summary.expired += 1,
            }
        }
        Ok(summary)
    }

    /// Sweep on a fixed interval until `cancel` fires.
    ///
    /// `tenants` restricts the sweep; `None` sweeps every known tenant.
    pub async fn run_periodic(
        self: Arc<Self>,
        tenants: Option<Vec<TenantId>>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("Retention sweeper started (interval {:?})", interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Retention sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let now = Utc::now();
                    let result = match &tenants {
                        Some(tenants) => {
                            let mut total = SweepReport::default();
                            for tenant in tenants {
                                match self.sweep_until_cancelled(tenant, now, &cancel).await {
                                    Ok(report) => total.absorb(report),
                                    Err(e) => error!(%tenant, error = %e, "Retention sweep failed"),
                                }
                            }
                            Ok(total)
                        }
                        None => self.sweep_all(now, &cancel).await,
                    };
                    match result {
                        Ok(total) => debug!(?total, "Periodic retention sweep finished"),
                        Err(e) => error!("Periodic retention sweep failed: {}", e),
                    }
                }
            }
        }
    }
}
