//! Change workflow engine
//!
//! Each operation loads the change by replaying its events, checks the
//! actor's permission and the transition, then appends exactly one audit
//! event. Nothing is appended when a check fails.
//!
//! The append is conditional on the tenant chain tail seen before the load.
//! A writer that lost the race (another engine, another process on the same
//! database) reloads and re-checks, so a transition is never recorded twice.

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, Metadata, NewAuditEvent, TenantId};
use crate::error::{AuditError, Result};
use crate::export::ExportAdapter;
use crate::store::{EventFilter, TenantScope};
use crate::workflow::{
    change_number, Actor, Approval, ApprovalRequirement, ApprovalRouter, ChangeDraft,
    ChangeRequest, ChangeStatus, ComplianceVerifier, ImpactClassifier, Permission,
    PostImplementationReport, RolePermissions, RollbackDetector, RollbackSignals,
    RollbackTrigger, APPROVAL_RECORDED,
};

pub struct ChangeWorkflow {
    scope: TenantScope,
    permissions: Arc<RolePermissions>,
    classifier: ImpactClassifier,
    router: ApprovalRouter,
    detector: RollbackDetector,
    verifier: ComplianceVerifier,
    exporter: Option<Arc<dyn ExportAdapter>>,
    offline: bool,
    change_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

/// Conditional appends tried before the conflict is returned to the caller
const MAX_APPEND_ATTEMPTS: usize = 5;

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// A transition planned against a freshly loaded change
struct Step {
    event_type: String,
    action: &'static str,
    metadata: Metadata,
}

impl Step {
    fn new(event_type: impl Into<String>, action: &'static str, metadata: Metadata) -> Self {
        Self {
            event_type: event_type.into(),
            action,
            metadata,
        }
    }
}

enum Outcome {
    Recorded(ChangeRequest),
    Unchanged(ChangeRequest),
}

impl Outcome {
    fn into_change(self) -> ChangeRequest {
        match self {
            Outcome::Recorded(change) | Outcome::Unchanged(change) => change,
        }
    }
}

impl ChangeWorkflow {
    pub fn new(scope: TenantScope) -> Self {
        Self {
            scope,
            permissions: Arc::new(RolePermissions::default()),
            classifier: ImpactClassifier::default(),
            router: ApprovalRouter::default(),
            detector: RollbackDetector::default(),
            verifier: ComplianceVerifier::default(),
            exporter: None,
            offline: false,
            change_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_permissions(mut self, permissions: Arc<RolePermissions>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_classifier(mut self, classifier: ImpactClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_router(mut self, router: ApprovalRouter) -> Self {
        self.router = router;
        self
    }

    pub fn with_detector(mut self, detector: RollbackDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_verifier(mut self, verifier: ComplianceVerifier) -> Self {
        self.verifier = verifier;
        self
    }

    /// Forward the history of finished changes to `exporter`, unless offline
    pub fn with_exporter(mut self, exporter: Option<Arc<dyn ExportAdapter>>, offline: bool) -> Self {
        self.exporter = exporter;
        self.offline = offline;
        self
    }

    pub fn tenant(&self) -> &TenantId {
        self.scope.tenant()
    }

    fn change_lock(&self, correlation_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .change_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(correlation_id).or_default().clone()
    }

    fn release_lock(&self, correlation_id: Uuid) {
        self.change_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&correlation_id);
    }

    /// Every audit event recorded for a change, oldest first
    pub async fn history(&self, correlation_id: Uuid) -> Result<Vec<AuditEvent>> {
        self.scope
            .collect(EventFilter::default().correlation(correlation_id))
            .await
    }

    pub async fn load(&self, correlation_id: Uuid) -> Result<ChangeRequest> {
        let events = self.history(correlation_id).await?;
        if events.is_empty() {
            return Err(AuditError::ChangeNotFound(correlation_id.to_string()));
        }
        ChangeRequest::replay(&events)
    }

    /// Load the change, let `plan` decide the next step, and append it if
    /// the chain has not moved in between. `plan` returning `None` records
    /// nothing.
    async fn apply_step<F>(&self, actor: &Actor, correlation_id: Uuid, mut plan: F) -> Result<Outcome>
    where
        F: FnMut(&ChangeRequest) -> Result<Option<Step>> + Send,
    {
        let lock = self.change_lock(correlation_id);
        let _guard = lock.lock().await;

        let mut attempt = 1;
        loop {
            // Read the tail before the history: anything appended after this
            // point makes the conditional append fail.
            let expected = self.scope.tail().await?.map(|tail| tail.current_hash);
            let change = self.load(correlation_id).await?;
            if change.status.is_terminal() {
                self.release_lock(correlation_id);
            }

            let Some(step) = plan(&change)? else {
                return Ok(Outcome::Unchanged(change));
            };

            match self.record(&change, actor, step, expected).await {
                Ok(next) => {
                    if next.status.is_terminal() {
                        self.release_lock(correlation_id);
                    }
                    return Ok(Outcome::Recorded(next));
                }
                Err(AuditError::OutOfOrder { .. }) if attempt < MAX_APPEND_ATTEMPTS => {
                    debug!(change = %change.id, attempt, "Audit chain moved during transition; reloading");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Append one transition and fold it into `change`.
    ///
    /// Terminal transitions carry a snapshot of the finished change.
    async fn record(
        &self,
        change: &ChangeRequest,
        actor: &Actor,
        step: Step,
        expected_tail: Option<String>,
    ) -> Result<ChangeRequest> {
        let Step {
            event_type,
            action,
            mut metadata,
        } = step;
        let at = Utc::now().trunc_subsecs(6);
        metadata.insert("role".to_string(), Value::from(actor.role.name()));
        metadata.insert("from".to_string(), Value::from(change.status.name()));

        let mut next = change.clone();
        next.apply(&event_type, &metadata, at)?;
        metadata.insert("to".to_string(), Value::from(next.status.name()));
        if next.status.is_terminal() {
            metadata.insert("snapshot".to_string(), to_value(&next)?);
        }

        let mut event = NewAuditEvent::new(event_type, &actor.user_id, &change.id, action)
            .at(at)
            .correlated(change.correlation_id);
        event.metadata = metadata;
        if let Some(expected) = expected_tail {
            event = event.expecting_previous(expected);
        }
        let stored = self.scope.append(event).await?;

        info!(
            change = %next.id,
            from = %change.status,
            to = %next.status,
            actor = %actor.user_id,
            event_id = stored.id,
            "Change transition recorded"
        );

        if next.status.is_terminal() {
            self.forward_terminal(&next).await;
        }
        Ok(next)
    }

    async fn forward_terminal(&self, change: &ChangeRequest) {
        let Some(exporter) = &self.exporter else {
            return;
        };
        if self.offline {
            debug!(change = %change.id, "Offline; terminal change not forwarded");
            return;
        }

        let result = match self.history(change.correlation_id).await {
            Ok(events) => exporter.export_batch(&events).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(change = %change.id, error = %e, "Failed to forward finished change");
        }
    }

    pub async fn submit(&self, actor: &Actor, draft: ChangeDraft) -> Result<ChangeRequest> {
        self.permissions.check(actor, Permission::SubmitChange)?;
        if draft.title.trim().is_empty() {
            return Err(AuditError::invalid_event("change title must not be blank"));
        }

        let correlation_id = Uuid::new_v4();
        let at = Utc::now().trunc_subsecs(6);
        let mut metadata = Metadata::new();
        metadata.insert("draft".to_string(), to_value(&draft)?);
        metadata.insert("role".to_string(), Value::from(actor.role.name()));
        metadata.insert("to".to_string(), Value::from(ChangeStatus::Requested.name()));

        let mut event = NewAuditEvent::new(
            ChangeStatus::Requested.event_type(),
            &actor.user_id,
            change_number(&correlation_id),
            "submit",
        )
        .at(at)
        .correlated(correlation_id);
        event.metadata = metadata;

        let stored = self.scope.append(event).await?;
        let change = ChangeRequest::replay(std::slice::from_ref(&stored))?;
        info!(change = %change.id, requested_by = %actor.user_id, "Change submitted");
        Ok(change)
    }

    pub async fn assess(&self, actor: &Actor, correlation_id: Uuid) -> Result<ChangeRequest> {
        self.permissions.check(actor, Permission::AssessImpact)?;

        let assessed = self
            .apply_step(actor, correlation_id, |change| {
                change.status.ensure_transition(ChangeStatus::ImpactAssessed)?;
                let assessment = self.classifier.assess(change);
                let mut metadata = Metadata::new();
                metadata.insert("assessment".to_string(), to_value(&assessment)?);
                Ok(Some(Step::new(ChangeStatus::ImpactAssessed.event_type(), "assess", metadata)))
            })
            .await?
            .into_change();

        if self.router.requirement_for(&assessed) != ApprovalRequirement::Automatic {
            return Ok(assessed);
        }

        // Standard changes are approved by the workflow itself.
        let system = Actor::system();
        self.permissions.check(&system, Permission::ApproveChange)?;
        let outcome = self
            .apply_step(&system, correlation_id, |change| {
                if change.status != ChangeStatus::ImpactAssessed {
                    return Ok(None);
                }
                let approval = Approval {
                    approver: system.user_id.clone(),
                    role: system.role,
                    decided_at: Utc::now().trunc_subsecs(6),
                    comment: Some("standard change auto-approved".to_string()),
                };
                let mut metadata = Metadata::new();
                metadata.insert("approval".to_string(), to_value(&approval)?);
                Ok(Some(Step::new(ChangeStatus::Approved.event_type(), "approve", metadata)))
            })
            .await?;
        Ok(outcome.into_change())
    }

    /// Record an approval. CAB changes stay assessed until the quorum is met.
    pub async fn approve(
        &self,
        actor: &Actor,
        correlation_id: Uuid,
        comment: Option<String>,
    ) -> Result<ChangeRequest> {
        self.permissions.check(actor, Permission::ApproveChange)?;

        let next = self
            .apply_step(actor, correlation_id, |change| {
                change.status.ensure_transition(ChangeStatus::Approved)?;
                self.router.authorize_approver(change, actor)?;

                let approval = Approval {
                    approver: actor.user_id.clone(),
                    role: actor.role,
                    decided_at: Utc::now().trunc_subsecs(6),
                    comment: comment.clone(),
                };
                let requirement = self.router.requirement_for(change);
                let mut approvals = change.approvals.clone();
                approvals.push(approval.clone());

                let mut metadata = Metadata::new();
                metadata.insert("approval".to_string(), to_value(&approval)?);

                if self.router.is_satisfied(requirement, &approvals) {
                    Ok(Some(Step::new(ChangeStatus::Approved.event_type(), "approve", metadata)))
                } else {
                    let remaining = self.router.remaining(requirement, &approvals);
                    metadata.insert("remaining".to_string(), Value::from(remaining));
                    Ok(Some(Step::new(APPROVAL_RECORDED, "approve", metadata)))
                }
            })
            .await?
            .into_change();

        if next.status != ChangeStatus::Approved {
            info!(change = %next.id, approvals = next.approvals.len(), "Approval recorded; quorum not yet met");
        }
        Ok(next)
    }

    pub async fn reject(&self, actor: &Actor, correlation_id: Uuid, reason: &str) -> Result<ChangeRequest> {
        self.permissions.check(actor, Permission::RejectChange)?;

        self.apply_step(actor, correlation_id, |change| {
            change.status.ensure_transition(ChangeStatus::Rejected)?;
            let mut metadata = Metadata::new();
            metadata.insert("reason".to_string(), Value::from(reason));
            Ok(Some(Step::new(ChangeStatus::Rejected.event_type(), "reject", metadata)))
        })
        .await
        .map(Outcome::into_change)
    }

    pub async fn start_implementation(&self, actor: &Actor, correlation_id: Uuid) -> Result<ChangeRequest> {
        self.permissions.check(actor, Permission::ImplementChange)?;

        self.apply_step(actor, correlation_id, |change| {
            change.status.ensure_transition(ChangeStatus::Implementing)?;
            Ok(Some(Step::new(
                ChangeStatus::Implementing.event_type(),
                "implement",
                Metadata::new(),
            )))
        })
        .await
        .map(Outcome::into_change)
    }

    /// Verified when the report passes, otherwise rolled back on the
    /// trigger the verifier reports.
    pub async fn complete_verification(
        &self,
        actor: &Actor,
        correlation_id: Uuid,
        report: &PostImplementationReport,
    ) -> Result<ChangeRequest> {
        self.permissions.check(actor, Permission::VerifyChange)?;

        self.apply_step(actor, correlation_id, |change| {
            change.status.ensure_transition(ChangeStatus::Verified)?;

            let outcome = self.verifier.verify(change, report);
            let mut metadata = Metadata::new();
            metadata.insert("verification".to_string(), to_value(&outcome)?);

            match outcome.trigger {
                None => Ok(Some(Step::new(ChangeStatus::Verified.event_type(), "verify", metadata))),
                Some(trigger) => {
                    warn!(change = %change.id, %trigger, failures = ?outcome.failures, "Verification failed");
                    metadata.insert("trigger".to_string(), to_value(&trigger)?);
                    Ok(Some(Step::new(ChangeStatus::RolledBack.event_type(), "rollback", metadata)))
                }
            }
        })
        .await
        .map(Outcome::into_change)
    }

    pub async fn review(&self, actor: &Actor, correlation_id: Uuid, notes: Option<String>) -> Result<ChangeRequest> {
        self.permissions.check(actor, Permission::ReviewChange)?;

        self.apply_step(actor, correlation_id, |change| {
            change.status.ensure_transition(ChangeStatus::Reviewed)?;
            let mut metadata = Metadata::new();
            if let Some(notes) = &notes {
                metadata.insert("notes".to_string(), Value::from(notes.as_str()));
            }
            Ok(Some(Step::new(ChangeStatus::Reviewed.event_type(), "review", metadata)))
        })
        .await
        .map(Outcome::into_change)
    }

    pub async fn rollback(
        &self,
        actor: &Actor,
        correlation_id: Uuid,
        trigger: RollbackTrigger,
        detail: Option<String>,
    ) -> Result<ChangeRequest> {
        self.permissions.check(actor, Permission::RollbackChange)?;

        self.apply_step(actor, correlation_id, |change| {
            Self::plan_rollback(change, trigger, detail.clone()).map(Some)
        })
        .await
        .map(Outcome::into_change)
    }

    fn plan_rollback(change: &ChangeRequest, trigger: RollbackTrigger, detail: Option<String>) -> Result<Step> {
        change.status.ensure_transition(ChangeStatus::RolledBack)?;
        if !change.is_armed(trigger) {
            return Err(AuditError::TriggerNotArmed(trigger.to_string()));
        }

        let mut metadata = Metadata::new();
        metadata.insert("trigger".to_string(), to_value(&trigger)?);
        if let Some(detail) = detail {
            metadata.insert("detail".to_string(), Value::from(detail));
        }
        Ok(Step::new(ChangeStatus::RolledBack.event_type(), "rollback", metadata))
    }

    /// Roll back if the signals fire an armed trigger.
    ///
    /// Returns `None` when nothing fired or the change is not live.
    pub async fn evaluate_signals(
        &self,
        actor: &Actor,
        correlation_id: Uuid,
        signals: &RollbackSignals,
        now: DateTime<Utc>,
    ) -> Result<Option<ChangeRequest>> {
        self.permissions.check(actor, Permission::RollbackChange)?;

        let outcome = self
            .apply_step(actor, correlation_id, |change| {
                if !change.status.can_transition_to(ChangeStatus::RolledBack) {
                    return Ok(None);
                }
                let Some(trigger) = self.detector.detect(change, signals, now) else {
                    return Ok(None);
                };

                let detail = format!(
                    "error_rate={:.4} latency_p99_ms={} violations={}",
                    signals.error_rate,
                    signals.latency_p99_ms,
                    signals.compliance_violations.join(",")
                );
                Self::plan_rollback(change, trigger, Some(detail)).map(Some)
            })
            .await?;

        Ok(match outcome {
            Outcome::Recorded(change) => Some(change),
            Outcome::Unchanged(_) => None,
        })
    }
}
