//! Change management workflow
//!
//! A change moves through eight states:
//!
//! ```text
//! Requested -> ImpactAssessed -> Approved -> Implementing -> Verified -> Reviewed
//!                    |                            |             |
//!                    v                            +------+------+
//!                 Rejected                               v
//!                                                    RolledBack
//! ```
//!
//! Every transition is one audit event sharing the change's correlation id.
//! The workflow keeps no state of its own: a [`ChangeRequest`] is rebuilt by
//! replaying those events in order.

pub mod approval;
pub mod classifier;
pub mod engine;
pub mod roles;
pub mod rollback;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::audit::{AuditEvent, Metadata, TenantId};
use crate::error::{AuditError, Result};

pub use approval::{ApprovalRequirement, ApprovalRouter};
pub use classifier::{ClassifierRules, ImpactAssessment, ImpactClassifier};
pub use engine::ChangeWorkflow;
pub use roles::{Actor, Permission, Role, RolePermissions};
pub use rollback::{
    ComplianceCheck, ComplianceOutcome, ComplianceVerifier, PostImplementationReport,
    RollbackDetector, RollbackSignals,
};

/// Event type of a CAB vote that does not yet complete the quorum
pub const APPROVAL_RECORDED: &str = "change.approval_recorded";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// Pre-approved, low-risk catalogue change
    Standard,
    Normal,
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Requested,
    ImpactAssessed,
    Approved,
    Implementing,
    Verified,
    Reviewed,
    RolledBack,
    Rejected,
}

impl ChangeStatus {
    pub const ALL: [ChangeStatus; 8] = [
        ChangeStatus::Requested,
        ChangeStatus::ImpactAssessed,
        ChangeStatus::Approved,
        ChangeStatus::Implementing,
        ChangeStatus::Verified,
        ChangeStatus::Reviewed,
        ChangeStatus::RolledBack,
        ChangeStatus::Rejected,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ChangeStatus::Requested => "requested",
            ChangeStatus::ImpactAssessed => "impact_assessed",
            ChangeStatus::Approved => "approved",
            ChangeStatus::Implementing => "implementing",
            ChangeStatus::Verified => "verified",
            ChangeStatus::Reviewed => "reviewed",
            ChangeStatus::RolledBack => "rolled_back",
            ChangeStatus::Rejected => "rejected",
        }
    }

    /// Audit event type recorded when a change enters this status
    pub fn event_type(&self) -> String {
        format!("change.{}", self.name())
    }

    pub fn from_event_type(event_type: &str) -> Option<Self> {
        let name = event_type.strip_prefix("change.")?;
        Self::ALL.into_iter().find(|status| status.name() == name)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChangeStatus::Reviewed | ChangeStatus::RolledBack | ChangeStatus::Rejected
        )
    }

    pub fn can_transition_to(&self, next: ChangeStatus) -> bool {
        use ChangeStatus::*;
        matches!(
            (self, next),
            (Requested, ImpactAssessed)
                | (ImpactAssessed, Approved)
                | (ImpactAssessed, Rejected)
                | (Approved, Implementing)
                | (Implementing, Verified)
                | (Implementing, RolledBack)
                | (Verified, Reviewed)
                | (Verified, RolledBack)
        )
    }

    /// Fail with `InvalidTransition` unless `next` is reachable from here
    pub fn ensure_transition(&self, next: ChangeStatus) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(AuditError::invalid_transition(*self, next))
        }
    }
}

impl fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackTrigger {
    VerificationFailure,
    ComplianceViolation,
    SlaBreach,
    ManualAbort,
    TimeoutExceeded,
}

impl RollbackTrigger {
    pub fn name(&self) -> &'static str {
        match self {
            RollbackTrigger::VerificationFailure => "verification_failure",
            RollbackTrigger::ComplianceViolation => "compliance_violation",
            RollbackTrigger::SlaBreach => "sla_breach",
            RollbackTrigger::ManualAbort => "manual_abort",
            RollbackTrigger::TimeoutExceeded => "timeout_exceeded",
        }
    }
}

impl fmt::Display for RollbackTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single approver's decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub approver: String,
    pub role: Role,
    pub decided_at: DateTime<Utc>,
    pub comment: Option<String>,
}

/// What the requester supplies when submitting a change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeDraft {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub affected_systems: Vec<String>,
    /// Requester's own view of the change type; the classifier may escalate it
    #[serde(default)]
    pub proposed_type: Option<ChangeType>,
}

impl ChangeDraft {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            affected_systems: Vec::new(),
            proposed_type: None,
        }
    }

    pub fn affecting(mut self, system: impl Into<String>) -> Self {
        self.affected_systems.push(system.into());
        self
    }

    pub fn proposed(mut self, change_type: ChangeType) -> Self {
        self.proposed_type = Some(change_type);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub id: String,
    pub correlation_id: Uuid,
    pub tenant: TenantId,
    pub title: String,
    pub description: String,
    pub requested_by: String,
    pub affected_systems: Vec<String>,
    pub change_type: ChangeType,
    pub risk_level: RiskLevel,
    pub status: ChangeStatus,
    pub approvals: Vec<Approval>,
    pub rollback_triggers: BTreeSet<RollbackTrigger>,
    pub rollback_reason: Option<RollbackTrigger>,
    pub implementation_window_minutes: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub implementation_started_at: Option<DateTime<Utc>>,
}

/// Human-facing change number derived from the correlation id
pub fn change_number(correlation_id: &Uuid) -> String {
    let simple = correlation_id.simple().to_string();
    format!("CHG-{}", simple[..8].to_uppercase())
}

fn payload<T: DeserializeOwned>(metadata: &Metadata, key: &str) -> Result<T> {
    let value = metadata
        .get(key)
        .ok_or_else(|| AuditError::invalid_event(format!("change event is missing {:?}", key)))?;
    Ok(serde_json::from_value(value.clone())?)
}

impl ChangeRequest {
    fn opened(tenant: &TenantId, correlation_id: Uuid, event: &AuditEvent) -> Result<Self> {
        let draft: ChangeDraft = payload(&event.metadata, "draft")?;
        Ok(Self {
            id: change_number(&correlation_id),
            correlation_id,
            tenant: tenant.clone(),
            title: draft.title,
            description: draft.description,
            requested_by: event.user_id.clone(),
            affected_systems: draft.affected_systems,
            change_type: draft.proposed_type.unwrap_or(ChangeType::Normal),
            risk_level: RiskLevel::Low,
            status: ChangeStatus::Requested,
            approvals: Vec::new(),
            rollback_triggers: BTreeSet::from([RollbackTrigger::ManualAbort]),
            rollback_reason: None,
            implementation_window_minutes: None,
            created_at: event.timestamp,
            updated_at: event.timestamp,
            implementation_started_at: None,
        })
    }

    /// Rebuild a change from its audit events, oldest first
    pub fn replay(events: &[AuditEvent]) -> Result<Self> {
        let (first, rest) = events
            .split_first()
            .ok_or_else(|| AuditError::ChangeNotFound("no events".to_string()))?;
        if ChangeStatus::from_event_type(&first.event_type) != Some(ChangeStatus::Requested) {
            return Err(AuditError::invalid_event(format!(
                "change history must start with a request, found {}",
                first.event_type
            )));
        }

        let mut change = Self::opened(&first.tenant, first.correlation_id, first)?;
        for event in rest {
            change.apply(&event.event_type, &event.metadata, event.timestamp)?;
        }
        Ok(change)
    }

    /// Fold one recorded transition into this change.
    ///
    /// Used both when replaying history and when previewing the state a new
    /// event will produce, so the two can never disagree.
    pub(crate) fn apply(
        &mut self,
        event_type: &str,
        metadata: &Metadata,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if event_type == APPROVAL_RECORDED {
            self.approvals.push(payload(metadata, "approval")?);
            self.updated_at = at;
            return Ok(());
        }

        let next = ChangeStatus::from_event_type(event_type)
            .ok_or_else(|| AuditError::invalid_event(format!("unknown change event {}", event_type)))?;
        self.status.ensure_transition(next)?;

        match next {
            ChangeStatus::ImpactAssessed => {
                let assessment: ImpactAssessment = payload(metadata, "assessment")?;
                self.change_type = assessment.change_type;
                self.risk_level = assessment.risk_level;
                self.rollback_triggers = assessment.rollback_triggers;
                self.rollback_triggers.insert(RollbackTrigger::ManualAbort);
                self.implementation_window_minutes = Some(assessment.implementation_window_minutes);
            }
            ChangeStatus::Approved => {
                self.approvals.push(payload(metadata, "approval")?);
            }
            ChangeStatus::Implementing => {
                self.implementation_started_at = Some(at);
            }
            ChangeStatus::RolledBack => {
                self.rollback_reason = Some(payload(metadata, "trigger")?);
            }
            ChangeStatus::Requested
            | ChangeStatus::Verified
            | ChangeStatus::Reviewed
            | ChangeStatus::Rejected => {}
        }

        self.status = next;
        self.updated_at = at;
        Ok(())
    }

    pub fn is_armed(&self, trigger: RollbackTrigger) -> bool {
        trigger == RollbackTrigger::ManualAbort || self.rollback_triggers.contains(&trigger)
    }

    /// Deadline after which an implementation counts as overrunning
    pub fn implementation_deadline(&self) -> Option<DateTime<Utc>> {
        let started = self.implementation_started_at?;
        let window = self.implementation_window_minutes?;
        Some(started + chrono::Duration::minutes(i64::from(window)))
    }
}
