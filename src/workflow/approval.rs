//! Approval routing
//!
//! - Standard, low risk: approved automatically by the workflow
//! - Normal: one manager-level approval
//! - Emergency, or High/Critical risk: CAB quorum, or a single CISO approval

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{AuditError, Result};
use crate::workflow::{Actor, Approval, ChangeRequest, ChangeType, RiskLevel, Role};

pub const DEFAULT_CAB_QUORUM: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApprovalRequirement {
    Automatic,
    Manager,
    Cab { quorum: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApprovalRouter {
    cab_quorum: usize,
}

impl Default for ApprovalRouter {
    fn default() -> Self {
        Self::new(DEFAULT_CAB_QUORUM)
    }
}

impl ApprovalRouter {
    pub fn new(cab_quorum: usize) -> Self {
        Self {
            cab_quorum: cab_quorum.max(1),
        }
    }

    pub fn cab_quorum(&self) -> usize {
        self.cab_quorum
    }

    pub fn route(&self, change_type: ChangeType, risk: RiskLevel) -> ApprovalRequirement {
        if change_type == ChangeType::Emergency || risk >= RiskLevel::High {
            return ApprovalRequirement::Cab {
                quorum: self.cab_quorum,
            };
        }
        match (change_type, risk) {
            (ChangeType::Standard, RiskLevel::Low) => ApprovalRequirement::Automatic,
            _ => ApprovalRequirement::Manager,
        }
    }

    pub fn requirement_for(&self, change: &ChangeRequest) -> ApprovalRequirement {
        self.route(change.change_type, change.risk_level)
    }

    /// Whether `actor` may cast an approval on `change` right now
    pub fn authorize_approver(&self, change: &ChangeRequest, actor: &Actor) -> Result<()> {
        if actor.user_id == change.requested_by {
            return Err(AuditError::ApprovalDenied(format!(
                "{} requested {} and cannot approve it",
                actor.user_id, change.id
            )));
        }
        if change.approvals.iter().any(|a| a.approver == actor.user_id) {
            return Err(AuditError::ApprovalDenied(format!(
                "{} has already approved {}",
                actor.user_id, change.id
            )));
        }

        let eligible = match self.requirement_for(change) {
            ApprovalRequirement::Automatic => actor.role == Role::System || actor.role.is_manager_or_above(),
            ApprovalRequirement::Manager => actor.role.is_manager_or_above(),
            ApprovalRequirement::Cab { .. } => matches!(actor.role, Role::CabMember | Role::Ciso),
        };
        if !eligible {
            return Err(AuditError::ApprovalDenied(format!(
                "role {} cannot approve a {:?}/{:?} change",
                actor.role, change.change_type, change.risk_level
            )));
        }
        Ok(())
    }

    pub fn is_satisfied(&self, requirement: ApprovalRequirement, approvals: &[Approval]) -> bool {
        self.remaining(requirement, approvals) == 0
    }

    /// Approvals still needed before the change counts as approved
    pub fn remaining(&self, requirement: ApprovalRequirement, approvals: &[Approval]) -> usize {
        match requirement {
            ApprovalRequirement::Automatic => usize::from(approvals.is_empty()),
            ApprovalRequirement::Manager => {
                usize::from(!approvals.iter().any(|a| a.role.is_manager_or_above()))
            }
            ApprovalRequirement::Cab { quorum } => {
                if approvals.iter().any(|a| a.role == Role::Ciso) {
                    return 0;
                }
                let members: BTreeSet<&str> = approvals
                    .iter()
                    .filter(|a| a.role == Role::CabMember)
                    .map(|a| a.approver.as_str())
                    .collect();
                quorum.saturating_sub(members.len())
            }
        }
    }
}
