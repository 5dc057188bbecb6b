//! Roles, permissions and the table mapping one to the other

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use crate::error::{AuditError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Requester,
    Engineer,
    Auditor,
    Manager,
    CabMember,
    Ciso,
    /// The workflow itself, for automatic approvals
    System,
}

impl Role {
    pub const ALL: [Role; 7] = [
        Role::Requester,
        Role::Engineer,
        Role::Auditor,
        Role::Manager,
        Role::CabMember,
        Role::Ciso,
        Role::System,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Role::Requester => "requester",
            Role::Engineer => "engineer",
            Role::Auditor => "auditor",
            Role::Manager => "manager",
            Role::CabMember => "cab_member",
            Role::Ciso => "ciso",
            Role::System => "system",
        }
    }

    /// Manager-level sign-off: managers, CAB members and the CISO
    pub fn is_manager_or_above(&self) -> bool {
        matches!(self, Role::Manager | Role::CabMember | Role::Ciso)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Role {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self> {
        Role::ALL
            .into_iter()
            .find(|role| role.name() == s)
            .ok_or_else(|| AuditError::Config(format!("unknown role {:?}", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    SubmitChange,
    AssessImpact,
    ApproveChange,
    RejectChange,
    ImplementChange,
    VerifyChange,
    ReviewChange,
    RollbackChange,
    ViewAudit,
}

impl Permission {
    pub const ALL: [Permission; 9] = [
        Permission::SubmitChange,
        Permission::AssessImpact,
        Permission::ApproveChange,
        Permission::RejectChange,
        Permission::ImplementChange,
        Permission::VerifyChange,
        Permission::ReviewChange,
        Permission::RollbackChange,
        Permission::ViewAudit,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Permission::SubmitChange => "submit_change",
            Permission::AssessImpact => "assess_impact",
            Permission::ApproveChange => "approve_change",
            Permission::RejectChange => "reject_change",
            Permission::ImplementChange => "implement_change",
            Permission::VerifyChange => "verify_change",
            Permission::ReviewChange => "review_change",
            Permission::RollbackChange => "rollback_change",
            Permission::ViewAudit => "view_audit",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Who is acting on a change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }

    pub fn system() -> Self {
        Self::new("system", Role::System)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolePermissions {
    roles: BTreeMap<Role, BTreeSet<Permission>>,
}

impl Default for RolePermissions {
    fn default() -> Self {
        use Permission::*;

        let table = vec![
            (Role::Requester, vec![SubmitChange, ViewAudit]),
            (
                Role::Engineer,
                vec![SubmitChange, AssessImpact, ImplementChange, VerifyChange, RollbackChange, ViewAudit],
            ),
            (Role::Auditor, vec![ViewAudit]),
            (
                Role::Manager,
                vec![SubmitChange, AssessImpact, ApproveChange, RejectChange, ReviewChange, RollbackChange, ViewAudit],
            ),
            (Role::CabMember, vec![ApproveChange, RejectChange, ReviewChange, ViewAudit]),
            (Role::Ciso, Permission::ALL.to_vec()),
            (Role::System, vec![ApproveChange, RollbackChange, ViewAudit]),
        ];

        Self {
            roles: table
                .into_iter()
                .map(|(role, perms)| (role, perms.into_iter().collect()))
                .collect(),
        }
    }
}

impl RolePermissions {
    pub fn from_table(roles: BTreeMap<Role, BTreeSet<Permission>>) -> Result<Self> {
        let table = Self { roles };
        table.validate()?;
        Ok(table)
    }

    pub fn allows(&self, role: Role, permission: Permission) -> bool {
        self.roles
            .get(&role)
            .map(|perms| perms.contains(&permission))
            .unwrap_or(false)
    }

    pub fn check(&self, actor: &Actor, permission: Permission) -> Result<()> {
        if self.allows(actor.role, permission) {
            return Ok(());
        }
        warn!(user_id = %actor.user_id, role = %actor.role, %permission, "Permission denied");
        Err(AuditError::Unauthorized {
            user_id: actor.user_id.clone(),
            role: actor.role.to_string(),
            permission: permission.to_string(),
        })
    }

    /// Every permission must belong to some role, and the system role must
    /// be able to record automatic approvals.
    pub fn validate(&self) -> Result<()> {
        for permission in Permission::ALL {
            if !self.roles.values().any(|perms| perms.contains(&permission)) {
                return Err(AuditError::Config(format!(
                    "no role is granted {}",
                    permission
                )));
            }
        }
        if !self.allows(Role::System, Permission::ApproveChange) {
            return Err(AuditError::Config(
                "system role must hold approve_change for standard changes".to_string(),
            ));
        }
        Ok(())
    }
}
