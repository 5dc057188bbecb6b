//! Rollback detection and post-implementation compliance checks

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{info, warn};

use crate::workflow::{ChangeRequest, ChangeStatus, RollbackTrigger};

/// Operational signals observed while a change is live
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollbackSignals {
    /// Fraction of failed requests, 0.0 to 1.0
    pub error_rate: f64,
    pub latency_p99_ms: u64,
    pub compliance_violations: Vec<String>,
    pub verification_failed: bool,
    pub manual_abort: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RollbackDetector {
    pub max_error_rate: f64,
    pub max_latency_ms: u64,
}

impl Default for RollbackDetector {
    fn default() -> Self {
        Self {
            max_error_rate: 0.05,
            max_latency_ms: 2_000,
        }
    }
}

impl RollbackDetector {
    pub fn new(max_error_rate: f64, max_latency_ms: u64) -> Self {
        Self {
            max_error_rate,
            max_latency_ms,
        }
    }

    /// Every trigger the signals fire, armed or not
    pub fn fired(
        &self,
        change: &ChangeRequest,
        signals: &RollbackSignals,
        now: DateTime<Utc>,
    ) -> BTreeSet<RollbackTrigger> {
        let mut fired = BTreeSet::new();
        if signals.manual_abort {
            fired.insert(RollbackTrigger::ManualAbort);
        }
        if !signals.compliance_violations.is_empty() {
            fired.insert(RollbackTrigger::ComplianceViolation);
        }
        if signals.verification_failed {
            fired.insert(RollbackTrigger::VerificationFailure);
        }
        if signals.error_rate > self.max_error_rate || signals.latency_p99_ms > self.max_latency_ms {
            fired.insert(RollbackTrigger::SlaBreach);
        }
        if change.status == ChangeStatus::Implementing {
            if let Some(deadline) = change.implementation_deadline() {
                if now > deadline {
                    fired.insert(RollbackTrigger::TimeoutExceeded);
                }
            }
        }
        fired
    }

    /// The armed trigger to roll back on, if any.
    ///
    /// Manual aborts win, then compliance, verification, SLA and timeout.
    pub fn detect(
        &self,
        change: &ChangeRequest,
        signals: &RollbackSignals,
        now: DateTime<Utc>,
    ) -> Option<RollbackTrigger> {
        let fired = self.fired(change, signals, now);
        let priority = [
            RollbackTrigger::ManualAbort,
            RollbackTrigger::ComplianceViolation,
            RollbackTrigger::VerificationFailure,
            RollbackTrigger::SlaBreach,
            RollbackTrigger::TimeoutExceeded,
        ];

        for trigger in priority {
            if !fired.contains(&trigger) {
                continue;
            }
            if change.is_armed(trigger) {
                info!(change = %change.id, %trigger, "Rollback trigger fired");
                return Some(trigger);
            }
            warn!(change = %change.id, %trigger, "Signal fired for a trigger that is not armed");
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceCheck {
    pub name: String,
    pub passed: bool,
    #[serde(default)]
    pub detail: Option<String>,
}

impl ComplianceCheck {
    pub fn passed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            detail: None,
        }
    }

    pub fn failed(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            detail: Some(detail.into()),
        }
    }
}

/// What the implementer reports once the change is in place
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostImplementationReport {
    pub checks: Vec<ComplianceCheck>,
    pub sla_met: bool,
}

impl PostImplementationReport {
    pub fn new(checks: Vec<ComplianceCheck>) -> Self {
        Self {
            checks,
            sla_met: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceOutcome {
    pub passed: bool,
    pub failures: Vec<String>,
    pub trigger: Option<RollbackTrigger>,
}

/// Checks a post-implementation report against the controls every change
/// must keep intact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComplianceVerifier {
    required_controls: Vec<String>,
}

impl Default for ComplianceVerifier {
    fn default() -> Self {
        Self::new(vec![
            "audit_logging_enabled".to_string(),
            "access_controls_intact".to_string(),
        ])
    }
}

impl ComplianceVerifier {
    pub fn new(required_controls: Vec<String>) -> Self {
        Self { required_controls }
    }

    pub fn required_controls(&self) -> &[String] {
        &self.required_controls
    }

    pub fn verify(&self, change: &ChangeRequest, report: &PostImplementationReport) -> ComplianceOutcome {
        let mut failures = Vec::new();
        let mut control_failed = false;

        for control in &self.required_controls {
            match report.checks.iter().find(|c| &c.name == control) {
                Some(check) if check.passed => {}
                Some(check) => {
                    control_failed = true;
                    failures.push(format!(
                        "{}: {}",
                        control,
                        check.detail.as_deref().unwrap_or("failed")
                    ));
                }
                None => {
                    control_failed = true;
                    failures.push(format!("{}: not reported", control));
                }
            }
        }

        let functional_failed = report
            .checks
            .iter()
            .filter(|c| !self.required_controls.contains(&c.name))
            .filter(|c| !c.passed)
            .inspect(|c| {
                failures.push(format!("{}: {}", c.name, c.detail.as_deref().unwrap_or("failed")))
            })
            .count()
            > 0;

        let mut trigger = if control_failed {
            Some(RollbackTrigger::ComplianceViolation)
        } else if functional_failed {
            Some(RollbackTrigger::VerificationFailure)
        } else if !report.sla_met {
            failures.push("sla not met".to_string());
            Some(RollbackTrigger::SlaBreach)
        } else {
            None
        };

        // A failure with no matching armed trigger still rolls back.
        if let Some(fired) = trigger {
            if !change.is_armed(fired) {
                trigger = Some(RollbackTrigger::VerificationFailure);
            }
        }

        ComplianceOutcome {
            passed: trigger.is_none(),
            failures,
            trigger,
        }
    }
}
