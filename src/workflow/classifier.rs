//! Impact classification
//!
//! Keyword scoring over the change title and description, plus weight for
//! each critical system touched. Rules come from YAML or the built-in
//! defaults.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

use crate::workflow::{ChangeRequest, ChangeType, RiskLevel, RollbackTrigger};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImplementationWindows {
    pub low: u32,
    pub medium: u32,
    pub high: u32,
    pub critical: u32,
}

impl ImplementationWindows {
    pub fn minutes_for(&self, risk: RiskLevel) -> u32 {
        match risk {
            RiskLevel::Low => self.low,
            RiskLevel::Medium => self.medium,
            RiskLevel::High => self.high,
            RiskLevel::Critical => self.critical,
        }
    }
}

impl Default for ImplementationWindows {
    fn default() -> Self {
        Self {
            low: 240,
            medium: 120,
            high: 60,
            critical: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierRules {
    pub emergency_keywords: Vec<String>,
    pub high_risk_keywords: Vec<String>,
    pub medium_risk_keywords: Vec<String>,
    pub compliance_keywords: Vec<String>,
    /// Pre-approved routine changes
    pub standard_catalog: Vec<String>,
    pub critical_systems: Vec<String>,
    pub implementation_windows: ImplementationWindows,
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|w| w.to_string()).collect()
}

impl Default for ClassifierRules {
    fn default() -> Self {
        Self {
            emergency_keywords: words(&["outage", "incident", "hotfix", "zero-day", "breach"]),
            high_risk_keywords: words(&[
                "database",
                "schema",
                "migration",
                "authentication",
                "encryption",
                "firewall",
                "production",
            ]),
            medium_risk_keywords: words(&["config", "upgrade", "dependency", "network", "dns"]),
            compliance_keywords: words(&["pii", "gdpr", "sox", "hipaa", "pci", "audit", "retention"]),
            standard_catalog: words(&[
                "certificate renewal",
                "patch",
                "password rotation",
                "log rotation",
                "scale out",
            ]),
            critical_systems: words(&["payments", "identity", "core-banking", "audit-trail"]),
            implementation_windows: ImplementationWindows::default(),
        }
    }
}

/// Outcome of classifying a change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactAssessment {
    pub change_type: ChangeType,
    pub risk_level: RiskLevel,
    pub score: u32,
    pub matched_keywords: Vec<String>,
    pub rollback_triggers: BTreeSet<RollbackTrigger>,
    pub implementation_window_minutes: u32,
    pub rationale: String,
}

#[derive(Debug, Clone, Default)]
pub struct ImpactClassifier {
    rules: ClassifierRules,
}

fn matches_in<'a>(text: &str, keywords: &'a [String]) -> Vec<&'a String> {
    keywords
        .iter()
        .filter(|kw| text.contains(&kw.to_lowercase()))
        .collect()
}

impl ImpactClassifier {
    pub fn new(rules: ClassifierRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &ClassifierRules {
        &self.rules
    }

    pub fn assess(&self, change: &ChangeRequest) -> ImpactAssessment {
        let text = format!("{} {}", change.title, change.description).to_lowercase();

        let emergency = matches_in(&text, &self.rules.emergency_keywords);
        let high = matches_in(&text, &self.rules.high_risk_keywords);
        let medium = matches_in(&text, &self.rules.medium_risk_keywords);
        let compliance = matches_in(&text, &self.rules.compliance_keywords);
        let standard = matches_in(&text, &self.rules.standard_catalog);

        let critical_systems: Vec<&String> = change
            .affected_systems
            .iter()
            .filter(|system| {
                self.rules
                    .critical_systems
                    .iter()
                    .any(|critical| critical.eq_ignore_ascii_case(system))
            })
            .collect();

        let score = 3 * high.len() as u32
            + medium.len() as u32
            + 2 * compliance.len() as u32
            + 3 * critical_systems.len() as u32
            + change.affected_systems.len().saturating_sub(1) as u32;

        let mut risk_level = match score {
            0..=1 => RiskLevel::Low,
            2..=3 => RiskLevel::Medium,
            4..=7 => RiskLevel::High,
            _ => RiskLevel::Critical,
        };

        let change_type = if !emergency.is_empty() || change.change_type == ChangeType::Emergency {
            ChangeType::Emergency
        } else if !standard.is_empty() && risk_level == RiskLevel::Low {
            ChangeType::Standard
        } else {
            ChangeType::Normal
        };
        if change_type == ChangeType::Emergency && risk_level < RiskLevel::High {
            risk_level = RiskLevel::High;
        }

        let mut rollback_triggers = BTreeSet::from([
            RollbackTrigger::ManualAbort,
            RollbackTrigger::VerificationFailure,
            RollbackTrigger::TimeoutExceeded,
        ]);
        if !compliance.is_empty() || risk_level >= RiskLevel::Medium {
            rollback_triggers.insert(RollbackTrigger::ComplianceViolation);
        }
        if !critical_systems.is_empty() || risk_level >= RiskLevel::High {
            rollback_triggers.insert(RollbackTrigger::SlaBreach);
        }

        let matched_keywords: Vec<String> = emergency
            .iter()
            .chain(&high)
            .chain(&medium)
            .chain(&compliance)
            .chain(&standard)
            .map(|kw| kw.to_string())
            .collect();

        let rationale = format!(
            "score {} from {} keyword(s) and {} critical system(s); classified {:?}/{:?}",
            score,
            matched_keywords.len(),
            critical_systems.len(),
            change_type,
            risk_level
        );
        debug!(change = %change.id, %rationale, "Classified change impact");

        ImpactAssessment {
            change_type,
            risk_level,
            score,
            matched_keywords,
            rollback_triggers,
            implementation_window_minutes: self.rules.implementation_windows.minutes_for(risk_level),
            rationale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::TenantId;
    use crate::workflow::{change_number, ChangeStatus};
    use chrono::Utc;
    use uuid::Uuid;

    fn change(title: &str, description: &str, systems: &[&str]) -> ChangeRequest {
        let correlation_id = Uuid::new_v4();
        ChangeRequest {
            id: change_number(&correlation_id),
            correlation_id,
            tenant: TenantId::new("t1").unwrap(),
            title: title.to_string(),
            description: description.to_string(),
            requested_by: "alice".to_string(),
            affected_systems: systems.iter().map(|s| s.to_string()).collect(),
            change_type: ChangeType::Normal,
            risk_level: RiskLevel::Low,
            status: ChangeStatus::Requested,
            approvals: Vec::new(),
            rollback_triggers: BTreeSet::new(),
            rollback_reason: None,
            implementation_window_minutes: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            implementation_started_at: None,
        }
    }

    #[test]
    fn test_routine_change_is_standard() {
        let classifier = ImpactClassifier::default();
        let assessment = classifier.assess(&change("Certificate renewal", "Renew web tier cert", &["web"]));

        assert_eq!(assessment.change_type, ChangeType::Standard);
        assert_eq!(assessment.risk_level, RiskLevel::Low);
        assert!(!assessment.rollback_triggers.contains(&RollbackTrigger::SlaBreach));
    }

    #[test]
    fn test_database_change_on_critical_system_is_critical() {
        let classifier = ImpactClassifier::default();
        let assessment = classifier.assess(&change(
            "Payments database schema migration",
            "Adds a column holding PII",
            &["payments"],
        ));

        assert_eq!(assessment.change_type, ChangeType::Normal);
        assert_eq!(assessment.risk_level, RiskLevel::Critical);
        assert!(assessment.rollback_triggers.contains(&RollbackTrigger::ComplianceViolation));
        assert!(assessment.rollback_triggers.contains(&RollbackTrigger::SlaBreach));
        assert_eq!(assessment.implementation_window_minutes, 30);
    }

    #[test]
    fn test_emergency_keyword_escalates() {
        let classifier = ImpactClassifier::default();
        let assessment = classifier.assess(&change("Hotfix for login outage", "", &["web"]));

        assert_eq!(assessment.change_type, ChangeType::Emergency);
        assert!(assessment.risk_level >= RiskLevel::High);
    }
}
