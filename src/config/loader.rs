//! Workflow rule files
//! Loads the role/permission table and classifier rules from YAML

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{AuditError, Result};
use crate::workflow::{ClassifierRules, RolePermissions};

pub const ROLES_FILE: &str = "roles.yml";
pub const CLASSIFIER_FILE: &str = "classifier.yml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRuleFiles {
    pub roles: RolePermissions,
    pub classifier: ClassifierRules,
}

impl WorkflowRuleFiles {
    /// Load both rule files from a directory
    pub fn load_from_directory(path: &Path) -> Result<Self> {
        info!("Loading workflow rules from: {:?}", path);

        let roles = Self::load_yaml(path.join(ROLES_FILE))?;
        let classifier = Self::load_yaml(path.join(CLASSIFIER_FILE))?;

        let rules = Self { roles, classifier };
        rules.validate()?;

        info!("Successfully loaded workflow rules");
        Ok(rules)
    }

    /// Rules from `dir` when configured, otherwise the built-in defaults
    pub fn load_or_default(dir: Option<&Path>) -> Result<Self> {
        match dir {
            Some(dir) => Self::load_from_directory(dir),
            None => Ok(Self::default()),
        }
    }

    fn load_yaml<T: for<'de> Deserialize<'de>>(path: PathBuf) -> Result<T> {
        if !path.exists() {
            return Err(AuditError::Config(format!(
                "Configuration file not found: {:?}",
                path
            )));
        }

        let contents = fs::read_to_string(&path)
            .map_err(|e| AuditError::Config(format!("Failed to read {:?}: {}", path, e)))?;

        serde_yaml::from_str(&contents)
            .map_err(|e| AuditError::Config(format!("Failed to parse {:?}: {}", path, e)))
    }

    pub fn validate(&self) -> Result<()> {
        self.roles.validate()?;
        self.validate_classifier()
    }

    fn validate_classifier(&self) -> Result<()> {
        let rules = &self.classifier;
        let lists = [
            ("emergency_keywords", &rules.emergency_keywords),
            ("high_risk_keywords", &rules.high_risk_keywords),
            ("medium_risk_keywords", &rules.medium_risk_keywords),
            ("compliance_keywords", &rules.compliance_keywords),
            ("standard_catalog", &rules.standard_catalog),
            ("critical_systems", &rules.critical_systems),
        ];
        for (name, list) in lists {
            if list.iter().any(|entry| entry.trim().is_empty()) {
                return Err(AuditError::Config(format!("{} contains a blank entry", name)));
            }
        }

        let windows = &rules.implementation_windows;
        if windows.critical == 0 {
            return Err(AuditError::Config(
                "implementation windows must be at least one minute".to_string(),
            ));
        }
        if !(windows.low >= windows.medium && windows.medium >= windows.high && windows.high >= windows.critical) {
            return Err(AuditError::Config(
                "implementation windows must shrink as risk grows".to_string(),
            ));
        }
        Ok(())
    }
}
