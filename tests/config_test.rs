//! The shipped configuration and rule files load and validate

use std::path::PathBuf;

use compliance_audit::config::loader::WorkflowRuleFiles;
use compliance_audit::config::{AppConfig, ExportSink};
use compliance_audit::workflow::{Permission, Role, RolePermissions};

fn config_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config")
}

#[test]
fn test_sample_config_loads() {
    let config = AppConfig::load(Some(config_dir().join("compliance-audit.toml").as_path())).unwrap();
    assert_eq!(config.export.sink, ExportSink::File);
    assert_eq!(config.workflow.cab_quorum, 3);
    assert_eq!(config.retention_policy().unwrap().cold_days, 2555);
}

#[test]
fn test_sample_rules_match_builtin_defaults() {
    let rules = WorkflowRuleFiles::load_from_directory(&config_dir().join("rules")).unwrap();
    assert_eq!(rules.roles, RolePermissions::default());
    assert_eq!(rules, WorkflowRuleFiles::default());
    assert!(!rules.roles.allows(Role::Auditor, Permission::ApproveChange));
}
