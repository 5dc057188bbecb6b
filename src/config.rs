//! Application configuration
//!
//! Built-in defaults, then an optional TOML file, then environment
//! variables of the form `AUDIT__SECTION__KEY` (for example
//! `AUDIT__RETENTION__HOT_DAYS=30`).

pub mod loader;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::{AuditError, Result};
use crate::export::{ExportAdapter, FileArchiveAdapter, HttpSinkAdapter};
use crate::retention::RetentionPolicy;
use crate::workflow::{ApprovalRouter, ComplianceVerifier, RollbackDetector};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// No network sinks, no deletion
    pub offline: bool,
    pub database: DatabaseConfig,
    pub retention: RetentionConfig,
    pub export: ExportConfig,
    pub workflow: WorkflowConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub hot_days: u32,
    pub warm_days: u32,
    pub cold_days: u32,
    pub batch_size: usize,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportSink {
    None,
    File,
    Http,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportConfig {
    pub sink: ExportSink,
    pub archive_dir: PathBuf,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    pub timeout_secs: u64,
}

fn default_required_controls() -> Vec<String> {
    vec![
        "audit_logging_enabled".to_string(),
        "access_controls_intact".to_string(),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub cab_quorum: usize,
    pub max_error_rate: f64,
    pub max_latency_ms: u64,
    #[serde(default = "default_required_controls")]
    pub required_controls: Vec<String>,
    /// Directory holding `roles.yml` and `classifier.yml`
    #[serde(default)]
    pub rules_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl AppConfig {
    /// Load from defaults, the optional TOML file at `path`, and `AUDIT__*`
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = Config::builder()
            .set_default("offline", false)?
            .set_default("database.url", "sqlite://compliance-audit.db")?
            .set_default("database.max_connections", 5)?
            .set_default("retention.hot_days", 90)?
            .set_default("retention.warm_days", 365)?
            .set_default("retention.cold_days", 2555)?
            .set_default("retention.batch_size", 500)?
            .set_default("retention.sweep_interval_secs", 3600)?
            .set_default("export.sink", "none")?
            .set_default("export.archive_dir", "./archive")?
            .set_default("export.timeout_secs", 30)?
            .set_default("workflow.cab_quorum", 3)?
            .set_default("workflow.max_error_rate", 0.05)?
            .set_default("workflow.max_latency_ms", 2000)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?;

        if let Some(path) = path {
            info!("Loading configuration from {}", path.display());
            settings = settings.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }

        settings = settings.add_source(
            Environment::with_prefix("AUDIT")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = settings.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.retention_policy()?;

        if self.retention.batch_size == 0 {
            return Err(AuditError::Config("retention.batch_size must be at least 1".to_string()));
        }
        if self.retention.sweep_interval_secs == 0 {
            return Err(AuditError::Config(
                "retention.sweep_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(AuditError::Config("database.max_connections must be at least 1".to_string()));
        }

        if self.export.sink == ExportSink::Http {
            match &self.export.endpoint {
                Some(endpoint) if endpoint.starts_with("http://") || endpoint.starts_with("https://") => {}
                Some(endpoint) => {
                    return Err(AuditError::Config(format!(
                        "export.endpoint must be an http(s) URL, got {}",
                        endpoint
                    )))
                }
                None => {
                    return Err(AuditError::Config(
                        "export.endpoint is required for the http sink".to_string(),
                    ))
                }
            }
        }

        if self.workflow.cab_quorum == 0 {
            return Err(AuditError::Config("workflow.cab_quorum must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.workflow.max_error_rate) {
            return Err(AuditError::Config(
                "workflow.max_error_rate must be between 0 and 1".to_string(),
            ));
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(AuditError::Config(format!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    other
                )))
            }
        }
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" => {}
            other => {
                return Err(AuditError::Config(format!(
                    "Invalid log format: {}. Must be one of: json, pretty",
                    other
                )))
            }
        }

        Ok(())
    }

    pub fn retention_policy(&self) -> Result<RetentionPolicy> {
        RetentionPolicy::new(
            self.retention.hot_days,
            self.retention.warm_days,
            self.retention.cold_days,
        )
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.retention.sweep_interval_secs)
    }

    /// Effective configuration as TOML, secrets redacted
    pub fn to_toml(&self) -> Result<String> {
        let mut redacted = self.clone();
        if redacted.export.token.is_some() {
            redacted.export.token = Some("<redacted>".to_string());
        }
        toml::to_string_pretty(&redacted).map_err(|e| AuditError::Config(e.to_string()))
    }
}

impl ExportConfig {
    /// The configured sink, or `None` when exports are disabled or offline
    pub fn build_adapter(&self, offline: bool) -> Result<Option<Arc<dyn ExportAdapter>>> {
        if offline {
            return Ok(None);
        }
        let adapter: Arc<dyn ExportAdapter> = match self.sink {
            ExportSink::None => return Ok(None),
            ExportSink::File => Arc::new(FileArchiveAdapter::new(&self.archive_dir)?),
            ExportSink::Http => {
                let endpoint = self
                    .endpoint
                    .clone()
                    .ok_or_else(|| AuditError::Config("export.endpoint is required".to_string()))?;
                Arc::new(HttpSinkAdapter::new(
                    endpoint,
                    self.token.clone(),
                    Duration::from_secs(self.timeout_secs),
                )?)
            }
        };
        Ok(Some(adapter))
    }
}

impl WorkflowConfig {
    pub fn router(&self) -> ApprovalRouter {
        ApprovalRouter::new(self.cab_quorum)
    }

    pub fn detector(&self) -> RollbackDetector {
        RollbackDetector::new(self.max_error_rate, self.max_latency_ms)
    }

    pub fn verifier(&self) -> ComplianceVerifier {
        ComplianceVerifier::new(self.required_controls.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_load_and_validate() {
        let config = AppConfig::load(None).unwrap();
        assert!(!config.offline);
        assert_eq!(config.retention.cold_days, 2555);
        assert_eq!(config.export.sink, ExportSink::None);
        assert_eq!(config.workflow.required_controls.len(), 2);
    }

    #[test]
    fn test_toml_file_overrides_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
offline = true

[retention]
hot_days = 30
warm_days = 180
cold_days = 1825

[logging]
format = "json"
"#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert!(config.offline);
        assert_eq!(config.retention.hot_days, 30);
        assert_eq!(config.retention.batch_size, 500);
        assert_eq!(config.logging.format, "json");
        assert!(config.export.build_adapter(config.offline).unwrap().is_none());
    }

    #[test]
    fn test_unordered_tiers_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[retention]\nhot_days = 400\n").unwrap();
        assert!(matches!(AppConfig::load(Some(file.path())), Err(AuditError::Config(_))));
    }

    #[test]
    fn test_http_sink_requires_endpoint() {
        let mut config = AppConfig::load(None).unwrap();
        config.export.sink = ExportSink::Http;
        assert!(config.validate().is_err());

        config.export.endpoint = Some("https://collector.example.com/ingest".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_to_toml_redacts_token() {
        let mut config = AppConfig::load(None).unwrap();
        config.export.token = Some("s3cret".to_string());
        let rendered = config.to_toml().unwrap();
        assert!(!rendered.contains("s3cret"));
    }
}
