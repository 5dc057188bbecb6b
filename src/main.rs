use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use compliance_audit::audit::TenantId;
use compliance_audit::config::loader::WorkflowRuleFiles;
use compliance_audit::config::AppConfig;
use compliance_audit::retention::RetentionManager;
use compliance_audit::store::{AuditEventStore, SqliteEventStore};
use compliance_audit::telemetry::init_tracing;

/// Compliance audit trail daemon: runs periodic retention sweeps
#[derive(Parser, Debug)]
#[command(name = "compliance-auditd", version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Restrict sweeps to these tenants
    #[arg(short, long = "tenant")]
    tenants: Vec<String>,

    /// Run a single sweep and exit
    #[arg(long)]
    once: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = AppConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if args.print_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    init_tracing(&config.logging)?;
    info!("Starting compliance audit daemon");
    if config.offline {
        warn!("Offline mode: expired events are kept and no sink is contacted");
    }

    // Validate rule files at startup so a bad table fails fast.
    WorkflowRuleFiles::load_or_default(config.workflow.rules_dir.as_deref())
        .context("Failed to load workflow rules")?;

    let store = SqliteEventStore::connect(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to open audit store")?;
    let store: Arc<dyn AuditEventStore> = Arc::new(store);
    info!("Audit store ready");

    for tenant in store.tenants().await? {
        match store.verify_integrity(&tenant).await {
            Ok(true) => info!(%tenant, "Audit chain verified"),
            Ok(false) => error!(%tenant, "Audit chain failed verification"),
            Err(e) => error!(%tenant, error = %e, "Could not verify audit chain"),
        }
    }

    let adapter = config.export.build_adapter(config.offline)?;
    let manager = Arc::new(
        RetentionManager::new(store.clone(), adapter, config.retention_policy()?)
            .with_batch_size(config.retention.batch_size)
            .offline(config.offline),
    );

    let tenants = if args.tenants.is_empty() {
        None
    } else {
        Some(
            args.tenants
                .iter()
                .map(|raw| TenantId::new(raw.as_str()))
                .collect::<compliance_audit::Result<Vec<_>>>()?,
        )
    };

    let cancel = CancellationToken::new();

    if args.once {
        let now = chrono::Utc::now();
        let report = match &tenants {
            Some(tenants) => {
                let mut reports = Vec::new();
                for tenant in tenants {
                    reports.push((tenant.to_string(), manager.sweep(tenant, now).await?));
                }
                serde_json::to_string_pretty(&reports)?
            }
            None => serde_json::to_string_pretty(&manager.sweep_all(now, &cancel).await?)?,
        };
        println!("{}", report);
        return Ok(());
    }

    let sweeper = tokio::spawn(manager.clone().run_periodic(
        tenants,
        config.sweep_interval(),
        cancel.clone(),
    ));

    tokio::signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    cancel.cancel();

    if let Err(e) = sweeper.await {
        error!("Retention sweeper task failed: {}", e);
    }
    info!("Compliance audit daemon stopped");
    Ok(())
}
