use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::collections::BTreeMap;
use tracing::{error, info};

use compliance_audit::audit::{events_merkle_root, TenantId, VerificationReport};
use compliance_audit::config::LoggingConfig;
use compliance_audit::store::{AuditEventStore, SqliteEventStore};
use compliance_audit::telemetry::init_tracing;

/// Verify compliance audit trail integrity in a SQLite store
#[derive(Parser, Debug)]
#[command(name = "verify-audit-trail", version)]
struct Args {
    /// Database URL, e.g. sqlite://compliance-audit.db
    #[arg(short, long, env = "AUDIT__DATABASE__URL")]
    database: String,

    /// Tenant to verify; all tenants when omitted
    #[arg(short, long)]
    tenant: Option<String>,

    /// Expected Merkle root over the tenant's surviving events
    #[arg(short, long, requires = "tenant")]
    merkle_root: Option<String>,

    /// Report silent periods longer than this many hours
    #[arg(long, default_value_t = 24)]
    quiet_hours: i64,

    /// Print the full report as JSON
    #[arg(long)]
    json: bool,

    #[arg(short, long)]
    verbose: bool,

    /// Suppress output except errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.quiet {
        "error"
    } else if args.verbose {
        "debug"
    } else {
        "warn"
    };
    init_tracing(&LoggingConfig {
        level: level.to_string(),
        format: "pretty".to_string(),
    })?;

    let store = SqliteEventStore::connect(&args.database, 1)
        .await
        .with_context(|| format!("Failed to open {}", args.database))?;

    let tenants = match &args.tenant {
        Some(raw) => vec![TenantId::new(raw.as_str())?],
        None => store.tenants().await?,
    };
    if tenants.is_empty() {
        return Err(anyhow!("Audit store has no tenants"));
    }

    let mut failed = Vec::new();
    for tenant in &tenants {
        if let Err(e) = verify_tenant(&store, tenant, &args).await {
            error!("Audit trail verification failed for {}: {}", tenant, e);
            failed.push(tenant.to_string());
        }
    }

    if !failed.is_empty() {
        eprintln!("✗ Verification failed for: {}", failed.join(", "));
        std::process::exit(1);
    }

    if !args.quiet {
        println!("✓ Audit trail verification completed for {} tenant(s)", tenants.len());
    }
    Ok(())
}

async fn verify_tenant(store: &SqliteEventStore, tenant: &TenantId, args: &Args) -> Result<()> {
    info!("Verifying audit trail for tenant {}", tenant);

    let snapshot = store.snapshot(tenant).await?;
    let report = VerificationReport::build(
        &snapshot.events,
        snapshot.anchor.as_ref(),
        chrono::Duration::hours(args.quiet_hours),
    );
    let merkle_root = events_merkle_root(&snapshot.events);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if !args.quiet {
        println!("[{}] {}", tenant, report.summary());
    }

    if args.verbose {
        println!("\nAudit Trail Summary ({}):", tenant);
        println!("  Events: {}", snapshot.events.len());
        if let Some(anchor) = &snapshot.anchor {
            println!("  Pruned through id {} ({})", anchor.last_pruned_id, anchor.last_pruned_hash);
        }
        if let (Some(first), Some(last)) = (snapshot.events.first(), snapshot.events.last()) {
            println!("  First event: #{} at {}", first.id, first.timestamp);
            println!("  Last event: #{} at {}", last.id, last.timestamp);
        }
        println!("  Head hash: {}", report.head_hash.as_deref().unwrap_or("-"));
        println!("  Merkle root: {}", merkle_root.as_deref().unwrap_or("-"));

        if !report.gaps.is_empty() {
            println!("⚠ Found {} gap(s):", report.gaps.len());
            for gap in &report.gaps {
                println!("  {:?} {}..{}: {}", gap.gap_type, gap.start_index, gap.end_index, gap.description);
            }
        }
        if !report.timestamp_regressions.is_empty() {
            println!("⚠ Timestamp regressions at indexes {:?}", report.timestamp_regressions);
        }

        let mut event_types: BTreeMap<&str, usize> = BTreeMap::new();
        for event in &snapshot.events {
            *event_types.entry(event.event_type.as_str()).or_insert(0) += 1;
        }
        println!("\nEvent type distribution:");
        for (event_type, count) in event_types {
            println!("  {}: {}", event_type, count);
        }
    }

    if !report.is_valid() {
        if !report.tampered_indexes.is_empty() {
            error!("Tampered event indexes: {:?}", report.tampered_indexes);
        }
        return Err(anyhow!(report.summary()));
    }

    if let Some(expected) = &args.merkle_root {
        match &merkle_root {
            Some(actual) if actual == expected => {
                if args.verbose {
                    println!("✓ Merkle root matches expected value");
                }
            }
            actual => {
                return Err(anyhow!(
                    "Merkle root mismatch. Expected: {}, Got: {}",
                    expected,
                    actual.as_deref().unwrap_or("<empty>")
                ))
            }
        }
    }

    Ok(())
}
