#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use compliance_audit::audit::{AuditEvent, NewAuditEvent, TenantId};
use compliance_audit::store::{AuditEventStore, SqliteEventStore, TenantScope};
use compliance_audit::workflow::{Actor, ChangeWorkflow, Role};

/// Setup an in-memory SQLite store for testing
pub async fn setup_test_store() -> SqliteEventStore {
    SqliteEventStore::in_memory()
        .await
        .expect("Failed to create test store")
}

/// File-backed store. Keep the TempDir alive as long as the store.
pub async fn setup_file_store() -> (TempDir, SqliteEventStore) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let store = SqliteEventStore::connect(&database_url(&dir), 4)
        .await
        .expect("Failed to create file store");
    (dir, store)
}

pub fn database_url(dir: &TempDir) -> String {
    format!("sqlite://{}", dir.path().join("audit.db").display())
}

pub fn tenant(raw: &str) -> TenantId {
    TenantId::new(raw).expect("valid tenant")
}

pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2032, 3, 1, 12, 0, 0).unwrap()
}

/// Append `count` access events starting `age_days` before `fixed_now()`,
/// one minute apart
pub async fn seed_events(
    store: &dyn AuditEventStore,
    tenant: &TenantId,
    count: usize,
    age_days: i64,
) -> Vec<AuditEvent> {
    let start = fixed_now() - Duration::days(age_days);
    let mut events = Vec::with_capacity(count);
    for i in 0..count {
        let event = NewAuditEvent::new("data.access", format!("user{}", i % 3), "doc-42", "read")
            .at(start + Duration::minutes(i as i64))
            .with_metadata("seq", i as u64);
        events.push(store.append(tenant, event).await.expect("append"));
    }
    events
}

/// Archived `.jsonl` batches under `dir`, in id order
pub fn archived_batches(dir: &Path) -> Vec<PathBuf> {
    let mut batches: Vec<PathBuf> = fs::read_dir(dir)
        .expect("archive dir")
        .map(|entry| entry.expect("dir entry").path())
        .filter(|path| path.extension().map_or(false, |ext| ext == "jsonl"))
        .collect();
    batches.sort();
    batches
}

pub fn file_name(path: &Path) -> String {
    path.file_name().unwrap().to_string_lossy().into_owned()
}

pub fn requester() -> Actor {
    Actor::new("alice", Role::Engineer)
}

pub fn implementer() -> Actor {
    Actor::new("erin", Role::Engineer)
}

pub fn manager() -> Actor {
    Actor::new("mona", Role::Manager)
}

pub fn cab_member(name: &str) -> Actor {
    Actor::new(name, Role::CabMember)
}

pub fn ciso() -> Actor {
    Actor::new("cora", Role::Ciso)
}

pub fn workflow_on(store: Arc<dyn AuditEventStore>, raw_tenant: &str) -> ChangeWorkflow {
    ChangeWorkflow::new(TenantScope::new(store, tenant(raw_tenant)))
}
