//! Export boundary
//!
//! Expired events leave the local store only through an [`ExportAdapter`].
//! A sink either acknowledges a batch with an [`ExportReceipt`] or fails
//! with `ExportUnavailable` (try again later) or `ExportRejected` (the
//! batch needs a human).

pub mod file;
pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{events_merkle_root, AuditEvent, TenantId};
use crate::error::{AuditError, Result};

pub use file::FileArchiveAdapter;
pub use http::HttpSinkAdapter;

/// Acknowledgement of a batch accepted by a sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportReceipt {
    pub receipt_id: String,
    pub sink: String,
    pub tenant: TenantId,
    pub event_count: usize,
    pub first_id: i64,
    pub last_id: i64,
    /// Merkle root over the batch's `current_hash` values
    pub merkle_root: String,
    pub exported_at: DateTime<Utc>,
}

impl ExportReceipt {
    pub fn for_batch(sink: &str, receipt_id: String, events: &[AuditEvent]) -> Result<Self> {
        let tenant = batch_tenant(events)?;
        let merkle_root = events_merkle_root(events)
            .ok_or_else(|| AuditError::ExportRejected("empty batch".to_string()))?;
        let first_id = events.first().map(|e| e.id).unwrap_or_default();
        let last_id = events.last().map(|e| e.id).unwrap_or_default();

        Ok(Self {
            receipt_id,
            sink: sink.to_string(),
            tenant: tenant.clone(),
            event_count: events.len(),
            first_id,
            last_id,
            merkle_root,
            exported_at: Utc::now(),
        })
    }
}

#[async_trait]
pub trait ExportAdapter: Send + Sync {
    /// Short sink name used in receipts and logs
    fn name(&self) -> &str;

    async fn export_batch(&self, events: &[AuditEvent]) -> Result<ExportReceipt>;
}

/// The tenant shared by every event in a batch.
///
/// Empty and mixed-tenant batches are rejected outright.
pub fn batch_tenant(events: &[AuditEvent]) -> Result<&TenantId> {
    let first = events
        .first()
        .ok_or_else(|| AuditError::ExportRejected("empty batch".to_string()))?;
    if let Some(other) = events.iter().find(|e| e.tenant != first.tenant) {
        return Err(AuditError::ExportRejected(format!(
            "batch mixes tenants {} and {}",
            first.tenant, other.tenant
        )));
    }
    Ok(&first.tenant)
}
