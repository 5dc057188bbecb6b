//! Audit Event Store
//!
//! Append-only, per-tenant persistence for hash-chained audit events.
//!
//! Appends for one tenant are serialized so every event links to exactly one
//! predecessor. Queries are tenant-scoped and fail closed: a filter that does
//! not name a tenant is an error, never an unscoped scan.

pub mod memory;
pub mod schema;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::TryStreamExt;
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, ChainAnchor, ExportState, HashChain, NewAuditEvent, TenantId};
use crate::error::{AuditError, ChainIntegrityError, Result};

pub use memory::MemoryEventStore;
pub use sqlite::SqliteEventStore;

/// Lazy, finite sequence of events ordered by id ascending
pub type EventStream<'a> = BoxStream<'a, Result<AuditEvent>>;

/// Query filter. `tenant` is mandatory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub tenant: Option<TenantId>,
    pub user_id: Option<String>,
    pub correlation_id: Option<Uuid>,
    pub event_type: Option<String>,
    /// Inclusive lower bound
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound
    pub to: Option<DateTime<Utc>>,
}

impl EventFilter {
    pub fn for_tenant(tenant: TenantId) -> Self {
        Self {
            tenant: Some(tenant),
            ..Default::default()
        }
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn between(mut self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    pub fn require_tenant(&self) -> Result<&TenantId> {
        self.tenant.as_ref().ok_or(AuditError::MissingTenant)
    }

    /// Check the non-tenant predicates against an event
    pub fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(tenant) = &self.tenant {
            if &event.tenant != tenant {
                return false;
            }
        }
        if let Some(user_id) = &self.user_id {
            if &event.user_id != user_id {
                return false;
            }
        }
        if let Some(correlation_id) = self.correlation_id {
            if event.correlation_id != correlation_id {
                return false;
            }
        }
        if let Some(event_type) = &self.event_type {
            if &event.event_type != event_type {
                return false;
            }
        }
        if let Some(from) = self.from {
            if event.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if event.timestamp >= to {
                return false;
            }
        }
        true
    }
}

/// An event together with its retention bookkeeping
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionRecord {
    pub event: AuditEvent,
    pub export_state: ExportState,
}

/// Consistent view of a tenant chain: the surviving events and the anchor
/// they link back to.
#[derive(Debug, Clone, Default)]
pub struct ChainSnapshot {
    pub anchor: Option<ChainAnchor>,
    pub events: Vec<AuditEvent>,
}

#[async_trait]
pub trait AuditEventStore: Send + Sync {
    /// Assign the next id and hash for `tenant` and persist the event.
    ///
    /// Returns only after the event is durable.
    async fn append(&self, tenant: &TenantId, event: NewAuditEvent) -> Result<AuditEvent>;

    /// Filtered scan. Every call re-executes the scan.
    fn query(&self, filter: EventFilter) -> EventStream<'_>;

    async fn tail(&self, tenant: &TenantId) -> Result<Option<AuditEvent>>;

    async fn snapshot(&self, tenant: &TenantId) -> Result<ChainSnapshot>;

    /// One page of events with a timestamp before `cutoff` and an id after
    /// `after_id`, oldest id first. At most `limit` records.
    async fn retention_candidates(
        &self,
        tenant: &TenantId,
        cutoff: DateTime<Utc>,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<RetentionRecord>>;

    /// Update retention bookkeeping. Exported events are never downgraded.
    async fn mark_export_state(
        &self,
        tenant: &TenantId,
        ids: &[i64],
        state: ExportState,
    ) -> Result<usize>;

    /// Delete the longest prefix of exported events older than `cutoff` and
    /// move the chain anchor past them.
    async fn prune_exported(&self, tenant: &TenantId, cutoff: DateTime<Utc>) -> Result<usize>;

    async fn tenants(&self) -> Result<Vec<TenantId>>;

    async fn anchor(&self, tenant: &TenantId) -> Result<Option<ChainAnchor>> {
        Ok(self.snapshot(tenant).await?.anchor)
    }

    async fn collect(&self, filter: EventFilter) -> Result<Vec<AuditEvent>> {
        self.query(filter).try_collect().await
    }

    /// Replay the tenant's chain, reporting the first failing index
    async fn verify_chain(&self, tenant: &TenantId) -> Result<()> {
        let snapshot = self.snapshot(tenant).await?;
        HashChain::verify(&snapshot.events, snapshot.anchor.as_ref())?;
        Ok(())
    }

    async fn verify_integrity(&self, tenant: &TenantId) -> Result<bool> {
        match self.verify_chain(tenant).await {
            Ok(()) => Ok(true),
            Err(AuditError::ChainIntegrity(ChainIntegrityError { index, event_id, reason })) => {
                error!(%tenant, index, event_id, %reason, "Audit trail integrity check failed");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

/// Store handle bound to one tenant.
///
/// Filters without a tenant are scoped to the bound tenant; filters naming
/// any other tenant are rejected.
#[derive(Clone)]
pub struct TenantScope {
    store: Arc<dyn AuditEventStore>,
    tenant: TenantId,
}

impl TenantScope {
    pub fn new(store: Arc<dyn AuditEventStore>, tenant: TenantId) -> Self {
        Self { store, tenant }
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn store(&self) -> &Arc<dyn AuditEventStore> {
        &self.store
    }

    pub async fn append(&self, event: NewAuditEvent) -> Result<AuditEvent> {
        self.store.append(&self.tenant, event).await
    }

    fn scoped(&self, mut filter: EventFilter) -> Result<EventFilter> {
        match &filter.tenant {
            None => {
                filter.tenant = Some(self.tenant.clone());
                Ok(filter)
            }
            Some(requested) if requested == &self.tenant => Ok(filter),
            Some(requested) => {
                warn!(bound = %self.tenant, requested = %requested, "Rejected cross-tenant query");
                Err(AuditError::TenantMismatch {
                    bound: self.tenant.to_string(),
                    requested: requested.to_string(),
                })
            }
        }
    }

    pub fn query(&self, filter: EventFilter) -> EventStream<'_> {
        match self.scoped(filter) {
            Ok(filter) => self.store.query(filter),
            Err(e) => Box::pin(futures::stream::once(async move { Err(e) })),
        }
    }

    pub async fn collect(&self, filter: EventFilter) -> Result<Vec<AuditEvent>> {
        self.query(filter).try_collect().await
    }

    pub async fn tail(&self) -> Result<Option<AuditEvent>> {
        self.store.tail(&self.tenant).await
    }

    pub async fn verify_integrity(&self) -> Result<bool> {
        self.store.verify_integrity(&self.tenant).await
    }
}
