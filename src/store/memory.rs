//! In-memory audit event store
//!
//! Used for offline mode and tests. Nothing survives the process, so this
//! backend is not durable in the sense the SQLite store is.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::audit::{AuditEvent, ChainAnchor, ExportState, NewAuditEvent, TenantId};
use crate::error::{AuditError, Result};
use crate::store::{AuditEventStore, ChainSnapshot, EventFilter, EventStream, RetentionRecord};

#[derive(Debug, Clone)]
struct StoredRecord {
    event: AuditEvent,
    export_state: ExportState,
}

#[derive(Debug, Default)]
struct TenantChain {
    records: Vec<StoredRecord>,
    anchor: Option<ChainAnchor>,
}

impl TenantChain {
    fn tail_position(&self) -> (i64, Option<String>) {
        match (self.records.last(), &self.anchor) {
            (Some(last), _) => (last.event.id, Some(last.event.current_hash.clone())),
            (None, Some(anchor)) => (anchor.last_pruned_id, Some(anchor.last_pruned_hash.clone())),
            (None, None) => (0, None),
        }
    }
}

#[derive(Default)]
pub struct MemoryEventStore {
    chains: RwLock<HashMap<TenantId, Arc<RwLock<TenantChain>>>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn chain(&self, tenant: &TenantId) -> Option<Arc<RwLock<TenantChain>>> {
        self.chains.read().await.get(tenant).cloned()
    }

    async fn chain_or_create(&self, tenant: &TenantId) -> Arc<RwLock<TenantChain>> {
        if let Some(chain) = self.chain(tenant).await {
            return chain;
        }
        self.chains
            .write()
            .await
            .entry(tenant.clone())
            .or_default()
            .clone()
    }

    /// Snapshot of the matching events, taken under the tenant's read lock
    async fn scan(&self, filter: EventFilter) -> Result<Vec<AuditEvent>> {
        let tenant = filter.require_tenant()?;
        let Some(chain) = self.chain(tenant).await else {
            return Ok(Vec::new());
        };
        let chain = chain.read().await;
        Ok(chain
            .records
            .iter()
            .filter(|r| filter.matches(&r.event))
            .map(|r| r.event.clone())
            .collect())
    }

    /// Overwrite a stored event in place, bypassing the chain.
    ///
    /// Exists so tests can simulate out-of-band tampering.
    #[cfg(test)]
    pub(crate) async fn tamper<F>(&self, tenant: &TenantId, id: i64, edit: F)
    where
        F: FnOnce(&mut AuditEvent),
    {
        if let Some(chain) = self.chain(tenant).await {
            let mut chain = chain.write().await;
            if let Some(record) = chain.records.iter_mut().find(|r| r.event.id == id) {
                edit(&mut record.event);
            }
        }
    }
}

#[async_trait]
impl AuditEventStore for MemoryEventStore {
    async fn append(&self, tenant: &TenantId, event: NewAuditEvent) -> Result<AuditEvent> {
        event.validate()?;

        let chain = self.chain_or_create(tenant).await;
        let mut chain = chain.write().await;

        let (tail_id, tail_hash) = chain.tail_position();
        if let Some(expected) = &event.expected_previous_hash {
            if tail_hash.as_deref() != Some(expected.as_str()) {
                return Err(AuditError::OutOfOrder {
                    tenant: tenant.to_string(),
                    expected: expected.clone(),
                    actual: tail_hash.unwrap_or_else(|| "<genesis>".to_string()),
                });
            }
        }

        let sealed = event.seal(tenant, tail_id + 1, tail_hash);
        chain.records.push(StoredRecord {
            event: sealed.clone(),
            export_state: ExportState::Retained,
        });

        debug!("Appended audit event {}", sealed.summary());
        Ok(sealed)
    }

    fn query(&self, filter: EventFilter) -> EventStream<'_> {
        let items = stream::once(self.scan(filter)).flat_map(|result| {
            let items: Vec<Result<AuditEvent>> = match result {
                Ok(events) => events.into_iter().map(Ok).collect(),
                Err(e) => vec![Err(e)],
            };
            stream::iter(items)
        });
        Box::pin(items)
    }

    async fn tail(&self, tenant: &TenantId) -> Result<Option<AuditEvent>> {
        Ok(match self.chain(tenant).await {
            Some(chain) => chain.read().await.records.last().map(|r| r.event.clone()),
            None => None,
        })
    }

    async fn snapshot(&self, tenant: &TenantId) -> Result<ChainSnapshot> {
        Ok(match self.chain(tenant).await {
            Some(chain) => {
                let chain = chain.read().await;
                ChainSnapshot {
                    anchor: chain.anchor.clone(),
                    events: chain.records.iter().map(|r| r.event.clone()).collect(),
                }
            }
            None => ChainSnapshot::default(),
        })
    }

    async fn retention_candidates(
        &self,
        tenant: &TenantId,
        cutoff: DateTime<Utc>,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<RetentionRecord>> {
        let Some(chain) = self.chain(tenant).await else {
            return Ok(Vec::new());
        };
        let chain = chain.read().await;
        Ok(chain
            .records
            .iter()
            .filter(|r| r.event.id > after_id && r.event.timestamp < cutoff)
            .take(limit)
            .map(|r| RetentionRecord {
                event: r.event.clone(),
                export_state: r.export_state.clone(),
            })
            .collect())
    }

    async fn mark_export_state(
        &self,
        tenant: &TenantId,
        ids: &[i64],
        state: ExportState,
    ) -> Result<usize> {
        let Some(chain) = self.chain(tenant).await else {
            return Ok(0);
        };
        let mut chain = chain.write().await;
        let mut updated = 0;
        for record in chain.records.iter_mut() {
            if !ids.contains(&record.event.id) {
                continue;
            }
            if record.export_state.is_exported() && !state.is_exported() {
                continue;
            }
            record.export_state = state.clone();
            updated += 1;
        }
        Ok(updated)
    }

    async fn prune_exported(&self, tenant: &TenantId, cutoff: DateTime<Utc>) -> Result<usize> {
        let Some(chain) = self.chain(tenant).await else {
            return Ok(0);
        };
        let mut chain = chain.write().await;

        let prunable = chain
            .records
            .iter()
            .take_while(|r| r.export_state.is_exported() && r.event.timestamp < cutoff)
            .count();
        if prunable == 0 {
            return Ok(0);
        }

        let removed: Vec<StoredRecord> = chain.records.drain(..prunable).collect();
        if let Some(last) = removed.last() {
            chain.anchor = Some(ChainAnchor {
                last_pruned_id: last.event.id,
                last_pruned_hash: last.event.current_hash.clone(),
            });
        }

        info!(%tenant, pruned = prunable, "Pruned exported audit events");
        Ok(prunable)
    }

    async fn tenants(&self) -> Result<Vec<TenantId>> {
        let mut tenants: Vec<TenantId> = self.chains.read().await.keys().cloned().collect();
        tenants.sort();
        Ok(tenants)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use futures::TryStreamExt;
    use std::collections::HashSet;

    fn t(raw: &str) -> TenantId {
        TenantId::new(raw).unwrap()
    }

    async fn append_n(store: &MemoryEventStore, tenant: &TenantId, n: usize) -> Vec<AuditEvent> {
        let mut out = Vec::new();
        for i in 0..n {
            let event = NewAuditEvent::new("access", format!("user-{}", i), "doc", "read");
            out.push(store.append(tenant, event).await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_three_event_chain_and_tamper_scenario() {
        let store = MemoryEventStore::new();
        let tenant = t("t1");
        let events = append_n(&store, &tenant, 3).await;

        assert_eq!(events[0].previous_hash, None);
        assert_eq!(events[1].previous_hash.as_ref(), Some(&events[0].current_hash));
        assert_eq!(events[2].previous_hash.as_ref(), Some(&events[1].current_hash));
        assert!(store.verify_integrity(&tenant).await.unwrap());

        store.tamper(&tenant, 2, |e| e.action = "delete".to_string()).await;
        assert!(!store.verify_integrity(&tenant).await.unwrap());
        match store.verify_chain(&tenant).await {
            Err(AuditError::ChainIntegrity(err)) => assert_eq!(err.index, 1),
            other => panic!("expected chain integrity error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_out_of_order_append_rejected() {
        let store = MemoryEventStore::new();
        let tenant = t("t1");
        let first = append_n(&store, &tenant, 2).await;

        let stale = NewAuditEvent::new("access", "bob", "doc", "read")
            .expecting_previous(first[0].current_hash.clone());
        let err = store.append(&tenant, stale).await.unwrap_err();
        assert!(matches!(err, AuditError::OutOfOrder { .. }));
        assert!(err.is_retryable());

        let fresh = NewAuditEvent::new("access", "bob", "doc", "read")
            .expecting_previous(first[1].current_hash.clone());
        assert_eq!(store.append(&tenant, fresh).await.unwrap().id, 3);
    }

    #[tokio::test]
    async fn test_concurrent_appends_never_fork() {
        let store = Arc::new(MemoryEventStore::new());
        let tenant = t("t1");

        let mut handles = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            let tenant = tenant.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append(&tenant, NewAuditEvent::new("access", format!("u{}", i), "doc", "read"))
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let events = store.collect(EventFilter::for_tenant(tenant.clone())).await.unwrap();
        assert_eq!(events.len(), 32);
        let previous: HashSet<_> = events.iter().map(|e| e.previous_hash.clone()).collect();
        assert_eq!(previous.len(), 32);
        assert!(store.verify_integrity(&tenant).await.unwrap());
    }

    #[tokio::test]
    async fn test_query_is_tenant_scoped_and_fails_closed() {
        let store = MemoryEventStore::new();
        append_n(&store, &t("a"), 2).await;
        append_n(&store, &t("b"), 3).await;

        let a = store.collect(EventFilter::for_tenant(t("a"))).await.unwrap();
        assert_eq!(a.len(), 2);
        assert!(a.iter().all(|e| e.tenant == t("a")));

        let unscoped: Result<Vec<_>> = store.query(EventFilter::default()).try_collect().await;
        assert!(matches!(unscoped, Err(AuditError::MissingTenant)));
    }

    #[tokio::test]
    async fn test_query_filters_and_restarts() {
        let store = MemoryEventStore::new();
        let tenant = t("t1");
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        for day in 0..5 {
            let event = NewAuditEvent::new("access", if day % 2 == 0 { "alice" } else { "bob" }, "doc", "read")
                .at(base + Duration::days(day));
            store.append(&tenant, event).await.unwrap();
        }

        let filter = EventFilter::for_tenant(tenant.clone())
            .user("alice")
            .between(Some(base + Duration::days(1)), None);
        let first: Vec<i64> = store.collect(filter.clone()).await.unwrap().iter().map(|e| e.id).collect();
        let second: Vec<i64> = store.collect(filter).await.unwrap().iter().map(|e| e.id).collect();
        assert_eq!(first, vec![3, 5]);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_prune_moves_anchor_and_keeps_chain_verifiable() {
        let store = MemoryEventStore::new();
        let tenant = t("t1");
        let base = Utc.with_ymd_and_hms(2015, 1, 1, 0, 0, 0).unwrap();
        for i in 0..4 {
            store
                .append(&tenant, NewAuditEvent::new("access", "alice", "doc", "read").at(base + Duration::days(i)))
                .await
                .unwrap();
        }

        // Exported out of order: id 3 is exported but id 2 is not, so only id 1 may go.
        let receipt = ExportState::Exported { receipt_id: "r1".to_string() };
        store.mark_export_state(&tenant, &[1, 3], receipt).await.unwrap();
        let cutoff = base + Duration::days(10);
        assert_eq!(store.prune_exported(&tenant, cutoff).await.unwrap(), 1);

        let snapshot = store.snapshot(&tenant).await.unwrap();
        assert_eq!(snapshot.anchor.as_ref().map(|a| a.last_pruned_id), Some(1));
        assert_eq!(snapshot.events.first().map(|e| e.id), Some(2));
        assert!(store.verify_integrity(&tenant).await.unwrap());

        let next = store
            .append(&tenant, NewAuditEvent::new("access", "alice", "doc", "read"))
            .await
            .unwrap();
        assert_eq!(next.id, 5);
    }

    #[tokio::test]
    async fn test_exported_state_never_downgraded() {
        let store = MemoryEventStore::new();
        let tenant = t("t1");
        append_n(&store, &tenant, 1).await;

        let exported = ExportState::Exported { receipt_id: "r1".to_string() };
        assert_eq!(store.mark_export_state(&tenant, &[1], exported.clone()).await.unwrap(), 1);
        assert_eq!(store.mark_export_state(&tenant, &[1], ExportState::ExportPending).await.unwrap(), 0);

        let records = store.retention_candidates(&tenant, Utc::now() + Duration::days(1), 0, usize::MAX).await.unwrap();
        assert_eq!(records[0].export_state, exported);
    }
}
