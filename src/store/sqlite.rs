//! SQLite audit event store
//!
//! Durable backend: an append is a committed transaction under
//! `synchronous = FULL`. Per-tenant ordering is enforced twice, by an
//! in-process lock per tenant and by `UNIQUE` constraints that reject a
//! second event claiming the same id or predecessor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::event::{format_bound, format_timestamp, parse_timestamp};
use crate::audit::{AuditEvent, ChainAnchor, ExportState, Metadata, NewAuditEvent, TenantId};
use crate::error::{AuditError, Result};
use crate::store::schema::AUDIT_EVENTS_SCHEMA;
use crate::store::{AuditEventStore, ChainSnapshot, EventFilter, EventStream, RetentionRecord};

const EVENT_COLUMNS: &str = "tenant, id, event_type, user_id, resource_id, action, timestamp, \
     correlation_id, metadata, previous_hash, current_hash, export_state, export_detail";

const DEFAULT_PAGE_SIZE: i64 = 500;

pub struct SqliteEventStore {
    pool: SqlitePool,
    tenant_locks: Mutex<HashMap<TenantId, Arc<tokio::sync::Mutex<()>>>>,
    page_size: i64,
}

impl SqliteEventStore {
    /// Connect to (creating if missing) the database at `url` and apply the schema
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self::from_pool(pool);
        store.run_migrations().await?;
        info!("Connected SQLite audit store at {}", url);
        Ok(store)
    }

    /// Private in-memory database. A single connection keeps every query on
    /// the same database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self::from_pool(pool);
        store.run_migrations().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            tenant_locks: Mutex::new(HashMap::new()),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::raw_sql(AUDIT_EVENTS_SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    fn tenant_lock(&self, tenant: &TenantId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .tenant_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(tenant.clone()).or_default().clone()
    }

    async fn next_page(
        pool: &SqlitePool,
        filter: &EventFilter,
        mut cursor: PageCursor,
        page_size: i64,
    ) -> Result<Option<(Vec<AuditEvent>, PageCursor)>> {
        if cursor.exhausted {
            return Ok(None);
        }
        let tenant = filter.require_tenant()?;

        // Rows appended after the scan started are outside its snapshot.
        let high_water = match cursor.high_water {
            Some(high_water) => high_water,
            None => {
                let max: Option<i64> =
                    sqlx::query_scalar("SELECT MAX(id) FROM audit_events WHERE tenant = ?")
                        .bind(tenant.as_str())
                        .fetch_one(pool)
                        .await?;
                let high_water = max.unwrap_or(0);
                cursor.high_water = Some(high_water);
                high_water
            }
        };

        let page =
            Self::fetch_page(pool, filter, tenant, cursor.after_id, high_water, page_size).await?;
        if (page.len() as i64) < page_size {
            cursor.exhausted = true;
        }
        match page.last() {
            Some(last) => cursor.after_id = last.id,
            None => return Ok(None),
        }
        Ok(Some((page, cursor)))
    }

    async fn fetch_page(
        pool: &SqlitePool,
        filter: &EventFilter,
        tenant: &TenantId,
        after_id: i64,
        high_water: i64,
        limit: i64,
    ) -> Result<Vec<AuditEvent>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT ");
        builder.push(EVENT_COLUMNS);
        builder.push(" FROM audit_events WHERE tenant = ");
        builder.push_bind(tenant.as_str());
        builder.push(" AND id > ");
        builder.push_bind(after_id);
        builder.push(" AND id <= ");
        builder.push_bind(high_water);

        if let Some(user_id) = &filter.user_id {
            builder.push(" AND user_id = ");
            builder.push_bind(user_id.clone());
        }
        if let Some(correlation_id) = filter.correlation_id {
            builder.push(" AND correlation_id = ");
            builder.push_bind(correlation_id.hyphenated().to_string());
        }
        if let Some(event_type) = &filter.event_type {
            builder.push(" AND event_type = ");
            builder.push_bind(event_type.clone());
        }
        if let Some(from) = filter.from {
            builder.push(" AND timestamp >= ");
            builder.push_bind(format_bound(&from));
        }
        if let Some(to) = filter.to {
            builder.push(" AND timestamp < ");
            builder.push_bind(format_bound(&to));
        }
        builder.push(" ORDER BY id ASC LIMIT ");
        builder.push_bind(limit);

        let rows = builder.build().fetch_all(pool).await?;
        rows.iter().map(row_to_event).collect()
    }
}

fn row_to_event(row: &SqliteRow) -> Result<AuditEvent> {
    let tenant: String = row.try_get("tenant")?;
    let timestamp: String = row.try_get("timestamp")?;
    let correlation_id: String = row.try_get("correlation_id")?;
    let metadata: String = row.try_get("metadata")?;

    Ok(AuditEvent {
        tenant: TenantId::new(tenant)?,
        id: row.try_get("id")?,
        event_type: row.try_get("event_type")?,
        user_id: row.try_get("user_id")?,
        resource_id: row.try_get("resource_id")?,
        action: row.try_get("action")?,
        timestamp: parse_timestamp(&timestamp)?,
        correlation_id: Uuid::parse_str(&correlation_id)
            .map_err(|e| AuditError::Database(format!("invalid correlation id: {}", e)))?,
        metadata: serde_json::from_str::<Metadata>(&metadata)?,
        previous_hash: row.try_get("previous_hash")?,
        current_hash: row.try_get("current_hash")?,
    })
}

fn row_to_export_state(row: &SqliteRow) -> Result<ExportState> {
    let label: String = row.try_get("export_state")?;
    let detail: Option<String> = row.try_get("export_detail")?;
    ExportState::from_parts(&label, detail)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

struct PageCursor {
    after_id: i64,
    high_water: Option<i64>,
    exhausted: bool,
}

#[async_trait]
impl AuditEventStore for SqliteEventStore {
    async fn append(&self, tenant: &TenantId, event: NewAuditEvent) -> Result<AuditEvent> {
        event.validate()?;

        let lock = self.tenant_lock(tenant);
        let _guard = lock.lock().await;

        let mut tx = self.pool.begin().await?;

        let tail: Option<(i64, String)> = sqlx::query_as(
            "SELECT id, current_hash FROM audit_events WHERE tenant = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(tenant.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let tail = match tail {
            Some(tail) => Some(tail),
            None => {
                sqlx::query_as(
                    "SELECT last_pruned_id, last_pruned_hash FROM chain_anchors WHERE tenant = ?",
                )
                .bind(tenant.as_str())
                .fetch_optional(&mut *tx)
                .await?
            }
        };
        let (tail_id, tail_hash) = match tail {
            Some((id, hash)) => (id, Some(hash)),
            None => (0, None),
        };

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
        let metadata = serde_json::to_string(&sealed.metadata)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO audit_events (
                tenant, id, event_type, user_id, resource_id, action, timestamp,
                correlation_id, metadata, previous_hash, current_hash
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(sealed.tenant.as_str())
        .bind(sealed.id)
        .bind(&sealed.event_type)
        .bind(&sealed.user_id)
        .bind(&sealed.resource_id)
        .bind(&sealed.action)
        .bind(format_timestamp(&sealed.timestamp))
        .bind(sealed.correlation_id.hyphenated().to_string())
        .bind(metadata)
        .bind(&sealed.previous_hash)
        .bind(&sealed.current_hash)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            // Another writer outside this process claimed the position first.
            Err(e) if is_unique_violation(&e) => {
                return Err(AuditError::OutOfOrder {
                    tenant: tenant.to_string(),
                    expected: sealed.previous_hash.unwrap_or_else(|| "<genesis>".to_string()),
                    actual: "<concurrently advanced>".to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        tx.commit().await?;
        debug!("Appended audit event {}", sealed.summary());
        Ok(sealed)
    }

    fn query(&self, filter: EventFilter) -> EventStream<'_> {
        let pool = self.pool.clone();
        let page_size = self.page_size;
        let cursor = PageCursor {
            after_id: 0,
            high_water: None,
            exhausted: false,
        };

        let pages = stream::try_unfold(cursor, move |cursor| {
            let pool = pool.clone();
            let filter = filter.clone();
            async move {
                let next = Self::next_page(&pool, &filter, cursor, page_size).await;
                next.map(|next| {
                    next.map(|(page, cursor)| {
                        (stream::iter(page.into_iter().map(Ok::<_, AuditError>)), cursor)
                    })
                })
            }
        });

        pages.try_flatten().boxed()
    }

    async fn tail(&self, tenant: &TenantId) -> Result<Option<AuditEvent>> {
        let sql = format!(
            "SELECT {} FROM audit_events WHERE tenant = ? ORDER BY id DESC LIMIT 1",
            EVENT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(tenant.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_event).transpose()
    }

    async fn snapshot(&self, tenant: &TenantId) -> Result<ChainSnapshot> {
        // One read transaction so the anchor and the events agree.
        let mut tx = self.pool.begin().await?;

        let anchor: Option<(i64, String)> = sqlx::query_as(
            "SELECT last_pruned_id, last_pruned_hash FROM chain_anchors WHERE tenant = ?",
        )
        .bind(tenant.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let sql = format!(
            "SELECT {} FROM audit_events WHERE tenant = ? ORDER BY id ASC",
            EVENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(tenant.as_str())
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(ChainSnapshot {
            anchor: anchor.map(|(last_pruned_id, last_pruned_hash)| ChainAnchor {
                last_pruned_id,
                last_pruned_hash,
            }),
            events: rows.iter().map(row_to_event).collect::<Result<Vec<_>>>()?,
        })
    }

    async fn retention_candidates(
        &self,
        tenant: &TenantId,
        cutoff: DateTime<Utc>,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<RetentionRecord>> {
        let sql = format!(
            "SELECT {} FROM audit_events WHERE tenant = ? AND timestamp < ? AND id > ? \
             ORDER BY id ASC LIMIT ?",
            EVENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(tenant.as_str())
            .bind(format_bound(&cutoff))
            .bind(after_id)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(RetentionRecord {
                    event: row_to_event(row)?,
                    export_state: row_to_export_state(row)?,
                })
            })
            .collect()
    }

    async fn mark_export_state(
        &self,
        tenant: &TenantId,
        ids: &[i64],
        state: ExportState,
    ) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let lock = self.tenant_lock(tenant);
        let _guard = lock.lock().await;

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE audit_events SET export_state = ");
        builder.push_bind(state.label());
        builder.push(", export_detail = ");
        builder.push_bind(state.detail().map(str::to_string));
        builder.push(" WHERE tenant = ");
        builder.push_bind(tenant.as_str());
        if !state.is_exported() {
            builder.push(" AND export_state != 'exported'");
        }
        builder.push(" AND id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected() as usize)
    }

    async fn prune_exported(&self, tenant: &TenantId, cutoff: DateTime<Utc>) -> Result<usize> {
        let lock = self.tenant_lock(tenant);
        let _guard = lock.lock().await;

        let mut tx = self.pool.begin().await?;

        // First event that must stay; everything before it is exported and expired.
        let boundary: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MIN(id) FROM audit_events
            WHERE tenant = ? AND NOT (export_state = 'exported' AND timestamp < ?)
            "#,
        )
        .bind(tenant.as_str())
        .bind(format_bound(&cutoff))
        .fetch_one(&mut *tx)
        .await?;
        let boundary = boundary.unwrap_or(i64::MAX);

        let last: Option<(i64, String)> = sqlx::query_as(
            "SELECT id, current_hash FROM audit_events WHERE tenant = ? AND id < ? ORDER BY id DESC LIMIT 1",
        )
        .bind(tenant.as_str())
        .bind(boundary)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((last_id, last_hash)) = last else {
            return Ok(0);
        };

        let deleted = sqlx::query("DELETE FROM audit_events WHERE tenant = ? AND id < ?")
            .bind(tenant.as_str())
            .bind(boundary)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        sqlx::query(
            r#"
            INSERT INTO chain_anchors (tenant, last_pruned_id, last_pruned_hash, pruned_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (tenant) DO UPDATE SET
                last_pruned_id = excluded.last_pruned_id,
                last_pruned_hash = excluded.last_pruned_hash,
                pruned_at = excluded.pruned_at
            "#,
        )
        .bind(tenant.as_str())
        .bind(last_id)
        .bind(&last_hash)
        .bind(format_timestamp(&Utc::now()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(%tenant, pruned = deleted, anchor_id = last_id, "Pruned exported audit events");
        Ok(deleted as usize)
    }

    async fn tenants(&self) -> Result<Vec<TenantId>> {
        let raw: Vec<String> = sqlx::query_scalar(
            "SELECT tenant FROM audit_events UNION SELECT tenant FROM chain_anchors ORDER BY 1",
        )
        .fetch_all(&self.pool)
        .await?;
        raw.into_iter().map(TenantId::new).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(raw: &str) -> TenantId {
        TenantId::new(raw).unwrap()
    }

    #[tokio::test]
    async fn test_append_and_reload_hash_is_stable() {
        let store = SqliteEventStore::in_memory().await.unwrap();
        let tenant = t("t1");

        let appended = store
            .append(
                &tenant,
                NewAuditEvent::new("access", "alice", "doc-1", "read")
                    .with_metadata("ip", "10.0.0.1")
                    .with_metadata("nested", serde_json::json!({"b": 1, "a": [1, 2]})),
            )
            .await
            .unwrap();

        let reloaded = store.tail(&tenant).await.unwrap().unwrap();
        assert_eq!(appended, reloaded);
        assert!(reloaded.verify_hash());
    }

    #[tokio::test]
    async fn test_paged_query_returns_all_in_order() {
        let store = SqliteEventStore::in_memory().await.unwrap().with_page_size(2);
        let tenant = t("t1");
        for i in 0..5 {
            store
                .append(&tenant, NewAuditEvent::new("access", format!("u{}", i), "doc", "read"))
                .await
                .unwrap();
        }

        let ids: Vec<i64> = store
            .collect(EventFilter::for_tenant(tenant))
            .await
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_retention_candidates_page_by_id() {
        let store = SqliteEventStore::in_memory().await.unwrap();
        let tenant = t("t1");
        let base = Utc.with_ymd_and_hms(2015, 1, 1, 0, 0, 0).unwrap();
        for i in 0..5 {
            store
                .append(&tenant, NewAuditEvent::new("access", "alice", "doc", "read").at(base + Duration::days(i)))
                .await
                .unwrap();
        }
        store
            .append(&tenant, NewAuditEvent::new("access", "alice", "doc", "read").at(base + Duration::days(400)))
            .await
            .unwrap();

        let cutoff = base + Duration::days(30);
        let mut pages = Vec::new();
        let mut after_id = 0;
        loop {
            let page = store.retention_candidates(&tenant, cutoff, after_id, 2).await.unwrap();
            let Some(last) = page.last() else { break };
            after_id = last.event.id;
            pages.push(page.iter().map(|r| r.event.id).collect::<Vec<_>>());
        }
        assert_eq!(pages, vec![vec![1, 2], vec![3, 4], vec![5]]);
    }

    #[tokio::test]
    async fn test_prune_writes_anchor() {
        let store = SqliteEventStore::in_memory().await.unwrap();
        let tenant = t("t1");
        let base = Utc.with_ymd_and_hms(2015, 1, 1, 0, 0, 0).unwrap();
        for i in 0..3 {
            store
                .append(&tenant, NewAuditEvent::new("access", "alice", "doc", "read").at(base + Duration::days(i)))
                .await
                .unwrap();
        }

        let exported = ExportState::Exported { receipt_id: "r1".to_string() };
        store.mark_export_state(&tenant, &[1, 2], exported).await.unwrap();
        let pruned = store.prune_exported(&tenant, base + Duration::days(30)).await.unwrap();
        assert_eq!(pruned, 2);

        let snapshot = store.snapshot(&tenant).await.unwrap();
        assert_eq!(snapshot.anchor.map(|a| a.last_pruned_id), Some(2));
        assert_eq!(snapshot.events.len(), 1);
        assert!(store.verify_integrity(&tenant).await.unwrap());
        assert_eq!(store.tenants().await.unwrap(), vec![tenant]);
    }
}
