//! Audit Event
//!
//! Immutable, hash-chained audit records and the caller-facing builder used
//! to append them.

use chrono::{DateTime, Datelike, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::audit::tenant::TenantId;
use crate::error::AuditError;

/// Open key-value metadata. BTreeMap keeps the key order canonical.
pub type Metadata = BTreeMap<String, Value>;

/// Fixed-width UTC rendering used both for hashing and for storage, so
/// stored timestamps sort lexicographically.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Years that render as exactly four digits
pub const MIN_STORED_YEAR: i32 = 0;
pub const MAX_STORED_YEAR: i32 = 9999;

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn is_storable(ts: &DateTime<Utc>) -> bool {
    (MIN_STORED_YEAR..=MAX_STORED_YEAR).contains(&ts.year())
}

/// Render a query bound, clamping it into the storable range so the string
/// comparison against stored timestamps keeps its meaning.
pub fn format_bound(ts: &DateTime<Utc>) -> String {
    if ts.year() > MAX_STORED_YEAR {
        "9999-12-31T23:59:59.999999Z".to_string()
    } else if ts.year() < MIN_STORED_YEAR {
        "0000-01-01T00:00:00.000000Z".to_string()
    } else {
        format_timestamp(ts)
    }
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, AuditError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| AuditError::Database(format!("invalid stored timestamp {:?}: {}", raw, e)))
}

/// Stored audit event with its chain links
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub tenant: TenantId,
    pub id: i64,
    pub event_type: String,
    pub user_id: String,
    pub resource_id: String,
    pub action: String,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Uuid,
    pub metadata: Metadata,
    pub previous_hash: Option<String>,
    pub current_hash: String,
}

impl AuditEvent {
    /// Recompute this event's digest and compare it with the stored one
    pub fn verify_hash(&self) -> bool {
        crate::audit::chain::HashChain::digest(self, self.previous_hash.as_deref())
            == self.current_hash
    }

    pub fn summary(&self) -> String {
        format!(
            "[{}#{}] {} {} by {} on {}",
            self.tenant, self.id, self.event_type, self.action, self.user_id, self.resource_id
        )
    }
}

/// Fields supplied by the caller when appending an event.
///
/// The store assigns `id`, `previous_hash` and `current_hash`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAuditEvent {
    pub event_type: String,
    pub user_id: String,
    pub resource_id: String,
    pub action: String,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Uuid,
    pub metadata: Metadata,
    /// When set, the append fails with `OutOfOrder` unless the tenant's tail
    /// hash equals this value.
    pub expected_previous_hash: Option<String>,
}

impl NewAuditEvent {
    pub fn new(
        event_type: impl Into<String>,
        user_id: impl Into<String>,
        resource_id: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            user_id: user_id.into(),
            resource_id: resource_id.into(),
            action: action.into(),
            timestamp: Utc::now(),
            correlation_id: Uuid::new_v4(),
            metadata: Metadata::new(),
            expected_previous_hash: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn correlated(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn expecting_previous(mut self, hash: impl Into<String>) -> Self {
        self.expected_previous_hash = Some(hash.into());
        self
    }

    /// Reject events that would be useless in an audit trail
    pub fn validate(&self) -> Result<(), AuditError> {
        for (field, value) in [
            ("event_type", &self.event_type),
            ("user_id", &self.user_id),
            ("action", &self.action),
        ] {
            if value.trim().is_empty() {
                return Err(AuditError::invalid_event(format!("{} must not be blank", field)));
            }
        }
        if !is_storable(&self.timestamp) {
            return Err(AuditError::invalid_event(format!(
                "timestamp {} is outside years {:04}..={}",
                self.timestamp, MIN_STORED_YEAR, MAX_STORED_YEAR
            )));
        }
        Ok(())
    }

    /// Bind the caller's fields to a chain position and seal them.
    pub(crate) fn seal(
        self,
        tenant: &TenantId,
        id: i64,
        previous_hash: Option<String>,
    ) -> AuditEvent {
        let mut event = AuditEvent {
            tenant: tenant.clone(),
            id,
            event_type: self.event_type,
            user_id: self.user_id,
            resource_id: self.resource_id,
            action: self.action,
            // Storage keeps microseconds; truncate before hashing so a
            // reloaded event hashes identically.
            timestamp: self.timestamp.trunc_subsecs(6),
            correlation_id: self.correlation_id,
            metadata: self.metadata,
            previous_hash,
            current_hash: String::new(),
        };
        event.current_hash =
            crate::audit::chain::HashChain::digest(&event, event.previous_hash.as_deref());
        event
    }
}

/// Retention bookkeeping kept beside an event. Never part of the hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExportState {
    Retained,
    ExportPending,
    Exported { receipt_id: String },
    ManualReview { reason: String },
}

impl ExportState {
    pub fn label(&self) -> &'static str {
        match self {
            ExportState::Retained => "retained",
            ExportState::ExportPending => "export_pending",
            ExportState::Exported { .. } => "exported",
            ExportState::ManualReview { .. } => "manual_review",
        }
    }

    /// Detail column value (receipt id or review reason)
    pub fn detail(&self) -> Option<&str> {
        match self {
            ExportState::Exported { receipt_id } => Some(receipt_id),
            ExportState::ManualReview { reason } => Some(reason),
            _ => None,
        }
    }

    pub fn from_parts(label: &str, detail: Option<String>) -> Result<Self, AuditError> {
        match label {
            "retained" => Ok(ExportState::Retained),
            "export_pending" => Ok(ExportState::ExportPending),
            "exported" => Ok(ExportState::Exported {
                receipt_id: detail.unwrap_or_default(),
            }),
            "manual_review" => Ok(ExportState::ManualReview {
                reason: detail.unwrap_or_default(),
            }),
            other => Err(AuditError::Database(format!("unknown export state {}", other))),
        }
    }

    pub fn is_exported(&self) -> bool {
        matches!(self, ExportState::Exported { .. })
    }
}

/// Tail of a tenant's chain after expired events have been pruned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainAnchor {
    pub last_pruned_id: i64,
    pub last_pruned_hash: String,
}
