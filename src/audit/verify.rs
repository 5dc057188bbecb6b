//! Audit Trail Verification Report
//!
//! Non-failing inspection of a tenant's chain for operators: unlike
//! [`HashChain::verify`] it keeps scanning after the first problem and
//! collects everything it finds.

use chrono::Duration;
use serde::Serialize;
use tracing::info;

use crate::audit::chain::HashChain;
use crate::audit::event::{AuditEvent, ChainAnchor};
use crate::error::ChainIntegrityError;

/// Verification result with detailed information
#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub event_count: usize,
    pub first_failure: Option<ChainFailure>,
    pub tampered_indexes: Vec<usize>,
    pub gaps: Vec<GapInfo>,
    pub timestamp_regressions: Vec<usize>,
    pub head_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainFailure {
    pub index: usize,
    pub event_id: i64,
    pub reason: String,
}

impl From<ChainIntegrityError> for ChainFailure {
    fn from(err: ChainIntegrityError) -> Self {
        Self {
            index: err.index,
            event_id: err.event_id,
            reason: err.reason,
        }
    }
}

impl VerificationReport {
    pub fn build(events: &[AuditEvent], anchor: Option<&ChainAnchor>, quiet_period: Duration) -> Self {
        let first_failure = HashChain::verify(events, anchor).err().map(ChainFailure::from);
        let report = Self {
            event_count: events.len(),
            first_failure,
            tampered_indexes: find_tampered_events(events),
            gaps: detect_gaps(events, anchor, quiet_period),
            timestamp_regressions: find_timestamp_regressions(events),
            head_hash: events.last().map(|e| e.current_hash.clone()),
        };
        info!(
            events = report.event_count,
            valid = report.is_valid(),
            "Built audit trail verification report"
        );
        report
    }

    /// The chain verifies. Timestamp regressions and quiet periods are
    /// reported but do not invalidate it.
    pub fn is_valid(&self) -> bool {
        self.first_failure.is_none()
    }

    pub fn summary(&self) -> String {
        match &self.first_failure {
            None => format!("Audit trail is valid ({} events)", self.event_count),
            Some(failure) => format!(
                "Audit trail is invalid ({} events): first failure at index {} (event id {}): {}",
                self.event_count, failure.index, failure.event_id, failure.reason
            ),
        }
    }
}

/// Indexes whose stored hash no longer matches their own fields
pub fn find_tampered_events(events: &[AuditEvent]) -> Vec<usize> {
    events
        .iter()
        .enumerate()
        .filter(|(_, event)| !event.verify_hash())
        .map(|(i, _)| i)
        .collect()
}

pub fn find_timestamp_regressions(events: &[AuditEvent]) -> Vec<usize> {
    events
        .windows(2)
        .enumerate()
        .filter(|(_, pair)| pair[1].timestamp < pair[0].timestamp)
        .map(|(i, _)| i + 1)
        .collect()
}

/// Detect broken links and quiet periods between consecutive events
pub fn detect_gaps(
    events: &[AuditEvent],
    anchor: Option<&ChainAnchor>,
    quiet_period: Duration,
) -> Vec<GapInfo> {
    let mut gaps = Vec::new();

    if let (Some(anchor), Some(first)) = (anchor, events.first()) {
        if first.previous_hash.as_deref() != Some(anchor.last_pruned_hash.as_str()) {
            gaps.push(GapInfo {
                start_index: 0,
                end_index: 0,
                gap_type: GapType::HashGap,
                description: format!(
                    "First retained event {} does not link to pruned event {}",
                    first.id, anchor.last_pruned_id
                ),
            });
        }
    }

    for (i, pair) in events.windows(2).enumerate() {
        let (prev, curr) = (&pair[0], &pair[1]);

        if curr.previous_hash.as_deref() != Some(prev.current_hash.as_str()) {
            gaps.push(GapInfo {
                start_index: i,
                end_index: i + 1,
                gap_type: GapType::HashGap,
                description: format!("Hash chain gap between events {} and {}", prev.id, curr.id),
            });
        }

        if curr.id != prev.id + 1 {
            gaps.push(GapInfo {
                start_index: i,
                end_index: i + 1,
                gap_type: GapType::IdGap,
                description: format!("Missing ids between {} and {}", prev.id, curr.id),
            });
        }

        let elapsed = curr.timestamp - prev.timestamp;
        if elapsed > quiet_period {
            gaps.push(GapInfo {
                start_index: i,
                end_index: i + 1,
                gap_type: GapType::TimeGap,
                description: format!(
                    "Time gap of {} hours between events {} and {}",
                    elapsed.num_hours(),
                    prev.id,
                    curr.id
                ),
            });
        }
    }

    gaps
}

/// Information about a gap in the audit trail
#[derive(Debug, Clone, Serialize)]
pub struct GapInfo {
    pub start_index: usize,
    pub end_index: usize,
    pub gap_type: GapType,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GapType {
    TimeGap,
    HashGap,
    IdGap,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::event::NewAuditEvent;
    use crate::audit::tenant::TenantId;
    use chrono::{TimeZone, Utc};

    fn chain_with_times(hours: &[i64]) -> Vec<AuditEvent> {
        let tenant = TenantId::new("t1").unwrap();
        let base = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let mut events: Vec<AuditEvent> = Vec::new();
        for (i, h) in hours.iter().enumerate() {
            let previous = events.last().map(|e| e.current_hash.clone());
            events.push(
                NewAuditEvent::new("access", "alice", "doc", "read")
                    .at(base + Duration::hours(*h))
                    .seal(&tenant, i as i64 + 1, previous),
            );
        }
        events
    }

    #[test]
    fn test_valid_report() {
        let events = chain_with_times(&[0, 0, 1]);
        let report = VerificationReport::build(&events, None, Duration::hours(24));
        assert!(report.is_valid());
        assert!(report.gaps.is_empty());
        assert!(report.summary().contains("valid (3 events)"));
        assert_eq!(report.head_hash.as_deref(), Some(events[2].current_hash.as_str()));
    }

    #[test]
    fn test_report_collects_all_tampered_events() {
        let mut events = chain_with_times(&[0, 1, 2, 3]);
        events[1].user_id = "mallory".to_string();
        events[3].resource_id = "other".to_string();

        let report = VerificationReport::build(&events, None, Duration::hours(24));
        assert!(!report.is_valid());
        assert_eq!(report.first_failure.as_ref().map(|f| f.index), Some(1));
        assert_eq!(report.tampered_indexes, vec![1, 3]);
    }

    #[test]
    fn test_time_gaps_and_regressions() {
        let events = chain_with_times(&[0, 48, 47]);
        let report = VerificationReport::build(&events, None, Duration::hours(24));

        assert!(report.is_valid());
        assert_eq!(report.timestamp_regressions, vec![2]);
        assert!(report.gaps.iter().any(|g| g.gap_type == GapType::TimeGap));
    }
}
