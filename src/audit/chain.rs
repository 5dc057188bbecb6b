//! Hash Chain
//!
//! Links every audit event to its predecessor with a SHA-256 digest so any
//! retroactive edit is detectable. The digest algorithm is fixed; a chain
//! that mixes digests cannot be verified.

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, error};

use crate::audit::event::{format_timestamp, AuditEvent, ChainAnchor, Metadata};
use crate::error::ChainIntegrityError;

/// Prefix naming the digest in every stored hash
pub const DIGEST_PREFIX: &str = "sha256:";

/// Fixed-order view of the hashed fields
#[derive(Serialize)]
struct CanonicalEvent<'a> {
    tenant: &'a str,
    id: i64,
    event_type: &'a str,
    user_id: &'a str,
    resource_id: &'a str,
    action: &'a str,
    timestamp: String,
    correlation_id: String,
    metadata: &'a Metadata,
}

pub struct HashChain;

impl HashChain {
    /// Canonical byte encoding of an event's hashed fields
    pub fn canonical_bytes(event: &AuditEvent) -> Vec<u8> {
        let canonical = CanonicalEvent {
            tenant: event.tenant.as_str(),
            id: event.id,
            event_type: &event.event_type,
            user_id: &event.user_id,
            resource_id: &event.resource_id,
            action: &event.action,
            timestamp: format_timestamp(&event.timestamp),
            correlation_id: event.correlation_id.hyphenated().to_string(),
            metadata: &event.metadata,
        };
        // Serializing borrowed strings and a BTreeMap of JSON values cannot fail.
        serde_json::to_vec(&canonical).unwrap_or_default()
    }

    /// Digest of an event's fields chained onto `previous_hash`.
    ///
    /// The genesis event chains onto the empty string.
    pub fn digest(event: &AuditEvent, previous_hash: Option<&str>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(Self::canonical_bytes(event));
        hasher.update(previous_hash.unwrap_or("").as_bytes());
        format!("{}{}", DIGEST_PREFIX, hex::encode(hasher.finalize()))
    }

    /// Replay the chain and stop at the first disagreement.
    ///
    /// `anchor` is the hash of the last pruned event when a prefix of the
    /// chain has been expired; `None` means the sequence starts at genesis.
    pub fn verify(
        events: &[AuditEvent],
        anchor: Option<&ChainAnchor>,
    ) -> Result<(), ChainIntegrityError> {
        let mut expected_previous: Option<String> = anchor.map(|a| a.last_pruned_hash.clone());
        let mut expected_id = anchor.map_or(1, |a| a.last_pruned_id + 1);

        for (index, event) in events.iter().enumerate() {
            let fail = |reason: String| {
                error!(tenant = %event.tenant, index, event_id = event.id, "{}", reason);
                ChainIntegrityError {
                    index,
                    event_id: event.id,
                    reason,
                }
            };

            if event.id != expected_id {
                return Err(fail(format!("expected id {}, found {}", expected_id, event.id)));
            }

            if event.previous_hash != expected_previous {
                return Err(fail(format!(
                    "previous_hash link broken: expected {}, found {}",
                    expected_previous.as_deref().unwrap_or("<genesis>"),
                    event.previous_hash.as_deref().unwrap_or("<genesis>")
                )));
            }

            let recomputed = Self::digest(event, event.previous_hash.as_deref());
            if recomputed != event.current_hash {
                return Err(fail(format!(
                    "hash mismatch: stored {}, recomputed {}",
                    event.current_hash, recomputed
                )));
            }

            expected_previous = Some(event.current_hash.clone());
            expected_id = event.id + 1;
        }

        debug!("Hash chain verified: {} events", events.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::event::NewAuditEvent;
    use crate::audit::tenant::TenantId;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn build_chain(count: usize) -> Vec<AuditEvent> {
        let tenant = TenantId::new("t1").unwrap();
        let mut events: Vec<AuditEvent> = Vec::new();
        for i in 0..count {
            let previous = events.last().map(|e| e.current_hash.clone());
            let event = NewAuditEvent::new("access", format!("user-{}", i), "doc", "read")
                .at(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, i as u32).unwrap())
                .seal(&tenant, i as i64 + 1, previous);
            events.push(event);
        }
        events
    }

    #[test]
    fn test_digest_is_deterministic() {
        let tenant = TenantId::new("t1").unwrap();
        let ts = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let correlation = Uuid::nil();
        let a = NewAuditEvent::new("access", "alice", "doc", "read")
            .at(ts)
            .correlated(correlation)
            .with_metadata("k", "v")
            .seal(&tenant, 1, None);
        let b = NewAuditEvent::new("access", "alice", "doc", "read")
            .at(ts)
            .correlated(correlation)
            .with_metadata("k", "v")
            .seal(&tenant, 1, None);

        assert_eq!(a.current_hash, b.current_hash);
        assert_eq!(a.current_hash.len(), DIGEST_PREFIX.len() + 64);
    }

    #[test]
    fn test_previous_hash_changes_digest() {
        let chain = build_chain(1);
        let event = &chain[0];
        assert_ne!(
            HashChain::digest(event, None),
            HashChain::digest(event, Some("sha256:00"))
        );
    }

    #[test]
    fn test_verify_valid_chain() {
        let chain = build_chain(5);
        assert!(HashChain::verify(&chain, None).is_ok());
        assert!(HashChain::verify(&[], None).is_ok());
    }

    #[test]
    fn test_verify_reports_first_tampered_index() {
        let mut chain = build_chain(3);
        chain[1].action = "delete".to_string();

        let err = HashChain::verify(&chain, None).unwrap_err();
        assert_eq!(err.index, 1);
        assert_eq!(err.event_id, 2);
    }

    #[test]
    fn test_verify_detects_broken_link() {
        let mut chain = build_chain(3);
        chain.remove(1);

        let err = HashChain::verify(&chain, None).unwrap_err();
        assert_eq!(err.index, 1);
    }

    #[test]
    fn test_verify_from_anchor() {
        let chain = build_chain(4);
        let anchor = ChainAnchor {
            last_pruned_id: chain[1].id,
            last_pruned_hash: chain[1].current_hash.clone(),
        };
        assert!(HashChain::verify(&chain[2..], Some(&anchor)).is_ok());
        // Without the anchor the suffix does not start at genesis.
        assert_eq!(HashChain::verify(&chain[2..], None).unwrap_err().index, 0);
    }
}
