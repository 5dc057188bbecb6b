//! Audit Trail Core
//!
//! Tamper-evident audit events linked by SHA-256 hash chains, per-tenant
//! identifiers, Merkle roots for exported batches and operator-facing
//! verification reports.

pub mod chain;
pub mod event;
pub mod merkle;
pub mod tenant;
pub mod verify;

pub use chain::HashChain;
pub use event::{AuditEvent, ChainAnchor, ExportState, Metadata, NewAuditEvent};
pub use merkle::{events_merkle_root, merkle_root, MerkleProof};
pub use tenant::TenantId;
pub use verify::{GapInfo, GapType, VerificationReport};
