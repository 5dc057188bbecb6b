// Database schema for the SQLite audit event store

pub const AUDIT_EVENTS_SCHEMA: &str = include_str!("../../migrations/001_audit_events.sql");
