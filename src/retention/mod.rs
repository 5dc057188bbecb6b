//! Tiered retention
//!
//! Tiers are a view derived from an event's age, never stored:
//! - Hot: up to 90 days
//! - Warm: up to 365 days
//! - Cold: up to 2555 days (about seven years)
//!
//! Anything older is expired. Expired events are exported and then pruned
//! by the [`RetentionManager`].

pub mod manager;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::AuditEvent;
use crate::error::{AuditError, Result};

pub use manager::{RetentionManager, SweepReport, TierSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionTier {
    Hot,
    Warm,
    Cold,
}

impl RetentionTier {
    pub fn name(&self) -> &'static str {
        match self {
            RetentionTier::Hot => "hot",
            RetentionTier::Warm => "warm",
            RetentionTier::Cold => "cold",
        }
    }
}

impl std::fmt::Display for RetentionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Classification of an event's age: a live tier, or past every tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RetentionClass {
    Tier(RetentionTier),
    Expired,
}

/// Upper age bound of each tier, in days
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub hot_days: u32,
    pub warm_days: u32,
    pub cold_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            hot_days: 90,
            warm_days: 365,
            cold_days: 2555,
        }
    }
}

impl RetentionPolicy {
    pub fn new(hot_days: u32, warm_days: u32, cold_days: u32) -> Result<Self> {
        let policy = Self {
            hot_days,
            warm_days,
            cold_days,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hot_days == 0 {
            return Err(AuditError::Config("hot tier must be at least one day".to_string()));
        }
        if !(self.hot_days < self.warm_days && self.warm_days < self.cold_days) {
            return Err(AuditError::Config(format!(
                "retention tiers must be strictly increasing (hot {} < warm {} < cold {})",
                self.hot_days, self.warm_days, self.cold_days
            )));
        }
        Ok(())
    }

    /// Events strictly older than this instant are expired
    pub fn expiry_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(i64::from(self.cold_days))
    }

    pub fn classify_age(&self, age: Duration) -> RetentionClass {
        // Future timestamps count as brand new.
        let age = age.max(Duration::zero());
        if age <= Duration::days(i64::from(self.hot_days)) {
            RetentionClass::Tier(RetentionTier::Hot)
        } else if age <= Duration::days(i64::from(self.warm_days)) {
            RetentionClass::Tier(RetentionTier::Warm)
        } else if age <= Duration::days(i64::from(self.cold_days)) {
            RetentionClass::Tier(RetentionTier::Cold)
        } else {
            RetentionClass::Expired
        }
    }

    pub fn classify_event(&self, event: &AuditEvent, now: DateTime<Utc>) -> RetentionClass {
        self.classify_age(now - event.timestamp)
    }

    /// Tier of an event, with expired events reported as cold
    pub fn classify(&self, event: &AuditEvent, now: DateTime<Utc>) -> RetentionTier {
        match self.classify_event(event, now) {
            RetentionClass::Tier(tier) => tier,
            RetentionClass::Expired => RetentionTier::Cold,
        }
    }
}
