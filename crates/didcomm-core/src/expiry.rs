//! Inactivity limits for records.
//!
//! A record expires when it has not transitioned for longer than its limit.
//! Terminal records never expire. `None` disables expiry for that record type.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::env::Timestamp;

/// Default inactivity limit for unfinished connections (10 minutes)
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(600);

/// Default inactivity limit for unfinished credential exchanges (30 minutes)
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(1800);

/// How long a record may stall before it is abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryPolicy {
    /// Limit for connections outside `Completed`/`Abandoned`
    pub connection_timeout: Option<Duration>,
    /// Limit for credential and proof exchanges outside `Acknowledged`/`Abandoned`
    pub exchange_timeout: Option<Duration>,
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self {
            connection_timeout: Some(DEFAULT_CONNECTION_TIMEOUT),
            exchange_timeout: Some(DEFAULT_EXCHANGE_TIMEOUT),
        }
    }
}

impl ExpiryPolicy {
    /// Policy that never expires anything
    pub const fn disabled() -> Self {
        Self { connection_timeout: None, exchange_timeout: None }
    }

    /// `Some(elapsed)` if a connection last updated at `updated_at` is stale
    pub fn connection_expired(&self, updated_at: Timestamp, now: Timestamp) -> Option<Duration> {
        Self::expired(self.connection_timeout, updated_at, now)
    }

    /// `Some(elapsed)` if a credential or proof exchange last updated at `updated_at` is stale
    pub fn exchange_expired(&self, updated_at: Timestamp, now: Timestamp) -> Option<Duration> {
        Self::expired(self.exchange_timeout, updated_at, now)
    }

    fn expired(limit: Option<Duration>, updated_at: Timestamp, now: Timestamp) -> Option<Duration> {
        let limit = limit?;
        let elapsed = now.saturating_since(updated_at);
        (elapsed > limit).then_some(elapsed)
    }
}
