//! Environment abstraction (time, randomness).
//!
//! Records carry wall-clock timestamps because they outlive the process, so
//! the environment hands out milliseconds since the Unix epoch rather than
//! monotonic instants.

use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use didcomm_proto::{ConnectionId, ExchangeId};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Wrap a raw millisecond value
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Raw millisecond value
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future
    pub fn saturating_since(self, earlier: Self) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }

    /// This timestamp moved forward by `duration`
    #[must_use]
    pub fn saturating_add(self, duration: Duration) -> Self {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(millis))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Source of time and randomness for state machines.
///
/// Production uses [`SystemEnv`]; tests supply a manual clock and a seeded
/// RNG so runs are reproducible.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Current wall-clock time
    fn now(&self) -> Timestamp;

    /// Fill `buffer` with random bytes
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Fresh connection record id
    fn connection_id(&self) -> ConnectionId {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        ConnectionId::from_bytes(bytes)
    }

    /// Fresh exchange record id
    fn exchange_id(&self) -> ExchangeId {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        ExchangeId::from_bytes(bytes)
    }
}

/// System clock and thread-local RNG
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl Environment for SystemEnv {
    fn now(&self) -> Timestamp {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        Timestamp(millis)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        rand::thread_rng().fill_bytes(buffer);
    }
}
