//! Agent configuration.

use std::time::Duration;

use didcomm_core::ExpiryPolicy;

/// Runtime configuration for one agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Label sent in invitations and connection requests
    pub label: String,

    /// Base of invitation URLs; `didcomm://<agent id>` when unset
    pub endpoint: Option<String>,

    /// Number of worker lanes
    pub workers: usize,

    /// Envelopes buffered per lane before intake waits
    pub lane_capacity: usize,

    /// Answer invitations and requests without a local decision
    pub auto_accept_connections: bool,

    /// Answer proposals and offers without a local decision
    pub auto_respond_credentials: bool,

    /// Answer presentation requests from the wallet without a local decision
    pub auto_present_proofs: bool,

    /// Inactivity limits for records
    pub expiry: ExpiryPolicy,

    /// How often the expiry sweeper runs
    pub sweep_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            label: "didcomm-agent".to_string(),
            endpoint: None,
            workers: 4,
            lane_capacity: 64,
            auto_accept_connections: true,
            auto_respond_credentials: true,
            auto_present_proofs: true,
            expiry: ExpiryPolicy::default(),
            sweep_interval: Duration::from_secs(5),
        }
    }
}
