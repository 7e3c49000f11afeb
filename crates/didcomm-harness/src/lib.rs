//! Deterministic simulation harness for DIDComm agents.
//!
//! Two ways to drive agents without real I/O:
//!
//! - [`scenario`]: agents in one process, envelopes delivered one at a time
//!   from a FIFO queue. Every run with the same inputs takes the same path,
//!   and the mandatory oracle inspects the final [`World`].
//! - [`SimTransport`]: the agent's real run loop over turmoil's simulated
//!   TCP, for latency, loss and partition tests.
//!
//! [`SimEnv`] supplies a manual clock and seeded randomness to both, and
//! [`model`] holds the reference model used by the model-based tests.

pub mod model;
pub mod scenario;
pub mod sim_env;
pub mod sim_transport;

pub use model::{ModelWorld, Observation, Operation, OperationError, OperationResult, Peer};
pub use scenario::{RunnableScenario, Scenario, World};
pub use sim_env::SimEnv;
pub use sim_transport::SimTransport;
