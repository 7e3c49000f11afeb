//! Scenario testing with mandatory oracles.
//!
//! ```text
//! Scenario::new(..)      declare agents, schemas, steps
//!     .oracle(..)        mandatory verification
//!     .run().await       steps -> deliver until quiet -> World -> oracle
//! ```

mod builder;
pub mod network;
mod world;

pub use builder::{RunnableScenario, Scenario};
pub use world::{AgentView, Rejection, World};

/// Verification run against the final world; `Err` fails the scenario
pub type OracleFn = Box<dyn Fn(&World) -> Result<(), String> + Send + Sync>;
