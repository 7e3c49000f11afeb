//! DIDComm agent protocol core logic
//!
//! Pure state machine logic for connection establishment, credential
//! exchange and proof presentation, completely decoupled from I/O. Wallet
//! calls, transport sends and locking all live in the runtime crate; this crate only decides whether a
//! message is acceptable in the current state and what the record looks like
//! afterwards.
//!
//! # Architecture
//!
//! Records are plain data. Inbound messages are first checked against an
//! explicit transition table, which answers with a step to perform (or
//! rejects the message). The runtime performs any external work the step
//! needs, then commits the step on a copy of the record and stores it only
//! if everything succeeded. Transitions return declarative actions
//! ([`connection::ConnectionAction`], [`exchange::ExchangeAction`],
//! [`presentation::PresentationAction`]) instead
//! of sending anything themselves.
//!
//! Time and randomness come from an [`env::Environment`] supplied by the
//! caller, so the same transitions run unchanged in production and in
//! deterministic tests.
//!
//! # Components
//!
//! - [`connection`]: Connection state machine (invitation, request, response, completed)
//! - [`exchange`]: Credential exchange state machine (proposed ... acknowledged)
//! - [`presentation`]: Proof presentation state machine (requested, presented, acknowledged)
//! - [`expiry`]: Inactivity policy that abandons stalled records
//! - [`mod@env`]: Environment abstraction (time, RNG)
//! - [`storage`]: Durable record storage trait and in-memory implementation
//! - [`error`]: Transition and storage error types

pub mod connection;
pub mod env;
pub mod error;
pub mod exchange;
pub mod expiry;
pub mod presentation;
pub mod reply;
pub mod storage;

pub use connection::{ConnectionAction, ConnectionRecord, ConnectionRole, ConnectionState, Inbound};
pub use env::{Environment, SystemEnv, Timestamp};
pub use error::{ConnectionError, ExchangeError, PresentationError, StorageError};
pub use exchange::{CredentialExchange, ExchangeAction, ExchangeRole, ExchangeState, Step};
pub use expiry::ExpiryPolicy;
pub use presentation::{
    PresentationAction, PresentationExchange, PresentationRole, PresentationState, ProofStep,
};
pub use reply::StoredReply;
pub use storage::{MemoryStorage, Storage, StoredMessage};
