//! Error types for state transitions and storage.

use didcomm_proto::{ConnectionMessage, CredentialMessage, ProofMessage, ProtocolError};
use thiserror::Error;

use crate::{
    connection::{ConnectionRole, ConnectionState},
    exchange::{ExchangeRole, ExchangeState},
    presentation::{PresentationRole, PresentationState},
};

/// Connection state machine errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Inbound message is not valid for the record's role and state
    #[error("invalid transition: {role:?} connection in {state:?} cannot accept {message:?}")]
    InvalidTransition {
        /// Current state
        state: ConnectionState,
        /// Local role
        role: ConnectionRole,
        /// Offending message
        message: ConnectionMessage,
    },

    /// Local operation called in the wrong state
    #[error("invalid state for {operation}: {state:?}")]
    InvalidState {
        /// Current state
        state: ConnectionState,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// Reply payload could not be built
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Credential exchange state machine errors
#[derive(Error, Debug)]
pub enum ExchangeError {
    /// Inbound message is not valid for the record's role and state
    #[error("invalid transition: {role:?} exchange in {state:?} cannot accept {message:?}")]
    InvalidTransition {
        /// Current state, `None` when no record exists yet
        state: Option<ExchangeState>,
        /// Local role
        role: ExchangeRole,
        /// Offending message
        message: CredentialMessage,
    },

    /// Local operation called in the wrong state
    #[error("invalid state for {operation}: {state:?}")]
    InvalidState {
        /// Current state
        state: ExchangeState,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// Attempt to move a record backwards
    #[error("cannot move exchange from {from:?} back to {to:?}")]
    Regression {
        /// Current state
        from: ExchangeState,
        /// Requested state
        to: ExchangeState,
    },

    /// `credential_id` is write-once
    #[error("credential id already assigned: {0}")]
    CredentialReassigned(String),

    /// Reply payload could not be built
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Presentation state machine errors
#[derive(Error, Debug)]
pub enum PresentationError {
    /// Inbound message is not valid for the record's role and state
    #[error("invalid transition: {role:?} presentation in {state:?} cannot accept {message:?}")]
    InvalidTransition {
        /// Current state, `None` when no record exists yet
        state: Option<PresentationState>,
        /// Local role
        role: PresentationRole,
        /// Offending message
        message: ProofMessage,
    },

    /// Local operation called in the wrong state
    #[error("invalid state for {operation}: {state:?}")]
    InvalidState {
        /// Current state
        state: PresentationState,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// Attempt to move a record backwards
    #[error("cannot move presentation from {from:?} back to {to:?}")]
    Regression {
        /// Current state
        from: PresentationState,
        /// Requested state
        to: PresentationState,
    },

    /// Presented credential follows another schema
    #[error("expected a {expected} credential, got {actual}")]
    SchemaMismatch {
        /// Schema that was requested
        expected: String,
        /// Schema of the presented credential
        actual: String,
    },

    /// Presented credential lacks a requested attribute
    #[error("presented {schema_id} credential has no attribute {attribute:?}")]
    MissingAttribute {
        /// Schema that was requested
        schema_id: String,
        /// Requested attribute
        attribute: String,
    },

    /// Reply payload could not be built
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Storage backend errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Record could not be serialized
    #[error("encode failed: {0}")]
    Encode(String),

    /// Stored bytes could not be deserialized
    #[error("decode failed: {0}")]
    Decode(String),

    /// A previous writer panicked while holding the store lock
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// Backend-specific failure
    #[error("storage backend: {0}")]
    Backend(String),
}
