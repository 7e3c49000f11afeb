//! Runtime error types.
//!
//! [`DispatchError`] is what a single envelope can fail with. The agent loop
//! never stops because of one: routing-level errors are logged and the
//! envelope is dropped, collaborator errors are logged with more severity.
//! Local API calls return the same errors to the caller.

use std::io;

use didcomm_core::{
    ConnectionError, ConnectionState, ExchangeError, PresentationError, StorageError,
};
use didcomm_proto::{AgentId, ProtocolError, ThreadId};
use thiserror::Error;

/// Wallet failures
#[derive(Error, Debug)]
pub enum WalletError {
    /// DID or key generation failed
    #[error("did creation failed: {0}")]
    DidCreation(String),

    /// Signing failed
    #[error("signing failed: {0}")]
    Signing(String),

    /// Credential issuance failed
    #[error("issuance failed: {0}")]
    Issuance(String),

    /// Credential did not verify
    #[error("verification failed: {0}")]
    Verification(String),

    /// Credential could not be stored
    #[error("credential storage failed: {0}")]
    Storage(String),

    /// No stored credential satisfies a presentation request
    #[error("no credential for schema {0}")]
    NoMatchingCredential(String),
}

/// Transport failures
#[derive(Error, Debug)]
pub enum TransportError {
    /// Transport has shut down
    #[error("transport closed")]
    Closed,

    /// No route to the destination agent
    #[error("unknown destination: {0}")]
    UnknownDestination(AgentId),

    /// Outbound envelope could not be encoded
    #[error("encode failed: {0}")]
    Encode(#[from] ProtocolError),

    /// Underlying I/O failure
    #[error("transport I/O: {0}")]
    Io(#[from] io::Error),
}

/// Schema resolution and validation failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// Registry does not know the schema
    #[error("unknown schema: {0}")]
    NotFound(String),

    /// A schema attribute has no value
    #[error("schema {schema_id} requires attribute {attribute:?}")]
    MissingAttribute {
        /// Schema being validated against
        schema_id: String,
        /// Attribute without a value
        attribute: String,
    },

    /// A value was given for an attribute the schema does not define
    #[error("schema {schema_id} has no attribute {attribute:?}")]
    UnexpectedAttribute {
        /// Schema being validated against
        schema_id: String,
        /// Attribute not in the schema
        attribute: String,
    },

    /// Credential schema does not match the exchange's schema
    #[error("expected schema {expected}, got {actual}")]
    Mismatch {
        /// Schema of the exchange
        expected: String,
        /// Schema carried by the message
        actual: String,
    },
}

/// Route registration failure, reported by a [`crate::RouteRegistrar`]
#[derive(Error, Debug)]
#[error("route registration failed: {0}")]
pub struct RouteError(pub String);

/// Why an envelope or local operation could not be processed
#[derive(Error, Debug)]
pub enum DispatchError {
    /// `@type` names a protocol with no handlers
    #[error("unsupported protocol: {protocol}")]
    UnsupportedProtocol {
        /// Protocol name as received
        protocol: String,
    },

    /// Protocol is known but no handler is registered for the message
    #[error("unsupported message kind: {kind}")]
    UnsupportedMessageKind {
        /// `protocol/name` of the message
        kind: String,
    },

    /// Message is not valid for the record's role and state
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// No record exists for the message's thread or sender
    #[error("no record for {0}")]
    UnknownRecord(String),

    /// Connection exists but cannot carry other protocols yet
    #[error("connection not ready: {state:?}")]
    ConnectionNotReady {
        /// State the connection is in
        state: ConnectionState,
    },

    /// A thread can carry only one exchange or presentation
    #[error("thread {0} already has an exchange")]
    ThreadInUse(ThreadId),

    /// Payload could not be decoded
    #[error("malformed message: {0}")]
    Malformed(#[from] ProtocolError),

    /// Attributes do not match the schema
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// Wallet call failed
    #[error(transparent)]
    Wallet(#[from] WalletError),

    /// Transport call failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Record could not be persisted
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl DispatchError {
    /// Envelope was routed to the wrong place or did not fit the record.
    ///
    /// These are the peer's problem: log and drop.
    pub fn is_routing(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedProtocol { .. }
                | Self::UnsupportedMessageKind { .. }
                | Self::InvalidTransition(_)
                | Self::UnknownRecord(_)
                | Self::ConnectionNotReady { .. }
                | Self::ThreadInUse(_)
                | Self::Malformed(_)
                | Self::Schema(_)
        )
    }

    /// The same envelope may succeed if delivered again later
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Storage(e) => matches!(e, StorageError::Backend(_)),
            Self::Wallet(e) => matches!(e, WalletError::Storage(_) | WalletError::Signing(_)),
            _ => false,
        }
    }
}

impl From<ConnectionError> for DispatchError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::Protocol(e) => Self::Malformed(e),
            other @ (ConnectionError::InvalidTransition { .. }
            | ConnectionError::InvalidState { .. }) => Self::InvalidTransition(other.to_string()),
        }
    }
}

impl From<ExchangeError> for DispatchError {
    fn from(err: ExchangeError) -> Self {
        match err {
            ExchangeError::Protocol(e) => Self::Malformed(e),
            other => Self::InvalidTransition(other.to_string()),
        }
    }
}

impl From<PresentationError> for DispatchError {
    fn from(err: PresentationError) -> Self {
        match err {
            PresentationError::Protocol(e) => Self::Malformed(e),
            PresentationError::SchemaMismatch { expected, actual } => {
                Self::Schema(SchemaError::Mismatch { expected, actual })
            },
            PresentationError::MissingAttribute { schema_id, attribute } => {
                Self::Schema(SchemaError::MissingAttribute { schema_id, attribute })
            },
            other => Self::InvalidTransition(other.to_string()),
        }
    }
}

/// Agent startup and run-loop failures
#[derive(Error, Debug)]
pub enum AgentError {
    /// Stored records could not be loaded
    #[error("failed to load records: {0}")]
    Storage(#[from] StorageError),

    /// A worker lane panicked
    #[error("worker lane failed: {0}")]
    Worker(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_disjoint_for_routing_errors() {
        let routing = [
            DispatchError::UnsupportedProtocol { protocol: "x".into() },
            DispatchError::UnsupportedMessageKind { kind: "x/y".into() },
            DispatchError::InvalidTransition("no".into()),
            DispatchError::UnknownRecord("t1".into()),
        ];
        for err in routing {
            assert!(err.is_routing(), "{err}");
            assert!(!err.is_retryable(), "{err}");
        }
    }

    #[test]
    fn collaborator_errors_are_not_routing() {
        let err = DispatchError::Transport(TransportError::Closed);
        assert!(!err.is_routing());
        assert!(err.is_retryable());

        let err = DispatchError::Wallet(WalletError::Verification("bad proof".into()));
        assert!(!err.is_routing());
        assert!(!err.is_retryable());
    }

    #[test]
    fn transition_errors_map_to_invalid_transition() {
        let err = ConnectionError::InvalidState {
            state: ConnectionState::Completed,
            operation: "abandon",
        };
        assert!(matches!(DispatchError::from(err), DispatchError::InvalidTransition(_)));
    }

    #[test]
    fn presentation_content_errors_are_schema_errors() {
        let err = PresentationError::MissingAttribute {
            schema_id: "schema:degree:1.0".into(),
            attribute: "name".into(),
        };
        let err = DispatchError::from(err);
        assert!(matches!(&err, DispatchError::Schema(SchemaError::MissingAttribute { .. })));
        assert!(err.is_routing());
    }
}
