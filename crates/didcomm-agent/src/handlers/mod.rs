//! Built-in protocol handlers.
//!
//! | protocol           | handler                  | state                |
//! |--------------------|--------------------------|----------------------|
//! | `trust_ping`       | [`TrustPingHandler`]     | none                 |
//! | `basicmessage`     | [`BasicMessageHandler`]  | message log          |
//! | `connections`      | [`ConnectionHandler`]    | connection records   |
//! | `issue-credential` | [`CredentialHandler`]    | exchange records     |
//! | `present-proof`    | [`PresentationHandler`]  | presentation records |

mod basic_message;
mod connections;
pub(crate) mod credentials;
mod presentations;
mod trust_ping;

use std::sync::Arc;

pub use basic_message::BasicMessageHandler;
pub use connections::ConnectionHandler;
pub use credentials::CredentialHandler;
use didcomm_core::Environment;
use didcomm_proto::{ConnectionMessage, CredentialMessage, ProofMessage, Protocol};
pub use presentations::PresentationHandler;
pub use trust_ping::TrustPingHandler;

use crate::handler::{HandlerKey, HandlerSet};

const CONNECTION_MESSAGES: [ConnectionMessage; 5] = [
    ConnectionMessage::Invitation,
    ConnectionMessage::Request,
    ConnectionMessage::Response,
    ConnectionMessage::Ack,
    ConnectionMessage::ProblemReport,
];

const CREDENTIAL_MESSAGES: [CredentialMessage; 6] = [
    CredentialMessage::Propose,
    CredentialMessage::Offer,
    CredentialMessage::Request,
    CredentialMessage::Issue,
    CredentialMessage::Ack,
    CredentialMessage::ProblemReport,
];

const PROOF_MESSAGES: [ProofMessage; 4] = [
    ProofMessage::Request,
    ProofMessage::Presentation,
    ProofMessage::Ack,
    ProofMessage::ProblemReport,
];

/// Register every built-in handler in `set`
pub fn register_builtin<E: Environment>(set: &HandlerSet<E>) {
    let ping = Arc::new(TrustPingHandler);
    set.register(HandlerKey::new(Protocol::TrustPing, "ping"), ping.clone());
    set.register(HandlerKey::new(Protocol::TrustPing, "ping_response"), ping);

    set.register(HandlerKey::new(Protocol::BasicMessage, "message"), Arc::new(BasicMessageHandler));

    let connections = Arc::new(ConnectionHandler);
    for message in CONNECTION_MESSAGES {
        set.register(HandlerKey::new(Protocol::Connections, message.name()), connections.clone());
    }

    let credentials = Arc::new(CredentialHandler);
    for message in CREDENTIAL_MESSAGES {
        set.register(HandlerKey::new(Protocol::IssueCredential, message.name()), credentials.clone());
    }

    let presentations = Arc::new(PresentationHandler);
    for message in PROOF_MESSAGES {
        set.register(HandlerKey::new(Protocol::PresentProof, message.name()), presentations.clone());
    }
}
