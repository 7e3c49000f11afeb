//! Closed set of message kinds understood by the engine.
//!
//! Routing matches on [`MessageKind`] instead of comparing `@type` strings.
//! Resolution happens once per envelope; anything outside the known set is
//! carried as [`MessageKind::Unknown`] so the dispatcher can reject it with a
//! precise reason.
//!
//! | protocol           | names                                                                       |
//! |--------------------|-----------------------------------------------------------------------------|
//! | `trust_ping`/`ping`| `ping`, `ping_response`                                                     |
//! | `basicmessage`     | `message`                                                                   |
//! | `connections`      | `invitation`, `request`, `response`, `ack`, `problem_report`                |
//! | `issue-credential` | `propose-credential`, `offer-credential`, `request-credential`, `issue-credential`, `ack`, `problem-report` |
//! | `present-proof`    | `request-presentation`, `presentation`, `ack`, `problem-report`             |

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::message_type::MessageType;

/// Protocols with built-in handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Liveness check, stateless
    TrustPing,
    /// Free-text messages over an established connection
    BasicMessage,
    /// Pairwise connection establishment
    Connections,
    /// Credential issuance
    IssueCredential,
    /// Proof of a held credential
    PresentProof,
}

impl Protocol {
    /// Every built-in protocol
    pub const ALL: [Self; 5] = [
        Self::TrustPing,
        Self::BasicMessage,
        Self::Connections,
        Self::IssueCredential,
        Self::PresentProof,
    ];

    /// Canonical protocol name used on outbound messages
    pub fn name(self) -> &'static str {
        match self {
            Self::TrustPing => "trust_ping",
            Self::BasicMessage => "basicmessage",
            Self::Connections => "connections",
            Self::IssueCredential => "issue-credential",
            Self::PresentProof => "present-proof",
        }
    }

    /// Version emitted on outbound messages
    pub fn version(self) -> &'static str {
        "1.0"
    }

    /// Resolve a protocol name, accepting known aliases
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "trust_ping" | "ping" => Some(Self::TrustPing),
            "basicmessage" => Some(Self::BasicMessage),
            "connections" | "didexchange" => Some(Self::Connections),
            "issue-credential" => Some(Self::IssueCredential),
            "present-proof" => Some(Self::PresentProof),
            _ => None,
        }
    }

    /// Build an outbound message type for `name` in this protocol
    pub fn message_type(self, name: &str) -> MessageType {
        MessageType::new(self.name(), self.version(), name)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Messages of the connections protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMessage {
    /// Out-of-band invitation to connect
    Invitation,
    /// Invitee asks to connect, carries its DID
    Request,
    /// Inviter accepts, carries its DID
    Response,
    /// Invitee confirms the connection is usable
    Ack,
    /// Either side gives up
    ProblemReport,
}

impl ConnectionMessage {
    /// Wire name
    pub fn name(self) -> &'static str {
        match self {
            Self::Invitation => "invitation",
            Self::Request => "request",
            Self::Response => "response",
            Self::Ack => "ack",
            Self::ProblemReport => "problem_report",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "invitation" => Some(Self::Invitation),
            "request" => Some(Self::Request),
            "response" => Some(Self::Response),
            "ack" | "complete" => Some(Self::Ack),
            "problem_report" | "problem-report" => Some(Self::ProblemReport),
            _ => None,
        }
    }

    /// Outbound message type
    pub fn message_type(self) -> MessageType {
        Protocol::Connections.message_type(self.name())
    }
}

/// Messages of the issue-credential protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialMessage {
    /// Holder proposes a credential
    Propose,
    /// Issuer offers a credential
    Offer,
    /// Holder requests the offered credential
    Request,
    /// Issuer delivers the credential
    Issue,
    /// Holder confirms receipt
    Ack,
    /// Either side gives up
    ProblemReport,
}

impl CredentialMessage {
    /// Wire name
    pub fn name(self) -> &'static str {
        match self {
            Self::Propose => "propose-credential",
            Self::Offer => "offer-credential",
            Self::Request => "request-credential",
            Self::Issue => "issue-credential",
            Self::Ack => "ack",
            Self::ProblemReport => "problem-report",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "propose-credential" | "propose" => Some(Self::Propose),
            "offer-credential" | "offer" => Some(Self::Offer),
            "request-credential" | "request" => Some(Self::Request),
            "issue-credential" | "issue" => Some(Self::Issue),
            "ack" => Some(Self::Ack),
            "problem-report" | "problem_report" => Some(Self::ProblemReport),
            _ => None,
        }
    }

    /// Outbound message type
    pub fn message_type(self) -> MessageType {
        Protocol::IssueCredential.message_type(self.name())
    }
}

/// Messages of the present-proof protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofMessage {
    /// Verifier asks for a presentation
    Request,
    /// Prover presents a credential
    Presentation,
    /// Verifier accepted the presentation
    Ack,
    /// Either side gives up
    ProblemReport,
}

impl ProofMessage {
    /// Wire name
    pub fn name(self) -> &'static str {
        match self {
            Self::Request => "request-presentation",
            Self::Presentation => "presentation",
            Self::Ack => "ack",
            Self::ProblemReport => "problem-report",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "request-presentation" => Some(Self::Request),
            "presentation" => Some(Self::Presentation),
            "ack" => Some(Self::Ack),
            "problem-report" | "problem_report" => Some(Self::ProblemReport),
            _ => None,
        }
    }

    /// Outbound message type
    pub fn message_type(self) -> MessageType {
        Protocol::PresentProof.message_type(self.name())
    }
}

/// Why a message type did not resolve to a known kind
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UnknownKind {
    /// Protocol name is not built in
    Protocol {
        /// Protocol name as received
        protocol: String,
        /// Message name as received
        name: String,
    },
    /// Protocol is built in, message name is not
    Message {
        /// Resolved protocol
        protocol: Protocol,
        /// Message name as received
        name: String,
    },
}

/// Resolved message kind
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Trust ping request
    Ping,
    /// Trust ping reply
    PingResponse,
    /// Basic message
    BasicMessage,
    /// Connections protocol message
    Connection(ConnectionMessage),
    /// Issue-credential protocol message
    Credential(CredentialMessage),
    /// Present-proof protocol message
    Proof(ProofMessage),
    /// Not part of the built-in set
    Unknown(UnknownKind),
}

impl MessageKind {
    /// Resolve a parsed `@type`
    pub fn resolve(ty: &MessageType) -> Self {
        let Some(protocol) = Protocol::from_name(ty.protocol()) else {
            return Self::Unknown(UnknownKind::Protocol {
                protocol: ty.protocol().to_string(),
                name: ty.name().to_string(),
            });
        };

        let unknown = || {
            Self::Unknown(UnknownKind::Message { protocol, name: ty.name().to_string() })
        };

        match protocol {
            Protocol::TrustPing => match ty.name() {
                "ping" => Self::Ping,
                "ping_response" => Self::PingResponse,
                _ => unknown(),
            },
            Protocol::BasicMessage => match ty.name() {
                "message" => Self::BasicMessage,
                _ => unknown(),
            },
            Protocol::Connections => {
                ConnectionMessage::from_name(ty.name()).map_or_else(unknown, Self::Connection)
            },
            Protocol::IssueCredential => {
                CredentialMessage::from_name(ty.name()).map_or_else(unknown, Self::Credential)
            },
            Protocol::PresentProof => {
                ProofMessage::from_name(ty.name()).map_or_else(unknown, Self::Proof)
            },
        }
    }

    /// Protocol this kind belongs to, `None` for unknown protocols
    pub fn protocol(&self) -> Option<Protocol> {
        match self {
            Self::Ping | Self::PingResponse => Some(Protocol::TrustPing),
            Self::BasicMessage => Some(Protocol::BasicMessage),
            Self::Connection(_) => Some(Protocol::Connections),
            Self::Credential(_) => Some(Protocol::IssueCredential),
            Self::Proof(_) => Some(Protocol::PresentProof),
            Self::Unknown(UnknownKind::Message { protocol, .. }) => Some(*protocol),
            Self::Unknown(UnknownKind::Protocol { .. }) => None,
        }
    }

    /// Canonical message name, `None` for unknown kinds
    pub fn name(&self) -> Option<&'static str> {
        match self {
            Self::Ping => Some("ping"),
            Self::PingResponse => Some("ping_response"),
            Self::BasicMessage => Some("message"),
            Self::Connection(msg) => Some(msg.name()),
            Self::Credential(msg) => Some(msg.name()),
            Self::Proof(msg) => Some(msg.name()),
            Self::Unknown(_) => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.protocol(), self.name(), self) {
            (Some(protocol), Some(name), _) => write!(f, "{protocol}/{name}"),
            (_, _, Self::Unknown(UnknownKind::Message { protocol, name })) => {
                write!(f, "{protocol}/{name}")
            },
            (_, _, Self::Unknown(UnknownKind::Protocol { protocol, name })) => {
                write!(f, "{protocol}/{name}")
            },
            _ => f.write_str("unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind(raw: &str) -> MessageKind {
        MessageKind::resolve(&raw.parse().unwrap())
    }

    #[test]
    fn resolves_legacy_ping() {
        assert_eq!(kind("did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/ping/1.0/ping"), MessageKind::Ping);
        assert_eq!(
            kind("did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/ping/1.0/ping_response"),
            MessageKind::PingResponse
        );
    }

    #[test]
    fn resolves_connection_and_credential_kinds() {
        assert_eq!(
            kind("https://didcomm.org/connections/1.0/request"),
            MessageKind::Connection(ConnectionMessage::Request)
        );
        assert_eq!(
            kind("https://didcomm.org/issue-credential/1.0/offer-credential"),
            MessageKind::Credential(CredentialMessage::Offer)
        );
    }

    #[test]
    fn outbound_types_resolve_to_themselves() {
        for msg in [
            ConnectionMessage::Invitation,
            ConnectionMessage::Request,
            ConnectionMessage::Response,
            ConnectionMessage::Ack,
            ConnectionMessage::ProblemReport,
        ] {
            assert_eq!(MessageKind::resolve(&msg.message_type()), MessageKind::Connection(msg));
        }
        for msg in [
            CredentialMessage::Propose,
            CredentialMessage::Offer,
            CredentialMessage::Request,
            CredentialMessage::Issue,
            CredentialMessage::Ack,
            CredentialMessage::ProblemReport,
        ] {
            assert_eq!(MessageKind::resolve(&msg.message_type()), MessageKind::Credential(msg));
        }
        for msg in [
            ProofMessage::Request,
            ProofMessage::Presentation,
            ProofMessage::Ack,
            ProofMessage::ProblemReport,
        ] {
            assert_eq!(MessageKind::resolve(&msg.message_type()), MessageKind::Proof(msg));
        }
    }

    #[test]
    fn unknown_protocol_and_unknown_message_are_distinguished() {
        assert_eq!(
            kind("https://didcomm.org/questionanswer/1.0/question"),
            MessageKind::Unknown(UnknownKind::Protocol {
                protocol: "questionanswer".into(),
                name: "question".into()
            })
        );
        assert_eq!(
            kind("https://didcomm.org/present-proof/1.0/request-presentation"),
            MessageKind::Proof(ProofMessage::Request)
        );
        assert_eq!(
            kind("https://didcomm.org/connections/1.0/rotate"),
            MessageKind::Unknown(UnknownKind::Message {
                protocol: Protocol::Connections,
                name: "rotate".into()
            })
        );
    }

    #[test]
    fn display_names_protocol_and_kind() {
        assert_eq!(
            MessageKind::Credential(CredentialMessage::Issue).to_string(),
            "issue-credential/issue-credential"
        );
        assert_eq!(kind("https://didcomm.org/x/1.0/y").to_string(), "x/y");
    }
}
