//! Replies remembered on records.
//!
//! A record keeps the last message it emitted so a retransmitted inbound
//! message can be answered again without running the transition twice.

use didcomm_proto::{
    ConnectionMessage, CredentialMessage, MessageType, ProofMessage, ProtocolError,
    payloads::ProblemReport,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outbound message body, before it is wrapped into an envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredReply {
    /// `@type` of the outbound message
    pub message_type: MessageType,
    /// `~content` of the outbound message
    pub content: Value,
}

impl StoredReply {
    /// Serialize a typed payload
    pub fn new<T: Serialize>(message_type: MessageType, payload: &T) -> Result<Self, ProtocolError> {
        Ok(Self { message_type, content: serde_json::to_value(payload)? })
    }

    /// Connections protocol reply
    pub fn connection<T: Serialize>(
        message: ConnectionMessage,
        payload: &T,
    ) -> Result<Self, ProtocolError> {
        Self::new(message.message_type(), payload)
    }

    /// Issue-credential protocol reply
    pub fn credential<T: Serialize>(
        message: CredentialMessage,
        payload: &T,
    ) -> Result<Self, ProtocolError> {
        Self::new(message.message_type(), payload)
    }

    /// Present-proof protocol reply
    pub fn proof<T: Serialize>(message: ProofMessage, payload: &T) -> Result<Self, ProtocolError> {
        Self::new(message.message_type(), payload)
    }

    /// Problem report, infallible so it can be built on error paths
    pub fn problem_report(message_type: MessageType, code: &str, explain: &str) -> Self {
        let report = ProblemReport { code: code.to_string(), explain: Some(explain.to_string()) };
        let content = serde_json::to_value(&report)
            .unwrap_or_else(|_| serde_json::json!({ "code": code }));
        Self { message_type, content }
    }
}
