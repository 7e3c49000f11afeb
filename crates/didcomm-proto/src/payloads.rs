//! Kind-specific `~content` payloads.
//!
//! Payload structs ignore unknown fields so that newer peers can add
//! fields without breaking older agents. Optional fields are skipped on
//! output rather than serialized as `null`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::Did;

/// Credential attribute values by attribute name
pub type Attributes = BTreeMap<String, String>;

fn default_true() -> bool {
    true
}

/// Trust ping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Whether the receiver should answer with `ping_response`
    #[serde(default = "default_true")]
    pub response_requested: bool,
    /// Free-form comment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Default for Ping {
    fn default() -> Self {
        Self { response_requested: true, comment: None }
    }
}

/// Trust ping reply
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    /// Free-form comment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Basic text message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicMessage {
    /// Message text
    pub content: String,
    /// Sender-side timestamp, as sent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_time: Option<String>,
}

/// Connection invitation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitation {
    /// Human-readable label of the inviter
    pub label: String,
    /// Agent address the request should be sent to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_endpoint: Option<String>,
    /// Keys the invitee should encrypt the request to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recipient_keys: Vec<String>,
}

/// Connection request (invitee -> inviter)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    /// Human-readable label of the invitee
    pub label: String,
    /// Pairwise DID of the invitee
    pub did: Did,
}

/// Connection response (inviter -> invitee)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionResponse {
    /// Pairwise DID of the inviter
    pub did: Did,
}

/// Acknowledgement used by both protocols
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// `OK` on success
    #[serde(default = "Ack::ok_status")]
    pub status: String,
}

impl Ack {
    fn ok_status() -> String {
        "OK".to_string()
    }
}

impl Default for Ack {
    fn default() -> Self {
        Self { status: Self::ok_status() }
    }
}

/// Problem report, abandons the thread it is sent on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemReport {
    /// Machine-readable problem code
    pub code: String,
    /// Human-readable explanation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explain: Option<String>,
}

/// Credential proposal (holder -> issuer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialProposal {
    /// Schema the credential should follow
    pub schema_id: String,
    /// Proposed attribute values
    #[serde(default)]
    pub attributes: Attributes,
    /// Free-form comment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Credential offer (issuer -> holder)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialOffer {
    /// Schema the credential follows
    pub schema_id: String,
    /// Offered attribute values
    pub attributes: Attributes,
    /// Wallet-signed offer, opaque to the engine
    #[serde(default)]
    pub offer: Value,
}

/// Credential request (holder -> issuer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRequest {
    /// DID the credential should be bound to
    pub holder_did: Did,
}

/// Verifiable credential as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Issuer-assigned credential id
    pub id: String,
    /// Schema the credential follows
    pub schema_id: String,
    /// Issuer DID
    pub issuer: Did,
    /// Subject (holder) DID
    pub subject: Did,
    /// Attribute values
    pub attributes: Attributes,
    /// Issuer proof, opaque to the engine
    #[serde(default)]
    pub proof: Value,
}

/// Credential issuance (issuer -> holder)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialIssue {
    /// The issued credential
    pub credential: Credential,
}

/// Presentation request (verifier -> prover)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationRequest {
    /// Schema the presented credential must follow
    pub schema_id: String,
    /// Attributes the presented credential must carry
    pub requested_attributes: BTreeSet<String>,
    /// Free-form comment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Presentation (prover -> verifier)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presentation {
    /// Credential disclosed to the verifier
    pub credential: Credential,
}
