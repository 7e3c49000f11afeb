//! Envelope model for DIDComm agent messages.
//!
//! Every inbound message is decoded exactly once, at the transport boundary,
//! into an [`Envelope`]: a parsed [`MessageType`], a thread id, the sending
//! agent and the kind-specific `~content`. Routing never looks at raw JSON
//! again after that point.
//!
//! The `@type` URI is resolved into the closed [`MessageKind`] sum type. Kinds
//! this crate does not know about are still representable (as
//! [`MessageKind::Unknown`]) so that higher layers can reject them explicitly
//! instead of failing to decode.
//!
//! # Wire shape
//!
//! ```text
//! { "@type": "<doc-uri>;spec/<protocol>/<version>/<kind>",
//!   "@id": "<uuid>",
//!   "~thread": { "thid": "<uuid>" },
//!   "~content": { ... kind-specific fields ... } }
//! ```
//!
//! Unknown top-level fields survive a decode/encode cycle untouched.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod invitation;
pub mod kind;
pub mod message_type;
pub mod payloads;

pub use envelope::{Envelope, RawEnvelope};
pub use errors::{ProtocolError, Result};
pub use ids::{AgentId, ConnectionId, Did, ExchangeId, MessageId, ThreadId};
pub use kind::{
    ConnectionMessage, CredentialMessage, MessageKind, ProofMessage, Protocol, UnknownKind,
};
pub use message_type::MessageType;
