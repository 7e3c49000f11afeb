//! `@type` message type URIs.
//!
//! Two URI families are in use:
//!
//! ```text
//! did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/ping/1.0/ping      (legacy)
//! https://didcomm.org/issue-credential/1.0/offer-credential
//! ```
//!
//! Both end in `<protocol>/<version>/<name>`. The prefix (document URI) is
//! kept verbatim so that replies can be sent in the same family the peer
//! used.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::ProtocolError;

/// Document URI of the current `didcomm.org` family
pub const DIDCOMM_ORG_PREFIX: &str = "https://didcomm.org/";

/// Document URI of the legacy `did:sov` family
pub const LEGACY_PREFIX: &str = "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/";

/// Parsed `@type` value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageType {
    prefix: String,
    protocol: String,
    version: String,
    name: String,
}

impl MessageType {
    /// Build a message type in the `https://didcomm.org/` family
    pub fn new(protocol: &str, version: &str, name: &str) -> Self {
        Self {
            prefix: DIDCOMM_ORG_PREFIX.to_string(),
            protocol: protocol.to_string(),
            version: version.to_string(),
            name: name.to_string(),
        }
    }

    /// Same family, protocol and version, different message name.
    ///
    /// Used for replies (`ping` -> `ping_response`).
    pub fn sibling(&self, name: &str) -> Self {
        Self { name: name.to_string(), ..self.clone() }
    }

    /// Document URI prefix, including the trailing separator
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Protocol name (`ping`, `connections`, ...)
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Protocol version string (`1.0`)
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Message name within the protocol (`request`, `offer-credential`)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Major component of the version, if numeric
    pub fn major_version(&self) -> Option<u32> {
        self.version.split('.').next().and_then(|major| major.parse().ok())
    }
}

impl FromStr for MessageType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::InvalidMessageType(s.to_string());

        let (prefix, rest) = if let Some(idx) = s.find(";spec/") {
            s.split_at(idx + ";spec/".len())
        } else if s.starts_with("https://") || s.starts_with("http://") {
            // Last three segments are protocol/version/name
            let mut cut = s.len();
            for _ in 0..3 {
                cut = s[..cut].rfind('/').ok_or_else(invalid)?;
            }
            s.split_at(cut + 1)
        } else {
            return Err(invalid());
        };

        let segments: Vec<&str> = rest.split('/').collect();
        match segments.as_slice() {
            [protocol, version, name]
                if !protocol.is_empty() && !version.is_empty() && !name.is_empty() =>
            {
                Ok(Self {
                    prefix: prefix.to_string(),
                    protocol: (*protocol).to_string(),
                    version: (*version).to_string(),
                    name: (*name).to_string(),
                })
            },
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}/{}/{}", self.prefix, self.protocol, self.version, self.name)
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
