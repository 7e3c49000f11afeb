//! Envelope decoding and encoding.

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::{
    errors::{ProtocolError, Result},
    ids::{AgentId, MessageId, ThreadId},
    kind::MessageKind,
    message_type::MessageType,
};

/// Undecoded message as handed over by a transport.
///
/// The transport has already unpacked the encrypted envelope and knows which
/// agent sent it; the body is the plaintext DIDComm JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEnvelope {
    /// Sending agent
    pub sender: AgentId,
    /// Plaintext JSON body
    pub body: Bytes,
}

impl RawEnvelope {
    /// Wrap a received body
    pub fn new(sender: AgentId, body: impl Into<Bytes>) -> Self {
        Self { sender, body: body.into() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ThreadDecorator {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thid: Option<ThreadId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pthid: Option<ThreadId>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    #[serde(rename = "@type")]
    message_type: MessageType,
    #[serde(rename = "@id", default, skip_serializing_if = "Option::is_none")]
    id: Option<MessageId>,
    #[serde(rename = "~thread", default, skip_serializing_if = "Option::is_none")]
    thread: Option<ThreadDecorator>,
    #[serde(rename = "~content", default)]
    content: Value,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Decoded protocol message.
///
/// Immutable once received. Every envelope belongs to exactly one thread: if
/// the sender did not set `~thread.thid`, the message starts a new thread
/// whose id is the message's own `@id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Parsed `@type`
    pub message_type: MessageType,
    /// `@id`
    pub id: MessageId,
    /// `~thread.thid`
    pub thread_id: ThreadId,
    /// `~thread.pthid`, links a thread to the one that spawned it
    pub parent_thread_id: Option<ThreadId>,
    /// Sending agent
    pub sender: AgentId,
    /// `~content`
    pub content: Value,
    thread_extra: Map<String, Value>,
    extra: Map<String, Value>,
}

impl Envelope {
    /// New outbound envelope with a fresh message id
    pub fn new(
        message_type: MessageType,
        thread_id: ThreadId,
        sender: AgentId,
        content: Value,
    ) -> Self {
        Self {
            message_type,
            id: MessageId::generate(),
            thread_id,
            parent_thread_id: None,
            sender,
            content,
            thread_extra: Map::new(),
            extra: Map::new(),
        }
    }

    /// New outbound envelope with a typed payload
    pub fn with_payload<T: Serialize>(
        message_type: MessageType,
        thread_id: ThreadId,
        sender: AgentId,
        payload: &T,
    ) -> Result<Self> {
        let content = serde_json::to_value(payload)?;
        Ok(Self::new(message_type, thread_id, sender, content))
    }

    /// Set the parent thread id
    #[must_use]
    pub fn with_parent_thread(mut self, parent: ThreadId) -> Self {
        self.parent_thread_id = Some(parent);
        self
    }

    /// Decode a received body
    pub fn decode(raw: &RawEnvelope) -> Result<Self> {
        let wire: WireMessage = serde_json::from_slice(&raw.body)?;
        let id = wire.id.unwrap_or_else(MessageId::generate);
        let thread = wire.thread.unwrap_or_default();
        let thread_id = thread.thid.unwrap_or_else(|| ThreadId::new(id.as_str()));

        // Some agents send `~content` as a JSON document inside a string
        let content = match wire.content {
            Value::String(inner) => serde_json::from_str(&inner).unwrap_or(Value::String(inner)),
            other => other,
        };

        Ok(Self {
            message_type: wire.message_type,
            id,
            thread_id,
            parent_thread_id: thread.pthid,
            sender: raw.sender.clone(),
            content,
            thread_extra: thread.extra,
            extra: wire.extra,
        })
    }

    /// Encode to the JSON wire shape
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_wire())?)
    }

    /// JSON wire shape as a value
    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self.to_wire())?)
    }

    fn to_wire(&self) -> WireMessage {
        WireMessage {
            message_type: self.message_type.clone(),
            id: Some(self.id.clone()),
            thread: Some(ThreadDecorator {
                thid: Some(self.thread_id.clone()),
                pthid: self.parent_thread_id.clone(),
                extra: self.thread_extra.clone(),
            }),
            content: self.content.clone(),
            extra: self.extra.clone(),
        }
    }

    /// Resolved message kind
    pub fn kind(&self) -> MessageKind {
        MessageKind::resolve(&self.message_type)
    }

    /// Decode `~content` as a typed payload
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.content.clone()).map_err(|source| {
            ProtocolError::InvalidPayload { kind: self.message_type.name().to_string(), source }
        })
    }

    /// Unknown top-level fields preserved from the wire
    pub fn extra_fields(&self) -> &Map<String, Value> {
        &self.extra
    }

    /// Reply on the same thread, keeping the peer's `@type` family
    pub fn reply<T: Serialize>(&self, name: &str, from: AgentId, payload: &T) -> Result<Self> {
        Self::with_payload(self.message_type.sibling(name), self.thread_id.clone(), from, payload)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::kind::MessageKind;

    fn raw(value: &Value) -> RawEnvelope {
        RawEnvelope::new(AgentId::new("alice"), serde_json::to_vec(value).unwrap())
    }

    #[test]
    fn decodes_thread_and_sender() {
        let env = Envelope::decode(&raw(&json!({
            "@type": "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/ping/1.0/ping",
            "@id": "m1",
            "~thread": {"thid": "t1"},
            "~content": {"response_requested": true}
        })))
        .unwrap();

        assert_eq!(env.kind(), MessageKind::Ping);
        assert_eq!(env.thread_id, ThreadId::new("t1"));
        assert_eq!(env.id, MessageId::new("m1"));
        assert_eq!(env.sender, AgentId::new("alice"));
    }

    #[test]
    fn missing_thread_starts_thread_at_message_id() {
        let env = Envelope::decode(&raw(&json!({
            "@type": "https://didcomm.org/basicmessage/1.0/message",
            "@id": "m7",
            "~content": {"content": "hi"}
        })))
        .unwrap();
        assert_eq!(env.thread_id.as_str(), "m7");
    }

    #[test]
    fn string_content_is_parsed_as_json() {
        let env = Envelope::decode(&raw(&json!({
            "@type": "https://didcomm.org/basicmessage/1.0/message",
            "~content": "{\"content\": \"hello\"}"
        })))
        .unwrap();
        assert_eq!(env.content, json!({"content": "hello"}));
    }

    #[test]
    fn unknown_fields_survive_reencoding() {
        let env = Envelope::decode(&raw(&json!({
            "@type": "https://didcomm.org/basicmessage/1.0/message",
            "@id": "m1",
            "~thread": {"thid": "t1", "sender_order": 3},
            "~content": {"content": "hi"},
            "~timing": {"out_time": "2024-01-01T00:00:00Z"}
        })))
        .unwrap();
        assert!(env.extra_fields().contains_key("~timing"));

        let wire = env.to_json().unwrap();
        assert_eq!(wire["~timing"]["out_time"], "2024-01-01T00:00:00Z");
        assert_eq!(wire["~thread"]["sender_order"], 3);
        assert_eq!(wire["~thread"]["thid"], "t1");
    }

    #[test]
    fn rejects_missing_or_invalid_type() {
        assert!(Envelope::decode(&raw(&json!({"~content": {}}))).is_err());
        assert!(Envelope::decode(&raw(&json!({"@type": "garbage"}))).is_err());
        let not_json = RawEnvelope::new(AgentId::new("alice"), b"not json".to_vec());
        assert!(Envelope::decode(&not_json).is_err());
    }

    #[test]
    fn reply_keeps_thread_and_family() {
        let env = Envelope::decode(&raw(&json!({
            "@type": "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/ping/1.0/ping",
            "~thread": {"thid": "t1"}
        })))
        .unwrap();
        let reply = env.reply("ping_response", AgentId::new("bob"), &json!({})).unwrap();
        assert_eq!(reply.thread_id, env.thread_id);
        assert_eq!(reply.kind(), MessageKind::PingResponse);
        assert_eq!(reply.message_type.prefix(), env.message_type.prefix());
    }

    #[test]
    fn payload_errors_name_the_kind() {
        let env = Envelope::decode(&raw(&json!({
            "@type": "https://didcomm.org/connections/1.0/request",
            "~content": {"label": "bob"}
        })))
        .unwrap();
        let err = env.payload::<crate::payloads::ConnectionRequest>().unwrap_err();
        assert!(err.to_string().contains("request"));
    }
}
