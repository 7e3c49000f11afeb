//! Transport abstraction.
//!
//! A transport hands the agent already-unpacked envelopes together with the
//! sending agent's address, and delivers outbound envelopes to an address.
//! Encryption and physical delivery are its business, not the engine's.
//!
//! Production uses [`crate::StdioTransport`], in-process tests use
//! [`ChannelTransport`], simulation tests use the harness's turmoil transport.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use async_trait::async_trait;
use didcomm_proto::{AgentId, Envelope, RawEnvelope};
use tokio::sync::{Mutex, mpsc};
use tracing::trace;

use crate::error::TransportError;

/// Moves envelopes between agents.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Next inbound envelope.
    ///
    /// Suspends until one arrives. Returns `None` once the inbound stream is
    /// closed for good. Must be cancel-safe: the agent loop races it against
    /// shutdown.
    async fn receive(&self) -> Option<RawEnvelope>;

    /// Deliver an envelope to `destination`
    async fn send(&self, envelope: Envelope, destination: &AgentId) -> Result<(), TransportError>;
}

type Mailboxes = Arc<RwLock<HashMap<AgentId, mpsc::UnboundedSender<RawEnvelope>>>>;

/// In-process switch connecting [`ChannelTransport`]s by agent id
#[derive(Clone, Default)]
pub struct ChannelNetwork {
    mailboxes: Mailboxes,
}

impl ChannelNetwork {
    /// Empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an agent; replaces any previous attachment under the same id
    pub fn join(&self, id: AgentId) -> ChannelTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.mailboxes.write().unwrap_or_else(PoisonError::into_inner).insert(id.clone(), tx);
        ChannelTransport { id, mailboxes: self.mailboxes.clone(), inbox: Mutex::new(rx) }
    }

    /// Detach an agent. Its inbound stream ends once queued envelopes are read.
    pub fn leave(&self, id: &AgentId) {
        self.mailboxes.write().unwrap_or_else(PoisonError::into_inner).remove(id);
    }

    /// Deliver raw bytes as if `raw.sender` had sent them
    pub fn inject(&self, destination: &AgentId, raw: RawEnvelope) -> Result<(), TransportError> {
        deliver(&self.mailboxes, destination, raw)
    }
}

fn deliver(
    mailboxes: &Mailboxes,
    destination: &AgentId,
    raw: RawEnvelope,
) -> Result<(), TransportError> {
    let mailboxes = mailboxes.read().unwrap_or_else(PoisonError::into_inner);
    let mailbox = mailboxes
        .get(destination)
        .ok_or_else(|| TransportError::UnknownDestination(destination.clone()))?;
    mailbox.send(raw).map_err(|_| TransportError::Closed)
}

/// One agent's attachment to a [`ChannelNetwork`]
pub struct ChannelTransport {
    id: AgentId,
    mailboxes: Mailboxes,
    inbox: Mutex<mpsc::UnboundedReceiver<RawEnvelope>>,
}

impl ChannelTransport {
    /// Address of the attached agent
    pub fn id(&self) -> &AgentId {
        &self.id
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn receive(&self) -> Option<RawEnvelope> {
        self.inbox.lock().await.recv().await
    }

    async fn send(&self, envelope: Envelope, destination: &AgentId) -> Result<(), TransportError> {
        let body = envelope.encode()?;
        trace!(from = %self.id, to = %destination, kind = %envelope.kind(), "channel send");
        deliver(&self.mailboxes, destination, RawEnvelope::new(self.id.clone(), body))
    }
}

#[cfg(test)]
mod tests {
    use didcomm_proto::{Protocol, ThreadId, payloads::Ping};

    use super::*;

    #[tokio::test]
    async fn delivers_between_attached_agents() {
        let network = ChannelNetwork::new();
        let alice = network.join(AgentId::new("alice"));
        let bob = network.join(AgentId::new("bob"));

        let ping = Envelope::with_payload(
            Protocol::TrustPing.message_type("ping"),
            ThreadId::new("t1"),
            AgentId::new("alice"),
            &Ping::default(),
        )
        .unwrap();
        alice.send(ping, bob.id()).await.unwrap();

        let raw = bob.receive().await.unwrap();
        assert_eq!(raw.sender, AgentId::new("alice"));
        let decoded = Envelope::decode(&raw).unwrap();
        assert_eq!(decoded.thread_id, ThreadId::new("t1"));
    }

    #[tokio::test]
    async fn unknown_destination_and_leave() {
        let network = ChannelNetwork::new();
        let alice = network.join(AgentId::new("alice"));

        let result = network.inject(&AgentId::new("carol"), RawEnvelope::new(AgentId::new("x"), "{}"));
        assert!(matches!(result, Err(TransportError::UnknownDestination(_))));

        network.inject(alice.id(), RawEnvelope::new(AgentId::new("x"), "{}")).unwrap();
        network.leave(alice.id());
        assert!(alice.receive().await.is_some());
        assert!(alice.receive().await.is_none());
    }
}
