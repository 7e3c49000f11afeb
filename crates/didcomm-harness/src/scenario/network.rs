//! FIFO delivery queue shared by every agent in a scenario.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use didcomm_agent::{Transport, TransportError};
use didcomm_proto::{AgentId, Envelope, RawEnvelope};

/// One envelope in flight
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Sending agent
    pub from: AgentId,
    /// Destination agent
    pub to: AgentId,
    /// The envelope as sent
    pub envelope: Envelope,
}

/// Queue of envelopes not yet delivered
#[derive(Clone, Default)]
pub struct QueueNetwork {
    queue: Arc<Mutex<VecDeque<Delivery>>>,
}

impl QueueNetwork {
    /// Empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport for `id`; its sends land on this queue
    pub fn transport(&self, id: AgentId) -> QueueTransport {
        QueueTransport { id, queue: self.queue.clone() }
    }

    /// Oldest undelivered envelope
    pub fn pop(&self) -> Option<Delivery> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front()
    }

    /// Envelopes waiting
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Nothing in flight
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Send-only transport; the scenario delivers envelopes itself
pub struct QueueTransport {
    id: AgentId,
    queue: Arc<Mutex<VecDeque<Delivery>>>,
}

#[async_trait]
impl Transport for QueueTransport {
    async fn receive(&self) -> Option<RawEnvelope> {
        std::future::pending().await
    }

    async fn send(&self, envelope: Envelope, destination: &AgentId) -> Result<(), TransportError> {
        let delivery = Delivery { from: self.id.clone(), to: destination.clone(), envelope };
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).push_back(delivery);
        Ok(())
    }
}
