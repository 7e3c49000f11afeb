//! Transport over turmoil's simulated TCP.
//!
//! Every agent is a turmoil host named after its [`AgentId`] and listens on
//! [`SimTransport::PORT`]. Envelopes travel as newline-delimited JSON
//! `{"from": "<agent>", "message": {...}}`, one outbound stream per
//! destination, reopened when a write fails.

use std::collections::HashMap;

use async_trait::async_trait;
use didcomm_agent::{Transport, TransportError};
use didcomm_proto::{AgentId, Envelope, RawEnvelope};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::{Mutex, mpsc},
};
use tracing::{debug, trace, warn};
use turmoil::net::{TcpListener, TcpStream};

#[derive(Serialize, Deserialize)]
struct WireLine {
    from: AgentId,
    message: Value,
}

/// Agent transport on a turmoil host
pub struct SimTransport {
    id: AgentId,
    inbox: Mutex<mpsc::UnboundedReceiver<RawEnvelope>>,
    peers: Mutex<HashMap<AgentId, TcpStream>>,
}

impl SimTransport {
    /// Port every simulated agent listens on
    pub const PORT: u16 = 7000;

    /// Listen for peers on the current turmoil host.
    ///
    /// Must be called from inside a turmoil host or client, whose name should
    /// equal `id` so that peers can reach it.
    pub async fn bind(id: AgentId) -> io::Result<Self> {
        let listener = TcpListener::bind(format!("0.0.0.0:{}", Self::PORT)).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(accept(listener, tx));

        debug!(agent = %id, port = Self::PORT, "sim transport listening");
        Ok(Self { id, inbox: Mutex::new(rx), peers: Mutex::new(HashMap::new()) })
    }

    /// This agent's address
    pub fn id(&self) -> &AgentId {
        &self.id
    }
}

async fn accept(listener: TcpListener, inbox: mpsc::UnboundedSender<RawEnvelope>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                trace!(%addr, "peer connected");
                tokio::spawn(read_lines(stream, inbox.clone()));
            },
            Err(e) => {
                warn!(error = %e, "accept failed, listener closed");
                return;
            },
        }
    }
}

async fn read_lines(stream: TcpStream, inbox: mpsc::UnboundedSender<RawEnvelope>) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "peer stream failed");
                return;
            },
        };

        let raw = serde_json::from_str::<WireLine>(&line).and_then(|wire| {
            serde_json::to_vec(&wire.message).map(|body| RawEnvelope::new(wire.from, body))
        });
        match raw {
            Ok(raw) => {
                if inbox.send(raw).is_err() {
                    return;
                }
            },
            Err(e) => warn!(error = %e, "malformed line skipped"),
        }
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn receive(&self) -> Option<RawEnvelope> {
        self.inbox.lock().await.recv().await
    }

    async fn send(&self, envelope: Envelope, destination: &AgentId) -> Result<(), TransportError> {
        let wire = WireLine { from: self.id.clone(), message: envelope.to_json()? };
        let mut bytes = serde_json::to_vec(&wire).map_err(io::Error::from)?;
        bytes.push(b'\n');

        let mut peers = self.peers.lock().await;
        if let Some(stream) = peers.get_mut(destination) {
            if stream.write_all(&bytes).await.is_ok() {
                return Ok(());
            }
            debug!(peer = %destination, "stream broken, reconnecting");
            peers.remove(destination);
        }

        let mut stream = TcpStream::connect(format!("{destination}:{}", Self::PORT)).await?;
        stream.write_all(&bytes).await?;
        peers.insert(destination.clone(), stream);
        Ok(())
    }
}
