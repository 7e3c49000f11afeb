//! Line-delimited JSON transport over a byte stream pair.
//!
//! Each inbound line is `{"from": "<agent>", "message": {...}}` and each
//! outbound line is `{"to": "<agent>", "message": {...}}`. Whatever sits on
//! the other end of the pipe (a relay, a test script, a mediator) does the
//! actual delivery and packing.

use async_trait::async_trait;
use didcomm_proto::{AgentId, Envelope, RawEnvelope};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines},
    sync::Mutex,
};
use tracing::{trace, warn};

use crate::{error::TransportError, transport::Transport};

#[derive(Deserialize)]
struct InboundLine {
    from: AgentId,
    message: Value,
}

#[derive(Serialize)]
struct OutboundLine<'a> {
    to: &'a AgentId,
    message: Value,
}

#[derive(Serialize)]
struct InvitationLine<'a> {
    invitation: &'a str,
    message: Value,
}

/// Transport reading from `R` and writing to `W`
pub struct StdioTransport<R, W> {
    lines: Mutex<Lines<R>>,
    writer: Mutex<W>,
}

impl StdioTransport<BufReader<io::Stdin>, io::Stdout> {
    /// Transport over the process's stdin and stdout
    pub fn stdio() -> Self {
        Self::new(BufReader::new(io::stdin()), io::stdout())
    }
}

impl<R, W> StdioTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Transport over an arbitrary reader/writer pair
    pub fn new(reader: R, writer: W) -> Self {
        Self { lines: Mutex::new(reader.lines()), writer: Mutex::new(writer) }
    }

    /// Write an invitation line for out-of-band distribution
    pub async fn publish_invitation(
        &self,
        url: &str,
        envelope: &Envelope,
    ) -> Result<(), TransportError> {
        let line = InvitationLine { invitation: url, message: envelope.to_json()? };
        self.write_line(&line).await
    }

    async fn write_line<T: Serialize>(&self, line: &T) -> Result<(), TransportError> {
        let mut bytes = serde_json::to_vec(line).map_err(io::Error::from)?;
        bytes.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<R, W> Transport for StdioTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn receive(&self) -> Option<RawEnvelope> {
        let mut lines = self.lines.lock().await;
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => {
                    warn!(error = %e, "stdin read failed");
                    return None;
                },
            };
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<InboundLine>(&line) {
                Ok(inbound) => match serde_json::to_vec(&inbound.message) {
                    Ok(body) => return Some(RawEnvelope::new(inbound.from, body)),
                    Err(e) => warn!(error = %e, "unencodable inbound message"),
                },
                Err(e) => warn!(error = %e, "skipping malformed input line"),
            }
        }
    }

    async fn send(&self, envelope: Envelope, destination: &AgentId) -> Result<(), TransportError> {
        trace!(to = %destination, kind = %envelope.kind(), "stdio send");
        let line = OutboundLine { to: destination, message: envelope.to_json()? };
        self.write_line(&line).await
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use didcomm_proto::{Protocol, ThreadId, payloads::Ping};
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn reads_lines_and_skips_garbage() {
        let input = [
            "not json",
            "",
            r#"{"from":"alice","message":{"@type":"https://didcomm.org/trust_ping/1.0/ping"}}"#,
        ]
        .join("\n");
        let transport = StdioTransport::new(Cursor::new(input.into_bytes()), Vec::<u8>::new());

        let raw = transport.receive().await.unwrap();
        assert_eq!(raw.sender, AgentId::new("alice"));
        let envelope = Envelope::decode(&raw).unwrap();
        assert_eq!(envelope.message_type.name(), "ping");

        assert!(transport.receive().await.is_none());
    }

    #[tokio::test]
    async fn writes_one_line_per_envelope() {
        let transport = StdioTransport::new(Cursor::new(Vec::<u8>::new()), Vec::<u8>::new());
        let ping = Envelope::with_payload(
            Protocol::TrustPing.message_type("ping"),
            ThreadId::new("t1"),
            AgentId::new("bob"),
            &Ping { response_requested: true, comment: None },
        )
        .unwrap();

        transport.send(ping.clone(), &AgentId::new("alice")).await.unwrap();
        transport.publish_invitation("didcomm://bob?c_i=abc", &ping).await.unwrap();

        let written = String::from_utf8(transport.writer.into_inner()).unwrap();
        let lines: Vec<Value> =
            written.lines().map(|line| serde_json::from_str(line).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["to"], json!("alice"));
        assert_eq!(lines[0]["message"]["~thread"]["thid"], json!("t1"));
        assert_eq!(lines[1]["invitation"], json!("didcomm://bob?c_i=abc"));
    }
}
