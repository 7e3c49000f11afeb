//! Trust ping: stateless liveness check.

use async_trait::async_trait;
use didcomm_core::Environment;
use didcomm_proto::{
    Envelope, MessageKind,
    payloads::{Ping, PingResponse},
};
use tracing::debug;

use crate::{context::AgentContext, error::DispatchError, handler::Handler};

/// Answers `ping` with `ping_response` on the same thread
pub struct TrustPingHandler;

#[async_trait]
impl<E: Environment> Handler<E> for TrustPingHandler {
    async fn handle(
        &self,
        ctx: &AgentContext<E>,
        envelope: &Envelope,
    ) -> Result<Option<Envelope>, DispatchError> {
        match envelope.kind() {
            MessageKind::Ping => {
                let ping: Ping = envelope.payload()?;
                if !ping.response_requested {
                    return Ok(None);
                }
                let reply = envelope.reply("ping_response", ctx.id.clone(), &PingResponse::default())?;
                Ok(Some(reply))
            },
            MessageKind::PingResponse => {
                debug!(from = %envelope.sender, thread = %envelope.thread_id, "ping answered");
                Ok(None)
            },
            other => Err(DispatchError::UnsupportedMessageKind { kind: other.to_string() }),
        }
    }
}
