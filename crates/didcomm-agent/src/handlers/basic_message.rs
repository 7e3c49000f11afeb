//! Basic messages over completed connections.

use async_trait::async_trait;
use didcomm_core::{Environment, StoredMessage};
use didcomm_proto::{Envelope, payloads::BasicMessage};
use tracing::info;

use crate::{context::AgentContext, error::DispatchError, handler::Handler};

/// Appends received messages to the connection's message log
pub struct BasicMessageHandler;

#[async_trait]
impl<E: Environment> Handler<E> for BasicMessageHandler {
    async fn handle(
        &self,
        ctx: &AgentContext<E>,
        envelope: &Envelope,
    ) -> Result<Option<Envelope>, DispatchError> {
        let message: BasicMessage = envelope.payload()?;
        let connection = ctx.completed_connection(&envelope.sender).await?;

        ctx.storage.append_message(&StoredMessage {
            connection_id: connection.id(),
            content: message.content,
            sent_time: message.sent_time,
            received_at: ctx.env.now(),
        })?;
        info!(connection_id = %connection.id(), from = %envelope.sender, "basic message received");

        Ok(None)
    }
}
