//! Connections protocol handler.
//!
//! Every connection message after the invitation carries the invitation's
//! thread id, which is how the record is found. The sender must be the peer
//! the record already knows, except for the request that introduces it.
//!
//! Replies are built while the record is locked; the route registrar only
//! runs after the lock is released.

use async_trait::async_trait;
use didcomm_core::{ConnectionRecord, Environment, Inbound};
use didcomm_proto::{
    ConnectionMessage, Envelope, MessageKind,
    payloads::{ConnectionRequest, ConnectionResponse, Invitation, ProblemReport},
};
use tracing::{debug, info};

use crate::{context::AgentContext, error::DispatchError, handler::Handler};

/// Drives connection records from inbound connection messages
pub struct ConnectionHandler;

#[async_trait]
impl<E: Environment> Handler<E> for ConnectionHandler {
    async fn handle(
        &self,
        ctx: &AgentContext<E>,
        envelope: &Envelope,
    ) -> Result<Option<Envelope>, DispatchError> {
        let message = match envelope.kind() {
            MessageKind::Connection(ConnectionMessage::Invitation) => {
                return receive_invitation(ctx, envelope).await;
            },
            MessageKind::Connection(message) => message,
            other => return Err(DispatchError::UnsupportedMessageKind { kind: other.to_string() }),
        };

        let handle = ctx.connections.by_thread(&envelope.thread_id).ok_or_else(|| {
            DispatchError::UnknownRecord(format!("connection thread {}", envelope.thread_id))
        })?;
        let mut record = handle.lock().await;

        if let Some(peer) = record.peer_agent() {
            if peer != &envelope.sender {
                return Err(DispatchError::UnknownRecord(format!(
                    "connection thread {} with {}",
                    envelope.thread_id, envelope.sender
                )));
            }
        }

        if record.check_inbound(message)? == Inbound::Duplicate {
            debug!(connection_id = %record.id(), kind = message.name(), "duplicate connection message");
            let outcome = ctx.execute_connection(&record, record.duplicate_actions());
            drop(record);
            return Ok(ctx.finish_connection(outcome).await);
        }

        let now = ctx.env.now();
        let mut next = record.clone();
        let actions = match message {
            ConnectionMessage::Request => {
                let request: ConnectionRequest = envelope.payload()?;
                let mut actions = next.receive_request(&envelope.sender, &request, now)?;
                if ctx.config.auto_accept_connections {
                    let did = ctx.wallet.create_did().await?;
                    actions.extend(next.send_response(did, now)?);
                }
                actions
            },
            ConnectionMessage::Response => {
                let response: ConnectionResponse = envelope.payload()?;
                next.receive_response(&response, now)?
            },
            ConnectionMessage::Ack => next.receive_ack(now)?,
            ConnectionMessage::ProblemReport => {
                let report: ProblemReport = envelope.payload()?;
                next.receive_problem_report(&report, now)?
            },
            ConnectionMessage::Invitation => {
                return Err(DispatchError::InvalidTransition(
                    "invitation on an existing connection thread".into(),
                ));
            },
        };

        ctx.connections.commit(&mut record, next)?;
        info!(
            connection_id = %record.id(),
            state = ?record.state(),
            peer = %envelope.sender,
            "connection {}",
            message.name()
        );

        let outcome = ctx.execute_connection(&record, actions);
        drop(record);
        Ok(ctx.finish_connection(outcome).await)
    }
}

/// Invitee side: create a record from an invitation and, with auto-accept,
/// answer it with a request.
async fn receive_invitation<E: Environment>(
    ctx: &AgentContext<E>,
    envelope: &Envelope,
) -> Result<Option<Envelope>, DispatchError> {
    if let Some(handle) = ctx.connections.by_thread(&envelope.thread_id) {
        let record = handle.lock().await;
        // Our own invitation reflected back is rejected here as well
        record.check_inbound(ConnectionMessage::Invitation)?;
        debug!(connection_id = %record.id(), "duplicate invitation");
        let outcome = ctx.execute_connection(&record, record.duplicate_actions());
        drop(record);
        return Ok(ctx.finish_connection(outcome).await);
    }

    let invitation: Invitation = envelope.payload()?;
    let now = ctx.env.now();
    let mut record = ConnectionRecord::from_invitation(
        ctx.env.connection_id(),
        envelope.thread_id.clone(),
        &invitation,
        envelope.sender.clone(),
        now,
    );

    let actions = if ctx.config.auto_accept_connections {
        let did = ctx.wallet.create_did().await?;
        record.send_request(did, &ctx.config.label, now)?
    } else {
        Vec::new()
    };

    info!(
        connection_id = %record.id(),
        inviter = %envelope.sender,
        label = %invitation.label,
        "invitation received"
    );
    let handle = ctx.connections.insert(record)?;
    let outcome = ctx.execute_connection(&*handle.lock().await, actions);
    Ok(ctx.finish_connection(outcome).await)
}
