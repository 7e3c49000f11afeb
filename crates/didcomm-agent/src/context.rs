//! Shared state passed to the dispatcher and every handler.

use std::sync::Arc;

use didcomm_core::{
    ConnectionAction, ConnectionRecord, CredentialExchange, Environment, ExchangeAction,
    PresentationAction, PresentationExchange, Storage, StoredReply,
};
use didcomm_proto::{AgentId, ConnectionId, Envelope, ThreadId};
use tracing::{info, warn};

use crate::{
    config::AgentConfig,
    error::DispatchError,
    registry::{ConnectionRegistry, ExchangeRegistry, PresentationRegistry},
    routing::RouteRegistrar,
    schema::SchemaRegistry,
    wallet::Wallet,
};

/// Everything a handler may touch
pub struct AgentContext<E: Environment> {
    /// Address of this agent
    pub id: AgentId,
    /// Runtime configuration
    pub config: AgentConfig,
    /// Time and randomness
    pub env: E,
    /// Key and credential operations
    pub wallet: Arc<dyn Wallet>,
    /// Schema resolution
    pub schemas: Arc<dyn SchemaRegistry>,
    /// Called when a connection completes
    pub registrar: Option<Arc<dyn RouteRegistrar>>,
    /// Durable storage shared by the registries
    pub storage: Arc<dyn Storage>,
    /// Connection records
    pub connections: ConnectionRegistry,
    /// Credential exchange records
    pub exchanges: ExchangeRegistry,
    /// Presentation records
    pub presentations: PresentationRegistry,
}

/// What carrying out connection actions produced
#[derive(Debug, Default)]
pub struct ConnectionOutcome {
    /// Reply to send, if any
    pub reply: Option<Envelope>,
    /// Snapshot of the record if it just completed
    pub completed: Option<ConnectionRecord>,
}

impl<E: Environment> AgentContext<E> {
    /// Wrap a stored reply into an outbound envelope on `thread_id`
    pub fn outbound(&self, thread_id: &ThreadId, reply: &StoredReply) -> Envelope {
        Envelope::new(
            reply.message_type.clone(),
            thread_id.clone(),
            self.id.clone(),
            reply.content.clone(),
        )
    }

    /// Completed connection with `peer`, as a snapshot
    ///
    /// # Errors
    /// `UnknownRecord` if there is none, `ConnectionNotReady` if it was
    /// abandoned since it completed
    pub async fn completed_connection(
        &self,
        peer: &AgentId,
    ) -> Result<ConnectionRecord, DispatchError> {
        let handle = self
            .connections
            .by_peer(peer)
            .ok_or_else(|| DispatchError::UnknownRecord(format!("connection with {peer}")))?;
        let record = handle.lock().await.clone();
        if record.is_completed() {
            Ok(record)
        } else {
            Err(DispatchError::ConnectionNotReady { state: record.state() })
        }
    }

    /// Connection an exchange or presentation runs over, as a snapshot
    pub async fn connection_of(
        &self,
        connection_id: ConnectionId,
    ) -> Result<ConnectionRecord, DispatchError> {
        let handle = self
            .connections
            .get(connection_id)
            .ok_or_else(|| DispatchError::UnknownRecord(format!("connection {connection_id}")))?;
        Ok(handle.lock().await.clone())
    }

    /// Carry out connection actions while the record is still locked.
    ///
    /// Route registration is left to [`Self::finish_connection`], which the
    /// caller runs once the record's lock is released.
    pub fn execute_connection(
        &self,
        record: &ConnectionRecord,
        actions: Vec<ConnectionAction>,
    ) -> ConnectionOutcome {
        let mut outcome = ConnectionOutcome::default();
        for action in actions {
            match action {
                ConnectionAction::Send(reply) => {
                    outcome.reply = Some(self.outbound(record.thread_id(), &reply));
                },
                ConnectionAction::Completed { connection_id, peer_did } => {
                    info!(%connection_id, %peer_did, "connection completed");
                    outcome.completed = Some(record.clone());
                },
                ConnectionAction::Abandoned { reason } => {
                    info!(connection_id = %record.id(), %reason, "connection abandoned");
                },
            }
        }
        outcome
    }

    /// Register the route of a just-completed connection, returning the
    /// reply to send. Must run without the record's lock held.
    pub async fn finish_connection(&self, outcome: ConnectionOutcome) -> Option<Envelope> {
        if let (Some(record), Some(registrar)) = (&outcome.completed, &self.registrar) {
            if let Err(e) = registrar.register(record).await {
                warn!(connection_id = %record.id(), error = %e, "route registration failed");
            }
        }
        outcome.reply
    }

    /// Carry out exchange actions, returning the reply to send, if any
    pub fn execute_exchange(
        &self,
        record: &CredentialExchange,
        actions: Vec<ExchangeAction>,
    ) -> Option<Envelope> {
        let mut outbound = None;
        for action in actions {
            match action {
                ExchangeAction::Send(reply) => {
                    outbound = Some(self.outbound(record.thread_id(), &reply));
                },
                ExchangeAction::Completed { exchange_id, credential_id } => {
                    info!(%exchange_id, credential_id = credential_id.as_deref(), "exchange acknowledged");
                },
                ExchangeAction::Abandoned { reason } => {
                    info!(exchange_id = %record.id(), %reason, "exchange abandoned");
                },
            }
        }
        outbound
    }

    /// Carry out presentation actions, returning the reply to send, if any
    pub fn execute_presentation(
        &self,
        record: &PresentationExchange,
        actions: Vec<PresentationAction>,
    ) -> Option<Envelope> {
        let mut outbound = None;
        for action in actions {
            match action {
                PresentationAction::Send(reply) => {
                    outbound = Some(self.outbound(record.thread_id(), &reply));
                },
                PresentationAction::Completed { exchange_id, revealed } => {
                    let attributes: Vec<&String> = revealed.keys().collect();
                    info!(%exchange_id, ?attributes, "presentation acknowledged");
                },
                PresentationAction::Abandoned { reason } => {
                    info!(exchange_id = %record.id(), %reason, "presentation abandoned");
                },
            }
        }
        outbound
    }
}
