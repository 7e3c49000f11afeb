//! Agent: the local API and the run loop.
//!
//! ```text
//!                 ┌──────────────┐  hash(thid) % workers   ┌────────┐
//! Transport ────> │  intake loop │ ──────────────────────> │ lane 0 │ ─┐
//!  receive()      │ decode once  │ ──────────────────────> │ lane 1 │ ─┤ Dispatcher::route
//!                 └──────────────┘          ...            │  ...   │ ─┤      │
//!                        ↑                                 └────────┘  │      ↓
//!                    shutdown                                          └─> Transport::send
//! ```
//!
//! Envelopes of one thread always land in the same lane, so they are handled
//! in delivery order and never concurrently. Different threads run in
//! parallel. Local API calls go straight to the registries and take the same
//! per-record locks as the workers. The route registrar runs after a
//! completed connection's lock is released.
//!
//! # Shutdown
//!
//! Once the signal fires the intake loop stops taking envelopes from the
//! transport. Lanes are then closed, and workers finish everything already
//! queued before `run` returns. The expiry sweeper stops last.

use std::{
    collections::BTreeSet,
    hash::{DefaultHasher, Hash, Hasher},
    sync::Arc,
    time::Duration,
};

use didcomm_core::{
    ConnectionAction, ConnectionRecord, ConnectionRole, ConnectionState, CredentialExchange,
    Environment, ExchangeAction, ExchangeRole, ExchangeState, MemoryStorage, PresentationAction,
    PresentationExchange, PresentationRole, PresentationState, Storage, StorageError,
    StoredMessage,
};
use didcomm_proto::{
    AgentId, ConnectionId, ConnectionMessage, Envelope, ExchangeId, Protocol, ProtocolError,
    RawEnvelope, ThreadId, invitation,
    payloads::{Attributes, BasicMessage, CredentialProposal, Invitation, Ping, PresentationRequest},
};
use tokio::{
    sync::{MutexGuard, mpsc},
    task::JoinSet,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::AgentConfig,
    context::AgentContext,
    dispatcher::Dispatcher,
    error::{AgentError, DispatchError},
    handler::HandlerSet,
    handlers::credentials::{build_offer, holder_request, validate},
    registry::{
        ConnectionHandle, ConnectionRegistry, ExchangeHandle, ExchangeRegistry,
        PresentationHandle, PresentationRegistry,
    },
    routing::RouteRegistrar,
    schema::{MemorySchemaRegistry, SchemaRegistry},
    shutdown::{ShutdownSignal, shutdown_channel},
    transport::Transport,
    wallet::{MemoryWallet, Wallet},
};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Assembles an [`Agent`] from its collaborators
pub struct AgentBuilder<E: Environment> {
    id: AgentId,
    env: E,
    config: AgentConfig,
    wallet: Arc<dyn Wallet>,
    schemas: Arc<dyn SchemaRegistry>,
    registrar: Option<Arc<dyn RouteRegistrar>>,
    storage: Arc<dyn Storage>,
}

impl<E: Environment> AgentBuilder<E> {
    /// Builder with in-memory collaborators and default configuration
    pub fn new(id: AgentId, env: E) -> Self {
        Self {
            id,
            env,
            config: AgentConfig::default(),
            wallet: Arc::new(MemoryWallet::new()),
            schemas: Arc::new(MemorySchemaRegistry::new()),
            registrar: None,
            storage: Arc::new(MemoryStorage::new()),
        }
    }

    /// Runtime configuration
    #[must_use]
    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Wallet collaborator
    #[must_use]
    pub fn wallet(mut self, wallet: Arc<dyn Wallet>) -> Self {
        self.wallet = wallet;
        self
    }

    /// Schema registry collaborator
    #[must_use]
    pub fn schemas(mut self, schemas: Arc<dyn SchemaRegistry>) -> Self {
        self.schemas = schemas;
        self
    }

    /// Mediation callback invoked when a connection completes
    #[must_use]
    pub fn registrar(mut self, registrar: Arc<dyn RouteRegistrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    /// Durable storage for records and messages
    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = storage;
        self
    }

    /// Load stored records and attach the agent to `transport`
    ///
    /// # Errors
    /// `Storage` if stored records cannot be read
    pub fn build<T: Transport>(self, transport: T) -> Result<Agent<E, T>, AgentError> {
        let connections = ConnectionRegistry::load(self.storage.clone())?;
        let exchanges = ExchangeRegistry::load(self.storage.clone())?;
        let presentations = PresentationRegistry::load(self.storage.clone())?;

        let ctx = AgentContext {
            id: self.id,
            config: self.config,
            env: self.env,
            wallet: self.wallet,
            schemas: self.schemas,
            registrar: self.registrar,
            storage: self.storage,
            connections,
            exchanges,
            presentations,
        };
        let dispatcher = Dispatcher::new(Arc::new(ctx), Arc::new(HandlerSet::with_builtin()));

        Ok(Agent { dispatcher: Arc::new(dispatcher), transport: Arc::new(transport) })
    }
}

/// Result of [`Agent::create_invitation`]
#[derive(Debug, Clone)]
pub struct CreatedInvitation {
    /// Inviter-side record, in `Invitation`
    pub connection: ConnectionRecord,
    /// Invitation message
    pub envelope: Envelope,
    /// Out-of-band URL carrying the invitation
    pub url: String,
}

/// A running or runnable DIDComm agent.
///
/// Cheap to clone; clones share all state.
pub struct Agent<E: Environment, T: Transport> {
    dispatcher: Arc<Dispatcher<E>>,
    transport: Arc<T>,
}

impl<E: Environment, T: Transport> Clone for Agent<E, T> {
    fn clone(&self) -> Self {
        Self { dispatcher: self.dispatcher.clone(), transport: self.transport.clone() }
    }
}

impl<E: Environment, T: Transport> Agent<E, T> {
    /// Address of this agent
    pub fn id(&self) -> &AgentId {
        &self.context().id
    }

    /// Shared agent state
    pub fn context(&self) -> &Arc<AgentContext<E>> {
        self.dispatcher.context()
    }

    /// Handler set, mutable while running
    pub fn handlers(&self) -> &Arc<HandlerSet<E>> {
        self.dispatcher.handlers()
    }

    /// Transport the agent is attached to
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    // Connections

    /// Create an inviter-side connection and its out-of-band invitation
    pub fn create_invitation(&self) -> Result<CreatedInvitation, DispatchError> {
        let ctx = self.context();
        let payload = Invitation {
            label: ctx.config.label.clone(),
            service_endpoint: Some(ctx.id.as_str().to_string()),
            recipient_keys: Vec::new(),
        };
        let envelope = Envelope::with_payload(
            ConnectionMessage::Invitation.message_type(),
            ThreadId::generate(),
            ctx.id.clone(),
            &payload,
        )?;

        let base = ctx.config.endpoint.clone().unwrap_or_else(|| format!("didcomm://{}", ctx.id));
        let url = invitation::encode_url(&base, &envelope)?;

        let connection = ConnectionRecord::new_invitation(
            ctx.env.connection_id(),
            envelope.thread_id.clone(),
            Some(url.clone()),
            ctx.env.now(),
        );
        ctx.connections.insert(connection.clone())?;
        info!(connection_id = %connection.id(), thread = %envelope.thread_id, "invitation created");

        Ok(CreatedInvitation { connection, envelope, url })
    }

    /// Accept an out-of-band invitation URL.
    ///
    /// The inviter is addressed through the invitation's `serviceEndpoint`.
    /// With auto-accept the connection request goes out immediately.
    pub async fn receive_invitation(&self, url: &str) -> Result<ConnectionRecord, DispatchError> {
        let body = invitation::decode_url(url)?;
        let mut envelope = Envelope::decode(&RawEnvelope::new(self.id().clone(), body))?;
        let payload: Invitation = envelope.payload()?;
        let endpoint = payload.service_endpoint.ok_or_else(|| {
            ProtocolError::InvalidInvitationUrl("invitation has no service endpoint".into())
        })?;
        envelope.sender = AgentId::new(endpoint);

        self.process(&envelope).await?;

        let handle = self.context().connections.by_thread(&envelope.thread_id).ok_or_else(|| {
            DispatchError::UnknownRecord(format!("connection thread {}", envelope.thread_id))
        })?;
        let record = handle.lock().await.clone();
        Ok(record)
    }

    /// Invitee: send the connection request for a held invitation
    pub async fn accept_invitation(
        &self,
        connection_id: ConnectionId,
    ) -> Result<ConnectionRecord, DispatchError> {
        let ctx = self.context();
        let handle = self.connection_handle(connection_id)?;
        let record = handle.lock().await;
        if record.role() != ConnectionRole::Invitee {
            return Err(DispatchError::InvalidTransition(format!(
                "accept_invitation on {:?} connection {connection_id}",
                record.role()
            )));
        }

        let mut next = record.clone();
        let did = ctx.wallet.create_did().await?;
        let actions = next.send_request(did, &ctx.config.label, ctx.env.now())?;
        self.commit_connection(record, next, actions).await
    }

    /// Inviter: answer a held connection request
    pub async fn accept_request(
        &self,
        connection_id: ConnectionId,
    ) -> Result<ConnectionRecord, DispatchError> {
        let ctx = self.context();
        let handle = self.connection_handle(connection_id)?;
        let record = handle.lock().await;
        if record.state() != ConnectionState::Request {
            return Err(DispatchError::InvalidTransition(format!(
                "accept_request on connection {connection_id} in {:?}",
                record.state()
            )));
        }

        let mut next = record.clone();
        let did = ctx.wallet.create_did().await?;
        let actions = next.send_response(did, ctx.env.now())?;
        self.commit_connection(record, next, actions).await
    }

    /// Give up on a connection, telling the peer if it is known
    pub async fn abandon_connection(
        &self,
        connection_id: ConnectionId,
        reason: &str,
    ) -> Result<ConnectionRecord, DispatchError> {
        let handle = self.connection_handle(connection_id)?;
        let record = handle.lock().await;

        let mut next = record.clone();
        let actions = next.abandon(reason, self.context().env.now())?;
        self.commit_connection(record, next, actions).await
    }

    // Stateless messaging

    /// Ping the peer of a completed connection; returns the ping's thread
    pub async fn send_ping(&self, connection_id: ConnectionId) -> Result<ThreadId, DispatchError> {
        let peer = self.ready_peer(connection_id).await?;
        let ping = Envelope::with_payload(
            Protocol::TrustPing.message_type("ping"),
            ThreadId::generate(),
            self.id().clone(),
            &Ping { response_requested: true, comment: None },
        )?;
        let thread_id = ping.thread_id.clone();

        self.transport.send(ping, &peer).await?;
        debug!(%connection_id, thread = %thread_id, "ping sent");
        Ok(thread_id)
    }

    /// Send a basic message over a completed connection
    pub async fn send_message(
        &self,
        connection_id: ConnectionId,
        content: &str,
    ) -> Result<(), DispatchError> {
        let peer = self.ready_peer(connection_id).await?;
        let message = Envelope::with_payload(
            Protocol::BasicMessage.message_type("message"),
            ThreadId::generate(),
            self.id().clone(),
            &BasicMessage { content: content.to_string(), sent_time: None },
        )?;

        self.transport.send(message, &peer).await?;
        Ok(())
    }

    // Credential exchange

    /// Holder: propose a credential on a new thread
    pub async fn propose_credential(
        &self,
        connection_id: ConnectionId,
        schema_id: &str,
        attributes: Attributes,
    ) -> Result<CredentialExchange, DispatchError> {
        let ctx = self.context();
        let connection = self.ready_connection(connection_id).await?;
        validate(ctx, schema_id, &attributes).await?;

        let proposal =
            CredentialProposal { schema_id: schema_id.to_string(), attributes, comment: None };
        let (record, actions) = CredentialExchange::propose(
            ctx.env.exchange_id(),
            connection_id,
            ThreadId::generate(),
            &proposal,
            ctx.env.now(),
        )?;
        self.open_exchange(&connection, record, actions).await
    }

    /// Issuer: offer a credential on a new thread
    pub async fn offer_credential(
        &self,
        connection_id: ConnectionId,
        schema_id: &str,
        attributes: Attributes,
    ) -> Result<CredentialExchange, DispatchError> {
        let ctx = self.context();
        let connection = self.ready_connection(connection_id).await?;
        validate(ctx, schema_id, &attributes).await?;

        let offer = build_offer(ctx, schema_id, &attributes).await?;
        let (record, actions) = CredentialExchange::offer(
            ctx.env.exchange_id(),
            connection_id,
            ThreadId::generate(),
            &offer,
            ctx.env.now(),
        )?;
        self.open_exchange(&connection, record, actions).await
    }

    /// Issuer: answer a held proposal with an offer for the proposed values
    pub async fn accept_proposal(
        &self,
        exchange_id: ExchangeId,
    ) -> Result<CredentialExchange, DispatchError> {
        let ctx = self.context();
        let handle = self.exchange_handle(exchange_id)?;
        let mut record = handle.lock().await;
        if record.role() != ExchangeRole::Issuer || record.state() != ExchangeState::Proposed {
            return Err(DispatchError::InvalidTransition(format!(
                "accept_proposal on {:?} exchange {exchange_id} in {:?}",
                record.role(),
                record.state()
            )));
        }

        let offer = build_offer(ctx, record.schema_id(), record.attributes()).await?;
        let mut next = record.clone();
        let actions = next.send_offer(&offer, ctx.env.now())?;
        self.commit_exchange(&mut record, next, actions).await?;
        Ok(record.clone())
    }

    /// Holder: request the credential of a held offer
    pub async fn accept_offer(
        &self,
        exchange_id: ExchangeId,
    ) -> Result<CredentialExchange, DispatchError> {
        let ctx = self.context();
        let handle = self.exchange_handle(exchange_id)?;
        let mut record = handle.lock().await;
        let connection = ctx.connection_of(record.connection_id()).await?;

        let mut next = record.clone();
        let actions = next.send_request(&holder_request(&connection)?, ctx.env.now())?;
        self.commit_exchange(&mut record, next, actions).await?;
        Ok(record.clone())
    }

    /// Give up on an exchange and send a problem report
    pub async fn abandon_exchange(
        &self,
        exchange_id: ExchangeId,
        reason: &str,
    ) -> Result<CredentialExchange, DispatchError> {
        let handle = self.exchange_handle(exchange_id)?;
        let mut record = handle.lock().await;

        let mut next = record.clone();
        let actions = next.abandon(reason, self.context().env.now())?;
        self.commit_exchange(&mut record, next, actions).await?;
        Ok(record.clone())
    }

    // Proof presentation

    /// Verifier: ask the peer to present a credential of `schema_id`
    /// carrying the named attributes
    pub async fn request_proof<I, S>(
        &self,
        connection_id: ConnectionId,
        schema_id: &str,
        attributes: I,
    ) -> Result<PresentationExchange, DispatchError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ctx = self.context();
        let connection = self.ready_connection(connection_id).await?;
        let requested_attributes: BTreeSet<String> = attributes.into_iter().map(Into::into).collect();
        ctx.schemas.resolve_schema(schema_id).await?.require(&requested_attributes)?;

        let request = PresentationRequest {
            schema_id: schema_id.to_string(),
            requested_attributes,
            comment: None,
        };
        let (record, actions) = PresentationExchange::request(
            ctx.env.exchange_id(),
            connection_id,
            ThreadId::generate(),
            &request,
            ctx.env.now(),
        )?;
        self.open_presentation(&connection, record, actions).await
    }

    /// Prover: answer a held request with a credential from the wallet
    pub async fn accept_proof_request(
        &self,
        exchange_id: ExchangeId,
    ) -> Result<PresentationExchange, DispatchError> {
        let ctx = self.context();
        let handle = self.presentation_handle(exchange_id)?;
        let mut record = handle.lock().await;
        if record.role() != PresentationRole::Prover || record.state() != PresentationState::Requested
        {
            return Err(DispatchError::InvalidTransition(format!(
                "accept_proof_request on {:?} presentation {exchange_id} in {:?}",
                record.role(),
                record.state()
            )));
        }

        let credential =
            ctx.wallet.present(record.schema_id(), record.requested_attributes()).await?;
        let mut next = record.clone();
        let actions = next.present(&credential, ctx.env.now())?;
        self.commit_presentation(&mut record, next, actions).await?;
        Ok(record.clone())
    }

    /// Give up on a presentation and send a problem report
    pub async fn abandon_presentation(
        &self,
        exchange_id: ExchangeId,
        reason: &str,
    ) -> Result<PresentationExchange, DispatchError> {
        let handle = self.presentation_handle(exchange_id)?;
        let mut record = handle.lock().await;

        let mut next = record.clone();
        let actions = next.abandon(reason, self.context().env.now())?;
        self.commit_presentation(&mut record, next, actions).await?;
        Ok(record.clone())
    }

    // Queries

    /// Snapshot of one connection
    pub async fn connection(&self, connection_id: ConnectionId) -> Option<ConnectionRecord> {
        let handle = self.context().connections.get(connection_id)?;
        let record = handle.lock().await.clone();
        Some(record)
    }

    /// Snapshot of every connection, oldest first
    pub async fn connections(&self) -> Vec<ConnectionRecord> {
        self.context().connections.snapshot().await
    }

    /// Snapshot of one exchange
    pub async fn exchange(&self, exchange_id: ExchangeId) -> Option<CredentialExchange> {
        let handle = self.context().exchanges.get(exchange_id)?;
        let record = handle.lock().await.clone();
        Some(record)
    }

    /// Snapshot of every exchange, oldest first
    pub async fn exchanges(&self) -> Vec<CredentialExchange> {
        self.context().exchanges.snapshot().await
    }

    /// Snapshot of one presentation
    pub async fn presentation(&self, exchange_id: ExchangeId) -> Option<PresentationExchange> {
        let handle = self.context().presentations.get(exchange_id)?;
        let record = handle.lock().await.clone();
        Some(record)
    }

    /// Snapshot of every presentation, oldest first
    pub async fn presentations(&self) -> Vec<PresentationExchange> {
        self.context().presentations.snapshot().await
    }

    /// Basic messages received on a connection, oldest first
    pub fn messages(&self, connection_id: ConnectionId) -> Result<Vec<StoredMessage>, StorageError> {
        self.context().storage.messages(connection_id)
    }

    // Expiry

    /// Abandon every record that stalled past the expiry policy.
    ///
    /// Returns how many records were abandoned. Failures on one record are
    /// logged and do not stop the sweep.
    pub async fn sweep(&self) -> usize {
        let ctx = self.context();
        let policy = ctx.config.expiry;
        let mut abandoned = 0;

        for handle in ctx.connections.handles() {
            let record = handle.lock().await;
            let now = ctx.env.now();
            if record.check_expiry(&policy, now).is_none() {
                continue;
            }

            let connection_id = record.id();
            let mut next = record.clone();
            let actions = next.tick(&policy, now);
            match self.commit_connection(record, next, actions).await {
                Ok(_) => abandoned += 1,
                Err(e) => warn!(%connection_id, error = %e, "expiry sweep failed"),
            }
        }

        for handle in ctx.exchanges.handles() {
            let mut record = handle.lock().await;
            let now = ctx.env.now();
            if record.check_expiry(&policy, now).is_none() {
                continue;
            }

            let mut next = record.clone();
            let actions = next.tick(&policy, now);
            match self.commit_exchange(&mut record, next, actions).await {
                Ok(()) => abandoned += 1,
                Err(e) => warn!(exchange_id = %record.id(), error = %e, "expiry sweep failed"),
            }
        }

        for handle in ctx.presentations.handles() {
            let mut record = handle.lock().await;
            let now = ctx.env.now();
            if record.check_expiry(&policy, now).is_none() {
                continue;
            }

            let mut next = record.clone();
            let actions = next.tick(&policy, now);
            match self.commit_presentation(&mut record, next, actions).await {
                Ok(()) => abandoned += 1,
                Err(e) => warn!(exchange_id = %record.id(), error = %e, "expiry sweep failed"),
            }
        }

        abandoned
    }

    // Run loop

    /// Route one decoded envelope and send the reply to its sender
    pub async fn process(&self, envelope: &Envelope) -> Result<(), DispatchError> {
        if let Some(reply) = self.dispatcher.route(envelope).await? {
            self.transport.send(reply, &envelope.sender).await?;
        }
        Ok(())
    }

    /// Serve the transport until `shutdown` fires or the inbound stream ends.
    ///
    /// Envelopes already handed to a worker lane are processed before this
    /// returns.
    ///
    /// # Errors
    /// `Worker` if a worker task panicked
    pub async fn run(&self, mut shutdown: ShutdownSignal) -> Result<(), AgentError> {
        let config = &self.context().config;
        let workers = config.workers.max(1);

        let mut lanes = Vec::with_capacity(workers);
        let mut tasks = JoinSet::new();
        for lane in 0..workers {
            let (tx, rx) = mpsc::channel(config.lane_capacity.max(1));
            lanes.push(tx);
            tasks.spawn(self.clone().work(lane, rx));
        }

        let (sweeper_handle, sweeper_signal) = shutdown_channel();
        let sweeper = tokio::spawn(self.clone().sweep_periodically(sweeper_signal));
        info!(agent = %self.id(), workers, "agent running");

        loop {
            let raw = tokio::select! {
                biased;
                () = shutdown.wait() => {
                    info!(agent = %self.id(), "shutdown requested");
                    break;
                },
                raw = self.transport.receive() => raw,
            };

            let Some(raw) = raw else {
                info!(agent = %self.id(), "inbound stream closed");
                break;
            };

            let envelope = match Envelope::decode(&raw) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(from = %raw.sender, error = %e, "dropping undecodable envelope");
                    continue;
                },
            };

            let lane = lane_for(&envelope.thread_id, workers);
            if lanes[lane].send(envelope).await.is_err() {
                error!(lane, "worker lane closed");
                break;
            }
        }

        // Closing the lanes lets each worker drain what it already accepted
        drop(lanes);
        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "worker failed");
                failure = Some(AgentError::Worker(e.to_string()));
            }
        }

        sweeper_handle.trigger();
        if let Err(e) = sweeper.await {
            error!(error = %e, "expiry sweeper failed");
        }
        info!(agent = %self.id(), "agent stopped");

        failure.map_or(Ok(()), Err)
    }

    async fn work(self, lane: usize, mut inbox: mpsc::Receiver<Envelope>) {
        while let Some(envelope) = inbox.recv().await {
            match self.process(&envelope).await {
                Ok(()) => {},
                Err(e) if e.is_routing() => {
                    warn!(
                        lane,
                        from = %envelope.sender,
                        thread = %envelope.thread_id,
                        kind = %envelope.kind(),
                        error = %e,
                        "envelope dropped"
                    );
                },
                Err(e) => {
                    error!(
                        lane,
                        from = %envelope.sender,
                        thread = %envelope.thread_id,
                        kind = %envelope.kind(),
                        retryable = e.is_retryable(),
                        error = %e,
                        "envelope failed"
                    );
                },
            }
        }
        debug!(lane, "worker drained");
    }

    async fn sweep_periodically(self, mut stop: ShutdownSignal) {
        let mut ticker = interval(self.context().config.sweep_interval.max(MIN_SWEEP_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = stop.wait() => break,
                _ = ticker.tick() => {
                    let abandoned = self.sweep().await;
                    if abandoned > 0 {
                        info!(abandoned, "expired records abandoned");
                    }
                },
            }
        }
    }

    // Helpers

    fn connection_handle(
        &self,
        connection_id: ConnectionId,
    ) -> Result<ConnectionHandle, DispatchError> {
        self.context()
            .connections
            .get(connection_id)
            .ok_or_else(|| DispatchError::UnknownRecord(format!("connection {connection_id}")))
    }

    fn exchange_handle(
        &self,
        exchange_id: ExchangeId,
    ) -> Result<ExchangeHandle, DispatchError> {
        self.context()
            .exchanges
            .get(exchange_id)
            .ok_or_else(|| DispatchError::UnknownRecord(format!("exchange {exchange_id}")))
    }

    fn presentation_handle(
        &self,
        exchange_id: ExchangeId,
    ) -> Result<PresentationHandle, DispatchError> {
        self.context()
            .presentations
            .get(exchange_id)
            .ok_or_else(|| DispatchError::UnknownRecord(format!("presentation {exchange_id}")))
    }

    async fn ready_connection(
        &self,
        connection_id: ConnectionId,
    ) -> Result<ConnectionRecord, DispatchError> {
        let handle = self.connection_handle(connection_id)?;
        let record = handle.lock().await.clone();
        if record.is_completed() {
            Ok(record)
        } else {
            Err(DispatchError::ConnectionNotReady { state: record.state() })
        }
    }

    async fn ready_peer(&self, connection_id: ConnectionId) -> Result<AgentId, DispatchError> {
        let connection = self.ready_connection(connection_id).await?;
        peer_of(&connection)
    }

    /// Commit and send under the record's lock, then release it before the
    /// route registrar runs
    async fn commit_connection(
        &self,
        mut record: MutexGuard<'_, ConnectionRecord>,
        next: ConnectionRecord,
        actions: Vec<ConnectionAction>,
    ) -> Result<ConnectionRecord, DispatchError> {
        let ctx = self.context();
        ctx.connections.commit(&mut record, next)?;
        let mut outcome = ctx.execute_connection(&record, actions);
        if let Some(envelope) = outcome.reply.take() {
            self.transport.send(envelope, &peer_of(&record)?).await?;
        }

        let snapshot = record.clone();
        drop(record);
        ctx.finish_connection(outcome).await;
        Ok(snapshot)
    }

    async fn commit_exchange(
        &self,
        record: &mut CredentialExchange,
        next: CredentialExchange,
        actions: Vec<ExchangeAction>,
    ) -> Result<(), DispatchError> {
        let ctx = self.context();
        let connection = ctx.connection_of(record.connection_id()).await?;
        ctx.exchanges.commit(record, next)?;
        if let Some(envelope) = ctx.execute_exchange(record, actions) {
            self.transport.send(envelope, &peer_of(&connection)?).await?;
        }
        Ok(())
    }

    async fn open_exchange(
        &self,
        connection: &ConnectionRecord,
        record: CredentialExchange,
        actions: Vec<ExchangeAction>,
    ) -> Result<CredentialExchange, DispatchError> {
        let ctx = self.context();
        let peer = peer_of(connection)?;
        let handle = ctx.exchanges.insert(record)?;
        let record = handle.lock().await;
        info!(
            exchange_id = %record.id(),
            connection_id = %connection.id(),
            role = ?record.role(),
            schema_id = record.schema_id(),
            "exchange opened"
        );

        if let Some(envelope) = ctx.execute_exchange(&record, actions) {
            self.transport.send(envelope, &peer).await?;
        }
        Ok(record.clone())
    }

    async fn commit_presentation(
        &self,
        record: &mut PresentationExchange,
        next: PresentationExchange,
        actions: Vec<PresentationAction>,
    ) -> Result<(), DispatchError> {
        let ctx = self.context();
        let connection = ctx.connection_of(record.connection_id()).await?;
        ctx.presentations.commit(record, next)?;
        if let Some(envelope) = ctx.execute_presentation(record, actions) {
            self.transport.send(envelope, &peer_of(&connection)?).await?;
        }
        Ok(())
    }

    async fn open_presentation(
        &self,
        connection: &ConnectionRecord,
        record: PresentationExchange,
        actions: Vec<PresentationAction>,
    ) -> Result<PresentationExchange, DispatchError> {
        let ctx = self.context();
        let peer = peer_of(connection)?;
        let handle = ctx.presentations.insert(record)?;
        let record = handle.lock().await;
        info!(
            exchange_id = %record.id(),
            connection_id = %connection.id(),
            role = ?record.role(),
            schema_id = record.schema_id(),
            "presentation opened"
        );

        if let Some(envelope) = ctx.execute_presentation(&record, actions) {
            self.transport.send(envelope, &peer).await?;
        }
        Ok(record.clone())
    }
}

fn peer_of(connection: &ConnectionRecord) -> Result<AgentId, DispatchError> {
    connection
        .peer_agent()
        .cloned()
        .ok_or_else(|| DispatchError::UnknownRecord(format!("peer of connection {}", connection.id())))
}

/// Worker lane for a thread. Stable for the lifetime of the process.
fn lane_for(thread_id: &ThreadId, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    thread_id.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}
