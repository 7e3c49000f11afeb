//! Agent run loop over the in-process channel network.
//!
//! Agents run as spawned tasks; tests observe them through the local API and
//! through raw transports attached to the same network.

use std::{
    collections::BTreeMap,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use didcomm_agent::{
    Agent, AgentBuilder, AgentConfig, AgentContext, AgentError, ChannelNetwork, ChannelTransport,
    DispatchError, Handler, HandlerKey, MemorySchemaRegistry, MemoryWallet, Schema,
    ShutdownHandle, Transport, shutdown_channel,
};
use didcomm_core::{ConnectionState, ExchangeRole, ExchangeState, PresentationState, SystemEnv};
use didcomm_proto::{
    AgentId, Envelope, MessageKind, MessageType, Protocol, RawEnvelope, ThreadId,
    payloads::{BasicMessage, Ping},
};
use serde_json::json;
use tokio::{sync::Notify, task::JoinHandle};

type TestAgent = Agent<SystemEnv, ChannelTransport>;

struct Running {
    agent: TestAgent,
    stop: ShutdownHandle,
    task: JoinHandle<Result<(), AgentError>>,
}

impl Running {
    fn start(agent: TestAgent) -> Self {
        let (stop, signal) = shutdown_channel();
        let runner = agent.clone();
        let task = tokio::spawn(async move { runner.run(signal).await });
        Self { agent, stop, task }
    }

    async fn shutdown(self) {
        self.stop.trigger();
        self.task.await.expect("run task joins").expect("run loop exits cleanly");
    }
}

fn degree_schema() -> Schema {
    Schema::new("degree", "1.0", ["name", "degree"])
}

fn build(network: &ChannelNetwork, name: &str, wallet: Arc<MemoryWallet>) -> TestAgent {
    let schemas = Arc::new(MemorySchemaRegistry::new());
    schemas.publish(degree_schema());

    AgentBuilder::new(AgentId::new(name), SystemEnv)
        .config(AgentConfig { label: name.to_string(), ..AgentConfig::default() })
        .wallet(wallet)
        .schemas(schemas)
        .build(network.join(AgentId::new(name)))
        .expect("agent builds")
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn raw(from: &str, envelope: &Envelope) -> RawEnvelope {
    RawEnvelope::new(AgentId::new(from), envelope.encode().unwrap())
}

fn ping(thread: &str) -> Envelope {
    Envelope::with_payload(
        Protocol::TrustPing.message_type("ping"),
        ThreadId::new(thread),
        AgentId::new("alice"),
        &Ping { response_requested: true, comment: None },
    )
    .unwrap()
}

fn basic_message(i: usize) -> Envelope {
    Envelope::with_payload(
        Protocol::BasicMessage.message_type("message"),
        ThreadId::new(format!("m{i}")),
        AgentId::new("alice"),
        &BasicMessage { content: format!("m{i}"), sent_time: None },
    )
    .unwrap()
}

async fn receive(transport: &ChannelTransport) -> Option<Envelope> {
    let raw = tokio::time::timeout(Duration::from_millis(500), transport.receive()).await.ok()??;
    Some(Envelope::decode(&raw).unwrap())
}

async fn connected_pair(network: &ChannelNetwork) -> (Running, Running) {
    let issuer = Running::start(build(network, "issuer", Arc::new(MemoryWallet::new())));
    let holder = Running::start(build(network, "holder", Arc::new(MemoryWallet::new())));

    let invitation = issuer.agent.create_invitation().unwrap();
    holder.agent.receive_invitation(&invitation.url).await.unwrap();

    eventually("both sides completed", || async {
        let sides = [issuer.agent.connections().await, holder.agent.connections().await];
        sides.iter().all(|c| c.len() == 1 && c[0].state() == ConnectionState::Completed)
    })
    .await;

    (issuer, holder)
}

#[tokio::test]
async fn ping_gets_exactly_one_response_on_same_thread() {
    let network = ChannelNetwork::new();
    let alice = network.join(AgentId::new("alice"));
    let bob = Running::start(build(&network, "bob", Arc::new(MemoryWallet::new())));

    alice.send(ping("t1"), &AgentId::new("bob")).await.unwrap();

    let response = receive(&alice).await.expect("ping response");
    assert_eq!(response.kind(), MessageKind::PingResponse);
    assert_eq!(response.thread_id, ThreadId::new("t1"));
    assert_eq!(response.sender, AgentId::new("bob"));
    assert!(receive(&alice).await.is_none());

    bob.shutdown().await;
}

#[tokio::test]
async fn unroutable_envelopes_are_dropped_and_loop_continues() {
    let network = ChannelNetwork::new();
    let alice = network.join(AgentId::new("alice"));
    let bob = Running::start(build(&network, "bob", Arc::new(MemoryWallet::new())));
    let to_bob = AgentId::new("bob");

    let unknown = json!({"@type": "https://didcomm.org/unknown/1.0/foo", "~content": {}});
    network
        .inject(&to_bob, RawEnvelope::new(AgentId::new("alice"), serde_json::to_vec(&unknown).unwrap()))
        .unwrap();
    network.inject(&to_bob, RawEnvelope::new(AgentId::new("alice"), b"{not json".to_vec())).unwrap();
    let stray = Envelope::new(
        Protocol::IssueCredential.message_type("request-credential"),
        ThreadId::new("nobody"),
        AgentId::new("alice"),
        json!({}),
    );
    network.inject(&to_bob, raw("alice", &stray)).unwrap();
    alice.send(ping("t2"), &to_bob).await.unwrap();

    let response = receive(&alice).await.expect("loop still serving");
    assert_eq!(response.thread_id, ThreadId::new("t2"));
    assert!(bob.agent.exchanges().await.is_empty());

    bob.shutdown().await;
}

#[tokio::test]
async fn holder_proposal_ends_acknowledged_with_credential() {
    let network = ChannelNetwork::new();
    let holder_wallet = Arc::new(MemoryWallet::new());
    let issuer = Running::start(build(&network, "issuer", Arc::new(MemoryWallet::new())));
    let holder = Running::start(build(&network, "holder", holder_wallet.clone()));

    let invitation = issuer.agent.create_invitation().unwrap();
    let connection = holder.agent.receive_invitation(&invitation.url).await.unwrap();
    eventually("both sides completed", || async {
        let issuer_side = issuer.agent.connections().await;
        holder.agent.connection(connection.id()).await.is_some_and(|c| c.is_completed())
            && issuer_side.len() == 1
            && issuer_side[0].is_completed()
    })
    .await;

    let attributes: BTreeMap<String, String> = [("name", "Alice"), ("degree", "Maths")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let proposal = holder
        .agent
        .propose_credential(connection.id(), "degree:1.0", attributes.clone())
        .await
        .unwrap();
    assert_eq!(proposal.state(), ExchangeState::Proposed);

    eventually("holder acknowledged", || async {
        holder.agent.exchange(proposal.id()).await.is_some_and(|x| x.state() == ExchangeState::Acknowledged)
    })
    .await;
    eventually("issuer acknowledged", || async {
        let exchanges = issuer.agent.exchanges().await;
        exchanges.len() == 1 && exchanges[0].state() == ExchangeState::Acknowledged
    })
    .await;

    let exchange = holder.agent.exchange(proposal.id()).await.unwrap();
    assert_eq!(exchange.role(), ExchangeRole::Holder);
    let credential_id = exchange.credential_id().expect("credential assigned");
    let credential = holder_wallet.credential(credential_id).expect("credential stored");
    assert_eq!(credential.attributes, attributes);
    assert_eq!(credential.schema_id, "degree:1.0");
    assert_eq!(holder_wallet.len(), 1);

    let issued = &issuer.agent.exchanges().await[0];
    assert_eq!(issued.thread_id(), exchange.thread_id());
    assert_eq!(issued.role(), ExchangeRole::Issuer);

    issuer.shutdown().await;
    holder.shutdown().await;
}

#[tokio::test]
async fn verifier_sees_only_the_requested_attributes() {
    let network = ChannelNetwork::new();
    let (issuer, holder) = connected_pair(&network).await;
    let connection = issuer.agent.connections().await[0].id();

    let attributes: BTreeMap<String, String> = [("name", "Alice"), ("degree", "Maths")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    issuer.agent.offer_credential(connection, "degree:1.0", attributes).await.unwrap();
    eventually("credential stored", || async {
        holder.agent.exchanges().await.first().is_some_and(|x| x.state() == ExchangeState::Acknowledged)
    })
    .await;

    let err = issuer.agent.request_proof(connection, "degree:1.0", ["gpa"]).await.unwrap_err();
    assert!(matches!(err, DispatchError::Schema(_)), "{err}");

    let request = issuer.agent.request_proof(connection, "degree:1.0", ["degree"]).await.unwrap();
    assert_eq!(request.state(), PresentationState::Requested);

    eventually("verifier acknowledged", || async {
        issuer
            .agent
            .presentation(request.id())
            .await
            .is_some_and(|p| p.state() == PresentationState::Acknowledged)
    })
    .await;
    eventually("prover acknowledged", || async {
        let presentations = holder.agent.presentations().await;
        presentations.len() == 1 && presentations[0].state() == PresentationState::Acknowledged
    })
    .await;

    let verified = issuer.agent.presentation(request.id()).await.unwrap();
    let revealed: Vec<(&str, &str)> =
        verified.revealed().iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    assert_eq!(revealed, [("degree", "Maths")]);
    assert_eq!(holder.agent.presentations().await[0].thread_id(), verified.thread_id());

    issuer.shutdown().await;
    holder.shutdown().await;
}

#[tokio::test]
async fn offer_with_wrong_attributes_is_rejected() {
    let network = ChannelNetwork::new();
    let (issuer, holder) = connected_pair(&network).await;
    let connection = issuer.agent.connections().await[0].id();

    let attributes: BTreeMap<String, String> =
        [("name".to_string(), "Alice".to_string())].into_iter().collect();
    let err = issuer
        .agent
        .offer_credential(connection, "degree:1.0", attributes)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Schema(_)), "{err}");
    assert!(issuer.agent.exchanges().await.is_empty());

    issuer.shutdown().await;
    holder.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_messages_are_all_recorded() {
    let network = ChannelNetwork::new();
    let (issuer, holder) = connected_pair(&network).await;
    let holder_connection = holder.agent.connections().await[0].id();
    let issuer_connection = issuer.agent.connections().await[0].id();

    let mut sends = tokio::task::JoinSet::new();
    for i in 0..20 {
        let agent = holder.agent.clone();
        sends.spawn(async move { agent.send_message(holder_connection, &format!("m{i}")).await });
    }
    while let Some(sent) = sends.join_next().await {
        sent.unwrap().unwrap();
    }

    eventually("all messages stored", || async {
        issuer.agent.messages(issuer_connection).unwrap().len() == 20
    })
    .await;

    issuer.shutdown().await;
    holder.shutdown().await;
}

struct SlowHandler {
    started: AtomicUsize,
    finished: AtomicUsize,
    first: Notify,
}

#[async_trait]
impl Handler<SystemEnv> for SlowHandler {
    async fn handle(
        &self,
        _ctx: &AgentContext<SystemEnv>,
        _envelope: &Envelope,
    ) -> Result<Option<Envelope>, DispatchError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.first.notify_one();
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }
}

#[tokio::test]
async fn shutdown_drains_accepted_work_and_stops_intake() {
    let network = ChannelNetwork::new();
    let agent = build(&network, "bob", Arc::new(MemoryWallet::new()));
    let slow = Arc::new(SlowHandler {
        started: AtomicUsize::new(0),
        finished: AtomicUsize::new(0),
        first: Notify::new(),
    });
    agent.handlers().register(HandlerKey::new(Protocol::BasicMessage, "message"), slow.clone());

    for i in 0..5 {
        network.inject(&AgentId::new("bob"), raw("alice", &basic_message(i))).unwrap();
    }

    let running = Running::start(agent);
    slow.first.notified().await;
    running.shutdown().await;

    let finished = slow.finished.load(Ordering::SeqCst);
    assert!(finished >= 1);
    assert_eq!(slow.started.load(Ordering::SeqCst), finished);

    // Nothing is taken from the transport after run returns
    network.inject(&AgentId::new("bob"), raw("alice", &basic_message(99))).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(slow.started.load(Ordering::SeqCst), finished);
}

/// Answers `questionanswer/question` on the same thread
struct AnswerHandler;

#[async_trait]
impl Handler<SystemEnv> for AnswerHandler {
    async fn handle(
        &self,
        ctx: &AgentContext<SystemEnv>,
        envelope: &Envelope,
    ) -> Result<Option<Envelope>, DispatchError> {
        Ok(Some(Envelope::new(
            envelope.message_type.sibling("answer"),
            envelope.thread_id.clone(),
            ctx.id.clone(),
            json!({ "response": "42" }),
        )))
    }
}

fn question(name: &str) -> Envelope {
    Envelope::new(
        MessageType::new("questionanswer", "1.0", name),
        ThreadId::new("q1"),
        AgentId::new("alice"),
        json!({ "question_text": "?" }),
    )
}

#[tokio::test]
async fn handlers_can_serve_protocols_the_agent_does_not_know() {
    let network = ChannelNetwork::new();
    let alice = network.join(AgentId::new("alice"));
    let bob = build(&network, "bob", Arc::new(MemoryWallet::new()));
    let key = HandlerKey::named("questionanswer", "question");

    let err = bob.process(&question("question")).await.unwrap_err();
    assert!(matches!(err, DispatchError::UnsupportedProtocol { protocol } if protocol == "questionanswer"));

    bob.handlers().register(key.clone(), Arc::new(AnswerHandler));
    bob.process(&question("question")).await.unwrap();
    let answer = receive(&alice).await.expect("answer");
    assert_eq!(answer.message_type.name(), "answer");
    assert_eq!(answer.thread_id, ThreadId::new("q1"));

    let err = bob.process(&question("withdraw")).await.unwrap_err();
    assert!(matches!(err, DispatchError::UnsupportedMessageKind { .. }));

    assert!(bob.handlers().unregister(&key).is_some());
    let err = bob.process(&question("question")).await.unwrap_err();
    assert!(matches!(err, DispatchError::UnsupportedProtocol { .. }));
}

#[tokio::test]
async fn run_returns_when_inbound_stream_ends() {
    let network = ChannelNetwork::new();
    let agent = build(&network, "bob", Arc::new(MemoryWallet::new()));
    let (_stop, signal) = shutdown_channel();

    network.leave(&AgentId::new("bob"));
    tokio::time::timeout(Duration::from_secs(1), agent.run(signal))
        .await
        .expect("run returns")
        .unwrap();
}
