//! Scenario builder API.
//!
//! Provides a declarative API for constructing scenario tests that enforce
//! the Oracle Pattern: a scenario cannot run until it has an oracle.

use std::{collections::HashMap, sync::Arc, time::Duration};

use didcomm_agent::{
    Agent, AgentBuilder, AgentConfig, MemorySchemaRegistry, MemoryWallet, Schema,
};
use didcomm_core::{ConnectionRecord, ConnectionState};
use didcomm_proto::{AgentId, Envelope, RawEnvelope, payloads::Attributes};
use tracing::debug;

use crate::{
    scenario::{
        OracleFn,
        network::{QueueNetwork, QueueTransport},
        world::{AgentView, Rejection, World},
    },
    sim_env::SimEnv,
};

/// Upper bound on deliveries after one step; a protocol loop trips it.
const MAX_DELIVERIES_PER_STEP: usize = 10_000;

type ScenarioAgent = Agent<SimEnv, QueueTransport>;

#[derive(Debug, Clone)]
enum Step {
    Connect { inviter: String, invitee: String },
    ProposeCredential { holder: String, issuer: String, schema_id: String, attributes: Attributes },
    OfferCredential { issuer: String, holder: String, schema_id: String, attributes: Attributes },
    RequestProof { verifier: String, prover: String, schema_id: String, attributes: Vec<String> },
    SendMessage { from: String, to: String, content: String },
    Ping { from: String, to: String },
    AdvanceTime(Duration),
}

/// Scenario builder.
///
/// Declare agents, then the steps to run in order. After every step the
/// scenario delivers envelopes until the network is quiet. Must call
/// `.oracle()` to get a [`RunnableScenario`] that can be executed.
pub struct Scenario {
    name: String,
    seed: u64,
    agents: Vec<(String, AgentConfig)>,
    schemas: Vec<Schema>,
    steps: Vec<Step>,
    duplicate_deliveries: bool,
}

impl Scenario {
    /// Create a new scenario with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            seed: SimEnv::DEFAULT_SEED,
            agents: Vec::new(),
            schemas: Vec::new(),
            steps: Vec::new(),
            duplicate_deliveries: false,
        }
    }

    /// Seed for record ids
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Add an agent with default configuration.
    pub fn agent(self, name: impl Into<String>) -> Self {
        self.agent_with_config(name, AgentConfig::default())
    }

    /// Add an agent with custom configuration. Its label is its name.
    pub fn agent_with_config(mut self, name: impl Into<String>, config: AgentConfig) -> Self {
        self.agents.push((name.into(), config));
        self
    }

    /// Publish a schema to every agent's registry
    pub fn schema(mut self, schema: Schema) -> Self {
        self.schemas.push(schema);
        self
    }

    /// Deliver every envelope twice, as a retransmitting peer would
    pub fn duplicate_deliveries(mut self) -> Self {
        self.duplicate_deliveries = true;
        self
    }

    /// `inviter` creates an invitation, `invitee` receives it
    pub fn connect(mut self, inviter: impl Into<String>, invitee: impl Into<String>) -> Self {
        self.steps.push(Step::Connect { inviter: inviter.into(), invitee: invitee.into() });
        self
    }

    /// `holder` proposes a credential to `issuer`
    pub fn propose_credential(
        mut self,
        holder: impl Into<String>,
        issuer: impl Into<String>,
        schema_id: impl Into<String>,
        attributes: Attributes,
    ) -> Self {
        self.steps.push(Step::ProposeCredential {
            holder: holder.into(),
            issuer: issuer.into(),
            schema_id: schema_id.into(),
            attributes,
        });
        self
    }

    /// `issuer` offers a credential to `holder`
    pub fn offer_credential(
        mut self,
        issuer: impl Into<String>,
        holder: impl Into<String>,
        schema_id: impl Into<String>,
        attributes: Attributes,
    ) -> Self {
        self.steps.push(Step::OfferCredential {
            issuer: issuer.into(),
            holder: holder.into(),
            schema_id: schema_id.into(),
            attributes,
        });
        self
    }

    /// `verifier` asks `prover` to present the named attributes of a
    /// `schema_id` credential
    pub fn request_proof<I, S>(
        mut self,
        verifier: impl Into<String>,
        prover: impl Into<String>,
        schema_id: impl Into<String>,
        attributes: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.steps.push(Step::RequestProof {
            verifier: verifier.into(),
            prover: prover.into(),
            schema_id: schema_id.into(),
            attributes: attributes.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// `from` sends a basic message to `to`
    pub fn send_message(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        self.steps.push(Step::SendMessage { from: from.into(), to: to.into(), content: content.into() });
        self
    }

    /// `from` pings `to`
    pub fn ping(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.steps.push(Step::Ping { from: from.into(), to: to.into() });
        self
    }

    /// Move the shared clock forward, then run every agent's expiry sweep
    pub fn advance_time(mut self, by: Duration) -> Self {
        self.steps.push(Step::AdvanceTime(by));
        self
    }

    /// Set the oracle function and return a runnable scenario.
    ///
    /// The oracle is mandatory - you cannot run a scenario without
    /// verification.
    pub fn oracle(self, oracle: OracleFn) -> RunnableScenario {
        RunnableScenario { scenario: self, oracle }
    }
}

/// A scenario with an oracle function that can be executed.
pub struct RunnableScenario {
    scenario: Scenario,
    oracle: OracleFn,
}

struct Actor {
    agent: ScenarioAgent,
    wallet: Arc<MemoryWallet>,
}

impl RunnableScenario {
    /// Execute the scenario.
    ///
    /// Builds every agent on a shared [`SimEnv`] and delivery queue, runs the
    /// steps in order (each followed by delivery until quiet), snapshots the
    /// agents into a [`World`] and hands it to the oracle.
    ///
    /// Local API failures abort the run. Envelopes an agent refuses are not
    /// failures; they are recorded in the world for the oracle to judge.
    pub async fn run(self) -> Result<World, String> {
        let name = self.scenario.name.clone();
        let fail = |what: String| format!("Scenario '{name}': {what}");

        let env = SimEnv::with_seed(self.scenario.seed);
        let network = QueueNetwork::new();
        let schemas = Arc::new(MemorySchemaRegistry::new());
        for schema in &self.scenario.schemas {
            schemas.publish(schema.clone());
        }

        let mut actors = HashMap::new();
        for (agent_name, config) in &self.scenario.agents {
            let id = AgentId::new(agent_name.as_str());
            let wallet = Arc::new(MemoryWallet::new());
            let agent = AgentBuilder::new(id.clone(), env.clone())
                .config(AgentConfig { label: agent_name.clone(), ..config.clone() })
                .wallet(wallet.clone())
                .schemas(schemas.clone())
                .build(network.transport(id))
                .map_err(|e| fail(format!("agent {agent_name} failed to start: {e}")))?;
            actors.insert(agent_name.clone(), Actor { agent, wallet });
        }

        let mut world = World::new();
        for step in &self.scenario.steps {
            debug!(scenario = %name, ?step, "step");
            run_step(&actors, &env, step).await.map_err(&fail)?;
            deliver_all(&actors, &network, &mut world, self.scenario.duplicate_deliveries)
                .await
                .map_err(&fail)?;
        }

        for (agent_name, actor) in actors {
            let view = snapshot(&actor).await.map_err(|e| fail(format!("{agent_name}: {e}")))?;
            world.add_agent(agent_name, view);
        }

        (self.oracle)(&world)?;
        Ok(world)
    }
}

fn actor<'a>(actors: &'a HashMap<String, Actor>, name: &str) -> Result<&'a Actor, String> {
    actors.get(name).ok_or_else(|| format!("no agent named {name}"))
}

/// The newest completed connection `agent` holds with `peer`
async fn connection(agent: &ScenarioAgent, peer: &str) -> Result<ConnectionRecord, String> {
    let peer = AgentId::new(peer);
    agent
        .connections()
        .await
        .into_iter()
        .filter(|c| c.state() == ConnectionState::Completed && c.peer_agent() == Some(&peer))
        .max_by_key(ConnectionRecord::created_at)
        .ok_or_else(|| format!("{} has no completed connection with {peer}", agent.id()))
}

async fn run_step(actors: &HashMap<String, Actor>, env: &SimEnv, step: &Step) -> Result<(), String> {
    match step {
        Step::Connect { inviter, invitee } => {
            let created = actor(actors, inviter)?
                .agent
                .create_invitation()
                .map_err(|e| format!("{inviter} create_invitation: {e}"))?;
            actor(actors, invitee)?
                .agent
                .receive_invitation(&created.url)
                .await
                .map_err(|e| format!("{invitee} receive_invitation: {e}"))?;
        },
        Step::ProposeCredential { holder, issuer, schema_id, attributes } => {
            let agent = &actor(actors, holder)?.agent;
            let connection = connection(agent, issuer).await?;
            agent
                .propose_credential(connection.id(), schema_id, attributes.clone())
                .await
                .map_err(|e| format!("{holder} propose_credential: {e}"))?;
        },
        Step::OfferCredential { issuer, holder, schema_id, attributes } => {
            let agent = &actor(actors, issuer)?.agent;
            let connection = connection(agent, holder).await?;
            agent
                .offer_credential(connection.id(), schema_id, attributes.clone())
                .await
                .map_err(|e| format!("{issuer} offer_credential: {e}"))?;
        },
        Step::RequestProof { verifier, prover, schema_id, attributes } => {
            let agent = &actor(actors, verifier)?.agent;
            let connection = connection(agent, prover).await?;
            agent
                .request_proof(connection.id(), schema_id, attributes.iter().cloned())
                .await
                .map_err(|e| format!("{verifier} request_proof: {e}"))?;
        },
        Step::SendMessage { from, to, content } => {
            let agent = &actor(actors, from)?.agent;
            let connection = connection(agent, to).await?;
            agent
                .send_message(connection.id(), content)
                .await
                .map_err(|e| format!("{from} send_message: {e}"))?;
        },
        Step::Ping { from, to } => {
            let agent = &actor(actors, from)?.agent;
            let connection = connection(agent, to).await?;
            agent.send_ping(connection.id()).await.map_err(|e| format!("{from} send_ping: {e}"))?;
        },
        Step::AdvanceTime(by) => {
            env.advance(*by);
            for actor in actors.values() {
                actor.agent.sweep().await;
            }
        },
    }
    Ok(())
}

/// Deliver queued envelopes, oldest first, until nothing is in flight.
///
/// Each envelope goes through the wire codec on the way, as it would over a
/// real transport.
async fn deliver_all(
    actors: &HashMap<String, Actor>,
    network: &QueueNetwork,
    world: &mut World,
    duplicate: bool,
) -> Result<(), String> {
    let mut deliveries = 0;
    while let Some(delivery) = network.pop() {
        deliveries += 1;
        if deliveries > MAX_DELIVERIES_PER_STEP {
            return Err(format!("network never went quiet ({} still queued)", network.len()));
        }

        world.record_sent(delivery.from.as_str());
        let Some(actor) = actors.get(delivery.to.as_str()) else {
            world.record_undeliverable();
            continue;
        };

        let envelope = wire(&delivery.from, &delivery.envelope)?;
        let copies = if duplicate { 2 } else { 1 };
        for _ in 0..copies {
            world.record_delivered(delivery.to.as_str());
            if let Err(e) = actor.agent.process(&envelope).await {
                world.record_rejection(Rejection {
                    agent: delivery.to.to_string(),
                    kind: envelope.message_type.name().to_string(),
                    error: e.to_string(),
                });
            }
        }
    }
    Ok(())
}

fn wire(from: &AgentId, envelope: &Envelope) -> Result<Envelope, String> {
    let bytes = envelope.encode().map_err(|e| format!("encode: {e}"))?;
    Envelope::decode(&RawEnvelope::new(from.clone(), bytes)).map_err(|e| format!("decode: {e}"))
}

async fn snapshot(actor: &Actor) -> Result<AgentView, String> {
    let connections = actor.agent.connections().await;
    let exchanges = actor.agent.exchanges().await;
    let presentations = actor.agent.presentations().await;

    let mut messages = HashMap::new();
    for connection in &connections {
        let stored = actor.agent.messages(connection.id()).map_err(|e| e.to_string())?;
        messages.insert(connection.id(), stored);
    }

    Ok(AgentView { connections, exchanges, presentations, messages, wallet: actor.wallet.clone() })
}
