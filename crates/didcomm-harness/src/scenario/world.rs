//! Final state of a scenario run, as seen by the oracle.
//!
//! The world is a snapshot: records are copied out of each agent after the
//! last delivery, so oracles inspect plain values with no locks or awaits.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use didcomm_agent::MemoryWallet;
use didcomm_core::{
    ConnectionRecord, ConnectionState, CredentialExchange, ExchangeState, PresentationExchange,
    StoredMessage,
};
use didcomm_proto::{AgentId, ConnectionId};

/// A delivery the receiving agent refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Receiving agent
    pub agent: String,
    /// Message type name of the refused envelope
    pub kind: String,
    /// Dispatch error text
    pub error: String,
}

/// One agent's records at the end of the run
pub struct AgentView {
    /// Connection records
    pub connections: Vec<ConnectionRecord>,
    /// Credential exchange records
    pub exchanges: Vec<CredentialExchange>,
    /// Presentation records
    pub presentations: Vec<PresentationExchange>,
    /// Stored basic messages per connection
    pub messages: HashMap<ConnectionId, Vec<StoredMessage>>,
    /// The agent's wallet
    pub wallet: Arc<MemoryWallet>,
}

/// World state containing every agent's records and delivery metrics.
#[derive(Default)]
pub struct World {
    agents: BTreeMap<String, AgentView>,
    sent: HashMap<String, usize>,
    delivered: HashMap<String, usize>,
    rejections: Vec<Rejection>,
    undeliverable: usize,
}

impl World {
    /// Create a new empty world.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an agent's snapshot.
    pub fn add_agent(&mut self, name: String, view: AgentView) {
        self.agents.insert(name, view);
    }

    /// Record that an envelope left `actor`.
    pub fn record_sent(&mut self, actor: &str) {
        *self.sent.entry(actor.to_string()).or_insert(0) += 1;
    }

    /// Record that `actor` processed an envelope.
    pub fn record_delivered(&mut self, actor: &str) {
        *self.delivered.entry(actor.to_string()).or_insert(0) += 1;
    }

    /// Record a refused delivery.
    pub fn record_rejection(&mut self, rejection: Rejection) {
        self.rejections.push(rejection);
    }

    /// Record an envelope addressed to nobody in the scenario.
    pub fn record_undeliverable(&mut self) {
        self.undeliverable += 1;
    }

    /// Agent snapshot by name
    pub fn agent(&self, name: &str) -> Option<&AgentView> {
        self.agents.get(name)
    }

    /// All agent names, sorted
    pub fn agent_names(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    /// Connection records of `name`
    pub fn connections(&self, name: &str) -> &[ConnectionRecord] {
        self.agents.get(name).map_or(&[], |a| a.connections.as_slice())
    }

    /// Credential exchange records of `name`
    pub fn exchanges(&self, name: &str) -> &[CredentialExchange] {
        self.agents.get(name).map_or(&[], |a| a.exchanges.as_slice())
    }

    /// Presentation records of `name`
    pub fn presentations(&self, name: &str) -> &[PresentationExchange] {
        self.agents.get(name).map_or(&[], |a| a.presentations.as_slice())
    }

    /// Envelopes sent by an actor.
    pub fn envelopes_sent(&self, actor: &str) -> usize {
        self.sent.get(actor).copied().unwrap_or(0)
    }

    /// Envelopes processed by an actor.
    pub fn envelopes_delivered(&self, actor: &str) -> usize {
        self.delivered.get(actor).copied().unwrap_or(0)
    }

    /// Refused deliveries, in delivery order
    pub fn rejections(&self) -> &[Rejection] {
        &self.rejections
    }

    /// Envelopes addressed to agents outside the scenario
    pub fn undeliverable(&self) -> usize {
        self.undeliverable
    }

    /// The connection `agent` holds with `peer`, if any
    pub fn connection_with(&self, agent: &str, peer: &str) -> Option<&ConnectionRecord> {
        let peer = AgentId::new(peer);
        self.connections(agent).iter().find(|c| c.peer_agent() == Some(&peer))
    }

    /// Both ends of the connection between `a` and `b`, if they share a thread
    pub fn connection_between(
        &self,
        a: &str,
        b: &str,
    ) -> Option<(&ConnectionRecord, &ConnectionRecord)> {
        let ours = self.connection_with(a, b)?;
        let theirs = self.connection_with(b, a)?;
        (ours.thread_id() == theirs.thread_id()).then_some((ours, theirs))
    }

    /// Basic message contents `agent` received from `peer`, in arrival order
    pub fn messages(&self, agent: &str, peer: &str) -> Vec<String> {
        let Some(connection) = self.connection_with(agent, peer) else {
            return Vec::new();
        };
        self.agents
            .get(agent)
            .and_then(|a| a.messages.get(&connection.id()))
            .map(|messages| messages.iter().map(|m| m.content.clone()).collect())
            .unwrap_or_default()
    }

    /// Credentials stored in `agent`'s wallet
    pub fn credentials(&self, agent: &str) -> usize {
        self.agents.get(agent).map_or(0, |a| a.wallet.len())
    }

    /// Every connection of every agent is completed
    pub fn all_connections_completed(&self) -> bool {
        self.agents
            .values()
            .flat_map(|a| &a.connections)
            .all(|c| c.state() == ConnectionState::Completed)
    }

    /// Every exchange of every agent is acknowledged
    pub fn all_exchanges_acknowledged(&self) -> bool {
        self.agents
            .values()
            .flat_map(|a| &a.exchanges)
            .all(|x| x.state() == ExchangeState::Acknowledged)
    }

    /// Paired records agree: both ends of every connected pair share DIDs,
    /// and exchanges on the same thread carry the same schema and values.
    pub fn peers_agree(&self) -> Result<(), String> {
        let names = self.agent_names();
        for (i, a) in names.iter().enumerate() {
            for b in &names[i + 1..] {
                let Some((ours, theirs)) = self.connection_between(a, b) else {
                    continue;
                };
                if ours.state() == ConnectionState::Completed
                    && (ours.peer_did() != theirs.my_did() || theirs.peer_did() != ours.my_did())
                {
                    return Err(format!("{a} and {b} disagree on DIDs"));
                }
            }
        }

        let exchanges: Vec<&CredentialExchange> =
            self.agents.values().flat_map(|a| &a.exchanges).collect();
        for x in &exchanges {
            for y in exchanges.iter().filter(|y| y.thread_id() == x.thread_id()) {
                if x.schema_id() != y.schema_id() || x.attributes() != y.attributes() {
                    return Err(format!("exchange thread {} disagrees", x.thread_id()));
                }
            }
        }
        Ok(())
    }
}
