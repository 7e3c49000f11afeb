//! Reference model for model-based testing.
//!
//! Two agents, [`Peer::Alice`] and [`Peer::Bob`], both auto-accepting. The
//! model tracks only what a user of the local API can observe: how many
//! connections completed, how many messages each side received, and how many
//! credentials Bob holds. Property tests apply the same operations to the
//! model and to real agents and compare results step by step.

use std::time::Duration;

/// One of the two agents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    /// Inviter and issuer
    Alice,
    /// Invitee and holder
    Bob,
}

impl Peer {
    /// The other agent
    pub fn other(self) -> Self {
        match self {
            Self::Alice => Self::Bob,
            Self::Bob => Self::Alice,
        }
    }

    /// Agent id used by real agents
    pub fn name(self) -> &'static str {
        match self {
            Self::Alice => "alice",
            Self::Bob => "bob",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Alice => 0,
            Self::Bob => 1,
        }
    }
}

/// Operations applied to both worlds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Alice invites Bob; Bob accepts
    Connect,
    /// Basic message over the newest connection
    SendMessage {
        /// Sender
        from: Peer,
        /// Message text
        content: String,
    },
    /// Trust ping over the newest connection
    Ping {
        /// Sender
        from: Peer,
    },
    /// Bob proposes a credential to Alice; `valid` picks attributes that
    /// match the schema or miss one
    ProposeCredential {
        /// Attributes match the schema
        valid: bool,
    },
    /// Move the clock and sweep
    AdvanceTime {
        /// How far
        by: Duration,
    },
}

/// Why an operation was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    /// No completed connection between the peers
    NotConnected,
    /// Attributes do not match the schema
    SchemaMismatch,
    /// Anything the model does not predict
    Unexpected(String),
}

/// Outcome of one operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationResult {
    /// Accepted
    Ok,
    /// Refused
    Error(OperationError),
}

/// Observable state compared after every operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
    /// Completed connections (counted once per pair)
    pub connections: usize,
    /// Basic messages received, indexed Alice then Bob
    pub messages_received: [usize; 2],
    /// Credentials in Bob's wallet
    pub credentials: usize,
    /// Acknowledged exchanges on Alice's side
    pub issued: usize,
}

/// The reference model
#[derive(Debug, Default)]
pub struct ModelWorld {
    state: Observation,
}

impl ModelWorld {
    /// Nothing connected yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Predict the outcome of `op` and update the model
    pub fn apply(&mut self, op: &Operation) -> OperationResult {
        let connected = self.state.connections > 0;
        match op {
            Operation::Connect => {
                self.state.connections += 1;
                OperationResult::Ok
            },
            Operation::SendMessage { .. } | Operation::Ping { .. } | Operation::ProposeCredential { .. }
                if !connected =>
            {
                OperationResult::Error(OperationError::NotConnected)
            },
            Operation::SendMessage { from, .. } => {
                self.state.messages_received[from.other().index()] += 1;
                OperationResult::Ok
            },
            Operation::Ping { .. } | Operation::AdvanceTime { .. } => OperationResult::Ok,
            Operation::ProposeCredential { valid: false } => {
                OperationResult::Error(OperationError::SchemaMismatch)
            },
            Operation::ProposeCredential { valid: true } => {
                self.state.credentials += 1;
                self.state.issued += 1;
                OperationResult::Ok
            },
        }
    }

    /// Current model state
    pub fn observe(&self) -> Observation {
        self.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_works_before_connecting() {
        let mut model = ModelWorld::new();
        let refused = OperationResult::Error(OperationError::NotConnected);
        assert_eq!(model.apply(&Operation::Ping { from: Peer::Alice }), refused);
        assert_eq!(model.apply(&Operation::ProposeCredential { valid: true }), refused);
        assert_eq!(model.observe(), Observation::default());
    }

    #[test]
    fn messages_count_at_the_receiver() {
        let mut model = ModelWorld::new();
        model.apply(&Operation::Connect);
        model.apply(&Operation::SendMessage { from: Peer::Bob, content: "hi".into() });
        model.apply(&Operation::ProposeCredential { valid: false });
        model.apply(&Operation::ProposeCredential { valid: true });

        let seen = model.observe();
        assert_eq!(seen.messages_received, [1, 0]);
        assert_eq!(seen.credentials, 1);
    }
}
