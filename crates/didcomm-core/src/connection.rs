//! Connection state machine.
//!
//! One [`ConnectionRecord`] exists per pairwise relationship. Records are
//! never deleted; they end in `Completed` or `Abandoned`.
//!
//! # Architecture: Action-Based State Machine
//!
//! - Methods accept time as parameter (no stored Environment)
//! - Methods return `Result<Vec<ConnectionAction>, ConnectionError>`
//! - The runtime executes actions (send reply, register route)
//!
//! # State Machine
//!
//! ```text
//! ┌────────────┐ request ┌─────────┐ response ┌──────────┐   ack   ┌───────────┐
//! │ Invitation │────────>│ Request │─────────>│ Response │────────>│ Completed │
//! └────────────┘         └─────────┘          └──────────┘         └───────────┘
//!       │                     │                     │
//!       │ problem_report / timeout / local abandon  │
//!       ↓                     ↓                     ↓
//!                         ┌───────────┐
//!                         │ Abandoned │
//!                         └───────────┘
//! ```
//!
//! # Roles
//!
//! - **Inviter** creates the invitation, receives `request`, sends
//!   `response`, receives `ack`.
//! - **Invitee** receives the invitation, sends `request`, receives
//!   `response` and immediately answers with `ack`, which completes its side.
//!
//! # Retransmission
//!
//! The record remembers the last inbound message it applied and the last
//! reply it produced. If the same inbound message arrives again it is
//! reported as [`Inbound::Duplicate`] and the stored reply is re-sent; state
//! does not change.

use std::time::Duration;

use didcomm_proto::{
    AgentId, ConnectionId, ConnectionMessage, Did, ThreadId,
    payloads::{Ack, ConnectionRequest, ConnectionResponse, Invitation, ProblemReport},
};
use serde::{Deserialize, Serialize};

use crate::{
    env::Timestamp, error::ConnectionError, expiry::ExpiryPolicy, reply::StoredReply,
};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Invitation created or received, no request yet
    Invitation,
    /// Request sent or received
    Request,
    /// Response sent or received
    Response,
    /// Both sides confirmed, ready for other protocols
    Completed,
    /// Gave up (problem report, timeout, local decision)
    Abandoned,
}

impl ConnectionState {
    /// No further transitions possible
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Abandoned)
    }

    /// Position along the forward path, `None` for `Abandoned`
    pub fn rank(self) -> Option<u8> {
        match self {
            Self::Invitation => Some(0),
            Self::Request => Some(1),
            Self::Response => Some(2),
            Self::Completed => Some(3),
            Self::Abandoned => None,
        }
    }

    /// Whether `next` is reachable from `self` without rewinding
    pub fn can_advance_to(self, next: Self) -> bool {
        match (self.rank(), next.rank()) {
            (Some(_), None) => !self.is_terminal(),
            (Some(current), Some(next)) => next > current,
            (None, _) => false,
        }
    }
}

/// Which side of the invitation the local agent is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionRole {
    /// Created the invitation
    Inviter,
    /// Received the invitation
    Invitee,
}

/// Actions returned by the connection state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Send this reply to the peer on the connection's thread
    Send(StoredReply),

    /// Connection reached `Completed`; routing may be registered
    Completed {
        /// Local record
        connection_id: ConnectionId,
        /// Peer's pairwise DID
        peer_did: Did,
    },

    /// Connection moved to `Abandoned`
    Abandoned {
        /// Why the connection was given up
        reason: String,
    },
}

/// Classification of an inbound message against a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// Valid transition, apply it
    Apply,
    /// Same message as the one that produced the current state
    Duplicate,
}

/// Transition table for inbound connection messages.
///
/// Returns the state the record moves to, or `None` when the message is not
/// acceptable. Invitations never advance an existing record; they only
/// create new ones.
fn next_state(
    role: ConnectionRole,
    state: ConnectionState,
    message: ConnectionMessage,
) -> Option<ConnectionState> {
    use ConnectionMessage as M;
    use ConnectionRole as R;
    use ConnectionState as S;

    match (role, state, message) {
        (R::Inviter, S::Invitation, M::Request) => Some(S::Request),
        (R::Inviter, S::Response, M::Ack) => Some(S::Completed),
        (R::Invitee, S::Request, M::Response) => Some(S::Response),
        (_, S::Invitation | S::Request | S::Response, M::ProblemReport) => Some(S::Abandoned),
        (_, _, M::Invitation | M::Request | M::Response | M::Ack | M::ProblemReport) => None,
    }
}

/// Pairwise connection record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    id: ConnectionId,
    role: ConnectionRole,
    state: ConnectionState,
    thread_id: ThreadId,
    their_label: Option<String>,
    peer_agent: Option<AgentId>,
    peer_did: Option<Did>,
    my_did: Option<Did>,
    invitation_url: Option<String>,
    last_inbound: Option<ConnectionMessage>,
    last_reply: Option<StoredReply>,
    abandon_reason: Option<String>,
    created_at: Timestamp,
    updated_at: Timestamp,
}

impl ConnectionRecord {
    /// New inviter-side record in `Invitation`.
    ///
    /// The invitation's `@id` is used as the connection's thread id, so every
    /// later connection message correlates back to this record.
    pub fn new_invitation(
        id: ConnectionId,
        thread_id: ThreadId,
        invitation_url: Option<String>,
        now: Timestamp,
    ) -> Self {
        Self {
            id,
            role: ConnectionRole::Inviter,
            state: ConnectionState::Invitation,
            thread_id,
            their_label: None,
            peer_agent: None,
            peer_did: None,
            my_did: None,
            invitation_url,
            last_inbound: None,
            last_reply: None,
            abandon_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// New invitee-side record from a received invitation
    pub fn from_invitation(
        id: ConnectionId,
        thread_id: ThreadId,
        invitation: &Invitation,
        peer_agent: AgentId,
        now: Timestamp,
    ) -> Self {
        Self {
            id,
            role: ConnectionRole::Invitee,
            state: ConnectionState::Invitation,
            thread_id,
            their_label: Some(invitation.label.clone()),
            peer_agent: Some(peer_agent),
            peer_did: None,
            my_did: None,
            invitation_url: None,
            last_inbound: Some(ConnectionMessage::Invitation),
            last_reply: None,
            abandon_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record id
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Local role
    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Thread shared by every connection-protocol message of this record
    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    /// Peer's self-declared label
    pub fn their_label(&self) -> Option<&str> {
        self.their_label.as_deref()
    }

    /// Transport address of the peer, once known
    pub fn peer_agent(&self) -> Option<&AgentId> {
        self.peer_agent.as_ref()
    }

    /// Peer's pairwise DID, once known
    pub fn peer_did(&self) -> Option<&Did> {
        self.peer_did.as_ref()
    }

    /// Our pairwise DID, once created
    pub fn my_did(&self) -> Option<&Did> {
        self.my_did.as_ref()
    }

    /// Invitation URL (inviter side)
    pub fn invitation_url(&self) -> Option<&str> {
        self.invitation_url.as_deref()
    }

    /// Reason recorded when the connection was abandoned
    pub fn abandon_reason(&self) -> Option<&str> {
        self.abandon_reason.as_deref()
    }

    /// Creation time
    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Time of the last transition
    pub fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    /// Ready for other protocols
    pub fn is_completed(&self) -> bool {
        self.state == ConnectionState::Completed
    }

    /// Classify an inbound message without changing anything
    pub fn check_inbound(&self, message: ConnectionMessage) -> Result<Inbound, ConnectionError> {
        if self.last_inbound == Some(message) {
            return Ok(Inbound::Duplicate);
        }
        self.expect_inbound(message).map(|_| Inbound::Apply)
    }

    /// Actions that answer a retransmitted message
    pub fn duplicate_actions(&self) -> Vec<ConnectionAction> {
        self.last_reply.iter().cloned().map(ConnectionAction::Send).collect()
    }

    /// Inviter: a `request` arrived.
    ///
    /// Captures the peer's DID and address. The response is sent separately
    /// via [`Self::send_response`], either immediately (auto-accept) or after
    /// an explicit decision.
    ///
    /// # Errors
    /// Returns `InvalidTransition` unless this is an inviter in `Invitation`
    pub fn receive_request(
        &mut self,
        sender: &AgentId,
        request: &ConnectionRequest,
        now: Timestamp,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        let next = self.expect_inbound(ConnectionMessage::Request)?;

        self.their_label = Some(request.label.clone());
        self.peer_agent = Some(sender.clone());
        self.peer_did = Some(request.did.clone());
        self.enter(next, Some(ConnectionMessage::Request), now);

        Ok(vec![])
    }

    /// Inviter: answer the request with our DID
    ///
    /// # Errors
    /// Returns `InvalidState` unless this is an inviter in `Request`
    pub fn send_response(
        &mut self,
        my_did: Did,
        now: Timestamp,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        if self.role != ConnectionRole::Inviter || self.state != ConnectionState::Request {
            return Err(ConnectionError::InvalidState {
                state: self.state,
                operation: "send_response",
            });
        }

        let reply = StoredReply::connection(
            ConnectionMessage::Response,
            &ConnectionResponse { did: my_did.clone() },
        )?;
        self.my_did = Some(my_did);
        self.last_reply = Some(reply.clone());
        self.enter(ConnectionState::Response, None, now);

        Ok(vec![ConnectionAction::Send(reply)])
    }

    /// Inviter: the invitee acknowledged our response
    ///
    /// # Errors
    /// Returns `InvalidTransition` unless this is an inviter in `Response`
    pub fn receive_ack(&mut self, now: Timestamp) -> Result<Vec<ConnectionAction>, ConnectionError> {
        let next = self.expect_inbound(ConnectionMessage::Ack)?;
        self.enter(next, Some(ConnectionMessage::Ack), now);
        Ok(self.completion_actions())
    }

    /// Invitee: ask the inviter to connect
    ///
    /// # Errors
    /// Returns `InvalidState` unless this is an invitee in `Invitation`
    pub fn send_request(
        &mut self,
        my_did: Did,
        label: &str,
        now: Timestamp,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        if self.role != ConnectionRole::Invitee || self.state != ConnectionState::Invitation {
            return Err(ConnectionError::InvalidState {
                state: self.state,
                operation: "send_request",
            });
        }

        let reply = StoredReply::connection(
            ConnectionMessage::Request,
            &ConnectionRequest { label: label.to_string(), did: my_did.clone() },
        )?;
        self.my_did = Some(my_did);
        self.last_reply = Some(reply.clone());
        self.enter(ConnectionState::Request, None, now);

        Ok(vec![ConnectionAction::Send(reply)])
    }

    /// Invitee: the inviter responded.
    ///
    /// Records the peer DID, acknowledges and completes in one step.
    ///
    /// # Errors
    /// Returns `InvalidTransition` unless this is an invitee in `Request`
    pub fn receive_response(
        &mut self,
        response: &ConnectionResponse,
        now: Timestamp,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        let next = self.expect_inbound(ConnectionMessage::Response)?;
        let ack = StoredReply::connection(ConnectionMessage::Ack, &Ack::default())?;

        self.peer_did = Some(response.did.clone());
        self.enter(next, Some(ConnectionMessage::Response), now);

        self.last_reply = Some(ack.clone());
        self.enter(ConnectionState::Completed, None, now);

        let mut actions = vec![ConnectionAction::Send(ack)];
        actions.extend(self.completion_actions());
        Ok(actions)
    }

    /// Peer gave up on the connection
    ///
    /// # Errors
    /// Returns `InvalidTransition` if the connection is already terminal
    pub fn receive_problem_report(
        &mut self,
        report: &ProblemReport,
        now: Timestamp,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        let next = self.expect_inbound(ConnectionMessage::ProblemReport)?;
        let reason = match &report.explain {
            Some(explain) => format!("{}: {explain}", report.code),
            None => report.code.clone(),
        };

        self.abandon_reason = Some(reason.clone());
        self.enter(next, Some(ConnectionMessage::ProblemReport), now);

        Ok(vec![ConnectionAction::Abandoned { reason }])
    }

    /// Give up locally and tell the peer, if it is known
    ///
    /// # Errors
    /// Returns `InvalidState` if the connection is already terminal
    pub fn abandon(
        &mut self,
        reason: &str,
        now: Timestamp,
    ) -> Result<Vec<ConnectionAction>, ConnectionError> {
        if self.state.is_terminal() {
            return Err(ConnectionError::InvalidState { state: self.state, operation: "abandon" });
        }

        let mut actions = Vec::new();
        if self.peer_agent.is_some() {
            let report = StoredReply::problem_report(
                ConnectionMessage::ProblemReport.message_type(),
                "abandoned",
                reason,
            );
            self.last_reply = Some(report.clone());
            actions.push(ConnectionAction::Send(report));
        }

        self.abandon_reason = Some(reason.to_string());
        self.enter(ConnectionState::Abandoned, None, now);
        actions.push(ConnectionAction::Abandoned { reason: reason.to_string() });

        Ok(actions)
    }

    /// Check whether the record stalled past the policy's limit
    ///
    /// # Returns
    /// `Some(elapsed)` if expired, `None` otherwise
    #[must_use]
    pub fn check_expiry(&self, policy: &ExpiryPolicy, now: Timestamp) -> Option<Duration> {
        if self.state.is_terminal() {
            return None;
        }
        policy.connection_expired(self.updated_at, now)
    }

    /// Abandon the record if it expired
    ///
    /// Call this periodically; returns no actions while the record is live.
    pub fn tick(&mut self, policy: &ExpiryPolicy, now: Timestamp) -> Vec<ConnectionAction> {
        let Some(elapsed) = self.check_expiry(policy, now) else {
            return Vec::new();
        };

        let reason = format!("no progress in {:?} for {elapsed:?}", self.state);
        self.abandon(&reason, now).unwrap_or_default()
    }

    fn expect_inbound(
        &self,
        message: ConnectionMessage,
    ) -> Result<ConnectionState, ConnectionError> {
        next_state(self.role, self.state, message).ok_or(ConnectionError::InvalidTransition {
            state: self.state,
            role: self.role,
            message,
        })
    }

    fn enter(&mut self, next: ConnectionState, inbound: Option<ConnectionMessage>, now: Timestamp) {
        debug_assert!(self.state.can_advance_to(next), "{:?} -> {next:?}", self.state);

        self.state = next;
        if inbound.is_some() {
            // A stored reply only ever answers the latest inbound message
            self.last_inbound = inbound;
            self.last_reply = None;
        }
        self.updated_at = now;
    }

    fn completion_actions(&self) -> Vec<ConnectionAction> {
        self.peer_did
            .iter()
            .map(|peer_did| ConnectionAction::Completed {
                connection_id: self.id,
                peer_did: peer_did.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(millis: u64) -> Timestamp {
        Timestamp::from_millis(millis)
    }

    fn did(s: &str) -> Did {
        s.parse().unwrap()
    }

    fn inviter() -> ConnectionRecord {
        ConnectionRecord::new_invitation(
            ConnectionId::generate(),
            ThreadId::new("inv-1"),
            None,
            t(0),
        )
    }

    fn invitee() -> ConnectionRecord {
        let invitation =
            Invitation { label: "issuer".into(), service_endpoint: None, recipient_keys: vec![] };
        ConnectionRecord::from_invitation(
            ConnectionId::generate(),
            ThreadId::new("inv-1"),
            &invitation,
            AgentId::new("issuer"),
            t(0),
        )
    }

    fn request() -> ConnectionRequest {
        ConnectionRequest { label: "holder".into(), did: did("did:peer:holder") }
    }

    #[test]
    fn inviter_lifecycle() {
        let mut conn = inviter();
        assert_eq!(conn.state(), ConnectionState::Invitation);

        let actions = conn.receive_request(&AgentId::new("holder"), &request(), t(1)).unwrap();
        assert!(actions.is_empty());
        assert_eq!(conn.state(), ConnectionState::Request);
        assert_eq!(conn.peer_did(), Some(&did("did:peer:holder")));

        let actions = conn.send_response(did("did:peer:issuer"), t(2)).unwrap();
        assert_eq!(conn.state(), ConnectionState::Response);
        assert!(matches!(&actions[..], [ConnectionAction::Send(reply)]
            if reply.message_type.name() == "response"));

        let actions = conn.receive_ack(t(3)).unwrap();
        assert_eq!(conn.state(), ConnectionState::Completed);
        assert_eq!(
            actions,
            vec![ConnectionAction::Completed {
                connection_id: conn.id(),
                peer_did: did("did:peer:holder")
            }]
        );
        assert_eq!(conn.updated_at(), t(3));
    }

    #[test]
    fn invitee_lifecycle() {
        let mut conn = invitee();

        let actions = conn.send_request(did("did:peer:holder"), "holder", t(1)).unwrap();
        assert_eq!(conn.state(), ConnectionState::Request);
        assert_eq!(actions.len(), 1);

        let response = ConnectionResponse { did: did("did:peer:issuer") };
        let actions = conn.receive_response(&response, t(2)).unwrap();
        assert_eq!(conn.state(), ConnectionState::Completed);
        assert!(matches!(&actions[0], ConnectionAction::Send(reply)
            if reply.message_type.name() == "ack"));
        assert!(matches!(&actions[1], ConnectionAction::Completed { .. }));
    }

    #[test]
    fn request_on_completed_connection_is_invalid() {
        let mut conn = inviter();
        conn.receive_request(&AgentId::new("holder"), &request(), t(1)).unwrap();
        conn.send_response(did("did:peer:issuer"), t(2)).unwrap();
        conn.receive_ack(t(3)).unwrap();

        let result = conn.check_inbound(ConnectionMessage::Request);
        assert!(matches!(result, Err(ConnectionError::InvalidTransition { .. })));

        let result = conn.receive_request(&AgentId::new("mallory"), &request(), t(4));
        assert!(matches!(result, Err(ConnectionError::InvalidTransition { .. })));
        assert_eq!(conn.state(), ConnectionState::Completed);
    }

    #[test]
    fn retransmitted_request_is_duplicate_and_replays_response() {
        let mut conn = inviter();
        conn.receive_request(&AgentId::new("holder"), &request(), t(1)).unwrap();
        conn.send_response(did("did:peer:issuer"), t(2)).unwrap();

        assert_eq!(conn.check_inbound(ConnectionMessage::Request).unwrap(), Inbound::Duplicate);
        let replay = conn.duplicate_actions();
        assert!(matches!(&replay[..], [ConnectionAction::Send(reply)]
            if reply.message_type.name() == "response"));
        assert_eq!(conn.state(), ConnectionState::Response);
    }

    #[test]
    fn retransmitted_ack_replays_nothing() {
        let mut conn = inviter();
        conn.receive_request(&AgentId::new("holder"), &request(), t(1)).unwrap();
        conn.send_response(did("did:peer:issuer"), t(2)).unwrap();
        conn.receive_ack(t(3)).unwrap();

        assert_eq!(conn.check_inbound(ConnectionMessage::Ack).unwrap(), Inbound::Duplicate);
        assert!(conn.duplicate_actions().is_empty());
    }

    #[test]
    fn role_mismatch_is_invalid() {
        let conn = inviter();
        assert!(conn.check_inbound(ConnectionMessage::Response).is_err());

        let conn = invitee();
        assert!(conn.check_inbound(ConnectionMessage::Request).is_err());
        assert!(conn.check_inbound(ConnectionMessage::Ack).is_err());
    }

    #[test]
    fn invitation_replay_on_invitee_is_duplicate() {
        let conn = invitee();
        assert_eq!(conn.check_inbound(ConnectionMessage::Invitation).unwrap(), Inbound::Duplicate);
    }

    #[test]
    fn problem_report_abandons() {
        let mut conn = inviter();
        let report = ProblemReport { code: "rejected".into(), explain: Some("no thanks".into()) };
        let actions = conn.receive_problem_report(&report, t(5)).unwrap();
        assert_eq!(conn.state(), ConnectionState::Abandoned);
        assert_eq!(conn.abandon_reason(), Some("rejected: no thanks"));
        assert!(matches!(&actions[..], [ConnectionAction::Abandoned { .. }]));

        // Terminal: nothing else is accepted
        assert!(conn.check_inbound(ConnectionMessage::Request).is_err());
        assert!(conn.abandon("again", t(6)).is_err());
    }

    #[test]
    fn local_abandon_notifies_known_peer() {
        let mut conn = invitee();
        let actions = conn.abandon("user declined", t(1)).unwrap();
        assert_eq!(actions.len(), 2);
        assert!(matches!(&actions[0], ConnectionAction::Send(reply)
            if reply.message_type.name() == "problem_report"));
    }

    #[test]
    fn stalled_connection_expires() {
        let policy = ExpiryPolicy {
            connection_timeout: Some(Duration::from_secs(30)),
            ..ExpiryPolicy::default()
        };
        let mut conn = inviter();

        assert!(conn.tick(&policy, t(29_000)).is_empty());
        assert_eq!(conn.state(), ConnectionState::Invitation);

        let actions = conn.tick(&policy, t(31_000));
        assert_eq!(conn.state(), ConnectionState::Abandoned);
        assert!(actions.iter().any(|a| matches!(a, ConnectionAction::Abandoned { .. })));
    }

    #[test]
    fn completed_connection_never_expires() {
        let policy = ExpiryPolicy {
            connection_timeout: Some(Duration::from_secs(1)),
            ..ExpiryPolicy::default()
        };
        let mut conn = invitee();
        conn.send_request(did("did:peer:holder"), "holder", t(0)).unwrap();
        conn.receive_response(&ConnectionResponse { did: did("did:peer:issuer") }, t(0)).unwrap();

        assert!(conn.tick(&policy, t(10_000_000)).is_empty());
        assert_eq!(conn.state(), ConnectionState::Completed);
    }

    #[test]
    fn forward_only_ordering() {
        use ConnectionState as S;
        assert!(S::Invitation.can_advance_to(S::Request));
        assert!(S::Invitation.can_advance_to(S::Abandoned));
        assert!(!S::Response.can_advance_to(S::Request));
        assert!(!S::Completed.can_advance_to(S::Abandoned));
        assert!(!S::Abandoned.can_advance_to(S::Invitation));
    }
}
