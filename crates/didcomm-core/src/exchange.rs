//! Credential exchange state machine.
//!
//! One [`CredentialExchange`] exists per thread id. Many exchanges may hang
//! off one connection; they never share a thread.
//!
//! ```text
//! ┌──────────┐ offer ┌─────────┐ request ┌───────────┐ issue ┌────────┐ ack ┌──────────────┐
//! │ Proposed │──────>│ Offered │────────>│ Requested │──────>│ Issued │────>│ Acknowledged │
//! └──────────┘       └─────────┘         └───────────┘       └────────┘     └──────────────┘
//!        problem_report / timeout / local abandon from any non-terminal state
//!                                   ↓
//!                            ┌───────────┐
//!                            │ Abandoned │
//!                            └───────────┘
//! ```
//!
//! Inbound messages are first classified by [`plan`], an exhaustive table
//! over `(role, state, message)`. The returned [`Step`] tells the runtime
//! which collaborator work to do (sign an offer, issue or verify a
//! credential) before it calls the matching mutation method. Mutation
//! methods validate before they touch the record, so a failed call leaves
//! it unchanged.

use std::time::Duration;

use didcomm_proto::{
    ConnectionId, CredentialMessage, ExchangeId, ThreadId,
    payloads::{
        Ack, Attributes, Credential, CredentialIssue, CredentialOffer, CredentialProposal,
        CredentialRequest, ProblemReport,
    },
};
use serde::{Deserialize, Serialize};

use crate::{env::Timestamp, error::ExchangeError, expiry::ExpiryPolicy, reply::StoredReply};

/// Credential exchange state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeState {
    /// Holder proposed a credential
    Proposed,
    /// Issuer offered a credential
    Offered,
    /// Holder requested the offered credential
    Requested,
    /// Issuer delivered the credential
    Issued,
    /// Holder confirmed receipt
    Acknowledged,
    /// Gave up
    Abandoned,
}

impl ExchangeState {
    /// No further transitions possible
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Acknowledged | Self::Abandoned)
    }

    /// Position along the forward path, `None` for `Abandoned`
    pub fn rank(self) -> Option<u8> {
        match self {
            Self::Proposed => Some(0),
            Self::Offered => Some(1),
            Self::Requested => Some(2),
            Self::Issued => Some(3),
            Self::Acknowledged => Some(4),
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

/// Local side of the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeRole {
    /// Issues the credential
    Issuer,
    /// Receives the credential
    Holder,
}

/// What the runtime must do for an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Retransmission of the message that produced the current state
    Duplicate,
    /// Issuer: answer a proposal with an offer
    SendOffer,
    /// Issuer: park the proposal until a local decision
    HoldProposal,
    /// Holder: answer an offer with a request
    SendRequest,
    /// Holder: park the offer until a local decision
    HoldOffer,
    /// Issuer: issue the credential through the wallet
    IssueCredential,
    /// Holder: verify and store the credential, then acknowledge
    StoreCredential,
    /// Issuer: holder acknowledged, exchange done
    Complete,
    /// Peer sent a problem report
    Abandon,
}

/// Exhaustive transition table.
///
/// `state` is `None` when no record exists for the thread yet; only
/// `propose` (issuer) and `offer` (holder) may create one.
///
/// # Errors
/// Returns `InvalidTransition` for every combination outside the table
pub fn plan(
    role: ExchangeRole,
    state: Option<ExchangeState>,
    message: CredentialMessage,
    auto_respond: bool,
) -> Result<Step, ExchangeError> {
    use CredentialMessage as M;
    use ExchangeRole as R;
    use ExchangeState as S;

    let respond = |send, hold| if auto_respond { send } else { hold };

    match (role, state, message) {
        (R::Issuer, None, M::Propose) => Ok(respond(Step::SendOffer, Step::HoldProposal)),
        (R::Issuer, Some(S::Offered), M::Request) => Ok(Step::IssueCredential),
        (R::Issuer, Some(S::Issued), M::Ack) => Ok(Step::Complete),

        (R::Holder, None | Some(S::Proposed), M::Offer) => {
            Ok(respond(Step::SendRequest, Step::HoldOffer))
        },
        (R::Holder, Some(S::Requested), M::Issue) => Ok(Step::StoreCredential),

        (_, Some(current), M::ProblemReport) if !current.is_terminal() => Ok(Step::Abandon),

        (_, _, M::Propose | M::Offer | M::Request | M::Issue | M::Ack | M::ProblemReport) => {
            Err(ExchangeError::InvalidTransition { state, role, message })
        },
    }
}

/// Actions returned by the exchange state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeAction {
    /// Send this reply to the peer on the exchange's thread
    Send(StoredReply),

    /// Exchange reached `Acknowledged`
    Completed {
        /// Local record
        exchange_id: ExchangeId,
        /// Credential that was issued or stored
        credential_id: Option<String>,
    },

    /// Exchange moved to `Abandoned`
    Abandoned {
        /// Why the exchange was given up
        reason: String,
    },
}

/// Credential exchange record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialExchange {
    id: ExchangeId,
    connection_id: ConnectionId,
    role: ExchangeRole,
    state: ExchangeState,
    thread_id: ThreadId,
    schema_id: String,
    attributes: Attributes,
    credential_id: Option<String>,
    last_inbound: Option<CredentialMessage>,
    last_reply: Option<StoredReply>,
    abandon_reason: Option<String>,
    created_at: Timestamp,
    updated_at: Timestamp,
}

impl CredentialExchange {
    #[allow(clippy::too_many_arguments)]
    fn new(
        id: ExchangeId,
        connection_id: ConnectionId,
        role: ExchangeRole,
        state: ExchangeState,
        thread_id: ThreadId,
        schema_id: String,
        attributes: Attributes,
        now: Timestamp,
    ) -> Self {
        Self {
            id,
            connection_id,
            role,
            state,
            thread_id,
            schema_id,
            attributes,
            credential_id: None,
            last_inbound: None,
            last_reply: None,
            abandon_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Holder starts an exchange by proposing a credential
    ///
    /// # Errors
    /// Returns `Protocol` if the proposal cannot be serialized
    pub fn propose(
        id: ExchangeId,
        connection_id: ConnectionId,
        thread_id: ThreadId,
        proposal: &CredentialProposal,
        now: Timestamp,
    ) -> Result<(Self, Vec<ExchangeAction>), ExchangeError> {
        let reply = StoredReply::credential(CredentialMessage::Propose, proposal)?;
        let mut exchange = Self::new(
            id,
            connection_id,
            ExchangeRole::Holder,
            ExchangeState::Proposed,
            thread_id,
            proposal.schema_id.clone(),
            proposal.attributes.clone(),
            now,
        );
        exchange.last_reply = Some(reply.clone());
        Ok((exchange, vec![ExchangeAction::Send(reply)]))
    }

    /// Issuer starts an exchange with an unsolicited offer
    ///
    /// # Errors
    /// Returns `Protocol` if the offer cannot be serialized
    pub fn offer(
        id: ExchangeId,
        connection_id: ConnectionId,
        thread_id: ThreadId,
        offer: &CredentialOffer,
        now: Timestamp,
    ) -> Result<(Self, Vec<ExchangeAction>), ExchangeError> {
        let reply = StoredReply::credential(CredentialMessage::Offer, offer)?;
        let mut exchange = Self::new(
            id,
            connection_id,
            ExchangeRole::Issuer,
            ExchangeState::Offered,
            thread_id,
            offer.schema_id.clone(),
            offer.attributes.clone(),
            now,
        );
        exchange.last_reply = Some(reply.clone());
        Ok((exchange, vec![ExchangeAction::Send(reply)]))
    }

    /// Issuer-side record for a received proposal, in `Proposed`
    pub fn from_proposal(
        id: ExchangeId,
        connection_id: ConnectionId,
        thread_id: ThreadId,
        proposal: &CredentialProposal,
        now: Timestamp,
    ) -> Self {
        let mut exchange = Self::new(
            id,
            connection_id,
            ExchangeRole::Issuer,
            ExchangeState::Proposed,
            thread_id,
            proposal.schema_id.clone(),
            proposal.attributes.clone(),
            now,
        );
        exchange.last_inbound = Some(CredentialMessage::Propose);
        exchange
    }

    /// Holder-side record for an unsolicited offer, in `Offered`
    pub fn from_offer(
        id: ExchangeId,
        connection_id: ConnectionId,
        thread_id: ThreadId,
        offer: &CredentialOffer,
        now: Timestamp,
    ) -> Self {
        let mut exchange = Self::new(
            id,
            connection_id,
            ExchangeRole::Holder,
            ExchangeState::Offered,
            thread_id,
            offer.schema_id.clone(),
            offer.attributes.clone(),
            now,
        );
        exchange.last_inbound = Some(CredentialMessage::Offer);
        exchange
    }

    /// Record id
    pub fn id(&self) -> ExchangeId {
        self.id
    }

    /// Connection the exchange runs over
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Local role
    pub fn role(&self) -> ExchangeRole {
        self.role
    }

    /// Current state
    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// Thread identifying this exchange
    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    /// Schema of the credential
    pub fn schema_id(&self) -> &str {
        &self.schema_id
    }

    /// Attribute values as last proposed or offered
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Wallet id of the issued or stored credential
    pub fn credential_id(&self) -> Option<&str> {
        self.credential_id.as_deref()
    }

    /// Reason recorded when the exchange was abandoned
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

    /// Classify an inbound message against this record
    ///
    /// # Errors
    /// Returns `InvalidTransition` for combinations outside the table
    pub fn plan(&self, message: CredentialMessage, auto_respond: bool) -> Result<Step, ExchangeError> {
        if self.last_inbound == Some(message) {
            return Ok(Step::Duplicate);
        }
        plan(self.role, Some(self.state), message, auto_respond)
    }

    /// Actions that answer a retransmitted message
    pub fn duplicate_actions(&self) -> Vec<ExchangeAction> {
        self.last_reply.iter().cloned().map(ExchangeAction::Send).collect()
    }

    /// Move forward to `next`
    ///
    /// # Errors
    /// Returns `Regression` if `next` is not ahead of the current state
    pub fn advance(&mut self, next: ExchangeState, now: Timestamp) -> Result<(), ExchangeError> {
        if !self.state.can_advance_to(next) {
            return Err(ExchangeError::Regression { from: self.state, to: next });
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }

    /// Set the credential id, which may happen exactly once
    ///
    /// # Errors
    /// Returns `CredentialReassigned` if a different id is already set
    pub fn assign_credential(&mut self, credential_id: &str) -> Result<(), ExchangeError> {
        match &self.credential_id {
            Some(existing) if existing != credential_id => {
                Err(ExchangeError::CredentialReassigned(existing.clone()))
            },
            Some(_) => Ok(()),
            None => {
                self.credential_id = Some(credential_id.to_string());
                Ok(())
            },
        }
    }

    /// Issuer: answer the pending proposal
    ///
    /// # Errors
    /// Returns `InvalidState` unless this is an issuer in `Proposed`
    pub fn send_offer(
        &mut self,
        offer: &CredentialOffer,
        now: Timestamp,
    ) -> Result<Vec<ExchangeAction>, ExchangeError> {
        self.require(ExchangeRole::Issuer, ExchangeState::Proposed, "send_offer")?;

        let reply = StoredReply::credential(CredentialMessage::Offer, offer)?;
        self.advance(ExchangeState::Offered, now)?;
        self.schema_id.clone_from(&offer.schema_id);
        self.attributes.clone_from(&offer.attributes);
        self.last_reply = Some(reply.clone());

        Ok(vec![ExchangeAction::Send(reply)])
    }

    /// Holder: an offer arrived on our proposal's thread
    ///
    /// # Errors
    /// Returns `InvalidTransition` unless this is a holder in `Proposed`
    pub fn receive_offer(
        &mut self,
        offer: &CredentialOffer,
        now: Timestamp,
    ) -> Result<Vec<ExchangeAction>, ExchangeError> {
        self.expect_inbound(CredentialMessage::Offer)?;

        self.advance(ExchangeState::Offered, now)?;
        self.schema_id.clone_from(&offer.schema_id);
        self.attributes.clone_from(&offer.attributes);
        self.record_inbound(CredentialMessage::Offer);

        Ok(vec![])
    }

    /// Holder: accept the offer
    ///
    /// # Errors
    /// Returns `InvalidState` unless this is a holder in `Offered`
    pub fn send_request(
        &mut self,
        request: &CredentialRequest,
        now: Timestamp,
    ) -> Result<Vec<ExchangeAction>, ExchangeError> {
        self.require(ExchangeRole::Holder, ExchangeState::Offered, "send_request")?;

        let reply = StoredReply::credential(CredentialMessage::Request, request)?;
        self.advance(ExchangeState::Requested, now)?;
        self.last_reply = Some(reply.clone());

        Ok(vec![ExchangeAction::Send(reply)])
    }

    /// Issuer: the holder requested the offered credential, which the wallet
    /// has issued as `credential`.
    ///
    /// # Errors
    /// Returns `InvalidTransition` unless this is an issuer in `Offered`
    pub fn issue(
        &mut self,
        credential: &Credential,
        now: Timestamp,
    ) -> Result<Vec<ExchangeAction>, ExchangeError> {
        self.expect_inbound(CredentialMessage::Request)?;

        let reply = StoredReply::credential(
            CredentialMessage::Issue,
            &CredentialIssue { credential: credential.clone() },
        )?;
        let mut next = self.clone();
        next.advance(ExchangeState::Issued, now)?;
        next.assign_credential(&credential.id)?;
        next.record_inbound(CredentialMessage::Request);
        next.last_reply = Some(reply.clone());
        *self = next;

        Ok(vec![ExchangeAction::Send(reply)])
    }

    /// Holder: the credential arrived and the wallet stored it as
    /// `credential_id`. Acknowledges and completes in one step.
    ///
    /// # Errors
    /// Returns `InvalidTransition` unless this is a holder in `Requested`
    pub fn receive_issue(
        &mut self,
        credential_id: &str,
        now: Timestamp,
    ) -> Result<Vec<ExchangeAction>, ExchangeError> {
        self.expect_inbound(CredentialMessage::Issue)?;

        let ack = StoredReply::credential(CredentialMessage::Ack, &Ack::default())?;
        let mut next = self.clone();
        next.advance(ExchangeState::Issued, now)?;
        next.assign_credential(credential_id)?;
        next.record_inbound(CredentialMessage::Issue);
        next.advance(ExchangeState::Acknowledged, now)?;
        next.last_reply = Some(ack.clone());
        *self = next;

        Ok(vec![ExchangeAction::Send(ack), self.completed()])
    }

    /// Issuer: the holder acknowledged receipt
    ///
    /// # Errors
    /// Returns `InvalidTransition` unless this is an issuer in `Issued`
    pub fn receive_ack(&mut self, now: Timestamp) -> Result<Vec<ExchangeAction>, ExchangeError> {
        self.expect_inbound(CredentialMessage::Ack)?;

        self.advance(ExchangeState::Acknowledged, now)?;
        self.record_inbound(CredentialMessage::Ack);

        Ok(vec![self.completed()])
    }

    /// Peer gave up on the exchange
    ///
    /// # Errors
    /// Returns `InvalidTransition` if the exchange is already terminal
    pub fn receive_problem_report(
        &mut self,
        report: &ProblemReport,
        now: Timestamp,
    ) -> Result<Vec<ExchangeAction>, ExchangeError> {
        self.expect_inbound(CredentialMessage::ProblemReport)?;

        let reason = match &report.explain {
            Some(explain) => format!("{}: {explain}", report.code),
            None => report.code.clone(),
        };
        self.advance(ExchangeState::Abandoned, now)?;
        self.record_inbound(CredentialMessage::ProblemReport);
        self.abandon_reason = Some(reason.clone());

        Ok(vec![ExchangeAction::Abandoned { reason }])
    }

    /// Give up locally and send a problem report to the peer
    ///
    /// # Errors
    /// Returns `InvalidState` if the exchange is already terminal
    pub fn abandon(
        &mut self,
        reason: &str,
        now: Timestamp,
    ) -> Result<Vec<ExchangeAction>, ExchangeError> {
        if self.state.is_terminal() {
            return Err(ExchangeError::InvalidState { state: self.state, operation: "abandon" });
        }

        let report = StoredReply::problem_report(
            CredentialMessage::ProblemReport.message_type(),
            "abandoned",
            reason,
        );
        self.advance(ExchangeState::Abandoned, now)?;
        self.abandon_reason = Some(reason.to_string());
        self.last_reply = Some(report.clone());

        Ok(vec![ExchangeAction::Send(report), ExchangeAction::Abandoned {
            reason: reason.to_string(),
        }])
    }

    /// `Some(elapsed)` if the exchange stalled past the policy's limit
    #[must_use]
    pub fn check_expiry(&self, policy: &ExpiryPolicy, now: Timestamp) -> Option<Duration> {
        if self.state.is_terminal() {
            return None;
        }
        policy.exchange_expired(self.updated_at, now)
    }

    /// Abandon the exchange if it expired
    pub fn tick(&mut self, policy: &ExpiryPolicy, now: Timestamp) -> Vec<ExchangeAction> {
        let Some(elapsed) = self.check_expiry(policy, now) else {
            return Vec::new();
        };

        let reason = format!("no progress in {:?} for {elapsed:?}", self.state);
        self.abandon(&reason, now).unwrap_or_default()
    }

    fn require(
        &self,
        role: ExchangeRole,
        state: ExchangeState,
        operation: &'static str,
    ) -> Result<(), ExchangeError> {
        if self.role == role && self.state == state {
            Ok(())
        } else {
            Err(ExchangeError::InvalidState { state: self.state, operation })
        }
    }

    fn expect_inbound(&self, message: CredentialMessage) -> Result<(), ExchangeError> {
        plan(self.role, Some(self.state), message, true).map(|_| ())
    }

    // A stored reply only ever answers the latest inbound message
    fn record_inbound(&mut self, message: CredentialMessage) {
        self.last_inbound = Some(message);
        self.last_reply = None;
    }

    fn completed(&self) -> ExchangeAction {
        ExchangeAction::Completed { exchange_id: self.id, credential_id: self.credential_id.clone() }
    }
}
