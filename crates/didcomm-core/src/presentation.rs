//! Proof presentation state machine.
//!
//! A verifier asks a connected prover to present a credential of some schema
//! carrying named attributes. The prover answers with a credential from its
//! wallet, the verifier checks it and acknowledges.
//!
//! ```text
//! ┌───────────┐ presentation ┌───────────┐ ack ┌──────────────┐
//! │ Requested │─────────────>│ Presented │────>│ Acknowledged │
//! └───────────┘              └───────────┘     └──────────────┘
//!   problem_report / timeout / local abandon from any non-terminal state
//!                              ↓
//!                        ┌───────────┐
//!                        │ Abandoned │
//!                        └───────────┘
//! ```
//!
//! The verifier passes through `Presented` inside a single transition: the
//! presentation is checked, the ack goes out and the record ends in
//! `Acknowledged`. Proof checking itself belongs to the wallet; this module
//! only checks that the presented credential answers the request.

use std::{collections::BTreeSet, time::Duration};

use didcomm_proto::{
    ConnectionId, ExchangeId, ProofMessage, ThreadId,
    payloads::{Ack, Attributes, Credential, Presentation, PresentationRequest, ProblemReport},
};
use serde::{Deserialize, Serialize};

use crate::{env::Timestamp, error::PresentationError, expiry::ExpiryPolicy, reply::StoredReply};

/// Presentation exchange state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PresentationState {
    /// Verifier asked for a presentation
    Requested,
    /// Prover presented a credential
    Presented,
    /// Verifier accepted the presentation
    Acknowledged,
    /// Gave up
    Abandoned,
}

impl PresentationState {
    /// No further transitions possible
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Acknowledged | Self::Abandoned)
    }

    /// Position along the forward path, `None` for `Abandoned`
    pub fn rank(self) -> Option<u8> {
        match self {
            Self::Requested => Some(0),
            Self::Presented => Some(1),
            Self::Acknowledged => Some(2),
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

/// Local side of the presentation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PresentationRole {
    /// Asks for and checks the presentation
    Verifier,
    /// Presents a held credential
    Prover,
}

/// What the runtime must do for an inbound proof message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofStep {
    /// Retransmission of the message that produced the current state
    Duplicate,
    /// Prover: pick a credential from the wallet and present it
    SendPresentation,
    /// Prover: park the request until a local decision
    HoldRequest,
    /// Verifier: check the presented credential, then acknowledge
    VerifyPresentation,
    /// Prover: verifier acknowledged, presentation done
    Complete,
    /// Peer sent a problem report
    Abandon,
}

/// Exhaustive transition table.
///
/// `state` is `None` when no record exists for the thread yet; only a
/// prover receiving `request-presentation` may create one.
///
/// # Errors
/// Returns `InvalidTransition` for every combination outside the table
pub fn plan(
    role: PresentationRole,
    state: Option<PresentationState>,
    message: ProofMessage,
    auto_respond: bool,
) -> Result<ProofStep, PresentationError> {
    use PresentationRole as R;
    use PresentationState as S;
    use ProofMessage as M;

    match (role, state, message) {
        (R::Prover, None, M::Request) => {
            Ok(if auto_respond { ProofStep::SendPresentation } else { ProofStep::HoldRequest })
        },
        (R::Verifier, Some(S::Requested), M::Presentation) => Ok(ProofStep::VerifyPresentation),
        (R::Prover, Some(S::Presented), M::Ack) => Ok(ProofStep::Complete),

        (_, Some(current), M::ProblemReport) if !current.is_terminal() => Ok(ProofStep::Abandon),

        (_, _, M::Request | M::Presentation | M::Ack | M::ProblemReport) => {
            Err(PresentationError::InvalidTransition { state, role, message })
        },
    }
}

/// Actions returned by the presentation state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresentationAction {
    /// Send this reply to the peer on the presentation's thread
    Send(StoredReply),

    /// Presentation reached `Acknowledged`
    Completed {
        /// Local record
        exchange_id: ExchangeId,
        /// Attribute values the verifier saw
        revealed: Attributes,
    },

    /// Presentation moved to `Abandoned`
    Abandoned {
        /// Why the presentation was given up
        reason: String,
    },
}

/// Presentation exchange record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationExchange {
    id: ExchangeId,
    connection_id: ConnectionId,
    role: PresentationRole,
    state: PresentationState,
    thread_id: ThreadId,
    schema_id: String,
    requested_attributes: BTreeSet<String>,
    revealed: Attributes,
    credential_id: Option<String>,
    last_inbound: Option<ProofMessage>,
    last_reply: Option<StoredReply>,
    abandon_reason: Option<String>,
    created_at: Timestamp,
    updated_at: Timestamp,
}

impl PresentationExchange {
    fn new(
        id: ExchangeId,
        connection_id: ConnectionId,
        role: PresentationRole,
        thread_id: ThreadId,
        request: &PresentationRequest,
        now: Timestamp,
    ) -> Self {
        Self {
            id,
            connection_id,
            role,
            state: PresentationState::Requested,
            thread_id,
            schema_id: request.schema_id.clone(),
            requested_attributes: request.requested_attributes.clone(),
            revealed: Attributes::new(),
            credential_id: None,
            last_inbound: None,
            last_reply: None,
            abandon_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Verifier starts a presentation by sending a request
    ///
    /// # Errors
    /// Returns `Protocol` if the request cannot be serialized
    pub fn request(
        id: ExchangeId,
        connection_id: ConnectionId,
        thread_id: ThreadId,
        request: &PresentationRequest,
        now: Timestamp,
    ) -> Result<(Self, Vec<PresentationAction>), PresentationError> {
        let reply = StoredReply::proof(ProofMessage::Request, request)?;
        let mut record =
            Self::new(id, connection_id, PresentationRole::Verifier, thread_id, request, now);
        record.last_reply = Some(reply.clone());
        Ok((record, vec![PresentationAction::Send(reply)]))
    }

    /// Prover-side record for a received request, in `Requested`
    pub fn from_request(
        id: ExchangeId,
        connection_id: ConnectionId,
        thread_id: ThreadId,
        request: &PresentationRequest,
        now: Timestamp,
    ) -> Self {
        let mut record =
            Self::new(id, connection_id, PresentationRole::Prover, thread_id, request, now);
        record.last_inbound = Some(ProofMessage::Request);
        record
    }

    /// Record id
    pub fn id(&self) -> ExchangeId {
        self.id
    }

    /// Connection the presentation runs over
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Local role
    pub fn role(&self) -> PresentationRole {
        self.role
    }

    /// Current state
    pub fn state(&self) -> PresentationState {
        self.state
    }

    /// Thread identifying this presentation
    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    /// Schema the presented credential must follow
    pub fn schema_id(&self) -> &str {
        &self.schema_id
    }

    /// Attribute names the verifier asked for
    pub fn requested_attributes(&self) -> &BTreeSet<String> {
        &self.requested_attributes
    }

    /// Requested attribute values taken from the presented credential
    pub fn revealed(&self) -> &Attributes {
        &self.revealed
    }

    /// Issuer-assigned id of the presented credential
    pub fn credential_id(&self) -> Option<&str> {
        self.credential_id.as_deref()
    }

    /// Reason recorded when the presentation was abandoned
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
    pub fn plan(
        &self,
        message: ProofMessage,
        auto_respond: bool,
    ) -> Result<ProofStep, PresentationError> {
        if self.last_inbound == Some(message) {
            return Ok(ProofStep::Duplicate);
        }
        plan(self.role, Some(self.state), message, auto_respond)
    }

    /// Actions that answer a retransmitted message
    pub fn duplicate_actions(&self) -> Vec<PresentationAction> {
        self.last_reply.iter().cloned().map(PresentationAction::Send).collect()
    }

    /// Move forward to `next`
    ///
    /// # Errors
    /// Returns `Regression` if `next` is not ahead of the current state
    pub fn advance(
        &mut self,
        next: PresentationState,
        now: Timestamp,
    ) -> Result<(), PresentationError> {
        if !self.state.can_advance_to(next) {
            return Err(PresentationError::Regression { from: self.state, to: next });
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }

    /// Prover: present `credential`, chosen by the wallet
    ///
    /// # Errors
    /// Returns `InvalidState` unless this is a prover in `Requested`, and
    /// `SchemaMismatch` or `MissingAttribute` if the credential does not
    /// answer the request
    pub fn present(
        &mut self,
        credential: &Credential,
        now: Timestamp,
    ) -> Result<Vec<PresentationAction>, PresentationError> {
        if self.role != PresentationRole::Prover || self.state != PresentationState::Requested {
            return Err(PresentationError::InvalidState { state: self.state, operation: "present" });
        }

        let revealed = self.reveal(credential)?;
        let reply = StoredReply::proof(
            ProofMessage::Presentation,
            &Presentation { credential: credential.clone() },
        )?;
        self.advance(PresentationState::Presented, now)?;
        self.revealed = revealed;
        self.credential_id = Some(credential.id.clone());
        self.last_reply = Some(reply.clone());

        Ok(vec![PresentationAction::Send(reply)])
    }

    /// Verifier: the prover presented `credential`, whose proof the wallet
    /// already checked. Acknowledges and completes in one step.
    ///
    /// # Errors
    /// Returns `InvalidTransition` unless this is a verifier in `Requested`,
    /// and `SchemaMismatch` or `MissingAttribute` if the credential does not
    /// answer the request
    pub fn receive_presentation(
        &mut self,
        credential: &Credential,
        now: Timestamp,
    ) -> Result<Vec<PresentationAction>, PresentationError> {
        self.expect_inbound(ProofMessage::Presentation)?;

        let revealed = self.reveal(credential)?;
        let ack = StoredReply::proof(ProofMessage::Ack, &Ack::default())?;
        let mut next = self.clone();
        next.advance(PresentationState::Presented, now)?;
        next.revealed = revealed;
        next.credential_id = Some(credential.id.clone());
        next.record_inbound(ProofMessage::Presentation);
        next.advance(PresentationState::Acknowledged, now)?;
        next.last_reply = Some(ack.clone());
        *self = next;

        Ok(vec![PresentationAction::Send(ack), self.completed()])
    }

    /// Prover: the verifier accepted the presentation
    ///
    /// # Errors
    /// Returns `InvalidTransition` unless this is a prover in `Presented`
    pub fn receive_ack(
        &mut self,
        now: Timestamp,
    ) -> Result<Vec<PresentationAction>, PresentationError> {
        self.expect_inbound(ProofMessage::Ack)?;

        self.advance(PresentationState::Acknowledged, now)?;
        self.record_inbound(ProofMessage::Ack);

        Ok(vec![self.completed()])
    }

    /// Peer gave up on the presentation
    ///
    /// # Errors
    /// Returns `InvalidTransition` if the presentation is already terminal
    pub fn receive_problem_report(
        &mut self,
        report: &ProblemReport,
        now: Timestamp,
    ) -> Result<Vec<PresentationAction>, PresentationError> {
        self.expect_inbound(ProofMessage::ProblemReport)?;

        let reason = match &report.explain {
            Some(explain) => format!("{}: {explain}", report.code),
            None => report.code.clone(),
        };
        self.advance(PresentationState::Abandoned, now)?;
        self.record_inbound(ProofMessage::ProblemReport);
        self.abandon_reason = Some(reason.clone());

        Ok(vec![PresentationAction::Abandoned { reason }])
    }

    /// Give up locally and send a problem report to the peer
    ///
    /// # Errors
    /// Returns `InvalidState` if the presentation is already terminal
    pub fn abandon(
        &mut self,
        reason: &str,
        now: Timestamp,
    ) -> Result<Vec<PresentationAction>, PresentationError> {
        if self.state.is_terminal() {
            return Err(PresentationError::InvalidState { state: self.state, operation: "abandon" });
        }

        let report = StoredReply::problem_report(
            ProofMessage::ProblemReport.message_type(),
            "abandoned",
            reason,
        );
        self.advance(PresentationState::Abandoned, now)?;
        self.abandon_reason = Some(reason.to_string());
        self.last_reply = Some(report.clone());

        Ok(vec![PresentationAction::Send(report), PresentationAction::Abandoned {
            reason: reason.to_string(),
        }])
    }

    /// `Some(elapsed)` if the presentation stalled past the policy's limit
    #[must_use]
    pub fn check_expiry(&self, policy: &ExpiryPolicy, now: Timestamp) -> Option<Duration> {
        if self.state.is_terminal() {
            return None;
        }
        policy.exchange_expired(self.updated_at, now)
    }

    /// Abandon the presentation if it expired
    pub fn tick(&mut self, policy: &ExpiryPolicy, now: Timestamp) -> Vec<PresentationAction> {
        let Some(elapsed) = self.check_expiry(policy, now) else {
            return Vec::new();
        };

        let reason = format!("no progress in {:?} for {elapsed:?}", self.state);
        self.abandon(&reason, now).unwrap_or_default()
    }

    /// Requested values out of `credential`
    fn reveal(&self, credential: &Credential) -> Result<Attributes, PresentationError> {
        if credential.schema_id != self.schema_id {
            return Err(PresentationError::SchemaMismatch {
                expected: self.schema_id.clone(),
                actual: credential.schema_id.clone(),
            });
        }
        self.requested_attributes
            .iter()
            .map(|name| match credential.attributes.get(name) {
                Some(value) => Ok((name.clone(), value.clone())),
                None => Err(PresentationError::MissingAttribute {
                    schema_id: self.schema_id.clone(),
                    attribute: name.clone(),
                }),
            })
            .collect()
    }

    fn expect_inbound(&self, message: ProofMessage) -> Result<(), PresentationError> {
        plan(self.role, Some(self.state), message, true).map(|_| ())
    }

    // A stored reply only ever answers the latest inbound message
    fn record_inbound(&mut self, message: ProofMessage) {
        self.last_inbound = Some(message);
        self.last_reply = None;
    }

    fn completed(&self) -> PresentationAction {
        PresentationAction::Completed { exchange_id: self.id, revealed: self.revealed.clone() }
    }
}

#[cfg(test)]
mod tests {
    use didcomm_proto::Did;
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn t(millis: u64) -> Timestamp {
        Timestamp::from_millis(millis)
    }

    fn request() -> PresentationRequest {
        PresentationRequest {
            schema_id: "schema:degree:1.0".into(),
            requested_attributes: ["name".to_string()].into(),
            comment: None,
        }
    }

    fn credential(schema_id: &str) -> Credential {
        let did: Did = "did:peer:issuer".parse().unwrap();
        Credential {
            id: "cred-1".into(),
            schema_id: schema_id.into(),
            issuer: did.clone(),
            subject: did,
            attributes: [
                ("name".to_string(), "Alice".to_string()),
                ("degree".to_string(), "BSc".to_string()),
            ]
            .into_iter()
            .collect(),
            proof: json!({}),
        }
    }

    fn verifier() -> PresentationExchange {
        PresentationExchange::request(
            ExchangeId::generate(),
            ConnectionId::generate(),
            ThreadId::new("p1"),
            &request(),
            t(0),
        )
        .unwrap()
        .0
    }

    fn prover() -> PresentationExchange {
        PresentationExchange::from_request(
            ExchangeId::generate(),
            ConnectionId::generate(),
            ThreadId::new("p1"),
            &request(),
            t(0),
        )
    }

    #[test]
    fn verifier_acknowledges_a_matching_presentation() {
        let mut record = verifier();
        assert_eq!(
            record.plan(ProofMessage::Presentation, true).unwrap(),
            ProofStep::VerifyPresentation
        );

        let actions = record.receive_presentation(&credential("schema:degree:1.0"), t(1)).unwrap();
        assert_eq!(record.state(), PresentationState::Acknowledged);
        assert_eq!(record.credential_id(), Some("cred-1"));
        // Only requested attributes are revealed
        assert_eq!(record.revealed().keys().collect::<Vec<_>>(), ["name"]);
        assert!(matches!(&actions[0], PresentationAction::Send(reply)
            if reply.message_type.name() == "ack"));
        assert!(matches!(&actions[1], PresentationAction::Completed { .. }));
    }

    #[test]
    fn prover_presents_then_completes_on_ack() {
        let mut record = prover();
        assert_eq!(record.plan(ProofMessage::Request, true).unwrap(), ProofStep::Duplicate);
        assert_eq!(plan(PresentationRole::Prover, None, ProofMessage::Request, false).unwrap(), ProofStep::HoldRequest);

        let actions = record.present(&credential("schema:degree:1.0"), t(1)).unwrap();
        assert_eq!(record.state(), PresentationState::Presented);
        assert!(matches!(&actions[..], [PresentationAction::Send(reply)]
            if reply.message_type.name() == "presentation"));

        assert_eq!(record.plan(ProofMessage::Ack, true).unwrap(), ProofStep::Complete);
        record.receive_ack(t(2)).unwrap();
        assert_eq!(record.state(), PresentationState::Acknowledged);
        assert_eq!(record.plan(ProofMessage::Ack, true).unwrap(), ProofStep::Duplicate);
    }

    #[test]
    fn non_matching_credential_leaves_record_unchanged() {
        let mut record = verifier();
        let before = record.clone();

        assert!(matches!(
            record.receive_presentation(&credential("schema:license:1.0"), t(1)),
            Err(PresentationError::SchemaMismatch { .. })
        ));

        let mut partial = credential("schema:degree:1.0");
        partial.attributes.remove("name");
        assert!(matches!(
            record.receive_presentation(&partial, t(1)),
            Err(PresentationError::MissingAttribute { attribute, .. }) if attribute == "name"
        ));
        assert_eq!(record, before);
    }

    #[test]
    fn duplicate_presentation_replays_ack() {
        let mut record = verifier();
        record.receive_presentation(&credential("schema:degree:1.0"), t(1)).unwrap();
        let before = record.clone();

        assert_eq!(record.plan(ProofMessage::Presentation, true).unwrap(), ProofStep::Duplicate);
        assert!(matches!(&record.duplicate_actions()[..], [PresentationAction::Send(reply)]
            if reply.message_type.name() == "ack"));
        assert_eq!(record, before);
    }

    #[test]
    fn only_a_prover_request_creates_records() {
        for message in [ProofMessage::Presentation, ProofMessage::Ack, ProofMessage::ProblemReport] {
            assert!(plan(PresentationRole::Prover, None, message, true).is_err());
            assert!(plan(PresentationRole::Verifier, None, message, true).is_err());
        }
        assert!(plan(PresentationRole::Verifier, None, ProofMessage::Request, true).is_err());
    }

    #[test]
    fn problem_report_and_expiry_abandon() {
        let mut record = prover();
        let report = ProblemReport { code: "declined".into(), explain: Some("no".into()) };
        record.receive_problem_report(&report, t(1)).unwrap();
        assert_eq!(record.state(), PresentationState::Abandoned);
        assert_eq!(record.abandon_reason(), Some("declined: no"));
        assert!(record.abandon("again", t(2)).is_err());

        let mut record = verifier();
        let policy =
            ExpiryPolicy { exchange_timeout: Some(Duration::from_secs(1)), ..ExpiryPolicy::disabled() };
        assert!(record.tick(&policy, t(1_000)).is_empty());
        let actions = record.tick(&policy, t(1_001));
        assert_eq!(record.state(), PresentationState::Abandoned);
        assert!(matches!(&actions[0], PresentationAction::Send(reply)
            if reply.message_type.name() == "problem-report"));
    }

    fn any_message() -> impl Strategy<Value = ProofMessage> {
        prop_oneof![
            Just(ProofMessage::Request),
            Just(ProofMessage::Presentation),
            Just(ProofMessage::Ack),
            Just(ProofMessage::ProblemReport),
        ]
    }

    fn deliver(record: &mut PresentationExchange, message: ProofMessage, now: Timestamp) {
        let Ok(step) = record.plan(message, true) else {
            return;
        };
        let credential = credential("schema:degree:1.0");
        let result = match step {
            ProofStep::Duplicate | ProofStep::HoldRequest => Ok(vec![]),
            ProofStep::SendPresentation => record.present(&credential, now),
            ProofStep::VerifyPresentation => record.receive_presentation(&credential, now),
            ProofStep::Complete => record.receive_ack(now),
            ProofStep::Abandon => record
                .receive_problem_report(&ProblemReport { code: "x".into(), explain: None }, now),
        };
        assert!(result.is_ok(), "planned step {step:?} failed: {result:?}");
    }

    proptest! {
        #[test]
        fn states_never_regress(
            as_verifier in any::<bool>(),
            messages in prop::collection::vec(any_message(), 0..16),
        ) {
            let mut record = if as_verifier { verifier() } else { prover() };
            for (i, message) in messages.into_iter().enumerate() {
                let before = record.clone();
                deliver(&mut record, message, t(i as u64 + 1));
                prop_assert!(
                    record.state() == before.state() || before.state().can_advance_to(record.state())
                );
                if record.state() == PresentationState::Acknowledged && as_verifier {
                    prop_assert!(record.credential_id().is_some());
                }
            }
        }
    }
}
