//! Issue-credential protocol handler.
//!
//! An existing exchange is found by thread id. Only `propose` (issuer side)
//! and `offer` (holder side) may open a new exchange, and only over a
//! completed connection with the sender.
//!
//! Collaborator work (schema validation, signing, issuing, verifying,
//! storing) happens between planning and committing, while the record's lock
//! is held. If any of it fails, nothing is committed.

use async_trait::async_trait;
use didcomm_core::{
    ConnectionRecord, CredentialExchange, Environment, ExchangeRole, Step, exchange,
};
use didcomm_proto::{
    CredentialMessage, Envelope, MessageKind,
    payloads::{
        Attributes, CredentialIssue, CredentialOffer, CredentialProposal, CredentialRequest,
        ProblemReport,
    },
};
use tracing::{debug, info};

use crate::{
    context::AgentContext,
    error::{DispatchError, SchemaError},
    handler::Handler,
};

/// Drives credential exchange records from inbound credential messages
pub struct CredentialHandler;

#[async_trait]
impl<E: Environment> Handler<E> for CredentialHandler {
    async fn handle(
        &self,
        ctx: &AgentContext<E>,
        envelope: &Envelope,
    ) -> Result<Option<Envelope>, DispatchError> {
        let MessageKind::Credential(message) = envelope.kind() else {
            return Err(DispatchError::UnsupportedMessageKind { kind: envelope.kind().to_string() });
        };
        let auto = ctx.config.auto_respond_credentials;

        let Some(handle) = ctx.exchanges.by_thread(&envelope.thread_id) else {
            let connection = ctx.completed_connection(&envelope.sender).await?;
            let role = match message {
                CredentialMessage::Propose => ExchangeRole::Issuer,
                CredentialMessage::Offer => ExchangeRole::Holder,
                _ => {
                    return Err(DispatchError::UnknownRecord(format!(
                        "exchange thread {}",
                        envelope.thread_id
                    )));
                },
            };
            let step = exchange::plan(role, None, message, auto)?;
            return start(ctx, &connection, step, envelope).await;
        };

        let mut record = handle.lock().await;
        let connection = ctx.connection_of(record.connection_id()).await?;
        if connection.peer_agent() != Some(&envelope.sender) {
            return Err(DispatchError::UnknownRecord(format!(
                "exchange thread {} with {}",
                envelope.thread_id, envelope.sender
            )));
        }

        let step = record.plan(message, auto)?;
        if step == Step::Duplicate {
            debug!(exchange_id = %record.id(), kind = message.name(), "duplicate credential message");
            return Ok(ctx.execute_exchange(&record, record.duplicate_actions()));
        }

        let now = ctx.env.now();
        let mut next = record.clone();
        let actions = match step {
            Step::SendRequest => {
                let offer: CredentialOffer = envelope.payload()?;
                validate(ctx, &offer.schema_id, &offer.attributes).await?;
                let mut actions = next.receive_offer(&offer, now)?;
                actions.extend(next.send_request(&holder_request(&connection)?, now)?);
                actions
            },
            Step::HoldOffer => {
                let offer: CredentialOffer = envelope.payload()?;
                validate(ctx, &offer.schema_id, &offer.attributes).await?;
                next.receive_offer(&offer, now)?
            },
            Step::IssueCredential => {
                let request: CredentialRequest = envelope.payload()?;
                let issuer = connection.my_did().ok_or(DispatchError::ConnectionNotReady {
                    state: connection.state(),
                })?;
                let credential = ctx
                    .wallet
                    .issue_credential(
                        next.id(),
                        issuer,
                        &request.holder_did,
                        next.schema_id(),
                        next.attributes(),
                    )
                    .await?;
                next.issue(&credential, now)?
            },
            Step::StoreCredential => {
                let issue: CredentialIssue = envelope.payload()?;
                let credential = issue.credential;
                if credential.schema_id != next.schema_id() {
                    return Err(SchemaError::Mismatch {
                        expected: next.schema_id().to_string(),
                        actual: credential.schema_id,
                    }
                    .into());
                }
                ctx.wallet.verify(&credential).await?;
                let credential_id = ctx.wallet.store_credential(&credential).await?;
                next.receive_issue(&credential_id, now)?
            },
            Step::Complete => next.receive_ack(now)?,
            Step::Abandon => {
                let report: ProblemReport = envelope.payload()?;
                next.receive_problem_report(&report, now)?
            },
            Step::SendOffer | Step::HoldProposal | Step::Duplicate => {
                return Err(DispatchError::InvalidTransition(format!(
                    "{step:?} on existing exchange {}",
                    record.id()
                )));
            },
        };

        ctx.exchanges.commit(&mut record, next)?;
        info!(
            exchange_id = %record.id(),
            state = ?record.state(),
            peer = %envelope.sender,
            "credential {}",
            message.name()
        );

        Ok(ctx.execute_exchange(&record, actions))
    }
}

/// Open a new exchange from an inbound proposal or offer
async fn start<E: Environment>(
    ctx: &AgentContext<E>,
    connection: &ConnectionRecord,
    step: Step,
    envelope: &Envelope,
) -> Result<Option<Envelope>, DispatchError> {
    let now = ctx.env.now();
    let id = ctx.env.exchange_id();
    let thread_id = envelope.thread_id.clone();

    let (record, actions) = match step {
        Step::SendOffer | Step::HoldProposal => {
            let proposal: CredentialProposal = envelope.payload()?;
            validate(ctx, &proposal.schema_id, &proposal.attributes).await?;
            let mut record =
                CredentialExchange::from_proposal(id, connection.id(), thread_id, &proposal, now);
            let actions = if step == Step::SendOffer {
                let offer = build_offer(ctx, &proposal.schema_id, &proposal.attributes).await?;
                record.send_offer(&offer, now)?
            } else {
                Vec::new()
            };
            (record, actions)
        },
        Step::SendRequest | Step::HoldOffer => {
            let offer: CredentialOffer = envelope.payload()?;
            validate(ctx, &offer.schema_id, &offer.attributes).await?;
            let mut record =
                CredentialExchange::from_offer(id, connection.id(), thread_id, &offer, now);
            let actions = if step == Step::SendRequest {
                record.send_request(&holder_request(connection)?, now)?
            } else {
                Vec::new()
            };
            (record, actions)
        },
        other => {
            return Err(DispatchError::InvalidTransition(format!(
                "{other:?} without an exchange on thread {}",
                envelope.thread_id
            )));
        },
    };

    info!(
        exchange_id = %record.id(),
        connection_id = %connection.id(),
        state = ?record.state(),
        schema_id = record.schema_id(),
        "exchange opened"
    );
    let handle = ctx.exchanges.insert(record)?;
    let record = handle.lock().await;
    Ok(ctx.execute_exchange(&record, actions))
}

/// Attribute values must match the schema exactly
pub(crate) async fn validate<E: Environment>(
    ctx: &AgentContext<E>,
    schema_id: &str,
    attributes: &Attributes,
) -> Result<(), DispatchError> {
    let schema = ctx.schemas.resolve_schema(schema_id).await?;
    schema.validate(attributes)?;
    Ok(())
}

/// Offer signed by the wallet
pub(crate) async fn build_offer<E: Environment>(
    ctx: &AgentContext<E>,
    schema_id: &str,
    attributes: &Attributes,
) -> Result<CredentialOffer, DispatchError> {
    let offer = ctx.wallet.sign_offer(schema_id, attributes).await?;
    Ok(CredentialOffer { schema_id: schema_id.to_string(), attributes: attributes.clone(), offer })
}

/// Request binding the credential to our DID on the connection
pub(crate) fn holder_request(
    connection: &ConnectionRecord,
) -> Result<CredentialRequest, DispatchError> {
    let holder_did = connection
        .my_did()
        .cloned()
        .ok_or(DispatchError::ConnectionNotReady { state: connection.state() })?;
    Ok(CredentialRequest { holder_did })
}
