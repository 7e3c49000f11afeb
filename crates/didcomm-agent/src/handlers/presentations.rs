//! Present-proof protocol handler.
//!
//! Only `request-presentation` may open a presentation, on the prover side,
//! over a completed connection with the sender. The verifier's record is
//! opened locally through [`crate::Agent::request_proof`].
//!
//! A prover whose wallet holds no matching credential abandons the request
//! and answers with a problem report instead of failing the envelope.

use async_trait::async_trait;
use didcomm_core::{
    ConnectionRecord, Environment, PresentationExchange, PresentationRole, ProofStep, presentation,
};
use didcomm_proto::{
    Envelope, MessageKind, ProofMessage,
    payloads::{Presentation, PresentationRequest, ProblemReport},
};
use tracing::{debug, info};

use crate::{
    context::AgentContext,
    error::{DispatchError, WalletError},
    handler::Handler,
};

/// Drives presentation records from inbound proof messages
pub struct PresentationHandler;

#[async_trait]
impl<E: Environment> Handler<E> for PresentationHandler {
    async fn handle(
        &self,
        ctx: &AgentContext<E>,
        envelope: &Envelope,
    ) -> Result<Option<Envelope>, DispatchError> {
        let MessageKind::Proof(message) = envelope.kind() else {
            return Err(DispatchError::UnsupportedMessageKind { kind: envelope.kind().to_string() });
        };
        let auto = ctx.config.auto_present_proofs;

        let Some(handle) = ctx.presentations.by_thread(&envelope.thread_id) else {
            let connection = ctx.completed_connection(&envelope.sender).await?;
            if message != ProofMessage::Request {
                return Err(DispatchError::UnknownRecord(format!(
                    "presentation thread {}",
                    envelope.thread_id
                )));
            }
            let step = presentation::plan(PresentationRole::Prover, None, message, auto)?;
            return start(ctx, &connection, step, envelope).await;
        };

        let mut record = handle.lock().await;
        let connection = ctx.connection_of(record.connection_id()).await?;
        if connection.peer_agent() != Some(&envelope.sender) {
            return Err(DispatchError::UnknownRecord(format!(
                "presentation thread {} with {}",
                envelope.thread_id, envelope.sender
            )));
        }

        let step = record.plan(message, auto)?;
        if step == ProofStep::Duplicate {
            debug!(exchange_id = %record.id(), kind = message.name(), "duplicate proof message");
            return Ok(ctx.execute_presentation(&record, record.duplicate_actions()));
        }

        let now = ctx.env.now();
        let mut next = record.clone();
        let actions = match step {
            ProofStep::VerifyPresentation => {
                let presentation: Presentation = envelope.payload()?;
                ctx.wallet.verify(&presentation.credential).await?;
                next.receive_presentation(&presentation.credential, now)?
            },
            ProofStep::Complete => next.receive_ack(now)?,
            ProofStep::Abandon => {
                let report: ProblemReport = envelope.payload()?;
                next.receive_problem_report(&report, now)?
            },
            ProofStep::SendPresentation | ProofStep::HoldRequest | ProofStep::Duplicate => {
                return Err(DispatchError::InvalidTransition(format!(
                    "{step:?} on existing presentation {}",
                    record.id()
                )));
            },
        };

        ctx.presentations.commit(&mut record, next)?;
        info!(
            exchange_id = %record.id(),
            state = ?record.state(),
            peer = %envelope.sender,
            "proof {}",
            message.name()
        );

        Ok(ctx.execute_presentation(&record, actions))
    }
}

/// Open a prover record from an inbound request
async fn start<E: Environment>(
    ctx: &AgentContext<E>,
    connection: &ConnectionRecord,
    step: ProofStep,
    envelope: &Envelope,
) -> Result<Option<Envelope>, DispatchError> {
    let now = ctx.env.now();
    let request: PresentationRequest = envelope.payload()?;
    let mut record = PresentationExchange::from_request(
        ctx.env.exchange_id(),
        connection.id(),
        envelope.thread_id.clone(),
        &request,
        now,
    );

    let actions = match step {
        ProofStep::SendPresentation => {
            match ctx.wallet.present(&request.schema_id, &request.requested_attributes).await {
                Ok(credential) => record.present(&credential, now)?,
                Err(WalletError::NoMatchingCredential(schema_id)) => {
                    record.abandon(&format!("no matching credential for {schema_id}"), now)?
                },
                Err(e) => return Err(e.into()),
            }
        },
        ProofStep::HoldRequest => Vec::new(),
        other => {
            return Err(DispatchError::InvalidTransition(format!(
                "{other:?} without a presentation on thread {}",
                envelope.thread_id
            )));
        },
    };

    info!(
        exchange_id = %record.id(),
        connection_id = %connection.id(),
        state = ?record.state(),
        schema_id = record.schema_id(),
        "presentation opened"
    );
    let handle = ctx.presentations.insert(record)?;
    let record = handle.lock().await;
    Ok(ctx.execute_presentation(&record, actions))
}
