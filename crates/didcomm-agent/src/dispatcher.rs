//! Routes decoded envelopes to handlers.
//!
//! ```text
//! Envelope ─> MessageKind ─> HandlerKey ─> Handler ─> registry transition ─> Option<Envelope>
//!                                 │
//!                                 │ not registered
//!                                 ↓
//!     no handler for the protocol: UnsupportedProtocol
//!     otherwise:                   UnsupportedMessageKind
//! ```

use std::sync::Arc;

use didcomm_core::Environment;
use didcomm_proto::{Envelope, MessageKind};
use tracing::{Instrument, debug_span, trace};

use crate::{
    context::AgentContext,
    error::DispatchError,
    handler::{HandlerKey, HandlerSet},
};

/// Envelope router
pub struct Dispatcher<E: Environment> {
    ctx: Arc<AgentContext<E>>,
    handlers: Arc<HandlerSet<E>>,
}

impl<E: Environment> Dispatcher<E> {
    /// Dispatcher over `ctx` using `handlers`
    pub fn new(ctx: Arc<AgentContext<E>>, handlers: Arc<HandlerSet<E>>) -> Self {
        Self { ctx, handlers }
    }

    /// Shared agent state
    pub fn context(&self) -> &Arc<AgentContext<E>> {
        &self.ctx
    }

    /// Registered handlers
    pub fn handlers(&self) -> &Arc<HandlerSet<E>> {
        &self.handlers
    }

    /// Route one envelope.
    ///
    /// Returns the reply for the envelope's sender, if the handler produced
    /// one. A failed transition leaves the target record unchanged.
    pub async fn route(&self, envelope: &Envelope) -> Result<Option<Envelope>, DispatchError> {
        let kind = envelope.kind();
        let key = HandlerKey::for_kind(&kind);
        let handler = self.handlers.get(&key).ok_or_else(|| self.unsupported(&key, &kind))?;

        let span = debug_span!(
            "route",
            agent = %self.ctx.id,
            from = %envelope.sender,
            thread = %envelope.thread_id,
            %kind
        );
        async move {
            trace!("dispatching");
            handler.handle(&self.ctx, envelope).await
        }
        .instrument(span)
        .await
    }

    fn unsupported(&self, key: &HandlerKey, kind: &MessageKind) -> DispatchError {
        if self.handlers.serves_protocol(&key.protocol) {
            DispatchError::UnsupportedMessageKind { kind: kind.to_string() }
        } else {
            DispatchError::UnsupportedProtocol { protocol: key.protocol.clone() }
        }
    }
}
