//! Handler set: which code answers which message.
//!
//! Handlers are keyed by `(protocol name, message name)`. Built-in protocols
//! use their canonical name, so aliases on the wire land on the same key. Any
//! other protocol name is served by whoever registers a handler for it. The
//! set can change while the agent runs; a lookup clones the handler out so
//! registration never waits for a message in flight.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use async_trait::async_trait;
use didcomm_core::Environment;
use didcomm_proto::{Envelope, MessageKind, Protocol, UnknownKind};
use tracing::{debug, warn};

use crate::{context::AgentContext, error::DispatchError};

/// Processes one kind of inbound message
#[async_trait]
pub trait Handler<E: Environment>: Send + Sync + 'static {
    /// Handle `envelope`, returning at most one reply for its sender
    async fn handle(
        &self,
        ctx: &AgentContext<E>,
        envelope: &Envelope,
    ) -> Result<Option<Envelope>, DispatchError>;
}

/// Handler lookup key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerKey {
    /// Protocol name, canonical for built-in protocols
    pub protocol: String,
    /// Message name
    pub name: String,
}

impl HandlerKey {
    /// Key for `name` in a built-in protocol
    pub fn new(protocol: Protocol, name: impl Into<String>) -> Self {
        Self::named(protocol.name(), name)
    }

    /// Key for `name` in any protocol, built in or not
    pub fn named(protocol: impl Into<String>, name: impl Into<String>) -> Self {
        Self { protocol: protocol.into(), name: name.into() }
    }

    /// Key for a resolved message kind.
    ///
    /// Every kind has a key, so an extension handler can claim unknown
    /// message names and whole unknown protocols alike.
    pub fn for_kind(kind: &MessageKind) -> Self {
        match kind {
            MessageKind::Unknown(UnknownKind::Message { protocol, name }) => {
                Self::new(*protocol, name.clone())
            },
            MessageKind::Unknown(UnknownKind::Protocol { protocol, name }) => {
                Self::named(protocol.clone(), name.clone())
            },
            known => match (known.protocol(), known.name()) {
                (Some(protocol), Some(name)) => Self::new(protocol, name),
                _ => Self::named("", known.to_string()),
            },
        }
    }
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.protocol, self.name)
    }
}

/// Runtime-mutable map of handlers, one per key
pub struct HandlerSet<E: Environment> {
    handlers: RwLock<HashMap<HandlerKey, Arc<dyn Handler<E>>>>,
}

impl<E: Environment> Default for HandlerSet<E> {
    fn default() -> Self {
        Self { handlers: RwLock::new(HashMap::new()) }
    }
}

impl<E: Environment> HandlerSet<E> {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Set with the built-in protocol handlers registered
    pub fn with_builtin() -> Self {
        let set = Self::new();
        crate::handlers::register_builtin(&set);
        set
    }

    /// Register `handler` for `key`.
    ///
    /// Replaces and returns any handler already registered for the key.
    pub fn register(
        &self,
        key: HandlerKey,
        handler: Arc<dyn Handler<E>>,
    ) -> Option<Arc<dyn Handler<E>>> {
        let replaced = self.write().insert(key.clone(), handler);
        if replaced.is_some() {
            warn!(%key, "handler replaced");
        } else {
            debug!(%key, "handler registered");
        }
        replaced
    }

    /// Remove the handler for `key`
    pub fn unregister(&self, key: &HandlerKey) -> Option<Arc<dyn Handler<E>>> {
        let removed = self.write().remove(key);
        if removed.is_some() {
            debug!(%key, "handler unregistered");
        }
        removed
    }

    /// Handler for `key`
    pub fn get(&self, key: &HandlerKey) -> Option<Arc<dyn Handler<E>>> {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    /// Whether a handler is registered for `key`
    pub fn contains(&self, key: &HandlerKey) -> bool {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).contains_key(key)
    }

    /// Whether any handler serves messages of `protocol`
    pub fn serves_protocol(&self, protocol: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .any(|key| key.protocol == protocol)
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// No handlers registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<HandlerKey, Arc<dyn Handler<E>>>> {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner)
    }
}
