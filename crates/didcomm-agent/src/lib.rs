//! DIDComm agent runtime.
//!
//! Wraps the pure state machines of `didcomm-core` with everything that does
//! I/O: a transport, a wallet, a schema registry, durable storage and the
//! worker pool that routes inbound envelopes.
//!
//! # Architecture
//!
//! An [`Agent`] owns a [`Dispatcher`], which owns the shared
//! [`AgentContext`] and a runtime-mutable [`HandlerSet`]. There is no global
//! state; every handler receives the context explicitly.
//!
//! Records live in registries ([`registry`]). Each record has its own async
//! lock, and every mutation (inbound message, local API call, expiry sweep)
//! follows the same commit protocol: transition a copy, persist it, then
//! replace the original.
//!
//! # Components
//!
//! - [`agent`]: Builder, local API, run loop and expiry sweeper
//! - [`dispatcher`]: Routes envelopes to handlers
//! - [`handler`], [`handlers`]: Handler trait, handler set and built-in protocol handlers
//! - [`registry`]: Connection, exchange and presentation registries
//! - [`transport`], [`stdio`]: Transport trait, in-process and line-delimited JSON transports
//! - [`wallet`], [`schema`], [`routing`]: Collaborator traits and in-memory implementations
//! - [`storage`]: redb-backed record storage
//! - [`shutdown`]: Cancellable run context

pub mod agent;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod handlers;
pub mod registry;
pub mod routing;
pub mod schema;
pub mod shutdown;
pub mod stdio;
pub mod storage;
pub mod transport;
pub mod wallet;

pub use agent::{Agent, AgentBuilder, CreatedInvitation};
pub use config::AgentConfig;
pub use context::AgentContext;
pub use dispatcher::Dispatcher;
pub use error::{AgentError, DispatchError, RouteError, SchemaError, TransportError, WalletError};
pub use handler::{Handler, HandlerKey, HandlerSet};
pub use routing::RouteRegistrar;
pub use schema::{MemorySchemaRegistry, Schema, SchemaRegistry};
pub use shutdown::{ShutdownHandle, ShutdownSignal, shutdown_channel};
pub use stdio::StdioTransport;
pub use storage::RedbStorage;
pub use transport::{ChannelNetwork, ChannelTransport, Transport};
pub use wallet::{MemoryWallet, Wallet};
