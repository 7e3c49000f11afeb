//! DIDComm agent binary.
//!
//! Runs one agent over stdin/stdout. Input lines are
//! `{"from": "<agent>", "message": {...}}`, output lines are
//! `{"to": "<agent>", "message": {...}}`. Logs go to stderr.

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use didcomm_agent::{
    AgentBuilder, AgentConfig, MemorySchemaRegistry, RedbStorage, Schema, StdioTransport,
    shutdown_channel,
};
use didcomm_core::{ExpiryPolicy, Storage, SystemEnv};
use didcomm_proto::AgentId;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// DIDComm agent speaking line-delimited JSON on stdio
#[derive(Parser, Debug)]
#[command(name = "didcomm-agent", version, about)]
struct Args {
    /// Transport address of this agent
    #[arg(long, env = "DIDCOMM_AGENT_ID")]
    id: String,

    /// Label shown to peers (defaults to the agent id)
    #[arg(long, env = "DIDCOMM_AGENT_LABEL")]
    label: Option<String>,

    /// Base URL for invitations
    #[arg(long, env = "DIDCOMM_AGENT_ENDPOINT")]
    endpoint: Option<String>,

    /// Record database path; in-memory when omitted
    #[arg(long, env = "DIDCOMM_AGENT_DB")]
    db: Option<PathBuf>,

    /// Worker lanes
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Hold invitations and connection requests for a local decision
    #[arg(long)]
    no_auto_accept: bool,

    /// Hold credential proposals and offers for a local decision
    #[arg(long)]
    no_auto_respond: bool,

    /// Hold presentation requests for a local decision
    #[arg(long)]
    no_auto_present: bool,

    /// Abandon connections idle this long (seconds, 0 disables)
    #[arg(long, default_value_t = 600)]
    connection_timeout: u64,

    /// Abandon credential and proof exchanges idle this long (seconds, 0 disables)
    #[arg(long, default_value_t = 1800)]
    exchange_timeout: u64,

    /// Publish a schema, as `name:version=attr1,attr2`
    #[arg(long = "schema", value_parser = parse_schema)]
    schemas: Vec<Schema>,

    /// Print a fresh invitation on startup
    #[arg(long)]
    invite: bool,

    /// Log filter used when `RUST_LOG` is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_schema(flag: &str) -> Result<Schema, String> {
    let (id, attributes) =
        flag.split_once('=').ok_or_else(|| format!("expected name:version=attrs, got {flag:?}"))?;
    let (name, version) =
        id.split_once(':').ok_or_else(|| format!("expected name:version, got {id:?}"))?;
    if name.is_empty() || version.is_empty() {
        return Err(format!("empty schema name or version in {flag:?}"));
    }

    let attributes: Vec<&str> =
        attributes.split(',').map(str::trim).filter(|a| !a.is_empty()).collect();
    if attributes.is_empty() {
        return Err(format!("schema {id} has no attributes"));
    }
    Ok(Schema::new(name, version, attributes))
}

fn timeout(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let config = AgentConfig {
        label: args.label.clone().unwrap_or_else(|| args.id.clone()),
        endpoint: args.endpoint.clone(),
        workers: args.workers,
        auto_accept_connections: !args.no_auto_accept,
        auto_respond_credentials: !args.no_auto_respond,
        auto_present_proofs: !args.no_auto_present,
        expiry: ExpiryPolicy {
            connection_timeout: timeout(args.connection_timeout),
            exchange_timeout: timeout(args.exchange_timeout),
        },
        ..AgentConfig::default()
    };

    let storage: Arc<dyn Storage> = match &args.db {
        Some(path) => Arc::new(RedbStorage::open(path)?),
        None => Arc::new(RedbStorage::in_memory()?),
    };

    let schemas = Arc::new(MemorySchemaRegistry::new());
    for schema in args.schemas {
        info!(schema_id = %schema.id, "schema published");
        schemas.publish(schema);
    }

    let agent = AgentBuilder::new(AgentId::new(args.id), SystemEnv)
        .config(config)
        .schemas(schemas)
        .storage(storage)
        .build(StdioTransport::stdio())?;

    if args.invite {
        let created = agent.create_invitation()?;
        agent.transport().publish_invitation(&created.url, &created.envelope).await?;
    }

    let (shutdown, signal) = shutdown_channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received");
                shutdown.trigger();
            },
            Err(e) => error!(error = %e, "cannot listen for interrupt"),
        }
    });

    agent.run(signal).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_schema_flags() {
        let schema = parse_schema("degree:1.0=name, degree ,year").unwrap();
        assert_eq!(schema.id, "degree:1.0");
        assert_eq!(schema.attributes.len(), 3);
        assert!(schema.attributes.contains("degree"));

        assert!(parse_schema("degree=name").is_err());
        assert!(parse_schema("degree:1.0=").is_err());
        assert!(parse_schema("degree:1.0").is_err());
    }

    #[test]
    fn zero_disables_timeouts() {
        assert_eq!(timeout(0), None);
        assert_eq!(timeout(5), Some(Duration::from_secs(5)));
    }
}
