//! Record durability and expiry across agent restarts.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use didcomm_agent::{AgentBuilder, AgentConfig, ChannelNetwork, RedbStorage};
use didcomm_core::{ConnectionState, Environment, ExpiryPolicy, Timestamp};
use didcomm_proto::AgentId;
use tempfile::TempDir;

/// Manual clock, counter-based randomness
#[derive(Clone, Default)]
struct TestEnv {
    millis: Arc<AtomicU64>,
    counter: Arc<AtomicU64>,
}

impl TestEnv {
    fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Environment for TestEnv {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.millis.load(Ordering::SeqCst))
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        let seed = self.counter.fetch_add(1, Ordering::SeqCst).to_le_bytes();
        for (i, byte) in buffer.iter_mut().enumerate() {
            *byte = seed[i % seed.len()] ^ (i as u8);
        }
    }
}

#[tokio::test]
async fn connections_reload_from_disk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bob.redb");
    let network = ChannelNetwork::new();

    let created = {
        let bob = AgentBuilder::new(AgentId::new("bob"), TestEnv::default())
            .storage(Arc::new(RedbStorage::open(&path).unwrap()))
            .build(network.join(AgentId::new("bob")))
            .unwrap();
        bob.create_invitation().unwrap().connection
    };

    let bob = AgentBuilder::new(AgentId::new("bob"), TestEnv::default())
        .storage(Arc::new(RedbStorage::open(&path).unwrap()))
        .build(network.join(AgentId::new("bob")))
        .unwrap();

    let reloaded = bob.connection(created.id()).await.expect("connection reloaded");
    assert_eq!(reloaded, created);
    assert_eq!(reloaded.state(), ConnectionState::Invitation);
}

#[tokio::test]
async fn sweep_abandons_idle_connections() {
    let env = TestEnv::default();
    let network = ChannelNetwork::new();
    let config = AgentConfig {
        expiry: ExpiryPolicy {
            connection_timeout: Some(Duration::from_secs(600)),
            exchange_timeout: None,
        },
        ..AgentConfig::default()
    };
    let bob = AgentBuilder::new(AgentId::new("bob"), env.clone())
        .config(config)
        .build(network.join(AgentId::new("bob")))
        .unwrap();

    let connection = bob.create_invitation().unwrap().connection;

    env.advance(Duration::from_secs(600));
    assert_eq!(bob.sweep().await, 0, "expiry needs strictly more than the limit");

    env.advance(Duration::from_millis(1));
    assert_eq!(bob.sweep().await, 1);
    let expired = bob.connection(connection.id()).await.unwrap();
    assert_eq!(expired.state(), ConnectionState::Abandoned);

    env.advance(Duration::from_secs(3600));
    assert_eq!(bob.sweep().await, 0, "terminal records never expire again");
}
