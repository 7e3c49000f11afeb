//! Agents running their real loops over turmoil's simulated network.
//!
//! The issuer is a long-lived host; the holder is the client whose completion
//! ends the simulation. The invitation URL travels out of band through a
//! shared slot, the way a QR code would.

use std::{
    error::Error,
    future::Future,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use didcomm_agent::{
    Agent, AgentBuilder, AgentConfig, MemorySchemaRegistry, MemoryWallet, Schema, shutdown_channel,
};
use didcomm_core::{ConnectionRecord, ExchangeState};
use didcomm_harness::{SimEnv, SimTransport};
use didcomm_proto::{AgentId, payloads::Attributes};

type Slot = Arc<Mutex<Option<String>>>;
type SimAgent = Agent<SimEnv, SimTransport>;

/// What the issuer host reports about itself
#[derive(Default)]
struct IssuerView {
    completed: AtomicUsize,
    messages: AtomicUsize,
}

async fn start(name: &str, wallet: Arc<MemoryWallet>) -> Result<SimAgent, Box<dyn Error>> {
    let schemas = Arc::new(MemorySchemaRegistry::new());
    schemas.publish(Schema::new("degree", "1.0", ["name", "degree"]));

    let transport = SimTransport::bind(AgentId::new(name)).await?;
    let agent = AgentBuilder::new(AgentId::new(name), SimEnv::new())
        .config(AgentConfig { label: name.to_string(), workers: 2, ..AgentConfig::default() })
        .wallet(wallet)
        .schemas(schemas)
        .build(transport)?;
    Ok(agent)
}

/// Issuer host; publishes its invitation to `slot` and keeps `view` current
fn issuer_host(sim: &mut turmoil::Sim<'_>, slot: &Slot, view: &Arc<IssuerView>) {
    let (slot, view) = (slot.clone(), view.clone());
    sim.host("issuer", move || {
        let (slot, view) = (slot.clone(), view.clone());
        async move {
            let agent = start("issuer", Arc::new(MemoryWallet::new())).await?;
            let created = agent.create_invitation()?;
            *slot.lock().unwrap() = Some(created.url);

            let monitor = agent.clone();
            tokio::spawn(async move {
                loop {
                    let (mut completed, mut messages) = (0, 0);
                    for connection in monitor.connections().await {
                        completed += usize::from(connection.is_completed());
                        messages += monitor.messages(connection.id()).map_or(0, |m| m.len());
                    }
                    view.completed.store(completed, Ordering::SeqCst);
                    view.messages.store(messages, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            });

            let (_stop, signal) = shutdown_channel();
            agent.run(signal).await?;
            Ok(())
        }
    });
}

async fn eventually<F, Fut>(what: &str, mut check: F) -> Result<(), Box<dyn Error>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..1_000 {
        if check().await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Err(format!("timed out waiting for {what}").into())
}

async fn invitation(slot: &Slot) -> Result<String, Box<dyn Error>> {
    let mut url = None;
    eventually("invitation", || {
        url = slot.lock().unwrap().clone();
        let ready = url.is_some();
        async move { ready }
    })
    .await?;
    url.ok_or_else(|| "invitation vanished".into())
}

/// Connect and wait until both ends are completed
async fn connect(
    agent: &SimAgent,
    slot: &Slot,
    issuer: &IssuerView,
) -> Result<ConnectionRecord, Box<dyn Error>> {
    let url = invitation(slot).await?;
    let connection = agent.receive_invitation(&url).await?;
    eventually("connection completed", || async {
        agent.connection(connection.id()).await.is_some_and(|c| c.is_completed())
    })
    .await?;
    eventually("issuer completed", || {
        let completed = issuer.completed.load(Ordering::SeqCst);
        async move { completed == 1 }
    })
    .await?;
    Ok(connection)
}

#[test]
fn credential_issued_over_latent_network() {
    let mut sim = turmoil::Builder::new()
        .simulation_duration(Duration::from_secs(60))
        .min_message_latency(Duration::from_millis(20))
        .max_message_latency(Duration::from_millis(80))
        .rng_seed(7)
        .build();

    let slot = Slot::default();
    let issuer = Arc::new(IssuerView::default());
    issuer_host(&mut sim, &slot, &issuer);

    sim.client("holder", async move {
        let wallet = Arc::new(MemoryWallet::new());
        let agent = start("holder", wallet.clone()).await?;
        let (stop, signal) = shutdown_channel();
        let runner = agent.clone();
        let running = tokio::spawn(async move { runner.run(signal).await });

        let connection = connect(&agent, &slot, &issuer).await?;
        let attributes: Attributes = [("name", "Alice"), ("degree", "Maths")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let exchange = agent.propose_credential(connection.id(), "degree:1.0", attributes).await?;

        eventually("credential acknowledged", || async {
            agent.exchange(exchange.id()).await.is_some_and(|x| x.state() == ExchangeState::Acknowledged)
        })
        .await?;
        assert_eq!(wallet.len(), 1);

        stop.trigger();
        running.await??;
        Ok(())
    });

    sim.run().expect("simulation should complete");
}

#[test]
fn messages_cross_the_network() {
    let mut sim = turmoil::Builder::new()
        .simulation_duration(Duration::from_secs(60))
        .min_message_latency(Duration::from_millis(100))
        .max_message_latency(Duration::from_millis(100))
        .build();

    let slot = Slot::default();
    let issuer = Arc::new(IssuerView::default());
    issuer_host(&mut sim, &slot, &issuer);

    sim.client("holder", async move {
        let agent = start("holder", Arc::new(MemoryWallet::new())).await?;
        let (stop, signal) = shutdown_channel();
        let runner = agent.clone();
        let running = tokio::spawn(async move { runner.run(signal).await });

        let connection = connect(&agent, &slot, &issuer).await?;
        for i in 0..5 {
            agent.send_message(connection.id(), &format!("m{i}")).await?;
        }
        agent.send_ping(connection.id()).await?;

        eventually("issuer stored every message", || {
            let stored = issuer.messages.load(Ordering::SeqCst);
            async move { stored == 5 }
        })
        .await?;
        assert!(agent.connection(connection.id()).await.is_some_and(|c| c.is_completed()));

        stop.trigger();
        running.await??;
        Ok(())
    });

    sim.run().expect("simulation should complete");
}
