//! End-to-end protocol scenarios with oracle verification.

use std::time::Duration;

use didcomm_agent::{AgentConfig, Schema};
use didcomm_core::{
    ConnectionState, ExchangeRole, ExchangeState, ExpiryPolicy, PresentationRole, PresentationState,
};
use didcomm_harness::Scenario;
use didcomm_proto::payloads::Attributes;

fn degree() -> Schema {
    Schema::new("degree", "1.0", ["name", "degree"])
}

fn alice_degree() -> Attributes {
    [("name", "Alice"), ("degree", "Maths")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn connection_handshake() {
    Scenario::new("connection handshake")
        .agent("issuer")
        .agent("holder")
        .connect("issuer", "holder")
        .oracle(Box::new(|world| {
            if !world.all_connections_completed() {
                return Err("connections should be completed".into());
            }
            let (issuer, holder) =
                world.connection_between("issuer", "holder").ok_or("no shared connection")?;
            assert_eq!(issuer.their_label(), Some("holder"));
            assert_eq!(holder.their_label(), Some("issuer"));
            world.peers_agree()?;

            // request, response, ack
            assert_eq!(world.envelopes_delivered("issuer"), 2);
            assert_eq!(world.envelopes_delivered("holder"), 1);
            assert!(world.rejections().is_empty());
            Ok(())
        }))
        .run()
        .await
        .expect("scenario should succeed");
}

#[tokio::test]
async fn holder_initiated_credential() {
    Scenario::new("holder proposes")
        .agent("issuer")
        .agent("holder")
        .schema(degree())
        .connect("issuer", "holder")
        .propose_credential("holder", "issuer", "degree:1.0", alice_degree())
        .oracle(Box::new(|world| {
            let [holder] = world.exchanges("holder") else {
                return Err("holder should have exactly one exchange".into());
            };
            let [issuer] = world.exchanges("issuer") else {
                return Err("issuer should have exactly one exchange".into());
            };

            assert_eq!(holder.role(), ExchangeRole::Holder);
            assert_eq!(issuer.role(), ExchangeRole::Issuer);
            assert!(world.all_exchanges_acknowledged());
            assert!(holder.credential_id().is_some());
            assert_eq!(world.credentials("holder"), 1);
            assert_eq!(world.credentials("issuer"), 0);
            world.peers_agree()
        }))
        .run()
        .await
        .expect("scenario should succeed");
}

#[tokio::test]
async fn issuer_initiated_credential() {
    Scenario::new("issuer offers")
        .agent("issuer")
        .agent("holder")
        .schema(degree())
        .connect("issuer", "holder")
        .offer_credential("issuer", "holder", "degree:1.0", alice_degree())
        .oracle(Box::new(|world| {
            assert!(world.all_exchanges_acknowledged());
            assert_eq!(world.credentials("holder"), 1);
            let issued = &world.exchanges("issuer")[0];
            assert_eq!(issued.attributes(), &alice_degree());
            Ok(())
        }))
        .run()
        .await
        .expect("scenario should succeed");
}

#[tokio::test]
async fn retransmissions_change_nothing() {
    let world = Scenario::new("every envelope twice")
        .agent("issuer")
        .agent("holder")
        .schema(degree())
        .duplicate_deliveries()
        .connect("issuer", "holder")
        .propose_credential("holder", "issuer", "degree:1.0", alice_degree())
        .send_message("holder", "issuer", "thanks")
        .oracle(Box::new(|world| {
            assert!(world.all_connections_completed());
            assert!(world.all_exchanges_acknowledged());
            assert_eq!(world.connections("issuer").len(), 1);
            assert_eq!(world.exchanges("issuer").len(), 1);
            assert_eq!(world.credentials("holder"), 1, "duplicate issue must not store twice");
            world.peers_agree()
        }))
        .run()
        .await
        .expect("scenario should succeed");

    assert!(world.rejections().is_empty(), "{:?}", world.rejections());
}

#[tokio::test]
async fn issued_credential_proves_requested_attributes() {
    let world = Scenario::new("issue then prove")
        .agent("issuer")
        .agent("holder")
        .schema(degree())
        .duplicate_deliveries()
        .connect("issuer", "holder")
        .offer_credential("issuer", "holder", "degree:1.0", alice_degree())
        .request_proof("issuer", "holder", "degree:1.0", ["name"])
        .oracle(Box::new(|world| {
            let [verifier] = world.presentations("issuer") else {
                return Err("issuer should have exactly one presentation".into());
            };
            let [prover] = world.presentations("holder") else {
                return Err("holder should have exactly one presentation".into());
            };

            assert_eq!(verifier.role(), PresentationRole::Verifier);
            assert_eq!(prover.role(), PresentationRole::Prover);
            assert_eq!(verifier.state(), PresentationState::Acknowledged);
            assert_eq!(prover.state(), PresentationState::Acknowledged);
            assert_eq!(verifier.revealed().get("name").map(String::as_str), Some("Alice"));
            assert!(!verifier.revealed().contains_key("degree"));
            assert_eq!(verifier.credential_id(), prover.credential_id());
            Ok(())
        }))
        .run()
        .await
        .expect("scenario should succeed");

    assert!(world.rejections().is_empty(), "{:?}", world.rejections());
}

#[tokio::test]
async fn proof_without_a_credential_is_abandoned() {
    Scenario::new("nothing to prove")
        .agent("verifier")
        .agent("holder")
        .schema(degree())
        .connect("verifier", "holder")
        .request_proof("verifier", "holder", "degree:1.0", ["name"])
        .oracle(Box::new(|world| {
            for name in ["verifier", "holder"] {
                let presentations = world.presentations(name);
                assert_eq!(presentations.len(), 1, "{name}");
                assert_eq!(presentations[0].state(), PresentationState::Abandoned, "{name}");
            }
            let reason = world.presentations("verifier")[0].abandon_reason().unwrap_or_default();
            assert!(reason.contains("no matching credential"), "{reason}");
            assert!(world.rejections().is_empty());
            Ok(())
        }))
        .run()
        .await
        .expect("scenario should succeed");
}

#[tokio::test]
async fn messages_arrive_in_order() {
    Scenario::new("chat")
        .agent("alice")
        .agent("bob")
        .connect("alice", "bob")
        .send_message("alice", "bob", "one")
        .send_message("bob", "alice", "ack one")
        .send_message("alice", "bob", "two")
        .ping("bob", "alice")
        .oracle(Box::new(|world| {
            assert_eq!(world.messages("bob", "alice"), ["one", "two"]);
            assert_eq!(world.messages("alice", "bob"), ["ack one"]);
            Ok(())
        }))
        .run()
        .await
        .expect("scenario should succeed");
}

#[tokio::test]
async fn unanswered_connection_expires() {
    let manual = AgentConfig {
        auto_accept_connections: false,
        expiry: ExpiryPolicy {
            connection_timeout: Some(Duration::from_secs(60)),
            exchange_timeout: None,
        },
        ..AgentConfig::default()
    };

    Scenario::new("stalled invitation")
        .agent_with_config("issuer", manual.clone())
        .agent_with_config("holder", manual)
        .connect("issuer", "holder")
        .advance_time(Duration::from_secs(61))
        .oracle(Box::new(|world| {
            for name in ["issuer", "holder"] {
                let connections = world.connections(name);
                assert_eq!(connections.len(), 1, "{name}");
                assert_eq!(connections[0].state(), ConnectionState::Abandoned, "{name}");
            }
            Ok(())
        }))
        .run()
        .await
        .expect("scenario should succeed");
}

#[tokio::test]
async fn oracle_failure_fails_the_run() {
    let result = Scenario::new("strict oracle")
        .agent("alice")
        .oracle(Box::new(|world| {
            if world.exchanges("alice").iter().any(|x| x.state() == ExchangeState::Acknowledged) {
                Ok(())
            } else {
                Err("alice has no credential".into())
            }
        }))
        .run()
        .await;

    assert!(result.is_err());
}
