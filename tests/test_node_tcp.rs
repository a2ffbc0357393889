//! Nodes talking over real TCP sockets, built from configuration the same
//! way the binary builds them

use elmnet::config::{AnswerEngineKind, NodeConfig};
use elmnet::protocol::{CapabilityDescriptor, Endpoint, FailureKind, Role, TopicPath};
use elmnet::session::SessionState;
use elmnet::testing::test_identity;
use elmnet::{ElmnetNode, NodeComponents};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// A port nothing is listening on right now
fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn tcp_config(role: Role) -> (NodeConfig, Endpoint) {
    let listen = format!("127.0.0.1:{}", free_port());
    let config = NodeConfig::for_role(role, &listen);
    let endpoint = config.advertised_endpoint().unwrap();
    (config, endpoint)
}

fn build(config: NodeConfig, seed: u8) -> Arc<ElmnetNode> {
    let identity = test_identity(seed);
    let components = NodeComponents::from_config(&config, &identity).unwrap();
    ElmnetNode::new(config, identity, components).unwrap()
}

#[tokio::test]
async fn test_query_over_tcp_is_answered_by_http_service() {
    let service = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"topic": "food/vegan"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "answered": true,
            "payload": {"dish": "lentil curry"}
        })))
        .expect(1)
        .mount(&service)
        .await;

    let (mut host_config, host_endpoint) = tcp_config(Role::Host);
    host_config.node.capabilities = vec![CapabilityDescriptor::new(
        TopicPath::parse("food/vegan").unwrap(),
        0.9,
        "vegan recipes",
    )];
    host_config.answer.engine = AnswerEngineKind::Http;
    host_config.answer.url = Some(service.uri());
    host_config.answer.timeout_ms = 1000;
    host_config.answer.retry_attempts = 0;
    let host = build(host_config, 20);
    host.listen_tcp().await.unwrap();
    host.start().await.unwrap();

    let (mut personal_config, _) = tcp_config(Role::Personal);
    personal_config.routing.first_hop = Some(host_endpoint);
    let personal = build(personal_config, 1);
    personal.listen_tcp().await.unwrap();
    personal.start().await.unwrap();

    // Starting announced the personal agent to its first hop
    assert!(host.index().get(personal.agent_id()).is_some());

    let report = personal.query("food/vegan", "dinner ideas").await.unwrap();
    assert_eq!(report.state, SessionState::Answered);
    assert_eq!(report.payload(), Some(&json!({"dish": "lentil curry"})));
    assert_eq!(report.provenance, vec![host.agent_id().clone()]);

    personal.shutdown().await.unwrap();
    // The withdrawal reached the host before the personal agent went away
    assert!(host.index().get(personal.agent_id()).is_none());
    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_first_hop_fails_quickly() {
    let (mut config, _) = tcp_config(Role::Personal);
    config.routing.first_hop = Some(Endpoint::parse(&format!("tcp://127.0.0.1:{}", free_port())).unwrap());
    config.routing.hop_timeout_ms = 500;
    let personal = build(config, 1);

    let report = personal.query("food/vegan", "dinner").await.unwrap();
    assert_eq!(report.state, SessionState::Failed(FailureKind::PeerUnreachable));
    // Nothing is known about whoever should have been listening there
    assert!(report.feedback.is_empty());
}

#[tokio::test]
async fn test_directory_survives_restart() {
    let dir = TempDir::new().unwrap();
    let snapshot = dir.path().join("router.json");

    let (mut router_config, router_endpoint) = tcp_config(Role::Router);
    router_config.node.snapshot_file = Some(snapshot.clone());
    let router = build(router_config.clone(), 10);
    router.listen_tcp().await.unwrap();
    router.start().await.unwrap();

    let (mut host_config, _) = tcp_config(Role::Host);
    host_config.node.capabilities = vec![CapabilityDescriptor::new(
        TopicPath::parse("music").unwrap(),
        0.8,
        "",
    )];
    host_config.gossip.bootstrap_peers = vec![router_endpoint];
    let host = build(host_config, 20);
    host.start().await.unwrap();
    assert!(router.index().get(host.agent_id()).is_some());

    router.shutdown().await.unwrap();
    assert!(snapshot.exists());

    // Same identity and snapshot file, fresh process state
    let restarted = build(router_config, 10);
    assert!(restarted.index().get(host.agent_id()).is_none());
    restarted.start().await.unwrap();
    assert_eq!(
        restarted.index().get(host.agent_id()),
        router.index().get(host.agent_id())
    );
    restarted.shutdown().await.unwrap();
}
