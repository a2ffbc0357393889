//! Test helpers and utilities for integration tests

use elmnet::agent::answer::{AnswerEngine, DecliningAnswerEngine};
use elmnet::config::NodeConfig;
use elmnet::protocol::{CapabilityDescriptor, Endpoint, Role, TopicPath};
use elmnet::routing::{NoPayments, PaymentAuthorizer};
use elmnet::testing::{mem_endpoint, test_identity, MemoryNetwork};
use elmnet::{ElmnetNode, NodeComponents};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for an in-memory node called `name`
#[allow(dead_code)]
pub fn node_config(name: &str, role: Role, capabilities: &[(&str, f64)]) -> NodeConfig {
    let mut config = NodeConfig::for_role(role, "127.0.0.1:0");
    config.node.endpoint = Some(mem_endpoint(name));
    config.node.capabilities = capabilities
        .iter()
        .map(|(topic, confidence)| {
            CapabilityDescriptor::new(TopicPath::parse(topic).unwrap(), *confidence, "")
        })
        .collect();
    config.routing.hop_timeout_ms = 200;
    config
}

/// Builder for a node attached to a [`MemoryNetwork`]
#[allow(dead_code)]
pub struct TestNode {
    seed: u8,
    config: NodeConfig,
    answers: Arc<dyn AnswerEngine>,
    payments: Arc<dyn PaymentAuthorizer>,
}

#[allow(dead_code)]
impl TestNode {
    pub fn new(seed: u8, name: &str, role: Role) -> Self {
        Self {
            seed,
            config: node_config(name, role, &[]),
            answers: Arc::new(DecliningAnswerEngine),
            payments: Arc::new(NoPayments),
        }
    }

    pub fn capability(mut self, topic: &str, confidence: f64) -> Self {
        self.config.node.capabilities.push(CapabilityDescriptor::new(
            TopicPath::parse(topic).unwrap(),
            confidence,
            "",
        ));
        self
    }

    pub fn priced_capability(mut self, topic: &str, confidence: f64, amount: u64) -> Self {
        self.config.node.capabilities.push(
            CapabilityDescriptor::new(TopicPath::parse(topic).unwrap(), confidence, "").with_price(
                elmnet::protocol::Price {
                    amount,
                    currency: "EUR".to_string(),
                },
            ),
        );
        self
    }

    pub fn answers(mut self, answers: Arc<dyn AnswerEngine>) -> Self {
        self.answers = answers;
        self
    }

    pub fn payments(mut self, payments: Arc<dyn PaymentAuthorizer>) -> Self {
        self.payments = payments;
        self
    }

    pub fn first_hop(mut self, endpoint: Endpoint) -> Self {
        self.config.routing.first_hop = Some(endpoint);
        self
    }

    pub fn bootstrap(mut self, peers: Vec<Endpoint>) -> Self {
        self.config.gossip.bootstrap_peers = peers;
        self
    }

    pub fn configure(mut self, f: impl FnOnce(&mut NodeConfig)) -> Self {
        f(&mut self.config);
        self
    }

    /// Build the node and register it on `network` under its endpoint name
    pub fn attach(self, network: &MemoryNetwork) -> Arc<ElmnetNode> {
        let identity = test_identity(self.seed);
        let name = self
            .config
            .node
            .endpoint
            .as_ref()
            .map(|e| e.authority().to_string())
            .unwrap();
        let components = NodeComponents {
            transport: Arc::new(network.client(identity.agent_id().clone())),
            answers: self.answers,
            payments: self.payments,
            persistence: None,
        };
        let node = ElmnetNode::new(self.config, identity, components).unwrap();
        network.register(&name, node.clone());
        node
    }
}

/// Put `host`'s current record straight into `router`'s index
#[allow(dead_code)]
pub fn introduce(router: &ElmnetNode, host: &ElmnetNode) {
    let record = host.own_record().unwrap();
    assert!(router.index().upsert(record).is_applied());
}

/// Poll `condition` until it holds or one second passes
#[allow(dead_code)]
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
