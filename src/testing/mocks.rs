//! Mock implementations for testing
//!
//! Provides an in-memory network, a scripted answer engine and record
//! builders so nodes can be exercised without sockets or external services.

use crate::agent::answer::{AnswerEngine, AnswerError, AnswerOutcome};
use crate::identity::{AgentId, NodeIdentity};
use crate::protocol::messages::{
    timestamp_now, AgentRecord, CapabilityDescriptor, Endpoint, Message, Role,
};
use crate::protocol::topics::TopicPath;
use crate::transport::{deadline_ms, MessageHandler, Transport, TransportError};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Deterministic identity for tests
pub fn test_identity(seed: u8) -> NodeIdentity {
    NodeIdentity::from_seed(&[seed; 32])
}

/// `mem://name` endpoint
pub fn mem_endpoint(name: &str) -> Endpoint {
    match Endpoint::parse(&format!("mem://{name}")) {
        Ok(endpoint) => endpoint,
        Err(e) => panic!("invalid test endpoint name '{name}': {e}"),
    }
}

/// Signed record announcing `(topic, confidence)` pairs, refreshed now
pub fn test_record(
    identity: &NodeIdentity,
    role: Role,
    endpoint: Endpoint,
    capabilities: &[(&str, f64)],
) -> AgentRecord {
    let descriptors = capabilities
        .iter()
        .map(|(topic, confidence)| match TopicPath::parse(topic) {
            Ok(topic) => CapabilityDescriptor::new(topic, *confidence, ""),
            Err(e) => panic!("invalid test topic '{topic}': {e}"),
        })
        .collect();
    match AgentRecord::signed(identity, role, endpoint, descriptors, timestamp_now()) {
        Ok(record) => record,
        Err(e) => panic!("failed to sign test record: {e}"),
    }
}

#[derive(Default)]
struct NetworkState {
    handlers: DashMap<String, Arc<dyn MessageHandler>>,
    unreachable: DashSet<String>,
    delays: DashMap<String, Duration>,
    deliveries: Mutex<Vec<(String, &'static str)>>,
}

/// In-process network addressed by `mem://name` endpoints
///
/// Handlers are registered under a name; clients deliver messages straight
/// to them, honoring the request deadline, injected delays and outages.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<NetworkState>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `handler` under `name` and return its endpoint
    pub fn register(&self, name: &str, handler: Arc<dyn MessageHandler>) -> Endpoint {
        self.state.handlers.insert(name.to_string(), handler);
        mem_endpoint(name)
    }

    pub fn unregister(&self, name: &str) {
        self.state.handlers.remove(name);
    }

    /// Simulate an outage of `name`
    pub fn set_unreachable(&self, name: &str, unreachable: bool) {
        if unreachable {
            self.state.unreachable.insert(name.to_string());
        } else {
            self.state.unreachable.remove(name);
        }
    }

    /// Delay every reply from `name`
    pub fn set_delay(&self, name: &str, delay: Duration) {
        self.state.delays.insert(name.to_string(), delay);
    }

    /// Transport that presents `local` as the caller
    pub fn client(&self, local: AgentId) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            local,
        }
    }

    /// `(endpoint name, message kind)` of every delivered message, in order
    pub fn deliveries(&self) -> Vec<(String, &'static str)> {
        self.state
            .deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of delivered messages of `kind` addressed to `name`
    pub fn delivered_to(&self, name: &str, kind: &str) -> usize {
        self.deliveries()
            .iter()
            .filter(|(to, k)| to == name && *k == kind)
            .count()
    }

    pub fn clear_deliveries(&self) {
        self.state
            .deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Client side of [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local: AgentId,
}

impl MemoryTransport {
    async fn deliver(&self, name: &str, message: Message) -> Result<Message, TransportError> {
        let state = &self.network.state;
        if state.unreachable.contains(name) {
            return Err(TransportError::Unreachable(format!("mem://{name} is down")));
        }
        let handler = state
            .handlers
            .get(name)
            .map(|h| h.value().clone())
            .ok_or_else(|| TransportError::Unreachable(format!("no agent at mem://{name}")))?;

        state
            .deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name.to_string(), message.kind()));

        if let Some(delay) = state.delays.get(name).map(|d| *d) {
            tokio::time::sleep(delay).await;
        }
        Ok(handler.handle(Some(&self.local), message).await)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn request(
        &self,
        endpoint: &Endpoint,
        message: Message,
        deadline: Duration,
    ) -> Result<Message, TransportError> {
        if endpoint.scheme() != "mem" {
            return Err(TransportError::UnsupportedScheme(endpoint.scheme().to_string()));
        }
        match tokio::time::timeout(deadline, self.deliver(endpoint.authority(), message)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(deadline_ms(deadline))),
        }
    }
}

/// Answer engine with a fixed reply that counts its calls
#[derive(Debug)]
pub struct StaticAnswerEngine {
    reply: Option<Value>,
    fail: bool,
    calls: AtomicUsize,
}

impl StaticAnswerEngine {
    pub fn answering(payload: Value) -> Self {
        Self {
            reply: Some(payload),
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn declining() -> Self {
        Self {
            reply: None,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: None,
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl AnswerEngine for StaticAnswerEngine {
    async fn answer(&self, _topic: &TopicPath, _query: &str) -> Result<AnswerOutcome, AnswerError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.fail {
            return Err(AnswerError::Network("scripted failure".into()));
        }
        Ok(match &self.reply {
            Some(payload) => AnswerOutcome::Answered(payload.clone()),
            None => AnswerOutcome::Declined,
        })
    }
}

/// Handler that replies with a fixed message and records what it received
pub struct ScriptedHandler {
    id: AgentId,
    reply: Message,
    received: Mutex<Vec<Message>>,
}

impl ScriptedHandler {
    pub fn new(id: AgentId, reply: Message) -> Self {
        Self {
            id,
            reply,
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn received(&self) -> Vec<Message> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl MessageHandler for ScriptedHandler {
    async fn handle(&self, _peer: Option<&AgentId>, message: Message) -> Message {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
        self.reply.clone()
    }

    fn local_id(&self) -> &AgentId {
        &self.id
    }
}
