//! Node lifecycle
//!
//! An [`ElmnetNode`] owns one agent's index, ledger, routing engine and
//! gossip state. It answers inbound messages as a [`MessageHandler`], runs
//! the background loops (gossip, record refresh, expiry, decay) and starts
//! owner query sessions.

use crate::agent::answer::{answer_engine_from_config, AnswerEngine};
use crate::agent::index::CapabilityIndex;
use crate::config::NodeConfig;
use crate::error::{ElmnetError, ElmnetResult};
use crate::gossip::{GossipExchange, GossipSettings, PeerSet};
use crate::identity::{AgentId, NodeIdentity};
use crate::lifecycle_span;
use crate::observability::metrics::metrics;
use crate::persistence::{JsonFilePersistence, Persistence, Snapshot};
use crate::protocol::messages::{
    timestamp_now, AgentRecord, Endpoint, FailureKind, Message, Role, Withdrawal,
    PROTOCOL_VERSION,
};
use crate::protocol::topics::TopicPath;
use crate::reputation::{LedgerSettings, ReputationLedger};
use crate::routing::engine::{RoutingEngine, RoutingSettings};
use crate::routing::payment::{DigestPaymentAuthorizer, NoPayments, PaymentAuthorizer};
use crate::session::{NextHop, SessionCoordinator, SessionReport, SessionSettings};
use crate::transport::{serve, MessageHandler, TcpTransport, Transport};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument};

/// Deadline for announce and withdraw deliveries
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(2);
/// How long shutdown waits for background loops
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Collaborators a node is built with
pub struct NodeComponents {
    pub transport: Arc<dyn Transport>,
    pub answers: Arc<dyn AnswerEngine>,
    pub payments: Arc<dyn PaymentAuthorizer>,
    pub persistence: Option<Arc<dyn Persistence>>,
}

impl NodeComponents {
    /// TCP transport plus the adapters selected in `config`
    pub fn from_config(config: &NodeConfig, identity: &NodeIdentity) -> ElmnetResult<Self> {
        let payments: Arc<dyn PaymentAuthorizer> = match config.payment_secret()? {
            Some(secret) => Arc::new(DigestPaymentAuthorizer::new(secret)),
            None => Arc::new(NoPayments),
        };
        let persistence = config
            .node
            .snapshot_file
            .as_ref()
            .map(|path| Arc::new(JsonFilePersistence::new(path.clone())) as Arc<dyn Persistence>);

        Ok(Self {
            transport: Arc::new(TcpTransport::new(identity.agent_id().clone())),
            answers: answer_engine_from_config(&config.answer)?,
            payments,
            persistence,
        })
    }
}

/// One running agent
pub struct ElmnetNode {
    identity: NodeIdentity,
    config: NodeConfig,
    endpoint: Endpoint,
    index: Arc<CapabilityIndex>,
    ledger: Arc<ReputationLedger>,
    engine: RoutingEngine,
    gossip: Arc<GossipExchange>,
    transport: Arc<dyn Transport>,
    payments: Arc<dyn PaymentAuthorizer>,
    persistence: Option<Arc<dyn Persistence>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    ready: AtomicBool,
}

impl ElmnetNode {
    pub fn new(
        config: NodeConfig,
        identity: NodeIdentity,
        components: NodeComponents,
    ) -> ElmnetResult<Arc<Self>> {
        let endpoint = config.advertised_endpoint()?;
        let local = identity.agent_id().clone();

        let ledger = Arc::new(ReputationLedger::new(LedgerSettings::from(
            &config.reputation,
        )));
        let index = Arc::new(CapabilityIndex::new(
            config.directory.record_ttl(),
            ledger.clone(),
        ));

        let engine = RoutingEngine::new(
            local.clone(),
            config.node.capabilities.clone(),
            index.clone(),
            components.answers,
            components.payments.clone(),
            RoutingSettings::from(&config.routing),
        );

        let peers = PeerSet::with_bootstrap(
            endpoint.clone(),
            config.gossip.max_peers,
            &config.gossip.bootstrap_peers,
        );
        let gossip = Arc::new(GossipExchange::new(
            local,
            index.clone(),
            components.transport.clone(),
            peers,
            GossipSettings::from(&config.gossip),
        ));

        let (shutdown_tx, _) = watch::channel(false);
        metrics().set_node_state("initialized");

        Ok(Arc::new(Self {
            identity,
            config,
            endpoint,
            index,
            ledger,
            engine,
            gossip,
            transport: components.transport,
            payments: components.payments,
            persistence: components.persistence,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            ready: AtomicBool::new(false),
        }))
    }

    pub fn agent_id(&self) -> &AgentId {
        self.identity.agent_id()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn role(&self) -> Role {
        self.config.node.role
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn index(&self) -> &Arc<CapabilityIndex> {
        &self.index
    }

    pub fn ledger(&self) -> &Arc<ReputationLedger> {
        &self.ledger
    }

    pub fn gossip(&self) -> &Arc<GossipExchange> {
        &self.gossip
    }

    pub fn engine(&self) -> &RoutingEngine {
        &self.engine
    }

    /// Started and not shutting down
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Freshly signed record for this node
    pub fn own_record(&self) -> ElmnetResult<AgentRecord> {
        Ok(AgentRecord::signed(
            &self.identity,
            self.config.node.role,
            self.endpoint.clone(),
            self.config.node.capabilities.clone(),
            timestamp_now(),
        )?)
    }

    /// Restore the snapshot, announce ourselves and start background loops
    pub async fn start(self: &Arc<Self>) -> ElmnetResult<()> {
        let span = lifecycle_span!(event = "start", agent_id = %self.agent_id().short());
        async {
            metrics().set_node_state("starting");
            self.restore_snapshot();
            self.gossip.seed_from_state();
            self.refresh_own_record()?;
            self.announce_to_neighbours().await?;

            let mut tasks = Vec::new();
            tasks.push(self.gossip.clone().spawn(self.shutdown_tx.subscribe()));
            tasks.push(self.spawn_maintenance());

            self.tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(tasks);
            self.ready.store(true, Ordering::Relaxed);
            metrics().set_node_state("running");
            info!(
                role = %self.role(),
                endpoint = %self.endpoint,
                capabilities = self.config.node.capabilities.len(),
                "Node started"
            );
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Bind the configured TCP listener and serve inbound messages
    pub async fn listen_tcp(self: &Arc<Self>) -> ElmnetResult<SocketAddr> {
        let listener = TcpListener::bind(&self.config.node.listen)
            .await
            .map_err(crate::transport::TransportError::from)?;
        let addr = listener
            .local_addr()
            .map_err(crate::transport::TransportError::from)?;

        let handler: Arc<dyn MessageHandler> = self.clone();
        let shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            if let Err(e) = serve(listener, handler, shutdown).await {
                error!(error = %e, "TCP listener stopped");
            }
        });
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        Ok(addr)
    }

    /// Subscribe to the node's shutdown flag
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Run an owner query session from this node
    pub async fn query(&self, topic: &str, text: &str) -> ElmnetResult<SessionReport> {
        let topic = TopicPath::parse(topic)?;
        let report = self
            .coordinator()
            .run_with_cancel(topic, text, self.shutdown_tx.subscribe())
            .await;
        for entry in &report.feedback {
            self.gossip.note_reputation(&entry.agent_id, &entry.topic);
        }
        Ok(report)
    }

    fn coordinator(&self) -> SessionCoordinator {
        let first_hop = match &self.config.routing.first_hop {
            Some(endpoint) => NextHop {
                agent_id: self
                    .index
                    .records()
                    .into_iter()
                    .find(|record| &record.endpoint == endpoint)
                    .map(|record| record.agent_id),
                endpoint: endpoint.clone(),
            },
            None => NextHop {
                agent_id: Some(self.agent_id().clone()),
                endpoint: self.endpoint.clone(),
            },
        };

        let coordinator = SessionCoordinator::new(
            self.agent_id().clone(),
            first_hop,
            self.transport.clone(),
            self.ledger.clone(),
            self.payments.clone(),
            SessionSettings::from_config(&self.config),
        );
        match &self.config.routing.first_hop {
            Some(endpoint) => coordinator.with_feedback_to(endpoint.clone()),
            None => coordinator,
        }
    }

    /// Stop background loops, withdraw from the network and dump the snapshot
    pub async fn shutdown(&self) -> ElmnetResult<()> {
        let span = lifecycle_span!(event = "shutdown", agent_id = %self.agent_id().short());
        async {
            metrics().set_node_state("stopping");
            self.ready.store(false, Ordering::Relaxed);

            let withdrawal = Withdrawal::signed(&self.identity, timestamp_now())?;
            if self.index.withdraw(withdrawal.clone()) {
                self.gossip.note_record(self.agent_id());
            }
            self.notify_neighbours(Message::Withdraw { withdrawal }).await;

            let _ = self.shutdown_tx.send(true);
            let handles: Vec<_> = self
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain(..)
                .collect();
            for mut handle in handles {
                if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                    warn!("Background task did not stop in time, aborting");
                    handle.abort();
                }
            }

            self.dump_snapshot()?;
            metrics().set_node_state("stopped");
            info!("Node shut down");
            Ok(())
        }
        .instrument(span)
        .await
    }

    fn restore_snapshot(&self) {
        let Some(store) = &self.persistence else {
            return;
        };
        match store.load() {
            Ok(Some(snapshot)) => {
                snapshot.restore(&self.index, &self.ledger);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Ignoring unreadable snapshot"),
        }
    }

    /// Write the snapshot now, if persistence is configured
    pub fn dump_snapshot(&self) -> ElmnetResult<()> {
        if let Some(store) = &self.persistence {
            store.dump(&Snapshot::capture(&self.index, &self.ledger))?;
        }
        Ok(())
    }

    /// Re-sign our record and put it in the index for gossip to carry
    fn refresh_own_record(&self) -> ElmnetResult<AgentRecord> {
        let record = self.own_record()?;
        if self.index.upsert(record.clone()).is_applied() {
            self.gossip.note_record(self.agent_id());
        }
        Ok(record)
    }

    async fn announce_to_neighbours(&self) -> ElmnetResult<()> {
        let record = self
            .index
            .get(self.agent_id())
            .map(Ok)
            .unwrap_or_else(|| self.own_record())?;
        self.notify_neighbours(Message::Announce { record }).await;
        Ok(())
    }

    /// Best-effort delivery to gossip peers and the first hop
    async fn notify_neighbours(&self, message: Message) {
        let mut targets = self.gossip.peers().endpoints();
        if let Some(first_hop) = &self.config.routing.first_hop {
            if !targets.contains(first_hop) && first_hop != &self.endpoint {
                targets.push(first_hop.clone());
            }
        }

        for target in targets {
            match self
                .transport
                .request(&target, message.clone(), NOTIFY_TIMEOUT)
                .await
            {
                Ok(Message::Ack) => debug!(peer = %target, kind = message.kind(), "Neighbour notified"),
                Ok(other) => debug!(peer = %target, reply = other.kind(), "Neighbour replied unexpectedly"),
                Err(e) => debug!(peer = %target, error = %e, "Neighbour not reachable"),
            }
        }
    }

    /// Refresh, expiry and decay on one task
    fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let node = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let directory = &self.config.directory;
        let mut refresh = tokio::time::interval(Duration::from_secs(directory.refresh_interval_secs.max(1)));
        let mut expire = tokio::time::interval(Duration::from_secs(directory.expire_interval_secs.max(1)));
        let mut decay = tokio::time::interval(Duration::from_secs(
            self.config.reputation.decay_interval_secs.max(1),
        ));
        for ticker in [&mut refresh, &mut expire, &mut decay] {
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        tokio::spawn(async move {
            // The first tick of every interval fires immediately
            refresh.tick().await;
            expire.tick().await;
            decay.tick().await;

            loop {
                tokio::select! {
                    _ = refresh.tick() => {
                        match node.refresh_own_record() {
                            Ok(_) => debug!("Own record refreshed"),
                            Err(e) => warn!(error = %e, "Failed to refresh own record"),
                        }
                    }
                    _ = expire.tick() => {
                        node.index.expire(Utc::now());
                        let pruned = node.gossip.prune_log();
                        let evicted = node.engine.evict_stale_results();
                        debug!(pruned, evicted, "Expiry pass");
                        metrics().set_directory_sizes(
                            node.index.len(),
                            node.ledger.len(),
                            node.gossip.peers().len(),
                        );
                    }
                    _ = decay.tick() => {
                        let decayed = node.ledger.decay(Utc::now());
                        debug!(decayed, "Reputation decay pass");
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Maintenance loop stopped");
        })
    }

    fn reject(&self, kind: FailureKind, reason: impl Into<String>) -> Message {
        metrics().message_rejected();
        Message::Rejected {
            kind,
            reason: reason.into(),
        }
    }

    fn rejection(&self, error: ElmnetError) -> Message {
        metrics().message_rejected();
        error.to_rejection()
    }
}

#[async_trait::async_trait]
impl MessageHandler for ElmnetNode {
    async fn handle(&self, peer: Option<&AgentId>, message: Message) -> Message {
        metrics().message_received();

        match message {
            Message::RouteRequest { request } => Message::RouteResponse {
                result: self.engine.resolve(&request).await,
            },
            Message::GossipPush { delta } => self.gossip.apply_delta(delta).ack(),
            Message::Announce { record } => {
                if let Err(e) = record.verify() {
                    return self.rejection(e.into());
                }
                let agent_id = record.agent_id.clone();
                let target = (record.role == Role::Router).then(|| record.hop_target());
                if self.index.upsert(record).is_applied() {
                    self.gossip.note_record(&agent_id);
                }
                if let Some(router) = target {
                    self.gossip
                        .peers()
                        .extend_from_routers(&[router], self.agent_id());
                }
                Message::Ack
            }
            Message::Withdraw { withdrawal } => {
                if let Err(e) = withdrawal.verify() {
                    return self.rejection(e.into());
                }
                let agent_id = withdrawal.agent_id.clone();
                if let Some(record) = self.index.get(&agent_id) {
                    self.gossip.peers().remove(&record.endpoint);
                }
                if self.index.withdraw(withdrawal) {
                    self.gossip.note_record(&agent_id);
                }
                Message::Ack
            }
            Message::FeedbackReport {
                agent_id,
                topic,
                outcome,
            } => {
                if peer == Some(&agent_id) {
                    warn!(agent_id = %agent_id, "Ignoring feedback an agent reported about itself");
                    return Message::Ack;
                }
                let weight = self.config.reputation.intermediate_weight;
                match self.ledger.record(&agent_id, &topic, outcome, weight) {
                    Ok(_) => {
                        self.gossip.note_reputation(&agent_id, &topic);
                        Message::Ack
                    }
                    Err(e) => self.reject(FailureKind::Malformed, e.to_string()),
                }
            }
            Message::Hello { .. } => Message::Hello {
                agent_id: self.agent_id().clone(),
                version: PROTOCOL_VERSION.to_string(),
            },
            other => {
                let error = ElmnetError::unexpected("request message", &other);
                self.rejection(error)
            }
        }
    }

    fn local_id(&self) -> &AgentId {
        self.identity.agent_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::answer::DecliningAnswerEngine;
    use crate::config::MAX_DURATION_SECS;
    use crate::protocol::messages::Outcome;
    use crate::testing::{mem_endpoint, test_identity, test_record, MemoryNetwork};
    use tempfile::TempDir;

    fn node(network: &MemoryNetwork, seed: u8, role: Role) -> Arc<ElmnetNode> {
        let mut config = NodeConfig::for_role(role, "127.0.0.1:0");
        config.node.endpoint = Some(mem_endpoint(&format!("n{seed}")));
        let identity = test_identity(seed);
        let components = NodeComponents {
            transport: Arc::new(network.client(identity.agent_id().clone())),
            answers: Arc::new(DecliningAnswerEngine),
            payments: Arc::new(NoPayments),
            persistence: None,
        };
        let node = ElmnetNode::new(config, identity, components).unwrap();
        network.register(&format!("n{seed}"), node.clone());
        node
    }

    #[tokio::test]
    async fn test_announce_is_verified_and_indexed() {
        let network = MemoryNetwork::new();
        let router = node(&network, 1, Role::Router);

        let record = test_record(&test_identity(5), Role::Host, mem_endpoint("h5"), &[("a", 0.9)]);
        let reply = router
            .handle(None, Message::Announce { record: record.clone() })
            .await;
        assert_eq!(reply, Message::Ack);
        assert_eq!(router.index().get(&record.agent_id), Some(record.clone()));

        let mut forged = record;
        forged.capabilities[0].confidence = 0.1;
        let reply = router.handle(None, Message::Announce { record: forged }).await;
        assert!(matches!(
            reply,
            Message::Rejected {
                kind: FailureKind::Malformed,
                ..
            }
        ));
    }

    #[test]
    fn test_huge_durations_do_not_panic() {
        let mut config = NodeConfig::for_role(Role::Router, "127.0.0.1:0");
        config.directory.record_ttl_secs = 10_u64.pow(16);
        config.reputation.decay_half_life_secs = u64::MAX;
        let identity = test_identity(3);
        let components = NodeComponents {
            transport: Arc::new(MemoryNetwork::new().client(identity.agent_id().clone())),
            answers: Arc::new(DecliningAnswerEngine),
            payments: Arc::new(NoPayments),
            persistence: None,
        };
        let node = ElmnetNode::new(config, identity, components).unwrap();
        assert_eq!(node.index().ttl(), chrono::Duration::seconds(MAX_DURATION_SECS as i64));
    }

    #[tokio::test]
    async fn test_self_feedback_is_ignored() {
        let network = MemoryNetwork::new();
        let router = node(&network, 1, Role::Router);
        let reporter = test_identity(7).agent_id().clone();
        let topic = TopicPath::parse("a").unwrap();

        let report = Message::FeedbackReport {
            agent_id: reporter.clone(),
            topic: topic.clone(),
            outcome: Outcome::Success,
        };
        assert_eq!(router.handle(Some(&reporter), report.clone()).await, Message::Ack);
        assert!(router.ledger().is_empty());

        let other = test_identity(8).agent_id().clone();
        router.handle(Some(&other), report).await;
        assert!(router.ledger().get(&reporter, &topic) > 0.5);
    }

    #[tokio::test]
    async fn test_unexpected_message_is_rejected() {
        let network = MemoryNetwork::new();
        let router = node(&network, 1, Role::Router);
        let reply = router.handle(None, Message::Ack).await;
        assert!(matches!(reply, Message::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_start_and_shutdown_withdraws_and_dumps() {
        let dir = TempDir::new().unwrap();
        let network = MemoryNetwork::new();
        let router = node(&network, 1, Role::Router);

        let mut config = NodeConfig::for_role(Role::Host, "127.0.0.1:0");
        config.node.endpoint = Some(mem_endpoint("n2"));
        config.gossip.bootstrap_peers = vec![mem_endpoint("n1")];
        config.node.snapshot_file = Some(dir.path().join("snapshot.json"));
        let identity = test_identity(2);
        let components = NodeComponents {
            transport: Arc::new(network.client(identity.agent_id().clone())),
            answers: Arc::new(DecliningAnswerEngine),
            payments: Arc::new(NoPayments),
            persistence: Some(Arc::new(JsonFilePersistence::new(
                dir.path().join("snapshot.json"),
            ))),
        };
        let host = ElmnetNode::new(config, identity, components).unwrap();
        network.register("n2", host.clone());

        host.start().await.unwrap();
        assert!(host.is_ready());
        assert!(router.index().get(host.agent_id()).is_some());

        host.shutdown().await.unwrap();
        assert!(!host.is_ready());
        assert!(router.index().get(host.agent_id()).is_none());
        assert!(dir.path().join("snapshot.json").exists());
    }
}
