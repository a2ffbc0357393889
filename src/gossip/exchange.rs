//! Push anti-entropy between routers
//!
//! Each cycle pushes to a random `fanout` subset of peers every change newer
//! than what that peer last acknowledged. Receivers verify items one by one,
//! apply what is newer than their local state and log the adopted changes so
//! they travel on. Deltas are cumulative from the acknowledged cursor, so a
//! lost push is repaired by the next one.

use super::log::{ChangeKey, ChangeLog};
use super::peers::PeerSet;
use crate::agent::index::{CapabilityIndex, DirectoryEntry};
use crate::config::GossipSection;
use crate::gossip_span;
use crate::identity::AgentId;
use crate::observability::metrics::metrics;
use crate::protocol::messages::{Endpoint, GossipDelta, Message};
use crate::protocol::topics::TopicPath;
use crate::reputation::ReputationLedger;
use crate::transport::{Transport, TransportError};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn, Instrument};

#[derive(Debug, Error)]
pub enum GossipError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Peer rejected delta: {0}")]
    Rejected(String),
    #[error("Unexpected reply to gossip push: {0}")]
    UnexpectedReply(&'static str),
}

#[derive(Debug, Clone)]
pub struct GossipSettings {
    pub interval: Duration,
    pub fanout: usize,
    pub max_delta_items: usize,
    /// Deadline of one push
    pub push_timeout: Duration,
}

impl From<&GossipSection> for GossipSettings {
    fn from(section: &GossipSection) -> Self {
        Self {
            interval: Duration::from_millis(section.interval_ms),
            fanout: section.fanout,
            max_delta_items: section.max_delta_items,
            push_timeout: Duration::from_millis(section.interval_ms.clamp(250, 5000)),
        }
    }
}

impl Default for GossipSettings {
    fn default() -> Self {
        Self::from(&GossipSection::default())
    }
}

/// Outcome of applying one inbound delta
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub origin: AgentId,
    pub seq: u64,
    /// Items that changed local state
    pub applied: usize,
    /// Items that failed verification
    pub rejected: usize,
    /// The delta assumed state this node no longer has
    pub resync: bool,
}

impl ApplyReport {
    /// Acknowledgement for the sender. A resync acknowledges sequence 0 so
    /// the sender starts over from the beginning of its log.
    pub fn ack(&self) -> Message {
        Message::GossipAck {
            origin: self.origin.clone(),
            seq: if self.resync { 0 } else { self.seq },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub pushed: usize,
    /// Sampled peers that were already up to date
    pub idle: usize,
    pub failed: usize,
}

/// Gossip state of one node
pub struct GossipExchange {
    local: AgentId,
    index: Arc<CapabilityIndex>,
    ledger: Arc<ReputationLedger>,
    transport: Arc<dyn Transport>,
    peers: PeerSet,
    log: Mutex<ChangeLog>,
    /// Highest own sequence each peer acknowledged
    acked: DashMap<Endpoint, u64>,
    /// Highest sequence received from each origin
    received: DashMap<AgentId, u64>,
    settings: GossipSettings,
}

impl GossipExchange {
    pub fn new(
        local: AgentId,
        index: Arc<CapabilityIndex>,
        transport: Arc<dyn Transport>,
        peers: PeerSet,
        settings: GossipSettings,
    ) -> Self {
        let ledger = index.ledger().clone();
        Self {
            local,
            index,
            ledger,
            transport,
            peers,
            log: Mutex::new(ChangeLog::new()),
            acked: DashMap::new(),
            received: DashMap::new(),
            settings,
        }
    }

    fn log(&self) -> MutexGuard<'_, ChangeLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn index(&self) -> &Arc<CapabilityIndex> {
        &self.index
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    pub fn settings(&self) -> &GossipSettings {
        &self.settings
    }

    /// Log a directory change for propagation
    pub fn note_record(&self, agent_id: &AgentId) -> u64 {
        self.log().append(ChangeKey::Record(agent_id.clone()))
    }

    /// Log a ledger change for propagation
    pub fn note_reputation(&self, agent_id: &AgentId, topic: &TopicPath) -> u64 {
        self.log()
            .append(ChangeKey::Reputation(agent_id.clone(), topic.clone()))
    }

    /// Log everything currently held, so restored state reaches peers again
    pub fn seed_from_state(&self) -> usize {
        let mut keys: Vec<ChangeKey> = self
            .index
            .records()
            .into_iter()
            .map(|r| ChangeKey::Record(r.agent_id))
            .collect();
        keys.extend(
            self.index
                .tombstones()
                .into_iter()
                .map(|w| ChangeKey::Record(w.agent_id)),
        );
        keys.extend(
            self.ledger
                .entries()
                .into_iter()
                .map(|e| ChangeKey::Reputation(e.agent_id, e.topic)),
        );

        let mut log = self.log();
        let count = keys.len();
        for key in keys {
            log.append(key);
        }
        count
    }

    pub fn acked_cursor(&self, peer: &Endpoint) -> u64 {
        self.acked.get(peer).map(|seq| *seq).unwrap_or(0)
    }

    pub fn received_cursor(&self, origin: &AgentId) -> Option<u64> {
        self.received.get(origin).map(|seq| *seq)
    }

    /// Forget log keys whose directory slot or ledger entry is gone
    pub fn prune_log(&self) -> usize {
        let pruned = self.log().retain(|key| match key {
            ChangeKey::Record(agent_id) => self.index.entry(agent_id).is_some(),
            ChangeKey::Reputation(agent_id, topic) => self
                .ledger
                .entry(&(agent_id.clone(), topic.clone()))
                .is_some(),
        });
        if pruned > 0 {
            debug!(pruned, "Pruned gossip change log");
        }
        pruned
    }

    /// Advance a peer's cursor; never moves it backwards
    pub fn acknowledge(&self, peer: &Endpoint, seq: u64) {
        self.acked
            .entry(peer.clone())
            .and_modify(|cursor| *cursor = (*cursor).max(seq))
            .or_insert(seq);
    }

    /// Changes `peer` has not acknowledged, read from the live structures.
    /// `None` when the peer is up to date.
    pub fn build_delta(&self, peer: &Endpoint) -> Option<GossipDelta> {
        let since = self.acked_cursor(peer);
        let changes = self.log().since(since, self.settings.max_delta_items);
        let seq = changes.last()?.0;

        let now = Utc::now();
        let ttl = self.index.ttl();
        let mut delta = GossipDelta {
            origin: self.local.clone(),
            seq,
            since,
            records: Vec::new(),
            tombstones: Vec::new(),
            entries: Vec::new(),
        };
        for (_, key) in changes {
            match key {
                ChangeKey::Record(agent_id) => match self.index.entry(&agent_id) {
                    Some(DirectoryEntry::Live(record)) if !record.is_expired(now, ttl) => {
                        delta.records.push(record)
                    }
                    Some(DirectoryEntry::Withdrawn(tombstone)) => delta.tombstones.push(tombstone),
                    _ => {}
                },
                ChangeKey::Reputation(agent_id, topic) => {
                    if let Some(entry) = self.ledger.entry(&(agent_id, topic)) {
                        delta.entries.push(entry);
                    }
                }
            }
        }
        Some(delta)
    }

    /// Verify and apply an inbound delta
    pub fn apply_delta(&self, delta: GossipDelta) -> ApplyReport {
        let mut applied = 0;
        let mut rejected = 0;
        // A continuation from an origin we have never heard from: we lost
        // what it sent before (restart without snapshot)
        let resync = delta.since > 0 && self.received_cursor(&delta.origin).is_none();
        if resync {
            info!(origin = %delta.origin, since = delta.since, "Requesting full resend from gossip peer");
        }

        for record in delta.records {
            if let Err(e) = record.verify() {
                warn!(origin = %delta.origin, agent_id = %record.agent_id, error = %e, "Rejected gossiped record");
                rejected += 1;
                continue;
            }
            let agent_id = record.agent_id.clone();
            if self.index.upsert(record).is_applied() {
                self.note_record(&agent_id);
                applied += 1;
            }
        }

        for tombstone in delta.tombstones {
            if let Err(e) = tombstone.verify() {
                warn!(origin = %delta.origin, agent_id = %tombstone.agent_id, error = %e, "Rejected gossiped withdrawal");
                rejected += 1;
                continue;
            }
            let agent_id = tombstone.agent_id.clone();
            if self.index.withdraw(tombstone) {
                self.note_record(&agent_id);
                applied += 1;
            }
        }

        let (valid, invalid): (Vec<_>, Vec<_>) = delta
            .entries
            .into_iter()
            .partition(|entry| entry.validate().is_ok());
        if !invalid.is_empty() {
            warn!(origin = %delta.origin, count = invalid.len(), "Rejected out-of-range reputation entries");
            rejected += invalid.len();
        }
        for (agent_id, topic) in self.ledger.merge(valid) {
            self.note_reputation(&agent_id, &topic);
            applied += 1;
        }

        self.received
            .entry(delta.origin.clone())
            .and_modify(|cursor| *cursor = (*cursor).max(delta.seq))
            .or_insert(delta.seq);

        metrics().gossip_delta_applied(applied as u64, rejected as u64);
        debug!(origin = %delta.origin, seq = delta.seq, applied, rejected, "Applied gossip delta");

        ApplyReport {
            origin: delta.origin,
            seq: delta.seq,
            applied,
            rejected,
            resync,
        }
    }

    /// Push pending changes to one peer. `Ok(false)` when it was up to date.
    pub async fn push_to(&self, peer: &Endpoint) -> Result<bool, GossipError> {
        let Some(delta) = self.build_delta(peer) else {
            return Ok(false);
        };
        let items = delta.item_count();
        let reply = self
            .transport
            .request(peer, Message::GossipPush { delta }, self.settings.push_timeout)
            .await?;

        match reply {
            Message::GossipAck { seq, .. } if seq < self.acked_cursor(peer) => {
                info!(peer = %peer, seq, "Peer lost gossip state, rewinding its cursor");
                self.acked.insert(peer.clone(), seq);
                Ok(true)
            }
            Message::GossipAck { seq, .. } => {
                self.acknowledge(peer, seq);
                metrics().gossip_push_sent();
                debug!(peer = %peer, seq, items, "Gossip push acknowledged");
                Ok(true)
            }
            Message::Rejected { reason, .. } => Err(GossipError::Rejected(reason)),
            other => Err(GossipError::UnexpectedReply(other.kind())),
        }
    }

    /// One gossip round: refresh peers from the index, then push to a random
    /// sample of them
    pub async fn run_cycle(&self) -> CycleReport {
        metrics().gossip_cycle();
        self.peers
            .extend_from_routers(&self.index.router_endpoints(), &self.local);

        let mut report = CycleReport::default();
        for peer in self.peers.sample(self.settings.fanout) {
            match self.push_to(&peer).await {
                Ok(true) => report.pushed += 1,
                Ok(false) => report.idle += 1,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Gossip push failed, skipping peer this cycle");
                    metrics().gossip_push_failed();
                    report.failed += 1;
                }
            }
        }

        metrics().set_directory_sizes(self.index.len(), self.ledger.len(), self.peers.len());
        report
    }

    /// Run gossip rounds every `interval` on a background task until
    /// `shutdown` flips to true
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_ms = self.settings.interval.as_millis() as u64,
                fanout = self.settings.fanout,
                "Gossip loop started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let span = gossip_span!(node = %self.local.short(), peers = self.peers.len());
                        let report = self.run_cycle().instrument(span).await;
                        if report.failed > 0 {
                            debug!(?report, "Gossip cycle finished with failures");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Gossip loop stopped");
        })
    }
}
