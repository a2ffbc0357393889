//! Capability index
//!
//! Maps topics to the agents that announced them. Holds one slot per agent:
//! either its latest signed record or the tombstone that withdrew it. Slots are
//! replaced whole, never edited, and lookups skip records past their TTL.

use crate::identity::AgentId;
use crate::protocol::messages::{AgentRecord, HopTarget, Role, Withdrawal};
use crate::protocol::topics::{TopicMatch, TopicPath};
use crate::reputation::ReputationLedger;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Result of offering a record to the index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First live record for this agent
    Inserted,
    /// Replaced an older record
    Replaced,
    /// The stored record is at least as new
    Stale,
    /// A newer tombstone hides this record
    Suppressed,
}

impl UpsertOutcome {
    /// Whether the index changed
    pub fn is_applied(&self) -> bool {
        matches!(self, UpsertOutcome::Inserted | UpsertOutcome::Replaced)
    }
}

/// What the index holds for one agent
#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryEntry {
    Live(AgentRecord),
    Withdrawn(Withdrawal),
}

/// Agent able to serve (or route towards) a topic, with its ranking inputs
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub target: HopTarget,
    pub role: Role,
    /// Confidence of the best matching descriptor
    pub confidence: f64,
    /// Ledger score for this agent on the query topic
    pub reputation: f64,
    pub topic_match: TopicMatch,
    pub refreshed_at: DateTime<Utc>,
}

impl Candidate {
    /// Composite ranking score
    pub fn score(&self) -> f64 {
        self.confidence * self.reputation
    }

    pub fn is_exact(&self) -> bool {
        self.topic_match == TopicMatch::Exact
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.target.agent_id
    }
}

/// Best first: composite score, then match specificity, then recency, then id
pub fn rank_order(a: &Candidate, b: &Candidate) -> Ordering {
    b.score()
        .total_cmp(&a.score())
        .then_with(|| b.topic_match.specificity().cmp(&a.topic_match.specificity()))
        .then_with(|| b.refreshed_at.cmp(&a.refreshed_at))
        .then_with(|| a.target.agent_id.cmp(&b.target.agent_id))
}

/// Sort candidates best first and keep `k`, never dropping an exact-topic
/// match in favour of a non-exact one
pub fn rank_and_truncate(mut candidates: Vec<Candidate>, k: usize) -> Vec<Candidate> {
    candidates.sort_by(rank_order);
    if candidates.len() <= k {
        return candidates;
    }

    let rest = candidates.split_off(k);
    let mut top = candidates;
    for exact in rest.into_iter().filter(Candidate::is_exact) {
        match top.iter().rposition(|c| !c.is_exact()) {
            Some(pos) => top[pos] = exact,
            None => break,
        }
    }
    top.sort_by(rank_order);
    top
}

/// Concurrent topic → agent index
#[derive(Debug)]
pub struct CapabilityIndex {
    slots: DashMap<AgentId, DirectoryEntry>,
    ledger: Arc<ReputationLedger>,
    ttl: Duration,
}

impl CapabilityIndex {
    pub fn new(ttl: Duration, ledger: Arc<ReputationLedger>) -> Self {
        Self {
            slots: DashMap::new(),
            ledger,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn ledger(&self) -> &Arc<ReputationLedger> {
        &self.ledger
    }

    /// Store `record` unless the index already holds something newer for the
    /// agent. Signatures are checked by the caller.
    pub fn upsert(&self, record: AgentRecord) -> UpsertOutcome {
        let agent_id = record.agent_id.clone();
        let outcome = match self.slots.entry(agent_id.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(DirectoryEntry::Live(record));
                UpsertOutcome::Inserted
            }
            Entry::Occupied(mut occupied) => match occupied.get() {
                DirectoryEntry::Live(existing) => {
                    if record.is_newer_than(existing) {
                        occupied.insert(DirectoryEntry::Live(record));
                        UpsertOutcome::Replaced
                    } else {
                        UpsertOutcome::Stale
                    }
                }
                DirectoryEntry::Withdrawn(tombstone) => {
                    if tombstone.suppresses(&record) {
                        UpsertOutcome::Suppressed
                    } else {
                        occupied.insert(DirectoryEntry::Live(record));
                        UpsertOutcome::Inserted
                    }
                }
            },
        };

        match outcome {
            UpsertOutcome::Inserted => info!(agent_id = %agent_id, "Indexed new agent record"),
            UpsertOutcome::Replaced => debug!(agent_id = %agent_id, "Refreshed agent record"),
            _ => {}
        }
        outcome
    }

    /// Store a tombstone, removing the live record it covers. Returns whether
    /// the index changed.
    pub fn withdraw(&self, withdrawal: Withdrawal) -> bool {
        let agent_id = withdrawal.agent_id.clone();
        let changed = match self.slots.entry(agent_id.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(DirectoryEntry::Withdrawn(withdrawal));
                true
            }
            Entry::Occupied(mut occupied) => {
                let replace = match occupied.get() {
                    DirectoryEntry::Live(record) => withdrawal.suppresses(record),
                    DirectoryEntry::Withdrawn(existing) => {
                        (withdrawal.withdrawn_at, &withdrawal.signature)
                            > (existing.withdrawn_at, &existing.signature)
                    }
                };
                if replace {
                    occupied.insert(DirectoryEntry::Withdrawn(withdrawal));
                }
                replace
            }
        };

        if changed {
            info!(agent_id = %agent_id, "Agent withdrawn from index");
        }
        changed
    }

    /// Live record for `agent_id`, expired or not
    pub fn get(&self, agent_id: &AgentId) -> Option<AgentRecord> {
        match self.slots.get(agent_id)?.value() {
            DirectoryEntry::Live(record) => Some(record.clone()),
            DirectoryEntry::Withdrawn(_) => None,
        }
    }

    /// Whatever the index holds for `agent_id`
    pub fn entry(&self, agent_id: &AgentId) -> Option<DirectoryEntry> {
        self.slots.get(agent_id).map(|slot| slot.value().clone())
    }

    pub fn lookup(&self, topic: &TopicPath, k: usize) -> Vec<Candidate> {
        self.lookup_excluding(topic, k, &HashSet::new())
    }

    /// Up to `k` unexpired candidates for `topic`, best first, skipping
    /// `exclude`
    pub fn lookup_excluding(
        &self,
        topic: &TopicPath,
        k: usize,
        exclude: &HashSet<AgentId>,
    ) -> Vec<Candidate> {
        if k == 0 {
            return Vec::new();
        }
        let now = Utc::now();

        let candidates: Vec<Candidate> = self
            .slots
            .iter()
            .filter_map(|slot| match slot.value() {
                DirectoryEntry::Live(record) => Some(record.clone()),
                DirectoryEntry::Withdrawn(_) => None,
            })
            .filter(|record| !exclude.contains(&record.agent_id))
            .filter(|record| !record.is_expired(now, self.ttl))
            .filter_map(|record| self.candidate_for(&record, topic))
            .collect();

        rank_and_truncate(candidates, k)
    }

    fn candidate_for(&self, record: &AgentRecord, topic: &TopicPath) -> Option<Candidate> {
        let (confidence, topic_match) = record
            .capabilities
            .iter()
            .map(|d| (d.confidence, d.topic.match_query(topic)))
            .filter(|(_, m)| m.is_match())
            .max_by(|a, b| {
                a.0.total_cmp(&b.0)
                    .then_with(|| a.1.specificity().cmp(&b.1.specificity()))
            })?;

        Some(Candidate {
            target: record.hop_target(),
            role: record.role,
            confidence,
            reputation: self.ledger.score_for(&record.agent_id, topic),
            topic_match,
            refreshed_at: record.refreshed_at,
        })
    }

    /// Purge records and tombstones older than the TTL. Returns how many
    /// slots were removed.
    pub fn expire(&self, now: DateTime<Utc>) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| match slot {
            DirectoryEntry::Live(record) => !record.is_expired(now, self.ttl),
            DirectoryEntry::Withdrawn(tombstone) => {
                now.signed_duration_since(tombstone.withdrawn_at) <= self.ttl
            }
        });
        let removed = before.saturating_sub(self.slots.len());
        if removed > 0 {
            info!(removed, remaining = self.slots.len(), "Expired directory entries");
        }
        removed
    }

    /// Snapshot of live records
    pub fn records(&self) -> Vec<AgentRecord> {
        self.slots
            .iter()
            .filter_map(|slot| match slot.value() {
                DirectoryEntry::Live(record) => Some(record.clone()),
                DirectoryEntry::Withdrawn(_) => None,
            })
            .collect()
    }

    pub fn tombstones(&self) -> Vec<Withdrawal> {
        self.slots
            .iter()
            .filter_map(|slot| match slot.value() {
                DirectoryEntry::Withdrawn(tombstone) => Some(tombstone.clone()),
                DirectoryEntry::Live(_) => None,
            })
            .collect()
    }

    /// Unexpired routers, used to grow the gossip peer set
    pub fn router_endpoints(&self) -> Vec<HopTarget> {
        let now = Utc::now();
        self.slots
            .iter()
            .filter_map(|slot| match slot.value() {
                DirectoryEntry::Live(record)
                    if record.role == Role::Router && !record.is_expired(now, self.ttl) =>
                {
                    Some(record.hop_target())
                }
                _ => None,
            })
            .collect()
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.value(), DirectoryEntry::Live(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
