//! Reputation ledger
//!
//! Keeps an exponentially weighted moving average of interaction outcomes per
//! (agent, topic). Entries replicate between routers by last-write-wins on
//! `updated_at`; local decay pulls idle scores back toward the neutral prior
//! without touching `updated_at`, so a decayed entry never out-votes a real
//! observation made elsewhere.

use crate::config::ReputationSection;
use crate::identity::AgentId;
use crate::protocol::messages::{timestamp_now, Outcome, ReputationEntry};
use crate::protocol::topics::TopicPath;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::cmp::Ordering;
use thiserror::Error;
use tracing::{debug, trace};

/// Ledger key
pub type ReputationKey = (AgentId, TopicPath);

#[derive(Debug, Error, PartialEq)]
pub enum ReputationError {
    #[error("Feedback weight must be finite, got {0}")]
    NonFiniteWeight(f64),
}

/// EWMA parameters
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerSettings {
    pub alpha: f64,
    pub neutral: f64,
    pub half_life: Duration,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self::from(&ReputationSection::default())
    }
}

impl From<&ReputationSection> for LedgerSettings {
    fn from(section: &ReputationSection) -> Self {
        Self {
            alpha: section.alpha,
            neutral: section.neutral,
            half_life: section.decay_half_life(),
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    entry: ReputationEntry,
    /// Local only: when decay was last applied
    decayed_at: DateTime<Utc>,
}

/// Whether `a` replaces `b` under last-write-wins. Equal timestamps fall back
/// to sample count and then score so every replica picks the same winner.
fn supersedes(a: &ReputationEntry, b: &ReputationEntry) -> bool {
    a.updated_at
        .cmp(&b.updated_at)
        .then(a.samples.cmp(&b.samples))
        .then(a.score.total_cmp(&b.score))
        == Ordering::Greater
}

/// Concurrent per-(agent, topic) trust scores
#[derive(Debug, Default)]
pub struct ReputationLedger {
    entries: DashMap<ReputationKey, Slot>,
    settings: LedgerSettings,
}

impl ReputationLedger {
    pub fn new(settings: LedgerSettings) -> Self {
        Self {
            entries: DashMap::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &LedgerSettings {
        &self.settings
    }

    /// Fold one observation into the (agent, topic) score
    ///
    /// `weight` scales the smoothing factor: `α' = clamp(α·weight, 0, 1)`.
    pub fn record(
        &self,
        agent: &AgentId,
        topic: &TopicPath,
        outcome: Outcome,
        weight: f64,
    ) -> Result<ReputationEntry, ReputationError> {
        if !weight.is_finite() {
            return Err(ReputationError::NonFiniteWeight(weight));
        }
        let alpha = (self.settings.alpha * weight).clamp(0.0, 1.0);
        let now = timestamp_now();

        let updated = match self.entries.entry((agent.clone(), topic.clone())) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                let entry = &mut slot.entry;
                entry.score = ewma(entry.score, outcome.value(), alpha);
                entry.samples += 1;
                entry.updated_at = later_than(entry.updated_at, now);
                slot.decayed_at = entry.updated_at;
                entry.clone()
            }
            Entry::Vacant(vacant) => {
                let entry = ReputationEntry {
                    agent_id: agent.clone(),
                    topic: topic.clone(),
                    score: ewma(self.settings.neutral, outcome.value(), alpha),
                    samples: 1,
                    updated_at: now,
                };
                vacant.insert(Slot {
                    entry: entry.clone(),
                    decayed_at: now,
                });
                entry
            }
        };

        trace!(
            agent_id = %agent,
            topic = %topic,
            outcome = ?outcome,
            weight,
            score = updated.score,
            "Recorded reputation sample"
        );
        Ok(updated)
    }

    /// Score of the exact (agent, topic) entry, or the neutral prior
    pub fn get(&self, agent: &AgentId, topic: &TopicPath) -> f64 {
        self.entries
            .get(&(agent.clone(), topic.clone()))
            .map(|slot| slot.entry.score)
            .unwrap_or(self.settings.neutral)
    }

    /// Score used for ranking: the exact entry, else the nearest ancestor
    /// topic with an entry, else the neutral prior
    pub fn score_for(&self, agent: &AgentId, topic: &TopicPath) -> f64 {
        std::iter::once(topic.clone())
            .chain(topic.ancestors())
            .find_map(|t| {
                self.entries
                    .get(&(agent.clone(), t))
                    .map(|slot| slot.entry.score)
            })
            .unwrap_or(self.settings.neutral)
    }

    pub fn entry(&self, key: &ReputationKey) -> Option<ReputationEntry> {
        self.entries.get(key).map(|slot| slot.entry.clone())
    }

    /// Pull every score toward neutral by the time elapsed since it last
    /// changed or decayed. Returns the number of entries touched.
    pub fn decay(&self, now: DateTime<Utc>) -> usize {
        let half_life = self.settings.half_life.num_milliseconds() as f64;
        if half_life <= 0.0 {
            return 0;
        }

        let mut touched = 0;
        for mut slot in self.entries.iter_mut() {
            let since = slot.entry.updated_at.max(slot.decayed_at);
            let elapsed = now.signed_duration_since(since).num_milliseconds();
            if elapsed <= 0 {
                continue;
            }
            let factor = 0.5_f64.powf(elapsed as f64 / half_life);
            let neutral = self.settings.neutral;
            slot.entry.score = (neutral + (slot.entry.score - neutral) * factor).clamp(0.0, 1.0);
            slot.decayed_at = now;
            touched += 1;
        }

        if touched > 0 {
            debug!(entries = touched, "Decayed reputation scores");
        }
        touched
    }

    /// Adopt remote entries that are strictly newer than the local ones.
    /// Returns the keys that changed.
    pub fn merge<I>(&self, entries: I) -> Vec<ReputationKey>
    where
        I: IntoIterator<Item = ReputationEntry>,
    {
        let mut adopted = Vec::new();
        for remote in entries {
            if remote.validate().is_err() {
                continue;
            }
            let key = (remote.agent_id.clone(), remote.topic.clone());
            match self.entries.entry(key.clone()) {
                Entry::Occupied(mut occupied) => {
                    if supersedes(&remote, &occupied.get().entry) {
                        let decayed_at = remote.updated_at;
                        occupied.insert(Slot {
                            entry: remote,
                            decayed_at,
                        });
                        adopted.push(key);
                    }
                }
                Entry::Vacant(vacant) => {
                    let decayed_at = remote.updated_at;
                    vacant.insert(Slot {
                        entry: remote,
                        decayed_at,
                    });
                    adopted.push(key);
                }
            }
        }
        adopted
    }

    /// Snapshot of every entry
    pub fn entries(&self) -> Vec<ReputationEntry> {
        self.entries
            .iter()
            .map(|slot| slot.entry.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn ewma(old: f64, target: f64, alpha: f64) -> f64 {
    (old * (1.0 - alpha) + target * alpha).clamp(0.0, 1.0)
}

/// `now`, or one millisecond after `previous` if the clock has not moved on
fn later_than(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    if now > previous {
        now
    } else {
        previous + Duration::milliseconds(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeIdentity;
    use proptest::prelude::*;

    fn agent(seed: u8) -> AgentId {
        NodeIdentity::from_seed(&[seed; 32]).agent_id().clone()
    }

    fn topic(s: &str) -> TopicPath {
        TopicPath::parse(s).unwrap()
    }

    #[test]
    fn test_unseen_agent_gets_neutral_prior() {
        let ledger = ReputationLedger::default();
        assert_eq!(ledger.get(&agent(1), &topic("a/b")), 0.5);
        assert_eq!(ledger.score_for(&agent(1), &topic("a/b")), 0.5);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_record_moves_score_by_alpha() {
        let ledger = ReputationLedger::default();
        let a = agent(1);
        let t = topic("restaurants/vegan");

        let entry = ledger.record(&a, &t, Outcome::Success, 1.0).unwrap();
        assert!((entry.score - 0.6).abs() < 1e-9);
        assert_eq!(entry.samples, 1);

        let entry = ledger.record(&a, &t, Outcome::Failure, 1.0).unwrap();
        assert!((entry.score - 0.48).abs() < 1e-9);
        assert_eq!(entry.samples, 2);
    }

    #[test]
    fn test_weight_scales_alpha() {
        let ledger = ReputationLedger::default();
        let t = topic("a");

        let half = ledger.record(&agent(1), &t, Outcome::Success, 0.5).unwrap();
        assert!((half.score - 0.55).abs() < 1e-9);

        let zero = ledger.record(&agent(2), &t, Outcome::Success, 0.0).unwrap();
        assert!((zero.score - 0.5).abs() < 1e-9);

        let huge = ledger.record(&agent(3), &t, Outcome::Success, 100.0).unwrap();
        assert!((huge.score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_non_finite_weight_rejected() {
        let ledger = ReputationLedger::default();
        let result = ledger.record(&agent(1), &topic("a"), Outcome::Success, f64::NAN);
        assert!(matches!(result, Err(ReputationError::NonFiniteWeight(_))));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_updated_at_strictly_increases() {
        let ledger = ReputationLedger::default();
        let a = agent(1);
        let t = topic("a");
        let mut last = ledger.record(&a, &t, Outcome::Success, 1.0).unwrap().updated_at;
        for _ in 0..20 {
            let next = ledger.record(&a, &t, Outcome::Success, 1.0).unwrap().updated_at;
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn test_score_for_falls_back_to_ancestor() {
        let ledger = ReputationLedger::default();
        let a = agent(1);
        ledger
            .record(&a, &topic("restaurants"), Outcome::Success, 1.0)
            .unwrap();

        let fallback = ledger.score_for(&a, &topic("restaurants/vegan/city42"));
        assert!((fallback - 0.6).abs() < 1e-9);
        assert_eq!(ledger.get(&a, &topic("restaurants/vegan/city42")), 0.5);
    }

    #[test]
    fn test_decay_halves_distance_to_neutral() {
        let ledger = ReputationLedger::new(LedgerSettings {
            alpha: 1.0,
            neutral: 0.5,
            half_life: Duration::seconds(100),
        });
        let a = agent(1);
        let t = topic("a");
        let entry = ledger.record(&a, &t, Outcome::Success, 1.0).unwrap();
        assert_eq!(entry.score, 1.0);

        let touched = ledger.decay(entry.updated_at + Duration::seconds(100));
        assert_eq!(touched, 1);
        assert!((ledger.get(&a, &t) - 0.75).abs() < 1e-9);

        // Decay is measured from the previous decay, not from updated_at
        ledger.decay(entry.updated_at + Duration::seconds(200));
        assert!((ledger.get(&a, &t) - 0.625).abs() < 1e-9);

        let stored = ledger.entry(&(a, t)).unwrap();
        assert_eq!(stored.updated_at, entry.updated_at);
    }

    #[test]
    fn test_merge_is_last_write_wins() {
        let ledger = ReputationLedger::default();
        let a = agent(1);
        let t = topic("a");
        let local = ledger.record(&a, &t, Outcome::Success, 1.0).unwrap();

        let older = ReputationEntry {
            score: 0.1,
            updated_at: local.updated_at - Duration::seconds(5),
            ..local.clone()
        };
        assert!(ledger.merge(vec![older]).is_empty());
        assert_eq!(ledger.get(&a, &t), local.score);

        let newer = ReputationEntry {
            score: 0.9,
            samples: 7,
            updated_at: local.updated_at + Duration::seconds(5),
            ..local.clone()
        };
        let adopted = ledger.merge(vec![newer.clone()]);
        assert_eq!(adopted, vec![(a.clone(), t.clone())]);
        assert_eq!(ledger.entry(&(a, t)).unwrap(), newer);

        // Re-delivery changes nothing
        assert!(ledger.merge(vec![newer]).is_empty());
    }

    #[test]
    fn test_decayed_entry_does_not_outvote_remote() {
        let ledger = ReputationLedger::default();
        let a = agent(1);
        let t = topic("a");
        let local = ledger.record(&a, &t, Outcome::Success, 1.0).unwrap();
        ledger.decay(local.updated_at + Duration::days(30));

        let remote = ReputationEntry {
            score: 0.2,
            updated_at: local.updated_at + Duration::seconds(1),
            ..local
        };
        assert_eq!(ledger.merge(vec![remote]).len(), 1);
        assert!((ledger.get(&a, &t) - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_merge_skips_out_of_range_scores() {
        let ledger = ReputationLedger::default();
        let bad = ReputationEntry {
            agent_id: agent(1),
            topic: topic("a"),
            score: 1.5,
            samples: 1,
            updated_at: timestamp_now(),
        };
        assert!(ledger.merge(vec![bad]).is_empty());
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_merge_tie_break_converges() {
        let now = timestamp_now();
        let a = ReputationEntry {
            agent_id: agent(1),
            topic: topic("a"),
            score: 0.7,
            samples: 3,
            updated_at: now,
        };
        let b = ReputationEntry {
            score: 0.4,
            ..a.clone()
        };

        let left = ReputationLedger::default();
        left.merge(vec![a.clone(), b.clone()]);
        let right = ReputationLedger::default();
        right.merge(vec![b, a]);

        assert_eq!(left.entries(), right.entries());
    }

    fn outcome_strategy() -> impl Strategy<Value = Outcome> {
        prop_oneof![
            Just(Outcome::Success),
            Just(Outcome::PartialSuccess),
            Just(Outcome::Failure),
        ]
    }

    proptest! {
        #[test]
        fn prop_scores_stay_in_unit_interval(
            samples in prop::collection::vec((outcome_strategy(), -10.0f64..10.0), 1..64),
            decay_secs in prop::collection::vec(0i64..10_000_000, 0..4),
        ) {
            let ledger = ReputationLedger::default();
            let a = agent(1);
            let t = topic("a/b");
            for (outcome, weight) in samples {
                let entry = ledger.record(&a, &t, outcome, weight).unwrap();
                prop_assert!((0.0..=1.0).contains(&entry.score));
            }
            let base = timestamp_now();
            for secs in decay_secs {
                ledger.decay(base + Duration::seconds(secs));
                let score = ledger.get(&a, &t);
                prop_assert!((0.0..=1.0).contains(&score));
            }
        }
    }
}
