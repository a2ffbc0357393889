//! Change log for anti-entropy
//!
//! Every change this node makes or adopts is appended under a fresh sequence
//! number. Only the latest sequence per key is kept, so a delta "everything
//! after cursor N" carries each changed key once.

use crate::identity::AgentId;
use crate::protocol::topics::TopicPath;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};

/// What changed: a directory slot or a ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChangeKey {
    Record(AgentId),
    Reputation(AgentId, TopicPath),
}

#[derive(Debug, Default)]
pub struct ChangeLog {
    last_seq: u64,
    by_seq: BTreeMap<u64, ChangeKey>,
    by_key: HashMap<ChangeKey, u64>,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a change and return its sequence number
    ///
    /// Sequences follow the wall clock in microseconds when it is ahead of the
    /// log, so they keep increasing across restarts.
    pub fn append(&mut self, key: ChangeKey) -> u64 {
        let clock = u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0);
        let seq = clock.max(self.last_seq + 1);
        self.last_seq = seq;

        if let Some(previous) = self.by_key.insert(key.clone(), seq) {
            self.by_seq.remove(&previous);
        }
        self.by_seq.insert(seq, key);
        seq
    }

    /// Up to `limit` changes with sequence above `cursor`, oldest first
    pub fn since(&self, cursor: u64, limit: usize) -> Vec<(u64, ChangeKey)> {
        self.by_seq
            .range(cursor.saturating_add(1)..)
            .take(limit)
            .map(|(seq, key)| (*seq, key.clone()))
            .collect()
    }

    /// Drop keys for which `keep` is false; returns how many were dropped
    pub fn retain(&mut self, mut keep: impl FnMut(&ChangeKey) -> bool) -> usize {
        let mut dropped = Vec::new();
        self.by_seq.retain(|_, key| {
            let kept = keep(key);
            if !kept {
                dropped.push(key.clone());
            }
            kept
        });
        for key in &dropped {
            self.by_key.remove(key);
        }
        dropped.len()
    }

    /// Highest sequence handed out so far
    pub fn head(&self) -> u64 {
        self.last_seq
    }

    /// Distinct keys currently tracked
    pub fn len(&self) -> usize {
        self.by_seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_seq.is_empty()
    }
}
