//! Thread-safe metrics collection system
//!
//! Provides atomic counters and mutex-protected collections for tracking
//! routing, sessions, gossip and node lifecycle.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

const MAX_SAMPLES: usize = 1000;

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Hop resolution
    route_requests: AtomicU64,
    route_duplicates: AtomicU64,
    route_results: Mutex<HashMap<String, u64>>,
    resolve_times: Mutex<Vec<u64>>, // in milliseconds

    // Sessions
    sessions_started: AtomicU64,
    session_outcomes: Mutex<HashMap<String, u64>>,
    hop_timeouts: AtomicU64,
    payments_authorized: AtomicU64,
    session_times: Mutex<Vec<u64>>,

    // Gossip
    gossip_cycles: AtomicU64,
    gossip_pushes: AtomicU64,
    gossip_push_failures: AtomicU64,
    gossip_deltas_received: AtomicU64,
    gossip_items_applied: AtomicU64,
    gossip_items_rejected: AtomicU64,

    // Directory gauges
    index_records: AtomicU64,
    ledger_entries: AtomicU64,
    known_peers: AtomicU64,

    // Inbound messages
    messages_received: AtomicU64,
    messages_rejected: AtomicU64,

    // Lifecycle
    node_state: Mutex<String>,
    uptime_start: AtomicU64,
    state_transitions: AtomicU64,
    health_status: AtomicBool,
    last_health_check: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let now = current_timestamp();
        Self {
            route_requests: AtomicU64::new(0),
            route_duplicates: AtomicU64::new(0),
            route_results: Mutex::new(HashMap::new()),
            resolve_times: Mutex::new(Vec::new()),
            sessions_started: AtomicU64::new(0),
            session_outcomes: Mutex::new(HashMap::new()),
            hop_timeouts: AtomicU64::new(0),
            payments_authorized: AtomicU64::new(0),
            session_times: Mutex::new(Vec::new()),
            gossip_cycles: AtomicU64::new(0),
            gossip_pushes: AtomicU64::new(0),
            gossip_push_failures: AtomicU64::new(0),
            gossip_deltas_received: AtomicU64::new(0),
            gossip_items_applied: AtomicU64::new(0),
            gossip_items_rejected: AtomicU64::new(0),
            index_records: AtomicU64::new(0),
            ledger_entries: AtomicU64::new(0),
            known_peers: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_rejected: AtomicU64::new(0),
            node_state: Mutex::new("initializing".to_string()),
            uptime_start: AtomicU64::new(now),
            state_transitions: AtomicU64::new(0),
            health_status: AtomicBool::new(true),
            last_health_check: AtomicU64::new(now),
        }
    }

    // Routing metrics
    pub fn route_request_received(&self) {
        self.route_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn route_duplicate(&self) {
        self.route_duplicates.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a hop result by label (`answer`, `redirect`, failure kind...)
    pub fn route_resolved(&self, label: &str, duration: Duration) {
        bump(&self.route_results, label);
        push_sample(&self.resolve_times, duration);
    }

    // Session metrics
    pub fn session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_finished(&self, outcome: &str, duration: Duration) {
        bump(&self.session_outcomes, outcome);
        push_sample(&self.session_times, duration);
    }

    pub fn hop_timed_out(&self) {
        self.hop_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn payment_authorized(&self) {
        self.payments_authorized.fetch_add(1, Ordering::Relaxed);
    }

    // Gossip metrics
    pub fn gossip_cycle(&self) {
        self.gossip_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn gossip_push_sent(&self) {
        self.gossip_pushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn gossip_push_failed(&self) {
        self.gossip_push_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn gossip_delta_applied(&self, applied: u64, rejected: u64) {
        self.gossip_deltas_received.fetch_add(1, Ordering::Relaxed);
        self.gossip_items_applied.fetch_add(applied, Ordering::Relaxed);
        self.gossip_items_rejected
            .fetch_add(rejected, Ordering::Relaxed);
    }

    pub fn set_directory_sizes(&self, records: usize, entries: usize, peers: usize) {
        self.index_records.store(records as u64, Ordering::Relaxed);
        self.ledger_entries.store(entries as u64, Ordering::Relaxed);
        self.known_peers.store(peers as u64, Ordering::Relaxed);
    }

    // Inbound message metrics
    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_rejected(&self) {
        self.messages_rejected.fetch_add(1, Ordering::Relaxed);
    }

    // Lifecycle metrics
    pub fn set_node_state(&self, state: &str) {
        if let Ok(mut current_state) = self.node_state.lock() {
            if *current_state != state {
                self.state_transitions.fetch_add(1, Ordering::Relaxed);
                *current_state = state.to_string();
            }
        }
    }

    pub fn update_health_status(&self, healthy: bool) {
        self.health_status.store(healthy, Ordering::Relaxed);
        self.last_health_check
            .store(current_timestamp(), Ordering::Relaxed);
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.route_requests,
            &self.route_duplicates,
            &self.sessions_started,
            &self.hop_timeouts,
            &self.payments_authorized,
            &self.gossip_cycles,
            &self.gossip_pushes,
            &self.gossip_push_failures,
            &self.gossip_deltas_received,
            &self.gossip_items_applied,
            &self.gossip_items_rejected,
            &self.index_records,
            &self.ledger_entries,
            &self.known_peers,
            &self.messages_received,
            &self.messages_rejected,
            &self.state_transitions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        for map in [&self.route_results, &self.session_outcomes] {
            if let Ok(mut map) = map.lock() {
                map.clear();
            }
        }
        for samples in [&self.resolve_times, &self.session_times] {
            if let Ok(mut samples) = samples.lock() {
                samples.clear();
            }
        }
        if let Ok(mut state) = self.node_state.lock() {
            *state = "initializing".to_string();
        }
        let now = current_timestamp();
        self.uptime_start.store(now, Ordering::Relaxed);
        self.health_status.store(true, Ordering::Relaxed);
        self.last_health_check.store(now, Ordering::Relaxed);
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let resolve = latency_stats(&self.resolve_times);
        let session = latency_stats(&self.session_times);

        MetricsSnapshot {
            routing: RoutingMetrics {
                requests: self.route_requests.load(Ordering::Relaxed),
                duplicates: self.route_duplicates.load(Ordering::Relaxed),
                results: snapshot_map(&self.route_results),
                avg_resolve_time_ms: resolve.0,
                resolve_time_p50_ms: resolve.1,
                resolve_time_p95_ms: resolve.2,
                resolve_time_p99_ms: resolve.3,
            },
            sessions: SessionMetrics {
                started: self.sessions_started.load(Ordering::Relaxed),
                outcomes: snapshot_map(&self.session_outcomes),
                hop_timeouts: self.hop_timeouts.load(Ordering::Relaxed),
                payments_authorized: self.payments_authorized.load(Ordering::Relaxed),
                avg_session_time_ms: session.0,
                session_time_p95_ms: session.2,
            },
            gossip: GossipMetrics {
                cycles: self.gossip_cycles.load(Ordering::Relaxed),
                pushes: self.gossip_pushes.load(Ordering::Relaxed),
                push_failures: self.gossip_push_failures.load(Ordering::Relaxed),
                deltas_received: self.gossip_deltas_received.load(Ordering::Relaxed),
                items_applied: self.gossip_items_applied.load(Ordering::Relaxed),
                items_rejected: self.gossip_items_rejected.load(Ordering::Relaxed),
            },
            directory: DirectoryMetrics {
                index_records: self.index_records.load(Ordering::Relaxed),
                ledger_entries: self.ledger_entries.load(Ordering::Relaxed),
                known_peers: self.known_peers.load(Ordering::Relaxed),
                messages_received: self.messages_received.load(Ordering::Relaxed),
                messages_rejected: self.messages_rejected.load(Ordering::Relaxed),
            },
            lifecycle: LifecycleMetrics {
                current_state: self
                    .node_state
                    .lock()
                    .map(|s| s.clone())
                    .unwrap_or_else(|_| "unknown".to_string()),
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
                healthy: self.health_status.load(Ordering::Relaxed),
                last_health_check: self.last_health_check.load(Ordering::Relaxed),
            },
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// Public metrics structures
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub routing: RoutingMetrics,
    pub sessions: SessionMetrics,
    pub gossip: GossipMetrics,
    pub directory: DirectoryMetrics,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct RoutingMetrics {
    pub requests: u64,
    pub duplicates: u64,
    /// Results by label
    pub results: HashMap<String, u64>,
    pub avg_resolve_time_ms: f64,
    pub resolve_time_p50_ms: f64,
    pub resolve_time_p95_ms: f64,
    pub resolve_time_p99_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct SessionMetrics {
    pub started: u64,
    /// Terminal states by name
    pub outcomes: HashMap<String, u64>,
    pub hop_timeouts: u64,
    pub payments_authorized: u64,
    pub avg_session_time_ms: f64,
    pub session_time_p95_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct GossipMetrics {
    pub cycles: u64,
    pub pushes: u64,
    pub push_failures: u64,
    pub deltas_received: u64,
    pub items_applied: u64,
    pub items_rejected: u64,
}

#[derive(Debug, Serialize)]
pub struct DirectoryMetrics {
    pub index_records: u64,
    pub ledger_entries: u64,
    pub known_peers: u64,
    pub messages_received: u64,
    pub messages_rejected: u64,
}

#[derive(Debug, Serialize)]
pub struct LifecycleMetrics {
    pub current_state: String,
    pub uptime_seconds: u64,
    pub state_transitions: u64,
    pub healthy: bool,
    pub last_health_check: u64,
}

// Helper functions
fn bump(map: &Mutex<HashMap<String, u64>>, label: &str) {
    if let Ok(mut map) = map.lock() {
        *map.entry(label.to_string()).or_insert(0) += 1;
    }
}

fn push_sample(samples: &Mutex<Vec<u64>>, duration: Duration) {
    if let Ok(mut samples) = samples.lock() {
        samples.push(duration.as_millis() as u64);

        // Limit to the most recent measurements to prevent unbounded growth
        if samples.len() > MAX_SAMPLES {
            samples.remove(0);
        }
    }
}

fn snapshot_map(map: &Mutex<HashMap<String, u64>>) -> HashMap<String, u64> {
    map.lock().map(|m| m.clone()).unwrap_or_default()
}

/// (avg, p50, p95, p99)
fn latency_stats(samples: &Mutex<Vec<u64>>) -> (f64, f64, f64, f64) {
    let Ok(samples) = samples.lock() else {
        return (0.0, 0.0, 0.0, 0.0);
    };
    if samples.is_empty() {
        return (0.0, 0.0, 0.0, 0.0);
    }
    let mut sorted = samples.clone();
    sorted.sort_unstable();
    let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
    (
        avg,
        percentile(&sorted, 50.0),
        percentile(&sorted, 95.0),
        percentile(&sorted, 99.0),
    )
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_value = sorted_data[index.floor() as usize] as f64;
        let upper_value = sorted_data[index.ceil() as usize] as f64;
        lower_value + (upper_value - lower_value) * index.fract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_routing_metrics() {
        let collector = MetricsCollector::new();

        collector.route_request_received();
        collector.route_request_received();
        collector.route_resolved("redirect", Duration::from_millis(3));
        collector.route_resolved("no_route", Duration::from_millis(5));
        collector.route_duplicate();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.routing.requests, 2);
        assert_eq!(metrics.routing.duplicates, 1);
        assert_eq!(metrics.routing.results.get("redirect"), Some(&1));
        assert_eq!(metrics.routing.results.get("no_route"), Some(&1));
        assert!(metrics.routing.avg_resolve_time_ms >= 3.0);
    }

    #[test]
    fn test_session_and_gossip_metrics() {
        let collector = MetricsCollector::new();

        collector.session_started();
        collector.hop_timed_out();
        collector.session_finished("answered", Duration::from_millis(40));
        collector.gossip_cycle();
        collector.gossip_push_sent();
        collector.gossip_push_failed();
        collector.gossip_delta_applied(3, 1);

        let metrics = collector.get_metrics();
        assert_eq!(metrics.sessions.started, 1);
        assert_eq!(metrics.sessions.hop_timeouts, 1);
        assert_eq!(metrics.sessions.outcomes.get("answered"), Some(&1));
        assert_eq!(metrics.gossip.pushes, 1);
        assert_eq!(metrics.gossip.push_failures, 1);
        assert_eq!(metrics.gossip.items_applied, 3);
        assert_eq!(metrics.gossip.items_rejected, 1);
    }

    #[test]
    fn test_thread_safety() {
        let collector = Arc::new(MetricsCollector::new());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let collector = Arc::clone(&collector);
                thread::spawn(move || {
                    for _ in 0..100 {
                        collector.route_request_received();
                        collector.route_resolved("answer", Duration::from_millis(1));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let metrics = collector.get_metrics();
        assert_eq!(metrics.routing.requests, 1000);
        assert_eq!(metrics.routing.results.get("answer"), Some(&1000));
    }

    #[test]
    fn test_state_transitions() {
        let collector = MetricsCollector::new();
        collector.set_node_state("running");
        collector.set_node_state("running");
        collector.set_node_state("stopping");

        let metrics = collector.get_metrics();
        assert_eq!(metrics.lifecycle.current_state, "stopping");
        assert_eq!(metrics.lifecycle.state_transitions, 2);
    }

    #[test]
    fn test_percentile_calculation() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

        let p50 = percentile(&data, 50.0);
        let p95 = percentile(&data, 95.0);

        assert!((p50 - 5.5).abs() < 0.1, "P50: expected ~5.5, got {p50}");
        assert!((p95 - 9.5).abs() < 0.1, "P95: expected ~9.5, got {p95}");
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_reset_functionality() {
        let collector = MetricsCollector::new();

        collector.route_request_received();
        collector.session_finished("failed", Duration::from_millis(1));
        collector.set_directory_sizes(4, 9, 2);

        collector.reset();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.routing.requests, 0);
        assert!(metrics.sessions.outcomes.is_empty());
        assert_eq!(metrics.directory.index_records, 0);
        assert_eq!(metrics.lifecycle.current_state, "initializing");
    }
}
