//! Multi-hop query sessions
//!
//! A session walks redirects from hop to hop under a per-hop deadline until
//! some agent answers or the walk fails. When it ends, every agent on the
//! provenance chain gets one reputation sample for the session topic.

use crate::config::NodeConfig;
use crate::identity::AgentId;
use crate::observability::metrics::metrics;
use crate::protocol::messages::{
    Endpoint, FailureKind, HopTarget, Message, Outcome, PriceQuote, ReputationEntry,
    RouteRequest, RouteResult,
};
use crate::protocol::topics::TopicPath;
use crate::reputation::ReputationLedger;
use crate::routing::payment::PaymentAuthorizer;
use crate::session_span;
use crate::transport::{Transport, TransportError};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// Where a session stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Init,
    AwaitingHop,
    Answered,
    Failed(FailureKind),
    Aborted,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Answered | SessionState::Failed(_) | SessionState::Aborted
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Init => "init",
            SessionState::AwaitingHop => "awaiting_hop",
            SessionState::Answered => "answered",
            SessionState::Failed(kind) => kind.as_str(),
            SessionState::Aborted => "aborted",
        }
    }
}

/// What one hop did with the request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HopOutcome {
    Redirected,
    /// Quoted a price instead of answering
    Quoted,
    Answered,
    Failed(FailureKind),
    TimedOut,
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HopRecord {
    /// Unknown for a configured first hop that never identified itself
    pub agent_id: Option<AgentId>,
    pub endpoint: Endpoint,
    pub outcome: HopOutcome,
}

/// Final account of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub state: SessionState,
    pub result: Option<RouteResult>,
    /// Agents that handled the request, in order, ending with the terminal one
    pub provenance: Vec<AgentId>,
    pub hops: Vec<HopRecord>,
    /// Ledger entries written when the session ended
    pub feedback: Vec<ReputationEntry>,
    pub elapsed_ms: u64,
}

impl SessionReport {
    /// Answer payload, if the session produced one
    pub fn payload(&self) -> Option<&serde_json::Value> {
        match &self.result {
            Some(RouteResult::Answer { payload, .. }) => payload.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub default_ttl: u32,
    pub hop_timeout: Duration,
    pub max_hop_retries: usize,
    pub terminal_weight: f64,
    pub intermediate_weight: f64,
    /// Most the requester pays for one answer
    pub max_price: Option<u64>,
}

impl SessionSettings {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            default_ttl: config.routing.default_ttl,
            hop_timeout: Duration::from_millis(config.routing.hop_timeout_ms),
            max_hop_retries: config.routing.max_hop_retries,
            terminal_weight: config.reputation.terminal_weight,
            intermediate_weight: config.reputation.intermediate_weight,
            max_price: config.payment.max_price,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_ttl: 8,
            hop_timeout: Duration::from_millis(2000),
            max_hop_retries: 2,
            terminal_weight: 1.0,
            intermediate_weight: 0.5,
            max_price: None,
        }
    }
}

/// Hop a session is about to contact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextHop {
    pub agent_id: Option<AgentId>,
    pub endpoint: Endpoint,
}

impl From<HopTarget> for NextHop {
    fn from(target: HopTarget) -> Self {
        Self {
            agent_id: Some(target.agent_id),
            endpoint: target.endpoint,
        }
    }
}

/// Mutable state of one walk
struct Walk {
    request: RouteRequest,
    state: SessionState,
    provenance: Vec<AgentId>,
    terminal: Option<AgentId>,
    timed_out: Vec<AgentId>,
    hops: Vec<HopRecord>,
    contacted: HashSet<Endpoint>,
    retries: usize,
}

impl Walk {
    fn new(request: RouteRequest) -> Self {
        Self {
            request,
            state: SessionState::Init,
            provenance: Vec::new(),
            terminal: None,
            timed_out: Vec::new(),
            hops: Vec::new(),
            contacted: HashSet::new(),
            retries: 0,
        }
    }

    fn note(&mut self, hop: &NextHop, outcome: HopOutcome) {
        self.hops.push(HopRecord {
            agent_id: hop.agent_id.clone(),
            endpoint: hop.endpoint.clone(),
            outcome,
        });
    }

    /// Record `hop` as an intermediate that handed the request on
    fn pass_through(&mut self, hop: &NextHop) {
        if let Some(id) = &hop.agent_id {
            self.request.mark_visited(id);
            if !self.provenance.contains(id) {
                self.provenance.push(id.clone());
            }
        }
    }

    fn finish_at(&mut self, agent_id: Option<AgentId>) {
        if let Some(id) = agent_id {
            if !self.provenance.contains(&id) {
                self.provenance.push(id.clone());
            }
            self.terminal = Some(id);
        }
    }

    fn would_cycle(&self, next: &HopTarget) -> bool {
        self.request.has_visited(&next.agent_id) || self.contacted.contains(&next.endpoint)
    }
}

struct Termination {
    state: SessionState,
    result: Option<RouteResult>,
}

impl Termination {
    fn failed(kind: FailureKind, result: Option<RouteResult>) -> Self {
        Self {
            state: SessionState::Failed(kind),
            result: Some(result.unwrap_or_else(|| RouteResult::failure(kind))),
        }
    }
}

/// Resolves when `cancel` flips to true; never if its sender goes away
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Runs query sessions on behalf of this node's owner
pub struct SessionCoordinator {
    local: AgentId,
    first_hop: NextHop,
    transport: Arc<dyn Transport>,
    ledger: Arc<ReputationLedger>,
    payments: Arc<dyn PaymentAuthorizer>,
    settings: SessionSettings,
    feedback_to: Option<Endpoint>,
}

impl SessionCoordinator {
    pub fn new(
        local: AgentId,
        first_hop: NextHop,
        transport: Arc<dyn Transport>,
        ledger: Arc<ReputationLedger>,
        payments: Arc<dyn PaymentAuthorizer>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            local,
            first_hop,
            transport,
            ledger,
            payments,
            settings,
            feedback_to: None,
        }
    }

    /// Also send feedback samples to `endpoint` as `FeedbackReport`s
    pub fn with_feedback_to(mut self, endpoint: Endpoint) -> Self {
        self.feedback_to = Some(endpoint);
        self
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub async fn run(&self, topic: TopicPath, query: impl Into<String>) -> SessionReport {
        let (_keep, cancel) = watch::channel(false);
        self.run_with_cancel(topic, query, cancel).await
    }

    /// Run a session that stops as soon as `cancel` becomes true
    pub async fn run_with_cancel(
        &self,
        topic: TopicPath,
        query: impl Into<String>,
        mut cancel: watch::Receiver<bool>,
    ) -> SessionReport {
        let started = Instant::now();
        metrics().session_started();

        let request = RouteRequest::new(topic, query, self.local.clone(), self.settings.default_ttl);
        let span = session_span!(session_id = %request.session_id, topic = %request.topic);
        let mut walk = Walk::new(request);

        let end = self.drive(&mut walk, &mut cancel).instrument(span.clone()).await;
        walk.state = end.state;
        let feedback = span.in_scope(|| self.record_feedback(&walk));
        self.forward_feedback(&walk, &feedback);

        let elapsed = started.elapsed();
        metrics().session_finished(walk.state.label(), elapsed);
        span.in_scope(|| {
            info!(
                state = walk.state.label(),
                hops = walk.hops.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Session finished"
            )
        });

        SessionReport {
            session_id: walk.request.session_id,
            state: walk.state,
            result: end.result,
            provenance: walk.provenance,
            hops: walk.hops,
            feedback,
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }

    async fn drive(&self, walk: &mut Walk, cancel: &mut watch::Receiver<bool>) -> Termination {
        let mut current = self.first_hop.clone();
        let mut alternates: VecDeque<HopTarget> = VecDeque::new();

        loop {
            if *cancel.borrow() {
                return Termination {
                    state: SessionState::Aborted,
                    result: None,
                };
            }

            walk.state = SessionState::AwaitingHop;
            walk.contacted.insert(current.endpoint.clone());
            debug!(endpoint = %current.endpoint, ttl = walk.request.ttl, "Sending hop request");

            let message = Message::RouteRequest {
                request: walk.request.clone(),
            };
            let reply = tokio::select! {
                reply = self.transport.request(&current.endpoint, message, self.settings.hop_timeout) => reply,
                _ = cancelled(cancel) => {
                    return Termination { state: SessionState::Aborted, result: None };
                }
            };

            let result = match reply {
                Ok(Message::RouteResponse { result }) => result,
                Ok(Message::Rejected { kind, reason }) => {
                    warn!(endpoint = %current.endpoint, kind = %kind, reason = %reason, "Hop rejected request");
                    walk.note(&current, HopOutcome::Failed(kind));
                    return Termination::failed(kind, None);
                }
                Ok(other) => {
                    warn!(endpoint = %current.endpoint, kind = other.kind(), "Unexpected hop reply");
                    walk.note(&current, HopOutcome::Failed(FailureKind::Malformed));
                    return Termination::failed(FailureKind::Malformed, None);
                }
                Err(e) => {
                    let kind = self.hop_failed(walk, &current, &e);
                    match next_alternate(walk, &mut alternates, self.settings.max_hop_retries) {
                        Some(next) => {
                            info!(next = %next.agent_id, retry = walk.retries, "Retrying on next-ranked candidate");
                            current = next.into();
                            continue;
                        }
                        None => return Termination::failed(kind, None),
                    }
                }
            };

            match result {
                RouteResult::Redirect {
                    next,
                    alternates: fallbacks,
                } => {
                    walk.note(&current, HopOutcome::Redirected);
                    walk.pass_through(&current);
                    walk.request.ttl = walk.request.ttl.saturating_sub(1);

                    if walk.would_cycle(&next) {
                        warn!(next = %next.agent_id, "Redirect leads back to a visited agent");
                        return Termination::failed(FailureKind::Cycle, None);
                    }
                    alternates = fallbacks.into();
                    walk.request.payment = None;
                    current = next.into();
                }
                RouteResult::Answer {
                    payload: None,
                    source,
                    price: Some(price),
                } => {
                    walk.note(&current, HopOutcome::Quoted);
                    if walk.request.payment.is_some() {
                        warn!(source = %source, "Provider quoted again after payment");
                        return Termination::failed(FailureKind::Unauthorized, None);
                    }
                    if self.settings.max_price.is_some_and(|max| price.amount > max) {
                        info!(amount = price.amount, "Quoted price above limit");
                        return Termination::failed(
                            FailureKind::Unauthorized,
                            Some(RouteResult::failure_with(
                                FailureKind::Unauthorized,
                                format!("price {} {} exceeds limit", price.amount, price.currency),
                            )),
                        );
                    }

                    let quote = PriceQuote {
                        provider: source,
                        topic: walk.request.topic.clone(),
                        price,
                    };
                    match self.payments.authorize(&quote, &self.local).await {
                        Ok(proof) => {
                            metrics().payment_authorized();
                            debug!(provider = %quote.provider, "Resubmitting with payment proof");
                            walk.request.payment = Some(proof);
                        }
                        Err(declined) => {
                            info!(reason = %declined.reason, "Payment declined");
                            return Termination::failed(
                                FailureKind::Unauthorized,
                                Some(RouteResult::failure_with(
                                    FailureKind::Unauthorized,
                                    declined.reason,
                                )),
                            );
                        }
                    }
                }
                RouteResult::Answer { payload: None, .. } => {
                    walk.note(&current, HopOutcome::Failed(FailureKind::Malformed));
                    return Termination::failed(FailureKind::Malformed, None);
                }
                answer @ RouteResult::Answer { .. } => {
                    walk.note(&current, HopOutcome::Answered);
                    if let RouteResult::Answer { source, .. } = &answer {
                        walk.finish_at(Some(source.clone()));
                    }
                    return Termination {
                        state: SessionState::Answered,
                        result: Some(answer),
                    };
                }
                failure @ RouteResult::Failure { .. } => {
                    let kind = failure.failure_kind().unwrap_or(FailureKind::NoRoute);
                    walk.note(&current, HopOutcome::Failed(kind));
                    walk.finish_at(current.agent_id.clone());
                    return Termination::failed(kind, Some(failure));
                }
            }
        }
    }

    fn hop_failed(&self, walk: &mut Walk, hop: &NextHop, error: &TransportError) -> FailureKind {
        let kind = match error {
            TransportError::Timeout(_) => {
                metrics().hop_timed_out();
                walk.note(hop, HopOutcome::TimedOut);
                FailureKind::Timeout
            }
            other => {
                walk.note(hop, HopOutcome::Unreachable);
                other.failure_kind()
            }
        };
        warn!(endpoint = %hop.endpoint, error = %error, "Hop failed");
        if let Some(id) = &hop.agent_id {
            walk.request.mark_visited(id);
            walk.timed_out.push(id.clone());
        }
        kind
    }

    /// One sample per provenance agent plus one per failed hop. Sessions
    /// that were aborted or failed through the requester's fault record
    /// nothing.
    fn record_feedback(&self, walk: &Walk) -> Vec<ReputationEntry> {
        let outcome = match walk.state {
            SessionState::Answered => Outcome::Success,
            SessionState::Failed(kind) if !kind.is_requester_fault() => Outcome::Failure,
            _ => return Vec::new(),
        };
        let topic = &walk.request.topic;

        let mut samples: Vec<(&AgentId, Outcome, f64)> = walk
            .provenance
            .iter()
            .map(|id| {
                let weight = if Some(id) == walk.terminal.as_ref() {
                    self.settings.terminal_weight
                } else {
                    self.settings.intermediate_weight
                };
                (id, outcome, weight)
            })
            .collect();
        samples.extend(
            walk.timed_out
                .iter()
                .map(|id| (id, Outcome::Failure, self.settings.intermediate_weight)),
        );

        samples
            .into_iter()
            .filter(|(id, _, _)| **id != self.local)
            .filter_map(|(id, outcome, weight)| {
                match self.ledger.record(id, topic, outcome, weight) {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        warn!(agent_id = %id, error = %e, "Failed to record feedback");
                        None
                    }
                }
            })
            .collect()
    }

    fn forward_feedback(&self, walk: &Walk, feedback: &[ReputationEntry]) {
        let Some(endpoint) = self.feedback_to.clone() else {
            return;
        };
        if feedback.is_empty() {
            return;
        }
        let outcome = match walk.state {
            SessionState::Answered => Outcome::Success,
            _ => Outcome::Failure,
        };
        let reports: Vec<Message> = feedback
            .iter()
            .map(|entry| Message::FeedbackReport {
                agent_id: entry.agent_id.clone(),
                topic: entry.topic.clone(),
                outcome: if walk.timed_out.contains(&entry.agent_id) {
                    Outcome::Failure
                } else {
                    outcome
                },
            })
            .collect();

        let transport = self.transport.clone();
        let deadline = self.settings.hop_timeout;
        tokio::spawn(async move {
            for report in reports {
                if let Err(e) = transport.request(&endpoint, report, deadline).await {
                    debug!(endpoint = %endpoint, error = %e, "Feedback report not delivered");
                    break;
                }
            }
        });
    }
}

/// Next unvisited alternate, if the retry budget allows one
fn next_alternate(
    walk: &mut Walk,
    alternates: &mut VecDeque<HopTarget>,
    max_retries: usize,
) -> Option<HopTarget> {
    if walk.retries >= max_retries {
        return None;
    }
    while let Some(candidate) = alternates.pop_front() {
        if !walk.would_cycle(&candidate) {
            walk.retries += 1;
            return Some(candidate);
        }
    }
    None
}
