//! Single-hop resolution
//!
//! [`RoutingEngine::resolve`] decides what the agent holding a request does
//! with it: answer from a local capability, quote a price, redirect to the
//! best-ranked agent it knows, or fail. It never contacts other agents; the
//! session coordinator on the requester's side walks the redirects.

use crate::agent::answer::{AnswerEngine, AnswerOutcome};
use crate::agent::index::{rank_order, Candidate, CapabilityIndex};
use crate::config::RoutingSection;
use crate::identity::AgentId;
use crate::observability::metrics::metrics;
use crate::protocol::messages::{
    CapabilityDescriptor, FailureKind, Price, PriceQuote, RouteRequest, RouteResult,
};
use crate::protocol::topics::TopicPath;
use crate::route_span;
use crate::routing::payment::PaymentAuthorizer;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// How long a resolved hop is replayed to duplicate requests
const DEDUP_WINDOW: Duration = Duration::from_secs(60);

/// Anything that can list routing candidates for a topic
pub trait CandidateSource: Send + Sync {
    /// Up to `k` candidates for `topic`, skipping `exclude`
    fn candidates(&self, topic: &TopicPath, k: usize, exclude: &HashSet<AgentId>)
        -> Vec<Candidate>;
}

impl CandidateSource for CapabilityIndex {
    fn candidates(
        &self,
        topic: &TopicPath,
        k: usize,
        exclude: &HashSet<AgentId>,
    ) -> Vec<Candidate> {
        self.lookup_excluding(topic, k, exclude)
    }
}

#[derive(Debug, Clone)]
pub struct RoutingSettings {
    pub lookup_k: usize,
    /// Minimum local confidence to answer instead of redirecting
    pub confidence_threshold: f64,
    /// Alternates attached to a redirect
    pub max_alternates: usize,
    pub dedup_capacity: usize,
}

impl From<&RoutingSection> for RoutingSettings {
    fn from(section: &RoutingSection) -> Self {
        Self {
            lookup_k: section.lookup_k,
            confidence_threshold: section.confidence_threshold,
            max_alternates: section.max_hop_retries,
            dedup_capacity: section.dedup_capacity,
        }
    }
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self::from(&RoutingSection::default())
    }
}

/// Everything that makes two requests the same request. Two deliveries
/// only share a result when they agree on all of it, proof token included.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RequestKey {
    session_id: Uuid,
    topic: TopicPath,
    query: String,
    requester: AgentId,
    ttl: u32,
    visited: Vec<AgentId>,
    proof: Option<(AgentId, String)>,
}

impl RequestKey {
    fn of(request: &RouteRequest) -> Self {
        Self {
            session_id: request.session_id,
            topic: request.topic.clone(),
            query: request.query.clone(),
            requester: request.requester.clone(),
            ttl: request.ttl,
            visited: request.visited.clone(),
            proof: request
                .payment
                .as_ref()
                .map(|proof| (proof.payer.clone(), proof.token.clone())),
        }
    }
}

/// Per-node hop resolver
pub struct RoutingEngine {
    local: AgentId,
    capabilities: Vec<CapabilityDescriptor>,
    source: Arc<dyn CandidateSource>,
    answers: Arc<dyn AnswerEngine>,
    payments: Arc<dyn PaymentAuthorizer>,
    settings: RoutingSettings,
    /// Recently resolved requests, replayed to duplicates
    recent: DashMap<RequestKey, (Instant, RouteResult)>,
}

impl RoutingEngine {
    pub fn new(
        local: AgentId,
        capabilities: Vec<CapabilityDescriptor>,
        source: Arc<dyn CandidateSource>,
        answers: Arc<dyn AnswerEngine>,
        payments: Arc<dyn PaymentAuthorizer>,
        settings: RoutingSettings,
    ) -> Self {
        Self {
            local,
            capabilities,
            source,
            answers,
            payments,
            settings,
            recent: DashMap::new(),
        }
    }

    pub fn local_id(&self) -> &AgentId {
        &self.local
    }

    pub fn capabilities(&self) -> &[CapabilityDescriptor] {
        &self.capabilities
    }

    /// Resolve one hop of `request` at this agent
    pub async fn resolve(&self, request: &RouteRequest) -> RouteResult {
        let started = Instant::now();
        metrics().route_request_received();

        if request.has_visited(&self.local) {
            debug!(session_id = %request.session_id, "Request already passed through this agent");
            let result = RouteResult::failure(FailureKind::Cycle);
            metrics().route_resolved(result.label(), started.elapsed());
            return result;
        }

        let key = RequestKey::of(request);
        if let Some(result) = self.replay(&key, request) {
            debug!(session_id = %request.session_id, "Replaying result for duplicate request");
            metrics().route_duplicate();
            return result;
        }

        let span = route_span!(
            session_id = %request.session_id,
            topic = %request.topic,
            ttl = request.ttl,
        );
        let result = self.resolve_uncached(request).instrument(span).await;

        self.remember(key, result.clone());
        metrics().route_resolved(result.label(), started.elapsed());
        result
    }

    /// Drop replayable results older than the dedup window
    pub fn evict_stale_results(&self) -> usize {
        let before = self.recent.len();
        self.recent.retain(|_, (at, _)| at.elapsed() < DEDUP_WINDOW);
        before.saturating_sub(self.recent.len())
    }

    /// Cached result for a duplicate of `request`. A paid answer is only
    /// replayed while the request's proof still verifies.
    fn replay(&self, key: &RequestKey, request: &RouteRequest) -> Option<RouteResult> {
        let result = self
            .recent
            .get(key)
            .filter(|cached| cached.0.elapsed() < DEDUP_WINDOW)
            .map(|cached| cached.1.clone())?;

        if let RouteResult::Answer {
            payload: Some(_),
            price: Some(price),
            ..
        } = &result
        {
            let quote = self.quote(&request.topic, price);
            let paid = request
                .payment
                .as_ref()
                .is_some_and(|proof| self.payments.verify(proof, &quote));
            if !paid {
                return None;
            }
        }
        Some(result)
    }

    fn remember(&self, key: RequestKey, result: RouteResult) {
        let capacity = self.settings.dedup_capacity;
        if capacity == 0 {
            return;
        }
        if self.recent.len() >= capacity && self.evict_stale_results() == 0 {
            return;
        }
        self.recent.insert(key, (Instant::now(), result));
    }

    fn quote(&self, topic: &TopicPath, price: &Price) -> PriceQuote {
        PriceQuote {
            provider: self.local.clone(),
            topic: topic.clone(),
            price: price.clone(),
        }
    }

    async fn resolve_uncached(&self, request: &RouteRequest) -> RouteResult {
        if let Some(descriptor) = self.local_match(&request.topic) {
            if let Some(result) = self.answer_locally(descriptor, request).await {
                return result;
            }
        }

        if request.ttl <= 1 {
            debug!(ttl = request.ttl, "No hop budget left for a redirect");
            return RouteResult::failure(FailureKind::HopBudgetExceeded);
        }

        let mut exclude: HashSet<AgentId> = request.visited.iter().cloned().collect();
        exclude.insert(self.local.clone());
        exclude.insert(request.requester.clone());

        let mut candidates = self
            .source
            .candidates(&request.topic, self.settings.lookup_k, &exclude);
        candidates.retain(|c| !exclude.contains(c.agent_id()));
        candidates.sort_by(rank_order);

        let mut ranked = candidates.into_iter().map(|c| c.target);
        match ranked.next() {
            Some(next) => {
                let alternates: Vec<_> = ranked.take(self.settings.max_alternates).collect();
                info!(
                    next = %next.agent_id,
                    alternates = alternates.len(),
                    "Redirecting request"
                );
                RouteResult::Redirect { next, alternates }
            }
            None => {
                info!(topic = %request.topic, "No route for topic");
                RouteResult::failure(FailureKind::NoRoute)
            }
        }
    }

    /// Best local descriptor that directly matches `topic` with enough
    /// confidence
    fn local_match(&self, topic: &TopicPath) -> Option<&CapabilityDescriptor> {
        self.capabilities
            .iter()
            .filter(|d| d.confidence >= self.settings.confidence_threshold)
            .map(|d| (d, d.topic.match_query(topic)))
            .filter(|(_, m)| m.is_direct())
            .max_by(|(a, ma), (b, mb)| {
                ma.specificity()
                    .cmp(&mb.specificity())
                    .then_with(|| a.confidence.total_cmp(&b.confidence))
            })
            .map(|(d, _)| d)
    }

    /// `None` means the answer engine declined and routing continues
    async fn answer_locally(
        &self,
        descriptor: &CapabilityDescriptor,
        request: &RouteRequest,
    ) -> Option<RouteResult> {
        if let Some(price) = &descriptor.price {
            let quote = self.quote(&request.topic, price);
            match &request.payment {
                None => {
                    debug!(amount = price.amount, currency = %price.currency, "Quoting price");
                    return Some(RouteResult::Answer {
                        payload: None,
                        source: self.local.clone(),
                        price: Some(price.clone()),
                    });
                }
                Some(proof) if !self.payments.verify(proof, &quote) => {
                    warn!(payer = %proof.payer, "Payment proof rejected");
                    return Some(RouteResult::failure_with(
                        FailureKind::Unauthorized,
                        "payment proof does not cover the quoted price",
                    ));
                }
                Some(_) => {}
            }
        }

        match self.answers.answer(&request.topic, &request.query).await {
            Ok(AnswerOutcome::Answered(payload)) => Some(RouteResult::Answer {
                payload: Some(payload),
                source: self.local.clone(),
                price: descriptor.price.clone(),
            }),
            Ok(AnswerOutcome::Declined) => {
                debug!("Answer engine declined, routing onwards");
                None
            }
            Err(e) => {
                warn!(error = %e, "Answer engine failed, routing onwards");
                None
            }
        }
    }
}
