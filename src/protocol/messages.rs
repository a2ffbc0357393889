//! Protocol message types for the Elmnet routing protocol
//!
//! This module defines the directory records, reputation entries, gossip
//! deltas and routing messages exchanged between agents. Every type is
//! encoding-agnostic serde; the TCP transport frames them as one JSON object
//! per line.

use crate::identity::{verify_signed, AgentId, IdentityError, NodeIdentity};
use crate::protocol::topics::TopicPath;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Protocol version exchanged in the `Hello` handshake
pub const PROTOCOL_VERSION: &str = "elmnet/1";

/// Current time truncated to millisecond precision
///
/// Records are signed over millisecond timestamps, so every timestamp that
/// ends up in a signed structure is produced here.
pub fn timestamp_now() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap_or_else(Utc::now)
}

/// Record and message validation errors
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Identity check failed: {0}")]
    Identity(#[from] IdentityError),
    #[error("Confidence {0} outside [0, 1]")]
    InvalidConfidence(f64),
    #[error("Reputation score {0} outside [0, 1]")]
    InvalidScore(f64),
    #[error("Invalid endpoint '{0}': {1}")]
    InvalidEndpoint(String, String),
    #[error("Failed to encode signing body: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Role of an agent in the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Acts on behalf of a person, originates queries
    Personal,
    /// Hosts knowledge and answers queries on its topics
    Host,
    /// Knows who knows: redirects queries towards hosts
    Router,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Personal => "personal",
            Role::Host => "host",
            Role::Router => "router",
        };
        f.write_str(name)
    }
}

/// Network address of an agent: `tcp://host:port` or `mem://name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint(String);

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self, RecordError> {
        let url = Url::parse(raw)
            .map_err(|e| RecordError::InvalidEndpoint(raw.to_string(), e.to_string()))?;
        match url.scheme() {
            "tcp" => {
                if url.host_str().is_none() || url.port().is_none() {
                    return Err(RecordError::InvalidEndpoint(
                        raw.to_string(),
                        "tcp endpoints need host and port".to_string(),
                    ));
                }
            }
            "mem" => {
                if url.host_str().map(str::is_empty).unwrap_or(true) {
                    return Err(RecordError::InvalidEndpoint(
                        raw.to_string(),
                        "mem endpoints need a name".to_string(),
                    ));
                }
            }
            other => {
                return Err(RecordError::InvalidEndpoint(
                    raw.to_string(),
                    format!("unsupported scheme '{other}'"),
                ))
            }
        }
        Ok(Self(raw.to_string()))
    }

    pub fn scheme(&self) -> &str {
        self.0.split("://").next().unwrap_or_default()
    }

    /// `host:port` part of the endpoint
    pub fn authority(&self) -> &str {
        self.0
            .split("://")
            .nth(1)
            .map(|rest| rest.trim_end_matches('/'))
            .unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Endpoint {
    type Error = RecordError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Endpoint::parse(&value)
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.0
    }
}

/// Price of a paywalled capability, in minor currency units
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Price {
    pub amount: u64,
    pub currency: String,
}

/// One topic an agent can serve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub topic: TopicPath,
    /// Self-declared confidence in [0, 1]
    pub confidence: f64,
    #[serde(default)]
    pub description: String,
    /// Present when answers on this topic must be paid for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Price>,
}

impl CapabilityDescriptor {
    pub fn new(topic: TopicPath, confidence: f64, description: impl Into<String>) -> Self {
        Self {
            topic,
            confidence,
            description: description.into(),
            price: None,
        }
    }

    pub fn with_price(mut self, price: Price) -> Self {
        self.price = Some(price);
        self
    }

    pub fn validate(&self) -> Result<(), RecordError> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(RecordError::InvalidConfidence(self.confidence));
        }
        Ok(())
    }
}

/// Fields covered by a record signature, in a fixed order
#[derive(Serialize)]
struct RecordBody<'a> {
    agent_id: &'a AgentId,
    public_key: &'a str,
    role: Role,
    endpoint: &'a Endpoint,
    capabilities: &'a [CapabilityDescriptor],
    refreshed_at_ms: i64,
}

/// Signed directory entry announcing an agent and its capabilities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: AgentId,
    /// Hex ed25519 public key the agent id is derived from
    pub public_key: String,
    pub role: Role,
    pub endpoint: Endpoint,
    #[serde(default)]
    pub capabilities: Vec<CapabilityDescriptor>,
    pub refreshed_at: DateTime<Utc>,
    pub signature: String,
}

impl AgentRecord {
    /// Build and sign a record for `identity`
    pub fn signed(
        identity: &NodeIdentity,
        role: Role,
        endpoint: Endpoint,
        capabilities: Vec<CapabilityDescriptor>,
        refreshed_at: DateTime<Utc>,
    ) -> Result<Self, RecordError> {
        let mut record = Self {
            agent_id: identity.agent_id().clone(),
            public_key: identity.public_key_hex(),
            role,
            endpoint,
            capabilities,
            refreshed_at,
            signature: String::new(),
        };
        record.signature = identity.sign(&record.signing_bytes()?);
        Ok(record)
    }

    fn signing_bytes(&self) -> Result<Vec<u8>, RecordError> {
        let body = RecordBody {
            agent_id: &self.agent_id,
            public_key: &self.public_key,
            role: self.role,
            endpoint: &self.endpoint,
            capabilities: &self.capabilities,
            refreshed_at_ms: self.refreshed_at.timestamp_millis(),
        };
        Ok(serde_json::to_vec(&body)?)
    }

    /// Check signature, id derivation and descriptor ranges
    pub fn verify(&self) -> Result<(), RecordError> {
        for descriptor in &self.capabilities {
            descriptor.validate()?;
        }
        verify_signed(
            &self.agent_id,
            &self.public_key,
            &self.signing_bytes()?,
            &self.signature,
        )?;
        Ok(())
    }

    /// Total order used to pick between two versions of the same record:
    /// later refresh wins, signature bytes break exact ties.
    pub fn is_newer_than(&self, other: &AgentRecord) -> bool {
        (self.refreshed_at, &self.signature) > (other.refreshed_at, &other.signature)
    }

    pub fn is_expired(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now.signed_duration_since(self.refreshed_at) > ttl
    }

    pub fn hop_target(&self) -> HopTarget {
        HopTarget {
            agent_id: self.agent_id.clone(),
            endpoint: self.endpoint.clone(),
        }
    }
}

#[derive(Serialize)]
struct WithdrawalBody<'a> {
    agent_id: &'a AgentId,
    public_key: &'a str,
    withdrawn_at_ms: i64,
}

/// Signed tombstone removing an agent from the directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Withdrawal {
    pub agent_id: AgentId,
    pub public_key: String,
    pub withdrawn_at: DateTime<Utc>,
    pub signature: String,
}

impl Withdrawal {
    pub fn signed(identity: &NodeIdentity, withdrawn_at: DateTime<Utc>) -> Result<Self, RecordError> {
        let mut withdrawal = Self {
            agent_id: identity.agent_id().clone(),
            public_key: identity.public_key_hex(),
            withdrawn_at,
            signature: String::new(),
        };
        withdrawal.signature = identity.sign(&withdrawal.signing_bytes()?);
        Ok(withdrawal)
    }

    fn signing_bytes(&self) -> Result<Vec<u8>, RecordError> {
        let body = WithdrawalBody {
            agent_id: &self.agent_id,
            public_key: &self.public_key,
            withdrawn_at_ms: self.withdrawn_at.timestamp_millis(),
        };
        Ok(serde_json::to_vec(&body)?)
    }

    pub fn verify(&self) -> Result<(), RecordError> {
        verify_signed(
            &self.agent_id,
            &self.public_key,
            &self.signing_bytes()?,
            &self.signature,
        )?;
        Ok(())
    }

    /// Whether this tombstone hides `record`
    pub fn suppresses(&self, record: &AgentRecord) -> bool {
        record.refreshed_at <= self.withdrawn_at
    }
}

/// Outcome of an interaction, fed into the reputation ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    PartialSuccess,
    Failure,
}

impl Outcome {
    /// Target value the EWMA moves toward
    pub fn value(&self) -> f64 {
        match self {
            Outcome::Success => 1.0,
            Outcome::PartialSuccess => 0.5,
            Outcome::Failure => 0.0,
        }
    }
}

/// Topic-scoped trust score for one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationEntry {
    pub agent_id: AgentId,
    pub topic: TopicPath,
    /// EWMA score in [0, 1]
    pub score: f64,
    pub samples: u64,
    pub updated_at: DateTime<Utc>,
}

impl ReputationEntry {
    pub fn validate(&self) -> Result<(), RecordError> {
        if !self.score.is_finite() || !(0.0..=1.0).contains(&self.score) {
            return Err(RecordError::InvalidScore(self.score));
        }
        Ok(())
    }
}

/// Anti-entropy payload: everything the origin changed after the receiver's
/// last acknowledged sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GossipDelta {
    pub origin: AgentId,
    /// Highest change-log sequence included
    pub seq: u64,
    /// Acknowledged sequence this delta continues from, 0 for everything
    #[serde(default)]
    pub since: u64,
    #[serde(default)]
    pub records: Vec<AgentRecord>,
    #[serde(default)]
    pub tombstones: Vec<Withdrawal>,
    #[serde(default)]
    pub entries: Vec<ReputationEntry>,
}

impl GossipDelta {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.tombstones.is_empty() && self.entries.is_empty()
    }

    pub fn item_count(&self) -> usize {
        self.records.len() + self.tombstones.len() + self.entries.len()
    }
}

/// Agent id plus where to reach it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HopTarget {
    pub agent_id: AgentId,
    pub endpoint: Endpoint,
}

/// What a requester is asked to pay for a priced answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub provider: AgentId,
    pub topic: TopicPath,
    pub price: Price,
}

/// Token issued by a payment authorizer proving a quote was paid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentProof {
    pub payer: AgentId,
    pub provider: AgentId,
    pub topic: TopicPath,
    pub amount: u64,
    pub currency: String,
    pub token: String,
}

impl PaymentProof {
    /// Whether this proof is for `quote` at all (the token is checked by the
    /// authorizer)
    pub fn covers(&self, quote: &PriceQuote) -> bool {
        self.provider == quote.provider
            && self.topic == quote.topic
            && self.amount == quote.price.amount
            && self.currency == quote.price.currency
    }
}

/// A query travelling through the network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRequest {
    pub session_id: Uuid,
    pub topic: TopicPath,
    pub query: String,
    pub requester: AgentId,
    /// Remaining hop budget
    pub ttl: u32,
    /// Agents that already handled this request, in order
    #[serde(default)]
    pub visited: Vec<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment: Option<PaymentProof>,
}

impl RouteRequest {
    pub fn new(topic: TopicPath, query: impl Into<String>, requester: AgentId, ttl: u32) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            topic,
            query: query.into(),
            requester,
            ttl,
            visited: Vec::new(),
            payment: None,
        }
    }

    pub fn has_visited(&self, agent_id: &AgentId) -> bool {
        self.visited.contains(agent_id)
    }

    /// Append to the visited set, ignoring duplicates
    pub fn mark_visited(&mut self, agent_id: &AgentId) {
        if !self.has_visited(agent_id) {
            self.visited.push(agent_id.clone());
        }
    }
}

/// Why a hop could not produce an answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NoRoute,
    HopBudgetExceeded,
    Timeout,
    Cycle,
    Unauthorized,
    Malformed,
    PeerUnreachable,
}

impl FailureKind {
    /// Failures caused by the requester rather than the routers
    pub fn is_requester_fault(&self) -> bool {
        matches!(self, FailureKind::Unauthorized | FailureKind::Malformed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::NoRoute => "no_route",
            FailureKind::HopBudgetExceeded => "hop_budget_exceeded",
            FailureKind::Timeout => "timeout",
            FailureKind::Cycle => "cycle",
            FailureKind::Unauthorized => "unauthorized",
            FailureKind::Malformed => "malformed",
            FailureKind::PeerUnreachable => "peer_unreachable",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of resolving one hop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RouteResult {
    /// The holder answered. `payload` is `None` when `price` must be paid first.
    Answer {
        payload: Option<Value>,
        source: AgentId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        price: Option<Price>,
    },
    /// Forward to `next`; `alternates` are next-ranked fallbacks
    Redirect {
        next: HopTarget,
        #[serde(default)]
        alternates: Vec<HopTarget>,
    },
    Failure {
        kind: FailureKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl RouteResult {
    pub fn failure(kind: FailureKind) -> Self {
        RouteResult::Failure { kind, detail: None }
    }

    pub fn failure_with(kind: FailureKind, detail: impl Into<String>) -> Self {
        RouteResult::Failure {
            kind,
            detail: Some(detail.into()),
        }
    }

    pub fn is_answer(&self) -> bool {
        matches!(self, RouteResult::Answer { .. })
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self, RouteResult::Redirect { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            RouteResult::Failure { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Short label for metrics and logs
    pub fn label(&self) -> &'static str {
        match self {
            RouteResult::Answer { payload: None, .. } => "priced",
            RouteResult::Answer { .. } => "answer",
            RouteResult::Redirect { .. } => "redirect",
            RouteResult::Failure { kind, .. } => kind.as_str(),
        }
    }
}

/// Every message exchanged between agents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Handshake, sent first in both directions on every connection
    Hello { agent_id: AgentId, version: String },
    Announce { record: AgentRecord },
    Withdraw { withdrawal: Withdrawal },
    GossipPush { delta: GossipDelta },
    GossipAck { origin: AgentId, seq: u64 },
    RouteRequest { request: RouteRequest },
    RouteResponse { result: RouteResult },
    FeedbackReport {
        agent_id: AgentId,
        topic: TopicPath,
        outcome: Outcome,
    },
    /// Generic acknowledgement for announce, withdraw and feedback
    Ack,
    /// Boundary rejection of a message that could not be applied
    Rejected { kind: FailureKind, reason: String },
}

impl Message {
    /// Message type name for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::Announce { .. } => "announce",
            Message::Withdraw { .. } => "withdraw",
            Message::GossipPush { .. } => "gossip_push",
            Message::GossipAck { .. } => "gossip_ack",
            Message::RouteRequest { .. } => "route_request",
            Message::RouteResponse { .. } => "route_response",
            Message::FeedbackReport { .. } => "feedback_report",
            Message::Ack => "ack",
            Message::Rejected { .. } => "rejected",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity(seed: u8) -> NodeIdentity {
        NodeIdentity::from_seed(&[seed; 32])
    }

    fn topic(s: &str) -> TopicPath {
        TopicPath::parse(s).unwrap()
    }

    fn record(seed: u8) -> AgentRecord {
        AgentRecord::signed(
            &identity(seed),
            Role::Host,
            Endpoint::parse("tcp://127.0.0.1:9000").unwrap(),
            vec![CapabilityDescriptor::new(
                topic("restaurants/vegan"),
                0.8,
                "Vegan restaurant guide",
            )],
            timestamp_now(),
        )
        .unwrap()
    }

    #[test]
    fn test_signed_record_verifies() {
        let record = record(1);
        assert!(record.verify().is_ok());
    }

    #[test]
    fn test_tampered_record_fails_verification() {
        let mut tampered = record(1);
        tampered.capabilities[0].confidence = 0.99;
        assert!(matches!(
            tampered.verify(),
            Err(RecordError::Identity(IdentityError::BadSignature(_)))
        ));

        let mut moved = record(1);
        moved.endpoint = Endpoint::parse("tcp://10.0.0.1:9000").unwrap();
        assert!(moved.verify().is_err());
    }

    #[test]
    fn test_record_with_bad_confidence_is_rejected() {
        let bad = AgentRecord::signed(
            &identity(2),
            Role::Host,
            Endpoint::parse("mem://host").unwrap(),
            vec![CapabilityDescriptor::new(topic("a"), 1.5, "")],
            timestamp_now(),
        )
        .unwrap();
        assert!(matches!(
            bad.verify(),
            Err(RecordError::InvalidConfidence(_))
        ));
    }

    #[test]
    fn test_record_survives_json_roundtrip_with_valid_signature() {
        let original = record(3);
        let json = serde_json::to_string(&original).unwrap();
        let parsed: AgentRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, original);
        assert!(parsed.verify().is_ok());
    }

    #[test]
    fn test_record_ordering() {
        let older = record(4);
        let mut newer = older.clone();
        newer.refreshed_at = older.refreshed_at + chrono::Duration::seconds(1);

        assert!(newer.is_newer_than(&older));
        assert!(!older.is_newer_than(&newer));
        assert!(!older.is_newer_than(&older));
    }

    #[test]
    fn test_record_expiry() {
        let rec = record(5);
        let ttl = chrono::Duration::seconds(60);
        assert!(!rec.is_expired(rec.refreshed_at + chrono::Duration::seconds(59), ttl));
        assert!(rec.is_expired(rec.refreshed_at + chrono::Duration::seconds(61), ttl));
    }

    #[test]
    fn test_withdrawal_signing_and_suppression() {
        let id = identity(6);
        let rec = record(6);
        let withdrawal =
            Withdrawal::signed(&id, rec.refreshed_at + chrono::Duration::seconds(1)).unwrap();

        assert!(withdrawal.verify().is_ok());
        assert!(withdrawal.suppresses(&rec));

        let mut later = rec.clone();
        later.refreshed_at = withdrawal.withdrawn_at + chrono::Duration::seconds(1);
        assert!(!withdrawal.suppresses(&later));

        let mut forged = withdrawal.clone();
        forged.agent_id = identity(7).agent_id().clone();
        assert!(forged.verify().is_err());
    }

    #[test]
    fn test_endpoint_validation() {
        assert!(Endpoint::parse("tcp://127.0.0.1:9000").is_ok());
        assert!(Endpoint::parse("tcp://router.example:7000").is_ok());
        assert!(Endpoint::parse("mem://router-b").is_ok());
        assert!(Endpoint::parse("tcp://127.0.0.1").is_err());
        assert!(Endpoint::parse("http://127.0.0.1:80").is_err());
        assert!(Endpoint::parse("not a url").is_err());

        let endpoint = Endpoint::parse("tcp://127.0.0.1:9000").unwrap();
        assert_eq!(endpoint.scheme(), "tcp");
        assert_eq!(endpoint.authority(), "127.0.0.1:9000");
    }

    #[test]
    fn test_outcome_values() {
        assert_eq!(Outcome::Success.value(), 1.0);
        assert_eq!(Outcome::PartialSuccess.value(), 0.5);
        assert_eq!(Outcome::Failure.value(), 0.0);
    }

    #[test]
    fn test_route_request_visited_only_grows() {
        let requester = identity(8).agent_id().clone();
        let hop = identity(9).agent_id().clone();
        let mut request = RouteRequest::new(topic("a/b"), "q", requester, 4);

        request.mark_visited(&hop);
        request.mark_visited(&hop);
        assert_eq!(request.visited.len(), 1);
        assert!(request.has_visited(&hop));
    }

    #[test]
    fn test_message_wire_shape() {
        let source = identity(10).agent_id().clone();
        let msg = Message::RouteResponse {
            result: RouteResult::Answer {
                payload: Some(json!({"text": "Try Green Leaf"})),
                source: source.clone(),
                price: None,
            },
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "route_response");
        assert_eq!(value["result"]["result"], "answer");
        assert_eq!(value["result"]["source"], source.as_str());

        let failure = Message::RouteResponse {
            result: RouteResult::failure(FailureKind::HopBudgetExceeded),
        };
        let value = serde_json::to_value(&failure).unwrap();
        assert_eq!(value["result"]["kind"], "hop_budget_exceeded");
    }

    #[test]
    fn test_invalid_topic_is_rejected_on_decode() {
        let raw = json!({
            "type": "feedback_report",
            "agent_id": "ab".repeat(20),
            "topic": "bad/*/topic",
            "outcome": "success"
        });
        let parsed: Result<Message, _> = serde_json::from_value(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_payment_proof_covers_quote() {
        let provider = identity(11).agent_id().clone();
        let payer = identity(12).agent_id().clone();
        let quote = PriceQuote {
            provider: provider.clone(),
            topic: topic("reports/market"),
            price: Price {
                amount: 25,
                currency: "credits".to_string(),
            },
        };
        let proof = PaymentProof {
            payer,
            provider,
            topic: topic("reports/market"),
            amount: 25,
            currency: "credits".to_string(),
            token: "t".to_string(),
        };
        assert!(proof.covers(&quote));

        let cheaper = PaymentProof {
            amount: 5,
            ..proof.clone()
        };
        assert!(!cheaper.covers(&quote));
    }

    #[test]
    fn test_result_labels() {
        let source = identity(13).agent_id().clone();
        let priced = RouteResult::Answer {
            payload: None,
            source,
            price: Some(Price {
                amount: 1,
                currency: "c".to_string(),
            }),
        };
        assert_eq!(priced.label(), "priced");
        assert_eq!(RouteResult::failure(FailureKind::Cycle).label(), "cycle");
    }
}
