//! Node configuration
//!
//! A node is configured from one TOML file. Every tunable has a serde default
//! so a minimal file only needs the `[node]` section. Two environment
//! variables override the file: `P2P_PORT` (listen port) and
//! `BOOTSTRAP_PEERS` (comma-separated peer endpoints).

use crate::protocol::messages::{CapabilityDescriptor, Endpoint, Role};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Listen port override
pub const ENV_P2P_PORT: &str = "P2P_PORT";
/// Comma-separated bootstrap peers override
pub const ENV_BOOTSTRAP_PEERS: &str = "BOOTSTRAP_PEERS";

/// Longest accepted TTL or half-life, ten years
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 3600;
/// Most retries the HTTP answer engine may be configured with
pub const MAX_ANSWER_RETRIES: usize = 10;

/// `secs` as a chrono duration, clamped to [`MAX_DURATION_SECS`]
fn bounded_seconds(secs: u64) -> chrono::Duration {
    let secs = i64::try_from(secs.min(MAX_DURATION_SECS)).unwrap_or(i64::MAX);
    chrono::Duration::try_seconds(secs).unwrap_or_else(chrono::Duration::zero)
}

/// Main node configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    pub node: NodeSection,
    #[serde(default)]
    pub routing: RoutingSection,
    #[serde(default)]
    pub reputation: ReputationSection,
    #[serde(default)]
    pub gossip: GossipSection,
    #[serde(default)]
    pub directory: DirectorySection,
    #[serde(default)]
    pub answer: AnswerSection,
    #[serde(default)]
    pub payment: PaymentSection,
}

/// Identity, addressing and advertised capabilities of this node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSection {
    pub role: Role,
    /// Socket address the TCP listener binds
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Advertised endpoint; derived from `listen` when absent
    #[serde(default)]
    pub endpoint: Option<Endpoint>,
    /// Hex secret key file, created on first start
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
    /// Port of the HTTP health and query API (disabled when absent)
    #[serde(default)]
    pub http_port: Option<u16>,
    /// Snapshot file for the index and ledger (disabled when absent)
    #[serde(default)]
    pub snapshot_file: Option<PathBuf>,
    #[serde(default)]
    pub capabilities: Vec<CapabilityDescriptor>,
}

fn default_listen() -> String {
    "127.0.0.1:7400".to_string()
}

fn default_key_file() -> PathBuf {
    PathBuf::from("elmnet.key")
}

/// Hop resolution and session settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoutingSection {
    /// Candidates fetched from the index per lookup
    pub lookup_k: usize,
    /// Minimum local confidence to answer instead of redirecting
    pub confidence_threshold: f64,
    /// Hop budget of new sessions
    pub default_ttl: u32,
    pub hop_timeout_ms: u64,
    /// Alternates tried after a hop times out
    pub max_hop_retries: usize,
    /// Router that sessions started here are sent to first
    pub first_hop: Option<Endpoint>,
    /// Entries kept in the duplicate-request cache
    pub dedup_capacity: usize,
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            lookup_k: 5,
            confidence_threshold: 0.5,
            default_ttl: 8,
            hop_timeout_ms: 2000,
            max_hop_retries: 2,
            first_hop: None,
            dedup_capacity: 1024,
        }
    }
}

/// EWMA and feedback weighting
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReputationSection {
    pub alpha: f64,
    /// Score of an agent with no observations
    pub neutral: f64,
    pub decay_half_life_secs: u64,
    pub decay_interval_secs: u64,
    /// Feedback weight for the agent that produced the answer
    pub terminal_weight: f64,
    /// Feedback weight for routers on the provenance chain
    pub intermediate_weight: f64,
}

impl ReputationSection {
    pub fn decay_half_life(&self) -> chrono::Duration {
        bounded_seconds(self.decay_half_life_secs)
    }
}

impl Default for ReputationSection {
    fn default() -> Self {
        Self {
            alpha: 0.2,
            neutral: 0.5,
            decay_half_life_secs: 7 * 24 * 3600,
            decay_interval_secs: 300,
            terminal_weight: 1.0,
            intermediate_weight: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GossipSection {
    pub interval_ms: u64,
    pub fanout: usize,
    pub max_peers: usize,
    pub bootstrap_peers: Vec<Endpoint>,
    /// Upper bound on items in one delta
    pub max_delta_items: usize,
}

impl Default for GossipSection {
    fn default() -> Self {
        Self {
            interval_ms: 2000,
            fanout: 3,
            max_peers: 16,
            bootstrap_peers: Vec::new(),
            max_delta_items: 256,
        }
    }
}

/// Directory record lifetime
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DirectorySection {
    pub record_ttl_secs: u64,
    /// How often this node re-announces its own record
    pub refresh_interval_secs: u64,
    pub expire_interval_secs: u64,
}

impl DirectorySection {
    /// Record lifetime without a refresh
    pub fn record_ttl(&self) -> chrono::Duration {
        bounded_seconds(self.record_ttl_secs)
    }
}

impl Default for DirectorySection {
    fn default() -> Self {
        Self {
            record_ttl_secs: 900,
            refresh_interval_secs: 300,
            expire_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AnswerEngineKind {
    /// Pure router: never answers
    #[default]
    None,
    Http,
}

/// Answer engine selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnswerSection {
    pub engine: AnswerEngineKind,
    pub url: Option<String>,
    pub timeout_ms: u64,
    pub retry_attempts: usize,
}

impl Default for AnswerSection {
    fn default() -> Self {
        Self {
            engine: AnswerEngineKind::None,
            url: None,
            timeout_ms: 5000,
            retry_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct PaymentSection {
    /// Environment variable holding the shared payment secret
    pub shared_secret_env: Option<String>,
    /// Most this node pays for one answer, in minor units
    pub max_price: Option<u64>,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl NodeConfig {
    /// Load configuration from a TOML file, apply environment overrides and
    /// validate the result
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides_with(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Minimal configuration for a node of `role`, all other sections at
    /// their defaults
    pub fn for_role(role: Role, listen: &str) -> Self {
        Self {
            node: NodeSection {
                role,
                listen: listen.to_string(),
                endpoint: None,
                key_file: default_key_file(),
                http_port: None,
                snapshot_file: None,
                capabilities: Vec::new(),
            },
            routing: RoutingSection::default(),
            reputation: ReputationSection::default(),
            gossip: GossipSection::default(),
            directory: DirectorySection::default(),
            answer: AnswerSection::default(),
            payment: PaymentSection::default(),
        }
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply `P2P_PORT` and `BOOTSTRAP_PEERS` using `lookup` to read variables
    pub fn apply_env_overrides_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup(ENV_P2P_PORT) {
            let port: u16 = port.trim().parse().map_err(|_| {
                ConfigError::InvalidConfig(format!("{ENV_P2P_PORT} must be a port number"))
            })?;
            let host = self
                .node
                .listen
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .unwrap_or_else(|| "0.0.0.0".to_string());
            self.node.listen = format!("{host}:{port}");
        }

        if let Some(peers) = lookup(ENV_BOOTSTRAP_PEERS) {
            let mut bootstrap = Vec::new();
            for raw in peers.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                let with_scheme = if raw.contains("://") {
                    raw.to_string()
                } else {
                    format!("tcp://{raw}")
                };
                let endpoint = Endpoint::parse(&with_scheme).map_err(|e| {
                    ConfigError::InvalidConfig(format!("{ENV_BOOTSTRAP_PEERS}: {e}"))
                })?;
                bootstrap.push(endpoint);
            }
            self.gossip.bootstrap_peers = bootstrap;
        }

        Ok(())
    }

    /// Check ranges and cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::InvalidConfig(msg));

        if self.node.listen.parse::<SocketAddr>().is_err() {
            return invalid(format!(
                "node.listen '{}' is not a socket address",
                self.node.listen
            ));
        }
        self.advertised_endpoint()?;
        for descriptor in &self.node.capabilities {
            descriptor
                .validate()
                .map_err(|e| ConfigError::InvalidConfig(format!("node.capabilities: {e}")))?;
        }

        let routing = &self.routing;
        if routing.lookup_k == 0 {
            return invalid("routing.lookup_k must be at least 1".into());
        }
        if !unit_interval(routing.confidence_threshold) {
            return invalid("routing.confidence_threshold must be within [0, 1]".into());
        }
        if routing.default_ttl == 0 {
            return invalid("routing.default_ttl must be at least 1".into());
        }
        if routing.hop_timeout_ms == 0 {
            return invalid("routing.hop_timeout_ms must be positive".into());
        }

        let reputation = &self.reputation;
        if !(reputation.alpha.is_finite() && reputation.alpha > 0.0 && reputation.alpha <= 1.0) {
            return invalid("reputation.alpha must be within (0, 1]".into());
        }
        if !unit_interval(reputation.neutral) {
            return invalid("reputation.neutral must be within [0, 1]".into());
        }
        for (name, weight) in [
            ("terminal_weight", reputation.terminal_weight),
            ("intermediate_weight", reputation.intermediate_weight),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return invalid(format!("reputation.{name} must be a non-negative number"));
            }
        }
        if reputation.decay_half_life_secs == 0 || reputation.decay_half_life_secs > MAX_DURATION_SECS {
            return invalid(format!(
                "reputation.decay_half_life_secs must be between 1 and {MAX_DURATION_SECS}"
            ));
        }

        let gossip = &self.gossip;
        if gossip.fanout == 0 || gossip.fanout > gossip.max_peers {
            return invalid(format!(
                "gossip.fanout {} must be between 1 and max_peers {}",
                gossip.fanout, gossip.max_peers
            ));
        }
        if gossip.interval_ms == 0 || gossip.max_delta_items == 0 {
            return invalid("gossip.interval_ms and gossip.max_delta_items must be positive".into());
        }

        let directory = &self.directory;
        if directory.record_ttl_secs == 0 || directory.record_ttl_secs > MAX_DURATION_SECS {
            return invalid(format!(
                "directory.record_ttl_secs must be between 1 and {MAX_DURATION_SECS}"
            ));
        }
        if directory.refresh_interval_secs >= directory.record_ttl_secs {
            return invalid("directory.refresh_interval_secs must be below record_ttl_secs".into());
        }

        if self.answer.retry_attempts > MAX_ANSWER_RETRIES {
            return invalid(format!(
                "answer.retry_attempts must be at most {MAX_ANSWER_RETRIES}"
            ));
        }

        if self.answer.engine == AnswerEngineKind::Http {
            let Some(raw) = self.answer.url.as_deref() else {
                return invalid("answer.engine = \"http\" requires answer.url".into());
            };
            match url::Url::parse(raw) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => {}
                _ => return invalid(format!("answer.url '{raw}' is not an http(s) URL")),
            }
        }

        Ok(())
    }

    /// Endpoint this node announces: the configured one, or `tcp://<listen>`
    pub fn advertised_endpoint(&self) -> Result<Endpoint, ConfigError> {
        match &self.node.endpoint {
            Some(endpoint) => Ok(endpoint.clone()),
            None => Endpoint::parse(&format!("tcp://{}", self.node.listen))
                .map_err(|e| ConfigError::InvalidConfig(format!("node.listen: {e}"))),
        }
    }

    /// Shared payment secret, if one is configured
    pub fn payment_secret(&self) -> Result<Option<String>, ConfigError> {
        match &self.payment.shared_secret_env {
            Some(name) => std::env::var(name)
                .map(Some)
                .map_err(|_| ConfigError::EnvVarNotFound(name.clone())),
            None => Ok(None),
        }
    }
}

fn unit_interval(value: f64) -> bool {
    value.is_finite() && (0.0..=1.0).contains(&value)
}
