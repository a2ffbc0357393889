//! Elmnet - decentralized routing and reputation for agent networks
//!
//! Every participant is an agent with a signed identity. Hosts announce the
//! topics they can answer, routers keep a gossiped capability index and a
//! per-topic reputation ledger, and personal agents walk a query hop by hop
//! until some host answers it.
//!
//! # Overview
//!
//! - [`protocol`]: topic paths, signed records and the wire messages
//! - [`agent::index`]: capability index and candidate ranking
//! - [`reputation`]: smoothed per-(agent, topic) scores with decay
//! - [`gossip`]: anti-entropy exchange of records and scores
//! - [`routing`]: single-hop resolution and payment authorization
//! - [`session`]: the multi-hop walk that turns a query into an answer
//! - [`transport`]: framed TCP transport and the handler seam
//! - [`agent::node`]: a running node wiring all of the above together
//!
//! # Quick Start
//!
//! ```rust
//! use elmnet::protocol::{Outcome, TopicPath};
//! use elmnet::identity::NodeIdentity;
//! use elmnet::reputation::ReputationLedger;
//!
//! let topic = TopicPath::parse("Food/Vegan").unwrap();
//! assert_eq!(topic.to_string(), "food/vegan");
//!
//! let host = NodeIdentity::generate();
//! let ledger = ReputationLedger::default();
//! ledger
//!     .record(host.agent_id(), &topic, Outcome::Success, 1.0)
//!     .unwrap();
//! assert!(ledger.get(host.agent_id(), &topic) > 0.5);
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod gossip;
pub mod identity;
pub mod observability;
pub mod persistence;
pub mod protocol;
pub mod reputation;
pub mod routing;
pub mod session;
pub mod testing;
pub mod transport;

pub use agent::{ElmnetNode, NodeComponents};
pub use config::NodeConfig;
pub use error::{ElmnetError, ElmnetResult};
pub use identity::{AgentId, NodeIdentity};
pub use protocol::*;
