//! Gossip-based replication of the capability index and reputation ledger
//!
//! - [`peers`]: bounded peer set with random sampling
//! - [`log`]: compacting change log that deltas are cut from
//! - [`exchange`]: push anti-entropy loop and delta application

pub mod exchange;
pub mod log;
pub mod peers;

pub use exchange::{ApplyReport, CycleReport, GossipError, GossipExchange, GossipSettings};
pub use log::{ChangeKey, ChangeLog};
pub use peers::PeerSet;
