//! Query sessions started by this node's owner

pub mod coordinator;

pub use coordinator::{
    HopOutcome, HopRecord, NextHop, SessionCoordinator, SessionReport, SessionSettings,
    SessionState,
};
