//! Protocol message types and validation for the Elmnet routing protocol
//!
//! Topic paths and their matching rules live in [`topics`]; directory
//! records, reputation entries, gossip deltas and route messages in
//! [`messages`].

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
