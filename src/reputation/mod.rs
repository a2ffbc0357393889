//! Topic-scoped reputation tracking

pub mod ledger;

pub use ledger::*;
