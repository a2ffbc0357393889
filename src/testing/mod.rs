//! Testing utilities and mock implementations
//!
//! Lets whole networks of nodes run inside one test process, with no sockets
//! and no external answer services.

pub mod mocks;

pub use mocks::*;
