//! Hop resolution and payment
//!
//! [`engine`] decides what this agent does with a request it holds;
//! [`payment`] issues and checks the proofs that unlock priced answers.

pub mod engine;
pub mod payment;

pub use engine::{CandidateSource, RoutingEngine, RoutingSettings};
pub use payment::{DigestPaymentAuthorizer, NoPayments, PaymentAuthorizer, PaymentDeclined};
