//! Agent node: capability index, answer engines and the running node

pub mod answer;
pub mod index;
pub mod node;

pub use answer::{AnswerEngine, AnswerError, AnswerOutcome, DecliningAnswerEngine, HttpAnswerEngine};
pub use index::{CapabilityIndex, Candidate, DirectoryEntry, UpsertOutcome};
pub use node::{ElmnetNode, NodeComponents};
