//! Pipeline orchestration: the turn orchestrator and its stage messages.

pub mod coordinator;
pub mod messages;

pub use coordinator::{Orchestrator, OrchestratorDeps};
pub use messages::{SentenceJob, SentenceSource, Transcription};
