//! Lumina: the real-time conversational core of a voice assistant.
//!
//! Raw microphone audio enters from a peer process over a local socket;
//! synthesized speech and recognition results leave over two more. In
//! between, the turn orchestrator continuously decides when the user has
//! finished speaking, when the assistant may begin, and whether an
//! in-flight reply must be silenced because the user resumed talking.
//!
//! # Architecture
//!
//! Independent stages connected by async channels, with cancellation
//! expressed solely through silence epochs:
//! - **IPC**: length-framed audio ingress with a control sub-channel,
//!   ndjson recognition egress, WAV audio egress
//! - **STT**: vendor session supervision with backoff reconnect
//! - **Turn detection**: a dialogue-timeout judge and a stateful FSM
//!   classifier running concurrently per finalized transcript
//! - **Reply**: a parallel pre-reply filler plus the streamed main reply,
//!   split into sentences for TTS
//! - **TTS**: a single FIFO dispatcher gating every emission on the
//!   turn's timer

pub mod command;
pub mod config;
pub mod detect;
pub mod error;
pub mod ipc;
pub mod llm;
pub mod memory;
pub mod pipeline;
pub mod stt;
pub mod text;
pub mod tts;
pub mod turn;

pub use config::CoreConfig;
pub use error::{CoreError, Disposition, Result};
pub use pipeline::{Orchestrator, OrchestratorDeps};
