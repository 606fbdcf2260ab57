//! Message types passed between pipeline stages.

use std::sync::Arc;

use serde::Serialize;

use crate::detect::Timer;

/// A transcription result on its way to the result socket, serialized as
/// one ndjson line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transcription {
    /// Recognized text.
    pub text: String,
    /// Whether the hypothesis is final.
    pub is_final: bool,
}

/// Which stage produced a sentence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentenceSource {
    /// The short filler generated alongside turn detection. Gated on the
    /// timer actually firing.
    PreReply,
    /// A sentence from the main reply stream. The timer has already fired;
    /// only epoch validity is re-checked.
    Main,
}

/// One sentence queued for the TTS dispatcher, carrying the timer that
/// governs its emission.
#[derive(Clone)]
pub struct SentenceJob {
    /// Sentence text, possibly with a leading `[EMOTION]` marker.
    pub text: String,
    /// Producing stage.
    pub source: SentenceSource,
    /// The governing timer.
    pub timer: Arc<Timer>,
}

impl std::fmt::Debug for SentenceJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SentenceJob")
            .field("text", &self.text)
            .field("source", &self.source)
            .field("epoch", &self.timer.bound_epoch())
            .finish()
    }
}
