//! Opaque command/intent classifier seam.
//!
//! The orchestrator consumes a small outcome vocabulary: a recognized
//! preference updates the system context, a memory query triggers a
//! directed retrieval, anything else is not a command. The real classifier
//! lives behind the trait; the bundled rule-based one covers the cheap
//! unambiguous phrasings so the pipeline works without a vendor call.

use async_trait::async_trait;

use crate::error::Result;

/// What the classifier recognized in a transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Not a command.
    None,
    /// A preference to persist into the system context.
    Preference {
        /// Directive key (e.g. `user_name`, `tts_config`).
        key: String,
        /// Directive value.
        value: String,
    },
    /// An explicit memory lookup to run before replying.
    MemoryQuery {
        /// The query to retrieve with.
        query: String,
    },
}

/// Classifier seam.
#[async_trait]
pub trait CommandClassifier: Send + Sync {
    /// Classify one transcript.
    async fn classify(&self, transcript: &str) -> Result<CommandOutcome>;
}

/// Classifier that never recognizes anything.
pub struct NoopClassifier;

#[async_trait]
impl CommandClassifier for NoopClassifier {
    async fn classify(&self, _transcript: &str) -> Result<CommandOutcome> {
        Ok(CommandOutcome::None)
    }
}

/// Cheap rule-based classifier for unambiguous phrasings.
pub struct RuleBasedClassifier;

#[async_trait]
impl CommandClassifier for RuleBasedClassifier {
    async fn classify(&self, transcript: &str) -> Result<CommandOutcome> {
        let trimmed = transcript.trim();

        for prefix in ["请叫我", "以后叫我", "call me "] {
            if let Some(name) = trimmed.strip_prefix(prefix) {
                let name = name.trim().trim_end_matches(['。', '.', '!', '！']);
                if !name.is_empty() {
                    return Ok(CommandOutcome::Preference {
                        key: "user_name".to_owned(),
                        value: name.to_owned(),
                    });
                }
            }
        }

        for prefix in ["你还记得", "do you remember "] {
            if let Some(rest) = trimmed.strip_prefix(prefix) {
                let query = rest.trim_end_matches(['吗', '？', '?', '。', '.']).trim();
                if !query.is_empty() {
                    return Ok(CommandOutcome::MemoryQuery {
                        query: query.to_owned(),
                    });
                }
            }
        }

        Ok(CommandOutcome::None)
    }
}
