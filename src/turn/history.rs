//! Conversation history and global system context.
//!
//! The history is append-only. A user round enters either as a single
//! [`Turn`] or, when several buffered turns collapsed into one assistant
//! response, as a [`HistoryEntry::Multi`] group. Old rounds are compressed
//! into lossy summaries when the history approaches the model window.

use chrono::{DateTime, Utc};

use crate::llm::{ChatMessage, Role};
use crate::memory::Memory;

/// Opaque descriptor for an image attached to a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Where the blob lives (upload path handled elsewhere).
    pub uri: String,
    /// Short description used in prompts and memory queries.
    pub description: String,
}

/// One user utterance awaiting (or already given) an assistant reply.
#[derive(Debug, Clone)]
pub struct Turn {
    /// Verbatim transcript of the user's speech.
    pub transcript: String,
    /// Attached multimodal inputs.
    pub image_refs: Vec<ImageRef>,
    /// Memories surfaced for this turn by the memory service.
    pub retrieved_memories: Vec<Memory>,
    /// Wall-clock creation time.
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    /// Create a plain transcript turn.
    pub fn new(transcript: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
            image_refs: Vec::new(),
            retrieved_memories: Vec::new(),
            timestamp: Utc::now(),
        }
    }
}

/// A completed assistant response.
#[derive(Debug, Clone, Default)]
pub struct AssistantReply {
    /// The short filler spoken while the main reply was still generating.
    pub pre_reply: String,
    /// The full main reply text.
    pub text: String,
    /// Whether the user barged in before the reply finished playing.
    pub was_interrupted: bool,
}

/// Lossy summary of an archived round.
#[derive(Debug, Clone)]
pub struct CompressedTurn {
    /// The summary text.
    pub summary: String,
    /// When the original round happened.
    pub timestamp: DateTime<Utc>,
}

/// One entry in the conversation history.
#[derive(Debug, Clone)]
pub enum HistoryEntry {
    /// A single user turn.
    User(Turn),
    /// Two or more user turns that collapsed into one assistant response.
    Multi(Vec<Turn>),
    /// A compressed (summarized) round.
    Compressed(CompressedTurn),
    /// An assistant reply.
    Assistant(AssistantReply),
}

/// What the formatted prompt is for. Pre-reply prompts see only the filler
/// side of past assistant entries so the filler model learns its own voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    /// Full prompt for the main reply model.
    Main,
    /// Reduced prompt for the pre-reply model.
    PreReply,
}

/// A global directive with its arrival time.
#[derive(Debug, Clone)]
pub struct Directive {
    /// Directive payload (persona text, preference value, voice name...).
    pub value: String,
    /// When the directive was set.
    pub timestamp: DateTime<Utc>,
}

/// Key → bounded stack of timestamped directives guiding the assistant
/// (persona, user preferences, TTS voice/style). Newest first.
#[derive(Debug, Clone, Default)]
pub struct SystemContext {
    directives: std::collections::BTreeMap<String, Vec<Directive>>,
}

/// Directives kept per key.
const DIRECTIVE_STACK_DEPTH: usize = 5;

/// Key whose updates replace instead of stacking.
const TTS_CONFIG_KEY: &str = "tts_config";

impl SystemContext {
    /// Add a directive. Most keys stack up to [`DIRECTIVE_STACK_DEPTH`]
    /// historical values; `tts_config` replaces outright.
    pub fn add(&mut self, key: &str, value: impl Into<String>) {
        let directive = Directive {
            value: value.into(),
            timestamp: Utc::now(),
        };
        if key == TTS_CONFIG_KEY {
            self.directives.insert(key.to_owned(), vec![directive]);
            return;
        }
        let stack = self.directives.entry(key.to_owned()).or_default();
        stack.insert(0, directive);
        stack.truncate(DIRECTIVE_STACK_DEPTH);
    }

    /// Newest value for a key, if any.
    pub fn latest(&self, key: &str) -> Option<&str> {
        self.directives
            .get(key)
            .and_then(|stack| stack.first())
            .map(|d| d.value.as_str())
    }

    /// Render the directives as a prompt fragment, newest value per key.
    pub fn format(&self) -> String {
        if self.directives.is_empty() {
            return String::new();
        }
        let mut lines = vec!["[session directives]".to_owned()];
        for (key, stack) in &self.directives {
            if let Some(latest) = stack.first() {
                lines.push(format!("- {key}: {}", latest.value));
            }
        }
        lines.join("\n")
    }
}

/// Append-only conversation history.
#[derive(Debug, Clone, Default)]
pub struct ConversationHistory {
    entries: Vec<HistoryEntry>,
}

impl ConversationHistory {
    /// All entries, oldest first.
    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the history is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a raw entry.
    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.push(entry);
    }

    /// Roll the history back to an earlier length (turn rollback after an
    /// unrecoverable model failure).
    pub fn truncate(&mut self, len: usize) {
        self.entries.truncate(len);
    }

    /// Commit a batch of buffered turns as one user round: one turn becomes
    /// [`HistoryEntry::User`], several become [`HistoryEntry::Multi`].
    pub fn commit_turns(&mut self, mut turns: Vec<Turn>) {
        match turns.len() {
            0 => {}
            1 => {
                let turn = turns.remove(0);
                self.entries.push(HistoryEntry::User(turn));
            }
            _ => self.entries.push(HistoryEntry::Multi(turns)),
        }
    }

    /// Truncate to the most recent entries by compressing the oldest
    /// user rounds into summaries. Returns how many entries were compressed.
    pub fn compress_overflow(&mut self, max_entries: usize) -> usize {
        let mut compressed = 0;
        while self.entries.len() > max_entries {
            let Some(pos) = self
                .entries
                .iter()
                .position(|e| matches!(e, HistoryEntry::User(_) | HistoryEntry::Multi(_)))
            else {
                break;
            };
            let summary = match &self.entries[pos] {
                HistoryEntry::User(turn) => summarize(&turn.transcript),
                HistoryEntry::Multi(turns) => {
                    let joined = turns
                        .iter()
                        .map(|t| t.transcript.as_str())
                        .collect::<Vec<_>>()
                        .join(" / ");
                    summarize(&joined)
                }
                _ => unreachable!("position matched user rounds only"),
            };
            self.entries[pos] = HistoryEntry::Compressed(CompressedTurn {
                summary,
                timestamp: Utc::now(),
            });
            compressed += 1;
            // Fold the reply that followed the compressed round into it.
            if pos + 1 < self.entries.len()
                && matches!(self.entries[pos + 1], HistoryEntry::Assistant(_))
            {
                self.entries.remove(pos + 1);
            }
        }
        compressed
    }

    /// Format the history as a chat message list.
    ///
    /// Layout per the main-reply contract: system prompt first, then the
    /// rounds in order with multi-turn groups flattened, compressed rounds
    /// rendered as summaries, and assistant entries joined as
    /// pre-reply + main text. Session directives are appended to the final
    /// message.
    pub fn format_messages(
        &self,
        system_prompt: &str,
        system_context: &SystemContext,
        pending_pre_reply: Option<&str>,
        mode: PromptMode,
    ) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage {
            role: Role::System,
            content: system_prompt.to_owned(),
        }];

        let last_user_index = self
            .entries
            .iter()
            .rposition(|e| matches!(e, HistoryEntry::User(_) | HistoryEntry::Multi(_)));

        for (index, entry) in self.entries.iter().enumerate() {
            let is_last_user = Some(index) == last_user_index;
            match entry {
                HistoryEntry::User(turn) => {
                    let mut content = render_turn(turn);
                    if is_last_user && let Some(pre) = pending_pre_reply {
                        push_pre_reply_note(&mut content, pre);
                    }
                    messages.push(ChatMessage {
                        role: Role::User,
                        content,
                    });
                }
                HistoryEntry::Multi(turns) => {
                    let mut content = turns
                        .iter()
                        .map(render_turn)
                        .collect::<Vec<_>>()
                        .join("\n---\n");
                    if is_last_user && let Some(pre) = pending_pre_reply {
                        push_pre_reply_note(&mut content, pre);
                    }
                    messages.push(ChatMessage {
                        role: Role::User,
                        content,
                    });
                }
                HistoryEntry::Compressed(turn) => {
                    messages.push(ChatMessage {
                        role: Role::User,
                        content: format!("summary of round: {}", turn.summary),
                    });
                }
                HistoryEntry::Assistant(reply) => {
                    let content = match mode {
                        PromptMode::Main => format!("{}{}", reply.pre_reply, reply.text),
                        PromptMode::PreReply => reply.pre_reply.clone(),
                    };
                    messages.push(ChatMessage {
                        role: Role::Assistant,
                        content,
                    });
                }
            }
        }

        let directives = system_context.format();
        if !directives.is_empty()
            && let Some(last) = messages.last_mut()
        {
            last.content.push_str("\n\n");
            last.content.push_str(&directives);
        }

        messages
    }
}

/// Render one turn: transcript plus attachment and memory annotations.
fn render_turn(turn: &Turn) -> String {
    let mut content = turn.transcript.clone();
    if !turn.image_refs.is_empty() {
        let described = turn
            .image_refs
            .iter()
            .enumerate()
            .map(|(i, img)| format!("image {}: {}", i + 1, img.description))
            .collect::<Vec<_>>()
            .join(", ");
        content.push_str(&format!("\n\n[user provided images: {described}]"));
    }
    if !turn.retrieved_memories.is_empty() {
        let joined = turn
            .retrieved_memories
            .iter()
            .map(|m| m.text.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        content.push_str(&format!("\n\n[related memories: {joined}]"));
    }
    content
}

/// Note an already-played pre-reply so the main model continues from it.
fn push_pre_reply_note(content: &mut String, pre_reply: &str) {
    let text = pre_reply
        .split_once('\n')
        .map_or(pre_reply, |(_, rest)| rest)
        .trim();
    content.push_str(&format!(
        "\n\n[a filler line was already played to the user: {text}]\
         \nContinue from it naturally and do not repeat it."
    ));
}

fn summarize(text: &str) -> String {
    const MAX_SUMMARY_CHARS: usize = 80;
    let mut summary: String = text.chars().take(MAX_SUMMARY_CHARS).collect();
    if text.chars().count() > MAX_SUMMARY_CHARS {
        summary.push('…');
    }
    summary
}
