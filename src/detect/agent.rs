//! LLM-driven event recognition for the turn state machine.
//!
//! The classifier sees the current state, the recent dialogue with the
//! state/event recorded per user turn, and any rejected transitions from
//! previous rounds, then names one event to apply. Invalid or unparseable
//! answers never move the machine; they become feedback in the next prompt.

use std::collections::VecDeque;

use tracing::warn;

use crate::config::LlmConfig;
use crate::detect::state_machine::{StateMachine, TurnEvent, TurnState};
use crate::error::{CoreError, Disposition};
use crate::llm::{ChatMessage, LlmClient};
use crate::tts::strip_emotion_tags;

const CLASSIFIER_SYSTEM_PROMPT: &str = "\
You are the turn-state event recognizer of a realtime voice assistant. \
Given the current state and the recent dialogue annotated with past states \
and events, decide whether a state event should fire.

Events:
- TRIGGER_DIALOGUE: the user wants alternating turn-taking (\"let's \
discuss\", \"your turn\"), or the conversation is already one-for-one.
- TRIGGER_SILENCE: the user wants to keep the floor (\"let me finish\", \
\"don't interrupt\"), or is clearly mid-narration.
- TRIGGER_ANSWER_ONCE: the user asks for exactly one answer inside a longer \
monologue (\"what do you think?\", \"give me one line\"). After the answer \
the assistant returns to listening.
- TRIGGER_PROACTIVE: the user hands the assistant the initiative (\"walk me \
through it\", \"you explain\").
- NO_EVENT: nothing above clearly applies; keep the current state. This is \
the right answer most of the time.

State rules:
- Dialogue allows TRIGGER_SILENCE, TRIGGER_PROACTIVE, TRIGGER_DIALOGUE.
- Silence allows TRIGGER_DIALOGUE, TRIGGER_ANSWER_ONCE, TRIGGER_PROACTIVE, \
TRIGGER_SILENCE.
- AnswerOnce allows nothing; always answer NO_EVENT there.
- Proactive allows TRIGGER_DIALOGUE, TRIGGER_SILENCE, TRIGGER_PROACTIVE.

Answer with exactly one JSON object and nothing else:
{\"event\": \"NO_EVENT\"}";

/// One remembered dialogue line.
#[derive(Debug, Clone)]
enum DialogueLine {
    User {
        transcript: String,
        state: TurnState,
        event: TurnEvent,
    },
    Assistant(String),
}

/// Stateful classifier driving the [`StateMachine`].
#[derive(Debug)]
pub struct StatefulAgent {
    machine: StateMachine,
    lines: VecDeque<DialogueLine>,
    depth: usize,
    parse_feedback: Vec<String>,
}

impl StatefulAgent {
    /// Create an agent keeping `depth` user turns of context.
    pub fn new(depth: usize) -> Self {
        Self {
            machine: StateMachine::new(),
            lines: VecDeque::new(),
            depth: depth.max(1),
            parse_feedback: Vec::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> TurnState {
        self.machine.state()
    }

    /// Force a state (session reset, AnswerOnce unwind before a new turn).
    pub fn set_state(&mut self, state: TurnState) {
        self.machine.set_state(state);
    }

    /// Apply an internally raised event (RESPONSE_COMPLETE after an
    /// AnswerOnce reply).
    pub fn apply(&mut self, event: TurnEvent) -> TurnState {
        self.machine.apply(event)
    }

    /// Remember a finished assistant reply for future prompts.
    pub fn note_assistant_reply(&mut self, text: &str) {
        let cleaned = strip_emotion_tags(text);
        if cleaned.is_empty() {
            return;
        }
        self.lines.push_back(DialogueLine::Assistant(cleaned));
        self.trim();
    }

    /// Reset to the initial state and forget the dialogue.
    pub fn reset(&mut self) {
        self.machine = StateMachine::new();
        self.lines.clear();
        self.parse_feedback.clear();
    }

    /// Classify the transcript into an event and apply it.
    ///
    /// On any failure — request error, unparseable output, unknown event —
    /// the state is kept and the anomaly is queued as feedback for the next
    /// prompt.
    pub async fn classify(
        &mut self,
        client: &LlmClient,
        config: &LlmConfig,
        transcript: &str,
    ) -> TurnState {
        let messages = vec![
            ChatMessage::system(CLASSIFIER_SYSTEM_PROMPT),
            ChatMessage::user(self.render_prompt(transcript)),
        ];

        let recognized = match client.complete(&config.classifier_model, &messages).await {
            Ok(reply) => parse_event(&reply).ok_or_else(|| {
                CoreError::Parse(format!("classifier reply {reply:?} is not an event JSON"))
            }),
            Err(e) => Err(e),
        };

        let event = match recognized {
            Ok(event) => event,
            Err(e) => {
                // A logic failure is the model's own doing and goes into the
                // next prompt; a transport or vendor failure is not.
                match e.disposition() {
                    Disposition::Logic => {
                        warn!(error = %e, "keeping state");
                        self.push_parse_feedback(format!(
                            "{e}; answer with one JSON object like {{\"event\": \"NO_EVENT\"}}"
                        ));
                    }
                    Disposition::Transient | Disposition::Vendor | Disposition::Fatal => {
                        warn!(error = %e, "classifier request failed; keeping state");
                    }
                }
                TurnEvent::NoEvent
            }
        };

        let state = self.machine.apply(event);
        self.lines.push_back(DialogueLine::User {
            transcript: transcript.to_owned(),
            state,
            event,
        });
        self.trim();
        state
    }

    fn trim(&mut self) {
        let mut user_turns = self
            .lines
            .iter()
            .filter(|l| matches!(l, DialogueLine::User { .. }))
            .count();
        while user_turns > self.depth {
            if matches!(self.lines.pop_front(), Some(DialogueLine::User { .. })) {
                user_turns -= 1;
            }
        }
    }

    fn push_parse_feedback(&mut self, message: String) {
        self.parse_feedback.push(message);
        if self.parse_feedback.len() > 3 {
            self.parse_feedback.remove(0);
        }
    }

    /// Render the user prompt: feedback, annotated dialogue, current state,
    /// and the transcript to classify.
    fn render_prompt(&self, transcript: &str) -> String {
        let mut sections = Vec::new();

        let mut feedback: Vec<String> = self
            .machine
            .feedback()
            .iter()
            .map(|f| format!("[feedback] {}", f.message))
            .collect();
        feedback.extend(self.parse_feedback.iter().map(|m| format!("[feedback] {m}")));
        if !feedback.is_empty() {
            sections.push(feedback.join("\n"));
        }

        let mut dialogue = Vec::new();
        for line in &self.lines {
            match line {
                DialogueLine::User {
                    transcript,
                    state,
                    event,
                } => {
                    dialogue.push(format!(
                        "User said: {transcript}\n【System state】: {}\n【Triggered event】: {}\n-----",
                        state.name(),
                        event.name()
                    ));
                }
                DialogueLine::Assistant(text) => {
                    dialogue.push(format!("Assistant said: {text}"));
                }
            }
        }
        if !dialogue.is_empty() {
            sections.push(format!("Recent dialogue:\n{}", dialogue.join("\n")));
        }

        sections.push(format!(
            "CurrentState: \"{}\"\nUser said: {transcript}\n\
             Name the event to trigger as a single JSON object.",
            self.machine.state().name()
        ));
        sections.join("\n\n")
    }
}

/// Parse the classifier reply into an event, tolerating code fences and
/// surrounding prose.
fn parse_event(reply: &str) -> Option<TurnEvent> {
    let body = extract_json_object(reply)?;
    let value: serde_json::Value = serde_json::from_str(&body).ok()?;
    let name = value.get("event")?.as_str()?;
    TurnEvent::parse(name)
}

/// The first `{...}` span in the text, with any ```json fences removed.
fn extract_json_object(text: &str) -> Option<String> {
    let text = text.trim();
    let unfenced = if let Some(rest) = text.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        rest.rsplit_once("```").map_or(rest, |(inner, _)| inner)
    } else {
        text
    };
    let start = unfenced.find('{')?;
    let end = unfenced.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(unfenced[start..=end].to_owned())
}
