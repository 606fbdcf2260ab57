//! Finite state machine governing whether and when the assistant speaks.

use tracing::{info, warn};

/// Conversational mode of the assistant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    /// Alternating question/answer mode; the assistant replies after the
    /// judged cooldown.
    Dialogue,
    /// The assistant listens and never speaks until explicitly triggered.
    Silence,
    /// The assistant answers exactly once, then returns to Silence.
    AnswerOnce,
    /// The assistant holds the initiative and may interject.
    Proactive,
}

impl TurnState {
    /// Display name used in classifier prompts and logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Dialogue => "Dialogue",
            Self::Silence => "Silence",
            Self::AnswerOnce => "AnswerOnce",
            Self::Proactive => "Proactive",
        }
    }
}

/// Event recognized by the classifier (or raised internally on reply
/// completion).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEvent {
    /// User wants alternating turn-taking.
    TriggerDialogue,
    /// User wants the assistant to only listen.
    TriggerSilence,
    /// User wants exactly one answer, then continued listening.
    TriggerAnswerOnce,
    /// The assistant should take the initiative.
    TriggerProactive,
    /// The current reply finished generating.
    ResponseComplete,
    /// Nothing recognized; keep the current state.
    NoEvent,
}

impl TurnEvent {
    /// Wire name as emitted by the classifier.
    pub fn name(self) -> &'static str {
        match self {
            Self::TriggerDialogue => "TRIGGER_DIALOGUE",
            Self::TriggerSilence => "TRIGGER_SILENCE",
            Self::TriggerAnswerOnce => "TRIGGER_ANSWER_ONCE",
            Self::TriggerProactive => "TRIGGER_PROACTIVE",
            Self::ResponseComplete => "RESPONSE_COMPLETE",
            Self::NoEvent => "NO_EVENT",
        }
    }

    /// Parse a classifier event name (case-insensitive).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "TRIGGER_DIALOGUE" => Some(Self::TriggerDialogue),
            "TRIGGER_SILENCE" => Some(Self::TriggerSilence),
            "TRIGGER_ANSWER_ONCE" => Some(Self::TriggerAnswerOnce),
            "TRIGGER_PROACTIVE" => Some(Self::TriggerProactive),
            "RESPONSE_COMPLETE" => Some(Self::ResponseComplete),
            "NO_EVENT" => Some(Self::NoEvent),
            _ => None,
        }
    }
}

/// The legal transition for `(state, event)`, or `None` when the event is
/// invalid in that state. `NoEvent` is a legal self-loop everywhere.
pub fn transition(state: TurnState, event: TurnEvent) -> Option<TurnState> {
    use TurnEvent::*;
    use TurnState::*;
    match (state, event) {
        (_, NoEvent) => Some(state),

        (Dialogue, TriggerDialogue) => Some(Dialogue),
        (Dialogue, TriggerSilence) => Some(Silence),
        (Dialogue, TriggerProactive) => Some(Proactive),
        (Dialogue, TriggerAnswerOnce | ResponseComplete) => None,

        (Silence, TriggerDialogue) => Some(Dialogue),
        (Silence, TriggerSilence) => Some(Silence),
        (Silence, TriggerAnswerOnce) => Some(AnswerOnce),
        (Silence, TriggerProactive) => Some(Proactive),
        (Silence, ResponseComplete) => None,

        (AnswerOnce, ResponseComplete) => Some(Silence),
        (AnswerOnce, _) => None,

        (Proactive, TriggerDialogue) => Some(Dialogue),
        (Proactive, TriggerSilence) => Some(Silence),
        (Proactive, TriggerProactive) => Some(Proactive),
        (Proactive, TriggerAnswerOnce | ResponseComplete) => None,
    }
}

/// A rejected transition, kept for classifier self-correction.
#[derive(Debug, Clone)]
pub struct TransitionFeedback {
    /// State the machine was in.
    pub from_state: TurnState,
    /// The rejected event.
    pub event: TurnEvent,
    /// Human-readable message injected into the next classifier prompt.
    pub message: String,
}

/// Feedback entries kept for the next prompt.
const FEEDBACK_DEPTH: usize = 3;

/// State machine with invalid-transition feedback collection.
#[derive(Debug)]
pub struct StateMachine {
    state: TurnState,
    feedback: Vec<TransitionFeedback>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Start in Dialogue, the default conversational mode.
    pub fn new() -> Self {
        Self {
            state: TurnState::Dialogue,
            feedback: Vec::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Force the state directly (session reset, AnswerOnce unwind).
    pub fn set_state(&mut self, state: TurnState) {
        if self.state != state {
            info!(from = self.state.name(), to = state.name(), "state forced");
        }
        self.state = state;
    }

    /// Apply an event. Invalid transitions are not applied; they are logged
    /// into the feedback buffer so the next classification prompt can
    /// self-correct.
    pub fn apply(&mut self, event: TurnEvent) -> TurnState {
        match transition(self.state, event) {
            Some(next) => {
                if next != self.state {
                    info!(
                        from = self.state.name(),
                        to = next.name(),
                        event = event.name(),
                        "state transition"
                    );
                }
                self.state = next;
            }
            None => {
                let message = format!(
                    "event {} is not valid in state {}; state unchanged",
                    event.name(),
                    self.state.name()
                );
                warn!("{message}");
                self.feedback.push(TransitionFeedback {
                    from_state: self.state,
                    event,
                    message,
                });
                if self.feedback.len() > FEEDBACK_DEPTH {
                    self.feedback.remove(0);
                }
            }
        }
        self.state
    }

    /// Recent rejected transitions, oldest first.
    pub fn feedback(&self) -> &[TransitionFeedback] {
        &self.feedback
    }

    /// Drop collected feedback (after it has been surfaced in a prompt).
    pub fn clear_feedback(&mut self) {
        self.feedback.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TurnEvent::*;
    use TurnState::*;

    // ── Transition table ──────────────────────────────────────

    #[test]
    fn dialogue_transitions() {
        assert_eq!(transition(Dialogue, TriggerDialogue), Some(Dialogue));
        assert_eq!(transition(Dialogue, TriggerSilence), Some(Silence));
        assert_eq!(transition(Dialogue, TriggerProactive), Some(Proactive));
        assert_eq!(transition(Dialogue, TriggerAnswerOnce), None);
        assert_eq!(transition(Dialogue, ResponseComplete), None);
    }

    #[test]
    fn silence_transitions() {
        assert_eq!(transition(Silence, TriggerDialogue), Some(Dialogue));
        assert_eq!(transition(Silence, TriggerSilence), Some(Silence));
        assert_eq!(transition(Silence, TriggerAnswerOnce), Some(AnswerOnce));
        assert_eq!(transition(Silence, TriggerProactive), Some(Proactive));
        assert_eq!(transition(Silence, ResponseComplete), None);
    }

    #[test]
    fn answer_once_only_completes() {
        assert_eq!(transition(AnswerOnce, ResponseComplete), Some(Silence));
        assert_eq!(transition(AnswerOnce, TriggerDialogue), None);
        assert_eq!(transition(AnswerOnce, TriggerSilence), None);
        assert_eq!(transition(AnswerOnce, TriggerAnswerOnce), None);
        assert_eq!(transition(AnswerOnce, TriggerProactive), None);
    }

    #[test]
    fn proactive_transitions() {
        assert_eq!(transition(Proactive, TriggerDialogue), Some(Dialogue));
        assert_eq!(transition(Proactive, TriggerSilence), Some(Silence));
        assert_eq!(transition(Proactive, TriggerProactive), Some(Proactive));
        assert_eq!(transition(Proactive, TriggerAnswerOnce), None);
        assert_eq!(transition(Proactive, ResponseComplete), None);
    }

    #[test]
    fn no_event_holds_every_state() {
        for state in [Dialogue, Silence, AnswerOnce, Proactive] {
            assert_eq!(transition(state, NoEvent), Some(state));
        }
    }

    // ── Machine behavior ──────────────────────────────────────

    #[test]
    fn starts_in_dialogue() {
        assert_eq!(StateMachine::new().state(), Dialogue);
    }

    #[test]
    fn invalid_event_keeps_state_and_records_feedback() {
        let mut machine = StateMachine::new();
        machine.apply(TriggerAnswerOnce);
        assert_eq!(machine.state(), Dialogue);
        assert_eq!(machine.feedback().len(), 1);
        assert!(machine.feedback()[0].message.contains("TRIGGER_ANSWER_ONCE"));
    }

    #[test]
    fn feedback_buffer_is_bounded() {
        let mut machine = StateMachine::new();
        for _ in 0..6 {
            machine.apply(ResponseComplete);
        }
        assert_eq!(machine.feedback().len(), 3);
    }

    #[test]
    fn answer_once_round_trip() {
        let mut machine = StateMachine::new();
        machine.apply(TriggerSilence);
        machine.apply(TriggerAnswerOnce);
        assert_eq!(machine.state(), AnswerOnce);
        machine.apply(ResponseComplete);
        assert_eq!(machine.state(), Silence);
    }

    #[test]
    fn event_names_round_trip() {
        for event in [
            TriggerDialogue,
            TriggerSilence,
            TriggerAnswerOnce,
            TriggerProactive,
            ResponseComplete,
            NoEvent,
        ] {
            assert_eq!(TurnEvent::parse(event.name()), Some(event));
        }
        assert_eq!(TurnEvent::parse("bogus"), None);
    }
}
