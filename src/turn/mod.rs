//! Turn buffering and silence tracking.
//!
//! [`TurnBuffer`] holds finalized user turns that have not yet been handed
//! to the main reply model. [`SilenceTracker`] measures the gap since the
//! last STT finalization and mints the epochs that gate every downstream
//! emission.

pub mod history;
pub mod silence;

pub use history::{
    AssistantReply, CompressedTurn, ConversationHistory, Directive, HistoryEntry, ImageRef,
    PromptMode, SystemContext, Turn,
};
pub use silence::{Epoch, SilenceTracker};

/// A generated pre-reply, remembered with the number of buffered turns at
/// generation time so a filler computed for a smaller buffer is never
/// spoken for a larger one.
#[derive(Debug, Clone)]
pub struct PreReply {
    /// `[EMOTION]\n<filler>` text as produced by the pre-reply model.
    pub text: String,
    /// Buffered turn count when the filler was generated.
    pub turn_count: usize,
}

/// Ordered turns awaiting the main reply model.
#[derive(Debug, Default)]
pub struct TurnBuffer {
    turns: Vec<Turn>,
    pre_reply: Option<PreReply>,
}

impl TurnBuffer {
    /// Append a finalized turn.
    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    /// Number of buffered turns.
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Borrow the buffered turns.
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Mutable access to the most recent turn (memory/command hooks attach
    /// their results here).
    pub fn last_turn_mut(&mut self) -> Option<&mut Turn> {
        self.turns.last_mut()
    }

    /// Deep copy of the buffered turns, for timer context snapshots.
    pub fn snapshot(&self) -> Vec<Turn> {
        self.turns.clone()
    }

    /// Record the freshly generated pre-reply for the current buffer size.
    pub fn set_pre_reply(&mut self, text: impl Into<String>) {
        self.pre_reply = Some(PreReply {
            text: text.into(),
            turn_count: self.turns.len(),
        });
    }

    /// The stored pre-reply, only if it still matches the buffer size.
    pub fn valid_pre_reply(&self) -> Option<&str> {
        self.pre_reply
            .as_ref()
            .filter(|p| p.turn_count == self.turns.len())
            .map(|p| p.text.as_str())
    }

    /// Drain the buffered turns for hand-off to the history, keeping
    /// nothing behind.
    pub fn drain(&mut self) -> Vec<Turn> {
        self.pre_reply = None;
        std::mem::take(&mut self.turns)
    }

    /// Drop everything (barge-in hard reset or session reset).
    pub fn clear(&mut self) {
        self.turns.clear();
        self.pre_reply = None;
    }

    /// Restore a previously snapshotted state (turn rollback).
    pub fn restore(&mut self, turns: Vec<Turn>) {
        self.turns = turns;
        self.pre_reply = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_drain() {
        let mut buffer = TurnBuffer::default();
        buffer.push(Turn::new("a"));
        buffer.push(Turn::new("b"));
        assert_eq!(buffer.len(), 2);
        let drained = buffer.drain();
        assert_eq!(drained.len(), 2);
        assert!(buffer.is_empty());
    }

    #[test]
    fn pre_reply_valid_for_matching_count() {
        let mut buffer = TurnBuffer::default();
        buffer.push(Turn::new("a"));
        buffer.set_pre_reply("[HAPPY]\nOkay,");
        assert_eq!(buffer.valid_pre_reply(), Some("[HAPPY]\nOkay,"));
    }

    #[test]
    fn pre_reply_stale_after_buffer_grows() {
        let mut buffer = TurnBuffer::default();
        buffer.push(Turn::new("a"));
        buffer.set_pre_reply("[HAPPY]\nOkay,");
        buffer.push(Turn::new("b"));
        assert_eq!(buffer.valid_pre_reply(), None);
    }

    #[test]
    fn drain_discards_pre_reply() {
        let mut buffer = TurnBuffer::default();
        buffer.push(Turn::new("a"));
        buffer.set_pre_reply("[NEUTRAL]\nHm,");
        let _ = buffer.drain();
        buffer.push(Turn::new("b"));
        assert_eq!(buffer.valid_pre_reply(), None);
    }

    #[test]
    fn restore_replaces_contents() {
        let mut buffer = TurnBuffer::default();
        buffer.push(Turn::new("new"));
        buffer.restore(vec![Turn::new("old one"), Turn::new("old two")]);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.turns()[0].transcript, "old one");
    }
}
