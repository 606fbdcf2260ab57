//! Dialogue-mode turn-end judge.
//!
//! For every finalized transcript an LLM predicts how long the assistant
//! should wait before speaking, in milliseconds. Past judgements — together
//! with what the user actually did — are replayed into the prompt so the
//! model corrects its own calibration over time.

use std::collections::VecDeque;
use std::sync::Mutex;

use tracing::warn;

use crate::config::TimingConfig;
use crate::error::{CoreError, Disposition, Result};
use crate::llm::{ChatMessage, LlmClient};

/// System prompt for the turn-end judge. The model must answer with a bare
/// integer number of milliseconds in [0, 800].
const JUDGE_SYSTEM_PROMPT: &str = "\
You are a turn-taking judge for a realtime voice assistant. Given the \
user's latest utterance and your past judgements with their outcomes, \
predict whether the user has finished speaking and answer with ONE integer: \
the recommended wait in milliseconds before the assistant may speak.

Reference ladder:
- 50-100 ms: certain the user finished (direct question, command)
- 100-200 ms: fairly certain (complete plain statement)
- 200-350 ms: probably finished (complete but hesitant)
- 350-500 ms: unsure (might continue after a pause)
- 500-800 ms: very unsure (clearly unfinished clause)

Humans perceive ~250 ms as a natural reply delay; waits above 500 ms feel \
sluggish and waits under 100 ms risk cutting the user off. If a past window \
was marked interrupted, lean longer; if it was marked too conservative, \
lean shorter.

Output exactly one integer between 0 and 800. No words, no units.";

/// One past judgement and its observed outcome.
#[derive(Debug, Clone)]
pub struct JudgeRecord {
    /// The transcript that was judged.
    pub transcript: String,
    /// Predicted cooldown in ms.
    pub predicted_ms: u64,
    /// Measured silence before the user actually resumed, if they did.
    pub actual_speaking_ms: Option<u64>,
    /// Whether the user resumed within the critical window.
    pub had_interrupt: bool,
    /// Whether the predicted window was graded as too conservative.
    pub too_conservative: bool,
}

/// Bounded ring of past judgements, replayed into every judge prompt.
#[derive(Debug)]
pub struct JudgeHistory {
    records: VecDeque<JudgeRecord>,
    depth: usize,
    mild_streak: u32,
}

impl JudgeHistory {
    /// Create a ring keeping the most recent `depth` judgements.
    pub fn new(depth: usize) -> Self {
        Self {
            records: VecDeque::new(),
            depth: depth.max(1),
            mild_streak: 0,
        }
    }

    /// Open a record for a new judgement before the model is consulted, so
    /// an interruption arriving mid-call still has somewhere to land.
    pub fn begin(&mut self, transcript: &str) {
        self.records.push_back(JudgeRecord {
            transcript: transcript.to_owned(),
            predicted_ms: 0,
            actual_speaking_ms: None,
            had_interrupt: false,
            too_conservative: false,
        });
        while self.records.len() > self.depth {
            self.records.pop_front();
        }
    }

    /// Store the model's prediction on the most recent record.
    pub fn set_prediction(&mut self, predicted_ms: u64) {
        if let Some(last) = self.records.back_mut() {
            last.predicted_ms = predicted_ms;
        }
    }

    /// Write the observed speaking gap back into the latest judgement and
    /// grade it.
    ///
    /// A gap below the critical threshold is an interruption. A gap past
    /// the no-interrupt tolerance grades the prediction for conservatism:
    /// severe immediately, mild only after a configured streak.
    pub fn record_gap(&mut self, gap_ms: u64, timing: &TimingConfig) {
        let mild_floor =
            (timing.critical_threshold_ms as f64 * timing.conservative_ratio_mild) as u64;
        let severe_floor =
            (timing.critical_threshold_ms as f64 * timing.conservative_ratio_severe) as u64;
        let Some(last) = self.records.back_mut() else {
            return;
        };
        last.actual_speaking_ms = Some(gap_ms);
        if gap_ms < timing.critical_threshold_ms {
            last.had_interrupt = true;
            self.mild_streak = 0;
            return;
        }
        if gap_ms < timing.no_interrupt_tolerance_ms {
            return;
        }
        // The user stayed quiet well past the critical window.
        if last.predicted_ms >= severe_floor {
            last.too_conservative = true;
            self.mild_streak = 0;
        } else if last.predicted_ms >= mild_floor {
            self.mild_streak += 1;
            if self.mild_streak >= timing.conservative_mild_streak {
                last.too_conservative = true;
                self.mild_streak = 0;
            }
        } else {
            self.mild_streak = 0;
        }
    }

    /// The stored records, oldest first.
    pub fn records(&self) -> impl Iterator<Item = &JudgeRecord> {
        self.records.iter()
    }

    /// Most recent record.
    pub fn latest(&self) -> Option<&JudgeRecord> {
        self.records.back()
    }

    /// Render past judgements as prompt messages: each round as the user
    /// utterance, the model's integer answer, and (once known) an outcome
    /// feedback line.
    pub fn prompt_messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::new();
        // The open record for the current turn has no prediction yet.
        let replayed = self.records.len().saturating_sub(1);
        for record in self.records.iter().take(replayed) {
            messages.push(ChatMessage::user(format!("User said: {}", record.transcript)));
            messages.push(ChatMessage::assistant(record.predicted_ms.to_string()));
            if let Some(actual) = record.actual_speaking_ms {
                let verdict = if record.had_interrupt {
                    "the user was interrupted; wait longer in similar cases"
                } else if record.too_conservative {
                    "the window was too conservative; wait less in similar cases"
                } else {
                    "the window was fine"
                };
                messages.push(ChatMessage::user(format!(
                    "[feedback] the user actually resumed after {actual} ms; {verdict}"
                )));
            }
        }
        messages
    }

    /// Discard the record opened for the current turn (the judge never
    /// produced a judgement, so the round must not enter the prompt).
    pub fn discard_open(&mut self) {
        if let Some(last) = self.records.back()
            && last.predicted_ms == 0
            && last.actual_speaking_ms.is_none()
        {
            self.records.pop_back();
        }
    }

    /// Drop all records (session reset).
    pub fn clear(&mut self) {
        self.records.clear();
        self.mild_streak = 0;
    }
}

/// First run of ASCII digits in the text, if any.
fn first_integer(text: &str) -> Option<u64> {
    let mut digits = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
        } else if !digits.is_empty() {
            break;
        }
    }
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Interpret a judge reply. Parsing is permissive — the first integer in
/// the reply wins, clamped to the configured ceiling.
///
/// # Errors
///
/// Returns a parse error when the reply contains no integer at all.
fn parse_judgement(reply: &str, timing: &TimingConfig) -> Result<u64> {
    first_integer(reply)
        .map(|ms| ms.min(timing.extra_wait_ms))
        .ok_or_else(|| CoreError::Parse(format!("judge reply {reply:?} has no integer")))
}

/// Judge the cooldown for a finalized transcript.
///
/// Opens a judgement record, consults the model, and stores the clamped
/// prediction. Failures fall back to the mid wait, switched on the error
/// disposition: a logic failure (unparseable reply) keeps the round so
/// the next prompt can self-correct, while a transport or vendor failure
/// discards it — no judgement actually happened.
pub async fn dialogue_timeout(
    client: &LlmClient,
    model: &str,
    timing: &TimingConfig,
    history: &Mutex<JudgeHistory>,
    transcript: &str,
) -> u64 {
    let messages = {
        let mut guard = history.lock().expect("judge history lock");
        guard.begin(transcript);
        let mut messages = vec![ChatMessage::system(JUDGE_SYSTEM_PROMPT)];
        messages.extend(guard.prompt_messages());
        messages.push(ChatMessage::user(format!("User said: {transcript}")));
        messages
    };

    let judged = match client.complete(model, &messages).await {
        Ok(reply) => parse_judgement(&reply, timing),
        Err(e) => Err(e),
    };

    let mut guard = history.lock().expect("judge history lock");
    match judged {
        Ok(ms) => {
            guard.set_prediction(ms);
            ms
        }
        Err(e) => match e.disposition() {
            Disposition::Logic => {
                warn!(error = %e, "using mid wait");
                guard.set_prediction(timing.mid_wait_ms);
                timing.mid_wait_ms
            }
            Disposition::Transient | Disposition::Vendor | Disposition::Fatal => {
                warn!(error = %e, "judge request failed; using mid wait");
                guard.discard_open();
                timing.mid_wait_ms
            }
        },
    }
}
