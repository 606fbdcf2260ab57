//! Semantic turn detection.
//!
//! Two classifiers run concurrently on every finalized transcript: the
//! dialogue judge proposes a cooldown in milliseconds and the stateful
//! agent drives the conversational state machine. Their combination yields
//! one [`Timer`] that gates everything the assistant says for that turn.

pub mod agent;
pub mod dialogue;
pub mod state_machine;
pub mod timer;

use std::sync::{Arc, Mutex};

use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::{LlmConfig, TimingConfig};
use crate::llm::LlmClient;
use crate::turn::SilenceTracker;

pub use agent::StatefulAgent;
pub use dialogue::{JudgeHistory, JudgeRecord, dialogue_timeout};
pub use state_machine::{StateMachine, TransitionFeedback, TurnEvent, TurnState, transition};
pub use timer::{ContextSnapshot, Timer};

/// Cooldown used for the Silence state: the timer must never fire, and the
/// caller additionally suppresses the turn outright.
const SILENCE_TIMEOUT_MS: u64 = u64::MAX;

/// Run both classifiers for one finalized transcript and build the turn's
/// timer.
///
/// The epoch binding and the clock are captured on entry: a partial that
/// arrives while the classifiers are in flight leaves the returned timer
/// permanently invalid. A pending AnswerOnce state is unwound to Silence
/// first, so an interrupted one-shot reply can never wedge the machine
/// (see DESIGN.md).
#[allow(clippy::too_many_arguments)]
pub async fn detect_turn(
    client: &LlmClient,
    llm_config: &LlmConfig,
    timing: &TimingConfig,
    agent: &mut StatefulAgent,
    judges: &Mutex<JudgeHistory>,
    silence: &SilenceTracker,
    saved: ContextSnapshot,
    transcript: &str,
) -> Arc<Timer> {
    let bound_epoch = silence.epoch();
    let started = Instant::now();

    if agent.state() == TurnState::AnswerOnce {
        agent.set_state(TurnState::Silence);
    }

    let (state, judged_ms) = tokio::join!(
        agent.classify(client, llm_config, transcript),
        dialogue_timeout(client, &llm_config.fast_model, timing, judges, transcript),
    );

    let timeout_ms = match state {
        TurnState::Dialogue => judged_ms,
        TurnState::Silence => {
            silence.halt_growth();
            SILENCE_TIMEOUT_MS
        }
        TurnState::AnswerOnce => 0,
        TurnState::Proactive => {
            // The proactive interjection loop runs outside the turn path;
            // here Proactive only affects the cooldown.
            info!("proactive state active for this turn");
            judged_ms
        }
    };

    debug!(
        state = state.name(),
        timeout_ms,
        epoch = bound_epoch.value(),
        "turn detection complete"
    );

    Arc::new(Timer::bound(
        timeout_ms,
        state,
        silence,
        bound_epoch,
        started,
        saved,
        timing.timer_tick_ms,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Both classifiers hit the same mock endpoint; the body carries a JSON
    /// event for the agent and a trailing integer for the judge.
    async fn setup(reply: &str) -> (MockServer, LlmClient, LlmConfig) {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": reply}}]
            })))
            .mount(&server)
            .await;
        let config = LlmConfig {
            api_url: server.uri(),
            api_key: "k".to_owned(),
            max_retries: 0,
            ..LlmConfig::default()
        };
        let client = LlmClient::new(&config).expect("client");
        (server, client, config)
    }

    fn snapshot() -> ContextSnapshot {
        ContextSnapshot {
            turns: Vec::new(),
            history_len: 0,
        }
    }

    #[tokio::test]
    async fn dialogue_state_uses_judged_timeout() {
        let (_server, client, config) = setup("{\"event\": \"NO_EVENT\"}\n250").await;
        let timing = TimingConfig::default();
        let mut agent = StatefulAgent::new(7);
        let judges = Mutex::new(JudgeHistory::new(14));
        let silence = SilenceTracker::new(3);
        silence.restart(0);

        let timer = detect_turn(
            &client, &config, &timing, &mut agent, &judges, &silence, snapshot(), "你好",
        )
        .await;
        assert_eq!(timer.state(), TurnState::Dialogue);
        assert_eq!(
            judges.lock().expect("lock").latest().map(|r| r.predicted_ms),
            Some(250)
        );
        assert!(timer.assure_no_interruption());
    }

    #[tokio::test]
    async fn silence_state_halts_growth_and_never_fires() {
        let (_server, client, config) = setup("{\"event\": \"TRIGGER_SILENCE\"}\n300").await;
        let timing = TimingConfig::default();
        let mut agent = StatefulAgent::new(7);
        let judges = Mutex::new(JudgeHistory::new(14));
        let silence = SilenceTracker::new(3);
        silence.restart(0);

        let timer = detect_turn(
            &client, &config, &timing, &mut agent, &judges, &silence, snapshot(), "你听我说",
        )
        .await;
        assert_eq!(timer.state(), TurnState::Silence);
        assert!(!silence.is_growing());
        assert!(!timer.wait_for_timeout().await);
    }

    #[tokio::test]
    async fn answer_once_fires_immediately() {
        let (_server, client, config) = setup("{\"event\": \"TRIGGER_ANSWER_ONCE\"}\n400").await;
        let timing = TimingConfig::default();
        let mut agent = StatefulAgent::new(7);
        agent.set_state(TurnState::Silence);
        let judges = Mutex::new(JudgeHistory::new(14));
        let silence = SilenceTracker::new(3);
        silence.restart(0);

        let timer = detect_turn(
            &client, &config, &timing, &mut agent, &judges, &silence, snapshot(), "你怎么看",
        )
        .await;
        assert_eq!(timer.state(), TurnState::AnswerOnce);
        assert!(timer.wait_for_timeout().await);
    }

    #[tokio::test]
    async fn stale_answer_once_unwinds_to_silence_first() {
        let (_server, client, config) = setup("{\"event\": \"NO_EVENT\"}\n200").await;
        let timing = TimingConfig::default();
        let mut agent = StatefulAgent::new(7);
        agent.set_state(TurnState::AnswerOnce);
        let judges = Mutex::new(JudgeHistory::new(14));
        let silence = SilenceTracker::new(3);
        silence.restart(0);

        let timer = detect_turn(
            &client, &config, &timing, &mut agent, &judges, &silence, snapshot(), "继续",
        )
        .await;
        assert_eq!(timer.state(), TurnState::Silence);
    }

    #[tokio::test]
    async fn partial_during_classification_kills_the_timer() {
        let (_server, client, config) = setup("{\"event\": \"NO_EVENT\"}\n200").await;
        let timing = TimingConfig::default();
        let mut agent = StatefulAgent::new(7);
        let judges = Mutex::new(JudgeHistory::new(14));
        let silence = SilenceTracker::new(3);
        silence.restart(0);

        // Simulate the user resuming while detection runs by flipping the
        // epoch between binding and timer construction.
        let epoch_before = silence.epoch();
        silence.on_partial();
        let timer = Arc::new(Timer::bound(
            200,
            TurnState::Dialogue,
            &silence,
            epoch_before,
            Instant::now(),
            snapshot(),
            timing.timer_tick_ms,
        ));
        let _ = (&client, &config, &mut agent, &judges);
        assert!(!timer.assure_no_interruption());
        assert!(!timer.wait_for_timeout().await);
    }
}
