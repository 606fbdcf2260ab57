//! Pre-reply generation.
//!
//! While turn detection is still deciding whether the user has finished,
//! a low-latency model produces a short emotion-tagged filler. If the
//! turn's timer fires, the filler is spoken first and masks the main
//! model's latency; it must stay conversational and commit to nothing.

use crate::config::{LlmConfig, TimingConfig};
use crate::error::Result;
use crate::llm::{ChatMessage, LlmClient};
use crate::tts::split_emotion_prefix;
use crate::turn::{ConversationHistory, PromptMode, SystemContext, Turn};

const PRE_REPLY_SYSTEM_PROMPT: &str = "\
You are the pre-reply model of a realtime voice assistant. The user has \
just paused; produce a very short filler line that will be spoken while \
the main reply is still being generated.

Output format, exactly two lines:
1. An emotion tag, one of [NEUTRAL] [HAPPY] [SAD] [ANGRY] [FEARFUL] \
[DISGUSTED] [SURPRISED].
2. A filler of 2-7 characters ending in a comma or colon, e.g. \"好的,\" \
or \"let me see:\".

Rules:
- Stay compatible with any full answer that could follow; never commit to \
content, numbers, or yes/no.
- Vary your wording; avoid repeating the fillers already in the history.
- Nothing but the two lines.";

/// Generate a pre-reply for the buffered turns.
///
/// The prompt sees the recent rounds plus the pending buffer; the reply is
/// normalized to the `[EMOTION]\n<filler>` shape even when the model skips
/// the tag.
///
/// # Errors
///
/// Returns an error when the request fails after retries; the caller skips
/// the pre-reply in that case.
pub async fn generate_pre_reply(
    client: &LlmClient,
    config: &LlmConfig,
    timing: &TimingConfig,
    history: &ConversationHistory,
    system_context: &SystemContext,
    buffered: &[Turn],
) -> Result<String> {
    let mut scratch = history.clone();
    scratch.commit_turns(buffered.to_vec());
    let formatted = scratch.format_messages("", system_context, None, PromptMode::PreReply);

    // Recent rounds only: the pending round plus the configured window.
    let window = 1 + timing.pre_reply_rounds * 2;
    let tail_start = formatted.len().saturating_sub(window).max(1);

    let mut messages = vec![ChatMessage::system(PRE_REPLY_SYSTEM_PROMPT)];
    messages.extend_from_slice(&formatted[tail_start..]);

    let reply = client.complete(&config.fast_model, &messages).await?;
    Ok(normalize(&reply))
}

/// Force the `[EMOTION]\nfiller` shape on a model reply.
fn normalize(reply: &str) -> String {
    let trimmed = reply.trim();
    let (emotion, body) = split_emotion_prefix(trimmed);
    match emotion {
        Some(emotion) => format!("[{}]\n{}", emotion.tag(), body.trim()),
        None => format!("[NEUTRAL]\n{}", trimmed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn reply_body(content: &str) -> serde_json::Value {
        serde_json::json!({"choices": [{"message": {"role": "assistant", "content": content}}]})
    }

    async fn generate_with(content: &str, buffered: &[Turn]) -> String {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"model": "qwen-turbo-latest"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply_body(content)))
            .mount(&server)
            .await;
        let config = LlmConfig {
            api_url: server.uri(),
            api_key: "k".to_owned(),
            max_retries: 0,
            ..LlmConfig::default()
        };
        let client = LlmClient::new(&config).expect("client");
        generate_pre_reply(
            &client,
            &config,
            &TimingConfig::default(),
            &ConversationHistory::default(),
            &SystemContext::default(),
            buffered,
        )
        .await
        .expect("pre-reply")
    }

    #[tokio::test]
    async fn tagged_reply_passes_through() {
        let out = generate_with("[HAPPY]\n好的,", &[Turn::new("介绍一下你自己")]).await;
        assert_eq!(out, "[HAPPY]\n好的,");
    }

    #[tokio::test]
    async fn untagged_reply_gets_neutral_tag() {
        let out = generate_with("让我想想,", &[Turn::new("嗯")]).await;
        assert_eq!(out, "[NEUTRAL]\n让我想想,");
    }

    #[tokio::test]
    async fn uses_fast_model() {
        // The body_partial_json matcher above rejects any other model name;
        // reaching a reply proves the fast model was requested.
        let out = generate_with("[SAD]\n听起来很累,", &[Turn::new("我有点累")]).await;
        assert!(out.starts_with("[SAD]"));
    }

    #[test]
    fn normalize_trims_noise() {
        assert_eq!(normalize("  [SURPRISED]\n 哇, \n"), "[SURPRISED]\n哇,");
        assert_eq!(normalize("嗯,"), "[NEUTRAL]\n嗯,");
    }
}
