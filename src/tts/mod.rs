//! Text-to-speech vendor seam and emotion tagging.
//!
//! The core only depends on `(emotion, text) → stream<pcm>`; the bundled
//! [`HttpTts`] implements it against an HTTP vendor that streams raw
//! 16-bit PCM, and tests substitute scripted engines.

pub mod wav;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tracing::debug;

use crate::config::TtsConfig;
use crate::error::{CoreError, Result};

/// Emotion requested from the synthesizer, carried as a `[TAG]` prefix on
/// generated text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emotion {
    /// Calm delivery (the default).
    Neutral,
    /// Upbeat delivery.
    Happy,
    /// Subdued delivery.
    Sad,
    /// Forceful delivery.
    Angry,
    /// Tense delivery.
    Fearful,
    /// Disdainful delivery.
    Disgusted,
    /// Astonished delivery.
    Surprised,
}

impl Emotion {
    /// All known emotions.
    pub const ALL: [Emotion; 7] = [
        Emotion::Neutral,
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Angry,
        Emotion::Fearful,
        Emotion::Disgusted,
        Emotion::Surprised,
    ];

    /// Tag form used in model output, without brackets.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Neutral => "NEUTRAL",
            Self::Happy => "HAPPY",
            Self::Sad => "SAD",
            Self::Angry => "ANGRY",
            Self::Fearful => "FEARFUL",
            Self::Disgusted => "DISGUSTED",
            Self::Surprised => "SURPRISED",
        }
    }

    /// Lowercase name sent to the vendor API.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Neutral => "neutral",
            Self::Happy => "happy",
            Self::Sad => "sad",
            Self::Angry => "angry",
            Self::Fearful => "fearful",
            Self::Disgusted => "disgusted",
            Self::Surprised => "surprised",
        }
    }

    /// Parse a bare tag name (case-insensitive).
    pub fn parse(raw: &str) -> Option<Self> {
        let upper = raw.trim().to_ascii_uppercase();
        Self::ALL.into_iter().find(|e| e.tag() == upper)
    }
}

/// Split a leading `[EMOTION]` marker off generated text.
///
/// Returns the recognized emotion (if any) and the text with the marker
/// and any following whitespace removed. Unrecognized brackets are left
/// in place.
pub fn split_emotion_prefix(text: &str) -> (Option<Emotion>, String) {
    let trimmed = text.trim_start();
    if let Some(rest) = trimmed.strip_prefix('[')
        && let Some((tag, body)) = rest.split_once(']')
        && let Some(emotion) = Emotion::parse(tag)
    {
        return (Some(emotion), body.trim_start().to_owned());
    }
    (None, text.to_owned())
}

/// Remove every `[EMOTION]` marker from a text (history rendering,
/// classifier prompts).
pub fn strip_emotion_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('[') {
        let (head, tail) = rest.split_at(start);
        out.push_str(head);
        if let Some((tag, after)) = tail[1..].split_once(']')
            && Emotion::parse(tag).is_some()
        {
            rest = after;
        } else {
            out.push('[');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out.trim().to_owned()
}

/// A stream of raw PCM chunks from the synthesizer.
pub type PcmStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Vendor seam: synthesize one sentence into a PCM stream.
#[async_trait]
pub trait TtsEngine: Send + Sync {
    /// Request synthesis of `text` with an optional emotion hint.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be established; mid-stream
    /// failures surface as `Err` items.
    async fn synthesize(&self, emotion: Option<Emotion>, text: &str) -> Result<PcmStream>;
}

#[derive(Serialize)]
struct TtsRequest<'a> {
    text: &'a str,
    voice_setting: VoiceSetting<'a>,
    audio_setting: AudioSetting,
}

#[derive(Serialize)]
struct VoiceSetting<'a> {
    voice_id: &'a str,
    emotion: &'a str,
}

#[derive(Serialize)]
struct AudioSetting {
    sample_rate: u32,
    format: &'static str,
    channel: u16,
}

/// HTTP synthesizer streaming raw PCM from the vendor.
pub struct HttpTts {
    http: reqwest::Client,
    config: TtsConfig,
}

impl HttpTts {
    /// Build a client from config.
    ///
    /// # Errors
    ///
    /// Returns a config error if the HTTP client cannot be constructed.
    pub fn new(config: &TtsConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| CoreError::Config(format!("failed to build TTS client: {e}")))?;
        Ok(Self {
            http,
            config: config.clone(),
        })
    }

    /// Resolve a requested voice name, falling back to the configured
    /// default when the request is absent or blank.
    pub fn resolve_voice(&self, requested: Option<&str>) -> String {
        match requested.map(str::trim) {
            Some(name) if !name.is_empty() => name.to_owned(),
            _ => self.config.default_voice.clone(),
        }
    }
}

#[async_trait]
impl TtsEngine for HttpTts {
    async fn synthesize(&self, emotion: Option<Emotion>, text: &str) -> Result<PcmStream> {
        let emotion = emotion.unwrap_or(Emotion::Neutral);
        let voice = self.resolve_voice(Some(&self.config.voice));
        debug!(voice = %voice, emotion = emotion.wire_name(), chars = text.len(), "TTS request");
        let body = TtsRequest {
            text,
            voice_setting: VoiceSetting {
                voice_id: &voice,
                emotion: emotion.wire_name(),
            },
            audio_setting: AudioSetting {
                sample_rate: self.config.sample_rate,
                format: "pcm",
                channel: 1,
            },
        };
        let response = self
            .http
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::Tts(format!("TTS request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(CoreError::Tts(format!("TTS HTTP {status}: {text}")));
            }
            return Err(CoreError::VendorRejected(format!("TTS HTTP {status}: {text}")));
        }
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| CoreError::Tts(format!("TTS stream: {e}"))));
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // ── Emotion tags ──────────────────────────────────────────

    #[test]
    fn split_recognized_prefix() {
        let (emotion, text) = split_emotion_prefix("[HAPPY]\n好的,");
        assert_eq!(emotion, Some(Emotion::Happy));
        assert_eq!(text, "好的,");
    }

    #[test]
    fn split_without_prefix() {
        let (emotion, text) = split_emotion_prefix("没有标签。");
        assert_eq!(emotion, None);
        assert_eq!(text, "没有标签。");
    }

    #[test]
    fn split_unknown_bracket_kept() {
        let (emotion, text) = split_emotion_prefix("[NOTE] keep this");
        assert_eq!(emotion, None);
        assert_eq!(text, "[NOTE] keep this");
    }

    #[test]
    fn strip_removes_all_known_tags() {
        let out = strip_emotion_tags("[HAPPY]\n很高兴！[NEUTRAL] 让我想想。[SURPRISED] 哇！");
        assert!(!out.contains("HAPPY"));
        assert!(!out.contains('['));
        assert!(out.contains("很高兴！"));
    }

    #[test]
    fn strip_keeps_unknown_brackets() {
        let out = strip_emotion_tags("[citation 1] stays");
        assert_eq!(out, "[citation 1] stays");
    }

    #[test]
    fn emotion_tag_round_trip() {
        for emotion in Emotion::ALL {
            assert_eq!(Emotion::parse(emotion.tag()), Some(emotion));
        }
        assert_eq!(Emotion::parse("SLEEPY"), None);
    }

    // ── Voice resolution ──────────────────────────────────────

    #[test]
    fn blank_voice_falls_back_to_default() {
        let config = TtsConfig {
            default_voice: "fallback-voice".to_owned(),
            ..TtsConfig::default()
        };
        let tts = HttpTts::new(&config).expect("client");
        assert_eq!(tts.resolve_voice(None), "fallback-voice");
        assert_eq!(tts.resolve_voice(Some("  ")), "fallback-voice");
        assert_eq!(tts.resolve_voice(Some("alto")), "alto");
    }

    // ── HTTP engine ───────────────────────────────────────────

    #[tokio::test]
    async fn synthesize_streams_pcm_bytes() {
        let server = MockServer::start().await;
        let pcm = vec![1u8, 2, 3, 4, 5, 6, 7, 8];
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(pcm.clone()))
            .mount(&server)
            .await;
        let config = TtsConfig {
            api_url: server.uri(),
            api_key: "k".to_owned(),
            ..TtsConfig::default()
        };
        let tts = HttpTts::new(&config).expect("client");
        let mut stream = tts
            .synthesize(Some(Emotion::Happy), "好的")
            .await
            .expect("stream");
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.expect("chunk"));
        }
        assert_eq!(collected, pcm);
    }

    #[tokio::test]
    async fn auth_failure_is_vendor_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        let config = TtsConfig {
            api_url: server.uri(),
            api_key: "k".to_owned(),
            ..TtsConfig::default()
        };
        let tts = HttpTts::new(&config).expect("client");
        let err = match tts.synthesize(None, "hi").await {
            Ok(_) => panic!("expected 403 to be rejected"),
            Err(e) => e,
        };
        assert!(matches!(err, CoreError::VendorRejected(_)));
    }
}
