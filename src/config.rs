//! Configuration types for the conversational core.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CoreError, Result};

/// Top-level configuration for the Lumina core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// IPC socket endpoints (audio ingress, STT result egress, TTS egress).
    pub ipc: IpcConfig,
    /// Speech-to-text vendor settings.
    pub stt: SttConfig,
    /// Text-to-speech vendor settings.
    pub tts: TtsConfig,
    /// Language model settings (main, pre-reply, and classifier models).
    pub llm: LlmConfig,
    /// Turn-detection timing constants.
    pub timing: TimingConfig,
    /// Memory store settings.
    pub memory: MemoryConfig,
}

impl CoreConfig {
    /// Load configuration from a TOML file, falling back to defaults for
    /// missing fields.
    ///
    /// # Errors
    ///
    /// Returns a config error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("failed to read {}: {e}", path.display())))?;
        toml::from_str(&raw)
            .map_err(|e| CoreError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Overlay vendor credentials and endpoints from the environment.
    ///
    /// Recognized variables: `LUMINA_STT_APP_KEY`, `LUMINA_STT_TOKEN`,
    /// `LUMINA_STT_REGION`, `LUMINA_TTS_API_KEY`, `LUMINA_TTS_API_URL`,
    /// `LUMINA_LLM_API_KEY`, `LUMINA_LLM_API_URL`.
    pub fn apply_env(&mut self) {
        let mut set = |var: &str, slot: &mut String| {
            if let Ok(value) = std::env::var(var)
                && !value.trim().is_empty()
            {
                *slot = value;
            }
        };
        set("LUMINA_STT_APP_KEY", &mut self.stt.app_key);
        set("LUMINA_STT_TOKEN", &mut self.stt.token);
        set("LUMINA_STT_REGION", &mut self.stt.region);
        set("LUMINA_TTS_API_KEY", &mut self.tts.api_key);
        set("LUMINA_TTS_API_URL", &mut self.tts.api_url);
        set("LUMINA_LLM_API_KEY", &mut self.llm.api_key);
        set("LUMINA_LLM_API_URL", &mut self.llm.api_url);
    }

    /// Validate that every credential the configured vendors require is
    /// present. Called once at startup, before any socket is bound.
    ///
    /// # Errors
    ///
    /// Returns a fatal config error naming the first missing credential.
    pub fn validate(&self) -> Result<()> {
        if self.llm.api_key.trim().is_empty() {
            return Err(CoreError::Config(
                "missing LLM API key (set LUMINA_LLM_API_KEY)".to_owned(),
            ));
        }
        if self.tts.api_key.trim().is_empty() {
            return Err(CoreError::Config(
                "missing TTS API key (set LUMINA_TTS_API_KEY)".to_owned(),
            ));
        }
        Ok(())
    }
}

/// IPC endpoints. Unix domain sockets on POSIX; `host:port` TCP strings
/// are accepted everywhere and are the only option on Windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Audio ingress socket (length-framed PCM + control sub-channel).
    pub audio_socket: String,
    /// STT result egress socket (newline-delimited JSON).
    pub stt_result_socket: String,
    /// TTS audio egress socket (length-framed WAV blobs).
    pub tts_socket: String,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            audio_socket: "/tmp/lumina_stt.sock".to_owned(),
            stt_result_socket: "/tmp/lumina_stt_result.sock".to_owned(),
            tts_socket: "/tmp/lumina_tts.sock".to_owned(),
        }
    }
}

/// Speech-to-text vendor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Vendor recognition endpoint.
    pub api_url: String,
    /// Vendor application key.
    pub app_key: String,
    /// Vendor access token.
    pub token: String,
    /// Vendor region identifier.
    pub region: String,
    /// Input sample rate in Hz (16-bit LE PCM mono).
    pub sample_rate: u32,
    /// Maximum in-sentence silence before the vendor finalizes, in ms.
    pub max_sentence_silence_ms: u64,
    /// Reconnect the vendor session proactively after this many seconds
    /// without audio, dodging server-side idle disconnects.
    pub idle_reconnect_secs: u64,
    /// Base delay for reconnect backoff, in ms.
    pub reconnect_delay_ms: u64,
    /// Maximum reconnect attempts before the adapter is marked unhealthy.
    pub max_reconnect_attempts: u32,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            api_url: "https://nls-gateway.aliyuncs.com/stream/v1/asr".to_owned(),
            app_key: String::new(),
            token: String::new(),
            region: "cn-shanghai".to_owned(),
            sample_rate: 16_000,
            max_sentence_silence_ms: 300,
            idle_reconnect_secs: 50,
            reconnect_delay_ms: 100,
            max_reconnect_attempts: 8,
        }
    }
}

/// Text-to-speech vendor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Vendor API endpoint.
    pub api_url: String,
    /// Vendor API key.
    pub api_key: String,
    /// Voice name requested from the vendor.
    pub voice: String,
    /// Fallback voice when a requested voice name cannot be resolved.
    pub default_voice: String,
    /// Output sample rate in Hz (PCM from the vendor, WAV on the wire).
    pub sample_rate: u32,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.minimax.chat/v1/t2a_v2".to_owned(),
            api_key: String::new(),
            voice: "female-shaonv".to_owned(),
            default_voice: "female-shaonv".to_owned(),
            sample_rate: 32_000,
            request_timeout_secs: 30,
        }
    }
}

/// Language model configuration. One OpenAI-compatible endpoint serves
/// three roles at different latency/quality points.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of the chat-completions endpoint.
    pub api_url: String,
    /// API key.
    pub api_key: String,
    /// Model for the main streamed reply.
    pub main_model: String,
    /// Low-latency model for pre-replies and the dialogue timeout judge.
    pub fast_model: String,
    /// Higher-quality model for the stateful FSM classifier.
    pub classifier_model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Nucleus sampling cut-off.
    pub top_p: f32,
    /// Per-attempt request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Maximum retry attempts for transient failures.
    pub max_retries: u32,
    /// Base delay for retry backoff, in ms (doubles per attempt).
    pub retry_base_delay_ms: u64,
    /// History entries kept before the oldest round is compressed.
    pub max_history_entries: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "https://dashscope.aliyuncs.com/compatible-mode/v1".to_owned(),
            api_key: String::new(),
            main_model: "qwen-turbo-latest".to_owned(),
            fast_model: "qwen-turbo-latest".to_owned(),
            classifier_model: "qwen-max-latest".to_owned(),
            temperature: 0.8,
            top_p: 0.8,
            request_timeout_secs: 20,
            max_retries: 4,
            retry_base_delay_ms: 200,
            max_history_entries: 40,
        }
    }
}

/// Turn-detection timing constants.
///
/// The wait ladder maps the dialogue judge's confidence to a cooldown:
/// very-high 50–100 ms, high 100–200 ms, medium 200–350 ms, low 350–500 ms,
/// very-low 500–800 ms.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// A user resuming within this window counts as an interruption, in ms.
    pub critical_threshold_ms: u64,
    /// Very confident the user finished, in ms.
    pub short_wait_ms: u64,
    /// Fairly confident; also the fallback when the judge output cannot be
    /// parsed, in ms.
    pub mid_wait_ms: u64,
    /// Somewhat confident, in ms.
    pub long_wait_ms: u64,
    /// Unsure, in ms.
    pub longer_wait_ms: u64,
    /// Very unsure; also the hard upper clamp on judge output, in ms.
    pub extra_wait_ms: u64,
    /// Judgement records kept for in-prompt feedback.
    pub judge_history_depth: usize,
    /// FSM state/event records kept for the classifier prompt.
    pub state_history_depth: usize,
    /// Timer poll interval, in ms.
    pub timer_tick_ms: u64,
    /// Silence auto-grow update interval, in ms.
    pub silence_tick_ms: u64,
    /// Rounds of history shown to the pre-reply model.
    pub pre_reply_rounds: usize,
    /// Streamed-reply buffer length that forces a soft sentence break.
    pub sentence_max_chars: usize,
    /// Minimum sentence length for a soft break.
    pub sentence_min_break_chars: usize,
    /// Mid-silence point where the "I'm listening" nudge becomes available,
    /// in ms.
    pub mid_silence_ms: u64,
    /// Long-silence point where the STT session is flushed, in ms.
    pub long_silence_ms: u64,
    /// Mild-conservative cooldown threshold as a fraction of the critical
    /// threshold.
    pub conservative_ratio_mild: f64,
    /// Severe-conservative cooldown threshold as a fraction of the critical
    /// threshold.
    pub conservative_ratio_severe: f64,
    /// Consecutive mild-conservative judgements before one is flagged.
    pub conservative_mild_streak: u32,
    /// Silence beyond the critical threshold that still counts as
    /// "no interrupt", in ms.
    pub no_interrupt_tolerance_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            critical_threshold_ms: 800,
            short_wait_ms: 50,
            mid_wait_ms: 150,
            long_wait_ms: 350,
            longer_wait_ms: 500,
            extra_wait_ms: 800,
            judge_history_depth: 14,
            state_history_depth: 7,
            timer_tick_ms: 2,
            silence_tick_ms: 3,
            pre_reply_rounds: 6,
            sentence_max_chars: 100,
            sentence_min_break_chars: 30,
            mid_silence_ms: 500,
            long_silence_ms: 5_000,
            conservative_ratio_mild: 1.0 / 3.0,
            conservative_ratio_severe: 2.0 / 3.0,
            conservative_mild_streak: 3,
            no_interrupt_tolerance_ms: 2_000,
        }
    }
}

/// Memory store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Whether passive memory retrieval runs per turn.
    pub enabled: bool,
    /// Memories retrieved per query.
    pub retrieve_limit: usize,
    /// Maximum characters per stored chunk.
    pub chunk_size: usize,
    /// Overlapping characters between adjacent chunks.
    pub chunk_overlap: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retrieve_limit: 3,
            chunk_size: 100,
            chunk_overlap: 15,
        }
    }
}

/// Default path of the optional config file (`~/.lumina/config.toml`).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".lumina").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_tuning_constants() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.timing.critical_threshold_ms, 800);
        assert_eq!(cfg.timing.short_wait_ms, 50);
        assert_eq!(cfg.timing.mid_wait_ms, 150);
        assert_eq!(cfg.timing.long_wait_ms, 350);
        assert_eq!(cfg.timing.longer_wait_ms, 500);
        assert_eq!(cfg.timing.extra_wait_ms, 800);
        assert_eq!(cfg.timing.judge_history_depth, 14);
        assert_eq!(cfg.memory.chunk_size, 100);
        assert_eq!(cfg.memory.chunk_overlap, 15);
        assert_eq!(cfg.tts.sample_rate, 32_000);
        assert_eq!(cfg.stt.sample_rate, 16_000);
    }

    #[test]
    fn validate_requires_llm_key() {
        let mut cfg = CoreConfig::default();
        cfg.tts.api_key = "k".to_owned();
        let err = cfg.validate().expect_err("missing LLM key must fail");
        assert!(err.to_string().contains("LLM API key"));
    }

    #[test]
    fn validate_requires_tts_key() {
        let mut cfg = CoreConfig::default();
        cfg.llm.api_key = "k".to_owned();
        let err = cfg.validate().expect_err("missing TTS key must fail");
        assert!(err.to_string().contains("TTS API key"));
    }

    #[test]
    fn validate_passes_with_keys() {
        let mut cfg = CoreConfig::default();
        cfg.llm.api_key = "a".to_owned();
        cfg.tts.api_key = "b".to_owned();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let parsed: CoreConfig =
            toml::from_str("[timing]\ncritical_threshold_ms = 900\n").expect("parse");
        assert_eq!(parsed.timing.critical_threshold_ms, 900);
        assert_eq!(parsed.timing.mid_wait_ms, 150);
        assert_eq!(parsed.ipc.tts_socket, "/tmp/lumina_tts.sock");
    }
}
