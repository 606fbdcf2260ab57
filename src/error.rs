//! Error types for the Lumina conversational core.

/// How the orchestrator should react to an error.
///
/// Every [`CoreError`] maps to exactly one disposition; callers switch on
/// the tag instead of inspecting error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Transient I/O (network, vendor 429/5xx): retry with backoff inside
    /// the adapter, never surfaced to the orchestrator.
    Transient,
    /// Vendor hard failure (auth, quota, bad request): mark the adapter
    /// unhealthy, skip the current output stage, keep accepting input.
    Vendor,
    /// Logic error (bad classifier output, corrupt peer frame): do not
    /// crash; fall back to a safe default — and where a prompt is involved,
    /// feed the anomaly into the next one.
    Logic,
    /// Fatal startup error (missing config, socket bind failure): abort
    /// before accepting any audio.
    Fatal,
}

/// Top-level error type for the conversational core.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Speech-to-text adapter error.
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech synthesis error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Language model request error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Vendor rejected the request outright (auth, quota, bad request).
    #[error("vendor rejected request: {0}")]
    VendorRejected(String),

    /// An IPC endpoint could not be bound at startup.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// A peer connection sent bytes that do not decode as a frame. The
    /// connection is dropped; the listener keeps accepting.
    #[error("framing error: {0}")]
    Framing(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Memory service error.
    #[error("memory error: {0}")]
    Memory(String),

    /// Classifier output could not be interpreted.
    #[error("classifier parse error: {0}")]
    Parse(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Classify this error into one of the four handling policies.
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::Stt(_) | Self::Tts(_) | Self::Llm(_) | Self::Io(_) => Disposition::Transient,
            Self::VendorRejected(_) => Disposition::Vendor,
            Self::Parse(_) | Self::Framing(_) | Self::Memory(_) => Disposition::Logic,
            Self::Config(_) | Self::Ipc(_) => Disposition::Fatal,
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, CoreError>;
