//! Speech-to-text vendor seam and session supervision.
//!
//! Only the streaming interface matters to the core: a session accepts
//! PCM and yields partial/final transcripts. The supervisor owns session
//! lifecycle — lazy start, exponential-backoff reconnect, proactive idle
//! reconnect to dodge server-side disconnects — and suppresses duplicate
//! results before they reach the result socket.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::SttConfig;
use crate::error::{CoreError, Result};

/// One recognition result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SttResult {
    /// Recognized text.
    pub text: String,
    /// Whether the vendor finalized this hypothesis.
    pub is_final: bool,
}

/// One streaming recognition session.
#[async_trait]
pub trait SttSession: Send + Sync {
    /// Start the vendor session.
    async fn start(&mut self) -> Result<()>;

    /// Push a chunk of 16-bit LE PCM, returning any new hypotheses.
    async fn push_audio(&mut self, pcm: &[u8]) -> Result<Vec<SttResult>>;

    /// Close the session, returning the final transcript if one is pending.
    async fn finish(&mut self) -> Result<Option<SttResult>>;
}

/// Opens new vendor sessions (the reconnect path needs a fresh one).
#[async_trait]
pub trait SttVendor: Send + Sync {
    /// Open an unstarted session.
    async fn open(&self) -> Result<Box<dyn SttSession>>;
}

/// Thread-safe buffer of completed sentences awaiting the monitor worker.
///
/// `take_all` is the atomic get-and-clear the monitor relies on: a sentence
/// is observed exactly once.
#[derive(Clone, Default)]
pub struct SentenceBuffer {
    inner: Arc<Mutex<Vec<String>>>,
}

impl SentenceBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a completed sentence.
    pub fn push(&self, sentence: impl Into<String>) {
        self.inner.lock().expect("sentence buffer lock").push(sentence.into());
    }

    /// Atomically drain every buffered sentence.
    pub fn take_all(&self) -> Vec<String> {
        std::mem::take(&mut *self.inner.lock().expect("sentence buffer lock"))
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("sentence buffer lock").is_empty()
    }
}

/// Owns the vendor session and applies the §4.7 failure policy.
pub struct SttSupervisor {
    vendor: Arc<dyn SttVendor>,
    config: SttConfig,
    session: Option<Box<dyn SttSession>>,
    last_audio: Instant,
    last_result: Option<(String, bool)>,
    unhealthy: bool,
}

impl SttSupervisor {
    /// Create a supervisor; no session is opened until audio arrives.
    pub fn new(vendor: Arc<dyn SttVendor>, config: SttConfig) -> Self {
        Self {
            vendor,
            config,
            session: None,
            last_audio: Instant::now(),
            last_result: None,
            unhealthy: false,
        }
    }

    /// Whether the adapter has been marked unhealthy.
    pub fn is_unhealthy(&self) -> bool {
        self.unhealthy
    }

    /// Feed one audio frame, returning deduplicated recognition results.
    ///
    /// A session is opened on demand. A failed push drops the session and
    /// retries once on a fresh one; repeated connect failures mark the
    /// adapter unhealthy and the frame is dropped (the orchestrator keeps
    /// accepting input, per the failure policy).
    pub async fn handle_audio(&mut self, pcm: &[u8]) -> Vec<SttResult> {
        self.maybe_idle_reconnect().await;
        self.last_audio = Instant::now();

        if self.session.is_none() && self.ensure_session().await.is_err() {
            return Vec::new();
        }
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };

        match session.push_audio(pcm).await {
            Ok(results) => self.dedup(results),
            Err(e) => {
                warn!(error = %e, "STT push failed; reconnecting");
                self.session = None;
                if self.ensure_session().await.is_err() {
                    return Vec::new();
                }
                match self.session.as_mut() {
                    Some(session) => match session.push_audio(pcm).await {
                        Ok(results) => self.dedup(results),
                        Err(e) => {
                            warn!(error = %e, "STT push failed again; dropping frame");
                            self.session = None;
                            Vec::new()
                        }
                    },
                    None => Vec::new(),
                }
            }
        }
    }

    /// Close the current session and return its final transcript, if any.
    pub async fn end_session(&mut self) -> Option<SttResult> {
        let mut session = self.session.take()?;
        match session.finish().await {
            Ok(result) => result.and_then(|r| self.dedup(vec![r]).into_iter().next()),
            Err(e) => {
                warn!(error = %e, "STT session finish failed");
                None
            }
        }
    }

    /// Reconnect proactively when the vendor has seen no audio for the
    /// configured idle window; the accumulated transcript is flushed first.
    ///
    /// Returns the flushed final transcript, if the idle session had one.
    pub async fn maybe_idle_reconnect(&mut self) -> Option<SttResult> {
        if self.session.is_none() {
            return None;
        }
        let idle = Duration::from_secs(self.config.idle_reconnect_secs);
        if self.last_audio.elapsed() < idle {
            return None;
        }
        info!(
            idle_secs = self.config.idle_reconnect_secs,
            "STT idle; reconnecting proactively"
        );
        let flushed = self.end_session().await;
        let _ = self.ensure_session().await;
        flushed
    }

    async fn ensure_session(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let mut attempt: u32 = 0;
        loop {
            match self.open_started().await {
                Ok(session) => {
                    self.session = Some(session);
                    self.unhealthy = false;
                    return Ok(());
                }
                Err(e) => {
                    if attempt >= self.config.max_reconnect_attempts {
                        warn!(error = %e, "STT reconnect attempts exhausted; adapter unhealthy");
                        self.unhealthy = true;
                        return Err(CoreError::Stt("reconnect attempts exhausted".to_owned()));
                    }
                    let delay = self
                        .config
                        .reconnect_delay_ms
                        .saturating_mul(1u64 << attempt.min(6));
                    warn!(attempt, delay_ms = delay, error = %e, "STT connect failed; backing off");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn open_started(&self) -> Result<Box<dyn SttSession>> {
        let mut session = self.vendor.open().await?;
        session.start().await?;
        Ok(session)
    }

    /// Suppress results identical to the previously emitted one.
    fn dedup(&mut self, results: Vec<SttResult>) -> Vec<SttResult> {
        let mut out = Vec::with_capacity(results.len());
        for result in results {
            if result.text.is_empty() {
                continue;
            }
            let key = (result.text.clone(), result.is_final);
            if self.last_result.as_ref() == Some(&key) {
                continue;
            }
            self.last_result = Some(key);
            out.push(result);
        }
        out
    }
}

/// Reference vendor adapter: per-chunk HTTP recognition.
///
/// Streams each PCM chunk to the vendor's recognition endpoint under a
/// per-session id and reads back `{text, is_final}` hypotheses. Real
/// deployments substitute the vendor's native streaming protocol behind
/// the same trait.
pub struct HttpSttVendor {
    http: reqwest::Client,
    config: SttConfig,
}

impl HttpSttVendor {
    /// Build a vendor adapter from config.
    ///
    /// # Errors
    ///
    /// Returns a config error if the HTTP client cannot be constructed.
    pub fn new(config: &SttConfig) -> Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| CoreError::Config(format!("failed to build STT client: {e}")))?;
        Ok(Arc::new(Self {
            http,
            config: config.clone(),
        }))
    }
}

#[async_trait]
impl SttVendor for HttpSttVendor {
    async fn open(&self) -> Result<Box<dyn SttSession>> {
        Ok(Box::new(HttpSttSession {
            http: self.http.clone(),
            config: self.config.clone(),
            session_id: uuid::Uuid::new_v4().to_string(),
        }))
    }
}

#[derive(serde::Deserialize)]
struct HttpSttReply {
    #[serde(default)]
    text: String,
    #[serde(default)]
    is_final: bool,
}

struct HttpSttSession {
    http: reqwest::Client,
    config: SttConfig,
    session_id: String,
}

impl HttpSttSession {
    async fn request(&self, pcm: &[u8], complete: bool) -> Result<Option<SttResult>> {
        let sample_rate = self.config.sample_rate.to_string();
        let response = self
            .http
            .post(&self.config.api_url)
            .header("X-NLS-Token", &self.config.token)
            .query(&[
                ("appkey", self.config.app_key.as_str()),
                ("session_id", self.session_id.as_str()),
                ("format", "pcm"),
                ("sample_rate", sample_rate.as_str()),
                ("complete", if complete { "true" } else { "false" }),
            ])
            .body(pcm.to_vec())
            .send()
            .await
            .map_err(|e| CoreError::Stt(format!("recognition request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(CoreError::Stt(format!("recognition HTTP {status}: {body}")));
            }
            return Err(CoreError::VendorRejected(format!(
                "recognition HTTP {status}: {body}"
            )));
        }
        let reply: HttpSttReply = response
            .json()
            .await
            .map_err(|e| CoreError::Stt(format!("bad recognition body: {e}")))?;
        if reply.text.is_empty() {
            return Ok(None);
        }
        Ok(Some(SttResult {
            text: reply.text,
            is_final: reply.is_final,
        }))
    }
}

#[async_trait]
impl SttSession for HttpSttSession {
    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn push_audio(&mut self, pcm: &[u8]) -> Result<Vec<SttResult>> {
        Ok(self.request(pcm, false).await?.into_iter().collect())
    }

    async fn finish(&mut self) -> Result<Option<SttResult>> {
        self.request(&[], true).await
    }
}

/// Scripted vendor for tests: sessions pop pre-programmed step outcomes.
pub struct ScriptedVendor {
    /// Scripts for successive sessions; each session pops its own steps.
    sessions: Mutex<VecDeque<ScriptedSession>>,
    /// Open attempts that fail before the first session succeeds.
    failing_opens: Mutex<u32>,
}

/// One scripted session: each `push_audio` pops the next step.
pub struct ScriptedSession {
    steps: VecDeque<Result<Vec<SttResult>>>,
    final_result: Option<SttResult>,
}

impl ScriptedSession {
    /// Build a session from per-push outcomes and an optional final.
    pub fn new(steps: Vec<Result<Vec<SttResult>>>, final_result: Option<SttResult>) -> Self {
        Self {
            steps: steps.into(),
            final_result,
        }
    }
}

#[async_trait]
impl SttSession for ScriptedSession {
    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn push_audio(&mut self, _pcm: &[u8]) -> Result<Vec<SttResult>> {
        self.steps.pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn finish(&mut self) -> Result<Option<SttResult>> {
        Ok(self.final_result.take())
    }
}

impl ScriptedVendor {
    /// Build a vendor whose first `failing_opens` opens fail, then hand
    /// out the given sessions in order.
    pub fn new(failing_opens: u32, sessions: Vec<ScriptedSession>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(sessions.into()),
            failing_opens: Mutex::new(failing_opens),
        })
    }
}

#[async_trait]
impl SttVendor for ScriptedVendor {
    async fn open(&self) -> Result<Box<dyn SttSession>> {
        {
            let mut failing = self.failing_opens.lock().expect("lock");
            if *failing > 0 {
                *failing -= 1;
                return Err(CoreError::Stt("scripted connect failure".to_owned()));
            }
        }
        match self.sessions.lock().expect("lock").pop_front() {
            Some(session) => Ok(Box::new(session)),
            None => Err(CoreError::Stt("no scripted sessions left".to_owned())),
        }
    }
}
