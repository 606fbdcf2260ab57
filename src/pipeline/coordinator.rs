//! The turn orchestrator: wires STT ingress, turn detection, the reply
//! pipeline, and TTS egress together.
//!
//! One logical orchestration flow plus two long-lived workers:
//! a sentence monitor that drains the STT completed-sentence buffer
//! atomically, and a TTS dispatcher that drains the `(sentence, timer)`
//! queue in FIFO order. Cancellation between them is expressed only
//! through silence epochs — no cancel tokens travel with the work.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::command::{CommandClassifier, CommandOutcome};
use crate::config::CoreConfig;
use crate::error::Disposition;
use crate::ipc::{ControlMessage, EgressSocket, IngressFrame};
use crate::llm::pre_reply::generate_pre_reply;
use crate::llm::LlmClient;
use crate::memory::MemoryService;
use crate::pipeline::messages::{SentenceJob, SentenceSource, Transcription};
use crate::detect::{detect_turn, ContextSnapshot, JudgeHistory, StatefulAgent, Timer, TurnEvent, TurnState};
use crate::stt::{SentenceBuffer, SttSupervisor, SttVendor};
use crate::text::SentenceSplitter;
use crate::tts::{split_emotion_prefix, wav::pcm_to_wav, TtsEngine};
use crate::turn::{
    AssistantReply, ConversationHistory, HistoryEntry, PromptMode, SilenceTracker, SystemContext,
    Turn, TurnBuffer,
};

/// Bound on the sentence queue between the reply stream and the TTS
/// dispatcher.
const SENTENCE_QUEUE_SIZE: usize = 16;

/// System prompt for the main reply model.
const MAIN_SYSTEM_PROMPT: &str = "\
You are Lumina, a realtime voice assistant. You receive transcribed user \
speech and your output is synthesized to audio, so answer briefly, \
naturally, and with feeling; never emit emoji or markup that cannot be \
spoken.

Start your reply with an emotion tag on its own line, one of [NEUTRAL] \
[HAPPY] [SAD] [ANGRY] [FEARFUL] [DISGUSTED] [SURPRISED]. When the emotion \
shifts mid-reply, put the new tag after a sentence end; do not repeat an \
unchanged tag.";

/// Canned nudge spoken after a mid-length silence with pending turns.
const LISTENING_NUDGE: &str = "我在听，请继续说";

/// External collaborators handed to the orchestrator.
pub struct OrchestratorDeps {
    /// Chat client shared by every model role.
    pub llm: LlmClient,
    /// TTS vendor seam.
    pub tts: Arc<dyn TtsEngine>,
    /// Memory service seam.
    pub memory: Arc<dyn MemoryService>,
    /// Command classifier seam.
    pub commands: Arc<dyn CommandClassifier>,
    /// TTS audio egress socket.
    pub tts_egress: Arc<EgressSocket>,
    /// STT result egress socket.
    pub stt_egress: Arc<EgressSocket>,
}

/// The turn orchestrator. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<CoreConfig>,
    llm: LlmClient,
    tts: Arc<dyn TtsEngine>,
    memory: Arc<dyn MemoryService>,
    commands: Arc<dyn CommandClassifier>,
    tts_egress: Arc<EgressSocket>,
    stt_egress: Arc<EgressSocket>,
    silence: SilenceTracker,
    buffer: Arc<Mutex<TurnBuffer>>,
    history: Arc<Mutex<ConversationHistory>>,
    system_context: Arc<Mutex<SystemContext>>,
    judges: Arc<Mutex<JudgeHistory>>,
    agent: Arc<tokio::sync::Mutex<StatefulAgent>>,
    sentence_tx: mpsc::Sender<SentenceJob>,
    nudged_epoch: Arc<Mutex<Option<crate::turn::Epoch>>>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Build an orchestrator and the receiving end of its sentence queue.
    pub fn new(config: CoreConfig, deps: OrchestratorDeps) -> (Self, mpsc::Receiver<SentenceJob>) {
        let (sentence_tx, sentence_rx) = mpsc::channel(SENTENCE_QUEUE_SIZE);
        let silence = SilenceTracker::new(config.timing.silence_tick_ms);
        let judges = JudgeHistory::new(config.timing.judge_history_depth);
        let agent = StatefulAgent::new(config.timing.state_history_depth);
        let orchestrator = Self {
            silence,
            buffer: Arc::new(Mutex::new(TurnBuffer::default())),
            history: Arc::new(Mutex::new(ConversationHistory::default())),
            system_context: Arc::new(Mutex::new(SystemContext::default())),
            judges: Arc::new(Mutex::new(judges)),
            agent: Arc::new(tokio::sync::Mutex::new(agent)),
            sentence_tx,
            nudged_epoch: Arc::new(Mutex::new(None)),
            cancel: CancellationToken::new(),
            llm: deps.llm,
            tts: deps.tts,
            memory: deps.memory,
            commands: deps.commands,
            tts_egress: deps.tts_egress,
            stt_egress: deps.stt_egress,
            config: Arc::new(config),
        };
        (orchestrator, sentence_rx)
    }

    /// Cancellation token for external shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Shared silence tracker (tests and diagnostics).
    pub fn silence(&self) -> &SilenceTracker {
        &self.silence
    }

    /// Number of turns currently buffered.
    pub fn buffered_turns(&self) -> usize {
        self.buffer.lock().expect("buffer lock").len()
    }

    /// Snapshot of the conversation history.
    pub fn history_snapshot(&self) -> ConversationHistory {
        self.history.lock().expect("history lock").clone()
    }

    /// Current FSM state.
    pub async fn turn_state(&self) -> TurnState {
        self.agent.lock().await.state()
    }

    /// Run the orchestrator until cancelled.
    ///
    /// Spawns the STT loop over ingress frames, the sentence monitor, and
    /// the TTS dispatcher, then waits for shutdown.
    pub async fn run(
        self,
        ingress_rx: mpsc::Receiver<IngressFrame>,
        sentence_rx: mpsc::Receiver<SentenceJob>,
        vendor: Arc<dyn SttVendor>,
    ) {
        info!("turn orchestrator starting");
        let sentences = SentenceBuffer::new();

        let stt_handle = {
            let this = self.clone();
            let sentences = sentences.clone();
            tokio::spawn(async move { this.run_stt_loop(ingress_rx, vendor, sentences).await })
        };
        let monitor_handle = {
            let this = self.clone();
            let sentences = sentences.clone();
            tokio::spawn(async move { this.run_sentence_monitor(sentences).await })
        };
        let tts_handle = {
            let this = self.clone();
            tokio::spawn(async move { this.run_tts_dispatcher(sentence_rx).await })
        };

        self.cancel.cancelled().await;
        info!("turn orchestrator shutting down");
        let _ = tokio::join!(stt_handle, monitor_handle, tts_handle);
        info!("turn orchestrator shutdown complete");
    }

    // ── STT worker ────────────────────────────────────────────

    /// Consume ingress frames: audio goes to the STT supervisor, controls
    /// are applied, results are published and buffered.
    async fn run_stt_loop(
        &self,
        mut ingress_rx: mpsc::Receiver<IngressFrame>,
        vendor: Arc<dyn SttVendor>,
        sentences: SentenceBuffer,
    ) {
        let mut supervisor = SttSupervisor::new(vendor, self.config.stt.clone());
        let mut idle_check = tokio::time::interval(Duration::from_millis(500));
        let mut long_silence_flushed = false;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = idle_check.tick() => {
                    if let Some(flushed) = supervisor.maybe_idle_reconnect().await {
                        self.publish_result(&flushed.text, flushed.is_final).await;
                        if flushed.is_final {
                            sentences.push(flushed.text);
                        }
                    }
                    // A very long silence flushes the vendor session so it
                    // does not idle out mid-conversation.
                    if self.silence.silence_ms() > self.config.timing.long_silence_ms {
                        if !long_silence_flushed
                            && let Some(result) = supervisor.end_session().await
                        {
                            self.publish_result(&result.text, result.is_final).await;
                            if result.is_final {
                                sentences.push(result.text);
                            }
                        }
                        long_silence_flushed = true;
                    } else {
                        long_silence_flushed = false;
                    }
                }
                frame = ingress_rx.recv() => {
                    let Some(frame) = frame else { break };
                    match frame {
                        IngressFrame::Audio(pcm) => {
                            for result in supervisor.handle_audio(&pcm).await {
                                self.publish_result(&result.text, result.is_final).await;
                                if result.is_final {
                                    sentences.push(result.text);
                                } else {
                                    self.on_partial();
                                }
                            }
                        }
                        IngressFrame::Control(message) => {
                            self.on_control(message, &mut supervisor, &sentences).await;
                        }
                    }
                }
            }
        }
    }

    /// Publish one recognition result on the result socket.
    async fn publish_result(&self, text: &str, is_final: bool) {
        let result = Transcription {
            text: text.to_owned(),
            is_final,
        };
        let Ok(line) = serde_json::to_string(&result) else {
            return;
        };
        if !self.stt_egress.send_line(line.as_bytes()).await {
            debug!("no result-socket client; recognition result dropped");
        }
    }

    /// Record a partial transcript: barge-in.
    ///
    /// The first partial of a burst closes the silence window, which
    /// permanently invalidates every timer bound to it — queued pre-replies
    /// and sentences die at their next emission gate. The observed gap is
    /// written back into the latest turn judgement.
    pub fn on_partial(&self) {
        if let Some(gap) = self.silence.on_partial() {
            self.judges
                .lock()
                .expect("judge lock")
                .record_gap(gap, &self.config.timing);
        }
    }

    /// Apply a control message from the peer.
    async fn on_control(
        &self,
        message: ControlMessage,
        supervisor: &mut SttSupervisor,
        sentences: &SentenceBuffer,
    ) {
        match message {
            ControlMessage::Silence { ms } => {
                // The peer's measurement seeds the counter (see DESIGN.md).
                self.silence.begin_silence(ms);
            }
            ControlMessage::EndSession => {
                info!("control: end session");
                if let Some(result) = supervisor.end_session().await {
                    self.publish_result(&result.text, result.is_final).await;
                    if result.is_final {
                        sentences.push(result.text);
                    }
                }
            }
            ControlMessage::StartSession => {
                info!("control: start session");
                let _ = supervisor.end_session().await;
                self.buffer.lock().expect("buffer lock").clear();
            }
            ControlMessage::ResetToInitial => {
                info!("control: reset to initial");
                self.buffer.lock().expect("buffer lock").clear();
                self.judges.lock().expect("judge lock").clear();
                self.agent.lock().await.reset();
                self.silence.interrupt();
            }
            ControlMessage::Interrupt => {
                info!("control: hard interrupt");
                self.buffer.lock().expect("buffer lock").clear();
                // Advancing the epoch silences every queued or in-flight
                // emission at its next gate; the queue drains itself.
                self.silence.interrupt();
            }
        }
    }

    // ── Sentence monitor worker ───────────────────────────────

    /// Drain the completed-sentence buffer and dispatch finalized turns.
    async fn run_sentence_monitor(&self, sentences: SentenceBuffer) {
        let tick = Duration::from_millis(self.config.timing.silence_tick_ms.max(1));
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(tick) => {}
            }
            let drained = sentences.take_all();
            if !drained.is_empty() {
                let text = drained.join("，");
                self.on_final_text(text);
                continue;
            }
            self.maybe_listening_nudge().await;
        }
    }

    /// A finalized transcript arrived: restart the silence window and run
    /// the turn chain.
    pub fn on_final_text(&self, text: String) {
        if text.trim().is_empty() {
            return;
        }
        // Every finalization restarts the silence window under a fresh
        // epoch, invalidating any timer from the previous window.
        self.silence.restart(0);
        self.buffer
            .lock()
            .expect("buffer lock")
            .push(Turn::new(text.clone()));
        debug!(text = %text, "final transcript buffered");

        let this = self.clone();
        tokio::spawn(async move { this.handle_turn(text).await });
    }

    /// Speak the listening nudge once per silence window when turns are
    /// pending past the mid-silence point.
    async fn maybe_listening_nudge(&self) {
        if self.silence.silence_ms() < self.config.timing.mid_silence_ms {
            return;
        }
        if self.buffer.lock().expect("buffer lock").is_empty() {
            return;
        }
        let epoch = self.silence.epoch();
        {
            let mut nudged = self.nudged_epoch.lock().expect("nudge lock");
            if *nudged == Some(epoch) {
                return;
            }
            *nudged = Some(epoch);
        }
        debug!("mid-silence listening nudge");
        match self.tts.synthesize(None, LISTENING_NUDGE).await {
            Ok(stream) => {
                if let Some(wav) = collect_wav(stream, self.config.tts.sample_rate).await
                    && self.silence.epoch() == epoch
                {
                    let _ = self.tts_egress.send_framed(&wav).await;
                }
            }
            Err(e) => debug!(error = %e, "listening nudge synthesis failed"),
        }
    }

    // ── Turn chain ────────────────────────────────────────────

    /// Run the per-turn pipeline: pre-reply, turn detection, command and
    /// memory hooks in parallel; then gate on the timer and stream the
    /// main reply.
    async fn handle_turn(&self, transcript: String) {
        let (buffered, history_len, history_clone, context_clone) = {
            let buffer = self.buffer.lock().expect("buffer lock");
            let history = self.history.lock().expect("history lock");
            let context = self.system_context.lock().expect("context lock");
            (
                buffer.snapshot(),
                history.len(),
                history.clone(),
                context.clone(),
            )
        };
        let saved = ContextSnapshot {
            turns: buffered.clone(),
            history_len,
        };

        let pre_reply_fut = generate_pre_reply(
            &self.llm,
            &self.config.llm,
            &self.config.timing,
            &history_clone,
            &context_clone,
            &buffered,
        );
        let memory_fut = self.retrieve_memories(&transcript);
        let command_fut = self.commands.classify(&transcript);
        let detect_fut = async {
            let mut agent = self.agent.lock().await;
            detect_turn(
                &self.llm,
                &self.config.llm,
                &self.config.timing,
                &mut agent,
                &self.judges,
                &self.silence,
                saved,
                &transcript,
            )
            .await
        };

        let (pre_reply, memories, command, timer) =
            tokio::join!(pre_reply_fut, memory_fut, command_fut, detect_fut);

        self.apply_command_outcome(command.unwrap_or(CommandOutcome::None))
            .await;
        {
            let mut buffer = self.buffer.lock().expect("buffer lock");
            if let Some(turn) = buffer.last_turn_mut() {
                for memory in memories {
                    if !turn.retrieved_memories.iter().any(|m| m.id == memory.id) {
                        turn.retrieved_memories.push(memory);
                    }
                }
            }
            match pre_reply {
                Ok(text) => buffer.set_pre_reply(text),
                Err(e) => warn!(error = %e, "pre-reply generation failed; continuing without"),
            }
        }

        if timer.state() == TurnState::Silence {
            debug!("silence state; turn suppressed");
            return;
        }

        // Queue the pre-reply ahead of the main sentences; the dispatcher
        // gates it on the timer actually firing.
        if timer.assure_no_interruption() {
            let pre = self
                .buffer
                .lock()
                .expect("buffer lock")
                .valid_pre_reply()
                .map(str::to_owned);
            if let Some(text) = pre {
                let job = SentenceJob {
                    text,
                    source: SentenceSource::PreReply,
                    timer: Arc::clone(&timer),
                };
                if self.sentence_tx.send(job).await.is_err() {
                    return;
                }
            }
        }

        if !timer.wait_for_timeout().await {
            debug!("turn superseded before its cooldown elapsed");
            return;
        }
        self.run_main_reply(timer).await;
    }

    /// Passive retrieval for the transcript, deduplicated by id.
    async fn retrieve_memories(&self, transcript: &str) -> Vec<crate::memory::Memory> {
        if !self.config.memory.enabled {
            return Vec::new();
        }
        match self
            .memory
            .retrieve(transcript, self.config.memory.retrieve_limit)
            .await
        {
            Ok(memories) => memories,
            Err(e) => {
                warn!(error = %e, "memory retrieval failed");
                Vec::new()
            }
        }
    }

    /// Fold a command outcome into the session state.
    async fn apply_command_outcome(&self, outcome: CommandOutcome) {
        match outcome {
            CommandOutcome::None => {}
            CommandOutcome::Preference { key, value } => {
                info!(key = %key, "preference command applied");
                self.system_context
                    .lock()
                    .expect("context lock")
                    .add(&key, value);
            }
            CommandOutcome::MemoryQuery { query } => {
                let extra = match self
                    .memory
                    .retrieve(&query, self.config.memory.retrieve_limit)
                    .await
                {
                    Ok(extra) => extra,
                    Err(e) => {
                        warn!(error = %e, "directed memory retrieval failed");
                        return;
                    }
                };
                let mut buffer = self.buffer.lock().expect("buffer lock");
                if let Some(turn) = buffer.last_turn_mut() {
                    for memory in extra {
                        if !turn.retrieved_memories.iter().any(|m| m.id == memory.id) {
                            turn.retrieved_memories.push(memory);
                        }
                    }
                }
            }
        }
    }

    /// The timer fired: commit the buffered turns and stream the reply.
    async fn run_main_reply(&self, timer: Arc<Timer>) {
        let (messages, pre_reply_text) = {
            let mut buffer = self.buffer.lock().expect("buffer lock");
            let pre_reply_text = buffer.valid_pre_reply().map(str::to_owned);
            let turns = buffer.drain();
            if turns.is_empty() {
                return;
            }
            let mut history = self.history.lock().expect("history lock");
            history.commit_turns(turns);
            history.compress_overflow(self.config.llm.max_history_entries);
            let context = self.system_context.lock().expect("context lock");
            let messages = history.format_messages(
                MAIN_SYSTEM_PROMPT,
                &context,
                pre_reply_text.as_deref(),
                PromptMode::Main,
            );
            (messages, pre_reply_text.unwrap_or_default())
        };

        let mut stream = match self.llm.stream(&self.config.llm.main_model, &messages).await {
            Ok(stream) => stream,
            Err(e) => {
                match e.disposition() {
                    Disposition::Vendor => error!(error = %e, "main model rejected the request"),
                    _ => warn!(error = %e, "main model request failed"),
                }
                self.rollback_turn(&timer);
                return;
            }
        };

        let mut splitter = SentenceSplitter::new(
            self.config.timing.sentence_max_chars,
            self.config.timing.sentence_min_break_chars,
        );
        let mut full_text = String::new();
        let mut interrupted = false;

        'stream: while let Some(delta) = stream.next().await {
            let token = match delta {
                Ok(token) => token,
                Err(e) => {
                    warn!(error = %e, "main reply stream broke; keeping partial text");
                    break;
                }
            };
            full_text.push_str(&token);
            for sentence in splitter.push(&token) {
                if !self.enqueue_main_sentence(sentence, &timer).await {
                    interrupted = true;
                    break 'stream;
                }
            }
        }
        if !interrupted
            && let Some(tail) = splitter.finish()
            && !self.enqueue_main_sentence(tail, &timer).await
        {
            interrupted = true;
        }

        let was_interrupted = interrupted || !timer.assure_no_interruption();
        self.history
            .lock()
            .expect("history lock")
            .push(HistoryEntry::Assistant(AssistantReply {
                pre_reply: pre_reply_text,
                text: full_text.clone(),
                was_interrupted,
            }));

        let mut agent = self.agent.lock().await;
        agent.note_assistant_reply(&full_text);
        if timer.state() == TurnState::AnswerOnce {
            agent.apply(TurnEvent::ResponseComplete);
        }
    }

    /// Queue one main-reply sentence; `false` when the turn has been
    /// superseded or the pipeline is shutting down.
    async fn enqueue_main_sentence(&self, sentence: String, timer: &Arc<Timer>) -> bool {
        if sentence.trim().is_empty() {
            return true;
        }
        if !timer.assure_no_interruption() {
            return false;
        }
        let job = SentenceJob {
            text: sentence,
            source: SentenceSource::Main,
            timer: Arc::clone(timer),
        };
        self.sentence_tx.send(job).await.is_ok()
    }

    /// Put the snapshotted turns back after an unrecoverable model failure
    /// so the next detection pass retries them. Turns that arrived while
    /// the reply was being attempted stay behind the restored ones.
    fn rollback_turn(&self, timer: &Arc<Timer>) {
        let mut buffer = self.buffer.lock().expect("buffer lock");
        let mut restored = timer.saved().turns.clone();
        restored.extend(buffer.drain());
        buffer.restore(restored);
        self.history
            .lock()
            .expect("history lock")
            .truncate(timer.saved().history_len);
    }

    // ── TTS dispatcher worker ─────────────────────────────────

    /// Drain the sentence queue in FIFO order, synthesizing and emitting
    /// every sentence whose timer is still valid.
    async fn run_tts_dispatcher(&self, mut rx: mpsc::Receiver<SentenceJob>) {
        loop {
            let job = tokio::select! {
                () = self.cancel.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            if !job.timer.assure_no_interruption() {
                debug!(text = %job.text, "sentence dropped: turn superseded");
                continue;
            }
            let (emotion, text) = split_emotion_prefix(&job.text);
            if text.trim().is_empty() {
                continue;
            }

            let stream = match self.tts.synthesize(emotion, &text).await {
                Ok(stream) => stream,
                Err(e) => {
                    // Sentence dropped, no retry; the next one proceeds.
                    warn!(error = %e, "TTS synthesis failed; sentence dropped");
                    continue;
                }
            };

            let allowed = match job.source {
                SentenceSource::PreReply => job.timer.wait_for_timeout().await,
                SentenceSource::Main => job.timer.assure_no_interruption(),
            };
            if !allowed {
                debug!(text = %text, "sentence dropped at emission gate");
                continue;
            }

            let Some(wav) = collect_wav(stream, self.config.tts.sample_rate).await else {
                continue;
            };
            if !job.timer.assure_no_interruption() {
                continue;
            }
            if !self.tts_egress.send_framed(&wav).await {
                debug!("no TTS client connected; audio dropped");
            }
        }
    }
}

/// Accumulate a PCM stream and wrap it as WAV; `None` if the stream broke
/// or produced nothing.
pub(crate) async fn collect_wav(
    mut stream: crate::tts::PcmStream,
    sample_rate: u32,
) -> Option<Vec<u8>> {
    let mut pcm = Vec::new();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => pcm.extend_from_slice(&bytes),
            Err(e) => {
                warn!(error = %e, "TTS stream broke mid-sentence; dropping it");
                return None;
            }
        }
    }
    if pcm.is_empty() {
        return None;
    }
    match pcm_to_wav(&pcm, sample_rate) {
        Ok(wav) => Some(wav),
        Err(e) => {
            warn!(error = %e, "WAV framing failed");
            None
        }
    }
}
