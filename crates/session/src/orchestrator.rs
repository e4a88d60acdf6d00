//! Session turn orchestrator
//!
//! Owns one active call and drives the STT -> LLM -> TTS pipeline for it.
//! Every inbound signal — audio frames, provider events, retry wakeups,
//! deadline expiries, cancellation — is a [`SessionEvent`] delivered through
//! one ordered queue consumed by a single worker task. That worker is the
//! only writer of turn state, so stream consumers can interleave freely
//! without lost updates or half-transitioned reads.
//!
//! Provider sub-streams are drained by pump tasks that do nothing but
//! forward events into the queue; each pump carries a child cancellation
//! token so a turn (or a single lane, on retry) can be shut down without
//! touching the others. Whether an event is still welcome is decided solely
//! from the turn id and the turn's state at the moment the worker dequeues
//! it — late events from a cancelled turn are logged and dropped.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use voicebridge_config::{OrchestratorConfig, RateTable};
use voicebridge_core::{
    AudioChunk, AudioEncoding, AudioFormat, AudioFrame, Conversation, Error, EventStream,
    GenerateRequest, LanguageModel, LlmEvent, MediaSink, ProviderError, ProviderLane, Result,
    SpeechToText, SttEvent, SttStream, TerminationReason, TextToSpeech, TtsEvent,
};

use crate::cost::{CostRecord, CostTracker};
use crate::latency::{LatencyRecord, LatencyTracker, Stage};
use crate::retry::{BackoffPolicy, RetryDecision};
use crate::sentence::SentenceSplitter;
use crate::turn::{Turn, TurnId, TurnState};

const LANES: [ProviderLane; 3] = [ProviderLane::Stt, ProviderLane::Llm, ProviderLane::Tts];

/// Why a turn was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Caller started speaking over the in-flight turn
    BargeIn,
    /// Fatal provider error or exhausted retries
    ProviderFailure,
    /// Session teardown
    SessionEnded,
    /// External cancel request
    Requested,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::BargeIn => "barge_in",
            CancelReason::ProviderFailure => "provider_failure",
            CancelReason::SessionEnded => "session_ended",
            CancelReason::Requested => "requested",
        }
    }
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a turn terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum TurnOutcome {
    Completed,
    Cancelled(CancelReason),
}

impl TurnOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TurnOutcome::Completed)
    }
}

/// Immutable metrics for one terminated turn
#[derive(Debug, Clone, Serialize)]
pub struct TurnRecord {
    pub turn_id: TurnId,
    pub outcome: TurnOutcome,
    pub latency: LatencyRecord,
    pub cost: CostRecord,
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Connecting,
    Active,
    Ended,
}

/// The three provider clients a session is wired to
#[derive(Clone)]
pub struct Providers {
    pub stt: Arc<dyn SpeechToText>,
    pub llm: Arc<dyn LanguageModel>,
    pub tts: Arc<dyn TextToSpeech>,
}

/// State readable outside the worker: lifecycle, conversation history,
/// finalized turn metrics
///
/// Metrics readers never touch in-flight turn state, so these locks are
/// never contended with the pipeline's critical path.
pub struct SessionShared {
    session_id: String,
    created_at: DateTime<Utc>,
    lifecycle: RwLock<Lifecycle>,
    last_activity: RwLock<Instant>,
    current_turn: RwLock<Option<(TurnId, TurnState)>>,
    conversation: RwLock<Conversation>,
    records: RwLock<Vec<TurnRecord>>,
}

impl SessionShared {
    fn new(session_id: String) -> Self {
        Self {
            session_id,
            created_at: Utc::now(),
            lifecycle: RwLock::new(Lifecycle::Connecting),
            last_activity: RwLock::new(Instant::now()),
            current_turn: RwLock::new(None),
            conversation: RwLock::new(Conversation::new()),
            records: RwLock::new(Vec::new()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.read()
    }

    fn set_lifecycle(&self, lifecycle: Lifecycle) {
        *self.lifecycle.write() = lifecycle;
    }

    /// Id and state of the most recent turn, if any
    pub fn current_turn(&self) -> Option<(TurnId, TurnState)> {
        *self.current_turn.read()
    }

    fn set_current_turn(&self, turn: Option<(TurnId, TurnState)>) {
        *self.current_turn.write() = turn;
    }

    fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    /// How long since the last inbound audio frame
    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.read().elapsed()
    }

    /// Snapshot of the conversation history
    pub fn conversation(&self) -> Conversation {
        self.conversation.read().clone()
    }

    fn push_user(&self, text: &str) {
        if !text.trim().is_empty() {
            self.conversation.write().push_user(text);
        }
    }

    fn push_assistant(&self, text: &str) {
        if !text.trim().is_empty() {
            self.conversation.write().push_assistant(text);
        }
    }

    fn push_record(&self, record: TurnRecord) {
        self.records.write().push(record);
    }

    /// Snapshot of the finalized turn metrics
    pub fn records(&self) -> Vec<TurnRecord> {
        self.records.read().clone()
    }

    pub fn record_count(&self) -> usize {
        self.records.read().len()
    }
}

/// Everything the worker reacts to, in arrival order
#[derive(Debug)]
pub enum SessionEvent {
    Audio(AudioFrame),
    SttPartial {
        turn_id: TurnId,
        text: String,
    },
    SttFinal {
        turn_id: TurnId,
        text: String,
        audio_seconds: f64,
    },
    LlmToken {
        turn_id: TurnId,
        text: String,
    },
    LlmComplete {
        turn_id: TurnId,
        input_tokens: u64,
        output_tokens: u64,
    },
    TtsAudio {
        turn_id: TurnId,
        chunk: AudioChunk,
    },
    TtsComplete {
        turn_id: TurnId,
        characters: u64,
    },
    ProviderError {
        turn_id: TurnId,
        lane: ProviderLane,
        error: ProviderError,
    },
    RetryLane {
        turn_id: TurnId,
        lane: ProviderLane,
        attempt: u32,
    },
    Cancel {
        turn_id: TurnId,
        reason: CancelReason,
    },
    Shutdown,
}

/// Public handle to a running session
///
/// Cheap to clone behind an `Arc`; the media boundary feeds audio through
/// it and the registry reads metrics from its shared state.
pub struct SessionHandle {
    shared: Arc<SessionShared>,
    events: mpsc::Sender<SessionEvent>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        self.shared.session_id()
    }

    pub fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    /// Deliver one inbound audio frame from the media boundary
    pub async fn audio_frame(&self, frame: AudioFrame) -> Result<()> {
        self.events
            .send(SessionEvent::Audio(frame))
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// Request cancellation of a specific turn; idempotent
    pub async fn cancel_turn(&self, turn_id: TurnId, reason: CancelReason) -> Result<()> {
        self.events
            .send(SessionEvent::Cancel { turn_id, reason })
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// Tear the session down and wait for the worker to drain
    pub async fn end(&self) {
        let _ = self.events.send(SessionEvent::Shutdown).await;
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

/// Entry point: spawn the worker for one call
pub struct SessionOrchestrator;

impl SessionOrchestrator {
    /// Start a session and return its handle
    ///
    /// An empty `session_id` gets a generated UUID.
    pub fn start(
        session_id: impl Into<String>,
        providers: Providers,
        media: Arc<dyn MediaSink>,
        config: OrchestratorConfig,
        rates: RateTable,
    ) -> Arc<SessionHandle> {
        let mut session_id = session_id.into();
        if session_id.is_empty() {
            session_id = uuid::Uuid::new_v4().to_string();
        }

        let shared = Arc::new(SessionShared::new(session_id));
        let (events_tx, events_rx) = mpsc::channel(config.event_queue_depth);
        let backoff = BackoffPolicy::new(&config.backoff);

        let worker = Worker {
            shared: shared.clone(),
            providers,
            media,
            backoff,
            latency: LatencyTracker::new(),
            cost: CostTracker::new(rates),
            events_tx: events_tx.clone(),
            events_rx,
            config,
            active: None,
            next_turn: 0,
            voice_active: false,
        };
        let join = tokio::spawn(worker.run());

        Arc::new(SessionHandle {
            shared,
            events: events_tx,
            worker: Mutex::new(Some(join)),
        })
    }
}

/// Per-lane bookkeeping inside one turn
#[derive(Default)]
struct LaneState {
    /// Retries consumed for the current incident
    attempts: u32,
    /// Last provider activity; drives the inactivity deadline while `Some`
    last_event: Option<Instant>,
    /// A retry sleep is outstanding; the inactivity deadline is suspended
    retry_pending: bool,
    /// Cancels this lane's pump without touching the others
    token: Option<CancellationToken>,
}

impl LaneState {
    /// Successful provider event: refresh the deadline, forgive retries
    fn activity(&mut self) {
        self.last_event = Some(Instant::now());
        self.attempts = 0;
    }

    /// Lane is done (or being torn down for a reopen)
    fn close(&mut self) {
        self.last_event = None;
        self.retry_pending = false;
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }
}

#[derive(Default)]
struct Lanes {
    stt: LaneState,
    llm: LaneState,
    tts: LaneState,
}

impl Lanes {
    fn get(&self, lane: ProviderLane) -> &LaneState {
        match lane {
            ProviderLane::Stt => &self.stt,
            ProviderLane::Llm => &self.llm,
            ProviderLane::Tts => &self.tts,
        }
    }

    fn get_mut(&mut self, lane: ProviderLane) -> &mut LaneState {
        match lane {
            ProviderLane::Stt => &mut self.stt,
            ProviderLane::Llm => &mut self.llm,
            ProviderLane::Tts => &mut self.tts,
        }
    }
}

/// The one in-flight turn and its plumbing
struct ActiveTurn {
    turn: Turn,
    /// Parent token; cancelling it stops every pump for this turn
    cancel: CancellationToken,
    stt_audio: Option<mpsc::Sender<AudioFrame>>,
    splitter: SentenceSplitter,
    /// Sentences awaiting synthesis; one TTS stream runs at a time so
    /// outbound audio keeps sentence order
    tts_queue: VecDeque<String>,
    /// Sentence currently being synthesized, kept for retry
    tts_current: Option<String>,
    llm_done: bool,
    /// Forced-endpoint deadline while transcribing
    silence_deadline: Option<Instant>,
    lanes: Lanes,
}

impl ActiveTurn {
    fn new(turn_id: TurnId, config: &OrchestratorConfig) -> Self {
        Self {
            turn: Turn::new(turn_id),
            cancel: CancellationToken::new(),
            stt_audio: None,
            splitter: SentenceSplitter::new(&config.sentence),
            tts_queue: VecDeque::new(),
            tts_current: None,
            llm_done: false,
            silence_deadline: None,
            lanes: Lanes::default(),
        }
    }
}

/// Single logical owner of all turn state for one session
struct Worker {
    shared: Arc<SessionShared>,
    providers: Providers,
    media: Arc<dyn MediaSink>,
    backoff: BackoffPolicy,
    latency: LatencyTracker,
    cost: CostTracker,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: mpsc::Receiver<SessionEvent>,
    config: OrchestratorConfig,
    active: Option<ActiveTurn>,
    next_turn: u64,
    /// Level of the caller's voice activity, for edge detection
    voice_active: bool,
}

impl Worker {
    async fn run(mut self) {
        self.shared.set_lifecycle(Lifecycle::Active);
        tracing::info!(session_id = %self.shared.session_id(), "session active");

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(SessionEvent::Shutdown) | None => break,
                    Some(event) => self.handle(event).await,
                },
                _ = sleep_until_opt(deadline) => self.on_deadline().await,
            }
        }

        if let Some(turn_id) = self.active.as_ref().map(|at| at.turn.id()) {
            self.cancel_turn(turn_id, CancelReason::SessionEnded);
        }
        self.shared.set_lifecycle(Lifecycle::Ended);
        tracing::info!(
            session_id = %self.shared.session_id(),
            turns = self.shared.record_count(),
            "session ended"
        );
    }

    async fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Audio(frame) => self.on_audio_frame(frame).await,
            SessionEvent::SttPartial { turn_id, text } => self.on_stt_partial(turn_id, text),
            SessionEvent::SttFinal {
                turn_id,
                text,
                audio_seconds,
            } => self.on_stt_final(turn_id, text, audio_seconds).await,
            SessionEvent::LlmToken { turn_id, text } => self.on_llm_token(turn_id, text).await,
            SessionEvent::LlmComplete {
                turn_id,
                input_tokens,
                output_tokens,
            } => {
                self.on_llm_complete(turn_id, input_tokens, output_tokens)
                    .await
            }
            SessionEvent::TtsAudio { turn_id, chunk } => self.on_tts_audio(turn_id, chunk).await,
            SessionEvent::TtsComplete {
                turn_id,
                characters,
            } => self.on_tts_complete(turn_id, characters).await,
            SessionEvent::ProviderError {
                turn_id,
                lane,
                error,
            } => self.on_provider_error(turn_id, lane, error).await,
            SessionEvent::RetryLane {
                turn_id,
                lane,
                attempt,
            } => self.on_retry(turn_id, lane, attempt).await,
            SessionEvent::Cancel { turn_id, reason } => self.cancel_turn(turn_id, reason),
            SessionEvent::Shutdown => {}
        }
    }

    // --- inbound media ---------------------------------------------------

    async fn on_audio_frame(&mut self, frame: AudioFrame) {
        self.shared.touch();

        let rising = frame.is_speech && !self.voice_active;
        self.voice_active = frame.is_speech;
        if rising {
            self.on_voice_activity().await;
        }

        if let Some(at) = self.active.as_ref() {
            if at.turn.accepts_events() {
                if let Some(audio) = &at.stt_audio {
                    // real-time data: drop rather than stall the event loop
                    if let Err(err) = audio.try_send(frame) {
                        tracing::debug!(
                            session_id = %self.shared.session_id(),
                            %err,
                            "dropping audio frame"
                        );
                    }
                }
            }
        }
    }

    /// Rising edge of caller speech: start the first turn, or barge in on
    /// whatever is in flight
    async fn on_voice_activity(&mut self) {
        let barge = match self.active.as_ref() {
            Some(at) if !at.turn.is_terminal() => match at.turn.state() {
                TurnState::Listening => return,
                _ => Some(at.turn.id()),
            },
            _ => None,
        };

        if let Some(turn_id) = barge {
            tracing::info!(
                session_id = %self.shared.session_id(),
                turn = %turn_id,
                "barge-in detected"
            );
            metrics::counter!("voicebridge_barge_ins_total").increment(1);
            self.cancel_turn(turn_id, CancelReason::BargeIn);
        }
        self.start_turn().await;
    }

    async fn start_turn(&mut self) {
        let turn_id = TurnId(self.next_turn);
        self.next_turn += 1;

        let mut at = ActiveTurn::new(turn_id, &self.config);
        self.latency.begin(turn_id);
        self.cost.begin(turn_id);
        self.shared
            .set_current_turn(Some((turn_id, TurnState::Listening)));
        tracing::info!(session_id = %self.shared.session_id(), turn = %turn_id, "turn started");
        metrics::counter!("voicebridge_turns_started_total").increment(1);

        self.open_stt(&mut at).await;
        self.active = Some(at);
    }

    // --- STT lane --------------------------------------------------------

    fn on_stt_partial(&mut self, turn_id: TurnId, text: String) {
        let Some(mut at) = self.take_active(turn_id, "stt_partial") else {
            return;
        };
        self.latency.mark(turn_id, Stage::SttFirstPartial);
        at.lanes.get_mut(ProviderLane::Stt).activity();
        at.turn.append_transcript(&text);
        if at.turn.state() == TurnState::Listening {
            self.transition(&mut at, TurnState::Transcribing);
        }
        at.silence_deadline = Some(Instant::now() + self.config.silence_timeout());
        self.active = Some(at);
    }

    async fn on_stt_final(&mut self, turn_id: TurnId, text: String, audio_seconds: f64) {
        let Some(mut at) = self.take_active(turn_id, "stt_final") else {
            return;
        };
        self.latency.mark(turn_id, Stage::SttFinal);
        self.cost.record_stt(turn_id, audio_seconds);
        at.lanes.get_mut(ProviderLane::Stt).close();
        at.silence_deadline = None;
        at.stt_audio = None;
        at.turn.set_final_transcript(text);

        if !self.transition(&mut at, TurnState::Thinking) {
            self.active = Some(at);
            return;
        }
        tracing::info!(
            session_id = %self.shared.session_id(),
            turn = %turn_id,
            transcript = %at.turn.transcript(),
            audio_seconds,
            "final transcript"
        );
        self.shared.push_user(at.turn.transcript());
        self.start_llm(&mut at).await;
        self.active = Some(at);
    }

    /// Silence timeout in `Transcribing`: treat the accumulated transcript
    /// as final. Audio seconds are estimated from word count since the
    /// provider never sent its own figure.
    async fn force_endpoint(&mut self, turn_id: TurnId) {
        let (text, audio_seconds) = {
            let Some(at) = self.active.as_mut() else { return };
            if at.turn.id() != turn_id || at.turn.state() != TurnState::Transcribing {
                return;
            }
            at.silence_deadline = None;
            let text = at.turn.transcript().to_string();
            let words = text.split_whitespace().count() as f64;
            let seconds = words / f64::from(self.config.speech_rate_wpm) * 60.0;
            (text, seconds)
        };
        tracing::info!(
            session_id = %self.shared.session_id(),
            turn = %turn_id,
            "silence timeout, forcing endpoint"
        );
        self.on_stt_final(turn_id, text, audio_seconds).await;
    }

    // --- LLM lane --------------------------------------------------------

    async fn on_llm_token(&mut self, turn_id: TurnId, text: String) {
        let Some(mut at) = self.take_active(turn_id, "llm_token") else {
            return;
        };
        self.latency.mark(turn_id, Stage::LlmFirstToken);
        at.lanes.get_mut(ProviderLane::Llm).activity();
        at.turn.append_response(&text);
        let fragments = at.splitter.push(&text);
        self.dispatch_fragments(&mut at, fragments).await;
        self.active = Some(at);
    }

    async fn on_llm_complete(&mut self, turn_id: TurnId, input_tokens: u64, output_tokens: u64) {
        let Some(mut at) = self.take_active(turn_id, "llm_complete") else {
            return;
        };
        self.latency.mark(turn_id, Stage::LlmComplete);
        self.cost.record_llm(turn_id, input_tokens, output_tokens);
        at.lanes.get_mut(ProviderLane::Llm).close();
        at.llm_done = true;

        if let Some(rest) = at.splitter.flush() {
            self.dispatch_fragments(&mut at, vec![rest]).await;
        }
        self.shared.push_assistant(at.turn.response());
        tracing::debug!(
            session_id = %self.shared.session_id(),
            turn = %turn_id,
            input_tokens,
            output_tokens,
            response_chars = at.turn.response().len(),
            "generation complete"
        );

        if at.tts_current.is_none() && at.tts_queue.is_empty() {
            self.complete_turn(at);
        } else {
            self.active = Some(at);
        }
    }

    /// Hand completed sentences to TTS, first one switches the turn to
    /// `Speaking`
    async fn dispatch_fragments(&self, at: &mut ActiveTurn, fragments: Vec<String>) {
        for fragment in fragments {
            if at.turn.state() == TurnState::Thinking {
                self.transition(at, TurnState::Speaking);
            }
            if at.tts_current.is_none() {
                self.start_tts(at, fragment).await;
            } else {
                at.tts_queue.push_back(fragment);
            }
        }
    }

    // --- TTS lane --------------------------------------------------------

    async fn on_tts_audio(&mut self, turn_id: TurnId, chunk: AudioChunk) {
        let Some(mut at) = self.take_active(turn_id, "tts_audio") else {
            return;
        };
        self.latency.mark(turn_id, Stage::TtsFirstAudio);
        at.lanes.get_mut(ProviderLane::Tts).activity();
        self.active = Some(at);
        self.media.play(chunk).await;
    }

    async fn on_tts_complete(&mut self, turn_id: TurnId, characters: u64) {
        let Some(mut at) = self.take_active(turn_id, "tts_complete") else {
            return;
        };
        self.latency.mark(turn_id, Stage::TtsComplete);
        self.cost.record_tts(turn_id, characters);
        at.tts_current = None;
        at.lanes.get_mut(ProviderLane::Tts).close();

        if let Some(next) = at.tts_queue.pop_front() {
            self.start_tts(&mut at, next).await;
            self.active = Some(at);
        } else if at.llm_done {
            self.complete_turn(at);
        } else {
            self.active = Some(at);
        }
    }

    // --- provider failure handling ---------------------------------------

    async fn on_provider_error(&mut self, turn_id: TurnId, lane: ProviderLane, error: ProviderError) {
        let Some(mut at) = self.take_active(turn_id, "provider_error") else {
            return;
        };
        metrics::counter!("voicebridge_provider_errors_total", "lane" => lane.as_str())
            .increment(1);

        let attempts = at.lanes.get(lane).attempts;
        match self.backoff.decide(&error, attempts) {
            RetryDecision::Retry { delay } => {
                tracing::warn!(
                    session_id = %self.shared.session_id(),
                    turn = %turn_id,
                    lane = %lane,
                    %error,
                    attempt = attempts + 1,
                    delay_ms = delay.as_millis() as u64,
                    "transient provider error, scheduling retry"
                );
                metrics::counter!("voicebridge_provider_retries_total", "lane" => lane.as_str())
                    .increment(1);

                let lane_state = at.lanes.get_mut(lane);
                lane_state.close();
                lane_state.attempts = attempts + 1;
                lane_state.retry_pending = true;
                if lane == ProviderLane::Stt {
                    at.stt_audio = None;
                }

                let attempt = attempts + 1;
                let tx = self.events_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx
                        .send(SessionEvent::RetryLane {
                            turn_id,
                            lane,
                            attempt,
                        })
                        .await;
                });
                self.active = Some(at);
            }
            RetryDecision::GiveUp => {
                tracing::error!(
                    session_id = %self.shared.session_id(),
                    turn = %turn_id,
                    lane = %lane,
                    %error,
                    attempts,
                    "provider failure, cancelling turn"
                );
                self.active = Some(at);
                self.cancel_turn(turn_id, CancelReason::ProviderFailure);
                if lane == ProviderLane::Tts {
                    self.media.terminate(TerminationReason::ProviderFailure).await;
                } else {
                    self.speak_notice().await;
                }
            }
        }
    }

    /// Reopen a single lane after its backoff delay
    async fn on_retry(&mut self, turn_id: TurnId, lane: ProviderLane, attempt: u32) {
        let Some(mut at) = self.take_active(turn_id, "retry") else {
            return;
        };
        tracing::info!(
            session_id = %self.shared.session_id(),
            turn = %turn_id,
            lane = %lane,
            attempt,
            "reopening provider sub-stream"
        );
        at.lanes.get_mut(lane).retry_pending = false;

        match lane {
            ProviderLane::Stt => self.open_stt(&mut at).await,
            ProviderLane::Llm => {
                // regeneration restarts the response; tokens from the
                // failed attempt and any unspoken fragments are discarded
                at.turn.clear_response();
                at.splitter.reset();
                at.tts_queue.clear();
                self.start_llm(&mut at).await;
            }
            ProviderLane::Tts => {
                if let Some(text) = at.tts_current.take() {
                    self.start_tts(&mut at, text).await;
                }
            }
        }
        self.active = Some(at);
    }

    /// Short synthesized apology on a dead turn, if TTS can still talk;
    /// otherwise a silent termination signal
    async fn speak_notice(&self) {
        let text = self.config.apology_text.clone();
        match self.providers.tts.synthesize(&text).await {
            Ok(mut events) => {
                let media = self.media.clone();
                let session_id = self.shared.session_id().to_string();
                tokio::spawn(async move {
                    while let Some(event) = events.next().await {
                        match event {
                            Ok(TtsEvent::Audio { chunk }) => media.play(chunk).await,
                            Ok(TtsEvent::Complete { .. }) => break,
                            Err(error) => {
                                tracing::warn!(session_id = %session_id, %error, "apology synthesis failed");
                                media.terminate(TerminationReason::ProviderFailure).await;
                                break;
                            }
                        }
                    }
                });
            }
            Err(error) => {
                tracing::warn!(
                    session_id = %self.shared.session_id(),
                    %error,
                    "apology synthesis unavailable"
                );
                self.media.terminate(TerminationReason::ProviderFailure).await;
            }
        }
    }

    // --- turn termination ------------------------------------------------

    fn cancel_turn(&mut self, turn_id: TurnId, reason: CancelReason) {
        let mut at = match self.active.take() {
            Some(at) if at.turn.id() == turn_id && !at.turn.is_terminal() => at,
            other => {
                // idempotent: unknown or already-terminal turns are left alone
                self.active = other;
                return;
            }
        };
        at.turn.cancel();
        at.cancel.cancel();
        at.stt_audio = None;
        self.shared
            .set_current_turn(Some((turn_id, TurnState::Cancelled)));
        tracing::info!(
            session_id = %self.shared.session_id(),
            turn = %turn_id,
            reason = %reason,
            "turn cancelled"
        );
        metrics::counter!("voicebridge_turns_total", "outcome" => "cancelled").increment(1);
        self.finalize_turn(turn_id, TurnOutcome::Cancelled(reason));
    }

    fn complete_turn(&mut self, mut at: ActiveTurn) {
        let turn_id = at.turn.id();
        if !self.transition(&mut at, TurnState::Completed) {
            self.active = Some(at);
            return;
        }
        at.cancel.cancel();
        tracing::info!(session_id = %self.shared.session_id(), turn = %turn_id, "turn completed");
        metrics::counter!("voicebridge_turns_total", "outcome" => "completed").increment(1);
        self.finalize_turn(turn_id, TurnOutcome::Completed);
    }

    /// Exactly one finalize per turn, success and cancellation alike, so
    /// metrics for failed turns are retained
    fn finalize_turn(&mut self, turn_id: TurnId, outcome: TurnOutcome) {
        let latency = self.latency.finalize(turn_id);
        let cost = self.cost.finalize(turn_id);
        match (latency, cost) {
            (Ok(latency), Ok(cost)) => {
                metrics::histogram!("voicebridge_turn_end_to_end_ms")
                    .record(latency.end_to_end_ms as f64);
                metrics::histogram!("voicebridge_turn_cost_usd").record(cost.estimated_cost_usd);
                self.shared.push_record(TurnRecord {
                    turn_id,
                    outcome,
                    latency,
                    cost,
                });
            }
            (latency, cost) => {
                tracing::warn!(
                    session_id = %self.shared.session_id(),
                    turn = %turn_id,
                    latency_missing = latency.is_err(),
                    cost_missing = cost.is_err(),
                    "tracker finalize failed"
                );
            }
        }
    }

    // --- provider stream plumbing ----------------------------------------

    async fn open_stt(&self, at: &mut ActiveTurn) {
        let format = AudioFormat {
            sample_rate: self.config.sample_rate,
            channels: self.config.channels,
            encoding: AudioEncoding::default(),
        };
        let turn_id = at.turn.id();
        match self.providers.stt.open_stream(format).await {
            Ok(SttStream { audio, events }) => {
                let token = at.cancel.child_token();
                let lane = at.lanes.get_mut(ProviderLane::Stt);
                lane.token = Some(token.clone());
                lane.last_event = Some(Instant::now());
                at.stt_audio = Some(audio);
                spawn_stt_pump(self.events_tx.clone(), turn_id, events, token);
            }
            Err(error) => self.report_open_failure(turn_id, ProviderLane::Stt, error),
        }
    }

    async fn start_llm(&self, at: &mut ActiveTurn) {
        let turn_id = at.turn.id();
        let request = GenerateRequest::new(&self.config.system_prompt)
            .with_history(&self.shared.conversation());
        match self.providers.llm.generate(request).await {
            Ok(events) => {
                let token = at.cancel.child_token();
                let lane = at.lanes.get_mut(ProviderLane::Llm);
                lane.token = Some(token.clone());
                lane.last_event = Some(Instant::now());
                spawn_llm_pump(self.events_tx.clone(), turn_id, events, token);
            }
            Err(error) => self.report_open_failure(turn_id, ProviderLane::Llm, error),
        }
    }

    async fn start_tts(&self, at: &mut ActiveTurn, text: String) {
        let turn_id = at.turn.id();
        match self.providers.tts.synthesize(&text).await {
            Ok(events) => {
                let token = at.cancel.child_token();
                let lane = at.lanes.get_mut(ProviderLane::Tts);
                lane.token = Some(token.clone());
                lane.last_event = Some(Instant::now());
                at.tts_current = Some(text);
                spawn_tts_pump(self.events_tx.clone(), turn_id, events, token);
            }
            Err(error) => {
                // keep the sentence so a retry can re-synthesize it
                at.tts_current = Some(text);
                self.report_open_failure(turn_id, ProviderLane::Tts, error);
            }
        }
    }

    /// Route a stream-open failure through the same classification path as
    /// mid-stream errors. Posted from a spawned task: the worker must not
    /// await capacity on its own queue.
    fn report_open_failure(&self, turn_id: TurnId, lane: ProviderLane, error: ProviderError) {
        tracing::warn!(
            session_id = %self.shared.session_id(),
            turn = %turn_id,
            lane = %lane,
            %error,
            "failed to open provider stream"
        );
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let _ = tx
                .send(SessionEvent::ProviderError {
                    turn_id,
                    lane,
                    error,
                })
                .await;
        });
    }

    // --- deadlines --------------------------------------------------------

    fn next_deadline(&self) -> Option<Instant> {
        let at = self.active.as_ref()?;
        if at.turn.is_terminal() {
            return None;
        }
        let stage = self.config.stage_timeout();
        let mut deadlines: Vec<Instant> = Vec::new();
        if let Some(deadline) = at.silence_deadline {
            deadlines.push(deadline);
        }
        for lane in LANES {
            let state = at.lanes.get(lane);
            if !state.retry_pending {
                if let Some(last) = state.last_event {
                    deadlines.push(last + stage);
                }
            }
        }
        deadlines.into_iter().min()
    }

    async fn on_deadline(&mut self) {
        let now = Instant::now();
        let stage = self.config.stage_timeout();

        enum Due {
            Silence,
            Lane(ProviderLane),
        }

        let (turn_id, due) = {
            let Some(at) = self.active.as_ref() else { return };
            if at.turn.is_terminal() {
                return;
            }
            let turn_id = at.turn.id();
            if at.silence_deadline.is_some_and(|d| d <= now) {
                (turn_id, Due::Silence)
            } else {
                let stalled = LANES.into_iter().find(|&lane| {
                    let state = at.lanes.get(lane);
                    !state.retry_pending
                        && state.last_event.is_some_and(|last| last + stage <= now)
                });
                match stalled {
                    Some(lane) => (turn_id, Due::Lane(lane)),
                    None => return,
                }
            }
        };

        match due {
            Due::Silence => self.force_endpoint(turn_id).await,
            Due::Lane(lane) => {
                tracing::warn!(
                    session_id = %self.shared.session_id(),
                    turn = %turn_id,
                    lane = %lane,
                    "no provider activity within stage timeout"
                );
                self.on_provider_error(turn_id, lane, ProviderError::Timeout(stage))
                    .await;
            }
        }
    }

    // --- helpers ----------------------------------------------------------

    /// Pull the active turn out for mutation if the event still applies.
    /// Late, duplicate, or unknown-turn events land here and are dropped.
    fn take_active(&mut self, turn_id: TurnId, event: &'static str) -> Option<ActiveTurn> {
        match self.active.take() {
            Some(at) if at.turn.id() == turn_id && at.turn.accepts_events() => Some(at),
            Some(at) => {
                tracing::debug!(
                    session_id = %self.shared.session_id(),
                    turn = %turn_id,
                    current = %at.turn.id(),
                    state = %at.turn.state(),
                    event,
                    "dropping event for inactive turn"
                );
                self.active = Some(at);
                None
            }
            None => {
                tracing::debug!(
                    session_id = %self.shared.session_id(),
                    turn = %turn_id,
                    event,
                    "dropping event for unknown turn"
                );
                None
            }
        }
    }

    fn transition(&self, at: &mut ActiveTurn, next: TurnState) -> bool {
        match at.turn.transition(next) {
            Ok(()) => {
                self.shared.set_current_turn(Some((at.turn.id(), next)));
                true
            }
            Err(err) => {
                tracing::debug!(session_id = %self.shared.session_id(), %err, "transition rejected");
                false
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// --- pump tasks: forward provider events into the session queue -----------

fn spawn_stt_pump(
    tx: mpsc::Sender<SessionEvent>,
    turn_id: TurnId,
    mut events: EventStream<SttEvent>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = events.next() => event,
            };
            match event {
                Some(Ok(SttEvent::Partial { text })) => {
                    if tx
                        .send(SessionEvent::SttPartial { turn_id, text })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Some(Ok(SttEvent::Final {
                    text,
                    audio_seconds,
                })) => {
                    let _ = tx
                        .send(SessionEvent::SttFinal {
                            turn_id,
                            text,
                            audio_seconds,
                        })
                        .await;
                    break;
                }
                Some(Err(error)) => {
                    let _ = tx
                        .send(SessionEvent::ProviderError {
                            turn_id,
                            lane: ProviderLane::Stt,
                            error,
                        })
                        .await;
                    break;
                }
                None => break,
            }
        }
    });
}

fn spawn_llm_pump(
    tx: mpsc::Sender<SessionEvent>,
    turn_id: TurnId,
    mut events: EventStream<LlmEvent>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = events.next() => event,
            };
            match event {
                Some(Ok(LlmEvent::Token { text })) => {
                    if tx
                        .send(SessionEvent::LlmToken { turn_id, text })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Some(Ok(LlmEvent::Complete {
                    input_tokens,
                    output_tokens,
                })) => {
                    let _ = tx
                        .send(SessionEvent::LlmComplete {
                            turn_id,
                            input_tokens,
                            output_tokens,
                        })
                        .await;
                    break;
                }
                Some(Err(error)) => {
                    let _ = tx
                        .send(SessionEvent::ProviderError {
                            turn_id,
                            lane: ProviderLane::Llm,
                            error,
                        })
                        .await;
                    break;
                }
                None => break,
            }
        }
    });
}

fn spawn_tts_pump(
    tx: mpsc::Sender<SessionEvent>,
    turn_id: TurnId,
    mut events: EventStream<TtsEvent>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = events.next() => event,
            };
            match event {
                Some(Ok(TtsEvent::Audio { chunk })) => {
                    if tx
                        .send(SessionEvent::TtsAudio { turn_id, chunk })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Some(Ok(TtsEvent::Complete { characters })) => {
                    let _ = tx
                        .send(SessionEvent::TtsComplete {
                            turn_id,
                            characters,
                        })
                        .await;
                    break;
                }
                Some(Err(error)) => {
                    let _ = tx
                        .send(SessionEvent::ProviderError {
                            turn_id,
                            lane: ProviderLane::Tts,
                            error,
                        })
                        .await;
                    break;
                }
                None => break,
            }
        }
    });
}
