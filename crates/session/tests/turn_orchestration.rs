//! Integration tests for the session orchestrator
//!
//! Drive the full STT -> LLM -> TTS pipeline with scripted providers under
//! a paused clock, so every stage boundary lands at a deterministic
//! millisecond.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use voicebridge_config::OrchestratorConfig;
use voicebridge_core::{
    AudioChunk, AudioFormat, AudioFrame, EventStream, GenerateRequest, LanguageModel, LlmEvent,
    MediaSink, ProviderError, ProviderResult, SpeechToText, SttEvent, SttStream,
    TerminationReason, TextToSpeech, TtsEvent,
};
use voicebridge_session::{
    CancelReason, Lifecycle, Providers, SessionOrchestrator, SessionRegistry, Stage, TurnId,
    TurnOutcome, TurnState,
};

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

type Script<T> = Vec<(Duration, ProviderResult<T>)>;

/// STT mock: each opened stream plays one script (inter-event delays),
/// then stays open draining audio until the orchestrator closes it.
struct ScriptedStt {
    scripts: Mutex<VecDeque<Script<SttEvent>>>,
    opens: AtomicUsize,
    open_times: Mutex<Vec<Instant>>,
}

impl ScriptedStt {
    fn new(scripts: Vec<Script<SttEvent>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            opens: AtomicUsize::new(0),
            open_times: Mutex::new(Vec::new()),
        })
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechToText for ScriptedStt {
    async fn open_stream(&self, _format: AudioFormat) -> ProviderResult<SttStream> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.open_times.lock().push(Instant::now());
        let script = self.scripts.lock().pop_front().unwrap_or_default();

        let (audio_tx, mut audio_rx) = mpsc::channel::<AudioFrame>(64);
        let events = Box::pin(async_stream::stream! {
            for (delay, event) in script {
                tokio::time::sleep(delay).await;
                yield event;
            }
            loop {
                if audio_rx.recv().await.is_none() {
                    std::future::pending::<()>().await;
                }
            }
        });
        Ok(SttStream {
            audio: audio_tx,
            events,
        })
    }

    fn provider_name(&self) -> &str {
        "scripted-stt"
    }
}

/// LLM mock: one script per generate call, hangs after the script so a
/// missing Complete looks like a stalled provider.
struct ScriptedLlm {
    scripts: Mutex<VecDeque<Script<LlmEvent>>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<GenerateRequest>>,
}

impl ScriptedLlm {
    fn new(scripts: Vec<Script<LlmEvent>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    async fn generate(&self, request: GenerateRequest) -> ProviderResult<EventStream<LlmEvent>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request);
        let script = self.scripts.lock().pop_front().unwrap_or_default();
        Ok(Box::pin(async_stream::stream! {
            for (delay, event) in script {
                tokio::time::sleep(delay).await;
                yield event;
            }
            std::future::pending::<()>().await;
        }))
    }

    fn model_name(&self) -> &str {
        "scripted-llm"
    }
}

/// TTS mock with fixed audio/complete delays per synthesis
struct ScriptedTts {
    audio_delay: Duration,
    complete_delay: Duration,
    fail_open: bool,
    texts: Mutex<Vec<String>>,
}

impl ScriptedTts {
    fn new(audio_delay: Duration, complete_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            audio_delay,
            complete_delay,
            fail_open: false,
            texts: Mutex::new(Vec::new()),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            audio_delay: ms(0),
            complete_delay: ms(0),
            fail_open: true,
            texts: Mutex::new(Vec::new()),
        })
    }

    fn texts(&self) -> Vec<String> {
        self.texts.lock().clone()
    }
}

#[async_trait]
impl TextToSpeech for ScriptedTts {
    async fn synthesize(&self, text: &str) -> ProviderResult<EventStream<TtsEvent>> {
        self.texts.lock().push(text.to_string());
        if self.fail_open {
            return Err(ProviderError::Auth("synthesis backend down".into()));
        }
        let characters = text.chars().count() as u64;
        let audio_delay = self.audio_delay;
        let rest = self.complete_delay.saturating_sub(self.audio_delay);
        Ok(Box::pin(async_stream::stream! {
            tokio::time::sleep(audio_delay).await;
            yield Ok(TtsEvent::Audio { chunk: AudioChunk::new(vec![1u8; 160]) });
            tokio::time::sleep(rest).await;
            yield Ok(TtsEvent::Complete { characters });
        }))
    }

    fn voice_name(&self) -> &str {
        "scripted-tts"
    }
}

/// Media sink that records everything it is handed
#[derive(Default)]
struct RecordingMedia {
    chunks: Mutex<Vec<AudioChunk>>,
    terminations: Mutex<Vec<TerminationReason>>,
}

#[async_trait]
impl MediaSink for RecordingMedia {
    async fn play(&self, chunk: AudioChunk) {
        self.chunks.lock().push(chunk);
    }

    async fn terminate(&self, reason: TerminationReason) {
        self.terminations.lock().push(reason);
    }
}

fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    // short fragments are fine in tests
    config.sentence.min_chars = 1;
    config
}

fn start_session(
    id: &str,
    stt: &Arc<ScriptedStt>,
    llm: &Arc<ScriptedLlm>,
    tts: &Arc<ScriptedTts>,
    media: &Arc<RecordingMedia>,
    config: OrchestratorConfig,
) -> Arc<voicebridge_session::SessionHandle> {
    SessionOrchestrator::start(
        id,
        Providers {
            stt: stt.clone(),
            llm: llm.clone(),
            tts: tts.clone(),
        },
        media.clone(),
        config,
        voicebridge_config::RateTable::default(),
    )
}

async fn speak_frame(handle: &voicebridge_session::SessionHandle, timestamp_ms: u64) {
    handle
        .audio_frame(AudioFrame::speech(vec![0u8; 320], timestamp_ms))
        .await
        .unwrap();
    // let the worker dequeue it
    tokio::time::sleep(ms(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_end_to_end_turn() {
    let stt = ScriptedStt::new(vec![vec![
        (
            ms(100),
            Ok(SttEvent::Partial {
                text: "hel".into(),
            }),
        ),
        (
            ms(180),
            Ok(SttEvent::Partial {
                text: "hello".into(),
            }),
        ),
        (
            ms(620),
            Ok(SttEvent::Final {
                text: "hello there".into(),
                audio_seconds: 0.9,
            }),
        ),
    ]]);
    let llm = ScriptedLlm::new(vec![vec![
        (ms(180), Ok(LlmEvent::Token { text: "Hi".into() })),
        (
            ms(320),
            Ok(LlmEvent::Token {
                text: " there.".into(),
            }),
        ),
        (
            ms(200),
            Ok(LlmEvent::Complete {
                input_tokens: 100,
                output_tokens: 50,
            }),
        ),
    ]]);
    let tts = ScriptedTts::new(ms(150), ms(800));
    let media = Arc::new(RecordingMedia::default());
    let handle = start_session("e2e", &stt, &llm, &tts, &media, test_config());

    speak_frame(&handle, 0).await;
    tokio::time::sleep(ms(3_000)).await;

    let records = handle.shared().records();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.outcome, TurnOutcome::Completed);

    // stage offsets, relative to the first partial at t=100ms
    let latency = &record.latency;
    assert_eq!(latency.offset_ms(Stage::SttFirstPartial), Some(0));
    assert_eq!(latency.offset_ms(Stage::SttFinal), Some(800));
    assert_eq!(latency.offset_ms(Stage::LlmFirstToken), Some(980));
    assert_eq!(latency.offset_ms(Stage::LlmComplete), Some(1_500));
    assert_eq!(latency.offset_ms(Stage::TtsFirstAudio), Some(1_450));
    assert_eq!(latency.offset_ms(Stage::TtsComplete), Some(2_100));
    assert_eq!(latency.end_to_end_ms, 2_100);

    // ordering invariants
    assert!(latency.offset_ms(Stage::SttFirstPartial) <= latency.offset_ms(Stage::SttFinal));
    assert!(latency.offset_ms(Stage::SttFinal) <= latency.offset_ms(Stage::LlmFirstToken));
    assert!(latency.offset_ms(Stage::LlmFirstToken) <= latency.offset_ms(Stage::LlmComplete));
    // streaming overlap: first audio precedes LLM completion
    assert!(
        latency.offset_ms(Stage::TtsFirstAudio).unwrap()
            < latency.offset_ms(Stage::LlmComplete).unwrap()
    );

    // usage and cost
    let cost = &record.cost;
    assert!((cost.stt_seconds - 0.9).abs() < 1e-9);
    assert_eq!(cost.llm_input_tokens, 100);
    assert_eq!(cost.llm_output_tokens, 50);
    assert_eq!(cost.tts_characters, 9);
    assert!(cost.estimated_cost_usd > 0.0);

    // conversation history holds the final transcript, not partials
    let conversation = handle.shared().conversation();
    assert_eq!(conversation.utterances().len(), 2);
    assert_eq!(conversation.utterances()[0].text, "hello there");
    assert_eq!(conversation.utterances()[1].text, "Hi there.");

    // the LLM saw the history including the new user turn
    let requests = llm.requests.lock();
    let last = requests[0].messages.last().unwrap();
    assert_eq!(last.content, "hello there");

    assert_eq!(media.chunks.lock().len(), 1);
    assert_eq!(
        handle.shared().current_turn(),
        Some((TurnId(0), TurnState::Completed))
    );

    // cancelling a finished turn is a no-op
    handle
        .cancel_turn(TurnId(0), CancelReason::Requested)
        .await
        .unwrap();
    tokio::time::sleep(ms(10)).await;
    assert_eq!(handle.shared().records().len(), 1);

    handle.end().await;
    assert_eq!(handle.shared().lifecycle(), Lifecycle::Ended);
}

#[tokio::test(start_paused = true)]
async fn test_barge_in_cancels_and_restarts() {
    let stt = ScriptedStt::new(vec![
        vec![
            (
                ms(50),
                Ok(SttEvent::Partial {
                    text: "stop".into(),
                }),
            ),
            (
                ms(50),
                Ok(SttEvent::Final {
                    text: "stop the music".into(),
                    audio_seconds: 0.5,
                }),
            ),
        ],
        // second turn: stays listening
        vec![],
    ]);
    let llm = ScriptedLlm::new(vec![vec![
        (
            ms(50),
            Ok(LlmEvent::Token {
                text: "Okay, stopping now.".into(),
            }),
        ),
        (
            ms(20),
            Ok(LlmEvent::Complete {
                input_tokens: 10,
                output_tokens: 5,
            }),
        ),
    ]]);
    // long synthesis keeps the turn in Speaking
    let tts = ScriptedTts::new(ms(50), ms(10_000));
    let media = Arc::new(RecordingMedia::default());
    let handle = start_session("barge", &stt, &llm, &tts, &media, test_config());

    speak_frame(&handle, 0).await;
    tokio::time::sleep(ms(500)).await;
    assert_eq!(
        handle.shared().current_turn(),
        Some((TurnId(0), TurnState::Speaking))
    );

    // caller goes quiet, then speaks over the agent
    handle
        .audio_frame(AudioFrame::silence(520))
        .await
        .unwrap();
    tokio::time::sleep(ms(1)).await;
    speak_frame(&handle, 540).await;

    // the old turn is cancelled and finalized, the new one is already live
    let records = handle.shared().records();
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].outcome,
        TurnOutcome::Cancelled(CancelReason::BargeIn)
    );
    // metrics survived the cancellation
    assert!(records[0].latency.offset_ms(Stage::TtsFirstAudio).is_some());

    assert_eq!(
        handle.shared().current_turn(),
        Some((TurnId(1), TurnState::Listening))
    );
    assert_eq!(stt.opens(), 2);

    handle.end().await;
    // session teardown cancelled the listening turn too; finalize ran once per turn
    let records = handle.shared().records();
    assert_eq!(records.len(), 2);
    assert_eq!(
        records[1].outcome,
        TurnOutcome::Cancelled(CancelReason::SessionEnded)
    );
}

#[tokio::test(start_paused = true)]
async fn test_silence_timeout_forces_endpoint() {
    let stt = ScriptedStt::new(vec![vec![(
        ms(100),
        Ok(SttEvent::Partial {
            text: "hello".into(),
        }),
    )]]);
    let llm = ScriptedLlm::new(vec![vec![
        (
            ms(50),
            Ok(LlmEvent::Token {
                text: "Hi.".into(),
            }),
        ),
        (
            ms(20),
            Ok(LlmEvent::Complete {
                input_tokens: 5,
                output_tokens: 2,
            }),
        ),
    ]]);
    let tts = ScriptedTts::new(ms(20), ms(50));
    let media = Arc::new(RecordingMedia::default());
    let handle = start_session("silence", &stt, &llm, &tts, &media, test_config());

    speak_frame(&handle, 0).await;
    // partial at 100ms, then nothing: forced endpoint at 100 + 1200ms
    tokio::time::sleep(ms(2_000)).await;

    let records = handle.shared().records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, TurnOutcome::Completed);

    let conversation = handle.shared().conversation();
    assert_eq!(conversation.utterances()[0].text, "hello");

    // billed seconds estimated at 150 wpm: one word = 0.4s
    assert!((records[0].cost.stt_seconds - 0.4).abs() < 1e-9);

    handle.end().await;
}

#[tokio::test(start_paused = true)]
async fn test_stt_timeout_retries_once_then_succeeds() {
    // first stream never produces an event; the replacement works
    let stt = ScriptedStt::new(vec![
        vec![],
        vec![
            (
                ms(100),
                Ok(SttEvent::Partial {
                    text: "hello".into(),
                }),
            ),
            (
                ms(100),
                Ok(SttEvent::Final {
                    text: "hello again".into(),
                    audio_seconds: 0.6,
                }),
            ),
        ],
    ]);
    let llm = ScriptedLlm::new(vec![vec![
        (
            ms(50),
            Ok(LlmEvent::Token {
                text: "Welcome back.".into(),
            }),
        ),
        (
            ms(20),
            Ok(LlmEvent::Complete {
                input_tokens: 8,
                output_tokens: 3,
            }),
        ),
    ]]);
    let tts = ScriptedTts::new(ms(20), ms(50));
    let media = Arc::new(RecordingMedia::default());
    let handle = start_session("retry", &stt, &llm, &tts, &media, test_config());

    speak_frame(&handle, 0).await;
    tokio::time::sleep(ms(8_000)).await;

    // exactly one retry: the initial open plus one reopen
    assert_eq!(stt.opens(), 2);
    let opens = stt.open_times.lock().clone();
    let gap = opens[1] - opens[0];
    // 5s inactivity timeout plus at least the base backoff delay
    assert!(gap >= ms(5_250), "reopen after {gap:?}");
    assert!(gap < ms(5_500), "reopen after {gap:?}");

    let records = handle.shared().records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, TurnOutcome::Completed);
    assert_eq!(
        handle.shared().conversation().utterances()[0].text,
        "hello again"
    );

    handle.end().await;
}

#[tokio::test(start_paused = true)]
async fn test_stt_retries_exhaust_and_apologize() {
    let mut config = test_config();
    config.stage_timeout_ms = 1_000;
    config.backoff.max_attempts = 2;

    // every stream hangs
    let stt = ScriptedStt::new(vec![vec![], vec![], vec![]]);
    let llm = ScriptedLlm::new(vec![]);
    let tts = ScriptedTts::new(ms(20), ms(50));
    let media = Arc::new(RecordingMedia::default());
    let apology = config.apology_text.clone();
    let handle = start_session("exhaust", &stt, &llm, &tts, &media, config);

    speak_frame(&handle, 0).await;
    tokio::time::sleep(ms(10_000)).await;

    // initial open + two retries, then give up
    assert_eq!(stt.opens(), 3);
    assert_eq!(llm.calls(), 0);

    let records = handle.shared().records();
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].outcome,
        TurnOutcome::Cancelled(CancelReason::ProviderFailure)
    );

    // TTS was healthy, so the caller heard an apology
    assert_eq!(tts.texts(), vec![apology]);
    assert!(!media.chunks.lock().is_empty());
    assert!(media.terminations.lock().is_empty());

    handle.end().await;
}

#[tokio::test(start_paused = true)]
async fn test_tts_failure_terminates_silently() {
    let stt = ScriptedStt::new(vec![vec![
        (
            ms(50),
            Ok(SttEvent::Partial {
                text: "hi".into(),
            }),
        ),
        (
            ms(50),
            Ok(SttEvent::Final {
                text: "hi there".into(),
                audio_seconds: 0.3,
            }),
        ),
    ]]);
    let llm = ScriptedLlm::new(vec![vec![
        (
            ms(50),
            Ok(LlmEvent::Token {
                text: "Hello.".into(),
            }),
        ),
        (
            ms(20),
            Ok(LlmEvent::Complete {
                input_tokens: 5,
                output_tokens: 2,
            }),
        ),
    ]]);
    let tts = ScriptedTts::failing();
    let media = Arc::new(RecordingMedia::default());
    let handle = start_session("ttsdown", &stt, &llm, &tts, &media, test_config());

    speak_frame(&handle, 0).await;
    tokio::time::sleep(ms(2_000)).await;

    let records = handle.shared().records();
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].outcome,
        TurnOutcome::Cancelled(CancelReason::ProviderFailure)
    );

    // no apology path when TTS itself is down: silent termination signal
    assert_eq!(
        media.terminations.lock().clone(),
        vec![TerminationReason::ProviderFailure]
    );
    assert!(media.chunks.lock().is_empty());

    handle.end().await;
}

#[tokio::test(start_paused = true)]
async fn test_fragments_cover_full_response() {
    let stt = ScriptedStt::new(vec![vec![
        (
            ms(50),
            Ok(SttEvent::Partial {
                text: "question".into(),
            }),
        ),
        (
            ms(50),
            Ok(SttEvent::Final {
                text: "tell me more".into(),
                audio_seconds: 0.8,
            }),
        ),
    ]]);
    let llm = ScriptedLlm::new(vec![vec![
        (ms(20), Ok(LlmEvent::Token { text: "Sure. ".into() })),
        (ms(20), Ok(LlmEvent::Token { text: "I can ".into() })),
        (
            ms(20),
            Ok(LlmEvent::Token {
                text: "help with that. ".into(),
            }),
        ),
        (
            ms(20),
            Ok(LlmEvent::Token {
                text: "Anything else?".into(),
            }),
        ),
        (
            ms(20),
            Ok(LlmEvent::Complete {
                input_tokens: 20,
                output_tokens: 12,
            }),
        ),
    ]]);
    let tts = ScriptedTts::new(ms(10), ms(30));
    let media = Arc::new(RecordingMedia::default());
    let handle = start_session("fragments", &stt, &llm, &tts, &media, test_config());

    speak_frame(&handle, 0).await;
    tokio::time::sleep(ms(2_000)).await;

    let records = handle.shared().records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, TurnOutcome::Completed);

    let texts = tts.texts();
    assert!(texts.len() > 1, "expected streaming synthesis: {texts:?}");
    for text in &texts {
        assert!(!text.trim().is_empty());
    }
    let full: String = texts.concat();
    assert_eq!(full, "Sure. I can help with that. Anything else?");
    assert_eq!(
        handle.shared().conversation().utterances()[1].text,
        full
    );

    handle.end().await;
}

#[tokio::test(start_paused = true)]
async fn test_sessions_are_independent() {
    // session A dies on a fatal LLM error, session B completes untouched
    let stt_a = ScriptedStt::new(vec![vec![(
        ms(50),
        Ok(SttEvent::Final {
            text: "hello".into(),
            audio_seconds: 0.4,
        }),
    )]]);
    let llm_a = ScriptedLlm::new(vec![vec![(
        ms(20),
        Err(ProviderError::Auth("revoked key".into())),
    )]]);
    let tts_a = ScriptedTts::new(ms(10), ms(30));
    let media_a = Arc::new(RecordingMedia::default());
    let handle_a = start_session("fail-a", &stt_a, &llm_a, &tts_a, &media_a, test_config());

    let stt_b = ScriptedStt::new(vec![vec![(
        ms(60),
        Ok(SttEvent::Final {
            text: "how are you".into(),
            audio_seconds: 0.5,
        }),
    )]]);
    let llm_b = ScriptedLlm::new(vec![vec![
        (
            ms(30),
            Ok(LlmEvent::Token {
                text: "Doing great.".into(),
            }),
        ),
        (
            ms(10),
            Ok(LlmEvent::Complete {
                input_tokens: 6,
                output_tokens: 3,
            }),
        ),
    ]]);
    let tts_b = ScriptedTts::new(ms(10), ms(30));
    let media_b = Arc::new(RecordingMedia::default());
    let handle_b = start_session("ok-b", &stt_b, &llm_b, &tts_b, &media_b, test_config());

    speak_frame(&handle_a, 0).await;
    speak_frame(&handle_b, 0).await;
    tokio::time::sleep(ms(2_000)).await;

    let records_a = handle_a.shared().records();
    assert_eq!(
        records_a[0].outcome,
        TurnOutcome::Cancelled(CancelReason::ProviderFailure)
    );

    let records_b = handle_b.shared().records();
    assert_eq!(records_b.len(), 1);
    assert_eq!(records_b[0].outcome, TurnOutcome::Completed);

    handle_a.end().await;
    handle_b.end().await;
}

#[tokio::test(start_paused = true)]
async fn test_registry_lifecycle_and_metrics() {
    let registry = Arc::new(SessionRegistry::new(voicebridge_config::RegistryConfig {
        max_sessions: 2,
        ..Default::default()
    }));

    let stt = ScriptedStt::new(vec![vec![(
        ms(50),
        Ok(SttEvent::Final {
            text: "hello".into(),
            audio_seconds: 0.4,
        }),
    )]]);
    let llm = ScriptedLlm::new(vec![vec![
        (
            ms(20),
            Ok(LlmEvent::Token {
                text: "Hi there.".into(),
            }),
        ),
        (
            ms(10),
            Ok(LlmEvent::Complete {
                input_tokens: 5,
                output_tokens: 3,
            }),
        ),
    ]]);
    let tts = ScriptedTts::new(ms(10), ms(30));
    let media = Arc::new(RecordingMedia::default());

    let handle = start_session("reg-1", &stt, &llm, &tts, &media, test_config());
    registry.insert(handle.clone()).unwrap();

    // duplicate ids are rejected
    assert!(registry.insert(handle.clone()).is_err());
    assert_eq!(registry.len(), 1);

    // unknown session metrics surface NotFound
    let err = registry.session_metrics("who").unwrap_err();
    assert!(err.is_not_found());

    speak_frame(&handle, 0).await;
    tokio::time::sleep(ms(1_000)).await;

    let metrics = registry.session_metrics("reg-1").unwrap();
    assert_eq!(metrics.turn_count, 1);
    assert!(metrics.average_end_to_end_ms.is_some());
    assert!(metrics.cost.total > 0.0);

    let aggregate = registry.aggregate();
    assert_eq!(aggregate.active_sessions, 1);
    assert_eq!(aggregate.total_sessions_created, 1);
    assert_eq!(aggregate.total_turns, 1);
    assert_eq!(aggregate.completed_turns, 1);
    assert!(aggregate.target_met);

    registry.terminate("reg-1").await.unwrap();
    assert_eq!(registry.len(), 0);
    assert_eq!(handle.shared().lifecycle(), Lifecycle::Ended);

    // terminating again is NotFound
    assert!(registry.terminate("reg-1").await.is_err());
}
