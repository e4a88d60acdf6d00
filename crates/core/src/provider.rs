//! Provider capability traits
//!
//! Each external service is wrapped behind a small streaming interface.
//! Vendor SDKs live outside this workspace; implementations adapt their
//! wire protocols to these event shapes.
//!
//! Cancellation is cooperative: dropping a stream (and, for STT, its audio
//! sender) closes the underlying connection. Implementations must unblock
//! any in-flight network call when that happens rather than waiting for the
//! provider to answer.

use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;
use std::pin::Pin;
use tokio::sync::mpsc;

use crate::audio::{AudioChunk, AudioFormat, AudioFrame};
use crate::error::ProviderResult;
use crate::llm::GenerateRequest;

/// Boxed stream of provider events
pub type EventStream<T> = Pin<Box<dyn Stream<Item = ProviderResult<T>> + Send>>;

/// Which provider a sub-stream belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderLane {
    Stt,
    Llm,
    Tts,
}

impl ProviderLane {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderLane::Stt => "stt",
            ProviderLane::Llm => "llm",
            ProviderLane::Tts => "tts",
        }
    }
}

impl std::fmt::Display for ProviderLane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Events emitted by a live STT stream
#[derive(Debug, Clone)]
pub enum SttEvent {
    /// Incremental transcript fragment
    Partial { text: String },
    /// End-of-utterance transcript with the billed audio duration
    Final { text: String, audio_seconds: f64 },
}

/// Events emitted by a live LLM generation stream
#[derive(Debug, Clone)]
pub enum LlmEvent {
    /// One generated token (or token group)
    Token { text: String },
    /// Terminal event with usage counters
    Complete {
        input_tokens: u64,
        output_tokens: u64,
    },
}

/// Events emitted by a live TTS synthesis stream
#[derive(Debug, Clone)]
pub enum TtsEvent {
    /// Synthesized audio ready for playback
    Audio { chunk: AudioChunk },
    /// Terminal event with the billed character count
    Complete { characters: u64 },
}

/// A live STT connection: audio in, transcript events out
pub struct SttStream {
    /// Sink for inbound audio frames
    pub audio: mpsc::Sender<AudioFrame>,
    /// Partial and final transcript events
    pub events: EventStream<SttEvent>,
}

/// Speech-to-Text interface
#[async_trait]
pub trait SpeechToText: Send + Sync + 'static {
    /// Open a streaming recognition session
    async fn open_stream(&self, format: AudioFormat) -> ProviderResult<SttStream>;

    /// Provider name for logging
    fn provider_name(&self) -> &str;
}

/// Language Model interface
#[async_trait]
pub trait LanguageModel: Send + Sync + 'static {
    /// Stream a completion for the given request
    ///
    /// The stream yields `Token` events followed by exactly one `Complete`
    /// event on success. Dropping the stream cancels generation.
    async fn generate(&self, request: GenerateRequest) -> ProviderResult<EventStream<LlmEvent>>;

    /// Model name for logging
    fn model_name(&self) -> &str;
}

/// Text-to-Speech interface
#[async_trait]
pub trait TextToSpeech: Send + Sync + 'static {
    /// Stream synthesis of one text fragment
    ///
    /// The stream yields `Audio` events followed by exactly one `Complete`
    /// event on success. Dropping the stream cancels synthesis.
    async fn synthesize(&self, text: &str) -> ProviderResult<EventStream<TtsEvent>>;

    /// Voice name for logging
    fn voice_name(&self) -> &str;
}

/// Why the call is being terminated by the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Unrecoverable provider failure with no way to apologize aloud
    ProviderFailure,
    /// Orderly session teardown
    SessionEnded,
}

/// Outbound side of the media boundary
#[async_trait]
pub trait MediaSink: Send + Sync + 'static {
    /// Forward a synthesized audio chunk to the caller
    async fn play(&self, chunk: AudioChunk);

    /// Signal the transport to end the call without audio
    async fn terminate(&self, reason: TerminationReason);
}
