//! Core traits and types for the voice bridge
//!
//! This crate provides foundational types used across all other crates:
//! - Capability traits for the streaming providers (STT, LLM, TTS)
//! - Audio frame and format types crossing the media boundary
//! - Conversation history types
//! - LLM request types
//! - Error taxonomy

pub mod audio;
pub mod conversation;
pub mod error;
pub mod llm;
pub mod provider;

// Re-exports
pub use audio::{AudioChunk, AudioEncoding, AudioFormat, AudioFrame};
pub use conversation::{Conversation, SpeakerRole, Utterance};
pub use error::{Error, ProviderError, ProviderResult, Result};
pub use llm::{ChatMessage, ChatRole, GenerateRequest};
pub use provider::{
    EventStream, LanguageModel, LlmEvent, MediaSink, ProviderLane, SpeechToText, SttEvent,
    SttStream, TerminationReason, TextToSpeech, TtsEvent,
};
