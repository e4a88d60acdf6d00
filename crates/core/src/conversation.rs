//! Conversation history types
//!
//! A session keeps an ordered transcript of who said what. The history is
//! replayed into every LLM request so the model sees the full exchange.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::{ChatMessage, ChatRole};

/// Who produced an utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeakerRole {
    User,
    Assistant,
}

impl SpeakerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpeakerRole::User => "user",
            SpeakerRole::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for SpeakerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single utterance in the conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Utterance {
    pub role: SpeakerRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Utterance {
    pub fn new(role: SpeakerRole, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(SpeakerRole::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(SpeakerRole::Assistant, text)
    }

    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

/// Ordered conversation history for one session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conversation {
    utterances: Vec<Utterance>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.utterances.push(Utterance::user(text));
    }

    pub fn push_assistant(&mut self, text: impl Into<String>) {
        self.utterances.push(Utterance::assistant(text));
    }

    pub fn utterances(&self) -> &[Utterance] {
        &self.utterances
    }

    /// Number of user/assistant exchanges recorded so far
    pub fn turn_count(&self) -> usize {
        self.utterances
            .iter()
            .filter(|u| u.role == SpeakerRole::User)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.utterances.is_empty()
    }

    /// Render the history as chat messages for an LLM request
    pub fn to_messages(&self) -> Vec<ChatMessage> {
        self.utterances
            .iter()
            .map(|u| match u.role {
                SpeakerRole::User => ChatMessage::new(ChatRole::User, &u.text),
                SpeakerRole::Assistant => ChatMessage::new(ChatRole::Assistant, &u.text),
            })
            .collect()
    }
}
