//! Turn state machine
//!
//! One Turn covers a single user-utterance-to-agent-response cycle:
//! `Listening -> Transcribing -> Thinking -> Speaking -> Completed`, with
//! `Cancelled` reachable from any non-terminal state. A session has at most
//! one non-terminal turn at any time; the next turn may only begin once the
//! previous one has reached a terminal state.

use serde::Serialize;
use thiserror::Error;

/// Per-session turn counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TurnId(pub u64);

impl std::fmt::Display for TurnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Turn lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    /// Voice activity detected, audio is flowing to STT, no transcript yet
    Listening,
    /// At least one STT partial has arrived
    Transcribing,
    /// Final transcript handed to the LLM, tokens streaming in
    Thinking,
    /// At least one sentence handed to TTS, audio streaming out
    Speaking,
    /// TTS finished with no LLM output pending (terminal)
    Completed,
    /// Barge-in, provider failure, or session end (terminal)
    Cancelled,
}

impl TurnState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnState::Completed | TurnState::Cancelled)
    }

    /// Check if a transition to `next` is legal
    ///
    /// `Listening -> Thinking` covers STT streams that emit a final with no
    /// prior partial; `Thinking -> Completed` covers LLM completions with
    /// nothing left to synthesize.
    pub fn can_transition_to(&self, next: TurnState) -> bool {
        use TurnState::*;
        matches!(
            (self, next),
            (Listening, Transcribing)
                | (Listening, Thinking)
                | (Transcribing, Thinking)
                | (Thinking, Speaking)
                | (Thinking, Completed)
                | (Speaking, Completed)
        ) || (!self.is_terminal() && next == Cancelled)
    }
}

impl std::fmt::Display for TurnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TurnState::Listening => "listening",
            TurnState::Transcribing => "transcribing",
            TurnState::Thinking => "thinking",
            TurnState::Speaking => "speaking",
            TurnState::Completed => "completed",
            TurnState::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

/// Rejected turn mutations
///
/// These are expected under network jitter (late or duplicate provider
/// events) and are logged and dropped, never surfaced to callers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    #[error("turn {turn_id} cannot transition from {from} to {to}")]
    InvalidTransition {
        turn_id: TurnId,
        from: TurnState,
        to: TurnState,
    },
}

/// One request/response cycle within a session
#[derive(Debug)]
pub struct Turn {
    id: TurnId,
    state: TurnState,
    transcript: String,
    response: String,
    cancelled: bool,
}

impl Turn {
    pub fn new(id: TurnId) -> Self {
        Self {
            id,
            state: TurnState::Listening,
            transcript: String::new(),
            response: String::new(),
            cancelled: false,
        }
    }

    pub fn id(&self) -> TurnId {
        self.id
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    pub fn response(&self) -> &str {
        &self.response
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether provider events may still mutate this turn
    pub fn accepts_events(&self) -> bool {
        !self.cancelled && !self.state.is_terminal()
    }

    /// Apply a state transition, rejecting illegal edges
    pub fn transition(&mut self, next: TurnState) -> Result<(), StateError> {
        if !self.state.can_transition_to(next) {
            return Err(StateError::InvalidTransition {
                turn_id: self.id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Cancel the turn; idempotent, no-op once terminal
    pub fn cancel(&mut self) {
        if !self.state.is_terminal() {
            self.state = TurnState::Cancelled;
            self.cancelled = true;
        }
    }

    /// Append an incremental STT fragment
    pub fn append_transcript(&mut self, text: &str) {
        self.transcript.push_str(text);
    }

    /// Replace the accumulated transcript with the authoritative final
    pub fn set_final_transcript(&mut self, text: impl Into<String>) {
        self.transcript = text.into();
    }

    /// Append a streamed LLM token
    pub fn append_response(&mut self, text: &str) {
        self.response.push_str(text);
    }

    /// Discard buffered response text ahead of an LLM regeneration
    pub fn clear_response(&mut self) {
        self.response.clear();
    }
}
