//! Session turn orchestration
//!
//! This crate is the core of the voice bridge:
//! - Turn state machine (Listening -> Transcribing -> Thinking -> Speaking
//!   -> Completed, Cancelled from anywhere)
//! - Session orchestrator wiring the STT/LLM/TTS streams together with
//!   barge-in cancellation and bounded provider retries
//! - Latency and cost tracking per turn
//! - Sentence splitting for streaming LLM output
//! - Process-wide session registry and metrics aggregation

pub mod cost;
pub mod latency;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod sentence;
pub mod turn;

// Turn exports
pub use turn::{StateError, Turn, TurnId, TurnState};

// Tracker exports
pub use cost::{CostRecord, CostTracker};
pub use latency::{LatencyRecord, LatencyTracker, Stage};

// Orchestrator exports
pub use orchestrator::{
    CancelReason, Lifecycle, Providers, SessionEvent, SessionHandle, SessionOrchestrator,
    SessionShared, TurnOutcome, TurnRecord,
};

// Policy exports
pub use retry::{BackoffPolicy, RetryDecision};
pub use sentence::SentenceSplitter;

// Registry exports
pub use registry::{AggregateMetrics, CostBreakdown, SessionMetrics, SessionRegistry};
