//! Latency tracking for pipeline stage boundaries
//!
//! Records a monotonic timestamp per stage per turn and folds them into an
//! immutable `LatencyRecord` when the turn terminates. Timestamps come from
//! `tokio::time::Instant` so paused-clock tests are fully deterministic.
//!
//! The tracker is owned by the session worker (single writer); readers only
//! ever see finalized records.

use std::collections::{BTreeMap, HashMap};
use serde::Serialize;
use tokio::time::Instant;

use voicebridge_core::{Error, Result};

use crate::turn::TurnId;

/// Pipeline stage boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    SttFirstPartial,
    SttFinal,
    LlmFirstToken,
    LlmComplete,
    TtsFirstAudio,
    TtsComplete,
}

impl Stage {
    /// First-only stages keep their first mark; later marks are no-ops.
    /// The rest overwrite, so streaming updates leave the last boundary.
    pub fn is_first_only(&self) -> bool {
        matches!(
            self,
            Stage::SttFirstPartial | Stage::LlmFirstToken | Stage::TtsFirstAudio
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::SttFirstPartial => "stt_first_partial",
            Stage::SttFinal => "stt_final",
            Stage::LlmFirstToken => "llm_first_token",
            Stage::LlmComplete => "llm_complete",
            Stage::TtsFirstAudio => "tts_first_audio",
            Stage::TtsComplete => "tts_complete",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Latency breakdown for one finalized turn
///
/// Stage values are offsets in milliseconds from the turn's earliest mark;
/// `end_to_end_ms` spans the earliest to the latest mark.
#[derive(Debug, Clone, Serialize)]
pub struct LatencyRecord {
    pub turn_id: TurnId,
    pub stages: BTreeMap<Stage, u64>,
    pub end_to_end_ms: u64,
}

impl LatencyRecord {
    pub fn offset_ms(&self, stage: Stage) -> Option<u64> {
        self.stages.get(&stage).copied()
    }

    /// Transcription lane duration (first partial to final)
    pub fn stt_ms(&self) -> Option<u64> {
        Some(self.offset_ms(Stage::SttFinal)? - self.offset_ms(Stage::SttFirstPartial)?)
    }

    /// Generation lane duration (first token to completion)
    pub fn llm_ms(&self) -> Option<u64> {
        Some(self.offset_ms(Stage::LlmComplete)? - self.offset_ms(Stage::LlmFirstToken)?)
    }

    /// Synthesis lane duration (first audio to completion)
    pub fn tts_ms(&self) -> Option<u64> {
        Some(self.offset_ms(Stage::TtsComplete)?.saturating_sub(self.offset_ms(Stage::TtsFirstAudio)?))
    }

    /// Time from the first mark until the caller heard anything
    pub fn time_to_first_audio_ms(&self) -> Option<u64> {
        self.offset_ms(Stage::TtsFirstAudio)
    }
}

/// Records stage timestamps per in-flight turn
#[derive(Debug, Default)]
pub struct LatencyTracker {
    turns: HashMap<TurnId, BTreeMap<Stage, Instant>>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a turn so that finalize succeeds even if the turn
    /// dies before any stage mark lands
    pub fn begin(&mut self, turn_id: TurnId) {
        self.turns.entry(turn_id).or_default();
    }

    /// Record a stage timestamp; first-only stages ignore repeats,
    /// the rest overwrite (last write wins). Never blocks.
    pub fn mark(&mut self, turn_id: TurnId, stage: Stage) {
        let marks = self.turns.entry(turn_id).or_default();
        if stage.is_first_only() && marks.contains_key(&stage) {
            return;
        }
        marks.insert(stage, Instant::now());
    }

    /// Whether the turn still has working timestamps
    pub fn is_tracking(&self, turn_id: TurnId) -> bool {
        self.turns.contains_key(&turn_id)
    }

    /// Fold the working timestamps into a record and evict them
    ///
    /// Fails with `NotFound` for an unknown or already-finalized turn.
    pub fn finalize(&mut self, turn_id: TurnId) -> Result<LatencyRecord> {
        let marks = self
            .turns
            .remove(&turn_id)
            .ok_or_else(|| Error::not_found("turn", turn_id.to_string()))?;

        let (first, last) = match (marks.values().min(), marks.values().max()) {
            (Some(first), Some(last)) => (*first, *last),
            // a turn cancelled before any stage fired
            _ => {
                return Ok(LatencyRecord {
                    turn_id,
                    stages: BTreeMap::new(),
                    end_to_end_ms: 0,
                })
            }
        };

        let stages = marks
            .into_iter()
            .map(|(stage, at)| (stage, (at - first).as_millis() as u64))
            .collect();

        Ok(LatencyRecord {
            turn_id,
            stages,
            end_to_end_ms: (last - first).as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn test_offsets_and_end_to_end() {
        let mut tracker = LatencyTracker::new();
        let id = TurnId(0);
        tracker.begin(id);

        advance(Duration::from_millis(100)).await;
        tracker.mark(id, Stage::SttFirstPartial);
        advance(Duration::from_millis(800)).await;
        tracker.mark(id, Stage::SttFinal);
        advance(Duration::from_millis(180)).await;
        tracker.mark(id, Stage::LlmFirstToken);
        advance(Duration::from_millis(470)).await;
        tracker.mark(id, Stage::TtsFirstAudio);
        advance(Duration::from_millis(50)).await;
        tracker.mark(id, Stage::LlmComplete);
        advance(Duration::from_millis(600)).await;
        tracker.mark(id, Stage::TtsComplete);

        let record = tracker.finalize(id).unwrap();
        assert_eq!(record.offset_ms(Stage::SttFirstPartial), Some(0));
        assert_eq!(record.offset_ms(Stage::SttFinal), Some(800));
        assert_eq!(record.offset_ms(Stage::LlmFirstToken), Some(980));
        assert_eq!(record.offset_ms(Stage::TtsFirstAudio), Some(1450));
        assert_eq!(record.offset_ms(Stage::LlmComplete), Some(1500));
        assert_eq!(record.offset_ms(Stage::TtsComplete), Some(2100));
        assert_eq!(record.end_to_end_ms, 2100);
        assert_eq!(record.stt_ms(), Some(800));
        assert_eq!(record.llm_ms(), Some(520));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_only_stage_keeps_first_mark() {
        let mut tracker = LatencyTracker::new();
        let id = TurnId(1);

        tracker.mark(id, Stage::SttFirstPartial);
        advance(Duration::from_millis(200)).await;
        tracker.mark(id, Stage::SttFirstPartial);
        advance(Duration::from_millis(300)).await;
        tracker.mark(id, Stage::SttFinal);

        let record = tracker.finalize(id).unwrap();
        assert_eq!(record.offset_ms(Stage::SttFirstPartial), Some(0));
        assert_eq!(record.offset_ms(Stage::SttFinal), Some(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replace_stage_keeps_last_mark() {
        let mut tracker = LatencyTracker::new();
        let id = TurnId(2);

        tracker.mark(id, Stage::TtsFirstAudio);
        advance(Duration::from_millis(100)).await;
        tracker.mark(id, Stage::TtsComplete);
        advance(Duration::from_millis(400)).await;
        // second sentence finished
        tracker.mark(id, Stage::TtsComplete);

        let record = tracker.finalize(id).unwrap();
        assert_eq!(record.offset_ms(Stage::TtsComplete), Some(500));
        assert_eq!(record.end_to_end_ms, 500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finalize_unknown_turn_fails() {
        let mut tracker = LatencyTracker::new();
        assert!(tracker.finalize(TurnId(9)).is_err());

        let id = TurnId(3);
        tracker.mark(id, Stage::SttFirstPartial);
        tracker.finalize(id).unwrap();
        // second finalize: working timestamps were evicted
        assert!(tracker.finalize(id).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_finalize_without_marks_yields_empty_record() {
        let mut tracker = LatencyTracker::new();
        let id = TurnId(4);
        tracker.begin(id);

        let record = tracker.finalize(id).unwrap();
        assert!(record.stages.is_empty());
        assert_eq!(record.end_to_end_ms, 0);
    }
}
