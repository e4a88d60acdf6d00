//! Cost tracking per turn
//!
//! Accumulates raw usage counters (STT seconds, LLM tokens, TTS characters)
//! and converts them to an estimated dollar cost with the configured rate
//! table when the turn terminates. Accumulation is additive, so recording
//! order never changes the finalized record. Zero or missing rates yield
//! zero cost; metrics stay available even with incomplete pricing config.

use std::collections::HashMap;
use serde::Serialize;

use voicebridge_core::{Error, Result};
use voicebridge_config::RateTable;

use crate::turn::TurnId;

/// Cost breakdown for one finalized turn
#[derive(Debug, Clone, Serialize)]
pub struct CostRecord {
    pub turn_id: TurnId,
    pub stt_seconds: f64,
    pub llm_input_tokens: u64,
    pub llm_output_tokens: u64,
    pub tts_characters: u64,
    pub stt_cost: f64,
    pub llm_cost: f64,
    pub tts_cost: f64,
    pub estimated_cost_usd: f64,
}

/// Running usage counters for one in-flight turn
#[derive(Debug, Default, Clone, Copy)]
struct Usage {
    stt_seconds: f64,
    llm_input_tokens: u64,
    llm_output_tokens: u64,
    tts_characters: u64,
}

/// Accumulates usage per turn and prices it on finalize
#[derive(Debug)]
pub struct CostTracker {
    rates: RateTable,
    turns: HashMap<TurnId, Usage>,
}

impl CostTracker {
    pub fn new(rates: RateTable) -> Self {
        Self {
            rates,
            turns: HashMap::new(),
        }
    }

    /// Start tracking a turn so finalize succeeds even with no usage
    pub fn begin(&mut self, turn_id: TurnId) {
        self.turns.entry(turn_id).or_default();
    }

    pub fn record_stt(&mut self, turn_id: TurnId, seconds: f64) {
        self.turns.entry(turn_id).or_default().stt_seconds += seconds;
    }

    pub fn record_llm(&mut self, turn_id: TurnId, input_tokens: u64, output_tokens: u64) {
        let usage = self.turns.entry(turn_id).or_default();
        usage.llm_input_tokens += input_tokens;
        usage.llm_output_tokens += output_tokens;
    }

    pub fn record_tts(&mut self, turn_id: TurnId, characters: u64) {
        self.turns.entry(turn_id).or_default().tts_characters += characters;
    }

    /// Apply the rate table, return the record, evict working counters
    ///
    /// Fails with `NotFound` for an unknown or already-finalized turn.
    pub fn finalize(&mut self, turn_id: TurnId) -> Result<CostRecord> {
        let usage = self
            .turns
            .remove(&turn_id)
            .ok_or_else(|| Error::not_found("turn", turn_id.to_string()))?;

        let stt_cost = usage.stt_seconds / 3_600.0 * self.rates.stt_rate_per_hour;
        let llm_cost = usage.llm_input_tokens as f64 / 1_000_000.0
            * self.rates.llm_rate_per_million_input_tokens
            + usage.llm_output_tokens as f64 / 1_000_000.0
                * self.rates.llm_rate_per_million_output_tokens;
        let tts_cost = usage.tts_characters as f64 * self.rates.tts_rate_per_char;

        Ok(CostRecord {
            turn_id,
            stt_seconds: usage.stt_seconds,
            llm_input_tokens: usage.llm_input_tokens,
            llm_output_tokens: usage.llm_output_tokens,
            tts_characters: usage.tts_characters,
            stt_cost,
            llm_cost,
            tts_cost,
            estimated_cost_usd: stt_cost + llm_cost + tts_cost,
        })
    }
}
