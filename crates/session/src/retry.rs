//! Bounded retry with exponential backoff
//!
//! Each provider-call failure is turned into an explicit decision value
//! rather than control flow: either wait and retry the single failing
//! sub-stream, or give up and let the orchestrator cancel the turn.

use std::time::Duration;

use voicebridge_core::ProviderError;
use voicebridge_config::BackoffConfig;

/// Outcome of classifying one failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Retry the sub-stream after `delay`
    Retry { delay: Duration },
    /// Fatal error or attempts exhausted; cancel the turn
    GiveUp,
}

/// Exponential backoff policy
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base_delay: Duration,
    multiplier: f64,
    max_attempts: u32,
}

impl BackoffPolicy {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            base_delay: config.base_delay(),
            multiplier: config.multiplier,
            max_attempts: config.max_attempts,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide what to do after a failure, given how many retries this lane
    /// has already consumed for the current incident
    pub fn decide(&self, error: &ProviderError, attempts_so_far: u32) -> RetryDecision {
        if error.is_fatal() || attempts_so_far >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        let factor = self.multiplier.powi(attempts_so_far as i32);
        RetryDecision::Retry {
            delay: self.base_delay.mul_f64(factor),
        }
    }
}
