//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::ConfigError;

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Turn orchestration configuration
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Provider rate table for cost estimation
    #[serde(default)]
    pub rates: RateTable,

    /// Session registry configuration
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Enforce the configured CORS origins (disable only for development)
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

/// Turn orchestration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Forced endpoint after this long without a new STT partial while
    /// transcribing
    #[serde(default = "default_silence_timeout_ms")]
    pub silence_timeout_ms: u64,

    /// Per-lane inactivity timeout; expiry is treated as a transient
    /// provider timeout and enters the retry path
    #[serde(default = "default_stage_timeout_ms")]
    pub stage_timeout_ms: u64,

    /// Retry backoff for transient provider errors
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Sentence boundary heuristic for streaming LLM output
    #[serde(default)]
    pub sentence: SentenceConfig,

    /// System prompt for the LLM
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Spoken notice when a turn dies on a provider failure
    #[serde(default = "default_apology_text")]
    pub apology_text: String,

    /// Negotiated STT audio sample rate
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Negotiated STT channel count
    #[serde(default = "default_channels")]
    pub channels: u8,

    /// Session event queue depth
    #[serde(default = "default_event_queue_depth")]
    pub event_queue_depth: usize,

    /// Words-per-minute estimate used to bill audio seconds when the
    /// silence timeout forces an endpoint without a provider-final event
    #[serde(default = "default_speech_rate_wpm")]
    pub speech_rate_wpm: u32,
}

fn default_silence_timeout_ms() -> u64 {
    1_200
}

fn default_stage_timeout_ms() -> u64 {
    5_000
}

fn default_system_prompt() -> String {
    "You are a helpful, friendly voice assistant. Keep responses concise and \
     conversational since they will be spoken aloud."
        .to_string()
}

fn default_apology_text() -> String {
    "Sorry, I'm having trouble hearing you right now. Please try again in a moment.".to_string()
}

fn default_sample_rate() -> u32 {
    16_000
}

fn default_channels() -> u8 {
    1
}

fn default_event_queue_depth() -> usize {
    256
}

fn default_speech_rate_wpm() -> u32 {
    150
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            silence_timeout_ms: default_silence_timeout_ms(),
            stage_timeout_ms: default_stage_timeout_ms(),
            backoff: BackoffConfig::default(),
            sentence: SentenceConfig::default(),
            system_prompt: default_system_prompt(),
            apology_text: default_apology_text(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            event_queue_depth: default_event_queue_depth(),
            speech_rate_wpm: default_speech_rate_wpm(),
        }
    }
}

impl OrchestratorConfig {
    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }
}

/// Exponential backoff for transient provider errors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_base_delay_ms() -> u64 {
    250
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl BackoffConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

/// Sentence boundary heuristic for flushing LLM output to TTS
///
/// This is a tunable policy, not a fixed algorithm; the guarantees are
/// that fragments are never empty and concatenate back to the full
/// response text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentenceConfig {
    /// Characters that end a sentence
    #[serde(default = "default_terminators")]
    pub terminators: String,
    /// Minimum non-whitespace characters before a terminator counts
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
    /// Force a flush at a word boundary past this buffer size
    #[serde(default = "default_max_buffer_chars")]
    pub max_buffer_chars: usize,
}

fn default_terminators() -> String {
    ".!?".to_string()
}

fn default_min_chars() -> usize {
    12
}

fn default_max_buffer_chars() -> usize {
    240
}

impl Default for SentenceConfig {
    fn default() -> Self {
        Self {
            terminators: default_terminators(),
            min_chars: default_min_chars(),
            max_buffer_chars: default_max_buffer_chars(),
        }
    }
}

/// Provider rate table, USD
///
/// Defaults follow the stack the bridge was built against: Soniox STT at
/// ~$0.12/hour, Groq llama-3.3-70b-versatile at $0.59/$0.79 per million
/// tokens, ElevenLabs at $0.24 per thousand characters. Zero rates are
/// valid and simply yield zero cost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateTable {
    #[serde(default = "default_stt_rate_per_hour")]
    pub stt_rate_per_hour: f64,
    #[serde(default = "default_llm_input_rate")]
    pub llm_rate_per_million_input_tokens: f64,
    #[serde(default = "default_llm_output_rate")]
    pub llm_rate_per_million_output_tokens: f64,
    #[serde(default = "default_tts_rate_per_char")]
    pub tts_rate_per_char: f64,
}

fn default_stt_rate_per_hour() -> f64 {
    0.12
}

fn default_llm_input_rate() -> f64 {
    0.59
}

fn default_llm_output_rate() -> f64 {
    0.79
}

fn default_tts_rate_per_char() -> f64 {
    0.000_24
}

impl Default for RateTable {
    fn default() -> Self {
        Self {
            stt_rate_per_hour: default_stt_rate_per_hour(),
            llm_rate_per_million_input_tokens: default_llm_input_rate(),
            llm_rate_per_million_output_tokens: default_llm_output_rate(),
            tts_rate_per_char: default_tts_rate_per_char(),
        }
    }
}

impl RateTable {
    /// A table with all rates zeroed, for deployments without pricing data
    pub fn zero() -> Self {
        Self {
            stt_rate_per_hour: 0.0,
            llm_rate_per_million_input_tokens: 0.0,
            llm_rate_per_million_output_tokens: 0.0,
            tts_rate_per_char: 0.0,
        }
    }
}

/// Session registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Idle sessions are evicted past this timeout
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// End-to-end latency target reported by the metrics surface
    #[serde(default = "default_target_latency_ms")]
    pub target_latency_ms: u64,
}

fn default_max_sessions() -> usize {
    256
}

fn default_session_timeout_secs() -> u64 {
    3_600
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

fn default_target_latency_ms() -> u64 {
    2_000
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            session_timeout_secs: default_session_timeout_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            target_latency_ms: default_target_latency_ms(),
        }
    }
}

impl RegistryConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable output
    #[serde(default)]
    pub log_json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

impl Settings {
    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.orchestrator.backoff.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "orchestrator.backoff.multiplier".into(),
                message: "must be >= 1.0".into(),
            });
        }
        if self.orchestrator.backoff.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "orchestrator.backoff.max_attempts".into(),
                message: "must be >= 1".into(),
            });
        }
        if self.orchestrator.sentence.max_buffer_chars <= self.orchestrator.sentence.min_chars {
            return Err(ConfigError::InvalidValue {
                field: "orchestrator.sentence.max_buffer_chars".into(),
                message: "must exceed sentence.min_chars".into(),
            });
        }
        if self.orchestrator.speech_rate_wpm == 0 {
            return Err(ConfigError::InvalidValue {
                field: "orchestrator.speech_rate_wpm".into(),
                message: "must be >= 1".into(),
            });
        }
        Ok(())
    }
}

/// Load settings from an optional TOML file plus environment overrides
///
/// Priority: env vars (`VOICEBRIDGE__SECTION__KEY`) > file > defaults.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    match path {
        Some(path) => {
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path.display().to_string()));
            }
            builder = builder.add_source(File::from(path));
        }
        None => {
            builder = builder.add_source(File::with_name("config/default").required(false));
        }
    }

    builder = builder.add_source(Environment::with_prefix("VOICEBRIDGE").separator("__"));

    let settings: Settings = builder.build()?.try_deserialize()?;
    settings.validate()?;
    Ok(settings)
}
