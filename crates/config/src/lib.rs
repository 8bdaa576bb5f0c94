//! Configuration loading, validation, and management for Parley.
//!
//! Loads configuration from `~/.parley/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.parley/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Completion engine connection
    #[serde(default)]
    pub engine: EngineConfig,

    /// Orchestration loop settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Token budget policy
    #[serde(default)]
    pub budget: BudgetConfig,

    /// Tool-call loop detection
    #[serde(default)]
    pub loop_guard: LoopGuardConfig,

    /// Degenerate output detection
    #[serde(default)]
    pub output_guard: OutputGuardConfig,

    /// Built-in tool settings
    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Completion engine settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Service name: openai, openrouter, ollama, vllm, llamacpp or custom
    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Overrides the context window the engine reports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window: Option<usize>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Pass tool schemas through the request's native tool field
    #[serde(default = "default_true")]
    pub native_tools: bool,
}

fn default_provider() -> String {
    "openai".into()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_request_timeout() -> u64 {
    120
}
fn default_true() -> bool {
    true
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("api_key", &redact(&self.api_key))
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("context_window", &self.context_window)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("native_tools", &self.native_tools)
            .finish()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_base_url(),
            api_key: None,
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: None,
            context_window: None,
            request_timeout_secs: default_request_timeout(),
            native_tools: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Hard cap on generations per turn
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Stream answer text as it is generated
    #[serde(default = "default_true")]
    pub stream: bool,
}

fn default_system_prompt() -> String {
    "You are Parley, a helpful assistant. Use the available tools when they help \
     answer the user, and answer directly when they do not."
        .into()
}
fn default_max_iterations() -> u32 {
    10
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            max_iterations: default_max_iterations(),
            stream: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Share of the context window held back for the response
    #[serde(default = "default_reserve_fraction")]
    pub reserve_fraction: f64,

    /// Minimum reserve in tokens
    #[serde(default = "default_floor_tokens")]
    pub floor_tokens: usize,

    /// Characters per token for the heuristic counter
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,

    /// Fixed framing cost of every message
    #[serde(default = "default_message_overhead")]
    pub message_overhead_tokens: usize,

    /// Tool results are cut to this many characters on aggressive re-truncation
    #[serde(default = "default_aggressive_tool_result_chars")]
    pub aggressive_tool_result_chars: usize,
}

fn default_reserve_fraction() -> f64 {
    0.10
}
fn default_floor_tokens() -> usize {
    200
}
fn default_chars_per_token() -> usize {
    4
}
fn default_message_overhead() -> usize {
    4
}
fn default_aggressive_tool_result_chars() -> usize {
    2000
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            reserve_fraction: default_reserve_fraction(),
            floor_tokens: default_floor_tokens(),
            chars_per_token: default_chars_per_token(),
            message_overhead_tokens: default_message_overhead(),
            aggressive_tool_result_chars: default_aggressive_tool_result_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopGuardConfig {
    #[serde(default = "default_max_consecutive")]
    pub max_consecutive_tool_calls: usize,

    #[serde(default = "default_pattern_threshold")]
    pub repetitive_pattern_threshold: usize,

    #[serde(default = "default_recent_window")]
    pub recent_tool_calls_window: usize,
}

fn default_max_consecutive() -> usize {
    5
}
fn default_pattern_threshold() -> usize {
    3
}
fn default_recent_window() -> usize {
    12
}

impl Default for LoopGuardConfig {
    fn default() -> Self {
        Self {
            max_consecutive_tool_calls: default_max_consecutive(),
            repetitive_pattern_threshold: default_pattern_threshold(),
            recent_tool_calls_window: default_recent_window(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputGuardConfig {
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,

    /// Longest tolerated run of one repeated character
    #[serde(default = "default_char_run")]
    pub char_run_threshold: usize,

    /// Share of non-whitespace characters one character may take
    #[serde(default = "default_dominant_ratio")]
    pub dominant_char_ratio: f64,

    /// How often one phrase may repeat before output counts as gibberish
    #[serde(default = "default_phrase_repeat")]
    pub phrase_repeat_threshold: usize,

    /// Phrase length in words
    #[serde(default = "default_phrase_words")]
    pub phrase_words: usize,
}

fn default_max_output_chars() -> usize {
    32_000
}
fn default_char_run() -> usize {
    64
}
fn default_dominant_ratio() -> f64 {
    0.6
}
fn default_phrase_repeat() -> usize {
    8
}
fn default_phrase_words() -> usize {
    5
}

impl Default for OutputGuardConfig {
    fn default() -> Self {
        Self {
            max_output_chars: default_max_output_chars(),
            char_run_threshold: default_char_run(),
            dominant_char_ratio: default_dominant_ratio(),
            phrase_repeat_threshold: default_phrase_repeat(),
            phrase_words: default_phrase_words(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Where `generate_file` writes
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,
}

fn default_output_dir() -> PathBuf {
    AppConfig::config_dir().join("output")
}
fn default_tool_timeout() -> u64 {
    30
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            timeout_secs: default_tool_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON log lines instead of human-readable ones
    #[serde(default)]
    pub json: bool,
}

impl AppConfig {
    /// Load configuration from the default path (~/.parley/config.toml).
    ///
    /// Also checks environment variables:
    /// - `PARLEY_API_KEY` (falls back to `OPENAI_API_KEY`)
    /// - `PARLEY_BASE_URL`
    /// - `PARLEY_MODEL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if self.engine.api_key.is_none() {
            self.engine.api_key = std::env::var("PARLEY_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        }

        if let Ok(url) = std::env::var("PARLEY_BASE_URL") {
            self.engine.base_url = url;
        }

        if let Ok(model) = std::env::var("PARLEY_MODEL") {
            self.engine.model = model;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".parley")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.engine.temperature) {
            return Err(ConfigError::ValidationError(
                "engine.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.engine.context_window == Some(0) {
            return Err(ConfigError::ValidationError(
                "engine.context_window must be > 0".into(),
            ));
        }

        if self.agent.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_iterations must be > 0".into(),
            ));
        }

        let fraction = self.budget.reserve_fraction;
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(ConfigError::ValidationError(
                "budget.reserve_fraction must be in (0, 1)".into(),
            ));
        }

        if self.budget.chars_per_token == 0 {
            return Err(ConfigError::ValidationError(
                "budget.chars_per_token must be > 0".into(),
            ));
        }

        let guard = &self.loop_guard;
        if guard.max_consecutive_tool_calls < 2 || guard.repetitive_pattern_threshold < 2 {
            return Err(ConfigError::ValidationError(
                "loop_guard thresholds must be at least 2".into(),
            ));
        }
        if guard.recent_tool_calls_window < guard.max_consecutive_tool_calls {
            return Err(ConfigError::ValidationError(
                "loop_guard.recent_tool_calls_window must cover max_consecutive_tool_calls".into(),
            ));
        }

        let output = &self.output_guard;
        if !(output.dominant_char_ratio > 0.0 && output.dominant_char_ratio <= 1.0) {
            return Err(ConfigError::ValidationError(
                "output_guard.dominant_char_ratio must be in (0, 1]".into(),
            ));
        }
        if output.phrase_words == 0 || output.char_run_threshold < 2 {
            return Err(ConfigError::ValidationError(
                "output_guard.phrase_words must be > 0 and char_run_threshold >= 2".into(),
            ));
        }

        if self.tools.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "tools.timeout_secs must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.engine.api_key.is_some()
    }

    /// Generate a default config TOML string (for the `config` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
