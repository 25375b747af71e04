//! Configuration management
//!
//! This module handles loading, validation, and management of the Envoy configuration.
//! Configuration is stored in TOML format at ~/.envoy/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level, data directory
//! - **llm**: OpenAI-compatible endpoint, model and sampling temperatures
//! - **graph**: Iteration cap and the degraded answers used on fallback
//! - **memory**: History bound, TTL, sweep interval, summarizer kind
//! - **persistence**: How many durable turns seed a conversation's memory
//! - **server**: HTTP bind address
//!
//! Every section is optional in the file; missing keys take their defaults.
//!
//! # Examples
//!
//! ```no_run
//! use envoy_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! println!("Model: {}", config.llm.model);
//! println!("Iteration cap: {}", config.graph.max_iterations);
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Core settings
    #[serde(default)]
    pub core: CoreConfig,

    /// LLM endpoint configuration
    #[serde(default)]
    pub llm: LLMConfig,

    /// Classify/dispatch loop settings
    #[serde(default)]
    pub graph: GraphConfig,

    /// Conversation memory settings
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Durable history settings
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,
}

/// Core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

/// LLM configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    /// Base URL of the OpenAI-compatible API
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    /// Model name
    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Environment variable holding the API key
    // The key itself never lives in the config file.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Sampling temperature for routing decisions
    #[serde(default = "default_classifier_temperature")]
    pub classifier_temperature: f32,

    /// Sampling temperature for specialist answers
    #[serde(default = "default_handler_temperature")]
    pub handler_temperature: f32,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key_env: default_api_key_env(),
            classifier_temperature: default_classifier_temperature(),
            handler_temperature: default_handler_temperature(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Graph engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Maximum classify calls per turn
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Answer used when the router reply cannot be understood
    #[serde(default = "default_fallback_message")]
    pub fallback_message: String,

    /// Answer used when the iteration cap is reached
    #[serde(default = "default_exhausted_message")]
    pub exhausted_message: String,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            fallback_message: default_fallback_message(),
            exhausted_message: default_exhausted_message(),
        }
    }
}

/// Summarizer implementation used by the memory store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummarizerKind {
    /// Compact rolling transcript, no model calls
    Transcript,
    /// Progressive summary written by the model
    Llm,
}

/// Memory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Maximum turns retained per conversation
    #[serde(default = "default_max_history")]
    pub max_history: usize,

    /// Idle seconds before a conversation is evicted
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Seconds between eviction sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_summarizer")]
    pub summarizer: SummarizerKind,

    /// Upper bound on the transcript summary length
    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_history: default_max_history(),
            ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval(),
            summarizer: default_summarizer(),
            summary_max_chars: default_summary_max_chars(),
        }
    }
}

/// Durable history configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Durable turns read to seed memory at the start of a turn
    #[serde(default = "default_history_limit")]
    pub history_limit: u32,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.envoy")
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_classifier_temperature() -> f32 {
    0.1
}

fn default_handler_temperature() -> f32 {
    0.3
}

fn default_request_timeout() -> u64 {
    120
}

fn default_max_iterations() -> usize {
    8
}

fn default_fallback_message() -> String {
    "I'm sorry, I couldn't work out how to help with that. Could you rephrase your question?"
        .to_string()
}

fn default_exhausted_message() -> String {
    "I'm sorry, I was unable to complete that request. Please try breaking it into smaller questions."
        .to_string()
}

fn default_max_history() -> usize {
    10
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_summarizer() -> SummarizerKind {
    SummarizerKind::Transcript
}

fn default_summary_max_chars() -> usize {
    2000
}

fn default_history_limit() -> u32 {
    10
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Config {
    /// Load configuration from the default location (~/.envoy/config.toml)
    ///
    /// If the configuration file doesn't exist, writes a default one first.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or written, TOML parsing
    /// fails, or validation fails.
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;
        Self::load_or_create_at(&config_path)
    }

    /// Same as [`Config::load_or_create`] for an explicit path
    pub fn load_or_create_at(path: &Path) -> Result<Self, EngineError> {
        if path.exists() {
            Self::load_from_path(path)
        } else {
            Self::create_default(path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration text
    pub fn from_toml_str(contents: &str) -> Result<Self, EngineError> {
        let mut config: Config = toml::from_str(contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        // Written before processing so the file keeps the portable ~ path
        let config = Self::default();
        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        let mut config = config;
        config.validate_and_process()?;

        Ok(config)
    }

    fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".envoy").join("config.toml"))
    }

    /// Path of the SQLite database inside the data directory
    pub fn database_path(&self) -> PathBuf {
        self.core.data_dir.join("envoy.db")
    }

    pub fn memory_ttl(&self) -> Duration {
        Duration::from_secs(self.memory.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.memory.sweep_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.request_timeout_secs)
    }

    /// Validate values, expand `~` and create the data directory.
    fn validate_and_process(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        if self.llm.model.trim().is_empty() {
            return Err(EngineError::Config("llm.model must not be empty".to_string()));
        }

        for (name, value) in [
            ("classifier_temperature", self.llm.classifier_temperature),
            ("handler_temperature", self.llm.handler_temperature),
        ] {
            if !(0.0..=2.0).contains(&value) {
                return Err(EngineError::Config(format!(
                    "{} must be between 0.0 and 2.0",
                    name
                )));
            }
        }

        if self.graph.max_iterations == 0 {
            return Err(EngineError::Config(
                "graph.max_iterations must be at least 1".to_string(),
            ));
        }

        if self.memory.max_history == 0 {
            return Err(EngineError::Config(
                "memory.max_history must be at least 1".to_string(),
            ));
        }

        if self.memory.ttl_secs == 0 {
            return Err(EngineError::Config(
                "memory.ttl_secs must be at least 1".to_string(),
            ));
        }

        if self.memory.sweep_interval_secs == 0 {
            return Err(EngineError::Config(
                "memory.sweep_interval_secs must be at least 1".to_string(),
            ));
        }

        self.core.data_dir = expand_path(&self.core.data_dir)?;

        if !self.core.data_dir.exists() {
            fs::create_dir_all(&self.core.data_dir).map_err(|e| {
                EngineError::Config(format!("Failed to create data directory: {}", e))
            })?;
        }

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}
