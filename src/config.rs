//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::Error;
use crate::Result;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the OpenAI-compatible API (without `/chat/completions`)
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// API key sent as a bearer token
    #[serde(default)]
    pub api_key: Option<String>,

    /// Model to use
    #[serde(default = "default_model")]
    pub model: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Additional attempts after a retryable failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay between retries, doubled on each attempt
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Completion length limit, omitted from requests when unset
    #[serde(default)]
    pub max_tokens: Option<u32>,

    /// SQLite database holding agents, conversations, messages and usage
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
}

fn default_api_base_url() -> String {
    "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string()
}

fn default_model() -> String {
    "qwen-turbo".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_temperature() -> f64 {
    0.7
}

fn default_store_path() -> PathBuf {
    config_dir().join("parley.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            api_key: None,
            model: default_model(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            temperature: default_temperature(),
            max_tokens: None,
            store_path: default_store_path(),
        }
    }
}

/// Immutable settings handed to [`crate::chat::LlmClient`] at construction.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl LlmConfig {
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: None,
            model: model.to_string(),
            timeout: Duration::from_secs(default_timeout_secs()),
            max_retries: default_max_retries(),
            retry_backoff: Duration::from_millis(default_retry_backoff_ms()),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff = backoff;
        self
    }

    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

impl Config {
    /// Validate the LLM settings and freeze them into an [`LlmConfig`].
    pub fn llm(&self) -> Result<LlmConfig> {
        Url::parse(&self.api_base_url).map_err(|e| {
            Error::Config(format!("Invalid api_base_url {:?}: {e}", self.api_base_url))
        })?;

        if self.model.trim().is_empty() {
            return Err(Error::Config("model cannot be empty".to_string()));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config("timeout_secs must be greater than zero".to_string()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(Error::Config(format!(
                "temperature must be between 0 and 2, got {}",
                self.temperature
            )));
        }

        let mut llm = LlmConfig::new(&self.api_base_url, self.model.trim())
            .with_timeout(Duration::from_secs(self.timeout_secs))
            .with_retries(self.max_retries, Duration::from_millis(self.retry_backoff_ms));
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            llm = llm.with_api_key(key);
        }
        Ok(llm)
    }

    /// Apply `PARLEY_*` overrides using the given variable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("PARLEY_API_BASE_URL") {
            self.api_base_url = v;
        }
        if let Some(v) = lookup("PARLEY_API_KEY") {
            self.api_key = Some(v);
        }
        if let Some(v) = lookup("PARLEY_MODEL") {
            self.model = v;
        }
        if let Some(v) = lookup("PARLEY_TIMEOUT") {
            self.timeout_secs = parse_var("PARLEY_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("PARLEY_MAX_RETRIES") {
            self.max_retries = parse_var("PARLEY_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("PARLEY_STORE_PATH") {
            self.store_path = PathBuf::from(v);
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{name} has an invalid value: {value:?}")))
}

/// Get the config directory path
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".parley")
}

/// Get the config file path
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Load configuration from file (defaults when absent) plus environment overrides
pub fn load() -> Result<Config> {
    let mut config = load_from(&config_path())?;
    config.apply_overrides(|name| std::env::var(name).ok())?;
    Ok(config)
}

fn load_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: Config = serde_json::from_str(&content)?;
    Ok(config)
}

/// Save configuration to file
pub fn save(config: &Config) -> Result<()> {
    let path = config_path();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, content)?;
    Ok(())
}

/// Interactive first-run setup
pub fn onboard() -> Result<()> {
    use crate::ui;
    use inquire::{Password, PasswordDisplayMode, Text};

    ui::print_header("Setup", "");
    println!("  Point Parley at any OpenAI-compatible chat-completions API.\n");

    let mut config = load_from(&config_path())?;

    config.api_base_url = Text::new("API base URL:")
        .with_default(&config.api_base_url)
        .prompt()
        .map_err(|e| Error::Config(format!("Prompt failed: {}", e)))?;

    let key = Password::new("API key (leave empty for none):")
        .with_display_mode(PasswordDisplayMode::Masked)
        .without_confirmation()
        .prompt()
        .map_err(|e| Error::Config(format!("Prompt failed: {}", e)))?;
    config.api_key = if key.is_empty() { None } else { Some(key) };

    config.model = Text::new("Model:")
        .with_default(&config.model)
        .prompt()
        .map_err(|e| Error::Config(format!("Prompt failed: {}", e)))?;

    // Reject bad values before they hit disk
    config.llm()?;

    ui::print_thinking("Saving configuration");
    save(&config)?;
    ui::print_success(&format!("Saved to {:?}", config_path()));
    Ok(())
}

/// Delete all configuration and stored conversations
pub fn reset() -> Result<()> {
    use crate::ui;
    use inquire::Confirm;

    ui::print_warning("This deletes the configuration and every stored conversation.");

    let confirmed = Confirm::new("Are you sure you want to reset Parley?")
        .with_default(false)
        .prompt()
        .map_err(|e| Error::Config(format!("Prompt failed: {}", e)))?;

    if !confirmed {
        ui::print_step("Reset cancelled.");
        return Ok(());
    }

    let dir = config_dir();
    if dir.exists() {
        ui::print_thinking(&format!("Deleting {:?}", dir));
        std::fs::remove_dir_all(dir)?;
        ui::print_success("Parley has been reset.");
    } else {
        ui::print_step("No configuration directory found.");
    }
    Ok(())
}
