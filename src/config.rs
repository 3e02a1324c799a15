//! Configuration types for the pagination engine.
//!
//! All engine behaviour is controlled through [`EngineConfig`], built via its
//! [`EngineConfigBuilder`]. Keeping every knob in one struct makes it trivial
//! to share a config across tasks, log it, and diff two deployments.

use crate::error::EngineError;
use crate::pipeline::llm::GenerationParams;
use crate::pipeline::retry::{Backoff, RetryPolicy};
use crate::prompts::DEFAULT_INSTRUCTION;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Hard ceiling on pages transformed by one batch call.
pub const MAX_BATCH_PAGES: usize = 10;

/// Configuration for an [`crate::Engine`].
///
/// Built via [`EngineConfig::builder()`] or using [`EngineConfig::default()`].
///
/// # Example
/// ```rust
/// use pagewise::EngineConfig;
///
/// let config = EngineConfig::builder()
///     .model("gpt-4.1-mini")
///     .max_attempts(3)
///     .token_quota(500_000)
///     .build()
///     .unwrap();
/// assert_eq!(config.max_attempts, 3);
/// ```
#[derive(Clone)]
pub struct EngineConfig {
    /// Instruction a new session starts with. Default: [`DEFAULT_INSTRUCTION`].
    pub default_instruction: String,

    /// Pages per batch call. Clamped to `1..=10`. Default: 10.
    pub batch_limit: usize,

    /// Total attempts per transformation when the call times out or cannot
    /// connect. Default: 5. Provider errors are never retried.
    pub max_attempts: u32,

    /// Delay between attempts in milliseconds. Default: 1500.
    pub retry_delay_ms: u64,

    /// Double the delay after each retry instead of keeping it fixed. Default: false.
    pub exponential_backoff: bool,

    /// Per-request HTTP timeout in seconds. Default: 60.
    pub request_timeout_secs: u64,

    /// Chat model identifier. Default: `claude-3-5-sonnet-20241022`.
    pub model: String,

    /// Base URL of the OpenAI-compatible API. Default: `https://api.openai.com/v1`.
    pub api_base_url: String,

    /// Bearer token for the API. Never printed by `Debug`.
    pub api_key: Option<String>,

    /// Sampling temperature. Range 0.0–2.0. Default: 0.7.
    pub temperature: f32,

    /// Maximum tokens generated per page. Default: provider default.
    pub max_tokens: Option<usize>,

    /// Starting value of the shared token quota. Default: 1 000 000.
    pub token_quota: u64,

    /// Sessions untouched for this long are evicted. Default: 1800.
    pub session_idle_timeout_secs: u64,

    /// Upper bound on live sessions. Default: 256.
    pub max_sessions: usize,

    /// Largest accepted document in bytes. Default: 16 MiB.
    pub max_document_bytes: usize,

    /// Directory the filesystem sink writes to. Default: `outputs`.
    pub output_dir: PathBuf,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Run post-processing over model output. Default: true.
    pub clean_output: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_instruction: DEFAULT_INSTRUCTION.to_string(),
            batch_limit: MAX_BATCH_PAGES,
            max_attempts: RetryPolicy::DEFAULT_MAX_ATTEMPTS,
            retry_delay_ms: 1500,
            exponential_backoff: false,
            request_timeout_secs: 60,
            model: "claude-3-5-sonnet-20241022".to_string(),
            api_base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            temperature: 0.7,
            max_tokens: None,
            token_quota: 1_000_000,
            session_idle_timeout_secs: 30 * 60,
            max_sessions: 256,
            max_document_bytes: 16 * 1024 * 1024,
            output_dir: PathBuf::from("outputs"),
            download_timeout_secs: 120,
            clean_output: true,
        }
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("default_instruction", &self.default_instruction)
            .field("batch_limit", &self.batch_limit)
            .field("max_attempts", &self.max_attempts)
            .field("retry_delay_ms", &self.retry_delay_ms)
            .field("exponential_backoff", &self.exponential_backoff)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("model", &self.model)
            .field("api_base_url", &self.api_base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("token_quota", &self.token_quota)
            .field("session_idle_timeout_secs", &self.session_idle_timeout_secs)
            .field("max_sessions", &self.max_sessions)
            .field("max_document_bytes", &self.max_document_bytes)
            .field("output_dir", &self.output_dir)
            .field("download_timeout_secs", &self.download_timeout_secs)
            .field("clean_output", &self.clean_output)
            .finish()
    }
}

impl EngineConfig {
    /// Create a new builder for `EngineConfig`.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder {
            config: Self::default(),
        }
    }

    /// The retry policy described by `max_attempts`, `retry_delay_ms` and
    /// `exponential_backoff`, sleeping on the tokio timer.
    pub fn retry_policy(&self) -> RetryPolicy {
        let delay = Duration::from_millis(self.retry_delay_ms);
        let backoff = if self.exponential_backoff {
            Backoff::Exponential { base: delay }
        } else {
            Backoff::Fixed(delay)
        };
        RetryPolicy::new(self.max_attempts, backoff)
    }

    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn default_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.config.default_instruction = instruction.into();
        self
    }

    pub fn batch_limit(mut self, n: usize) -> Self {
        self.config.batch_limit = n.clamp(1, MAX_BATCH_PAGES);
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n;
        self
    }

    pub fn retry_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry_delay_ms = ms;
        self
    }

    pub fn exponential_backoff(mut self, v: bool) -> Self {
        self.config.exponential_backoff = v;
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.api_base_url = url.into();
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = Some(n);
        self
    }

    pub fn token_quota(mut self, n: u64) -> Self {
        self.config.token_quota = n;
        self
    }

    pub fn session_idle_timeout_secs(mut self, secs: u64) -> Self {
        self.config.session_idle_timeout_secs = secs;
        self
    }

    pub fn max_sessions(mut self, n: usize) -> Self {
        self.config.max_sessions = n;
        self
    }

    pub fn max_document_bytes(mut self, n: usize) -> Self {
        self.config.max_document_bytes = n;
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn clean_output(mut self, v: bool) -> Self {
        self.config.clean_output = v;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<EngineConfig, EngineError> {
        let c = &self.config;
        if c.max_attempts == 0 {
            return Err(EngineError::InvalidConfig(
                "max_attempts must be ≥ 1".into(),
            ));
        }
        if c.token_quota == 0 {
            return Err(EngineError::InvalidConfig(
                "token_quota must be ≥ 1".into(),
            ));
        }
        if c.max_sessions == 0 {
            return Err(EngineError::InvalidConfig(
                "max_sessions must be ≥ 1".into(),
            ));
        }
        if c.default_instruction.trim().is_empty() {
            return Err(EngineError::InvalidConfig(
                "default_instruction must not be empty".into(),
            ));
        }
        if !(c.api_base_url.starts_with("http://") || c.api_base_url.starts_with("https://")) {
            return Err(EngineError::InvalidConfig(format!(
                "api_base_url must be an HTTP(S) URL, got '{}'",
                c.api_base_url
            )));
        }
        Ok(self.config)
    }
}
