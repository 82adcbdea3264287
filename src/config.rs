//! Host configuration.
//!
//! Loaded from a TOML file, then overridden by `DOC_ORCH_*` environment
//! variables; the binary layers its CLI flags on top.
//!
//! # Example Configuration File
//!
//! ```toml
//! data_dir = "./data"
//! request_timeout_ms = 300000
//! max_attempts = 5
//!
//! [context]
//! command = "doc-worker"
//! args = ["--stdio"]
//! justification = "Parse documents and persist derived artifacts"
//! reasons = ["DOM_PARSER", "LOCAL_STORAGE"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_CONTEXT_JUSTIFICATION, DEFAULT_CONTEXT_REASONS, DEFAULT_REQUEST_TIMEOUT_MS,
};
use crate::delegation::ContextSpec;
use crate::error::ConfigError;
use crate::orchestrator::OrchestratorConfig;

/// Environment variable overriding [`HostConfig::data_dir`].
pub const DATA_DIR_ENV: &str = "DOC_ORCH_DATA_DIR";
/// Environment variable overriding [`HostConfig::request_timeout_ms`].
pub const REQUEST_TIMEOUT_ENV: &str = "DOC_ORCH_REQUEST_TIMEOUT_MS";
/// Environment variable overriding [`HostConfig::max_attempts`].
pub const MAX_ATTEMPTS_ENV: &str = "DOC_ORCH_MAX_ATTEMPTS";
/// Environment variable overriding [`ContextConfig::command`].
pub const CONTEXT_COMMAND_ENV: &str = "DOC_ORCH_CONTEXT_COMMAND";

/// Top-level host configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Directory holding the persisted task collections.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Bound on one round trip to the execution context, in milliseconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Delegation attempts per task before the recovery sweep fails it.
    /// Absent means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    /// How to start the execution context.
    #[serde(default)]
    pub context: ContextConfig,
}

/// Execution context process settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Program to spawn.
    #[serde(default)]
    pub command: String,

    /// Arguments passed to the program.
    #[serde(default)]
    pub args: Vec<String>,

    /// Justification handed to the context on creation.
    #[serde(default = "default_justification")]
    pub justification: String,

    /// Capability reasons handed to the context on creation.
    #[serde(default = "default_reasons")]
    pub reasons: Vec<String>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_justification() -> String {
    DEFAULT_CONTEXT_JUSTIFICATION.to_string()
}

fn default_reasons() -> Vec<String> {
    DEFAULT_CONTEXT_REASONS
        .iter()
        .map(|r| (*r).to_string())
        .collect()
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            justification: default_justification(),
            reasons: default_reasons(),
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            request_timeout_ms: default_request_timeout(),
            max_attempts: None,
            context: ContextConfig::default(),
        }
    }
}

impl ContextConfig {
    /// What the execution context is told when it is created.
    pub fn spec(&self) -> ContextSpec {
        ContextSpec {
            justification: self.justification.clone(),
            reasons: self.reasons.clone(),
        }
    }
}

impl HostConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] if the file cannot be read, [`ConfigError::Parse`]
    /// if it is not valid.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Examples
    ///
    /// ```
    /// use doc_orchestrator::config::HostConfig;
    ///
    /// let config = HostConfig::from_toml("request_timeout_ms = 1000").unwrap();
    /// assert_eq!(config.request_timeout_ms, 1000);
    /// assert_eq!(config.max_attempts, None);
    /// assert_eq!(config.context.reasons, vec!["DOM_PARSER", "LOCAL_STORAGE"]);
    /// ```
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(Into::into)
    }

    /// Applies `DOC_ORCH_*` overrides from the process environment.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] if a numeric variable does not parse.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides using `lookup` in place of the process environment.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] if a numeric variable does not parse.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(DATA_DIR_ENV) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup(REQUEST_TIMEOUT_ENV) {
            self.request_timeout_ms = parse_number(REQUEST_TIMEOUT_ENV, &raw)?;
        }
        if let Some(raw) = lookup(MAX_ATTEMPTS_ENV) {
            self.max_attempts = Some(parse_number(MAX_ATTEMPTS_ENV, &raw)?);
        }
        if let Some(command) = lookup(CONTEXT_COMMAND_ENV) {
            self.context.command = command;
        }
        Ok(())
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout_ms == 0 {
            return Err(invalid("request_timeout_ms", "must be greater than zero"));
        }
        if self.max_attempts == Some(0) {
            return Err(invalid("max_attempts", "must be at least 1 when set"));
        }
        Ok(())
    }

    /// Like [`validate`](Self::validate), and additionally requires a
    /// context command, which serving needs.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the first offending key.
    pub fn validate_for_serve(&self) -> Result<(), ConfigError> {
        self.validate()?;
        if self.context.command.trim().is_empty() {
            return Err(invalid("context.command", "required to serve"));
        }
        Ok(())
    }

    /// The request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Orchestrator tunables derived from this configuration.
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_attempts: self.max_attempts,
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| invalid(key, &format!("{raw:?}: {e}")))
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        message: message.to_string(),
    }
}
