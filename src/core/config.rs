//! Engine configuration: YAML file, environment overrides, validation.
//!
//! Constructed once at startup and handed to the delivery handler, build state
//! store and fleet executor by value.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Retries allowed after the first failed attempt
    #[serde(default = "default_max_message_retries")]
    pub max_message_retries: u8,

    /// Commands allowed mid-dispatch at once
    #[serde(default = "default_queue_max_concurrency")]
    pub queue_max_concurrency: usize,

    #[serde(default = "default_command_queue")]
    pub command_queue_name: String,

    #[serde(default = "default_completion_queue")]
    pub completion_queue_name: String,

    #[serde(default = "default_error_queue")]
    pub error_queue_name: String,

    #[serde(default = "default_status_queue")]
    pub status_queue_name: String,

    /// Dead-letter failed commands onto the error queue
    #[serde(default = "default_true")]
    pub enable_error_collection: bool,

    /// Backoff unit; attempt `n` is redelivered after `n` units
    #[serde(default = "default_retry_delay_millis")]
    pub retry_delay_millis: u64,

    /// Fixed delay before re-checking unresolved dependencies
    #[serde(default = "default_dependency_wait_millis")]
    pub dependency_wait_millis: u64,

    /// Terminal ledger entries kept before the oldest are evicted
    #[serde(default = "default_ledger_retention")]
    pub ledger_retention: usize,

    /// Largest network a build or scale-out may ask for
    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,

    /// Where build-state archives and event logs go (disabled when unset)
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    /// File inside node containers that daemons tee their output to
    #[serde(default = "default_docker_output_file")]
    pub docker_output_file: String,

    #[serde(default = "default_verbosity")]
    pub verbosity: String,
}

fn default_max_message_retries() -> u8 {
    5
}

fn default_queue_max_concurrency() -> usize {
    20
}

fn default_command_queue() -> String {
    "commands".to_string()
}

fn default_completion_queue() -> String {
    "teardownRequests".to_string()
}

fn default_error_queue() -> String {
    "errors".to_string()
}

fn default_status_queue() -> String {
    "status".to_string()
}

fn default_true() -> bool {
    true
}

fn default_retry_delay_millis() -> u64 {
    1000
}

fn default_dependency_wait_millis() -> u64 {
    1000
}

fn default_ledger_retention() -> usize {
    10_000
}

fn default_max_nodes() -> usize {
    200
}

fn default_docker_output_file() -> String {
    "/output.log".to_string()
}

fn default_verbosity() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_message_retries: default_max_message_retries(),
            queue_max_concurrency: default_queue_max_concurrency(),
            command_queue_name: default_command_queue(),
            completion_queue_name: default_completion_queue(),
            error_queue_name: default_error_queue(),
            status_queue_name: default_status_queue(),
            enable_error_collection: true,
            retry_delay_millis: default_retry_delay_millis(),
            dependency_wait_millis: default_dependency_wait_millis(),
            ledger_retention: default_ledger_retention(),
            max_nodes: default_max_nodes(),
            state_dir: None,
            docker_output_file: default_docker_output_file(),
            verbosity: default_verbosity(),
        }
    }
}

impl Config {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_millis)
    }

    pub fn dependency_wait(&self) -> Duration {
        Duration::from_millis(self.dependency_wait_millis)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), String> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup (the environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), String>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MAX_MESSAGE_RETRIES") {
            self.max_message_retries = v
                .parse()
                .map_err(|e| format!("MAX_MESSAGE_RETRIES={}: {}", v, e))?;
        }
        if let Some(v) = lookup("QUEUE_MAX_CONCURRENCY") {
            self.queue_max_concurrency = v
                .parse()
                .map_err(|e| format!("QUEUE_MAX_CONCURRENCY={}: {}", v, e))?;
        }
        if let Some(v) = lookup("ENABLE_ERROR_COLLECTION") {
            self.enable_error_collection = v
                .parse()
                .map_err(|e| format!("ENABLE_ERROR_COLLECTION={}: {}", v, e))?;
        }
        if let Some(v) = lookup("MAX_NODES") {
            self.max_nodes = v.parse().map_err(|e| format!("MAX_NODES={}: {}", v, e))?;
        }
        if let Some(v) = lookup("COMMAND_QUEUE_NAME") {
            self.command_queue_name = v;
        }
        if let Some(v) = lookup("COMPLETION_QUEUE_NAME") {
            self.completion_queue_name = v;
        }
        if let Some(v) = lookup("ERROR_QUEUE_NAME") {
            self.error_queue_name = v;
        }
        if let Some(v) = lookup("STATUS_QUEUE_NAME") {
            self.status_queue_name = v;
        }
        if let Some(v) = lookup("VERBOSITY") {
            self.verbosity = v;
        }
        Ok(())
    }
}

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Parse a config file from disk.
pub fn parse_config_file(path: &Path) -> Result<Config, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    parse_config(&content)
}

/// Parse a config from a YAML string. An empty document yields the defaults.
pub fn parse_config(yaml: &str) -> Result<Config, String> {
    if yaml.trim().is_empty() {
        return Ok(Config::default());
    }
    serde_yaml_ng::from_str(yaml).map_err(|e| format!("YAML parse error: {}", e))
}

/// Load the config file when present, defaults otherwise, then the environment.
pub fn load(path: Option<&Path>) -> Result<Config, String> {
    let mut config = match path {
        Some(p) => parse_config_file(p)?,
        None => Config::default(),
    };
    config.apply_env()?;
    Ok(config)
}

/// Validate a parsed config. Returns a list of errors (empty = valid).
pub fn validate_config(config: &Config) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if config.queue_max_concurrency == 0 {
        errors.push(ValidationError {
            message: "queueMaxConcurrency must be at least 1".to_string(),
        });
    }

    let queues = [
        ("commandQueueName", &config.command_queue_name),
        ("completionQueueName", &config.completion_queue_name),
        ("errorQueueName", &config.error_queue_name),
        ("statusQueueName", &config.status_queue_name),
    ];
    for (i, (key, name)) in queues.iter().enumerate() {
        if name.is_empty() {
            errors.push(ValidationError {
                message: format!("{} must not be empty", key),
            });
            continue;
        }
        for (other_key, other) in &queues[..i] {
            if other == name {
                errors.push(ValidationError {
                    message: format!("{} and {} both name queue '{}'", other_key, key, name),
                });
            }
        }
    }

    if config.max_nodes == 0 {
        errors.push(ValidationError {
            message: "maxNodes must be at least 1".to_string(),
        });
    }

    if config.ledger_retention == 0 {
        errors.push(ValidationError {
            message: "ledgerRetention must be at least 1".to_string(),
        });
    }

    errors
}
