//! Configuration for the extraction worker.
//!
//! Loaded from TOML at startup, validated once, then passed explicitly to the
//! components that need it. Secrets never live in the file itself: the config
//! names environment variables and credentials are read at runtime.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Main worker configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    pub worker: WorkerSection,
    pub broker: BrokerSection,
    pub llm: LlmSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub reporting: ReportingSection,
    #[serde(default)]
    pub health: HealthSection,
}

/// Identity of this worker instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerSection {
    /// Worker identifier (must match [a-zA-Z0-9._-]+). Used in client ids,
    /// log fields, and error records.
    pub id: String,
}

/// Broker connection and topology.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Broker URL with protocol and port (mqtt:// or mqtts://)
    pub broker_url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Exchange this worker consumes work from
    #[serde(default = "default_exchange")]
    pub exchange: String,
    /// Routing key of the work queue
    #[serde(default = "default_work_routing_key")]
    pub work_routing_key: String,
    /// Exchange the persistence services listen on
    #[serde(default = "default_storage_exchange")]
    pub storage_exchange: String,
    /// Work items buffered locally before deliveries are left with the broker
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
}

fn default_exchange() -> String {
    "gpt".to_string()
}

fn default_work_routing_key() -> String {
    "extract.request".to_string()
}

fn default_storage_exchange() -> String {
    "db-crud".to_string()
}

fn default_max_queue_depth() -> usize {
    10
}

/// LLM provider used for field extraction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmSection {
    /// Provider name (currently "openai")
    pub provider: String,
    /// Model identifier
    pub model: String,
    /// Environment variable containing API key
    pub api_key_env: String,
    /// Optional temperature (0.0 to 2.0)
    pub temperature: Option<f32>,
    /// Override for the API base URL; tests point this at a local server
    pub base_url: Option<String>,
}

/// Persistence pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineSection {
    /// Per-call reply deadline in seconds
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Routing key of the cost-accounting service
    #[serde(default = "default_cost_routing_key")]
    pub cost_routing_key: String,
    /// Routing key of the conversation-history service
    #[serde(default = "default_conversation_routing_key")]
    pub conversation_routing_key: String,
    /// Routing key of the metadata service
    #[serde(default = "default_metadata_routing_key")]
    pub metadata_routing_key: String,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout_secs(),
            cost_routing_key: default_cost_routing_key(),
            conversation_routing_key: default_conversation_routing_key(),
            metadata_routing_key: default_metadata_routing_key(),
        }
    }
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_cost_routing_key() -> String {
    "records.cost".to_string()
}

fn default_conversation_routing_key() -> String {
    "records.conversation".to_string()
}

fn default_metadata_routing_key() -> String {
    "records.metadata".to_string()
}

/// Error telemetry endpoint. Reporting is disabled when no endpoint is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReportingSection {
    /// HTTP endpoint error records are POSTed to
    pub endpoint: Option<String>,
}

/// Health/readiness HTTP server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    #[serde(default = "default_health_port")]
    pub port: u16,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            port: default_health_port(),
        }
    }
}

fn default_health_port() -> u16 {
    8080
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid worker ID format: {0}")]
    InvalidWorkerId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl WorkerConfig {
    /// Load configuration from a TOML file and validate it.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: WorkerConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate fields that TOML typing alone cannot enforce.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_worker_id(&self.worker.id)?;

        if self.broker.max_queue_depth == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker.max_queue_depth must be at least 1".to_string(),
            ));
        }
        if self.pipeline.call_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "pipeline.call_timeout_secs must be at least 1".to_string(),
            ));
        }
        if let Some(temperature) = self.llm.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(ConfigError::InvalidConfig(format!(
                    "llm.temperature must be between 0.0 and 2.0, got {temperature}"
                )));
            }
        }

        Ok(())
    }

    /// Get the LLM API key from the configured environment variable.
    pub fn get_llm_api_key(&self) -> Result<String, ConfigError> {
        std::env::var(&self.llm.api_key_env)
            .map_err(|_| ConfigError::EnvVarNotFound(self.llm.api_key_env.clone()))
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[worker]
id = "test-worker"

[broker]
broker_url = "mqtt://localhost:1883"

[llm]
provider = "openai"
model = "gpt-4o-mini"
api_key_env = "OPENAI_API_KEY"
temperature = 0.2
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Worker ids flow into MQTT client ids and topic segments, so the charset
/// is restricted.
fn validate_worker_id(worker_id: &str) -> Result<(), ConfigError> {
    let valid_chars = worker_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if worker_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidWorkerId(format!(
            "Worker ID '{worker_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}
