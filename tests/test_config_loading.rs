//! Configuration loading and validation tests
//!
//! Tests focus on the behavior of loading, defaulting, and validation, not
//! on TOML parsing details.

use extraction_worker::config::{ConfigError, WorkerConfig};
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    write!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[worker]
id = "extractor-1"

[broker]
broker_url = "mqtt://localhost:1883"
username_env = "BROKER_USER"
password_env = "BROKER_PASS"

[llm]
provider = "openai"
model = "gpt-4o-mini"
api_key_env = "OPENAI_API_KEY"
temperature = 0.2

[pipeline]
call_timeout_secs = 45

[reporting]
endpoint = "https://telemetry.example.com/errors"
"#,
    );

    let config = WorkerConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.worker.id, "extractor-1");
    assert_eq!(config.broker.broker_url, "mqtt://localhost:1883");
    assert_eq!(config.broker.username_env, Some("BROKER_USER".to_string()));
    assert_eq!(config.llm.model, "gpt-4o-mini");
    assert_eq!(config.llm.temperature, Some(0.2));
    assert_eq!(config.pipeline.call_timeout_secs, 45);
    assert_eq!(
        config.reporting.endpoint,
        Some("https://telemetry.example.com/errors".to_string())
    );
}

#[test]
fn test_minimal_config_gets_topology_defaults() {
    let temp_file = write_config(
        r#"
[worker]
id = "extractor-1"

[broker]
broker_url = "mqtt://localhost:1883"

[llm]
provider = "openai"
model = "gpt-4o-mini"
api_key_env = "OPENAI_API_KEY"
"#,
    );

    let config = WorkerConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.broker.exchange, "gpt");
    assert_eq!(config.broker.work_routing_key, "extract.request");
    assert_eq!(config.broker.storage_exchange, "db-crud");
    assert_eq!(config.broker.max_queue_depth, 10);
    assert_eq!(config.pipeline.call_timeout_secs, 30);
    assert_eq!(config.pipeline.cost_routing_key, "records.cost");
    assert_eq!(
        config.pipeline.conversation_routing_key,
        "records.conversation"
    );
    assert_eq!(config.pipeline.metadata_routing_key, "records.metadata");
    assert!(config.reporting.endpoint.is_none());
    assert_eq!(config.health.port, 8080);
}

#[test]
fn test_missing_file_is_a_read_error() {
    let result = WorkerConfig::load_from_file(std::path::Path::new("/nonexistent/worker.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_invalid_toml_is_a_parse_error() {
    let temp_file = write_config("this is not [valid toml");
    let result = WorkerConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_invalid_worker_id_is_rejected() {
    let temp_file = write_config(
        r#"
[worker]
id = "bad id with spaces"

[broker]
broker_url = "mqtt://localhost:1883"

[llm]
provider = "openai"
model = "gpt-4o-mini"
api_key_env = "OPENAI_API_KEY"
"#,
    );

    let result = WorkerConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidWorkerId(_))));
}

#[test]
fn test_zero_call_timeout_is_rejected() {
    let temp_file = write_config(
        r#"
[worker]
id = "extractor-1"

[broker]
broker_url = "mqtt://localhost:1883"

[llm]
provider = "openai"
model = "gpt-4o-mini"
api_key_env = "OPENAI_API_KEY"

[pipeline]
call_timeout_secs = 0
"#,
    );

    let result = WorkerConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_llm_api_key_resolution() {
    let temp_file = write_config(
        r#"
[worker]
id = "extractor-1"

[broker]
broker_url = "mqtt://localhost:1883"

[llm]
provider = "openai"
model = "gpt-4o-mini"
api_key_env = "EXTRACTION_WORKER_TEST_MISSING_KEY"
"#,
    );

    let config = WorkerConfig::load_from_file(temp_file.path()).unwrap();
    let result = config.get_llm_api_key();
    assert!(matches!(result, Err(ConfigError::EnvVarNotFound(_))));
}
