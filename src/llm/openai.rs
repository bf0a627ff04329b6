//! OpenAI-backed analyzer.
//!
//! Uses the chat completions endpoint with a strict JSON schema built from
//! the requested field names, so the model can only answer with an object
//! mapping each field to an array of strings.

use crate::llm::{AnalysisError, Analyzer, Extraction};
use crate::protocol::TokenUsage;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, warn};

const SYSTEM_PROMPT: &str = "You are a literary analysis assistant. Extract the \
requested characteristics from the text the user provides. Answer only with the \
extracted values; when the text gives no evidence for a characteristic, return \
an empty list for it.";

/// OpenAI analyzer configuration
#[derive(Debug, Clone)]
pub struct OpenAiAnalyzerConfig {
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for OpenAiAnalyzerConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            temperature: None,
            base_url: "https://api.openai.com/v1".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// OpenAI analyzer implementation
pub struct OpenAiAnalyzer {
    config: OpenAiAnalyzerConfig,
    client: Client,
}

impl OpenAiAnalyzer {
    pub fn new(config: OpenAiAnalyzerConfig) -> Result<Self, AnalysisError> {
        if config.api_key.is_empty() {
            return Err(AnalysisError::NotConfigured(
                "OpenAI API key is required".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AnalysisError::NetworkError(e.to_string()))?;

        Ok(Self { config, client })
    }

    /// Build the strict response schema from the requested field names
    /// (pure function). Every field becomes a required array of strings.
    fn build_response_schema(fields: &[String]) -> Value {
        let properties: serde_json::Map<String, Value> = fields
            .iter()
            .map(|field| {
                (
                    field.clone(),
                    json!({ "type": "array", "items": { "type": "string" } }),
                )
            })
            .collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": fields,
            "additionalProperties": false
        })
    }

    /// Build the completion request for one extraction (pure function).
    fn build_request(&self, text: &str, fields: &[String]) -> OpenAiCompletionRequest {
        OpenAiCompletionRequest {
            model: self.config.model.clone(),
            messages: vec![
                OpenAiMessage {
                    role: "system".to_string(),
                    content: Some(SYSTEM_PROMPT.to_string()),
                    refusal: None,
                },
                OpenAiMessage {
                    role: "user".to_string(),
                    content: Some(text.to_string()),
                    refusal: None,
                },
            ],
            temperature: self.config.temperature,
            response_format: OpenAiResponseFormat {
                format_type: "json_schema".to_string(),
                json_schema: OpenAiJsonSchema {
                    name: "field_extraction".to_string(),
                    strict: Some(true),
                    schema: Self::build_response_schema(fields),
                },
            },
        }
    }

    /// Parse the completion response into an extraction (pure function).
    fn parse_response(response: OpenAiCompletionResponse) -> Result<Extraction, AnalysisError> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AnalysisError::InvalidResponse("no choices returned".to_string()))?;

        if let Some(refusal) = choice.message.refusal {
            return Err(AnalysisError::Refused(refusal));
        }

        let content = choice
            .message
            .content
            .ok_or_else(|| AnalysisError::InvalidResponse("empty message content".to_string()))?;

        let fields: HashMap<String, Vec<String>> = serde_json::from_str(&content)
            .map_err(|e| AnalysisError::InvalidResponse(format!("schema violation: {e}")))?;

        Ok(Extraction {
            fields,
            usage: TokenUsage {
                input_tokens: response.usage.prompt_tokens,
                output_tokens: response.usage.completion_tokens,
                model: response.model,
            },
        })
    }

    /// Retry orchestrator - handles only I/O and retry logic (impure)
    async fn extract_with_retry(
        &self,
        request: OpenAiCompletionRequest,
    ) -> Result<Extraction, AnalysisError> {
        let backoff_delays = [100u64, 200, 300];
        let mut last_error = None;

        for (attempt, &delay_ms) in std::iter::once(&0u64)
            .chain(backoff_delays.iter())
            .enumerate()
        {
            if attempt > 0 {
                debug!("OpenAI retry attempt {} after {}ms delay", attempt, delay_ms);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }

            match self.make_api_request(&request).await {
                Ok(response) => {
                    if attempt > 0 {
                        debug!("OpenAI request succeeded after {} retries", attempt);
                    }
                    return Self::parse_response(response);
                }
                Err(e) => {
                    warn!("OpenAI request attempt {} failed: {}", attempt + 1, e);
                    if !Self::should_retry(&e) {
                        error!("Non-retryable error, aborting: {}", e);
                        return Err(e);
                    }
                    last_error = Some(e);
                }
            }
        }

        error!("OpenAI request failed after all retries");
        Err(last_error
            .unwrap_or_else(|| AnalysisError::NetworkError("all retry attempts failed".to_string())))
    }

    /// Make single API request (impure I/O)
    async fn make_api_request(
        &self,
        request: &OpenAiCompletionRequest,
    ) -> Result<OpenAiCompletionResponse, AnalysisError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| AnalysisError::NetworkError(e.to_string()))?;

        let status = response.status();

        if status.is_server_error() || status.as_u16() == 429 {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AnalysisError::ApiError(format!(
                "retryable status {status}: {error_text}"
            )));
        }

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!(
                "OpenAI API client error - Status: {}, Response: {}",
                status, error_text
            );
            return Err(AnalysisError::RequestFailed(format!(
                "status {status}: {error_text}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AnalysisError::InvalidResponse(e.to_string()))
    }

    /// Check if error should trigger retry (pure)
    fn should_retry(error: &AnalysisError) -> bool {
        match error {
            AnalysisError::NetworkError(_) => true,
            AnalysisError::ApiError(msg) => msg.starts_with("retryable"),
            _ => false,
        }
    }
}

#[async_trait]
impl Analyzer for OpenAiAnalyzer {
    async fn extract(&self, text: &str, fields: &[String]) -> Result<Extraction, AnalysisError> {
        if fields.is_empty() {
            return Err(AnalysisError::InvalidResponse(
                "no fields requested".to_string(),
            ));
        }

        debug!(
            model = %self.config.model,
            field_count = fields.len(),
            text_len = text.len(),
            "Requesting field extraction"
        );

        let request = self.build_request(text, fields);
        self.extract_with_retry(request).await
    }
}

#[derive(Debug, Serialize)]
struct OpenAiCompletionRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    response_format: OpenAiResponseFormat,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    refusal: Option<String>,
}

#[derive(Debug, Serialize)]
struct OpenAiResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
    json_schema: OpenAiJsonSchema,
}

#[derive(Debug, Serialize)]
struct OpenAiJsonSchema {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    strict: Option<bool>,
    schema: Value,
}

#[derive(Debug, Deserialize)]
struct OpenAiCompletionResponse {
    model: String,
    choices: Vec<OpenAiChoice>,
    usage: OpenAiUsage,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_analyzer() -> OpenAiAnalyzer {
        OpenAiAnalyzer::new(OpenAiAnalyzerConfig {
            api_key: "test-key".to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_analyzer_creation_without_api_key() {
        let result = OpenAiAnalyzer::new(OpenAiAnalyzerConfig::default());
        assert!(matches!(result, Err(AnalysisError::NotConfigured(_))));
    }

    #[test]
    fn test_schema_has_one_array_property_per_field() {
        let schema = OpenAiAnalyzer::build_response_schema(&fields(&["genre", "authors"]));

        assert_eq!(schema["type"], "object");
        assert_eq!(schema["additionalProperties"], false);
        assert_eq!(schema["required"], json!(["genre", "authors"]));
        assert_eq!(schema["properties"]["genre"]["type"], "array");
        assert_eq!(
            schema["properties"]["authors"]["items"]["type"],
            "string"
        );
    }

    #[test]
    fn test_request_carries_strict_schema_and_text() {
        let analyzer = test_analyzer();
        let request = analyzer.build_request("a space adventure", &fields(&["genre"]));

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["response_format"]["type"], "json_schema");
        assert_eq!(json["response_format"]["json_schema"]["strict"], true);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "a space adventure");
    }

    #[test]
    fn test_parse_response_extracts_fields_and_usage() {
        let response = OpenAiCompletionResponse {
            model: "gpt-4o-mini".to_string(),
            choices: vec![OpenAiChoice {
                message: OpenAiMessage {
                    role: "assistant".to_string(),
                    content: Some(r#"{"genre":["sci-fi"],"authors":[]}"#.to_string()),
                    refusal: None,
                },
            }],
            usage: OpenAiUsage {
                prompt_tokens: 42,
                completion_tokens: 7,
            },
        };

        let extraction = OpenAiAnalyzer::parse_response(response).unwrap();
        assert_eq!(extraction.fields["genre"], vec!["sci-fi"]);
        assert!(extraction.fields["authors"].is_empty());
        assert_eq!(extraction.usage.input_tokens, 42);
        assert_eq!(extraction.usage.output_tokens, 7);
        assert_eq!(extraction.usage.model, "gpt-4o-mini");
    }

    #[test]
    fn test_parse_response_surfaces_refusal() {
        let response = OpenAiCompletionResponse {
            model: "gpt-4o-mini".to_string(),
            choices: vec![OpenAiChoice {
                message: OpenAiMessage {
                    role: "assistant".to_string(),
                    content: None,
                    refusal: Some("I can't help with that.".to_string()),
                },
            }],
            usage: OpenAiUsage {
                prompt_tokens: 10,
                completion_tokens: 0,
            },
        };

        let result = OpenAiAnalyzer::parse_response(response);
        assert!(matches!(result, Err(AnalysisError::Refused(_))));
    }

    #[test]
    fn test_parse_response_rejects_non_schema_content() {
        let response = OpenAiCompletionResponse {
            model: "gpt-4o-mini".to_string(),
            choices: vec![OpenAiChoice {
                message: OpenAiMessage {
                    role: "assistant".to_string(),
                    content: Some("not json".to_string()),
                    refusal: None,
                },
            }],
            usage: OpenAiUsage {
                prompt_tokens: 1,
                completion_tokens: 1,
            },
        };

        assert!(matches!(
            OpenAiAnalyzer::parse_response(response),
            Err(AnalysisError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_retry_decision() {
        assert!(OpenAiAnalyzer::should_retry(&AnalysisError::NetworkError(
            "timeout".to_string()
        )));
        assert!(OpenAiAnalyzer::should_retry(&AnalysisError::ApiError(
            "retryable status 503".to_string()
        )));
        assert!(!OpenAiAnalyzer::should_retry(&AnalysisError::Refused(
            "no".to_string()
        )));
        assert!(!OpenAiAnalyzer::should_retry(
            &AnalysisError::RequestFailed("status 401".to_string())
        ));
    }
}
