//! Text analysis capability.
//!
//! The pipeline only depends on the [`Analyzer`] trait; the OpenAI
//! implementation lives in [`openai`] and tests swap in a mock.

use crate::protocol::TokenUsage;
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

pub mod openai;

pub use openai::{OpenAiAnalyzer, OpenAiAnalyzerConfig};

/// Analysis errors. `Clone` so the retry loop can keep the last error around.
#[derive(Debug, Clone, Error)]
pub enum AnalysisError {
    #[error("Analyzer not configured: {0}")]
    NotConfigured(String),
    #[error("Model refused the request: {0}")]
    Refused(String),
    #[error("Invalid response from provider: {0}")]
    InvalidResponse(String),
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("API error: {0}")]
    ApiError(String),
    #[error("Request failed: {0}")]
    RequestFailed(String),
}

impl From<AnalysisError> for crate::error::WorkerError {
    fn from(error: AnalysisError) -> Self {
        crate::error::WorkerError::Analysis {
            message: error.to_string(),
        }
    }
}

/// Result of analyzing one text: the extracted field values plus the token
/// accounting the cost-recording call persists.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub fields: HashMap<String, Vec<String>>,
    pub usage: TokenUsage,
}

/// Field-extraction capability over free-form text.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Extract the named fields from `text`. Every requested field is present
    /// in the result (possibly with an empty value list).
    async fn extract(&self, text: &str, fields: &[String]) -> Result<Extraction, AnalysisError>;
}
