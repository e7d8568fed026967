use crate::guard::RejectionReason;
use std::time::Duration;
use thiserror::Error;

/// Why a call to the language-model provider failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceFailure {
    NotConfigured,
    Auth,
    RateLimited,
    Unavailable,
    Timeout,
    Network,
    MalformedResponse,
}

impl ServiceFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceFailure::NotConfigured => "not configured",
            ServiceFailure::Auth => "authentication failed",
            ServiceFailure::RateLimited => "rate limited",
            ServiceFailure::Unavailable => "unavailable",
            ServiceFailure::Timeout => "timed out",
            ServiceFailure::Network => "unreachable",
            ServiceFailure::MalformedResponse => "malformed response",
        }
    }
}

#[derive(Error, Debug)]
pub enum GenieError {
    #[error("Schema load error: {0}")]
    SchemaLoad(String),

    #[error("Translation service error ({}): {detail}", .failure.as_str())]
    TranslationService {
        failure: ServiceFailure,
        detail: String,
    },

    #[error("Translation parse error: {0}")]
    TranslationParse(String),

    #[error("Query rejected: {0}")]
    GuardRejected(RejectionReason),

    #[error("Query execution timed out after {0:?}")]
    ExecutionTimeout(Duration),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GenieError {
    pub fn service(failure: ServiceFailure, detail: impl Into<String>) -> Self {
        GenieError::TranslationService {
            failure,
            detail: detail.into(),
        }
    }

    /// Stable category label, safe to show to users and to use as a log field.
    pub fn category(&self) -> &'static str {
        match self {
            GenieError::SchemaLoad(_) => "schema_load",
            GenieError::TranslationService { .. } => "translation_service",
            GenieError::TranslationParse(_) => "translation_parse",
            GenieError::GuardRejected(_) => "guard_rejected",
            GenieError::ExecutionTimeout(_) => "execution_timeout",
            GenieError::Execution(_) => "execution",
            GenieError::Config(_) => "config",
            GenieError::Io(_) => "io",
            GenieError::Json(_) => "json",
        }
    }

    /// Human-readable message for the session. Never carries provider or database text.
    pub fn user_message(&self) -> String {
        match self {
            GenieError::SchemaLoad(_) => {
                "The database schema is not available right now.".to_string()
            }
            GenieError::TranslationService { failure, .. } => match failure {
                ServiceFailure::NotConfigured => {
                    "The language model is not configured, so questions cannot be translated.".to_string()
                }
                ServiceFailure::Auth => {
                    "The language model rejected our credentials. Please contact the administrator.".to_string()
                }
                ServiceFailure::RateLimited => {
                    "The language model is busy right now. Please try again in a moment.".to_string()
                }
                _ => format!(
                    "Could not reach the language model ({}). Please try again.",
                    failure.as_str()
                ),
            },
            GenieError::TranslationParse(_) => {
                "Could not turn that question into a single query. Please try rephrasing it.".to_string()
            }
            GenieError::GuardRejected(reason) => {
                format!("The generated query was blocked: {}", reason)
            }
            GenieError::ExecutionTimeout(timeout) => format!(
                "The query took longer than {}s and was cancelled. Try a narrower question.",
                timeout.as_secs()
            ),
            GenieError::Execution(_) => {
                "The database could not run the query. Please try again or rephrase.".to_string()
            }
            GenieError::Config(_) | GenieError::Io(_) | GenieError::Json(_) => {
                "An internal error occurred.".to_string()
            }
        }
    }

    /// Whether the single permitted translation retry should be spent on this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            GenieError::TranslationService { failure, .. } => !matches!(
                failure,
                ServiceFailure::NotConfigured | ServiceFailure::Auth
            ),
            GenieError::TranslationParse(_) => true,
            _ => false,
        }
    }
}

impl From<sqlx::Error> for GenieError {
    fn from(err: sqlx::Error) -> Self {
        GenieError::Execution(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GenieError>;
