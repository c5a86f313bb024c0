use crate::validator::RejectReason;
use datagenie_query::DataError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised by the reasoning-service adapter
#[derive(Error, Debug)]
pub enum ReasoningError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Service returned status {0}")]
    Status(u16),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Errors raised while turning a question into a candidate query
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Question is empty")]
    EmptyQuestion,

    #[error("Question exceeds {max} characters")]
    QuestionTooLong { max: usize },

    #[error("Potential prompt injection detected")]
    PromptInjection,

    #[error("Reasoning service error: {0}")]
    Service(#[from] ReasoningError),

    #[error("Reasoning service timed out after {0}ms")]
    Timeout(u64),

    #[error("Unparseable service output: {0}")]
    MalformedOutput(String),

    #[error("Service output contained no query")]
    EmptyQuery,
}

impl GenerationError {
    /// Input problems are not retried; a second attempt would see the same input
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            GenerationError::EmptyQuestion
                | GenerationError::QuestionTooLong { .. }
                | GenerationError::PromptInjection
        )
    }
}

/// Errors raised by connection pools
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("No pool for data source: {0}")]
    UnknownDataSource(String),

    #[error("Pool for {data_source} exhausted after waiting {waited_ms}ms")]
    Exhausted { data_source: String, waited_ms: u64 },

    #[error("Pool for {0} is closed")]
    Closed(String),

    #[error("Execution exceeded {0}ms")]
    Timeout(u64),

    #[error(transparent)]
    Engine(#[from] DataError),
}

/// Errors returned by the engine's management operations
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Data source not found: {0}")]
    DataSourceNotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl EngineError {
    pub fn not_found(id: impl Into<String>) -> Self {
        EngineError::DataSourceNotFound(id.into())
    }

    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        EngineError::InvalidConfiguration(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Terminal failure of a request, as reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    UnknownDataSource,
    GenerationFailed,
    ValidationRejected(RejectReason),
    PoolExhausted,
    ExecutionTimeout,
    ExecutionError,
}

impl FailureKind {
    /// Stable message safe to show to end users. Never carries engine text,
    /// query text or credentials.
    pub fn user_message(&self) -> &'static str {
        match self {
            FailureKind::UnknownDataSource => "The requested data source is not available.",
            FailureKind::GenerationFailed => {
                "The question could not be translated into a query. Try rephrasing it."
            }
            FailureKind::ValidationRejected(RejectReason::Malformed) => {
                "The generated query could not be understood."
            }
            FailureKind::ValidationRejected(RejectReason::ForbiddenVerb) => {
                "Only read-only queries are allowed."
            }
            FailureKind::ValidationRejected(RejectReason::UnknownObject) => {
                "The question refers to data that is not available in this data source."
            }
            FailureKind::ValidationRejected(RejectReason::TooComplex) => {
                "The question requires a query that is too complex. Try simplifying it."
            }
            FailureKind::PoolExhausted => "The data source is busy. Please try again shortly.",
            FailureKind::ExecutionTimeout => "The query took too long to run.",
            FailureKind::ExecutionError => "The data source could not run the query.",
        }
    }

    /// Transient failures may succeed if the caller tries again later
    pub fn is_transient(&self) -> bool {
        matches!(self, FailureKind::PoolExhausted | FailureKind::ExecutionTimeout)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::UnknownDataSource => write!(f, "UNKNOWN_DATASOURCE"),
            FailureKind::GenerationFailed => write!(f, "GENERATION_FAILED"),
            FailureKind::ValidationRejected(reason) => write!(f, "VALIDATION_REJECTED: {}", reason),
            FailureKind::PoolExhausted => write!(f, "POOL_EXHAUSTED"),
            FailureKind::ExecutionTimeout => write!(f, "EXECUTION_TIMEOUT"),
            FailureKind::ExecutionError => write!(f, "EXECUTION_ERROR"),
        }
    }
}

impl From<&PoolError> for FailureKind {
    fn from(err: &PoolError) -> Self {
        match err {
            PoolError::UnknownDataSource(_) => FailureKind::UnknownDataSource,
            PoolError::Exhausted { .. } => FailureKind::PoolExhausted,
            PoolError::Timeout(_) => FailureKind::ExecutionTimeout,
            PoolError::Closed(_) | PoolError::Engine(_) => FailureKind::ExecutionError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_serialization() {
        let json = serde_json::to_value(FailureKind::ValidationRejected(
            RejectReason::ForbiddenVerb,
        ))
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "VALIDATION_REJECTED", "reason": "FORBIDDEN_VERB"})
        );

        let json = serde_json::to_value(FailureKind::PoolExhausted).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "POOL_EXHAUSTED"}));
    }

    #[test]
    fn test_user_messages_are_generic() {
        let kinds = [
            FailureKind::UnknownDataSource,
            FailureKind::GenerationFailed,
            FailureKind::ValidationRejected(RejectReason::Malformed),
            FailureKind::ValidationRejected(RejectReason::UnknownObject),
            FailureKind::PoolExhausted,
            FailureKind::ExecutionTimeout,
            FailureKind::ExecutionError,
        ];
        for kind in kinds {
            let message = kind.user_message();
            assert!(!message.to_uppercase().contains("SELECT"));
            assert!(!message.is_empty());
        }
    }

    #[test]
    fn test_pool_error_mapping() {
        assert_eq!(
            FailureKind::from(&PoolError::Timeout(5000)),
            FailureKind::ExecutionTimeout
        );
        assert_eq!(
            FailureKind::from(&PoolError::Exhausted {
                data_source: "ds".to_string(),
                waited_ms: 10
            }),
            FailureKind::PoolExhausted
        );
        assert_eq!(
            FailureKind::from(&PoolError::Engine(DataError::QueryFailed("boom".into()))),
            FailureKind::ExecutionError
        );
    }

    #[test]
    fn test_generation_retryability() {
        assert!(!GenerationError::PromptInjection.is_retryable());
        assert!(!GenerationError::EmptyQuestion.is_retryable());
        assert!(GenerationError::EmptyQuery.is_retryable());
        assert!(GenerationError::Timeout(30_000).is_retryable());
    }
}
