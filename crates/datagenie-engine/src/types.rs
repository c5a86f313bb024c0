use crate::error::FailureKind;
use datagenie_query::ResultColumn;
use serde::{Deserialize, Serialize};

/// A single natural-language question against one data source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    pub data_source_id: String,
    /// Earlier questions of the same conversation, oldest first
    #[serde(default)]
    pub prior_context: Vec<String>,
    pub request_id: String,
}

impl QueryRequest {
    /// New request with a generated request id
    pub fn new(data_source_id: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            data_source_id: data_source_id.into(),
            prior_context: Vec::new(),
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_prior_context<I, S>(mut self, context: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prior_context = context.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }
}

/// Query text proposed by the reasoning service. Never executed or cached as-is.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateQuery {
    pub sql: String,
    /// Self-reported confidence, clamped to `0.0..=1.0`
    pub confidence: f64,
    /// Tables the service claims to use; informational only
    pub tables: Vec<String>,
}

impl CandidateQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            confidence: 1.0,
            tables: Vec::new(),
        }
    }
}

/// Masked rows produced by one execution; this is what the result cache holds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub columns: Vec<ResultColumn>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: usize,
    pub execution_time_ms: u64,
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTimings {
    pub generation_ms: u64,
    pub validation_ms: u64,
    pub execution_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryOutcome {
    pub request_id: String,
    pub columns: Vec<ResultColumn>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: usize,
    pub truncated: bool,
    pub cache_hit: bool,
    pub timings: StageTimings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryFailure {
    pub request_id: String,
    pub failure_kind: FailureKind,
    pub message: String,
}

impl QueryFailure {
    pub fn new(request_id: impl Into<String>, kind: FailureKind) -> Self {
        Self {
            request_id: request_id.into(),
            failure_kind: kind,
            message: kind.user_message().to_string(),
        }
    }
}

/// Final answer to a [`QueryRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum AnalyzeResult {
    Success(QueryOutcome),
    Failed(QueryFailure),
}

impl AnalyzeResult {
    pub fn is_success(&self) -> bool {
        matches!(self, AnalyzeResult::Success(_))
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            AnalyzeResult::Success(_) => None,
            AnalyzeResult::Failed(failure) => Some(failure.failure_kind),
        }
    }

    pub fn outcome(&self) -> Option<&QueryOutcome> {
        match self {
            AnalyzeResult::Success(outcome) => Some(outcome),
            AnalyzeResult::Failed(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::RejectReason;

    #[test]
    fn test_analyze_result_wire_shape() {
        let failed = AnalyzeResult::Failed(QueryFailure::new(
            "req-1",
            FailureKind::ValidationRejected(RejectReason::UnknownObject),
        ));
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["failure_kind"]["kind"], "VALIDATION_REJECTED");
        assert_eq!(json["failure_kind"]["reason"], "UNKNOWN_OBJECT");

        let success = AnalyzeResult::Success(QueryOutcome {
            request_id: "req-2".into(),
            columns: vec![],
            rows: vec![],
            row_count: 0,
            truncated: false,
            cache_hit: true,
            timings: StageTimings::default(),
        });
        let json = serde_json::to_value(&success).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["cache_hit"], true);
        assert_eq!(json["timings"]["execution_ms"], 0);
    }

    #[test]
    fn test_request_builder() {
        let request = QueryRequest::new("sales", "monthly revenue")
            .with_prior_context(["last year?"])
            .with_request_id("abc");
        assert_eq!(request.request_id, "abc");
        assert_eq!(request.prior_context, vec!["last year?".to_string()]);
        assert!(!QueryRequest::new("a", "b").request_id.is_empty());
    }
}
