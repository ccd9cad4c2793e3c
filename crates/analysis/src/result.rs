use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Result of an analysis run.
///
/// The scheduler stores it untouched on the completed work item; its meaning is
/// owned by the work function (pest class score, yield estimate, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Primary score for the analysis (model-specific meaning).
    pub score: f64,

    /// Confidence in \[0, 1\] (recommended convention; not enforced).
    pub confidence: f64,

    /// Optional human-readable explanation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,

    /// Free-form metadata (model name, detected labels, timings, etc).
    #[serde(default)]
    pub metadata: JsonValue,
}

impl AnalysisResult {
    pub fn new(score: f64, confidence: f64) -> Self {
        Self {
            score,
            confidence,
            explanation: None,
            metadata: JsonValue::Null,
        }
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = Some(explanation.into());
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Failure reported by a work function. Every variant is retryable from the
/// queue's point of view; the retry controller decides based on attempts.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("invalid job input: {0}")]
    InvalidInput(String),

    #[error("analysis failed: {0}")]
    AnalysisFailed(String),

    #[error("analysis service unavailable: {0}")]
    Unavailable(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl AnalysisError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::AnalysisFailed(msg.into())
    }
}
