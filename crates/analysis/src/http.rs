//! Work function that delegates to a remote analysis service.
//!
//! The service contract is a single call: `POST <endpoint>` with the raw
//! payload as body, returning an [`AnalysisResult`] as JSON.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

use crate::context::WorkContext;
use crate::result::{AnalysisError, AnalysisResult};
use crate::work::{AnalysisInput, AnalysisWork};

const METADATA_HEADER: &str = "x-analysis-metadata";
const JOB_ID_HEADER: &str = "x-analysis-job-id";
const ATTEMPT_HEADER: &str = "x-analysis-attempt";

#[derive(Debug, Clone)]
pub struct HttpAnalysisWork {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAnalysisWork {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, AnalysisError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AnalysisError::Internal(format!("failed to build http client: {e}")))?;
        Ok(Self::with_client(client, endpoint))
    }

    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call(&self, input: &AnalysisInput, ctx: &WorkContext) -> Result<AnalysisResult, AnalysisError> {
        let metadata = serde_json::to_string(&input.metadata)
            .map_err(|e| AnalysisError::InvalidInput(format!("metadata is not serializable: {e}")))?;

        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(METADATA_HEADER, metadata)
            .header(JOB_ID_HEADER, ctx.job_id().to_string())
            .header(ATTEMPT_HEADER, ctx.attempt().to_string())
            .body(input.data.clone())
            .send()
            .await
            .map_err(|e| AnalysisError::Unavailable(e.to_string()))?;

        let status = response.status();
        debug!(job_id = %ctx.job_id(), endpoint = %self.endpoint, %status, "analysis service responded");

        if status.is_success() {
            return response
                .json::<AnalysisResult>()
                .await
                .map_err(|e| AnalysisError::failed(format!("malformed analysis response: {e}")));
        }

        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY | StatusCode::PAYLOAD_TOO_LARGE => {
                Err(AnalysisError::InvalidInput(format!("{status}: {body}")))
            }
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                Err(AnalysisError::Unavailable(format!("{status}: {body}")))
            }
            _ => Err(AnalysisError::failed(format!("{status}: {body}"))),
        }
    }
}

#[async_trait]
impl AnalysisWork for HttpAnalysisWork {
    async fn execute(
        &self,
        input: &AnalysisInput,
        ctx: &WorkContext,
    ) -> Result<AnalysisResult, AnalysisError> {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(AnalysisError::Cancelled),
            result = self.call(input, ctx) => result,
        }
    }
}
