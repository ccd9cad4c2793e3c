use std::future::Future;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::context::WorkContext;
use crate::result::{AnalysisError, AnalysisResult};

/// Opaque job input: a binary blob (typically an image) plus structured
/// metadata. Passed to the work function untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisInput {
    pub data: Vec<u8>,
    #[serde(default)]
    pub metadata: JsonValue,
}

impl AnalysisInput {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            metadata: JsonValue::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A registered analysis strategy: one implementation per category.
///
/// Executions are at-least-once (a crash mid-run re-queues the job), so
/// implementations must be idempotent or tolerate re-execution.
#[async_trait]
pub trait AnalysisWork: Send + Sync + 'static {
    async fn execute(
        &self,
        input: &AnalysisInput,
        ctx: &WorkContext,
    ) -> Result<AnalysisResult, AnalysisError>;
}

/// Adapter turning an async closure into an [`AnalysisWork`].
pub struct FnWork<F> {
    f: F,
}

/// Wrap `f` as a work function.
///
/// ```ignore
/// registry.register(category, work_fn(|input, _ctx| async move {
///     Ok::<_, AnalysisError>(AnalysisResult::new(input.data.len() as f64, 1.0))
/// }));
/// ```
pub fn work_fn<F, Fut>(f: F) -> FnWork<F>
where
    F: Fn(AnalysisInput, WorkContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<AnalysisResult, AnalysisError>> + Send + 'static,
{
    FnWork { f }
}

impl<F> core::fmt::Debug for FnWork<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FnWork").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> AnalysisWork for FnWork<F>
where
    F: Fn(AnalysisInput, WorkContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<AnalysisResult, AnalysisError>> + Send + 'static,
{
    async fn execute(
        &self,
        input: &AnalysisInput,
        ctx: &WorkContext,
    ) -> Result<AnalysisResult, AnalysisError> {
        (self.f)(input.clone(), ctx.clone()).await
    }
}
