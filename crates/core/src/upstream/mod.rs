pub mod auth;
pub mod error;
pub mod http;
pub mod json;

#[cfg(test)]
pub(crate) mod fake;

use crate::domain::pipeline::{Id, Opportunity, Pipeline, Stage};
use crate::upstream::error::UpstreamError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub offset: u64,
    pub limit: u64,
    pub contact_id: Option<Id>,
}

impl PageRequest {
    pub fn new(offset: u64, limit: u64) -> Self {
        Self {
            offset,
            limit,
            contact_id: None,
        }
    }
}

/// The upstream pipeline API. Every call returns a normalized list and surfaces HTTP error
/// statuses as [`UpstreamError::Status`] so callers can decide whether to retry.
#[async_trait::async_trait]
pub trait PipelineApi: Send + Sync {
    async fn list_pipelines(&self) -> Result<Vec<Pipeline>, UpstreamError>;

    async fn list_stages(&self, pipeline_id: &Id) -> Result<Vec<Stage>, UpstreamError>;

    async fn list_opportunities(
        &self,
        pipeline_id: &Id,
        page: &PageRequest,
    ) -> Result<Vec<Opportunity>, UpstreamError>;

    async fn contact_tags(&self, contact_id: &Id) -> Result<Vec<String>, UpstreamError>;
}
