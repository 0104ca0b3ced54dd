use crate::collect::retry::{RetryDecision, RetryPolicy};
use crate::config::env_or;
use crate::domain::pipeline::{Id, Opportunity};
use crate::upstream::error::{FailureKind, UpstreamError};
use crate::upstream::{PageRequest, PipelineApi};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const DEFAULT_PAGE_SIZE: u64 = 100;
// 100 req/min upstream cap is one request per 600ms; 700ms leaves headroom (~85 req/min).
const DEFAULT_REQ_DELAY_MS: u64 = 700;
const DEFAULT_MAX_PAGES: u64 = 1000;

#[derive(Debug, Clone)]
pub struct CollectorOptions {
    pub page_size: u64,
    pub request_delay: Duration,
    /// Hard stop regardless of what the API keeps returning.
    pub max_pages: u64,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            request_delay: Duration::from_millis(DEFAULT_REQ_DELAY_MS),
            max_pages: DEFAULT_MAX_PAGES,
        }
    }
}

impl CollectorOptions {
    pub fn from_env() -> Self {
        Self {
            page_size: env_or("PIPELINES_PAGE_SIZE", DEFAULT_PAGE_SIZE).max(1),
            request_delay: Duration::from_millis(env_or("PIPELINES_REQ_DELAY_MS", DEFAULT_REQ_DELAY_MS)),
            max_pages: env_or("PIPELINES_MAX_PAGES", DEFAULT_MAX_PAGES).max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Exhausted,
    RecordCap,
    PageCeiling,
    GaveUp(FailureKind),
    /// A non-retryable failure after some pages had already arrived.
    Failed(FailureKind),
}

#[derive(Debug, Clone)]
pub struct Collection {
    pub opportunities: Vec<Opportunity>,
    pub pages: u64,
    pub stop: StopReason,
    pub last_error: Option<UpstreamError>,
}

impl Collection {
    pub fn is_complete(&self) -> bool {
        self.stop == StopReason::Exhausted
    }

    /// Whether the collection ended on its own terms rather than on an upstream failure.
    pub fn is_successful(&self) -> bool {
        matches!(
            self.stop,
            StopReason::Exhausted | StopReason::RecordCap | StopReason::PageCeiling
        )
    }
}

#[derive(Clone)]
pub struct Collector {
    api: Arc<dyn PipelineApi>,
    opts: CollectorOptions,
    policy: RetryPolicy,
}

impl Collector {
    pub fn new(api: Arc<dyn PipelineApi>, opts: CollectorOptions, policy: RetryPolicy) -> Self {
        Self { api, opts, policy }
    }

    /// Pages are fetched strictly one after another. Retryable failures re-request the same
    /// offset; once the failure budget is spent the records gathered so far are returned.
    /// Authentication failures, and any non-retryable failure before the first page, are
    /// returned as errors.
    pub async fn collect(
        &self,
        pipeline_id: &Id,
        max_records: Option<u64>,
    ) -> Result<Collection, UpstreamError> {
        let limit = self.opts.page_size;
        let (page_budget, budget_reason) = match max_records.map(|m| m.div_ceil(limit).max(1)) {
            Some(pages) if pages < self.opts.max_pages => (pages, StopReason::RecordCap),
            _ => (self.opts.max_pages, StopReason::PageCeiling),
        };

        tracing::info!(%pipeline_id, limit, page_budget, ?max_records, "collecting opportunities");

        let mut out: Vec<Opportunity> = Vec::new();
        let mut offset: u64 = 0;
        let mut pages: u64 = 0;
        let mut failures: u32 = 0;
        let mut last_request: Option<Instant> = None;
        let mut last_error: Option<UpstreamError> = None;

        let stop = loop {
            if pages >= page_budget {
                break budget_reason;
            }

            if let Some(prev) = last_request {
                tokio::time::sleep_until(prev + self.opts.request_delay).await;
            }
            last_request = Some(Instant::now());

            let page = PageRequest::new(offset, limit);
            match self.api.list_opportunities(pipeline_id, &page).await {
                Ok(items) => {
                    failures = 0;
                    pages += 1;
                    let received = items.len() as u64;
                    out.extend(items);

                    if pages == 1 || pages % 10 == 0 {
                        tracing::info!(%pipeline_id, page = pages, offset, received, collected = out.len(), "opportunities page");
                    }
                    if received < limit {
                        break StopReason::Exhausted;
                    }
                    offset += limit;
                }
                Err(err) => {
                    failures += 1;
                    match self.policy.decide(&err, failures) {
                        RetryDecision::Retry(backoff) => {
                            tracing::warn!(
                                %pipeline_id,
                                offset,
                                attempt = failures,
                                ?backoff,
                                http_status = ?err.http_status(),
                                error = %err,
                                "opportunities page failed; retrying same offset"
                            );
                            tokio::time::sleep(backoff).await;
                        }
                        RetryDecision::GiveUp => {
                            tracing::warn!(
                                %pipeline_id,
                                offset,
                                failures,
                                collected = out.len(),
                                error = %err,
                                "too many consecutive failures; returning partial collection"
                            );
                            let kind = err.kind();
                            last_error = Some(err);
                            break StopReason::GaveUp(kind);
                        }
                        RetryDecision::Fail => {
                            if err.is_auth() || out.is_empty() {
                                return Err(err);
                            }
                            tracing::warn!(
                                %pipeline_id,
                                offset,
                                collected = out.len(),
                                error = %err,
                                "non-retryable failure; returning partial collection"
                            );
                            let kind = err.kind();
                            last_error = Some(err);
                            break StopReason::Failed(kind);
                        }
                    }
                }
            }
        };

        match stop {
            StopReason::Exhausted | StopReason::RecordCap => {
                tracing::info!(%pipeline_id, pages, collected = out.len(), ?stop, "opportunity collection finished");
            }
            _ => {
                tracing::warn!(%pipeline_id, pages, collected = out.len(), ?stop, "opportunity collection stopped early; more data may exist");
            }
        }

        Ok(Collection {
            opportunities: out,
            pages,
            stop,
            last_error,
        })
    }
}
