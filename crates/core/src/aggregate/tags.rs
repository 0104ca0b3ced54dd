use crate::config::env_or;
use crate::domain::aggregate::TagCount;
use crate::domain::pipeline::Id;
use crate::storage::cache::OpportunityCache;
use crate::upstream::error::FailureKind;
use crate::upstream::PipelineApi;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct TagOptions {
    pub sample: usize,
    pub spacing: Duration,
    pub retry_after_interrupt: Duration,
}

impl Default for TagOptions {
    fn default() -> Self {
        Self {
            sample: 10,
            spacing: Duration::from_millis(700),
            retry_after_interrupt: Duration::from_secs(60),
        }
    }
}

impl TagOptions {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            spacing: Duration::from_millis(env_or(
                "PIPELINES_REQ_DELAY_MS",
                defaults.spacing.as_millis() as u64,
            )),
            ..defaults
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRun {
    pub counts: Vec<TagCount>,
    pub looked_up: usize,
    /// False when a 429/5xx stopped the run early.
    pub complete: bool,
}

/// Looks up contact tags one by one, spaced by `spacing`.
///
/// Missing contacts are skipped. Rate limiting or a server error ends the run with what was
/// counted so far.
pub async fn count_tags(api: &dyn PipelineApi, contacts: &[Id], spacing: Duration) -> TagRun {
    let mut counts: HashMap<String, u64> = HashMap::new();
    let mut looked_up = 0;
    let mut complete = true;

    for (i, contact_id) in contacts.iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(spacing).await;
        }
        match api.contact_tags(contact_id).await {
            Ok(tags) => {
                looked_up += 1;
                for tag in tags {
                    *counts.entry(tag).or_default() += 1;
                }
            }
            Err(err) if err.is_rate_limited() || err.kind() == FailureKind::Server => {
                tracing::warn!(
                    %contact_id,
                    looked_up,
                    http_status = ?err.http_status(),
                    "stopping tag lookup; counts will be completed on a later run"
                );
                complete = false;
                break;
            }
            Err(err) => {
                tracing::debug!(%contact_id, error = %err, "contact lookup failed; skipping");
            }
        }
    }

    let mut counts: Vec<TagCount> = counts
        .into_iter()
        .map(|(name, count)| TagCount { name, count })
        .collect();
    counts.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));

    TagRun {
        counts,
        looked_up,
        complete,
    }
}

#[derive(Clone)]
pub struct TagEnricher {
    api: Arc<dyn PipelineApi>,
    cache: Arc<OpportunityCache>,
    opts: TagOptions,
    in_flight: Arc<Mutex<HashSet<Id>>>,
}

impl TagEnricher {
    pub fn new(api: Arc<dyn PipelineApi>, cache: Arc<OpportunityCache>, opts: TagOptions) -> Self {
        Self {
            api,
            cache,
            opts,
            in_flight: Arc::default(),
        }
    }

    pub fn sample_size(&self) -> usize {
        self.opts.sample
    }

    pub fn is_due(&self, pipeline_id: &Id) -> bool {
        match self.cache.tags(pipeline_id) {
            None => true,
            Some(snapshot) => {
                let max_age = if snapshot.complete {
                    self.cache.ttl()
                } else {
                    self.opts.retry_after_interrupt
                };
                snapshot.collected_at.elapsed() >= max_age
            }
        }
    }

    /// Starts a run unless one is already going or the stored counts are recent.
    /// Returns whether a run was started.
    pub fn maybe_start(&self, pipeline_id: &Id, contacts: Vec<Id>) -> bool {
        if contacts.is_empty() || !self.is_due(pipeline_id) {
            return false;
        }
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if !in_flight.insert(pipeline_id.clone()) {
                return false;
            }
        }

        tracing::info!(%pipeline_id, contacts = contacts.len(), "tag lookup started in background");
        let this = self.clone();
        let pipeline_id = pipeline_id.clone();
        tokio::spawn(async move {
            let run = count_tags(this.api.as_ref(), &contacts, this.opts.spacing).await;
            tracing::info!(
                %pipeline_id,
                looked_up = run.looked_up,
                unique_tags = run.counts.len(),
                complete = run.complete,
                "tag lookup finished"
            );
            this.cache.set_tags(&pipeline_id, run.counts, run.complete);
            this.in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&pipeline_id);
        });
        true
    }

    #[cfg(test)]
    fn is_running(&self, pipeline_id: &Id) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(pipeline_id)
    }
}
