use crate::aggregate::counts::{build_stage_aggregates, tally_by_stage, StageTally};
use crate::aggregate::tags::{TagEnricher, TagOptions};
use crate::collect::paginator::{Collector, CollectorOptions, StopReason};
use crate::collect::retry::RetryPolicy;
use crate::config::Settings;
use crate::domain::aggregate::PipelineAggregate;
use crate::domain::pipeline::{Id, Pipeline, Stage};
use crate::storage::cache::{CacheEntry, CacheEvent, CacheState, CacheStatus, OpportunityCache};
use crate::storage::lock::CollectionLocks;
use crate::time::range::{filter_opportunities, DateFilter};
use crate::upstream::error::{describe, UpstreamError};
use crate::upstream::http::HttpPipelineClient;
use crate::upstream::PipelineApi;
use anyhow::Context;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct AggregatorOptions {
    pub bounded_limit_filtered: u64,
    pub bounded_limit_unfiltered: u64,
    pub stale_refresh_delay: Duration,
    pub completion_delay_filtered: Duration,
    pub completion_delay_unfiltered: Duration,
    pub tags: TagOptions,
}

impl Default for AggregatorOptions {
    fn default() -> Self {
        Self {
            bounded_limit_filtered: 10_000,
            bounded_limit_unfiltered: 5_000,
            stale_refresh_delay: Duration::from_secs(1),
            completion_delay_filtered: Duration::from_secs(2),
            completion_delay_unfiltered: Duration::from_secs(60),
            tags: TagOptions::default(),
        }
    }
}

impl AggregatorOptions {
    pub fn from_env() -> Self {
        Self {
            tags: TagOptions::from_env(),
            ..Self::default()
        }
    }
}

/// Which upstream pipeline to aggregate: an explicit id wins, otherwise the first pipeline whose
/// name contains one of `names` (case-insensitive).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineTarget {
    pub id: Option<Id>,
    pub names: Vec<String>,
}

impl PipelineTarget {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            id: settings.target_pipeline_id.as_deref().map(Id::from),
            names: settings.target_pipeline_names.clone(),
        }
    }

    pub fn resolve<'a>(&self, pipelines: &'a [Pipeline]) -> Option<&'a Pipeline> {
        if let Some(id) = &self.id {
            if let Some(p) = pipelines.iter().find(|p| &p.id == id) {
                return Some(p);
            }
        }
        pipelines.iter().find(|p| {
            let name = p.name.to_lowercase();
            self.names
                .iter()
                .any(|n| !n.is_empty() && name.contains(&n.to_lowercase()))
        })
    }
}

struct Inner {
    api: Arc<dyn PipelineApi>,
    collector: Collector,
    cache: Arc<OpportunityCache>,
    locks: CollectionLocks,
    tags: TagEnricher,
    target: PipelineTarget,
    opts: AggregatorOptions,
    last_pipeline: Mutex<Option<Pipeline>>,
    refresh_scheduled: Mutex<HashSet<Id>>,
}

#[derive(Clone)]
pub struct PipelineService {
    inner: Arc<Inner>,
}

impl PipelineService {
    pub fn new(
        api: Arc<dyn PipelineApi>,
        cache: Arc<OpportunityCache>,
        collector: Collector,
        target: PipelineTarget,
        opts: AggregatorOptions,
    ) -> Self {
        let tags = TagEnricher::new(api.clone(), cache.clone(), opts.tags.clone());
        Self {
            inner: Arc::new(Inner {
                api,
                collector,
                cache,
                locks: CollectionLocks::new(),
                tags,
                target,
                opts,
                last_pipeline: Mutex::new(None),
                refresh_scheduled: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn from_settings(settings: &Settings, cache: Arc<OpportunityCache>) -> anyhow::Result<Self> {
        let api: Arc<dyn PipelineApi> = Arc::new(HttpPipelineClient::from_settings(settings)?);
        let collector = Collector::new(api.clone(), CollectorOptions::from_env(), RetryPolicy::default());
        Ok(Self::new(
            api,
            cache,
            collector,
            PipelineTarget::from_settings(settings),
            AggregatorOptions::from_env(),
        ))
    }

    /// Never fails: upstream errors come back as an aggregate with `error` set, unless a usable
    /// cached collection can answer instead.
    pub async fn get_pipelines_data(&self, filter: &DateFilter) -> PipelineAggregate {
        let started = Instant::now();
        match self.aggregate(filter).await {
            Ok(agg) => {
                tracing::info!(
                    pipeline_id = ?agg.pipeline_id,
                    stages = agg.stages.len(),
                    total = agg.total,
                    total_geral = agg.total_geral,
                    is_partial = agg.is_partial,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "pipeline aggregate ready"
                );
                agg
            }
            Err(err) => {
                let (kind, message) = describe(&err);
                if let Some(agg) = self.aggregate_from_cache(filter).await {
                    tracing::warn!(error = %format!("{err:#}"), ?kind, "upstream failed; answered from cache");
                    return agg;
                }
                tracing::error!(error = %format!("{err:#}"), ?kind, "failed to build pipeline aggregate");
                PipelineAggregate::failed(filter.is_active(), kind, message)
            }
        }
    }

    pub fn clear_opportunities_cache(&self) {
        self.inner.cache.clear();
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<CacheEvent> {
        self.inner.cache.subscribe()
    }

    pub fn cache_status(&self) -> Option<CacheStatus> {
        let id = self.known_pipeline().map(|p| p.id)?;
        Some(self.inner.cache.status(&id))
    }

    async fn aggregate(&self, filter: &DateFilter) -> anyhow::Result<PipelineAggregate> {
        let inner = &self.inner;
        let pipelines = inner
            .api
            .list_pipelines()
            .await
            .context("failed to list pipelines")?;

        let Some(pipeline) = inner.target.resolve(&pipelines).cloned() else {
            let available: Vec<&str> = pipelines.iter().map(|p| p.name.as_str()).collect();
            tracing::warn!(?available, target = ?inner.target, "no matching pipeline");
            return Ok(PipelineAggregate::empty(filter.is_active()));
        };
        *inner
            .last_pipeline
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(pipeline.clone());

        let stages = self.fetch_stages(&pipeline).await?;
        let entry = self.opportunities(&pipeline.id, filter).await?;
        Ok(self.build(&pipeline, &stages, &entry, filter, true))
    }

    async fn fetch_stages(&self, pipeline: &Pipeline) -> anyhow::Result<Vec<Stage>> {
        match self.inner.api.list_stages(&pipeline.id).await {
            Ok(stages) => Ok(stages),
            Err(err) if err.is_auth() => {
                Err(anyhow::Error::new(err).context("failed to list stages"))
            }
            Err(err) => {
                tracing::warn!(pipeline_id = %pipeline.id, error = %err, "failed to list stages; continuing without them");
                Ok(Vec::new())
            }
        }
    }

    async fn opportunities(&self, pipeline_id: &Id, filter: &DateFilter) -> anyhow::Result<Arc<CacheEntry>> {
        let inner = &self.inner;
        match inner.cache.lookup(pipeline_id) {
            (Some(entry), CacheState::Fresh) => {
                tracing::debug!(%pipeline_id, age_secs = entry.age().as_secs(), "opportunity cache hit");
                return Ok(entry);
            }
            (Some(entry), CacheState::Stale) => {
                tracing::info!(
                    %pipeline_id,
                    age_secs = entry.age().as_secs(),
                    "serving stale opportunities; refreshing in background"
                );
                self.schedule_refresh(pipeline_id, inner.opts.stale_refresh_delay);
                return Ok(entry);
            }
            (_, state) => {
                tracing::info!(%pipeline_id, ?state, "opportunity cache miss");
            }
        }

        let _guard = inner.locks.acquire(pipeline_id).await;
        if let Some(entry) = inner.cache.get(pipeline_id) {
            tracing::debug!(%pipeline_id, "opportunities collected while waiting");
            return Ok(entry);
        }

        let (limit, completion_delay) = if filter.is_active() {
            (inner.opts.bounded_limit_filtered, inner.opts.completion_delay_filtered)
        } else {
            (inner.opts.bounded_limit_unfiltered, inner.opts.completion_delay_unfiltered)
        };
        let collection = inner
            .collector
            .collect(pipeline_id, Some(limit))
            .await
            .context("failed to collect opportunities")?;

        if !collection.is_successful() {
            if collection.opportunities.is_empty() {
                let err = collection
                    .last_error
                    .unwrap_or_else(|| UpstreamError::Transport("collection stopped without data".into()));
                return Err(anyhow::Error::new(err).context("failed to collect opportunities"));
            }
            // Serve what arrived without caching it; try the full collection once the
            // upstream has had time to recover.
            tracing::warn!(
                %pipeline_id,
                collected = collection.opportunities.len(),
                stop = ?collection.stop,
                "serving uncached partial collection"
            );
            self.schedule_refresh(pipeline_id, inner.opts.completion_delay_unfiltered);
            return Ok(Arc::new(CacheEntry {
                opportunities: Arc::new(collection.opportunities),
                stored_at: Instant::now(),
                complete: false,
            }));
        }

        let capped = collection.stop == StopReason::RecordCap;
        let complete = collection.is_complete();
        let entry = inner.cache.set(pipeline_id, collection.opportunities, complete);
        if capped {
            tracing::info!(
                %pipeline_id,
                records = entry.opportunities.len(),
                ?completion_delay,
                "bounded load hit its cap; scheduling full collection"
            );
            self.schedule_refresh(pipeline_id, completion_delay);
        }
        Ok(entry)
    }

    /// Fire-and-forget unbounded collection. At most one is pending per pipeline, and it is
    /// skipped if another collection holds the pipeline when it wakes up.
    fn schedule_refresh(&self, pipeline_id: &Id, delay: Duration) {
        {
            let mut scheduled = self
                .inner
                .refresh_scheduled
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !scheduled.insert(pipeline_id.clone()) {
                tracing::debug!(%pipeline_id, "background refresh already scheduled");
                return;
            }
        }

        let this = self.clone();
        let pipeline_id = pipeline_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.inner
                .refresh_scheduled
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&pipeline_id);
            this.background_refresh(&pipeline_id).await;
        });
    }

    async fn background_refresh(&self, pipeline_id: &Id) {
        let inner = &self.inner;
        let Some(_guard) = inner.locks.try_acquire(pipeline_id) else {
            tracing::info!(%pipeline_id, "collection already in flight; skipping background refresh");
            return;
        };

        tracing::info!(%pipeline_id, "background refresh started");
        match inner.collector.collect(pipeline_id, None).await {
            Ok(collection) if collection.is_successful() => {
                let records = collection.opportunities.len();
                let complete = collection.is_complete();
                inner.cache.set(pipeline_id, collection.opportunities, complete);
                inner.cache.publish(CacheEvent::OpportunitiesReplaced {
                    pipeline_id: pipeline_id.clone(),
                    records,
                    complete,
                });
                tracing::info!(%pipeline_id, records, complete, "background refresh finished");
            }
            Ok(collection) => {
                tracing::warn!(
                    %pipeline_id,
                    collected = collection.opportunities.len(),
                    stop = ?collection.stop,
                    "background refresh stopped early; keeping cached entry"
                );
            }
            Err(err) => {
                tracing::warn!(%pipeline_id, error = %err, "background refresh failed; keeping cached entry");
            }
        }
    }

    fn build(
        &self,
        pipeline: &Pipeline,
        stages: &[Stage],
        entry: &CacheEntry,
        filter: &DateFilter,
        with_comparison: bool,
    ) -> PipelineAggregate {
        let all = entry.opportunities.as_slice();
        let current = filter_opportunities(all, filter);
        let tally = tally_by_stage(current.kept.iter().copied());

        let previous: Option<HashMap<Id, StageTally>> = if with_comparison {
            filter.previous_period().map(|period| {
                tracing::debug!(?period, "computing comparison period from cached opportunities");
                tally_by_stage(filter_opportunities(all, &period).kept.iter().copied())
            })
        } else {
            None
        };

        let stage_aggregates = build_stage_aggregates(pipeline, stages, &tally, previous.as_ref());
        let total_value = stage_aggregates.iter().map(|s| s.value).sum();

        let contacts: Vec<Id> = current
            .kept
            .iter()
            .take(self.inner.tags.sample_size())
            .filter_map(|o| o.contact_id.clone())
            .collect();
        self.inner.tags.maybe_start(&pipeline.id, contacts);
        let tags = self
            .inner
            .cache
            .tags(&pipeline.id)
            .map(|t| t.counts.clone())
            .unwrap_or_default();

        PipelineAggregate {
            stages: stage_aggregates,
            total: current.kept.len() as u64,
            total_geral: all.len() as u64,
            total_value,
            pipelines_count: 1,
            tags,
            pipeline_id: Some(pipeline.id.clone()),
            pipeline_name: Some(pipeline.name.clone()),
            has_comparison: previous.is_some(),
            has_date_filter: filter.is_active(),
            invalid_dates: current.invalid,
            is_partial: !entry.complete,
            error: None,
            error_kind: None,
        }
    }

    fn known_pipeline(&self) -> Option<Pipeline> {
        let last = self
            .inner
            .last_pipeline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        last.or_else(|| {
            self.inner.target.id.clone().map(|id| Pipeline {
                id,
                name: String::new(),
            })
        })
    }

    /// Answers from a usable cache entry when the main path failed. Stages get one more try
    /// and are left empty if that fails too; the comparison period is left out.
    async fn aggregate_from_cache(&self, filter: &DateFilter) -> Option<PipelineAggregate> {
        let pipeline = self.known_pipeline()?;
        let entry = self.inner.cache.get(&pipeline.id)?;
        let stages = match self.inner.api.list_stages(&pipeline.id).await {
            Ok(stages) => stages,
            Err(err) => {
                tracing::warn!(
                    pipeline_id = %pipeline.id,
                    error = %err,
                    "cache fallback could not list stages; continuing without them"
                );
                Vec::new()
            }
        };
        Some(self.build(&pipeline, &stages, &entry, filter, false))
    }
}
