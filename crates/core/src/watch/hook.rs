use crate::aggregate::service::PipelineService;
use crate::collect::retry::Backoff;
use crate::config::env_or;
use crate::domain::aggregate::PipelineAggregate;
use crate::storage::cache::CacheEvent;
use crate::time::range::DateFilter;
use crate::upstream::error::FailureKind;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

const DEFAULT_REFRESH_SECS: u64 = 300;

#[async_trait::async_trait]
pub trait AggregateSource: Send + Sync + 'static {
    async fn aggregate(&self, filter: &DateFilter) -> PipelineAggregate;
}

#[async_trait::async_trait]
impl AggregateSource for PipelineService {
    async fn aggregate(&self, filter: &DateFilter) -> PipelineAggregate {
        self.get_pipelines_data(filter).await
    }
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub refresh: Duration,
    pub rate_limit_backoff: Backoff,
    pub rate_limit_attempts: u32,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            refresh: Duration::from_secs(DEFAULT_REFRESH_SECS),
            rate_limit_backoff: Backoff::Linear {
                step: Duration::from_secs(60),
                max: Duration::from_secs(300),
            },
            rate_limit_attempts: 3,
        }
    }
}

impl WatchOptions {
    pub fn from_env() -> Self {
        Self {
            refresh: Duration::from_secs(env_or("PIPELINES_REFRESH_SECS", DEFAULT_REFRESH_SECS).max(1)),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineSnapshot {
    #[serde(flatten)]
    pub aggregate: PipelineAggregate,
    #[serde(flatten)]
    pub filter: DateFilter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Loading,
    Ready,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchState {
    pub data: Option<Arc<PipelineSnapshot>>,
    pub loading: bool,
    pub error: Option<String>,
    pub phase: Phase,
}

impl WatchState {
    fn idle() -> Self {
        Self {
            data: None,
            loading: false,
            error: None,
            phase: Phase::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Mount,
    Tick,
    FilterChanged,
    CacheUpdated,
    RateLimitRetry,
}

/// Loads on start, on every filter change, `refresh` after the previous load and whenever the
/// cache announces new data. Loads never overlap.
pub struct PipelineWatcher {
    state: watch::Receiver<WatchState>,
    filter: watch::Sender<DateFilter>,
    task: JoinHandle<()>,
}

impl PipelineWatcher {
    pub fn spawn(
        source: Arc<dyn AggregateSource>,
        events: Option<broadcast::Receiver<CacheEvent>>,
        opts: WatchOptions,
        filter: DateFilter,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(WatchState::idle());
        let (filter_tx, filter_rx) = watch::channel(filter);
        let driver = Driver {
            source,
            opts,
            state: state_tx,
            filter: filter_rx,
            events,
            rate_limit_attempts: 0,
            retry_at: None,
        };
        Self {
            state: state_rx,
            filter: filter_tx,
            task: tokio::spawn(driver.run()),
        }
    }

    pub fn state(&self) -> WatchState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<WatchState> {
        self.state.clone()
    }

    pub fn filter(&self) -> DateFilter {
        *self.filter.borrow()
    }

    /// Switches to `filter`. Returns false (and triggers nothing) when it is unchanged.
    pub fn set_filter(&self, filter: DateFilter) -> bool {
        self.filter.send_if_modified(|current| {
            if *current == filter {
                return false;
            }
            *current = filter;
            true
        })
    }

    pub fn shutdown(self) {}
}

impl Drop for PipelineWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Driver {
    source: Arc<dyn AggregateSource>,
    opts: WatchOptions,
    state: watch::Sender<WatchState>,
    filter: watch::Receiver<DateFilter>,
    events: Option<broadcast::Receiver<CacheEvent>>,
    rate_limit_attempts: u32,
    retry_at: Option<Instant>,
}

impl Driver {
    async fn run(mut self) {
        let mut interval =
            tokio::time::interval_at(Instant::now() + self.opts.refresh, self.opts.refresh);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut trigger = Some(Trigger::Mount);
        loop {
            if let Some(trigger) = trigger {
                let filter = *self.filter.borrow_and_update();
                self.load(filter, trigger).await;
                interval.reset();
            }

            trigger = tokio::select! {
                _ = interval.tick(), if self.retry_at.is_none() => Some(Trigger::Tick),
                changed = self.filter.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.rate_limit_attempts = 0;
                    self.retry_at = None;
                    Some(Trigger::FilterChanged)
                }
                _ = sleep_until_retry(self.retry_at) => {
                    self.retry_at = None;
                    Some(Trigger::RateLimitRetry)
                }
                reload = next_reload(&mut self.events) => {
                    if reload {
                        Some(Trigger::CacheUpdated)
                    } else {
                        self.events = None;
                        None
                    }
                }
            };
        }
        tracing::debug!("pipeline watcher stopped");
    }

    async fn load(&mut self, filter: DateFilter, trigger: Trigger) {
        self.state.send_modify(|s| {
            s.loading = true;
            if s.data.is_none() {
                s.phase = Phase::Loading;
            }
        });
        tracing::debug!(?trigger, ?filter, "loading pipeline aggregate");

        let agg = self.source.aggregate(&filter).await;

        if *self.filter.borrow() != filter {
            tracing::debug!(?filter, "filter changed during load; discarding result");
            return;
        }
        self.apply(filter, agg);
    }

    fn apply(&mut self, filter: DateFilter, agg: PipelineAggregate) {
        if agg.error.is_none() && (agg.is_displayable() || self.state.borrow().data.is_none()) {
            self.rate_limit_attempts = 0;
            self.state.send_modify(|s| {
                s.data = Some(Arc::new(PipelineSnapshot { aggregate: agg, filter }));
                s.error = None;
                s.loading = false;
                s.phase = Phase::Ready;
            });
            return;
        }

        if agg.error_kind == Some(FailureKind::RateLimited)
            && self.rate_limit_attempts < self.opts.rate_limit_attempts
        {
            self.rate_limit_attempts += 1;
            let wait = self.opts.rate_limit_backoff.delay(self.rate_limit_attempts);
            tracing::warn!(
                attempt = self.rate_limit_attempts,
                max_attempts = self.opts.rate_limit_attempts,
                ?wait,
                "rate limited; retrying pipeline load"
            );
            self.retry_at = Some(Instant::now() + wait);
            self.state.send_modify(|s| s.loading = false);
            return;
        }

        self.rate_limit_attempts = 0;
        let message = agg
            .error
            .unwrap_or_else(|| "no stage data returned; showing previous data".to_string());
        self.state.send_modify(|s| {
            if s.data.is_some() {
                tracing::warn!(error = %message, "load failed; keeping previous data");
            } else {
                tracing::error!(error = %message, "load failed");
            }
            s.error = Some(message);
            s.loading = false;
            s.phase = Phase::Error;
        });
    }
}

async fn sleep_until_retry(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// False once the channel is closed. Events queued behind the first one fold into one reload.
async fn next_reload(events: &mut Option<broadcast::Receiver<CacheEvent>>) -> bool {
    let Some(rx) = events.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(CacheEvent::Cleared) => continue,
            Ok(event) => {
                tracing::debug!(?event, "cache updated; reloading");
                break;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "cache events lagged; reloading");
                break;
            }
            Err(broadcast::error::RecvError::Closed) => return false,
        }
    }
    loop {
        match rx.try_recv() {
            Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregate::StageAggregate;
    use crate::domain::pipeline::Id;
    use crate::storage::cache::OpportunityCache;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Scripted {
        responses: Mutex<VecDeque<PipelineAggregate>>,
        fallback: PipelineAggregate,
        delay: Duration,
        calls: Mutex<Vec<(DateFilter, Instant)>>,
    }

    impl Scripted {
        fn new(responses: Vec<PipelineAggregate>, fallback: PipelineAggregate) -> Arc<Self> {
            Self::with_delay(responses, fallback, Duration::ZERO)
        }

        fn with_delay(
            responses: Vec<PipelineAggregate>,
            fallback: PipelineAggregate,
            delay: Duration,
        ) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                fallback,
                delay,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(DateFilter, Instant)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl AggregateSource for Scripted {
        async fn aggregate(&self, filter: &DateFilter) -> PipelineAggregate {
            self.calls.lock().unwrap().push((*filter, Instant::now()));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.responses.lock().unwrap().pop_front();
            next.unwrap_or_else(|| self.fallback.clone())
        }
    }

    fn good(count: u64) -> PipelineAggregate {
        PipelineAggregate {
            stages: vec![StageAggregate {
                id: Id::from(1),
                name: "Novo contato".into(),
                count,
                value: 0.0,
                pipeline_id: Id::from(10),
                pipeline_name: "Suporte".into(),
                previous_count: None,
                change: None,
                change_percent: None,
            }],
            total: count,
            total_geral: count,
            pipelines_count: 1,
            ..PipelineAggregate::empty(false)
        }
    }

    fn failed(kind: FailureKind) -> PipelineAggregate {
        PipelineAggregate::failed(false, kind, kind.user_message())
    }

    fn opts(refresh_secs: u64) -> WatchOptions {
        WatchOptions {
            refresh: Duration::from_secs(refresh_secs),
            ..WatchOptions::default()
        }
    }

    fn day(s: &str) -> Option<chrono::NaiveDate> {
        Some(chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap())
    }

    fn shown_count(state: &WatchState) -> Option<u64> {
        state.data.as_ref().map(|d| d.aggregate.total)
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_previous_data_when_a_later_load_fails() {
        let source = Scripted::new(vec![good(5)], failed(FailureKind::Server));
        let watcher = PipelineWatcher::spawn(source.clone(), None, opts(10), DateFilter::default());
        let mut rx = watcher.subscribe();

        rx.wait_for(|s| s.phase == Phase::Ready).await.unwrap();
        assert_eq!(shown_count(&watcher.state()), Some(5));

        rx.wait_for(|s| s.error.is_some()).await.unwrap();
        let state = watcher.state();
        assert_eq!(shown_count(&state), Some(5));
        assert_eq!(state.phase, Phase::Error);
        assert!(!state.loading);
        assert!(state.error.unwrap().contains("500"));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_result_after_good_data_keeps_data_and_warns() {
        let source = Scripted::new(vec![good(3)], PipelineAggregate::empty(false));
        let watcher = PipelineWatcher::spawn(source.clone(), None, opts(10), DateFilter::default());
        let mut rx = watcher.subscribe();

        rx.wait_for(|s| s.error.is_some()).await.unwrap();
        assert_eq!(shown_count(&watcher.state()), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_retries_with_growing_waits_then_surfaces() {
        let start = Instant::now();
        let source = Scripted::new(vec![], failed(FailureKind::RateLimited));
        let watcher = PipelineWatcher::spawn(source.clone(), None, opts(1000), DateFilter::default());
        let mut rx = watcher.subscribe();

        rx.wait_for(|s| s.error.is_some()).await.unwrap();
        let offsets: Vec<u64> = source
            .calls()
            .iter()
            .map(|(_, at)| (*at - start).as_secs())
            .collect();
        assert_eq!(offsets, vec![0, 60, 180, 360]);
        assert!(watcher.state().data.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn interval_is_suspended_while_a_retry_is_pending() {
        let start = Instant::now();
        let source = Scripted::new(vec![failed(FailureKind::RateLimited)], good(1));
        let watcher = PipelineWatcher::spawn(source.clone(), None, opts(30), DateFilter::default());
        let mut rx = watcher.subscribe();

        rx.wait_for(|s| s.data.is_some()).await.unwrap();
        let offsets: Vec<u64> = source
            .calls()
            .iter()
            .map(|(_, at)| (*at - start).as_secs())
            .collect();
        assert_eq!(offsets, vec![0, 60]);
    }

    #[tokio::test(start_paused = true)]
    async fn reloads_on_filter_change_only_when_it_differs() {
        let source = Scripted::new(vec![], good(1));
        let watcher = PipelineWatcher::spawn(source.clone(), None, opts(1000), DateFilter::default());
        let mut rx = watcher.subscribe();
        rx.wait_for(|s| s.phase == Phase::Ready).await.unwrap();

        assert!(!watcher.set_filter(DateFilter::default()));
        let january = DateFilter::new(day("2024-01-01"), day("2024-01-31"));
        assert!(watcher.set_filter(january));

        let state = rx
            .wait_for(|s| s.data.as_ref().is_some_and(|d| d.filter == january))
            .await
            .unwrap()
            .clone();
        assert!(!state.loading);
        assert_eq!(source.calls().len(), 2);
        assert_eq!(watcher.filter(), january);
    }

    #[tokio::test(start_paused = true)]
    async fn result_for_a_superseded_filter_is_discarded() {
        let source = Scripted::with_delay(vec![good(1), good(2)], good(9), Duration::from_secs(5));
        let first = DateFilter::new(day("2024-01-01"), None);
        let second = DateFilter::new(day("2024-02-01"), None);
        let watcher = PipelineWatcher::spawn(source.clone(), None, opts(1000), first);
        let mut rx = watcher.subscribe();

        tokio::time::sleep(Duration::from_secs(1)).await;
        watcher.set_filter(second);

        let state = rx.wait_for(|s| s.data.is_some()).await.unwrap().clone();
        let data = state.data.unwrap();
        assert_eq!(data.filter, second);
        assert_eq!(data.aggregate.total, 2);
        let filters: Vec<DateFilter> = source.calls().into_iter().map(|(f, _)| f).collect();
        assert_eq!(filters, vec![first, second]);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_updates_trigger_a_reload() {
        let cache = OpportunityCache::default();
        let source = Scripted::new(vec![good(1)], good(2));
        let watcher = PipelineWatcher::spawn(
            source.clone(),
            Some(cache.subscribe()),
            opts(1000),
            DateFilter::default(),
        );
        let mut rx = watcher.subscribe();
        rx.wait_for(|s| shown_count(s) == Some(1)).await.unwrap();

        cache.clear();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(source.calls().len(), 1, "clearing does not reload");

        cache.publish(CacheEvent::OpportunitiesReplaced {
            pipeline_id: Id::from(10),
            records: 2,
            complete: true,
        });
        rx.wait_for(|s| shown_count(s) == Some(2)).await.unwrap();
        assert_eq!(source.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_updates_during_a_load_are_deferred_into_one_reload() {
        let start = Instant::now();
        let cache = OpportunityCache::default();
        let source = Scripted::with_delay(vec![good(1)], good(2), Duration::from_secs(5));
        let watcher = PipelineWatcher::spawn(
            source.clone(),
            Some(cache.subscribe()),
            opts(1000),
            DateFilter::default(),
        );
        let mut rx = watcher.subscribe();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(watcher.state().loading);
        for records in [10, 20] {
            cache.publish(CacheEvent::OpportunitiesReplaced {
                pipeline_id: Id::from(10),
                records,
                complete: true,
            });
        }
        assert_eq!(source.calls().len(), 1, "no second load while one is in flight");

        rx.wait_for(|s| shown_count(s) == Some(2)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        let offsets: Vec<u64> = source
            .calls()
            .iter()
            .map(|(_, at)| (*at - start).as_secs())
            .collect();
        assert_eq!(offsets, vec![0, 5]);
        assert!(!watcher.state().loading);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_watcher_stops_reloads() {
        let source = Scripted::new(vec![], good(1));
        let watcher = PipelineWatcher::spawn(source.clone(), None, opts(10), DateFilter::default());
        let mut rx = watcher.subscribe();
        rx.wait_for(|s| s.phase == Phase::Ready).await.unwrap();

        watcher.shutdown();
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(source.calls().len(), 1);
    }

    #[test]
    fn snapshot_carries_filter_dates() {
        let snapshot = PipelineSnapshot {
            aggregate: good(4),
            filter: DateFilter::new(day("2024-01-01"), None),
        };
        let v = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(v["dateFrom"], "2024-01-01");
        assert_eq!(v["dateTo"], serde_json::Value::Null);
        assert_eq!(v["total"], 4);
        assert_eq!(v["stages"][0]["name"], "Novo contato");
    }
}
