use crate::config::env_or;
use crate::domain::aggregate::TagCount;
use crate::domain::pipeline::{Id, Opportunity};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

const DEFAULT_TTL_SECS: u64 = 300;
const STALE_WINDOWS: u32 = 3;
const EVENT_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub ttl: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(DEFAULT_TTL_SECS),
        }
    }
}

impl CacheOptions {
    pub fn from_env() -> Self {
        Self {
            ttl: Duration::from_secs(env_or("PIPELINES_CACHE_TTL_SECS", DEFAULT_TTL_SECS)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
    Fresh,
    Stale,
    Expired,
    Absent,
}

impl CacheState {
    pub fn is_usable(self) -> bool {
        matches!(self, CacheState::Fresh | CacheState::Stale)
    }
}

#[derive(Debug)]
pub struct CacheEntry {
    pub opportunities: Arc<Vec<Opportunity>>,
    pub stored_at: Instant,
    pub complete: bool,
}

impl CacheEntry {
    pub fn age(&self) -> Duration {
        self.stored_at.elapsed()
    }
}

#[derive(Debug, Clone)]
pub struct TagSnapshot {
    pub counts: Vec<TagCount>,
    pub collected_at: Instant,
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    OpportunitiesReplaced {
        pipeline_id: Id,
        records: usize,
        complete: bool,
    },
    TagsUpdated {
        pipeline_id: Id,
    },
    Cleared,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    pub pipeline_id: Id,
    pub state: CacheState,
    pub age_secs: Option<u64>,
    pub records: usize,
    pub complete: bool,
}

/// Opportunity writes are announced by the writer through [`OpportunityCache::publish`]; tag
/// writes and clears announce themselves.
#[derive(Debug)]
pub struct OpportunityCache {
    opts: CacheOptions,
    entries: RwLock<HashMap<Id, Arc<CacheEntry>>>,
    tags: RwLock<HashMap<Id, Arc<TagSnapshot>>>,
    events: broadcast::Sender<CacheEvent>,
}

impl Default for OpportunityCache {
    fn default() -> Self {
        Self::new(CacheOptions::default())
    }
}

impl OpportunityCache {
    pub fn new(opts: CacheOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            opts,
            entries: RwLock::new(HashMap::new()),
            tags: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.opts.ttl
    }

    pub fn state_for_age(&self, age: Duration) -> CacheState {
        if age < self.opts.ttl {
            CacheState::Fresh
        } else if age < self.opts.ttl.saturating_mul(STALE_WINDOWS) {
            CacheState::Stale
        } else {
            CacheState::Expired
        }
    }

    /// The stored entry with its current state, including expired entries.
    pub fn lookup(&self, pipeline_id: &Id) -> (Option<Arc<CacheEntry>>, CacheState) {
        let entry = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pipeline_id)
            .cloned();
        match entry {
            Some(entry) => {
                let state = self.state_for_age(entry.age());
                (Some(entry), state)
            }
            None => (None, CacheState::Absent),
        }
    }

    pub fn get(&self, pipeline_id: &Id) -> Option<Arc<CacheEntry>> {
        match self.lookup(pipeline_id) {
            (Some(entry), state) if state.is_usable() => Some(entry),
            _ => None,
        }
    }

    /// Replaces the entry for `pipeline_id` wholesale (last writer wins). Publishes nothing.
    pub fn set(&self, pipeline_id: &Id, opportunities: Vec<Opportunity>, complete: bool) -> Arc<CacheEntry> {
        let records = opportunities.len();
        let entry = Arc::new(CacheEntry {
            opportunities: Arc::new(opportunities),
            stored_at: Instant::now(),
            complete,
        });
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pipeline_id.clone(), entry.clone());

        tracing::info!(%pipeline_id, records, complete, "opportunity cache replaced");
        entry
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.tags
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        tracing::info!("opportunity cache cleared");
        self.publish(CacheEvent::Cleared);
    }

    pub fn tags(&self, pipeline_id: &Id) -> Option<Arc<TagSnapshot>> {
        self.tags
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pipeline_id)
            .cloned()
    }

    pub fn set_tags(&self, pipeline_id: &Id, counts: Vec<TagCount>, complete: bool) {
        let snapshot = Arc::new(TagSnapshot {
            counts,
            collected_at: Instant::now(),
            complete,
        });
        self.tags
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pipeline_id.clone(), snapshot);
        self.publish(CacheEvent::TagsUpdated {
            pipeline_id: pipeline_id.clone(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    pub fn status(&self, pipeline_id: &Id) -> CacheStatus {
        let (entry, state) = self.lookup(pipeline_id);
        CacheStatus {
            pipeline_id: pipeline_id.clone(),
            state,
            age_secs: entry.as_ref().map(|e| e.age().as_secs()),
            records: entry.as_ref().map_or(0, |e| e.opportunities.len()),
            complete: entry.as_ref().is_some_and(|e| e.complete),
        }
    }

    pub fn publish(&self, event: CacheEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::fake::opps;

    #[tokio::test(start_paused = true)]
    async fn entries_age_through_fresh_stale_expired() {
        let cache = OpportunityCache::default();
        let id = Id::from(1);
        assert_eq!(cache.lookup(&id).1, CacheState::Absent);

        cache.set(&id, opps(3), true);
        assert_eq!(cache.lookup(&id).1, CacheState::Fresh);

        tokio::time::advance(Duration::from_secs(300)).await;
        assert_eq!(cache.lookup(&id).1, CacheState::Stale);
        assert!(cache.get(&id).is_some());

        tokio::time::advance(Duration::from_secs(599)).await;
        assert_eq!(cache.lookup(&id).1, CacheState::Stale);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.lookup(&id).1, CacheState::Expired);
        assert!(cache.get(&id).is_none());
    }

    #[tokio::test]
    async fn snapshots_survive_replacement() {
        let cache = OpportunityCache::default();
        let id = Id::from(1);
        cache.set(&id, opps(2), false);
        let before = cache.get(&id).unwrap();

        cache.set(&id, opps(5), true);
        assert_eq!(before.opportunities.len(), 2);
        assert!(!before.complete);
        assert_eq!(cache.get(&id).unwrap().opportunities.len(), 5);
    }

    #[tokio::test]
    async fn entries_are_keyed_per_pipeline() {
        let cache = OpportunityCache::default();
        cache.set(&Id::from(1), opps(2), true);
        assert!(cache.get(&Id::from(2)).is_none());
        assert_eq!(cache.status(&Id::from(1)).records, 2);
    }

    #[tokio::test]
    async fn writes_and_clear_notify_subscribers() {
        let cache = OpportunityCache::default();
        let mut rx = cache.subscribe();
        let id = Id::from(9);

        cache.set(&id, opps(4), true);
        assert!(rx.try_recv().is_err());
        cache.publish(CacheEvent::OpportunitiesReplaced {
            pipeline_id: id.clone(),
            records: 4,
            complete: true,
        });
        cache.set_tags(&id, vec![TagCount { name: "vip".into(), count: 2 }], true);
        cache.clear();

        assert_eq!(
            rx.recv().await.unwrap(),
            CacheEvent::OpportunitiesReplaced {
                pipeline_id: id.clone(),
                records: 4,
                complete: true
            }
        );
        assert_eq!(rx.recv().await.unwrap(), CacheEvent::TagsUpdated { pipeline_id: id.clone() });
        assert_eq!(rx.recv().await.unwrap(), CacheEvent::Cleared);

        let status = cache.status(&id);
        assert_eq!(status.state, CacheState::Absent);
        assert_eq!(status.records, 0);
        assert!(cache.tags(&id).is_none());
    }

    #[test]
    fn status_serializes_for_the_api() {
        let cache = OpportunityCache::default();
        let v = serde_json::to_value(cache.status(&Id::from(3))).unwrap();
        assert_eq!(v["state"], "absent");
        assert_eq!(v["pipelineId"], "3");
        assert_eq!(v["ageSecs"], serde_json::Value::Null);
    }
}
