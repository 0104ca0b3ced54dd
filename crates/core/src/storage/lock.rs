use crate::domain::pipeline::Id;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

pub type CollectionGuard = OwnedMutexGuard<()>;

/// Foreground loads wait their turn with [`CollectionLocks::acquire`] and re-check the cache
/// once they hold the guard. Background refreshes use [`CollectionLocks::try_acquire`] and skip
/// the run when another collection for the same pipeline is already going.
#[derive(Debug, Default)]
pub struct CollectionLocks {
    slots: Mutex<HashMap<Id, Arc<tokio::sync::Mutex<()>>>>,
}

impl CollectionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, pipeline_id: &Id) -> Arc<tokio::sync::Mutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(pipeline_id.clone()).or_default().clone()
    }

    pub async fn acquire(&self, pipeline_id: &Id) -> CollectionGuard {
        let slot = self.slot(pipeline_id);
        if slot.try_lock().is_err() {
            tracing::debug!(%pipeline_id, "waiting for in-flight collection");
        }
        slot.lock_owned().await
    }

    pub fn try_acquire(&self, pipeline_id: &Id) -> Option<CollectionGuard> {
        self.slot(pipeline_id).try_lock_owned().ok()
    }

    #[cfg(test)]
    fn is_running(&self, pipeline_id: &Id) -> bool {
        self.slot(pipeline_id).try_lock().is_err()
    }
}
