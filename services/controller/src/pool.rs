//! Live instance pool.
//!
//! Maps version key to its instance, in insertion order. Create/Destroy
//! mutate it; routing and the admin listing read ordered snapshots.

use std::collections::BTreeMap;
use std::sync::Arc;

use bisq_reconcile::LifecycleState;
use indexmap::IndexMap;
use tokio::sync::RwLock;

use crate::instance::AppInstance;

#[derive(Default)]
pub struct InstancePool {
    instances: RwLock<IndexMap<String, Arc<AppInstance>>>,
}

impl InstancePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `instance` under its key unless a live instance already holds
    /// the slot. A `Stopped` occupant is replaced and moved to the back.
    ///
    /// Returns false if the slot was taken.
    pub async fn claim(&self, instance: Arc<AppInstance>) -> bool {
        let mut instances = self.instances.write().await;
        if let Some(existing) = instances.get(instance.key()) {
            if existing.state().is_live() {
                return false;
            }
            instances.shift_remove(instance.key());
        }
        instances.insert(instance.key().to_string(), instance);
        true
    }

    /// Remove the entry for `instance`'s key if it is exactly `instance`.
    pub async fn release(&self, instance: &Arc<AppInstance>) -> bool {
        let mut instances = self.instances.write().await;
        match instances.get(instance.key()) {
            Some(existing) if Arc::ptr_eq(existing, instance) => {
                instances.shift_remove(instance.key());
                true
            }
            _ => false,
        }
    }

    pub async fn remove(&self, key: &str) -> Option<Arc<AppInstance>> {
        self.instances.write().await.shift_remove(key)
    }

    pub async fn get(&self, key: &str) -> Option<Arc<AppInstance>> {
        self.instances.read().await.get(key).cloned()
    }

    pub async fn contains(&self, instance: &Arc<AppInstance>) -> bool {
        self.instances
            .read()
            .await
            .get(instance.key())
            .is_some_and(|existing| Arc::ptr_eq(existing, instance))
    }

    /// Instances in insertion order.
    pub async fn snapshot(&self) -> Vec<Arc<AppInstance>> {
        self.instances.read().await.values().cloned().collect()
    }

    /// Current state per version key.
    pub async fn observed(&self) -> BTreeMap<String, LifecycleState> {
        self.instances
            .read()
            .await
            .iter()
            .map(|(key, instance)| (key.clone(), instance.state()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }

    /// Remove and return every instance.
    pub async fn drain(&self) -> Vec<Arc<AppInstance>> {
        self.instances.write().await.drain(..).map(|(_, i)| i).collect()
    }
}
