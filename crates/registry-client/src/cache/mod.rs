//! Typed, concurrently readable instance cache
//!
//! Keyed by provider service name. Each entry holds the live instances as
//! one shared list that is swapped atomically on every write, so readers see
//! either the old or the new list, never a partial one.

pub mod apply;

use crate::models::{MicroServiceInstance, Tags};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Cached state of one provider
#[derive(Debug, Clone, Default)]
pub struct CacheEntry {
    /// Live instances (status `UP` or `TESTING`)
    pub instances: Arc<Vec<MicroServiceInstance>>,
    /// Ids of instances the last pull reported but that are not live
    pub down: HashSet<String>,
    /// When the entry was last replaced by a pull
    pub pulled_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    /// Instances grouped by their canonical tag key
    pub fn groups(&self) -> BTreeMap<String, Vec<&MicroServiceInstance>> {
        let mut groups: BTreeMap<String, Vec<&MicroServiceInstance>> = BTreeMap::new();
        for instance in self.instances.iter() {
            groups
                .entry(instance.group_tags().key())
                .or_default()
                .push(instance);
        }
        groups
    }
}

/// Counts reported by [`InstanceCache::replace`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplaceSummary {
    /// Instances stored as live
    pub live: usize,
    /// Instances recorded as down
    pub down: usize,
    /// Instances rejected as malformed
    pub rejected: usize,
}

/// Instance cache shared by the cache manager and discovery lookups
#[derive(Debug, Default)]
pub struct InstanceCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl InstanceCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a provider's entry wholesale with the live subset of `instances`
    pub fn replace(&self, service_name: &str, instances: Vec<MicroServiceInstance>) -> ReplaceSummary {
        let mut summary = ReplaceSummary::default();
        let mut live = Vec::with_capacity(instances.len());
        let mut down = HashSet::new();

        for instance in instances {
            if instance.instance_id.is_empty() || instance.version.is_empty() {
                warn!(
                    "Dropping malformed instance of {} (id '{}', version '{}')",
                    service_name, instance.instance_id, instance.version
                );
                summary.rejected += 1;
            } else if instance.status.is_live() {
                live.push(instance);
            } else {
                debug!(
                    "Instance {} of {} is {}, recorded as down",
                    instance.instance_id, service_name, instance.status
                );
                down.insert(instance.instance_id);
            }
        }
        summary.live = live.len();
        summary.down = down.len();

        let entry = CacheEntry {
            instances: Arc::new(live),
            down,
            pulled_at: Some(Utc::now()),
        };
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(service_name.to_string(), entry);
        }
        summary
    }

    /// Live instances of `service_name` satisfying every tag in `tags`
    pub fn get(&self, service_name: &str, tags: &Tags) -> Vec<MicroServiceInstance> {
        let Some(instances) = self.instances(service_name) else {
            return Vec::new();
        };
        instances
            .iter()
            .filter(|instance| instance.matches(tags))
            .cloned()
            .collect()
    }

    /// Shared live list of `service_name`
    pub fn instances(&self, service_name: &str) -> Option<Arc<Vec<MicroServiceInstance>>> {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(service_name).map(|e| e.instances.clone()))
    }

    /// Snapshot of a whole entry
    pub fn entry(&self, service_name: &str) -> Option<CacheEntry> {
        self.entries
            .read()
            .ok()
            .and_then(|entries| entries.get(service_name).cloned())
    }

    /// Whether a pull has populated `service_name`
    pub fn contains(&self, service_name: &str) -> bool {
        self.entries
            .read()
            .map(|entries| entries.contains_key(service_name))
            .unwrap_or(false)
    }

    /// Drop a provider's entry; returns whether one existed
    pub fn remove(&self, service_name: &str) -> bool {
        self.entries
            .write()
            .map(|mut entries| entries.remove(service_name).is_some())
            .unwrap_or(false)
    }

    /// Names of every cached provider, sorted
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .read()
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Number of cached providers
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Edit the live list of an existing entry copy-on-write
    ///
    /// Returns `None` when `service_name` has no entry.
    pub(crate) fn update<R>(
        &self,
        service_name: &str,
        edit: impl FnOnce(&mut Vec<MicroServiceInstance>, &mut HashSet<String>) -> R,
    ) -> Option<R> {
        let mut entries = self.entries.write().ok()?;
        let entry = entries.get_mut(service_name)?;
        let mut instances = entry.instances.as_ref().clone();
        let result = edit(&mut instances, &mut entry.down);
        entry.instances = Arc::new(instances);
        Some(result)
    }
}
