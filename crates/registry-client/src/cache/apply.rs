//! Applying push events to the instance cache
//!
//! Pull replaces an entry wholesale; push edits whatever entry is current.
//! Neither side is version-stamped, the later write wins.

use super::InstanceCache;
use crate::health::HealthProbe;
use crate::models::{EventAction, InstanceStatus, MicroServiceInstance, WatchEvent};
use crate::runtime;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What applying one event did to the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Instance appended to the entry
    Appended,
    /// Instance with the same id replaced in place
    Replaced,
    /// Instance removed after its re-check failed
    Removed,
    /// Delete ignored because the instance still answers
    KeptAlive,
    /// Instance not up or malformed, event discarded
    Rejected,
    /// No pull has populated the entry yet, event dropped
    NoEntry,
    /// Nothing to do (unknown action, missing instance, absent id)
    Ignored,
}

/// Applies push events, re-checking health before deletes
pub struct EventApplier<'a> {
    cache: &'a InstanceCache,
    probe: &'a dyn HealthProbe,
    recheck_timeout: Duration,
}

impl<'a> EventApplier<'a> {
    /// Create an applier; a delete re-check taking longer than
    /// `recheck_timeout` counts as failed
    pub fn new(cache: &'a InstanceCache, probe: &'a dyn HealthProbe, recheck_timeout: Duration) -> Self {
        Self {
            cache,
            probe,
            recheck_timeout,
        }
    }

    /// Apply one event
    pub async fn apply(&self, event: WatchEvent) -> ApplyOutcome {
        let service_name = event.key.service_name.clone();
        let Some(instance) = event.instance else {
            debug!("Watch event {:?} for {} carries no instance", event.action, service_name);
            return ApplyOutcome::Ignored;
        };

        match event.action {
            EventAction::Create | EventAction::Update => self.upsert(&service_name, event.action, instance),
            EventAction::Delete => self.delete(&service_name, instance).await,
            EventAction::Error | EventAction::Unknown => {
                warn!("Ignoring watch event {:?} for {}", event.action, service_name);
                ApplyOutcome::Ignored
            }
        }
    }

    fn upsert(&self, service_name: &str, action: EventAction, instance: MicroServiceInstance) -> ApplyOutcome {
        if !self.cache.contains(service_name) {
            error!(
                "{:?} event for {} dropped, service not cached yet",
                action, service_name
            );
            return ApplyOutcome::NoEntry;
        }
        if instance.instance_id.is_empty() || instance.version.is_empty() {
            warn!(
                "{:?} event for {} discarded, malformed instance (id '{}', version '{}')",
                action, service_name, instance.instance_id, instance.version
            );
            return ApplyOutcome::Rejected;
        }
        // Pushes only ever add instances that are up
        if instance.status != InstanceStatus::Up {
            warn!(
                "{:?} event for {} discarded, instance {} is {}",
                action, service_name, instance.instance_id, instance.status
            );
            return ApplyOutcome::Rejected;
        }

        let instance_id = instance.instance_id.clone();
        let outcome = self.cache.update(service_name, |instances, down| {
            down.remove(&instance.instance_id);
            match instances
                .iter_mut()
                .find(|cached| cached.instance_id == instance.instance_id)
            {
                Some(cached) => {
                    *cached = instance;
                    ApplyOutcome::Replaced
                }
                None => {
                    instances.push(instance);
                    ApplyOutcome::Appended
                }
            }
        });

        match outcome {
            Some(outcome) => {
                debug!("{:?} {} of {}: {:?}", action, instance_id, service_name, outcome);
                outcome
            }
            // Evicted between the check and the write
            None => ApplyOutcome::NoEntry,
        }
    }

    async fn delete(&self, service_name: &str, instance: MicroServiceInstance) -> ApplyOutcome {
        if !self.cache.contains(service_name) {
            error!("Delete event for {} dropped, service not cached yet", service_name);
            return ApplyOutcome::NoEntry;
        }

        let alive = runtime::timeout(self.recheck_timeout, self.probe.check(&instance))
            .await
            .map(|status| status.is_healthy())
            .unwrap_or(false);
        if alive {
            info!(
                "Instance {} of {} still answers, ignoring delete",
                instance.instance_id, service_name
            );
            return ApplyOutcome::KeptAlive;
        }

        let removed = self.cache.update(service_name, |instances, down| {
            down.remove(&instance.instance_id);
            let before = instances.len();
            instances.retain(|cached| cached.instance_id != instance.instance_id);
            before != instances.len()
        });
        match removed {
            Some(true) => {
                info!("Removed instance {} of {}", instance.instance_id, service_name);
                ApplyOutcome::Removed
            }
            Some(false) => ApplyOutcome::Ignored,
            None => ApplyOutcome::NoEntry,
        }
    }
}
