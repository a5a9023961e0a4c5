//! Reconciliation loop keeping the instance cache in sync with the registry
//!
//! Each cycle optionally refreshes the address pool from the registry's own
//! instances, pulls every recorded provider with one incremental batch
//! query, replaces the updated entries wholesale, evicts providers nobody
//! looks up any more and rebuilds the optional indexes. Failures are logged
//! and absorbed; the loop only ends when the client is closed.

use crate::{
    cache::{
        InstanceCache,
        apply::{ApplyOutcome, EventApplier},
    },
    client::RegistryClient,
    config::{RegistryConfig, ServiceIdentity},
    health::HealthProbe,
    models::{FindService, ServiceKey, ServiceTags, VERSION_LATEST},
    runtime::{self, Spawner},
    watch::WatchCallback,
};
use futures::FutureExt;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Application the registry registers itself under
pub const REGISTRY_APP_ID: &str = "default";

/// Service name the registry registers itself under
pub const REGISTRY_SERVICE_NAME: &str = "SERVICECENTER";

#[derive(Debug, Clone)]
struct Provider {
    criteria: FindService,
    last_seen: Instant,
}

/// What one reconciliation cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Providers whose entry was replaced
    pub updated: Vec<String>,
    /// The registry reported nothing changed (or nothing was queried)
    pub not_modified: bool,
    /// Providers the registry failed to answer for
    pub failed: Vec<String>,
    /// Entries dropped because their provider is no longer recorded
    pub evicted: Vec<String>,
    /// Providers forgotten because they were idle past the TTL
    pub expired: Vec<String>,
    /// Pull error, if the query failed
    pub error: Option<String>,
}

/// Owns the reconciliation loop and the provider set
pub struct CacheManager {
    client: Arc<RegistryClient>,
    cache: Arc<InstanceCache>,
    probe: Arc<dyn HealthProbe>,
    spawner: Arc<dyn Spawner>,
    identity: ServiceIdentity,
    config: RegistryConfig,
    consumer_id: RwLock<String>,
    providers: RwLock<HashMap<String, Provider>>,
    schema_index: RwLock<HashMap<String, Vec<ServiceKey>>>,
    ip_index: RwLock<HashMap<String, ServiceTags>>,
    wake_tx: async_channel::Sender<()>,
    wake_rx: async_channel::Receiver<()>,
    running: AtomicBool,
}

impl CacheManager {
    /// Create a manager; nothing runs until [`CacheManager::start`]
    pub fn new(
        client: Arc<RegistryClient>,
        cache: Arc<InstanceCache>,
        probe: Arc<dyn HealthProbe>,
        spawner: Arc<dyn Spawner>,
        identity: ServiceIdentity,
        config: RegistryConfig,
    ) -> Self {
        let (wake_tx, wake_rx) = async_channel::bounded(1);
        Self {
            client,
            cache,
            probe,
            spawner,
            identity,
            config,
            consumer_id: RwLock::new(String::new()),
            providers: RwLock::new(HashMap::new()),
            schema_index: RwLock::new(HashMap::new()),
            ip_index: RwLock::new(HashMap::new()),
            wake_tx,
            wake_rx,
            running: AtomicBool::new(false),
        }
    }

    /// Instance cache fed by this manager
    pub fn cache(&self) -> &Arc<InstanceCache> {
        &self.cache
    }

    /// Service id sent as consumer on every query
    pub fn set_consumer_id(&self, consumer_id: &str) {
        if let Ok(mut current) = self.consumer_id.write() {
            *current = consumer_id.to_string();
        }
    }

    fn consumer_id(&self) -> String {
        self.consumer_id
            .read()
            .map(|id| id.clone())
            .unwrap_or_default()
    }

    /// Record a lookup of `service_name`; a first lookup wakes the loop
    pub fn record_provider(&self, service_name: &str) {
        let Ok(mut providers) = self.providers.write() else {
            return;
        };
        match providers.get_mut(service_name) {
            Some(provider) => provider.last_seen = Instant::now(),
            None => {
                let criteria = FindService::all_versions(self.identity.app_id.clone(), service_name)
                    .with_environment(self.identity.environment.clone());
                providers.insert(
                    service_name.to_string(),
                    Provider {
                        criteria,
                        last_seen: Instant::now(),
                    },
                );
                info!("Tracking provider {}", service_name);
                // An incremental query would answer 304 without the new provider
                self.client.reset_revision();
                // A full channel already holds a pending wake-up
                let _ = self.wake_tx.try_send(());
            }
        }
    }

    /// Stop tracking `service_name`; its entry goes at the next cycle
    pub fn remove_provider(&self, service_name: &str) -> bool {
        self.providers
            .write()
            .map(|mut providers| providers.remove(service_name).is_some())
            .unwrap_or(false)
    }

    /// Names of the tracked providers, sorted
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .providers
            .read()
            .map(|providers| providers.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Services exposing the schema `schema_id`
    pub fn services_for_interface(&self, schema_id: &str) -> Vec<ServiceKey> {
        self.schema_index
            .read()
            .ok()
            .and_then(|index| index.get(schema_id).cloned())
            .unwrap_or_default()
    }

    /// Service owning an instance on `ip`
    pub fn service_for_ip(&self, ip: &str) -> Option<ServiceTags> {
        self.ip_index
            .read()
            .ok()
            .and_then(|index| index.get(ip).cloned())
    }

    /// Run one reconciliation cycle
    pub async fn refresh(&self) -> CycleReport {
        let mut report = CycleReport::default();

        if self.config.auto_discovery {
            self.refresh_addresses().await;
        }

        report.expired = self.expire_providers();
        let mut criteria: Vec<FindService> = self
            .providers
            .read()
            .map(|providers| providers.values().map(|p| p.criteria.clone()).collect())
            .unwrap_or_default();
        criteria.sort_by(|a, b| a.service_name.cmp(&b.service_name));

        if criteria.is_empty() {
            debug!("No providers tracked, skipping pull");
            report.not_modified = true;
        } else {
            self.pull(&criteria, &mut report).await;
        }

        report.evicted = self.evict();

        if self.config.enable_schema_index {
            self.rebuild_schema_index().await;
        }
        if self.config.enable_ip_index {
            self.rebuild_ip_index();
        }
        report
    }

    async fn pull(&self, criteria: &[FindService], report: &mut CycleReport) {
        let consumer_id = self.consumer_id();
        match self.client.find_instances(&consumer_id, criteria).await {
            Ok(result) => {
                let mut grouped = result.regroup();
                for name in result.updated_names() {
                    let instances = grouped.remove(&name).unwrap_or_default();
                    let summary = self.cache.replace(&name, instances);
                    debug!(
                        "Provider {} refreshed: {} live, {} down",
                        name, summary.live, summary.down
                    );
                    report.updated.push(name);
                }
                for failed in &result.failed {
                    for index in &failed.indexes {
                        let name = result.name_of(*index).unwrap_or("?").to_string();
                        warn!(
                            "Registry failed to find {}: {} {}",
                            name, failed.error.error_code, failed.error.error_message
                        );
                        report.failed.push(name);
                    }
                }
                report.not_modified = report.updated.is_empty();
            }
            Err(e) if e.is_benign() => {
                debug!("Pull: {}", e);
                report.not_modified = true;
            }
            Err(e) => {
                warn!("Pull failed, next cycle does a full resync: {}", e);
                self.client.reset_revision();
                report.error = Some(e.to_string());
            }
        }
    }

    fn expire_providers(&self) -> Vec<String> {
        let Some(ttl) = self.config.provider_ttl() else {
            return Vec::new();
        };
        let Ok(mut providers) = self.providers.write() else {
            return Vec::new();
        };
        let mut expired: Vec<String> = providers
            .iter()
            .filter(|(_, p)| p.last_seen.elapsed() > ttl)
            .map(|(name, _)| name.clone())
            .collect();
        expired.sort();
        for name in &expired {
            providers.remove(name);
            info!("Provider {} idle for longer than {:?}, forgetting it", name, ttl);
        }
        expired
    }

    fn evict(&self) -> Vec<String> {
        let tracked: BTreeSet<String> = self.providers().into_iter().collect();
        let mut evicted = Vec::new();
        for name in self.cache.service_names() {
            if !tracked.contains(&name) && self.cache.remove(&name) {
                info!("Evicted cache entry for {}", name);
                evicted.push(name);
            }
        }
        evicted
    }

    async fn refresh_addresses(&self) {
        let criteria = FindService::new(REGISTRY_APP_ID, REGISTRY_SERVICE_NAME, VERSION_LATEST);
        match self
            .client
            .find_service_instances(&self.consumer_id(), &criteria)
            .await
        {
            Ok(instances) => {
                let addresses: Vec<String> = instances
                    .iter()
                    .filter(|instance| instance.status.is_live())
                    .flat_map(|instance| instance.endpoints.values().map(|e| e.address()))
                    .collect();
                if addresses.is_empty() {
                    debug!("Registry advertised no endpoints, keeping the pool");
                } else {
                    self.client.pool().set_addresses(addresses);
                }
            }
            Err(e) => warn!("Registry endpoint discovery failed: {}", e),
        }
    }

    async fn rebuild_schema_index(&self) {
        let services = match self.client.get_all_services().await {
            Ok(services) => services,
            Err(e) => {
                warn!("Schema index not rebuilt: {}", e);
                return;
            }
        };
        let mut index: HashMap<String, Vec<ServiceKey>> = HashMap::new();
        for service in &services {
            for schema_id in &service.schemas {
                index.entry(schema_id.clone()).or_default().push(service.key());
            }
        }
        debug!("Schema index holds {} interfaces", index.len());
        if let Ok(mut current) = self.schema_index.write() {
            *current = index;
        }
    }

    fn rebuild_ip_index(&self) {
        let mut index = HashMap::new();
        for name in self.cache.service_names() {
            let Some(instances) = self.cache.instances(&name) else {
                continue;
            };
            for instance in instances.iter() {
                for endpoint in instance.endpoints.values() {
                    index.insert(
                        endpoint.host.clone(),
                        ServiceTags {
                            service_name: name.clone(),
                            app_id: instance.app_id.clone(),
                            version: instance.version.clone(),
                        },
                    );
                }
            }
        }
        if let Ok(mut current) = self.ip_index.write() {
            *current = index;
        }
    }

    /// Callback applying push events to this manager's cache
    pub fn event_callback(&self) -> WatchCallback {
        let cache = self.cache.clone();
        let probe = self.probe.clone();
        let recheck_timeout = self.config.delete_recheck_timeout();
        Arc::new(move |event| {
            let cache = cache.clone();
            let probe = probe.clone();
            Box::pin(async move {
                let applier = EventApplier::new(&cache, probe.as_ref(), recheck_timeout);
                if applier.apply(event).await == ApplyOutcome::NoEntry {
                    debug!("Push event arrived before the first pull");
                }
            })
        })
    }

    /// Start the loop (and the watch on `own_service_id` when enabled)
    ///
    /// Returns false when the loop is already running.
    pub fn start(self: &Arc<Self>, own_service_id: Option<&str>) -> bool {
        if self.running.swap(true, Ordering::AcqRel) {
            debug!("Cache manager already running");
            return false;
        }

        if let Some(service_id) = own_service_id {
            self.set_consumer_id(service_id);
            if self.config.watch {
                self.client.spawn_watch(service_id, self.event_callback());
            }
        }

        let manager = Arc::clone(self);
        let interval = self.config.refresh_interval();
        self.spawner.spawn(Box::pin(async move {
            info!("Cache manager refreshing every {:?}", interval);
            manager.run(interval).await;
            manager.running.store(false, Ordering::Release);
            info!("Cache manager stopped");
        }));
        true
    }

    /// Whether the loop is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    async fn run(&self, interval: Duration) {
        let stop = self.client.stop_signal().clone();
        loop {
            let report = self.refresh().await;
            if let Some(e) = &report.error {
                error!("Reconciliation cycle failed: {}", e);
            }

            let stopped = futures::select! {
                _ = runtime::sleep(interval).fuse() => false,
                woken = self.wake_rx.recv().fuse() => woken.is_err(),
                _ = stop.stopped().fuse() => true,
            };
            if stopped || stop.is_stopped() {
                return;
            }
        }
    }

    /// Stop the loop at its next wake-up
    pub(crate) fn shutdown(&self) {
        self.wake_tx.close();
    }
}
