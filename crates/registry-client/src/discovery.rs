//! Discovery facade wiring the client, cache manager and heartbeats together

use crate::{
    address::AddressPool,
    cache::InstanceCache,
    client::{ClientOptions, RegistryClient},
    config::{RegistryConfig, ServiceIdentity},
    error::{Error, Result},
    health::{HealthProbe, TcpProbe},
    heartbeat::HeartbeatScheduler,
    manager::CacheManager,
    models::{InstanceStatus, MicroService, MicroServiceInstance, ServiceKey, Tags},
    runtime::Spawner,
    transport::{Connector, HttpTransport, Transport},
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// A service instance registered by this process
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SelfInstance {
    /// Owning service id
    pub service_id: String,
    /// Instance id
    pub instance_id: String,
}

/// Entry point for registering, discovering and keeping instances alive
pub struct ServiceDiscovery {
    config: RegistryConfig,
    identity: ServiceIdentity,
    client: Arc<RegistryClient>,
    manager: Arc<CacheManager>,
    heartbeats: HeartbeatScheduler,
    spawner: Arc<dyn Spawner>,
    own_service_id: RwLock<Option<String>>,
    self_instances: RwLock<Vec<SelfInstance>>,
    syncing: AtomicBool,
}

impl ServiceDiscovery {
    /// Connect over HTTP, with TLS when the configuration asks for it
    pub async fn connect(
        config: RegistryConfig,
        identity: ServiceIdentity,
        spawner: Arc<dyn Spawner>,
    ) -> Result<Self> {
        let connector = match &config.tls {
            #[cfg(feature = "tls")]
            Some(tls) => Connector::with_tls(crate::tls::TlsClientConfig::from_config(tls).await?),
            #[cfg(not(feature = "tls"))]
            Some(_) => {
                return Err(Error::Config(
                    "TLS configured but the tls feature is disabled".to_string(),
                ));
            }
            None => Connector::plain(),
        };
        let transport = Arc::new(HttpTransport::new(&connector)?);
        Self::new(config, identity, transport, connector, spawner)
    }

    /// Build from an explicit transport, probing deletes over TCP
    pub fn new(
        config: RegistryConfig,
        identity: ServiceIdentity,
        transport: Arc<dyn Transport>,
        connector: Connector,
        spawner: Arc<dyn Spawner>,
    ) -> Result<Self> {
        let probe = Arc::new(TcpProbe::new(config.probe_timeout()));
        Self::with_probe(config, identity, transport, connector, spawner, probe)
    }

    /// Build with a custom health probe for delete re-checks
    pub fn with_probe(
        config: RegistryConfig,
        identity: ServiceIdentity,
        transport: Arc<dyn Transport>,
        connector: Connector,
        spawner: Arc<dyn Spawner>,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<Self> {
        config.validate()?;
        identity.validate()?;

        let pool = Arc::new(AddressPool::new(
            config.addresses.clone(),
            config.probe_timeout(),
        ));
        let client = Arc::new(RegistryClient::new(
            pool,
            transport,
            connector,
            spawner.clone(),
            ClientOptions::from_config(&config),
        ));
        let manager = Arc::new(CacheManager::new(
            client.clone(),
            Arc::new(InstanceCache::new()),
            probe,
            spawner.clone(),
            identity.clone(),
            config.clone(),
        ));
        let heartbeats = HeartbeatScheduler::new(client.clone(), spawner.clone());

        Ok(Self {
            config,
            identity,
            client,
            manager,
            heartbeats,
            spawner,
            own_service_id: RwLock::new(None),
            self_instances: RwLock::new(Vec::new()),
            syncing: AtomicBool::new(false),
        })
    }

    /// Protocol client
    pub fn client(&self) -> &Arc<RegistryClient> {
        &self.client
    }

    /// Cache manager
    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }

    /// Heartbeat scheduler
    pub fn heartbeats(&self) -> &HeartbeatScheduler {
        &self.heartbeats
    }

    /// Identity of this process
    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    /// Cached live instances of `service_name` matching `tags`
    ///
    /// Never queries the registry: a miss returns an empty list and the
    /// provider is pulled by the next reconciliation cycle.
    pub async fn find_microservice_instances(
        &self,
        consumer_id: &str,
        service_name: &str,
        tags: &Tags,
    ) -> Result<Vec<MicroServiceInstance>> {
        if service_name.trim().is_empty() {
            return Err(Error::InvalidIdentity(
                "provider name cannot be empty".to_string(),
            ));
        }
        // Queries go out as this process once its own id is known
        if self.own_service_id().is_none() && !consumer_id.is_empty() {
            self.manager.set_consumer_id(consumer_id);
        }
        self.manager.record_provider(service_name);

        let instances = self.manager.cache().get(service_name, tags);
        if instances.is_empty() && !self.manager.cache().contains(service_name) {
            debug!("Cache miss for {}, waiting for the next pull", service_name);
        }
        Ok(instances)
    }

    /// Register `service` (create-or-return) and one instance of it
    pub async fn register_service_and_instance(
        &self,
        service: &MicroService,
        instance: &MicroServiceInstance,
    ) -> Result<(String, String)> {
        let service_id = self.client.register_service(service).await?;
        let instance_id = self.client.register_instance(&service_id, instance).await?;

        if let Ok(mut own) = self.own_service_id.write() {
            if own.is_none() || service.service_name == self.identity.service_name {
                *own = Some(service_id.clone());
            }
        }
        self.manager.set_consumer_id(&self.own_service_id().unwrap_or_else(|| service_id.clone()));

        if let Ok(mut instances) = self.self_instances.write() {
            let record = SelfInstance {
                service_id: service_id.clone(),
                instance_id: instance_id.clone(),
            };
            if !instances.contains(&record) {
                instances.push(record);
            }
        }

        if instance.wants_heartbeat() {
            let interval = instance
                .health_check
                .map(|hc| hc.interval)
                .filter(|secs| *secs > 0)
                .map(|secs| Duration::from_secs(u64::from(secs)))
                .unwrap_or_else(|| self.config.heartbeat_interval());
            self.heartbeats.add(&service_id, &instance_id, interval);
        } else {
            debug!("Instance {} uses pull health checks, no heartbeat", instance_id);
        }

        Ok((service_id, instance_id))
    }

    /// Send one heartbeat
    pub async fn heartbeat(&self, service_id: &str, instance_id: &str) -> Result<bool> {
        self.client.heartbeat(service_id, instance_id).await
    }

    /// Change an instance's status
    pub async fn update_instance_status(
        &self,
        service_id: &str,
        instance_id: &str,
        status: InstanceStatus,
    ) -> Result<()> {
        self.client
            .update_instance_status(service_id, instance_id, status)
            .await
    }

    /// Replace an instance's metadata
    pub async fn update_instance_properties(
        &self,
        service_id: &str,
        instance_id: &str,
        properties: &HashMap<String, String>,
    ) -> Result<()> {
        self.client
            .update_instance_properties(service_id, instance_id, properties)
            .await
    }

    /// Unregister an instance and stop its heartbeat
    ///
    /// On failure the instance stays registered, so its heartbeat keeps running.
    pub async fn unregister_instance(&self, service_id: &str, instance_id: &str) -> Result<()> {
        self.client.unregister_instance(service_id, instance_id).await?;
        self.heartbeats.remove(service_id, instance_id);
        if let Ok(mut instances) = self.self_instances.write() {
            instances.retain(|i| !(i.service_id == service_id && i.instance_id == instance_id));
        }
        Ok(())
    }

    /// Instances registered by this process
    pub fn self_instances(&self) -> Vec<SelfInstance> {
        self.self_instances
            .read()
            .map(|instances| instances.clone())
            .unwrap_or_default()
    }

    /// Service id of this process, once known
    pub fn own_service_id(&self) -> Option<String> {
        self.own_service_id.read().ok().and_then(|id| id.clone())
    }

    /// Start reconciliation, address probing and (if enabled) the own watch
    ///
    /// Fails when the own service is not registered. Calling it again while
    /// running is a no-op.
    pub async fn auto_sync(&self) -> Result<()> {
        if self.client.stop_signal().is_stopped() {
            return Err(Error::Closed);
        }
        if self.syncing.load(Ordering::Acquire) {
            debug!("Auto sync already running");
            return Ok(());
        }

        let service_id = match self.own_service_id() {
            Some(id) => id,
            None => {
                let key = ServiceKey {
                    app_id: self.identity.app_id.clone(),
                    service_name: self.identity.service_name.clone(),
                    version: self.identity.version.clone(),
                    environment: self.identity.environment.clone(),
                };
                let id = self.client.get_service_id(&key).await?.ok_or_else(|| {
                    Error::InvalidIdentity(format!("service {} is not registered", key))
                })?;
                if let Ok(mut own) = self.own_service_id.write() {
                    *own = Some(id.clone());
                }
                id
            }
        };

        if self.syncing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.client.pool().start_probing(
            self.spawner.as_ref(),
            self.config.probe_interval(),
            self.client.stop_signal().clone(),
        );
        self.manager.start(Some(&service_id));
        info!(
            "Auto sync started for {} ({})",
            self.identity.service_name, service_id
        );
        Ok(())
    }

    /// Stop every background task and close the client. Idempotent.
    pub fn close(&self) {
        self.heartbeats.stop_all();
        self.manager.shutdown();
        self.client.close();
        if self.syncing.swap(false, Ordering::AcqRel) {
            info!("Service discovery closed");
        }
    }
}

impl Drop for ServiceDiscovery {
    fn drop(&mut self) {
        if !self.client.stop_signal().is_stopped() {
            warn!("Service discovery dropped without close()");
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::StaticProbe;
    use crate::models::{HealthCheck, HealthCheckMode};
    use crate::runtime::SmolSpawner;
    use crate::transport::{HttpResponse, Method, mock::MockTransport};
    use serde_json::json;

    fn registry() -> MockTransport {
        MockTransport::new(|req| {
            let path = req.path.as_str();
            if path.contains("/existence") {
                Ok(HttpResponse::json(
                    400,
                    &json!({"errorCode": "400012", "errorMessage": "not found"}),
                ))
            } else if path.ends_with("/microservices") {
                Ok(HttpResponse::json(200, &json!({"serviceId": "s-1"})))
            } else if path.ends_with("/instances") {
                Ok(HttpResponse::json(200, &json!({"instanceId": "i-1"})))
            } else {
                Ok(HttpResponse::empty(200))
            }
        })
    }

    fn discovery(transport: MockTransport) -> ServiceDiscovery {
        ServiceDiscovery::with_probe(
            RegistryConfig::with_addresses(["10.0.0.1:30100"]),
            ServiceIdentity::new("cart", "1.0.0").with_app_id("shop"),
            Arc::new(transport),
            Connector::plain(),
            Arc::new(SmolSpawner),
            Arc::new(StaticProbe::new(false)),
        )
        .unwrap()
    }

    #[test]
    fn test_invalid_identity_is_fatal() {
        let result = ServiceDiscovery::new(
            RegistryConfig::default(),
            ServiceIdentity::new("", "1.0.0"),
            Arc::new(registry()),
            Connector::plain(),
            Arc::new(SmolSpawner),
        );
        assert!(matches!(result, Err(Error::InvalidIdentity(_))));
    }

    #[smol_potat::test]
    async fn test_register_schedules_heartbeat() {
        let discovery = discovery(registry());
        let service = MicroService::new("shop", "cart", "1.0.0");
        let instance = MicroServiceInstance::new("node-a");

        let (sid, iid) = discovery
            .register_service_and_instance(&service, &instance)
            .await
            .unwrap();
        assert_eq!((sid.as_str(), iid.as_str()), ("s-1", "i-1"));
        assert!(discovery.heartbeats().contains("s-1", "i-1"));
        assert_eq!(discovery.own_service_id().as_deref(), Some("s-1"));
        assert_eq!(discovery.self_instances().len(), 1);

        discovery.unregister_instance("s-1", "i-1").await.unwrap();
        assert!(!discovery.heartbeats().contains("s-1", "i-1"));
        assert!(discovery.self_instances().is_empty());
        discovery.close();
    }

    #[smol_potat::test]
    async fn test_failed_unregister_keeps_heartbeat() {
        let transport = MockTransport::new(|req| {
            let path = req.path.as_str();
            if req.method == Method::Delete {
                Ok(HttpResponse::json(
                    500,
                    &json!({"errorCode": "500003", "errorMessage": "storage down"}),
                ))
            } else if path.contains("/existence") {
                Ok(HttpResponse::json(
                    400,
                    &json!({"errorCode": "400012", "errorMessage": "not found"}),
                ))
            } else if path.ends_with("/microservices") {
                Ok(HttpResponse::json(200, &json!({"serviceId": "s-1"})))
            } else if path.ends_with("/instances") {
                Ok(HttpResponse::json(200, &json!({"instanceId": "i-1"})))
            } else {
                Ok(HttpResponse::empty(200))
            }
        });
        let discovery = discovery(transport);
        discovery
            .register_service_and_instance(
                &MicroService::new("shop", "cart", "1.0.0"),
                &MicroServiceInstance::new("node-a"),
            )
            .await
            .unwrap();

        assert!(discovery.unregister_instance("s-1", "i-1").await.is_err());
        assert!(discovery.heartbeats().contains("s-1", "i-1"));
        assert_eq!(discovery.self_instances().len(), 1);
        discovery.close();
    }

    #[smol_potat::test]
    async fn test_lookups_keep_own_consumer_id() {
        let transport = registry();
        let discovery = discovery(transport.clone());
        discovery
            .register_service_and_instance(
                &MicroService::new("shop", "cart", "1.0.0"),
                &MicroServiceInstance::new("node-a"),
            )
            .await
            .unwrap();

        discovery
            .find_microservice_instances("someone-else", "orders", &Tags::new())
            .await
            .unwrap();
        discovery.manager().refresh().await;

        let query = transport
            .requests()
            .into_iter()
            .find(|r| r.path.contains("/instances/action"))
            .unwrap();
        assert_eq!(query.header_value("X-ConsumerId"), Some("s-1"));
        discovery.close();
    }

    #[smol_potat::test]
    async fn test_pull_mode_skips_heartbeat() {
        let discovery = discovery(registry());
        let mut instance = MicroServiceInstance::new("node-a");
        instance.health_check = Some(HealthCheck {
            mode: HealthCheckMode::Pull,
            interval: 30,
            times: 3,
        });

        discovery
            .register_service_and_instance(&MicroService::new("shop", "cart", "1.0.0"), &instance)
            .await
            .unwrap();
        assert!(discovery.heartbeats().is_empty());
        discovery.close();
    }

    #[smol_potat::test]
    async fn test_lookup_miss_records_provider() {
        let discovery = discovery(registry());
        let found = discovery
            .find_microservice_instances("s-1", "orders", &Tags::new())
            .await
            .unwrap();
        assert!(found.is_empty());
        assert_eq!(discovery.manager().providers(), vec!["orders"]);

        assert!(
            discovery
                .find_microservice_instances("s-1", " ", &Tags::new())
                .await
                .is_err()
        );
        discovery.close();
    }

    #[smol_potat::test]
    async fn test_auto_sync_requires_registration() {
        let discovery = discovery(registry());
        let err = discovery.auto_sync().await.unwrap_err();
        assert!(matches!(err, Error::InvalidIdentity(_)));
        assert!(!discovery.manager().is_running());

        discovery
            .register_service_and_instance(
                &MicroService::new("shop", "cart", "1.0.0"),
                &MicroServiceInstance::new("node-a"),
            )
            .await
            .unwrap();
        discovery.auto_sync().await.unwrap();
        discovery.auto_sync().await.unwrap();
        assert!(discovery.manager().is_running());

        discovery.close();
        discovery.close();
        assert!(matches!(discovery.auto_sync().await, Err(Error::Closed)));
    }
}
