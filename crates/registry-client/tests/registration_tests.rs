//! Registration, heartbeat and instance management against an in-process registry

use registry_client::models::{HealthCheck, HealthCheckMode};
use registry_client::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

mod common;
use common::{FakeRegistry, dead_address, eventually, init_tracing};

async fn discovery_for(addresses: Vec<String>) -> ServiceDiscovery {
    let config = RegistryConfig::with_addresses(addresses);
    let identity = ServiceIdentity::new("cart", "1.0.0").with_app_id("shop");
    ServiceDiscovery::connect(config, identity, Arc::new(SmolSpawner))
        .await
        .unwrap()
}

fn instance(heartbeat_secs: u32) -> MicroServiceInstance {
    let mut instance = MicroServiceInstance::new("node-a")
        .with_endpoint("rest", Endpoint::new("127.0.0.1", 8080, false));
    instance.version = "1.0.0".to_string();
    instance.health_check = Some(HealthCheck {
        mode: HealthCheckMode::Push,
        interval: heartbeat_secs,
        times: 3,
    });
    instance
}

#[smol_potat::test]
async fn test_register_is_create_or_return() {
    init_tracing();
    let registry = FakeRegistry::start().await;
    let discovery = discovery_for(vec![registry.address.clone()]).await;
    let service = MicroService::new("shop", "cart", "1.0.0");

    let (first_sid, first_iid) = discovery
        .register_service_and_instance(&service, &instance(30))
        .await
        .unwrap();
    let (second_sid, second_iid) = discovery
        .register_service_and_instance(&service, &instance(30))
        .await
        .unwrap();

    assert_eq!(first_sid, second_sid);
    assert_ne!(first_iid, second_iid);
    assert_eq!(registry.instances("cart").len(), 2);
    let creates = registry
        .requests()
        .iter()
        .filter(|r| r.ends_with("/registry/microservices") && r.starts_with("POST"))
        .count();
    assert_eq!(creates, 1);

    discovery.close();
}

#[smol_potat::test]
async fn test_heartbeat_until_unregistered() {
    init_tracing();
    let registry = FakeRegistry::start().await;
    let discovery = discovery_for(vec![registry.address.clone()]).await;

    let (sid, iid) = discovery
        .register_service_and_instance(&MicroService::new("shop", "cart", "1.0.0"), &instance(1))
        .await
        .unwrap();
    assert!(eventually(|| registry.heartbeats(&iid) >= 1).await);
    assert!(discovery.heartbeat(&sid, &iid).await.unwrap());

    discovery.unregister_instance(&sid, &iid).await.unwrap();
    assert!(registry.instances("cart").is_empty());
    assert!(!discovery.heartbeats().contains(&sid, &iid));

    let err = discovery.heartbeat(&sid, &iid).await.unwrap_err();
    assert!(err.is_not_exists());

    discovery.close();
}

#[smol_potat::test]
async fn test_status_and_properties_updates() {
    init_tracing();
    let registry = FakeRegistry::start().await;
    let discovery = discovery_for(vec![registry.address.clone()]).await;
    let (sid, iid) = discovery
        .register_service_and_instance(&MicroService::new("shop", "cart", "1.0.0"), &instance(30))
        .await
        .unwrap();

    discovery
        .update_instance_status(&sid, &iid, InstanceStatus::Down)
        .await
        .unwrap();
    let properties = HashMap::from([("zone".to_string(), "b".to_string())]);
    discovery
        .update_instance_properties(&sid, &iid, &properties)
        .await
        .unwrap();

    let stored = &registry.instances("cart")[0];
    assert_eq!(stored.status, InstanceStatus::Down);
    assert_eq!(stored.metadata, properties);

    let err = discovery
        .update_instance_status(&sid, "unknown", InstanceStatus::Up)
        .await
        .unwrap_err();
    assert!(err.is_not_exists());

    discovery.close();
}

#[smol_potat::test]
async fn test_service_and_schema_queries() {
    init_tracing();
    let registry = FakeRegistry::start().await;
    let orders = registry.add_service("shop", "orders", "2.1.0");
    let discovery = discovery_for(vec![registry.address.clone()]).await;
    let client = discovery.client();

    let service = client.get_service(&orders).await.unwrap();
    assert_eq!(service.service_name, "orders");
    assert!(matches!(
        client.get_service("missing").await,
        Err(Error::ServiceNotExists(_))
    ));

    let all = client.get_all_services().await.unwrap();
    assert_eq!(all.len(), 1);

    let schema = client.get_schema(&orders, "OrderApi").await.unwrap();
    assert!(schema.contains("OrderApi"));

    discovery.close();
}

#[smol_potat::test]
async fn test_failover_to_reachable_address() {
    init_tracing();
    let registry = FakeRegistry::start().await;
    let dead = dead_address().await;
    let discovery = discovery_for(vec![dead.clone(), registry.address.clone()]).await;

    for _ in 0..3 {
        discovery
            .register_service_and_instance(&MicroService::new("shop", "cart", "1.0.0"), &instance(30))
            .await
            .unwrap();
    }

    let statuses = discovery.client().pool().addresses();
    assert!(statuses.iter().any(|s| s.address == dead && !s.available));
    assert!(
        statuses
            .iter()
            .any(|s| s.address == registry.address && s.available)
    );

    discovery.close();
}
