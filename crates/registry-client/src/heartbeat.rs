//! Periodic heartbeats for registered instances
//!
//! One background loop per (service id, instance id). A failed heartbeat is
//! logged and counted; only [`HeartbeatScheduler::remove`] ends a task.

use crate::client::RegistryClient;
use crate::runtime::{Spawner, StopSignal};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

type TaskKey = (String, String);

struct HeartbeatTask {
    stop: StopSignal,
    sent: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
}

/// Counters of one heartbeat task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartbeatStats {
    /// Heartbeats accepted by the registry
    pub sent: u64,
    /// Heartbeats that failed or were rejected
    pub failures: u64,
}

/// Schedules and owns heartbeat tasks
pub struct HeartbeatScheduler {
    client: Arc<RegistryClient>,
    spawner: Arc<dyn Spawner>,
    tasks: Mutex<HashMap<TaskKey, HeartbeatTask>>,
}

impl HeartbeatScheduler {
    /// Create a scheduler sending through `client`
    pub fn new(client: Arc<RegistryClient>, spawner: Arc<dyn Spawner>) -> Self {
        Self {
            client,
            spawner,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start heartbeating every `interval`; returns false if already scheduled
    pub fn add(&self, service_id: &str, instance_id: &str, interval: Duration) -> bool {
        let key = (service_id.to_string(), instance_id.to_string());
        let Ok(mut tasks) = self.tasks.lock() else {
            return false;
        };
        if tasks.contains_key(&key) {
            debug!("Heartbeat for {}/{} already scheduled", service_id, instance_id);
            return false;
        }

        let task = HeartbeatTask {
            stop: StopSignal::new(),
            sent: Arc::new(AtomicU64::new(0)),
            failures: Arc::new(AtomicU64::new(0)),
        };
        let stop = task.stop.clone();
        let sent = task.sent.clone();
        let failures = task.failures.clone();
        let client = self.client.clone();
        let (sid, iid) = key.clone();

        info!(
            "Scheduling heartbeat for {}/{} every {:?}",
            service_id, instance_id, interval
        );
        self.spawner.spawn(Box::pin(async move {
            while stop.sleep(interval).await {
                if client.stop_signal().is_stopped() {
                    break;
                }
                match client.heartbeat(&sid, &iid).await {
                    Ok(true) => {
                        sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(false) => {
                        failures.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        let count = failures.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(
                            "Heartbeat for {}/{} failed ({} so far): {}",
                            sid, iid, count, e
                        );
                    }
                }
            }
            debug!("Heartbeat for {}/{} stopped", sid, iid);
        }));

        tasks.insert(key, task);
        true
    }

    /// Stop and forget a task; returns whether one existed
    pub fn remove(&self, service_id: &str, instance_id: &str) -> bool {
        let key = (service_id.to_string(), instance_id.to_string());
        let removed = self
            .tasks
            .lock()
            .ok()
            .and_then(|mut tasks| tasks.remove(&key));
        match removed {
            Some(task) => {
                task.stop.stop();
                info!("Heartbeat for {}/{} removed", service_id, instance_id);
                true
            }
            None => false,
        }
    }

    /// Whether a task is scheduled
    pub fn contains(&self, service_id: &str, instance_id: &str) -> bool {
        let key = (service_id.to_string(), instance_id.to_string());
        self.tasks
            .lock()
            .map(|tasks| tasks.contains_key(&key))
            .unwrap_or(false)
    }

    /// Number of scheduled tasks
    pub fn len(&self) -> usize {
        self.tasks.lock().map(|tasks| tasks.len()).unwrap_or(0)
    }

    /// Whether no task is scheduled
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counters of a task
    pub fn stats(&self, service_id: &str, instance_id: &str) -> Option<HeartbeatStats> {
        let key = (service_id.to_string(), instance_id.to_string());
        let tasks = self.tasks.lock().ok()?;
        tasks.get(&key).map(|task| HeartbeatStats {
            sent: task.sent.load(Ordering::Relaxed),
            failures: task.failures.load(Ordering::Relaxed),
        })
    }

    /// Stop every task
    pub fn stop_all(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for (_, task) in tasks.drain() {
                task.stop.stop();
            }
        }
    }
}

impl Drop for HeartbeatScheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressPool;
    use crate::client::ClientOptions;
    use crate::runtime::{SmolSpawner, sleep};
    use crate::transport::{Connector, HttpResponse, mock::MockTransport};

    fn scheduler(transport: MockTransport) -> HeartbeatScheduler {
        let pool = Arc::new(AddressPool::new(["10.0.0.1:30100"], Duration::from_millis(100)));
        let spawner: Arc<dyn Spawner> = Arc::new(SmolSpawner);
        let client = Arc::new(RegistryClient::new(
            pool,
            Arc::new(transport),
            Connector::plain(),
            spawner.clone(),
            ClientOptions::default(),
        ));
        HeartbeatScheduler::new(client, spawner)
    }

    #[smol_potat::test]
    async fn test_heartbeats_until_removed() {
        let transport = MockTransport::new(|_| Ok(HttpResponse::empty(200)));
        let scheduler = scheduler(transport.clone());

        assert!(scheduler.add("s-1", "i-1", Duration::from_millis(10)));
        assert!(!scheduler.add("s-1", "i-1", Duration::from_millis(10)));
        assert!(scheduler.contains("s-1", "i-1"));
        assert_eq!(scheduler.len(), 1);

        sleep(Duration::from_millis(100)).await;
        assert!(scheduler.stats("s-1", "i-1").unwrap().sent >= 2);

        assert!(scheduler.remove("s-1", "i-1"));
        assert!(!scheduler.remove("s-1", "i-1"));
        assert!(scheduler.is_empty());

        sleep(Duration::from_millis(30)).await;
        let count = transport.requests().len();
        sleep(Duration::from_millis(60)).await;
        assert_eq!(transport.requests().len(), count);
        assert!(
            transport
                .requests()
                .iter()
                .all(|r| r.path.ends_with("/microservices/s-1/instances/i-1/heartbeat"))
        );
    }

    #[smol_potat::test]
    async fn test_failures_keep_task_alive() {
        let transport = MockTransport::new(|_| {
            Ok(HttpResponse::json(
                400,
                &serde_json::json!({"errorCode": "400017", "errorMessage": "gone"}),
            ))
        });
        let scheduler = scheduler(transport);

        scheduler.add("s-1", "i-1", Duration::from_millis(10));
        sleep(Duration::from_millis(80)).await;

        let stats = scheduler.stats("s-1", "i-1").unwrap();
        assert!(stats.failures >= 2);
        assert_eq!(stats.sent, 0);
        assert!(scheduler.contains("s-1", "i-1"));

        scheduler.stop_all();
        assert!(scheduler.is_empty());
    }
}
