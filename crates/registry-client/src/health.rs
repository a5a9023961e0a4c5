//! Direct reachability checks for cached instances
//!
//! Used before a push `DELETE` is applied: an instance that still answers is
//! kept, the registry's view is presumed stale.

use crate::models::MicroServiceInstance;
use crate::runtime;
use async_net::TcpStream;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Outcome of one reachability check
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum HealthStatus {
    /// At least one endpoint answered
    Healthy,
    /// No endpoint answered
    Unhealthy(String),
    /// Nothing to check against
    Unknown,
}

impl HealthStatus {
    /// Whether the instance should be treated as alive
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Checks whether an instance is reachable right now
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe `instance`
    async fn check(&self, instance: &MicroServiceInstance) -> HealthStatus;
}

/// Dials the instance's endpoints over TCP
#[derive(Debug, Clone)]
pub struct TcpProbe {
    dial_timeout: Duration,
}

impl TcpProbe {
    /// Create a probe giving each dial `dial_timeout`
    pub fn new(dial_timeout: Duration) -> Self {
        Self { dial_timeout }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn check(&self, instance: &MicroServiceInstance) -> HealthStatus {
        if instance.endpoints.is_empty() {
            return HealthStatus::Unknown;
        }

        let mut last_error = String::new();
        for (protocol, endpoint) in &instance.endpoints {
            let address = endpoint.address();
            match runtime::timeout(self.dial_timeout, TcpStream::connect(address.as_str())).await {
                Ok(Ok(_)) => {
                    debug!(
                        "Instance {} reachable on {} {}",
                        instance.instance_id, protocol, address
                    );
                    return HealthStatus::Healthy;
                }
                Ok(Err(e)) => last_error = format!("{}: {}", address, e),
                Err(e) => last_error = format!("{}: {}", address, e),
            }
        }
        HealthStatus::Unhealthy(last_error)
    }
}

/// Probe answering with a fixed status
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug)]
pub struct StaticProbe {
    healthy: std::sync::atomic::AtomicBool,
    delay: Duration,
}

#[cfg(any(test, feature = "test-utils"))]
impl StaticProbe {
    /// Probe reporting every instance healthy (or not)
    pub fn new(healthy: bool) -> Self {
        Self {
            healthy: std::sync::atomic::AtomicBool::new(healthy),
            delay: Duration::ZERO,
        }
    }

    /// Answer only after `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Change the reported status
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy
            .store(healthy, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(any(test, feature = "test-utils"))]
#[async_trait]
impl HealthProbe for StaticProbe {
    async fn check(&self, _instance: &MicroServiceInstance) -> HealthStatus {
        if !self.delay.is_zero() {
            runtime::sleep(self.delay).await;
        }
        if self.healthy.load(std::sync::atomic::Ordering::SeqCst) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy("static".to_string())
        }
    }
}
