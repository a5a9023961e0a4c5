//! Runtime-agnostic client for a ServiceComb-style service center
//!
//! This crate registers services and instances with a remote registry, keeps
//! them alive with heartbeats and maintains a local cache of the instances
//! of every provider the process looks up.
//!
//! # Architecture
//!
//! - [`AddressPool`] picks registry endpoints round robin and probes them
//! - [`RegistryClient`] speaks the registry's JSON API and push stream
//! - [`CacheManager`] reconciles the [`InstanceCache`] on a ticker and
//!   applies push events between ticks
//! - [`HeartbeatScheduler`] keeps registered instances alive
//! - [`ServiceDiscovery`] ties them together
//!
//! The crate never picks an executor. Background loops go through a
//! [`Spawner`](runtime::Spawner); timers come from the `smol` (default) or
//! `tokio` feature. Networking uses `async-net`, the push stream
//! `async-tungstenite` without runtime features.
//!
//! # Example
//!
//! ```no_run
//! use registry_client::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> registry_client::Result<()> {
//! let config = RegistryConfig::with_addresses(["127.0.0.1:30100"]);
//! let identity = ServiceIdentity::new("cart", "1.0.0").with_app_id("shop");
//! let discovery = ServiceDiscovery::connect(config, identity, Arc::new(SmolSpawner)).await?;
//!
//! let service = MicroService::new("shop", "cart", "1.0.0");
//! let instance = MicroServiceInstance::new("node-a")
//!     .with_endpoint("rest", Endpoint::new("10.0.0.5", 8080, false));
//! let (service_id, _) = discovery.register_service_and_instance(&service, &instance).await?;
//! discovery.auto_sync().await?;
//!
//! // Empty until the next reconciliation cycle has pulled "orders"
//! let orders = discovery
//!     .find_microservice_instances(&service_id, "orders", &Tags::new())
//!     .await?;
//! # let _ = orders;
//! discovery.close();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod address;
pub mod backoff;
pub mod cache;
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod health;
pub mod heartbeat;
pub mod manager;
pub mod models;
pub mod runtime;
#[cfg(feature = "tls")]
pub mod tls;
pub mod transport;
pub mod watch;

pub use address::{AddressPool, DEFAULT_ADDRESS};
pub use backoff::{Backoff, BackoffKind};
pub use cache::{InstanceCache, apply::ApplyOutcome};
pub use client::{FindInstancesResult, RegistryClient};
pub use config::{RegistryConfig, ServiceIdentity, TlsConfig};
pub use discovery::ServiceDiscovery;
pub use error::{Error, Result};
pub use health::{HealthProbe, HealthStatus, TcpProbe};
pub use heartbeat::HeartbeatScheduler;
pub use manager::{CacheManager, CycleReport};
pub use models::*;
pub use runtime::StopSignal;
#[cfg(feature = "tls")]
pub use tls::{TlsClientConfig, TlsProvider, TlsRole};
pub use transport::{Connector, HttpTransport, Transport};
pub use watch::WatchCallback;

/// Re-export key types for convenience
pub mod prelude {
    #[cfg(feature = "smol")]
    pub use crate::runtime::SmolSpawner;
    #[cfg(feature = "tokio")]
    pub use crate::runtime::TokioSpawner;
    pub use crate::{
        Endpoint, Error, InstanceStatus, MicroService, MicroServiceInstance, RegistryConfig,
        Result, ServiceDiscovery, ServiceIdentity, Tags,
    };
}
