//! Registry endpoint pool with reachability probing
//!
//! Endpoint selection never fails: when every tracked address is flagged
//! unavailable the pool hands out [`DEFAULT_ADDRESS`], so callers always
//! have something to try.

use crate::runtime::{self, Spawner, StopSignal};
use async_net::TcpStream;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Address used when no tracked endpoint is available
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:30100";

#[derive(Debug, Clone)]
struct AddressEntry {
    address: String,
    available: bool,
}

/// Round-robin pool of registry endpoints
#[derive(Debug)]
pub struct AddressPool {
    entries: RwLock<Vec<AddressEntry>>,
    next: AtomicUsize,
    probing: AtomicBool,
    probe_timeout: Duration,
}

/// Clears the probing flag however the probe ends, including a dropped future
struct ProbingGuard<'a>(&'a AtomicBool);

impl Drop for ProbingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Snapshot of one tracked endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressStatus {
    /// `host:port`
    pub address: String,
    /// Result of the last probe (or of the last connection attempt)
    pub available: bool,
}

impl AddressPool {
    /// Create a pool tracking `addresses`, all flagged available
    pub fn new<I, S>(addresses: I, probe_timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pool = Self {
            entries: RwLock::new(Vec::new()),
            next: AtomicUsize::new(0),
            probing: AtomicBool::new(false),
            probe_timeout,
        };
        pool.set_addresses(addresses);
        pool
    }

    /// Replace the tracked set; every address starts out available
    pub fn set_addresses<I, S>(&self, addresses: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut fresh: Vec<AddressEntry> = Vec::new();
        for address in addresses {
            let address = address.into();
            if !fresh.iter().any(|e| e.address == address) {
                fresh.push(AddressEntry {
                    address,
                    available: true,
                });
            }
        }
        debug!("Address pool set to {} endpoints", fresh.len());
        if let Ok(mut entries) = self.entries.write() {
            *entries = fresh;
        }
    }

    /// Pick the next available endpoint in round-robin order
    pub fn available_address(&self) -> String {
        let entries = match self.entries.read() {
            Ok(entries) => entries,
            Err(_) => return DEFAULT_ADDRESS.to_string(),
        };
        let available: Vec<&AddressEntry> = entries.iter().filter(|e| e.available).collect();
        if available.is_empty() {
            debug!("No available registry address, using {}", DEFAULT_ADDRESS);
            return DEFAULT_ADDRESS.to_string();
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % available.len();
        available[index].address.clone()
    }

    /// Flag an endpoint unavailable until the next successful probe
    pub fn mark_unavailable(&self, address: &str) {
        if let Ok(mut entries) = self.entries.write() {
            if let Some(entry) = entries.iter_mut().find(|e| e.address == address) {
                if entry.available {
                    warn!("Registry address {} marked unavailable", address);
                }
                entry.available = false;
            }
        }
    }

    /// Snapshot of every tracked endpoint
    pub fn addresses(&self) -> Vec<AddressStatus> {
        self.entries
            .read()
            .map(|entries| {
                entries
                    .iter()
                    .map(|e| AddressStatus {
                        address: e.address.clone(),
                        available: e.available,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Dial every endpoint once and refresh its flag
    ///
    /// Concurrent callers do not start a second probe; they return as soon
    /// as they see one already running.
    pub async fn check_availability(&self) {
        if self
            .probing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Address probe already running");
            return;
        }
        let _guard = ProbingGuard(&self.probing);

        let targets: Vec<String> = self
            .addresses()
            .into_iter()
            .map(|status| status.address)
            .collect();
        let timeout = self.probe_timeout;
        let results = join_all(targets.iter().map(|address| async move {
            let reachable = matches!(
                runtime::timeout(timeout, TcpStream::connect(address.as_str())).await,
                Ok(Ok(_))
            );
            (address.clone(), reachable)
        }))
        .await;

        if let Ok(mut entries) = self.entries.write() {
            for (address, reachable) in results {
                // The set may have been replaced while we were dialing
                if let Some(entry) = entries.iter_mut().find(|e| e.address == address) {
                    if entry.available != reachable {
                        info!(
                            "Registry address {} is now {}",
                            address,
                            if reachable { "available" } else { "unavailable" }
                        );
                    }
                    entry.available = reachable;
                }
            }
        }
    }

    /// Probe on `interval` until `stop` fires
    pub fn start_probing(self: &Arc<Self>, spawner: &dyn Spawner, interval: Duration, stop: StopSignal) {
        let pool = Arc::clone(self);
        spawner.spawn(Box::pin(async move {
            info!("Registry address probing every {:?}", interval);
            while stop.sleep(interval).await {
                pool.check_availability().await;
            }
            debug!("Registry address probing stopped");
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_net::TcpListener;

    fn pool(addresses: &[&str]) -> AddressPool {
        AddressPool::new(addresses.iter().copied(), Duration::from_millis(200))
    }

    #[test]
    fn test_round_robin_visits_each_once() {
        let pool = pool(&["a:1", "b:2", "c:3"]);
        let first: Vec<String> = (0..3).map(|_| pool.available_address()).collect();
        let mut sorted = first.clone();
        sorted.sort();
        assert_eq!(sorted, vec!["a:1", "b:2", "c:3"]);

        // Fixed rotating order
        let second: Vec<String> = (0..3).map(|_| pool.available_address()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_fallback_when_none_available() {
        let pool = pool(&["a:1", "b:2"]);
        pool.mark_unavailable("a:1");
        assert_eq!(pool.available_address(), "b:2");
        pool.mark_unavailable("b:2");
        assert_eq!(pool.available_address(), DEFAULT_ADDRESS);

        let empty = AddressPool::new(Vec::<String>::new(), Duration::from_millis(200));
        assert_eq!(empty.available_address(), DEFAULT_ADDRESS);
    }

    #[test]
    fn test_set_addresses_resets_flags() {
        let pool = pool(&["a:1"]);
        pool.mark_unavailable("a:1");
        pool.set_addresses(["a:1", "a:1", "b:2"]);
        let statuses = pool.addresses();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| s.available));
    }

    #[smol_potat::test]
    async fn test_probe_updates_flags() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live = listener.local_addr().unwrap().to_string();

        // Grab a free port and release it so nothing listens there
        let closed = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().to_string()
        };

        let pool = AddressPool::new([live.clone(), closed.clone()], Duration::from_millis(500));
        pool.check_availability().await;

        for _ in 0..5 {
            assert_eq!(pool.available_address(), live);
        }
        let statuses = pool.addresses();
        assert!(statuses.iter().any(|s| s.address == closed && !s.available));
        drop(listener);
    }

    #[smol_potat::test]
    async fn test_abandoned_check_does_not_block_later_ones() {
        use futures::FutureExt;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live = listener.local_addr().unwrap().to_string();
        let pool = AddressPool::new([live.clone()], Duration::from_millis(500));

        // Poll once, then drop mid-flight
        let _ = pool.check_availability().now_or_never();
        assert!(!pool.probing.load(Ordering::Acquire));

        pool.mark_unavailable(&live);
        pool.check_availability().await;
        assert!(pool.addresses()[0].available);
        drop(listener);
    }
}
