//! Runtime-agnostic spawning, timers and stop signals
//!
//! The client never picks an executor on its own. Background loops are
//! handed to a [`Spawner`] supplied by the caller, and timers come from the
//! runtime selected with the `smol` (default) or `tokio` feature.

use crate::error::{Error, Result};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::time::Duration;

/// A spawner that can spawn futures on an async runtime
pub trait Spawner: Send + Sync {
    /// Spawn a future on the runtime
    ///
    /// The future will run to completion in the background.
    fn spawn(&self, future: BoxFuture<'static, ()>);
}

/// Spawner for the Smol runtime
#[cfg(feature = "smol")]
#[derive(Debug, Clone, Copy, Default)]
pub struct SmolSpawner;

#[cfg(feature = "smol")]
impl Spawner for SmolSpawner {
    fn spawn(&self, future: BoxFuture<'static, ()>) {
        smol::spawn(future).detach();
    }
}

/// Spawner for the Tokio runtime
#[cfg(feature = "tokio")]
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSpawner;

#[cfg(feature = "tokio")]
impl Spawner for TokioSpawner {
    fn spawn(&self, future: BoxFuture<'static, ()>) {
        tokio::spawn(future);
    }
}

/// Sleep for the specified duration using the selected runtime
pub async fn sleep(duration: Duration) {
    #[cfg(feature = "smol")]
    {
        smol::Timer::after(duration).await;
    }

    #[cfg(all(feature = "tokio", not(feature = "smol")))]
    {
        tokio::time::sleep(duration).await;
    }

    #[cfg(not(any(feature = "smol", feature = "tokio")))]
    {
        compile_error!("One of the runtime features must be enabled: smol or tokio");
    }
}

/// Run `future`, failing with [`Error::Timeout`] once `duration` elapses
pub async fn timeout<F: Future>(duration: Duration, future: F) -> Result<F::Output> {
    futures::select! {
        out = future.fuse() => Ok(out),
        _ = sleep(duration).fuse() => Err(Error::Timeout(duration)),
    }
}

/// Broadcast stop signal shared by every background loop
///
/// Cloning is cheap; [`StopSignal::stop`] wakes all current and future
/// waiters. Built on a channel that never carries messages: closing it is
/// the signal.
#[derive(Clone, Debug)]
pub struct StopSignal {
    tx: async_channel::Sender<()>,
    rx: async_channel::Receiver<()>,
}

impl StopSignal {
    /// Create a signal that has not fired yet
    pub fn new() -> Self {
        let (tx, rx) = async_channel::bounded(1);
        Self { tx, rx }
    }

    /// Fire the signal. Idempotent.
    pub fn stop(&self) {
        self.tx.close();
    }

    /// Whether the signal fired
    pub fn is_stopped(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolve once the signal fires
    pub async fn stopped(&self) {
        // recv only returns once the channel is closed
        while self.rx.recv().await.is_ok() {}
    }

    /// Sleep for `duration`; returns false if the signal fired first
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_stopped() {
            return false;
        }
        futures::select! {
            _ = sleep(duration).fuse() => !self.is_stopped(),
            _ = self.stopped().fuse() => false,
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[smol_potat::test]
    async fn test_timeout_expires() {
        let result = timeout(Duration::from_millis(20), sleep(Duration::from_secs(5))).await;
        assert!(matches!(result, Err(Error::Timeout(_))));

        let result = timeout(Duration::from_secs(5), async { 7 }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[smol_potat::test]
    async fn test_stop_signal_interrupts_sleep() {
        let signal = StopSignal::new();
        let waiter = signal.clone();

        let start = Instant::now();
        let task = smol::spawn(async move { waiter.sleep(Duration::from_secs(30)).await });
        sleep(Duration::from_millis(20)).await;
        signal.stop();

        assert!(!task.await);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(signal.is_stopped());
        // Already stopped: returns immediately
        assert!(!signal.sleep(Duration::from_secs(30)).await);
    }

    #[cfg(feature = "smol")]
    #[smol_potat::test]
    async fn test_smol_spawner() {
        let spawner = SmolSpawner;
        let (tx, rx) = async_channel::bounded(1);

        spawner.spawn(Box::pin(async move {
            tx.send(42).await.unwrap();
        }));

        assert_eq!(rx.recv().await.unwrap(), 42);
    }
}
