//! Push notification streams
//!
//! One WebSocket per watched service id. A reader task hands every text
//! message to the callback in receipt order; when the stream ends the
//! service is released and reconnected on the backoff schedule until the
//! stop signal fires.

use crate::{
    address::AddressPool,
    backoff::Backoff,
    error::{Error, Result},
    models::{EventAction, WatchEvent},
    runtime::{Spawner, StopSignal},
    transport::{BoxedIo, Connector},
};
use async_tungstenite::WebSocketStream;
use futures::{FutureExt, StreamExt, future::BoxFuture};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};
use tungstenite::Message;

/// Handler invoked for every decoded push event
pub type WatchCallback = Arc<dyn Fn(WatchEvent) -> BoxFuture<'static, ()> + Send + Sync>;

type WsStream = WebSocketStream<BoxedIo>;

/// Owns the watch sessions of one registry client
pub struct WatchManager {
    pool: Arc<AddressPool>,
    connector: Connector,
    spawner: Arc<dyn Spawner>,
    base_path: String,
    backoff: Backoff,
    stop: StopSignal,
    active: Mutex<HashSet<String>>,
}

impl WatchManager {
    /// Create a manager; sessions end when `stop` fires
    pub fn new(
        pool: Arc<AddressPool>,
        connector: Connector,
        spawner: Arc<dyn Spawner>,
        base_path: String,
        backoff: Backoff,
        stop: StopSignal,
    ) -> Self {
        Self {
            pool,
            connector,
            spawner,
            base_path,
            backoff,
            stop,
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Whether a session for `service_id` is connected or connecting
    pub fn is_active(&self, service_id: &str) -> bool {
        self.active
            .lock()
            .map(|active| active.contains(service_id))
            .unwrap_or(false)
    }

    fn try_activate(&self, service_id: &str) -> bool {
        self.active
            .lock()
            .map(|mut active| active.insert(service_id.to_string()))
            .unwrap_or(false)
    }

    fn deactivate(&self, service_id: &str) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(service_id);
        }
    }

    /// Open a session for `service_id` unless one already exists
    pub async fn watch(self: &Arc<Self>, service_id: &str, callback: WatchCallback) -> Result<()> {
        if self.stop.is_stopped() {
            return Err(Error::Closed);
        }
        if !self.try_activate(service_id) {
            debug!("Watch for {} already active", service_id);
            return Ok(());
        }

        match self.connect(service_id).await {
            Ok(ws) => {
                info!("Watching service {}", service_id);
                self.spawn_session(service_id.to_string(), ws, callback);
                Ok(())
            }
            Err(e) => {
                self.deactivate(service_id);
                Err(e)
            }
        }
    }

    /// Like [`WatchManager::watch`], but connects in the background and keeps
    /// retrying on the backoff schedule when the first attempt fails
    pub fn spawn_watch(self: &Arc<Self>, service_id: &str, callback: WatchCallback) {
        let manager = Arc::clone(self);
        let service_id = service_id.to_string();
        self.spawner.spawn(Box::pin(async move {
            match manager.watch(&service_id, callback.clone()).await {
                Ok(()) | Err(Error::Closed) => {}
                Err(e) => {
                    warn!("Watch for {} failed, retrying: {}", service_id, e);
                    manager.reconnect(service_id, callback).await;
                }
            }
        }));
    }

    async fn connect(&self, service_id: &str) -> Result<WsStream> {
        let address = self.pool.available_address();
        let scheme = if self.connector.is_tls() { "wss" } else { "ws" };
        let url = format!(
            "{}://{}{}/microservices/{}/watch",
            scheme, address, self.base_path, service_id
        );
        debug!("Connecting watch stream {}", url);

        let result = async {
            let io = self.connector.connect(&address).await?;
            let (ws, _) = async_tungstenite::client_async(url, io).await?;
            Ok::<_, Error>(ws)
        }
        .await;

        if let Err(e) = &result {
            if e.is_connectivity() {
                self.pool.mark_unavailable(&address);
            }
        }
        result
    }

    fn spawn_session(self: &Arc<Self>, service_id: String, ws: WsStream, callback: WatchCallback) {
        let manager = Arc::clone(self);
        self.spawner.spawn(Box::pin(async move {
            manager.read_stream(&service_id, ws, &callback).await;
            manager.deactivate(&service_id);
            manager.reconnect(service_id, callback).await;
        }));
    }

    async fn read_stream(&self, service_id: &str, mut ws: WsStream, callback: &WatchCallback) {
        loop {
            let next = futures::select! {
                message = ws.next().fuse() => Some(message),
                _ = self.stop.stopped().fuse() => None,
            };

            match next {
                None => {
                    debug!("Closing watch stream for {}", service_id);
                    if let Err(e) = ws.close(None).await {
                        debug!("Close frame for {} not sent: {}", service_id, e);
                    }
                    return;
                }
                Some(None) | Some(Some(Ok(Message::Close(_)))) => {
                    info!("Watch stream for {} closed by registry", service_id);
                    return;
                }
                Some(Some(Ok(Message::Text(text)))) => {
                    match WatchEvent::from_message(text.as_str()) {
                        Ok(event) => match event.action {
                            EventAction::Error => {
                                error!("Registry reported a watch error for {}: {}", service_id, text.as_str())
                            }
                            EventAction::Unknown => {
                                warn!("Ignoring unknown watch action for {}", service_id)
                            }
                            _ => callback(event).await,
                        },
                        Err(e) => warn!("Undecodable watch message for {}: {}", service_id, e),
                    }
                }
                Some(Some(Ok(_))) => {}
                Some(Some(Err(e))) => {
                    warn!("Watch stream for {} failed: {}", service_id, e);
                    return;
                }
            }
        }
    }

    async fn reconnect(self: &Arc<Self>, service_id: String, callback: WatchCallback) {
        for delay in self.backoff.delays() {
            if !self.stop.sleep(delay).await {
                debug!("Watch reconnect for {} stopped", service_id);
                return;
            }
            match self.watch(&service_id, callback.clone()).await {
                Ok(()) => return,
                Err(Error::Closed) => return,
                Err(e) => warn!("Watch reconnect for {} failed: {}", service_id, e),
            }
        }
    }
}
