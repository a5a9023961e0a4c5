//! Common test utilities for registry client integration tests
//!
//! [`FakeRegistry`] is an in-process service center speaking just enough of
//! the HTTP API and the watch stream for end-to-end tests.

#![allow(dead_code)]

use async_net::{TcpListener, TcpStream};
use async_tungstenite::WebSocketStream;
use futures::io::{AsyncReadExt, AsyncWriteExt};
use futures::{FutureExt, SinkExt, StreamExt};
use registry_client::models::{
    EventAction, EventKey, InstanceStatus, MicroService, MicroServiceInstance, WatchEvent,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tungstenite::protocol::Role;

/// Test timeout for async operations
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Install a test subscriber once; honours `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Poll `check` until it holds or [`TEST_TIMEOUT`] passes
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + TEST_TIMEOUT;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        smol::Timer::after(Duration::from_millis(20)).await;
    }
    check()
}

/// Address nothing listens on
pub async fn dead_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}

#[derive(Default)]
struct State {
    next_id: usize,
    revision: u64,
    services: HashMap<String, MicroService>,
    instances: HashMap<String, Vec<MicroServiceInstance>>,
    heartbeats: HashMap<String, usize>,
    watchers: HashMap<String, Vec<async_channel::Sender<String>>>,
    requests: Vec<String>,
}

impl State {
    fn bump(&mut self) {
        self.revision += 1;
    }

    fn service_name(&self, service_id: &str) -> Option<String> {
        self.services.get(service_id).map(|s| s.service_name.clone())
    }

    fn find_service(&self, app_id: &str, name: &str, version: &str) -> Option<&MicroService> {
        self.services
            .values()
            .find(|s| s.app_id == app_id && s.service_name == name && s.version == version)
    }
}

/// In-process service center
#[derive(Clone)]
pub struct FakeRegistry {
    /// `host:port` the registry listens on
    pub address: String,
    state: Arc<Mutex<State>>,
}

impl FakeRegistry {
    /// Start listening on an ephemeral port
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let registry = Self {
            address,
            state: Arc::new(Mutex::new(State {
                revision: 1,
                ..Default::default()
            })),
        };

        let server = registry.clone();
        smol::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handler = server.clone();
                smol::spawn(async move { handler.handle(stream).await }).detach();
            }
        })
        .detach();
        registry
    }

    /// Register a provider service directly; returns its id
    pub fn add_service(&self, app_id: &str, name: &str, version: &str) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("svc-{}", state.next_id);
        let mut service = MicroService::new(app_id, name, version);
        service.service_id = id.clone();
        state.services.insert(id.clone(), service);
        id
    }

    /// Add an instance to a provider directly; returns its id
    pub fn add_instance(&self, service_id: &str, mut instance: MicroServiceInstance) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("inst-{}", state.next_id);
        instance.instance_id = id.clone();
        instance.service_id = service_id.to_string();
        let name = state.service_name(service_id).unwrap();
        state.instances.entry(name).or_default().push(instance);
        state.bump();
        id
    }

    /// Push an event to every watcher of `watched_service_id`
    pub async fn push(&self, watched_service_id: &str, action: EventAction, provider: &str, instance: MicroServiceInstance) {
        let event = WatchEvent::new(
            action,
            EventKey {
                app_id: instance.app_id.clone(),
                service_name: provider.to_string(),
                version: instance.version.clone(),
            },
            instance,
        );
        let text = serde_json::to_string(&event).unwrap();
        let watchers = {
            let state = self.state.lock().unwrap();
            state.watchers.get(watched_service_id).cloned().unwrap_or_default()
        };
        for watcher in watchers {
            let _ = watcher.send(text.clone()).await;
        }
    }

    /// Number of open watch streams for `service_id`
    pub fn watchers(&self, service_id: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .watchers
            .get(service_id)
            .map(|w| w.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Heartbeats received for `instance_id`
    pub fn heartbeats(&self, instance_id: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.heartbeats.get(instance_id).copied().unwrap_or(0)
    }

    /// Instances currently registered for `service_name`
    pub fn instances(&self, service_name: &str) -> Vec<MicroServiceInstance> {
        let state = self.state.lock().unwrap();
        state.instances.get(service_name).cloned().unwrap_or_default()
    }

    /// Request lines seen so far (`METHOD path`)
    pub fn requests(&self) -> Vec<String> {
        self.state.lock().unwrap().requests.clone()
    }

    async fn handle(&self, mut stream: TcpStream) {
        let Some((method, target, headers)) = read_head(&mut stream).await else {
            return;
        };
        self.state
            .lock()
            .unwrap()
            .requests
            .push(format!("{} {}", method, target));

        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_string(), parse_query(query)),
            None => (target.clone(), HashMap::new()),
        };

        if path.ends_with("/watch") {
            if let Some(key) = headers.get("sec-websocket-key") {
                self.serve_watch(stream, &path, key).await;
            }
            return;
        }

        let length = headers
            .get("content-length")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        let mut body = vec![0u8; length];
        if stream.read_exact(&mut body).await.is_err() {
            return;
        }
        let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);

        let (status, payload, revision) = self.route(&method, &path, &query, body);
        let payload = payload.map(|v| v.to_string()).unwrap_or_default();
        let mut response = format!(
            "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
            status,
            payload.len()
        );
        if let Some(revision) = revision {
            response.push_str(&format!("X-Resource-Revision: {}\r\n", revision));
        }
        response.push_str("\r\n");
        response.push_str(&payload);
        let _ = stream.write_all(response.as_bytes()).await;
        let _ = stream.close().await;
    }

    fn route(
        &self,
        method: &str,
        path: &str,
        query: &HashMap<String, String>,
        body: Value,
    ) -> (u16, Option<Value>, Option<String>) {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        // ["v4", project, "registry", ...]
        let tail = segments.get(3..).unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        let q = |k: &str| query.get(k).cloned().unwrap_or_default();

        match (method, tail) {
            ("GET", ["existence"]) => {
                match state.find_service(&q("appId"), &q("serviceName"), &q("version")) {
                    Some(service) => ok(json!({"serviceId": service.service_id})),
                    None => not_exists("400012"),
                }
            }
            ("POST", ["microservices"]) => {
                let mut service: MicroService = serde_json::from_value(body["service"].clone()).unwrap();
                state.next_id += 1;
                service.service_id = format!("svc-{}", state.next_id);
                let id = service.service_id.clone();
                state.services.insert(id.clone(), service);
                ok(json!({"serviceId": id}))
            }
            ("GET", ["microservices"]) => {
                let services: Vec<&MicroService> = state.services.values().collect();
                ok(json!({"services": services}))
            }
            ("GET", ["microservices", sid]) => match state.services.get(*sid) {
                Some(service) => ok(json!({"service": service})),
                None => not_exists("400012"),
            },
            ("POST", ["microservices", sid, "instances"]) => {
                let Some(name) = state.service_name(sid) else {
                    return not_exists("400012");
                };
                let mut instance: MicroServiceInstance =
                    serde_json::from_value(body["instance"].clone()).unwrap();
                state.next_id += 1;
                instance.instance_id = format!("inst-{}", state.next_id);
                instance.service_id = sid.to_string();
                let id = instance.instance_id.clone();
                state.instances.entry(name).or_default().push(instance);
                state.bump();
                ok(json!({"instanceId": id}))
            }
            ("GET", ["microservices", sid, "instances"]) => {
                let name = state.service_name(sid).unwrap_or_default();
                let instances = state.instances.get(&name).cloned().unwrap_or_default();
                ok(json!({"instances": instances}))
            }
            ("DELETE", ["microservices", sid, "instances", iid]) => {
                let name = state.service_name(sid).unwrap_or_default();
                let list = state.instances.entry(name).or_default();
                let before = list.len();
                list.retain(|i| i.instance_id != *iid);
                if list.len() == before {
                    return not_exists("400017");
                }
                state.bump();
                ok(json!({}))
            }
            ("PUT", ["microservices", sid, "instances", iid, action]) => {
                let name = state.service_name(sid).unwrap_or_default();
                let exists = state
                    .instances
                    .get(&name)
                    .map(|list| list.iter().any(|i| i.instance_id == *iid))
                    .unwrap_or(false);
                if !exists {
                    return not_exists("400017");
                }
                match *action {
                    "heartbeat" => {
                        *state.heartbeats.entry(iid.to_string()).or_default() += 1;
                    }
                    "status" => {
                        let status: InstanceStatus =
                            serde_json::from_value(json!(q("value"))).unwrap();
                        for instance in state.instances.entry(name).or_default() {
                            if instance.instance_id == *iid {
                                instance.status = status;
                            }
                        }
                        state.bump();
                    }
                    "properties" => {
                        let properties: HashMap<String, String> =
                            serde_json::from_value(body["properties"].clone()).unwrap_or_default();
                        for instance in state.instances.entry(name).or_default() {
                            if instance.instance_id == *iid {
                                instance.metadata = properties.clone();
                            }
                        }
                        state.bump();
                    }
                    _ => return (404, None, None),
                }
                ok(json!({}))
            }
            ("GET", ["microservices", _sid, "schemas", schema_id]) => {
                ok(json!({"schema": format!("openapi: 3.0.0\ninfo:\n  title: {}\n", schema_id)}))
            }
            ("GET", ["instances"]) => {
                let instances = state.instances.get(&q("serviceName")).cloned().unwrap_or_default();
                ok(json!({"instances": instances}))
            }
            ("POST", ["instances", "action"]) => {
                let current = state.revision.to_string();
                if q("rev") == current {
                    return (304, None, Some(current));
                }
                let criteria = body["services"].as_array().cloned().unwrap_or_default();
                let updated: Vec<Value> = criteria
                    .iter()
                    .enumerate()
                    .map(|(index, item)| {
                        let name = item["service"]["serviceName"].as_str().unwrap_or_default();
                        let instances = state.instances.get(name).cloned().unwrap_or_default();
                        json!({"index": index, "rev": current, "instances": instances})
                    })
                    .collect();
                (
                    200,
                    Some(json!({"services": {"updated": updated}})),
                    Some(current),
                )
            }
            _ => (404, Some(json!({"errorCode": "404", "errorMessage": "no route"})), None),
        }
    }

    async fn serve_watch(&self, mut stream: TcpStream, path: &str, key: &str) {
        let service_id = path
            .trim_end_matches("/watch")
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        let accept = tungstenite::handshake::derive_accept_key(key.as_bytes());
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
            accept
        );
        if stream.write_all(response.as_bytes()).await.is_err() {
            return;
        }

        let mut ws = WebSocketStream::from_raw_socket(stream, Role::Server, None).await;
        let (tx, rx) = async_channel::unbounded::<String>();
        self.state
            .lock()
            .unwrap()
            .watchers
            .entry(service_id)
            .or_default()
            .push(tx);

        enum Step {
            Send(String),
            Skip,
            Done,
        }

        loop {
            let step = futures::select! {
                message = rx.recv().fuse() => message.map(Step::Send).unwrap_or(Step::Done),
                incoming = ws.next().fuse() => match incoming {
                    Some(Ok(_)) => Step::Skip,
                    _ => Step::Done,
                },
            };
            match step {
                Step::Send(text) => {
                    if ws.send(tungstenite::Message::text(text)).await.is_err() {
                        break;
                    }
                }
                Step::Skip => {}
                Step::Done => break,
            }
        }
        rx.close();
    }
}

fn ok(body: Value) -> (u16, Option<Value>, Option<String>) {
    (200, Some(body), None)
}

fn not_exists(code: &str) -> (u16, Option<Value>, Option<String>) {
    (
        400,
        Some(json!({"errorCode": code, "errorMessage": "does not exist"})),
        None,
    )
}

fn parse_query(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

async fn read_head(stream: &mut TcpStream) -> Option<(String, String, HashMap<String, String>)> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await.ok()? == 0 {
            return None;
        }
        head.push(byte[0]);
    }
    let text = String::from_utf8(head).ok()?;
    let mut lines = text.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let target = request_line.next()?.to_string();
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();
    Some((method, target, headers))
}
