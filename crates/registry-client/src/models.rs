//! Data models for services, instances and push events

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Version rule matching the newest registered version
pub const VERSION_LATEST: &str = "latest";

/// Version rule matching every version
pub const VERSION_ALL: &str = "0+";

/// Tag carrying the application id
pub const TAG_APP: &str = "app";

/// Tag carrying the service version
pub const TAG_VERSION: &str = "version";

/// A micro-service definition as stored by the registry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicroService {
    /// Registry-assigned id; empty until registered
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_id: String,
    /// Application the service belongs to
    pub app_id: String,
    /// Service name
    pub service_name: String,
    /// Service version
    pub version: String,
    /// Deployment environment, may be empty
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub environment: String,
    /// Service status (`UP` / `DOWN`)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    /// Service level (`FRONT`, `MIDDLE`, `BACK`)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub level: String,
    /// Free-form metadata
    #[serde(default, rename = "properties", skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    /// Schema ids (one per exposed interface)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub schemas: Vec<String>,
}

impl MicroService {
    /// Create a service definition
    pub fn new(
        app_id: impl Into<String>,
        service_name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            service_name: service_name.into(),
            version: version.into(),
            status: "UP".to_string(),
            ..Default::default()
        }
    }

    /// Set the environment
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Add a schema id
    pub fn with_schema(mut self, schema_id: impl Into<String>) -> Self {
        self.schemas.push(schema_id.into());
        self
    }

    /// Identity tuple used for create-or-return registration
    pub fn key(&self) -> ServiceKey {
        ServiceKey {
            app_id: self.app_id.clone(),
            service_name: self.service_name.clone(),
            version: self.version.clone(),
            environment: self.environment.clone(),
        }
    }
}

/// Identity of a micro-service: (app, name, version, environment)
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceKey {
    /// Application id
    #[serde(default)]
    pub app_id: String,
    /// Service name
    #[serde(default)]
    pub service_name: String,
    /// Version (exact)
    #[serde(default)]
    pub version: String,
    /// Environment
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub environment: String,
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.app_id, self.service_name, self.version)?;
        if !self.environment.is_empty() {
            write!(f, "@{}", self.environment)?;
        }
        Ok(())
    }
}

/// Criteria for one logical provider in an instance query
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindService {
    /// Application id
    pub app_id: String,
    /// Service name
    pub service_name: String,
    /// Version rule: exact, `latest`, `1.0+` or a range
    pub version: String,
    /// Environment
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub environment: String,
}

impl FindService {
    /// Criteria with an explicit version rule
    pub fn new(
        app_id: impl Into<String>,
        service_name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            service_name: service_name.into(),
            version: version.into(),
            environment: String::new(),
        }
    }

    /// Criteria matching every version of a service
    pub fn all_versions(app_id: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self::new(app_id, service_name, VERSION_ALL)
    }

    /// Set the environment
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }
}

/// Liveness status of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceStatus {
    /// Serving traffic
    #[default]
    Up,
    /// Not serving
    Down,
    /// Still starting
    Starting,
    /// Serving test traffic only
    Testing,
    /// Taken out of rotation by an operator
    OutOfService,
    /// Anything the registry reports that we do not know
    #[serde(other)]
    Unknown,
}

impl InstanceStatus {
    /// Whether instances in this status are kept in the discovery cache
    pub fn is_live(self) -> bool {
        matches!(self, InstanceStatus::Up | InstanceStatus::Testing)
    }

    /// Wire representation
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Up => "UP",
            InstanceStatus::Down => "DOWN",
            InstanceStatus::Starting => "STARTING",
            InstanceStatus::Testing => "TESTING",
            InstanceStatus::OutOfService => "OUTOFSERVICE",
            InstanceStatus::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network endpoint advertised by an instance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Host name or IP
    pub host: String,
    /// Port
    pub port: u16,
    /// Whether the endpoint expects TLS
    pub tls: bool,
}

impl Endpoint {
    /// Create an endpoint
    pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
        }
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Parse a registry endpoint string such as `rest://10.0.0.1:8080?sslEnabled=true`
    pub fn parse(raw: &str) -> Result<(String, Endpoint)> {
        let url = url::Url::parse(raw)
            .map_err(|e| Error::InvalidResponse(format!("bad endpoint '{}': {}", raw, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidResponse(format!("endpoint '{}' has no host", raw)))?;
        let port = url
            .port()
            .ok_or_else(|| Error::InvalidResponse(format!("endpoint '{}' has no port", raw)))?;
        let tls = url
            .query_pairs()
            .any(|(k, v)| k == "sslEnabled" && v.eq_ignore_ascii_case("true"));
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Ok((url.scheme().to_string(), Endpoint::new(host, port, tls)))
    }

    /// Registry string form for the given protocol
    pub fn to_registry_string(&self, protocol: &str) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.tls {
            format!("{}://{}:{}?sslEnabled=true", protocol, host, self.port)
        } else {
            format!("{}://{}:{}", protocol, host, self.port)
        }
    }
}

mod endpoint_list {
    //! Registry wire format: a list of `protocol://host:port?...` strings

    use super::Endpoint;
    use serde::{Deserialize, Deserializer, Serializer, ser::SerializeSeq};
    use std::collections::BTreeMap;
    use tracing::warn;

    pub fn serialize<S: Serializer>(
        endpoints: &BTreeMap<String, Endpoint>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(endpoints.len()))?;
        for (protocol, endpoint) in endpoints {
            seq.serialize_element(&endpoint.to_registry_string(protocol))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Endpoint>, D::Error> {
        let raw = Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default();
        let mut endpoints = BTreeMap::new();
        for entry in raw {
            match Endpoint::parse(&entry) {
                Ok((protocol, endpoint)) => {
                    endpoints.insert(protocol, endpoint);
                }
                Err(e) => warn!("Skipping endpoint: {}", e),
            }
        }
        Ok(endpoints)
    }
}

/// Data center an instance runs in
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataCenterInfo {
    /// Data center name
    pub name: String,
    /// Region
    #[serde(default)]
    pub region: String,
    /// Availability zone
    #[serde(default)]
    pub available_zone: String,
}

/// How the registry learns an instance is alive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckMode {
    /// The instance sends heartbeats
    #[default]
    Push,
    /// The registry polls; no heartbeats are sent
    Pull,
}

/// Health check settings of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Check mode
    #[serde(default)]
    pub mode: HealthCheckMode,
    /// Heartbeat interval in seconds
    #[serde(default)]
    pub interval: u32,
    /// Missed heartbeats tolerated before the registry marks the instance down
    #[serde(default)]
    pub times: u32,
}

/// One running copy of a micro-service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicroServiceInstance {
    /// Registry-assigned id; empty until registered
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance_id: String,
    /// Owning service id
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_id: String,
    /// Version of the owning service
    #[serde(default)]
    pub version: String,
    /// Host name
    #[serde(default)]
    pub host_name: String,
    /// Liveness status
    #[serde(default)]
    pub status: InstanceStatus,
    /// Free-form metadata
    #[serde(default, rename = "properties", skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    /// Endpoints keyed by protocol name
    #[serde(default, with = "endpoint_list")]
    pub endpoints: BTreeMap<String, Endpoint>,
    /// Data center descriptor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_center_info: Option<DataCenterInfo>,
    /// Health check settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
    /// Name of the owning service, filled in locally
    #[serde(skip)]
    pub service_name: String,
    /// Application of the owning service, filled in locally
    #[serde(skip)]
    pub app_id: String,
}

impl MicroServiceInstance {
    /// Create an instance description
    pub fn new(host_name: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
            ..Default::default()
        }
    }

    /// Add an endpoint
    pub fn with_endpoint(mut self, protocol: impl Into<String>, endpoint: Endpoint) -> Self {
        self.endpoints.insert(protocol.into(), endpoint);
        self
    }

    /// Set the status
    pub fn with_status(mut self, status: InstanceStatus) -> Self {
        self.status = status;
        self
    }

    /// Whether the registry expects heartbeats from this instance
    pub fn wants_heartbeat(&self) -> bool {
        self.health_check
            .map(|hc| hc.mode == HealthCheckMode::Push)
            .unwrap_or(true)
    }

    /// Tags identifying the group this instance is cached under
    pub fn group_tags(&self) -> Tags {
        Tags::new()
            .with(TAG_APP, self.app_id.clone())
            .with(TAG_VERSION, self.version.clone())
    }

    /// Whether every tag in `query` is satisfied by this instance
    ///
    /// `app` and `version` are matched against the owning service, any other
    /// tag against instance metadata.
    pub fn matches(&self, query: &Tags) -> bool {
        query.iter().all(|(k, v)| match k.as_str() {
            TAG_APP => &self.app_id == v,
            TAG_VERSION => &self.version == v,
            _ => self.metadata.get(k) == Some(v),
        })
    }
}

/// Ordered tag set used to select instance groups
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tags(BTreeMap<String, String>);

impl Tags {
    /// Empty tag set (matches everything)
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tag; empty values are ignored
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.0.insert(key.into(), value);
        }
        self
    }

    /// Value of a tag
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|s| s.as_str())
    }

    /// Iterate over tags in key order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Whether no tag is set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical string form: `k1=v1|k2=v2` in key order
    pub fn key(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("|")
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Tags {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Tags::new(), |tags, (k, v)| tags.with(k, v))
    }
}

/// Service identity attached to an IP address by the IP index
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTags {
    /// Service name
    pub service_name: String,
    /// Application id
    pub app_id: String,
    /// Service version
    pub version: String,
}

/// Push notification action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventAction {
    /// Instance registered
    Create,
    /// Instance changed
    Update,
    /// Instance unregistered or expired
    Delete,
    /// Server-side error report
    Error,
    /// Anything else
    #[serde(other)]
    Unknown,
}

/// Key of the service a push event refers to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventKey {
    /// Application id
    #[serde(default)]
    pub app_id: String,
    /// Service name
    #[serde(default)]
    pub service_name: String,
    /// Service version
    #[serde(default)]
    pub version: String,
}

/// One push notification as received on the watch stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    /// What happened
    pub action: EventAction,
    /// Which service
    #[serde(default)]
    pub key: EventKey,
    /// The affected instance
    #[serde(default)]
    pub instance: Option<MicroServiceInstance>,
}

impl WatchEvent {
    /// Build an event; fills the instance's local service fields from the key
    pub fn new(action: EventAction, key: EventKey, mut instance: MicroServiceInstance) -> Self {
        instance.service_name = key.service_name.clone();
        instance.app_id = key.app_id.clone();
        Self {
            action,
            key,
            instance: Some(instance),
        }
    }

    /// Decode a stream message and attach the key to the instance
    pub fn from_message(text: &str) -> Result<Self> {
        let mut event: WatchEvent = serde_json::from_str(text)?;
        if let Some(instance) = event.instance.as_mut() {
            instance.service_name = event.key.service_name.clone();
            instance.app_id = event.key.app_id.clone();
        }
        Ok(event)
    }
}
