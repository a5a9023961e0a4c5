//! Registry protocol client
//!
//! Every call picks an endpoint from the [`AddressPool`], sends one JSON
//! request through the [`Transport`] under a bounded timeout, and fails over
//! to the next endpoint on connectivity errors. Instance queries are
//! incremental: the client remembers the last revision the registry
//! reported and sends it along, so an unchanged dataset costs a 304.

use crate::{
    address::AddressPool,
    backoff::Backoff,
    error::{ERR_INSTANCE_NOT_EXISTS, ERR_SERVICE_NOT_EXISTS, Error, Result},
    models::*,
    runtime::{self, Spawner, StopSignal},
    transport::{Connector, HttpRequest, HttpResponse, Method, Transport},
    watch::{WatchCallback, WatchManager},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Header carrying the dataset revision on query responses
pub const HEADER_REVISION: &str = "X-Resource-Revision";

/// Header identifying the querying service
pub const HEADER_CONSUMER_ID: &str = "X-ConsumerId";

/// Header carrying the project (domain)
pub const HEADER_DOMAIN: &str = "X-Domain-Name";

/// Revision meaning "send me everything"
pub const REVISION_FULL: &str = "0";

/// Settings of a [`RegistryClient`]
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Project (domain) path segment
    pub project: String,
    /// API version path segment
    pub api_version: String,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Watch reconnect schedule
    pub backoff: Backoff,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            project: "default".to_string(),
            api_version: "v4".to_string(),
            request_timeout: Duration::from_secs(10),
            backoff: Backoff::default(),
        }
    }
}

impl ClientOptions {
    /// Options derived from a registry configuration
    pub fn from_config(config: &crate::config::RegistryConfig) -> Self {
        Self {
            project: config.project.clone(),
            api_version: config.api_version.clone(),
            request_timeout: config.request_timeout(),
            backoff: config.backoff,
        }
    }

    /// Path prefix of every registry API call
    pub fn base_path(&self) -> String {
        format!("/{}/{}/registry", self.api_version, self.project)
    }
}

/// Error body returned by the registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    /// Registry error code
    #[serde(default)]
    pub error_code: String,
    /// Error message
    #[serde(default)]
    pub error_message: String,
    /// Additional details
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

/// One provider whose instances changed
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatedService {
    /// Index into the query criteria
    pub index: usize,
    /// Full current instance list
    pub instances: Vec<MicroServiceInstance>,
}

/// Providers the registry could not answer for
#[derive(Debug, Clone, PartialEq)]
pub struct FailedServices {
    /// Indexes into the query criteria
    pub indexes: Vec<usize>,
    /// Reason
    pub error: ErrorInfo,
}

/// Outcome of a batch instance query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindInstancesResult {
    /// Criteria the query was issued with
    pub criteria: Vec<FindService>,
    /// Providers with a full, fresh instance list
    pub updated: Vec<UpdatedService>,
    /// Providers unchanged since the sent revision
    pub not_modified: Vec<usize>,
    /// Providers that failed
    pub failed: Vec<FailedServices>,
    /// Revision reported by the registry
    pub revision: Option<String>,
}

impl FindInstancesResult {
    /// Instances per provider name; every criterion gets an entry, empty
    /// unless the provider was updated
    pub fn regroup(&self) -> HashMap<String, Vec<MicroServiceInstance>> {
        let mut grouped: HashMap<String, Vec<MicroServiceInstance>> = self
            .criteria
            .iter()
            .map(|c| (c.service_name.clone(), Vec::new()))
            .collect();
        for update in &self.updated {
            if let Some(criteria) = self.criteria.get(update.index) {
                grouped
                    .entry(criteria.service_name.clone())
                    .or_default()
                    .extend(update.instances.iter().cloned());
            }
        }
        grouped
    }

    /// Names of the providers whose instance list was sent in full
    pub fn updated_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .updated
            .iter()
            .filter_map(|u| self.criteria.get(u.index))
            .map(|c| c.service_name.clone())
            .collect();
        names.dedup();
        names
    }

    /// Name of a criterion by index
    pub fn name_of(&self, index: usize) -> Option<&str> {
        self.criteria.get(index).map(|c| c.service_name.as_str())
    }
}

// Wire shapes

#[derive(Serialize)]
struct ServiceRequest<'a> {
    service: &'a MicroService,
}

#[derive(Serialize)]
struct InstanceRequest<'a> {
    instance: &'a MicroServiceInstance,
}

#[derive(Serialize)]
struct PropertiesRequest<'a> {
    properties: &'a HashMap<String, String>,
}

#[derive(Serialize)]
struct BatchFindRequest<'a> {
    services: Vec<BatchFindItem<'a>>,
}

#[derive(Serialize)]
struct BatchFindItem<'a> {
    service: &'a FindService,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceIdResponse {
    #[serde(default)]
    service_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceIdResponse {
    #[serde(default)]
    instance_id: String,
}

#[derive(Deserialize)]
struct GetServiceResponse {
    service: Option<MicroService>,
}

#[derive(Deserialize)]
struct GetServicesResponse {
    #[serde(default)]
    services: Vec<MicroService>,
}

#[derive(Deserialize)]
struct GetInstancesResponse {
    #[serde(default)]
    instances: Vec<MicroServiceInstance>,
}

#[derive(Deserialize)]
struct GetSchemaResponse {
    #[serde(default)]
    schema: String,
}

#[derive(Deserialize, Default)]
struct BatchFindResponse {
    #[serde(default)]
    services: Option<BatchFindResult>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct BatchFindResult {
    #[serde(default)]
    updated: Vec<UpdatedItem>,
    #[serde(default)]
    not_modified: Vec<usize>,
    #[serde(default)]
    failed: Vec<FailedItem>,
}

#[derive(Deserialize)]
struct UpdatedItem {
    index: usize,
    #[serde(default)]
    instances: Vec<MicroServiceInstance>,
}

#[derive(Deserialize)]
struct FailedItem {
    #[serde(default)]
    indexes: Vec<usize>,
    #[serde(default)]
    error: ErrorInfo,
}

/// Client for the registry API
pub struct RegistryClient {
    pool: Arc<AddressPool>,
    transport: Arc<dyn Transport>,
    options: ClientOptions,
    revision: Mutex<String>,
    watches: Arc<WatchManager>,
    stop: StopSignal,
}

impl RegistryClient {
    /// Create a client
    pub fn new(
        pool: Arc<AddressPool>,
        transport: Arc<dyn Transport>,
        connector: Connector,
        spawner: Arc<dyn Spawner>,
        options: ClientOptions,
    ) -> Self {
        let stop = StopSignal::new();
        let watches = Arc::new(WatchManager::new(
            pool.clone(),
            connector,
            spawner,
            options.base_path(),
            options.backoff,
            stop.clone(),
        ));
        Self {
            pool,
            transport,
            options,
            revision: Mutex::new(REVISION_FULL.to_string()),
            watches,
            stop,
        }
    }

    /// Address pool the client selects endpoints from
    pub fn pool(&self) -> &Arc<AddressPool> {
        &self.pool
    }

    /// Stop signal fired by [`RegistryClient::close`]
    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    fn path(&self, tail: &str) -> String {
        format!("{}{}", self.options.base_path(), tail)
    }

    /// Send one request, failing over across available endpoints
    async fn request(
        &self,
        method: Method,
        path: &str,
        consumer_id: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> Result<HttpResponse> {
        if let Some(consumer_id) = consumer_id {
            if consumer_id.chars().any(char::is_control) {
                return Err(Error::InvalidIdentity(format!(
                    "consumer id {:?} is not a valid header value",
                    consumer_id
                )));
            }
        }

        let attempts = self.pool.addresses().len().clamp(1, 3);
        let mut last_error = None;

        for _ in 0..attempts {
            if self.stop.is_stopped() {
                return Err(Error::Closed);
            }
            let address = self.pool.available_address();
            let mut request = HttpRequest::new(method, address.clone(), path)
                .header(HEADER_DOMAIN, self.options.project.clone());
            if let Some(consumer_id) = consumer_id {
                request = request.header(HEADER_CONSUMER_ID, consumer_id);
            }
            if let Some(body) = &body {
                request = request.json(body)?;
            }

            let outcome = runtime::timeout(self.options.request_timeout, self.transport.send(request))
                .await
                .and_then(|sent| sent);

            match outcome {
                Ok(response) if response.status >= 500 => {
                    warn!("{} {} on {} returned {}", method, path, address, response.status);
                    self.pool.mark_unavailable(&address);
                    last_error = Some(error_from_response(&response));
                }
                Ok(response) => return Ok(response),
                Err(e) if e.is_connectivity() => {
                    warn!("{} {} on {} failed: {}", method, path, address, e);
                    self.pool.mark_unavailable(&address);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Unavailable("no registry endpoint".to_string())))
    }

    /// Send a request and decode a 2xx JSON body
    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        consumer_id: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        let response = self.request(method, path, consumer_id, body).await?;
        decode(&response)
    }

    /// Send a request whose success carries no useful body
    async fn call_empty(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<()> {
        let response = self.request(method, path, None, body).await?;
        if response.is_success() {
            Ok(())
        } else {
            Err(error_from_response(&response))
        }
    }

    /// Look up the id of a registered service; `None` when it does not exist
    pub async fn get_service_id(&self, key: &ServiceKey) -> Result<Option<String>> {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("type", "microservice")
            .append_pair("appId", &key.app_id)
            .append_pair("serviceName", &key.service_name)
            .append_pair("version", &key.version)
            .append_pair("env", &key.environment)
            .finish();
        let path = self.path(&format!("/existence?{}", query));
        match self.call::<ServiceIdResponse>(Method::Get, &path, None, None).await {
            Ok(found) if found.service_id.is_empty() => Ok(None),
            Ok(found) => Ok(Some(found.service_id)),
            Err(Error::ServiceNotExists(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Register a service, or return the id of the identical registered one
    pub async fn register_service(&self, service: &MicroService) -> Result<String> {
        let key = service.key();
        if let Some(existing) = self.get_service_id(&key).await? {
            debug!("Service {} already registered as {}", key, existing);
            return Ok(existing);
        }

        let body = serde_json::to_value(ServiceRequest { service })?;
        let created: ServiceIdResponse = self
            .call(Method::Post, &self.path("/microservices"), None, Some(body))
            .await?;
        if created.service_id.is_empty() {
            return Err(Error::InvalidResponse(
                "registry returned an empty service id".to_string(),
            ));
        }
        info!("Registered service {} as {}", key, created.service_id);
        Ok(created.service_id)
    }

    /// Fetch one service definition
    pub async fn get_service(&self, service_id: &str) -> Result<MicroService> {
        let path = self.path(&format!("/microservices/{}", service_id));
        let found: GetServiceResponse = self.call(Method::Get, &path, None, None).await?;
        found
            .service
            .ok_or_else(|| Error::ServiceNotExists(service_id.to_string()))
    }

    /// Fetch every service the registry knows
    pub async fn get_all_services(&self) -> Result<Vec<MicroService>> {
        let found: GetServicesResponse = self
            .call(Method::Get, &self.path("/microservices"), None, None)
            .await?;
        Ok(found.services)
    }

    /// Register an instance of `service_id`
    pub async fn register_instance(
        &self,
        service_id: &str,
        instance: &MicroServiceInstance,
    ) -> Result<String> {
        let mut instance = instance.clone();
        instance.service_id = service_id.to_string();
        let body = serde_json::to_value(InstanceRequest {
            instance: &instance,
        })?;
        let path = self.path(&format!("/microservices/{}/instances", service_id));
        let created: InstanceIdResponse = self.call(Method::Post, &path, None, Some(body)).await?;
        if created.instance_id.is_empty() {
            return Err(Error::InvalidResponse(
                "registry returned an empty instance id".to_string(),
            ));
        }
        info!(
            "Registered instance {} of service {}",
            created.instance_id, service_id
        );
        Ok(created.instance_id)
    }

    /// Remove an instance
    pub async fn unregister_instance(&self, service_id: &str, instance_id: &str) -> Result<()> {
        let path = self.path(&format!(
            "/microservices/{}/instances/{}",
            service_id, instance_id
        ));
        self.call_empty(Method::Delete, &path, None).await?;
        info!("Unregistered instance {} of service {}", instance_id, service_id);
        Ok(())
    }

    /// Send one heartbeat; `Ok(false)` when the registry rejected it
    pub async fn heartbeat(&self, service_id: &str, instance_id: &str) -> Result<bool> {
        let path = self.path(&format!(
            "/microservices/{}/instances/{}/heartbeat",
            service_id, instance_id
        ));
        let response = self.request(Method::Put, &path, None, None).await?;
        if response.is_success() {
            return Ok(true);
        }
        let error = error_from_response(&response);
        if error.is_not_exists() {
            return Err(error);
        }
        warn!(
            "Heartbeat for {}/{} rejected: {}",
            service_id, instance_id, error
        );
        Ok(false)
    }

    /// Change an instance's status
    pub async fn update_instance_status(
        &self,
        service_id: &str,
        instance_id: &str,
        status: InstanceStatus,
    ) -> Result<()> {
        let path = self.path(&format!(
            "/microservices/{}/instances/{}/status?value={}",
            service_id, instance_id, status
        ));
        self.call_empty(Method::Put, &path, None).await
    }

    /// Replace an instance's metadata
    pub async fn update_instance_properties(
        &self,
        service_id: &str,
        instance_id: &str,
        properties: &HashMap<String, String>,
    ) -> Result<()> {
        let path = self.path(&format!(
            "/microservices/{}/instances/{}/properties",
            service_id, instance_id
        ));
        let body = serde_json::to_value(PropertiesRequest { properties })?;
        self.call_empty(Method::Put, &path, Some(body)).await
    }

    /// Fetch a schema document
    pub async fn get_schema(&self, service_id: &str, schema_id: &str) -> Result<String> {
        let path = self.path(&format!(
            "/microservices/{}/schemas/{}",
            service_id, schema_id
        ));
        let found: GetSchemaResponse = self.call(Method::Get, &path, None, None).await?;
        Ok(found.schema)
    }

    /// Instances of one provider, by provider id
    pub async fn get_instances(
        &self,
        consumer_id: &str,
        provider_id: &str,
    ) -> Result<Vec<MicroServiceInstance>> {
        let path = self.path(&format!("/microservices/{}/instances", provider_id));
        let found: GetInstancesResponse = self
            .call(Method::Get, &path, Some(consumer_id), None)
            .await?;
        Ok(found.instances)
    }

    /// Instances matching one criterion, without revision tracking
    pub async fn find_service_instances(
        &self,
        consumer_id: &str,
        criteria: &FindService,
    ) -> Result<Vec<MicroServiceInstance>> {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("appId", &criteria.app_id)
            .append_pair("serviceName", &criteria.service_name)
            .append_pair("version", &criteria.version)
            .append_pair("env", &criteria.environment)
            .finish();
        let path = self.path(&format!("/instances?{}", query));
        let found: GetInstancesResponse = self
            .call(Method::Get, &path, Some(consumer_id), None)
            .await?;
        Ok(found
            .instances
            .into_iter()
            .map(|mut instance| {
                instance.service_name = criteria.service_name.clone();
                instance.app_id = criteria.app_id.clone();
                instance
            })
            .collect())
    }

    /// Incremental batch query for every criterion
    pub async fn find_instances(
        &self,
        consumer_id: &str,
        criteria: &[FindService],
    ) -> Result<FindInstancesResult> {
        if criteria.is_empty() {
            return Err(Error::EmptyCriteria);
        }

        let revision = self.revision();
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("type", "query")
            .append_pair("rev", &revision)
            .finish();
        let path = self.path(&format!("/instances/action?{}", query));
        let body = serde_json::to_value(BatchFindRequest {
            services: criteria.iter().map(|service| BatchFindItem { service }).collect(),
        })?;

        let response = self
            .request(Method::Post, &path, Some(consumer_id), Some(body))
            .await?;
        let found: BatchFindResponse = decode(&response)?;
        let services = found.services.unwrap_or_default();

        let mut result = FindInstancesResult {
            criteria: criteria.to_vec(),
            revision: response.header(HEADER_REVISION).map(str::to_string),
            not_modified: services.not_modified,
            ..Default::default()
        };
        for item in services.updated {
            let Some(criterion) = criteria.get(item.index) else {
                return Err(Error::InvalidResponse(format!(
                    "update for unknown criteria index {}",
                    item.index
                )));
            };
            let instances = item
                .instances
                .into_iter()
                .map(|mut instance| {
                    instance.service_name = criterion.service_name.clone();
                    instance.app_id = criterion.app_id.clone();
                    instance
                })
                .collect();
            result.updated.push(UpdatedService {
                index: item.index,
                instances,
            });
        }
        result.failed = services
            .failed
            .into_iter()
            .map(|f| FailedServices {
                indexes: f.indexes,
                error: f.error,
            })
            .collect();

        if let Some(revision) = &result.revision {
            self.update_revision(revision);
        }
        Ok(result)
    }

    /// Revision sent with the next incremental query
    pub fn revision(&self) -> String {
        self.revision
            .lock()
            .map(|r| r.clone())
            .unwrap_or_else(|_| REVISION_FULL.to_string())
    }

    fn update_revision(&self, revision: &str) {
        if revision.is_empty() {
            return;
        }
        if let Ok(mut current) = self.revision.lock() {
            if *current != revision {
                debug!("Revision {} -> {}", current, revision);
                *current = revision.to_string();
            }
        }
    }

    /// Force the next query to be a full resync
    pub fn reset_revision(&self) {
        if let Ok(mut current) = self.revision.lock() {
            *current = REVISION_FULL.to_string();
        }
    }

    /// Keep one push subscription for `service_id`, reconnecting until closed
    pub async fn watch_microservice(&self, service_id: &str, callback: WatchCallback) -> Result<()> {
        self.watches.watch(service_id, callback).await
    }

    /// Subscribe in the background, retrying until connected or closed
    pub fn spawn_watch(&self, service_id: &str, callback: WatchCallback) {
        self.watches.spawn_watch(service_id, callback);
    }

    /// Whether a push subscription for `service_id` is currently connected
    pub fn is_watching(&self, service_id: &str) -> bool {
        self.watches.is_active(service_id)
    }

    /// Close every stream and stop reconnect attempts. Idempotent.
    pub fn close(&self) {
        if !self.stop.is_stopped() {
            info!("Closing registry client");
        }
        self.stop.stop();
    }
}

fn decode<T: DeserializeOwned>(response: &HttpResponse) -> Result<T> {
    if !response.is_success() {
        return Err(error_from_response(response));
    }
    let body: &[u8] = if response.body.is_empty() {
        b"{}"
    } else {
        &response.body
    };
    Ok(serde_json::from_slice(body)?)
}

/// Map a non-2xx response to the error taxonomy
fn error_from_response(response: &HttpResponse) -> Error {
    if response.status == 304 {
        return Error::NotModified;
    }
    let info: ErrorInfo = serde_json::from_slice(&response.body).unwrap_or_else(|_| ErrorInfo {
        error_message: String::from_utf8_lossy(&response.body).into_owned(),
        ..Default::default()
    });
    match info.error_code.as_str() {
        ERR_SERVICE_NOT_EXISTS => Error::ServiceNotExists(info.error_message),
        ERR_INSTANCE_NOT_EXISTS => Error::InstanceNotExists(info.error_message),
        _ => Error::Http {
            status: response.status,
            code: info.error_code,
            message: info.error_message,
        },
    }
}
