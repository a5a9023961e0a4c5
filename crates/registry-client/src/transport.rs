//! Request/response transport towards the registry
//!
//! [`Transport`] is the seam the protocol client talks through. The bundled
//! [`HttpTransport`] runs on `reqwest`; [`Connector`] opens the raw streams
//! the watch socket needs.

use crate::error::{Error, Result};
use async_net::TcpStream;
use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use serde::Serialize;
use std::fmt;
use tracing::debug;

/// Any bidirectional byte stream the client can run HTTP or WebSocket over
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// Boxed connection returned by [`Connector::connect`]
pub type BoxedIo = Box<dyn Io>;

/// HTTP method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        })
    }
}

/// Outgoing request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Method
    pub method: Method,
    /// Target `host:port`
    pub address: String,
    /// Path including the query string
    pub path: String,
    /// Extra headers
    pub headers: Vec<(String, String)>,
    /// JSON body
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    /// Create a request without body
    pub fn new(method: Method, address: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method,
            address: address.into(),
            path: path.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Add a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Attach a JSON body
    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self> {
        self.body = Some(serde_json::to_vec(body)?);
        Ok(self)
    }

    /// Value of a header (case-insensitive)
    pub fn header_value(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Body decoded as JSON
    pub fn json_body(&self) -> Option<serde_json::Value> {
        self.body
            .as_deref()
            .and_then(|body| serde_json::from_slice(body).ok())
    }
}

/// Incoming response
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    /// Status code
    pub status: u16,
    /// Headers in arrival order
    pub headers: Vec<(String, String)>,
    /// Body bytes
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Response with a JSON body
    pub fn json<T: Serialize>(status: u16, body: &T) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: serde_json::to_vec(body).unwrap_or_default(),
        }
    }

    /// Response without body
    pub fn empty(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    /// Add a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Value of a header (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Whether the status is 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Opens (optionally TLS-wrapped) connections to registry endpoints
#[derive(Clone, Default)]
pub struct Connector {
    #[cfg(feature = "tls")]
    tls: Option<crate::tls::TlsClientConfig>,
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("tls", &self.is_tls())
            .finish()
    }
}

impl Connector {
    /// Plain TCP connector
    pub fn plain() -> Self {
        Self::default()
    }

    /// TLS connector
    #[cfg(feature = "tls")]
    pub fn with_tls(tls: crate::tls::TlsClientConfig) -> Self {
        Self { tls: Some(tls) }
    }

    /// Whether connections are TLS-wrapped
    pub fn is_tls(&self) -> bool {
        #[cfg(feature = "tls")]
        {
            self.tls.is_some()
        }
        #[cfg(not(feature = "tls"))]
        {
            false
        }
    }

    /// TLS settings, if any
    #[cfg(feature = "tls")]
    pub fn tls(&self) -> Option<&crate::tls::TlsClientConfig> {
        self.tls.as_ref()
    }

    /// Open a connection to `host:port`
    pub async fn connect(&self, address: &str) -> Result<BoxedIo> {
        let tcp = TcpStream::connect(address).await?;
        #[cfg(feature = "tls")]
        {
            if let Some(tls) = &self.tls {
                return tls.wrap(tcp).await;
            }
        }
        Ok(Box::new(tcp))
    }
}

/// Request/response exchange with the registry
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request and wait for the whole response
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// HTTP transport backed by a pooled `reqwest` client
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    scheme: &'static str,
}

impl HttpTransport {
    /// Create a transport; TLS settings of `connector` switch it to https
    pub fn new(connector: &Connector) -> Result<Self> {
        let builder = reqwest::Client::builder()
            .user_agent(concat!("registry-client/", env!("CARGO_PKG_VERSION")));
        #[cfg(feature = "tls")]
        let builder = match connector.tls() {
            Some(tls) => builder.use_preconfigured_tls(tls.rustls_config().as_ref().clone()),
            None => builder,
        };
        let client = builder
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            scheme: if connector.is_tls() { "https" } else { "http" },
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        debug!("{} {}{}", request.method, request.address, request.path);
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        };
        let url = format!("{}://{}{}", self.scheme, request.address, request.path);

        let mut builder = self
            .client
            .request(method, url)
            .header(reqwest::header::ACCEPT, "application/json");
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        // reqwest needs a tokio reactor; Compat provides one under smol
        let exchange = async move {
            let response = builder.send().await?;
            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.as_str().to_string(), value.to_string()))
                })
                .collect();
            let body = response.bytes().await?.to_vec();
            Ok::<_, reqwest::Error>(HttpResponse {
                status,
                headers,
                body,
            })
        };
        Ok(async_compat::Compat::new(exchange).await?)
    }
}

/// Scripted transport for tests
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Handler = dyn Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync;

    /// Transport answering every request with a closure and recording it
    #[derive(Clone)]
    pub struct MockTransport {
        handler: Arc<Handler>,
        requests: Arc<Mutex<Vec<HttpRequest>>>,
    }

    impl MockTransport {
        /// Answer requests with `handler`
        pub fn new<F>(handler: F) -> Self
        where
            F: Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync + 'static,
        {
            Self {
                handler: Arc::new(handler),
                requests: Arc::new(Mutex::new(Vec::new())),
            }
        }

        /// Every request seen so far
        pub fn requests(&self) -> Vec<HttpRequest> {
            self.requests.lock().map(|r| r.clone()).unwrap_or_default()
        }

        /// Requests whose path starts with `prefix`
        pub fn requests_to(&self, prefix: &str) -> Vec<HttpRequest> {
            self.requests()
                .into_iter()
                .filter(|r| r.path.starts_with(prefix))
                .collect()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
            if let Ok(mut requests) = self.requests.lock() {
                requests.push(request.clone());
            }
            (self.handler)(&request)
        }
    }
}
