//! Error types for the registry client

use thiserror::Error;

/// Registry error code for "micro-service does not exist"
pub const ERR_SERVICE_NOT_EXISTS: &str = "400012";

/// Registry error code for "instance does not exist"
pub const ERR_INSTANCE_NOT_EXISTS: &str = "400017";

/// Registry client error type
#[derive(Error, Debug)]
pub enum Error {
    /// Nothing changed since the revision we sent
    #[error("Not modified")]
    NotModified,

    /// The query carried no criteria
    #[error("Empty criteria")]
    EmptyCriteria,

    /// The registry does not know the service
    #[error("Micro-service does not exist: {0}")]
    ServiceNotExists(String),

    /// The registry does not know the instance
    #[error("Instance does not exist: {0}")]
    InstanceNotExists(String),

    /// Non-success HTTP status from the registry
    #[error("Registry returned {status} (code {code}): {message}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Registry error code, empty when the body carried none
        code: String,
        /// Error detail
        message: String,
    },

    /// Response could not be understood
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Request did not finish in time
    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// No registry endpoint could be reached
    #[error("Registry unavailable: {0}")]
    Unavailable(String),

    /// Service identity is unusable
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// TLS setup failed
    #[error("TLS error: {0}")]
    Tls(String),

    /// The client was closed
    #[error("Client closed")]
    Closed,

    /// HTTP client error
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Protocol conditions that callers treat as a successful no-op
    pub fn is_benign(&self) -> bool {
        matches!(self, Error::NotModified | Error::EmptyCriteria)
    }

    /// Registry declared the service or instance unknown
    pub fn is_not_exists(&self) -> bool {
        matches!(
            self,
            Error::ServiceNotExists(_) | Error::InstanceNotExists(_)
        )
    }

    /// Failures that say nothing about the data, only about reaching the registry
    pub fn is_connectivity(&self) -> bool {
        match self {
            Error::Io(_) | Error::Timeout(_) | Error::Unavailable(_) | Error::WebSocket(_) => true,
            Error::Request(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            Error::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
