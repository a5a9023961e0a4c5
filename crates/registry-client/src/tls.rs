//! TLS configuration for registry connections

use crate::config::TlsConfig;
use crate::error::{Error, Result};
use crate::transport::BoxedIo;
use async_net::TcpStream;
use futures_rustls::TlsConnector;
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use std::path::Path;
use std::sync::Arc;

/// Side of a connection a TLS configuration is requested for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlsRole {
    /// Calling other services (and the registry)
    Consumer,
    /// Serving requests
    Provider,
}

/// Source of ready-made client TLS settings
///
/// `Ok(None)` means "no TLS configured for this role and tag".
pub trait TlsProvider: Send + Sync {
    /// Client configuration for `role` and `service_tag`
    fn client_config(&self, role: TlsRole, service_tag: &str) -> Result<Option<TlsClientConfig>>;
}

/// TLS configuration for client
#[derive(Clone)]
pub struct TlsClientConfig {
    /// rustls settings
    pub config: Arc<ClientConfig>,
    /// Name presented for certificate validation
    pub server_name: String,
}

impl TlsClientConfig {
    /// Client configuration trusting the bundled web roots
    pub fn with_web_roots(server_name: impl Into<String>) -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self {
            config: Arc::new(config),
            server_name: server_name.into(),
        }
    }

    /// Client configuration trusting the CA certificates in a PEM file
    pub async fn with_ca_cert(ca_cert_path: impl AsRef<Path>, server_name: impl Into<String>) -> Result<Self> {
        let ca_bytes = async_fs::read(ca_cert_path.as_ref())
            .await
            .map_err(|e| Error::Tls(format!("Failed to read CA certificate: {}", e)))?;

        let ca_certs = rustls_pemfile::certs(&mut ca_bytes.as_slice())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Tls(format!("Failed to parse CA certificates: {}", e)))?;
        if ca_certs.is_empty() {
            return Err(Error::Tls("No certificates found in CA file".to_string()));
        }

        let mut roots = rustls::RootCertStore::empty();
        for cert in ca_certs {
            roots
                .add(cert)
                .map_err(|e| Error::Tls(format!("Failed to add CA certificate: {}", e)))?;
        }

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            config: Arc::new(config),
            server_name: server_name.into(),
        })
    }

    /// Build from the registry TLS section
    pub async fn from_config(tls: &TlsConfig) -> Result<Self> {
        match &tls.ca_cert_path {
            Some(path) => Self::with_ca_cert(path, tls.server_name.clone()).await,
            None => Ok(Self::with_web_roots(tls.server_name.clone())),
        }
    }

    /// Underlying rustls configuration
    pub(crate) fn rustls_config(&self) -> &Arc<ClientConfig> {
        &self.config
    }

    /// Run the TLS handshake over `tcp`
    pub(crate) async fn wrap(&self, tcp: TcpStream) -> Result<BoxedIo> {
        let name = ServerName::try_from(self.server_name.clone())
            .map_err(|e| Error::Tls(format!("Invalid server name '{}': {}", self.server_name, e)))?;
        let stream = TlsConnector::from(self.config.clone())
            .connect(name, tcp)
            .await?;
        Ok(Box::new(stream))
    }
}

/// Provider handing out one configuration for the consumer role
pub struct StaticTlsProvider {
    consumer: Option<TlsClientConfig>,
}

impl StaticTlsProvider {
    /// Serve `consumer` for every consumer request
    pub fn new(consumer: Option<TlsClientConfig>) -> Self {
        Self { consumer }
    }
}

impl TlsProvider for StaticTlsProvider {
    fn client_config(&self, role: TlsRole, _service_tag: &str) -> Result<Option<TlsClientConfig>> {
        Ok(match role {
            TlsRole::Consumer => self.consumer.clone(),
            TlsRole::Provider => None,
        })
    }
}
