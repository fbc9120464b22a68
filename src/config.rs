//! Runtime configuration for a connector.

use std::path::Path;
use std::time::Duration;

use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

use crate::Result;

/// Max payload bytes per `Data` message.
pub const MESSAGE_SIZE: usize = 4096;

/// Tunables for a [`Connector`](crate::Connector).
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Fixed sleep between failed dial attempts.
    pub reconnect_backoff: Duration,
    /// Bound on a single dial to a peer connector.
    pub connect_timeout: Duration,
    /// Max bytes read from a local socket per `Data` message.
    pub chunk_size: usize,
    /// Deadline for the half-close probe after a short read.
    pub probe_timeout: Duration,
    /// Interface the per-route TCP listeners bind to.
    pub listen_host: String,
    /// Mutual TLS material; plain-text transport when `None`.
    pub tls: Option<TlsMaterial>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            chunk_size: MESSAGE_SIZE,
            probe_timeout: Duration::from_millis(10),
            listen_host: "0.0.0.0".to_string(),
            tls: None,
        }
    }
}

impl ConnectorConfig {
    /// Set the reconnect backoff.
    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    /// Set the dial timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the max bytes read from a local socket per `Data` message.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set the half-close probe deadline.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Set the interface route listeners bind to.
    pub fn with_listen_host(mut self, host: impl Into<String>) -> Self {
        self.listen_host = host.into();
        self
    }

    /// Enable mutual TLS for outbound dials.
    pub fn with_tls(mut self, tls: TlsMaterial) -> Self {
        self.tls = Some(tls);
        self
    }

    /// URI scheme used to reach peers.
    pub(crate) fn scheme(&self) -> &'static str {
        if self.tls.is_some() {
            "https"
        } else {
            "http"
        }
    }
}

/// Certificate, key and trust pool shared by the client and server side.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    identity: Identity,
    ca: Certificate,
}

impl TlsMaterial {
    /// Build from PEM encoded certificate, private key and CA bundle.
    pub fn from_pem(
        cert: impl AsRef<[u8]>,
        key: impl AsRef<[u8]>,
        ca: impl AsRef<[u8]>,
    ) -> Self {
        Self {
            identity: Identity::from_pem(cert, key),
            ca: Certificate::from_pem(ca),
        }
    }

    /// Load PEM files from disk.
    pub fn from_files(
        cert: impl AsRef<Path>,
        key: impl AsRef<Path>,
        ca: impl AsRef<Path>,
    ) -> Result<Self> {
        let cert = std::fs::read(cert)?;
        let key = std::fs::read(key)?;
        let ca = std::fs::read(ca)?;
        Ok(Self::from_pem(cert, key, ca))
    }

    /// Client side: verify the peer against the pool, present our identity.
    pub fn client_config(&self, domain: &str) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .domain_name(domain)
            .ca_certificate(self.ca.clone())
            .identity(self.identity.clone())
    }

    /// Server side: present our identity, require client certs from the pool.
    pub fn server_config(&self) -> ServerTlsConfig {
        ServerTlsConfig::new()
            .identity(self.identity.clone())
            .client_ca_root(self.ca.clone())
    }
}
