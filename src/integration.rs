//! Boundary to the environment a connector runs in.
//!
//! An [`Integration`] resolves a logical route to a physical address and
//! performs any platform side effects (for example creating a cluster
//! service that points at the route listener).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::proto::ServiceType;
use crate::{Error, Result};

/// Config key holding the sanitized route name.
pub const CONFIG_NAME: &str = "name";
/// Config key holding the listener port.
pub const CONFIG_PORT: &str = "port";
/// Config key holding the backend `host:port`.
pub const CONFIG_ADDRESS: &str = "address";

/// Location of a registered route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDetails {
    /// Host of the resolved endpoint.
    pub address: String,
    /// Port of the resolved endpoint, also the listener port for listener-owning routes.
    pub port: u16,
}

/// Environment specific registration of routes.
#[async_trait]
pub trait Integration: Send + Sync + 'static {
    /// Register a route component.
    ///
    /// `kind` is the component being registered on this connector: `Local`
    /// for the side that owns the backend, `Remote` for the side that owns
    /// the listener.
    async fn register(
        &self,
        id: &str,
        kind: ServiceType,
        config: &HashMap<String, String>,
    ) -> Result<ServiceDetails>;

    /// Remove any side effects of [`register`](Integration::register).
    async fn deregister(&self, id: &str) -> Result<()>;

    /// Resolve a registered route to a dialable `host:port`.
    async fn lookup_address(&self, id: &str) -> Result<String>;

    /// Integration specific details, reported back to the exposing connector.
    async fn get_details(&self, id: &str) -> Result<HashMap<String, String>>;
}

/// Turn a free-form name into a URI friendly one.
///
/// `"Test Service"` becomes `"test-service"`.
pub fn sanitize_name(original: &str) -> String {
    let mut out = String::with_capacity(original.len());
    let mut in_run = false;
    for c in original.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            in_run = false;
        } else if !in_run {
            out.push('-');
            in_run = true;
        }
    }
    out
}

/// Integration for connectors running directly on a host.
///
/// The backend side resolves the `address` config key, the listener side
/// resolves the `port` config key on `localhost`.
#[derive(Debug, Default)]
pub struct LocalIntegration {
    cache: Mutex<HashMap<String, ServiceDetails>>,
}

impl LocalIntegration {
    /// Create an empty integration.
    pub fn new() -> Self {
        Self::default()
    }

    fn cached(&self, id: &str) -> Option<ServiceDetails> {
        self.cache.lock().ok()?.get(id).cloned()
    }
}

fn port_from_config(config: &HashMap<String, String>) -> Result<u16> {
    let port = config
        .get(CONFIG_PORT)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| Error::integration(r#""port", missing from configuration"#))?;
    port.parse()
        .map_err(|_| Error::integration(r#""port" must be a number"#))
}

fn address_from_config(config: &HashMap<String, String>) -> Result<ServiceDetails> {
    let addr = config
        .get(CONFIG_ADDRESS)
        .filter(|a| !a.is_empty())
        .ok_or_else(|| Error::integration(r#""address", missing from configuration"#))?;
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::integration(format!("address {addr} must be host:port")))?;
    let port = port
        .parse()
        .map_err(|_| Error::integration(format!("address {addr} has an invalid port")))?;
    Ok(ServiceDetails {
        address: host.to_string(),
        port,
    })
}

#[async_trait]
impl Integration for LocalIntegration {
    async fn register(
        &self,
        id: &str,
        kind: ServiceType,
        config: &HashMap<String, String>,
    ) -> Result<ServiceDetails> {
        let details = match kind {
            ServiceType::Local => address_from_config(config)?,
            ServiceType::Remote => ServiceDetails {
                address: "localhost".to_string(),
                port: port_from_config(config)?,
            },
        };
        debug!(service_id = %id, kind = kind.as_str(), ?details, "registered service");

        self.cache
            .lock()
            .map_err(|_| Error::integration("cache poisoned"))?
            .insert(id.to_string(), details.clone());
        Ok(details)
    }

    async fn deregister(&self, id: &str) -> Result<()> {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(id);
        }
        Ok(())
    }

    async fn lookup_address(&self, id: &str) -> Result<String> {
        let details = self
            .cached(id)
            .ok_or_else(|| Error::integration(format!("unable to find address for id: {id}")))?;
        Ok(format!("{}:{}", details.address, details.port))
    }

    async fn get_details(&self, id: &str) -> Result<HashMap<String, String>> {
        let addr = self.lookup_address(id).await?;
        Ok(HashMap::from([(CONFIG_ADDRESS.to_string(), addr)]))
    }
}
