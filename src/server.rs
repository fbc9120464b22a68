//! The connector facade and its RPC surface.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use crate::config::ConnectorConfig;
use crate::integration::{sanitize_name, Integration, CONFIG_ADDRESS, CONFIG_NAME, CONFIG_PORT};
use crate::peer::{PeerStream, StreamRegistry};
use crate::proto::remote_connection_server::RemoteConnection;
use crate::proto::{self, OpenData, ServiceStatus, ServiceType};
use crate::service::{locked, Origin, Service};
use crate::stream::MuxConnection;
use crate::{Error, Result};

/// State shared by every task of a connector.
pub(crate) struct Core {
    pub(crate) config: ConnectorConfig,
    pub(crate) integration: Arc<dyn Integration>,
    pub(crate) streams: StreamRegistry,
    pub(crate) shutdown: CancellationToken,
    expose_lock: Mutex<()>,
}

impl Core {
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// A tunneling connector.
///
/// Exposes local TCP services to peer connectors and consumes theirs, all
/// routes to one peer sharing a single multiplexed gRPC stream. Cloning is
/// cheap and every clone drives the same state.
///
/// # Example
/// ```rust,no_run
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// use std::sync::Arc;
/// use tunnel_connector::{proto, Connector, ConnectorConfig, LocalIntegration, RpcServer};
///
/// let connector = Connector::new(Arc::new(LocalIntegration::new()), ConnectorConfig::default());
/// let listener = tokio::net::TcpListener::bind("0.0.0.0:9090").await?;
/// let guard = RpcServer::new(connector.clone()).serve(listener).await?;
///
/// let mut route = proto::Service {
///     name: "web".into(),
///     source_port: 8080,
///     destination_addr: "127.0.0.1:3000".into(),
///     remote_connector_addr: "10.0.0.2:9090".into(),
///     ..Default::default()
/// };
/// route.set_type(proto::ServiceType::Local);
/// let id = connector.expose_service(route).await?;
/// # let _ = id;
/// guard.shutdown().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Connector {
    core: Arc<Core>,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("config", &self.core.config)
            .field("shutdown", &self.core.is_shutdown())
            .finish()
    }
}

impl Connector {
    /// Create a connector backed by `integration`.
    pub fn new(integration: Arc<dyn Integration>, config: ConnectorConfig) -> Self {
        Self {
            core: Arc::new(Core {
                config,
                integration,
                streams: StreamRegistry::new(),
                shutdown: CancellationToken::new(),
                expose_lock: Mutex::new(()),
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.core
    }

    /// Configuration in use.
    pub fn config(&self) -> &ConnectorConfig {
        &self.core.config
    }

    /// Register a route and start announcing it to its peer.
    ///
    /// Returns the generated id immediately; the route becomes `COMPLETE`
    /// once the peer has mirrored it, as reported by
    /// [`list_services`](Connector::list_services).
    pub async fn expose_service(&self, mut service: proto::Service) -> Result<String> {
        validate(&service)?;

        let peer = {
            let _expose = locked(&self.core.expose_lock);
            if self.core.streams.contains_route(&service) {
                return Err(Error::AlreadyExists(format!(
                    "{}:{}",
                    service.remote_connector_addr, service.source_port
                )));
            }

            service.id = uuid::Uuid::new_v4().to_string();
            apply_default_config(&mut service);
            service.set_status(ServiceStatus::Pending);
            service.error_message.clear();
            service.details.clear();

            let peer = self.core.streams.get_or_create(&service.remote_connector_addr);
            peer.services().add(
                service.id.clone(),
                Arc::new(Service::new(service.clone(), Origin::Exposer)),
            );
            peer
        };

        info!(
            service_id = %service.id,
            name = %service.name,
            kind = service.r#type().as_str(),
            addr = %service.remote_connector_addr,
            "exposing service"
        );
        self.core.spawn_reconnect(peer);
        Ok(service.id)
    }

    /// Remove a route here and on its peer.
    pub async fn destroy_service(&self, id: &str) -> Result<()> {
        let (peer, service) = self
            .core
            .streams
            .find_by_service_id(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        info!(service_id = %id, addr = %peer.addr(), "destroying service");
        // unregister first so a concurrent announce cannot reopen the listener
        peer.services().delete(id);
        service.teardown(self.core.integration.as_ref()).await;

        if let Err(error) = peer.send(OpenData::destroy(id)).await {
            warn!(service_id = %id, %error, "unable to notify peer of destroy");
        }
        Ok(())
    }

    /// Every route known to this connector.
    pub fn list_services(&self) -> Vec<proto::Service> {
        self.core
            .streams
            .snapshot()
            .iter()
            .flat_map(|peer| peer.services().snapshot())
            .map(|service| service.descriptor())
            .collect()
    }

    /// Whether [`shutdown`](Connector::shutdown) has been called.
    pub fn is_shutdown(&self) -> bool {
        self.core.is_shutdown()
    }

    /// Stop reconnecting, close every listener and connection, and close
    /// every multiplexed stream.
    pub async fn shutdown(&self) {
        if self.core.is_shutdown() {
            return;
        }
        info!("shutting down connector");
        self.core.shutdown.cancel();

        for peer in self.core.streams.snapshot() {
            peer.teardown_connection(self.core.integration.as_ref()).await;
            peer.close();
        }
    }

    /// Accept a multiplexed stream opened by a peer.
    pub(crate) fn accept_stream(
        &self,
        requests: Streaming<OpenData>,
    ) -> Result<ReceiverStream<std::result::Result<OpenData, Status>>> {
        if self.core.is_shutdown() {
            return Err(Error::connection("connector is shutting down"));
        }

        let (conn, responses) = MuxConnection::inbound(requests);
        let conn = Arc::new(conn);
        self.core.streams.add(Arc::new(PeerStream::inbound(conn.clone())));

        debug!(conn = conn.id(), "accepted stream from peer");
        tokio::spawn(self.core.clone().inbound_loop(conn));
        Ok(responses)
    }
}

fn validate(service: &proto::Service) -> Result<()> {
    let kind = ServiceType::try_from(service.r#type)
        .map_err(|_| Error::invalid(format!("unknown service type {}", service.r#type)))?;
    if service.remote_connector_addr.is_empty() {
        return Err(Error::invalid("remote_connector_addr is required"));
    }
    if !(1..=i32::from(u16::MAX)).contains(&service.source_port) {
        return Err(Error::invalid(format!(
            "source_port {} is not a valid port",
            service.source_port
        )));
    }
    if kind == ServiceType::Local && service.destination_addr.is_empty() {
        return Err(Error::invalid("destination_addr is required for LOCAL services"));
    }
    Ok(())
}

fn apply_default_config(service: &mut proto::Service) {
    let defaults: HashMap<&str, String> = HashMap::from([
        (CONFIG_NAME, sanitize_name(&service.name)),
        (CONFIG_PORT, service.source_port.to_string()),
        (CONFIG_ADDRESS, service.destination_addr.clone()),
    ]);
    for (key, value) in defaults {
        if !value.is_empty() {
            service.config.entry(key.to_string()).or_insert(value);
        }
    }
}

#[tonic::async_trait]
impl RemoteConnection for Connector {
    type OpenStreamStream = ReceiverStream<std::result::Result<OpenData, Status>>;

    async fn open_stream(
        &self,
        request: Request<Streaming<OpenData>>,
    ) -> std::result::Result<Response<Self::OpenStreamStream>, Status> {
        let responses = self
            .accept_stream(request.into_inner())
            .map_err(|e| Status::unavailable(e.to_string()))?;
        Ok(Response::new(responses))
    }

    async fn expose_service(
        &self,
        request: Request<proto::ExposeRequest>,
    ) -> std::result::Result<Response<proto::ExposeResponse>, Status> {
        let service = request
            .into_inner()
            .service
            .ok_or_else(|| Status::invalid_argument("service is required"))?;
        let id = Connector::expose_service(self, service).await?;
        Ok(Response::new(proto::ExposeResponse { id }))
    }

    async fn destroy_service(
        &self,
        request: Request<proto::DestroyRequest>,
    ) -> std::result::Result<Response<proto::NullMessage>, Status> {
        Connector::destroy_service(self, &request.into_inner().id).await?;
        Ok(Response::new(proto::NullMessage {}))
    }

    async fn list_services(
        &self,
        _request: Request<proto::NullMessage>,
    ) -> std::result::Result<Response<proto::ListResponse>, Status> {
        Ok(Response::new(proto::ListResponse {
            services: Connector::list_services(self),
        }))
    }
}
