//! Dialing peer connectors.

use http::Uri;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, Endpoint};
use tower::service_fn;
use tracing::{debug, info};

use crate::config::ConnectorConfig;
use crate::proto::remote_connection_client::RemoteConnectionClient;
use crate::stream::{MuxConnection, STREAM_BUFFER};
use crate::Result;

/// gRPC client for a connector's control surface.
pub type ConnectorClient = RemoteConnectionClient<Channel>;

/// Connect to the connector listening on `addr` (`host:port`).
///
/// Uses mutual TLS when `config` carries TLS material.
///
/// # Example
/// ```rust,no_run
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// use tunnel_connector::{connect, proto, ConnectorConfig};
///
/// let mut client = connect("127.0.0.1:9090", &ConnectorConfig::default()).await?;
/// let services = client.list_services(proto::NullMessage {}).await?.into_inner();
/// println!("{} routes", services.services.len());
/// # Ok(())
/// # }
/// ```
pub async fn connect(addr: &str, config: &ConnectorConfig) -> Result<ConnectorClient> {
    Ok(RemoteConnectionClient::new(connect_channel(addr, config).await?))
}

async fn connect_channel(addr: &str, config: &ConnectorConfig) -> Result<Channel> {
    debug!(%addr, scheme = config.scheme(), "connecting to peer");

    let uri: Uri = format!("{}://{addr}", config.scheme()).parse()?;
    let mut endpoint = Endpoint::from(uri).connect_timeout(config.connect_timeout);
    if let Some(tls) = &config.tls {
        endpoint = endpoint.tls_config(tls.client_config(host_of(addr)))?;
    }

    let target = addr.to_string();
    let channel = endpoint
        .connect_with_connector(service_fn(move |_: Uri| {
            let target = target.clone();
            async move {
                let stream = TcpStream::connect(&target).await?;
                stream.set_nodelay(true)?;
                Ok::<_, std::io::Error>(TokioIo::new(stream))
            }
        }))
        .await?;

    info!(%addr, "connected to peer");
    Ok(channel)
}

/// Dial `addr` and open the multiplexed stream.
pub(crate) async fn open_stream(addr: &str, config: &ConnectorConfig) -> Result<MuxConnection> {
    let channel = connect_channel(addr, config).await?;
    let mut client = RemoteConnectionClient::new(channel.clone());

    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let responses = client.open_stream(ReceiverStream::new(rx)).await?;
    Ok(MuxConnection::outbound(channel, tx, responses.into_inner()))
}

/// Host part of `host:port`, used as the TLS server name.
fn host_of(addr: &str) -> &str {
    let host = addr.rsplit_once(':').map_or(addr, |(host, _)| host);
    host.trim_start_matches('[').trim_end_matches(']')
}
