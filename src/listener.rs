//! TCP side of a route: accept loops, read-forward loops and backend dials.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::buffered_conn::BufferedConn;
use crate::peer::PeerStream;
use crate::proto::OpenData;
use crate::server::Core;
use crate::service::{ListenerHandle, Service};
use crate::{Error, Result};

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY: Duration = Duration::from_millis(50);

impl Core {
    /// Bind the route listener on `port` and start accepting.
    pub(crate) async fn start_listener(
        self: &Arc<Self>,
        peer: &Arc<PeerStream>,
        service: &Arc<Service>,
        port: u16,
    ) -> Result<()> {
        let listener = TcpListener::bind((self.config.listen_host.as_str(), port)).await?;
        info!(service_id = %service.id(), port, "listening for connections");

        let token = self.shutdown.child_token();
        let task = tokio::spawn(self.clone().accept_loop(
            peer.clone(),
            service.clone(),
            listener,
            token.clone(),
        ));
        if let Some(previous) = service.set_listener(ListenerHandle::new(port, token, task)) {
            previous.close().await;
        }
        if service.is_retired() {
            if let Some(handle) = service.take_listener() {
                debug!(service_id = %service.id(), port, "route removed while binding, closing listener");
                handle.close().await;
            }
        }
        Ok(())
    }

    async fn accept_loop(
        self: Arc<Self>,
        peer: Arc<PeerStream>,
        service: Arc<Service>,
        listener: TcpListener,
        token: CancellationToken,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, remote)) => {
                    let conn = Arc::new(BufferedConn::new(uuid::Uuid::new_v4().to_string(), stream));
                    debug!(
                        service_id = %service.id(),
                        connection_id = %conn.id(),
                        %remote,
                        "accepted connection"
                    );
                    tokio::select! {
                        _ = token.cancelled() => {
                            conn.close().await;
                            break;
                        }
                        _ = service.bind(conn.clone()) => {}
                    }
                    tokio::spawn(self.clone().forward(peer.clone(), service.clone(), conn));
                }
                Err(error) => {
                    warn!(service_id = %service.id(), %error, "error accepting connection");
                    tokio::time::sleep(ACCEPT_RETRY).await;
                }
            }
        }
        debug!(service_id = %service.id(), "listener closed");
    }

    /// Relay bytes read from `conn` to the peer until either end closes.
    pub(crate) async fn forward(
        self: Arc<Self>,
        peer: Arc<PeerStream>,
        service: Arc<Service>,
        conn: Arc<BufferedConn>,
    ) {
        let (service_id, connection_id) = (service.id(), conn.id());
        let mut buf = vec![0u8; self.config.chunk_size];
        let mut seq: i32 = 0;

        loop {
            let n = match conn.read(&mut buf).await {
                Ok(0) => {
                    debug!(%service_id, %connection_id, "connection closed by local end");
                    break;
                }
                Ok(n) => n,
                Err(error) => {
                    if !conn.is_closed() {
                        warn!(%service_id, %connection_id, %error, "unable to read from connection");
                    }
                    break;
                }
            };

            trace!(%service_id, %connection_id, seq, len = n, "forwarding data to peer");
            if let Err(error) = peer
                .send(OpenData::data(service_id, connection_id, seq, buf[..n].to_vec()))
                .await
            {
                warn!(%service_id, %connection_id, %error, "unable to send data to peer");
            }
            seq = seq.wrapping_add(1);

            if n < buf.len() && conn.remote_closed(self.config.probe_timeout).await {
                debug!(%service_id, %connection_id, "connection half-closed by local end");
                break;
            }
        }

        // a local close came from the peer or from teardown, neither needs a reply
        let notify = !conn.is_closed();
        conn.close().await;
        service.unbind(connection_id);
        if notify {
            if let Err(error) = peer.send(OpenData::closed(service_id, connection_id)).await {
                debug!(%service_id, %connection_id, %error, "unable to send closed to peer");
            }
        }
    }

    /// Dial the backend of a route for a connection first seen on the wire.
    pub(crate) async fn dial_backend(
        self: &Arc<Self>,
        peer: &Arc<PeerStream>,
        service: &Arc<Service>,
        connection_id: &str,
    ) -> Result<Arc<BufferedConn>> {
        let addr = self.integration.lookup_address(service.id()).await?;
        debug!(service_id = %service.id(), %connection_id, %addr, "dialing backend");

        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr.as_str()))
            .await
            .map_err(|_| Error::connection(format!("timed out dialing {addr}")))??;

        let conn = Arc::new(BufferedConn::new(connection_id, stream));
        service.bind(conn.clone()).await;
        tokio::spawn(self.clone().forward(peer.clone(), service.clone(), conn.clone()));
        Ok(conn)
    }
}
