//! Reconnection engine.
//!
//! Keeps an outbound peer reachable: dials with a fixed backoff until the
//! connector shuts down, then (re)announces every route the peer should
//! mirror.

use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use tracing::{debug, info, warn};

use crate::client;
use crate::peer::{Claim, PeerStream};
use crate::proto::{OpenData, ServiceStatus};
use crate::server::Core;
use crate::service::Service;
use crate::stream::MuxConnection;
use crate::Result;

impl Core {
    /// Run the engine for `peer` in the background.
    pub(crate) fn spawn_reconnect(self: &Arc<Self>, peer: Arc<PeerStream>) {
        let task: BoxFuture<'static, ()> = self.clone().reconnect(peer).boxed();
        tokio::spawn(task);
    }

    async fn reconnect(self: Arc<Self>, peer: Arc<PeerStream>) {
        if self.is_shutdown() {
            return;
        }

        let conn = match peer.claim() {
            Claim::Busy => {
                debug!(addr = %peer.addr(), "connection attempt already in progress");
                return;
            }
            Claim::Live(conn) => conn,
            Claim::Dial(guard) => {
                let Some(conn) = self.dial(&peer).await else {
                    debug!(addr = %peer.addr(), "stopped reconnecting, connector is shutting down");
                    return;
                };
                guard.connected(conn.clone());
                if self.is_shutdown() {
                    peer.close();
                    return;
                }
                tokio::spawn(self.clone().outbound_loop(peer.clone(), conn.clone()));
                conn
            }
        };

        self.announce(&peer, &conn).await;
    }

    /// Dial until a stream is open. `None` once the connector shuts down.
    async fn dial(&self, peer: &PeerStream) -> Option<Arc<MuxConnection>> {
        loop {
            if self.is_shutdown() {
                return None;
            }

            info!(addr = %peer.addr(), "connecting to peer");
            match self.open(peer.addr()).await {
                Ok(conn) => return Some(conn),
                Err(error) => warn!(
                    addr = %peer.addr(),
                    %error,
                    backoff = ?self.config.reconnect_backoff,
                    "unable to open stream to peer, retrying"
                ),
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = tokio::time::sleep(self.config.reconnect_backoff) => {}
            }
        }
    }

    async fn open(&self, addr: &str) -> Result<Arc<MuxConnection>> {
        let conn = Arc::new(client::open_stream(addr, &self.config).await?);
        debug!(%addr, conn = conn.id(), "stream established, pinging peer");
        if let Err(error) = conn.send(OpenData::ping()).await {
            conn.close();
            return Err(error);
        }
        Ok(conn)
    }

    /// Prepare local resources and send `Expose` for every healthy route.
    async fn announce(self: &Arc<Self>, peer: &Arc<PeerStream>, conn: &MuxConnection) {
        for service in peer.services().snapshot() {
            if service.status() == ServiceStatus::Error {
                continue;
            }

            if let Err(error) = self.prepare(peer, &service).await {
                warn!(service_id = %service.id(), %error, "unable to set up service");
                service.set_status(ServiceStatus::Error, error.to_string());
                continue;
            }

            if service.is_retired() {
                debug!(service_id = %service.id(), "service destroyed during announce");
                service.teardown(self.integration.as_ref()).await;
                continue;
            }

            debug!(service_id = %service.id(), addr = %peer.addr(), "sending expose to peer");
            if let Err(error) = conn.send(OpenData::expose(service.descriptor())).await {
                warn!(service_id = %service.id(), %error, "unable to announce service");
            }
        }
    }

    /// Register the route locally and open its listener when this side owns it.
    async fn prepare(self: &Arc<Self>, peer: &Arc<PeerStream>, service: &Arc<Service>) -> Result<()> {
        let descriptor = service.descriptor();
        let details = self
            .integration
            .register(service.id(), descriptor.r#type(), &descriptor.config)
            .await?;

        if service.owns_listener() && !service.has_listener() {
            self.start_listener(peer, service, details.port).await?;
        }
        Ok(())
    }
}
