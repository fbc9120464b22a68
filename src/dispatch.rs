//! Handling of messages received on a multiplexed stream.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::peer::PeerStream;
use crate::proto::{self, open_data::Message, OpenData, ServiceStatus};
use crate::server::Core;
use crate::service::{Origin, Service};
use crate::stream::MuxConnection;
use crate::Result;

impl Core {
    /// Receive loop for a stream this connector dialed.
    ///
    /// A failed stream tears down the peer's routes and restarts the
    /// reconnection engine, unless it was closed locally.
    pub(crate) async fn outbound_loop(self: Arc<Self>, peer: Arc<PeerStream>, conn: Arc<MuxConnection>) {
        loop {
            match conn.recv().await {
                Ok(msg) => self.dispatch(&peer, msg).await,
                Err(error) => {
                    if conn.is_closed() || self.is_shutdown() {
                        debug!(addr = %peer.addr(), conn = conn.id(), "stream closed");
                        return;
                    }

                    warn!(addr = %peer.addr(), %error, "lost stream to peer, reconnecting");
                    peer.disconnect(&conn);
                    conn.close();
                    peer.teardown_connection(self.integration.as_ref()).await;
                    self.spawn_reconnect(peer);
                    return;
                }
            }
        }
    }

    /// Receive loop for a stream a peer dialed.
    ///
    /// The peer reconnects on its own, so a failed stream only releases the
    /// routes it declared.
    pub(crate) async fn inbound_loop(self: Arc<Self>, conn: Arc<MuxConnection>) {
        let Some(peer) = self.streams.find_by_connection(conn.id()) else {
            warn!(conn = conn.id(), "no peer registered for inbound stream");
            conn.close();
            return;
        };

        loop {
            match conn.recv().await {
                Ok(msg) => self.dispatch(&peer, msg).await,
                Err(error) => {
                    if conn.is_closed() {
                        debug!(conn = conn.id(), "inbound stream closed");
                    } else {
                        info!(conn = conn.id(), %error, "inbound stream ended, tearing down routes");
                    }
                    conn.close();
                    peer.teardown_connection(self.integration.as_ref()).await;
                    self.streams.remove(&peer);
                    return;
                }
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, peer: &Arc<PeerStream>, msg: OpenData) {
        let kind = msg.kind();
        trace!(
            service_id = %msg.service_id,
            connection_id = %msg.connection_id,
            kind,
            "received message"
        );

        let OpenData {
            service_id,
            connection_id,
            message,
        } = msg;

        match message {
            Some(Message::Expose(request)) if peer.is_inbound() => {
                self.handle_expose(peer, request).await
            }
            Some(Message::Destroy(request)) if peer.is_inbound() => {
                self.handle_destroy(peer, &request.id).await
            }
            Some(Message::StatusUpdate(update)) if !peer.is_inbound() => {
                self.handle_status(peer, &service_id, update)
            }
            Some(Message::Data(data)) => {
                self.handle_data(peer, &service_id, &connection_id, data).await
            }
            Some(Message::Closed(_)) => self.handle_closed(peer, &service_id, &connection_id).await,
            Some(Message::Ping(_)) => trace!(addr = %peer.addr(), "ping"),
            Some(_) => warn!(addr = %peer.addr(), kind, "unexpected message for stream direction"),
            None => warn!(addr = %peer.addr(), "empty message"),
        }
    }

    /// Mirror a route declared by the peer and report the outcome.
    async fn handle_expose(self: &Arc<Self>, peer: &Arc<PeerStream>, request: proto::ExposeRequest) {
        let Some(mut descriptor) = request.service else {
            warn!("expose without service");
            return;
        };
        let id = descriptor.id.clone();

        let reply = match peer.services().get(&id) {
            Some(existing) => {
                debug!(service_id = %id, "service already mirrored");
                let current = existing.descriptor();
                OpenData::status(&id, current.status(), current.error_message, current.details)
            }
            None => {
                descriptor.set_status(ServiceStatus::Pending);
                let service = Arc::new(Service::new(descriptor, Origin::Mirror));
                peer.services().add(id.clone(), service.clone());

                match self.mirror(peer, &service).await {
                    Ok(details) => {
                        info!(service_id = %id, "service mirrored");
                        service.set_status(ServiceStatus::Complete, "");
                        service.set_details(details.clone());
                        OpenData::status(&id, ServiceStatus::Complete, "", details)
                    }
                    Err(error) => {
                        warn!(service_id = %id, %error, "unable to mirror service");
                        service.set_status(ServiceStatus::Error, error.to_string());
                        OpenData::status(&id, ServiceStatus::Error, error.to_string(), HashMap::new())
                    }
                }
            }
        };

        if let Err(error) = peer.send(reply).await {
            warn!(service_id = %id, %error, "unable to send status update");
        }
    }

    async fn mirror(
        self: &Arc<Self>,
        peer: &Arc<PeerStream>,
        service: &Arc<Service>,
    ) -> Result<HashMap<String, String>> {
        let descriptor = service.descriptor();
        let details = self
            .integration
            .register(service.id(), descriptor.r#type().flipped(), &descriptor.config)
            .await?;

        if service.owns_listener() {
            self.start_listener(peer, service, details.port).await?;
        }
        self.integration.get_details(service.id()).await
    }

    async fn handle_destroy(&self, peer: &PeerStream, id: &str) {
        match peer.services().delete(id) {
            Some(service) => {
                info!(service_id = %id, "peer destroyed service");
                service.teardown(self.integration.as_ref()).await;
            }
            None => debug!(service_id = %id, "destroy for unknown service"),
        }
    }

    fn handle_status(&self, peer: &PeerStream, service_id: &str, update: proto::StatusUpdate) {
        let Some(service) = peer.services().get(service_id) else {
            debug!(%service_id, "status update for unknown service");
            return;
        };

        let status = update.status();
        info!(%service_id, status = ?status, message = %update.message, "peer reported service status");
        service.set_status(status, update.message);
        service.set_details(update.config);
    }

    async fn handle_data(
        self: &Arc<Self>,
        peer: &Arc<PeerStream>,
        service_id: &str,
        connection_id: &str,
        data: proto::Data,
    ) {
        let Some(service) = peer.services().get(service_id) else {
            debug!(%service_id, %connection_id, "data for unknown service");
            return;
        };

        let conn = match service.connection(connection_id) {
            Some(conn) => conn,
            None if service.owns_listener() => {
                debug!(%service_id, %connection_id, "data for connection no longer bound");
                return;
            }
            None => match self.dial_backend(peer, &service, connection_id).await {
                Ok(conn) => conn,
                Err(error) => {
                    warn!(%service_id, %connection_id, %error, "unable to reach backend");
                    self.send_closed(peer, service_id, connection_id).await;
                    return;
                }
            },
        };

        trace!(%service_id, %connection_id, seq = data.id, len = data.data.len(), "writing data");
        if let Err(error) = conn.write_all(&data.data).await {
            warn!(%service_id, %connection_id, %error, "unable to write to connection");
            conn.close().await;
            service.unbind(connection_id);
            self.send_closed(peer, service_id, connection_id).await;
        }
    }

    async fn handle_closed(&self, peer: &PeerStream, service_id: &str, connection_id: &str) {
        let Some(service) = peer.services().get(service_id) else {
            return;
        };
        match service.unbind(connection_id) {
            Some(conn) => {
                debug!(%service_id, %connection_id, "peer closed connection");
                conn.close().await;
            }
            None => trace!(%service_id, %connection_id, "closed for unbound connection"),
        }
    }

    async fn send_closed(&self, peer: &PeerStream, service_id: &str, connection_id: &str) {
        if let Err(error) = peer.send(OpenData::closed(service_id, connection_id)).await {
            debug!(%service_id, %connection_id, %error, "unable to send closed to peer");
        }
    }
}
