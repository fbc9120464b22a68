//! Per-peer state and the registry of peers.

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::integration::Integration;
use crate::proto::{self, OpenData, ServiceStatus};
use crate::service::{locked, Service, ServiceRegistry};
use crate::stream::MuxConnection;
use crate::Result;

/// Address recorded for peers that dialed this connector.
pub(crate) const INBOUND_ADDR: &str = "localhost";

/// Connection state of a peer.
#[derive(Debug, Clone, Default)]
pub(crate) enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected(Arc<MuxConnection>),
}

/// Outcome of asking to reach a peer.
#[derive(Debug)]
pub(crate) enum Claim<'a> {
    /// Another task is dialing.
    Busy,
    /// A stream is already up.
    Live(Arc<MuxConnection>),
    /// The caller now owns the dial.
    Dial(ConnectingGuard<'a>),
}

/// Held while dialing. Dropping it without a connection resets the state.
#[derive(Debug)]
pub(crate) struct ConnectingGuard<'a> {
    peer: &'a PeerStream,
}

impl ConnectingGuard<'_> {
    /// Publish the new stream.
    pub(crate) fn connected(self, conn: Arc<MuxConnection>) {
        *locked(&self.peer.link) = LinkState::Connected(conn);
    }
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        let mut link = locked(&self.peer.link);
        if matches!(*link, LinkState::Connecting) {
            *link = LinkState::Disconnected;
        }
    }
}

/// Everything this connector shares with one peer.
#[derive(Debug)]
pub(crate) struct PeerStream {
    addr: String,
    inbound: bool,
    services: ServiceRegistry,
    link: Mutex<LinkState>,
}

impl PeerStream {
    /// A peer this connector dials.
    pub(crate) fn outbound(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            inbound: false,
            services: ServiceRegistry::new(),
            link: Mutex::new(LinkState::Disconnected),
        }
    }

    /// A peer that dialed this connector.
    pub(crate) fn inbound(conn: Arc<MuxConnection>) -> Self {
        Self {
            addr: INBOUND_ADDR.to_string(),
            inbound: true,
            services: ServiceRegistry::new(),
            link: Mutex::new(LinkState::Connected(conn)),
        }
    }

    pub(crate) fn addr(&self) -> &str {
        &self.addr
    }

    pub(crate) fn is_inbound(&self) -> bool {
        self.inbound
    }

    pub(crate) fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub(crate) fn link(&self) -> LinkState {
        locked(&self.link).clone()
    }

    /// The live stream, if any.
    pub(crate) fn connection(&self) -> Option<Arc<MuxConnection>> {
        match &*locked(&self.link) {
            LinkState::Connected(conn) if !conn.is_closed() => Some(conn.clone()),
            _ => None,
        }
    }

    /// Claim the right to dial, unless a dial is running or a stream is live.
    pub(crate) fn claim(&self) -> Claim<'_> {
        let mut link = locked(&self.link);
        match &*link {
            LinkState::Connecting => Claim::Busy,
            LinkState::Connected(conn) if !conn.is_closed() => Claim::Live(conn.clone()),
            _ => {
                *link = LinkState::Connecting;
                Claim::Dial(ConnectingGuard { peer: self })
            }
        }
    }

    /// Forget `conn` if it is still the current stream.
    pub(crate) fn disconnect(&self, conn: &Arc<MuxConnection>) -> bool {
        let mut link = locked(&self.link);
        match &*link {
            LinkState::Connected(current) if Arc::ptr_eq(current, conn) => {
                *link = LinkState::Disconnected;
                true
            }
            _ => false,
        }
    }

    /// Send on the live stream. Without one the message is dropped.
    pub(crate) async fn send(&self, msg: OpenData) -> Result<()> {
        match self.connection() {
            Some(conn) => conn.send(msg).await,
            None => {
                debug!(addr = %self.addr, kind = msg.kind(), "no live stream, dropping message");
                Ok(())
            }
        }
    }

    /// Release local resources of every route and mark them pending.
    pub(crate) async fn teardown_connection(&self, integration: &dyn Integration) {
        info!(addr = %self.addr, services = self.services.len(), "tearing down peer routes");
        for service in self.services.snapshot() {
            service.teardown(integration).await;
            service.set_status(ServiceStatus::Pending, "");
        }
    }

    /// Close the live stream, if any.
    pub(crate) fn close(&self) {
        let link = std::mem::take(&mut *locked(&self.link));
        if let LinkState::Connected(conn) = link {
            conn.close();
        }
    }
}

/// All peers known to a connector.
#[derive(Debug, Default)]
pub(crate) struct StreamRegistry {
    peers: Mutex<Vec<Arc<PeerStream>>>,
}

impl StreamRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, peer: Arc<PeerStream>) {
        locked(&self.peers).push(peer);
    }

    pub(crate) fn remove(&self, peer: &Arc<PeerStream>) {
        locked(&self.peers).retain(|p| !Arc::ptr_eq(p, peer));
    }

    /// The outbound peer for `addr`, created on first use.
    ///
    /// Inbound peers all share one sentinel address and are never returned.
    pub(crate) fn get_or_create(&self, addr: &str) -> Arc<PeerStream> {
        let mut peers = locked(&self.peers);
        if let Some(peer) = peers.iter().find(|p| !p.is_inbound() && p.addr() == addr) {
            return peer.clone();
        }
        let peer = Arc::new(PeerStream::outbound(addr));
        peers.push(peer.clone());
        peer
    }

    /// The peer holding a route, and the route.
    pub(crate) fn find_by_service_id(&self, id: &str) -> Option<(Arc<PeerStream>, Arc<Service>)> {
        locked(&self.peers)
            .iter()
            .find_map(|p| p.services().get(id).map(|svc| (p.clone(), svc)))
    }

    /// The peer holding the stream with id `conn_id`.
    pub(crate) fn find_by_connection(&self, conn_id: u64) -> Option<Arc<PeerStream>> {
        locked(&self.peers)
            .iter()
            .find(|p| matches!(p.link(), LinkState::Connected(c) if c.id() == conn_id))
            .cloned()
    }

    /// Whether any peer already has a route colliding with `candidate`.
    pub(crate) fn contains_route(&self, candidate: &proto::Service) -> bool {
        self.snapshot()
            .iter()
            .any(|p| p.services().contains(candidate))
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<PeerStream>> {
        locked(&self.peers).clone()
    }
}
