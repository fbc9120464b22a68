//! Routes and the per-peer route registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::buffered_conn::BufferedConn;
use crate::integration::Integration;
use crate::proto::{self, ServiceStatus, ServiceType};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Which connector created the local copy of a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    /// Created by `ExposeService` on this connector.
    Exposer,
    /// Created on receipt of an `Expose` announcement from a peer.
    Mirror,
}

/// A running accept loop.
#[derive(Debug)]
pub(crate) struct ListenerHandle {
    port: u16,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub(crate) fn new(port: u16, token: CancellationToken, task: JoinHandle<()>) -> Self {
        Self { port, token, task }
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting and wait until the socket is released.
    pub(crate) async fn close(self) {
        self.token.cancel();
        let _ = self.task.await;
    }
}

/// One route, as seen by this connector.
#[derive(Debug)]
pub(crate) struct Service {
    id: String,
    origin: Origin,
    descriptor: Mutex<proto::Service>,
    listener: Mutex<Option<ListenerHandle>>,
    connections: Mutex<HashMap<String, Arc<BufferedConn>>>,
    teardown: tokio::sync::Mutex<()>,
    retired: AtomicBool,
}

impl Service {
    pub(crate) fn new(descriptor: proto::Service, origin: Origin) -> Self {
        Self {
            id: descriptor.id.clone(),
            origin,
            descriptor: Mutex::new(descriptor),
            listener: Mutex::new(None),
            connections: Mutex::new(HashMap::new()),
            teardown: tokio::sync::Mutex::new(()),
            retired: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    /// Snapshot of the wire descriptor.
    pub(crate) fn descriptor(&self) -> proto::Service {
        locked(&self.descriptor).clone()
    }

    pub(crate) fn kind(&self) -> ServiceType {
        locked(&self.descriptor).r#type()
    }

    pub(crate) fn status(&self) -> ServiceStatus {
        locked(&self.descriptor).status()
    }

    pub(crate) fn set_status(&self, status: ServiceStatus, message: impl Into<String>) {
        let mut descriptor = locked(&self.descriptor);
        descriptor.set_status(status);
        descriptor.error_message = message.into();
    }

    pub(crate) fn set_details(&self, details: HashMap<String, String>) {
        locked(&self.descriptor).details = details;
    }

    /// Whether this connector runs the TCP listener for the route.
    ///
    /// The exposer owns it for REMOTE routes, the mirror for LOCAL ones.
    /// The other side dials the backend lazily on the first `Data` message.
    pub(crate) fn owns_listener(&self) -> bool {
        matches!(
            (self.origin, self.kind()),
            (Origin::Exposer, ServiceType::Remote) | (Origin::Mirror, ServiceType::Local)
        )
    }

    /// Mark the route as removed from its registry. Work already in flight
    /// for it must not acquire new resources afterwards.
    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    pub(crate) fn has_listener(&self) -> bool {
        locked(&self.listener).is_some()
    }

    /// Install a listener. Returns the previous one if any, which the caller closes.
    pub(crate) fn set_listener(&self, handle: ListenerHandle) -> Option<ListenerHandle> {
        locked(&self.listener).replace(handle)
    }

    pub(crate) fn take_listener(&self) -> Option<ListenerHandle> {
        locked(&self.listener).take()
    }

    /// Bind a connection id to a socket.
    pub(crate) async fn bind(&self, conn: Arc<BufferedConn>) {
        let _teardown = self.teardown.lock().await;
        locked(&self.connections).insert(conn.id().to_string(), conn);
    }

    pub(crate) fn connection(&self, connection_id: &str) -> Option<Arc<BufferedConn>> {
        locked(&self.connections).get(connection_id).cloned()
    }

    pub(crate) fn unbind(&self, connection_id: &str) -> Option<Arc<BufferedConn>> {
        locked(&self.connections).remove(connection_id)
    }

    pub(crate) fn connection_count(&self) -> usize {
        locked(&self.connections).len()
    }

    #[cfg(test)]
    pub(crate) async fn hold_teardown(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.teardown.lock().await
    }

    /// Close the listener and every bound connection.
    pub(crate) async fn close_all(&self) {
        // the accept loop may be waiting in `bind`, stop it before taking the lock
        if let Some(listener) = self.take_listener() {
            debug!(service_id = %self.id, port = listener.port(), "closing listener");
            listener.close().await;
        }

        let _teardown = self.teardown.lock().await;
        let connections: Vec<_> = locked(&self.connections).drain().map(|(_, c)| c).collect();
        for conn in connections {
            debug!(service_id = %self.id, connection_id = %conn.id(), "closing connection");
            conn.close().await;
        }
    }

    /// Release every local resource of the route and its integration.
    pub(crate) async fn teardown(&self, integration: &dyn Integration) {
        debug!(
            service_id = %self.id,
            connections = self.connection_count(),
            "tearing down service"
        );
        self.close_all().await;
        if let Err(error) = integration.deregister(&self.id).await {
            warn!(service_id = %self.id, %error, "unable to deregister service");
        }
    }
}

/// Routes of one peer, keyed by service id.
#[derive(Debug, Default)]
pub(crate) struct ServiceRegistry {
    services: Mutex<HashMap<String, Arc<Service>>>,
}

impl ServiceRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, id: &str) -> Option<Arc<Service>> {
        locked(&self.services).get(id).cloned()
    }

    pub(crate) fn add(&self, id: impl Into<String>, service: Arc<Service>) {
        locked(&self.services).insert(id.into(), service);
    }

    /// Remove a route and retire it.
    pub(crate) fn delete(&self, id: &str) -> Option<Arc<Service>> {
        let service = locked(&self.services).remove(id)?;
        service.retire();
        Some(service)
    }

    /// Whether `candidate` collides with a registered route.
    ///
    /// Two REMOTE routes collide on the source port, two LOCAL routes on
    /// the peer address and source port.
    pub(crate) fn contains(&self, candidate: &proto::Service) -> bool {
        let mut found = false;
        self.iterate(|_, existing| {
            let existing = existing.descriptor();
            found = match (candidate.r#type(), existing.r#type()) {
                (ServiceType::Remote, ServiceType::Remote) => {
                    candidate.source_port == existing.source_port
                }
                (ServiceType::Local, ServiceType::Local) => {
                    candidate.source_port == existing.source_port
                        && candidate.remote_connector_addr == existing.remote_connector_addr
                }
                _ => false,
            };
            !found
        });
        found
    }

    /// Visit routes under the lock until `f` returns `false`.
    ///
    /// `f` must not call back into this registry.
    pub(crate) fn iterate<F>(&self, mut f: F)
    where
        F: FnMut(&str, &Arc<Service>) -> bool,
    {
        let services = locked(&self.services);
        for (id, service) in services.iter() {
            if !f(id, service) {
                break;
            }
        }
    }

    /// Routes as an owned list, for work that has to await.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Service>> {
        locked(&self.services).values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        locked(&self.services).len()
    }
}
