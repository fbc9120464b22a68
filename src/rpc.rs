//! Serving a [`Connector`] over TCP with graceful shutdown.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tunnel_connector::{Connector, ConnectorConfig, LocalIntegration, RpcServer};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let connector = Connector::new(Arc::new(LocalIntegration::new()), ConnectorConfig::default());
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:9090").await?;
//! let guard = RpcServer::new(connector).serve(listener).await?;
//! println!("serving on {}", guard.local_addr());
//! // ... later
//! guard.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::{error, info};

use crate::config::TlsMaterial;
use crate::error::Result;
use crate::proto::remote_connection_server::RemoteConnectionServer;
use crate::server::Connector;

/// Builder for serving a connector's gRPC surface.
#[derive(Debug)]
pub struct RpcServer {
    connector: Connector,
    tls: Option<TlsMaterial>,
}

impl RpcServer {
    /// Serve `connector`. Uses the connector's TLS material when configured.
    pub fn new(connector: Connector) -> Self {
        let tls = connector.config().tls.clone();
        Self { connector, tls }
    }

    /// Require mutual TLS with `material`.
    pub fn tls(mut self, material: TlsMaterial) -> Self {
        self.tls = Some(material);
        self
    }

    /// Start serving on `listener`, returning a guard for shutdown.
    pub async fn serve(self, listener: TcpListener) -> Result<RpcGuard> {
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, _) = broadcast::channel(1);

        let mut builder = Server::builder();
        if let Some(tls) = &self.tls {
            builder = builder.tls_config(tls.server_config())?;
        }
        let router = builder.add_service(RemoteConnectionServer::new(self.connector.clone()));

        let mut shutdown_rx = shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let shutdown_fut = async move {
                let _ = shutdown_rx.recv().await;
            };
            if let Err(e) = router
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown_fut)
                .await
            {
                error!("tonic server error: {e}");
            }
        });

        info!(addr = %local_addr, tls = self.tls.is_some(), "connector serving");
        Ok(RpcGuard {
            connector: self.connector,
            local_addr,
            shutdown_tx,
            handle: Some(handle),
        })
    }
}

/// Guard for a running connector server.
#[derive(Debug)]
pub struct RpcGuard {
    connector: Connector,
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl RpcGuard {
    /// Address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The connector being served.
    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    /// Graceful shutdown: the connector first, so open streams end, then the server.
    pub async fn shutdown(mut self) -> Result<()> {
        self.connector.shutdown().await;
        let _ = self.shutdown_tx.send(());

        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        Ok(())
    }
}

impl Drop for RpcGuard {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}
