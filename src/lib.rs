//! Peer-to-peer TCP tunneling over multiplexed gRPC streams.
//!
//! A [`Connector`] exposes local TCP services to peer connectors and consumes
//! theirs. Every route to one peer shares a single bidirectional gRPC stream,
//! on which logical TCP connections are tagged by service and connection id.

#![deny(missing_docs)]

mod buffered_conn;
pub mod client;
pub mod config;
mod dispatch;
pub mod error;
pub mod integration;
mod listener;
mod peer;
#[allow(missing_docs)]
pub mod proto;
mod reconnect;
pub mod rpc;
pub mod server;
mod service;
mod stream;

// Re-export key types
pub use client::{connect, ConnectorClient};
pub use config::{ConnectorConfig, TlsMaterial, MESSAGE_SIZE};
pub use error::{Error, Result};
pub use integration::{sanitize_name, Integration, LocalIntegration, ServiceDetails};
pub use rpc::{RpcGuard, RpcServer};
pub use server::Connector;
