//! Wire types exchanged between connectors, plus the generated
//! `connector.RemoteConnection` client and server stubs.

use std::collections::HashMap;

/// Which side of a route owns the real backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ServiceType {
    /// This connector owns the backend; the peer publishes a mirrored listener.
    Local = 0,
    /// The peer owns the backend; this connector publishes the listener.
    Remote = 1,
}

impl ServiceType {
    /// Upper-case name used when talking to integrations.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Local => "LOCAL",
            ServiceType::Remote => "REMOTE",
        }
    }

    /// The kind as seen from the other end of the route.
    pub fn flipped(self) -> Self {
        match self {
            ServiceType::Local => ServiceType::Remote,
            ServiceType::Remote => ServiceType::Local,
        }
    }
}

/// Lifecycle state of a route.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ServiceStatus {
    /// Registered, waiting for the peer to acknowledge.
    Pending = 0,
    /// Listener and integration are in place.
    Complete = 1,
    /// Registration failed; see `error_message`.
    Error = 2,
}

/// Descriptor of one exposed or imported endpoint.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Service {
    /// Opaque id, generated by the exposing connector.
    #[prost(string, tag = "1")]
    pub id: String,
    /// Human readable name.
    #[prost(string, tag = "2")]
    pub name: String,
    /// Port the listener binds, on whichever side owns the listener.
    #[prost(int32, tag = "3")]
    pub source_port: i32,
    /// `host:port` of the backend.
    #[prost(string, tag = "4")]
    pub destination_addr: String,
    /// Address of the peer connector.
    #[prost(string, tag = "5")]
    pub remote_connector_addr: String,
    /// See [`ServiceType`].
    #[prost(enumeration = "ServiceType", tag = "6")]
    pub r#type: i32,
    /// See [`ServiceStatus`].
    #[prost(enumeration = "ServiceStatus", tag = "7")]
    pub status: i32,
    /// Diagnostic text when `status` is `Error`.
    #[prost(string, tag = "8")]
    pub error_message: String,
    /// Inputs handed to the integration.
    #[prost(map = "string, string", tag = "9")]
    pub config: HashMap<String, String>,
    /// Outputs returned by the integration.
    #[prost(map = "string, string", tag = "10")]
    pub details: HashMap<String, String>,
}

/// Request for `ExposeService`, also carried by `Expose` stream messages.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ExposeRequest {
    /// The route to expose.
    #[prost(message, optional, tag = "1")]
    pub service: Option<Service>,
}

/// Response for `ExposeService`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ExposeResponse {
    /// Id of the new route.
    #[prost(string, tag = "1")]
    pub id: String,
}

/// Request for `DestroyService`, also carried by `Destroy` stream messages.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DestroyRequest {
    /// Id of the route to remove.
    #[prost(string, tag = "1")]
    pub id: String,
}

/// Empty message.
#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct NullMessage {}

/// Response for `ListServices`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ListResponse {
    /// Every route known to the connector.
    #[prost(message, repeated, tag = "1")]
    pub services: Vec<Service>,
}

/// A chunk of TCP payload for one logical connection.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Data {
    /// Per-connection sequence number.
    #[prost(int32, tag = "1")]
    pub id: i32,
    /// Raw bytes.
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

/// The logical connection has been closed.
#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct Closed {}

/// Outcome of mirroring an `Expose` on the peer.
#[derive(Clone, PartialEq, prost::Message)]
pub struct StatusUpdate {
    /// New status of the route.
    #[prost(enumeration = "ServiceStatus", tag = "1")]
    pub status: i32,
    /// Error text when `status` is `Error`.
    #[prost(string, tag = "2")]
    pub message: String,
    /// Integration details from the peer.
    #[prost(map = "string, string", tag = "3")]
    pub config: HashMap<String, String>,
}

/// One tagged message on the multiplexed stream.
#[derive(Clone, PartialEq, prost::Message)]
pub struct OpenData {
    /// Route this message belongs to.
    #[prost(string, tag = "1")]
    pub service_id: String,
    /// Logical TCP connection this message belongs to.
    #[prost(string, tag = "2")]
    pub connection_id: String,
    /// Payload.
    #[prost(oneof = "open_data::Message", tags = "3, 4, 5, 6, 7, 8")]
    pub message: Option<open_data::Message>,
}

/// Nested types for [`OpenData`].
pub mod open_data {
    /// Message tags.
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Message {
        /// A new route declared by the peer.
        #[prost(message, tag = "3")]
        Expose(super::ExposeRequest),
        /// A route removed by the peer.
        #[prost(message, tag = "4")]
        Destroy(super::DestroyRequest),
        /// TCP payload.
        #[prost(message, tag = "5")]
        Data(super::Data),
        /// Connection teardown.
        #[prost(message, tag = "6")]
        Closed(super::Closed),
        /// Result of mirroring a route.
        #[prost(message, tag = "7")]
        StatusUpdate(super::StatusUpdate),
        /// Liveness only.
        #[prost(message, tag = "8")]
        Ping(super::NullMessage),
    }
}

use open_data::Message;

impl OpenData {
    fn tagged(service_id: &str, connection_id: &str, message: Message) -> Self {
        Self {
            service_id: service_id.to_string(),
            connection_id: connection_id.to_string(),
            message: Some(message),
        }
    }

    /// Announce a route to the peer.
    pub fn expose(service: Service) -> Self {
        let id = service.id.clone();
        Self::tagged(
            &id,
            "",
            Message::Expose(ExposeRequest {
                service: Some(service),
            }),
        )
    }

    /// Tell the peer a route is gone.
    pub fn destroy(service_id: &str) -> Self {
        Self::tagged(
            service_id,
            "",
            Message::Destroy(DestroyRequest {
                id: service_id.to_string(),
            }),
        )
    }

    /// Carry a chunk of payload.
    pub fn data(service_id: &str, connection_id: &str, seq: i32, data: Vec<u8>) -> Self {
        Self::tagged(
            service_id,
            connection_id,
            Message::Data(Data { id: seq, data }),
        )
    }

    /// Report a closed logical connection.
    pub fn closed(service_id: &str, connection_id: &str) -> Self {
        Self::tagged(service_id, connection_id, Message::Closed(Closed {}))
    }

    /// Report the outcome of mirroring a route.
    pub fn status(
        service_id: &str,
        status: ServiceStatus,
        message: impl Into<String>,
        config: HashMap<String, String>,
    ) -> Self {
        Self::tagged(
            service_id,
            "",
            Message::StatusUpdate(StatusUpdate {
                status: status as i32,
                message: message.into(),
                config,
            }),
        )
    }

    /// Liveness probe.
    pub fn ping() -> Self {
        Self::tagged("", "", Message::Ping(NullMessage {}))
    }

    /// Short tag name, for logging.
    pub fn kind(&self) -> &'static str {
        match &self.message {
            Some(Message::Expose(_)) => "expose",
            Some(Message::Destroy(_)) => "destroy",
            Some(Message::Data(_)) => "data",
            Some(Message::Closed(_)) => "closed",
            Some(Message::StatusUpdate(_)) => "status_update",
            Some(Message::Ping(_)) => "ping",
            None => "empty",
        }
    }
}

include!(concat!(env!("OUT_DIR"), "/connector.RemoteConnection.rs"));
