//! Error types for the tunnel connector.

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Tonic transport error (dial, TLS, server).
    #[error("Tonic transport error: {0}")]
    TonicTransport(#[from] tonic::transport::Error),

    /// gRPC status returned by a peer.
    #[error("gRPC status: {0}")]
    Status(#[from] tonic::Status),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer address could not be turned into a URI.
    #[error("Invalid peer address: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),

    /// The integration refused or failed an operation.
    #[error("Integration error: {0}")]
    Integration(String),

    /// A route with the same listener already exists.
    #[error("Unable to expose service: {0}, already in use")]
    AlreadyExists(String),

    /// No route with the given id.
    #[error("Service with ID: {0}, does not exist")]
    NotFound(String),

    /// The service descriptor is malformed.
    #[error("Invalid service: {0}")]
    InvalidService(String),

    /// Connection error.
    #[error("Connection error: {0}")]
    Connection(String),
}

impl Error {
    /// Create a connection error.
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::Connection(msg.into())
    }

    /// Create an integration error.
    pub fn integration<S: Into<String>>(msg: S) -> Self {
        Self::Integration(msg.into())
    }

    /// Create a validation error.
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        Self::InvalidService(msg.into())
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        match err {
            Error::AlreadyExists(_) => tonic::Status::already_exists(err.to_string()),
            Error::NotFound(_) => tonic::Status::not_found(err.to_string()),
            Error::InvalidService(_) => tonic::Status::invalid_argument(err.to_string()),
            Error::Status(status) => status,
            other => tonic::Status::internal(other.to_string()),
        }
    }
}
