//! Error types for the OpalKV client core.

use std::sync::Arc;

use thiserror::Error;

use crate::packet::Status;

/// A feature that must be negotiated on the connection before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    /// Extended (framing) extras on request packets.
    ExtFrames,
    /// Synchronous durability requirements.
    Durability,
    /// Preserving a document's expiry across mutations.
    PreserveExpiry,
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Feature::ExtFrames => write!(f, "framing extras"),
            Feature::Durability => write!(f, "synchronous durability"),
            Feature::PreserveExpiry => write!(f, "preserve expiry"),
        }
    }
}

/// Error type for OpalKV client operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The document could not be found.
    #[error("document not found")]
    DocNotFound,

    /// The document already exists.
    #[error("document already exists")]
    DocExists,

    /// The document is locked.
    #[error("document is locked")]
    DocLocked,

    /// The CAS provided did not match the document's current CAS.
    #[error("cas mismatch")]
    CasMismatch,

    /// A non-zero collection ID was used without collections enabled.
    #[error("collections are not enabled")]
    CollectionsNotEnabled,

    /// The collection ID was not known to the server.
    #[error("unknown collection id")]
    UnknownCollectionId,

    /// The server rejected the operation for lack of permissions.
    #[error("access error")]
    AccessError,

    /// An operation required a feature that was not enabled.
    #[error("cannot use {0} when it is not enabled")]
    FeatureNotEnabled(Feature),

    /// A durability timeout was specified without a durability level.
    #[error("cannot specify a durability timeout without a durability level")]
    InvalidDurabilityArgs,

    /// Malformed response extras or body.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server returned a status the operation does not map.
    #[error(transparent)]
    Server(#[from] ServerError),

    /// The frame was truncated.
    #[error("short frame")]
    ShortFrame,

    /// The frame began with an unrecognized magic byte.
    #[error("bad magic: {0:#04x}")]
    BadMagic(u8),

    /// The pool has been closed.
    #[error("pool closed")]
    PoolClosed,

    /// A reconfigure was requested while another was in flight.
    #[error("a reconfigure is already in progress")]
    ReconfigureInProgress,

    /// The pool could not establish a connection.
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] Arc<Error>),

    /// The client connection has been closed.
    #[error("client closed")]
    Closed,

    /// Authentication failed during bootstrap.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Invalid argument provided.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Network or connection error.
    #[error("connection error: {0}")]
    Connection(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a protocol error.
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a connection error.
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Error::Connection(msg.into())
    }

    /// Create an invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Error::InvalidArgument(msg.into())
    }
}

/// Error for response statuses that have no operation-specific mapping.
///
/// Carries enough context to identify the request on the wire: the
/// addresses of both ends of the connection it was dispatched on and the
/// opaque that correlated the reply.
#[derive(Debug, Error)]
#[error("server error: {cause} (opaque: {opaque}, to: {dispatched_to}, from: {dispatched_from})")]
pub struct ServerError {
    /// Human-readable name of the offending status.
    pub cause: String,
    /// The raw status from the response.
    pub status: Status,
    /// Remote address of the connection the request was dispatched on.
    pub dispatched_to: String,
    /// Local address of the connection the request was dispatched on.
    pub dispatched_from: String,
    /// The opaque that correlated the response.
    pub opaque: u32,
}
