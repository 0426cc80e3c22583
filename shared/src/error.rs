use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the resolver, the beacon launcher and the client.
///
/// A `discover` that runs out of time is not an error: it yields `None`.
/// `TimedOut` is reserved for a control exchange that never got its reply.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("{address} is not a valid address: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("address out of range: {0}")]
    AddressOutOfRange(String),

    #[error("port {port} is already bound by something other than a beacon: {source}")]
    AlreadyBound {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("gave up waiting for a reply after {0:?}; this connection is now unusable")]
    TimedOut(Duration),

    #[error("interrupted after {0:?}")]
    Interrupted(Duration),

    #[error("service {0} is already advertised")]
    AlreadyAdvertised(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("malformed control message: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DiscoveryError {
    pub fn invalid_address(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for DiscoveryError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;
