//! Transport boundary
//!
//! The session never talks to radios or sockets itself. Everything goes
//! through a [`Transport`] implementation, which reports back by pushing
//! [`TransportEvent`]s into the channel it was created with.

use std::path::PathBuf;

use thiserror::Error;

#[cfg(test)]
pub(crate) mod mock;

/// Transport-level identifier for a remote peer
pub type EndpointId = String;

/// Identifier the transport assigns to each payload it sends or receives
pub type PayloadId = u64;

/// Errors raised synchronously by transport calls
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Missing permission to use the transport")]
    PermissionDenied,

    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(EndpointId),

    #[error("Transport task closed")]
    Closed,
}

/// What the caller hands to the transport to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingPayload {
    /// Small in-memory message (commands)
    Bytes(Vec<u8>),
    /// File on local storage
    File(PathBuf),
}

/// What the transport hands over when a payload starts arriving
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingPayload {
    /// Complete message bytes
    Bytes(Vec<u8>),
    /// Transport-owned file that is being filled. Only valid until the
    /// transfer reaches a terminal status.
    File(PathBuf),
}

/// Status carried by a transfer progress update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    InProgress,
    Success,
    Failure,
    Canceled,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferStatus::InProgress)
    }
}

/// A payload progress report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferUpdate {
    pub payload_id: PayloadId,
    pub bytes_transferred: u64,
    /// Total size, if the transport knows it
    pub total_bytes: Option<u64>,
    pub status: TransferStatus,
}

/// Outcome of a connection attempt as reported by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Ok,
    Rejected,
    TimedOut,
    Error(String),
}

/// Events emitted by a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Either side started a connection; both sides must accept it
    ConnectionInitiated {
        endpoint_id: EndpointId,
        endpoint_name: Option<String>,
        is_incoming: bool,
    },
    /// Final outcome of a connection attempt
    ConnectionResult {
        endpoint_id: EndpointId,
        status: ConnectionStatus,
    },
    /// An established connection went away
    Disconnected { endpoint_id: EndpointId },
    /// Discovery found an advertising endpoint
    EndpointFound {
        endpoint_id: EndpointId,
        endpoint_name: String,
    },
    /// A previously found endpoint is no longer advertising
    EndpointLost { endpoint_id: EndpointId },
    /// A payload started arriving from a peer
    PayloadReceived {
        endpoint_id: EndpointId,
        payload_id: PayloadId,
        payload: IncomingPayload,
    },
    /// Progress for an inbound or outbound payload
    PayloadTransferUpdate {
        endpoint_id: EndpointId,
        update: TransferUpdate,
    },
}

/// Point-to-point transport primitives.
///
/// Calls are non-blocking: they hand work to the transport and return.
/// Outcomes arrive later as [`TransportEvent`]s.
pub trait Transport: Send + Sync {
    /// Check OS-level capabilities before any other call is attempted
    fn check_permissions(&self) -> Result<(), TransportError>;

    fn start_advertising(&self, local_name: &str, service_id: &str) -> Result<(), TransportError>;

    fn stop_advertising(&self);

    fn start_discovery(&self, service_id: &str) -> Result<(), TransportError>;

    fn stop_discovery(&self);

    fn request_connection(&self, local_name: &str, endpoint_id: &str) -> Result<(), TransportError>;

    fn accept_connection(&self, endpoint_id: &str) -> Result<(), TransportError>;

    fn reject_connection(&self, endpoint_id: &str) -> Result<(), TransportError>;

    fn disconnect(&self, endpoint_id: &str);

    /// Drop every connection this transport holds
    fn stop_all_endpoints(&self);

    /// Start sending a payload, returning the id its progress will carry
    fn send_payload(
        &self,
        endpoint_id: &str,
        payload: OutgoingPayload,
    ) -> Result<PayloadId, TransportError>;

    fn cancel_payload(&self, payload_id: PayloadId);
}
