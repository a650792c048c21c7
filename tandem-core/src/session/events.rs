//! Session events, errors and send reports

use thiserror::Error;

use crate::player::PlayerError;
use crate::sync::{Command, PlaybackStatus, ScheduledPlayback};
use crate::transfer::{TransferError, TransferEvent};
use crate::transport::{ConnectionStatus, EndpointId, PayloadId, TransportError};

use super::registry::PeerEndpoint;

/// Host-side connection stream item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected(PeerEndpoint),
    Disconnected(PeerEndpoint),
}

/// Guest-side discovery stream item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    HostFound(PeerEndpoint),
    HostLost(EndpointId),
    Connected(PeerEndpoint),
    Disconnected(PeerEndpoint),
    ConnectionFailed {
        endpoint_id: EndpointId,
        error: ConnectionError,
    },
}

/// Why a connection attempt ended without a connection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("Connection rejected")]
    Rejected,

    #[error("Connection timed out")]
    TimedOut,

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),
}

impl ConnectionError {
    /// Map a non-`Ok` transport outcome
    pub fn from_status(status: &ConnectionStatus) -> Option<Self> {
        match status {
            ConnectionStatus::Ok => None,
            ConnectionStatus::Rejected => Some(ConnectionError::Rejected),
            ConnectionStatus::TimedOut => Some(ConnectionError::TimedOut),
            ConnectionStatus::Error(reason) => {
                Some(ConnectionError::TransportUnavailable(reason.clone()))
            }
        }
    }
}

/// Everything the session reports, for whoever drives the UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    PeerConnected(PeerEndpoint),
    PeerDisconnected(PeerEndpoint),
    HostFound(PeerEndpoint),
    HostLost(EndpointId),
    ConnectionFailed {
        endpoint_id: EndpointId,
        error: ConnectionError,
    },
    Transfer(TransferEvent),
    /// A command from the host was accepted
    CommandReceived {
        from: PeerEndpoint,
        command: Command,
    },
    /// The host broadcast a start command
    PlaybackScheduled(ScheduledPlayback),
    PlaybackStatusChanged(PlaybackStatus),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Operation not available to a {0}")]
    WrongRole(&'static str),

    #[error("Already advertising")]
    AlreadyAdvertising,

    #[error("Already discovering")]
    AlreadyDiscovering,

    #[error("Already connected to a host")]
    AlreadyConnected,

    #[error("Missing permission to use the transport")]
    PermissionDenied,

    #[error("No connected guests")]
    NoConnectedGuests,

    #[error("Cannot read {0}")]
    Io(String),

    #[error("Transport error: {0}")]
    Transport(TransportError),

    #[error("Player error: {0}")]
    Player(#[from] PlayerError),

    #[error("Session closed")]
    Closed,
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::PermissionDenied => SessionError::PermissionDenied,
            TransportError::Closed => SessionError::Closed,
            other => SessionError::Transport(other),
        }
    }
}

/// Result of sending one payload to one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub endpoint_id: EndpointId,
    pub result: Result<PayloadId, TransferError>,
}

/// Per-peer results of a fan-out send. Peers are independent: one failure
/// says nothing about the others.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReport {
    pub outcomes: Vec<SendOutcome>,
}

impl SendReport {
    pub(crate) fn push(&mut self, endpoint_id: &str, result: Result<PayloadId, TransferError>) {
        self.outcomes.push(SendOutcome {
            endpoint_id: endpoint_id.to_string(),
            result,
        });
    }

    pub fn payload_id(&self, endpoint_id: &str) -> Option<PayloadId> {
        self.outcomes
            .iter()
            .find(|o| o.endpoint_id == endpoint_id)
            .and_then(|o| o.result.as_ref().ok().copied())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&EndpointId, &TransferError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (&o.endpoint_id, e)))
    }

    pub fn all_started(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_status_mapping() {
        assert_eq!(ConnectionError::from_status(&ConnectionStatus::Ok), None);
        assert_eq!(
            ConnectionError::from_status(&ConnectionStatus::Error("radio off".into())),
            Some(ConnectionError::TransportUnavailable("radio off".into()))
        );
    }

    #[test]
    fn test_permission_error_is_flattened() {
        assert_eq!(
            SessionError::from(TransportError::PermissionDenied),
            SessionError::PermissionDenied
        );
    }

    #[test]
    fn test_report_lookup() {
        let mut report = SendReport::default();
        report.push("A", Ok(7));
        report.push("B", Err(TransferError::PeerNotConnected("B".into())));
        assert_eq!(report.payload_id("A"), Some(7));
        assert_eq!(report.payload_id("B"), None);
        assert_eq!(report.failures().count(), 1);
        assert!(!report.all_started());
    }
}
