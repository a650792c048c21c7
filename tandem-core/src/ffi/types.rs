//! FFI types exposed via uniffi

use std::path::PathBuf;
use std::time::Duration;

use crate::config::{SessionConfig, DEFAULT_SERVICE_ID};
use crate::session::{
    FileTransferStatus, InboundFileStatus, PeerEndpoint, Role, SendReport, SessionError,
};
use crate::sync::{PlaybackSnapshot, PlaybackStatus, ScheduledPlayback};
use crate::transport::{ConnectionStatus, TransferStatus};

/// Error types exposed via FFI
#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum CoreError {
    #[error("Missing permission to use the transport")]
    PermissionDenied,

    #[error("Not available to a {0}")]
    WrongRole(String),

    #[error("Already advertising")]
    AlreadyAdvertising,

    #[error("Already discovering")]
    AlreadyDiscovering,

    #[error("Already connected to a host")]
    AlreadyConnected,

    #[error("No connected guests")]
    NoConnectedGuests,

    #[error("File error: {0}")]
    FileError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Player error: {0}")]
    PlayerError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Session closed")]
    SessionClosed,
}

impl From<SessionError> for CoreError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::WrongRole(role) => CoreError::WrongRole(role.to_string()),
            SessionError::AlreadyAdvertising => CoreError::AlreadyAdvertising,
            SessionError::AlreadyDiscovering => CoreError::AlreadyDiscovering,
            SessionError::AlreadyConnected => CoreError::AlreadyConnected,
            SessionError::PermissionDenied => CoreError::PermissionDenied,
            SessionError::NoConnectedGuests => CoreError::NoConnectedGuests,
            SessionError::Io(msg) => CoreError::FileError(msg),
            SessionError::Transport(e) => CoreError::TransportError(e.to_string()),
            SessionError::Player(e) => CoreError::PlayerError(e.to_string()),
            SessionError::Closed => CoreError::SessionClosed,
        }
    }
}

/// Errors a foreign transport reports back
#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum TransportFailure {
    #[error("Permission denied")]
    PermissionDenied,

    #[error("Unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Unknown endpoint {endpoint_id}")]
    UnknownEndpoint { endpoint_id: String },
}

impl From<uniffi::UnexpectedUniFFICallbackError> for TransportFailure {
    fn from(e: uniffi::UnexpectedUniFFICallbackError) -> Self {
        TransportFailure::Unavailable { reason: e.reason }
    }
}

/// Errors a foreign player reports back
#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum PlayerFailure {
    #[error("{reason}")]
    Failed { reason: String },
}

impl From<uniffi::UnexpectedUniFFICallbackError> for PlayerFailure {
    fn from(e: uniffi::UnexpectedUniFFICallbackError) -> Self {
        PlayerFailure::Failed { reason: e.reason }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum PeerRole {
    Host,
    Guest,
}

impl From<PeerRole> for Role {
    fn from(role: PeerRole) -> Self {
        match role {
            PeerRole::Host => Role::Host,
            PeerRole::Guest => Role::Guest,
        }
    }
}

impl From<Role> for PeerRole {
    fn from(role: Role) -> Self {
        match role {
            Role::Host => PeerRole::Host,
            Role::Guest => PeerRole::Guest,
        }
    }
}

/// Remote participant exposed via FFI
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct Peer {
    pub endpoint_id: String,
    pub display_name: Option<String>,
    pub role: PeerRole,
}

impl From<&PeerEndpoint> for Peer {
    fn from(p: &PeerEndpoint) -> Self {
        Self {
            endpoint_id: p.id.clone(),
            display_name: p.display_name.clone(),
            role: p.role.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum PlaybackPhase {
    Idle,
    Ready,
    Scheduled,
    Playing,
    Paused,
    Error,
}

impl From<PlaybackStatus> for PlaybackPhase {
    fn from(s: PlaybackStatus) -> Self {
        match s {
            PlaybackStatus::Idle => PlaybackPhase::Idle,
            PlaybackStatus::Ready => PlaybackPhase::Ready,
            PlaybackStatus::Scheduled => PlaybackPhase::Scheduled,
            PlaybackStatus::Playing => PlaybackPhase::Playing,
            PlaybackStatus::Paused => PlaybackPhase::Paused,
            PlaybackStatus::Error => PlaybackPhase::Error,
        }
    }
}

/// Playback state exposed via FFI
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct PlaybackState {
    pub phase: PlaybackPhase,
    pub position_ms: u64,
    /// Start instant on the local clock (epoch millis)
    pub start_at_ms: Option<i64>,
    pub file_path: Option<String>,
    pub error: Option<String>,
}

impl From<&PlaybackSnapshot> for PlaybackState {
    fn from(p: &PlaybackSnapshot) -> Self {
        Self {
            phase: p.status.into(),
            position_ms: p.position_ms,
            start_at_ms: p.start_at_ms,
            file_path: p.file.as_ref().map(|f| f.display().to_string()),
            error: p.error.clone(),
        }
    }
}

/// A broadcast start command
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Record)]
pub struct ScheduledStart {
    pub start_at_ms: i64,
    pub issued_at_ms: i64,
}

impl From<ScheduledPlayback> for ScheduledStart {
    fn from(s: ScheduledPlayback) -> Self {
        Self {
            start_at_ms: s.start_at_ms,
            issued_at_ms: s.issued_at_ms,
        }
    }
}

/// Per-peer result of a send
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct SendOutcome {
    pub endpoint_id: String,
    pub payload_id: Option<u64>,
    pub error: Option<String>,
}

pub(crate) fn outcomes(report: &SendReport) -> Vec<SendOutcome> {
    report
        .outcomes
        .iter()
        .map(|o| SendOutcome {
            endpoint_id: o.endpoint_id.clone(),
            payload_id: o.result.as_ref().ok().copied(),
            error: o.result.as_ref().err().map(|e| e.to_string()),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct StartReport {
    pub start: ScheduledStart,
    pub outcomes: Vec<SendOutcome>,
}

/// File transfer state for one peer
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Enum)]
pub enum TransferState {
    Idle,
    InProgress {
        bytes_transferred: u64,
        bytes_expected: Option<u64>,
    },
    Sent,
    Received {
        path: String,
    },
    Failed {
        reason: String,
    },
}

impl From<&FileTransferStatus> for TransferState {
    fn from(s: &FileTransferStatus) -> Self {
        match s {
            FileTransferStatus::NotSent => TransferState::Idle,
            FileTransferStatus::Sending {
                bytes_transferred,
                bytes_expected,
            } => TransferState::InProgress {
                bytes_transferred: *bytes_transferred,
                bytes_expected: *bytes_expected,
            },
            FileTransferStatus::Sent => TransferState::Sent,
            FileTransferStatus::Error(reason) => TransferState::Failed {
                reason: reason.clone(),
            },
        }
    }
}

impl From<&InboundFileStatus> for TransferState {
    fn from(s: &InboundFileStatus) -> Self {
        match s {
            InboundFileStatus::Waiting => TransferState::Idle,
            InboundFileStatus::Receiving {
                bytes_transferred,
                bytes_expected,
            } => TransferState::InProgress {
                bytes_transferred: *bytes_transferred,
                bytes_expected: *bytes_expected,
            },
            InboundFileStatus::Received(file) => TransferState::Received {
                path: file.path.display().to_string(),
            },
            InboundFileStatus::Error(reason) => TransferState::Failed {
                reason: reason.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct PeerTransfer {
    pub endpoint_id: String,
    pub state: TransferState,
}

/// Connection outcome reported by a foreign transport
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Enum)]
pub enum ConnectionOutcome {
    Ok,
    Rejected,
    TimedOut,
    Error { reason: String },
}

impl From<ConnectionOutcome> for ConnectionStatus {
    fn from(o: ConnectionOutcome) -> Self {
        match o {
            ConnectionOutcome::Ok => ConnectionStatus::Ok,
            ConnectionOutcome::Rejected => ConnectionStatus::Rejected,
            ConnectionOutcome::TimedOut => ConnectionStatus::TimedOut,
            ConnectionOutcome::Error { reason } => ConnectionStatus::Error(reason),
        }
    }
}

/// Payload status reported by a foreign transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum PayloadStatus {
    InProgress,
    Success,
    Failure,
    Canceled,
}

impl From<PayloadStatus> for TransferStatus {
    fn from(s: PayloadStatus) -> Self {
        match s {
            PayloadStatus::InProgress => TransferStatus::InProgress,
            PayloadStatus::Success => TransferStatus::Success,
            PayloadStatus::Failure => TransferStatus::Failure,
            PayloadStatus::Canceled => TransferStatus::Canceled,
        }
    }
}

/// Session settings exposed via FFI
#[derive(Debug, Clone, uniffi::Record)]
pub struct SessionSettings {
    /// Defaults to the built-in service id
    pub service_id: Option<String>,
    pub local_name: String,
    pub lookahead_ms: u64,
    /// Local clock minus host clock
    pub clock_offset_ms: i64,
    /// None disables the stall timeout
    pub transfer_stall_timeout_ms: Option<u64>,
    /// Where received files are kept, usually the app cache directory
    pub storage_dir: String,
    pub host_plays_along: bool,
}

impl From<SessionSettings> for SessionConfig {
    fn from(s: SessionSettings) -> Self {
        SessionConfig {
            service_id: s
                .service_id
                .unwrap_or_else(|| DEFAULT_SERVICE_ID.to_string()),
            local_name: s.local_name,
            lookahead: Duration::from_millis(s.lookahead_ms),
            clock_offset_ms: s.clock_offset_ms,
            transfer_stall_timeout: s.transfer_stall_timeout_ms.map(Duration::from_millis),
            storage_dir: PathBuf::from(s.storage_dir),
            host_plays_along: s.host_plays_along,
        }
    }
}

/// Transport primitives implemented by the host app (e.g. Nearby Connections).
/// Results of asynchronous operations are fed back through the `Session::on_*` methods.
#[uniffi::export(callback_interface)]
pub trait TransportCallback: Send + Sync {
    fn check_permissions(&self) -> Result<(), TransportFailure>;
    fn start_advertising(&self, local_name: String, service_id: String) -> Result<(), TransportFailure>;
    fn stop_advertising(&self);
    fn start_discovery(&self, service_id: String) -> Result<(), TransportFailure>;
    fn stop_discovery(&self);
    fn request_connection(&self, local_name: String, endpoint_id: String) -> Result<(), TransportFailure>;
    fn accept_connection(&self, endpoint_id: String) -> Result<(), TransportFailure>;
    fn reject_connection(&self, endpoint_id: String) -> Result<(), TransportFailure>;
    fn disconnect(&self, endpoint_id: String);
    fn stop_all_endpoints(&self);
    /// Returns the payload id
    fn send_bytes(&self, endpoint_id: String, bytes: Vec<u8>) -> Result<u64, TransportFailure>;
    /// Returns the payload id
    fn send_file(&self, endpoint_id: String, path: String) -> Result<u64, TransportFailure>;
    fn cancel_payload(&self, payload_id: u64);
}

/// Audio player implemented by the host app (e.g. ExoPlayer)
#[uniffi::export(callback_interface)]
pub trait PlayerCallback: Send + Sync {
    fn load(&self, path: String) -> Result<(), PlayerFailure>;
    fn prepare(&self) -> Result<(), PlayerFailure>;
    fn seek_to(&self, position_ms: u64) -> Result<(), PlayerFailure>;
    fn set_auto_start(&self, auto_start: bool) -> Result<(), PlayerFailure>;
    fn play(&self) -> Result<(), PlayerFailure>;
    fn pause(&self) -> Result<(), PlayerFailure>;
}

/// Callback interface for session events
#[uniffi::export(callback_interface)]
pub trait SessionCallback: Send + Sync {
    fn on_peer_connected(&self, peer: Peer);
    fn on_peer_disconnected(&self, peer: Peer);
    fn on_host_found(&self, peer: Peer);
    fn on_host_lost(&self, endpoint_id: String);
    fn on_connection_failed(&self, endpoint_id: String, reason: String);
    fn on_transfer_changed(&self, transfer: PeerTransfer);
    fn on_command_rejected(&self, endpoint_id: String, reason: String);
    fn on_playback_scheduled(&self, start: ScheduledStart);
    fn on_playback_changed(&self, playback: PlaybackState);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_to_config() {
        let config = SessionConfig::from(SessionSettings {
            service_id: None,
            local_name: "Pixel".to_string(),
            lookahead_ms: 2_500,
            clock_offset_ms: -40,
            transfer_stall_timeout_ms: None,
            storage_dir: "/data/cache".to_string(),
            host_plays_along: false,
        });
        assert_eq!(config.service_id, DEFAULT_SERVICE_ID);
        assert_eq!(config.lookahead_ms(), 2_500);
        assert_eq!(config.clock_offset_ms, -40);
        assert!(config.transfer_stall_timeout.is_none());
        assert_eq!(config.storage_dir, PathBuf::from("/data/cache"));
    }

    #[test]
    fn test_oversized_lookahead_stays_positive() {
        let config = SessionConfig::from(SessionSettings {
            service_id: Some("dev.tandem.test".to_string()),
            local_name: "Pixel".to_string(),
            lookahead_ms: u64::MAX,
            clock_offset_ms: 0,
            transfer_stall_timeout_ms: Some(1_000),
            storage_dir: "/data/cache".to_string(),
            host_plays_along: true,
        });
        assert_eq!(config.lookahead_ms(), i64::MAX);
    }

    #[test]
    fn test_session_errors_flatten() {
        assert!(matches!(
            CoreError::from(SessionError::NoConnectedGuests),
            CoreError::NoConnectedGuests
        ));
        assert!(matches!(
            CoreError::from(SessionError::WrongRole("guest")),
            CoreError::WrongRole(role) if role == "guest"
        ));
    }

    #[test]
    fn test_send_outcomes() {
        use crate::transfer::TransferError;

        let report = SendReport {
            outcomes: vec![
                crate::session::SendOutcome {
                    endpoint_id: "A".to_string(),
                    result: Ok(3),
                },
                crate::session::SendOutcome {
                    endpoint_id: "B".to_string(),
                    result: Err(TransferError::PeerNotConnected("B".to_string())),
                },
            ],
        };
        let list = outcomes(&report);
        assert_eq!(list[0].payload_id, Some(3));
        assert!(list[0].error.is_none());
        assert!(list[1].error.is_some());
    }
}
