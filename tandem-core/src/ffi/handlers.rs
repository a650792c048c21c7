//! Session event handlers

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::session::{SessionEvent, SessionHandle};
use crate::transfer::{PayloadKind, TransferEvent};

use super::types::{Peer, PeerTransfer, PlaybackState, SessionCallback, TransferState};

pub(crate) type SharedCallback = Arc<RwLock<Option<Arc<dyn SessionCallback>>>>;

/// Drain the session feed into the foreign callback until the session stops
pub async fn forward_session_events(
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    handle: SessionHandle,
    callback: SharedCallback,
) {
    while let Some(event) = events.recv().await {
        // Clone out so the lock is not held across foreign calls
        let cb = callback.read().clone();
        match cb {
            Some(cb) => handle_session_event(event, &handle, cb.as_ref()),
            None => debug!("No callback set, dropping {:?}", event),
        }
    }
    info!("Session event feed closed");
}

/// Handle a session event
pub fn handle_session_event(event: SessionEvent, handle: &SessionHandle, cb: &dyn SessionCallback) {
    match event {
        SessionEvent::PeerConnected(peer) => cb.on_peer_connected(Peer::from(&peer)),
        SessionEvent::PeerDisconnected(peer) => cb.on_peer_disconnected(Peer::from(&peer)),
        SessionEvent::HostFound(peer) => cb.on_host_found(Peer::from(&peer)),
        SessionEvent::HostLost(endpoint_id) => cb.on_host_lost(endpoint_id),
        SessionEvent::ConnectionFailed { endpoint_id, error } => {
            cb.on_connection_failed(endpoint_id, error.to_string())
        }
        SessionEvent::Transfer(event) => handle_transfer(event, cb),
        SessionEvent::CommandReceived { from, command } => {
            debug!("{} from {}", command, from.label());
        }
        SessionEvent::PlaybackScheduled(start) => cb.on_playback_scheduled(start.into()),
        SessionEvent::PlaybackStatusChanged(status) => {
            let mut playback = PlaybackState::from(handle.snapshot().playback());
            // The snapshot may trail the event by one publish
            playback.phase = status.into();
            cb.on_playback_changed(playback);
        }
    }
}

fn handle_transfer(event: TransferEvent, cb: &dyn SessionCallback) {
    let endpoint_id = event.peer().id.clone();
    let state = match event {
        TransferEvent::Started {
            kind: PayloadKind::File,
            bytes_expected,
            ..
        } => TransferState::InProgress {
            bytes_transferred: 0,
            bytes_expected,
        },
        TransferEvent::Progress {
            kind: PayloadKind::File,
            bytes_transferred,
            bytes_expected,
            ..
        } => TransferState::InProgress {
            bytes_transferred,
            bytes_expected,
        },
        TransferEvent::Sent {
            kind: PayloadKind::File,
            ..
        } => TransferState::Sent,
        TransferEvent::FileReceived { file, .. } => TransferState::Received {
            path: file.path.display().to_string(),
        },
        TransferEvent::Failed {
            kind: PayloadKind::File,
            error,
            ..
        } => TransferState::Failed {
            reason: error.to_string(),
        },
        TransferEvent::CommandRejected { error, .. } => {
            warn!("Rejected command from {}: {}", endpoint_id, error);
            cb.on_command_rejected(endpoint_id, error.to_string());
            return;
        }
        TransferEvent::Failed { error, .. } => {
            warn!("Command to {} failed: {}", endpoint_id, error);
            return;
        }
        // Command payloads are too small to report progress for
        _ => return,
    };
    cb.on_transfer_changed(PeerTransfer { endpoint_id, state });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::types::ScheduledStart;
    use crate::session::{PeerEndpoint, Role};
    use crate::sync::DecodeError;
    use crate::transfer::Direction;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        transfers: Mutex<Vec<PeerTransfer>>,
        rejected: Mutex<Vec<(String, String)>>,
    }

    impl SessionCallback for Recorder {
        fn on_peer_connected(&self, _: Peer) {}
        fn on_peer_disconnected(&self, _: Peer) {}
        fn on_host_found(&self, _: Peer) {}
        fn on_host_lost(&self, _: String) {}
        fn on_connection_failed(&self, _: String, _: String) {}
        fn on_transfer_changed(&self, transfer: PeerTransfer) {
            self.transfers.lock().push(transfer);
        }
        fn on_command_rejected(&self, endpoint_id: String, reason: String) {
            self.rejected.lock().push((endpoint_id, reason));
        }
        fn on_playback_scheduled(&self, _: ScheduledStart) {}
        fn on_playback_changed(&self, _: PlaybackState) {}
    }

    fn guest(id: &str) -> PeerEndpoint {
        PeerEndpoint::new(id, Some("Phone".to_string()), Role::Guest)
    }

    #[test]
    fn test_file_progress_forwarded() {
        let cb = Recorder::default();
        handle_transfer(
            TransferEvent::Progress {
                peer: guest("A"),
                payload_id: 1,
                kind: PayloadKind::File,
                direction: Direction::Outbound,
                bytes_transferred: 50,
                bytes_expected: Some(100),
            },
            &cb,
        );
        handle_transfer(
            TransferEvent::Sent {
                peer: guest("A"),
                payload_id: 1,
                kind: PayloadKind::File,
            },
            &cb,
        );

        let transfers = cb.transfers.lock();
        assert_eq!(transfers.len(), 2);
        assert_eq!(
            transfers[0].state,
            TransferState::InProgress {
                bytes_transferred: 50,
                bytes_expected: Some(100)
            }
        );
        assert_eq!(transfers[1].state, TransferState::Sent);
    }

    #[test]
    fn test_command_payloads_not_reported_as_files() {
        let cb = Recorder::default();
        handle_transfer(
            TransferEvent::Sent {
                peer: guest("A"),
                payload_id: 2,
                kind: PayloadKind::Command,
            },
            &cb,
        );
        assert!(cb.transfers.lock().is_empty());
    }

    #[test]
    fn test_rejected_command_reported() {
        let cb = Recorder::default();
        handle_transfer(
            TransferEvent::CommandRejected {
                peer: guest("H"),
                payload_id: 3,
                error: DecodeError::MissingSeparator("GARBAGE".to_string()),
            },
            &cb,
        );
        let rejected = cb.rejected.lock();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].0, "H");
    }
}
