//! Session implementation for FFI

use std::path::PathBuf;
use std::sync::{Arc, Once};

use parking_lot::RwLock;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::network::{NetworkConfig, NetworkManager};
use crate::session::{Role, SessionHandle, SessionManager, SessionSnapshot};
use crate::transport::{IncomingPayload, Transport, TransportEvent, TransferUpdate};

use super::bridge::{ForeignPlayer, ForeignTransport};
use super::handlers::{forward_session_events, SharedCallback};
use super::types::*;

static TRACING_INIT: Once = Once::new();

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::from_default_env();
        let filter = match "tandem_core=debug".parse() {
            Ok(directive) => filter.add_directive(directive),
            Err(_) => filter,
        };
        let filter = match "libp2p_mdns=info".parse() {
            Ok(directive) => filter.add_directive(directive),
            Err(_) => filter,
        };
        tracing_subscriber::fmt()
            .with_ansi(false) // Disable colors for logcat / Xcode console
            .with_target(false)
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    });
}

/// Main session interface
#[derive(uniffi::Object)]
pub struct Session {
    runtime: Runtime,
    role: Role,
    handle: SessionHandle,
    /// Ingress for foreign transport callbacks, unset on the LAN transport
    transport_tx: Option<mpsc::UnboundedSender<TransportEvent>>,
    callback: SharedCallback,
}

impl Session {
    fn start(
        runtime: Runtime,
        role: Role,
        transport: Arc<dyn Transport>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        transport_tx: Option<mpsc::UnboundedSender<TransportEvent>>,
        player: Arc<ForeignPlayer>,
        config: SessionConfig,
    ) -> Self {
        let callback: SharedCallback = Arc::new(RwLock::new(None));

        let _guard = runtime.enter();
        let (handle, events) =
            SessionManager::new(role, transport, transport_events, player, config).start();
        runtime.spawn(forward_session_events(events, handle.clone(), callback.clone()));

        Self {
            runtime,
            role,
            handle,
            transport_tx,
            callback,
        }
    }

    fn push(&self, event: TransportEvent) {
        match &self.transport_tx {
            Some(tx) => {
                if tx.send(event).is_err() {
                    warn!("Session closed, dropping transport event");
                }
            }
            None => warn!("Transport events are produced internally, ignoring {:?}", event),
        }
    }

    fn snapshot(&self) -> Result<SessionSnapshot, CoreError> {
        Ok(self.runtime.block_on(self.handle.current_snapshot())?)
    }
}

#[uniffi::export]
impl Session {
    /// Create a session on top of the app's own transport (e.g. Nearby Connections)
    #[uniffi::constructor]
    pub fn new(
        role: PeerRole,
        transport: Box<dyn TransportCallback>,
        player: Box<dyn PlayerCallback>,
        settings: SessionSettings,
    ) -> Result<Arc<Self>, CoreError> {
        init_tracing();
        info!("Initializing tandem-core session as {:?}", role);

        let runtime = Runtime::new().map_err(|e| CoreError::NetworkError(e.to_string()))?;
        let (transport_tx, transport_events) = mpsc::unbounded_channel();
        let transport = Arc::new(ForeignTransport::new(Arc::from(transport)));
        let player = Arc::new(ForeignPlayer::new(Arc::from(player)));

        Ok(Arc::new(Self::start(
            runtime,
            role.into(),
            transport,
            transport_events,
            Some(transport_tx),
            player,
            settings.into(),
        )))
    }

    /// Create a session on the built-in LAN transport (mDNS discovery, libp2p streams)
    #[uniffi::constructor]
    pub fn new_lan(
        role: PeerRole,
        player: Box<dyn PlayerCallback>,
        settings: SessionSettings,
    ) -> Result<Arc<Self>, CoreError> {
        init_tracing();
        info!("Initializing tandem-core LAN session as {:?}", role);

        let runtime = Runtime::new().map_err(|e| CoreError::NetworkError(e.to_string()))?;
        let config: SessionConfig = settings.into();
        let network = NetworkManager::with_config(NetworkConfig {
            incoming_dir: config.storage_dir.join("incoming"),
            ..NetworkConfig::default()
        });
        let (network, transport_events) = runtime
            .block_on(async { network.start() })
            .map_err(|e| CoreError::NetworkError(e.to_string()))?;
        info!("LAN endpoint id: {}", network.local_peer_id);

        let player = Arc::new(ForeignPlayer::new(Arc::from(player)));
        Ok(Arc::new(Self::start(
            runtime,
            role.into(),
            Arc::new(network),
            transport_events,
            None,
            player,
            config,
        )))
    }

    /// Set the event callback
    pub fn set_callback(&self, callback: Box<dyn SessionCallback>) {
        *self.callback.write() = Some(Arc::from(callback));
    }

    pub fn role(&self) -> PeerRole {
        self.role.into()
    }

    // Host

    pub fn start_advertising(&self, local_name: String) -> Result<(), CoreError> {
        // Connection events are delivered through the callback instead
        let _ = self
            .runtime
            .block_on(self.handle.start_advertising(local_name))?;
        Ok(())
    }

    pub fn stop_advertising(&self) -> Result<(), CoreError> {
        Ok(self.runtime.block_on(self.handle.stop_advertising())?)
    }

    pub fn send_file(&self, endpoint_ids: Vec<String>, path: String) -> Result<Vec<SendOutcome>, CoreError> {
        let report = self
            .runtime
            .block_on(self.handle.send_file(endpoint_ids, PathBuf::from(path)))?;
        Ok(outcomes(&report))
    }

    pub fn send_file_to_all(&self, path: String) -> Result<Vec<SendOutcome>, CoreError> {
        let report = self
            .runtime
            .block_on(self.handle.send_file_to_all(PathBuf::from(path)))?;
        Ok(outcomes(&report))
    }

    /// Broadcast a start instant to every connected guest
    pub fn send_start_playback_command(&self) -> Result<StartReport, CoreError> {
        let (start, report) = self
            .runtime
            .block_on(self.handle.send_start_playback_command())?;
        info!("Start scheduled for {} ({}ms lead)", start.start_at_ms, start.lead_ms());
        Ok(StartReport {
            start: start.into(),
            outcomes: outcomes(&report),
        })
    }

    pub fn connected_guests(&self) -> Result<Vec<Peer>, CoreError> {
        let snapshot = self.snapshot()?;
        Ok(snapshot
            .as_host()
            .map(|h| h.guests.iter().map(Peer::from).collect())
            .unwrap_or_default())
    }

    /// File transfer state per guest
    pub fn file_transfers(&self) -> Result<Vec<PeerTransfer>, CoreError> {
        let snapshot = self.snapshot()?;
        Ok(snapshot
            .as_host()
            .map(|h| {
                h.file_transfers
                    .iter()
                    .map(|(endpoint_id, status)| PeerTransfer {
                        endpoint_id: endpoint_id.clone(),
                        state: status.into(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    // Guest

    pub fn start_discovery(&self) -> Result<(), CoreError> {
        let _ = self.runtime.block_on(self.handle.start_discovery())?;
        Ok(())
    }

    pub fn stop_discovery(&self) -> Result<(), CoreError> {
        Ok(self.runtime.block_on(self.handle.stop_discovery())?)
    }

    pub fn connect_to_host(&self, endpoint_id: String) -> Result<(), CoreError> {
        Ok(self.runtime.block_on(self.handle.connect_to_host(endpoint_id))?)
    }

    pub fn disconnect(&self) -> Result<(), CoreError> {
        Ok(self.runtime.block_on(self.handle.disconnect())?)
    }

    pub fn discovered_hosts(&self) -> Result<Vec<Peer>, CoreError> {
        let snapshot = self.snapshot()?;
        Ok(snapshot
            .as_guest()
            .map(|g| g.discovered_hosts.iter().map(Peer::from).collect())
            .unwrap_or_default())
    }

    pub fn incoming_file(&self) -> Result<TransferState, CoreError> {
        let snapshot = self.snapshot()?;
        Ok(snapshot
            .as_guest()
            .map(|g| TransferState::from(&g.file))
            .unwrap_or(TransferState::Idle))
    }

    // Playback

    pub fn pause(&self) -> Result<(), CoreError> {
        Ok(self.runtime.block_on(self.handle.pause())?)
    }

    pub fn resume(&self) -> Result<(), CoreError> {
        Ok(self.runtime.block_on(self.handle.resume())?)
    }

    pub fn seek(&self, position_ms: u64) -> Result<(), CoreError> {
        Ok(self.runtime.block_on(self.handle.seek(position_ms))?)
    }

    pub fn playback_state(&self) -> Result<PlaybackState, CoreError> {
        let snapshot = self.snapshot()?;
        Ok(PlaybackState::from(snapshot.playback()))
    }

    pub fn shutdown(&self) {
        info!("Session shutdown requested");
        self.handle.shutdown();
    }

    // Transport callbacks from the app

    pub fn on_connection_initiated(&self, endpoint_id: String, endpoint_name: Option<String>, is_incoming: bool) {
        debug!("Connection initiated with {} (incoming: {})", endpoint_id, is_incoming);
        self.push(TransportEvent::ConnectionInitiated {
            endpoint_id,
            endpoint_name,
            is_incoming,
        });
    }

    pub fn on_connection_result(&self, endpoint_id: String, outcome: ConnectionOutcome) {
        self.push(TransportEvent::ConnectionResult {
            endpoint_id,
            status: outcome.into(),
        });
    }

    pub fn on_disconnected(&self, endpoint_id: String) {
        self.push(TransportEvent::Disconnected { endpoint_id });
    }

    pub fn on_endpoint_found(&self, endpoint_id: String, endpoint_name: String) {
        self.push(TransportEvent::EndpointFound {
            endpoint_id,
            endpoint_name,
        });
    }

    pub fn on_endpoint_lost(&self, endpoint_id: String) {
        self.push(TransportEvent::EndpointLost { endpoint_id });
    }

    pub fn on_bytes_received(&self, endpoint_id: String, payload_id: u64, bytes: Vec<u8>) {
        self.push(TransportEvent::PayloadReceived {
            endpoint_id,
            payload_id,
            payload: IncomingPayload::Bytes(bytes),
        });
    }

    /// A file payload started arriving at `path` (complete once its update reports success)
    pub fn on_file_received(&self, endpoint_id: String, payload_id: u64, path: String) {
        self.push(TransportEvent::PayloadReceived {
            endpoint_id,
            payload_id,
            payload: IncomingPayload::File(PathBuf::from(path)),
        });
    }

    pub fn on_payload_transfer_update(
        &self,
        endpoint_id: String,
        payload_id: u64,
        bytes_transferred: u64,
        total_bytes: Option<u64>,
        status: PayloadStatus,
    ) {
        self.push(TransportEvent::PayloadTransferUpdate {
            endpoint_id,
            update: TransferUpdate {
                payload_id,
                bytes_transferred,
                total_bytes,
                status: status.into(),
            },
        });
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.handle.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tempdir::TempDir;

    #[derive(Default)]
    struct FakeNearby {
        accepted: Arc<Mutex<Vec<String>>>,
    }

    impl TransportCallback for FakeNearby {
        fn check_permissions(&self) -> Result<(), TransportFailure> {
            Ok(())
        }
        fn start_advertising(&self, _: String, _: String) -> Result<(), TransportFailure> {
            Ok(())
        }
        fn stop_advertising(&self) {}
        fn start_discovery(&self, _: String) -> Result<(), TransportFailure> {
            Ok(())
        }
        fn stop_discovery(&self) {}
        fn request_connection(&self, _: String, _: String) -> Result<(), TransportFailure> {
            Ok(())
        }
        fn accept_connection(&self, endpoint_id: String) -> Result<(), TransportFailure> {
            self.accepted.lock().push(endpoint_id);
            Ok(())
        }
        fn reject_connection(&self, _: String) -> Result<(), TransportFailure> {
            Ok(())
        }
        fn disconnect(&self, _: String) {}
        fn stop_all_endpoints(&self) {}
        fn send_bytes(&self, _: String, _: Vec<u8>) -> Result<u64, TransportFailure> {
            Ok(1)
        }
        fn send_file(&self, _: String, _: String) -> Result<u64, TransportFailure> {
            Ok(2)
        }
        fn cancel_payload(&self, _: u64) {}
    }

    struct SilentPlayer;

    impl PlayerCallback for SilentPlayer {
        fn load(&self, _: String) -> Result<(), PlayerFailure> {
            Ok(())
        }
        fn prepare(&self) -> Result<(), PlayerFailure> {
            Ok(())
        }
        fn seek_to(&self, _: u64) -> Result<(), PlayerFailure> {
            Ok(())
        }
        fn set_auto_start(&self, _: bool) -> Result<(), PlayerFailure> {
            Ok(())
        }
        fn play(&self) -> Result<(), PlayerFailure> {
            Ok(())
        }
        fn pause(&self) -> Result<(), PlayerFailure> {
            Ok(())
        }
    }

    fn settings(dir: &TempDir) -> SessionSettings {
        SessionSettings {
            service_id: None,
            local_name: "Host".to_string(),
            lookahead_ms: 5_000,
            clock_offset_ms: 0,
            transfer_stall_timeout_ms: None,
            storage_dir: dir.path().display().to_string(),
            host_plays_along: false,
        }
    }

    #[test]
    fn test_host_admits_guest_through_callbacks() {
        let dir = TempDir::new("tandem-ffi").unwrap();
        let accepted = Arc::new(Mutex::new(Vec::new()));
        let transport = FakeNearby {
            accepted: accepted.clone(),
        };
        let session = Session::new(
            PeerRole::Host,
            Box::new(transport),
            Box::new(SilentPlayer),
            settings(&dir),
        )
        .unwrap();

        session.start_advertising("Host".to_string()).unwrap();
        session.on_connection_initiated("A".to_string(), Some("Pixel".to_string()), true);
        session.on_connection_result("A".to_string(), ConnectionOutcome::Ok);

        let guests = session.connected_guests().unwrap();
        assert_eq!(guests.len(), 1);
        assert_eq!(guests[0].endpoint_id, "A");
        assert_eq!(guests[0].role, PeerRole::Guest);
        assert_eq!(accepted.lock().as_slice(), ["A".to_string()]);
    }

    #[test]
    fn test_start_without_guests_fails() {
        let dir = TempDir::new("tandem-ffi").unwrap();
        let session = Session::new(
            PeerRole::Host,
            Box::new(FakeNearby::default()),
            Box::new(SilentPlayer),
            settings(&dir),
        )
        .unwrap();

        session.start_advertising("Host".to_string()).unwrap();
        assert!(matches!(
            session.send_start_playback_command(),
            Err(CoreError::NoConnectedGuests)
        ));
    }

    #[test]
    fn test_guest_operations_refused_for_host() {
        let dir = TempDir::new("tandem-ffi").unwrap();
        let session = Session::new(
            PeerRole::Host,
            Box::new(FakeNearby::default()),
            Box::new(SilentPlayer),
            settings(&dir),
        )
        .unwrap();

        assert!(matches!(
            session.start_discovery(),
            Err(CoreError::WrongRole(_))
        ));
        assert_eq!(session.incoming_file().unwrap(), TransferState::Idle);
    }
}
