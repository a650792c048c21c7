//! Session actor
//!
//! Owns the registry, the transfer tracker and the playback coordinator.
//! Transport events, handle requests, the start timer and the stall sweep
//! are all serialized through one `select!` loop.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::SessionConfig;
use crate::player::Player;
use crate::sync::{Command, PlaybackCoordinator, PlaybackStatus, ScheduledPlayback};
use crate::transfer::{
    Direction, PayloadKind, ReceivedFileStore, TransferError, TransferEvent, TransferTracker,
};
use crate::transport::{
    ConnectionStatus, EndpointId, IncomingPayload, OutgoingPayload, PayloadId, Transport,
    TransportEvent, TransferUpdate,
};

use super::events::{
    ConnectionError, ConnectionEvent, DiscoveryEvent, SendReport, SessionError, SessionEvent,
};
use super::handle::{SessionCommand, SessionHandle};
use super::registry::{
    AcceptAll, Admission, ConnectionPolicy, ConnectionState, PeerEndpoint, Registry, Role,
};
use super::snapshot::{
    FileTransferStatus, GuestSnapshot, HostConnection, HostSnapshot, InboundFileStatus,
    SessionSnapshot,
};

/// How often in-flight transfers are checked for stalls
const STALL_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Longest single sleep of the start timer
const MAX_TIMER_DELAY: Duration = Duration::from_secs(60 * 60);

/// Builds and starts a session. One per device, with a fixed role.
pub struct SessionManager {
    role: Role,
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    player: Arc<dyn Player>,
    clock: Arc<dyn Clock>,
    policy: Arc<dyn ConnectionPolicy>,
}

impl SessionManager {
    /// `transport_events` is the channel the transport pushes its callbacks into
    pub fn new(
        role: Role,
        transport: Arc<dyn Transport>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        player: Arc<dyn Player>,
        config: SessionConfig,
    ) -> Self {
        Self {
            role,
            config,
            transport,
            transport_events,
            player,
            clock: Arc::new(SystemClock),
            policy: Arc::new(AcceptAll),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Admission policy for inbound connections (host only)
    pub fn with_policy(mut self, policy: Arc<dyn ConnectionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Spawn the session actor and return a handle plus the session event feed.
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        // The host runs on its own clock, offsets only apply to received timestamps
        let clock_offset_ms = match self.role {
            Role::Host => 0,
            Role::Guest => self.config.clock_offset_ms,
        };

        let mut actor = SessionActor {
            role: self.role,
            transport: self.transport,
            clock: self.clock,
            policy: self.policy,
            registry: Registry::new(),
            tracker: TransferTracker::new(ReceivedFileStore::new(&self.config.storage_dir)),
            coordinator: PlaybackCoordinator::new(self.player, clock_offset_ms),
            config: self.config,
            advertising: None,
            discovery: None,
            pending_host: None,
            file_transfers: BTreeMap::new(),
            inbound_file: InboundFileStatus::Waiting,
            last_schedule: None,
            last_status: PlaybackStatus::Idle,
            event_tx,
            snapshot_tx: None,
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(actor.snapshot());
        actor.snapshot_tx = Some(snapshot_tx);

        let handle = SessionHandle {
            command_tx,
            snapshot_rx,
        };

        let transport_events = self.transport_events;
        tokio::spawn(actor.run(command_rx, transport_events));

        (handle, event_rx)
    }
}

struct SessionActor {
    role: Role,
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    policy: Arc<dyn ConnectionPolicy>,
    registry: Registry,
    tracker: TransferTracker,
    coordinator: PlaybackCoordinator,
    /// Open while advertising (host)
    advertising: Option<mpsc::UnboundedSender<ConnectionEvent>>,
    /// Open while discovering (guest)
    discovery: Option<mpsc::UnboundedSender<DiscoveryEvent>>,
    /// Host we asked to connect to and have no outcome for yet
    pending_host: Option<EndpointId>,
    file_transfers: BTreeMap<EndpointId, FileTransferStatus>,
    inbound_file: InboundFileStatus,
    last_schedule: Option<ScheduledPlayback>,
    last_status: PlaybackStatus,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    snapshot_tx: Option<watch::Sender<SessionSnapshot>>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut command_rx: mpsc::UnboundedReceiver<SessionCommand>,
        mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        info!("Session started as {:?}", self.role);

        let mut sweep = tokio::time::interval(STALL_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let sweeping = self.config.transfer_stall_timeout.is_some();

        loop {
            let deadline = self.start_deadline();

            tokio::select! {
                // Transport callbacks queued before a request are applied before it
                biased;

                Some(event) = transport_rx.recv() => {
                    self.handle_transport_event(event).await;
                }

                command = command_rx.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => {
                        self.shutdown().await;
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                },

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now)), if deadline.is_some() => {
                    self.on_start_timer();
                }

                _ = sweep.tick(), if sweeping => {
                    self.expire_stalled().await;
                }
            }

            self.publish();
        }

        info!("Session stopped");
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::StartAdvertising { local_name, reply } => {
                let _ = reply.send(self.start_advertising(&local_name));
            }
            SessionCommand::StopAdvertising { reply } => {
                let result = self.require(Role::Host);
                if result.is_ok() {
                    self.stop_advertising().await;
                }
                let _ = reply.send(result);
            }
            SessionCommand::StartDiscovery { reply } => {
                let _ = reply.send(self.start_discovery());
            }
            SessionCommand::StopDiscovery { reply } => {
                let result = self.require(Role::Guest);
                if result.is_ok() {
                    self.stop_discovery();
                }
                let _ = reply.send(result);
            }
            SessionCommand::ConnectToHost { endpoint_id, reply } => {
                let _ = reply.send(self.connect_to_host(endpoint_id));
            }
            SessionCommand::Disconnect { reply } => {
                let result = self.require(Role::Guest);
                if result.is_ok() {
                    self.disconnect_host().await;
                }
                let _ = reply.send(result);
            }
            SessionCommand::SendFile { peers, path, reply } => {
                let _ = reply.send(self.send_file(peers, path).await);
            }
            SessionCommand::SendCommand {
                peers,
                command,
                reply,
            } => {
                let result = self.require(Role::Host).and_then(|_| {
                    let targets = self.targets(peers)?;
                    Ok(self.send_command(&targets, command))
                });
                let _ = reply.send(result);
            }
            SessionCommand::StartPlayback { reply } => {
                let _ = reply.send(self.start_playback());
            }
            SessionCommand::Pause { reply } => {
                let now = self.clock.now_ms();
                let _ = reply.send(self.coordinator.pause(now).map_err(SessionError::from));
            }
            SessionCommand::Resume { reply } => {
                let now = self.clock.now_ms();
                let _ = reply.send(self.coordinator.resume(now).map_err(SessionError::from));
            }
            SessionCommand::Seek { position_ms, reply } => {
                let now = self.clock.now_ms();
                let _ = reply.send(
                    self.coordinator
                        .seek(position_ms, now)
                        .map_err(SessionError::from),
                );
            }
            SessionCommand::Snapshot { reply } => {
                self.publish();
                let _ = reply.send(Ok(self.snapshot()));
            }
            SessionCommand::Shutdown => {}
        }
    }

    fn require(&self, role: Role) -> Result<(), SessionError> {
        if self.role == role {
            return Ok(());
        }
        Err(SessionError::WrongRole(match self.role {
            Role::Host => "host",
            Role::Guest => "guest",
        }))
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    // ---- Host: advertising -------------------------------------------------

    fn start_advertising(
        &mut self,
        local_name: &str,
    ) -> Result<mpsc::UnboundedReceiver<ConnectionEvent>, SessionError> {
        self.require(Role::Host)?;
        if self.advertising.is_some() {
            return Err(SessionError::AlreadyAdvertising);
        }
        self.transport.check_permissions()?;
        self.transport
            .start_advertising(local_name, &self.config.service_id)?;

        info!("Advertising as {}", local_name);
        let (tx, rx) = mpsc::unbounded_channel();
        self.advertising = Some(tx);
        Ok(rx)
    }

    async fn stop_advertising(&mut self) {
        if self.advertising.take().is_none() {
            debug!("stop_advertising: not advertising");
            return;
        }
        self.transport.stop_advertising();
        self.transport.stop_all_endpoints();

        for peer in self.registry.clear() {
            self.fail_transfers(&peer.id).await;
            self.emit(SessionEvent::PeerDisconnected(peer));
        }
        self.file_transfers.clear();
        info!("Stopped advertising");
    }

    // ---- Guest: discovery and connection ----------------------------------

    fn start_discovery(&mut self) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>, SessionError> {
        self.require(Role::Guest)?;
        if self.discovery.is_some() {
            return Err(SessionError::AlreadyDiscovering);
        }
        self.transport.check_permissions()?;
        self.transport.start_discovery(&self.config.service_id)?;

        info!("Discovering hosts");
        let (tx, rx) = mpsc::unbounded_channel();
        self.discovery = Some(tx);
        Ok(rx)
    }

    fn stop_discovery(&mut self) {
        if self.discovery.take().is_none() {
            debug!("stop_discovery: not discovering");
            return;
        }
        self.transport.stop_discovery();
        self.registry.clear_discovered();
        info!("Stopped discovery");
    }

    fn connect_to_host(&mut self, endpoint_id: EndpointId) -> Result<(), SessionError> {
        self.require(Role::Guest)?;
        if self.registry.connected_count() > 0 {
            return Err(SessionError::AlreadyConnected);
        }
        self.transport.check_permissions()?;

        info!("Requesting connection to {}", endpoint_id);
        if let Err(e) = self
            .transport
            .request_connection(&self.config.local_name, &endpoint_id)
        {
            warn!("Connection request to {} failed: {}", endpoint_id, e);
            self.connection_failed(endpoint_id, ConnectionError::TransportUnavailable(e.to_string()));
            return Err(e.into());
        }
        self.pending_host = Some(endpoint_id);
        Ok(())
    }

    fn connection_failed(&mut self, endpoint_id: EndpointId, error: ConnectionError) {
        if self.pending_host.as_deref() == Some(endpoint_id.as_str()) {
            self.pending_host = None;
        }
        if let Some(tx) = &self.discovery {
            let _ = tx.send(DiscoveryEvent::ConnectionFailed {
                endpoint_id: endpoint_id.clone(),
                error: error.clone(),
            });
        }
        self.emit(SessionEvent::ConnectionFailed { endpoint_id, error });
    }

    async fn disconnect_host(&mut self) {
        if let Some(endpoint_id) = self.pending_host.take() {
            self.transport.disconnect(&endpoint_id);
            self.registry.disconnected(&endpoint_id);
        }
        for host in self.registry.connected_peers() {
            info!("Disconnecting from {}", host.label());
            self.transport.disconnect(&host.id);
            self.peer_gone(&host.id).await;
        }
    }

    // ---- Transport events --------------------------------------------------

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ConnectionInitiated {
                endpoint_id,
                endpoint_name,
                is_incoming,
            } => self.on_connection_initiated(endpoint_id, endpoint_name, is_incoming),
            TransportEvent::ConnectionResult {
                endpoint_id,
                status,
            } => self.on_connection_result(endpoint_id, status),
            TransportEvent::Disconnected { endpoint_id } => {
                debug!("Transport reports {} disconnected", endpoint_id);
                self.peer_gone(&endpoint_id).await;
            }
            TransportEvent::EndpointFound {
                endpoint_id,
                endpoint_name,
            } => self.on_endpoint_found(endpoint_id, endpoint_name),
            TransportEvent::EndpointLost { endpoint_id } => {
                if self.registry.lost(&endpoint_id).is_some() {
                    info!("Host lost: {}", endpoint_id);
                    if let Some(tx) = &self.discovery {
                        let _ = tx.send(DiscoveryEvent::HostLost(endpoint_id.clone()));
                    }
                    self.emit(SessionEvent::HostLost(endpoint_id));
                }
            }
            TransportEvent::PayloadReceived {
                endpoint_id,
                payload_id,
                payload,
            } => self.on_payload_received(endpoint_id, payload_id, payload).await,
            TransportEvent::PayloadTransferUpdate {
                endpoint_id,
                update,
            } => self.on_transfer_update(&endpoint_id, update).await,
        }
    }

    fn on_connection_initiated(
        &mut self,
        endpoint_id: EndpointId,
        endpoint_name: Option<String>,
        is_incoming: bool,
    ) {
        debug!(
            "Connection initiated with {} ({:?}, incoming: {})",
            endpoint_id, endpoint_name, is_incoming
        );

        let admission = match self.role {
            Role::Host => {
                if self.advertising.is_none() {
                    warn!("Connection from {} while not advertising", endpoint_id);
                    Admission::Reject
                } else {
                    let endpoint = PeerEndpoint::new(endpoint_id.clone(), endpoint_name, Role::Guest);
                    let admission = self.policy.admit(&endpoint, self.registry.connected_count());
                    self.registry.initiated(endpoint);
                    admission
                }
            }
            Role::Guest => {
                if self.pending_host.as_deref() == Some(endpoint_id.as_str()) {
                    let name = endpoint_name.or_else(|| {
                        self.registry
                            .discovered_host(&endpoint_id)
                            .and_then(|host| host.display_name.clone())
                    });
                    self.registry
                        .initiated(PeerEndpoint::new(endpoint_id.clone(), name, Role::Host));
                    Admission::Accept
                } else {
                    warn!("Unsolicited connection from {}", endpoint_id);
                    Admission::Reject
                }
            }
        };

        let result = match admission {
            Admission::Accept => self.transport.accept_connection(&endpoint_id),
            Admission::Reject => {
                info!("Rejecting connection from {}", endpoint_id);
                self.registry.disconnected(&endpoint_id);
                self.transport.reject_connection(&endpoint_id)
            }
        };
        if let Err(e) = result {
            warn!("Failed to answer connection from {}: {}", endpoint_id, e);
            self.registry.disconnected(&endpoint_id);
            if self.role == Role::Guest && admission == Admission::Accept {
                self.connection_failed(endpoint_id, ConnectionError::TransportUnavailable(e.to_string()));
            }
        }
    }

    fn on_connection_result(&mut self, endpoint_id: EndpointId, status: ConnectionStatus) {
        if let Some(error) = ConnectionError::from_status(&status) {
            warn!("Connection with {} failed: {}", endpoint_id, error);
            self.registry.disconnected(&endpoint_id);
            if self.role == Role::Guest && self.pending_host.as_deref() == Some(endpoint_id.as_str()) {
                self.connection_failed(endpoint_id, error);
            }
            return;
        }

        match self.role {
            Role::Host => {
                if self.advertising.is_none() {
                    warn!("Connection result for {} after advertising stopped", endpoint_id);
                    self.transport.disconnect(&endpoint_id);
                    return;
                }
                if self.registry.state(&endpoint_id) == ConnectionState::Disconnected {
                    warn!("Connection result for unadmitted endpoint {}", endpoint_id);
                    self.transport.disconnect(&endpoint_id);
                    return;
                }
                let Some(guest) = self.registry.connected(&endpoint_id, Role::Guest) else {
                    return;
                };
                self.file_transfers
                    .insert(guest.id.clone(), FileTransferStatus::NotSent);
                if let Some(tx) = &self.advertising {
                    let _ = tx.send(ConnectionEvent::Connected(guest.clone()));
                }
                self.emit(SessionEvent::PeerConnected(guest));
            }
            Role::Guest => {
                if self.pending_host.as_deref() != Some(endpoint_id.as_str()) {
                    if !self.registry.is_connected(&endpoint_id) {
                        warn!("Connection result for unrequested endpoint {}", endpoint_id);
                        self.transport.disconnect(&endpoint_id);
                    }
                    return;
                }
                self.pending_host = None;
                let Some(host) = self.registry.connected(&endpoint_id, Role::Host) else {
                    return;
                };
                self.inbound_file = InboundFileStatus::Waiting;
                if let Some(tx) = &self.discovery {
                    let _ = tx.send(DiscoveryEvent::Connected(host.clone()));
                }
                self.emit(SessionEvent::PeerConnected(host));
            }
        }
    }

    /// A peer went away, whether reported by the transport or dropped locally
    async fn peer_gone(&mut self, endpoint_id: &str) {
        let Some((peer, state)) = self.registry.disconnected(endpoint_id) else {
            return;
        };
        self.fail_transfers(endpoint_id).await;

        if self.role == Role::Guest && self.pending_host.as_deref() == Some(endpoint_id) {
            self.connection_failed(
                endpoint_id.to_string(),
                ConnectionError::TransportUnavailable("disconnected before connecting".to_string()),
            );
            return;
        }
        if state != ConnectionState::Connected {
            return;
        }

        match self.role {
            Role::Host => {
                self.file_transfers.remove(endpoint_id);
                if let Some(tx) = &self.advertising {
                    let _ = tx.send(ConnectionEvent::Disconnected(peer.clone()));
                }
            }
            Role::Guest => {
                if let Some(tx) = &self.discovery {
                    let _ = tx.send(DiscoveryEvent::Disconnected(peer.clone()));
                }
            }
        }
        self.emit(SessionEvent::PeerDisconnected(peer));
    }

    fn on_endpoint_found(&mut self, endpoint_id: EndpointId, endpoint_name: String) {
        if self.role != Role::Guest || self.discovery.is_none() {
            debug!("Ignoring endpoint {} found outside discovery", endpoint_id);
            return;
        }
        let host = PeerEndpoint::new(endpoint_id, Some(endpoint_name), Role::Host);
        if !self.registry.discovered(host.clone()) {
            return;
        }
        info!("Host found: {}", host.label());
        if let Some(tx) = &self.discovery {
            let _ = tx.send(DiscoveryEvent::HostFound(host.clone()));
        }
        self.emit(SessionEvent::HostFound(host));
    }

    async fn on_payload_received(
        &mut self,
        endpoint_id: EndpointId,
        payload_id: PayloadId,
        payload: IncomingPayload,
    ) {
        let Some(peer) = self
            .registry
            .endpoint(&endpoint_id)
            .filter(|_| self.registry.is_connected(&endpoint_id))
            .cloned()
        else {
            warn!("Payload {} from unconnected endpoint {}", payload_id, endpoint_id);
            self.transport.cancel_payload(payload_id);
            return;
        };

        match self
            .tracker
            .on_payload_received(peer, payload_id, payload, std::time::Instant::now())
        {
            Ok(event) => self.on_transfer_event(event),
            Err(e) => warn!("Ignoring payload {}: {}", payload_id, e),
        }
    }

    async fn on_transfer_update(&mut self, endpoint_id: &str, update: TransferUpdate) {
        if let Some(event) = self
            .tracker
            .on_transfer_update(endpoint_id, update, std::time::Instant::now())
            .await
        {
            self.on_transfer_event(event);
        }
    }

    async fn fail_transfers(&mut self, endpoint_id: &str) {
        for event in self.tracker.fail_peer(endpoint_id).await {
            self.on_transfer_event(event);
        }
    }

    async fn expire_stalled(&mut self) {
        let Some(timeout) = self.config.transfer_stall_timeout else {
            return;
        };
        for event in self
            .tracker
            .expire_stalled(std::time::Instant::now(), timeout)
            .await
        {
            self.transport.cancel_payload(event.payload_id());
            self.on_transfer_event(event);
        }
    }

    /// Fold a tracker outcome into session state, then forward it
    fn on_transfer_event(&mut self, event: TransferEvent) {
        match &event {
            TransferEvent::Started {
                peer,
                kind: PayloadKind::File,
                direction,
                bytes_expected,
                ..
            }
            | TransferEvent::Progress {
                peer,
                kind: PayloadKind::File,
                direction,
                bytes_expected,
                ..
            } => {
                let bytes_transferred = match &event {
                    TransferEvent::Progress {
                        bytes_transferred, ..
                    } => *bytes_transferred,
                    _ => 0,
                };
                match direction {
                    Direction::Outbound => {
                        self.file_transfers.insert(
                            peer.id.clone(),
                            FileTransferStatus::Sending {
                                bytes_transferred,
                                bytes_expected: *bytes_expected,
                            },
                        );
                    }
                    Direction::Inbound => {
                        self.inbound_file = InboundFileStatus::Receiving {
                            bytes_transferred,
                            bytes_expected: *bytes_expected,
                        };
                    }
                }
            }
            TransferEvent::Sent {
                peer,
                kind: PayloadKind::File,
                ..
            } => {
                self.file_transfers
                    .insert(peer.id.clone(), FileTransferStatus::Sent);
            }
            TransferEvent::FileReceived { peer, file, .. } => {
                if self.is_connected_host(peer) {
                    self.inbound_file = InboundFileStatus::Received(file.clone());
                    let now = self.clock.now_ms();
                    if let Err(e) = self.coordinator.on_file_received(file.path.clone(), now) {
                        warn!("Could not prepare received file: {}", e);
                    }
                } else {
                    warn!("Ignoring file from {}", peer.label());
                }
            }
            TransferEvent::CommandReceived { peer, command, .. } => {
                if self.is_connected_host(peer) {
                    self.apply_command(peer.clone(), *command);
                } else {
                    warn!("Ignoring {} from {}", command.name(), peer.label());
                }
            }
            TransferEvent::Failed {
                peer,
                kind: PayloadKind::File,
                direction,
                error,
                ..
            } => match direction {
                Direction::Outbound => {
                    self.file_transfers
                        .insert(peer.id.clone(), FileTransferStatus::Error(error.to_string()));
                }
                Direction::Inbound => {
                    self.inbound_file = InboundFileStatus::Error(error.to_string());
                }
            },
            _ => {}
        }

        // Outbound state for peers that left is not kept around
        if self.role == Role::Host && !self.registry.is_connected(&event.peer().id) {
            self.file_transfers.remove(&event.peer().id);
        }

        self.emit(SessionEvent::Transfer(event));
    }

    fn is_connected_host(&self, peer: &PeerEndpoint) -> bool {
        self.role == Role::Guest && peer.role == Role::Host && self.registry.is_connected(&peer.id)
    }

    fn apply_command(&mut self, from: PeerEndpoint, command: Command) {
        let now = self.clock.now_ms();
        match command {
            Command::StartPlayback { start_at_ms } => {
                if let Err(e) = self.coordinator.on_start_command(start_at_ms, now) {
                    warn!("Could not schedule playback: {}", e);
                }
            }
        }
        self.emit(SessionEvent::CommandReceived { from, command });
    }

    // ---- Host: sending -----------------------------------------------------

    /// Resolve an explicit peer list, or every connected guest
    fn targets(&self, peers: Option<Vec<EndpointId>>) -> Result<Vec<EndpointId>, SessionError> {
        match peers {
            Some(peers) => Ok(peers),
            None => {
                let all: Vec<EndpointId> = self
                    .registry
                    .connected_peers()
                    .into_iter()
                    .map(|peer| peer.id)
                    .collect();
                if all.is_empty() {
                    return Err(SessionError::NoConnectedGuests);
                }
                Ok(all)
            }
        }
    }

    async fn send_file(
        &mut self,
        peers: Option<Vec<EndpointId>>,
        path: PathBuf,
    ) -> Result<SendReport, SessionError> {
        self.require(Role::Host)?;
        let targets = self.targets(peers)?;
        let size = tokio::fs::metadata(&path)
            .await
            .map_err(|e| SessionError::Io(format!("{}: {}", path.display(), e)))?
            .len();

        info!("Sending {} ({} bytes) to {} peer(s)", path.display(), size, targets.len());
        let report = self.fan_out(
            &targets,
            PayloadKind::File,
            Some(size),
            OutgoingPayload::File(path.clone()),
        );

        if self.config.host_plays_along {
            let now = self.clock.now_ms();
            if let Err(e) = self.coordinator.on_file_received(path, now) {
                warn!("Host player could not take the file: {}", e);
            }
        }
        Ok(report)
    }

    fn send_command(&mut self, targets: &[EndpointId], command: Command) -> SendReport {
        let bytes = command.encode();
        debug!("Sending {} to {} peer(s)", command, targets.len());
        self.fan_out(
            targets,
            PayloadKind::Command,
            Some(bytes.len() as u64),
            OutgoingPayload::Bytes(bytes),
        )
    }

    /// One independent payload per peer
    fn fan_out(
        &mut self,
        targets: &[EndpointId],
        kind: PayloadKind,
        bytes_expected: Option<u64>,
        payload: OutgoingPayload,
    ) -> SendReport {
        let mut report = SendReport::default();

        for endpoint_id in targets {
            let peer = match self.registry.endpoint(endpoint_id) {
                Some(peer) if self.registry.is_connected(endpoint_id) => peer.clone(),
                _ => {
                    warn!("Not sending to {}: not connected", endpoint_id);
                    report.push(endpoint_id, Err(TransferError::PeerNotConnected(endpoint_id.clone())));
                    continue;
                }
            };

            let result = self
                .transport
                .send_payload(endpoint_id, payload.clone())
                .map_err(TransferError::from)
                .and_then(|payload_id| {
                    let event = self.tracker.begin_outbound(
                        peer.clone(),
                        payload_id,
                        kind,
                        bytes_expected,
                        std::time::Instant::now(),
                    )?;
                    Ok((payload_id, event))
                });

            match result {
                Ok((payload_id, event)) => {
                    self.on_transfer_event(event);
                    report.push(endpoint_id, Ok(payload_id));
                }
                Err(error) => {
                    warn!("Send to {} failed: {}", peer.label(), error);
                    if kind == PayloadKind::File {
                        self.file_transfers
                            .insert(endpoint_id.clone(), FileTransferStatus::Error(error.to_string()));
                    }
                    report.push(endpoint_id, Err(error));
                }
            }
        }
        report
    }

    fn start_playback(&mut self) -> Result<(ScheduledPlayback, SendReport), SessionError> {
        self.require(Role::Host)?;
        let targets = self.targets(None)?;

        let issued_at_ms = self.clock.now_ms();
        let schedule = ScheduledPlayback {
            start_at_ms: issued_at_ms.saturating_add(self.config.lookahead_ms()),
            issued_at_ms,
        };
        info!(
            "Scheduling playback at {} ({}ms ahead)",
            schedule.start_at_ms,
            schedule.lead_ms()
        );

        let report = self.send_command(
            &targets,
            Command::StartPlayback {
                start_at_ms: schedule.start_at_ms,
            },
        );
        self.last_schedule = Some(schedule);

        if self.config.host_plays_along {
            if let Err(e) = self.coordinator.on_start_command(schedule.start_at_ms, issued_at_ms) {
                warn!("Host player could not schedule: {}", e);
            }
        }
        self.emit(SessionEvent::PlaybackScheduled(schedule));
        Ok((schedule, report))
    }

    // ---- Playback timer ----------------------------------------------------

    fn start_deadline(&self) -> Option<tokio::time::Instant> {
        let start_at_ms = self.coordinator.pending_start_ms()?;
        let delay_ms = start_at_ms.saturating_sub(self.clock.now_ms()).max(0) as u64;
        // Far-off starts are re-checked when the capped timer fires
        let delay = Duration::from_millis(delay_ms).min(MAX_TIMER_DELAY);
        Some(tokio::time::Instant::now() + delay)
    }

    fn on_start_timer(&mut self) {
        if let Err(e) = self.coordinator.on_tick(self.clock.now_ms()) {
            warn!("Scheduled start failed: {}", e);
        }
    }

    // ---- Snapshots ---------------------------------------------------------

    fn snapshot(&self) -> SessionSnapshot {
        let playback = self.coordinator.snapshot(self.clock.now_ms());
        match self.role {
            Role::Host => SessionSnapshot::Host(HostSnapshot {
                advertising: self.advertising.is_some(),
                guests: self.registry.connected_peers(),
                file_transfers: self.file_transfers.clone(),
                last_schedule: self.last_schedule,
                playback,
            }),
            Role::Guest => {
                let host = match (&self.pending_host, self.registry.connected_peers().pop()) {
                    (_, Some(host)) => HostConnection::Connected(host),
                    (Some(pending), None) => HostConnection::Connecting(pending.clone()),
                    (None, None) => HostConnection::None,
                };
                SessionSnapshot::Guest(GuestSnapshot {
                    discovering: self.discovery.is_some(),
                    discovered_hosts: self.registry.discovered_hosts(),
                    host,
                    file: self.inbound_file.clone(),
                    playback,
                })
            }
        }
    }

    fn publish(&mut self) {
        let status = self.coordinator.status();
        if status != self.last_status {
            debug!("Playback {:?} -> {:?}", self.last_status, status);
            self.last_status = status;
            self.emit(SessionEvent::PlaybackStatusChanged(status));
        }

        let snapshot = self.snapshot();
        if let Some(tx) = &self.snapshot_tx {
            tx.send_if_modified(|current| {
                if *current == snapshot {
                    false
                } else {
                    *current = snapshot;
                    true
                }
            });
        }
    }

    async fn shutdown(&mut self) {
        info!("Shutting down session");
        match self.role {
            Role::Host => self.stop_advertising().await,
            Role::Guest => {
                self.stop_discovery();
                self.disconnect_host().await;
            }
        }
        self.transport.stop_all_endpoints();
        self.publish();
    }
}
