//! libp2p LAN transport
//!
//! Implements [`Transport`] for desktop peers on the same network:
//! - mDNS for discovery
//! - TCP + QUIC for connectivity
//! - request-response (CBOR) for probes, session handshakes and payload chunks
//!
//! Endpoint ids are libp2p peer ids. Files are streamed chunk by chunk; each
//! acknowledgement drives a progress update on both sides.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use futures::StreamExt;
use libp2p::{
    identity, mdns, noise, ping,
    request_response::{self, OutboundRequestId, ProtocolSupport, ResponseChannel},
    swarm::{NetworkBehaviour, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm,
};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::transport::{
    ConnectionStatus, IncomingPayload, OutgoingPayload, PayloadId, TransferStatus,
    TransferUpdate, Transport, TransportError, TransportEvent,
};

use super::wire::{next_chunk_len, Chunk, ChunkKind, WireRequest, WireResponse, PROTOCOL};

/// Session connections stay open while playback runs without traffic
const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(3600);

/// Network configuration
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Where inbound files are written while they arrive
    pub incoming_dir: PathBuf,
    /// Bytes per file chunk
    pub chunk_size: usize,
    /// How long a single request may wait for its response
    pub request_timeout: Duration,
    /// Whether to listen on QUIC in addition to TCP
    pub enable_quic: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            incoming_dir: std::env::temp_dir().join("tandem-incoming"),
            chunk_size: 64 * 1024,
            request_timeout: Duration::from_secs(30),
            enable_quic: true,
        }
    }
}

/// Network-related errors
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Failed to create transport: {0}")]
    Transport(String),

    #[error("Failed to listen: {0}")]
    Listen(String),

    #[error("libp2p error: {0}")]
    Libp2p(String),
}

#[derive(NetworkBehaviour)]
pub struct TandemBehaviour {
    ping: ping::Behaviour,
    mdns: mdns::tokio::Behaviour,
    payload: request_response::cbor::Behaviour<WireRequest, WireResponse>,
}

/// Commands sent to the network manager
#[derive(Debug)]
enum NetworkCommand {
    StartAdvertising { name: String, service_id: String },
    StopAdvertising,
    StartDiscovery { service_id: String },
    StopDiscovery,
    RequestConnection { name: String, peer: PeerId },
    AcceptConnection { peer: PeerId },
    RejectConnection { peer: PeerId },
    Disconnect { peer: PeerId },
    StopAllEndpoints,
    SendPayload {
        peer: PeerId,
        payload_id: PayloadId,
        payload: OutgoingPayload,
    },
    CancelPayload { payload_id: PayloadId },
    Shutdown,
}

/// Handle to communicate with the running network
#[derive(Clone)]
pub struct NetworkHandle {
    command_tx: mpsc::UnboundedSender<NetworkCommand>,
    pub local_peer_id: String,
}

impl NetworkHandle {
    fn send(&self, command: NetworkCommand) -> Result<(), TransportError> {
        self.command_tx
            .send(command)
            .map_err(|_| TransportError::Closed)
    }

    pub fn shutdown(&self) {
        let _ = self.command_tx.send(NetworkCommand::Shutdown);
    }
}

fn parse_peer(endpoint_id: &str) -> Result<PeerId, TransportError> {
    endpoint_id
        .parse()
        .map_err(|_| TransportError::UnknownEndpoint(endpoint_id.to_string()))
}

impl Transport for NetworkHandle {
    fn check_permissions(&self) -> Result<(), TransportError> {
        // Plain sockets need no runtime grants
        if self.command_tx.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn start_advertising(&self, local_name: &str, service_id: &str) -> Result<(), TransportError> {
        self.send(NetworkCommand::StartAdvertising {
            name: local_name.to_string(),
            service_id: service_id.to_string(),
        })
    }

    fn stop_advertising(&self) {
        let _ = self.send(NetworkCommand::StopAdvertising);
    }

    fn start_discovery(&self, service_id: &str) -> Result<(), TransportError> {
        self.send(NetworkCommand::StartDiscovery {
            service_id: service_id.to_string(),
        })
    }

    fn stop_discovery(&self) {
        let _ = self.send(NetworkCommand::StopDiscovery);
    }

    fn request_connection(&self, local_name: &str, endpoint_id: &str) -> Result<(), TransportError> {
        self.send(NetworkCommand::RequestConnection {
            name: local_name.to_string(),
            peer: parse_peer(endpoint_id)?,
        })
    }

    fn accept_connection(&self, endpoint_id: &str) -> Result<(), TransportError> {
        self.send(NetworkCommand::AcceptConnection {
            peer: parse_peer(endpoint_id)?,
        })
    }

    fn reject_connection(&self, endpoint_id: &str) -> Result<(), TransportError> {
        self.send(NetworkCommand::RejectConnection {
            peer: parse_peer(endpoint_id)?,
        })
    }

    fn disconnect(&self, endpoint_id: &str) {
        match parse_peer(endpoint_id) {
            Ok(peer) => {
                let _ = self.send(NetworkCommand::Disconnect { peer });
            }
            Err(e) => debug!("disconnect: {}", e),
        }
    }

    fn stop_all_endpoints(&self) {
        let _ = self.send(NetworkCommand::StopAllEndpoints);
    }

    fn send_payload(
        &self,
        endpoint_id: &str,
        payload: OutgoingPayload,
    ) -> Result<PayloadId, TransportError> {
        let peer = parse_peer(endpoint_id)?;
        let payload_id = rand::random::<PayloadId>();
        self.send(NetworkCommand::SendPayload {
            peer,
            payload_id,
            payload,
        })?;
        Ok(payload_id)
    }

    fn cancel_payload(&self, payload_id: PayloadId) {
        let _ = self.send(NetworkCommand::CancelPayload { payload_id });
    }
}

/// What an in-flight request was for
#[derive(Debug, Clone, Copy)]
enum PendingRequest {
    Probe(PeerId),
    Connect(PeerId),
    Chunk(PayloadId),
    Notice,
}

enum Source {
    Bytes(Vec<u8>),
    File(tokio::fs::File),
}

struct Outgoing {
    peer: PeerId,
    source: Source,
    total: u64,
    sent: u64,
}

struct Incoming {
    file: tokio::fs::File,
    received: u64,
    total: u64,
}

/// Manages the swarm - runs in a background task
pub struct NetworkManager {
    local_peer_id: PeerId,
    keypair: identity::Keypair,
    config: NetworkConfig,
    /// Name and service while advertising
    advertising: Option<(String, String)>,
    /// Service while discovering
    discovery: Option<String>,
    /// Peers seen on mDNS
    nearby: HashSet<PeerId>,
    /// Advertising peers reported as found, with their names
    found: HashMap<PeerId, String>,
    /// Peers with an established session
    sessions: HashSet<PeerId>,
    /// Connect requests waiting for a local accept/reject
    awaiting_answer: HashMap<PeerId, ResponseChannel<WireResponse>>,
    /// Connect requests we sent and have no answer for
    connecting: HashSet<PeerId>,
    requests: HashMap<OutboundRequestId, PendingRequest>,
    outgoing: HashMap<PayloadId, Outgoing>,
    incoming: HashMap<(PeerId, PayloadId), Incoming>,
}

impl NetworkManager {
    pub fn new() -> Self {
        Self::with_config(NetworkConfig::default())
    }

    pub fn with_config(config: NetworkConfig) -> Self {
        let keypair = identity::Keypair::generate_ed25519();
        let local_peer_id = PeerId::from(keypair.public());
        info!("Local peer ID: {}", local_peer_id);

        Self {
            local_peer_id,
            keypair,
            config,
            advertising: None,
            discovery: None,
            nearby: HashSet::new(),
            found: HashMap::new(),
            sessions: HashSet::new(),
            awaiting_answer: HashMap::new(),
            connecting: HashSet::new(),
            requests: HashMap::new(),
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
        }
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    /// Start the network and return a handle plus the transport event stream
    pub fn start(
        self,
    ) -> Result<(NetworkHandle, mpsc::UnboundedReceiver<TransportEvent>), NetworkError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let handle = NetworkHandle {
            command_tx,
            local_peer_id: self.local_peer_id.to_string(),
        };

        let swarm = self.create_swarm()?;
        tokio::spawn(async move {
            if let Err(e) = self.run(swarm, event_tx, command_rx).await {
                warn!("Network task error: {}", e);
            }
        });

        Ok((handle, event_rx))
    }

    fn create_swarm(&self) -> Result<Swarm<TandemBehaviour>, NetworkError> {
        let request_timeout = self.config.request_timeout;

        let swarm = libp2p::SwarmBuilder::with_existing_identity(self.keypair.clone())
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| NetworkError::Transport(e.to_string()))?
            .with_quic()
            .with_behaviour(|keypair| {
                let ping = ping::Behaviour::new(
                    ping::Config::new()
                        .with_interval(Duration::from_secs(15))
                        .with_timeout(Duration::from_secs(20)),
                );

                let mdns = mdns::tokio::Behaviour::new(
                    mdns::Config::default(),
                    keypair.public().to_peer_id(),
                )
                .map_err(|e| e.to_string())?;

                let payload = request_response::cbor::Behaviour::new(
                    [(StreamProtocol::new(PROTOCOL), ProtocolSupport::Full)],
                    request_response::Config::default().with_request_timeout(request_timeout),
                );

                Ok(TandemBehaviour {
                    ping,
                    mdns,
                    payload,
                })
            })
            .map_err(|e| NetworkError::Transport(e.to_string()))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
            .build();

        Ok(swarm)
    }

    fn listen(swarm: &mut Swarm<TandemBehaviour>, addr: &str) -> Result<(), NetworkError> {
        let addr: Multiaddr = addr
            .parse()
            .map_err(|e: libp2p::multiaddr::Error| NetworkError::Listen(e.to_string()))?;
        let id = swarm
            .listen_on(addr)
            .map_err(|e| NetworkError::Listen(e.to_string()))?;
        info!("Listener started: {:?}", id);
        Ok(())
    }

    /// Run the network event loop
    async fn run(
        mut self,
        mut swarm: Swarm<TandemBehaviour>,
        event_tx: mpsc::UnboundedSender<TransportEvent>,
        mut command_rx: mpsc::UnboundedReceiver<NetworkCommand>,
    ) -> Result<(), NetworkError> {
        Self::listen(&mut swarm, "/ip4/0.0.0.0/tcp/0")?;
        if self.config.enable_quic {
            if let Err(e) = Self::listen(&mut swarm, "/ip4/0.0.0.0/udp/0/quic-v1") {
                warn!("QUIC unavailable: {}", e);
            }
        }

        loop {
            tokio::select! {
                event = swarm.select_next_some() => {
                    self.handle_swarm_event(&mut swarm, event, &event_tx).await;
                }
                Some(cmd) = command_rx.recv() => {
                    if matches!(cmd, NetworkCommand::Shutdown) {
                        info!("Network shutting down");
                        self.stop_all(&mut swarm);
                        break;
                    }
                    self.handle_command(&mut swarm, cmd, &event_tx).await;
                }
            }
        }

        Ok(())
    }

    async fn handle_command(
        &mut self,
        swarm: &mut Swarm<TandemBehaviour>,
        cmd: NetworkCommand,
        event_tx: &mpsc::UnboundedSender<TransportEvent>,
    ) {
        match cmd {
            NetworkCommand::StartAdvertising { name, service_id } => {
                info!("Advertising {} on {}", name, service_id);
                self.advertising = Some((name, service_id));
            }
            NetworkCommand::StopAdvertising => {
                self.advertising = None;
                for (peer, channel) in self.awaiting_answer.drain() {
                    debug!("Dropping pending connection from {}", peer);
                    let _ = swarm
                        .behaviour_mut()
                        .payload
                        .send_response(channel, WireResponse::Rejected);
                }
            }
            NetworkCommand::StartDiscovery { service_id } => {
                info!("Discovering {} ({} nearby peers)", service_id, self.nearby.len());
                self.discovery = Some(service_id);
                self.found.clear();
                let nearby: Vec<PeerId> = self.nearby.iter().copied().collect();
                for peer in nearby {
                    self.probe(swarm, peer);
                }
            }
            NetworkCommand::StopDiscovery => {
                self.discovery = None;
                self.found.clear();
            }
            NetworkCommand::RequestConnection { name, peer } => {
                let service_id = self.discovery.clone().unwrap_or_default();
                let endpoint_name = self.found.get(&peer).cloned();
                self.connecting.insert(peer);
                let request_id = swarm
                    .behaviour_mut()
                    .payload
                    .send_request(&peer, WireRequest::Connect { name, service_id });
                self.requests.insert(request_id, PendingRequest::Connect(peer));
                let _ = event_tx.send(TransportEvent::ConnectionInitiated {
                    endpoint_id: peer.to_string(),
                    endpoint_name,
                    is_incoming: false,
                });
            }
            NetworkCommand::AcceptConnection { peer } => {
                if let Some(channel) = self.awaiting_answer.remove(&peer) {
                    if swarm
                        .behaviour_mut()
                        .payload
                        .send_response(channel, WireResponse::Accepted)
                        .is_err()
                    {
                        warn!("Peer {} left before being accepted", peer);
                        let _ = event_tx.send(TransportEvent::ConnectionResult {
                            endpoint_id: peer.to_string(),
                            status: ConnectionStatus::Error("peer left".to_string()),
                        });
                        return;
                    }
                    info!("Session established with {}", peer);
                    self.sessions.insert(peer);
                    let _ = event_tx.send(TransportEvent::ConnectionResult {
                        endpoint_id: peer.to_string(),
                        status: ConnectionStatus::Ok,
                    });
                } else if !self.connecting.contains(&peer) {
                    debug!("Nothing to accept from {}", peer);
                }
            }
            NetworkCommand::RejectConnection { peer } => {
                if let Some(channel) = self.awaiting_answer.remove(&peer) {
                    let _ = swarm
                        .behaviour_mut()
                        .payload
                        .send_response(channel, WireResponse::Rejected);
                }
                self.connecting.remove(&peer);
                let _ = event_tx.send(TransportEvent::ConnectionResult {
                    endpoint_id: peer.to_string(),
                    status: ConnectionStatus::Rejected,
                });
            }
            NetworkCommand::Disconnect { peer } => {
                self.end_session(swarm, peer);
            }
            NetworkCommand::StopAllEndpoints => {
                self.stop_all(swarm);
            }
            NetworkCommand::SendPayload {
                peer,
                payload_id,
                payload,
            } => {
                self.start_send(swarm, peer, payload_id, payload, event_tx).await;
            }
            NetworkCommand::CancelPayload { payload_id } => {
                self.cancel(swarm, payload_id, event_tx).await;
            }
            NetworkCommand::Shutdown => {}
        }
    }

    fn probe(&mut self, swarm: &mut Swarm<TandemBehaviour>, peer: PeerId) {
        debug!("Probing {}", peer);
        let request_id = swarm.behaviour_mut().payload.send_request(&peer, WireRequest::Probe);
        self.requests.insert(request_id, PendingRequest::Probe(peer));
    }

    fn notify(&mut self, swarm: &mut Swarm<TandemBehaviour>, peer: PeerId, request: WireRequest) {
        let request_id = swarm.behaviour_mut().payload.send_request(&peer, request);
        self.requests.insert(request_id, PendingRequest::Notice);
    }

    /// Drop a session locally and tell the peer. No local event, like the
    /// caller-initiated disconnect of other transports.
    fn end_session(&mut self, swarm: &mut Swarm<TandemBehaviour>, peer: PeerId) {
        self.connecting.remove(&peer);
        if self.sessions.remove(&peer) {
            info!("Leaving session with {}", peer);
            self.notify(swarm, peer, WireRequest::Disconnect);
        }
        self.drop_transfers(peer);
    }

    fn stop_all(&mut self, swarm: &mut Swarm<TandemBehaviour>) {
        let peers: Vec<PeerId> = self.sessions.iter().copied().collect();
        for peer in peers {
            self.end_session(swarm, peer);
        }
        self.connecting.clear();
    }

    fn drop_transfers(&mut self, peer: PeerId) {
        self.outgoing.retain(|_, out| out.peer != peer);
        self.incoming.retain(|(from, _), _| *from != peer);
    }

    fn emit_update(
        event_tx: &mpsc::UnboundedSender<TransportEvent>,
        peer: PeerId,
        payload_id: PayloadId,
        bytes_transferred: u64,
        total: u64,
        status: TransferStatus,
    ) {
        let _ = event_tx.send(TransportEvent::PayloadTransferUpdate {
            endpoint_id: peer.to_string(),
            update: TransferUpdate {
                payload_id,
                bytes_transferred,
                total_bytes: Some(total),
                status,
            },
        });
    }

    // ---- Sending -----------------------------------------------------------

    async fn start_send(
        &mut self,
        swarm: &mut Swarm<TandemBehaviour>,
        peer: PeerId,
        payload_id: PayloadId,
        payload: OutgoingPayload,
        event_tx: &mpsc::UnboundedSender<TransportEvent>,
    ) {
        if !self.sessions.contains(&peer) {
            warn!("Payload {} for {} without a session", payload_id, peer);
            Self::emit_update(event_tx, peer, payload_id, 0, 0, TransferStatus::Failure);
            return;
        }

        let (source, total) = match payload {
            OutgoingPayload::Bytes(data) => {
                let total = data.len() as u64;
                (Source::Bytes(data), total)
            }
            OutgoingPayload::File(path) => {
                let opened = async {
                    let file = tokio::fs::File::open(&path).await?;
                    let total = file.metadata().await?.len();
                    Ok::<_, std::io::Error>((file, total))
                };
                match opened.await {
                    Ok((file, total)) => (Source::File(file), total),
                    Err(e) => {
                        warn!("Cannot send {}: {}", path.display(), e);
                        Self::emit_update(event_tx, peer, payload_id, 0, 0, TransferStatus::Failure);
                        return;
                    }
                }
            }
        };

        debug!("Sending payload {} ({} bytes) to {}", payload_id, total, peer);
        self.outgoing.insert(
            payload_id,
            Outgoing {
                peer,
                source,
                total,
                sent: 0,
            },
        );
        self.send_next_chunk(swarm, payload_id, event_tx).await;
    }

    async fn send_next_chunk(
        &mut self,
        swarm: &mut Swarm<TandemBehaviour>,
        payload_id: PayloadId,
        event_tx: &mpsc::UnboundedSender<TransportEvent>,
    ) {
        let chunk_size = self.config.chunk_size;
        let Some(out) = self.outgoing.get_mut(&payload_id) else {
            return;
        };

        let (peer, sent, total) = (out.peer, out.sent, out.total);

        let chunk = match &mut out.source {
            Source::Bytes(data) => Ok(Chunk {
                payload_id,
                kind: ChunkKind::Bytes,
                offset: 0,
                total,
                data: data.clone(),
            }),
            Source::File(file) => {
                let mut data = vec![0u8; next_chunk_len(total, sent, chunk_size)];
                file.read_exact(&mut data).await.map(|_| Chunk {
                    payload_id,
                    kind: ChunkKind::File,
                    offset: sent,
                    total,
                    data,
                })
            }
        };

        match chunk {
            Ok(chunk) => {
                let request_id = swarm
                    .behaviour_mut()
                    .payload
                    .send_request(&peer, WireRequest::Chunk(chunk));
                self.requests.insert(request_id, PendingRequest::Chunk(payload_id));
            }
            Err(e) => {
                warn!("Reading payload {} failed: {}", payload_id, e);
                if let Some(out) = self.outgoing.remove(&payload_id) {
                    Self::emit_update(event_tx, peer, payload_id, out.sent, out.total, TransferStatus::Failure);
                }
                self.notify(swarm, peer, WireRequest::Cancel { payload_id });
            }
        }
    }

    async fn on_chunk_response(
        &mut self,
        swarm: &mut Swarm<TandemBehaviour>,
        payload_id: PayloadId,
        response: WireResponse,
        event_tx: &mpsc::UnboundedSender<TransportEvent>,
    ) {
        let Some(out) = self.outgoing.get_mut(&payload_id) else {
            debug!("Response for abandoned payload {}", payload_id);
            return;
        };
        let peer = out.peer;

        match response {
            WireResponse::Ack { received } => {
                out.sent = received.min(out.total);
                if out.sent >= out.total {
                    let total = out.total;
                    self.outgoing.remove(&payload_id);
                    debug!("Payload {} delivered to {}", payload_id, peer);
                    Self::emit_update(event_tx, peer, payload_id, total, total, TransferStatus::Success);
                } else {
                    Self::emit_update(event_tx, peer, payload_id, out.sent, out.total, TransferStatus::InProgress);
                    self.send_next_chunk(swarm, payload_id, event_tx).await;
                }
            }
            other => {
                warn!("Payload {} refused by {}: {:?}", payload_id, peer, other);
                let (sent, total) = (out.sent, out.total);
                self.outgoing.remove(&payload_id);
                Self::emit_update(event_tx, peer, payload_id, sent, total, TransferStatus::Failure);
            }
        }
    }

    async fn cancel(
        &mut self,
        swarm: &mut Swarm<TandemBehaviour>,
        payload_id: PayloadId,
        event_tx: &mpsc::UnboundedSender<TransportEvent>,
    ) {
        if let Some(out) = self.outgoing.remove(&payload_id) {
            info!("Cancelled outbound payload {}", payload_id);
            self.notify(swarm, out.peer, WireRequest::Cancel { payload_id });
            Self::emit_update(event_tx, out.peer, payload_id, out.sent, out.total, TransferStatus::Canceled);
            return;
        }

        let key = self.incoming.keys().find(|(_, id)| *id == payload_id).copied();
        if let Some((peer, _)) = key {
            if let Some(mut inc) = self.incoming.remove(&(peer, payload_id)) {
                let _ = inc.file.flush().await;
                info!("Cancelled inbound payload {}", payload_id);
                self.notify(swarm, peer, WireRequest::Cancel { payload_id });
                Self::emit_update(event_tx, peer, payload_id, inc.received, inc.total, TransferStatus::Canceled);
            }
        }
    }

    // ---- Receiving ---------------------------------------------------------

    async fn on_request(
        &mut self,
        swarm: &mut Swarm<TandemBehaviour>,
        peer: PeerId,
        request: WireRequest,
        channel: ResponseChannel<WireResponse>,
        event_tx: &mpsc::UnboundedSender<TransportEvent>,
    ) {
        let response = match request {
            WireRequest::Probe => match &self.advertising {
                Some((name, service_id)) => WireResponse::Advert {
                    name: Some(name.clone()),
                    service_id: service_id.clone(),
                },
                None => WireResponse::Advert {
                    name: None,
                    service_id: String::new(),
                },
            },
            WireRequest::Connect { name, service_id } => {
                let advertised = matches!(&self.advertising, Some((_, ours)) if *ours == service_id);
                if !advertised {
                    debug!("Refusing connection from {}: not advertising {}", peer, service_id);
                    WireResponse::Rejected
                } else if self.sessions.contains(&peer) {
                    WireResponse::Accepted
                } else {
                    // Answered once the session accepts or rejects
                    self.awaiting_answer.insert(peer, channel);
                    let _ = event_tx.send(TransportEvent::ConnectionInitiated {
                        endpoint_id: peer.to_string(),
                        endpoint_name: Some(name),
                        is_incoming: true,
                    });
                    return;
                }
            }
            WireRequest::Chunk(chunk) => self.on_chunk(peer, chunk, event_tx).await,
            WireRequest::Cancel { payload_id } => {
                if let Some(inc) = self.incoming.remove(&(peer, payload_id)) {
                    Self::emit_update(event_tx, peer, payload_id, inc.received, inc.total, TransferStatus::Canceled);
                }
                if let Some(out) = self.outgoing.remove(&payload_id) {
                    Self::emit_update(event_tx, peer, payload_id, out.sent, out.total, TransferStatus::Canceled);
                }
                WireResponse::Done
            }
            WireRequest::Disconnect => {
                self.drop_transfers(peer);
                if self.sessions.remove(&peer) {
                    info!("{} left the session", peer);
                    let _ = event_tx.send(TransportEvent::Disconnected {
                        endpoint_id: peer.to_string(),
                    });
                }
                WireResponse::Done
            }
        };

        if swarm
            .behaviour_mut()
            .payload
            .send_response(channel, response)
            .is_err()
        {
            debug!("Response to {} dropped, connection gone", peer);
        }
    }

    async fn on_chunk(
        &mut self,
        peer: PeerId,
        chunk: Chunk,
        event_tx: &mpsc::UnboundedSender<TransportEvent>,
    ) -> WireResponse {
        if !self.sessions.contains(&peer) {
            return WireResponse::Refused {
                reason: "no session".to_string(),
            };
        }
        let payload_id = chunk.payload_id;

        if chunk.kind == ChunkKind::Bytes {
            let total = chunk.total;
            let _ = event_tx.send(TransportEvent::PayloadReceived {
                endpoint_id: peer.to_string(),
                payload_id,
                payload: IncomingPayload::Bytes(chunk.data),
            });
            Self::emit_update(event_tx, peer, payload_id, total, total, TransferStatus::Success);
            return WireResponse::Ack { received: total };
        }

        let key = (peer, payload_id);
        if chunk.offset == 0 && !self.incoming.contains_key(&key) {
            let path = self
                .config
                .incoming_dir
                .join(format!("{}-{}.part", peer, payload_id));
            let created = async {
                tokio::fs::create_dir_all(&self.config.incoming_dir).await?;
                tokio::fs::File::create(&path).await
            };
            match created.await {
                Ok(file) => {
                    self.incoming.insert(
                        key,
                        Incoming {
                            file,
                            received: 0,
                            total: chunk.total,
                        },
                    );
                    let _ = event_tx.send(TransportEvent::PayloadReceived {
                        endpoint_id: peer.to_string(),
                        payload_id,
                        payload: IncomingPayload::File(path),
                    });
                }
                Err(e) => {
                    warn!("Cannot store payload {} from {}: {}", payload_id, peer, e);
                    return WireResponse::Refused {
                        reason: e.to_string(),
                    };
                }
            }
        }

        let Some(inc) = self.incoming.get_mut(&key) else {
            return WireResponse::Refused {
                reason: "unknown payload".to_string(),
            };
        };
        if chunk.offset != inc.received {
            return WireResponse::Refused {
                reason: format!("expected offset {}", inc.received),
            };
        }

        let last = chunk.is_last();
        let written = async {
            inc.file.write_all(&chunk.data).await?;
            if last {
                inc.file.flush().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        if let Err(e) = written.await {
            warn!("Writing payload {} failed: {}", payload_id, e);
            if let Some(inc) = self.incoming.remove(&key) {
                Self::emit_update(event_tx, peer, payload_id, inc.received, inc.total, TransferStatus::Failure);
            }
            return WireResponse::Refused {
                reason: e.to_string(),
            };
        }

        inc.received += chunk.data.len() as u64;
        let (received, total) = (inc.received, inc.total);
        if last {
            self.incoming.remove(&key);
            Self::emit_update(event_tx, peer, payload_id, received, total, TransferStatus::Success);
        } else {
            Self::emit_update(event_tx, peer, payload_id, received, total, TransferStatus::InProgress);
        }
        WireResponse::Ack { received }
    }

    // ---- Swarm -------------------------------------------------------------

    async fn handle_swarm_event(
        &mut self,
        swarm: &mut Swarm<TandemBehaviour>,
        event: SwarmEvent<TandemBehaviourEvent>,
        event_tx: &mpsc::UnboundedSender<TransportEvent>,
    ) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {}/p2p/{}", address, self.local_peer_id);
            }

            SwarmEvent::Behaviour(TandemBehaviourEvent::Mdns(mdns::Event::Discovered(peers))) => {
                for (peer_id, addr) in peers {
                    if peer_id == self.local_peer_id || !self.nearby.insert(peer_id) {
                        continue;
                    }
                    debug!("mDNS discovered peer: {} at {}", peer_id, addr);
                    if self.discovery.is_some() {
                        self.probe(swarm, peer_id);
                    }
                }
            }

            SwarmEvent::Behaviour(TandemBehaviourEvent::Mdns(mdns::Event::Expired(peers))) => {
                for (peer_id, _) in peers {
                    if !self.nearby.remove(&peer_id) {
                        continue;
                    }
                    debug!("mDNS peer expired: {}", peer_id);
                    if self.found.remove(&peer_id).is_some() {
                        let _ = event_tx.send(TransportEvent::EndpointLost {
                            endpoint_id: peer_id.to_string(),
                        });
                    }
                }
            }

            SwarmEvent::Behaviour(TandemBehaviourEvent::Payload(event)) => {
                self.handle_payload_event(swarm, event, event_tx).await;
            }

            SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                debug!("Connection established with {} via {:?}", peer_id, endpoint);
            }

            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established > 0 {
                    return;
                }
                debug!("Connection closed with {}", peer_id);
                self.drop_transfers(peer_id);
                if self.sessions.remove(&peer_id) {
                    warn!("Lost session with {}", peer_id);
                    let _ = event_tx.send(TransportEvent::Disconnected {
                        endpoint_id: peer_id.to_string(),
                    });
                }
            }

            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                if let Some(peer) = peer_id {
                    warn!("Failed to connect to {}: {}", peer, error);
                } else {
                    warn!("Outgoing connection error: {}", error);
                }
            }

            SwarmEvent::ListenerError { listener_id, error } => {
                warn!("Listener {} error: {}", listener_id, error);
            }

            _ => {}
        }
    }

    async fn handle_payload_event(
        &mut self,
        swarm: &mut Swarm<TandemBehaviour>,
        event: request_response::Event<WireRequest, WireResponse>,
        event_tx: &mpsc::UnboundedSender<TransportEvent>,
    ) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    self.on_request(swarm, peer, request, channel, event_tx).await;
                }
                request_response::Message::Response {
                    request_id,
                    response,
                } => {
                    let Some(pending) = self.requests.remove(&request_id) else {
                        return;
                    };
                    self.on_response(swarm, pending, response, event_tx).await;
                }
            },

            request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            } => {
                let Some(pending) = self.requests.remove(&request_id) else {
                    return;
                };
                debug!("Request to {} failed: {}", peer, error);
                match pending {
                    PendingRequest::Connect(peer) => {
                        if self.connecting.remove(&peer) {
                            let status = match error {
                                request_response::OutboundFailure::Timeout => ConnectionStatus::TimedOut,
                                other => ConnectionStatus::Error(other.to_string()),
                            };
                            let _ = event_tx.send(TransportEvent::ConnectionResult {
                                endpoint_id: peer.to_string(),
                                status,
                            });
                        }
                    }
                    PendingRequest::Chunk(payload_id) => {
                        if let Some(out) = self.outgoing.remove(&payload_id) {
                            warn!("Chunk of payload {} failed: {}", payload_id, error);
                            Self::emit_update(event_tx, out.peer, payload_id, out.sent, out.total, TransferStatus::Failure);
                        }
                    }
                    PendingRequest::Probe(_) | PendingRequest::Notice => {}
                }
            }

            request_response::Event::InboundFailure { peer, error, .. } => {
                debug!("Inbound request from {} failed: {}", peer, error);
            }

            _ => {}
        }
    }

    async fn on_response(
        &mut self,
        swarm: &mut Swarm<TandemBehaviour>,
        pending: PendingRequest,
        response: WireResponse,
        event_tx: &mpsc::UnboundedSender<TransportEvent>,
    ) {
        match pending {
            PendingRequest::Probe(peer) => {
                let WireResponse::Advert {
                    name: Some(name),
                    service_id,
                } = response
                else {
                    return;
                };
                let wanted = self.discovery.as_deref() == Some(service_id.as_str());
                if wanted && !self.found.contains_key(&peer) {
                    info!("Found host {} ({})", name, peer);
                    self.found.insert(peer, name.clone());
                    let _ = event_tx.send(TransportEvent::EndpointFound {
                        endpoint_id: peer.to_string(),
                        endpoint_name: name,
                    });
                }
            }
            PendingRequest::Connect(peer) => {
                if !self.connecting.remove(&peer) {
                    return;
                }
                let status = match response {
                    WireResponse::Accepted => {
                        info!("Session established with {}", peer);
                        self.sessions.insert(peer);
                        ConnectionStatus::Ok
                    }
                    WireResponse::Rejected => ConnectionStatus::Rejected,
                    other => ConnectionStatus::Error(format!("unexpected answer {:?}", other)),
                };
                let _ = event_tx.send(TransportEvent::ConnectionResult {
                    endpoint_id: peer.to_string(),
                    status,
                });
            }
            PendingRequest::Chunk(payload_id) => {
                self.on_chunk_response(swarm, payload_id, response, event_tx).await;
            }
            PendingRequest::Notice => {}
        }
    }
}

impl Default for NetworkManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached_handle() -> (NetworkHandle, mpsc::UnboundedReceiver<NetworkCommand>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        (
            NetworkHandle {
                command_tx,
                local_peer_id: PeerId::random().to_string(),
            },
            command_rx,
        )
    }

    #[test]
    fn test_send_to_malformed_endpoint_fails_synchronously() {
        let (handle, _rx) = detached_handle();
        assert_eq!(
            handle.send_payload("not-a-peer", OutgoingPayload::Bytes(vec![1])),
            Err(TransportError::UnknownEndpoint("not-a-peer".to_string()))
        );
    }

    #[test]
    fn test_send_hands_out_payload_ids() {
        let (handle, mut rx) = detached_handle();
        let peer = PeerId::random();
        let id = handle
            .send_payload(&peer.to_string(), OutgoingPayload::Bytes(b"START_PLAYBACK:1".to_vec()))
            .unwrap();

        match rx.try_recv().unwrap() {
            NetworkCommand::SendPayload {
                peer: to,
                payload_id,
                ..
            } => {
                assert_eq!(to, peer);
                assert_eq!(payload_id, id);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_closed_network_reports_closed() {
        let (handle, rx) = detached_handle();
        drop(rx);
        assert_eq!(handle.check_permissions(), Err(TransportError::Closed));
        assert_eq!(
            handle.start_discovery("svc"),
            Err(TransportError::Closed)
        );
    }

    #[test]
    fn test_default_config() {
        let config = NetworkConfig::default();
        assert_eq!(config.chunk_size, 64 * 1024);
        assert!(config.enable_quic);
    }
}
