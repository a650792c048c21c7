//! Transfer Tracker
//!
//! Reconciles transport progress callbacks into exactly one terminal outcome
//! per (payload, peer). Completed inbound files are moved into the store;
//! completed command payloads are decoded and handed on.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::session::PeerEndpoint;
use crate::sync::{Command, DecodeError};
use crate::transport::{
    EndpointId, IncomingPayload, PayloadId, TransferStatus, TransferUpdate, TransportError,
};

use super::storage::{ReceivedFile, ReceivedFileStore};

/// How many finished keys to remember for dropping late callbacks
const FINISHED_MEMORY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    File,
    Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    InProgress,
    Success,
    Failure,
}

/// Per-peer transfer failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("Peer {0} is not connected")]
    PeerNotConnected(EndpointId),

    #[error("Transport refused payload: {0}")]
    Transport(#[from] TransportError),

    #[error("Payload {0} is already being tracked")]
    Duplicate(PayloadId),

    #[error("Transfer interrupted")]
    Interrupted,

    #[error("Transfer canceled")]
    Canceled,

    #[error("No progress for {0:?}")]
    Stalled(Duration),

    #[error("Peer disconnected mid-transfer")]
    PeerDisconnected,

    #[error("Failed to store received file: {0}")]
    Storage(String),
}

/// One in-flight payload
#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub payload_id: PayloadId,
    pub peer: PeerEndpoint,
    pub kind: PayloadKind,
    pub direction: Direction,
    pub bytes_expected: Option<u64>,
    pub bytes_transferred: u64,
    pub status: RecordStatus,
    last_progress: Instant,
    content: Option<IncomingPayload>,
}

/// Outcomes reported by the tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Started {
        peer: PeerEndpoint,
        payload_id: PayloadId,
        kind: PayloadKind,
        direction: Direction,
        bytes_expected: Option<u64>,
    },
    Progress {
        peer: PeerEndpoint,
        payload_id: PayloadId,
        kind: PayloadKind,
        direction: Direction,
        bytes_transferred: u64,
        bytes_expected: Option<u64>,
    },
    /// Outbound payload delivered
    Sent {
        peer: PeerEndpoint,
        payload_id: PayloadId,
        kind: PayloadKind,
    },
    /// Inbound file stored at a stable location
    FileReceived {
        peer: PeerEndpoint,
        payload_id: PayloadId,
        file: ReceivedFile,
    },
    CommandReceived {
        peer: PeerEndpoint,
        payload_id: PayloadId,
        command: Command,
    },
    /// Command payload arrived but could not be decoded
    CommandRejected {
        peer: PeerEndpoint,
        payload_id: PayloadId,
        error: DecodeError,
    },
    Failed {
        peer: PeerEndpoint,
        payload_id: PayloadId,
        kind: PayloadKind,
        direction: Direction,
        error: TransferError,
    },
}

impl TransferEvent {
    pub fn peer(&self) -> &PeerEndpoint {
        match self {
            TransferEvent::Started { peer, .. }
            | TransferEvent::Progress { peer, .. }
            | TransferEvent::Sent { peer, .. }
            | TransferEvent::FileReceived { peer, .. }
            | TransferEvent::CommandReceived { peer, .. }
            | TransferEvent::CommandRejected { peer, .. }
            | TransferEvent::Failed { peer, .. } => peer,
        }
    }

    pub fn payload_id(&self) -> PayloadId {
        match self {
            TransferEvent::Started { payload_id, .. }
            | TransferEvent::Progress { payload_id, .. }
            | TransferEvent::Sent { payload_id, .. }
            | TransferEvent::FileReceived { payload_id, .. }
            | TransferEvent::CommandReceived { payload_id, .. }
            | TransferEvent::CommandRejected { payload_id, .. }
            | TransferEvent::Failed { payload_id, .. } => *payload_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            TransferEvent::Started { .. } | TransferEvent::Progress { .. }
        )
    }
}

pub struct TransferTracker {
    active: HashMap<(PayloadId, EndpointId), TransferRecord>,
    finished: VecDeque<(PayloadId, EndpointId)>,
    store: ReceivedFileStore,
}

impl TransferTracker {
    pub fn new(store: ReceivedFileStore) -> Self {
        Self {
            active: HashMap::new(),
            finished: VecDeque::new(),
            store,
        }
    }

    pub fn get(&self, payload_id: PayloadId, endpoint_id: &str) -> Option<&TransferRecord> {
        self.active.get(&(payload_id, endpoint_id.to_string()))
    }

    pub fn active(&self) -> impl Iterator<Item = &TransferRecord> {
        self.active.values()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Track a payload we just handed to the transport
    pub fn begin_outbound(
        &mut self,
        peer: PeerEndpoint,
        payload_id: PayloadId,
        kind: PayloadKind,
        bytes_expected: Option<u64>,
        now: Instant,
    ) -> Result<TransferEvent, TransferError> {
        self.insert(TransferRecord {
            payload_id,
            peer,
            kind,
            direction: Direction::Outbound,
            bytes_expected,
            bytes_transferred: 0,
            status: RecordStatus::InProgress,
            last_progress: now,
            content: None,
        })
    }

    /// Track a payload the transport started delivering
    pub fn on_payload_received(
        &mut self,
        peer: PeerEndpoint,
        payload_id: PayloadId,
        payload: IncomingPayload,
        now: Instant,
    ) -> Result<TransferEvent, TransferError> {
        let (kind, bytes_expected) = match &payload {
            IncomingPayload::Bytes(bytes) => (PayloadKind::Command, Some(bytes.len() as u64)),
            IncomingPayload::File(_) => (PayloadKind::File, None),
        };
        self.insert(TransferRecord {
            payload_id,
            peer,
            kind,
            direction: Direction::Inbound,
            bytes_expected,
            bytes_transferred: 0,
            status: RecordStatus::InProgress,
            last_progress: now,
            content: Some(payload),
        })
    }

    fn insert(&mut self, record: TransferRecord) -> Result<TransferEvent, TransferError> {
        let key = (record.payload_id, record.peer.id.clone());
        if self.active.contains_key(&key) || self.finished.contains(&key) {
            warn!(
                "Payload {} from/to {} is already tracked",
                record.payload_id, record.peer.id
            );
            return Err(TransferError::Duplicate(record.payload_id));
        }

        debug!(
            "Tracking {:?} {:?} payload {} with {}",
            record.direction, record.kind, record.payload_id, record.peer.id
        );
        let event = TransferEvent::Started {
            peer: record.peer.clone(),
            payload_id: record.payload_id,
            kind: record.kind,
            direction: record.direction,
            bytes_expected: record.bytes_expected,
        };
        self.active.insert(key, record);
        Ok(event)
    }

    /// Apply a progress callback. Returns `None` for callbacks that carry no
    /// news (repeats, regressions, late updates for finished payloads).
    pub async fn on_transfer_update(
        &mut self,
        endpoint_id: &str,
        update: TransferUpdate,
        now: Instant,
    ) -> Option<TransferEvent> {
        let key = (update.payload_id, endpoint_id.to_string());
        let Some(record) = self.active.get_mut(&key) else {
            if self.finished.contains(&key) {
                debug!("Dropping late update for finished payload {}", update.payload_id);
            } else {
                debug!("Update for unknown payload {} from {}", update.payload_id, endpoint_id);
            }
            return None;
        };

        if let Some(total) = update.total_bytes {
            record.bytes_expected = Some(total);
        }
        let bytes = match record.bytes_expected {
            Some(expected) => update.bytes_transferred.min(expected),
            None => update.bytes_transferred,
        };

        if update.status == TransferStatus::InProgress {
            if bytes <= record.bytes_transferred {
                return None;
            }
            record.bytes_transferred = bytes;
            record.last_progress = now;
            return Some(TransferEvent::Progress {
                peer: record.peer.clone(),
                payload_id: record.payload_id,
                kind: record.kind,
                direction: record.direction,
                bytes_transferred: bytes,
                bytes_expected: record.bytes_expected,
            });
        }

        let mut record = self.finish(&key)?;
        record.bytes_transferred = record.bytes_transferred.max(bytes);

        let event = match update.status {
            TransferStatus::Success => {
                record.status = RecordStatus::Success;
                self.complete(record).await
            }
            TransferStatus::Canceled => {
                record.status = RecordStatus::Failure;
                self.fail(record, TransferError::Canceled).await
            }
            _ => {
                record.status = RecordStatus::Failure;
                self.fail(record, TransferError::Interrupted).await
            }
        };
        Some(event)
    }

    /// Fail everything in flight with a peer
    pub async fn fail_peer(&mut self, endpoint_id: &str) -> Vec<TransferEvent> {
        let keys: Vec<_> = self
            .active
            .keys()
            .filter(|(_, peer)| peer == endpoint_id)
            .cloned()
            .collect();
        self.fail_keys(keys, TransferError::PeerDisconnected).await
    }

    /// Fail transfers that have not moved for `timeout`
    pub async fn expire_stalled(&mut self, now: Instant, timeout: Duration) -> Vec<TransferEvent> {
        let keys: Vec<_> = self
            .active
            .iter()
            .filter(|(_, record)| now.saturating_duration_since(record.last_progress) >= timeout)
            .map(|(key, _)| key.clone())
            .collect();
        self.fail_keys(keys, TransferError::Stalled(timeout)).await
    }

    async fn fail_keys(
        &mut self,
        keys: Vec<(PayloadId, EndpointId)>,
        error: TransferError,
    ) -> Vec<TransferEvent> {
        let mut events = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(mut record) = self.finish(&key) {
                record.status = RecordStatus::Failure;
                events.push(self.fail(record, error.clone()).await);
            }
        }
        events
    }

    fn finish(&mut self, key: &(PayloadId, EndpointId)) -> Option<TransferRecord> {
        let record = self.active.remove(key)?;
        if self.finished.len() >= FINISHED_MEMORY {
            self.finished.pop_front();
        }
        self.finished.push_back(key.clone());
        Some(record)
    }

    async fn complete(&mut self, record: TransferRecord) -> TransferEvent {
        let TransferRecord {
            payload_id,
            peer,
            kind,
            direction,
            content,
            ..
        } = record;

        if direction == Direction::Outbound {
            info!("{:?} payload {} delivered to {}", kind, payload_id, peer.label());
            return TransferEvent::Sent {
                peer,
                payload_id,
                kind,
            };
        }

        match content {
            Some(IncomingPayload::File(transient)) => {
                match self.store.persist(&peer.id, payload_id, &transient).await {
                    Ok(file) => {
                        info!("File {} received from {}", payload_id, peer.label());
                        TransferEvent::FileReceived {
                            peer,
                            payload_id,
                            file,
                        }
                    }
                    Err(e) => {
                        warn!("Failed to store file {}: {}", payload_id, e);
                        self.store.discard(&transient).await;
                        TransferEvent::Failed {
                            peer,
                            payload_id,
                            kind,
                            direction,
                            error: TransferError::Storage(e.to_string()),
                        }
                    }
                }
            }
            Some(IncomingPayload::Bytes(bytes)) => match Command::decode(&bytes) {
                Ok(command) => {
                    debug!("Command from {}: {}", peer.label(), command);
                    TransferEvent::CommandReceived {
                        peer,
                        payload_id,
                        command,
                    }
                }
                Err(error) => {
                    warn!("Malformed command from {}: {}", peer.label(), error);
                    TransferEvent::CommandRejected {
                        peer,
                        payload_id,
                        error,
                    }
                }
            },
            None => TransferEvent::Failed {
                peer,
                payload_id,
                kind,
                direction,
                error: TransferError::Interrupted,
            },
        }
    }

    async fn fail(&mut self, record: TransferRecord, error: TransferError) -> TransferEvent {
        warn!(
            "{:?} {:?} payload {} with {} failed: {}",
            record.direction,
            record.kind,
            record.payload_id,
            record.peer.label(),
            error
        );
        if let Some(IncomingPayload::File(transient)) = &record.content {
            self.store.discard(transient).await;
        }
        TransferEvent::Failed {
            peer: record.peer,
            payload_id: record.payload_id,
            kind: record.kind,
            direction: record.direction,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;
    use tempdir::TempDir;

    fn peer(id: &str) -> PeerEndpoint {
        PeerEndpoint::new(id, None, Role::Guest)
    }

    fn update(payload_id: PayloadId, bytes: u64, total: u64, status: TransferStatus) -> TransferUpdate {
        TransferUpdate {
            payload_id,
            bytes_transferred: bytes,
            total_bytes: Some(total),
            status,
        }
    }

    fn tracker(tmp: &TempDir) -> TransferTracker {
        TransferTracker::new(ReceivedFileStore::new(tmp.path().join("store")))
    }

    #[tokio::test]
    async fn test_fan_out_is_independent() {
        let tmp = TempDir::new("tandem-tracker").unwrap();
        let mut tracker = tracker(&tmp);
        let now = Instant::now();

        tracker.begin_outbound(peer("A"), 1, PayloadKind::File, Some(100), now).unwrap();
        tracker.begin_outbound(peer("B"), 2, PayloadKind::File, Some(100), now).unwrap();

        let b_failed = tracker
            .on_transfer_update("B", update(2, 40, 100, TransferStatus::Failure), now)
            .await;
        assert!(matches!(
            b_failed,
            Some(TransferEvent::Failed { error: TransferError::Interrupted, .. })
        ));

        // A keeps going after B failed
        let a_sent = tracker
            .on_transfer_update("A", update(1, 100, 100, TransferStatus::Success), now)
            .await;
        assert!(matches!(a_sent, Some(TransferEvent::Sent { .. })));
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_exactly_one_terminal_and_monotonic_progress() {
        let tmp = TempDir::new("tandem-tracker").unwrap();
        let mut tracker = tracker(&tmp);
        let now = Instant::now();
        tracker.begin_outbound(peer("A"), 9, PayloadKind::File, None, now).unwrap();

        let script = [
            update(9, 10, 100, TransferStatus::InProgress),
            update(9, 10, 100, TransferStatus::InProgress),
            update(9, 5, 100, TransferStatus::InProgress),
            update(9, 60, 100, TransferStatus::InProgress),
            update(9, 100, 100, TransferStatus::Success),
            update(9, 100, 100, TransferStatus::Success),
            update(9, 100, 100, TransferStatus::Failure),
        ];

        let mut events = Vec::new();
        for u in script {
            if let Some(event) = tracker.on_transfer_update("A", u, now).await {
                events.push(event);
            }
        }

        let progress: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                TransferEvent::Progress { bytes_transferred, .. } => Some(*bytes_transferred),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![10, 60]);
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_progress_never_exceeds_expected() {
        let tmp = TempDir::new("tandem-tracker").unwrap();
        let mut tracker = tracker(&tmp);
        let now = Instant::now();
        tracker.begin_outbound(peer("A"), 1, PayloadKind::File, Some(50), now).unwrap();

        let event = tracker
            .on_transfer_update(
                "A",
                TransferUpdate {
                    payload_id: 1,
                    bytes_transferred: 80,
                    total_bytes: None,
                    status: TransferStatus::InProgress,
                },
                now,
            )
            .await;
        assert!(matches!(event, Some(TransferEvent::Progress { bytes_transferred: 50, .. })));
    }

    #[tokio::test]
    async fn test_inbound_file_is_moved_to_store() {
        let tmp = TempDir::new("tandem-tracker").unwrap();
        let mut tracker = tracker(&tmp);
        let now = Instant::now();

        let transient = tmp.path().join("nearby-payload");
        tokio::fs::write(&transient, vec![7u8; 64]).await.unwrap();

        tracker
            .on_payload_received(peer("host"), 5, IncomingPayload::File(transient.clone()), now)
            .unwrap();
        let event = tracker
            .on_transfer_update("host", update(5, 64, 64, TransferStatus::Success), now)
            .await;

        match event {
            Some(TransferEvent::FileReceived { file, .. }) => {
                assert_eq!(file.size, 64);
                assert!(file.path.starts_with(tmp.path().join("store")));
                assert!(!transient.exists());
            }
            other => panic!("expected FileReceived, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_inbound_file_discards_partial_data() {
        let tmp = TempDir::new("tandem-tracker").unwrap();
        let mut tracker = tracker(&tmp);
        let now = Instant::now();

        let transient = tmp.path().join("partial");
        tokio::fs::write(&transient, b"half").await.unwrap();
        tracker
            .on_payload_received(peer("host"), 6, IncomingPayload::File(transient.clone()), now)
            .unwrap();
        tracker
            .on_transfer_update("host", update(6, 4, 64, TransferStatus::Failure), now)
            .await;

        assert!(!transient.exists());
    }

    #[tokio::test]
    async fn test_command_payloads_are_decoded() {
        let tmp = TempDir::new("tandem-tracker").unwrap();
        let mut tracker = tracker(&tmp);
        let now = Instant::now();

        let bytes = b"START_PLAYBACK:1234".to_vec();
        tracker
            .on_payload_received(peer("host"), 1, IncomingPayload::Bytes(bytes), now)
            .unwrap();
        let event = tracker
            .on_transfer_update("host", update(1, 19, 19, TransferStatus::Success), now)
            .await;
        assert!(matches!(
            event,
            Some(TransferEvent::CommandReceived {
                command: Command::StartPlayback { start_at_ms: 1234 },
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_garbage_command_is_rejected_not_fatal() {
        let tmp = TempDir::new("tandem-tracker").unwrap();
        let mut tracker = tracker(&tmp);
        let now = Instant::now();

        tracker
            .on_payload_received(peer("host"), 1, IncomingPayload::Bytes(b"GARBAGE".to_vec()), now)
            .unwrap();
        let event = tracker
            .on_transfer_update("host", update(1, 7, 7, TransferStatus::Success), now)
            .await;
        assert!(matches!(event, Some(TransferEvent::CommandRejected { .. })));

        // The next payload from the same peer is handled normally
        tracker
            .on_payload_received(peer("host"), 2, IncomingPayload::Bytes(b"START_PLAYBACK:1".to_vec()), now)
            .unwrap();
        let event = tracker
            .on_transfer_update("host", update(2, 16, 16, TransferStatus::Success), now)
            .await;
        assert!(matches!(event, Some(TransferEvent::CommandReceived { .. })));
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_refused() {
        let tmp = TempDir::new("tandem-tracker").unwrap();
        let mut tracker = tracker(&tmp);
        let now = Instant::now();
        tracker.begin_outbound(peer("A"), 1, PayloadKind::File, None, now).unwrap();
        assert_eq!(
            tracker.begin_outbound(peer("A"), 1, PayloadKind::File, None, now),
            Err(TransferError::Duplicate(1))
        );
        // Same payload id towards another peer is a different transfer
        assert!(tracker.begin_outbound(peer("B"), 1, PayloadKind::File, None, now).is_ok());
    }

    #[tokio::test]
    async fn test_stalled_transfers_expire() {
        let tmp = TempDir::new("tandem-tracker").unwrap();
        let mut tracker = tracker(&tmp);
        let start = Instant::now();
        tracker.begin_outbound(peer("A"), 1, PayloadKind::File, None, start).unwrap();
        tracker.begin_outbound(peer("B"), 2, PayloadKind::File, None, start).unwrap();

        let later = start + Duration::from_secs(20);
        tracker
            .on_transfer_update("B", update(2, 10, 100, TransferStatus::InProgress), later)
            .await;

        let expired = tracker
            .expire_stalled(start + Duration::from_secs(30), Duration::from_secs(30))
            .await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].peer().id, "A");
        assert!(tracker.get(2, "B").is_some());
    }

    #[tokio::test]
    async fn test_peer_loss_fails_its_transfers() {
        let tmp = TempDir::new("tandem-tracker").unwrap();
        let mut tracker = tracker(&tmp);
        let now = Instant::now();
        tracker.begin_outbound(peer("A"), 1, PayloadKind::File, None, now).unwrap();
        tracker.begin_outbound(peer("A"), 2, PayloadKind::Command, None, now).unwrap();
        tracker.begin_outbound(peer("B"), 3, PayloadKind::File, None, now).unwrap();

        let failed = tracker.fail_peer("A").await;
        assert_eq!(failed.len(), 2);
        assert!(failed.iter().all(|e| matches!(
            e,
            TransferEvent::Failed { error: TransferError::PeerDisconnected, .. }
        )));
        assert_eq!(tracker.len(), 1);
    }
}
