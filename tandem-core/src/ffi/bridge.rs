//! Adapters from foreign callbacks to the core traits

use std::sync::Arc;

use tracing::warn;

use super::types::{PlayerCallback, PlayerFailure, TransportCallback, TransportFailure};
use crate::player::{Player, PlayerError};
use crate::transport::{OutgoingPayload, PayloadId, Transport, TransportError};

impl From<TransportFailure> for TransportError {
    fn from(e: TransportFailure) -> Self {
        match e {
            TransportFailure::PermissionDenied => TransportError::PermissionDenied,
            TransportFailure::Unavailable { reason } => TransportError::Unavailable(reason),
            TransportFailure::UnknownEndpoint { endpoint_id } => {
                TransportError::UnknownEndpoint(endpoint_id)
            }
        }
    }
}

/// Transport backed by the host app's connection API
pub struct ForeignTransport {
    inner: Arc<dyn TransportCallback>,
}

impl ForeignTransport {
    pub fn new(inner: Arc<dyn TransportCallback>) -> Self {
        Self { inner }
    }
}

impl Transport for ForeignTransport {
    fn check_permissions(&self) -> Result<(), TransportError> {
        Ok(self.inner.check_permissions()?)
    }

    fn start_advertising(&self, local_name: &str, service_id: &str) -> Result<(), TransportError> {
        Ok(self
            .inner
            .start_advertising(local_name.to_string(), service_id.to_string())?)
    }

    fn stop_advertising(&self) {
        self.inner.stop_advertising();
    }

    fn start_discovery(&self, service_id: &str) -> Result<(), TransportError> {
        Ok(self.inner.start_discovery(service_id.to_string())?)
    }

    fn stop_discovery(&self) {
        self.inner.stop_discovery();
    }

    fn request_connection(&self, local_name: &str, endpoint_id: &str) -> Result<(), TransportError> {
        Ok(self
            .inner
            .request_connection(local_name.to_string(), endpoint_id.to_string())?)
    }

    fn accept_connection(&self, endpoint_id: &str) -> Result<(), TransportError> {
        Ok(self.inner.accept_connection(endpoint_id.to_string())?)
    }

    fn reject_connection(&self, endpoint_id: &str) -> Result<(), TransportError> {
        Ok(self.inner.reject_connection(endpoint_id.to_string())?)
    }

    fn disconnect(&self, endpoint_id: &str) {
        self.inner.disconnect(endpoint_id.to_string());
    }

    fn stop_all_endpoints(&self) {
        self.inner.stop_all_endpoints();
    }

    fn send_payload(
        &self,
        endpoint_id: &str,
        payload: OutgoingPayload,
    ) -> Result<PayloadId, TransportError> {
        let id = match payload {
            OutgoingPayload::Bytes(bytes) => self.inner.send_bytes(endpoint_id.to_string(), bytes)?,
            OutgoingPayload::File(path) => self
                .inner
                .send_file(endpoint_id.to_string(), path.display().to_string())?,
        };
        Ok(id)
    }

    fn cancel_payload(&self, payload_id: PayloadId) {
        self.inner.cancel_payload(payload_id);
    }
}

/// Player backed by the host app's media player
pub struct ForeignPlayer {
    inner: Arc<dyn PlayerCallback>,
}

impl ForeignPlayer {
    pub fn new(inner: Arc<dyn PlayerCallback>) -> Self {
        Self { inner }
    }
}

fn load_failed(e: PlayerFailure) -> PlayerError {
    let PlayerFailure::Failed { reason } = e;
    PlayerError::Load(reason)
}

fn playback_failed(e: PlayerFailure) -> PlayerError {
    let PlayerFailure::Failed { reason } = e;
    warn!("Player failed: {}", reason);
    PlayerError::Playback(reason)
}

impl Player for ForeignPlayer {
    fn load(&self, path: &std::path::Path) -> Result<(), PlayerError> {
        self.inner
            .load(path.display().to_string())
            .map_err(load_failed)
    }

    fn prepare(&self) -> Result<(), PlayerError> {
        self.inner.prepare().map_err(load_failed)
    }

    fn seek_to(&self, position_ms: u64) -> Result<(), PlayerError> {
        self.inner.seek_to(position_ms).map_err(playback_failed)
    }

    fn set_auto_start(&self, auto_start: bool) -> Result<(), PlayerError> {
        self.inner.set_auto_start(auto_start).map_err(playback_failed)
    }

    fn play(&self) -> Result<(), PlayerError> {
        self.inner.play().map_err(playback_failed)
    }

    fn pause(&self) -> Result<(), PlayerError> {
        self.inner.pause().map_err(playback_failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::path::PathBuf;

    #[derive(Default)]
    struct FakeNearby {
        sent: Mutex<Vec<(String, String)>>,
        refuse: bool,
    }

    impl TransportCallback for FakeNearby {
        fn check_permissions(&self) -> Result<(), TransportFailure> {
            if self.refuse {
                Err(TransportFailure::PermissionDenied)
            } else {
                Ok(())
            }
        }
        fn start_advertising(&self, _: String, _: String) -> Result<(), TransportFailure> {
            Ok(())
        }
        fn stop_advertising(&self) {}
        fn start_discovery(&self, _: String) -> Result<(), TransportFailure> {
            Ok(())
        }
        fn stop_discovery(&self) {}
        fn request_connection(&self, _: String, endpoint_id: String) -> Result<(), TransportFailure> {
            Err(TransportFailure::UnknownEndpoint { endpoint_id })
        }
        fn accept_connection(&self, _: String) -> Result<(), TransportFailure> {
            Ok(())
        }
        fn reject_connection(&self, _: String) -> Result<(), TransportFailure> {
            Ok(())
        }
        fn disconnect(&self, _: String) {}
        fn stop_all_endpoints(&self) {}
        fn send_bytes(&self, endpoint_id: String, bytes: Vec<u8>) -> Result<u64, TransportFailure> {
            let text = String::from_utf8_lossy(&bytes).to_string();
            self.sent.lock().push((endpoint_id, text));
            Ok(7)
        }
        fn send_file(&self, endpoint_id: String, path: String) -> Result<u64, TransportFailure> {
            self.sent.lock().push((endpoint_id, path));
            Ok(8)
        }
        fn cancel_payload(&self, _: u64) {}
    }

    #[test]
    fn test_payloads_reach_callback() {
        let fake = Arc::new(FakeNearby::default());
        let transport = ForeignTransport::new(fake.clone());

        let id = transport
            .send_payload("A", OutgoingPayload::Bytes(b"START_PLAYBACK:5".to_vec()))
            .unwrap();
        assert_eq!(id, 7);
        let id = transport
            .send_payload("B", OutgoingPayload::File(PathBuf::from("/music/a.mp3")))
            .unwrap();
        assert_eq!(id, 8);

        let sent = fake.sent.lock().clone();
        assert_eq!(sent[0], ("A".to_string(), "START_PLAYBACK:5".to_string()));
        assert_eq!(sent[1], ("B".to_string(), "/music/a.mp3".to_string()));
    }

    #[test]
    fn test_failures_map_to_transport_errors() {
        let transport = ForeignTransport::new(Arc::new(FakeNearby {
            refuse: true,
            ..Default::default()
        }));
        assert_eq!(
            transport.check_permissions(),
            Err(TransportError::PermissionDenied)
        );
        assert_eq!(
            transport.request_connection("me", "X"),
            Err(TransportError::UnknownEndpoint("X".to_string()))
        );
    }

    struct BrokenPlayer;

    impl PlayerCallback for BrokenPlayer {
        fn load(&self, _: String) -> Result<(), PlayerFailure> {
            Err(PlayerFailure::Failed {
                reason: "unsupported codec".to_string(),
            })
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
            Err(PlayerFailure::Failed {
                reason: "focus lost".to_string(),
            })
        }
        fn pause(&self) -> Result<(), PlayerFailure> {
            Ok(())
        }
    }

    #[test]
    fn test_player_failures() {
        let player = ForeignPlayer::new(Arc::new(BrokenPlayer));
        assert!(matches!(
            player.load(std::path::Path::new("/x.mp3")),
            Err(PlayerError::Load(reason)) if reason == "unsupported codec"
        ));
        assert!(matches!(player.play(), Err(PlayerError::Playback(_))));
        assert!(player.pause().is_ok());
    }
}
