//! Recording transport for tests

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use super::{EndpointId, OutgoingPayload, PayloadId, Transport, TransportError};

/// A transport call as seen by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartAdvertising { local_name: String },
    StopAdvertising,
    StartDiscovery,
    StopDiscovery,
    RequestConnection { endpoint_id: EndpointId },
    AcceptConnection { endpoint_id: EndpointId },
    RejectConnection { endpoint_id: EndpointId },
    Disconnect { endpoint_id: EndpointId },
    StopAllEndpoints,
    SendPayload {
        endpoint_id: EndpointId,
        payload_id: PayloadId,
        payload: OutgoingPayload,
    },
    CancelPayload { payload_id: PayloadId },
}

#[derive(Default)]
pub struct MockTransport {
    calls: Mutex<Vec<Call>>,
    next_payload_id: AtomicU64,
    permissions_denied: AtomicBool,
    unreachable: Mutex<HashSet<EndpointId>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            next_payload_id: AtomicU64::new(100),
            ..Default::default()
        }
    }

    pub fn deny_permissions(&self) {
        self.permissions_denied.store(true, Ordering::SeqCst);
    }

    /// Make `send_payload` fail synchronously for an endpoint
    pub fn make_unreachable(&self, endpoint_id: &str) {
        self.unreachable.lock().insert(endpoint_id.to_string());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Payload ids handed out for sends to an endpoint, oldest first
    pub fn sent_to(&self, endpoint_id: &str) -> Vec<(PayloadId, OutgoingPayload)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                Call::SendPayload {
                    endpoint_id: id,
                    payload_id,
                    payload,
                } if id == endpoint_id => Some((*payload_id, payload.clone())),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

impl Transport for MockTransport {
    fn check_permissions(&self) -> Result<(), TransportError> {
        if self.permissions_denied.load(Ordering::SeqCst) {
            Err(TransportError::PermissionDenied)
        } else {
            Ok(())
        }
    }

    fn start_advertising(&self, local_name: &str, _service_id: &str) -> Result<(), TransportError> {
        self.record(Call::StartAdvertising {
            local_name: local_name.to_string(),
        });
        Ok(())
    }

    fn stop_advertising(&self) {
        self.record(Call::StopAdvertising);
    }

    fn start_discovery(&self, _service_id: &str) -> Result<(), TransportError> {
        self.record(Call::StartDiscovery);
        Ok(())
    }

    fn stop_discovery(&self) {
        self.record(Call::StopDiscovery);
    }

    fn request_connection(&self, _local_name: &str, endpoint_id: &str) -> Result<(), TransportError> {
        self.record(Call::RequestConnection {
            endpoint_id: endpoint_id.to_string(),
        });
        Ok(())
    }

    fn accept_connection(&self, endpoint_id: &str) -> Result<(), TransportError> {
        self.record(Call::AcceptConnection {
            endpoint_id: endpoint_id.to_string(),
        });
        Ok(())
    }

    fn reject_connection(&self, endpoint_id: &str) -> Result<(), TransportError> {
        self.record(Call::RejectConnection {
            endpoint_id: endpoint_id.to_string(),
        });
        Ok(())
    }

    fn disconnect(&self, endpoint_id: &str) {
        self.record(Call::Disconnect {
            endpoint_id: endpoint_id.to_string(),
        });
    }

    fn stop_all_endpoints(&self) {
        self.record(Call::StopAllEndpoints);
    }

    fn send_payload(
        &self,
        endpoint_id: &str,
        payload: OutgoingPayload,
    ) -> Result<PayloadId, TransportError> {
        if self.unreachable.lock().contains(endpoint_id) {
            return Err(TransportError::UnknownEndpoint(endpoint_id.to_string()));
        }
        let payload_id = self.next_payload_id.fetch_add(1, Ordering::SeqCst);
        self.record(Call::SendPayload {
            endpoint_id: endpoint_id.to_string(),
            payload_id,
            payload,
        });
        Ok(payload_id)
    }

    fn cancel_payload(&self, payload_id: PayloadId) {
        self.record(Call::CancelPayload { payload_id });
    }
}
