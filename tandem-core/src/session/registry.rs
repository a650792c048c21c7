//! Session Registry
//!
//! Authoritative list of peers the session knows about: connections on the
//! host, discovered hosts and the chosen host on the guest. Only the
//! session actor mutates it.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::transport::EndpointId;

/// Which side of the session a device is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Host,
    Guest,
}

/// One remote participant. Replaced, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerEndpoint {
    pub id: EndpointId,
    pub display_name: Option<String>,
    pub role: Role,
}

impl PeerEndpoint {
    pub fn new(id: impl Into<EndpointId>, display_name: Option<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            display_name,
            role,
        }
    }

    /// Name for display, falling back to the endpoint id
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Initiated,
    Connected,
    Disconnected,
}

/// Whether to let a connecting peer in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    Reject,
}

/// Decides which inbound connection requests the host accepts
pub trait ConnectionPolicy: Send + Sync {
    fn admit(&self, endpoint: &PeerEndpoint, connected: usize) -> Admission;
}

/// Accept everybody
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl ConnectionPolicy for AcceptAll {
    fn admit(&self, _endpoint: &PeerEndpoint, _connected: usize) -> Admission {
        Admission::Accept
    }
}

/// Accept until a number of guests is connected
#[derive(Debug, Clone, Copy)]
pub struct MaxGuests(pub usize);

impl ConnectionPolicy for MaxGuests {
    fn admit(&self, _endpoint: &PeerEndpoint, connected: usize) -> Admission {
        if connected < self.0 {
            Admission::Accept
        } else {
            Admission::Reject
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    endpoint: PeerEndpoint,
    state: ConnectionState,
}

#[derive(Debug, Default)]
pub struct Registry {
    peers: HashMap<EndpointId, Entry>,
    discovered: HashMap<EndpointId, PeerEndpoint>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection attempt. Does not downgrade a live connection.
    pub fn initiated(&mut self, endpoint: PeerEndpoint) {
        match self.peers.get(&endpoint.id) {
            Some(entry) if entry.state == ConnectionState::Connected => {
                debug!("Ignoring initiation for already connected {}", endpoint.id);
            }
            _ => {
                self.peers.insert(
                    endpoint.id.clone(),
                    Entry {
                        endpoint,
                        state: ConnectionState::Initiated,
                    },
                );
            }
        }
    }

    /// Mark a peer connected. Returns the endpoint only on an actual
    /// transition, so duplicate events are harmless.
    pub fn connected(&mut self, endpoint_id: &str, role: Role) -> Option<PeerEndpoint> {
        match self.peers.get_mut(endpoint_id) {
            Some(entry) if entry.state == ConnectionState::Connected => None,
            Some(entry) => {
                entry.state = ConnectionState::Connected;
                info!("Peer connected: {}", entry.endpoint.label());
                Some(entry.endpoint.clone())
            }
            None => {
                let endpoint = self
                    .discovered
                    .get(endpoint_id)
                    .cloned()
                    .unwrap_or_else(|| PeerEndpoint::new(endpoint_id, None, role));
                info!("Peer connected: {}", endpoint.label());
                self.peers.insert(
                    endpoint_id.to_string(),
                    Entry {
                        endpoint: endpoint.clone(),
                        state: ConnectionState::Connected,
                    },
                );
                Some(endpoint)
            }
        }
    }

    /// Forget a peer. Returns it with the state it was in.
    pub fn disconnected(&mut self, endpoint_id: &str) -> Option<(PeerEndpoint, ConnectionState)> {
        self.peers.remove(endpoint_id).map(|entry| {
            info!("Peer removed: {} (was {:?})", entry.endpoint.label(), entry.state);
            (entry.endpoint, entry.state)
        })
    }

    pub fn state(&self, endpoint_id: &str) -> ConnectionState {
        self.peers
            .get(endpoint_id)
            .map(|entry| entry.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn is_connected(&self, endpoint_id: &str) -> bool {
        self.state(endpoint_id) == ConnectionState::Connected
    }

    pub fn endpoint(&self, endpoint_id: &str) -> Option<&PeerEndpoint> {
        self.peers.get(endpoint_id).map(|entry| &entry.endpoint)
    }

    /// Connected peers sorted by label
    pub fn connected_peers(&self) -> Vec<PeerEndpoint> {
        let mut list: Vec<PeerEndpoint> = self
            .peers
            .values()
            .filter(|entry| entry.state == ConnectionState::Connected)
            .map(|entry| entry.endpoint.clone())
            .collect();
        list.sort_by(|a, b| a.label().to_lowercase().cmp(&b.label().to_lowercase()));
        list
    }

    pub fn connected_count(&self) -> usize {
        self.peers
            .values()
            .filter(|entry| entry.state == ConnectionState::Connected)
            .count()
    }

    /// Drop every peer, returning those that were connected
    pub fn clear(&mut self) -> Vec<PeerEndpoint> {
        let connected = self.connected_peers();
        self.peers.clear();
        connected
    }

    /// Record a discovered host. True if it was not already known.
    pub fn discovered(&mut self, endpoint: PeerEndpoint) -> bool {
        if self.discovered.contains_key(&endpoint.id) {
            return false;
        }
        self.discovered.insert(endpoint.id.clone(), endpoint);
        true
    }

    pub fn lost(&mut self, endpoint_id: &str) -> Option<PeerEndpoint> {
        self.discovered.remove(endpoint_id)
    }

    pub fn discovered_hosts(&self) -> Vec<PeerEndpoint> {
        let mut list: Vec<PeerEndpoint> = self.discovered.values().cloned().collect();
        list.sort_by(|a, b| a.label().to_lowercase().cmp(&b.label().to_lowercase()));
        list
    }

    pub fn discovered_host(&self, endpoint_id: &str) -> Option<&PeerEndpoint> {
        self.discovered.get(endpoint_id)
    }

    pub fn clear_discovered(&mut self) {
        self.discovered.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guest(id: &str) -> PeerEndpoint {
        PeerEndpoint::new(id, None, Role::Guest)
    }

    #[test]
    fn test_duplicate_connected_is_idempotent() {
        let mut registry = Registry::new();
        registry.initiated(guest("A"));
        assert!(registry.connected("A", Role::Guest).is_some());
        assert!(registry.connected("A", Role::Guest).is_none());
        assert_eq!(registry.connected_peers().len(), 1);
    }

    #[test]
    fn test_membership_is_net_effect_of_events() {
        // (endpoint, connected?) sequences applied in order
        let events = [
            ("A", true),
            ("B", true),
            ("A", false),
            ("C", true),
            ("B", true),
            ("A", true),
            ("C", false),
            ("B", false),
            ("C", false),
            ("A", true),
        ];

        let mut registry = Registry::new();
        let mut expected: HashMap<&str, bool> = HashMap::new();
        for (id, up) in events {
            if up {
                registry.connected(id, Role::Guest);
            } else {
                registry.disconnected(id);
            }
            expected.insert(id, up);

            for (peer, connected) in &expected {
                assert_eq!(registry.is_connected(peer), *connected, "peer {}", peer);
            }
        }
        let ids: Vec<String> = registry.connected_peers().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["A".to_string()]);
    }

    #[test]
    fn test_absent_peer_is_disconnected() {
        let registry = Registry::new();
        assert_eq!(registry.state("nobody"), ConnectionState::Disconnected);
    }

    #[test]
    fn test_initiation_does_not_downgrade_connection() {
        let mut registry = Registry::new();
        registry.connected("A", Role::Guest);
        registry.initiated(guest("A"));
        assert!(registry.is_connected("A"));
    }

    #[test]
    fn test_connected_uses_discovered_name() {
        let mut registry = Registry::new();
        registry.discovered(PeerEndpoint::new("H", Some("Living room".into()), Role::Host));
        let host = registry.connected("H", Role::Host).unwrap();
        assert_eq!(host.label(), "Living room");
    }

    #[test]
    fn test_discovery_reports_once_until_lost() {
        let mut registry = Registry::new();
        let host = PeerEndpoint::new("H", Some("Kitchen".into()), Role::Host);
        assert!(registry.discovered(host.clone()));
        assert!(!registry.discovered(host.clone()));
        assert!(registry.lost("H").is_some());
        assert!(registry.discovered(host));
    }

    #[test]
    fn test_max_guests_policy() {
        let policy = MaxGuests(2);
        assert_eq!(policy.admit(&guest("A"), 1), Admission::Accept);
        assert_eq!(policy.admit(&guest("A"), 2), Admission::Reject);
    }

    #[test]
    fn test_clear_returns_connected() {
        let mut registry = Registry::new();
        registry.connected("A", Role::Guest);
        registry.initiated(guest("B"));
        let dropped = registry.clear();
        assert_eq!(dropped.len(), 1);
        assert_eq!(registry.state("B"), ConnectionState::Disconnected);
    }
}
