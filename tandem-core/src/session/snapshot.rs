//! Read-only session projections published through a watch channel

use std::collections::BTreeMap;

use crate::sync::{PlaybackSnapshot, ScheduledPlayback};
use crate::transfer::ReceivedFile;
use crate::transport::EndpointId;

use super::registry::PeerEndpoint;

/// Host view of the file push to one guest
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileTransferStatus {
    NotSent,
    Sending {
        bytes_transferred: u64,
        bytes_expected: Option<u64>,
    },
    Sent,
    Error(String),
}

/// Guest view of the file coming from the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFileStatus {
    Waiting,
    Receiving {
        bytes_transferred: u64,
        bytes_expected: Option<u64>,
    },
    Received(ReceivedFile),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostConnection {
    None,
    Connecting(EndpointId),
    Connected(PeerEndpoint),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSnapshot {
    pub advertising: bool,
    /// Connected guests sorted by name
    pub guests: Vec<PeerEndpoint>,
    pub file_transfers: BTreeMap<EndpointId, FileTransferStatus>,
    pub last_schedule: Option<ScheduledPlayback>,
    pub playback: PlaybackSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestSnapshot {
    pub discovering: bool,
    pub discovered_hosts: Vec<PeerEndpoint>,
    pub host: HostConnection,
    pub file: InboundFileStatus,
    pub playback: PlaybackSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSnapshot {
    Host(HostSnapshot),
    Guest(GuestSnapshot),
}

impl SessionSnapshot {
    pub fn playback(&self) -> &PlaybackSnapshot {
        match self {
            SessionSnapshot::Host(host) => &host.playback,
            SessionSnapshot::Guest(guest) => &guest.playback,
        }
    }

    pub fn as_host(&self) -> Option<&HostSnapshot> {
        match self {
            SessionSnapshot::Host(host) => Some(host),
            SessionSnapshot::Guest(_) => None,
        }
    }

    pub fn as_guest(&self) -> Option<&GuestSnapshot> {
        match self {
            SessionSnapshot::Guest(guest) => Some(guest),
            SessionSnapshot::Host(_) => None,
        }
    }
}
