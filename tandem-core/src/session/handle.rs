//! Cloneable handle to a running session

use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot, watch};

use crate::sync::{Command, ScheduledPlayback};
use crate::transport::EndpointId;

use super::events::{ConnectionEvent, DiscoveryEvent, SendReport, SessionError};
use super::snapshot::SessionSnapshot;

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// Requests handled by the session actor
#[derive(Debug)]
pub(crate) enum SessionCommand {
    StartAdvertising {
        local_name: String,
        reply: Reply<mpsc::UnboundedReceiver<ConnectionEvent>>,
    },
    StopAdvertising {
        reply: Reply<()>,
    },
    StartDiscovery {
        reply: Reply<mpsc::UnboundedReceiver<DiscoveryEvent>>,
    },
    StopDiscovery {
        reply: Reply<()>,
    },
    ConnectToHost {
        endpoint_id: EndpointId,
        reply: Reply<()>,
    },
    Disconnect {
        reply: Reply<()>,
    },
    /// `peers: None` means every connected guest
    SendFile {
        peers: Option<Vec<EndpointId>>,
        path: PathBuf,
        reply: Reply<SendReport>,
    },
    SendCommand {
        peers: Option<Vec<EndpointId>>,
        command: Command,
        reply: Reply<SendReport>,
    },
    StartPlayback {
        reply: Reply<(ScheduledPlayback, SendReport)>,
    },
    Pause {
        reply: Reply<()>,
    },
    Resume {
        reply: Reply<()>,
    },
    Seek {
        position_ms: u64,
        reply: Reply<()>,
    },
    Snapshot {
        reply: Reply<SessionSnapshot>,
    },
    Shutdown,
}

/// Handle to communicate with the running session
#[derive(Clone)]
pub struct SessionHandle {
    pub(crate) command_tx: mpsc::UnboundedSender<SessionCommand>,
    pub(crate) snapshot_rx: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(make(reply))
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Start accepting guests. The returned stream closes when advertising stops.
    pub async fn start_advertising(
        &self,
        local_name: impl Into<String>,
    ) -> Result<mpsc::UnboundedReceiver<ConnectionEvent>, SessionError> {
        let local_name = local_name.into();
        self.request(|reply| SessionCommand::StartAdvertising { local_name, reply })
            .await
    }

    pub async fn stop_advertising(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::StopAdvertising { reply }).await
    }

    /// Start looking for hosts. The returned stream closes when discovery stops.
    pub async fn start_discovery(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>, SessionError> {
        self.request(|reply| SessionCommand::StartDiscovery { reply }).await
    }

    pub async fn stop_discovery(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::StopDiscovery { reply }).await
    }

    /// Ask a discovered host for a connection. The outcome arrives as an event.
    pub async fn connect_to_host(&self, endpoint_id: impl Into<EndpointId>) -> Result<(), SessionError> {
        let endpoint_id = endpoint_id.into();
        self.request(|reply| SessionCommand::ConnectToHost { endpoint_id, reply })
            .await
    }

    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Disconnect { reply }).await
    }

    pub async fn send_file(
        &self,
        peers: Vec<EndpointId>,
        path: impl Into<PathBuf>,
    ) -> Result<SendReport, SessionError> {
        let path = path.into();
        self.request(|reply| SessionCommand::SendFile {
            peers: Some(peers),
            path,
            reply,
        })
        .await
    }

    /// Send a file to every connected guest
    pub async fn send_file_to_all(&self, path: impl Into<PathBuf>) -> Result<SendReport, SessionError> {
        let path = path.into();
        self.request(|reply| SessionCommand::SendFile {
            peers: None,
            path,
            reply,
        })
        .await
    }

    pub async fn send_command(
        &self,
        peers: Vec<EndpointId>,
        command: Command,
    ) -> Result<SendReport, SessionError> {
        self.request(|reply| SessionCommand::SendCommand {
            peers: Some(peers),
            command,
            reply,
        })
        .await
    }

    /// Broadcast a start instant `lookahead` from now to every connected guest
    pub async fn send_start_playback_command(
        &self,
    ) -> Result<(ScheduledPlayback, SendReport), SessionError> {
        self.request(|reply| SessionCommand::StartPlayback { reply }).await
    }

    pub async fn pause(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Pause { reply }).await
    }

    pub async fn resume(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Resume { reply }).await
    }

    pub async fn seek(&self, position_ms: u64) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Seek { position_ms, reply })
            .await
    }

    /// Snapshot taken by the actor after everything queued before it
    pub async fn current_snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(|reply| SessionCommand::Snapshot { reply }).await
    }

    /// Last published snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.command_tx.send(SessionCommand::Shutdown);
    }
}
