//! Peer session
//!
//! One session per device, either hosting (advertise, accept guests, push
//! the file and the start command) or joining as a guest (discover, connect,
//! receive, play).

mod actor;
mod events;
mod handle;
mod registry;
mod snapshot;

pub use actor::SessionManager;
pub use events::{
    ConnectionError, ConnectionEvent, DiscoveryEvent, SendOutcome, SendReport, SessionError,
    SessionEvent,
};
pub use handle::SessionHandle;
pub use registry::{
    AcceptAll, Admission, ConnectionPolicy, ConnectionState, MaxGuests, PeerEndpoint, Registry,
    Role,
};
pub use snapshot::{
    FileTransferStatus, GuestSnapshot, HostConnection, HostSnapshot, InboundFileStatus,
    SessionSnapshot,
};
