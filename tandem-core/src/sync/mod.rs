//! Sync Engine
//!
//! Command wire format and the playback coordinator that turns a received
//! file plus a start command into synchronized playback.

mod coordinator;
mod protocol;
mod state;

pub use coordinator::PlaybackCoordinator;
pub use protocol::*;
pub use state::{PlaybackSnapshot, PlaybackStatus, ScheduledPlayback};
