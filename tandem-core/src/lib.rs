//! Tandem - Core Library
//!
//! Distributes one audio file from a host device to nearby guests and starts
//! playback on every device at the same wall-clock instant.

pub mod clock;
pub mod config;
pub mod ffi;
pub mod network;
pub mod player;
pub mod session;
pub mod sync;
pub mod transfer;
pub mod transport;

// Re-exports for convenience
pub use config::SessionConfig;
pub use session::{SessionEvent, SessionHandle, SessionManager};
pub use sync::{Command, PlaybackCoordinator};

// Setup uniffi scaffolding
uniffi::setup_scaffolding!();
