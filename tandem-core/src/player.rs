//! Audio player boundary
//!
//! Decoding and rendering live outside this crate. The playback coordinator
//! drives whatever implements [`Player`].

use std::path::Path;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlayerError {
    #[error("Failed to load media: {0}")]
    Load(String),

    #[error("Player error: {0}")]
    Playback(String),
}

/// Media player controls used by the playback coordinator
pub trait Player: Send + Sync {
    fn load(&self, file: &Path) -> Result<(), PlayerError>;

    /// Begin buffering; must not block until ready
    fn prepare(&self) -> Result<(), PlayerError>;

    fn seek_to(&self, position_ms: u64) -> Result<(), PlayerError>;

    /// Whether the player starts by itself once prepared
    fn set_auto_start(&self, auto_start: bool) -> Result<(), PlayerError>;

    fn play(&self) -> Result<(), PlayerError>;

    fn pause(&self) -> Result<(), PlayerError>;
}

#[cfg(test)]
pub(crate) use recording::{PlayerCall, RecordingPlayer};
