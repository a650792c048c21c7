//! Playback State

use std::path::PathBuf;

/// Host-side record of a broadcast start command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledPlayback {
    /// Agreed start instant (epoch millis, host clock)
    pub start_at_ms: i64,
    /// When the host issued the command (epoch millis, host clock)
    pub issued_at_ms: i64,
}

impl ScheduledPlayback {
    /// Lead time the guests were given
    pub fn lead_ms(&self) -> i64 {
        self.start_at_ms.saturating_sub(self.issued_at_ms)
    }
}

/// Coarse playback status exposed to the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    /// Nothing to play yet (a start command may already be latched)
    Idle,
    /// File received, waiting for a start command
    Ready,
    /// File and command present, waiting for the start instant
    Scheduled,
    Playing,
    Paused,
    Error,
}

/// Read-only view of the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackSnapshot {
    pub status: PlaybackStatus,
    /// Position at the time the snapshot was taken
    pub position_ms: u64,
    /// Latched start instant on the local clock
    pub start_at_ms: Option<i64>,
    /// Latched media file
    pub file: Option<PathBuf>,
    /// Last player failure, when in `Error`
    pub error: Option<String>,
}

impl Default for PlaybackSnapshot {
    fn default() -> Self {
        Self {
            status: PlaybackStatus::Idle,
            position_ms: 0,
            start_at_ms: None,
            file: None,
            error: None,
        }
    }
}

/// Internal coordinator phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    Ready,
    Scheduled { start_at_ms: i64 },
    /// Position is `now - anchor_ms`
    Playing { anchor_ms: i64 },
    Paused { position_ms: u64 },
    Error(String),
}

impl Phase {
    pub fn status(&self) -> PlaybackStatus {
        match self {
            Phase::Idle => PlaybackStatus::Idle,
            Phase::Ready => PlaybackStatus::Ready,
            Phase::Scheduled { .. } => PlaybackStatus::Scheduled,
            Phase::Playing { .. } => PlaybackStatus::Playing,
            Phase::Paused { .. } => PlaybackStatus::Paused,
            Phase::Error(_) => PlaybackStatus::Error,
        }
    }

    pub fn position_ms(&self, now_ms: i64) -> u64 {
        match self {
            Phase::Playing { anchor_ms } => now_ms.saturating_sub(*anchor_ms).max(0) as u64,
            Phase::Paused { position_ms } => *position_ms,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_playing_position_follows_clock() {
        let phase = Phase::Playing { anchor_ms: 10_000 };
        assert_eq!(phase.position_ms(10_000), 0);
        assert_eq!(phase.position_ms(13_500), 3_500);
        // Clock stepping backwards never yields a negative position
        assert_eq!(phase.position_ms(9_000), 0);
    }

    #[test]
    fn test_lead_time() {
        let scheduled = ScheduledPlayback {
            start_at_ms: 6_000,
            issued_at_ms: 1_000,
        };
        assert_eq!(scheduled.lead_ms(), 5_000);
    }
}
