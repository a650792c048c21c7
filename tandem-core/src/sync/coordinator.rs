//! Playback Coordinator
//!
//! Latches the received file and the start command independently and only
//! starts the player once both are present. Time is always passed in by the
//! caller so the session actor owns the timer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::player::{Player, PlayerError};

use super::state::{Phase, PlaybackSnapshot, PlaybackStatus};

pub struct PlaybackCoordinator {
    player: Arc<dyn Player>,
    /// Local clock minus host clock
    clock_offset_ms: i64,
    file: Option<PathBuf>,
    /// Start instant translated to the local clock
    start_at_ms: Option<i64>,
    phase: Phase,
}

impl PlaybackCoordinator {
    pub fn new(player: Arc<dyn Player>, clock_offset_ms: i64) -> Self {
        Self {
            player,
            clock_offset_ms,
            file: None,
            start_at_ms: None,
            phase: Phase::Idle,
        }
    }

    pub fn status(&self) -> PlaybackStatus {
        self.phase.status()
    }

    /// Local start instant the caller should wake up for, if any
    pub fn pending_start_ms(&self) -> Option<i64> {
        match self.phase {
            Phase::Scheduled { start_at_ms } => Some(start_at_ms),
            _ => None,
        }
    }

    pub fn snapshot(&self, now_ms: i64) -> PlaybackSnapshot {
        PlaybackSnapshot {
            status: self.phase.status(),
            position_ms: self.phase.position_ms(now_ms),
            start_at_ms: self.start_at_ms,
            file: self.file.clone(),
            error: match &self.phase {
                Phase::Error(reason) => Some(reason.clone()),
                _ => None,
            },
        }
    }

    /// Latch a newly received media file
    pub fn on_file_received(&mut self, file: PathBuf, now_ms: i64) -> Result<(), PlayerError> {
        // A file arriving after a complete file+command pair starts a new
        // round; the old command belonged to the old file.
        if self.file.is_some() && self.start_at_ms.is_some() {
            if matches!(self.phase, Phase::Playing { .. }) {
                if let Err(e) = self.player.pause() {
                    warn!("Failed to pause before replacing media: {}", e);
                }
            }
            debug!("New file replaces previous round, dropping latched start");
            self.start_at_ms = None;
        }

        info!("Playback file latched: {}", file.display());
        self.file = Some(file);

        if self.start_at_ms.is_some() {
            self.try_arm(now_ms)
        } else {
            self.phase = Phase::Ready;
            Ok(())
        }
    }

    /// Latch a start command carrying a host-clock timestamp
    pub fn on_start_command(&mut self, host_start_at_ms: i64, now_ms: i64) -> Result<(), PlayerError> {
        let start_at_ms = host_start_at_ms.saturating_add(self.clock_offset_ms);
        info!(
            "Start command latched: start_at={} (offset {}ms, {}ms from now)",
            start_at_ms,
            self.clock_offset_ms,
            start_at_ms.saturating_sub(now_ms)
        );
        self.start_at_ms = Some(start_at_ms);

        if self.file.is_some() {
            self.try_arm(now_ms)
        } else {
            debug!("Start command waiting for file");
            Ok(())
        }
    }

    /// Start playback if the scheduled instant has been reached
    pub fn on_tick(&mut self, now_ms: i64) -> Result<(), PlayerError> {
        let Phase::Scheduled { start_at_ms } = self.phase else {
            return Ok(());
        };
        if now_ms < start_at_ms {
            return Ok(());
        }
        let result = self.start(start_at_ms, now_ms);
        self.record_failure(result)
    }

    pub fn pause(&mut self, now_ms: i64) -> Result<(), PlayerError> {
        let Phase::Playing { .. } = self.phase else {
            debug!("Pause ignored in {:?}", self.phase.status());
            return Ok(());
        };
        let position_ms = self.phase.position_ms(now_ms);
        self.player.pause()?;
        self.phase = Phase::Paused { position_ms };
        info!("Paused at {}ms", position_ms);
        Ok(())
    }

    pub fn resume(&mut self, now_ms: i64) -> Result<(), PlayerError> {
        let Phase::Paused { position_ms } = self.phase else {
            debug!("Resume ignored in {:?}", self.phase.status());
            return Ok(());
        };
        self.player.play()?;
        self.phase = Phase::Playing {
            anchor_ms: anchor_for(position_ms, now_ms),
        };
        info!("Resumed at {}ms", position_ms);
        Ok(())
    }

    pub fn seek(&mut self, position_ms: u64, now_ms: i64) -> Result<(), PlayerError> {
        match self.phase {
            Phase::Playing { .. } => {
                self.player.seek_to(position_ms)?;
                self.phase = Phase::Playing {
                    anchor_ms: anchor_for(position_ms, now_ms),
                };
            }
            Phase::Paused { .. } => {
                self.player.seek_to(position_ms)?;
                self.phase = Phase::Paused { position_ms };
            }
            _ => debug!("Seek ignored in {:?}", self.phase.status()),
        }
        Ok(())
    }

    fn try_arm(&mut self, now_ms: i64) -> Result<(), PlayerError> {
        let (Some(file), Some(start_at_ms)) = (self.file.clone(), self.start_at_ms) else {
            return Ok(());
        };
        let result = self.arm(&file, start_at_ms, now_ms);
        self.record_failure(result)
    }

    /// Load and prepare now, start now or later
    fn arm(&mut self, file: &Path, start_at_ms: i64, now_ms: i64) -> Result<(), PlayerError> {
        self.player.load(file)?;
        self.player.set_auto_start(false)?;
        self.player.prepare()?;

        if now_ms >= start_at_ms {
            warn!(
                "Start instant passed {}ms ago, joining late",
                now_ms.saturating_sub(start_at_ms)
            );
            self.start(start_at_ms, now_ms)
        } else {
            self.phase = Phase::Scheduled { start_at_ms };
            info!("Playback scheduled in {}ms", start_at_ms.saturating_sub(now_ms));
            Ok(())
        }
    }

    fn start(&mut self, start_at_ms: i64, now_ms: i64) -> Result<(), PlayerError> {
        let position_ms = now_ms.saturating_sub(start_at_ms).max(0) as u64;
        self.player.seek_to(position_ms)?;
        self.player.play()?;
        self.phase = Phase::Playing {
            anchor_ms: start_at_ms,
        };
        info!("Playing from {}ms", position_ms);
        Ok(())
    }

    fn record_failure(&mut self, result: Result<(), PlayerError>) -> Result<(), PlayerError> {
        if let Err(e) = &result {
            warn!("Player failed: {}", e);
            self.phase = Phase::Error(e.to_string());
        }
        result
    }
}

/// Anchor such that `now_ms` maps to `position_ms`
fn anchor_for(position_ms: u64, now_ms: i64) -> i64 {
    now_ms.saturating_sub(i64::try_from(position_ms).unwrap_or(i64::MAX))
}
