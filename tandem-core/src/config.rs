//! Session configuration

use std::path::PathBuf;
use std::time::Duration;

/// Default service identifier shared by hosts and guests
pub const DEFAULT_SERVICE_ID: &str = "dev.tandem.playback";

/// Default lead time between issuing a start command and the start itself
const DEFAULT_LOOKAHEAD: Duration = Duration::from_secs(5);

/// Default time a transfer may go without progress before it is failed
const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Service identifier used to advertise and discover
    pub service_id: String,
    /// Name announced to the remote side when requesting a connection
    pub local_name: String,
    /// Margin added to "now" when scheduling a synchronized start.
    /// Must exceed worst-case file transfer plus command delivery latency.
    pub lookahead: Duration,
    /// Local clock minus host clock, applied to received start timestamps
    pub clock_offset_ms: i64,
    /// Fail transfers that make no progress for this long (None disables)
    pub transfer_stall_timeout: Option<Duration>,
    /// Directory that received files are moved into
    pub storage_dir: PathBuf,
    /// Whether the host schedules its own local player with the guests
    pub host_plays_along: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_id: DEFAULT_SERVICE_ID.to_string(),
            local_name: "Guest".to_string(),
            lookahead: DEFAULT_LOOKAHEAD,
            clock_offset_ms: 0,
            transfer_stall_timeout: Some(DEFAULT_STALL_TIMEOUT),
            storage_dir: std::env::temp_dir().join("tandem"),
            host_plays_along: true,
        }
    }
}

impl SessionConfig {
    pub fn with_local_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = name.into();
        self
    }

    pub fn with_lookahead(mut self, lookahead: Duration) -> Self {
        self.lookahead = lookahead;
        self
    }

    pub fn with_clock_offset_ms(mut self, offset_ms: i64) -> Self {
        self.clock_offset_ms = offset_ms;
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.transfer_stall_timeout = timeout;
        self
    }

    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = dir.into();
        self
    }

    pub fn with_host_plays_along(mut self, enabled: bool) -> Self {
        self.host_plays_along = enabled;
        self
    }

    /// Lookahead in whole milliseconds, saturating at `i64::MAX`
    pub fn lookahead_ms(&self) -> i64 {
        i64::try_from(self.lookahead.as_millis()).unwrap_or(i64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookahead_ms_saturates() {
        let config = SessionConfig::default();
        assert_eq!(config.lookahead_ms(), 5_000);

        let config = config.with_lookahead(Duration::from_millis(u64::MAX));
        assert_eq!(config.lookahead_ms(), i64::MAX);
    }
}
