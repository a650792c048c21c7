//! Command Protocol
//!
//! Control messages share the transport with file payloads and travel as
//! plain UTF-8 text of the form `NAME:argument`.

use std::fmt;

use thiserror::Error;

/// Separator between command name and argument
const SEPARATOR: char = ':';

const START_PLAYBACK: &str = "START_PLAYBACK";

/// Control messages sent from host to guests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Begin playback at the given epoch-millisecond instant (host clock)
    StartPlayback { start_at_ms: i64 },
}

/// Why a command payload could not be understood
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Command is not valid UTF-8")]
    InvalidUtf8,

    #[error("Command has no ':' separator: {0:?}")]
    MissingSeparator(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid argument for {command}: {argument:?}")]
    InvalidArgument { command: String, argument: String },
}

impl Command {
    /// Wire name of this command
    pub fn name(&self) -> &'static str {
        match self {
            Command::StartPlayback { .. } => START_PLAYBACK,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// Parse a command payload. Never panics on arbitrary input.
    pub fn decode(bytes: &[u8]) -> Result<Command, DecodeError> {
        let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)?;
        let text = text.trim_matches(|c: char| c.is_ascii_whitespace());

        let (name, argument) = text
            .split_once(SEPARATOR)
            .ok_or_else(|| DecodeError::MissingSeparator(text.to_string()))?;

        match name {
            START_PLAYBACK => {
                let start_at_ms =
                    argument
                        .parse::<i64>()
                        .map_err(|_| DecodeError::InvalidArgument {
                            command: name.to_string(),
                            argument: argument.to_string(),
                        })?;
                Ok(Command::StartPlayback { start_at_ms })
            }
            other => Err(DecodeError::UnknownCommand(other.to_string())),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::StartPlayback { start_at_ms } => {
                write!(f, "{}{}{}", self.name(), SEPARATOR, start_at_ms)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_playback_wire_format() {
        let cmd = Command::StartPlayback {
            start_at_ms: 1_700_000_000_123,
        };
        assert_eq!(cmd.encode(), b"START_PLAYBACK:1700000000123".to_vec());
    }

    #[test]
    fn test_round_trip_edge_values() {
        for start_at_ms in [0, 1, -1, i64::MAX, i64::MIN] {
            let cmd = Command::StartPlayback { start_at_ms };
            assert_eq!(Command::decode(&cmd.encode()), Ok(cmd));
        }
    }

    #[test]
    fn test_decode_tolerates_surrounding_whitespace() {
        assert_eq!(
            Command::decode(b"  START_PLAYBACK:42\n"),
            Ok(Command::StartPlayback { start_at_ms: 42 })
        );
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert_eq!(
            Command::decode(b"GARBAGE"),
            Err(DecodeError::MissingSeparator("GARBAGE".to_string()))
        );
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(
            Command::decode(b"STOP_PLAYBACK:1"),
            Err(DecodeError::UnknownCommand("STOP_PLAYBACK".to_string()))
        );
    }

    #[test]
    fn test_non_numeric_argument() {
        assert!(matches!(
            Command::decode(b"START_PLAYBACK:soon"),
            Err(DecodeError::InvalidArgument { .. })
        ));
        assert!(matches!(
            Command::decode(b"START_PLAYBACK:"),
            Err(DecodeError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_invalid_utf8() {
        assert_eq!(
            Command::decode(&[0xff, 0xfe, b':', b'1']),
            Err(DecodeError::InvalidUtf8)
        );
    }
}
