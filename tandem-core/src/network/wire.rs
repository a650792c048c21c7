//! Messages exchanged over `/tandem/payload/1`
//!
//! Every message is a CBOR request answered by exactly one response.

use serde::{Deserialize, Serialize};

/// Protocol name for the request-response behaviour
pub const PROTOCOL: &str = "/tandem/payload/1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkKind {
    /// Whole message in one chunk
    Bytes,
    /// Part of a file stream
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub payload_id: u64,
    pub kind: ChunkKind,
    pub offset: u64,
    pub total: u64,
    pub data: Vec<u8>,
}

impl Chunk {
    /// Whether this chunk completes the payload
    pub fn is_last(&self) -> bool {
        self.offset + self.data.len() as u64 >= self.total
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireRequest {
    /// Ask what a peer is advertising
    Probe,
    /// Ask to join a session
    Connect { name: String, service_id: String },
    Chunk(Chunk),
    /// Abandon a payload in either direction
    Cancel { payload_id: u64 },
    /// Leave the session
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireResponse {
    /// Answer to `Probe`. `name` is unset when not advertising.
    Advert {
        name: Option<String>,
        service_id: String,
    },
    Accepted,
    Rejected,
    /// Total bytes of the payload received so far
    Ack { received: u64 },
    Refused { reason: String },
    Done,
}

/// Length of the next chunk to send
pub fn next_chunk_len(total: u64, sent: u64, chunk_size: usize) -> usize {
    total.saturating_sub(sent).min(chunk_size as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_lengths_cover_file() {
        let mut sent = 0;
        let mut lens = Vec::new();
        while sent < 150 {
            let len = next_chunk_len(150, sent, 64);
            lens.push(len);
            sent += len as u64;
        }
        assert_eq!(lens, vec![64, 64, 22]);
        assert_eq!(next_chunk_len(150, 150, 64), 0);
    }

    #[test]
    fn test_last_chunk() {
        let chunk = Chunk {
            payload_id: 1,
            kind: ChunkKind::File,
            offset: 128,
            total: 150,
            data: vec![0; 22],
        };
        assert!(chunk.is_last());

        // An empty payload is complete with its first chunk
        let empty = Chunk {
            payload_id: 2,
            kind: ChunkKind::File,
            offset: 0,
            total: 0,
            data: Vec::new(),
        };
        assert!(empty.is_last());
    }
}
