//! Payload transfers
//!
//! Tracks every file and command payload per peer and turns completed
//! inbound files into stable paths.

mod storage;
mod tracker;

pub use storage::{ReceivedFile, ReceivedFileStore};
pub use tracker::{
    Direction, PayloadKind, RecordStatus, TransferError, TransferEvent, TransferRecord,
    TransferTracker,
};
