//! LAN networking
//!
//! A libp2p implementation of the transport boundary for peers on the same
//! local network.

mod behaviour;
mod wire;

pub use behaviour::{NetworkConfig, NetworkError, NetworkHandle, NetworkManager};
