//! FFI bindings for native app integration
//!
//! This module provides the interface exposed via uniffi to Kotlin/Swift.
//! The app supplies the transport and player as callback interfaces, or
//! uses the built-in LAN transport.

mod bridge;
mod handlers;
mod session;
mod types;

pub use bridge::{ForeignPlayer, ForeignTransport};
pub use session::*;
pub use types::*;
