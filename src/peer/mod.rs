//! Peer connection management
//!
//! TCP links between nodes: the listening server, the outbound dialer, the
//! handshake exchange, and the peer table that caches each live peer's
//! last-reported hardware snapshot. All messages use length-prefixed JSON
//! framing (see [`crate::protocol`]).

mod manager;
mod table;

pub use manager::*;
pub use table::*;
