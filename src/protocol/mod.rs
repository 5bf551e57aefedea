//! Wire protocol for peer links
//!
//! Defines the framed message envelope exchanged over peer TCP links and the
//! length-prefixed JSON codec. Every frame is a 4-byte big-endian length
//! followed by that many bytes of UTF-8 JSON.

mod framing;
mod messages;

pub use framing::*;
pub use messages::*;
