//! Resource-aware task scheduling
//!
//! Accepts local submissions, picks a peer with spare capacity by first-fit
//! over the peer table, sends the task frame, and tracks the task until a
//! terminal status arrives. Task history is retained for status queries.

mod manager;
mod task;

pub use manager::*;
pub use task::*;
