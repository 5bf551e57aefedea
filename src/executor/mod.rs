//! Remote-side task execution
//!
//! Consumes `task` frames arriving on peer links, runs the named handler on
//! the blocking worker pool, and replies with exactly one terminal
//! `task_status` frame. Status polls are answered with the `acknowledged`
//! stub.

mod registry;
mod service;

pub use registry::*;
pub use service::*;
