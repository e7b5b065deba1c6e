//! Download Engine - the heart of segdl
//!
//! This module implements a resumable, segmented download engine with:
//! - Parallel byte-range pieces written in place
//! - Atomic persistence (SQLite)
//! - Clean pause/resume/stop driven by a shared stop signal
//! - Retry policy with backoff and network/power constraints
//! - Crash-safe resume

mod backoff;
mod coordinator;
mod fetcher;
mod manager;
mod metadata;
mod persistence;
mod piece_worker;
mod signal;

pub use backoff::*;
pub use coordinator::*;
pub use fetcher::*;
pub use manager::*;
pub use metadata::*;
pub use persistence::*;
pub use piece_worker::*;
pub use signal::*;
