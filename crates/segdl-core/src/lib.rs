//! segdl Core - Download Engine
//!
//! This crate provides the core download functionality for segdl.
//! It handles segmented downloads, pause/resume, retries under network
//! and power constraints, and crash-safe persistence.

mod conditions;
mod engine;
mod error;
mod outcome;
mod queue;
mod scheduler;
pub mod storage;

pub use conditions::*;
pub use engine::*;
pub use error::*;
pub use outcome::*;
pub use queue::*;
pub use scheduler::*;
