//! CLI command implementations.

pub mod checkpoints;
pub mod config;
pub mod workflow;

pub use checkpoints::run_checkpoints;
pub use workflow::{run_approve, run_cancel, run_reject, run_resume, run_start};
