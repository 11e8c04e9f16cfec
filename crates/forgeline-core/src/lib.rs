//! # Forgeline Core
//!
//! Core types, configuration, and storage for Forgeline.
//!
//! This crate provides:
//! - Tenant, ticket, and workflow identifiers
//! - Typed workflow state (`StateBag`) with lossless JSON round-trips
//! - The ticket lifecycle state machine
//! - Checkpoint, budget, ticket, and tenant collaborator traits with
//!   in-memory and sled-backed implementations
//! - Configuration loading and validation (JSON5 format)
//! - Sandbox security primitives and secret redaction

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod budget;
pub mod checkpoint;
pub mod config;
pub mod secrets;
pub mod state;
pub mod storage;
pub mod tenant;
pub mod ticket;
pub mod types;
pub mod validation;

pub use budget::{BudgetError, BudgetService, MemoryBudgetService, TokenBudget};
pub use checkpoint::{Checkpoint, CheckpointStatus, CheckpointStore, CheckpointStoreError};
pub use config::{Config, ConfigError};
pub use secrets::{ApiKey, scrub_secrets};
pub use state::{StateBag, StateValue};
pub use storage::SledStore;
pub use tenant::{StaticTenantResolver, TenantError, TenantResolver};
pub use ticket::{Ticket, TicketError, TicketRepository, TicketStatus};
pub use types::{
    CheckpointId, ExecutionId, RepositoryId, TenantId, TicketId, TokenUsage, WorkflowId,
};
pub use validation::{ValidationError, validate_message_content};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::checkpoint::{Checkpoint, CheckpointStore};
    pub use crate::config::Config;
    pub use crate::state::{StateBag, StateValue};
    pub use crate::ticket::{Ticket, TicketStatus};
    pub use crate::types::*;
    pub use crate::validation::{resolve_within_root, validate_message_content};
    pub use crate::secrets::ApiKey;
}
