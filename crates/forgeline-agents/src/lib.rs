//! # Forgeline Agents
//!
//! Agent step pipeline, tool sandbox, and checkpointed workflow engine.
//!
//! - [`middleware`]: the composable pipeline wrapped around every step
//!   (logging, error handling, retry, tenant isolation, token budget,
//!   telemetry)
//! - [`workflow`]: workflow graphs and the engine that suspends at
//!   approval gates and resumes from checkpoints
//! - [`tools`]: tenant-scoped tools agents invoke against a workspace
//! - [`runtime`]: provider resolution and prompt execution

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod context;
pub mod error;
pub mod middleware;
pub mod process;
pub mod runtime;
pub mod tools;
pub mod workflow;

pub use context::{ExecutionContext, ExecutionMetadata, ExecutionResult, ResultStatus};
pub use error::StepError;
pub use middleware::{Middleware, Pipeline, StepMetrics};
pub use runtime::{AgentOutput, AgentRuntime};
pub use tools::{ScopedToolSet, Tool, ToolError, ToolRegistry, ToolResult};
pub use workflow::{RunOutcome, WorkflowEngine, WorkflowError, WorkflowGraph, WorkflowNode};
