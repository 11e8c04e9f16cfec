//! # Forgeline Providers
//!
//! Language-model agents behind one execution contract: local coding CLIs
//! (Claude Code, Codex, Gemini) driven as subprocesses, and the Anthropic
//! Messages API over HTTP.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod traits;
mod anthropic;
mod command;
mod usage;

pub use traits::{AgentResponse, CliAgent, ProviderError};
pub use anthropic::AnthropicAgent;
pub use command::{CommandAgent, CommandPreset};
pub use usage::{usage_from_metadata, tokens_from_metadata};
