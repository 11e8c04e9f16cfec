//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use forgeline_agents::{AgentRuntime, Pipeline, StepMetrics};
use forgeline_core::config::{AccountingMode, Config, TenantConfig};
use forgeline_core::tenant::StaticTenantResolver;
use forgeline_core::types::TenantId;
use forgeline_providers::{AgentResponse, CliAgent, ProviderError};

/// Tokens every scripted reply reports.
pub const TOKENS_PER_REPLY: u64 = 150;

/// Agent that answers every prompt with the same text and records prompts.
pub struct ScriptedAgent {
    reply: String,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedAgent {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl CliAgent for ScriptedAgent {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, prompt: &str, cancel: &CancellationToken) -> Result<AgentResponse, ProviderError> {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(AgentResponse::ok(self.reply.clone()).with_metadata("tokens_used", json!(TOKENS_PER_REPLY)))
    }
}

/// Configuration with one tenant working under `root` and synchronous
/// budget accounting.
pub fn config(root: &Path, tenant: &TenantId) -> Config {
    let mut config = Config::default();
    config.budget.accounting_mode = AccountingMode::Synchronous;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.retry.jitter = false;
    config.tenants.insert(
        tenant.to_string(),
        TenantConfig {
            workspace_root: Some(root.to_path_buf()),
            ..TenantConfig::default()
        },
    );
    config
}

/// Runtime serving every agent from `agent`.
pub fn runtime(config: Arc<Config>, agent: Arc<ScriptedAgent>) -> Arc<AgentRuntime> {
    let provider = config.providers.default.clone();
    Arc::new(AgentRuntime::new(config).with_provider(provider, agent))
}

/// Standard pipeline bound to `tenant`.
pub fn pipeline(
    config: &Config,
    tenant: &TenantId,
    budgets: Arc<dyn forgeline_core::budget::BudgetService>,
    metrics: Arc<StepMetrics>,
) -> Pipeline {
    Pipeline::standard(
        config,
        Arc::new(StaticTenantResolver::new(tenant.clone())),
        budgets,
        metrics,
    )
}
