//! Agent runtime.
//!
//! Resolves which provider serves a tenant's agent, runs prompts with the
//! agent's timeout, and reports usage so the budget unit can deduct what
//! was actually spent.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use forgeline_core::config::Config;
use forgeline_core::types::TokenUsage;
use forgeline_providers::{
    AgentResponse, AnthropicAgent, CliAgent, CommandAgent, CommandPreset, usage_from_metadata,
};

use crate::context::ExecutionContext;
use crate::error::StepError;
use crate::tools::{ScopedToolSet, ToolRegistry};

/// Failure messages that indicate a temporary condition.
const TRANSIENT_MARKERS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "overloaded",
    "timed out",
    "timeout",
    "temporarily unavailable",
    "connection reset",
];

/// Output of one agent invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOutput {
    /// Agent output text.
    pub content: String,
    /// Reported usage, if the provider reported any.
    pub usage: Option<TokenUsage>,
    /// Provider that served the call.
    pub provider: String,
}

impl AgentOutput {
    /// Total reported tokens.
    #[must_use]
    pub fn tokens(&self) -> Option<u64> {
        self.usage.as_ref().map(TokenUsage::total)
    }
}

/// Runs prompts for workflow nodes.
pub struct AgentRuntime {
    config: Arc<Config>,
    providers: HashMap<String, Arc<dyn CliAgent>>,
    tools: Arc<ToolRegistry>,
}

impl AgentRuntime {
    /// Runtime with no providers and the built-in tools.
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        let tools = Arc::new(ToolRegistry::with_builtins(&config.tools));
        Self {
            config,
            providers: HashMap::new(),
            tools,
        }
    }

    /// Runtime with every provider the configuration describes.
    ///
    /// CLI providers are always registered; agents with a model override get
    /// a dedicated instance. The Anthropic provider is registered only when a
    /// key is available.
    #[must_use]
    pub fn from_config(config: Arc<Config>) -> Self {
        let mut runtime = Self::new(Arc::clone(&config));
        let providers = &config.providers;

        for (preset, cli) in [
            (CommandPreset::Claude, &providers.claude),
            (CommandPreset::Codex, &providers.codex),
            (CommandPreset::Gemini, &providers.gemini),
        ] {
            runtime = runtime.with_provider(preset.name(), Arc::new(CommandAgent::from_preset(preset, cli)));

            for (agent_id, agent) in &config.agents {
                if agent.model.is_none() {
                    continue;
                }
                let agent_provider = agent.provider.as_deref().unwrap_or(&providers.default);
                if agent_provider != preset.name() {
                    continue;
                }
                let dedicated = CommandAgent::from_preset(preset, cli)
                    .with_model(agent.model.clone())
                    .with_timeout(agent.timeout());
                runtime = runtime.with_provider(format!("{}:{agent_id}", preset.name()), Arc::new(dedicated));
            }
        }

        if let Some(anthropic) = &providers.anthropic {
            match AnthropicAgent::from_config(anthropic) {
                Ok(agent) => runtime = runtime.with_provider("anthropic", Arc::new(agent)),
                Err(e) => tracing::warn!(error = %e, "Anthropic provider not available"),
            }
        }

        runtime
    }

    /// Register a provider under `name`.
    #[must_use]
    pub fn with_provider(mut self, name: impl Into<String>, provider: Arc<dyn CliAgent>) -> Self {
        self.providers.insert(name.into(), provider);
        self
    }

    /// Replace the tool registry.
    #[must_use]
    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    /// Configuration the runtime was built from.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Provider serving `agent_id` for the context's tenant.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the resolved provider is not registered.
    pub fn provider_for(
        &self,
        ctx: &ExecutionContext,
        agent_id: &str,
    ) -> Result<(String, Arc<dyn CliAgent>), StepError> {
        let name = self.config.provider_for(&ctx.tenant_id, agent_id);
        let dedicated = format!("{name}:{agent_id}");
        self.providers
            .get(&dedicated)
            .or_else(|| self.providers.get(&name))
            .map(|provider| (name.clone(), Arc::clone(provider)))
            .ok_or_else(|| StepError::Validation(format!("Provider '{name}' is not configured")))
    }

    /// Tools `agent_id` may use for the context's tenant and ticket.
    ///
    /// # Errors
    ///
    /// Returns `SecurityViolation` for an invalid tenant, `Internal` if the
    /// workspace cannot be prepared.
    pub async fn tools_for(
        &self,
        ctx: &ExecutionContext,
        agent_id: &str,
    ) -> Result<ScopedToolSet, StepError> {
        Ok(self
            .tools
            .for_agent(&ctx.tenant_id, &ctx.ticket_id, agent_id, &self.config)
            .await?)
    }

    /// Run `prompt` on the agent's provider.
    ///
    /// The prompt runs inside the tenant workspace when it exists.
    ///
    /// # Errors
    ///
    /// Provider errors are classified into step error classes. An
    /// unsuccessful response is `Transient` when its message points to rate
    /// limiting or overload, `Internal` otherwise.
    pub async fn run_prompt(
        &self,
        ctx: &ExecutionContext,
        agent_id: &str,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<AgentOutput, StepError> {
        let (name, provider) = self.provider_for(ctx, agent_id)?;
        let limit = self.config.agent(agent_id).timeout();
        let workspace = self.config.workspace_root(&ctx.tenant_id);

        tracing::debug!(
            agent = agent_id,
            provider = %name,
            tenant_id = %ctx.tenant_id,
            ticket_id = %ctx.ticket_id,
            prompt_len = prompt.len(),
            "Running prompt"
        );

        let call = async {
            if workspace.is_dir() {
                provider.execute_in_project(prompt, &workspace, cancel).await
            } else {
                provider.execute(prompt, cancel).await
            }
        };
        let response = tokio::time::timeout(limit, call)
            .await
            .map_err(|_| StepError::Timeout {
                operation: format!("{name} ({agent_id})"),
                duration: limit,
            })??;

        into_output(name, response)
    }
}

fn into_output(provider: String, response: AgentResponse) -> Result<AgentOutput, StepError> {
    if !response.success {
        let message = response
            .error
            .filter(|e| !e.trim().is_empty())
            .unwrap_or_else(|| "agent reported failure".to_string());
        let lower = message.to_ascii_lowercase();
        return Err(if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
            StepError::Transient(message)
        } else {
            StepError::Internal(message)
        });
    }

    Ok(AgentOutput {
        usage: usage_from_metadata(&response.metadata),
        content: response.content,
        provider,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use forgeline_providers::ProviderError;

    use super::*;

    /// Agent that replays canned responses and records prompts.
    pub struct CannedAgent {
        responses: Mutex<VecDeque<AgentResponse>>,
        fallback: AgentResponse,
        prompts: Mutex<Vec<String>>,
    }

    impl CannedAgent {
        pub fn new(responses: Vec<AgentResponse>, fallback: AgentResponse) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                fallback,
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn always(content: &str) -> Self {
            Self::new(Vec::new(), AgentResponse::ok(content))
        }

        pub fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CliAgent for CannedAgent {
        fn name(&self) -> &str {
            "canned"
        }

        async fn execute(
            &self,
            prompt: &str,
            cancel: &CancellationToken,
        ) -> Result<AgentResponse, ProviderError> {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            self.prompts.lock().unwrap().push(prompt.to_string());
            let next = self.responses.lock().unwrap().pop_front();
            Ok(next.unwrap_or_else(|| self.fallback.clone()))
        }

        async fn execute_in_project(
            &self,
            prompt: &str,
            _project_path: &Path,
            cancel: &CancellationToken,
        ) -> Result<AgentResponse, ProviderError> {
            self.execute(prompt, cancel).await
        }
    }

    /// Config whose tenants all work under `root`.
    pub fn config_with_root(root: &Path, tenant: &forgeline_core::types::TenantId) -> Config {
        let mut config = Config::default();
        config.tenants.insert(
            tenant.to_string(),
            forgeline_core::config::TenantConfig {
                workspace_root: Some(root.to_path_buf()),
                ..Default::default()
            },
        );
        config
    }

    /// Runtime serving every agent from `agent`.
    pub fn runtime(config: Config, agent: Arc<CannedAgent>) -> AgentRuntime {
        let provider = config.providers.default.clone();
        AgentRuntime::new(Arc::new(config)).with_provider(provider, agent)
    }
}
