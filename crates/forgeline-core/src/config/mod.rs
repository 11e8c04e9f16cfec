//! Configuration loading and validation.
//!
//! JSON5 format, camelCase keys. Config location:
//! `$FORGELINE_STATE_DIR/forgeline.json` (default `~/.forgeline/forgeline.json`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::types::TenantId;
use crate::validation::limits;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON5 parsing error.
    #[error("Parse error: {0}")]
    Parse(#[from] json5::Error),

    /// Config validation error.
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Middleware pipeline behaviour.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Retry policy.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Token budget estimation and accounting.
    #[serde(default)]
    pub budget: BudgetConfig,

    /// Tool sandbox limits.
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Agent configurations by ID.
    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,

    /// Tenant configurations by tenant ID.
    #[serde(default)]
    pub tenants: HashMap<String, TenantConfig>,

    /// Provider configurations.
    #[serde(default)]
    pub providers: ProvidersConfig,

    /// Global settings.
    #[serde(default)]
    pub settings: GlobalSettings,
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// # Errors
    ///
    /// Returns error if config cannot be loaded or parsed.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path.
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read, parsed, or fails validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let size = std::fs::metadata(path)?.len();
        if size > limits::MAX_CONFIG_FILE_SIZE as u64 {
            return Err(ConfigError::Validation(format!(
                "Config file is {size} bytes, limit is {}",
                limits::MAX_CONFIG_FILE_SIZE
            )));
        }

        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration text.
    ///
    /// # Errors
    ///
    /// Returns error if the text is not valid JSON5 or fails validation.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a path.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or file write fails.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config file path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        Self::state_dir().join("forgeline.json")
    }

    /// Get the state directory.
    ///
    /// Uses `FORGELINE_STATE_DIR` env var if set, otherwise `~/.forgeline`.
    #[must_use]
    pub fn state_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("FORGELINE_STATE_DIR") {
            PathBuf::from(dir)
        } else if let Some(home) = dirs::home_dir() {
            home.join(".forgeline")
        } else {
            PathBuf::from(".forgeline")
        }
    }

    /// Get the sled database directory.
    #[must_use]
    pub fn db_dir() -> PathBuf {
        Self::state_dir().join("db")
    }

    /// Get the default parent directory of tenant workspaces.
    #[must_use]
    pub fn workspaces_dir() -> PathBuf {
        Self::state_dir().join("workspaces")
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "retry.maxAttempts must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Validation(
                "retry.baseDelayMs cannot exceed retry.maxDelayMs".to_string(),
            ));
        }
        if self.tools.max_results == 0 {
            return Err(ConfigError::Validation(
                "tools.maxResults must be at least 1".to_string(),
            ));
        }
        if self.tools.default_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "tools.defaultTimeoutSecs must be at least 1".to_string(),
            ));
        }
        for command in &self.tools.command_whitelist {
            if command.is_empty() || command.contains(['/', '\\', ' ']) {
                return Err(ConfigError::Validation(format!(
                    "Whitelisted command '{command}' must be a bare executable name"
                )));
            }
        }

        for (id, agent) in &self.agents {
            if agent.tools.iter().any(String::is_empty) {
                return Err(ConfigError::Validation(format!(
                    "Agent '{id}' lists an empty tool name"
                )));
            }
            if let Some(provider) = &agent.provider {
                self.check_provider(provider)?;
            }
        }

        for (id, tenant) in &self.tenants {
            TenantId::new(id.clone())
                .validate()
                .map_err(|e| ConfigError::Validation(format!("Tenant key '{id}': {e}")))?;
            if let Some(provider) = &tenant.provider {
                self.check_provider(provider)?;
            }
        }

        self.check_provider(&self.providers.default)
    }

    fn check_provider(&self, name: &str) -> Result<(), ConfigError> {
        if ProvidersConfig::KNOWN.contains(&name) {
            Ok(())
        } else {
            Err(ConfigError::Validation(format!(
                "Unknown provider '{name}' (expected one of {})",
                ProvidersConfig::KNOWN.join(", ")
            )))
        }
    }

    /// Get agent config by ID, falling back to the built-in default for that role.
    #[must_use]
    pub fn agent(&self, id: &str) -> AgentConfig {
        self.agents
            .get(id)
            .cloned()
            .unwrap_or_else(|| AgentConfig::default_for(id))
    }

    /// Get tenant config, if any.
    #[must_use]
    pub fn tenant(&self, tenant_id: &TenantId) -> Option<&TenantConfig> {
        self.tenants.get(tenant_id.as_ref())
    }

    /// Workspace root for a tenant.
    #[must_use]
    pub fn workspace_root(&self, tenant_id: &TenantId) -> PathBuf {
        self.tenant(tenant_id)
            .and_then(|t| t.workspace_root.clone())
            .unwrap_or_else(|| Self::workspaces_dir().join(tenant_id.as_ref()))
    }

    /// Provider name for a tenant and agent: tenant override, then agent, then default.
    #[must_use]
    pub fn provider_for(&self, tenant_id: &TenantId, agent_id: &str) -> String {
        self.tenant(tenant_id)
            .and_then(|t| t.provider.clone())
            .or_else(|| self.agent(agent_id).provider)
            .unwrap_or_else(|| self.providers.default.clone())
    }
}

/// Middleware pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Steps slower than this are logged as warnings.
    #[serde(default = "default_slow_call_ms")]
    pub slow_call_threshold_ms: u64,

    /// Replace error detail in user-visible messages with a generic text.
    #[serde(default)]
    pub redact_error_details: bool,

    /// Re-raise unclassified errors instead of converting them to results.
    #[serde(default)]
    pub rethrow_unhandled: bool,

    /// Re-raise cancellation instead of converting it to a result.
    #[serde(default = "default_true")]
    pub propagate_cancellation: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            slow_call_threshold_ms: default_slow_call_ms(),
            redact_error_details: false,
            rethrow_unhandled: false,
            propagate_cancellation: true,
        }
    }
}

impl PipelineConfig {
    /// Slow-call threshold as a duration.
    #[must_use]
    pub const fn slow_call_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_call_threshold_ms)
    }
}

const fn default_slow_call_ms() -> u64 {
    10_000
}

const fn default_true() -> bool {
    true
}

/// Retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on any single delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Add random jitter to each delay.
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: true,
        }
    }
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_base_delay_ms() -> u64 {
    500
}

const fn default_max_delay_ms() -> u64 {
    30_000
}

/// How consumed tokens are deducted after a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountingMode {
    /// Deduct on a detached task; the step result is returned immediately.
    #[default]
    Background,
    /// Deduct before the step result is returned.
    Synchronous,
}

/// Token budget configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetConfig {
    /// Estimate used for steps without a specific entry.
    #[serde(default = "default_estimate")]
    pub default_estimate: u64,

    /// Per-step estimates, keyed by node ID.
    #[serde(default)]
    pub step_estimates: HashMap<String, u64>,

    /// Deduction mode.
    #[serde(default)]
    pub accounting_mode: AccountingMode,

    /// Allotment given to tenants without a stored budget.
    #[serde(default = "default_allotment")]
    pub default_allotment: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            default_estimate: default_estimate(),
            step_estimates: HashMap::new(),
            accounting_mode: AccountingMode::default(),
            default_allotment: default_allotment(),
        }
    }
}

impl BudgetConfig {
    /// Estimated tokens for a step.
    #[must_use]
    pub fn estimate_for(&self, step: &str) -> u64 {
        self.step_estimates
            .get(step)
            .copied()
            .unwrap_or(self.default_estimate)
    }
}

const fn default_estimate() -> u64 {
    4_000
}

const fn default_allotment() -> u64 {
    2_000_000
}

/// Tool sandbox configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsConfig {
    /// Largest file a tool may read or scan, in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Cap on search matches and listed entries.
    #[serde(default = "default_max_results")]
    pub max_results: usize,

    /// Per-call timeout for tools without a specific one.
    #[serde(default = "default_tool_timeout")]
    pub default_timeout_secs: u64,

    /// Executables command tools may run, by base name.
    #[serde(default = "default_command_whitelist")]
    pub command_whitelist: Vec<String>,

    /// Directory names skipped by search and listing tools.
    #[serde(default = "default_excluded_dirs")]
    pub excluded_dirs: Vec<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            max_results: default_max_results(),
            default_timeout_secs: default_tool_timeout(),
            command_whitelist: default_command_whitelist(),
            excluded_dirs: default_excluded_dirs(),
        }
    }
}

impl ToolsConfig {
    /// Default per-call timeout.
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

const fn default_max_file_size() -> u64 {
    limits::DEFAULT_MAX_FILE_SIZE
}

const fn default_max_results() -> usize {
    limits::DEFAULT_MAX_RESULTS
}

const fn default_tool_timeout() -> u64 {
    120
}

fn default_command_whitelist() -> Vec<String> {
    [
        "cargo", "dotnet", "npm", "pnpm", "yarn", "go", "make", "mvn", "gradle", "pytest", "git",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_excluded_dirs() -> Vec<String> {
    [".git", "node_modules", "target", "bin", "obj", "dist", ".venv"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Provider override.
    #[serde(default)]
    pub provider: Option<String>,

    /// Model override passed to the provider.
    #[serde(default)]
    pub model: Option<String>,

    /// Tool names this agent may invoke.
    #[serde(default = "read_only_tools")]
    pub tools: Vec<String>,

    /// Timeout for a single agent invocation.
    #[serde(default = "default_agent_timeout")]
    pub timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            provider: None,
            model: None,
            tools: read_only_tools(),
            timeout_secs: default_agent_timeout(),
        }
    }
}

impl AgentConfig {
    /// Built-in configuration for a well-known agent role.
    ///
    /// `implementer` may write and run commands; every other role is read-only.
    #[must_use]
    pub fn default_for(id: &str) -> Self {
        let mut config = Self::default();
        if id == "implementer" {
            config.tools.extend(
                ["write_file", "run_build", "run_tests", "run_shell"]
                    .into_iter()
                    .map(String::from),
            );
        }
        config
    }

    /// Invocation timeout as a duration.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn read_only_tools() -> Vec<String> {
    ["read_file", "list_directory", "code_search", "dependency_map", "git"]
        .into_iter()
        .map(String::from)
        .collect()
}

const fn default_agent_timeout() -> u64 {
    600
}

/// Per-tenant configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantConfig {
    /// Provider override for every agent of this tenant.
    #[serde(default)]
    pub provider: Option<String>,

    /// Workspace root the tenant's tools are confined to.
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,

    /// Token allotment used when no budget is stored.
    #[serde(default)]
    pub token_allotment: Option<u64>,
}

/// Provider configurations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvidersConfig {
    /// Provider used when neither tenant nor agent overrides it.
    #[serde(default = "default_provider")]
    pub default: String,

    /// Claude Code CLI.
    #[serde(default = "CliProviderConfig::claude")]
    pub claude: CliProviderConfig,

    /// Codex CLI.
    #[serde(default = "CliProviderConfig::codex")]
    pub codex: CliProviderConfig,

    /// Gemini CLI.
    #[serde(default = "CliProviderConfig::gemini")]
    pub gemini: CliProviderConfig,

    /// Anthropic Messages API.
    #[serde(default)]
    pub anthropic: Option<AnthropicConfig>,
}

impl ProvidersConfig {
    /// Provider names accepted in configuration.
    pub const KNOWN: &'static [&'static str] = &["claude", "codex", "gemini", "anthropic"];
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            default: default_provider(),
            claude: CliProviderConfig::claude(),
            codex: CliProviderConfig::codex(),
            gemini: CliProviderConfig::gemini(),
            anthropic: None,
        }
    }
}

fn default_provider() -> String {
    "claude".to_string()
}

/// A provider backed by a local CLI binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CliProviderConfig {
    /// Binary name or path.
    pub binary: String,

    /// Extra arguments placed before the prompt.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl CliProviderConfig {
    fn named(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
            extra_args: Vec::new(),
        }
    }

    /// Default Claude Code CLI.
    #[must_use]
    pub fn claude() -> Self {
        Self::named("claude")
    }

    /// Default Codex CLI.
    #[must_use]
    pub fn codex() -> Self {
        Self::named("codex")
    }

    /// Default Gemini CLI.
    #[must_use]
    pub fn gemini() -> Self {
        Self::named("gemini")
    }
}

/// Anthropic provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnthropicConfig {
    /// API key (prefer the `ANTHROPIC_API_KEY` environment variable).
    #[serde(default)]
    pub api_key: Option<String>,

    /// Base URL override.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Model to call.
    #[serde(default = "default_anthropic_model")]
    pub model: String,

    /// Maximum tokens in a response.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_anthropic_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

const fn default_max_tokens() -> u32 {
    8192
}

/// Global settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSettings {
    /// Enable debug logging.
    #[serde(default)]
    pub debug: bool,

    /// Log format.
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format.
    #[default]
    Pretty,
    /// JSON format.
    Json,
}
