//! Configuration commands.

use std::path::Path;

use anyhow::Result;

use forgeline_core::config::Config;

use crate::ui;

/// Validate the configuration file.
pub fn run_validate(path: &Path) -> Result<()> {
    if !path.exists() {
        ui::warning(&format!(
            "No config file at {}; built-in defaults apply",
            path.display()
        ));
        Config::default().validate()?;
        ui::success("Default configuration is valid");
        return Ok(());
    }

    match Config::load(path) {
        Ok(config) => {
            ui::success(&format!("{} is valid", path.display()));
            ui::kv("Default provider", &config.providers.default);
            ui::kv("Tenants", &config.tenants.len().to_string());
            ui::kv("Agents", &config.agents.len().to_string());
            Ok(())
        }
        Err(e) => {
            ui::error(&format!("{}: {e}", path.display()));
            anyhow::bail!("Invalid configuration")
        }
    }
}

/// Print the effective configuration as JSON.
///
/// API keys are never printed.
pub fn run_show(config: &Config) -> Result<()> {
    let mut value = serde_json::to_value(config)?;
    if let Some(anthropic) = value
        .pointer_mut("/providers/anthropic")
        .and_then(serde_json::Value::as_object_mut)
    {
        if anthropic.get("apiKey").is_some_and(|key| !key.is_null()) {
            anthropic.insert("apiKey".to_string(), serde_json::Value::from("[REDACTED]"));
        }
    }
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
