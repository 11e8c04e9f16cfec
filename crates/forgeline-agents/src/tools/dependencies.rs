//! Dependency extraction from project manifests.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use forgeline_core::config::ToolsConfig;

use super::{Tool, ToolError, ToolExecutionContext, ToolResult};

static PACKAGE_REFERENCE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r#"<PackageReference\s+Include="([^"]+)"(?:\s+Version="([^"]*)")?"#).ok()
});

static REQUIREMENT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z0-9_.\-\[\]]+)\s*(.*)$").ok());

/// One declared dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// Package ecosystem (`cargo`, `npm`, `pip`, `go`, `nuget`).
    pub ecosystem: String,
    /// Manifest path relative to the workspace root.
    pub manifest: String,
    /// Package name.
    pub name: String,
    /// Version requirement as written, if any.
    pub version: Option<String>,
    /// Section it came from (`dependencies`, `dev-dependencies`, ...).
    pub kind: String,
}

/// Map declared dependencies across the manifests in the workspace.
pub struct DependencyMapTool {
    max_results: usize,
    max_file_size: u64,
    excluded_dirs: Vec<String>,
}

impl DependencyMapTool {
    /// Create the tool from sandbox configuration.
    #[must_use]
    pub fn new(config: &ToolsConfig) -> Self {
        Self {
            max_results: config.max_results,
            max_file_size: config.max_file_size,
            excluded_dirs: config.excluded_dirs.clone(),
        }
    }

    fn manifests(&self, start: &Path, cancel: &CancellationToken) -> Result<Vec<PathBuf>, ToolError> {
        let excluded = self.excluded_dirs.clone();
        let walker = ignore::WalkBuilder::new(start)
            .hidden(false)
            .require_git(false)
            .sort_by_file_path(Path::cmp)
            .filter_entry(move |entry| {
                let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());
                !(is_dir && excluded.iter().any(|d| entry.file_name() == d.as_str()))
            })
            .build();

        let mut found = Vec::new();
        for entry in walker.flatten() {
            if cancel.is_cancelled() {
                return Err(ToolError::Cancelled);
            }
            let small_enough = entry
                .metadata()
                .is_ok_and(|m| m.is_file() && m.len() <= self.max_file_size);
            if small_enough && manifest_kind(entry.path()).is_some() {
                found.push(entry.into_path());
            }
        }
        Ok(found)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Manifest {
    Cargo,
    Npm,
    Pip,
    Go,
    Nuget,
}

fn manifest_kind(path: &Path) -> Option<Manifest> {
    let name = path.file_name()?.to_str()?;
    match name {
        "Cargo.toml" => Some(Manifest::Cargo),
        "package.json" => Some(Manifest::Npm),
        "requirements.txt" => Some(Manifest::Pip),
        "go.mod" => Some(Manifest::Go),
        _ if name.ends_with(".csproj") => Some(Manifest::Nuget),
        _ => None,
    }
}

#[async_trait]
impl Tool for DependencyMapTool {
    fn name(&self) -> &str {
        "dependency_map"
    }

    fn description(&self) -> &str {
        "List dependencies declared in Cargo.toml, package.json, requirements.txt, go.mod and .csproj manifests"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Directory to scan; defaults to the workspace root"}
            }
        })
    }

    async fn execute(
        &self,
        ctx: &ToolExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, ToolError> {
        let start = ctx.resolve_path(ctx.optional_str("path").unwrap_or("."))?;
        if !start.is_dir() {
            return Ok(ToolResult::error(format!(
                "Not a directory: {}",
                ctx.display_path(&start)
            )));
        }

        let mut dependencies = Vec::new();
        for manifest in self.manifests(&start, cancel)? {
            let Some(kind) = manifest_kind(&manifest) else {
                continue;
            };
            let content = tokio::fs::read_to_string(&manifest).await?;
            let manifest_display = ctx.display_path(&manifest);
            match parse_manifest(kind, &manifest_display, &content) {
                Ok(found) => dependencies.extend(found),
                Err(e) => tracing::debug!(manifest = %manifest_display, error = %e, "Unparseable manifest"),
            }
        }

        let total = dependencies.len();
        let truncated = total > self.max_results;
        dependencies.truncate(self.max_results);

        let body = json!({
            "dependencies": dependencies,
            "total": total,
            "truncated": truncated,
        });
        let content = serde_json::to_string_pretty(&body)
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(ToolResult::success(content).with_truncated(truncated))
    }
}

fn parse_manifest(kind: Manifest, manifest: &str, content: &str) -> Result<Vec<Dependency>, String> {
    match kind {
        Manifest::Cargo => parse_cargo(manifest, content),
        Manifest::Npm => parse_package_json(manifest, content),
        Manifest::Pip => Ok(parse_requirements(manifest, content)),
        Manifest::Go => Ok(parse_go_mod(manifest, content)),
        Manifest::Nuget => Ok(parse_csproj(manifest, content)),
    }
}

fn dependency(ecosystem: &str, manifest: &str, name: &str, version: Option<String>, kind: &str) -> Dependency {
    Dependency {
        ecosystem: ecosystem.to_string(),
        manifest: manifest.to_string(),
        name: name.to_string(),
        version: version.filter(|v| !v.is_empty()),
        kind: kind.to_string(),
    }
}

fn parse_cargo(manifest: &str, content: &str) -> Result<Vec<Dependency>, String> {
    let doc: toml::Table = content.parse().map_err(|e: toml::de::Error| e.to_string())?;
    let mut out = Vec::new();

    let mut collect = |table: &toml::Table, kind: &str| {
        for section in ["dependencies", "dev-dependencies", "build-dependencies"] {
            let Some(deps) = table.get(section).and_then(toml::Value::as_table) else {
                continue;
            };
            let label = if kind.is_empty() {
                section.to_string()
            } else {
                format!("{kind}.{section}")
            };
            for (name, spec) in deps {
                let version = match spec {
                    toml::Value::String(v) => Some(v.clone()),
                    toml::Value::Table(t) => t.get("version").and_then(toml::Value::as_str).map(str::to_string),
                    _ => None,
                };
                out.push(dependency("cargo", manifest, name, version, &label));
            }
        }
    };

    collect(&doc, "");
    if let Some(workspace) = doc.get("workspace").and_then(toml::Value::as_table) {
        collect(workspace, "workspace");
    }
    Ok(out)
}

fn parse_package_json(manifest: &str, content: &str) -> Result<Vec<Dependency>, String> {
    let doc: Value = serde_json::from_str(content).map_err(|e| e.to_string())?;
    let mut out = Vec::new();
    for section in ["dependencies", "devDependencies", "peerDependencies"] {
        let Some(deps) = doc.get(section).and_then(Value::as_object) else {
            continue;
        };
        for (name, version) in deps {
            let version = version.as_str().map(str::to_string);
            out.push(dependency("npm", manifest, name, version, section));
        }
    }
    Ok(out)
}

fn parse_requirements(manifest: &str, content: &str) -> Vec<Dependency> {
    let Some(pattern) = REQUIREMENT.as_ref() else {
        return Vec::new();
    };
    content
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty() && !line.starts_with('-'))
        .filter_map(|line| pattern.captures(line))
        .map(|caps| {
            let version = caps.get(2).map(|m| m.as_str().trim().to_string());
            dependency("pip", manifest, &caps[1], version, "requirements")
        })
        .collect()
}

fn parse_go_mod(manifest: &str, content: &str) -> Vec<Dependency> {
    let mut out = Vec::new();
    let mut in_block = false;
    for raw in content.lines() {
        let line = raw.split("//").next().unwrap_or_default().trim();
        let entry = if in_block {
            if line == ")" {
                in_block = false;
                continue;
            }
            line
        } else if line == "require (" {
            in_block = true;
            continue;
        } else if let Some(rest) = line.strip_prefix("require ") {
            rest
        } else {
            continue;
        };

        let mut parts = entry.split_whitespace();
        if let Some(name) = parts.next() {
            let version = parts.next().map(str::to_string);
            out.push(dependency("go", manifest, name, version, "require"));
        }
    }
    out
}

fn parse_csproj(manifest: &str, content: &str) -> Vec<Dependency> {
    let Some(pattern) = PACKAGE_REFERENCE.as_ref() else {
        return Vec::new();
    };
    pattern
        .captures_iter(content)
        .map(|caps| {
            let version = caps.get(2).map(|m| m.as_str().to_string());
            dependency("nuget", manifest, &caps[1], version, "PackageReference")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::context;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_cargo() {
        let deps = parse_cargo(
            "Cargo.toml",
            r#"
[package]
name = "demo"

[dependencies]
serde = "1"
tokio = { version = "1.40", features = ["full"] }
local = { path = "../local" }

[dev-dependencies]
tempfile = "3"
"#,
        )
        .unwrap();

        let summary: Vec<(&str, Option<&str>, &str)> = deps
            .iter()
            .map(|d| (d.name.as_str(), d.version.as_deref(), d.kind.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("local", None, "dependencies"),
                ("serde", Some("1"), "dependencies"),
                ("tokio", Some("1.40"), "dependencies"),
                ("tempfile", Some("3"), "dev-dependencies"),
            ]
        );
    }

    #[test]
    fn test_parse_other_ecosystems() {
        let npm = parse_package_json(
            "package.json",
            r#"{"dependencies": {"react": "^18.0.0"}, "devDependencies": {"jest": "29"}}"#,
        )
        .unwrap();
        assert_eq!(npm.len(), 2);
        assert_eq!(npm[1].kind, "devDependencies");

        let pip = parse_requirements("requirements.txt", "# comment\nrequests>=2.0\n-r other.txt\nflask\n");
        assert_eq!(pip.len(), 2);
        assert_eq!(pip[0].version.as_deref(), Some(">=2.0"));
        assert_eq!(pip[1].version, None);

        let go = parse_go_mod(
            "go.mod",
            "module x\n\nrequire github.com/a/b v1.2.3\nrequire (\n\tgithub.com/c/d v0.1.0 // indirect\n)\n",
        );
        assert_eq!(go.len(), 2);
        assert_eq!(go[1].name, "github.com/c/d");

        let nuget = parse_csproj(
            "App.csproj",
            r#"<ItemGroup><PackageReference Include="Newtonsoft.Json" Version="13.0.1" /></ItemGroup>"#,
        );
        assert_eq!(nuget[0].name, "Newtonsoft.Json");
        assert_eq!(nuget[0].version.as_deref(), Some("13.0.1"));
    }

    #[tokio::test]
    async fn test_dependency_map_caps_results() {
        let dir = tempfile::tempdir().unwrap();
        let deps: String = (0..8).map(|i| format!("dep{i} = \"1\"\n")).collect();
        std::fs::write(dir.path().join("Cargo.toml"), format!("[dependencies]\n{deps}")).unwrap();
        std::fs::create_dir(dir.path().join("target")).unwrap();
        std::fs::write(dir.path().join("target/package.json"), r#"{"dependencies": {"x": "1"}}"#).unwrap();

        let tool = DependencyMapTool::new(&ToolsConfig {
            max_results: 5,
            ..ToolsConfig::default()
        });
        let result = tool
            .execute(&context(dir.path(), json!({})), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.truncated);
        let body: Value = serde_json::from_str(&result.content).unwrap();
        assert_eq!(body["total"], 8);
        assert_eq!(body["truncated"], true);
        assert_eq!(body["dependencies"].as_array().unwrap().len(), 5);
    }
}
