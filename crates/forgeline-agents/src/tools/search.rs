//! Regex code search over the workspace.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use forgeline_core::config::ToolsConfig;

use super::{Tool, ToolError, ToolExecutionContext, ToolResult, truncation_notice};

const MAX_CONTEXT_LINES: usize = 10;

/// Search file contents with a regular expression.
///
/// Walks the workspace honoring `.gitignore`, skips excluded directories,
/// oversized and non-UTF-8 files, and stops at `max_results` matches.
pub struct CodeSearchTool {
    max_results: usize,
    max_file_size: u64,
    excluded_dirs: Vec<String>,
}

impl CodeSearchTool {
    /// Create the tool from sandbox configuration.
    #[must_use]
    pub fn new(config: &ToolsConfig) -> Self {
        Self {
            max_results: config.max_results,
            max_file_size: config.max_file_size,
            excluded_dirs: config.excluded_dirs.clone(),
        }
    }
}

struct SearchRequest {
    root: PathBuf,
    start: PathBuf,
    regex: Regex,
    context_lines: usize,
    max_results: usize,
    max_file_size: u64,
    excluded_dirs: Vec<String>,
}

struct SearchOutcome {
    entries: Vec<String>,
    matches: usize,
    truncated: bool,
}

#[async_trait]
impl Tool for CodeSearchTool {
    fn name(&self) -> &str {
        "code_search"
    }

    fn description(&self) -> &str {
        "Search repository files for a regular expression, with optional context lines"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {"type": "string", "description": "Regular expression"},
                "path": {"type": "string", "description": "Directory or file to search; defaults to the workspace root"},
                "context_lines": {"type": "integer", "description": "Lines of context around each match (max 10)"},
                "case_insensitive": {"type": "boolean"}
            },
            "required": ["pattern"]
        })
    }

    async fn execute(
        &self,
        ctx: &ToolExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, ToolError> {
        let pattern = ctx.require_str("pattern")?;
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(ctx.optional_bool("case_insensitive").unwrap_or(false))
            .size_limit(1 << 20)
            .build()
            .map_err(|e| ToolError::InvalidParams(format!("Invalid pattern: {e}")))?;

        let start = ctx.resolve_path(ctx.optional_str("path").unwrap_or("."))?;
        if !start.exists() {
            return Ok(ToolResult::error(format!(
                "Path not found: {}",
                ctx.display_path(&start)
            )));
        }

        let context_lines = ctx
            .optional_u64("context_lines")
            .map_or(0, |n| usize::try_from(n).unwrap_or(MAX_CONTEXT_LINES))
            .min(MAX_CONTEXT_LINES);

        let request = SearchRequest {
            root: ctx.workspace_root.clone(),
            start,
            regex,
            context_lines,
            max_results: self.max_results,
            max_file_size: self.max_file_size,
            excluded_dirs: self.excluded_dirs.clone(),
        };
        let walk_cancel = cancel.clone();
        let outcome = tokio::task::spawn_blocking(move || search(&request, &walk_cancel))
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("search task failed: {e}")))??;

        if outcome.entries.is_empty() {
            return Ok(ToolResult::success("No matches found"));
        }

        let mut content = outcome.entries.join("\n");
        if outcome.truncated {
            content.push('\n');
            content.push_str(&truncation_notice(outcome.matches, "matches"));
        }
        Ok(ToolResult::success(content).with_truncated(outcome.truncated))
    }
}

fn search(request: &SearchRequest, cancel: &CancellationToken) -> Result<SearchOutcome, ToolError> {
    let mut outcome = SearchOutcome {
        entries: Vec::new(),
        matches: 0,
        truncated: false,
    };

    let excluded = request.excluded_dirs.clone();
    let walker = ignore::WalkBuilder::new(&request.start)
        .hidden(false)
        .git_ignore(true)
        .git_global(false)
        .require_git(false)
        .sort_by_file_path(Path::cmp)
        .filter_entry(move |entry| {
            let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());
            !(is_dir && excluded.iter().any(|d| entry.file_name() == d.as_str()))
        })
        .build();

    for entry in walker.flatten() {
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let path = entry.path();
        let too_large = entry
            .metadata()
            .map_or(true, |m| m.len() > request.max_file_size);
        if too_large {
            tracing::trace!(path = %path.display(), "Skipping oversized file");
            continue;
        }
        // Binary and non-UTF-8 files are skipped.
        let Ok(content) = std::fs::read_to_string(path) else {
            continue;
        };

        let display = path
            .strip_prefix(&request.root)
            .unwrap_or(path)
            .display()
            .to_string();
        if search_file(request, &display, &content, &mut outcome) {
            break;
        }
    }

    Ok(outcome)
}

/// Append matches from one file. Returns `true` once the cap is hit.
fn search_file(
    request: &SearchRequest,
    display: &str,
    content: &str,
    outcome: &mut SearchOutcome,
) -> bool {
    let lines: Vec<&str> = content.lines().collect();
    for (index, line) in lines.iter().enumerate() {
        if !request.regex.is_match(line) {
            continue;
        }
        if outcome.matches == request.max_results {
            outcome.truncated = true;
            return true;
        }
        outcome.matches += 1;

        if request.context_lines == 0 {
            outcome.entries.push(format!("{display}:{}:{line}", index + 1));
            continue;
        }
        let start = index.saturating_sub(request.context_lines);
        let end = (index + request.context_lines + 1).min(lines.len());
        let block: Vec<String> = (start..end)
            .map(|i| {
                let marker = if i == index { '>' } else { ' ' };
                format!("{marker}{}:{}", i + 1, lines[i])
            })
            .collect();
        outcome
            .entries
            .push(format!("{display}:\n{}", block.join("\n")));
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::context;
    use pretty_assertions::assert_eq;

    fn tool(max_results: usize) -> CodeSearchTool {
        CodeSearchTool::new(&ToolsConfig {
            max_results,
            ..ToolsConfig::default()
        })
    }

    #[tokio::test]
    async fn test_search_reports_file_and_line() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "fn alpha() {}\nfn beta() {}\n").unwrap();

        let result = tool(100)
            .execute(&context(dir.path(), json!({"pattern": "beta"})), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.content, "src/lib.rs:2:fn beta() {}");
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn test_search_skips_excluded_dirs_and_large_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("node_modules")).unwrap();
        std::fs::write(dir.path().join("node_modules/dep.js"), "needle").unwrap();
        std::fs::write(dir.path().join("huge.txt"), format!("needle{}", " ".repeat(64))).unwrap();
        std::fs::write(dir.path().join("small.txt"), "needle").unwrap();

        let search = CodeSearchTool::new(&ToolsConfig {
            max_file_size: 32,
            ..ToolsConfig::default()
        });
        let result = search
            .execute(&context(dir.path(), json!({"pattern": "needle"})), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.content, "small.txt:1:needle");
    }

    #[tokio::test]
    async fn test_search_context_and_case() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\nTWO\nthree\n").unwrap();

        let result = tool(100)
            .execute(
                &context(
                    dir.path(),
                    json!({"pattern": "two", "case_insensitive": true, "context_lines": 1}),
                ),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.content, "a.txt:\n 1:one\n>2:TWO\n 3:three");
    }

    #[tokio::test]
    async fn test_search_caps_matches() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("many.txt"), "hit\n".repeat(50)).unwrap();

        let result = tool(10)
            .execute(&context(dir.path(), json!({"pattern": "hit"})), &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.truncated);
        let lines: Vec<&str> = result.content.lines().collect();
        assert_eq!(lines.len(), 11);
        assert_eq!(lines[10], "[truncated: showing first 10 matches]");
    }

    #[tokio::test]
    async fn test_invalid_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let result = tool(10)
            .execute(&context(dir.path(), json!({"pattern": "("})), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ToolError::InvalidParams(_))));
    }
}
