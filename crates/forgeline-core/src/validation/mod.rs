//! Input validation and sandbox security primitives.
//!
//! Defense-in-depth: every tool validates its inputs with these helpers
//! before touching the filesystem or spawning a process.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

/// Validation error types.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Input exceeds maximum allowed length.
    #[error("Input exceeds maximum length ({max} bytes, got {actual})")]
    TooLong {
        /// Maximum allowed length.
        max: usize,
        /// Actual input length.
        actual: usize,
    },

    /// Disallowed characters in input.
    #[error("Disallowed characters in input")]
    DisallowedChars,

    /// Input failed schema validation.
    #[error("Input failed schema validation: {0}")]
    SchemaViolation(String),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Path contains a traversal segment or is rooted.
    #[error("Path traversal rejected: {0}")]
    PathTraversal(String),

    /// Resolved path escapes the workspace root.
    #[error("Path resolves outside the workspace: {0}")]
    OutsideRoot(String),

    /// File exceeds the size ceiling.
    #[error("File {path} is {size} bytes, exceeding the {max} byte limit")]
    FileTooLarge {
        /// Offending file.
        path: String,
        /// Actual size.
        size: u64,
        /// Configured ceiling.
        max: u64,
    },

    /// Executable is not on the whitelist.
    #[error("Command not allowed: {0}")]
    CommandNotAllowed(String),

    /// Argument contains a shell metacharacter.
    #[error("Shell metacharacter in argument: {0}")]
    ShellMetacharacter(String),

    /// Interpreter invoked with code passed on the command line.
    #[error("Inline code is not allowed for {0}")]
    InlineCode(String),

    /// IO error while resolving a path.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ValidationError {
    /// Whether this error is a sandbox breach attempt rather than malformed input.
    #[must_use]
    pub const fn is_security_violation(&self) -> bool {
        matches!(
            self,
            Self::PathTraversal(_)
                | Self::OutsideRoot(_)
                | Self::CommandNotAllowed(_)
                | Self::ShellMetacharacter(_)
                | Self::InlineCode(_)
        )
    }
}

/// Size limits per input type.
pub mod limits {
    /// Maximum rejection feedback length (64KB).
    pub const MAX_MESSAGE_LENGTH: usize = 64 * 1024;

    /// Maximum tool parameters size (1MB).
    pub const MAX_TOOL_PARAMS_SIZE: usize = 1024 * 1024;

    /// Maximum config file size (1MB).
    pub const MAX_CONFIG_FILE_SIZE: usize = 1024 * 1024;

    /// Default ceiling for files read or scanned by tools (1MB).
    pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024;

    /// Default cap on search matches and dependency entries.
    pub const DEFAULT_MAX_RESULTS: usize = 100;

    /// Maximum JSON nesting depth.
    pub const MAX_JSON_DEPTH: usize = 32;
}

/// Characters that are never accepted in command arguments.
pub const SHELL_METACHARACTERS: &[char] = &[';', '|', '&', '`', '\n', '\r'];

/// Executables that evaluate code given as an argument.
const INTERPRETERS: &[&str] = &[
    "python", "python3", "node", "deno", "ruby", "perl", "php", "sh", "bash", "zsh", "pwsh",
    "powershell",
];

/// Flags that make an interpreter run the next argument (or stdin) as code.
const INLINE_CODE_FLAGS: &[&str] = &["-c", "-e", "-E", "-p", "-r", "--eval", "--print", "-command", "-"];

/// Validate and sanitize free text from humans (e.g. rejection feedback).
///
/// Performs:
/// 1. Length check (prevent memory exhaustion)
/// 2. Strip null bytes and control chars (except newlines/tabs)
/// 3. Unicode normalization (NFKC)
///
/// # Errors
///
/// Returns `ValidationError::TooLong` if input exceeds `max_len`.
pub fn validate_message_content(input: &str, max_len: usize) -> Result<String, ValidationError> {
    if input.len() > max_len {
        return Err(ValidationError::TooLong {
            max: max_len,
            actual: input.len(),
        });
    }

    let sanitized: String = input
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t' || *c == '\r')
        .collect();

    Ok(sanitized.nfkc().collect())
}

/// Validate tool parameters against a JSON schema.
///
/// # Errors
///
/// Returns `ValidationError::SchemaViolation` if validation fails.
pub fn validate_tool_params(
    params: &serde_json::Value,
    schema: &serde_json::Value,
) -> Result<(), ValidationError> {
    let size = serde_json::to_string(params)?.len();
    if size > limits::MAX_TOOL_PARAMS_SIZE {
        return Err(ValidationError::TooLong {
            max: limits::MAX_TOOL_PARAMS_SIZE,
            actual: size,
        });
    }

    check_json_depth(params, 0, limits::MAX_JSON_DEPTH)?;
    validate_json_structure(params, schema)
}

/// Check JSON nesting depth to prevent stack overflow.
fn check_json_depth(
    value: &serde_json::Value,
    depth: usize,
    max: usize,
) -> Result<(), ValidationError> {
    if depth > max {
        return Err(ValidationError::SchemaViolation(format!(
            "JSON nesting depth exceeds maximum ({max})"
        )));
    }

    match value {
        serde_json::Value::Array(arr) => {
            for item in arr {
                check_json_depth(item, depth + 1, max)?;
            }
        }
        serde_json::Value::Object(obj) => {
            for item in obj.values() {
                check_json_depth(item, depth + 1, max)?;
            }
        }
        _ => {}
    }

    Ok(())
}

fn type_matches(value: &serde_json::Value, expected: &str) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        _ => true,
    }
}

/// Structural validation: top-level type, required fields, and the declared
/// type of each present property.
fn validate_json_structure(
    params: &serde_json::Value,
    schema: &serde_json::Value,
) -> Result<(), ValidationError> {
    let Some(schema_type) = schema.get("type").and_then(|t| t.as_str()) else {
        return Ok(());
    };

    if !type_matches(params, schema_type) {
        return Err(ValidationError::SchemaViolation(format!(
            "Expected {schema_type}"
        )));
    }

    let Some(obj) = params.as_object() else {
        return Ok(());
    };

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for field in required.iter().filter_map(|r| r.as_str()) {
            if !obj.contains_key(field) {
                return Err(ValidationError::SchemaViolation(format!(
                    "Missing required field: {field}"
                )));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) {
        for (name, value) in obj {
            let expected = properties
                .get(name)
                .and_then(|p| p.get("type"))
                .and_then(|t| t.as_str());
            if let Some(expected) = expected {
                if !type_matches(value, expected) {
                    return Err(ValidationError::SchemaViolation(format!(
                        "Field '{name}' must be of type {expected}"
                    )));
                }
            }
        }
    }

    Ok(())
}

/// Resolve `requested` relative to `root` and verify it stays inside it.
///
/// Rejects rooted/absolute paths, drive prefixes, NUL bytes and any `..`
/// segment outright. The deepest existing ancestor is canonicalized so a
/// symlink inside the workspace cannot point the result outside of it; a
/// dangling symlink counts as existing and is rejected, since its target
/// cannot be checked. The returned path is absolute and need not exist yet.
///
/// # Errors
///
/// Returns `PathTraversal` or `OutsideRoot` on a containment breach, `Io`
/// if the root itself cannot be resolved.
pub fn resolve_within_root(root: &Path, requested: &str) -> Result<PathBuf, ValidationError> {
    if requested.contains('\0') {
        return Err(ValidationError::DisallowedChars);
    }
    if requested.starts_with('/') || requested.starts_with('\\') {
        return Err(ValidationError::PathTraversal(requested.to_string()));
    }
    if requested.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(ValidationError::PathTraversal(requested.to_string()));
    }

    let relative = Path::new(requested);
    let mut normalized = PathBuf::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ValidationError::PathTraversal(requested.to_string()));
            }
        }
    }

    let canonical_root = root.canonicalize()?;
    let candidate = canonical_root.join(&normalized);

    // Walk up to the deepest existing entry and resolve symlinks there.
    // `symlink_metadata` sees a link even when its target is missing.
    let mut existing = candidate.as_path();
    let mut missing = Vec::new();
    while std::fs::symlink_metadata(existing).is_err() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => break,
        }
    }

    let mut resolved = match existing.canonicalize() {
        Ok(path) => path,
        Err(_) if existing.is_symlink() => {
            return Err(ValidationError::OutsideRoot(requested.to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    if !resolved.starts_with(&canonical_root) {
        return Err(ValidationError::OutsideRoot(requested.to_string()));
    }
    for name in missing.into_iter().rev() {
        resolved.push(name);
    }

    Ok(resolved)
}

/// Reject files larger than `max` bytes without reading them.
///
/// # Errors
///
/// Returns `FileTooLarge` if the file exceeds the ceiling, `Io` if its
/// metadata cannot be read.
pub fn check_file_size(path: &Path, max: u64) -> Result<u64, ValidationError> {
    let size = std::fs::metadata(path)?.len();
    if size > max {
        return Err(ValidationError::FileTooLarge {
            path: path.display().to_string(),
            size,
            max,
        });
    }
    Ok(size)
}

/// Base name of an executable, without directory or `.exe` suffix.
#[must_use]
pub fn executable_base_name(executable: &str) -> String {
    let name = executable
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(executable);
    let lower = name.to_ascii_lowercase();
    lower
        .strip_suffix(".exe")
        .map_or(lower.clone(), str::to_string)
}

/// Check an executable against the whitelist and its arguments for shell
/// metacharacters.
///
/// The executable must be a bare name resolved through `PATH`; `./cargo`
/// or `/tmp/x/cargo` are refused even though their base name matches.
///
/// # Errors
///
/// Returns `CommandNotAllowed` if the name is path-qualified or not
/// whitelisted, `ShellMetacharacter` if any argument contains `;`, `|`,
/// `&`, a backtick, `$(` or a line break, and `InlineCode` if an
/// interpreter is asked to evaluate code from its arguments.
pub fn validate_command<S: AsRef<str>>(
    executable: &str,
    args: &[S],
    whitelist: &[String],
) -> Result<(), ValidationError> {
    if executable.trim().is_empty()
        || contains_metacharacter(executable)
        || executable.contains(['/', '\\'])
    {
        return Err(ValidationError::CommandNotAllowed(executable.to_string()));
    }

    let base = executable_base_name(executable);
    if !whitelist.iter().any(|allowed| allowed.eq_ignore_ascii_case(&base)) {
        return Err(ValidationError::CommandNotAllowed(base));
    }

    for arg in args {
        let arg = arg.as_ref();
        if contains_metacharacter(arg) {
            return Err(ValidationError::ShellMetacharacter(arg.to_string()));
        }
    }

    if INTERPRETERS.contains(&base.as_str())
        && args
            .iter()
            .any(|arg| INLINE_CODE_FLAGS.contains(&arg.as_ref()))
    {
        return Err(ValidationError::InlineCode(base));
    }

    Ok(())
}

fn contains_metacharacter(value: &str) -> bool {
    value.contains(SHELL_METACHARACTERS) || value.contains("$(")
}
