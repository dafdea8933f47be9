use crate::ToolError;
use std::path::{Component, Path, PathBuf};

/// Resolves `requested` against the canonical `root`, refusing anything that
/// lands outside it.
///
/// The check runs in two passes. The lexical pass folds `.` and `..` so
/// traversal sequences are caught even for paths that do not exist yet. The
/// second pass canonicalizes the deepest component that exists on disk, which
/// catches symbolic links pointing out of the root, dangling ones included.
pub(crate) fn confine(root: &Path, requested: &str) -> Result<PathBuf, ToolError> {
    let requested = requested.trim();
    if requested.contains('\0') {
        return Err(ToolError::Validation(
            "path must not contain NUL bytes".to_string(),
        ));
    }

    let candidate = if requested.is_empty() {
        root.to_path_buf()
    } else if Path::new(requested).is_absolute() {
        PathBuf::from(requested)
    } else {
        root.join(requested)
    };

    let normalized = normalize_lexically(&candidate);
    if !normalized.starts_with(root) {
        return Err(escape_error(requested));
    }

    let mut existing = normalized.as_path();
    while std::fs::symlink_metadata(existing).is_err() {
        existing = match existing.parent() {
            Some(parent) => parent,
            None => return Err(escape_error(requested)),
        };
    }

    let canonical = existing.canonicalize().map_err(|error| {
        ToolError::Permission(format!(
            "path '{requested}' could not be resolved inside the sandbox: {error}"
        ))
    })?;
    if !canonical.starts_with(root) {
        return Err(escape_error(requested));
    }

    let remainder = normalized
        .strip_prefix(existing)
        .map_err(|_| escape_error(requested))?;
    // Joining an empty remainder would append a trailing separator.
    if remainder.as_os_str().is_empty() {
        return Ok(canonical);
    }
    Ok(canonical.join(remainder))
}

/// Refuses a command argument that names a location outside the root.
///
/// Each argument is split into words on whitespace and shell punctuation, and
/// `--flag=value` words are checked on both sides of the `=`. A word that is
/// absolute, home-relative, or carries a `..` component is rejected.
pub(crate) fn confine_argument(argument: &str) -> Result<(), ToolError> {
    let words = argument
        .split(|c: char| c.is_whitespace() || SHELL_PUNCTUATION.contains(&c))
        .filter(|word| !word.is_empty());
    for word in words {
        let value = word.split_once('=').map_or(word, |(_, value)| value);
        if [word, value].into_iter().any(reaches_outside) {
            return Err(ToolError::Permission(format!(
                "argument '{argument}' reaches outside the sandbox root"
            )));
        }
    }
    Ok(())
}

const SHELL_PUNCTUATION: &[char] = &[';', '&', '|', '<', '>', '(', ')', '`', '\'', '"'];

fn reaches_outside(word: &str) -> bool {
    let path = Path::new(word);
    word.starts_with('~')
        || path.has_root()
        || path
            .components()
            .any(|component| matches!(component, Component::ParentDir))
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

fn escape_error(requested: &str) -> ToolError {
    ToolError::Permission(format!("path '{requested}' escapes the sandbox root"))
}
