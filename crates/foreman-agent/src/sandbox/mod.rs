//! Confined filesystem and process execution for one session.

mod paths;
mod process;

pub use process::ExecResult;

use crate::{AgentError, CommandPolicy, ToolError};
use async_trait::async_trait;
use process::{RunningGroups, SpawnSpec, run_confined};
use regex::RegexBuilder;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use walkdir::WalkDir;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecRequest {
    pub program: String,
    pub args: Vec<String>,
    pub timeout_ms: u64,
    /// Relative to the sandbox root.
    pub working_dir: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrepOptions {
    pub path: Option<String>,
    pub case_insensitive: bool,
    pub max_results: usize,
}

impl Default for GrepOptions {
    fn default() -> Self {
        Self {
            path: None,
            case_insensitive: false,
            max_results: 100,
        }
    }
}

/// Everything a tool may do to the outside world goes through this trait.
#[async_trait]
pub trait ExecutionEnvironment: Send + Sync {
    async fn read_file(&self, path: &str) -> Result<String, ToolError>;
    async fn write_file(&self, path: &str, contents: &str) -> Result<(), ToolError>;
    async fn file_exists(&self, path: &str) -> Result<bool, ToolError>;
    async fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>, ToolError>;
    async fn exec_command(&self, request: &ExecRequest) -> Result<ExecResult, ToolError>;
    async fn grep(&self, pattern: &str, options: &GrepOptions) -> Result<String, ToolError>;
    async fn glob(&self, pattern: &str) -> Result<Vec<String>, ToolError>;
    /// Kills every process group still running; returns how many were signalled.
    async fn terminate_all_commands(&self) -> usize;
    fn root(&self) -> &Path;
}

/// Sandbox rooted at a directory on the local filesystem.
#[derive(Clone, Debug)]
pub struct LocalSandbox {
    root: PathBuf,
    policy: CommandPolicy,
    output_limit_bytes: usize,
    running: RunningGroups,
}

impl LocalSandbox {
    /// Creates `root` if needed and pins it to its canonical form.
    pub fn new(root: impl AsRef<Path>, policy: CommandPolicy) -> Result<Self, AgentError> {
        policy.validate()?;
        std::fs::create_dir_all(root.as_ref())?;
        let root = root.as_ref().canonicalize()?;
        Ok(Self {
            root,
            policy,
            output_limit_bytes: 100_000,
            running: RunningGroups::default(),
        })
    }

    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit_bytes = bytes;
        self
    }

    /// A fresh sandbox rooted at `name` below this one, sharing the policy.
    pub fn child(&self, name: &str) -> Result<Self, AgentError> {
        let path = paths::confine(&self.root, name)?;
        if path == self.root {
            return Err(AgentError::InvalidConfiguration(format!(
                "child sandbox '{name}' must be a subdirectory"
            )));
        }
        Ok(Self::new(path, self.policy.clone())?.with_output_limit(self.output_limit_bytes))
    }

    pub fn resolve(&self, path: &str) -> Result<PathBuf, ToolError> {
        paths::confine(&self.root, path)
    }

    pub fn policy(&self) -> &CommandPolicy {
        &self.policy
    }

    pub fn running_commands(&self) -> usize {
        self.running.len()
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }
}

#[async_trait]
impl ExecutionEnvironment for LocalSandbox {
    async fn read_file(&self, path: &str) -> Result<String, ToolError> {
        let resolved = self.resolve(path)?;
        if !resolved.is_file() {
            return Err(ToolError::NotFound(format!("file '{path}' does not exist")));
        }
        let bytes = tokio::fs::read(&resolved)
            .await
            .map_err(|error| ToolError::execution(format!("failed to read '{path}': {error}")))?;
        String::from_utf8(bytes)
            .map_err(|_| ToolError::execution(format!("file '{path}' is not valid UTF-8")))
    }

    async fn write_file(&self, path: &str, contents: &str) -> Result<(), ToolError> {
        let resolved = self.resolve(path)?;
        if resolved == self.root || resolved.is_dir() {
            return Err(ToolError::Validation(format!("'{path}' is a directory")));
        }
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|error| {
                ToolError::execution(format!("failed to create parent of '{path}': {error}"))
            })?;
        }
        tokio::fs::write(&resolved, contents)
            .await
            .map_err(|error| ToolError::execution(format!("failed to write '{path}': {error}")))?;
        debug!(path = %resolved.display(), bytes = contents.len(), "wrote file");
        Ok(())
    }

    async fn file_exists(&self, path: &str) -> Result<bool, ToolError> {
        let resolved = self.resolve(path)?;
        Ok(tokio::fs::try_exists(&resolved).await.unwrap_or(false))
    }

    async fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>, ToolError> {
        let resolved = self.resolve(path)?;
        if !resolved.exists() {
            return Err(ToolError::NotFound(format!(
                "directory '{path}' does not exist"
            )));
        }
        if !resolved.is_dir() {
            return Err(ToolError::Validation(format!("'{path}' is not a directory")));
        }

        let mut reader = tokio::fs::read_dir(&resolved)
            .await
            .map_err(|error| ToolError::execution(format!("failed to list '{path}': {error}")))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|error| ToolError::execution(format!("failed to list '{path}': {error}")))?
        {
            let metadata = entry.metadata().await.ok();
            let is_dir = metadata.as_ref().is_some_and(|meta| meta.is_dir());
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir,
                size: metadata.filter(|meta| meta.is_file()).map(|meta| meta.len()),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn exec_command(&self, request: &ExecRequest) -> Result<ExecResult, ToolError> {
        let Some(entry) = self.policy.find_match(&request.program, &request.args) else {
            return Err(ToolError::Permission(format!(
                "command '{}' is not on the allowlist",
                request.program
            )));
        };
        for argument in &request.args {
            paths::confine_argument(argument)?;
        }
        if request.timeout_ms == 0 {
            return Err(ToolError::Validation(
                "timeout_ms must be greater than zero".to_string(),
            ));
        }

        let cwd = match request.working_dir.as_deref() {
            Some(dir) => self.resolve(dir)?,
            None => self.root.clone(),
        };
        if !cwd.is_dir() {
            return Err(ToolError::NotFound(format!(
                "working directory '{}' does not exist",
                self.relative(&cwd)
            )));
        }

        info!(
            program = %request.program,
            args = ?request.args,
            shell = entry.shell,
            "running sandboxed command"
        );
        run_confined(
            SpawnSpec {
                program: &request.program,
                args: &request.args,
                via_shell: entry.shell,
                cwd: &cwd,
                timeout: Duration::from_millis(request.timeout_ms),
                output_limit_bytes: self.output_limit_bytes,
            },
            &self.running,
        )
        .await
    }

    async fn grep(&self, pattern: &str, options: &GrepOptions) -> Result<String, ToolError> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(options.case_insensitive)
            .build()
            .map_err(|error| ToolError::Validation(format!("invalid regex: {error}")))?;
        let search_root = self.resolve(options.path.as_deref().unwrap_or(""))?;
        if !search_root.exists() {
            return Err(ToolError::NotFound(format!(
                "path '{}' does not exist",
                options.path.as_deref().unwrap_or(".")
            )));
        }

        let root = self.root.clone();
        let max_results = options.max_results.max(1);
        tokio::task::spawn_blocking(move || grep_blocking(&root, &search_root, &regex, max_results))
            .await
            .map_err(|error| ToolError::execution(format!("grep task failed: {error}")))
    }

    async fn glob(&self, pattern: &str) -> Result<Vec<String>, ToolError> {
        if Path::new(pattern).is_absolute()
            || Path::new(pattern)
                .components()
                .any(|component| matches!(component, std::path::Component::ParentDir))
        {
            return Err(ToolError::Permission(format!(
                "glob pattern '{pattern}' must stay inside the sandbox root"
            )));
        }

        let full = self.root.join(pattern);
        let full = full.to_string_lossy();
        let paths = glob::glob(&full)
            .map_err(|error| ToolError::Validation(format!("invalid glob pattern: {error}")))?;
        let mut matches: Vec<String> = paths
            .filter_map(Result::ok)
            .filter(|path| {
                path.canonicalize()
                    .is_ok_and(|canonical| canonical.starts_with(&self.root))
            })
            .map(|path| self.relative(&path))
            .collect();
        matches.sort();
        Ok(matches)
    }

    async fn terminate_all_commands(&self) -> usize {
        self.running.kill_all()
    }

    fn root(&self) -> &Path {
        &self.root
    }
}

fn grep_blocking(
    root: &Path,
    search_root: &Path,
    regex: &regex::Regex,
    max_results: usize,
) -> String {
    let mut lines = Vec::new();
    let walker = WalkDir::new(search_root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.file_name() != ".git");
    'files: for entry in walker.filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(contents) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .into_owned();
        for (number, line) in contents.lines().enumerate() {
            if regex.is_match(line) {
                lines.push(format!("{relative}:{}:{line}", number + 1));
                if lines.len() >= max_results {
                    break 'files;
                }
            }
        }
    }

    if lines.is_empty() {
        "no matches".to_string()
    } else {
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AllowedCommand;

    fn sandbox() -> (tempfile::TempDir, LocalSandbox) {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let sandbox =
            LocalSandbox::new(dir.path(), CommandPolicy::default()).expect("sandbox should open");
        (dir, sandbox)
    }

    fn exec(program: &str, args: &[&str], timeout_ms: u64) -> ExecRequest {
        ExecRequest {
            program: program.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            timeout_ms,
            working_dir: None,
        }
    }

    #[tokio::test]
    async fn write_then_read_creates_parent_directories() {
        let (_dir, sandbox) = sandbox();
        sandbox
            .write_file("nested/deep/file.txt", "hello")
            .await
            .expect("write should succeed");
        let contents = sandbox
            .read_file("nested/deep/file.txt")
            .await
            .expect("read should succeed");
        assert_eq!(contents, "hello");
    }

    #[tokio::test]
    async fn write_outside_root_creates_nothing() {
        let (dir, sandbox) = sandbox();
        let error = sandbox
            .write_file("../escaped/file.txt", "nope")
            .await
            .expect_err("escape should fail");
        assert!(matches!(error, ToolError::Permission(_)));
        let parent = dir.path().parent().expect("temp dir has a parent");
        assert!(!parent.join("escaped").exists());
    }

    #[tokio::test]
    async fn overwrite_replaces_existing_contents() {
        let (_dir, sandbox) = sandbox();
        sandbox.write_file("notes.txt", "one").await.expect("first write");
        sandbox.write_file("notes.txt", "two").await.expect("overwrite");
        assert_eq!(
            sandbox.read_file("notes.txt").await.expect("read should succeed"),
            "two"
        );
        assert!(sandbox.file_exists("notes.txt").await.expect("exists check"));
    }

    #[tokio::test]
    async fn read_missing_file_is_not_found() {
        let (_dir, sandbox) = sandbox();
        let error = sandbox
            .read_file("missing.txt")
            .await
            .expect_err("missing file should fail");
        assert!(matches!(error, ToolError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_directory_is_sorted_and_typed() {
        let (_dir, sandbox) = sandbox();
        sandbox.write_file("b.txt", "bb").await.expect("write b");
        sandbox.write_file("a/inner.txt", "a").await.expect("write a");
        let entries = sandbox.list_directory(".").await.expect("list should succeed");
        assert_eq!(
            entries,
            vec![
                DirEntry {
                    name: "a".to_string(),
                    is_dir: true,
                    size: None
                },
                DirEntry {
                    name: "b.txt".to_string(),
                    is_dir: false,
                    size: Some(2)
                },
            ]
        );
    }

    #[tokio::test]
    async fn grep_reports_relative_paths_and_line_numbers() {
        let (_dir, sandbox) = sandbox();
        sandbox
            .write_file("src/main.rs", "fn main() {}\n// TODO wire\n")
            .await
            .expect("write should succeed");
        let output = sandbox
            .grep("todo", &GrepOptions {
                case_insensitive: true,
                ..GrepOptions::default()
            })
            .await
            .expect("grep should succeed");
        assert_eq!(output, "src/main.rs:2:// TODO wire");
    }

    #[tokio::test]
    async fn glob_rejects_parent_traversal() {
        let (_dir, sandbox) = sandbox();
        sandbox.write_file("a.md", "#").await.expect("write should succeed");
        assert_eq!(
            sandbox.glob("*.md").await.expect("glob should succeed"),
            vec!["a.md".to_string()]
        );
        assert!(matches!(
            sandbox.glob("../*").await,
            Err(ToolError::Permission(_))
        ));
    }

    #[tokio::test]
    async fn child_sandbox_is_nested_and_confined() {
        let (_dir, sandbox) = sandbox();
        let child = sandbox.child("01-api").expect("child should open");
        assert!(child.root().starts_with(sandbox.root()));
        assert!(sandbox.child("..").is_err());
        assert!(matches!(
            child.write_file("../sibling.txt", "x").await,
            Err(ToolError::Permission(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exec_runs_allowlisted_command_in_root() {
        let (_dir, sandbox) = sandbox();
        let result = sandbox
            .exec_command(&exec("echo", &["hello", "world"], 5_000))
            .await
            .expect("echo should succeed");
        assert_eq!(result.stdout.trim(), "hello world");
        assert_eq!(result.exit_code, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exec_does_not_interpret_arguments_through_a_shell() {
        let (_dir, sandbox) = sandbox();
        let result = sandbox
            .exec_command(&exec("echo", &["$HOME", ";", "ls"], 5_000))
            .await
            .expect("echo should succeed");
        assert_eq!(result.stdout.trim(), "$HOME ; ls");
    }

    #[tokio::test]
    async fn exec_rejects_commands_outside_allowlist() {
        let (_dir, sandbox) = sandbox();
        let error = sandbox
            .exec_command(&exec("rm", &["-rf", "."], 5_000))
            .await
            .expect_err("rm should be rejected");
        assert!(matches!(error, ToolError::Permission(_)));
    }

    #[tokio::test]
    async fn exec_rejects_arguments_outside_root_before_spawning() {
        let outer = tempfile::tempdir().expect("temp dir should be created");
        std::fs::write(outer.path().join("victim.txt"), "keep").expect("victim write");
        let sandbox = LocalSandbox::new(outer.path().join("work"), CommandPolicy::default())
            .expect("sandbox should open");

        for args in [
            vec!["..", "-name", "victim.txt", "-delete"],
            vec!["/", "-maxdepth", "0"],
        ] {
            let error = sandbox
                .exec_command(&exec("find", &args, 5_000))
                .await
                .expect_err("escaping find should be rejected");
            assert!(matches!(error, ToolError::Permission(_)));
        }
        assert!(outer.path().join("victim.txt").exists());
        assert_eq!(sandbox.running_commands(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exec_non_zero_exit_is_execution_error_with_output() {
        let (_dir, sandbox) = sandbox();
        let error = sandbox
            .exec_command(&exec("ls", &["definitely-missing-entry"], 5_000))
            .await
            .expect_err("ls of a missing path should fail");
        match error {
            ToolError::Execution {
                exit_code, stderr, ..
            } => {
                assert!(exit_code.is_some_and(|code| code != 0));
                assert!(!stderr.is_empty());
            }
            other => panic!("expected execution error, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exec_shell_entry_runs_through_sh() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let policy = CommandPolicy::empty().allow(AllowedCommand::via_shell("echo"));
        let sandbox = LocalSandbox::new(dir.path(), policy).expect("sandbox should open");
        let result = sandbox
            .exec_command(&exec("echo", &["a", "&&", "echo", "b"], 5_000))
            .await
            .expect("shell command should succeed");
        assert_eq!(result.stdout, "a\nb\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exec_caps_captured_output() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let sandbox = LocalSandbox::new(dir.path(), CommandPolicy::default())
            .expect("sandbox should open")
            .with_output_limit(8);
        sandbox
            .write_file("big.txt", &"x".repeat(1_000))
            .await
            .expect("write should succeed");
        let result = sandbox
            .exec_command(&exec("cat", &["big.txt"], 5_000))
            .await
            .expect("cat should succeed");
        assert!(result.stdout.starts_with("xxxxxxxx\n[output capped at 8 bytes]"));
    }
}
