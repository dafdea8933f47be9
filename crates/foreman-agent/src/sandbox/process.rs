use crate::{ToolError, truncate_utf8_lossy};
use std::collections::HashSet;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long to wait for pipes to close after the process group is killed.
const IO_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const READ_CHUNK_SIZE: usize = 8 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

/// Process groups currently running on behalf of one sandbox.
#[derive(Clone, Debug, Default)]
pub(crate) struct RunningGroups {
    inner: Arc<Mutex<HashSet<u32>>>,
}

impl RunningGroups {
    fn insert(&self, pgid: u32) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pgid);
    }

    fn remove(&self, pgid: u32) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pgid);
    }

    pub(crate) fn kill_all(&self) -> usize {
        let groups: Vec<u32> = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for pgid in &groups {
            kill_process_group(*pgid);
        }
        groups.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Kills the whole process group when the command finishes or its future is
/// dropped mid-flight, so no descendant outlives the call.
struct GroupGuard {
    pgid: Option<u32>,
    running: RunningGroups,
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_process_group(pgid);
            self.running.remove(pgid);
        }
    }
}

pub(crate) struct SpawnSpec<'a> {
    pub program: &'a str,
    pub args: &'a [String],
    pub via_shell: bool,
    pub cwd: &'a Path,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

pub(crate) async fn run_confined(
    spec: SpawnSpec<'_>,
    running: &RunningGroups,
) -> Result<ExecResult, ToolError> {
    let mut command = if spec.via_shell {
        let mut command = Command::new("sh");
        command.arg("-c").arg(shell_line(spec.program, spec.args));
        command
    } else {
        let mut command = Command::new(spec.program);
        command.args(spec.args);
        command
    };
    command
        .current_dir(spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let started = Instant::now();
    let mut child = command.spawn().map_err(|error| {
        ToolError::execution(format!("failed to spawn '{}': {error}", spec.program))
    })?;

    // With process_group(0) the child's pid doubles as its group id.
    let pgid = child.id();
    if let Some(pgid) = pgid {
        running.insert(pgid);
    }
    let guard = GroupGuard {
        pgid,
        running: running.clone(),
    };

    let stdout_buf = Arc::new(Mutex::new(Vec::new()));
    let stderr_buf = Arc::new(Mutex::new(Vec::new()));
    let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(read_capped(
            stdout,
            stdout_buf.clone(),
            spec.output_limit_bytes,
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(read_capped(
            stderr,
            stderr_buf.clone(),
            spec.output_limit_bytes,
        )));
    }

    let status = match tokio::time::timeout(spec.timeout, child.wait()).await {
        Ok(status) => Some(status.map_err(|error| {
            ToolError::execution(format!("failed to wait for '{}': {error}", spec.program))
        })?),
        Err(_) => {
            warn!(
                program = spec.program,
                timeout_ms = spec.timeout.as_millis() as u64,
                "command timed out, killing process group"
            );
            if let Some(pgid) = pgid {
                kill_process_group(pgid);
            }
            let _ = child.start_kill();
            let _ = child.wait().await;
            None
        }
    };
    drop(guard);

    for mut reader in readers {
        if tokio::time::timeout(IO_DRAIN_TIMEOUT, &mut reader)
            .await
            .is_err()
        {
            debug!(program = spec.program, "output reader did not drain in time");
            reader.abort();
        }
    }

    let stdout = snapshot(&stdout_buf, spec.output_limit_bytes);
    let stderr = snapshot(&stderr_buf, spec.output_limit_bytes);
    let duration_ms = started.elapsed().as_millis() as u64;

    let Some(status) = status else {
        return Err(ToolError::Timeout {
            timeout_ms: spec.timeout.as_millis() as u64,
            stdout,
            stderr,
        });
    };

    match status.code() {
        Some(0) => Ok(ExecResult {
            stdout,
            stderr,
            exit_code: 0,
            duration_ms,
        }),
        Some(code) => Err(ToolError::Execution {
            message: format!("'{}' exited with status {code}", spec.program),
            exit_code: Some(code),
            stdout,
            stderr,
        }),
        None => Err(ToolError::Execution {
            message: format!("'{}' was terminated by a signal", spec.program),
            exit_code: None,
            stdout,
            stderr,
        }),
    }
}

// Keeps draining after the cap so the child never blocks on a full pipe.
async fn read_capped<R>(mut reader: R, buffer: Arc<Mutex<Vec<u8>>>, limit: usize)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0_u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(read) => {
                let mut buffer = buffer.lock().unwrap_or_else(PoisonError::into_inner);
                // One byte past the cap lets the snapshot mark the output as capped.
                let room = (limit + 1).saturating_sub(buffer.len());
                buffer.extend_from_slice(&chunk[..read.min(room)]);
            }
        }
    }
}

fn snapshot(buffer: &Arc<Mutex<Vec<u8>>>, limit: usize) -> String {
    let bytes = buffer.lock().unwrap_or_else(PoisonError::into_inner);
    truncate_utf8_lossy(&bytes, limit)
}

fn shell_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    // ESRCH just means the group already exited.
    let _ = killpg(Pid::from_raw(raw), Signal::SIGKILL);
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}
