//! Subprocess execution for the shell tool.
//!
//! `process_exec_tool_call` never surfaces an `Err` to the exec handler: every
//! failure mode -- spawn error, timeout, cancellation, sandbox wrapper
//! problems -- becomes an [`ExecToolCallOutput`] with a nonzero exit code and
//! the diagnostic on stderr, so the model always receives a well-formed tool
//! result.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::SandboxErr;
use crate::landlock;
#[cfg(target_os = "macos")]
use crate::seatbelt;
use crate::spawn::QUILL_SANDBOX_ENV_VAR;
use crate::spawn::QUILL_SANDBOX_NETWORK_DISABLED_ENV_VAR;
use crate::spawn::SpawnChildRequest;
use crate::spawn::StdioPolicy;
use crate::spawn::spawn_child_async;

/// Hard cap per captured stream. Excess bytes are discarded, but the pipe
/// keeps draining so the child never blocks on a full buffer.
pub const MAX_STREAM_BYTES: usize = 100 * 1024;

/// Wall-clock limit applied when the tool call does not specify one.
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// How long a SIGTERM'd process group gets before SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxType {
    None,
    /// Wrap the command with `/usr/bin/sandbox-exec` and a generated profile.
    MacosSeatbelt,
    /// Wrap the command with the Landlock helper executable.
    LinuxLandlock,
}

/// The platform sandbox available on this host, if any.
pub fn get_platform_sandbox() -> Option<SandboxType> {
    if cfg!(target_os = "macos") {
        Some(SandboxType::MacosSeatbelt)
    } else if cfg!(target_os = "linux") {
        Some(SandboxType::LinuxLandlock)
    } else {
        None
    }
}

#[derive(Debug, Clone)]
pub struct ExecParams {
    pub command: Vec<String>,
    pub cwd: PathBuf,
    pub timeout_ms: Option<u64>,
}

impl ExecParams {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS))
    }
}

/// One captured output stream, UTF-8 lossy, at most [`MAX_STREAM_BYTES`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamOutput {
    pub text: String,
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub struct ExecToolCallOutput {
    /// Child exit code when it exited; `128 + signal` for signal deaths;
    /// `1` when the child could not even be spawned.
    pub exit_code: i32,
    pub stdout: StreamOutput,
    pub stderr: StreamOutput,
    pub duration: Duration,
    pub timed_out: bool,
}

impl ExecToolCallOutput {
    fn spawn_failure(message: String, duration: Duration) -> Self {
        Self {
            exit_code: 1,
            stdout: StreamOutput::default(),
            stderr: StreamOutput {
                text: message,
                truncated: false,
            },
            duration,
            timed_out: false,
        }
    }

    /// The text handed back to the model: stdout, with stderr appended when
    /// the command failed, plus a timeout note when applicable.
    pub fn aggregated(&self) -> String {
        let mut out = String::new();
        if self.timed_out {
            out.push_str(&format!(
                "command timed out after {} ms\n",
                self.duration.as_millis()
            ));
        }
        out.push_str(&self.stdout.text);
        if self.exit_code != 0 && !self.stderr.text.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr.text);
        }
        out
    }
}

/// Execute `params.command`, optionally wrapped in a platform sandbox
/// parameterized by `writable_roots`, observing `cancel` at every wait.
pub async fn process_exec_tool_call(
    params: ExecParams,
    sandbox_type: SandboxType,
    writable_roots: &[PathBuf],
    linux_sandbox_helper: Option<&Path>,
    cancel: &CancellationToken,
) -> ExecToolCallOutput {
    let start = Instant::now();

    let command = adapt_command_for_platform(params.command.clone());
    let mut env: HashMap<String, String> = std::env::vars().collect();

    let (program, args) = match build_spawn_target(
        command,
        sandbox_type,
        writable_roots,
        &params.cwd,
        linux_sandbox_helper,
        &mut env,
    ) {
        Ok(target) => target,
        Err(err) => {
            return ExecToolCallOutput::spawn_failure(err.to_string(), start.elapsed());
        }
    };

    let child = match spawn_child_async(SpawnChildRequest {
        program,
        args,
        cwd: params.cwd.clone(),
        env,
        stdio_policy: StdioPolicy::RedirectForShellTool,
    })
    .await
    {
        Ok(child) => child,
        Err(err) => {
            return ExecToolCallOutput::spawn_failure(
                format!("failed to spawn command: {err}"),
                start.elapsed(),
            );
        }
    };

    wait_with_limits(child, params.timeout(), cancel, start).await
}

fn build_spawn_target(
    command: Vec<String>,
    sandbox_type: SandboxType,
    writable_roots: &[PathBuf],
    cwd: &Path,
    linux_sandbox_helper: Option<&Path>,
    env: &mut HashMap<String, String>,
) -> Result<(PathBuf, Vec<String>), SandboxErr> {
    match sandbox_type {
        SandboxType::None => {
            let mut command = command;
            if command.is_empty() {
                command.push("true".to_string());
            }
            let program = PathBuf::from(command.remove(0));
            Ok((program, command))
        }
        #[cfg(target_os = "macos")]
        SandboxType::MacosSeatbelt => {
            env.insert(QUILL_SANDBOX_ENV_VAR.to_string(), "seatbelt".to_string());
            env.insert(
                QUILL_SANDBOX_NETWORK_DISABLED_ENV_VAR.to_string(),
                "1".to_string(),
            );
            let args = seatbelt::create_seatbelt_command_args(command, writable_roots, cwd);
            Ok((
                PathBuf::from(seatbelt::MACOS_PATH_TO_SEATBELT_EXECUTABLE),
                args,
            ))
        }
        #[cfg(not(target_os = "macos"))]
        SandboxType::MacosSeatbelt => Err(SandboxErr::NoSandboxAvailable),
        SandboxType::LinuxLandlock => {
            let helper = linux_sandbox_helper.ok_or(SandboxErr::MissingLinuxSandboxHelper)?;
            env.insert(QUILL_SANDBOX_ENV_VAR.to_string(), "landlock".to_string());
            env.insert(
                QUILL_SANDBOX_NETWORK_DISABLED_ENV_VAR.to_string(),
                "1".to_string(),
            );
            let _ = cwd;
            let args = landlock::create_linux_sandbox_command_args(command, writable_roots);
            Ok((helper.to_path_buf(), args))
        }
    }
}

/// Wait for the child while capturing bounded output, racing the wall-clock
/// timeout and the cancellation token. Signals on timeout or cancel go to
/// the whole process group.
async fn wait_with_limits(
    mut child: Child,
    timeout: Duration,
    cancel: &CancellationToken,
    start: Instant,
) -> ExecToolCallOutput {
    let child_pgid: Option<i32> = child.id().map(|pid| pid as i32);

    let stdout_reader = child.stdout.take();
    let stderr_reader = child.stderr.take();
    let stdout_task = tokio::spawn(read_capped(stdout_reader, MAX_STREAM_BYTES));
    let stderr_task = tokio::spawn(read_capped(stderr_reader, MAX_STREAM_BYTES));

    let mut timed_out = false;
    let mut cancelled = false;
    // The wait future borrows the child; scope it so the kill paths below
    // can take the child again.
    let first = {
        let wait = child.wait();
        tokio::pin!(wait);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                cancelled = true;
                None
            }
            _ = tokio::time::sleep(timeout) => {
                timed_out = true;
                None
            }
            status = &mut wait => Some(status),
        }
    };

    let status = match first {
        Some(status) => status,
        None if cancelled => {
            debug!("exec cancelled; signalling process group");
            terminate_then_kill(&mut child, child_pgid).await
        }
        None => kill_now(&mut child, child_pgid).await,
    };

    let stdout = finish_capture(stdout_task).await;
    let stderr = finish_capture(stderr_task).await;
    let duration = start.elapsed();

    let exit_code = match status {
        Ok(status) => exit_code_of(status),
        Err(err) => {
            return ExecToolCallOutput {
                exit_code: 1,
                stdout,
                stderr: StreamOutput {
                    text: format!("failed to wait for command: {err}"),
                    truncated: false,
                },
                duration,
                timed_out,
            };
        }
    };

    ExecToolCallOutput {
        exit_code,
        stdout,
        stderr,
        duration,
        timed_out,
    }
}

/// SIGTERM the group, give it [`KILL_GRACE`] to wind down, then SIGKILL.
#[cfg_attr(not(unix), allow(unused_variables))]
async fn terminate_then_kill(
    child: &mut Child,
    pgid: Option<i32>,
) -> std::io::Result<std::process::ExitStatus> {
    #[cfg(unix)]
    {
        if signal_group(pgid, libc::SIGTERM).is_err() {
            // Group signalling unavailable; fall back to the immediate child.
            let _ = child.start_kill();
        }
        if let Ok(status) = tokio::time::timeout(KILL_GRACE, child.wait()).await {
            return status;
        }
        let _ = signal_group(pgid, libc::SIGKILL);
    }
    let _ = child.start_kill();
    child.wait().await
}

/// SIGKILL the group immediately (timeout path).
#[cfg_attr(not(unix), allow(unused_variables))]
async fn kill_now(
    child: &mut Child,
    pgid: Option<i32>,
) -> std::io::Result<std::process::ExitStatus> {
    #[cfg(unix)]
    let _ = signal_group(pgid, libc::SIGKILL);
    let _ = child.start_kill();
    child.wait().await
}

#[cfg(unix)]
fn signal_group(pgid: Option<i32>, signal: i32) -> std::io::Result<()> {
    let Some(pgid) = pgid else {
        return Err(std::io::Error::other("child pid unavailable"));
    };
    // The child called setpgid(0, 0), so its pid is the pgid.
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

/// Drain `reader` to EOF, retaining at most `cap` bytes. Reading continues
/// past the cap; only retention stops.
async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>, cap: usize) -> StreamOutput {
    let Some(mut reader) = reader else {
        return StreamOutput::default();
    };
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8 * 1024];
    let mut truncated = false;
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        if buf.len() < cap {
            let take = n.min(cap - buf.len());
            buf.extend_from_slice(&chunk[..take]);
            if take < n {
                truncated = true;
            }
        } else {
            truncated = true;
        }
    }
    StreamOutput {
        text: String::from_utf8_lossy(&buf).into_owned(),
        truncated,
    }
}

async fn finish_capture(task: tokio::task::JoinHandle<StreamOutput>) -> StreamOutput {
    task.await.unwrap_or_default()
}

/// Translate common Unix utilities to their Windows equivalents when the
/// host is Windows. Elsewhere the argv passes through untouched.
fn adapt_command_for_platform(command: Vec<String>) -> Vec<String> {
    if !cfg!(windows) {
        return command;
    }
    let Some(first) = command.first() else {
        return command;
    };
    let replacement = match first.as_str() {
        "ls" => "dir",
        "cat" => "type",
        "rm" => "del",
        "cp" => "copy",
        "mv" => "move",
        "grep" => "findstr",
        _ => return command,
    };
    let mut adapted = vec![
        "cmd.exe".to_string(),
        "/c".to_string(),
        replacement.to_string(),
    ];
    adapted.extend(command.into_iter().skip(1));
    adapted
}
