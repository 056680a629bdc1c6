use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Child;
use tokio::process::Command;
use tracing::trace;

/// Set on every child spawned for a shell tool call whose sandbox denies
/// network access, so tooling inside the sandbox can detect the restriction.
pub const QUILL_SANDBOX_NETWORK_DISABLED_ENV_VAR: &str = "QUILL_SANDBOX_NETWORK_DISABLED";

/// Set when the child runs under a platform sandbox; the value names the
/// mechanism (currently "seatbelt" or "landlock").
pub const QUILL_SANDBOX_ENV_VAR: &str = "QUILL_SANDBOX";

#[derive(Debug, Clone, Copy)]
pub(crate) enum StdioPolicy {
    RedirectForShellTool,
}

pub(crate) struct SpawnChildRequest {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub stdio_policy: StdioPolicy,
}

/// Spawn the child for a shell tool call.
///
/// The child is placed in its own process group so a single signal reaches
/// every descendant, and `kill_on_drop` ensures nothing outlives the engine
/// if this process dies.
pub(crate) async fn spawn_child_async(request: SpawnChildRequest) -> std::io::Result<Child> {
    let SpawnChildRequest {
        program,
        args,
        cwd,
        env,
        stdio_policy,
    } = request;

    trace!("spawn_child_async: {program:?} {args:?} {cwd:?} {stdio_policy:?}");

    let mut cmd = Command::new(&program);
    cmd.args(args);
    cmd.current_dir(cwd);
    cmd.env_clear();
    cmd.envs(env);

    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            // New process group; exec.rs signals the group on timeout and
            // cancellation.
            if libc::setpgid(0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    match stdio_policy {
        StdioPolicy::RedirectForShellTool => {
            // Never give the child a stdin file descriptor: several tools
            // (ripgrep among them) heuristically read stdin when it is a TTY
            // or pipe and would hang forever waiting for input.
            cmd.stdin(Stdio::null());
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
    }

    cmd.kill_on_drop(true).spawn()
}
