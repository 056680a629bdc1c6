//! Linux sandbox wrapper for the sandbox executor.
//!
//! Unlike macOS, where the policy text is embedded directly in the
//! `sandbox-exec` invocation, Linux delegates to a small helper executable
//! that applies Landlock filesystem rules and a no-network seccomp filter
//! before exec'ing the tool command. This module only builds the helper's
//! argv; the helper binary is supplied by the embedder via
//! [`crate::agent::AgentConfig::linux_sandbox_helper`].

use std::path::PathBuf;

/// Convert the writable-roots list into the helper's CLI options:
/// `--sandbox-writable-root <dir>... -- <command...>`.
pub(crate) fn create_linux_sandbox_command_args(
    command: Vec<String>,
    writable_roots: &[PathBuf],
) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    for root in writable_roots {
        args.push("--sandbox-writable-root".to_string());
        args.push(root.to_string_lossy().to_string());
    }
    // Separator so command arguments starting with `-` are not parsed as
    // helper options.
    args.push("--".to_string());
    args.extend(command);
    args
}
