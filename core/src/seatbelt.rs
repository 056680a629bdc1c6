#![cfg(target_os = "macos")]

//! macOS Seatbelt wrapper for the sandbox executor.
//!
//! Builds a `sandbox-exec` invocation whose profile grants read access to the
//! whole disk, write access only to the configured writable roots, and no
//! network access at all.

use std::path::Path;
use std::path::PathBuf;

/// Only trust `sandbox-exec` from `/usr/bin` to defend against a malicious
/// binary earlier on the PATH. If that file has been tampered with, the
/// attacker already has root.
pub(crate) const MACOS_PATH_TO_SEATBELT_EXECUTABLE: &str = "/usr/bin/sandbox-exec";

/// Everything the profile allows unconditionally. Write and network rules are
/// appended per invocation.
const MACOS_SEATBELT_BASE_POLICY: &str = r#"(version 1)
(deny default)
; allow read-only file operations
(allow file-read*)
; child processes inherit the policy of their parent
(allow process-exec)
(allow process-fork)
(allow signal (target same-sandbox))
; allow fcntl and ioctl on already-open descriptors
(allow file-ioctl (literal "/dev/null") (literal "/dev/zero") (literal "/dev/dtracehelper"))
(allow sysctl-read)
(allow mach-lookup)
; /dev/null and friends
(allow file-write-data (literal "/dev/null") (literal "/dev/zero") (literal "/dev/dtracehelper"))
"#;

/// Build the argv passed to `sandbox-exec` (without the executable itself):
/// `-p <profile> -D WRITABLE_ROOT_0=... -- <command...>`.
pub(crate) fn create_seatbelt_command_args(
    command: Vec<String>,
    writable_roots: &[PathBuf],
    cwd: &Path,
) -> Vec<String> {
    let mut roots: Vec<PathBuf> = vec![cwd.to_path_buf()];
    roots.extend(writable_roots.iter().cloned());

    let mut policy_parts: Vec<String> = Vec::new();
    let mut dir_params: Vec<String> = Vec::new();
    for (index, root) in roots.iter().enumerate() {
        // Canonicalize to avoid /var vs /private/var mismatches.
        let canonical = root.canonicalize().unwrap_or_else(|_| root.clone());
        let param = format!("WRITABLE_ROOT_{index}");
        policy_parts.push(format!("(subpath (param \"{param}\"))"));
        dir_params.push(format!("{param}={}", canonical.to_string_lossy()));
    }

    let file_write_policy = format!("(allow file-write*\n{}\n)", policy_parts.join("\n"));
    // No network rule is emitted at all: `(deny default)` covers it.
    let full_policy = format!("{MACOS_SEATBELT_BASE_POLICY}{file_write_policy}");

    let mut args = vec!["-p".to_string(), full_policy];
    for param in dir_params {
        args.push("-D".to_string());
        args.push(param);
    }
    args.push("--".to_string());
    args.extend(command);
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn wraps_the_command_after_a_separator() {
        let args = create_seatbelt_command_args(
            vec!["echo".to_string(), "hi".to_string()],
            &[PathBuf::from("/tmp")],
            Path::new("/workspace"),
        );
        let sep = args.iter().position(|a| a == "--").unwrap();
        assert_eq!(&args[sep + 1..], ["echo".to_string(), "hi".to_string()]);
        assert!(args[1].contains("(deny default)"));
        assert!(args[1].contains("WRITABLE_ROOT_0"));
        assert!(args[1].contains("WRITABLE_ROOT_1"));
        assert!(!args[1].contains("allow network"));
    }
}
