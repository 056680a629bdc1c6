//! The three-way safety classifier for model-proposed commands and patches.
//!
//! Every tool call lands here before anything executes. The outcome is one
//! of: run it (with or without a platform sandbox), ask the user, or reject
//! outright. The classifier is deliberately fail-closed: anything it cannot
//! prove safe under the current policy falls through to the user.

use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;

use quill_apply_patch::Hunk;
use quill_apply_patch::identify_files_added;
use quill_apply_patch::identify_files_needed;
use quill_protocol::ApprovalPolicy;

use crate::exec::SandboxType;
use crate::exec::get_platform_sandbox;
use crate::is_safe_command::assess_safe_command;
use crate::util::normalize_path;
use crate::util::resolve_path;

#[derive(Debug, PartialEq)]
pub enum SafetyCheck {
    AutoApprove {
        /// Human-readable justification, e.g. "Search the workspace".
        reason: String,
        /// Display bucket, e.g. "Searching".
        group: String,
        /// `SandboxType::None` means run raw; anything else means the
        /// command must go through that platform sandbox.
        sandbox_type: SandboxType,
    },
    AskUser,
    Reject {
        reason: String,
    },
}

/// Classify a shell command.
///
/// `approved_session_commands` holds argvs the user already approved with
/// "always" this session; they run unsandboxed without another prompt.
pub fn assess_command_safety(
    command: &[String],
    policy: ApprovalPolicy,
    approved_session_commands: &HashSet<Vec<String>>,
) -> SafetyCheck {
    if approved_session_commands.contains(command) {
        return SafetyCheck::AutoApprove {
            reason: "Approved by the user for this session".to_string(),
            group: "Approved".to_string(),
            sandbox_type: SandboxType::None,
        };
    }

    // The read-only allowlist (including safe `bash -lc` compositions) is
    // auto-approved under every policy, and never needs a sandbox.
    if let Some(safe) = assess_safe_command(command) {
        return SafetyCheck::AutoApprove {
            reason: safe.reason,
            group: safe.group,
            sandbox_type: SandboxType::None,
        };
    }

    match policy {
        ApprovalPolicy::Suggest | ApprovalPolicy::AutoEdit => SafetyCheck::AskUser,
        ApprovalPolicy::FullAuto => match get_platform_sandbox() {
            Some(sandbox_type) => SafetyCheck::AutoApprove {
                reason: "Full-auto mode".to_string(),
                group: "Running command".to_string(),
                sandbox_type,
            },
            // Full-auto demands a sandbox; without one, fall back to asking.
            None => SafetyCheck::AskUser,
        },
    }
}

/// Classify a parsed patch. `hunks` must already be resolved against the
/// effective working directory.
pub fn assess_patch_safety(
    hunks: &[Hunk],
    policy: ApprovalPolicy,
    writable_roots: &[PathBuf],
    cwd: &Path,
) -> SafetyCheck {
    if hunks.is_empty() {
        return SafetyCheck::Reject {
            reason: "empty patch".to_string(),
        };
    }

    match policy {
        ApprovalPolicy::Suggest => SafetyCheck::AskUser,
        ApprovalPolicy::AutoEdit => {
            if is_patch_constrained_to_writable_roots(hunks, writable_roots, cwd) {
                SafetyCheck::AutoApprove {
                    reason: "Patch is confined to the writable roots".to_string(),
                    group: "Editing files".to_string(),
                    sandbox_type: SandboxType::None,
                }
            } else {
                SafetyCheck::AskUser
            }
        }
        ApprovalPolicy::FullAuto => match get_platform_sandbox() {
            Some(sandbox_type) => SafetyCheck::AutoApprove {
                reason: "Full-auto mode".to_string(),
                group: "Editing files".to_string(),
                sandbox_type,
            },
            None => {
                if is_patch_constrained_to_writable_roots(hunks, writable_roots, cwd) {
                    SafetyCheck::AutoApprove {
                        reason: "Patch is confined to the writable roots".to_string(),
                        group: "Editing files".to_string(),
                        sandbox_type: SandboxType::None,
                    }
                } else {
                    SafetyCheck::AskUser
                }
            }
        },
    }
}

/// True when every path the patch reads or creates lies inside some writable
/// root.
fn is_patch_constrained_to_writable_roots(
    hunks: &[Hunk],
    writable_roots: &[PathBuf],
    cwd: &Path,
) -> bool {
    let mut candidates = identify_files_needed(hunks);
    candidates.extend(identify_files_added(hunks));
    // Move targets are writes too.
    for hunk in hunks {
        if let Hunk::UpdateFile {
            move_path: Some(dest),
            ..
        } = hunk
        {
            candidates.push(dest.clone());
        }
    }
    candidates
        .iter()
        .all(|candidate| is_path_in_some_root(candidate, writable_roots, cwd))
}

/// Containment check used for both patch paths and default-root resolution.
///
/// A candidate is inside a root iff, after resolving against `cwd` and
/// lexically normalizing both sides, the root-relative remainder exists, is
/// non-empty, is not absolute, and does not climb out via `..`.
pub(crate) fn is_path_in_some_root(
    candidate: &Path,
    writable_roots: &[PathBuf],
    cwd: &Path,
) -> bool {
    let resolved = normalize_path(&resolve_path(cwd, candidate));
    writable_roots.iter().any(|root| {
        if !root.is_absolute() {
            return false;
        }
        let root = normalize_path(root);
        match resolved.strip_prefix(&root) {
            Ok(relative) => {
                !relative.as_os_str().is_empty()
                    && !relative.is_absolute()
                    && !relative.starts_with("..")
            }
            Err(_) => false,
        }
    })
}
