//! The read-only command allowlist.
//!
//! A closed set of verbs (with parameter shapes where the verb alone is not
//! enough) that the classifier treats as safe to run without asking the user
//! and without a sandbox. `bash -lc` scripts qualify when every command in
//! the script is on the allowlist and the commands are joined only by the
//! safe operators recognized by [`crate::bash`].

use once_cell::sync::Lazy;
use regex_lite::Regex;

use crate::bash::parse_bash_lc_plain_commands;

/// Why a command was auto-approved, for display next to the command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeCommandReason {
    /// Human-readable sentence fragment, e.g. "View file contents".
    pub reason: String,
    /// Coarse bucket used to group auto-approved commands in a UI,
    /// e.g. "Searching".
    pub group: String,
}

/// True when the argv (or every segment of a safe `bash -lc` composition) is
/// on the read-only allowlist.
pub fn is_known_safe_command(command: &[String]) -> bool {
    assess_safe_command(command).is_some()
}

/// Classify `command`, resolving `bash -lc` compositions. `None` means "not
/// provably read-only".
pub fn assess_safe_command(command: &[String]) -> Option<SafeCommandReason> {
    if let Some(reason) = is_safe_to_call_with_exec(command) {
        return Some(reason);
    }

    // `bash -lc "<script>"`: safe iff the script decomposes into plain
    // commands joined by safe operators and each one passes the allowlist.
    if let Some(all_commands) = parse_bash_lc_plain_commands(command) {
        let mut first: Option<SafeCommandReason> = None;
        for plain in &all_commands {
            let reason = is_safe_to_call_with_exec(plain)?;
            first.get_or_insert(reason);
        }
        return first;
    }

    None
}

/// The allowlist proper: one argv, no shell involved.
pub fn is_safe_to_call_with_exec(command: &[String]) -> Option<SafeCommandReason> {
    let verb = command.first().map(String::as_str)?;

    match verb {
        "cd" | "pwd" => Some(reason("Navigate the workspace", "Navigating")),
        "ls" | "rg" | "grep" | "find" => Some(reason("Search the workspace", "Searching")),
        "cat" | "head" | "tail" | "wc" => Some(reason("View file contents", "Reading files")),
        "true" | "echo" | "which" => Some(reason("No side effects", "Utility")),
        "git" => match command.get(1).map(String::as_str) {
            Some("status" | "branch" | "log" | "diff" | "show") => {
                Some(reason("Inspect repository state", "Using git"))
            }
            _ => None,
        },
        "cargo" => match command.get(1).map(String::as_str) {
            Some("check") => Some(reason("Type-check the project", "Running command")),
            _ => None,
        },
        // `sed -n <N[,M]p> <file>` prints a line range and nothing else.
        "sed" => match command {
            [_, flag, range, _path]
                if flag == "-n" && is_valid_sed_n_arg(Some(range.as_str())) =>
            {
                Some(reason("View file contents", "Reading files"))
            }
            _ => None,
        },
        _ => None,
    }
}

fn reason(text: &str, group: &str) -> SafeCommandReason {
    SafeCommandReason {
        reason: text.to_string(),
        group: group.to_string(),
    }
}

/// Accepts exactly `N p` or `N,M p` print expressions, e.g. `10p`, `5,20p`.
fn is_valid_sed_n_arg(arg: Option<&str>) -> bool {
    static SED_RANGE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^(\d+,)?\d+p$").unwrap()
    });
    arg.is_some_and(|arg| SED_RANGE.is_match(arg))
}
