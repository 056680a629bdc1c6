//! Patch engine for the `apply_patch` tool.
//!
//! Parses the textual patch envelope into add/update/delete operations,
//! applies them against the filesystem in declaration order, and reports the
//! set of files each patch reads and creates so callers can run pre-flight
//! path checks before anything touches disk.
//!
//! There is deliberately no rollback: the engine stops at the first failing
//! operation and reports it. Callers are expected to run inside a
//! version-controlled workspace.

mod parser;
mod seek_sequence;

use std::path::Path;
use std::path::PathBuf;
use std::str::Utf8Error;

use anyhow::Context;
use once_cell::sync::Lazy;
use thiserror::Error;
use tree_sitter::LanguageError;
use tree_sitter::Parser;
use tree_sitter::Query;
use tree_sitter::QueryCursor;
use tree_sitter::StreamingIterator;
use tree_sitter_bash::LANGUAGE as BASH;

pub use parser::Hunk;
pub use parser::ParseError;
pub use parser::ParsedPatch;
pub use parser::UpdateFileChunk;
pub use parser::parse_patch;

/// Command names recognized as invocations of the patch tool.
pub const APPLY_PATCH_TOOL_NAMES: [&str; 2] = ["apply_patch", "applypatch"];

#[derive(Debug, Error, PartialEq)]
pub enum ApplyPatchError {
    #[error(transparent)]
    ParseError(#[from] ParseError),
    #[error(transparent)]
    IoError(#[from] IoError),
    /// The file exists but a hunk's context could not be located in it.
    #[error("{0}")]
    ComputeReplacements(String),
}

impl From<std::io::Error> for ApplyPatchError {
    fn from(err: std::io::Error) -> Self {
        ApplyPatchError::IoError(IoError {
            context: "I/O error".to_string(),
            source: err,
        })
    }
}

#[derive(Debug, Error)]
#[error("{context}: {source}")]
pub struct IoError {
    context: String,
    #[source]
    source: std::io::Error,
}

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.context == other.context && self.source.to_string() == other.source.to_string()
    }
}

/// Outcome of probing an argv for a patch-tool invocation.
#[derive(Debug, PartialEq)]
pub enum MaybeApplyPatch {
    Body(PatchInvocation),
    /// The argv was `bash -lc` but the script could not be parsed at all.
    ShellParseError(ExtractHeredocError),
    /// The argv was a patch invocation but the patch body is malformed.
    PatchParseError(ParseError),
    NotApplyPatch,
}

/// A recognized patch invocation: the raw body, its parsed operations, and
/// the working directory a `cd x && apply_patch` wrapper selected.
#[derive(Debug, PartialEq)]
pub struct PatchInvocation {
    pub patch: String,
    pub hunks: Vec<Hunk>,
    pub workdir: Option<String>,
}

/// Recognize `["apply_patch", BODY]` and the heredoc form
/// `["bash", "-lc", "apply_patch <<'EOF' ..."]`.
pub fn maybe_parse_apply_patch(argv: &[String]) -> MaybeApplyPatch {
    match argv {
        [cmd, body] if APPLY_PATCH_TOOL_NAMES.contains(&cmd.as_str()) => match parse_patch(body) {
            Ok(parsed) => MaybeApplyPatch::Body(PatchInvocation {
                patch: parsed.patch,
                hunks: parsed.hunks,
                workdir: None,
            }),
            Err(e) => MaybeApplyPatch::PatchParseError(e),
        },
        [bash, flag, script] if bash == "bash" && flag == "-lc" => {
            match extract_apply_patch_from_bash(script) {
                Ok((body, workdir)) => match parse_patch(&body) {
                    Ok(parsed) => MaybeApplyPatch::Body(PatchInvocation {
                        patch: parsed.patch,
                        hunks: parsed.hunks,
                        workdir,
                    }),
                    Err(e) => MaybeApplyPatch::PatchParseError(e),
                },
                Err(ExtractHeredocError::NotAnApplyPatchInvocation) => {
                    MaybeApplyPatch::NotApplyPatch
                }
                Err(e) => MaybeApplyPatch::ShellParseError(e),
            }
        }
        _ => MaybeApplyPatch::NotApplyPatch,
    }
}

#[derive(Debug, PartialEq)]
pub enum ExtractHeredocError {
    NotAnApplyPatchInvocation,
    FailedToLoadBashGrammar(LanguageError),
    HeredocNotUtf8(Utf8Error),
    FailedToParseScript,
}

/// Extract the heredoc body (and the optional `cd` workdir) from a `bash -lc`
/// script that invokes the patch tool via a heredoc.
///
/// Two whole-script forms are accepted, each as the only top-level statement:
///
/// - `apply_patch <<'EOF' ... EOF`
/// - `cd <path> && apply_patch <<'EOF' ... EOF`
///
/// The query anchors the redirected statement to the start and end of the
/// program so scripts with leading or trailing commands fall through. Both
/// quoted and unquoted heredoc delimiters parse to the same tree, so a single
/// pair of patterns covers them. Scripts with more than one heredoc do not
/// match the anchored shape and are rejected here.
fn extract_apply_patch_from_bash(
    src: &str,
) -> Result<(String, Option<String>), ExtractHeredocError> {
    static HEREDOC_QUERY: Lazy<Query> = Lazy::new(|| {
        let language = BASH.into();
        Query::new(
            &language,
            r#"
            (
              program
                . (redirected_statement
                    body: (command
                            name: (command_name (word) @tool_name) .)
                    (#any-of? @tool_name "apply_patch" "applypatch")
                    redirect: (heredoc_redirect
                                . (heredoc_start)
                                . (heredoc_body) @heredoc
                                . (heredoc_end)
                                .))
                .)

            (
              program
                . (redirected_statement
                    body: (list
                            . (command
                                name: (command_name (word) @cd_name) .
                                argument: [
                                  (word) @cd_path
                                  (string (string_content) @cd_path)
                                  (raw_string) @cd_raw_string
                                ] .)
                            "&&"
                            . (command
                                name: (command_name (word) @tool_name))
                            .)
                    (#eq? @cd_name "cd")
                    (#any-of? @tool_name "apply_patch" "applypatch")
                    redirect: (heredoc_redirect
                                . (heredoc_start)
                                . (heredoc_body) @heredoc
                                . (heredoc_end)
                                .))
                .)
            "#,
        )
        .expect("valid bash query")
    });

    let language = BASH.into();
    let mut parser = Parser::new();
    parser
        .set_language(&language)
        .map_err(ExtractHeredocError::FailedToLoadBashGrammar)?;
    let tree = parser
        .parse(src, None)
        .ok_or(ExtractHeredocError::FailedToParseScript)?;

    let bytes = src.as_bytes();
    let mut cursor = QueryCursor::new();
    let mut matches = cursor.matches(&HEREDOC_QUERY, tree.root_node(), bytes);
    while let Some(m) = matches.next() {
        let mut heredoc: Option<String> = None;
        let mut workdir: Option<String> = None;
        for capture in m.captures.iter() {
            let name = HEREDOC_QUERY.capture_names()[capture.index as usize];
            let text = capture
                .node
                .utf8_text(bytes)
                .map_err(ExtractHeredocError::HeredocNotUtf8)?;
            match name {
                "heredoc" => heredoc = Some(text.trim_end_matches('\n').to_string()),
                "cd_path" => workdir = Some(text.to_string()),
                "cd_raw_string" => {
                    let trimmed = text
                        .strip_prefix('\'')
                        .and_then(|s| s.strip_suffix('\''))
                        .unwrap_or(text);
                    workdir = Some(trimmed.to_string());
                }
                _ => {}
            }
        }
        if let Some(body) = heredoc {
            return Ok((body, workdir));
        }
    }

    Err(ExtractHeredocError::NotAnApplyPatchInvocation)
}

/// Paths an operation reads: Update and Delete targets, which must pre-exist.
pub fn identify_files_needed(hunks: &[Hunk]) -> Vec<PathBuf> {
    hunks
        .iter()
        .filter_map(|hunk| match hunk {
            Hunk::AddFile { .. } => None,
            Hunk::DeleteFile { path } => Some(path.clone()),
            Hunk::UpdateFile { path, .. } => Some(path.clone()),
        })
        .collect()
}

/// Paths an operation creates: Add targets, which must not pre-exist.
pub fn identify_files_added(hunks: &[Hunk]) -> Vec<PathBuf> {
    hunks
        .iter()
        .filter_map(|hunk| match hunk {
            Hunk::AddFile { path, .. } => Some(path.clone()),
            _ => None,
        })
        .collect()
}

/// Return a copy of `hunks` with every path (including move targets)
/// resolved against `cwd`.
pub fn resolve_hunks(hunks: &[Hunk], cwd: &Path) -> Vec<Hunk> {
    let resolve = |path: &Path| -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            cwd.join(path)
        }
    };
    hunks
        .iter()
        .map(|hunk| match hunk {
            Hunk::AddFile { path, contents } => Hunk::AddFile {
                path: resolve(path),
                contents: contents.clone(),
            },
            Hunk::DeleteFile { path } => Hunk::DeleteFile {
                path: resolve(path),
            },
            Hunk::UpdateFile {
                path,
                move_path,
                chunks,
            } => Hunk::UpdateFile {
                path: resolve(path),
                move_path: move_path.as_deref().map(resolve),
                chunks: chunks.clone(),
            },
        })
        .collect()
}

/// Files touched by a successfully applied patch, in git-status vocabulary.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AffectedPaths {
    pub added: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
}

/// Parse `patch` and apply it, writing a summary to `stdout` and diagnostics
/// to `stderr`.
pub fn apply_patch(
    patch: &str,
    stdout: &mut impl std::io::Write,
    stderr: &mut impl std::io::Write,
) -> Result<AffectedPaths, ApplyPatchError> {
    let parsed = match parse_patch(patch) {
        Ok(parsed) => parsed,
        Err(e) => {
            writeln!(stderr, "{e}").map_err(ApplyPatchError::from)?;
            return Err(ApplyPatchError::ParseError(e));
        }
    };
    apply_hunks(&parsed.hunks, stdout, stderr)
}

/// Apply already-parsed hunks, in declaration order.
pub fn apply_hunks(
    hunks: &[Hunk],
    stdout: &mut impl std::io::Write,
    stderr: &mut impl std::io::Write,
) -> Result<AffectedPaths, ApplyPatchError> {
    match apply_hunks_to_files(hunks) {
        Ok(affected) => {
            print_summary(&affected, stdout).map_err(ApplyPatchError::from)?;
            Ok(affected)
        }
        Err(err) => {
            let message = format!("{err:#}");
            writeln!(stderr, "{message}").map_err(ApplyPatchError::from)?;
            match err.downcast::<ApplyPatchError>() {
                Ok(inner) => Err(inner),
                Err(other) => Err(ApplyPatchError::IoError(IoError {
                    context: message,
                    source: std::io::Error::other(other),
                })),
            }
        }
    }
}

fn apply_hunks_to_files(hunks: &[Hunk]) -> anyhow::Result<AffectedPaths> {
    if hunks.is_empty() {
        anyhow::bail!("no files were modified");
    }

    let mut affected = AffectedPaths::default();
    for hunk in hunks {
        match hunk {
            Hunk::AddFile { path, contents } => {
                if path.exists() {
                    anyhow::bail!("Add File {} failed: file already exists", path.display());
                }
                if let Some(parent) = path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("failed to create parent directories for {}", path.display())
                    })?;
                }
                std::fs::write(path, contents)
                    .with_context(|| format!("failed to write file {}", path.display()))?;
                affected.added.push(path.clone());
            }
            Hunk::DeleteFile { path } => {
                std::fs::remove_file(path)
                    .with_context(|| format!("failed to delete file {}", path.display()))?;
                affected.deleted.push(path.clone());
            }
            Hunk::UpdateFile {
                path,
                move_path,
                chunks,
            } => {
                let new_contents = derive_new_contents_from_chunks(path, chunks)?;
                match move_path {
                    Some(dest) => {
                        if let Some(parent) = dest.parent()
                            && !parent.as_os_str().is_empty()
                        {
                            std::fs::create_dir_all(parent).with_context(|| {
                                format!(
                                    "failed to create parent directories for {}",
                                    dest.display()
                                )
                            })?;
                        }
                        std::fs::write(dest, new_contents)
                            .with_context(|| format!("failed to write file {}", dest.display()))?;
                        std::fs::remove_file(path).with_context(|| {
                            format!("failed to remove original {}", path.display())
                        })?;
                        affected.modified.push(dest.clone());
                    }
                    None => {
                        std::fs::write(path, new_contents)
                            .with_context(|| format!("failed to write file {}", path.display()))?;
                        affected.modified.push(path.clone());
                    }
                }
            }
        }
    }
    Ok(affected)
}

/// Compute the full post-patch contents of the file at `path`.
fn derive_new_contents_from_chunks(
    path: &Path,
    chunks: &[UpdateFileChunk],
) -> Result<String, ApplyPatchError> {
    let original = std::fs::read_to_string(path).map_err(|err| {
        ApplyPatchError::IoError(IoError {
            context: format!("failed to read file to update {}", path.display()),
            source: err,
        })
    })?;

    let mut lines: Vec<String> = original.split('\n').map(String::from).collect();
    // Drop the empty tail produced by a trailing newline so line counts match
    // standard diff behavior.
    if lines.last().is_some_and(String::is_empty) {
        lines.pop();
    }

    let replacements = compute_replacements(&lines, path, chunks)?;
    let mut new_lines = apply_replacements(lines, &replacements);
    if !new_lines.last().is_some_and(String::is_empty) {
        new_lines.push(String::new());
    }
    Ok(new_lines.join("\n"))
}

/// Locate every chunk in the file, returning `(start, old_len, new_lines)`
/// triples. The cursor only moves forward, so chunks apply strictly top to
/// bottom and a context that repeats earlier in the file cannot be matched
/// twice.
fn compute_replacements(
    original_lines: &[String],
    path: &Path,
    chunks: &[UpdateFileChunk],
) -> Result<Vec<(usize, usize, Vec<String>)>, ApplyPatchError> {
    let mut replacements: Vec<(usize, usize, Vec<String>)> = Vec::new();
    let mut cursor: usize = 0;

    for chunk in chunks {
        if let Some(anchor) = &chunk.change_context {
            match seek_sequence::seek_sequence(
                original_lines,
                std::slice::from_ref(anchor),
                cursor,
                false,
            ) {
                Some(idx) => cursor = idx + 1,
                None => {
                    return Err(ApplyPatchError::ComputeReplacements(format!(
                        "failed to find context '{}' in {}",
                        anchor,
                        path.display()
                    )));
                }
            }
        }

        if chunk.old_lines.is_empty() {
            // Pure addition: append at the end of the file (before a trailing
            // blank line when one exists).
            let insertion_idx = if original_lines.last().is_some_and(String::is_empty) {
                original_lines.len() - 1
            } else {
                original_lines.len()
            };
            replacements.push((insertion_idx, 0, chunk.new_lines.clone()));
            continue;
        }

        let mut pattern: &[String] = &chunk.old_lines;
        let mut replacement: &[String] = &chunk.new_lines;
        let mut found =
            seek_sequence::seek_sequence(original_lines, pattern, cursor, chunk.is_end_of_file);

        if found.is_none() && pattern.last().is_some_and(String::is_empty) {
            // A trailing empty pattern line stands for the final newline of
            // the replaced region; it is already stripped from
            // `original_lines`, so retry without it.
            pattern = &pattern[..pattern.len() - 1];
            if replacement.last().is_some_and(String::is_empty) {
                replacement = &replacement[..replacement.len() - 1];
            }
            found =
                seek_sequence::seek_sequence(original_lines, pattern, cursor, chunk.is_end_of_file);
        }

        match found {
            Some(start) => {
                replacements.push((start, pattern.len(), replacement.to_vec()));
                cursor = start + pattern.len();
            }
            None => {
                return Err(ApplyPatchError::ComputeReplacements(format!(
                    "failed to find expected lines in {}:\n{}",
                    path.display(),
                    chunk.old_lines.join("\n")
                )));
            }
        }
    }

    replacements.sort_by_key(|(start, _, _)| *start);
    Ok(replacements)
}

fn apply_replacements(
    mut lines: Vec<String>,
    replacements: &[(usize, usize, Vec<String>)],
) -> Vec<String> {
    // Apply back to front so earlier replacements do not shift later indices.
    for (start, old_len, new_segment) in replacements.iter().rev() {
        let end = (start + old_len).min(lines.len());
        lines.splice(*start..end, new_segment.iter().cloned());
    }
    lines
}

/// Write the git-style summary of an applied patch.
pub fn print_summary(
    affected: &AffectedPaths,
    out: &mut impl std::io::Write,
) -> std::io::Result<()> {
    writeln!(out, "Success. Updated the following files:")?;
    for path in &affected.added {
        writeln!(out, "A {}", path.display())?;
    }
    for path in &affected.modified {
        writeln!(out, "M {}", path.display())?;
    }
    for path in &affected.deleted {
        writeln!(out, "D {}", path.display())?;
    }
    Ok(())
}
