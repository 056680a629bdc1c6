//! Parser for the textual patch envelope.
//!
//! A patch is a blob bracketed by `*** Begin Patch` / `*** End Patch`.
//! Operations inside are introduced by `*** Add File:`, `*** Update File:`
//! (optionally followed by `*** Move to:`), or `*** Delete File:`. Update
//! bodies hold hunks whose lines carry a one-character prefix: `+` insert,
//! `-` remove, ` ` context. `@@` lines anchor a hunk to a context line and
//! `*** End of File` pins the final hunk to the end of the file.

use std::path::Path;
use std::path::PathBuf;

use thiserror::Error;

const BEGIN_PATCH_MARKER: &str = "*** Begin Patch";
const END_PATCH_MARKER: &str = "*** End Patch";
const ADD_FILE_MARKER: &str = "*** Add File: ";
const DELETE_FILE_MARKER: &str = "*** Delete File: ";
const UPDATE_FILE_MARKER: &str = "*** Update File: ";
const MOVE_TO_MARKER: &str = "*** Move to: ";
const EOF_MARKER: &str = "*** End of File";
const HUNK_ANCHOR_MARKER: &str = "@@";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid patch: {0}")]
    InvalidPatchError(String),
    #[error("invalid hunk on line {line_number}: {message}")]
    InvalidHunkError { message: String, line_number: usize },
}

use ParseError::*;

/// One operation of a parsed patch, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hunk {
    AddFile {
        path: PathBuf,
        contents: String,
    },
    DeleteFile {
        path: PathBuf,
    },
    UpdateFile {
        path: PathBuf,
        move_path: Option<PathBuf>,
        /// Chunks are applied top to bottom; the parser guarantees at least
        /// one chunk per update.
        chunks: Vec<UpdateFileChunk>,
    },
}

impl Hunk {
    pub fn resolve_path(&self, cwd: &Path) -> PathBuf {
        let path = match self {
            Hunk::AddFile { path, .. } => path,
            Hunk::DeleteFile { path } => path,
            Hunk::UpdateFile { path, .. } => path,
        };
        if path.is_absolute() {
            path.clone()
        } else {
            cwd.join(path)
        }
    }
}

/// A contiguous region of an Update operation: the old lines to locate in the
/// file and the new lines that replace them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateFileChunk {
    /// Context line named by a preceding `@@` anchor, if any. The applier
    /// seeks this line before matching `old_lines`.
    pub change_context: Option<String>,
    /// Context and removed lines, in file order. Empty when the chunk is a
    /// pure insertion at end of file.
    pub old_lines: Vec<String>,
    /// Context and inserted lines, in file order.
    pub new_lines: Vec<String>,
    /// Set by a trailing `*** End of File` marker; the applier then matches
    /// `old_lines` against the tail of the file only.
    pub is_end_of_file: bool,
}

/// The raw patch text together with its parsed operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPatch {
    pub patch: String,
    pub hunks: Vec<Hunk>,
}

/// Parse a complete patch envelope. Fails closed: any line that is not a
/// recognized marker or a prefixed hunk line is an error.
pub fn parse_patch(patch: &str) -> Result<ParsedPatch, ParseError> {
    let lines: Vec<&str> = patch.trim().lines().collect();
    if lines.first() != Some(&BEGIN_PATCH_MARKER) {
        return Err(InvalidPatchError(format!(
            "the first line of the patch must be '{BEGIN_PATCH_MARKER}'"
        )));
    }
    if lines.last() != Some(&END_PATCH_MARKER) {
        return Err(InvalidPatchError(format!(
            "the last line of the patch must be '{END_PATCH_MARKER}'"
        )));
    }

    let mut hunks = Vec::new();
    // Skip the begin marker; stop before the end marker. line_number is
    // 1-based and points at the marker that opened the current operation.
    let mut index = 1;
    let last = lines.len() - 1;
    while index < last {
        let (hunk, consumed) = parse_one_hunk(&lines[index..last], index + 1)?;
        hunks.push(hunk);
        index += consumed;
    }

    if hunks.is_empty() {
        return Err(InvalidPatchError("patch contains no operations".to_string()));
    }

    Ok(ParsedPatch {
        patch: patch.trim().to_string(),
        hunks,
    })
}

/// Parse one operation starting at `lines[0]`. Returns the hunk and the
/// number of lines consumed.
fn parse_one_hunk(lines: &[&str], line_number: usize) -> Result<(Hunk, usize), ParseError> {
    let first = lines[0];

    if let Some(path) = first.strip_prefix(ADD_FILE_MARKER) {
        let mut contents = String::new();
        let mut consumed = 1;
        for line in &lines[1..] {
            if let Some(added) = line.strip_prefix('+') {
                contents.push_str(added);
                contents.push('\n');
                consumed += 1;
            } else {
                break;
            }
        }
        return Ok((
            Hunk::AddFile {
                path: PathBuf::from(path),
                contents,
            },
            consumed,
        ));
    }

    if let Some(path) = first.strip_prefix(DELETE_FILE_MARKER) {
        return Ok((
            Hunk::DeleteFile {
                path: PathBuf::from(path),
            },
            1,
        ));
    }

    if let Some(path) = first.strip_prefix(UPDATE_FILE_MARKER) {
        let mut consumed = 1;

        let move_path = lines
            .get(1)
            .and_then(|line| line.strip_prefix(MOVE_TO_MARKER))
            .map(PathBuf::from);
        if move_path.is_some() {
            consumed += 1;
        }

        let mut chunks = Vec::new();
        // The chunk currently being accumulated; flushed on `@@`, on a new
        // `***` marker, or at the end of the body.
        let mut current = UpdateFileChunk::default();
        let mut started = false;

        loop {
            let Some(line) = lines.get(consumed) else {
                break;
            };
            let absolute_line = line_number + consumed;

            if line.starts_with("***") {
                if *line == EOF_MARKER {
                    if !started {
                        return Err(InvalidHunkError {
                            message: format!("'{EOF_MARKER}' marker with no preceding hunk lines"),
                            line_number: absolute_line,
                        });
                    }
                    current.is_end_of_file = true;
                    consumed += 1;
                }
                break;
            }

            if let Some(anchor) = line.strip_prefix(HUNK_ANCHOR_MARKER) {
                if started {
                    chunks.push(std::mem::take(&mut current));
                    started = false;
                }
                let anchor = anchor.trim();
                if !anchor.is_empty() {
                    current.change_context = Some(anchor.to_string());
                }
                consumed += 1;
                continue;
            }

            let (prefix, rest) = match line.chars().next() {
                Some('+') => ('+', &line[1..]),
                Some('-') => ('-', &line[1..]),
                Some(' ') => (' ', &line[1..]),
                // A completely empty line is an empty context line; models
                // routinely drop the leading space.
                None => (' ', *line),
                Some(_) => {
                    return Err(InvalidHunkError {
                        message: format!(
                            "unexpected line {line:?}, every hunk line must start with '+', '-', or ' '"
                        ),
                        line_number: absolute_line,
                    });
                }
            };
            started = true;
            match prefix {
                '+' => current.new_lines.push(rest.to_string()),
                '-' => current.old_lines.push(rest.to_string()),
                _ => {
                    current.old_lines.push(rest.to_string());
                    current.new_lines.push(rest.to_string());
                }
            }
            consumed += 1;
        }

        if started {
            chunks.push(current);
        }
        if chunks.is_empty() {
            return Err(InvalidHunkError {
                message: format!("update for {path} contains no hunk lines"),
                line_number,
            });
        }

        return Ok((
            Hunk::UpdateFile {
                path: PathBuf::from(path),
                move_path,
                chunks,
            },
            consumed,
        ));
    }

    Err(InvalidHunkError {
        message: format!(
            "'{first}' is not a valid hunk header; expected one of '{ADD_FILE_MARKER}', '{DELETE_FILE_MARKER}', '{UPDATE_FILE_MARKER}'"
        ),
        line_number,
    })
}
