//! Conservative recognition of `bash -lc` scripts for the safety classifier.
//!
//! The only scripts accepted here are sequences of plain word-only commands
//! joined by the safe operators `&&`, `||`, `|`, and `;`. Everything else --
//! subshells, grouping braces, redirections, substitutions, expansions,
//! control flow, background jobs -- is rejected, as is any script
//! tree-sitter cannot parse cleanly. Unknown node kinds fail closed.

use tree_sitter::Node;
use tree_sitter::Parser;
use tree_sitter::Tree;
use tree_sitter_bash::LANGUAGE as BASH;

/// Parse `script` with tree-sitter-bash. `None` when the grammar fails to
/// load or the source does not parse.
pub fn try_parse_bash(script: &str) -> Option<Tree> {
    let language = BASH.into();
    let mut parser = Parser::new();
    parser.set_language(&language).ok()?;
    parser.parse(script, None)
}

/// Named node kinds that may appear in a word-only command sequence.
const ALLOWED_NODE_KINDS: &[&str] = &[
    "program",
    "list",
    "pipeline",
    "command",
    "command_name",
    "word",
    "string",
    "string_content",
    "raw_string",
    "number",
    "concatenation",
];

/// Punctuation tokens that may appear. Quotes delimit literal strings; the
/// operator tokens are exactly the safe-operator set.
const ALLOWED_PUNCT_TOKENS: &[&str] = &["&&", "||", ";", "|", "\"", "'"];

/// Decompose the parse tree into its simple commands.
///
/// Returns `Some(commands)` -- one argv per command, in source order -- only
/// when every node in the tree is on the allowlist above. The `(`, `)`, `{`,
/// and `}` grouping tokens are plain (anonymous) tokens in the bash grammar,
/// so they are caught by the punctuation check rather than the named-kind
/// check.
pub fn try_parse_word_only_commands_sequence(tree: &Tree, src: &str) -> Option<Vec<Vec<String>>> {
    if tree.root_node().has_error() {
        return None;
    }

    let root = tree.root_node();
    let mut stack = vec![root];
    let mut cursor = root.walk();
    let mut command_nodes = Vec::new();
    while let Some(node) = stack.pop() {
        let kind = node.kind();
        if node.is_named() {
            if !ALLOWED_NODE_KINDS.contains(&kind) {
                return None;
            }
            if kind == "command" {
                command_nodes.push(node);
            }
        } else if !ALLOWED_PUNCT_TOKENS.contains(&kind) && !kind.trim().is_empty() {
            return None;
        }
        for child in node.children(&mut cursor) {
            stack.push(child);
        }
    }

    // The stack walk visits nodes in LIFO order; restore source order.
    command_nodes.sort_by_key(Node::start_byte);

    let mut commands = Vec::with_capacity(command_nodes.len());
    for node in command_nodes {
        commands.push(words_of_command(node, src)?);
    }
    Some(commands)
}

/// Convenience wrapper: the simple commands of a `bash -lc "<script>"` argv,
/// or `None` when the argv is not that shape or the script is not a
/// word-only sequence.
pub fn parse_bash_lc_plain_commands(command: &[String]) -> Option<Vec<Vec<String>>> {
    let [bash, flag, script] = command else {
        return None;
    };
    if bash != "bash" || flag != "-lc" {
        return None;
    }
    let tree = try_parse_bash(script)?;
    try_parse_word_only_commands_sequence(&tree, script)
}

fn words_of_command(cmd: Node, src: &str) -> Option<Vec<String>> {
    if cmd.kind() != "command" {
        return None;
    }
    let mut words = Vec::new();
    let mut cursor = cmd.walk();
    for child in cmd.named_children(&mut cursor) {
        match child.kind() {
            "command_name" => {
                let inner = child.named_child(0)?;
                if inner.kind() != "word" {
                    return None;
                }
                words.push(inner.utf8_text(src.as_bytes()).ok()?.to_owned());
            }
            "word" | "number" => {
                words.push(child.utf8_text(src.as_bytes()).ok()?.to_owned());
            }
            "string" => words.push(literal_double_quoted(child, src)?),
            "raw_string" => words.push(literal_single_quoted(child, src)?),
            "concatenation" => {
                // Pieces like -g"*.py": every part must itself be literal.
                let mut joined = String::new();
                let mut parts = child.walk();
                for part in child.named_children(&mut parts) {
                    match part.kind() {
                        "word" | "number" => {
                            joined.push_str(part.utf8_text(src.as_bytes()).ok()?);
                        }
                        "string" => joined.push_str(&literal_double_quoted(part, src)?),
                        "raw_string" => joined.push_str(&literal_single_quoted(part, src)?),
                        _ => return None,
                    }
                }
                if joined.is_empty() {
                    return None;
                }
                words.push(joined);
            }
            _ => return None,
        }
    }
    Some(words)
}

/// The contents of a double-quoted string, provided it holds no expansions
/// or substitutions.
fn literal_double_quoted(node: Node, src: &str) -> Option<String> {
    let mut cursor = node.walk();
    for part in node.named_children(&mut cursor) {
        if part.kind() != "string_content" {
            return None;
        }
    }
    let raw = node.utf8_text(src.as_bytes()).ok()?;
    raw.strip_prefix('"')
        .and_then(|text| text.strip_suffix('"'))
        .map(str::to_owned)
}

fn literal_single_quoted(node: Node, src: &str) -> Option<String> {
    let raw = node.utf8_text(src.as_bytes()).ok()?;
    raw.strip_prefix('\'')
        .and_then(|text| text.strip_suffix('\''))
        .map(str::to_owned)
}
