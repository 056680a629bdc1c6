/// Locate `pattern` within `lines`, never scanning backwards past `start`.
///
/// Matching is attempted in decreasing order of strictness: exact equality
/// first, then with trailing whitespace ignored, then with surrounding
/// whitespace ignored. The gradual relaxation tolerates models that reproduce
/// context lines with mangled indentation while still preferring a verbatim
/// match when one exists.
///
/// When `eof` is set the pattern describes the end of the file, so the tail
/// position is tried before a forward scan.
pub(crate) fn seek_sequence(
    lines: &[String],
    pattern: &[String],
    start: usize,
    eof: bool,
) -> Option<usize> {
    if pattern.is_empty() {
        return Some(start);
    }
    if pattern.len() > lines.len() {
        return None;
    }

    let search_start = if eof && lines.len() >= pattern.len() {
        lines.len() - pattern.len()
    } else {
        start
    };

    for (strictness, matches) in [
        eq_exact as fn(&str, &str) -> bool,
        eq_ignoring_trailing_space,
        eq_ignoring_surrounding_space,
    ]
    .into_iter()
    .enumerate()
    {
        // On relaxed passes an eof anchor that failed at the tail is allowed
        // to fall back to a forward scan from `start`.
        let from = if strictness == 0 { search_start } else { start };
        for i in from..=lines.len().saturating_sub(pattern.len()) {
            if pattern
                .iter()
                .zip(&lines[i..i + pattern.len()])
                .all(|(want, have)| matches(want, have))
            {
                return Some(i);
            }
        }
    }

    None
}

fn eq_exact(want: &str, have: &str) -> bool {
    want == have
}

fn eq_ignoring_trailing_space(want: &str, have: &str) -> bool {
    want.trim_end() == have.trim_end()
}

fn eq_ignoring_surrounding_space(want: &str, have: &str) -> bool {
    want.trim() == have.trim()
}
