//! Lenient, line-based block parser.
//!
//! A block is finalized only once complete lines decide where it ends, so
//! parsing a prefix of a document never finalizes anything that parsing the
//! whole document would split differently. With `at_eof` the input is taken
//! as final: the last line counts as complete and open constructs close.

use crate::block::Block;

struct Line<'a> {
    text: &'a str,
    /// Byte offset just past the line (and its newline)
    end: usize,
    complete: bool,
}

enum Peek<'l, 'a> {
    Line(&'l Line<'a>),
    /// The next line may still change
    Pending,
    End,
}

fn split_lines(input: &str, at_eof: bool) -> Vec<Line<'_>> {
    let mut lines = Vec::new();
    let mut start = 0;
    while start < input.len() {
        match input[start..].find('\n') {
            Some(offset) => {
                let end = start + offset + 1;
                lines.push(Line {
                    text: input[start..start + offset].trim_end_matches('\r'),
                    end,
                    complete: true,
                });
                start = end;
            }
            None => {
                lines.push(Line {
                    text: input[start..].trim_end_matches('\r'),
                    end: input.len(),
                    complete: at_eof,
                });
                start = input.len();
            }
        }
    }
    lines
}

fn peek<'l, 'a>(lines: &'l [Line<'a>], j: usize, at_eof: bool) -> Peek<'l, 'a> {
    match lines.get(j) {
        Some(line) if line.complete => Peek::Line(line),
        Some(_) => Peek::Pending,
        None if at_eof => Peek::End,
        None => Peek::Pending,
    }
}

/// Parse as many complete blocks as `input` determines.
///
/// Returns the blocks and the number of bytes they (and any blank lines
/// between them) span. With `at_eof` everything is consumed.
pub fn parse_blocks(input: &str, at_eof: bool) -> (Vec<Block>, usize) {
    let lines = split_lines(input, at_eof);
    let mut blocks = Vec::new();
    let mut consumed = 0;
    let mut i = 0;

    while i < lines.len() {
        let line = &lines[i];
        if !line.complete {
            break;
        }
        if line.text.trim().is_empty() {
            consumed = line.end;
            i += 1;
            continue;
        }
        match scan_block(&lines, i, at_eof) {
            Some((block, next)) => {
                blocks.push(block);
                consumed = lines[next - 1].end;
                i = next;
            }
            None => break,
        }
    }

    (blocks, consumed)
}

/// Parse a whole document.
pub fn parse_document(text: &str) -> Vec<Block> {
    parse_blocks(text, true).0
}

/// The block starting at line `i` and the index of the first line after
/// it, or `None` while its end is still undecided.
fn scan_block(lines: &[Line<'_>], i: usize, at_eof: bool) -> Option<(Block, usize)> {
    let text = lines[i].text;

    if let Some(level) = heading_level(text) {
        let content = text.trim_start().trim_start_matches('#');
        return Some((Block::heading(level, content), i + 1));
    }

    if is_thematic_break(text) {
        return Some((Block::thematic_break(), i + 1));
    }

    if let Some((marker, run, info)) = fence_open(text) {
        let mut j = i + 1;
        loop {
            match peek(lines, j, at_eof) {
                Peek::Pending => return None,
                Peek::End => {
                    let body: Vec<&str> = lines[i + 1..j].iter().map(|l| l.text).collect();
                    return Some((Block::code(info, &body, false), j));
                }
                Peek::Line(line) if is_fence_close(line.text, marker, run) => {
                    let body: Vec<&str> = lines[i + 1..j].iter().map(|l| l.text).collect();
                    return Some((Block::code(info, &body, true), j + 1));
                }
                Peek::Line(_) => j += 1,
            }
        }
    }

    if is_table_row(text) {
        let end = scan_until(lines, i + 1, at_eof, |l| !is_table_row(l))?;
        let rows: Vec<&str> = lines[i..end].iter().map(|l| l.text).collect();
        return Some((Block::table(&rows), end));
    }

    if let Some((ordered, _)) = list_marker(text) {
        let end = scan_until(lines, i + 1, at_eof, |l| {
            if l.trim().is_empty() {
                return true;
            }
            match list_marker(l) {
                Some((kind, _)) if kind == ordered => false,
                _ => !is_indented(l),
            }
        })?;
        let mut items: Vec<String> = Vec::new();
        for line in &lines[i..end] {
            match list_marker(line.text) {
                Some((kind, content)) if kind == ordered => items.push(content.trim().to_string()),
                _ => {
                    if let Some(last) = items.last_mut() {
                        last.push(' ');
                        last.push_str(line.text.trim());
                    }
                }
            }
        }
        return Some((Block::list(ordered, &items), end));
    }

    let end = scan_until(lines, i + 1, at_eof, |l| {
        l.trim().is_empty() || starts_block(l)
    })?;
    let body: Vec<&str> = lines[i..end].iter().map(|l| l.text).collect();
    Some((Block::paragraph(&body), end))
}

/// Index of the first line from `j` for which `stop` holds, or the end of
/// input. `None` if a pending line is reached first.
fn scan_until(
    lines: &[Line<'_>],
    mut j: usize,
    at_eof: bool,
    stop: impl Fn(&str) -> bool,
) -> Option<usize> {
    loop {
        match peek(lines, j, at_eof) {
            Peek::Pending => return None,
            Peek::End => return Some(j),
            Peek::Line(line) if stop(line.text) => return Some(j),
            Peek::Line(_) => j += 1,
        }
    }
}

fn starts_block(text: &str) -> bool {
    heading_level(text).is_some()
        || is_thematic_break(text)
        || fence_open(text).is_some()
        || is_table_row(text)
        || list_marker(text).is_some()
}

fn heading_level(text: &str) -> Option<u8> {
    let t = text.trim_start();
    let hashes = t.chars().take_while(|c| *c == '#').count();
    let rest = &t[hashes..];
    ((1..=6).contains(&hashes) && (rest.is_empty() || rest.starts_with(' '))).then_some(hashes as u8)
}

fn is_thematic_break(text: &str) -> bool {
    let compact: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    compact.len() >= 3
        && matches!(compact[0], '-' | '*' | '_')
        && compact.iter().all(|c| *c == compact[0])
}

/// Fence character, run length and info string of an opening fence.
fn fence_open(text: &str) -> Option<(char, usize, &str)> {
    let t = text.trim_start();
    let marker = t.chars().next().filter(|c| *c == '`' || *c == '~')?;
    let run = t.chars().take_while(|c| *c == marker).count();
    if run < 3 {
        return None;
    }
    let info = t[run..].trim();
    if marker == '`' && info.contains('`') {
        return None;
    }
    Some((marker, run, info))
}

fn is_fence_close(text: &str, marker: char, run: usize) -> bool {
    let t = text.trim();
    t.chars().count() >= run && t.chars().all(|c| c == marker)
}

fn is_table_row(text: &str) -> bool {
    text.trim_start().starts_with('|')
}

/// Whether the line opens a list item, and its content.
fn list_marker(text: &str) -> Option<(bool, &str)> {
    let t = text.trim_start();
    for bullet in ["- ", "* ", "+ "] {
        if let Some(rest) = t.strip_prefix(bullet) {
            return Some((false, rest));
        }
    }
    let digits = t.chars().take_while(|c| c.is_ascii_digit()).count();
    if (1..=9).contains(&digits) {
        let rest = &t[digits..];
        if let Some(rest) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return Some((true, rest));
        }
    }
    None
}

fn is_indented(text: &str) -> bool {
    text.starts_with("  ") || text.starts_with('\t')
}
