//! Inline spans: code, bold and italic.
//!
//! Markers without a closing partner are rendered literally.

/// Escape text for HTML element content and attributes.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        push_escaped(&mut out, c);
    }
    out
}

fn push_escaped(out: &mut String, c: char) {
    match c {
        '&' => out.push_str("&amp;"),
        '<' => out.push_str("&lt;"),
        '>' => out.push_str("&gt;"),
        '"' => out.push_str("&quot;"),
        _ => out.push(c),
    }
}

/// Render inline Markdown to HTML.
pub fn render_inline(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    render_chars(&chars, &mut out);
    out
}

fn render_chars(chars: &[char], out: &mut String) {
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];

        if c == '`' {
            if let Some(end) = find(chars, i + 1, &['`']) {
                out.push_str("<code>");
                for &inner in &chars[i + 1..end] {
                    push_escaped(out, inner);
                }
                out.push_str("</code>");
                i = end + 1;
                continue;
            }
        }

        if (c == '*' || c == '_') && opens_emphasis(chars, i) {
            let double = chars.get(i + 1) == Some(&c);
            if double {
                if let Some(end) = find(chars, i + 2, &[c, c]) {
                    if end > i + 2 {
                        out.push_str("<strong>");
                        render_chars(&chars[i + 2..end], out);
                        out.push_str("</strong>");
                        i = end + 2;
                        continue;
                    }
                }
            } else if let Some(end) = find(chars, i + 1, &[c]) {
                if end > i + 1 {
                    out.push_str("<em>");
                    render_chars(&chars[i + 1..end], out);
                    out.push_str("</em>");
                    i = end + 1;
                    continue;
                }
            }
        }

        push_escaped(out, c);
        i += 1;
    }
}

/// `_` only opens emphasis at a word start, so snake_case stays literal.
fn opens_emphasis(chars: &[char], i: usize) -> bool {
    chars[i] == '*' || i == 0 || !chars[i - 1].is_alphanumeric()
}

fn find(chars: &[char], from: usize, pattern: &[char]) -> Option<usize> {
    if from >= chars.len() || pattern.is_empty() {
        return None;
    }
    (from..=chars.len().saturating_sub(pattern.len()))
        .find(|&j| chars[j..j + pattern.len()] == *pattern)
}
