//! String escaping helpers for the embedded statement grammar.

/// Escape a string for inclusion in a single- or double-quoted JS string
/// literal. Exactly six characters are rewritten: the two quote kinds, the
/// backslash, and the four line-terminator code points.
pub fn escape_js_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            other => out.push(other),
        }
    }
    out
}

/// Inverse of [`escape_js_string`]. Only the sequences produced by the
/// serializer are decoded; any other backslash pair passes through intact,
/// backslash included.
pub fn unescape_js_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('"') => out.push('"'),
            Some('\'') => out.push('\''),
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('u') => {
                let digits: String = chars.clone().take(4).collect();
                match digits.as_str() {
                    "2028" => {
                        out.push('\u{2028}');
                        for _ in 0..4 {
                            chars.next();
                        }
                    }
                    "2029" => {
                        out.push('\u{2029}');
                        for _ in 0..4 {
                            chars.next();
                        }
                    }
                    _ => out.push_str("\\u"),
                }
            }
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Escape a literal string for interpolation into a regex pattern.
pub fn escape_regex_literal(value: &str) -> String {
    regex::escape(value)
}
