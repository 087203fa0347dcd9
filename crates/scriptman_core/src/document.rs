//! Line-oriented document transforms.
//!
//! Every operation re-parses the whole document on entry; Import values
//! are never carried across edits because the document text itself is the
//! source of truth. Lines inside capture wrapper blocks are left alone
//! here; the wrapper has its own codec.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::capture::wrapper_line_mask;
use crate::config::SiteInfo;
use crate::error::{OperationError, OperationResult};
use crate::escape::escape_regex_literal;
use crate::import::{Import, ImportKind};

/// Result of a pure text transform, distinguishing a pure addition (which
/// the transport can submit as an append) from a full rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextEdit {
    Unchanged,
    Append(String),
    Replace(String),
}

/// Every recognized statement on the document, in line order. Wrapper
/// blocks are skipped; their contents are surfaced by the capture codec.
pub fn parse_imports(text: &str, target: &str, site: &SiteInfo) -> Vec<Import> {
    let lines: Vec<&str> = text.split('\n').collect();
    let mask = wrapper_line_mask(&lines);
    lines
        .iter()
        .zip(mask)
        .filter(|(_, masked)| !masked)
        .filter_map(|(line, _)| Import::from_line(line, target, site))
        .collect()
}

/// Idempotent add: no edit when an equivalent reference is already
/// declared, otherwise the statement lands after the last non-blank line.
pub fn install_text(text: &str, statement: &str, import: &Import, site: &SiteInfo) -> TextEdit {
    if parse_imports(text, &import.target, site)
        .iter()
        .any(|existing| existing.matches(import))
    {
        return TextEdit::Unchanged;
    }

    let mut lines: Vec<&str> = if text.is_empty() {
        Vec::new()
    } else {
        text.split('\n').collect()
    };
    while lines.last().is_some_and(|line| line.trim().is_empty()) {
        lines.pop();
    }
    lines.push(statement);
    let new_text = format!("{}\n", lines.join("\n"));

    // A pure addition keeps the original text as a prefix.
    if new_text.len() > text.len() && new_text.starts_with(text) {
        TextEdit::Append(new_text[text.len()..].to_string())
    } else {
        TextEdit::Replace(new_text)
    }
}

/// Remove every line declaring the reference. Errors when nothing matched,
/// signalling that the reference is not present.
pub fn uninstall_text(text: &str, import: &Import, site: &SiteInfo) -> OperationResult<String> {
    let lines: Vec<&str> = text.split('\n').collect();
    let mask = wrapper_line_mask(&lines);

    let mut kept: Vec<&str> = Vec::new();
    let mut removed = 0usize;
    for (line, masked) in lines.iter().zip(&mask) {
        if !masked
            && Import::from_line(line, &import.target, site)
                .is_some_and(|parsed| parsed.matches(import))
        {
            removed += 1;
            continue;
        }
        kept.push(line);
    }

    if removed == 0 && import.kind() == ImportKind::CrossWiki {
        // Legacy fallback: some very old declarations quote the bare page
        // name in ways the structured parser does not recognize. Match the
        // escaped literal inside a load-call line instead.
        let fallback = cross_wiki_fallback_pattern(import.page().unwrap_or_default());
        kept.clear();
        for (line, masked) in lines.iter().zip(&mask) {
            if !masked && fallback.is_match(line) {
                removed += 1;
                continue;
            }
            kept.push(line);
        }
    }

    if removed == 0 {
        return Err(OperationError::not_found(import.name(), &import.target));
    }
    Ok(kept.join("\n"))
}

/// Comment a declaration out, or back in, preserving indentation exactly.
/// Lines already in the requested state pass through untouched.
pub fn set_disabled_text(
    text: &str,
    import: &Import,
    disabled: bool,
    site: &SiteInfo,
) -> OperationResult<String> {
    let lines: Vec<&str> = text.split('\n').collect();
    let mask = wrapper_line_mask(&lines);

    let mut matched = 0usize;
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    for (line, masked) in lines.iter().zip(&mask) {
        let parsed = if *masked {
            None
        } else {
            Import::from_line(line, &import.target, site)
        };
        match parsed {
            Some(existing) if existing.matches(import) => {
                matched += 1;
                if existing.disabled == disabled {
                    out.push((*line).to_string());
                } else if disabled {
                    let indent = line.len() - line.trim_start().len();
                    out.push(format!("{}//{}", &line[..indent], &line[indent..]));
                } else {
                    let indent = line.len() - line.trim_start().len();
                    let rest = &line[indent..];
                    let rest = rest.strip_prefix("//").unwrap_or(rest);
                    let rest = rest.strip_prefix(' ').unwrap_or(rest);
                    out.push(format!("{}{}", &line[..indent], rest));
                }
            }
            _ => out.push((*line).to_string()),
        }
    }

    if matched == 0 {
        return Err(OperationError::not_found(import.name(), &import.target));
    }
    Ok(out.join("\n"))
}

/// Rewrite every recognized line into canonical serialized form, leaving
/// all other lines untouched and in their original order.
pub fn normalize_text(text: &str, target: &str, site: &SiteInfo) -> String {
    let lines: Vec<&str> = text.split('\n').collect();
    let mask = wrapper_line_mask(&lines);
    lines
        .iter()
        .zip(mask)
        .map(|(line, masked)| {
            if masked {
                return (*line).to_string();
            }
            match Import::from_line(line, target, site) {
                Some(import) => import.to_statement(site, None),
                None => (*line).to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn cross_wiki_fallback_pattern(page: &str) -> Regex {
    // Never matches anything; used when the page name somehow produces an
    // invalid pattern despite literal escaping.
    static NEVER: Lazy<Regex> = Lazy::new(|| Regex::new("[^\\s\\S]").expect("never pattern"));
    let literal = escape_regex_literal(page);
    let pattern = format!(r#"(?i)(?:importScript|mw\.loader\.load)\s*\(\s*['"][^'"]*{literal}"#);
    Regex::new(&pattern).unwrap_or_else(|_| NEVER.clone())
}
