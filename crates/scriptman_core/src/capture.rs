//! Capture wrapper codec.
//!
//! A capture wrapper is a contiguous marker-delimited block that defers
//! execution of one or more load statements behind a runtime feature
//! check. The engine treats it as an alternate document shape: `decode`
//! extracts the item list, `render` regenerates the whole block from
//! scratch as a pure function of that list, and the `capture_text` /
//! `decapture_text` transforms move references between plain statement
//! lines and wrapper items.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::config::SiteInfo;
use crate::error::{OperationError, OperationResult};
use crate::import::Import;

pub const CAPTURE_START: &str = "// SM-CAPTURE-START";
pub const CAPTURE_END: &str = "// SM-CAPTURE-END";
pub const ITEM_START: &str = "// SM-CAPTURE-ITEM-START";
pub const ITEM_END: &str = "// SM-CAPTURE-ITEM-END";

/// One entry inside a capture wrapper. `load_call` is the exact statement
/// text to execute; `key` mirrors the owning Import's identity key when it
/// was derivable at capture time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureItem {
    pub key: String,
    pub name: String,
    pub load_call: String,
}

static KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"key\s*:\s*("(?:\\.|[^"\\])*")"#).expect("key pattern"));
static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"name\s*:\s*("(?:\\.|[^"\\])*")"#).expect("name pattern"));
static LOAD_CALL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?x)
        mw\.loader\.load \s* \( \s*
        (?: '(?:\\.|[^'\\])*' | "(?:\\.|[^"\\])*" )
        \s* (?: , \s* (?:'[^']*'|"[^"]*") \s* )?
        \) \s* ;?
        "#,
    )
    .expect("load call pattern")
});

/// Decode every wrapper block in the document into a deduplicated item
/// list. Malformed blocks and items degrade to "no items" so an unrelated
/// edit never destroys a wrapper it cannot understand.
pub fn decode(text: &str) -> Vec<CaptureItem> {
    let lines: Vec<&str> = text.split('\n').collect();
    let mut items: Vec<CaptureItem> = Vec::new();

    for (start, end) in block_ranges(&lines) {
        let body = &lines[start + 1..end];
        let regions = item_regions(body);
        if regions.is_empty() {
            // Legacy single-item form: no item markers, the whole block
            // body is one item.
            match decode_item(body) {
                Some(item) => push_unique(&mut items, item),
                None => debug!("capture block without a decodable load call; ignoring"),
            }
            continue;
        }
        for (item_start, item_end) in regions {
            match decode_item(&body[item_start + 1..item_end]) {
                Some(item) => push_unique(&mut items, item),
                None => debug!("skipping malformed capture item"),
            }
        }
    }

    items
}

/// Regenerate the full wrapper text from an item list. Deterministic and
/// independent of any prior wrapper formatting, so repeated
/// capture/decapture cycles converge.
pub fn render(items: &[CaptureItem]) -> String {
    let mut lines: Vec<String> = Vec::new();
    lines.push(CAPTURE_START.to_string());
    lines.push("// Generated block. Tools rewrite everything between these markers.".to_string());
    lines.push("( function () {".to_string());
    lines.push("    var entries = [".to_string());
    for item in items {
        lines.push(ITEM_START.to_string());
        lines.push(format!(
            "        {{ key: {}, name: {}, fn: function () {{ {} }} }},",
            json_string(&item.key),
            json_string(&item.name),
            item.load_call
        ));
        lines.push(ITEM_END.to_string());
    }
    lines.push("    ];".to_string());
    lines.push("    var runAll = function () {".to_string());
    lines.push("        entries.forEach( function ( entry ) { entry.fn(); } );".to_string());
    lines.push("    };".to_string());
    lines.push("    if ( window.smCaptureEnabled ) {".to_string());
    lines.push("        var handled = false;".to_string());
    lines.push(
        "        mw.hook( 'scriptman.capture' ).fire( entries, function () { handled = true; } );"
            .to_string(),
    );
    lines.push("        setTimeout( function () { if ( !handled ) { runAll(); } }, 2000 );".to_string());
    lines.push("    } else {".to_string());
    lines.push("        runAll();".to_string());
    lines.push("    }".to_string());
    lines.push("}() );".to_string());
    lines.push(CAPTURE_END.to_string());
    lines.join("\n")
}

/// Move a reference into the wrapper: drop any equivalent existing item,
/// drop its plain statement lines from the body, and append a freshly
/// rendered wrapper holding the surviving items plus the new one.
pub fn capture_text(text: &str, import: &Import, display_name: &str, site: &SiteInfo) -> String {
    let load_call = import.to_load_call(site);
    let mut items = decode(text);
    items.retain(|item| !item_matches(item, import, &load_call));
    items.push(CaptureItem {
        key: import.key(),
        name: display_name.to_string(),
        load_call,
    });

    let mut body = strip_wrapper_blocks(text);
    body.retain(|line| {
        !Import::from_line(line, &import.target, site).is_some_and(|parsed| parsed.matches(import))
    });
    join_with_block(body, Some(render(&items)))
}

/// Inverse of [`capture_text`]: remove the matching item, re-insert a
/// plain canonical statement when none survives in the body, and re-render
/// the wrapper with the remaining items (or drop it entirely when empty).
pub fn decapture_text(text: &str, import: &Import, site: &SiteInfo) -> OperationResult<String> {
    let load_call = import.to_load_call(site);
    let items = decode(text);
    let remaining: Vec<CaptureItem> = items
        .iter()
        .filter(|item| !item_matches(item, import, &load_call))
        .cloned()
        .collect();
    if remaining.len() == items.len() {
        return Err(OperationError::not_found(import.name(), &import.target));
    }

    let mut body = strip_wrapper_blocks(text);
    let already_plain = body.iter().any(|line| {
        Import::from_line(line, &import.target, site).is_some_and(|parsed| parsed.matches(import))
    });
    if !already_plain {
        while body.last().is_some_and(|line| line.trim().is_empty()) {
            body.pop();
        }
        body.push(import.to_statement(site, None));
    }

    let block = if remaining.is_empty() {
        None
    } else {
        Some(render(&remaining))
    };
    Ok(join_with_block(body, block))
}

/// Whether any wrapper item on the document refers to this import.
pub fn is_captured(text: &str, import: &Import, site: &SiteInfo) -> bool {
    let load_call = import.to_load_call(site);
    decode(text)
        .iter()
        .any(|item| item_matches(item, import, &load_call))
}

/// Marks every line that belongs to a well-formed wrapper block, markers
/// included. The plain-statement transforms never touch masked lines.
pub(crate) fn wrapper_line_mask(lines: &[&str]) -> Vec<bool> {
    let mut mask = vec![false; lines.len()];
    for (start, end) in block_ranges(lines) {
        for flag in &mut mask[start..=end] {
            *flag = true;
        }
    }
    mask
}

fn block_ranges(lines: &[&str]) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut open: Option<usize> = None;
    for (index, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed == CAPTURE_START && open.is_none() {
            open = Some(index);
        } else if trimmed == CAPTURE_END
            && let Some(start) = open.take()
        {
            ranges.push((start, index));
        }
    }
    ranges
}

fn item_regions(body: &[&str]) -> Vec<(usize, usize)> {
    let mut regions = Vec::new();
    let mut open: Option<usize> = None;
    for (index, line) in body.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed == ITEM_START && open.is_none() {
            open = Some(index);
        } else if trimmed == ITEM_END
            && let Some(start) = open.take()
        {
            regions.push((start, index));
        }
    }
    if let Some(start) = open {
        // Unterminated item: tolerate by reading to the end of the block.
        regions.push((start, body.len()));
    }
    regions
}

fn decode_item(lines: &[&str]) -> Option<CaptureItem> {
    let mut key = String::new();
    let mut name = String::new();
    let mut load_call: Option<String> = None;
    for line in lines {
        if key.is_empty()
            && let Some(caps) = KEY_RE.captures(line)
            && let Ok(decoded) = serde_json::from_str::<String>(&caps[1])
        {
            key = decoded;
        }
        if name.is_empty()
            && let Some(caps) = NAME_RE.captures(line)
            && let Ok(decoded) = serde_json::from_str::<String>(&caps[1])
        {
            name = decoded;
        }
        if load_call.is_none()
            && let Some(found) = LOAD_CALL_RE.find(line)
        {
            load_call = Some(found.as_str().to_string());
        }
    }
    load_call.map(|load_call| CaptureItem {
        key,
        name,
        load_call,
    })
}

fn push_unique(items: &mut Vec<CaptureItem>, candidate: CaptureItem) {
    let duplicate = items.iter().any(|existing| {
        if !candidate.key.is_empty() && !existing.key.is_empty() {
            existing.key == candidate.key
        } else {
            normalize_ws(&existing.load_call) == normalize_ws(&candidate.load_call)
        }
    });
    if !duplicate {
        items.push(candidate);
    }
}

fn item_matches(item: &CaptureItem, import: &Import, load_call: &str) -> bool {
    (!item.key.is_empty() && item.key == import.key())
        || normalize_ws(&item.load_call) == normalize_ws(load_call)
}

// Load calls compare equal regardless of interior spacing, so all
// whitespace is removed rather than collapsed.
fn normalize_ws(value: &str) -> String {
    value.split_whitespace().collect::<String>()
}

fn json_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

fn strip_wrapper_blocks(text: &str) -> Vec<String> {
    let lines: Vec<&str> = text.split('\n').collect();
    let mask = wrapper_line_mask(&lines);
    lines
        .iter()
        .zip(mask)
        .filter(|(_, masked)| !masked)
        .map(|(line, _)| (*line).to_string())
        .collect()
}

fn join_with_block(mut body: Vec<String>, block: Option<String>) -> String {
    while body.last().is_some_and(|line| line.trim().is_empty()) {
        body.pop();
    }
    let mut out = body.join("\n");
    if let Some(block) = block {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&block);
    }
    out.push('\n');
    out
}
