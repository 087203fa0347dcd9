//! Edit-summary construction.
//!
//! Summaries are built from localizable templates with a `$1` description
//! placeholder and a fixed trailing tag. Table selection is deterministic:
//! the cross-site context and English-only installs always use English so
//! the summary reads the same wherever the edit shows up.

use std::collections::BTreeMap;

use crate::config::SiteInfo;
use crate::import::TARGET_GLOBAL;

pub const KEY_INSTALL: &str = "install";
pub const KEY_UNINSTALL: &str = "uninstall";
pub const KEY_ENABLE: &str = "enable";
pub const KEY_DISABLE: &str = "disable";
pub const KEY_NORMALIZE: &str = "normalize";
pub const KEY_CAPTURE: &str = "capture";
pub const KEY_DECAPTURE: &str = "decapture";

/// The three summary string tables: the English fallback plus optional
/// site-language and user-language overrides.
#[derive(Debug, Clone, Default)]
pub struct StringTables {
    pub fallback: BTreeMap<String, String>,
    pub site: BTreeMap<String, String>,
    pub user: BTreeMap<String, String>,
}

impl StringTables {
    pub fn english_defaults() -> Self {
        let mut fallback = BTreeMap::new();
        fallback.insert(KEY_INSTALL.to_string(), "Installing $1".to_string());
        fallback.insert(KEY_UNINSTALL.to_string(), "Uninstalling $1".to_string());
        fallback.insert(KEY_ENABLE.to_string(), "Enabling $1".to_string());
        fallback.insert(KEY_DISABLE.to_string(), "Disabling $1".to_string());
        fallback.insert(
            KEY_NORMALIZE.to_string(),
            "Normalizing script declarations on $1".to_string(),
        );
        fallback.insert(KEY_CAPTURE.to_string(), "Capturing $1".to_string());
        fallback.insert(KEY_DECAPTURE.to_string(), "Releasing $1".to_string());
        Self {
            fallback,
            site: BTreeMap::new(),
            user: BTreeMap::new(),
        }
    }
}

/// Build the edit summary for one operation. `description` replaces the
/// `$1` placeholder; the site's summary tag is appended space-separated
/// unless empty.
pub fn build_summary(
    target: &str,
    summary_key: &str,
    description: &str,
    tables: &StringTables,
    site: &SiteInfo,
) -> String {
    let template = select_template(target, summary_key, tables, site);
    let mut summary = template.replace("$1", description);
    if !site.summary_tag.is_empty() {
        summary.push(' ');
        summary.push_str(&site.summary_tag);
    }
    summary
}

fn select_template<'a>(
    target: &str,
    summary_key: &'a str,
    tables: &'a StringTables,
    site: &SiteInfo,
) -> &'a str {
    let fallback = tables
        .fallback
        .get(summary_key)
        .map(String::as_str)
        .unwrap_or(summary_key);
    if target == TARGET_GLOBAL || site.english_only {
        return fallback;
    }
    if let Some(template) = tables.site.get(summary_key) {
        return template;
    }
    if let Some(template) = tables.user.get(summary_key) {
        return template;
    }
    fallback
}
