//! Operation orchestration.
//!
//! The engine owns the read-modify-write cycle for every operation: take
//! the script lock, fetch the target document, run the pure text
//! transform, build the edit summary, submit. The text transforms
//! themselves live in [`crate::document`] and [`crate::capture`]; the
//! engine only decides which transport receives the edit and whether the
//! result is worth submitting at all.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};

use crate::capture::{self, CaptureItem};
use crate::config::SiteInfo;
use crate::document::{self, TextEdit};
use crate::error::{OperationError, OperationResult};
use crate::import::{Import, ImportKind, TARGET_GLOBAL, target_page};
use crate::lock::ScriptLocks;
use crate::service::{EditRequest, WikiEditApi};
use crate::summary::{self, StringTables};

/// Session-wide state shared by every operation: the resolved site, the
/// summary string tables, the per-target document cache and the script
/// locks.
pub struct EngineStore {
    pub site: SiteInfo,
    pub strings: StringTables,
    cache: Mutex<HashMap<String, String>>,
    locks: ScriptLocks,
}

impl EngineStore {
    pub fn new(site: SiteInfo, strings: StringTables) -> Self {
        Self {
            site,
            strings,
            cache: Mutex::new(HashMap::new()),
            locks: ScriptLocks::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EditAction {
    /// Full-text rewrite was submitted.
    Saved,
    /// The edit was a pure addition and went out as an append.
    Appended,
    /// The document already satisfied the request; nothing was submitted.
    NoChange,
    /// Dry run: the edit was computed but withheld.
    Planned,
}

/// The old and new full text of a withheld dry-run edit.
#[derive(Debug, Clone, Serialize)]
pub struct PendingEdit {
    pub old_text: String,
    pub new_text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EditReport {
    pub target: String,
    pub title: String,
    pub action: EditAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingEdit>,
}

/// A move touches two documents; both halves are reported.
#[derive(Debug, Clone, Serialize)]
pub struct MoveReport {
    pub installed: EditReport,
    pub removed: EditReport,
}

/// `Documentation: [[Title]]` in the leading comment block of a script
/// page overrides the backlink for that script.
static DOC_LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Documentation:\s*\[\[([^\]|#]+)").expect("documentation pattern"));

pub struct Engine<A: WikiEditApi> {
    store: Arc<EngineStore>,
    home: A,
    cross: A,
    dry_run: bool,
}

impl<A: WikiEditApi> Engine<A> {
    /// `home` serves every per-skin target; `cross` serves only the
    /// global target's host wiki.
    pub fn new(store: Arc<EngineStore>, home: A, cross: A) -> Self {
        Self {
            store,
            home,
            cross,
            dry_run: false,
        }
    }

    /// Compute every edit but submit none, reporting them as pending.
    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    pub fn store(&self) -> &EngineStore {
        &self.store
    }

    /// Every recognized plain statement on the target document.
    pub fn imports(&mut self, target: &str) -> OperationResult<Vec<Import>> {
        let text = self.fetch(target)?;
        Ok(document::parse_imports(&text, target, &self.store.site))
    }

    /// Every capture-wrapper item on the target document.
    pub fn capture_items(&mut self, target: &str) -> OperationResult<Vec<CaptureItem>> {
        let text = self.fetch(target)?;
        Ok(capture::decode(&text))
    }

    pub fn install(&mut self, import: &Import) -> OperationResult<EditReport> {
        let _guard = self.store.locks.acquire(&import.lock_key());
        self.install_locked(import)
    }

    pub fn uninstall(&mut self, import: &Import) -> OperationResult<EditReport> {
        let _guard = self.store.locks.acquire(&import.lock_key());
        self.uninstall_locked(import)
    }

    pub fn set_disabled(&mut self, import: &Import, disabled: bool) -> OperationResult<EditReport> {
        let _guard = self.store.locks.acquire(&import.lock_key());
        let site = self.store.site.clone();
        let text = self.fetch(&import.target)?;
        let new_text = document::set_disabled_text(&text, import, disabled, &site)?;
        let key = if disabled {
            summary::KEY_DISABLE
        } else {
            summary::KEY_ENABLE
        };
        let summary = self.summary_for(import, key, None);
        if new_text == text {
            return Ok(self.no_change(&import.target));
        }
        self.submit(&import.target, &text, TextEdit::Replace(new_text), summary)
    }

    /// Install on the new target first, then remove from the old one. The
    /// two edits are separate submissions; when the second fails the
    /// script is live on both pages and the error says so.
    pub fn move_to(&mut self, import: &Import, new_target: &str) -> OperationResult<MoveReport> {
        if new_target == import.target {
            // Install would no-op and uninstall would then delete the
            // only copy, so a same-target move is rejected outright.
            return Err(OperationError::same_target(import.name(), &import.target));
        }
        let _guard = self.store.locks.acquire(&import.lock_key());

        let mut relocated = import.clone();
        relocated.target = new_target.to_string();
        let installed = self.install_locked(&relocated)?;
        match self.uninstall_locked(import) {
            Ok(removed) => Ok(MoveReport { installed, removed }),
            Err(source) => Err(OperationError::MovePartial {
                old_target: import.target.clone(),
                new_target: new_target.to_string(),
                source: Box::new(source),
            }),
        }
    }

    /// Rewrite every recognized statement into canonical form, preserving
    /// order, disabled state and unrecognized lines.
    pub fn normalize(&mut self, target: &str) -> OperationResult<EditReport> {
        // Normalize is per-target, not per-script; the lock key is scoped
        // so it cannot collide with a script name.
        let _guard = self.store.locks.acquire(&format!("target:{target}"));
        let site = self.store.site.clone();
        let text = self.fetch(target)?;
        let new_text = document::normalize_text(&text, target, &site);
        if new_text == text {
            return Ok(self.no_change(target));
        }
        let title = self.target_title(target);
        let description = format!("[[{title}]]");
        let summary = summary::build_summary(
            target,
            summary::KEY_NORMALIZE,
            &description,
            &self.store.strings,
            &site,
        );
        self.submit(target, &text, TextEdit::Replace(new_text), summary)
    }

    /// Replace the plain statement with a wrapper item that loads the
    /// script under the latency capture harness.
    pub fn capture(&mut self, import: &Import, display_name: &str) -> OperationResult<EditReport> {
        let _guard = self.store.locks.acquire(&import.lock_key());
        let site = self.store.site.clone();
        let text = self.fetch(&import.target)?;
        let new_text = capture::capture_text(&text, import, display_name, &site);
        let summary = self.summary_for(import, summary::KEY_CAPTURE, None);
        if new_text == text {
            return Ok(self.no_change(&import.target));
        }
        self.submit(&import.target, &text, TextEdit::Replace(new_text), summary)
    }

    /// Inverse of [`Engine::capture`]: drop the wrapper item and restore
    /// the plain statement.
    pub fn decapture(&mut self, import: &Import) -> OperationResult<EditReport> {
        let _guard = self.store.locks.acquire(&import.lock_key());
        let site = self.store.site.clone();
        let text = self.fetch(&import.target)?;
        let new_text = capture::decapture_text(&text, import, &site)?;
        let summary = self.summary_for(import, summary::KEY_DECAPTURE, None);
        if new_text == text {
            return Ok(self.no_change(&import.target));
        }
        self.submit(&import.target, &text, TextEdit::Replace(new_text), summary)
    }

    fn install_locked(&mut self, import: &Import) -> OperationResult<EditReport> {
        let site = self.store.site.clone();
        let text = self.fetch(&import.target)?;

        // A script already running under the capture harness counts as
        // installed; adding a plain statement would load it twice.
        if capture::is_captured(&text, import, &site) {
            debug!(name = import.name(), "already captured, skipping install");
            return Ok(self.no_change(&import.target));
        }

        let doc_link = self.resolve_doc_link(import);
        let statement = import.to_statement(&site, doc_link.as_deref());
        let summary = self.summary_for(import, summary::KEY_INSTALL, doc_link.as_deref());
        match document::install_text(&text, &statement, import, &site) {
            TextEdit::Unchanged => Ok(self.no_change(&import.target)),
            edit => self.submit(&import.target, &text, edit, summary),
        }
    }

    fn uninstall_locked(&mut self, import: &Import) -> OperationResult<EditReport> {
        let site = self.store.site.clone();
        let text = self.fetch(&import.target)?;
        let new_text = document::uninstall_text(&text, import, &site)?;
        let summary = self.summary_for(import, summary::KEY_UNINSTALL, None);
        self.submit(&import.target, &text, TextEdit::Replace(new_text), summary)
    }

    fn target_title(&self, target: &str) -> String {
        target_page(&self.store.site.user, target)
    }

    fn api_for(&mut self, target: &str) -> &mut A {
        if target == TARGET_GLOBAL {
            &mut self.cross
        } else {
            &mut self.home
        }
    }

    fn fetch(&mut self, target: &str) -> OperationResult<String> {
        if let Some(text) = self.store.cache.lock().get(target) {
            return Ok(text.clone());
        }
        let title = self.target_title(target);
        let text = self
            .api_for(target)
            .get_text(&title)
            .map_err(OperationError::Transport)?;
        self.store
            .cache
            .lock()
            .insert(target.to_string(), text.clone());
        Ok(text)
    }

    fn submit(
        &mut self,
        target: &str,
        old_text: &str,
        edit: TextEdit,
        summary: String,
    ) -> OperationResult<EditReport> {
        let title = self.target_title(target);
        let (request, action, new_text) = match edit {
            TextEdit::Unchanged => return Ok(self.no_change(target)),
            TextEdit::Append(chunk) => {
                let new_text = format!("{old_text}{chunk}");
                let request = EditRequest {
                    title: title.clone(),
                    text: None,
                    append: Some(chunk),
                    summary: summary.clone(),
                };
                (request, EditAction::Appended, new_text)
            }
            TextEdit::Replace(new_text) => {
                let request = EditRequest {
                    title: title.clone(),
                    text: Some(new_text.clone()),
                    append: None,
                    summary: summary.clone(),
                };
                (request, EditAction::Saved, new_text)
            }
        };

        if self.dry_run {
            return Ok(EditReport {
                target: target.to_string(),
                title,
                action: EditAction::Planned,
                summary: Some(summary),
                pending: Some(PendingEdit {
                    old_text: old_text.to_string(),
                    new_text,
                }),
            });
        }

        self.api_for(target)
            .post_edit(&request)
            .map_err(OperationError::Transport)?;
        self.store.cache.lock().remove(target);
        info!(title, summary, "edit saved");
        Ok(EditReport {
            target: target.to_string(),
            title,
            action,
            summary: Some(summary),
            pending: None,
        })
    }

    fn no_change(&self, target: &str) -> EditReport {
        EditReport {
            target: target.to_string(),
            title: self.target_title(target),
            action: EditAction::NoChange,
            summary: None,
            pending: None,
        }
    }

    fn summary_for(&mut self, import: &Import, key: &str, doc_link: Option<&str>) -> String {
        let site = self.store.site.clone();
        let description = format!("[[{}]]", import.summary_link(&site, doc_link));
        summary::build_summary(&import.target, key, &description, &self.store.strings, &site)
    }

    /// Best-effort documentation override for locally hosted scripts: a
    /// `Documentation: [[Title]]` note in the script page's leading
    /// comment block redirects the backlink there. Lookup failures fall
    /// back to the default backlink.
    fn resolve_doc_link(&mut self, import: &Import) -> Option<String> {
        if import.kind() != ImportKind::Local {
            return None;
        }
        let page = import.page()?;
        let text = match self.home.get_text(page) {
            Ok(text) => text,
            Err(err) => {
                debug!(page, %err, "documentation lookup failed, using default backlink");
                return None;
            }
        };
        extract_doc_link(&text)
    }
}

fn extract_doc_link(text: &str) -> Option<String> {
    let mut in_block_comment = false;
    for line in text.lines() {
        let trimmed = line.trim();
        if !in_block_comment {
            if trimmed.is_empty() {
                continue;
            }
            if !trimmed.starts_with("//") && !trimmed.starts_with("/*") {
                // First code line ends the leading comment block.
                return None;
            }
        }
        if let Some(caps) = DOC_LINK_RE.captures(trimmed) {
            return Some(caps[1].trim().to_string());
        }
        if trimmed.starts_with("/*") {
            in_block_comment = true;
        }
        if in_block_comment && trimmed.contains("*/") {
            in_block_comment = false;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    /// In-memory stand-in for the MediaWiki transport. Pages are shared
    /// through an `Arc` so tests can inspect them after the engine takes
    /// ownership of the client.
    #[derive(Clone, Default)]
    struct MemoryWiki {
        pages: Arc<Mutex<HashMap<String, String>>>,
        fail_writes: Arc<Mutex<bool>>,
        edits: Arc<Mutex<usize>>,
        requests: Arc<Mutex<usize>>,
    }

    impl MemoryWiki {
        fn page(&self, title: &str) -> String {
            self.pages.lock().get(title).cloned().unwrap_or_default()
        }

        fn set_page(&self, title: &str, text: &str) {
            self.pages.lock().insert(title.to_string(), text.to_string());
        }

        fn edit_count(&self) -> usize {
            *self.edits.lock()
        }
    }

    impl WikiEditApi for MemoryWiki {
        fn get_text(&mut self, title: &str) -> anyhow::Result<String> {
            *self.requests.lock() += 1;
            Ok(self.page(title))
        }

        fn post_edit(&mut self, edit: &EditRequest) -> anyhow::Result<()> {
            *self.requests.lock() += 1;
            if *self.fail_writes.lock() {
                bail!("simulated write failure");
            }
            let mut pages = self.pages.lock();
            let entry = pages.entry(edit.title.clone()).or_default();
            match (&edit.text, &edit.append) {
                (Some(text), None) => *entry = text.clone(),
                (None, Some(chunk)) => entry.push_str(chunk),
                _ => bail!("malformed edit request"),
            }
            *self.edits.lock() += 1;
            Ok(())
        }

        fn request_count(&self) -> usize {
            *self.requests.lock()
        }
    }

    fn site() -> SiteInfo {
        SiteInfo {
            home_wiki: "en.wikipedia".to_string(),
            user: "Example".to_string(),
            ..SiteInfo::default()
        }
    }

    fn engine() -> (Engine<MemoryWiki>, MemoryWiki, MemoryWiki) {
        let store = Arc::new(EngineStore::new(site(), StringTables::english_defaults()));
        let home = MemoryWiki::default();
        let cross = MemoryWiki::default();
        (
            Engine::new(Arc::clone(&store), home.clone(), cross.clone()),
            home,
            cross,
        )
    }

    #[test]
    fn install_appends_and_is_idempotent() {
        let (mut engine, home, _) = engine();
        home.set_page("User:Example/common.js", "// my scripts\n");

        let import = Import::of_local("User:Foo/Tool.js", "common");
        let first = engine.install(&import).unwrap();
        assert_eq!(first.action, EditAction::Appended);
        let text = home.page("User:Example/common.js");
        assert!(text.starts_with("// my scripts\n"));
        assert!(text.contains("mw.loader.load"));
        assert!(text.contains("title=User:Foo/Tool.js"));

        let second = engine.install(&import).unwrap();
        assert_eq!(second.action, EditAction::NoChange);
        assert_eq!(home.edit_count(), 1);
    }

    #[test]
    fn install_summary_names_the_script() {
        let (mut engine, _, _) = engine();
        let import = Import::of_local("User:Foo/Tool.js", "common");
        let report = engine.install(&import).unwrap();
        let summary = report.summary.unwrap();
        assert!(summary.starts_with("Installing [[User:Foo/Tool.js]]"));
        assert!(summary.contains("scriptman"));
    }

    #[test]
    fn install_respects_documentation_override() {
        let (mut engine, home, _) = engine();
        home.set_page(
            "User:Foo/Tool.js",
            "// User:Foo/Tool.js\n// Documentation: [[Help:Tool]]\nconsole.log('hi');\n",
        );

        let import = Import::of_local("User:Foo/Tool.js", "common");
        let report = engine.install(&import).unwrap();
        assert!(report.summary.unwrap().contains("[[Help:Tool]]"));
        assert!(home.page("User:Example/common.js").contains("[[Help:Tool]]"));
    }

    #[test]
    fn install_skips_scripts_already_under_capture() {
        let (mut engine, home, _) = engine();
        let import = Import::of_local("User:Foo/Tool.js", "common");
        let captured = capture::capture_text("", &import, "Tool", &site());
        home.set_page("User:Example/common.js", &captured);

        let report = engine.install(&import).unwrap();
        assert_eq!(report.action, EditAction::NoChange);
        assert_eq!(home.edit_count(), 0);
    }

    #[test]
    fn uninstall_removes_then_reports_not_found() {
        let (mut engine, home, _) = engine();
        home.set_page(
            "User:Example/common.js",
            "importScript('User:Foo/Tool.js');\n",
        );

        let import = Import::of_local("User:Foo/Tool.js", "common");
        let report = engine.uninstall(&import).unwrap();
        assert_eq!(report.action, EditAction::Saved);
        assert!(!home.page("User:Example/common.js").contains("Tool.js"));

        match engine.uninstall(&import) {
            Err(OperationError::NotFound { name, target }) => {
                assert_eq!(name, "User:Foo/Tool.js");
                assert_eq!(target, "common");
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn disable_then_enable_round_trips() {
        let (mut engine, home, _) = engine();
        let original = "importScript('User:Foo/Tool.js');\n";
        home.set_page("User:Example/common.js", original);

        let import = Import::of_local("User:Foo/Tool.js", "common");
        engine.set_disabled(&import, true).unwrap();
        assert!(
            home.page("User:Example/common.js")
                .starts_with("//importScript")
        );

        engine.set_disabled(&import, false).unwrap();
        assert_eq!(home.page("User:Example/common.js"), original);

        let report = engine.set_disabled(&import, false).unwrap();
        assert_eq!(report.action, EditAction::NoChange);
    }

    #[test]
    fn move_to_global_lands_on_the_cross_wiki() {
        let (mut engine, home, cross) = engine();
        home.set_page(
            "User:Example/common.js",
            "importScript('User:Foo/Tool.js');\n",
        );

        let import = Import::of_local("User:Foo/Tool.js", "common");
        let report = engine.move_to(&import, TARGET_GLOBAL).unwrap();
        assert_eq!(report.installed.action, EditAction::Appended);
        assert_eq!(report.removed.action, EditAction::Saved);
        assert!(!home.page("User:Example/common.js").contains("Tool.js"));
        assert!(
            cross
                .page("User:Example/global.js")
                .contains("User:Foo/Tool.js")
        );
    }

    #[test]
    fn move_to_the_same_target_is_rejected_and_keeps_the_script() {
        let (mut engine, home, _) = engine();
        home.set_page(
            "User:Example/common.js",
            "importScript('User:Foo/Tool.js');\n",
        );

        let import = Import::of_local("User:Foo/Tool.js", "common");
        match engine.move_to(&import, "common") {
            Err(OperationError::SameTarget { name, target }) => {
                assert_eq!(name, "User:Foo/Tool.js");
                assert_eq!(target, "common");
            }
            other => panic!("expected SameTarget, got {other:?}"),
        }
        assert!(home.page("User:Example/common.js").contains("Tool.js"));
        assert_eq!(home.edit_count(), 0);
    }

    #[test]
    fn failed_move_removal_reports_both_copies() {
        let (mut engine, home, cross) = engine();
        home.set_page(
            "User:Example/common.js",
            "importScript('User:Foo/Tool.js');\n",
        );
        *home.fail_writes.lock() = true;

        let import = Import::of_local("User:Foo/Tool.js", "common");
        match engine.move_to(&import, TARGET_GLOBAL) {
            Err(OperationError::MovePartial {
                old_target,
                new_target,
                ..
            }) => {
                assert_eq!(old_target, "common");
                assert_eq!(new_target, "global");
            }
            other => panic!("expected MovePartial, got {other:?}"),
        }
        assert!(home.page("User:Example/common.js").contains("Tool.js"));
        assert!(
            cross
                .page("User:Example/global.js")
                .contains("User:Foo/Tool.js")
        );
    }

    #[test]
    fn normalize_submits_nothing_for_canonical_documents() {
        let (mut engine, home, _) = engine();
        let import = Import::of_local("User:Foo/Tool.js", "common");
        let canonical = format!("{}\n", import.to_statement(&site(), None));
        home.set_page("User:Example/common.js", &canonical);

        let report = engine.normalize("common").unwrap();
        assert_eq!(report.action, EditAction::NoChange);
        assert_eq!(home.edit_count(), 0);
    }

    #[test]
    fn capture_then_decapture_restores_plain_statement() {
        let (mut engine, home, _) = engine();
        let import = Import::of_local("User:Foo/Tool.js", "common");
        let plain = format!("{}\n", import.to_statement(&site(), None));
        home.set_page("User:Example/common.js", &plain);

        engine.capture(&import, "Tool").unwrap();
        let wrapped = home.page("User:Example/common.js");
        assert!(wrapped.contains("SM-CAPTURE-START"));
        // Plain statements carry the backlink comment; wrapper items do not.
        assert!(!wrapped.contains("Backlink:"));

        engine.decapture(&import).unwrap();
        let restored = home.page("User:Example/common.js");
        assert!(!restored.contains("SM-CAPTURE"));
        assert!(restored.contains(&import.to_statement(&site(), None)));
    }

    #[test]
    fn dry_run_withholds_every_submission() {
        let (engine, home, _) = engine();
        let mut engine = engine.dry_run(true);
        let import = Import::of_local("User:Foo/Tool.js", "common");

        let report = engine.install(&import).unwrap();
        assert_eq!(report.action, EditAction::Planned);
        let pending = report.pending.unwrap();
        assert!(pending.new_text.contains("User:Foo/Tool.js"));
        assert_eq!(home.edit_count(), 0);
        assert_eq!(home.page("User:Example/common.js"), "");
    }

    #[test]
    fn imports_lists_statements_outside_wrappers() {
        let (mut engine, home, _) = engine();
        home.set_page(
            "User:Example/common.js",
            "importScript('User:Foo/A.js');\nimportScript('User:Foo/B.js');\n",
        );

        let listed = engine.imports("common").unwrap();
        let names: Vec<&str> = listed.iter().map(Import::name).collect();
        assert_eq!(names, vec!["User:Foo/A.js", "User:Foo/B.js"]);
    }

    #[test]
    fn fetch_caches_until_an_edit_invalidates() {
        let (mut engine, home, _) = engine();
        home.set_page(
            "User:Example/common.js",
            "importScript('User:Foo/A.js');\n",
        );

        engine.imports("common").unwrap();
        engine.imports("common").unwrap();
        assert_eq!(home.request_count(), 1);

        let import = Import::of_local("User:Foo/B.js", "common");
        engine.install(&import).unwrap();
        let listed = engine.imports("common").unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[test]
    fn doc_link_extraction_stops_at_first_code_line() {
        assert_eq!(
            extract_doc_link("// Documentation: [[Help:Tool]]\ncode();\n"),
            Some("Help:Tool".to_string())
        );
        assert_eq!(
            extract_doc_link("/*\n * Documentation: [[Help:Tool|docs]]\n */\ncode();\n"),
            Some("Help:Tool".to_string())
        );
        assert_eq!(
            extract_doc_link("code();\n// Documentation: [[Help:Tool]]\n"),
            None
        );
        assert_eq!(extract_doc_link(""), None);
    }
}
