//! The Import model: one script/stylesheet reference declared on one
//! target document, plus the line parser and the canonical serializer.
//!
//! Two statement shapes are recognized, each optionally behind a leading
//! `//` marking the reference disabled:
//!
//! ```text
//! importScript( '<escaped-title>' )
//! mw.loader.load( '<escaped-url>' [, 'text/css'] )
//! ```
//!
//! Serialization always emits the second shape, so legacy input is
//! normalized on the first rewrite that touches it.

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::config::SiteInfo;
use crate::escape::{escape_js_string, unescape_js_string};

/// The distinguished cross-site context, hosted on the cross-site wiki.
pub const TARGET_GLOBAL: &str = "global";

/// Every context a reference may be declared on.
pub const TARGETS: &[&str] = &[
    "common",
    TARGET_GLOBAL,
    "minerva",
    "monobook",
    "timeless",
    "vector",
    "vector-2022",
];

/// Title of the document backing a target context.
pub fn target_page(user: &str, target: &str) -> String {
    format!("User:{user}/{target}.js")
}

static IMPORT_SCRIPT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?x)
        ^\s* (?:(?P<off>//)\s*)?
        importScript \s* \( \s*
        (?: '(?P<sq>(?:\\.|[^'\\])*)' | "(?P<dq>(?:\\.|[^"\\])*)" )
        \s* \) \s* ;? \s* (?://.*)? $
        "#,
    )
    .expect("importScript pattern")
});

static LOADER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?x)
        ^\s* (?:(?P<off>//)\s*)?
        mw\.loader\.load \s* \( \s*
        (?: '(?P<sq>(?:\\.|[^'\\])*)' | "(?P<dq>(?:\\.|[^"\\])*)" )
        \s* (?: , \s* (?:'[^']*'|"[^"]*") \s* )?
        \) \s* ;? \s* (?://.*)? $
        "#,
    )
    .expect("mw.loader.load pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportKind {
    Local,
    CrossWiki,
    Url,
}

impl ImportKind {
    fn code(self) -> u8 {
        match self {
            ImportKind::Local => 0,
            ImportKind::CrossWiki => 1,
            ImportKind::Url => 2,
        }
    }
}

/// One script/stylesheet reference. Exactly one of `{page, url}` is set;
/// `wiki` is set only together with `page`. The variant is derived from
/// which fields are set, never stored independently, so the invariant
/// holds by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    page: Option<String>,
    wiki: Option<String>,
    url: Option<String>,
    pub target: String,
    pub disabled: bool,
}

impl Import {
    pub fn of_local(page: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            page: Some(normalize_title(&page.into())),
            wiki: None,
            url: None,
            target: target.into(),
            disabled: false,
        }
    }

    /// A reference to a page on another wiki. Collapses to Local when the
    /// source wiki is the home wiki itself, so identity keys stay stable
    /// across serialize/parse cycles.
    pub fn of_cross_wiki(
        page: impl Into<String>,
        wiki: impl Into<String>,
        target: impl Into<String>,
        site: &SiteInfo,
    ) -> Self {
        let wiki = wiki.into();
        let mut import = Self::of_local(page, target);
        if !wiki.eq_ignore_ascii_case(&site.home_wiki) {
            import.wiki = Some(wiki.to_ascii_lowercase());
        }
        import
    }

    /// An opaque URL reference. URLs of the shape
    /// `//<wiki>.org/w/index.php?...title=<title>...` decompose into a
    /// CrossWiki (or Local) reference instead.
    pub fn of_url(url: impl Into<String>, target: impl Into<String>, site: &SiteInfo) -> Self {
        let url = url.into();
        if let Some((wiki, page)) = decompose_index_php_url(&url) {
            return Self::of_cross_wiki(page, wiki, target, site);
        }
        Self {
            page: None,
            wiki: None,
            url: Some(url),
            target: target.into(),
            disabled: false,
        }
    }

    /// Parse one physical line of a target document. Returns None for
    /// anything that is not one of the two statement shapes.
    pub fn from_line(line: &str, target: &str, site: &SiteInfo) -> Option<Self> {
        if let Some(caps) = IMPORT_SCRIPT_RE.captures(line) {
            let title = unescape_js_string(quoted_argument(&caps));
            let mut import = Self::of_local(title, target);
            import.disabled = caps.name("off").is_some();
            return Some(import);
        }
        let caps = LOADER_RE.captures(line)?;
        let url = unescape_js_string(quoted_argument(&caps));
        let mut import = Self::of_url(url, target, site);
        import.disabled = caps.name("off").is_some();
        Some(import)
    }

    pub fn kind(&self) -> ImportKind {
        if self.url.is_some() {
            ImportKind::Url
        } else if self.wiki.is_some() {
            ImportKind::CrossWiki
        } else {
            ImportKind::Local
        }
    }

    pub fn page(&self) -> Option<&str> {
        self.page.as_deref()
    }

    pub fn wiki(&self) -> Option<&str> {
        self.wiki.as_deref()
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Display name: the page title, or the raw URL for opaque references.
    pub fn name(&self) -> &str {
        self.page
            .as_deref()
            .or(self.url.as_deref())
            .unwrap_or_default()
    }

    /// Composite identity used for deduplication and same-reference
    /// comparisons. Stable across re-parses of the same statement.
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.kind().code(),
            self.target,
            self.wiki.as_deref().unwrap_or(""),
            self.name()
        )
        .to_lowercase()
    }

    /// Serialization key for mutual exclusion: the logical script name
    /// independent of target, so concurrent operations on the same script
    /// queue behind each other.
    pub fn lock_key(&self) -> String {
        self.name().to_lowercase()
    }

    /// True when the two references point at the same underlying script.
    /// Opaque URLs compare by exact URL; everything else by identity key.
    pub fn matches(&self, other: &Import) -> bool {
        match (self.kind(), other.kind()) {
            (ImportKind::Url, ImportKind::Url) => self.url == other.url,
            (ImportKind::Url, _) | (_, ImportKind::Url) => false,
            _ => self.key() == other.key(),
        }
    }

    /// Whether the referenced resource is a stylesheet. Re-derived from the
    /// target path on every serialize rather than preserved from the parse.
    pub fn is_css(&self) -> bool {
        match self.kind() {
            ImportKind::Url => url_path_is_css(self.url.as_deref().unwrap_or_default()),
            _ => self
                .page
                .as_deref()
                .is_some_and(|page| page.to_ascii_lowercase().ends_with(".css")),
        }
    }

    /// The URL the canonical statement loads.
    pub fn load_url(&self, site: &SiteInfo) -> String {
        match self.kind() {
            ImportKind::Url => self.url.clone().unwrap_or_default(),
            _ => {
                let wiki = self.wiki.as_deref().unwrap_or(&site.home_wiki);
                let ctype = if self.is_css() {
                    "text/css"
                } else {
                    "text/javascript"
                };
                format!(
                    "//{}.org/w/index.php?title={}&action=raw&ctype={}",
                    wiki,
                    encode_title(self.name()),
                    ctype
                )
            }
        }
    }

    /// The statement proper: the `mw.loader.load` call with no trailing
    /// comment and no disabled prefix. This is the text embedded in
    /// capture wrapper items.
    pub fn to_load_call(&self, site: &SiteInfo) -> String {
        let url = escape_js_string(&self.load_url(site));
        if self.is_css() {
            format!("mw.loader.load('{url}', 'text/css');")
        } else {
            format!("mw.loader.load('{url}');")
        }
    }

    /// Full canonical line: statement, backlink comment for page-backed
    /// references, and the disabled prefix when set.
    pub fn to_statement(&self, site: &SiteInfo, doc_link: Option<&str>) -> String {
        let mut statement = self.to_load_call(site);
        if self.kind() != ImportKind::Url {
            statement.push_str(&format!(
                " // {} [[{}]]",
                site.backlink_label,
                self.summary_link(site, doc_link)
            ));
        }
        if self.disabled {
            format!("// {statement}")
        } else {
            statement
        }
    }

    /// Title used in the backlink comment and the edit summary. The
    /// documentation override wins when present; otherwise cross-wiki
    /// references get an interwiki prefix, local references installed into
    /// the cross-site context get the home wiki's own prefix, and
    /// everything else is the bare title.
    pub fn summary_link(&self, site: &SiteInfo, doc_link: Option<&str>) -> String {
        if let Some(doc) = doc_link {
            let doc = doc.trim();
            if !doc.is_empty() {
                return doc.to_string();
            }
        }
        let Some(page) = self.page.as_deref() else {
            return self.url.clone().unwrap_or_default();
        };
        if self.kind() == ImportKind::CrossWiki {
            let wiki = self.wiki.as_deref().unwrap_or_default();
            if !wiki.eq_ignore_ascii_case(&site.home_wiki)
                && let Some(prefix) = interwiki_prefix(wiki)
            {
                return format!("{prefix}{page}");
            }
        } else if self.target == TARGET_GLOBAL
            && let Some(prefix) = interwiki_prefix(&site.home_wiki)
        {
            return format!("{prefix}{page}");
        }
        page.to_string()
    }
}

fn quoted_argument<'a>(caps: &'a regex::Captures<'a>) -> &'a str {
    caps.name("sq")
        .or_else(|| caps.name("dq"))
        .map(|m| m.as_str())
        .unwrap_or_default()
}

/// MediaWiki treats underscores and spaces as the same title character.
fn normalize_title(title: &str) -> String {
    title.trim().replace('_', " ")
}

fn encode_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    for ch in title.chars() {
        match ch {
            ' ' => out.push('_'),
            '%' | '&' | '+' | '?' | '#' => {
                out.push_str(&format!("%{:02X}", ch as u32));
            }
            other => out.push(other),
        }
    }
    out
}

fn decompose_index_php_url(raw: &str) -> Option<(String, String)> {
    let absolute = if raw.starts_with("//") {
        format!("https:{raw}")
    } else {
        raw.to_string()
    };
    let parsed = Url::parse(&absolute).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let wiki = parsed.host_str()?.strip_suffix(".org")?.to_string();
    if parsed.path() != "/w/index.php" {
        return None;
    }
    let title = parsed
        .query_pairs()
        .find(|(key, _)| key == "title")
        .map(|(_, value)| value.into_owned())?;
    if title.is_empty() {
        return None;
    }
    Some((wiki, title))
}

fn url_path_is_css(raw: &str) -> bool {
    let absolute = if raw.starts_with("//") {
        format!("https:{raw}")
    } else {
        raw.to_string()
    };
    match Url::parse(&absolute) {
        Ok(parsed) => parsed.path().to_ascii_lowercase().ends_with(".css"),
        Err(_) => {
            let path = raw.split(['?', '#']).next().unwrap_or_default();
            path.to_ascii_lowercase().ends_with(".css")
        }
    }
}

/// Interwiki project prefix for a wiki fragment, e.g. `en.wikipedia` ->
/// `w:en:`. Returns None for wikis with no well-known prefix.
pub fn interwiki_prefix(wiki: &str) -> Option<String> {
    let (lang, project) = wiki.rsplit_once('.')?;
    let code = match project {
        "wikipedia" => "w",
        "wiktionary" => "wikt",
        "wikiquote" => "q",
        "wikisource" => "s",
        "wikibooks" => "b",
        "wikinews" => "n",
        "wikiversity" => "v",
        "wikivoyage" => "voy",
        "wikidata" => return Some("d:".to_string()),
        "mediawiki" => return Some("mw:".to_string()),
        "wikimedia" => {
            return match lang {
                "meta" => Some("m:".to_string()),
                "commons" => Some("c:".to_string()),
                _ => None,
            };
        }
        _ => return None,
    };
    Some(format!("{code}:{lang}:"))
}
