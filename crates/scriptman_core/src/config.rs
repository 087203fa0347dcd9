use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "scriptman/0.2";
pub const DEFAULT_BACKLINK_LABEL: &str = "Backlink:";
pub const DEFAULT_SUMMARY_TAG: &str = "([[w:en:WP:SCRIPTMAN|scriptman]])";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ManagerConfig {
    #[serde(default)]
    pub site: SiteSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SiteSection {
    /// Home wiki fragment, e.g. `en.wikipedia` for `en.wikipedia.org`.
    pub home_wiki: Option<String>,
    pub api_url: Option<String>,
    /// API endpoint of the cross-site wiki hosting the `global` target.
    pub cross_api_url: Option<String>,
    /// Account whose `User:<name>/<target>.js` pages are managed.
    pub user: Option<String>,
    pub user_agent: Option<String>,
    pub site_language: Option<String>,
    pub user_language: Option<String>,
    /// True for installs that only ship English interface strings.
    pub english_only: Option<bool>,
    pub backlink_label: Option<String>,
    pub summary_tag: Option<String>,
}

/// Resolved site identity handed to the import serializer and the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteInfo {
    pub home_wiki: String,
    pub user: String,
    pub site_language: String,
    pub user_language: String,
    pub english_only: bool,
    pub backlink_label: String,
    pub summary_tag: String,
}

impl Default for SiteInfo {
    fn default() -> Self {
        Self {
            home_wiki: "en.wikipedia".to_string(),
            user: String::new(),
            site_language: "en".to_string(),
            user_language: "en".to_string(),
            english_only: false,
            backlink_label: DEFAULT_BACKLINK_LABEL.to_string(),
            summary_tag: DEFAULT_SUMMARY_TAG.to_string(),
        }
    }
}

impl ManagerConfig {
    /// Resolve the home wiki API URL: env > config > derived from home_wiki.
    pub fn api_url(&self) -> Option<String> {
        if let Some(value) = env_override("SCRIPTMAN_API_URL") {
            return Some(value);
        }
        if let Some(url) = &self.site.api_url {
            return Some(url.clone());
        }
        self.site
            .home_wiki
            .as_deref()
            .map(|wiki| format!("https://{wiki}.org/w/api.php"))
    }

    /// Resolve the cross-site API URL: env > config > meta default.
    pub fn cross_api_url(&self) -> String {
        if let Some(value) = env_override("SCRIPTMAN_CROSS_API_URL") {
            return value;
        }
        self.site
            .cross_api_url
            .clone()
            .unwrap_or_else(|| "https://meta.wikimedia.org/w/api.php".to_string())
    }

    pub fn user_agent(&self) -> String {
        if let Some(value) = env_override("SCRIPTMAN_USER_AGENT") {
            return value;
        }
        self.site
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn site_info(&self) -> SiteInfo {
        let defaults = SiteInfo::default();
        SiteInfo {
            home_wiki: env_override("SCRIPTMAN_HOME_WIKI")
                .or_else(|| self.site.home_wiki.clone())
                .unwrap_or(defaults.home_wiki),
            user: env_override("SCRIPTMAN_USER")
                .or_else(|| self.site.user.clone())
                .unwrap_or(defaults.user),
            site_language: self
                .site
                .site_language
                .clone()
                .unwrap_or(defaults.site_language),
            user_language: self
                .site
                .user_language
                .clone()
                .unwrap_or(defaults.user_language),
            english_only: self.site.english_only.unwrap_or(defaults.english_only),
            backlink_label: self
                .site
                .backlink_label
                .clone()
                .unwrap_or(defaults.backlink_label),
            summary_tag: self
                .site
                .summary_tag
                .clone()
                .unwrap_or(defaults.summary_tag),
        }
    }
}

/// Load a ManagerConfig from a TOML file. Returns default if it doesn't exist.
pub fn load_config(config_path: &Path) -> Result<ManagerConfig> {
    if !config_path.exists() {
        return Ok(ManagerConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: ManagerConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn env_override(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) => {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() { None } else { Some(trimmed) }
        }
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    // Environment variables are process-global; tests touching them take
    // this lock and restore the variables before releasing it.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_env_vars<T>(vars: &[(&str, &str)], body: impl FnOnce() -> T) -> T {
        let _guard = ENV_LOCK.lock();
        for (key, value) in vars {
            unsafe { env::set_var(key, value) };
        }
        let result = body();
        for (key, _) in vars {
            unsafe { env::remove_var(key) };
        }
        result
    }

    #[test]
    fn default_config_has_no_site_values() {
        let config = ManagerConfig::default();
        assert!(config.site.home_wiki.is_none());
        assert!(config.site.api_url.is_none());
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/scriptman.toml")).expect("load config");
        assert!(config.site.home_wiki.is_none());
    }

    #[test]
    fn load_config_parses_site_section() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("scriptman.toml");
        fs::write(
            &config_path,
            r#"
[site]
home_wiki = "de.wikipedia"
api_url = "https://de.wikipedia.org/w/api.php"
user = "Beispiel"
site_language = "de"
user_language = "de"
english_only = false
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(config.site.home_wiki.as_deref(), Some("de.wikipedia"));
        let _guard = ENV_LOCK.lock();
        let site = config.site_info();
        assert_eq!(site.home_wiki, "de.wikipedia");
        assert_eq!(site.user, "Beispiel");
        assert_eq!(site.site_language, "de");
        assert!(!site.english_only);
    }

    #[test]
    fn load_config_tolerates_partial_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("scriptman.toml");
        fs::write(&config_path, "[other]\nkey = 1\n").expect("write config");
        let config = load_config(&config_path).expect("load config");
        assert!(config.site.home_wiki.is_none());
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("scriptman.toml");
        fs::write(&config_path, "[site\nhome_wiki = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn api_url_derives_from_home_wiki() {
        let _guard = ENV_LOCK.lock();
        let mut config = ManagerConfig::default();
        config.site.home_wiki = Some("fr.wikipedia".to_string());
        assert_eq!(
            config.api_url().as_deref(),
            Some("https://fr.wikipedia.org/w/api.php")
        );
    }

    #[test]
    fn cross_api_url_defaults_to_meta() {
        let _guard = ENV_LOCK.lock();
        let config = ManagerConfig::default();
        assert_eq!(
            config.cross_api_url(),
            "https://meta.wikimedia.org/w/api.php"
        );
    }

    #[test]
    fn default_site_info_values() {
        let _guard = ENV_LOCK.lock();
        let site = ManagerConfig::default().site_info();
        assert_eq!(site.home_wiki, "en.wikipedia");
        assert_eq!(site.backlink_label, DEFAULT_BACKLINK_LABEL);
        assert_eq!(site.summary_tag, DEFAULT_SUMMARY_TAG);
    }

    #[test]
    fn env_overrides_beat_configured_site_values() {
        let mut config = ManagerConfig::default();
        config.site.home_wiki = Some("de.wikipedia".to_string());
        config.site.user = Some("Beispiel".to_string());

        let site = with_env_vars(
            &[
                ("SCRIPTMAN_HOME_WIKI", "fr.wikipedia"),
                ("SCRIPTMAN_USER", "Exemple"),
            ],
            || config.site_info(),
        );
        assert_eq!(site.home_wiki, "fr.wikipedia");
        assert_eq!(site.user, "Exemple");
    }

    #[test]
    fn env_override_beats_configured_api_url() {
        let mut config = ManagerConfig::default();
        config.site.api_url = Some("https://de.wikipedia.org/w/api.php".to_string());

        let url = with_env_vars(
            &[("SCRIPTMAN_API_URL", "https://test.wikipedia.org/w/api.php")],
            || config.api_url(),
        );
        assert_eq!(url.as_deref(), Some("https://test.wikipedia.org/w/api.php"));
    }

    #[test]
    fn blank_env_override_falls_through_to_config() {
        let mut config = ManagerConfig::default();
        config.site.home_wiki = Some("de.wikipedia".to_string());

        let site = with_env_vars(&[("SCRIPTMAN_HOME_WIKI", "   ")], || config.site_info());
        assert_eq!(site.home_wiki, "de.wikipedia");
    }
}
