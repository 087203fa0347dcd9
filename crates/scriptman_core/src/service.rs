//! Wiki edit transport.
//!
//! The engine only ever needs two calls: read the current full text of a
//! titled page, and submit a full-text or append edit with a summary.
//! [`WikiEditApi`] is that contract; [`MediaWikiClient`] is the blocking
//! HTTP implementation against the MediaWiki action API.

use std::env;
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// One edit submission. Exactly one of `text` and `append` is set: `text`
/// replaces the page wholesale, `append` adds to the end.
#[derive(Debug, Clone)]
pub struct EditRequest {
    pub title: String,
    pub text: Option<String>,
    pub append: Option<String>,
    pub summary: String,
}

pub trait WikiEditApi {
    /// Current full text of a titled page, or empty string when the page
    /// does not exist.
    fn get_text(&mut self, title: &str) -> Result<String>;
    fn post_edit(&mut self, edit: &EditRequest) -> Result<()>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct MediaWikiClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
    pub rate_limit_write_ms: u64,
    pub max_retries: usize,
    pub max_write_retries: usize,
    pub retry_delay_ms: u64,
}

impl MediaWikiClientConfig {
    pub fn new(api_url: &str, user_agent: &str) -> Self {
        Self {
            api_url: api_url.to_string(),
            user_agent: user_agent.to_string(),
            timeout_ms: env_value_u64("SCRIPTMAN_HTTP_TIMEOUT_MS", 30_000),
            rate_limit_read_ms: env_value_u64("SCRIPTMAN_RATE_LIMIT_READ", 300),
            rate_limit_write_ms: env_value_u64("SCRIPTMAN_RATE_LIMIT_WRITE", 1_000),
            max_retries: env_value_usize("SCRIPTMAN_HTTP_RETRIES", 2),
            max_write_retries: env_value_usize("SCRIPTMAN_HTTP_WRITE_RETRIES", 1),
            retry_delay_ms: env_value_u64("SCRIPTMAN_HTTP_RETRY_DELAY_MS", 500),
        }
    }
}

pub struct MediaWikiClient {
    client: Client,
    config: MediaWikiClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
    csrf_token: Option<String>,
}

impl MediaWikiClient {
    pub fn new(config: MediaWikiClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .cookie_store(true)
            .build()
            .context("failed to build MediaWiki HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
            csrf_token: None,
        })
    }

    pub fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let token_response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
            ("type", "login".to_string()),
        ])?;
        let token_payload: TokenQueryResponse = serde_json::from_value(token_response)
            .context("failed to decode login token response")?;
        let login_token = token_payload
            .query
            .tokens
            .as_ref()
            .and_then(|tokens| tokens.logintoken.as_ref())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("failed to get MediaWiki login token"))?;

        let login_response = self.request_json_post(
            &[
                ("action", "login".to_string()),
                ("lgname", username.to_string()),
                ("lgpassword", password.to_string()),
                ("lgtoken", login_token),
            ],
            true,
        )?;
        let login_payload: LoginResponse =
            serde_json::from_value(login_response).context("failed to decode login response")?;
        match login_payload.login.result.as_deref() {
            Some("Success") => {
                self.csrf_token = None;
                Ok(())
            }
            other => bail!(
                "MediaWiki login failed: {}",
                login_payload
                    .login
                    .reason
                    .or_else(|| other.map(ToString::to_string))
                    .unwrap_or_else(|| "unknown error".to_string())
            ),
        }
    }

    fn request_json_get(&mut self, params: &[(&str, String)]) -> Result<Value> {
        let mut pairs = Vec::with_capacity(params.len() + 2);
        pairs.push(("format".to_string(), "json".to_string()));
        pairs.push(("formatversion".to_string(), "2".to_string()));
        for (key, value) in params {
            if !value.is_empty() {
                pairs.push(((*key).to_string(), value.clone()));
            }
        }

        for attempt in 0..=self.config.max_retries {
            self.apply_rate_limit(false);
            let response = self
                .client
                .get(&self.config.api_url)
                .header("User-Agent", self.config.user_agent.clone())
                .query(&pairs)
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < self.config.max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt, false);
                            continue;
                        }
                        bail!("MediaWiki API request failed with HTTP {status}");
                    }
                    return decode_api_payload(response);
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt, false);
                        continue;
                    }
                    return Err(error).context("failed to call MediaWiki API");
                }
            }
        }

        bail!("MediaWiki API request exhausted retry budget")
    }

    fn request_json_post(&mut self, params: &[(&str, String)], is_write: bool) -> Result<Value> {
        let max_retries = if is_write {
            self.config.max_write_retries
        } else {
            self.config.max_retries
        };
        let mut pairs = Vec::with_capacity(params.len() + 2);
        pairs.push(("format".to_string(), "json".to_string()));
        pairs.push(("formatversion".to_string(), "2".to_string()));
        for (key, value) in params {
            // Unlike reads, write params are kept even when empty: a blank
            // `text` is a legitimate page-blanking edit.
            pairs.push(((*key).to_string(), value.clone()));
        }

        for attempt in 0..=max_retries {
            self.apply_rate_limit(is_write);
            let response = self
                .client
                .post(&self.config.api_url)
                .header("User-Agent", self.config.user_agent.clone())
                .form(&pairs)
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt, is_write);
                            continue;
                        }
                        bail!("MediaWiki API request failed with HTTP {status}");
                    }
                    return decode_api_payload(response);
                }
                Err(error) => {
                    if attempt < max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt, is_write);
                        continue;
                    }
                    return Err(error).context("failed to call MediaWiki API");
                }
            }
        }

        bail!("MediaWiki API request exhausted retry budget")
    }

    fn apply_rate_limit(&mut self, is_write: bool) {
        let delay = if is_write {
            Duration::from_millis(self.config.rate_limit_write_ms)
        } else {
            Duration::from_millis(self.config.rate_limit_read_ms)
        };
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&self, attempt: usize, is_write: bool) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        let multiplier = if is_write { 2u64 } else { 1u64 };
        sleep(Duration::from_millis(
            base.saturating_mul(multiplier).saturating_add(jitter),
        ));
    }

    fn ensure_csrf_token(&mut self) -> Result<String> {
        if let Some(token) = &self.csrf_token {
            return Ok(token.clone());
        }
        let response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("meta", "tokens".to_string()),
        ])?;
        let parsed: TokenQueryResponse =
            serde_json::from_value(response).context("failed to decode csrf token response")?;
        let token = parsed
            .query
            .tokens
            .as_ref()
            .and_then(|tokens| tokens.csrftoken.as_ref())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("failed to get MediaWiki csrf token"))?;
        self.csrf_token = Some(token.clone());
        Ok(token)
    }
}

impl WikiEditApi for MediaWikiClient {
    fn get_text(&mut self, title: &str) -> Result<String> {
        let response = self.request_json_get(&[
            ("action", "query".to_string()),
            ("titles", title.to_string()),
            ("prop", "revisions".to_string()),
            ("rvprop", "content".to_string()),
            ("rvslots", "main".to_string()),
        ])?;
        let parsed: QueryResponse = serde_json::from_value(response)
            .context("failed to decode page content API response")?;

        let Some(page) = parsed.query.pages.into_iter().next() else {
            return Ok(String::new());
        };
        if page.missing.unwrap_or(false) {
            debug!(title, "page has no content yet");
            return Ok(String::new());
        }
        let content = page
            .revisions
            .first()
            .and_then(|revision| revision.slots.as_ref())
            .and_then(|slots| slots.main.as_ref())
            .map(|slot| slot.content.clone())
            .unwrap_or_default();
        Ok(content)
    }

    fn post_edit(&mut self, edit: &EditRequest) -> Result<()> {
        let mut params = vec![
            ("action", "edit".to_string()),
            ("title", edit.title.clone()),
            ("summary", edit.summary.clone()),
        ];
        match (&edit.text, &edit.append) {
            (Some(text), None) => params.push(("text", text.clone())),
            (None, Some(append)) => params.push(("appendtext", append.clone())),
            _ => bail!("edit request must set exactly one of text and appendtext"),
        }
        let token = self.ensure_csrf_token()?;
        params.push(("token", token));

        let response = self.request_json_post(&params, true)?;
        let payload: EditResponse =
            serde_json::from_value(response).context("failed to decode edit response")?;
        let result = payload.edit.and_then(|edit| edit.result);
        if result.as_deref() != Some("Success") {
            bail!(
                "MediaWiki edit failed for {}: {}",
                edit.title,
                result.unwrap_or_else(|| "unknown".to_string())
            );
        }
        Ok(())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

fn decode_api_payload(response: reqwest::blocking::Response) -> Result<Value> {
    let payload: Value = response
        .json()
        .context("failed to decode MediaWiki API JSON response")?;
    if let Some(error) = payload.get("error") {
        let code = error
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error");
        let info = error
            .get("info")
            .and_then(Value::as_str)
            .unwrap_or("unknown info");
        bail!("MediaWiki API error [{code}]: {info}");
    }
    Ok(payload)
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect()
}

fn env_value_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn env_value_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    query: QueryBody,
}

#[derive(Debug, Deserialize, Default)]
struct QueryBody {
    #[serde(default)]
    pages: Vec<PageBody>,
    #[serde(default)]
    tokens: Option<Tokens>,
}

#[derive(Debug, Deserialize)]
struct PageBody {
    #[serde(default)]
    missing: Option<bool>,
    #[serde(default)]
    revisions: Vec<Revision>,
}

#[derive(Debug, Deserialize)]
struct Revision {
    #[serde(default)]
    slots: Option<Slots>,
}

#[derive(Debug, Deserialize)]
struct Slots {
    #[serde(default)]
    main: Option<Slot>,
}

#[derive(Debug, Deserialize)]
struct Slot {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct Tokens {
    #[serde(default)]
    csrftoken: Option<String>,
    #[serde(default)]
    logintoken: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenQueryResponse {
    #[serde(default)]
    query: QueryBody,
}

#[derive(Debug, Deserialize)]
struct EditResponse {
    #[serde(default)]
    edit: Option<EditBody>,
}

#[derive(Debug, Deserialize)]
struct EditBody {
    #[serde(default)]
    result: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    login: LoginBody,
}

#[derive(Debug, Deserialize)]
struct LoginBody {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edit_request_validation_rejects_ambiguous_payload() {
        let config = MediaWikiClientConfig::new("https://example.org/w/api.php", "test/0.0");
        let mut client = MediaWikiClient::new(config).expect("client");
        // Both text and append set: rejected before any network call.
        let error = client
            .post_edit(&EditRequest {
                title: "User:X/common.js".to_string(),
                text: Some("a".to_string()),
                append: Some("b".to_string()),
                summary: "s".to_string(),
            })
            .expect_err("must fail");
        assert!(error.to_string().contains("exactly one"));
    }

    #[test]
    fn retryable_status_classification() {
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable_status(StatusCode::FORBIDDEN));
    }

    #[test]
    fn query_response_tolerates_missing_fields() {
        let parsed: QueryResponse = serde_json::from_value(serde_json::json!({})).expect("decode");
        assert!(parsed.query.pages.is_empty());
        assert!(parsed.query.tokens.is_none());
    }

    #[test]
    fn edit_response_decodes_result_field() {
        let parsed: EditResponse = serde_json::from_value(serde_json::json!({
            "edit": { "result": "Success", "pageid": 42, "newrevid": 7 }
        }))
        .expect("decode");
        assert_eq!(
            parsed.edit.and_then(|edit| edit.result).as_deref(),
            Some("Success")
        );

        let empty: EditResponse = serde_json::from_value(serde_json::json!({})).expect("decode");
        assert!(empty.edit.is_none());
    }

    #[test]
    fn page_content_decodes_from_formatversion_2_shape() {
        let parsed: QueryResponse = serde_json::from_value(serde_json::json!({
            "query": { "pages": [ {
                "title": "User:X/common.js",
                "revisions": [ { "slots": { "main": { "content": "importScript('A');" } } } ]
            } ] }
        }))
        .expect("decode");
        let page = &parsed.query.pages[0];
        assert_eq!(
            page.revisions[0]
                .slots
                .as_ref()
                .and_then(|slots| slots.main.as_ref())
                .map(|slot| slot.content.as_str()),
            Some("importScript('A');")
        );
    }
}
