//! Authenticated portal session.
//!
//! The portal is a legacy ASP.NET application: every POST must echo back the
//! hidden `__VIEWSTATE` / `__EVENTVALIDATION` tokens of the page it targets,
//! and exports are triggered by re-submitting the usage page's own form with
//! a handful of override fields. Login success has no reliable status-code
//! contract, so it is scored from textual signals in the final response.
//! The signal set is kept exactly as observed against the live portal.

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, DNT};
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::types::{Credentials, DateRange, FetchError, Resolution};

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36";
const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7";

/// Final URL segment of the authenticated account landing page.
const AUTHENTICATED_URL_MARKER: &str = "MY_ACCOUNT_RSF.aspx";
/// Final URL segment of a successful export redirect.
const EXPORT_URL_MARKER: &str = "TRANSACTIONS_EXCEL_DOWNLOAD.aspx";

/// Body markers of an authenticated page.
const SUCCESS_MARKERS: [&str; 5] = ["Welcome", "Dashboard", "Account", "Usage", "Logout"];

// ── Portal seam ─────────────────────────────────────────────────────────

/// The portal operations the fetch orchestrator depends on. `PortalSession`
/// is the production implementation; tests substitute canned portals.
#[async_trait]
pub trait UsagePortal: Send + Sync {
    /// Authenticate the session. Never raises; `false` covers missing
    /// tokens, rejected credentials, and transport failures alike.
    async fn login(&mut self) -> bool;

    /// Run the two-phase export form dance for one resolution and range,
    /// returning the raw export body.
    async fn fetch_export(
        &mut self,
        resolution: Resolution,
        range: DateRange,
    ) -> Result<Vec<u8>, FetchError>;
}

// ── Production session ──────────────────────────────────────────────────

pub struct PortalSession {
    http: Client,
    base_url: String,
    credentials: Credentials,
    forms: FormExtractor,
}

impl PortalSession {
    pub fn new(base_url: &str, credentials: Credentials, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_HTML));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        headers.insert(DNT, HeaderValue::from_static("1"));
        headers.insert(
            "Upgrade-Insecure-Requests",
            HeaderValue::from_static("1"),
        );

        let http = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .cookie_store(true)
            .timeout(timeout)
            .build()
            .context("build portal http client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            forms: FormExtractor::new(),
        })
    }

    async fn try_login(&self) -> Result<bool, reqwest::Error> {
        let login_url = format!("{}/", self.base_url);
        debug!(url = %login_url, user = %self.credentials.username_prefix(), "fetching login page");

        let response = self.http.get(&login_url).send().await?;
        let page = response.text().await?;

        let Some(viewstate) = self.forms.named_input_value(&page, "__VIEWSTATE") else {
            warn!("login page is missing the view-state token");
            return Ok(false);
        };
        let Some(eventvalidation) = self.forms.named_input_value(&page, "__EVENTVALIDATION") else {
            warn!("login page is missing the event-validation token");
            return Ok(false);
        };
        let generator = self
            .forms
            .named_input_value(&page, "__VIEWSTATEGENERATOR")
            .unwrap_or_default();

        let form: Vec<(&str, String)> = vec![
            ("__EVENTTARGET", String::new()),
            ("__EVENTARGUMENT", String::new()),
            ("__VIEWSTATE", viewstate),
            ("__VIEWSTATEGENERATOR", generator),
            ("__SCROLLPOSITIONX", "0".to_string()),
            ("__SCROLLPOSITIONY", "0".to_string()),
            ("__EVENTVALIDATION", eventvalidation),
            ("tb_USER_ID", self.credentials.username.clone()),
            ("tb_USER_PSWD", self.credentials.password.clone()),
            ("cb_REMEMBER_ME", "on".to_string()),
            ("btn_SIGN_IN_BUTTON", "Sign+in".to_string()),
        ];

        debug!("submitting login form");
        let response = self.http.post(&login_url).form(&form).send().await?;
        let status = response.status();
        let final_url = response.url().to_string();

        if status != StatusCode::OK {
            warn!(status = %status, "login failed with non-200 status");
            return Ok(false);
        }

        let body = response.text().await?;
        let verdict = evaluate_login_response(&final_url, &body);
        debug!(url = %final_url, verdict, "scored login response");
        Ok(verdict)
    }

    async fn try_fetch_export(
        &self,
        resolution: Resolution,
        range: DateRange,
    ) -> Result<Vec<u8>, FetchError> {
        let page_url = format!("{}/{}", self.base_url, resolution.page());
        debug!(url = %page_url, resolution = %resolution, range = %range, "loading usage page");

        let response = self.http.get(&page_url).send().await?;
        let page = response.text().await?;

        let mut fields = self.forms.form_fields(&page);
        debug!(count = fields.len(), "extracted usage form fields");

        fields.insert("img_EXCEL_DOWNLOAD_IMAGE.x".to_string(), "8".to_string());
        fields.insert("img_EXCEL_DOWNLOAD_IMAGE.y".to_string(), "13".to_string());
        fields.insert(
            "tb_DAILY_USE".to_string(),
            resolution.export_label().to_string(),
        );
        fields.insert(
            "SD".to_string(),
            range.start.format("%m/%d/%Y").to_string(),
        );
        fields.insert("ED".to_string(), range.end.format("%m/%d/%Y").to_string());
        fields.insert("dl_UOM".to_string(), "GALLONS".to_string());

        let response = self.http.post(&page_url).form(&fields).send().await?;
        let final_url = response.url().to_string();

        if !final_url.contains(EXPORT_URL_MARKER) {
            return Err(FetchError::ExportRejected { url: final_url });
        }

        let body = response.bytes().await?;
        debug!(bytes = body.len(), "export download complete");
        Ok(body.to_vec())
    }
}

#[async_trait]
impl UsagePortal for PortalSession {
    async fn login(&mut self) -> bool {
        match self.try_login().await {
            Ok(verdict) => verdict,
            Err(err) => {
                warn!(
                    err = %err,
                    user = %self.credentials.username_prefix(),
                    "transport failure during login"
                );
                false
            }
        }
    }

    async fn fetch_export(
        &mut self,
        resolution: Resolution,
        range: DateRange,
    ) -> Result<Vec<u8>, FetchError> {
        self.try_fetch_export(resolution, range).await
    }
}

// ── Login scoring ───────────────────────────────────────────────────────

/// Score the final login response. Success requires at least one success
/// signal and zero failure signals; anything else is a failure. The signal
/// set matches the live portal's observed behavior.
pub fn evaluate_login_response(final_url: &str, body: &str) -> bool {
    let lower = body.to_lowercase();

    let success_score = std::iter::once(final_url.contains(AUTHENTICATED_URL_MARKER))
        .chain(SUCCESS_MARKERS.iter().map(|marker| body.contains(marker)))
        .filter(|hit| *hit)
        .count();

    let failure_signals = [
        body.contains("Invalid") && lower.contains("password"),
        body.contains("Login failed"),
        body.contains("Authentication failed"),
        body.contains("Error") && lower.contains("login"),
        body.contains("Please try again"),
        final_url.ends_with('/'),
    ];
    let failure_score = failure_signals.iter().filter(|hit| **hit).count();

    success_score > 0 && failure_score == 0
}

// ── Hidden form field extraction ────────────────────────────────────────

/// Regex-based extraction of named `<input>` fields. Compiled once and kept
/// on the session for its lifetime.
struct FormExtractor {
    input_tag: Regex,
    name_attr: Regex,
    value_attr: Regex,
    form_open: Regex,
    form_close: Regex,
}

impl FormExtractor {
    fn new() -> Self {
        Self {
            input_tag: Regex::new(r"(?is)<input\b[^>]*>").unwrap(),
            name_attr: Regex::new(r#"(?is)\bname\s*=\s*["']([^"']*)["']"#).unwrap(),
            value_attr: Regex::new(r#"(?is)\bvalue\s*=\s*["']([^"']*)["']"#).unwrap(),
            form_open: Regex::new(r"(?i)<form\b").unwrap(),
            form_close: Regex::new(r"(?i)</form>").unwrap(),
        }
    }

    /// Value of the first `<input name=...>` matching `name` anywhere in the
    /// page. `None` when the input is absent or carries no value attribute.
    fn named_input_value(&self, html: &str, name: &str) -> Option<String> {
        for tag in self.input_tag.find_iter(html) {
            let tag = tag.as_str();
            let Some(tag_name) = self.name_attr.captures(tag).map(|c| c[1].to_string()) else {
                continue;
            };
            if tag_name == name {
                return self.value_attr.captures(tag).map(|c| c[1].to_string());
            }
        }
        None
    }

    /// All named inputs of the page's first form, missing values defaulting
    /// to the empty string.
    fn form_fields(&self, html: &str) -> HashMap<String, String> {
        let mut fields = HashMap::new();

        let Some(open) = self.form_open.find(html) else {
            return fields;
        };
        let rest = &html[open.start()..];
        let form = match self.form_close.find(rest) {
            Some(close) => &rest[..close.end()],
            None => rest,
        };

        for tag in self.input_tag.find_iter(form) {
            let tag = tag.as_str();
            if let Some(name) = self.name_attr.captures(tag).map(|c| c[1].to_string()) {
                let value = self
                    .value_attr
                    .captures(tag)
                    .map(|c| c[1].to_string())
                    .unwrap_or_default();
                fields.insert(name, value);
            }
        }

        fields
    }
}
