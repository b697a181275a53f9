//! Authenticated HTTP client for the detailed time-entry report endpoint.

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tdl_core::TimeWindow;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "tdl-client";

pub const DEFAULT_BASE_URL: &str = "https://api.track.toggl.com";
pub const DETAILED_REPORT_PATH: &str = "/reports/api/v2/details";
pub const DEFAULT_USER_AGENT: &str = "TimeTrackerDashboard";

/// Fixed password half of the token credential.
const API_TOKEN_PASSWORD: &str = "api_token";

#[derive(Clone)]
pub struct ReportClientConfig {
    pub api_key: String,
    pub user_agent: String,
    pub base_url: String,
}

impl Default for ReportClientConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

impl std::fmt::Debug for ReportClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportClientConfig")
            .field("api_key", &"<redacted>")
            .field("user_agent", &self.user_agent)
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Transport,
    Decode,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("unexpected report body from {url}: {reason}")]
    Decode { url: String, reason: String },
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::Request(_) | FetchError::HttpStatus { .. } => FetchErrorKind::Transport,
            FetchError::Decode { .. } => FetchErrorKind::Decode,
        }
    }
}

/// `Authorization` value for an API key; empty when no key is configured so the
/// remote service, not this client, decides whether the request is allowed.
pub fn authorization_value(api_key: &str) -> String {
    if api_key.is_empty() {
        return String::new();
    }
    let credential = format!("{api_key}:{API_TOKEN_PASSWORD}");
    format!("Basic {}", BASE64.encode(credential))
}

#[derive(Debug, Deserialize)]
struct DetailedReportBody {
    #[serde(default)]
    total_count: Option<u64>,
    data: Vec<JsonValue>,
}

fn decode_report_body(body: &[u8]) -> Result<DetailedReportBody, String> {
    serde_json::from_slice(body).map_err(|err| err.to_string())
}

#[derive(Debug)]
pub struct ReportClient {
    client: reqwest::Client,
    endpoint: String,
    user_agent: String,
}

impl ReportClient {
    pub fn new(config: ReportClientConfig) -> anyhow::Result<Self> {
        let mut authorization = HeaderValue::from_str(&authorization_value(&config.api_key))
            .context("building authorization header")?;
        authorization.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, authorization);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}{}",
                config.base_url.trim_end_matches('/'),
                DETAILED_REPORT_PATH
            ),
            user_agent: config.user_agent,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Issues one GET for the window and returns the body's `data` records as-is.
    pub async fn fetch_detailed_report(
        &self,
        window: &TimeWindow,
        workspace_id: &str,
    ) -> Result<Vec<JsonValue>, FetchError> {
        let span = info_span!("report_fetch", workspace_id, window = %window);
        self.fetch_inner(window, workspace_id).instrument(span).await
    }

    async fn fetch_inner(
        &self,
        window: &TimeWindow,
        workspace_id: &str,
    ) -> Result<Vec<JsonValue>, FetchError> {
        let query = [
            ("workspace_id", workspace_id.to_string()),
            ("since", window.since_param()),
            ("until", window.until_param()),
            ("user_agent", self.user_agent.clone()),
        ];

        let resp = self.client.get(&self.endpoint).query(&query).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await?;
        let report = decode_report_body(&body).map_err(|reason| FetchError::Decode {
            url: final_url,
            reason,
        })?;

        // No pagination: anything past the first page is not fetched.
        if let Some(total) = report.total_count {
            if total > report.data.len() as u64 {
                warn!(
                    total_count = total,
                    returned = report.data.len(),
                    "report truncated; only the first page was fetched"
                );
            }
        }
        info!(records = report.data.len(), "fetched detailed report");
        Ok(report.data)
    }
}
