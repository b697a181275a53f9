//! Load pipeline orchestration: fetch a report window, normalize it, refuse
//! batches that overlap stored rows, and append the rest.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tdl_client::{ReportClient, ReportClientConfig, DEFAULT_BASE_URL, DEFAULT_USER_AGENT};
use tdl_core::{Credentials, DetailTable, TimeWindow};
use tdl_storage::{DetailStore, PgDetailStore};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tdl-sync";

pub const PREEXISTING_MESSAGE: &str = "You are trying to upload a preexisting time entry.";

#[derive(Clone, Default)]
pub struct DatabaseConfig {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: String,
    pub name: String,
}

impl DatabaseConfig {
    pub fn url(&self) -> String {
        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.name
        )
    }

    pub fn redacted_url(&self) -> String {
        format!(
            "postgresql://{}:***@{}:{}/{}",
            self.user, self.host, self.port, self.name
        )
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted_url())
    }
}

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub credentials: Credentials,
    pub database: DatabaseConfig,
    pub user_agent: String,
    pub reports_base_url: String,
}

impl LoaderConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Values pass through verbatim; anything unset becomes an empty string.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).unwrap_or_default();
        Self {
            credentials: Credentials {
                api_key: var("APIKEY"),
                workspace_id: var("WORKSPACE_ID"),
            },
            database: DatabaseConfig {
                user: var("DATABASE_USER"),
                password: var("DATABASE_PASSWORD"),
                host: var("DATABASE_HOST"),
                port: var("DATABASE_PORT"),
                name: var("DATABASE_NAME"),
            },
            user_agent: lookup("TDL_USER_AGENT")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            reports_base_url: lookup("TDL_REPORTS_BASE_URL")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    pub fn client_config(&self) -> ReportClientConfig {
        ReportClientConfig {
            api_key: self.credentials.api_key.clone(),
            user_agent: self.user_agent.clone(),
            base_url: self.reports_base_url.clone(),
        }
    }
}

/// Optional overrides for one run; anything left `None` uses the defaults.
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    pub since: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
    pub workspace_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoadOutcome {
    Rejected { incoming: usize, overlapping: Vec<i64> },
    Saved { rows: u64 },
}

impl fmt::Display for LoadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadOutcome::Rejected { .. } => f.write_str(PREEXISTING_MESSAGE),
            LoadOutcome::Saved { rows } => {
                write!(f, "Successfully uploaded {rows} rows to the detail table!")
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub window: TimeWindow,
    pub workspace_id: String,
    pub fetched_rows: usize,
    pub outcome: LoadOutcome,
}

/// Identifiers present on both sides, ascending.
pub fn overlapping_ids(incoming: &BTreeSet<i64>, stored: &HashSet<i64>) -> Vec<i64> {
    incoming
        .iter()
        .filter(|id| stored.contains(*id))
        .copied()
        .collect()
}

/// Fetch and normalize without touching storage.
pub struct WindowFetcher {
    config: LoaderConfig,
    client: ReportClient,
    today: NaiveDate,
}

impl WindowFetcher {
    pub fn new(config: LoaderConfig) -> Result<Self> {
        let client = ReportClient::new(config.client_config())?;
        Ok(Self {
            config,
            client,
            today: chrono::Local::now().date_naive(),
        })
    }

    /// Pins the date that "yesterday" is computed from.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn resolve_window(&self, since: Option<NaiveDate>, until: Option<NaiveDate>) -> TimeWindow {
        TimeWindow::resolve(since, until, self.today)
    }

    pub fn resolve_workspace<'a>(&'a self, workspace_id: Option<&'a str>) -> &'a str {
        workspace_id.unwrap_or(self.config.credentials.workspace_id.as_str())
    }

    pub async fn fetch_window(
        &self,
        since: Option<NaiveDate>,
        until: Option<NaiveDate>,
        workspace_id: Option<&str>,
    ) -> Result<DetailTable> {
        let window = self.resolve_window(since, until);
        let workspace_id = self.resolve_workspace(workspace_id);
        self.fetch_resolved(&window, workspace_id).await
    }

    async fn fetch_resolved(&self, window: &TimeWindow, workspace_id: &str) -> Result<DetailTable> {
        let raw = self
            .client
            .fetch_detailed_report(window, workspace_id)
            .await
            .with_context(|| format!("fetching detailed report for {window}"))?;
        DetailTable::from_raw_records(raw).context("normalizing report records")
    }
}

pub struct LoadPipeline {
    fetcher: WindowFetcher,
    store: Arc<dyn DetailStore>,
}

impl LoadPipeline {
    pub fn new(config: LoaderConfig, store: Arc<dyn DetailStore>) -> Result<Self> {
        Ok(Self {
            fetcher: WindowFetcher::new(config)?,
            store,
        })
    }

    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.fetcher = self.fetcher.with_today(today);
        self
    }

    pub async fn fetch_window(
        &self,
        since: Option<NaiveDate>,
        until: Option<NaiveDate>,
        workspace_id: Option<&str>,
    ) -> Result<DetailTable> {
        self.fetcher.fetch_window(since, until, workspace_id).await
    }

    /// True iff any incoming id is already stored. One overlap rejects the batch.
    pub async fn has_preexisting_entries(&self, table: &DetailTable) -> Result<bool> {
        Ok(!self.preexisting_ids(table).await?.is_empty())
    }

    pub async fn preexisting_ids(&self, table: &DetailTable) -> Result<Vec<i64>> {
        if table.is_empty() {
            return Ok(Vec::new());
        }
        let stored = self
            .store
            .stored_ids()
            .await
            .context("loading stored detail ids")?;
        Ok(overlapping_ids(&table.ids(), &stored))
    }

    /// Appends the whole table; does not check for duplicates.
    pub async fn save(&self, table: &DetailTable) -> Result<u64> {
        self.store
            .append(table)
            .await
            .context("appending rows to detail table")
    }

    pub async fn run_once(&self, request: &FetchRequest) -> Result<LoadRunSummary> {
        let run_id = Uuid::new_v4();
        let window = self.fetcher.resolve_window(request.since, request.until);
        let workspace_id = self
            .fetcher
            .resolve_workspace(request.workspace_id.as_deref())
            .to_string();
        let span = info_span!("detail_load", %run_id, %window, workspace_id = %workspace_id);
        self.run_resolved(run_id, window, workspace_id)
            .instrument(span)
            .await
    }

    async fn run_resolved(
        &self,
        run_id: Uuid,
        window: TimeWindow,
        workspace_id: String,
    ) -> Result<LoadRunSummary> {
        let started_at = Utc::now();
        let table = self.fetcher.fetch_resolved(&window, &workspace_id).await?;
        let fetched_rows = table.len();

        // Check and save are separate round trips; concurrent runs can race here.
        let overlapping = self.preexisting_ids(&table).await?;
        let outcome = if overlapping.is_empty() {
            let rows = if table.is_empty() { 0 } else { self.save(&table).await? };
            let stored = self
                .store
                .row_count()
                .await
                .context("counting detail rows")?;
            info!(rows, stored, "detail batch saved");
            LoadOutcome::Saved { rows }
        } else {
            warn!(
                incoming = fetched_rows,
                overlapping = overlapping.len(),
                "batch contains preexisting entries; nothing saved"
            );
            LoadOutcome::Rejected {
                incoming: fetched_rows,
                overlapping,
            }
        };

        Ok(LoadRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            window,
            workspace_id,
            fetched_rows,
            outcome,
        })
    }
}

/// Full load against Postgres using configuration from the environment.
pub async fn run_load_once_from_env(request: &FetchRequest) -> Result<LoadRunSummary> {
    let config = LoaderConfig::from_env();
    let store = PgDetailStore::connect(&config.database.url())
        .await
        .with_context(|| format!("connecting to {}", config.database.redacted_url()))?;
    let pipeline = LoadPipeline::new(config, Arc::new(store))?;
    pipeline.run_once(request).await
}
