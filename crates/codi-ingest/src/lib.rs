//! Incremental ingestion pipeline: paginated fetch, raw archival,
//! curated merge and per-dataset watermark advancement.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use codi_core::{RawMeta, Row, RunContext, RunMode, WatermarkState};
use codi_extract::EntityExtractor;
use codi_storage::{
    sha256_hex, ObjectStore, RemoteSource, SodaClient, SodaClientConfig, SodaQuery, SourceError,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "codi-ingest";

pub const RAW_PREFIX: &str = "raw";
pub const CURATED_PREFIX: &str = "curated";
pub const INSIGHTS_PREFIX: &str = "insights";

pub const DEFAULT_PAGE_SIZE: usize = 2000;
pub const DEFAULT_SAFETY_LAG_HOURS: i64 = 2;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub data_root: PathBuf,
    pub soda_base_url: String,
    pub soda_app_token: Option<String>,
    pub page_size: usize,
    pub safety_lag_hours: i64,
    pub http_timeout_secs: u64,
    /// Opt-in downgrade of a malformed stored watermark to a bootstrap
    /// run. Off by default: an unparsable watermark fails the dataset
    /// rather than silently refetching everything.
    pub full_refetch_on_bad_watermark: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            soda_base_url: "https://data.sfgov.org/resource".to_string(),
            soda_app_token: None,
            page_size: DEFAULT_PAGE_SIZE,
            safety_lag_hours: DEFAULT_SAFETY_LAG_HOURS,
            http_timeout_secs: 30,
            full_refetch_on_bad_watermark: false,
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_root: std::env::var("CODI_DATA_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_root),
            soda_base_url: std::env::var("SODA_BASE").unwrap_or(defaults.soda_base_url),
            soda_app_token: std::env::var("SODA_APP_TOKEN").ok().filter(|t| !t.is_empty()),
            page_size: std::env::var("CODI_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.page_size),
            safety_lag_hours: std::env::var("CODI_SAFETY_LAG_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.safety_lag_hours),
            http_timeout_secs: std::env::var("CODI_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            full_refetch_on_bad_watermark: std::env::var("CODI_FULL_REFETCH_ON_BAD_WATERMARK")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
        }
    }

    pub fn safety_lag(&self) -> chrono::Duration {
        chrono::Duration::hours(self.safety_lag_hours)
    }

    pub fn soda_client(&self) -> anyhow::Result<SodaClient> {
        SodaClient::new(SodaClientConfig {
            base_url: self.soda_base_url.clone(),
            app_token: self.soda_app_token.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            ..Default::default()
        })
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unknown dataset {0:?}")]
    UnknownDataset(String),
    #[error("dataset {dataset}: stored watermark {value:?} is not a valid RFC 3339 timestamp")]
    MalformedWatermark { dataset: String, value: String },
    #[error("dataset {dataset}: incremental mode requested but no watermark is stored")]
    MissingWatermark { dataset: String },
    #[error("raw snapshot {key} already exists")]
    RawSnapshotExists { key: String },
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Immutable descriptor for one known dataset.
#[derive(Debug, Clone)]
pub struct DatasetConfig {
    pub key: String,
    pub source_id: String,
    pub primary_key: String,
    pub updated_field: String,
    pub extractor: EntityExtractor,
}

impl DatasetConfig {
    pub fn new(
        key: impl Into<String>,
        source_id: impl Into<String>,
        primary_key: impl Into<String>,
        updated_field: impl Into<String>,
        extractor: EntityExtractor,
    ) -> Self {
        Self {
            key: key.into(),
            source_id: source_id.into(),
            primary_key: primary_key.into(),
            updated_field: updated_field.into(),
            extractor,
        }
    }
}

/// Explicit dataset-key -> config map handed to the orchestrator at
/// construction time. Lookups of unregistered keys fail validation.
#[derive(Debug, Clone, Default)]
pub struct DatasetRegistry {
    datasets: BTreeMap<String, DatasetConfig>,
}

impl DatasetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, config: DatasetConfig) {
        self.datasets.insert(config.key.clone(), config);
    }

    pub fn with(mut self, config: DatasetConfig) -> Self {
        self.insert(config);
        self
    }

    pub fn get(&self, key: &str) -> Result<&DatasetConfig, IngestError> {
        self.datasets
            .get(key)
            .ok_or_else(|| IngestError::UnknownDataset(key.to_string()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(String::as_str)
    }

    /// The known city datasets, keyed by logical name.
    pub fn builtin() -> Self {
        Self::new()
            .with(DatasetConfig::new(
                "contractors",
                "3pee-9qhc",
                "contractor_id",
                ":updated_at",
                EntityExtractor::ContractorContact,
            ))
            .with(DatasetConfig::new(
                "permits_building",
                "i98e-djp9",
                "permit_number",
                ":updated_at",
                EntityExtractor::PermitBuilding,
            ))
            .with(DatasetConfig::new(
                "permits_plumbing",
                "k2ra-p3nq",
                "permit_number",
                ":updated_at",
                EntityExtractor::PermitPlumbing,
            ))
            .with(DatasetConfig::new(
                "complaints",
                "gm2e-bten",
                "complaint_number",
                ":updated_at",
                EntityExtractor::Complaint,
            ))
    }
}

/// Mode resolved for one dataset for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetMode {
    Bootstrap,
    Incremental { fetch_since: DateTime<Utc> },
}

impl DatasetMode {
    pub fn is_bootstrap(&self) -> bool {
        matches!(self, DatasetMode::Bootstrap)
    }

    /// Raw-tier tag for snapshots produced under this mode.
    pub fn snapshot_tag(&self) -> &'static str {
        match self {
            DatasetMode::Bootstrap => "full",
            DatasetMode::Incremental { .. } => "delta",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DatasetMode::Bootstrap => "bootstrap",
            DatasetMode::Incremental { .. } => "incremental",
        }
    }
}

/// Decides bootstrap vs incremental for one dataset and applies the
/// safety lag to the stored watermark.
pub fn resolve_dataset_mode(
    run_mode: RunMode,
    dataset: &str,
    watermark: Option<&WatermarkState>,
    safety_lag: chrono::Duration,
    full_refetch_on_bad_watermark: bool,
) -> Result<DatasetMode, IngestError> {
    if run_mode == RunMode::Bootstrap {
        return Ok(DatasetMode::Bootstrap);
    }

    let Some(state) = watermark else {
        return match run_mode {
            RunMode::Auto => Ok(DatasetMode::Bootstrap),
            RunMode::Incremental => Err(IngestError::MissingWatermark {
                dataset: dataset.to_string(),
            }),
            RunMode::Bootstrap => unreachable!("handled above"),
        };
    };

    match DateTime::parse_from_rfc3339(&state.watermark_updated_at) {
        Ok(parsed) => Ok(DatasetMode::Incremental {
            fetch_since: parsed.with_timezone(&Utc) - safety_lag,
        }),
        Err(_) if full_refetch_on_bad_watermark => {
            warn!(
                dataset,
                watermark = %state.watermark_updated_at,
                "malformed watermark; configured fallback forces a bootstrap refetch"
            );
            Ok(DatasetMode::Bootstrap)
        }
        Err(_) => Err(IngestError::MalformedWatermark {
            dataset: dataset.to_string(),
            value: state.watermark_updated_at.clone(),
        }),
    }
}

/// `{updated_field} > '{ts}'` predicate for the SODA `$where` clause.
pub fn update_filter(updated_field: &str, since: &DateTime<Utc>) -> String {
    format!(
        "{} > '{}'",
        updated_field,
        since.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

/// Per-dataset cursor state persisted at `curated/{dataset}/_state.json`.
#[derive(Debug, Clone)]
pub struct WatermarkStore {
    store: ObjectStore,
}

impl WatermarkStore {
    pub fn new(store: ObjectStore) -> Self {
        Self { store }
    }

    fn state_key(dataset: &str) -> String {
        format!("{CURATED_PREFIX}/{dataset}/_state.json")
    }

    pub async fn read(&self, dataset: &str) -> anyhow::Result<Option<WatermarkState>> {
        let key = Self::state_key(dataset);
        if !self.store.exists(&key).await? {
            return Ok(None);
        }
        let state = self.store.read_json(&key).await?;
        Ok(Some(state))
    }

    pub async fn write(&self, dataset: &str, state: &WatermarkState) -> anyhow::Result<()> {
        self.store.write_json(&Self::state_key(dataset), state).await
    }
}

/// Drives the remote source page by page until exhaustion, accumulating
/// one ordered batch. Memory is bounded by total matched rows per run.
pub struct PaginatedFetcher {
    source: Arc<dyn RemoteSource>,
    page_size: usize,
}

impl PaginatedFetcher {
    pub fn new(source: Arc<dyn RemoteSource>, page_size: usize) -> Self {
        Self {
            source,
            page_size: page_size.max(1),
        }
    }

    pub async fn fetch(
        &self,
        config: &DatasetConfig,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Row>, IngestError> {
        let where_clause = since.map(|ts| update_filter(&config.updated_field, &ts));
        let mut all_rows = Vec::new();
        let mut offset = 0usize;

        loop {
            let query = SodaQuery {
                limit: self.page_size,
                offset,
                order: config.updated_field.clone(),
                where_clause: where_clause.clone(),
            };
            debug!(dataset = %config.key, offset, "fetching page");
            let rows = self.source.fetch_rows(&config.source_id, &query).await?;
            if rows.is_empty() {
                break;
            }
            let page_len = rows.len();
            all_rows.extend(rows);
            if page_len < self.page_size {
                break;
            }
            offset += self.page_size;
        }

        Ok(all_rows)
    }
}

/// Write-once raw tier: the exact fetched batch plus sidecar metadata.
#[derive(Debug, Clone)]
pub struct RawArchiver {
    store: ObjectStore,
}

impl RawArchiver {
    pub fn new(store: ObjectStore) -> Self {
        Self { store }
    }

    pub async fn archive(
        &self,
        dataset: &str,
        run_id: &str,
        rows: &[Row],
        mode: DatasetMode,
    ) -> Result<RawMeta, IngestError> {
        let tag = mode.snapshot_tag();
        let snapshot_key = format!("{RAW_PREFIX}/{dataset}/{run_id}/{tag}.json");
        if self.store.exists(&snapshot_key).await? {
            return Err(IngestError::RawSnapshotExists { key: snapshot_key });
        }

        let payload = serde_json::to_vec(rows).context("serializing raw snapshot")?;
        let meta = RawMeta {
            row_count: rows.len(),
            extracted_at: Utc::now(),
            is_bootstrap: mode.is_bootstrap(),
            sha256: sha256_hex(&payload),
        };

        self.store.write_bytes(&snapshot_key, &payload).await?;
        self.store
            .write_json(&format!("{RAW_PREFIX}/{dataset}/{run_id}/meta.json"), &meta)
            .await?;
        info!(dataset, run_id, tag, rows = meta.row_count, "raw snapshot archived");
        Ok(meta)
    }
}

fn scalar_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Last-write-wins dedup by primary key under update-timestamp order.
///
/// The concatenated set is stably sorted by the update field's string
/// value (timestamps are ISO 8601, so lexicographic order is
/// chronological); rows missing the field sort first and therefore lose
/// ties. Rows without a primary-key value are retained untouched.
pub fn dedup_rows(mut rows: Vec<Row>, primary_key: &str, updated_field: &str) -> Vec<Row> {
    rows.sort_by_cached_key(|row| row.get(updated_field).and_then(scalar_string));

    let mut last_index: HashMap<String, usize> = HashMap::new();
    for (index, row) in rows.iter().enumerate() {
        if let Some(pk) = row.get(primary_key).and_then(scalar_string) {
            last_index.insert(pk, index);
        }
    }

    rows.into_iter()
        .enumerate()
        .filter(|(index, row)| match row.get(primary_key).and_then(scalar_string) {
            Some(pk) => last_index.get(&pk) == Some(index),
            None => true,
        })
        .map(|(_, row)| row)
        .collect()
}

/// Curated tier: whole-table read-modify-write with an atomic replace.
#[derive(Debug, Clone)]
pub struct CuratedMerger {
    store: ObjectStore,
}

impl CuratedMerger {
    pub fn new(store: ObjectStore) -> Self {
        Self { store }
    }

    fn table_prefix(dataset: &str) -> String {
        format!("{CURATED_PREFIX}/{dataset}/table")
    }

    pub fn table_key(dataset: &str) -> String {
        format!("{CURATED_PREFIX}/{dataset}/table/data.json")
    }

    pub async fn load(&self, dataset: &str) -> anyhow::Result<Vec<Row>> {
        let mut rows = Vec::new();
        for key in self.store.list(&Self::table_prefix(dataset), true).await? {
            let part: Vec<Row> = self.store.read_json(&key).await?;
            rows.extend(part);
        }
        Ok(rows)
    }

    /// Merges a delta into the curated table. An empty delta is a no-op:
    /// the table bytes are left untouched and 0 is returned.
    pub async fn merge(
        &self,
        config: &DatasetConfig,
        delta: Vec<Row>,
        mode: DatasetMode,
    ) -> Result<usize, IngestError> {
        if delta.is_empty() {
            info!(dataset = %config.key, "empty delta; curated table left untouched");
            return Ok(0);
        }

        let mut combined = if mode.is_bootstrap() {
            Vec::new()
        } else {
            self.load(&config.key).await?
        };
        let existing = combined.len();
        combined.extend(delta);

        let merged = dedup_rows(combined, &config.primary_key, &config.updated_field);
        self.store
            .write_json(&Self::table_key(&config.key), &merged)
            .await?;
        info!(
            dataset = %config.key,
            existing,
            merged = merged.len(),
            "curated table rewritten"
        );
        Ok(merged.len())
    }
}

/// Downstream aggregation artifact: per-dataset row counts plus a run
/// catalog and a `latest` pointer, derived from the curated outputs.
#[derive(Debug, Clone)]
pub struct InsightsCatalog {
    store: ObjectStore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsightsCatalogDoc {
    pub datasets: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

impl InsightsCatalog {
    pub fn new(store: ObjectStore) -> Self {
        Self { store }
    }

    pub async fn publish(&self, run_id: &str, datasets: &[String]) -> anyhow::Result<()> {
        self.store
            .mkdirs(&format!("{INSIGHTS_PREFIX}/{run_id}/summaries"))
            .await?;

        let merger = CuratedMerger::new(self.store.clone());
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for dataset in datasets {
            counts.insert(dataset.clone(), merger.load(dataset).await?.len());
        }

        self.store
            .write_json(&format!("{INSIGHTS_PREFIX}/{run_id}/summaries/counts.json"), &counts)
            .await?;

        let catalog = InsightsCatalogDoc {
            datasets: datasets.to_vec(),
            generated_at: Utc::now(),
        };
        self.store
            .write_json(&format!("{INSIGHTS_PREFIX}/{run_id}/catalog.json"), &catalog)
            .await?;
        self.store
            .write_json(&format!("{INSIGHTS_PREFIX}/latest/catalog.json"), &catalog)
            .await?;
        Ok(())
    }
}

/// Pipeline stage a dataset failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetching,
    Archiving,
    Extracting,
    Merging,
    AdvancingWatermark,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Fetching => write!(f, "fetching"),
            Stage::Archiving => write!(f, "archiving"),
            Stage::Extracting => write!(f, "extracting"),
            Stage::Merging => write!(f, "merging"),
            Stage::AdvancingWatermark => write!(f, "advancing-watermark"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetOutcome {
    pub dataset: String,
    pub status: DatasetStatus,
    pub mode: Option<String>,
    pub fetched_rows: usize,
    pub merged_rows: usize,
    pub failed_stage: Option<Stage>,
    pub error: Option<String>,
}

impl DatasetOutcome {
    fn succeeded(dataset: &str, mode: DatasetMode, fetched_rows: usize, merged_rows: usize) -> Self {
        Self {
            dataset: dataset.to_string(),
            status: DatasetStatus::Succeeded,
            mode: Some(mode.label().to_string()),
            fetched_rows,
            merged_rows,
            failed_stage: None,
            error: None,
        }
    }

    fn failed(dataset: &str, stage: Option<Stage>, error: &IngestError) -> Self {
        Self {
            dataset: dataset.to_string(),
            status: DatasetStatus::Failed,
            mode: None,
            fetched_rows: 0,
            merged_rows: 0,
            failed_stage: stage,
            error: Some(error.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == DatasetStatus::Succeeded
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<DatasetOutcome>,
}

impl RunSummary {
    pub fn succeeded(&self) -> impl Iterator<Item = &DatasetOutcome> {
        self.outcomes.iter().filter(|o| o.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &DatasetOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }
}

struct DatasetSuccess {
    mode: DatasetMode,
    fetched_rows: usize,
    merged_rows: usize,
}

/// Sequences the pipeline per target dataset: watermark read, mode
/// decision, fetch, raw archive, extraction, curated merge, watermark
/// advance. Failures are isolated per dataset.
pub struct IngestJob {
    ctx: RunContext,
    registry: DatasetRegistry,
    config: IngestConfig,
    watermarks: WatermarkStore,
    fetcher: PaginatedFetcher,
    archiver: RawArchiver,
    merger: CuratedMerger,
    insights: InsightsCatalog,
}

impl IngestJob {
    pub fn new(
        ctx: RunContext,
        registry: DatasetRegistry,
        store: ObjectStore,
        source: Arc<dyn RemoteSource>,
        config: IngestConfig,
    ) -> Self {
        let fetcher = PaginatedFetcher::new(source, config.page_size);
        Self {
            ctx,
            registry,
            watermarks: WatermarkStore::new(store.clone()),
            archiver: RawArchiver::new(store.clone()),
            merger: CuratedMerger::new(store.clone()),
            insights: InsightsCatalog::new(store),
            config,
            fetcher,
        }
    }

    pub async fn run(&self) -> RunSummary {
        let started_at = Utc::now();
        let mut outcomes = Vec::new();

        for dataset in &self.ctx.datasets {
            let outcome = match self.registry.get(dataset) {
                Err(err) => {
                    warn!(dataset, %err, "dataset failed validation");
                    DatasetOutcome::failed(dataset, None, &err)
                }
                Ok(config) => match self.process_dataset(config).await {
                    Ok(success) => {
                        info!(
                            dataset,
                            mode = success.mode.label(),
                            fetched = success.fetched_rows,
                            merged = success.merged_rows,
                            "dataset processed"
                        );
                        DatasetOutcome::succeeded(
                            dataset,
                            success.mode,
                            success.fetched_rows,
                            success.merged_rows,
                        )
                    }
                    Err((stage, err)) => {
                        warn!(dataset, %stage, %err, "dataset failed");
                        DatasetOutcome::failed(dataset, Some(stage), &err)
                    }
                },
            };
            outcomes.push(outcome);
        }

        let succeeded: Vec<String> = outcomes
            .iter()
            .filter(|o| o.is_success())
            .map(|o| o.dataset.clone())
            .collect();
        if let Err(err) = self.insights.publish(&self.ctx.run_id, &succeeded).await {
            warn!(%err, "insights publication failed; ingest results stand");
        }

        RunSummary {
            run_id: self.ctx.run_id.clone(),
            started_at,
            finished_at: Utc::now(),
            outcomes,
        }
    }

    async fn process_dataset(
        &self,
        config: &DatasetConfig,
    ) -> Result<DatasetSuccess, (Stage, IngestError)> {
        // Watermark advance is derived from this instant, not from the
        // max observed update timestamp; the safety lag on the next run
        // covers records the source was still writing.
        let processing_started = Utc::now();

        let watermark = self
            .watermarks
            .read(&config.key)
            .await
            .map_err(|e| (Stage::Fetching, IngestError::Storage(e)))?;
        let mode = resolve_dataset_mode(
            self.ctx.mode,
            &config.key,
            watermark.as_ref(),
            self.config.safety_lag(),
            self.config.full_refetch_on_bad_watermark,
        )
        .map_err(|e| (Stage::Fetching, e))?;
        info!(dataset = %config.key, mode = mode.label(), "mode resolved");

        let since = match mode {
            DatasetMode::Bootstrap => None,
            DatasetMode::Incremental { fetch_since } => Some(fetch_since),
        };
        let raw_rows = self
            .fetcher
            .fetch(config, since)
            .await
            .map_err(|e| (Stage::Fetching, e))?;

        self.archiver
            .archive(&config.key, &self.ctx.run_id, &raw_rows, mode)
            .await
            .map_err(|e| (Stage::Archiving, e))?;

        let output = config.extractor.run(&self.ctx.run_id, &raw_rows);
        for warning in &output.warnings {
            debug!(dataset = %config.key, %warning, "extractor warning");
        }
        let delta: Vec<Row> = output.rows.into_iter().map(|record| record.row).collect();

        let merged_rows = self
            .merger
            .merge(config, delta, mode)
            .await
            .map_err(|e| (Stage::Merging, e))?;

        let state = WatermarkState {
            watermark_updated_at: processing_started.to_rfc3339_opts(SecondsFormat::Secs, true),
            last_run_id: self.ctx.run_id.clone(),
        };
        self.watermarks
            .write(&config.key, &state)
            .await
            .map_err(|e| (Stage::AdvancingWatermark, IngestError::Storage(e)))?;

        Ok(DatasetSuccess {
            mode,
            fetched_rows: raw_rows.len(),
            merged_rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: serde_json::Value) -> Row {
        serde_json::from_value(value).expect("row fixture")
    }

    fn watermark(value: &str) -> WatermarkState {
        WatermarkState {
            watermark_updated_at: value.to_string(),
            last_run_id: "run-prev".to_string(),
        }
    }

    #[test]
    fn absent_watermark_under_auto_forces_bootstrap() {
        let mode = resolve_dataset_mode(
            RunMode::Auto,
            "contractors",
            None,
            chrono::Duration::hours(2),
            false,
        )
        .unwrap();
        assert_eq!(mode, DatasetMode::Bootstrap);
        assert_eq!(mode.snapshot_tag(), "full");
    }

    #[test]
    fn declared_bootstrap_wins_over_stored_watermark() {
        let state = watermark("2025-01-10T10:00:00Z");
        let mode = resolve_dataset_mode(
            RunMode::Bootstrap,
            "contractors",
            Some(&state),
            chrono::Duration::hours(2),
            false,
        )
        .unwrap();
        assert!(mode.is_bootstrap());
    }

    #[test]
    fn safety_lag_is_subtracted_from_the_watermark() {
        let state = watermark("2025-01-10T10:00:00Z");
        let mode = resolve_dataset_mode(
            RunMode::Auto,
            "contractors",
            Some(&state),
            chrono::Duration::hours(2),
            false,
        )
        .unwrap();
        let DatasetMode::Incremental { fetch_since } = mode else {
            panic!("expected incremental mode");
        };
        assert_eq!(
            update_filter(":updated_at", &fetch_since),
            ":updated_at > '2025-01-10T08:00:00Z'"
        );
    }

    #[test]
    fn incremental_without_watermark_is_an_error() {
        let err = resolve_dataset_mode(
            RunMode::Incremental,
            "contractors",
            None,
            chrono::Duration::hours(2),
            false,
        )
        .unwrap_err();
        assert!(matches!(err, IngestError::MissingWatermark { .. }));
    }

    #[test]
    fn malformed_watermark_fails_unless_fallback_is_configured() {
        let state = watermark("not-a-timestamp");
        let err = resolve_dataset_mode(
            RunMode::Auto,
            "contractors",
            Some(&state),
            chrono::Duration::hours(2),
            false,
        )
        .unwrap_err();
        assert!(matches!(err, IngestError::MalformedWatermark { .. }));

        let mode = resolve_dataset_mode(
            RunMode::Auto,
            "contractors",
            Some(&state),
            chrono::Duration::hours(2),
            true,
        )
        .unwrap();
        assert!(mode.is_bootstrap());
    }

    #[test]
    fn newer_timestamp_wins_dedup() {
        let rows = vec![
            row(json!({"pk": "1", ":updated_at": "2025-01-01T00:00:10Z", "v": "a"})),
            row(json!({"pk": "1", ":updated_at": "2025-01-01T00:00:12Z", "v": "b"})),
        ];
        let merged = dedup_rows(rows, "pk", ":updated_at");
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0]["v"], json!("b"));
    }

    #[test]
    fn delta_wins_ties_when_no_timestamp_field_exists() {
        let rows = vec![
            row(json!({"pk": "1", "v": "existing"})),
            row(json!({"pk": "1", "v": "delta"})),
        ];
        let merged = dedup_rows(rows, "pk", ":updated_at");
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0]["v"], json!("delta"));
    }

    #[test]
    fn rows_missing_the_timestamp_lose_to_rows_that_have_it() {
        let rows = vec![
            row(json!({"pk": "1", ":updated_at": "2025-01-01T00:00:00Z", "v": "dated"})),
            row(json!({"pk": "1", "v": "undated"})),
        ];
        let merged = dedup_rows(rows, "pk", ":updated_at");
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0]["v"], json!("dated"));
    }

    #[test]
    fn rows_without_primary_keys_are_retained() {
        let rows = vec![
            row(json!({"v": "anonymous-1"})),
            row(json!({"pk": "1", "v": "keyed"})),
            row(json!({"v": "anonymous-2"})),
        ];
        let merged = dedup_rows(rows, "pk", ":updated_at");
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn registry_rejects_unknown_keys() {
        let registry = DatasetRegistry::builtin();
        assert!(registry.get("contractors").is_ok());
        assert!(matches!(
            registry.get("not-a-dataset"),
            Err(IngestError::UnknownDataset(_))
        ));
    }
}
