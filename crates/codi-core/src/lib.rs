//! Core domain model and handoff contracts for CODI.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "codi-core";

/// A raw or normalized row: field name to JSON value, schema-less by design.
pub type Row = BTreeMap<String, JsonValue>;

/// Declared run mode. `Auto` picks bootstrap or incremental per dataset
/// based on whether a watermark is already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Auto,
    Bootstrap,
    Incremental,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Auto => write!(f, "auto"),
            RunMode::Bootstrap => write!(f, "bootstrap"),
            RunMode::Incremental => write!(f, "incremental"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseRunModeError(pub String);

impl fmt::Display for ParseRunModeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown run mode {:?} (expected auto, bootstrap or incremental)",
            self.0
        )
    }
}

impl std::error::Error for ParseRunModeError {}

impl FromStr for RunMode {
    type Err = ParseRunModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(RunMode::Auto),
            "bootstrap" => Ok(RunMode::Bootstrap),
            "incremental" => Ok(RunMode::Incremental),
            other => Err(ParseRunModeError(other.to_string())),
        }
    }
}

/// Per-invocation context; immutable for the lifetime of the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: String,
    pub mode: RunMode,
    pub datasets: Vec<String>,
    pub prev_run_id: Option<String>,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>, mode: RunMode, datasets: Vec<String>) -> Self {
        Self {
            run_id: run_id.into(),
            mode,
            datasets,
            prev_run_id: None,
        }
    }

    pub fn with_prev_run_id(mut self, prev_run_id: Option<String>) -> Self {
        self.prev_run_id = prev_run_id;
        self
    }

    pub fn generated_run_id() -> String {
        Uuid::new_v4().to_string()
    }
}

/// Persisted per-dataset cursor state at `curated/{dataset}/_state.json`.
///
/// The watermark is stored as the original string so that an unparsable
/// value survives round-trips and can be reported verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkState {
    pub watermark_updated_at: String,
    pub last_run_id: String,
}

/// Sidecar metadata written next to every raw snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMeta {
    pub row_count: usize,
    pub extracted_at: DateTime<Utc>,
    pub is_bootstrap: bool,
    pub sha256: String,
}

/// Extractor output row: entity tag, optional canonical key, and the full
/// row including normalized derivative fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub entity: String,
    pub canonical_key: Option<String>,
    pub row: Row,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractStats {
    pub count: usize,
}

/// Handoff contract from extractors into the merge step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractOutput {
    pub request_id: String,
    pub entity: String,
    pub rows: Vec<NormalizedRecord>,
    pub stats: ExtractStats,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ExtractOutput {
    pub fn new(request_id: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            entity: entity.into(),
            rows: Vec::new(),
            stats: ExtractStats::default(),
            warnings: Vec::new(),
        }
    }

    pub fn push(&mut self, record: NormalizedRecord) {
        self.rows.push(record);
        self.stats.count = self.rows.len();
    }
}
