//! Atomic keyed object storage + SODA remote source for CODI.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use codi_core::Row;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "codi-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Error)]
pub enum StoreKeyError {
    #[error("object key cannot be empty")]
    Empty,
    #[error("object key {0:?} escapes the store root")]
    Escapes(String),
}

/// Hierarchical key-value store rooted at a mounted directory.
///
/// Writes go through a temp file plus rename on the same filesystem, so a
/// reader never observes a partially-written object.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Normalizes a relative key: strips leading slashes, rejects empty
    /// keys and `..` segments.
    fn normalize_key(key: &str) -> Result<String, StoreKeyError> {
        let key = key.trim_start_matches('/').replace('\\', "/");
        if key.is_empty() {
            return Err(StoreKeyError::Empty);
        }
        if key.split('/').any(|seg| seg == "..") {
            return Err(StoreKeyError::Escapes(key));
        }
        Ok(key)
    }

    fn abs(&self, key: &str) -> anyhow::Result<PathBuf> {
        let key = Self::normalize_key(key)?;
        Ok(self.root.join(key))
    }

    pub async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        let path = self.abs(key)?;
        fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))
    }

    pub async fn mkdirs(&self, prefix: &str) -> anyhow::Result<()> {
        let path = self.abs(prefix)?;
        fs::create_dir_all(&path)
            .await
            .with_context(|| format!("creating {}", path.display()))
    }

    pub async fn read_bytes(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.abs(key)?;
        fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))
    }

    pub async fn read_text(&self, key: &str) -> anyhow::Result<String> {
        let path = self.abs(key)?;
        fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))
    }

    pub async fn read_json<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<T> {
        let text = self.read_text(key).await?;
        serde_json::from_str(&text).with_context(|| format!("parsing {key} as JSON"))
    }

    /// Atomic write: temp file in the target directory, then rename.
    pub async fn write_bytes(&self, key: &str, bytes: &[u8]) -> anyhow::Result<()> {
        let path = self.abs(key)?;
        let parent = path
            .parent()
            .with_context(|| format!("object key {key:?} has no parent directory"))?;
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming {} -> {}",
                        temp_path.display(),
                        path.display()
                    )
                })
            }
        }
    }

    pub async fn write_text(&self, key: &str, text: &str) -> anyhow::Result<()> {
        self.write_bytes(key, text.as_bytes()).await
    }

    pub async fn write_json<T: Serialize>(&self, key: &str, value: &T) -> anyhow::Result<()> {
        let mut bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("serializing {key} as JSON"))?;
        bytes.push(b'\n');
        self.write_bytes(key, &bytes).await
    }

    /// Lists file keys under a prefix, relative to the store root. Missing
    /// prefixes list as empty; a file key lists as itself.
    pub async fn list(&self, prefix: &str, recursive: bool) -> anyhow::Result<Vec<String>> {
        let root = self.abs(prefix)?;
        if !fs::try_exists(&root)
            .await
            .with_context(|| format!("checking {}", root.display()))?
        {
            return Ok(Vec::new());
        }
        let meta = fs::metadata(&root)
            .await
            .with_context(|| format!("stat {}", root.display()))?;
        if meta.is_file() {
            return Ok(vec![ObjectStore::normalize_key(prefix)?]);
        }

        let mut out = Vec::new();
        let mut pending = vec![root];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .with_context(|| format!("listing {}", dir.display()))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .with_context(|| format!("listing {}", dir.display()))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .with_context(|| format!("stat {}", path.display()))?;
                if file_type.is_dir() {
                    if recursive {
                        pending.push(path);
                    }
                } else {
                    let rel = path
                        .strip_prefix(&self.root)
                        .unwrap_or(&path)
                        .to_string_lossy()
                        .replace('\\', "/");
                    out.push(rel);
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// One page request against a SODA resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SodaQuery {
    pub limit: usize,
    pub offset: usize,
    pub order: String,
    pub where_clause: Option<String>,
}

impl SodaQuery {
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("$limit".to_string(), self.limit.to_string()),
            ("$offset".to_string(), self.offset.to_string()),
            ("$order".to_string(), self.order.clone()),
        ];
        if let Some(where_clause) = &self.where_clause {
            params.push(("$where".to_string(), where_clause.clone()));
        }
        params
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {message}")]
    Decode { url: String, message: String },
}

/// Paginated remote row source, filterable and orderable by an
/// update-timestamp field.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn fetch_rows(&self, dataset_id: &str, query: &SodaQuery)
        -> Result<Vec<Row>, SourceError>;
}

#[derive(Debug, Clone)]
pub struct SodaClientConfig {
    pub base_url: String,
    pub app_token: Option<String>,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for SodaClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://data.sfgov.org/resource".to_string(),
            app_token: None,
            timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// SODA HTTP client with capped exponential retry on transient failures.
#[derive(Debug)]
pub struct SodaClient {
    client: reqwest::Client,
    base_url: String,
    app_token: Option<String>,
    backoff: BackoffPolicy,
}

impl SodaClient {
    pub fn new(config: SodaClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            app_token: config.app_token,
            backoff: config.backoff,
        })
    }

    fn resource_url(&self, dataset_id: &str) -> String {
        format!("{}/{}.json", self.base_url, dataset_id)
    }
}

#[async_trait]
impl RemoteSource for SodaClient {
    async fn fetch_rows(
        &self,
        dataset_id: &str,
        query: &SodaQuery,
    ) -> Result<Vec<Row>, SourceError> {
        let url = self.resource_url(dataset_id);
        let params = query.to_params();
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut request = self
                .client
                .get(&url)
                .query(&params)
                .header("Accept", "application/json");
            if let Some(token) = &self.app_token {
                request = request.header("X-App-Token", token);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?;
                        return serde_json::from_slice(&body).map_err(|e| SourceError::Decode {
                            url: final_url,
                            message: e.to_string(),
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%url, status = status.as_u16(), attempt, "retrying page fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(SourceError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(SourceError::Request(err));
                }
            }
        }

        Err(SourceError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn keys_are_normalized_and_validated() {
        assert_eq!(
            ObjectStore::normalize_key("/raw/contractors/r1/full.json").unwrap(),
            "raw/contractors/r1/full.json"
        );
        assert!(matches!(
            ObjectStore::normalize_key(""),
            Err(StoreKeyError::Empty)
        ));
        assert!(matches!(
            ObjectStore::normalize_key("raw/../escape"),
            Err(StoreKeyError::Escapes(_))
        ));
    }

    #[tokio::test]
    async fn json_round_trip_is_atomic_and_nested() {
        let dir = tempdir().expect("tempdir");
        let store = ObjectStore::new(dir.path());

        store
            .write_json("curated/contractors/_state.json", &serde_json::json!({"n": 1}))
            .await
            .expect("write");
        assert!(store.exists("curated/contractors/_state.json").await.unwrap());

        let value: serde_json::Value = store
            .read_json("curated/contractors/_state.json")
            .await
            .expect("read");
        assert_eq!(value["n"], 1);

        // no temp droppings left behind
        let keys = store.list("curated", true).await.unwrap();
        assert_eq!(keys, vec!["curated/contractors/_state.json".to_string()]);
    }

    #[tokio::test]
    async fn list_respects_recursion_flag() {
        let dir = tempdir().expect("tempdir");
        let store = ObjectStore::new(dir.path());
        store.write_text("a/top.txt", "x").await.unwrap();
        store.write_text("a/b/nested.txt", "y").await.unwrap();

        let shallow = store.list("a", false).await.unwrap();
        assert_eq!(shallow, vec!["a/top.txt".to_string()]);

        let deep = store.list("a", true).await.unwrap();
        assert_eq!(
            deep,
            vec!["a/b/nested.txt".to_string(), "a/top.txt".to_string()]
        );

        let missing = store.list("does-not-exist", true).await.unwrap();
        assert!(missing.is_empty());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn soda_query_builds_params_in_order() {
        let query = SodaQuery {
            limit: 2000,
            offset: 4000,
            order: ":updated_at".to_string(),
            where_clause: Some(":updated_at > '2025-01-10T08:00:00Z'".to_string()),
        };
        let params = query.to_params();
        assert_eq!(params[0], ("$limit".to_string(), "2000".to_string()));
        assert_eq!(params[1], ("$offset".to_string(), "4000".to_string()));
        assert_eq!(params[2], ("$order".to_string(), ":updated_at".to_string()));
        assert_eq!(
            params[3],
            (
                "$where".to_string(),
                ":updated_at > '2025-01-10T08:00:00Z'".to_string()
            )
        );
    }

    #[test]
    fn sha256_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
