//! Remote analysis HTTP client + record storage backends for MPA.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mpa_core::{Flow, StoredRecord};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mpa-storage";

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
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff for job-start requests. Status polling has its own
/// interval policy in `mpa-sync`.
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
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
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

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub timeout: Duration,
    pub user_agent: String,
    pub backoff: BackoffPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            api_token: None,
            timeout: Duration::from_secs(20),
            user_agent: "mpa/0.1".to_string(),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("MPA_API_BASE_URL").unwrap_or(defaults.base_url),
            api_token: std::env::var("MPA_API_TOKEN").ok().filter(|v| !v.is_empty()),
            timeout: std::env::var("MPA_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            user_agent: std::env::var("MPA_USER_AGENT").unwrap_or(defaults.user_agent),
            backoff: defaults.backoff,
        }
    }
}

/// Failure talking to the remote analysis service. The rendered message is
/// what the poller pattern-matches on, so every variant carries the HTTP
/// status and a human-readable reason when one exists.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("http status {status} for {url}: {reason}")]
    HttpStatus {
        status: u16,
        url: String,
        reason: String,
    },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid response body: {0}")]
    InvalidResponse(String),
    #[error("job start returned an empty key")]
    EmptyKey,
    #[error("{0}")]
    Message(String),
}

/// Asks the remote side for the current state of a job.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn check_status(&self, key: &str, attempt: u32) -> Result<JsonValue, RemoteError>;
}

/// Kicks off a remote analysis and returns the key used to poll it.
#[async_trait]
pub trait JobStarter: Send + Sync {
    async fn start_job(&self, domain: &str, flow: Flow) -> Result<String, RemoteError>;
}

#[derive(Debug, Clone)]
pub struct AnalysisClient {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
    backoff: BackoffPolicy,
}

impl AnalysisClient {
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token,
            backoff: config.backoff,
        })
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

/// Pulls a short human-readable reason out of an error body.
fn error_reason(status: StatusCode, body: &str) -> String {
    let from_json = serde_json::from_str::<JsonValue>(body).ok().and_then(|v| {
        ["error", "message", "detail", "reason"]
            .iter()
            .find_map(|k| match v.get(*k) {
                Some(JsonValue::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
                Some(JsonValue::Object(inner)) => inner
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(ToString::to_string),
                _ => None,
            })
    });
    if let Some(reason) = from_json {
        return reason;
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return status.canonical_reason().unwrap_or("unknown").to_string();
    }
    trimmed.chars().take(200).collect()
}

fn key_from_start_response(value: &JsonValue) -> Option<String> {
    let candidates: [&[&str]; 5] = [
        &["conversation_id"],
        &["id"],
        &["key"],
        &["data", "conversation_id"],
        &["data", "id"],
    ];
    candidates.iter().find_map(|path| {
        let mut cur = value;
        for segment in path.iter() {
            cur = cur.get(*segment)?;
        }
        match cur {
            JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        }
    })
}

impl AnalysisClient {
    /// `{base}/analyses/{key}` with the key escaped as a single path segment.
    fn status_url(&self, key: &str) -> Result<reqwest::Url, RemoteError> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| RemoteError::Message(format!("invalid base url {}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|_| RemoteError::Message(format!("base url {} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .push("analyses")
            .push(key);
        Ok(url)
    }

    async fn post_start_request(&self, url: &str, body: &JsonValue) -> Result<String, RemoteError> {
        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self.authorized(self.client.post(url).json(body)).send().await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let text = resp.text().await?;

                    if status.is_success() {
                        let value: JsonValue = serde_json::from_str(&text)
                            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))?;
                        return key_from_start_response(&value).ok_or(RemoteError::EmptyKey);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(status = status.as_u16(), attempt, "retrying job start");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(RemoteError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        reason: error_reason(status, &text),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying job start");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(RemoteError::Request(err));
                }
            }
        }

        Err(RemoteError::Message(format!(
            "job start exhausted {} retries",
            self.backoff.max_retries
        )))
    }
}

#[async_trait]
impl JobStarter for AnalysisClient {
    async fn start_job(&self, domain: &str, flow: Flow) -> Result<String, RemoteError> {
        let url = format!("{}/analyses", self.base_url);
        let body = serde_json::json!({ "domain": domain, "flow": flow.as_str() });
        self.post_start_request(&url, &body)
            .instrument(info_span!("start_job", domain, %flow))
            .await
    }
}

#[async_trait]
impl StatusSource for AnalysisClient {
    async fn check_status(&self, key: &str, attempt: u32) -> Result<JsonValue, RemoteError> {
        let url = self.status_url(key)?;
        let resp = self
            .authorized(self.client.get(url).query(&[("attempt", attempt)]))
            .send()
            .instrument(info_span!("check_status", key, attempt))
            .await?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        let text = resp.text().await?;

        if !status.is_success() {
            return Err(RemoteError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
                reason: error_reason(status, &text),
            });
        }

        serde_json::from_str(&text).map_err(|e| RemoteError::InvalidResponse(e.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("serializing record payload: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Write-side metadata the reconciler decides on before inserting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMeta {
    pub version_no: u32,
    pub content_hash: String,
    pub session_id: Option<Uuid>,
}

/// Minimal storage contract: append a record under a normalized key and
/// fetch the most recently created one back.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert(
        &self,
        normalized_key: &str,
        flow: Flow,
        payload: JsonValue,
        meta: RecordMeta,
    ) -> Result<StoredRecord, StoreError>;

    async fn query_latest(
        &self,
        normalized_key: &str,
        flow: Flow,
    ) -> Result<Option<StoredRecord>, StoreError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn payload_hash(payload: &JsonValue) -> Result<String, StoreError> {
    Ok(sha256_hex(&serde_json::to_vec(payload)?))
}

fn new_record(normalized_key: &str, flow: Flow, payload: JsonValue, meta: RecordMeta) -> StoredRecord {
    StoredRecord {
        id: Uuid::new_v4(),
        normalized_key: normalized_key.to_string(),
        flow,
        version_no: meta.version_no,
        content_hash: meta.content_hash,
        session_id: meta.session_id,
        payload,
        created_at: Utc::now(),
    }
}

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<Vec<StoredRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_count(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn all(&self) -> Vec<StoredRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn insert(
        &self,
        normalized_key: &str,
        flow: Flow,
        payload: JsonValue,
        meta: RecordMeta,
    ) -> Result<StoredRecord, StoreError> {
        let record = new_record(normalized_key, flow, payload, meta);
        self.records.lock().await.push(record.clone());
        Ok(record)
    }

    async fn query_latest(
        &self,
        normalized_key: &str,
        flow: Flow,
    ) -> Result<Option<StoredRecord>, StoreError> {
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .filter(|r| r.normalized_key == normalized_key && r.flow == flow)
            .max_by_key(|r| (r.created_at, r.version_no))
            .cloned())
    }
}

/// One JSON file per record under `<root>/<key>/<flow>/`, written through a
/// temp file and an atomic rename.
#[derive(Debug, Clone)]
pub struct FileRecordStore {
    root: PathBuf,
}

impl FileRecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_dir(&self, normalized_key: &str, flow: Flow) -> PathBuf {
        let safe = normalized_key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect::<String>();
        let safe = if safe.is_empty() || safe.chars().all(|c| c == '.') {
            "_".to_string()
        } else {
            safe
        };
        self.root.join(safe).join(flow.as_str())
    }

    fn record_file_name(created_at: DateTime<Utc>, version_no: u32, id: Uuid) -> String {
        let stamp = created_at.format("%Y%m%dT%H%M%S%.6fZ");
        format!("{stamp}_{version_no:06}_{id}.json")
    }

    async fn write_atomically(&self, path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
        let parent = path.parent().context("record path always has parent")?;
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating record directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp record file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp record file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp record file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp record {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn insert(
        &self,
        normalized_key: &str,
        flow: Flow,
        payload: JsonValue,
        meta: RecordMeta,
    ) -> Result<StoredRecord, StoreError> {
        let record = new_record(normalized_key, flow, payload, meta);
        let path = self
            .key_dir(normalized_key, flow)
            .join(Self::record_file_name(record.created_at, record.version_no, record.id));
        let bytes = serde_json::to_vec_pretty(&record)?;
        self.write_atomically(&path, &bytes).await?;
        debug!(path = %path.display(), version_no = record.version_no, "record written");
        Ok(record)
    }

    async fn query_latest(
        &self,
        normalized_key: &str,
        flow: Flow,
    ) -> Result<Option<StoredRecord>, StoreError> {
        let dir = self.key_dir(normalized_key, flow);
        if !fs::try_exists(&dir)
            .await
            .with_context(|| format!("checking record directory {}", dir.display()))?
        {
            return Ok(None);
        }

        let mut latest: Option<StoredRecord> = None;
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("reading record directory {}", dir.display()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", dir.display()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            let path = entry.path();
            let text = fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let record: StoredRecord = match serde_json::from_str(&text) {
                Ok(record) => record,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable record file");
                    continue;
                }
            };
            if record.normalized_key != normalized_key {
                continue;
            }
            let newer = match &latest {
                Some(cur) => (record.created_at, record.version_no) >= (cur.created_at, cur.version_no),
                None => true,
            };
            if newer {
                latest = Some(record);
            }
        }
        Ok(latest)
    }
}

const CREATE_RECORDS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS analysis_records (
    id             UUID PRIMARY KEY,
    normalized_key TEXT NOT NULL,
    flow           TEXT NOT NULL,
    version_no     INTEGER NOT NULL,
    content_hash   TEXT NOT NULL,
    session_id     UUID NULL,
    payload        JSONB NOT NULL,
    created_at     TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

const CREATE_RECORDS_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS analysis_records_key_flow_created_idx
    ON analysis_records (normalized_key, flow, created_at DESC)
"#;

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        Ok(Self {
            pool: PgPool::connect(database_url).await?,
        })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_RECORDS_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_RECORDS_INDEX).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn insert(
        &self,
        normalized_key: &str,
        flow: Flow,
        payload: JsonValue,
        meta: RecordMeta,
    ) -> Result<StoredRecord, StoreError> {
        let record = new_record(normalized_key, flow, payload, meta);
        sqlx::query(
            r#"
            INSERT INTO analysis_records
                (id, normalized_key, flow, version_no, content_hash, session_id, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.id)
        .bind(&record.normalized_key)
        .bind(record.flow.as_str())
        .bind(record.version_no as i32)
        .bind(&record.content_hash)
        .bind(record.session_id)
        .bind(&record.payload)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(record)
    }

    async fn query_latest(
        &self,
        normalized_key: &str,
        flow: Flow,
    ) -> Result<Option<StoredRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, normalized_key, flow, version_no, content_hash, session_id, payload, created_at
              FROM analysis_records
             WHERE normalized_key = $1
               AND flow = $2
             ORDER BY created_at DESC, version_no DESC
             LIMIT 1
            "#,
        )
        .bind(normalized_key)
        .bind(flow.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let flow_text: String = row.try_get("flow")?;
        let version_no: i32 = row.try_get("version_no")?;
        Ok(Some(StoredRecord {
            id: row.try_get("id")?,
            normalized_key: row.try_get("normalized_key")?,
            flow: flow_text.parse().map_err(|e: String| anyhow::anyhow!(e))?,
            version_no: u32::try_from(version_no).unwrap_or_default(),
            content_hash: row.try_get("content_hash")?,
            session_id: row.try_get("session_id")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
        }))
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: Option<String>,
    pub records_dir: PathBuf,
}

impl StoreConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            records_dir: std::env::var("MPA_RECORDS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./records")),
        }
    }
}

/// Postgres when `DATABASE_URL` is set, the file store otherwise.
pub async fn open_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn RecordStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgRecordStore::connect(url)
                .await
                .context("connecting to record database")?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(FileRecordStore::new(config.records_dir.clone()))),
    }
}
