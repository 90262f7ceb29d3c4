//! Durable target/snapshot store + HTTP fetch for schedwatch.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use schedwatch_core::{is_due, next_check_time, MonitoredTarget, ScheduleSnapshot};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "schedwatch-store";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// File-backed store for targets and their append-only snapshot history.
///
/// Layout under the root: `targets/<id>.json` holds one target record;
/// `snapshots/<target_id>/<stamp>_<id>.json` holds one snapshot, with the
/// checked-at stamp leading the filename so lexicographic order is
/// chronological order. All writes go through an atomic temp-file rename.
#[derive(Debug)]
pub struct WatchStore {
    root: PathBuf,
    target_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl WatchStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            target_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn target_path(&self, id: Uuid) -> PathBuf {
        self.root.join("targets").join(format!("{id}.json"))
    }

    fn snapshot_dir(&self, target_id: Uuid) -> PathBuf {
        self.root.join("snapshots").join(target_id.to_string())
    }

    async fn target_lock(&self, id: Uuid) -> Arc<Mutex<()>> {
        let mut map = self.target_locks.lock().await;
        map.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    pub async fn insert_target(&self, target: &MonitoredTarget) -> anyhow::Result<()> {
        let path = self.target_path(target.id);
        let bytes = serde_json::to_vec_pretty(target).context("serializing target")?;
        write_atomic(&path, &bytes).await
    }

    pub async fn get_target(&self, id: Uuid) -> anyhow::Result<Option<MonitoredTarget>> {
        read_json_opt(&self.target_path(id)).await
    }

    /// All targets, ordered by display name.
    pub async fn list_targets(&self) -> anyhow::Result<Vec<MonitoredTarget>> {
        let dir = self.root.join("targets");
        let mut targets: Vec<MonitoredTarget> = read_json_dir(&dir).await?;
        targets.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(targets)
    }

    /// Pure due-set query: reads state, never mutates it.
    pub async fn due_targets(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<MonitoredTarget>> {
        Ok(self
            .list_targets()
            .await?
            .into_iter()
            .filter(|t| is_due(t, now))
            .collect())
    }

    /// Select every due target and advance its `next_check_at` as one
    /// operation under that target's lock, so a concurrent tick cannot
    /// claim the same target for the same due window.
    pub async fn claim_due_targets(
        &self,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<MonitoredTarget>> {
        let mut claimed = Vec::new();
        for candidate in self.list_targets().await? {
            let lock = self.target_lock(candidate.id).await;
            let _guard = lock.lock().await;

            // Re-read under the lock; another tick may have claimed it.
            let Some(mut target) = self.get_target(candidate.id).await? else {
                continue;
            };
            if !is_due(&target, now) {
                continue;
            }
            target.next_check_at = next_check_time(target.target_date, now);
            target.updated_at = now;
            self.insert_target(&target).await?;
            claimed.push(target);
        }
        Ok(claimed)
    }

    /// Read-modify-write one target under its lock.
    pub async fn update_target<F>(
        &self,
        id: Uuid,
        mutate: F,
    ) -> anyhow::Result<Option<MonitoredTarget>>
    where
        F: FnOnce(&mut MonitoredTarget),
    {
        let lock = self.target_lock(id).await;
        let _guard = lock.lock().await;

        let Some(mut target) = self.get_target(id).await? else {
            return Ok(None);
        };
        mutate(&mut target);
        self.insert_target(&target).await?;
        Ok(Some(target))
    }

    /// Remove a target and its entire snapshot history.
    pub async fn delete_target(&self, id: Uuid) -> anyhow::Result<()> {
        let lock = self.target_lock(id).await;
        let _guard = lock.lock().await;

        let path = self.target_path(id);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("removing target {}", path.display()))
            }
        }
        let dir = self.snapshot_dir(id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("removing snapshots {}", dir.display())),
        }
    }

    /// Append one snapshot. Snapshots are immutable once written.
    pub async fn append_snapshot(&self, snapshot: &ScheduleSnapshot) -> anyhow::Result<()> {
        let stamp = snapshot.checked_at.format("%Y%m%dT%H%M%S%3fZ");
        let path = self
            .snapshot_dir(snapshot.target_id)
            .join(format!("{stamp}_{}.json", snapshot.id));
        let bytes = serde_json::to_vec_pretty(snapshot).context("serializing snapshot")?;
        write_atomic(&path, &bytes).await
    }

    /// Most recent snapshot for a target, if any.
    pub async fn latest_snapshot(
        &self,
        target_id: Uuid,
    ) -> anyhow::Result<Option<ScheduleSnapshot>> {
        let dir = self.snapshot_dir(target_id);
        let Some(latest) = list_files_sorted(&dir).await?.pop() else {
            return Ok(None);
        };
        read_json_opt(&latest).await
    }

    /// Full history for a target, newest first.
    pub async fn snapshots_for(&self, target_id: Uuid) -> anyhow::Result<Vec<ScheduleSnapshot>> {
        let dir = self.snapshot_dir(target_id);
        let mut out = Vec::new();
        for path in list_files_sorted(&dir).await?.into_iter().rev() {
            if let Some(snapshot) = read_json_opt(&path).await? {
                out.push(snapshot);
            }
        }
        Ok(out)
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .context("store paths always have a parent directory")?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating store directory {}", parent.display()))?;

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

    match fs::rename(&temp_path, path).await {
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

async fn read_json_opt<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => {
            let value = serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(Some(value))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

async fn read_json_dir<T: serde::de::DeserializeOwned>(dir: &Path) -> anyhow::Result<Vec<T>> {
    let mut out = Vec::new();
    for path in list_files_sorted(dir).await? {
        if let Some(value) = read_json_opt(&path).await? {
            out.push(value);
        }
    }
    Ok(out)
}

/// Regular `.json` files in `dir`, sorted ascending by filename. Missing
/// directory reads as empty. Temp files are skipped.
async fn list_files_sorted(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("reading {}", dir.display())),
    };
    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("reading {}", dir.display()))?
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// One bounded-timeout GET against a target page. A failed fetch abandons
/// the check cycle; the next cadence tick is the retry.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            global_concurrency: 8,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");

        let span = info_span!("page_fetch", url);
        let _guard = span.enter();

        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedPage {
            status,
            final_url,
            body,
        })
    }
}
