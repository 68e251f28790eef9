//! Durable crawl state (scan registry + property dataset) and HTTP fetch utilities.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use inmo_core::{timestamp, CrawlMode, Fingerprint, ListingRecord};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "inmo-storage";

/// Staged records between two automatic checkpoint writes.
pub const DEFAULT_CHECKPOINT_EVERY: usize = 10;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("writing {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("serializing {path}: {source}")]
    Serialize {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("moving unreadable {path} aside: {source}")]
    Quarantine {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Serialize `value` as pretty JSON and atomically replace `path` via temp-file rename.
///
/// On any failure the previous content of `path` is left untouched.
pub async fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .map_err(|source| StoreError::Write {
            path: parent.clone(),
            source,
        })?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "state.json".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let written = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, path).await
    }
    .await;

    if let Err(source) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::Write {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}

/// Read JSON state from `path`.
///
/// A missing file yields `Ok(None)`. A file that exists but does not parse is
/// moved aside to `<path>.corrupt-<timestamp>` and also yields `Ok(None)`, so the
/// next write never clobbers the only copy of the damaged data.
pub async fn read_json_or_quarantine<T: DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, StoreError> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    match serde_json::from_str(&text) {
        Ok(value) => Ok(Some(value)),
        Err(err) => {
            let aside = quarantine_path(path);
            warn!(
                path = %path.display(),
                moved_to = %aside.display(),
                error = %err,
                "unreadable state file; starting from empty state"
            );
            fs::rename(path, &aside)
                .await
                .map_err(|source| StoreError::Quarantine {
                    path: path.to_path_buf(),
                    source,
                })?;
            Ok(None)
        }
    }
}

fn quarantine_path(path: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S");
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".corrupt-{stamp}"));
    path.with_file_name(name)
}

async fn remove_if_exists(path: &Path) -> Result<bool, StoreError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(StoreError::Write {
            path: path.to_path_buf(),
            source,
        }),
    }
}

// ---------------------------------------------------------------------------
// Scan registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanEntry {
    pub content_fingerprint: Fingerprint,
    /// Price/status as shown on the listing page, kept apart from the detail-page fingerprint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint_fingerprint: Option<Fingerprint>,
    #[serde(deserialize_with = "timestamp::deserialize")]
    pub last_scanned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovedEntry {
    #[serde(deserialize_with = "timestamp::deserialize")]
    pub removed_at: DateTime<Utc>,
    #[serde(default)]
    pub last_fingerprint: Option<Fingerprint>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryStats {
    pub total_known: usize,
    #[serde(deserialize_with = "timestamp::deserialize_opt")]
    pub last_incremental_scan: Option<DateTime<Utc>>,
    pub changes_detected: usize,
    pub removed_total: usize,
}

/// On-disk shape of the registry file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryFile {
    pub active_scans: BTreeMap<String, ScanEntry>,
    pub removed_scans: BTreeMap<String, RemovedEntry>,
    #[serde(deserialize_with = "timestamp::deserialize_opt")]
    pub last_full_run: Option<DateTime<Utc>>,
    pub stats: RegistryStats,
}

/// Per-address fingerprint bookkeeping that decides whether a known item needs re-fetching.
///
/// An address lives in exactly one of the active or removed maps.
#[derive(Debug, Clone)]
pub struct ScanRegistry {
    path: PathBuf,
    mode: CrawlMode,
    state: RegistryFile,
}

impl ScanRegistry {
    pub fn empty(path: impl Into<PathBuf>, mode: CrawlMode) -> Self {
        Self {
            path: path.into(),
            mode,
            state: RegistryFile::default(),
        }
    }

    /// Never fails: a missing or unreadable registry starts empty.
    pub async fn load(path: impl Into<PathBuf>, mode: CrawlMode) -> Self {
        let path = path.into();
        let state = match read_json_or_quarantine::<RegistryFile>(&path).await {
            Ok(Some(state)) => state,
            Ok(None) => RegistryFile::default(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "registry load failed; using empty registry");
                RegistryFile::default()
            }
        };
        let mut registry = Self { path, mode, state };
        registry.enforce_disjoint();
        info!(
            active = registry.state.active_scans.len(),
            removed = registry.state.removed_scans.len(),
            "scan registry loaded"
        );
        registry
    }

    // A hand-edited file may list an address in both maps; the active entry wins.
    fn enforce_disjoint(&mut self) {
        let active = &self.state.active_scans;
        self.state.removed_scans.retain(|address, _| !active.contains_key(address));
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> CrawlMode {
        self.mode
    }

    pub fn fingerprint_of(price: Option<i64>, status: Option<&str>) -> Fingerprint {
        Fingerprint::of(price, status)
    }

    pub fn needs_scan(&self, address: &str, price: Option<i64>, status: Option<&str>) -> bool {
        if self.mode.is_full() {
            return true;
        }
        match self.state.active_scans.get(address) {
            None => true,
            Some(entry) => entry.content_fingerprint != Fingerprint::of(price, status),
        }
    }

    pub fn record_scanned(&mut self, address: &str, price: Option<i64>, status: Option<&str>) {
        let hint_fingerprint = self
            .state
            .active_scans
            .get(address)
            .and_then(|entry| entry.hint_fingerprint.clone());
        self.state.active_scans.insert(
            address.to_string(),
            ScanEntry {
                content_fingerprint: Fingerprint::of(price, status),
                hint_fingerprint,
                last_scanned_at: Utc::now(),
            },
        );
        if self.state.removed_scans.remove(address).is_some() {
            debug!(address, "address resurrected");
        }
        self.state.stats.total_known = self.state.active_scans.len();
    }

    pub fn is_known(&self, address: &str) -> bool {
        self.state.active_scans.contains_key(address)
    }

    pub fn is_removed(&self, address: &str) -> bool {
        self.state.removed_scans.contains_key(address)
    }

    pub fn known_addresses(&self) -> BTreeSet<String> {
        self.state.active_scans.keys().cloned().collect()
    }

    /// Whether the listing-page price/status moved since it was last recorded.
    ///
    /// Unknown addresses count as changed. A known address without a stored hint
    /// takes the current one as its baseline and counts as unchanged.
    pub fn hint_changed(&mut self, address: &str, price: Option<i64>, status: Option<&str>) -> bool {
        let hint = Fingerprint::of(price, status);
        match self.state.active_scans.get_mut(address) {
            None => true,
            Some(entry) => match &entry.hint_fingerprint {
                Some(previous) => *previous != hint,
                None => {
                    entry.hint_fingerprint = Some(hint);
                    false
                }
            },
        }
    }

    /// Stores the listing-page hint for an address already recorded as scanned.
    pub fn record_hint(&mut self, address: &str, price: Option<i64>, status: Option<&str>) {
        if let Some(entry) = self.state.active_scans.get_mut(address) {
            entry.hint_fingerprint = Some(Fingerprint::of(price, status));
        }
    }

    /// Moves each address from active to removed bookkeeping. Returns how many were newly removed.
    pub fn mark_removed<I, S>(&mut self, addresses: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let now = Utc::now();
        let mut newly_removed = 0;
        for address in addresses {
            let address = address.as_ref();
            let previous = self.state.active_scans.remove(address);
            if self.state.removed_scans.contains_key(address) {
                continue;
            }
            self.state.removed_scans.insert(
                address.to_string(),
                RemovedEntry {
                    removed_at: now,
                    last_fingerprint: previous.map(|e| e.content_fingerprint),
                },
            );
            newly_removed += 1;
        }
        self.state.stats.removed_total += newly_removed;
        self.state.stats.total_known = self.state.active_scans.len();
        newly_removed
    }

    pub fn mark_full_run(&mut self) {
        self.state.last_full_run = Some(Utc::now());
    }

    pub fn update_stats(&mut self, changes_detected: usize) {
        if !self.mode.is_full() {
            self.state.stats.last_incremental_scan = Some(Utc::now());
        }
        self.state.stats.changes_detected += changes_detected;
    }

    pub fn stats(&self) -> &RegistryStats {
        &self.state.stats
    }

    pub fn last_full_run(&self) -> Option<DateTime<Utc>> {
        self.state.last_full_run
    }

    pub fn active_len(&self) -> usize {
        self.state.active_scans.len()
    }

    pub fn removed_len(&self) -> usize {
        self.state.removed_scans.len()
    }

    pub async fn persist(&mut self) -> Result<(), StoreError> {
        self.state.stats.total_known = self.state.active_scans.len();
        write_json_atomic(&self.path, &self.state).await?;
        debug!(path = %self.path.display(), active = self.state.active_scans.len(), "registry persisted");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Property store
// ---------------------------------------------------------------------------

/// Either dataset shape accepted on load.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DatasetFile {
    Flat(Vec<ListingRecord>),
    Grouped(BTreeMap<String, Vec<ListingRecord>>),
}

impl DatasetFile {
    pub fn into_records(self) -> Vec<ListingRecord> {
        match self {
            DatasetFile::Flat(records) => records,
            DatasetFile::Grouped(groups) => groups.into_values().flatten().collect(),
        }
    }
}

/// Reads a dataset file in either shape; missing file means no records.
pub async fn load_records(path: &Path) -> Result<Vec<ListingRecord>, StoreError> {
    Ok(read_json_or_quarantine::<DatasetFile>(path)
        .await?
        .map(DatasetFile::into_records)
        .unwrap_or_default())
}

/// Collapses records sharing a detail address, keeping first-appearance order.
///
/// The surviving record is the one with the earliest `first_seen_at`; on an
/// exact tie, the one with the later `last_updated_at` (a missing update
/// timestamp sorts before any present one).
pub fn dedupe_by_address(records: impl IntoIterator<Item = ListingRecord>) -> Vec<ListingRecord> {
    let mut out: Vec<ListingRecord> = Vec::new();
    let mut slots: HashMap<String, usize> = HashMap::new();
    for record in records {
        match slots.get(&record.detail_address) {
            None => {
                slots.insert(record.detail_address.clone(), out.len());
                out.push(record);
            }
            Some(&slot) => {
                let kept = &out[slot];
                let replace = record.first_seen_at < kept.first_seen_at
                    || (record.first_seen_at == kept.first_seen_at
                        && record.last_updated_at > kept.last_updated_at);
                if replace {
                    out[slot] = record;
                }
            }
        }
    }
    out
}

fn group_by_source(records: Vec<ListingRecord>) -> BTreeMap<String, Vec<ListingRecord>> {
    let mut groups: BTreeMap<String, Vec<ListingRecord>> = BTreeMap::new();
    for record in records {
        groups
            .entry(record.source_name.clone())
            .or_default()
            .push(record);
    }
    groups
}

/// Normalized listing dataset with merge, removal marking and checkpointed staging.
#[derive(Debug)]
pub struct PropertyStore {
    dataset_path: PathBuf,
    checkpoint_path: PathBuf,
    checkpoint_every: usize,
    existing: Vec<ListingRecord>,
    index: HashMap<String, usize>,
    staged: BTreeMap<String, Vec<ListingRecord>>,
    staged_total: usize,
}

impl PropertyStore {
    pub fn empty(dataset_path: impl Into<PathBuf>, checkpoint_path: impl Into<PathBuf>) -> Self {
        Self::from_records(dataset_path.into(), checkpoint_path.into(), Vec::new())
    }

    fn from_records(
        dataset_path: PathBuf,
        checkpoint_path: PathBuf,
        records: Vec<ListingRecord>,
    ) -> Self {
        let mut store = Self {
            dataset_path,
            checkpoint_path,
            checkpoint_every: DEFAULT_CHECKPOINT_EVERY,
            existing: dedupe_by_address(records),
            index: HashMap::new(),
            staged: BTreeMap::new(),
            staged_total: 0,
        };
        store.reindex();
        store
    }

    /// Loads the durable dataset and folds in any checkpoint an interrupted run left behind.
    pub async fn open(
        dataset_path: impl Into<PathBuf>,
        checkpoint_path: impl Into<PathBuf>,
    ) -> Result<Self, StoreError> {
        let dataset_path = dataset_path.into();
        let checkpoint_path = checkpoint_path.into();

        let mut records = load_records(&dataset_path).await?;
        let loaded = records.len();
        let recovered = load_records(&checkpoint_path).await?;
        if !recovered.is_empty() {
            warn!(
                checkpoint = %checkpoint_path.display(),
                records = recovered.len(),
                "found checkpoint from an interrupted run; folding it into the dataset"
            );
            records.extend(recovered);
        }

        let store = Self::from_records(dataset_path, checkpoint_path, records);
        info!(
            loaded,
            unique = store.existing.len(),
            path = %store.dataset_path.display(),
            "property store opened"
        );
        Ok(store)
    }

    pub fn with_checkpoint_every(mut self, every: usize) -> Self {
        self.checkpoint_every = every.max(1);
        self
    }

    fn reindex(&mut self) {
        self.index = self
            .existing
            .iter()
            .enumerate()
            .map(|(i, r)| (r.detail_address.clone(), i))
            .collect();
    }

    pub fn dataset_path(&self) -> &Path {
        &self.dataset_path
    }

    pub fn checkpoint_path(&self) -> &Path {
        &self.checkpoint_path
    }

    /// Records loaded from disk (plus in-run merges and removals), excluding staged ones.
    pub fn records(&self) -> &[ListingRecord] {
        &self.existing
    }

    pub fn get(&self, address: &str) -> Option<&ListingRecord> {
        self.index.get(address).map(|&i| &self.existing[i])
    }

    pub fn contains(&self, address: &str) -> bool {
        self.index.contains_key(address)
    }

    pub fn existing_by_address(&self) -> HashMap<&str, &ListingRecord> {
        self.existing
            .iter()
            .map(|r| (r.detail_address.as_str(), r))
            .collect()
    }

    pub fn staged_len(&self) -> usize {
        self.staged.values().map(Vec::len).sum()
    }

    pub fn staged_by_source(&self) -> BTreeMap<&str, usize> {
        self.staged
            .iter()
            .map(|(source, records)| (source.as_str(), records.len()))
            .collect()
    }

    fn all_records(&self) -> Vec<ListingRecord> {
        self.existing
            .iter()
            .chain(self.staged.values().flatten())
            .cloned()
            .collect()
    }

    /// Buffers a newly fetched record; every `checkpoint_every`-th stage writes a checkpoint.
    pub async fn stage(&mut self, record: ListingRecord) -> Result<(), StoreError> {
        self.staged
            .entry(record.source_name.clone())
            .or_default()
            .push(record);
        self.staged_total += 1;
        if self.staged_total % self.checkpoint_every == 0 {
            self.checkpoint().await?;
        }
        Ok(())
    }

    /// Writes existing + staged records, flat, to the checkpoint file.
    pub async fn checkpoint(&self) -> Result<(), StoreError> {
        let all = self.all_records();
        write_json_atomic(&self.checkpoint_path, &all).await?;
        info!(records = all.len(), path = %self.checkpoint_path.display(), "checkpoint written");
        Ok(())
    }

    /// Replaces the stored record when price or status changed, keeping its original
    /// `first_seen_at` and stamping `last_updated_at`. Returns whether anything changed.
    pub fn merge_if_changed(&mut self, address: &str, mut incoming: ListingRecord) -> bool {
        let Some(&slot) = self.index.get(address) else {
            return false;
        };
        let current = &self.existing[slot];
        if current.fingerprint() == incoming.fingerprint() {
            debug!(address, reference = %incoming.reference_code, "no change");
            return false;
        }
        incoming.first_seen_at = current.first_seen_at;
        incoming.last_updated_at = Some(Utc::now());
        incoming.detail_address = address.to_string();
        debug!(address, reference = %incoming.reference_code, "record updated");
        self.existing[slot] = incoming;
        true
    }

    /// Flags every listed address that is not already removed. Returns how many changed.
    pub fn mark_removed<I, S>(&mut self, addresses: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let now = Utc::now();
        let mut count = 0;
        for address in addresses {
            if let Some(&slot) = self.index.get(address.as_ref()) {
                if self.existing[slot].mark_removed(now) {
                    debug!(address = address.as_ref(), "record marked removed");
                    count += 1;
                }
            }
        }
        count
    }

    /// Merges staged records into the dataset, dedupes, writes the durable file
    /// and drops the checkpoint. Returns the final record count.
    pub async fn finalize(&mut self, group_by_source_flag: bool) -> Result<usize, StoreError> {
        let merged = dedupe_by_address(self.all_records());
        let count = merged.len();

        if group_by_source_flag {
            let grouped = group_by_source(merged.clone());
            write_json_atomic(&self.dataset_path, &grouped).await?;
        } else {
            write_json_atomic(&self.dataset_path, &merged).await?;
        }

        if remove_if_exists(&self.checkpoint_path).await? {
            debug!(path = %self.checkpoint_path.display(), "checkpoint removed");
        }

        self.existing = merged;
        self.staged.clear();
        self.staged_total = 0;
        self.reindex();
        info!(records = count, path = %self.dataset_path.display(), grouped = group_by_source_flag, "dataset written");
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

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

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
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
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sequential HTTP client with retry on transient failures.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    user_agent: String,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let user_agent = config
            .user_agent
            .clone()
            .unwrap_or_else(|| format!("inmo/{}", env!("CARGO_PKG_VERSION")));
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(user_agent.clone())
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            user_agent,
            backoff: config.backoff,
        })
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url).instrument(span).await
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        Ok(self.fetch_bytes(url).await?.text())
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            let retry = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp
                            .bytes()
                            .await
                            .map_err(|source| FetchError::Request {
                                url: url.to_string(),
                                source,
                            })?
                            .to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }
                    let err = FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    };
                    (classify_status(status), err)
                }
                Err(source) => (
                    classify_reqwest_error(&source),
                    FetchError::Request {
                        url: url.to_string(),
                        source,
                    },
                ),
            };

            let (disposition, err) = retry;
            if disposition == RetryDisposition::NonRetryable || attempt >= self.backoff.max_retries {
                return Err(err);
            }
            let delay = self.backoff.delay_for_attempt(attempt);
            debug!(attempt, ?delay, error = %err, "retrying fetch");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
