//! Reconciliation of discovered listings against durable crawl state, and the run driver.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use inmo_adapters::{
    build_adapter, dedupe_discovered, AdapterSettings, AllowAll, DiscoveredItem, PolitenessGate,
    RobotsGate, SourceAdapter,
};
use inmo_core::{CrawlMode, ListingRecord, RecordOrigin, RunStatistics};
use inmo_storage::{
    load_records, HttpClientConfig, HttpFetcher, PropertyStore, ScanRegistry,
    DEFAULT_CHECKPOINT_EVERY,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, error, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "inmo-sync";

pub const DEFAULT_REGISTRY_FLUSH_EVERY: usize = 20;
pub const DEFAULT_CRAWL_DELAY_MS: u64 = 1000;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub adapter: AdapterSettings,
}

fn default_enabled() -> bool {
    true
}

pub async fn load_source_registry(path: &Path) -> Result<SourceRegistry> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub data_dir: PathBuf,
    pub listings_file: PathBuf,
    pub registry_file: PathBuf,
    pub checkpoint_file: PathBuf,
    pub sources_file: PathBuf,
    pub mode: CrawlMode,
    pub item_cap: Option<usize>,
    pub group_by_source: bool,
    pub delay: Duration,
    pub checkpoint_every: usize,
    pub registry_flush_every: usize,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub respect_robots: bool,
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

impl CrawlConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; unset keys take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let data_dir = lookup("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let in_data_dir = |key: &str, default_name: &str| {
            lookup(key)
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join(default_name))
        };
        let mode = match lookup("CRAWL_MODE") {
            Some(raw) => raw.parse::<CrawlMode>().context("CRAWL_MODE")?,
            None => CrawlMode::default(),
        };
        let item_cap = match lookup("CRAWL_ITEM_CAP").filter(|v| !v.trim().is_empty()) {
            Some(raw) => Some(raw.trim().parse::<usize>().context("CRAWL_ITEM_CAP")?),
            None => None,
        };

        Ok(Self {
            listings_file: in_data_dir("LISTINGS_FILE", "listings.json"),
            registry_file: in_data_dir("REGISTRY_FILE", "scan_registry.json"),
            checkpoint_file: in_data_dir("CHECKPOINT_FILE", "listings.checkpoint.json"),
            sources_file: lookup("SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("sources.yaml")),
            data_dir,
            mode,
            item_cap,
            group_by_source: lookup("GROUP_BY_SOURCE").map(|v| parse_flag(&v)).unwrap_or(false),
            delay: Duration::from_millis(
                lookup("CRAWL_DELAY_MS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_CRAWL_DELAY_MS),
            ),
            checkpoint_every: lookup("CHECKPOINT_EVERY")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_CHECKPOINT_EVERY),
            registry_flush_every: lookup("REGISTRY_FLUSH_EVERY")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_REGISTRY_FLUSH_EVERY),
            user_agent: lookup("INMO_USER_AGENT")
                .unwrap_or_else(|| format!("inmo/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs: lookup("INMO_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            respect_robots: lookup("RESPECT_ROBOTS").map(|v| parse_flag(&v)).unwrap_or(true),
        })
    }

    pub fn reconcile_options(&self) -> ReconcileOptions {
        ReconcileOptions {
            mode: self.mode,
            item_cap: self.item_cap,
            delay: self.delay,
            registry_flush_every: self.registry_flush_every.max(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub mode: CrawlMode,
    pub item_cap: Option<usize>,
    pub delay: Duration,
    pub registry_flush_every: usize,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            mode: CrawlMode::Incremental,
            item_cap: None,
            delay: Duration::from_millis(DEFAULT_CRAWL_DELAY_MS),
            registry_flush_every: DEFAULT_REGISTRY_FLUSH_EVERY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchPlan {
    /// Not yet materialized in the dataset; staged on success.
    New,
    /// Already materialized; merged when price or status moved.
    Changed,
}

/// Per-source reconciliation: removal detection, fetch planning and the fetch loop.
pub struct SourceReconciler<'a> {
    options: &'a ReconcileOptions,
    gate: &'a dyn PolitenessGate,
}

impl<'a> SourceReconciler<'a> {
    pub fn new(options: &'a ReconcileOptions, gate: &'a dyn PolitenessGate) -> Self {
        Self { options, gate }
    }

    pub async fn reconcile(
        &self,
        adapter: &dyn SourceAdapter,
        registry: &mut ScanRegistry,
        store: &mut PropertyStore,
    ) -> Result<RunStatistics> {
        let source = adapter.source_name().to_string();
        let span = info_span!("source", source = %source, mode = %self.options.mode);
        self.reconcile_inner(&source, adapter, registry, store)
            .instrument(span)
            .await
    }

    async fn reconcile_inner(
        &self,
        source: &str,
        adapter: &dyn SourceAdapter,
        registry: &mut ScanRegistry,
        store: &mut PropertyStore,
    ) -> Result<RunStatistics> {
        let mut stats = RunStatistics::default();

        let discovered = dedupe_discovered(
            adapter
                .discover()
                .await
                .with_context(|| format!("discovery failed for {source}"))?,
        );
        if discovered.is_empty() {
            warn!("discovery returned nothing; skipping source without removal detection");
            return Ok(stats);
        }
        stats.discovered = discovered.len();

        stats.removed = self.detect_removals(source, &discovered, registry, store);

        let mut plan = Vec::new();
        for item in discovered {
            let address = item.detail_address.as_str();
            match store.get(address) {
                None => plan.push((item, FetchPlan::New)),
                Some(existing) => {
                    stats.known += 1;
                    if existing.removed || self.options.mode.is_full() {
                        plan.push((item, FetchPlan::Changed));
                        continue;
                    }
                    if !registry.is_known(address) {
                        registry.record_scanned(address, existing.price, existing.status.as_deref());
                    }
                    let hinted_change = item.has_hints()
                        && registry.hint_changed(
                            address,
                            item.listing_price,
                            item.listing_status.as_deref(),
                        );
                    if hinted_change {
                        plan.push((item, FetchPlan::Changed));
                    } else {
                        stats.unchanged += 1;
                    }
                }
            }
        }

        if let Some(cap) = self.options.item_cap {
            if plan.len() > cap {
                stats.skipped += plan.len() - cap;
                info!(cap, planned = plan.len(), "item cap reached; truncating fetch plan");
                plan.truncate(cap);
            }
        }
        info!(
            discovered = stats.discovered,
            planned = plan.len(),
            removed = stats.removed,
            "fetch plan ready"
        );

        let mut fetched = 0usize;
        let mut scanned = 0usize;
        for (item, kind) in plan {
            let address = item.detail_address.as_str();
            if !self.gate.is_allowed(address).await {
                debug!(address, "denied by politeness gate");
                stats.denied += 1;
                continue;
            }
            if fetched > 0 && !self.options.delay.is_zero() {
                tokio::time::sleep(self.options.delay).await;
            }
            fetched += 1;

            let draft = match adapter.fetch_detail(&item).await {
                Ok(draft) => draft,
                Err(err) => {
                    warn!(address, error = %err, "detail fetch failed");
                    stats.failed += 1;
                    continue;
                }
            };
            let record = match draft.into_record(RecordOrigin {
                source_name: source,
                reference_code: &item.reference_code,
                detail_address: address,
                fetched_at: Utc::now(),
            }) {
                Ok(record) => record,
                Err(err) => {
                    warn!(address, error = %err, "listing rejected");
                    stats.failed += 1;
                    continue;
                }
            };
            let price = record.price;
            let status = record.status.clone();

            match kind {
                FetchPlan::New => {
                    store
                        .stage(record)
                        .await
                        .with_context(|| format!("staging {address}"))?;
                    stats.new += 1;
                    info!(address, reference = %item.reference_code, "new listing");
                }
                FetchPlan::Changed => {
                    if store.merge_if_changed(address, record) {
                        stats.changed += 1;
                        info!(address, reference = %item.reference_code, "listing changed");
                    } else {
                        stats.unchanged += 1;
                    }
                }
            }

            registry.record_scanned(address, price, status.as_deref());
            if item.has_hints() {
                registry.record_hint(address, item.listing_price, item.listing_status.as_deref());
            }
            scanned += 1;
            if scanned % self.options.registry_flush_every.max(1) == 0 {
                registry
                    .persist()
                    .await
                    .with_context(|| format!("flushing registry after {scanned} scans"))?;
            }
        }

        registry.update_stats(stats.changed);
        info!(
            new = stats.new,
            changed = stats.changed,
            unchanged = stats.unchanged,
            removed = stats.removed,
            failed = stats.failed,
            "source reconciled"
        );
        Ok(stats)
    }

    /// Marks addresses this source previously produced but no longer lists.
    fn detect_removals(
        &self,
        source: &str,
        discovered: &[DiscoveredItem],
        registry: &mut ScanRegistry,
        store: &mut PropertyStore,
    ) -> usize {
        let discovered: HashSet<&str> = discovered.iter().map(|i| i.detail_address.as_str()).collect();
        let existing_for_source: HashMap<&str, &ListingRecord> = store
            .existing_by_address()
            .into_iter()
            .filter(|(_, record)| record.source_name == source)
            .collect();

        let mut known: BTreeSet<String> = registry.known_addresses();
        known.extend(
            existing_for_source
                .iter()
                .filter(|(_, record)| !record.removed)
                .map(|(address, _)| address.to_string()),
        );

        let candidates: Vec<String> = known
            .into_iter()
            .filter(|address| !discovered.contains(address.as_str()))
            .filter(|address| existing_for_source.contains_key(address.as_str()))
            .collect();
        if candidates.is_empty() {
            return 0;
        }

        registry.mark_removed(&candidates);
        let removed = store.mark_removed(&candidates);
        info!(candidates = candidates.len(), removed, "listings no longer offered");
        removed
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceOutcome {
    pub source: String,
    pub stats: RunStatistics,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mode: CrawlMode,
    pub sources: Vec<SourceOutcome>,
    pub failed_sources: Vec<String>,
    pub totals: RunStatistics,
    pub final_records: usize,
}

pub struct RunDriver {
    config: CrawlConfig,
    http: HttpFetcher,
}

impl RunDriver {
    pub fn new(config: CrawlConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &CrawlConfig {
        &self.config
    }

    /// Runs every enabled source from the sources file.
    pub async fn run(&self) -> Result<RunSummary> {
        let registry = load_source_registry(&self.config.sources_file).await?;
        let base_dir = self
            .config
            .sources_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        let mut adapters: Vec<Box<dyn SourceAdapter>> = Vec::new();
        let mut unbuildable = Vec::new();
        for source in registry.sources.iter().filter(|s| s.enabled) {
            match build_adapter(&source.name, &source.adapter, &base_dir, &self.http) {
                Ok(adapter) => adapters.push(adapter),
                Err(err) => {
                    error!(source = %source.name, error = %err, "adapter could not be built");
                    unbuildable.push(source.name.clone());
                }
            }
        }

        let gate: Box<dyn PolitenessGate> = if self.config.respect_robots {
            Box::new(RobotsGate::new(self.http.clone()))
        } else {
            Box::new(AllowAll)
        };

        let mut summary = self.run_with(&adapters, gate.as_ref()).await?;
        summary.failed_sources.extend(unbuildable);
        Ok(summary)
    }

    /// Runs the given adapters in order against the configured stores.
    pub async fn run_with(
        &self,
        adapters: &[Box<dyn SourceAdapter>],
        gate: &dyn PolitenessGate,
    ) -> Result<RunSummary> {
        let started_at = Utc::now();
        let config = &self.config;
        if let Some(parent) = config.listings_file.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let mut store = PropertyStore::open(&config.listings_file, &config.checkpoint_file)
            .await
            .context("opening property store")?
            .with_checkpoint_every(config.checkpoint_every);
        let mut registry = ScanRegistry::load(&config.registry_file, config.mode).await;
        info!(
            mode = %config.mode,
            records = store.records().len(),
            known = registry.active_len(),
            sources = adapters.len(),
            "run starting"
        );

        let options = config.reconcile_options();
        let reconciler = SourceReconciler::new(&options, gate);
        let mut sources = Vec::new();
        let mut failed_sources = Vec::new();
        let mut totals = RunStatistics::default();

        for adapter in adapters {
            let name = adapter.source_name().to_string();
            match reconciler.reconcile(adapter.as_ref(), &mut registry, &mut store).await {
                Ok(stats) => {
                    totals.absorb(&stats);
                    sources.push(SourceOutcome { source: name, stats });
                }
                Err(err) => {
                    error!(source = %name, error = %format!("{err:#}"), "source aborted");
                    failed_sources.push(name);
                }
            }
            if let Err(err) = registry.persist().await {
                warn!(error = %err, "registry flush between sources failed");
            }
        }

        let final_records = store
            .finalize(config.group_by_source)
            .await
            .context("writing final dataset")?;
        if config.mode.is_full() {
            registry.mark_full_run();
        }
        registry.persist().await.context("persisting scan registry")?;

        let finished_at = Utc::now();
        info!(
            final_records,
            new = totals.new,
            changed = totals.changed,
            removed = totals.removed,
            failed_sources = failed_sources.len(),
            "run finished"
        );
        Ok(RunSummary {
            started_at,
            finished_at,
            mode: config.mode,
            sources,
            failed_sources,
            totals,
            final_records,
        })
    }
}

pub async fn run_once_from_env() -> Result<RunSummary> {
    RunDriver::new(CrawlConfig::from_env()?)?.run().await
}

/// Snapshot of the persisted state, for `inmo status`.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetStatus {
    pub records: usize,
    pub removed_records: usize,
    pub sources: usize,
    pub registry_active: usize,
    pub registry_removed: usize,
    pub last_full_run: Option<DateTime<Utc>>,
    pub last_incremental_scan: Option<DateTime<Utc>>,
    pub checkpoint_pending: bool,
}

pub async fn dataset_status(config: &CrawlConfig) -> Result<DatasetStatus> {
    let records = load_records(&config.listings_file)
        .await
        .context("reading dataset")?;
    let registry = ScanRegistry::load(&config.registry_file, config.mode).await;
    let sources: BTreeSet<&str> = records.iter().map(|r| r.source_name.as_str()).collect();
    let checkpoint_pending = fs::try_exists(&config.checkpoint_file)
        .await
        .with_context(|| format!("checking {}", config.checkpoint_file.display()))?;
    Ok(DatasetStatus {
        records: records.len(),
        removed_records: records.iter().filter(|r| r.removed).count(),
        sources: sources.len(),
        registry_active: registry.active_len(),
        registry_removed: registry.removed_len(),
        last_full_run: registry.last_full_run(),
        last_incremental_scan: registry.stats().last_incremental_scan,
        checkpoint_pending,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use inmo_adapters::AdapterError;
    use inmo_core::ListingDraft;
    use std::sync::{Arc, Mutex};

    struct ScriptedAdapter {
        name: String,
        items: Vec<DiscoveredItem>,
        drafts: HashMap<String, ListingDraft>,
        failing: HashSet<String>,
        discovery_fails: bool,
        fetched: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedAdapter {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                items: Vec::new(),
                drafts: HashMap::new(),
                failing: HashSet::new(),
                discovery_fails: false,
                fetched: Arc::default(),
            }
        }

        fn listing(mut self, address: &str, price: i64, status: &str) -> Self {
            self.items.push(DiscoveredItem::new(format!("ref-{address}"), address));
            self.drafts.insert(
                address.to_string(),
                ListingDraft {
                    title: Some(format!("Piso {address}")),
                    price: Some(price),
                    status: Some(status.to_string()),
                    ..Default::default()
                },
            );
            self
        }

        fn hinted(self, address: &str, price: i64, status: &str) -> Self {
            self.badged(address, price, status, status)
        }

        /// Listing page shows `badge` while the detail page reports `status`.
        fn badged(mut self, address: &str, price: i64, status: &str, badge: &str) -> Self {
            self = self.listing(address, price, status);
            if let Some(item) = self.items.last_mut() {
                item.listing_status = Some(badge.to_string());
            }
            self
        }

        fn discovery_failing(mut self) -> Self {
            self.discovery_fails = true;
            self
        }

        fn failing(mut self, address: &str) -> Self {
            self.items.push(DiscoveredItem::new("broken", address));
            self.failing.insert(address.to_string());
            self
        }
    }

    #[async_trait]
    impl SourceAdapter for ScriptedAdapter {
        fn source_name(&self) -> &str {
            &self.name
        }

        async fn discover(&self) -> Result<Vec<DiscoveredItem>, AdapterError> {
            if self.discovery_fails {
                return Err(AdapterError::Message("child sitemap unavailable".into()));
            }
            Ok(self.items.clone())
        }

        async fn fetch_detail(&self, item: &DiscoveredItem) -> Result<ListingDraft, AdapterError> {
            self.fetched.lock().unwrap().push(item.detail_address.clone());
            if self.failing.contains(&item.detail_address) {
                return Err(AdapterError::Message("boom".into()));
            }
            self.drafts
                .get(&item.detail_address)
                .cloned()
                .ok_or_else(|| AdapterError::NotFound(item.detail_address.clone()))
        }
    }

    struct DenyGate(HashSet<String>);

    #[async_trait]
    impl PolitenessGate for DenyGate {
        async fn is_allowed(&self, address: &str) -> bool {
            !self.0.contains(address)
        }
    }

    fn config_in(dir: &Path, mode: CrawlMode) -> CrawlConfig {
        let data_dir = dir.to_string_lossy().to_string();
        let mut config = CrawlConfig::from_lookup(|key| match key {
            "DATA_DIR" => Some(data_dir.clone()),
            "CRAWL_DELAY_MS" => Some("0".into()),
            _ => None,
        })
        .unwrap();
        config.mode = mode;
        config
    }

    /// One run over a single adapter; returns the summary and the addresses it fetched.
    async fn run(config: &CrawlConfig, adapter: ScriptedAdapter) -> (RunSummary, Vec<String>) {
        let fetch_log = adapter.fetched.clone();
        let driver = RunDriver::new(config.clone()).unwrap();
        let adapters: Vec<Box<dyn SourceAdapter>> = vec![Box::new(adapter)];
        let summary = driver.run_with(&adapters, &AllowAll).await.unwrap();
        let fetched = fetch_log.lock().unwrap().clone();
        (summary, fetched)
    }

    async fn reopen(config: &CrawlConfig) -> (PropertyStore, ScanRegistry) {
        let store = PropertyStore::open(&config.listings_file, &config.checkpoint_file)
            .await
            .unwrap();
        let registry = ScanRegistry::load(&config.registry_file, config.mode).await;
        (store, registry)
    }

    #[tokio::test]
    async fn vanished_address_is_marked_removed_on_next_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), CrawlMode::Incremental);
        let a = "https://s.test/a";
        let b = "https://s.test/b";

        let (first, _) = run(&config, ScriptedAdapter::new("S").listing(a, 100, "DISPONIBLE").listing(b, 200, "DISPONIBLE")).await;
        assert_eq!(first.totals.new, 2);
        assert_eq!(first.final_records, 2);

        let (second, fetched) = run(&config, ScriptedAdapter::new("S").listing(b, 200, "DISPONIBLE")).await;
        assert_eq!(second.totals.removed, 1);
        assert_eq!(second.totals.unchanged, 1);
        assert!(fetched.is_empty());

        let (store, registry) = reopen(&config).await;
        assert!(store.get(a).unwrap().removed);
        let kept = store.get(b).unwrap();
        assert!(!kept.removed);
        assert_eq!(kept.last_updated_at, None);
        assert!(registry.is_removed(a));
        assert!(registry.is_known(b));
        assert!(!config.checkpoint_file.exists());
    }

    #[tokio::test]
    async fn item_cap_limits_fetches_and_leaves_consistent_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path(), CrawlMode::Incremental);
        config.item_cap = Some(2);
        let mut adapter = ScriptedAdapter::new("S");
        for i in 0..5 {
            adapter = adapter.listing(&format!("https://s.test/{i}"), 100 + i, "DISPONIBLE");
        }

        let (summary, fetched) = run(&config, adapter).await;
        assert_eq!(summary.totals.new, 2);
        assert_eq!(summary.totals.skipped, 3);
        assert_eq!(fetched, vec!["https://s.test/0".to_string(), "https://s.test/1".to_string()]);

        let (store, registry) = reopen(&config).await;
        assert_eq!(store.records().len(), 2);
        assert_eq!(registry.active_len(), 2);
        assert!(!store.contains("https://s.test/2"));
        assert!(!registry.is_known("https://s.test/2"));
    }

    #[tokio::test]
    async fn full_mode_merges_changes_and_keeps_first_seen() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), CrawlMode::Incremental);
        let a = "https://s.test/a";
        let b = "https://s.test/b";
        run(&config, ScriptedAdapter::new("S").listing(a, 100, "DISPONIBLE").listing(b, 200, "DISPONIBLE")).await;
        let (before, _) = reopen(&config).await;
        let first_seen = before.get(a).unwrap().first_seen_at;

        let full = config_in(dir.path(), CrawlMode::Full);
        let (summary, fetched) =
            run(&full, ScriptedAdapter::new("S").listing(a, 90, "RESERVADO").listing(b, 200, "DISPONIBLE")).await;
        assert_eq!(fetched.len(), 2);
        assert_eq!(summary.totals.changed, 1);
        assert_eq!(summary.totals.unchanged, 1);

        let (store, registry) = reopen(&full).await;
        let merged = store.get(a).unwrap();
        assert_eq!(merged.price, Some(90));
        assert_eq!(merged.first_seen_at, first_seen);
        assert!(merged.last_updated_at.is_some());
        assert!(store.get(b).unwrap().last_updated_at.is_none());
        assert!(registry.last_full_run().is_some());
    }

    #[tokio::test]
    async fn failing_item_does_not_abort_source() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), CrawlMode::Incremental);
        let adapter = ScriptedAdapter::new("S")
            .listing("https://s.test/a", 100, "DISPONIBLE")
            .failing("https://s.test/broken")
            .listing("https://s.test/c", 300, "DISPONIBLE");

        let (summary, fetched) = run(&config, adapter).await;
        assert_eq!(summary.totals.failed, 1);
        assert_eq!(summary.totals.new, 2);
        assert!(summary.failed_sources.is_empty());
        assert_eq!(fetched.len(), 3);

        let (store, registry) = reopen(&config).await;
        assert!(!store.contains("https://s.test/broken"));
        assert!(!registry.is_known("https://s.test/broken"));
    }

    #[tokio::test]
    async fn denied_address_is_skipped_without_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), CrawlMode::Incremental);
        let adapter = ScriptedAdapter::new("S")
            .listing("https://s.test/a", 100, "DISPONIBLE")
            .listing("https://s.test/private", 100, "DISPONIBLE");
        let gate = DenyGate(HashSet::from(["https://s.test/private".to_string()]));

        let driver = RunDriver::new(config.clone()).unwrap();
        let adapters: Vec<Box<dyn SourceAdapter>> = vec![Box::new(adapter)];
        let summary = driver.run_with(&adapters, &gate).await.unwrap();
        assert_eq!(summary.totals.denied, 1);
        assert_eq!(summary.totals.new, 1);

        let (store, registry) = reopen(&config).await;
        assert!(!store.contains("https://s.test/private"));
        assert!(!registry.is_known("https://s.test/private"));
    }

    #[tokio::test]
    async fn rediscovered_listing_is_restored() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), CrawlMode::Incremental);
        let a = "https://s.test/a";
        let b = "https://s.test/b";
        run(&config, ScriptedAdapter::new("S").listing(a, 100, "DISPONIBLE").listing(b, 200, "DISPONIBLE")).await;
        let (before, _) = reopen(&config).await;
        let first_seen = before.get(a).unwrap().first_seen_at;

        run(&config, ScriptedAdapter::new("S").listing(b, 200, "DISPONIBLE")).await;
        let (summary, fetched) =
            run(&config, ScriptedAdapter::new("S").listing(a, 100, "DISPONIBLE").listing(b, 200, "DISPONIBLE")).await;
        assert_eq!(fetched, vec![a.to_string()]);
        assert_eq!(summary.totals.changed, 1);

        let (store, registry) = reopen(&config).await;
        let restored = store.get(a).unwrap();
        assert!(!restored.removed);
        assert_eq!(restored.status.as_deref(), Some("DISPONIBLE"));
        assert_eq!(restored.first_seen_at, first_seen);
        assert!(registry.is_known(a));
        assert!(!registry.is_removed(a));
    }

    #[tokio::test]
    async fn listing_page_hint_triggers_refetch_in_incremental_mode() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), CrawlMode::Incremental);
        let a = "https://s.test/a";
        let b = "https://s.test/b";
        run(&config, ScriptedAdapter::new("S").hinted(a, 100, "DISPONIBLE").hinted(b, 200, "DISPONIBLE")).await;

        let (summary, fetched) =
            run(&config, ScriptedAdapter::new("S").hinted(a, 100, "RESERVADO").hinted(b, 200, "DISPONIBLE")).await;
        assert_eq!(fetched, vec![a.to_string()]);
        assert_eq!(summary.totals.changed, 1);
        assert_eq!(summary.totals.unchanged, 1);

        let (store, _) = reopen(&config).await;
        assert_eq!(store.get(a).unwrap().status.as_deref(), Some("RESERVADO"));
    }

    #[tokio::test]
    async fn listing_badge_differing_from_detail_status_is_not_refetched() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), CrawlMode::Incremental);
        let a = "https://s.test/a";
        let source = || ScriptedAdapter::new("S").badged(a, 100, "DISPONIBLE", "EXCLUSIVA");

        let (first, fetched) = run(&config, source()).await;
        assert_eq!(first.totals.new, 1);
        assert_eq!(fetched.len(), 1);

        let mut fetches = Vec::new();
        for _ in 0..3 {
            let (summary, fetched) = run(&config, source()).await;
            assert_eq!(summary.totals.unchanged, 1);
            fetches.push(fetched.len());
        }
        assert_eq!(fetches, vec![0, 0, 0]);

        let (moved, fetched) =
            run(&config, ScriptedAdapter::new("S").badged(a, 100, "RESERVADO", "RESERVADO")).await;
        assert_eq!(fetched, vec![a.to_string()]);
        assert_eq!(moved.totals.changed, 1);
        let (store, _) = reopen(&config).await;
        assert_eq!(store.get(a).unwrap().status.as_deref(), Some("RESERVADO"));
    }

    #[tokio::test]
    async fn failed_discovery_skips_source_without_removal() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), CrawlMode::Incremental);
        let a = "https://s.test/a";
        run(&config, ScriptedAdapter::new("S").listing(a, 100, "DISPONIBLE")).await;

        let (summary, fetched) =
            run(&config, ScriptedAdapter::new("S").listing(a, 100, "DISPONIBLE").discovery_failing()).await;
        assert_eq!(summary.failed_sources, vec!["S".to_string()]);
        assert_eq!(summary.totals.removed, 0);
        assert!(fetched.is_empty());

        let (store, registry) = reopen(&config).await;
        assert!(!store.get(a).unwrap().removed);
        assert!(registry.is_known(a));
        assert!(!registry.is_removed(a));
    }

    #[tokio::test]
    async fn registry_is_flushed_every_k_scans_before_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let registry_path = dir.path().join("scan_registry.json");
        let mut registry = ScanRegistry::load(&registry_path, CrawlMode::Incremental).await;
        let mut store = PropertyStore::empty(
            dir.path().join("listings.json"),
            dir.path().join("listings.checkpoint.json"),
        );
        let options = ReconcileOptions {
            delay: Duration::ZERO,
            registry_flush_every: 2,
            ..Default::default()
        };
        let adapter = ScriptedAdapter::new("S")
            .listing("https://s.test/1", 1, "DISPONIBLE")
            .listing("https://s.test/2", 2, "DISPONIBLE")
            .listing("https://s.test/3", 3, "DISPONIBLE");

        let stats = SourceReconciler::new(&options, &AllowAll)
            .reconcile(&adapter, &mut registry, &mut store)
            .await
            .unwrap();
        assert_eq!(stats.new, 3);
        assert_eq!(registry.active_len(), 3);

        let on_disk = ScanRegistry::load(&registry_path, CrawlMode::Incremental).await;
        assert_eq!(on_disk.active_len(), 2);
        assert!(on_disk.is_known("https://s.test/1"));
        assert!(on_disk.is_known("https://s.test/2"));
        assert!(!dir.path().join("listings.json").exists());
    }

    #[tokio::test]
    async fn zero_flush_interval_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ScanRegistry::empty(dir.path().join("scan_registry.json"), CrawlMode::Incremental);
        let mut store = PropertyStore::empty(dir.path().join("l.json"), dir.path().join("l.ckpt.json"));
        let options = ReconcileOptions {
            delay: Duration::ZERO,
            registry_flush_every: 0,
            ..Default::default()
        };
        let adapter = ScriptedAdapter::new("S").listing("https://s.test/1", 1, "DISPONIBLE");

        let stats = SourceReconciler::new(&options, &AllowAll)
            .reconcile(&adapter, &mut registry, &mut store)
            .await
            .unwrap();
        assert_eq!(stats.new, 1);
        assert!(dir.path().join("scan_registry.json").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_delay_separates_detail_fetches() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ScanRegistry::empty(dir.path().join("scan_registry.json"), CrawlMode::Incremental);
        let mut store = PropertyStore::empty(dir.path().join("l.json"), dir.path().join("l.ckpt.json"));
        let options = ReconcileOptions {
            delay: Duration::from_secs(1),
            registry_flush_every: 100,
            ..Default::default()
        };
        let adapter = ScriptedAdapter::new("S")
            .listing("https://s.test/1", 1, "DISPONIBLE")
            .listing("https://s.test/2", 2, "DISPONIBLE")
            .listing("https://s.test/3", 3, "DISPONIBLE");

        let started = tokio::time::Instant::now();
        let stats = SourceReconciler::new(&options, &AllowAll)
            .reconcile(&adapter, &mut registry, &mut store)
            .await
            .unwrap();
        let elapsed = started.elapsed();
        assert_eq!(stats.new, 3);
        assert!(elapsed >= Duration::from_secs(2), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(3), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn changes_detected_counts_only_updates() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), CrawlMode::Incremental);
        let a = "https://s.test/a";
        run(&config, ScriptedAdapter::new("S").listing(a, 100, "DISPONIBLE").listing("https://s.test/b", 1, "DISPONIBLE")).await;
        let (_, registry) = reopen(&config).await;
        assert_eq!(registry.stats().changes_detected, 0);

        let full = config_in(dir.path(), CrawlMode::Full);
        run(&full, ScriptedAdapter::new("S").listing(a, 90, "DISPONIBLE").listing("https://s.test/b", 1, "DISPONIBLE")).await;
        let (_, registry) = reopen(&full).await;
        assert_eq!(registry.stats().changes_detected, 1);
    }

    #[tokio::test]
    async fn empty_discovery_removes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), CrawlMode::Incremental);
        run(&config, ScriptedAdapter::new("S").listing("https://s.test/a", 100, "DISPONIBLE")).await;

        let (summary, _) = run(&config, ScriptedAdapter::new("S")).await;
        assert_eq!(summary.totals.removed, 0);
        let (store, _) = reopen(&config).await;
        assert!(!store.get("https://s.test/a").unwrap().removed);
    }

    #[tokio::test]
    async fn removal_is_scoped_to_the_owning_source() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), CrawlMode::Incremental);
        let driver = RunDriver::new(config.clone()).unwrap();
        let adapters: Vec<Box<dyn SourceAdapter>> = vec![
            Box::new(ScriptedAdapter::new("S1").listing("https://one.test/a", 1, "DISPONIBLE")),
            Box::new(ScriptedAdapter::new("S2").listing("https://two.test/a", 2, "DISPONIBLE")),
        ];
        driver.run_with(&adapters, &AllowAll).await.unwrap();

        let (summary, _) = run(&config, ScriptedAdapter::new("S1").listing("https://one.test/b", 3, "DISPONIBLE")).await;
        assert_eq!(summary.totals.removed, 1);
        let (store, _) = reopen(&config).await;
        assert!(store.get("https://one.test/a").unwrap().removed);
        assert!(!store.get("https://two.test/a").unwrap().removed);
    }

    #[tokio::test]
    async fn status_reports_persisted_counts() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), CrawlMode::Incremental);
        run(&config, ScriptedAdapter::new("S").listing("https://s.test/a", 1, "DISPONIBLE")).await;

        let status = dataset_status(&config).await.unwrap();
        assert_eq!(status.records, 1);
        assert_eq!(status.sources, 1);
        assert_eq!(status.registry_active, 1);
        assert!(!status.checkpoint_pending);
        assert!(status.last_incremental_scan.is_some());
    }

    #[test]
    fn config_defaults_follow_data_dir() {
        let config = CrawlConfig::from_lookup(|key| match key {
            "DATA_DIR" => Some("/var/inmo".into()),
            "CRAWL_MODE" => Some("full".into()),
            "CRAWL_ITEM_CAP" => Some("5".into()),
            "REGISTRY_FILE" => Some("/tmp/reg.json".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.listings_file, PathBuf::from("/var/inmo/listings.json"));
        assert_eq!(config.registry_file, PathBuf::from("/tmp/reg.json"));
        assert_eq!(config.mode, CrawlMode::Full);
        assert_eq!(config.item_cap, Some(5));
        assert_eq!(config.delay, Duration::from_millis(DEFAULT_CRAWL_DELAY_MS));
        assert_eq!(config.checkpoint_every, DEFAULT_CHECKPOINT_EVERY);
        assert!(config.respect_robots);

        let bad = CrawlConfig::from_lookup(|key| (key == "CRAWL_MODE").then(|| "sometimes".to_string()));
        assert!(bad.is_err());
    }

    #[test]
    fn sources_yaml_parses_both_adapter_kinds() {
        let yaml = r#"
sources:
  - name: Fincas Demo
    kind: fixture
    path: fixtures/fincas-demo/bundle.json
  - name: Inmo Centro
    enabled: false
    kind: selector
    listing_urls: ["https://centro.test/venta?pag={page}"]
    max_pages: 4
    listing:
      item: div.card
      reference: h6
    detail:
      title: h1
      price: .price
"#;
        let registry: SourceRegistry = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(registry.sources.len(), 2);
        assert!(registry.sources[0].enabled);
        assert!(matches!(registry.sources[0].adapter, AdapterSettings::Fixture { .. }));
        assert!(!registry.sources[1].enabled);
        match &registry.sources[1].adapter {
            AdapterSettings::Selector(cfg) => {
                assert_eq!(cfg.max_pages, 4);
                assert_eq!(cfg.listing.item.as_deref(), Some("div.card"));
                assert_eq!(cfg.detail.price.as_deref(), Some(".price"));
            }
            other => panic!("unexpected adapter {other:?}"),
        }
    }
}
