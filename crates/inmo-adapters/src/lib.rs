//! Source adapter contracts, shipped adapters and politeness gates.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use inmo_core::ListingDraft;
use inmo_storage::{FetchError, HttpFetcher};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use texting_robots::Robot;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

pub const CRATE_NAME: &str = "inmo-adapters";

/// One candidate listing seen during discovery. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredItem {
    pub reference_code: String,
    pub detail_address: String,
    /// Status shown on the listing page, when the detail page does not carry it.
    #[serde(default)]
    pub listing_status: Option<String>,
    #[serde(default)]
    pub listing_price: Option<i64>,
}

impl DiscoveredItem {
    pub fn new(reference_code: impl Into<String>, detail_address: impl Into<String>) -> Self {
        Self {
            reference_code: reference_code.into(),
            detail_address: detail_address.into(),
            listing_status: None,
            listing_price: None,
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.listing_status = Some(status.into());
        self
    }

    pub fn with_price(mut self, price: i64) -> Self {
        self.listing_price = Some(price);
        self
    }

    pub fn has_hints(&self) -> bool {
        self.listing_status.is_some() || self.listing_price.is_some()
    }
}

/// Drops repeated addresses, keeping the first occurrence.
pub fn dedupe_discovered(items: Vec<DiscoveredItem>) -> Vec<DiscoveredItem> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.detail_address.clone()))
        .collect()
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("no detail available for {0}")]
    NotFound(String),
    #[error("invalid selector `{selector}`: {reason}")]
    Selector { selector: String, reason: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Per-source collaborator: discovery of candidate items and detail extraction.
///
/// Implementations must tolerate being asked for an address they returned in an
/// earlier run and must not assume any call ordering.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_name(&self) -> &str;

    async fn discover(&self) -> Result<Vec<DiscoveredItem>, AdapterError>;

    async fn fetch_detail(&self, item: &DiscoveredItem) -> Result<ListingDraft, AdapterError>;
}

/// Adapter selection as written in `sources.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterSettings {
    Fixture { path: PathBuf },
    Selector(SelectorConfig),
}

pub fn build_adapter(
    source_name: &str,
    settings: &AdapterSettings,
    base_dir: &Path,
    http: &HttpFetcher,
) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    match settings {
        AdapterSettings::Fixture { path } => {
            let bundle = load_fixture_bundle(base_dir.join(path))?;
            Ok(Box::new(FixtureAdapter::new(source_name, bundle)))
        }
        AdapterSettings::Selector(config) => Ok(Box::new(SelectorAdapter::new(
            source_name,
            config.clone(),
            http.clone(),
        )?)),
    }
}

// ---------------------------------------------------------------------------
// Fixture adapter
// ---------------------------------------------------------------------------

/// Captured discovery + detail output for one source, replayed offline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub discovered: Vec<DiscoveredItem>,
    #[serde(default)]
    pub details: HashMap<String, ListingDraft>,
    #[serde(default)]
    pub failures: Vec<String>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> anyhow::Result<FixtureBundle> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    source_name: String,
    bundle: FixtureBundle,
}

impl FixtureAdapter {
    pub fn new(source_name: impl Into<String>, bundle: FixtureBundle) -> Self {
        Self {
            source_name: source_name.into(),
            bundle,
        }
    }
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    fn source_name(&self) -> &str {
        &self.source_name
    }

    async fn discover(&self) -> Result<Vec<DiscoveredItem>, AdapterError> {
        Ok(self.bundle.discovered.clone())
    }

    async fn fetch_detail(&self, item: &DiscoveredItem) -> Result<ListingDraft, AdapterError> {
        if self.bundle.failures.contains(&item.detail_address) {
            return Err(AdapterError::Message(format!(
                "fixture marks {} as failing",
                item.detail_address
            )));
        }
        let mut draft = self
            .bundle
            .details
            .get(&item.detail_address)
            .cloned()
            .ok_or_else(|| AdapterError::NotFound(item.detail_address.clone()))?;
        if draft.status.is_none() {
            draft.status = item.listing_status.clone();
        }
        if draft.price.is_none() {
            draft.price = item.listing_price;
        }
        Ok(draft)
    }
}

// ---------------------------------------------------------------------------
// Selector adapter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingSelectors {
    /// Container per listing card; the whole page when absent.
    pub item: Option<String>,
    pub link: String,
    pub reference: Option<String>,
    pub status: Option<String>,
    pub price: Option<String>,
    /// Listing badges that are not statuses (e.g. "NEW").
    pub ignore_statuses: Vec<String>,
}

impl Default for ListingSelectors {
    fn default() -> Self {
        Self {
            item: None,
            link: "a[href]".to_string(),
            reference: None,
            status: None,
            price: None,
            ignore_statuses: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DetailSelectors {
    pub title: Option<String>,
    pub description: Option<String>,
    pub price: Option<String>,
    pub status: Option<String>,
    pub location: Option<String>,
    pub built_area: Option<String>,
    pub plot_area: Option<String>,
    pub bedrooms: Option<String>,
    pub bathrooms: Option<String>,
    pub property_type: Option<String>,
    pub reference: Option<String>,
    pub gallery: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Listing page URLs; `{page}` is replaced with 1..=max_pages.
    pub listing_urls: Vec<String>,
    pub max_pages: usize,
    pub sitemap_url: Option<String>,
    /// Only child sitemaps whose address contains this are followed.
    pub sitemap_filter: Option<String>,
    pub url_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    /// Regex whose first group (or whole match) is the reference code.
    pub reference_pattern: Option<String>,
    pub page_delay_ms: u64,
    pub listing: ListingSelectors,
    pub detail: DetailSelectors,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            listing_urls: Vec::new(),
            max_pages: 1,
            sitemap_url: None,
            sitemap_filter: None,
            url_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            reference_pattern: None,
            page_delay_ms: 1000,
            listing: ListingSelectors::default(),
            detail: DetailSelectors::default(),
        }
    }
}

fn compile(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

fn compile_opt(selector: Option<&String>) -> Result<Option<Selector>, AdapterError> {
    selector.map(|s| compile(s)).transpose()
}

#[derive(Debug)]
struct CompiledListing {
    item: Option<Selector>,
    link: Selector,
    reference: Option<Selector>,
    status: Option<Selector>,
    price: Option<Selector>,
    ignore_statuses: Vec<String>,
}

#[derive(Debug)]
struct CompiledDetail {
    title: Option<Selector>,
    description: Option<Selector>,
    price: Option<Selector>,
    status: Option<Selector>,
    location: Option<Selector>,
    built_area: Option<Selector>,
    plot_area: Option<Selector>,
    bedrooms: Option<Selector>,
    bathrooms: Option<Selector>,
    property_type: Option<Selector>,
    reference: Option<Selector>,
    gallery: Option<Selector>,
}

impl CompiledListing {
    fn new(config: &ListingSelectors) -> Result<Self, AdapterError> {
        Ok(Self {
            item: compile_opt(config.item.as_ref())?,
            link: compile(&config.link)?,
            reference: compile_opt(config.reference.as_ref())?,
            status: compile_opt(config.status.as_ref())?,
            price: compile_opt(config.price.as_ref())?,
            ignore_statuses: config
                .ignore_statuses
                .iter()
                .map(|s| s.to_uppercase())
                .collect(),
        })
    }
}

impl CompiledDetail {
    fn new(config: &DetailSelectors) -> Result<Self, AdapterError> {
        Ok(Self {
            title: compile_opt(config.title.as_ref())?,
            description: compile_opt(config.description.as_ref())?,
            price: compile_opt(config.price.as_ref())?,
            status: compile_opt(config.status.as_ref())?,
            location: compile_opt(config.location.as_ref())?,
            built_area: compile_opt(config.built_area.as_ref())?,
            plot_area: compile_opt(config.plot_area.as_ref())?,
            bedrooms: compile_opt(config.bedrooms.as_ref())?,
            bathrooms: compile_opt(config.bathrooms.as_ref())?,
            property_type: compile_opt(config.property_type.as_ref())?,
            reference: compile_opt(config.reference.as_ref())?,
            gallery: compile_opt(config.gallery.as_ref())?,
        })
    }
}

/// Generic HTML adapter driven entirely by CSS selectors from configuration.
#[derive(Debug)]
pub struct SelectorAdapter {
    source_name: String,
    config: SelectorConfig,
    listing: CompiledListing,
    detail: CompiledDetail,
    reference_re: Option<Regex>,
    http: HttpFetcher,
}

impl SelectorAdapter {
    pub fn new(
        source_name: impl Into<String>,
        config: SelectorConfig,
        http: HttpFetcher,
    ) -> Result<Self, AdapterError> {
        let reference_re = config
            .reference_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| AdapterError::Message(format!("invalid reference_pattern: {e}")))?;
        Ok(Self {
            source_name: source_name.into(),
            listing: CompiledListing::new(&config.listing)?,
            detail: CompiledDetail::new(&config.detail)?,
            config,
            reference_re,
            http,
        })
    }

    fn address_wanted(&self, address: &str) -> bool {
        let included = self.config.url_patterns.is_empty()
            || self.config.url_patterns.iter().any(|p| address.contains(p.as_str()));
        let excluded = self
            .config
            .exclude_patterns
            .iter()
            .any(|p| address.contains(p.as_str()));
        included && !excluded
    }

    async fn pause(&self) {
        if self.config.page_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.page_delay_ms)).await;
        }
    }

    async fn sitemap_addresses(&self, sitemap_url: &str) -> Result<Vec<String>, AdapterError> {
        let root_xml = self.http.fetch_text(sitemap_url).await?;
        collect_sitemap_pages(&root_xml, self.config.sitemap_filter.as_deref(), |child| async move {
            Ok(self.http.fetch_text(&child).await?)
        })
        .await
    }
}

/// Page addresses from a sitemap, following child sitemaps of an index.
///
/// Any followed child that cannot be fetched fails the whole collection.
async fn collect_sitemap_pages<F, Fut>(
    root_xml: &str,
    child_filter: Option<&str>,
    mut fetch_child: F,
) -> Result<Vec<String>, AdapterError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<String, AdapterError>>,
{
    let root = parse_sitemap(root_xml)?;
    let mut pages = root.pages;
    for child in root.children {
        if child_filter.is_some_and(|f| !child.contains(f)) {
            continue;
        }
        match fetch_child(child.clone()).await {
            Ok(xml) => pages.extend(parse_sitemap(&xml)?.pages),
            Err(err) => {
                warn!(sitemap = %child, error = %err, "child sitemap unavailable; abandoning discovery");
                return Err(err);
            }
        }
    }
    Ok(pages)
}

#[async_trait]
impl SourceAdapter for SelectorAdapter {
    fn source_name(&self) -> &str {
        &self.source_name
    }

    async fn discover(&self) -> Result<Vec<DiscoveredItem>, AdapterError> {
        let mut items = Vec::new();
        let mut seen = HashSet::new();

        if let Some(sitemap_url) = &self.config.sitemap_url {
            for address in self.sitemap_addresses(sitemap_url).await? {
                if self.address_wanted(&address) && seen.insert(address.clone()) {
                    let reference = reference_from_address(&address, self.reference_re.as_ref());
                    items.push(DiscoveredItem::new(reference, address));
                }
            }
        }

        for template in &self.config.listing_urls {
            let paginated = template.contains("{page}");
            let last_page = if paginated { self.config.max_pages.max(1) } else { 1 };
            for page in 1..=last_page {
                let page_url = template.replace("{page}", &page.to_string());
                let html = self.http.fetch_text(&page_url).await?;
                let found = parse_listing_page(&html, &page_url, &self.listing, self.reference_re.as_ref())?;
                let before = items.len();
                for item in found {
                    if self.address_wanted(&item.detail_address) && seen.insert(item.detail_address.clone()) {
                        items.push(item);
                    }
                }
                debug!(page_url, added = items.len() - before, "listing page parsed");
                // Past the last page many sites repeat the final page or return nothing.
                if items.len() == before {
                    break;
                }
                if page < last_page {
                    self.pause().await;
                }
            }
        }

        info!(source = %self.source_name, items = items.len(), "discovery finished");
        Ok(items)
    }

    async fn fetch_detail(&self, item: &DiscoveredItem) -> Result<ListingDraft, AdapterError> {
        let response = self.http.fetch_bytes(&item.detail_address).await?;
        let html = response.text();
        let mut draft = extract_detail(&html, &response.final_url, &self.detail, self.reference_re.as_ref())?;
        if draft.status.is_none() {
            draft.status = item.listing_status.clone();
        }
        if draft.price.is_none() {
            draft.price = item.listing_price;
        }
        Ok(draft)
    }
}

fn element_text(el: ElementRef<'_>) -> Option<String> {
    let text = el
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn first_text(scope: ElementRef<'_>, selector: Option<&Selector>) -> Option<String> {
    selector.and_then(|sel| scope.select(sel).find_map(element_text))
}

fn resolve(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    match Url::parse(base) {
        Ok(base) => base.join(href).ok().map(|u| u.to_string()),
        Err(_) => Url::parse(href).ok().map(|u| u.to_string()),
    }
}

fn capture_reference(text: &str, reference_re: Option<&Regex>) -> Option<String> {
    match reference_re {
        Some(re) => re.captures(text).and_then(|caps| {
            caps.get(1)
                .or_else(|| caps.get(0))
                .map(|m| m.as_str().trim().to_string())
        }),
        None => Some(text.trim().to_string()),
    }
    .filter(|s| !s.is_empty())
}

/// Reference code derived from the address alone: pattern match, else last path segment.
pub fn reference_from_address(address: &str, reference_re: Option<&Regex>) -> String {
    if let Some(re) = reference_re {
        if let Some(found) = capture_reference(address, Some(re)) {
            return found;
        }
    }
    Url::parse(address)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segs| segs.rfind(|s| !s.is_empty()).map(str::to_string))
        })
        .map(|seg| match seg.rsplit_once('.') {
            Some((stem, _ext)) if !stem.is_empty() => stem.to_string(),
            _ => seg,
        })
        .unwrap_or_else(|| address.to_string())
}

fn parse_listing_page(
    html: &str,
    page_url: &str,
    selectors: &CompiledListing,
    reference_re: Option<&Regex>,
) -> Result<Vec<DiscoveredItem>, AdapterError> {
    let document = Html::parse_document(html);
    let root = document.root_element();
    let scopes: Vec<ElementRef<'_>> = match &selectors.item {
        Some(item) => document.select(item).collect(),
        None => vec![root],
    };

    let mut out = Vec::new();
    for scope in scopes {
        let cards: Vec<ElementRef<'_>> = if selectors.item.is_some() {
            scope.select(&selectors.link).take(1).collect()
        } else {
            scope.select(&selectors.link).collect()
        };
        for link in cards {
            let Some(address) = link.value().attr("href").and_then(|h| resolve(page_url, h)) else {
                continue;
            };
            let reference = first_text(scope, selectors.reference.as_ref())
                .and_then(|t| capture_reference(&t, reference_re))
                .unwrap_or_else(|| reference_from_address(&address, reference_re));
            let mut item = DiscoveredItem::new(reference, address);
            if let Some(status) = first_text(scope, selectors.status.as_ref()) {
                let status = status.to_uppercase();
                if !selectors.ignore_statuses.contains(&status) {
                    item.listing_status = Some(status);
                }
            }
            item.listing_price = first_text(scope, selectors.price.as_ref()).and_then(|t| parse_integer(&t));
            out.push(item);
        }
    }
    Ok(out)
}

fn extract_detail(
    html: &str,
    page_url: &str,
    selectors: &CompiledDetail,
    reference_re: Option<&Regex>,
) -> Result<ListingDraft, AdapterError> {
    let document = Html::parse_document(html);
    let root = document.root_element();
    let text = |sel: &Option<Selector>| first_text(root, sel.as_ref());

    let gallery = match &selectors.gallery {
        Some(sel) => document
            .select(sel)
            .filter_map(|el| {
                let v = el.value();
                v.attr("src")
                    .or_else(|| v.attr("data-src"))
                    .or_else(|| v.attr("href"))
            })
            .filter_map(|src| resolve(page_url, src))
            .collect(),
        None => Vec::new(),
    };

    Ok(ListingDraft {
        reference_code: text(&selectors.reference).and_then(|t| capture_reference(&t, reference_re)),
        title: text(&selectors.title),
        description: text(&selectors.description),
        location: text(&selectors.location),
        price: text(&selectors.price).and_then(|t| parse_integer(&t)),
        built_area: text(&selectors.built_area).and_then(|t| parse_number(&t)),
        plot_area: text(&selectors.plot_area).and_then(|t| parse_number(&t)),
        bedrooms: text(&selectors.bedrooms)
            .and_then(|t| parse_integer(&t))
            .and_then(|n| u32::try_from(n).ok()),
        bathrooms: text(&selectors.bathrooms)
            .and_then(|t| parse_integer(&t))
            .and_then(|n| u32::try_from(n).ok()),
        property_type: text(&selectors.property_type),
        status: text(&selectors.status).map(|s| s.to_uppercase()),
        amenities: None,
        featured_image: None,
        gallery,
    })
}

fn first_numeric_run(text: &str) -> Option<String> {
    let chars: Vec<char> = text.chars().collect();
    let start = chars.iter().position(|c| c.is_ascii_digit())?;
    let mut run = String::new();
    let mut i = start;
    while i < chars.len() {
        let ch = chars[i];
        if ch.is_ascii_digit() || ch == '.' || ch == ',' {
            run.push(ch);
        } else if (ch == ' ' || ch == '\u{a0}') && thousands_group_follows(&chars, i + 1) {
            // grouped digits such as "1 250 000"
        } else {
            break;
        }
        i += 1;
    }
    Some(run)
}

fn thousands_group_follows(chars: &[char], from: usize) -> bool {
    let group = chars.get(from..from + 3);
    matches!(group, Some(g) if g.iter().all(char::is_ascii_digit))
        && chars.get(from + 3).map_or(true, |c| !c.is_ascii_digit())
}

fn normalize_number(run: &str) -> Option<String> {
    let run = run.trim_end_matches(['.', ',']);
    if run.is_empty() {
        return None;
    }
    let last_dot = run.rfind('.');
    let last_comma = run.rfind(',');
    let decimal_sep = match (last_dot, last_comma) {
        (Some(d), Some(c)) => Some(if d > c { '.' } else { ',' }),
        (Some(pos), None) | (None, Some(pos)) => {
            let sep = run[pos..].chars().next()?;
            let occurrences = run.matches(sep).count();
            let digits_after = run.len() - pos - 1;
            if occurrences == 1 && digits_after != 3 {
                Some(sep)
            } else {
                None
            }
        }
        (None, None) => None,
    };
    let mut out = String::with_capacity(run.len());
    for ch in run.chars() {
        if ch.is_ascii_digit() {
            out.push(ch);
        } else if Some(ch) == decimal_sep {
            out.push('.');
        }
    }
    Some(out)
}

/// First number in free text, tolerant of `.`/`,`/space thousands grouping.
pub fn parse_number(text: &str) -> Option<f64> {
    normalize_number(&first_numeric_run(text)?)?.parse().ok()
}

/// Like [`parse_number`], truncated to whole units (prices, room counts).
pub fn parse_integer(text: &str) -> Option<i64> {
    parse_number(text).map(|v| v.trunc() as i64)
}

/// `<loc>` values from a sitemap: page addresses, or child sitemaps for an index.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SitemapDoc {
    pub pages: Vec<String>,
    pub children: Vec<String>,
}

pub fn parse_sitemap(xml: &str) -> Result<SitemapDoc, AdapterError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_str(xml);
    let mut doc = SitemapDoc::default();
    let mut in_url = false;
    let mut in_sitemap = false;
    let mut in_loc = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"url" => in_url = true,
                b"sitemap" => in_sitemap = true,
                b"loc" => in_loc = in_url || in_sitemap,
                _ => {}
            },
            Ok(Event::Text(e)) if in_loc => {
                let loc = e
                    .unescape()
                    .map_err(|err| AdapterError::Message(format!("sitemap text: {err}")))?
                    .trim()
                    .to_string();
                if !loc.is_empty() {
                    if in_url {
                        doc.pages.push(loc);
                    } else {
                        doc.children.push(loc);
                    }
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"loc" => in_loc = false,
                b"url" => in_url = false,
                b"sitemap" => in_sitemap = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(err) => return Err(AdapterError::Message(format!("sitemap xml: {err}"))),
            _ => {}
        }
        buf.clear();
    }
    Ok(doc)
}

// ---------------------------------------------------------------------------
// Politeness gates
// ---------------------------------------------------------------------------

/// Allow/deny check consulted once per detail fetch. Implementations fail open.
#[async_trait]
pub trait PolitenessGate: Send + Sync {
    async fn is_allowed(&self, address: &str) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl PolitenessGate for AllowAll {
    async fn is_allowed(&self, _address: &str) -> bool {
        true
    }
}

/// robots.txt for the address's origin.
pub fn robots_url_for(address: &str) -> Option<String> {
    let url = Url::parse(address).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    Some(format!("{}/robots.txt", url.origin().ascii_serialization()))
}

/// Product token of a user agent (`inmo/0.1.0` → `inmo`), as robots.txt groups are keyed.
pub fn agent_token(user_agent: &str) -> &str {
    user_agent
        .split(['/', ' '])
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("*")
}

fn parse_robots(agent: &str, robots_txt: &[u8], robots_url: &str) -> Option<Robot> {
    match Robot::new(agent, robots_txt) {
        Ok(robot) => Some(robot),
        Err(err) => {
            warn!(robots_url, error = %err, "unparseable robots.txt; allowing");
            None
        }
    }
}

/// robots.txt gate fetching each origin's rules once per run.
pub struct RobotsGate {
    http: HttpFetcher,
    agent: String,
    cache: Mutex<HashMap<String, Option<Robot>>>,
}

impl RobotsGate {
    pub fn new(http: HttpFetcher) -> Self {
        let agent = agent_token(http.user_agent()).to_string();
        Self {
            http,
            agent,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl PolitenessGate for RobotsGate {
    async fn is_allowed(&self, address: &str) -> bool {
        let Some(robots_url) = robots_url_for(address) else {
            return true;
        };
        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.get(&robots_url) {
                return entry.as_ref().map_or(true, |robot| robot.allowed(address));
            }
        }

        let robot = match self.http.fetch_bytes(&robots_url).await {
            Ok(resp) => parse_robots(&self.agent, &resp.body, &robots_url),
            Err(err) => {
                debug!(robots_url, error = %err, "robots.txt unavailable; allowing");
                None
            }
        };
        let allowed = robot.as_ref().map_or(true, |r| r.allowed(address));
        self.cache.lock().await.insert(robots_url, robot);
        allowed
    }
}
