//! Core listing model, change fingerprints and record validation for the listing ledger.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "inmo-core";

/// Rental listings priced above this are treated as sales mislabelled by the source text.
pub const RENTAL_PRICE_CEILING: i64 = 6000;

/// Status marker written onto records whose address vanished from their source.
pub const REMOVED_STATUS: &str = "REMOVED_FROM_SOURCE";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("listing has an empty detail address")]
    EmptyAddress,
    #[error("listing {address} has an empty source name")]
    EmptySource { address: String },
    #[error("listing {address} has a negative price {price}")]
    NegativePrice { address: String, price: i64 },
    #[error("unknown crawl mode `{0}` (expected `incremental` or `full`)")]
    UnknownMode(String),
}

/// Whether a run only fetches new addresses or re-verifies every discovered one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlMode {
    #[default]
    Incremental,
    Full,
}

impl CrawlMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlMode::Incremental => "incremental",
            CrawlMode::Full => "full",
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, CrawlMode::Full)
    }
}

impl fmt::Display for CrawlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CrawlMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "incremental" | "inc" => Ok(CrawlMode::Incremental),
            "full" | "full-rescan" | "complete" => Ok(CrawlMode::Full),
            other => Err(ValidationError::UnknownMode(other.to_string())),
        }
    }
}

/// Short deterministic hash over the fields used for change detection (price and status).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Absent values hash through a tagged sentinel, so an unknown price never
    /// collides with a real one and an absent status never collides with any text.
    pub fn of(price: Option<i64>, status: Option<&str>) -> Self {
        let price = match price {
            Some(p) => format!("p:{p}"),
            None => "p!".to_string(),
        };
        let status = match status {
            Some(s) => format!("s:{s}"),
            None => "s!".to_string(),
        };
        let mut hasher = Sha256::new();
        hasher.update(price.as_bytes());
        hasher.update(b"|");
        hasher.update(status.as_bytes());
        let digest = hex::encode(hasher.finalize());
        Self(digest[..16].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Amenities {
    pub pool: bool,
    pub garage: bool,
    pub elevator: bool,
    pub sea_views: bool,
    pub rental: bool,
}

const SEA_VIEW_TERMS: &[&str] = &[
    "VISTAS AL MAR",
    "VISTA AL MAR",
    "FRENTE AL MAR",
    "PRIMERA LINEA",
    "SEA VIEWS",
];

impl Amenities {
    /// Keyword scan over free text (title, description).
    pub fn detect(text: &str) -> Self {
        let t = text.to_uppercase();
        Self {
            pool: t.contains("PISCINA") || t.contains("POOL"),
            garage: ["GARAJE", "PARKING", "COCHERA"].iter().any(|k| t.contains(k)),
            elevator: t.contains("ASCENSOR"),
            sea_views: SEA_VIEW_TERMS.iter().any(|k| t.contains(k)),
            rental: t.contains("ALQUILER"),
        }
    }
}

// Multi-word keys precede their single-word prefixes.
const PROPERTY_TYPES: &[(&str, &str)] = &[
    ("CASA CAMPO", "Finca"),
    ("EDIFICIO SINGULAR", "Edificio"),
    ("PLANTA BAJA", "Piso"),
    ("CHALET", "Chalet"),
    ("ADOSADO", "Chalet"),
    ("VILLA", "Villa"),
    ("APARTAMENTO", "Apartamento"),
    ("APTO", "Apartamento"),
    ("CASA", "Casa"),
    ("PISO", "Piso"),
    ("ÁTICO", "Ático"),
    ("ATICO", "Ático"),
    ("LOCAL", "Local"),
    ("BAR", "Local"),
    ("RESTAURANTE", "Local"),
    ("SOLAR", "Solar"),
    ("PARCELA", "Solar"),
    ("GARAJE", "Garaje"),
    ("PARKING", "Garaje"),
    ("TERRENO", "Terreno"),
    ("HUERTO", "Huerto"),
    ("FINCA", "Finca"),
    ("NAVE", "Nave"),
    ("OFICINA", "Oficina"),
    ("EDIFICIO", "Edificio"),
];

pub fn detect_property_type(text: &str) -> Option<String> {
    let upper = text.to_uppercase();
    PROPERTY_TYPES
        .iter()
        .find(|(key, _)| upper.contains(key))
        .map(|(_, label)| (*label).to_string())
}

/// Canonical persisted listing, keyed by `detail_address`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingRecord {
    pub detail_address: String,
    pub source_name: String,
    #[serde(default)]
    pub reference_code: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub price: Option<i64>,
    #[serde(default)]
    pub built_area: Option<f64>,
    #[serde(default)]
    pub plot_area: Option<f64>,
    #[serde(default)]
    pub bedrooms: Option<u32>,
    #[serde(default)]
    pub bathrooms: Option<u32>,
    #[serde(default)]
    pub property_type: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub amenities: Amenities,
    #[serde(default)]
    pub removed: bool,
    #[serde(default, deserialize_with = "timestamp::deserialize_opt")]
    pub removed_at: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "timestamp::deserialize")]
    pub first_seen_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "timestamp::deserialize_opt")]
    pub last_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub featured_image: Option<String>,
    #[serde(default)]
    pub gallery: Vec<String>,
}

impl ListingRecord {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self.price, self.status.as_deref())
    }

    /// Flags the record as gone from its source. Returns false when it already was.
    pub fn mark_removed(&mut self, at: DateTime<Utc>) -> bool {
        if self.removed {
            return false;
        }
        self.removed = true;
        self.status = Some(REMOVED_STATUS.to_string());
        self.removed_at = Some(at);
        true
    }
}

/// Where a fetched draft came from; supplied by the orchestrator, not the adapter.
#[derive(Debug, Clone, Copy)]
pub struct RecordOrigin<'a> {
    pub source_name: &'a str,
    pub reference_code: &'a str,
    pub detail_address: &'a str,
    pub fetched_at: DateTime<Utc>,
}

/// Pre-validated handoff contract from adapters into the reconciliation pipeline.
///
/// Every field is optional; adapters fill what they can extract and
/// [`ListingDraft::into_record`] applies defaults and validation in one place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingDraft {
    pub reference_code: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub price: Option<i64>,
    pub built_area: Option<f64>,
    pub plot_area: Option<f64>,
    pub bedrooms: Option<u32>,
    pub bathrooms: Option<u32>,
    pub property_type: Option<String>,
    pub status: Option<String>,
    pub amenities: Option<Amenities>,
    pub featured_image: Option<String>,
    pub gallery: Vec<String>,
}

impl ListingDraft {
    pub fn into_record(self, origin: RecordOrigin<'_>) -> Result<ListingRecord, ValidationError> {
        let detail_address = origin.detail_address.trim();
        if detail_address.is_empty() {
            return Err(ValidationError::EmptyAddress);
        }
        let source_name = origin.source_name.trim();
        if source_name.is_empty() {
            return Err(ValidationError::EmptySource {
                address: detail_address.to_string(),
            });
        }
        if let Some(price) = self.price.filter(|p| *p < 0) {
            return Err(ValidationError::NegativePrice {
                address: detail_address.to_string(),
                price,
            });
        }

        let title = self.title.and_then(text_or_none);
        let description = self.description.and_then(text_or_none);
        let detection_text = format!(
            "{} {}",
            title.as_deref().unwrap_or_default(),
            description.as_deref().unwrap_or_default()
        );

        let mut amenities = self
            .amenities
            .unwrap_or_else(|| Amenities::detect(&detection_text));
        // TODO: confirm with product whether the rental ceiling should stay a hard override.
        if amenities.rental && self.price.is_some_and(|p| p > RENTAL_PRICE_CEILING) {
            amenities.rental = false;
        }

        let property_type = self
            .property_type
            .and_then(text_or_none)
            .or_else(|| title.as_deref().and_then(detect_property_type));

        let reference_code = self
            .reference_code
            .and_then(text_or_none)
            .unwrap_or_else(|| origin.reference_code.trim().to_string());

        let mut gallery = Vec::with_capacity(self.gallery.len());
        for image in self.gallery.into_iter().filter_map(text_or_none) {
            if !gallery.contains(&image) {
                gallery.push(image);
            }
        }
        let featured_image = self
            .featured_image
            .and_then(text_or_none)
            .or_else(|| gallery.first().cloned());

        Ok(ListingRecord {
            detail_address: detail_address.to_string(),
            source_name: source_name.to_string(),
            reference_code,
            title,
            location: self.location.and_then(text_or_none),
            price: self.price,
            built_area: self.built_area,
            plot_area: self.plot_area,
            bedrooms: self.bedrooms,
            bathrooms: self.bathrooms,
            property_type,
            status: self.status.and_then(text_or_none),
            amenities,
            removed: false,
            removed_at: None,
            first_seen_at: origin.fetched_at,
            last_updated_at: None,
            featured_image,
            gallery,
        })
    }
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Informational counters for one source pass or a whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatistics {
    pub discovered: usize,
    pub known: usize,
    pub new: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub removed: usize,
    pub failed: usize,
    pub denied: usize,
}

impl RunStatistics {
    pub fn absorb(&mut self, other: &RunStatistics) {
        self.discovered += other.discovered;
        self.known += other.known;
        self.new += other.new;
        self.changed += other.changed;
        self.unchanged += other.unchanged;
        self.skipped += other.skipped;
        self.removed += other.removed;
        self.failed += other.failed;
        self.denied += other.denied;
    }
}

/// Timestamp parsing that also accepts offset-less values written by older runs.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{de::Error as _, Deserialize, Deserializer};

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|n| n.and_utc())
            })
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| D::Error::custom(format!("invalid timestamp `{raw}`")))
    }

    pub fn deserialize_opt<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(value) => parse(value)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("invalid timestamp `{value}`"))),
        }
    }
}
