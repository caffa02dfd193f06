//! Harvest configuration
//!
//! Defaults match the public image API's limits. Every field can be
//! overridden from `GEOHARVEST_*` environment variables; the CLI layers its
//! flags on top of [`HarvestConfig::from_env`].

use crate::error::{IngestError, Result};
use crate::fetch::{BackoffPolicy, FetchConfig};
use geoharvest_common::{CollectionName, Quality};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Largest page the image API will return
pub const MAX_PAGE_SIZE: u32 = 2000;

pub const DEFAULT_API_BASE_URL: &str = "https://graph.mapillary.com";
pub const DEFAULT_ARCHIVE_BASE_URL: &str = "https://archive.org";

/// Geographic filter as `[west, south, east, north]` in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl BoundingBox {
    pub fn validate(&self) -> Result<()> {
        let lon_ok = |v: f64| (-180.0..=180.0).contains(&v);
        let lat_ok = |v: f64| (-90.0..=90.0).contains(&v);

        if !(lon_ok(self.west) && lon_ok(self.east)) {
            return Err(IngestError::config(format!("bbox longitude out of range: {self}")));
        }
        if !(lat_ok(self.south) && lat_ok(self.north)) {
            return Err(IngestError::config(format!("bbox latitude out of range: {self}")));
        }
        if self.west >= self.east || self.south >= self.north {
            return Err(IngestError::config(format!(
                "bbox must satisfy west < east and south < north: {self}"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for BoundingBox {
    /// The query-parameter form: four comma-joined floats
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.west, self.south, self.east, self.north)
    }
}

impl FromStr for BoundingBox {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        let values = s
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| IngestError::config(format!("invalid bbox '{s}': {e}")))?;

        match values.as_slice() {
            [west, south, east, north] => Ok(Self {
                west: *west,
                south: *south,
                east: *east,
                north: *north,
            }),
            _ => Err(IngestError::config(format!(
                "invalid bbox '{s}': expected west,south,east,north"
            ))),
        }
    }
}

/// How downloaded assets are arranged under the collection directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagingLayout {
    /// `<sequence>/<id>.jpg`
    #[default]
    Sequence,
    /// `<YYYY-MM-DD>/<sequence>/<id>.jpg`, sealable into per-day bundles
    Date,
}

impl FromStr for StagingLayout {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sequence" => Ok(StagingLayout::Sequence),
            "date" => Ok(StagingLayout::Date),
            _ => Err(IngestError::config(format!(
                "invalid layout '{s}': expected 'sequence' or 'date'"
            ))),
        }
    }
}

/// Settings for one harvest run
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub api_base_url: String,
    pub archive_base_url: String,

    /// Parent directory of all collection directories
    pub output_root: PathBuf,

    pub quality: Quality,
    pub bbox: Option<BoundingBox>,

    pub workers: usize,
    /// Bounded queue between the crawl and the workers; `None` means 4 × workers
    pub queue_depth: Option<usize>,
    /// Checkpoint flush after this many successful items
    pub flush_interval: usize,

    pub webp: bool,
    pub compress_metadata: bool,
    pub layout: StagingLayout,
    /// Seal date directories into bundles once the crawl completes
    pub package: bool,

    pub request_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub page_size: u32,
    pub inter_page_delay: Duration,

    pub token: Option<String>,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            archive_base_url: DEFAULT_ARCHIVE_BASE_URL.to_string(),
            output_root: PathBuf::from("./mapillary_data"),
            quality: Quality::Original,
            bbox: None,
            workers: 8,
            queue_depth: None,
            flush_interval: 10,
            webp: false,
            compress_metadata: false,
            layout: StagingLayout::Sequence,
            package: false,
            request_timeout: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
            page_size: MAX_PAGE_SIZE,
            inter_page_delay: Duration::from_millis(10),
            token: None,
        }
    }
}

impl HarvestConfig {
    /// Load configuration from environment variables
    ///
    /// - `GEOHARVEST_API_URL`, `GEOHARVEST_ARCHIVE_URL`
    /// - `GEOHARVEST_OUTPUT`: output root directory
    /// - `GEOHARVEST_QUALITY`: 256, 1024, 2048 or original
    /// - `GEOHARVEST_BBOX`: west,south,east,north
    /// - `GEOHARVEST_WORKERS`, `GEOHARVEST_QUEUE_DEPTH`, `GEOHARVEST_FLUSH_INTERVAL`
    /// - `GEOHARVEST_WEBP`, `GEOHARVEST_COMPRESS`, `GEOHARVEST_PACKAGE` (true/false)
    /// - `GEOHARVEST_LAYOUT`: sequence or date
    /// - `GEOHARVEST_TIMEOUT_SECS`, `GEOHARVEST_MAX_RETRIES`, `GEOHARVEST_PAGE_SIZE`
    /// - `MAPILLARY_TOKEN`: API access token
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(url) = lookup("GEOHARVEST_API_URL") {
            config.api_base_url = url;
        }
        if let Some(url) = lookup("GEOHARVEST_ARCHIVE_URL") {
            config.archive_base_url = url;
        }
        if let Some(dir) = lookup("GEOHARVEST_OUTPUT") {
            config.output_root = PathBuf::from(dir);
        }
        if let Some(quality) = lookup("GEOHARVEST_QUALITY") {
            config.quality = quality.parse()?;
        }
        if let Some(bbox) = lookup("GEOHARVEST_BBOX") {
            config.bbox = Some(bbox.parse()?);
        }
        if let Some(workers) = lookup("GEOHARVEST_WORKERS") {
            config.workers = parse_number("GEOHARVEST_WORKERS", &workers)?;
        }
        if let Some(depth) = lookup("GEOHARVEST_QUEUE_DEPTH") {
            config.queue_depth = Some(parse_number("GEOHARVEST_QUEUE_DEPTH", &depth)?);
        }
        if let Some(interval) = lookup("GEOHARVEST_FLUSH_INTERVAL") {
            config.flush_interval = parse_number("GEOHARVEST_FLUSH_INTERVAL", &interval)?;
        }
        if let Some(val) = lookup("GEOHARVEST_WEBP") {
            config.webp = parse_flag(&val);
        }
        if let Some(val) = lookup("GEOHARVEST_COMPRESS") {
            config.compress_metadata = parse_flag(&val);
        }
        if let Some(val) = lookup("GEOHARVEST_PACKAGE") {
            config.package = parse_flag(&val);
        }
        if let Some(layout) = lookup("GEOHARVEST_LAYOUT") {
            config.layout = layout.parse()?;
        }
        if let Some(secs) = lookup("GEOHARVEST_TIMEOUT_SECS") {
            config.request_timeout =
                Duration::from_secs(parse_number("GEOHARVEST_TIMEOUT_SECS", &secs)?);
        }
        if let Some(retries) = lookup("GEOHARVEST_MAX_RETRIES") {
            config.backoff.max_attempts = parse_number("GEOHARVEST_MAX_RETRIES", &retries)?;
        }
        if let Some(size) = lookup("GEOHARVEST_PAGE_SIZE") {
            config.page_size = parse_number("GEOHARVEST_PAGE_SIZE", &size)?;
        }
        if let Some(token) = lookup("MAPILLARY_TOKEN").filter(|t| !t.trim().is_empty()) {
            config.token = Some(token);
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(IngestError::config("workers must be at least 1"));
        }
        if self.queue_depth == Some(0) {
            return Err(IngestError::config("queue depth must be at least 1"));
        }
        if self.flush_interval == 0 {
            return Err(IngestError::config("flush interval must be at least 1"));
        }
        if !(1..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(IngestError::config(format!(
                "page size must be between 1 and {MAX_PAGE_SIZE}, got {}",
                self.page_size
            )));
        }
        if self.backoff.max_attempts == 0 {
            return Err(IngestError::config("max retries must be at least 1"));
        }
        if let Some(bbox) = &self.bbox {
            bbox.validate()?;
        }
        if self.package && self.layout != StagingLayout::Date {
            return Err(IngestError::config(
                "packaging seals per-day directories and requires the 'date' layout",
            ));
        }
        for (name, url) in [("API", &self.api_base_url), ("archive", &self.archive_base_url)] {
            url::Url::parse(url)
                .map_err(|e| IngestError::config(format!("invalid {name} base URL '{url}': {e}")))?;
        }
        Ok(())
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.unwrap_or(self.workers * 4).max(1)
    }

    pub fn collection_name(&self, account: &str) -> CollectionName {
        CollectionName::new(account, self.quality, self.webp)
    }

    pub fn collection_dir(&self, account: &str) -> PathBuf {
        self.output_root.join(self.collection_name(account).to_string())
    }

    pub fn images_endpoint(&self) -> String {
        format!("{}/images", self.api_base_url.trim_end_matches('/'))
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            timeout: self.request_timeout,
            backoff: self.backoff,
            token: self.token.clone(),
            ..FetchConfig::default()
        }
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| IngestError::config(format!("{key}='{value}': {e}")))
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup<'a>(vars: &'a HashMap<&str, &str>) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| vars.get(key).map(|v| v.to_string())
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = HarvestConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue_depth(), 32);
        assert_eq!(config.images_endpoint(), "https://graph.mapillary.com/images");
    }

    #[test]
    fn test_from_lookup_overrides() {
        let vars: HashMap<&str, &str> = [
            ("GEOHARVEST_QUALITY", "1024"),
            ("GEOHARVEST_WORKERS", "3"),
            ("GEOHARVEST_WEBP", "true"),
            ("GEOHARVEST_LAYOUT", "date"),
            ("GEOHARVEST_PACKAGE", "1"),
            ("GEOHARVEST_BBOX", "-1.5, 50, 2, 51.25"),
            ("MAPILLARY_TOKEN", "abc"),
        ]
        .into_iter()
        .collect();

        let config = HarvestConfig::from_lookup(lookup(&vars)).unwrap();

        assert_eq!(config.quality, Quality::Thumb1024);
        assert_eq!(config.workers, 3);
        assert_eq!(config.queue_depth(), 12);
        assert!(config.webp && config.package);
        assert_eq!(config.layout, StagingLayout::Date);
        assert_eq!(config.bbox.unwrap().to_string(), "-1.5,50,2,51.25");
        assert_eq!(config.token.as_deref(), Some("abc"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_rejects_garbage_numbers() {
        let vars: HashMap<&str, &str> = [("GEOHARVEST_WORKERS", "many")].into_iter().collect();
        assert!(HarvestConfig::from_lookup(lookup(&vars)).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let invalid = [
            HarvestConfig { workers: 0, ..Default::default() },
            HarvestConfig { flush_interval: 0, ..Default::default() },
            HarvestConfig { page_size: 2001, ..Default::default() },
            HarvestConfig { page_size: 0, ..Default::default() },
            HarvestConfig { package: true, ..Default::default() },
            HarvestConfig { api_base_url: "not a url".into(), ..Default::default() },
        ];
        for config in invalid {
            assert!(config.validate().is_err(), "{config:?} should be rejected");
        }
    }

    #[test]
    fn test_bbox_parse_and_validate() {
        let bbox: BoundingBox = "10,20,11,21".parse().unwrap();
        assert!(bbox.validate().is_ok());

        assert!("10,20,11".parse::<BoundingBox>().is_err());
        assert!("a,b,c,d".parse::<BoundingBox>().is_err());
        assert!("11,20,10,21".parse::<BoundingBox>().unwrap().validate().is_err());
        assert!("10,-95,11,21".parse::<BoundingBox>().unwrap().validate().is_err());
    }

    #[test]
    fn test_collection_dir_uses_collection_name() {
        let config = HarvestConfig {
            output_root: PathBuf::from("/data"),
            quality: Quality::Thumb2048,
            webp: true,
            ..Default::default()
        };
        assert_eq!(
            config.collection_dir("alice"),
            PathBuf::from("/data/mapillary-alice-2048-webp")
        );
    }
}
