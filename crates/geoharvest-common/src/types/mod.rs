//! Common types used across geoharvest

use crate::error::CommonError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix shared by every collection this tool produces
pub const COLLECTION_PREFIX: &str = "mapillary";

/// Asset quality variant offered by the image API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Quality {
    #[serde(rename = "256")]
    Thumb256,
    #[serde(rename = "1024")]
    Thumb1024,
    #[serde(rename = "2048")]
    Thumb2048,
    #[serde(rename = "original")]
    Original,
}

impl Quality {
    /// All quality labels, smallest first
    pub const ALL: [Quality; 4] = [
        Quality::Thumb256,
        Quality::Thumb1024,
        Quality::Thumb2048,
        Quality::Original,
    ];

    /// Label used on the command line, in checkpoints, and in collection names
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Thumb256 => "256",
            Quality::Thumb1024 => "1024",
            Quality::Thumb2048 => "2048",
            Quality::Original => "original",
        }
    }

    /// API field carrying the asset URL for this quality
    pub fn url_field(&self) -> &'static str {
        match self {
            Quality::Thumb256 => "thumb_256_url",
            Quality::Thumb1024 => "thumb_1024_url",
            Quality::Thumb2048 => "thumb_2048_url",
            Quality::Original => "thumb_original_url",
        }
    }
}

impl Default for Quality {
    fn default() -> Self {
        Quality::Original
    }
}

impl FromStr for Quality {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "256" => Ok(Quality::Thumb256),
            "1024" => Ok(Quality::Thumb1024),
            "2048" => Ok(Quality::Thumb2048),
            "original" => Ok(Quality::Original),
            _ => Err(CommonError::InvalidQuality(s.to_string())),
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name of one harvested collection, e.g. `mapillary-alice-original-webp`
///
/// The same name is used for the local collection directory and for the
/// upstream archive item, which is what the existence check queries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionName {
    pub account: String,
    pub quality: Quality,
    pub webp: bool,
}

impl CollectionName {
    pub fn new(account: impl Into<String>, quality: Quality, webp: bool) -> Self {
        Self {
            account: account.into(),
            quality,
            webp,
        }
    }

    /// Parse a collection identifier back into its parts
    pub fn parse(identifier: &str) -> Result<Self, CommonError> {
        let invalid = || CommonError::InvalidCollection(identifier.to_string());

        let rest = identifier
            .strip_prefix(COLLECTION_PREFIX)
            .and_then(|r| r.strip_prefix('-'))
            .ok_or_else(invalid)?;

        let (rest, webp) = match rest.strip_suffix("-webp") {
            Some(stripped) => (stripped, true),
            None => (rest, false),
        };

        let (account, quality) = rest.rsplit_once('-').ok_or_else(invalid)?;
        if account.is_empty() {
            return Err(invalid());
        }
        let quality = quality.parse::<Quality>().map_err(|_| invalid())?;

        Ok(Self::new(account, quality, webp))
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", COLLECTION_PREFIX, self.account, self.quality)?;
        if self.webp {
            f.write_str("-webp")?;
        }
        Ok(())
    }
}
