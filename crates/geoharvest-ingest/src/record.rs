//! Harvested image records
//!
//! A [`Record`] names every field the pipeline reads. Anything else the API
//! returns is kept in [`Record::extra`] so that a logged record serializes
//! back to the same JSON it was read from.
//!
//! Typed fields are read leniently: numbers sent as strings or floats are
//! coerced, and a value of the wrong shape reads as absent instead of failing
//! the whole page.

use chrono::{DateTime, Utc};
use geoharvest_common::Quality;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Fields requested from the image API, without the quality-specific URL
pub const BASE_FIELDS: &[&str] = &[
    "id",
    "captured_at",
    "compass_angle",
    "computed_compass_angle",
    "geometry",
    "computed_geometry",
    "altitude",
    "computed_altitude",
    "is_pano",
    "sequence",
    "camera_type",
    "camera_parameters",
    "make",
    "model",
    "exif_orientation",
    "computed_rotation",
    "height",
    "width",
];

/// Comma-joined field list for the first page request of a crawl
pub fn requested_fields(quality: Quality) -> String {
    let mut fields: Vec<&str> = BASE_FIELDS.to_vec();
    fields.push(quality.url_field());
    fields.join(",")
}

/// GeoJSON point as returned by the API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    #[serde(rename = "type", default = "point")]
    pub kind: String,
    #[serde(default)]
    pub coordinates: Vec<f64>,
}

fn point() -> String {
    "Point".to_string()
}

impl Geometry {
    pub fn point(lon: f64, lat: f64) -> Self {
        Self {
            kind: point(),
            coordinates: vec![lon, lat],
        }
    }

    pub fn lon(&self) -> Option<f64> {
        self.coordinates.first().copied()
    }

    pub fn lat(&self) -> Option<f64> {
        self.coordinates.get(1).copied()
    }
}

/// Resolved position, computed values already preferred over observed ones
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub lon: f64,
    pub lat: f64,
    pub altitude: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Empty when the API omitted it; such records never enter id sets
    #[serde(default, deserialize_with = "lenient_id")]
    pub id: String,

    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub sequence: Option<String>,

    /// Capture time in epoch milliseconds
    #[serde(default, deserialize_with = "lenient_i64", skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<i64>,

    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Geometry>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub computed_geometry: Option<Geometry>,

    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub computed_altitude: Option<f64>,

    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub compass_angle: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub computed_compass_angle: Option<f64>,

    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub is_pano: Option<bool>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub camera_type: Option<String>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub make: Option<String>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64", skip_serializing_if = "Option::is_none")]
    pub exif_orientation: Option<i64>,
    #[serde(default, deserialize_with = "lenient_u32", skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, deserialize_with = "lenient_u32", skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,

    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub thumb_256_url: Option<String>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub thumb_1024_url: Option<String>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub thumb_2048_url: Option<String>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub thumb_original_url: Option<String>,

    /// Passthrough fields such as `camera_parameters` and `computed_rotation`
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn has_id(&self) -> bool {
        !self.id.is_empty()
    }

    /// Asset URL for the given quality; other qualities are never consulted
    pub fn asset_url(&self, quality: Quality) -> Option<&str> {
        let url = match quality {
            Quality::Thumb256 => &self.thumb_256_url,
            Quality::Thumb1024 => &self.thumb_1024_url,
            Quality::Thumb2048 => &self.thumb_2048_url,
            Quality::Original => &self.thumb_original_url,
        };
        url.as_deref().filter(|u| !u.is_empty())
    }

    pub fn position(&self) -> Option<Position> {
        let geometry = self.computed_geometry.as_ref().or(self.geometry.as_ref())?;
        Some(Position {
            lon: geometry.lon()?,
            lat: geometry.lat()?,
            altitude: self.computed_altitude.or(self.altitude),
        })
    }

    pub fn heading(&self) -> Option<f64> {
        self.computed_compass_angle.or(self.compass_angle)
    }

    pub fn captured_at_utc(&self) -> Option<DateTime<Utc>> {
        self.captured_at.and_then(DateTime::<Utc>::from_timestamp_millis)
    }

    pub fn is_panorama(&self) -> bool {
        self.is_pano == Some(true)
    }
}

fn lenient_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(id)) => id,
        Some(Value::Number(id)) => id.to_string(),
        _ => String::new(),
    })
}

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    Ok(Option::<Value>::deserialize(deserializer)?.and_then(|v| serde_json::from_value(v).ok()))
}

fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    let value = match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    Ok(value.filter(|v| v.is_finite()))
}

fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().and_then(whole_number)),
        Some(Value::String(s)) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(whole_number))
        },
        _ => None,
    })
}

fn lenient_u32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
    Ok(lenient_i64(deserializer)?.and_then(|v| u32::try_from(v).ok()))
}

fn whole_number(v: f64) -> Option<i64> {
    (v.is_finite() && v.fract() == 0.0 && v.abs() < i64::MAX as f64).then_some(v as i64)
}
