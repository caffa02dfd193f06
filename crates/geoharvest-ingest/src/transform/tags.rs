//! Tags derived from a record's fields
//!
//! Computed geometry, altitude and heading win over the observed values.
//! Absent fields produce no tag.

use crate::record::Record;
use std::fmt;

/// One `-Group:Name=value` assignment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExifTag {
    pub group: &'static str,
    pub name: &'static str,
    pub value: String,
    /// Write the raw value, bypassing print conversion (`Name#=value`)
    pub raw: bool,
}

impl ExifTag {
    fn new(group: &'static str, name: &'static str, value: impl fmt::Display) -> Self {
        Self {
            group,
            name,
            value: value.to_string(),
            raw: false,
        }
    }

    fn raw(group: &'static str, name: &'static str, value: impl fmt::Display) -> Self {
        Self {
            raw: true,
            ..Self::new(group, name, value)
        }
    }
}

impl fmt::Display for ExifTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hash = if self.raw { "#" } else { "" };
        write!(f, "-{}:{}{}={}", self.group, self.name, hash, self.value)
    }
}

/// Position, camera and orientation tags
pub fn exif_tags(record: &Record) -> Vec<ExifTag> {
    let mut tags = Vec::new();

    if let Some(position) = record.position() {
        let lat_ref = if position.lat >= 0.0 { "N" } else { "S" };
        let lon_ref = if position.lon >= 0.0 { "E" } else { "W" };
        tags.push(ExifTag::new("GPS", "GPSLatitude", position.lat.abs()));
        tags.push(ExifTag::raw("GPS", "GPSLatitudeRef", lat_ref));
        tags.push(ExifTag::new("GPS", "GPSLongitude", position.lon.abs()));
        tags.push(ExifTag::raw("GPS", "GPSLongitudeRef", lon_ref));

        if let Some(altitude) = position.altitude {
            let below_sea_level = u8::from(altitude < 0.0);
            tags.push(ExifTag::new("GPS", "GPSAltitude", altitude.abs()));
            tags.push(ExifTag::raw("GPS", "GPSAltitudeRef", below_sea_level));
        }
    }

    if let Some(heading) = record.heading() {
        tags.push(ExifTag::new("GPS", "GPSImgDirection", heading));
        tags.push(ExifTag::raw("GPS", "GPSImgDirectionRef", "T"));
    }

    if let Some(make) = record.make.as_deref().filter(|m| !m.is_empty()) {
        tags.push(ExifTag::new("EXIF", "Make", make));
    }
    if let Some(model) = record.model.as_deref().filter(|m| !m.is_empty()) {
        tags.push(ExifTag::new("EXIF", "Model", model));
    }
    if let Some(width) = record.width {
        tags.push(ExifTag::new("EXIF", "ImageWidth", width));
    }
    if let Some(height) = record.height {
        tags.push(ExifTag::new("EXIF", "ImageHeight", height));
    }
    if let Some(orientation) = record.exif_orientation.filter(|o| (1..=8).contains(o)) {
        tags.push(ExifTag::raw("EXIF", "Orientation", orientation));
    }
    if let Some(captured) = record.captured_at_utc() {
        tags.push(ExifTag::new(
            "EXIF",
            "DateTimeOriginal",
            captured.format("%Y:%m:%d %H:%M:%S"),
        ));
    }

    tags
}

/// Equirectangular projection tags, or `None` when the record is not a
/// panorama or lacks its dimensions
pub fn panorama_tags(record: &Record) -> Option<Vec<ExifTag>> {
    if !record.is_panorama() {
        return None;
    }
    let (width, height) = (record.width?, record.height?);

    let mut tags = vec![
        ExifTag::new("XMP-GPano", "ProjectionType", "equirectangular"),
        ExifTag::new("XMP-GPano", "UsePanoramaViewer", "True"),
        ExifTag::new("XMP-GPano", "FullPanoWidthPixels", width),
        ExifTag::new("XMP-GPano", "FullPanoHeightPixels", height),
        ExifTag::new("XMP-GPano", "CroppedAreaImageWidthPixels", width),
        ExifTag::new("XMP-GPano", "CroppedAreaImageHeightPixels", height),
        ExifTag::new("XMP-GPano", "CroppedAreaLeftPixels", 0),
        ExifTag::new("XMP-GPano", "CroppedAreaTopPixels", 0),
    ];
    if let Some(heading) = record.heading() {
        tags.push(ExifTag::new("XMP-GPano", "PoseHeadingDegrees", heading));
    }
    Some(tags)
}
