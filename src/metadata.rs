/**
 * Metadata records shared by the extractor, reconciler and writer
 */

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a metadata value was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetadataSource {
    EmbeddedExif,
    SidecarJson,
}

impl fmt::Display for MetadataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataSource::EmbeddedExif => write!(f, "embedded-exif"),
            MetadataSource::SidecarJson => write!(f, "sidecar-json"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsCoord {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
}

impl GpsCoord {
    pub fn new(latitude: f64, longitude: f64, altitude: Option<f64>) -> Self {
        Self { latitude, longitude, altitude }
    }
}

impl fmt::Display for GpsCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}, {:.6}", self.latitude, self.longitude)?;
        if let Some(alt) = self.altitude {
            write!(f, " ({:.1} m)", alt)?;
        }
        Ok(())
    }
}

/// Capture time and location known about one stored file
///
/// `datetime` is local wall-clock time, the way EXIF stores it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhotoMetadata {
    pub datetime: Option<NaiveDateTime>,
    pub datetime_source: Option<MetadataSource>,
    pub gps: Option<GpsCoord>,
    pub gps_source: Option<MetadataSource>,
}

impl PhotoMetadata {
    pub fn embedded(datetime: Option<NaiveDateTime>, gps: Option<GpsCoord>) -> Self {
        Self::from_source(MetadataSource::EmbeddedExif, datetime, gps)
    }

    pub fn sidecar(datetime: Option<NaiveDateTime>, gps: Option<GpsCoord>) -> Self {
        Self::from_source(MetadataSource::SidecarJson, datetime, gps)
    }

    fn from_source(
        source: MetadataSource,
        datetime: Option<NaiveDateTime>,
        gps: Option<GpsCoord>,
    ) -> Self {
        Self {
            datetime_source: datetime.map(|_| source),
            datetime,
            gps_source: gps.map(|_| source),
            gps,
        }
    }

    pub fn has_datetime(&self) -> bool {
        self.datetime.is_some()
    }

    pub fn has_gps(&self) -> bool {
        self.gps.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.has_datetime() && self.has_gps()
    }
}

/// Degrees/minutes/seconds form of one coordinate axis
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dms {
    pub degrees: u32,
    pub minutes: u32,
    pub seconds: f64,
}

impl Dms {
    /// Split the magnitude of a decimal-degree value, seconds rounded to 1/100
    pub fn from_decimal(value: f64) -> Self {
        let total_hundredths = (value.abs() * 3600.0 * 100.0).round() as u64;
        let degrees = total_hundredths / (3600 * 100);
        let rest = total_hundredths % (3600 * 100);
        let minutes = rest / (60 * 100);
        let hundredths = rest % (60 * 100);

        Self {
            degrees: degrees as u32,
            minutes: minutes as u32,
            seconds: hundredths as f64 / 100.0,
        }
    }

    pub fn to_decimal(&self) -> f64 {
        self.degrees as f64 + self.minutes as f64 / 60.0 + self.seconds / 3600.0
    }
}

impl fmt::Display for Dms {
    /// exiftool input notation: `35 deg 40' 12.34"`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} deg {}' {:.2}\"", self.degrees, self.minutes, self.seconds)
    }
}

pub fn latitude_ref(latitude: f64) -> &'static str {
    if latitude < 0.0 { "S" } else { "N" }
}

pub fn longitude_ref(longitude: f64) -> &'static str {
    if longitude < 0.0 { "W" } else { "E" }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn sources_follow_present_fields() {
        let dt = NaiveDate::from_ymd_opt(2018, 11, 12)
            .unwrap()
            .and_hms_opt(12, 42, 35)
            .unwrap();
        let meta = PhotoMetadata::sidecar(Some(dt), None);
        assert_eq!(meta.datetime_source, Some(MetadataSource::SidecarJson));
        assert_eq!(meta.gps_source, None);
        assert!(meta.has_datetime());
        assert!(!meta.has_gps());
        assert!(!meta.is_complete());
    }

    #[test]
    fn serializes_datetime_as_iso8601() {
        let dt = NaiveDate::from_ymd_opt(2018, 11, 12)
            .unwrap()
            .and_hms_opt(12, 42, 35)
            .unwrap();
        let meta = PhotoMetadata::embedded(Some(dt), Some(GpsCoord::new(35.5, 139.25, None)));
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["datetime"], "2018-11-12T12:42:35");
        assert_eq!(json["datetime_source"], "embedded-exif");
        assert_eq!(json["gps"]["latitude"], 35.5);
        assert!(json["gps"]["altitude"].is_null());
    }

    #[test]
    fn dms_carries_rounded_seconds() {
        // 59.999.. seconds rounds up into the next minute
        let dms = Dms::from_decimal(10.0 + 59.0 / 60.0 + 59.9999 / 3600.0);
        assert_eq!(dms.degrees, 11);
        assert_eq!(dms.minutes, 0);
        assert_eq!(dms.seconds, 0.0);
    }

    #[test]
    fn dms_uses_magnitude_and_formats_for_exiftool() {
        let dms = Dms::from_decimal(-35.67);
        assert_eq!(dms.degrees, 35);
        assert_eq!(dms.minutes, 40);
        assert!((dms.seconds - 12.0).abs() < 1e-9);
        assert_eq!(dms.to_string(), "35 deg 40' 12.00\"");
        assert!((dms.to_decimal() - 35.67).abs() < 1e-6);
        assert_eq!(latitude_ref(-35.67), "S");
        assert_eq!(longitude_ref(139.0), "E");
    }
}
