use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One normalized vehicle observation.
///
/// Field order and serde names define the artifact's column layout:
/// `capture_timestamp, vehicle_id, line, latitude, longitude, speed,
/// timestamp_gps, placa, sentido, trajeto, raw_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    #[serde(rename = "capture_timestamp")]
    pub capture_time: DateTime<Utc>,
    pub vehicle_id: String,
    #[serde(rename = "line")]
    pub route_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: Option<f64>,
    #[serde(rename = "timestamp_gps")]
    pub source_time: Option<String>,

    // auxiliary fields kept for audit
    #[serde(rename = "placa")]
    pub plate: String,
    #[serde(rename = "sentido")]
    pub direction: String,
    #[serde(rename = "trajeto")]
    pub trajectory: String,
    pub raw_data: String,
}

/// Column names of the artifact header row, in order.
pub const COLUMNS: [&str; 11] = [
    "capture_timestamp",
    "vehicle_id",
    "line",
    "latitude",
    "longitude",
    "speed",
    "timestamp_gps",
    "placa",
    "sentido",
    "trajeto",
    "raw_data",
];

impl PositionRecord {
    /// Builds a record with only the required fields set.
    pub fn new(
        capture_time: DateTime<Utc>,
        vehicle_id: impl Into<String>,
        route_id: impl Into<String>,
        latitude: f64,
        longitude: f64,
    ) -> Self {
        Self {
            capture_time,
            vehicle_id: vehicle_id.into(),
            route_id: route_id.into(),
            latitude,
            longitude,
            speed: None,
            source_time: None,
            plate: String::new(),
            direction: String::new(),
            trajectory: String::new(),
            raw_data: String::new(),
        }
    }

    /// Returns `true` if both identifiers are non-empty.
    pub fn has_identity(&self) -> bool {
        !self.vehicle_id.trim().is_empty() && !self.route_id.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_identity() {
        let now = Utc::now();
        assert!(PositionRecord::new(now, "BRT1001", "10", -22.9, -43.2).has_identity());
        assert!(!PositionRecord::new(now, "", "10", -22.9, -43.2).has_identity());
        assert!(!PositionRecord::new(now, "BRT1001", "  ", -22.9, -43.2).has_identity());
    }

    #[test]
    fn test_header_matches_columns() {
        let mut writer = csv::Writer::from_writer(vec![]);
        writer
            .serialize(PositionRecord::new(Utc::now(), "a", "b", 0.0, 0.0))
            .unwrap();
        let bytes = writer.into_inner().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let header = text.lines().next().unwrap();
        assert_eq!(header, COLUMNS.join(","));
    }
}
