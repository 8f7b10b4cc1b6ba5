//! JSON normalization for the vehicle-position feed.
//!
//! The upstream schema has drifted over time (`ordem` became `codigo`, and so
//! on), so each logical attribute is looked up through an ordered list of
//! candidate field names.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::FeedError;
use crate::record::PositionRecord;

/// Fields that may wrap the vehicle array when the body is an object.
const ARRAY_FIELDS: &[&str] = &["veiculos", "vehicles", "data"];

const VEHICLE_ID: &[&str] = &["codigo", "ordem", "vehicle_id", "id"];
const ROUTE_ID: &[&str] = &["linha", "line", "route_id"];
const LATITUDE: &[&str] = &["latitude", "lat"];
const LONGITUDE: &[&str] = &["longitude", "lon", "lng"];
const SPEED: &[&str] = &["velocidade", "speed"];
const SOURCE_TIME: &[&str] = &["dataHora", "datahora", "timestamp"];
const PLATE: &[&str] = &["placa"];
const DIRECTION: &[&str] = &["sentido", "direcao", "direction"];
const TRAJECTORY: &[&str] = &["trajeto"];

/// Outcome of normalizing one poll.
#[derive(Debug, Default)]
pub struct ParsedPoll {
    pub records: Vec<PositionRecord>,
    /// Vehicles skipped for missing identifiers or coordinates.
    pub dropped: usize,
}

/// Decodes a feed response body into normalized records.
///
/// # Errors
///
/// Returns [`FeedError::Parse`] if the body is not JSON, or is a JSON scalar.
pub fn parse_positions(bytes: &[u8], capture_time: DateTime<Utc>) -> Result<ParsedPoll, FeedError> {
    let body: Value =
        serde_json::from_slice(bytes).map_err(|e| FeedError::Parse(e.to_string()))?;

    let vehicles = match body {
        Value::Array(items) => items,
        Value::Object(mut obj) => {
            let wrapper = ARRAY_FIELDS
                .iter()
                .copied()
                .find(|f| matches!(obj.get(*f), Some(Value::Array(_))));
            match wrapper.and_then(|f| obj.remove(f)) {
                Some(Value::Array(items)) => items,
                _ => vec![Value::Object(obj)],
            }
        }
        other => {
            return Err(FeedError::Parse(format!(
                "expected array or object, got {}",
                kind_of(&other)
            )));
        }
    };

    let mut parsed = ParsedPoll::default();
    for vehicle in vehicles {
        match vehicle {
            Value::Object(fields) => match normalize(&fields, capture_time) {
                Some(record) => parsed.records.push(record),
                None => parsed.dropped += 1,
            },
            _ => parsed.dropped += 1,
        }
    }
    Ok(parsed)
}

fn normalize(fields: &Map<String, Value>, capture_time: DateTime<Utc>) -> Option<PositionRecord> {
    let vehicle_id = text(fields, VEHICLE_ID).unwrap_or_default();
    let route_id = text(fields, ROUTE_ID).unwrap_or_default();
    let latitude = number(fields, LATITUDE)?;
    let longitude = number(fields, LONGITUDE)?;

    let record = PositionRecord {
        capture_time,
        vehicle_id,
        route_id,
        latitude,
        longitude,
        speed: number(fields, SPEED),
        source_time: text(fields, SOURCE_TIME),
        plate: text(fields, PLATE).unwrap_or_default(),
        direction: text(fields, DIRECTION).unwrap_or_default(),
        trajectory: text(fields, TRAJECTORY).unwrap_or_default(),
        raw_data: Value::Object(fields.clone()).to_string(),
    };

    record.has_identity().then_some(record)
}

/// First non-null candidate rendered as a trimmed, non-empty string.
fn text(fields: &Map<String, Value>, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        let value = match fields.get(*name)? {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => return None,
        };
        (!value.is_empty()).then_some(value)
    })
}

/// First candidate that is a finite number, or a string holding one.
fn number(fields: &Map<String, Value>, names: &[&str]) -> Option<f64> {
    names.iter().find_map(|name| {
        let value = match fields.get(*name)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().replace(',', ".").parse::<f64>().ok(),
            _ => None,
        }?;
        value.is_finite().then_some(value)
    })
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &str) -> Result<ParsedPoll, FeedError> {
        parse_positions(body.as_bytes(), Utc::now())
    }

    #[test]
    fn test_parse_invalid_json() {
        let result = parse("<html>gateway timeout</html>");
        assert!(matches!(result, Err(FeedError::Parse(_))));
    }

    #[test]
    fn test_parse_scalar_is_error() {
        assert!(matches!(parse("42"), Err(FeedError::Parse(_))));
    }

    #[test]
    fn test_parse_empty_array_is_valid() {
        let parsed = parse("[]").unwrap();
        assert!(parsed.records.is_empty());
        assert_eq!(parsed.dropped, 0);
    }

    #[test]
    fn test_parse_current_field_names() {
        let parsed = parse(
            r#"[{"codigo": "BRT1001", "linha": "10", "latitude": -22.9, "longitude": -43.2,
                 "velocidade": 35.5, "dataHora": 1729000000000, "placa": "ABC1D23",
                 "sentido": "IDA", "trajeto": "Alvorada x Santa Cruz"}]"#,
        )
        .unwrap();

        assert_eq!(parsed.records.len(), 1);
        let r = &parsed.records[0];
        assert_eq!(r.vehicle_id, "BRT1001");
        assert_eq!(r.route_id, "10");
        assert_eq!(r.latitude, -22.9);
        assert_eq!(r.speed, Some(35.5));
        assert_eq!(r.source_time.as_deref(), Some("1729000000000"));
        assert_eq!(r.plate, "ABC1D23");
        assert_eq!(r.direction, "IDA");
        assert_eq!(r.trajectory, "Alvorada x Santa Cruz");
        assert!(r.raw_data.contains("\"codigo\":\"BRT1001\""));
    }

    #[test]
    fn test_parse_legacy_field_names_in_wrapper() {
        let parsed = parse(
            r#"{"veiculos": [{"ordem": "B31001", "linha": "50",
                 "latitude": "-22,91", "longitude": "-43.18", "direcao": "VOLTA"}]}"#,
        )
        .unwrap();

        let r = &parsed.records[0];
        assert_eq!(r.vehicle_id, "B31001");
        assert_eq!(r.latitude, -22.91);
        assert_eq!(r.direction, "VOLTA");
        assert_eq!(r.speed, None);
        assert_eq!(r.source_time, None);
        assert_eq!(r.plate, "");
    }

    #[test]
    fn test_preferred_name_wins_over_fallback() {
        let parsed = parse(
            r#"[{"codigo": "NEW", "ordem": "OLD", "linha": "1", "latitude": 1, "longitude": 2}]"#,
        )
        .unwrap();
        assert_eq!(parsed.records[0].vehicle_id, "NEW");
    }

    #[test]
    fn test_empty_preferred_name_falls_through() {
        let parsed = parse(
            r#"[{"codigo": "", "ordem": "OLD", "linha": "1", "latitude": 1, "longitude": 2}]"#,
        )
        .unwrap();
        assert_eq!(parsed.records[0].vehicle_id, "OLD");
    }

    #[test]
    fn test_records_without_identity_are_dropped() {
        let parsed = parse(
            r#"[{"codigo": "A", "linha": "1", "latitude": 1, "longitude": 2},
                {"codigo": "B", "latitude": 1, "longitude": 2},
                {"linha": "1", "latitude": 1, "longitude": 2},
                {"codigo": "C", "linha": "1", "latitude": null, "longitude": 2},
                "not-an-object"]"#,
        )
        .unwrap();
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.dropped, 4);
    }

    #[test]
    fn test_single_object_is_one_vehicle() {
        let parsed = parse(r#"{"codigo": "A", "linha": "1", "lat": 1.5, "lng": 2.5}"#).unwrap();
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].longitude, 2.5);
    }
}
