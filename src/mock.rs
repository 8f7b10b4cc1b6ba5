//! Synthetic BRT feed for running the whole pipeline offline.
//!
//! Bodies are shaped like the real API response and go through the same
//! parser, so a mock run exercises normalization as well as buffering,
//! flushing and publishing.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Value, json};
use std::sync::{Mutex, PoisonError};

use crate::error::FeedError;
use crate::feed::FeedSource;
use crate::parser::parse_positions;
use crate::record::PositionRecord;

struct Corridor {
    name: &'static str,
    code: &'static str,
    latitude: (f64, f64),
    longitude: (f64, f64),
}

/// Rio BRT corridors with rough bounding boxes.
const CORRIDORS: [Corridor; 4] = [
    Corridor {
        name: "Transoeste",
        code: "TOE",
        latitude: (-23.012, -22.995),
        longitude: (-43.490, -43.360),
    },
    Corridor {
        name: "Transcarioca",
        code: "TCA",
        latitude: (-22.910, -22.885),
        longitude: (-43.370, -43.250),
    },
    Corridor {
        name: "Transolimpica",
        code: "TOL",
        latitude: (-22.920, -22.900),
        longitude: (-43.440, -43.320),
    },
    Corridor {
        name: "TransBrasil",
        code: "TBR",
        latitude: (-22.910, -22.880),
        longitude: (-43.300, -43.180),
    },
];

pub struct MockFeed {
    vehicles_per_corridor: usize,
    rng: Mutex<StdRng>,
}

impl MockFeed {
    /// Same `seed`, same sequence of bodies.
    pub fn new(vehicles_per_corridor: usize, seed: u64) -> Self {
        Self {
            vehicles_per_corridor,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn vehicles_per_poll(&self) -> usize {
        self.vehicles_per_corridor * CORRIDORS.len()
    }

    /// One API-shaped response body: `{"veiculos": [...]}`.
    pub fn body(&self, now: DateTime<Utc>) -> Vec<u8> {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let mut vehicles = Vec::with_capacity(self.vehicles_per_poll());

        for corridor in &CORRIDORS {
            for i in 0..self.vehicles_per_corridor {
                let reported_at = now - TimeDelta::seconds(rng.random_range(0..60));
                let latitude = rng.random_range(corridor.latitude.0..corridor.latitude.1);
                let longitude = rng.random_range(corridor.longitude.0..corridor.longitude.1);
                let speed = speed(&mut rng);
                let direction = if rng.random_bool(0.5) { "IDA" } else { "VOLTA" };
                let service = if i % 2 == 0 { "Expresso" } else { "Parador" };

                vehicles.push(json!({
                    "codigo": format!("BRT-{}-{}", corridor.code, 1000 + i),
                    "linha": corridor.name,
                    "latitude": round(latitude, 6),
                    "longitude": round(longitude, 6),
                    "velocidade": round(speed, 1),
                    "dataHora": reported_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                    "sentido": direction,
                    "trajeto": format!("{} - {service}", corridor.name),
                }));
            }
        }

        json!({ "veiculos": Value::Array(vehicles) }).to_string().into_bytes()
    }
}

#[async_trait]
impl FeedSource for MockFeed {
    async fn poll(&self) -> Result<Vec<PositionRecord>, FeedError> {
        let capture_time = Utc::now();
        let body = self.body(capture_time);
        Ok(parse_positions(&body, capture_time)?.records)
    }
}

/// km/h: 10% stopped, 40% slow, 40% cruising, 10% fast.
fn speed(rng: &mut StdRng) -> f64 {
    let roll: f64 = rng.random();
    if roll < 0.1 {
        0.0
    } else if roll < 0.5 {
        rng.random_range(10.0..30.0)
    } else if roll < 0.9 {
        rng.random_range(30.0..60.0)
    } else {
        rng.random_range(60.0..80.0)
    }
}

fn round(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_same_seed_same_body() {
        let now = Utc::now();
        assert_eq!(MockFeed::new(5, 42).body(now), MockFeed::new(5, 42).body(now));
        assert_ne!(MockFeed::new(5, 42).body(now), MockFeed::new(5, 43).body(now));
    }

    #[tokio::test]
    async fn test_poll_yields_valid_records_for_every_corridor() {
        let feed = MockFeed::new(10, 7);
        let records = feed.poll().await.unwrap();

        assert_eq!(records.len(), feed.vehicles_per_poll());
        let ids: HashSet<_> = records.iter().map(|r| r.vehicle_id.as_str()).collect();
        assert_eq!(ids.len(), records.len());
        let lines: HashSet<_> = records.iter().map(|r| r.route_id.as_str()).collect();
        assert_eq!(lines.len(), CORRIDORS.len());

        for r in &records {
            assert!((-23.02..=-22.87).contains(&r.latitude), "{r:?}");
            assert!((-43.50..=-43.17).contains(&r.longitude), "{r:?}");
            let speed = r.speed.unwrap();
            assert!((0.0..=80.0).contains(&speed));
            assert!(r.source_time.is_some());
            assert!(r.direction == "IDA" || r.direction == "VOLTA");
        }
    }

    #[tokio::test]
    async fn test_zero_vehicles_is_an_empty_poll() {
        let feed = MockFeed::new(0, 1);
        assert!(feed.poll().await.unwrap().is_empty());
    }
}
