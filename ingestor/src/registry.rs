//! Device registry: the distinct devices seen in the dataset joined with a
//! static location mapping. Nothing here is persisted.

use crate::errors::{Error, Result};
use crate::model::Reading;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceLocation {
    pub lat: f64,
    pub lon: f64,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSummary {
    pub device_id: String,
    pub location: Option<DeviceLocation>,
    pub last_seen: Option<DateTime<Utc>>,
    pub firmware_version: Option<String>,
    pub reading_count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    locations: BTreeMap<String, DeviceLocation>,
}

const DUBLIN_SENSORS: [(&str, f64, f64, &str); 10] = [
    ("sensor_0", 53.353805, -6.260310, "North of River Liffey"),
    ("sensor_1", 53.334103, -6.267493, "Near Dublin Port"),
    ("sensor_2", 53.338167, -6.249929, "East towards the coast"),
    ("sensor_3", 53.353267, -6.282929, "West near Phoenix Park"),
    ("sensor_4", 53.348167, -6.235929, "Further east, coastal"),
    ("sensor_5", 53.346267, -6.289929, "Further west"),
    ("sensor_6", 53.342167, -6.246929, "East, near Dublin Port"),
    ("sensor_7", 53.359267, -6.264929, "North, closer to Drumcondra"),
    ("sensor_8", 53.345167, -6.298929, "West, towards Chapelizod"),
    ("sensor_9", 53.357267, -6.253929, "North-east, near Clontarf"),
];

impl DeviceRegistry {
    pub fn new(locations: BTreeMap<String, DeviceLocation>) -> Self {
        Self { locations }
    }

    /// The ten roadside sensors of the Dublin deployment.
    pub fn dublin() -> Self {
        let locations = DUBLIN_SENSORS
            .iter()
            .map(|(id, lat, lon, label)| {
                (
                    id.to_string(),
                    DeviceLocation {
                        lat: *lat,
                        lon: *lon,
                        label: label.to_string(),
                    },
                )
            })
            .collect();
        Self::new(locations)
    }

    /// Loads `{"sensor_0": {"lat": .., "lon": .., "label": ..}, ...}`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("reading device locations {}: {}", path.display(), e))
        })?;
        let locations: BTreeMap<String, DeviceLocation> = serde_json::from_str(&raw)?;
        Ok(Self::new(locations))
    }

    pub fn location(&self, device_id: &str) -> Option<&DeviceLocation> {
        self.locations.get(device_id)
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    /// One entry per device that either has readings or a known location,
    /// ordered by device id.
    pub fn summarize(&self, readings: &[Reading]) -> Vec<DeviceSummary> {
        let mut devices: BTreeMap<&str, DeviceSummary> = BTreeMap::new();

        for reading in readings {
            let summary = devices
                .entry(reading.device_id.as_str())
                .or_insert_with(|| self.empty_summary(&reading.device_id));
            summary.reading_count += 1;
            if summary.last_seen.map_or(true, |seen| reading.timestamp >= seen) {
                summary.last_seen = Some(reading.timestamp);
                summary.firmware_version = Some(reading.firmware_version.clone());
            }
        }

        for device_id in self.locations.keys() {
            devices
                .entry(device_id.as_str())
                .or_insert_with(|| self.empty_summary(device_id));
        }

        devices.into_values().collect()
    }

    fn empty_summary(&self, device_id: &str) -> DeviceSummary {
        DeviceSummary {
            device_id: device_id.to_string(),
            location: self.location(device_id).cloned(),
            last_seen: None,
            firmware_version: None,
            reading_count: 0,
        }
    }
}
