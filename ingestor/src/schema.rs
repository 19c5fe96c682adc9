//! Metric schema registry.
//!
//! Sensors on different firmware report different metric sets. The registry
//! remembers which metric keys each firmware version has reported and keeps
//! the union of all keys in first-seen order. The union is the column set of
//! the dataset file; a reading is resolved against it at read time, with
//! `MetricValue::Null` standing in for metrics its firmware never sent.

use crate::model::{MetricValue, Reading};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaRegistry {
    columns: Vec<String>,
    by_version: BTreeMap<String, Vec<String>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_readings<'a>(readings: impl IntoIterator<Item = &'a Reading>) -> Self {
        let mut registry = Self::new();
        for reading in readings {
            registry.observe(reading);
        }
        registry
    }

    /// Records the metric keys of `reading`. Returns true when the union grew.
    pub fn observe(&mut self, reading: &Reading) -> bool {
        let known = self
            .by_version
            .entry(reading.firmware_version.clone())
            .or_default();
        for key in reading.metrics.keys() {
            if !known.contains(key) {
                known.push(key.clone());
            }
        }

        let before = self.columns.len();
        for key in reading.metrics.keys() {
            if !self.columns.contains(key) {
                self.columns.push(key.clone());
            }
        }
        self.columns.len() > before
    }

    /// Union of metric columns, in the order they were first seen.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn versions(&self) -> impl Iterator<Item = &str> {
        self.by_version.keys().map(String::as_str)
    }

    /// Metric keys reported by a firmware version.
    pub fn fields_for(&self, version: &str) -> Option<&[String]> {
        self.by_version.get(version).map(Vec::as_slice)
    }

    /// Aligns a reading to the union columns.
    pub fn resolve<'a>(&'a self, reading: &Reading) -> Vec<(&'a str, MetricValue)> {
        self.columns
            .iter()
            .map(|column| {
                let value = reading
                    .metrics
                    .get(column)
                    .cloned()
                    .unwrap_or(MetricValue::Null);
                (column.as_str(), value)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn reading(version: &str, keys: &[&str]) -> Reading {
        Reading {
            device_id: "sensor_1".to_string(),
            timestamp: Utc::now(),
            firmware_version: version.to_string(),
            metrics: keys
                .iter()
                .map(|k| (k.to_string(), MetricValue::Number(1.0)))
                .collect(),
        }
    }

    #[test]
    fn test_union_grows_with_new_firmware_fields() {
        let mut registry = SchemaRegistry::new();

        assert!(registry.observe(&reading("1.0.0", &["avg_speed", "num_cars"])));
        assert!(!registry.observe(&reading("1.0.0", &["avg_speed"])));
        assert!(registry.observe(&reading("1.1.0", &["avg_speed", "sensor_3_up"])));

        assert_eq!(registry.columns(), ["avg_speed", "num_cars", "sensor_3_up"]);
        assert_eq!(
            registry.fields_for("1.1.0").unwrap(),
            ["avg_speed", "sensor_3_up"]
        );
        assert_eq!(registry.versions().collect::<Vec<_>>(), ["1.0.0", "1.1.0"]);
    }

    #[test]
    fn test_resolve_fills_null_for_older_records() {
        let old = reading("1.0.0", &["avg_speed"]);
        let new = reading("1.1.0", &["avg_speed", "sensor_3_up"]);
        let registry = SchemaRegistry::from_readings([&old, &new]);

        let resolved = registry.resolve(&old);

        assert_eq!(
            resolved,
            vec![
                ("avg_speed", MetricValue::Number(1.0)),
                ("sensor_3_up", MetricValue::Null),
            ]
        );
    }
}
