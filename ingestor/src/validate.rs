use crate::errors::{Error, Result};
use crate::model::{MetricValue, Reading, RESERVED_COLUMNS};

const DEVICE_ID_MAX_LEN: usize = 128;

/// Metrics that are counts or speeds and can never be negative.
const NON_NEGATIVE_METRICS: [&str; 4] = ["avg_speed", "max_speed", "min_speed", "num_cars"];

/// Validates a reading before it is appended to the dataset
pub fn validate(reading: &Reading) -> Result<()> {
    // Validate device_id
    if reading.device_id.is_empty() {
        return Err(Error::Malformed("Device ID cannot be empty".to_string()));
    }
    if reading.device_id.len() > DEVICE_ID_MAX_LEN {
        return Err(Error::Malformed(format!(
            "Device ID longer than {} bytes",
            DEVICE_ID_MAX_LEN
        )));
    }
    if reading.device_id.chars().any(char::is_control) {
        return Err(Error::Malformed(
            "Device ID contains control characters".to_string(),
        ));
    }

    for (name, value) in &reading.metrics {
        if name.is_empty() {
            return Err(Error::Malformed("Metric name cannot be empty".to_string()));
        }
        if RESERVED_COLUMNS.contains(&name.as_str()) {
            return Err(Error::Malformed(format!(
                "Metric name '{}' collides with a reserved column",
                name
            )));
        }

        if let MetricValue::Number(n) = value {
            if *n < 0.0 && NON_NEGATIVE_METRICS.contains(&name.as_str()) {
                return Err(Error::Malformed(format!(
                    "Metric {} = {} must not be negative",
                    name, n
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn reading(device_id: &str, metrics: &[(&str, MetricValue)]) -> Reading {
        Reading {
            device_id: device_id.to_string(),
            timestamp: Utc::now(),
            firmware_version: "1.0.1".to_string(),
            metrics: metrics
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn test_valid_reading() {
        let reading = reading(
            "sensor_1",
            &[
                ("avg_speed", MetricValue::Number(42.1)),
                ("num_cars", MetricValue::Number(3.0)),
            ],
        );

        assert!(validate(&reading).is_ok());
    }

    #[test]
    fn test_empty_device_id() {
        assert!(validate(&reading("", &[])).is_err());
    }

    #[test]
    fn test_control_characters_in_device_id() {
        assert!(validate(&reading("sensor\n1", &[])).is_err());
    }

    #[test]
    fn test_negative_speed() {
        let reading = reading("sensor_1", &[("min_speed", MetricValue::Number(-1.0))]);

        assert!(validate(&reading).is_err());
    }

    #[test]
    fn test_negative_unknown_metric_is_allowed() {
        let reading = reading("sensor_1", &[("temperature", MetricValue::Number(-4.0))]);

        assert!(validate(&reading).is_ok());
    }

    #[test]
    fn test_reserved_column_name() {
        let reading = reading("sensor_1", &[("timestamp", MetricValue::Number(1.0))]);

        assert!(validate(&reading).is_err());
    }
}
