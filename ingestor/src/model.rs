use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Columns every dataset row carries. Metric keys may not reuse them.
pub const DEVICE_COLUMN: &str = "device";
pub const TIMESTAMP_COLUMN: &str = "timestamp";
pub const VERSION_COLUMN: &str = "version";
pub const RESERVED_COLUMNS: [&str; 3] = [DEVICE_COLUMN, TIMESTAMP_COLUMN, VERSION_COLUMN];

/// Telemetry payload as published by a sensor on the data topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryMessage {
    pub device: String,
    #[serde(default)]
    pub version: Option<String>,
    pub data: Map<String, Value>,
}

/// One metric cell.
///
/// `Text` never holds a string that parses as a finite number; such strings
/// are always normalized to `Number`. `Null` only appears when a reading is
/// resolved against a wider schema than the one it was recorded with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
    Null,
}

impl MetricValue {
    /// Normalizes a raw string the way sensors send them (`"42.1"`, `"3"`).
    pub fn from_text(raw: &str) -> Self {
        match raw.trim().parse::<f64>() {
            Ok(number) if number.is_finite() => MetricValue::Number(number),
            _ => MetricValue::Text(raw.to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, MetricValue::Null)
    }

    /// Text rendering used for string columns. Numbers use the shortest
    /// representation that parses back to the same value.
    pub fn render(&self) -> Option<String> {
        match self {
            MetricValue::Number(n) => Some(n.to_string()),
            MetricValue::Text(s) => Some(s.clone()),
            MetricValue::Null => None,
        }
    }
}

/// One persisted telemetry sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub firmware_version: String,
    pub metrics: BTreeMap<String, MetricValue>,
}

impl Reading {
    /// Builds a reading from a decoded message and a server-assigned timestamp.
    pub fn from_message(message: TelemetryMessage, timestamp: DateTime<Utc>) -> Self {
        let mut metrics = BTreeMap::new();
        flatten_into(&mut metrics, None, message.data);

        Reading {
            device_id: message.device,
            timestamp,
            firmware_version: message.version.unwrap_or_default(),
            metrics,
        }
    }

    pub fn metric(&self, name: &str) -> Option<&MetricValue> {
        self.metrics.get(name)
    }
}

fn flatten_into(out: &mut BTreeMap<String, MetricValue>, prefix: Option<&str>, data: Map<String, Value>) {
    for (key, value) in data {
        let name = match prefix {
            Some(prefix) => format!("{}.{}", prefix, key),
            None => key,
        };

        let metric = match value {
            Value::Null => continue,
            Value::Bool(flag) => MetricValue::Number(if flag { 1.0 } else { 0.0 }),
            Value::Number(number) => match number.as_f64() {
                Some(n) if n.is_finite() => MetricValue::Number(n),
                _ => MetricValue::Text(number.to_string()),
            },
            Value::String(text) => MetricValue::from_text(&text),
            Value::Array(_) => MetricValue::Text(value.to_string()),
            Value::Object(nested) => {
                flatten_into(out, Some(&name), nested);
                continue;
            }
        };

        out.insert(name, metric);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(data: Value) -> TelemetryMessage {
        serde_json::from_value(json!({
            "device": "sensor_3",
            "version": "1.0.1",
            "data": data,
        }))
        .unwrap()
    }

    #[test]
    fn test_string_encoded_numbers_become_numeric() {
        let reading = Reading::from_message(
            message(json!({"avg_speed": "42.1", "num_cars": "3", "sensor_1_up": "1"})),
            Utc::now(),
        );

        assert_eq!(reading.metric("avg_speed"), Some(&MetricValue::Number(42.1)));
        assert_eq!(reading.metric("num_cars"), Some(&MetricValue::Number(3.0)));
        assert_eq!(reading.metric("sensor_1_up"), Some(&MetricValue::Number(1.0)));
    }

    #[test]
    fn test_non_numeric_strings_stay_text() {
        let reading = Reading::from_message(
            message(json!({"lane": "north", "weird": "nan"})),
            Utc::now(),
        );

        assert_eq!(reading.metric("lane"), Some(&MetricValue::Text("north".into())));
        assert_eq!(reading.metric("weird"), Some(&MetricValue::Text("nan".into())));
    }

    #[test]
    fn test_nested_objects_are_flattened_and_nulls_dropped() {
        let reading = Reading::from_message(
            message(json!({"radar": {"gain": 4, "ok": true}, "missing": null})),
            Utc::now(),
        );

        assert_eq!(reading.metric("radar.gain"), Some(&MetricValue::Number(4.0)));
        assert_eq!(reading.metric("radar.ok"), Some(&MetricValue::Number(1.0)));
        assert!(reading.metric("missing").is_none());
    }

    #[test]
    fn test_missing_version_is_empty() {
        let msg: TelemetryMessage =
            serde_json::from_value(json!({"device": "sensor_0", "data": {}})).unwrap();
        let reading = Reading::from_message(msg, Utc::now());

        assert_eq!(reading.firmware_version, "");
    }

    #[test]
    fn test_rendered_numbers_parse_back_exactly() {
        for n in [42.1, 0.1 + 0.2, 3.0, 1e-7, 123456789.987654321] {
            let rendered = MetricValue::Number(n).render().unwrap();
            assert_eq!(MetricValue::from_text(&rendered), MetricValue::Number(n));
        }
    }
}
