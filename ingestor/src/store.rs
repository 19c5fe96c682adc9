use crate::errors::{Error, Result};
use crate::model::Reading;
use crate::schema::SchemaRegistry;
use std::sync::{Arc, Mutex, RwLock};

/// Committed, immutable view of the dataset in append order.
pub type Snapshot = Arc<Vec<Reading>>;

/// Readings and the schema registry they were written with. Both are
/// replaced in one step when an append commits, so a reader never pairs the
/// readings of one commit with the columns of another.
#[derive(Debug, Clone, Default)]
pub struct Committed {
    pub readings: Snapshot,
    pub schema: Arc<SchemaRegistry>,
}

impl Committed {
    pub fn new(readings: Vec<Reading>) -> Self {
        Self {
            schema: Arc::new(SchemaRegistry::from_readings(&readings)),
            readings: Arc::new(readings),
        }
    }

    /// The state after appending `reading`, and whether the schema widened.
    pub(crate) fn with_reading(&self, reading: Reading) -> (Self, bool) {
        let mut schema = SchemaRegistry::clone(&self.schema);
        let widened = schema.observe(&reading);

        let mut readings = Vec::with_capacity(self.readings.len() + 1);
        readings.extend(self.readings.iter().cloned());
        readings.push(reading);

        let next = Self {
            readings: Arc::new(readings),
            schema: Arc::new(schema),
        };
        (next, widened)
    }
}

/// Append-only dataset of readings.
///
/// Appends are serialized; a snapshot taken concurrently with an append
/// observes the dataset either entirely before or entirely after it, and
/// never waits for the append to finish writing.
pub trait DatasetStore: Send + Sync {
    fn append(&self, reading: Reading) -> Result<()>;

    fn committed(&self) -> Result<Committed>;

    fn snapshot(&self) -> Result<Snapshot> {
        Ok(self.committed()?.readings)
    }

    fn schema(&self) -> Result<Arc<SchemaRegistry>> {
        Ok(self.committed()?.schema)
    }

    fn len(&self) -> Result<usize> {
        Ok(self.snapshot()?.len())
    }
}

/// In-memory store used by tests and by embedders that do not need durability.
#[derive(Debug, Default)]
pub struct MemoryStore {
    writer: Mutex<()>,
    committed: RwLock<Committed>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_readings(readings: Vec<Reading>) -> Self {
        Self {
            writer: Mutex::new(()),
            committed: RwLock::new(Committed::new(readings)),
        }
    }
}

impl DatasetStore for MemoryStore {
    fn append(&self, reading: Reading) -> Result<()> {
        let _writer = self.writer.lock().map_err(|_| poisoned())?;

        let (next, _) = self.committed()?.with_reading(reading);
        *self.committed.write().map_err(|_| poisoned())? = next;
        Ok(())
    }

    fn committed(&self) -> Result<Committed> {
        Ok(self.committed.read().map_err(|_| poisoned())?.clone())
    }
}

pub(crate) fn poisoned() -> Error {
    Error::Store("dataset lock poisoned by a panicked writer".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MetricValue;
    use chrono::Utc;

    fn reading(device_id: &str) -> Reading {
        Reading {
            device_id: device_id.to_string(),
            timestamp: Utc::now(),
            firmware_version: "1.0.1".to_string(),
            metrics: [("num_cars".to_string(), MetricValue::Number(3.0))].into(),
        }
    }

    #[test]
    fn test_append_then_snapshot() {
        let store = MemoryStore::new();
        store.append(reading("sensor_1")).unwrap();
        store.append(reading("sensor_2")).unwrap();

        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].device_id, "sensor_1");
        assert_eq!(snapshot[1].device_id, "sensor_2");
        assert_eq!(store.schema().unwrap().columns(), ["num_cars"]);
    }

    #[test]
    fn test_old_snapshot_is_not_affected_by_later_appends() {
        let store = MemoryStore::new();
        store.append(reading("sensor_1")).unwrap();

        let before = store.snapshot().unwrap();
        store.append(reading("sensor_2")).unwrap();

        assert_eq!(before.len(), 1);
        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn test_committed_pairs_readings_with_their_schema() {
        let store = MemoryStore::new();
        store.append(reading("sensor_1")).unwrap();

        let mut widened = reading("sensor_2");
        widened
            .metrics
            .insert("queue_length".to_string(), MetricValue::Number(7.0));
        let before = store.committed().unwrap();
        store.append(widened).unwrap();
        let after = store.committed().unwrap();

        assert_eq!(before.readings.len(), 1);
        assert_eq!(before.schema.columns(), ["num_cars"]);
        assert_eq!(after.readings.len(), 2);
        assert_eq!(after.schema.columns(), ["num_cars", "queue_length"]);
    }
}
