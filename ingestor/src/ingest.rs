use crate::errors::{Error, Result};
use crate::health::PersistenceHealth;
use crate::metrics::{
    APPEND_LATENCY_SECONDS, DROPPED_READINGS_TOTAL, MALFORMED_MESSAGES_TOTAL, MESSAGES_TOTAL,
    PERSIST_FAILURES_TOTAL, READINGS_PERSISTED_TOTAL,
};
use crate::model::{Reading, TelemetryMessage};
use crate::store::DatasetStore;
use crate::validate::validate;
use chrono::{DateTime, TimeZone, Utc};
use rumqttc::{AsyncClient, Publish};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct IngestSettings {
    /// Append attempts per message before the reading is dropped.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// How long buffered messages are still handled after cancellation.
    pub drain_grace: Duration,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(2000),
            drain_grace: Duration::from_secs(5),
        }
    }
}

/// Server-side clock for reading timestamps.
///
/// Never goes backwards within a process lifetime, even if the wall clock
/// does, and truncates to the microsecond precision the dataset stores.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: Option<DateTime<Utc>>,
}

impl MonotonicClock {
    pub fn starting_after(last: Option<DateTime<Utc>>) -> Self {
        Self { last }
    }

    pub fn now(&mut self) -> DateTime<Utc> {
        let wall = Utc::now();
        let wall = Utc
            .timestamp_micros(wall.timestamp_micros())
            .single()
            .unwrap_or(wall);

        let now = match self.last {
            Some(last) if last > wall => last,
            _ => wall,
        };
        self.last = Some(now);
        now
    }
}

/// Decodes a telemetry payload. Anything that is not a `{device, version,
/// data}` object is malformed.
pub fn decode(payload: &[u8]) -> Result<TelemetryMessage> {
    serde_json::from_slice::<TelemetryMessage>(payload)
        .map_err(|e| Error::Malformed(format!("JSON parse error: {}", e)))
}

/// The single consumer of the telemetry subscription.
pub struct IngestWorker {
    store: Arc<dyn DatasetStore>,
    health: Arc<PersistenceHealth>,
    settings: IngestSettings,
    clock: MonotonicClock,
    acker: Option<AsyncClient>,
}

impl IngestWorker {
    pub fn new(
        store: Arc<dyn DatasetStore>,
        health: Arc<PersistenceHealth>,
        settings: IngestSettings,
    ) -> Result<Self> {
        let newest = store.snapshot()?.iter().map(|r| r.timestamp).max();
        Ok(Self {
            store,
            health,
            settings,
            clock: MonotonicClock::starting_after(newest),
            acker: None,
        })
    }

    /// Acknowledge QoS>0 messages on this client once they are handled.
    pub fn with_acker(mut self, client: AsyncClient) -> Self {
        self.acker = Some(client);
        self
    }

    /// Drains deliveries in order until the channel closes. On cancellation
    /// the channel is closed and already-buffered messages are still handled
    /// for up to `drain_grace`; whatever is left stays unacknowledged and is
    /// redelivered by the broker.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Publish>, cancel: CancellationToken) {
        info!(
            "Starting ingestion worker with max_attempts={}",
            self.settings.max_attempts
        );

        let grace = self.settings.drain_grace;
        let drain_expired = async {
            cancel.cancelled().await;
            tokio::time::sleep(grace).await;
        };
        tokio::pin!(drain_expired);

        let mut closing = false;
        loop {
            let next = tokio::select! {
                publish = rx.recv() => publish,
                _ = cancel.cancelled(), if !closing => {
                    info!("Shutdown requested, draining buffered messages for up to {:?}", grace);
                    rx.close();
                    closing = true;
                    continue;
                }
                _ = &mut drain_expired => {
                    warn!("Drain grace elapsed with {} messages still buffered", rx.len());
                    break;
                }
            };

            let Some(publish) = next else { break };
            tokio::select! {
                _ = self.handle(publish) => {}
                _ = &mut drain_expired => {
                    warn!(
                        "Drain grace elapsed during an append, {} more messages still buffered",
                        rx.len()
                    );
                    break;
                }
            }
        }

        info!("Ingestion worker stopped");
    }

    async fn handle(&mut self, publish: Publish) {
        MESSAGES_TOTAL.inc();
        debug!(
            "Received message on topic {}, size: {} bytes",
            publish.topic,
            publish.payload.len()
        );

        match self.ingest(&publish.payload).await {
            Ok(reading) => debug!("Persisted reading from {}", reading.device_id),
            Err(e) if e.is_persistence() => {
                error!("Dropping reading after failed append retries: {}", e)
            }
            Err(e) => warn!("Dropping message on {}: {}", publish.topic, e),
        }

        // Handled either way; acking a dropped message keeps the broker from
        // redelivering it forever.
        if let Some(client) = &self.acker {
            if let Err(e) = client.ack(&publish).await {
                warn!("Failed to acknowledge message: {}", e);
            }
        }
    }

    /// Decodes, validates and durably appends one telemetry payload.
    pub async fn ingest(&mut self, payload: &[u8]) -> Result<Reading> {
        let message = decode(payload).inspect_err(|_| MALFORMED_MESSAGES_TOTAL.inc())?;
        let reading = Reading::from_message(message, self.clock.now());
        validate(&reading).inspect_err(|_| MALFORMED_MESSAGES_TOTAL.inc())?;

        self.append_with_retry(reading).await
    }

    async fn append_with_retry(&self, reading: Reading) -> Result<Reading> {
        let mut attempt = 0;
        let mut backoff = self.settings.initial_backoff;

        loop {
            attempt += 1;
            let start = Instant::now();
            let store = Arc::clone(&self.store);
            let candidate = reading.clone();

            let result = tokio::task::spawn_blocking(move || store.append(candidate))
                .await
                .map_err(|e| Error::Store(format!("append task failed: {}", e)))
                .and_then(|appended| appended);

            match result {
                Ok(()) => {
                    APPEND_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
                    READINGS_PERSISTED_TOTAL.inc();
                    self.health.record_success();
                    if attempt > 1 {
                        info!("Reading appended successfully on attempt {}", attempt);
                    }
                    return Ok(reading);
                }
                Err(e) => {
                    PERSIST_FAILURES_TOTAL.inc();
                    if attempt >= self.settings.max_attempts || !e.is_persistence() {
                        DROPPED_READINGS_TOTAL.inc();
                        self.health.record_failure();
                        return Err(e);
                    }

                    warn!(
                        "Dataset append failed (attempt {}/{}): {}. Retrying in {}ms...",
                        attempt,
                        self.settings.max_attempts,
                        e,
                        backoff.as_millis()
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.settings.max_backoff);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MetricValue;
    use crate::store::{Committed, MemoryStore};
    use rumqttc::QoS;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SENSOR_3: &[u8] = br#"{"device":"sensor_3","version":"1.0.1","data":{"avg_speed":"42.1","max_speed":"130.5","min_speed":"3.2","num_cars":"3","sensor_1_up":"1","sensor_2_up":"1"}}"#;

    fn worker(store: Arc<dyn DatasetStore>, threshold: u32) -> IngestWorker {
        let settings = IngestSettings {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            drain_grace: Duration::from_secs(5),
        };
        IngestWorker::new(store, Arc::new(PersistenceHealth::new(threshold)), settings).unwrap()
    }

    /// Store whose appends always fail, counting the attempts.
    #[derive(Default)]
    struct FailingStore {
        attempts: AtomicUsize,
    }

    impl DatasetStore for FailingStore {
        fn append(&self, _reading: Reading) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )))
        }

        fn committed(&self) -> Result<Committed> {
            Ok(Committed::default())
        }
    }

    #[test]
    fn test_ingest_sensor_3_scenario() {
        tokio_test::block_on(async {
            let store = Arc::new(MemoryStore::new());
            let mut worker = worker(store.clone(), 5);

            worker.ingest(SENSOR_3).await.unwrap();

            let snapshot = store.snapshot().unwrap();
            assert_eq!(snapshot.len(), 1);
            assert_eq!(snapshot[0].device_id, "sensor_3");
            assert_eq!(snapshot[0].firmware_version, "1.0.1");
            assert_eq!(snapshot[0].metric("avg_speed"), Some(&MetricValue::Number(42.1)));
            assert_eq!(snapshot[0].metric("num_cars").and_then(MetricValue::as_f64), Some(3.0));
        });
    }

    #[test]
    fn test_timestamps_are_non_decreasing() {
        tokio_test::block_on(async {
            let store = Arc::new(MemoryStore::new());
            let mut worker = worker(store.clone(), 5);

            for _ in 0..20 {
                worker.ingest(SENSOR_3).await.unwrap();
            }

            let snapshot = store.snapshot().unwrap();
            assert!(snapshot
                .windows(2)
                .all(|pair| pair[0].timestamp <= pair[1].timestamp));
        });
    }

    #[test]
    fn test_clock_never_goes_back_behind_seed() {
        let future = Utc::now() + chrono::Duration::hours(1);
        let mut clock = MonotonicClock::starting_after(Some(future));

        assert_eq!(clock.now(), future);
        assert!(clock.now() >= future);
    }

    #[test]
    fn test_malformed_payloads_are_rejected() {
        tokio_test::block_on(async {
            let store = Arc::new(MemoryStore::new());
            let mut worker = worker(store.clone(), 5);

            assert!(worker.ingest(b"invalid json").await.is_err());
            assert!(worker
                .ingest(br#"{"device":"sensor_1","version":"1.0.1"}"#)
                .await
                .is_err());
            assert!(worker.ingest(br#"{"version":"1.0.1","data":{}}"#).await.is_err());
            assert!(worker
                .ingest(br#"{"device":"sensor_1","data":"not a map"}"#)
                .await
                .is_err());

            assert_eq!(store.len().unwrap(), 0);
        });
    }

    #[tokio::test]
    async fn test_run_keeps_draining_after_malformed_messages() {
        let store = Arc::new(MemoryStore::new());
        let worker = worker(store.clone(), 5);
        let (tx, rx) = mpsc::channel(8);

        tx.send(Publish::new("device/data", QoS::AtLeastOnce, b"{not json".to_vec()))
            .await
            .unwrap();
        tx.send(Publish::new("device/data", QoS::AtLeastOnce, SENSOR_3.to_vec()))
            .await
            .unwrap();
        drop(tx);

        worker.run(rx, CancellationToken::new()).await;

        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].device_id, "sensor_3");
    }

    #[tokio::test]
    async fn test_cancelled_worker_drains_buffered_messages() {
        let store = Arc::new(MemoryStore::new());
        let worker = worker(store.clone(), 5);
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        for _ in 0..3 {
            tx.send(Publish::new("device/data", QoS::AtLeastOnce, SENSOR_3.to_vec()))
                .await
                .unwrap();
        }
        cancel.cancel();

        worker.run(rx, cancel).await;

        assert_eq!(store.len().unwrap(), 3);
    }

    /// Store whose appends take a fixed time, as a slow disk would.
    struct SlowStore {
        inner: MemoryStore,
        delay: Duration,
    }

    impl DatasetStore for SlowStore {
        fn append(&self, reading: Reading) -> Result<()> {
            std::thread::sleep(self.delay);
            self.inner.append(reading)
        }

        fn committed(&self) -> Result<Committed> {
            self.inner.committed()
        }
    }

    #[tokio::test]
    async fn test_drain_after_cancel_is_bounded_by_grace() {
        let store = Arc::new(SlowStore {
            inner: MemoryStore::new(),
            delay: Duration::from_millis(100),
        });
        let settings = IngestSettings {
            drain_grace: Duration::from_millis(150),
            ..IngestSettings::default()
        };
        let worker =
            IngestWorker::new(store.clone(), Arc::new(PersistenceHealth::new(5)), settings).unwrap();
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        for _ in 0..10 {
            tx.send(Publish::new("device/data", QoS::AtLeastOnce, SENSOR_3.to_vec()))
                .await
                .unwrap();
        }
        cancel.cancel();

        let start = Instant::now();
        worker.run(rx, cancel).await;

        // Draining all ten would take a full second.
        assert!(start.elapsed() < Duration::from_millis(600));
        assert!(store.len().unwrap() < 10);
    }

    #[tokio::test]
    async fn test_persistent_write_failures_trip_alarm_without_stopping() {
        let store = Arc::new(FailingStore::default());
        let health = Arc::new(PersistenceHealth::new(2));
        let settings = IngestSettings {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
            ..IngestSettings::default()
        };
        let mut worker = IngestWorker::new(store.clone(), health.clone(), settings).unwrap();

        assert!(worker.ingest(SENSOR_3).await.is_err());
        assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
        assert!(!health.is_degraded());

        assert!(worker.ingest(SENSOR_3).await.is_err());
        assert!(health.is_degraded());
        assert_eq!(store.attempts.load(Ordering::SeqCst), 6);
    }
}
