use lazy_static::lazy_static;
use prometheus::core::Collector;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tracing::warn;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_messages_total",
        "Total telemetry messages received from MQTT"
    ))
    .unwrap();
    pub static ref MALFORMED_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_malformed_messages_total",
        "Total telemetry messages dropped as malformed"
    ))
    .unwrap();
    pub static ref READINGS_PERSISTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_readings_persisted_total",
        "Total readings appended to the dataset"
    ))
    .unwrap();
    pub static ref PERSIST_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_persist_failures_total",
        "Total failed dataset append attempts"
    ))
    .unwrap();
    pub static ref DROPPED_READINGS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_dropped_readings_total",
        "Readings dropped after exhausting append retries"
    ))
    .unwrap();
    pub static ref PERSIST_DEGRADED: Gauge = Gauge::with_opts(Opts::new(
        "ingestor_persist_degraded",
        "1 while consecutive dataset append failures exceed the alarm threshold"
    ))
    .unwrap();
    pub static ref APPEND_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "ingestor_append_latency_seconds",
            "Time taken to durably append one reading"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref MQTT_RECONNECTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_mqtt_reconnects_total",
        "Total MQTT connection losses followed by a reconnect attempt"
    ))
    .unwrap();
    pub static ref COMMANDS_PUBLISHED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "ingestor_commands_published_total",
            "Commands handed to the transport, by kind and outcome"
        ),
        &["kind", "outcome"]
    )
    .unwrap();
    pub static ref FIRMWARE_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "ingestor_firmware_requests_total",
            "Firmware download requests, by response status"
        ),
        &["status"]
    )
    .unwrap();
}

pub fn init_metrics() {
    let collectors: Vec<Box<dyn Collector>> = vec![
        Box::new(MESSAGES_TOTAL.clone()),
        Box::new(MALFORMED_MESSAGES_TOTAL.clone()),
        Box::new(READINGS_PERSISTED_TOTAL.clone()),
        Box::new(PERSIST_FAILURES_TOTAL.clone()),
        Box::new(DROPPED_READINGS_TOTAL.clone()),
        Box::new(PERSIST_DEGRADED.clone()),
        Box::new(APPEND_LATENCY_SECONDS.clone()),
        Box::new(MQTT_RECONNECTS_TOTAL.clone()),
        Box::new(COMMANDS_PUBLISHED_TOTAL.clone()),
        Box::new(FIRMWARE_REQUESTS_TOTAL.clone()),
    ];

    for collector in collectors {
        if let Err(e) = REGISTRY.register(collector) {
            warn!("Failed to register metric: {}", e);
        }
    }
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
