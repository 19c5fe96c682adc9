use crate::dispatcher::CommandTopics;
use crate::errors::{Error, Result};
use crate::firmware::FirmwareSettings;
use crate::ingest::IngestSettings;
use crate::mqtt::{qos_from_level, MqttSettings};
use clap::Parser;
use std::net::SocketAddr;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;

fn parse_duration(s: &str) -> std::result::Result<Duration, ParseIntError> {
    let millis: u64 = s.parse()?;
    Ok(Duration::from_millis(millis))
}

#[derive(Clone, Debug, Parser)]
#[command(version, about = "Roadside sensor telemetry ingestor and command dispatcher")]
pub struct Cli {
    /// MQTT broker host
    #[arg(env = "MQTT_BROKER", long, default_value = "localhost")]
    pub mqtt_broker: String,

    #[arg(env = "MQTT_PORT", long, default_value_t = 8883)]
    pub mqtt_port: u16,

    /// Stable client id so the broker keeps the session across restarts
    #[arg(env = "MQTT_CLIENT_ID", long, default_value = "roadside-ingestor")]
    pub mqtt_client_id: String,

    #[arg(env = "MQTT_USERNAME", long)]
    pub mqtt_username: Option<String>,

    #[arg(env = "MQTT_PASSWORD", long, hide_env_values = true)]
    pub mqtt_password: Option<String>,

    /// CA certificate the broker's certificate chains to
    #[arg(env = "MQTT_CA_CERT", long, value_name = "path")]
    pub mqtt_ca_cert: Option<PathBuf>,

    /// Connect to the broker over plain TCP. Local development only
    #[arg(env = "MQTT_INSECURE", long)]
    pub mqtt_insecure: bool,

    #[arg(env = "MQTT_CLIENT_CERT", long, value_name = "path", requires = "mqtt_client_key")]
    pub mqtt_client_cert: Option<PathBuf>,

    #[arg(env = "MQTT_CLIENT_KEY", long, value_name = "path", requires = "mqtt_client_cert")]
    pub mqtt_client_key: Option<PathBuf>,

    /// Subscription and command QoS (0, 1 or 2)
    #[arg(env = "MQTT_QOS", long, default_value_t = 1)]
    pub mqtt_qos: u8,

    #[arg(env = "MQTT_CLEAN_SESSION", long, default_value_t = false)]
    pub mqtt_clean_session: bool,

    #[arg(
        env = "MQTT_KEEP_ALIVE_MS",
        long = "mqtt-keep-alive-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "30000"
    )]
    pub mqtt_keep_alive: Duration,

    #[arg(
        env = "MQTT_RECONNECT_INITIAL_MS",
        long = "mqtt-reconnect-initial-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "500"
    )]
    pub mqtt_reconnect_initial: Duration,

    #[arg(
        env = "MQTT_RECONNECT_MAX_MS",
        long = "mqtt-reconnect-max-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "30000"
    )]
    pub mqtt_reconnect_max: Duration,

    #[arg(env = "DATA_TOPIC", long, default_value = "device/data")]
    pub data_topic: String,

    #[arg(env = "BUMP_TOPIC", long, default_value = "device/bump")]
    pub bump_topic: String,

    #[arg(env = "UPGRADE_TOPIC", long, default_value = "device/upgrade")]
    pub upgrade_topic: String,

    /// Parquet file holding every persisted reading
    #[arg(env = "DATASET_PATH", long, default_value = "sensor_readings.parquet")]
    pub dataset_path: PathBuf,

    /// JSON file mapping device ids to locations; Dublin defaults otherwise
    #[arg(env = "DEVICE_LOCATIONS", long, value_name = "path")]
    pub device_locations: Option<PathBuf>,

    /// Messages buffered between the MQTT loop and the ingestion worker
    #[arg(env = "CHANNEL_CAPACITY", long, default_value_t = 1024)]
    pub channel_capacity: usize,

    /// Append attempts per reading before it is dropped
    #[arg(env = "PERSIST_MAX_ATTEMPTS", long, default_value_t = 3)]
    pub persist_max_attempts: u32,

    #[arg(
        env = "PERSIST_BACKOFF_MS",
        long = "persist-backoff-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "100"
    )]
    pub persist_backoff: Duration,

    #[arg(
        env = "PERSIST_BACKOFF_MAX_MS",
        long = "persist-backoff-max-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "2000"
    )]
    pub persist_backoff_max: Duration,

    /// Consecutive failed messages before the service reports degraded
    #[arg(env = "PERSIST_ALARM_THRESHOLD", long, default_value_t = 5)]
    pub persist_alarm_threshold: u32,

    #[arg(
        env = "COMMAND_TIMEOUT_MS",
        long = "command-timeout-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "5000"
    )]
    pub command_timeout: Duration,

    /// Dashboard API listen address
    #[arg(env = "HTTP_ADDR", long, default_value = "0.0.0.0:8080")]
    pub http_addr: SocketAddr,

    #[arg(env = "FIRMWARE_ADDR", long, default_value = "0.0.0.0:8443")]
    pub firmware_addr: SocketAddr,

    /// Directory firmware images are served from
    #[arg(env = "FIRMWARE_DIR", long, default_value = "data")]
    pub firmware_dir: PathBuf,

    #[arg(env = "FIRMWARE_CERT", long, value_name = "path", requires = "firmware_key")]
    pub firmware_cert: Option<PathBuf>,

    #[arg(env = "FIRMWARE_KEY", long, value_name = "path", requires = "firmware_cert")]
    pub firmware_key: Option<PathBuf>,

    /// Require device client certificates signed by this CA
    #[arg(env = "FIRMWARE_CLIENT_CA", long, value_name = "path")]
    pub firmware_client_ca: Option<PathBuf>,

    #[arg(
        env = "SHUTDOWN_GRACE_MS",
        long = "shutdown-grace-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "5000"
    )]
    pub shutdown_grace: Duration,
}

impl Cli {
    pub fn mqtt_settings(&self) -> Result<MqttSettings> {
        if self.mqtt_client_id.is_empty() {
            return Err(Error::Config("MQTT client id must not be empty".to_string()));
        }

        Ok(MqttSettings {
            broker: self.mqtt_broker.clone(),
            port: self.mqtt_port,
            client_id: self.mqtt_client_id.clone(),
            username: self.mqtt_username.clone(),
            password: self.mqtt_password.clone(),
            ca_cert: self.mqtt_ca_cert.clone(),
            insecure: self.mqtt_insecure,
            client_cert: self.mqtt_client_cert.clone(),
            client_key: self.mqtt_client_key.clone(),
            keep_alive: self.mqtt_keep_alive,
            clean_session: self.mqtt_clean_session,
            qos: qos_from_level(self.mqtt_qos)?,
            data_topic: self.data_topic.clone(),
            reconnect_initial: self.mqtt_reconnect_initial,
            reconnect_max: self.mqtt_reconnect_max,
            request_capacity: self.channel_capacity.max(10),
        })
    }

    pub fn ingest_settings(&self) -> IngestSettings {
        IngestSettings {
            max_attempts: self.persist_max_attempts,
            initial_backoff: self.persist_backoff,
            max_backoff: self.persist_backoff_max,
            drain_grace: self.shutdown_grace,
        }
    }

    pub fn command_topics(&self) -> CommandTopics {
        CommandTopics {
            bump: self.bump_topic.clone(),
            upgrade: self.upgrade_topic.clone(),
        }
    }

    /// `None` when no certificate is configured; the firmware server then
    /// stays off.
    pub fn firmware_settings(&self) -> Option<FirmwareSettings> {
        let (cert, key) = match (&self.firmware_cert, &self.firmware_key) {
            (Some(cert), Some(key)) => (cert.clone(), key.clone()),
            _ => return None,
        };

        Some(FirmwareSettings {
            addr: self.firmware_addr,
            root: self.firmware_dir.clone(),
            cert,
            key,
            client_ca: self.firmware_client_ca.clone(),
            shutdown_grace: self.shutdown_grace,
        })
    }
}
