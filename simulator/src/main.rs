mod device;
mod errors;
mod ota;
mod telemetry;

use clap::Parser;
use device::{BumpState, Device};
use errors::Result;
use ota::{Download, FirmwareClient};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, Publish, QoS, TlsConfiguration, Transport};
use std::num::ParseIntError;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use telemetry::generate_telemetry;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

fn parse_duration(s: &str) -> std::result::Result<Duration, ParseIntError> {
    let millis: u64 = s.parse()?;
    Ok(Duration::from_millis(millis))
}

#[derive(Clone, Debug, Parser)]
#[command(version, about = "Simulated roadside sensors")]
struct Cli {
    #[arg(env = "MQTT_BROKER", long, default_value = "localhost")]
    mqtt_broker: String,

    #[arg(env = "MQTT_PORT", long, default_value_t = 1883)]
    mqtt_port: u16,

    #[arg(env = "MQTT_USERNAME", long)]
    mqtt_username: Option<String>,

    #[arg(env = "MQTT_PASSWORD", long, hide_env_values = true)]
    mqtt_password: Option<String>,

    /// CA certificate for the broker; enables TLS
    #[arg(env = "MQTT_CA_CERT", long, value_name = "path")]
    mqtt_ca_cert: Option<PathBuf>,

    /// Number of simulated devices
    #[arg(env = "DEVICES", long, default_value_t = 8)]
    devices: u32,

    /// Index of the first device; devices are named sensor_<index>
    #[arg(env = "FIRST_DEVICE", long, default_value_t = 2)]
    first_device: u32,

    #[arg(
        env = "PUBLISH_INTERVAL_MS",
        long = "publish-interval-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "5000"
    )]
    publish_interval: Duration,

    /// Firmware version devices report until they install an upgrade
    #[arg(env = "FIRMWARE_VERSION", long, default_value = "1.0.1")]
    firmware_version: String,

    #[arg(env = "FIRMWARE_URL", long, default_value = "https://localhost:8443")]
    firmware_url: String,

    /// CA certificate the firmware server's certificate chains to
    #[arg(env = "FIRMWARE_CA_CERT", long, value_name = "path")]
    firmware_ca_cert: Option<PathBuf>,

    #[arg(
        env = "DOWNLOAD_TIMEOUT_MS",
        long = "download-timeout-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "30000"
    )]
    download_timeout: Duration,

    #[arg(env = "DATA_TOPIC", long, default_value = "device/data")]
    data_topic: String,

    #[arg(env = "BUMP_TOPIC", long, default_value = "device/bump")]
    bump_topic: String,

    #[arg(env = "UPGRADE_TOPIC", long, default_value = "device/upgrade")]
    upgrade_topic: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Arc::new(Cli::parse());

    info!("Starting roadside sensor simulator");
    info!(
        "Broker: {}:{}, Devices: sensor_{}..sensor_{}, Interval: {:?}",
        cli.mqtt_broker,
        cli.mqtt_port,
        cli.first_device,
        cli.first_device + cli.devices.saturating_sub(1),
        cli.publish_interval
    );

    let firmware = match FirmwareClient::new(
        &cli.firmware_url,
        cli.firmware_ca_cert.as_deref(),
        cli.download_timeout,
    ) {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to build firmware client: {}", e);
            std::process::exit(1);
        }
    };

    let broker_ca = match cli.mqtt_ca_cert.as_ref().map(std::fs::read).transpose() {
        Ok(ca) => ca,
        Err(e) => {
            error!("Failed to read broker CA certificate: {}", e);
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    let handles: Vec<_> = (cli.first_device..cli.first_device + cli.devices)
        .map(|index| {
            tokio::spawn(run_device(
                cli.clone(),
                index,
                broker_ca.clone(),
                firmware.clone(),
                cancel.clone(),
            ))
        })
        .collect();

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {}", e);
    }
    info!("Received shutdown signal");
    cancel.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            error!("Device task panicked: {}", e);
        }
    }
}

fn mqtt_options(cli: &Cli, device: &Device, broker_ca: Option<Vec<u8>>) -> MqttOptions {
    let client_id = format!("sim-{}-{}", device.id(), rand::random::<u32>());
    let mut options = MqttOptions::new(client_id, &cli.mqtt_broker, cli.mqtt_port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_clean_session(true);

    if let Some(username) = &cli.mqtt_username {
        options.set_credentials(username, cli.mqtt_password.clone().unwrap_or_default());
    }
    if let Some(ca) = broker_ca {
        options.set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth: None,
        }));
    }
    options
}

/// One simulated unit: publishes telemetry every interval and reacts to bump
/// and upgrade commands until cancelled.
async fn run_device(
    cli: Arc<Cli>,
    index: u32,
    broker_ca: Option<Vec<u8>>,
    firmware: FirmwareClient,
    cancel: CancellationToken,
) {
    let mut device = Device::new(format!("sensor_{}", index), cli.firmware_version.clone());
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(&cli, &device, broker_ca), 100);
    let mut ticker = tokio::time::interval(cli.publish_interval);
    let mut rng = StdRng::from_entropy();
    let mut pending: Option<JoinHandle<Result<Download>>> = None;
    let mut published = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let telemetry = generate_telemetry(
                    &mut rng,
                    device.id(),
                    device.version(),
                    device.bump() == BumpState::Deployed,
                );
                let payload = match serde_json::to_string(&telemetry) {
                    Ok(p) => p,
                    Err(e) => {
                        error!("Failed to serialize telemetry: {}", e);
                        continue;
                    }
                };
                // try_publish: this task also drives the event loop.
                match client.try_publish(&cli.data_topic, QoS::AtLeastOnce, false, payload) {
                    Ok(()) => {
                        published += 1;
                        debug!("{} published reading #{}", device.id(), published);
                    }
                    Err(e) => warn!("{} failed to publish: {}", device.id(), e),
                }
            }
            polled = eventloop.poll() => match polled {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("{} connected", device.id());
                    for topic in [&cli.bump_topic, &cli.upgrade_topic] {
                        if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                            error!("{} failed to subscribe to {}: {}", device.id(), topic, e);
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if let Some(download) = handle_command(&cli, &mut device, &firmware, &publish) {
                        pending = Some(download);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("{} MQTT error: {}", device.id(), e);
                    // rumqttc reconnects on the next poll.
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            },
            finished = async {
                match pending.as_mut() {
                    Some(handle) => handle.await,
                    None => std::future::pending().await,
                }
            }, if pending.is_some() => {
                pending = None;
                let download = finished.unwrap_or_else(|e| Err(e.into()));
                if let Err(e) = device.finish_download(download) {
                    debug!("{} back to idle after failed upgrade: {}", device.id(), e);
                }
            }
        }
    }

    if let Some(handle) = pending {
        handle.abort();
    }
    info!("{} stopping after {} readings", device.id(), published);
    if let Err(e) = client.try_disconnect() {
        debug!("{} disconnect not queued: {}", device.id(), e);
    }
}

/// Applies a command. Returns the download task when an upgrade started.
fn handle_command(
    cli: &Cli,
    device: &mut Device,
    firmware: &FirmwareClient,
    publish: &Publish,
) -> Option<JoinHandle<Result<Download>>> {
    if publish.topic == cli.bump_topic {
        match BumpState::parse(&publish.payload) {
            Ok(target) => {
                device.apply_bump(target);
            }
            Err(e) => warn!("{} ignoring command: {}", device.id(), e),
        }
        return None;
    }

    if publish.topic == cli.upgrade_topic {
        let name = String::from_utf8_lossy(&publish.payload).trim().to_string();
        if let Err(e) = device.begin_upgrade(&name) {
            warn!("{}: {}", device.id(), e);
            return None;
        }
        let firmware = firmware.clone();
        return Some(tokio::spawn(async move { firmware.download(&name).await }));
    }

    debug!("{} ignoring message on {}", device.id(), publish.topic);
    None
}
