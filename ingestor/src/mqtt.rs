use crate::errors::{Error, Result};
use crate::metrics::MQTT_RECONNECTS_TOTAL;
use crate::session::{Backoff, Session, SessionAction, SessionEvent, SessionState};
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS, TlsConfiguration,
    Transport,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// CA bundle for the broker certificate. Required unless `insecure`.
    pub ca_cert: Option<PathBuf>,
    /// Plain TCP to the broker.
    pub insecure: bool,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub qos: QoS,
    pub data_topic: String,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub request_capacity: usize,
}

pub fn mqtt_options(settings: &MqttSettings) -> Result<MqttOptions> {
    let mut mqtt_options = MqttOptions::new(&settings.client_id, &settings.broker, settings.port);
    mqtt_options.set_keep_alive(settings.keep_alive);
    mqtt_options.set_clean_session(settings.clean_session);
    // Messages are acked by the ingestion worker once persisted.
    mqtt_options.set_manual_acks(true);

    if let Some(username) = &settings.username {
        mqtt_options.set_credentials(username, settings.password.clone().unwrap_or_default());
    }

    let Some(ca_path) = &settings.ca_cert else {
        if !settings.insecure {
            return Err(Error::Tls(
                "no broker CA certificate configured; set MQTT_CA_CERT or pass --mqtt-insecure"
                    .to_string(),
            ));
        }
        warn!(
            "TLS disabled for broker {}:{}, telemetry and commands travel in plaintext",
            settings.broker, settings.port
        );
        return Ok(mqtt_options);
    };

    let ca = read_pem(ca_path)?;
    let client_auth = match (&settings.client_cert, &settings.client_key) {
        (Some(cert), Some(key)) => Some((read_pem(cert)?, read_pem(key)?)),
        (None, None) => None,
        _ => {
            return Err(Error::Tls(
                "client certificate and key must be configured together".to_string(),
            ))
        }
    };
    mqtt_options.set_transport(Transport::Tls(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth,
    }));

    Ok(mqtt_options)
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| Error::Tls(format!("reading {}: {}", path.display(), e)))
}

pub fn connect(settings: &MqttSettings) -> Result<(AsyncClient, EventLoop)> {
    info!(
        "Connecting to MQTT broker at {}:{} as {} (tls: {})",
        settings.broker,
        settings.port,
        settings.client_id,
        settings.ca_cert.is_some()
    );
    let options = mqtt_options(settings)?;
    Ok(AsyncClient::new(options, settings.request_capacity))
}

/// Drives the MQTT event loop, forwarding telemetry publishes to the
/// ingestion worker in receipt order until `cancel` fires. Every session
/// state change is published on `state` for the command dispatcher.
pub async fn run_mqtt(
    client: AsyncClient,
    mut eventloop: EventLoop,
    settings: MqttSettings,
    tx: mpsc::Sender<Publish>,
    state: watch::Sender<SessionState>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut session = Session::new(Backoff::new(
        settings.reconnect_initial,
        settings.reconnect_max,
    ));
    session.handle(SessionEvent::ConnectAttempt);
    state.send_replace(session.state());

    loop {
        let polled = tokio::select! {
            polled = eventloop.poll() => polled,
            _ = cancel.cancelled() => break,
        };

        let (event, publish) = match polled {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => (
                SessionEvent::Connected {
                    session_present: ack.session_present,
                },
                None,
            ),
            Ok(Event::Incoming(Packet::SubAck(_))) => (SessionEvent::SubscribeAcked, None),
            Ok(Event::Incoming(Packet::Publish(publish))) => (SessionEvent::Message, Some(publish)),
            Ok(_) => continue,
            Err(e) => (SessionEvent::ConnectionLost(e.to_string()), None),
        };

        let action = session.handle(event);
        state.send_replace(session.state());

        match action {
            Some(SessionAction::Subscribe) => {
                match client.try_subscribe(settings.data_topic.as_str(), settings.qos) {
                    Ok(()) => info!(
                        "Subscribing to {} with {:?}",
                        settings.data_topic, settings.qos
                    ),
                    Err(e) => error!("Failed to queue subscribe to {}: {}", settings.data_topic, e),
                }
            }
            Some(SessionAction::Deliver) => {
                let Some(publish) = publish else { continue };
                tokio::select! {
                    sent = tx.send(publish) => {
                        if sent.is_err() {
                            error!("Ingestion worker is gone, stopping MQTT loop");
                            return Err(Error::ChannelSend);
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            Some(SessionAction::Backoff(delay)) => {
                MQTT_RECONNECTS_TOTAL.inc();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => break,
                }
                session.handle(SessionEvent::ConnectAttempt);
                state.send_replace(session.state());
            }
            None => {}
        }
    }

    state.send_replace(SessionState::Disconnected);
    disconnect(&client, &mut eventloop).await;
    Ok(())
}

/// Sends DISCONNECT and polls just long enough for it to go out.
async fn disconnect(client: &AsyncClient, eventloop: &mut EventLoop) {
    info!("Disconnecting from MQTT broker");
    if let Err(e) = client.try_disconnect() {
        debug!("Disconnect request not queued: {}", e);
        return;
    }

    let flushed = tokio::time::timeout(DISCONNECT_GRACE, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;

    if flushed.is_err() {
        warn!("MQTT disconnect did not complete within {:?}", DISCONNECT_GRACE);
    }
}

pub fn qos_from_level(level: u8) -> Result<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(Error::Config(format!("invalid MQTT QoS level {}", other))),
    }
}
