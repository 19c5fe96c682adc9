use crate::errors::{Error, Result};
use crate::firmware::validate_artifact_name;
use crate::metrics::COMMANDS_PUBLISHED_TOTAL;
use crate::session::SessionState;
use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Operator command for the sensor fleet.
///
/// DEPLOY and RETRACT name the desired bump state rather than toggling it, so
/// a duplicated or repeated command leaves devices where a single one would.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Deploy,
    Retract,
    Upgrade { firmware: String },
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Deploy => "deploy",
            Command::Retract => "retract",
            Command::Upgrade { .. } => "upgrade",
        }
    }

    pub fn payload(&self) -> &str {
        match self {
            Command::Deploy => "deploy",
            Command::Retract => "retract",
            Command::Upgrade { firmware } => firmware,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Upgrade { firmware } => write!(f, "upgrade({})", firmware),
            other => f.write_str(other.kind()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandTopics {
    pub bump: String,
    pub upgrade: String,
}

impl Default for CommandTopics {
    fn default() -> Self {
        Self {
            bump: "device/bump".to_string(),
            upgrade: "device/upgrade".to_string(),
        }
    }
}

/// Transport seam for outbound commands.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<()>;
}

/// Publishes on the shared MQTT client.
///
/// `AsyncClient::publish` only queues the request for the event loop, so
/// while the session is down a command would sit in the queue and go out
/// whenever the broker comes back. Those are refused instead.
#[derive(Debug, Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
    session: watch::Receiver<SessionState>,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient, session: watch::Receiver<SessionState>) -> Self {
        Self { client, session }
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<()> {
        let state = *self.session.borrow();
        if !state.is_connected() {
            return Err(Error::BrokerUnavailable(state.to_string()));
        }
        self.client.publish(topic, qos, false, payload).await?;
        Ok(())
    }
}

#[async_trait]
impl<P: Publisher + ?Sized> Publisher for Arc<P> {
    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<()> {
        (**self).publish(topic, qos, payload).await
    }
}

/// Stateless fire-and-forget command publisher.
#[derive(Debug, Clone)]
pub struct CommandDispatcher<P> {
    publisher: P,
    topics: CommandTopics,
    qos: QoS,
    timeout: Duration,
}

impl<P: Publisher> CommandDispatcher<P> {
    pub fn new(publisher: P, topics: CommandTopics, qos: QoS, timeout: Duration) -> Self {
        Self {
            publisher,
            topics,
            qos,
            timeout,
        }
    }

    pub fn topic_for(&self, command: &Command) -> &str {
        match command {
            Command::Deploy | Command::Retract => &self.topics.bump,
            Command::Upgrade { .. } => &self.topics.upgrade,
        }
    }

    /// Publishes one command. Returns once the transport accepted it or
    /// fails with `PublishTimeout` when it does not within the timeout.
    pub async fn send_command(&self, command: &Command) -> Result<()> {
        if let Command::Upgrade { firmware } = command {
            validate_artifact_name(firmware)?;
        }

        let topic = self.topic_for(command);
        let payload = command.payload().as_bytes().to_vec();

        let outcome = match tokio::time::timeout(
            self.timeout,
            self.publisher.publish(topic, self.qos, payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::PublishTimeout {
                topic: topic.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        };

        match &outcome {
            Ok(()) => {
                COMMANDS_PUBLISHED_TOTAL
                    .with_label_values(&[command.kind(), "ok"])
                    .inc();
                info!("Published command {} to {}", command, topic);
            }
            Err(e) => {
                COMMANDS_PUBLISHED_TOTAL
                    .with_label_values(&[command.kind(), "error"])
                    .inc();
                warn!("Failed to publish command {} to {}: {}", command, topic, e);
            }
        }
        outcome
    }

    pub async fn deploy(&self) -> Result<()> {
        self.send_command(&Command::Deploy).await
    }

    pub async fn retract(&self) -> Result<()> {
        self.send_command(&Command::Retract).await
    }

    pub async fn upgrade(&self, firmware: impl Into<String>) -> Result<()> {
        self.send_command(&Command::Upgrade {
            firmware: firmware.into(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::MqttOptions;
    use std::sync::Mutex;

    #[derive(Default, Clone)]
    struct RecordingPublisher {
        sent: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(&self, topic: &str, _qos: QoS, payload: Vec<u8>) -> Result<()> {
            self.sent.lock().unwrap().push((topic.to_string(), payload));
            Ok(())
        }
    }

    struct StalledPublisher;

    #[async_trait]
    impl Publisher for StalledPublisher {
        async fn publish(&self, _topic: &str, _qos: QoS, _payload: Vec<u8>) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn dispatcher<P: Publisher>(publisher: P) -> CommandDispatcher<P> {
        CommandDispatcher::new(
            publisher,
            CommandTopics::default(),
            QoS::AtLeastOnce,
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn test_commands_map_to_fixed_topics_and_payloads() {
        let publisher = RecordingPublisher::default();
        let dispatcher = dispatcher(publisher.clone());

        dispatcher.deploy().await.unwrap();
        dispatcher.retract().await.unwrap();
        dispatcher.upgrade("speed_sensor_v2.bin").await.unwrap();

        let sent = publisher.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![
                ("device/bump".to_string(), b"deploy".to_vec()),
                ("device/bump".to_string(), b"retract".to_vec()),
                ("device/upgrade".to_string(), b"speed_sensor_v2.bin".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn test_repeated_deploy_is_the_same_state_set() {
        let publisher = RecordingPublisher::default();
        let dispatcher = dispatcher(publisher.clone());

        dispatcher.deploy().await.unwrap();
        dispatcher.deploy().await.unwrap();

        let sent = publisher.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], sent[1]);
    }

    #[tokio::test]
    async fn test_upgrade_rejects_path_like_filenames() {
        let publisher = RecordingPublisher::default();
        let dispatcher = dispatcher(publisher.clone());

        assert!(matches!(
            dispatcher.upgrade("../secrets.bin").await,
            Err(Error::InvalidPath(_))
        ));
        assert!(dispatcher.upgrade("").await.is_err());
        assert!(publisher.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stalled_publish_times_out() {
        let dispatcher = dispatcher(StalledPublisher);

        let result = dispatcher.deploy().await;

        assert!(matches!(result, Err(Error::PublishTimeout { .. })));
    }

    /// The event loop is kept alive but never polled, so nothing ever
    /// reaches a broker.
    fn unreachable_client() -> (AsyncClient, rumqttc::EventLoop) {
        AsyncClient::new(MqttOptions::new("dispatcher-test", "127.0.0.1", 1), 10)
    }

    #[tokio::test]
    async fn test_commands_fail_fast_while_broker_is_down() {
        for state in [SessionState::Disconnected, SessionState::Connecting] {
            let (client, _eventloop) = unreachable_client();
            let (_tx, rx) = watch::channel(state);
            let dispatcher = dispatcher(MqttPublisher::new(client, rx));

            assert!(matches!(
                dispatcher.deploy().await,
                Err(Error::BrokerUnavailable(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_commands_publish_once_subscribed() {
        let (client, _eventloop) = unreachable_client();
        let (tx, rx) = watch::channel(SessionState::Disconnected);
        let dispatcher = dispatcher(MqttPublisher::new(client, rx));
        assert!(dispatcher.retract().await.is_err());

        tx.send_replace(SessionState::Subscribed);

        assert!(dispatcher.retract().await.is_ok());
    }
}
