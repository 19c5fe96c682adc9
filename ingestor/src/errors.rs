use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("MQTT broker unavailable (session {0})")]
    BrokerUnavailable(String),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Dataset store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid artifact path: {0}")]
    InvalidPath(String),

    #[error("Publish to {topic} timed out after {timeout_ms}ms")]
    PublishTimeout { topic: String, timeout_ms: u64 },

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel send error")]
    ChannelSend,
}

impl Error {
    /// Errors raised while writing the dataset. These are worth retrying.
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Parquet(_) | Error::Arrow(_) | Error::Store(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
