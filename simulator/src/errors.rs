use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Download task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Unknown bump command: {0}")]
    UnknownCommand(String),

    #[error("Upgrade to {requested} refused, already updating to {current}")]
    Busy { requested: String, current: String },

    #[error("Firmware {0} was served without a checksum")]
    ChecksumMissing(String),

    #[error("Firmware {firmware} checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        firmware: String,
        expected: String,
        actual: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
