use crate::errors::{Error, Result};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub const CHECKSUM_HEADER: &str = "x-checksum-sha256";

/// A firmware image as fetched, before verification.
#[derive(Debug, Clone)]
pub struct Download {
    pub body: Vec<u8>,
    pub checksum: Option<String>,
}

/// Pulls firmware images from the distribution server.
#[derive(Debug, Clone)]
pub struct FirmwareClient {
    http: reqwest::Client,
    base_url: String,
}

impl FirmwareClient {
    pub fn new(base_url: &str, ca_cert: Option<&Path>, timeout: Duration) -> Result<Self> {
        let mut builder = reqwest::Client::builder().use_rustls_tls().timeout(timeout);
        if let Some(path) = ca_cert {
            let pem = std::fs::read(path)?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }

        Ok(Self {
            http: builder.build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn download(&self, firmware: &str) -> Result<Download> {
        let url = format!("{}/{}", self.base_url, firmware);
        info!("Downloading firmware from {}", url);

        let response = self.http.get(&url).send().await?.error_for_status()?;
        let checksum = response
            .headers()
            .get(CHECKSUM_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?.to_vec();

        Ok(Download { body, checksum })
    }
}

/// Checks the image against the checksum the server advertised.
pub fn verify(firmware: &str, download: &Download) -> Result<()> {
    let expected = download
        .checksum
        .as_deref()
        .ok_or_else(|| Error::ChecksumMissing(firmware.to_string()))?;
    let actual = format!("{:x}", Sha256::digest(&download.body));

    if !expected.trim().eq_ignore_ascii_case(&actual) {
        return Err(Error::ChecksumMismatch {
            firmware: firmware.to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}
