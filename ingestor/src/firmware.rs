//! Firmware distribution server.
//!
//! Devices that receive an upgrade command fetch `GET /{filename}` from this
//! server over TLS. Artifacts are read-only files under a configured root;
//! any request path that is not a plain relative path inside that root is
//! rejected before the filesystem is touched.

use crate::errors::{Error, Result};
use crate::metrics::FIRMWARE_REQUESTS_TOTAL;
use axum::{
    extract::{Path as UrlPath, State},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use sha2::{Digest, Sha256};
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const CHECKSUM_HEADER: &str = "x-checksum-sha256";
const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Clone)]
pub struct FirmwareSettings {
    pub addr: SocketAddr,
    pub root: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
    /// CA that client certificates must chain to. Enables mutual TLS.
    pub client_ca: Option<PathBuf>,
    pub shutdown_grace: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("invalid artifact path: {0}")]
    InvalidPath(String),

    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IntoResponse for ArtifactError {
    fn into_response(self) -> Response {
        let status = match &self {
            ArtifactError::InvalidPath(_) => StatusCode::BAD_REQUEST,
            ArtifactError::NotFound(_) => StatusCode::NOT_FOUND,
            ArtifactError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        FIRMWARE_REQUESTS_TOTAL
            .with_label_values(&[status.as_str()])
            .inc();
        warn!("Firmware request failed ({}): {}", status, self);
        (status, self.to_string()).into_response()
    }
}

/// Checks a bare artifact filename as carried by an upgrade command.
pub fn validate_artifact_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name.len() > MAX_NAME_LEN
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.chars().any(char::is_control);

    if invalid {
        return Err(Error::InvalidPath(format!("'{}' is not a firmware filename", name)));
    }
    Ok(())
}

/// Maps a request path onto a file inside `root`.
pub fn resolve_artifact(root: &Path, requested: &str) -> std::result::Result<PathBuf, ArtifactError> {
    if requested.is_empty() || requested.contains('\\') || requested.chars().any(char::is_control) {
        return Err(ArtifactError::InvalidPath(requested.to_string()));
    }

    let relative = Path::new(requested);
    if !relative
        .components()
        .all(|component| matches!(component, Component::Normal(_)))
    {
        return Err(ArtifactError::InvalidPath(requested.to_string()));
    }

    let root = root.canonicalize()?;
    let resolved = match root.join(relative).canonicalize() {
        Ok(path) => path,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ArtifactError::NotFound(requested.to_string()))
        }
        Err(e) => return Err(ArtifactError::Io(e)),
    };

    // A symlink inside the root may still point outside of it.
    if !resolved.starts_with(&root) {
        return Err(ArtifactError::InvalidPath(requested.to_string()));
    }
    if !resolved.is_file() {
        return Err(ArtifactError::NotFound(requested.to_string()));
    }
    Ok(resolved)
}

#[derive(Debug, Clone)]
struct FirmwareState {
    root: Arc<PathBuf>,
}

pub fn router(root: PathBuf) -> Router {
    let state = FirmwareState {
        root: Arc::new(root),
    };

    Router::new()
        .route("/*path", get(serve_artifact))
        .with_state(state)
}

async fn serve_artifact(
    State(state): State<FirmwareState>,
    UrlPath(requested): UrlPath<String>,
) -> std::result::Result<Response, ArtifactError> {
    let path = resolve_artifact(&state.root, &requested)?;
    let body = tokio::fs::read(&path).await?;
    let checksum = format!("{:x}", Sha256::digest(&body));

    FIRMWARE_REQUESTS_TOTAL.with_label_values(&["200"]).inc();
    info!("Serving firmware {} ({} bytes)", requested, body.len());

    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (HeaderName::from_static(CHECKSUM_HEADER), checksum),
        ],
        body,
    )
        .into_response())
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::Tls(format!("reading {}: {}", path.display(), e)))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("invalid certificate in {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("no certificate found in {}", path.display())));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::Tls(format!("reading {}: {}", path.display(), e)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| Error::Tls(format!("invalid private key in {}: {}", path.display(), e)))?
        .ok_or_else(|| Error::Tls(format!("no private key found in {}", path.display())))
}

pub fn tls_config(settings: &FirmwareSettings) -> Result<RustlsConfig> {
    let certs = load_certs(&settings.cert)?;
    let key = load_private_key(&settings.key)?;
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let tls = |e: rustls::Error| Error::Tls(e.to_string());

    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(tls)?;

    let mut config = match &settings.client_ca {
        Some(ca_path) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca_path)? {
                roots.add(cert).map_err(tls)?;
            }
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .build()
                .map_err(|e| Error::Tls(e.to_string()))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
                .map_err(tls)?
        }
        None => builder
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(tls)?,
    };
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(RustlsConfig::from_config(Arc::new(config)))
}

/// Serves the artifact root over TLS until `cancel` fires. Each connection
/// runs on its own task.
pub async fn run(settings: FirmwareSettings, cancel: CancellationToken) -> Result<()> {
    if !settings.root.is_dir() {
        return Err(Error::Config(format!(
            "firmware root {} is not a directory",
            settings.root.display()
        )));
    }
    let tls = tls_config(&settings)?;
    let app = router(settings.root.clone());

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    let grace = settings.shutdown_grace;
    tokio::spawn(async move {
        cancel.cancelled().await;
        shutdown_handle.graceful_shutdown(Some(grace));
    });

    info!(
        "Firmware server listening on https://{} (root: {}, mutual TLS: {})",
        settings.addr,
        settings.root.display(),
        settings.client_ca.is_some()
    );

    axum_server::bind_rustls(settings.addr, tls)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;

    info!("Firmware server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    const FIRMWARE: &[u8] = b"\x7fESP-IMAGE speed_sensor 1.0.2";

    fn artifact_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("data")).unwrap();
        std::fs::write(dir.path().join("data/speed_sensor_v2.bin"), FIRMWARE).unwrap();
        std::fs::write(dir.path().join("secret.txt"), b"outside the root").unwrap();
        dir
    }

    async fn get(root: &Path, uri: &str) -> Response {
        router(root.to_path_buf())
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_serves_known_artifact_with_checksum() {
        let dir = artifact_root();
        let root = dir.path().join("data");

        let response = get(&root, "/speed_sensor_v2.bin").await;

        assert_eq!(response.status(), StatusCode::OK);
        let expected = format!("{:x}", Sha256::digest(FIRMWARE));
        assert_eq!(response.headers()[CHECKSUM_HEADER], expected.as_str());
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], FIRMWARE);
    }

    #[tokio::test]
    async fn test_unknown_artifact_is_not_found() {
        let dir = artifact_root();

        let response = get(&dir.path().join("data"), "/speed_sensor_v9.bin").await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_traversal_never_returns_file_contents() {
        let dir = artifact_root();
        let root = dir.path().join("data");

        for uri in [
            "/../secret.txt",
            "/../../etc/passwd",
            "/%2e%2e/secret.txt",
            "/..%2fsecret.txt",
            "/%2Fetc%2Fpasswd",
        ] {
            let response = get(&root, uri).await;
            assert!(
                response.status().is_client_error(),
                "{} returned {}",
                uri,
                response.status()
            );
            let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            assert!(!body.starts_with(b"outside the root"));
            assert!(!body.starts_with(b"root:"));
        }
    }

    #[test]
    fn test_resolve_rejects_non_normal_components() {
        let dir = artifact_root();
        let root = dir.path().join("data");

        assert!(matches!(
            resolve_artifact(&root, "../secret.txt"),
            Err(ArtifactError::InvalidPath(_))
        ));
        assert!(matches!(
            resolve_artifact(&root, "/etc/passwd"),
            Err(ArtifactError::InvalidPath(_))
        ));
        assert!(matches!(
            resolve_artifact(&root, "..\\secret.txt"),
            Err(ArtifactError::InvalidPath(_))
        ));
        assert!(resolve_artifact(&root, "speed_sensor_v2.bin").is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escaping_root_is_rejected() {
        let dir = artifact_root();
        let root = dir.path().join("data");
        std::os::unix::fs::symlink(dir.path().join("secret.txt"), root.join("link.bin")).unwrap();

        assert!(matches!(
            resolve_artifact(&root, "link.bin"),
            Err(ArtifactError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_artifact_names() {
        assert!(validate_artifact_name("speed_sensor_v2.bin").is_ok());
        assert!(validate_artifact_name("").is_err());
        assert!(validate_artifact_name("..").is_err());
        assert!(validate_artifact_name("v2/speed.bin").is_err());
        assert!(validate_artifact_name("speed\n.bin").is_err());
    }

    #[test]
    fn test_missing_certificate_is_a_tls_error() {
        let dir = artifact_root();
        let settings = FirmwareSettings {
            addr: "127.0.0.1:0".parse().unwrap(),
            root: dir.path().join("data"),
            cert: dir.path().join("cert.pem"),
            key: dir.path().join("key.pem"),
            client_ca: None,
            shutdown_grace: Duration::from_secs(1),
        };

        assert!(matches!(tls_config(&settings), Err(Error::Tls(_))));
    }

    #[tokio::test]
    async fn test_stalled_download_does_not_block_other_devices() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::{TcpListener, TcpStream};

        let dir = artifact_root();
        let root = dir.path().join("data");
        std::fs::write(root.join("large.bin"), vec![0u8; 8 * 1024 * 1024]).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(root);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // One device stops mid-request, another never reads its response.
        let mut half_sent = TcpStream::connect(addr).await.unwrap();
        half_sent
            .write_all(b"GET /speed_sensor_v2.bin HTTP/1.1\r\nHost: fw\r\n")
            .await
            .unwrap();
        let mut not_reading = TcpStream::connect(addr).await.unwrap();
        not_reading
            .write_all(b"GET /large.bin HTTP/1.1\r\nHost: fw\r\n\r\n")
            .await
            .unwrap();

        let response = tokio::time::timeout(Duration::from_secs(5), async {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(b"GET /speed_sensor_v2.bin HTTP/1.1\r\nHost: fw\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
            let mut response = Vec::new();
            stream.read_to_end(&mut response).await.unwrap();
            response
        })
        .await
        .expect("download starved by stalled connections");

        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200"));
        assert!(text.contains(&format!("{:x}", Sha256::digest(FIRMWARE))));
        drop((half_sent, not_reading));
    }
}
