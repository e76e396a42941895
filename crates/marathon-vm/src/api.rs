//! HTTP client for the Firecracker management API.
//!
//! Firecracker exposes its API via a Unix domain socket, not TCP, so this is
//! a thin hyper wrapper over tokio's `UnixStream`. Every request is a single
//! `PUT` with `Connection: close`; a 2xx status means success.

use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tracing::warn;

use crate::error::{Result, VmError};

/// Poll interval while waiting for the API socket to appear.
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub(crate) struct ApiClient {
    socket_path: PathBuf,
}

impl ApiClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Wait for the API socket path to exist and be a Unix socket.
    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if is_unix_socket(&self.socket_path) {
                return Ok(());
            }
            tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        }
        Err(VmError::FirecrackerStartFailed(format!(
            "api socket {} did not appear within {}ms",
            self.socket_path.display(),
            timeout.as_millis()
        )))
    }

    /// Issue one `PUT` with a JSON body. Logs and fails on non-2xx.
    pub async fn put(&self, endpoint: &str, body: &serde_json::Value) -> Result<()> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| VmError::ApiCallFailed {
                endpoint: endpoint.to_string(),
                detail: format!("connect {}: {e}", self.socket_path.display()),
            })?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) =
            hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| VmError::ApiCallFailed {
                    endpoint: endpoint.to_string(),
                    detail: format!("handshake: {e}"),
                })?;

        // Drive the connection in the background; it ends when the response
        // completes (Connection: close).
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!("firecracker api connection closed: {e}");
            }
        });

        let body_bytes = Bytes::from(body.to_string());
        let request = Request::builder()
            .method(Method::PUT)
            .uri(endpoint)
            .header("Host", "localhost")
            .header("Connection", "close")
            .header("Content-Type", "application/json")
            .header("Content-Length", body_bytes.len().to_string())
            .body(Full::new(body_bytes))
            .map_err(|e| VmError::ApiCallFailed {
                endpoint: endpoint.to_string(),
                detail: format!("build request: {e}"),
            })?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| VmError::ApiCallFailed {
                endpoint: endpoint.to_string(),
                detail: format!("send: {e}"),
            })?;

        let status = response.status();
        let response_body = response
            .into_body()
            .collect()
            .await
            .map(|b| String::from_utf8_lossy(&b.to_bytes()).into_owned())
            .unwrap_or_default();

        if !status.is_success() {
            warn!(endpoint, %status, body = %response_body, "firecracker api call failed");
            return Err(VmError::ApiCallFailed {
                endpoint: endpoint.to_string(),
                detail: format!("{status}: {response_body}"),
            });
        }

        Ok(())
    }
}

fn is_unix_socket(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.file_type().is_socket())
}
