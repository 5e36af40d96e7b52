//! Unix-socket client used by the orchestrator side to issue CSI requests.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tracing::{debug, instrument};

use super::read_message;
use crate::error::CsiError;
use crate::message::CsiMessage;

/// A lightweight CSI client.  Every request opens its own connection.
#[derive(Debug, Clone)]
pub struct CsiClient {
    path: PathBuf,
}

impl CsiClient {
    /// Client for the driver listening at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Send a request and wait for the corresponding response.
    ///
    /// Writes the JSON-serialized request, shuts down the write half, then
    /// reads the full response and deserializes it.
    #[instrument(skip(self), fields(msg = %msg))]
    pub async fn request(&self, msg: &CsiMessage) -> Result<CsiMessage, CsiError> {
        let mut stream = UnixStream::connect(&self.path).await.map_err(|e| {
            CsiError::TransportError(format!("connect {}: {e}", self.path.display()))
        })?;

        let payload = serde_json::to_vec(msg).map_err(CsiError::internal)?;
        stream
            .write_all(&payload)
            .await
            .map_err(CsiError::transport)?;
        stream.shutdown().await.map_err(CsiError::transport)?;

        let buf = read_message(&mut stream).await?;
        let response: CsiMessage = serde_json::from_slice(&buf).map_err(CsiError::transport)?;
        debug!(%response, "CSI response received");
        Ok(response)
    }
}
