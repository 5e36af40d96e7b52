//! Unix-socket server that dispatches incoming CSI requests to the
//! appropriate trait implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, instrument, warn};

use super::read_message;
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::message::CsiMessage;
use crate::node::CsiNode;

/// Pause after a failed accept; a persistent error (descriptor exhaustion)
/// would otherwise spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A CSI server that accepts Unix-socket connections and dispatches
/// [`CsiMessage`] requests to an [`CsiIdentity`] + [`CsiController`] +
/// [`CsiNode`] implementation.
pub struct CsiServer<T> {
    listener: UnixListener,
    path: PathBuf,
    handler: Arc<T>,
}

impl<T> CsiServer<T>
where
    T: CsiIdentity + CsiController + CsiNode + 'static,
{
    /// Bind to the socket at `path`, replacing a stale socket file left by a
    /// previous process.
    pub fn bind(path: impl AsRef<Path>, handler: Arc<T>) -> Result<Self, CsiError> {
        let path = path.as_ref().to_path_buf();
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CsiError::TransportError(format!(
                    "remove stale socket {}: {e}",
                    path.display()
                )));
            }
        }
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| {
                CsiError::TransportError(format!("create {}: {e}", dir.display()))
            })?;
        }

        let listener = UnixListener::bind(&path).map_err(|e| {
            CsiError::TransportError(format!("bind {}: {e}", path.display()))
        })?;
        info!(path = %path.display(), "CSI server listening");
        Ok(Self {
            listener,
            path,
            handler,
        })
    }

    /// Path of the listening socket.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until the future is dropped.
    ///
    /// Each connection is served on its own task.  Accept errors are logged
    /// and retried after a short pause.
    pub async fn serve(&self) {
        loop {
            let stream = match self.listener.accept().await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!(error = %e, "accept failed, retrying");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            let handler = Arc::clone(&self.handler);
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, &handler).await {
                    error!(error = %e, "CSI connection handler error");
                }
            });
        }
    }

    /// Process a single connection: read request, dispatch, write response.
    #[instrument(skip_all)]
    async fn handle_connection(mut stream: UnixStream, handler: &T) -> Result<(), CsiError> {
        let buf = read_message(&mut stream).await?;

        let response = match serde_json::from_slice::<CsiMessage>(&buf) {
            Ok(request) => {
                debug!(%request, "CSI request received");
                Self::dispatch(handler, request).await
            }
            Err(e) => CsiMessage::Error(CsiError::InvalidArgument(format!(
                "malformed request: {e}"
            ))),
        };
        debug!(%response, "CSI response ready");

        let payload = serde_json::to_vec(&response).map_err(CsiError::internal)?;
        stream
            .write_all(&payload)
            .await
            .map_err(CsiError::transport)?;
        stream.shutdown().await.map_err(CsiError::transport)?;
        Ok(())
    }

    /// Map a [`CsiMessage`] request to the correct trait method call and
    /// wrap the result in a response [`CsiMessage`].
    async fn dispatch(handler: &T, request: CsiMessage) -> CsiMessage {
        fn reply<V>(result: Result<V, CsiError>, wrap: impl FnOnce(V) -> CsiMessage) -> CsiMessage {
            result.map_or_else(CsiMessage::Error, wrap)
        }

        match request {
            // --- Identity ---------------------------------------------------
            CsiMessage::Probe => reply(handler.probe().await, CsiMessage::ProbeResult),
            CsiMessage::GetPluginInfo => {
                reply(handler.get_plugin_info().await, CsiMessage::PluginInfoResponse)
            }
            CsiMessage::GetPluginCapabilities => reply(
                handler.get_plugin_capabilities().await,
                CsiMessage::PluginCapabilitiesResponse,
            ),

            // --- Controller -------------------------------------------------
            CsiMessage::CreateVolume(req) => {
                reply(handler.create_volume(req).await, CsiMessage::VolumeCreated)
            }
            CsiMessage::DeleteVolume(id) => {
                reply(handler.delete_volume(&id).await, |()| CsiMessage::Ok)
            }
            CsiMessage::CreateSnapshot(req) => {
                reply(handler.create_snapshot(req).await, CsiMessage::SnapshotCreated)
            }
            CsiMessage::DeleteSnapshot(id) => {
                reply(handler.delete_snapshot(&id).await, |()| CsiMessage::Ok)
            }
            CsiMessage::ListSnapshots(req) => {
                reply(handler.list_snapshots(req).await, CsiMessage::SnapshotList)
            }
            CsiMessage::ListVolumes(req) => {
                reply(handler.list_volumes(req).await, CsiMessage::VolumeList)
            }
            CsiMessage::GetCapacity { parameters } => {
                reply(handler.get_capacity(&parameters).await, CsiMessage::Capacity)
            }
            CsiMessage::ValidateVolumeCapabilities {
                volume_id,
                capabilities,
            } => reply(
                handler
                    .validate_volume_capabilities(&volume_id, &capabilities)
                    .await,
                CsiMessage::CapabilitiesValid,
            ),
            CsiMessage::ControllerExpandVolume(req) => {
                reply(handler.expand_volume(req).await, CsiMessage::VolumeExpanded)
            }
            CsiMessage::ControllerGetCapabilities => reply(
                handler.get_controller_capabilities().await,
                CsiMessage::ControllerCapabilitiesResponse,
            ),

            // --- Node -------------------------------------------------------
            CsiMessage::StageVolume(req) => {
                reply(handler.stage_volume(req).await, |()| CsiMessage::Ok)
            }
            CsiMessage::UnstageVolume {
                volume_id,
                staging_target_path,
            } => reply(
                handler
                    .unstage_volume(&volume_id, &staging_target_path)
                    .await,
                |()| CsiMessage::Ok,
            ),
            CsiMessage::PublishVolume(req) => {
                reply(handler.publish_volume(req).await, |()| CsiMessage::Ok)
            }
            CsiMessage::UnpublishVolume {
                volume_id,
                target_path,
            } => reply(
                handler.unpublish_volume(&volume_id, &target_path).await,
                |()| CsiMessage::Ok,
            ),
            CsiMessage::NodeExpandVolume(req) => reply(
                handler.node_expand_volume(req).await,
                CsiMessage::NodeVolumeExpanded,
            ),
            CsiMessage::NodeGetCapabilities => reply(
                handler.get_node_capabilities().await,
                CsiMessage::NodeCapabilitiesResponse,
            ),
            CsiMessage::GetNodeInfo => reply(handler.get_info().await, CsiMessage::NodeInfoResponse),

            // --- Response variants should never arrive as requests ----------
            other => {
                warn!(msg = %other, "unexpected message variant received as request");
                CsiMessage::Error(CsiError::InvalidArgument(format!(
                    "unexpected message: {other}"
                )))
            }
        }
    }
}

impl<T> Drop for CsiServer<T> {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "socket cleanup failed");
        }
    }
}
