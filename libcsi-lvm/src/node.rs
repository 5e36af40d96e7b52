//! CSI Node service trait.
//!
//! The Node service runs on each worker node and handles the local filesystem
//! operations required to make a volume available to workloads:
//!
//! 1. **Stage**: format the logical volume if needed and mount it at a
//!    global staging path.
//! 2. **Publish**: bind-mount the staging path into the workload's target.
//! 3. **Unpublish**: remove the workload mount.
//! 4. **Unstage**: unmount the staging path.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    NodeCapability, NodeExpandVolumeRequest, NodeInfo, NodePublishVolumeRequest,
    NodeStageVolumeRequest, VolumeId,
};

/// Node service: local mount / unmount operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume: format if unformatted, then mount at the staging path.
    ///
    /// This is idempotent: calling it again for an already-staged volume
    /// at the same path should succeed without error.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Unstage a volume: unmount the staging path.
    ///
    /// This is idempotent: calling it on an already-unstaged volume should
    /// succeed without error.
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Publish a volume at the workload's target path.
    ///
    /// This is idempotent: calling it again for the same `target_path` should
    /// succeed without error.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unpublish a volume: unmount the workload's target path.
    ///
    /// This is idempotent.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError>;

    /// Grow the filesystem of a mounted volume; returns the volume capacity.
    async fn node_expand_volume(&self, req: NodeExpandVolumeRequest) -> Result<u64, CsiError>;

    /// Optional RPCs this node service implements.
    async fn get_node_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;

    /// Return information about the node on which this service is running.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;
}
