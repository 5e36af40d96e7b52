//! CSI Controller service trait.
//!
//! The Controller service manages the centralized volume lifecycle: creation,
//! deletion, snapshots, capability validation, listing, expansion and
//! capacity queries.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    ControllerCapability, CreateSnapshotRequest, CreateVolumeRequest, ExpandVolumeRequest,
    ListSnapshotsRequest, ListVolumesRequest, Page, Snapshot, SnapshotId, Volume,
    VolumeCapability, VolumeExpansion, VolumeId,
};

/// Controller service: centralized volume management.
///
/// Every mutating operation is idempotent: retrying a call with the same
/// name (create) or id (delete) converges on the same result.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a new volume, or return the existing one with the same name
    /// and size.
    ///
    /// The returned [`Volume`] contains the assigned `volume_id` and
    /// `volume_context` that must be forwarded to subsequent Node operations.
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    /// Delete a previously provisioned volume.  Unknown ids succeed.
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError>;

    /// Snapshot an existing volume.
    async fn create_snapshot(&self, req: CreateSnapshotRequest) -> Result<Snapshot, CsiError>;

    /// Delete a snapshot.  Unknown ids succeed.
    async fn delete_snapshot(&self, snapshot_id: &SnapshotId) -> Result<(), CsiError>;

    /// List snapshots in id order, one page at a time.
    async fn list_snapshots(&self, req: ListSnapshotsRequest) -> Result<Page<Snapshot>, CsiError>;

    /// Check whether the given capabilities are compatible with the volume.
    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError>;

    /// List volumes in id order, one page at a time.
    async fn list_volumes(&self, req: ListVolumesRequest) -> Result<Page<Volume>, CsiError>;

    /// Return the free capacity in bytes of the volume group selected by
    /// `parameters` (or the default group).
    async fn get_capacity(&self, parameters: &HashMap<String, String>) -> Result<u64, CsiError>;

    /// Grow a volume to at least the requested size.
    async fn expand_volume(&self, req: ExpandVolumeRequest) -> Result<VolumeExpansion, CsiError>;

    /// Optional RPCs this controller implements.
    async fn get_controller_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError>;
}
