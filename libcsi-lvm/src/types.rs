//! Core CSI types: volumes, snapshots, capabilities, requests, and topology.
//!
//! These types form the data model shared by the CSI traits, transport layer,
//! and the LVM backend.  They are all [`Serialize`]/[`Deserialize`] so they
//! can be transmitted as JSON and persisted in the registry image.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Request parameter selecting the volume group (`CreateVolume`, `GetCapacity`).
pub const PARAM_VOLUME_GROUP: &str = "volumeGroup";

/// Volume context key carrying the device path of the logical volume.
pub const CONTEXT_DEVICE_PATH: &str = "devicePath";

/// Topology segment key identifying the node that owns the volume group.
pub const TOPOLOGY_NODE_KEY: &str = "topology.csi-lvm/node";

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a volume.
///
/// The id doubles as the logical volume name inside the volume group.  A
/// volume deleted and created again under the same name gets a new id.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeId(pub String);

impl VolumeId {
    /// A fresh id for a new volume.
    pub fn generate() -> Self {
        Self(format!("lvm-vol-{}", Uuid::new_v4()))
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Opaque, unique identifier for a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotId(pub String);

impl SnapshotId {
    /// A fresh id for a new snapshot.
    pub fn generate() -> Self {
        Self(format!("lvm-snap-{}", Uuid::new_v4()))
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SnapshotId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SnapshotId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Describes how a volume may be accessed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    /// Single-node read-write.
    ReadWriteOnce,
    /// Multi-node read-only.
    ReadOnlyMany,
    /// Multi-node read-write.
    ReadWriteMany,
}

/// Describes the capabilities required from a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeCapability {
    /// Requested access mode.
    pub access_mode: AccessMode,
    /// Additional mount flags (e.g. `"noatime"`).
    #[serde(default)]
    pub mount_flags: Vec<String>,
    /// Filesystem type created on the logical volume.
    #[serde(default = "default_fs_type")]
    pub fs_type: String,
}

fn default_fs_type() -> String {
    "ext4".to_owned()
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self {
            access_mode: AccessMode::ReadWriteOnce,
            mount_flags: Vec::new(),
            fs_type: default_fs_type(),
        }
    }
}

// ---------------------------------------------------------------------------
// Volume & snapshot metadata
// ---------------------------------------------------------------------------

/// Full metadata for a provisioned volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Volume {
    /// Unique volume identifier, also the logical volume name.
    pub volume_id: VolumeId,
    /// Caller-supplied name (the idempotency key).
    pub name: String,
    /// Provisioned capacity in bytes, a multiple of `extent_bytes`.
    pub capacity_bytes: u64,
    /// Extent size of the volume group at allocation time.
    pub extent_bytes: u64,
    /// Volume group holding the logical volume.
    pub volume_group: String,
    /// Block device path of the logical volume, e.g. `/dev/vg0/lvm-vol-…`.
    pub device_path: String,
    /// User-supplied parameters from the storage class / request.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Opaque context passed from Controller to Node operations.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    /// Topology constraints (e.g. node affinity).
    #[serde(default)]
    pub accessible_topology: Vec<Topology>,
}

/// Metadata for a point-in-time copy of a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    /// Unique snapshot identifier, also the logical volume name.
    pub snapshot_id: SnapshotId,
    /// Caller-supplied name, unique per source volume.
    pub name: String,
    /// Volume the snapshot was taken from. May no longer exist.
    pub source_volume_id: VolumeId,
    /// When the backend confirmed the snapshot.
    pub creation_time: DateTime<Utc>,
    /// Size of the snapshot in bytes.
    pub size_bytes: u64,
    /// Whether the snapshot can be used as a restore source.
    pub ready_to_use: bool,
    /// Volume group holding the snapshot.
    pub volume_group: String,
    /// Block device path of the snapshot.
    pub device_path: String,
}

/// Topology constraint expressed as key-value segments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topology {
    /// Topology segments, e.g. `{"topology.csi-lvm/node": "node-01"}`.
    #[serde(default)]
    pub segments: HashMap<String, String>,
}

impl Topology {
    /// Topology pinning a volume to `node_id`.
    pub fn node(node_id: &str) -> Self {
        Self {
            segments: HashMap::from([(TOPOLOGY_NODE_KEY.to_owned(), node_id.to_owned())]),
        }
    }
}

// ---------------------------------------------------------------------------
// Volume lifecycle state
// ---------------------------------------------------------------------------

/// How a volume is attached at a node-local path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum VolumeState {
    /// Formatted and mounted at the global staging path.
    Staged,
    /// Mounted into a workload's target path.
    Published,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Request to create a new volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// Human-readable name for the volume.
    pub name: String,
    /// Desired capacity in bytes; zero selects the configured default.
    pub capacity_bytes: u64,
    /// Required capabilities.
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Arbitrary parameters; `volumeGroup` selects the volume group.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Request to snapshot an existing volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSnapshotRequest {
    /// Snapshot name, unique per source volume.
    pub name: String,
    /// Volume to snapshot.
    pub source_volume_id: VolumeId,
    /// Arbitrary parameters.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Request to grow a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpandVolumeRequest {
    /// Volume to grow.
    pub volume_id: VolumeId,
    /// Minimum capacity after expansion.
    pub capacity_bytes: u64,
}

/// Result of a controller-side expansion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeExpansion {
    /// Capacity of the logical volume after expansion.
    pub capacity_bytes: u64,
    /// Whether the filesystem must still be grown on the node.
    pub node_expansion_required: bool,
}

/// Pagination window shared by the list operations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListVolumesRequest {
    /// Maximum entries per page; zero means no limit.
    #[serde(default)]
    pub max_entries: u32,
    /// Token returned by a previous call.
    #[serde(default)]
    pub starting_token: Option<String>,
}

/// Request to list snapshots, optionally filtered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListSnapshotsRequest {
    /// Maximum entries per page; zero means no limit.
    #[serde(default)]
    pub max_entries: u32,
    /// Token returned by a previous call.
    #[serde(default)]
    pub starting_token: Option<String>,
    /// Only list snapshots of this volume.
    #[serde(default)]
    pub source_volume_id: Option<VolumeId>,
    /// Only list this snapshot.
    #[serde(default)]
    pub snapshot_id: Option<SnapshotId>,
}

/// One page of a listing, ordered by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    /// Entries in ascending id order.
    pub entries: Vec<T>,
    /// Token for the following page, `None` on the last page.
    pub next_token: Option<String>,
}

/// Request to stage (globally mount) a volume on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    /// Volume to stage.
    pub volume_id: VolumeId,
    /// Global staging mount point,
    /// e.g. `/var/lib/kubelet/plugins/csi-lvm/<vol-id>/globalmount`.
    pub staging_target_path: String,
    /// Requested capability.
    pub volume_capability: VolumeCapability,
    /// Opaque context carried from `CreateVolume`.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Request to publish a volume into a workload's target path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    /// Volume to publish.
    pub volume_id: VolumeId,
    /// The staging mount point (source of the bind mount).  When empty the
    /// device is formatted and mounted at `target_path` directly.
    #[serde(default)]
    pub staging_target_path: String,
    /// Target path for the workload.
    pub target_path: String,
    /// Requested capability.
    pub volume_capability: VolumeCapability,
    /// Whether the mount should be read-only.
    #[serde(default)]
    pub read_only: bool,
}

/// Request to grow the filesystem of a mounted volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExpandVolumeRequest {
    /// Volume to grow.
    pub volume_id: VolumeId,
    /// Path the volume is staged or published at.
    pub volume_path: String,
}

// ---------------------------------------------------------------------------
// Plugin & node info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginInfo {
    /// Plugin name, e.g. `"csi-lvm"`.
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
}

/// Capabilities advertised by the CSI plugin.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    /// Plugin provides a Controller service.
    ControllerService,
    /// Plugin supports volume topology constraints.
    VolumeAccessibilityConstraints,
    /// Volumes can be grown while published.
    OnlineExpansion,
}

/// RPCs the Controller service implements beyond the mandatory set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControllerCapability {
    /// `CreateVolume` / `DeleteVolume`.
    CreateDeleteVolume,
    /// `CreateSnapshot` / `DeleteSnapshot`.
    CreateDeleteSnapshot,
    /// `ListVolumes`.
    ListVolumes,
    /// `ListSnapshots`.
    ListSnapshots,
    /// `GetCapacity`.
    GetCapacity,
    /// `ControllerExpandVolume`.
    ExpandVolume,
}

/// RPCs the Node service implements beyond the mandatory set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeCapability {
    /// `NodeStageVolume` / `NodeUnstageVolume`.
    StageUnstageVolume,
    /// `NodeExpandVolume`.
    ExpandVolume,
}

/// Information about the node on which the CSI Node service runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Unique node identifier.
    pub node_id: String,
    /// Maximum number of volumes the node can host.
    pub max_volumes: u64,
    /// Optional topology of this node.
    #[serde(default)]
    pub accessible_topology: Option<Topology>,
}
