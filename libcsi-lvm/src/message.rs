//! CSI protocol messages.
//!
//! [`CsiMessage`] is the envelope for every request and response exchanged
//! between a CSI client (the orchestrator side) and the driver over its Unix
//! socket.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::CsiError;
use crate::types::*;

/// Top-level message envelope.
///
/// Each connection carries exactly one request followed by one response.
/// The client sends a *request* variant and the server replies with the
/// corresponding *response* variant (or [`CsiMessage::Error`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CsiMessage {
    // ----- Identity requests ------------------------------------------------
    /// Health probe.
    Probe,
    /// Query plugin info.
    GetPluginInfo,
    /// Query plugin capabilities.
    GetPluginCapabilities,

    // ----- Controller requests ----------------------------------------------
    /// Create a new volume.
    CreateVolume(CreateVolumeRequest),
    /// Delete a volume.
    DeleteVolume(VolumeId),
    /// Snapshot a volume.
    CreateSnapshot(CreateSnapshotRequest),
    /// Delete a snapshot.
    DeleteSnapshot(SnapshotId),
    /// List snapshots, one page at a time.
    ListSnapshots(ListSnapshotsRequest),
    /// List volumes, one page at a time.
    ListVolumes(ListVolumesRequest),
    /// Query free capacity of a volume group.
    GetCapacity {
        #[serde(default)]
        parameters: HashMap<String, String>,
    },
    /// Validate volume capabilities.
    ValidateVolumeCapabilities {
        volume_id: VolumeId,
        capabilities: Vec<VolumeCapability>,
    },
    /// Grow a volume.
    ControllerExpandVolume(ExpandVolumeRequest),
    /// Query controller capabilities.
    ControllerGetCapabilities,

    // ----- Node requests ----------------------------------------------------
    /// Format and mount a volume at its staging path.
    StageVolume(NodeStageVolumeRequest),
    /// Unmount a staging path.
    UnstageVolume {
        volume_id: VolumeId,
        staging_target_path: String,
    },
    /// Mount a volume into a workload's target path.
    PublishVolume(NodePublishVolumeRequest),
    /// Unmount a workload's target path.
    UnpublishVolume {
        volume_id: VolumeId,
        target_path: String,
    },
    /// Grow the filesystem of a mounted volume.
    NodeExpandVolume(NodeExpandVolumeRequest),
    /// Query node capabilities.
    NodeGetCapabilities,
    /// Query node info.
    GetNodeInfo,

    // ----- Responses --------------------------------------------------------
    /// A volume was created (or already existed).
    VolumeCreated(Volume),
    /// A snapshot was created (or already existed).
    SnapshotCreated(Snapshot),
    /// One page of volumes.
    VolumeList(Page<Volume>),
    /// One page of snapshots.
    SnapshotList(Page<Snapshot>),
    /// Free capacity in bytes.
    Capacity(u64),
    /// Whether the requested capabilities are supported.
    CapabilitiesValid(bool),
    /// Controller-side expansion result.
    VolumeExpanded(VolumeExpansion),
    /// Capacity after node-side expansion.
    NodeVolumeExpanded(u64),
    /// Plugin information.
    PluginInfoResponse(PluginInfo),
    /// Plugin capabilities.
    PluginCapabilitiesResponse(Vec<PluginCapability>),
    /// Controller capabilities.
    ControllerCapabilitiesResponse(Vec<ControllerCapability>),
    /// Node capabilities.
    NodeCapabilitiesResponse(Vec<NodeCapability>),
    /// Node information.
    NodeInfoResponse(NodeInfo),

    /// Generic success acknowledgement (no payload).
    Ok,
    /// Probe result.
    ProbeResult(bool),
    /// An error occurred.
    Error(CsiError),
}

impl CsiMessage {
    /// Whether this is a response variant.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Self::VolumeCreated(_)
                | Self::SnapshotCreated(_)
                | Self::VolumeList(_)
                | Self::SnapshotList(_)
                | Self::Capacity(_)
                | Self::CapabilitiesValid(_)
                | Self::VolumeExpanded(_)
                | Self::NodeVolumeExpanded(_)
                | Self::PluginInfoResponse(_)
                | Self::PluginCapabilitiesResponse(_)
                | Self::ControllerCapabilitiesResponse(_)
                | Self::NodeCapabilitiesResponse(_)
                | Self::NodeInfoResponse(_)
                | Self::Ok
                | Self::ProbeResult(_)
                | Self::Error(_)
        )
    }
}

impl std::fmt::Display for CsiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Probe => f.write_str("Probe"),
            Self::GetPluginInfo => f.write_str("GetPluginInfo"),
            Self::GetPluginCapabilities => f.write_str("GetPluginCapabilities"),
            Self::CreateVolume(req) => write!(f, "CreateVolume(name={})", req.name),
            Self::DeleteVolume(id) => write!(f, "DeleteVolume({id})"),
            Self::CreateSnapshot(req) => write!(
                f,
                "CreateSnapshot(name={}, source={})",
                req.name, req.source_volume_id
            ),
            Self::DeleteSnapshot(id) => write!(f, "DeleteSnapshot({id})"),
            Self::ListSnapshots(req) => write!(f, "ListSnapshots(max={})", req.max_entries),
            Self::ListVolumes(req) => write!(f, "ListVolumes(max={})", req.max_entries),
            Self::GetCapacity { .. } => f.write_str("GetCapacity"),
            Self::ValidateVolumeCapabilities { volume_id, .. } => {
                write!(f, "ValidateVolumeCapabilities({volume_id})")
            }
            Self::ControllerExpandVolume(req) => write!(
                f,
                "ControllerExpandVolume({}, {})",
                req.volume_id, req.capacity_bytes
            ),
            Self::ControllerGetCapabilities => f.write_str("ControllerGetCapabilities"),
            Self::StageVolume(req) => write!(f, "StageVolume({})", req.volume_id),
            Self::UnstageVolume { volume_id, .. } => write!(f, "UnstageVolume({volume_id})"),
            Self::PublishVolume(req) => write!(f, "PublishVolume({})", req.volume_id),
            Self::UnpublishVolume { volume_id, .. } => write!(f, "UnpublishVolume({volume_id})"),
            Self::NodeExpandVolume(req) => write!(f, "NodeExpandVolume({})", req.volume_id),
            Self::NodeGetCapabilities => f.write_str("NodeGetCapabilities"),
            Self::GetNodeInfo => f.write_str("GetNodeInfo"),
            Self::VolumeCreated(v) => write!(f, "VolumeCreated({})", v.volume_id),
            Self::SnapshotCreated(s) => write!(f, "SnapshotCreated({})", s.snapshot_id),
            Self::VolumeList(page) => write!(f, "VolumeList(count={})", page.entries.len()),
            Self::SnapshotList(page) => write!(f, "SnapshotList(count={})", page.entries.len()),
            Self::Capacity(c) => write!(f, "Capacity({c})"),
            Self::CapabilitiesValid(v) => write!(f, "CapabilitiesValid({v})"),
            Self::VolumeExpanded(e) => write!(f, "VolumeExpanded({})", e.capacity_bytes),
            Self::NodeVolumeExpanded(c) => write!(f, "NodeVolumeExpanded({c})"),
            Self::PluginInfoResponse(info) => write!(f, "PluginInfo(name={})", info.name),
            Self::PluginCapabilitiesResponse(caps) => {
                write!(f, "PluginCapabilities(count={})", caps.len())
            }
            Self::ControllerCapabilitiesResponse(caps) => {
                write!(f, "ControllerCapabilities(count={})", caps.len())
            }
            Self::NodeCapabilitiesResponse(caps) => {
                write!(f, "NodeCapabilities(count={})", caps.len())
            }
            Self::NodeInfoResponse(info) => write!(f, "NodeInfo({})", info.node_id),
            Self::Ok => f.write_str("Ok"),
            Self::ProbeResult(ok) => write!(f, "ProbeResult({ok})"),
            Self::Error(e) => write!(f, "Error({e})"),
        }
    }
}
