//! CSI Identity service trait and the driver's fixed capability set.
//!
//! The Identity service allows callers to discover plugin metadata and check
//! plugin health.  Every CSI plugin must implement this service.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{AccessMode, ControllerCapability, NodeCapability, PluginCapability, PluginInfo};

/// Identity service: plugin discovery and health probing.
#[async_trait]
pub trait CsiIdentity: Send + Sync {
    /// Return the plugin name and version.
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError>;

    /// Liveness probe.  Returns `true` when the plugin is healthy.
    async fn probe(&self) -> Result<bool, CsiError>;

    /// Advertise the capabilities supported by this plugin.
    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError>;
}

/// Everything the driver advertises, fixed at construction.
///
/// The Controller and Node state machines consult this value instead of the
/// transport, e.g. to reject unsupported access modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySet {
    /// Reported by `GetPluginCapabilities`.
    pub plugin: Vec<PluginCapability>,
    /// Reported by `ControllerGetCapabilities`.
    pub controller: Vec<ControllerCapability>,
    /// Reported by `NodeGetCapabilities`.
    pub node: Vec<NodeCapability>,
    /// Access modes a volume capability may request.
    pub access_modes: Vec<AccessMode>,
}

impl CapabilitySet {
    /// The capability set of the LVM driver.
    pub fn lvm() -> Self {
        Self {
            plugin: vec![
                PluginCapability::ControllerService,
                PluginCapability::VolumeAccessibilityConstraints,
                PluginCapability::OnlineExpansion,
            ],
            controller: vec![
                ControllerCapability::CreateDeleteVolume,
                ControllerCapability::CreateDeleteSnapshot,
                ControllerCapability::ListVolumes,
                ControllerCapability::ListSnapshots,
                ControllerCapability::GetCapacity,
                ControllerCapability::ExpandVolume,
            ],
            node: vec![NodeCapability::StageUnstageVolume, NodeCapability::ExpandVolume],
            access_modes: vec![AccessMode::ReadWriteOnce],
        }
    }

    /// Whether volumes may be accessed with `mode`.
    pub fn supports(&self, mode: AccessMode) -> bool {
        self.access_modes.contains(&mode)
    }
}
