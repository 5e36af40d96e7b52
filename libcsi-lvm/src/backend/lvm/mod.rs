//! LVM storage backend.
//!
//! [`LvmDriver`] implements [`CsiIdentity`], [`CsiController`] and
//! [`CsiNode`] by composing:
//!
//! * a [`VolumeRegistry`] (optionally persisted by a [`RegistryStore`]),
//! * a [`ControllerStateMachine`] for the volume and snapshot lifecycle,
//! * a [`NodeStateMachine`] for stage / publish,
//! * an [`LvmAdapter`] doing the actual work ([`CommandAdapter`] in
//!   production).
//!
//! # Startup
//!
//! Call [`LvmDriver::recover`] before serving.  It loads the persisted image
//! and reconciles it with the logical volumes that actually exist, so a
//! driver restarted without its state directory still knows every volume it
//! created.

pub mod adapter;
pub mod command;
pub mod controller;
pub mod locks;
pub mod node;
pub mod registry;
pub mod store;

#[cfg(test)]
pub(crate) mod fake;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

pub use adapter::{BackendError, LvmAdapter};
pub use command::CommandAdapter;
pub use controller::ControllerStateMachine;
pub use node::NodeStateMachine;
pub use registry::{RegistryImage, VolumeRegistry};
pub use store::RegistryStore;

use adapter::{
    TAG_KIND_SNAPSHOT, TAG_KIND_VOLUME, TAG_NAME_PREFIX, TAG_READY, TAG_SOURCE_PREFIX, bounded,
};
use controller::{snapshot_record, volume_record};

use crate::config::DriverConfig;
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::{CapabilitySet, CsiIdentity};
use crate::node::CsiNode;
use crate::types::*;

/// Outcome of [`LvmDriver::recover`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Entries loaded from the persisted image.
    pub loaded: usize,
    /// Entries dropped because their logical volume is gone.
    pub dropped: usize,
    /// Tagged logical volumes added to the registry.
    pub adopted: usize,
    /// Snapshot copies that never completed, removed from the backend.
    pub discarded: usize,
}

/// CSI driver backed by LVM.
pub struct LvmDriver<A: LvmAdapter> {
    config: Arc<DriverConfig>,
    capabilities: CapabilitySet,
    adapter: Arc<A>,
    registry: Arc<VolumeRegistry>,
    store: Option<Arc<RegistryStore>>,
    controller: Arc<ControllerStateMachine<A>>,
    node: NodeStateMachine<A>,
}

impl<A: LvmAdapter> LvmDriver<A> {
    pub fn new(config: DriverConfig, adapter: A) -> Self {
        let config = Arc::new(config);
        let capabilities = CapabilitySet::lvm();
        let adapter = Arc::new(adapter);
        let registry = Arc::new(VolumeRegistry::new());
        let store = config
            .registry_path()
            .map(|path| Arc::new(RegistryStore::new(path)));

        let controller = Arc::new(ControllerStateMachine::new(
            Arc::clone(&config),
            capabilities.clone(),
            Arc::clone(&adapter),
            Arc::clone(&registry),
            store.clone(),
        ));
        let node = NodeStateMachine::new(
            Arc::clone(&config),
            capabilities.clone(),
            Arc::clone(&adapter),
            Arc::clone(&registry),
        );

        Self {
            config,
            capabilities,
            adapter,
            registry,
            store,
            controller,
            node,
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn registry(&self) -> &VolumeRegistry {
        &self.registry
    }

    /// Rebuild the registry from the persisted image and the backend.
    ///
    /// Every volume group named by the image, plus the default group, is
    /// listed.  Recorded entries without a logical volume are dropped;
    /// logical volumes tagged by this driver but missing from the registry
    /// are adopted, except snapshot copies that never completed, which are
    /// removed.  A volume group that cannot be listed is left untouched.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<RecoveryReport, CsiError> {
        let mut report = RecoveryReport::default();
        if let Some(store) = &self.store {
            match store.load().await {
                Ok(Some(image)) => report.loaded = self.registry.restore(image),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "ignoring unreadable registry image"),
            }
        }

        let image = self.registry.image();
        let mut groups: BTreeSet<String> = image
            .volumes
            .iter()
            .map(|v| v.volume_group.clone())
            .chain(image.snapshots.iter().map(|s| s.volume_group.clone()))
            .collect();
        groups.insert(self.config.volume_group.clone());

        for group in groups {
            let status = match bounded(
                self.config.backend_timeout,
                self.adapter.volume_group(&group),
            )
            .await
            {
                Ok(status) => status,
                Err(e) => {
                    warn!(volume_group = %group, error = %e, "cannot reconcile volume group");
                    continue;
                }
            };
            let lvs = match bounded(
                self.config.backend_timeout,
                self.adapter.list_logical_volumes(&group),
            )
            .await
            {
                Ok(lvs) => lvs,
                Err(e) => {
                    warn!(volume_group = %group, error = %e, "cannot reconcile volume group");
                    continue;
                }
            };
            let present: HashMap<&str, _> = lvs.iter().map(|lv| (lv.name.as_str(), lv)).collect();

            for volume in image.volumes.iter().filter(|v| v.volume_group == group) {
                if !present.contains_key(volume.volume_id.0.as_str()) {
                    warn!(volume_id = %volume.volume_id, "logical volume gone, dropping volume");
                    self.registry.remove_volume(&volume.volume_id);
                    report.dropped += 1;
                }
            }
            for snapshot in image.snapshots.iter().filter(|s| s.volume_group == group) {
                if !present.contains_key(snapshot.snapshot_id.0.as_str()) {
                    warn!(snapshot_id = %snapshot.snapshot_id, "logical volume gone, dropping snapshot");
                    self.registry.remove_snapshot(&snapshot.snapshot_id);
                    report.dropped += 1;
                }
            }

            for lv in &lvs {
                if lv.has_tag(TAG_KIND_SNAPSHOT)
                    && !lv.has_tag(TAG_READY)
                    && self.registry.snapshot(&SnapshotId(lv.name.clone())).is_none()
                {
                    warn!(lv = %lv.name, "discarding incomplete snapshot copy");
                    match bounded(
                        self.config.backend_timeout,
                        self.adapter.remove_logical_volume(&group, &lv.name),
                    )
                    .await
                    {
                        Ok(()) | Err(BackendError::NotFound(_)) => report.discarded += 1,
                        Err(e) => {
                            warn!(lv = %lv.name, error = %e, "cannot discard incomplete snapshot copy")
                        }
                    }
                    continue;
                }
                let Some(name) = lv.tag_value(TAG_NAME_PREFIX) else {
                    continue;
                };
                if lv.has_tag(TAG_KIND_VOLUME) {
                    let id = VolumeId(lv.name.clone());
                    if self.registry.volume(&id).is_some() {
                        continue;
                    }
                    let volume = volume_record(
                        lv,
                        name,
                        status.extent_bytes,
                        HashMap::new(),
                        &self.config.node_id,
                    );
                    match self.registry.insert_volume(volume) {
                        Ok(()) => {
                            info!(volume_id = %id, name, "adopted volume");
                            report.adopted += 1;
                        }
                        Err(e) => warn!(volume_id = %id, error = %e, "cannot adopt volume"),
                    }
                } else if lv.has_tag(TAG_KIND_SNAPSHOT) {
                    let id = SnapshotId(lv.name.clone());
                    let Some(source) = lv.tag_value(TAG_SOURCE_PREFIX) else {
                        continue;
                    };
                    if self.registry.snapshot(&id).is_some() {
                        continue;
                    }
                    let snapshot = snapshot_record(lv, name, &VolumeId::from(source));
                    match self.registry.insert_snapshot(snapshot) {
                        Ok(()) => {
                            info!(snapshot_id = %id, name, "adopted snapshot");
                            report.adopted += 1;
                        }
                        Err(e) => warn!(snapshot_id = %id, error = %e, "cannot adopt snapshot"),
                    }
                }
            }
        }

        if let Some(store) = &self.store
            && let Err(e) = store.save_from(&self.registry).await
        {
            warn!(error = %e, "failed to persist recovered registry");
        }

        let (volumes, snapshots) = self.registry.counts();
        info!(
            volumes,
            snapshots,
            dropped = report.dropped,
            adopted = report.adopted,
            discarded = report.discarded,
            "recovery complete"
        );
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// CsiIdentity
// ---------------------------------------------------------------------------

#[async_trait]
impl<A: LvmAdapter> CsiIdentity for LvmDriver<A> {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: self.config.driver_name.clone(),
            vendor_version: self.config.vendor_version.clone(),
        })
    }

    /// Healthy when the default volume group answers.
    async fn probe(&self) -> Result<bool, CsiError> {
        let healthy = bounded(
            self.config.backend_timeout,
            self.adapter.volume_group(&self.config.volume_group),
        )
        .await
        .inspect_err(|e| warn!(volume_group = %self.config.volume_group, error = %e, "probe failed"))
        .is_ok();
        Ok(healthy)
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(self.capabilities.plugin.clone())
    }
}

// ---------------------------------------------------------------------------
// CsiController
// ---------------------------------------------------------------------------

#[async_trait]
impl<A: LvmAdapter> CsiController for LvmDriver<A> {
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        self.controller.create_volume(req).await
    }

    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        self.controller.delete_volume(volume_id).await
    }

    async fn create_snapshot(&self, req: CreateSnapshotRequest) -> Result<Snapshot, CsiError> {
        self.controller.create_snapshot(req).await
    }

    async fn delete_snapshot(&self, snapshot_id: &SnapshotId) -> Result<(), CsiError> {
        self.controller.delete_snapshot(snapshot_id).await
    }

    async fn list_snapshots(&self, req: ListSnapshotsRequest) -> Result<Page<Snapshot>, CsiError> {
        Ok(self.controller.list_snapshots(&req))
    }

    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError> {
        self.controller
            .validate_volume_capabilities(volume_id, capabilities)
    }

    async fn list_volumes(&self, req: ListVolumesRequest) -> Result<Page<Volume>, CsiError> {
        Ok(self.controller.list_volumes(&req))
    }

    async fn get_capacity(&self, parameters: &HashMap<String, String>) -> Result<u64, CsiError> {
        self.controller.get_capacity(parameters).await
    }

    async fn expand_volume(&self, req: ExpandVolumeRequest) -> Result<VolumeExpansion, CsiError> {
        self.controller.expand_volume(req).await
    }

    async fn get_controller_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        Ok(self.capabilities.controller.clone())
    }
}

// ---------------------------------------------------------------------------
// CsiNode
// ---------------------------------------------------------------------------

#[async_trait]
impl<A: LvmAdapter> CsiNode for LvmDriver<A> {
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        self.node.stage_volume(req).await
    }

    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        self.node
            .unstage_volume(volume_id, staging_target_path)
            .await
    }

    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        self.node.publish_volume(req).await
    }

    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        self.node.unpublish_volume(volume_id, target_path).await
    }

    async fn node_expand_volume(&self, req: NodeExpandVolumeRequest) -> Result<u64, CsiError> {
        self.node.node_expand_volume(req).await
    }

    async fn get_node_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        Ok(self.capabilities.node.clone())
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(self.node.get_info())
    }
}
