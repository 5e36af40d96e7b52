//! Node state machine: stage, publish and their reversals.
//!
//! The kernel mount table is the source of truth for idempotency; the
//! in-memory [`MountRecord`]s only remember what capability a path was
//! mounted with, so a retry with a different capability can be told apart
//! from a plain retry.  Operations on the same path are serialized, other
//! paths proceed in parallel.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, instrument};

use super::adapter::{BackendError, LvmAdapter, MountPoint, MountRequest, bounded};
use super::locks::KeyedLocks;
use super::registry::VolumeRegistry;
use crate::config::DriverConfig;
use crate::error::CsiError;
use crate::identity::CapabilitySet;
use crate::types::{
    NodeExpandVolumeRequest, NodeInfo, NodePublishVolumeRequest, NodeStageVolumeRequest, Topology,
    Volume, VolumeCapability, VolumeId, VolumeState,
};

/// What this node mounted at a path.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MountRecord {
    volume_id: VolumeId,
    state: VolumeState,
    capability: VolumeCapability,
    read_only: bool,
    /// Staging path a publish was bind-mounted from.
    staging_path: Option<String>,
}

pub struct NodeStateMachine<A: LvmAdapter> {
    config: Arc<DriverConfig>,
    capabilities: CapabilitySet,
    adapter: Arc<A>,
    registry: Arc<VolumeRegistry>,
    /// Keyed by mount path.
    mounts: DashMap<String, MountRecord>,
    paths: KeyedLocks,
}

fn required(what: &str, value: &str) -> Result<(), CsiError> {
    if value.is_empty() {
        return Err(CsiError::InvalidArgument(format!("{what} is required")));
    }
    Ok(())
}

impl<A: LvmAdapter> NodeStateMachine<A> {
    pub fn new(
        config: Arc<DriverConfig>,
        capabilities: CapabilitySet,
        adapter: Arc<A>,
        registry: Arc<VolumeRegistry>,
    ) -> Self {
        Self {
            config,
            capabilities,
            adapter,
            registry,
            mounts: DashMap::new(),
            paths: KeyedLocks::new(),
        }
    }

    async fn call<T, F>(&self, fut: F) -> Result<T, CsiError>
    where
        F: Future<Output = Result<T, BackendError>>,
    {
        bounded(self.config.backend_timeout, fut)
            .await
            .map_err(CsiError::from)
    }

    fn resolve(&self, volume_id: &VolumeId) -> Result<Volume, CsiError> {
        self.registry
            .volume(volume_id)
            .ok_or_else(|| CsiError::VolumeNotFound(volume_id.to_string()))
    }

    fn check_capability(&self, capability: &VolumeCapability) -> Result<(), CsiError> {
        if !self.capabilities.supports(capability.access_mode) {
            return Err(CsiError::InvalidArgument(format!(
                "access mode {:?} is not supported",
                capability.access_mode
            )));
        }
        Ok(())
    }

    /// Another path where `volume_id` is mounted in `state`.
    fn mounted_elsewhere(&self, volume_id: &VolumeId, state: VolumeState, path: &str) -> Option<String> {
        self.mounts
            .iter()
            .find(|e| e.key() != path && e.volume_id == *volume_id && e.state == state)
            .map(|e| e.key().clone())
    }

    /// Decide whether an existing mount at `path` satisfies the request.
    fn existing_mount(
        &self,
        path: &str,
        mount: &MountPoint,
        device: &str,
        expected: &MountRecord,
    ) -> Result<(), CsiError> {
        if mount.source != device {
            return Err(CsiError::FailedPrecondition(format!(
                "{path} already has {} mounted",
                mount.source
            )));
        }
        let compatible = mount.fs_type == expected.capability.fs_type
            && mount.read_only == expected.read_only
            && self
                .mounts
                .get(path)
                .is_none_or(|r| r.capability == expected.capability && r.read_only == expected.read_only);
        if !compatible {
            return Err(CsiError::VolumeAlreadyExists(format!(
                "{} at {path} with a different capability",
                expected.volume_id
            )));
        }
        // Re-learn the record after a restart.
        self.mounts.insert(path.to_owned(), expected.clone());
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, path = %req.staging_target_path))]
    pub async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        required("volume id", &req.volume_id.0)?;
        required("staging target path", &req.staging_target_path)?;
        self.check_capability(&req.volume_capability)?;
        let volume = self.resolve(&req.volume_id)?;

        let path = req.staging_target_path;
        let _guard = self.paths.acquire(&path, self.config.lock_timeout).await?;
        let device = self
            .call(self.adapter.canonical_device(&volume.device_path))
            .await?;
        let record = MountRecord {
            volume_id: volume.volume_id.clone(),
            state: VolumeState::Staged,
            capability: req.volume_capability,
            read_only: false,
            staging_path: None,
        };

        if let Some(mount) = self.call(self.adapter.mount_point(&path)).await? {
            self.existing_mount(&path, &mount, &device, &record)?;
            debug!("already staged");
            return Ok(());
        }
        if let Some(other) = self.mounted_elsewhere(&volume.volume_id, VolumeState::Staged, &path) {
            return Err(CsiError::FailedPrecondition(format!(
                "volume {} is staged at {other}",
                volume.volume_id
            )));
        }

        self.call(self.adapter.mount_device(&MountRequest {
            device,
            target: path.clone(),
            fs_type: record.capability.fs_type.clone(),
            mount_flags: record.capability.mount_flags.clone(),
            read_only: false,
        }))
        .await?;
        self.mounts.insert(path.clone(), record);

        info!(device = %volume.device_path, "volume staged");
        Ok(())
    }

    #[instrument(skip(self), fields(path = staging_target_path))]
    pub async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        required("volume id", &volume_id.0)?;
        required("staging target path", staging_target_path)?;

        let _guard = self
            .paths
            .acquire(staging_target_path, self.config.lock_timeout)
            .await?;
        let published = self.mounts.iter().find_map(|e| {
            (e.state == VolumeState::Published
                && e.staging_path.as_deref() == Some(staging_target_path))
            .then(|| e.key().clone())
        });
        if let Some(target) = published {
            return Err(CsiError::FailedPrecondition(format!(
                "{staging_target_path} is still published at {target}"
            )));
        }

        if self
            .call(self.adapter.mount_point(staging_target_path))
            .await?
            .is_none()
        {
            self.mounts.remove(staging_target_path);
            debug!("not staged, nothing to do");
            return Ok(());
        }
        self.call(self.adapter.unmount(staging_target_path)).await?;
        self.mounts.remove(staging_target_path);

        info!(%volume_id, "volume unstaged");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, path = %req.target_path))]
    pub async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        required("volume id", &req.volume_id.0)?;
        required("target path", &req.target_path)?;
        self.check_capability(&req.volume_capability)?;
        let volume = self.resolve(&req.volume_id)?;

        let target = req.target_path;
        let _guard = self.paths.acquire(&target, self.config.lock_timeout).await?;
        let device = self
            .call(self.adapter.canonical_device(&volume.device_path))
            .await?;
        let staging_path = (!req.staging_target_path.is_empty()).then_some(req.staging_target_path);
        let record = MountRecord {
            volume_id: volume.volume_id.clone(),
            state: VolumeState::Published,
            capability: req.volume_capability,
            read_only: req.read_only,
            staging_path,
        };

        if let Some(mount) = self.call(self.adapter.mount_point(&target)).await? {
            self.existing_mount(&target, &mount, &device, &record)?;
            debug!("already published");
            return Ok(());
        }
        if let Some(other) =
            self.mounted_elsewhere(&volume.volume_id, VolumeState::Published, &target)
        {
            return Err(CsiError::FailedPrecondition(format!(
                "volume {} is published at {other}",
                volume.volume_id
            )));
        }

        match &record.staging_path {
            Some(staging) => {
                let staged = self.call(self.adapter.mount_point(staging)).await?;
                if staged.is_none_or(|m| m.source != device) {
                    return Err(CsiError::FailedPrecondition(format!(
                        "volume {} is not staged at {staging}",
                        volume.volume_id
                    )));
                }
                self.call(self.adapter.bind_mount(staging, &target, record.read_only))
                    .await?;
            }
            None => {
                self.call(self.adapter.mount_device(&MountRequest {
                    device,
                    target: target.clone(),
                    fs_type: record.capability.fs_type.clone(),
                    mount_flags: record.capability.mount_flags.clone(),
                    read_only: record.read_only,
                }))
                .await?;
            }
        }
        let read_only = record.read_only;
        self.mounts.insert(target, record);

        info!(read_only, "volume published");
        Ok(())
    }

    #[instrument(skip(self), fields(path = target_path))]
    pub async fn unpublish_volume(&self, volume_id: &VolumeId, target_path: &str) -> Result<(), CsiError> {
        required("volume id", &volume_id.0)?;
        required("target path", target_path)?;

        let _guard = self
            .paths
            .acquire(target_path, self.config.lock_timeout)
            .await?;
        if self
            .call(self.adapter.mount_point(target_path))
            .await?
            .is_none()
        {
            self.mounts.remove(target_path);
            debug!("not published, nothing to do");
            return Ok(());
        }
        self.call(self.adapter.unmount(target_path)).await?;
        self.mounts.remove(target_path);

        info!(%volume_id, "volume unpublished");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, path = %req.volume_path))]
    pub async fn node_expand_volume(&self, req: NodeExpandVolumeRequest) -> Result<u64, CsiError> {
        required("volume path", &req.volume_path)?;
        let volume = self.resolve(&req.volume_id)?;

        let _guard = self
            .paths
            .acquire(&req.volume_path, self.config.lock_timeout)
            .await?;
        if self
            .call(self.adapter.mount_point(&req.volume_path))
            .await?
            .is_none()
        {
            return Err(CsiError::FailedPrecondition(format!(
                "volume {} is not mounted at {}",
                volume.volume_id, req.volume_path
            )));
        }
        self.call(
            self.adapter
                .grow_filesystem(&volume.device_path, &req.volume_path),
        )
        .await?;

        info!(capacity_bytes = volume.capacity_bytes, "filesystem expanded");
        Ok(volume.capacity_bytes)
    }

    pub fn get_info(&self) -> NodeInfo {
        NodeInfo {
            node_id: self.config.node_id.clone(),
            max_volumes: self.config.max_volumes_per_node,
            accessible_topology: Some(Topology::node(&self.config.node_id)),
        }
    }
}
