//! Controller state machine.
//!
//! Every mutation follows the same discipline:
//!
//! 1. Answer from the [`VolumeRegistry`] when the idempotency key is already
//!    recorded (no backend call on a hit or a conflict).
//! 2. Otherwise hand the rest of the work to a spawned task, so dropping the
//!    RPC future never abandons a backend mutation half-way.
//! 3. In that task, hold the volume-group lock across
//!    "check capacity -> invoke backend -> record result".  Creates first
//!    take a lock on the name, which is unique across volume groups.
//! 4. Touch the registry only after the backend confirmed the change.  A
//!    backend call that timed out is re-derived by looking the logical volume
//!    up again.
//!
//! Ids are fresh for every volume and snapshot.  What stays the same across
//! retries is the idempotency key tagged onto the logical volume, which is
//! how a retry finds what an earlier attempt left behind.  A snapshot only
//! counts once its copy is complete ([`TAG_READY`]).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tracing::{Instrument, debug, info, instrument, warn};

use super::adapter::{
    BackendError, LogicalVolume, LogicalVolumeSpec, LvmAdapter, TAG_KIND_SNAPSHOT,
    TAG_KIND_VOLUME, TAG_READY, VolumeGroupStatus, bounded, round_up, snapshot_key,
    snapshot_tags, volume_key, volume_tags,
};
use super::locks::KeyedLocks;
use super::registry::VolumeRegistry;
use super::store::RegistryStore;
use crate::config::DriverConfig;
use crate::error::CsiError;
use crate::identity::CapabilitySet;
use crate::types::{
    CONTEXT_DEVICE_PATH, CreateSnapshotRequest, CreateVolumeRequest, ExpandVolumeRequest,
    ListSnapshotsRequest, ListVolumesRequest, PARAM_VOLUME_GROUP, Page, Snapshot, SnapshotId,
    Topology, Volume, VolumeCapability, VolumeExpansion, VolumeId,
};

/// Registry record for a logical volume holding a volume.
pub(super) fn volume_record(
    lv: &LogicalVolume,
    name: &str,
    extent_bytes: u64,
    parameters: HashMap<String, String>,
    node_id: &str,
) -> Volume {
    let volume_context = HashMap::from([
        (CONTEXT_DEVICE_PATH.to_owned(), lv.device_path.clone()),
        (PARAM_VOLUME_GROUP.to_owned(), lv.volume_group.clone()),
    ]);
    let accessible_topology = if node_id.is_empty() {
        Vec::new()
    } else {
        vec![Topology::node(node_id)]
    };
    Volume {
        volume_id: VolumeId(lv.name.clone()),
        name: name.to_owned(),
        capacity_bytes: lv.size_bytes,
        extent_bytes,
        volume_group: lv.volume_group.clone(),
        device_path: lv.device_path.clone(),
        parameters,
        volume_context,
        accessible_topology,
    }
}

/// Registry record for a logical volume holding a snapshot.
pub(super) fn snapshot_record(lv: &LogicalVolume, name: &str, source: &VolumeId) -> Snapshot {
    Snapshot {
        snapshot_id: SnapshotId(lv.name.clone()),
        name: name.to_owned(),
        source_volume_id: source.clone(),
        creation_time: lv.created_at().unwrap_or_else(Utc::now),
        size_bytes: lv.size_bytes,
        ready_to_use: true,
        volume_group: lv.volume_group.clone(),
        device_path: lv.device_path.clone(),
    }
}

/// Run `op` to completion on its own task, even if the caller goes away.
async fn detach<T, F>(op: F) -> Result<T, CsiError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, CsiError>> + Send + 'static,
{
    tokio::spawn(op.in_current_span())
        .await
        .map_err(|e| CsiError::internal(format!("controller task failed: {e}")))?
}

/// Idempotent volume and snapshot lifecycle on top of an [`LvmAdapter`].
pub struct ControllerStateMachine<A: LvmAdapter> {
    config: Arc<DriverConfig>,
    capabilities: CapabilitySet,
    adapter: Arc<A>,
    registry: Arc<VolumeRegistry>,
    store: Option<Arc<RegistryStore>>,
    /// One lock per volume group.
    groups: KeyedLocks,
    /// One lock per volume name, taken before the group lock.
    names: KeyedLocks,
}

impl<A: LvmAdapter> ControllerStateMachine<A> {
    pub fn new(
        config: Arc<DriverConfig>,
        capabilities: CapabilitySet,
        adapter: Arc<A>,
        registry: Arc<VolumeRegistry>,
        store: Option<Arc<RegistryStore>>,
    ) -> Self {
        Self {
            config,
            capabilities,
            adapter,
            registry,
            store,
            groups: KeyedLocks::new(),
            names: KeyedLocks::new(),
        }
    }

    /// Volume group selected by request parameters.
    fn volume_group_for(&self, parameters: &HashMap<String, String>) -> String {
        parameters
            .get(PARAM_VOLUME_GROUP)
            .filter(|vg| !vg.is_empty())
            .cloned()
            .unwrap_or_else(|| self.config.volume_group.clone())
    }

    fn check_capabilities(&self, capabilities: &[VolumeCapability]) -> Result<(), CsiError> {
        match capabilities
            .iter()
            .find(|c| !self.capabilities.supports(c.access_mode))
        {
            Some(c) => Err(CsiError::InvalidArgument(format!(
                "access mode {:?} is not supported",
                c.access_mode
            ))),
            None => Ok(()),
        }
    }

    fn check_size(&self, bytes: u64) -> Result<(), CsiError> {
        if bytes > self.config.max_volume_size {
            return Err(CsiError::InvalidArgument(format!(
                "requested {bytes} bytes, at most {} allowed",
                self.config.max_volume_size
            )));
        }
        Ok(())
    }

    /// Existing volume if it satisfies a create for `requested` bytes in
    /// `volume_group`, else the conflict.
    fn reuse(existing: Volume, requested: u64, volume_group: &str) -> Result<Volume, CsiError> {
        if existing.volume_group == volume_group
            && round_up(requested, existing.extent_bytes) == existing.capacity_bytes
        {
            debug!(volume_id = %existing.volume_id, "volume already exists, returning it");
            Ok(existing)
        } else {
            Err(CsiError::VolumeAlreadyExists(existing.name))
        }
    }

    async fn query_group(&self, volume_group: &str) -> Result<VolumeGroupStatus, CsiError> {
        match bounded(
            self.config.backend_timeout,
            self.adapter.volume_group(volume_group),
        )
        .await
        {
            Ok(status) => Ok(status),
            Err(BackendError::NotFound(_)) => Err(CsiError::InvalidArgument(format!(
                "unknown volume group {volume_group}"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Look a logical volume up again after a call with unknown outcome.
    async fn rederive(
        &self,
        volume_group: &str,
        name: &str,
    ) -> Result<Option<LogicalVolume>, CsiError> {
        bounded(
            self.config.backend_timeout,
            self.adapter.find_logical_volume(volume_group, name),
        )
        .await
        .map_err(|e| CsiError::Aborted(format!("state of {volume_group}/{name} unknown: {e}")))
    }

    /// Unrecorded logical volumes of `kind` created for idempotency key `key`.
    async fn leftovers(
        &self,
        volume_group: &str,
        kind: &str,
        key: &str,
    ) -> Result<Vec<LogicalVolume>, CsiError> {
        let lvs = bounded(
            self.config.backend_timeout,
            self.adapter.list_logical_volumes(volume_group),
        )
        .await?;
        Ok(lvs
            .into_iter()
            .filter(|lv| lv.has_tag(kind) && lv.has_key(key))
            .filter(|lv| {
                self.registry.volume(&VolumeId(lv.name.clone())).is_none()
                    && self.registry.snapshot(&SnapshotId(lv.name.clone())).is_none()
            })
            .collect())
    }

    /// Allocation call whose timeout is resolved by re-deriving the result.
    async fn allocate<F>(&self, spec: &LogicalVolumeSpec, call: F) -> Result<LogicalVolume, CsiError>
    where
        F: Future<Output = Result<LogicalVolume, BackendError>>,
    {
        match bounded(self.config.backend_timeout, call).await {
            Ok(lv) => Ok(lv),
            Err(BackendError::Timeout(limit)) => {
                warn!(lv = %spec.name, ?limit, "allocation timed out, re-deriving outcome");
                match self.rederive(&spec.volume_group, &spec.name).await? {
                    Some(lv) => Ok(lv),
                    None => Err(CsiError::Aborted(format!(
                        "allocation of {}/{} did not complete",
                        spec.volume_group, spec.name
                    ))),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a logical volume; an absent one counts as removed.
    async fn release(&self, volume_group: &str, name: &str) -> Result<(), CsiError> {
        match bounded(
            self.config.backend_timeout,
            self.adapter.remove_logical_volume(volume_group, name),
        )
        .await
        {
            Ok(()) => Ok(()),
            Err(BackendError::NotFound(_)) => {
                debug!(volume_group, lv = name, "logical volume already gone");
                Ok(())
            }
            Err(BackendError::Timeout(limit)) => {
                warn!(volume_group, lv = name, ?limit, "removal timed out, re-deriving outcome");
                match self.rederive(volume_group, name).await? {
                    None => Ok(()),
                    Some(_) => Err(CsiError::Aborted(format!(
                        "removal of {volume_group}/{name} did not complete"
                    ))),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write the registry image; the backend stays the fallback truth when
    /// this fails.
    async fn persist(&self) {
        if let Some(store) = &self.store
            && let Err(e) = store.save_from(&self.registry).await
        {
            warn!(error = %e, "failed to persist registry");
        }
    }

    // -- volumes ------------------------------------------------------------

    #[instrument(skip(self, req), fields(name = %req.name))]
    pub async fn create_volume(self: &Arc<Self>, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        if req.name.is_empty() {
            return Err(CsiError::InvalidArgument("volume name is required".into()));
        }
        self.check_capabilities(&req.volume_capabilities)?;
        let requested = match req.capacity_bytes {
            0 => self.config.default_volume_size,
            n => n,
        };
        self.check_size(requested)?;
        let volume_group = self.volume_group_for(&req.parameters);

        if let Some(existing) = self.registry.volume_by_name(&req.name) {
            return Self::reuse(existing, requested, &volume_group);
        }

        let this = Arc::clone(self);
        detach(async move { this.create_volume_locked(req, volume_group, requested).await }).await
    }

    async fn create_volume_locked(
        &self,
        req: CreateVolumeRequest,
        volume_group: String,
        requested: u64,
    ) -> Result<Volume, CsiError> {
        let _name = self
            .names
            .acquire(&req.name, self.config.lock_timeout)
            .await?;
        let _group = self
            .groups
            .acquire(&volume_group, self.config.lock_timeout)
            .await?;

        // A concurrent create with the same name may have finished while we
        // waited for the locks.
        if let Some(existing) = self.registry.volume_by_name(&req.name) {
            return Self::reuse(existing, requested, &volume_group);
        }

        let status = self.query_group(&volume_group).await?;
        let size_bytes = status.round_up(requested);
        let key = volume_key(&req.name);

        let leftover = self
            .leftovers(&volume_group, TAG_KIND_VOLUME, &key)
            .await?
            .into_iter()
            .next();
        let lv = match leftover {
            Some(lv) if lv.size_bytes == size_bytes => {
                info!(lv = %lv.name, "adopting logical volume left by an earlier attempt");
                lv
            }
            Some(lv) => {
                warn!(lv = %lv.name, size_bytes = lv.size_bytes, "leftover logical volume has a different size");
                return Err(CsiError::VolumeAlreadyExists(req.name));
            }
            None => {
                if size_bytes > status.free_bytes {
                    return Err(CsiError::ResourceExhausted {
                        volume_group,
                        requested: size_bytes,
                        available: status.free_bytes,
                    });
                }
                let spec = LogicalVolumeSpec {
                    volume_group: volume_group.clone(),
                    name: VolumeId::generate().0,
                    size_bytes,
                    tags: volume_tags(&req.name),
                };
                self.allocate(&spec, self.adapter.create_logical_volume(&spec))
                    .await?
            }
        };

        let volume = volume_record(
            &lv,
            &req.name,
            status.extent_bytes,
            req.parameters,
            &self.config.node_id,
        );
        if let Err(e) = self.registry.insert_volume(volume.clone()) {
            warn!(lv = %lv.name, error = %e, "cannot record volume, releasing its logical volume");
            if let Err(cleanup) = self.release(&lv.volume_group, &lv.name).await {
                warn!(lv = %lv.name, error = %cleanup, "failed to release unrecorded logical volume");
            }
            return Err(e);
        }
        self.persist().await;

        info!(volume_id = %volume.volume_id, volume_group = %volume.volume_group, capacity_bytes = volume.capacity_bytes, "volume created");
        Ok(volume)
    }

    #[instrument(skip(self))]
    pub async fn delete_volume(self: &Arc<Self>, volume_id: &VolumeId) -> Result<(), CsiError> {
        if volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument("volume id is required".into()));
        }
        let Some(volume) = self.registry.volume(volume_id) else {
            debug!(%volume_id, "volume not registered, nothing to delete");
            return Ok(());
        };

        let this = Arc::clone(self);
        detach(async move { this.delete_volume_locked(volume).await }).await
    }

    async fn delete_volume_locked(&self, volume: Volume) -> Result<(), CsiError> {
        let _guard = self
            .groups
            .acquire(&volume.volume_group, self.config.lock_timeout)
            .await?;
        if self.registry.volume(&volume.volume_id).is_none() {
            return Ok(());
        }

        self.release(&volume.volume_group, &volume.volume_id.0)
            .await?;
        self.registry.remove_volume(&volume.volume_id);
        self.persist().await;

        info!(volume_id = %volume.volume_id, "volume deleted");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    pub async fn expand_volume(
        self: &Arc<Self>,
        req: ExpandVolumeRequest,
    ) -> Result<VolumeExpansion, CsiError> {
        if req.capacity_bytes == 0 {
            return Err(CsiError::InvalidArgument("required capacity is zero".into()));
        }
        self.check_size(req.capacity_bytes)?;
        let volume = self
            .registry
            .volume(&req.volume_id)
            .ok_or_else(|| CsiError::VolumeNotFound(req.volume_id.to_string()))?;
        if round_up(req.capacity_bytes, volume.extent_bytes) <= volume.capacity_bytes {
            debug!(capacity_bytes = volume.capacity_bytes, "volume already large enough");
            return Ok(VolumeExpansion {
                capacity_bytes: volume.capacity_bytes,
                node_expansion_required: true,
            });
        }

        let this = Arc::clone(self);
        detach(async move { this.expand_volume_locked(volume, req.capacity_bytes).await }).await
    }

    async fn expand_volume_locked(
        &self,
        volume: Volume,
        required: u64,
    ) -> Result<VolumeExpansion, CsiError> {
        let _guard = self
            .groups
            .acquire(&volume.volume_group, self.config.lock_timeout)
            .await?;
        let volume = self
            .registry
            .volume(&volume.volume_id)
            .ok_or_else(|| CsiError::VolumeNotFound(volume.volume_id.to_string()))?;
        let target = round_up(required, volume.extent_bytes);
        if target <= volume.capacity_bytes {
            return Ok(VolumeExpansion {
                capacity_bytes: volume.capacity_bytes,
                node_expansion_required: true,
            });
        }

        let status = self.query_group(&volume.volume_group).await?;
        let growth = target - volume.capacity_bytes;
        if growth > status.free_bytes {
            return Err(CsiError::ResourceExhausted {
                volume_group: volume.volume_group,
                requested: growth,
                available: status.free_bytes,
            });
        }

        let capacity_bytes = match bounded(
            self.config.backend_timeout,
            self.adapter
                .extend_logical_volume(&volume.volume_group, &volume.volume_id.0, target),
        )
        .await
        {
            Ok(lv) => lv.size_bytes,
            Err(BackendError::Timeout(limit)) => {
                warn!(?limit, "extension timed out, re-deriving outcome");
                match self
                    .rederive(&volume.volume_group, &volume.volume_id.0)
                    .await?
                {
                    Some(lv) if lv.size_bytes >= target => lv.size_bytes,
                    _ => {
                        return Err(CsiError::Aborted(format!(
                            "extension of {} did not complete",
                            volume.volume_id
                        )));
                    }
                }
            }
            Err(e) => return Err(e.into()),
        };

        self.registry
            .update_volume(&volume.volume_id, |v| v.capacity_bytes = capacity_bytes);
        self.persist().await;

        info!(volume_id = %volume.volume_id, capacity_bytes, "volume expanded");
        Ok(VolumeExpansion {
            capacity_bytes,
            node_expansion_required: true,
        })
    }

    pub fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError> {
        if self.registry.volume(volume_id).is_none() {
            return Err(CsiError::VolumeNotFound(volume_id.to_string()));
        }
        if capabilities.is_empty() {
            return Err(CsiError::InvalidArgument(
                "at least one volume capability is required".into(),
            ));
        }
        Ok(capabilities
            .iter()
            .all(|c| self.capabilities.supports(c.access_mode)))
    }

    pub fn list_volumes(&self, req: &ListVolumesRequest) -> Page<Volume> {
        self.registry
            .list_volumes(req.starting_token.as_deref(), req.max_entries as usize)
    }

    #[instrument(skip(self))]
    pub async fn get_capacity(&self, parameters: &HashMap<String, String>) -> Result<u64, CsiError> {
        let volume_group = self.volume_group_for(parameters);
        Ok(self.query_group(&volume_group).await?.free_bytes)
    }

    // -- snapshots ----------------------------------------------------------

    #[instrument(skip(self, req), fields(name = %req.name, source = %req.source_volume_id))]
    pub async fn create_snapshot(
        self: &Arc<Self>,
        req: CreateSnapshotRequest,
    ) -> Result<Snapshot, CsiError> {
        if req.name.is_empty() {
            return Err(CsiError::InvalidArgument("snapshot name is required".into()));
        }
        if req.source_volume_id.0.is_empty() {
            return Err(CsiError::InvalidArgument(
                "source volume id is required".into(),
            ));
        }
        if let Some(existing) = self
            .registry
            .snapshot_by_name(&req.source_volume_id, &req.name)
        {
            debug!(snapshot_id = %existing.snapshot_id, "snapshot already exists, returning it");
            return Ok(existing);
        }
        let source = self
            .registry
            .volume(&req.source_volume_id)
            .ok_or_else(|| CsiError::VolumeNotFound(req.source_volume_id.to_string()))?;

        let this = Arc::clone(self);
        detach(async move { this.create_snapshot_locked(req.name, source).await }).await
    }

    async fn create_snapshot_locked(&self, name: String, source: Volume) -> Result<Snapshot, CsiError> {
        let _group = self
            .groups
            .acquire(&source.volume_group, self.config.lock_timeout)
            .await?;

        if let Some(existing) = self.registry.snapshot_by_name(&source.volume_id, &name) {
            return Ok(existing);
        }
        // The source may have been deleted while we waited.
        let source = self
            .registry
            .volume(&source.volume_id)
            .ok_or_else(|| CsiError::VolumeNotFound(source.volume_id.to_string()))?;

        // Complete copies are adopted, incomplete ones are discarded and
        // copied again.
        let key = snapshot_key(&source.volume_id.0, &name);
        let mut adopted = None;
        for lv in self
            .leftovers(&source.volume_group, TAG_KIND_SNAPSHOT, &key)
            .await?
        {
            if adopted.is_none() && lv.has_tag(TAG_READY) {
                info!(lv = %lv.name, "adopting snapshot left by an earlier attempt");
                adopted = Some(lv);
                continue;
            }
            warn!(lv = %lv.name, "discarding incomplete snapshot copy");
            self.release(&lv.volume_group, &lv.name)
                .await
                .map_err(|e| {
                    CsiError::Aborted(format!(
                        "incomplete snapshot copy {} not yet discarded: {e}",
                        lv.name
                    ))
                })?;
        }

        let lv = match adopted {
            Some(lv) => lv,
            None => {
                let status = self.query_group(&source.volume_group).await?;
                let size_bytes = source.capacity_bytes;
                if size_bytes > status.free_bytes {
                    return Err(CsiError::ResourceExhausted {
                        volume_group: source.volume_group,
                        requested: size_bytes,
                        available: status.free_bytes,
                    });
                }
                let spec = LogicalVolumeSpec {
                    volume_group: source.volume_group.clone(),
                    name: SnapshotId::generate().0,
                    size_bytes,
                    tags: snapshot_tags(&name, &source.volume_id.0, Utc::now()),
                };
                let lv = self
                    .allocate(
                        &spec,
                        self.adapter.create_snapshot(&spec, &source.volume_id.0),
                    )
                    .await?;
                if !lv.has_tag(TAG_READY) {
                    warn!(lv = %lv.name, "snapshot copy did not complete, discarding it");
                    if let Err(e) = self.release(&lv.volume_group, &lv.name).await {
                        warn!(lv = %lv.name, error = %e, "incomplete snapshot copy left for the next attempt");
                    }
                    return Err(CsiError::Aborted(format!(
                        "copy into snapshot {} did not complete",
                        lv.name
                    )));
                }
                lv
            }
        };

        let snapshot = snapshot_record(&lv, &name, &source.volume_id);
        if let Err(e) = self.registry.insert_snapshot(snapshot.clone()) {
            warn!(lv = %lv.name, error = %e, "cannot record snapshot, releasing its logical volume");
            if let Err(cleanup) = self.release(&lv.volume_group, &lv.name).await {
                warn!(lv = %lv.name, error = %cleanup, "failed to release unrecorded logical volume");
            }
            return Err(e);
        }
        self.persist().await;

        info!(snapshot_id = %snapshot.snapshot_id, size_bytes = snapshot.size_bytes, "snapshot created");
        Ok(snapshot)
    }

    #[instrument(skip(self))]
    pub async fn delete_snapshot(self: &Arc<Self>, snapshot_id: &SnapshotId) -> Result<(), CsiError> {
        if snapshot_id.0.is_empty() {
            return Err(CsiError::InvalidArgument("snapshot id is required".into()));
        }
        let Some(snapshot) = self.registry.snapshot(snapshot_id) else {
            debug!(%snapshot_id, "snapshot not registered, nothing to delete");
            return Ok(());
        };

        let this = Arc::clone(self);
        detach(async move { this.delete_snapshot_locked(snapshot).await }).await
    }

    async fn delete_snapshot_locked(&self, snapshot: Snapshot) -> Result<(), CsiError> {
        let _guard = self
            .groups
            .acquire(&snapshot.volume_group, self.config.lock_timeout)
            .await?;
        if self.registry.snapshot(&snapshot.snapshot_id).is_none() {
            return Ok(());
        }

        self.release(&snapshot.volume_group, &snapshot.snapshot_id.0)
            .await?;
        self.registry.remove_snapshot(&snapshot.snapshot_id);
        self.persist().await;

        info!(snapshot_id = %snapshot.snapshot_id, "snapshot deleted");
        Ok(())
    }

    pub fn list_snapshots(&self, req: &ListSnapshotsRequest) -> Page<Snapshot> {
        if let Some(id) = &req.snapshot_id {
            let entries = self
                .registry
                .snapshot(id)
                .filter(|s| {
                    req.source_volume_id
                        .as_ref()
                        .is_none_or(|source| *source == s.source_volume_id)
                })
                .into_iter()
                .collect();
            return Page {
                entries,
                next_token: None,
            };
        }
        self.registry.list_snapshots(
            req.source_volume_id.as_ref(),
            req.starting_token.as_deref(),
            req.max_entries as usize,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::DateTime;

    use super::super::fake::{FakeAdapter, Op};
    use super::*;
    use crate::config::MIB;
    use crate::error::Code;
    use crate::types::AccessMode;

    const EXTENT: u64 = 4 * MIB;

    fn machine_with(
        fake: Arc<FakeAdapter>,
        tweak: impl FnOnce(&mut DriverConfig),
    ) -> (Arc<ControllerStateMachine<FakeAdapter>>, Arc<VolumeRegistry>) {
        let mut config = DriverConfig {
            node_id: "node-1".into(),
            volume_group: "vg0".into(),
            backend_timeout: Duration::from_secs(5),
            lock_timeout: Duration::from_secs(5),
            ..DriverConfig::default()
        };
        tweak(&mut config);
        let registry = Arc::new(VolumeRegistry::new());
        let machine = Arc::new(ControllerStateMachine::new(
            Arc::new(config),
            CapabilitySet::lvm(),
            fake,
            Arc::clone(&registry),
            None,
        ));
        (machine, registry)
    }

    fn machine(fake: Arc<FakeAdapter>) -> (Arc<ControllerStateMachine<FakeAdapter>>, Arc<VolumeRegistry>) {
        machine_with(fake, |_| {})
    }

    fn create(name: &str, bytes: u64) -> CreateVolumeRequest {
        CreateVolumeRequest {
            name: name.into(),
            capacity_bytes: bytes,
            volume_capabilities: vec![VolumeCapability::default()],
            ..Default::default()
        }
    }

    fn snap(name: &str, source: &VolumeId) -> CreateSnapshotRequest {
        CreateSnapshotRequest {
            name: name.into(),
            source_volume_id: source.clone(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let fake = Arc::new(FakeAdapter::with_group("vg0", EXTENT, 64 * MIB));
        let (machine, _) = machine(Arc::clone(&fake));

        let first = machine.create_volume(create("pvc-1", 5 * MIB)).await.unwrap();
        let second = machine.create_volume(create("pvc-1", 5 * MIB)).await.unwrap();

        assert_eq!(first.volume_id, second.volume_id);
        assert_eq!(first.capacity_bytes, 2 * EXTENT);
        assert_eq!(first.volume_context[CONTEXT_DEVICE_PATH], first.device_path);
        assert_eq!(fake.creates(), 1);
    }

    #[tokio::test]
    async fn conflicting_create_makes_no_backend_call() {
        let fake = Arc::new(FakeAdapter::with_group("vg0", EXTENT, 64 * MIB));
        let (machine, _) = machine(Arc::clone(&fake));
        machine.create_volume(create("pvc-1", 4 * MIB)).await.unwrap();

        let calls = fake.calls();
        let err = machine
            .create_volume(create("pvc-1", 8 * MIB))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::AlreadyExists);
        assert_eq!(fake.calls(), calls);
    }

    #[tokio::test]
    async fn create_validates_arguments() {
        let fake = Arc::new(FakeAdapter::with_group("vg0", EXTENT, 64 * MIB));
        let (machine, _) = machine_with(Arc::clone(&fake), |c| c.max_volume_size = 32 * MIB);

        let err = machine.create_volume(create("", MIB)).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let err = machine
            .create_volume(create("too-big", 64 * MIB))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let mut shared = create("shared", MIB);
        shared.volume_capabilities[0].access_mode = AccessMode::ReadWriteMany;
        let err = machine.create_volume(shared).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let mut elsewhere = create("elsewhere", MIB);
        elsewhere
            .parameters
            .insert(PARAM_VOLUME_GROUP.into(), "vg-missing".into());
        let err = machine.create_volume(elsewhere).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        assert_eq!(fake.creates(), 0);
    }

    #[tokio::test]
    async fn zero_size_uses_the_default() {
        let fake = Arc::new(FakeAdapter::with_group("vg0", EXTENT, 64 * MIB));
        let (machine, _) = machine_with(fake, |c| c.default_volume_size = 8 * MIB);
        let vol = machine.create_volume(create("pvc-1", 0)).await.unwrap();
        assert_eq!(vol.capacity_bytes, 8 * MIB);
    }

    #[tokio::test]
    async fn failed_allocation_leaves_no_entry() {
        let fake = Arc::new(FakeAdapter::with_group("vg0", EXTENT, 64 * MIB));
        fake.fail(Op::Create);
        let (machine, registry) = machine(Arc::clone(&fake));

        let err = machine.create_volume(create("pvc-1", MIB)).await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert!(registry.volume_by_name("pvc-1").is_none());

        // A retry after the backend recovers succeeds.
        fake.heal(Op::Create);
        machine.create_volume(create("pvc-1", MIB)).await.unwrap();
    }

    #[tokio::test]
    async fn capacity_is_never_exceeded() {
        let fake = Arc::new(FakeAdapter::with_group("vg0", EXTENT, 16 * MIB));
        let (machine, registry) = machine(Arc::clone(&fake));

        machine.create_volume(create("a", 8 * MIB)).await.unwrap();
        machine.create_volume(create("b", 8 * MIB)).await.unwrap();
        let err = machine.create_volume(create("c", MIB)).await.unwrap_err();

        assert_eq!(err.code(), Code::ResourceExhausted);
        assert!(registry.volume_by_name("c").is_none());
        assert_eq!(fake.used_bytes("vg0"), 16 * MIB);
        assert_eq!(fake.creates(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_allocate_once() {
        let fake = Arc::new(FakeAdapter::with_group("vg0", EXTENT, 64 * MIB));
        fake.acknowledge_after(Duration::from_millis(20));
        let (machine, _) = machine(Arc::clone(&fake));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let machine = Arc::clone(&machine);
                tokio::spawn(async move { machine.create_volume(create("pvc-race", 4 * MIB)).await })
            })
            .collect();
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().volume_id);
        }

        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(fake.creates(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_respect_capacity() {
        let fake = Arc::new(FakeAdapter::with_group("vg0", EXTENT, 20 * MIB));
        let (machine, registry) = machine(Arc::clone(&fake));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let machine = Arc::clone(&machine);
                tokio::spawn(async move { machine.create_volume(create(&format!("v{i}"), 8 * MIB)).await })
            })
            .collect();
        let mut created = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => created += 1,
                Err(e) => assert_eq!(e.code(), Code::ResourceExhausted),
            }
        }

        assert_eq!(created, 2);
        assert_eq!(registry.counts().0, 2);
        assert!(fake.used_bytes("vg0") <= 20 * MIB);
    }

    #[tokio::test]
    async fn timed_out_allocation_is_adopted() {
        let fake = Arc::new(FakeAdapter::with_group("vg0", EXTENT, 64 * MIB));
        fake.acknowledge_after(Duration::from_millis(500));
        let (machine, registry) =
            machine_with(Arc::clone(&fake), |c| c.backend_timeout = Duration::from_millis(50));

        let vol = machine.create_volume(create("pvc-slow", 4 * MIB)).await.unwrap();
        assert_eq!(registry.volume(&vol.volume_id), Some(vol.clone()));
        assert!(fake.lv("vg0", &vol.volume_id.0).is_some());
        assert_eq!(fake.creates(), 1);
    }

    fn leftover(name: &str, volume_group: &str, size_bytes: u64, tags: Vec<String>) -> LogicalVolume {
        LogicalVolume {
            name: name.into(),
            volume_group: volume_group.into(),
            size_bytes,
            device_path: format!("/dev/{volume_group}/{name}"),
            tags,
        }
    }

    #[tokio::test]
    async fn leftover_from_an_earlier_attempt_is_adopted() {
        let fake = Arc::new(FakeAdapter::with_group("vg0", EXTENT, 64 * MIB));
        fake.insert_lv(leftover("lvm-vol-left", "vg0", 4 * MIB, volume_tags("pvc-1")));
        let (machine, _) = machine(Arc::clone(&fake));

        let vol = machine.create_volume(create("pvc-1", 4 * MIB)).await.unwrap();
        assert_eq!(vol.volume_id, VolumeId::from("lvm-vol-left"));
        assert_eq!(fake.creates(), 0);

        // A leftover of another size is a conflict, not an allocation.
        fake.insert_lv(leftover("lvm-vol-other", "vg0", 4 * MIB, volume_tags("pvc-2")));
        let err = machine
            .create_volume(create("pvc-2", 8 * MIB))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::AlreadyExists);
        assert_eq!(fake.creates(), 0);
    }

    #[tokio::test]
    async fn recreated_volume_does_not_inherit_snapshots() {
        let fake = Arc::new(FakeAdapter::with_group("vg0", EXTENT, 64 * MIB));
        let (machine, _) = machine(Arc::clone(&fake));

        let old = machine.create_volume(create("pvc-1", 4 * MIB)).await.unwrap();
        let old_snap = machine
            .create_snapshot(snap("daily", &old.volume_id))
            .await
            .unwrap();
        machine.delete_volume(&old.volume_id).await.unwrap();

        let new = machine.create_volume(create("pvc-1", 4 * MIB)).await.unwrap();
        assert_ne!(new.volume_id, old.volume_id);
        assert_eq!(fake.creates(), 2);

        let new_snap = machine
            .create_snapshot(snap("daily", &new.volume_id))
            .await
            .unwrap();
        assert_ne!(new_snap.snapshot_id, old_snap.snapshot_id);
        assert_eq!(new_snap.source_volume_id, new.volume_id);
        assert_eq!(fake.snapshots(), 2);

        let page = machine.list_snapshots(&ListSnapshotsRequest {
            source_volume_id: Some(new.volume_id.clone()),
            ..Default::default()
        });
        assert_eq!(page.entries, vec![new_snap]);
        let page = machine.list_snapshots(&ListSnapshotsRequest {
            source_volume_id: Some(old.volume_id.clone()),
            ..Default::default()
        });
        assert_eq!(page.entries, vec![old_snap]);
    }

    #[tokio::test]
    async fn timed_out_snapshot_copy_is_not_ready() {
        let fake = Arc::new(FakeAdapter::with_group("vg0", EXTENT, 64 * MIB));
        let (machine, registry) =
            machine_with(Arc::clone(&fake), |c| c.backend_timeout = Duration::from_millis(50));
        let vol = machine.create_volume(create("pvc-1", 8 * MIB)).await.unwrap();

        // The snapshot volume exists long before its copy completes.
        fake.acknowledge_after(Duration::from_millis(500));
        let err = machine
            .create_snapshot(snap("daily", &vol.volume_id))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Aborted);
        assert!(registry.snapshot_by_name(&vol.volume_id, "daily").is_none());
        assert_eq!(fake.used_bytes("vg0"), 8 * MIB, "partial copy is discarded");

        fake.acknowledge_after(Duration::ZERO);
        let snapshot = machine
            .create_snapshot(snap("daily", &vol.volume_id))
            .await
            .unwrap();
        assert!(snapshot.ready_to_use);
        assert!(fake.lv("vg0", &snapshot.snapshot_id.0).unwrap().has_tag(TAG_READY));
        assert_eq!(fake.snapshots(), 2);
    }

    #[tokio::test]
    async fn incomplete_leftover_copy_is_redone() {
        let fake = Arc::new(FakeAdapter::with_group("vg0", EXTENT, 64 * MIB));
        let (machine, registry) = machine(Arc::clone(&fake));
        let vol = machine.create_volume(create("pvc-1", 8 * MIB)).await.unwrap();
        let tags = snapshot_tags("daily", &vol.volume_id.0, Utc::now());
        fake.insert_lv(leftover("lvm-snap-partial", "vg0", 8 * MIB, tags));

        let snapshot = machine
            .create_snapshot(snap("daily", &vol.volume_id))
            .await
            .unwrap();
        assert_ne!(snapshot.snapshot_id.0, "lvm-snap-partial");
        assert!(fake.lv("vg0", "lvm-snap-partial").is_none());
        assert_eq!(fake.snapshots(), 1);
        assert_eq!(registry.counts(), (1, 1));

        // A complete leftover is adopted as is.
        let created = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let mut tags = snapshot_tags("weekly", &vol.volume_id.0, created);
        tags.push(TAG_READY.to_owned());
        fake.insert_lv(leftover("lvm-snap-done", "vg0", 8 * MIB, tags));
        let weekly = machine
            .create_snapshot(snap("weekly", &vol.volume_id))
            .await
            .unwrap();
        assert_eq!(weekly.snapshot_id.0, "lvm-snap-done");
        assert_eq!(weekly.creation_time, created);
        assert_eq!(fake.snapshots(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_name_in_two_groups_allocates_once() {
        let fake = Arc::new(FakeAdapter::with_group("vg0", EXTENT, 64 * MIB));
        fake.add_group("vg1", EXTENT, 64 * MIB);
        fake.acknowledge_after(Duration::from_millis(20));
        let (machine, registry) = machine(Arc::clone(&fake));

        let handles: Vec<_> = ["vg0", "vg1"]
            .into_iter()
            .map(|vg| {
                let machine = Arc::clone(&machine);
                let mut req = create("pvc-x", 4 * MIB);
                req.parameters.insert(PARAM_VOLUME_GROUP.into(), vg.into());
                tokio::spawn(async move { machine.create_volume(req).await })
            })
            .collect();
        let mut created = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(vol) => created.push(vol),
                Err(e) => assert_eq!(e.code(), Code::AlreadyExists),
            }
        }

        assert_eq!(created.len(), 1);
        assert_eq!(fake.creates(), 1);
        let vol = registry.volume_by_name("pvc-x").unwrap();
        assert_eq!(vol, created[0]);
        assert_eq!(fake.used_bytes("vg0") + fake.used_bytes("vg1"), 4 * MIB);
    }

    #[tokio::test]
    async fn busy_volume_group_aborts() {
        let fake = Arc::new(FakeAdapter::with_group("vg0", EXTENT, 64 * MIB));
        let (machine, registry) =
            machine_with(Arc::clone(&fake), |c| c.lock_timeout = Duration::from_millis(50));
        let vol = machine.create_volume(create("pvc-1", 4 * MIB)).await.unwrap();

        let held = machine
            .groups
            .acquire("vg0", Duration::from_secs(1))
            .await
            .unwrap();
        let err = machine
            .create_volume(create("pvc-2", 4 * MIB))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Aborted);
        assert!(err.is_retryable());
        let err = machine.delete_volume(&vol.volume_id).await.unwrap_err();
        assert_eq!(err.code(), Code::Aborted);
        assert_eq!(fake.creates(), 1);
        assert_eq!(fake.removes(), 0);
        assert!(registry.volume_by_name("pvc-2").is_none());

        drop(held);
        machine.create_volume(create("pvc-2", 4 * MIB)).await.unwrap();
        assert!(machine.groups.is_empty());
        assert!(machine.names.is_empty());
    }

    #[tokio::test]
    async fn cancelled_create_still_lands_in_registry() {
        let fake = Arc::new(FakeAdapter::with_group("vg0", EXTENT, 64 * MIB));
        fake.acknowledge_after(Duration::from_millis(100));
        let (machine, registry) = machine(Arc::clone(&fake));

        let cancelled = tokio::time::timeout(
            Duration::from_millis(10),
            machine.create_volume(create("pvc-1", 4 * MIB)),
        )
        .await;
        assert!(cancelled.is_err());

        tokio::time::sleep(Duration::from_millis(300)).await;
        let vol = registry.volume_by_name("pvc-1").unwrap();
        assert!(fake.lv("vg0", &vol.volume_id.0).is_some());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let fake = Arc::new(FakeAdapter::with_group("vg0", EXTENT, 64 * MIB));
        let (machine, registry) = machine(Arc::clone(&fake));

        machine
            .delete_volume(&VolumeId("lvm-vol-missing".into()))
            .await
            .unwrap();
        assert_eq!(fake.calls(), 0);

        let vol = machine.create_volume(create("pvc-1", MIB)).await.unwrap();
        machine.delete_volume(&vol.volume_id).await.unwrap();
        machine.delete_volume(&vol.volume_id).await.unwrap();
        assert!(registry.volume(&vol.volume_id).is_none());
        assert!(fake.lv("vg0", &vol.volume_id.0).is_none());
        assert_eq!(fake.removes(), 1);
    }

    #[tokio::test]
    async fn failed_delete_keeps_the_entry() {
        let fake = Arc::new(FakeAdapter::with_group("vg0", EXTENT, 64 * MIB));
        let (machine, registry) = machine(Arc::clone(&fake));
        let vol = machine.create_volume(create("pvc-1", MIB)).await.unwrap();

        fake.fail(Op::Remove);
        let err = machine.delete_volume(&vol.volume_id).await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert!(registry.volume(&vol.volume_id).is_some());
        assert!(fake.lv("vg0", &vol.volume_id.0).is_some());
    }

    #[tokio::test]
    async fn delete_of_vanished_lv_completes() {
        let fake = Arc::new(FakeAdapter::with_group("vg0", EXTENT, 64 * MIB));
        let (machine, registry) = machine(Arc::clone(&fake));
        let vol = machine.create_volume(create("pvc-1", MIB)).await.unwrap();

        fake.remove_lv("vg0", &vol.volume_id.0);
        machine.delete_volume(&vol.volume_id).await.unwrap();
        assert!(registry.volume(&vol.volume_id).is_none());
    }

    #[tokio::test]
    async fn snapshot_survives_source_deletion() {
        let fake = Arc::new(FakeAdapter::with_group("vg0", EXTENT, 64 * MIB));
        let (machine, registry) = machine(Arc::clone(&fake));
        let vol = machine.create_volume(create("pvc-1", 8 * MIB)).await.unwrap();

        let snapshot = machine
            .create_snapshot(snap("daily", &vol.volume_id))
            .await
            .unwrap();
        assert!(snapshot.ready_to_use);
        assert_eq!(snapshot.size_bytes, 8 * MIB);
        let again = machine
            .create_snapshot(snap("daily", &vol.volume_id))
            .await
            .unwrap();
        assert_eq!(again.snapshot_id, snapshot.snapshot_id);
        assert_eq!(fake.snapshots(), 1);

        machine.delete_volume(&vol.volume_id).await.unwrap();
        assert_eq!(registry.snapshot(&snapshot.snapshot_id), Some(snapshot.clone()));
        assert!(fake.lv("vg0", &snapshot.snapshot_id.0).is_some());

        let page = machine.list_snapshots(&ListSnapshotsRequest {
            source_volume_id: Some(vol.volume_id.clone()),
            ..Default::default()
        });
        assert_eq!(page.entries.len(), 1);

        machine.delete_snapshot(&snapshot.snapshot_id).await.unwrap();
        machine.delete_snapshot(&snapshot.snapshot_id).await.unwrap();
        assert!(registry.snapshot(&snapshot.snapshot_id).is_none());
    }

    #[tokio::test]
    async fn snapshot_requires_live_source() {
        let fake = Arc::new(FakeAdapter::with_group("vg0", EXTENT, 64 * MIB));
        let (machine, _) = machine(Arc::clone(&fake));

        let err = machine
            .create_snapshot(snap("s", &VolumeId("lvm-vol-missing".into())))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
        assert_eq!(fake.calls(), 0);
    }

    #[tokio::test]
    async fn snapshot_is_bounded_by_free_space() {
        let fake = Arc::new(FakeAdapter::with_group("vg0", EXTENT, 12 * MIB));
        let (machine, registry) = machine(Arc::clone(&fake));
        let vol = machine.create_volume(create("pvc-1", 8 * MIB)).await.unwrap();

        let err = machine
            .create_snapshot(snap("s", &vol.volume_id))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);
        assert_eq!(registry.counts(), (1, 0));
    }

    #[tokio::test]
    async fn list_snapshots_by_id() {
        let fake = Arc::new(FakeAdapter::with_group("vg0", EXTENT, 64 * MIB));
        let (machine, _) = machine(Arc::clone(&fake));
        let vol = machine.create_volume(create("pvc-1", MIB)).await.unwrap();
        let s = machine.create_snapshot(snap("a", &vol.volume_id)).await.unwrap();
        machine.create_snapshot(snap("b", &vol.volume_id)).await.unwrap();

        let page = machine.list_snapshots(&ListSnapshotsRequest {
            snapshot_id: Some(s.snapshot_id.clone()),
            ..Default::default()
        });
        assert_eq!(page.entries, vec![s]);

        let page = machine.list_snapshots(&ListSnapshotsRequest {
            snapshot_id: Some(SnapshotId("lvm-snap-missing".into())),
            ..Default::default()
        });
        assert!(page.entries.is_empty());
    }

    #[tokio::test]
    async fn list_volumes_pages_in_id_order() {
        let fake = Arc::new(FakeAdapter::with_group("vg0", EXTENT, 64 * MIB));
        let (machine, _) = machine(Arc::clone(&fake));
        for i in 0..5 {
            machine
                .create_volume(create(&format!("pvc-{i}"), MIB))
                .await
                .unwrap();
        }

        let mut token = None;
        let mut ids = Vec::new();
        loop {
            let page = machine.list_volumes(&ListVolumesRequest {
                max_entries: 2,
                starting_token: token,
            });
            ids.extend(page.entries.into_iter().map(|v| v.volume_id));
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(ids.len(), 5);
    }

    #[tokio::test]
    async fn capacity_and_validation() {
        let fake = Arc::new(FakeAdapter::with_group("vg0", EXTENT, 64 * MIB));
        let (machine, _) = machine(Arc::clone(&fake));
        let vol = machine.create_volume(create("pvc-1", 16 * MIB)).await.unwrap();

        assert_eq!(machine.get_capacity(&HashMap::new()).await.unwrap(), 48 * MIB);

        assert!(
            machine
                .validate_volume_capabilities(&vol.volume_id, &[VolumeCapability::default()])
                .unwrap()
        );
        let shared = VolumeCapability {
            access_mode: AccessMode::ReadOnlyMany,
            ..Default::default()
        };
        assert!(
            !machine
                .validate_volume_capabilities(&vol.volume_id, &[shared])
                .unwrap()
        );
        assert_eq!(
            machine
                .validate_volume_capabilities(&vol.volume_id, &[])
                .unwrap_err()
                .code(),
            Code::InvalidArgument
        );
        assert_eq!(
            machine
                .validate_volume_capabilities(&VolumeId("nope".into()), &[VolumeCapability::default()])
                .unwrap_err()
                .code(),
            Code::NotFound
        );
    }

    #[tokio::test]
    async fn expand_grows_only() {
        let fake = Arc::new(FakeAdapter::with_group("vg0", EXTENT, 32 * MIB));
        let (machine, registry) = machine(Arc::clone(&fake));
        let vol = machine.create_volume(create("pvc-1", 4 * MIB)).await.unwrap();

        let grown = machine
            .expand_volume(ExpandVolumeRequest {
                volume_id: vol.volume_id.clone(),
                capacity_bytes: 10 * MIB,
            })
            .await
            .unwrap();
        assert_eq!(grown.capacity_bytes, 12 * MIB);
        assert!(grown.node_expansion_required);
        assert_eq!(registry.volume(&vol.volume_id).unwrap().capacity_bytes, 12 * MIB);

        let same = machine
            .expand_volume(ExpandVolumeRequest {
                volume_id: vol.volume_id.clone(),
                capacity_bytes: 8 * MIB,
            })
            .await
            .unwrap();
        assert_eq!(same.capacity_bytes, 12 * MIB);
        assert_eq!(fake.extends(), 1);

        let err = machine
            .expand_volume(ExpandVolumeRequest {
                volume_id: vol.volume_id.clone(),
                capacity_bytes: 64 * MIB,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);
    }
}
