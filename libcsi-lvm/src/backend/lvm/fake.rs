//! In-memory [`LvmAdapter`] for tests.
//!
//! Tracks volume groups, logical volumes and mounts, counts every mutating
//! call, and can inject failures and slow acknowledgements.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::adapter::{
    BackendError, LogicalVolume, LogicalVolumeSpec, LvmAdapter, MountPoint, MountRequest,
    TAG_READY, VolumeGroupStatus,
};

/// Mutating operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Op {
    Create,
    Snapshot,
    Remove,
    Extend,
    Mount,
    Unmount,
}

#[derive(Default)]
struct State {
    /// name -> (extent, size)
    groups: HashMap<String, (u64, u64)>,
    lvs: BTreeMap<(String, String), LogicalVolume>,
    mounts: HashMap<String, MountPoint>,
    /// device -> filesystem created on first mount
    formatted: HashMap<String, String>,
    failing: HashSet<Op>,
    delay: Option<Duration>,
}

#[derive(Default)]
pub(crate) struct FakeAdapter {
    state: Mutex<State>,
    creates: AtomicUsize,
    snapshots: AtomicUsize,
    removes: AtomicUsize,
    extends: AtomicUsize,
    mounts: AtomicUsize,
    calls: AtomicUsize,
}

impl FakeAdapter {
    /// A backend with one volume group.
    pub(crate) fn with_group(name: &str, extent_bytes: u64, size_bytes: u64) -> Self {
        let fake = Self::default();
        fake.add_group(name, extent_bytes, size_bytes);
        fake
    }

    pub(crate) fn add_group(&self, name: &str, extent_bytes: u64, size_bytes: u64) {
        self.state
            .lock()
            .groups
            .insert(name.to_owned(), (extent_bytes, size_bytes));
    }

    /// Make every call of `op` fail until [`Self::heal`].
    pub(crate) fn fail(&self, op: Op) {
        self.state.lock().failing.insert(op);
    }

    pub(crate) fn heal(&self, op: Op) {
        self.state.lock().failing.remove(&op);
    }

    /// Acknowledge mutations only after `delay`; the mutation itself is
    /// applied immediately.  A snapshot's copy completes only when the
    /// delay has passed.
    pub(crate) fn acknowledge_after(&self, delay: Duration) {
        self.state.lock().delay = Some(delay);
    }

    /// Insert a logical volume behind the driver's back.
    pub(crate) fn insert_lv(&self, lv: LogicalVolume) {
        self.state
            .lock()
            .lvs
            .insert((lv.volume_group.clone(), lv.name.clone()), lv);
    }

    pub(crate) fn remove_lv(&self, volume_group: &str, name: &str) {
        self.state
            .lock()
            .lvs
            .remove(&(volume_group.to_owned(), name.to_owned()));
    }

    pub(crate) fn lv(&self, volume_group: &str, name: &str) -> Option<LogicalVolume> {
        self.state
            .lock()
            .lvs
            .get(&(volume_group.to_owned(), name.to_owned()))
            .cloned()
    }

    pub(crate) fn is_mounted(&self, target: &str) -> bool {
        self.state.lock().mounts.contains_key(target)
    }

    /// Allocated bytes in a volume group.
    pub(crate) fn used_bytes(&self, volume_group: &str) -> u64 {
        Self::used(&self.state.lock(), volume_group)
    }

    pub(crate) fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub(crate) fn snapshots(&self) -> usize {
        self.snapshots.load(Ordering::SeqCst)
    }

    pub(crate) fn removes(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    pub(crate) fn extends(&self) -> usize {
        self.extends.load(Ordering::SeqCst)
    }

    pub(crate) fn mount_calls(&self) -> usize {
        self.mounts.load(Ordering::SeqCst)
    }

    /// Every adapter call, reads included.
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn used(state: &State, volume_group: &str) -> u64 {
        state
            .lvs
            .values()
            .filter(|lv| lv.volume_group == volume_group)
            .map(|lv| lv.size_bytes)
            .sum()
    }

    fn check(&self, op: Op) -> Result<(), BackendError> {
        if self.state.lock().failing.contains(&op) {
            return Err(BackendError::CommandFailed {
                command: format!("{op:?}"),
                status: "exit status: 5".to_owned(),
                stderr: "injected failure".to_owned(),
            });
        }
        Ok(())
    }

    async fn acknowledge(&self) {
        let delay = self.state.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn allocate(&self, spec: &LogicalVolumeSpec) -> Result<LogicalVolume, BackendError> {
        let mut state = self.state.lock();
        let (_, size) = *state
            .groups
            .get(&spec.volume_group)
            .ok_or_else(|| BackendError::NotFound(format!("volume group {}", spec.volume_group)))?;
        if Self::used(&state, &spec.volume_group) + spec.size_bytes > size {
            return Err(BackendError::CommandFailed {
                command: "lvcreate".to_owned(),
                status: "exit status: 5".to_owned(),
                stderr: "insufficient free space".to_owned(),
            });
        }
        let lv = LogicalVolume {
            name: spec.name.clone(),
            volume_group: spec.volume_group.clone(),
            size_bytes: spec.size_bytes,
            device_path: format!("/dev/{}/{}", spec.volume_group, spec.name),
            tags: spec.tags.clone(),
        };
        state
            .lvs
            .insert((spec.volume_group.clone(), spec.name.clone()), lv.clone());
        Ok(lv)
    }
}

#[async_trait]
impl LvmAdapter for FakeAdapter {
    async fn volume_group(&self, volume_group: &str) -> Result<VolumeGroupStatus, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        let (extent, size) = *state
            .groups
            .get(volume_group)
            .ok_or_else(|| BackendError::NotFound(format!("volume group {volume_group}")))?;
        Ok(VolumeGroupStatus {
            name: volume_group.to_owned(),
            extent_bytes: extent,
            size_bytes: size,
            free_bytes: size - Self::used(&state, volume_group),
        })
    }

    async fn list_logical_volumes(
        &self,
        volume_group: &str,
    ) -> Result<Vec<LogicalVolume>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .state
            .lock()
            .lvs
            .values()
            .filter(|lv| lv.volume_group == volume_group)
            .cloned()
            .collect())
    }

    async fn create_logical_volume(
        &self,
        spec: &LogicalVolumeSpec,
    ) -> Result<LogicalVolume, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.check(Op::Create)?;
        let lv = self.allocate(spec)?;
        self.acknowledge().await;
        Ok(lv)
    }

    async fn create_snapshot(
        &self,
        spec: &LogicalVolumeSpec,
        origin: &str,
    ) -> Result<LogicalVolume, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.snapshots.fetch_add(1, Ordering::SeqCst);
        self.check(Op::Snapshot)?;
        if self.lv(&spec.volume_group, origin).is_none() {
            return Err(BackendError::NotFound(format!("logical volume {origin}")));
        }
        self.allocate(spec)?;
        self.acknowledge().await;
        let mut state = self.state.lock();
        let lv = state
            .lvs
            .get_mut(&(spec.volume_group.clone(), spec.name.clone()))
            .ok_or_else(|| BackendError::NotFound(format!("logical volume {}", spec.name)))?;
        lv.tags.push(TAG_READY.to_owned());
        Ok(lv.clone())
    }

    async fn remove_logical_volume(
        &self,
        volume_group: &str,
        name: &str,
    ) -> Result<(), BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.check(Op::Remove)?;
        let removed = self
            .state
            .lock()
            .lvs
            .remove(&(volume_group.to_owned(), name.to_owned()));
        if removed.is_none() {
            return Err(BackendError::NotFound(format!(
                "logical volume {volume_group}/{name}"
            )));
        }
        self.acknowledge().await;
        Ok(())
    }

    async fn extend_logical_volume(
        &self,
        volume_group: &str,
        name: &str,
        size_bytes: u64,
    ) -> Result<LogicalVolume, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.extends.fetch_add(1, Ordering::SeqCst);
        self.check(Op::Extend)?;
        let mut state = self.state.lock();
        let lv = state
            .lvs
            .get_mut(&(volume_group.to_owned(), name.to_owned()))
            .ok_or_else(|| BackendError::NotFound(format!("logical volume {name}")))?;
        lv.size_bytes = size_bytes;
        Ok(lv.clone())
    }

    async fn mount_device(&self, req: &MountRequest) -> Result<(), BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.mounts.fetch_add(1, Ordering::SeqCst);
        self.check(Op::Mount).map_err(|e| BackendError::Mount {
            path: req.target.clone(),
            reason: e.to_string(),
        })?;
        let mut state = self.state.lock();
        let fs_type = state
            .formatted
            .entry(req.device.clone())
            .or_insert_with(|| req.fs_type.clone())
            .clone();
        state.mounts.insert(
            req.target.clone(),
            MountPoint {
                source: req.device.clone(),
                target: req.target.clone(),
                fs_type,
                read_only: req.read_only,
            },
        );
        Ok(())
    }

    async fn bind_mount(
        &self,
        source: &str,
        target: &str,
        read_only: bool,
    ) -> Result<(), BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.mounts.fetch_add(1, Ordering::SeqCst);
        self.check(Op::Mount)?;
        let mut state = self.state.lock();
        let staged = state
            .mounts
            .get(source)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("mount point {source}")))?;
        state.mounts.insert(
            target.to_owned(),
            MountPoint {
                target: target.to_owned(),
                read_only,
                ..staged
            },
        );
        Ok(())
    }

    async fn unmount(&self, target: &str) -> Result<(), BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.check(Op::Unmount).map_err(|e| BackendError::Unmount {
            path: target.to_owned(),
            reason: e.to_string(),
        })?;
        self.state.lock().mounts.remove(target);
        Ok(())
    }

    async fn mount_point(&self, target: &str) -> Result<Option<MountPoint>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().mounts.get(target).cloned())
    }

    async fn canonical_device(&self, path: &str) -> Result<String, BackendError> {
        Ok(path.to_owned())
    }

    async fn grow_filesystem(&self, _device: &str, mount_path: &str) -> Result<(), BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.is_mounted(mount_path) {
            return Err(BackendError::NotFound(format!("mount point {mount_path}")));
        }
        Ok(())
    }
}
