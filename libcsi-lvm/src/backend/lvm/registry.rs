//! Catalog of provisioned volumes and snapshots.
//!
//! [`VolumeRegistry`] is pure bookkeeping: it never talks to the backend.
//! All maps live behind one mutex so idempotency checks observe volumes and
//! snapshots consistently.  Listings are ordered by id and paginated with the
//! last returned id as the continuation token, which keeps pages stable when
//! unrelated entries are inserted between calls.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CsiError;
use crate::types::{Page, Snapshot, SnapshotId, Volume, VolumeId};

/// Serializable copy of the registry contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryImage {
    /// Live volumes in id order.
    #[serde(default)]
    pub volumes: Vec<Volume>,
    /// Live snapshots in id order.
    #[serde(default)]
    pub snapshots: Vec<Snapshot>,
}

#[derive(Default)]
struct State {
    volumes: BTreeMap<VolumeId, Volume>,
    volume_names: HashMap<String, VolumeId>,
    snapshots: BTreeMap<SnapshotId, Snapshot>,
    snapshot_names: HashMap<(VolumeId, String), SnapshotId>,
    snapshots_by_source: HashMap<VolumeId, BTreeSet<SnapshotId>>,
}

impl State {
    fn insert_volume(&mut self, volume: Volume) -> Result<(), CsiError> {
        if let Some(owner) = self.volume_names.get(&volume.name)
            && *owner != volume.volume_id
        {
            return Err(CsiError::VolumeAlreadyExists(volume.name));
        }
        if let Some(existing) = self.volumes.get(&volume.volume_id)
            && (existing.name != volume.name || existing.volume_group != volume.volume_group)
        {
            return Err(CsiError::VolumeAlreadyExists(volume.volume_id.0));
        }
        self.volume_names
            .insert(volume.name.clone(), volume.volume_id.clone());
        self.volumes.insert(volume.volume_id.clone(), volume);
        Ok(())
    }

    fn insert_snapshot(&mut self, snapshot: Snapshot) -> Result<(), CsiError> {
        let key = (snapshot.source_volume_id.clone(), snapshot.name.clone());
        if let Some(owner) = self.snapshot_names.get(&key)
            && *owner != snapshot.snapshot_id
        {
            return Err(CsiError::SnapshotAlreadyExists(snapshot.name));
        }
        if let Some(existing) = self.snapshots.get(&snapshot.snapshot_id)
            && (existing.name != snapshot.name
                || existing.source_volume_id != snapshot.source_volume_id)
        {
            return Err(CsiError::SnapshotAlreadyExists(snapshot.snapshot_id.0));
        }
        self.snapshot_names.insert(key, snapshot.snapshot_id.clone());
        self.snapshots_by_source
            .entry(snapshot.source_volume_id.clone())
            .or_default()
            .insert(snapshot.snapshot_id.clone());
        self.snapshots.insert(snapshot.snapshot_id.clone(), snapshot);
        Ok(())
    }
}

/// Build one page from an id-ordered iterator.
fn paginate<T>(
    mut items: impl Iterator<Item = T>,
    max_entries: usize,
    token_of: impl Fn(&T) -> String,
) -> Page<T> {
    let limit = if max_entries == 0 {
        usize::MAX
    } else {
        max_entries
    };
    let entries: Vec<T> = items.by_ref().take(limit).collect();
    let next_token = if entries.len() == limit && items.next().is_some() {
        entries.last().map(token_of)
    } else {
        None
    };
    Page {
        entries,
        next_token,
    }
}

/// Lower bound for a listing continuing after `token`.
fn after<K: From<String>>(token: Option<&str>) -> Bound<K> {
    match token {
        Some(t) if !t.is_empty() => Bound::Excluded(K::from(t.to_owned())),
        _ => Bound::Unbounded,
    }
}

/// In-memory catalog of volumes and snapshots.
#[derive(Default)]
pub struct VolumeRegistry {
    state: Mutex<State>,
}

impl VolumeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // -- volumes ------------------------------------------------------------

    pub fn volume(&self, id: &VolumeId) -> Option<Volume> {
        self.state.lock().volumes.get(id).cloned()
    }

    pub fn volume_by_name(&self, name: &str) -> Option<Volume> {
        let state = self.state.lock();
        state
            .volume_names
            .get(name)
            .and_then(|id| state.volumes.get(id))
            .cloned()
    }

    /// Record a volume.  Re-inserting the same `(id, name, volume group)`
    /// replaces it; a name already owned by another id, or an id recorded in
    /// another volume group, is rejected.
    pub fn insert_volume(&self, volume: Volume) -> Result<(), CsiError> {
        self.state.lock().insert_volume(volume)
    }

    /// Apply `update` to a recorded volume.  Identity fields must not change.
    pub fn update_volume(&self, id: &VolumeId, update: impl FnOnce(&mut Volume)) -> Option<Volume> {
        let mut state = self.state.lock();
        let volume = state.volumes.get_mut(id)?;
        update(volume);
        Some(volume.clone())
    }

    /// Forget a volume.  Its snapshots stay.
    pub fn remove_volume(&self, id: &VolumeId) -> Option<Volume> {
        let mut state = self.state.lock();
        let volume = state.volumes.remove(id)?;
        state.volume_names.remove(&volume.name);
        Some(volume)
    }

    pub fn list_volumes(&self, starting_token: Option<&str>, max_entries: usize) -> Page<Volume> {
        let state = self.state.lock();
        let items = state
            .volumes
            .range((after::<VolumeId>(starting_token), Bound::Unbounded))
            .map(|(_, v)| v.clone());
        paginate(items, max_entries, |v| v.volume_id.0.clone())
    }

    // -- snapshots ----------------------------------------------------------

    pub fn snapshot(&self, id: &SnapshotId) -> Option<Snapshot> {
        self.state.lock().snapshots.get(id).cloned()
    }

    pub fn snapshot_by_name(&self, source: &VolumeId, name: &str) -> Option<Snapshot> {
        let state = self.state.lock();
        state
            .snapshot_names
            .get(&(source.clone(), name.to_owned()))
            .and_then(|id| state.snapshots.get(id))
            .cloned()
    }

    pub fn insert_snapshot(&self, snapshot: Snapshot) -> Result<(), CsiError> {
        self.state.lock().insert_snapshot(snapshot)
    }

    pub fn remove_snapshot(&self, id: &SnapshotId) -> Option<Snapshot> {
        let mut state = self.state.lock();
        let snapshot = state.snapshots.remove(id)?;
        state
            .snapshot_names
            .remove(&(snapshot.source_volume_id.clone(), snapshot.name.clone()));
        if let Some(ids) = state.snapshots_by_source.get_mut(&snapshot.source_volume_id) {
            ids.remove(id);
            if ids.is_empty() {
                state.snapshots_by_source.remove(&snapshot.source_volume_id);
            }
        }
        Some(snapshot)
    }

    /// Snapshots in id order, optionally restricted to one source volume.
    pub fn list_snapshots(
        &self,
        source: Option<&VolumeId>,
        starting_token: Option<&str>,
        max_entries: usize,
    ) -> Page<Snapshot> {
        let state = self.state.lock();
        let bound = (after::<SnapshotId>(starting_token), Bound::Unbounded);
        match source {
            None => {
                let items = state.snapshots.range(bound).map(|(_, s)| s.clone());
                paginate(items, max_entries, |s| s.snapshot_id.0.clone())
            }
            Some(source) => {
                let ids = state.snapshots_by_source.get(source);
                let items = ids
                    .into_iter()
                    .flat_map(|ids| ids.range(bound.clone()))
                    .filter_map(|id| state.snapshots.get(id).cloned());
                paginate(items, max_entries, |s| s.snapshot_id.0.clone())
            }
        }
    }

    // -- persistence --------------------------------------------------------

    /// Copy of the current contents.
    pub fn image(&self) -> RegistryImage {
        let state = self.state.lock();
        RegistryImage {
            volumes: state.volumes.values().cloned().collect(),
            snapshots: state.snapshots.values().cloned().collect(),
        }
    }

    /// Replace the contents with `image`.  Conflicting entries are skipped;
    /// returns how many entries were loaded.
    pub fn restore(&self, image: RegistryImage) -> usize {
        let mut state = State::default();
        let mut loaded = 0;
        for volume in image.volumes {
            let id = volume.volume_id.clone();
            match state.insert_volume(volume) {
                Ok(()) => loaded += 1,
                Err(e) => warn!(volume_id = %id, error = %e, "skipping conflicting volume record"),
            }
        }
        for snapshot in image.snapshots {
            let id = snapshot.snapshot_id.clone();
            match state.insert_snapshot(snapshot) {
                Ok(()) => loaded += 1,
                Err(e) => {
                    warn!(snapshot_id = %id, error = %e, "skipping conflicting snapshot record")
                }
            }
        }
        *self.state.lock() = state;
        loaded
    }

    /// Number of live volumes and snapshots.
    pub fn counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.volumes.len(), state.snapshots.len())
    }
}
