//! Engine: the registry of sets and the entry point for every operation
//!
//! Sets are created empty, populated with members and written with
//! [`Engine::update_set`]. Sets already on disk are found again with
//! [`Engine::assemble`], which groups devices by the set their header
//! names.

use crate::member::MemberInfo;
use crate::rebuild::{RebuildMode, RebuildStatus};
use crate::set::{RaidSet, SetProperties};
use crate::volume::VolumeInfo;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use volset_common::{
    EngineConfig, Error, MemberId, MemberRole, Result, SetConfig, SetId, VolumeId, VolumeSpec,
};
use volset_storage::{Extent, MemberDevice, MemberHeader, MemberHeaderStore};

/// Set engine
pub struct Engine {
    config: EngineConfig,
    sets: RwLock<HashMap<SetId, Arc<RaidSet>>>,
}

impl Engine {
    /// Create an engine with no sets
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            sets: RwLock::new(HashMap::new()),
        })
    }

    /// Engine configuration
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Look up a set
    pub fn set(&self, id: SetId) -> Result<Arc<RaidSet>> {
        self.sets
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::SetNotFound(id.to_string()))
    }

    fn volume_set(&self, id: VolumeId) -> Result<Arc<RaidSet>> {
        self.sets
            .read()
            .values()
            .find(|s| s.holds_volume(id))
            .cloned()
            .ok_or_else(|| Error::VolumeNotFound(id.to_string()))
    }

    /// Create an empty set; it reaches disk on its first update
    pub fn create_set(&self, config: SetConfig) -> Result<SetId> {
        let set = RaidSet::create(&config, &self.config)?;
        let id = set.id();
        self.sets.write().insert(id, set);
        Ok(id)
    }

    /// Properties of every known set, by name
    #[must_use]
    pub fn list_sets(&self) -> Vec<SetProperties> {
        let mut sets: Vec<SetProperties> = self.sets.read().values().map(|s| s.properties()).collect();
        sets.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        sets
    }

    /// Add a member or hot spare
    pub fn add_member(&self, set: SetId, device: Arc<dyn MemberDevice>, role: MemberRole) -> Result<MemberId> {
        self.set(set)?.add_member(device, role)
    }

    /// Remove a member or hot spare
    pub fn remove_member(&self, set: SetId, member: MemberId) -> Result<()> {
        self.set(set)?.remove_member(member)
    }

    /// Commit a set's configuration; returns the new sequence number
    pub fn update_set(&self, set: SetId) -> Result<u32> {
        self.set(set)?.update()
    }

    /// Erase a set from its members and forget it
    pub fn destroy_set(&self, set: SetId) -> Result<()> {
        let removed = self
            .sets
            .write()
            .remove(&set)
            .ok_or_else(|| Error::SetNotFound(set.to_string()))?;
        removed.destroy()
    }

    /// Stop using a set without touching its members
    pub fn close_set(&self, set: SetId) -> Result<()> {
        let removed = self
            .sets
            .write()
            .remove(&set)
            .ok_or_else(|| Error::SetNotFound(set.to_string()))?;
        removed.close();
        Ok(())
    }

    /// Find the sets recorded on `devices` and bring them online.
    ///
    /// Devices without a readable header are skipped. Sets that are
    /// already known are left alone. Returns the sets assembled.
    pub fn assemble(&self, devices: Vec<Arc<dyn MemberDevice>>) -> Result<Vec<SetId>> {
        let mut groups: HashMap<Uuid, Vec<(MemberHeader, Arc<dyn MemberDevice>)>> = HashMap::new();
        for device in devices {
            match MemberHeaderStore::new(device.clone()).read() {
                Ok(header) => groups.entry(header.set_uuid).or_default().push((header, device)),
                Err(e) if e.is_device_failure() => {
                    warn!(device = device.name(), error = %e, "cannot read member header");
                }
                Err(e) => debug!(device = device.name(), error = %e, "no member header"),
            }
        }

        let mut assembled = Vec::new();
        for (uuid, found) in groups {
            let id = SetId::from_uuid(uuid);
            if self.sets.read().contains_key(&id) {
                warn!(set = %id, "set is already assembled");
                continue;
            }
            match RaidSet::assemble(id, found, &self.config) {
                Ok(set) => {
                    self.sets.write().insert(id, set.clone());
                    set.resume_rebuilds();
                    assembled.push(id);
                }
                Err(e) => error!(set = %id, error = %e, "failed to assemble set"),
            }
        }
        assembled.sort_unstable();
        info!(sets = assembled.len(), "assembly finished");
        Ok(assembled)
    }

    /// Properties of a set
    pub fn get_set_properties(&self, set: SetId) -> Result<SetProperties> {
        Ok(self.set(set)?.properties())
    }

    /// Properties of one member
    pub fn get_member_properties(&self, set: SetId, member: MemberId) -> Result<MemberInfo> {
        self.set(set)?.member_properties(member)
    }

    /// Properties of every member of a set
    pub fn list_members(&self, set: SetId) -> Result<Vec<MemberInfo>> {
        Ok(self.set(set)?.members())
    }

    /// Read from a set's logical address space
    pub fn read(&self, set: SetId, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.set(set)?.read(offset, buf)
    }

    /// Write to a set's logical address space
    pub fn write(&self, set: SetId, offset: u64, data: &[u8]) -> Result<()> {
        self.set(set)?.write(offset, data)
    }

    /// Report a member as failed
    pub fn fail_member(&self, set: SetId, member: MemberId) -> Result<()> {
        self.set(set)?.fail_member(member)
    }

    /// Queue a rebuild of a mirror member
    pub fn start_rebuild(&self, set: SetId, member: MemberId, mode: RebuildMode) -> Result<()> {
        self.set(set)?.start_rebuild(member, mode)
    }

    /// Stop a mirror's running rebuild
    pub fn cancel_rebuild(&self, set: SetId) -> Result<()> {
        self.set(set)?.cancel_rebuild()
    }

    /// Rebuild progress of a mirror
    pub fn rebuild_status(&self, set: SetId) -> Result<RebuildStatus> {
        self.set(set)?.rebuild_status()
    }

    /// Wait for a mirror's rebuilds to finish
    pub fn wait_for_rebuild(&self, set: SetId, timeout: Duration) -> Result<RebuildStatus> {
        self.set(set)?.wait_for_rebuild(timeout)
    }

    /// Create a logical volume in a group
    pub fn create_volume(&self, lvg: SetId, spec: VolumeSpec) -> Result<VolumeId> {
        self.set(lvg)?.create_volume(spec)
    }

    /// Resize a logical volume; returns its new calculated size
    pub fn resize_volume(&self, volume: VolumeId, new_size: u64) -> Result<u64> {
        self.volume_set(volume)?.resize_volume(volume, new_size)
    }

    /// Destroy a logical volume
    pub fn destroy_volume(&self, volume: VolumeId) -> Result<()> {
        self.volume_set(volume)?.destroy_volume(volume)
    }

    /// Extents of a logical volume in group coordinates
    pub fn get_volume_extents(&self, volume: VolumeId) -> Result<Vec<Extent>> {
        self.volume_set(volume)?.volume_extents(volume)
    }

    /// Properties of a logical volume
    pub fn get_volume_properties(&self, volume: VolumeId) -> Result<VolumeInfo> {
        self.volume_set(volume)?.volume_info(volume)
    }

    /// Volumes of a group, optionally only those touching one member
    pub fn list_volumes(&self, lvg: SetId, member: Option<MemberId>) -> Result<Vec<VolumeInfo>> {
        self.set(lvg)?.list_volumes(member)
    }

    /// Read from a logical volume
    pub fn read_volume(&self, volume: VolumeId, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.volume_set(volume)?.read_volume(volume, offset, buf)
    }

    /// Write to a logical volume
    pub fn write_volume(&self, volume: VolumeId, offset: u64, data: &[u8]) -> Result<()> {
        self.volume_set(volume)?.write_volume(volume, offset, data)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for set in self.sets.get_mut().values() {
            set.close();
        }
    }
}
