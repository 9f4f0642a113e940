//! Logical volume groups
//!
//! A group concatenates its members into one address space and hands it
//! out to logical volumes as extents. The master volume at the end of
//! member 0's data region holds the table of contents and volume entries.
//!
//! Every volume change writes the new volume entry into a free slot
//! first, then commits the table of contents, the members' free extent
//! lists and the headers under the next sequence number. An entry whose
//! sequence is newer than the committed one is debris from an interrupted
//! change and is ignored when the group is loaded.

use crate::directory::{DirectoryGeometry, LogicalVolumeDirectory};
use crate::member::Member;
use crate::set::{RaidSet, SetState};
use crate::volume::{LogicalVolume, VolumeInfo};
use std::cmp::Reverse;
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, info, warn};
use volset_common::{
    Error, LocationHint, MemberId, MemberState, Result, SetLevel, VolumeId, VolumeSpec, VolumeType,
};
use volset_storage::extent::{push_merged, truncate_released};
use volset_storage::layout::{MIN_LVG_VERSION, align_up};
use volset_storage::{Extent, ExtentAllocator, MemberDevice};

/// Granularity of volume allocations
pub const ALLOCATION_UNIT: u64 = 4096;

/// Volume directory and space accounting of a group
#[derive(Clone)]
pub(crate) struct LvgState {
    pub allocator: ExtentAllocator,
    pub directory: LogicalVolumeDirectory,
}

/// Where the master volume lives: member 0's device, the offset on it,
/// and the extent in group coordinates
fn master_location(set: &RaidSet, state: &SetState) -> Result<(Arc<dyn MemberDevice>, u64, Extent)> {
    let first = state
        .members
        .first()
        .ok_or_else(|| Error::member_state("group has no members"))?;
    let data_size = first.data_size(set.chunk_size);
    let base = data_size
        .checked_sub(state.secondary_size)
        .ok_or(Error::InsufficientSpace {
            required: state.secondary_size,
            available: data_size,
        })?;
    Ok((
        first.device()?.clone(),
        base,
        Extent::new(first.group_offset + base, state.secondary_size),
    ))
}

fn member_range(member: &Member, chunk_size: u64) -> Extent {
    Extent::new(member.group_offset, member.data_size(chunk_size))
}

impl LvgState {
    /// Directory geometry recorded for the group
    fn geometry(set: &RaidSet, state: &SetState) -> Result<DirectoryGeometry> {
        let geometry = DirectoryGeometry::new(state.volume_slots, set.chunk_size);
        if geometry.secondary_size != state.secondary_size {
            return Err(Error::format(format!(
                "{} volume slots need {} bytes of directory, header records {}",
                state.volume_slots, geometry.secondary_size, state.secondary_size
            )));
        }
        Ok(geometry)
    }

    /// Allocator over the group with the master volume, the given volume
    /// extents and the gaps between member ranges marked used
    fn allocator<'a>(
        set: &RaidSet,
        state: &SetState,
        master: Extent,
        volumes: impl Iterator<Item = &'a LogicalVolume>,
    ) -> Result<ExtentAllocator> {
        let mut used = vec![master];
        used.extend(volumes.flat_map(|v| v.extents.iter().copied()));
        let end = state
            .members
            .iter()
            .map(|m| m.group_offset + m.data_size(set.chunk_size))
            .max()
            .unwrap_or(0);
        let mut allocator = ExtentAllocator::with_used(used, end)?;

        let mut ranges: Vec<Extent> = state.members.iter().map(|m| member_range(m, set.chunk_size)).collect();
        ranges.sort_unstable();
        let mut cursor = 0;
        for range in ranges {
            if range.offset > cursor {
                allocator.reserve(Extent::new(cursor, range.offset - cursor))?;
            }
            cursor = cursor.max(range.end());
        }
        Ok(allocator)
    }

    /// An empty directory for a group written for the first time
    pub fn format(set: &RaidSet, state: &SetState) -> Result<Self> {
        let geometry = Self::geometry(set, state)?;
        let (device, base, master) = master_location(set, state)?;
        let directory = LogicalVolumeDirectory::format(
            device,
            base,
            geometry,
            VolumeId::from_uuid(set.id.as_uuid()),
            master,
        );
        let allocator = Self::allocator(set, state, master, std::iter::empty())?;
        Ok(Self { allocator, directory })
    }

    /// Load the committed directory from member 0
    pub fn load(set: &RaidSet, state: &SetState) -> Result<Self> {
        let first = state
            .members
            .first()
            .ok_or_else(|| Error::member_state("group has no members"))?;
        if first.state != MemberState::Open {
            return Err(Error::member_state(format!(
                "member 0 ({}) is {:?}",
                first.device_name(),
                first.state
            )));
        }
        let geometry = Self::geometry(set, state)?;
        let (device, base, master) = master_location(set, state)?;
        let directory = LogicalVolumeDirectory::load(
            device,
            base,
            geometry,
            VolumeId::from_uuid(set.id.as_uuid()),
            master,
            state.sequence,
        )?;
        let allocator = Self::allocator(set, state, master, directory.volumes())?;
        Ok(Self { allocator, directory })
    }

    /// Free extents inside a member's range, keeping the largest when
    /// they outnumber the list's capacity
    pub fn member_free_extents(&self, member: &Member, chunk_size: u64, capacity: usize) -> Vec<Extent> {
        let range = member_range(member, chunk_size);
        let mut free = self.allocator.free_extents_in(range.offset..range.end());
        if free.len() > capacity {
            warn!(
                member = %member.id,
                free = free.len(),
                capacity,
                "free extent list truncated"
            );
            free.sort_unstable_by_key(|e| Reverse(e.length));
            free.truncate(capacity);
            free.sort_unstable();
        }
        free
    }
}

impl RaidSet {
    /// Load the volume directory and check every member's extent list
    pub(crate) fn load_lvg(&self) {
        let mut next = self.state.read().clone();
        match LvgState::load(self, &next) {
            Ok(lvg) => {
                debug!(set = %self.id, volumes = lvg.directory.len(), "loaded volume directory");
                next.lvg = Some(lvg);
            }
            Err(e) => {
                warn!(set = %self.id, error = %e, "volume directory unavailable");
                next.lvg_error = Some(e.to_string());
            }
        }

        let mut broken = Vec::new();
        for member in next.members.iter().filter(|m| m.state == MemberState::Open) {
            let result = member
                .primary_store(self.chunk_size, next.primary_size)
                .and_then(|s| s.read_extent_list());
            match result {
                Ok((sequence, _)) if sequence > next.sequence => {
                    warn!(set = %self.id, member = %member.id, sequence, "ignoring extent list debris");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(set = %self.id, member = %member.id, error = %e, "member metadata unusable");
                    broken.push(member.id);
                }
            }
        }
        for id in broken {
            if let Some(member) = next.member_mut(id) {
                member.state = MemberState::Broken;
            }
        }
        *self.state.write() = next;
    }

    /// Check that volumes can be created, resized or destroyed
    fn check_lvg_writable(&self, state: &SetState) -> Result<()> {
        self.check_lvg_readable(state)?;
        if state.version < MIN_LVG_VERSION {
            return Err(Error::VersionUnsupported {
                found: state.version,
                required: MIN_LVG_VERSION,
            });
        }
        Ok(())
    }

    fn check_lvg_readable(&self, state: &SetState) -> Result<()> {
        if self.level != SetLevel::Lvg {
            return Err(Error::invalid_argument(format!(
                "set {} is a {} set, not a volume group",
                self.id, self.level
            )));
        }
        if !state.committed {
            return Err(Error::member_state("group has not been written yet"));
        }
        if state.lvg.is_none() {
            return Err(Error::member_state(
                state
                    .lvg_error
                    .clone()
                    .unwrap_or_else(|| "volume directory unavailable".to_string()),
            ));
        }
        Ok(())
    }

    fn hint_window(&self, state: &SetState, hint: LocationHint) -> Result<Range<u64>> {
        let end = state.group_end(self.chunk_size);
        match hint {
            LocationHint::Any => Ok(0..end),
            LocationHint::After(offset) => Ok(offset.min(end)..end),
            LocationHint::OnMember(id) => {
                let member = state
                    .members
                    .iter()
                    .find(|m| m.id == id)
                    .ok_or_else(|| Error::MemberNotFound(id.to_string()))?;
                let range = member_range(member, self.chunk_size);
                Ok(range.offset..range.end())
            }
        }
    }

    /// Create a logical volume
    pub fn create_volume(&self, spec: VolumeSpec) -> Result<VolumeId> {
        let guard = self.update.lock();
        let mut next = self.state.read().clone();
        self.check_lvg_writable(&next)?;

        if spec.size == 0 {
            return Err(Error::invalid_argument("volume size must be positive"));
        }
        if spec.kind.is_empty() || spec.kind.contains(VolumeType::MASTER) {
            return Err(Error::invalid_argument(format!("invalid volume type {:#x}", spec.kind.bits())));
        }
        let window = self.hint_window(&next, spec.hint)?;
        let sequence = next.sequence + 1;
        let lvg = next
            .lvg
            .as_mut()
            .ok_or_else(|| Error::member_state("volume directory unavailable"))?;

        match (spec.kind.needs_parent(), spec.parent) {
            (true, None) => {
                return Err(Error::invalid_argument("snapshots and bitmaps need a parent volume"));
            }
            (false, Some(_)) => {
                return Err(Error::invalid_argument("only snapshots and bitmaps take a parent"));
            }
            (true, Some(parent)) if lvg.directory.get(&parent).is_none() => {
                return Err(Error::VolumeNotFound(parent.to_string()));
            }
            _ => {}
        }

        let pieces = lvg
            .allocator
            .allocate_in(align_up(spec.size, ALLOCATION_UNIT), window)?;
        let mut volume = LogicalVolume::new(spec.name, spec.kind, spec.parent, spec.size);
        for piece in pieces {
            push_merged(&mut volume.extents, piece);
        }
        volume.sequence = sequence;
        volume.slot_offset = lvg.directory.free_slot()?;
        lvg.directory.add_entry(volume.clone())?;
        lvg.directory.write_volume_entry(&volume)?;

        let sequence = self.commit(&mut next, None)?;
        *self.state.write() = next;
        drop(guard);

        info!(
            set = %self.id,
            volume = %volume.id,
            name = %volume.name,
            size = volume.size(),
            extents = volume.extents.len(),
            sequence,
            "created volume"
        );
        Ok(volume.id)
    }

    /// Resize a logical volume, returning its new calculated size
    pub fn resize_volume(&self, id: VolumeId, new_size: u64) -> Result<u64> {
        let guard = self.update.lock();
        let mut next = self.state.read().clone();
        self.check_lvg_writable(&next)?;
        if new_size == 0 {
            return Err(Error::invalid_argument("volume size must be positive"));
        }
        let sequence = next.sequence + 1;
        let lvg = next
            .lvg
            .as_mut()
            .ok_or_else(|| Error::member_state("volume directory unavailable"))?;
        let current = lvg
            .directory
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::VolumeNotFound(id.to_string()))?;

        let target = align_up(new_size, ALLOCATION_UNIT);
        if new_size == current.claimed_size && target == current.size() {
            return Ok(current.size());
        }

        let mut volume = current.clone();
        if target < volume.size() {
            let released = truncate_released(&mut volume.extents, target);
            lvg.allocator.release_all(&released)?;
        } else if target > volume.size() {
            let grown = lvg.allocator.grow_last_extent(&mut volume.extents, target);
            if grown < target {
                for piece in lvg.allocator.allocate(target - grown)? {
                    push_merged(&mut volume.extents, piece);
                }
            }
        }
        volume.claimed_size = new_size;
        volume.sequence = sequence;
        // the old entry stays intact until the new table of contents is committed
        volume.slot_offset = lvg.directory.free_slot()?;
        lvg.directory.update_entry(volume.clone())?;
        lvg.directory.write_volume_entry(&volume)?;

        let sequence = self.commit(&mut next, None)?;
        *self.state.write() = next;
        drop(guard);

        info!(
            set = %self.id,
            volume = %id,
            from = current.size(),
            to = volume.size(),
            sequence,
            "resized volume"
        );
        Ok(volume.size())
    }

    /// Destroy a logical volume and free its extents
    pub fn destroy_volume(&self, id: VolumeId) -> Result<()> {
        let guard = self.update.lock();
        let mut next = self.state.read().clone();
        self.check_lvg_writable(&next)?;
        if id.as_uuid() == self.id.as_uuid() {
            return Err(Error::invalid_argument("the master volume cannot be destroyed"));
        }
        let lvg = next
            .lvg
            .as_mut()
            .ok_or_else(|| Error::member_state("volume directory unavailable"))?;
        if lvg.directory.volumes().any(|v| v.parent == Some(id)) {
            return Err(Error::member_state(format!("volume {id} still has dependent volumes")));
        }
        let volume = lvg.directory.remove_entry(&id)?;
        lvg.allocator.release_all(&volume.extents)?;

        let sequence = self.commit(&mut next, None)?;
        *self.state.write() = next;
        drop(guard);

        info!(set = %self.id, volume = %id, name = %volume.name, sequence, "destroyed volume");
        Ok(())
    }

    /// True if the group lists the volume
    #[must_use]
    pub fn holds_volume(&self, id: VolumeId) -> bool {
        self.state
            .read()
            .lvg
            .as_ref()
            .is_some_and(|l| l.directory.get(&id).is_some())
    }

    fn with_volume<T>(&self, id: VolumeId, f: impl FnOnce(&LogicalVolume) -> Result<T>) -> Result<T> {
        let state = self.state.read();
        self.check_lvg_readable(&state)?;
        let volume = state
            .lvg
            .as_ref()
            .and_then(|l| l.directory.get(&id))
            .ok_or_else(|| Error::VolumeNotFound(id.to_string()))?;
        f(volume)
    }

    /// Extents of a volume in group coordinates
    pub fn volume_extents(&self, id: VolumeId) -> Result<Vec<Extent>> {
        self.with_volume(id, |v| Ok(v.extents.clone()))
    }

    /// Properties of a volume
    pub fn volume_info(&self, id: VolumeId) -> Result<VolumeInfo> {
        self.with_volume(id, |v| Ok(v.info()))
    }

    /// Volumes of the group, optionally only those with extents on one member
    pub fn list_volumes(&self, member: Option<MemberId>) -> Result<Vec<VolumeInfo>> {
        let state = self.state.read();
        self.check_lvg_readable(&state)?;
        let range = member
            .map(|id| {
                state
                    .members
                    .iter()
                    .find(|m| m.id == id)
                    .map(|m| member_range(m, self.chunk_size))
                    .ok_or_else(|| Error::MemberNotFound(id.to_string()))
            })
            .transpose()?;
        Ok(state
            .lvg
            .as_ref()
            .map(|l| {
                l.directory
                    .list_volumes(range.as_ref())
                    .into_iter()
                    .map(LogicalVolume::info)
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Read from a volume's address space
    pub fn read_volume(&self, id: VolumeId, offset: u64, buf: &mut [u8]) -> Result<()> {
        let pieces = self.with_volume(id, |v| v.map(offset, buf.len() as u64))?;
        for (group_offset, length, at) in pieces {
            self.read(group_offset, &mut buf[at..at + length as usize])?;
        }
        Ok(())
    }

    /// Write to a volume's address space
    pub fn write_volume(&self, id: VolumeId, offset: u64, data: &[u8]) -> Result<()> {
        let pieces = self.with_volume(id, |v| {
            if v.kind.contains(VolumeType::SNAPSHOT_RO) {
                return Err(Error::invalid_argument(format!("volume {id} is read-only")));
            }
            v.map(offset, data.len() as u64)
        })?;
        for (group_offset, length, at) in pieces {
            self.write(group_offset, &data[at..at + length as usize])?;
        }
        Ok(())
    }
}
