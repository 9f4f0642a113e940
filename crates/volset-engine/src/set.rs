//! Set runtime
//!
//! A [`RaidSet`] holds the live configuration of one set and carries out
//! every change to it. Changes are made on a copy of the [`SetState`],
//! committed to disk and only then swapped in, so a failed operation
//! leaves the in-memory set as it was.
//!
//! Commit order for every change: lowest-level structures first (volume
//! entries, written by the caller), then the structures referencing them
//! (table of contents, primary metadata), and the member headers carrying
//! the new sequence number last.

use crate::assembler::{
    CapabilityRules, ConcatMap, ExtentMapping, MemberRange, MirrorMap, SetLayout, StripeMap,
};
use crate::directory::DirectoryGeometry;
use crate::lvg::LvgState;
use crate::member::{Member, MemberInfo, usable_chunks};
use crate::rebuild::{RebuildCoordinator, RebuildMode, RebuildStatus, Route};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use uuid::Uuid;
use volset_common::config::validate_chunk_size;
use volset_common::{
    EngineConfig, Error, MemberId, MemberRole, MemberState, RemovalPolicy, Result, SetConfig,
    SetId, SetLevel,
};
use volset_storage::extent::Extent;
use volset_storage::header::header_offset;
use volset_storage::layout::{
    EXTENT_RECORD_SIZE, HEADER_VERSION, MIN_QUICK_REBUILD_VERSION, PRIMARY_HEADER_SIZE,
};
use volset_storage::primary::{bitmap_block_size, extent_list_block_size, primary_offset};
use volset_storage::{
    HeaderProperties, MemberDevice, MemberHeader, PrimaryMetadataStore, RebuildBitmap, size_bitmap,
};

/// Live configuration of a set, replaced as a whole on commit
#[derive(Clone)]
pub(crate) struct SetState {
    pub name: String,
    pub sequence: u32,
    pub version: u32,
    pub committed: bool,
    pub quick_rebuild: bool,
    /// Data members, position equals index
    pub members: Vec<Member>,
    pub spares: Vec<Member>,
    pub primary_size: u64,
    pub secondary_size: u64,
    pub volume_slots: u32,
    pub layout: SetLayout,
    pub lvg: Option<LvgState>,
    /// Why the volume directory could not be loaded
    pub lvg_error: Option<String>,
}

impl SetState {
    pub fn member(&self, id: MemberId) -> Option<&Member> {
        self.members.iter().chain(&self.spares).find(|m| m.id == id)
    }

    pub fn member_mut(&mut self, id: MemberId) -> Option<&mut Member> {
        self.members
            .iter_mut()
            .chain(self.spares.iter_mut())
            .find(|m| m.id == id)
    }

    /// True when some data member is not serving I/O
    pub fn is_degraded(&self) -> bool {
        self.members.iter().any(|m| m.state != MemberState::Open)
    }

    /// Chunk count shared by mirror and stripe members
    pub fn common_chunks(&self) -> u64 {
        self.members.first().map_or(0, |m| m.chunk_count)
    }

    /// End of the group address space
    pub fn group_end(&self, chunk_size: u64) -> u64 {
        let members = self
            .members
            .iter()
            .map(|m| m.group_offset + m.data_size(chunk_size))
            .max()
            .unwrap_or(0);
        let reserved = self.lvg.as_ref().map_or(0, |l| l.allocator.end());
        members.max(reserved)
    }

    fn reindex(&mut self) {
        for (i, member) in self.members.iter_mut().enumerate() {
            member.index = Some(i as u32);
        }
    }

    fn holds_device(&self, device: &Arc<dyn MemberDevice>) -> bool {
        self.members
            .iter()
            .chain(&self.spares)
            .filter_map(|m| m.device.as_ref())
            .any(|d| std::ptr::addr_eq(Arc::as_ptr(d), Arc::as_ptr(device)))
    }

    pub fn build_layout(&self, level: SetLevel, chunk_size: u64) -> SetLayout {
        let ranges: Vec<MemberRange> = self
            .members
            .iter()
            .enumerate()
            .map(|(member, m)| MemberRange {
                member,
                start: m.group_offset,
                size: m.data_size(chunk_size),
            })
            .collect();
        let common = self.common_chunks() * chunk_size;
        match level {
            SetLevel::Concat => SetLayout::Concat(ConcatMap::new(ranges)),
            SetLevel::Lvg => SetLayout::Lvg(ConcatMap::new(ranges)),
            SetLevel::Stripe => {
                SetLayout::Stripe(StripeMap::new(self.members.len(), chunk_size, common))
            }
            SetLevel::Mirror => SetLayout::Mirror(MirrorMap::new(self.members.len(), common)),
        }
    }
}

/// Smallest header offset among the mirror's devices
fn mirror_partition(state: &SetState) -> u64 {
    state
        .members
        .iter()
        .chain(&state.spares)
        .filter_map(|m| m.device.as_ref())
        .map(|d| header_offset(d.size()).unwrap_or(0))
        .min()
        .unwrap_or(0)
}

/// Set properties reported to callers
#[derive(Clone, Debug, Serialize)]
pub struct SetProperties {
    /// Set UUID
    pub id: SetId,
    /// Human-readable name
    pub name: String,
    /// Level
    pub level: SetLevel,
    /// Committed sequence number
    pub sequence: u32,
    /// Header format version
    pub version: u32,
    /// True once the set has been written to its members
    pub committed: bool,
    /// Chunk size
    pub chunk_size: u64,
    /// Logical size in bytes
    pub size: u64,
    /// Data members
    pub member_count: usize,
    /// Hot spares
    pub spare_count: usize,
    /// Some data member is not serving I/O
    pub degraded: bool,
    /// Dirty region tracking enabled
    pub quick_rebuild: bool,
    /// Members may join after creation
    pub can_add_members: bool,
    /// Hot spares supported
    pub can_add_spares: bool,
    /// Members may differ in size
    pub sizes_can_vary: bool,
    /// Which members may leave
    pub removal_policy: RemovalPolicy,
    /// Unallocated bytes (groups only)
    pub free_space: Option<u64>,
    /// Logical volumes (groups only)
    pub volume_count: Option<usize>,
    /// Rebuild progress (mirrors only)
    pub rebuild: Option<RebuildStatus>,
}

/// A set and its runtime state
pub struct RaidSet {
    pub(crate) id: SetId,
    pub(crate) level: SetLevel,
    pub(crate) chunk_size: u64,
    pub(crate) config: EngineConfig,
    pub(crate) state: RwLock<SetState>,
    /// One metadata update at a time
    pub(crate) update: Mutex<()>,
    pub(crate) rebuild: Option<RebuildCoordinator>,
    pub(crate) this: Weak<Self>,
}

/// Device handle captured for one I/O
struct IoTarget {
    id: MemberId,
    device: Arc<dyn MemberDevice>,
}

impl RaidSet {
    fn build(id: SetId, level: SetLevel, chunk_size: u64, config: &EngineConfig, state: SetState) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id,
            level,
            chunk_size,
            config: config.clone(),
            state: RwLock::new(state),
            update: Mutex::new(()),
            rebuild: (level == SetLevel::Mirror).then(|| RebuildCoordinator::new(&config.rebuild)),
            this: this.clone(),
        })
    }

    /// Create a set that exists only in memory until its first update
    pub(crate) fn create(set: &SetConfig, config: &EngineConfig) -> Result<Arc<Self>> {
        let chunk_size = set.chunk_size.unwrap_or(config.default_chunk_size);
        validate_chunk_size(chunk_size)?;
        if set.name.is_empty() {
            return Err(Error::invalid_argument("set name must not be empty"));
        }

        let quick_rebuild = set.level == SetLevel::Mirror
            && set.quick_rebuild.unwrap_or(config.rebuild.quick_rebuild);
        let (primary_size, secondary_size, volume_slots) = if set.level == SetLevel::Lvg {
            let geometry = DirectoryGeometry::new(config.lvg.max_volumes, chunk_size);
            (
                extent_list_block_size(u64::from(config.lvg.max_extents_per_member)),
                geometry.secondary_size,
                geometry.slots,
            )
        } else {
            (0, 0, 0)
        };

        let mut state = SetState {
            name: set.name.clone(),
            sequence: 0,
            version: HEADER_VERSION,
            committed: false,
            quick_rebuild,
            members: Vec::new(),
            spares: Vec::new(),
            primary_size,
            secondary_size,
            volume_slots,
            layout: SetLayout::Concat(ConcatMap::new(Vec::new())),
            lvg: None,
            lvg_error: None,
        };
        state.layout = state.build_layout(set.level, chunk_size);

        let id = SetId::new();
        info!(set = %id, name = %set.name, level = %set.level, chunk_size, "created set");
        Ok(Self::build(id, set.level, chunk_size, config, state))
    }

    /// Rebuild a set from the headers found on its members.
    ///
    /// `found` holds every device whose header names this set. The header
    /// with the highest sequence number describes the committed set.
    pub(crate) fn assemble(
        id: SetId,
        found: Vec<(MemberHeader, Arc<dyn MemberDevice>)>,
        config: &EngineConfig,
    ) -> Result<Arc<Self>> {
        let props = found
            .iter()
            .map(|(h, _)| &h.properties)
            .max_by_key(|p| p.sequence)
            .cloned()
            .ok_or_else(|| Error::internal("assembling a set without members"))?;
        validate_chunk_size(props.chunk_size)?;
        if props.version > HEADER_VERSION {
            return Err(Error::format(format!(
                "set {id} uses header version {}, newest supported is {HEADER_VERSION}",
                props.version
            )));
        }
        let chunk_size = props.chunk_size;
        let committed = props.sequence;

        let mut members = Vec::with_capacity(props.members.len());
        for (index, uuid) in props.members.iter().enumerate() {
            let slot = found
                .iter()
                .find(|(h, _)| h.member_uuid == *uuid && h.properties.member_index == Some(index as u32));
            let member = match slot {
                Some((header, device)) => {
                    let stale = header.properties.sequence < committed;
                    if stale {
                        warn!(
                            set = %id,
                            member = %uuid,
                            found = header.properties.sequence,
                            committed,
                            "member header is stale"
                        );
                    }
                    Member {
                        id: MemberId::from_uuid(*uuid),
                        index: Some(index as u32),
                        device: Some(device.clone()),
                        // a returning mirror member waits for resync; elsewhere stale data is unusable
                        state: match (stale, props.level) {
                            (false, _) => MemberState::Open,
                            (true, SetLevel::Mirror) => MemberState::Spare,
                            (true, _) => MemberState::Broken,
                        },
                        chunk_count: header.properties.chunk_count,
                        group_offset: header.properties.group_offset,
                        sequence: header.properties.sequence,
                    }
                }
                None => {
                    warn!(set = %id, member = %uuid, index, "member is missing");
                    let size = props.member_sizes.get(index).copied().unwrap_or(0);
                    let offset = props.member_offsets.get(index).copied().unwrap_or(0);
                    Member::missing(MemberId::from_uuid(*uuid), index as u32, size / chunk_size, offset)
                }
            };
            members.push(member);
        }

        let spares = props
            .spares
            .iter()
            .filter_map(|uuid| {
                found
                    .iter()
                    .find(|(h, _)| h.member_uuid == *uuid && h.properties.member_index.is_none())
                    .map(|(h, device)| Member {
                        id: MemberId::from_uuid(*uuid),
                        index: None,
                        device: Some(device.clone()),
                        state: MemberState::Spare,
                        chunk_count: h.properties.chunk_count,
                        group_offset: 0,
                        sequence: h.properties.sequence,
                    })
            })
            .collect();

        for (header, device) in &found {
            let listed = props.members.contains(&header.member_uuid)
                || props.spares.contains(&header.member_uuid);
            if !listed {
                warn!(set = %id, device = device.name(), "ignoring device no longer in the set");
            }
        }

        let mut state = SetState {
            name: props.set_name.clone(),
            sequence: committed,
            version: props.version,
            committed: true,
            quick_rebuild: props.quick_rebuild,
            members,
            spares,
            primary_size: props.primary_size,
            secondary_size: props.secondary_size,
            volume_slots: props.volume_slots,
            layout: SetLayout::Concat(ConcatMap::new(Vec::new())),
            lvg: None,
            lvg_error: None,
        };
        state.layout = state.build_layout(props.level, chunk_size);

        let set = Self::build(id, props.level, chunk_size, config, state);
        match props.level {
            SetLevel::Mirror => {
                set.load_bitmap();
                set.record_absent_members();
            }
            SetLevel::Lvg => set.load_lvg(),
            SetLevel::Concat | SetLevel::Stripe => {}
        }

        let state = set.state.read();
        info!(
            set = %id,
            name = %state.name,
            level = %props.level,
            sequence = committed,
            members = state.members.len(),
            degraded = state.is_degraded(),
            "assembled set"
        );
        drop(state);
        Ok(set)
    }

    /// Load the dirty-region bitmap from the first in-sync member holding a valid copy
    fn load_bitmap(&self) {
        let mut next = self.state.read().clone();
        if !next.quick_rebuild || next.primary_size == 0 {
            return;
        }
        let data_size = next.common_chunks() * self.chunk_size;
        let mut loaded = None;
        let mut failed = Vec::new();

        for member in next.members.iter().filter(|m| m.state == MemberState::Open) {
            let result = member
                .primary_store(self.chunk_size, next.primary_size)
                .and_then(|s| s.read_bitmap());
            match result {
                Ok((sequence, _)) if sequence > next.sequence => {
                    warn!(set = %self.id, member = %member.id, sequence, "ignoring bitmap debris");
                }
                Ok((_, bitmap)) => {
                    let expected = RebuildBitmap::new(data_size, bitmap.bytes_per_bit());
                    if bitmap.bit_count() == expected.bit_count() {
                        loaded = Some(bitmap);
                        break;
                    }
                    warn!(set = %self.id, member = %member.id, "bitmap does not cover the data region");
                }
                Err(e) if e.is_device_failure() => {
                    warn!(set = %self.id, member = %member.id, error = %e, "bitmap read failed");
                    failed.push(member.id);
                }
                Err(e) => debug!(set = %self.id, member = %member.id, error = %e, "bitmap copy unusable"),
            }
        }

        if loaded.is_none() {
            warn!(set = %self.id, "no valid bitmap, returning members need a full rebuild");
        }
        if let Some(coordinator) = &self.rebuild {
            coordinator.io.lock().bitmap = loaded;
        }
        if !failed.is_empty() {
            for id in failed {
                if let Some(m) = next.member_mut(id) {
                    m.state = MemberState::Broken;
                }
            }
            next.layout = next.build_layout(self.level, self.chunk_size);
            *self.state.write() = next;
        }
    }

    /// Commit a new sequence when mirror members are missing or unreadable,
    /// so a copy coming back later is seen as stale and resynced
    fn record_absent_members(&self) {
        let _guard = self.update.lock();
        let mut next = self.state.read().clone();
        if !next.members.iter().any(|m| m.state == MemberState::Broken) {
            return;
        }
        match self.commit_with_bitmap(&mut next) {
            Ok(sequence) => {
                info!(set = %self.id, sequence, "recorded absent members");
                *self.state.write() = next;
            }
            Err(e) => warn!(set = %self.id, error = %e, "failed to record absent members"),
        }
    }

    /// Set UUID
    #[must_use]
    pub const fn id(&self) -> SetId {
        self.id
    }

    /// Set level
    #[must_use]
    pub const fn level(&self) -> SetLevel {
        self.level
    }

    /// Chunk size
    #[must_use]
    pub const fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Committed sequence number
    #[must_use]
    pub fn sequence(&self) -> u32 {
        self.state.read().sequence
    }

    /// Current properties
    #[must_use]
    pub fn properties(&self) -> SetProperties {
        let rebuild = self.rebuild.as_ref().map(RebuildCoordinator::status);
        let state = self.state.read();
        let caps = self.level.capabilities();
        SetProperties {
            id: self.id,
            name: state.name.clone(),
            level: self.level,
            sequence: state.sequence,
            version: state.version,
            committed: state.committed,
            chunk_size: self.chunk_size,
            size: state.layout.logical_size(),
            member_count: state.members.len(),
            spare_count: state.spares.len(),
            degraded: state.is_degraded(),
            quick_rebuild: state.quick_rebuild,
            can_add_members: caps.can_add_members,
            can_add_spares: caps.can_add_spares,
            sizes_can_vary: caps.sizes_can_vary,
            removal_policy: caps.removal_policy,
            free_space: state.lvg.as_ref().map(|l| l.allocator.free_space()),
            volume_count: state.lvg.as_ref().map(|l| l.directory.len()),
            rebuild,
        }
    }

    /// Properties of one member
    pub fn member_properties(&self, id: MemberId) -> Result<MemberInfo> {
        self.state
            .read()
            .member(id)
            .map(|m| m.info(self.chunk_size))
            .ok_or_else(|| Error::MemberNotFound(id.to_string()))
    }

    /// Properties of every member, data members first
    #[must_use]
    pub fn members(&self) -> Vec<MemberInfo> {
        let state = self.state.read();
        state
            .members
            .iter()
            .chain(&state.spares)
            .map(|m| m.info(self.chunk_size))
            .collect()
    }

    fn header_properties(&self, state: &SetState, sequence: u32) -> HeaderProperties {
        HeaderProperties {
            version: state.version,
            set_name: state.name.clone(),
            level: self.level,
            sequence,
            member_index: None,
            chunk_size: self.chunk_size,
            chunk_count: 0,
            primary_size: state.primary_size,
            secondary_size: state.secondary_size,
            volume_slots: state.volume_slots,
            group_offset: 0,
            quick_rebuild: state.quick_rebuild,
            members: state.members.iter().map(|m| m.id.as_uuid()).collect(),
            member_sizes: state
                .members
                .iter()
                .map(|m| m.data_size(self.chunk_size))
                .collect(),
            member_offsets: state.members.iter().map(|m| m.group_offset).collect(),
            spares: state.spares.iter().map(|m| m.id.as_uuid()).collect(),
        }
    }

    /// Write the referencing structures and member headers for the next
    /// sequence number.
    ///
    /// Volume entries must already be on disk. Mirror members that fail a
    /// bitmap write, and members of any level that fail the header write,
    /// are marked Broken and left out. Any other failure aborts.
    pub(crate) fn commit(&self, next: &mut SetState, bitmap: Option<&RebuildBitmap>) -> Result<u32> {
        let sequence = next
            .sequence
            .checked_add(1)
            .ok_or_else(|| Error::internal("sequence number exhausted"))?;
        let mut failed = Vec::new();

        match self.level {
            SetLevel::Lvg => {
                if let Some(lvg) = &next.lvg {
                    lvg.directory.write_toc(sequence)?;
                    let capacity = (next.primary_size.saturating_sub(PRIMARY_HEADER_SIZE as u64)
                        / EXTENT_RECORD_SIZE as u64) as usize;
                    for member in next.members.iter().filter(|m| m.state == MemberState::Open) {
                        let free = lvg.member_free_extents(member, self.chunk_size, capacity);
                        member
                            .primary_store(self.chunk_size, next.primary_size)?
                            .write_extent_list(sequence, &free)?;
                    }
                }
            }
            SetLevel::Mirror => {
                if let Some(bitmap) = bitmap.filter(|_| next.primary_size > 0) {
                    for member in next.members.iter().filter(|m| m.state == MemberState::Open) {
                        let result = member
                            .primary_store(self.chunk_size, next.primary_size)
                            .and_then(|s| s.write_bitmap(sequence, bitmap));
                        if let Err(e) = result {
                            warn!(set = %self.id, member = %member.id, error = %e, "bitmap write failed");
                            failed.push(member.id);
                        }
                    }
                }
            }
            SetLevel::Concat | SetLevel::Stripe => {}
        }
        for id in failed {
            if let Some(m) = next.member_mut(id) {
                m.state = MemberState::Broken;
            }
        }

        let base = self.header_properties(next, sequence);
        let mut written = 0;
        for member in next.members.iter_mut().chain(next.spares.iter_mut()) {
            let writable = member.state == MemberState::Open
                || (member.state == MemberState::Spare && member.index.is_none());
            if !writable || member.device.is_none() {
                continue;
            }
            let header = MemberHeader {
                set_uuid: self.id.as_uuid(),
                member_uuid: member.id.as_uuid(),
                size: member.data_size(self.chunk_size),
                properties: HeaderProperties {
                    member_index: member.index,
                    chunk_count: member.chunk_count,
                    group_offset: member.group_offset,
                    ..base.clone()
                },
            };
            match member.header_store().and_then(|s| s.write(&header)) {
                Ok(()) => {
                    member.sequence = sequence;
                    written += 1;
                }
                Err(e) if e.is_device_failure() => {
                    warn!(set = %self.id, member = %member.id, error = %e, "header write failed");
                    member.state = MemberState::Broken;
                }
                Err(e) => return Err(e),
            }
        }
        if written == 0 {
            return Err(Error::member_state("no member accepted the set header"));
        }

        next.sequence = sequence;
        next.committed = true;
        next.layout = next.build_layout(self.level, self.chunk_size);
        debug!(set = %self.id, sequence, members = written, "committed set");
        Ok(sequence)
    }

    /// Commit a mirror change while holding the bitmap lock
    fn commit_with_bitmap(&self, next: &mut SetState) -> Result<u32> {
        match &self.rebuild {
            Some(coordinator) => {
                let io = coordinator.io.lock();
                self.commit(next, io.bitmap.as_ref())
            }
            None => self.commit(next, None),
        }
    }

    /// Size the mirror members so they all expose the same data region
    fn size_mirror(&self, next: &mut SetState) -> Result<()> {
        let partition = mirror_partition(next);
        let primary = if next.quick_rebuild {
            bitmap_block_size(&size_bitmap(partition, self.chunk_size, 0))
        } else {
            0
        };
        let chunks = partition.saturating_sub(primary) / self.chunk_size;
        if chunks == 0 {
            return Err(Error::InsufficientSpace {
                required: primary + self.chunk_size,
                available: partition,
            });
        }
        next.primary_size = primary;
        for member in next.members.iter_mut().chain(next.spares.iter_mut()) {
            member.chunk_count = chunks;
        }
        Ok(())
    }

    /// Size the stripe members to the smallest one
    fn size_stripe(&self, next: &mut SetState) -> Result<()> {
        let mut chunks = u64::MAX;
        for member in &next.members {
            chunks = chunks.min(usable_chunks(member.device()?.as_ref(), self.chunk_size, 0)?);
        }
        for member in &mut next.members {
            member.chunk_count = chunks;
        }
        Ok(())
    }

    fn place_data_member(&self, next: &mut SetState, device: Arc<dyn MemberDevice>) -> Result<MemberId> {
        let index = next.members.len() as u32;
        let mut member = Member::new(device.clone(), Some(index), MemberState::Open);
        let id = member.id;

        match self.level {
            SetLevel::Concat | SetLevel::Lvg => {
                member.chunk_count = usable_chunks(device.as_ref(), self.chunk_size, next.primary_size)?;
                member.group_offset = next.group_end(self.chunk_size);
                let data_size = member.data_size(self.chunk_size);
                if self.level == SetLevel::Lvg && index == 0 && data_size <= next.secondary_size {
                    return Err(Error::InsufficientSpace {
                        required: next.secondary_size + self.chunk_size,
                        available: data_size,
                    });
                }
                let end = member.group_offset + data_size;
                if let Some(lvg) = next.lvg.as_mut() {
                    lvg.allocator.grow_end(end);
                }
                next.members.push(member);
            }
            SetLevel::Stripe => {
                next.members.push(member);
                self.size_stripe(next)?;
            }
            SetLevel::Mirror if !next.committed => {
                next.members.push(member);
                self.size_mirror(next)?;
            }
            SetLevel::Mirror => {
                let chunks = usable_chunks(device.as_ref(), self.chunk_size, next.primary_size)?;
                let needed = next.common_chunks();
                if chunks < needed {
                    return Err(Error::InsufficientSpace {
                        required: needed * self.chunk_size,
                        available: chunks * self.chunk_size,
                    });
                }
                // joins as a slot waiting for its first resync
                member.state = MemberState::Spare;
                member.chunk_count = needed;
                next.members.push(member);
            }
        }
        Ok(id)
    }

    /// Add a member or a hot spare
    pub fn add_member(&self, device: Arc<dyn MemberDevice>, role: MemberRole) -> Result<MemberId> {
        let guard = self.update.lock();
        let caps = self.level.capabilities();
        let mut next = self.state.read().clone();

        if next.holds_device(&device) {
            return Err(Error::invalid_argument(format!(
                "{} already belongs to set {}",
                device.name(),
                self.id
            )));
        }

        let id = match role {
            MemberRole::Spare => {
                if !caps.can_add_spares {
                    return Err(Error::member_state(format!(
                        "{} sets do not support spares",
                        self.level
                    )));
                }
                let mut spare = Member::new(device.clone(), None, MemberState::Spare);
                if next.committed {
                    let chunks =
                        usable_chunks(device.as_ref(), self.chunk_size, next.primary_size)?;
                    if chunks < next.common_chunks() {
                        return Err(Error::InsufficientSpace {
                            required: next.common_chunks() * self.chunk_size,
                            available: chunks * self.chunk_size,
                        });
                    }
                    spare.chunk_count = next.common_chunks();
                    next.spares.push(spare.clone());
                } else {
                    next.spares.push(spare.clone());
                    self.size_mirror(&mut next)?;
                }
                spare.id
            }
            MemberRole::Data => {
                if next.committed && !caps.can_add_members {
                    return Err(Error::member_state(format!(
                        "{} sets cannot gain members after creation",
                        self.level
                    )));
                }
                self.place_data_member(&mut next, device.clone())?
            }
        };
        next.layout = next.build_layout(self.level, self.chunk_size);

        let committed = next.committed;
        if committed {
            self.commit_with_bitmap(&mut next)?;
        }
        *self.state.write() = next;
        drop(guard);

        info!(set = %self.id, member = %id, device = device.name(), ?role, "added member");
        if committed && self.level == SetLevel::Mirror {
            if role == MemberRole::Data {
                self.start_rebuild(id, RebuildMode::Full)?;
            } else {
                self.replace_failed_members();
            }
        }
        Ok(id)
    }

    /// Remove a member or a spare, as the level's removal policy allows
    pub fn remove_member(&self, id: MemberId) -> Result<()> {
        let guard = self.update.lock();
        let mut next = self.state.read().clone();

        let removed = if let Some(pos) = next.spares.iter().position(|m| m.id == id) {
            next.spares.remove(pos)
        } else {
            let pos = next
                .members
                .iter()
                .position(|m| m.id == id)
                .ok_or_else(|| Error::MemberNotFound(id.to_string()))?;
            self.check_removal(&next, pos)?;
            if self.level == SetLevel::Lvg {
                let member = &next.members[pos];
                let range = Extent::new(member.group_offset, member.data_size(self.chunk_size));
                if let Some(lvg) = next.lvg.as_mut() {
                    lvg.allocator.reserve(range)?;
                }
            }
            let mut member = next.members.remove(pos);
            member.state = MemberState::Closing;
            next.reindex();
            if matches!(self.level, SetLevel::Stripe | SetLevel::Mirror) && !next.committed {
                if self.level == SetLevel::Stripe && !next.members.is_empty() {
                    self.size_stripe(&mut next)?;
                } else if self.level == SetLevel::Mirror && !next.members.is_empty() {
                    self.size_mirror(&mut next)?;
                }
            }
            member
        };
        next.layout = next.build_layout(self.level, self.chunk_size);

        if let Some(coordinator) = &self.rebuild {
            coordinator.abort_if_target(id, "member removed");
        }
        if next.committed {
            self.commit_with_bitmap(&mut next)?;
        }
        *self.state.write() = next;
        drop(guard);

        if removed.device.is_some()
            && let Err(e) = removed.header_store().and_then(|s| s.erase())
        {
            warn!(set = %self.id, member = %id, error = %e, "failed to erase removed member");
        }
        info!(set = %self.id, member = %id, device = %removed.device_name(), "removed member");
        Ok(())
    }

    fn check_removal(&self, state: &SetState, pos: usize) -> Result<()> {
        let member = &state.members[pos];
        if !state.committed {
            return Ok(());
        }
        match self.level.capabilities().removal_policy {
            RemovalPolicy::None => Err(Error::member_state(format!(
                "{} sets do not allow member removal",
                self.level
            ))),
            RemovalPolicy::LastMember => {
                if pos + 1 != state.members.len() {
                    return Err(Error::member_state("only the last member can be removed"));
                }
                if state.members.len() == 1 {
                    return Err(Error::member_state("cannot remove the only member"));
                }
                Ok(())
            }
            RemovalPolicy::AnyOneMember => {
                if state.members.iter().any(|m| m.id != member.id && m.state != MemberState::Open) {
                    return Err(Error::member_state("another member is already out of service"));
                }
                Ok(())
            }
            RemovalPolicy::AnyMember => match self.level {
                SetLevel::Mirror => {
                    let others_open = state
                        .members
                        .iter()
                        .any(|m| m.id != member.id && m.state == MemberState::Open);
                    if !others_open {
                        return Err(Error::member_state("cannot remove the last in-sync member"));
                    }
                    Ok(())
                }
                SetLevel::Lvg => {
                    if pos == 0 {
                        return Err(Error::member_state("member 0 holds the volume directory"));
                    }
                    let range = Extent::new(member.group_offset, member.data_size(self.chunk_size));
                    let in_use = state
                        .lvg
                        .as_ref()
                        .is_some_and(|l| !l.directory.list_volumes(Some(&range)).is_empty());
                    if in_use {
                        return Err(Error::member_state("member still holds volume extents"));
                    }
                    Ok(())
                }
                SetLevel::Concat | SetLevel::Stripe => Ok(()),
            },
        }
    }

    /// Commit the current configuration, writing the set for the first time if needed
    pub fn update(&self) -> Result<u32> {
        let guard = self.update.lock();
        let mut next = self.state.read().clone();
        if next.members.is_empty() {
            return Err(Error::member_state("set has no members"));
        }

        let sequence = if next.committed {
            self.commit_with_bitmap(&mut next)?
        } else {
            match self.level {
                SetLevel::Mirror => {
                    let bitmap = (next.quick_rebuild && next.primary_size > 0).then(|| {
                        let geometry = size_bitmap(mirror_partition(&next), self.chunk_size, 0);
                        RebuildBitmap::new(next.common_chunks() * self.chunk_size, geometry.bytes_per_bit)
                    });
                    let sequence = self.commit(&mut next, bitmap.as_ref())?;
                    if let Some(coordinator) = &self.rebuild {
                        coordinator.io.lock().bitmap = bitmap;
                    }
                    sequence
                }
                SetLevel::Lvg => {
                    next.lvg = Some(LvgState::format(self, &next)?);
                    self.commit(&mut next, None)?
                }
                SetLevel::Concat | SetLevel::Stripe => self.commit(&mut next, None)?,
            }
        };

        *self.state.write() = next;
        drop(guard);
        info!(set = %self.id, sequence, "updated set");
        Ok(sequence)
    }

    /// Demote a member after a host-reported or I/O failure.
    ///
    /// The demotion always takes effect in memory; the commit recording it
    /// is best effort.
    pub fn fail_member(&self, id: MemberId) -> Result<()> {
        let guard = self.update.lock();
        let mut next = self.state.read().clone();
        let member = next
            .member_mut(id)
            .ok_or_else(|| Error::MemberNotFound(id.to_string()))?;
        if member.state == MemberState::Broken {
            return Ok(());
        }
        let was_spare = member.index.is_none();
        member.state = MemberState::Broken;
        if was_spare {
            next.spares.retain(|m| m.id != id);
        }
        next.layout = next.build_layout(self.level, self.chunk_size);

        if let Some(coordinator) = &self.rebuild {
            coordinator.abort_if_target(id, "member failed");
        }

        let mut recorded = next.clone();
        match self.commit_with_bitmap(&mut recorded) {
            Ok(sequence) => {
                debug!(set = %self.id, member = %id, sequence, "recorded member failure");
                next = recorded;
            }
            Err(e) => warn!(set = %self.id, member = %id, error = %e, "failed to record member failure"),
        }
        *self.state.write() = next;
        drop(guard);

        warn!(set = %self.id, member = %id, "member marked broken");
        if self.level == SetLevel::Mirror {
            self.replace_failed_members();
        }
        Ok(())
    }

    /// Put hot spares in place of Broken mirror members and resync them
    pub(crate) fn replace_failed_members(&self) {
        let promoted = {
            let _guard = self.update.lock();
            let mut next = self.state.read().clone();
            let mut promoted = Vec::new();
            while let Some(slot) = next.members.iter().position(|m| m.state == MemberState::Broken) {
                let Some(spare_pos) = next.spares.iter().position(|m| m.state == MemberState::Spare)
                else {
                    break;
                };
                let mut spare = next.spares.remove(spare_pos);
                spare.index = Some(slot as u32);
                spare.sequence = 0;
                spare.chunk_count = next.common_chunks();
                let replaced = std::mem::replace(&mut next.members[slot], spare);
                info!(
                    set = %self.id,
                    spare = %next.members[slot].id,
                    replaced = %replaced.id,
                    "spare replaces broken member"
                );
                promoted.push(next.members[slot].id);
            }
            if promoted.is_empty() {
                return;
            }
            next.layout = next.build_layout(self.level, self.chunk_size);
            if let Err(e) = self.commit_with_bitmap(&mut next) {
                warn!(set = %self.id, error = %e, "failed to commit spare promotion");
                return;
            }
            *self.state.write() = next;
            promoted
        };

        for id in promoted {
            if let Err(e) = self.start_rebuild(id, RebuildMode::Full) {
                warn!(set = %self.id, member = %id, error = %e, "failed to start rebuild");
            }
        }
    }

    /// Resync every returning mirror member, then fill gaps from spares
    pub(crate) fn resume_rebuilds(&self) {
        if self.level != SetLevel::Mirror {
            return;
        }
        let returning: Vec<MemberId> = self
            .state
            .read()
            .members
            .iter()
            .filter(|m| m.state == MemberState::Spare && m.device.is_some())
            .map(|m| m.id)
            .collect();
        for id in returning {
            if let Err(e) = self.start_rebuild(id, RebuildMode::Auto) {
                warn!(set = %self.id, member = %id, error = %e, "failed to start rebuild");
            }
        }
        self.replace_failed_members();
    }

    /// Stop background work and mark every member Closed
    pub fn close(&self) {
        if let Some(coordinator) = &self.rebuild {
            coordinator.shutdown();
        }
        let _guard = self.update.lock();
        let mut guard = self.state.write();
        let state = &mut *guard;
        for member in state.members.iter_mut().chain(state.spares.iter_mut()) {
            if member.device.is_some() {
                member.state = MemberState::Closed;
            }
        }
        info!(set = %self.id, "closed set");
    }

    /// Erase the set from its members
    pub fn destroy(&self) -> Result<()> {
        self.close();
        let _guard = self.update.lock();
        let state = self.state.read();
        let mut first_error = None;
        for member in state.members.iter().chain(&state.spares) {
            if member.device.is_none() {
                continue;
            }
            if let Err(e) = member.header_store().and_then(|s| s.erase()) {
                warn!(set = %self.id, member = %member.id, error = %e, "failed to erase member");
                first_error.get_or_insert(e);
            }
        }
        info!(set = %self.id, "destroyed set");
        first_error.map_or(Ok(()), Err)
    }

    fn open_targets(state: &SetState, members: &[usize]) -> Result<Vec<IoTarget>> {
        members
            .iter()
            .map(|&i| {
                let member = state
                    .members
                    .get(i)
                    .ok_or_else(|| Error::internal(format!("segment names member {i}")))?;
                if member.state != MemberState::Open {
                    return Err(Error::member_state(format!(
                        "member {} is {:?}",
                        member.id, member.state
                    )));
                }
                Ok(IoTarget {
                    id: member.id,
                    device: member.device()?.clone(),
                })
            })
            .collect()
    }

    /// Read from the set's logical address space
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if self.level == SetLevel::Mirror {
            return self.read_mirror(offset, buf);
        }
        let (segments, targets) = {
            let state = self.state.read();
            let segments = state.layout.map(offset, buf.len() as u64)?;
            let indices: Vec<usize> = segments.iter().map(|s| s.member).collect();
            (segments, Self::open_targets(&state, &indices)?)
        };
        for (segment, target) in segments.iter().zip(&targets) {
            let start = segment.buffer_offset;
            let end = start + segment.length as usize;
            target.device.read_at(segment.member_offset, &mut buf[start..end])?;
        }
        Ok(())
    }

    /// Write to the set's logical address space
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        if self.level == SetLevel::Mirror {
            return self.write_mirror(offset, data);
        }
        let (segments, targets) = {
            let state = self.state.read();
            let segments = state.layout.map(offset, data.len() as u64)?;
            let indices: Vec<usize> = segments.iter().map(|s| s.member).collect();
            (segments, Self::open_targets(&state, &indices)?)
        };
        for (segment, target) in segments.iter().zip(&targets) {
            let start = segment.buffer_offset;
            let end = start + segment.length as usize;
            target.device.write_at(segment.member_offset, &data[start..end])?;
        }
        Ok(())
    }

    fn read_mirror(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let candidates: Vec<IoTarget> = {
            let state = self.state.read();
            state.layout.check_range(offset, buf.len() as u64)?;
            let SetLayout::Mirror(map) = &state.layout else {
                return Err(Error::internal("mirror set without mirror layout"));
            };
            let states: Vec<MemberState> = state.members.iter().map(|m| m.state).collect();
            let first = map
                .select_reader(&states)
                .ok_or_else(|| Error::member_state("no in-sync member to read from"))?;
            let count = state.members.len();
            (0..count)
                .map(|step| &state.members[(first + step) % count])
                .filter(|m| m.state == MemberState::Open)
                .filter_map(|m| m.device.clone().map(|device| IoTarget { id: m.id, device }))
                .collect()
        };

        let mut failed = Vec::new();
        let mut result = Err(Error::member_state("no in-sync member to read from"));
        for target in &candidates {
            match target.device.read_at(offset, buf) {
                Ok(()) => {
                    result = Ok(());
                    break;
                }
                Err(e) => {
                    warn!(set = %self.id, member = %target.id, error = %e, "mirror read failed");
                    failed.push(target.id);
                    result = Err(e);
                }
            }
        }
        for id in failed {
            if let Err(e) = self.fail_member(id) {
                warn!(set = %self.id, member = %id, error = %e, "failed to demote member");
            }
        }
        result
    }

    fn write_mirror(&self, offset: u64, data: &[u8]) -> Result<()> {
        let coordinator = self
            .rebuild
            .as_ref()
            .ok_or_else(|| Error::internal("mirror set without rebuild coordinator"))?;
        let len = data.len() as u64;
        let mut failed = Vec::new();
        let mut written = 0;

        {
            let mut io = coordinator.io.lock();
            let (targets, rebuild_target, degraded, sequence, tracking, primary) = {
                let state = self.state.read();
                state.layout.check_range(offset, len)?;
                let targets: Vec<IoTarget> = state
                    .members
                    .iter()
                    .filter(|m| m.state == MemberState::Open)
                    .filter_map(|m| m.device.clone().map(|device| IoTarget { id: m.id, device }))
                    .collect();
                let rebuild_target = io
                    .progress
                    .target
                    .and_then(|id| state.member(id))
                    .and_then(|m| m.device.clone().map(|device| IoTarget { id: m.id, device }));
                let tracking = state.quick_rebuild
                    && state.version >= MIN_QUICK_REBUILD_VERSION
                    && state.primary_size > 0;
                let primary = (
                    primary_offset(state.common_chunks(), self.chunk_size),
                    state.primary_size,
                );
                (
                    targets,
                    rebuild_target,
                    state.is_degraded(),
                    state.sequence,
                    tracking,
                    primary,
                )
            };

            // decide the rebuild target's share before this write dirties the bitmap
            let route = io.route(offset, len, coordinator.is_cancelled());

            // dirty bits reach disk before the data they cover
            if degraded && tracking {
                self.mark_dirty(&mut io.bitmap, &targets, &mut failed, (offset, len), sequence, primary);
            }

            let mut lost = false;
            for target in &targets {
                if failed.contains(&target.id) {
                    continue;
                }
                match target.device.write_at(offset, data) {
                    Ok(()) => written += 1,
                    Err(e) => {
                        warn!(set = %self.id, member = %target.id, error = %e, "mirror write failed");
                        failed.push(target.id);
                        lost = true;
                    }
                }
            }
            // the failed copy missed this range
            if lost && tracking {
                self.mark_dirty(&mut io.bitmap, &targets, &mut failed, (offset, len), sequence, primary);
            }

            if let Some(target) = rebuild_target {
                match route {
                    Route::Mirror => {
                        if let Err(e) = target.device.write_at(offset, data) {
                            io.fail(format!("write to rebuilding member failed: {e}"));
                        }
                    }
                    Route::Defer => {
                        if io.progress.pending.len() >= self.config.rebuild.pending_capacity {
                            io.fail("pending write queue overflowed".to_string());
                        } else {
                            io.progress.pending.push_back(Extent::new(offset, len));
                        }
                    }
                    Route::Skip => {}
                }
            }
        }

        for id in failed {
            if let Err(e) = self.fail_member(id) {
                warn!(set = %self.id, member = %id, error = %e, "failed to demote member");
            }
        }
        if written == 0 {
            return Err(Error::member_state("no in-sync member accepted the write"));
        }
        Ok(())
    }

    fn mark_dirty(
        &self,
        bitmap: &mut Option<RebuildBitmap>,
        targets: &[IoTarget],
        failed: &mut Vec<MemberId>,
        (offset, len): (u64, u64),
        sequence: u32,
        (primary_offset, primary_size): (u64, u64),
    ) {
        let Some(bitmap) = bitmap.as_mut() else { return };
        if !bitmap.mark(offset, len) {
            return;
        }
        for target in targets {
            if failed.contains(&target.id) {
                continue;
            }
            let store = PrimaryMetadataStore::new(target.device.clone(), primary_offset, primary_size);
            if let Err(e) = store.write_bitmap(sequence, bitmap) {
                warn!(set = %self.id, member = %target.id, error = %e, "bitmap update failed");
                failed.push(target.id);
            }
        }
    }

    /// Weak handle for the rebuild worker
    pub(crate) fn weak(&self) -> Weak<Self> {
        self.this.clone()
    }

    /// UUID used for the set's on-disk identity
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.id.as_uuid()
    }
}

impl std::fmt::Debug for RaidSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaidSet")
            .field("id", &self.id)
            .field("level", &self.level)
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}
