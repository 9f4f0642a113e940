//! Logical volume directory
//!
//! A group's volumes are listed in a table of contents kept in the master
//! volume, the secondary region at the tail of member 0's data. Master
//! volume layout:
//!
//! ```text
//! +---------------------------+  0
//! | TOC copy A (even seqs)    |  512B header + slots * 128B
//! +---------------------------+  toc_size
//! | TOC copy B (odd seqs)     |
//! +---------------------------+  2 * toc_size
//! | Volume entry slots        |  slots * 4KB
//! +---------------------------+
//! ```
//!
//! TOC entry 0 always describes the master volume itself. Removed entries
//! are tombstoned and their slots reused.

use crate::volume::LogicalVolume;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};
use volset_common::{Error, Result, VolumeId, VolumeType};
use volset_storage::layout::{LV_ENTRY_SIZE, align_up, check_sequence};
use volset_storage::primary::toc_block_size;
use volset_storage::{Extent, MemberDevice, PrimaryMetadataStore, TocEntry, VolumeEntry};

/// Sizes of a group's master volume
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirectoryGeometry {
    /// TOC entries, master included; also the number of entry slots
    pub slots: u32,
    /// Bytes per TOC copy
    pub toc_size: u64,
    /// Bytes reserved for the whole master volume
    pub secondary_size: u64,
}

impl DirectoryGeometry {
    /// Geometry for `max_volumes` TOC entries, rounded to whole chunks
    #[must_use]
    pub const fn new(max_volumes: u32, chunk_size: u64) -> Self {
        let toc_size = toc_block_size(max_volumes as u64);
        let raw = 2 * toc_size + max_volumes as u64 * LV_ENTRY_SIZE;
        Self {
            slots: max_volumes,
            toc_size,
            secondary_size: align_up(raw, chunk_size),
        }
    }

    /// Offset of an entry slot within the master volume
    #[must_use]
    pub const fn slot_offset(&self, slot: u32) -> u64 {
        2 * self.toc_size + slot as u64 * LV_ENTRY_SIZE
    }

    const fn is_slot_offset(&self, offset: u64) -> bool {
        offset >= self.slot_offset(0)
            && offset < self.slot_offset(self.slots)
            && (offset - self.slot_offset(0)) % LV_ENTRY_SIZE == 0
    }
}

/// Table of contents and volume entries of one group
#[derive(Clone)]
pub struct LogicalVolumeDirectory {
    device: Arc<dyn MemberDevice>,
    base: u64,
    geometry: DirectoryGeometry,
    toc: Vec<TocEntry>,
    volumes: BTreeMap<VolumeId, LogicalVolume>,
    master: LogicalVolume,
}

impl LogicalVolumeDirectory {
    fn master_volume(id: VolumeId, extent: Extent, geometry: &DirectoryGeometry) -> LogicalVolume {
        let mut master = LogicalVolume::new("master".into(), VolumeType::MASTER, None, geometry.secondary_size);
        master.id = id;
        master.extents = vec![extent];
        master
    }

    fn master_toc_entry(id: VolumeId, geometry: &DirectoryGeometry) -> TocEntry {
        TocEntry {
            volume_uuid: id.as_uuid(),
            volume_size: geometry.secondary_size,
            entry_offset: 0,
            entry_size: 2 * geometry.toc_size,
        }
    }

    /// An empty directory for a new group.
    ///
    /// `device` and `base` locate the master volume on member 0;
    /// `master_extent` is where it sits in the group address space.
    pub fn format(
        device: Arc<dyn MemberDevice>,
        base: u64,
        geometry: DirectoryGeometry,
        master_id: VolumeId,
        master_extent: Extent,
    ) -> Self {
        let mut toc = vec![TocEntry::empty(); geometry.slots as usize];
        toc[0] = Self::master_toc_entry(master_id, &geometry);
        Self {
            device,
            base,
            geometry,
            toc,
            volumes: BTreeMap::new(),
            master: Self::master_volume(master_id, master_extent, &geometry),
        }
    }

    /// Load the newest committed table of contents and its volume entries
    pub fn load(
        device: Arc<dyn MemberDevice>,
        base: u64,
        geometry: DirectoryGeometry,
        master_id: VolumeId,
        master_extent: Extent,
        committed: u32,
    ) -> Result<Self> {
        let mut dir = Self::format(device, base, geometry, master_id, master_extent);

        let mut best: Option<(u32, Vec<TocEntry>)> = None;
        for copy in 0..2 {
            match dir.toc_store(copy).read_toc() {
                Ok((sequence, entries)) => {
                    if let Err(e) = check_sequence(sequence, committed) {
                        warn!(copy, error = %e, "ignoring table of contents debris");
                        continue;
                    }
                    if entries.len() != geometry.slots as usize {
                        warn!(copy, entries = entries.len(), "table of contents has wrong slot count");
                        continue;
                    }
                    if best.as_ref().is_none_or(|(seq, _)| sequence > *seq) {
                        best = Some((sequence, entries));
                    }
                }
                Err(e) if e.is_device_failure() => return Err(e),
                Err(e) => debug!(copy, error = %e, "table of contents copy unusable"),
            }
        }
        let (sequence, toc) =
            best.ok_or_else(|| Error::format("no valid table of contents copy"))?;

        if toc[0].volume_uuid != master_id.as_uuid() {
            return Err(Error::format("table of contents does not start with the master entry"));
        }

        for entry in toc.iter().skip(1).filter(|e| e.is_live()) {
            if !geometry.is_slot_offset(entry.entry_offset) || entry.entry_size != LV_ENTRY_SIZE {
                return Err(Error::format(format!(
                    "volume {} points at invalid slot {}",
                    entry.volume_uuid, entry.entry_offset
                )));
            }
            let data = dir
                .device
                .read_bytes(base + entry.entry_offset, LV_ENTRY_SIZE as usize)?;
            let volume = LogicalVolume::from_entry(VolumeEntry::from_bytes(&data)?, entry.entry_offset)?;
            if volume.id.as_uuid() != entry.volume_uuid {
                return Err(Error::format(format!(
                    "slot {} holds volume {}, table of contents expects {}",
                    entry.entry_offset, volume.id, entry.volume_uuid
                )));
            }
            if let Err(e) = check_sequence(volume.sequence, committed) {
                warn!(volume = %volume.id, error = %e, "ignoring volume entry debris");
                continue;
            }
            dir.volumes.insert(volume.id, volume);
        }

        dir.toc = toc;
        debug!(sequence, volumes = dir.volumes.len(), "loaded volume directory");
        Ok(dir)
    }

    fn toc_store(&self, copy: u32) -> PrimaryMetadataStore {
        PrimaryMetadataStore::new(
            self.device.clone(),
            self.base + u64::from(copy) * self.geometry.toc_size,
            self.geometry.toc_size,
        )
    }

    /// Directory geometry
    #[must_use]
    pub const fn geometry(&self) -> &DirectoryGeometry {
        &self.geometry
    }

    /// The master volume
    #[must_use]
    pub const fn master(&self) -> &LogicalVolume {
        &self.master
    }

    /// Look up a volume
    #[must_use]
    pub fn get(&self, id: &VolumeId) -> Option<&LogicalVolume> {
        self.volumes.get(id)
    }

    /// All volumes, master excluded
    pub fn volumes(&self) -> impl Iterator<Item = &LogicalVolume> {
        self.volumes.values()
    }

    /// Number of volumes, master excluded
    #[must_use]
    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    /// True when the group holds no volumes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    /// Volumes, optionally only those with extents in a group range
    #[must_use]
    pub fn list_volumes(&self, member_range: Option<&Extent>) -> Vec<&LogicalVolume> {
        self.volumes
            .values()
            .filter(|v| member_range.is_none_or(|range| v.touches(range)))
            .collect()
    }

    /// Raw table of contents
    #[must_use]
    pub fn toc(&self) -> &[TocEntry] {
        &self.toc
    }

    /// An entry slot no live volume uses
    pub fn free_slot(&self) -> Result<u64> {
        (0..self.geometry.slots)
            .map(|slot| self.geometry.slot_offset(slot))
            .find(|&offset| !self.volumes.values().any(|v| v.slot_offset == offset))
            .ok_or(Error::InsufficientSpace {
                required: LV_ENTRY_SIZE,
                available: 0,
            })
    }

    fn toc_entry(volume: &LogicalVolume) -> TocEntry {
        TocEntry {
            volume_uuid: volume.id.as_uuid(),
            volume_size: volume.claimed_size,
            entry_offset: volume.slot_offset,
            entry_size: LV_ENTRY_SIZE,
        }
    }

    /// Add a new volume, reusing the first free or tombstoned entry
    pub fn add_entry(&mut self, volume: LogicalVolume) -> Result<()> {
        if self.volumes.contains_key(&volume.id) {
            return Err(Error::invalid_argument(format!("volume {} already listed", volume.id)));
        }
        let index = self
            .toc
            .iter()
            .skip(1)
            .position(|e| !e.is_live())
            .map(|i| i + 1)
            .ok_or(Error::InsufficientSpace {
                required: LV_ENTRY_SIZE,
                available: 0,
            })?;
        self.toc[index] = Self::toc_entry(&volume);
        self.volumes.insert(volume.id, volume);
        Ok(())
    }

    /// Replace a listed volume
    pub fn update_entry(&mut self, volume: LogicalVolume) -> Result<()> {
        let index = self.toc_index(&volume.id)?;
        self.toc[index] = Self::toc_entry(&volume);
        self.volumes.insert(volume.id, volume);
        Ok(())
    }

    /// Tombstone a volume's entry
    pub fn remove_entry(&mut self, id: &VolumeId) -> Result<LogicalVolume> {
        let index = self.toc_index(id)?;
        self.toc[index] = TocEntry::deleted();
        self.volumes
            .remove(id)
            .ok_or_else(|| Error::VolumeNotFound(id.to_string()))
    }

    fn toc_index(&self, id: &VolumeId) -> Result<usize> {
        self.toc
            .iter()
            .skip(1)
            .position(|e| e.volume_uuid == id.as_uuid())
            .map(|i| i + 1)
            .ok_or_else(|| Error::VolumeNotFound(id.to_string()))
    }

    /// Write a volume's entry into its slot
    pub fn write_volume_entry(&self, volume: &LogicalVolume) -> Result<()> {
        if !self.geometry.is_slot_offset(volume.slot_offset) {
            return Err(Error::internal(format!("invalid entry slot {}", volume.slot_offset)));
        }
        let data = volume.to_entry().to_bytes()?;
        self.device.write_at(self.base + volume.slot_offset, &data)?;
        self.device.sync()
    }

    /// Write the table of contents into the copy owned by `sequence`
    pub fn write_toc(&self, sequence: u32) -> Result<()> {
        self.toc_store(sequence % 2).write_toc(sequence, &self.toc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use volset_storage::MemDevice;

    const CHUNK: u64 = 64 * 1024;

    fn setup() -> (Arc<MemDevice>, DirectoryGeometry, VolumeId) {
        let device = Arc::new(MemDevice::new("m0", 1 << 20));
        (device, DirectoryGeometry::new(8, CHUNK), VolumeId::new())
    }

    fn volume(dir: &LogicalVolumeDirectory, name: &str, extent: Extent, sequence: u32) -> LogicalVolume {
        let mut lv = LogicalVolume::new(name.into(), VolumeType::CONCAT, None, extent.length);
        lv.extents = vec![extent];
        lv.sequence = sequence;
        lv.slot_offset = dir.free_slot().unwrap();
        lv
    }

    #[test]
    fn test_geometry() {
        let geometry = DirectoryGeometry::new(64, 32 * 1024);
        assert_eq!(geometry.toc_size, 12288);
        assert_eq!(geometry.slot_offset(0), 24576);
        assert_eq!(geometry.secondary_size, 294_912);
        assert!(geometry.is_slot_offset(24576 + 4096));
        assert!(!geometry.is_slot_offset(24576 + 100));
    }

    #[test]
    fn test_add_remove_reuses_tombstones() {
        let (device, geometry, master) = setup();
        let mut dir = LogicalVolumeDirectory::format(device, 0, geometry, master, Extent::new(0, 65536));

        let a = volume(&dir, "a", Extent::new(65536, 4096), 1);
        dir.add_entry(a.clone()).unwrap();
        let b = volume(&dir, "b", Extent::new(69632, 4096), 1);
        assert_ne!(a.slot_offset, b.slot_offset);
        dir.add_entry(b.clone()).unwrap();
        assert_eq!(dir.toc()[1].volume_uuid, a.id.as_uuid());

        dir.remove_entry(&a.id).unwrap();
        assert_eq!(dir.toc()[1], TocEntry::deleted());
        assert!(dir.remove_entry(&a.id).unwrap_err().is_not_found());

        let c = volume(&dir, "c", Extent::new(65536, 4096), 2);
        assert_eq!(c.slot_offset, a.slot_offset);
        dir.add_entry(c.clone()).unwrap();
        assert_eq!(dir.toc()[1].volume_uuid, c.id.as_uuid());
        assert_eq!(dir.len(), 2);
    }

    #[test]
    fn test_table_full() {
        let (device, _, master) = setup();
        let geometry = DirectoryGeometry::new(3, CHUNK);
        let mut dir = LogicalVolumeDirectory::format(device, 0, geometry, master, Extent::new(0, 65536));
        for i in 0..2u64 {
            let lv = volume(&dir, "v", Extent::new(65536 + i * 4096, 4096), 1);
            dir.add_entry(lv).unwrap();
        }
        // one slot remains for rewrites, but no TOC entry
        assert!(dir.free_slot().is_ok());
        let lv = volume(&dir, "full", Extent::new(0, 1), 1);
        assert!(matches!(dir.add_entry(lv), Err(Error::InsufficientSpace { .. })));
    }

    #[test]
    fn test_load_picks_newest_committed_copy() {
        let (device, geometry, master) = setup();
        let base = 4096;
        let mut dir = LogicalVolumeDirectory::format(device.clone(), base, geometry, master, Extent::new(0, 65536));

        let a = volume(&dir, "a", Extent::new(65536, 8192), 1);
        dir.write_volume_entry(&a).unwrap();
        dir.add_entry(a.clone()).unwrap();
        dir.write_toc(1).unwrap();

        // sequence 2 adds b, but the set never commits past 1
        let b = volume(&dir, "b", Extent::new(73728, 8192), 2);
        dir.write_volume_entry(&b).unwrap();
        dir.add_entry(b.clone()).unwrap();
        dir.write_toc(2).unwrap();

        let loaded = LogicalVolumeDirectory::load(device.clone(), base, geometry, master, Extent::new(0, 65536), 1).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.get(&a.id), Some(&a));
        assert!(loaded.get(&b.id).is_none());

        let loaded = LogicalVolumeDirectory::load(device, base, geometry, master, Extent::new(0, 65536), 2).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.list_volumes(Some(&Extent::new(73728, 1))).len(), 1);
        assert_eq!(loaded.master().extents, vec![Extent::new(0, 65536)]);
    }

    #[test]
    fn test_load_without_toc_fails() {
        let (device, geometry, master) = setup();
        assert!(matches!(
            LogicalVolumeDirectory::load(device, 0, geometry, master, Extent::new(0, 65536), 5),
            Err(Error::Format(_))
        ));
    }
}
