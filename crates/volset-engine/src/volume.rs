//! Logical volumes

use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};
use volset_common::{Error, Result, VolumeId, VolumeType};
use volset_storage::extent::total_length;
use volset_storage::{Extent, VolumeEntry, VolumeProperties};

/// A logical volume in a group
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogicalVolume {
    /// Volume UUID
    pub id: VolumeId,
    /// Human-readable name
    pub name: String,
    /// Type flags
    pub kind: VolumeType,
    /// Parent volume, for snapshots and bitmaps
    pub parent: Option<VolumeId>,
    /// Size the creator asked for
    pub claimed_size: u64,
    /// Extents in group coordinates, in volume order
    pub extents: Vec<Extent>,
    /// Set sequence number the entry was written under
    pub sequence: u32,
    /// Entry slot offset within the master volume
    pub slot_offset: u64,
    /// Creation timestamp (Unix epoch)
    pub created_at: u64,
}

impl LogicalVolume {
    /// Create a volume that has not been written yet
    #[must_use]
    pub fn new(name: String, kind: VolumeType, parent: Option<VolumeId>, claimed_size: u64) -> Self {
        Self {
            id: VolumeId::new(),
            name,
            kind,
            parent,
            claimed_size,
            extents: Vec::new(),
            sequence: 0,
            slot_offset: 0,
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_secs()),
        }
    }

    /// Calculated size: the sum of the extents
    #[must_use]
    pub fn size(&self) -> u64 {
        total_length(&self.extents)
    }

    /// Encode as an on-disk entry
    #[must_use]
    pub fn to_entry(&self) -> VolumeEntry {
        VolumeEntry {
            properties: VolumeProperties {
                volume_uuid: self.id.as_uuid(),
                parent_uuid: self.parent.map(|p| p.as_uuid()),
                kind: self.kind.bits(),
                name: self.name.clone(),
                claimed_size: self.claimed_size,
                sequence: self.sequence,
                created_at: self.created_at,
            },
            extents: self.extents.clone(),
        }
    }

    /// Decode an on-disk entry found at `slot_offset`
    pub fn from_entry(entry: VolumeEntry, slot_offset: u64) -> Result<Self> {
        let props = entry.properties;
        let kind = VolumeType::from_bits(props.kind).ok_or_else(|| {
            Error::format(format!("volume {} has unknown type bits {:#x}", props.volume_uuid, props.kind))
        })?;

        let mut sorted = entry.extents.clone();
        sorted.sort_unstable();
        if sorted.windows(2).any(|w| w[0].overlaps(&w[1])) {
            return Err(Error::format(format!(
                "volume {} has overlapping extents",
                props.volume_uuid
            )));
        }

        Ok(Self {
            id: VolumeId::from_uuid(props.volume_uuid),
            name: props.name,
            kind,
            parent: props.parent_uuid.map(VolumeId::from_uuid),
            claimed_size: props.claimed_size,
            extents: entry.extents,
            sequence: props.sequence,
            slot_offset,
            created_at: props.created_at,
        })
    }

    /// Translate a volume range into group ranges as (group offset, length, buffer offset)
    pub fn map(&self, offset: u64, length: u64) -> Result<Vec<(u64, u64, usize)>> {
        let size = self.size();
        if offset.checked_add(length).is_none_or(|end| end > size) {
            return Err(Error::invalid_argument(format!(
                "range {offset}+{length} outside volume size {size}"
            )));
        }

        let mut pieces = Vec::new();
        let mut base = 0u64;
        let end = offset + length;
        for extent in &self.extents {
            let extent_end = base + extent.length;
            if extent_end > offset && base < end {
                let from = offset.max(base);
                let to = end.min(extent_end);
                pieces.push((extent.offset + (from - base), to - from, (from - offset) as usize));
            }
            if extent_end >= end {
                break;
            }
            base = extent_end;
        }
        Ok(pieces)
    }

    /// True if any extent lies in a group range
    #[must_use]
    pub fn touches(&self, range: &Extent) -> bool {
        self.extents.iter().any(|e| e.overlaps(range))
    }

    /// Properties for callers
    #[must_use]
    pub fn info(&self) -> VolumeInfo {
        VolumeInfo {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind.bits(),
            parent: self.parent,
            claimed_size: self.claimed_size,
            size: self.size(),
            extent_count: self.extents.len(),
            sequence: self.sequence,
            created_at: self.created_at,
        }
    }
}

/// Volume properties reported to callers
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VolumeInfo {
    /// Volume UUID
    pub id: VolumeId,
    /// Human-readable name
    pub name: String,
    /// Type flag bits
    pub kind: u32,
    /// Parent volume
    pub parent: Option<VolumeId>,
    /// Size the creator asked for
    pub claimed_size: u64,
    /// Calculated size
    pub size: u64,
    /// Number of extents
    pub extent_count: usize,
    /// Sequence number of the entry
    pub sequence: u32,
    /// Creation timestamp (Unix epoch)
    pub created_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume(extents: Vec<Extent>) -> LogicalVolume {
        let mut lv = LogicalVolume::new("v".into(), VolumeType::CONCAT, None, 0);
        lv.extents = extents;
        lv.claimed_size = lv.size();
        lv
    }

    #[test]
    fn test_volume_map_across_extents() {
        let lv = volume(vec![Extent::new(1000, 100), Extent::new(5000, 100)]);
        assert_eq!(lv.size(), 200);
        assert_eq!(
            lv.map(50, 100).unwrap(),
            vec![(1050, 50, 0), (5000, 50, 50)]
        );
        assert_eq!(lv.map(100, 10).unwrap(), vec![(5000, 10, 0)]);
        assert!(lv.map(150, 51).is_err());
    }

    #[test]
    fn test_entry_roundtrip() {
        let mut lv = volume(vec![Extent::new(0, 4096)]);
        lv.sequence = 4;
        lv.parent = Some(VolumeId::new());
        lv.kind = VolumeType::SNAPSHOT_RO;
        let back = LogicalVolume::from_entry(lv.to_entry(), 8192).unwrap();
        assert_eq!(back.slot_offset, 8192);
        assert_eq!(LogicalVolume { slot_offset: 0, ..back }, lv);
    }

    #[test]
    fn test_entry_rejects_overlap_and_unknown_type() {
        let lv = volume(vec![Extent::new(0, 4096), Extent::new(2048, 4096)]);
        assert!(LogicalVolume::from_entry(lv.to_entry(), 0).is_err());

        let mut entry = volume(vec![Extent::new(0, 4096)]).to_entry();
        entry.properties.kind = 0x8000;
        assert!(matches!(
            LogicalVolume::from_entry(entry, 0),
            Err(Error::Format(_))
        ));
    }
}
