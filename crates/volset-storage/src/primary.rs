//! Primary metadata store
//!
//! The primary metadata block sits right after a member's data region. A
//! mirror keeps its dirty-region bitmap there; a logical volume group keeps
//! each member's free extent list there. The same block format, typed as a
//! table of contents header, also heads each copy of a group's volume
//! table in the secondary region.

use crate::device::MemberDevice;
use crate::extent::Extent;
use crate::layout::{
    EXTENT_RECORD_SIZE, METADATA_ALIGNMENT, PRIMARY_HEADER_SIZE, PrimaryHeader, PrimaryPayload,
    TOC_ENTRY_SIZE, TocEntry, align_up, get_extent, put_extent,
};
use bytes::{BufMut, BytesMut};
use std::sync::Arc;
use tracing::debug;
use volset_common::{Error, Result};

/// Smallest bitmap allocation (128KB)
pub const MIN_BITMAP_SIZE: u64 = 128 * 1024;

/// Finest bitmap granularity (512KB per bit)
pub const MIN_BYTES_PER_BIT: u64 = 512 * 1024;

/// Coarsest bitmap granularity (32MB per bit)
pub const MAX_BYTES_PER_BIT: u64 = 32 * 1024 * 1024;

/// Chosen bitmap allocation and granularity
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BitmapGeometry {
    /// Bytes reserved for the bitmap
    pub size: u64,
    /// Data bytes tracked by one bit
    pub bytes_per_bit: u64,
}

/// Size a dirty-region bitmap for a partition.
///
/// The covered range is the partition rounded down to whole chunks.
/// Starting from the minimum allocation at the finest granularity, the
/// granularity doubles until the bits fit; once it reaches the coarsest
/// setting the allocation grows by the minimum and the granularity starts
/// over. `reserved` bytes of the allocation are not available for bits.
#[must_use]
pub fn size_bitmap(partition_size: u64, chunk_size: u64, reserved: u64) -> BitmapGeometry {
    let range = if chunk_size == 0 {
        partition_size
    } else {
        partition_size / chunk_size * chunk_size
    };

    let mut size = MIN_BITMAP_SIZE;
    let mut bytes_per_bit = MIN_BYTES_PER_BIT;
    loop {
        let bits_needed = range.div_ceil(bytes_per_bit);
        let bits_available = size.saturating_sub(reserved) * 8;
        if bits_needed <= bits_available {
            return BitmapGeometry {
                size,
                bytes_per_bit,
            };
        }
        if bytes_per_bit < MAX_BYTES_PER_BIT {
            bytes_per_bit *= 2;
        } else {
            size += MIN_BITMAP_SIZE;
            bytes_per_bit = MIN_BYTES_PER_BIT;
        }
    }
}

/// In-memory dirty-region bitmap
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RebuildBitmap {
    bytes_per_bit: u64,
    bit_count: u64,
    bits: Vec<u8>,
}

impl RebuildBitmap {
    /// Create a clean bitmap covering `data_size` bytes
    #[must_use]
    pub fn new(data_size: u64, bytes_per_bit: u64) -> Self {
        let bit_count = data_size.div_ceil(bytes_per_bit);
        Self {
            bytes_per_bit,
            bit_count,
            bits: vec![0u8; bit_count.div_ceil(8) as usize],
        }
    }

    /// Data bytes tracked by one bit
    #[must_use]
    pub const fn bytes_per_bit(&self) -> u64 {
        self.bytes_per_bit
    }

    /// Number of bits
    #[must_use]
    pub const fn bit_count(&self) -> u64 {
        self.bit_count
    }

    /// Raw bit storage
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Check if a bit is set
    #[must_use]
    pub fn is_set(&self, bit: u64) -> bool {
        bit < self.bit_count && self.bits[(bit / 8) as usize] & (1 << (bit % 8)) != 0
    }

    fn set(&mut self, bit: u64) -> bool {
        let byte = &mut self.bits[(bit / 8) as usize];
        let mask = 1 << (bit % 8);
        let was_clear = *byte & mask == 0;
        *byte |= mask;
        was_clear
    }

    /// Clear a bit
    pub fn clear(&mut self, bit: u64) {
        if bit < self.bit_count {
            self.bits[(bit / 8) as usize] &= !(1 << (bit % 8));
        }
    }

    /// Clear every bit
    pub fn clear_all(&mut self) {
        self.bits.fill(0);
    }

    fn bits_for(&self, offset: u64, len: u64) -> std::ops::Range<u64> {
        if len == 0 {
            return 0..0;
        }
        let first = offset / self.bytes_per_bit;
        let last = (offset + len - 1) / self.bytes_per_bit;
        first.min(self.bit_count)..(last + 1).min(self.bit_count)
    }

    /// Mark a byte range dirty, returning true if any bit was newly set
    pub fn mark(&mut self, offset: u64, len: u64) -> bool {
        let mut changed = false;
        for bit in self.bits_for(offset, len) {
            changed |= self.set(bit);
        }
        changed
    }

    /// Check that no bit covering a byte range is set
    #[must_use]
    pub fn is_clean(&self, offset: u64, len: u64) -> bool {
        self.bits_for(offset, len).all(|bit| !self.is_set(bit))
    }

    /// First set bit at or after `from`
    #[must_use]
    pub fn next_dirty(&self, from: u64) -> Option<u64> {
        (from..self.bit_count).find(|&bit| self.is_set(bit))
    }

    /// Number of set bits
    #[must_use]
    pub fn dirty_count(&self) -> u64 {
        self.bits.iter().map(|b| u64::from(b.count_ones())).sum()
    }

    /// Byte range tracked by a bit, clipped to `data_size`
    #[must_use]
    pub fn bit_range(&self, bit: u64, data_size: u64) -> Extent {
        let offset = bit * self.bytes_per_bit;
        Extent::new(offset, self.bytes_per_bit.min(data_size.saturating_sub(offset)))
    }
}

/// Offset of the primary block for a data region of whole chunks
#[must_use]
pub const fn primary_offset(chunk_count: u64, chunk_size: u64) -> u64 {
    chunk_count * chunk_size
}

/// Bytes to reserve for a bitmap block
#[must_use]
pub const fn bitmap_block_size(geometry: &BitmapGeometry) -> u64 {
    align_up(PRIMARY_HEADER_SIZE as u64 + geometry.size, METADATA_ALIGNMENT)
}

/// Bytes to reserve for a free extent list of `max_extents` records
#[must_use]
pub const fn extent_list_block_size(max_extents: u64) -> u64 {
    align_up(
        PRIMARY_HEADER_SIZE as u64 + max_extents * EXTENT_RECORD_SIZE as u64,
        METADATA_ALIGNMENT,
    )
}

/// Bytes to reserve for one table of contents copy
#[must_use]
pub const fn toc_block_size(slots: u64) -> u64 {
    align_up(
        PRIMARY_HEADER_SIZE as u64 + slots * TOC_ENTRY_SIZE as u64,
        METADATA_ALIGNMENT,
    )
}

/// Reader and writer for one primary-format block
#[derive(Clone)]
pub struct PrimaryMetadataStore {
    device: Arc<dyn MemberDevice>,
    offset: u64,
    size: u64,
}

impl PrimaryMetadataStore {
    /// Create a store for the block at `offset` spanning `size` bytes
    pub fn new(device: Arc<dyn MemberDevice>, offset: u64, size: u64) -> Self {
        Self {
            device,
            offset,
            size,
        }
    }

    /// Block offset on the device
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Block size
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    fn write_block(&self, header: &PrimaryHeader, payload: &[u8]) -> Result<()> {
        if header.used > self.size {
            return Err(Error::invalid_argument(format!(
                "primary block needs {} bytes, {} reserved",
                header.used, self.size
            )));
        }
        let mut buf = BytesMut::with_capacity(header.used as usize);
        buf.put_slice(&header.to_bytes());
        buf.put_slice(payload);
        self.device.write_at(self.offset, &buf)?;
        self.device.sync()?;
        debug!(
            device = self.device.name(),
            offset = self.offset,
            sequence = header.sequence,
            kind = ?header.payload.kind(),
            "wrote primary metadata"
        );
        Ok(())
    }

    /// Read and decode the block header
    pub fn read_header(&self) -> Result<PrimaryHeader> {
        let data = self.device.read_bytes(self.offset, PRIMARY_HEADER_SIZE)?;
        let header = PrimaryHeader::from_bytes(&data)?;
        if header.size != self.size {
            return Err(Error::format(format!(
                "primary block declares {} bytes, expected {}",
                header.size, self.size
            )));
        }
        Ok(header)
    }

    fn read_payload(&self, header: &PrimaryHeader, len: u64) -> Result<Vec<u8>> {
        if PRIMARY_HEADER_SIZE as u64 + len > header.used {
            return Err(Error::format(format!(
                "primary payload of {len} bytes exceeds used size {}",
                header.used
            )));
        }
        self.device
            .read_bytes(self.offset + PRIMARY_HEADER_SIZE as u64, len as usize)
    }

    /// Write a dirty-region bitmap
    pub fn write_bitmap(&self, sequence: u32, bitmap: &RebuildBitmap) -> Result<()> {
        let bytes_per_bit = u32::try_from(bitmap.bytes_per_bit())
            .map_err(|_| Error::invalid_argument("bitmap granularity exceeds 32 bits"))?;
        let bit_count = u32::try_from(bitmap.bit_count())
            .map_err(|_| Error::invalid_argument("bitmap bit count exceeds 32 bits"))?;
        let header = PrimaryHeader {
            size: self.size,
            used: (PRIMARY_HEADER_SIZE + bitmap.as_bytes().len()) as u64,
            sequence,
            payload: PrimaryPayload::Bitmap {
                bytes_per_bit,
                bit_count,
            },
        };
        self.write_block(&header, bitmap.as_bytes())
    }

    /// Read a dirty-region bitmap and the sequence it was written under
    pub fn read_bitmap(&self) -> Result<(u32, RebuildBitmap)> {
        let header = self.read_header()?;
        let PrimaryPayload::Bitmap {
            bytes_per_bit,
            bit_count,
        } = header.payload
        else {
            return Err(Error::format("primary block does not hold a bitmap"));
        };
        if bytes_per_bit == 0 {
            return Err(Error::format("bitmap granularity is zero"));
        }
        let bytes = u64::from(bit_count).div_ceil(8);
        let bits = self.read_payload(&header, bytes)?;
        let bitmap = RebuildBitmap {
            bytes_per_bit: u64::from(bytes_per_bit),
            bit_count: u64::from(bit_count),
            bits,
        };
        Ok((header.sequence, bitmap))
    }

    /// Write a free extent list
    pub fn write_extent_list(&self, sequence: u32, extents: &[Extent]) -> Result<()> {
        let mut payload = BytesMut::with_capacity(extents.len() * EXTENT_RECORD_SIZE);
        for extent in extents {
            put_extent(&mut payload, extent);
        }
        let header = PrimaryHeader {
            size: self.size,
            used: (PRIMARY_HEADER_SIZE + payload.len()) as u64,
            sequence,
            payload: PrimaryPayload::ExtentList {
                extent_count: extents.len() as u64,
            },
        };
        self.write_block(&header, &payload)
    }

    /// Read a free extent list and the sequence it was written under
    pub fn read_extent_list(&self) -> Result<(u32, Vec<Extent>)> {
        let header = self.read_header()?;
        let PrimaryPayload::ExtentList { extent_count } = header.payload else {
            return Err(Error::format("primary block does not hold an extent list"));
        };
        let len = extent_count
            .checked_mul(EXTENT_RECORD_SIZE as u64)
            .ok_or_else(|| Error::format("extent count overflows"))?;
        let payload = self.read_payload(&header, len)?;
        let mut records = payload.as_slice();
        let extents = (0..extent_count)
            .map(|_| get_extent(&mut records))
            .collect::<Result<Vec<_>>>()?;
        Ok((header.sequence, extents))
    }

    /// Write a table of contents copy
    pub fn write_toc(&self, sequence: u32, entries: &[TocEntry]) -> Result<()> {
        let mut payload = BytesMut::with_capacity(entries.len() * TOC_ENTRY_SIZE);
        for entry in entries {
            entry.put(&mut payload);
        }
        let header = PrimaryHeader {
            size: self.size,
            used: (PRIMARY_HEADER_SIZE + payload.len()) as u64,
            sequence,
            payload: PrimaryPayload::LvgToc {
                volume_count: entries.iter().filter(|e| e.is_live()).count() as u64,
            },
        };
        self.write_block(&header, &payload)
    }

    /// Read a table of contents copy and the sequence it was written under
    pub fn read_toc(&self) -> Result<(u32, Vec<TocEntry>)> {
        let header = self.read_header()?;
        let PrimaryPayload::LvgToc { volume_count } = header.payload else {
            return Err(Error::format("primary block does not hold a table of contents"));
        };
        let len = header.used - PRIMARY_HEADER_SIZE as u64;
        if len % TOC_ENTRY_SIZE as u64 != 0 {
            return Err(Error::format("table of contents has a partial entry"));
        }
        let payload = self.read_payload(&header, len)?;
        let mut records = payload.as_slice();
        let entries = (0..len / TOC_ENTRY_SIZE as u64)
            .map(|_| TocEntry::get(&mut records))
            .collect::<Result<Vec<_>>>()?;
        let live = entries.iter().filter(|e| e.is_live()).count() as u64;
        if live != volume_count {
            return Err(Error::format(format!(
                "table of contents counts {volume_count} volumes, found {live}"
            )));
        }
        Ok((header.sequence, entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use uuid::Uuid;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn test_size_bitmap_small_partition() {
        let geometry = size_bitmap(10 * GIB, 32 * 1024, 0);
        assert_eq!(
            geometry,
            BitmapGeometry {
                size: MIN_BITMAP_SIZE,
                bytes_per_bit: MIN_BYTES_PER_BIT
            }
        );
    }

    #[test]
    fn test_size_bitmap_small_mirror() {
        // 8MB member: 16 bits at the minimum granularity, minimum allocation
        let geometry = size_bitmap(8 * 1024 * 1024, 64 * 1024, 0);
        assert_eq!(geometry.size, 128 * 1024);
        assert_eq!(geometry.bytes_per_bit, 512 * 1024);
    }

    #[test]
    fn test_size_bitmap_doubles_granularity() {
        // 1M bits fit in 128KB; 1TB at 512KB/bit needs 2M bits
        let geometry = size_bitmap(1024 * GIB, 32 * 1024, 0);
        assert_eq!(geometry.size, MIN_BITMAP_SIZE);
        assert_eq!(geometry.bytes_per_bit, 1024 * 1024);
    }

    #[test]
    fn test_size_bitmap_grows_allocation() {
        // at 32MB/bit a 128KB bitmap covers 32TB; 40TB needs a larger one,
        // which again only fits once the granularity climbs back to 32MB
        let geometry = size_bitmap(40 * 1024 * GIB, 32 * 1024, 0);
        assert_eq!(geometry.size, 2 * MIN_BITMAP_SIZE);
        assert_eq!(geometry.bytes_per_bit, MAX_BYTES_PER_BIT);
    }

    #[test]
    fn test_size_bitmap_honours_reserved_bytes() {
        let plain = size_bitmap(512 * GIB, 32 * 1024, 0);
        assert_eq!(plain.bytes_per_bit, MIN_BYTES_PER_BIT);
        let reserved = size_bitmap(512 * GIB, 32 * 1024, 4096);
        assert_eq!(reserved.bytes_per_bit, 1024 * 1024);
    }

    #[test]
    fn test_rebuild_bitmap_marks() {
        let mut bitmap = RebuildBitmap::new(10 * MIN_BYTES_PER_BIT, MIN_BYTES_PER_BIT);
        assert_eq!(bitmap.bit_count(), 10);
        assert!(bitmap.is_clean(0, 10 * MIN_BYTES_PER_BIT));

        assert!(bitmap.mark(MIN_BYTES_PER_BIT - 1, 2));
        assert!(!bitmap.mark(MIN_BYTES_PER_BIT, 1));
        assert!(bitmap.is_set(0) && bitmap.is_set(1));
        assert_eq!(bitmap.dirty_count(), 2);
        assert_eq!(bitmap.next_dirty(0), Some(0));
        assert_eq!(bitmap.next_dirty(2), None);
        assert!(bitmap.is_clean(2 * MIN_BYTES_PER_BIT, 4096));

        bitmap.clear(0);
        assert_eq!(bitmap.next_dirty(0), Some(1));
        bitmap.clear_all();
        assert_eq!(bitmap.dirty_count(), 0);
        assert_eq!(
            bitmap.bit_range(9, 10 * MIN_BYTES_PER_BIT - 100),
            Extent::new(9 * MIN_BYTES_PER_BIT, MIN_BYTES_PER_BIT - 100)
        );
    }

    #[test]
    fn test_bitmap_block_roundtrip() {
        let device = Arc::new(MemDevice::new("d0", 1 << 20));
        let geometry = size_bitmap(1 << 30, 4096, 0);
        let store = PrimaryMetadataStore::new(device, 4096, bitmap_block_size(&geometry));

        let mut bitmap = RebuildBitmap::new(1 << 30, geometry.bytes_per_bit);
        bitmap.mark(3 * geometry.bytes_per_bit, 1);
        store.write_bitmap(9, &bitmap).unwrap();

        let (sequence, loaded) = store.read_bitmap().unwrap();
        assert_eq!(sequence, 9);
        assert_eq!(loaded, bitmap);
        assert!(store.read_extent_list().is_err());
    }

    #[test]
    fn test_extent_list_block_roundtrip() {
        let device = Arc::new(MemDevice::new("d0", 1 << 20));
        let store = PrimaryMetadataStore::new(device.clone(), 8192, extent_list_block_size(4));
        let extents = vec![Extent::new(0, 4096), Extent::new(65536, 8192)];
        store.write_extent_list(3, &extents).unwrap();
        assert_eq!(store.read_extent_list().unwrap(), (3, extents));

        let too_many = vec![Extent::new(0, 1); 300];
        assert!(store.write_extent_list(4, &too_many).is_err());

        // a store expecting a different block size rejects the block
        let other = PrimaryMetadataStore::new(device, 8192, 2 * extent_list_block_size(4));
        assert!(matches!(other.read_header(), Err(Error::Format(_))));
    }

    #[test]
    fn test_toc_block_roundtrip() {
        let device = Arc::new(MemDevice::new("d0", 1 << 20));
        let store = PrimaryMetadataStore::new(device.clone(), 0, toc_block_size(4));
        let entries = vec![
            TocEntry {
                volume_uuid: Uuid::new_v4(),
                volume_size: 1 << 20,
                entry_offset: 0,
                entry_size: 8192,
            },
            TocEntry::deleted(),
            TocEntry::empty(),
            TocEntry::empty(),
        ];
        store.write_toc(5, &entries).unwrap();
        assert_eq!(store.read_toc().unwrap(), (5, entries));

        // corrupt the live count
        device.write_at(56, &7u64.to_be_bytes()).unwrap();
        assert!(matches!(store.read_toc(), Err(Error::Format(_))));
    }
}
