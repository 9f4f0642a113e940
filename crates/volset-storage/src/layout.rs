//! On-disk format definitions
//!
//! Member layout:
//! ```text
//! +------------------------+  offset 0
//! |   Data region          |  chunk_count * chunk_size
//! |   (LVG member 0: the   |
//! |    secondary metadata  |
//! |    sits at its tail)   |
//! +------------------------+  chunk_count * chunk_size
//! |   Primary metadata     |  512B header + bitmap / extent list
//! +------------------------+
//! |   (slack)              |
//! +------------------------+  floor(size / 4KB) * 4KB - 4KB
//! |   Member header        |  4KB
//! +------------------------+
//! ```
//!
//! Every structure here is fixed-size and written big-endian regardless
//! of host byte order. UUID fields hold the hyphenated text form padded
//! with NULs.

use crate::extent::Extent;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use volset_common::{Error, Result, SetLevel};

/// Build a NUL padded magic field at compile time
const fn padded<const N: usize>(text: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    let mut i = 0;
    while i < text.len() {
        out[i] = text[i];
        i += 1;
    }
    out
}

/// Member header signature
pub const MEMBER_SIGNATURE: [u8; 16] = padded(b"VolSetMemberHdr");

/// Member header size, also the header placement granularity
pub const MEMBER_HEADER_SIZE: u64 = 4096;

/// Size of a textual UUID field
pub const UUID_FIELD_SIZE: usize = 64;

/// Bytes before the member property blob
const MEMBER_FIXED_SIZE: usize = 16 + UUID_FIELD_SIZE * 2 + 8;

/// Room left in the member header for the property blob
pub const MEMBER_BLOB_CAPACITY: usize = MEMBER_HEADER_SIZE as usize - MEMBER_FIXED_SIZE;

/// Current header format version
pub const HEADER_VERSION: u32 = 2;

/// Oldest header version that supports logical volume operations
pub const MIN_LVG_VERSION: u32 = 2;

/// Oldest header version that supports bitmap rebuilds
pub const MIN_QUICK_REBUILD_VERSION: u32 = 2;

/// Primary metadata magic
pub const PRIMARY_MAGIC: [u8; 32] = padded(b"VolSet Primary Metadata Block");

/// Primary metadata header size
pub const PRIMARY_HEADER_SIZE: usize = 512;

/// Extent record size
pub const EXTENT_RECORD_SIZE: usize = 16;

/// Logical volume entry magic
pub const LV_MAGIC: [u8; 32] = padded(b"VolSet Logical Volume Entry");

/// Fixed part of a logical volume header
pub const LV_HEADER_SIZE: usize = 64;

/// Logical volume entry size (one slot)
pub const LV_ENTRY_SIZE: u64 = 4096;

/// Table of contents entry size
pub const TOC_ENTRY_SIZE: usize = 128;

/// Reserved UUID marking a removed table of contents entry
pub const DELETED_UUID: Uuid = Uuid::from_u128(u128::MAX);

/// Alignment used for metadata regions
pub const METADATA_ALIGNMENT: u64 = 4096;

/// Align a value up to a power-of-two boundary
#[inline]
#[must_use]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

fn put_uuid(buf: &mut BytesMut, uuid: &Uuid) {
    let mut field = [0u8; UUID_FIELD_SIZE];
    if !uuid.is_nil() {
        let text = uuid.hyphenated().to_string();
        field[..text.len()].copy_from_slice(text.as_bytes());
    }
    buf.put_slice(&field);
}

fn get_uuid(buf: &mut &[u8]) -> Result<Uuid> {
    let mut field = [0u8; UUID_FIELD_SIZE];
    buf.copy_to_slice(&mut field);
    let len = field.iter().position(|&b| b == 0).unwrap_or(UUID_FIELD_SIZE);
    if len == 0 {
        return Ok(Uuid::nil());
    }
    let text = std::str::from_utf8(&field[..len])
        .map_err(|_| Error::format("uuid field is not text"))?;
    Uuid::parse_str(text).map_err(|e| Error::format(format!("invalid uuid field: {e}")))
}

fn put_blob<T: Serialize>(buf: &mut BytesMut, value: &T, capacity: usize) -> Result<usize> {
    let blob = serde_json::to_vec(value)
        .map_err(|e| Error::format(format!("failed to encode property blob: {e}")))?;
    // one byte for the NUL terminator
    if blob.len() >= capacity {
        return Err(Error::format(format!(
            "property blob of {} bytes exceeds capacity {}",
            blob.len(),
            capacity
        )));
    }
    buf.put_slice(&blob);
    buf.put_u8(0);
    Ok(blob.len() + 1)
}

fn get_blob<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T> {
    let len = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    serde_json::from_slice(&data[..len])
        .map_err(|e| Error::format(format!("invalid property blob: {e}")))
}

/// Check a decoded structure's sequence against the set's committed sequence
pub fn check_sequence(found: u32, committed: u32) -> Result<()> {
    if found > committed {
        return Err(Error::SequenceConflict { found, committed });
    }
    Ok(())
}

/// Properties stored in the member header blob
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderProperties {
    /// Header format version
    pub version: u32,
    /// Set name
    pub set_name: String,
    /// Set level
    pub level: SetLevel,
    /// Committed set sequence number
    pub sequence: u32,
    /// Index in the set, `None` for spares
    pub member_index: Option<u32>,
    /// Set chunk size
    pub chunk_size: u64,
    /// Chunks in this member's data region
    pub chunk_count: u64,
    /// Bytes reserved for primary metadata
    pub primary_size: u64,
    /// Bytes reserved for secondary metadata (LVG member 0)
    pub secondary_size: u64,
    /// Volume entry slots in the secondary metadata (LVG)
    #[serde(default)]
    pub volume_slots: u32,
    /// Start of this member's data in the group address space (LVG)
    pub group_offset: u64,
    /// Dirty region tracking enabled
    pub quick_rebuild: bool,
    /// Data members by index
    pub members: Vec<Uuid>,
    /// Data region size of each member, by index
    #[serde(default)]
    pub member_sizes: Vec<u64>,
    /// Group offset of each member, by index
    #[serde(default)]
    pub member_offsets: Vec<u64>,
    /// Spare members
    pub spares: Vec<Uuid>,
}

/// Member header
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberHeader {
    /// Owning set
    pub set_uuid: Uuid,
    /// This member
    pub member_uuid: Uuid,
    /// Bytes this member exposes below its header
    pub size: u64,
    /// Typed property blob
    pub properties: HeaderProperties,
}

impl MemberHeader {
    /// Serialize to exactly one header page
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(MEMBER_HEADER_SIZE as usize);
        buf.put_slice(&MEMBER_SIGNATURE);
        put_uuid(&mut buf, &self.set_uuid);
        put_uuid(&mut buf, &self.member_uuid);
        buf.put_u64(self.size);
        put_blob(&mut buf, &self.properties, MEMBER_BLOB_CAPACITY)?;
        buf.resize(MEMBER_HEADER_SIZE as usize, 0);
        Ok(buf.to_vec())
    }

    /// Parse a header page
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != MEMBER_HEADER_SIZE as usize {
            return Err(Error::format(format!(
                "member header is {} bytes, expected {}",
                data.len(),
                MEMBER_HEADER_SIZE
            )));
        }
        if data[..16] != MEMBER_SIGNATURE {
            return Err(Error::format("invalid member header signature"));
        }

        let mut buf = &data[16..];
        let set_uuid = get_uuid(&mut buf)?;
        let member_uuid = get_uuid(&mut buf)?;
        let size = buf.get_u64();
        let properties = get_blob(buf)?;

        Ok(Self {
            set_uuid,
            member_uuid,
            size,
            properties,
        })
    }

    /// Declared size of a header page, if the signature matches
    #[must_use]
    pub fn declared_size(data: &[u8]) -> Option<u64> {
        if data.len() < MEMBER_FIXED_SIZE || data[..16] != MEMBER_SIGNATURE {
            return None;
        }
        let mut buf = &data[MEMBER_FIXED_SIZE - 8..MEMBER_FIXED_SIZE];
        Some(buf.get_u64())
    }
}

/// Primary metadata block type
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum PrimaryType {
    /// Mirror dirty-region bitmap
    Bitmap = 1,
    /// LVG free extent list
    ExtentList = 2,
    /// LVG table of contents header
    LvgToc = 3,
}

impl TryFrom<u32> for PrimaryType {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            1 => Ok(Self::Bitmap),
            2 => Ok(Self::ExtentList),
            3 => Ok(Self::LvgToc),
            _ => Err(Error::format(format!("unknown primary metadata type {value}"))),
        }
    }
}

/// Type-specific part of the primary header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrimaryPayload {
    /// Bitmap granularity and bit count
    Bitmap { bytes_per_bit: u32, bit_count: u32 },
    /// Number of extent records following the header
    ExtentList { extent_count: u64 },
    /// Number of live volumes in the table of contents
    LvgToc { volume_count: u64 },
}

impl PrimaryPayload {
    /// Block type for this payload
    #[must_use]
    pub const fn kind(&self) -> PrimaryType {
        match self {
            Self::Bitmap { .. } => PrimaryType::Bitmap,
            Self::ExtentList { .. } => PrimaryType::ExtentList,
            Self::LvgToc { .. } => PrimaryType::LvgToc,
        }
    }
}

/// Primary metadata header (512 bytes)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrimaryHeader {
    /// Total bytes reserved for the block
    pub size: u64,
    /// Bytes in use, header included
    pub used: u64,
    /// Set sequence number at the time of writing
    pub sequence: u32,
    /// Type-specific fields
    pub payload: PrimaryPayload,
}

impl PrimaryHeader {
    /// Serialize to exactly 512 bytes
    #[must_use]
    pub fn to_bytes(&self) -> [u8; PRIMARY_HEADER_SIZE] {
        let mut buf = BytesMut::with_capacity(PRIMARY_HEADER_SIZE);
        buf.put_slice(&PRIMARY_MAGIC);
        buf.put_u64(self.size);
        buf.put_u64(self.used);
        buf.put_u32(self.payload.kind() as u32);
        buf.put_u32(self.sequence);
        match self.payload {
            PrimaryPayload::Bitmap {
                bytes_per_bit,
                bit_count,
            } => {
                buf.put_u32(bytes_per_bit);
                buf.put_u32(bit_count);
            }
            PrimaryPayload::ExtentList { extent_count } => buf.put_u64(extent_count),
            PrimaryPayload::LvgToc { volume_count } => buf.put_u64(volume_count),
        }
        buf.resize(PRIMARY_HEADER_SIZE, 0);

        let mut out = [0u8; PRIMARY_HEADER_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    /// Parse from the first 512 bytes of a block
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < PRIMARY_HEADER_SIZE {
            return Err(Error::format(format!(
                "primary metadata header is {} bytes, expected {}",
                data.len(),
                PRIMARY_HEADER_SIZE
            )));
        }
        if data[..32] != PRIMARY_MAGIC {
            return Err(Error::format("invalid primary metadata magic"));
        }

        let mut buf = &data[32..PRIMARY_HEADER_SIZE];
        let size = buf.get_u64();
        let used = buf.get_u64();
        let kind = PrimaryType::try_from(buf.get_u32())?;
        let sequence = buf.get_u32();
        let payload = match kind {
            PrimaryType::Bitmap => PrimaryPayload::Bitmap {
                bytes_per_bit: buf.get_u32(),
                bit_count: buf.get_u32(),
            },
            PrimaryType::ExtentList => PrimaryPayload::ExtentList {
                extent_count: buf.get_u64(),
            },
            PrimaryType::LvgToc => PrimaryPayload::LvgToc {
                volume_count: buf.get_u64(),
            },
        };

        if used < PRIMARY_HEADER_SIZE as u64 || used > size {
            return Err(Error::format(format!(
                "primary metadata uses {used} of {size} bytes"
            )));
        }

        Ok(Self {
            size,
            used,
            sequence,
            payload,
        })
    }
}

/// Append an extent record
pub fn put_extent(buf: &mut BytesMut, extent: &Extent) {
    buf.put_u64(extent.offset);
    buf.put_u64(extent.length);
}

/// Read an extent record
pub fn get_extent(buf: &mut &[u8]) -> Result<Extent> {
    if buf.remaining() < EXTENT_RECORD_SIZE {
        return Err(Error::format("truncated extent record"));
    }
    let extent = Extent::new(buf.get_u64(), buf.get_u64());
    if extent.checked_end().is_none() {
        return Err(Error::format(format!(
            "extent record {}+{} overflows",
            extent.offset, extent.length
        )));
    }
    Ok(extent)
}

/// Properties stored in the logical volume entry blob
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeProperties {
    /// Volume UUID
    pub volume_uuid: Uuid,
    /// Parent volume for snapshots and bitmaps
    pub parent_uuid: Option<Uuid>,
    /// Volume type flag bits
    pub kind: u32,
    /// Human-readable name
    pub name: String,
    /// Size claimed by the creator
    pub claimed_size: u64,
    /// Set sequence number this entry was written under
    pub sequence: u32,
    /// Creation timestamp (Unix epoch)
    pub created_at: u64,
}

/// Logical volume entry: header, property blob and extent array in one slot
///
/// The 64-byte header is the magic, then four big-endian `u32` words: the
/// size of the whole entry (always `LV_ENTRY_SIZE`, not the header length),
/// the offset of the extent array, the extent count and a CRC32C of the
/// bytes between the header and the end of the extent array.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeEntry {
    /// Typed property blob
    pub properties: VolumeProperties,
    /// Extents in group coordinates, in volume order
    pub extents: Vec<Extent>,
}

impl VolumeEntry {
    /// Maximum extents that fit next to a given blob size
    #[must_use]
    pub const fn extent_capacity(extents_start: usize) -> usize {
        (LV_ENTRY_SIZE as usize).saturating_sub(extents_start) / EXTENT_RECORD_SIZE
    }

    /// Serialize into one entry slot
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut body = BytesMut::with_capacity(LV_ENTRY_SIZE as usize);
        put_blob(
            &mut body,
            &self.properties,
            LV_ENTRY_SIZE as usize - LV_HEADER_SIZE,
        )?;
        let extents_start = align_up((LV_HEADER_SIZE + body.len()) as u64, 16) as usize;
        if self.extents.len() > Self::extent_capacity(extents_start) {
            return Err(Error::format(format!(
                "{} extents do not fit in a volume entry",
                self.extents.len()
            )));
        }
        body.resize(extents_start - LV_HEADER_SIZE, 0);
        for extent in &self.extents {
            put_extent(&mut body, extent);
        }

        let mut buf = BytesMut::with_capacity(LV_ENTRY_SIZE as usize);
        buf.put_slice(&LV_MAGIC);
        buf.put_u32(LV_ENTRY_SIZE as u32);
        buf.put_u32(extents_start as u32);
        buf.put_u32(self.extents.len() as u32);
        buf.put_u32(crc32c::crc32c(&body));
        buf.put_bytes(0, 16);
        buf.put_slice(&body);
        buf.resize(LV_ENTRY_SIZE as usize, 0);
        Ok(buf.to_vec())
    }

    /// Parse one entry slot
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < LV_ENTRY_SIZE as usize {
            return Err(Error::format("volume entry too small"));
        }
        if data[..32] != LV_MAGIC {
            return Err(Error::format("invalid volume entry magic"));
        }

        let mut buf = &data[32..LV_HEADER_SIZE];
        let entry_size = buf.get_u32() as usize;
        let extents_start = buf.get_u32() as usize;
        let extents_count = buf.get_u32() as usize;
        let checksum = buf.get_u32();

        if entry_size as u64 != LV_ENTRY_SIZE {
            return Err(Error::format(format!(
                "volume entry declares {entry_size} bytes, expected {LV_ENTRY_SIZE}"
            )));
        }
        if extents_start < LV_HEADER_SIZE
            || extents_count > Self::extent_capacity(extents_start)
        {
            return Err(Error::format("volume entry extent array out of bounds"));
        }

        let body_end = extents_start + extents_count * EXTENT_RECORD_SIZE;
        let body = &data[LV_HEADER_SIZE..body_end];
        if crc32c::crc32c(body) != checksum {
            return Err(Error::format("volume entry checksum mismatch"));
        }

        let properties = get_blob(&data[LV_HEADER_SIZE..extents_start])?;
        let mut records = &data[extents_start..body_end];
        let extents = (0..extents_count)
            .map(|_| get_extent(&mut records))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            properties,
            extents,
        })
    }
}

/// Table of contents entry (128 bytes)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TocEntry {
    /// Volume UUID; nil for never-used slots, `DELETED_UUID` for removed ones
    pub volume_uuid: Uuid,
    /// Claimed volume size
    pub volume_size: u64,
    /// Offset of the volume entry within the master volume
    pub entry_offset: u64,
    /// Size of the volume entry
    pub entry_size: u64,
}

impl TocEntry {
    /// A never-used slot
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            volume_uuid: Uuid::nil(),
            volume_size: 0,
            entry_offset: 0,
            entry_size: 0,
        }
    }

    /// A removed slot
    #[must_use]
    pub const fn deleted() -> Self {
        Self {
            volume_uuid: DELETED_UUID,
            volume_size: 0,
            entry_offset: 0,
            entry_size: 0,
        }
    }

    /// True when the slot holds a volume
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.volume_uuid.is_nil() && self.volume_uuid != DELETED_UUID
    }

    /// Serialize to 128 bytes
    pub fn put(&self, buf: &mut BytesMut) {
        put_uuid(buf, &self.volume_uuid);
        buf.put_u64(self.volume_size);
        buf.put_u64(self.entry_offset);
        buf.put_u64(self.entry_size);
        buf.put_bytes(0, 40);
    }

    /// Parse 128 bytes
    pub fn get(buf: &mut &[u8]) -> Result<Self> {
        if buf.remaining() < TOC_ENTRY_SIZE {
            return Err(Error::format("truncated table of contents entry"));
        }
        let volume_uuid = get_uuid(buf)?;
        let volume_size = buf.get_u64();
        let entry_offset = buf.get_u64();
        let entry_size = buf.get_u64();
        buf.advance(40);
        Ok(Self {
            volume_uuid,
            volume_size,
            entry_offset,
            entry_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_properties() -> HeaderProperties {
        HeaderProperties {
            version: HEADER_VERSION,
            set_name: "mirror0".into(),
            level: SetLevel::Mirror,
            sequence: 7,
            member_index: Some(1),
            chunk_size: 32 * 1024,
            chunk_count: 1000,
            primary_size: 135_168,
            secondary_size: 0,
            volume_slots: 0,
            group_offset: 0,
            quick_rebuild: true,
            members: vec![Uuid::new_v4(), Uuid::new_v4()],
            member_sizes: vec![32 * 1024 * 1000; 2],
            member_offsets: vec![0, 0],
            spares: vec![],
        }
    }

    #[test]
    fn test_member_header_roundtrip() {
        let header = MemberHeader {
            set_uuid: Uuid::new_v4(),
            member_uuid: Uuid::new_v4(),
            size: 32 * 1024 * 1000,
            properties: sample_properties(),
        };
        let bytes = header.to_bytes().unwrap();
        assert_eq!(bytes.len(), MEMBER_HEADER_SIZE as usize);
        assert_eq!(&bytes[..16], &MEMBER_SIGNATURE);
        // size is big-endian right after the two uuid fields
        assert_eq!(&bytes[144..152], &header.size.to_be_bytes());

        let decoded = MemberHeader::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(MemberHeader::declared_size(&bytes), Some(header.size));
    }

    #[test]
    fn test_member_header_rejects_bad_signature_and_size() {
        let header = MemberHeader {
            set_uuid: Uuid::new_v4(),
            member_uuid: Uuid::new_v4(),
            size: 1 << 20,
            properties: sample_properties(),
        };
        let mut bytes = header.to_bytes().unwrap();
        assert!(matches!(
            MemberHeader::from_bytes(&bytes[..2048]),
            Err(Error::Format(_))
        ));
        bytes[0] ^= 0xff;
        assert!(matches!(MemberHeader::from_bytes(&bytes), Err(Error::Format(_))));
        assert_eq!(MemberHeader::declared_size(&bytes), None);
    }

    #[test]
    fn test_member_header_blob_too_large() {
        let mut properties = sample_properties();
        properties.members = (0..200).map(|_| Uuid::new_v4()).collect();
        let header = MemberHeader {
            set_uuid: Uuid::new_v4(),
            member_uuid: Uuid::new_v4(),
            size: 1 << 20,
            properties,
        };
        assert!(matches!(header.to_bytes(), Err(Error::Format(_))));
    }

    #[test]
    fn test_primary_header_layout() {
        let header = PrimaryHeader {
            size: 8192,
            used: 512 + 3 * 16,
            sequence: 0x0102_0304,
            payload: PrimaryPayload::ExtentList { extent_count: 3 },
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), 512);
        assert_eq!(&bytes[..32], &PRIMARY_MAGIC);
        assert_eq!(&bytes[32..40], &8192u64.to_be_bytes());
        assert_eq!(&bytes[48..52], &2u32.to_be_bytes());
        assert_eq!(&bytes[52..56], &[1, 2, 3, 4]);
        assert_eq!(&bytes[56..64], &3u64.to_be_bytes());
        assert!(bytes[64..].iter().all(|&b| b == 0));
        assert_eq!(PrimaryHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_primary_header_variants_roundtrip() {
        for payload in [
            PrimaryPayload::Bitmap {
                bytes_per_bit: 512 * 1024,
                bit_count: 16,
            },
            PrimaryPayload::LvgToc { volume_count: 9 },
        ] {
            let header = PrimaryHeader {
                size: 4096,
                used: 600,
                sequence: 3,
                payload,
            };
            assert_eq!(PrimaryHeader::from_bytes(&header.to_bytes()).unwrap(), header);
        }
    }

    #[test]
    fn test_primary_header_rejects_garbage() {
        assert!(matches!(
            PrimaryHeader::from_bytes(&[0u8; 512]),
            Err(Error::Format(_))
        ));
        let mut bytes = PrimaryHeader {
            size: 4096,
            used: 512,
            sequence: 1,
            payload: PrimaryPayload::LvgToc { volume_count: 0 },
        }
        .to_bytes();
        bytes[51] = 9;
        assert!(PrimaryHeader::from_bytes(&bytes).is_err());
        assert!(PrimaryHeader::from_bytes(&bytes[..100]).is_err());
    }

    #[test]
    fn test_extent_record_big_endian() {
        let mut buf = BytesMut::new();
        put_extent(&mut buf, &Extent::new(0x10, 0x2000));
        assert_eq!(buf.len(), EXTENT_RECORD_SIZE);
        assert_eq!(&buf[..8], &0x10u64.to_be_bytes());
        let mut slice = &buf[..];
        assert_eq!(get_extent(&mut slice).unwrap(), Extent::new(0x10, 0x2000));
        let mut short = &buf[..10];
        assert!(get_extent(&mut short).is_err());
    }

    #[test]
    fn test_extent_record_rejects_overflow() {
        let mut buf = BytesMut::new();
        put_extent(&mut buf, &Extent::new(u64::MAX - 1, 10));
        let mut slice = &buf[..];
        assert!(matches!(get_extent(&mut slice), Err(Error::Format(_))));
    }

    #[test]
    fn test_volume_entry_roundtrip() {
        let entry = VolumeEntry {
            properties: VolumeProperties {
                volume_uuid: Uuid::new_v4(),
                parent_uuid: None,
                kind: 1,
                name: "data".into(),
                claimed_size: 3 << 20,
                sequence: 12,
                created_at: 1_700_000_000,
            },
            extents: vec![Extent::new(0, 1 << 20), Extent::new(4 << 20, 2 << 20)],
        };
        let bytes = entry.to_bytes().unwrap();
        assert_eq!(bytes.len(), LV_ENTRY_SIZE as usize);
        assert_eq!(&bytes[32..36], &4096u32.to_be_bytes());
        assert_eq!(VolumeEntry::from_bytes(&bytes).unwrap(), entry);
    }

    #[test]
    fn test_volume_entry_detects_corruption() {
        let entry = VolumeEntry {
            properties: VolumeProperties {
                volume_uuid: Uuid::new_v4(),
                parent_uuid: Some(Uuid::new_v4()),
                kind: 0x10,
                name: "snap".into(),
                claimed_size: 4096,
                sequence: 1,
                created_at: 0,
            },
            extents: vec![Extent::new(8192, 4096)],
        };
        let mut bytes = entry.to_bytes().unwrap();
        let last = LV_HEADER_SIZE + 10;
        bytes[last] ^= 0x55;
        assert!(matches!(VolumeEntry::from_bytes(&bytes), Err(Error::Format(_))));
    }

    #[test]
    fn test_volume_entry_size_word() {
        let entry = VolumeEntry {
            properties: VolumeProperties {
                volume_uuid: Uuid::new_v4(),
                parent_uuid: None,
                kind: 0,
                name: "data".into(),
                claimed_size: 8192,
                sequence: 1,
                created_at: 0,
            },
            extents: vec![Extent::new(0, 8192)],
        };
        let mut bytes = entry.to_bytes().unwrap();
        // the word after the magic is the whole entry size, not LV_HEADER_SIZE
        assert_eq!(&bytes[32..36], &(LV_ENTRY_SIZE as u32).to_be_bytes());
        bytes[32..36].copy_from_slice(&(LV_HEADER_SIZE as u32).to_be_bytes());
        assert!(matches!(VolumeEntry::from_bytes(&bytes), Err(Error::Format(_))));
    }

    #[test]
    fn test_toc_entry_roundtrip() {
        let entry = TocEntry {
            volume_uuid: Uuid::new_v4(),
            volume_size: 1 << 30,
            entry_offset: 24_576,
            entry_size: LV_ENTRY_SIZE,
        };
        let mut buf = BytesMut::new();
        entry.put(&mut buf);
        TocEntry::deleted().put(&mut buf);
        TocEntry::empty().put(&mut buf);
        assert_eq!(buf.len(), 3 * TOC_ENTRY_SIZE);

        let mut slice = &buf[..];
        assert_eq!(TocEntry::get(&mut slice).unwrap(), entry);
        let deleted = TocEntry::get(&mut slice).unwrap();
        assert!(!deleted.is_live());
        assert_eq!(deleted.volume_uuid, DELETED_UUID);
        let empty = TocEntry::get(&mut slice).unwrap();
        assert!(empty.volume_uuid.is_nil());
    }

    #[test]
    fn test_sequence_check() {
        assert!(check_sequence(4, 4).is_ok());
        assert!(check_sequence(3, 4).is_ok());
        assert!(matches!(
            check_sequence(5, 4),
            Err(Error::SequenceConflict {
                found: 5,
                committed: 4
            })
        ));
    }
}
