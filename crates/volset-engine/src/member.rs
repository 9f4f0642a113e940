//! Set members

use serde::Serialize;
use std::sync::Arc;
use volset_common::{Error, MemberId, MemberState, Result};
use volset_storage::header::header_offset;
use volset_storage::{MemberDevice, MemberHeaderStore, PrimaryMetadataStore};

/// A member of a set
#[derive(Clone)]
pub struct Member {
    /// Member UUID
    pub id: MemberId,
    /// Position in the set, `None` for spares
    pub index: Option<u32>,
    /// Backing device; `None` when the member is missing
    pub device: Option<Arc<dyn MemberDevice>>,
    /// Current state
    pub state: MemberState,
    /// Chunks in the data region
    pub chunk_count: u64,
    /// Start of the data region in the group address space
    pub group_offset: u64,
    /// Sequence number of the last header seen or written
    pub sequence: u32,
}

impl std::fmt::Debug for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Member")
            .field("id", &self.id)
            .field("index", &self.index)
            .field("device", &self.device.as_ref().map(|d| d.name().to_string()))
            .field("state", &self.state)
            .field("chunk_count", &self.chunk_count)
            .field("group_offset", &self.group_offset)
            .finish()
    }
}

impl Member {
    /// A new member backed by a device
    pub fn new(device: Arc<dyn MemberDevice>, index: Option<u32>, state: MemberState) -> Self {
        Self {
            id: MemberId::new(),
            index,
            device: Some(device),
            state,
            chunk_count: 0,
            group_offset: 0,
            sequence: 0,
        }
    }

    /// A member named by the set but not present
    #[must_use]
    pub const fn missing(id: MemberId, index: u32, chunk_count: u64, group_offset: u64) -> Self {
        Self {
            id,
            index: Some(index),
            device: None,
            state: MemberState::Broken,
            chunk_count,
            group_offset,
            sequence: 0,
        }
    }

    /// Backing device, or an error if the member is missing
    pub fn device(&self) -> Result<&Arc<dyn MemberDevice>> {
        self.device
            .as_ref()
            .ok_or_else(|| Error::member_state(format!("member {} is missing", self.id)))
    }

    /// Device name for logs
    #[must_use]
    pub fn device_name(&self) -> String {
        self.device
            .as_ref()
            .map_or_else(|| "<missing>".to_string(), |d| d.name().to_string())
    }

    /// Data region size
    #[must_use]
    pub const fn data_size(&self, chunk_size: u64) -> u64 {
        self.chunk_count * chunk_size
    }

    /// Header store for this member
    pub fn header_store(&self) -> Result<MemberHeaderStore> {
        Ok(MemberHeaderStore::new(self.device()?.clone()))
    }

    /// Primary metadata store for this member
    pub fn primary_store(&self, chunk_size: u64, primary_size: u64) -> Result<PrimaryMetadataStore> {
        Ok(PrimaryMetadataStore::new(
            self.device()?.clone(),
            volset_storage::primary::primary_offset(self.chunk_count, chunk_size),
            primary_size,
        ))
    }

    /// Properties for callers
    #[must_use]
    pub fn info(&self, chunk_size: u64) -> MemberInfo {
        MemberInfo {
            id: self.id,
            index: self.index,
            device: self.device_name(),
            state: self.state,
            device_size: self.device.as_ref().map_or(0, |d| d.size()),
            block_size: self.device.as_ref().map_or(0, |d| d.block_size()),
            header_offset: self
                .device
                .as_ref()
                .and_then(|d| header_offset(d.size())),
            data_size: self.data_size(chunk_size),
            chunk_count: self.chunk_count,
            group_offset: self.group_offset,
            sequence: self.sequence,
        }
    }
}

/// Usable chunks on a device after the header and primary metadata
pub fn usable_chunks(device: &dyn MemberDevice, chunk_size: u64, primary_size: u64) -> Result<u64> {
    let header = header_offset(device.size()).unwrap_or(0);
    let chunks = header.saturating_sub(primary_size) / chunk_size;
    if chunks == 0 {
        return Err(Error::InsufficientSpace {
            required: chunk_size + primary_size + volset_storage::MEMBER_HEADER_SIZE,
            available: device.size(),
        });
    }
    Ok(chunks)
}

/// Member properties reported to callers
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MemberInfo {
    /// Member UUID
    pub id: MemberId,
    /// Position in the set, `None` for spares
    pub index: Option<u32>,
    /// Device name
    pub device: String,
    /// Current state
    pub state: MemberState,
    /// Device size in bytes
    pub device_size: u64,
    /// Native block size
    pub block_size: u64,
    /// Header offset on the device
    pub header_offset: Option<u64>,
    /// Data region size
    pub data_size: u64,
    /// Chunks in the data region
    pub chunk_count: u64,
    /// Start of the data region in the group address space
    pub group_offset: u64,
    /// Sequence number of the last header seen or written
    pub sequence: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use volset_storage::MemDevice;

    #[test]
    fn test_usable_chunks() {
        let device = MemDevice::new("d0", 1 << 20);
        // 1MB - 4KB header - 8KB primary, in 64KB chunks
        assert_eq!(usable_chunks(&device, 65536, 8192).unwrap(), 15);
        assert_eq!(usable_chunks(&device, 65536, 0).unwrap(), 15);
        assert_eq!(usable_chunks(&device, 4096, 0).unwrap(), 255);

        let tiny = MemDevice::new("d1", 8192);
        assert!(matches!(
            usable_chunks(&tiny, 65536, 0),
            Err(Error::InsufficientSpace { .. })
        ));
    }

    #[test]
    fn test_missing_member() {
        let member = Member::missing(MemberId::new(), 2, 10, 4096);
        assert!(member.device().is_err());
        assert_eq!(member.state, MemberState::Broken);
        let info = member.info(4096);
        assert_eq!(info.device, "<missing>");
        assert_eq!(info.data_size, 40960);
        assert_eq!(info.header_offset, None);
    }
}
