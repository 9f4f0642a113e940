//! Member header store
//!
//! Reads, writes and erases the member header at the end of each member.
//! A member can itself be a set's logical device, so one physical device
//! may carry a stack of headers; erasure walks that stack.

use crate::device::MemberDevice;
use crate::layout::{MEMBER_HEADER_SIZE, MemberHeader};
use std::sync::Arc;
use tracing::{debug, info};
use volset_common::{Error, Result};

/// Deepest header stack walked by erase
pub const MAX_STACKED_HEADERS: usize = 5;

/// Header offset for a device of `size` bytes
#[must_use]
pub const fn header_offset(size: u64) -> Option<u64> {
    let rounded = size / MEMBER_HEADER_SIZE * MEMBER_HEADER_SIZE;
    rounded.checked_sub(MEMBER_HEADER_SIZE)
}

/// Header access for one member device
#[derive(Clone)]
pub struct MemberHeaderStore {
    device: Arc<dyn MemberDevice>,
}

impl MemberHeaderStore {
    /// Create a store over a device
    pub fn new(device: Arc<dyn MemberDevice>) -> Self {
        Self { device }
    }

    /// Offset of this device's own header
    pub fn offset(&self) -> Result<u64> {
        header_offset(self.device.size()).ok_or_else(|| {
            Error::invalid_argument(format!(
                "{} is too small to hold a member header",
                self.device.name()
            ))
        })
    }

    /// Read and decode the header
    pub fn read(&self) -> Result<MemberHeader> {
        let offset = self.offset()?;
        let data = self
            .device
            .read_bytes(offset, MEMBER_HEADER_SIZE as usize)?;
        MemberHeader::from_bytes(&data)
    }

    /// Encode and write the header
    pub fn write(&self, header: &MemberHeader) -> Result<()> {
        let offset = self.offset()?;
        let data = header.to_bytes()?;
        self.device.write_at(offset, &data)?;
        self.device.sync()?;
        debug!(
            device = self.device.name(),
            offset,
            sequence = header.properties.sequence,
            "wrote member header"
        );
        Ok(())
    }

    /// Zero this device's header and any headers stacked beneath it.
    ///
    /// Each header's declared size locates the next one down. Returns the
    /// number of headers erased; a second call finds nothing and leaves
    /// the device untouched.
    pub fn erase(&self) -> Result<usize> {
        let zeros = vec![0u8; MEMBER_HEADER_SIZE as usize];
        let mut offset = self.offset()?;
        let mut erased = 0;

        while erased < MAX_STACKED_HEADERS {
            let data = self
                .device
                .read_bytes(offset, MEMBER_HEADER_SIZE as usize)?;
            let Some(declared) = MemberHeader::declared_size(&data) else {
                break;
            };
            self.device.write_at(offset, &zeros)?;
            erased += 1;

            match header_offset(declared) {
                Some(next) if next < offset => offset = next,
                _ => break,
            }
        }

        if erased > 0 {
            self.device.sync()?;
            info!(device = self.device.name(), erased, "erased member headers");
        }
        Ok(erased)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::layout::{HEADER_VERSION, HeaderProperties};
    use uuid::Uuid;
    use volset_common::SetLevel;

    fn header(size: u64) -> MemberHeader {
        MemberHeader {
            set_uuid: Uuid::new_v4(),
            member_uuid: Uuid::new_v4(),
            size,
            properties: HeaderProperties {
                version: HEADER_VERSION,
                set_name: "m".into(),
                level: SetLevel::Mirror,
                sequence: 1,
                member_index: Some(0),
                chunk_size: 4096,
                chunk_count: size / 4096,
                primary_size: 0,
                secondary_size: 0,
                volume_slots: 0,
                group_offset: 0,
                quick_rebuild: false,
                members: vec![],
                member_sizes: vec![],
                member_offsets: vec![],
                spares: vec![],
            },
        }
    }

    #[test]
    fn test_header_offset() {
        assert_eq!(header_offset(1 << 20), Some((1 << 20) - 4096));
        assert_eq!(header_offset((1 << 20) + 100), Some((1 << 20) - 4096));
        assert_eq!(header_offset(4096), Some(0));
        assert_eq!(header_offset(4095), None);
    }

    #[test]
    fn test_write_read_header() {
        let device = Arc::new(MemDevice::new("d0", 1 << 20));
        let store = MemberHeaderStore::new(device.clone());
        let written = header(512 * 1024);
        store.write(&written).unwrap();
        assert_eq!(store.read().unwrap(), written);

        let blank = MemberHeaderStore::new(Arc::new(MemDevice::new("d1", 1 << 20)));
        assert!(matches!(blank.read(), Err(Error::Format(_))));
        let tiny = MemberHeaderStore::new(Arc::new(MemDevice::new("d2", 100)));
        assert!(tiny.read().is_err());
    }

    #[test]
    fn test_erase_stacked_headers_is_idempotent() {
        let size = 1 << 20;
        let device = Arc::new(MemDevice::new("d0", size));
        let outer = MemberHeaderStore::new(device.clone());

        // outer header declares 768KB below it; the inner set's header
        // lives at the end of that range
        let inner_size = 768 * 1024;
        let inner_header = header(256 * 1024);
        let inner_offset = header_offset(inner_size).unwrap();
        device
            .write_at(inner_offset, &inner_header.to_bytes().unwrap())
            .unwrap();
        outer.write(&header(inner_size)).unwrap();
        device.write_at(0, b"payload").unwrap();

        assert_eq!(outer.erase().unwrap(), 2);
        let after_first = device.snapshot();
        assert!(after_first[inner_offset as usize..][..4096].iter().all(|&b| b == 0));
        assert!(after_first[(size - 4096) as usize..].iter().all(|&b| b == 0));
        assert_eq!(&after_first[..7], b"payload");

        assert_eq!(outer.erase().unwrap(), 0);
        assert_eq!(device.snapshot(), after_first);
    }

    #[test]
    fn test_erase_stops_at_depth_limit() {
        let size = 1 << 20;
        let device = Arc::new(MemDevice::new("d0", size));
        let mut declared = size;
        for _ in 0..MAX_STACKED_HEADERS + 2 {
            let offset = header_offset(declared).unwrap();
            declared = offset;
            device
                .write_at(offset, &header(declared).to_bytes().unwrap())
                .unwrap();
        }
        let store = MemberHeaderStore::new(device.clone());
        assert_eq!(store.erase().unwrap(), MAX_STACKED_HEADERS);
    }
}
