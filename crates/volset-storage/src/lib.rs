//! volset storage layer
//!
//! This crate owns everything a set writes to its members:
//! - Member devices (raw files and in-memory devices)
//! - The on-disk format of headers and metadata blocks
//! - Member header placement, stacking and erasure
//! - Primary metadata (dirty-region bitmaps, free extent lists)
//! - Extent allocation for logical volume groups

pub mod device;
pub mod extent;
pub mod header;
pub mod layout;
pub mod primary;
pub mod raw_io;

// Re-exports
pub use device::{MemDevice, MemberDevice};
pub use extent::{Extent, ExtentAllocator};
pub use header::{MemberHeaderStore, header_offset};
pub use layout::{
    HEADER_VERSION, HeaderProperties, LV_ENTRY_SIZE, MEMBER_HEADER_SIZE, MemberHeader,
    TocEntry, VolumeEntry, VolumeProperties,
};
pub use primary::{BitmapGeometry, PrimaryMetadataStore, RebuildBitmap, size_bitmap};
pub use raw_io::{AlignedBuffer, RawFile};
