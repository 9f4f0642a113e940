//! volset engine
//!
//! Combines member devices into sets and keeps them consistent:
//! - Address mapping for concatenated, striped and mirrored sets
//! - Ordered metadata commits stamped with the set sequence number
//! - Assembly of existing sets from their member headers
//! - Mirror rebuild (full and bitmap-driven quick) alongside host writes
//! - Logical volume groups: volume directory and extent allocation

pub mod assembler;
pub mod directory;
pub mod engine;
pub mod lvg;
pub mod member;
pub mod rebuild;
pub mod set;
pub mod volume;

// Re-exports
pub use assembler::{Capabilities, CapabilityRules, ExtentMapping, SetLayout};
pub use engine::Engine;
pub use member::MemberInfo;
pub use rebuild::{RebuildMode, RebuildPhase, RebuildStatus};
pub use set::{RaidSet, SetProperties};
pub use volume::{LogicalVolume, VolumeInfo};
