//! Core type definitions for volset
//!
//! Identifiers for sets, members and logical volumes, plus the small
//! enums that describe set levels, member states and removal policies.

use bitflags::bitflags;
use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a set
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct SetId(Uuid);

impl SetId {
    /// Generate a new random set ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SetId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SetId({})", self.0)
    }
}

impl fmt::Display for SetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a set member
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct MemberId(Uuid);

impl MemberId {
    /// Generate a new random member ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MemberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemberId({})", self.0)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a logical volume
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct VolumeId(Uuid);

impl VolumeId {
    /// Generate a new random volume ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for VolumeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VolumeId({})", self.0)
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Set level
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SetLevel {
    /// Members laid end to end
    Concat,
    /// Every member holds a full copy
    Mirror,
    /// Chunks distributed round robin across members
    Stripe,
    /// Logical volume group
    Lvg,
}

impl SetLevel {
    /// Get level name
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Concat => "Concat",
            Self::Mirror => "Mirror",
            Self::Stripe => "Stripe",
            Self::Lvg => "LVG",
        }
    }
}

impl fmt::Display for SetLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Member state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberState {
    /// Member has failed or holds stale data
    Broken,
    /// Member is waiting to replace a failed member
    Spare,
    /// Member is known but not serving I/O
    #[default]
    Closed,
    /// Member is being taken out of service
    Closing,
    /// Member is being resynchronized
    Rebuilding,
    /// Member is serving I/O
    Open,
}

impl MemberState {
    /// True for states that carry current data
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Role requested when adding a member
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberRole {
    /// Regular data member
    Data,
    /// Hot spare (mirror sets only)
    Spare,
}

/// Which members may be removed from a set
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemovalPolicy {
    /// No member may be removed
    None,
    /// Only the member with the highest index
    LastMember,
    /// Any single member, one at a time
    AnyOneMember,
    /// Any member
    AnyMember,
}

bitflags! {
    /// Logical volume type flags
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct VolumeType: u32 {
        const CONCAT = 0x0001;
        const STRIPE = 0x0002;
        const MIRROR = 0x0004;
        const SNAPSHOT_RO = 0x0010;
        const SNAPSHOT_RW = 0x0020;
        const BITMAP = 0x0100;
        const MASTER = 0x1000;

        const VOLUME = Self::CONCAT.bits() | Self::STRIPE.bits() | Self::MIRROR.bits();
        const SNAPSHOT = Self::SNAPSHOT_RO.bits() | Self::SNAPSHOT_RW.bits();
    }
}

impl VolumeType {
    /// True for regular data volumes
    #[must_use]
    pub const fn is_volume(&self) -> bool {
        self.intersects(Self::VOLUME)
    }

    /// True for read-only or writable snapshots
    #[must_use]
    pub const fn is_snapshot(&self) -> bool {
        self.intersects(Self::SNAPSHOT)
    }

    /// Snapshots and bitmaps point at a parent volume
    #[must_use]
    pub const fn needs_parent(&self) -> bool {
        self.intersects(Self::SNAPSHOT.union(Self::BITMAP))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(SetId::new(), SetId::new());
        let uuid = Uuid::new_v4();
        assert_eq!(MemberId::from_uuid(uuid).as_uuid(), uuid);
        assert_eq!(VolumeId::from(uuid).to_string(), uuid.to_string());
    }

    #[test]
    fn test_volume_type_unions() {
        assert!(VolumeType::CONCAT.is_volume());
        assert!(!VolumeType::CONCAT.is_snapshot());
        assert!(VolumeType::SNAPSHOT_RW.is_snapshot());
        assert!(VolumeType::SNAPSHOT_RO.needs_parent());
        assert!(VolumeType::BITMAP.needs_parent());
        assert!(!VolumeType::MASTER.is_volume());
        assert_eq!(
            VolumeType::from_bits_truncate(VolumeType::MIRROR.bits()),
            VolumeType::MIRROR
        );
    }

    #[test]
    fn test_level_names() {
        assert_eq!(SetLevel::Lvg.to_string(), "LVG");
        assert_eq!(SetLevel::Stripe.name(), "Stripe");
    }
}
