//! Configuration types for volset
//!
//! Engine-wide settings plus the typed per-operation configuration
//! handed to set and volume creation.

use crate::error::{Error, Result};
use crate::types::{MemberId, SetLevel, VolumeId, VolumeType};
use serde::{Deserialize, Serialize};

/// Default set chunk size (32KB)
pub const DEFAULT_CHUNK_SIZE: u64 = 32 * 1024;

/// Root configuration for an engine instance
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Chunk size used when a set does not name one
    pub default_chunk_size: u64,
    /// Mirror rebuild configuration
    pub rebuild: RebuildConfig,
    /// Logical volume group configuration
    pub lvg: LvgConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            rebuild: RebuildConfig::default(),
            lvg: LvgConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from JSON, filling omitted fields with defaults
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| Error::Configuration(format!("invalid engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that sizes and capacities are usable
    pub fn validate(&self) -> Result<()> {
        validate_chunk_size(self.default_chunk_size)?;
        if self.rebuild.io_size == 0 || self.rebuild.io_size % 512 != 0 {
            return Err(Error::Configuration(format!(
                "rebuild io_size {} must be a non-zero multiple of 512",
                self.rebuild.io_size
            )));
        }
        if self.rebuild.pending_capacity == 0 || self.rebuild.command_capacity == 0 {
            return Err(Error::Configuration(
                "rebuild queue capacities must be non-zero".into(),
            ));
        }
        if self.lvg.max_volumes < 2 {
            return Err(Error::Configuration(
                "lvg max_volumes must leave room for the master entry".into(),
            ));
        }
        if self.lvg.max_extents_per_member == 0 {
            return Err(Error::Configuration(
                "lvg max_extents_per_member must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Check a chunk size is a power of two of at least 4KB
pub fn validate_chunk_size(chunk_size: u64) -> Result<()> {
    if chunk_size < 4096 || !chunk_size.is_power_of_two() {
        return Err(Error::Configuration(format!(
            "chunk size {chunk_size} must be a power of two of at least 4096"
        )));
    }
    Ok(())
}

/// Mirror rebuild configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RebuildConfig {
    /// Bytes copied per rebuild step
    pub io_size: u64,
    /// Maximum writes deferred while a rebuild runs; overflow fails the rebuild
    pub pending_capacity: usize,
    /// Capacity of the rebuild worker's command channel
    pub command_capacity: usize,
    /// Track dirty regions so returning members can be quick-rebuilt
    pub quick_rebuild: bool,
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            io_size: 1024 * 1024,
            pending_capacity: 1024,
            command_capacity: 16,
            quick_rebuild: true,
        }
    }
}

/// Logical volume group configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LvgConfig {
    /// Table of contents slots, including the master entry
    pub max_volumes: u32,
    /// Free extents recorded per member in its primary metadata
    pub max_extents_per_member: u32,
}

impl Default for LvgConfig {
    fn default() -> Self {
        Self {
            max_volumes: 64,
            max_extents_per_member: 256,
        }
    }
}

/// Parameters for creating a set
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetConfig {
    /// Set level
    pub level: SetLevel,
    /// Human-readable name
    pub name: String,
    /// Chunk size, engine default when unset
    pub chunk_size: Option<u64>,
    /// Quick rebuild override for mirror sets
    pub quick_rebuild: Option<bool>,
}

impl SetConfig {
    /// Create a set configuration with engine defaults
    pub fn new(level: SetLevel, name: impl Into<String>) -> Self {
        Self {
            level,
            name: name.into(),
            chunk_size: None,
            quick_rebuild: None,
        }
    }

    /// Use a specific chunk size
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    /// Enable or disable quick rebuild tracking
    #[must_use]
    pub fn with_quick_rebuild(mut self, enabled: bool) -> Self {
        self.quick_rebuild = Some(enabled);
        self
    }
}

/// Where the allocator should look for space
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocationHint {
    /// Anywhere in the group
    #[default]
    Any,
    /// Only within one member's data region
    OnMember(MemberId),
    /// Only at or after a group offset
    After(u64),
}

/// Parameters for creating a logical volume
#[derive(Clone, Debug)]
pub struct VolumeSpec {
    /// Human-readable name
    pub name: String,
    /// Volume type flags
    pub kind: VolumeType,
    /// Claimed size in bytes
    pub size: u64,
    /// Allocation hint
    pub hint: LocationHint,
    /// Parent volume for snapshots and bitmaps
    pub parent: Option<VolumeId>,
}

impl VolumeSpec {
    /// A plain concatenated volume of the given size
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            kind: VolumeType::CONCAT,
            size,
            hint: LocationHint::Any,
            parent: None,
        }
    }

    /// Set the volume type
    #[must_use]
    pub fn with_kind(mut self, kind: VolumeType) -> Self {
        self.kind = kind;
        self
    }

    /// Set the allocation hint
    #[must_use]
    pub fn with_hint(mut self, hint: LocationHint) -> Self {
        self.hint = hint;
        self
    }

    /// Set the parent volume
    #[must_use]
    pub fn with_parent(mut self, parent: VolumeId) -> Self {
        self.parent = Some(parent);
        self
    }
}
