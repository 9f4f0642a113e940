//! volset Common - Shared types and utilities
//!
//! This crate provides the identifiers, set/member/volume enums, error
//! definitions and typed configuration used by the storage and engine
//! crates.

pub mod config;
pub mod error;
pub mod types;

pub use config::{EngineConfig, LocationHint, LvgConfig, RebuildConfig, SetConfig, VolumeSpec};
pub use error::{Error, Result};
pub use types::*;
