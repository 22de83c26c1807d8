//! Resource declarations for external programs.
//!
//! Mirrors the `resources` table of the system configuration:
//!
//! ```toml
//! [resources.bwa]
//! cores = 8
//! memory = "2g"
//!
//! [resources.gatk]
//! cores = 4
//! memory = "3500m"
//! jvm_opts = ["-Xms750m", "-Xmx3500m"]
//! ```
//!
//! Only `cores` and `memory` influence allocation; `jvm_opts` are passed
//! through to the stage untouched.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ResourceError;

/// Declared resources keyed by program name.
pub type ResourceTable = BTreeMap<String, ResourceSpec>;

/// Resource needs of a single external program.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Cores each worker running this program needs (default 1).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,
    /// Memory each worker needs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemorySize>,
    /// When true, `memory` is per core and scales with `cores`.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub memory_per_core: bool,
    /// JVM options handed to the program unchanged.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jvm_opts: Vec<String>,
}

impl ResourceSpec {
    /// Declared cores, defaulting to one.
    pub fn cores(&self) -> u32 {
        self.cores.unwrap_or(1).max(1)
    }

    /// Memory one worker needs, scaled by cores when declared per core.
    pub fn worker_memory(&self) -> Option<MemorySize> {
        self.memory.map(|m| {
            if self.memory_per_core {
                MemorySize::from_mb(m.as_mb() * u64::from(self.cores()))
            } else {
                m
            }
        })
    }
}

// ---------------------------------------------------------------------------
// MemorySize
// ---------------------------------------------------------------------------

/// An amount of memory, stored in megabytes.
///
/// Parses `"4g"`, `"4G"`, `"512m"`, `"1t"` and bare numbers (megabytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemorySize(u64);

impl MemorySize {
    pub const fn from_mb(mb: u64) -> Self {
        Self(mb)
    }

    pub const fn from_gb(gb: u64) -> Self {
        Self(gb * 1024)
    }

    pub fn from_bytes(bytes: u64) -> Self {
        Self(bytes / (1024 * 1024))
    }

    pub fn as_mb(&self) -> u64 {
        self.0
    }
}

impl FromStr for MemorySize {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (digits, multiplier) = match trimmed.chars().last() {
            Some('g' | 'G') => (&trimmed[..trimmed.len() - 1], 1024),
            Some('m' | 'M') => (&trimmed[..trimmed.len() - 1], 1),
            Some('t' | 'T') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
            _ => (trimmed, 1),
        };
        let value: f64 = digits
            .trim()
            .parse()
            .map_err(|_| ResourceError::InvalidMemory(s.to_string()))?;
        if !value.is_finite() || value < 0.0 {
            return Err(ResourceError::InvalidMemory(s.to_string()));
        }
        Ok(Self((value * multiplier as f64).round() as u64))
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1024 && self.0 % 1024 == 0 {
            write!(f, "{}g", self.0 / 1024)
        } else {
            write!(f, "{}m", self.0)
        }
    }
}

impl Serialize for MemorySize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MemorySize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(mb) => Ok(MemorySize(mb)),
            Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}
