// SPDX-License-Identifier: Apache-2.0
//

//! Registry of the named shared memory regions exposed through stshmem
//! devices.
//!
//! Regions are carved out of a single host-physical backing buffer at boot,
//! in declaration order, and never change afterwards. The registry is then
//! shared read-only between every partition.

use hypervisor::PAGE_SIZE;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum length of a region name, in bytes.
pub const SHM_REGION_NAME_MAX: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("Shared memory region name is empty")]
    EmptyName,
    #[error("Shared memory region name {0:?} exceeds {SHM_REGION_NAME_MAX} bytes")]
    NameTooLong(String),
    #[error("Shared memory region {0:?} declared twice")]
    DuplicateName(String),
    #[error("Shared memory region {0:?} size {1:#x} is not a power of two page multiple")]
    InvalidSize(String, u64),
    #[error("Shared memory backing buffer at {0:#x} is not page aligned")]
    BackingUnaligned(u64),
    #[error("Shared memory backing buffer at {0:#x} size {1:#x} wraps around the address space")]
    BackingOutOfRange(u64, u64),
    #[error("Shared memory region {name:?} needs {needed:#x} bytes, only {available:#x} left")]
    BackingExhausted {
        name: String,
        needed: u64,
        available: u64,
    },
}
pub type Result<T> = std::result::Result<T, Error>;

/// Host-physical memory range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRange {
    pub base: u64,
    pub size: u64,
}

impl HostRange {
    /// Exclusive end of the range. Callers must have checked the range with
    /// [`HostRange::checked_end`] first.
    pub fn end(&self) -> u64 {
        self.base + self.size
    }

    /// Exclusive end of the range, `None` if it wraps around.
    pub fn checked_end(&self) -> Option<u64> {
        self.base.checked_add(self.size)
    }

    pub fn overlaps(&self, other: &HostRange) -> bool {
        self.base < other.end() && other.base < self.end()
    }
}

/// Declared region, as found in the host configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShmRegionConfig {
    pub name: String,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ShmRegion {
    name: String,
    size: u64,
    host_base: u64,
}

impl ShmRegion {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn host_base(&self) -> u64 {
        self.host_base
    }

    pub fn host_range(&self) -> HostRange {
        HostRange {
            base: self.host_base,
            size: self.size,
        }
    }
}

pub struct ShmRegionRegistry {
    backing: HostRange,
    regions: Vec<ShmRegion>,
}

impl ShmRegionRegistry {
    /// Lays the declared regions out back to back over `backing`.
    pub fn new(backing: HostRange, configs: &[ShmRegionConfig]) -> Result<Self> {
        if backing.base % PAGE_SIZE != 0 {
            return Err(Error::BackingUnaligned(backing.base));
        }
        let end = backing
            .checked_end()
            .ok_or(Error::BackingOutOfRange(backing.base, backing.size))?;

        let mut regions: Vec<ShmRegion> = Vec::with_capacity(configs.len());
        let mut next = backing.base;
        for config in configs {
            let name = &config.name;
            if name.is_empty() {
                return Err(Error::EmptyName);
            }
            if name.len() > SHM_REGION_NAME_MAX {
                return Err(Error::NameTooLong(name.clone()));
            }
            if regions.iter().any(|r| &r.name == name) {
                return Err(Error::DuplicateName(name.clone()));
            }
            if !config.size.is_power_of_two() || config.size % PAGE_SIZE != 0 {
                return Err(Error::InvalidSize(name.clone(), config.size));
            }

            let available = end - next;
            if config.size > available {
                return Err(Error::BackingExhausted {
                    name: name.clone(),
                    needed: config.size,
                    available,
                });
            }

            debug!(
                "shm region {:?} at {:#x} size {:#x}",
                name, next, config.size
            );
            regions.push(ShmRegion {
                name: name.clone(),
                size: config.size,
                host_base: next,
            });
            next += config.size;
        }

        Ok(ShmRegionRegistry { backing, regions })
    }

    pub fn find_region(&self, name: &str) -> Option<&ShmRegion> {
        self.regions.iter().find(|r| r.name == name)
    }

    pub fn regions(&self) -> &[ShmRegion] {
        &self.regions
    }

    pub fn backing(&self) -> HostRange {
        self.backing
    }
}
