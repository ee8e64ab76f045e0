// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! In-process second-level address translation.
//!
//! `SecondLevelTable` keeps the guest-physical to host-physical mappings of
//! one partition and resolves guest accesses against them, enforcing the
//! mapping permissions the way the hardware walker would.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use thiserror::Error;
use vm_memory::{Address, Bytes, GuestAddress, GuestMemory, GuestMemoryMmap, GuestUsize};

use crate::vm::{HypervisorVmError, MappingFlags, Result, Vm};

pub const PAGE_SIZE: u64 = 4096;

/// Host-physical memory, indexed by host-physical address.
pub type HostMemory = GuestMemoryMmap;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Mapping {guest:#x}+{size:#x} -> {host:#x} is not page aligned")]
    Unaligned { guest: u64, host: u64, size: u64 },
    #[error("Host range {0:#x}+{1:#x} is not backed by host memory")]
    HostRange(u64, u64),
    #[error("Guest range {0:#x}+{1:#x} overlaps the mapping at {2:#x}")]
    Overlap(u64, u64, u64),
    #[error("No mapping of size {1:#x} at {0:#x}")]
    NotMapped(u64, u64),
    #[error("Guest range {0:#x}+{1:#x} is not mapped")]
    Fault(u64, u64),
    #[error("Access to {0:#x} requires {1:?}")]
    Permission(u64, MappingFlags),
    #[error("Host memory access failed")]
    HostMemory(#[source] vm_memory::GuestMemoryError),
}

/// A live guest-physical to host-physical mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Mapping {
    pub guest_addr: u64,
    pub host_addr: u64,
    pub size: u64,
    pub flags: MappingFlags,
}

impl Mapping {
    fn guest_end(&self) -> u64 {
        self.guest_addr + self.size
    }
}

pub struct SecondLevelTable {
    host_memory: Arc<HostMemory>,
    mappings: RwLock<BTreeMap<u64, Mapping>>,
}

impl SecondLevelTable {
    pub fn new(host_memory: Arc<HostMemory>) -> Self {
        SecondLevelTable {
            host_memory,
            mappings: RwLock::new(BTreeMap::new()),
        }
    }

    /// Snapshot of the live mappings, ordered by guest address.
    pub fn mappings(&self) -> Vec<Mapping> {
        self.mappings.read().unwrap().values().copied().collect()
    }

    fn insert(&self, mapping: Mapping) -> std::result::Result<(), Error> {
        let Mapping {
            guest_addr,
            host_addr,
            size,
            ..
        } = mapping;
        if size == 0
            || guest_addr % PAGE_SIZE != 0
            || host_addr % PAGE_SIZE != 0
            || size % PAGE_SIZE != 0
        {
            return Err(Error::Unaligned {
                guest: guest_addr,
                host: host_addr,
                size,
            });
        }

        let guest_end = guest_addr
            .checked_add(size)
            .ok_or(Error::Fault(guest_addr, size))?;
        if !self
            .host_memory
            .check_range(GuestAddress(host_addr), size as usize)
        {
            return Err(Error::HostRange(host_addr, size));
        }

        let mut mappings = self.mappings.write().unwrap();
        if let Some((_, prev)) = mappings.range(..guest_end).next_back() {
            if prev.guest_end() > guest_addr {
                return Err(Error::Overlap(guest_addr, size, prev.guest_addr));
            }
        }
        mappings.insert(guest_addr, mapping);

        Ok(())
    }

    fn remove(&self, guest_addr: u64, size: u64) -> std::result::Result<(), Error> {
        let mut mappings = self.mappings.write().unwrap();
        match mappings.get(&guest_addr) {
            Some(m) if m.size == size => {
                mappings.remove(&guest_addr);
                Ok(())
            }
            _ => Err(Error::NotMapped(guest_addr, size)),
        }
    }

    // Resolves a guest range that must sit inside a single mapping.
    fn translate(
        &self,
        guest_addr: u64,
        len: usize,
        required: MappingFlags,
    ) -> std::result::Result<u64, Error> {
        let len = len as u64;
        let mappings = self.mappings.read().unwrap();
        let mapping = mappings
            .range(..=guest_addr)
            .next_back()
            .map(|(_, m)| m)
            .filter(|m| {
                guest_addr
                    .checked_add(len)
                    .is_some_and(|end| end <= m.guest_end())
            })
            .ok_or(Error::Fault(guest_addr, len))?;

        if !mapping.flags.contains(required) {
            return Err(Error::Permission(guest_addr, required));
        }

        Ok(mapping.host_addr + (guest_addr - mapping.guest_addr))
    }

    /// Reads guest-physical memory as a vCPU of the partition would.
    pub fn guest_read(&self, guest_addr: GuestAddress, data: &mut [u8]) -> Result<()> {
        let gpa = guest_addr.raw_value();
        let host_addr = self
            .translate(gpa, data.len(), MappingFlags::READ)
            .map_err(|e| HypervisorVmError::GuestAccess(gpa, e.into()))?;
        self.host_memory
            .read_slice(data, GuestAddress(host_addr))
            .map_err(|e| HypervisorVmError::GuestAccess(gpa, Error::HostMemory(e).into()))
    }

    /// Writes guest-physical memory as a vCPU of the partition would.
    pub fn guest_write(&self, guest_addr: GuestAddress, data: &[u8]) -> Result<()> {
        let gpa = guest_addr.raw_value();
        let host_addr = self
            .translate(gpa, data.len(), MappingFlags::WRITE)
            .map_err(|e| HypervisorVmError::GuestAccess(gpa, e.into()))?;
        self.host_memory
            .write_slice(data, GuestAddress(host_addr))
            .map_err(|e| HypervisorVmError::GuestAccess(gpa, Error::HostMemory(e).into()))
    }
}

impl Vm for SecondLevelTable {
    fn install_mapping(
        &self,
        guest_addr: GuestAddress,
        host_addr: u64,
        size: GuestUsize,
        flags: MappingFlags,
    ) -> Result<()> {
        let gpa = guest_addr.raw_value();
        self.insert(Mapping {
            guest_addr: gpa,
            host_addr,
            size,
            flags,
        })
        .map_err(|e| HypervisorVmError::InstallMapping(gpa, e.into()))?;
        debug!(
            "mapped guest {:#x}+{:#x} -> host {:#x} ({:?})",
            gpa, size, host_addr, flags
        );
        Ok(())
    }

    fn remove_mapping(&self, guest_addr: GuestAddress, size: GuestUsize) -> Result<()> {
        let gpa = guest_addr.raw_value();
        self.remove(gpa, size)
            .map_err(|e| HypervisorVmError::RemoveMapping(gpa, e.into()))?;
        debug!("unmapped guest {:#x}+{:#x}", gpa, size);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST_BASE: u64 = 0x10_0000;

    fn table() -> SecondLevelTable {
        let host_memory =
            GuestMemoryMmap::<()>::from_ranges(&[(GuestAddress(HOST_BASE), 0x4000)]).unwrap();
        SecondLevelTable::new(Arc::new(host_memory))
    }

    fn rw() -> MappingFlags {
        MappingFlags::READ | MappingFlags::WRITE | MappingFlags::WRITE_BACK
    }

    #[test]
    fn install_and_access() {
        let table = table();
        table
            .install_mapping(GuestAddress(0x8000_0000), HOST_BASE, 0x1000, rw())
            .unwrap();

        table
            .guest_write(GuestAddress(0x8000_0010), &[1, 2, 3, 4])
            .unwrap();
        let mut data = [0u8; 4];
        table
            .guest_read(GuestAddress(0x8000_0010), &mut data)
            .unwrap();
        assert_eq!(data, [1, 2, 3, 4]);

        let mut host = [0u8; 4];
        table
            .host_memory
            .read_slice(&mut host, GuestAddress(HOST_BASE + 0x10))
            .unwrap();
        assert_eq!(host, [1, 2, 3, 4]);
    }

    #[test]
    fn read_only_mapping_rejects_writes() {
        let table = table();
        table
            .install_mapping(
                GuestAddress(0x9000_0000),
                HOST_BASE,
                0x1000,
                MappingFlags::READ | MappingFlags::WRITE_BACK,
            )
            .unwrap();

        assert!(matches!(
            table.guest_write(GuestAddress(0x9000_0000), &[0xff]),
            Err(HypervisorVmError::GuestAccess(0x9000_0000, _))
        ));
        let mut data = [0xaau8; 1];
        table
            .guest_read(GuestAddress(0x9000_0000), &mut data)
            .unwrap();
        assert_eq!(data, [0]);
    }

    #[test]
    fn unmapped_access_faults() {
        let table = table();
        table
            .install_mapping(GuestAddress(0x8000_0000), HOST_BASE, 0x1000, rw())
            .unwrap();

        let mut data = [0u8; 8];
        assert!(table.guest_read(GuestAddress(0x7fff_f000), &mut data).is_err());
        // Straddling the end of the mapping.
        assert!(table.guest_read(GuestAddress(0x8000_0ffc), &mut data).is_err());
    }

    #[test]
    fn overlapping_install_rejected() {
        let table = table();
        table
            .install_mapping(GuestAddress(0x8000_1000), HOST_BASE, 0x2000, rw())
            .unwrap();

        assert!(table
            .install_mapping(GuestAddress(0x8000_0000), HOST_BASE, 0x2000, rw())
            .is_err());
        assert!(table
            .install_mapping(GuestAddress(0x8000_2000), HOST_BASE, 0x1000, rw())
            .is_err());
        table
            .install_mapping(GuestAddress(0x8000_3000), HOST_BASE, 0x1000, rw())
            .unwrap();
        assert_eq!(table.mappings().len(), 2);
    }

    #[test]
    fn invalid_install_rejected() {
        let table = table();

        // Unaligned guest address.
        assert!(table
            .install_mapping(GuestAddress(0x8000_0800), HOST_BASE, 0x1000, rw())
            .is_err());
        // Host range outside of host memory.
        assert!(table
            .install_mapping(GuestAddress(0x8000_0000), HOST_BASE + 0x3000, 0x2000, rw())
            .is_err());
        assert!(table.mappings().is_empty());
    }

    #[test]
    fn remove_requires_exact_mapping() {
        let table = table();
        table
            .install_mapping(GuestAddress(0x8000_0000), HOST_BASE, 0x2000, rw())
            .unwrap();

        assert!(table
            .remove_mapping(GuestAddress(0x8000_0000), 0x1000)
            .is_err());
        assert!(table
            .remove_mapping(GuestAddress(0x8000_1000), 0x1000)
            .is_err());
        table
            .remove_mapping(GuestAddress(0x8000_0000), 0x2000)
            .unwrap();
        assert!(table.mappings().is_empty());
        assert!(table
            .remove_mapping(GuestAddress(0x8000_0000), 0x2000)
            .is_err());
    }
}
