// SPDX-License-Identifier: Apache-2.0
//

//! Synchronized-time page.
//!
//! One host page shared by every partition taking part in clock
//! synchronization. The time authority maps it read-write, followers get a
//! read-only view. The page holds a sequence counter at offset 0 and the
//! global time at offset 8, both little endian `u64`. The counter is odd
//! while an update is in progress.

use byteorder::{ByteOrder, LittleEndian};
use hypervisor::{HypervisorVmError, MappingFlags, SecondLevelTable, Vm, PAGE_SIZE};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vm_memory::{Address, GuestAddress};

pub const SYNCTIME_SHM_SIZE: u64 = 4096;

const SEQUENCE_OFFSET: u64 = 0;
const TIME_OFFSET: u64 = 8;

// Attempts before a reader gives up on a page being updated.
const READ_RETRIES: usize = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeRole {
    /// Publishes the global time.
    Authority,
    /// Only consumes it.
    Follower,
}

impl TimeRole {
    pub fn mapping_flags(self) -> MappingFlags {
        match self {
            TimeRole::Authority => {
                MappingFlags::READ | MappingFlags::WRITE | MappingFlags::WRITE_BACK
            }
            TimeRole::Follower => MappingFlags::READ | MappingFlags::WRITE_BACK,
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncTimeError {
    #[error("Synchronized time page at {0:#x} is not page aligned")]
    Unaligned(u64),
    #[error("Failed to map synchronized time page at {0:#x}")]
    Map(u64, #[source] HypervisorVmError),
    #[error("Failed to unmap synchronized time page at {0:#x}")]
    Unmap(u64, #[source] HypervisorVmError),
    #[error("Failed to access synchronized time page at {0:#x}")]
    Access(u64, #[source] HypervisorVmError),
    #[error("Synchronized time page at {0:#x} kept changing while being read")]
    Torn(u64),
}
pub type Result<T> = std::result::Result<T, SyncTimeError>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SyncTimePage {
    host_base: u64,
}

impl SyncTimePage {
    pub fn new(host_base: u64) -> Result<Self> {
        if host_base % PAGE_SIZE != 0 {
            return Err(SyncTimeError::Unaligned(host_base));
        }
        Ok(SyncTimePage { host_base })
    }

    pub fn host_base(&self) -> u64 {
        self.host_base
    }

    /// Maps the page at `guest_base` of a partition with the permissions of
    /// `role`.
    pub fn map(&self, vm: &dyn Vm, guest_base: GuestAddress, role: TimeRole) -> Result<()> {
        vm.install_mapping(
            guest_base,
            self.host_base,
            SYNCTIME_SHM_SIZE,
            role.mapping_flags(),
        )
        .map_err(|e| SyncTimeError::Map(guest_base.raw_value(), e))?;
        info!(
            "synctime page {:#x} mapped at {:#x} as {:?}",
            self.host_base,
            guest_base.raw_value(),
            role
        );
        Ok(())
    }

    pub fn unmap(&self, vm: &dyn Vm, guest_base: GuestAddress) -> Result<()> {
        vm.remove_mapping(guest_base, SYNCTIME_SHM_SIZE)
            .map_err(|e| SyncTimeError::Unmap(guest_base.raw_value(), e))?;
        debug!("synctime page unmapped from {:#x}", guest_base.raw_value());
        Ok(())
    }
}

fn read_u64(slat: &SecondLevelTable, addr: GuestAddress) -> Result<u64> {
    let mut data = [0u8; 8];
    slat.guest_read(addr, &mut data)
        .map_err(|e| SyncTimeError::Access(addr.raw_value(), e))?;
    Ok(LittleEndian::read_u64(&data))
}

fn write_u64(slat: &SecondLevelTable, addr: GuestAddress, value: u64) -> Result<()> {
    let mut data = [0u8; 8];
    LittleEndian::write_u64(&mut data, value);
    slat.guest_write(addr, &data)
        .map_err(|e| SyncTimeError::Access(addr.raw_value(), e))
}

/// Stores `time` in the page mapped at `guest_base`, as the time authority
/// would from inside its partition.
pub fn publish_global_time(
    slat: &SecondLevelTable,
    guest_base: GuestAddress,
    time: u64,
) -> Result<()> {
    let seq_addr = guest_base.unchecked_add(SEQUENCE_OFFSET);
    let seq = read_u64(slat, seq_addr)?;
    let seq = seq.wrapping_add(1) | 1;

    write_u64(slat, seq_addr, seq)?;
    write_u64(slat, guest_base.unchecked_add(TIME_OFFSET), time)?;
    write_u64(slat, seq_addr, seq.wrapping_add(1))
}

/// Reads the global time from the page mapped at `guest_base`.
pub fn read_global_time(slat: &SecondLevelTable, guest_base: GuestAddress) -> Result<u64> {
    let seq_addr = guest_base.unchecked_add(SEQUENCE_OFFSET);
    for _ in 0..READ_RETRIES {
        let before = read_u64(slat, seq_addr)?;
        if before & 1 != 0 {
            continue;
        }
        let time = read_u64(slat, guest_base.unchecked_add(TIME_OFFSET))?;
        if read_u64(slat, seq_addr)? == before {
            return Ok(time);
        }
    }

    Err(SyncTimeError::Torn(guest_base.raw_value()))
}
