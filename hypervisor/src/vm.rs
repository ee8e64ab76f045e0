// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vm_memory::{GuestAddress, GuestUsize};

bitflags! {
    /// Permission and memory type bits of a second-level mapping.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct MappingFlags: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// Write-back memory type.
        const WRITE_BACK = 6 << 3;
    }
}

#[derive(Error, Debug)]
///
/// Enum for VM error
pub enum HypervisorVmError {
    ///
    /// Install second-level mapping error
    ///
    #[error("Failed to install mapping at {0:#x}")]
    InstallMapping(u64, #[source] anyhow::Error),
    ///
    /// Remove second-level mapping error
    ///
    #[error("Failed to remove mapping at {0:#x}")]
    RemoveMapping(u64, #[source] anyhow::Error),
    ///
    /// Guest memory access error
    ///
    #[error("Guest access at {0:#x} failed")]
    GuestAccess(u64, #[source] anyhow::Error),
}
///
/// Result type for returning from a function
///
pub type Result<T> = std::result::Result<T, HypervisorVmError>;

///
/// Trait to represent a Vm
///
/// Only the second-level address translation entry points are exposed: the
/// devices in this workspace never need more than installing and removing
/// guest-physical to host-physical mappings of a partition.
///
pub trait Vm: Send + Sync {
    /// Maps `[guest_addr, guest_addr + size)` onto `[host_addr, host_addr + size)`.
    fn install_mapping(
        &self,
        guest_addr: GuestAddress,
        host_addr: u64,
        size: GuestUsize,
        flags: MappingFlags,
    ) -> Result<()>;
    /// Removes the mapping previously installed at `guest_addr`.
    fn remove_mapping(&self, guest_addr: GuestAddress, size: GuestUsize) -> Result<()>;
}
