// SPDX-License-Identifier: Apache-2.0
//

//! A guest partition: its second-level translation, its PCI bus and the
//! shared memory devices plugged on it.

use std::sync::{Arc, Mutex};

use devices::{
    ShmRegionRegistry, StshmemDevice, StshmemDeviceState, StshmemError, StshmemOwner,
    StshmemPool, SyncTimeError, SyncTimePage, TimeRole, STSHMEM_SHM_BAR,
};
use hypervisor::{HostMemory, HypervisorVmError, Mapping, SecondLevelTable};
use pci::{bar_offset, PciBarType, PciBdf, PciBus, PciDeviceError, PciRootError};
use serde::Serialize;
use thiserror::Error;
use vm_memory::GuestAddress;

use crate::config::PartitionConfig;

/// Base and size of the configuration mechanism #1 port window.
pub const PCI_CONFIG_IO_PORT: u64 = 0xcf8;
pub const PCI_CONFIG_IO_PORT_SIZE: u64 = 0x8;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Error creating stshmem device {0}")]
    CreateStshmem(PciBdf, #[source] StshmemError),
    #[error("Error adding device to the PCI bus")]
    AddDevice(#[source] PciRootError),
    #[error("Partition requests the synchronized time page, which the host doesn't provide")]
    SyncTimeUnavailable,
    #[error("Error mapping the synchronized time page")]
    MapSyncTime(#[source] SyncTimeError),
    #[error("Error unmapping the synchronized time page")]
    UnmapSyncTime(#[source] SyncTimeError),
    #[error("Error accessing the synchronized time page")]
    AccessSyncTime(#[source] SyncTimeError),
    #[error("No synchronized time page is mapped")]
    NoSyncTime,
    #[error("Error in PCI configuration access")]
    ConfigAccess(#[source] PciRootError),
    #[error("Error in guest memory access")]
    GuestAccess(#[source] HypervisorVmError),
    #[error("No device at {0}")]
    NoDevice(PciBdf),
    #[error("Error tearing down device {0}")]
    Teardown(PciBdf, #[source] PciDeviceError),
}
pub type Result<T> = std::result::Result<T, Error>;

/// Where the synchronized time page sits in a partition.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SyncTimeMapping {
    pub guest_base: u64,
    pub role: TimeRole,
}

/// Outcome of a guest style BAR sizing cycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BarSizing {
    pub bdf: PciBdf,
    pub bar_idx: usize,
    pub bar_type: PciBarType,
    pub size: u64,
    pub base: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct PartitionSummary {
    pub id: u16,
    pub name: String,
    pub synctime: Option<SyncTimeMapping>,
    pub devices: Vec<StshmemDeviceState>,
    pub mappings: Vec<Mapping>,
}

pub struct Partition {
    id: u16,
    name: String,
    slat: Arc<SecondLevelTable>,
    pci_bus: PciBus,
    synctime_page: Option<SyncTimePage>,
    synctime: Option<SyncTimeMapping>,
}

impl Partition {
    /// Builds the partition and plugs its stshmem devices. On failure every
    /// device created so far is torn down and its pool slot released.
    pub fn new(
        config: &PartitionConfig,
        host_memory: Arc<HostMemory>,
        registry: &ShmRegionRegistry,
        pool: &Arc<StshmemPool>,
        synctime_page: Option<SyncTimePage>,
    ) -> Result<Self> {
        let slat = Arc::new(SecondLevelTable::new(host_memory));
        let mut pci_bus = PciBus::new();

        for (i, device_cfg) in config.stshmem.iter().enumerate() {
            let id = device_cfg
                .id
                .clone()
                .unwrap_or_else(|| format!("_stshmem{i}"));
            let owner = StshmemOwner {
                partition: config.id,
                bdf: device_cfg.bdf,
            };
            let device = StshmemDevice::new(
                id,
                owner,
                &device_cfg.region,
                device_cfg.vbar_base[STSHMEM_SHM_BAR],
                registry,
                pool.clone(),
                slat.clone(),
            )
            .map_err(|e| Error::CreateStshmem(device_cfg.bdf, e))?;

            pci_bus
                .add_device(device_cfg.bdf, Arc::new(Mutex::new(device)))
                .map_err(Error::AddDevice)?;
        }

        let mut partition = Partition {
            id: config.id,
            name: config.name.clone(),
            slat,
            pci_bus,
            synctime_page: None,
            synctime: None,
        };

        if let Some(synctime_cfg) = &config.synctime {
            let page = synctime_page.ok_or(Error::SyncTimeUnavailable)?;
            page.map(
                partition.slat.as_ref(),
                GuestAddress(synctime_cfg.guest_base),
                synctime_cfg.role,
            )
            .map_err(Error::MapSyncTime)?;
            partition.synctime_page = Some(page);
            partition.synctime = Some(SyncTimeMapping {
                guest_base: synctime_cfg.guest_base,
                role: synctime_cfg.role,
            });
        }

        info!(
            "partition {} ({}) created with {} stshmem device(s)",
            partition.id,
            partition.name,
            config.stshmem.len()
        );

        Ok(partition)
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slat(&self) -> &Arc<SecondLevelTable> {
        &self.slat
    }

    pub fn synctime(&self) -> Option<SyncTimeMapping> {
        self.synctime
    }

    pub fn device_bdfs(&self) -> Vec<PciBdf> {
        self.pci_bus.devices().map(|(bdf, _)| *bdf).collect()
    }

    pub fn config_read(&self, bdf: PciBdf, offset: usize, len: usize) -> u32 {
        self.pci_bus.config_space_read(bdf, offset, len)
    }

    pub fn config_write(&self, bdf: PciBdf, offset: usize, len: usize, value: u32) -> Result<()> {
        self.pci_bus
            .config_space_write(bdf, offset, len, value)
            .map_err(Error::ConfigAccess)
    }

    /// Guest read from the PCI configuration I/O ports.
    pub fn pio_read(&mut self, port: u64, data: &mut [u8]) {
        if !(PCI_CONFIG_IO_PORT..PCI_CONFIG_IO_PORT + PCI_CONFIG_IO_PORT_SIZE).contains(&port) {
            data.fill(0xff);
            return;
        }
        self.pci_bus.read(port - PCI_CONFIG_IO_PORT, data);
    }

    /// Guest write to the PCI configuration I/O ports.
    pub fn pio_write(&mut self, port: u64, data: &[u8]) -> Result<()> {
        if !(PCI_CONFIG_IO_PORT..PCI_CONFIG_IO_PORT + PCI_CONFIG_IO_PORT_SIZE).contains(&port) {
            return Ok(());
        }
        self.pci_bus
            .write(port - PCI_CONFIG_IO_PORT, data)
            .map_err(Error::ConfigAccess)
    }

    pub fn guest_read(&self, addr: GuestAddress, data: &mut [u8]) -> Result<()> {
        self.slat.guest_read(addr, data).map_err(Error::GuestAccess)
    }

    pub fn guest_write(&self, addr: GuestAddress, data: &[u8]) -> Result<()> {
        self.slat.guest_write(addr, data).map_err(Error::GuestAccess)
    }

    /// Publishes the global time through the partition's view of the page.
    pub fn publish_global_time(&self, time: u64) -> Result<()> {
        let mapping = self.synctime.ok_or(Error::NoSyncTime)?;
        devices::publish_global_time(&self.slat, GuestAddress(mapping.guest_base), time)
            .map_err(Error::AccessSyncTime)
    }

    pub fn read_global_time(&self) -> Result<u64> {
        let mapping = self.synctime.ok_or(Error::NoSyncTime)?;
        devices::read_global_time(&self.slat, GuestAddress(mapping.guest_base))
            .map_err(Error::AccessSyncTime)
    }

    /// Sizes the shared memory BAR of `bdf` the way a guest would: write all
    /// ones, read the size mask back, then restore the original value.
    pub fn size_bar(&self, bdf: PciBdf) -> Result<BarSizing> {
        if self.pci_bus.device(bdf).is_none() {
            return Err(Error::NoDevice(bdf));
        }

        let lo_offset = bar_offset(STSHMEM_SHM_BAR);
        let hi_offset = bar_offset(STSHMEM_SHM_BAR + 1);
        let lo = self.config_read(bdf, lo_offset, 4);
        let bar_type = PciBarType::from_register(lo);
        let is_64 = bar_type == PciBarType::Memory64;
        let hi = if is_64 {
            self.config_read(bdf, hi_offset, 4)
        } else {
            0
        };

        self.config_write(bdf, lo_offset, 4, 0xffff_ffff)?;
        let lo_mask = self.config_read(bdf, lo_offset, 4);
        let hi_mask = if is_64 {
            self.config_write(bdf, hi_offset, 4, 0xffff_ffff)?;
            self.config_read(bdf, hi_offset, 4)
        } else {
            0xffff_ffff
        };

        self.config_write(bdf, lo_offset, 4, lo)?;
        if is_64 {
            self.config_write(bdf, hi_offset, 4, hi)?;
        }

        let addr_mask = if bar_type == PciBarType::Io {
            0xffff_fffc
        } else {
            0xffff_fff0
        };
        let size_mask = (u64::from(hi_mask) << 32) | u64::from(lo_mask & addr_mask);
        let size = if lo_mask & addr_mask == 0 {
            0
        } else {
            (!size_mask).wrapping_add(1)
        };
        let base = (u64::from(hi) << 32) | u64::from(lo & addr_mask);

        debug!("partition {} sized {}: size {:#x}", self.id, bdf, size);
        Ok(BarSizing {
            bdf,
            bar_idx: STSHMEM_SHM_BAR,
            bar_type,
            size,
            base,
        })
    }

    pub fn summary(&self) -> PartitionSummary {
        let devices = self
            .pci_bus
            .devices()
            .filter_map(|(_, device)| {
                let mut device = device.lock().unwrap();
                device
                    .as_any_mut()
                    .downcast_mut::<StshmemDevice>()
                    .map(|d| d.state())
            })
            .collect();

        PartitionSummary {
            id: self.id,
            name: self.name.clone(),
            synctime: self.synctime,
            devices,
            mappings: self.slat.mappings(),
        }
    }

    /// Unplugs every device, then removes the synchronized time mapping.
    /// Devices that fail to release their mapping stay on the bus so the
    /// teardown can be retried.
    pub fn shutdown(&mut self) -> Result<()> {
        for bdf in self.device_bdfs() {
            if let Some(device) = self.pci_bus.device(bdf) {
                device
                    .lock()
                    .unwrap()
                    .deinit()
                    .map_err(|e| Error::Teardown(bdf, e))?;
            }
            self.pci_bus.remove_device(bdf);
        }

        if let (Some(page), Some(mapping)) = (self.synctime_page, self.synctime) {
            page.unmap(self.slat.as_ref(), GuestAddress(mapping.guest_base))
                .map_err(Error::UnmapSyncTime)?;
            self.synctime = None;
        }

        info!("partition {} ({}) shut down", self.id, self.name);
        Ok(())
    }
}

impl Drop for Partition {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Error shutting down partition {}: {}", self.id, e);
        }
    }
}
