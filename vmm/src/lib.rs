// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Host side of the shared memory layer: builds the region registry, the
//! device pool and the synchronized time page at boot, then creates and
//! destroys partitions on top of them.

#[macro_use]
extern crate log;

use std::collections::BTreeMap;
use std::sync::Arc;

use devices::{
    HostRange, ShmRegion, ShmRegionRegistry, StshmemError, StshmemPool, SyncTimeError,
    SyncTimePage, TimeRole, STSHMEM_DEV_NUM, SYNCTIME_SHM_SIZE,
};
use hypervisor::HostMemory;
use pci::PciBdf;
use serde::Serialize;
use thiserror::Error;
use vm_memory::GuestAddress;

use crate::config::{PartitionConfig, ValidationError, VmmConfig};
use crate::partition::{BarSizing, Partition, PartitionSummary};

pub mod config;
pub mod partition;

/// Errors associated with VMM management
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration")]
    Validation(#[source] ValidationError),
    #[error("Error allocating host memory")]
    HostMemory(#[source] vm_memory::Error),
    #[error("Error laying out shared memory regions")]
    ShmRegions(#[source] devices::shm_region::Error),
    #[error("Error setting up the synchronized time page")]
    SyncTimePage(#[source] SyncTimeError),
    /// Not enough stshmem slots for the devices of a partition. The layer
    /// can't run with a device that isn't backed by a slot.
    #[error("stshmem device pool exhausted while creating partition {0}")]
    StshmemPoolExhausted(u16),
    #[error("Partition {0} already exists")]
    PartitionExists(u16),
    #[error("Partition {0} can't be a time authority, partition {1} already is")]
    TimeAuthorityTaken(u16, u16),
    #[error("No partition {0}")]
    PartitionNotFound(u16),
    #[error("Error creating partition {0}")]
    CreatePartition(u16, #[source] partition::Error),
    #[error("Error destroying partition {0}")]
    DestroyPartition(u16, #[source] partition::Error),
    #[error("Error in partition {0}")]
    Partition(u16, #[source] partition::Error),
}
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, Serialize)]
pub struct PoolSummary {
    pub capacity: usize,
    pub occupied: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct VmmSummary {
    pub shm_backing: HostRange,
    pub regions: Vec<ShmRegion>,
    pub synctime_page: Option<u64>,
    pub pool: PoolSummary,
    pub partitions: Vec<PartitionSummary>,
}

pub struct Vmm {
    config: VmmConfig,
    host_memory: Arc<HostMemory>,
    registry: Arc<ShmRegionRegistry>,
    pool: Arc<StshmemPool>,
    synctime_page: Option<SyncTimePage>,
    partitions: BTreeMap<u16, Partition>,
}

impl Vmm {
    /// Sets up the host side state shared by every partition. No partition
    /// is created until [`Vmm::boot`].
    pub fn new(config: VmmConfig) -> Result<Self> {
        config.validate().map_err(Error::Validation)?;

        let synctime_page = config
            .synctime
            .as_ref()
            .map(|s| SyncTimePage::new(s.host_base))
            .transpose()
            .map_err(Error::SyncTimePage)?;

        let mut ranges = vec![(
            GuestAddress(config.shm_backing.base),
            config.shm_backing.size as usize,
        )];
        if let Some(page) = &synctime_page {
            ranges.push((GuestAddress(page.host_base()), SYNCTIME_SHM_SIZE as usize));
        }
        ranges.sort_by_key(|(addr, _)| addr.0);
        let host_memory = HostMemory::from_ranges(&ranges).map_err(Error::HostMemory)?;

        let registry = ShmRegionRegistry::new(config.shm_backing, &config.regions)
            .map_err(Error::ShmRegions)?;
        for region in registry.regions() {
            info!(
                "shm region {:?}: host {:#x} size {:#x}",
                region.name(),
                region.host_base(),
                region.size()
            );
        }

        Ok(Vmm {
            config,
            host_memory: Arc::new(host_memory),
            registry: Arc::new(registry),
            pool: Arc::new(StshmemPool::new()),
            synctime_page,
            partitions: BTreeMap::new(),
        })
    }

    /// Creates every partition of the configuration.
    pub fn boot(&mut self) -> Result<()> {
        let partitions = self.config.partitions.clone();
        for partition in &partitions {
            self.create_partition(partition)?;
        }
        info!("booted {} partition(s)", self.partitions.len());
        Ok(())
    }

    pub fn create_partition(&mut self, config: &PartitionConfig) -> Result<()> {
        if self.partitions.contains_key(&config.id) {
            return Err(Error::PartitionExists(config.id));
        }
        if config.is_time_authority() {
            if let Some(authority) = self.time_authority() {
                return Err(Error::TimeAuthorityTaken(config.id, authority));
            }
        }

        let partition = Partition::new(
            config,
            self.host_memory.clone(),
            &self.registry,
            &self.pool,
            self.synctime_page,
        )
        .map_err(|e| match e {
            partition::Error::CreateStshmem(_, StshmemError::PoolExhausted) => {
                error!(
                    "no stshmem slot left for partition {}, {} in use",
                    config.id, STSHMEM_DEV_NUM
                );
                Error::StshmemPoolExhausted(config.id)
            }
            e => Error::CreatePartition(config.id, e),
        })?;
        self.partitions.insert(config.id, partition);

        Ok(())
    }

    pub fn destroy_partition(&mut self, id: u16) -> Result<()> {
        let partition = self
            .partitions
            .get_mut(&id)
            .ok_or(Error::PartitionNotFound(id))?;
        partition
            .shutdown()
            .map_err(|e| Error::DestroyPartition(id, e))?;
        self.partitions.remove(&id);

        Ok(())
    }

    /// Destroys every partition. Stops at the first one that can't be torn
    /// down, leaving it and the remaining ones in place.
    pub fn shutdown(&mut self) -> Result<()> {
        let ids: Vec<u16> = self.partitions.keys().copied().collect();
        for id in ids {
            self.destroy_partition(id)?;
        }
        debug!("stshmem slots in use after shutdown: {}", self.pool.occupied());
        Ok(())
    }

    fn time_authority(&self) -> Option<u16> {
        self.partitions
            .values()
            .find(|p| p.synctime().is_some_and(|s| s.role == TimeRole::Authority))
            .map(Partition::id)
    }

    pub fn registry(&self) -> &Arc<ShmRegionRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<StshmemPool> {
        &self.pool
    }

    pub fn partition(&self, id: u16) -> Result<&Partition> {
        self.partitions.get(&id).ok_or(Error::PartitionNotFound(id))
    }

    pub fn partition_mut(&mut self, id: u16) -> Result<&mut Partition> {
        self.partitions
            .get_mut(&id)
            .ok_or(Error::PartitionNotFound(id))
    }

    pub fn partition_ids(&self) -> Vec<u16> {
        self.partitions.keys().copied().collect()
    }

    pub fn pci_config_read(&self, id: u16, bdf: PciBdf, offset: usize, len: usize) -> Result<u32> {
        Ok(self.partition(id)?.config_read(bdf, offset, len))
    }

    pub fn pci_config_write(
        &self,
        id: u16,
        bdf: PciBdf,
        offset: usize,
        len: usize,
        value: u32,
    ) -> Result<()> {
        self.partition(id)?
            .config_write(bdf, offset, len, value)
            .map_err(|e| Error::Partition(id, e))
    }

    pub fn guest_read(&self, id: u16, addr: GuestAddress, data: &mut [u8]) -> Result<()> {
        self.partition(id)?
            .guest_read(addr, data)
            .map_err(|e| Error::Partition(id, e))
    }

    pub fn guest_write(&self, id: u16, addr: GuestAddress, data: &[u8]) -> Result<()> {
        self.partition(id)?
            .guest_write(addr, data)
            .map_err(|e| Error::Partition(id, e))
    }

    pub fn size_bar(&self, id: u16, bdf: PciBdf) -> Result<BarSizing> {
        self.partition(id)?
            .size_bar(bdf)
            .map_err(|e| Error::Partition(id, e))
    }

    /// Sizes the shared memory BAR of every device of every partition.
    pub fn size_all_bars(&self) -> Result<Vec<(u16, BarSizing)>> {
        let mut bars = Vec::new();
        for (id, partition) in &self.partitions {
            for bdf in partition.device_bdfs() {
                bars.push((*id, self.size_bar(*id, bdf)?));
            }
        }
        Ok(bars)
    }

    pub fn summary(&self) -> VmmSummary {
        VmmSummary {
            shm_backing: self.registry.backing(),
            regions: self.registry.regions().to_vec(),
            synctime_page: self.synctime_page.map(|p| p.host_base()),
            pool: PoolSummary {
                capacity: STSHMEM_DEV_NUM,
                occupied: self.pool.occupied(),
            },
            partitions: self.partitions.values().map(Partition::summary).collect(),
        }
    }
}
