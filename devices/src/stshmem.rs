// SPDX-License-Identifier: Apache-2.0
//

//! Synchronized-time shared memory device (stshmem).
//!
//! A plain PCI function whose only resource is BAR 2, backed by one of the
//! named host regions of the [`ShmRegionRegistry`]. Whenever the guest moves
//! the BAR, the second-level mapping follows it, so partitions exchange data
//! through the region without any hypercall.

use std::any::Any;
use std::io;
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};
use hypervisor::{HypervisorVmError, MappingFlags, Vm};
use pci::{
    bar_index, is_bar_access, is_header_access, BarReprogrammingParams, PciBar, PciBdf,
    PciClassCode, PciConfiguration, PciConfigurationError, PciDevice, PciDeviceError,
    PciHeaderType, PciSubclass,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vm_memory::{Address, GuestAddress};

use crate::shm_region::ShmRegionRegistry;

const STSHMEM_VENDOR_ID: u16 = 0x1c7e;
const STSHMEM_DEVICE_ID: u16 = 0xbeef;
const STSHMEM_REVISION_ID: u8 = 0x01;

/// The shared memory is always exposed through BAR 2.
pub const STSHMEM_SHM_BAR: usize = 2;

/// Number of stshmem devices the hypervisor can host at once.
pub const STSHMEM_DEV_NUM: usize = 8;

/// Size of the register block, in bytes.
pub const STSHMEM_REGISTERS_SIZE: usize = 16;

const IRQ_MASK_OFFSET: u64 = 0x0;
const IRQ_STATE_OFFSET: u64 = 0x4;
const IV_POSITION_OFFSET: u64 = 0x8;
const DOORBELL_OFFSET: u64 = 0xc;

#[derive(Debug, Error)]
pub enum StshmemError {
    #[error("All {STSHMEM_DEV_NUM} stshmem device slots are in use")]
    PoolExhausted,
    #[error("Failed to set up BAR {0}")]
    BarSetup(usize, #[source] PciConfigurationError),
    #[error("Failed to map shared memory at {0:#x}")]
    MapBar(u64, #[source] HypervisorVmError),
    #[error("Failed to unmap shared memory at {0:#x}")]
    UnmapBar(u64, #[source] HypervisorVmError),
}
pub type Result<T> = std::result::Result<T, StshmemError>;

#[derive(Copy, Clone)]
pub enum StshmemSubclass {
    Other = 0x00,
}

impl PciSubclass for StshmemSubclass {
    fn get_register_value(&self) -> u8 {
        *self as u8
    }
}

/// Identifies the device bound to a pool slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StshmemOwner {
    pub partition: u16,
    pub bdf: PciBdf,
}

/// Exclusive claim on one pool slot.
///
/// The handle can't be cloned and is consumed by [`StshmemPool::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct StshmemSlot {
    index: usize,
}

impl StshmemSlot {
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Fixed pool of stshmem device slots, shared by every partition.
#[derive(Default)]
pub struct StshmemPool {
    slots: Mutex<[Option<StshmemOwner>; STSHMEM_DEV_NUM]>,
}

impl StshmemPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `owner` to the first free slot.
    pub fn allocate(&self, owner: StshmemOwner) -> Result<StshmemSlot> {
        let mut slots = self.slots.lock().unwrap();
        let index = slots
            .iter()
            .position(Option::is_none)
            .ok_or(StshmemError::PoolExhausted)?;
        debug!(
            "stshmem slot {} bound to partition {} device {}",
            index, owner.partition, owner.bdf
        );
        slots[index] = Some(owner);

        Ok(StshmemSlot { index })
    }

    pub fn release(&self, slot: StshmemSlot) {
        let owner = self.slots.lock().unwrap()[slot.index].take();
        if let Some(owner) = owner {
            debug!(
                "stshmem slot {} released by partition {} device {}",
                slot.index, owner.partition, owner.bdf
            );
        }
    }

    pub fn owner(&self, slot: &StshmemSlot) -> Option<StshmemOwner> {
        self.slots.lock().unwrap()[slot.index].clone()
    }

    /// Number of slots currently bound.
    pub fn occupied(&self) -> usize {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.is_some())
            .count()
    }
}

/// Device registers. Doorbell and interrupts are not wired, the block only
/// holds state.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StshmemRegisters {
    pub irq_mask: u32,
    pub irq_state: u32,
    pub iv_position: u32,
    pub doorbell: u32,
}

impl StshmemRegisters {
    /// Reads the 32-bit register at `offset` into `data`. Returns false for
    /// accesses that don't match a register exactly.
    pub fn read(&self, offset: u64, data: &mut [u8]) -> bool {
        if data.len() != 4 {
            return false;
        }
        let value = match offset {
            IRQ_MASK_OFFSET => self.irq_mask,
            IRQ_STATE_OFFSET => self.irq_state,
            IV_POSITION_OFFSET => self.iv_position,
            DOORBELL_OFFSET => self.doorbell,
            _ => return false,
        };
        LittleEndian::write_u32(data, value);
        true
    }

    /// Writes the 32-bit register at `offset`. The position register is
    /// read-only.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> bool {
        if data.len() != 4 {
            return false;
        }
        let value = LittleEndian::read_u32(data);
        match offset {
            IRQ_MASK_OFFSET => self.irq_mask = value,
            IRQ_STATE_OFFSET => self.irq_state = value,
            DOORBELL_OFFSET => self.doorbell = value,
            _ => return false,
        }
        true
    }

    pub fn to_bytes(&self) -> [u8; STSHMEM_REGISTERS_SIZE] {
        let mut bytes = [0u8; STSHMEM_REGISTERS_SIZE];
        for offset in (0..STSHMEM_REGISTERS_SIZE).step_by(4) {
            self.read(offset as u64, &mut bytes[offset..offset + 4]);
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != STSHMEM_REGISTERS_SIZE {
            return None;
        }
        Some(StshmemRegisters {
            irq_mask: LittleEndian::read_u32(&bytes[0..4]),
            irq_state: LittleEndian::read_u32(&bytes[4..8]),
            iv_position: LittleEndian::read_u32(&bytes[8..12]),
            doorbell: LittleEndian::read_u32(&bytes[12..16]),
        })
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StshmemDeviceState {
    pub id: String,
    pub owner: StshmemOwner,
    pub region: String,
    pub registers: StshmemRegisters,
    pub bar: PciBar,
    pub mapped_at: Option<u64>,
}

pub struct StshmemDevice {
    id: String,
    owner: StshmemOwner,
    region: String,

    registers: StshmemRegisters,

    // PCI configuration registers.
    configuration: PciConfiguration,

    pool: Arc<StshmemPool>,
    slot: Option<StshmemSlot>,
    vm: Arc<dyn Vm>,
    // Guest address of the live BAR 2 mapping.
    mapping: Option<GuestAddress>,
}

impl StshmemDevice {
    /// Creates the device and binds it to a pool slot.
    ///
    /// `bar_config` is the static value of BAR 2: its low bits select the
    /// BAR type. If `region` isn't registered the device is still created,
    /// with a zero sized BAR that never maps anything.
    pub fn new(
        id: String,
        owner: StshmemOwner,
        region: &str,
        bar_config: u64,
        registry: &ShmRegionRegistry,
        pool: Arc<StshmemPool>,
        vm: Arc<dyn Vm>,
    ) -> Result<Self> {
        let slot = pool.allocate(owner.clone())?;

        let mut configuration = PciConfiguration::new(
            STSHMEM_VENDOR_ID,
            STSHMEM_DEVICE_ID,
            STSHMEM_REVISION_ID,
            PciClassCode::MemoryController,
            &StshmemSubclass::Other,
            None,
            PciHeaderType::Device,
            0,
            0,
        );

        let (size, host_base) = match registry.find_region(region) {
            Some(r) => (r.size(), Some(r.host_base())),
            None => {
                error!(
                    "stshmem device {} has no memory region {:?}",
                    owner.bdf, region
                );
                (0, None)
            }
        };

        if let Err(e) = configuration.init_bar(STSHMEM_SHM_BAR, bar_config, size, host_base) {
            pool.release(slot);
            return Err(StshmemError::BarSetup(STSHMEM_SHM_BAR, e));
        }

        let registers = StshmemRegisters {
            iv_position: slot.index() as u32,
            ..Default::default()
        };

        info!(
            "stshmem device {} ({}) slot {} region {:?} size {:#x}",
            id,
            owner.bdf,
            slot.index(),
            region,
            size
        );

        Ok(StshmemDevice {
            id,
            owner,
            region: region.to_string(),
            registers,
            configuration,
            pool,
            slot: Some(slot),
            vm,
            mapping: None,
        })
    }

    pub fn owner(&self) -> &StshmemOwner {
        &self.owner
    }

    /// Pool slot held by the device, `None` once torn down.
    pub fn slot_index(&self) -> Option<usize> {
        self.slot.as_ref().map(StshmemSlot::index)
    }

    pub fn registers(&self) -> &StshmemRegisters {
        &self.registers
    }

    /// Descriptor of the shared memory BAR.
    pub fn shm_bar(&self) -> PciBar {
        self.configuration
            .bar(STSHMEM_SHM_BAR)
            .copied()
            .unwrap_or_default()
    }

    pub fn mapping(&self) -> Option<GuestAddress> {
        self.mapping
    }

    pub fn state(&self) -> StshmemDeviceState {
        StshmemDeviceState {
            id: self.id.clone(),
            owner: self.owner.clone(),
            region: self.region.clone(),
            registers: self.registers,
            bar: self.shm_bar(),
            mapped_at: self.mapping.map(|m| m.raw_value()),
        }
    }

    fn write_bar(&mut self, bar_idx: usize, value: u32) -> std::result::Result<(), PciDeviceError> {
        if let Some(params) = self.configuration.write_bar(bar_idx, value) {
            self.move_bar(&params).map_err(|e| {
                PciDeviceError::MoveBar(
                    params.bar_idx,
                    params.old_base,
                    params.new_base,
                    io::Error::other(e),
                )
            })?;
        }
        Ok(())
    }

    fn move_bar(&mut self, params: &BarReprogrammingParams) -> Result<()> {
        if !params.bar_type.is_memory() {
            return Ok(());
        }

        debug!(
            "stshmem {} BAR {} moved {:#x} -> {:#x}",
            self.id, params.bar_idx, params.old_base, params.new_base
        );
        self.unmap()?;
        if params.new_base != 0 {
            if let Some(host_base) = self.shm_bar().host_base() {
                self.map(GuestAddress(params.new_base), host_base, params.len)?;
            }
        }

        Ok(())
    }

    fn map(&mut self, guest_addr: GuestAddress, host_addr: u64, size: u64) -> Result<()> {
        self.vm
            .install_mapping(
                guest_addr,
                host_addr,
                size,
                MappingFlags::READ | MappingFlags::WRITE | MappingFlags::WRITE_BACK,
            )
            .map_err(|e| StshmemError::MapBar(guest_addr.raw_value(), e))?;
        self.mapping = Some(guest_addr);
        Ok(())
    }

    fn unmap(&mut self) -> Result<()> {
        if let Some(guest_addr) = self.mapping {
            self.vm
                .remove_mapping(guest_addr, self.shm_bar().size())
                .map_err(|e| StshmemError::UnmapBar(guest_addr.raw_value(), e))?;
            self.mapping = None;
        }
        Ok(())
    }
}

fn access_mask(len: usize) -> u32 {
    match len {
        1 => 0xff,
        2 => 0xffff,
        _ => 0xffff_ffff,
    }
}

impl PciDevice for StshmemDevice {
    fn read_config_register(&mut self, offset: usize, len: usize) -> u32 {
        if !is_header_access(offset) {
            return 0xffff_ffff;
        }
        self.configuration.read_config(offset, len)
    }

    fn write_config_register(
        &mut self,
        offset: usize,
        len: usize,
        value: u32,
    ) -> std::result::Result<(), PciDeviceError> {
        if !is_header_access(offset) {
            debug!("stshmem {} ignoring write at {:#x}", self.id, offset);
            return Ok(());
        }
        if !matches!(len, 1 | 2 | 4) || offset % len != 0 {
            warn!(
                "stshmem {} bad config write offset {:#x} len {}",
                self.id, offset, len
            );
            return Ok(());
        }

        if is_bar_access(offset) {
            let bar_idx = bar_index(offset);
            let shift = (offset % 4) * 8;
            let mask = access_mask(len) << shift;
            let current = self.configuration.read_bar(bar_idx);
            let merged = (current & !mask) | ((value << shift) & mask);
            return self.write_bar(bar_idx, merged);
        }

        self.configuration.write_config(offset, len, value);
        Ok(())
    }

    fn deinit(&mut self) -> std::result::Result<(), PciDeviceError> {
        self.unmap()
            .map_err(|e| PciDeviceError::Deinit(io::Error::other(e)))?;
        if let Some(slot) = self.slot.take() {
            self.pool.release(slot);
            info!("stshmem device {} ({}) released", self.id, self.owner.bdf);
        }
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn id(&self) -> Option<String> {
        Some(self.id.clone())
    }
}

impl Drop for StshmemDevice {
    fn drop(&mut self) {
        if let Err(e) = self.deinit() {
            error!("Failed to tear down stshmem device {}: {}", self.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Barrier;
    use std::thread;

    use anyhow::anyhow;
    use pci::{
        PCI_CLASS_CODE_OFFSET, PCI_COMMAND_OFFSET, PCI_DEVICE_ID_OFFSET, PCI_REVISION_ID_OFFSET,
        PCI_VENDOR_ID_OFFSET,
    };

    use super::*;
    use crate::shm_region::{HostRange, ShmRegionConfig};

    const BAR2: usize = 0x18;
    const BAR3: usize = 0x1c;

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Call {
        Install(u64, u64, u64, MappingFlags),
        Remove(u64, u64),
    }

    #[derive(Default)]
    struct RecordingVm {
        calls: Mutex<Vec<Call>>,
        fail_install: AtomicBool,
        fail_remove: AtomicBool,
    }

    impl RecordingVm {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Vm for RecordingVm {
        fn install_mapping(
            &self,
            guest_addr: GuestAddress,
            host_addr: u64,
            size: u64,
            flags: MappingFlags,
        ) -> hypervisor::vm::Result<()> {
            if self.fail_install.load(Ordering::SeqCst) {
                return Err(HypervisorVmError::InstallMapping(
                    guest_addr.raw_value(),
                    anyhow!("no room"),
                ));
            }
            self.calls.lock().unwrap().push(Call::Install(
                guest_addr.raw_value(),
                host_addr,
                size,
                flags,
            ));
            Ok(())
        }

        fn remove_mapping(
            &self,
            guest_addr: GuestAddress,
            size: u64,
        ) -> hypervisor::vm::Result<()> {
            if self.fail_remove.load(Ordering::SeqCst) {
                return Err(HypervisorVmError::RemoveMapping(
                    guest_addr.raw_value(),
                    anyhow!("busy"),
                ));
            }
            self.calls
                .lock()
                .unwrap()
                .push(Call::Remove(guest_addr.raw_value(), size));
            Ok(())
        }
    }

    fn rw() -> MappingFlags {
        MappingFlags::READ | MappingFlags::WRITE | MappingFlags::WRITE_BACK
    }

    fn registry() -> ShmRegionRegistry {
        ShmRegionRegistry::new(
            HostRange {
                base: 0x10_0000,
                size: 0x10_0000,
            },
            &[
                ShmRegionConfig {
                    name: "synctime".to_string(),
                    size: 0x1000,
                },
                ShmRegionConfig {
                    name: "bulk".to_string(),
                    size: 0x1_0000,
                },
            ],
        )
        .unwrap()
    }

    fn owner(device: u8) -> StshmemOwner {
        StshmemOwner {
            partition: 1,
            bdf: PciBdf::new(0, device, 0),
        }
    }

    fn device(
        region: &str,
        bar_config: u64,
        pool: &Arc<StshmemPool>,
        vm: &Arc<RecordingVm>,
    ) -> StshmemDevice {
        StshmemDevice::new(
            "stshmem0".to_string(),
            owner(2),
            region,
            bar_config,
            &registry(),
            pool.clone(),
            vm.clone(),
        )
        .unwrap()
    }

    #[test]
    fn identity() {
        let pool = Arc::new(StshmemPool::new());
        let vm = Arc::new(RecordingVm::default());
        let mut dev = device("synctime", 0, &pool, &vm);

        assert_eq!(dev.read_config_register(PCI_VENDOR_ID_OFFSET, 2), 0x1c7e);
        assert_eq!(dev.read_config_register(PCI_DEVICE_ID_OFFSET, 2), 0xbeef);
        assert_eq!(dev.read_config_register(0, 4), 0xbeef_1c7e);
        assert_eq!(dev.read_config_register(PCI_REVISION_ID_OFFSET, 1), 0x01);
        assert_eq!(dev.read_config_register(PCI_CLASS_CODE_OFFSET, 1), 0x05);
        assert_eq!(dev.read_config_register(0xa, 1), 0x00);
        assert_eq!(dev.read_config_register(0xe, 1), 0x00);

        // Identity is read-only.
        dev.write_config_register(PCI_VENDOR_ID_OFFSET, 2, 0x1234)
            .unwrap();
        dev.write_config_register(8, 4, 0).unwrap();
        assert_eq!(dev.read_config_register(PCI_VENDOR_ID_OFFSET, 2), 0x1c7e);
        assert_eq!(dev.read_config_register(8, 4), 0x0500_0001);

        // Command register is writable.
        dev.write_config_register(PCI_COMMAND_OFFSET, 2, 0x6).unwrap();
        assert_eq!(dev.read_config_register(PCI_COMMAND_OFFSET, 2), 0x6);
    }

    #[test]
    fn synctime_bar_lifecycle() {
        let pool = Arc::new(StshmemPool::new());
        let vm = Arc::new(RecordingVm::default());
        let mut dev = device("synctime", 0, &pool, &vm);

        let bar = dev.shm_bar();
        assert_eq!(bar.size(), 0x1000);
        assert_eq!(bar.mask(), 0xffff_f000);
        assert_eq!(bar.host_base(), Some(0x10_0000));

        dev.write_config_register(BAR2, 4, 0xffff_ffff).unwrap();
        assert_eq!(dev.read_config_register(BAR2, 4), 0xffff_f000);
        assert!(vm.calls().is_empty());

        dev.write_config_register(BAR2, 4, 0x8000_0000).unwrap();
        assert_eq!(dev.read_config_register(BAR2, 4), 0x8000_0000);
        assert_eq!(
            vm.calls(),
            vec![Call::Install(0x8000_0000, 0x10_0000, 0x1000, rw())]
        );
        assert_eq!(dev.mapping(), Some(GuestAddress(0x8000_0000)));

        dev.write_config_register(BAR2, 4, 0).unwrap();
        assert_eq!(
            vm.calls(),
            vec![
                Call::Install(0x8000_0000, 0x10_0000, 0x1000, rw()),
                Call::Remove(0x8000_0000, 0x1000),
            ]
        );
        assert_eq!(dev.mapping(), None);
    }

    #[test]
    fn unresolved_region_never_maps() {
        let pool = Arc::new(StshmemPool::new());
        let vm = Arc::new(RecordingVm::default());
        let mut dev = device("missing", 0, &pool, &vm);

        assert_eq!(dev.shm_bar().size(), 0);
        assert_eq!(dev.shm_bar().host_base(), None);
        assert_eq!(pool.occupied(), 1);

        dev.write_config_register(BAR2, 4, 0xffff_ffff).unwrap();
        assert_eq!(dev.read_config_register(BAR2, 4), 0);
        dev.write_config_register(BAR2, 4, 0x8000_0000).unwrap();
        assert!(vm.calls().is_empty());
        assert_eq!(dev.mapping(), None);
    }

    #[test]
    fn reprogramming_unmaps_before_mapping() {
        let pool = Arc::new(StshmemPool::new());
        let vm = Arc::new(RecordingVm::default());
        let mut dev = device("bulk", 0, &pool, &vm);

        dev.write_config_register(BAR2, 4, 0x8000_0000).unwrap();
        dev.write_config_register(BAR2, 4, 0x9000_0000).unwrap();
        // Same address again.
        dev.write_config_register(BAR2, 4, 0x9000_0000).unwrap();
        assert_eq!(
            vm.calls(),
            vec![
                Call::Install(0x8000_0000, 0x10_1000, 0x1_0000, rw()),
                Call::Remove(0x8000_0000, 0x1_0000),
                Call::Install(0x9000_0000, 0x10_1000, 0x1_0000, rw()),
            ]
        );
    }

    #[test]
    fn sizing_cycle_unmaps() {
        let pool = Arc::new(StshmemPool::new());
        let vm = Arc::new(RecordingVm::default());
        let mut dev = device("synctime", 0, &pool, &vm);

        dev.write_config_register(BAR2, 4, 0x8000_0000).unwrap();
        dev.write_config_register(BAR2, 4, 0xffff_ffff).unwrap();
        assert_eq!(dev.mapping(), None);
        dev.write_config_register(BAR2, 4, 0x8000_0000).unwrap();
        assert_eq!(
            vm.calls(),
            vec![
                Call::Install(0x8000_0000, 0x10_0000, 0x1000, rw()),
                Call::Remove(0x8000_0000, 0x1000),
                Call::Install(0x8000_0000, 0x10_0000, 0x1000, rw()),
            ]
        );
    }

    #[test]
    fn bar_64() {
        let pool = Arc::new(StshmemPool::new());
        let vm = Arc::new(RecordingVm::default());
        // Prefetchable 64-bit memory BAR.
        let mut dev = device("bulk", 0xc, &pool, &vm);

        assert_eq!(dev.read_config_register(BAR2, 4), 0xc);
        assert_eq!(dev.read_config_register(BAR3, 4), 0);

        dev.write_config_register(BAR2, 4, 0xffff_ffff).unwrap();
        dev.write_config_register(BAR3, 4, 0xffff_ffff).unwrap();
        assert_eq!(dev.read_config_register(BAR2, 4), 0xffff_000c);
        assert_eq!(dev.read_config_register(BAR3, 4), 0xffff_ffff);

        dev.write_config_register(BAR2, 4, 0xc000_0000).unwrap();
        assert!(vm.calls().is_empty());
        dev.write_config_register(BAR3, 4, 0x1).unwrap();
        assert_eq!(
            vm.calls(),
            vec![Call::Install(0x1_c000_0000, 0x10_1000, 0x1_0000, rw())]
        );

        dev.deinit().unwrap();
        assert_eq!(vm.calls()[1], Call::Remove(0x1_c000_0000, 0x1_0000));
    }

    #[test]
    fn io_bar_never_maps() {
        let pool = Arc::new(StshmemPool::new());
        let vm = Arc::new(RecordingVm::default());
        let mut dev = device("synctime", 0x1, &pool, &vm);

        dev.write_config_register(BAR2, 4, 0xc000).unwrap();
        assert_eq!(dev.read_config_register(BAR2, 4), 0xc001);
        assert!(vm.calls().is_empty());
    }

    #[test]
    fn failed_install_leaves_bar_unbacked() {
        let pool = Arc::new(StshmemPool::new());
        let vm = Arc::new(RecordingVm::default());
        let mut dev = device("synctime", 0, &pool, &vm);

        vm.fail_install.store(true, Ordering::SeqCst);
        let err = dev.write_config_register(BAR2, 4, 0x8000_0000).unwrap_err();
        assert!(matches!(
            err,
            PciDeviceError::MoveBar(2, 0, 0x8000_0000, _)
        ));
        // The guest still sees the programmed address.
        assert_eq!(dev.read_config_register(BAR2, 4), 0x8000_0000);
        assert_eq!(dev.mapping(), None);

        vm.fail_install.store(false, Ordering::SeqCst);
        dev.write_config_register(BAR2, 4, 0).unwrap();
        assert!(vm.calls().is_empty());
    }

    #[test]
    fn failed_remove_keeps_mapping() {
        let pool = Arc::new(StshmemPool::new());
        let vm = Arc::new(RecordingVm::default());
        let mut dev = device("synctime", 0, &pool, &vm);

        dev.write_config_register(BAR2, 4, 0x8000_0000).unwrap();
        vm.fail_remove.store(true, Ordering::SeqCst);
        assert!(dev.write_config_register(BAR2, 4, 0).is_err());
        assert_eq!(dev.mapping(), Some(GuestAddress(0x8000_0000)));
        assert!(dev.deinit().is_err());
        assert_eq!(pool.occupied(), 1);

        vm.fail_remove.store(false, Ordering::SeqCst);
        dev.deinit().unwrap();
        assert_eq!(vm.calls()[1], Call::Remove(0x8000_0000, 0x1000));
        assert_eq!(pool.occupied(), 0);
    }

    #[test]
    fn partial_width_bar_writes() {
        let pool = Arc::new(StshmemPool::new());
        let vm = Arc::new(RecordingVm::default());
        let mut dev = device("synctime", 0, &pool, &vm);

        dev.write_config_register(BAR2 + 2, 2, 0x8000).unwrap();
        assert_eq!(dev.read_config_register(BAR2, 4), 0x8000_0000);
        assert_eq!(dev.read_config_register(BAR2 + 2, 2), 0x8000);
        dev.write_config_register(BAR2 + 1, 1, 0x10).unwrap();
        assert_eq!(dev.read_config_register(BAR2, 4), 0x8000_1000);
        assert_eq!(
            vm.calls(),
            vec![
                Call::Install(0x8000_0000, 0x10_0000, 0x1000, rw()),
                Call::Remove(0x8000_0000, 0x1000),
                Call::Install(0x8000_1000, 0x10_0000, 0x1000, rw()),
            ]
        );
    }

    #[test]
    fn invalid_accesses() {
        let pool = Arc::new(StshmemPool::new());
        let vm = Arc::new(RecordingVm::default());
        let mut dev = device("synctime", 0, &pool, &vm);

        assert_eq!(dev.read_config_register(0x40, 4), 0xffff_ffff);
        assert_eq!(dev.read_config_register(0xffc, 4), 0xffff_ffff);
        assert_eq!(dev.read_config_register(BAR2 + 1, 2), 0xffff_ffff);
        assert_eq!(dev.read_config_register(BAR2, 3), 0xffff_ffff);

        dev.write_config_register(0x40, 4, 0x1234_5678).unwrap();
        dev.write_config_register(BAR2 + 1, 2, 0x8000).unwrap();
        dev.write_config_register(BAR2, 3, 0x8000_0000).unwrap();
        assert_eq!(dev.read_config_register(BAR2, 4), 0);
        assert!(vm.calls().is_empty());
    }

    #[test]
    fn teardown_is_idempotent() {
        let pool = Arc::new(StshmemPool::new());
        let vm = Arc::new(RecordingVm::default());
        let mut dev = device("synctime", 0, &pool, &vm);

        dev.write_config_register(BAR2, 4, 0x8000_0000).unwrap();
        dev.deinit().unwrap();
        dev.deinit().unwrap();
        drop(dev);

        assert_eq!(
            vm.calls(),
            vec![
                Call::Install(0x8000_0000, 0x10_0000, 0x1000, rw()),
                Call::Remove(0x8000_0000, 0x1000),
            ]
        );
        assert_eq!(pool.occupied(), 0);
    }

    #[test]
    fn drop_releases_slot() {
        let pool = Arc::new(StshmemPool::new());
        let vm = Arc::new(RecordingVm::default());
        let mut dev = device("synctime", 0, &pool, &vm);
        assert_eq!(dev.slot_index(), Some(0));
        assert_eq!(dev.registers().iv_position, 0);

        dev.write_config_register(BAR2, 4, 0x8000_0000).unwrap();
        drop(dev);
        assert_eq!(pool.occupied(), 0);
        assert_eq!(vm.calls().last(), Some(&Call::Remove(0x8000_0000, 0x1000)));
    }

    #[test]
    fn pool_exclusive_under_contention() {
        let pool = Arc::new(StshmemPool::new());
        let barrier = Arc::new(Barrier::new(STSHMEM_DEV_NUM + 1));

        // One more allocator than slots, all released at once.
        let handles: Vec<_> = (0..=STSHMEM_DEV_NUM)
            .map(|i| {
                let pool = pool.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    pool.allocate(owner(i as u8))
                })
            })
            .collect();
        let results: Vec<Result<StshmemSlot>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        let (granted, rejected): (Vec<_>, Vec<_>) = results.into_iter().partition(|r| r.is_ok());
        assert_eq!(rejected.len(), 1);
        assert!(matches!(rejected[0], Err(StshmemError::PoolExhausted)));

        let mut slots: Vec<StshmemSlot> = granted.into_iter().map(|r| r.unwrap()).collect();
        let mut indices: Vec<usize> = slots.iter().map(StshmemSlot::index).collect();
        indices.sort_unstable();
        assert_eq!(indices, (0..STSHMEM_DEV_NUM).collect::<Vec<_>>());
        assert_eq!(pool.occupied(), STSHMEM_DEV_NUM);

        let slot = slots.remove(3);
        let index = slot.index();
        pool.release(slot);
        let slot = pool.allocate(owner(31)).unwrap();
        assert_eq!(slot.index(), index);
        assert_eq!(pool.owner(&slot), Some(owner(31)));
    }

    #[test]
    fn device_creation_fails_on_full_pool() {
        let pool = Arc::new(StshmemPool::new());
        let vm = Arc::new(RecordingVm::default());
        let devices: Vec<_> = (0..STSHMEM_DEV_NUM)
            .map(|_| device("synctime", 0, &pool, &vm))
            .collect();
        let positions: Vec<u32> = devices.iter().map(|d| d.registers().iv_position).collect();
        assert_eq!(positions, (0..STSHMEM_DEV_NUM as u32).collect::<Vec<_>>());

        let err = StshmemDevice::new(
            "stshmem8".to_string(),
            owner(9),
            "synctime",
            0,
            &registry(),
            pool.clone(),
            vm.clone(),
        )
        .err();
        assert!(matches!(err, Some(StshmemError::PoolExhausted)));
    }

    #[test]
    fn bar_setup_failure_releases_slot() {
        let pool = Arc::new(StshmemPool::new());
        let vm = Arc::new(RecordingVm::default());
        // A 32-bit BAR can't decode an 8 GiB region.
        let registry = ShmRegionRegistry::new(
            HostRange {
                base: 0x1_0000_0000,
                size: 0x2_0000_0000,
            },
            &[ShmRegionConfig {
                name: "huge".to_string(),
                size: 0x2_0000_0000,
            }],
        )
        .unwrap();

        let err = StshmemDevice::new(
            "stshmem0".to_string(),
            owner(2),
            "huge",
            0,
            &registry,
            pool.clone(),
            vm.clone(),
        )
        .err();
        assert!(matches!(
            err,
            Some(StshmemError::BarSetup(
                STSHMEM_SHM_BAR,
                PciConfigurationError::BarAddressInvalid(0, 0x2_0000_0000)
            ))
        ));
        assert_eq!(pool.occupied(), 0);

        // The same region behind a 64-bit BAR is fine.
        let dev = StshmemDevice::new(
            "stshmem0".to_string(),
            owner(2),
            "huge",
            0x4,
            &registry,
            pool.clone(),
            vm,
        )
        .unwrap();
        assert_eq!(dev.shm_bar().size(), 0x2_0000_0000);
        assert_eq!(pool.occupied(), 1);
    }

    #[test]
    fn registers_block() {
        let mut regs = StshmemRegisters {
            iv_position: 3,
            ..Default::default()
        };
        let mut data = [0u8; 4];

        assert!(regs.read(IV_POSITION_OFFSET, &mut data));
        assert_eq!(data, [3, 0, 0, 0]);
        assert!(!regs.write(IV_POSITION_OFFSET, &[9, 0, 0, 0]));
        assert!(regs.write(DOORBELL_OFFSET, &[1, 2, 0, 0]));
        assert_eq!(regs.doorbell, 0x201);

        assert!(!regs.read(0x10, &mut data));
        assert!(!regs.read(0x2, &mut data));
        assert!(!regs.read(IRQ_MASK_OFFSET, &mut data[..2]));

        let bytes = regs.to_bytes();
        assert_eq!(StshmemRegisters::from_bytes(&bytes), Some(regs));
        assert_eq!(StshmemRegisters::from_bytes(&bytes[..8]), None);
    }
}
