// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// The number of 32bit registers in the config space, 256 bytes.
const NUM_CONFIGURATION_REGISTERS: usize = 64;

/// Size of the standard type 0 configuration header.
pub const PCI_CONFIG_HEADER_SIZE: usize = 0x40;

pub const PCI_VENDOR_ID_OFFSET: usize = 0x00;
pub const PCI_DEVICE_ID_OFFSET: usize = 0x02;
pub const PCI_COMMAND_OFFSET: usize = 0x04;
pub const PCI_REVISION_ID_OFFSET: usize = 0x08;
pub const PCI_CLASS_CODE_OFFSET: usize = 0x0b;
pub const PCI_BAR0_OFFSET: usize = 0x10;

const BAR0_REG: usize = 4;
const BAR_IO_ADDR_MASK: u32 = 0xffff_fffc;
const BAR_MEM_ADDR_MASK: u32 = 0xffff_fff0;
const BAR_IO_BIT: u32 = 0x1;
const BAR_MEM_TYPE_MASK: u32 = 0x6;
const BAR_MEM_TYPE_64: u32 = 0x4;
const BAR_IO_BASE_MASK: u64 = 0xffff;
pub const NUM_BAR_REGS: usize = 6;

/// Represents the types of PCI headers allowed in the configuration registers.
#[derive(Copy, Clone)]
pub enum PciHeaderType {
    Device,
}

/// Classes of PCI nodes.
#[allow(dead_code)]
#[derive(Copy, Clone)]
pub enum PciClassCode {
    TooOld,
    MassStorage,
    NetworkController,
    DisplayController,
    MultimediaController,
    MemoryController,
    BridgeDevice,
    SimpleCommunicationController,
    BaseSystemPeripheral,
    InputDevice,
    DockingStation,
    Processor,
    SerialBusController,
    WirelessController,
    IntelligentIoController,
    EncryptionController,
    DataAcquisitionSignalProcessing,
    Other = 0xff,
}

impl PciClassCode {
    pub fn get_register_value(self) -> u8 {
        self as u8
    }
}

/// A PCI sublcass. Each class in `PciClassCode` can specify a unique set of subclasses. This trait
/// is implemented by each subclass. It allows use of a trait object to generate configurations.
pub trait PciSubclass {
    /// Convert this subclass to the value used in the PCI specification.
    fn get_register_value(&self) -> u8;
}

/// A PCI class programming interface. Each combination of `PciClassCode` and
/// `PciSubclass` can specify a set of register-level programming interfaces.
/// This trait is implemented by each programming interface.
/// It allows use of a trait object to generate configurations.
pub trait PciProgrammingInterface {
    /// Convert this programming interface to the value used in the PCI specification.
    fn get_register_value(&self) -> u8;
}

/// Decoded type of a base address register.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PciBarType {
    /// BAR not implemented by the device, reads as zero.
    #[default]
    Unused,
    Memory32,
    Memory64,
    /// Upper half of the preceding 64-bit memory BAR.
    Memory64High,
    Io,
}

impl PciBarType {
    /// Decodes the type encoded in the low bits of a BAR value.
    pub fn from_register(value: u32) -> Self {
        if value & BAR_IO_BIT != 0 {
            PciBarType::Io
        } else if value & BAR_MEM_TYPE_MASK == BAR_MEM_TYPE_64 {
            PciBarType::Memory64
        } else {
            PciBarType::Memory32
        }
    }

    fn address_mask(self) -> u32 {
        match self {
            PciBarType::Io => BAR_IO_ADDR_MASK,
            PciBarType::Memory64High => 0xffff_ffff,
            _ => BAR_MEM_ADDR_MASK,
        }
    }

    pub fn is_memory(self) -> bool {
        matches!(self, PciBarType::Memory32 | PciBarType::Memory64)
    }
}

/// Virtual BAR descriptor.
///
/// `size`, `mask`, `fixed` and `host_base` are set once when the BAR is
/// initialized. `guest_base` follows the address the guest programs and is
/// `0` while the BAR is unprogrammed or being sized.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciBar {
    bar_type: PciBarType,
    size: u64,
    host_base: Option<u64>,
    guest_base: u64,
    mask: u32,
    fixed: u32,
    sizing: bool,
}

impl PciBar {
    pub fn bar_type(&self) -> PciBarType {
        self.bar_type
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn host_base(&self) -> Option<u64> {
        self.host_base
    }

    pub fn guest_base(&self) -> u64 {
        self.guest_base
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    pub fn fixed(&self) -> u32 {
        self.fixed
    }
}

/// Describes a change of the guest address of a BAR, as produced by a
/// guest write to one of the BAR registers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BarReprogrammingParams {
    /// Index of the BAR, always the low slot for 64-bit BARs.
    pub bar_idx: usize,
    pub old_base: u64,
    pub new_base: u64,
    pub len: u64,
    pub bar_type: PciBarType,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("address {0:#x} size {1:#x} too big")]
    BarAddressInvalid(u64, u64),
    #[error("bar {0} invalid, max {max}", max = NUM_BAR_REGS - 1)]
    BarInvalid(usize),
    #[error("64bit bar {0} invalid, requires two regs, max {max}", max = NUM_BAR_REGS - 1)]
    BarInvalid64(usize),
    #[error("bar size {0:#x} not a power of two")]
    BarSizeInvalid(u64),
}
pub type Result<T> = std::result::Result<T, Error>;

/// Returns true if `offset` lies in the standard configuration header.
pub fn is_header_access(offset: usize) -> bool {
    offset < PCI_CONFIG_HEADER_SIZE
}

/// Returns true if `offset` targets one of the six BAR registers.
pub fn is_bar_access(offset: usize) -> bool {
    (PCI_BAR0_OFFSET..PCI_BAR0_OFFSET + NUM_BAR_REGS * 4).contains(&offset)
}

/// Index of the BAR register containing `offset`.
pub fn bar_index(offset: usize) -> usize {
    (offset - PCI_BAR0_OFFSET) / 4
}

/// Configuration space offset of BAR `bar_idx`.
pub fn bar_offset(bar_idx: usize) -> usize {
    PCI_BAR0_OFFSET + bar_idx * 4
}

/// Contains the configuration space of a PCI node.
/// See the [specification](https://en.wikipedia.org/wiki/PCI_configuration_space).
///
/// Header fields live in a register store guarded by per-register writable
/// masks. BAR registers are only updated through `init_bar` and `write_bar`,
/// which keep the register contents and the `PciBar` descriptors in sync.
pub struct PciConfiguration {
    registers: [u32; NUM_CONFIGURATION_REGISTERS],
    writable_bits: [u32; NUM_CONFIGURATION_REGISTERS], // writable bits for each register.
    bars: [PciBar; NUM_BAR_REGS],
}

impl PciConfiguration {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vendor_id: u16,
        device_id: u16,
        revision_id: u8,
        class_code: PciClassCode,
        subclass: &dyn PciSubclass,
        programming_interface: Option<&dyn PciProgrammingInterface>,
        header_type: PciHeaderType,
        subsystem_vendor_id: u16,
        subsystem_id: u16,
    ) -> Self {
        let mut registers = [0u32; NUM_CONFIGURATION_REGISTERS];
        let mut writable_bits = [0u32; NUM_CONFIGURATION_REGISTERS];
        registers[0] = (u32::from(device_id) << 16) | u32::from(vendor_id);
        // TODO: Status should be write-1-to-clear
        writable_bits[1] = 0x0000_ffff; // Status (r/o), command (r/w)
        let pi = if let Some(pi) = programming_interface {
            pi.get_register_value()
        } else {
            0
        };
        registers[2] = (u32::from(class_code.get_register_value()) << 24)
            | (u32::from(subclass.get_register_value()) << 16)
            | (u32::from(pi) << 8)
            | u32::from(revision_id);
        writable_bits[3] = 0x0000_00ff; // Cacheline size (r/w)
        match header_type {
            PciHeaderType::Device => {
                registers[3] = 0x0000_0000; // Header type 0 (device)
                writable_bits[15] = 0x0000_00ff; // Interrupt line (r/w)
            }
        };
        registers[11] = (u32::from(subsystem_id) << 16) | u32::from(subsystem_vendor_id);

        PciConfiguration {
            registers,
            writable_bits,
            bars: [PciBar::default(); NUM_BAR_REGS],
        }
    }

    /// Reads a 32bit register from `reg_idx` in the register map.
    pub fn read_reg(&self, reg_idx: usize) -> u32 {
        *(self.registers.get(reg_idx).unwrap_or(&0xffff_ffff))
    }

    /// Writes a 32bit register to `reg_idx` in the register map, honouring
    /// the writable bits of that register.
    pub fn write_reg(&mut self, reg_idx: usize, value: u32) {
        if let Some(r) = self.registers.get_mut(reg_idx) {
            let mask = self.writable_bits[reg_idx];
            *r = (*r & !mask) | (value & mask);
        } else {
            warn!("bad PCI register write {}", reg_idx);
        }
    }

    /// Writes a 16bit word to `offset`. `offset` must be 16bit aligned.
    pub fn write_word(&mut self, offset: usize, value: u16) {
        let shift = match offset % 4 {
            0 => 0,
            2 => 16,
            _ => {
                warn!("bad PCI config write offset {}", offset);
                return;
            }
        };
        self.write_masked(offset, 0xffff << shift, u32::from(value) << shift);
    }

    /// Writes a byte to `offset`.
    pub fn write_byte(&mut self, offset: usize, value: u8) {
        let shift = (offset % 4) * 8;
        self.write_masked(offset, 0xff << shift, u32::from(value) << shift);
    }

    fn write_masked(&mut self, offset: usize, mask: u32, value: u32) {
        let reg_idx = offset / 4;
        if let Some(r) = self.registers.get_mut(reg_idx) {
            let mask = mask & self.writable_bits[reg_idx];
            *r = (*r & !mask) | (value & mask);
        } else {
            warn!("bad PCI config write offset {}", offset);
        }
    }

    /// Reads `len` bytes (1, 2 or 4) at `offset`. The access must not cross
    /// a register boundary; invalid accesses read as all ones.
    pub fn read_config(&self, offset: usize, len: usize) -> u32 {
        if !matches!(len, 1 | 2 | 4) || offset % len != 0 {
            return 0xffff_ffff;
        }
        let value = self.read_reg(offset / 4) >> ((offset % 4) * 8);
        value & width_mask(len)
    }

    /// Guest write of `len` bytes (1, 2 or 4) at `offset` into the generic
    /// register store. BAR registers are read-only through this path.
    pub fn write_config(&mut self, offset: usize, len: usize, value: u32) {
        if offset % len.max(1) != 0 {
            warn!("unaligned PCI config write offset {} len {}", offset, len);
            return;
        }
        match len {
            1 => self.write_byte(offset, value as u8),
            2 => self.write_word(offset, value as u16),
            4 => self.write_reg(offset / 4, value),
            _ => warn!("bad PCI config write length {}", len),
        }
    }

    /// Returns the descriptor of BAR `bar_idx`.
    pub fn bar(&self, bar_idx: usize) -> Option<&PciBar> {
        self.bars.get(bar_idx)
    }

    /// Sizes BAR `bar_idx` from its static configuration value.
    ///
    /// `config` carries the type bits (and an optional initial address) the
    /// way a physical BAR would. A `size` of zero leaves the BAR typed but
    /// unsized: it reads as its fixed bits and never decodes an address.
    /// 64-bit memory BARs claim the following slot as their upper half; both
    /// registers are written before this returns.
    pub fn init_bar(
        &mut self,
        bar_idx: usize,
        config: u64,
        size: u64,
        host_base: Option<u64>,
    ) -> Result<PciBarType> {
        if bar_idx >= NUM_BAR_REGS {
            return Err(Error::BarInvalid(bar_idx));
        }

        let bar_type = PciBarType::from_register(config as u32);
        self.bars[bar_idx] = PciBar {
            bar_type,
            ..Default::default()
        };
        self.registers[BAR0_REG + bar_idx] = 0;

        if size == 0 {
            return Ok(bar_type);
        }

        if !size.is_power_of_two() {
            return Err(Error::BarSizeInvalid(size));
        }

        match bar_type {
            PciBarType::Memory64 => {
                if bar_idx + 1 >= NUM_BAR_REGS {
                    return Err(Error::BarInvalid64(bar_idx));
                }
            }
            _ => {
                if size > 1 << 32 {
                    return Err(Error::BarAddressInvalid(config, size));
                }
            }
        }

        let type_mask = bar_type.address_mask();
        let size_mask = !(size - 1);
        let mask = (size_mask as u32) & type_mask;
        let fixed = (config as u32) & !type_mask;
        self.bars[bar_idx] = PciBar {
            bar_type,
            size,
            host_base,
            guest_base: 0,
            mask,
            fixed,
            sizing: false,
        };
        self.registers[BAR0_REG + bar_idx] = ((config as u32) & mask) | fixed;

        if bar_type == PciBarType::Memory64 {
            let high_mask = (size_mask >> 32) as u32;
            self.bars[bar_idx + 1] = PciBar {
                bar_type: PciBarType::Memory64High,
                mask: high_mask,
                ..Default::default()
            };
            self.registers[BAR0_REG + bar_idx + 1] = ((config >> 32) as u32) & high_mask;
        }

        Ok(bar_type)
    }

    /// Returns the raw register value of BAR `bar_idx`.
    pub fn read_bar(&self, bar_idx: usize) -> u32 {
        self.read_reg(BAR0_REG + bar_idx)
    }

    /// Guest write of a full 32-bit value to BAR `bar_idx`.
    ///
    /// The value is masked by the BAR size and merged with its fixed type
    /// bits. Writing all ones starts a sizing cycle, during which the BAR
    /// decodes no address. Returns the reprogramming parameters when the
    /// guest address of the logical BAR changed.
    pub fn write_bar(&mut self, bar_idx: usize, value: u32) -> Option<BarReprogrammingParams> {
        let bar = *self.bars.get(bar_idx)?;
        if bar.bar_type == PciBarType::Unused {
            return None;
        }

        let base_idx = if bar.bar_type == PciBarType::Memory64High {
            bar_idx.checked_sub(1)?
        } else {
            bar_idx
        };
        let old_base = self.bars[base_idx].guest_base;

        let reg = if bar.bar_type == PciBarType::Memory64High {
            value & bar.mask
        } else {
            (value & bar.mask) | bar.fixed
        };
        self.registers[BAR0_REG + bar_idx] = reg;
        self.bars[bar_idx].sizing = value == 0xffff_ffff;

        let new_base = self.bar_base(base_idx);
        self.bars[base_idx].guest_base = new_base;

        if new_base == old_base {
            return None;
        }

        let base = &self.bars[base_idx];
        Some(BarReprogrammingParams {
            bar_idx: base_idx,
            old_base,
            new_base,
            len: base.size,
            bar_type: base.bar_type,
        })
    }

    // Address currently decoded by the BAR, 0 while unprogrammed or sizing.
    fn bar_base(&self, bar_idx: usize) -> u64 {
        let bar = &self.bars[bar_idx];
        if bar.size == 0 || bar.sizing {
            return 0;
        }

        let lo = self.registers[BAR0_REG + bar_idx] & bar.mask;
        match bar.bar_type {
            PciBarType::Memory32 => u64::from(lo),
            PciBarType::Memory64 => {
                let high = &self.bars[bar_idx + 1];
                if high.sizing {
                    return 0;
                }
                let hi = self.registers[BAR0_REG + bar_idx + 1] & high.mask;
                (u64::from(hi) << 32) | u64::from(lo)
            }
            PciBarType::Io => u64::from(lo) & BAR_IO_BASE_MASK,
            PciBarType::Memory64High | PciBarType::Unused => 0,
        }
    }
}

fn width_mask(len: usize) -> u32 {
    match len {
        1 => 0xff,
        2 => 0xffff,
        _ => 0xffff_ffff,
    }
}
