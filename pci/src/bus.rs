// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::{Error as PciDeviceError, PciDevice};

const CONFIG_ADDRESS_ENABLE: u32 = 0x8000_0000;

/// Errors for the PCI bus.
#[derive(Error, Debug)]
pub enum PciRootError {
    #[error("A device is already registered at {0}")]
    DeviceAlreadyPresent(PciBdf),
    #[error("Configuration write to {0} failed")]
    ConfigWrite(PciBdf, #[source] PciDeviceError),
    #[error("Invalid PCI BDF {0:?}")]
    InvalidBdf(String),
}
pub type Result<T> = std::result::Result<T, PciRootError>;

/// Bus/device/function address of a PCI function.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PciBdf {
    bus: u8,
    device: u8,
    function: u8,
}

impl PciBdf {
    pub fn new(bus: u8, device: u8, function: u8) -> Self {
        PciBdf {
            bus,
            device: device & 0x1f,
            function: function & 0x7,
        }
    }

    pub fn bus(&self) -> u8 {
        self.bus
    }

    pub fn device(&self) -> u8 {
        self.device
    }

    pub fn function(&self) -> u8 {
        self.function
    }
}

impl Display for PciBdf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{:x}", self.bus, self.device, self.function)
    }
}

impl FromStr for PciBdf {
    type Err = PciRootError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || PciRootError::InvalidBdf(s.to_string());
        let (bus, rest) = s.split_once(':').ok_or_else(invalid)?;
        let (device, function) = rest.split_once('.').ok_or_else(invalid)?;

        let bus = u8::from_str_radix(bus, 16).map_err(|_| invalid())?;
        let device = u8::from_str_radix(device, 16).map_err(|_| invalid())?;
        let function = u8::from_str_radix(function, 16).map_err(|_| invalid())?;
        if device > 0x1f || function > 0x7 {
            return Err(invalid());
        }

        Ok(PciBdf::new(bus, device, function))
    }
}

impl TryFrom<String> for PciBdf {
    type Error = PciRootError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<PciBdf> for String {
    fn from(bdf: PciBdf) -> Self {
        bdf.to_string()
    }
}

/// Virtual PCI bus of one partition.
///
/// Dispatches configuration accesses to the devices registered at a given
/// BDF, either directly or through the legacy 0xcf8/0xcfc port mechanism.
#[derive(Default)]
pub struct PciBus {
    devices: BTreeMap<PciBdf, Arc<Mutex<dyn PciDevice>>>,
    /// Config space address register (0xcf8).
    config_address: u32,
}

impl PciBus {
    pub fn new() -> Self {
        PciBus::default()
    }

    pub fn add_device(&mut self, bdf: PciBdf, device: Arc<Mutex<dyn PciDevice>>) -> Result<()> {
        if self.devices.contains_key(&bdf) {
            return Err(PciRootError::DeviceAlreadyPresent(bdf));
        }
        self.devices.insert(bdf, device);
        Ok(())
    }

    pub fn remove_device(&mut self, bdf: PciBdf) -> Option<Arc<Mutex<dyn PciDevice>>> {
        self.devices.remove(&bdf)
    }

    pub fn device(&self, bdf: PciBdf) -> Option<Arc<Mutex<dyn PciDevice>>> {
        self.devices.get(&bdf).cloned()
    }

    pub fn devices(&self) -> impl Iterator<Item = (&PciBdf, &Arc<Mutex<dyn PciDevice>>)> {
        self.devices.iter()
    }

    /// Reads `len` bytes of configuration space of `bdf`. Absent functions
    /// read as all ones.
    pub fn config_space_read(&self, bdf: PciBdf, offset: usize, len: usize) -> u32 {
        self.devices.get(&bdf).map_or(0xffff_ffff, |d| {
            d.lock().unwrap().read_config_register(offset, len)
        })
    }

    /// Writes `len` bytes of configuration space of `bdf`. Writes to absent
    /// functions are dropped.
    pub fn config_space_write(
        &self,
        bdf: PciBdf,
        offset: usize,
        len: usize,
        value: u32,
    ) -> Result<()> {
        if let Some(d) = self.devices.get(&bdf) {
            d.lock()
                .unwrap()
                .write_config_register(offset, len, value)
                .map_err(|e| PciRootError::ConfigWrite(bdf, e))?;
        }
        Ok(())
    }

    /// Port read relative to 0xcf8.
    pub fn read(&mut self, offset: u64, data: &mut [u8]) {
        let value = match offset {
            0..=3 => {
                let shift = offset as usize * 8;
                if offset as usize + data.len() > 4 {
                    0xffff_ffff
                } else {
                    self.config_address >> shift
                }
            }
            4..=7 => self.config_data_read(offset as usize - 4, data.len()),
            _ => 0xffff_ffff,
        };

        for (i, d) in data.iter_mut().enumerate() {
            *d = if i < 4 { (value >> (i * 8)) as u8 } else { 0xff };
        }
    }

    /// Port write relative to 0xcf8.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        match offset {
            o @ 0..=3 => {
                self.set_config_address(o, data);
                Ok(())
            }
            o @ 4..=7 => self.config_data_write(o as usize - 4, data),
            _ => Ok(()),
        }
    }

    fn config_data_read(&self, offset: usize, len: usize) -> u32 {
        match self.selected_function() {
            Some((bdf, register)) if offset + len <= 4 => {
                self.config_space_read(bdf, register * 4 + offset, len)
            }
            _ => 0xffff_ffff,
        }
    }

    fn config_data_write(&self, offset: usize, data: &[u8]) -> Result<()> {
        if offset + data.len() > 4 {
            return Ok(());
        }
        let Some((bdf, register)) = self.selected_function() else {
            return Ok(());
        };
        let value = match data.len() {
            1 => u32::from(data[0]),
            2 => u32::from(LittleEndian::read_u16(data)),
            4 => LittleEndian::read_u32(data),
            _ => return Ok(()),
        };
        self.config_space_write(bdf, register * 4 + offset, data.len(), value)
    }

    fn selected_function(&self) -> Option<(PciBdf, usize)> {
        if self.config_address & CONFIG_ADDRESS_ENABLE == 0 {
            return None;
        }
        let (bus, device, function, register) =
            parse_config_address(self.config_address & !CONFIG_ADDRESS_ENABLE);
        Some((PciBdf::new(bus, device, function), register))
    }

    fn set_config_address(&mut self, offset: u64, data: &[u8]) {
        if offset as usize + data.len() > 4 {
            return;
        }
        let (mask, value): (u32, u32) = match data.len() {
            1 => (
                0x0000_00ff << (offset * 8),
                u32::from(data[0]) << (offset * 8),
            ),
            2 => (
                0x0000_ffff << (offset * 8),
                u32::from(LittleEndian::read_u16(data)) << (offset * 8),
            ),
            4 => (0xffff_ffff, LittleEndian::read_u32(data)),
            _ => return,
        };
        self.config_address = (self.config_address & !mask) | value;
    }
}

// Parse the CONFIG_ADDRESS register to a (bus, device, function, register) tuple.
fn parse_config_address(config_address: u32) -> (u8, u8, u8, usize) {
    const BUS_NUMBER_OFFSET: usize = 16;
    const BUS_NUMBER_MASK: u32 = 0x00ff;
    const DEVICE_NUMBER_OFFSET: usize = 11;
    const DEVICE_NUMBER_MASK: u32 = 0x1f;
    const FUNCTION_NUMBER_OFFSET: usize = 8;
    const FUNCTION_NUMBER_MASK: u32 = 0x07;
    const REGISTER_NUMBER_OFFSET: usize = 2;
    const REGISTER_NUMBER_MASK: u32 = 0x3f;

    let bus_number = ((config_address >> BUS_NUMBER_OFFSET) & BUS_NUMBER_MASK) as u8;
    let device_number = ((config_address >> DEVICE_NUMBER_OFFSET) & DEVICE_NUMBER_MASK) as u8;
    let function_number = ((config_address >> FUNCTION_NUMBER_OFFSET) & FUNCTION_NUMBER_MASK) as u8;
    let register_number =
        ((config_address >> REGISTER_NUMBER_OFFSET) & REGISTER_NUMBER_MASK) as usize;

    (bus_number, device_number, function_number, register_number)
}
