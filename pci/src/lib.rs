// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.

//! Implements the virtual PCI configuration space and bus plumbing used by
//! emulated devices.
#[macro_use]
extern crate log;

mod bus;
mod configuration;
mod device;

pub use self::bus::{PciBdf, PciBus, PciRootError};
pub use self::configuration::{
    bar_index, bar_offset, is_bar_access, is_header_access, BarReprogrammingParams, PciBar,
    PciBarType, PciClassCode, PciConfiguration, PciHeaderType, PciProgrammingInterface,
    PciSubclass, NUM_BAR_REGS, PCI_BAR0_OFFSET, PCI_CLASS_CODE_OFFSET, PCI_COMMAND_OFFSET,
    PCI_CONFIG_HEADER_SIZE, PCI_DEVICE_ID_OFFSET, PCI_REVISION_ID_OFFSET, PCI_VENDOR_ID_OFFSET,
};
pub use self::configuration::Error as PciConfigurationError;
pub use self::device::Error as PciDeviceError;
pub use self::device::PciDevice;
