// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.

use std::any::Any;
use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Moving a BAR to the address programmed by the guest failed.
    #[error("Failed to move BAR {0} from {1:#x} to {2:#x}")]
    MoveBar(usize, u64, u64, #[source] io::Error),
    /// Releasing the device resources failed.
    #[error("Failed to release device resources")]
    Deinit(#[source] io::Error),
}
pub type Result<T> = std::result::Result<T, Error>;

/// Configuration space entry points of a virtual PCI function.
///
/// Accesses are dispatched one at a time per device by the bus, which keeps
/// every device behind its own lock.
pub trait PciDevice: Send {
    /// Reads `len` bytes (1, 2 or 4) of configuration space at `offset`.
    fn read_config_register(&mut self, offset: usize, len: usize) -> u32;

    /// Writes `len` bytes (1, 2 or 4) of configuration space at `offset`.
    /// Writes to BAR registers may move guest mappings, which can fail.
    fn write_config_register(&mut self, offset: usize, len: usize, value: u32) -> Result<()>;

    /// Releases every resource held on behalf of the guest. Called once the
    /// device is removed from the bus; calling it again must be harmless.
    fn deinit(&mut self) -> Result<()> {
        Ok(())
    }

    /// Provides a mutable reference to the Any trait. This is useful to let
    /// the caller have access to the underlying type behind the trait.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Optionally returns a unique identifier.
    fn id(&self) -> Option<String> {
        None
    }
}
