// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//

//! A generic abstraction around hypervisor functionality
//!
//! This crate offers a trait abstraction for the second-level address
//! translation of a partition, together with an in-process implementation
//! backed by host memory.
//!

#[macro_use]
extern crate log;

/// Second-level translation tables
pub mod slat;

/// Vm related module
pub mod vm;

pub use slat::{HostMemory, Mapping, SecondLevelTable, PAGE_SIZE};
pub use vm::{HypervisorVmError, MappingFlags, Vm};
