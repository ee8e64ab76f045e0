// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.

//! Emulates the shared memory devices exposed to partitions.

#[macro_use]
extern crate log;

pub mod shm_region;
pub mod stshmem;
pub mod synctime;

pub use self::shm_region::{HostRange, ShmRegion, ShmRegionConfig, ShmRegionRegistry};
pub use self::stshmem::{
    StshmemDevice, StshmemDeviceState, StshmemError, StshmemOwner, StshmemPool, STSHMEM_DEV_NUM,
    STSHMEM_SHM_BAR,
};
pub use self::synctime::{
    publish_global_time, read_global_time, SyncTimeError, SyncTimePage, TimeRole,
    SYNCTIME_SHM_SIZE,
};
