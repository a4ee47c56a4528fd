// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! Host-side control plane connecting a virtio device to an in-kernel
//! data-path accelerator: mirrors the guest's memory regions, virtqueue
//! addresses, and dirty-page log into the accelerator, and keeps all
//! three in sync as the guest runs and migrates.
//!
//! [`reconciler::Reconciler`] is the entry point; everything else is a
//! leaf component it drives or a collaborator contract in
//! [`collaborators`] that the embedding VMM implements.

pub mod collaborators;
pub mod config;
pub mod control;
pub mod dirty_sync;
pub mod error;
pub mod log_buffer;
pub mod reconciler;
pub mod region_table;
pub mod virtqueue_binder;

pub use collaborators::{DirtyLogSink, GuestMemoryMapper, MrRef, NotifierBinding, Section, VirtqueueSource};
pub use config::ReconcilerConfig;
pub use control::{ControlChannel, FeatureFlags, MemTableRegion, VringAddr, VringAddrFlags};
pub use error::{Error, Result};
pub use log_buffer::LogBuffer;
pub use reconciler::Reconciler;
pub use region_table::{Region, RegionTable};
pub use virtqueue_binder::VirtqueueBinder;

#[cfg(target_os = "linux")]
pub use control::KernelControlChannel;
