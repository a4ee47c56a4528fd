// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! Contracts for everything the reconciler treats as external: the virtio
//! queue objects, the guest-physical mapper, the notifier wiring, and the
//! dirty-log sink the VMM's memory subsystem presents to us.
//!
//! None of these are owned by this crate. Production wiring lives with the
//! VMM; tests exercise the reconciler entirely against `Fake*` stand-ins.

use std::os::unix::io::RawFd;

use crate::error::Result;

/// One observed memory-region event's worth of context, as handed to us by
/// the VMM's memory subsystem. `mr_ref` is opaque: we never interpret it,
/// only compare it for equality when matching a later event to the Section
/// that first introduced a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    pub address_space_id: u64,
    pub mr_ref: MrRef,
    pub gpa: u64,
    pub size: u64,
    pub offset_within_region: u64,
    pub log_enabled: bool,
    /// `true` iff the underlying memory region is RAM. Non-RAM sections
    /// (MMIO, ROM aliases) are reported by the memory-event collaborator
    /// like any other, but the reconciler ignores them: the accelerator's
    /// region table only ever needs to mirror RAM.
    pub is_ram: bool,
}

impl Section {
    pub fn gpa_last(&self) -> u64 {
        self.gpa + self.size - 1
    }
}

/// Opaque identity of a memory region, as seen from the VMM side. Two
/// sections with the same `mr_ref` back the same underlying memory object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MrRef(pub u64);

/// Per-virtqueue state and addressing, supplied by the virtio device's
/// queue object. Indices match the device's `vqs` array position.
pub trait VirtqueueSource {
    fn num(&self, idx: usize) -> u16;
    fn last_avail_idx(&self, idx: usize) -> u16;
    fn set_last_avail_idx(&mut self, idx: usize, value: u16);

    fn desc_addr(&self, idx: usize) -> (u64, u64);
    fn avail_addr(&self, idx: usize) -> (u64, u64);
    fn used_addr(&self, idx: usize) -> (u64, u64);
    fn ring_addr(&self, idx: usize) -> (u64, u64);

    fn host_notifier_fd(&self, idx: usize) -> Option<RawFd>;
    fn guest_notifier_fd(&self, idx: usize) -> Option<RawFd>;
}

/// Notifier wiring: enabling host-side ioeventfds and guest-side irqfds for
/// the accelerator to use directly, bypassing the VMM's own dispatch.
pub trait NotifierBinding {
    fn set_host_notifier(&mut self, idx: usize, enable: bool) -> Result<()>;
    fn set_guest_notifiers(&mut self, enable: bool) -> Result<()>;
    fn query_guest_notifiers(&self) -> bool;
}

/// Resolves guest-physical ranges to host-virtual pointers backing guest
/// RAM, for ring areas and for satisfying `RegionTable` entries.
pub trait GuestMemoryMapper {
    /// Maps `gpa..gpa+requested_size`. Returns the host-virtual base and
    /// the length actually mapped, which callers must check against
    /// `requested_size`: anything shorter is a failure.
    fn map(&self, gpa: u64, requested_size: u64, writable: bool) -> Result<(u64, u64)>;

    fn unmap(&self, hva: u64, length: u64, was_written: bool, dirty_length: u64);
}

/// Where harvested dirty pages are reported during migration.
pub trait DirtyLogSink {
    /// `offset` is relative to the section that produced this report;
    /// `size` is always `PAGE`.
    fn mark_dirty(&mut self, section: Section, offset: u64, size: u64);
}

#[cfg(any(test, feature = "test-util"))]
pub mod fakes {
    use super::*;
    use std::collections::HashMap;

    #[derive(Debug, Default, Clone)]
    pub struct FakeVirtqueue {
        pub num: u16,
        pub last_avail_idx: u16,
        pub desc: (u64, u64),
        pub avail: (u64, u64),
        pub used: (u64, u64),
        pub ring: (u64, u64),
        pub host_notifier: Option<RawFd>,
        pub guest_notifier: Option<RawFd>,
    }

    #[derive(Debug, Default)]
    pub struct FakeVirtqueueSource {
        pub vqs: Vec<FakeVirtqueue>,
    }

    impl VirtqueueSource for FakeVirtqueueSource {
        fn num(&self, idx: usize) -> u16 {
            self.vqs[idx].num
        }
        fn last_avail_idx(&self, idx: usize) -> u16 {
            self.vqs[idx].last_avail_idx
        }
        fn set_last_avail_idx(&mut self, idx: usize, value: u16) {
            self.vqs[idx].last_avail_idx = value;
        }
        fn desc_addr(&self, idx: usize) -> (u64, u64) {
            self.vqs[idx].desc
        }
        fn avail_addr(&self, idx: usize) -> (u64, u64) {
            self.vqs[idx].avail
        }
        fn used_addr(&self, idx: usize) -> (u64, u64) {
            self.vqs[idx].used
        }
        fn ring_addr(&self, idx: usize) -> (u64, u64) {
            self.vqs[idx].ring
        }
        fn host_notifier_fd(&self, idx: usize) -> Option<RawFd> {
            self.vqs[idx].host_notifier
        }
        fn guest_notifier_fd(&self, idx: usize) -> Option<RawFd> {
            self.vqs[idx].guest_notifier
        }
    }

    #[derive(Debug, Default)]
    pub struct FakeNotifierBinding {
        pub host_enabled: HashMap<usize, bool>,
        pub guest_enabled: bool,
        pub fail_host: bool,
        pub fail_guest: bool,
    }

    impl NotifierBinding for FakeNotifierBinding {
        fn set_host_notifier(&mut self, idx: usize, enable: bool) -> Result<()> {
            if self.fail_host {
                return Err(crate::error::Error::Unsupported("host notifier"));
            }
            self.host_enabled.insert(idx, enable);
            Ok(())
        }
        fn set_guest_notifiers(&mut self, enable: bool) -> Result<()> {
            if self.fail_guest {
                return Err(crate::error::Error::Unsupported("guest notifiers"));
            }
            self.guest_enabled = enable;
            Ok(())
        }
        fn query_guest_notifiers(&self) -> bool {
            self.guest_enabled
        }
    }

    /// A mapper backed by a flat byte vector acting as "host memory";
    /// `gpa` is used directly as an offset into it, so tests can pick
    /// small, readable addresses.
    #[derive(Debug)]
    pub struct FakeMapper {
        pub base_hva: u64,
        pub short_map: Option<u64>,
    }

    impl Default for FakeMapper {
        fn default() -> Self {
            FakeMapper {
                base_hva: 0x7000_0000,
                short_map: None,
            }
        }
    }

    impl GuestMemoryMapper for FakeMapper {
        fn map(&self, gpa: u64, requested_size: u64, _writable: bool) -> Result<(u64, u64)> {
            let size = self.short_map.unwrap_or(requested_size);
            Ok((self.base_hva + gpa, size))
        }
        fn unmap(&self, _hva: u64, _length: u64, _was_written: bool, _dirty_length: u64) {}
    }

    #[derive(Debug, Default)]
    pub struct FakeDirtySink {
        pub reports: Vec<(Section, u64, u64)>,
    }

    impl DirtyLogSink for FakeDirtySink {
        fn mark_dirty(&mut self, section: Section, offset: u64, size: u64) {
            self.reports.push((section, offset, size));
        }
    }
}
