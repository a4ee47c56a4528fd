// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! Binds virtqueue ring areas into host-virtual memory and pushes their
//! addresses to the accelerator, mirroring `vhost_virtqueue_init` /
//! `vhost_virtqueue_cleanup` / `vhost_verify_ring_mappings` from the
//! source this crate's control plane descends from.

use tracing::{debug, trace, warn};

use crate::collaborators::{GuestMemoryMapper, VirtqueueSource};
use crate::control::{ControlChannel, VringAddr, VringAddrFlags};
use crate::error::{Error, Result};

/// Host-virtual mapping state for one bound virtqueue. `None` once
/// `cleanup` has run.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoundRing {
    pub desc_hva: u64,
    pub avail_hva: u64,
    pub used_hva: u64,
    pub ring_hva: u64,
    pub used_gpa: u64,
    pub ring_gpa: u64,
    pub ring_size: u64,
}

/// Per-virtqueue binder state, indexed the same as the device's `vqs`.
#[derive(Debug, Default)]
pub struct VirtqueueBinder {
    bound: Vec<Option<BoundRing>>,
}

impl VirtqueueBinder {
    pub fn new(nvqs: usize) -> Self {
        VirtqueueBinder {
            bound: vec![None; nvqs],
        }
    }

    pub fn is_bound(&self, idx: usize) -> bool {
        self.bound[idx].is_some()
    }

    /// Binds virtqueue `idx`: pushes its count and initial index, maps its
    /// four ring areas, pushes the resulting addresses, then wires the
    /// notifier descriptors. Any mapping failure unwinds already-mapped
    /// areas for this queue in reverse order before returning.
    pub fn init(
        &mut self,
        idx: usize,
        vqs: &impl VirtqueueSource,
        mapper: &impl GuestMemoryMapper,
        control: &mut impl ControlChannel,
        log_enabled: bool,
    ) -> Result<()> {
        control.set_vring_num(idx, vqs.num(idx))?;
        control.set_vring_base(idx, vqs.last_avail_idx(idx))?;

        let (desc_gpa, desc_size) = vqs.desc_addr(idx);
        let (avail_gpa, avail_size) = vqs.avail_addr(idx);
        let (used_gpa, used_size) = vqs.used_addr(idx);
        let (ring_gpa, ring_size) = vqs.ring_addr(idx);

        let mut mapped: Vec<(u64, u64)> = Vec::with_capacity(4);
        let result = (|| -> Result<BoundRing> {
            let desc_hva = map_exact(mapper, desc_gpa, desc_size, &mut mapped)?;
            let avail_hva = map_exact(mapper, avail_gpa, avail_size, &mut mapped)?;
            let used_hva = map_exact(mapper, used_gpa, used_size, &mut mapped)?;
            let ring_hva = map_exact(mapper, ring_gpa, ring_size, &mut mapped)?;
            Ok(BoundRing {
                desc_hva,
                avail_hva,
                used_hva,
                ring_hva,
                used_gpa,
                ring_gpa,
                ring_size,
            })
        })();

        let bound = match result {
            Ok(b) => b,
            Err(e) => {
                for (hva, len) in mapped.into_iter().rev() {
                    mapper.unmap(hva, len, false, 0);
                }
                return Err(e);
            }
        };

        let flags = if log_enabled {
            VringAddrFlags::LOG_ENABLED
        } else {
            VringAddrFlags::empty()
        };
        control.set_vring_addr(
            idx,
            VringAddr {
                desc: bound.desc_hva,
                avail: bound.avail_hva,
                used: bound.used_hva,
                log_guest_addr: bound.used_gpa,
                flags,
            },
        )?;

        if let Some(fd) = vqs.host_notifier_fd(idx) {
            control.set_vring_kick(idx, fd)?;
        }
        if let Some(fd) = vqs.guest_notifier_fd(idx) {
            control.set_vring_call(idx, fd)?;
        }

        trace!(idx, "virtqueue bound");
        self.bound[idx] = Some(bound);
        Ok(())
    }

    /// Reads back the accelerator's final available index and unmaps all
    /// four ring areas, marking the used ring and ring area dirty since
    /// the accelerator wrote them.
    pub fn cleanup(
        &mut self,
        idx: usize,
        vqs: &mut impl VirtqueueSource,
        mapper: &impl GuestMemoryMapper,
        control: &mut impl ControlChannel,
    ) -> Result<()> {
        let bound = match self.bound[idx].take() {
            Some(b) => b,
            None => return Ok(()),
        };

        let last_avail = control.get_vring_base(idx)?;
        vqs.set_last_avail_idx(idx, last_avail);

        let (desc_gpa, desc_size) = vqs.desc_addr(idx);
        let (avail_gpa, avail_size) = vqs.avail_addr(idx);
        let _ = (desc_gpa, avail_gpa);

        mapper.unmap(bound.desc_hva, desc_size, false, 0);
        mapper.unmap(bound.avail_hva, avail_size, false, 0);
        let (_, used_size) = vqs.used_addr(idx);
        mapper.unmap(bound.used_hva, used_size, true, used_size);
        mapper.unmap(bound.ring_hva, bound.ring_size, true, bound.ring_size);

        debug!(idx, "virtqueue unbound");
        Ok(())
    }

    /// Re-maps the ring area of any bound virtqueue overlapping
    /// `[gpa, gpa+size)` and checks the host-virtual pointer is unchanged.
    /// A changed pointer is `Busy`: the accelerator is actively using the
    /// old pointer and cannot be made consistent without a restart.
    pub fn verify_ring_mappings(
        &self,
        gpa: u64,
        size: u64,
        mapper: &impl GuestMemoryMapper,
    ) -> Result<()> {
        let last = gpa + size - 1;
        for bound in self.bound.iter().flatten() {
            let ring_last = bound.ring_gpa + bound.ring_size - 1;
            if bound.ring_gpa > last || gpa > ring_last {
                continue;
            }
            let (new_hva, new_size) = mapper.map(bound.ring_gpa, bound.ring_size, true)?;
            if new_size != bound.ring_size {
                mapper.unmap(new_hva, new_size, false, 0);
                return Err(Error::OutOfMemory);
            }
            mapper.unmap(new_hva, new_size, false, 0);
            if new_hva != bound.ring_hva {
                warn!(ring_gpa = bound.ring_gpa, "virtqueue ring relocated under RT mutation");
                return Err(Error::Busy);
            }
        }
        Ok(())
    }

    /// Re-pushes addresses alone, for bulk log-flag toggles.
    pub fn set_addr(
        &self,
        idx: usize,
        control: &mut impl ControlChannel,
        log_enabled: bool,
    ) -> Result<()> {
        let bound = self.bound[idx].expect("set_addr on an unbound virtqueue");
        let flags = if log_enabled {
            VringAddrFlags::LOG_ENABLED
        } else {
            VringAddrFlags::empty()
        };
        control.set_vring_addr(
            idx,
            VringAddr {
                desc: bound.desc_hva,
                avail: bound.avail_hva,
                used: bound.used_hva,
                log_guest_addr: bound.used_gpa,
                flags,
            },
        )
    }
}

fn map_exact(
    mapper: &impl GuestMemoryMapper,
    gpa: u64,
    size: u64,
    mapped: &mut Vec<(u64, u64)>,
) -> Result<u64> {
    let (hva, got) = mapper.map(gpa, size, true)?;
    if got != size {
        mapper.unmap(hva, got, false, 0);
        return Err(Error::OutOfMemory);
    }
    mapped.push((hva, size));
    Ok(hva)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::{FakeMapper, FakeVirtqueue, FakeVirtqueueSource};
    use crate::control::fakes::{Call, FakeControlChannel};

    fn source_with_one_queue() -> FakeVirtqueueSource {
        FakeVirtqueueSource {
            vqs: vec![FakeVirtqueue {
                num: 256,
                last_avail_idx: 0,
                desc: (0x1000, 0x40),
                avail: (0x2000, 0x20),
                used: (0x3000, 0x30),
                ring: (0x1000, 0x2030),
                host_notifier: Some(10),
                guest_notifier: Some(11),
            }],
        }
    }

    #[test]
    fn init_pushes_num_base_addr_then_notifiers() {
        let vqs = source_with_one_queue();
        let mapper = FakeMapper::default();
        let mut control = FakeControlChannel::default();
        let mut vb = VirtqueueBinder::new(1);

        vb.init(0, &vqs, &mapper, &mut control, false).unwrap();

        assert!(matches!(control.trace[0], Call::SetVringNum(0, 256)));
        assert!(matches!(control.trace[1], Call::SetVringBase(0, 0)));
        assert!(matches!(control.trace[2], Call::SetVringAddr(0, _)));
        assert!(matches!(control.trace[3], Call::SetVringKick(0, 10)));
        assert!(matches!(control.trace[4], Call::SetVringCall(0, 11)));
        assert!(vb.is_bound(0));
    }

    #[test]
    fn short_mapping_fails_with_out_of_memory_and_unwinds() {
        let vqs = source_with_one_queue();
        let mapper = FakeMapper {
            short_map: Some(4),
            ..Default::default()
        };
        let mut control = FakeControlChannel::default();
        let mut vb = VirtqueueBinder::new(1);

        let err = vb.init(0, &vqs, &mapper, &mut control, false).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory));
        assert!(!vb.is_bound(0));
    }

    #[test]
    fn verify_ring_mappings_detects_relocation() {
        let vqs = source_with_one_queue();
        let mut mapper = FakeMapper::default();
        let mut control = FakeControlChannel::default();
        let mut vb = VirtqueueBinder::new(1);
        vb.init(0, &vqs, &mapper, &mut control, false).unwrap();

        mapper.base_hva += 0x1000; // simulate the ring moving on re-map
        let err = vb.verify_ring_mappings(0x1000, 0x2030, &mapper).unwrap_err();
        assert!(matches!(err, Error::Busy));
    }

    #[test]
    fn verify_ring_mappings_ignores_unrelated_ranges() {
        let vqs = source_with_one_queue();
        let mapper = FakeMapper::default();
        let mut control = FakeControlChannel::default();
        let mut vb = VirtqueueBinder::new(1);
        vb.init(0, &vqs, &mapper, &mut control, false).unwrap();

        vb.verify_ring_mappings(0x90000, 0x1000, &mapper).unwrap();
    }
}
