// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! The top-level state machine: consumes memory and log-sync events from
//! the VMM, mutates the region table and log buffer, and re-pushes both
//! (plus virtqueue addresses) to the accelerator through the control
//! channel. Every public entry point here is the single-threaded
//! equivalent of one `vhost_dev` callback in the source this crate's
//! control plane descends from.

use tracing::{debug, error, trace};

use crate::collaborators::{DirtyLogSink, GuestMemoryMapper, NotifierBinding, Section, VirtqueueSource};
use crate::config::{ReconcilerConfig, WORD_BITS};
use crate::control::{ControlChannel, FeatureFlags, MemTableRegion};
use crate::dirty_sync;
use crate::error::Result;
use crate::log_buffer::LogBuffer;
use crate::region_table::RegionTable;
use crate::virtqueue_binder::VirtqueueBinder;

fn ranges_overlap(a_start: u64, a_size: u64, b_start: u64, b_size: u64) -> bool {
    let a_last = a_start + a_size - 1;
    let b_last = b_start + b_size - 1;
    a_start <= b_last && b_start <= a_last
}

/// Owns every piece of state the accelerator needs mirrored, plus the
/// collaborators needed to resolve and push it. Generic over the five
/// external contracts in [`crate::collaborators`] and [`crate::control`]
/// so production code wires in concrete kernel/VMM types while tests use
/// the `fakes` modules.
pub struct Reconciler<C, Q, M, N, S> {
    cfg: ReconcilerConfig,
    control: C,
    vqs: Q,
    mapper: M,
    notifiers: N,
    sink: S,
    nvqs: usize,

    rt: RegionTable,
    vb: VirtqueueBinder,
    lb: Option<LogBuffer>,
    sections: Vec<Section>,

    features: u64,
    acked_features: u64,
    log_enabled: bool,
    started: bool,
}

impl<C, Q, M, N, S> Reconciler<C, Q, M, N, S>
where
    C: ControlChannel,
    Q: VirtqueueSource,
    M: GuestMemoryMapper,
    N: NotifierBinding,
    S: DirtyLogSink,
{
    /// Opens the device: claims ownership of the control channel and
    /// queries its feature bitmask. The device starts idle
    /// (`started() == false`); call [`Reconciler::start`] to bind
    /// virtqueues and begin mirroring state.
    pub fn new(
        cfg: ReconcilerConfig,
        mut control: C,
        vqs: Q,
        mapper: M,
        notifiers: N,
        sink: S,
        nvqs: usize,
    ) -> Result<Self> {
        control.set_owner()?;
        let features = control.get_features()?;
        Ok(Reconciler {
            cfg,
            control,
            vqs,
            mapper,
            notifiers,
            sink,
            nvqs,
            rt: RegionTable::new(),
            vb: VirtqueueBinder::new(nvqs),
            lb: None,
            sections: Vec::new(),
            features,
            acked_features: 0,
            log_enabled: false,
            started: false,
        })
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn log_enabled(&self) -> bool {
        self.log_enabled
    }

    pub fn region_table(&self) -> &RegionTable {
        &self.rt
    }

    /// Records the feature bits the guest actually acknowledged. Forwarded
    /// as-is; this crate negotiates nothing beyond the log-all bit it
    /// manages internally.
    pub fn ack_features(&mut self, acked: u64) {
        self.acked_features = acked;
    }

    fn total_log_chunks(&self) -> u64 {
        let used_ranges = (0..self.nvqs).map(|i| self.vqs.used_addr(i));
        self.rt.total_log_chunks(self.cfg.chunk_bytes, used_ranges)
    }

    fn push_rt(&mut self) -> Result<()> {
        let regions: Vec<MemTableRegion> = self
            .rt
            .iter()
            .map(|r| MemTableRegion {
                gpa: r.gpa,
                size: r.size,
                hva: r.hva,
            })
            .collect();
        self.control.set_mem_table(&regions)
    }

    fn features_with_log(&self, log: bool) -> u64 {
        let mut flags = FeatureFlags::from_bits_truncate(self.features);
        flags.set(FeatureFlags::F_LOG_ALL, log);
        flags.bits()
    }

    /// Tracks (or stops tracking) the `Section` behind one observed
    /// memory event, independent of whether the region table itself
    /// changed. This is the bookkeeping `lb_resize` replays against when
    /// the log buffer moves.
    fn track_section(&mut self, section: Section, present: bool) {
        self.sections
            .retain(|s| !(s.mr_ref == section.mr_ref && ranges_overlap(s.gpa, s.size, section.gpa, section.size)));
        if present {
            self.sections.push(section);
        }
    }

    /// Allocates a log buffer of exactly `chunks` words (`None` for zero),
    /// tells the accelerator the new base, harvests every tracked
    /// section's dirty bits from the *old* buffer's full range, then
    /// drops it. Growing and shrinking both funnel through here so the
    /// harvest-before-free guarantee is never accidentally skipped.
    fn resize_lb(&mut self, chunks: u64) -> Result<()> {
        let new_lb = if chunks == 0 {
            None
        } else {
            Some(LogBuffer::new(chunks * WORD_BITS))
        };
        let base = new_lb.as_ref().map_or(0, |lb: &LogBuffer| lb.as_ptr() as u64);
        self.control.set_log_base(base)?;

        if let Some(old_lb) = self.lb.take() {
            let old_range = (0, old_lb.words() * self.cfg.chunk_bytes - 1);
            let sections = self.sections.clone();
            for section in sections {
                dirty_sync::sync(
                    section,
                    old_range,
                    &self.rt,
                    Some(&old_lb),
                    &self.cfg,
                    (0..self.nvqs).map(|i| self.vqs.used_addr(i)),
                    &mut self.sink,
                );
            }
        }

        self.lb = new_lb;
        Ok(())
    }

    /// Handles one `region_add` / `region_del` memory-listener callback.
    /// `hva` is the host-virtual address the VMM's memory subsystem
    /// already resolved for this section (ordinary RAM regions are
    /// addressable without going through [`GuestMemoryMapper`]; that trait
    /// exists for virtqueue ring areas, which must be mapped explicitly).
    pub fn on_region_event(&mut self, section: Section, hva: u64, add: bool) -> Result<()> {
        // Only the system address space's RAM sections are mirrored into
        // the accelerator; anything else (MMIO, a device's private I/O
        // address space) is none of its business.
        if !section.is_ram || section.address_space_id != self.cfg.system_address_space_id {
            trace!(
                gpa = section.gpa,
                is_ram = section.is_ram,
                address_space_id = section.address_space_id,
                "ignoring non-RAM or non-system-address-space section"
            );
            return Ok(());
        }

        // The source appends to `mem_sections` unconditionally on
        // `region_add`, before the log-enabled force-`add=false` rule
        // below ever applies to the region table mutation. Track sections
        // by the event kind as received, not by whether the region table
        // itself ends up changed, so a log-enabled RAM section is still
        // covered by the old-log-range resync in `resize_lb`/`stop`.
        self.track_section(section, add);

        // A region with logging already enabled is handled specially by
        // the VMM and must never appear in the accelerator's own table.
        let add = if section.log_enabled { false } else { add };
        let (gpa, size) = (section.gpa, section.size);

        if add {
            if !self.rt.compare(gpa, size, hva) {
                trace!(gpa, size, hva, "region already matches, skipping");
                return Ok(());
            }
        } else if self.rt.find_overlapping(gpa, size).is_none() {
            trace!(gpa, size, "no overlap to remove");
            return Ok(());
        }

        // The source calls `unassign` unconditionally, then on the
        // removal path calls it again in an `else` branch before
        // returning. The second call is a no-op given the first already
        // cleared the range; we preserve the single observable
        // `unassign` rather than inventing a second effect for it.
        self.rt.unassign(gpa, size);
        if add {
            self.rt.assign(gpa, size, hva);
        }

        if !self.started {
            return Ok(());
        }

        if let Err(e) = self.vb.verify_ring_mappings(gpa, size, &self.mapper) {
            error!(gpa, size, error = %e, "virtqueue ring relocated under region mutation");
            panic!("virtqueue ring relocated under a running device: {e}");
        }

        if !self.log_enabled {
            self.push_rt()?;
            return Ok(());
        }

        let need = self.total_log_chunks();
        let cur_words = self.lb.as_ref().map_or(0, LogBuffer::words);
        if need > cur_words {
            self.resize_lb(need + self.cfg.slack_words)?;
        }
        self.push_rt()?;
        let cur_words = self.lb.as_ref().map_or(0, LogBuffer::words);
        if cur_words > need + self.cfg.slack_words {
            self.resize_lb(need)?;
        }
        Ok(())
    }

    /// Handles a `log_sync` callback for one section: harvests dirty bits
    /// over that section's own range. A no-op (via [`dirty_sync::sync`])
    /// when the device is stopped or logging is disabled.
    pub fn on_log_sync(&mut self, section: Section) {
        let range = (section.gpa, section.gpa_last());
        dirty_sync::sync(
            section,
            range,
            &self.rt,
            self.lb.as_ref(),
            &self.cfg,
            (0..self.nvqs).map(|i| self.vqs.used_addr(i)),
            &mut self.sink,
        );
    }

    /// Handles `log_global_start` / `log_global_stop`: toggles migration
    /// logging. A no-op if the requested state already holds. If the
    /// device isn't running, only the flag is recorded — [`Reconciler::start`]
    /// picks it up. Otherwise resizes the log buffer, pushes the feature
    /// bit, and re-pushes every virtqueue's address with the log flag
    /// flipped, unwinding on a mid-sequence failure.
    pub fn on_migration_log(&mut self, enable: bool) -> Result<()> {
        if enable == self.log_enabled {
            return Ok(());
        }
        if !self.started {
            self.log_enabled = enable;
            return Ok(());
        }

        if enable {
            let need = self.total_log_chunks();
            self.resize_lb(need)?;
            self.control.set_features(self.features_with_log(true))?;
            self.repush_vring_addrs(true)?;
        } else {
            self.control.set_features(self.features_with_log(false))?;
            self.repush_vring_addrs(false)?;
            self.resize_lb(0)?;
        }

        self.log_enabled = enable;
        debug!(log_enabled = enable, "migration log toggled");
        Ok(())
    }

    /// Re-pushes every virtqueue's addresses with `log` set. On a
    /// per-queue failure, re-pushes the queues already converted back to
    /// `!log` and restores the feature bitmask, both asserted to succeed:
    /// a failure during unwind is a program bug, not a recoverable error.
    fn repush_vring_addrs(&mut self, log: bool) -> Result<()> {
        let mut done = Vec::with_capacity(self.nvqs);
        for i in 0..self.nvqs {
            if let Err(e) = self.vb.set_addr(i, &mut self.control, log) {
                for &j in done.iter().rev() {
                    self.vb
                        .set_addr(j, &mut self.control, !log)
                        .expect("unwind set_addr must succeed");
                }
                self.control
                    .set_features(self.features_with_log(!log))
                    .expect("unwind set_features must succeed");
                return Err(e);
            }
            done.push(i);
        }
        Ok(())
    }

    /// Activates guest notifiers, pushes features and the region table,
    /// binds every virtqueue in index order, and — if logging is enabled
    /// — allocates the log buffer at its current required size and pushes
    /// its base. Unwinds in reverse on any failure.
    ///
    /// Preconditions: the caller has already enabled host notifiers
    /// (ioeventfds); this crate only drives the guest-notifier side.
    pub fn start(&mut self) -> Result<()> {
        self.notifiers.set_guest_notifiers(true)?;

        if let Err(e) = self.control.set_features(self.features_with_log(self.log_enabled)) {
            self.notifiers
                .set_guest_notifiers(false)
                .expect("unwind set_guest_notifiers must succeed");
            return Err(e);
        }

        if let Err(e) = self.push_rt() {
            self.notifiers
                .set_guest_notifiers(false)
                .expect("unwind set_guest_notifiers must succeed");
            return Err(e);
        }

        let mut bound = Vec::with_capacity(self.nvqs);
        for i in 0..self.nvqs {
            if let Err(e) = self.vb.init(i, &self.vqs, &self.mapper, &mut self.control, self.log_enabled) {
                for &j in bound.iter().rev() {
                    self.vb
                        .cleanup(j, &mut self.vqs, &self.mapper, &mut self.control)
                        .expect("unwind cleanup must succeed");
                }
                self.notifiers
                    .set_guest_notifiers(false)
                    .expect("unwind set_guest_notifiers must succeed");
                return Err(e);
            }
            bound.push(i);
        }

        if self.log_enabled {
            let need = self.total_log_chunks();
            let lb = if need == 0 { None } else { Some(LogBuffer::new(need * WORD_BITS)) };
            let base = lb.as_ref().map_or(0, |lb: &LogBuffer| lb.as_ptr() as u64);
            if let Err(e) = self.control.set_log_base(base) {
                for &j in bound.iter().rev() {
                    self.vb
                        .cleanup(j, &mut self.vqs, &self.mapper, &mut self.control)
                        .expect("unwind cleanup must succeed");
                }
                self.notifiers
                    .set_guest_notifiers(false)
                    .expect("unwind set_guest_notifiers must succeed");
                return Err(e);
            }
            self.lb = lb;
        }

        self.started = true;
        debug!(nvqs = self.nvqs, log_enabled = self.log_enabled, "device started");
        Ok(())
    }

    /// Unbinds every virtqueue, harvests final dirty bits for every
    /// tracked section ahead of a migration snapshot, deactivates guest
    /// notifiers, and frees the log buffer.
    pub fn stop(&mut self) -> Result<()> {
        for i in 0..self.nvqs {
            self.vb.cleanup(i, &mut self.vqs, &self.mapper, &mut self.control)?;
        }

        let sections = self.sections.clone();
        for section in sections {
            dirty_sync::sync(
                section,
                (0, u64::MAX),
                &self.rt,
                self.lb.as_ref(),
                &self.cfg,
                (0..self.nvqs).map(|i| self.vqs.used_addr(i)),
                &mut self.sink,
            );
        }

        self.notifiers.set_guest_notifiers(false)?;
        self.lb = None;
        self.started = false;
        debug!("device stopped");
        Ok(())
    }
}

/// Accessors for the full-fake instantiation, so the crate's `tests/`
/// integration binary can inspect the control-channel trace and dirty
/// reports without the rest of the crate exposing internals it has no
/// other reason to.
#[cfg(any(test, feature = "test-util"))]
impl
    Reconciler<
        crate::control::fakes::FakeControlChannel,
        crate::collaborators::fakes::FakeVirtqueueSource,
        crate::collaborators::fakes::FakeMapper,
        crate::collaborators::fakes::FakeNotifierBinding,
        crate::collaborators::fakes::FakeDirtySink,
    >
{
    pub fn control_trace_for_test(&self) -> &[crate::control::fakes::Call] {
        &self.control.trace
    }

    pub fn mark_dirty_for_test(&self, page_index: u64) {
        self.lb
            .as_ref()
            .expect("log buffer must be allocated before marking it dirty")
            .mark_dirty(page_index);
    }

    pub fn dirty_report_count_for_test(&self) -> usize {
        self.sink.reports.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::{FakeDirtySink, FakeMapper, FakeNotifierBinding, FakeVirtqueue, FakeVirtqueueSource};
    use crate::collaborators::MrRef;
    use crate::control::fakes::{Call, FakeControlChannel};

    type TestReconciler = Reconciler<FakeControlChannel, FakeVirtqueueSource, FakeMapper, FakeNotifierBinding, FakeDirtySink>;

    fn two_queue_source() -> FakeVirtqueueSource {
        FakeVirtqueueSource {
            vqs: vec![
                FakeVirtqueue {
                    num: 256,
                    desc: (0x1000, 0x40),
                    avail: (0x2000, 0x20),
                    used: (0x3000, 0x30),
                    ring: (0x1000, 0x2030),
                    host_notifier: Some(10),
                    guest_notifier: Some(11),
                    ..Default::default()
                },
                FakeVirtqueue {
                    num: 256,
                    desc: (0x5000, 0x40),
                    avail: (0x6000, 0x20),
                    used: (0x7000, 0x30),
                    ring: (0x5000, 0x2030),
                    host_notifier: Some(20),
                    guest_notifier: Some(21),
                    ..Default::default()
                },
            ],
        }
    }

    fn new_reconciler(nvqs: usize) -> TestReconciler {
        let vqs = FakeVirtqueueSource {
            vqs: two_queue_source().vqs.into_iter().take(nvqs).collect(),
        };
        Reconciler::new(
            ReconcilerConfig::default(),
            FakeControlChannel::default(),
            vqs,
            FakeMapper::default(),
            FakeNotifierBinding::default(),
            FakeDirtySink::default(),
            nvqs,
        )
        .unwrap()
    }

    fn region_section(gpa: u64, size: u64) -> Section {
        Section {
            address_space_id: 0,
            mr_ref: MrRef(gpa),
            gpa,
            size,
            offset_within_region: 0,
            log_enabled: false,
            is_ram: true,
        }
    }

    #[test]
    fn start_pushes_features_then_memtable_then_binds_each_queue() {
        let mut rc = new_reconciler(2);
        rc.start().unwrap();

        let trace = &rc.control.trace;
        assert!(matches!(trace[0], Call::SetFeatures(_)));
        assert!(matches!(trace[1], Call::SetMemTable(_)));
        assert!(matches!(trace[2], Call::SetVringNum(0, 256)));
        assert!(matches!(trace[7], Call::SetVringNum(1, 256)));
        assert!(!trace.iter().any(|c| matches!(c, Call::SetLogBase(_))));
        assert!(rc.started());
    }

    #[test]
    fn stop_reads_back_vring_base_and_unmaps() {
        let mut rc = new_reconciler(2);
        rc.start().unwrap();
        rc.control.trace.clear();
        rc.stop().unwrap();

        assert!(matches!(rc.control.trace[0], Call::GetVringBase(0)));
        assert!(!rc.started());
    }

    #[test]
    fn enabling_log_while_running_resizes_before_feature_push() {
        let mut rc = new_reconciler(2);
        rc.start().unwrap();
        rc.on_region_event(region_section(0x0, 0x1000), 0x7000_0000, true)
            .unwrap();
        rc.control.trace.clear();

        rc.on_migration_log(true).unwrap();

        let trace = &rc.control.trace;
        let log_base_idx = trace.iter().position(|c| matches!(c, Call::SetLogBase(_))).unwrap();
        let features_idx = trace
            .iter()
            .position(|c| matches!(c, Call::SetFeatures(f) if f & 1 != 0))
            .unwrap();
        let addr_idx = trace.iter().position(|c| matches!(c, Call::SetVringAddr(_, _))).unwrap();
        assert!(log_base_idx < features_idx);
        assert!(features_idx < addr_idx);
        assert!(rc.log_enabled());
    }

    #[test]
    fn disabling_log_pushes_features_before_freeing_buffer() {
        let mut rc = new_reconciler(2);
        rc.start().unwrap();
        rc.on_region_event(region_section(0x0, 0x1000), 0x7000_0000, true)
            .unwrap();
        rc.on_migration_log(true).unwrap();
        rc.control.trace.clear();

        rc.on_migration_log(false).unwrap();

        let trace = &rc.control.trace;
        let features_idx = trace
            .iter()
            .position(|c| matches!(c, Call::SetFeatures(f) if f & 1 == 0))
            .unwrap();
        let log_base_idx = trace
            .iter()
            .rposition(|c| matches!(c, Call::SetLogBase(0)))
            .unwrap();
        assert!(features_idx < log_base_idx);
        assert!(!rc.log_enabled());
    }

    #[test]
    fn region_event_merges_into_table() {
        let mut rc = new_reconciler(0);
        rc.on_region_event(region_section(0x0, 0x1000), 0x7000_0000, true)
            .unwrap();
        rc.on_region_event(region_section(0x1000, 0x1000), 0x7000_1000, true)
            .unwrap();
        assert_eq!(rc.region_table().len(), 1);
    }

    #[test]
    fn toggling_log_while_stopped_only_records_the_flag() {
        let mut rc = new_reconciler(0);
        rc.on_migration_log(true).unwrap();
        assert!(rc.log_enabled());
        assert!(rc.control.trace.is_empty());
    }

    #[test]
    fn non_ram_section_is_ignored() {
        let mut rc = new_reconciler(0);
        let mut mmio = region_section(0x0, 0x1000);
        mmio.is_ram = false;
        rc.on_region_event(mmio, 0x7000_0000, true).unwrap();
        assert!(rc.region_table().is_empty());
    }

    #[test]
    fn section_from_another_address_space_is_ignored() {
        let mut rc = new_reconciler(0);
        let mut other_as = region_section(0x0, 0x1000);
        other_as.address_space_id = 7;
        rc.on_region_event(other_as, 0x7000_0000, true).unwrap();
        assert!(rc.region_table().is_empty());
    }
}
