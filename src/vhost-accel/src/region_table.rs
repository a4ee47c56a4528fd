// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! An unsorted array of non-overlapping guest-physical to host-virtual
//! memory regions, kept merge-maximal under an event stream of arbitrary
//! add/remove fragments.
//!
//! This is a line-for-line idiomatic translation of the region bookkeeping
//! in the original kernel accelerator's memory listener: unsorted storage,
//! O(n) scans, and the same head/tail/split classification for removal.

use std::cmp;

/// One guest-physical-to-host-virtual mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub gpa: u64,
    pub size: u64,
    pub hva: u64,
}

impl Region {
    /// Last guest-physical byte covered by this region, inclusive.
    fn gpa_last(&self) -> u64 {
        self.gpa + self.size - 1
    }

    /// Last host-virtual byte covered by this region, inclusive.
    fn hva_last(&self) -> u64 {
        self.hva + self.size - 1
    }

    /// `true` iff `hva` is the host-virtual address that `gpa` is expected
    /// to map to if this region covers it.
    fn translates(&self, gpa: u64, hva: u64) -> bool {
        hva == self.hva + (gpa - self.gpa)
    }
}

fn ranges_overlap(a_start: u64, a_size: u64, b_start: u64, b_size: u64) -> bool {
    let a_last = a_start + a_size - 1;
    let b_last = b_start + b_size - 1;
    a_start <= b_last && b_start <= a_last
}

/// The non-overlapping, merge-maximal region array.
///
/// Order of regions is not observable and must not be relied on by
/// callers; `PartialEq` for tests compares as sets.
#[derive(Debug, Clone, Default)]
pub struct RegionTable {
    regions: Vec<Region>,
}

impl RegionTable {
    pub fn new() -> Self {
        RegionTable {
            regions: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    /// Returns any region whose range overlaps `[gpa, gpa+size)`.
    pub fn find_overlapping(&self, gpa: u64, size: u64) -> Option<&Region> {
        self.regions
            .iter()
            .find(|r| ranges_overlap(r.gpa, r.size, gpa, size))
    }

    fn find_covering(&self, gpa: u64, size: u64) -> Option<&Region> {
        let last = gpa + size - 1;
        self.regions
            .iter()
            .find(|r| ranges_overlap(r.gpa, r.size, gpa, size) && r.gpa <= gpa && r.gpa_last() >= last)
    }

    /// `false` iff a region already covers `[gpa, gpa+size)` with the
    /// requested `hva` translation, i.e. `assign` would be a no-op.
    pub fn compare(&self, gpa: u64, size: u64, hva: u64) -> bool {
        match self.find_covering(gpa, size) {
            Some(r) => !r.translates(gpa, hva),
            None => true,
        }
    }

    /// Removes `[gpa, gpa+size)` from every region it intersects,
    /// shrinking, splitting, or deleting as required.
    pub fn unassign(&mut self, gpa: u64, size: u64) {
        debug_assert!(size > 0, "unassign: zero-sized range");
        let last = gpa + size - 1;

        let mut overlap_start = false;
        let mut overlap_end = false;
        let mut split = false;

        let mut out = Vec::with_capacity(self.regions.len() + 1);
        for r in self.regions.drain(..) {
            if !ranges_overlap(r.gpa, r.size, gpa, size) {
                out.push(r);
                continue;
            }

            debug_assert!(!split, "unassign: at most one split per call");
            let r_last = r.gpa_last();

            // Remove whole region.
            if gpa <= r.gpa && last >= r_last {
                continue;
            }

            // Shrink region: removal covers the tail.
            if last >= r_last {
                debug_assert!(!overlap_end, "unassign: at most one tail shrink per call");
                overlap_end = true;
                out.push(Region {
                    gpa: r.gpa,
                    size: gpa - r.gpa,
                    hva: r.hva,
                });
                continue;
            }

            // Shift region: removal covers the head.
            if gpa <= r.gpa {
                debug_assert!(!overlap_start, "unassign: at most one head shrink per call");
                overlap_start = true;
                let change = last + 1 - r.gpa;
                out.push(Region {
                    gpa: r.gpa + change,
                    size: r.size - change,
                    hva: r.hva + change,
                });
                continue;
            }

            // Removal is strictly in the middle: split region, shrinking
            // the first part and shifting the second. Since the input
            // range is contiguous and regions never overlap, a split
            // means this is the only region the range can touch.
            debug_assert!(
                !overlap_start && !overlap_end,
                "unassign: split cannot co-occur with a partial overlap"
            );
            split = true;
            let change = last + 1 - r.gpa;
            out.push(Region {
                gpa: r.gpa,
                size: gpa - r.gpa,
                hva: r.hva,
            });
            out.push(Region {
                gpa: r.gpa + change,
                size: r.size - change,
                hva: r.hva + change,
            });
        }

        self.regions = out;
    }

    /// Inserts `(gpa, size, hva)`, merging with any neighbor that is
    /// adjacent in both `gpa` and `hva`. Callers must have already run
    /// `unassign(gpa, size)` so no region overlaps the new one.
    pub fn assign(&mut self, gpa: u64, size: u64, hva: u64) {
        debug_assert!(size > 0, "assign: zero-sized region");

        let mut gpa = gpa;
        let mut size = size;
        let mut hva = hva;

        let mut merged_idx: Option<usize> = None;
        let mut consumed = Vec::new();

        for (i, r) in self.regions.iter().enumerate() {
            let r_last = r.gpa_last();
            let new_last = gpa + size - 1;
            debug_assert!(
                r_last < gpa || new_last < r.gpa,
                "assign: overlapping region, unassign must run first"
            );

            let new_grows_onto_r = r_last + 1 == gpa && r.hva_last() + 1 == hva;
            let r_grows_onto_new = new_last + 1 == r.gpa && hva + size == r.hva;
            if !new_grows_onto_r && !r_grows_onto_new {
                continue;
            }

            let merged_hva = cmp::min(hva, r.hva);
            let merged_gpa = cmp::min(gpa, r.gpa);
            let merged_last = cmp::max(new_last, r_last);
            hva = merged_hva;
            gpa = merged_gpa;
            size = merged_last - merged_gpa + 1;

            match merged_idx {
                Some(_) => consumed.push(i),
                None => merged_idx = Some(i),
            }
        }

        for i in consumed.into_iter().rev() {
            self.regions.remove(i);
        }

        match merged_idx {
            Some(i) => self.regions[i] = Region { gpa, size, hva },
            None => self.regions.push(Region { gpa, size, hva }),
        }
    }

    /// The log size, in words of `chunk_bytes` each, needed to cover every
    /// region plus every extra `(phys, size)` range supplied by the caller
    /// (virtqueue used-areas).
    pub fn total_log_chunks(
        &self,
        chunk_bytes: u64,
        extra_ranges: impl IntoIterator<Item = (u64, u64)>,
    ) -> u64 {
        let mut chunks = 0u64;
        for r in &self.regions {
            chunks = cmp::max(chunks, chunks_for(r.gpa + r.size, chunk_bytes));
        }
        for (phys, size) in extra_ranges {
            if size == 0 {
                continue;
            }
            chunks = cmp::max(chunks, chunks_for(phys + size, chunk_bytes));
        }
        chunks
    }
}

fn chunks_for(end_exclusive: u64, chunk_bytes: u64) -> u64 {
    if end_exclusive == 0 {
        return 0;
    }
    (end_exclusive - 1) / chunk_bytes + 1
}
