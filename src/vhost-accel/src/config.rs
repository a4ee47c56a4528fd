// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! Tunables for the reconciliation engine.
//!
//! Production deployments use [`ReconcilerConfig::default`]; tests override
//! individual fields to exercise resize/grow/shrink edge cases without
//! allocating production-sized log buffers.

/// Number of bits in one log word. Each word is harvested with a single
/// atomic fetch-and-clear, so this also bounds how many pages one such
/// operation can report.
pub const WORD_BITS: u64 = u64::BITS as u64;

/// Bytes of hysteresis added when growing the log buffer, expressed in log
/// words. Matches the "extra 4K" amortization the source performs; the
/// precise value only affects reallocation frequency, never correctness.
pub const DEFAULT_SLACK_WORDS: u64 = 4096 / 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Bytes covered by a single dirty-log bit.
    pub page_size: u64,
    /// Bytes of guest address space covered by one log word
    /// (`page_size * WORD_BITS`).
    pub chunk_bytes: u64,
    /// Extra words allocated on grow, to amortize reallocation.
    pub slack_words: u64,
    /// Path to the accelerator's control-channel device node.
    pub control_path: &'static str,
    /// Identity of the system address space. `on_region_event` ignores
    /// sections from any other address space (e.g. a PCI BAR's own I/O
    /// address space) the same way the source's `vhost_section` check
    /// does by comparing against `get_system_memory()`.
    pub system_address_space_id: u64,
}

impl ReconcilerConfig {
    pub fn chunk_pages(&self) -> u64 {
        self.chunk_bytes / self.page_size
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        let page_size = 4096;
        ReconcilerConfig {
            page_size,
            chunk_bytes: page_size * WORD_BITS,
            slack_words: DEFAULT_SLACK_WORDS,
            control_path: "/dev/vhost-net",
            system_address_space_id: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_chunk_covers_one_word_of_pages() {
        let cfg = ReconcilerConfig::default();
        assert_eq!(cfg.chunk_pages(), WORD_BITS);
        assert_eq!(cfg.chunk_bytes, cfg.page_size * WORD_BITS);
    }
}
