// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

use std::fmt::{self, Display};
use std::io;
use std::result;

/// Errors surfaced by the reconciliation engine.
///
/// Internal consistency bugs (a split that overlaps another region, a
/// zero-sized region reaching [`crate::region_table::RegionTable`]) are not
/// represented here: they are programming errors and are caught with
/// `debug_assert!` rather than propagated, matching the source's use of
/// `assert()` for the same conditions.
#[derive(Debug)]
pub enum Error {
    /// A control-channel command returned a nonzero status.
    ControlFailed(i32),
    /// A guest-physical-to-host-virtual mapping failed or returned a
    /// shorter region than requested.
    OutOfMemory,
    /// A virtqueue ring relocated host-virtual address under a running
    /// device. The caller must treat this as fatal.
    Busy,
    /// A required collaborator capability (host/guest notifier setter) is
    /// missing.
    Unsupported(&'static str),
    /// I/O failure opening or operating the control channel itself.
    Io(io::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::Error::*;

        match self {
            ControlFailed(code) => write!(f, "control channel command failed: {code}"),
            OutOfMemory => write!(f, "guest memory mapping failed or was short"),
            Busy => write!(f, "virtqueue ring relocated under a running device"),
            Unsupported(what) => write!(f, "collaborator does not support {what}"),
            Io(e) => write!(f, "control channel I/O error: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

pub type Result<T> = result::Result<T, Error>;
