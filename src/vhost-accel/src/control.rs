// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! The command transport to the accelerator.
//!
//! [`ControlChannel`] is transport-agnostic so tests run against an
//! in-memory fake; [`KernelControlChannel`] is the production
//! implementation over the kernel's vhost ioctl ABI.

use std::os::unix::io::RawFd;

use bitflags::bitflags;

use crate::error::Result;

bitflags! {
    /// Feature bits negotiated with the guest and forwarded to the
    /// accelerator. Only the log-all bit is interpreted by this crate;
    /// the rest passes through opaque.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureFlags: u64 {
        const F_LOG_ALL = 1 << 0;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VringAddrFlags: u32 {
        const LOG_ENABLED = 1 << 0;
    }
}

/// One entry of the region table as pushed to the accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemTableRegion {
    pub gpa: u64,
    pub size: u64,
    pub hva: u64,
}

/// The address set for one virtqueue, as pushed by `SetVringAddr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VringAddr {
    pub desc: u64,
    pub avail: u64,
    pub used: u64,
    /// Guest-physical address of the used ring, for log annotation.
    pub log_guest_addr: u64,
    pub flags: VringAddrFlags,
}

/// The accelerator command set. Every method is a synchronous,
/// blocking round trip; the reconciler never issues overlapping
/// commands (see the concurrency model).
pub trait ControlChannel {
    fn set_owner(&mut self) -> Result<()>;
    fn get_features(&mut self) -> Result<u64>;
    fn set_features(&mut self, features: u64) -> Result<()>;
    fn set_mem_table(&mut self, regions: &[MemTableRegion]) -> Result<()>;
    /// `base == 0` disables logging without tearing down the control
    /// channel; `base` is the [`crate::log_buffer::LogBuffer`]'s address.
    fn set_log_base(&mut self, base: u64) -> Result<()>;
    fn set_vring_num(&mut self, idx: usize, num: u16) -> Result<()>;
    fn set_vring_base(&mut self, idx: usize, base: u16) -> Result<()>;
    fn set_vring_addr(&mut self, idx: usize, addr: VringAddr) -> Result<()>;
    fn set_vring_kick(&mut self, idx: usize, fd: RawFd) -> Result<()>;
    fn set_vring_call(&mut self, idx: usize, fd: RawFd) -> Result<()>;
    fn get_vring_base(&mut self, idx: usize) -> Result<u16>;
}

#[cfg(target_os = "linux")]
pub mod kernel {
    use super::*;
    use std::fs::{File, OpenOptions};
    use std::mem;
    use std::os::unix::io::AsRawFd;

    use nix::{ioctl_read, ioctl_write_int, ioctl_write_ptr};

    const VHOST_VIRTIO: u8 = 0xAF;

    #[repr(C)]
    struct VhostMemoryRegion {
        guest_phys_addr: u64,
        memory_size: u64,
        userspace_addr: u64,
        flags_padding: u64,
    }

    #[repr(C)]
    struct VhostMemoryHeader {
        nregions: u32,
        padding: u32,
    }

    #[repr(C)]
    struct VhostVringAddr {
        index: u32,
        flags: u32,
        desc_user_addr: u64,
        used_user_addr: u64,
        avail_user_addr: u64,
        log_guest_addr: u64,
    }

    #[repr(C)]
    struct VhostVringState {
        index: u32,
        num: u32,
    }

    #[repr(C)]
    struct VhostVringFile {
        index: u32,
        fd: i32,
    }

    ioctl_write_int!(vhost_set_owner, VHOST_VIRTIO, 0x01);
    ioctl_read!(vhost_get_features, VHOST_VIRTIO, 0x00, u64);
    ioctl_write_ptr!(vhost_set_features, VHOST_VIRTIO, 0x00, u64);
    ioctl_write_ptr!(vhost_set_log_base, VHOST_VIRTIO, 0x04, u64);
    ioctl_write_ptr!(vhost_set_vring_num, VHOST_VIRTIO, 0x10, VhostVringState);
    ioctl_write_ptr!(vhost_set_vring_base, VHOST_VIRTIO, 0x12, VhostVringState);
    ioctl_read!(vhost_get_vring_base, VHOST_VIRTIO, 0x12, VhostVringState);
    ioctl_write_ptr!(vhost_set_vring_addr, VHOST_VIRTIO, 0x11, VhostVringAddr);
    ioctl_write_ptr!(vhost_set_vring_kick, VHOST_VIRTIO, 0x20, VhostVringFile);
    ioctl_write_ptr!(vhost_set_vring_call, VHOST_VIRTIO, 0x21, VhostVringFile);

    /// Issues vhost commands over an open `/dev/vhost-*` file descriptor.
    pub struct KernelControlChannel {
        file: File,
    }

    impl KernelControlChannel {
        pub fn open(path: &str) -> Result<Self> {
            let file = OpenOptions::new().read(true).write(true).open(path)?;
            Ok(KernelControlChannel { file })
        }

        fn ioctl_result(ret: nix::Result<i32>) -> Result<()> {
            ret.map(|_| ()).map_err(|e| {
                crate::error::Error::ControlFailed(e as i32)
            })
        }
    }

    impl ControlChannel for KernelControlChannel {
        fn set_owner(&mut self) -> Result<()> {
            let fd = self.file.as_raw_fd();
            Self::ioctl_result(unsafe { vhost_set_owner(fd, 0) })
        }

        fn get_features(&mut self) -> Result<u64> {
            let fd = self.file.as_raw_fd();
            let mut features: u64 = 0;
            Self::ioctl_result(unsafe { vhost_get_features(fd, &mut features) })?;
            Ok(features)
        }

        fn set_features(&mut self, features: u64) -> Result<()> {
            let fd = self.file.as_raw_fd();
            Self::ioctl_result(unsafe { vhost_set_features(fd, &features) })
        }

        fn set_mem_table(&mut self, regions: &[MemTableRegion]) -> Result<()> {
            let fd = self.file.as_raw_fd();
            let header_size = mem::size_of::<VhostMemoryHeader>();
            let region_size = mem::size_of::<VhostMemoryRegion>();
            let mut buf = vec![0u8; header_size + region_size * regions.len()];

            let header = VhostMemoryHeader {
                nregions: regions.len() as u32,
                padding: 0,
            };
            // Safety: `buf` was sized to exactly hold the header followed by
            // `regions.len()` region entries laid out with their C repr.
            unsafe {
                std::ptr::write(buf.as_mut_ptr() as *mut VhostMemoryHeader, header);
                let region_ptr = buf.as_mut_ptr().add(header_size) as *mut VhostMemoryRegion;
                for (i, r) in regions.iter().enumerate() {
                    std::ptr::write(
                        region_ptr.add(i),
                        VhostMemoryRegion {
                            guest_phys_addr: r.gpa,
                            memory_size: r.size,
                            userspace_addr: r.hva,
                            flags_padding: 0,
                        },
                    );
                }
            }

            ioctl_write_ptr!(vhost_set_mem_table, VHOST_VIRTIO, 0x03, u8);
            Self::ioctl_result(unsafe { vhost_set_mem_table(fd, buf.as_ptr()) })
        }

        fn set_log_base(&mut self, base: u64) -> Result<()> {
            let fd = self.file.as_raw_fd();
            Self::ioctl_result(unsafe { vhost_set_log_base(fd, &base) })
        }

        fn set_vring_num(&mut self, idx: usize, num: u16) -> Result<()> {
            let fd = self.file.as_raw_fd();
            let state = VhostVringState {
                index: idx as u32,
                num: num as u32,
            };
            Self::ioctl_result(unsafe { vhost_set_vring_num(fd, &state) })
        }

        fn set_vring_base(&mut self, idx: usize, base: u16) -> Result<()> {
            let fd = self.file.as_raw_fd();
            let state = VhostVringState {
                index: idx as u32,
                num: base as u32,
            };
            Self::ioctl_result(unsafe { vhost_set_vring_base(fd, &state) })
        }

        fn set_vring_addr(&mut self, idx: usize, addr: VringAddr) -> Result<()> {
            let fd = self.file.as_raw_fd();
            let wire = VhostVringAddr {
                index: idx as u32,
                flags: addr.flags.bits(),
                desc_user_addr: addr.desc,
                used_user_addr: addr.used,
                avail_user_addr: addr.avail,
                log_guest_addr: addr.log_guest_addr,
            };
            Self::ioctl_result(unsafe { vhost_set_vring_addr(fd, &wire) })
        }

        fn set_vring_kick(&mut self, idx: usize, kick_fd: RawFd) -> Result<()> {
            let fd = self.file.as_raw_fd();
            let file = VhostVringFile {
                index: idx as u32,
                fd: kick_fd,
            };
            Self::ioctl_result(unsafe { vhost_set_vring_kick(fd, &file) })
        }

        fn set_vring_call(&mut self, idx: usize, call_fd: RawFd) -> Result<()> {
            let fd = self.file.as_raw_fd();
            let file = VhostVringFile {
                index: idx as u32,
                fd: call_fd,
            };
            Self::ioctl_result(unsafe { vhost_set_vring_call(fd, &file) })
        }

        fn get_vring_base(&mut self, idx: usize) -> Result<u16> {
            let fd = self.file.as_raw_fd();
            let mut state = VhostVringState {
                index: idx as u32,
                num: 0,
            };
            Self::ioctl_result(unsafe { vhost_get_vring_base(fd, &mut state) })?;
            Ok(state.num as u16)
        }
    }
}

#[cfg(target_os = "linux")]
pub use kernel::KernelControlChannel;

#[cfg(any(test, feature = "test-util"))]
pub mod fakes {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        SetOwner,
        GetFeatures,
        SetFeatures(u64),
        SetMemTable(Vec<MemTableRegion>),
        SetLogBase(u64),
        SetVringNum(usize, u16),
        SetVringBase(usize, u16),
        SetVringAddr(usize, VringAddr),
        SetVringKick(usize, RawFd),
        SetVringCall(usize, RawFd),
        GetVringBase(usize),
    }

    /// Records every call in order and replies with canned answers;
    /// `fail_on` lets a test inject a single failure by call index.
    #[derive(Debug, Default)]
    pub struct FakeControlChannel {
        pub trace: Vec<Call>,
        pub features: u64,
        pub vring_bases: std::collections::HashMap<usize, u16>,
        pub fail_on: Option<usize>,
    }

    impl FakeControlChannel {
        fn check_fail(&self) -> Result<()> {
            if self.fail_on == Some(self.trace.len() - 1) {
                return Err(crate::error::Error::ControlFailed(-1));
            }
            Ok(())
        }
    }

    impl ControlChannel for FakeControlChannel {
        fn set_owner(&mut self) -> Result<()> {
            self.trace.push(Call::SetOwner);
            self.check_fail()
        }
        fn get_features(&mut self) -> Result<u64> {
            self.trace.push(Call::GetFeatures);
            self.check_fail()?;
            Ok(self.features)
        }
        fn set_features(&mut self, features: u64) -> Result<()> {
            self.trace.push(Call::SetFeatures(features));
            self.check_fail()
        }
        fn set_mem_table(&mut self, regions: &[MemTableRegion]) -> Result<()> {
            self.trace.push(Call::SetMemTable(regions.to_vec()));
            self.check_fail()
        }
        fn set_log_base(&mut self, base: u64) -> Result<()> {
            self.trace.push(Call::SetLogBase(base));
            self.check_fail()
        }
        fn set_vring_num(&mut self, idx: usize, num: u16) -> Result<()> {
            self.trace.push(Call::SetVringNum(idx, num));
            self.check_fail()
        }
        fn set_vring_base(&mut self, idx: usize, base: u16) -> Result<()> {
            self.trace.push(Call::SetVringBase(idx, base));
            self.check_fail()
        }
        fn set_vring_addr(&mut self, idx: usize, addr: VringAddr) -> Result<()> {
            self.trace.push(Call::SetVringAddr(idx, addr));
            self.check_fail()
        }
        fn set_vring_kick(&mut self, idx: usize, fd: RawFd) -> Result<()> {
            self.trace.push(Call::SetVringKick(idx, fd));
            self.check_fail()
        }
        fn set_vring_call(&mut self, idx: usize, fd: RawFd) -> Result<()> {
            self.trace.push(Call::SetVringCall(idx, fd));
            self.check_fail()
        }
        fn get_vring_base(&mut self, idx: usize) -> Result<u16> {
            self.trace.push(Call::GetVringBase(idx));
            self.check_fail()?;
            Ok(*self.vring_bases.get(&idx).unwrap_or(&0))
        }
    }
}
