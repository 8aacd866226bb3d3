// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Linux TAP device attachment and the frame driver over it.
// Author: Lukas Bower

//! TAP device driver.
//!
//! [`open_tap`] attaches to a named TAP interface through the tunnel clone
//! device in non-blocking mode without packet information headers.
//! [`TapDriver`] then moves one Ethernet frame per read or write.

#![allow(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::mem;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use tapcheck_stack::Driver;

use crate::error::HarnessError;

/// Pause taken after every read attempt on the device.
const IDLE_BACKOFF: Duration = Duration::from_micros(1);

/// `ifreq` asking for a TAP interface called `name` without packet information.
fn tap_request(name: &str) -> Result<libc::ifreq, HarnessError> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() >= libc::IFNAMSIZ || bytes.contains(&0) {
        return Err(HarnessError::InterfaceName(name.to_owned()));
    }
    // SAFETY: ifreq is plain old data and all-zero is a valid value for it.
    let mut req: libc::ifreq = unsafe { mem::zeroed() };
    for (dst, src) in req.ifr_name.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    req.ifr_ifru.ifru_flags = (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short;
    Ok(req)
}

/// Open `device` and bind it to the TAP interface `name`.
pub fn open_tap(device: &Path, name: &str) -> Result<File, HarnessError> {
    let mut req = tap_request(name)?;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(device)
        .map_err(|source| HarnessError::DeviceOpen {
            path: device.to_path_buf(),
            source,
        })?;
    // SAFETY: the descriptor is open for the lifetime of `file` and `req` is a
    // NUL terminated ifreq that outlives the call.
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), libc::TUNSETIFF as _, &mut req as *mut libc::ifreq) };
    if rc < 0 {
        return Err(HarnessError::InterfaceSetup {
            name: name.to_owned(),
            source: io::Error::last_os_error(),
        });
    }
    debug!("attached TAP interface {name} via {}", device.display());
    Ok(file)
}

/// Frame driver over a non-blocking TAP descriptor.
///
/// Generic over the handle so tests can substitute an in-memory stream.
#[derive(Debug)]
pub struct TapDriver<F = File> {
    io: Option<F>,
}

impl<F: Read + Write + Send> TapDriver<F> {
    /// Drive frames through `io`.
    pub fn new(io: F) -> Self {
        Self { io: Some(io) }
    }

    /// Driver with no device; the link reports down.
    #[must_use]
    pub fn detached() -> Self {
        Self { io: None }
    }

    /// Give back the underlying handle.
    pub fn into_inner(self) -> Option<F> {
        self.io
    }
}

impl<F: Read + Write + Send> Driver for TapDriver<F> {
    fn transmit(&mut self, frame: &[u8]) -> usize {
        let Some(io) = self.io.as_mut() else {
            return 0;
        };
        match io.write(frame) {
            Ok(n) => n,
            Err(err) => {
                warn!("tap write of {} bytes failed: {err}", frame.len());
                0
            }
        }
    }

    fn receive(&mut self, buf: &mut [u8]) -> usize {
        let Some(io) = self.io.as_mut() else {
            return 0;
        };
        let received = match io.read(buf) {
            Ok(n) => n,
            Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => 0,
            Err(err) => {
                warn!("tap read failed: {err}");
                0
            }
        };
        thread::sleep(IDLE_BACKOFF);
        received
    }

    fn link_up(&self) -> bool {
        self.io.is_some()
    }
}
