// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Error type for harness setup and scenario plumbing.
// Author: Lukas Bower

//! Harness errors.

use std::io;
use std::path::PathBuf;

use tapcheck_stack::StackError;
use thiserror::Error;

/// Failures outside the assertion layer: device setup, trust material and
/// process plumbing.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Tunnel clone device could not be opened.
    #[error("failed to open {path}: {source}")]
    DeviceOpen {
        /// Device path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// Interface name does not fit the kernel's limit.
    #[error("interface name {0:?} is empty or longer than 15 bytes")]
    InterfaceName(String),
    /// Binding the TAP interface failed.
    #[error("failed to attach TAP interface {name}: {source}")]
    InterfaceSetup {
        /// Requested interface name.
        name: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// Certificate, key or CA file could not be read.
    #[error("failed to read trust material {path}: {source}")]
    TrustMaterial {
        /// Resolved host path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// Logical trust path tried to escape the trust root.
    #[error("trust path {0:?} escapes the trust root")]
    TrustPath(String),
    /// Background poller thread could not be started.
    #[error("failed to spawn poller thread: {0}")]
    Spawn(#[source] io::Error),
    /// Invalid harness configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Stack level failure.
    #[error(transparent)]
    Stack(#[from] StackError),
}
