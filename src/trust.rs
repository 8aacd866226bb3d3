// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Map logical certificate paths onto a host directory.
// Author: Lukas Bower

//! Trust material lookup by logical path.

use std::fs;
use std::path::{Component, Path, PathBuf};

use log::debug;

use crate::error::HarnessError;

/// Logical path of the CA presented to clients of public endpoints.
pub const PUBLIC_CA: &str = "/data/ca.pem";
/// Logical path of the CA used for loopback endpoints.
pub const LOCAL_CA: &str = "/certs/ca.crt";
/// Logical path of the server certificate.
pub const SERVER_CERT: &str = "/certs/server.crt";
/// Logical path of the server key.
pub const SERVER_KEY: &str = "/certs/server.key";

/// Read-only store of PEM material under a root directory.
///
/// Logical paths such as `/certs/ca.crt` resolve relative to the root and may
/// not climb out of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustStore {
    root: PathBuf,
}

impl TrustStore {
    /// Store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory the store reads from.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host path for `logical`.
    pub fn resolve(&self, logical: &str) -> Result<PathBuf, HarnessError> {
        let mut path = self.root.clone();
        for component in Path::new(logical).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(HarnessError::TrustPath(logical.to_owned()));
                }
            }
        }
        Ok(path)
    }

    /// Bytes stored at `logical`.
    pub fn lookup(&self, logical: &str) -> Result<Vec<u8>, HarnessError> {
        let path = self.resolve(logical)?;
        let bytes = fs::read(&path).map_err(|source| HarnessError::TrustMaterial {
            path: path.clone(),
            source,
        })?;
        debug!("trust {logical} -> {} ({} bytes)", path.display(), bytes.len());
        Ok(bytes)
    }
}
