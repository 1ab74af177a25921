// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The five error kinds of section 7 of the design, each with a fixed
//! propagation policy. Integrity failures are never returned up as fatal:
//! callers that hit them log and move on to the next candidate (next MDA,
//! next label sector). Everything else is terminal for the command.

use std::io;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Transient or permanent I/O failure (open/read/write/seek/fsync).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A syscall outside plain I/O failed (flock, ioctl, stat).
    #[error("system call failed: {0}")]
    Nix(#[from] nix::Error),

    /// Bad CRC, bad magic, a size that doesn't fit, a malformed text
    /// record. Caller should skip to the next candidate, never abort.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// Two live things claim to be the same thing (duplicate PVID,
    /// duplicate VG name). Caller downgrades to a safe default.
    #[error("inconsistent on-disk state: {0}")]
    Inconsistency(String),

    /// A structural invariant the rest of the system depends on does not
    /// hold (PV missing from the VG it claims, MDA count disagreement).
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// Out of memory, cannot create a lockfile, and similar.
    #[error("resource error: {0}")]
    Resource(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn integrity(msg: impl Into<String>) -> Error {
        Error::Integrity(msg.into())
    }

    pub fn inconsistency(msg: impl Into<String>) -> Error {
        Error::Inconsistency(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Error {
        Error::Invariant(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Error {
        Error::Resource(msg.into())
    }
}
