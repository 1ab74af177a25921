// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Advisory locking: the global lock, the devices-file and hints-file
//! companion locks, and per-vgname locks, all taken via `flock` on a
//! file under the locking directory.
//!
//! `flock()` is per-open-file-description, so a second `open()` of the
//! same lock path in the same process would contend with itself. To get
//! nested EX locks within one process to succeed idempotently,
//! `LockTable` tracks held locks by name and only calls into the OS on
//! the first acquire; later acquires for the same scope just bump a
//! reference count.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use log::warn;
use nix::fcntl::{flock, FlockArg};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockScope {
    Global,
    DevicesFile,
    Hints,
    Vg(String),
}

impl LockScope {
    fn filename(&self) -> String {
        match self {
            LockScope::Global => "P_global".to_string(),
            LockScope::DevicesFile => "D_system.devices".to_string(),
            LockScope::Hints => "H_hints".to_string(),
            LockScope::Vg(name) => format!("V_{}", name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockMode {
    Shared,
    Exclusive,
}

struct Held {
    _file: File,
    mode: LockMode,
    count: u32,
}

/// Owns every lockfile this process currently holds, so nested acquires
/// within one command are idempotent instead of re-`flock`ing (and
/// potentially self-contending).
pub struct LockTable {
    dir: PathBuf,
    held: HashMap<LockScope, Held>,
    /// `sysinit` / `ignorelockingfailure`: lock failures degrade to a
    /// logged warning instead of aborting the command.
    locking_enabled: bool,
}

impl LockTable {
    pub fn new(dir: impl Into<PathBuf>, locking_enabled: bool) -> LockTable {
        LockTable {
            dir: dir.into(),
            held: HashMap::new(),
            locking_enabled,
        }
    }

    fn path_for(&self, scope: &LockScope) -> PathBuf {
        self.dir.join(scope.filename())
    }

    fn open(&self, scope: &LockScope) -> Result<File> {
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(self.path_for(scope))?)
    }

    /// Acquire `scope` at `mode`, blocking. A scope already held at
    /// `mode` or stronger just has its count bumped. A scope held at
    /// `Shared` being re-acquired at `Exclusive` is upgraded in place.
    pub fn lock(&mut self, scope: LockScope, mode: LockMode) -> Result<()> {
        let existing_mode = self.held.get(&scope).map(|h| h.mode);

        match existing_mode {
            Some(held_mode) if held_mode >= mode => {
                self.held.get_mut(&scope).unwrap().count += 1;
                Ok(())
            }
            Some(_) => {
                let result = do_flock(&self.held.get(&scope).unwrap()._file, mode);
                match result {
                    Ok(()) => {
                        let held = self.held.get_mut(&scope).unwrap();
                        held.mode = mode;
                        held.count += 1;
                        Ok(())
                    }
                    Err(e) => self.degrade(e),
                }
            }
            None => {
                let file = match self.open(&scope) {
                    Ok(f) => f,
                    Err(e) => return self.degrade(e),
                };
                if let Err(e) = do_flock(&file, mode) {
                    return self.degrade(e);
                }
                self.held.insert(
                    scope,
                    Held {
                        _file: file,
                        mode,
                        count: 1,
                    },
                );
                Ok(())
            }
        }
    }

    /// Non-blocking acquire: the devices-file writer's `LOCK_NB` path.
    /// Returns `Ok(false)` (not an error) when another process holds the
    /// lock -- the caller abandons its update for a future command.
    pub fn try_lock(&mut self, scope: LockScope, mode: LockMode) -> Result<bool> {
        if let Some(held) = self.held.get(&scope) {
            if held.mode >= mode {
                self.held.get_mut(&scope).unwrap().count += 1;
                return Ok(true);
            }
        }

        let file = self.open(&scope)?;
        let arg = match mode {
            LockMode::Shared => FlockArg::LockSharedNonblock,
            LockMode::Exclusive => FlockArg::LockExclusiveNonblock,
        };
        match flock(file.as_raw_fd(), arg) {
            Ok(()) => {
                self.held.insert(
                    scope,
                    Held {
                        _file: file,
                        mode,
                        count: 1,
                    },
                );
                Ok(true)
            }
            Err(nix::Error::EWOULDBLOCK) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Release one level of nesting. The underlying flock is dropped
    /// (and the OS lock released) only once the count reaches zero.
    pub fn unlock(&mut self, scope: &LockScope) {
        if let Some(held) = self.held.get_mut(scope) {
            held.count -= 1;
            if held.count == 0 {
                self.held.remove(scope);
            }
        }
    }

    pub fn is_held(&self, scope: &LockScope) -> bool {
        self.held.contains_key(scope)
    }

    fn degrade(&self, e: impl Into<crate::error::Error>) -> Result<()> {
        if self.locking_enabled {
            Err(e.into())
        } else {
            let e = e.into();
            warn!("locking disabled or unavailable: {}", e);
            Ok(())
        }
    }
}

fn do_flock(file: &File, mode: LockMode) -> Result<()> {
    let arg = match mode {
        LockMode::Shared => FlockArg::LockShared,
        LockMode::Exclusive => FlockArg::LockExclusive,
    };
    flock(file.as_raw_fd(), arg)?;
    Ok(())
}

pub fn ensure_lock_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    Ok(())
}
