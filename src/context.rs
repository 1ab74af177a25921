// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The per-command `Context`: replaces lvm2's module-level globals
//! (`_vgname_hash`, `_pvid_hash`, `_lock_hash`, `_hints_fd`) with fields
//! on a value created once at command start and passed explicitly to
//! every public operation.

use std::path::PathBuf;

use crate::device::DeviceCache;
use crate::flock::LockTable;
use crate::id_matcher::SearchPolicy;
use crate::lvmcache::LvmCache;

/// The read-only environment a command runs under, as a plain struct
/// rather than a config-tree walk.
#[derive(Debug, Clone)]
pub struct Config {
    pub system_dir: PathBuf,
    pub locking_dir: PathBuf,
    pub run_dir: PathBuf,
    pub search_for_devnames: SearchPolicy,
    pub devicesfile_backup_limit: usize,
    pub locking_enabled: bool,
}

impl Config {
    pub fn devices_file_path(&self) -> PathBuf {
        self.system_dir.join("devices").join("system.devices")
    }

    pub fn devices_backup_dir(&self) -> PathBuf {
        self.system_dir.join("devices").join("backup")
    }

    pub fn hints_file_path(&self) -> PathBuf {
        self.run_dir.join("hints")
    }

    /// Read from the environment the way the demo binary does: `clap`
    /// supplies overrides, this supplies the fallback defaults.
    pub fn from_env() -> Config {
        let system_dir = std::env::var("LVM_SYSTEM_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/etc/lvm"));
        let locking_dir = std::env::var("LVM_LOCKING_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/run/lock/lvm"));
        let run_dir = std::env::var("LVM_RUN_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/run/lvm"));

        Config {
            system_dir,
            locking_dir,
            run_dir,
            search_for_devnames: SearchPolicy::Auto,
            devicesfile_backup_limit: 10,
            locking_enabled: true,
        }
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            system_dir: PathBuf::from("/etc/lvm"),
            locking_dir: PathBuf::from("/run/lock/lvm"),
            run_dir: PathBuf::from("/run/lvm"),
            search_for_devnames: SearchPolicy::Auto,
            devicesfile_backup_limit: 10,
            locking_enabled: true,
        }
    }
}

/// Owns everything a command-line operation touches: the device arena,
/// the PV/VG cache, and open lockfiles. Created at command start,
/// dropped at command end -- nothing in this crate keeps state beyond
/// one `Context`'s lifetime.
pub struct Context {
    pub config: Config,
    pub devices: DeviceCache,
    pub cache: LvmCache,
    pub locks: LockTable,
}

impl Context {
    pub fn new(config: Config) -> Context {
        let locks = LockTable::new(config.locking_dir.clone(), config.locking_enabled);
        Context {
            config,
            devices: DeviceCache::new(),
            cache: LvmCache::new(),
            locks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_new_starts_with_empty_caches() {
        let ctx = Context::new(Config::default());
        assert!(ctx.devices.is_empty());
        assert_eq!(ctx.cache.vginfos().count(), 0);
    }

    #[test]
    fn config_paths_are_derived_from_system_dir() {
        let mut cfg = Config::default();
        cfg.system_dir = PathBuf::from("/custom/lvm");
        assert_eq!(
            cfg.devices_file_path(),
            PathBuf::from("/custom/lvm/devices/system.devices")
        );
    }
}
