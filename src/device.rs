// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Device handles and the process-wide device cache.
//!
//! `Device` objects live in an arena owned by `DeviceCache` and are
//! referred to everywhere else by the stable `DeviceHandle` index rather
//! than by pointer, per the "pointer graphs" design note: nothing outside
//! this module ever owns a `Device`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bitflags::bitflags;

bitflags! {
    /// Per-device status bits accumulated over the course of a scan.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceFlags: u32 {
        /// The device has been through `label_scan` at least once.
        const SCANNED        = 1 << 0;
        /// The device passed the filter chain's nodata stage.
        const FILTER_NODATA   = 1 << 1;
        /// The device passed the filter chain's data stage.
        const FILTER_DATA     = 1 << 2;
        /// The device-id matcher has bound this device to a `UseEntry`.
        const MATCHED         = 1 << 3;
    }
}

/// One of the id-types the catalogue knows how to read, in no particular
/// order here -- the *priority* order lives in `device_id::read_preferred_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdType {
    SysWwid,
    WwidNaa,
    WwidEui,
    WwidT10,
    SysSerial,
    Devname,
    MpathUuid,
    CryptUuid,
    LvmlvUuid,
    MdUuid,
    LoopFile,
}

impl IdType {
    /// The devices-file `IDTYPE=` token, lower-cased exactly as written.
    pub fn as_str(self) -> &'static str {
        match self {
            IdType::SysWwid => "sys_wwid",
            IdType::WwidNaa => "wwid_naa",
            IdType::WwidEui => "wwid_eui",
            IdType::WwidT10 => "wwid_t10",
            IdType::SysSerial => "sys_serial",
            IdType::Devname => "devname",
            IdType::MpathUuid => "mpath_uuid",
            IdType::CryptUuid => "crypt_uuid",
            IdType::LvmlvUuid => "lvmlv_uuid",
            IdType::MdUuid => "md_uuid",
            IdType::LoopFile => "loop_file",
        }
    }

    pub fn from_str(s: &str) -> Option<IdType> {
        Some(match s {
            "sys_wwid" => IdType::SysWwid,
            "wwid_naa" => IdType::WwidNaa,
            "wwid_eui" => IdType::WwidEui,
            "wwid_t10" => IdType::WwidT10,
            "sys_serial" => IdType::SysSerial,
            "devname" => IdType::Devname,
            "mpath_uuid" => IdType::MpathUuid,
            "crypt_uuid" => IdType::CryptUuid,
            "lvmlv_uuid" => IdType::LvmlvUuid,
            "md_uuid" => IdType::MdUuid,
            "loop_file" => IdType::LoopFile,
            _ => return None,
        })
    }
}

/// `(idtype, idname)`. `idname == None` is a negative cache entry: this
/// type was tried on the device and found unavailable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevId {
    pub idtype: IdType,
    pub idname: Option<String>,
}

/// A stable handle into a `DeviceCache`'s arena. Never reused across a
/// `clear()`, cheap to copy, valid for the life of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceHandle(usize);

/// A block device handle: primary/partition numbers, current name, the
/// PVID last read from its label, status flags, aliases and discovered
/// ids, per the data model.
#[derive(Debug, Clone)]
pub struct Device {
    pub major: u64,
    pub minor: u64,
    pub partition: Option<u32>,
    pub name: PathBuf,
    /// Empty string if no label has been read (or none found) yet.
    pub pvid: String,
    pub flags: DeviceFlags,
    pub aliases: Vec<PathBuf>,
    pub ids: Vec<DevId>,
}

impl Device {
    pub fn new(major: u64, minor: u64, name: impl Into<PathBuf>) -> Device {
        Device {
            major,
            minor,
            partition: None,
            name: name.into(),
            pvid: String::new(),
            flags: DeviceFlags::empty(),
            aliases: Vec::new(),
            ids: Vec::new(),
        }
    }

    pub fn devno(&self) -> (u64, u64) {
        (self.major, self.minor)
    }

    /// Cached id of this type, if we've already looked. Distinguishes
    /// "never tried" (outer `None`) from "tried, unavailable" (inner
    /// `None`), so `device_id::read_id` knows not to re-read from the OS.
    pub fn cached_id(&self, idtype: IdType) -> Option<Option<&str>> {
        self.ids
            .iter()
            .find(|id| id.idtype == idtype)
            .map(|id| id.idname.as_deref())
    }

    pub fn cache_id(&mut self, idtype: IdType, idname: Option<String>) {
        if let Some(existing) = self.ids.iter_mut().find(|id| id.idtype == idtype) {
            existing.idname = idname;
        } else {
            self.ids.push(DevId { idtype, idname });
        }
    }
}

/// Process-wide arena of `Device`s, owned by the command `Context` and
/// dropped at command exit. All transient per-scan state lives here so a
/// scan's allocations disappear with the cache, not piecemeal.
#[derive(Debug, Default)]
pub struct DeviceCache {
    devices: Vec<Device>,
    by_devno: HashMap<(u64, u64), DeviceHandle>,
    by_name: HashMap<PathBuf, DeviceHandle>,
}

impl DeviceCache {
    pub fn new() -> DeviceCache {
        DeviceCache::default()
    }

    pub fn insert(&mut self, dev: Device) -> DeviceHandle {
        let devno = dev.devno();
        let name = dev.name.clone();
        let handle = DeviceHandle(self.devices.len());
        self.devices.push(dev);
        self.by_devno.insert(devno, handle);
        self.by_name.insert(name, handle);
        handle
    }

    pub fn get(&self, handle: DeviceHandle) -> &Device {
        &self.devices[handle.0]
    }

    pub fn get_mut(&mut self, handle: DeviceHandle) -> &mut Device {
        &mut self.devices[handle.0]
    }

    pub fn find_by_devno(&self, major: u64, minor: u64) -> Option<DeviceHandle> {
        self.by_devno.get(&(major, minor)).copied()
    }

    pub fn find_by_name(&self, path: &Path) -> Option<DeviceHandle> {
        self.by_name.get(path).copied()
    }

    /// Re-index a device whose current devname changed (a rename was
    /// detected). The old name becomes an alias.
    pub fn rename(&mut self, handle: DeviceHandle, new_name: PathBuf) {
        let old_name = {
            let dev = self.get_mut(handle);
            let old = dev.name.clone();
            dev.aliases.push(old.clone());
            dev.name = new_name.clone();
            old
        };
        self.by_name.remove(&old_name);
        self.by_name.insert(new_name, handle);
    }

    /// Drop a device from the cache entirely (Phase B's "drop that
    /// device from lvmcache" also implies dropping it here when a stale
    /// binding is found).
    pub fn remove(&mut self, handle: DeviceHandle) {
        let (devno, name) = {
            let dev = self.get(handle);
            (dev.devno(), dev.name.clone())
        };
        self.by_devno.remove(&devno);
        self.by_name.remove(&name);
        // The arena slot is left in place (tombstoned by absence from the
        // indexes) so existing handles never point at a different device.
    }

    pub fn iter(&self) -> impl Iterator<Item = (DeviceHandle, &Device)> {
        self.by_name
            .values()
            .copied()
            .map(move |h| (h, self.get(h)))
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_find() {
        let mut cache = DeviceCache::new();
        let h = cache.insert(Device::new(8, 0, "/dev/sda"));
        assert_eq!(cache.find_by_devno(8, 0), Some(h));
        assert_eq!(cache.find_by_name(Path::new("/dev/sda")), Some(h));
    }

    #[test]
    fn rename_tracks_alias_and_reindexes() {
        let mut cache = DeviceCache::new();
        let h = cache.insert(Device::new(8, 0, "/dev/sdb"));
        cache.rename(h, PathBuf::from("/dev/sdc"));
        assert_eq!(cache.find_by_name(Path::new("/dev/sdc")), Some(h));
        assert_eq!(cache.find_by_name(Path::new("/dev/sdb")), None);
        assert_eq!(cache.get(h).aliases, vec![PathBuf::from("/dev/sdb")]);
    }

    #[test]
    fn cached_id_distinguishes_untried_from_negative() {
        let mut dev = Device::new(8, 0, "/dev/sda");
        assert_eq!(dev.cached_id(IdType::SysWwid), None);
        dev.cache_id(IdType::SysWwid, None);
        assert_eq!(dev.cached_id(IdType::SysWwid), Some(None));
        dev.cache_id(IdType::SysWwid, Some("naa.123".to_string()));
        assert_eq!(dev.cached_id(IdType::SysWwid), Some(Some("naa.123")));
    }

    #[test]
    fn idtype_str_roundtrip() {
        for t in [
            IdType::SysWwid,
            IdType::WwidNaa,
            IdType::WwidEui,
            IdType::WwidT10,
            IdType::SysSerial,
            IdType::Devname,
            IdType::MpathUuid,
            IdType::CryptUuid,
            IdType::LvmlvUuid,
            IdType::MdUuid,
            IdType::LoopFile,
        ] {
            assert_eq!(IdType::from_str(t.as_str()), Some(t));
        }
    }
}
