// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The process-wide PV/VG cache: three hash maps keyed by fixed-width
//! identifiers, a vgname lock table, and the orphan VG that owns every
//! PV not currently claimed by a real VG.

use std::collections::HashMap;

use log::error;

use crate::device::DeviceHandle;
use crate::pvheader::PvArea;

/// Sentinel vgname for PVs not in any real VG, matching lvm2's
/// `ORPHAN_VG_NAME` convention (`#orphan_<format>`); this crate only
/// speaks the text format, so there is exactly one orphan VG.
pub const ORPHAN_VGNAME: &str = "#orphan_lvm2";

#[derive(Debug, Clone)]
pub struct PvInfo {
    pub pvid: String,
    pub device: DeviceHandle,
    pub device_size: u64,
    pub label_sector: u64,
    pub mdas: Vec<PvArea>,
    pub data_areas: Vec<PvArea>,
    pub bootloader_areas: Vec<PvArea>,
    pub vgname: String,
}

impl PvInfo {
    pub fn new(pvid: String, device: DeviceHandle, device_size: u64, label_sector: u64) -> PvInfo {
        PvInfo {
            pvid,
            device,
            device_size,
            label_sector,
            mdas: Vec::new(),
            data_areas: Vec::new(),
            bootloader_areas: Vec::new(),
            vgname: ORPHAN_VGNAME.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VgInfo {
    pub name: String,
    pub vgid: String,
    /// Metadata format handle, e.g. `"lvm2"`. Only the text format is
    /// implemented, but the field is kept distinct from a bool so a
    /// caller can reject a foreign format by name rather than by absence.
    pub format: String,
    pub seqno: u64,
    pub status: Vec<String>,
    pub pvids: Vec<String>,
    /// Parsed envelope of the VG's on-disk text record, once read via
    /// `vg::envelope_from_textmap`. `None` until a scan has actually
    /// fetched and parsed the metadata text for this VG.
    pub metadata: Option<crate::vg::VgEnvelope>,
}

impl VgInfo {
    fn new(name: String, vgid: String) -> VgInfo {
        VgInfo {
            name,
            vgid,
            format: "lvm2".to_string(),
            seqno: 0,
            status: Vec::new(),
            pvids: Vec::new(),
            metadata: None,
        }
    }
}

/// Which major a duplicate-PVID device belongs to, for the resolution
/// policy in `resolve_duplicate_pvid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MajorKind {
    Md,
    Dm,
    Other,
}

#[derive(Debug, Default)]
pub struct LvmCache {
    pvid_map: HashMap<String, PvInfo>,
    vgid_map: HashMap<String, String>, // vgid -> vgname, for the vginfos lookup
    vgname_map: HashMap<String, VgInfo>,
    lock_map: HashMap<String, u32>,
    /// Insertion order of vgnames, used to make "orphan VG last"
    /// iteration order cheap instead of re-sorting every call.
    vg_order: Vec<String>,
    /// Set once a duplicate PVID has been resolved by keeping a
    /// heuristic winner rather than a provably-correct one; forces the
    /// hints file to be emitted empty and blocks hint reuse.
    pub has_duplicate_devs: bool,
}

impl LvmCache {
    pub fn new() -> LvmCache {
        LvmCache::default()
    }

    pub fn pv(&self, pvid: &str) -> Option<&PvInfo> {
        self.pvid_map.get(pvid)
    }

    pub fn vg_by_name(&self, name: &str) -> Option<&VgInfo> {
        self.vgname_map.get(name)
    }

    pub fn vg_by_id(&self, vgid: &str) -> Option<&VgInfo> {
        self.vgid_map.get(vgid).and_then(|name| self.vgname_map.get(name))
    }

    fn find_or_create_vg(&mut self, name: &str, vgid: &str) -> &mut VgInfo {
        if !self.vgname_map.contains_key(name) {
            self.vgname_map
                .insert(name.to_string(), VgInfo::new(name.to_string(), vgid.to_string()));
            self.vgid_map.insert(vgid.to_string(), name.to_string());
            self.vg_order.push(name.to_string());
        }
        self.vgname_map.get_mut(name).unwrap()
    }

    /// Step through the cache-update protocol for a device whose PVID
    /// or VG attachment has changed.
    pub fn update_pv(&mut self, device: DeviceHandle, new_pvid: &str, vgname: &str, vgid: &str) {
        let old_pvid = self
            .pvid_map
            .iter()
            .find(|(_, info)| info.device == device)
            .map(|(pvid, _)| pvid.clone());

        if let Some(old) = &old_pvid {
            if old != new_pvid {
                self.remove_pv(old);
            }
        }

        let entry = self
            .pvid_map
            .entry(new_pvid.to_string())
            .or_insert_with(|| PvInfo::new(new_pvid.to_string(), device, 0, 0));
        entry.device = device;

        let old_vgname = entry.vgname.clone();
        if old_vgname != vgname {
            self.detach_pv_from_vg(new_pvid, &old_vgname);
            entry.vgname = vgname.to_string();
            let vg = self.find_or_create_vg(vgname, vgid);
            if !vg.pvids.contains(&new_pvid.to_string()) {
                vg.pvids.push(new_pvid.to_string());
            }
        }
    }

    /// Record a freshly-parsed VG envelope against its cache entry,
    /// updating seqno/format/status from the text record (the cache's
    /// own copy of these fields may be stale relative to what was just
    /// read off disk).
    pub fn set_metadata(&mut self, vgname: &str, envelope: crate::vg::VgEnvelope) {
        if let Some(vg) = self.vgname_map.get_mut(vgname) {
            vg.seqno = envelope.seqno;
            vg.format = envelope.format.clone();
            vg.status = envelope.status.clone();
            vg.metadata = Some(envelope);
        }
    }

    fn detach_pv_from_vg(&mut self, pvid: &str, vgname: &str) {
        let Some(vg) = self.vgname_map.get_mut(vgname) else {
            return;
        };
        vg.pvids.retain(|p| p != pvid);
        if vg.pvids.is_empty() && vgname != ORPHAN_VGNAME {
            let vgid = vg.vgid.clone();
            self.vgname_map.remove(vgname);
            self.vgid_map.remove(&vgid);
            self.vg_order.retain(|n| n != vgname);
        }
    }

    /// Drop a PV (and its VG, if it was that VG's last member) entirely,
    /// e.g. when the device-id matcher decides a binding is stale.
    pub fn remove_pv(&mut self, pvid: &str) {
        if let Some(info) = self.pvid_map.remove(pvid) {
            self.detach_pv_from_vg(pvid, &info.vgname);
        }
    }

    /// Duplicate-PVID resolution: prefer md-major, then dm-major, else
    /// keep the new device and log. Sets
    /// `has_duplicate_devs` unconditionally -- even the "obvious" md/dm
    /// preference is a heuristic, not a proof of which is real.
    pub fn resolve_duplicate_pvid(
        &mut self,
        pvid: &str,
        existing: (DeviceHandle, MajorKind),
        incoming: (DeviceHandle, MajorKind),
    ) -> DeviceHandle {
        self.has_duplicate_devs = true;

        let (existing_handle, existing_kind) = existing;
        let (incoming_handle, incoming_kind) = incoming;

        let winner = if existing_kind == MajorKind::Md && incoming_kind != MajorKind::Md {
            existing_handle
        } else if incoming_kind == MajorKind::Md && existing_kind != MajorKind::Md {
            incoming_handle
        } else if existing_kind == MajorKind::Dm && incoming_kind != MajorKind::Dm {
            existing_handle
        } else if incoming_kind == MajorKind::Dm && existing_kind != MajorKind::Dm {
            incoming_handle
        } else {
            error!(
                "duplicate PVID {} on devices with no major preference; keeping the newest",
                pvid
            );
            incoming_handle
        };

        if let Some(info) = self.pvid_map.get_mut(pvid) {
            info.device = winner;
        }
        winner
    }

    /// Intra-process reader/writer serialisation at vgname granularity.
    /// Nested calls for the same name succeed (the count is a simple
    /// holder tally, not an OS-level lock).
    pub fn lock_vgname(&mut self, vgname: &str) {
        *self.lock_map.entry(vgname.to_string()).or_insert(0) += 1;
    }

    pub fn unlock_vgname(&mut self, vgname: &str) {
        if let Some(count) = self.lock_map.get_mut(vgname) {
            *count -= 1;
            if *count == 0 {
                self.lock_map.remove(vgname);
            }
        }
    }

    pub fn is_vgname_locked(&self, vgname: &str) -> bool {
        self.lock_map.contains_key(vgname)
    }

    /// Iterate VGs in insertion order with the orphan VG forced last, so
    /// callers visiting in order always see real VGs first.
    pub fn vginfos(&self) -> impl Iterator<Item = &VgInfo> {
        let mut names: Vec<&String> = self.vg_order.iter().collect();
        names.sort_by_key(|n| n.as_str() == ORPHAN_VGNAME);
        names
            .into_iter()
            .filter_map(move |n| self.vgname_map.get(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(i: usize) -> DeviceHandle {
        // DeviceHandle's field is private; build one indirectly via a
        // DeviceCache so tests stay within the module's own API surface.
        let mut cache = crate::device::DeviceCache::new();
        for n in 0..=i {
            cache.insert(crate::device::Device::new(8, n as u64, format!("/dev/sd{}", n)));
        }
        cache.find_by_devno(8, i as u64).unwrap()
    }

    #[test]
    fn update_pv_creates_vg_and_attaches() {
        let mut cache = LvmCache::new();
        cache.update_pv(h(0), "pvid1", "myvg", "vgid1");
        assert_eq!(cache.pv("pvid1").unwrap().vgname, "myvg");
        assert_eq!(cache.vg_by_name("myvg").unwrap().pvids, vec!["pvid1"]);
    }

    #[test]
    fn detaching_last_pv_drops_the_vg() {
        let mut cache = LvmCache::new();
        cache.update_pv(h(0), "pvid1", "myvg", "vgid1");
        cache.update_pv(h(0), "pvid1", ORPHAN_VGNAME, "");
        assert!(cache.vg_by_name("myvg").is_none());
        assert_eq!(cache.pv("pvid1").unwrap().vgname, ORPHAN_VGNAME);
    }

    #[test]
    fn orphan_vg_iterates_last() {
        let mut cache = LvmCache::new();
        cache.update_pv(h(0), "pvid-orphan", ORPHAN_VGNAME, "");
        cache.update_pv(h(1), "pvid1", "myvg", "vgid1");
        let names: Vec<&str> = cache.vginfos().map(|vg| vg.name.as_str()).collect();
        assert_eq!(names, vec!["myvg", ORPHAN_VGNAME]);
    }

    #[test]
    fn duplicate_pvid_prefers_md_major() {
        let mut cache = LvmCache::new();
        cache.update_pv(h(0), "dup", "vg", "vgid1");
        let winner = cache.resolve_duplicate_pvid(
            "dup",
            (h(0), MajorKind::Other),
            (h(1), MajorKind::Md),
        );
        assert_eq!(winner, h(1));
        assert!(cache.has_duplicate_devs);
    }

    #[test]
    fn duplicate_pvid_with_no_preference_keeps_incoming_and_logs() {
        let mut cache = LvmCache::new();
        cache.update_pv(h(0), "dup", "vg", "vgid1");
        let winner = cache.resolve_duplicate_pvid(
            "dup",
            (h(0), MajorKind::Other),
            (h(1), MajorKind::Other),
        );
        assert_eq!(winner, h(1));
    }

    #[test]
    fn vgname_lock_nests_within_one_process() {
        let mut cache = LvmCache::new();
        cache.lock_vgname("myvg");
        cache.lock_vgname("myvg");
        assert!(cache.is_vgname_locked("myvg"));
        cache.unlock_vgname("myvg");
        assert!(cache.is_vgname_locked("myvg"));
        cache.unlock_vgname("myvg");
        assert!(!cache.is_vgname_locked("myvg"));
    }
}
