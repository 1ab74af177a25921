// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Device-ID matcher: pairs devices-file `UseEntry` rows with devices
//! actually present on the system, in four phases.

use std::collections::{HashMap, HashSet};

use crate::device::{Device, DeviceCache, DeviceHandle};
use crate::device_id::{read_id, IdSource};
use crate::devices_file::{DevicesFile, UseEntry};
use crate::error::Result;

/// Mirrors the `search_for_devnames` config knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPolicy {
    None,
    Auto,
    All,
}

/// Reads a device's PVID off its label. Kept as a trait so Phase C/D's
/// "read a candidate's label" step stays out of this module's direct
/// concern, the same way `IdSource` keeps raw id reads out of the
/// device-id matcher.
pub trait LabelSource {
    fn read_pvid(&mut self, dev: &Device) -> Result<Option<String>>;
}

/// Accumulated matcher state across phases A-D, returned to the caller
/// so it can decide what to rewrite in the devices file and what to
/// drop from `lvmcache`.
#[derive(Debug, Default)]
pub struct MatchResult {
    /// Devices-file entry index -> bound device.
    pub bound: HashMap<usize, DeviceHandle>,
    /// Entry indices whose PVID disagreed with the bound device's and
    /// were rewritten from the on-disk value (`device_ids_invalid`).
    pub rewritten_pvid: Vec<usize>,
    /// Entry indices queued for phase D (ambiguous `SYS_SERIAL` match).
    pub check_serial: Vec<usize>,
    /// Device handles that should be dropped from lvmcache because a
    /// stale binding no longer holds.
    pub drop_from_cache: Vec<DeviceHandle>,
    pub refresh_trigger: bool,
}

/// Phase A: bind each entry to a device, first by devname, then (for
/// stable-idtype entries) by scanning every device for the wanted id.
/// DEVNAME-type entries are matched last and are provisional.
pub fn phase_a_match(
    devices_file: &DevicesFile,
    cache: &mut DeviceCache,
    source: &dyn IdSource,
) -> MatchResult {
    let mut result = MatchResult::default();

    // Stable-idtype entries first.
    for (i, entry) in devices_file.entries.iter().enumerate() {
        if entry.idtype == crate::device::IdType::Devname {
            continue;
        }
        if let Some(h) = bind_stable_entry(entry, cache, source) {
            result.bound.insert(i, h);
        }
    }

    // DEVNAME entries: simple name lookup, provisional until Phase B.
    for (i, entry) in devices_file.entries.iter().enumerate() {
        if entry.idtype != crate::device::IdType::Devname {
            continue;
        }
        if result.bound.contains_key(&i) {
            continue;
        }
        if let Some(h) = cache.find_by_name(&entry.devname) {
            result.bound.insert(i, h);
        }
    }

    result
}

fn bind_stable_entry(
    entry: &UseEntry,
    cache: &mut DeviceCache,
    source: &dyn IdSource,
) -> Option<DeviceHandle> {
    // Cheap path: the devname still carries the same id.
    if let Some(h) = cache.find_by_name(&entry.devname) {
        let dev = cache.get_mut(h);
        if read_id(source, dev, entry.idtype).as_deref() == Some(entry.idname.as_str()) {
            return Some(h);
        }
    }

    // Slow path: scan every device, reading (and caching) the id lazily.
    let handles: Vec<DeviceHandle> = cache.iter().map(|(h, _)| h).collect();
    for h in handles {
        let dev = cache.get_mut(h);
        if read_id(source, dev, entry.idtype).as_deref() == Some(entry.idname.as_str()) {
            return Some(h);
        }
    }

    None
}

/// Phase B: reconcile bindings against `Device.pvid`, which the caller
/// must have already populated via a label scan.
pub fn phase_b_validate(
    devices_file: &mut DevicesFile,
    cache: &mut DeviceCache,
    result: &mut MatchResult,
) {
    let entry_count = devices_file.entries.len();
    let mut new_bindings = result.bound.clone();

    for i in 0..entry_count {
        let is_devname = devices_file.entries[i].idtype == crate::device::IdType::Devname;
        let Some(&handle) = result.bound.get(&i) else {
            continue;
        };
        let dev_pvid = cache.get(handle).pvid.clone();

        if !is_devname {
            if dev_pvid != devices_file.entries[i].pvid {
                if devices_file.entries[i].idtype == crate::device::IdType::SysSerial {
                    result.check_serial.push(i);
                    new_bindings.remove(&i);
                } else {
                    devices_file.entries[i].pvid = dev_pvid;
                    result.rewritten_pvid.push(i);
                }
            }
            continue;
        }

        // DEVNAME entry: PVID is authoritative. If some *other* live
        // device now carries this PVID, re-bind to it.
        if dev_pvid != devices_file.entries[i].pvid {
            let wanted = devices_file.entries[i].pvid.clone();
            if let Some(other) = cache
                .iter()
                .find(|(_, d)| d.pvid == wanted)
                .map(|(h, _)| h)
            {
                devices_file.entries[i].idname =
                    cache.get(other).name.to_string_lossy().into_owned();
                devices_file.entries[i].devname = cache.get(other).name.clone();
                new_bindings.insert(i, other);
            } else {
                new_bindings.remove(&i);
                result.drop_from_cache.push(handle);
            }
        }
    }

    result.bound = new_bindings;
    dedupe_devname_entries(devices_file);
}

/// Duplicate DEVNAME entries sharing an idname where one has a PVID and
/// the other doesn't: delete the PVID-less duplicate.
fn dedupe_devname_entries(devices_file: &mut DevicesFile) {
    let mut seen_with_pvid: HashSet<String> = HashSet::new();
    for entry in &devices_file.entries {
        if entry.idtype == crate::device::IdType::Devname && !entry.pvid.is_empty() {
            seen_with_pvid.insert(entry.idname.clone());
        }
    }
    devices_file.entries.retain(|entry| {
        !(entry.idtype == crate::device::IdType::Devname
            && entry.pvid.is_empty()
            && seen_with_pvid.contains(&entry.idname))
    });
}

/// Breadcrumb written to `.../run/lvm/searched_devnames`: lets the next
/// command skip Phase C entirely when nothing that would change the
/// outcome has changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchedDevnamesBreadcrumb {
    pub wanted_count: usize,
    pub wanted_hash: u32,
    pub candidate_count: usize,
    pub candidate_hash: u32,
}

fn hash_strs<'a>(items: impl Iterator<Item = &'a str>) -> u32 {
    let mut sorted: Vec<&str> = items.collect();
    sorted.sort_unstable();
    crate::bytes::crc32_calc(sorted.join("\n").as_bytes())
}

impl SearchedDevnamesBreadcrumb {
    pub fn compute<'a>(
        wanted_pvids: impl Iterator<Item = &'a str>,
        candidate_devnames: impl Iterator<Item = &'a str>,
    ) -> SearchedDevnamesBreadcrumb {
        let wanted: Vec<&str> = wanted_pvids.collect();
        let candidates: Vec<&str> = candidate_devnames.collect();
        SearchedDevnamesBreadcrumb {
            wanted_count: wanted.len(),
            wanted_hash: hash_strs(wanted.into_iter()),
            candidate_count: candidates.len(),
            candidate_hash: hash_strs(candidates.into_iter()),
        }
    }
}

/// Phase C: for entries still unbound (or any entry, if `refresh_trigger`
/// is set), scan unbound candidate devices for a matching PVID.
pub fn phase_c_search(
    devices_file: &mut DevicesFile,
    cache: &mut DeviceCache,
    result: &mut MatchResult,
    policy: SearchPolicy,
    id_source: &dyn IdSource,
    labels: &mut dyn LabelSource,
    already_searched: Option<SearchedDevnamesBreadcrumb>,
) -> Result<Option<SearchedDevnamesBreadcrumb>> {
    let wanted: Vec<(usize, String)> = devices_file
        .entries
        .iter()
        .enumerate()
        .filter(|(i, _)| !result.bound.contains_key(i) || result.refresh_trigger)
        .map(|(i, e)| (i, e.pvid.clone()))
        .collect();

    if wanted.is_empty() {
        return Ok(None);
    }

    let bound_handles: HashSet<DeviceHandle> = result.bound.values().copied().collect();
    let mut candidates: Vec<DeviceHandle> = cache
        .iter()
        .filter(|(h, dev)| {
            !bound_handles.contains(h)
                && dev
                    .flags
                    .contains(crate::device::DeviceFlags::FILTER_NODATA)
                && (policy != SearchPolicy::Auto || !has_any_stable_id(id_source, dev))
        })
        .map(|(h, _)| h)
        .collect();
    candidates.sort();

    if policy == SearchPolicy::None {
        return Ok(None);
    }

    let wanted_pvids: Vec<&str> = wanted.iter().map(|(_, p)| p.as_str()).collect();
    let candidate_names: Vec<String> = candidates
        .iter()
        .map(|h| cache.get(*h).name.to_string_lossy().into_owned())
        .collect();
    let breadcrumb = SearchedDevnamesBreadcrumb::compute(
        wanted_pvids.iter().copied(),
        candidate_names.iter().map(|s| s.as_str()),
    );

    if Some(breadcrumb) == already_searched {
        return Ok(Some(breadcrumb));
    }

    let wanted_set: HashMap<&str, usize> = wanted.iter().map(|(i, p)| (p.as_str(), *i)).collect();

    for h in &candidates {
        let pvid = {
            let dev = cache.get(*h);
            labels.read_pvid(dev)?
        };
        let Some(pvid) = pvid else { continue };
        if let Some(&entry_idx) = wanted_set.get(pvid.as_str()) {
            let dev = cache.get_mut(*h);
            let (idtype, idname) = crate::device_id::read_preferred_id(id_source, dev);
            let entry = &mut devices_file.entries[entry_idx];
            entry.idtype = idtype;
            entry.idname = idname;
            entry.devname = dev.name.clone();
            result.bound.insert(entry_idx, *h);

            if result.refresh_trigger {
                // PRODUCT_UUID/HOSTNAME are rewritten by the caller once
                // it observes `refresh_trigger` was the only reason this
                // entry was revisited; nothing further to do here.
            }
        }
    }

    Ok(Some(breadcrumb))
}

fn has_any_stable_id(source: &dyn IdSource, dev: &Device) -> bool {
    use crate::device::IdType::*;
    [SysWwid, WwidNaa, WwidEui, WwidT10, SysSerial, MpathUuid, CryptUuid, LvmlvUuid, MdUuid]
        .iter()
        .any(|t| dev.cached_id(*t).flatten().is_some() || {
            let mut d = dev.clone();
            read_id(source, &mut d, *t).is_some()
        })
}

/// Phase D: for entries queued on `check_serial`, enumerate every
/// device (not just ones in the devices file) whose serial equals the
/// suspect idname, read each candidate's PVID, and accept a unique
/// match.
pub fn phase_d_serial_disambiguation(
    devices_file: &mut DevicesFile,
    cache: &mut DeviceCache,
    result: &mut MatchResult,
    id_source: &dyn IdSource,
    labels: &mut dyn LabelSource,
) -> Result<()> {
    let queued = std::mem::take(&mut result.check_serial);

    for entry_idx in queued {
        let wanted_serial = devices_file.entries[entry_idx].idname.clone();
        let wanted_pvid = devices_file.entries[entry_idx].pvid.clone();

        let handles: Vec<DeviceHandle> = cache.iter().map(|(h, _)| h).collect();
        let mut serial_matches = Vec::new();
        for h in handles {
            let dev = cache.get_mut(h);
            if read_id(id_source, dev, crate::device::IdType::SysSerial).as_deref()
                == Some(wanted_serial.as_str())
            {
                serial_matches.push(h);
            }
        }

        if serial_matches.len() != 1 {
            // Ambiguous or absent: leave unbound for a future command.
            for h in &serial_matches {
                result.drop_from_cache.push(*h);
            }
            continue;
        }

        let h = serial_matches[0];
        let pvid = {
            let dev = cache.get(h);
            labels.read_pvid(dev)?
        };

        match pvid {
            Some(pvid) if pvid == wanted_pvid => {
                result.bound.insert(entry_idx, h);
            }
            Some(pvid) => {
                // The device was re-made under the same serial: accept
                // its new PVID since it's the sole serial match.
                devices_file.entries[entry_idx].pvid = pvid;
                result.bound.insert(entry_idx, h);
                result.rewritten_pvid.push(entry_idx);
            }
            None => {
                result.drop_from_cache.push(h);
            }
        }
    }

    Ok(())
}
