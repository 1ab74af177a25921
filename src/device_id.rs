// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Device identifier catalogue.
//!
//! Reading the *raw* id off a device (an ioctl, a sysfs file, a VPD page)
//! is out of scope -- only the parsed/canonicalised output and the
//! priority order over it are. Callers supply an `IdSource` that already
//! knows how to fetch each id type; this module only canonicalises,
//! prioritises and caches.

use crate::device::{Device, IdType};

/// Abstracts "read this id type off this device" so the catalogue's
/// priority and canonicalisation logic can be tested without touching
/// real sysfs/ioctl surfaces, and so a caller can supply its own reader
/// on top of the NVMe/VPD/sysfs parsers named out of scope here.
pub trait IdSource {
    /// `major` is the device-mapper major number on this system, if the
    /// caller knows it (used to decide whether to look for dm-uuids).
    fn dm_major(&self) -> Option<u64>;
    fn loop_major(&self) -> Option<u64>;
    fn md_major(&self) -> Option<u64>;

    fn dm_uuid(&self, dev: &Device) -> Option<String>;
    fn loop_backing_file(&self, dev: &Device) -> Option<String>;
    fn md_uuid(&self, dev: &Device) -> Option<String>;
    fn sys_wwid(&self, dev: &Device) -> Option<String>;
    fn sys_serial(&self, dev: &Device) -> Option<String>;
    /// Already-rendered WWIDs, e.g. from VPD page 0x83 / NVMe
    /// descriptors: `"naa.…"`, `"eui.…"`, `"t10.…"`, `"uuid.…"`.
    fn wwid_naa(&self, dev: &Device) -> Option<String>;
    fn wwid_eui(&self, dev: &Device) -> Option<String>;
    fn wwid_t10(&self, dev: &Device) -> Option<String>;
}

/// A VPD page 0x83 descriptor, already split into type and payload by
/// the (out-of-scope) VPD reader. `render()` applies the id-type
/// rendering rules used across the whole catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vpd83Descriptor<'a> {
    T10(&'a str),
    Eui(&'a [u8]),
    Naa(&'a [u8]),
    /// Type 8 (SCSI name string): treated as NAA/EUI if it begins with
    /// that prefix (lower-cased), else passed through.
    ScsiName(&'a str),
}

impl<'a> Vpd83Descriptor<'a> {
    pub fn render(self) -> String {
        match self {
            Vpd83Descriptor::T10(text) => format!("t10.{}", text),
            Vpd83Descriptor::Eui(bytes) => format!("eui.{}", hex(bytes)),
            Vpd83Descriptor::Naa(bytes) => format!("naa.{}", hex(bytes)),
            Vpd83Descriptor::ScsiName(s) => {
                let lower = s.to_ascii_lowercase();
                if lower.starts_with("naa.") || lower.starts_with("eui.") {
                    lower
                } else {
                    s.to_string()
                }
            }
        }
    }
}

/// NVMe identify-namespace descriptors, rendered with the same
/// `"type.value"` convention as the VPD descriptors above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvmeDescriptor<'a> {
    Uuid(&'a [u8; 16]),
    Eui64(&'a [u8; 8]),
    Nguid(&'a [u8; 16]),
}

impl<'a> NvmeDescriptor<'a> {
    pub fn render(self) -> String {
        match self {
            NvmeDescriptor::Uuid(bytes) => format!("uuid.{}", dashed_hex(bytes)),
            NvmeDescriptor::Eui64(bytes) => format!("eui.{}", hex(bytes)),
            NvmeDescriptor::Nguid(bytes) => format!("eui.{}", hex(bytes)),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn dashed_hex(bytes: &[u8; 16]) -> String {
    let h = hex(bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &h[0..8],
        &h[8..12],
        &h[12..16],
        &h[16..20],
        &h[20..32]
    )
}

/// General canonicalisation: drop non-ASCII/non-printable/`"` bytes,
/// trim leading/trailing spaces, then replace each remaining internal
/// space with `_`.
pub fn canonicalize_general(raw: &str) -> String {
    let filtered: String = raw
        .chars()
        .filter(|c| c.is_ascii() && !c.is_ascii_control() && *c != '"')
        .collect();
    filtered.trim().replace(' ', "_")
}

/// T10 canonicalisation: like general, but runs of spaces collapse to a
/// single `_` rather than one `_` per space.
pub fn canonicalize_t10(raw: &str) -> String {
    let filtered: String = raw
        .chars()
        .filter(|c| c.is_ascii() && !c.is_ascii_control() && *c != '"')
        .collect();
    let trimmed = filtered.trim();
    let mut out = String::with_capacity(trimmed.len());
    let mut in_run = false;
    for c in trimmed.chars() {
        if c == ' ' {
            if !in_run {
                out.push('_');
                in_run = true;
            }
        } else {
            out.push(c);
            in_run = false;
        }
    }
    out
}

/// Migrates an IDNAME read back from an old devices file written under
/// over-zealous quoting rules: strip leading/trailing `_`, and for T10
/// WWIDs collapse repeated `_` to one. Invisible to the caller -- applied
/// transparently on read, never on write.
pub fn migrate_legacy_idname(idtype: IdType, idname: &str) -> String {
    let stripped = idname.trim_matches('_');
    if idtype == IdType::WwidT10 && stripped.starts_with("t10") {
        let mut out = String::with_capacity(stripped.len());
        let mut prev_underscore = false;
        for c in stripped.chars() {
            if c == '_' {
                if !prev_underscore {
                    out.push(c);
                }
                prev_underscore = true;
            } else {
                out.push(c);
                prev_underscore = false;
            }
        }
        out
    } else {
        stripped.to_string()
    }
}

fn canonicalize_for(idtype: IdType, raw: &str) -> String {
    if idtype == IdType::WwidT10 {
        canonicalize_t10(raw)
    } else {
        canonicalize_general(raw)
    }
}

/// The "unfortunate QEMU" exception: a WWID containing the literal
/// substring `"QEMU"` is treated as absent when selecting a stable id,
/// so old devices files that fell through to DEVNAME for QEMU-backed
/// disks keep doing so.
fn is_qemu_wwid(idname: &str) -> bool {
    idname.contains("QEMU")
}

/// Read (and cache) a single id type off a device. Returns `None` both
/// when the type was never available and when it was already tried and
/// cached as unavailable -- callers that need to tell "unavailable" from
/// "untried" should consult `Device::cached_id` first.
pub fn read_id(source: &dyn IdSource, dev: &mut Device, idtype: IdType) -> Option<String> {
    if let Some(cached) = dev.cached_id(idtype) {
        return cached.map(|s| s.to_string());
    }

    let raw = match idtype {
        IdType::SysWwid => source.sys_wwid(dev),
        IdType::WwidNaa => source.wwid_naa(dev),
        IdType::WwidEui => source.wwid_eui(dev),
        IdType::WwidT10 => source.wwid_t10(dev),
        IdType::SysSerial => source.sys_serial(dev),
        IdType::Devname => Some(dev.name.to_string_lossy().into_owned()),
        IdType::MpathUuid | IdType::CryptUuid | IdType::LvmlvUuid => {
            source.dm_uuid(dev).and_then(|u| strip_dm_prefix(idtype, &u))
        }
        IdType::MdUuid => source.md_uuid(dev),
        IdType::LoopFile => source.loop_backing_file(dev).filter(|s| s != "(deleted)"),
    };

    let canon = raw.map(|r| canonicalize_for(idtype, &r));
    dev.cache_id(idtype, canon.clone());
    canon
}

/// dm-UUIDs may be wrapped in a `"part<N>-<prefix>"` kpartx envelope;
/// strip it before checking the prefix. Returns `None` if the (stripped)
/// uuid doesn't carry the prefix this idtype is looking for.
fn strip_dm_prefix(idtype: IdType, dm_uuid: &str) -> Option<String> {
    let body = match dm_uuid.find('-') {
        Some(dash) if dm_uuid[..dash].starts_with("part") => &dm_uuid[dash + 1..],
        _ => dm_uuid,
    };
    let prefix = match idtype {
        IdType::MpathUuid => "mpath-",
        IdType::CryptUuid => "CRYPT-",
        IdType::LvmlvUuid => "LVM-",
        _ => return None,
    };
    body.strip_prefix(prefix).map(|s| s.to_string())
}

/// The device-id priority order: first match wins.
pub fn read_preferred_id(source: &dyn IdSource, dev: &mut Device) -> (IdType, String) {
    if Some(dev.major) == source.dm_major() {
        for idtype in [IdType::MpathUuid, IdType::CryptUuid, IdType::LvmlvUuid] {
            if let Some(name) = read_id(source, dev, idtype) {
                return (idtype, name);
            }
        }
    } else if Some(dev.major) == source.loop_major() {
        if let Some(name) = read_id(source, dev, IdType::LoopFile) {
            return (IdType::LoopFile, name);
        }
    } else if Some(dev.major) == source.md_major() {
        if let Some(name) = read_id(source, dev, IdType::MdUuid) {
            return (IdType::MdUuid, name);
        }
    } else {
        for idtype in [
            IdType::SysWwid,
            IdType::WwidNaa,
            IdType::WwidEui,
            IdType::WwidT10,
            IdType::SysSerial,
        ] {
            if let Some(name) = read_id(source, dev, idtype) {
                if is_wwid_type(idtype) && is_qemu_wwid(&name) {
                    continue;
                }
                return (idtype, name);
            }
        }
    }

    (
        IdType::Devname,
        read_id(source, dev, IdType::Devname).expect("devname is always available"),
    )
}

fn is_wwid_type(idtype: IdType) -> bool {
    matches!(
        idtype,
        IdType::SysWwid | IdType::WwidNaa | IdType::WwidEui | IdType::WwidT10
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct FakeSource {
        dm_major: Option<u64>,
        loop_major: Option<u64>,
        md_major: Option<u64>,
        wwid: Option<String>,
        serial: Option<String>,
        dm_uuid: Option<String>,
    }

    impl Default for FakeSource {
        fn default() -> Self {
            FakeSource {
                dm_major: Some(253),
                loop_major: Some(7),
                md_major: Some(9),
                wwid: None,
                serial: None,
                dm_uuid: None,
            }
        }
    }

    impl IdSource for FakeSource {
        fn dm_major(&self) -> Option<u64> {
            self.dm_major
        }
        fn loop_major(&self) -> Option<u64> {
            self.loop_major
        }
        fn md_major(&self) -> Option<u64> {
            self.md_major
        }
        fn dm_uuid(&self, _dev: &Device) -> Option<String> {
            self.dm_uuid.clone()
        }
        fn loop_backing_file(&self, _dev: &Device) -> Option<String> {
            None
        }
        fn md_uuid(&self, _dev: &Device) -> Option<String> {
            None
        }
        fn sys_wwid(&self, _dev: &Device) -> Option<String> {
            self.wwid.clone()
        }
        fn sys_serial(&self, _dev: &Device) -> Option<String> {
            self.serial.clone()
        }
        fn wwid_naa(&self, _dev: &Device) -> Option<String> {
            None
        }
        fn wwid_eui(&self, _dev: &Device) -> Option<String> {
            None
        }
        fn wwid_t10(&self, _dev: &Device) -> Option<String> {
            None
        }
    }

    fn dev(major: u64) -> Device {
        Device::new(major, 0, PathBuf::from("/dev/sda"))
    }

    #[test]
    fn general_canonicalization_drops_quotes_and_collapses_edges() {
        assert_eq!(canonicalize_general("  foo bar \"baz\"  "), "foo_bar_baz");
    }

    #[test]
    fn t10_canonicalization_collapses_runs() {
        assert_eq!(canonicalize_t10("t10   foo   bar"), "t10_foo_bar");
        assert_eq!(canonicalize_general("t10   foo   bar"), "t10___foo___bar");
    }

    #[test]
    fn migrate_legacy_idname_strips_edges_and_collapses_t10_runs() {
        assert_eq!(
            migrate_legacy_idname(IdType::WwidT10, "_t10_foo__bar_"),
            "t10_foo_bar"
        );
        assert_eq!(
            migrate_legacy_idname(IdType::SysWwid, "_naa.123_"),
            "naa.123"
        );
    }

    #[test]
    fn qemu_wwid_falls_through_to_devname() {
        let mut source = FakeSource::default();
        source.dm_major = None;
        source.loop_major = None;
        source.md_major = None;
        source.wwid = Some("QEMU HARDDISK".to_string());
        let mut d = dev(8);
        let (idtype, _) = read_preferred_id(&source, &mut d);
        assert_eq!(idtype, IdType::Devname);
    }

    #[test]
    fn non_qemu_wwid_wins_over_devname() {
        let mut source = FakeSource::default();
        source.dm_major = None;
        source.loop_major = None;
        source.md_major = None;
        source.wwid = Some("naa.5000abcdef".to_string());
        let mut d = dev(8);
        let (idtype, name) = read_preferred_id(&source, &mut d);
        assert_eq!(idtype, IdType::SysWwid);
        assert_eq!(name, "naa.5000abcdef");
    }

    #[test]
    fn dm_major_prefers_mpath_then_crypt_then_lvmlv() {
        let mut source = FakeSource::default();
        source.dm_uuid = Some("CRYPT-LUKS2-1234-name".to_string());
        let mut d = dev(253);
        let (idtype, name) = read_preferred_id(&source, &mut d);
        assert_eq!(idtype, IdType::CryptUuid);
        assert_eq!(name, "LUKS2-1234-name");
    }

    #[test]
    fn kpartx_envelope_is_stripped_before_prefix_check() {
        let mut source = FakeSource::default();
        source.dm_uuid = Some("part1-mpath-abcdef".to_string());
        let mut d = dev(253);
        let (idtype, name) = read_preferred_id(&source, &mut d);
        assert_eq!(idtype, IdType::MpathUuid);
        assert_eq!(name, "abcdef");
    }

    #[test]
    fn read_id_is_cached_and_not_rereads() {
        let source = FakeSource::default();
        let mut d = dev(8);
        d.cache_id(IdType::SysSerial, Some("S/N-1".to_string()));
        // source.serial is None, but the cached value must win.
        assert_eq!(
            read_id(&source, &mut d, IdType::SysSerial),
            Some("S/N-1".to_string())
        );
    }

    #[test]
    fn vpd_descriptor_rendering() {
        assert_eq!(Vpd83Descriptor::T10("ATA FOO").render(), "t10.ATA FOO");
        assert_eq!(Vpd83Descriptor::Naa(&[0x50, 0x00]).render(), "naa.5000");
        assert_eq!(
            Vpd83Descriptor::ScsiName("NAA.5000ABCDEF").render(),
            "naa.5000abcdef"
        );
    }

    #[test]
    fn nvme_uuid_rendering_is_dashed() {
        let bytes = [
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef,
        ];
        let rendered = NvmeDescriptor::Uuid(&bytes).render();
        assert_eq!(rendered, "uuid.01234567-89ab-cdef-0123-456789abcdef");
    }
}
