// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The hints file: narrows the device set a command must open and
//! scan. Non-authoritative -- any mismatch with the current command's
//! view of the world falls back to a full scan.

use std::fs;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::fsync;

use crate::bytes::crc32_calc;
use crate::error::{Error, Result};

pub const HINTS_VERSION_MAJOR: u32 = 1;
pub const HINTS_VERSION_MINOR: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HintEntry {
    pub name: String,
    pub pvid: String,
    pub major: u64,
    pub minor: u64,
    /// `None` renders as `-`: this PV is not (yet known to be) in a VG.
    pub vgname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HintsFile {
    pub version_major: u32,
    pub version_minor: u32,
    pub global_filter: String,
    pub filter: String,
    pub scan_lvs: bool,
    pub devs_hash: u32,
    pub devs_count: usize,
    pub entries: Vec<HintEntry>,
}

impl HintsFile {
    pub fn new(global_filter: String, filter: String, scan_lvs: bool) -> HintsFile {
        HintsFile {
            version_major: HINTS_VERSION_MAJOR,
            version_minor: HINTS_VERSION_MINOR,
            global_filter,
            filter,
            scan_lvs,
            devs_hash: 0,
            devs_count: 0,
            entries: Vec::new(),
        }
    }

    /// Stamp `devs_hash`/`devs_count` from the currently-visible,
    /// filter-passing device names. Must be called before `serialize`
    /// with the same name set the reader will later recompute.
    pub fn stamp_devs_hash<'a>(&mut self, names: impl Iterator<Item = &'a str>) {
        let mut sorted: Vec<&str> = names.collect();
        sorted.sort_unstable();
        self.devs_count = sorted.len();
        self.devs_hash = crc32_calc(sorted.join("\n").as_bytes());
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "hints_version: {}.{}\n",
            self.version_major, self.version_minor
        ));
        out.push_str(&format!("global_filter:{}\n", self.global_filter));
        out.push_str(&format!("filter:{}\n", self.filter));
        out.push_str(&format!("scan_lvs:{}\n", self.scan_lvs as u8));
        out.push_str(&format!("devs_hash: {} {}\n", self.devs_hash, self.devs_count));
        for e in &self.entries {
            out.push_str(&format!(
                "scan:{} pvid:{} devn:{}:{} vg:{}\n",
                e.name,
                e.pvid,
                e.major,
                e.minor,
                e.vgname.as_deref().unwrap_or("-")
            ));
        }
        out
    }

    pub fn parse(text: &str) -> Result<HintsFile> {
        let mut version_major = None;
        let mut version_minor = None;
        let mut global_filter = String::new();
        let mut filter = String::new();
        let mut scan_lvs = false;
        let mut devs_hash = 0;
        let mut devs_count = 0;
        let mut entries = Vec::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(v) = line.strip_prefix("hints_version:") {
                let v = v.trim();
                let (maj, min) = v
                    .split_once('.')
                    .ok_or_else(|| Error::integrity(format!("malformed hints_version {:?}", v)))?;
                version_major = Some(
                    maj.parse::<u32>()
                        .map_err(|_| Error::integrity("non-numeric hints_version major"))?,
                );
                version_minor = Some(
                    min.parse::<u32>()
                        .map_err(|_| Error::integrity("non-numeric hints_version minor"))?,
                );
            } else if let Some(v) = line.strip_prefix("global_filter:") {
                global_filter = v.to_string();
            } else if let Some(v) = line.strip_prefix("filter:") {
                filter = v.to_string();
            } else if let Some(v) = line.strip_prefix("scan_lvs:") {
                scan_lvs = v.trim() == "1";
            } else if let Some(v) = line.strip_prefix("devs_hash:") {
                let mut parts = v.trim().split_whitespace();
                devs_hash = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| Error::integrity("malformed devs_hash line"))?;
                devs_count = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| Error::integrity("malformed devs_hash line"))?;
            } else if let Some(v) = line.strip_prefix("scan:") {
                entries.push(parse_scan_line(v)?);
            }
        }

        Ok(HintsFile {
            version_major: version_major
                .ok_or_else(|| Error::integrity("hints file missing hints_version"))?,
            version_minor: version_minor.unwrap_or(0),
            global_filter,
            filter,
            scan_lvs,
            devs_hash,
            devs_count,
            entries,
        })
    }

    /// Validate against the current command's view. Returns `true` if
    /// the hints are usable as-is. Any difference here means "reject
    /// the whole file, do a full scan" -- hints are an optimisation,
    /// never an authority.
    pub fn is_valid_for<'a>(
        &self,
        global_filter: &str,
        filter: &str,
        scan_lvs: bool,
        current_names: impl Iterator<Item = &'a str>,
    ) -> bool {
        if self.version_major > HINTS_VERSION_MAJOR {
            return false;
        }
        if self.global_filter != global_filter || self.filter != filter {
            return false;
        }
        if self.scan_lvs != scan_lvs {
            return false;
        }
        let mut sorted: Vec<&str> = current_names.collect();
        sorted.sort_unstable();
        let hash = crc32_calc(sorted.join("\n").as_bytes());
        self.devs_count == sorted.len() && self.devs_hash == hash
    }
}

fn parse_scan_line(v: &str) -> Result<HintEntry> {
    let mut name = None;
    let mut pvid = None;
    let mut major = None;
    let mut minor = None;
    let mut vgname = None;

    let mut rest = v.trim();
    // The scan name itself isn't `key:value` -- it's the first token.
    if let Some((first, tail)) = rest.split_once(' ') {
        name = Some(first.to_string());
        rest = tail;
    } else {
        name = Some(rest.to_string());
        rest = "";
    }

    for field in rest.split_whitespace() {
        if let Some(v) = field.strip_prefix("pvid:") {
            pvid = Some(v.to_string());
        } else if let Some(v) = field.strip_prefix("devn:") {
            let (maj, min) = v
                .split_once(':')
                .ok_or_else(|| Error::integrity(format!("malformed devn field {:?}", v)))?;
            major = Some(
                maj.parse()
                    .map_err(|_| Error::integrity("non-numeric devn major"))?,
            );
            minor = Some(
                min.parse()
                    .map_err(|_| Error::integrity("non-numeric devn minor"))?,
            );
        } else if let Some(v) = field.strip_prefix("vg:") {
            vgname = if v == "-" { None } else { Some(v.to_string()) };
        }
    }

    Ok(HintEntry {
        name: name.ok_or_else(|| Error::integrity("scan line missing name"))?,
        pvid: pvid.ok_or_else(|| Error::integrity("scan line missing pvid"))?,
        major: major.ok_or_else(|| Error::integrity("scan line missing devn"))?,
        minor: minor.ok_or_else(|| Error::integrity("scan line missing devn"))?,
        vgname,
    })
}

pub fn load(path: &Path) -> Result<Option<HintsFile>> {
    match fs::read_to_string(path) {
        Ok(text) => HintsFile::parse(&text).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Same atomic-rename discipline as the devices file, on its own
/// lockfile.
pub fn store(path: &Path, hints: &HintsFile) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp_path = dir.join(format!(
        ".{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy()
    ));

    {
        use std::io::Write as _;
        let mut tmp = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        tmp.write_all(hints.serialize().as_bytes())?;
        tmp.flush()?;
        fsync(tmp.as_raw_fd())?;
    }

    fs::rename(&tmp_path, path)?;

    let dir_fd = nix::fcntl::open(dir, OFlag::O_RDONLY, Mode::empty())?;
    let result = fsync(dir_fd.as_raw_fd());
    drop(dir_fd);
    result?;

    Ok(())
}

/// `.../run/lvm/newhints`: presence forces the next command to rescan
/// everything and rewrite hints.
pub fn newhints_present(run_dir: &Path) -> bool {
    run_dir.join("newhints").exists()
}

pub fn set_newhints(run_dir: &Path) -> Result<()> {
    fs::write(run_dir.join("newhints"), b"")?;
    Ok(())
}

pub fn clear_newhints(run_dir: &Path) -> Result<()> {
    match fs::remove_file(run_dir.join("newhints")) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// `.../run/lvm/nohints`: while present, hints are ignored outright. A
/// state-changing command sets this on entry and clears it on exit, so
/// a crash mid-command leaves hints disabled (safe) rather than stale
/// hints trusted (unsafe).
pub fn nohints_present(run_dir: &Path) -> bool {
    run_dir.join("nohints").exists()
}

pub fn set_nohints(run_dir: &Path) -> Result<()> {
    fs::write(run_dir.join("nohints"), b"")?;
    Ok(())
}

pub fn clear_nohints(run_dir: &Path) -> Result<()> {
    match fs::remove_file(run_dir.join("nohints")) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Emit hints with an empty PV list and a `# info: duplicate_pvs`
/// comment, the required output when `lvmcache.has_duplicate_devs` is
/// set -- hints must never suggest a device set that could hide the
/// duplicate.
pub fn empty_due_to_duplicates(global_filter: &str, filter: &str, scan_lvs: bool) -> String {
    let hints = HintsFile::new(global_filter.to_string(), filter.to_string(), scan_lvs);
    format!("# info: duplicate_pvs\n{}", hints.serialize())
}
