// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The devices-file store: a line-oriented text file under the system
//! directory, edited wholesale in memory and replaced with a
//! crash-consistent rename.

use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::fsync;

use crate::bytes::crc32_calc;
use crate::device::IdType;
use crate::error::{Error, Result};

/// One `IDTYPE=... IDNAME=... DEVNAME=... PVID=... [PART=...]` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UseEntry {
    pub idtype: IdType,
    pub idname: String,
    pub devname: PathBuf,
    pub pvid: String,
    pub part: Option<u32>,
}

impl UseEntry {
    fn format(&self) -> String {
        let mut line = format!(
            "IDTYPE={} IDNAME={} DEVNAME={} PVID={}",
            self.idtype.as_str(),
            self.idname,
            self.devname.display(),
            self.pvid
        );
        if let Some(part) = self.part {
            line.push_str(&format!(" PART={}", part));
        }
        line
    }

    fn parse(line: &str) -> Result<UseEntry> {
        let mut idtype = None;
        let mut idname = None;
        let mut devname = None;
        let mut pvid = None;
        let mut part = None;

        for field in line.split_whitespace() {
            let (key, value) = field
                .split_once('=')
                .ok_or_else(|| Error::integrity(format!("malformed field {:?}", field)))?;
            match key {
                "IDTYPE" => {
                    idtype = Some(IdType::from_str(value).ok_or_else(|| {
                        Error::integrity(format!("unknown IDTYPE {:?}", value))
                    })?)
                }
                "IDNAME" => idname = Some(value.to_string()),
                "DEVNAME" => devname = Some(PathBuf::from(value)),
                "PVID" => pvid = Some(value.to_string()),
                "PART" => {
                    part = Some(
                        value
                            .parse()
                            .map_err(|_| Error::integrity(format!("bad PART value {:?}", value)))?,
                    )
                }
                _ => {} // unrecognized fields are ignored, per "unknown directives are skipped"
            }
        }

        Ok(UseEntry {
            idtype: idtype.ok_or_else(|| Error::integrity("line missing IDTYPE"))?,
            idname: idname.ok_or_else(|| Error::integrity("line missing IDNAME"))?,
            devname: devname.ok_or_else(|| Error::integrity("line missing DEVNAME"))?,
            pvid: pvid.ok_or_else(|| Error::integrity("line missing PVID"))?,
            part,
        })
    }
}

/// The fully parsed contents of `system.devices`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicesFile {
    pub version_major: u32,
    pub version_minor: u32,
    pub version_counter: u64,
    pub product_uuid: Option<String>,
    pub hostname: Option<String>,
    pub entries: Vec<UseEntry>,
    /// Set when the on-disk `# HASH=` comment didn't match the recomputed
    /// hash of the body: a human (or another tool) touched the file.
    /// Not a parse error -- callers trigger a rewrite to reformat it.
    pub hash_mismatch: bool,
}

const CURRENT_MAJOR: u32 = 1;

impl DevicesFile {
    pub fn new() -> DevicesFile {
        DevicesFile {
            version_major: 1,
            version_minor: 1,
            version_counter: 0,
            product_uuid: None,
            hostname: None,
            entries: Vec::new(),
            hash_mismatch: false,
        }
    }

    /// Parse a devices file. Returns `Err(Error::Invariant(..))` if the
    /// major version exceeds what this build understands -- the caller
    /// should treat that as "needs refresh by a newer tool", not corrupt
    /// data.
    pub fn parse(text: &str) -> Result<DevicesFile> {
        let mut f = DevicesFile::new();
        let mut saw_version = false;
        let mut body_lines = Vec::new();
        let mut on_disk_hash = None;

        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix('#') {
                if let Some(h) = rest.trim().strip_prefix("HASH=") {
                    on_disk_hash = h.trim().parse::<u32>().ok();
                }
                continue;
            }

            body_lines.push(line.to_string());

            if let Some(v) = line.strip_prefix("VERSION=") {
                let parts: Vec<&str> = v.split('.').collect();
                if parts.len() != 3 {
                    return Err(Error::integrity(format!("malformed VERSION {:?}", v)));
                }
                let major: u32 = parts[0]
                    .parse()
                    .map_err(|_| Error::integrity("non-numeric VERSION major"))?;
                if major > CURRENT_MAJOR {
                    return Err(Error::invariant(format!(
                        "devices file VERSION major {} is newer than this build understands",
                        major
                    )));
                }
                f.version_major = major;
                f.version_minor = parts[1]
                    .parse()
                    .map_err(|_| Error::integrity("non-numeric VERSION minor"))?;
                f.version_counter = parts[2]
                    .parse()
                    .map_err(|_| Error::integrity("non-numeric VERSION counter"))?;
                saw_version = true;
            } else if let Some(v) = line.strip_prefix("PRODUCT_UUID=") {
                f.product_uuid = non_unset(v);
            } else if let Some(v) = line.strip_prefix("HOSTNAME=") {
                f.hostname = non_unset(v);
            } else if line.starts_with("IDTYPE=") {
                if !saw_version {
                    return Err(Error::integrity(
                        "IDTYPE line appears before VERSION line",
                    ));
                }
                f.entries.push(UseEntry::parse(line)?);
            }
            // Other unrecognized directive lines still count toward the
            // hash but are otherwise ignored, matching the writer's
            // forward-compatible stance.
        }

        if !saw_version {
            return Err(Error::integrity("devices file has no VERSION line"));
        }

        if let Some(on_disk) = on_disk_hash {
            let computed = hash_body(&body_lines);
            f.hash_mismatch = on_disk != computed;
        } else {
            f.hash_mismatch = true;
        }

        Ok(f)
    }

    /// Render the file, bumping the rewrite counter and recomputing the
    /// hash comment. Does not touch disk.
    pub fn serialize(&mut self) -> String {
        self.version_counter += 1;
        self.hash_mismatch = false;

        let mut body_lines = Vec::new();
        // The writer always emits VERSION=1.1.<n>, regardless of what
        // version a previous writer (or a hand-edited file) left behind.
        body_lines.push(format!("VERSION=1.1.{}", self.version_counter));
        body_lines.push(format!(
            "PRODUCT_UUID={}",
            self.product_uuid.as_deref().unwrap_or(".")
        ));
        body_lines.push(format!("HOSTNAME={}", self.hostname.as_deref().unwrap_or(".")));
        for entry in &self.entries {
            body_lines.push(entry.format());
        }

        let hash = hash_body(&body_lines);
        let mut out = format!("# HASH={}\n", hash);
        for line in &body_lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    /// Whether `product_uuid`/`hostname` disagree with the running
    /// system, forcing a search pass even for otherwise-stable entries
    /// (the `refresh_trigger` condition).
    pub fn needs_refresh(&self, running_product_uuid: Option<&str>, running_hostname: &str) -> bool {
        if let Some(want) = running_product_uuid {
            if let Some(have) = &self.product_uuid {
                if have != want {
                    return true;
                }
            }
        }
        if let Some(have) = &self.hostname {
            if have != running_hostname {
                return true;
            }
        }
        false
    }
}

impl Default for DevicesFile {
    fn default() -> DevicesFile {
        DevicesFile::new()
    }
}

fn non_unset(v: &str) -> Option<String> {
    if v == "." {
        None
    } else {
        Some(v.to_string())
    }
}

fn hash_body(body_lines: &[String]) -> u32 {
    let joined = body_lines.join("\n");
    crc32_calc(joined.as_bytes())
}

/// Read and parse the devices file at `path`. A missing file is treated
/// as an empty, version-1.1.0 store (first run).
pub fn load(path: &Path) -> Result<DevicesFile> {
    match fs::read_to_string(path) {
        Ok(text) => DevicesFile::parse(&text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DevicesFile::new()),
        Err(e) => Err(e.into()),
    }
}

/// Atomically replace `path` with `file`'s serialized contents: write to
/// a sibling temp file, `fsync` it, `rename` over the target, then
/// `fsync` the containing directory so the rename itself survives a
/// crash. Rotates a backup into `backup_dir` first, keeping at most
/// `backup_limit` backups.
pub fn store(
    path: &Path,
    file: &mut DevicesFile,
    backup_dir: Option<&Path>,
    backup_limit: usize,
) -> Result<()> {
    if let Some(dir) = backup_dir {
        if path.exists() {
            write_backup(path, dir, &timestamp_now(), backup_limit)?;
        }
    }

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp_path = dir.join(format!(
        ".{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy()
    ));

    let contents = file.serialize();
    {
        let mut tmp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        tmp.write_all(contents.as_bytes())?;
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

/// `YYYYMMDD.HHMMSS.0000` for the current wall-clock time, UTC. The
/// trailing counter field only matters when two backups would otherwise
/// collide within the same second; we always emit `0000` and let
/// `write_backup`'s caller widen it if that ever proves necessary.
fn timestamp_now() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    civil_timestamp(secs)
}

/// Convert a Unix timestamp to a `YYYYMMDD.HHMMSS.0000` string using
/// Howard Hinnant's `civil_from_days` algorithm, so this has no
/// dependency on a date/time crate or the system timezone database.
fn civil_timestamp(unix_secs: u64) -> String {
    let days = (unix_secs / 86400) as i64;
    let rem = unix_secs % 86400;
    let (hh, mm, ss) = (rem / 3600, (rem % 3600) / 60, rem % 60);

    let z = days + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    format!("{:04}{:02}{:02}.{:02}{:02}{:02}.0000", y, m, d, hh, mm, ss)
}

/// Write a timestamped backup copy and prune down to `limit` backups,
/// oldest-name-first (the names are lexicographically sortable
/// `YYYYMMDD.HHMMSS.NNNN` timestamps, so a plain `sort` is
/// locale-independent).
pub fn write_backup(path: &Path, backup_dir: &Path, stamp: &str, limit: usize) -> Result<()> {
    fs::create_dir_all(backup_dir)?;
    let base = path.file_name().unwrap_or_default().to_string_lossy();
    let backup_path = backup_dir.join(format!("{}-{}", base, stamp));
    fs::copy(path, &backup_path)?;
    prune_backups(backup_dir, limit)?;
    Ok(())
}

fn prune_backups(backup_dir: &Path, limit: usize) -> Result<()> {
    let mut names: Vec<PathBuf> = fs::read_dir(backup_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    names.sort();
    while names.len() > limit {
        let oldest = names.remove(0);
        let _ = fs::remove_file(oldest);
    }
    Ok(())
}

/// `_device_ids_update_try`: attempt a non-blocking update. The caller
/// has already opened the lockfile with `LOCK_NB`; if that failed, this
/// function is never called. Reads the on-disk `VERSION` counter and
/// only writes if it still matches `expected_counter` -- otherwise
/// another writer raced in since this process last read the file, and
/// the update is abandoned for a future retry.
pub fn update_try(
    path: &Path,
    expected_counter: u64,
    file: &mut DevicesFile,
    backup_dir: Option<&Path>,
    backup_limit: usize,
) -> Result<bool> {
    let on_disk = load(path)?;
    if on_disk.version_counter != expected_counter {
        return Ok(false);
    }
    store(path, file, backup_dir, backup_limit)?;
    Ok(true)
}

/// Guarantee a lockfile exists at `lock_path` (`flock` requires an
/// openable file; the devices-file lock is named `D_<basename>` in the
/// locking directory).
pub fn ensure_lockfile(lock_path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(lock_path)?)
}
