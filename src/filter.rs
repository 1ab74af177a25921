// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The filter chain: decides which devices this command will even look
//! at. Reading/ioctl-probing a device to decide is out of scope here --
//! only the trait boundary and the "never touch data under nodata"
//! invariant are.

use crate::device::Device;

/// Mirrors lvm2's `nodata`/`data` filter staging: the `nodata` stage may
/// only consult metadata already known about the device (name, size,
/// major/minor); it must never open or read the device itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStage {
    NoData,
    Data,
}

pub trait Filter {
    /// Whether `dev` passes this stage. Implementations backing
    /// `FilterStage::NoData` must not perform I/O on `dev`.
    fn passes_filter(&self, dev: &Device, stage: FilterStage) -> bool;

    /// Best-effort signature wipe (e.g. before reusing a device as a new
    /// PV). Out of scope to implement against real devices here; the
    /// default is a no-op so pure in-memory tests never touch I/O.
    fn wipe(&self, _dev: &Device) {}
}

/// Accepts every device at every stage: the default when no regex/type
/// filters are configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllFilter;

impl Filter for AcceptAllFilter {
    fn passes_filter(&self, _dev: &Device, _stage: FilterStage) -> bool {
        true
    }
}

/// A simple name-pattern filter, the in-scope subset of lvm2's regex
/// filter chain: accepts a device whose name matches any of `accept`
/// and none of `reject`. Patterns are plain substrings, not full regex --
/// sufficient for hints invalidation on a filter change, and avoids
/// pulling in a regex crate agrover-melvin never depended on.
#[derive(Debug, Clone, Default)]
pub struct NamePatternFilter {
    pub accept: Vec<String>,
    pub reject: Vec<String>,
}

impl NamePatternFilter {
    /// The rendered form stored in the hints file's `filter:` line.
    pub fn render(&self) -> String {
        let mut parts: Vec<String> = self.accept.iter().map(|p| format!("a|{}|", p)).collect();
        parts.extend(self.reject.iter().map(|p| format!("r|{}|", p)));
        parts.join(",")
    }
}

impl Filter for NamePatternFilter {
    fn passes_filter(&self, dev: &Device, _stage: FilterStage) -> bool {
        let name = dev.name.to_string_lossy();
        if self.reject.iter().any(|p| name.contains(p.as_str())) {
            return false;
        }
        if self.accept.is_empty() {
            return true;
        }
        self.accept.iter().any(|p| name.contains(p.as_str()))
    }
}
