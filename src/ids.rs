// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! PVID/VGID helpers: the on-disk form is 32 raw ASCII bytes with no
//! separators; the display form is the familiar 8-4-4-4-16 hyphenated
//! UUID. Both forms appear in this crate (MdaHeader fields are raw,
//! devices-file PVID fields and log messages use the hyphenated form).

use uuid::Uuid;

/// Generate a fresh 32-character unhyphenated id, as found on disk.
pub fn make_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Insert hyphens into a raw 32-byte id the way `lib/format_text/*`
/// renders PVIDs and VGIDs for humans: 6-4-4-4-4-4-6.
pub fn hyphenate_id(raw: &[u8]) -> String {
    let s = String::from_utf8_lossy(raw);
    let s = &s[..s.len().min(32)];
    let mut out = String::with_capacity(38);
    for (i, c) in s.chars().enumerate() {
        if matches!(i, 6 | 10 | 14 | 18 | 22) {
            out.push('-');
        }
        out.push(c);
    }
    out
}

/// Strip hyphens back out, for when a raw 32-byte field must be written.
pub fn dehyphenate_id(hyphenated: &str) -> String {
    hyphenated.chars().filter(|c| *c != '-').collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hyphenate_roundtrip() {
        let raw = b"abcdefghijklmnopqrstuvwxyzABCDEF";
        let h = hyphenate_id(raw);
        assert_eq!(h.len(), 32 + 5);
        assert_eq!(dehyphenate_id(&h), String::from_utf8_lossy(raw));
    }

    #[test]
    fn make_id_is_32_chars() {
        assert_eq!(make_id().len(), 32);
    }
}
