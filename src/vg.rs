// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! VG metadata envelope extraction: the subset of a VG's on-disk text
//! record this crate cares about. LV/segment grammar is out of scope --
//! only the fields `lvmcache::VgInfo` caches are pulled out of the
//! parsed `LvmTextMap`.
//!
//! Adapted from agrover-melvin's `vg_from_textmap` (`parser.rs`), trimmed
//! to the envelope: name, id, format, seqno, status, flags and the
//! member PV id list. LV/segment extraction and the devicemapper-backed
//! `VG::create` provisioning path are dropped entirely.

use crate::error::{Error, Result};
use crate::parser::{buf_to_textmap, Entry, LvmTextMap, TextMapOps};

/// The parsed envelope of one VG's text metadata record. Distinct from
/// `lvmcache::VgInfo`: this is what a single metadata read produced,
/// before being folded into the cache (which may already know about the
/// VG from a different PV's copy of the same record).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VgEnvelope {
    pub name: String,
    pub id: String,
    pub format: String,
    pub seqno: u64,
    pub status: Vec<String>,
    pub flags: Vec<String>,
    pub extent_size: u64,
    /// PVIDs of the VG's member PVs, in on-disk order.
    pub pvids: Vec<String>,
}

fn pvids_from_textmap(map: &LvmTextMap) -> Result<Vec<String>> {
    let err = || Error::inconsistency("physical_volumes section malformed");

    let mut ids = Vec::new();
    for (_key, value) in map {
        let pv_dict = match value {
            Entry::TextMap(x) => x,
            _ => return Err(err()),
        };
        let id = pv_dict.string_from_textmap("id").ok_or_else(err)?;
        ids.push(id.to_string());
    }
    Ok(ids)
}

/// Extract the envelope from one VG's already-parsed text record. `name`
/// is the record's own key in the metadata's top-level map (the on-disk
/// format nests the VG under its name, not inside the `id`/`seqno` map
/// itself).
pub fn envelope_from_textmap(name: &str, map: &LvmTextMap) -> Result<VgEnvelope> {
    let err = || Error::inconsistency(format!("VG record {} missing a required field", name));

    let id = map.string_from_textmap("id").ok_or_else(err)?.to_string();
    let seqno = map.i64_from_textmap("seqno").ok_or_else(err)?;
    // Older records omit "format" (it was implicit); treat absence as the
    // only format this crate speaks.
    let format = map
        .string_from_textmap("format")
        .unwrap_or("lvm2")
        .to_string();
    let extent_size = map.i64_from_textmap("extent_size").ok_or_else(err)?;

    let status = map.strings_from_textmap("status");
    let flags = map.strings_from_textmap("flags");

    let pvids = map
        .textmap_from_textmap("physical_volumes")
        .map(pvids_from_textmap)
        .transpose()?
        .unwrap_or_default();

    Ok(VgEnvelope {
        name: name.to_string(),
        id,
        format,
        seqno: seqno as u64,
        status,
        flags,
        extent_size: extent_size as u64,
        pvids,
    })
}

/// Parse a whole MDA text record (as returned by
/// `pvheader::MdaContext::read_live`) and extract the envelope of the one
/// VG it describes. lvm2 metadata text nests exactly one VG name at the
/// top level alongside a `contents`/`version` preamble; this returns the
/// first (and expected only) nested map whose name isn't one of those
/// preamble keys.
pub fn envelope_from_metadata_text(buf: &[u8]) -> Result<VgEnvelope> {
    let top = buf_to_textmap(buf)?;

    const PREAMBLE_KEYS: &[&str] = &["contents", "version", "description", "creation_host", "creation_time"];

    let (name, vg_map) = top
        .iter()
        .find(|(k, v)| !PREAMBLE_KEYS.contains(&k.as_str()) && matches!(v, Entry::TextMap(_)))
        .and_then(|(k, v)| match v {
            Entry::TextMap(m) => Some((k.clone(), m.as_ref())),
            _ => None,
        })
        .ok_or_else(|| Error::inconsistency("metadata text contains no VG record"))?;

    envelope_from_textmap(&name, vg_map)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = br#"
contents = "Text Format Volume Group"
version = 1

myvg {
id = "abcd-ef01"
seqno = 3
format = "lvm2"
status = ["RESIZEABLE", "READ", "WRITE"]
flags = []
extent_size = 8192

physical_volumes {
pv0 {
id = "pvid-aaa"
}
pv1 {
id = "pvid-bbb"
}
}
}
"#;

    #[test]
    fn extracts_envelope_from_full_metadata_text() {
        let env = envelope_from_metadata_text(SAMPLE).unwrap();
        assert_eq!(env.name, "myvg");
        assert_eq!(env.id, "abcd-ef01");
        assert_eq!(env.seqno, 3);
        assert_eq!(env.format, "lvm2");
        assert_eq!(env.status, vec!["RESIZEABLE", "READ", "WRITE"]);
        assert_eq!(env.pvids, vec!["pvid-aaa", "pvid-bbb"]);
    }

    #[test]
    fn missing_format_field_defaults_to_lvm2() {
        let map = buf_to_textmap(
            br#"id = "x"
seqno = 1
extent_size = 4096
physical_volumes {
}
"#,
        )
        .unwrap();
        let env = envelope_from_textmap("vg1", &map).unwrap();
        assert_eq!(env.format, "lvm2");
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let map = buf_to_textmap(b"id = \"x\"\n").unwrap();
        assert!(envelope_from_textmap("vg1", &map).is_err());
    }

    #[test]
    fn empty_top_level_map_has_no_vg_record() {
        assert!(envelope_from_metadata_text(b"contents = \"x\"\nversion = 1\n").is_err());
    }
}
