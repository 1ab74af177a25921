// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Property-based tests for the universal properties: CRC round-trip,
//! circular-buffer wrap, devices-file idempotence and id canonicalisation
//! idempotence.

use std::io::{Seek, SeekFrom, Write as _};
use std::path::PathBuf;

use proptest::prelude::*;
use tempfile::NamedTempFile;

use lvm_core::bytes::crc32_calc;
use lvm_core::device::IdType;
use lvm_core::device_id::{canonicalize_general, canonicalize_t10};
use lvm_core::devices_file::{DevicesFile, UseEntry};
use lvm_core::pvheader::{MdaContext, MdaHeader, PvArea, RawLocn};

/// Printable ASCII, no control characters, no `'"'`, no whitespace --
/// the alphabet a devices-file field actually allows.
fn field_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9._:/-]{1,32}"
}

/// Write an `MdaHeader` to `area.offset` in `file`, the same way the
/// crate's own (private) `write_mda_header` does, using only the public
/// `encode()` this test can reach.
fn seed_mda_header(file: &mut std::fs::File, area: &PvArea, hdr: &MdaHeader) {
    file.seek(SeekFrom::Start(area.offset)).unwrap();
    file.write_all(&hdr.encode()).unwrap();
}

proptest! {
    /// CRC round-trip: encoding an `MdaHeader` and decoding it back
    /// always reproduces the same header, for any live raw-location that
    /// fits the encoding.
    #[test]
    fn crc_round_trip_through_mda_header(
        live_offset in 512u64..4096,
        live_size in 0u64..4096,
        live_checksum in any::<u32>(),
    ) {
        let area = PvArea { offset: 0, size: 1024 * 1024 };
        let hdr = MdaHeader {
            start: area.offset,
            size: area.size,
            live: Some(RawLocn {
                offset: live_offset,
                size: live_size,
                checksum: live_checksum,
                ignored: false,
            }),
            precommit: None,
        };
        let buf = hdr.encode();
        let decoded = MdaHeader::decode(&buf, &area).unwrap();
        prop_assert_eq!(decoded, hdr);
    }

    /// Plain CRC-32 is a pure function of its input: computing it twice
    /// over the same bytes always agrees, and any single-byte change
    /// changes the result (no accidental collisions for tiny inputs).
    #[test]
    fn crc32_is_deterministic_and_sensitive_to_single_byte_changes(
        bytes in prop::collection::vec(any::<u8>(), 0..256),
        flip_index in 0usize..256,
    ) {
        let a = crc32_calc(&bytes);
        let b = crc32_calc(&bytes);
        prop_assert_eq!(a, b);

        if flip_index < bytes.len() {
            let mut mutated = bytes.clone();
            mutated[flip_index] ^= 0xff;
            prop_assert_ne!(crc32_calc(&mutated), a);
        }
    }

    /// Circular-buffer wrap: writing a record that must wrap around the
    /// end of the MDA text area and reading it back always reproduces
    /// the exact bytes written, for any text area size and record length
    /// that fits within the usable area.
    #[test]
    fn mda_wrap_write_read_round_trips(
        area_extra_sectors in 2u64..20,
        record_len in 1usize..4000,
        live_len in 0usize..512,
    ) {
        let sector = lvm_core::label::SECTOR_SIZE as u64;
        let area_size = 512 + area_extra_sectors * sector; // header + N sectors
        let usable = area_size - 512;
        prop_assume!((record_len as u64) <= usable);
        prop_assume!((live_len as u64) < usable);

        let mut f = NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; area_size as usize]).unwrap();
        let area = PvArea { offset: 0, size: area_size };
        let mut file = f.reopen().unwrap();

        // Place a live record near the very end of the area so the next
        // write is forced to wrap.
        let live_offset = 512 + usable.saturating_sub(live_len as u64 + 1);
        let live_bytes = vec![0x11u8; live_len];
        let live_checksum = crc32_calc(&live_bytes);

        let hdr = MdaHeader {
            start: area.offset,
            size: area.size,
            live: if live_len > 0 {
                Some(RawLocn {
                    offset: live_offset,
                    size: live_len as u64,
                    checksum: live_checksum,
                    ignored: false,
                })
            } else {
                None
            },
            precommit: None,
        };
        seed_mda_header(&mut file, &area, &hdr);

        let mut ctx = MdaContext::open(&mut file, area).unwrap();
        let text = vec![0xABu8; record_len];
        let write_result = ctx.write(&mut file, &text);

        if write_result.is_err() {
            // The live record left no room: not a wrap scenario, skip.
            return Ok(());
        }
        ctx.commit(&mut file).unwrap();
        let read_back = ctx.read_live(&mut file).unwrap().unwrap();
        prop_assert_eq!(read_back, text);
    }

    /// Devices-file idempotence: serializing and reparsing never changes
    /// the set of entries, regardless of how many times it's repeated.
    #[test]
    fn devices_file_serialize_parse_is_idempotent(
        idnames in prop::collection::vec(field_strategy(), 0..8),
    ) {
        let mut f = DevicesFile::new();
        for (i, idname) in idnames.iter().enumerate() {
            f.entries.push(UseEntry {
                idtype: IdType::WwidNaa,
                idname: idname.clone(),
                devname: PathBuf::from(format!("/dev/sd{}", i)),
                pvid: format!("pvid{:032}", i),
                part: None,
            });
        }

        let first_pass = f.serialize();
        let mut reparsed = DevicesFile::parse(&first_pass).unwrap();
        let second_pass = reparsed.serialize();
        let reparsed_again = DevicesFile::parse(&second_pass).unwrap();

        prop_assert_eq!(reparsed_again.entries, reparsed.entries);
        prop_assert!(!reparsed_again.hash_mismatch);
    }

    /// ID canonicalisation idempotence: canonicalising an already
    /// canonical string is a no-op, for both the general and T10 rules.
    #[test]
    fn canonicalize_general_is_idempotent(raw in ".{0,64}") {
        let once = canonicalize_general(&raw);
        let twice = canonicalize_general(&once);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn canonicalize_t10_is_idempotent(raw in ".{0,64}") {
        let once = canonicalize_t10(&raw);
        let twice = canonicalize_t10(&once);
        prop_assert_eq!(once, twice);
    }
}
