// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Label scanner: finds the `"LABELONE"` sector among the first four
//! sectors of a device and hands the buffer off to the PV-header
//! decoder.

use crate::bytes::{crc32_calc, read_u32_le, read_u64_le};
use crate::error::{Error, Result};

pub const SECTOR_SIZE: usize = 512;
const LABEL_SCAN_SECTORS: usize = 4;
pub const LABEL_SCAN_SIZE: usize = LABEL_SCAN_SECTORS * SECTOR_SIZE;

/// A decoded 512-byte LABELONE sector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelHeader {
    /// Which of sectors 0..3 the label was found in.
    pub sector: u64,
    pub crc: u32,
    /// Offset from the *start of the scanned area* (not from the label
    /// sector) to the payload -- more convenient for callers than the
    /// on-disk offset, which is relative to the label sector itself.
    pub offset: u32,
    pub labeller_type: [u8; 8],
}

impl LabelHeader {
    /// Scan `buf` (at least `LABEL_SCAN_SIZE` bytes) for a label. Returns
    /// `Ok(None)` if no label is present -- that is not an error, just an
    /// unlabeled device. Returns `Err` if a `"LABELONE"` magic is found
    /// but its CRC or sector-number field don't check out.
    pub fn scan(buf: &[u8]) -> Result<Option<LabelHeader>> {
        for sector in 0..LABEL_SCAN_SECTORS {
            let start = sector * SECTOR_SIZE;
            let sec_buf = &buf[start..start + SECTOR_SIZE];
            if &sec_buf[..8] != b"LABELONE" {
                continue;
            }

            let crc = read_u32_le(&sec_buf[16..20]);
            let computed = crc32_calc(&sec_buf[20..SECTOR_SIZE]);
            if crc != computed {
                return Err(Error::integrity(format!(
                    "label CRC mismatch in sector {}: on-disk {:#010x}, computed {:#010x}",
                    sector, crc, computed
                )));
            }

            let sector_field = read_u64_le(&sec_buf[8..16]);
            if sector_field != sector as u64 {
                return Err(Error::integrity(format!(
                    "label sector field {} does not match actual sector {}",
                    sector_field, sector
                )));
            }

            let mut labeller_type = [0u8; 8];
            labeller_type.copy_from_slice(&sec_buf[24..32]);

            // At most one label per device: first match wins, duplicates
            // are ignored (callers may log that fact).
            return Ok(Some(LabelHeader {
                sector: sector_field,
                crc,
                offset: read_u32_le(&sec_buf[20..24]) + start as u32,
                labeller_type,
            }));
        }

        Ok(None)
    }

    pub fn labeller_type_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.labeller_type)
    }

    pub fn is_lvm2(&self) -> bool {
        &self.labeller_type == b"LVM2 001"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_label_buf(sector: usize) -> [u8; LABEL_SCAN_SIZE] {
        let mut buf = [0u8; LABEL_SCAN_SIZE];
        let start = sector * SECTOR_SIZE;
        buf[start..start + 8].copy_from_slice(b"LABELONE");
        crate::bytes::write_u64_le(&mut buf[start + 8..start + 16], sector as u64);
        crate::bytes::write_u32_le(&mut buf[start + 20..start + 24], 32);
        buf[start + 24..start + 32].copy_from_slice(b"LVM2 001");
        let crc = crc32_calc(&buf[start + 20..start + SECTOR_SIZE]);
        crate::bytes::write_u32_le(&mut buf[start + 16..start + 20], crc);
        buf
    }

    #[test]
    fn finds_label_in_sector_one() {
        let buf = make_label_buf(1);
        let label = LabelHeader::scan(&buf).unwrap().unwrap();
        assert_eq!(label.sector, 1);
        assert!(label.is_lvm2());
        assert_eq!(label.offset as usize, SECTOR_SIZE + 32);
    }

    #[test]
    fn no_label_is_not_an_error() {
        let buf = [0u8; LABEL_SCAN_SIZE];
        assert_eq!(LabelHeader::scan(&buf).unwrap(), None);
    }

    #[test]
    fn bad_crc_is_integrity_error() {
        let mut buf = make_label_buf(1);
        buf[1 * SECTOR_SIZE + 16] ^= 0xff;
        assert!(matches!(LabelHeader::scan(&buf), Err(Error::Integrity(_))));
    }

    #[test]
    fn mismatched_sector_field_is_integrity_error() {
        let mut buf = make_label_buf(1);
        // Put the label's magic in sector 1 but claim it is sector 2.
        crate::bytes::write_u64_le(&mut buf[1 * SECTOR_SIZE + 8..1 * SECTOR_SIZE + 16], 2);
        let crc = crc32_calc(&buf[1 * SECTOR_SIZE + 20..1 * SECTOR_SIZE + SECTOR_SIZE]);
        crate::bytes::write_u32_le(
            &mut buf[1 * SECTOR_SIZE + 16..1 * SECTOR_SIZE + 20],
            crc,
        );
        assert!(matches!(LabelHeader::scan(&buf), Err(Error::Integrity(_))));
    }

    #[test]
    fn first_of_duplicates_wins() {
        let mut buf = make_label_buf(1);
        let second = make_label_buf(2);
        buf[2 * SECTOR_SIZE..3 * SECTOR_SIZE].copy_from_slice(&second[2 * SECTOR_SIZE..3 * SECTOR_SIZE]);
        let label = LabelHeader::scan(&buf).unwrap().unwrap();
        assert_eq!(label.sector, 1);
    }
}
