// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Byte/CRC primitives: the CRC-32 variant LVM2 uses for labels, MDA
//! headers and devices-file hashes, plus fixed-width endian accessors.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use crc::{Algorithm, Crc};

/// `calc_crc()`'s seed in `lib/misc/crc.h`. LVM2 computes this as
/// `!update(!INITIAL_CRC, table, buf)` over the plain zlib-table CRC-32
/// update function (no built-in init/xorout of its own). Folding that
/// double complement into an `Algorithm<u32>` means reflecting
/// `!INITIAL_CRC` to get the `init` field (this crate reflects `init`
/// itself when `refin` is set) and moving the outer complement into
/// `xorout`.
const LVM_CRC32: Algorithm<u32> = Algorithm {
    width: 32,
    poly: 0x04c1_1db7,
    init: 0x0c9a_1650,
    refin: true,
    refout: true,
    xorout: 0xffff_ffff,
    check: 0x0000_0000,
    residue: 0x0000_0000,
};

/// CRC-32 over `buf`, matching LVM2's `calc_crc(INITIAL_CRC, buf, size)`.
pub fn crc32_calc(buf: &[u8]) -> u32 {
    Crc::<u32>::new(&LVM_CRC32).checksum(buf)
}

/// Round `num` up to the next multiple of `align`. `align` must be a
/// power of two, as every caller in this crate aligns to a sector size.
pub fn align_to(num: usize, align: usize) -> usize {
    let mask = align - 1;
    (num + mask) & !mask
}

pub fn read_u16_le(buf: &[u8]) -> u16 {
    LittleEndian::read_u16(buf)
}
pub fn read_u32_le(buf: &[u8]) -> u32 {
    LittleEndian::read_u32(buf)
}
pub fn read_u64_le(buf: &[u8]) -> u64 {
    LittleEndian::read_u64(buf)
}
pub fn write_u16_le(buf: &mut [u8], v: u16) {
    LittleEndian::write_u16(buf, v)
}
pub fn write_u32_le(buf: &mut [u8], v: u32) {
    LittleEndian::write_u32(buf, v)
}
pub fn write_u64_le(buf: &mut [u8], v: u64) {
    LittleEndian::write_u64(buf, v)
}

pub fn read_u16_be(buf: &[u8]) -> u16 {
    BigEndian::read_u16(buf)
}
pub fn read_u32_be(buf: &[u8]) -> u32 {
    BigEndian::read_u32(buf)
}
pub fn read_u64_be(buf: &[u8]) -> u64 {
    BigEndian::read_u64(buf)
}
pub fn write_u16_be(buf: &mut [u8], v: u16) {
    BigEndian::write_u16(buf, v)
}
pub fn write_u32_be(buf: &mut [u8], v: u32) {
    BigEndian::write_u32(buf, v)
}
pub fn write_u64_be(buf: &mut [u8], v: u64) {
    BigEndian::write_u64(buf, v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_to_rounds_up() {
        assert_eq!(align_to(0, 512), 0);
        assert_eq!(align_to(1, 512), 512);
        assert_eq!(align_to(512, 512), 512);
        assert_eq!(align_to(513, 512), 1024);
    }

    #[test]
    fn crc_of_empty_buf_is_initial_value_complement_relationship() {
        // calc_crc(INITIAL_CRC, "", 0) == INITIAL_CRC, since a zero-length
        // update leaves the running CRC at its initial value.
        assert_eq!(crc32_calc(&[]), 0xf597_a6cf);
    }

    /// Known-answer vectors for `!update(!INITIAL_CRC, table, buf)`,
    /// worked out by hand from the zlib-table update function and the
    /// double-complement relationship above, independent of this crate's
    /// own `Algorithm` encoding of it.
    #[test]
    fn crc_matches_known_answer_vectors() {
        assert_eq!(crc32_calc(b"a"), 0xe399_f6c4);
        assert_eq!(crc32_calc(b"abc"), 0x39e1_8dc2);
        assert_eq!(crc32_calc(b"LABELONE"), 0xeeed_baad);
    }

    #[test]
    fn crc_le_roundtrip() {
        let mut buf = [0u8; 4];
        write_u32_le(&mut buf, 0xdead_beef);
        assert_eq!(read_u32_le(&buf), 0xdead_beef);
    }

    #[test]
    fn crc_be_roundtrip() {
        let mut buf = [0u8; 8];
        write_u64_be(&mut buf, 0x0123_4567_89ab_cdef);
        assert_eq!(read_u64_be(&buf), 0x0123_4567_89ab_cdef);
    }
}
