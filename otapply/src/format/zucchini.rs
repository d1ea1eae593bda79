// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io;

use thiserror::Error;
use zerocopy::{FromBytes, byteorder::little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Magic value for [`RawHeader::magic`].
pub const HEADER_MAGIC: u32 = u32::from_le_bytes(*b"Zucc");

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid ensemble header magic: {0:#010x}")]
    InvalidMagic(u32),
    #[error("Failed to read ensemble header")]
    DataRead(#[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Raw on-disk layout for the ensemble patch header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    /// Magic value. This should be equal to [`HEADER_MAGIC`].
    magic: little_endian::U32,
    major_version: little_endian::U16,
    minor_version: little_endian::U16,
    /// Size of the old image.
    old_size: little_endian::U32,
    /// CRC32 of the old image.
    old_crc: little_endian::U32,
    /// Size of the image that the patch produces.
    new_size: little_endian::U32,
    /// CRC32 of the new image.
    new_crc: little_endian::U32,
}

/// Ensemble patch header. The body that follows is opaque and is only ever
/// interpreted by the patch engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PatchHeader {
    pub major_version: u16,
    pub minor_version: u16,
    pub old_size: u32,
    pub old_crc: u32,
    pub new_size: u32,
    pub new_crc: u32,
}

impl PatchHeader {
    pub const SIZE: usize = size_of::<RawHeader>();

    /// Parse the header at the start of a decompressed patch.
    pub fn parse(mut patch: &[u8]) -> Result<Self> {
        let raw = RawHeader::read_from_io(&mut patch).map_err(Error::DataRead)?;

        if raw.magic.get() != HEADER_MAGIC {
            return Err(Error::InvalidMagic(raw.magic.get()));
        }

        Ok(Self {
            major_version: raw.major_version.get(),
            minor_version: raw.minor_version.get(),
            old_size: raw.old_size.get(),
            old_crc: raw.old_crc.get(),
            new_size: raw.new_size.get(),
            new_crc: raw.new_crc.get(),
        })
    }

    /// Serialize the header to its on-disk form.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&HEADER_MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&self.major_version.to_le_bytes());
        buf[6..8].copy_from_slice(&self.minor_version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.old_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.old_crc.to_le_bytes());
        buf[16..20].copy_from_slice(&self.new_size.to_le_bytes());
        buf[20..24].copy_from_slice(&self.new_crc.to_le_bytes());
        buf
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_header() {
        let header = PatchHeader {
            major_version: 1,
            minor_version: 0,
            old_size: 4096,
            old_crc: 0x12345678,
            new_size: 8192,
            new_crc: 0x9abcdef0,
        };

        let mut data = header.to_bytes().to_vec();
        assert_eq!(&data[..4], b"Zucc");
        data.extend_from_slice(b"body");

        assert_eq!(PatchHeader::parse(&data).unwrap(), header);
    }

    #[test]
    fn invalid_header() {
        assert_matches!(PatchHeader::parse(b"Zucc"), Err(Error::DataRead(_)));

        let mut data = [0u8; PatchHeader::SIZE];
        data[..4].copy_from_slice(b"Zuck");
        assert_matches!(PatchHeader::parse(&data), Err(Error::InvalidMagic(_)));
    }
}
