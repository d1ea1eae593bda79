// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{self, Read, Seek, SeekFrom, Write};

use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    format::compression::{self, CompressedFormat, CompressedReader},
    stream::{self, ReadFixedSizeExt},
};

/// Magic value for the legacy bsdiff format. All three streams are bzip2
/// compressed.
const BSDIFF40_MAGIC: &[u8; 8] = b"BSDIFF40";
/// Magic value for the BSDF2 format. The following three bytes select the
/// compressor for each of the streams.
const BSDF2_MAGIC: &[u8; 5] = b"BSDF2";

const BUF_SIZE: usize = 65536;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown patch magic: {0:02x?}")]
    UnknownMagic([u8; 8]),
    #[error("Negative {0} in patch header: {1}")]
    NegativeHeaderField(&'static str, i64),
    #[error("Patch streams ({ctrl_len} + {diff_len} bytes) exceed patch size of {size} bytes")]
    StreamsOutOfBounds {
        ctrl_len: u64,
        diff_len: u64,
        size: usize,
    },
    #[error("Control entry #{index}: Negative length: mix={mix_len}, copy={copy_len}")]
    NegativeLength {
        index: u64,
        mix_len: i64,
        copy_len: i64,
    },
    #[error("Control entry #{index}: Output would exceed new size of {new_size} bytes")]
    NewOverflow { index: u64, new_size: u64 },
    #[error("Control entry #{index}: Old range {offset}+{len} exceeds old size of {old_size} bytes")]
    OldOutOfRange {
        index: u64,
        offset: u64,
        len: u64,
        old_size: u64,
    },
    #[error("Control entry #{index}: Seek by {seek} from {offset} leaves old data")]
    SeekOutOfRange { index: u64, offset: u64, seek: i64 },
    #[error("Compression error")]
    Compression(#[from] compression::Error),
    #[error("Failed to read patch data: {0}")]
    DataRead(&'static str, #[source] io::Error),
    #[error("Patch has trailing data in {0} stream")]
    TrailingData(&'static str),
    #[error("Failed to read old data")]
    OldRead(#[source] io::Error),
    #[error("Failed to write new data")]
    NewWrite(#[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Raw on-disk layout for the patch header. Both formats share this layout and
/// only differ in how the magic field is interpreted.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    magic: [u8; 8],
    /// Compressed size of the control stream.
    ctrl_len: [u8; 8],
    /// Compressed size of the diff stream.
    diff_len: [u8; 8],
    /// Size of the output.
    new_size: [u8; 8],
}

/// Decode bsdiff's sign-magnitude 64-bit integer encoding.
fn offtin(buf: [u8; 8]) -> i64 {
    let magnitude = (u64::from_le_bytes(buf) & !(1 << 63)) as i64;

    if buf[7] & 0x80 != 0 {
        -magnitude
    } else {
        magnitude
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchFormat {
    Bsdiff40,
    Bsdf2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PatchHeader {
    pub format: PatchFormat,
    /// Compressors for the control, diff, and extra streams.
    pub compressors: [CompressedFormat; 3],
    pub ctrl_len: u64,
    pub diff_len: u64,
    pub new_size: u64,
}

impl PatchHeader {
    pub const SIZE: usize = size_of::<RawHeader>();

    /// Parse and validate the header at the start of `patch`. This ensures
    /// that the control and diff streams lie within the patch data.
    pub fn parse(patch: &[u8]) -> Result<Self> {
        let mut reader = patch;
        let raw = RawHeader::read_from_io(&mut reader).map_err(|e| Error::DataRead("header", e))?;

        let (format, compressors) = if &raw.magic == BSDIFF40_MAGIC {
            (PatchFormat::Bsdiff40, [CompressedFormat::Bzip2; 3])
        } else if raw.magic.starts_with(BSDF2_MAGIC) {
            let c = &raw.magic[BSDF2_MAGIC.len()..];

            (
                PatchFormat::Bsdf2,
                [
                    CompressedFormat::from_bsdf2(c[0])?,
                    CompressedFormat::from_bsdf2(c[1])?,
                    CompressedFormat::from_bsdf2(c[2])?,
                ],
            )
        } else {
            return Err(Error::UnknownMagic(raw.magic));
        };

        let field = |name, value: [u8; 8]| {
            let n = offtin(value);
            u64::try_from(n).map_err(|_| Error::NegativeHeaderField(name, n))
        };

        let ctrl_len = field("control length", raw.ctrl_len)?;
        let diff_len = field("diff length", raw.diff_len)?;
        let new_size = field("new size", raw.new_size)?;

        let streams_end = ctrl_len
            .checked_add(diff_len)
            .and_then(|n| n.checked_add(Self::SIZE as u64));
        if streams_end.is_none_or(|n| n > patch.len() as u64) {
            return Err(Error::StreamsOutOfBounds {
                ctrl_len,
                diff_len,
                size: patch.len(),
            });
        }

        Ok(Self {
            format,
            compressors,
            ctrl_len,
            diff_len,
            new_size,
        })
    }
}

/// Apply a bsdiff patch. Old data is read from `old`, which must be exactly
/// `old_size` bytes long, and new data is written sequentially to `new`.
/// Exactly [`PatchHeader::new_size`] bytes are written on success. The header
/// is fully validated before anything is written.
pub fn apply(
    mut old: impl Read + Seek,
    old_size: u64,
    patch: &[u8],
    mut new: impl Write,
) -> Result<PatchHeader> {
    let header = PatchHeader::parse(patch)?;

    let ctrl_start = PatchHeader::SIZE;
    let diff_start = ctrl_start + header.ctrl_len as usize;
    let extra_start = diff_start + header.diff_len as usize;

    let mut ctrl = CompressedReader::with_format(
        &patch[ctrl_start..diff_start],
        header.compressors[0],
    )?;
    let mut diff =
        CompressedReader::with_format(&patch[diff_start..extra_start], header.compressors[1])?;
    let mut extra = CompressedReader::with_format(&patch[extra_start..], header.compressors[2])?;

    let mut old_buf = vec![0u8; BUF_SIZE];
    let mut new_buf = vec![0u8; BUF_SIZE];
    let mut new_pos = 0u64;
    let mut old_pos = 0u64;
    let mut index = 0u64;

    while new_pos < header.new_size {
        let entry: [u8; 24] = ctrl
            .read_array_exact()
            .map_err(|e| Error::DataRead("control", e))?;
        let field = |i: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&entry[i * 8..(i + 1) * 8]);
            offtin(buf)
        };
        let mix_len = field(0);
        let copy_len = field(1);
        let seek = field(2);

        let (Ok(mix_len), Ok(copy_len)) = (u64::try_from(mix_len), u64::try_from(copy_len)) else {
            return Err(Error::NegativeLength {
                index,
                mix_len,
                copy_len,
            });
        };

        if mix_len
            .checked_add(copy_len)
            .and_then(|n| n.checked_add(new_pos))
            .is_none_or(|n| n > header.new_size)
        {
            return Err(Error::NewOverflow {
                index,
                new_size: header.new_size,
            });
        }

        if old_pos
            .checked_add(mix_len)
            .is_none_or(|n| n > old_size)
        {
            return Err(Error::OldOutOfRange {
                index,
                offset: old_pos,
                len: mix_len,
                old_size,
            });
        }

        // New data is the sum of the diff stream and the old data.
        old.seek(SeekFrom::Start(old_pos)).map_err(Error::OldRead)?;

        let mut remaining = mix_len;
        while remaining > 0 {
            let n = remaining.min(BUF_SIZE as u64) as usize;

            diff.read_exact(&mut new_buf[..n])
                .map_err(|e| Error::DataRead("diff", e))?;
            old.read_exact(&mut old_buf[..n]).map_err(Error::OldRead)?;

            for (b, o) in new_buf[..n].iter_mut().zip(&old_buf[..n]) {
                *b = b.wrapping_add(*o);
            }

            new.write_all(&new_buf[..n]).map_err(Error::NewWrite)?;

            remaining -= n as u64;
        }

        new_pos += mix_len;
        old_pos += mix_len;

        // Followed by data that is copied as-is from the extra stream.
        stream::copy_n(&mut extra, &mut new, copy_len).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::DataRead("extra", e)
            } else {
                Error::NewWrite(e)
            }
        })?;

        new_pos += copy_len;

        old_pos = old_pos
            .checked_add_signed(seek)
            .filter(|n| *n <= old_size)
            .ok_or(Error::SeekOutOfRange {
                index,
                offset: old_pos,
                seek,
            })?;

        index += 1;
    }

    check_exhausted("control", ctrl)?;
    check_exhausted("diff", diff)?;
    check_exhausted("extra", extra)?;

    Ok(header)
}

/// Ensure that a patch stream has no data left after the output is complete.
fn check_exhausted(name: &'static str, mut reader: impl Read) -> Result<()> {
    let mut buf = [0u8; 1];

    if reader.read(&mut buf).map_err(|e| Error::DataRead(name, e))? != 0 {
        return Err(Error::TrailingData(name));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write};

    use assert_matches::assert_matches;
    use bzip2::{Compression, write::BzEncoder};

    use super::*;

    fn offtout(n: i64) -> [u8; 8] {
        let mut buf = n.unsigned_abs().to_le_bytes();
        if n < 0 {
            buf[7] |= 0x80;
        }
        buf
    }

    fn bz2(data: &[u8]) -> Vec<u8> {
        let mut encoder = BzEncoder::new(vec![], Compression::fast());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    /// Build a BSDIFF40 patch from raw control entries and uncompressed diff
    /// and extra streams.
    fn build_bsdiff40(
        entries: &[(i64, i64, i64)],
        diff: &[u8],
        extra: &[u8],
        new_size: i64,
    ) -> Vec<u8> {
        let mut ctrl = vec![];
        for (mix, copy, seek) in entries {
            ctrl.extend_from_slice(&offtout(*mix));
            ctrl.extend_from_slice(&offtout(*copy));
            ctrl.extend_from_slice(&offtout(*seek));
        }

        let ctrl = bz2(&ctrl);
        let diff = bz2(diff);
        let extra = bz2(extra);

        let mut patch = BSDIFF40_MAGIC.to_vec();
        patch.extend_from_slice(&offtout(ctrl.len() as i64));
        patch.extend_from_slice(&offtout(diff.len() as i64));
        patch.extend_from_slice(&offtout(new_size));
        patch.extend_from_slice(&ctrl);
        patch.extend_from_slice(&diff);
        patch.extend_from_slice(&extra);
        patch
    }

    /// Build a trivial patch that turns `old` into `new`. The common prefix is
    /// expressed as a diff against the old data and the rest as extra data.
    fn diff_bsdiff40(old: &[u8], new: &[u8]) -> Vec<u8> {
        let mix = old.len().min(new.len());
        let diff = new[..mix]
            .iter()
            .zip(&old[..mix])
            .map(|(n, o)| n.wrapping_sub(*o))
            .collect::<Vec<_>>();

        build_bsdiff40(
            &[(mix as i64, (new.len() - mix) as i64, 0)],
            &diff,
            &new[mix..],
            new.len() as i64,
        )
    }

    #[test]
    fn offtin_sign_magnitude() {
        assert_eq!(offtin(offtout(0)), 0);
        assert_eq!(offtin(offtout(1234)), 1234);
        assert_eq!(offtin(offtout(-1234)), -1234);
        assert_eq!(offtin([0, 0, 0, 0, 0, 0, 0, 0x80]), 0);
    }

    #[test]
    fn apply_bsdiff40() {
        let old = b"The quick brown fox jumps over the lazy dog";
        let new = b"The quick brown cat jumps over the lazy dog, twice";
        let patch = diff_bsdiff40(old, new);

        let mut output = vec![];
        let header = apply(Cursor::new(old), old.len() as u64, &patch, &mut output).unwrap();

        assert_eq!(header.format, PatchFormat::Bsdiff40);
        assert_eq!(header.new_size, new.len() as u64);
        assert_eq!(output, new);
    }

    #[test]
    fn apply_with_seek() {
        let old = b"0123456789";
        // Copy "6789" by seeking forward first, then "0123" by seeking back.
        let patch = build_bsdiff40(
            &[(0, 0, 6), (4, 0, -10), (4, 0, 0)],
            &[0u8; 8],
            b"",
            8,
        );

        let mut output = vec![];
        apply(Cursor::new(old), old.len() as u64, &patch, &mut output).unwrap();
        assert_eq!(output, b"67890123");
    }

    #[test]
    fn apply_bsdf2_uncompressed() {
        let old = b"aaaa";
        let mut ctrl = vec![];
        ctrl.extend_from_slice(&offtout(4));
        ctrl.extend_from_slice(&offtout(2));
        ctrl.extend_from_slice(&offtout(0));
        let diff = [1u8, 1, 1, 1];
        let extra = b"zz";

        let mut patch = BSDF2_MAGIC.to_vec();
        patch.extend_from_slice(&[0, 0, 0]);
        patch.extend_from_slice(&offtout(ctrl.len() as i64));
        patch.extend_from_slice(&offtout(diff.len() as i64));
        patch.extend_from_slice(&offtout(6));
        patch.extend_from_slice(&ctrl);
        patch.extend_from_slice(&diff);
        patch.extend_from_slice(extra);

        let mut output = vec![];
        let header = apply(Cursor::new(old), old.len() as u64, &patch, &mut output).unwrap();

        assert_eq!(header.format, PatchFormat::Bsdf2);
        assert_eq!(output, b"bbbbzz");
    }

    #[test]
    fn invalid_headers() {
        assert_matches!(
            PatchHeader::parse(b"BSDIFF40"),
            Err(Error::DataRead("header", _))
        );

        let mut patch = diff_bsdiff40(b"a", b"b");
        patch[0] = b'X';
        assert_matches!(PatchHeader::parse(&patch), Err(Error::UnknownMagic(_)));

        let mut patch = diff_bsdiff40(b"a", b"b");
        patch[24..32].copy_from_slice(&offtout(-1));
        assert_matches!(
            PatchHeader::parse(&patch),
            Err(Error::NegativeHeaderField("new size", -1))
        );

        let mut patch = diff_bsdiff40(b"a", b"b");
        patch[8..16].copy_from_slice(&offtout(1 << 40));
        assert_matches!(
            PatchHeader::parse(&patch),
            Err(Error::StreamsOutOfBounds { .. })
        );

        let mut patch = BSDF2_MAGIC.to_vec();
        patch.extend_from_slice(&[0, 9, 0]);
        patch.extend_from_slice(&[0u8; 24]);
        assert_matches!(
            PatchHeader::parse(&patch),
            Err(Error::Compression(compression::Error::UnknownCompressor(9)))
        );
    }

    #[test]
    fn invalid_control_entries() {
        let old = b"0123";
        let mut output = vec![];

        let patch = build_bsdiff40(&[(-1, 0, 0)], b"", b"", 4);
        assert_matches!(
            apply(Cursor::new(old), 4, &patch, &mut output),
            Err(Error::NegativeLength { index: 0, .. })
        );

        let patch = build_bsdiff40(&[(4, 1, 0)], &[0; 4], b"x", 4);
        assert_matches!(
            apply(Cursor::new(old), 4, &patch, &mut output),
            Err(Error::NewOverflow { index: 0, .. })
        );

        let patch = build_bsdiff40(&[(0, 0, 2), (4, 0, 0)], &[0; 4], b"", 4);
        assert_matches!(
            apply(Cursor::new(old), 4, &patch, &mut output),
            Err(Error::OldOutOfRange { index: 1, .. })
        );

        let patch = build_bsdiff40(&[(0, 0, -1)], b"", b"", 4);
        assert_matches!(
            apply(Cursor::new(old), 4, &patch, &mut output),
            Err(Error::SeekOutOfRange { index: 0, .. })
        );

        // Control stream ends before the output is complete.
        let patch = build_bsdiff40(&[(2, 0, 0)], &[0; 2], b"", 4);
        assert_matches!(
            apply(Cursor::new(old), 4, &patch, &mut output),
            Err(Error::DataRead("control", _))
        );

        // Output is complete, but unused entries or stream data remain.
        let patch = build_bsdiff40(&[(4, 0, 0), (0, 0, 0)], &[0; 4], b"", 4);
        assert_matches!(
            apply(Cursor::new(old), 4, &patch, &mut output),
            Err(Error::TrailingData("control"))
        );

        let patch = build_bsdiff40(&[(4, 0, 0)], &[0; 5], b"", 4);
        assert_matches!(
            apply(Cursor::new(old), 4, &patch, &mut output),
            Err(Error::TrailingData("diff"))
        );

        let patch = build_bsdiff40(&[(2, 2, 0)], &[0; 2], b"xyz", 4);
        assert_matches!(
            apply(Cursor::new(old), 4, &patch, &mut output),
            Err(Error::TrailingData("extra"))
        );
    }
}
