// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    io::{self, Read, Seek, SeekFrom, Write},
};

use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stream::{ReadAt, WriteAt};

/// Start block of an extent that does not map to any physical storage. Reads
/// from a hole return zeros and writes to a hole are discarded.
pub const SPARSE_HOLE: u64 = u64::MAX;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Block size must be non-zero")]
    ZeroBlockSize,
    #[error("Extent #{index}: Extent has no blocks")]
    EmptyExtent { index: usize },
    #[error("Extent #{index}: Byte range overflow: {extent} * {block_size}")]
    ExtentOverflow {
        index: usize,
        extent: Extent,
        block_size: u32,
    },
    #[error("Total extent length overflow")]
    TotalOverflow,
    #[error("Extent #{index}: {extent} exceeds partition size of {size} bytes")]
    OutOfBounds {
        index: usize,
        extent: Extent,
        size: u64,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// A contiguous run of blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Extent {
    pub start_block: u64,
    pub num_blocks: u64,
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_hole() {
            write!(f, "<hole>+{}", self.num_blocks)
        } else {
            write!(f, "{}+{}", self.start_block, self.num_blocks)
        }
    }
}

impl Extent {
    pub fn new(start_block: u64, num_blocks: u64) -> Self {
        Self {
            start_block,
            num_blocks,
        }
    }

    pub fn hole(num_blocks: u64) -> Self {
        Self::new(SPARSE_HOLE, num_blocks)
    }

    pub fn is_hole(&self) -> bool {
        self.start_block == SPARSE_HOLE
    }

    /// Length of the extent in bytes.
    pub fn byte_len(&self, block_size: u32) -> Option<u64> {
        self.num_blocks.checked_mul(block_size.into())
    }

    /// Physical byte offset of the start of the extent. Holes have no physical
    /// location.
    pub fn byte_offset(&self, block_size: u32) -> Option<u64> {
        if self.is_hole() {
            return None;
        }

        self.start_block.checked_mul(block_size.into())
    }

    /// Physical byte range covered by the extent, or [`None`] for a hole or if
    /// the end does not fit in a [`u64`].
    pub fn byte_end(&self, block_size: u32) -> Option<u64> {
        self.byte_offset(block_size)?
            .checked_add(self.byte_len(block_size)?)
    }
}

/// Total number of blocks covered by `extents`.
pub fn block_count(extents: &[Extent]) -> Result<u64> {
    extents
        .iter()
        .try_fold(0u64, |total, e| total.checked_add(e.num_blocks))
        .ok_or(Error::TotalOverflow)
}

/// Length in bytes of the logical stream formed by `extents`.
pub fn byte_len(extents: &[Extent], block_size: u32) -> Result<u64> {
    block_count(extents)?
        .checked_mul(block_size.into())
        .ok_or(Error::TotalOverflow)
}

/// Ensure that `extents` can be used for I/O with `block_size` and return the
/// length in bytes of the stream that they form.
pub fn validate(extents: &[Extent], block_size: u32) -> Result<u64> {
    ExtentMap::new(extents, block_size).map(|m| m.size)
}

/// Ensure that every non-hole extent lies within a partition of `size` bytes.
pub fn check_in_bounds(extents: &[Extent], block_size: u32, size: u64) -> Result<()> {
    for (index, extent) in extents.iter().enumerate() {
        if extent.is_hole() {
            continue;
        }

        let end = extent.byte_end(block_size).ok_or(Error::ExtentOverflow {
            index,
            extent: *extent,
            block_size,
        })?;

        if end > size {
            return Err(Error::OutOfBounds {
                index,
                extent: *extent,
                size,
            });
        }
    }

    Ok(())
}

/// Mapping between the logical byte stream described by an extent list and
/// the physical offsets of the underlying file.
struct ExtentMap<'a> {
    extents: &'a [Extent],
    /// Logical offset of the start of each extent.
    starts: Vec<u64>,
    block_size: u32,
    size: u64,
    pos: u64,
    /// Index of the extent containing `pos`. Equal to `extents.len()` at EOF.
    index: usize,
}

impl<'a> ExtentMap<'a> {
    fn new(extents: &'a [Extent], block_size: u32) -> Result<Self> {
        if block_size == 0 {
            return Err(Error::ZeroBlockSize);
        }

        let mut starts = Vec::with_capacity(extents.len());
        let mut size = 0u64;

        for (index, extent) in extents.iter().enumerate() {
            if extent.num_blocks == 0 {
                return Err(Error::EmptyExtent { index });
            }

            let overflow = || Error::ExtentOverflow {
                index,
                extent: *extent,
                block_size,
            };

            // Holes only need their length to fit. Everything else must have a
            // representable physical end offset so that later arithmetic
            // cannot overflow.
            let len = extent.byte_len(block_size).ok_or_else(overflow)?;
            if !extent.is_hole() {
                extent.byte_end(block_size).ok_or_else(overflow)?;
            }

            starts.push(size);
            size = size.checked_add(len).ok_or(Error::TotalOverflow)?;
        }

        Ok(Self {
            extents,
            starts,
            block_size,
            size,
            pos: 0,
            index: 0,
        })
    }

    fn locate(&self, pos: u64) -> usize {
        if pos >= self.size {
            self.extents.len()
        } else {
            self.starts.partition_point(|&s| s <= pos) - 1
        }
    }

    /// Return the physical offset (or [`None`] for a hole) and the number of
    /// bytes that can be transferred at the current position without crossing
    /// an extent boundary.
    fn chunk(&self, max: usize) -> Option<(Option<u64>, usize)> {
        let extent = self.extents.get(self.index)?;
        let block_size = u64::from(self.block_size);
        let offset_in_extent = self.pos - self.starts[self.index];
        let remaining = extent.num_blocks * block_size - offset_in_extent;
        let n = remaining.min(max as u64) as usize;

        let physical = extent
            .byte_offset(self.block_size)
            .map(|o| o + offset_in_extent);

        Some((physical, n))
    }

    fn advance(&mut self, n: usize) {
        self.pos += n as u64;

        let extent = &self.extents[self.index];
        let end = self.starts[self.index] + extent.num_blocks * u64::from(self.block_size);
        if self.pos == end {
            self.index += 1;
        }
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let invalid = || {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "Offset would be before the start of the extents",
            )
        };

        let new_pos = match pos {
            SeekFrom::Start(o) => o,
            SeekFrom::End(o) => self
                .size
                .to_i64()
                .and_then(|s| s.checked_add(o))
                .and_then(|s| s.to_u64())
                .ok_or_else(invalid)?,
            SeekFrom::Current(o) => self
                .pos
                .to_i64()
                .and_then(|s| s.checked_add(o))
                .and_then(|s| s.to_u64())
                .ok_or_else(invalid)?,
        };

        if new_pos > self.size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Offset {new_pos} is out of range for {} byte extents", self.size),
            ));
        }

        self.pos = new_pos;
        self.index = self.locate(new_pos);

        Ok(new_pos)
    }
}

/// A reader that presents a list of extents within a file as one contiguous,
/// seekable stream of `sum(num_blocks) * block_size` bytes.
pub struct ExtentReader<'a, R> {
    inner: R,
    map: ExtentMap<'a>,
}

impl<'a, R: ReadAt> ExtentReader<'a, R> {
    pub fn new(inner: R, extents: &'a [Extent], block_size: u32) -> Result<Self> {
        Ok(Self {
            inner,
            map: ExtentMap::new(extents, block_size)?,
        })
    }

    /// Total size of the logical stream.
    pub fn size(&self) -> u64 {
        self.map.size
    }

    pub fn position(&self) -> u64 {
        self.map.pos
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: ReadAt> Read for ExtentReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let Some((physical, n)) = self.map.chunk(buf.len()) else {
            return Ok(0);
        };

        match physical {
            // A short read here means the file is smaller than the extents
            // claim, which is a truncation, not EOF.
            Some(offset) => self.inner.read_exact_at(&mut buf[..n], offset)?,
            None => buf[..n].fill(0),
        }

        self.map.advance(n);

        Ok(n)
    }
}

impl<R: ReadAt> Seek for ExtentReader<'_, R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.map.seek(pos)
    }
}

/// A writer that presents a list of extents within a file as one contiguous,
/// seekable stream. Writing past the end of the last extent is an error.
pub struct ExtentWriter<'a, W> {
    inner: W,
    map: ExtentMap<'a>,
}

impl<'a, W: WriteAt> ExtentWriter<'a, W> {
    pub fn new(inner: W, extents: &'a [Extent], block_size: u32) -> Result<Self> {
        Ok(Self {
            inner,
            map: ExtentMap::new(extents, block_size)?,
        })
    }

    /// Total size of the logical stream.
    pub fn size(&self) -> u64 {
        self.map.size
    }

    pub fn position(&self) -> u64 {
        self.map.pos
    }

    /// Number of bytes between the current position and the end.
    pub fn remaining(&self) -> u64 {
        self.map.size - self.map.pos
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: WriteAt> Write for ExtentWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let Some((physical, n)) = self.map.chunk(buf.len()) else {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!(
                    "Attempted to write {} bytes past the end of {} byte extents",
                    buf.len(),
                    self.map.size,
                ),
            ));
        };

        if let Some(offset) = physical {
            self.inner.write_all_at(&buf[..n], offset)?;
        }

        self.map.advance(n);

        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.file_flush()
    }
}

impl<W: WriteAt> Seek for ExtentWriter<'_, W> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.map.seek(pos)
    }
}
