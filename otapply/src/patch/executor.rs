// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{self, Write};

use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    format::{
        compression::{self, CompressedFormat, DecodingWriter},
        extent::{self, ExtentReader, ExtentWriter},
        operation::{self, InstallOperation, OperationKind},
        version::{self, PayloadVersion},
        zucchini,
    },
    patch::{
        adapter::{ExtentSink, ExtentSource, PatchSink},
        engine::{self, PatchEngines},
    },
    stream::{self, ReadAt, ReadFixedSizeExt, WriteAt, WriteZerosExt},
    util::NumBytes,
};

/// Default memory bound for the puffdiff engine's deflate stream cache.
pub const DEFAULT_PUFFDIFF_CACHE_SIZE: usize = 5 * 1024 * 1024;

/// Default upper bound on the amount of source or output data that may be held
/// in memory at once by the zucchini and lz4diff paths.
pub const DEFAULT_MAX_MATERIALIZE_SIZE: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors.
    #[error("Invalid payload version")]
    Version(#[from] version::Error),
    #[error("Block size must be a non-zero power of two: {0}")]
    InvalidBlockSize(u32),
    #[error("{kind}: Invalid operation")]
    InvalidOperation {
        kind: OperationKind,
        #[source]
        source: operation::Error,
    },
    #[error("{kind}: Invalid extents")]
    InvalidExtents {
        kind: OperationKind,
        #[source]
        source: extent::Error,
    },
    // Unsupported operation errors.
    #[error("{kind}: Operation is not allowed by payload version {version}")]
    UnsupportedOperation {
        kind: OperationKind,
        version: PayloadVersion,
    },
    #[error("{kind}: No patch engine is available")]
    MissingEngine { kind: OperationKind },
    #[error("{kind}: Operation requires a source partition")]
    MissingSource { kind: OperationKind },
    // Size errors.
    #[error("{kind}: Expected {expected} of data, but have {actual}")]
    DataLength {
        kind: OperationKind,
        expected: NumBytes<u64>,
        actual: NumBytes<u64>,
    },
    #[error("{kind}: Output is {actual}, but destination is {expected}")]
    SizeMismatch {
        kind: OperationKind,
        expected: NumBytes<u64>,
        actual: NumBytes<u64>,
    },
    #[error("{kind}: {size} exceeds in-memory limit of {limit}")]
    MaterializeTooLarge {
        kind: OperationKind,
        size: NumBytes<u64>,
        limit: NumBytes<u64>,
    },
    // Integrity errors.
    #[error("{kind}: Expected {what} sha256 {expected}, but have {actual}")]
    MismatchedDigest {
        kind: OperationKind,
        what: &'static str,
        expected: String,
        actual: String,
    },
    // Engine errors.
    #[error("{kind}: Failed to decode data")]
    Compression {
        kind: OperationKind,
        #[source]
        source: compression::Error,
    },
    #[error("{kind}: Patch engine failed")]
    PatchEngine {
        kind: OperationKind,
        #[source]
        source: engine::Error,
    },
    // I/O errors.
    #[error("{kind}: Short read or write")]
    ShortIo {
        kind: OperationKind,
        #[source]
        source: io::Error,
    },
    #[error("{kind}: Offset out of range")]
    OutOfRange {
        kind: OperationKind,
        #[source]
        source: io::Error,
    },
    #[error("{kind}: I/O error")]
    Io {
        kind: OperationKind,
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Classify an I/O error that occurred while applying an operation of type
    /// `kind`.
    fn io(kind: OperationKind, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::UnexpectedEof => Self::ShortIo { kind, source },
            io::ErrorKind::WriteZero | io::ErrorKind::InvalidInput => {
                Self::OutOfRange { kind, source }
            }
            _ => Self::Io { kind, source },
        }
    }

    /// Operation type that the error relates to, if any.
    pub fn kind(&self) -> Option<OperationKind> {
        match self {
            Self::Version(_) | Self::InvalidBlockSize(_) => None,
            Self::InvalidOperation { kind, .. }
            | Self::InvalidExtents { kind, .. }
            | Self::UnsupportedOperation { kind, .. }
            | Self::MissingEngine { kind }
            | Self::MissingSource { kind }
            | Self::DataLength { kind, .. }
            | Self::SizeMismatch { kind, .. }
            | Self::MaterializeTooLarge { kind, .. }
            | Self::MismatchedDigest { kind, .. }
            | Self::Compression { kind, .. }
            | Self::PatchEngine { kind, .. }
            | Self::ShortIo { kind, .. }
            | Self::OutOfRange { kind, .. }
            | Self::Io { kind, .. } => Some(*kind),
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Tunables for the executor. These are fixed for the lifetime of an
/// [`Executor`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutorOptions {
    pub puffdiff_cache_size: usize,
    pub max_materialize_size: u64,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            puffdiff_cache_size: DEFAULT_PUFFDIFF_CACHE_SIZE,
            max_materialize_size: DEFAULT_MAX_MATERIALIZE_SIZE,
        }
    }
}

/// Applies individual install operations. The executor holds no per-operation
/// state, so one instance can be shared by threads working on different
/// partitions.
#[derive(Clone, Debug)]
pub struct Executor {
    version: PayloadVersion,
    block_size: u32,
    options: ExecutorOptions,
    engines: PatchEngines,
}

impl Executor {
    pub fn new(
        version: PayloadVersion,
        block_size: u32,
        options: ExecutorOptions,
        engines: PatchEngines,
    ) -> Result<Self> {
        version.validate()?;

        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(Error::InvalidBlockSize(block_size));
        }

        Ok(Self {
            version,
            block_size,
            options,
            engines,
        })
    }

    pub fn version(&self) -> PayloadVersion {
        self.version
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    pub fn engines(&self) -> &PatchEngines {
        &self.engines
    }

    /// Apply `op` to `target`. `data` is the operation's inline data and must
    /// be exactly [`InstallOperation::data_len`] bytes. `source` is required
    /// for operations that read from the source partition.
    ///
    /// On success, every byte of the destination extents has been written.
    /// Everything that can be checked without applying the operation,
    /// including whether it is allowed, whether the required engine exists,
    /// and the data and source digests, is checked before the first write.
    pub fn execute(
        &self,
        op: &InstallOperation,
        target: &dyn WriteAt,
        source: Option<&dyn ReadAt>,
        data: &[u8],
    ) -> Result<()> {
        let kind = op.kind;

        if !self.version.operation_allowed(kind) {
            return Err(Error::UnsupportedOperation {
                kind,
                version: self.version,
            });
        }

        op.validate(self.block_size)
            .map_err(|e| Error::InvalidOperation { kind, source: e })?;

        if data.len() as u64 != op.data_len() {
            return Err(Error::DataLength {
                kind,
                expected: NumBytes(op.data_len()),
                actual: NumBytes(data.len() as u64),
            });
        }

        if !self.engines.supports(kind) {
            return Err(Error::MissingEngine { kind });
        }

        if let Some(expected) = &op.data_sha256_hash {
            let digest = ring::digest::digest(&ring::digest::SHA256, data);
            check_digest(kind, "data", expected, digest.as_ref())?;
        }

        let source = if kind.reads_source() {
            let source = source.ok_or(Error::MissingSource { kind })?;
            self.check_source_digest(op, source)?;
            Some(source)
        } else {
            None
        };

        trace!(
            "Applying {kind} with {} to {} extents",
            NumBytes(data.len()),
            op.dst_extents.len(),
        );

        match (kind, source) {
            (OperationKind::Replace | OperationKind::ReplaceBz | OperationKind::ReplaceXz, _) => {
                let format = kind.replace_format().unwrap_or(CompressedFormat::None);
                self.apply_replace(op, target, data, format)
            }
            (OperationKind::Zero | OperationKind::Discard, _) => self.apply_zero(op, target),
            (OperationKind::SourceCopy, Some(source)) => {
                self.apply_source_copy(op, target, source)
            }
            (
                OperationKind::Bsdiff | OperationKind::SourceBsdiff | OperationKind::BrotliBsdiff,
                Some(source),
            ) => self.apply_bsdiff(op, target, source, data),
            (OperationKind::Puffdiff, Some(source)) => {
                self.apply_puffdiff(op, target, source, data)
            }
            (OperationKind::Zucchini, Some(source)) => {
                self.apply_zucchini(op, target, source, data)
            }
            (OperationKind::Lz4diffBsdiff | OperationKind::Lz4diffPuffdiff, Some(source)) => {
                self.apply_lz4diff(op, target, source, data)
            }
            // In-place operations are never allowed by any supported version.
            (OperationKind::Move, _) => Err(Error::UnsupportedOperation {
                kind,
                version: self.version,
            }),
            (_, None) => Err(Error::MissingSource { kind }),
        }
    }

    fn writer<'a>(
        &self,
        op: &'a InstallOperation,
        target: &'a dyn WriteAt,
    ) -> Result<ExtentWriter<'a, &'a dyn WriteAt>> {
        ExtentWriter::new(target, &op.dst_extents, self.block_size)
            .map_err(|e| Error::InvalidExtents { kind: op.kind, source: e })
    }

    fn reader<'a>(
        &self,
        op: &'a InstallOperation,
        source: &'a dyn ReadAt,
    ) -> Result<ExtentReader<'a, &'a dyn ReadAt>> {
        ExtentReader::new(source, &op.src_extents, self.block_size)
            .map_err(|e| Error::InvalidExtents { kind: op.kind, source: e })
    }

    fn check_source_digest(&self, op: &InstallOperation, source: &dyn ReadAt) -> Result<()> {
        let Some(expected) = &op.src_sha256_hash else {
            return Ok(());
        };

        let reader = self.reader(op, source)?;
        let size = reader.size();
        let digest = stream::sha256_n(reader, size).map_err(|e| Error::io(op.kind, e))?;

        check_digest(op.kind, "source", expected, digest.as_ref())
    }

    /// Ensure that `writer` was filled exactly and flush it.
    fn finish_writer(kind: OperationKind, writer: &mut ExtentWriter<&dyn WriteAt>) -> Result<()> {
        if writer.remaining() != 0 {
            return Err(Error::SizeMismatch {
                kind,
                expected: NumBytes(writer.size()),
                actual: NumBytes(writer.position()),
            });
        }

        writer.flush().map_err(|e| Error::io(kind, e))
    }

    fn apply_replace(
        &self,
        op: &InstallOperation,
        target: &dyn WriteAt,
        data: &[u8],
        format: CompressedFormat,
    ) -> Result<()> {
        let kind = op.kind;
        let mut writer = self.writer(op, target)?;

        let mut decoder = DecodingWriter::new(&mut writer, format)
            .map_err(|e| Error::Compression { kind, source: e })?;
        decoder.write_all(data).map_err(|e| Error::io(kind, e))?;
        decoder.finish().map_err(|e| Error::io(kind, e))?;

        Self::finish_writer(kind, &mut writer)
    }

    fn apply_zero(&self, op: &InstallOperation, target: &dyn WriteAt) -> Result<()> {
        let kind = op.kind;
        let mut writer = self.writer(op, target)?;

        // DISCARD is only a hint that the blocks are no longer needed. They
        // must still read back as zeros afterwards.
        let size = writer.size();
        writer
            .write_zeros_exact(size)
            .map_err(|e| Error::io(kind, e))?;

        Self::finish_writer(kind, &mut writer)
    }

    fn apply_source_copy(
        &self,
        op: &InstallOperation,
        target: &dyn WriteAt,
        source: &dyn ReadAt,
    ) -> Result<()> {
        let kind = op.kind;
        let mut reader = self.reader(op, source)?;
        let mut writer = self.writer(op, target)?;

        if reader.size() != writer.size() {
            return Err(Error::SizeMismatch {
                kind,
                expected: NumBytes(writer.size()),
                actual: NumBytes(reader.size()),
            });
        }

        let size = reader.size();
        stream::copy_n(&mut reader, &mut writer, size).map_err(|e| Error::io(kind, e))?;

        Self::finish_writer(kind, &mut writer)
    }

    /// Ensure that an engine filled `sink` exactly and flush it.
    fn finish_sink(kind: OperationKind, sink: &mut ExtentSink<&dyn WriteAt>) -> Result<()> {
        if !sink.is_complete() {
            return Err(Error::SizeMismatch {
                kind,
                expected: NumBytes(sink.size()),
                actual: NumBytes(sink.written()),
            });
        }

        sink.flush().map_err(|e| Error::io(kind, e))
    }

    fn apply_bsdiff(
        &self,
        op: &InstallOperation,
        target: &dyn WriteAt,
        source: &dyn ReadAt,
        data: &[u8],
    ) -> Result<()> {
        let kind = op.kind;
        let engine = &self.engines.bsdiff;
        let mut source = ExtentSource::new(self.reader(op, source)?);
        let mut sink = ExtentSink::new(self.writer(op, target)?);

        let output_size = engine
            .output_size(data)
            .map_err(|e| Error::PatchEngine { kind, source: e })?;
        if let Some(size) = output_size {
            if size != sink.size() {
                return Err(Error::SizeMismatch {
                    kind,
                    expected: NumBytes(sink.size()),
                    actual: NumBytes(size),
                });
            }
        }

        engine
            .apply(&mut source, &mut sink, data)
            .map_err(|e| Error::PatchEngine { kind, source: e })?;

        Self::finish_sink(kind, &mut sink)
    }

    fn apply_puffdiff(
        &self,
        op: &InstallOperation,
        target: &dyn WriteAt,
        source: &dyn ReadAt,
        data: &[u8],
    ) -> Result<()> {
        let kind = op.kind;
        let engine = self
            .engines
            .puffdiff
            .as_ref()
            .ok_or(Error::MissingEngine { kind })?;
        let mut source = ExtentSource::new(self.reader(op, source)?);
        let mut sink = ExtentSink::new(self.writer(op, target)?);

        engine
            .apply(
                &mut source,
                &mut sink,
                data,
                self.options.puffdiff_cache_size,
            )
            .map_err(|e| Error::PatchEngine { kind, source: e })?;

        Self::finish_sink(kind, &mut sink)
    }

    fn check_materialize_size(&self, kind: OperationKind, size: u64) -> Result<usize> {
        let limit = self.options.max_materialize_size;

        usize::try_from(size)
            .ok()
            .filter(|_| size <= limit)
            .ok_or(Error::MaterializeTooLarge {
                kind,
                size: NumBytes(size),
                limit: NumBytes(limit),
            })
    }

    /// Read all source extents into memory.
    fn materialize(&self, op: &InstallOperation, source: &dyn ReadAt) -> Result<Vec<u8>> {
        let mut reader = self.reader(op, source)?;
        let size = self.check_materialize_size(op.kind, reader.size())?;

        debug!("Loading {} of source data into memory", NumBytes(size));

        reader
            .read_vec_exact(size)
            .map_err(|e| Error::io(op.kind, e))
    }

    fn apply_zucchini(
        &self,
        op: &InstallOperation,
        target: &dyn WriteAt,
        source: &dyn ReadAt,
        data: &[u8],
    ) -> Result<()> {
        let kind = op.kind;
        let engine = self
            .engines
            .zucchini
            .as_ref()
            .ok_or(Error::MissingEngine { kind })?;
        let mut writer = self.writer(op, target)?;
        let dst_len = writer.size();

        let patch = compression::brotli_decode(data, self.options.max_materialize_size)
            .map_err(|e| Error::PatchEngine {
                kind,
                source: engine::Error::Decompress(e),
            })?;
        let header = zucchini::PatchHeader::parse(&patch).map_err(|e| Error::PatchEngine {
            kind,
            source: e.into(),
        })?;

        // The header is untrusted. It must agree with the destination before
        // any memory is allocated for the output or anything is written.
        if u64::from(header.new_size) != dst_len {
            return Err(Error::SizeMismatch {
                kind,
                expected: NumBytes(dst_len),
                actual: NumBytes(header.new_size.into()),
            });
        }

        let new_size = self.check_materialize_size(kind, dst_len)?;
        let old = self.materialize(op, source)?;
        let mut new = vec![0u8; new_size];

        engine
            .apply(&old, &patch, &mut new)
            .map_err(|e| Error::PatchEngine { kind, source: e })?;
        drop(old);

        writer.write_all(&new).map_err(|e| Error::io(kind, e))?;

        Self::finish_writer(kind, &mut writer)
    }

    fn apply_lz4diff(
        &self,
        op: &InstallOperation,
        target: &dyn WriteAt,
        source: &dyn ReadAt,
        data: &[u8],
    ) -> Result<()> {
        let kind = op.kind;
        let engine = self
            .engines
            .lz4diff
            .as_ref()
            .ok_or(Error::MissingEngine { kind })?;
        let old = self.materialize(op, source)?;
        let mut writer = self.writer(op, target)?;

        engine
            .apply(kind, &old, data, &mut |chunk: &[u8]| writer.write_all(chunk))
            .map_err(|e| Error::PatchEngine { kind, source: e })?;

        Self::finish_writer(kind, &mut writer)
    }
}

fn check_digest(
    kind: OperationKind,
    what: &'static str,
    expected: &[u8],
    actual: &[u8],
) -> Result<()> {
    if expected != actual {
        return Err(Error::MismatchedDigest {
            kind,
            what,
            expected: hex::encode(expected),
            actual: hex::encode(actual),
        });
    }

    Ok(())
}
