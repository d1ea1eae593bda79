// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{self, Read, Write};

use bzip2::Decompress;
use liblzma::stream::{Action, Status, Stream};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to initialize XZ decoder")]
    XzInit(#[source] liblzma::stream::Error),
    #[error("Unknown compressor type: {0}")]
    UnknownCompressor(u8),
    #[error("{0:?} is not supported in this context")]
    UnsupportedFormat(CompressedFormat),
}

type Result<T> = std::result::Result<T, Error>;

/// Size of the scratch buffer that decoded data passes through on its way to
/// the inner writer.
const DECODE_BUF_SIZE: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum CompressedFormat {
    None,
    Bzip2,
    Xz,
    Brotli,
}

impl CompressedFormat {
    /// Parse the per-stream compressor byte used by BSDF2 patch headers.
    pub fn from_bsdf2(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Bzip2),
            2 => Ok(Self::Brotli),
            v => Err(Error::UnknownCompressor(v)),
        }
    }
}

fn truncated() -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "Compressed stream ended before the end-of-stream marker",
    )
}

fn trailing_data(n: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("Found {n} bytes of trailing data after the end of the compressed stream"),
    )
}

fn no_progress() -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        "Decoder made no progress on non-empty input",
    )
}

/// A writer that bzip2-decodes everything written to it and forwards the
/// decoded bytes to the inner writer. [`Self::finish`] must be called. A stream
/// that was never terminated is reported as an error there instead of being
/// silently accepted.
pub struct Bzip2DecodingWriter<W: Write> {
    inner: W,
    stream: Decompress,
    buf: Vec<u8>,
    done: bool,
}

impl<W: Write> Bzip2DecodingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            stream: Decompress::new(false),
            buf: vec![0u8; DECODE_BUF_SIZE],
            done: false,
        }
    }

    pub fn finish(mut self) -> io::Result<W> {
        if !self.done {
            return Err(truncated());
        }

        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for Bzip2DecodingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.done {
            return if buf.is_empty() {
                Ok(0)
            } else {
                Err(trailing_data(buf.len()))
            };
        }

        let mut input = buf;

        loop {
            let before_in = self.stream.total_in();
            let before_out = self.stream.total_out();

            let status = self
                .stream
                .decompress(input, &mut self.buf)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

            let consumed = (self.stream.total_in() - before_in) as usize;
            let produced = (self.stream.total_out() - before_out) as usize;

            self.inner.write_all(&self.buf[..produced])?;
            input = &input[consumed..];

            if matches!(status, bzip2::Status::StreamEnd) {
                self.done = true;
                if !input.is_empty() {
                    return Err(trailing_data(input.len()));
                }
                break;
            } else if input.is_empty() && produced < self.buf.len() {
                break;
            } else if consumed == 0 && produced == 0 {
                return Err(no_progress());
            }
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// A writer that XZ-decodes everything written to it and forwards the decoded
/// bytes to the inner writer. Like [`Bzip2DecodingWriter`], a missing stream
/// footer is an error in [`Self::finish`].
pub struct XzDecodingWriter<W: Write> {
    inner: W,
    stream: Stream,
    buf: Vec<u8>,
    done: bool,
}

impl<W: Write> XzDecodingWriter<W> {
    pub fn new(inner: W) -> Result<Self> {
        let stream = Stream::new_stream_decoder(u64::MAX, 0).map_err(Error::XzInit)?;

        Ok(Self {
            inner,
            stream,
            buf: vec![0u8; DECODE_BUF_SIZE],
            done: false,
        })
    }

    fn process(&mut self, mut input: &[u8], action: Action) -> io::Result<usize> {
        loop {
            let before_in = self.stream.total_in();
            let before_out = self.stream.total_out();

            let status = self
                .stream
                .process(input, &mut self.buf, action)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

            let consumed = (self.stream.total_in() - before_in) as usize;
            let produced = (self.stream.total_out() - before_out) as usize;

            self.inner.write_all(&self.buf[..produced])?;
            input = &input[consumed..];

            if matches!(status, Status::StreamEnd) {
                self.done = true;
                return Ok(input.len());
            } else if input.is_empty() && produced < self.buf.len() {
                return Ok(0);
            } else if consumed == 0 && produced == 0 {
                return Err(no_progress());
            }
        }
    }

    pub fn finish(mut self) -> io::Result<W> {
        if !self.done {
            // Drain anything that the decoder is still holding on to.
            self.process(&[], Action::Finish)?;

            if !self.done {
                return Err(truncated());
            }
        }

        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for XzDecodingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.done {
            return if buf.is_empty() {
                Ok(0)
            } else {
                Err(trailing_data(buf.len()))
            };
        }

        let leftover = self.process(buf, Action::Run)?;
        if leftover != 0 {
            return Err(trailing_data(leftover));
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// A decorator chain link that decodes data on its way into `W`. The variant is
/// picked when an operation is dispatched.
pub enum DecodingWriter<W: Write> {
    None(W),
    Bzip2(Bzip2DecodingWriter<W>),
    Xz(XzDecodingWriter<W>),
}

impl<W: Write> DecodingWriter<W> {
    pub fn new(writer: W, format: CompressedFormat) -> Result<Self> {
        match format {
            CompressedFormat::None => Ok(Self::None(writer)),
            CompressedFormat::Bzip2 => Ok(Self::Bzip2(Bzip2DecodingWriter::new(writer))),
            CompressedFormat::Xz => Ok(Self::Xz(XzDecodingWriter::new(writer)?)),
            // Never used for REPLACE-style operations.
            CompressedFormat::Brotli => Err(Error::UnsupportedFormat(format)),
        }
    }

    pub fn format(&self) -> CompressedFormat {
        match self {
            Self::None(_) => CompressedFormat::None,
            Self::Bzip2(_) => CompressedFormat::Bzip2,
            Self::Xz(_) => CompressedFormat::Xz,
        }
    }

    /// Finalize the decoder and return the inner writer. This fails if the
    /// compressed stream was incomplete.
    pub fn finish(self) -> io::Result<W> {
        match self {
            Self::None(w) => Ok(w),
            Self::Bzip2(w) => w.finish(),
            Self::Xz(w) => w.finish(),
        }
    }
}

impl<W: Write> Write for DecodingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::None(w) => w.write(buf),
            Self::Bzip2(w) => w.write(buf),
            Self::Xz(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::None(w) => w.flush(),
            Self::Bzip2(w) => w.flush(),
            Self::Xz(w) => w.flush(),
        }
    }
}

/// Read-side decoder for the sub-streams of a BSDF2 patch.
pub enum CompressedReader<R: Read> {
    None(R),
    Bzip2(bzip2::read::BzDecoder<R>),
    /// Boxed because the brotli decoder state is several KiB.
    Brotli(Box<brotli::Decompressor<R>>),
}

impl<R: Read> CompressedReader<R> {
    pub fn with_format(reader: R, format: CompressedFormat) -> Result<Self> {
        match format {
            CompressedFormat::None => Ok(Self::None(reader)),
            CompressedFormat::Bzip2 => Ok(Self::Bzip2(bzip2::read::BzDecoder::new(reader))),
            CompressedFormat::Brotli => {
                Ok(Self::Brotli(Box::new(brotli::Decompressor::new(reader, 4096))))
            }
            CompressedFormat::Xz => Err(Error::UnsupportedFormat(format)),
        }
    }

    pub fn format(&self) -> CompressedFormat {
        match self {
            Self::None(_) => CompressedFormat::None,
            Self::Bzip2(_) => CompressedFormat::Bzip2,
            Self::Brotli(_) => CompressedFormat::Brotli,
        }
    }
}

impl<R: Read> Read for CompressedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::None(r) => r.read(buf),
            Self::Bzip2(r) => r.read(buf),
            Self::Brotli(r) => r.read(buf),
        }
    }
}

/// Brotli-decode `data` entirely into memory. Decoding fails if the output
/// would exceed `limit` bytes.
pub fn brotli_decode(data: &[u8], limit: u64) -> io::Result<Vec<u8>> {
    let decoder = brotli::Decompressor::new(data, 4096);
    let mut output = Vec::new();

    decoder.take(limit.saturating_add(1)).read_to_end(&mut output)?;

    if output.len() as u64 > limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Brotli output exceeds limit of {limit} bytes"),
        ));
    }

    Ok(output)
}
