// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Stream objects handed to patch engines. They present storage extents as an
//! ordinary seekable file with a known size so that an engine never needs to
//! know about blocks.

use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::{
    format::extent::{ExtentReader, ExtentWriter},
    stream::{ReadAt, WriteAt},
};

/// Readable side of a patch engine.
pub trait PatchSource: Read + Seek {
    /// Total size of the stream.
    fn size(&self) -> u64;
}

/// Writable side of a patch engine.
pub trait PatchSink: Write + Seek {
    /// Total size of the stream. Writing past this is an error.
    fn size(&self) -> u64;
}

/// Source stream backed by extents of the source partition.
pub struct ExtentSource<'a, R> {
    reader: ExtentReader<'a, R>,
}

impl<'a, R: ReadAt> ExtentSource<'a, R> {
    pub fn new(reader: ExtentReader<'a, R>) -> Self {
        Self { reader }
    }

    pub fn into_inner(self) -> ExtentReader<'a, R> {
        self.reader
    }
}

impl<R: ReadAt> Read for ExtentSource<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl<R: ReadAt> Seek for ExtentSource<'_, R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.reader.seek(pos)
    }
}

impl<R: ReadAt> PatchSource for ExtentSource<'_, R> {
    fn size(&self) -> u64 {
        self.reader.size()
    }
}

/// Sink stream backed by extents of the target partition. This keeps track of
/// the furthest offset that was written so that the caller can verify that
/// the engine populated the entire destination.
pub struct ExtentSink<'a, W> {
    writer: ExtentWriter<'a, W>,
    high_water: u64,
}

impl<'a, W: WriteAt> ExtentSink<'a, W> {
    pub fn new(writer: ExtentWriter<'a, W>) -> Self {
        Self {
            writer,
            high_water: 0,
        }
    }

    /// Offset one past the last byte written.
    pub fn written(&self) -> u64 {
        self.high_water
    }

    /// Whether every byte of the destination was written.
    pub fn is_complete(&self) -> bool {
        self.high_water == self.writer.size()
    }

    pub fn into_inner(self) -> ExtentWriter<'a, W> {
        self.writer
    }
}

impl<W: WriteAt> Write for ExtentSink<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writer.write(buf)?;
        self.high_water = self.high_water.max(self.writer.position());
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl<W: WriteAt> Seek for ExtentSink<'_, W> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.writer.seek(pos)
    }
}

impl<W: WriteAt> PatchSink for ExtentSink<'_, W> {
    fn size(&self) -> u64 {
        self.writer.size()
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

    use crate::{
        format::extent::{Extent, ExtentReader, ExtentWriter},
        stream::MutexFile,
    };

    use super::*;

    #[test]
    fn source_exposes_size() {
        let file = MutexFile::new(Cursor::new(b"aaaabbbbcccc".to_vec()));
        let extents = [Extent::new(2, 1), Extent::new(0, 1)];
        let mut source = ExtentSource::new(ExtentReader::new(&file, &extents, 4).unwrap());

        assert_eq!(source.size(), 8);

        let mut buf = vec![];
        source.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"ccccaaaa");

        source.seek(SeekFrom::Start(4)).unwrap();
        buf.clear();
        source.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"aaaa");
    }

    #[test]
    fn sink_tracks_completion() {
        let file = MutexFile::new(Cursor::new(vec![0u8; 8]));
        let extents = [Extent::new(1, 1), Extent::new(0, 1)];
        let mut sink = ExtentSink::new(ExtentWriter::new(&file, &extents, 4).unwrap());

        assert_eq!(sink.size(), 8);
        sink.write_all(b"wxyz").unwrap();
        assert_eq!(sink.written(), 4);
        assert!(!sink.is_complete());

        // Seeking backwards and rewriting does not count twice.
        sink.rewind().unwrap();
        sink.write_all(b"WX").unwrap();
        assert_eq!(sink.written(), 4);

        sink.seek(SeekFrom::Start(4)).unwrap();
        sink.write_all(b"abcd").unwrap();
        assert!(sink.is_complete());

        let err = sink.write_all(b"!").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);

        drop(sink);
        assert_eq!(&file.into_inner().into_inner(), b"abcdWXyz");
    }
}
