// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Narrow interfaces to binary diff engines. Each trait matches the call shape
//! that the engine family expects: stream objects for bsdiff and puffdiff,
//! in-memory buffers for zucchini, and a push callback for lz4diff.

use std::{fmt, io, sync::Arc};

use thiserror::Error;

use crate::{
    format::{bspatch, operation::OperationKind, zucchini},
    patch::adapter::{PatchSink, PatchSource},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to apply bsdiff patch")]
    Bspatch(#[from] bspatch::Error),
    #[error("Invalid zucchini patch")]
    Zucchini(#[from] zucchini::Error),
    #[error("Failed to decompress patch")]
    Decompress(#[source] io::Error),
    #[error("{engine}: {message}")]
    Failed {
        engine: &'static str,
        message: String,
    },
    #[error("I/O error")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Engine for BSDIFF, SOURCE_BSDIFF, and BROTLI_BSDIFF operations.
pub trait BsdiffEngine: Send + Sync {
    /// Size of the output that `patch` produces, if it can be determined
    /// without applying the patch. This is checked against the destination
    /// size before anything is written.
    fn output_size(&self, patch: &[u8]) -> Result<Option<u64>> {
        let _ = patch;
        Ok(None)
    }

    fn apply(
        &self,
        source: &mut dyn PatchSource,
        sink: &mut dyn PatchSink,
        patch: &[u8],
    ) -> Result<()>;
}

/// Engine for PUFFDIFF operations.
pub trait PuffDiffEngine: Send + Sync {
    /// `cache_size` bounds the memory the engine may use for caching
    /// decompressed deflate streams.
    fn apply(
        &self,
        source: &mut dyn PatchSource,
        sink: &mut dyn PatchSink,
        patch: &[u8],
        cache_size: usize,
    ) -> Result<()>;
}

/// Engine for ZUCCHINI operations. The patch has already been decompressed
/// and its header parsed. `new` has exactly the size declared in the header.
pub trait ZucchiniEngine: Send + Sync {
    fn apply(&self, old: &[u8], patch: &[u8], new: &mut [u8]) -> Result<()>;
}

/// Engine for LZ4DIFF_BSDIFF and LZ4DIFF_PUFFDIFF operations. Output is pushed
/// incrementally through `sink`.
pub trait Lz4DiffEngine: Send + Sync {
    fn apply(
        &self,
        kind: OperationKind,
        old: &[u8],
        patch: &[u8],
        sink: &mut dyn FnMut(&[u8]) -> io::Result<()>,
    ) -> Result<()>;
}

/// Built-in engine for the BSDIFF40 and BSDF2 patch formats.
#[derive(Clone, Copy, Debug, Default)]
pub struct Bspatch;

impl BsdiffEngine for Bspatch {
    fn output_size(&self, patch: &[u8]) -> Result<Option<u64>> {
        let header = bspatch::PatchHeader::parse(patch)?;
        Ok(Some(header.new_size))
    }

    fn apply(
        &self,
        source: &mut dyn PatchSource,
        sink: &mut dyn PatchSink,
        patch: &[u8],
    ) -> Result<()> {
        let old_size = source.size();
        bspatch::apply(source, old_size, patch, sink)?;
        Ok(())
    }
}

/// The set of engines available to the executor. Only the bsdiff engine is
/// built in. Operations that need a missing engine fail before anything is
/// written.
#[derive(Clone)]
pub struct PatchEngines {
    pub bsdiff: Arc<dyn BsdiffEngine>,
    pub puffdiff: Option<Arc<dyn PuffDiffEngine>>,
    pub zucchini: Option<Arc<dyn ZucchiniEngine>>,
    pub lz4diff: Option<Arc<dyn Lz4DiffEngine>>,
}

impl Default for PatchEngines {
    fn default() -> Self {
        Self {
            bsdiff: Arc::new(Bspatch),
            puffdiff: None,
            zucchini: None,
            lz4diff: None,
        }
    }
}

impl fmt::Debug for PatchEngines {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchEngines")
            .field("puffdiff", &self.puffdiff.is_some())
            .field("zucchini", &self.zucchini.is_some())
            .field("lz4diff", &self.lz4diff.is_some())
            .finish_non_exhaustive()
    }
}

impl PatchEngines {
    /// Whether an engine for `kind` is available. Operations that do not use
    /// an engine always return true.
    pub fn supports(&self, kind: OperationKind) -> bool {
        match kind {
            OperationKind::Puffdiff => self.puffdiff.is_some(),
            OperationKind::Zucchini => self.zucchini.is_some(),
            OperationKind::Lz4diffBsdiff | OperationKind::Lz4diffPuffdiff => {
                self.lz4diff.is_some()
            }
            OperationKind::Replace
            | OperationKind::ReplaceBz
            | OperationKind::ReplaceXz
            | OperationKind::Move
            | OperationKind::Bsdiff
            | OperationKind::SourceCopy
            | OperationKind::SourceBsdiff
            | OperationKind::Zero
            | OperationKind::Discard
            | OperationKind::BrotliBsdiff => true,
        }
    }
}
