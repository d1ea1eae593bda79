// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::format::operation::OperationKind;

/// The only supported major payload version.
pub const BRILLO_MAJOR_PAYLOAD_VERSION: u64 = 2;

/// Full payload. No operation reads from a source partition.
pub const FULL_PAYLOAD_MINOR_VERSION: u32 = 0;
/// In-place delta payload. No longer supported.
pub const IN_PLACE_MINOR_PAYLOAD_VERSION: u32 = 1;
/// Delta payload that reads from a separate source partition.
pub const SOURCE_MINOR_PAYLOAD_VERSION: u32 = 2;
/// Adds source hashes to operations.
pub const OP_SRC_HASH_MINOR_PAYLOAD_VERSION: u32 = 3;
pub const BROTLI_BSDIFF_MINOR_PAYLOAD_VERSION: u32 = 4;
pub const PUFFDIFF_MINOR_PAYLOAD_VERSION: u32 = 5;
pub const VERITY_MINOR_PAYLOAD_VERSION: u32 = 6;
pub const PARTIAL_UPDATE_MINOR_PAYLOAD_VERSION: u32 = 7;
pub const ZUCCHINI_MINOR_PAYLOAD_VERSION: u32 = 8;
pub const LZ4DIFF_MINOR_PAYLOAD_VERSION: u32 = 9;

pub const MIN_SUPPORTED_MINOR_PAYLOAD_VERSION: u32 = SOURCE_MINOR_PAYLOAD_VERSION;
pub const MAX_SUPPORTED_MINOR_PAYLOAD_VERSION: u32 = LZ4DIFF_MINOR_PAYLOAD_VERSION;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unsupported major payload version: {0}")]
    UnsupportedMajor(u64),
    #[error("Unsupported minor payload version: {0}")]
    UnsupportedMinor(u32),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PayloadVersion {
    pub major: u64,
    pub minor: u32,
}

impl Default for PayloadVersion {
    fn default() -> Self {
        Self {
            major: BRILLO_MAJOR_PAYLOAD_VERSION,
            minor: FULL_PAYLOAD_MINOR_VERSION,
        }
    }
}

impl fmt::Display for PayloadVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl PayloadVersion {
    pub fn new(major: u64, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn validate(&self) -> Result<()> {
        if self.major != BRILLO_MAJOR_PAYLOAD_VERSION {
            return Err(Error::UnsupportedMajor(self.major));
        }

        if self.minor != FULL_PAYLOAD_MINOR_VERSION
            && !(MIN_SUPPORTED_MINOR_PAYLOAD_VERSION..=MAX_SUPPORTED_MINOR_PAYLOAD_VERSION)
                .contains(&self.minor)
        {
            return Err(Error::UnsupportedMinor(self.minor));
        }

        Ok(())
    }

    /// Whether this is a delta payload. Partial updates are also deltas.
    pub fn is_delta(&self) -> bool {
        self.minor != FULL_PAYLOAD_MINOR_VERSION
    }

    /// Whether the payload may carry operations of type `kind`.
    pub fn operation_allowed(&self, kind: OperationKind) -> bool {
        min_minor_version(kind).is_some_and(|m| self.minor >= m)
    }
}

/// Minimum minor version that permits `kind`, or [`None`] if `kind` is never
/// permitted.
pub fn min_minor_version(kind: OperationKind) -> Option<u32> {
    match kind {
        OperationKind::Replace
        | OperationKind::ReplaceBz
        | OperationKind::ReplaceXz
        | OperationKind::Zero
        | OperationKind::Discard => Some(FULL_PAYLOAD_MINOR_VERSION),
        OperationKind::SourceCopy | OperationKind::SourceBsdiff | OperationKind::Bsdiff => {
            Some(SOURCE_MINOR_PAYLOAD_VERSION)
        }
        OperationKind::BrotliBsdiff => Some(BROTLI_BSDIFF_MINOR_PAYLOAD_VERSION),
        OperationKind::Puffdiff => Some(PUFFDIFF_MINOR_PAYLOAD_VERSION),
        OperationKind::Zucchini => Some(ZUCCHINI_MINOR_PAYLOAD_VERSION),
        OperationKind::Lz4diffBsdiff | OperationKind::Lz4diffPuffdiff => {
            Some(LZ4DIFF_MINOR_PAYLOAD_VERSION)
        }
        OperationKind::Move => None,
    }
}
