// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::format::{
    compression::CompressedFormat,
    extent::{self, Extent},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown operation type: {0}")]
    UnknownKind(i32),
    #[error("{kind}: Operation has no destination extents")]
    NoDestination { kind: OperationKind },
    #[error("{kind}: Invalid {field}")]
    InvalidExtents {
        kind: OperationKind,
        field: &'static str,
        #[source]
        source: extent::Error,
    },
    #[error("{kind}: Operation requires data")]
    MissingData { kind: OperationKind },
    #[error("{kind}: Operation must not have data")]
    UnexpectedData { kind: OperationKind },
    #[error("{kind}: Operation requires source extents")]
    MissingSource { kind: OperationKind },
    #[error("{kind}: Operation must not have source extents")]
    UnexpectedSource { kind: OperationKind },
    #[error("{kind}: data_offset and data_length must be set together")]
    IncompleteDataRange { kind: OperationKind },
    #[error("{kind}: Data length {data_length} does not match destination size {dst_len}")]
    DataSizeMismatch {
        kind: OperationKind,
        data_length: u64,
        dst_len: u64,
    },
    #[error("{kind}: Source has {src_blocks} blocks, but destination has {dst_blocks} blocks")]
    BlockCountMismatch {
        kind: OperationKind,
        src_blocks: u64,
        dst_blocks: u64,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// Install operation type. The discriminants are the values used on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i32)]
pub enum OperationKind {
    Replace = 0,
    ReplaceBz = 1,
    Move = 2,
    Bsdiff = 3,
    SourceCopy = 4,
    SourceBsdiff = 5,
    Zero = 6,
    Discard = 7,
    ReplaceXz = 8,
    Puffdiff = 9,
    BrotliBsdiff = 10,
    Zucchini = 11,
    Lz4diffBsdiff = 12,
    Lz4diffPuffdiff = 13,
}

impl OperationKind {
    pub const ALL: [Self; 14] = [
        Self::Replace,
        Self::ReplaceBz,
        Self::Move,
        Self::Bsdiff,
        Self::SourceCopy,
        Self::SourceBsdiff,
        Self::Zero,
        Self::Discard,
        Self::ReplaceXz,
        Self::Puffdiff,
        Self::BrotliBsdiff,
        Self::Zucchini,
        Self::Lz4diffBsdiff,
        Self::Lz4diffPuffdiff,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Replace => "REPLACE",
            Self::ReplaceBz => "REPLACE_BZ",
            Self::Move => "MOVE",
            Self::Bsdiff => "BSDIFF",
            Self::SourceCopy => "SOURCE_COPY",
            Self::SourceBsdiff => "SOURCE_BSDIFF",
            Self::Zero => "ZERO",
            Self::Discard => "DISCARD",
            Self::ReplaceXz => "REPLACE_XZ",
            Self::Puffdiff => "PUFFDIFF",
            Self::BrotliBsdiff => "BROTLI_BSDIFF",
            Self::Zucchini => "ZUCCHINI",
            Self::Lz4diffBsdiff => "LZ4DIFF_BSDIFF",
            Self::Lz4diffPuffdiff => "LZ4DIFF_PUFFDIFF",
        }
    }

    /// Compression of the inline data for the replace family.
    pub fn replace_format(&self) -> Option<CompressedFormat> {
        match self {
            Self::Replace => Some(CompressedFormat::None),
            Self::ReplaceBz => Some(CompressedFormat::Bzip2),
            Self::ReplaceXz => Some(CompressedFormat::Xz),
            _ => None,
        }
    }

    /// Whether the operation reads from the source partition.
    pub fn reads_source(&self) -> bool {
        match self {
            Self::Replace | Self::ReplaceBz | Self::ReplaceXz | Self::Zero | Self::Discard => false,
            Self::Move
            | Self::Bsdiff
            | Self::SourceCopy
            | Self::SourceBsdiff
            | Self::Puffdiff
            | Self::BrotliBsdiff
            | Self::Zucchini
            | Self::Lz4diffBsdiff
            | Self::Lz4diffPuffdiff => true,
        }
    }

    /// Whether the operation carries inline data from the payload blob.
    pub fn has_data(&self) -> bool {
        match self {
            Self::Zero | Self::Discard | Self::SourceCopy | Self::Move => false,
            Self::Replace
            | Self::ReplaceBz
            | Self::ReplaceXz
            | Self::Bsdiff
            | Self::SourceBsdiff
            | Self::Puffdiff
            | Self::BrotliBsdiff
            | Self::Zucchini
            | Self::Lz4diffBsdiff
            | Self::Lz4diffPuffdiff => true,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<i32> for OperationKind {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| *k as i32 == value)
            .ok_or(Error::UnknownKind(value))
    }
}

/// One unit of work from the update manifest.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct InstallOperation {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub src_extents: Vec<Extent>,
    pub dst_extents: Vec<Extent>,
    /// Offset of the inline data relative to the start of the payload blob.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_length: Option<u64>,
    #[serde(
        default,
        with = "crate::util::opt_hex",
        skip_serializing_if = "Option::is_none"
    )]
    pub data_sha256_hash: Option<Vec<u8>>,
    #[serde(
        default,
        with = "crate::util::opt_hex",
        skip_serializing_if = "Option::is_none"
    )]
    pub src_sha256_hash: Option<Vec<u8>>,
}

impl InstallOperation {
    pub fn new(kind: OperationKind, dst_extents: Vec<Extent>) -> Self {
        Self {
            kind,
            src_extents: vec![],
            dst_extents,
            data_offset: None,
            data_length: None,
            data_sha256_hash: None,
            src_sha256_hash: None,
        }
    }

    /// Length of the inline data. Operations without data have a length of 0.
    pub fn data_len(&self) -> u64 {
        self.data_length.unwrap_or(0)
    }

    /// Check that the operation is internally consistent. This does not check
    /// whether the operation is allowed by the payload version.
    pub fn validate(&self, block_size: u32) -> Result<()> {
        let kind = self.kind;

        if self.dst_extents.is_empty() {
            return Err(Error::NoDestination { kind });
        }

        let dst_len = extent::validate(&self.dst_extents, block_size).map_err(|e| {
            Error::InvalidExtents {
                kind,
                field: "dst_extents",
                source: e,
            }
        })?;
        extent::validate(&self.src_extents, block_size).map_err(|e| Error::InvalidExtents {
            kind,
            field: "src_extents",
            source: e,
        })?;

        if self.data_offset.is_some() != self.data_length.is_some() {
            return Err(Error::IncompleteDataRange { kind });
        }

        if kind.has_data() {
            if self.data_len() == 0 {
                return Err(Error::MissingData { kind });
            }
        } else if self.data_len() != 0 || self.data_sha256_hash.is_some() {
            return Err(Error::UnexpectedData { kind });
        }

        if kind.reads_source() {
            if self.src_extents.is_empty() {
                return Err(Error::MissingSource { kind });
            }
        } else if !self.src_extents.is_empty() {
            return Err(Error::UnexpectedSource { kind });
        }

        match kind {
            OperationKind::Replace if self.data_len() != dst_len => {
                return Err(Error::DataSizeMismatch {
                    kind,
                    data_length: self.data_len(),
                    dst_len,
                });
            }
            OperationKind::SourceCopy => {
                // Both lists were validated above, so the sums cannot overflow.
                let src_blocks = extent::block_count(&self.src_extents).unwrap_or(u64::MAX);
                let dst_blocks = extent::block_count(&self.dst_extents).unwrap_or(u64::MAX);

                if src_blocks != dst_blocks {
                    return Err(Error::BlockCountMismatch {
                        kind,
                        src_blocks,
                        dst_blocks,
                    });
                }
            }
            _ => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn op(kind: OperationKind) -> InstallOperation {
        InstallOperation::new(kind, vec![Extent::new(0, 2)])
    }

    fn with_data(mut op: InstallOperation, len: u64) -> InstallOperation {
        op.data_offset = Some(0);
        op.data_length = Some(len);
        op
    }

    #[test]
    fn wire_numbers() {
        for (i, kind) in OperationKind::ALL.iter().enumerate() {
            assert_eq!(OperationKind::try_from(i as i32).unwrap(), *kind);
        }

        assert_matches!(OperationKind::try_from(14), Err(Error::UnknownKind(14)));
        assert_matches!(OperationKind::try_from(-1), Err(Error::UnknownKind(-1)));
    }

    #[test]
    fn valid_shapes() {
        with_data(op(OperationKind::Replace), 8192)
            .validate(4096)
            .unwrap();
        with_data(op(OperationKind::ReplaceXz), 100)
            .validate(4096)
            .unwrap();
        op(OperationKind::Zero).validate(4096).unwrap();

        let mut copy = op(OperationKind::SourceCopy);
        copy.src_extents = vec![Extent::new(10, 1), Extent::new(20, 1)];
        copy.validate(4096).unwrap();

        let mut diff = with_data(op(OperationKind::SourceBsdiff), 10);
        diff.src_extents = vec![Extent::new(10, 5)];
        diff.validate(4096).unwrap();
    }

    #[test]
    fn invalid_shapes() {
        assert_matches!(
            InstallOperation::new(OperationKind::Zero, vec![]).validate(4096),
            Err(Error::NoDestination { .. })
        );
        assert_matches!(
            InstallOperation::new(OperationKind::Zero, vec![Extent::new(0, 0)]).validate(4096),
            Err(Error::InvalidExtents {
                field: "dst_extents",
                ..
            })
        );
        assert_matches!(
            op(OperationKind::ReplaceBz).validate(4096),
            Err(Error::MissingData { .. })
        );
        assert_matches!(
            with_data(op(OperationKind::Discard), 1).validate(4096),
            Err(Error::UnexpectedData { .. })
        );
        assert_matches!(
            with_data(op(OperationKind::Zucchini), 1).validate(4096),
            Err(Error::MissingSource { .. })
        );

        let mut replace = with_data(op(OperationKind::Replace), 8192);
        replace.src_extents = vec![Extent::new(0, 2)];
        assert_matches!(
            replace.validate(4096),
            Err(Error::UnexpectedSource { .. })
        );

        assert_matches!(
            with_data(op(OperationKind::Replace), 4096).validate(4096),
            Err(Error::DataSizeMismatch {
                data_length: 4096,
                dst_len: 8192,
                ..
            })
        );

        let mut partial = op(OperationKind::ReplaceBz);
        partial.data_length = Some(10);
        assert_matches!(
            partial.validate(4096),
            Err(Error::IncompleteDataRange { .. })
        );

        let mut copy = op(OperationKind::SourceCopy);
        copy.src_extents = vec![Extent::new(0, 3)];
        assert_matches!(
            copy.validate(4096),
            Err(Error::BlockCountMismatch {
                src_blocks: 3,
                dst_blocks: 2,
                ..
            })
        );
    }
}
