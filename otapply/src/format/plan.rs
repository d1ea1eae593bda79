// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::format::{
    config::{
        self, DynamicPartitionMetadata, ImageConfig, PartitionConfig, PayloadGenerationConfig,
        PostInstallConfig, VerityConfig,
    },
    extent,
    operation::{self, InstallOperation, OperationKind},
    version::PayloadVersion,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration")]
    Config(#[from] config::Error),
    #[error("Partition {name:?}: Operation #{index}: {kind} is not allowed by payload version {version}")]
    OperationNotAllowed {
        name: String,
        index: usize,
        kind: OperationKind,
        version: PayloadVersion,
    },
    #[error("Partition {name:?}: Operation #{index}: Invalid operation")]
    InvalidOperation {
        name: String,
        index: usize,
        #[source]
        source: operation::Error,
    },
    #[error("Partition {name:?}: Operation #{index}: {field} out of bounds")]
    ExtentsOutOfBounds {
        name: String,
        index: usize,
        field: &'static str,
        #[source]
        source: extent::Error,
    },
    #[error("Partition {name:?}: Operation #{index}: {kind} requires a source image")]
    MissingSourceImage {
        name: String,
        index: usize,
        kind: OperationKind,
    },
    #[error("Partition {name:?}: Operation #{index}: Data range overflows")]
    DataRangeOverflow { name: String, index: usize },
    #[error("Operations have inline data, but no payload blob is specified")]
    MissingPayload,
}

type Result<T> = std::result::Result<T, Error>;

fn default_block_size() -> u32 {
    4096
}

/// A decoded update manifest along with the locations of the partition images
/// it applies to.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Plan {
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    /// File containing the inline data of all operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<PathBuf>,
    /// Offset of the start of the data blobs within [`Self::payload`].
    #[serde(default)]
    pub blob_offset: u64,
    pub version: PayloadVersion,
    #[serde(default)]
    pub partial_update: bool,
    #[serde(default)]
    pub partitions: Vec<PartitionPlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic_partition_metadata: Option<DynamicPartitionMetadata>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PartitionPlan {
    pub name: String,
    pub target: PathBuf,
    pub target_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_size: Option<u64>,
    /// Expected SHA-256 digest of the target partition after all operations.
    #[serde(
        default,
        with = "crate::util::opt_hex",
        skip_serializing_if = "Option::is_none"
    )]
    pub new_hash: Option<Vec<u8>>,
    /// Expected SHA-256 digest of the source partition.
    #[serde(
        default,
        with = "crate::util::opt_hex",
        skip_serializing_if = "Option::is_none"
    )]
    pub old_hash: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postinstall: Option<PostInstallConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verity: Option<VerityConfig>,
    #[serde(default)]
    pub operations: Vec<InstallOperation>,
}

impl PartitionPlan {
    /// Size of the source image. Defaults to the target size.
    pub fn source_size(&self) -> u64 {
        self.source_size.unwrap_or(self.target_size)
    }

    /// Number of operations of each type.
    pub fn operation_counts(&self) -> BTreeMap<OperationKind, usize> {
        let mut counts = BTreeMap::new();

        for op in &self.operations {
            *counts.entry(op.kind).or_default() += 1;
        }

        counts
    }
}

impl Plan {
    /// Make all relative paths relative to `base` instead of the current
    /// working directory.
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };

        if let Some(p) = &mut self.payload {
            resolve(p);
        }

        for partition in &mut self.partitions {
            resolve(&mut partition.target);

            if let Some(p) = &mut partition.source {
                resolve(p);
            }
        }
    }

    pub fn partition(&self, name: &str) -> Option<&PartitionPlan> {
        self.partitions.iter().find(|p| p.name == name)
    }

    pub fn to_generation_config(&self) -> PayloadGenerationConfig {
        let mut source = ImageConfig::default();
        let mut target = ImageConfig {
            partitions: vec![],
            dynamic_partition_metadata: self.dynamic_partition_metadata.clone(),
        };

        for p in &self.partitions {
            if let Some(path) = &p.source {
                source.partitions.push(PartitionConfig::new(
                    &p.name,
                    path,
                    p.source_size(),
                ));
            }

            target.partitions.push(PartitionConfig {
                name: p.name.clone(),
                path: p.target.clone(),
                size: p.target_size,
                postinstall: p.postinstall.clone(),
                verity: p.verity.clone(),
            });
        }

        PayloadGenerationConfig {
            source,
            target,
            version: self.version,
            is_delta: self.version.is_delta(),
            is_partial_update: self.partial_update,
            block_size: self.block_size,
        }
    }

    /// Validate the partition configuration and every operation. After this
    /// succeeds, every operation is well-formed, allowed by the payload
    /// version, and only touches blocks within its partitions.
    pub fn validate(&self) -> Result<()> {
        self.to_generation_config().validate()?;

        let mut has_data = false;

        for p in &self.partitions {
            for (index, op) in p.operations.iter().enumerate() {
                self.validate_operation(p, index, op)?;

                has_data |= op.data_len() > 0;
            }
        }

        if has_data && self.payload.is_none() {
            return Err(Error::MissingPayload);
        }

        Ok(())
    }

    fn validate_operation(
        &self,
        p: &PartitionPlan,
        index: usize,
        op: &InstallOperation,
    ) -> Result<()> {
        if !self.version.operation_allowed(op.kind) {
            return Err(Error::OperationNotAllowed {
                name: p.name.clone(),
                index,
                kind: op.kind,
                version: self.version,
            });
        }

        op.validate(self.block_size)
            .map_err(|e| Error::InvalidOperation {
                name: p.name.clone(),
                index,
                source: e,
            })?;

        if let (Some(offset), Some(length)) = (op.data_offset, op.data_length) {
            if offset
                .checked_add(length)
                .and_then(|n| n.checked_add(self.blob_offset))
                .is_none()
            {
                return Err(Error::DataRangeOverflow {
                    name: p.name.clone(),
                    index,
                });
            }
        }

        extent::check_in_bounds(&op.dst_extents, self.block_size, p.target_size).map_err(
            |e| Error::ExtentsOutOfBounds {
                name: p.name.clone(),
                index,
                field: "dst_extents",
                source: e,
            },
        )?;

        if op.kind.reads_source() {
            if p.source.is_none() {
                return Err(Error::MissingSourceImage {
                    name: p.name.clone(),
                    index,
                    kind: op.kind,
                });
            }

            extent::check_in_bounds(&op.src_extents, self.block_size, p.source_size()).map_err(
                |e| Error::ExtentsOutOfBounds {
                    name: p.name.clone(),
                    index,
                    field: "src_extents",
                    source: e,
                },
            )?;
        }

        Ok(())
    }
}
