// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::{HashMap, HashSet},
    fs, io,
    path::PathBuf,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::format::{
    extent::Extent,
    version::{self, PayloadVersion},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid payload version")]
    Version(#[from] version::Error),
    #[error("Block size must be a non-zero power of two: {0}")]
    InvalidBlockSize(u32),
    #[error("Delta flag ({is_delta}) does not match payload version {version}")]
    DeltaMismatch {
        is_delta: bool,
        version: PayloadVersion,
    },
    #[error("Full payloads must not have source partitions: {0:?}")]
    FullPayloadHasSource(Vec<String>),
    #[error("Partial updates are not supported by payload version {0}")]
    PartialUpdateUnsupported(PayloadVersion),
    // Partition errors.
    #[error("Partition {name:?}: No path specified")]
    PartitionNoPath { name: String },
    #[error("Partition {name:?}: Failed to stat: {path:?}")]
    PartitionStat {
        name: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Partition {name:?}: Size is zero")]
    PartitionEmpty { name: String },
    #[error("Partition {name:?}: Declared size {size} exceeds file size {file_size}")]
    PartitionTooLarge {
        name: String,
        size: u64,
        file_size: u64,
    },
    #[error("Partition {name:?}: Size {size} is not a multiple of block size {block_size}")]
    PartitionUnaligned {
        name: String,
        size: u64,
        block_size: u32,
    },
    #[error("Partition {name:?}: Source partitions must not have postinstall config")]
    SourceHasPostInstall { name: String },
    #[error("Partition {name:?}: Source partitions must not have verity config")]
    SourceHasVerity { name: String },
    #[error("Partition {name:?}: Verity is not supported by payload version {version}")]
    VerityUnsupported {
        name: String,
        version: PayloadVersion,
    },
    #[error("Partition {name:?}: Duplicate partition name")]
    DuplicatePartition { name: String },
    // Dynamic partition group errors.
    #[error("Group {group:?}: Partition {name:?} is in more than one group")]
    GroupPartitionDuplicate { group: String, name: String },
    #[error("Group {group:?}: Partition {name:?} is not in the target image")]
    GroupPartitionMissing { group: String, name: String },
    #[error("Group {name:?}: Total size of partitions too large")]
    GroupTotalSizeTooLarge { name: String },
    #[error("Group {name:?}: Total partition size {size} exceeds limit {limit}")]
    GroupTotalSizeExceedsLimit { name: String, size: u64, limit: u64 },
}

type Result<T> = std::result::Result<T, Error>;

/// Postinstall step for a target partition.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PostInstallConfig {
    #[serde(default)]
    pub run: bool,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub filesystem_type: String,
    #[serde(default)]
    pub optional: bool,
}

/// dm-verity hash tree and FEC layout for a target partition.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct VerityConfig {
    pub hash_tree_data_extent: Extent,
    pub hash_tree_extent: Extent,
    pub hash_tree_algorithm: String,
    #[serde(with = "hex")]
    pub hash_tree_salt: Vec<u8>,
    pub fec_data_extent: Option<Extent>,
    pub fec_extent: Option<Extent>,
    #[serde(default)]
    pub fec_roots: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionConfig {
    pub name: String,
    pub path: PathBuf,
    /// Declared size of the partition. The file may be larger.
    pub size: u64,
    pub postinstall: Option<PostInstallConfig>,
    pub verity: Option<VerityConfig>,
}

impl PartitionConfig {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            size,
            postinstall: None,
            verity: None,
        }
    }

    /// Ensure that the partition image exists and is at least as large as the
    /// declared size.
    pub fn validate_exists(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(Error::PartitionNoPath {
                name: self.name.clone(),
            });
        }

        let metadata = fs::metadata(&self.path).map_err(|e| Error::PartitionStat {
            name: self.name.clone(),
            path: self.path.clone(),
            source: e,
        })?;

        if self.size == 0 {
            return Err(Error::PartitionEmpty {
                name: self.name.clone(),
            });
        } else if self.size > metadata.len() {
            return Err(Error::PartitionTooLarge {
                name: self.name.clone(),
                size: self.size,
                file_size: metadata.len(),
            });
        }

        Ok(())
    }

    fn validate_aligned(&self, block_size: u32) -> Result<()> {
        if self.size % u64::from(block_size) != 0 {
            return Err(Error::PartitionUnaligned {
                name: self.name.clone(),
                size: self.size,
                block_size,
            });
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct DynamicPartitionGroup {
    pub name: String,
    /// Maximum total size of all partitions in the group.
    pub size: u64,
    #[serde(default)]
    pub partition_names: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct DynamicPartitionMetadata {
    #[serde(default)]
    pub groups: Vec<DynamicPartitionGroup>,
}

impl DynamicPartitionMetadata {
    /// Ensure that every group can hold its partitions. `sizes` maps partition
    /// names to their sizes in the target image.
    pub fn validate(&self, sizes: &HashMap<&str, u64>) -> Result<()> {
        let mut seen = HashSet::new();

        for group in &self.groups {
            let mut total = 0u64;

            for name in &group.partition_names {
                if !seen.insert(name.as_str()) {
                    return Err(Error::GroupPartitionDuplicate {
                        group: group.name.clone(),
                        name: name.clone(),
                    });
                }

                let size = sizes
                    .get(name.as_str())
                    .ok_or_else(|| Error::GroupPartitionMissing {
                        group: group.name.clone(),
                        name: name.clone(),
                    })?;

                total = total
                    .checked_add(*size)
                    .ok_or_else(|| Error::GroupTotalSizeTooLarge {
                        name: group.name.clone(),
                    })?;
            }

            if total > group.size {
                return Err(Error::GroupTotalSizeExceedsLimit {
                    name: group.name.clone(),
                    size: total,
                    limit: group.size,
                });
            }
        }

        Ok(())
    }
}

/// Set of partitions making up one side of an update.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageConfig {
    pub partitions: Vec<PartitionConfig>,
    pub dynamic_partition_metadata: Option<DynamicPartitionMetadata>,
}

impl ImageConfig {
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn partition(&self, name: &str) -> Option<&PartitionConfig> {
        self.partitions.iter().find(|p| p.name == name)
    }

    fn validate_unique(&self) -> Result<()> {
        let mut seen = HashSet::new();

        for p in &self.partitions {
            if !seen.insert(p.name.as_str()) {
                return Err(Error::DuplicatePartition {
                    name: p.name.clone(),
                });
            }
        }

        Ok(())
    }

    pub fn validate_dynamic_partition_metadata(&self) -> Result<()> {
        let Some(metadata) = &self.dynamic_partition_metadata else {
            return Ok(());
        };

        let sizes = self
            .partitions
            .iter()
            .map(|p| (p.name.as_str(), p.size))
            .collect::<HashMap<_, _>>();

        metadata.validate(&sizes)
    }
}

/// Everything needed to decide whether a set of partitions can be updated by
/// a payload of a given version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PayloadGenerationConfig {
    pub source: ImageConfig,
    pub target: ImageConfig,
    pub version: PayloadVersion,
    pub is_delta: bool,
    pub is_partial_update: bool,
    pub block_size: u32,
}

impl Default for PayloadGenerationConfig {
    fn default() -> Self {
        Self {
            source: ImageConfig::default(),
            target: ImageConfig::default(),
            version: PayloadVersion::default(),
            is_delta: false,
            is_partial_update: false,
            block_size: 4096,
        }
    }
}

impl PayloadGenerationConfig {
    pub fn validate(&self) -> Result<()> {
        self.version.validate()?;

        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(Error::InvalidBlockSize(self.block_size));
        }

        if self.is_delta != self.version.is_delta() {
            return Err(Error::DeltaMismatch {
                is_delta: self.is_delta,
                version: self.version,
            });
        }

        if self.is_delta {
            self.source.validate_unique()?;

            for p in &self.source.partitions {
                p.validate_exists()?;
                p.validate_aligned(self.block_size)?;

                if p.postinstall.is_some() {
                    return Err(Error::SourceHasPostInstall {
                        name: p.name.clone(),
                    });
                } else if p.verity.is_some() {
                    return Err(Error::SourceHasVerity {
                        name: p.name.clone(),
                    });
                }
            }

            if self.is_partial_update
                && self.version.minor < version::PARTIAL_UPDATE_MINOR_PAYLOAD_VERSION
            {
                return Err(Error::PartialUpdateUnsupported(self.version));
            }
        } else if !self.source.is_empty() {
            return Err(Error::FullPayloadHasSource(
                self.source
                    .partitions
                    .iter()
                    .map(|p| p.name.clone())
                    .collect(),
            ));
        }

        self.target.validate_unique()?;

        for p in &self.target.partitions {
            p.validate_exists()?;
            p.validate_aligned(self.block_size)?;

            if self.is_delta
                && p.verity.is_some()
                && self.version.minor < version::VERITY_MINOR_PAYLOAD_VERSION
            {
                return Err(Error::VerityUnsupported {
                    name: p.name.clone(),
                    version: self.version,
                });
            }
        }

        self.target.validate_dynamic_partition_metadata()
    }
}
