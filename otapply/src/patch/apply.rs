// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::BTreeSet,
    fs::{File, OpenOptions},
    io,
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
};

use rayon::iter::{IntoParallelIterator, ParallelIterator};
use thiserror::Error;
use tracing::{debug, debug_span, error, info, warn};

use crate::{
    format::{
        operation::{InstallOperation, OperationKind},
        plan::{PartitionPlan, Plan},
    },
    patch::executor::{self, Executor},
    stream::{self, FileLen, ReadAt, WriteAt},
    util::NumBytes,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Partitions not found in plan: {0:?}")]
    MissingPartitions(BTreeSet<String>),
    #[error("Failed to open payload: {0:?}")]
    PayloadOpen(PathBuf, #[source] io::Error),
    #[error("Operations have inline data, but no payload is available")]
    MissingPayload,
    #[error("Partition {name:?}: Operation #{index}: No patch engine available for {kind}")]
    MissingEngine {
        name: String,
        index: usize,
        kind: OperationKind,
    },
    #[error("Partition {name:?}: Failed to open {what} image: {path:?}")]
    ImageOpen {
        name: String,
        what: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Partition {name:?}: Failed to get {what} image size")]
    ImageStat {
        name: String,
        what: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("Partition {name:?}: {what} image is {file_size}, but must be at least {size}")]
    ImageTooSmall {
        name: String,
        what: &'static str,
        size: NumBytes<u64>,
        file_size: NumBytes<u64>,
    },
    #[error("Partition {name:?}: Operation #{index}: Failed to read {len} of data at offset {offset}")]
    DataRead {
        name: String,
        index: usize,
        offset: u64,
        len: NumBytes<u64>,
        #[source]
        source: io::Error,
    },
    #[error("Partition {name:?}: Operation #{index}: Failed to apply operation")]
    Operation {
        name: String,
        index: usize,
        #[source]
        source: executor::Error,
    },
    #[error("Partition {name:?}: Failed to hash {what} image")]
    Hash {
        name: String,
        what: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("Partition {name:?}: Expected {what} sha256 {expected}, but have {actual}")]
    MismatchedDigest {
        name: String,
        what: &'static str,
        expected: String,
        actual: String,
    },
    #[error("Partition {name:?}: Interrupted after {done} of {total} operations")]
    Interrupted {
        name: String,
        done: usize,
        total: usize,
        #[source]
        source: io::Error,
    },
    #[error("Partition {name:?}: Aborted after {done} of {total} operations because another partition failed")]
    Aborted {
        name: String,
        done: usize,
        total: usize,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// Already opened files for one partition.
#[derive(Clone, Copy)]
pub struct PartitionFiles<'a> {
    pub target: &'a dyn WriteAt,
    pub source: Option<&'a dyn ReadAt>,
    /// File containing the operations' inline data.
    pub payload: Option<&'a dyn ReadAt>,
    /// Offset of the data blobs within [`Self::payload`].
    pub blob_offset: u64,
}

fn check_image_size(
    partition: &PartitionPlan,
    what: &'static str,
    file: &(impl FileLen + ?Sized),
    size: u64,
) -> Result<()> {
    let file_size = file.file_len().map_err(|e| Error::ImageStat {
        name: partition.name.clone(),
        what,
        source: e,
    })?;

    if file_size < size {
        return Err(Error::ImageTooSmall {
            name: partition.name.clone(),
            what,
            size: NumBytes(size),
            file_size: NumBytes(file_size),
        });
    }

    Ok(())
}

fn check_image_digest(
    partition: &PartitionPlan,
    what: &'static str,
    file: &dyn ReadAt,
    size: u64,
    expected: &[u8],
) -> Result<()> {
    let digest = stream::sha256_at(file, size).map_err(|e| Error::Hash {
        name: partition.name.clone(),
        what,
        source: e,
    })?;

    if digest.as_ref() != expected {
        return Err(Error::MismatchedDigest {
            name: partition.name.clone(),
            what,
            expected: hex::encode(expected),
            actual: hex::encode(digest),
        });
    }

    Ok(())
}

fn read_data(
    partition: &PartitionPlan,
    index: usize,
    op: &InstallOperation,
    files: &PartitionFiles,
) -> Result<Vec<u8>> {
    let (Some(offset), Some(length)) = (op.data_offset, op.data_length) else {
        return Ok(vec![]);
    };
    if length == 0 {
        return Ok(vec![]);
    }

    let payload = files.payload.ok_or(Error::MissingPayload)?;
    let data_read_error = |offset, source| Error::DataRead {
        name: partition.name.clone(),
        index,
        offset,
        len: NumBytes(length),
        source,
    };

    // Validated plans guarantee that this cannot overflow.
    let offset = files.blob_offset.checked_add(offset).ok_or_else(|| {
        data_read_error(
            offset,
            io::Error::new(io::ErrorKind::InvalidInput, "Data offset overflow"),
        )
    })?;
    let len = usize::try_from(length).map_err(|_| {
        data_read_error(
            offset,
            io::Error::new(io::ErrorKind::InvalidInput, "Data too large"),
        )
    })?;

    let mut data = vec![0u8; len];
    payload
        .read_exact_at(&mut data, offset)
        .map_err(|e| data_read_error(offset, e))?;

    Ok(data)
}

/// Apply every operation of `partition` in order. The source hash is checked
/// before the first operation and the target hash after the last one if
/// `verify` is true and the hashes are known.
///
/// `cancel_signal` is only checked between operations. An operation that was
/// started always runs to completion or failure.
pub fn apply_partition(
    executor: &Executor,
    partition: &PartitionPlan,
    files: &PartitionFiles,
    verify: bool,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    apply_partition_inner(executor, partition, files, verify, cancel_signal, None)
}

/// Same as [`apply_partition`], but also stops between operations once
/// `abort_signal` is set.
fn apply_partition_inner(
    executor: &Executor,
    partition: &PartitionPlan,
    files: &PartitionFiles,
    verify: bool,
    cancel_signal: &AtomicBool,
    abort_signal: Option<&AtomicBool>,
) -> Result<()> {
    let _span = debug_span!("partition", name = %partition.name).entered();

    check_image_size(partition, "target", files.target, partition.target_size)?;
    if let Some(source) = files.source {
        check_image_size(partition, "source", source, partition.source_size())?;
    }

    if verify {
        if let (Some(source), Some(expected)) = (files.source, &partition.old_hash) {
            debug!("Verifying source image");
            check_image_digest(
                partition,
                "source",
                source,
                partition.source_size(),
                expected,
            )?;
        }
    }

    let total = partition.operations.len();

    for (index, op) in partition.operations.iter().enumerate() {
        stream::check_cancel(cancel_signal).map_err(|e| Error::Interrupted {
            name: partition.name.clone(),
            done: index,
            total,
            source: e,
        })?;

        if abort_signal.is_some_and(|s| s.load(Ordering::SeqCst)) {
            warn!("Stopping after {index} of {total} operations");

            return Err(Error::Aborted {
                name: partition.name.clone(),
                done: index,
                total,
            });
        }

        let data = read_data(partition, index, op, files)?;

        if let Err(e) = executor.execute(op, files.target, files.source, &data) {
            error!("Operation #{index} ({}) failed: {e}", op.kind);

            return Err(Error::Operation {
                name: partition.name.clone(),
                index,
                source: e,
            });
        }
    }

    if verify {
        if let Some(expected) = &partition.new_hash {
            debug!("Verifying target image");
            check_image_digest(
                partition,
                "target",
                files.target,
                partition.target_size,
                expected,
            )?;
        }
    }

    info!(
        "Applied {total} operations to {}",
        NumBytes(partition.target_size)
    );

    Ok(())
}

fn open_target(partition: &PartitionPlan) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(&partition.target)
        .map_err(|e| Error::ImageOpen {
            name: partition.name.clone(),
            what: "target",
            path: partition.target.clone(),
            source: e,
        })
}

fn open_source(partition: &PartitionPlan) -> Result<Option<File>> {
    let Some(path) = &partition.source else {
        return Ok(None);
    };

    File::open(path).map(Some).map_err(|e| Error::ImageOpen {
        name: partition.name.clone(),
        what: "source",
        path: path.clone(),
        source: e,
    })
}

/// Apply the specified partitions of an already validated plan. Partitions
/// are processed in parallel using rayon's global thread pool, but the
/// operations within each partition are applied sequentially in plan order.
/// The first failure aborts the entire update. Partitions that are already
/// running stop before their next operation and the original failure is
/// returned.
pub fn apply_plan<'a>(
    executor: &Executor,
    plan: &Plan,
    partition_names: impl IntoIterator<Item = &'a str>,
    verify: bool,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let mut remaining = partition_names.into_iter().collect::<BTreeSet<_>>();
    let mut partitions = vec![];

    for p in &plan.partitions {
        if remaining.remove(p.name.as_str()) {
            partitions.push(p);
        }
    }

    if !remaining.is_empty() {
        let remaining = remaining.iter().map(|&n| n.to_owned()).collect();
        return Err(Error::MissingPartitions(remaining));
    }

    // Fail before touching any partition if an engine is missing.
    for p in &partitions {
        for (index, op) in p.operations.iter().enumerate() {
            if !executor.engines().supports(op.kind) {
                return Err(Error::MissingEngine {
                    name: p.name.clone(),
                    index,
                    kind: op.kind,
                });
            }
        }
    }

    let payload = plan
        .payload
        .as_ref()
        .map(|p| File::open(p).map_err(|e| Error::PayloadOpen(p.clone(), e)))
        .transpose()?;

    let abort_signal = AtomicBool::new(false);

    let results = partitions
        .into_par_iter()
        .map(|partition| -> Result<()> {
            if abort_signal.load(Ordering::SeqCst) {
                return Err(Error::Aborted {
                    name: partition.name.clone(),
                    done: 0,
                    total: partition.operations.len(),
                });
            }

            let ret = open_target(partition).and_then(|target| {
                let source = open_source(partition)?;

                let files = PartitionFiles {
                    target: &target,
                    source: source.as_ref().map(|f| f as &dyn ReadAt),
                    payload: payload.as_ref().map(|f| f as &dyn ReadAt),
                    blob_offset: plan.blob_offset,
                };

                apply_partition_inner(
                    executor,
                    partition,
                    &files,
                    verify,
                    cancel_signal,
                    Some(&abort_signal),
                )
            });

            if ret.is_err() {
                abort_signal.store(true, Ordering::SeqCst);
            }

            ret
        })
        .collect::<Vec<_>>();

    // Report the failure that caused the abort, not the partitions that
    // stopped because of it.
    let mut aborted = None;

    for result in results {
        match result {
            Ok(()) => {}
            Err(e @ Error::Aborted { .. }) => {
                aborted.get_or_insert(e);
            }
            Err(e) => return Err(e),
        }
    }

    aborted.map_or(Ok(()), Err)
}
