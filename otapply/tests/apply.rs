// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs,
    io::{self, Write},
    path::Path,
    sync::{Arc, Barrier, atomic::AtomicBool},
    thread,
    time::Duration,
};

use assert_matches::assert_matches;
use bzip2::{Compression, write::BzEncoder};
use otapply::{
    format::{
        extent::Extent,
        operation::{InstallOperation, OperationKind},
        plan::{PartitionPlan, Plan},
        version::PayloadVersion,
    },
    patch::{
        adapter::{PatchSink, PatchSource},
        apply::{self, Error},
        engine::{self, PatchEngines, PuffDiffEngine},
        executor::{self, Executor, ExecutorOptions},
    },
};
use rayon::ThreadPoolBuilder;
use tempfile::TempDir;

const BS: usize = 4096;

/// Leading bytes of the payload file that are not part of the blob area.
const BLOB_OFFSET: u64 = 100;

fn sha256(data: &[u8]) -> Vec<u8> {
    ring::digest::digest(&ring::digest::SHA256, data)
        .as_ref()
        .to_vec()
}

fn bzip2_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = BzEncoder::new(vec![], Compression::fast());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn executor_for(plan: &Plan) -> Executor {
    Executor::new(
        plan.version,
        plan.block_size,
        ExecutorOptions::default(),
        PatchEngines::default(),
    )
    .unwrap()
}

fn partition(dir: &Path, name: &str, num_blocks: usize) -> PartitionPlan {
    let target = dir.join(format!("{name}_b.img"));
    fs::write(&target, vec![0xaau8; num_blocks * BS]).unwrap();

    PartitionPlan {
        name: name.to_owned(),
        target,
        target_size: (num_blocks * BS) as u64,
        source: None,
        source_size: None,
        new_hash: None,
        old_hash: None,
        postinstall: None,
        verity: None,
        operations: vec![],
    }
}

/// Append `data` to the blob area and return an operation that references it.
fn blob_op(
    blobs: &mut Vec<u8>,
    kind: OperationKind,
    dst: Vec<Extent>,
    data: &[u8],
) -> InstallOperation {
    let mut op = InstallOperation::new(kind, dst);
    op.data_offset = Some(blobs.len() as u64);
    op.data_length = Some(data.len() as u64);
    op.data_sha256_hash = Some(sha256(data));
    blobs.extend_from_slice(data);
    op
}

fn write_payload(dir: &Path, blobs: &[u8]) -> std::path::PathBuf {
    let path = dir.join("payload.bin");
    let mut data = vec![0u8; BLOB_OFFSET as usize];
    data.extend_from_slice(blobs);
    fs::write(&path, data).unwrap();
    path
}

/// A full payload that fills `system` with a REPLACE and a ZERO operation and
/// `vendor` with a REPLACE_BZ operation.
fn full_plan(dir: &Path) -> (Plan, Vec<u8>, Vec<u8>) {
    let mut blobs = vec![];

    let mut system = partition(dir, "system", 3);
    let system_data = [vec![1u8; BS], vec![2u8; BS]].concat();
    system.operations.push(blob_op(
        &mut blobs,
        OperationKind::Replace,
        vec![Extent::new(2, 1), Extent::new(0, 1)],
        &system_data,
    ));
    system.operations.push(InstallOperation::new(
        OperationKind::Zero,
        vec![Extent::new(1, 1)],
    ));
    let system_expected = [vec![2u8; BS], vec![0u8; BS], vec![1u8; BS]].concat();
    system.new_hash = Some(sha256(&system_expected));

    let mut vendor = partition(dir, "vendor", 2);
    let vendor_expected = (0..2 * BS).map(|i| (i % 251) as u8).collect::<Vec<_>>();
    vendor.operations.push(blob_op(
        &mut blobs,
        OperationKind::ReplaceBz,
        vec![Extent::new(0, 2)],
        &bzip2_compress(&vendor_expected),
    ));
    vendor.new_hash = Some(sha256(&vendor_expected));

    let plan = Plan {
        block_size: BS as u32,
        payload: Some(write_payload(dir, &blobs)),
        blob_offset: BLOB_OFFSET,
        version: PayloadVersion::new(2, 0),
        partial_update: false,
        partitions: vec![system, vendor],
        dynamic_partition_metadata: None,
    };

    (plan, system_expected, vendor_expected)
}

/// A delta payload that copies the blocks of `system` in reverse order.
fn delta_plan(dir: &Path) -> (Plan, Vec<u8>, Vec<u8>) {
    let source_data = [vec![1u8; BS], vec![2u8; BS], vec![3u8; BS]].concat();
    let source_path = dir.join("system_a.img");
    fs::write(&source_path, &source_data).unwrap();

    let mut system = partition(dir, "system", 3);
    system.source = Some(source_path);
    system.old_hash = Some(sha256(&source_data));

    for i in 0..3 {
        let mut op = InstallOperation::new(OperationKind::SourceCopy, vec![Extent::new(2 - i, 1)]);
        op.src_extents = vec![Extent::new(i, 1)];
        system.operations.push(op);
    }

    let expected = [vec![3u8; BS], vec![2u8; BS], vec![1u8; BS]].concat();
    system.new_hash = Some(sha256(&expected));

    let plan = Plan {
        block_size: BS as u32,
        payload: None,
        blob_offset: 0,
        version: PayloadVersion::new(2, 8),
        partial_update: false,
        partitions: vec![system],
        dynamic_partition_metadata: None,
    };

    (plan, source_data, expected)
}

#[test]
fn apply_full_payload() {
    let temp_dir = TempDir::new().unwrap();
    let (plan, system_expected, vendor_expected) = full_plan(temp_dir.path());
    plan.validate().unwrap();

    let executor = executor_for(&plan);
    let cancel_signal = AtomicBool::new(false);

    apply::apply_plan(&executor, &plan, ["system", "vendor"], true, &cancel_signal).unwrap();

    assert_eq!(fs::read(&plan.partitions[0].target).unwrap(), system_expected);
    assert_eq!(fs::read(&plan.partitions[1].target).unwrap(), vendor_expected);
}

#[test]
fn apply_subset_of_partitions() {
    let temp_dir = TempDir::new().unwrap();
    let (plan, _, vendor_expected) = full_plan(temp_dir.path());

    let executor = executor_for(&plan);
    let cancel_signal = AtomicBool::new(false);

    apply::apply_plan(&executor, &plan, ["vendor"], true, &cancel_signal).unwrap();

    assert!(
        fs::read(&plan.partitions[0].target)
            .unwrap()
            .iter()
            .all(|b| *b == 0xaa)
    );
    assert_eq!(fs::read(&plan.partitions[1].target).unwrap(), vendor_expected);

    assert_matches!(
        apply::apply_plan(&executor, &plan, ["vendor", "odm"], true, &cancel_signal),
        Err(Error::MissingPartitions(p)) if p.len() == 1 && p.contains("odm")
    );
}

#[test]
fn apply_delta_payload() {
    let temp_dir = TempDir::new().unwrap();
    let (plan, source_data, expected) = delta_plan(temp_dir.path());
    plan.validate().unwrap();

    let executor = executor_for(&plan);
    let cancel_signal = AtomicBool::new(false);

    apply::apply_plan(&executor, &plan, ["system"], true, &cancel_signal).unwrap();

    assert_eq!(fs::read(&plan.partitions[0].target).unwrap(), expected);
    let source = plan.partitions[0].source.as_ref().unwrap();
    assert_eq!(fs::read(source).unwrap(), source_data);
}

#[test]
fn source_hash_mismatch() {
    let temp_dir = TempDir::new().unwrap();
    let (mut plan, _, _) = delta_plan(temp_dir.path());
    plan.partitions[0].old_hash = Some(sha256(b"other"));

    let executor = executor_for(&plan);
    let cancel_signal = AtomicBool::new(false);

    assert_matches!(
        apply::apply_plan(&executor, &plan, ["system"], true, &cancel_signal),
        Err(Error::MismatchedDigest { what: "source", .. })
    );
    assert!(
        fs::read(&plan.partitions[0].target)
            .unwrap()
            .iter()
            .all(|b| *b == 0xaa)
    );

    // Hashes are not checked when verification is disabled.
    apply::apply_plan(&executor, &plan, ["system"], false, &cancel_signal).unwrap();
}

#[test]
fn target_hash_mismatch() {
    let temp_dir = TempDir::new().unwrap();
    let (mut plan, _, _) = delta_plan(temp_dir.path());
    plan.partitions[0].new_hash = Some(sha256(b"other"));

    let executor = executor_for(&plan);
    let cancel_signal = AtomicBool::new(false);

    assert_matches!(
        apply::apply_plan(&executor, &plan, ["system"], true, &cancel_signal),
        Err(Error::MismatchedDigest { what: "target", .. })
    );
}

#[test]
fn failed_operation_reports_index() {
    let temp_dir = TempDir::new().unwrap();
    let (mut plan, _, _) = delta_plan(temp_dir.path());

    // Corrupt the expected source digest of the last operation only.
    plan.partitions[0].operations[2].src_sha256_hash = Some(sha256(b"other"));

    let executor = executor_for(&plan);
    let cancel_signal = AtomicBool::new(false);

    let err = apply::apply_plan(&executor, &plan, ["system"], true, &cancel_signal).unwrap_err();
    assert_matches!(
        err,
        Error::Operation {
            index: 2,
            source: executor::Error::MismatchedDigest { what: "source", .. },
            ..
        }
    );
}

#[test]
fn missing_engine_fails_before_writing() {
    let temp_dir = TempDir::new().unwrap();
    let (mut plan, _, _) = delta_plan(temp_dir.path());

    let mut op = InstallOperation::new(OperationKind::Puffdiff, vec![Extent::new(0, 1)]);
    op.src_extents = vec![Extent::new(0, 1)];
    op.data_offset = Some(0);
    op.data_length = Some(4);
    plan.partitions[0].operations.push(op);
    plan.payload = Some(write_payload(temp_dir.path(), b"puff"));
    plan.blob_offset = BLOB_OFFSET;
    plan.validate().unwrap();

    let executor = executor_for(&plan);
    let cancel_signal = AtomicBool::new(false);

    assert_matches!(
        apply::apply_plan(&executor, &plan, ["system"], true, &cancel_signal),
        Err(Error::MissingEngine {
            index: 3,
            kind: OperationKind::Puffdiff,
            ..
        })
    );
    assert!(
        fs::read(&plan.partitions[0].target)
            .unwrap()
            .iter()
            .all(|b| *b == 0xaa)
    );
}

/// Waits until both partitions are inside an operation. The `fail` patch then
/// fails immediately while the other one copies the source after a delay.
struct GatedPuffDiff {
    barrier: Barrier,
}

impl PuffDiffEngine for GatedPuffDiff {
    fn apply(
        &self,
        source: &mut dyn PatchSource,
        sink: &mut dyn PatchSink,
        patch: &[u8],
        _cache_size: usize,
    ) -> engine::Result<()> {
        self.barrier.wait();

        if patch == b"fail" {
            return Err(engine::Error::Failed {
                engine: "puffdiff",
                message: "Corrupt patch".to_owned(),
            });
        }

        thread::sleep(Duration::from_millis(500));
        io::copy(source, sink)?;

        Ok(())
    }
}

#[test]
fn failure_stops_running_partitions() {
    let temp_dir = TempDir::new().unwrap();
    let mut blobs = vec![];

    let mut partitions = vec![];

    for (name, num_blocks, patch) in [("bad", 1, b"fail"), ("big", 4, b"slow")] {
        let source_path = temp_dir.path().join(format!("{name}_a.img"));
        fs::write(&source_path, vec![0x55u8; num_blocks * BS]).unwrap();

        let mut p = partition(temp_dir.path(), name, num_blocks);
        p.source = Some(source_path);

        let mut op = blob_op(
            &mut blobs,
            OperationKind::Puffdiff,
            vec![Extent::new(0, 1)],
            patch,
        );
        op.src_extents = vec![Extent::new(0, 1)];
        p.operations.push(op);

        for block in 1..num_blocks as u64 {
            p.operations.push(InstallOperation::new(
                OperationKind::Zero,
                vec![Extent::new(block, 1)],
            ));
        }

        partitions.push(p);
    }

    let plan = Plan {
        block_size: BS as u32,
        payload: Some(write_payload(temp_dir.path(), &blobs)),
        blob_offset: BLOB_OFFSET,
        version: PayloadVersion::new(2, 5),
        partial_update: false,
        partitions,
        dynamic_partition_metadata: None,
    };
    plan.validate().unwrap();

    let engines = PatchEngines {
        puffdiff: Some(Arc::new(GatedPuffDiff {
            barrier: Barrier::new(2),
        })),
        ..Default::default()
    };
    let executor = Executor::new(plan.version, plan.block_size, ExecutorOptions::default(), engines)
        .unwrap();
    let cancel_signal = AtomicBool::new(false);

    let pool = ThreadPoolBuilder::new().num_threads(2).build().unwrap();
    let err = pool
        .install(|| apply::apply_plan(&executor, &plan, ["bad", "big"], true, &cancel_signal))
        .unwrap_err();

    assert_matches!(
        err,
        Error::Operation {
            ref name,
            index: 0,
            source: executor::Error::PatchEngine { .. },
        } if name == "bad"
    );

    // The in-flight operation completes, but none of the ZERO operations run.
    let data = fs::read(&plan.partitions[1].target).unwrap();
    assert!(data[..BS].iter().all(|b| *b == 0x55));
    assert!(data[BS..].iter().all(|b| *b == 0xaa));
}

#[test]
fn cancel_before_first_operation() {
    let temp_dir = TempDir::new().unwrap();
    let (plan, _, _) = full_plan(temp_dir.path());

    let executor = executor_for(&plan);
    let cancel_signal = AtomicBool::new(true);

    assert_matches!(
        apply::apply_plan(&executor, &plan, ["system"], true, &cancel_signal),
        Err(Error::Interrupted {
            done: 0,
            total: 2,
            ..
        })
    );
}

#[test]
fn missing_target_image() {
    let temp_dir = TempDir::new().unwrap();
    let (plan, _, _) = full_plan(temp_dir.path());
    fs::remove_file(&plan.partitions[1].target).unwrap();

    let executor = executor_for(&plan);
    let cancel_signal = AtomicBool::new(false);

    assert_matches!(
        apply::apply_plan(&executor, &plan, ["vendor"], true, &cancel_signal),
        Err(Error::ImageOpen { what: "target", .. })
    );
}

#[test]
fn target_image_too_small() {
    let temp_dir = TempDir::new().unwrap();
    let (plan, _, _) = full_plan(temp_dir.path());
    fs::write(&plan.partitions[0].target, vec![0u8; BS]).unwrap();

    let executor = executor_for(&plan);
    let cancel_signal = AtomicBool::new(false);

    assert_matches!(
        apply::apply_plan(&executor, &plan, ["system"], true, &cancel_signal),
        Err(Error::ImageTooSmall { what: "target", .. })
    );
}

#[test]
fn default_options() {
    let options = ExecutorOptions::default();
    assert_eq!(options.puffdiff_cache_size, executor::DEFAULT_PUFFDIFF_CACHE_SIZE);
    assert_eq!(options.max_materialize_size, executor::DEFAULT_MAX_MATERIALIZE_SIZE);
}
