/*
 * SPDX-FileCopyrightText: 2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fs,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use crate::{
    format::plan::Plan,
    patch::{
        apply,
        engine::PatchEngines,
        executor::{self, Executor, ExecutorOptions},
    },
    util::{self, NumBytes},
};

fn read_plan(path: &Path) -> Result<Plan> {
    let data =
        fs::read_to_string(path).with_context(|| format!("Failed to read plan TOML: {path:?}"))?;
    let mut plan: Plan = toml_edit::de::from_str(&data)
        .with_context(|| format!("Failed to parse plan TOML: {path:?}"))?;

    plan.resolve_paths(util::parent_path(path));

    Ok(plan)
}

fn read_and_validate_plan(path: &Path) -> Result<Plan> {
    let plan = read_plan(path)?;

    plan.validate()
        .with_context(|| format!("Invalid plan: {path:?}"))?;

    Ok(plan)
}

pub fn validate_subcommand(cli: &ValidateCli) -> Result<()> {
    let plan = read_and_validate_plan(&cli.plan)?;

    let num_ops = plan
        .partitions
        .iter()
        .map(|p| p.operations.len())
        .sum::<usize>();

    info!(
        "Plan is valid: {} partitions, {num_ops} operations",
        plan.partitions.len()
    );

    Ok(())
}

pub fn apply_subcommand(cli: &ApplyCli, cancel_signal: &AtomicBool) -> Result<()> {
    let plan = read_and_validate_plan(&cli.plan)?;

    let options = ExecutorOptions {
        puffdiff_cache_size: cli.puffdiff_cache_size,
        max_materialize_size: cli.max_materialize_size,
    };
    let executor = Executor::new(plan.version, plan.block_size, options, PatchEngines::default())
        .context("Failed to initialize executor")?;

    let names = if cli.partitions.is_empty() {
        plan.partitions
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>()
    } else {
        cli.partitions.iter().map(|n| n.as_str()).collect()
    };

    info!(
        "Applying {} payload to {} partitions",
        plan.version,
        names.len()
    );

    apply::apply_plan(&executor, &plan, names, !cli.no_verify, cancel_signal)
        .context("Failed to apply update")?;

    info!("Successfully applied update");

    Ok(())
}

pub fn info_subcommand(cli: &InfoCli) -> Result<()> {
    let plan = read_plan(&cli.plan)?;

    println!("Payload version: {}", plan.version);
    println!("Delta payload: {}", plan.version.is_delta());
    println!("Partial update: {}", plan.partial_update);
    println!("Block size: {}", plan.block_size);

    for p in &plan.partitions {
        println!();
        println!("{}:", p.name);
        println!("  Target size: {}", NumBytes(p.target_size));
        if p.source.is_some() {
            println!("  Source size: {}", NumBytes(p.source_size()));
        }
        println!("  Operations: {}", p.operations.len());

        for (kind, count) in p.operation_counts() {
            println!("    {kind}: {count}");
        }
    }

    Ok(())
}

/// Check that a plan is well-formed without modifying anything.
#[derive(Debug, Parser)]
pub struct ValidateCli {
    /// Path to update plan TOML.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub plan: PathBuf,
}

/// Apply the install operations in a plan to the target partition images.
///
/// Target images must already exist and be at least as large as the target
/// partition size. Partitions are updated in parallel.
#[derive(Debug, Parser)]
pub struct ApplyCli {
    /// Path to update plan TOML.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub plan: PathBuf,

    /// Only apply operations for the specified partition.
    ///
    /// This option can be specified multiple times. By default, every
    /// partition in the plan is updated.
    #[arg(long = "partition", value_name = "NAME")]
    pub partitions: Vec<String>,

    /// Skip checking source and target image hashes.
    #[arg(long)]
    pub no_verify: bool,

    /// Maximum number of bytes to hold in memory for engines that cannot
    /// stream their input or output.
    #[arg(long, value_name = "BYTES", default_value_t = executor::DEFAULT_MAX_MATERIALIZE_SIZE)]
    pub max_materialize_size: u64,

    /// Deflate stream cache size for puffdiff operations.
    #[arg(long, value_name = "BYTES", default_value_t = executor::DEFAULT_PUFFDIFF_CACHE_SIZE)]
    pub puffdiff_cache_size: usize,
}

/// Show a summary of the partitions and operations in a plan.
#[derive(Debug, Parser)]
pub struct InfoCli {
    /// Path to update plan TOML.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub plan: PathBuf,
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn read_plan_resolves_paths() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("plan.toml");

        fs::write(
            &path,
            r#"
                [version]
                major = 2
                minor = 0

                [[partitions]]
                name = "vendor"
                target = "vendor.img"
                target_size = 4096
            "#,
        )
        .unwrap();

        let plan = read_plan(&path).unwrap();
        assert_eq!(plan.block_size, 4096);
        assert_eq!(plan.partitions[0].target, temp_dir.path().join("vendor.img"));

        // The target image does not exist yet.
        assert!(read_and_validate_plan(&path).is_err());

        fs::write(temp_dir.path().join("vendor.img"), [0u8; 4096]).unwrap();
        read_and_validate_plan(&path).unwrap();
    }

    #[test]
    fn read_plan_invalid_toml() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("plan.toml");

        let err = read_plan(&path).unwrap_err();
        assert!(format!("{err}").starts_with("Failed to read plan TOML"));

        fs::write(&path, "[version]\nmajor = \"two\"\n").unwrap();
        let err = read_plan(&path).unwrap_err();
        assert!(format!("{err}").starts_with("Failed to parse plan TOML"));
    }
}
