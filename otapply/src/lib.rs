/*
 * SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! otapply is primarily an application and not a library. The semver
//! versioning covers the CLI only. All Rust APIs can change at any time, even
//! in patch releases.
//!
//! The [`patch`] module applies A/B OTA install operations to already-opened
//! partition images. Diff engines that are not built in are supplied by the
//! caller through [`patch::engine::PatchEngines`].

pub mod cli;
pub mod format;
pub mod patch;
pub mod stream;
pub mod util;
