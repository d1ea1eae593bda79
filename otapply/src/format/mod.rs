/*
 * SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

pub mod bspatch;
pub mod compression;
pub mod config;
pub mod extent;
pub mod operation;
pub mod plan;
pub mod version;
pub mod zucchini;
