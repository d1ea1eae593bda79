// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

pub mod adapter;
pub mod apply;
pub mod engine;
pub mod executor;
