// Copyright (c) Granules Contributors
// SPDX-License-Identifier: Apache-2.0

//! Small helpers shared between the granules crates.

pub mod backoff;
