// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

pub mod config;

pub use config::{ConflictCheckerKind, ExecutorConfig, SiteConfig, SpeculationPolicy};
