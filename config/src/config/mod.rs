// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

mod executor_config;
mod site_config;

pub use executor_config::{ConflictCheckerKind, ExecutorConfig, SpeculationPolicy};
pub use site_config::{Error, SiteConfig};
