// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::config::ExecutorConfig;
use kiln_types::{PartitionId, SiteId};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
}

/// Which partitions a site hosts, and the executor settings they share.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SiteConfig {
    pub site_id: SiteId,
    /// Number of partitions per site, used to map a partition id to the site
    /// hosting it.
    pub partitions_per_site: u32,
    pub partitions: Vec<PartitionId>,
    pub executor: ExecutorConfig,
}

impl Default for SiteConfig {
    fn default() -> SiteConfig {
        SiteConfig {
            site_id: 0,
            partitions_per_site: 4,
            partitions: vec![0, 1, 2, 3],
            executor: ExecutorConfig::default(),
        }
    }
}

impl SiteConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path_str = path.as_ref().display().to_string();
        let contents = std::fs::read_to_string(&path).map_err(|source| Error::Io {
            path: path_str.clone(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(|source| Error::Parse {
            path: path_str,
            source,
        })
    }

    /// The site hosting a partition under this layout.
    pub fn site_of(&self, partition: PartitionId) -> SiteId {
        partition / self.partitions_per_site
    }

    pub fn hosts(&self, partition: PartitionId) -> bool {
        self.partitions.contains(&partition)
    }
}
