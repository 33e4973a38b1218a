// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

//! Wire messages exchanged between sites. Serialized with bcs; the payloads
//! inside (`dep_data`, parameter blobs) are opaque length-prefixed rowsets
//! produced by the storage engine and never interpreted here.

use crate::{
    ids::{DependencyId, FragmentId, PartitionId},
    status::Status,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// A statement the transaction is predicted to issue later, shipped with a
/// work request so the remote site can speculatively prefetch its result.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct FutureStatement {
    pub fragment_id: FragmentId,
    pub param_hash: u64,
}

/// One unit of work for a single destination partition: the plan fragments to
/// run there, which parameter sets they use, and the dependency wiring.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct WorkFragment {
    pub partition_id: PartitionId,
    pub fragment_ids: Vec<FragmentId>,
    /// Index into the batch's parameter-set list, one per fragment.
    pub param_indices: Vec<u32>,
    pub input_dep_ids: Vec<DependencyId>,
    pub output_dep_ids: Vec<DependencyId>,
    pub read_only: bool,
    /// Set on the final round of work the transaction will send here.
    pub last_fragment: bool,
    /// This fragment is a speculative prefetch, not demanded work.
    pub prefetch: bool,
    pub needs_input: bool,
    pub future_statements: Vec<FutureStatement>,
}

impl WorkFragment {
    /// Key under which a prefetched result for this fragment is cached.
    pub fn prefetch_key(&self, params: &[Bytes]) -> PrefetchKey {
        let mut hasher = DefaultHasher::new();
        for idx in &self.param_indices {
            params
                .get(*idx as usize)
                .map(|p| p.as_ref())
                .unwrap_or(&[])
                .hash(&mut hasher);
        }
        PrefetchKey {
            fragment_ids: self.fragment_ids.clone(),
            partition_id: self.partition_id,
            param_hash: hasher.finish(),
        }
    }
}

/// Identity of a prefetchable unit of work: what runs, where, on which
/// parameters.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct PrefetchKey {
    pub fragment_ids: Vec<FragmentId>,
    pub partition_id: PartitionId,
    pub param_hash: u64,
}

/// Result of one [`WorkFragment`], sent back to the requesting partition.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct WorkResult {
    pub partition_id: PartitionId,
    pub status: Status,
    pub dep_ids: Vec<DependencyId>,
    /// Serialized rowsets, parallel to `dep_ids`.
    pub dep_data: Vec<Bytes>,
    pub error: Option<String>,
}

impl WorkResult {
    pub fn error(partition_id: PartitionId, status: Status, error: String) -> Self {
        Self {
            partition_id,
            status,
            dep_ids: vec![],
            dep_data: vec![],
            error: Some(error),
        }
    }
}

/// A statement batch after planning: one [`WorkFragment`] per destination
/// partition plus the shared parameter sets. Produced by the (external) batch
/// planner, consumed by the fragment dispatcher.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct BatchPlan {
    pub fragments: Vec<WorkFragment>,
    pub params: Vec<Bytes>,
}

impl BatchPlan {
    pub fn is_read_only(&self) -> bool {
        self.fragments.iter().all(|f| f.read_only)
    }

    pub fn touched_partitions(&self) -> Vec<PartitionId> {
        let mut partitions: Vec<_> = self.fragments.iter().map(|f| f.partition_id).collect();
        partitions.sort_unstable();
        partitions.dedup();
        partitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(partition_id: PartitionId, read_only: bool) -> WorkFragment {
        WorkFragment {
            partition_id,
            fragment_ids: vec![7],
            param_indices: vec![0],
            input_dep_ids: vec![],
            output_dep_ids: vec![100],
            read_only,
            last_fragment: false,
            prefetch: false,
            needs_input: false,
            future_statements: vec![],
        }
    }

    #[test]
    fn test_work_fragment_bcs_round_trip() {
        let fragment = fragment(3, true);
        let bytes = bcs::to_bytes(&fragment).unwrap();
        let decoded: WorkFragment = bcs::from_bytes(&bytes).unwrap();
        assert_eq!(fragment, decoded);
    }

    #[test]
    fn test_prefetch_key_tracks_params() {
        let fragment = fragment(0, true);
        let a = fragment.prefetch_key(&[Bytes::from_static(b"alpha")]);
        let b = fragment.prefetch_key(&[Bytes::from_static(b"alpha")]);
        let c = fragment.prefetch_key(&[Bytes::from_static(b"beta")]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_batch_plan_partitions() {
        let plan = BatchPlan {
            fragments: vec![fragment(2, true), fragment(0, false), fragment(2, true)],
            params: vec![],
        };
        assert_eq!(plan.touched_partitions(), vec![0, 2]);
        assert!(!plan.is_read_only());
    }
}
