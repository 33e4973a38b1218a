// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

//! Identifier aliases used across the executor. All of these travel on the
//! wire, so they are plain integers rather than newtypes.

/// Globally unique, monotonically increasing transaction id. Assigned by the
/// transaction initializer; the lock-queue manager releases transactions to
/// partitions in id order, so id order is the global serial order.
pub type TxnId = u64;

/// A logical partition, wholly owned by one executor thread.
pub type PartitionId = u32;

/// A site hosts a contiguous range of partitions in one process.
pub type SiteId = u32;

/// Identifies a plan fragment within the (external) batch planner's catalog.
pub type FragmentId = u32;

/// Identifies one dependency (input or output rowset) of a work unit.
pub type DependencyId = u32;

/// Tag for a batch of storage-engine changes that roll back atomically.
/// Signed so the sentinels below stay out of the allocatable range.
pub type UndoToken = i64;

/// Sentinel: no undo token has been assigned yet.
pub const NULL_UNDO_TOKEN: UndoToken = -1;

/// Sentinel: execute without undo logging (the round can never roll back).
pub const DISABLE_UNDO_TOKEN: UndoToken = i64::MAX;

/// Each partition allocates real undo tokens starting here.
pub const UNDO_TOKEN_STRIDE: i64 = 1_000_000;

/// First real undo token for a partition.
pub fn first_undo_token(partition: PartitionId) -> UndoToken {
    partition as i64 * UNDO_TOKEN_STRIDE
}

/// True for tokens the storage engine actually logs against.
pub fn is_real_undo_token(token: UndoToken) -> bool {
    token != NULL_UNDO_TOKEN && token != DISABLE_UNDO_TOKEN
}
