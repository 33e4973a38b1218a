// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! Shared types for the Kiln partition executor: identifiers, abort statuses,
//! per-transaction bookkeeping, wire messages, and the boot-time stored
//! procedure catalog.

pub mod ids;
pub mod message;
pub mod procedure;
pub mod status;
pub mod transaction;

pub use ids::{
    first_undo_token, is_real_undo_token, DependencyId, FragmentId, PartitionId, SiteId, TxnId,
    UndoToken, DISABLE_UNDO_TOKEN, NULL_UNDO_TOKEN, UNDO_TOKEN_STRIDE,
};
pub use status::{Status, TransactionError};
