// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! The Kiln partition executor core.
//!
//! One executor thread owns one partition: its storage engine, its lock
//! queue, and every piece of per-partition state. Peers and the coordinator
//! talk to it exclusively through its work queue. While a distributed
//! transaction holds the partition, the executor fills idle time by
//! speculatively running queued single-partition transactions, buffering
//! their responses until the distributed transaction resolves; the undo-token
//! discipline makes the resulting cascade of commits and rollbacks safe.

pub mod conflicts;
pub mod coordinator;
mod counters;
pub mod dispatcher;
pub mod error;
pub mod estimator;
pub mod executor;
pub mod lock_queue;
pub mod message;
pub mod partition_state;
pub mod procedures;
pub mod site;
pub mod speculation;
pub mod undo_token;
pub mod work_queue;

pub use error::ExecutorError;
pub use executor::PartitionExecutor;
pub use site::{ExecutorSite, SiteBuilder};
