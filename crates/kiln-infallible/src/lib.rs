// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

mod mutex;
mod rwlock;
mod time;

pub use mutex::Mutex;
pub use rwlock::RwLock;
pub use time::duration_since_epoch;
