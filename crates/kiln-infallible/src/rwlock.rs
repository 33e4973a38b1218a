// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

pub use std::sync::{RwLockReadGuard, RwLockWriteGuard};

/// A [`std::sync::RwLock`] that panics instead of returning a poison error.
#[derive(Debug, Default)]
pub struct RwLock<T>(std::sync::RwLock<T>);

impl<T> RwLock<T> {
    pub fn new(t: T) -> Self {
        Self(std::sync::RwLock::new(t))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.0
            .read()
            .expect("kiln cannot currently handle a poisoned lock")
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.0
            .write()
            .expect("kiln cannot currently handle a poisoned lock")
    }
}
