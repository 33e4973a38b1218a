// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

pub use std::sync::MutexGuard;

/// A [`std::sync::Mutex`] that panics instead of returning a poison error.
///
/// Lock poisoning means a thread already panicked while holding the lock, so
/// the process is going down anyway; unwrapping here keeps call sites free of
/// unreachable error plumbing.
#[derive(Debug, Default)]
pub struct Mutex<T>(std::sync::Mutex<T>);

impl<T> Mutex<T> {
    pub fn new(t: T) -> Self {
        Self(std::sync::Mutex::new(t))
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.0
            .lock()
            .expect("kiln cannot currently handle a poisoned lock")
    }

    pub fn into_inner(self) -> T {
        self.0
            .into_inner()
            .expect("kiln cannot currently handle a poisoned lock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn test_mutex() {
        let a = Arc::new(Mutex::new(0u64));
        let b = a.clone();

        let handle = thread::spawn(move || {
            *b.lock() += 1;
        });
        handle.join().unwrap();

        assert_eq!(*a.lock(), 1);
    }
}
