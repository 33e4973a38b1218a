// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

//! Execution-time estimation feeding the Shortest/Longest speculation
//! policies and the undo-token fast path.

use kiln_infallible::Mutex;
use std::collections::HashMap;

pub trait ExecutionEstimator: Send + Sync {
    /// Estimated remaining execution time for one run of `procedure`, in
    /// microseconds. Unknown procedures estimate 0.
    fn remaining_us(&self, procedure: &str) -> u64;

    /// Feeds an observed execution back into the model.
    fn record(&self, procedure: &str, elapsed_us: u64);
}

#[derive(Clone, Copy, Debug)]
struct Ema {
    average_us: f64,
    samples: u64,
}

/// Per-procedure exponential moving average over observed execution times.
pub struct MovingAverageEstimator {
    alpha: f64,
    by_procedure: Mutex<HashMap<String, Ema>>,
}

impl Default for MovingAverageEstimator {
    fn default() -> Self {
        Self::new(0.2)
    }
}

impl MovingAverageEstimator {
    pub fn new(alpha: f64) -> Self {
        assert!(alpha > 0.0 && alpha <= 1.0, "alpha must be in (0, 1]");
        Self {
            alpha,
            by_procedure: Mutex::new(HashMap::new()),
        }
    }

    pub fn sample_count(&self, procedure: &str) -> u64 {
        self.by_procedure
            .lock()
            .get(procedure)
            .map_or(0, |e| e.samples)
    }
}

impl ExecutionEstimator for MovingAverageEstimator {
    fn remaining_us(&self, procedure: &str) -> u64 {
        self.by_procedure
            .lock()
            .get(procedure)
            .map_or(0, |e| e.average_us as u64)
    }

    fn record(&self, procedure: &str, elapsed_us: u64) {
        let mut map = self.by_procedure.lock();
        match map.get_mut(procedure) {
            Some(e) => {
                e.average_us = self.alpha * elapsed_us as f64 + (1.0 - self.alpha) * e.average_us;
                e.samples += 1;
            },
            None => {
                map.insert(procedure.to_string(), Ema {
                    average_us: elapsed_us as f64,
                    samples: 1,
                });
            },
        }
    }
}
