// Copyright © Kiln Foundation
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

// Re-export counter types and registration macros so component crates declare
// metrics without a direct prometheus dependency.
pub use prometheus::{
    exponential_buckets, histogram_opts, register_histogram, register_histogram_vec,
    register_int_counter, register_int_counter_vec, register_int_gauge, register_int_gauge_vec,
    Histogram, HistogramTimer, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};

/// Shortcuts for observing integer gauges keyed by a single label.
pub trait IntGaugeHelper {
    fn set_with(&self, labels: &[&str], val: i64);
}

impl IntGaugeHelper for IntGaugeVec {
    fn set_with(&self, labels: &[&str], val: i64) {
        self.with_label_values(labels).set(val)
    }
}

/// Shortcuts for starting histogram timers keyed by a single label.
pub trait TimerHelper {
    fn timer_with(&self, labels: &[&str]) -> HistogramTimer;

    fn observe_with(&self, labels: &[&str], val: f64);
}

impl TimerHelper for HistogramVec {
    fn timer_with(&self, labels: &[&str]) -> HistogramTimer {
        self.with_label_values(labels).start_timer()
    }

    fn observe_with(&self, labels: &[&str], val: f64) {
        self.with_label_values(labels).observe(val)
    }
}
