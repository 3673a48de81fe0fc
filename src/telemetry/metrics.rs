// Copyright 2024-2026 GFX-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Metric names and recording helpers on top of the `metrics` facade.
//!
//! Nothing is exported unless the host installs a recorder.

use ::metrics::{counter, describe_counter, describe_gauge, gauge, Unit};

pub const CACHE_HITS: &str = "gfx_cache_hits_total";
pub const CACHE_MISSES: &str = "gfx_cache_misses_total";
pub const CACHE_WRITES: &str = "gfx_cache_writes_total";
pub const CACHE_WRITTEN_BYTES: &str = "gfx_cache_written_bytes_total";
pub const CACHE_EVICTED_BYTES: &str = "gfx_cache_evicted_bytes_total";
pub const ALLOCATIONS: &str = "gfx_allocations_total";
pub const ALLOCATION_FAILURES: &str = "gfx_allocation_failures_total";
pub const LOCAL_MEMORY_BYTES: &str = "gfx_local_memory_bytes";

/// Register descriptions with the installed recorder.
pub fn init_metrics() {
    describe_counter!(CACHE_HITS, "Compiler cache lookups that found a binary");
    describe_counter!(CACHE_MISSES, "Compiler cache lookups that found nothing");
    describe_counter!(CACHE_WRITES, "Binaries written to the compiler cache");
    describe_counter!(CACHE_WRITTEN_BYTES, Unit::Bytes, "Bytes written to the compiler cache");
    describe_counter!(CACHE_EVICTED_BYTES, Unit::Bytes, "Bytes evicted from the compiler cache");
    describe_counter!(ALLOCATIONS, "Graphics allocations by memory pool");
    describe_counter!(ALLOCATION_FAILURES, "Graphics allocation failures by status");
    describe_gauge!(LOCAL_MEMORY_BYTES, Unit::Bytes, "Local memory reserved per bank");
}

pub fn record_cache_lookup(hit: bool) {
    if hit {
        counter!(CACHE_HITS).increment(1);
    } else {
        counter!(CACHE_MISSES).increment(1);
    }
}

pub fn record_cache_write(bytes: u64) {
    counter!(CACHE_WRITES).increment(1);
    counter!(CACHE_WRITTEN_BYTES).increment(bytes);
}

pub fn record_cache_eviction(bytes: u64) {
    counter!(CACHE_EVICTED_BYTES).increment(bytes);
}

pub fn record_allocation(pool: &'static str) {
    counter!(ALLOCATIONS, "pool" => pool).increment(1);
}

pub fn record_allocation_failure(status: &'static str) {
    counter!(ALLOCATION_FAILURES, "status" => status).increment(1);
}

pub fn record_local_memory_usage(root_device_index: u32, bank: u32, bytes: u64) {
    gauge!(
        LOCAL_MEMORY_BYTES,
        "root_device" => root_device_index.to_string(),
        "bank" => bank.to_string()
    )
    .set(bytes as f64);
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use ::metrics::{
        with_local_recorder, Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString,
    };
    use parking_lot::Mutex;

    use super::*;

    /// Keeps every series as an atomic keyed by `name{label=value,...}`.
    #[derive(Default)]
    struct CapturingRecorder {
        series: Mutex<HashMap<String, Arc<AtomicU64>>>,
        descriptions: Mutex<HashMap<String, (Option<Unit>, String)>>,
    }

    impl CapturingRecorder {
        fn series(&self, key: &Key) -> Arc<AtomicU64> {
            let labels: Vec<String> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            let id = if labels.is_empty() {
                key.name().to_string()
            } else {
                format!("{}{{{}}}", key.name(), labels.join(","))
            };
            self.series.lock().entry(id).or_default().clone()
        }

        fn counter(&self, id: &str) -> u64 {
            self.series.lock().get(id).map_or(0, |v| v.load(Ordering::Relaxed))
        }

        fn gauge(&self, id: &str) -> Option<f64> {
            self.series.lock().get(id).map(|v| f64::from_bits(v.load(Ordering::Relaxed)))
        }

        fn describe(&self, key: KeyName, unit: Option<Unit>, description: SharedString) {
            self.descriptions
                .lock()
                .insert(key.as_str().to_string(), (unit, description.to_string()));
        }
    }

    impl Recorder for CapturingRecorder {
        fn describe_counter(&self, key: KeyName, unit: Option<Unit>, description: SharedString) {
            self.describe(key, unit, description);
        }

        fn describe_gauge(&self, key: KeyName, unit: Option<Unit>, description: SharedString) {
            self.describe(key, unit, description);
        }

        fn describe_histogram(&self, key: KeyName, unit: Option<Unit>, description: SharedString) {
            self.describe(key, unit, description);
        }

        fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
            Counter::from_arc(self.series(key))
        }

        fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
            Gauge::from_arc(self.series(key))
        }

        fn register_histogram(&self, _key: &Key, _metadata: &Metadata<'_>) -> Histogram {
            Histogram::noop()
        }
    }

    #[test]
    fn descriptions_carry_units() {
        let recorder = CapturingRecorder::default();
        with_local_recorder(&recorder, init_metrics);

        let descriptions = recorder.descriptions.lock();
        assert_eq!(descriptions.len(), 8);
        assert_eq!(descriptions[CACHE_WRITTEN_BYTES].0, Some(Unit::Bytes));
        assert_eq!(descriptions[LOCAL_MEMORY_BYTES].0, Some(Unit::Bytes));
        assert_eq!(descriptions[CACHE_HITS].0, None);
        assert!(descriptions.keys().all(|name| name.starts_with("gfx_")));
    }

    #[test]
    fn cache_helpers_count_lookups_and_bytes() {
        let recorder = CapturingRecorder::default();
        with_local_recorder(&recorder, || {
            record_cache_lookup(true);
            record_cache_lookup(true);
            record_cache_lookup(false);
            record_cache_write(128);
            record_cache_write(64);
            record_cache_eviction(100);
        });

        assert_eq!(recorder.counter(CACHE_HITS), 2);
        assert_eq!(recorder.counter(CACHE_MISSES), 1);
        assert_eq!(recorder.counter(CACHE_WRITES), 2);
        assert_eq!(recorder.counter(CACHE_WRITTEN_BYTES), 192);
        assert_eq!(recorder.counter(CACHE_EVICTED_BYTES), 100);
    }

    #[test]
    fn allocation_helpers_label_their_series() {
        let recorder = CapturingRecorder::default();
        with_local_recorder(&recorder, || {
            record_allocation("local");
            record_allocation("local");
            record_allocation("system");
            record_allocation_failure("error");
            record_local_memory_usage(0, 1, 4096);
            record_local_memory_usage(0, 1, 8192);
            record_local_memory_usage(1, 0, 65536);
        });

        assert_eq!(recorder.counter("gfx_allocations_total{pool=local}"), 2);
        assert_eq!(recorder.counter("gfx_allocations_total{pool=system}"), 1);
        assert_eq!(recorder.counter("gfx_allocation_failures_total{status=error}"), 1);
        assert_eq!(recorder.gauge("gfx_local_memory_bytes{root_device=0,bank=1}"), Some(8192.0));
        assert_eq!(recorder.gauge("gfx_local_memory_bytes{root_device=1,bank=0}"), Some(65536.0));
    }
}
