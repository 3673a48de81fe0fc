// Copyright 2024-2026 GFX-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Telemetry: structured logging and metrics.
//!
//! The library only emits through `tracing` and the `metrics` facade; hosts
//! decide where either goes.

mod logging;
mod metrics;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use self::metrics::{
    init_metrics, record_allocation, record_allocation_failure, record_cache_eviction,
    record_cache_lookup, record_cache_write, record_local_memory_usage,
};
