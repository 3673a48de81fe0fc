// Copyright 2024-2026 GFX-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! GFX-CORE driver services
//!
//! Two pieces of a GPU compute driver's user-mode core:
//!
//! - [`compiler_cache`]: a persistent, size-bounded cache of compiled kernel
//!   binaries shared by every process using the driver.
//! - [`memory`]: the graphics memory manager that places allocations in
//!   local or system memory and deduplicates host pointer imports.
//!
//! # Boundaries
//!
//! - Filesystem and environment: through [`fs::FileSystemOps`] and
//!   [`fs::EnvReader`] only.
//! - Kernel-mode driver: through [`memory::MemoryBackend`] only.
//! - Observability: `tracing` events and the `metrics` facade. Hosts install
//!   subscribers and recorders.

pub mod compiler_cache;
pub mod config;
pub mod fs;
pub mod memory;
pub mod telemetry;

use std::sync::Arc;

use compiler_cache::{resolve_cache_config, CacheApi, CompilerCache};
use config::DriverConfig;
use fs::{EnvReader, FileSystemOps, OsFileSystem, SystemEnv};
use memory::{HardwareInfo, MemoryBackend, MemoryManager};

/// The driver core instance.
pub struct Driver {
    pub config: DriverConfig,
    pub compiler_cache: CompilerCache,
    pub memory_manager: MemoryManager,
}

impl Driver {
    /// Create a driver core with the given configuration.
    pub fn new(
        config: DriverConfig,
        api: CacheApi,
        hardware: Vec<HardwareInfo>,
        backend: Arc<dyn MemoryBackend>,
        env: &dyn EnvReader,
        fs: Arc<dyn FileSystemOps>,
    ) -> Self {
        let cache_config = resolve_cache_config(&config.cache, api, env, fs.as_ref());
        tracing::info!(
            enabled = cache_config.enabled,
            dir = %cache_config.cache_dir,
            root_devices = hardware.len(),
            "driver core initialized"
        );
        let compiler_cache = CompilerCache::new(cache_config, fs);
        let memory_manager = MemoryManager::new(config.memory.clone(), hardware, backend);
        Self { config, compiler_cache, memory_manager }
    }

    /// Create a driver core from the process environment and the real
    /// filesystem.
    pub fn from_env(api: CacheApi, hardware: Vec<HardwareInfo>, backend: Arc<dyn MemoryBackend>) -> Self {
        let config = config::load();
        Self::new(config, api, hardware, backend, &SystemEnv, Arc::new(OsFileSystem))
    }
}
