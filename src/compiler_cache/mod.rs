// Copyright 2024-2026 GFX-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Persistent compiler cache.
//!
//! [`default_compiler_cache_config`] resolves where binaries live and how much
//! space they may use. [`CompilerCache`] stores and loads binaries under a
//! content hash built with [`cached_file_name`], evicting the least recently
//! accessed entries when the directory would grow past its budget.

mod cache;
mod config;
mod files;
mod key;

pub use cache::{
    CacheError, CacheOutcome, CompilerCache, EvictionPolicy, CONFIG_FILE_NAME, MAX_CACHE_DEPTH,
};
pub use config::{
    default_cache_enabled, default_compiler_cache_config, discover_default_cache_dir,
    linux_default_cache_dir, resolve_cache_config, windows_default_cache_dir, CacheApi,
    CacheSettings, CompilerCacheConfig, DEFAULT_CACHE_SIZE, DEFAULT_DIR_SENTINEL,
    NEO_COMPILER_CACHE_DIR,
};
pub use files::{get_file_modification_time, get_file_size, get_files, CachedFileElement};
pub use key::{cached_file_name, CacheKeyBuilder};
