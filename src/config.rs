// Copyright 2024-2026 GFX-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Driver configuration loading from environment variables.
//!
//! Values come from `NEO_*` environment variables with sensible defaults.
//! Invalid values fall back to defaults without crashing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `NEO_CACHE_PERSISTENT` | platform | Persistent compiler cache (-1 default, 0 off, else on) |
//! | `NEO_CACHE_DIR` | discovered | Compiler cache directory, `default` forces discovery |
//! | `NEO_CACHE_MAX_SIZE` | 1073741824 | Compiler cache budget (bytes, 0 = unbounded) |
//! | `NEO_ENABLE_LOCAL_MEMORY` | -1 | Local memory (-1 follows hardware) |
//! | `NEO_FORCE_32BIT_ADDRESSING` | 0 | Force 32-bit GPU addresses where allowed |
//! | `NEO_RENDER_COMPRESSED_BUFFERS` | -1 | Buffer compression (-1 follows hardware) |
//! | `NEO_ENABLE_64KB_PAGES` | 1 | 64 KiB system pages |
//! | `NEO_HUGE_CHUNK_SIZE` | 4294967296 | Split threshold for single-bank allocations (bytes) |
//! | `NEO_MULTI_STORAGE_GRANULARITY` | unset | Colouring granularity (KiB) |
//! | `NEO_MULTI_STORAGE_POLICY` | unset | Colouring policy (0 device count, 1 chunk size, 2 mapping) |
//! | `NEO_FORCE_SYSTEM_MEMORY_PLACEMENT` | 0 | Allocation-type mask forced to system memory |
//! | `NEO_MULTI_TILE_ISA_PLACEMENT` | -1 | Instance ISA on every tile |
//! | `NEO_LOG_FORMAT` | json | `json` or `pretty` |
//! | `NEO_LOG_LEVEL` | info | `EnvFilter` directive |
//! | `NEO_LOG_FILE` | unset | Append logs to this file instead of stderr |

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::compiler_cache::CacheSettings;
use crate::fs::{EnvReader, SystemEnv};
use crate::memory::MemorySettings;
use crate::telemetry::{LogConfig, LogFormat};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Effective configuration summary (serializable).
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub cache: CacheSettings,
    pub cache_persistent: bool,
    pub cache_size: usize,
    pub memory: MemorySettings,
    pub log_format: &'static str,
    pub log_level: String,
    pub log_file: Option<String>,
}

/// All driver configuration loaded from environment variables.
#[derive(Debug, Clone, Default)]
pub struct DriverConfig {
    pub cache: CacheSettings,
    pub memory: MemorySettings,
    pub log: LogConfig,
}

fn load_log_config(env: &dyn EnvReader) -> LogConfig {
    let defaults = LogConfig::default();
    let format = env
        .get("NEO_LOG_FORMAT")
        .and_then(|v| v.parse::<LogFormat>().ok())
        .unwrap_or(defaults.format);
    let level = env
        .get("NEO_LOG_LEVEL")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or(defaults.level);
    let output_path = env.get("NEO_LOG_FILE").filter(|v| !v.is_empty()).map(PathBuf::from);
    LogConfig { format, level, output_path }
}

/// Load all configuration from the process environment.
pub fn load() -> DriverConfig {
    load_from(&SystemEnv)
}

/// Load all configuration from `env`.
pub fn load_from(env: &dyn EnvReader) -> DriverConfig {
    DriverConfig {
        cache: CacheSettings::from_env(env),
        memory: MemorySettings::from_env(env),
        log: load_log_config(env),
    }
}

impl DriverConfig {
    /// Return a serializable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            cache: self.cache.clone(),
            cache_persistent: self.cache.persistent_enabled(),
            cache_size: self.cache.cache_size(),
            memory: self.memory.clone(),
            log_format: match self.log.format {
                LogFormat::Json => "json",
                LogFormat::Pretty => "pretty",
            },
            log_level: self.log.level.clone(),
            log_file: self.log.output_path.as_ref().map(|p| p.display().to_string()),
        }
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(&self.effective_config())?)
    }
}
