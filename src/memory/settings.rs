// Copyright 2024-2026 GFX-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Memory-manager settings and per-root-device hardware capabilities.

use serde::Serialize;

use super::constants::{DEFAULT_HUGE_CHUNK_SIZE, KB, PAGE_SIZE_64K};
use super::storage_info::ColouringPolicy;
use crate::fs::EnvReader;

/// Debug and tuning switches read from `NEO_*` variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemorySettings {
    /// `None` follows the hardware.
    pub enable_local_memory: Option<bool>,
    pub force_32bit_addressing: bool,
    /// Compression override, `None` follows the hardware.
    pub render_compressed_buffers: Option<bool>,
    pub enable_64kb_pages: bool,
    pub huge_chunk_size: u64,
    /// Colouring granularity override in KiB.
    pub multi_storage_granularity_kb: Option<u64>,
    pub multi_storage_policy: Option<ColouringPolicy>,
    /// Bit `index - 1` forces that allocation type into system memory.
    pub force_system_memory_placement: u64,
    pub multi_tile_isa_placement: Option<bool>,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            enable_local_memory: None,
            force_32bit_addressing: false,
            render_compressed_buffers: None,
            enable_64kb_pages: true,
            huge_chunk_size: DEFAULT_HUGE_CHUNK_SIZE,
            multi_storage_granularity_kb: None,
            multi_storage_policy: None,
            force_system_memory_placement: 0,
            multi_tile_isa_placement: None,
        }
    }
}

fn parse_i64(env: &dyn EnvReader, name: &str) -> Option<i64> {
    env.get(name).and_then(|v| v.trim().parse::<i64>().ok())
}

fn parse_tri_state(env: &dyn EnvReader, name: &str) -> Option<bool> {
    parse_i64(env, name).and_then(|v| match v {
        -1 => None,
        0 => Some(false),
        _ => Some(true),
    })
}

/// Accepts decimal or `0x`-prefixed hexadecimal.
fn parse_mask(env: &dyn EnvReader, name: &str) -> Option<u64> {
    let raw = env.get(name)?;
    let raw = raw.trim();
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => raw.parse::<u64>().ok(),
    }
}

impl MemorySettings {
    /// Read the memory variables. Unparseable values keep their defaults.
    pub fn from_env(env: &dyn EnvReader) -> Self {
        let defaults = Self::default();
        Self {
            enable_local_memory: parse_tri_state(env, "NEO_ENABLE_LOCAL_MEMORY"),
            force_32bit_addressing: parse_i64(env, "NEO_FORCE_32BIT_ADDRESSING")
                .map(|v| v != 0)
                .unwrap_or(defaults.force_32bit_addressing),
            render_compressed_buffers: parse_tri_state(env, "NEO_RENDER_COMPRESSED_BUFFERS"),
            enable_64kb_pages: parse_i64(env, "NEO_ENABLE_64KB_PAGES")
                .map(|v| v != 0)
                .unwrap_or(defaults.enable_64kb_pages),
            huge_chunk_size: parse_mask(env, "NEO_HUGE_CHUNK_SIZE")
                .filter(|&v| v >= PAGE_SIZE_64K)
                .unwrap_or(defaults.huge_chunk_size),
            multi_storage_granularity_kb: parse_i64(env, "NEO_MULTI_STORAGE_GRANULARITY")
                .filter(|&v| v > 0)
                .map(|v| v as u64),
            multi_storage_policy: parse_i64(env, "NEO_MULTI_STORAGE_POLICY")
                .and_then(ColouringPolicy::from_index),
            force_system_memory_placement: parse_mask(env, "NEO_FORCE_SYSTEM_MEMORY_PLACEMENT")
                .unwrap_or(defaults.force_system_memory_placement),
            multi_tile_isa_placement: parse_tri_state(env, "NEO_MULTI_TILE_ISA_PLACEMENT"),
        }
    }

    /// Granularity override in bytes.
    pub fn multi_storage_granularity(&self) -> Option<u64> {
        self.multi_storage_granularity_kb.map(|kb| kb * KB)
    }
}

/// What one root device can do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HardwareInfo {
    pub ftr_local_memory: bool,
    /// Number of tiles; each tile owns one local memory bank.
    pub sub_device_count: u32,
    pub ftr_render_compressed_buffers: bool,
    pub min_compression_size: u64,
    pub compression_forbidden: bool,
    pub supports_multi_storage_resources: bool,
}

impl Default for HardwareInfo {
    fn default() -> Self {
        Self {
            ftr_local_memory: true,
            sub_device_count: 1,
            ftr_render_compressed_buffers: false,
            min_compression_size: PAGE_SIZE_64K,
            compression_forbidden: false,
            supports_multi_storage_resources: true,
        }
    }
}

impl HardwareInfo {
    /// Integrated device without local memory.
    pub fn integrated() -> Self {
        Self { ftr_local_memory: false, ..Self::default() }
    }

    pub fn with_sub_devices(mut self, count: u32) -> Self {
        self.sub_device_count = count.max(1);
        self
    }

    /// Mask with one bit per tile.
    pub fn all_tiles_mask(&self) -> u32 {
        match self.sub_device_count {
            0 | 1 => 1,
            n if n >= 32 => u32::MAX,
            n => (1u32 << n) - 1,
        }
    }
}
