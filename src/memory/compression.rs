// Copyright 2024-2026 GFX-CORE Contributors
// Licensed under the Apache License, Version 2.0

use super::settings::HardwareInfo;

/// Whether a buffer of `size` bytes may be render-compressed.
pub fn is_compression_enabled(override_flag: Option<bool>, hw: &HardwareInfo, size: u64) -> bool {
    override_flag.unwrap_or(hw.ftr_render_compressed_buffers)
        && size >= hw.min_compression_size
        && !hw.compression_forbidden
}
