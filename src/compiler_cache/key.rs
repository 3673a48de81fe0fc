// Copyright 2024-2026 GFX-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Cache key derivation.

use sha2::{Digest, Sha256};

/// Incremental builder for cache file names.
///
/// Each part is length-prefixed so `("ab", "c")` and `("a", "bc")` differ.
#[derive(Debug, Clone, Default)]
pub struct CacheKeyBuilder {
    hasher: Sha256,
}

impl CacheKeyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn part(mut self, bytes: &[u8]) -> Self {
        self.hasher.update((bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
        self
    }

    /// Lower-case hex digest, usable as a cache file stem.
    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Name for a binary compiled from `source` with the given options on the
/// device identified by `device_id`.
pub fn cached_file_name(
    device_id: &str,
    source: &[u8],
    options: &str,
    internal_options: &str,
) -> String {
    CacheKeyBuilder::new()
        .part(device_id.as_bytes())
        .part(source)
        .part(options.as_bytes())
        .part(internal_options.as_bytes())
        .finish()
}
