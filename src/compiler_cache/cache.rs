// Copyright 2024-2026 GFX-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Size-bounded on-disk cache of compiled kernel binaries.
//!
//! Layout under `cache_dir`:
//!
//! ```text
//! config.file                  native-endian u64: bytes held by cache files
//! <h0>/<hash><ext>             sharded by the first MAX_CACHE_DEPTH hash chars
//! tmp.XXXXXX                   in-flight write, renamed into place when done
//! ```
//!
//! Writers serialise on a process-wide mutex and then on an exclusive lock of
//! `config.file`, held for the whole check/evict/write/update sequence.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;

use super::config::CompilerCacheConfig;
use super::files::get_files;
use crate::fs::{CacheFile, FileSystemOps};
use crate::telemetry;

/// Number of hash characters used as shard directory levels.
pub const MAX_CACHE_DEPTH: usize = 1;

/// Sidecar file holding the tracked directory size.
pub const CONFIG_FILE_NAME: &str = "config.file";

const TEMP_FILE_PREFIX: &str = "tmp.";
const TEMP_NAME_LEN: usize = 6;
const TEMP_NAME_ATTEMPTS: usize = 16;

/// Serialises cache access between all `CompilerCache` instances in the
/// process; `config.file` locks only exclude other processes.
static CACHE_ACCESS: Mutex<()> = Mutex::new(());

/// Hashes name files directly, so only ASCII alphanumerics are accepted.
fn is_valid_hash(hash: &str) -> bool {
    !hash.is_empty() && hash.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Errors raised inside a cache operation.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cannot open cache config file {path}: {source}")]
    ConfigFile { path: PathBuf, source: io::Error },
    #[error("cannot lock cache config file: {0}")]
    Lock(#[source] io::Error),
    #[error("cannot update cache config file: {0}")]
    ConfigWrite(#[source] io::Error),
    #[error("cache directory scan failed: {0}")]
    Scan(#[source] io::Error),
    #[error("cannot write temporary cache file {path}: {source}")]
    TempFile { path: PathBuf, source: io::Error },
    #[error("cannot create cache shard directory {path}: {source}")]
    ShardDir { path: PathBuf, source: io::Error },
    #[error("invalid cache hash {0:?}")]
    InvalidHash(String),
    #[error("cannot rename {from} to {to}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },
}

/// How a `cache_binary` call ended when no I/O error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// The binary was written under its final name.
    Stored,
    /// A file for this hash was already present.
    AlreadyCached,
    /// Caching is disabled, the binary is empty or larger than the cache.
    Rejected,
    /// Eviction could not make room.
    NoSpace,
}

impl CacheOutcome {
    pub fn is_cached(self) -> bool {
        matches!(self, CacheOutcome::Stored | CacheOutcome::AlreadyCached)
    }
}

/// How much eviction frees once the cache is over budget.
///
/// Eviction stops as soon as at least `cache_size * numerator / denominator`
/// bytes have been removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
    pub numerator: u64,
    pub denominator: u64,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self { numerator: 1, denominator: 3 }
    }
}

impl EvictionPolicy {
    pub fn target_bytes(&self, cache_size: usize) -> u64 {
        let denominator = self.denominator.max(1);
        let size = cache_size as u128;
        let target = size * self.numerator as u128 / denominator as u128;
        u64::try_from(target).unwrap_or(u64::MAX)
    }
}

/// Exclusive lock on the sidecar, released on drop.
struct ConfigFileLock {
    file: Box<dyn CacheFile>,
}

impl ConfigFileLock {
    fn acquire(mut file: Box<dyn CacheFile>) -> Result<Self, CacheError> {
        file.lock_exclusive().map_err(CacheError::Lock)?;
        Ok(Self { file })
    }

    /// Stored size, or `None` when the sidecar holds fewer than 8 bytes.
    fn read_size(&mut self) -> Result<Option<u64>, CacheError> {
        let mut buf = [0u8; 8];
        let n = self
            .file
            .read_at(&mut buf, 0)
            .map_err(|source| CacheError::ConfigFile { path: PathBuf::from(CONFIG_FILE_NAME), source })?;
        Ok((n == buf.len()).then(|| u64::from_ne_bytes(buf)))
    }

    fn write_size(&mut self, size: u64) -> Result<(), CacheError> {
        self.file
            .write_all_at(&size.to_ne_bytes(), 0)
            .map_err(CacheError::ConfigWrite)
    }
}

impl Drop for ConfigFileLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!(error = %e, "failed to unlock compiler cache config file");
        }
    }
}

/// Persistent compiler cache bound to one resolved configuration.
pub struct CompilerCache {
    config: CompilerCacheConfig,
    fs: Arc<dyn FileSystemOps>,
    eviction: EvictionPolicy,
    max_depth: usize,
}

impl CompilerCache {
    pub fn new(config: CompilerCacheConfig, fs: Arc<dyn FileSystemOps>) -> Self {
        Self {
            config,
            fs,
            eviction: EvictionPolicy::default(),
            max_depth: MAX_CACHE_DEPTH,
        }
    }

    pub fn with_eviction_policy(mut self, eviction: EvictionPolicy) -> Self {
        self.eviction = eviction;
        self
    }

    pub fn config(&self) -> &CompilerCacheConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn root(&self) -> &Path {
        Path::new(&self.config.cache_dir)
    }

    fn config_file_path(&self) -> PathBuf {
        self.root().join(CONFIG_FILE_NAME)
    }

    fn shard_dirs(&self, hash: &str) -> Vec<PathBuf> {
        let mut dir = self.root().to_path_buf();
        hash.chars()
            .take(self.max_depth)
            .map(|c| {
                dir.push(c.to_string());
                dir.clone()
            })
            .collect()
    }

    /// Final location of the binary for `hash`.
    pub fn cache_file_path(&self, hash: &str) -> PathBuf {
        let dir = self
            .shard_dirs(hash)
            .pop()
            .unwrap_or_else(|| self.root().to_path_buf());
        dir.join(format!("{hash}{}", self.config.cache_file_extension))
    }

    /// Store `binary` under `hash`. Returns `true` if the binary is in the
    /// cache afterwards.
    pub fn cache_binary(&self, hash: &str, binary: &[u8]) -> bool {
        match self.try_cache_binary(hash, binary) {
            Ok(outcome) => outcome.is_cached(),
            Err(e) => {
                tracing::debug!(hash, error = %e, "compiler cache write failed");
                false
            }
        }
    }

    pub fn try_cache_binary(&self, hash: &str, binary: &[u8]) -> Result<CacheOutcome, CacheError> {
        if !self.config.enabled || binary.is_empty() || binary.len() > self.config.cache_size {
            return Ok(CacheOutcome::Rejected);
        }
        if !is_valid_hash(hash) {
            return Err(CacheError::InvalidHash(hash.to_string()));
        }

        let _guard = CACHE_ACCESS.lock();
        let (mut config_file, mut directory_size) = self.lock_config_file_and_read_size()?;

        let file_path = self.cache_file_path(hash);
        if self.fs.path_exists(&file_path) {
            return Ok(CacheOutcome::AlreadyCached);
        }

        let binary_size = binary.len() as u64;
        let cache_size = self.config.cache_size as u64;
        if directory_size.saturating_add(binary_size) > cache_size {
            let evicted = match self.evict_cache() {
                Ok(evicted) => evicted,
                Err(e) => {
                    tracing::debug!(error = %e, "compiler cache eviction failed");
                    config_file.write_size(directory_size)?;
                    return Ok(CacheOutcome::NoSpace);
                }
            };
            directory_size = directory_size.saturating_sub(evicted);
            if directory_size.saturating_add(binary_size) > cache_size {
                config_file.write_size(directory_size)?;
                return Ok(CacheOutcome::NoSpace);
            }
        }

        let temp_path = self.create_unique_temp_file_and_write_data(binary)?;
        if let Err(e) = self.create_shard_directories(hash) {
            self.remove_quietly(&temp_path);
            return Err(e);
        }
        self.rename_temp_file_binary_to_proper_name(&temp_path, &file_path)?;

        directory_size = directory_size.saturating_add(binary_size);
        config_file.write_size(directory_size)?;
        telemetry::record_cache_write(binary_size);
        tracing::debug!(hash, bytes = binary_size, directory_size, "compiler cache entry stored");
        Ok(CacheOutcome::Stored)
    }

    /// Read the cached binary for `hash`, if present.
    pub fn load_cached_binary(&self, hash: &str) -> Option<Vec<u8>> {
        if !self.config.enabled {
            return None;
        }
        if !is_valid_hash(hash) {
            tracing::debug!(hash, "refusing cache lookup for invalid hash");
            return None;
        }
        let path = self.cache_file_path(hash);
        match self.fs.read_file(&path) {
            Ok(data) => {
                telemetry::record_cache_lookup(true);
                Some(data)
            }
            Err(e) => {
                telemetry::record_cache_lookup(false);
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::debug!(path = %path.display(), error = %e, "cannot read cached binary");
                }
                None
            }
        }
    }

    /// Size recorded in the sidecar, computed by a scan if it is missing.
    pub fn directory_size(&self) -> Result<u64, CacheError> {
        let _guard = CACHE_ACCESS.lock();
        let (_config_file, size) = self.lock_config_file_and_read_size()?;
        Ok(size)
    }

    fn lock_config_file_and_read_size(&self) -> Result<(ConfigFileLock, u64), CacheError> {
        let path = self.config_file_path();
        let config_error = |source: io::Error| CacheError::ConfigFile { path: path.clone(), source };

        let (file, created) = match self.fs.open_existing(&path) {
            Ok(file) => (file, false),
            Err(e) if e.kind() == io::ErrorKind::NotFound => match self.fs.create_new(&path) {
                Ok(file) => (file, true),
                // Another process created it first; its size is authoritative.
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    (self.fs.open_existing(&path).map_err(config_error)?, false)
                }
                Err(e) => return Err(config_error(e)),
            },
            Err(e) => return Err(config_error(e)),
        };

        let mut lock = ConfigFileLock::acquire(file)?;
        let stored = if created { None } else { lock.read_size()? };
        let size = match stored {
            Some(size) => size,
            None => {
                let size = self.scan_directory_size()?;
                lock.write_size(size)?;
                size
            }
        };
        Ok((lock, size))
    }

    fn scan_directory_size(&self) -> Result<u64, CacheError> {
        let files = get_files(&*self.fs, self.root(), self.max_depth, &self.config.cache_file_extension)
            .map_err(CacheError::Scan)?;
        Ok(files.iter().map(|f| f.file_size).sum())
    }

    /// Delete cache files, least recently accessed first, until the policy
    /// target is reached or nothing is left. Returns the bytes removed.
    ///
    /// Files that cannot be deleted are skipped. Only a failed scan is an
    /// error.
    pub fn evict_cache(&self) -> Result<u64, CacheError> {
        let mut files = get_files(&*self.fs, self.root(), self.max_depth, &self.config.cache_file_extension)
            .map_err(CacheError::Scan)?;
        files.sort_by_key(|f| f.last_access_time);

        let target = self.eviction.target_bytes(self.config.cache_size);
        let mut evicted = 0u64;
        let mut evicted_files = 0usize;
        for file in &files {
            if evicted >= target {
                break;
            }
            match self.fs.remove_file(&file.path) {
                Ok(()) => {
                    evicted += file.file_size;
                    evicted_files += 1;
                }
                Err(e) => {
                    tracing::debug!(path = %file.path.display(), error = %e, "skipping cache file that could not be evicted");
                }
            }
        }

        telemetry::record_cache_eviction(evicted);
        tracing::debug!(evicted, evicted_files, target, "compiler cache eviction finished");
        Ok(evicted)
    }

    fn create_unique_temp_file_and_write_data(&self, binary: &[u8]) -> Result<PathBuf, CacheError> {
        let (path, mut file) = self.create_unique_temp_file()?;
        let written = file.write_all_at(binary, 0).and_then(|()| file.sync_all());
        drop(file);
        if let Err(source) = written {
            self.remove_quietly(&path);
            return Err(CacheError::TempFile { path, source });
        }
        Ok(path)
    }

    fn create_unique_temp_file(&self) -> Result<(PathBuf, Box<dyn CacheFile>), CacheError> {
        let mut rng = rand::thread_rng();
        let mut last_error = io::Error::new(io::ErrorKind::AlreadyExists, "no unique temporary name");
        for _ in 0..TEMP_NAME_ATTEMPTS {
            let suffix: String = (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(TEMP_NAME_LEN)
                .map(char::from)
                .collect();
            let path = self.root().join(format!("{TEMP_FILE_PREFIX}{suffix}"));
            match self.fs.create_new(&path) {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => last_error = e,
                Err(source) => return Err(CacheError::TempFile { path, source }),
            }
        }
        Err(CacheError::TempFile { path: self.root().to_path_buf(), source: last_error })
    }

    fn create_shard_directories(&self, hash: &str) -> Result<(), CacheError> {
        for dir in self.shard_dirs(hash) {
            if self.fs.path_exists(&dir) {
                continue;
            }
            match self.fs.create_dir(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(source) => return Err(CacheError::ShardDir { path: dir, source }),
            }
        }
        Ok(())
    }

    fn rename_temp_file_binary_to_proper_name(&self, from: &Path, to: &Path) -> Result<(), CacheError> {
        self.fs.rename(from, to).map_err(|source| {
            self.remove_quietly(from);
            CacheError::Rename { from: from.to_path_buf(), to: to.to_path_buf(), source }
        })
    }

    fn remove_quietly(&self, path: &Path) {
        if let Err(e) = self.fs.remove_file(path) {
            tracing::debug!(path = %path.display(), error = %e, "cannot remove temporary cache file");
        }
    }
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
