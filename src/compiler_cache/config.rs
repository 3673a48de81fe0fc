// Copyright 2024-2026 GFX-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Compiler cache configuration and default cache directory discovery.

use std::io;
use std::path::Path;

use serde::Serialize;

use crate::fs::{EnvReader, FileSystemOps};

/// Default cache budget: 1 GiB.
pub const DEFAULT_CACHE_SIZE: usize = 1024 * 1024 * 1024;

/// Directory name created under the platform cache root.
pub const NEO_COMPILER_CACHE_DIR: &str = "neo_compiler_cache";

/// `NEO_CACHE_DIR` value that requests auto-discovery.
pub const DEFAULT_DIR_SENTINEL: &str = "default";

/// API whose binaries are cached. Selects extension and legacy directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CacheApi {
    OpenCl,
    LevelZero,
    Ocloc,
}

impl CacheApi {
    pub fn file_extension(self) -> &'static str {
        match self {
            CacheApi::OpenCl => ".cl_cache",
            CacheApi::LevelZero => ".l0_cache",
            CacheApi::Ocloc => ".ocloc_cache",
        }
    }

    /// Fixed directory used when persistent caching is off.
    pub fn legacy_dir(self) -> &'static str {
        match self {
            CacheApi::OpenCl => "cl_cache",
            CacheApi::LevelZero => "l0_cache",
            CacheApi::Ocloc => "ocloc_cache",
        }
    }
}

/// Resolved cache configuration. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompilerCacheConfig {
    pub enabled: bool,
    pub cache_dir: String,
    pub cache_file_extension: String,
    pub cache_size: usize,
}

impl CompilerCacheConfig {
    pub fn new(enabled: bool, cache_dir: &str, cache_file_extension: &str, cache_size: usize) -> Self {
        Self {
            enabled,
            cache_dir: cache_dir.to_string(),
            cache_file_extension: cache_file_extension.to_string(),
            cache_size,
        }
    }

    pub fn disabled(api: CacheApi) -> Self {
        Self::new(false, "", api.file_extension(), DEFAULT_CACHE_SIZE)
    }
}

/// Whether persistent caching is on when `NEO_CACHE_PERSISTENT` is unset.
pub fn default_cache_enabled() -> bool {
    cfg!(target_os = "linux")
}

/// Raw cache settings as read from the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheSettings {
    /// `NEO_CACHE_PERSISTENT`: `None` means "use `default_enabled`".
    pub persistent: Option<bool>,
    /// Platform default applied when `persistent` is `None`.
    pub default_enabled: bool,
    /// `NEO_CACHE_DIR`, verbatim.
    pub cache_dir: Option<String>,
    /// `NEO_CACHE_MAX_SIZE` in bytes; `Some(0)` means unbounded.
    pub max_size: Option<u64>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            persistent: None,
            default_enabled: default_cache_enabled(),
            cache_dir: None,
            max_size: None,
        }
    }
}

impl CacheSettings {
    /// Read the `NEO_CACHE_*` variables. Unparseable values count as unset.
    pub fn from_env(env: &dyn EnvReader) -> Self {
        let persistent = env
            .get("NEO_CACHE_PERSISTENT")
            .and_then(|v| v.trim().parse::<i64>().ok())
            .and_then(|v| match v {
                -1 => None,
                0 => Some(false),
                _ => Some(true),
            });
        let cache_dir = env.get("NEO_CACHE_DIR");
        let max_size = env
            .get("NEO_CACHE_MAX_SIZE")
            .and_then(|v| v.trim().parse::<u64>().ok());
        Self { persistent, cache_dir, max_size, ..Self::default() }
    }

    pub fn persistent_enabled(&self) -> bool {
        self.persistent.unwrap_or(self.default_enabled)
    }

    pub fn cache_size(&self) -> usize {
        match self.max_size {
            None => DEFAULT_CACHE_SIZE,
            Some(0) => usize::MAX,
            Some(bytes) => usize::try_from(bytes).unwrap_or(usize::MAX),
        }
    }
}

/// Resolve the configuration from the process-independent inputs.
pub fn default_compiler_cache_config(
    api: CacheApi,
    env: &dyn EnvReader,
    fs: &dyn FileSystemOps,
) -> CompilerCacheConfig {
    resolve_cache_config(&CacheSettings::from_env(env), api, env, fs)
}

/// Resolve the configuration from already parsed settings.
///
/// Directory problems never fail: they disable caching.
pub fn resolve_cache_config(
    settings: &CacheSettings,
    api: CacheApi,
    env: &dyn EnvReader,
    fs: &dyn FileSystemOps,
) -> CompilerCacheConfig {
    if !settings.persistent_enabled() {
        let legacy = api.legacy_dir();
        let enabled = fs.path_exists(Path::new(legacy));
        tracing::debug!(dir = legacy, enabled, "persistent compiler cache off, using legacy directory");
        return CompilerCacheConfig::new(enabled, legacy, api.file_extension(), DEFAULT_CACHE_SIZE);
    }

    let explicit = settings
        .cache_dir
        .as_deref()
        .filter(|dir| !dir.is_empty() && *dir != DEFAULT_DIR_SENTINEL);

    let cache_dir = match explicit {
        Some(dir) if fs.path_exists(Path::new(dir)) => Some(dir.to_string()),
        Some(dir) => {
            tracing::debug!(dir, "NEO_CACHE_DIR does not exist, compiler cache disabled");
            None
        }
        None => discover_default_cache_dir(env, fs),
    };

    match cache_dir {
        Some(dir) => CompilerCacheConfig::new(true, &dir, api.file_extension(), settings.cache_size()),
        None => CompilerCacheConfig {
            cache_size: settings.cache_size(),
            ..CompilerCacheConfig::disabled(api)
        },
    }
}

/// Platform default cache directory, created if missing.
pub fn discover_default_cache_dir(env: &dyn EnvReader, fs: &dyn FileSystemOps) -> Option<String> {
    if cfg!(windows) {
        windows_default_cache_dir(env, fs)
    } else {
        linux_default_cache_dir(env, fs)
    }
}

/// `$XDG_CACHE_HOME/neo_compiler_cache`, else `$HOME/.cache/neo_compiler_cache`.
pub fn linux_default_cache_dir(env: &dyn EnvReader, fs: &dyn FileSystemOps) -> Option<String> {
    if let Some(xdg) = env.get("XDG_CACHE_HOME").filter(|v| !v.is_empty()) {
        let xdg = Path::new(&xdg);
        if fs.path_exists(xdg) {
            return ensure_dir(fs, &xdg.join(NEO_COMPILER_CACHE_DIR));
        }
    }

    let home = env.get("HOME").filter(|v| !v.is_empty())?;
    let cache_home = Path::new(&home).join(".cache");
    ensure_dir(fs, &cache_home)?;
    ensure_dir(fs, &cache_home.join(NEO_COMPILER_CACHE_DIR))
}

/// `%LOCALAPPDATA%\NEO\neo_compiler_cache`.
pub fn windows_default_cache_dir(env: &dyn EnvReader, fs: &dyn FileSystemOps) -> Option<String> {
    let local_app_data = env.get("LOCALAPPDATA").filter(|v| !v.is_empty())?;
    let root = Path::new(&local_app_data);
    if !fs.path_exists(root) {
        return None;
    }
    let neo = root.join("NEO");
    ensure_dir(fs, &neo)?;
    ensure_dir(fs, &neo.join(NEO_COMPILER_CACHE_DIR))
}

/// Make sure `dir` exists. A concurrent creator winning the race is fine.
fn ensure_dir(fs: &dyn FileSystemOps, dir: &Path) -> Option<String> {
    if !fs.path_exists(dir) {
        match fs.create_dir(dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                tracing::debug!(dir = %dir.display(), error = %e, "cannot create compiler cache directory");
                return None;
            }
        }
    }
    Some(dir.to_string_lossy().into_owned())
}
