// Copyright 2024-2026 GFX-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Filesystem and environment abstraction.
//!
//! The compiler cache and its directory discovery never touch `std::fs` or
//! `std::env` directly. They go through [`FileSystemOps`] and [`EnvReader`] so
//! the same algorithms run against the real OS ([`OsFileSystem`],
//! [`SystemEnv`]) or against the in-memory doubles used by tests
//! ([`MemoryFileSystem`], [`MapEnv`]).
//!
//! Platform-specific pieces (advisory file locks) live in `cfg`-gated modules.

mod memory;
#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

pub use memory::{FsOp, MemoryFileSystem};

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Result of a `stat`-like query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    /// Last access time, seconds since the Unix epoch.
    pub accessed: u64,
    /// Last modification time, seconds since the Unix epoch.
    pub modified: u64,
    pub is_dir: bool,
}

/// One directory entry returned by [`FileSystemOps::read_dir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub path: PathBuf,
    pub is_dir: bool,
}

/// An open file handle used for the cache sidecar and temp files.
pub trait CacheFile: Send {
    /// Block until an exclusive inter-process lock is held.
    fn lock_exclusive(&mut self) -> io::Result<()>;
    fn unlock(&mut self) -> io::Result<()>;
    /// Read into `buf` starting at `offset`; returns bytes read (short at EOF).
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
    fn write_all_at(&mut self, data: &[u8], offset: u64) -> io::Result<()>;
    fn sync_all(&mut self) -> io::Result<()>;
}

/// Filesystem primitives consumed by the compiler cache.
pub trait FileSystemOps: Send + Sync {
    fn path_exists(&self, path: &Path) -> bool;
    /// Create a single directory. Reports `ErrorKind::AlreadyExists` if present.
    fn create_dir(&self, path: &Path) -> io::Result<()>;
    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>>;
    fn metadata(&self, path: &Path) -> io::Result<FileStat>;
    /// Open an existing file for reading and writing.
    fn open_existing(&self, path: &Path) -> io::Result<Box<dyn CacheFile>>;
    /// Create a file that must not exist yet (`O_CREAT | O_EXCL`).
    fn create_new(&self, path: &Path) -> io::Result<Box<dyn CacheFile>>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn remove_file(&self, path: &Path) -> io::Result<()>;
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>>;
}

/// Environment variable lookup.
pub trait EnvReader: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
}

/// Reads the real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl EnvReader for SystemEnv {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Fixed environment backed by a map.
#[derive(Debug, Clone, Default)]
pub struct MapEnv {
    vars: HashMap<String, String>,
}

impl MapEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.vars.insert(name.to_string(), value.to_string());
        self
    }

    pub fn set(&mut self, name: &str, value: &str) {
        self.vars.insert(name.to_string(), value.to_string());
    }
}

impl EnvReader for MapEnv {
    fn get(&self, name: &str) -> Option<String> {
        self.vars.get(name).cloned()
    }
}

// -- OS filesystem ------------------------------------------------------------

/// [`FileSystemOps`] over `std::fs` with native advisory locks.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFileSystem;

struct OsCacheFile {
    file: File,
}

impl CacheFile for OsCacheFile {
    fn lock_exclusive(&mut self) -> io::Result<()> {
        lock_file(&self.file)
    }

    fn unlock(&mut self) -> io::Result<()> {
        unlock_file(&self.file)
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    fn write_all_at(&mut self, data: &[u8], offset: u64) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)
    }

    fn sync_all(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }
}

#[cfg(unix)]
use unix::{lock_file, unlock_file};
#[cfg(windows)]
use windows::{lock_file, unlock_file};

#[cfg(not(any(unix, windows)))]
fn lock_file(_file: &File) -> io::Result<()> {
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn unlock_file(_file: &File) -> io::Result<()> {
    Ok(())
}

fn epoch_secs(time: io::Result<SystemTime>) -> u64 {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl FileSystemOps for OsFileSystem {
    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            entries.push(DirEntry { path: entry.path(), is_dir });
        }
        Ok(entries)
    }

    fn metadata(&self, path: &Path) -> io::Result<FileStat> {
        let meta = std::fs::metadata(path)?;
        Ok(FileStat {
            size: meta.len(),
            accessed: epoch_secs(meta.accessed()),
            modified: epoch_secs(meta.modified()),
            is_dir: meta.is_dir(),
        })
    }

    fn open_existing(&self, path: &Path) -> io::Result<Box<dyn CacheFile>> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Box::new(OsCacheFile { file }))
    }

    fn create_new(&self, path: &Path) -> io::Result<Box<dyn CacheFile>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Box::new(OsCacheFile { file }))
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }
}
