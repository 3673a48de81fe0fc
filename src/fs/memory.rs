// Copyright 2024-2026 GFX-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! In-memory filesystem with controllable access times and failure injection.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{CacheFile, DirEntry, FileStat, FileSystemOps};

/// Operations that can be forced to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsOp {
    CreateDir,
    ReadDir,
    Metadata,
    OpenExisting,
    CreateNew,
    Write,
    Lock,
    Rename,
    RemoveFile,
    ReadFile,
}

#[derive(Debug, Default)]
struct MemFile {
    data: Arc<Mutex<Vec<u8>>>,
    accessed: u64,
    modified: u64,
    locked: Arc<Mutex<bool>>,
}

#[derive(Debug, Default)]
struct MemState {
    dirs: BTreeSet<PathBuf>,
    files: BTreeMap<PathBuf, MemFile>,
    clock: u64,
    failing: HashSet<FsOp>,
    /// Directories another "process" creates just before our `create_dir`.
    racing_dirs: HashSet<PathBuf>,
    /// Files another "process" creates just before our `create_new`.
    racing_files: BTreeMap<PathBuf, Vec<u8>>,
    removed: Vec<PathBuf>,
    create_dir_calls: Vec<PathBuf>,
    read_dir_calls: usize,
}

impl MemState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn check(&self, op: FsOp) -> io::Result<()> {
        if self.failing.contains(&op) {
            Err(io::Error::new(io::ErrorKind::Other, format!("injected {op:?} failure")))
        } else {
            Ok(())
        }
    }

    fn exists(&self, path: &Path) -> bool {
        self.dirs.contains(path) || self.files.contains_key(path)
    }

    fn parent_exists(&self, path: &Path) -> bool {
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => self.dirs.contains(parent),
            _ => true,
        }
    }
}

/// [`FileSystemOps`] double kept entirely in memory.
///
/// Access times come from a logical clock that advances on every write and
/// read, so "oldest first" is deterministic in tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryFileSystem {
    state: Arc<Mutex<MemState>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a directory and all of its ancestors.
    pub fn add_dir(&self, path: impl AsRef<Path>) {
        let mut state = self.state.lock();
        let mut current = Some(path.as_ref());
        while let Some(p) = current {
            if p.as_os_str().is_empty() {
                break;
            }
            state.dirs.insert(p.to_path_buf());
            current = p.parent();
        }
    }

    /// Create a file (and its parent directories) with the given contents.
    pub fn add_file(&self, path: impl AsRef<Path>, data: &[u8]) {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            self.add_dir(parent);
        }
        let mut state = self.state.lock();
        let now = state.tick();
        state.files.insert(
            path.to_path_buf(),
            MemFile {
                data: Arc::new(Mutex::new(data.to_vec())),
                accessed: now,
                modified: now,
                locked: Arc::new(Mutex::new(false)),
            },
        );
    }

    pub fn set_access_time(&self, path: impl AsRef<Path>, accessed: u64) {
        if let Some(file) = self.state.lock().files.get_mut(path.as_ref()) {
            file.accessed = accessed;
        }
    }

    pub fn fail(&self, op: FsOp) {
        self.state.lock().failing.insert(op);
    }

    pub fn clear_failure(&self, op: FsOp) {
        self.state.lock().failing.remove(&op);
    }

    /// Simulate another process creating `path` right before our `create_dir`.
    pub fn race_create_dir(&self, path: impl AsRef<Path>) {
        self.state.lock().racing_dirs.insert(path.as_ref().to_path_buf());
    }

    /// Simulate another process creating `path` right before our `create_new`.
    pub fn race_create_file(&self, path: impl AsRef<Path>, data: &[u8]) {
        self.state
            .lock()
            .racing_files
            .insert(path.as_ref().to_path_buf(), data.to_vec());
    }

    pub fn file_contents(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.state
            .lock()
            .files
            .get(path.as_ref())
            .map(|f| f.data.lock().clone())
    }

    pub fn is_dir(&self, path: impl AsRef<Path>) -> bool {
        self.state.lock().dirs.contains(path.as_ref())
    }

    pub fn is_locked(&self, path: impl AsRef<Path>) -> bool {
        self.state
            .lock()
            .files
            .get(path.as_ref())
            .map(|f| *f.locked.lock())
            .unwrap_or(false)
    }

    /// Every regular file currently stored, sorted by path.
    pub fn files(&self) -> Vec<PathBuf> {
        self.state.lock().files.keys().cloned().collect()
    }

    /// Paths passed to successful `remove_file` calls, in call order.
    pub fn removed_files(&self) -> Vec<PathBuf> {
        self.state.lock().removed.clone()
    }

    pub fn create_dir_calls(&self) -> Vec<PathBuf> {
        self.state.lock().create_dir_calls.clone()
    }

    pub fn read_dir_calls(&self) -> usize {
        self.state.lock().read_dir_calls
    }

    fn handle(&self, path: &Path) -> Option<MemHandle> {
        let state = self.state.lock();
        state.files.get(path).map(|f| MemHandle {
            fs: self.clone(),
            path: path.to_path_buf(),
            data: f.data.clone(),
            locked: f.locked.clone(),
            holds_lock: false,
        })
    }
}

struct MemHandle {
    fs: MemoryFileSystem,
    path: PathBuf,
    data: Arc<Mutex<Vec<u8>>>,
    locked: Arc<Mutex<bool>>,
    holds_lock: bool,
}

impl CacheFile for MemHandle {
    fn lock_exclusive(&mut self) -> io::Result<()> {
        self.fs.state.lock().check(FsOp::Lock)?;
        let mut locked = self.locked.lock();
        if *locked {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "file already locked"));
        }
        *locked = true;
        self.holds_lock = true;
        Ok(())
    }

    fn unlock(&mut self) -> io::Result<()> {
        if self.holds_lock {
            *self.locked.lock() = false;
            self.holds_lock = false;
        }
        Ok(())
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let data = self.data.lock();
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write_all_at(&mut self, bytes: &[u8], offset: u64) -> io::Result<()> {
        let now = {
            let mut state = self.fs.state.lock();
            state.check(FsOp::Write)?;
            state.tick()
        };
        {
            let mut data = self.data.lock();
            let end = offset as usize + bytes.len();
            if data.len() < end {
                data.resize(end, 0);
            }
            data[offset as usize..end].copy_from_slice(bytes);
        }
        if let Some(file) = self.fs.state.lock().files.get_mut(&self.path) {
            file.modified = now;
            file.accessed = now;
        }
        Ok(())
    }

    fn sync_all(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for MemHandle {
    fn drop(&mut self) {
        if self.holds_lock {
            *self.locked.lock() = false;
        }
    }
}

impl FileSystemOps for MemoryFileSystem {
    fn path_exists(&self, path: &Path) -> bool {
        self.state.lock().exists(path)
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        let mut state = self.state.lock();
        state.create_dir_calls.push(path.to_path_buf());
        if state.racing_dirs.remove(path) {
            state.dirs.insert(path.to_path_buf());
        }
        if state.exists(path) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "directory exists"));
        }
        state.check(FsOp::CreateDir)?;
        if !state.parent_exists(path) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "parent directory missing"));
        }
        state.dirs.insert(path.to_path_buf());
        Ok(())
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let mut state = self.state.lock();
        state.read_dir_calls += 1;
        state.check(FsOp::ReadDir)?;
        if !state.dirs.contains(path) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such directory"));
        }
        let child_of = |p: &Path| p.parent() == Some(path);
        let mut entries: Vec<DirEntry> = state
            .dirs
            .iter()
            .filter(|d| child_of(d))
            .map(|d| DirEntry { path: d.clone(), is_dir: true })
            .collect();
        entries.extend(
            state
                .files
                .keys()
                .filter(|f| child_of(f))
                .map(|f| DirEntry { path: f.clone(), is_dir: false }),
        );
        Ok(entries)
    }

    fn metadata(&self, path: &Path) -> io::Result<FileStat> {
        let state = self.state.lock();
        state.check(FsOp::Metadata)?;
        if state.dirs.contains(path) {
            return Ok(FileStat { is_dir: true, ..FileStat::default() });
        }
        match state.files.get(path) {
            Some(file) => Ok(FileStat {
                size: file.data.lock().len() as u64,
                accessed: file.accessed,
                modified: file.modified,
                is_dir: false,
            }),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no such file")),
        }
    }

    fn open_existing(&self, path: &Path) -> io::Result<Box<dyn CacheFile>> {
        self.state.lock().check(FsOp::OpenExisting)?;
        match self.handle(path) {
            Some(handle) => Ok(Box::new(handle)),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no such file")),
        }
    }

    fn create_new(&self, path: &Path) -> io::Result<Box<dyn CacheFile>> {
        {
            let mut state = self.state.lock();
            if let Some(data) = state.racing_files.remove(path) {
                drop(state);
                self.add_file(path, &data);
                state = self.state.lock();
            }
            if state.exists(path) {
                return Err(io::Error::new(io::ErrorKind::AlreadyExists, "file exists"));
            }
            state.check(FsOp::CreateNew)?;
            if !state.parent_exists(path) {
                return Err(io::Error::new(io::ErrorKind::NotFound, "parent directory missing"));
            }
        }
        self.add_file(path, &[]);
        self.handle(path)
            .map(|h| Box::new(h) as Box<dyn CacheFile>)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "file vanished"))
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut state = self.state.lock();
        state.check(FsOp::Rename)?;
        if !state.parent_exists(to) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "target directory missing"));
        }
        match state.files.remove(from) {
            Some(file) => {
                state.files.insert(to.to_path_buf(), file);
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no such file")),
        }
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        let mut state = self.state.lock();
        state.check(FsOp::RemoveFile)?;
        match state.files.remove(path) {
            Some(_) => {
                state.removed.push(path.to_path_buf());
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no such file")),
        }
    }

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        let mut state = self.state.lock();
        state.check(FsOp::ReadFile)?;
        let now = state.tick();
        match state.files.get_mut(path) {
            Some(file) => {
                file.accessed = now;
                let data = file.data.lock().clone();
                Ok(data)
            }
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no such file")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_dir_creates_ancestors() {
        let fs = MemoryFileSystem::new();
        fs.add_dir("a/b/c");
        assert!(fs.path_exists(Path::new("a")));
        assert!(fs.path_exists(Path::new("a/b")));
        assert!(fs.is_dir("a/b/c"));
    }

    #[test]
    fn create_dir_requires_parent() {
        let fs = MemoryFileSystem::new();
        let err = fs.create_dir(Path::new("missing/child")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn racing_dir_reports_already_exists() {
        let fs = MemoryFileSystem::new();
        fs.add_dir("root");
        fs.race_create_dir("root/shared");
        let err = fs.create_dir(Path::new("root/shared")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert!(fs.is_dir("root/shared"));
    }

    #[test]
    fn lock_is_released_when_handle_drops() {
        let fs = MemoryFileSystem::new();
        fs.add_dir("root");
        let mut file = fs.create_new(Path::new("root/config.file")).unwrap();
        file.lock_exclusive().unwrap();
        assert!(fs.is_locked("root/config.file"));
        drop(file);
        assert!(!fs.is_locked("root/config.file"));
    }

    #[test]
    fn read_file_bumps_access_time() {
        let fs = MemoryFileSystem::new();
        fs.add_file("root/a.cl_cache", b"abc");
        fs.set_access_time("root/a.cl_cache", 1);
        fs.read_file(Path::new("root/a.cl_cache")).unwrap();
        assert!(fs.metadata(Path::new("root/a.cl_cache")).unwrap().accessed > 1);
    }

    #[test]
    fn injected_failure_surfaces_as_error() {
        let fs = MemoryFileSystem::new();
        fs.add_file("root/a", b"x");
        fs.fail(FsOp::RemoveFile);
        assert!(fs.remove_file(Path::new("root/a")).is_err());
        fs.clear_failure(FsOp::RemoveFile);
        assert!(fs.remove_file(Path::new("root/a")).is_ok());
        assert_eq!(fs.removed_files(), vec![PathBuf::from("root/a")]);
    }
}
