// Copyright 2024-2026 GFX-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Depth-bounded scans of the cache directory.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};

use crate::fs::FileSystemOps;

/// A cache file seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFileElement {
    pub path: PathBuf,
    pub last_access_time: u64,
    pub file_size: u64,
}

/// List cache files under `root`, breadth first, at most `max_depth`
/// directory levels below it. Only names ending in `extension` are returned.
///
/// A missing `root` yields an empty list.
pub fn get_files(
    fs: &dyn FileSystemOps,
    root: &Path,
    max_depth: usize,
    extension: &str,
) -> io::Result<Vec<CachedFileElement>> {
    let mut files = Vec::new();
    if !fs.path_exists(root) {
        return Ok(files);
    }

    let mut queue = VecDeque::from([(root.to_path_buf(), 0usize)]);
    while let Some((dir, depth)) = queue.pop_front() {
        for entry in fs.read_dir(&dir)? {
            if entry.is_dir {
                if depth < max_depth {
                    queue.push_back((entry.path, depth + 1));
                }
                continue;
            }
            let matches = entry
                .path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(extension))
                .unwrap_or(false);
            if !matches {
                continue;
            }
            // Files deleted between readdir and stat are skipped.
            if let Ok(stat) = fs.metadata(&entry.path) {
                files.push(CachedFileElement {
                    path: entry.path,
                    last_access_time: stat.accessed,
                    file_size: stat.size,
                });
            }
        }
    }
    Ok(files)
}

/// Modification time in seconds, 0 if the path cannot be stat'ed.
pub fn get_file_modification_time(fs: &dyn FileSystemOps, path: &Path) -> u64 {
    fs.metadata(path).map(|s| s.modified).unwrap_or(0)
}

/// File size in bytes, 0 if the path cannot be stat'ed.
pub fn get_file_size(fs: &dyn FileSystemOps, path: &Path) -> u64 {
    fs.metadata(path).map(|s| s.size).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{FsOp, MemoryFileSystem};

    #[test]
    fn missing_root_is_empty_not_error() {
        let fs = MemoryFileSystem::new();
        let files = get_files(&fs, Path::new("nowhere"), 2, ".cl_cache").unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn scan_stops_at_max_depth() {
        let fs = MemoryFileSystem::new();
        fs.add_file("cache/top.cl_cache", b"1");
        fs.add_file("cache/a/one.cl_cache", b"22");
        fs.add_file("cache/a/b/two.cl_cache", b"333");

        let shallow = get_files(&fs, Path::new("cache"), 1, ".cl_cache").unwrap();
        let mut names: Vec<_> = shallow.iter().map(|f| f.path.clone()).collect();
        names.sort();
        assert_eq!(
            names,
            vec![PathBuf::from("cache/a/one.cl_cache"), PathBuf::from("cache/top.cl_cache")]
        );

        let deep = get_files(&fs, Path::new("cache"), 2, ".cl_cache").unwrap();
        assert_eq!(deep.len(), 3);
    }

    #[test]
    fn scan_skips_foreign_extensions_and_directories() {
        let fs = MemoryFileSystem::new();
        fs.add_file("cache/config.file", b"12345678");
        fs.add_file("cache/tmp.abcdef", b"x");
        fs.add_file("cache/k.l0_cache", b"x");
        fs.add_dir("cache/d.cl_cache");
        fs.add_file("cache/k.cl_cache", b"xyz");

        let files = get_files(&fs, Path::new("cache"), 0, ".cl_cache").unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_size, 3);
    }

    #[test]
    fn read_dir_failure_is_an_error() {
        let fs = MemoryFileSystem::new();
        fs.add_dir("cache");
        fs.fail(FsOp::ReadDir);
        assert!(get_files(&fs, Path::new("cache"), 1, ".cl_cache").is_err());
    }

    #[test]
    fn helpers_return_zero_for_missing_files() {
        let fs = MemoryFileSystem::new();
        fs.add_file("tmp/file1", &[0u8; 20]);
        assert_eq!(get_file_size(&fs, Path::new("tmp/file1")), 20);
        assert!(get_file_modification_time(&fs, Path::new("tmp/file1")) > 0);
        assert_eq!(get_file_size(&fs, Path::new("tmp/missing")), 0);
        assert_eq!(get_file_modification_time(&fs, Path::new("tmp/missing")), 0);
    }
}
