//! Compiler cache against the real filesystem.

use std::path::Path;
use std::sync::Arc;

use gfx_core::compiler_cache::{
    cached_file_name, get_files, CacheApi, CacheOutcome, CompilerCache, CompilerCacheConfig,
    CONFIG_FILE_NAME,
};
use gfx_core::fs::OsFileSystem;

fn cache_in(dir: &Path, size: usize) -> CompilerCache {
    let config = CompilerCacheConfig::new(true, dir.to_str().unwrap(), CacheApi::OpenCl.file_extension(), size);
    CompilerCache::new(config, Arc::new(OsFileSystem))
}

#[test]
fn stored_binary_can_be_loaded_back() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_in(dir.path(), 1024 * 1024);
    let hash = cached_file_name("dg2", b"kernel void k() {}", "-cl-std=CL3.0", "");

    assert!(cache.cache_binary(&hash, b"\x7fELF binary"));
    assert_eq!(cache.load_cached_binary(&hash).unwrap(), b"\x7fELF binary");
    assert!(cache.cache_file_path(&hash).exists());
    assert!(dir.path().join(CONFIG_FILE_NAME).exists());
}

#[test]
fn binary_lands_in_a_shard_named_after_the_hash() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_in(dir.path(), 1024 * 1024);
    let hash = cached_file_name("dg2", b"src", "", "");

    cache.cache_binary(&hash, b"bin");
    let shard = dir.path().join(&hash[..1]);
    assert_eq!(cache.cache_file_path(&hash), shard.join(format!("{hash}.cl_cache")));
    assert!(shard.is_dir());
}

#[test]
fn second_store_reports_already_cached() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_in(dir.path(), 1024 * 1024);

    assert_eq!(cache.try_cache_binary("abcd", b"one").unwrap(), CacheOutcome::Stored);
    assert_eq!(cache.try_cache_binary("abcd", b"two").unwrap(), CacheOutcome::AlreadyCached);
    assert_eq!(cache.load_cached_binary("abcd").unwrap(), b"one");
}

#[test]
fn directory_size_tracks_stored_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_in(dir.path(), 1024 * 1024);
    cache.cache_binary("aa", &[1u8; 100]);
    cache.cache_binary("bb", &[2u8; 50]);
    assert_eq!(cache.directory_size().unwrap(), 150);

    // A fresh instance reads the sidecar left behind.
    let reopened = cache_in(dir.path(), 1024 * 1024);
    assert_eq!(reopened.directory_size().unwrap(), 150);
}

#[test]
fn full_cache_evicts_to_make_room() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_in(dir.path(), 10);

    assert!(cache.cache_binary("a1", b"1111"));
    assert!(cache.cache_binary("b2", b"2222"));
    assert!(cache.cache_binary("c3", b"3333"));

    let files = get_files(&OsFileSystem, dir.path(), 1, ".cl_cache").unwrap();
    assert_eq!(files.len(), 2);
    assert!(cache.load_cached_binary("c3").is_some());
    assert_eq!(cache.directory_size().unwrap(), 8);
}

#[test]
fn oversized_and_empty_binaries_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_in(dir.path(), 4);
    assert_eq!(cache.try_cache_binary("big", b"12345").unwrap(), CacheOutcome::Rejected);
    assert_eq!(cache.try_cache_binary("empty", b"").unwrap(), CacheOutcome::Rejected);
    assert!(get_files(&OsFileSystem, dir.path(), 1, ".cl_cache").unwrap().is_empty());
}

#[test]
fn no_temporary_files_survive_a_store() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_in(dir.path(), 1024);
    cache.cache_binary("ee", b"data");
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("tmp."))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn threads_with_their_own_caches_share_one_directory() {
    let dir = tempfile::tempdir().unwrap();

    std::thread::scope(|s| {
        for t in 0..6usize {
            let root = dir.path();
            s.spawn(move || {
                let cache = cache_in(root, 1024 * 1024);
                for i in 0..5usize {
                    let hash = cached_file_name("dg2", format!("kernel {t} {i}").as_bytes(), "", "");
                    assert!(cache.cache_binary(&hash, &vec![0xa5; 200 + t * 10 + i]));
                }
            });
        }
    });

    let cache = cache_in(dir.path(), 1024 * 1024);
    let files = get_files(&OsFileSystem, dir.path(), 1, CacheApi::OpenCl.file_extension()).unwrap();
    assert_eq!(files.len(), 30);
    let on_disk: u64 = files.iter().map(|f| f.file_size).sum();
    assert_eq!(cache.directory_size().unwrap(), on_disk);
}
