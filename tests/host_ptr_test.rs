//! Host pointer fragment bookkeeping.

use gfx_core::memory::constants::PAGE_SIZE;
use gfx_core::memory::{
    BackendError, BackendHandle, FragmentPosition, HostPtrManager, OverlapStatus, PrepareStorageError,
};

fn handle_for(id: u64, size: u64) -> BackendHandle {
    BackendHandle { id, size, bank: None, compressed: false }
}

#[test]
fn importing_twice_creates_handles_once() {
    let manager = HostPtrManager::new();
    let requirements = HostPtrManager::get_allocation_requirements(0, 0x10_0100, 3 * PAGE_SIZE).unwrap();
    assert_eq!(requirements.fragment_count, 3);

    let mut created = 0;
    let mut first = manager
        .prepare_os_storage_for_allocation(&requirements, |fragment| {
            created += 1;
            Ok(handle_for(created, fragment.size))
        })
        .unwrap();
    let mut second = manager
        .prepare_os_storage_for_allocation(&requirements, |_| panic!("fragments should be reused"))
        .unwrap();
    assert_eq!(created, 3);
    assert_eq!(manager.fragment_count(), 3);

    assert!(manager.release_handle_storage(0, &mut first).is_empty());
    let erased = manager.release_handle_storage(0, &mut second);
    assert_eq!(erased.len(), 3);
    assert!(second.slots().iter().all(|slot| slot.free_the_fragment));
    assert_eq!(manager.fragment_count(), 0);
}

#[test]
fn roots_do_not_share_fragments() {
    let manager = HostPtrManager::new();
    for root in 0..2 {
        let requirements = HostPtrManager::get_allocation_requirements(root, 0x4000, PAGE_SIZE).unwrap();
        manager
            .prepare_os_storage_for_allocation(&requirements, |f| Ok(handle_for(u64::from(root), f.size)))
            .unwrap();
    }
    assert_eq!(manager.fragment_count(), 2);
    assert_eq!(manager.get_fragment(1, 0x4000).unwrap().os_handle.unwrap().id, 1);
}

#[test]
fn larger_request_over_registered_fragment_is_refused() {
    let manager = HostPtrManager::new();
    let small = HostPtrManager::get_allocation_requirements(0, 0x8000, PAGE_SIZE).unwrap();
    manager.prepare_os_storage_for_allocation(&small, |f| Ok(handle_for(1, f.size))).unwrap();

    let (_, status) = manager.get_fragment_and_check_for_overlaps(0, 0x8000, 4 * PAGE_SIZE);
    assert_eq!(status, OverlapStatus::OverlappingAndBigger);

    let big = HostPtrManager::get_allocation_requirements(0, 0x8000, 4 * PAGE_SIZE).unwrap();
    let result = manager.prepare_os_storage_for_allocation(&big, |f| Ok(handle_for(2, f.size)));
    assert!(matches!(result, Err(PrepareStorageError::Overlap)));
    assert_eq!(manager.get_fragment(0, 0x8000).unwrap().ref_count, 1);
}

#[test]
fn backend_failure_returns_created_handles_and_registers_nothing() {
    let manager = HostPtrManager::new();
    let requirements = HostPtrManager::get_allocation_requirements(0, 0x20_0010, 2 * PAGE_SIZE).unwrap();
    assert_eq!(requirements.fragments()[0].position, FragmentPosition::Leading);

    let mut calls = 0;
    let result = manager.prepare_os_storage_for_allocation(&requirements, |f| {
        calls += 1;
        if calls == 2 {
            Err(BackendError::InvalidHostPointer(f.cpu_ptr))
        } else {
            Ok(handle_for(calls, f.size))
        }
    });
    match result {
        Err(PrepareStorageError::Backend { error, created }) => {
            assert!(matches!(error, BackendError::InvalidHostPointer(_)));
            assert_eq!(created.len(), 1);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(manager.fragment_count(), 0);
}
