// Copyright 2024-2026 GFX-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Host-pointer fragment registry.
//!
//! A user pointer is split into at most three page-granular fragments. Each
//! fragment is registered once per root device under its page-aligned base and
//! shared, reference counted, by every allocation that covers it. The backing
//! OS handle is freed when the last reference goes away.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use super::backend::{BackendError, BackendHandle};
use super::constants::{align_down, checked_align_up, PAGE_SIZE};
use super::gfx_partition::AddressRange;

pub const MAX_FRAGMENTS_COUNT: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FragmentPosition {
    #[default]
    None,
    Leading,
    Middle,
    Trailing,
}

/// One page-aligned piece of a host pointer range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationFragment {
    pub cpu_ptr: u64,
    pub size: u64,
    pub position: FragmentPosition,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationRequirements {
    pub root_device_index: u32,
    pub fragments: [AllocationFragment; MAX_FRAGMENTS_COUNT],
    pub fragment_count: usize,
    /// Page-aligned span covering the whole user range.
    pub total_allocation_size: u64,
    /// Sum of the fragment sizes.
    pub all_allocations_size: u64,
}

impl AllocationRequirements {
    pub fn fragments(&self) -> &[AllocationFragment] {
        &self.fragments[..self.fragment_count]
    }

    pub fn aligned_start(&self) -> u64 {
        self.fragments().first().map(|f| f.cpu_ptr).unwrap_or(0)
    }

    fn push(&mut self, cpu_ptr: u64, size: u64, position: FragmentPosition) {
        self.fragments[self.fragment_count] = AllocationFragment { cpu_ptr, size, position };
        self.fragment_count += 1;
        self.all_allocations_size += size;
    }
}

/// A registered fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentStorage {
    pub fragment_cpu_pointer: u64,
    pub fragment_size: u64,
    pub ref_count: u32,
    pub os_handle: Option<BackendHandle>,
    /// The driver owns the memory behind this fragment.
    pub driver_allocation: bool,
    /// GPU range the handle stays mapped at after its driver allocation was
    /// freed. Returned to the heap when the fragment is erased.
    pub reserved_address_range: Option<AddressRange>,
}

impl FragmentStorage {
    pub fn new(fragment_cpu_pointer: u64, fragment_size: u64, os_handle: Option<BackendHandle>) -> Self {
        Self {
            fragment_cpu_pointer,
            fragment_size,
            ref_count: 0,
            os_handle,
            driver_allocation: false,
            reserved_address_range: None,
        }
    }

    fn end(&self) -> u64 {
        self.fragment_cpu_pointer.saturating_add(self.fragment_size)
    }
}

/// Per-allocation view of one fragment slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FragmentStorageData {
    pub cpu_ptr: u64,
    pub fragment_size: u64,
    pub os_handle: Option<BackendHandle>,
    pub free_the_fragment: bool,
}

/// The fragments an allocation holds references to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsHandleStorage {
    pub fragment_storage_data: [FragmentStorageData; MAX_FRAGMENTS_COUNT],
    pub fragment_count: usize,
}

impl OsHandleStorage {
    pub fn slots(&self) -> &[FragmentStorageData] {
        &self.fragment_storage_data[..self.fragment_count]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapStatus {
    NotOverlapping,
    WithinStored,
    ExactSize,
    OverlappingAndBigger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequirementsStatus {
    Success,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareStorageError {
    /// A requested fragment overlaps a smaller registered one.
    Overlap,
    /// Handle creation failed; `created` holds the handles made before the
    /// failure, which the caller must free.
    Backend { error: BackendError, created: Vec<BackendHandle> },
}

type FragmentTable = BTreeMap<(u32, u64), FragmentStorage>;

/// Registry of host-pointer fragments, keyed by root device and base address.
#[derive(Default)]
pub struct HostPtrManager {
    fragments: Mutex<FragmentTable>,
}

impl HostPtrManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split `[ptr, ptr + size)` into leading, middle and trailing fragments.
    ///
    /// Returns `None` when the page-aligned range does not fit in the
    /// address space.
    pub fn get_allocation_requirements(
        root_device_index: u32,
        ptr: u64,
        size: u64,
    ) -> Option<AllocationRequirements> {
        let mut requirements = AllocationRequirements { root_device_index, ..Default::default() };
        let end = ptr.checked_add(size)?;
        let aligned_start = align_down(ptr, PAGE_SIZE);
        let aligned_end = checked_align_up(end, PAGE_SIZE)?;
        let total = aligned_end - aligned_start;
        requirements.total_allocation_size = total;

        let leading = ptr != aligned_start;
        if leading {
            requirements.push(aligned_start, PAGE_SIZE, FragmentPosition::Leading);
        }

        let mut remaining = if total == PAGE_SIZE {
            0
        } else if leading {
            total - PAGE_SIZE
        } else {
            total
        };

        let mut trailing = None;
        if end != aligned_end && remaining > 0 {
            trailing = Some(align_down(end, PAGE_SIZE));
            remaining -= PAGE_SIZE;
        }

        if remaining > 0 {
            let middle_start = if leading { aligned_start + PAGE_SIZE } else { aligned_start };
            requirements.push(middle_start, remaining, FragmentPosition::Middle);
        }

        if let Some(trailing_start) = trailing {
            requirements.push(trailing_start, PAGE_SIZE, FragmentPosition::Trailing);
        }

        Some(requirements)
    }

    /// Exact lookup by fragment base.
    pub fn get_fragment(&self, root_device_index: u32, cpu_ptr: u64) -> Option<FragmentStorage> {
        self.fragments.lock().get(&(root_device_index, cpu_ptr)).cloned()
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.lock().len()
    }

    /// Register `fragment`, or take another reference if its base is known.
    pub fn store_fragment(&self, root_device_index: u32, fragment: FragmentStorage) {
        Self::store_locked(&mut self.fragments.lock(), root_device_index, fragment);
    }

    /// Drop one reference. Returns `true` when the fragment was erased and its
    /// OS handle should be freed.
    pub fn release_host_ptr(&self, root_device_index: u32, ptr: u64) -> bool {
        Self::release_locked(&mut self.fragments.lock(), root_device_index, ptr).is_some()
    }

    /// Drop the reference a driver allocation holds on its own fragment.
    ///
    /// When host pointer imports still reference the fragment it takes over
    /// `range`, where its handle stays mapped, and `false` is returned. An
    /// erased or unknown fragment returns `true`; the caller then releases
    /// the handle, memory and range itself.
    pub fn release_driver_fragment(&self, root_device_index: u32, ptr: u64, range: Option<AddressRange>) -> bool {
        let mut table = self.fragments.lock();
        let key = (root_device_index, ptr);
        let Some(fragment) = table.get_mut(&key) else {
            return true;
        };
        fragment.ref_count = fragment.ref_count.saturating_sub(1);
        if fragment.ref_count == 0 {
            table.remove(&key);
            return true;
        }
        fragment.reserved_address_range = range;
        false
    }

    pub fn get_fragment_and_check_for_overlaps(
        &self,
        root_device_index: u32,
        ptr: u64,
        size: u64,
    ) -> (Option<FragmentStorage>, OverlapStatus) {
        Self::check_overlaps_locked(&self.fragments.lock(), root_device_index, ptr, size)
    }

    /// Take references on the registered fragments `requirements` can reuse.
    /// Slots without a registered fragment are left without an OS handle.
    pub fn populate_already_allocated_fragments(
        &self,
        requirements: &AllocationRequirements,
    ) -> Result<OsHandleStorage, RequirementsStatus> {
        Self::populate_locked(&mut self.fragments.lock(), requirements)
    }

    /// Populate, create handles for the new fragments with `create`, then
    /// register them. The table stays locked throughout.
    pub fn prepare_os_storage_for_allocation<F>(
        &self,
        requirements: &AllocationRequirements,
        mut create: F,
    ) -> Result<OsHandleStorage, PrepareStorageError>
    where
        F: FnMut(&AllocationFragment) -> Result<BackendHandle, BackendError>,
    {
        let root = requirements.root_device_index;
        let mut table = self.fragments.lock();
        let mut storage =
            Self::populate_locked(&mut table, requirements).map_err(|_| PrepareStorageError::Overlap)?;

        let mut created = Vec::new();
        for index in 0..storage.fragment_count {
            if storage.fragment_storage_data[index].os_handle.is_some() {
                continue;
            }
            match create(&requirements.fragments[index]) {
                Ok(handle) => {
                    storage.fragment_storage_data[index].os_handle = Some(handle);
                    created.push(index);
                }
                Err(error) => {
                    for (slot_index, slot) in storage.slots().iter().enumerate() {
                        if slot.os_handle.is_some() && !created.contains(&slot_index) {
                            Self::release_locked(&mut table, root, slot.cpu_ptr);
                        }
                    }
                    let created = created
                        .iter()
                        .filter_map(|&i| storage.fragment_storage_data[i].os_handle.take())
                        .collect();
                    return Err(PrepareStorageError::Backend { error, created });
                }
            }
        }

        for &index in &created {
            let slot = &storage.fragment_storage_data[index];
            let fragment = FragmentStorage::new(slot.cpu_ptr, slot.fragment_size, slot.os_handle.clone());
            Self::store_locked(&mut table, root, fragment);
        }
        Ok(storage)
    }

    /// Release every slot of `storage`. Slots whose fragment was erased get
    /// `free_the_fragment`; the erased fragments are returned.
    pub fn release_handle_storage(
        &self,
        root_device_index: u32,
        storage: &mut OsHandleStorage,
    ) -> Vec<FragmentStorage> {
        let mut table = self.fragments.lock();
        let mut erased = Vec::new();
        for slot in storage.fragment_storage_data.iter_mut().take(storage.fragment_count) {
            if let Some(fragment) = Self::release_locked(&mut table, root_device_index, slot.cpu_ptr) {
                slot.free_the_fragment = true;
                erased.push(fragment);
            }
        }
        erased
    }

    fn store_locked(table: &mut FragmentTable, root: u32, mut fragment: FragmentStorage) {
        match table.get_mut(&(root, fragment.fragment_cpu_pointer)) {
            Some(existing) => existing.ref_count += 1,
            None => {
                fragment.ref_count = 1;
                table.insert((root, fragment.fragment_cpu_pointer), fragment);
            }
        }
    }

    fn release_locked(table: &mut FragmentTable, root: u32, ptr: u64) -> Option<FragmentStorage> {
        let fragment = table.get_mut(&(root, ptr))?;
        fragment.ref_count = fragment.ref_count.saturating_sub(1);
        if fragment.ref_count == 0 {
            table.remove(&(root, ptr))
        } else {
            None
        }
    }

    fn check_overlaps_locked(
        table: &FragmentTable,
        root: u32,
        ptr: u64,
        size: u64,
    ) -> (Option<FragmentStorage>, OverlapStatus) {
        if let Some(fragment) = table.get(&(root, ptr)) {
            let status = if size == fragment.fragment_size {
                OverlapStatus::ExactSize
            } else if size < fragment.fragment_size {
                OverlapStatus::WithinStored
            } else {
                OverlapStatus::OverlappingAndBigger
            };
            return (Some(fragment.clone()), status);
        }

        let end = ptr.saturating_add(size);
        if let Some((_, before)) = table.range((root, 0)..(root, ptr)).next_back() {
            if ptr < before.end() {
                let status = if end <= before.end() {
                    OverlapStatus::WithinStored
                } else {
                    OverlapStatus::OverlappingAndBigger
                };
                return (Some(before.clone()), status);
            }
        }
        if let Some((_, inside)) = table.range((root, ptr)..(root, end)).next() {
            return (Some(inside.clone()), OverlapStatus::OverlappingAndBigger);
        }
        (None, OverlapStatus::NotOverlapping)
    }

    fn populate_locked(
        table: &mut FragmentTable,
        requirements: &AllocationRequirements,
    ) -> Result<OsHandleStorage, RequirementsStatus> {
        let root = requirements.root_device_index;
        let mut storage = OsHandleStorage { fragment_count: requirements.fragment_count, ..Default::default() };

        let mut reused = Vec::new();
        for (index, fragment) in requirements.fragments().iter().enumerate() {
            let slot = &mut storage.fragment_storage_data[index];
            slot.cpu_ptr = fragment.cpu_ptr;
            slot.fragment_size = fragment.size;
            match Self::check_overlaps_locked(table, root, fragment.cpu_ptr, fragment.size) {
                (_, OverlapStatus::OverlappingAndBigger) => return Err(RequirementsStatus::Fatal),
                (Some(stored), OverlapStatus::WithinStored | OverlapStatus::ExactSize) => {
                    slot.cpu_ptr = stored.fragment_cpu_pointer;
                    slot.fragment_size = stored.fragment_size;
                    slot.os_handle = stored.os_handle.clone();
                    reused.push(stored.fragment_cpu_pointer);
                }
                _ => {}
            }
        }

        for base in reused {
            if let Some(stored) = table.get_mut(&(root, base)) {
                stored.ref_count += 1;
            }
        }
        Ok(storage)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;
    use crate::memory::gfx_partition::HeapIndex;

    const P: u64 = PAGE_SIZE;

    fn handle(id: u64) -> BackendHandle {
        BackendHandle { id, size: P, bank: None, compressed: false }
    }

    fn stored(manager: &HostPtrManager, root: u32, ptr: u64, size: u64) {
        manager.store_fragment(root, FragmentStorage::new(ptr, size, Some(handle(ptr))));
    }

    fn layout(requirements: &AllocationRequirements) -> Vec<(u64, u64, FragmentPosition)> {
        requirements.fragments().iter().map(|f| (f.cpu_ptr, f.size, f.position)).collect()
    }

    #[test]
    fn aligned_pointer_needs_only_a_middle_fragment() {
        let requirements = HostPtrManager::get_allocation_requirements(0, 0x1000, 10 * P).unwrap();
        assert_eq!(layout(&requirements), vec![(0x1000, 10 * P, FragmentPosition::Middle)]);
        assert_eq!(requirements.total_allocation_size, 10 * P);
    }

    #[test]
    fn aligned_pointer_with_unaligned_size_adds_trailing() {
        let requirements = HostPtrManager::get_allocation_requirements(0, 0x1000, 10 * P - 1).unwrap();
        assert_eq!(
            layout(&requirements),
            vec![
                (0x1000, 9 * P, FragmentPosition::Middle),
                (0x1000 + 9 * P, P, FragmentPosition::Trailing),
            ]
        );
        assert_eq!(requirements.total_allocation_size, 10 * P);
    }

    #[test]
    fn unaligned_pointer_needs_all_three() {
        let requirements = HostPtrManager::get_allocation_requirements(0, 0x1045, 10 * P - 1).unwrap();
        assert_eq!(
            layout(&requirements),
            vec![
                (0x1000, P, FragmentPosition::Leading),
                (0x2000, 9 * P, FragmentPosition::Middle),
                (0x2000 + 9 * P, P, FragmentPosition::Trailing),
            ]
        );
        assert_eq!(requirements.total_allocation_size, 11 * P);
        assert_eq!(requirements.all_allocations_size, 11 * P);
    }

    #[test]
    fn small_range_inside_one_page_is_leading_only() {
        let requirements = HostPtrManager::get_allocation_requirements(0, 0x1045, 200).unwrap();
        assert_eq!(layout(&requirements), vec![(0x1000, P, FragmentPosition::Leading)]);
        assert_eq!(requirements.total_allocation_size, P);
    }

    #[test]
    fn one_page_straddling_two_pages_is_leading_and_trailing() {
        let requirements = HostPtrManager::get_allocation_requirements(0, 0x1045, P).unwrap();
        assert_eq!(
            layout(&requirements),
            vec![(0x1000, P, FragmentPosition::Leading), (0x2000, P, FragmentPosition::Trailing)]
        );
        assert_eq!(requirements.total_allocation_size, 2 * P);
    }

    #[test]
    fn range_ending_on_page_boundary_has_no_trailing() {
        let requirements = HostPtrManager::get_allocation_requirements(0, 0x1001, 10 * P - 1).unwrap();
        assert_eq!(
            layout(&requirements),
            vec![(0x1000, P, FragmentPosition::Leading), (0x2000, 9 * P, FragmentPosition::Middle)]
        );
        assert_eq!(requirements.total_allocation_size, 10 * P);
    }

    #[test]
    fn range_past_the_address_space_has_no_requirements() {
        assert!(HostPtrManager::get_allocation_requirements(0, u64::MAX - 0xfff, 0x2000).is_none());
        assert!(HostPtrManager::get_allocation_requirements(0, u64::MAX - 0x100, 0x10).is_none());
        let high = HostPtrManager::get_allocation_requirements(0, u64::MAX - 0x1fff, 0x1000).unwrap();
        assert_eq!(layout(&high), vec![(u64::MAX - 0x1fff, P, FragmentPosition::Middle)]);
    }

    #[test]
    fn fragments_are_reference_counted() {
        let manager = HostPtrManager::new();
        stored(&manager, 0, 0x1000, P);
        stored(&manager, 0, 0x1000, P);
        assert_eq!(manager.get_fragment(0, 0x1000).unwrap().ref_count, 2);

        assert!(!manager.release_host_ptr(0, 0x1000));
        assert_eq!(manager.get_fragment(0, 0x1000).unwrap().ref_count, 1);
        assert!(manager.release_host_ptr(0, 0x1000));
        assert!(manager.get_fragment(0, 0x1000).is_none());
        assert!(!manager.release_host_ptr(0, 0x1000));
    }

    #[test]
    fn root_devices_keep_separate_tables() {
        let manager = HostPtrManager::new();
        stored(&manager, 0, 0x1000, P);
        stored(&manager, 1, 0x1000, P);
        assert_eq!(manager.fragment_count(), 2);
        assert!(manager.release_host_ptr(1, 0x1000));
        assert_eq!(manager.get_fragment(0, 0x1000).unwrap().ref_count, 1);
    }

    #[test]
    fn get_fragment_requires_exact_base() {
        let manager = HostPtrManager::new();
        stored(&manager, 0, 0x1000, 4 * P);
        assert!(manager.get_fragment(0, 0x2000).is_none());
    }

    #[test]
    fn overlap_classification() {
        let manager = HostPtrManager::new();
        stored(&manager, 0, 0x10000, 4 * P);

        let check = |ptr, size| manager.get_fragment_and_check_for_overlaps(0, ptr, size).1;
        assert_eq!(check(0x10000, 4 * P), OverlapStatus::ExactSize);
        assert_eq!(check(0x10000, P), OverlapStatus::WithinStored);
        assert_eq!(check(0x10000, 5 * P), OverlapStatus::OverlappingAndBigger);
        assert_eq!(check(0x11000, 2 * P), OverlapStatus::WithinStored);
        assert_eq!(check(0x13000, 2 * P), OverlapStatus::OverlappingAndBigger);
        assert_eq!(check(0xf000, 2 * P), OverlapStatus::OverlappingAndBigger);
        assert_eq!(check(0x14000, P), OverlapStatus::NotOverlapping);
        assert_eq!(check(0xf000, P), OverlapStatus::NotOverlapping);
    }

    #[test]
    fn populate_reuses_stored_fragments() {
        let manager = HostPtrManager::new();
        stored(&manager, 0, 0x1000, P);
        let requirements = HostPtrManager::get_allocation_requirements(0, 0x1045, P).unwrap();

        let storage = manager.populate_already_allocated_fragments(&requirements).unwrap();
        assert_eq!(storage.fragment_count, 2);
        assert_eq!(storage.slots()[0].os_handle, Some(handle(0x1000)));
        assert!(storage.slots()[1].os_handle.is_none());
        assert_eq!(manager.get_fragment(0, 0x1000).unwrap().ref_count, 2);
    }

    #[test]
    fn populate_takes_stored_base_for_contained_fragments() {
        let manager = HostPtrManager::new();
        stored(&manager, 0, 0x1000, 16 * P);
        let requirements = HostPtrManager::get_allocation_requirements(0, 0x3000, 2 * P).unwrap();

        let storage = manager.populate_already_allocated_fragments(&requirements).unwrap();
        assert_eq!(storage.slots()[0].cpu_ptr, 0x1000);
        assert_eq!(storage.slots()[0].fragment_size, 16 * P);
        assert_eq!(manager.get_fragment(0, 0x1000).unwrap().ref_count, 2);
    }

    #[test]
    fn populate_fails_on_bigger_overlap_without_side_effects() {
        let manager = HostPtrManager::new();
        stored(&manager, 0, 0x1000, P);
        stored(&manager, 0, 0x3000, P);
        // Leading page reuses 0x1000, the middle overlaps 0x3000 and is bigger.
        let requirements = HostPtrManager::get_allocation_requirements(0, 0x1045, 4 * P).unwrap();

        assert_eq!(
            manager.populate_already_allocated_fragments(&requirements),
            Err(RequirementsStatus::Fatal)
        );
        assert_eq!(manager.get_fragment(0, 0x1000).unwrap().ref_count, 1);
    }

    #[test]
    fn prepare_registers_new_fragments() {
        let manager = HostPtrManager::new();
        let requirements = HostPtrManager::get_allocation_requirements(0, 0x1045, 10 * P - 1).unwrap();
        let mut next = 100;
        let storage = manager
            .prepare_os_storage_for_allocation(&requirements, |_| {
                next += 1;
                Ok(handle(next))
            })
            .unwrap();

        assert_eq!(storage.fragment_count, 3);
        assert_eq!(manager.fragment_count(), 3);
        for slot in storage.slots() {
            assert_eq!(manager.get_fragment(0, slot.cpu_ptr).unwrap().ref_count, 1);
        }
    }

    #[test]
    fn prepare_aborts_without_registering_on_invalid_pointer() {
        let manager = HostPtrManager::new();
        stored(&manager, 0, 0x1000, P);
        let requirements = HostPtrManager::get_allocation_requirements(0, 0x1045, 10 * P - 1).unwrap();
        let mut calls = 0;
        let result = manager.prepare_os_storage_for_allocation(&requirements, |fragment| {
            calls += 1;
            if fragment.position == FragmentPosition::Trailing {
                Err(BackendError::InvalidHostPointer(fragment.cpu_ptr))
            } else {
                Ok(handle(fragment.cpu_ptr))
            }
        });

        match result {
            Err(PrepareStorageError::Backend { error, created }) => {
                assert!(matches!(error, BackendError::InvalidHostPointer(_)));
                assert_eq!(created, vec![handle(0x2000)]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(calls, 2);
        assert_eq!(manager.fragment_count(), 1);
        assert_eq!(manager.get_fragment(0, 0x1000).unwrap().ref_count, 1);
    }

    #[test]
    fn driver_fragment_hands_its_range_to_remaining_users() {
        let manager = HostPtrManager::new();
        let range = AddressRange { heap: HeapIndex::Standard, address: 0x4000_0000, size: 4 * P };
        let mut driver = FragmentStorage::new(0x1000, 4 * P, Some(handle(7)));
        driver.driver_allocation = true;
        manager.store_fragment(0, driver);
        stored(&manager, 0, 0x1000, 4 * P);

        assert!(!manager.release_driver_fragment(0, 0x1000, Some(range)));
        assert_eq!(manager.get_fragment(0, 0x1000).unwrap().reserved_address_range, Some(range));

        let mut storage = OsHandleStorage { fragment_count: 1, ..Default::default() };
        storage.fragment_storage_data[0].cpu_ptr = 0x1000;
        let erased = manager.release_handle_storage(0, &mut storage);
        assert_eq!(erased.len(), 1);
        assert_eq!(erased[0].reserved_address_range, Some(range));
        assert!(erased[0].driver_allocation);
    }

    #[test]
    fn unshared_driver_fragment_is_erased_without_taking_the_range() {
        let manager = HostPtrManager::new();
        stored(&manager, 0, 0x1000, P);
        assert!(manager.release_driver_fragment(0, 0x1000, None));
        assert_eq!(manager.fragment_count(), 0);
        assert!(manager.release_driver_fragment(0, 0x1000, None));
    }

    #[test]
    fn concurrent_store_and_release_leave_the_table_empty() {
        let manager = HostPtrManager::new();
        let erased = AtomicUsize::new(0);
        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..500 {
                        stored(&manager, 0, 0x1000, P);
                        if manager.release_host_ptr(0, 0x1000) {
                            erased.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });

        assert_eq!(manager.fragment_count(), 0);
        assert!(erased.load(Ordering::Relaxed) >= 1);
        assert!(!manager.release_host_ptr(0, 0x1000));
    }

    #[test]
    fn concurrent_prepare_creates_each_fragment_once() {
        const THREADS: usize = 8;
        let manager = &HostPtrManager::new();
        let created = &AtomicUsize::new(0);
        let requirements = &HostPtrManager::get_allocation_requirements(0, 0x8000, 2 * P).unwrap();

        let storages: Vec<OsHandleStorage> = thread::scope(|scope| {
            let workers: Vec<_> = (0..THREADS)
                .map(|_| {
                    scope.spawn(move || {
                        manager
                            .prepare_os_storage_for_allocation(requirements, |f| {
                                created.fetch_add(1, Ordering::Relaxed);
                                Ok(handle(f.cpu_ptr))
                            })
                            .unwrap()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(created.load(Ordering::Relaxed), 1);
        assert_eq!(manager.get_fragment(0, 0x8000).unwrap().ref_count, THREADS as u32);

        let erased: usize = thread::scope(|scope| {
            let workers: Vec<_> = storages
                .into_iter()
                .map(|mut storage| scope.spawn(move || manager.release_handle_storage(0, &mut storage).len()))
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).sum()
        });
        assert_eq!(erased, 1);
        assert_eq!(manager.fragment_count(), 0);
    }

    #[test]
    fn release_handle_storage_marks_erased_fragments() {
        let manager = HostPtrManager::new();
        stored(&manager, 0, 0x1000, P);
        let requirements = HostPtrManager::get_allocation_requirements(0, 0x1045, P).unwrap();
        let mut storage = manager
            .prepare_os_storage_for_allocation(&requirements, |f| Ok(handle(f.cpu_ptr)))
            .unwrap();

        let erased = manager.release_handle_storage(0, &mut storage);
        assert_eq!(erased.len(), 1);
        assert_eq!(erased[0].fragment_cpu_pointer, 0x2000);
        assert!(!storage.slots()[0].free_the_fragment);
        assert!(storage.slots()[1].free_the_fragment);
        assert_eq!(manager.get_fragment(0, 0x1000).unwrap().ref_count, 1);
    }
}
