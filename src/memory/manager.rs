// Copyright 2024-2026 GFX-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Pool selection: decides where each allocation lives and builds it through
//! the [`MemoryBackend`].
//!
//! Every request first tries local (device) memory. The device pool hands the
//! request back with [`AllocationStatus::RetryInNonDevicePool`] when it must
//! live in system memory, in which case the system pool picks one of: the
//! internal 32-bit heap, the external 32-bit heap, a host pointer import,
//! 64 KiB pages, or plain page-aligned system memory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use super::allocation::{
    AllocationData, AllocationDataFlags, AllocationProperties, AllocationStatus, AllocationType,
    GraphicsAllocation, MemoryPool,
};
use super::backend::{BackendError, BackendHandle, DeviceMemoryRequest, MemoryBackend};
use super::bank_selector::LocalMemoryUsageBankSelector;
use super::colouring::{plan_handles, plan_huge_chunks, reserved_span, ChunkPlacement};
use super::compression::is_compression_enabled;
use super::constants::{align_down, canonize, checked_align_up, decanonize, PAGE_SIZE, PAGE_SIZE_64K};
use super::gfx_partition::{AddressRange, GfxPartition, HeapIndex};
use super::host_ptr::{FragmentStorage, HostPtrManager, OsHandleStorage, PrepareStorageError};
use super::settings::{HardwareInfo, MemorySettings};
use super::storage_info::{create_storage_info, StorageInfo};
use crate::telemetry::{record_allocation, record_allocation_failure, record_local_memory_usage};

type AllocationResult = (Option<GraphicsAllocation>, AllocationStatus);

fn failed(status: AllocationStatus) -> AllocationResult {
    (None, status)
}

struct RootDevice {
    hw: HardwareInfo,
    partition: GfxPartition,
    internal_banks: LocalMemoryUsageBankSelector,
    external_banks: LocalMemoryUsageBankSelector,
}

impl RootDevice {
    fn bank_selector(&self, allocation_type: AllocationType) -> &LocalMemoryUsageBankSelector {
        if allocation_type.is_internal() {
            &self.internal_banks
        } else {
            &self.external_banks
        }
    }
}

/// Driver-wide graphics memory manager.
pub struct MemoryManager {
    settings: MemorySettings,
    root_devices: Vec<RootDevice>,
    backend: Arc<dyn MemoryBackend>,
    host_ptr_manager: HostPtrManager,
    force_32bit_allocations: AtomicBool,
}

impl MemoryManager {
    /// One root device per entry of `hardware`.
    pub fn new(settings: MemorySettings, hardware: Vec<HardwareInfo>, backend: Arc<dyn MemoryBackend>) -> Self {
        let root_devices = hardware
            .into_iter()
            .map(|hw| RootDevice {
                partition: GfxPartition::default(),
                internal_banks: LocalMemoryUsageBankSelector::new(hw.sub_device_count),
                external_banks: LocalMemoryUsageBankSelector::new(hw.sub_device_count),
                hw,
            })
            .collect();
        Self {
            force_32bit_allocations: AtomicBool::new(settings.force_32bit_addressing),
            settings,
            root_devices,
            backend,
            host_ptr_manager: HostPtrManager::new(),
        }
    }

    pub fn settings(&self) -> &MemorySettings {
        &self.settings
    }

    pub fn root_device_count(&self) -> usize {
        self.root_devices.len()
    }

    pub fn hardware_info(&self, root_device_index: u32) -> Option<&HardwareInfo> {
        self.root_device(root_device_index).map(|root| &root.hw)
    }

    pub fn host_ptr_manager(&self) -> &HostPtrManager {
        &self.host_ptr_manager
    }

    pub fn gfx_partition(&self, root_device_index: u32) -> Option<&GfxPartition> {
        self.root_device(root_device_index).map(|root| &root.partition)
    }

    pub fn set_force_32bit_allocations(&self, enabled: bool) {
        self.force_32bit_allocations.store(enabled, Ordering::Relaxed);
    }

    pub fn is_force_32bit_allocations(&self) -> bool {
        self.force_32bit_allocations.load(Ordering::Relaxed)
    }

    pub fn is_local_memory_supported(&self, root_device_index: u32) -> bool {
        self.root_device(root_device_index)
            .is_some_and(|root| self.settings.enable_local_memory.unwrap_or(root.hw.ftr_local_memory))
    }

    pub fn peek_64kb_pages_enabled(&self) -> bool {
        self.settings.enable_64kb_pages
    }

    /// Selector charged for `allocation_type` on `root_device_index`.
    pub fn bank_selector(
        &self,
        allocation_type: AllocationType,
        root_device_index: u32,
    ) -> Option<&LocalMemoryUsageBankSelector> {
        self.root_device(root_device_index).map(|root| root.bank_selector(allocation_type))
    }

    fn root_device(&self, root_device_index: u32) -> Option<&RootDevice> {
        self.root_devices.get(root_device_index as usize)
    }

    // -- Request derivation ----------------------------------------------------

    pub fn create_storage_info_from_properties(&self, properties: &AllocationProperties) -> StorageInfo {
        let Some(root) = self.root_device(properties.root_device_index) else {
            return StorageInfo::default();
        };
        let least_occupied = root
            .bank_selector(properties.allocation_type)
            .least_occupied_bank(properties.sub_devices_bitfield);
        create_storage_info(properties, &self.settings, &root.hw, least_occupied)
    }

    pub fn get_allocation_data(
        &self,
        properties: &AllocationProperties,
        host_ptr: Option<u64>,
        storage_info: StorageInfo,
    ) -> AllocationData {
        let allocation_type = properties.allocation_type;
        let requested = &properties.flags;
        let forced_to_system = self.settings.force_system_memory_placement & allocation_type.placement_bit() != 0;

        let flags = AllocationDataFlags {
            allocate_memory: requested.allocate_memory || allocation_type.always_allocates_memory(),
            allow_32bit: allocation_type.allows_32bit(),
            allow_64kb_pages: allocation_type.allows_64kb_pages(),
            use_system_memory: allocation_type.requires_system_memory()
                || requested.force_system_memory
                || forced_to_system,
            flush_l3: requested.flush_l3_required && !requested.uncacheable,
            shareable: requested.shareable,
            prefer_compressed: requested.prefer_compressed,
            uncacheable: requested.uncacheable,
            multi_os_context_capable: requested.multi_os_context_capable,
            read_only_multi_storage: storage_info.read_only_multi_storage,
            resource_48bit: requested.resource_48bit || allocation_type.is_48bit_resource(),
            require_cpu_access: allocation_type.is_cpu_access_required(),
            zero_memory: allocation_type.requires_zeroed_memory(),
            is_usm_host_allocation: requested.is_usm_host_allocation,
        };

        AllocationData {
            allocation_type,
            size: properties.size,
            alignment: properties.alignment,
            root_device_index: properties.root_device_index,
            host_ptr: if flags.allocate_memory { None } else { host_ptr },
            storage_info,
            flags,
        }
    }

    // -- Entry points ----------------------------------------------------------

    pub fn allocate_graphics_memory_with_properties(
        &self,
        properties: &AllocationProperties,
    ) -> Option<GraphicsAllocation> {
        self.allocate_graphics_memory_in_preferred_pool(properties, None).0
    }

    /// Try local memory first, then fall back to system memory when the
    /// device pool asks for it.
    pub fn allocate_graphics_memory_in_preferred_pool(
        &self,
        properties: &AllocationProperties,
        host_ptr: Option<u64>,
    ) -> AllocationResult {
        let storage_info = self.create_storage_info_from_properties(properties);
        let data = self.get_allocation_data(properties, host_ptr, storage_info);

        let (mut allocation, mut status) = self.allocate_graphics_memory_in_device_pool(&data);
        if status == AllocationStatus::RetryInNonDevicePool {
            debug!(allocation_type = ?data.allocation_type, size = data.size, "Allocating in system memory");
            (allocation, status) = self.allocate_graphics_memory(&data);
        }

        match &allocation {
            Some(allocation) => record_allocation(allocation.memory_pool.label()),
            None => {
                debug!(
                    allocation_type = ?data.allocation_type,
                    size = data.size,
                    status = status.label(),
                    "Allocation failed"
                );
                record_allocation_failure(status.label());
            }
        }
        (allocation, status)
    }

    /// Allocate in local memory, or report why the request belongs elsewhere.
    pub fn allocate_graphics_memory_in_device_pool(&self, data: &AllocationData) -> AllocationResult {
        let Some(root) = self.root_device(data.root_device_index) else {
            return failed(AllocationStatus::Error);
        };
        if !self.is_local_memory_supported(data.root_device_index)
            || data.flags.use_system_memory
            || data.host_ptr.is_some()
        {
            return failed(AllocationStatus::RetryInNonDevicePool);
        }
        if self.is_force_32bit_allocations() && data.flags.allow_32bit {
            return failed(AllocationStatus::RetryInNonDevicePool);
        }

        let allocation_type = data.allocation_type;
        let storage = data.storage_info;
        let heap = if allocation_type.uses_internal_32bit_heap() {
            HeapIndex::Internal
        } else {
            HeapIndex::Standard64Kb
        };
        let Some(size) = checked_align_up(data.size.max(1), PAGE_SIZE_64K)
            .filter(|&size| size <= root.partition.heap_size(heap))
        else {
            debug!(size = data.size, ?heap, "Allocation larger than its heap");
            return failed(AllocationStatus::Error);
        };
        let alignment = data.alignment.max(PAGE_SIZE_64K);
        let compressed = data.flags.prefer_compressed
            && is_compression_enabled(self.settings.render_compressed_buffers, &root.hw, size);

        let placements = if size > self.settings.huge_chunk_size && !storage.multi_storage && !storage.tile_instanced {
            plan_huge_chunks(storage.banks()[0], size, self.settings.huge_chunk_size)
        } else {
            plan_handles(&storage, size)
        };
        let span = reserved_span(&placements);

        // SVM allocations share their virtual address with a CPU reservation.
        let svm_address = if allocation_type == AllocationType::SvmGpu {
            match self.backend.allocate_system_memory(span, alignment) {
                Ok(address) => Some(address),
                Err(error) => {
                    debug!(%error, "SVM address reservation failed");
                    return failed(AllocationStatus::Error);
                }
            }
        } else {
            None
        };

        let reservation = match svm_address {
            Some(_) => None,
            None => match root.partition.heap_allocate(heap, span, alignment) {
                Some(range) => Some(range),
                None => {
                    debug!(?heap, span, "GPU VA reservation failed");
                    return failed(AllocationStatus::Error);
                }
            },
        };
        let base = svm_address.or(reservation.map(|range| range.address)).unwrap_or(0);

        let mut handles: Vec<BackendHandle> = Vec::with_capacity(placements.len());
        for placement in &placements {
            let request = DeviceMemoryRequest {
                root_device_index: data.root_device_index,
                size: placement.size(),
                alignment,
                bank: placement.bank,
                compressed,
            };
            let handle = match self.backend.allocate_in_device_pool(&request) {
                Ok(handle) => handle,
                Err(error) => {
                    debug!(%error, bank = placement.bank, size = request.size, "Local memory allocation failed");
                    self.abort_device_allocation(root, &handles, reservation, svm_address);
                    return failed(AllocationStatus::Error);
                }
            };
            let mapped = self.map_chunks(&handle, base, &placement.chunks);
            handles.push(handle);
            if let Err(error) = mapped {
                debug!(%error, "Local memory mapping failed");
                self.abort_device_allocation(root, &handles, reservation, svm_address);
                return failed(AllocationStatus::Error);
            }
        }

        let selector = root.bank_selector(allocation_type);
        for handle in &handles {
            if let Some(bank) = handle.bank {
                selector.reserve_on_banks(1 << bank, handle.size);
                record_local_memory_usage(data.root_device_index, bank, selector.occupied_memory_size_for_bank(bank));
            }
        }

        let mut allocation =
            GraphicsAllocation::new(data.root_device_index, allocation_type, size, MemoryPool::LocalMemory);
        allocation.gpu_address = canonize(base);
        if heap == HeapIndex::Internal {
            allocation.gpu_base_address = canonize(root.partition.heap_base(heap));
        }
        allocation.underlying_buffer = svm_address;
        allocation.owned_system_memory = svm_address;
        allocation.storage_info = storage;
        allocation.handles = handles;
        allocation.reserved_address_range = reservation;
        allocation.compressed = compressed;
        allocation.flush_l3_required = data.flags.flush_l3;
        allocation.internal_bank_usage = allocation_type.is_internal();
        (Some(allocation), AllocationStatus::Success)
    }

    /// System memory dispatch.
    pub fn allocate_graphics_memory(&self, data: &AllocationData) -> AllocationResult {
        let Some(root) = self.root_device(data.root_device_index) else {
            return failed(AllocationStatus::Error);
        };
        if data.allocation_type.uses_internal_32bit_heap() {
            return self.allocate_32bit_graphics_memory(root, data, HeapIndex::Internal);
        }
        if self.is_force_32bit_allocations() && data.flags.allow_32bit {
            return self.allocate_32bit_graphics_memory(root, data, HeapIndex::External);
        }
        if data.host_ptr.is_some() {
            return self.allocate_graphics_memory_with_host_ptr(root, data);
        }
        if self.peek_64kb_pages_enabled() && data.flags.allow_64kb_pages {
            return self.allocate_graphics_memory_64kb(root, data);
        }
        self.allocate_graphics_memory_with_alignment(root, data)
    }

    // -- System pool -----------------------------------------------------------

    fn allocate_graphics_memory_with_alignment(&self, root: &RootDevice, data: &AllocationData) -> AllocationResult {
        let Some(size) = checked_align_up(data.size.max(1), PAGE_SIZE) else {
            return failed(AllocationStatus::Error);
        };
        let alignment = data.alignment.max(PAGE_SIZE);
        let Some((cpu_address, handle, range)) =
            self.create_system_backed(root, data.root_device_index, size, alignment, HeapIndex::Standard)
        else {
            return failed(AllocationStatus::Error);
        };

        let mut fragment = FragmentStorage::new(cpu_address, size, Some(handle.clone()));
        fragment.driver_allocation = true;
        self.host_ptr_manager.store_fragment(data.root_device_index, fragment);

        let mut allocation =
            GraphicsAllocation::new(data.root_device_index, data.allocation_type, size, MemoryPool::System4KBPages);
        allocation.gpu_address = canonize(range.address);
        allocation.underlying_buffer = Some(cpu_address);
        allocation.owned_system_memory = Some(cpu_address);
        allocation.driver_allocated_cpu_pointer = Some(cpu_address);
        allocation.handles = vec![handle];
        allocation.reserved_address_range = Some(range);
        allocation.storage_info = data.storage_info;
        allocation.flush_l3_required = data.flags.flush_l3;
        (Some(allocation), AllocationStatus::Success)
    }

    fn allocate_graphics_memory_64kb(&self, root: &RootDevice, data: &AllocationData) -> AllocationResult {
        let (Some(size), Some(alignment)) = (
            checked_align_up(data.size.max(1), PAGE_SIZE_64K),
            checked_align_up(data.alignment.max(PAGE_SIZE_64K), PAGE_SIZE_64K),
        ) else {
            return failed(AllocationStatus::Error);
        };
        let Some((cpu_address, handle, range)) =
            self.create_system_backed(root, data.root_device_index, size, alignment, HeapIndex::Standard64Kb)
        else {
            return failed(AllocationStatus::Error);
        };

        let mut allocation =
            GraphicsAllocation::new(data.root_device_index, data.allocation_type, size, MemoryPool::System64KBPages);
        allocation.gpu_address = canonize(range.address);
        allocation.underlying_buffer = Some(cpu_address);
        allocation.owned_system_memory = Some(cpu_address);
        allocation.handles = vec![handle];
        allocation.reserved_address_range = Some(range);
        allocation.storage_info = data.storage_info;
        allocation.flush_l3_required = data.flags.flush_l3;
        allocation.compressed = data.flags.prefer_compressed
            && is_compression_enabled(self.settings.render_compressed_buffers, &root.hw, size);
        (Some(allocation), AllocationStatus::Success)
    }

    fn allocate_32bit_graphics_memory(
        &self,
        root: &RootDevice,
        data: &AllocationData,
        heap: HeapIndex,
    ) -> AllocationResult {
        let root_device_index = data.root_device_index;
        let (handle, cpu_address, offset, size, owned) = match data.host_ptr {
            Some(ptr) => {
                let aligned_ptr = align_down(ptr, PAGE_SIZE);
                let offset = ptr - aligned_ptr;
                let Some(size) = ptr
                    .checked_add(data.size)
                    .and_then(|end| checked_align_up(end, PAGE_SIZE))
                    .map(|aligned_end| aligned_end - aligned_ptr)
                else {
                    debug!(ptr, size = data.size, "Host pointer range wraps the address space");
                    return failed(AllocationStatus::InvalidHostPointer);
                };
                match self.backend.import_host_ptr(root_device_index, aligned_ptr, size) {
                    Ok(handle) => (handle, ptr, offset, size, None),
                    Err(error) => {
                        debug!(%error, "Host pointer import failed");
                        return failed(status_for(&error));
                    }
                }
            }
            None => {
                let Some(size) = checked_align_up(data.size.max(1), PAGE_SIZE) else {
                    return failed(AllocationStatus::Error);
                };
                let cpu_address = match self.backend.allocate_system_memory(size, data.alignment.max(PAGE_SIZE)) {
                    Ok(address) => address,
                    Err(error) => {
                        debug!(%error, "System memory allocation failed");
                        return failed(AllocationStatus::Error);
                    }
                };
                match self.backend.allocate_with_alignment(root_device_index, cpu_address, size) {
                    Ok(handle) => (handle, cpu_address, 0, size, Some(cpu_address)),
                    Err(error) => {
                        debug!(%error, "Buffer object creation failed");
                        self.free_system_memory(cpu_address);
                        return failed(AllocationStatus::Error);
                    }
                }
            }
        };

        let release = |range: Option<AddressRange>| {
            if let Some(range) = range {
                root.partition.heap_free(&range);
            }
            self.free_handle(&handle);
            if let Some(address) = owned {
                self.free_system_memory(address);
            }
        };

        let Some(range) = root.partition.heap_allocate(heap, size, PAGE_SIZE) else {
            debug!(?heap, size, "32-bit heap exhausted");
            release(None);
            return failed(AllocationStatus::Error);
        };
        let gpu_address = match self.backend.map_gpu_va(&handle, canonize(range.address), 0, size) {
            Ok(mapped) => decanonize(mapped),
            Err(error) => {
                debug!(%error, "32-bit mapping failed");
                release(Some(range));
                return failed(AllocationStatus::Error);
            }
        };
        if !root.partition.is_in_heap(heap, gpu_address, size) {
            warn!(gpu_address, ?heap, "Backend mapped a 32-bit allocation outside its heap");
            release(Some(range));
            return failed(AllocationStatus::Error);
        }

        let mut allocation = GraphicsAllocation::new(
            root_device_index,
            data.allocation_type,
            data.size,
            MemoryPool::System4KBPagesWith32BitGpuAddressing,
        );
        allocation.gpu_base_address = canonize(root.partition.heap_base(heap));
        allocation.gpu_address = canonize(gpu_address + offset);
        allocation.underlying_buffer = Some(cpu_address);
        allocation.allocation_offset = offset;
        allocation.owned_system_memory = owned;
        allocation.handles = vec![handle];
        allocation.reserved_address_range = Some(range);
        allocation.storage_info = data.storage_info;
        allocation.flush_l3_required = data.flags.flush_l3;
        (Some(allocation), AllocationStatus::Success)
    }

    fn allocate_graphics_memory_with_host_ptr(&self, root: &RootDevice, data: &AllocationData) -> AllocationResult {
        let root_device_index = data.root_device_index;
        let Some(ptr) = data.host_ptr else {
            return failed(AllocationStatus::Error);
        };
        let Some(requirements) = HostPtrManager::get_allocation_requirements(root_device_index, ptr, data.size.max(1))
        else {
            debug!(ptr, size = data.size, "Host pointer range wraps the address space");
            return failed(AllocationStatus::InvalidHostPointer);
        };
        let prepared = self.host_ptr_manager.prepare_os_storage_for_allocation(&requirements, |fragment| {
            self.backend.import_host_ptr(root_device_index, fragment.cpu_ptr, fragment.size)
        });
        let mut storage = match prepared {
            Ok(storage) => storage,
            Err(PrepareStorageError::Overlap) => {
                debug!(ptr, size = data.size, "Host pointer overlaps a smaller registered fragment");
                return failed(AllocationStatus::Error);
            }
            Err(PrepareStorageError::Backend { error, created }) => {
                debug!(%error, ptr, "Host pointer import failed");
                for handle in &created {
                    self.free_handle(handle);
                }
                return failed(status_for(&error));
            }
        };

        let aligned_start = requirements.aligned_start();
        let Some(range) = root.partition.heap_allocate(HeapIndex::Standard, requirements.total_allocation_size, PAGE_SIZE)
        else {
            self.release_fragments(root, root_device_index, &mut storage);
            return failed(AllocationStatus::Error);
        };
        for (fragment, slot) in requirements.fragments().iter().zip(storage.slots()) {
            let Some(handle) = &slot.os_handle else { continue };
            let gpu_address = canonize(range.address + (fragment.cpu_ptr - aligned_start));
            // A reused fragment may start below the requested page.
            let handle_offset = fragment.cpu_ptr - slot.cpu_ptr;
            if let Err(error) = self.backend.map_gpu_va(handle, gpu_address, handle_offset, fragment.size) {
                debug!(%error, "Host pointer fragment mapping failed");
                root.partition.heap_free(&range);
                self.release_fragments(root, root_device_index, &mut storage);
                return failed(AllocationStatus::Error);
            }
        }

        let offset = ptr - aligned_start;
        let mut allocation =
            GraphicsAllocation::new(root_device_index, data.allocation_type, data.size, MemoryPool::System4KBPages);
        allocation.gpu_address = canonize(range.address + offset);
        allocation.underlying_buffer = Some(ptr);
        allocation.allocation_offset = offset;
        allocation.fragments_storage = storage;
        allocation.reserved_address_range = Some(range);
        allocation.storage_info = data.storage_info;
        allocation.flush_l3_required = data.flags.flush_l3;
        (Some(allocation), AllocationStatus::Success)
    }

    /// System memory wrapped in a buffer object and mapped into `heap`.
    fn create_system_backed(
        &self,
        root: &RootDevice,
        root_device_index: u32,
        size: u64,
        alignment: u64,
        heap: HeapIndex,
    ) -> Option<(u64, BackendHandle, AddressRange)> {
        let cpu_address = self
            .backend
            .allocate_system_memory(size, alignment)
            .map_err(|error| debug!(%error, size, "System memory allocation failed"))
            .ok()?;
        let handle = match self.backend.allocate_with_alignment(root_device_index, cpu_address, size) {
            Ok(handle) => handle,
            Err(error) => {
                debug!(%error, "Buffer object creation failed");
                self.free_system_memory(cpu_address);
                return None;
            }
        };
        let Some(range) = root.partition.heap_allocate(heap, size, alignment) else {
            debug!(?heap, size, "GPU VA reservation failed");
            self.free_handle(&handle);
            self.free_system_memory(cpu_address);
            return None;
        };
        if let Err(error) = self.backend.map_gpu_va(&handle, canonize(range.address), 0, size) {
            debug!(%error, "System memory mapping failed");
            root.partition.heap_free(&range);
            self.free_handle(&handle);
            self.free_system_memory(cpu_address);
            return None;
        }
        Some((cpu_address, handle, range))
    }

    // -- Release ---------------------------------------------------------------

    /// Release everything `allocation` holds.
    pub fn free_graphics_memory(&self, mut allocation: GraphicsAllocation) {
        let root_device_index = allocation.root_device_index;
        let Some(root) = self.root_device(root_device_index) else {
            warn!(root_device_index, "Freeing allocation of unknown root device");
            return;
        };

        // A driver allocation still referenced by a host pointer import hands
        // its handle, memory and mapped range over to the fragment.
        let handed_over = allocation.driver_allocated_cpu_pointer.is_some_and(|cpu| {
            !self
                .host_ptr_manager
                .release_driver_fragment(root_device_index, cpu, allocation.reserved_address_range)
        });

        if allocation.fragments_storage.fragment_count > 0 {
            self.release_fragments(root, root_device_index, &mut allocation.fragments_storage);
        }

        if allocation.memory_pool == MemoryPool::LocalMemory {
            let selector = if allocation.internal_bank_usage { &root.internal_banks } else { &root.external_banks };
            for handle in &allocation.handles {
                if let Some(bank) = handle.bank {
                    selector.free_on_banks(1 << bank, handle.size);
                    record_local_memory_usage(root_device_index, bank, selector.occupied_memory_size_for_bank(bank));
                }
            }
        }

        if !handed_over {
            for handle in &allocation.handles {
                self.free_handle(handle);
            }
            if let Some(address) = allocation.owned_system_memory {
                self.free_system_memory(address);
            }
            if let Some(range) = allocation.reserved_address_range {
                root.partition.heap_free(&range);
            }
        }
    }

    fn release_fragments(&self, root: &RootDevice, root_device_index: u32, storage: &mut OsHandleStorage) {
        for fragment in self.host_ptr_manager.release_handle_storage(root_device_index, storage) {
            if let Some(handle) = &fragment.os_handle {
                self.free_handle(handle);
            }
            if fragment.driver_allocation {
                self.free_system_memory(fragment.fragment_cpu_pointer);
            }
            if let Some(range) = fragment.reserved_address_range {
                root.partition.heap_free(&range);
            }
        }
    }

    /// Map each chunk at its offset from `base`, backed by consecutive parts
    /// of `handle`.
    fn map_chunks(&self, handle: &BackendHandle, base: u64, chunks: &[ChunkPlacement]) -> Result<(), BackendError> {
        let mut handle_offset = 0;
        for chunk in chunks {
            self.backend
                .map_gpu_va(handle, canonize(base + chunk.offset), handle_offset, chunk.size)?;
            handle_offset += chunk.size;
        }
        Ok(())
    }

    fn abort_device_allocation(
        &self,
        root: &RootDevice,
        handles: &[BackendHandle],
        reservation: Option<AddressRange>,
        svm_address: Option<u64>,
    ) {
        for handle in handles {
            self.free_handle(handle);
        }
        if let Some(range) = reservation {
            root.partition.heap_free(&range);
        }
        if let Some(address) = svm_address {
            self.free_system_memory(address);
        }
    }

    fn free_handle(&self, handle: &BackendHandle) {
        if let Err(error) = self.backend.free_graphics_memory(handle) {
            warn!(%error, handle = handle.id, "Failed to free backend handle");
        }
    }

    fn free_system_memory(&self, address: u64) {
        if let Err(error) = self.backend.free_system_memory(address) {
            warn!(%error, address, "Failed to free system memory");
        }
    }
}

fn status_for(error: &BackendError) -> AllocationStatus {
    match error {
        BackendError::InvalidHostPointer(_) => AllocationStatus::InvalidHostPointer,
        _ => AllocationStatus::Error,
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
