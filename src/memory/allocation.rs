// Copyright 2024-2026 GFX-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Allocation requests, derived allocation data and the resulting
//! [`GraphicsAllocation`].

use super::backend::BackendHandle;
use super::gfx_partition::AddressRange;
use super::host_ptr::OsHandleStorage;
use super::storage_info::StorageInfo;

/// Bitmask of sub-devices (tiles) of one root device.
pub type DeviceBitfield = u32;

/// What an allocation is used for. The order is stable: the index feeds the
/// `force_system_memory_placement` mask (`1 << (index - 1)`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AllocationType {
    #[default]
    Unknown,
    Buffer,
    BufferHostMemory,
    CommandBuffer,
    ConstantSurface,
    ExternalHostPtr,
    FillPattern,
    GlobalSurface,
    Image,
    IndirectObjectHeap,
    InstructionHeap,
    InternalHeap,
    InternalHostMemory,
    KernelArgsBuffer,
    KernelIsa,
    KernelIsaInternal,
    LinearStream,
    MapAllocation,
    McsSurface,
    Pipe,
    PreemptionSurface,
    PrintfSurface,
    PrivateSurface,
    ProfilingTagBuffer,
    ScratchSurface,
    SharedBuffer,
    SharedImage,
    SharedResourceCopy,
    SurfaceStateHeap,
    SvmCpu,
    SvmGpu,
    SvmZeroCopy,
    TagBuffer,
    GlobalFence,
    TimestampPacketTagBuffer,
    WriteCombined,
    RingBuffer,
    SemaphoreBuffer,
    DebugContextSaveArea,
    DebugSbaTrackingBuffer,
    DebugModuleArea,
    UnifiedSharedMemory,
    WorkPartitionSurface,
    GpuTimestampDeviceBuffer,
    SwTagBuffer,
    DeferredTasksList,
    AssertBuffer,
    SyncDispatchToken,
}

impl AllocationType {
    pub const fn index(self) -> u32 {
        self as u32
    }

    /// Bit for this type in the `force_system_memory_placement` mask.
    pub const fn placement_bit(self) -> u64 {
        match self.index() {
            0 => 0,
            index => 1u64 << (index - 1),
        }
    }

    pub fn is_isa(self) -> bool {
        matches!(self, Self::KernelIsa | Self::KernelIsaInternal | Self::DebugModuleArea)
    }

    /// Types placed in the internal 32-bit heap.
    pub fn uses_internal_32bit_heap(self) -> bool {
        matches!(self, Self::KernelIsa | Self::KernelIsaInternal | Self::InternalHeap)
    }

    /// Types charged to the internal bank selector.
    pub fn is_internal(self) -> bool {
        matches!(
            self,
            Self::KernelIsa
                | Self::KernelIsaInternal
                | Self::InternalHeap
                | Self::SemaphoreBuffer
                | Self::RingBuffer
                | Self::CommandBuffer
        )
    }

    pub fn is_cpu_access_required(self) -> bool {
        matches!(
            self,
            Self::CommandBuffer
                | Self::ConstantSurface
                | Self::GlobalSurface
                | Self::InternalHeap
                | Self::LinearStream
                | Self::Pipe
                | Self::PrintfSurface
                | Self::TimestampPacketTagBuffer
                | Self::RingBuffer
                | Self::SemaphoreBuffer
                | Self::DebugContextSaveArea
                | Self::DebugSbaTrackingBuffer
                | Self::GpuTimestampDeviceBuffer
                | Self::DebugModuleArea
                | Self::AssertBuffer
                | Self::SyncDispatchToken
        )
    }

    pub fn is_lockable(self) -> bool {
        self.is_cpu_access_required()
            || self.is_isa()
            || matches!(self, Self::BufferHostMemory | Self::SharedResourceCopy)
    }

    pub(crate) fn allows_32bit(self) -> bool {
        matches!(
            self,
            Self::Buffer
                | Self::BufferHostMemory
                | Self::ScratchSurface
                | Self::WorkPartitionSurface
                | Self::PrivateSurface
                | Self::PrintfSurface
                | Self::ConstantSurface
                | Self::GlobalSurface
                | Self::WriteCombined
                | Self::AssertBuffer
        )
    }

    pub(crate) fn allows_64kb_pages(self) -> bool {
        self.allows_32bit()
            || matches!(
                self,
                Self::SvmCpu
                    | Self::SvmGpu
                    | Self::SvmZeroCopy
                    | Self::PreemptionSurface
                    | Self::SyncDispatchToken
                    | Self::DeferredTasksList
            )
    }

    pub(crate) fn requires_system_memory(self) -> bool {
        matches!(
            self,
            Self::BufferHostMemory
                | Self::CommandBuffer
                | Self::ExternalHostPtr
                | Self::FillPattern
                | Self::InternalHostMemory
                | Self::MapAllocation
                | Self::McsSurface
                | Self::ProfilingTagBuffer
                | Self::SvmCpu
                | Self::SvmZeroCopy
                | Self::TagBuffer
                | Self::GlobalFence
                | Self::SwTagBuffer
                | Self::DebugContextSaveArea
                | Self::RingBuffer
                | Self::SemaphoreBuffer
        )
    }

    pub(crate) fn requires_zeroed_memory(self) -> bool {
        matches!(self, Self::DebugContextSaveArea | Self::GlobalSurface | Self::ConstantSurface)
    }

    pub(crate) fn is_48bit_resource(self) -> bool {
        matches!(self, Self::PreemptionSurface | Self::DeferredTasksList | Self::SyncDispatchToken)
    }

    pub(crate) fn always_allocates_memory(self) -> bool {
        matches!(self, Self::SvmCpu | Self::SvmZeroCopy)
    }
}

/// Memory pool an allocation ended up in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MemoryPool {
    #[default]
    MemoryNull,
    System4KBPages,
    System64KBPages,
    System4KBPagesWith32BitGpuAddressing,
    System64KBPagesWith32BitGpuAddressing,
    SystemCpuInaccessible,
    LocalMemory,
}

impl MemoryPool {
    pub fn is_system_memory_pool(self) -> bool {
        matches!(
            self,
            Self::System4KBPages
                | Self::System64KBPages
                | Self::System4KBPagesWith32BitGpuAddressing
                | Self::System64KBPagesWith32BitGpuAddressing
        )
    }

    /// Metric label.
    pub fn label(self) -> &'static str {
        match self {
            Self::MemoryNull => "null",
            Self::System4KBPages => "system_4kb",
            Self::System64KBPages => "system_64kb",
            Self::System4KBPagesWith32BitGpuAddressing => "system_4kb_32bit",
            Self::System64KBPagesWith32BitGpuAddressing => "system_64kb_32bit",
            Self::SystemCpuInaccessible => "system_cpu_inaccessible",
            Self::LocalMemory => "local",
        }
    }
}

/// Outcome of one allocation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStatus {
    Success,
    Error,
    RetryInNonDevicePool,
    InvalidHostPointer,
}

impl AllocationStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::RetryInNonDevicePool => "retry_in_non_device_pool",
            Self::InvalidHostPointer => "invalid_host_pointer",
        }
    }
}

/// Caller-controlled switches on an allocation request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationPropertiesFlags {
    pub allocate_memory: bool,
    pub flush_l3_required: bool,
    pub force_system_memory: bool,
    pub multi_os_context_capable: bool,
    pub read_only_multi_storage: bool,
    pub shareable: bool,
    pub uncacheable: bool,
    pub prefer_compressed: bool,
    pub is_usm_host_allocation: bool,
    pub resource_48bit: bool,
}

/// An allocation request as the API layer builds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationProperties {
    pub root_device_index: u32,
    pub size: u64,
    pub alignment: u64,
    pub allocation_type: AllocationType,
    pub sub_devices_bitfield: DeviceBitfield,
    pub multi_storage_resource: bool,
    pub flags: AllocationPropertiesFlags,
}

impl AllocationProperties {
    /// A request that allocates fresh memory.
    pub fn new(
        root_device_index: u32,
        size: u64,
        allocation_type: AllocationType,
        sub_devices_bitfield: DeviceBitfield,
    ) -> Self {
        Self {
            root_device_index,
            size,
            alignment: 0,
            allocation_type,
            sub_devices_bitfield,
            multi_storage_resource: false,
            flags: AllocationPropertiesFlags { allocate_memory: true, ..Default::default() },
        }
    }

    /// A request that wraps memory the caller already owns.
    pub fn for_host_ptr(
        root_device_index: u32,
        size: u64,
        allocation_type: AllocationType,
        sub_devices_bitfield: DeviceBitfield,
    ) -> Self {
        let mut properties = Self::new(root_device_index, size, allocation_type, sub_devices_bitfield);
        properties.flags.allocate_memory = false;
        properties
    }

    pub fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn with_multi_storage(mut self, multi_storage_resource: bool) -> Self {
        self.multi_storage_resource = multi_storage_resource;
        self
    }
}

/// Flags derived by `MemoryManager::get_allocation_data`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationDataFlags {
    pub allocate_memory: bool,
    pub allow_32bit: bool,
    pub allow_64kb_pages: bool,
    pub use_system_memory: bool,
    pub flush_l3: bool,
    pub shareable: bool,
    pub prefer_compressed: bool,
    pub uncacheable: bool,
    pub multi_os_context_capable: bool,
    pub read_only_multi_storage: bool,
    pub resource_48bit: bool,
    pub require_cpu_access: bool,
    pub zero_memory: bool,
    pub is_usm_host_allocation: bool,
}

/// Everything the pool-selection logic needs for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationData {
    pub allocation_type: AllocationType,
    pub size: u64,
    pub alignment: u64,
    pub root_device_index: u32,
    pub host_ptr: Option<u64>,
    pub storage_info: StorageInfo,
    pub flags: AllocationDataFlags,
}

/// A live allocation. Owned by the caller until it is handed back to
/// `MemoryManager::free_graphics_memory`.
#[derive(Debug, Clone)]
pub struct GraphicsAllocation {
    pub root_device_index: u32,
    pub allocation_type: AllocationType,
    /// Canonized GPU virtual address of the first byte.
    pub gpu_address: u64,
    /// Canonized base of the 32-bit heap, 0 otherwise.
    pub gpu_base_address: u64,
    /// CPU address of the first byte, `None` for CPU-inaccessible memory.
    pub underlying_buffer: Option<u64>,
    pub size: u64,
    pub memory_pool: MemoryPool,
    pub storage_info: StorageInfo,
    pub fragments_storage: OsHandleStorage,
    pub handles: Vec<BackendHandle>,
    pub reserved_address_range: Option<AddressRange>,
    pub compressed: bool,
    /// Offset of the user pointer inside its first page.
    pub allocation_offset: u64,
    pub flush_l3_required: bool,
    /// System memory the driver allocated for this allocation.
    pub(crate) owned_system_memory: Option<u64>,
    /// Set when the system memory was registered as a driver fragment.
    pub(crate) driver_allocated_cpu_pointer: Option<u64>,
    /// Bank selector charged for local handles.
    pub(crate) internal_bank_usage: bool,
}

impl GraphicsAllocation {
    pub(crate) fn new(
        root_device_index: u32,
        allocation_type: AllocationType,
        size: u64,
        memory_pool: MemoryPool,
    ) -> Self {
        Self {
            root_device_index,
            allocation_type,
            gpu_address: 0,
            gpu_base_address: 0,
            underlying_buffer: None,
            size,
            memory_pool,
            storage_info: StorageInfo::default(),
            fragments_storage: OsHandleStorage::default(),
            handles: Vec::new(),
            reserved_address_range: None,
            compressed: false,
            allocation_offset: 0,
            flush_l3_required: false,
            owned_system_memory: None,
            driver_allocated_cpu_pointer: None,
            internal_bank_usage: false,
        }
    }

    /// GPU address relative to `gpu_base_address`.
    pub fn gpu_address_to_patch(&self) -> u64 {
        self.gpu_address.wrapping_sub(self.gpu_base_address)
    }

    pub fn is_32bit_allocation(&self) -> bool {
        self.gpu_base_address != 0
    }

    pub fn num_handles(&self) -> usize {
        self.handles.len()
    }
}
