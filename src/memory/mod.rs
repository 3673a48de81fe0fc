// Copyright 2024-2026 GFX-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Graphics memory management.
//!
//! [`MemoryManager`] turns an [`AllocationProperties`] request into a
//! [`GraphicsAllocation`] placed in local (device) memory or in one of the
//! system memory pools. Bank placement comes from [`create_storage_info`],
//! virtual addresses from the per-root-device [`GfxPartition`], and host
//! pointer imports are deduplicated page by page through [`HostPtrManager`].
//! The kernel-mode driver sits behind [`MemoryBackend`].

mod allocation;
mod backend;
mod bank_selector;
mod colouring;
mod compression;
pub mod constants;
mod gfx_partition;
mod host_ptr;
mod manager;
mod settings;
mod storage_info;

pub use allocation::{
    AllocationData, AllocationDataFlags, AllocationProperties, AllocationPropertiesFlags,
    AllocationStatus, AllocationType, DeviceBitfield, GraphicsAllocation, MemoryPool,
};
pub use backend::{
    BackendError, BackendHandle, BackendOp, DeviceMemoryRequest, GpuMapping, MemoryBackend,
    MockMemoryBackend,
};
pub use bank_selector::LocalMemoryUsageBankSelector;
pub use colouring::{plan_handles, plan_huge_chunks, reserved_span, ChunkPlacement, HandlePlacement};
pub use compression::is_compression_enabled;
pub use gfx_partition::{AddressRange, GfxPartition, HeapAllocator, HeapIndex};
pub use host_ptr::{
    AllocationFragment, AllocationRequirements, FragmentPosition, FragmentStorage,
    FragmentStorageData, HostPtrManager, OsHandleStorage, OverlapStatus, PrepareStorageError,
    RequirementsStatus, MAX_FRAGMENTS_COUNT,
};
pub use manager::MemoryManager;
pub use settings::{HardwareInfo, MemorySettings};
pub use storage_info::{create_storage_info, ColouringPolicy, StorageInfo};
