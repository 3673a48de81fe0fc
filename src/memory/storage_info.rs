// Copyright 2024-2026 GFX-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Placement of an allocation across the local memory banks of a root device.

use serde::Serialize;

use super::allocation::{AllocationProperties, AllocationType, DeviceBitfield};
use super::constants::DEFAULT_COLOURING_GRANULARITY;
use super::settings::{HardwareInfo, MemorySettings};

/// How a multi-storage allocation is spread across banks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum ColouringPolicy {
    /// One contiguous handle per bank, remainder granules to the lowest banks.
    #[default]
    DeviceCountBased,
    /// One handle per granularity-sized chunk, banks round-robin.
    ChunkSizeBased,
    /// One handle per bank, granules interleaved round-robin.
    MappingBased,
}

impl ColouringPolicy {
    pub fn from_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(Self::DeviceCountBased),
            1 => Some(Self::ChunkSizeBased),
            2 => Some(Self::MappingBased),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StorageInfo {
    pub memory_banks: DeviceBitfield,
    pub page_tables_visibility: DeviceBitfield,
    pub sub_device_bitfield: DeviceBitfield,
    pub cloning_of_page_tables: bool,
    pub tile_instanced: bool,
    pub multi_storage: bool,
    pub colouring_policy: ColouringPolicy,
    pub colouring_granularity: u64,
    pub read_only_multi_storage: bool,
    pub cpu_visible_segment: bool,
    pub is_lockable: bool,
    pub local_only_required: bool,
}

impl Default for StorageInfo {
    fn default() -> Self {
        Self {
            memory_banks: 0,
            page_tables_visibility: 0,
            sub_device_bitfield: 0,
            cloning_of_page_tables: true,
            tile_instanced: false,
            multi_storage: false,
            colouring_policy: ColouringPolicy::DeviceCountBased,
            colouring_granularity: DEFAULT_COLOURING_GRANULARITY,
            read_only_multi_storage: false,
            cpu_visible_segment: false,
            is_lockable: false,
            local_only_required: false,
        }
    }
}

impl StorageInfo {
    fn new(memory_banks: DeviceBitfield, page_tables_visibility: DeviceBitfield) -> Self {
        Self { memory_banks, page_tables_visibility, ..Self::default() }
    }

    /// Number of banks backing the allocation, at least 1.
    pub fn num_banks(&self) -> u32 {
        self.memory_banks.count_ones().max(1)
    }

    /// Bank indices in ascending order; bank 0 when no bank is set.
    pub fn banks(&self) -> Vec<u32> {
        if self.memory_banks == 0 {
            return vec![0];
        }
        (0..DeviceBitfield::BITS).filter(|bank| self.memory_banks & (1 << bank) != 0).collect()
    }
}

/// Derive bank placement for `properties`.
///
/// `least_occupied_bank` comes from the bank selector the allocation type is
/// charged to and is only used when more than one sub-device is requested.
pub fn create_storage_info(
    properties: &AllocationProperties,
    settings: &MemorySettings,
    hw: &HardwareInfo,
    least_occupied_bank: u32,
) -> StorageInfo {
    let subdevices = properties.sub_devices_bitfield;
    if subdevices == 0 {
        return StorageInfo::default();
    }

    let single_tile = subdevices.count_ones() == 1;
    let all_tiles = if single_tile { hw.all_tiles_mask() } else { subdevices };
    let preferred_tile = if single_tile {
        subdevices
    } else if least_occupied_bank < DeviceBitfield::BITS && subdevices & (1 << least_occupied_bank) != 0 {
        1 << least_occupied_bank
    } else {
        1 << subdevices.trailing_zeros()
    };

    let allocation_type = properties.allocation_type;
    let flags = &properties.flags;
    let mut info = StorageInfo::new(preferred_tile, all_tiles);
    info.sub_device_bitfield = subdevices;
    info.is_lockable = allocation_type.is_lockable() && !flags.shareable;
    info.cpu_visible_segment = allocation_type.is_cpu_access_required();

    match allocation_type {
        AllocationType::ConstantSurface
        | AllocationType::KernelIsa
        | AllocationType::KernelIsaInternal
        | AllocationType::DebugModuleArea => {
            let multi_tile = settings.multi_tile_isa_placement.unwrap_or(!single_tile);
            if multi_tile {
                info.cloning_of_page_tables = false;
                info.memory_banks = all_tiles;
                info.tile_instanced = true;
            }
        }
        AllocationType::CommandBuffer
        | AllocationType::InternalHeap
        | AllocationType::LinearStream
        | AllocationType::RingBuffer
        | AllocationType::SemaphoreBuffer => {
            if flags.multi_os_context_capable {
                if matches!(
                    allocation_type,
                    AllocationType::CommandBuffer
                        | AllocationType::RingBuffer
                        | AllocationType::SemaphoreBuffer
                ) {
                    info.memory_banks = 1 << all_tiles.trailing_zeros();
                }
            } else {
                info.cloning_of_page_tables = false;
                info.page_tables_visibility = preferred_tile;
            }
        }
        AllocationType::ScratchSurface
        | AllocationType::PreemptionSurface
        | AllocationType::DeferredTasksList => {
            if flags.multi_os_context_capable {
                info.cloning_of_page_tables = false;
                info.memory_banks = all_tiles;
                info.tile_instanced = true;
            } else {
                info.page_tables_visibility = preferred_tile;
            }
        }
        AllocationType::PrivateSurface => {
            info.cloning_of_page_tables = false;
            if single_tile {
                info.page_tables_visibility = preferred_tile;
            } else {
                info.memory_banks = all_tiles;
                info.tile_instanced = true;
            }
        }
        AllocationType::WorkPartitionSurface => {
            info.cloning_of_page_tables = false;
            info.memory_banks = all_tiles;
            info.tile_instanced = true;
        }
        AllocationType::Buffer | AllocationType::SvmGpu | AllocationType::UnifiedSharedMemory => {
            if flags.read_only_multi_storage {
                set_read_only_multi_storage(&mut info, all_tiles);
            } else if properties.multi_storage_resource
                && hw.supports_multi_storage_resources
                && !single_tile
            {
                let mut granularity = DEFAULT_COLOURING_GRANULARITY;
                let mut policy = ColouringPolicy::DeviceCountBased;
                if let Some(bytes) = settings.multi_storage_granularity() {
                    granularity = bytes;
                    policy = ColouringPolicy::ChunkSizeBased;
                }
                if let Some(forced) = settings.multi_storage_policy {
                    policy = forced;
                }
                if properties.size >= u64::from(all_tiles.count_ones()) * granularity {
                    info.memory_banks = all_tiles;
                    info.multi_storage = true;
                    info.colouring_granularity = granularity;
                    info.colouring_policy = policy;
                }
            }
            info.local_only_required = true;
        }
        _ => {
            if flags.read_only_multi_storage {
                set_read_only_multi_storage(&mut info, all_tiles);
            }
        }
    }
    info
}

fn set_read_only_multi_storage(info: &mut StorageInfo, all_tiles: DeviceBitfield) {
    info.read_only_multi_storage = true;
    info.memory_banks = all_tiles;
    info.cloning_of_page_tables = false;
    info.tile_instanced = true;
}

#[cfg(test)]
#[path = "storage_info_tests.rs"]
mod tests;
