// Copyright 2024-2026 GFX-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Splitting a local allocation into per-bank handles.

use super::constants::{align_up, PAGE_SIZE_64K};
use super::storage_info::{ColouringPolicy, StorageInfo};

/// A range of the allocation's virtual address space, relative to its base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlacement {
    pub offset: u64,
    pub size: u64,
}

/// One backend handle: the bank it lives on and the chunks it backs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlePlacement {
    pub bank: u32,
    pub chunks: Vec<ChunkPlacement>,
}

impl HandlePlacement {
    fn whole(bank: u32, size: u64) -> Self {
        Self { bank, chunks: vec![ChunkPlacement { offset: 0, size }] }
    }

    /// Bytes of memory this handle needs.
    pub fn size(&self) -> u64 {
        self.chunks.iter().map(|c| c.size).sum()
    }
}

/// Handles needed to back `size` bytes placed as `storage` describes.
///
/// Tile-instanced allocations get one full-size copy per bank; single-bank
/// allocations one handle; multi-storage allocations follow the colouring
/// policy.
pub fn plan_handles(storage: &StorageInfo, size: u64) -> Vec<HandlePlacement> {
    let banks = storage.banks();
    if storage.tile_instanced {
        return banks.into_iter().map(|bank| HandlePlacement::whole(bank, size)).collect();
    }
    if !storage.multi_storage || banks.len() == 1 {
        return vec![HandlePlacement::whole(banks[0], size)];
    }

    let granularity = storage.colouring_granularity.max(PAGE_SIZE_64K);
    let granules = size.div_ceil(granularity);
    let bank_count = banks.len() as u64;

    match storage.colouring_policy {
        ColouringPolicy::DeviceCountBased => {
            let per_bank = granules / bank_count;
            let remainder = granules % bank_count;
            let mut offset = 0;
            let mut handles = Vec::with_capacity(banks.len());
            for (index, bank) in banks.into_iter().enumerate() {
                let count = per_bank + u64::from((index as u64) < remainder);
                if count == 0 {
                    continue;
                }
                let chunk = ChunkPlacement { offset, size: count * granularity };
                offset += chunk.size;
                handles.push(HandlePlacement { bank, chunks: vec![chunk] });
            }
            handles
        }
        ColouringPolicy::ChunkSizeBased => (0..granules)
            .map(|granule| HandlePlacement {
                bank: banks[(granule % bank_count) as usize],
                chunks: vec![ChunkPlacement { offset: granule * granularity, size: granularity }],
            })
            .collect(),
        ColouringPolicy::MappingBased => {
            let mut handles: Vec<HandlePlacement> = banks
                .into_iter()
                .map(|bank| HandlePlacement { bank, chunks: Vec::new() })
                .collect();
            for granule in 0..granules {
                handles[(granule % bank_count) as usize]
                    .chunks
                    .push(ChunkPlacement { offset: granule * granularity, size: granularity });
            }
            handles.retain(|handle| !handle.chunks.is_empty());
            handles
        }
    }
}

/// Split a huge single-bank allocation into `ceil(size / chunk_size)` equal,
/// 64 KiB aligned chunks laid out back to back.
pub fn plan_huge_chunks(bank: u32, size: u64, chunk_size: u64) -> Vec<HandlePlacement> {
    let chunk_size = chunk_size.max(PAGE_SIZE_64K);
    let count = size.div_ceil(chunk_size).max(1);
    let each = align_up(size.div_ceil(count), PAGE_SIZE_64K);
    (0..count)
        .map(|index| HandlePlacement {
            bank,
            chunks: vec![ChunkPlacement { offset: index * each, size: each }],
        })
        .collect()
}

/// Bytes of virtual address space the placement spans.
pub fn reserved_span(handles: &[HandlePlacement]) -> u64 {
    handles
        .iter()
        .flat_map(|handle| handle.chunks.iter())
        .map(|chunk| chunk.offset + chunk.size)
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::constants::GB;

    const G: u64 = PAGE_SIZE_64K;

    fn multi_storage(policy: ColouringPolicy) -> StorageInfo {
        StorageInfo {
            memory_banks: 0b1111,
            multi_storage: true,
            colouring_policy: policy,
            colouring_granularity: G,
            ..Default::default()
        }
    }

    fn sizes(handles: &[HandlePlacement]) -> Vec<u64> {
        handles.iter().map(|h| h.size() / G).collect()
    }

    #[test]
    fn device_count_based_gives_remainder_to_lowest_banks() {
        let handles = plan_handles(&multi_storage(ColouringPolicy::DeviceCountBased), 9 * G);
        assert_eq!(sizes(&handles), vec![3, 2, 2, 2]);
        assert_eq!(handles.iter().map(|h| h.bank).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(handles[1].chunks[0].offset, 3 * G);
        assert_eq!(reserved_span(&handles), 9 * G);
    }

    #[test]
    fn device_count_based_rounds_size_up_to_granularity() {
        let handles = plan_handles(&multi_storage(ColouringPolicy::DeviceCountBased), 8 * G + 1);
        assert_eq!(sizes(&handles), vec![3, 2, 2, 2]);
    }

    #[test]
    fn oversized_granularity_yields_one_granule() {
        let storage = StorageInfo {
            colouring_granularity: 1 << 63,
            ..multi_storage(ColouringPolicy::DeviceCountBased)
        };
        let handles = plan_handles(&storage, 5 * G);
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].size(), 1 << 63);
    }

    #[test]
    fn chunk_size_based_makes_one_handle_per_chunk() {
        let handles = plan_handles(&multi_storage(ColouringPolicy::ChunkSizeBased), 6 * G);
        assert_eq!(handles.len(), 6);
        assert_eq!(handles.iter().map(|h| h.bank).collect::<Vec<_>>(), vec![0, 1, 2, 3, 0, 1]);
        assert_eq!(handles[5].chunks[0].offset, 5 * G);
    }

    #[test]
    fn mapping_based_interleaves_granules() {
        let handles = plan_handles(&multi_storage(ColouringPolicy::MappingBased), 18 * G);
        assert_eq!(sizes(&handles), vec![5, 5, 4, 4]);
        let offsets: Vec<u64> = handles[1].chunks.iter().map(|c| c.offset / G).collect();
        assert_eq!(offsets, vec![1, 5, 9, 13, 17]);
    }

    #[test]
    fn single_bank_gets_one_handle() {
        let storage = StorageInfo { memory_banks: 0b0100, ..Default::default() };
        assert_eq!(plan_handles(&storage, 3 * G), vec![HandlePlacement::whole(2, 3 * G)]);
        assert_eq!(plan_handles(&StorageInfo::default(), G), vec![HandlePlacement::whole(0, G)]);
    }

    #[test]
    fn tile_instanced_copies_to_every_bank() {
        let storage = StorageInfo { memory_banks: 0b1010, tile_instanced: true, ..Default::default() };
        let handles = plan_handles(&storage, 2 * G);
        assert_eq!(handles, vec![HandlePlacement::whole(1, 2 * G), HandlePlacement::whole(3, 2 * G)]);
        assert_eq!(reserved_span(&handles), 2 * G);
    }

    #[test]
    fn huge_allocations_split_into_equal_chunks() {
        let handles = plan_huge_chunks(1, 9 * GB, 4 * GB);
        assert_eq!(handles.len(), 3);
        assert!(handles.iter().all(|h| h.size() == 3 * GB && h.bank == 1));
        assert_eq!(handles[2].chunks[0].offset, 6 * GB);
        assert_eq!(reserved_span(&handles), 9 * GB);
    }
}
