// Copyright 2024-2026 GFX-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! GPU virtual address space partitioning into heaps.
//!
//! Addresses stored here are decanonized; callers canonize them before
//! handing them out.

use parking_lot::Mutex;

use super::constants::{align_down, align_up, checked_align_up, CANONICAL_ADDRESS_BITS, GB, HEAP_32BIT_SIZE, PAGE_SIZE, PAGE_SIZE_64K};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapIndex {
    /// 32-bit heap for kernel ISA and internal heaps.
    Internal,
    /// 32-bit heap for user allocations.
    External,
    Standard,
    Standard64Kb,
}

impl HeapIndex {
    pub const ALL: [HeapIndex; 4] =
        [HeapIndex::Internal, HeapIndex::External, HeapIndex::Standard, HeapIndex::Standard64Kb];

    pub fn is_32bit(self) -> bool {
        matches!(self, HeapIndex::Internal | HeapIndex::External)
    }
}

/// A reservation in one heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub heap: HeapIndex,
    pub address: u64,
    pub size: u64,
}

/// First-fit allocator over one address range.
#[derive(Debug)]
pub struct HeapAllocator {
    base: u64,
    limit: u64,
    next: u64,
    free_list: Vec<(u64, u64)>,
}

impl HeapAllocator {
    pub fn new(base: u64, size: u64) -> Self {
        Self { base, limit: base + size, next: base, free_list: Vec::new() }
    }

    pub fn allocate(&mut self, size: u64, alignment: u64) -> Option<u64> {
        let size = checked_align_up(size.max(1), PAGE_SIZE)?;
        let alignment = alignment.max(PAGE_SIZE);

        for index in 0..self.free_list.len() {
            let (start, len) = self.free_list[index];
            let Some(aligned) = checked_align_up(start, alignment) else { continue };
            if aligned.checked_add(size).is_some_and(|end| end <= start + len) {
                self.free_list.swap_remove(index);
                if aligned > start {
                    self.free_list.push((start, aligned - start));
                }
                if aligned + size < start + len {
                    self.free_list.push((aligned + size, start + len - aligned - size));
                }
                return Some(aligned);
            }
        }

        let aligned = checked_align_up(self.next, alignment)?;
        if aligned.checked_add(size)? > self.limit {
            return None;
        }
        if aligned > self.next {
            self.free_list.push((self.next, aligned - self.next));
        }
        self.next = aligned + size;
        Some(aligned)
    }

    pub fn free(&mut self, address: u64, size: u64) {
        let size = align_up(size.max(1), PAGE_SIZE);
        self.free_list.push((address, size));
        self.free_list.sort_unstable_by_key(|&(start, _)| start);

        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.free_list.len());
        for &(start, len) in &self.free_list {
            match merged.last_mut() {
                Some(last) if last.0 + last.1 == start => last.1 += len,
                _ => merged.push((start, len)),
            }
        }
        if let Some(&(start, len)) = merged.last() {
            if start + len == self.next {
                self.next = start;
                merged.pop();
            }
        }
        self.free_list = merged;
    }

    /// Bytes currently handed out.
    pub fn used_size(&self) -> u64 {
        let free: u64 = self.free_list.iter().map(|&(_, len)| len).sum();
        self.next - self.base - free
    }
}

pub struct GfxPartition {
    ranges: [(u64, u64); 4],
    heaps: [Mutex<HeapAllocator>; 4],
}

impl Default for GfxPartition {
    fn default() -> Self {
        Self::new(CANONICAL_ADDRESS_BITS)
    }
}

impl GfxPartition {
    /// Lay out the heaps in an address space of `address_bits` bits: the two
    /// 32-bit heaps at the top, the standard heaps below, split in half.
    pub fn new(address_bits: u32) -> Self {
        let top = 1u64 << address_bits.clamp(36, CANONICAL_ADDRESS_BITS);
        let internal = (top - HEAP_32BIT_SIZE, top);
        let external = (top - 2 * HEAP_32BIT_SIZE, top - HEAP_32BIT_SIZE);
        let standard_base = GB;
        let split = align_down(standard_base + (external.0 - standard_base) / 2, PAGE_SIZE_64K);
        let standard = (standard_base, split);
        let standard_64kb = (split, external.0);

        let ranges = [internal, external, standard, standard_64kb];
        let heaps = ranges.map(|(base, limit)| Mutex::new(HeapAllocator::new(base, limit - base)));
        Self { ranges, heaps }
    }

    pub fn heap_base(&self, heap: HeapIndex) -> u64 {
        self.ranges[heap as usize].0
    }

    /// One past the last address of the heap.
    pub fn heap_limit(&self, heap: HeapIndex) -> u64 {
        self.ranges[heap as usize].1
    }

    pub fn heap_size(&self, heap: HeapIndex) -> u64 {
        let (base, limit) = self.ranges[heap as usize];
        limit - base
    }

    pub fn heap_allocate(&self, heap: HeapIndex, size: u64, alignment: u64) -> Option<AddressRange> {
        let size = checked_align_up(size.max(1), PAGE_SIZE)?;
        let address = self.heaps[heap as usize].lock().allocate(size, alignment)?;
        Some(AddressRange { heap, address, size })
    }

    pub fn heap_free(&self, range: &AddressRange) {
        self.heaps[range.heap as usize].lock().free(range.address, range.size);
    }

    pub fn is_in_heap(&self, heap: HeapIndex, address: u64, size: u64) -> bool {
        let (base, limit) = self.ranges[heap as usize];
        address >= base && address.checked_add(size).is_some_and(|end| end <= limit)
    }

    pub fn heap_used_size(&self, heap: HeapIndex) -> u64 {
        self.heaps[heap as usize].lock().used_size()
    }
}
