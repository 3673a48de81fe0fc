// Copyright 2024-2026 GFX-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Page sizes, address-space limits and alignment helpers.

pub const KB: u64 = 1024;
pub const MB: u64 = 1024 * KB;
pub const GB: u64 = 1024 * MB;

pub const PAGE_SIZE: u64 = 4 * KB;
pub const PAGE_SIZE_64K: u64 = 64 * KB;

/// Size of each 32-bit heap (internal and external).
pub const HEAP_32BIT_SIZE: u64 = 4 * GB;
/// Default threshold above which a local allocation is split into chunks.
pub const DEFAULT_HUGE_CHUNK_SIZE: u64 = 4 * GB;
/// Default colouring granularity for multi-storage resources.
pub const DEFAULT_COLOURING_GRANULARITY: u64 = 64 * KB;

/// Bit index above which a 48-bit virtual address is sign-extended.
pub const CANONICAL_ADDRESS_BITS: u32 = 48;

/// Round `value` up to a multiple of `alignment` (a power of two).
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// [`align_up`] that reports overflow instead of wrapping.
pub const fn checked_align_up(value: u64, alignment: u64) -> Option<u64> {
    match value.checked_add(alignment - 1) {
        Some(sum) => Some(sum & !(alignment - 1)),
        None => None,
    }
}

/// Round `value` down to a multiple of `alignment` (a power of two).
pub const fn align_down(value: u64, alignment: u64) -> u64 {
    value & !(alignment - 1)
}

pub const fn is_aligned(value: u64, alignment: u64) -> bool {
    value & (alignment - 1) == 0
}

/// Sign-extend a virtual address from bit 47.
pub const fn canonize(address: u64) -> u64 {
    let shift = 64 - CANONICAL_ADDRESS_BITS;
    (((address << shift) as i64) >> shift) as u64
}

/// Strip the sign extension added by [`canonize`].
pub const fn decanonize(address: u64) -> u64 {
    address & ((1u64 << CANONICAL_ADDRESS_BITS) - 1)
}
