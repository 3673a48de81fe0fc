// Copyright 2024-2026 GFX-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Local memory usage per bank, used to place single-bank allocations on the
//! least occupied bank.

use std::sync::atomic::{AtomicU64, Ordering};

use super::allocation::DeviceBitfield;

pub struct LocalMemoryUsageBankSelector {
    banks: Vec<AtomicU64>,
}

impl LocalMemoryUsageBankSelector {
    pub fn new(bank_count: u32) -> Self {
        Self { banks: (0..bank_count.max(1)).map(|_| AtomicU64::new(0)).collect() }
    }

    pub fn bank_count(&self) -> u32 {
        self.banks.len() as u32
    }

    /// Least used bank among the set bits of `device_bitfield`. Ties go to the
    /// lower index; an empty or out-of-range mask yields bank 0.
    pub fn least_occupied_bank(&self, device_bitfield: DeviceBitfield) -> u32 {
        self.banks
            .iter()
            .enumerate()
            .filter(|(bank, _)| device_bitfield & (1 << bank) != 0)
            .min_by_key(|(_, usage)| usage.load(Ordering::Relaxed))
            .map(|(bank, _)| bank as u32)
            .unwrap_or(0)
    }

    pub fn reserve_on_banks(&self, bank_mask: DeviceBitfield, size: u64) {
        for (_, usage) in self.selected(bank_mask) {
            usage.fetch_add(size, Ordering::Relaxed);
        }
    }

    /// Release usage; never drops below zero.
    pub fn free_on_banks(&self, bank_mask: DeviceBitfield, size: u64) {
        for (_, usage) in self.selected(bank_mask) {
            let _ = usage.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(size))
            });
        }
    }

    pub fn occupied_memory_size_for_bank(&self, bank: u32) -> u64 {
        self.banks
            .get(bank as usize)
            .map(|usage| usage.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn selected(&self, bank_mask: DeviceBitfield) -> impl Iterator<Item = (usize, &AtomicU64)> {
        self.banks
            .iter()
            .enumerate()
            .filter(move |(bank, _)| bank_mask & (1 << bank) != 0)
    }
}
