// Copyright 2024-2026 GFX-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Memory backend trait (the kernel-mode driver seam) and a mock backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

use super::constants::{checked_align_up, GB, PAGE_SIZE};

/// A buffer object created by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendHandle {
    pub id: u64,
    pub size: u64,
    /// Local memory bank, `None` for system memory.
    pub bank: Option<u32>,
    pub compressed: bool,
}

/// A local memory allocation on one bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceMemoryRequest {
    pub root_device_index: u32,
    pub size: u64,
    pub alignment: u64,
    pub bank: u32,
    pub compressed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("Out of memory: required {required} bytes, available {available} bytes")]
    OutOfMemory { required: u64, available: u64 },

    #[error("Host pointer {0:#x} is not backed by memory")]
    InvalidHostPointer(u64),

    #[error("GPU VA mapping failed: {0}")]
    MapFailed(String),

    #[error("Unknown backend handle {0}")]
    UnknownHandle(u64),

    #[error("Backend operation failed: {0}")]
    Failed(String),
}

/// Operations the memory manager needs from the kernel-mode driver.
pub trait MemoryBackend: Send + Sync {
    /// Reserve CPU memory; returns its address.
    fn allocate_system_memory(&self, size: u64, alignment: u64) -> Result<u64, BackendError>;
    fn free_system_memory(&self, cpu_address: u64) -> Result<(), BackendError>;
    /// Wrap driver-owned system memory in a GPU buffer object.
    fn allocate_with_alignment(
        &self,
        root_device_index: u32,
        cpu_address: u64,
        size: u64,
    ) -> Result<BackendHandle, BackendError>;
    /// Wrap caller-owned memory in a GPU buffer object.
    fn import_host_ptr(
        &self,
        root_device_index: u32,
        cpu_address: u64,
        size: u64,
    ) -> Result<BackendHandle, BackendError>;
    fn allocate_in_device_pool(&self, request: &DeviceMemoryRequest) -> Result<BackendHandle, BackendError>;
    /// Bind `size` bytes of `handle`, starting `offset` bytes into it, at
    /// `gpu_address`; returns the address the backend actually used.
    fn map_gpu_va(
        &self,
        handle: &BackendHandle,
        gpu_address: u64,
        offset: u64,
        size: u64,
    ) -> Result<u64, BackendError>;
    fn free_graphics_memory(&self, handle: &BackendHandle) -> Result<(), BackendError>;
}

// -- Mock backend (testing + OS-agnostic fallback) ----------------------------

/// Backend operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    SystemMemory,
    WithAlignment,
    ImportHostPtr,
    DevicePool,
    MapGpuVa,
}

/// One `map_gpu_va` call recorded by the mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuMapping {
    pub gpu_address: u64,
    pub offset: u64,
    pub size: u64,
}

struct InjectedFailure {
    successes_left: usize,
    error: BackendError,
}

struct MockState {
    handles: HashMap<u64, BackendHandle>,
    system: HashMap<u64, u64>,
    next_cpu_address: u64,
    bank_usage: HashMap<(u32, u32), u64>,
    handle_roots: HashMap<u64, u32>,
    mappings: HashMap<u64, Vec<GpuMapping>>,
    failures: HashMap<BackendOp, InjectedFailure>,
    calls: HashMap<BackendOp, usize>,
    remap_to: Option<u64>,
}

/// In-process backend that hands out fake addresses and tracks every handle.
pub struct MockMemoryBackend {
    bank_capacity: u64,
    next_id: AtomicU64,
    state: Mutex<MockState>,
}

const MOCK_CPU_BASE: u64 = 0x10_0000_0000;

impl Default for MockMemoryBackend {
    fn default() -> Self {
        Self::new(16 * GB)
    }
}

impl MockMemoryBackend {
    /// `bank_capacity` bytes of local memory per bank.
    pub fn new(bank_capacity: u64) -> Self {
        Self {
            bank_capacity,
            next_id: AtomicU64::new(1),
            state: Mutex::new(MockState {
                handles: HashMap::new(),
                system: HashMap::new(),
                next_cpu_address: MOCK_CPU_BASE,
                bank_usage: HashMap::new(),
                handle_roots: HashMap::new(),
                mappings: HashMap::new(),
                failures: HashMap::new(),
                calls: HashMap::new(),
                remap_to: None,
            }),
        }
    }

    /// Fail every call to `op` with `error`.
    pub fn fail(&self, op: BackendOp, error: BackendError) {
        self.fail_after(op, 0, error);
    }

    /// Let `successes` calls to `op` through, then fail the rest.
    pub fn fail_after(&self, op: BackendOp, successes: usize, error: BackendError) {
        self.state
            .lock()
            .failures
            .insert(op, InjectedFailure { successes_left: successes, error });
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Make `map_gpu_va` report `address` instead of the requested one.
    pub fn remap_gpu_va(&self, address: Option<u64>) {
        self.state.lock().remap_to = address;
    }

    /// Count of live (un-freed) handles.
    pub fn leak_count(&self) -> usize {
        self.state.lock().handles.len()
    }

    /// Count of live system memory reservations.
    pub fn system_allocation_count(&self) -> usize {
        self.state.lock().system.len()
    }

    pub fn call_count(&self, op: BackendOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Bytes of local memory in use on `bank`.
    pub fn bank_usage(&self, root_device_index: u32, bank: u32) -> u64 {
        self.state
            .lock()
            .bank_usage
            .get(&(root_device_index, bank))
            .copied()
            .unwrap_or(0)
    }

    /// Live mappings of a handle, in call order.
    pub fn mappings(&self, handle_id: u64) -> Vec<GpuMapping> {
        self.state.lock().mappings.get(&handle_id).cloned().unwrap_or_default()
    }

    fn check_failure(state: &mut MockState, op: BackendOp) -> Result<(), BackendError> {
        *state.calls.entry(op).or_insert(0) += 1;
        match state.failures.get_mut(&op) {
            Some(failure) if failure.successes_left == 0 => Err(failure.error.clone()),
            Some(failure) => {
                failure.successes_left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn new_handle(&self, state: &mut MockState, root: u32, size: u64, bank: Option<u32>, compressed: bool) -> BackendHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = BackendHandle { id, size, bank, compressed };
        state.handles.insert(id, handle.clone());
        state.handle_roots.insert(id, root);
        handle
    }
}

impl MemoryBackend for MockMemoryBackend {
    fn allocate_system_memory(&self, size: u64, alignment: u64) -> Result<u64, BackendError> {
        let mut s = self.state.lock();
        Self::check_failure(&mut s, BackendOp::SystemMemory)?;
        let out_of_memory = BackendError::OutOfMemory { required: size, available: 0 };
        let address = checked_align_up(s.next_cpu_address, alignment.max(PAGE_SIZE)).ok_or(out_of_memory.clone())?;
        let next = checked_align_up(size.max(1), PAGE_SIZE)
            .and_then(|size| address.checked_add(size))
            .ok_or(out_of_memory)?;
        s.next_cpu_address = next;
        s.system.insert(address, size);
        Ok(address)
    }

    fn free_system_memory(&self, cpu_address: u64) -> Result<(), BackendError> {
        let mut s = self.state.lock();
        match s.system.remove(&cpu_address) {
            Some(_) => Ok(()),
            None => Err(BackendError::Failed(format!(
                "double-free or unknown system memory {cpu_address:#x}"
            ))),
        }
    }

    fn allocate_with_alignment(
        &self,
        root_device_index: u32,
        cpu_address: u64,
        size: u64,
    ) -> Result<BackendHandle, BackendError> {
        let mut s = self.state.lock();
        Self::check_failure(&mut s, BackendOp::WithAlignment)?;
        if !s.system.contains_key(&cpu_address) {
            return Err(BackendError::InvalidHostPointer(cpu_address));
        }
        Ok(self.new_handle(&mut s, root_device_index, size, None, false))
    }

    fn import_host_ptr(
        &self,
        root_device_index: u32,
        cpu_address: u64,
        size: u64,
    ) -> Result<BackendHandle, BackendError> {
        let mut s = self.state.lock();
        Self::check_failure(&mut s, BackendOp::ImportHostPtr)?;
        if cpu_address == 0 {
            return Err(BackendError::InvalidHostPointer(cpu_address));
        }
        Ok(self.new_handle(&mut s, root_device_index, size, None, false))
    }

    fn allocate_in_device_pool(&self, request: &DeviceMemoryRequest) -> Result<BackendHandle, BackendError> {
        let mut s = self.state.lock();
        Self::check_failure(&mut s, BackendOp::DevicePool)?;
        let key = (request.root_device_index, request.bank);
        let used = s.bank_usage.get(&key).copied().unwrap_or(0);
        if request.size > self.bank_capacity - used {
            return Err(BackendError::OutOfMemory {
                required: request.size,
                available: self.bank_capacity - used,
            });
        }
        s.bank_usage.insert(key, used + request.size);
        Ok(self.new_handle(
            &mut s,
            request.root_device_index,
            request.size,
            Some(request.bank),
            request.compressed,
        ))
    }

    fn map_gpu_va(
        &self,
        handle: &BackendHandle,
        gpu_address: u64,
        offset: u64,
        size: u64,
    ) -> Result<u64, BackendError> {
        let mut s = self.state.lock();
        Self::check_failure(&mut s, BackendOp::MapGpuVa)?;
        let Some(stored) = s.handles.get(&handle.id) else {
            return Err(BackendError::UnknownHandle(handle.id));
        };
        if offset.checked_add(size).map_or(true, |end| end > stored.size) {
            return Err(BackendError::MapFailed(format!(
                "{size:#x} bytes at offset {offset:#x} exceed handle {} of {:#x} bytes",
                handle.id, stored.size
            )));
        }
        let mapped = s.remap_to.unwrap_or(gpu_address);
        s.mappings.entry(handle.id).or_default().push(GpuMapping { gpu_address: mapped, offset, size });
        Ok(mapped)
    }

    fn free_graphics_memory(&self, handle: &BackendHandle) -> Result<(), BackendError> {
        let mut s = self.state.lock();
        let Some(stored) = s.handles.remove(&handle.id) else {
            return Err(BackendError::UnknownHandle(handle.id));
        };
        s.mappings.remove(&handle.id);
        let root = s.handle_roots.remove(&handle.id).unwrap_or(0);
        if let Some(bank) = stored.bank {
            if let Some(used) = s.bank_usage.get_mut(&(root, bank)) {
                *used = used.saturating_sub(stored.size);
            }
        }
        Ok(())
    }
}
