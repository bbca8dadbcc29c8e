//! Device resource provider.
//!
//! Supplies device memory, command streams and compute handles to the index.
//! Every acquisition is an RAII guard that releases its resource on drop, so
//! nothing leaks on error paths.
//!
//! A [`DeviceResources`] instance may be shared by several indexes; the index
//! requests scratch per operation and never holds it across calls.
//!
//! # Usage
//!
//! ```rust,ignore
//! use ivfbin_core::resources::{MemorySpace, StandardResources, ResourcesProvider};
//!
//! let provider = StandardResources::new();
//! let res = provider.resources();
//! let scratch = res.allocate(1 << 20, MemorySpace::Device)?;
//! // released when `scratch` goes out of scope
//! ```

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::DeviceConfig;
use crate::error::{Error, Result};

/// Memory space an allocation is charged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemorySpace {
    /// Device-resident memory.
    Device,
    /// Page-locked host memory used for staging transfers.
    Pinned,
}

/// Byte accounting for one memory space.
#[derive(Debug)]
struct MemoryLedger {
    space: MemorySpace,
    capacity: usize,
    used: AtomicUsize,
    peak: AtomicUsize,
}

impl MemoryLedger {
    fn new(space: MemorySpace, capacity: usize) -> Self {
        Self {
            space,
            capacity,
            used: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn available(&self) -> usize {
        self.capacity
            .saturating_sub(self.used.load(Ordering::Acquire))
    }

    fn reserve(&self, bytes: usize) -> Result<()> {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let next = current
                .checked_add(bytes)
                .filter(|&n| n <= self.capacity)
                .ok_or(Error::DeviceOutOfMemory {
                    requested: bytes,
                    available: self.capacity.saturating_sub(current),
                })?;
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.peak.fetch_max(next, Ordering::Relaxed);
                    return Ok(());
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
    }
}

/// A reservation of device (or pinned) memory.
///
/// The bytes are returned to the ledger when the guard is dropped.
#[derive(Debug)]
pub struct DeviceAllocation {
    ledger: Arc<MemoryLedger>,
    bytes: usize,
}

impl DeviceAllocation {
    /// Size of the reservation in bytes.
    #[inline]
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Memory space this reservation is charged against.
    #[must_use]
    pub fn space(&self) -> MemorySpace {
        self.ledger.space
    }

    /// Grows or shrinks the reservation in place.
    ///
    /// On failure the reservation keeps its previous size.
    ///
    /// # Errors
    ///
    /// Returns `DeviceOutOfMemory` if the extra bytes are not available.
    pub fn resize(&mut self, bytes: usize) -> Result<()> {
        if bytes > self.bytes {
            self.ledger.reserve(bytes - self.bytes)?;
        } else {
            self.ledger.release(self.bytes - bytes);
        }
        self.bytes = bytes;
        Ok(())
    }
}

impl Drop for DeviceAllocation {
    fn drop(&mut self) {
        if self.bytes > 0 {
            self.ledger.release(self.bytes);
        }
    }
}

/// A reserved buffer together with its backing bytes.
#[derive(Debug)]
pub struct DeviceBuffer {
    allocation: DeviceAllocation,
    data: Vec<u8>,
}

impl DeviceBuffer {
    /// Buffer contents.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Mutable buffer contents.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Buffer length in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the buffer holds no bytes.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Memory space of the buffer.
    #[must_use]
    pub fn space(&self) -> MemorySpace {
        self.allocation.space()
    }

    /// Copies `src` into the front of the buffer.
    ///
    /// # Errors
    ///
    /// Returns `DeviceExecution` if `src` does not fit.
    pub fn copy_from(&mut self, src: &[u8]) -> Result<()> {
        let dst = self.data.get_mut(..src.len()).ok_or_else(|| {
            Error::DeviceExecution(format!(
                "transfer of {} bytes overruns a {} byte buffer",
                src.len(),
                self.allocation.bytes()
            ))
        })?;
        dst.copy_from_slice(src);
        Ok(())
    }
}

/// Fixed-size pool of interchangeable leases (streams or handles).
#[derive(Debug)]
struct LeasePool {
    free: Mutex<Vec<usize>>,
    available: Condvar,
    size: usize,
}

impl LeasePool {
    fn new(size: usize) -> Self {
        Self {
            free: Mutex::new((0..size).rev().collect()),
            available: Condvar::new(),
            size,
        }
    }

    fn acquire(&self) -> usize {
        let mut free = self.free.lock();
        loop {
            if let Some(id) = free.pop() {
                return id;
            }
            self.available.wait(&mut free);
        }
    }

    fn try_acquire(&self) -> Option<usize> {
        self.free.lock().pop()
    }

    fn release(&self, id: usize) {
        self.free.lock().push(id);
        self.available.notify_one();
    }

    fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

/// Exclusive use of one command stream.
///
/// Work issued under the same lease runs in issue order.
#[derive(Debug)]
pub struct StreamLease {
    pool: Arc<LeasePool>,
    id: usize,
}

impl StreamLease {
    /// Stream identifier within the pool.
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}

/// Exclusive use of one compute handle.
#[derive(Debug)]
pub struct HandleLease {
    pool: Arc<LeasePool>,
    id: usize,
}

impl HandleLease {
    /// Handle identifier within the pool.
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for HandleLease {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}

/// Memory, stream and handle pools of one device.
#[derive(Debug)]
pub struct DeviceResources {
    device_memory: Arc<MemoryLedger>,
    pinned_memory: Arc<MemoryLedger>,
    streams: Arc<LeasePool>,
    handles: Arc<LeasePool>,
}

impl DeviceResources {
    /// Creates the resource pools described by `config`.
    ///
    /// Pool sizes below one are raised to one.
    #[must_use]
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            device_memory: Arc::new(MemoryLedger::new(MemorySpace::Device, config.memory_bytes)),
            pinned_memory: Arc::new(MemoryLedger::new(
                MemorySpace::Pinned,
                config.pinned_memory_bytes,
            )),
            streams: Arc::new(LeasePool::new(config.streams.max(1))),
            handles: Arc::new(LeasePool::new(config.handles.max(1))),
        }
    }

    fn ledger(&self, space: MemorySpace) -> &Arc<MemoryLedger> {
        match space {
            MemorySpace::Device => &self.device_memory,
            MemorySpace::Pinned => &self.pinned_memory,
        }
    }

    /// Reserves `bytes` in the given memory space.
    ///
    /// # Errors
    ///
    /// Returns `DeviceOutOfMemory` if the space cannot hold the request.
    pub fn allocate(&self, bytes: usize, space: MemorySpace) -> Result<DeviceAllocation> {
        let ledger = self.ledger(space);
        ledger.reserve(bytes)?;
        Ok(DeviceAllocation {
            ledger: Arc::clone(ledger),
            bytes,
        })
    }

    /// Allocates a zeroed buffer of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns `DeviceOutOfMemory` if the space cannot hold the request.
    pub fn alloc_buffer(&self, bytes: usize, space: MemorySpace) -> Result<DeviceBuffer> {
        let allocation = self.allocate(bytes, space)?;
        Ok(DeviceBuffer {
            allocation,
            data: vec![0; bytes],
        })
    }

    /// Copies host bytes into a new device buffer.
    ///
    /// # Errors
    ///
    /// Returns `DeviceOutOfMemory` if device memory is exhausted.
    pub fn upload(&self, data: &[u8]) -> Result<DeviceBuffer> {
        let allocation = self.allocate(data.len(), MemorySpace::Device)?;
        Ok(DeviceBuffer {
            allocation,
            data: data.to_vec(),
        })
    }

    /// Total capacity of a memory space.
    #[must_use]
    pub fn capacity(&self, space: MemorySpace) -> usize {
        self.ledger(space).capacity
    }

    /// Bytes currently reserved in a memory space.
    #[must_use]
    pub fn used_memory(&self, space: MemorySpace) -> usize {
        self.ledger(space).used.load(Ordering::Acquire)
    }

    /// Bytes still available in a memory space.
    #[must_use]
    pub fn available_memory(&self, space: MemorySpace) -> usize {
        self.ledger(space).available()
    }

    /// Highest reservation level observed in a memory space.
    #[must_use]
    pub fn peak_memory(&self, space: MemorySpace) -> usize {
        self.ledger(space).peak.load(Ordering::Relaxed)
    }

    /// Leases a stream, blocking until one is free.
    #[must_use]
    pub fn acquire_stream(&self) -> StreamLease {
        let id = self.streams.acquire();
        StreamLease {
            pool: Arc::clone(&self.streams),
            id,
        }
    }

    /// Leases a stream if one is idle.
    #[must_use]
    pub fn try_acquire_stream(&self) -> Option<StreamLease> {
        let id = self.streams.try_acquire()?;
        Some(StreamLease {
            pool: Arc::clone(&self.streams),
            id,
        })
    }

    /// Leases a compute handle, blocking until one is free.
    #[must_use]
    pub fn acquire_handle(&self) -> HandleLease {
        let id = self.handles.acquire();
        HandleLease {
            pool: Arc::clone(&self.handles),
            id,
        }
    }

    /// Number of streams in the pool.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.size
    }

    /// Number of streams not currently leased.
    #[must_use]
    pub fn idle_streams(&self) -> usize {
        self.streams.idle()
    }

    /// Number of compute handles not currently leased.
    #[must_use]
    pub fn idle_handles(&self) -> usize {
        self.handles.idle()
    }
}

/// Source of shared device resources for an index.
pub trait ResourcesProvider: Send + Sync {
    /// Returns the resources an index should draw from.
    fn resources(&self) -> Arc<DeviceResources>;
}

impl ResourcesProvider for Arc<DeviceResources> {
    fn resources(&self) -> Arc<DeviceResources> {
        Arc::clone(self)
    }
}

/// Default provider backed by one [`DeviceResources`] instance.
#[derive(Debug, Clone)]
pub struct StandardResources {
    resources: Arc<DeviceResources>,
}

impl Default for StandardResources {
    fn default() -> Self {
        Self::new()
    }
}

impl StandardResources {
    /// Creates a provider with the default device configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::from_config(&DeviceConfig::default())
    }

    /// Creates a provider from an explicit device configuration.
    #[must_use]
    pub fn from_config(config: &DeviceConfig) -> Self {
        tracing::debug!(
            memory_bytes = config.memory_bytes,
            pinned_bytes = config.pinned_memory_bytes,
            streams = config.streams,
            "creating device resources"
        );
        Self {
            resources: Arc::new(DeviceResources::new(config)),
        }
    }
}

impl ResourcesProvider for StandardResources {
    fn resources(&self) -> Arc<DeviceResources> {
        Arc::clone(&self.resources)
    }
}
