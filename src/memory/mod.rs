//! Typed, paged buffer memory for GPU-side tasks.
//!
//! The scheduler never touches this module. Tasks that need device, pinned or
//! write-combined buffers allocate them from a [`CudaMemoryManager`] inside
//! their body and free them before they release.

mod heap;

use std::fmt;

use parking_lot::Mutex;

pub use crate::memory::heap::HeapMemoryManager;
use crate::error::HeapError;

/// Every allocation is rounded up to, and aligned on, this many bytes.
pub const GRANULARITY: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryType {
    DeviceMemory,
    PinnedHost,
    WriteCombined,
    Host,
}

impl MemoryType {
    pub const ALL: [MemoryType; 4] = [
        MemoryType::DeviceMemory,
        MemoryType::PinnedHost,
        MemoryType::WriteCombined,
        MemoryType::Host,
    ];
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MemoryType::DeviceMemory => "device",
            MemoryType::PinnedHost => "pinned host",
            MemoryType::WriteCombined => "write-combined",
            MemoryType::Host => "host",
        })
    }
}

/// Statistics bucket an allocation is accounted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AllocId {
    #[default]
    Unassigned,
    Scene,
    Particles,
    GpuUtil,
    Cloth,
}

impl AllocId {
    pub const COUNT: usize = 5;

    pub const ALL: [AllocId; Self::COUNT] = [
        AllocId::Unassigned,
        AllocId::Scene,
        AllocId::Particles,
        AllocId::GpuUtil,
        AllocId::Cloth,
    ];
}

/// Address of a buffer inside its heap.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BufferPtr(u64);

impl BufferPtr {
    pub const NULL: BufferPtr = BufferPtr(0);

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for BufferPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BufferPtr({:#x})", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocIdStats {
    /// Bytes currently allocated.
    pub size: u64,
    pub max_size: u64,
    /// Live allocations.
    pub elements: u64,
    pub max_elements: u64,
}

impl AllocIdStats {
    fn allocated(&mut self, size: u64) {
        self.size += size;
        self.elements += 1;
        self.max_size = self.max_size.max(self.size);
        self.max_elements = self.max_elements.max(self.elements);
    }

    fn freed(&mut self, size: u64) {
        self.size -= size;
        self.elements -= 1;
    }

    fn resized(&mut self, old: u64, new: u64) {
        self.size = self.size - old + new;
        self.max_size = self.max_size.max(self.size);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Bytes of pages owned by the heap.
    pub heap_size: u64,
    /// Bytes requested by live allocations.
    pub total_allocated: u64,
    pub max_allocated: u64,
    pub alloc_id_stats: [AllocIdStats; AllocId::COUNT],
}

impl MemoryStats {
    pub fn for_id(&self, id: AllocId) -> &AllocIdStats {
        &self.alloc_id_stats[id as usize]
    }

    fn allocated(&mut self, id: AllocId, size: u64) {
        self.total_allocated += size;
        self.max_allocated = self.max_allocated.max(self.total_allocated);
        self.alloc_id_stats[id as usize].allocated(size);
    }

    fn freed(&mut self, id: AllocId, size: u64) {
        self.total_allocated -= size;
        self.alloc_id_stats[id as usize].freed(size);
    }

    fn resized(&mut self, id: AllocId, old: u64, new: u64) {
        self.total_allocated = self.total_allocated - old + new;
        self.max_allocated = self.max_allocated.max(self.total_allocated);
        self.alloc_id_stats[id as usize].resized(old, new);
    }
}

/// Buffer allocation contract consumed by GPU-side tasks.
///
/// Every fallible method returns the failure and also reports it to the
/// manager's error sink, except [`HeapError::WouldMove`] which callers are
/// expected to handle.
pub trait CudaMemoryManager: Send + Sync {
    fn alloc(&self, memory_type: MemoryType, size: u64, id: AllocId) -> Result<BufferPtr, HeapError>;

    /// Freeing [`BufferPtr::NULL`] does nothing.
    fn free(&self, memory_type: MemoryType, ptr: BufferPtr) -> Result<(), HeapError>;

    /// Resizes a buffer in place. Never moves it: if the new size doesn't fit
    /// the buffer fails with [`HeapError::WouldMove`] and stays as it was.
    fn realloc(&self, memory_type: MemoryType, ptr: BufferPtr, size: u64) -> Result<(), HeapError>;

    /// Grows the heap so that a `size`-byte buffer can be allocated without
    /// growing it again.
    fn reserve(&self, memory_type: MemoryType, size: u64) -> Result<(), HeapError>;

    fn stats(&self, memory_type: MemoryType) -> MemoryStats;

    /// Only allowed while the heap owns no pages.
    fn set_page_size(&self, memory_type: MemoryType, size: u64) -> Result<(), HeapError>;

    fn set_max_memory_size(&self, memory_type: MemoryType, size: u64) -> Result<(), HeapError>;

    fn base_size(&self, memory_type: MemoryType) -> u64;

    fn page_size(&self, memory_type: MemoryType) -> u64;

    fn max_memory_size(&self, memory_type: MemoryType) -> u64;
}

/// Source of the pages a [`HeapMemoryManager`] suballocates from, e.g. a
/// driver's device allocation call.
pub trait PageAllocator: Send + Sync {
    /// Base address of `size` fresh bytes, or `None` when exhausted.
    fn allocate(&self, memory_type: MemoryType, size: u64) -> Option<u64>;

    fn deallocate(&self, memory_type: MemoryType, base: u64, size: u64);
}

/// Hands out disjoint address ranges with nothing behind them.
///
/// Each memory type lives in its own terabyte of address space. Released
/// ranges are never handed out again.
#[derive(Debug)]
pub struct VirtualPageAllocator {
    next: Mutex<[u64; 4]>,
}

const VIRTUAL_SPAN: u64 = 1 << 40;

impl Default for VirtualPageAllocator {
    fn default() -> Self {
        Self {
            next: Mutex::new([1, 2, 3, 4].map(|n| n * VIRTUAL_SPAN)),
        }
    }
}

impl PageAllocator for VirtualPageAllocator {
    fn allocate(&self, memory_type: MemoryType, size: u64) -> Option<u64> {
        let index = memory_type as usize;
        let mut next = self.next.lock();

        let base = next[index];
        let end = base.checked_add(size)?;
        if end > (index as u64 + 2) * VIRTUAL_SPAN {
            return None;
        }

        next[index] = end;
        Some(base)
    }

    fn deallocate(&self, _: MemoryType, _: u64, _: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_pages_are_disjoint_per_type() {
        let pages = VirtualPageAllocator::default();
        let a = pages.allocate(MemoryType::DeviceMemory, 4096).unwrap();
        let b = pages.allocate(MemoryType::DeviceMemory, 4096).unwrap();
        let c = pages.allocate(MemoryType::Host, 4096).unwrap();

        assert_eq!(b, a + 4096);
        assert!(c >= 4 * VIRTUAL_SPAN);
        assert_eq!(a % GRANULARITY, 0);
        assert!(pages.allocate(MemoryType::PinnedHost, VIRTUAL_SPAN + 1).is_none());
    }

    #[test]
    fn test_stats_track_peaks() {
        let mut stats = MemoryStats::default();
        stats.allocated(AllocId::Cloth, 512);
        stats.allocated(AllocId::Cloth, 256);
        stats.freed(AllocId::Cloth, 512);
        stats.resized(AllocId::Cloth, 256, 100);

        let cloth = stats.for_id(AllocId::Cloth);
        assert_eq!(cloth.size, 100);
        assert_eq!(cloth.max_size, 768);
        assert_eq!(cloth.elements, 1);
        assert_eq!(cloth.max_elements, 2);
        assert_eq!(stats.total_allocated, 100);
        assert_eq!(stats.max_allocated, 768);
        assert_eq!(stats.for_id(AllocId::Scene), &AllocIdStats::default());
    }

    #[test]
    fn test_buffer_ptr_debug_is_hex() {
        assert_eq!(format!("{:?}", BufferPtr::from_raw(0x1000)), "BufferPtr(0x1000)");
        assert!(BufferPtr::default().is_null());
    }
}
