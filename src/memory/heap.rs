use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use xalloc::{SysTlsf, SysTlsfRegion};

use crate::config::{HeapConfig, HeapTypeConfig};
use crate::error::{ErrorCallback, ErrorCode, HeapError, TracingErrorCallback, report};
use crate::memory::{
    AllocId, BufferPtr, CudaMemoryManager, GRANULARITY, MemoryStats, MemoryType, PageAllocator,
    VirtualPageAllocator,
};

#[derive(Debug)]
struct Page {
    base: u64,
    size: u64,
    tlsf: SysTlsf<u64>,
    live: usize,
}

#[derive(Debug)]
struct Allocation {
    page: u64,
    region: SysTlsfRegion,
    size: u64,
    capacity: u64,
    id: AllocId,
}

#[derive(Debug)]
struct Heap {
    memory_type: MemoryType,
    config: HeapTypeConfig,
    pages: Vec<Page>,
    allocations: HashMap<u64, Allocation>,
    stats: MemoryStats,
}

impl Heap {
    fn new(memory_type: MemoryType, config: HeapTypeConfig) -> Self {
        Self {
            memory_type,
            config,
            pages: Vec::new(),
            allocations: HashMap::new(),
            stats: MemoryStats::default(),
        }
    }

    fn out_of_memory(&self, requested: u64) -> HeapError {
        HeapError::OutOfMemory {
            memory_type: self.memory_type,
            requested,
            heap_size: self.stats.heap_size,
            limit: self.config.max_size,
        }
    }

    /// First fit over the existing pages.
    fn try_alloc(&mut self, size: u64) -> Option<(u64, u64, SysTlsfRegion)> {
        self.pages.iter_mut().find_map(|page| {
            let (region, offset) = page.tlsf.alloc_aligned(size, GRANULARITY)?;
            page.live += 1;
            Some((page.base + offset, page.base, region))
        })
    }

    /// Adds one page so that the heap ends up a power-of-two number of pages
    /// with room for `need` more bytes, or just enough pages if that would
    /// overshoot the maximum.
    fn grow(&mut self, need: u64, source: &dyn PageAllocator) -> Result<(), HeapError> {
        let page = self.config.page_size;
        let heap = self.stats.heap_size;

        let minimum = need
            .checked_next_multiple_of(page)
            .and_then(|need| heap.checked_add(need))
            .filter(|&minimum| minimum <= self.config.max_size)
            .ok_or_else(|| self.out_of_memory(need))?;

        let target = (minimum / page)
            .checked_next_power_of_two()
            .and_then(|pages| pages.checked_mul(page))
            .filter(|&target| target <= self.config.max_size)
            .unwrap_or(minimum);

        let size = target - heap;
        let base = source
            .allocate(self.memory_type, size)
            .ok_or_else(|| self.out_of_memory(need))?;

        self.pages.push(Page {
            base,
            size,
            tlsf: SysTlsf::new(size),
            live: 0,
        });
        self.stats.heap_size = target;

        tracing::debug!(memory_type = %self.memory_type, heap_size = target, "heap grew");
        Ok(())
    }

    fn alloc(
        &mut self,
        size: u64,
        source: &dyn PageAllocator,
    ) -> Result<(u64, u64, SysTlsfRegion), HeapError> {
        // Terminates: every round grows the heap towards its maximum.
        loop {
            if let Some(found) = self.try_alloc(size) {
                return Ok(found);
            }
            self.grow(size, source)?;
        }
    }

    fn release(&mut self, page: u64, region: SysTlsfRegion) -> Result<(), HeapError> {
        let Some(page) = self.pages.iter_mut().find(|p| p.base == page) else {
            return Err(HeapError::UnknownBuffer {
                memory_type: self.memory_type,
                ptr: page,
            });
        };

        page.live -= 1;
        page.tlsf
            .dealloc(region)
            .map_err(|_| HeapError::UnknownBuffer {
                memory_type: self.memory_type,
                ptr: page.base,
            })
    }
}

/// [`CudaMemoryManager`] that suballocates pages from a [`PageAllocator`]
/// with a TLSF allocator per page.
///
/// Each memory type has its own heap behind its own lock. A heap only ever
/// grows; pages left empty by [`free`](CudaMemoryManager::free) are handed
/// back by an explicit [`shrink`](Self::shrink).
pub struct HeapMemoryManager {
    heaps: [Mutex<Heap>; 4],
    source: Arc<dyn PageAllocator>,
    errors: Arc<dyn ErrorCallback>,
}

impl HeapMemoryManager {
    /// Heaps over [`VirtualPageAllocator`] address ranges.
    pub fn new(config: &HeapConfig) -> Result<Self, HeapError> {
        Self::with_page_allocator(
            config,
            Arc::new(VirtualPageAllocator::default()),
            Arc::new(TracingErrorCallback),
        )
    }

    /// Reserves each heap's base size up front.
    pub fn with_page_allocator(
        config: &HeapConfig,
        source: Arc<dyn PageAllocator>,
        errors: Arc<dyn ErrorCallback>,
    ) -> Result<Self, HeapError> {
        let manager = Self {
            heaps: MemoryType::ALL.map(|ty| Mutex::new(Heap::new(ty, *config.get(ty)))),
            source,
            errors,
        };

        for memory_type in MemoryType::ALL {
            let mut heap = manager.heap(memory_type);
            let base = heap.config.base_size;
            if base > 0 {
                heap.grow(base, &*manager.source)?;
            }
        }

        Ok(manager)
    }

    fn heap(&self, memory_type: MemoryType) -> MutexGuard<'_, Heap> {
        self.heaps[memory_type as usize].lock()
    }

    fn fail<T>(&self, code: ErrorCode, err: HeapError) -> Result<T, HeapError> {
        report!(self.errors, code, "{err}");
        Err(err)
    }

    /// Returns empty pages to the page allocator. Returns the number of bytes
    /// released.
    pub fn shrink(&self, memory_type: MemoryType) -> u64 {
        let mut heap = self.heap(memory_type);

        let (empty, kept) = std::mem::take(&mut heap.pages)
            .into_iter()
            .partition::<Vec<_>, _>(|page| page.live == 0);
        heap.pages = kept;

        let released: u64 = empty.iter().map(|page| page.size).sum();
        heap.stats.heap_size -= released;
        drop(heap);

        for page in empty {
            self.source.deallocate(memory_type, page.base, page.size);
        }

        released
    }
}

impl CudaMemoryManager for HeapMemoryManager {
    fn alloc(&self, memory_type: MemoryType, size: u64, id: AllocId) -> Result<BufferPtr, HeapError> {
        if size == 0 {
            return self.fail(ErrorCode::InvalidParameter, HeapError::ZeroSize(memory_type));
        }

        let mut heap = self.heap(memory_type);
        let Some(capacity) = size.checked_next_multiple_of(GRANULARITY) else {
            let err = heap.out_of_memory(size);
            drop(heap);
            return self.fail(ErrorCode::OutOfMemory, err);
        };

        match heap.alloc(capacity, &*self.source) {
            Ok((ptr, page, region)) => {
                heap.allocations.insert(
                    ptr,
                    Allocation {
                        page,
                        region,
                        size,
                        capacity,
                        id,
                    },
                );
                heap.stats.allocated(id, size);
                Ok(BufferPtr(ptr))
            }
            Err(err) => {
                drop(heap);
                self.fail(ErrorCode::OutOfMemory, err)
            }
        }
    }

    fn free(&self, memory_type: MemoryType, ptr: BufferPtr) -> Result<(), HeapError> {
        if ptr.is_null() {
            return Ok(());
        }

        let mut heap = self.heap(memory_type);
        let Some(allocation) = heap.allocations.remove(&ptr.0) else {
            drop(heap);
            return self.fail(
                ErrorCode::InvalidParameter,
                HeapError::UnknownBuffer {
                    memory_type,
                    ptr: ptr.0,
                },
            );
        };

        heap.stats.freed(allocation.id, allocation.size);
        let result = heap.release(allocation.page, allocation.region);
        drop(heap);

        match result {
            Ok(()) => Ok(()),
            Err(err) => self.fail(ErrorCode::InternalError, err),
        }
    }

    fn realloc(&self, memory_type: MemoryType, ptr: BufferPtr, size: u64) -> Result<(), HeapError> {
        if size == 0 {
            return self.fail(ErrorCode::InvalidParameter, HeapError::ZeroSize(memory_type));
        }

        let err = {
            let mut guard = self.heap(memory_type);
            let heap = &mut *guard;

            match heap.allocations.get_mut(&ptr.0) {
                Some(allocation) if size > allocation.capacity => {
                    return Err(HeapError::WouldMove {
                        ptr: ptr.0,
                        size,
                        capacity: allocation.capacity,
                    });
                }
                Some(allocation) => {
                    heap.stats.resized(allocation.id, allocation.size, size);
                    allocation.size = size;
                    return Ok(());
                }
                None => HeapError::UnknownBuffer {
                    memory_type,
                    ptr: ptr.0,
                },
            }
        };

        self.fail(ErrorCode::InvalidParameter, err)
    }

    fn reserve(&self, memory_type: MemoryType, size: u64) -> Result<(), HeapError> {
        if size == 0 {
            return Ok(());
        }

        let mut heap = self.heap(memory_type);
        let result = size
            .checked_next_multiple_of(GRANULARITY)
            .ok_or_else(|| heap.out_of_memory(size))
            .and_then(|capacity| heap.alloc(capacity, &*self.source))
            .and_then(|(_, page, region)| heap.release(page, region));
        drop(heap);

        match result {
            Ok(()) => Ok(()),
            Err(err @ HeapError::OutOfMemory { .. }) => self.fail(ErrorCode::OutOfMemory, err),
            Err(err) => self.fail(ErrorCode::InternalError, err),
        }
    }

    fn stats(&self, memory_type: MemoryType) -> MemoryStats {
        self.heap(memory_type).stats
    }

    fn set_page_size(&self, memory_type: MemoryType, size: u64) -> Result<(), HeapError> {
        let mut heap = self.heap(memory_type);

        let err = if !size.is_power_of_two() || size < GRANULARITY {
            HeapError::InvalidPageSize(size)
        } else if !heap.pages.is_empty() {
            HeapError::HeapInUse(memory_type)
        } else {
            heap.config.page_size = size;
            return Ok(());
        };

        drop(heap);
        self.fail(ErrorCode::InvalidParameter, err)
    }

    fn set_max_memory_size(&self, memory_type: MemoryType, size: u64) -> Result<(), HeapError> {
        let mut heap = self.heap(memory_type);

        if size < heap.stats.heap_size {
            let err = HeapError::MaxBelowHeap {
                memory_type,
                requested: size,
                heap_size: heap.stats.heap_size,
            };
            drop(heap);
            return self.fail(ErrorCode::InvalidParameter, err);
        }

        heap.config.max_size = size;
        Ok(())
    }

    fn base_size(&self, memory_type: MemoryType) -> u64 {
        self.heap(memory_type).config.base_size
    }

    fn page_size(&self, memory_type: MemoryType) -> u64 {
        self.heap(memory_type).config.page_size
    }

    fn max_memory_size(&self, memory_type: MemoryType) -> u64 {
        self.heap(memory_type).config.max_size
    }
}

impl std::fmt::Debug for HeapMemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut list = f.debug_map();
        for memory_type in MemoryType::ALL {
            let heap = self.heap(memory_type);
            list.entry(&memory_type, &(heap.pages.len(), heap.stats.heap_size));
        }
        list.finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    use super::*;

    #[derive(Default)]
    struct Capture(Mutex<Vec<ErrorCode>>);

    impl ErrorCallback for Capture {
        fn report_error(&self, code: ErrorCode, _: &str, _: &str, _: u32) {
            self.0.lock().push(code);
        }
    }

    fn small() -> HeapConfig {
        let mut config = HeapConfig::default();
        for ty in MemoryType::ALL {
            *config.get_mut(ty) = HeapTypeConfig {
                base_size: 0,
                page_size: 1024,
                max_size: 16 * 1024,
            };
        }
        config
    }

    fn manager() -> (HeapMemoryManager, Arc<Capture>) {
        let errors = Arc::new(Capture::default());
        let manager = HeapMemoryManager::with_page_allocator(
            &small(),
            Arc::new(VirtualPageAllocator::default()),
            errors.clone(),
        )
        .unwrap();
        (manager, errors)
    }

    const DEVICE: MemoryType = MemoryType::DeviceMemory;

    #[test]
    fn test_alloc_is_aligned_and_counted() {
        let (heaps, _) = manager();

        let a = heaps.alloc(DEVICE, 100, AllocId::Scene).unwrap();
        let b = heaps.alloc(DEVICE, 100, AllocId::Scene).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_u64() % GRANULARITY, 0);
        assert_eq!(b.as_u64() % GRANULARITY, 0);

        let stats = heaps.stats(DEVICE);
        assert_eq!(stats.heap_size, 1024);
        assert_eq!(stats.total_allocated, 200);
        assert_eq!(stats.for_id(AllocId::Scene).elements, 2);
        assert_eq!(heaps.stats(MemoryType::Host).heap_size, 0);
    }

    #[test]
    fn test_heap_grows_in_power_of_two_pages() {
        let (heaps, _) = manager();

        let mut live = Vec::new();
        for _ in 0..12 {
            live.push(heaps.alloc(DEVICE, 300, AllocId::Particles).unwrap());

            let size = heaps.stats(DEVICE).heap_size;
            assert_eq!(size % 1024, 0);
            assert!((size / 1024).is_power_of_two(), "{size}");
            assert!(size <= 16 * 1024);
        }
    }

    #[test]
    fn test_out_of_memory_is_returned_and_reported() {
        let (heaps, errors) = manager();

        let err = heaps.alloc(DEVICE, 16 * 1024 + 1, AllocId::Cloth).unwrap_err();
        assert!(matches!(err, HeapError::OutOfMemory { requested, .. } if requested > 16 * 1024));
        assert_eq!(*errors.0.lock(), [ErrorCode::OutOfMemory]);
        assert_eq!(heaps.stats(DEVICE).total_allocated, 0);
    }

    #[test]
    fn test_free_does_not_shrink() {
        let (heaps, errors) = manager();

        let a = heaps.alloc(DEVICE, 512, AllocId::GpuUtil).unwrap();
        heaps.free(DEVICE, a).unwrap();
        assert_eq!(heaps.stats(DEVICE).heap_size, 1024);
        assert_eq!(heaps.stats(DEVICE).for_id(AllocId::GpuUtil).max_size, 512);

        assert!(matches!(
            heaps.free(DEVICE, a),
            Err(HeapError::UnknownBuffer { .. })
        ));
        heaps.free(DEVICE, BufferPtr::NULL).unwrap();
        assert_eq!(*errors.0.lock(), [ErrorCode::InvalidParameter]);

        assert_eq!(heaps.shrink(DEVICE), 1024);
        assert_eq!(heaps.stats(DEVICE).heap_size, 0);
    }

    #[test]
    fn test_shrink_keeps_pages_in_use() {
        let (heaps, _) = manager();

        let keep = heaps.alloc(DEVICE, 1000, AllocId::Scene).unwrap();
        let spill = heaps.alloc(DEVICE, 1000, AllocId::Scene).unwrap();
        let grown = heaps.stats(DEVICE).heap_size;
        heaps.free(DEVICE, spill).unwrap();

        let released = heaps.shrink(DEVICE);
        assert_eq!(heaps.stats(DEVICE).heap_size, grown - released);
        assert!(heaps.stats(DEVICE).heap_size > 0);
        heaps.free(DEVICE, keep).unwrap();
    }

    #[test]
    fn test_realloc_never_moves() {
        let (heaps, errors) = manager();

        let a = heaps.alloc(DEVICE, 200, AllocId::Unassigned).unwrap();
        heaps.realloc(DEVICE, a, 256).unwrap();
        heaps.realloc(DEVICE, a, 10).unwrap();
        assert_eq!(heaps.stats(DEVICE).total_allocated, 10);
        assert_eq!(heaps.stats(DEVICE).max_allocated, 256);

        let err = heaps.realloc(DEVICE, a, 257).unwrap_err();
        assert!(matches!(
            err,
            HeapError::WouldMove {
                size: 257,
                capacity: 256,
                ..
            }
        ));
        assert!(errors.0.lock().is_empty());
    }

    #[test]
    fn test_reserve_avoids_later_growth() {
        let (heaps, _) = manager();

        heaps.reserve(DEVICE, 3000).unwrap();
        let reserved = heaps.stats(DEVICE).heap_size;
        assert!(reserved >= 3072);
        assert_eq!(heaps.stats(DEVICE).total_allocated, 0);

        heaps.alloc(DEVICE, 3000, AllocId::Scene).unwrap();
        assert_eq!(heaps.stats(DEVICE).heap_size, reserved);
    }

    #[test]
    fn test_page_size_is_fixed_once_used() {
        let (heaps, errors) = manager();

        assert!(matches!(
            heaps.set_page_size(DEVICE, 1000),
            Err(HeapError::InvalidPageSize(1000))
        ));
        heaps.set_page_size(DEVICE, 4096).unwrap();
        assert_eq!(heaps.page_size(DEVICE), 4096);

        heaps.alloc(DEVICE, 1, AllocId::Scene).unwrap();
        assert_eq!(heaps.stats(DEVICE).heap_size, 4096);
        assert!(matches!(
            heaps.set_page_size(DEVICE, 2048),
            Err(HeapError::HeapInUse(DEVICE))
        ));
        assert_eq!(errors.0.lock().len(), 2);
    }

    #[test]
    fn test_max_size_can_not_drop_below_heap() {
        let (heaps, _) = manager();

        heaps.alloc(DEVICE, 2000, AllocId::Scene).unwrap();
        assert!(matches!(
            heaps.set_max_memory_size(DEVICE, 1024),
            Err(HeapError::MaxBelowHeap { .. })
        ));

        heaps.set_max_memory_size(DEVICE, 1 << 20).unwrap();
        assert_eq!(heaps.max_memory_size(DEVICE), 1 << 20);
    }

    #[test]
    fn test_base_size_is_reserved_up_front() {
        let mut config = small();
        config.host.base_size = 2048;

        let heaps = HeapMemoryManager::new(&config).unwrap();
        assert_eq!(heaps.base_size(MemoryType::Host), 2048);
        assert_eq!(heaps.stats(MemoryType::Host).heap_size, 2048);
        assert_eq!(heaps.stats(DEVICE).heap_size, 0);
    }

    #[test]
    fn test_exhausted_page_source() {
        struct Dry(AtomicBool);

        impl PageAllocator for Dry {
            fn allocate(&self, _: MemoryType, _: u64) -> Option<u64> {
                self.0.store(true, Ordering::SeqCst);
                None
            }
            fn deallocate(&self, _: MemoryType, _: u64, _: u64) {}
        }

        let source = Arc::new(Dry(AtomicBool::new(false)));
        let errors = Arc::new(Capture::default());
        let heaps =
            HeapMemoryManager::with_page_allocator(&small(), source.clone(), errors.clone())
                .unwrap();

        assert!(heaps.alloc(DEVICE, 64, AllocId::Scene).is_err());
        assert!(source.0.load(Ordering::SeqCst));
        assert_eq!(*errors.0.lock(), [ErrorCode::OutOfMemory]);
    }

    #[test]
    fn test_concurrent_alloc_and_free() {
        let (heaps, _) = manager();
        heaps.set_max_memory_size(DEVICE, 1 << 20).unwrap();

        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        let ptr = heaps.alloc(DEVICE, 512, AllocId::Particles).unwrap();
                        heaps.free(DEVICE, ptr).unwrap();
                    }
                });
            }
        });

        let stats = heaps.stats(DEVICE);
        assert_eq!(stats.total_allocated, 0);
        assert_eq!(stats.for_id(AllocId::Particles).elements, 0);
        assert!(stats.for_id(AllocId::Particles).max_elements <= 4);
    }
}
