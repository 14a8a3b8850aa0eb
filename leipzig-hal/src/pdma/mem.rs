//! DMA capable memory for descriptor rings.
use core::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
};

use super::descr::Descriptor;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    #[error("not enough DMA memory for {0} descriptors")]
    OutOfMemory(usize),
    #[error("invalid descriptor ring capacity {0}")]
    InvalidCapacity(usize),
    #[error("descriptor memory is already in use")]
    InUse,
    #[error("descriptor memory at {0:#x} is not addressable by the DMA hardware")]
    NotAddressable(usize),
}

/// Translation of a CPU address into the 32-bit address seen by the DMA hardware.
pub type BusAddrFn = fn(addr: usize) -> Option<u32>;

/// Identity mapping. Addresses beyond the 32-bit bus are not addressable.
#[inline]
pub fn identity_bus_addr(addr: usize) -> Option<u32> {
    u32::try_from(addr).ok()
}

/// Contiguous block of descriptors which is visible to the DMA hardware.
#[derive(Debug)]
pub struct DescriptorRegion {
    ptr: NonNull<Descriptor>,
    len: usize,
    bus_addr: u32,
}

// Safety: The region is the only handle to its descriptors.
unsafe impl Send for DescriptorRegion {}

impl DescriptorRegion {
    /// # Safety
    ///
    /// `ptr` must point to `len` initialized descriptors which stay valid and are not accessed
    /// through any other handle until the region is returned with [DmaMemory::free].
    /// `bus_addr` must be the address of the first descriptor as seen by the DMA hardware.
    #[inline]
    pub const unsafe fn new(ptr: NonNull<Descriptor>, len: usize, bus_addr: u32) -> Self {
        Self { ptr, len, bus_addr }
    }

    #[inline]
    pub fn as_slice(&self) -> &[Descriptor] {
        // Safety: Guaranteed by the constructor contract.
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    pub fn as_ptr(&self) -> *const Descriptor {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn bus_addr(&self) -> u32 {
        self.bus_addr
    }

    /// Number of descriptor slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn size_in_bytes(&self) -> usize {
        self.len * core::mem::size_of::<Descriptor>()
    }
}

/// Allocator for descriptor rings.
///
/// # Safety
///
/// Regions returned by [Self::allocate] must satisfy the contract of [DescriptorRegion::new]
/// and must be suitable for DMA: either the memory is coherent with the DMA master, or
/// [Self::sync_for_device] makes CPU writes visible to it.
pub unsafe trait DmaMemory {
    fn allocate(&mut self, slots: usize) -> Result<DescriptorRegion, AllocError>;

    fn free(&mut self, region: DescriptorRegion);

    /// Make all CPU writes to the region visible to the DMA hardware.
    ///
    /// The default implementation does nothing, which is correct for coherent memory.
    fn sync_for_device(&mut self, _region: &DescriptorRegion) {}
}

/// Statically allocated descriptor memory for one ring.
///
/// The user should declare this structure inside uncached memory. It can be placed into memory
/// which is not zero-initialized.
pub struct DescriptorPool<const SLOTS: usize> {
    descriptors: UnsafeCell<MaybeUninit<[Descriptor; SLOTS]>>,
    taken: AtomicBool,
    bus_addr: BusAddrFn,
}

unsafe impl<const SLOTS: usize> Sync for DescriptorPool<SLOTS> {}

impl<const SLOTS: usize> DescriptorPool<SLOTS> {
    /// Pool which is addressed by the DMA hardware with its CPU address.
    #[inline]
    pub const fn new() -> Self {
        Self::with_bus_addr(identity_bus_addr)
    }

    #[inline]
    pub const fn with_bus_addr(bus_addr: BusAddrFn) -> Self {
        Self {
            descriptors: UnsafeCell::new(MaybeUninit::uninit()),
            taken: AtomicBool::new(false),
            bus_addr,
        }
    }

    #[inline]
    pub fn is_taken(&self) -> bool {
        self.taken.load(Ordering::Relaxed)
    }
}

impl<const SLOTS: usize> Default for DescriptorPool<SLOTS> {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl<const SLOTS: usize> DmaMemory for &'static DescriptorPool<SLOTS> {
    fn allocate(&mut self, slots: usize) -> Result<DescriptorRegion, AllocError> {
        if slots == 0 {
            return Err(AllocError::InvalidCapacity(slots));
        }
        if slots > SLOTS {
            return Err(AllocError::OutOfMemory(slots));
        }
        if self.taken.swap(true, Ordering::SeqCst) {
            return Err(AllocError::InUse);
        }
        let descr = unsafe { &mut *self.descriptors.get() };
        descr.write([const { Descriptor::new() }; SLOTS]);
        let ptr = NonNull::from(unsafe { descr.assume_init_mut() }).cast::<Descriptor>();
        let addr = ptr.as_ptr() as usize;
        let Some(bus_addr) = (self.bus_addr)(addr) else {
            self.taken.store(false, Ordering::SeqCst);
            return Err(AllocError::NotAddressable(addr));
        };
        Ok(unsafe { DescriptorRegion::new(ptr, slots, bus_addr) })
    }

    fn free(&mut self, region: DescriptorRegion) {
        if core::ptr::eq(region.as_ptr(), self.descriptors.get().cast::<Descriptor>()) {
            self.taken.store(false, Ordering::SeqCst);
        }
    }
}

/// Heap backed descriptor memory.
///
/// The heap must be placed in memory which is visible to the DMA hardware. For cached memory,
/// pass a cache clean function which is called with the start address and size of the ring
/// before the hardware is allowed to read it.
#[cfg(feature = "alloc")]
#[derive(Debug, Copy, Clone)]
pub struct HeapDmaMemory {
    clean_cache: Option<fn(addr: usize, len: usize)>,
    bus_addr: BusAddrFn,
}

#[cfg(feature = "alloc")]
impl Default for HeapDmaMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "alloc")]
impl HeapDmaMemory {
    /// Heap memory which is coherent with the DMA hardware.
    #[inline]
    pub const fn new() -> Self {
        Self {
            clean_cache: None,
            bus_addr: identity_bus_addr,
        }
    }

    #[inline]
    pub const fn with_cache_clean(clean_cache: fn(addr: usize, len: usize)) -> Self {
        Self {
            clean_cache: Some(clean_cache),
            bus_addr: identity_bus_addr,
        }
    }

    /// Use a custom CPU to bus address translation.
    #[inline]
    pub const fn with_bus_addr(mut self, bus_addr: BusAddrFn) -> Self {
        self.bus_addr = bus_addr;
        self
    }

    fn layout(slots: usize) -> Result<core::alloc::Layout, AllocError> {
        if slots == 0 {
            return Err(AllocError::InvalidCapacity(slots));
        }
        core::alloc::Layout::array::<Descriptor>(slots)
            .map_err(|_| AllocError::InvalidCapacity(slots))
    }
}

#[cfg(feature = "alloc")]
unsafe impl DmaMemory for HeapDmaMemory {
    fn allocate(&mut self, slots: usize) -> Result<DescriptorRegion, AllocError> {
        let layout = Self::layout(slots)?;
        // All-zero bytes are a valid, cleared descriptor.
        let raw = unsafe { alloc::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw.cast::<Descriptor>()).ok_or(AllocError::OutOfMemory(slots))?;
        let addr = ptr.as_ptr() as usize;
        let Some(bus_addr) = (self.bus_addr)(addr) else {
            unsafe { alloc::alloc::dealloc(raw, layout) };
            return Err(AllocError::NotAddressable(addr));
        };
        Ok(unsafe { DescriptorRegion::new(ptr, slots, bus_addr) })
    }

    fn free(&mut self, region: DescriptorRegion) {
        if let Ok(layout) = Self::layout(region.len()) {
            unsafe { alloc::alloc::dealloc(region.as_ptr() as *mut u8, layout) };
        }
    }

    fn sync_for_device(&mut self, region: &DescriptorRegion) {
        if let Some(clean_cache) = self.clean_cache {
            clean_cache(region.as_ptr() as usize, region.size_in_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn low_bits(addr: usize) -> Option<u32> {
        Some(addr as u32)
    }

    fn unreachable_bus(_addr: usize) -> Option<u32> {
        None
    }

    static POOL: DescriptorPool<8> = DescriptorPool::with_bus_addr(low_bits);

    #[test]
    fn bus_addr_translation() {
        assert_eq!(identity_bus_addr(0x3F00_0000), Some(0x3F00_0000));
        assert_eq!(identity_bus_addr(u32::MAX as usize), Some(u32::MAX));
        #[cfg(target_pointer_width = "64")]
        assert_eq!(identity_bus_addr(0x1_0000_0000), None);
    }

    #[test]
    fn unaddressable_pool_is_released() {
        static UNREACHABLE: DescriptorPool<4> = DescriptorPool::with_bus_addr(unreachable_bus);
        let mut pool = &UNREACHABLE;
        assert!(matches!(
            pool.allocate(4),
            Err(AllocError::NotAddressable(_))
        ));
        assert!(!UNREACHABLE.is_taken());
    }

    #[test]
    fn static_pool_single_use() {
        let mut pool = &POOL;
        assert_eq!(pool.allocate(9).unwrap_err(), AllocError::OutOfMemory(9));
        assert_eq!(pool.allocate(0).unwrap_err(), AllocError::InvalidCapacity(0));
        let region = pool.allocate(4).unwrap();
        assert_eq!(region.len(), 4);
        assert_eq!(region.size_in_bytes(), 32);
        assert!(region.as_slice().iter().all(|d| d.addr() == 0));
        assert!(POOL.is_taken());
        assert_eq!(pool.allocate(4).unwrap_err(), AllocError::InUse);
        pool.free(region);
        assert!(!POOL.is_taken());
        let region = pool.allocate(8).unwrap();
        pool.free(region);
    }

    #[cfg(feature = "alloc")]
    #[test]
    fn heap_memory() {
        use core::sync::atomic::AtomicUsize;
        static CLEANED: AtomicUsize = AtomicUsize::new(0);

        fn clean(_addr: usize, len: usize) {
            CLEANED.store(len, Ordering::SeqCst);
        }

        let mut mem = HeapDmaMemory::with_cache_clean(clean).with_bus_addr(low_bits);
        let region = mem.allocate(16).unwrap();
        assert!(
            region
                .as_slice()
                .iter()
                .all(|d| d.addr() == 0 && d.control().raw_value() == 0)
        );
        mem.sync_for_device(&region);
        assert_eq!(CLEANED.load(Ordering::SeqCst), 16 * 8);
        mem.free(region);
        assert_eq!(
            mem.allocate(0).unwrap_err(),
            AllocError::InvalidCapacity(0)
        );
        let mut unreachable = HeapDmaMemory::new().with_bus_addr(unreachable_bus);
        assert!(matches!(
            unreachable.allocate(4),
            Err(AllocError::NotAddressable(_))
        ));
    }
}
