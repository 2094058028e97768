//! Direct-access fast path for guest memory.
//!
//! When guest RAM is one contiguous host allocation, the engine can skip the
//! `MemoryBus` call for most accesses and read the allocation directly. A
//! configurable number of leading pages is guarded: accesses there (and
//! anything out of range) are refused by the map and routed through the bus,
//! so null-page dereferences still classify as memory aborts instead of
//! touching arbitrary host memory.

/// Guest page size, shared with the memory subsystem.
pub const PAGE_SIZE: usize = 0x1000;

/// Descriptor for direct access into a contiguous guest RAM allocation.
///
/// Every access is bounds-checked against the allocation length and the
/// guard-page count before the raw pointer is dereferenced.
pub struct DirectMap {
    base: *mut u8,
    len: usize,
}

// SAFETY: the map is only a pointer + length; the Cpu that owns it has
// exclusive use of it during an invocation, and the allocation it points to
// is required to outlive the map (see `new`).
unsafe impl Send for DirectMap {}

impl DirectMap {
    /// Wrap a contiguous host allocation backing the guest address space
    /// starting at guest address 0.
    ///
    /// # Safety
    /// `base` must point to a live allocation of at least `len` bytes that
    /// outlives the map and never moves while the map exists.
    pub unsafe fn new(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }

    /// Number of whole guest pages the allocation covers.
    pub fn page_capacity(&self) -> usize {
        self.len / PAGE_SIZE
    }

    /// Host offset for a `width`-byte access at `addr`, or `None` when the
    /// access must fall back to the bus (guarded page or out of range).
    #[inline(always)]
    fn offset(&self, addr: u32, width: usize, guard_pages: usize) -> Option<usize> {
        let off = addr as usize;
        if off < guard_pages * PAGE_SIZE || off + width > self.len {
            return None;
        }
        Some(off)
    }

    #[inline(always)]
    pub(crate) fn read8(&self, addr: u32, guard_pages: usize) -> Option<u8> {
        let off = self.offset(addr, 1, guard_pages)?;
        // SAFETY: bounds checked by offset().
        unsafe { Some(*self.base.add(off)) }
    }

    #[inline(always)]
    pub(crate) fn read16(&self, addr: u32, guard_pages: usize) -> Option<u16> {
        let off = self.offset(addr, 2, guard_pages)?;
        // SAFETY: bounds checked.
        unsafe { Some((self.base.add(off) as *const u16).read_unaligned().to_le()) }
    }

    #[inline(always)]
    pub(crate) fn read32(&self, addr: u32, guard_pages: usize) -> Option<u32> {
        let off = self.offset(addr, 4, guard_pages)?;
        // SAFETY: bounds checked.
        unsafe { Some((self.base.add(off) as *const u32).read_unaligned().to_le()) }
    }

    #[inline(always)]
    pub(crate) fn read64(&self, addr: u32, guard_pages: usize) -> Option<u64> {
        let off = self.offset(addr, 8, guard_pages)?;
        // SAFETY: bounds checked.
        unsafe { Some((self.base.add(off) as *const u64).read_unaligned().to_le()) }
    }

    #[inline(always)]
    pub(crate) fn write8(&self, addr: u32, val: u8, guard_pages: usize) -> bool {
        match self.offset(addr, 1, guard_pages) {
            // SAFETY: bounds checked.
            Some(off) => unsafe {
                *self.base.add(off) = val;
                true
            },
            None => false,
        }
    }

    #[inline(always)]
    pub(crate) fn write16(&self, addr: u32, val: u16, guard_pages: usize) -> bool {
        match self.offset(addr, 2, guard_pages) {
            // SAFETY: bounds checked.
            Some(off) => unsafe {
                (self.base.add(off) as *mut u16).write_unaligned(val.to_le());
                true
            },
            None => false,
        }
    }

    #[inline(always)]
    pub(crate) fn write32(&self, addr: u32, val: u32, guard_pages: usize) -> bool {
        match self.offset(addr, 4, guard_pages) {
            // SAFETY: bounds checked.
            Some(off) => unsafe {
                (self.base.add(off) as *mut u32).write_unaligned(val.to_le());
                true
            },
            None => false,
        }
    }

    #[inline(always)]
    pub(crate) fn write64(&self, addr: u32, val: u64, guard_pages: usize) -> bool {
        match self.offset(addr, 8, guard_pages) {
            // SAFETY: bounds checked.
            Some(off) => unsafe {
                (self.base.add(off) as *mut u64).write_unaligned(val.to_le());
                true
            },
            None => false,
        }
    }
}
