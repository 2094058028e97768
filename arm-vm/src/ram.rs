//! Guest RAM backing store.
//!
//! A single contiguous, zero-initialised allocation covering the guest
//! address space. Accesses below the configured null-segment boundary fault,
//! which is how null-pointer dereferences in the guest become observable
//! memory aborts instead of reads of real data.

use std::cell::UnsafeCell;

use thiserror::Error;

use crate::bus::MemoryBus;
use crate::fastmem::{DirectMap, PAGE_SIZE};

/// Guest-memory access errors.
///
/// These are normal, expected outcomes of running untrusted guest code; the
/// execution loop turns them into a `MemoryAbort` halt, never a host panic.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    #[error("unmapped guest address {0:#010x}")]
    Unmapped(u32),

    #[error("misaligned {1}-byte access at {0:#010x}")]
    Misaligned(u32, u32),
}

/// Contiguous guest RAM.
///
/// Uses UnsafeCell so the `MemoryBus` methods can take `&self`; the guest
/// memory model permits plain loads/stores without synchronization, and any
/// cross-thread code visibility is handled above this layer through cache
/// invalidation.
///
/// The first `null_pages` pages are reserved as a null segment: every access
/// there faults, matching the guarded leading entries of the direct-access
/// table.
pub struct GuestRam {
    size: usize,
    null_pages: usize,
    data: UnsafeCell<Vec<u8>>,
}

// SAFETY: plain loads/stores may race without tearing guarantees stronger
// than the guest architecture itself provides; atomicity above byte level is
// not part of this layer's contract.
unsafe impl Send for GuestRam {}
unsafe impl Sync for GuestRam {}

impl GuestRam {
    /// Create `size` bytes of zeroed guest RAM with `null_pages` leading
    /// guard pages that always fault.
    pub fn new(size: usize, null_pages: usize) -> Self {
        assert!(
            null_pages * PAGE_SIZE <= size,
            "null segment ({null_pages} pages) larger than guest RAM ({size} bytes)"
        );
        Self {
            size,
            null_pages,
            data: UnsafeCell::new(vec![0; size]),
        }
    }

    /// Size of the RAM in bytes.
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of leading guard pages.
    #[inline(always)]
    pub fn null_pages(&self) -> usize {
        self.null_pages
    }

    #[inline(always)]
    fn mem_ptr(&self) -> *mut u8 {
        // SAFETY: the Vec lives as long as the GuestRam and its buffer never
        // reallocates (fixed size after construction).
        unsafe { (*self.data.get()).as_mut_ptr() }
    }

    /// Bounds/guard check shared by every access width.
    #[inline(always)]
    fn offset(&self, addr: u32, width: u32) -> Result<usize, MemoryError> {
        let off = addr as usize;
        if off < self.null_pages * PAGE_SIZE || off + width as usize > self.size {
            return Err(MemoryError::Unmapped(addr));
        }
        if addr % width != 0 {
            return Err(MemoryError::Misaligned(addr, width));
        }
        Ok(off)
    }

    /// Build a direct-access descriptor over this RAM.
    ///
    /// # Safety
    /// The returned map holds a raw pointer into this RAM's buffer. The
    /// caller must ensure the `GuestRam` outlives every use of the map and
    /// that the map is only used while no conflicting `&mut` access exists.
    pub unsafe fn direct_map(&self) -> DirectMap {
        unsafe { DirectMap::new(self.mem_ptr(), self.size) }
    }

    /// Write an arbitrary slice into RAM starting at `addr`.
    ///
    /// Bypasses the null-segment guard; this is a loader-side operation, not
    /// a guest access.
    pub fn write_bytes(&self, addr: u32, data: &[u8]) -> Result<(), MemoryError> {
        let off = addr as usize;
        if off + data.len() > self.size {
            return Err(MemoryError::Unmapped(addr));
        }
        // SAFETY: bounds checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.mem_ptr().add(off), data.len());
        }
        Ok(())
    }

    /// Read a range of bytes (snapshots, debugging).
    pub fn read_range(&self, addr: u32, len: usize) -> Result<Vec<u8>, MemoryError> {
        let off = addr as usize;
        if off + len > self.size {
            return Err(MemoryError::Unmapped(addr));
        }
        // SAFETY: bounds checked above.
        unsafe {
            let mem = &*self.data.get();
            Ok(mem[off..off + len].to_vec())
        }
    }
}

impl MemoryBus for GuestRam {
    #[inline(always)]
    fn read8(&self, addr: u32) -> Result<u8, MemoryError> {
        let off = self.offset(addr, 1)?;
        // SAFETY: bounds checked by offset().
        unsafe { Ok(*self.mem_ptr().add(off)) }
    }

    #[inline(always)]
    fn read16(&self, addr: u32) -> Result<u16, MemoryError> {
        let off = self.offset(addr, 2)?;
        // SAFETY: bounds checked; unaligned read for host portability.
        unsafe { Ok((self.mem_ptr().add(off) as *const u16).read_unaligned().to_le()) }
    }

    #[inline(always)]
    fn read32(&self, addr: u32) -> Result<u32, MemoryError> {
        let off = self.offset(addr, 4)?;
        // SAFETY: bounds checked.
        unsafe { Ok((self.mem_ptr().add(off) as *const u32).read_unaligned().to_le()) }
    }

    #[inline(always)]
    fn read64(&self, addr: u32) -> Result<u64, MemoryError> {
        let off = self.offset(addr, 8)?;
        // SAFETY: bounds checked.
        unsafe { Ok((self.mem_ptr().add(off) as *const u64).read_unaligned().to_le()) }
    }

    #[inline(always)]
    fn write8(&self, addr: u32, val: u8) -> Result<(), MemoryError> {
        let off = self.offset(addr, 1)?;
        // SAFETY: bounds checked.
        unsafe { *self.mem_ptr().add(off) = val };
        Ok(())
    }

    #[inline(always)]
    fn write16(&self, addr: u32, val: u16) -> Result<(), MemoryError> {
        let off = self.offset(addr, 2)?;
        // SAFETY: bounds checked.
        unsafe { (self.mem_ptr().add(off) as *mut u16).write_unaligned(val.to_le()) };
        Ok(())
    }

    #[inline(always)]
    fn write32(&self, addr: u32, val: u32) -> Result<(), MemoryError> {
        let off = self.offset(addr, 4)?;
        // SAFETY: bounds checked.
        unsafe { (self.mem_ptr().add(off) as *mut u32).write_unaligned(val.to_le()) };
        Ok(())
    }

    #[inline(always)]
    fn write64(&self, addr: u32, val: u64) -> Result<(), MemoryError> {
        let off = self.offset(addr, 8)?;
        // SAFETY: bounds checked.
        unsafe { (self.mem_ptr().add(off) as *mut u64).write_unaligned(val.to_le()) };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_roundtrip() {
        let ram = GuestRam::new(0x4000, 1);
        ram.write32(0x1000, 0xdead_beef).unwrap();
        assert_eq!(ram.read32(0x1000).unwrap(), 0xdead_beef);
        ram.write8(0x1004, 0x7f).unwrap();
        assert_eq!(ram.read8(0x1004).unwrap(), 0x7f);
        ram.write64(0x1008, 0x0123_4567_89ab_cdef).unwrap();
        assert_eq!(ram.read64(0x1008).unwrap(), 0x0123_4567_89ab_cdef);
    }

    #[test]
    fn test_null_segment_faults() {
        let ram = GuestRam::new(0x4000, 1);
        assert_eq!(ram.read32(0x0), Err(MemoryError::Unmapped(0x0)));
        assert_eq!(ram.read8(0xfff), Err(MemoryError::Unmapped(0xfff)));
        assert_eq!(ram.write32(0x4, 1), Err(MemoryError::Unmapped(0x4)));
        // First page past the null segment is mapped.
        assert!(ram.read32(0x1000).is_ok());
    }

    #[test]
    fn test_out_of_bounds_faults() {
        let ram = GuestRam::new(0x2000, 1);
        assert_eq!(ram.read32(0x2000), Err(MemoryError::Unmapped(0x2000)));
        // Partially out of range also faults.
        assert_eq!(ram.read32(0x1ffe), Err(MemoryError::Unmapped(0x1ffe)));
    }

    #[test]
    fn test_misaligned_faults() {
        let ram = GuestRam::new(0x4000, 1);
        assert_eq!(ram.read32(0x1002), Err(MemoryError::Misaligned(0x1002, 4)));
        assert_eq!(ram.read16(0x1001), Err(MemoryError::Misaligned(0x1001, 2)));
    }

    #[test]
    fn test_write_bytes_bypasses_guard() {
        let ram = GuestRam::new(0x2000, 1);
        // Loader writes may target the null segment (e.g. vector table setup).
        ram.write_bytes(0x10, &[1, 2, 3, 4]).unwrap();
        assert_eq!(ram.read_range(0x10, 4).unwrap(), vec![1, 2, 3, 4]);
    }
}
