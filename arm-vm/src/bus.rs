//! Memory access bridge between the execution engine and guest memory.
//!
//! Every guest memory reference the engine issues goes through this trait
//! (unless the direct-access fast path applies, see `fastmem`). A fault is an
//! ordinary `Err` value describing an unmapped, protected or misaligned guest
//! address; implementations must never panic for guest-caused conditions.

use crate::ram::MemoryError;

/// Guest memory access interface.
///
/// All methods take `&self` so one memory image can be shared by several
/// engine instances; implementations use interior mutability for any mutable
/// state. The `Send + Sync` bounds keep that sharing thread-safe.
pub trait MemoryBus: Send + Sync {
    fn read8(&self, addr: u32) -> Result<u8, MemoryError>;
    fn read16(&self, addr: u32) -> Result<u16, MemoryError>;
    fn read32(&self, addr: u32) -> Result<u32, MemoryError>;
    fn read64(&self, addr: u32) -> Result<u64, MemoryError>;

    fn write8(&self, addr: u32, val: u8) -> Result<(), MemoryError>;
    fn write16(&self, addr: u32, val: u16) -> Result<(), MemoryError>;
    fn write32(&self, addr: u32, val: u32) -> Result<(), MemoryError>;
    fn write64(&self, addr: u32, val: u64) -> Result<(), MemoryError>;

    /// Instruction fetch.
    ///
    /// Returns `None` on any fault so the engine can stop with a prefetch
    /// abort before side effects, rather than reusing the data-fault path.
    fn read_code32(&self, addr: u32) -> Option<u32> {
        if addr % 4 != 0 {
            return None;
        }
        self.read32(addr).ok()
    }
}
